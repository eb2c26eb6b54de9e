//! Geodetic collaborator seams.
//!
//! The coordinate datum transform and the cell-tower location service are
//! external collaborators; the gateway only depends on these seams. Vendor
//! handlers run the transform on every resolved GPS fix and fall back to
//! the cell locator for LBS-only reports.

use async_trait::async_trait;

/// Pure datum transform applied to every resolved (lat, lon) pair.
///
/// The production transform (WGS-84 to a local datum) plugs in here; the
/// default is the identity.
pub type CoordTransform = fn(f64, f64) -> (f64, f64);

/// The default no-op transform.
pub fn identity_transform(lat: f64, lon: f64) -> (f64, f64) {
    (lat, lon)
}

/// Cell-tower to position resolution.
#[async_trait]
pub trait CellLocator: Send + Sync {
    /// Resolve (mcc, mnc, lac, cell id) to formatted (lat, lon) strings.
    ///
    /// `None` when the cell is not known to the location service.
    async fn locate(&self, mcc: &str, mnc: &str, lac: &str, cid: &str)
        -> Option<(String, String)>;
}

/// Locator that knows no cells. Used when no LBS service is configured.
pub struct NullCellLocator;

#[async_trait]
impl CellLocator for NullCellLocator {
    async fn locate(&self, _: &str, _: &str, _: &str, _: &str) -> Option<(String, String)> {
        None
    }
}

/// Locator returning one fixed position for every cell. Test double.
pub struct FixedCellLocator {
    /// Latitude returned for every lookup.
    pub lat: String,
    /// Longitude returned for every lookup.
    pub lon: String,
}

#[async_trait]
impl CellLocator for FixedCellLocator {
    async fn locate(&self, _: &str, _: &str, _: &str, _: &str) -> Option<(String, String)> {
        Some((self.lat.clone(), self.lon.clone()))
    }
}
