//! Vendor protocol plugins.
//!
//! Each submodule implements [`crate::protocol::Protocol`] for one wire
//! format. Registration order matters when prefixes are ambiguous; see
//! [`crate::protocol::ProtocolRegistry`].

pub mod atr805;
pub mod eworld;

pub use atr805::Atr805Protocol;
pub use eworld::EworldProtocol;
