//! Delimited-text tracker protocol: `*` sentences terminated by `#`.
//!
//! One TCP read may carry several sentences back to back
//! (`*...#*...#`); the frame is the whole chunk and sentences are split
//! inside `handle`. Fields are comma-delimited. The hardware identity is
//! the `WORLD` prefix plus the serial number in field 1.
//!
//! Two upstream subtypes, selected by the first character of field 2:
//! `V` is a GPS position report, `L` is a cell-tower (LBS) report. Every
//! handled sentence is answered, either with an encoded pending command or
//! with a plain time acknowledgement.

use std::sync::atomic::Ordering;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Local;

use crate::codec::{nmea, timefmt};
use crate::commands::{CommandStatus, CMD_KIND_REPORT_INTERVAL};
use crate::error::{GatewayError, Result};
use crate::protocol::{FrameOutcome, GatewayContext, InboundMessage, Protocol, ReplyHandle};
use crate::storage::EventRecord;

const START: u8 = b'*';
const END: u8 = b'#';
const IMEI_PREFIX: &str = "WORLD";

/// Field count of a `V` position sentence.
const POSITION_ARITY: usize = 14;
/// Field count of an `L` cell-report sentence.
const LBS_ARITY: usize = 10;

pub struct EworldProtocol;

#[async_trait]
impl Protocol for EworldProtocol {
    fn name(&self) -> &'static str {
        "eworld"
    }

    fn claim(&self, bytes: &[u8]) -> bool {
        bytes.first() == Some(&START)
    }

    fn frame(&self, bytes: &[u8]) -> FrameOutcome {
        // Sentences only ever arrive whole or truncated at the tail, so the
        // chunk is complete exactly when it ends on the terminator. Inner
        // terminators mean multiple sentences, consumed together.
        if bytes.last() == Some(&END) {
            FrameOutcome::Complete {
                consumed: bytes.len(),
            }
        } else {
            FrameOutcome::Incomplete
        }
    }

    async fn handle(
        &self,
        message: &InboundMessage,
        ctx: &GatewayContext,
    ) -> Result<Vec<EventRecord>> {
        let text = match std::str::from_utf8(&message.bytes) {
            Ok(t) => t,
            Err(_) => {
                ctx.stats.pkts_invalid.fetch_add(1, Ordering::Relaxed);
                tracing::error!(remote = %message.remote, "non-utf8 sentence chunk");
                return Ok(Vec::new());
            }
        };
        let inner = text
            .strip_prefix(START as char)
            .and_then(|t| t.strip_suffix(END as char))
            .unwrap_or_default();
        if inner.is_empty() {
            ctx.stats.pkts_invalid.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(remote = %message.remote, "empty sentence chunk, ignored");
            return Ok(Vec::new());
        }

        let mut records = Vec::new();
        for sentence in inner.split("#*") {
            let parts: Vec<&str> = sentence.split(',').collect();
            // Sentences are independent; a frame mixing devices must not
            // lose the rest because one imei is unregistered.
            match self.parse_sentence(&parts, message, ctx).await {
                Ok(Some(record)) => records.push(record),
                Ok(None) => {}
                Err(GatewayError::DeviceUnknown(imei)) => {
                    tracing::error!(remote = %message.remote, imei,
                        "sentence from unknown device, skipped");
                }
                Err(err) => return Err(err),
            }
        }
        Ok(records)
    }
}

impl EworldProtocol {
    async fn parse_sentence(
        &self,
        parts: &[&str],
        message: &InboundMessage,
        ctx: &GatewayContext,
    ) -> Result<Option<EventRecord>> {
        if parts.len() < 3 || parts[1].is_empty() || parts[2].is_empty() {
            ctx.stats.pkts_invalid.fetch_add(1, Ordering::Relaxed);
            tracing::error!(remote = %message.remote, ?parts, "malformed sentence");
            return Ok(None);
        }
        match parts[2].as_bytes()[0] {
            b'V' => self.parse_position(parts, message, ctx).await,
            b'L' => self.parse_cell_report(parts, message, ctx).await,
            other => {
                ctx.stats.pkts_invalid.fetch_add(1, Ordering::Relaxed);
                tracing::error!(remote = %message.remote, subtype = %(other as char),
                    "unknown sentence subtype");
                Ok(None)
            }
        }
    }

    /// `V` sentence: Vendor, SN, Version, Time(HHMMSS), Valid, Latitude,
    /// N/S, Longitude, E/W, Speed, Azimuth, Date(DDMMYY), Status, Power.
    async fn parse_position(
        &self,
        parts: &[&str],
        message: &InboundMessage,
        ctx: &GatewayContext,
    ) -> Result<Option<EventRecord>> {
        if parts.len() != POSITION_ARITY {
            ctx.stats.pkts_invalid.fetch_add(1, Ordering::Relaxed);
            tracing::error!(remote = %message.remote, arity = parts.len(), "bad position arity");
            return Ok(None);
        }
        let sn = parts[1];
        let device_id = dispatch_commands(sn, &message.reply, ctx).await?;

        let lat = nmea::parse_latitude(parts[5]).unwrap_or_else(|| {
            tracing::error!(field = parts[5], "unparsable latitude, using 0");
            0.0
        });
        let lon = nmea::parse_longitude(parts[7]).unwrap_or_else(|| {
            tracing::error!(field = parts[7], "unparsable longitude, using 0");
            0.0
        });
        let (lat, lon) = (ctx.transform)(lat, lon);

        // Date is DDMMYY on the wire; the timestamp codec wants YYMMDD.
        let (date, time) = (parts[11], parts[3]);
        let compact = if date.len() == 6 && time.len() == 6 {
            format!("{}{}{}{}", &date[4..6], &date[2..4], &date[0..2], time)
        } else {
            String::new()
        };

        let or_zero = |f: &str| if f.is_empty() { "0".to_string() } else { f.to_string() };
        Ok(Some(EventRecord {
            device_id,
            timestamp_ms: timefmt::parse_compact_utc(&compact),
            latitude: nmea::format_degrees(lat),
            longitude: nmea::format_degrees(lon),
            speed: or_zero(parts[9]),
            heading: or_zero(parts[10]),
        }))
    }

    /// `L` sentence: Vendor, SN, LBS, MCC, MNC, LAC, Cell, Unknown,
    /// Status, Power. Position comes from the cell locator; an unknown
    /// cell stores the `"0","0"` unresolved marker.
    async fn parse_cell_report(
        &self,
        parts: &[&str],
        message: &InboundMessage,
        ctx: &GatewayContext,
    ) -> Result<Option<EventRecord>> {
        if parts.len() != LBS_ARITY {
            ctx.stats.pkts_invalid.fetch_add(1, Ordering::Relaxed);
            tracing::error!(remote = %message.remote, arity = parts.len(), "bad cell-report arity");
            return Ok(None);
        }
        let sn = parts[1];
        let device_id = dispatch_commands(sn, &message.reply, ctx).await?;

        let (latitude, longitude) = ctx
            .cells
            .locate(parts[3], parts[4], parts[5], parts[6])
            .await
            .unwrap_or_else(|| ("0".to_string(), "0".to_string()));

        Ok(Some(EventRecord {
            device_id,
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
            latitude,
            longitude,
            speed: "0".to_string(),
            heading: "0".to_string(),
        }))
    }
}

/// Resolve the device, dispatch a pending REPINTV if one exists, and
/// answer with the time acknowledgement otherwise. Returns the internal
/// device id for the caller's record.
async fn dispatch_commands(sn: &str, reply: &ReplyHandle, ctx: &GatewayContext) -> Result<String> {
    let imei = format!("{IMEI_PREFIX}{sn}");
    let device_id = ctx.directory.resolve_id_by_imei(&imei).await?;

    let mut sent = false;
    if let Some(cmd) = ctx
        .commands
        .checkout(&device_id, CMD_KIND_REPORT_INTERVAL)
        .await?
    {
        match encode_report_interval(sn, &cmd.params) {
            Some(ack) => {
                tracing::info!(device_id, params = %cmd.params, "applying report-interval command");
                reply.send(ack).await?;
                ctx.commands.mark(&cmd, CommandStatus::Applied).await?;
                sent = true;
            }
            None => {
                tracing::error!(device_id, params = %cmd.params, "invalid report-interval params");
                ctx.commands.mark(&cmd, CommandStatus::Invalid).await?;
            }
        }
    }

    if !sent {
        let hhmmss = Local::now().format("%H%M%S").to_string();
        let ack = format!("*TH,{sn},I1,{hhmmss},0,0,6,XRDDCP#");
        reply.send(Bytes::from(ack)).await?;
    }
    Ok(device_id)
}

/// Encode a REPINTV command, params `"HHMM,interval"`.
///
/// The device wants the start time in UTC+8 and the interval zero-padded
/// to 4 digits; intervals run 0 to 1440 minutes. `None` means the params
/// failed validation.
fn encode_report_interval(sn: &str, params: &str) -> Option<Bytes> {
    let (hhmm, interval) = params.split_once(',')?;
    // Digit check before slicing: byte indexing into operator-supplied
    // params must not hit a UTF-8 char boundary.
    if hhmm.len() != 4 || !hhmm.bytes().all(|b| b.is_ascii_digit()) || interval.is_empty() {
        return None;
    }
    let h: u32 = hhmm[..2].parse().ok().filter(|h| *h <= 24)?;
    let h = (h + 8) % 24;
    let m: u32 = hhmm[2..].parse().ok().filter(|m| *m <= 59)?;
    let interval: u32 = interval.parse().ok().filter(|i| *i <= 1440)?;
    let cfg = format!("{h:02}{m:02}{interval:04}");
    Some(Bytes::from(format!("*TH,{sn},I2,050400,0,0,14,XRDDCS{cfg}#")))
}
