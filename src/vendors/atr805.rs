//! Binary tracker protocol: `0x92 0x29` length-prefixed frames.
//!
//! Layout: 2-byte identifier, packet type, 2-byte big-endian payload
//! length, payload, `0x0D` terminator (counted inside the declared
//! length). BCD-packed numeric fields throughout. The hardware identity
//! is `ATR` plus the uppercase hex of the 6 serial-number bytes.
//!
//! Upstream packet `0x80` carries a GPS fix, `0x86` a list of observed
//! cells; anything else is confirmed and otherwise ignored. Every packet
//! is answered with a confirm frame after any pending command bytes.

use std::sync::atomic::Ordering;

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};

use crate::codec::{bcd, timefmt};
use crate::commands::{CommandStatus, CMD_KIND_REPORT_INTERVAL};
use crate::error::Result;
use crate::protocol::{FrameOutcome, GatewayContext, InboundMessage, Protocol, ReplyHandle};
use crate::storage::EventRecord;

const HEADER: [u8; 2] = [0x92, 0x29];
const TERMINATOR: u8 = 0x0D;

const PACKET_UP_GPS: u8 = 0x80;
const PACKET_UP_LBS: u8 = 0x86;
const PACKET_DOWN_CONFIRM: u8 = 0x21;
const PACKET_DOWN_MODE: u8 = 0x7F;

/// Shortest well-formed packet on this wire.
const MINIMUM_LEN: usize = 15;

/// Byte offset where the GPS packet's BCD timestamp starts.
const GPS_TIME_OFFSET: usize = 0x16;
/// Total length a GPS packet must reach to cover all fixed fields.
const GPS_PACKET_LEN: usize = 0x1c;

/// Per-cell record width in an LBS packet.
const CELL_WIDTH: usize = 11;
const CELL_BASE: usize = 0x0c;

pub struct Atr805Protocol;

#[async_trait]
impl Protocol for Atr805Protocol {
    fn name(&self) -> &'static str {
        "atr805"
    }

    fn claim(&self, bytes: &[u8]) -> bool {
        bytes.len() >= MINIMUM_LEN && bytes[..2] == HEADER
    }

    // The frame terminator is 0x0D; trailing CR bytes are data.
    fn strips_line_endings(&self) -> bool {
        false
    }

    fn frame(&self, bytes: &[u8]) -> FrameOutcome {
        if bytes.len() < 5 {
            return FrameOutcome::Incomplete;
        }
        let declared = u16::from_be_bytes([bytes[3], bytes[4]]) as usize;
        let total = 5 + declared;
        if bytes.len() < total {
            return FrameOutcome::Incomplete;
        }
        if bytes[total - 1] == TERMINATOR {
            FrameOutcome::Complete { consumed: total }
        } else {
            FrameOutcome::Invalid(format!(
                "declared length {declared} not closed by terminator (buffered {})",
                bytes.len()
            ))
        }
    }

    async fn handle(
        &self,
        message: &InboundMessage,
        ctx: &GatewayContext,
    ) -> Result<Vec<EventRecord>> {
        let b = &message.bytes;
        if b.len() < MINIMUM_LEN {
            ctx.stats.pkts_invalid.fetch_add(1, Ordering::Relaxed);
            tracing::error!(remote = %message.remote, len = b.len(), "runt packet");
            return Ok(Vec::new());
        }
        let sn = &b[5..11];
        let imei = format!("ATR{}", hex::encode_upper(sn));
        let device_id = ctx.directory.resolve_id_by_imei(&imei).await?;

        dispatch_commands(sn, b[2], &device_id, &message.reply, ctx).await?;

        match b[2] {
            PACKET_UP_GPS => self.parse_gps(b, &device_id, message, ctx),
            PACKET_UP_LBS => Ok(self.parse_cells(b, &device_id, ctx).await),
            other => {
                tracing::debug!(device_id, packet_type = format!("{other:#04x}"),
                    "non-report packet, confirmed only");
                Ok(Vec::new())
            }
        }
    }
}

impl Atr805Protocol {
    /// Packet `0x80`: BCD degrees/minutes position plus a BCD
    /// `YYMMDDHHMMSS` timestamp.
    fn parse_gps(
        &self,
        b: &[u8],
        device_id: &str,
        message: &InboundMessage,
        ctx: &GatewayContext,
    ) -> Result<Vec<EventRecord>> {
        if b.len() < GPS_PACKET_LEN {
            ctx.stats.pkts_invalid.fetch_add(1, Ordering::Relaxed);
            tracing::error!(remote = %message.remote, len = b.len(), "short GPS packet");
            return Ok(Vec::new());
        }
        let d = |i: usize| bcd::decode_byte(b[i]) as f64;
        let lat = d(0x0b) + (d(0x0c) + d(0x0d) / 100.0 + d(0x0e) / 10000.0) / 60.0;
        let lon = d(0x10) * 100.0 + d(0x11) + (d(0x12) + d(0x13) / 100.0 + d(0x14) / 10000.0) / 60.0;
        let (lat, lon) = (ctx.transform)(lat, lon);

        let digits = bcd::decode_digits(&b[GPS_TIME_OFFSET..GPS_TIME_OFFSET + 6]);
        Ok(vec![EventRecord {
            device_id: device_id.to_string(),
            timestamp_ms: timefmt::parse_compact_utc(&digits),
            latitude: format!("{lat:.4}"),
            longitude: format!("{lon:.4}"),
            speed: "0".to_string(),
            heading: "0".to_string(),
        }])
    }

    /// Packet `0x86`: observed cell list. The first cell the locator can
    /// resolve wins; an unresolvable list produces no record.
    async fn parse_cells(&self, b: &[u8], device_id: &str, ctx: &GatewayContext) -> Vec<EventRecord> {
        if b.len() <= CELL_BASE {
            return Vec::new();
        }
        let numcells = b[0x0b] as usize;
        let d = |i: usize| bcd::decode_byte(b[i]) as u32;
        for i in 0..numcells {
            let o = CELL_BASE + i * CELL_WIDTH;
            if o + CELL_WIDTH > b.len() {
                break;
            }
            let mcc = (d(o) * 100 + d(o + 1)).to_string();
            let mnc = d(o + 2).to_string();
            let lac = (d(o + 3) * 10000 + d(o + 4) * 100 + d(o + 5)).to_string();
            let cid = (d(o + 6) * 10000 + d(o + 7) * 100 + d(o + 8)).to_string();
            if let Some((lat, lon)) = ctx.cells.locate(&mcc, &mnc, &lac, &cid).await {
                if lat != "0" {
                    return vec![EventRecord {
                        device_id: device_id.to_string(),
                        timestamp_ms: chrono::Utc::now().timestamp_millis(),
                        latitude: lat,
                        longitude: lon,
                        speed: "0".to_string(),
                        heading: "0".to_string(),
                    }];
                }
            }
        }
        Vec::new()
    }
}

/// Dispatch any pending commands for the device, then the confirm frame
/// that acknowledges the packet itself.
async fn dispatch_commands(
    sn: &[u8],
    packet_type: u8,
    device_id: &str,
    reply: &ReplyHandle,
    ctx: &GatewayContext,
) -> Result<()> {
    for cached in ctx.commands.commands_for(device_id) {
        if cached.status != CommandStatus::Pending || cached.kind != CMD_KIND_REPORT_INTERVAL {
            continue;
        }
        if let Some(cmd) = ctx.commands.checkout(device_id, &cached.kind).await? {
            match encode_report_interval(sn, &cmd.params) {
                Some(frame) => {
                    tracing::info!(device_id, params = %cmd.params,
                        "applying report-interval command");
                    reply.send(frame).await?;
                    ctx.commands.mark(&cmd, CommandStatus::Applied).await?;
                }
                None => {
                    tracing::error!(device_id, params = %cmd.params,
                        "invalid report-interval params");
                    ctx.commands.mark(&cmd, CommandStatus::Invalid).await?;
                }
            }
        }
    }
    reply.send(confirm_frame(sn, packet_type)).await?;
    Ok(())
}

/// Confirm frame echoing the packet type being acknowledged.
fn confirm_frame(sn: &[u8], packet_type: u8) -> Bytes {
    let mut out = BytesMut::with_capacity(15);
    out.put_slice(&HEADER);
    out.put_u8(PACKET_DOWN_CONFIRM);
    out.put_slice(&[0x00, 0x0A]);
    out.put_slice(sn);
    out.put_slice(&[packet_type, 0xFF, 0xFF, TERMINATOR]);
    out.freeze()
}

/// Encode a REPINTV command, params `"HHMM,interval"`. The interval is
/// sent twice as a big-endian u32; the declared length of `0x1D` is what
/// the devices were shipped expecting and does not match the actual
/// payload, so it is kept as-is.
fn encode_report_interval(sn: &[u8], params: &str) -> Option<Bytes> {
    let (hhmm, interval) = params.split_once(',')?;
    if hhmm.len() != 4 || interval.is_empty() {
        return None;
    }
    let interval: u32 = interval.parse().ok()?;
    let mut out = BytesMut::with_capacity(23);
    out.put_slice(&HEADER);
    out.put_u8(PACKET_DOWN_MODE);
    out.put_slice(&[0x00, 0x1D]);
    out.put_slice(sn);
    out.put_slice(&[0x01, 0x0A]);
    out.put_u32(interval);
    out.put_u32(interval);
    out.put_slice(&[0xFF, TERMINATOR]);
    Some(out.freeze())
}
