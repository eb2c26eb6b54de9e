//! Packed BCD codec for 2-digit decimal fields.
//!
//! Several binary tracker protocols pack each pair of decimal digits into
//! one byte: `"12"` becomes `0x12`. Device serial numbers are sequences of
//! such bytes.

use crate::error::{GatewayError, Result};

/// Decode one packed byte to its decimal value: `0x12` -> `12`.
///
/// The nibbles are taken at face value; `0xA5` decodes to `10 * 10 + 5`.
#[inline]
pub fn decode_byte(b: u8) -> u8 {
    (b >> 4) * 10 + (b & 0x0F)
}

/// Encode a value `0..=99` into a packed byte: `12` -> `0x12`.
#[inline]
pub fn encode_byte(v: u8) -> u8 {
    debug_assert!(v < 100);
    ((v / 10) << 4) | (v % 10)
}

/// Pack a string of decimal digits two-at-a-time: `"805123"` -> `[0x80, 0x51, 0x23]`.
///
/// Odd-length or non-digit input is a caller bug on the command path and
/// reported as [`GatewayError::CommandInvalid`].
pub fn encode_digits(s: &str) -> Result<Vec<u8>> {
    if s.len() % 2 != 0 || !s.bytes().all(|b| b.is_ascii_digit()) {
        return Err(GatewayError::CommandInvalid(format!(
            "not an even run of decimal digits: {s:?}"
        )));
    }
    Ok(s.as_bytes()
        .chunks(2)
        .map(|pair| encode_byte((pair[0] - b'0') * 10 + (pair[1] - b'0')))
        .collect())
}

/// Unpack bytes into a string of decimal digits, two per byte.
pub fn decode_digits(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for &b in bytes {
        let v = decode_byte(b);
        out.push((b'0' + v / 10) as char);
        out.push((b'0' + v % 10) as char);
    }
    out
}
