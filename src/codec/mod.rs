//! Shared field codecs used by the vendor plugins.

pub mod bcd;
pub mod nmea;
pub mod timefmt;
