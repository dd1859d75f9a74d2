//! Low-res packet codec: fixed-width binary batches, zstd-compressed
//!
//! ## Wire format (version 1, little-endian)
//!
//! ```text
//! header:
//!   magic        4 bytes  "FNLR"
//!   version      u8
//!   site_len     u8, site_name bytes (UTF-8)
//!   serial_len   u8, serial_id bytes (UTF-8)
//!   latitude     i32  micro-degrees
//!   longitude    i32  micro-degrees
//!   count        u32  number of records
//! record (17 bytes):
//!   timestamp    u32  seconds since epoch
//!   co2          u16  0.1 ppm
//!   pressure     u16  0.1 hPa
//!   temperature  i16  0.01 °C
//!   humidity     u16  0.01 %RH
//!   ir           u32  counts
//!   aux          u8   status bits
//! ```
//!
//! Out-of-range values saturate to the field bounds. The whole block is then
//! compressed with zstd; the archive server decompresses and runs [`decode`].

mod decode;

pub use decode::{decode, DecodedBatch};

use crate::config::defaults::ZSTD_LEVEL;
use crate::types::{LowResSample, SiteMetadata};

/// Leading bytes of every payload.
pub const MAGIC: &[u8; 4] = b"FNLR";

/// Current format version.
pub const FORMAT_VERSION: u8 = 1;

/// Encoded size of one record.
pub const RECORD_SIZE: usize = 17;

pub(crate) const CO2_SCALE: f64 = 10.0;
pub(crate) const PRESSURE_SCALE: f64 = 10.0;
pub(crate) const TEMPERATURE_SCALE: f64 = 100.0;
pub(crate) const HUMIDITY_SCALE: f64 = 100.0;
pub(crate) const COORD_SCALE: f64 = 1_000_000.0;

/// Codec errors
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("compression error: {0}")]
    Compression(#[source] std::io::Error),
    #[error("payload truncated: needed {needed} bytes at offset {offset}")]
    Truncated { offset: usize, needed: usize },
    #[error("bad magic bytes")]
    BadMagic,
    #[error("unsupported format version {0}")]
    UnsupportedVersion(u8),
    #[error("invalid UTF-8 in {0}")]
    InvalidText(&'static str),
}

/// Encodes low-res batches and compresses them for transmission.
#[derive(Debug, Clone, Copy)]
pub struct PacketCodec {
    level: i32,
}

impl Default for PacketCodec {
    fn default() -> Self {
        Self { level: ZSTD_LEVEL }
    }
}

impl PacketCodec {
    /// Encode `batch` with the `site` header and compress the result.
    pub fn encode(&self, batch: &[LowResSample], site: &SiteMetadata) -> Result<Vec<u8>, CodecError> {
        compress(&encode_block(batch, site), self.level)
    }
}

/// Serialize a batch to the uncompressed fixed-width block.
pub fn encode_block(batch: &[LowResSample], site: &SiteMetadata) -> Vec<u8> {
    let mut out = Vec::with_capacity(64 + batch.len() * RECORD_SIZE);

    out.extend_from_slice(MAGIC);
    out.push(FORMAT_VERSION);
    push_short_str(&mut out, &site.site_name);
    push_short_str(&mut out, &site.serial_id);
    out.extend_from_slice(&quantize_i32(site.latitude, COORD_SCALE).to_le_bytes());
    out.extend_from_slice(&quantize_i32(site.longitude, COORD_SCALE).to_le_bytes());
    let count = u32::try_from(batch.len()).unwrap_or(u32::MAX);
    out.extend_from_slice(&count.to_le_bytes());

    for s in batch.iter().take(count as usize) {
        let ts = u32::try_from(s.timestamp.max(0)).unwrap_or(u32::MAX);
        out.extend_from_slice(&ts.to_le_bytes());
        out.extend_from_slice(&quantize_u16(s.co2_ppm, CO2_SCALE).to_le_bytes());
        out.extend_from_slice(&quantize_u16(s.pressure_hpa, PRESSURE_SCALE).to_le_bytes());
        out.extend_from_slice(&quantize_i16(s.temperature_c, TEMPERATURE_SCALE).to_le_bytes());
        out.extend_from_slice(&quantize_u16(s.relative_humidity, HUMIDITY_SCALE).to_le_bytes());
        out.extend_from_slice(&quantize_u32(s.ir).to_le_bytes());
        out.push(s.aux_status);
    }

    out
}

/// zstd-compress an encoded block.
pub fn compress(block: &[u8], level: i32) -> Result<Vec<u8>, CodecError> {
    zstd::encode_all(block, level).map_err(CodecError::Compression)
}

/// Inverse of [`compress`].
pub fn decompress(payload: &[u8]) -> Result<Vec<u8>, CodecError> {
    zstd::decode_all(payload).map_err(CodecError::Compression)
}

/// Length-prefixed string, cut at a char boundary to fit 255 bytes.
fn push_short_str(out: &mut Vec<u8>, s: &str) {
    let mut end = s.len().min(u8::MAX as usize);
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    out.push(end as u8);
    out.extend_from_slice(&s.as_bytes()[..end]);
}

// `as` casts from f64 saturate and map NaN to 0.

fn quantize_u16(value: f64, scale: f64) -> u16 {
    (value * scale).round() as u16
}

fn quantize_i16(value: f64, scale: f64) -> i16 {
    (value * scale).round() as i16
}

fn quantize_u32(value: f64) -> u32 {
    value.round() as u32
}

fn quantize_i32(value: f64, scale: f64) -> i32 {
    (value * scale).round() as i32
}

#[cfg(test)]
mod tests {
    use super::*;

    fn site() -> SiteMetadata {
        SiteMetadata {
            site_name: "RIDGE".to_string(),
            serial_id: "00042".to_string(),
            latitude: 45.501_689,
            longitude: -73.567_256,
        }
    }

    fn sample(i: i64) -> LowResSample {
        LowResSample {
            timestamp: 1_710_000_000 + i * 60,
            co2_ppm: 415.37 + i as f64,
            pressure_hpa: 1013.25 - i as f64 * 0.1,
            temperature_c: -12.345 + i as f64 * 0.5,
            relative_humidity: 55.555,
            ir: 123_456.6,
            aux_status: (i % 4) as u8,
        }
    }

    #[test]
    fn test_empty_batch_is_header_only() {
        let block = encode_block(&[], &site());
        // magic + version + (1+5) + (1+5) + lat + lon + count
        assert_eq!(block.len(), 4 + 1 + 6 + 6 + 4 + 4 + 4);

        let decoded = decode(&block).unwrap();
        assert_eq!(decoded.version, FORMAT_VERSION);
        assert!(decoded.records.is_empty());
        assert_eq!(decoded.site.site_name, "RIDGE");
    }

    #[test]
    fn test_record_size_is_fixed() {
        let one = encode_block(&[sample(0)], &site());
        let three = encode_block(&[sample(0), sample(1), sample(2)], &site());
        assert_eq!(three.len() - one.len(), 2 * RECORD_SIZE);
    }

    #[test]
    fn test_compressed_roundtrip_within_tolerance() {
        let batch: Vec<_> = (0..30).map(sample).collect();
        let payload = PacketCodec::default().encode(&batch, &site()).unwrap();
        let decoded = decode(&decompress(&payload).unwrap()).unwrap();

        assert_eq!(decoded.records.len(), batch.len());
        assert!((decoded.site.latitude - 45.501_689).abs() < 1e-6);
        assert!((decoded.site.longitude + 73.567_256).abs() < 1e-6);
        for (orig, got) in batch.iter().zip(&decoded.records) {
            assert_eq!(got.timestamp, orig.timestamp);
            assert!((got.co2_ppm - orig.co2_ppm).abs() <= 0.05 + 1e-9);
            assert!((got.pressure_hpa - orig.pressure_hpa).abs() <= 0.05 + 1e-9);
            assert!((got.temperature_c - orig.temperature_c).abs() <= 0.005 + 1e-9);
            assert!((got.relative_humidity - orig.relative_humidity).abs() <= 0.005 + 1e-9);
            assert!((got.ir - orig.ir).abs() <= 0.5);
            assert_eq!(got.aux_status, orig.aux_status);
        }
    }

    #[test]
    fn test_out_of_range_values_saturate() {
        let mut s = sample(0);
        s.co2_ppm = 1.0e9;
        s.temperature_c = -1.0e9;
        s.relative_humidity = f64::NAN;
        s.timestamp = -5;

        let decoded = decode(&encode_block(&[s], &site())).unwrap();
        let r = &decoded.records[0];
        assert_eq!(r.co2_ppm, f64::from(u16::MAX) / CO2_SCALE);
        assert_eq!(r.temperature_c, f64::from(i16::MIN) / TEMPERATURE_SCALE);
        assert_eq!(r.relative_humidity, 0.0);
        assert_eq!(r.timestamp, 0);
    }

    #[test]
    fn test_long_site_name_truncated_on_char_boundary() {
        let mut s = site();
        s.site_name = "é".repeat(200); // 400 bytes
        let decoded = decode(&encode_block(&[], &s)).unwrap();
        assert_eq!(decoded.site.site_name.len(), 254);
        assert!(decoded.site.site_name.chars().all(|c| c == 'é'));
    }
}
