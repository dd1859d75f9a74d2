//! Companion decoder for the archive side.
//!
//! Takes an already-decompressed block (see [`super::decompress`]).

use super::{
    CodecError, CO2_SCALE, COORD_SCALE, FORMAT_VERSION, HUMIDITY_SCALE, MAGIC, PRESSURE_SCALE,
    RECORD_SIZE, TEMPERATURE_SCALE,
};
use crate::types::{LowResSample, SiteMetadata};

/// A decoded low-res payload.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedBatch {
    pub version: u8,
    pub site: SiteMetadata,
    pub records: Vec<LowResSample>,
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        let end = self.pos.checked_add(n).filter(|&e| e <= self.buf.len()).ok_or(
            CodecError::Truncated {
                offset: self.pos,
                needed: n,
            },
        )?;
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], CodecError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.take(1)?[0])
    }

    fn short_str(&mut self, field: &'static str) -> Result<String, CodecError> {
        let len = self.u8()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| CodecError::InvalidText(field))
    }
}

/// Decode an uncompressed block produced by [`super::encode_block`].
pub fn decode(block: &[u8]) -> Result<DecodedBatch, CodecError> {
    let mut r = Reader { buf: block, pos: 0 };

    if r.take(MAGIC.len())? != MAGIC {
        return Err(CodecError::BadMagic);
    }
    let version = r.u8()?;
    if version != FORMAT_VERSION {
        return Err(CodecError::UnsupportedVersion(version));
    }

    let site_name = r.short_str("site_name")?;
    let serial_id = r.short_str("serial_id")?;
    let latitude = f64::from(i32::from_le_bytes(r.array()?)) / COORD_SCALE;
    let longitude = f64::from(i32::from_le_bytes(r.array()?)) / COORD_SCALE;
    let count = u32::from_le_bytes(r.array()?) as usize;

    // Reject a lying count before allocating for it.
    let remaining = block.len() - r.pos;
    if remaining < count.saturating_mul(RECORD_SIZE) {
        return Err(CodecError::Truncated {
            offset: r.pos,
            needed: count.saturating_mul(RECORD_SIZE),
        });
    }

    let mut records = Vec::with_capacity(count);
    for _ in 0..count {
        records.push(LowResSample {
            timestamp: i64::from(u32::from_le_bytes(r.array()?)),
            co2_ppm: f64::from(u16::from_le_bytes(r.array()?)) / CO2_SCALE,
            pressure_hpa: f64::from(u16::from_le_bytes(r.array()?)) / PRESSURE_SCALE,
            temperature_c: f64::from(i16::from_le_bytes(r.array()?)) / TEMPERATURE_SCALE,
            relative_humidity: f64::from(u16::from_le_bytes(r.array()?)) / HUMIDITY_SCALE,
            ir: f64::from(u32::from_le_bytes(r.array()?)),
            aux_status: r.u8()?,
        });
    }

    Ok(DecodedBatch {
        version,
        site: SiteMetadata {
            site_name,
            serial_id,
            latitude,
            longitude,
        },
        records,
    })
}
