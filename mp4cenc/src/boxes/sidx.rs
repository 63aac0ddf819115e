/*
    REFERENCES
    ----------

    1. ISO/IEC 14496-12:2022 section 8.16.3 (segment index box)

*/

use crate::{
    error::{Error, Result},
    reader::Reader,
};

#[derive(Debug, Clone, Copy)]
pub struct SidxReference {
    /// True when the reference points at another sidx box instead of
    /// media.
    pub references_index: bool,
    pub referenced_size: u32,
    pub subsegment_duration: u32,
    pub starts_with_sap: bool,
    pub sap_type: u8,
    pub sap_delta_time: u32,
}

/// Segment Index Box (sidx).
#[derive(Debug, Clone)]
pub struct SidxBox {
    pub reference_id: u32,
    pub timescale: u32,
    pub earliest_presentation_time: u64,
    pub first_offset: u64,
    pub references: Vec<SidxReference>,
}

impl SidxBox {
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut reader = Reader::new(data);
        let version = (reader.read_u32()? >> 24) as u8;
        let reference_id = reader.read_u32()?;
        let timescale = reader.read_u32()?;

        let (earliest_presentation_time, first_offset) = if version == 0 {
            (reader.read_u32()? as u64, reader.read_u32()? as u64)
        } else {
            (reader.read_u64()?, reader.read_u64()?)
        };

        reader.skip(2)?;
        let reference_count = reader.read_u16()? as usize;
        let mut references = Vec::with_capacity(reference_count.min(4096));

        for _ in 0..reference_count {
            let type_and_size = reader.read_u32()?;
            let subsegment_duration = reader.read_u32()?;
            let sap = reader.read_u32()?;

            references.push(SidxReference {
                references_index: type_and_size & 0x8000_0000 != 0,
                referenced_size: type_and_size & 0x7FFF_FFFF,
                subsegment_duration,
                starts_with_sap: sap & 0x8000_0000 != 0,
                sap_type: ((sap >> 28) & 0x07) as u8,
                sap_delta_time: sap & 0x0FFF_FFFF,
            });
        }

        Ok(Self {
            reference_id,
            timescale,
            earliest_presentation_time,
            first_offset,
            references,
        })
    }

    /// Shrink the referenced_size of reference `index` by `delta` bytes,
    /// in place, keeping the reference type bit.
    pub fn rewrite_referenced_size(data: &mut [u8], index: usize, delta: u64) -> Result<()> {
        let version = *data.first().ok_or_else(|| {
            Error::Malformed("sidx box shorter than its version field".to_owned())
        })?;

        let entries_start = if version == 0 { 24 } else { 32 };
        let position = entries_start + index * 12;
        if data.len() < position + 4 {
            return Err(Error::Malformed(format!(
                "sidx box has no reference {} to rewrite",
                index
            )));
        }

        let type_and_size = u32::from_be_bytes([
            data[position],
            data[position + 1],
            data[position + 2],
            data[position + 3],
        ]);
        let old_size = (type_and_size & 0x7FFF_FFFF) as u64;
        let new_size = old_size.checked_sub(delta).ok_or_else(|| {
            Error::Malformed(format!(
                "sidx reference {} is {} bytes, cannot shrink by {}",
                index, old_size, delta
            ))
        })?;

        let patched = (type_and_size & 0x8000_0000) | (new_size as u32 & 0x7FFF_FFFF);
        data[position..(position + 4)].copy_from_slice(&patched.to_be_bytes());
        Ok(())
    }
}
