/*
    REFERENCES
    ----------

    1. ISO/IEC 14496-12:2022 section 8.8.8 (track fragment run box)

*/

use crate::{
    error::{Error, Result},
    reader::Reader,
};

#[derive(Debug, Clone, Copy, Default)]
pub struct TrunSample {
    pub duration: Option<u32>,
    pub size: Option<u32>,
    pub flags: Option<u32>,
    pub composition_time_offset: Option<i32>,
}

/// Track Fragment Run Box (trun).
#[derive(Debug, Clone)]
pub struct TrunBox {
    pub sample_count: u32,
    pub data_offset: Option<i32>,
    pub first_sample_flags: Option<u32>,
    pub samples: Vec<TrunSample>,
}

impl TrunBox {
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut reader = Reader::new(data);
        let version_and_flags = reader.read_u32()?;
        let version = (version_and_flags >> 24) as u8;
        let flags = version_and_flags & 0x00FF_FFFF;
        let sample_count = reader.read_u32()?;

        // "data_offset"
        let data_offset = if flags & 0x01 != 0 {
            Some(reader.read_i32()?)
        } else {
            None
        };

        // "first_sample_flags"
        let first_sample_flags = if flags & 0x04 != 0 {
            Some(reader.read_u32()?)
        } else {
            None
        };

        let mut samples = Vec::with_capacity((sample_count as usize).min(4096));

        for _ in 0..sample_count {
            let mut sample = TrunSample::default();

            // "sample_duration"
            if flags & 0x100 != 0 {
                sample.duration = Some(reader.read_u32()?);
            }

            // "sample_size"
            if flags & 0x200 != 0 {
                sample.size = Some(reader.read_u32()?);
            }

            // "sample_flags"
            if flags & 0x400 != 0 {
                sample.flags = Some(reader.read_u32()?);
            }

            // "sample_composition_time_offset", unsigned in version 0 and
            // signed from version 1 on.
            if flags & 0x800 != 0 {
                let offset = if version == 0 {
                    reader.read_u32()? as i32
                } else {
                    reader.read_i32()?
                };
                sample.composition_time_offset = Some(offset);
            }

            samples.push(sample);
        }

        Ok(Self {
            sample_count,
            data_offset,
            first_sample_flags,
            samples,
        })
    }

    /// Shift the data_offset field of a trun payload in place. Fails if
    /// the box does not carry one or the shifted value leaves i32 range.
    pub fn rewrite_data_offset(data: &mut [u8], delta: i64) -> Result<()> {
        let flags = {
            let mut reader = Reader::new(data);
            reader.read_u32()? & 0x00FF_FFFF
        };

        if flags & 0x01 == 0 || data.len() < 12 {
            return Err(Error::Malformed(
                "trun box carries no data_offset to rewrite".to_owned(),
            ));
        }

        let old = i32::from_be_bytes([data[8], data[9], data[10], data[11]]);
        let new = i32::try_from(old as i64 + delta).map_err(|_| {
            Error::Malformed("adjusted trun data_offset exceeds 32 bits".to_owned())
        })?;
        data[8..12].copy_from_slice(&new.to_be_bytes());
        Ok(())
    }
}
