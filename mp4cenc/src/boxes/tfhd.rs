use crate::{
    error::{Error, Result},
    reader::Reader,
};

/// Track Fragment Header Box (tfhd).
#[derive(Debug, Clone, Copy)]
pub struct TfhdBox {
    pub track_id: u32,
    pub base_data_offset: Option<u64>,
    pub sample_description_index: Option<u32>,
    pub default_sample_duration: Option<u32>,
    pub default_sample_size: Option<u32>,
    pub default_sample_flags: Option<u32>,
    pub default_base_is_moof: bool,
}

impl TfhdBox {
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut reader = Reader::new(data);
        let flags = reader.read_u32()? & 0x00FF_FFFF;
        let track_id = reader.read_u32()?;

        let base_data_offset = if flags & 0x01 != 0 {
            Some(reader.read_u64()?)
        } else {
            None
        };

        let sample_description_index = if flags & 0x02 != 0 {
            Some(reader.read_u32()?)
        } else {
            None
        };

        let default_sample_duration = if flags & 0x08 != 0 {
            Some(reader.read_u32()?)
        } else {
            None
        };

        let default_sample_size = if flags & 0x10 != 0 {
            Some(reader.read_u32()?)
        } else {
            None
        };

        let default_sample_flags = if flags & 0x20 != 0 {
            Some(reader.read_u32()?)
        } else {
            None
        };

        Ok(Self {
            track_id,
            base_data_offset,
            sample_description_index,
            default_sample_duration,
            default_sample_size,
            default_sample_flags,
            default_base_is_moof: flags & 0x020000 != 0,
        })
    }

    /// Rewrite the base_data_offset field of a tfhd payload in place.
    /// Fails if the box does not carry one.
    pub fn rewrite_base_data_offset(data: &mut [u8], new_offset: u64) -> Result<()> {
        let flags = {
            let mut reader = Reader::new(data);
            reader.read_u32()? & 0x00FF_FFFF
        };

        if flags & 0x01 == 0 || data.len() < 16 {
            return Err(Error::Malformed(
                "tfhd box carries no base_data_offset to rewrite".to_owned(),
            ));
        }

        data[8..16].copy_from_slice(&new_offset.to_be_bytes());
        Ok(())
    }
}
