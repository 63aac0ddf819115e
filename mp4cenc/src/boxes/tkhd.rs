use crate::{error::Result, reader::Reader};

/// Track Header Box (tkhd). Only the track id is of interest here.
#[derive(Debug, Clone, Copy)]
pub struct TkhdBox {
    pub track_id: u32,
}

impl TkhdBox {
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut reader = Reader::new(data);
        let version = (reader.read_u32()? >> 24) as u8;

        // "creation_time" and "modification_time"
        if version == 1 {
            reader.skip(16)?;
        } else {
            reader.skip(8)?;
        }

        Ok(Self {
            track_id: reader.read_u32()?,
        })
    }
}
