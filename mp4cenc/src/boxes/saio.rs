use crate::{atom::FourCc, error::Result, reader::Reader};

/// Sample Auxiliary Information Offsets Box (saio). Locates the
/// auxiliary records described by the matching saiz box: either one
/// offset for a single contiguous block, or one offset per chunk or
/// track run.
#[derive(Debug, Clone)]
pub struct SaioBox {
    pub aux_info_type: Option<(FourCc, u32)>,
    pub offsets: Vec<u64>,
}

impl SaioBox {
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut reader = Reader::new(data);
        let version_and_flags = reader.read_u32()?;
        let version = (version_and_flags >> 24) as u8;
        let flags = version_and_flags & 0x00FF_FFFF;

        let aux_info_type = if flags & 0x01 != 0 {
            Some((reader.read_fourcc()?, reader.read_u32()?))
        } else {
            None
        };

        let entry_count = reader.read_u32()? as usize;
        let mut offsets = Vec::with_capacity(entry_count.min(4096));

        for _ in 0..entry_count {
            let offset = if version == 0 {
                reader.read_u32()? as u64
            } else {
                reader.read_u64()?
            };
            offsets.push(offset);
        }

        Ok(Self {
            aux_info_type,
            offsets,
        })
    }
}
