use crate::{atom::FourCc, error::Result, reader::Reader};

/// Sample Auxiliary Information Sizes Box (saiz). Gives the size of each
/// sample's auxiliary record, either as one shared default or per sample.
#[derive(Debug, Clone)]
pub struct SaizBox {
    pub aux_info_type: Option<(FourCc, u32)>,
    pub default_sample_info_size: u8,
    pub sample_count: u32,
    sizes: Vec<u8>,
}

impl SaizBox {
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut reader = Reader::new(data);
        let flags = reader.read_u32()? & 0x00FF_FFFF;

        let aux_info_type = if flags & 0x01 != 0 {
            Some((reader.read_fourcc()?, reader.read_u32()?))
        } else {
            None
        };

        let default_sample_info_size = reader.read_u8()?;
        let sample_count = reader.read_u32()?;

        let sizes = if default_sample_info_size == 0 {
            reader.read_bytes(sample_count as usize)?.to_vec()
        } else {
            Vec::new()
        };

        Ok(Self {
            aux_info_type,
            default_sample_info_size,
            sample_count,
            sizes,
        })
    }

    /// Size of the auxiliary record of sample `index`.
    pub fn sample_info_size(&self, index: usize) -> Option<usize> {
        if index >= self.sample_count as usize {
            return None;
        }

        if self.default_sample_info_size != 0 {
            Some(self.default_sample_info_size as usize)
        } else {
            self.sizes.get(index).map(|size| *size as usize)
        }
    }
}
