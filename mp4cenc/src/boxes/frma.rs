use crate::{atom::FourCc, error::Result, reader::Reader};

/// Original Format Box (frma). Records the sample entry type a protected
/// track had before encryption, e.g. `avc1` behind an `encv` entry.
#[derive(Debug, Clone, Copy)]
pub struct FrmaBox {
    pub data_format: FourCc,
}

impl FrmaBox {
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut reader = Reader::new(data);

        Ok(Self {
            data_format: reader.read_fourcc()?,
        })
    }
}
