use crate::{atom::FourCc, error::Result, reader::Reader};

/// Scheme Type Box (schm). Identifies the protection scheme applied to a
/// track and its version.
#[derive(Debug, Clone)]
pub struct SchmBox {
    pub scheme_type: FourCc,
    pub scheme_version: u32,
    pub scheme_uri: Option<String>,
}

impl SchmBox {
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut reader = Reader::new(data);
        let flags = reader.read_u32()? & 0x00FF_FFFF;
        let scheme_type = reader.read_fourcc()?;
        let scheme_version = reader.read_u32()?;

        let scheme_uri = if flags & 0x01 != 0 {
            let bytes = reader.read_bytes(reader.remaining())?;
            let uri = bytes.split(|byte| *byte == 0).next().unwrap_or_default();
            Some(String::from_utf8_lossy(uri).into_owned())
        } else {
            None
        };

        Ok(Self {
            scheme_type,
            scheme_version,
            scheme_uri,
        })
    }
}
