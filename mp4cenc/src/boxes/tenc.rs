/*
    REFERENCES
    ----------

    1. ISO/IEC 23001-7:2016 section 8.2 (track encryption box)

*/

use crate::{error::Result, reader::Reader};

/// Track Encryption Box (tenc). Carries the default protection
/// parameters of one track: whether samples are encrypted, the KID, the
/// per sample IV size and, for pattern schemes, the crypt:skip block
/// pattern.
///
/// A `per_sample_iv_size` of zero means samples carry no IVs of their
/// own and `constant_iv` applies to all of them.
#[derive(Debug, Clone)]
pub struct TencBox {
    pub crypt_byte_block: u8,
    pub skip_byte_block: u8,
    pub default_is_protected: bool,
    pub per_sample_iv_size: u8,
    pub default_kid: [u8; 16],
    pub constant_iv: Option<Vec<u8>>,
}

impl TencBox {
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut reader = Reader::new(data);
        let version = (reader.read_u32()? >> 24) as u8;

        // "reserved"
        reader.skip(1)?;

        let (crypt_byte_block, skip_byte_block) = if version == 0 {
            reader.skip(1)?;
            (0, 0)
        } else {
            let blocks = reader.read_u8()?;
            ((blocks >> 4) & 0x0F, blocks & 0x0F)
        };

        let default_is_protected = reader.read_u8()? != 0;
        let per_sample_iv_size = reader.read_u8()?;
        let mut default_kid = [0u8; 16];
        default_kid.copy_from_slice(reader.read_bytes(16)?);

        let constant_iv = if default_is_protected && per_sample_iv_size == 0 {
            let size = reader.read_u8()? as usize;
            Some(reader.read_bytes(size)?.to_vec())
        } else {
            None
        };

        Ok(Self {
            crypt_byte_block,
            skip_byte_block,
            default_is_protected,
            per_sample_iv_size,
            default_kid,
            constant_iv,
        })
    }
}
