//! Sample table boxes of unfragmented tracks: stsz, stsc and stco/co64.

use crate::{
    error::{Error, Result},
    reader::Reader,
};

/// Sample Size Box (stsz).
#[derive(Debug, Clone)]
pub struct StszBox {
    pub sample_size: u32,
    pub sample_count: u32,
    sizes: Vec<u32>,
}

impl StszBox {
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut reader = Reader::new(data);
        reader.skip(4)?;
        let sample_size = reader.read_u32()?;
        let sample_count = reader.read_u32()?;

        let mut sizes = Vec::new();
        if sample_size == 0 {
            sizes.reserve((sample_count as usize).min(4096));

            for _ in 0..sample_count {
                sizes.push(reader.read_u32()?);
            }
        }

        Ok(Self {
            sample_size,
            sample_count,
            sizes,
        })
    }

    /// Size of sample `index`, honoring the constant size shortcut.
    pub fn size_of(&self, index: usize) -> Option<u32> {
        if index >= self.sample_count as usize {
            return None;
        }

        if self.sample_size != 0 {
            Some(self.sample_size)
        } else {
            self.sizes.get(index).copied()
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct StscEntry {
    /// 1-based index of the first chunk this entry applies to.
    pub first_chunk: u32,
    pub samples_per_chunk: u32,
    pub sample_description_index: u32,
}

/// Sample To Chunk Box (stsc).
#[derive(Debug, Clone)]
pub struct StscBox {
    pub entries: Vec<StscEntry>,
}

impl StscBox {
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut reader = Reader::new(data);
        reader.skip(4)?;
        let entry_count = reader.read_u32()? as usize;
        let mut entries = Vec::with_capacity(entry_count.min(4096));

        for _ in 0..entry_count {
            entries.push(StscEntry {
                first_chunk: reader.read_u32()?,
                samples_per_chunk: reader.read_u32()?,
                sample_description_index: reader.read_u32()?,
            });
        }

        Ok(Self { entries })
    }
}

/// Chunk Offset Box, covering both the 32-bit stco and 64-bit co64
/// variants.
#[derive(Debug, Clone)]
pub struct ChunkOffsetBox {
    pub offsets: Vec<u64>,
}

impl ChunkOffsetBox {
    pub fn parse(data: &[u8], large: bool) -> Result<Self> {
        let mut reader = Reader::new(data);
        reader.skip(4)?;
        let entry_count = reader.read_u32()? as usize;
        let mut offsets = Vec::with_capacity(entry_count.min(4096));

        for _ in 0..entry_count {
            let offset = if large {
                reader.read_u64()?
            } else {
                reader.read_u32()? as u64
            };
            offsets.push(offset);
        }

        Ok(Self { offsets })
    }

    /// Rewrite every chunk offset of an stco/co64 payload in place,
    /// keeping the box size unchanged.
    pub fn rewrite(
        data: &mut [u8],
        large: bool,
        mut adjust: impl FnMut(u64) -> Result<u64>,
    ) -> Result<()> {
        let entry_count = {
            let mut reader = Reader::new(data);
            reader.skip(4)?;
            reader.read_u32()? as usize
        };

        let entry_size = if large { 8 } else { 4 };
        if data.len() < 8 + entry_count * entry_size {
            return Err(Error::Malformed(
                "chunk offset box shorter than its entry count".to_owned(),
            ));
        }

        for index in 0..entry_count {
            let position = 8 + index * entry_size;

            if large {
                let old = u64::from_be_bytes([
                    data[position],
                    data[position + 1],
                    data[position + 2],
                    data[position + 3],
                    data[position + 4],
                    data[position + 5],
                    data[position + 6],
                    data[position + 7],
                ]);
                data[position..(position + 8)].copy_from_slice(&adjust(old)?.to_be_bytes());
            } else {
                let old = u32::from_be_bytes([
                    data[position],
                    data[position + 1],
                    data[position + 2],
                    data[position + 3],
                ]) as u64;
                let new = u32::try_from(adjust(old)?).map_err(|_| {
                    Error::Malformed("adjusted chunk offset exceeds 32 bits".to_owned())
                })?;
                data[position..(position + 4)].copy_from_slice(&new.to_be_bytes());
            }
        }

        Ok(())
    }
}
