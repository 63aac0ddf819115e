/*
    REFERENCES
    ----------

    1. ISO/IEC 14496-12:2022 section 8.9 (sample groups)
    2. ISO/IEC 23001-7:2016 section 6 (encryption parameters shared by groups of samples)

*/

use crate::{
    atom::FourCc,
    error::{Error, Result},
    reader::Reader,
};

/// One `seig` sample group entry: the protection parameters for every
/// sample mapped to it, overriding the tenc defaults. Used for key
/// rotation and for mixing clear and encrypted samples in one track.
#[derive(Debug, Clone)]
pub struct SeigEntry {
    pub crypt_byte_block: u8,
    pub skip_byte_block: u8,
    pub is_protected: bool,
    pub per_sample_iv_size: u8,
    pub kid: [u8; 16],
    pub constant_iv: Option<Vec<u8>>,
}

impl SeigEntry {
    fn parse(reader: &mut Reader) -> Result<Self> {
        reader.skip(1)?;
        let blocks = reader.read_u8()?;
        let is_protected = reader.read_u8()? != 0;
        let per_sample_iv_size = reader.read_u8()?;
        let mut kid = [0u8; 16];
        kid.copy_from_slice(reader.read_bytes(16)?);

        let constant_iv = if is_protected && per_sample_iv_size == 0 {
            let size = reader.read_u8()? as usize;
            Some(reader.read_bytes(size)?.to_vec())
        } else {
            None
        };

        Ok(Self {
            crypt_byte_block: (blocks >> 4) & 0x0F,
            skip_byte_block: blocks & 0x0F,
            is_protected,
            per_sample_iv_size,
            kid,
            constant_iv,
        })
    }
}

/// Sample Group Description Box (sgpd). Only `seig` groups are decoded;
/// other grouping types keep their grouping type and an empty entry
/// list.
#[derive(Debug, Clone)]
pub struct SgpdBox {
    pub grouping_type: FourCc,
    pub entries: Vec<SeigEntry>,
}

impl SgpdBox {
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut reader = Reader::new(data);
        let version = (reader.read_u32()? >> 24) as u8;
        let grouping_type = reader.read_fourcc()?;

        let default_length = if version >= 1 { reader.read_u32()? } else { 0 };

        if version >= 2 {
            // "default_sample_description_index"
            reader.skip(4)?;
        }

        let entry_count = reader.read_u32()? as usize;

        if grouping_type.0 != *b"seig" {
            return Ok(Self {
                grouping_type,
                entries: Vec::new(),
            });
        }

        let mut entries = Vec::with_capacity(entry_count.min(4096));

        for _ in 0..entry_count {
            if version >= 1 && default_length == 0 {
                // Variable length entries declare their own size. The
                // entry parser reads exactly the fields it knows, so any
                // extension bytes at the end are skipped here.
                let length = reader.read_u32()? as usize;
                let mut entry_reader = Reader::new(reader.read_bytes(length)?);
                entries.push(SeigEntry::parse(&mut entry_reader)?);
            } else {
                entries.push(SeigEntry::parse(&mut reader)?);
            }
        }

        Ok(Self {
            grouping_type,
            entries,
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SbgpEntry {
    pub sample_count: u32,
    /// 0 means no group. Values up to 0x10000 index the track level
    /// sgpd, larger values minus 0x10001 index the fragment level sgpd.
    pub group_description_index: u32,
}

/// Sample To Group Box (sbgp). Maps runs of consecutive samples to
/// entries of the matching sgpd box.
#[derive(Debug, Clone)]
pub struct SbgpBox {
    pub grouping_type: FourCc,
    pub entries: Vec<SbgpEntry>,
}

impl SbgpBox {
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut reader = Reader::new(data);
        let version = (reader.read_u32()? >> 24) as u8;
        let grouping_type = reader.read_fourcc()?;

        if version == 1 {
            // "grouping_type_parameter"
            reader.skip(4)?;
        }

        let entry_count = reader.read_u32()? as usize;
        let mut entries = Vec::with_capacity(entry_count.min(4096));

        for _ in 0..entry_count {
            entries.push(SbgpEntry {
                sample_count: reader.read_u32()?,
                group_description_index: reader.read_u32()?,
            });
        }

        Ok(Self {
            grouping_type,
            entries,
        })
    }
}

/// Resolve the `seig` overrides for a run of `sample_count` samples.
///
/// `track_sgpd` holds the static groups from the stbl, `fragment_sgpd`
/// the ones local to the current traf. Samples without a group, and
/// every sample when `sbgp` is absent, stay `None` and keep the track
/// defaults.
pub fn resolve_sample_groups(
    sample_count: usize,
    sbgp: Option<&SbgpBox>,
    track_sgpd: Option<&SgpdBox>,
    fragment_sgpd: Option<&SgpdBox>,
) -> Result<Vec<Option<SeigEntry>>> {
    let mut groups: Vec<Option<SeigEntry>> = vec![None; sample_count];

    let Some(sbgp) = sbgp else {
        return Ok(groups);
    };

    let mut sample = 0;

    for entry in &sbgp.entries {
        for _ in 0..entry.sample_count {
            if sample >= sample_count {
                log::warn!("sbgp maps more samples than the run contains, ignoring the excess");
                return Ok(groups);
            }

            groups[sample] = match entry.group_description_index {
                0 => None,
                index if index >= 0x10001 => {
                    let local = (index - 0x10001) as usize;
                    let entry = fragment_sgpd
                        .and_then(|sgpd| sgpd.entries.get(local))
                        .ok_or_else(|| {
                            Error::Malformed(format!(
                                "sbgp references fragment sample group entry {} which does not exist",
                                index
                            ))
                        })?;
                    Some(entry.clone())
                }
                index => {
                    let entry = track_sgpd
                        .and_then(|sgpd| sgpd.entries.get(index as usize - 1))
                        .ok_or_else(|| {
                            Error::Malformed(format!(
                                "sbgp references sample group entry {} which does not exist",
                                index
                            ))
                        })?;
                    Some(entry.clone())
                }
            };

            sample += 1;
        }
    }

    Ok(groups)
}
