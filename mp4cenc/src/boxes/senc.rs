use crate::{error::Result, reader::Reader};

/// One clear/encrypted span pair of a subsample mapped sample.
#[derive(Debug, Clone, Copy)]
pub struct SencSubsample {
    pub bytes_of_cleartext_data: u16,
    pub bytes_of_encrypted_data: u32,
}

#[derive(Debug, Clone, Default)]
pub struct SencSample {
    pub iv: Vec<u8>,
    pub subsamples: Vec<SencSubsample>,
}

/// Sample Encryption Box (senc). Carries per sample IVs and subsample
/// maps for one track run.
///
/// The payload cannot be parsed without the per sample IV size from the
/// track's tenc box, so the caller has to supply it.
#[derive(Debug, Clone)]
pub struct SencBox {
    pub samples: Vec<SencSample>,
}

impl SencBox {
    pub fn parse(data: &[u8], per_sample_iv_size: u8) -> Result<Self> {
        let mut reader = Reader::new(data);
        let flags = reader.read_u32()? & 0x00FF_FFFF;
        let has_subsamples = flags & 0x02 != 0;
        let sample_count = reader.read_u32()? as usize;

        // With no IVs and no subsample maps the box carries nothing per
        // sample. Report it as empty so the constant IV path applies.
        if per_sample_iv_size == 0 && !has_subsamples {
            return Ok(Self {
                samples: Vec::new(),
            });
        }

        let mut samples = Vec::with_capacity(sample_count.min(4096));

        for _ in 0..sample_count {
            let iv = reader.read_bytes(per_sample_iv_size as usize)?.to_vec();
            let mut subsamples = Vec::new();

            if has_subsamples {
                let subsample_count = reader.read_u16()? as usize;
                subsamples.reserve(subsample_count.min(4096));

                for _ in 0..subsample_count {
                    subsamples.push(SencSubsample {
                        bytes_of_cleartext_data: reader.read_u16()?,
                        bytes_of_encrypted_data: reader.read_u32()?,
                    });
                }
            }

            samples.push(SencSample { iv, subsamples });
        }

        Ok(Self { samples })
    }
}
