//! Sample layout resolution: turning sample tables and track runs into
//! absolute byte ranges.

use crate::{
    boxes::{ChunkOffsetBox, StscBox, StszBox, TfhdBox, TrexBox, TrunBox},
    error::{Error, Result},
};

/// Byte range of one sample in the source stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleRange {
    pub offset: u64,
    pub size: u32,
}

/// Flat sample layout of one unfragmented track.
#[derive(Debug, Clone)]
pub struct SampleIndex {
    pub samples: Vec<SampleRange>,
    /// Number of samples laid out in each chunk, in chunk order. Needed
    /// to resolve per chunk saio offsets.
    pub chunk_sample_counts: Vec<u32>,
}

/// Walk the stsc entries over the chunk offsets and lay every sample out
/// at its absolute position.
///
/// Samples within a chunk are contiguous, starting at the chunk offset.
/// The last stsc entry applies to all remaining chunks, and a trailing
/// entry may be cut short when the sample count runs out first.
pub fn build_sample_index(
    stsz: &StszBox,
    stsc: &StscBox,
    offsets: &ChunkOffsetBox,
) -> Result<SampleIndex> {
    let total = stsz.sample_count as usize;
    let chunk_count = offsets.offsets.len();
    let mut samples = Vec::with_capacity(total.min(65536));
    let mut chunk_sample_counts = vec![0u32; chunk_count];
    let mut sample = 0;

    'walk: for (index, entry) in stsc.entries.iter().enumerate() {
        if entry.first_chunk == 0 {
            return Err(Error::Malformed("stsc entry with first_chunk 0".to_owned()));
        }

        if index > 0 && entry.first_chunk <= stsc.entries[index - 1].first_chunk {
            return Err(Error::Malformed(
                "stsc first_chunk values are not strictly increasing".to_owned(),
            ));
        }

        let next_first_chunk = stsc
            .entries
            .get(index + 1)
            .map(|next| next.first_chunk as usize)
            .unwrap_or(chunk_count + 1);

        for chunk in (entry.first_chunk as usize)..next_first_chunk {
            if sample >= total {
                break 'walk;
            }

            let chunk_index = chunk - 1;
            let Some(chunk_offset) = offsets.offsets.get(chunk_index) else {
                return Err(Error::Malformed(format!(
                    "stsc references chunk {} but only {} chunk offsets exist",
                    chunk, chunk_count
                )));
            };

            let mut offset = *chunk_offset;
            let mut in_chunk = 0;

            for _ in 0..entry.samples_per_chunk {
                if sample >= total {
                    break;
                }

                let size = stsz.size_of(sample).ok_or_else(|| {
                    Error::Malformed(format!("stsz has no size for sample {}", sample))
                })?;
                samples.push(SampleRange { offset, size });
                offset += size as u64;
                sample += 1;
                in_chunk += 1;
            }

            chunk_sample_counts[chunk_index] = in_chunk;
        }
    }

    if sample < total {
        return Err(Error::Malformed(format!(
            "sample tables lay out {} of {} samples",
            sample, total
        )));
    }

    Ok(SampleIndex {
        samples,
        chunk_sample_counts,
    })
}

/// Effective sample sizes of one track run, with tfhd and trex defaults
/// applied in that order.
pub fn run_sample_sizes(
    trun: &TrunBox,
    tfhd: &TfhdBox,
    trex: Option<&TrexBox>,
) -> Result<Vec<u32>> {
    let default_size = tfhd
        .default_sample_size
        .or(trex.map(|trex| trex.default_sample_size));

    trun.samples
        .iter()
        .map(|sample| {
            sample.size.or(default_size).ok_or_else(|| {
                Error::Malformed(
                    "trun sample without a size and no default in tfhd or trex".to_owned(),
                )
            })
        })
        .collect()
}
