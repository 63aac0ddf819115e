//! Per sample encryption parameters, assembled either from a senc box or
//! from raw auxiliary records located through saio/saiz.

use crate::{
    boxes::SencBox,
    error::{Error, Result},
    reader::Reader,
};

/// Flattened table of per sample IVs and subsample maps for one run of
/// samples.
///
/// IVs are stored back to back in one buffer, and all subsample spans in
/// two parallel arrays with a (start, length) window per sample, which
/// keeps the table compact for long runs.
#[derive(Debug, Clone, Default)]
pub struct SampleInfoTable {
    iv_size: u8,
    iv_data: Vec<u8>,
    sample_count: usize,
    bytes_of_cleartext_data: Vec<u16>,
    bytes_of_encrypted_data: Vec<u32>,
    subsample_starts: Vec<usize>,
    subsample_lengths: Vec<usize>,
}

impl SampleInfoTable {
    /// Build the table from a parsed senc box.
    pub fn from_senc(senc: &SencBox, iv_size: u8) -> Self {
        let mut table = Self {
            iv_size,
            ..Self::default()
        };

        for sample in &senc.samples {
            table.push_sample(&sample.iv);

            for subsample in &sample.subsamples {
                table.push_subsample(
                    subsample.bytes_of_cleartext_data,
                    subsample.bytes_of_encrypted_data,
                );
            }
        }

        table
    }

    /// Build the table from raw auxiliary records, one per sample, as
    /// located through saio/saiz. Each record is an IV optionally
    /// followed by a subsample count and that many 6 byte spans.
    pub fn from_aux_records(records: &[Vec<u8>], iv_size: u8) -> Result<Self> {
        let mut table = Self {
            iv_size,
            ..Self::default()
        };

        for (index, record) in records.iter().enumerate() {
            let mut reader = Reader::new(record);
            let iv = reader.read_bytes(iv_size as usize).map_err(|_| {
                Error::Malformed(format!(
                    "auxiliary record of sample {} is shorter than its IV",
                    index
                ))
            })?;
            table.push_sample(iv);

            if reader.has_more_data() {
                let subsample_count = reader.read_u16()?;

                for _ in 0..subsample_count {
                    let clear = reader.read_u16()?;
                    let encrypted = reader.read_u32()?;
                    table.push_subsample(clear, encrypted);
                }
            }
        }

        Ok(table)
    }

    fn push_sample(&mut self, iv: &[u8]) {
        self.iv_data.extend_from_slice(iv);
        self.subsample_starts.push(self.bytes_of_cleartext_data.len());
        self.subsample_lengths.push(0);
        self.sample_count += 1;
    }

    fn push_subsample(&mut self, clear: u16, encrypted: u32) {
        self.bytes_of_cleartext_data.push(clear);
        self.bytes_of_encrypted_data.push(encrypted);
        if let Some(length) = self.subsample_lengths.last_mut() {
            *length += 1;
        }
    }

    pub fn sample_count(&self) -> usize {
        self.sample_count
    }

    pub fn iv_size(&self) -> u8 {
        self.iv_size
    }

    /// IV of sample `index`, or `None` when samples carry no IVs and the
    /// track's constant IV applies.
    pub fn iv(&self, index: usize) -> Option<&[u8]> {
        if self.iv_size == 0 || index >= self.sample_count {
            return None;
        }

        let size = self.iv_size as usize;
        Some(&self.iv_data[(index * size)..((index + 1) * size)])
    }

    /// Subsample spans of sample `index` as parallel clear/encrypted
    /// slices. Both are empty for fully encrypted samples.
    pub fn subsamples(&self, index: usize) -> (&[u16], &[u32]) {
        let Some((start, length)) = self
            .subsample_starts
            .get(index)
            .copied()
            .zip(self.subsample_lengths.get(index).copied())
        else {
            return (&[], &[]);
        };

        (
            &self.bytes_of_cleartext_data[start..(start + length)],
            &self.bytes_of_encrypted_data[start..(start + length)],
        )
    }
}
