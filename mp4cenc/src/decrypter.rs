//! Single sample decryption.

use crate::{
    cipher::Cipher,
    error::{Error, Result},
    protection::Scheme,
};

/// Decrypts individual samples of one protected track.
///
/// The decrypter is stateless across samples. It validates the subsample
/// map of each sample against the sample length before touching any
/// bytes, so a malformed map never produces silently corrupt output.
pub struct SampleDecrypter {
    scheme: Scheme,
    key: [u8; 16],
    crypt_byte_block: u8,
    skip_byte_block: u8,
}

impl SampleDecrypter {
    pub fn new(scheme: Scheme, key: [u8; 16], crypt_byte_block: u8, skip_byte_block: u8) -> Self {
        Self {
            scheme,
            key,
            crypt_byte_block,
            skip_byte_block,
        }
    }

    /// Decrypt one sample and return the plaintext.
    ///
    /// `bytes_of_cleartext_data` and `bytes_of_encrypted_data` are the
    /// sample's subsample map as parallel slices. Empty slices mean the
    /// whole sample is encrypted.
    pub fn decrypt_sample(
        &self,
        data_in: &[u8],
        iv: &[u8],
        bytes_of_cleartext_data: &[u16],
        bytes_of_encrypted_data: &[u32],
    ) -> Result<Vec<u8>> {
        if bytes_of_cleartext_data.len() != bytes_of_encrypted_data.len() {
            return Err(Error::Malformed(format!(
                "subsample map has {} clear spans but {} encrypted spans",
                bytes_of_cleartext_data.len(),
                bytes_of_encrypted_data.len()
            )));
        }

        let mut cipher = match self.scheme {
            Scheme::Cenc | Scheme::Cens => Cipher::ctr(&self.key, iv)?,
            Scheme::Cbc1 | Scheme::Cbcs => Cipher::cbc(&self.key, iv)?,
        };

        let mut data_out = vec![0u8; data_in.len()];

        if bytes_of_cleartext_data.is_empty() {
            self.check_cbc1_alignment(data_in.len())?;
            self.decrypt_into(&mut cipher, data_in, &mut data_out);
            return Ok(data_out);
        }

        let mut position = 0usize;

        for (index, (clear, encrypted)) in bytes_of_cleartext_data
            .iter()
            .zip(bytes_of_encrypted_data)
            .enumerate()
        {
            let clear = *clear as usize;
            let encrypted = *encrypted as usize;

            if position + clear + encrypted > data_in.len() {
                return Err(Error::Malformed(format!(
                    "subsample {} runs past the end of the sample data",
                    index
                )));
            }

            data_out[position..(position + clear)]
                .copy_from_slice(&data_in[position..(position + clear)]);
            position += clear;

            if encrypted > 0 {
                // cbcs restarts from the IV on every subsample, the
                // other schemes continue the chain or keystream.
                if self.scheme == Scheme::Cbcs {
                    cipher.reset_iv(iv)?;
                }

                self.check_cbc1_alignment(encrypted)?;
                let input = &data_in[position..(position + encrypted)];
                let output = &mut data_out[position..(position + encrypted)];
                self.decrypt_into(&mut cipher, input, output);
                position += encrypted;
            }
        }

        if position != data_in.len() {
            return Err(Error::Malformed(format!(
                "subsample map covers {} bytes but the sample is {}",
                position,
                data_in.len()
            )));
        }

        Ok(data_out)
    }

    fn decrypt_into(&self, cipher: &mut Cipher, input: &[u8], output: &mut [u8]) {
        if self.scheme.is_pattern_mode() {
            cipher.decrypt_pattern(input, output, self.crypt_byte_block, self.skip_byte_block);
        } else {
            cipher.decrypt_range(input, output);
        }
    }

    fn check_cbc1_alignment(&self, encrypted_len: usize) -> Result<()> {
        if self.scheme == Scheme::Cbc1 && encrypted_len % 16 != 0 {
            return Err(Error::Malformed(format!(
                "cbc1 encrypted range of {} bytes is not a multiple of the block size",
                encrypted_len
            )));
        }

        Ok(())
    }
}
