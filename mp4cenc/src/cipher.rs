/*
    REFERENCES
    ----------

    1. ISO/IEC 23001-7:2016 sections 9.4 and 9.6 (encryption of media data)
    2. https://github.com/axiomatic-systems/Bento4/blob/master/Source/C++/Crypto/Ap4StreamCipher.cpp

*/

use aes::{
    Aes128,
    cipher::{BlockDecrypt, KeyInit, KeyIvInit, StreamCipher, generic_array::GenericArray},
};

use crate::error::{Error, Result};

type Aes128Ctr = ctr::Ctr128BE<Aes128>;

/// Block cipher state for one sample.
///
/// CTR mode keeps a single keystream running across every encrypted
/// range of the sample, no matter how the ranges are split by subsample
/// maps or skip patterns. CBC mode chains ciphertext blocks across
/// ranges until the IV is reset.
pub enum Cipher {
    Ctr(Aes128Ctr),
    Cbc { aes: Aes128, prev: [u8; 16] },
}

impl Cipher {
    /// AES-CTR cipher. An 8 byte IV occupies the top half of the counter
    /// block with the counter itself starting at zero, a 16 byte IV is
    /// the full starting counter block.
    pub fn ctr(key: &[u8; 16], iv: &[u8]) -> Result<Self> {
        if iv.len() != 8 && iv.len() != 16 {
            return Err(Error::InvalidIvSize(iv.len()));
        }

        let mut counter_block = [0u8; 16];
        counter_block[..iv.len()].copy_from_slice(iv);

        Ok(Self::Ctr(Aes128Ctr::new(
            GenericArray::from_slice(key),
            GenericArray::from_slice(&counter_block),
        )))
    }

    /// AES-CBC cipher. The IV must be a full block.
    pub fn cbc(key: &[u8; 16], iv: &[u8]) -> Result<Self> {
        if iv.len() != 16 {
            return Err(Error::InvalidIvSize(iv.len()));
        }

        let mut prev = [0u8; 16];
        prev.copy_from_slice(iv);

        Ok(Self::Cbc {
            aes: Aes128::new(GenericArray::from_slice(key)),
            prev,
        })
    }

    /// Restart the CBC chain from `iv`. Used by cbcs, which begins every
    /// subsample from the IV again. No effect on a CTR cipher.
    pub fn reset_iv(&mut self, iv: &[u8]) -> Result<()> {
        if let Self::Cbc { prev, .. } = self {
            if iv.len() != 16 {
                return Err(Error::InvalidIvSize(iv.len()));
            }

            prev.copy_from_slice(iv);
        }

        Ok(())
    }

    /// Decrypt one encrypted range of a sample into `output`.
    ///
    /// CTR consumes keystream for exactly `input.len()` bytes. CBC
    /// decrypts whole blocks and copies a trailing partial block
    /// through unchanged, as pattern schemes leave such tails clear.
    pub fn decrypt_range(&mut self, input: &[u8], output: &mut [u8]) {
        match self {
            Self::Ctr(cipher) => {
                output[..input.len()].copy_from_slice(input);
                cipher.apply_keystream(&mut output[..input.len()]);
            }
            Self::Cbc { aes, prev } => {
                let block_count = input.len() / 16;

                for index in 0..block_count {
                    let start = index * 16;
                    let mut ciphertext = [0u8; 16];
                    ciphertext.copy_from_slice(&input[start..(start + 16)]);

                    let mut block = GenericArray::clone_from_slice(&ciphertext);
                    aes.decrypt_block(&mut block);

                    for (offset, byte) in block.iter().enumerate() {
                        output[start + offset] = byte ^ prev[offset];
                    }

                    *prev = ciphertext;
                }

                let tail = block_count * 16;
                if tail < input.len() {
                    output[tail..input.len()].copy_from_slice(&input[tail..]);
                }
            }
        }
    }

    /// Decrypt one encrypted range under a crypt:skip block pattern,
    /// expressed in 16 byte blocks. A pattern of 0:0 decrypts the whole
    /// range.
    pub fn decrypt_pattern(
        &mut self,
        input: &[u8],
        output: &mut [u8],
        crypt_byte_block: u8,
        skip_byte_block: u8,
    ) {
        let crypt_size = crypt_byte_block as usize * 16;
        let skip_size = skip_byte_block as usize * 16;

        if crypt_size == 0 && skip_size == 0 {
            self.decrypt_range(input, output);
            return;
        }

        let mut position = 0;

        while position < input.len() {
            let crypt = (input.len() - position).min(crypt_size);
            if crypt > 0 {
                self.decrypt_range(
                    &input[position..(position + crypt)],
                    &mut output[position..(position + crypt)],
                );
                position += crypt;
            }

            if position >= input.len() {
                break;
            }

            let skip = (input.len() - position).min(skip_size);
            if skip > 0 {
                output[position..(position + skip)]
                    .copy_from_slice(&input[position..(position + skip)]);
                position += skip;
            }
        }
    }
}
