//! Decryption key storage.

use std::collections::HashMap;

use crate::error::{Error, Result};

/// KID to content key map for AES-128 keys.
#[derive(Debug, Clone, Default)]
pub struct KeyMap {
    keys: HashMap<[u8; 16], [u8; 16]>,
}

impl KeyMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a KID/key pair given as 32 hex character strings. Dashes
    /// are stripped from both, so UUID formatted KIDs work as is.
    pub fn insert_hex(&mut self, kid: &str, key: &str) -> Result<()> {
        self.keys.insert(parse_hex_16(kid)?, parse_hex_16(key)?);
        Ok(())
    }

    pub fn insert(&mut self, kid: [u8; 16], key: [u8; 16]) {
        self.keys.insert(kid, key);
    }

    pub fn get(&self, kid: &[u8; 16]) -> Option<&[u8; 16]> {
        self.keys.get(kid)
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }
}

/// Parse a 16 byte hex string, ignoring dashes.
pub(crate) fn parse_hex_16(hex_str: &str) -> Result<[u8; 16]> {
    let decoded = hex::decode(hex_str.replace('-', ""))?;

    if decoded.len() != 16 {
        return Err(Error::KeyWrongLength {
            expected: 16,
            actual: decoded.len(),
        });
    }

    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&decoded);
    Ok(bytes)
}
