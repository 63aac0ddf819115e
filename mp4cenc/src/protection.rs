//! Protection metadata extraction from the movie box.

use std::fmt;

use crate::{
    atom::{Atom, FourCc},
    boxes::{FrmaBox, SchmBox, TencBox},
    error::{Error, Result},
};

/// Common encryption protection scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    /// AES-128 CTR, full subsample encryption.
    Cenc,
    /// AES-128 CTR with a crypt:skip block pattern.
    Cens,
    /// AES-128 CBC, full subsample encryption.
    Cbc1,
    /// AES-128 CBC with a crypt:skip block pattern.
    Cbcs,
}

impl Scheme {
    pub fn from_fourcc(code: FourCc) -> Option<Self> {
        match &code.0 {
            b"cenc" => Some(Self::Cenc),
            b"cens" => Some(Self::Cens),
            b"cbc1" => Some(Self::Cbc1),
            b"cbcs" => Some(Self::Cbcs),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cenc => "cenc",
            Self::Cens => "cens",
            Self::Cbc1 => "cbc1",
            Self::Cbcs => "cbcs",
        }
    }

    /// Whether the scheme encrypts with AES-CTR rather than AES-CBC.
    pub fn is_ctr_mode(&self) -> bool {
        matches!(self, Self::Cenc | Self::Cens)
    }

    /// Whether encrypted ranges are striped with a crypt:skip pattern.
    pub fn is_pattern_mode(&self) -> bool {
        matches!(self, Self::Cens | Self::Cbcs)
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Protection parameters of one track, assembled from the sinf box of
/// its protected sample entry.
#[derive(Debug, Clone)]
pub struct ProtectionInfo {
    pub scheme: Scheme,
    /// Sample entry type the track had before encryption.
    pub original_format: FourCc,
    pub default_is_protected: bool,
    pub per_sample_iv_size: u8,
    pub default_kid: [u8; 16],
    pub constant_iv: Option<Vec<u8>>,
    pub crypt_byte_block: u8,
    pub skip_byte_block: u8,
}

/// Extract the protection description of a track, or `None` when none of
/// its sample entries is protected.
///
/// When several sample entries are protected the first one governs, the
/// usual layout for tracks switching between encrypted and clear
/// periods.
pub fn extract_protection(trak: &Atom) -> Result<Option<ProtectionInfo>> {
    let Some(stsd) = trak.find_path(&[b"mdia", b"minf", b"stbl", b"stsd"]) else {
        return Ok(None);
    };

    for entry in stsd.children() {
        if !matches!(&entry.name.0, b"encv" | b"enca" | b"encs" | b"enct") {
            continue;
        }

        let sinf = entry.find(b"sinf").ok_or_else(|| {
            Error::MissingProtection(format!("sample entry {} has no sinf box", entry.name))
        })?;

        let frma = sinf
            .find(b"frma")
            .and_then(|atom| atom.data())
            .ok_or_else(|| Error::MissingProtection("sinf has no frma box".to_owned()))
            .and_then(FrmaBox::parse)?;

        let schm = sinf
            .find(b"schm")
            .and_then(|atom| atom.data())
            .ok_or_else(|| Error::MissingProtection("sinf has no schm box".to_owned()))
            .and_then(SchmBox::parse)?;

        let scheme = Scheme::from_fourcc(schm.scheme_type)
            .ok_or_else(|| Error::UnsupportedScheme(schm.scheme_type.to_string()))?;

        let tenc = sinf
            .find_path(&[b"schi", b"tenc"])
            .and_then(|atom| atom.data())
            .ok_or_else(|| Error::MissingProtection("sinf has no tenc box".to_owned()))
            .and_then(TencBox::parse)?;

        let info = ProtectionInfo {
            scheme,
            original_format: frma.data_format,
            default_is_protected: tenc.default_is_protected,
            per_sample_iv_size: tenc.per_sample_iv_size,
            default_kid: tenc.default_kid,
            constant_iv: tenc.constant_iv,
            crypt_byte_block: tenc.crypt_byte_block,
            skip_byte_block: tenc.skip_byte_block,
        };
        validate(&info)?;

        return Ok(Some(info));
    }

    Ok(None)
}

fn validate(info: &ProtectionInfo) -> Result<()> {
    if !matches!(info.per_sample_iv_size, 0 | 8 | 16) {
        return Err(Error::Malformed(format!(
            "tenc per_sample_IV_size {} is not 0, 8 or 16",
            info.per_sample_iv_size
        )));
    }

    if !info.scheme.is_ctr_mode() && info.per_sample_iv_size == 8 {
        return Err(Error::Malformed(format!(
            "scheme {} uses AES-CBC which needs 16 byte IVs, tenc declares 8",
            info.scheme
        )));
    }

    if let Some(constant_iv) = &info.constant_iv {
        let valid = if info.scheme.is_ctr_mode() {
            matches!(constant_iv.len(), 8 | 16)
        } else {
            constant_iv.len() == 16
        };

        if !valid {
            return Err(Error::Malformed(format!(
                "constant IV of {} bytes is invalid for scheme {}",
                constant_iv.len(),
                info.scheme
            )));
        }
    }

    if info.crypt_byte_block > 0 && !info.scheme.is_pattern_mode() {
        log::debug!(
            "scheme {} ignores the {}:{} pattern declared in tenc",
            info.scheme,
            info.crypt_byte_block,
            info.skip_byte_block
        );
    }

    Ok(())
}
