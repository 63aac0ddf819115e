//! This crate decrypts MPEG Common Encryption protected mp4 streams,
//! as specified by ISO/IEC 23001-7 and produced by DRM systems like
//! Widevine and PlayReady, once the content keys are known.
//!
//! All four protection schemes are supported:
//!
//! - **cenc**: AES-128 CTR, full subsample encryption.
//! - **cens**: AES-128 CTR, pattern encryption.
//! - **cbc1**: AES-128 CBC, full subsample encryption.
//! - **cbcs**: AES-128 CBC, pattern encryption.
//!
//! Both plain mp4 files and fragmented streams (DASH/CMAF segments) can
//! be processed. The output is a clean unprotected mp4: samples are
//! decrypted in place, sample entries get their original format back and
//! the protection metadata boxes are removed, with every chunk offset,
//! fragment offset and segment index patched to match.
//!
//! # Decrypting a file
//!
//! ```no_run
//! use mp4cenc::DecryptingProcessor;
//!
//! let processor = DecryptingProcessor::builder()
//!     .key(
//!         "eb676abbcb345e96bbcf616630f1a3da",
//!         "100b6c20940f779a4589152b57d2dacb",
//!     )?
//!     .build()?;
//!
//! processor.decrypt_file("encrypted.mp4", "decrypted.mp4")?;
//! # Ok::<(), mp4cenc::Error>(())
//! ```
//!
//! # Decrypting DASH segments
//!
//! Media segments carry no track metadata of their own, so the init
//! segment provides it:
//!
//! ```no_run
//! use mp4cenc::DecryptingProcessor;
//!
//! let processor = DecryptingProcessor::builder()
//!     .key(
//!         "eb676abbcb345e96bbcf616630f1a3da",
//!         "100b6c20940f779a4589152b57d2dacb",
//!     )?
//!     .build()?;
//!
//! let init = std::fs::read("init.mp4")?;
//! let segment = std::fs::read("segment_1.m4s")?;
//! let decrypted = processor.decrypt_segment(&segment, &init)?;
//! # Ok::<(), mp4cenc::Error>(())
//! ```
//!
//! Streams with several KIDs, for example separately keyed audio and
//! video tracks, decrypt in one pass when every KID is added with
//! [`key`](DecryptingProcessorBuilder::key). Tracks whose KID has no key
//! fail with [`Error::KeyNotFound`], and clear tracks pass through
//! untouched.
//!
//! A built [`DecryptingProcessor`] is immutable, so it can be shared
//! across threads to decrypt many streams in parallel.

pub mod atom;
pub mod boxes;

mod cipher;
mod decrypter;
mod error;
mod index;
mod keys;
mod processor;
mod progress;
mod protection;
mod reader;
mod sample_info;

pub use decrypter::SampleDecrypter;
pub use error::{Error, Result};
pub use keys::KeyMap;
pub use processor::{DecryptingProcessor, DecryptingProcessorBuilder};
pub use progress::{NoProgress, ProgressFn, ProgressListener};
pub use protection::{ProtectionInfo, Scheme, extract_protection};
pub use sample_info::SampleInfoTable;
