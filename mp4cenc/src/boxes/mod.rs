//! Parsers for the individual boxes this crate needs to understand.
//!
//! Every parser takes the raw payload of its box, with the version and
//! flags of full boxes still in place. Boxes that only need to be
//! patched in the output, not rebuilt, also get in-place `rewrite_*`
//! helpers that edit the payload bytes directly so the box keeps its
//! exact size.

mod frma;
mod saio;
mod saiz;
mod schm;
mod senc;
mod sgpd;
mod sidx;
mod stbl;
mod tenc;
mod tfhd;
mod tkhd;
mod trex;
mod trun;

pub use frma::FrmaBox;
pub use saio::SaioBox;
pub use saiz::SaizBox;
pub use schm::SchmBox;
pub use senc::{SencBox, SencSample, SencSubsample};
pub use sgpd::{SbgpBox, SbgpEntry, SeigEntry, SgpdBox, resolve_sample_groups};
pub use sidx::{SidxBox, SidxReference};
pub use stbl::{ChunkOffsetBox, StscBox, StscEntry, StszBox};
pub use tenc::TencBox;
pub use tfhd::TfhdBox;
pub use tkhd::TkhdBox;
pub use trex::TrexBox;
pub use trun::{TrunBox, TrunSample};
