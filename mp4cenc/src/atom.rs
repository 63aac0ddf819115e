/*
    REFERENCES
    ----------

    1. ISO/IEC 14496-12:2022 section 4.2 (object structure)
    2. https://github.com/axiomatic-systems/Bento4/blob/master/Source/C++/Core/Ap4Atom.cpp

*/

//! In-memory model of the ISO base media box tree.
//!
//! A stream is a flat sequence of top level boxes. Boxes this crate needs
//! to look inside (`moov`, `moof` and their descendants) are parsed into
//! an [`Atom`] tree, media payloads (`mdat`) stay in the source stream and
//! everything else is held as raw bytes. Serializing an [`Atom`]
//! recomputes every box size bottom-up, so children can be removed or
//! resized freely before writing.

use std::{
    fmt,
    io::{Read, Seek},
};

use crate::{
    error::{Error, Result},
    reader::Reader,
};

/// Boxes whose payload is a plain sequence of child boxes.
const CONTAINERS: [[u8; 4]; 10] = [
    *b"moov", *b"trak", *b"mdia", *b"minf", *b"stbl", *b"mvex", *b"moof", *b"traf", *b"sinf",
    *b"schi",
];

/// A four character box type code.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct FourCc(pub [u8; 4]);

impl FourCc {
    pub const fn new(code: &[u8; 4]) -> Self {
        Self(*code)
    }
}

impl fmt::Display for FourCc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            if byte.is_ascii_graphic() || byte == b' ' {
                write!(f, "{}", byte as char)?;
            } else {
                write!(f, "\\x{:02x}", byte)?;
            }
        }

        Ok(())
    }
}

impl fmt::Debug for FourCc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}

/// Payload of a single box.
#[derive(Debug, Clone)]
pub enum Payload {
    /// Child boxes.
    Children(Vec<Atom>),
    /// A fixed run of bytes followed by child boxes. Used for `stsd` and
    /// for protected sample entries, whose payloads start with fixed
    /// fields before any nested box.
    Prefixed { prefix: Vec<u8>, children: Vec<Atom> },
    /// Raw payload held in memory.
    Data(Vec<u8>),
}

/// One parsed box.
#[derive(Debug, Clone)]
pub struct Atom {
    pub name: FourCc,
    /// Absolute offset of the box header in the source stream, as parsed.
    /// Not updated when the tree is edited.
    pub start: u64,
    /// Whether the box was stored with a 64-bit `largesize` field. The
    /// same form is kept when serializing.
    pub has_64_bit_size: bool,
    pub payload: Payload,
}

impl Atom {
    /// Build a container box. `start` is zeroed, which only matters for
    /// boxes parsed out of a stream.
    pub fn container(name: &[u8; 4], children: Vec<Atom>) -> Self {
        Self {
            name: FourCc::new(name),
            start: 0,
            has_64_bit_size: false,
            payload: Payload::Children(children),
        }
    }

    /// Build a leaf box holding raw payload bytes.
    pub fn leaf(name: &[u8; 4], data: Vec<u8>) -> Self {
        Self {
            name: FourCc::new(name),
            start: 0,
            has_64_bit_size: false,
            payload: Payload::Data(data),
        }
    }

    /// Build a box with fixed leading bytes followed by child boxes.
    pub fn prefixed(name: &[u8; 4], prefix: Vec<u8>, children: Vec<Atom>) -> Self {
        Self {
            name: FourCc::new(name),
            start: 0,
            has_64_bit_size: false,
            payload: Payload::Prefixed { prefix, children },
        }
    }

    /// Parse every box in `data`, where `data` starts at absolute stream
    /// offset `base`.
    pub fn parse_all(data: &[u8], base: u64) -> Result<Vec<Atom>> {
        let mut reader = Reader::new(data);
        let mut atoms = Vec::new();

        while reader.has_more_data() {
            atoms.push(Self::parse_one(&mut reader, base)?);
        }

        Ok(atoms)
    }

    fn parse_one(reader: &mut Reader, base: u64) -> Result<Atom> {
        let header_start = reader.get_position();
        let start = base + header_start as u64;
        let size32 = reader.read_u32()? as u64;
        let name = reader.read_fourcc()?;

        let mut has_64_bit_size = false;
        let size = match size32 {
            // A zero size extends the box to the end of its parent.
            0 => (reader.get_length() - header_start) as u64,
            1 => {
                has_64_bit_size = true;
                reader.read_u64()?
            }
            _ => size32,
        };

        let header_size = if has_64_bit_size { 16 } else { 8 };
        if size < header_size {
            return Err(Error::Malformed(format!(
                "box {} has size {} smaller than its own header",
                name, size
            )));
        }

        let payload_size = size - header_size;
        if payload_size > reader.remaining() as u64 {
            return Err(Error::Malformed(format!(
                "box {} extends {} bytes past the end of its parent",
                name,
                payload_size - reader.remaining() as u64
            )));
        }

        let payload_data = reader.read_bytes(payload_size as usize)?;
        let payload = Self::parse_payload(name, payload_data, start + header_size)?;

        Ok(Atom {
            name,
            start,
            has_64_bit_size,
            payload,
        })
    }

    fn parse_payload(name: FourCc, data: &[u8], base: u64) -> Result<Payload> {
        if CONTAINERS.contains(&name.0) {
            Ok(Payload::Children(Self::parse_all(data, base)?))
        } else if name.0 == *b"stsd" {
            // Full box header plus an entry count, then the sample entries.
            if data.len() < 8 {
                return Err(Error::Malformed(
                    "stsd box too short for its entry count".to_owned(),
                ));
            }

            Ok(Payload::Prefixed {
                prefix: data[..8].to_vec(),
                children: Self::parse_all(&data[8..], base + 8)?,
            })
        } else if matches!(&name.0, b"encv" | b"enca" | b"encs" | b"enct") {
            let prefix_size = sample_entry_prefix_size(name, data)?;

            Ok(Payload::Prefixed {
                prefix: data[..prefix_size].to_vec(),
                children: Self::parse_all(&data[prefix_size..], base + prefix_size as u64)?,
            })
        } else {
            Ok(Payload::Data(data.to_vec()))
        }
    }

    /// Child boxes, or an empty slice for leaf payloads.
    pub fn children(&self) -> &[Atom] {
        match &self.payload {
            Payload::Children(children) | Payload::Prefixed { children, .. } => children,
            _ => &[],
        }
    }

    pub fn children_mut(&mut self) -> Option<&mut Vec<Atom>> {
        match &mut self.payload {
            Payload::Children(children) | Payload::Prefixed { children, .. } => Some(children),
            _ => None,
        }
    }

    /// Raw payload bytes of a leaf box.
    pub fn data(&self) -> Option<&[u8]> {
        match &self.payload {
            Payload::Data(data) => Some(data),
            _ => None,
        }
    }

    pub fn data_mut(&mut self) -> Option<&mut Vec<u8>> {
        match &mut self.payload {
            Payload::Data(data) => Some(data),
            _ => None,
        }
    }

    /// First direct child with the given name.
    pub fn find(&self, name: &[u8; 4]) -> Option<&Atom> {
        self.children().iter().find(|atom| atom.name.0 == *name)
    }

    pub fn find_mut(&mut self, name: &[u8; 4]) -> Option<&mut Atom> {
        self.children_mut()?
            .iter_mut()
            .find(|atom| atom.name.0 == *name)
    }

    /// Walk a chain of direct children by name.
    pub fn find_path(&self, path: &[&[u8; 4]]) -> Option<&Atom> {
        let mut atom = self;

        for name in path {
            atom = atom.find(name)?;
        }

        Some(atom)
    }

    pub fn find_path_mut(&mut self, path: &[&[u8; 4]]) -> Option<&mut Atom> {
        let mut atom = self;

        for name in path {
            atom = atom.find_mut(name)?;
        }

        Some(atom)
    }

    /// Remove every direct child for which `remove` returns true, and
    /// return how many were removed.
    pub fn remove_children(&mut self, mut remove: impl FnMut(&Atom) -> bool) -> usize {
        match self.children_mut() {
            Some(children) => {
                let before = children.len();
                children.retain(|atom| !remove(atom));
                before - children.len()
            }
            None => 0,
        }
    }

    /// Visit this box and every box below it, depth first.
    pub fn walk_mut(&mut self, visit: &mut impl FnMut(&mut Atom)) {
        visit(self);

        if let Some(children) = self.children_mut() {
            for child in children {
                child.walk_mut(visit);
            }
        }
    }

    /// Total serialized size of this box, header included.
    pub fn size(&self) -> u64 {
        let header = if self.has_64_bit_size { 16 } else { 8 };

        let payload = match &self.payload {
            Payload::Children(children) => children.iter().map(Atom::size).sum(),
            Payload::Prefixed { prefix, children } => {
                prefix.len() as u64 + children.iter().map(Atom::size).sum::<u64>()
            }
            Payload::Data(data) => data.len() as u64,
        };

        header + payload
    }

    /// Serialize this box into `out`, recomputing every size field.
    pub fn write(&self, out: &mut Vec<u8>) -> Result<()> {
        let size = self.size();

        if self.has_64_bit_size {
            out.extend_from_slice(&1u32.to_be_bytes());
            out.extend_from_slice(&self.name.0);
            out.extend_from_slice(&size.to_be_bytes());
        } else {
            let size32 = u32::try_from(size).map_err(|_| {
                Error::Malformed(format!("box {} no longer fits a 32-bit size", self.name))
            })?;
            out.extend_from_slice(&size32.to_be_bytes());
            out.extend_from_slice(&self.name.0);
        }

        match &self.payload {
            Payload::Children(children) => {
                for child in children {
                    child.write(out)?;
                }
            }
            Payload::Prefixed { prefix, children } => {
                out.extend_from_slice(prefix);

                for child in children {
                    child.write(out)?;
                }
            }
            Payload::Data(data) => out.extend_from_slice(data),
        }

        Ok(())
    }
}

/// Number of fixed payload bytes before the nested boxes of a protected
/// sample entry.
fn sample_entry_prefix_size(name: FourCc, data: &[u8]) -> Result<usize> {
    let size = match &name.0 {
        // Visual sample entries carry 70 bytes of fixed fields after the
        // 8 byte sample entry header.
        b"encv" => 78,
        b"enca" => {
            // Audio sample entries grow with their version: 20 fixed
            // bytes for version 0, plus 16 for version 1 or 36 for
            // version 2, after the 8 byte sample entry header.
            let mut reader = Reader::new(data);
            reader.skip(8)?;

            match reader.read_u16()? {
                2 => 64,
                1 => 44,
                _ => 28,
            }
        }
        _ => 8,
    };

    if data.len() < size {
        return Err(Error::Malformed(format!(
            "sample entry {} is shorter than its fixed fields",
            name
        )));
    }

    Ok(size)
}

/// Header of one top level box, as found in the source stream.
#[derive(Debug, Clone, Copy)]
pub struct AtomHeader {
    pub name: FourCc,
    /// Absolute offset of the box header.
    pub start: u64,
    /// Total box size, header included.
    pub size: u64,
    pub header_size: u64,
    pub has_64_bit_size: bool,
    /// Whether the size field was stored as zero, meaning the box runs to
    /// the end of the stream.
    pub size_to_eof: bool,
}

impl AtomHeader {
    /// Re-encode the header exactly as it appeared in the source.
    pub fn write(&self, out: &mut Vec<u8>) {
        if self.size_to_eof {
            out.extend_from_slice(&0u32.to_be_bytes());
            out.extend_from_slice(&self.name.0);
        } else if self.has_64_bit_size {
            out.extend_from_slice(&1u32.to_be_bytes());
            out.extend_from_slice(&self.name.0);
            out.extend_from_slice(&self.size.to_be_bytes());
        } else {
            out.extend_from_slice(&(self.size as u32).to_be_bytes());
            out.extend_from_slice(&self.name.0);
        }
    }
}

/// Read the next top level box header from `src`, or `None` at the end
/// of the stream. `stream_len` is the total stream length, needed to
/// resolve zero sized boxes. Leaves `src` positioned after the header.
pub fn read_header<R: Read + Seek>(src: &mut R, stream_len: u64) -> Result<Option<AtomHeader>> {
    let start = src.stream_position()?;

    if start >= stream_len {
        return Ok(None);
    }

    if stream_len - start < 8 {
        return Err(Error::Malformed(format!(
            "{} trailing bytes at the end of the stream",
            stream_len - start
        )));
    }

    let mut header = [0u8; 8];
    src.read_exact(&mut header)?;
    let size32 = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as u64;
    let name = FourCc([header[4], header[5], header[6], header[7]]);

    let mut has_64_bit_size = false;
    let mut size_to_eof = false;
    let size = match size32 {
        0 => {
            size_to_eof = true;
            stream_len - start
        }
        1 => {
            has_64_bit_size = true;
            let mut largesize = [0u8; 8];
            src.read_exact(&mut largesize)?;
            u64::from_be_bytes(largesize)
        }
        _ => size32,
    };

    let header_size = if has_64_bit_size { 16 } else { 8 };
    if size < header_size {
        return Err(Error::Malformed(format!(
            "box {} has size {} smaller than its own header",
            name, size
        )));
    }

    if start + size > stream_len {
        return Err(Error::Malformed(format!(
            "box {} extends {} bytes past the end of the stream",
            name,
            start + size - stream_len
        )));
    }

    Ok(Some(AtomHeader {
        name,
        start,
        size,
        header_size,
        has_64_bit_size,
        size_to_eof,
    }))
}

/// Load the payload of a top level box whose header was just read, and
/// parse it into a tree.
pub fn load<R: Read + Seek>(src: &mut R, header: &AtomHeader) -> Result<Atom> {
    let payload_size = usize::try_from(header.size - header.header_size).map_err(|_| {
        Error::Malformed(format!("box {} is too large to load in memory", header.name))
    })?;

    let mut data = vec![0u8; payload_size];
    src.read_exact(&mut data)?;
    let payload = Atom::parse_payload(header.name, &data, header.start + header.header_size)?;

    Ok(Atom {
        name: header.name,
        start: header.start,
        has_64_bit_size: header.has_64_bit_size,
        payload,
    })
}
