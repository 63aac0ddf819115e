//! The high level decryption processor: scans a stream, decrypts every
//! protected sample and rewrites the container metadata so the output is
//! a plain unprotected mp4.

use std::{
    collections::HashMap,
    fs::{self, File},
    io::{BufReader, BufWriter, Cursor, Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
};

use log::{debug, warn};

use crate::{
    atom::{self, Atom, AtomHeader, FourCc},
    boxes::{
        ChunkOffsetBox, FrmaBox, SaioBox, SaizBox, SbgpBox, SeigEntry, SencBox, SgpdBox, SidxBox,
        StscBox, StszBox, TfhdBox, TkhdBox, TrexBox, TrunBox, resolve_sample_groups,
    },
    decrypter::SampleDecrypter,
    error::{Error, Result},
    index::{SampleRange, build_sample_index, run_sample_sizes},
    keys::KeyMap,
    progress::{NoProgress, ProgressListener},
    protection::{ProtectionInfo, extract_protection},
    sample_info::SampleInfoTable,
};

/// Builder for [`DecryptingProcessor`].
///
/// ```no_run
/// use mp4cenc::DecryptingProcessor;
///
/// let processor = DecryptingProcessor::builder()
///     .key(
///         "eb676abbcb345e96bbcf616630f1a3da",
///         "100b6c20940f779a4589152b57d2dacb",
///     )?
///     .build()?;
/// # Ok::<(), mp4cenc::Error>(())
/// ```
#[derive(Debug, Clone, Default)]
pub struct DecryptingProcessorBuilder {
    keys: KeyMap,
    strip_pssh: bool,
}

impl DecryptingProcessorBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a KID/key pair, both as 32 hex character strings. Dashes in
    /// either are ignored, so UUID formatted KIDs work as is.
    pub fn key(mut self, kid: &str, key: &str) -> Result<Self> {
        self.keys.insert_hex(kid, key)?;
        Ok(self)
    }

    /// Add a KID/key pair from raw bytes.
    pub fn key_bytes(mut self, kid: [u8; 16], key: [u8; 16]) -> Self {
        self.keys.insert(kid, key);
        self
    }

    /// Add multiple KID/key pairs given as hex strings.
    pub fn keys(mut self, keys: &HashMap<String, String>) -> Result<Self> {
        for (kid, key) in keys {
            self.keys.insert_hex(kid, key)?;
        }

        Ok(self)
    }

    /// Also remove pssh boxes from the output. They are kept by default,
    /// since players ignore them on clear content.
    pub fn strip_pssh(mut self, strip: bool) -> Self {
        self.strip_pssh = strip;
        self
    }

    pub fn build(self) -> Result<DecryptingProcessor> {
        if self.keys.is_empty() {
            return Err(Error::NoKeys);
        }

        Ok(DecryptingProcessor {
            keys: self.keys,
            strip_pssh: self.strip_pssh,
        })
    }
}

/// Decrypts CENC protected mp4 streams.
///
/// A processor holds only immutable configuration, so one instance can
/// decrypt any number of streams and can be shared freely across
/// threads.
#[derive(Debug, Clone)]
pub struct DecryptingProcessor {
    keys: KeyMap,
    strip_pssh: bool,
}

impl DecryptingProcessor {
    pub fn builder() -> DecryptingProcessorBuilder {
        DecryptingProcessorBuilder::new()
    }

    /// Decrypt a whole mp4 stream from `src` into `sink`.
    pub fn process<R, W>(&self, src: &mut R, sink: &mut W) -> Result<()>
    where
        R: Read + Seek,
        W: Write,
    {
        self.run(src, sink, &mut NoProgress, None)
    }

    /// Like [`process`](Self::process), reporting one progress step per
    /// sample of the protected tracks.
    pub fn process_with_progress<R, W>(
        &self,
        src: &mut R,
        sink: &mut W,
        progress: &mut dyn ProgressListener,
    ) -> Result<()>
    where
        R: Read + Seek,
        W: Write,
    {
        self.run(src, sink, progress, None)
    }

    /// Decrypt an in-memory mp4 stream.
    pub fn decrypt(&self, data: impl AsRef<[u8]>) -> Result<Vec<u8>> {
        let data = data.as_ref();
        let mut src = Cursor::new(data);
        let mut out = Vec::with_capacity(data.len());
        self.process(&mut src, &mut out)?;
        Ok(out)
    }

    /// Decrypt one media segment using the protection metadata of its
    /// initialization segment, and return the decrypted media segment.
    ///
    /// The init segment itself is not part of the output. Decrypt it
    /// separately with [`decrypt`](Self::decrypt), which also strips its
    /// protection metadata.
    pub fn decrypt_segment(
        &self,
        segment: impl AsRef<[u8]>,
        init: impl AsRef<[u8]>,
    ) -> Result<Vec<u8>> {
        let init = init.as_ref();
        let mut init_src = Cursor::new(init);
        let init_atoms = scan(&mut init_src, init.len() as u64)?;

        let moov = init_atoms
            .iter()
            .filter(|top| top.header.name.0 == *b"moov")
            .find_map(|top| top.tree.as_ref())
            .ok_or_else(|| Error::Malformed("initialization segment has no moov box".to_owned()))?;
        let (movie, _) = analyze_moov(moov, &mut init_src, false)?;

        let segment = segment.as_ref();
        let mut src = Cursor::new(segment);
        let mut out = Vec::with_capacity(segment.len());
        self.run(&mut src, &mut out, &mut NoProgress, Some(movie))?;
        Ok(out)
    }

    /// Decrypt `input` into `output` and return the number of bytes
    /// written.
    ///
    /// The output is written to a temporary `.part` file first and
    /// renamed into place once decryption succeeds, so an existing file
    /// at `output` is never replaced by a half written one.
    pub fn decrypt_file(
        &self,
        input: impl AsRef<Path>,
        output: impl AsRef<Path>,
    ) -> Result<u64> {
        self.decrypt_file_with_progress(input, output, &mut NoProgress)
    }

    pub fn decrypt_file_with_progress(
        &self,
        input: impl AsRef<Path>,
        output: impl AsRef<Path>,
        progress: &mut dyn ProgressListener,
    ) -> Result<u64> {
        let output = output.as_ref();
        let mut temp_name = output.as_os_str().to_owned();
        temp_name.push(".part");
        let temp_path = PathBuf::from(temp_name);

        let mut src = BufReader::new(File::open(input.as_ref())?);
        let mut sink = BufWriter::new(File::create(&temp_path)?);

        let outcome = (|| -> Result<u64> {
            self.run(&mut src, &mut sink, progress, None)?;
            sink.flush()?;
            Ok(sink.get_ref().metadata()?.len())
        })();

        drop(sink);

        match outcome {
            Ok(written) => {
                fs::rename(&temp_path, output)?;
                Ok(written)
            }
            Err(error) => {
                let _ = fs::remove_file(&temp_path);
                Err(error)
            }
        }
    }

    fn run<R, W>(
        &self,
        src: &mut R,
        sink: &mut W,
        progress: &mut dyn ProgressListener,
        preset: Option<MovieContext>,
    ) -> Result<()>
    where
        R: Read + Seek,
        W: Write,
    {
        let stream_len = src.seek(SeekFrom::End(0))?;
        src.seek(SeekFrom::Start(0))?;

        if stream_len == 0 {
            return Err(Error::Malformed("empty stream".to_owned()));
        }

        let mut atoms = scan(src, stream_len)?;

        // A moov in the stream takes precedence over a preset context
        // from an init segment.
        let mut movie = preset;
        let mut runs = Vec::new();

        let moov_tree = atoms
            .iter()
            .filter(|top| top.header.name.0 == *b"moov")
            .find_map(|top| top.tree.as_ref());
        if let Some(moov) = moov_tree {
            let (context, moov_runs) = analyze_moov(moov, src, true)?;
            movie = Some(context);
            runs = moov_runs;
        }

        for top in &atoms {
            if top.header.name.0 != *b"moof" {
                continue;
            }

            let Some(tree) = &top.tree else { continue };
            let Some(context) = &movie else {
                debug!(
                    "moof at offset {} has no movie context, leaving it as is",
                    top.header.start
                );
                continue;
            };

            runs.extend(analyze_moof(tree, top.header.start, context, src)?);
        }

        let plan = build_plan(&atoms, &runs)?;

        let any_protected = movie
            .as_ref()
            .map(|context| {
                context
                    .tracks
                    .values()
                    .any(|track| track.protection.is_some())
            })
            .unwrap_or(false);
        let strips_pssh = self.strip_pssh
            && atoms.iter().any(|top| {
                top.header.name.0 == *b"pssh"
                    || top
                        .tree
                        .as_ref()
                        .is_some_and(|tree| tree.find(b"pssh").is_some())
            });

        // Nothing to decrypt and nothing to strip: hand the stream
        // through byte for byte.
        if !any_protected && !strips_pssh {
            copy_range(src, sink, 0, stream_len)?;
            return Ok(());
        }

        let old_sizes: Vec<u64> = atoms.iter().map(|top| top.header.size).collect();

        for top in atoms.iter_mut() {
            if self.strip_pssh && top.header.name.0 == *b"pssh" {
                top.removed = true;
                continue;
            }

            let Some(tree) = &mut top.tree else { continue };

            match &top.header.name.0 {
                b"moov" => rewrite_moov(tree, self.strip_pssh)?,
                b"moof" => {
                    if let Some(context) = &movie {
                        rewrite_moof(tree, context);
                    }
                }
                _ => {}
            }
        }

        // Size deltas of every top level box, then patch all the offsets
        // that point past a resized one.
        let mut shifts = Vec::new();
        let mut deltas = vec![0i64; atoms.len()];

        for (index, top) in atoms.iter().enumerate() {
            let new_size = if top.removed {
                0
            } else {
                match &top.tree {
                    Some(tree) => tree.size(),
                    None => top.header.size,
                }
            };

            let delta = new_size as i64 - old_sizes[index] as i64;
            deltas[index] = delta;

            if delta != 0 {
                shifts.push((top.header.start, delta));
            }
        }

        let shift_at = |position: u64| -> i64 {
            shifts
                .iter()
                .filter(|(start, _)| *start < position)
                .map(|(_, delta)| *delta)
                .sum()
        };

        for (index, top) in atoms.iter_mut().enumerate() {
            let Some(tree) = &mut top.tree else { continue };

            match &top.header.name.0 {
                b"moov" => patch_chunk_offsets(tree, &shift_at)?,
                b"moof" => patch_moof(tree, deltas[index], &shift_at)?,
                _ => {}
            }
        }

        patch_sidx_references(&mut atoms, &deltas)?;

        emit(self, &atoms, &runs, &plan, src, sink, progress)
    }

    /// Decrypt one planned sample, or return `None` when the sample is
    /// clear and must be copied through unchanged.
    fn decrypt_planned(
        &self,
        run: &RunPlan,
        index: usize,
        data: &[u8],
    ) -> Result<Option<Vec<u8>>> {
        let group = run.groups.get(index).and_then(|group| group.as_ref());

        let is_protected = group
            .map(|group| group.is_protected)
            .unwrap_or(run.protection.default_is_protected);
        if !is_protected {
            return Ok(None);
        }

        let kid = group.map(|group| group.kid).unwrap_or(run.protection.default_kid);
        let key = self
            .keys
            .get(&kid)
            .ok_or_else(|| Error::KeyNotFound(hex::encode(kid)))?;

        let (crypt_byte_block, skip_byte_block) = group
            .map(|group| (group.crypt_byte_block, group.skip_byte_block))
            .unwrap_or((
                run.protection.crypt_byte_block,
                run.protection.skip_byte_block,
            ));

        let table_iv = run.table.as_ref().and_then(|table| table.iv(index));
        let iv = match table_iv {
            Some(iv) => iv,
            None => group
                .and_then(|group| group.constant_iv.as_deref())
                .or(run.protection.constant_iv.as_deref())
                .ok_or_else(|| {
                    Error::MissingProtection(format!(
                        "sample {} has neither a per sample IV nor a constant IV",
                        index
                    ))
                })?,
        };

        let (clear, encrypted) = run
            .table
            .as_ref()
            .map(|table| table.subsamples(index))
            .unwrap_or((&[], &[]));

        let decrypter =
            SampleDecrypter::new(run.protection.scheme, *key, crypt_byte_block, skip_byte_block);
        decrypter.decrypt_sample(data, iv, clear, encrypted).map(Some)
    }
}

/// One top level box of the source stream. `mdat` payloads stay in the
/// source, everything else is parsed into a tree.
struct TopAtom {
    header: AtomHeader,
    tree: Option<Atom>,
    removed: bool,
}

/// Per track context pulled out of the movie box, also usable as the
/// init segment context for standalone media segments.
struct TrackContext {
    protection: Option<ProtectionInfo>,
    /// Static seig sample groups from the track's stbl.
    sgpd: Option<SgpdBox>,
}

struct MovieContext {
    tracks: HashMap<u32, TrackContext>,
    trex: HashMap<u32, TrexBox>,
}

/// One run of samples sharing protection metadata: a whole unfragmented
/// track, or one traf of one fragment.
struct RunPlan {
    protection: ProtectionInfo,
    table: Option<SampleInfoTable>,
    groups: Vec<Option<SeigEntry>>,
    ranges: Vec<SampleRange>,
}

/// One sample scheduled for processing, in file order.
struct PlannedSample {
    offset: u64,
    size: u32,
    run: usize,
    index: usize,
}

fn scan<R: Read + Seek>(src: &mut R, stream_len: u64) -> Result<Vec<TopAtom>> {
    let mut atoms = Vec::new();

    while let Some(header) = atom::read_header(src, stream_len)? {
        let tree = if header.name.0 == *b"mdat" {
            src.seek(SeekFrom::Start(header.start + header.size))?;
            None
        } else {
            Some(atom::load(src, &header)?)
        };

        atoms.push(TopAtom {
            header,
            tree,
            removed: false,
        });
    }

    Ok(atoms)
}

fn analyze_moov<R: Read + Seek>(
    moov: &Atom,
    src: &mut R,
    with_runs: bool,
) -> Result<(MovieContext, Vec<RunPlan>)> {
    let mut tracks = HashMap::new();
    let mut trex = HashMap::new();
    let mut runs = Vec::new();

    if let Some(mvex) = moov.find(b"mvex") {
        for atom in mvex.children() {
            if atom.name.0 == *b"trex" {
                if let Some(data) = atom.data() {
                    let parsed = TrexBox::parse(data)?;
                    trex.insert(parsed.track_id, parsed);
                }
            }
        }
    }

    for trak in moov.children().iter().filter(|atom| atom.name.0 == *b"trak") {
        let tkhd = trak
            .find(b"tkhd")
            .and_then(|atom| atom.data())
            .ok_or_else(|| Error::Malformed("trak without a tkhd box".to_owned()))
            .and_then(TkhdBox::parse)?;

        let protection = extract_protection(trak)?;
        let stbl = trak.find_path(&[b"mdia", b"minf", b"stbl"]);
        let static_sgpd = stbl.and_then(|stbl| find_seig_sgpd(stbl));

        if with_runs {
            if let (Some(info), Some(stbl)) = (&protection, stbl) {
                if let Some(run) = moov_track_run(stbl, info, static_sgpd.as_ref(), src)? {
                    runs.push(run);
                }
            }
        }

        tracks.insert(
            tkhd.track_id,
            TrackContext {
                protection,
                sgpd: static_sgpd,
            },
        );
    }

    Ok((MovieContext { tracks, trex }, runs))
}

/// Build the sample run of one protected unfragmented track, or `None`
/// when the track keeps its samples in fragments.
fn moov_track_run<R: Read + Seek>(
    stbl: &Atom,
    info: &ProtectionInfo,
    static_sgpd: Option<&SgpdBox>,
    src: &mut R,
) -> Result<Option<RunPlan>> {
    let Some(stsz) = stbl.find(b"stsz").and_then(|atom| atom.data()) else {
        return Ok(None);
    };
    let stsz = StszBox::parse(stsz)?;

    if stsz.sample_count == 0 {
        return Ok(None);
    }

    let stsc = stbl
        .find(b"stsc")
        .and_then(|atom| atom.data())
        .ok_or_else(|| Error::Malformed("protected track has no stsc box".to_owned()))
        .and_then(StscBox::parse)?;

    let offsets = match (stbl.find(b"stco"), stbl.find(b"co64")) {
        (Some(stco), _) => ChunkOffsetBox::parse(
            stco.data().ok_or_else(|| {
                Error::Malformed("stco box holds no data".to_owned())
            })?,
            false,
        )?,
        (None, Some(co64)) => ChunkOffsetBox::parse(
            co64.data().ok_or_else(|| {
                Error::Malformed("co64 box holds no data".to_owned())
            })?,
            true,
        )?,
        (None, None) => {
            return Err(Error::Malformed(
                "protected track has no stco or co64 box".to_owned(),
            ));
        }
    };

    let index = build_sample_index(&stsz, &stsc, &offsets)?;
    let sample_count = index.samples.len();

    // Per sample encryption info: senc when present, otherwise raw
    // auxiliary records located through saio/saiz at absolute offsets.
    let table = sample_info_table(
        stbl,
        info,
        src,
        &index.chunk_sample_counts,
        0,
        sample_count,
    )?;
    check_table(table.as_ref(), sample_count)?;

    let sbgp = find_seig_sbgp(stbl)?;
    let groups = resolve_sample_groups(sample_count, sbgp.as_ref(), static_sgpd, None)?;

    Ok(Some(RunPlan {
        protection: info.clone(),
        table,
        groups,
        ranges: index.samples,
    }))
}

fn analyze_moof<R: Read + Seek>(
    moof: &Atom,
    moof_start: u64,
    movie: &MovieContext,
    src: &mut R,
) -> Result<Vec<RunPlan>> {
    let mut runs = Vec::new();
    let mut first_traf = true;
    let mut previous_traf_end: Option<u64> = None;

    for traf in moof.children().iter().filter(|atom| atom.name.0 == *b"traf") {
        let tfhd = traf
            .find(b"tfhd")
            .and_then(|atom| atom.data())
            .ok_or_else(|| Error::Malformed("traf without a tfhd box".to_owned()))
            .and_then(TfhdBox::parse)?;

        let track = movie.tracks.get(&tfhd.track_id);
        let trex = movie.trex.get(&tfhd.track_id);
        let is_protected_track = track
            .map(|track| track.protection.is_some())
            .unwrap_or(false);

        if track.is_none() {
            debug!(
                "traf references track {} with no movie context, leaving it as is",
                tfhd.track_id
            );
        }

        // Resolve where this traf's sample data starts.
        let base = if let Some(base) = tfhd.base_data_offset {
            Some(base)
        } else if tfhd.default_base_is_moof || first_traf {
            Some(moof_start)
        } else {
            previous_traf_end
        };
        first_traf = false;

        let Some(base) = base else {
            if is_protected_track {
                return Err(Error::Malformed(
                    "cannot resolve the base data offset of a protected traf".to_owned(),
                ));
            }

            previous_traf_end = None;
            continue;
        };

        // Lay out every trun. Runs without an explicit data offset
        // follow the previous run back to back.
        let mut ranges: Vec<SampleRange> = Vec::new();
        let mut run_sample_counts = Vec::new();
        let mut cursor = base;
        let mut layout_ok = true;

        for trun_atom in traf.children().iter().filter(|atom| atom.name.0 == *b"trun") {
            let data = trun_atom.data().ok_or_else(|| {
                Error::Malformed("trun box holds no data".to_owned())
            })?;
            let trun = TrunBox::parse(data)?;

            let sizes = match run_sample_sizes(&trun, &tfhd, trex) {
                Ok(sizes) => sizes,
                Err(error) => {
                    if is_protected_track {
                        return Err(error);
                    }

                    layout_ok = false;
                    break;
                }
            };

            let mut offset = match trun.data_offset {
                Some(data_offset) => u64::try_from(base as i64 + data_offset as i64)
                    .map_err(|_| {
                        Error::Malformed("trun data_offset points before the stream".to_owned())
                    })?,
                None => cursor,
            };

            for size in sizes {
                ranges.push(SampleRange { offset, size });
                offset += size as u64;
            }

            cursor = offset;
            run_sample_counts.push(trun.sample_count);
        }

        previous_traf_end = layout_ok.then_some(cursor);

        let Some(track) = track else { continue };
        let Some(info) = &track.protection else {
            continue;
        };

        if ranges.is_empty() {
            continue;
        }

        // Auxiliary records in fragments sit relative to the moof start.
        let table = sample_info_table(
            traf,
            info,
            src,
            &run_sample_counts,
            moof_start,
            ranges.len(),
        )?;
        check_table(table.as_ref(), ranges.len())?;

        let fragment_sgpd = find_seig_sgpd(traf);
        let sbgp = find_seig_sbgp(traf)?;
        let groups = resolve_sample_groups(
            ranges.len(),
            sbgp.as_ref(),
            track.sgpd.as_ref(),
            fragment_sgpd.as_ref(),
        )?;

        runs.push(RunPlan {
            protection: info.clone(),
            table,
            groups,
            ranges,
        });
    }

    Ok(runs)
}

/// Assemble the per sample encryption table of one run from the boxes in
/// `container` (an stbl or traf): senc when present, raw auxiliary
/// records through saio/saiz otherwise. `None` means no per sample info
/// exists and the constant IV path applies.
fn sample_info_table<R: Read + Seek>(
    container: &Atom,
    info: &ProtectionInfo,
    src: &mut R,
    group_sample_counts: &[u32],
    aux_base: u64,
    sample_count: usize,
) -> Result<Option<SampleInfoTable>> {
    if let Some(data) = container.find(b"senc").and_then(|atom| atom.data()) {
        let senc = SencBox::parse(data, info.per_sample_iv_size)?;

        if !senc.samples.is_empty() {
            return Ok(Some(SampleInfoTable::from_senc(
                &senc,
                info.per_sample_iv_size,
            )));
        }
    }

    let saiz = find_protection_saiz(container)?;
    let saio = find_protection_saio(container)?;

    if let (Some(saiz), Some(saio)) = (&saiz, &saio) {
        let records = read_aux_records(
            src,
            saio,
            saiz,
            group_sample_counts,
            aux_base,
            sample_count,
        )?;
        return Ok(Some(SampleInfoTable::from_aux_records(
            &records,
            info.per_sample_iv_size,
        )?));
    }

    Ok(None)
}

/// Find the first saiz box whose aux_info_type is absent or one of the
/// common encryption schemes. Auxiliary info of other kinds belongs to
/// someone else.
fn find_protection_saiz(container: &Atom) -> Result<Option<SaizBox>> {
    for atom in container.children() {
        if atom.name.0 != *b"saiz" {
            continue;
        }

        let Some(data) = atom.data() else { continue };
        let saiz = SaizBox::parse(data)?;

        if is_protection_aux_type(saiz.aux_info_type.map(|(code, _)| code)) {
            return Ok(Some(saiz));
        }
    }

    Ok(None)
}

fn find_protection_saio(container: &Atom) -> Result<Option<SaioBox>> {
    for atom in container.children() {
        if atom.name.0 != *b"saio" {
            continue;
        }

        let Some(data) = atom.data() else { continue };
        let saio = SaioBox::parse(data)?;

        if is_protection_aux_type(saio.aux_info_type.map(|(code, _)| code)) {
            return Ok(Some(saio));
        }
    }

    Ok(None)
}

fn is_protection_aux_type(aux_info_type: Option<FourCc>) -> bool {
    match aux_info_type {
        None => true,
        Some(code) => matches!(&code.0, b"cenc" | b"cens" | b"cbc1" | b"cbcs"),
    }
}

/// Read the raw auxiliary record of every sample. One saio offset means
/// all records are contiguous, otherwise saio carries one offset per
/// chunk (or per track run in fragments) and records are contiguous
/// within each group.
fn read_aux_records<R: Read + Seek>(
    src: &mut R,
    saio: &SaioBox,
    saiz: &SaizBox,
    group_sample_counts: &[u32],
    base: u64,
    sample_count: usize,
) -> Result<Vec<Vec<u8>>> {
    if (saiz.sample_count as usize) != sample_count {
        return Err(Error::Malformed(format!(
            "saiz covers {} samples but the run has {}",
            saiz.sample_count, sample_count
        )));
    }

    let mut records = Vec::with_capacity(sample_count);

    let mut read_group = |src: &mut R, start: u64, samples: &mut dyn Iterator<Item = usize>| {
        let mut position = start;

        for sample in samples {
            let size = saiz.sample_info_size(sample).ok_or_else(|| {
                Error::Malformed(format!("saiz has no record size for sample {}", sample))
            })?;

            src.seek(SeekFrom::Start(position))?;
            let mut record = vec![0u8; size];
            src.read_exact(&mut record)?;
            records.push(record);
            position += size as u64;
        }

        Ok::<(), Error>(())
    };

    if saio.offsets.len() == 1 {
        read_group(src, base + saio.offsets[0], &mut (0..sample_count))?;
    } else if saio.offsets.len() == group_sample_counts.len() {
        let mut sample = 0usize;

        for (offset, count) in saio.offsets.iter().zip(group_sample_counts) {
            let group = sample..(sample + *count as usize);
            sample = group.end;
            read_group(src, base + offset, &mut group.into_iter())?;
        }
    } else {
        return Err(Error::Malformed(format!(
            "saio has {} offsets, expected 1 or {}",
            saio.offsets.len(),
            group_sample_counts.len()
        )));
    }

    Ok(records)
}

fn check_table(table: Option<&SampleInfoTable>, sample_count: usize) -> Result<()> {
    if let Some(table) = table {
        if table.sample_count() != sample_count {
            return Err(Error::Malformed(format!(
                "per sample encryption info describes {} samples but the run has {}",
                table.sample_count(),
                sample_count
            )));
        }
    }

    Ok(())
}

fn find_seig_sgpd(container: &Atom) -> Option<SgpdBox> {
    container
        .children()
        .iter()
        .filter(|atom| atom.name.0 == *b"sgpd")
        .filter_map(|atom| atom.data())
        .filter_map(|data| SgpdBox::parse(data).ok())
        .find(|sgpd| sgpd.grouping_type.0 == *b"seig")
}

fn find_seig_sbgp(container: &Atom) -> Result<Option<SbgpBox>> {
    for atom in container.children() {
        if atom.name.0 != *b"sbgp" {
            continue;
        }

        let Some(data) = atom.data() else { continue };
        let sbgp = SbgpBox::parse(data)?;

        if sbgp.grouping_type.0 == *b"seig" {
            return Ok(Some(sbgp));
        }
    }

    Ok(None)
}

fn build_plan(atoms: &[TopAtom], runs: &[RunPlan]) -> Result<Vec<PlannedSample>> {
    let mut plan = Vec::new();

    for (run_index, run) in runs.iter().enumerate() {
        for (index, range) in run.ranges.iter().enumerate() {
            plan.push(PlannedSample {
                offset: range.offset,
                size: range.size,
                run: run_index,
                index,
            });
        }
    }

    plan.sort_by_key(|sample| sample.offset);

    for pair in plan.windows(2) {
        if pair[0].offset + pair[0].size as u64 > pair[1].offset {
            return Err(Error::Malformed(format!(
                "sample data ranges overlap at offset {}",
                pair[1].offset
            )));
        }
    }

    // Every sample must sit inside an mdat payload. Samples and mdat
    // boxes are both in increasing file order here.
    let mdats: Vec<(u64, u64)> = atoms
        .iter()
        .filter(|top| top.tree.is_none())
        .map(|top| {
            (
                top.header.start + top.header.header_size,
                top.header.start + top.header.size,
            )
        })
        .collect();
    let mut mdat = 0usize;

    for sample in &plan {
        while mdat < mdats.len() && sample.offset >= mdats[mdat].1 {
            mdat += 1;
        }

        let inside = mdat < mdats.len()
            && sample.offset >= mdats[mdat].0
            && sample.offset + sample.size as u64 <= mdats[mdat].1;
        if !inside {
            return Err(Error::Malformed(format!(
                "sample data at offset {} lies outside any mdat box",
                sample.offset
            )));
        }
    }

    Ok(plan)
}

/// Restore the original sample entries of every protected track and drop
/// the protection metadata from the movie box.
fn rewrite_moov(moov: &mut Atom, strip_pssh: bool) -> Result<()> {
    if strip_pssh {
        let removed = moov.remove_children(|atom| atom.name.0 == *b"pssh");
        if removed > 0 {
            debug!("removed {} pssh boxes from moov", removed);
        }
    }

    if let Some(children) = moov.children_mut() {
        for trak in children.iter_mut().filter(|atom| atom.name.0 == *b"trak") {
            rewrite_trak(trak)?;
        }
    }

    Ok(())
}

fn rewrite_trak(trak: &mut Atom) -> Result<()> {
    let Some(stbl) = trak.find_path_mut(&[b"mdia", b"minf", b"stbl"]) else {
        return Ok(());
    };

    let mut had_protected_entry = false;

    if let Some(stsd) = stbl.find_mut(b"stsd") {
        if let Some(entries) = stsd.children_mut() {
            for entry in entries.iter_mut() {
                if !matches!(&entry.name.0, b"encv" | b"enca" | b"encs" | b"enct") {
                    continue;
                }

                had_protected_entry = true;

                // Each entry gets its name back from its own frma box,
                // then sheds the whole sinf.
                let original_format = entry
                    .find_path(&[b"sinf", b"frma"])
                    .and_then(|atom| atom.data())
                    .and_then(|data| FrmaBox::parse(data).ok())
                    .map(|frma| frma.data_format);

                if let Some(format) = original_format {
                    entry.name = format;
                }

                entry.remove_children(|atom| atom.name.0 == *b"sinf");
            }
        }
    }

    if had_protected_entry {
        strip_sample_encryption_boxes(stbl);
    }

    Ok(())
}

fn rewrite_moof(moof: &mut Atom, movie: &MovieContext) {
    let Some(children) = moof.children_mut() else {
        return;
    };

    for traf in children.iter_mut().filter(|atom| atom.name.0 == *b"traf") {
        let is_protected = traf
            .find(b"tfhd")
            .and_then(|atom| atom.data())
            .and_then(|data| TfhdBox::parse(data).ok())
            .and_then(|tfhd| movie.tracks.get(&tfhd.track_id))
            .map(|track| track.protection.is_some())
            .unwrap_or(false);

        if is_protected {
            strip_sample_encryption_boxes(traf);
        }
    }
}

/// Remove senc, the protection flavored saio/saiz pair and seig sample
/// group boxes. Auxiliary info and sample groups of other kinds stay.
fn strip_sample_encryption_boxes(container: &mut Atom) {
    container.remove_children(|atom| match &atom.name.0 {
        b"senc" => true,
        b"saiz" => atom
            .data()
            .and_then(|data| SaizBox::parse(data).ok())
            .map(|saiz| is_protection_aux_type(saiz.aux_info_type.map(|(code, _)| code)))
            .unwrap_or(false),
        b"saio" => atom
            .data()
            .and_then(|data| SaioBox::parse(data).ok())
            .map(|saio| is_protection_aux_type(saio.aux_info_type.map(|(code, _)| code)))
            .unwrap_or(false),
        b"sgpd" | b"sbgp" => atom
            .data()
            .and_then(|data| data.get(4..8))
            .map(|grouping| grouping == b"seig")
            .unwrap_or(false),
        _ => false,
    });
}

fn patch_chunk_offsets(atom: &mut Atom, shift_at: &impl Fn(u64) -> i64) -> Result<()> {
    if matches!(&atom.name.0, b"stco" | b"co64") {
        let large = atom.name.0 == *b"co64";

        if let Some(data) = atom.data_mut() {
            ChunkOffsetBox::rewrite(data, large, |old| {
                old.checked_add_signed(shift_at(old)).ok_or_else(|| {
                    Error::Malformed(format!("chunk offset {} shifts below zero", old))
                })
            })?;
        }
    } else if let Some(children) = atom.children_mut() {
        for child in children {
            patch_chunk_offsets(child, shift_at)?;
        }
    }

    Ok(())
}

fn patch_moof(moof: &mut Atom, moof_delta: i64, shift_at: &impl Fn(u64) -> i64) -> Result<()> {
    let Some(children) = moof.children_mut() else {
        return Ok(());
    };

    for traf in children.iter_mut().filter(|atom| atom.name.0 == *b"traf") {
        let tfhd = traf
            .find(b"tfhd")
            .and_then(|atom| atom.data())
            .map(TfhdBox::parse)
            .transpose()?;
        let Some(tfhd) = tfhd else { continue };

        if let Some(old) = tfhd.base_data_offset {
            // Explicit bases are absolute stream positions.
            let shift = shift_at(old);
            if shift == 0 {
                continue;
            }

            let new = old.checked_add_signed(shift).ok_or_else(|| {
                Error::Malformed("adjusted base_data_offset shifts below zero".to_owned())
            })?;

            if let Some(data) = traf.find_mut(b"tfhd").and_then(|atom| atom.data_mut()) {
                TfhdBox::rewrite_base_data_offset(data, new)?;
            }
        } else if moof_delta != 0 {
            // Implicit bases move with the moof itself, so runs keep
            // pointing at the same media bytes when the moof shrinks.
            let Some(traf_children) = traf.children_mut() else {
                continue;
            };

            for trun_atom in traf_children
                .iter_mut()
                .filter(|atom| atom.name.0 == *b"trun")
            {
                let Some(data) = trun_atom.data_mut() else { continue };

                if TrunBox::parse(data)?.data_offset.is_some() {
                    TrunBox::rewrite_data_offset(data, moof_delta)?;
                } else {
                    warn!(
                        "trun without an explicit data_offset in a resized fragment, \
                         offsets may drift"
                    );
                }
            }
        }
    }

    Ok(())
}

/// Patch the referenced_size of sidx references to match the shrunken
/// fragments. Each sidx is matched against the moof boxes that follow it
/// up to the next sidx; anything more exotic is logged and left alone.
fn patch_sidx_references(atoms: &mut [TopAtom], deltas: &[i64]) -> Result<()> {
    let sidx_positions: Vec<usize> = atoms
        .iter()
        .enumerate()
        .filter(|(_, top)| top.header.name.0 == *b"sidx")
        .map(|(index, _)| index)
        .collect();

    for (order, &position) in sidx_positions.iter().enumerate() {
        let scope_end = sidx_positions
            .get(order + 1)
            .copied()
            .unwrap_or(atoms.len());

        let fragment_deltas: Vec<i64> = (position..scope_end)
            .filter(|index| atoms[*index].header.name.0 == *b"moof")
            .map(|index| deltas[index])
            .collect();

        let Some(data) = atoms[position]
            .tree
            .as_mut()
            .and_then(|tree| tree.data_mut())
        else {
            continue;
        };

        let sidx = SidxBox::parse(data)?;

        if sidx.references.iter().any(|reference| reference.references_index) {
            warn!("hierarchical sidx left unpatched");
            continue;
        }

        if sidx.references.len() != fragment_deltas.len() {
            warn!(
                "sidx references {} segments but {} fragments follow it, leaving it unpatched",
                sidx.references.len(),
                fragment_deltas.len()
            );
            continue;
        }

        for (reference, delta) in fragment_deltas.iter().enumerate() {
            if *delta < 0 {
                SidxBox::rewrite_referenced_size(data, reference, delta.unsigned_abs())?;
            }
        }
    }

    Ok(())
}

fn emit<R, W>(
    processor: &DecryptingProcessor,
    atoms: &[TopAtom],
    runs: &[RunPlan],
    plan: &[PlannedSample],
    src: &mut R,
    sink: &mut W,
    progress: &mut dyn ProgressListener,
) -> Result<()>
where
    R: Read + Seek,
    W: Write,
{
    let total = plan.len() as u64;
    let mut step = 0u64;
    let mut next = 0usize;
    let mut tree_buf = Vec::new();
    let mut sample_buf = Vec::new();

    for top in atoms {
        if top.removed {
            continue;
        }

        match &top.tree {
            Some(tree) => {
                tree_buf.clear();
                tree.write(&mut tree_buf)?;
                sink.write_all(&tree_buf)?;
            }
            None => {
                // mdat: stream the payload, swapping every planned
                // sample for its plaintext.
                tree_buf.clear();
                top.header.write(&mut tree_buf);
                sink.write_all(&tree_buf)?;

                let payload_end = top.header.start + top.header.size;
                let mut cursor = top.header.start + top.header.header_size;

                while next < plan.len() && plan[next].offset < payload_end {
                    let sample = &plan[next];
                    copy_range(src, sink, cursor, sample.offset - cursor)?;

                    src.seek(SeekFrom::Start(sample.offset))?;
                    sample_buf.resize(sample.size as usize, 0);
                    src.read_exact(&mut sample_buf)?;

                    match processor.decrypt_planned(&runs[sample.run], sample.index, &sample_buf)? {
                        Some(plaintext) => sink.write_all(&plaintext)?,
                        None => sink.write_all(&sample_buf)?,
                    }

                    step += 1;
                    progress.on_progress(step, total);
                    cursor = sample.offset + sample.size as u64;
                    next += 1;
                }

                copy_range(src, sink, cursor, payload_end - cursor)?;
            }
        }
    }

    Ok(())
}

fn copy_range<R, W>(src: &mut R, sink: &mut W, from: u64, length: u64) -> Result<()>
where
    R: Read + Seek,
    W: Write,
{
    if length == 0 {
        return Ok(());
    }

    src.seek(SeekFrom::Start(from))?;
    let mut buf = [0u8; 65536];
    let mut remaining = length;

    while remaining > 0 {
        let chunk = remaining.min(buf.len() as u64) as usize;
        src.read_exact(&mut buf[..chunk])?;
        sink.write_all(&buf[..chunk])?;
        remaining -= chunk as u64;
    }

    Ok(())
}
