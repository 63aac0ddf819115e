use std::{collections::HashMap, error::Error, fs, io::Cursor};

use aes::{
    Aes128,
    cipher::{BlockEncrypt, KeyInit, KeyIvInit, StreamCipher, generic_array::GenericArray},
};
use mp4cenc::{
    DecryptingProcessor, Error as Mp4Error, ProgressFn,
    atom::Atom,
    boxes::{ChunkOffsetBox, SidxBox, TrunBox},
};

type Aes128Ctr = ctr::Ctr128BE<Aes128>;

const VIDEO_KID: &str = "eb676abbcb345e96bbcf616630f1a3da";
const VIDEO_KEY: &str = "100b6c20940f779a4589152b57d2dacb";
const AUDIO_KID: &str = "63cb5f7184dd4b689a5c5ff11ee6a328";
const AUDIO_KEY: &str = "3bda3329158a4789880816a70e7e436d";

fn hex16(hex: &str) -> [u8; 16] {
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&hex::decode(hex).unwrap());
    bytes
}

// ==========================================
// Reference encryption
// ==========================================

fn ctr_stream(key: &[u8; 16], iv: &[u8]) -> Aes128Ctr {
    let mut counter_block = [0u8; 16];
    counter_block[..iv.len()].copy_from_slice(iv);
    Aes128Ctr::new(
        GenericArray::from_slice(key),
        GenericArray::from_slice(&counter_block),
    )
}

/// Encrypt one cenc sample in place. The keystream covers the encrypted
/// subsample spans only and runs continuously across them; empty maps
/// encrypt the whole sample.
fn ctr_encrypt_sample(key: &[u8; 16], iv: &[u8], data: &mut [u8], subsamples: &[(u16, u32)]) {
    let mut stream = ctr_stream(key, iv);

    if subsamples.is_empty() {
        stream.apply_keystream(data);
        return;
    }

    let mut position = 0usize;
    for (clear, encrypted) in subsamples {
        position += *clear as usize;
        stream.apply_keystream(&mut data[position..(position + *encrypted as usize)]);
        position += *encrypted as usize;
    }
}

/// Encrypt one whole cens sample in place, striping the keystream over
/// crypt:skip runs of 16 byte blocks. A partial trailing crypt run is
/// still encrypted.
fn cens_encrypt_sample(key: &[u8; 16], iv: &[u8], data: &mut [u8], crypt: u8, skip: u8) {
    let mut stream = ctr_stream(key, iv);
    let crypt_size = crypt as usize * 16;
    let skip_size = skip as usize * 16;
    let mut position = 0usize;

    while position < data.len() {
        let run = (data.len() - position).min(crypt_size);
        if run > 0 {
            stream.apply_keystream(&mut data[position..(position + run)]);
            position += run;
        }

        if position >= data.len() {
            break;
        }

        position += (data.len() - position).min(skip_size);
    }
}

/// CBC encrypt the whole blocks of `data` in place, continuing the given
/// chain. A partial trailing block stays clear.
fn cbc_encrypt_blocks(aes: &Aes128, chain: &mut [u8; 16], data: &mut [u8]) {
    for start in (0..data.len() / 16 * 16).step_by(16) {
        for offset in 0..16 {
            data[start + offset] ^= chain[offset];
        }

        let mut block = GenericArray::clone_from_slice(&data[start..(start + 16)]);
        aes.encrypt_block(&mut block);
        data[start..(start + 16)].copy_from_slice(&block);
        chain.copy_from_slice(&block);
    }
}

/// Encrypt one whole cbcs sample in place with a crypt:skip pattern. The
/// chain starts at the IV and continues across the crypt runs.
fn cbcs_encrypt_sample(key: &[u8; 16], iv: &[u8; 16], data: &mut [u8], crypt: u8, skip: u8) {
    let aes = Aes128::new(GenericArray::from_slice(key));
    let mut chain = *iv;
    let crypt_size = crypt as usize * 16;
    let skip_size = skip as usize * 16;
    let mut position = 0usize;

    while position < data.len() {
        let run = (data.len() - position).min(crypt_size);
        if run > 0 {
            cbc_encrypt_blocks(&aes, &mut chain, &mut data[position..(position + run)]);
            position += run;
        }

        if position >= data.len() {
            break;
        }

        position += (data.len() - position).min(skip_size);
    }
}

/// Encrypt one cbc1 sample in place. The chain starts at the IV and
/// continues across the encrypted subsample spans.
fn cbc1_encrypt_sample(key: &[u8; 16], iv: &[u8; 16], data: &mut [u8], subsamples: &[(u16, u32)]) {
    let aes = Aes128::new(GenericArray::from_slice(key));
    let mut chain = *iv;
    let mut position = 0usize;

    for (clear, encrypted) in subsamples {
        position += *clear as usize;
        cbc_encrypt_blocks(
            &aes,
            &mut chain,
            &mut data[position..(position + *encrypted as usize)],
        );
        position += *encrypted as usize;
    }
}

// ==========================================
// Box builders
// ==========================================

fn full_box(version: u8, flags: u32) -> Vec<u8> {
    (((version as u32) << 24) | flags).to_be_bytes().to_vec()
}

fn tenc_payload(
    iv_size: u8,
    kid: &[u8; 16],
    pattern: Option<(u8, u8)>,
    constant_iv: Option<&[u8]>,
) -> Vec<u8> {
    let mut data = full_box(if pattern.is_some() { 1 } else { 0 }, 0);
    data.push(0);
    data.push(
        pattern
            .map(|(crypt, skip)| (crypt << 4) | skip)
            .unwrap_or(0),
    );
    data.push(1);
    data.push(iv_size);
    data.extend_from_slice(kid);

    if let Some(iv) = constant_iv {
        data.push(iv.len() as u8);
        data.extend_from_slice(iv);
    }

    data
}

fn schm_payload(scheme: &[u8; 4]) -> Vec<u8> {
    let mut data = full_box(0, 0);
    data.extend_from_slice(scheme);
    data.extend_from_slice(&0x0001_0000u32.to_be_bytes());
    data
}

fn sinf_atom(original: &[u8; 4], scheme: &[u8; 4], tenc: Vec<u8>) -> Atom {
    Atom::container(
        b"sinf",
        vec![
            Atom::leaf(b"frma", original.to_vec()),
            Atom::leaf(b"schm", schm_payload(scheme)),
            Atom::container(b"schi", vec![Atom::leaf(b"tenc", tenc)]),
        ],
    )
}

fn encv_entry(scheme: &[u8; 4], tenc: Vec<u8>) -> Atom {
    Atom::prefixed(b"encv", vec![0u8; 78], vec![sinf_atom(b"avc1", scheme, tenc)])
}

fn enca_entry(scheme: &[u8; 4], tenc: Vec<u8>) -> Atom {
    Atom::prefixed(b"enca", vec![0u8; 28], vec![sinf_atom(b"mp4a", scheme, tenc)])
}

fn stsd_atom(entries: Vec<Atom>) -> Atom {
    let mut prefix = full_box(0, 0);
    prefix.extend_from_slice(&(entries.len() as u32).to_be_bytes());
    Atom::prefixed(b"stsd", prefix, entries)
}

fn tkhd_atom(track_id: u32) -> Atom {
    let mut data = full_box(0, 7);
    data.extend_from_slice(&[0u8; 8]);
    data.extend_from_slice(&track_id.to_be_bytes());
    data.extend_from_slice(&[0u8; 68]);
    Atom::leaf(b"tkhd", data)
}

fn stsz_payload(sizes: &[u32]) -> Vec<u8> {
    let mut data = full_box(0, 0);
    data.extend_from_slice(&0u32.to_be_bytes());
    data.extend_from_slice(&(sizes.len() as u32).to_be_bytes());
    for size in sizes {
        data.extend_from_slice(&size.to_be_bytes());
    }
    data
}

/// (first_chunk, samples_per_chunk) entries, description index 1.
fn stsc_payload(entries: &[(u32, u32)]) -> Vec<u8> {
    let mut data = full_box(0, 0);
    data.extend_from_slice(&(entries.len() as u32).to_be_bytes());
    for (first_chunk, samples_per_chunk) in entries {
        data.extend_from_slice(&first_chunk.to_be_bytes());
        data.extend_from_slice(&samples_per_chunk.to_be_bytes());
        data.extend_from_slice(&1u32.to_be_bytes());
    }
    data
}

fn stco_payload(offsets: &[u32]) -> Vec<u8> {
    let mut data = full_box(0, 0);
    data.extend_from_slice(&(offsets.len() as u32).to_be_bytes());
    for offset in offsets {
        data.extend_from_slice(&offset.to_be_bytes());
    }
    data
}

fn senc_payload(samples: &[(&[u8], &[(u16, u32)])]) -> Vec<u8> {
    let has_subsamples = samples.iter().any(|(_, subsamples)| !subsamples.is_empty());
    let mut data = full_box(0, if has_subsamples { 2 } else { 0 });
    data.extend_from_slice(&(samples.len() as u32).to_be_bytes());

    for (iv, subsamples) in samples {
        data.extend_from_slice(iv);

        if has_subsamples {
            data.extend_from_slice(&(subsamples.len() as u16).to_be_bytes());
            for (clear, encrypted) in *subsamples {
                data.extend_from_slice(&clear.to_be_bytes());
                data.extend_from_slice(&encrypted.to_be_bytes());
            }
        }
    }

    data
}

fn saiz_payload(default_size: u8, sample_count: u32) -> Vec<u8> {
    let mut data = full_box(0, 0);
    data.push(default_size);
    data.extend_from_slice(&sample_count.to_be_bytes());
    data
}

fn saio_payload(offsets: &[u32]) -> Vec<u8> {
    let mut data = full_box(0, 0);
    data.extend_from_slice(&(offsets.len() as u32).to_be_bytes());
    for offset in offsets {
        data.extend_from_slice(&offset.to_be_bytes());
    }
    data
}

/// (pattern byte, is_protected, iv_size, kid) seig entries with the
/// fixed 20 byte layout.
fn seig_sgpd_payload(entries: &[(u8, bool, u8, [u8; 16])]) -> Vec<u8> {
    let mut data = full_box(1, 0);
    data.extend_from_slice(b"seig");
    data.extend_from_slice(&20u32.to_be_bytes());
    data.extend_from_slice(&(entries.len() as u32).to_be_bytes());

    for (pattern, is_protected, iv_size, kid) in entries {
        data.push(0);
        data.push(*pattern);
        data.push(*is_protected as u8);
        data.push(*iv_size);
        data.extend_from_slice(kid);
    }

    data
}

fn seig_sbgp_payload(entries: &[(u32, u32)]) -> Vec<u8> {
    let mut data = full_box(0, 0);
    data.extend_from_slice(b"seig");
    data.extend_from_slice(&(entries.len() as u32).to_be_bytes());

    for (sample_count, group_index) in entries {
        data.extend_from_slice(&sample_count.to_be_bytes());
        data.extend_from_slice(&group_index.to_be_bytes());
    }

    data
}

fn sidx_payload(referenced_sizes: &[u32]) -> Vec<u8> {
    let mut data = full_box(0, 0);
    data.extend_from_slice(&1u32.to_be_bytes());
    data.extend_from_slice(&90000u32.to_be_bytes());
    data.extend_from_slice(&0u32.to_be_bytes());
    data.extend_from_slice(&0u32.to_be_bytes());
    data.extend_from_slice(&0u16.to_be_bytes());
    data.extend_from_slice(&(referenced_sizes.len() as u16).to_be_bytes());

    for size in referenced_sizes {
        data.extend_from_slice(&size.to_be_bytes());
        data.extend_from_slice(&180000u32.to_be_bytes());
        data.extend_from_slice(&0x9000_0000u32.to_be_bytes());
    }

    data
}

fn pssh_atom() -> Atom {
    let mut data = full_box(0, 0);
    data.extend_from_slice(&[0xAB; 16]);
    data.extend_from_slice(&0u32.to_be_bytes());
    Atom::leaf(b"pssh", data)
}

fn ftyp_atom() -> Atom {
    let mut data = Vec::new();
    data.extend_from_slice(b"isom");
    data.extend_from_slice(&512u32.to_be_bytes());
    data.extend_from_slice(b"isomiso2avc1mp41");
    Atom::leaf(b"ftyp", data)
}

// ==========================================
// File assembly
// ==========================================

fn serialize(atoms: &[Atom]) -> Vec<u8> {
    let mut out = Vec::new();
    for atom in atoms {
        atom.write(&mut out).unwrap();
    }
    out
}

fn trak_atom(track_id: u32, stbl: Vec<Atom>) -> Atom {
    Atom::container(
        b"trak",
        vec![
            tkhd_atom(track_id),
            Atom::container(
                b"mdia",
                vec![Atom::container(
                    b"minf",
                    vec![Atom::container(b"stbl", stbl)],
                )],
            ),
        ],
    )
}

/// Assemble ftyp + moov + mdat, handing the absolute mdat payload start
/// to the moov builder so chunk offsets can point into it. Box sizes do
/// not depend on offset values, so one probe pass settles the layout.
fn layout(moov_for: impl Fn(u32) -> Atom, mdat_payload: Vec<u8>) -> Vec<u8> {
    let ftyp = ftyp_atom();
    let payload_start = (ftyp.size() + moov_for(0).size() + 8) as u32;

    let mut out = Vec::new();
    ftyp.write(&mut out).unwrap();
    moov_for(payload_start).write(&mut out).unwrap();
    Atom::leaf(b"mdat", mdat_payload).write(&mut out).unwrap();
    out
}

/// Init style moov for fragmented streams: one track with empty sample
/// tables plus an mvex/trex pair.
fn init_moov(entry: Atom, track_id: u32) -> Atom {
    let mut trex = full_box(0, 0);
    trex.extend_from_slice(&track_id.to_be_bytes());
    trex.extend_from_slice(&1u32.to_be_bytes());
    trex.extend_from_slice(&1000u32.to_be_bytes());
    trex.extend_from_slice(&0u32.to_be_bytes());
    trex.extend_from_slice(&0u32.to_be_bytes());

    Atom::container(
        b"moov",
        vec![
            trak_atom(
                track_id,
                vec![
                    stsd_atom(vec![entry]),
                    Atom::leaf(b"stsz", stsz_payload(&[])),
                    Atom::leaf(b"stsc", stsc_payload(&[])),
                    Atom::leaf(b"stco", stco_payload(&[])),
                ],
            ),
            Atom::container(b"mvex", vec![Atom::leaf(b"trex", trex)]),
        ],
    )
}

/// One moof with a single traf: implicit moof relative base, one trun
/// with explicit data offset and sample sizes, and an optional senc.
fn fragment(
    sequence: u32,
    track_id: u32,
    trun_offset: i32,
    sample_sizes: &[u32],
    senc: Option<Vec<u8>>,
) -> Atom {
    let mut mfhd = full_box(0, 0);
    mfhd.extend_from_slice(&sequence.to_be_bytes());

    let mut tfhd = full_box(0, 0x020000);
    tfhd.extend_from_slice(&track_id.to_be_bytes());

    let mut trun = full_box(0, 0x0201);
    trun.extend_from_slice(&(sample_sizes.len() as u32).to_be_bytes());
    trun.extend_from_slice(&trun_offset.to_be_bytes());
    for size in sample_sizes {
        trun.extend_from_slice(&size.to_be_bytes());
    }

    let mut traf = vec![Atom::leaf(b"tfhd", tfhd), Atom::leaf(b"trun", trun)];
    if let Some(senc) = senc {
        traf.push(Atom::leaf(b"senc", senc));
    }

    Atom::container(
        b"moof",
        vec![Atom::leaf(b"mfhd", mfhd), Atom::container(b"traf", traf)],
    )
}

/// The shared unfragmented cenc fixture: three subsample mapped samples
/// in one chunk, keyed with VIDEO_KID. Returns the encrypted file and
/// the expected decrypted file.
fn cenc_unfragmented_file() -> (Vec<u8>, Vec<u8>) {
    let key = hex16(VIDEO_KEY);
    let kid = hex16(VIDEO_KID);

    let plain: [Vec<u8>; 3] = [
        (0u8..25).collect(),
        (100u8..140).collect(),
        (200u8..221).collect(),
    ];
    let maps: [&[(u16, u32)]; 3] = [&[(9, 16)], &[(8, 32)], &[(5, 16)]];
    let ivs: [[u8; 8]; 3] = [[0x01; 8], [0x02; 8], [0x03; 8]];

    let mut encrypted_payload = Vec::new();
    let mut plain_payload = Vec::new();
    for index in 0..3 {
        let mut sample = plain[index].clone();
        ctr_encrypt_sample(&key, &ivs[index], &mut sample, maps[index]);
        encrypted_payload.extend_from_slice(&sample);
        plain_payload.extend_from_slice(&plain[index]);
    }

    let sizes = [25u32, 40, 21];
    let senc = senc_payload(&[
        (&ivs[0], maps[0]),
        (&ivs[1], maps[1]),
        (&ivs[2], maps[2]),
    ]);

    let file = layout(
        |offset| {
            Atom::container(
                b"moov",
                vec![trak_atom(
                    1,
                    vec![
                        stsd_atom(vec![encv_entry(b"cenc", tenc_payload(8, &kid, None, None))]),
                        Atom::leaf(b"stsz", stsz_payload(&sizes)),
                        Atom::leaf(b"stsc", stsc_payload(&[(1, 3)])),
                        Atom::leaf(b"stco", stco_payload(&[offset])),
                        Atom::leaf(b"senc", senc.clone()),
                    ],
                )],
            )
        },
        encrypted_payload,
    );

    let expected = layout(
        |offset| {
            Atom::container(
                b"moov",
                vec![trak_atom(
                    1,
                    vec![
                        stsd_atom(vec![Atom::prefixed(b"avc1", vec![0u8; 78], vec![])]),
                        Atom::leaf(b"stsz", stsz_payload(&sizes)),
                        Atom::leaf(b"stsc", stsc_payload(&[(1, 3)])),
                        Atom::leaf(b"stco", stco_payload(&[offset])),
                    ],
                )],
            )
        },
        plain_payload,
    );

    (file, expected)
}

fn video_processor() -> DecryptingProcessor {
    DecryptingProcessor::builder()
        .key(VIDEO_KID, VIDEO_KEY)
        .unwrap()
        .build()
        .unwrap()
}

// ==========================================
// CTR schemes
// ==========================================

#[test]
fn test_cenc_unfragmented() -> Result<(), Box<dyn Error>> {
    let (file, expected) = cenc_unfragmented_file();
    let out = video_processor().decrypt(&file)?;
    assert_eq!(out, expected);

    // The rewritten movie restores the clear sample entry and sheds the
    // protection boxes.
    let atoms = Atom::parse_all(&out, 0)?;
    let moov = atoms.iter().find(|atom| atom.name.0 == *b"moov").unwrap();
    let stbl = moov
        .find_path(&[b"trak", b"mdia", b"minf", b"stbl"])
        .unwrap();
    let entry = &stbl.find(b"stsd").unwrap().children()[0];
    assert_eq!(entry.name.0, *b"avc1");
    assert!(stbl.find(b"senc").is_none());

    let mdat = atoms.iter().find(|atom| atom.name.0 == *b"mdat").unwrap();
    let offsets = ChunkOffsetBox::parse(stbl.find(b"stco").unwrap().data().unwrap(), false)?;
    assert_eq!(offsets.offsets, vec![mdat.start + 8]);
    Ok(())
}

#[test]
fn test_cens_pattern_partial_tail() -> Result<(), Box<dyn Error>> {
    let key = hex16(VIDEO_KEY);
    let kid = hex16(VIDEO_KID);

    // 72 bytes under a 2:2 pattern: 32 encrypted, 32 clear, then a
    // partial 8 byte crypt run that is still encrypted. The 41 byte
    // sample ends inside its first skip run.
    let plain: [Vec<u8>; 2] = [(0u8..72).collect(), (100u8..141).collect()];
    let ivs: [[u8; 8]; 2] = [[0x11; 8], [0x22; 8]];

    let mut payload = Vec::new();
    for index in 0..2 {
        let mut sample = plain[index].clone();
        cens_encrypt_sample(&key, &ivs[index], &mut sample, 2, 2);
        payload.extend_from_slice(&sample);
    }

    let senc = senc_payload(&[(&ivs[0], &[]), (&ivs[1], &[])]);
    let file = layout(
        |offset| {
            Atom::container(
                b"moov",
                vec![trak_atom(
                    1,
                    vec![
                        stsd_atom(vec![encv_entry(
                            b"cens",
                            tenc_payload(8, &kid, Some((2, 2)), None),
                        )]),
                        Atom::leaf(b"stsz", stsz_payload(&[72, 41])),
                        Atom::leaf(b"stsc", stsc_payload(&[(1, 2)])),
                        Atom::leaf(b"stco", stco_payload(&[offset])),
                        Atom::leaf(b"senc", senc.clone()),
                    ],
                )],
            )
        },
        payload,
    );

    let out = video_processor().decrypt(&file)?;
    let atoms = Atom::parse_all(&out, 0)?;
    let mdat = atoms.iter().find(|atom| atom.name.0 == *b"mdat").unwrap();
    assert_eq!(mdat.data().unwrap(), &[plain[0].clone(), plain[1].clone()].concat());
    Ok(())
}

#[test]
fn test_cenc_aux_records() -> Result<(), Box<dyn Error>> {
    let key = hex16(VIDEO_KEY);
    let kid = hex16(VIDEO_KID);

    // No senc box. The IVs live as raw auxiliary records at the start of
    // the mdat payload, located through one contiguous saio offset.
    let plain: [Vec<u8>; 2] = [(0u8..30).collect(), (50u8..100).collect()];
    let ivs: [[u8; 8]; 2] = [[0x31; 8], [0x32; 8]];

    let mut records = Vec::new();
    records.extend_from_slice(&ivs[0]);
    records.extend_from_slice(&ivs[1]);

    let mut payload = records.clone();
    for index in 0..2 {
        let mut sample = plain[index].clone();
        ctr_encrypt_sample(&key, &ivs[index], &mut sample, &[]);
        payload.extend_from_slice(&sample);
    }

    let file = layout(
        |payload_start| {
            Atom::container(
                b"moov",
                vec![trak_atom(
                    1,
                    vec![
                        stsd_atom(vec![encv_entry(b"cenc", tenc_payload(8, &kid, None, None))]),
                        Atom::leaf(b"stsz", stsz_payload(&[30, 50])),
                        Atom::leaf(b"stsc", stsc_payload(&[(1, 2)])),
                        Atom::leaf(b"stco", stco_payload(&[payload_start + 16])),
                        Atom::leaf(b"saiz", saiz_payload(8, 2)),
                        Atom::leaf(b"saio", saio_payload(&[payload_start])),
                    ],
                )],
            )
        },
        payload,
    );

    let out = video_processor().decrypt(&file)?;
    let atoms = Atom::parse_all(&out, 0)?;

    // The record bytes stay in the mdat, only the samples change.
    let mdat = atoms.iter().find(|atom| atom.name.0 == *b"mdat").unwrap();
    let mut expected_payload = records;
    expected_payload.extend_from_slice(&plain[0]);
    expected_payload.extend_from_slice(&plain[1]);
    assert_eq!(mdat.data().unwrap(), &expected_payload);

    let moov = atoms.iter().find(|atom| atom.name.0 == *b"moov").unwrap();
    let stbl = moov
        .find_path(&[b"trak", b"mdia", b"minf", b"stbl"])
        .unwrap();
    assert!(stbl.find(b"saiz").is_none());
    assert!(stbl.find(b"saio").is_none());

    let offsets = ChunkOffsetBox::parse(stbl.find(b"stco").unwrap().data().unwrap(), false)?;
    assert_eq!(offsets.offsets, vec![mdat.start + 8 + 16]);
    Ok(())
}

#[test]
fn test_cenc_fragmented() -> Result<(), Box<dyn Error>> {
    let key = hex16(VIDEO_KEY);
    let kid = hex16(VIDEO_KID);

    let plain1: [Vec<u8>; 2] = [(0u8..25).collect(), (30u8..70).collect()];
    let plain2: [Vec<u8>; 2] = [(80u8..113).collect(), (120u8..148).collect()];
    let maps1: [&[(u16, u32)]; 2] = [&[(9, 16)], &[(8, 32)]];
    let maps2: [&[(u16, u32)]; 2] = [&[(9, 24)], &[(12, 16)]];
    let ivs1: [[u8; 8]; 2] = [[0xA1; 8], [0xA2; 8]];
    let ivs2: [[u8; 8]; 2] = [[0xB1; 8], [0xB2; 8]];

    let encrypt = |plain: &[Vec<u8>; 2], ivs: &[[u8; 8]; 2], maps: &[&[(u16, u32)]; 2]| {
        let mut payload = Vec::new();
        for index in 0..2 {
            let mut sample = plain[index].clone();
            ctr_encrypt_sample(&key, &ivs[index], &mut sample, maps[index]);
            payload.extend_from_slice(&sample);
        }
        payload
    };

    let senc1 = senc_payload(&[(&ivs1[0], maps1[0]), (&ivs1[1], maps1[1])]);
    let senc2 = senc_payload(&[(&ivs2[0], maps2[0]), (&ivs2[1], maps2[1])]);
    let sizes1 = [25u32, 40];
    let sizes2 = [33u32, 28];

    // The trun data offset is relative to the moof start and points
    // right behind the mdat header.
    let probe1 = fragment(1, 1, 0, &sizes1, Some(senc1.clone())).size() as i32;
    let probe2 = fragment(2, 1, 0, &sizes2, Some(senc2.clone())).size() as i32;
    let entry = encv_entry(b"cenc", tenc_payload(8, &kid, None, None));

    let file = serialize(&[ftyp_atom(), init_moov(entry, 1)])
        .into_iter()
        .chain(serialize(&[
            fragment(1, 1, probe1 + 8, &sizes1, Some(senc1)),
            Atom::leaf(b"mdat", encrypt(&plain1, &ivs1, &maps1)),
            fragment(2, 1, probe2 + 8, &sizes2, Some(senc2)),
            Atom::leaf(b"mdat", encrypt(&plain2, &ivs2, &maps2)),
        ]))
        .collect::<Vec<u8>>();

    let out = video_processor().decrypt(&file)?;

    // Dropping each senc shrinks its moof, and the trun offsets move
    // with it so they keep pointing at the mdat payload.
    let lean1 = fragment(1, 1, 0, &sizes1, None).size() as i32;
    let lean2 = fragment(2, 1, 0, &sizes2, None).size() as i32;
    let clear_entry = Atom::prefixed(b"avc1", vec![0u8; 78], vec![]);

    let expected = serialize(&[ftyp_atom(), init_moov(clear_entry, 1)])
        .into_iter()
        .chain(serialize(&[
            fragment(1, 1, lean1 + 8, &sizes1, None),
            Atom::leaf(b"mdat", [plain1[0].clone(), plain1[1].clone()].concat()),
            fragment(2, 1, lean2 + 8, &sizes2, None),
            Atom::leaf(b"mdat", [plain2[0].clone(), plain2[1].clone()].concat()),
        ]))
        .collect::<Vec<u8>>();

    assert_eq!(out, expected);
    Ok(())
}

// ==========================================
// CBC schemes
// ==========================================

#[test]
fn test_cbcs_constant_iv_pattern() -> Result<(), Box<dyn Error>> {
    let key = hex16(VIDEO_KEY);
    let kid = hex16(VIDEO_KID);
    let constant_iv = [0x44u8; 16];

    // Whole sample 1:9 pattern, no per sample info at all: the constant
    // IV restarts the chain on every sample.
    let plain: [Vec<u8>; 2] = [(0u8..48).collect(), (60u8..95).collect()];

    let mut payload = Vec::new();
    for sample in &plain {
        let mut sample = sample.clone();
        cbcs_encrypt_sample(&key, &constant_iv, &mut sample, 1, 9);
        payload.extend_from_slice(&sample);
    }

    let file = layout(
        |offset| {
            Atom::container(
                b"moov",
                vec![trak_atom(
                    1,
                    vec![
                        stsd_atom(vec![encv_entry(
                            b"cbcs",
                            tenc_payload(0, &kid, Some((1, 9)), Some(&constant_iv)),
                        )]),
                        Atom::leaf(b"stsz", stsz_payload(&[48, 35])),
                        Atom::leaf(b"stsc", stsc_payload(&[(1, 2)])),
                        Atom::leaf(b"stco", stco_payload(&[offset])),
                    ],
                )],
            )
        },
        payload,
    );

    let processor = DecryptingProcessor::builder()
        .key_bytes(kid, key)
        .build()?;
    let out = processor.decrypt(&file)?;

    let atoms = Atom::parse_all(&out, 0)?;
    let mdat = atoms.iter().find(|atom| atom.name.0 == *b"mdat").unwrap();
    assert_eq!(mdat.data().unwrap(), &[plain[0].clone(), plain[1].clone()].concat());

    let moov = atoms.iter().find(|atom| atom.name.0 == *b"moov").unwrap();
    let entry = &moov
        .find_path(&[b"trak", b"mdia", b"minf", b"stbl", b"stsd"])
        .unwrap()
        .children()[0];
    assert_eq!(entry.name.0, *b"avc1");
    Ok(())
}

#[test]
fn test_cbc1_aligned_subsamples() -> Result<(), Box<dyn Error>> {
    let key = hex16(VIDEO_KEY);
    let kid = hex16(VIDEO_KID);

    // cbc1 chains across the encrypted spans of a sample, and every span
    // must be block aligned.
    let plain: [Vec<u8>; 2] = [(0u8..40).collect(), (50u8..74).collect()];
    let maps: [&[(u16, u32)]; 2] = [&[(8, 16), (0, 16)], &[(8, 16)]];
    let ivs: [[u8; 16]; 2] = [[0x51; 16], [0x52; 16]];

    let mut payload = Vec::new();
    for index in 0..2 {
        let mut sample = plain[index].clone();
        cbc1_encrypt_sample(&key, &ivs[index], &mut sample, maps[index]);
        payload.extend_from_slice(&sample);
    }

    let senc = senc_payload(&[(&ivs[0], maps[0]), (&ivs[1], maps[1])]);
    let file = layout(
        |offset| {
            Atom::container(
                b"moov",
                vec![trak_atom(
                    1,
                    vec![
                        stsd_atom(vec![encv_entry(b"cbc1", tenc_payload(16, &kid, None, None))]),
                        Atom::leaf(b"stsz", stsz_payload(&[40, 24])),
                        Atom::leaf(b"stsc", stsc_payload(&[(1, 2)])),
                        Atom::leaf(b"stco", stco_payload(&[offset])),
                        Atom::leaf(b"senc", senc.clone()),
                    ],
                )],
            )
        },
        payload,
    );

    let out = video_processor().decrypt(&file)?;
    let atoms = Atom::parse_all(&out, 0)?;
    let mdat = atoms.iter().find(|atom| atom.name.0 == *b"mdat").unwrap();
    assert_eq!(mdat.data().unwrap(), &[plain[0].clone(), plain[1].clone()].concat());
    Ok(())
}

#[test]
fn test_cbc1_unaligned_fails() {
    let kid = hex16(VIDEO_KID);

    let senc = senc_payload(&[(&[0x51; 16], &[(9, 20)])]);
    let file = layout(
        |offset| {
            Atom::container(
                b"moov",
                vec![trak_atom(
                    1,
                    vec![
                        stsd_atom(vec![encv_entry(b"cbc1", tenc_payload(16, &kid, None, None))]),
                        Atom::leaf(b"stsz", stsz_payload(&[29])),
                        Atom::leaf(b"stsc", stsc_payload(&[(1, 1)])),
                        Atom::leaf(b"stco", stco_payload(&[offset])),
                        Atom::leaf(b"senc", senc.clone()),
                    ],
                )],
            )
        },
        vec![0u8; 29],
    );

    assert!(matches!(
        video_processor().decrypt(&file),
        Err(Mp4Error::Malformed(_))
    ));
}

// ==========================================
// Stream structure
// ==========================================

#[test]
fn test_segment_with_init() -> Result<(), Box<dyn Error>> {
    let key = hex16(VIDEO_KEY);
    let kid = hex16(VIDEO_KID);

    let plain: [Vec<u8>; 2] = [(0u8..25).collect(), (30u8..70).collect()];
    let maps: [&[(u16, u32)]; 2] = [&[(9, 16)], &[(8, 32)]];
    let ivs: [[u8; 8]; 2] = [[0xC1; 8], [0xC2; 8]];

    let mut payload = Vec::new();
    for index in 0..2 {
        let mut sample = plain[index].clone();
        ctr_encrypt_sample(&key, &ivs[index], &mut sample, maps[index]);
        payload.extend_from_slice(&sample);
    }

    let entry = encv_entry(b"cenc", tenc_payload(8, &kid, None, None));
    let init = serialize(&[ftyp_atom(), init_moov(entry, 1)]);

    let styp = Atom::leaf(b"styp", {
        let mut data = Vec::new();
        data.extend_from_slice(b"msdh");
        data.extend_from_slice(&0u32.to_be_bytes());
        data.extend_from_slice(b"msdhmsix");
        data
    });

    let senc = senc_payload(&[(&ivs[0], maps[0]), (&ivs[1], maps[1])]);
    let sizes = [25u32, 40];
    let probe = fragment(1, 1, 0, &sizes, Some(senc.clone())).size() as i32;
    let segment = serialize(&[
        styp.clone(),
        fragment(1, 1, probe + 8, &sizes, Some(senc)),
        Atom::leaf(b"mdat", payload),
    ]);

    let out = video_processor().decrypt_segment(&segment, &init)?;

    let lean = fragment(1, 1, 0, &sizes, None).size() as i32;
    let expected = serialize(&[
        styp,
        fragment(1, 1, lean + 8, &sizes, None),
        Atom::leaf(b"mdat", [plain[0].clone(), plain[1].clone()].concat()),
    ]);
    assert_eq!(out, expected);
    Ok(())
}

#[test]
fn test_multi_track_keys() -> Result<(), Box<dyn Error>> {
    let video_key = hex16(VIDEO_KEY);
    let video_kid = hex16(VIDEO_KID);
    let audio_key = hex16(AUDIO_KEY);
    let audio_kid = hex16(AUDIO_KID);

    let video_plain: [Vec<u8>; 2] = [(0u8..25).collect(), (30u8..70).collect()];
    let audio_plain: [Vec<u8>; 2] = [(80u8..98).collect(), (110u8..132).collect()];
    let video_maps: [&[(u16, u32)]; 2] = [&[(9, 16)], &[(8, 32)]];
    let video_ivs: [[u8; 8]; 2] = [[0x61; 8], [0x62; 8]];
    let audio_ivs: [[u8; 8]; 2] = [[0x71; 8], [0x72; 8]];

    // One chunk per track, video first, audio behind it.
    let mut payload = Vec::new();
    for index in 0..2 {
        let mut sample = video_plain[index].clone();
        ctr_encrypt_sample(&video_key, &video_ivs[index], &mut sample, video_maps[index]);
        payload.extend_from_slice(&sample);
    }
    let audio_chunk_skip = payload.len() as u32;
    for index in 0..2 {
        let mut sample = audio_plain[index].clone();
        ctr_encrypt_sample(&audio_key, &audio_ivs[index], &mut sample, &[]);
        payload.extend_from_slice(&sample);
    }

    let video_senc = senc_payload(&[(&video_ivs[0], video_maps[0]), (&video_ivs[1], video_maps[1])]);
    let audio_senc = senc_payload(&[(&audio_ivs[0], &[]), (&audio_ivs[1], &[])]);

    let file = layout(
        |payload_start| {
            Atom::container(
                b"moov",
                vec![
                    trak_atom(
                        1,
                        vec![
                            stsd_atom(vec![encv_entry(
                                b"cenc",
                                tenc_payload(8, &video_kid, None, None),
                            )]),
                            Atom::leaf(b"stsz", stsz_payload(&[25, 40])),
                            Atom::leaf(b"stsc", stsc_payload(&[(1, 2)])),
                            Atom::leaf(b"stco", stco_payload(&[payload_start])),
                            Atom::leaf(b"senc", video_senc.clone()),
                        ],
                    ),
                    trak_atom(
                        2,
                        vec![
                            stsd_atom(vec![enca_entry(
                                b"cenc",
                                tenc_payload(8, &audio_kid, None, None),
                            )]),
                            Atom::leaf(b"stsz", stsz_payload(&[18, 22])),
                            Atom::leaf(b"stsc", stsc_payload(&[(1, 2)])),
                            Atom::leaf(b"stco", stco_payload(&[payload_start + audio_chunk_skip])),
                            Atom::leaf(b"senc", audio_senc.clone()),
                        ],
                    ),
                ],
            )
        },
        payload,
    );

    let mut keys = HashMap::new();
    keys.insert(VIDEO_KID.to_owned(), VIDEO_KEY.to_owned());
    keys.insert(AUDIO_KID.to_owned(), AUDIO_KEY.to_owned());
    let processor = DecryptingProcessor::builder().keys(&keys)?.build()?;
    let out = processor.decrypt(&file)?;

    let atoms = Atom::parse_all(&out, 0)?;
    let mdat = atoms.iter().find(|atom| atom.name.0 == *b"mdat").unwrap();
    let expected_payload = [
        video_plain[0].clone(),
        video_plain[1].clone(),
        audio_plain[0].clone(),
        audio_plain[1].clone(),
    ]
    .concat();
    assert_eq!(mdat.data().unwrap(), &expected_payload);

    let moov = atoms.iter().find(|atom| atom.name.0 == *b"moov").unwrap();
    let traks: Vec<&Atom> = moov
        .children()
        .iter()
        .filter(|atom| atom.name.0 == *b"trak")
        .collect();
    assert_eq!(traks.len(), 2);

    let entry_names: Vec<[u8; 4]> = traks
        .iter()
        .map(|trak| {
            trak.find_path(&[b"mdia", b"minf", b"stbl", b"stsd"])
                .unwrap()
                .children()[0]
                .name
                .0
        })
        .collect();
    assert_eq!(entry_names, vec![*b"avc1", *b"mp4a"]);

    // Both chunk offset tables move by the same moov shrinkage.
    for (trak, skip) in traks.iter().zip([0u32, audio_chunk_skip]) {
        let stco = trak
            .find_path(&[b"mdia", b"minf", b"stbl", b"stco"])
            .unwrap();
        let offsets = ChunkOffsetBox::parse(stco.data().unwrap(), false)?;
        assert_eq!(offsets.offsets, vec![mdat.start + 8 + skip as u64]);
    }
    Ok(())
}

#[test]
fn test_sample_group_override() -> Result<(), Box<dyn Error>> {
    let key = hex16(VIDEO_KEY);
    let kid = hex16(VIDEO_KID);

    // Sample 2 maps to a seig entry that marks it clear, the others keep
    // the tenc defaults.
    let plain: [Vec<u8>; 3] = [
        (0u8..32).collect(),
        (40u8..64).collect(),
        (70u8..102).collect(),
    ];
    let ivs: [[u8; 8]; 3] = [[0x81; 8], [0x82; 8], [0x83; 8]];

    let mut payload = Vec::new();
    for index in 0..3 {
        let mut sample = plain[index].clone();
        if index != 1 {
            ctr_encrypt_sample(&key, &ivs[index], &mut sample, &[]);
        }
        payload.extend_from_slice(&sample);
    }

    let senc = senc_payload(&[(&ivs[0], &[]), (&ivs[1], &[]), (&ivs[2], &[])]);
    let sgpd = seig_sgpd_payload(&[(0, false, 0, [0u8; 16])]);
    let sbgp = seig_sbgp_payload(&[(1, 0), (1, 1), (1, 0)]);

    let file = layout(
        |offset| {
            Atom::container(
                b"moov",
                vec![trak_atom(
                    1,
                    vec![
                        stsd_atom(vec![encv_entry(b"cenc", tenc_payload(8, &kid, None, None))]),
                        Atom::leaf(b"stsz", stsz_payload(&[32, 24, 32])),
                        Atom::leaf(b"stsc", stsc_payload(&[(1, 3)])),
                        Atom::leaf(b"stco", stco_payload(&[offset])),
                        Atom::leaf(b"senc", senc.clone()),
                        Atom::leaf(b"sgpd", sgpd.clone()),
                        Atom::leaf(b"sbgp", sbgp.clone()),
                    ],
                )],
            )
        },
        payload,
    );

    let out = video_processor().decrypt(&file)?;
    let atoms = Atom::parse_all(&out, 0)?;
    let mdat = atoms.iter().find(|atom| atom.name.0 == *b"mdat").unwrap();
    let expected_payload = [plain[0].clone(), plain[1].clone(), plain[2].clone()].concat();
    assert_eq!(mdat.data().unwrap(), &expected_payload);

    let stbl = atoms
        .iter()
        .find(|atom| atom.name.0 == *b"moov")
        .unwrap()
        .find_path(&[b"trak", b"mdia", b"minf", b"stbl"])
        .unwrap();
    assert!(stbl.find(b"sgpd").is_none());
    assert!(stbl.find(b"sbgp").is_none());
    Ok(())
}

#[test]
fn test_strip_pssh() -> Result<(), Box<dyn Error>> {
    let key = hex16(VIDEO_KEY);
    let kid = hex16(VIDEO_KID);

    let plain: Vec<u8> = (0u8..32).collect();
    let iv = [0x91u8; 8];
    let mut sample = plain.clone();
    ctr_encrypt_sample(&key, &iv, &mut sample, &[]);

    let senc = senc_payload(&[(&iv, &[])]);
    let moov_for = |offset: u32| {
        Atom::container(
            b"moov",
            vec![
                pssh_atom(),
                trak_atom(
                    1,
                    vec![
                        stsd_atom(vec![encv_entry(b"cenc", tenc_payload(8, &kid, None, None))]),
                        Atom::leaf(b"stsz", stsz_payload(&[32])),
                        Atom::leaf(b"stsc", stsc_payload(&[(1, 1)])),
                        Atom::leaf(b"stco", stco_payload(&[offset])),
                        Atom::leaf(b"senc", senc.clone()),
                    ],
                ),
            ],
        )
    };

    // moov + a second pssh at the top level, both ahead of the mdat.
    let ftyp = ftyp_atom();
    let payload_start = (ftyp.size() + moov_for(0).size() + pssh_atom().size() + 8) as u32;
    let mut file = Vec::new();
    ftyp.write(&mut file)?;
    moov_for(payload_start).write(&mut file)?;
    pssh_atom().write(&mut file)?;
    Atom::leaf(b"mdat", sample).write(&mut file)?;

    let stripping = DecryptingProcessor::builder()
        .key(VIDEO_KID, VIDEO_KEY)?
        .strip_pssh(true)
        .build()?;
    let out = stripping.decrypt(&file)?;

    let atoms = Atom::parse_all(&out, 0)?;
    assert!(!atoms.iter().any(|atom| atom.name.0 == *b"pssh"));
    let moov = atoms.iter().find(|atom| atom.name.0 == *b"moov").unwrap();
    assert!(moov.find(b"pssh").is_none());

    let mdat = atoms.iter().find(|atom| atom.name.0 == *b"mdat").unwrap();
    assert_eq!(mdat.data().unwrap(), &plain);

    let stco = moov
        .find_path(&[b"trak", b"mdia", b"minf", b"stbl", b"stco"])
        .unwrap();
    let offsets = ChunkOffsetBox::parse(stco.data().unwrap(), false)?;
    assert_eq!(offsets.offsets, vec![mdat.start + 8]);

    // By default both pssh boxes survive.
    let keeping = video_processor().decrypt(&file)?;
    let atoms = Atom::parse_all(&keeping, 0)?;
    assert!(atoms.iter().any(|atom| atom.name.0 == *b"pssh"));
    let moov = atoms.iter().find(|atom| atom.name.0 == *b"moov").unwrap();
    assert!(moov.find(b"pssh").is_some());
    Ok(())
}

#[test]
fn test_sidx_stays_consistent() -> Result<(), Box<dyn Error>> {
    let key = hex16(VIDEO_KEY);
    let kid = hex16(VIDEO_KID);

    let plain: [Vec<u8>; 2] = [(0u8..25).collect(), (30u8..70).collect()];
    let maps: [&[(u16, u32)]; 2] = [&[(9, 16)], &[(8, 32)]];
    let ivs: [[u8; 8]; 2] = [[0xD1; 8], [0xD2; 8]];

    let mut payload = Vec::new();
    for index in 0..2 {
        let mut sample = plain[index].clone();
        ctr_encrypt_sample(&key, &ivs[index], &mut sample, maps[index]);
        payload.extend_from_slice(&sample);
    }

    let senc = senc_payload(&[(&ivs[0], maps[0]), (&ivs[1], maps[1])]);
    let sizes = [25u32, 40];
    let moof_size = fragment(1, 1, 0, &sizes, Some(senc.clone())).size();
    let mdat_size = 8 + payload.len() as u64;

    let entry = encv_entry(b"cenc", tenc_payload(8, &kid, None, None));
    let file = serialize(&[
        ftyp_atom(),
        init_moov(entry, 1),
        Atom::leaf(b"sidx", sidx_payload(&[(moof_size + mdat_size) as u32])),
        fragment(1, 1, moof_size as i32 + 8, &sizes, Some(senc)),
        Atom::leaf(b"mdat", payload),
    ]);

    let out = video_processor().decrypt(&file)?;
    let atoms = Atom::parse_all(&out, 0)?;

    let new_moof_size = atoms
        .iter()
        .find(|atom| atom.name.0 == *b"moof")
        .unwrap()
        .size();
    assert!(new_moof_size < moof_size);

    let sidx = atoms.iter().find(|atom| atom.name.0 == *b"sidx").unwrap();
    let sidx = SidxBox::parse(sidx.data().unwrap())?;
    assert_eq!(
        sidx.references[0].referenced_size as u64,
        new_moof_size + mdat_size
    );

    let moof = atoms.iter().find(|atom| atom.name.0 == *b"moof").unwrap();
    let trun = moof.find_path(&[b"traf", b"trun"]).unwrap();
    assert_eq!(
        TrunBox::parse(trun.data().unwrap())?.data_offset,
        Some(new_moof_size as i32 + 8)
    );
    Ok(())
}

#[test]
fn test_clear_passthrough() -> Result<(), Box<dyn Error>> {
    // A clear file must come out byte for byte identical, without any
    // progress steps.
    let file = layout(
        |offset| {
            Atom::container(
                b"moov",
                vec![trak_atom(
                    1,
                    vec![
                        stsd_atom(vec![Atom::leaf(b"avc1", vec![0u8; 78])]),
                        Atom::leaf(b"stsz", stsz_payload(&[16, 16])),
                        Atom::leaf(b"stsc", stsc_payload(&[(1, 2)])),
                        Atom::leaf(b"stco", stco_payload(&[offset])),
                    ],
                )],
            )
        },
        (0u8..32).collect(),
    );

    let mut out = Vec::new();
    let mut steps = 0u64;
    {
        let mut progress = ProgressFn(|_, _| steps += 1);
        video_processor().process_with_progress(
            &mut Cursor::new(&file[..]),
            &mut out,
            &mut progress,
        )?;
    }

    assert_eq!(out, file);
    assert_eq!(steps, 0);
    Ok(())
}

#[test]
fn test_progress_steps() -> Result<(), Box<dyn Error>> {
    let (file, expected) = cenc_unfragmented_file();

    let mut out = Vec::new();
    let mut steps: Vec<(u64, u64)> = Vec::new();
    {
        let mut progress = ProgressFn(|step, total| steps.push((step, total)));
        video_processor().process_with_progress(
            &mut Cursor::new(&file[..]),
            &mut out,
            &mut progress,
        )?;
    }

    assert_eq!(out, expected);
    assert_eq!(steps, vec![(1, 3), (2, 3), (3, 3)]);
    Ok(())
}

// ==========================================
// Failure modes
// ==========================================

#[test]
fn test_missing_key() {
    let (file, _) = cenc_unfragmented_file();

    let processor = DecryptingProcessor::builder()
        .key(AUDIO_KID, AUDIO_KEY)
        .unwrap()
        .build()
        .unwrap();

    match processor.decrypt(&file) {
        Err(Mp4Error::KeyNotFound(kid)) => assert_eq!(kid, VIDEO_KID),
        other => panic!("expected KeyNotFound, got {:?}", other.map(|out| out.len())),
    }
}

#[test]
fn test_unknown_scheme() {
    let kid = hex16(VIDEO_KID);

    let file = layout(
        |offset| {
            Atom::container(
                b"moov",
                vec![trak_atom(
                    1,
                    vec![
                        stsd_atom(vec![encv_entry(b"abcd", tenc_payload(8, &kid, None, None))]),
                        Atom::leaf(b"stsz", stsz_payload(&[16])),
                        Atom::leaf(b"stsc", stsc_payload(&[(1, 1)])),
                        Atom::leaf(b"stco", stco_payload(&[offset])),
                    ],
                )],
            )
        },
        vec![0u8; 16],
    );

    match video_processor().decrypt(&file) {
        Err(Mp4Error::UnsupportedScheme(scheme)) => assert_eq!(scheme, "abcd"),
        other => panic!("expected UnsupportedScheme, got {:?}", other.map(|out| out.len())),
    }
}

#[test]
fn test_truncated_stream_fails() {
    let (file, _) = cenc_unfragmented_file();

    assert!(matches!(
        video_processor().decrypt(&file[..file.len() - 10]),
        Err(Mp4Error::Malformed(_))
    ));
}

// ==========================================
// Files
// ==========================================

#[test]
fn test_decrypt_file() -> Result<(), Box<dyn Error>> {
    let (file, expected) = cenc_unfragmented_file();

    let dir = std::env::temp_dir().join(format!("mp4cenc-test-{}", std::process::id()));
    fs::create_dir_all(&dir)?;
    let input = dir.join("encrypted.mp4");
    let output = dir.join("decrypted.mp4");
    fs::write(&input, &file)?;

    let written = video_processor().decrypt_file(&input, &output)?;
    let out = fs::read(&output)?;
    assert_eq!(written, out.len() as u64);
    assert_eq!(out, expected);
    assert!(!dir.join("decrypted.mp4.part").exists());

    fs::remove_dir_all(&dir).ok();
    Ok(())
}

#[test]
fn test_decrypt_file_cleans_up_on_error() -> Result<(), Box<dyn Error>> {
    let (file, _) = cenc_unfragmented_file();

    let dir = std::env::temp_dir().join(format!("mp4cenc-test-err-{}", std::process::id()));
    fs::create_dir_all(&dir)?;
    let input = dir.join("truncated.mp4");
    let output = dir.join("decrypted.mp4");
    fs::write(&input, &file[..file.len() - 10])?;

    assert!(video_processor().decrypt_file(&input, &output).is_err());
    assert!(!output.exists());
    assert!(!dir.join("decrypted.mp4.part").exists());

    fs::remove_dir_all(&dir).ok();
    Ok(())
}
