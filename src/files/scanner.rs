//! Scanner: raw bytes to atom store, single forward pass
//!
//! Each box is read as a 12-byte header (length, name, version/flags).
//! An atom's containing box is determined not from nesting syntax but by
//! geometric containment: scanning backward through already-recorded
//! atoms for the nearest preceding one whose byte range strictly
//! contains the new atom and whose structural kind permits children.
//! Hybrid boxes get fixed, hand-coded child-skip distances instead of
//! recursive descent, unless a full structural scan is requested (used
//! only for diagnostic tree printing).

use std::io::{Read, Seek, SeekFrom};

use tracing::warn;

use crate::core::atom::{Atom, AtomId, AtomName, Framing, PayloadKind, StructuralKind, UuidKind};
use crate::core::bytes::{fourcc, read_u32};
use crate::core::catalog;
use crate::core::error::{EngineError, EngineResult};
use crate::core::store::{AtomStore, MetadataStyle, ScanWarning};
use crate::core::uuid::{classify_uuid, uuid_version};

/// Pseudo-64-bit support: an extended media-data length is accepted only
/// below 4 GiB minus this headroom (room for a worst-case moov).
const EXTENDED_LENGTH_HEADROOM: u64 = 30_000_000;

/// Highest well-known version/flags value for deprecated-form uuid atoms.
const MAX_DATA_FLAG: u32 = 21;

/// Options controlling the scan.
///
/// # Example
///
/// ```rust,ignore
/// let store = scan(&mut reader, ScanOptions::default().full_structure())?;
/// ```
#[derive(Debug, Default, Clone, Copy)]
pub struct ScanOptions {
    /// Descend into sample-description codec entries. Only useful for
    /// diagnostic tree dumps; editing treats `stsd` as monolithic so
    /// unknown codecs can never corrupt a write.
    pub full_structure: bool,
}

impl ScanOptions {
    pub fn full_structure(mut self) -> Self {
        self.full_structure = true;
        self
    }
}

fn read_at<R: Read + Seek>(reader: &mut R, pos: u64, buf: &mut [u8]) -> EngineResult<()> {
    reader.seek(SeekFrom::Start(pos))?;
    reader.read_exact(buf)?;
    Ok(())
}

fn read_u16_at<R: Read + Seek>(reader: &mut R, pos: u64) -> EngineResult<u16> {
    let mut buf = [0u8; 2];
    read_at(reader, pos, &mut buf)?;
    Ok(u16::from_be_bytes(buf))
}

fn read_u32_at<R: Read + Seek>(reader: &mut R, pos: u64) -> EngineResult<u32> {
    let mut buf = [0u8; 4];
    read_at(reader, pos, &mut buf)?;
    Ok(u32::from_be_bytes(buf))
}

fn read_u64_at<R: Read + Seek>(reader: &mut R, pos: u64) -> EngineResult<u64> {
    let mut buf = [0u8; 8];
    read_at(reader, pos, &mut buf)?;
    Ok(u64::from_be_bytes(buf))
}

/// Map the major brand onto a metadata style; unsupported and unknown
/// brands are rejected before any tree is built.
fn identify_brand(store: &mut AtomStore, brand: &[u8; 4]) -> EngineResult<()> {
    store.brand = fourcc(brand);
    store.metadata_style = match store.brand {
        // QuickTime movie files are not supported
        0x7174_2020 => {
            return Err(EngineError::UnsupportedBrand(
                String::from_utf8_lossy(brand).into_owned(),
            ))
        }

        // 3GPP2
        0x3367_3261 | 0x3367_3262 | 0x6B64_6469 => MetadataStyle::ThirdGenPartnerVer2,

        // 3gp4/3gp5/mmp4: no 'albm' tag yet
        0x3367_7034 | 0x3367_7035 | 0x6D6D_7034 => MetadataStyle::ThirdGenPartner,

        // 3gp6 and its progressive/streaming/extended variants
        0x3367_7036 | 0x3367_7236 | 0x3367_7336 | 0x3367_6536 | 0x3367_6736 => {
            MetadataStyle::ThirdGenPartnerRel6
        }

        // PSP: iTunes-style metadata, but its own layout quirks
        0x4D53_4E56 => {
            store.psp_brand = true;
            MetadataStyle::Itunes
        }

        0x4D34_4120 | 0x4D34_4220 | 0x4D34_5020 | 0x4D34_5620 | 0x6D70_3432 | 0x6D70_3431
        | 0x6973_6F6D | 0x6973_6F32 | 0x6176_6331 => MetadataStyle::Itunes,

        _ => {
            return Err(EngineError::UnsupportedBrand(
                String::from_utf8_lossy(brand).into_owned(),
            ))
        }
    };
    Ok(())
}

/// The nearest preceding recorded atom whose interval strictly contains
/// `[start, start+len)` and whose kind permits children.
fn geometric_parent(store: &AtomStore, start: u32, len: u32) -> Option<AtomId> {
    for id in (0..store.len()).rev() {
        let atom = store.atom(id);
        if atom.start < start
            && atom.declared_len > len
            && atom.start.wrapping_add(atom.declared_len) >= start.wrapping_add(len)
            && atom.structure.can_contain()
        {
            return Some(id);
        }
    }
    None
}

/// 1-based nesting level of a new atom at `start`, from the byte ranges
/// of the atoms recorded so far. An atom beginning exactly where a
/// recorded atom ends is that atom's sibling.
fn geometric_depth(store: &AtomStore, start: u32) -> u8 {
    let mut level: u8 = 1;
    for id in 0..store.len() {
        let atom = store.atom(id);
        if start == atom.start.wrapping_add(atom.declared_len) {
            return atom.depth;
        }
        if start > atom.start && start < atom.start.wrapping_add(atom.declared_len) {
            level = level.saturating_add(1);
        }
    }
    level
}

/// Fixed header length of a sample-description codec entry, selected by
/// its 4-character tag; unknown codecs skip to their end.
fn codec_skip(tag: &[u8; 4], data_size: u32) -> u32 {
    match tag {
        b"mp4s" => 16,
        b"srtp" | b"rtp " => 24,
        b"alac" | b"mp4a" | b"samr" | b"sawb" | b"sawp" | b"sevc" | b"sqcp" | b"ssmv"
        | b"drms" => 36,
        b"tx3g" => 46,
        b"mp4v" | b"avc1" | b"jpeg" | b"s263" | b"drmi" => 86,
        _ => data_size,
    }
}

/// Offset of the packed 16-bit language field from the start of the box,
/// which is name-dependent; `yrrc` has none at all.
fn language_offset(tag: &[u8; 4]) -> Option<u64> {
    match tag {
        b"titl" | b"dscp" | b"cprt" | b"perf" | b"auth" | b"gnre" | b"albm" | b"kywd"
        | b"loci" => Some(12),
        b"clsf" => Some(18),
        b"rtng" => Some(20),
        _ => None,
    }
}

/// Walk the raw file once and build the atom store.
pub fn scan<R: Read + Seek>(reader: &mut R, options: ScanOptions) -> EngineResult<AtomStore> {
    let file_size = reader.seek(SeekFrom::End(0))?;
    if file_size < 12 {
        return Err(EngineError::MissingRequiredBox("ftyp"));
    }

    let mut header = [0u8; 12];
    read_at(reader, 0, &mut header)?;
    if &header[4..8] != b"ftyp" {
        return Err(EngineError::MissingRequiredBox("ftyp"));
    }

    let mut store = AtomStore::new(file_size);
    identify_brand(&mut store, &[header[8], header[9], header[10], header[11]])?;

    let ftyp_len = read_u32(&header, 0);
    store.push_scanned(Atom {
        start: 0,
        declared_len: ftyp_len,
        extended_len: 0,
        name: AtomName::Fourcc(*b"ftyp"),
        structure: StructuralKind::Leaf,
        framing: Framing::Simple,
        depth: 1,
        payload: None,
        successor: None,
        reverse_dns_tag: None,
        codec_hint: 0,
    });

    let mut jump = ftyp_len as u64;
    while jump < file_size {
        if file_size - jump < 8 {
            break;
        }
        let header_len = (file_size - jump).min(12) as usize;
        read_at(reader, jump, &mut header[..header_len])?;

        let mut data_size = read_u32(&header, 0);
        let tag = [header[4], header[5], header[6], header[7]];

        if data_size as u64 > file_size {
            data_size = (file_size - jump) as u32;
        }

        // trailing all-zero padding outside any box, left by some encoders
        if data_size == 0 && tag == [0, 0, 0, 0] {
            store.gapless_padding = file_size - jump;
            break;
        }

        // known corruption signature from third-party taggers: a 'data'
        // child declared longer than its parent; the clamp to
        // parent.length - 8 is unverified for parents with headers over
        // 12 bytes, but matches every observed case
        let mut corrupted = false;
        if tag == *b"data" && !store.is_empty() {
            let prev = store.atom(store.len() - 1);
            if prev.structure == StructuralKind::Parent && data_size > prev.declared_len {
                let clamped = prev.declared_len.saturating_sub(8);
                warn!(
                    parent = %prev.name.display(),
                    clamped, "corrupt 'data' child length; clamping to parent"
                );
                store.warnings.push(ScanWarning::CorruptChildLength {
                    parent: prev.name,
                    clamped_to: clamped,
                });
                data_size = clamped;
                corrupted = true;
            }
        }

        let parent_id = geometric_parent(&store, jump as u32, data_size);
        let parent_tag = parent_id.and_then(|p| store.atom(p).name.tag().copied());
        let depth = geometric_depth(&store, jump as u32);

        let candidate_path = if tag == *b"data" || tag == *b"esds" {
            parent_id.map(|p| {
                format!(
                    "{}.{}",
                    store.full_path(p),
                    AtomName::Fourcc(tag).display()
                )
            })
        } else {
            None
        };
        let def = catalog::classify(&tag, parent_tag.as_ref(), candidate_path.as_deref());

        // uuid extension boxes: sniff which convention produced them
        let mut name = AtomName::Fourcc(tag);
        let mut uuid_framing: Option<Framing> = None;
        if tag == *b"uuid" && file_size - jump >= 24 {
            let mut uuid_bytes = [0u8; 16];
            read_at(reader, jump + 8, &mut uuid_bytes)?;
            if read_u32(&uuid_bytes, 8) == 0 {
                // deprecated convention: a plain 4cc in the uuid slot
                let owner = [uuid_bytes[0], uuid_bytes[1], uuid_bytes[2], uuid_bytes[3]];
                let mut version_flags = read_u32(&uuid_bytes, 4);
                if version_flags > MAX_DATA_FLAG {
                    version_flags = 0;
                }
                name = AtomName::Fourcc(owner);
                uuid_framing = Some(Framing::ExtendedUuid {
                    kind: UuidKind::Deprecated,
                    owner_tag: Some(owner),
                    version_flags,
                });
            } else {
                name = AtomName::Uuid(uuid_bytes);
                let mut framing = Framing::ExtendedUuid {
                    kind: UuidKind::Other,
                    owner_tag: None,
                    version_flags: 0,
                };
                if uuid_version(&uuid_bytes) == 5 && file_size - jump >= 32 {
                    let mut owner = [0u8; 4];
                    read_at(reader, jump + 24, &mut owner)?;
                    let kind = classify_uuid(&uuid_bytes, &owner);
                    framing = if kind == UuidKind::AppNamespaceV5 {
                        // our own box: re-parse with full semantics
                        Framing::ExtendedUuid {
                            kind,
                            owner_tag: Some(owner),
                            version_flags: read_u32_at(reader, jump + 28)?,
                        }
                    } else {
                        Framing::ExtendedUuid {
                            kind,
                            owner_tag: None,
                            version_flags: 0,
                        }
                    };
                }
                uuid_framing = Some(framing);
            }
        }

        let framing = if let Some(framing) = uuid_framing {
            framing
        } else if corrupted {
            Framing::Simple
        } else {
            match def.payload {
                PayloadKind::Simple => Framing::Simple,
                PayloadKind::Versioned => Framing::Versioned {
                    version_flags: if header_len >= 12 { read_u32(&header, 8) } else { 0 },
                },
                PayloadKind::PackedLanguage => {
                    let language = match language_offset(&tag) {
                        Some(offset) if jump + offset + 2 <= file_size => {
                            read_u16_at(reader, jump + offset)?
                        }
                        _ => 0,
                    };
                    Framing::PackedLanguage {
                        version_flags: 0,
                        language,
                    }
                }
                PayloadKind::ExtendedUuid | PayloadKind::Unknown => Framing::Unknown,
            }
        };

        // pseudo-64-bit media data: declared length 1, true length follows
        let mut extended_len = 0u64;
        let mut declared = data_size;
        if tag == *b"mdat" && depth == 1 && data_size == 1 {
            extended_len = read_u64_at(reader, jump + 8)?;
            declared = 1;
            if extended_len > u32::MAX as u64 - EXTENDED_LENGTH_HEADROOM {
                warn!(length = extended_len, "64-bit media data beyond supported ceiling; degraded mode");
                store.oversized_media_data = true;
                store.warnings.push(ScanWarning::OversizedMediaData {
                    length: extended_len,
                });
            }
        }

        let pushed = store.push_scanned(Atom {
            start: jump as u32,
            declared_len: declared,
            extended_len,
            name,
            structure: def.structure,
            framing,
            depth,
            payload: None,
            successor: None,
            reverse_dns_tag: None,
            codec_hint: 0,
        });

        if tag == *b"udta" && parent_tag.as_ref() == Some(b"moov") {
            store.original_udta_size = declared;
        }

        // capture the descriptor of an iTunes free-form metadata triple
        if tag == *b"name" && pushed >= 2 {
            let mean = store.atom(pushed - 1).name.is(b"mean");
            let dashes = store.atom(pushed - 2).name.is(b"----");
            if mean && dashes && declared > 12 {
                let mut text = vec![0u8; (declared - 12) as usize];
                read_at(reader, jump + 12, &mut text)?;
                while text.last() == Some(&0) {
                    text.pop();
                }
                store.atom_mut(pushed).reverse_dns_tag =
                    Some(String::from_utf8_lossy(&text).into_owned());
            }
        }

        if data_size == 0 {
            // reaches to EOF
            break;
        }

        let advance = match def.structure {
            StructuralKind::Parent | StructuralKind::SimpleParent => 8,
            StructuralKind::Leaf => {
                if declared == 1 {
                    extended_len
                } else {
                    data_size as u64
                }
            }
            StructuralKind::Hybrid => {
                if tag == *b"meta" {
                    12
                } else if tag == *b"stsd" {
                    if options.full_structure {
                        16
                    } else {
                        // remember the codec for external collaborators,
                        // then treat the box as monolithic
                        if jump + 24 <= file_size {
                            let mut codec = [0u8; 4];
                            read_at(reader, jump + 20, &mut codec)?;
                            store.atom_mut(pushed).codec_hint = fourcc(&codec);
                        }
                        data_size as u64
                    }
                } else if tag == *b"schi" {
                    if parent_tag.as_ref() == Some(b"sinf") {
                        8
                    } else {
                        data_size as u64
                    }
                } else if parent_tag.as_ref() == Some(b"stsd") {
                    codec_skip(&tag, data_size) as u64
                } else {
                    data_size as u64
                }
            }
            StructuralKind::Unknown => {
                // some utilities drop unknown boxes inside hybrids; skip
                // to the hybrid's end rather than trusting the length
                match store.parent_of(pushed) {
                    Some(p) if store.atom(p).structure == StructuralKind::Hybrid => {
                        let parent = store.atom(p);
                        (parent.start.wrapping_add(parent.declared_len) as u64)
                            .saturating_sub(jump)
                    }
                    _ => data_size as u64,
                }
            }
        };
        if advance == 0 {
            break;
        }
        jump += advance;

        if jump.max(8) >= file_size {
            break;
        }
    }

    if !options.full_structure && store.find_named(b"moov").is_none() {
        return Err(EngineError::MissingRequiredBox("moov"));
    }
    Ok(store)
}

/// Read an atom's body into its payload buffer, leaving the declared
/// length untouched.
pub fn load_payload<R: Read + Seek>(
    store: &mut AtomStore,
    reader: &mut R,
    id: AtomId,
) -> EngineResult<()> {
    if store.atom(id).payload.is_some() {
        return Ok(());
    }
    let atom = store.atom(id);
    let header = atom.payload_header_len();
    let len = atom.declared_len.saturating_sub(header) as usize;
    let start = atom.start as u64 + header as u64;
    let mut buf = vec![0u8; len];
    read_at(reader, start, &mut buf)?;
    store.atom_mut(id).payload = Some(buf);
    Ok(())
}
