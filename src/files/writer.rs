//! Serialization back to disk
//!
//! Two strategies, selected by the layout planner: a full rewrite
//! traverses the successor order, emitting each atom from memory when it
//! was modified or created and stream-copying untouched byte ranges from
//! the source through a fixed-size buffer; an in-place patch rewrites
//! only the user-data subtree plus its trailing padding. Pre-write
//! validation runs before either strategy touches a single byte.

use std::io::{Read, Seek, SeekFrom, Write};

use tracing::{trace, warn};

use crate::core::atom::{AtomId, AtomName, Framing, StructuralKind};
use crate::core::error::{EngineError, EngineResult};
use crate::core::store::AtomStore;
use crate::files::offsets::{patch_co64, patch_stco, patch_tfhd, OffsetState};

/// Corruption tripwire; far above any real file's atom count.
pub const MAX_ATOM_COUNT: usize = 1024;

/// Stream-copy chunk size.
const COPY_BUFFER_SIZE: usize = 512 * 1024;

/// Size checks only apply to files above this; a tiny file legitimately
/// grows manyfold when artwork is added.
const VALIDATION_SIZE_FLOOR: u64 = 300_000;

/// Sanity checks that must all pass before any write begins, so a failed
/// write can never leave a partially corrupted file.
pub fn validate(store: &AtomStore) -> EngineResult<()> {
    let live: Vec<AtomId> = store.chain().collect();
    if live.len() > MAX_ATOM_COUNT {
        return Err(EngineError::ValidationFailure(format!(
            "{} atoms exceeds the internal limit of {MAX_ATOM_COUNT}",
            live.len()
        )));
    }

    let mut four_char_names = true;
    let mut tally = 0u64;
    for (position, &id) in live.iter().enumerate() {
        let atom = store.atom(id);

        if let AtomName::Fourcc(tag) = atom.name {
            if tag.iter().any(|&b| b == 0) {
                four_char_names = false;
            }
        }

        if atom.declared_len as u64 > store.file_size
            && store.file_size > VALIDATION_SIZE_FLOOR
            && atom.payload.is_none()
        {
            return Err(EngineError::ValidationFailure(format!(
                "atom '{}' presents as {} bytes, larger than the {}-byte file",
                atom.name.display(),
                atom.declared_len,
                store.file_size
            )));
        }

        if atom.depth == 1 {
            if atom.declared_len == 0 && atom.name.is(b"mdat") {
                tally = store.file_size - atom.start as u64;
            } else if atom.declared_len == 1 {
                tally += atom.extended_len;
            } else {
                tally += atom.declared_len as u64;
            }
        }

        if atom.name.is(b"mdat") && atom.depth != 1 {
            return Err(EngineError::ValidationFailure(
                "mdat found below top level".to_string(),
            ));
        }

        // faux tracks produced by some muxers lack the mandatory header
        if atom.name.is(b"trak") {
            let next = live.get(position + 1);
            let headed = next.is_some_and(|&n| store.atom(n).name.is(b"tkhd"));
            if !headed {
                return Err(EngineError::ValidationFailure(
                    "trak is not immediately followed by tkhd".to_string(),
                ));
            }
        }
    }

    if store.file_size > VALIDATION_SIZE_FLOOR {
        let baseline = store.file_size - store.removed_bytes_before_mdat as u64;
        let percentage = (tally as f64 * 100.0 / baseline as f64).round() as i64;
        if percentage < 90 {
            return Err(EngineError::ValidationFailure(format!(
                "post-edit size fell to {percentage}% of the original"
            )));
        }
    }

    if !four_char_names {
        warn!("atom(s) detected with atypical names containing NULs");
    }
    Ok(())
}

/// Emit one atom: either stream `physical_len` bytes straight from the
/// source file, or reassemble header and payload from memory.
fn write_atom<R: Read + Seek, W: Write>(
    store: &AtomStore,
    reader: &mut R,
    writer: &mut W,
    id: AtomId,
    from_file: bool,
    patch_mode: bool,
    buffer: &mut [u8],
) -> EngineResult<u64> {
    let atom = store.atom(id);

    // spurious lengths and padding handled by the patch splice are skipped
    if atom.declared_len > 1 && atom.declared_len < 8 {
        return Ok(0);
    }
    if atom.name.is(b"free") && (patch_mode || atom.declared_len == 0) {
        return Ok(0);
    }

    writer.write_all(&atom.declared_len.to_be_bytes())?;
    let mut written = 4u64;

    if from_file {
        let physical = atom.physical_len(store.file_size);
        let mut remaining = physical.saturating_sub(4);
        let mut position = atom.start as u64 + 4;
        while remaining > 0 {
            let step = remaining.min(buffer.len() as u64) as usize;
            reader.seek(SeekFrom::Start(position))?;
            reader.read_exact(&mut buffer[..step])?;
            writer.write_all(&buffer[..step])?;
            position += step as u64;
            remaining -= step as u64;
            written += step as u64;
            trace!(atom = %atom.name.display(), written, "stream-copied chunk");
        }
        return Ok(written);
    }

    match atom.name {
        AtomName::Uuid(bytes) => {
            writer.write_all(b"uuid")?;
            writer.write_all(&bytes)?;
            written += 20;
        }
        AtomName::Fourcc(tag) => {
            writer.write_all(&tag)?;
            written += 4;
        }
    }

    match &atom.framing {
        Framing::Versioned { version_flags } | Framing::PackedLanguage { version_flags, .. } => {
            writer.write_all(&version_flags.to_be_bytes())?;
            written += 4;
        }
        Framing::ExtendedUuid {
            owner_tag: Some(owner),
            version_flags,
            ..
        } if matches!(atom.name, AtomName::Uuid(_)) => {
            writer.write_all(owner)?;
            writer.write_all(&version_flags.to_be_bytes())?;
            written += 8;
        }
        _ => {}
    }

    if let Some(payload) = &atom.payload {
        writer.write_all(payload)?;
        written += payload.len() as u64;
    }
    Ok(written)
}

fn emits_from_memory(store: &AtomStore, id: AtomId) -> bool {
    let atom = store.atom(id);
    atom.payload.is_some()
        || atom.name.is(b"meta")
        || matches!(
            atom.structure,
            StructuralKind::Parent | StructuralKind::SimpleParent
        )
}

/// Full rewrite: traverse the successor order from the first atom,
/// re-deriving chunk-offset tables whenever the media data moved, then
/// re-append any trailing gapless padding verbatim.
pub fn write_rewrite<R: Read + Seek, W: Write>(
    store: &mut AtomStore,
    state: &mut OffsetState,
    reader: &mut R,
    writer: &mut W,
    keep_gapless_padding: bool,
) -> EngineResult<u64> {
    let mdat_position = store.media_data_position();
    let order: Vec<AtomId> = store.chain().collect();
    let mut buffer = vec![0u8; COPY_BUFFER_SIZE];
    let mut written = 0u64;

    for id in order {
        let name = store.atom(id).name;
        let from_file = if name.is(b"stco") {
            !patch_stco(store, state, reader, mdat_position, id)?
        } else if name.is(b"co64") {
            !patch_co64(store, state, reader, mdat_position, id)?
        } else if name.is(b"tfhd") {
            !patch_tfhd(store, state, reader, id)?
        } else {
            !emits_from_memory(store, id)
        };
        written += write_atom(store, reader, writer, id, from_file, false, &mut buffer)?;
    }

    if store.gapless_padding > 0 && keep_gapless_padding {
        let mut remaining = store.gapless_padding;
        buffer.fill(0);
        while remaining > 0 {
            let step = remaining.min(buffer.len() as u64) as usize;
            writer.write_all(&buffer[..step])?;
            remaining -= step as u64;
        }
        written += store.gapless_padding;
    }
    Ok(written)
}

/// Write the contiguous run from `start_id` through `end_id` (the
/// user-data subtree) for an in-place patch; padding atoms are dropped,
/// their bytes reappearing as the trailing repository.
pub fn write_region<R: Read + Seek, W: Write>(
    store: &AtomStore,
    reader: &mut R,
    writer: &mut W,
    start_id: AtomId,
    end_id: AtomId,
) -> EngineResult<u64> {
    let mut buffer = vec![0u8; COPY_BUFFER_SIZE];
    let mut written = 0u64;
    let mut iter = Some(start_id);
    let mut guard = 0;
    while let Some(id) = iter {
        guard += 1;
        if guard > store.len() {
            break;
        }
        let from_file = !emits_from_memory(store, id);
        written += write_atom(store, reader, writer, id, from_file, true, &mut buffer)?;
        if id == end_id {
            break;
        }
        iter = store.atom(id).successor;
    }
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::atom::Atom;
    use pretty_assertions::assert_eq;
    use std::io::Cursor;

    fn atom(tag: &[u8; 4], depth: u8, start: u32, len: u32, structure: StructuralKind) -> Atom {
        Atom {
            start,
            declared_len: len,
            extended_len: 0,
            name: AtomName::Fourcc(*tag),
            structure,
            framing: Framing::Simple,
            depth,
            payload: None,
            successor: None,
            reverse_dns_tag: None,
            codec_hint: 0,
        }
    }

    fn valid_store() -> AtomStore {
        let mut store = AtomStore::new(1000);
        store.push_scanned(atom(b"ftyp", 1, 0, 20, StructuralKind::Leaf));
        store.push_scanned(atom(b"moov", 1, 20, 138, StructuralKind::Parent));
        store.push_scanned(atom(b"trak", 2, 28, 130, StructuralKind::Parent));
        store.push_scanned(atom(b"tkhd", 3, 36, 122, StructuralKind::Leaf));
        store.push_scanned(atom(b"mdat", 1, 158, 842, StructuralKind::Leaf));
        store
    }

    #[test]
    fn test_validation_accepts_sane_store() {
        assert!(validate(&valid_store()).is_ok());
    }

    #[test]
    fn test_validation_rejects_headless_trak() {
        let mut store = AtomStore::new(1000);
        store.push_scanned(atom(b"ftyp", 1, 0, 20, StructuralKind::Leaf));
        store.push_scanned(atom(b"moov", 1, 20, 138, StructuralKind::Parent));
        store.push_scanned(atom(b"trak", 2, 28, 130, StructuralKind::Parent));
        store.push_scanned(atom(b"mdia", 3, 36, 122, StructuralKind::Parent));
        store.push_scanned(atom(b"mdat", 1, 158, 842, StructuralKind::Leaf));
        let err = validate(&store).unwrap_err();
        assert!(matches!(err, EngineError::ValidationFailure(_)));
        assert!(err.to_string().contains("tkhd"));
    }

    #[test]
    fn test_validation_rejects_buried_mdat() {
        let mut store = AtomStore::new(1000);
        store.push_scanned(atom(b"ftyp", 1, 0, 20, StructuralKind::Leaf));
        store.push_scanned(atom(b"moov", 1, 20, 980, StructuralKind::Parent));
        store.push_scanned(atom(b"mdat", 2, 28, 972, StructuralKind::Leaf));
        let err = validate(&store).unwrap_err();
        assert!(err.to_string().contains("top level"));
    }

    #[test]
    fn test_validation_rejects_oversized_atom() {
        let mut store = valid_store();
        store.file_size = 400_000;
        store.atom_mut(4).declared_len = 500_000;
        let err = validate(&store).unwrap_err();
        assert!(matches!(err, EngineError::ValidationFailure(_)));
    }

    #[test]
    fn test_validation_rejects_shrunken_total() {
        let mut store = valid_store();
        store.file_size = 400_000;
        // top-level atoms only sum to a tiny fraction of the file
        let err = validate(&store).unwrap_err();
        assert!(err.to_string().contains("%"));
    }

    #[test]
    fn test_write_atom_from_memory() {
        let mut store = AtomStore::new(100);
        let mut data = atom(b"data", 1, 0, 0, StructuralKind::Leaf);
        data.framing = Framing::Versioned { version_flags: 1 };
        data.set_payload(vec![0, 0, 0, 0, b'h', b'i']);
        store.push_scanned(data);

        let mut out = Vec::new();
        let mut reader = Cursor::new(Vec::new());
        let written = write_atom(&store, &mut reader, &mut out, 0, false, false, &mut [0; 64])
            .unwrap();
        assert_eq!(written, 18);
        assert_eq!(&out[0..4], &18u32.to_be_bytes());
        assert_eq!(&out[4..8], b"data");
        assert_eq!(&out[8..12], &1u32.to_be_bytes());
        assert_eq!(&out[12..18], &[0, 0, 0, 0, b'h', b'i']);
    }

    #[test]
    fn test_write_atom_streams_from_file() {
        let mut source = vec![0u8; 40];
        source[0..4].copy_from_slice(&16u32.to_be_bytes());
        source[4..8].copy_from_slice(b"mdat");
        source[8..16].copy_from_slice(b"payload!");

        let mut store = AtomStore::new(40);
        store.push_scanned(atom(b"mdat", 1, 0, 16, StructuralKind::Leaf));

        let mut out = Vec::new();
        let mut reader = Cursor::new(source);
        let written = write_atom(&store, &mut reader, &mut out, 0, true, false, &mut [0; 7])
            .unwrap();
        assert_eq!(written, 16);
        assert_eq!(&out[4..8], b"mdat");
        assert_eq!(&out[8..16], b"payload!");
    }

    #[test]
    fn test_patch_mode_skips_free() {
        let mut store = AtomStore::new(100);
        store.push_scanned(atom(b"free", 1, 0, 64, StructuralKind::Leaf));
        let mut out = Vec::new();
        let mut reader = Cursor::new(Vec::new());
        let written = write_atom(&store, &mut reader, &mut out, 0, false, true, &mut [0; 8])
            .unwrap();
        assert_eq!(written, 0);
        assert!(out.is_empty());
    }

    #[test]
    fn test_uuid_atom_layout() {
        use crate::core::atom::UuidKind;
        use crate::core::uuid::uuid_for_tag;

        let mut store = AtomStore::new(100);
        let mut ext = atom(b"uuid", 1, 0, 0, StructuralKind::Leaf);
        ext.name = AtomName::Uuid(uuid_for_tag(b"tdtg"));
        ext.framing = Framing::ExtendedUuid {
            kind: UuidKind::AppNamespaceV5,
            owner_tag: Some(*b"tdtg"),
            version_flags: 1,
        };
        ext.set_payload(b"\0\0\0\02006".to_vec());
        store.push_scanned(ext);

        let mut out = Vec::new();
        let mut reader = Cursor::new(Vec::new());
        let written = write_atom(&store, &mut reader, &mut out, 0, false, false, &mut [0; 8])
            .unwrap();
        assert_eq!(written, 40);
        assert_eq!(&out[0..4], &40u32.to_be_bytes());
        assert_eq!(&out[4..8], b"uuid");
        assert_eq!(&out[8..24], &uuid_for_tag(b"tdtg"));
        assert_eq!(&out[24..28], b"tdtg");
        assert_eq!(&out[28..32], &1u32.to_be_bytes());
        assert_eq!(&out[32..40], b"\0\0\0\02006");
    }
}
