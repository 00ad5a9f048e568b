//! Chunk-offset table patching
//!
//! Once the media-data box's new starting position is known, the three
//! offset-bearing table variants are rewritten in place within their
//! owning atom's payload buffer. The first table encountered establishes
//! one signed delta for the whole file; a delta of zero means every
//! table is streamed verbatim from the source instead, which both avoids
//! work and protects unparsed trailing bytes of large tables.

use std::io::{Read, Seek};

use tracing::debug;

use crate::core::atom::{AtomId, Framing};
use crate::core::bytes::{read_u32, read_u64, write_u32, write_u64};
use crate::core::error::EngineResult;
use crate::core::store::AtomStore;
use crate::files::scanner::load_payload;

/// Per-session offset bookkeeping; reset when a session opens.
#[derive(Debug, Default)]
pub struct OffsetState {
    /// Shift applied to every chunk offset, established once
    pub chunk_delta: Option<i64>,
    /// Shift applied to every fragment base-data-offset, established once
    pub fragment_delta: Option<i64>,
}

impl OffsetState {
    fn chunk_delta(&mut self, store: &AtomStore, mdat_position: u32) -> i64 {
        *self.chunk_delta.get_or_insert_with(|| {
            let delta = mdat_position as i64 - store.bytes_before_mdat as i64;
            debug!(delta, "chunk offset delta established");
            delta
        })
    }
}

/// Rewrite a 32-bit chunk-offset table. Returns false when no
/// adjustment is needed and the atom should be streamed from the source.
pub fn patch_stco<R: Read + Seek>(
    store: &mut AtomStore,
    state: &mut OffsetState,
    reader: &mut R,
    mdat_position: u32,
    id: AtomId,
) -> EngineResult<bool> {
    let delta = state.chunk_delta(store, mdat_position);
    if delta == 0 {
        return Ok(false);
    }
    load_payload(store, reader, id)?;
    store.atom_mut(id).framing = Framing::Versioned { version_flags: 0 };
    let Some(payload) = store.atom_mut(id).payload.as_mut() else {
        return Ok(false);
    };
    if payload.len() < 4 {
        return Ok(false);
    }
    let entries = read_u32(payload, 0) as usize;
    for i in 0..entries {
        let pos = 4 + i * 4;
        if pos + 4 > payload.len() {
            break;
        }
        let old = read_u32(payload, pos);
        write_u32(payload, pos, (old as i64 + delta) as u32);
    }
    Ok(true)
}

/// Rewrite a 64-bit chunk-offset table; all arithmetic stays in signed
/// 64 bits rather than leaning on 32-bit wraparound.
pub fn patch_co64<R: Read + Seek>(
    store: &mut AtomStore,
    state: &mut OffsetState,
    reader: &mut R,
    mdat_position: u32,
    id: AtomId,
) -> EngineResult<bool> {
    let delta = state.chunk_delta(store, mdat_position);
    if delta == 0 {
        return Ok(false);
    }
    load_payload(store, reader, id)?;
    store.atom_mut(id).framing = Framing::Versioned { version_flags: 0 };
    let Some(payload) = store.atom_mut(id).payload.as_mut() else {
        return Ok(false);
    };
    if payload.len() < 4 {
        return Ok(false);
    }
    let entries = read_u32(payload, 0) as usize;
    for i in 0..entries {
        let pos = 4 + i * 8;
        if pos + 8 > payload.len() {
            break;
        }
        let old = read_u64(payload, pos);
        write_u64(payload, pos, (old as i64 + delta) as u64);
    }
    Ok(true)
}

/// Rewrite a movie-fragment track header's base-data-offset. Only the
/// first occurrence computes the delta; all fragments in a file share
/// the same base shift.
pub fn patch_tfhd<R: Read + Seek>(
    store: &mut AtomStore,
    state: &mut OffsetState,
    reader: &mut R,
    id: AtomId,
) -> EngineResult<bool> {
    if store.atom(id).framing.version_flags() & 0x01 == 0 {
        return Ok(false);
    }
    load_payload(store, reader, id)?;
    let offset = {
        let Some(payload) = store.atom(id).payload.as_ref() else {
            return Ok(false);
        };
        if payload.len() < 12 {
            return Ok(false);
        }
        read_u64(payload, 4)
    };
    let delta = match state.fragment_delta {
        Some(delta) => delta,
        None => {
            let delta = preceding_level1_sum(store, id) as i64 - offset as i64;
            debug!(delta, "fragment base offset delta established");
            state.fragment_delta = Some(delta);
            delta
        }
    };
    if delta == 0 {
        return Ok(false);
    }
    let Some(payload) = store.atom_mut(id).payload.as_mut() else {
        return Ok(false);
    };
    write_u64(payload, 4, (offset as i64 + delta) as u64);
    Ok(true)
}

/// Sum of top-level atom lengths before the fragment's own media-data
/// box, plus the 8-byte header the base offset points past.
fn preceding_level1_sum(store: &AtomStore, tfhd: AtomId) -> u64 {
    let mut stop = tfhd;
    let mut guard = 0;
    loop {
        guard += 1;
        if guard > store.len() {
            break;
        }
        if store.atom(stop).name.is(b"mdat") {
            stop = store.preceding(stop);
            break;
        }
        match store.atom(stop).successor {
            Some(next) => stop = next,
            None => break,
        }
    }

    let mut sum = 8u64;
    loop {
        let atom = store.atom(stop);
        if atom.depth == 1 {
            sum += if atom.declared_len == 1 {
                atom.extended_len
            } else {
                atom.declared_len as u64
            };
        }
        if stop == 0 {
            break;
        }
        stop = store.preceding(stop);
    }
    sum
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::atom::{Atom, AtomName, StructuralKind};
    use pretty_assertions::assert_eq;
    use std::io::Cursor;

    fn atom(tag: &[u8; 4], depth: u8, start: u32, len: u32) -> Atom {
        Atom {
            start,
            declared_len: len,
            extended_len: 0,
            name: AtomName::Fourcc(*tag),
            structure: StructuralKind::Leaf,
            framing: Framing::Simple,
            depth,
            payload: None,
            successor: None,
            reverse_dns_tag: None,
            codec_hint: 0,
        }
    }

    fn stco_payload(offsets: &[u32]) -> Vec<u8> {
        let mut payload = Vec::new();
        payload.extend_from_slice(&(offsets.len() as u32).to_be_bytes());
        for &offset in offsets {
            payload.extend_from_slice(&offset.to_be_bytes());
        }
        payload
    }

    fn store_with_stco(offsets: &[u32]) -> AtomStore {
        let mut store = AtomStore::new(4096);
        store.push_scanned(atom(b"ftyp", 1, 0, 20));
        store.push_scanned(atom(b"moov", 1, 20, 100));
        let mut stco = atom(b"stco", 2, 40, 16 + offsets.len() as u32 * 4);
        stco.framing = Framing::Versioned { version_flags: 0 };
        stco.payload = Some(stco_payload(offsets));
        store.push_scanned(stco);
        store.push_scanned(atom(b"mdat", 1, 120, 500));
        store
    }

    #[test]
    fn test_stco_shifted_by_delta() {
        let mut store = store_with_stco(&[128, 256, 1024]);
        // 1000 bytes of metadata were added before mdat
        let mut state = OffsetState::default();
        let mut reader = Cursor::new(Vec::new());
        let pos = store.bytes_before_mdat + 1000;
        let changed = patch_stco(
            &mut store,
            &mut state,
            &mut reader,
            pos,
            2,
        )
        .unwrap();
        assert!(changed);
        let payload = store.atom(2).payload.as_ref().unwrap();
        assert_eq!(read_u32(payload, 4), 1128);
        assert_eq!(read_u32(payload, 8), 1256);
        assert_eq!(read_u32(payload, 12), 2024);
    }

    #[test]
    fn test_zero_delta_streams_verbatim() {
        let mut store = store_with_stco(&[128]);
        let mut state = OffsetState::default();
        let mut reader = Cursor::new(Vec::new());
        let pos = store.bytes_before_mdat;
        let changed = patch_stco(
            &mut store,
            &mut state,
            &mut reader,
            pos,
            2,
        )
        .unwrap();
        assert!(!changed);
        assert_eq!(state.chunk_delta, Some(0));
    }

    #[test]
    fn test_negative_delta() {
        let mut store = store_with_stco(&[500, 700]);
        let mut state = OffsetState::default();
        let mut reader = Cursor::new(Vec::new());
        let pos = store.bytes_before_mdat - 64;
        let changed = patch_stco(
            &mut store,
            &mut state,
            &mut reader,
            pos,
            2,
        )
        .unwrap();
        assert!(changed);
        let payload = store.atom(2).payload.as_ref().unwrap();
        assert_eq!(read_u32(payload, 4), 436);
        assert_eq!(read_u32(payload, 8), 636);
    }

    #[test]
    fn test_co64_signed_math() {
        let mut store = AtomStore::new(4096);
        store.push_scanned(atom(b"ftyp", 1, 0, 20));
        store.push_scanned(atom(b"moov", 1, 20, 100));
        let mut co64 = atom(b"co64", 2, 40, 16 + 16);
        co64.framing = Framing::Versioned { version_flags: 0 };
        let mut payload = 2u32.to_be_bytes().to_vec();
        payload.extend_from_slice(&5_000_000_000u64.to_be_bytes());
        payload.extend_from_slice(&5_000_100_000u64.to_be_bytes());
        co64.payload = Some(payload);
        store.push_scanned(co64);
        store.push_scanned(atom(b"mdat", 1, 120, 500));

        let mut state = OffsetState::default();
        let mut reader = Cursor::new(Vec::new());
        let pos = store.bytes_before_mdat - 50;
        let changed = patch_co64(
            &mut store,
            &mut state,
            &mut reader,
            pos,
            2,
        )
        .unwrap();
        assert!(changed);
        let payload = store.atom(2).payload.as_ref().unwrap();
        assert_eq!(read_u64(payload, 4), 4_999_999_950);
        assert_eq!(read_u64(payload, 12), 5_000_099_950);
    }

    #[test]
    fn test_delta_shared_between_tables() {
        let mut store = store_with_stco(&[128]);
        let mut state = OffsetState::default();
        let mut reader = Cursor::new(Vec::new());
        let pos = store.bytes_before_mdat + 16;
        patch_stco(&mut store, &mut state, &mut reader, pos, 2).unwrap();
        // a later table reuses the established delta even with a stale
        // position argument
        assert_eq!(state.chunk_delta, Some(16));
    }

    #[test]
    fn test_tfhd_base_offset() {
        // ftyp, moof [ traf [ tfhd ] ], mdat; base offset points 8 bytes
        // into mdat
        let mut store = AtomStore::new(4096);
        store.push_scanned(atom(b"ftyp", 1, 0, 20));
        let mut moof = atom(b"moof", 1, 20, 40);
        moof.structure = StructuralKind::Parent;
        store.push_scanned(moof);
        let mut traf = atom(b"traf", 2, 28, 32);
        traf.structure = StructuralKind::Parent;
        store.push_scanned(traf);
        let mut tfhd = atom(b"tfhd", 3, 36, 24);
        tfhd.framing = Framing::Versioned { version_flags: 0x01 };
        let mut payload = 1u32.to_be_bytes().to_vec(); // track id
        payload.extend_from_slice(&48u64.to_be_bytes()); // stale base offset
        tfhd.payload = Some(payload);
        store.push_scanned(tfhd);
        store.push_scanned(atom(b"mdat", 1, 60, 500));

        let mut state = OffsetState::default();
        let mut reader = Cursor::new(Vec::new());
        let changed = patch_tfhd(&mut store, &mut state, &mut reader, 3).unwrap();
        assert!(changed);
        // ftyp(20) + moof(40) + 8 = 68
        let payload = store.atom(3).payload.as_ref().unwrap();
        assert_eq!(read_u64(payload, 4), 68);
        assert_eq!(state.fragment_delta, Some(20));
    }

    #[test]
    fn test_tfhd_without_base_offset_flag() {
        let mut store = AtomStore::new(4096);
        store.push_scanned(atom(b"ftyp", 1, 0, 20));
        let mut tfhd = atom(b"tfhd", 1, 20, 16);
        tfhd.framing = Framing::Versioned { version_flags: 0 };
        tfhd.payload = Some(vec![0; 12]);
        store.push_scanned(tfhd);
        store.push_scanned(atom(b"mdat", 1, 36, 100));
        let mut state = OffsetState::default();
        let mut reader = Cursor::new(Vec::new());
        assert!(!patch_tfhd(&mut store, &mut state, &mut reader, 1).unwrap());
    }
}
