//! Bottom-up size resolution
//!
//! After any mutation, container lengths are stale until this pass runs.
//! Working backward through the successor order, each container's length
//! becomes its header overhead plus the lengths of the atoms exactly one
//! level below it; later-in-traversal atoms are already resolved by the
//! time their parent is visited.

use crate::core::atom::AtomName;
use crate::core::store::AtomStore;

/// Header bytes a container contributes on top of its children: the
/// metadata-container box carries version/flags, the sample-description
/// box additionally carries an entry count.
pub(crate) fn header_overhead(name: &AtomName) -> u32 {
    match name.tag() {
        Some(b"meta") => 12,
        Some(b"stsd") => 16,
        _ => 8,
    }
}

/// Recompute every container's length, single backward pass.
pub fn resolve_lengths(store: &mut AtomStore) {
    let mut rev = store.last_atom();
    loop {
        if rev == 0 {
            break;
        }
        let depth = store.atom(rev).depth;
        let mut size = header_overhead(&store.atom(rev).name);
        let mut has_children = false;
        let mut next = store.atom(rev).successor;
        while let Some(child) = next {
            let child_depth = store.atom(child).depth;
            if child_depth <= depth {
                break;
            }
            if child_depth == depth + 1 {
                size = size.wrapping_add(store.atom(child).declared_len);
            }
            has_children = true;
            next = store.atom(child).successor;
        }
        if has_children {
            store.atom_mut(rev).declared_len = size;
        }

        // containers left childless by an edit shrink to their minimum
        // header length rather than keeping a stale size
        let successor_depth = store.atom(rev).successor.map(|s| store.atom(s).depth);
        let name = store.atom(rev).name;
        if name.is(b"udta") && successor_depth.map_or(true, |d| d <= depth) {
            store.atom_mut(rev).declared_len = 8;
        }
        if name.is(b"meta") && successor_depth.map_or(true, |d| d != depth + 1) {
            store.atom_mut(rev).declared_len = 12;
        }
        if name.is(b"ilst") && successor_depth.map_or(true, |d| d != depth + 1) {
            store.atom_mut(rev).declared_len = 8;
        }

        rev = store.preceding(rev);
    }
}

/// Sum the top-level lengths into a total file length, honoring the
/// to-EOF and pseudo-64-bit conventions.
pub fn total_length(store: &AtomStore) -> u64 {
    let mut total = 0u64;
    for id in store.chain() {
        let atom = store.atom(id);
        if atom.depth != 1 {
            continue;
        }
        if atom.extended_len == 0 {
            total += atom.declared_len as u64;
        } else {
            total += atom.extended_len;
        }
        if atom.declared_len == 0 {
            total += store.file_size - atom.start as u64;
        }
    }
    total
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::atom::{Atom, Framing, StructuralKind};
    use pretty_assertions::assert_eq;

    fn atom(tag: &[u8; 4], depth: u8, len: u32, structure: StructuralKind) -> Atom {
        Atom {
            start: 0,
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

    fn metadata_store() -> AtomStore {
        // ftyp, moov [ mvhd, udta [ meta [ ilst [ ©nam [ data ] ] ] ] ], mdat
        let mut store = AtomStore::new(4096);
        store.push_scanned(atom(b"ftyp", 1, 20, StructuralKind::Leaf));
        store.push_scanned(atom(b"moov", 1, 0, StructuralKind::Parent));
        store.push_scanned(atom(b"mvhd", 2, 108, StructuralKind::Leaf));
        store.push_scanned(atom(b"udta", 2, 0, StructuralKind::Parent));
        store.push_scanned(atom(b"meta", 3, 0, StructuralKind::Hybrid));
        store.push_scanned(atom(b"ilst", 4, 0, StructuralKind::Parent));
        store.push_scanned(atom(b"\xA9nam", 5, 0, StructuralKind::Parent));
        store.push_scanned(atom(b"data", 6, 25, StructuralKind::Leaf));
        store.push_scanned(atom(b"mdat", 1, 500, StructuralKind::Leaf));
        store
    }

    #[test]
    fn test_bottom_up_lengths() {
        let mut store = metadata_store();
        resolve_lengths(&mut store);
        assert_eq!(store.atom(6).declared_len, 8 + 25); // ©nam
        assert_eq!(store.atom(5).declared_len, 8 + 33); // ilst
        assert_eq!(store.atom(4).declared_len, 12 + 41); // meta (versioned)
        assert_eq!(store.atom(3).declared_len, 8 + 53); // udta
        assert_eq!(store.atom(1).declared_len, 8 + 108 + 61); // moov
    }

    #[test]
    fn test_resolver_is_idempotent() {
        let mut store = metadata_store();
        resolve_lengths(&mut store);
        let first: Vec<u32> = store.chain().map(|id| store.atom(id).declared_len).collect();
        resolve_lengths(&mut store);
        let second: Vec<u32> = store.chain().map(|id| store.atom(id).declared_len).collect();
        assert_eq!(first, second);
    }

    #[test]
    fn test_childless_containers_shrink_to_header() {
        // moov [ udta ] mdat, after udta lost its children
        let mut store = AtomStore::new(4096);
        store.push_scanned(atom(b"ftyp", 1, 20, StructuralKind::Leaf));
        store.push_scanned(atom(b"moov", 1, 0, StructuralKind::Parent));
        store.push_scanned(atom(b"udta", 2, 999, StructuralKind::Parent));
        store.push_scanned(atom(b"mdat", 1, 500, StructuralKind::Leaf));
        resolve_lengths(&mut store);
        assert_eq!(store.atom(2).declared_len, 8);
        assert_eq!(store.atom(1).declared_len, 16);
    }

    #[test]
    fn test_total_length() {
        let mut store = metadata_store();
        resolve_lengths(&mut store);
        let moov = store.atom(1).declared_len as u64;
        assert_eq!(total_length(&store), 20 + moov + 500);
    }

    #[test]
    fn test_total_length_with_extended_mdat() {
        let mut store = AtomStore::new(4096);
        store.push_scanned(atom(b"ftyp", 1, 20, StructuralKind::Leaf));
        let mut mdat = atom(b"mdat", 1, 1, StructuralKind::Leaf);
        mdat.extended_len = 3_000_000_000;
        store.push_scanned(mdat);
        assert_eq!(total_length(&store), 20 + 3_000_000_000);
    }
}
