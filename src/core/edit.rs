//! Tree mutation over the successor-index list
//!
//! Splice (eliminate), insert (interject), and relocate (move) atoms by
//! re-linking successor pointers. Eliminated atoms stay in the arena as
//! tombstones: their name is zeroed and their successor blanked so the
//! chain can never re-enter them.

use crate::core::atom::{Atom, AtomId, AtomName, Framing, PayloadKind, StructuralKind};
use crate::core::path;
use crate::core::store::AtomStore;

/// Unlink `id` from the chain, resuming traversal at `resume`.
///
/// If the removed atom preceded the top-level media-data box, its length
/// joins the running removed-bytes counter consumed later by chunk-offset
/// patching validation.
pub fn eliminate(store: &mut AtomStore, id: AtomId, resume: Option<AtomId>) {
    if id == 0 || id >= store.len() {
        return;
    }
    if store.precedes_media_data(id) {
        store.removed_bytes_before_mdat = store
            .removed_bytes_before_mdat
            .wrapping_add(store.atom(id).declared_len);
    }
    let preceding = store.preceding(id);
    store.atom_mut(preceding).successor = resume;

    let atom = store.atom_mut(id);
    atom.successor = None;
    atom.name = AtomName::Fourcc([0; 4]);
}

/// Allocate a new atom carrying zeroed data and insert it after
/// `preceding`. Used chiefly to seed `free` padding repositories.
#[allow(clippy::too_many_arguments)]
pub fn interject(
    store: &mut AtomStore,
    tag: &[u8; 4],
    structure: StructuralKind,
    payload_kind: PayloadKind,
    length: u32,
    version_flags: u32,
    language: u16,
    depth: u8,
    preceding: AtomId,
) -> AtomId {
    let mut framing = Framing::bare(payload_kind, language);
    if let Framing::Versioned {
        version_flags: ref mut vf,
    } = framing
    {
        *vf = version_flags;
    }
    let mut atom = Atom {
        start: 0,
        declared_len: length,
        extended_len: 0,
        name: AtomName::Fourcc(*tag),
        structure,
        framing,
        depth,
        payload: None,
        successor: store.atom(preceding).successor,
        reverse_dns_tag: None,
        codec_hint: 0,
    };
    let header = atom.payload_header_len();
    atom.payload = Some(vec![0; length.saturating_sub(header) as usize]);
    let id = store.push_detached(atom);
    store.atom_mut(preceding).successor = Some(id);
    id
}

/// Relocate `id` (and, for containers, its entire child run) relative to
/// `anchor`: container-to-container moves land after the anchor's
/// subtree, everything else lands immediately before the anchor.
///
/// Both sides' child runs are merged by wiring through each side's last
/// descendant, never through the parent directly. Statement order
/// matters: the same pointer may be read and rewritten in one sequence.
pub fn move_atom(store: &mut AtomStore, id: AtomId, anchor: AtomId) {
    let preceding = store.preceding(id);
    let last_stationary = store.preceding(anchor);

    if store.atom(id).structure.can_contain() {
        if store.atom(anchor).structure.can_contain() {
            let last_swap = store.last_descendant(id);
            let last_wired = store.last_descendant(anchor);
            let swap_resume = store.atom(last_swap).successor;
            let wired_resume = store.atom(last_wired).successor;

            store.atom_mut(preceding).successor = swap_resume;
            store.atom_mut(last_stationary).successor = Some(anchor);
            store.atom_mut(last_wired).successor = Some(id);
            store.atom_mut(last_swap).successor = wired_resume;
        } else {
            let last_child = store.last_descendant(id);
            store.atom_mut(last_stationary).successor = Some(id);
            let resume = store.atom(last_child).successor;
            store.atom_mut(preceding).successor = resume;
            store.atom_mut(last_child).successor = Some(anchor);
        }
    } else {
        store.atom_mut(last_stationary).successor = Some(id);
        let resume = store.atom(id).successor;
        store.atom_mut(preceding).successor = resume;
        store.atom_mut(id).successor = Some(anchor);
    }
}

/// Remove the atom addressed by `path`, reporting whether anything was
/// actually removed.
///
/// Containers, hybrids, and the legs of an iTunes metadata box are
/// removed together with all of their descendants; partial truncation
/// would corrupt sibling offsets.
pub fn remove(store: &mut AtomStore, atom_path: &str, kind: PayloadKind, language: u16) -> bool {
    let match_full = kind == PayloadKind::ExtendedUuid;
    let Some(id) = path::find_atom(store, atom_path, false, kind, language, match_full) else {
        return false;
    };
    if id == 0 {
        // the file-type box is never removable
        return false;
    }

    if kind == PayloadKind::ExtendedUuid {
        let resume = store.atom(id).successor;
        eliminate(store, id, resume);
        return true;
    }

    let atom = store.atom(id);
    let is_metadata_leg =
        atom.reverse_dns_tag.is_some() || (atom.name.is(b"data") && atom.depth == 6);

    if kind == PayloadKind::PackedLanguage || atom.framing.kind() == PayloadKind::Unknown {
        let resume = store.atom(id).successor;
        eliminate(store, id, resume);
    } else if is_metadata_leg {
        let Some(parent) = store.parent_of(id) else {
            return false;
        };
        let last = store.last_descendant(parent);
        let resume = store.atom(last).successor;
        eliminate(store, parent, resume);
    } else if atom.structure.can_contain() {
        let last = store.last_descendant(id);
        let resume = store.atom(last).successor;
        eliminate(store, id, resume);
    } else {
        let resume = store.atom(id).successor;
        eliminate(store, id, resume);
    }
    true
}

/// Eliminate `free`/`skip` padding atoms.
///
/// A purge level of -1 erases every one; 0 erases top-level padding
/// outside the moov..mdat span; n >= 1 erases padding at levels up to n.
pub fn purge_free(store: &mut AtomStore, purge_level: i32) {
    let mut moov_seen = false;
    let mut mdat_seen = false;
    let mut eval: AtomId = 0;
    let mut guard = 0;
    loop {
        guard += 1;
        if guard > store.len() * 2 {
            break;
        }
        let Some(cur) = store.atom(eval).successor else {
            break;
        };
        let atom = store.atom(cur);
        if atom.name.is(b"free") || atom.name.is(b"skip") {
            let depth = atom.depth as i32;
            if purge_level == -1
                || purge_level >= depth
                || (purge_level == 0 && depth == 1 && (!moov_seen || mdat_seen))
            {
                let prev = store.preceding(cur);
                let resume = store.atom(cur).successor;
                eliminate(store, cur, resume);
                eval = prev;
                continue;
            }
        }
        if store.atom(cur).name.is(b"moov") {
            moov_seen = true;
        }
        if store.atom(cur).name.is(b"mdat") {
            mdat_seen = true;
        }
        eval = cur;
    }
}
