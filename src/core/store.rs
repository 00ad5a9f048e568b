//! The in-memory atom tree
//!
//! Atoms live in a growable arena and are related purely through
//! successor indices: following `successor` from index 0 (always the
//! file-type box) visits every live atom exactly once in document order.
//! Parent/child structure is implied by `depth` and recovered by walking
//! the chain, never by ownership. This arrangement is deliberate: path
//! resolution, geometry-based parent inference, and the successor-order
//! write pass all depend on stable, order-preserving indices.

use crate::core::atom::{Atom, AtomId, AtomName, Framing};

/// Metadata convention implied by the file's major brand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MetadataStyle {
    #[default]
    Undefined,
    /// MPEG-4 family brands tagged iTunes-style
    Itunes,
    /// 3GPP files prior to 3gp6
    ThirdGenPartner,
    /// 3gp6 and later; first version to carry the 'albm' tag
    ThirdGenPartnerRel6,
    /// 3GPP2 files
    ThirdGenPartnerVer2,
}

/// Advisory conditions recovered during scanning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanWarning {
    /// A `data` child declared longer than its parent; clamped to the
    /// parent's remaining length
    CorruptChildLength { parent: AtomName, clamped_to: u32 },
    /// A 64-bit media-data length above the supported ceiling; the box is
    /// tracked but will not be touched
    OversizedMediaData { length: u64 },
}

/// The atom arena plus per-file facts gathered during the scan.
#[derive(Debug, Default)]
pub struct AtomStore {
    atoms: Vec<Atom>,
    /// Size of the source file in bytes
    pub file_size: u64,
    /// Major brand as a big-endian 4cc
    pub brand: u32,
    /// Metadata convention for this brand
    pub metadata_style: MetadataStyle,
    /// PSP files get no reordering but may still patch in place
    pub psp_brand: bool,
    /// Trailing all-zero bytes outside any atom structure
    pub gapless_padding: u64,
    /// Sum of top-level atom lengths preceding the media-data box at scan
    /// time; the media payload's original physical position
    pub bytes_before_mdat: u32,
    /// Bytes of eliminated atoms that preceded the media-data box
    pub removed_bytes_before_mdat: u32,
    /// `moov.udta` length as scanned, before any edit
    pub original_udta_size: u32,
    /// A media-data box exceeded the pseudo-64-bit ceiling; degraded mode
    pub oversized_media_data: bool,
    /// Locally recovered anomalies for the caller to surface
    pub warnings: Vec<ScanWarning>,
    passed_mdat: bool,
}

impl AtomStore {
    pub fn new(file_size: u64) -> Self {
        AtomStore {
            file_size,
            ..AtomStore::default()
        }
    }

    /// Number of arena slots, including tombstoned atoms.
    pub fn len(&self) -> usize {
        self.atoms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.atoms.is_empty()
    }

    pub fn atom(&self, id: AtomId) -> &Atom {
        &self.atoms[id]
    }

    pub fn atom_mut(&mut self, id: AtomId) -> &mut Atom {
        &mut self.atoms[id]
    }

    /// Append an atom in scan order: the previously appended atom's
    /// successor is pointed here, and top-level bytes preceding the
    /// media-data box are tallied.
    pub fn push_scanned(&mut self, atom: Atom) -> AtomId {
        let id = self.atoms.len();
        if atom.name.is(b"mdat") {
            self.passed_mdat = true;
        }
        if !self.passed_mdat && atom.depth == 1 {
            self.bytes_before_mdat = self.bytes_before_mdat.wrapping_add(atom.declared_len);
        }
        if let Some(last) = self.atoms.last_mut() {
            last.successor = Some(id);
        }
        self.atoms.push(Atom {
            successor: None,
            ..atom
        });
        id
    }

    /// Append an atom without linking it into the chain; the caller wires
    /// the successor pointers.
    pub fn push_detached(&mut self, atom: Atom) -> AtomId {
        let id = self.atoms.len();
        self.atoms.push(atom);
        id
    }

    /// Walk the successor chain from index 0 in document order. A cycle
    /// guard terminates traversal after one full arena's worth of visits.
    pub fn chain(&self) -> Chain<'_> {
        Chain {
            store: self,
            next: if self.atoms.is_empty() { None } else { Some(0) },
            visited: 0,
        }
    }

    /// Position of an atom within the live chain, if reachable.
    pub fn chain_position(&self, id: AtomId) -> Option<usize> {
        self.chain().position(|cur| cur == id)
    }

    /// The atom whose successor is `id`; index 0 when `id` heads the
    /// chain or is unreachable.
    pub fn preceding(&self, id: AtomId) -> AtomId {
        let mut prev = 0;
        for cur in self.chain() {
            if cur == id {
                return prev;
            }
            prev = cur;
        }
        0
    }

    /// The structural parent: the nearest preceding atom exactly one
    /// level up.
    pub fn parent_of(&self, id: AtomId) -> Option<AtomId> {
        let depth = self.atom(id).depth;
        if depth <= 1 {
            return None;
        }
        let mut iter = id;
        while iter != 0 {
            iter = self.preceding(iter);
            if self.atom(iter).depth == depth - 1 {
                return Some(iter);
            }
        }
        None
    }

    /// The final atom of the chain.
    pub fn last_atom(&self) -> AtomId {
        self.chain().last().unwrap_or(0)
    }

    /// The last atom inside `id`'s hierarchy; `id` itself when childless.
    pub fn last_descendant(&self, id: AtomId) -> AtomId {
        let depth = self.atom(id).depth;
        let mut last = id;
        let mut child = match self.atom(id).successor {
            Some(c) => c,
            None => return id,
        };
        loop {
            if self.atom(child).depth > depth {
                last = child;
            }
            match self.atom(child).successor {
                Some(next) if self.atom(next).depth > depth => child = next,
                _ => break,
            }
        }
        last
    }

    /// Count the immediate children of `id`. Passing index 0 enumerates
    /// the top-level atoms following the file-type box.
    pub fn child_count(&self, parent: AtomId) -> usize {
        let mut count = 0;
        let mut index = 0;
        while self.nth_child_inner(parent, index + 1).is_some() {
            index += 1;
            count += 1;
        }
        count
    }

    /// The n-th (1-based) immediate child of `id`.
    pub fn nth_child(&self, parent: AtomId, index: usize) -> Option<AtomId> {
        self.nth_child_inner(parent, index)
    }

    fn nth_child_inner(&self, parent: AtomId, index: usize) -> Option<AtomId> {
        let parent_depth = self.atom(parent).depth;
        let mut seen = 0;
        let mut iter = self.atom(parent).successor;
        let mut guard = 0;
        while let Some(cur) = iter {
            guard += 1;
            if guard > self.atoms.len() {
                break;
            }
            let depth = self.atom(cur).depth;
            if (parent != 0 && depth == parent_depth + 1) || (parent == 0 && depth == 1) {
                seen += 1;
                if seen == index {
                    return Some(cur);
                }
            }
            if parent != 0 && depth <= parent_depth {
                break;
            }
            iter = self.atom(cur).successor;
        }
        None
    }

    /// The last child of `parent` carrying `tag`, or the parent's last
    /// descendant when no sibling matches. Used to group repeated
    /// same-named atoms (localized 3GP assets) on insertion.
    pub fn last_like_named_child(&self, parent: AtomId, tag: &[u8; 4]) -> AtomId {
        let mut last = self.last_descendant(parent);
        let parent_depth = self.atom(parent).depth;
        let mut eval = self.atom(parent).successor;
        let mut guard = 0;
        while let Some(cur) = eval {
            guard += 1;
            if guard > self.atoms.len() {
                break;
            }
            let atom = self.atom(cur);
            if atom.depth < parent_depth + 1 {
                break;
            }
            if atom.depth == parent_depth + 1 && atom.name.is(tag) {
                last = cur;
            }
            eval = atom.successor;
        }
        last
    }

    /// Whether `id` occurs before the first media-data box in document
    /// order; removals of such atoms shift every chunk offset.
    pub fn precedes_media_data(&self, id: AtomId) -> bool {
        let mut found = false;
        for cur in self.chain() {
            if self.atom(cur).name.is(b"mdat") {
                return found;
            }
            if cur == id {
                found = true;
            }
        }
        false
    }

    /// Sum the on-disk lengths of every live atom with this tag.
    pub fn tally_for(&self, tag: &[u8; 4]) -> u64 {
        let mut tally = 0;
        for cur in self.chain() {
            let atom = self.atom(cur);
            if atom.name.is(tag) {
                tally += atom.physical_len(self.file_size);
            }
        }
        tally
    }

    /// Where the media-data box will start once the tree is written:
    /// the sum of top-level lengths preceding it. Trivial placeholder
    /// `mdat` boxes (up to 75 bytes) are skipped.
    pub fn media_data_position(&self) -> u32 {
        let mut position: u32 = 0;
        for cur in self.chain() {
            let atom = self.atom(cur);
            if atom.name.is(b"mdat") && atom.depth == 1 {
                if atom.declared_len <= 1 || atom.declared_len > 75 {
                    break;
                }
            } else if atom.depth == 1 {
                if atom.extended_len == 0 {
                    position = position.wrapping_add(atom.declared_len);
                } else {
                    position = position.wrapping_add(atom.extended_len as u32);
                }
            }
        }
        position
    }

    /// The dotted path of an atom, derived from depths in memory
    /// (lengths may be stale between edits and size resolution).
    pub fn full_path(&self, id: AtomId) -> String {
        let mut names = vec![self.path_segment(id)];
        let mut current_depth = self.atom(id).depth;
        let mut cur = id;
        while cur != 0 && current_depth > 1 {
            cur = self.preceding(cur);
            let atom = self.atom(cur);
            if atom.depth < current_depth {
                names.push(self.path_segment(cur));
                current_depth = atom.depth;
            }
        }
        names.reverse();
        names.join(".")
    }

    fn path_segment(&self, id: AtomId) -> String {
        let atom = self.atom(id);
        match (&atom.framing, &atom.name) {
            (Framing::ExtendedUuid { .. }, AtomName::Fourcc(_)) => {
                format!("uuid={}", atom.name.display())
            }
            _ => atom.name.display(),
        }
    }

    /// First live atom with this tag, in document order.
    pub fn find_named(&self, tag: &[u8; 4]) -> Option<AtomId> {
        self.chain().find(|&cur| self.atom(cur).name.is(tag))
    }
}

/// Iterator over the successor chain.
pub struct Chain<'a> {
    store: &'a AtomStore,
    next: Option<AtomId>,
    visited: usize,
}

impl Iterator for Chain<'_> {
    type Item = AtomId;

    fn next(&mut self) -> Option<AtomId> {
        let cur = self.next?;
        if self.visited > self.store.len() {
            return None;
        }
        self.visited += 1;
        self.next = self.store.atom(cur).successor;
        Some(cur)
    }
}
