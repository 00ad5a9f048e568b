//! Layout planning: in-place patch vs. full rewrite
//!
//! The planner reorders the tree so the movie box precedes the media
//! data and user data is the movie box's last child, surveys reclaimable
//! padding, and then decides the write strategy. Rules, in priority
//! order: a forced reorder mandates a rewrite; otherwise available free
//! space covering the user-data growth with an 8-byte margin permits an
//! in-place patch (a residual `free` box must never be degenerately
//! short); otherwise a rewrite is planned and default padding injected
//! so future edits can patch. Padding above the configured maximum is
//! trimmed back to the default, but only on rewrites.

use tracing::debug;

use crate::core::atom::{AtomId, PayloadKind, StructuralKind};
use crate::core::edit;
use crate::core::path;
use crate::core::sizes;
use crate::core::store::AtomStore;

/// Padding budget thresholds, in bytes.
#[derive(Debug, Clone, Copy)]
pub struct PaddingPrefs {
    /// Padding below this forces consolidation
    pub minimum: u32,
    /// Amount injected on rewrites and used when trimming
    pub default: u32,
    /// Padding above this is trimmed on the next rewrite
    pub maximum: u32,
}

impl Default for PaddingPrefs {
    fn default() -> Self {
        PaddingPrefs {
            minimum: 0,
            default: 2048,
            maximum: 5000,
        }
    }
}

impl PaddingPrefs {
    pub fn minimum(mut self, bytes: u32) -> Self {
        self.minimum = bytes;
        self
    }

    pub fn default_amount(mut self, bytes: u32) -> Self {
        self.default = bytes;
        self
    }

    pub fn maximum(mut self, bytes: u32) -> Self {
        self.maximum = bytes;
        self
    }
}

/// The write strategy chosen for this session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WritePlan {
    /// Only the user-data subtree and trailing padding are rewritten
    PatchPlanned,
    /// The whole tree is serialized to a new file
    RewritePlanned,
}

/// Planner state discovered while preparing a write; reset per session.
#[derive(Debug, Default)]
pub struct Dynamics {
    pub moov: Option<AtomId>,
    pub udta: Option<AtomId>,
    pub last_udta_child: Option<AtomId>,
    /// The top-level padding repository
    pub free_repository: Option<AtomId>,
    /// The largest nested padding atom, used when no top-level one exists
    pub secondary_repository: Option<AtomId>,
    /// First atom after the user-data subtree and its trailing padding
    pub first_postfree_level1: Option<AtomId>,
    /// Padding bytes within the region a patch rewrites
    pub contained_free_space: u32,
    /// All reclaimable padding bytes in the tree
    pub max_usable_free_space: u32,
    /// The movie box had to be relocated in front of the media data
    pub moov_was_moved: bool,
}

fn is_padding(store: &AtomStore, id: AtomId) -> bool {
    store.atom(id).name.is(b"free") || store.atom(id).name.is(b"skip")
}

/// Reorder so the movie box precedes the media data and user data is the
/// movie box's last child. Fragmented files are never reordered. Padding
/// atoms trailing the movie box are temporarily reparented one level
/// down so they follow it through the move.
pub fn optimize(store: &mut AtomStore, dynamics: &mut Dynamics) {
    let total = store.child_count(0);
    let mut move_moov = true;
    for i in 1..=total {
        if let Some(child) = store.nth_child(0, i) {
            let name = &store.atom(child).name;
            if name.is(b"moof") || name.is(b"mfra") {
                move_moov = false;
            }
        }
    }

    let mut first_mdat = None;
    let mut moov = None;
    let mut last_noteworthy: Option<AtomId> = None;
    let mut trailing_padding: Vec<AtomId> = Vec::new();
    for i in 1..=total {
        let Some(child) = store.nth_child(0, i) else {
            break;
        };
        let name = store.atom(child).name;
        if name.is(b"mdat") && first_mdat.is_none() {
            first_mdat = Some(child);
        }
        if name.is(b"moov") {
            moov = Some(child);
        }
        if name.is(b"free") {
            let after_moov = last_noteworthy
                .map(|n| store.atom(n).name.is(b"moov"))
                .unwrap_or(false);
            if after_moov && trailing_padding.len() < 5 {
                trailing_padding.push(child);
            }
        } else {
            last_noteworthy = Some(child);
        }
    }
    dynamics.moov = moov;

    if move_moov {
        if let (Some(moov), Some(mdat)) = (moov, first_mdat) {
            let moov_pos = store.chain_position(moov);
            let mdat_pos = store.chain_position(mdat);
            if mdat_pos < moov_pos {
                for &pad in &trailing_padding {
                    store.atom_mut(pad).depth += 1;
                }
                edit::move_atom(store, moov, mdat);
                for &pad in &trailing_padding {
                    store.atom_mut(pad).depth -= 1;
                }
                dynamics.moov_was_moved = true;
                debug!("relocated moov in front of mdat");
            }
        }
    }

    if let Some(moov) = moov {
        let count = store.child_count(moov);
        let mut udta = None;
        let mut any_child = None;
        for i in 1..=count {
            let Some(child) = store.nth_child(moov, i) else {
                break;
            };
            let atom = store.atom(child);
            if atom.name.is(b"udta") && atom.depth == 2 {
                udta = Some(child);
            } else if !atom.name.is(b"free") {
                any_child = Some(child);
            }
        }
        if let (Some(udta), Some(sibling)) = (udta, any_child) {
            if store.chain_position(sibling) > store.chain_position(udta) {
                edit::move_atom(store, udta, sibling);
                debug!("reordered udta to be moov's last child");
            }
        }
        dynamics.udta = udta;
    }
}

/// Tally reclaimable padding and pick the repositories: the first
/// top-level `free` after user data is primary, the largest nested one
/// secondary. Also finds where the patchable region ends.
fn survey_free_space(store: &AtomStore, dynamics: &mut Dynamics) {
    dynamics.max_usable_free_space = 0;
    dynamics.contained_free_space = 0;
    dynamics.free_repository = None;
    dynamics.secondary_repository = None;
    dynamics.first_postfree_level1 = None;

    for id in store.chain() {
        if !is_padding(store, id) {
            continue;
        }
        let atom = store.atom(id);
        dynamics.max_usable_free_space = dynamics
            .max_usable_free_space
            .wrapping_add(atom.declared_len);
        if atom.depth == 1 {
            if dynamics.free_repository.is_none() {
                dynamics.free_repository = Some(id);
            }
        } else {
            match dynamics.secondary_repository {
                None => dynamics.secondary_repository = Some(id),
                Some(existing) if atom.declared_len > store.atom(existing).declared_len => {
                    dynamics.secondary_repository = Some(id)
                }
                _ => {}
            }
        }
    }

    let Some(udta) = dynamics.udta else {
        return;
    };
    let last_udta_child = dynamics.last_udta_child.unwrap_or(udta);
    let mut transited = false;
    let mut iter = store.atom(udta).successor;
    let mut guard = 0;
    while let Some(cur) = iter {
        guard += 1;
        if guard > store.len() {
            break;
        }
        if is_padding(store, cur) {
            if !transited {
                dynamics.contained_free_space = dynamics
                    .contained_free_space
                    .wrapping_add(store.atom(cur).declared_len);
            }
        } else if transited {
            dynamics.first_postfree_level1 = Some(cur);
            break;
        }
        if cur == last_udta_child {
            transited = true;
        }
        iter = store.atom(cur).successor;
    }
}

/// Grow the padding repository to `amount` (interjecting one after the
/// movie box when none exists).
fn force_padding(store: &mut AtomStore, dynamics: &mut Dynamics, amount: u32) {
    if amount == 0 {
        return;
    }
    let repository = dynamics.free_repository.or(dynamics.secondary_repository);
    match repository {
        Some(repo) => {
            store
                .atom_mut(repo)
                .set_payload(vec![0; amount.saturating_sub(8) as usize]);
        }
        None => {
            if let Some(moov) = dynamics.moov {
                let preceding = store.last_descendant(moov);
                let id = edit::interject(
                    store,
                    b"free",
                    StructuralKind::Leaf,
                    PayloadKind::Simple,
                    amount,
                    0,
                    0,
                    1,
                    preceding,
                );
                dynamics.free_repository = Some(id);
            }
        }
    }
}

/// Collapse every padding atom in the user-data region into a single
/// repository of exactly `amount` bytes.
fn consolidate_padding(store: &mut AtomStore, dynamics: &mut Dynamics, amount: u32) {
    if amount <= 8 {
        // an atom this short would be degenerate or vanish entirely
        return;
    }
    let repository = match dynamics.free_repository.or(dynamics.secondary_repository) {
        Some(repo) => repo,
        None => {
            if let Some(moov) = dynamics.moov {
                let preceding = store.last_descendant(moov);
                let id = edit::interject(
                    store,
                    b"free",
                    StructuralKind::Leaf,
                    PayloadKind::Simple,
                    amount,
                    0,
                    0,
                    1,
                    preceding,
                );
                dynamics.free_repository = Some(id);
            }
            return;
        }
    };

    if let Some(udta) = dynamics.udta {
        let mut iter = store.atom(udta).successor;
        let mut guard = 0;
        while let Some(cur) = iter {
            guard += 1;
            if guard > store.len() {
                break;
            }
            let next = store.atom(cur).successor;
            if is_padding(store, cur) && cur != repository {
                if Some(cur) == dynamics.last_udta_child {
                    dynamics.last_udta_child = Some(store.preceding(cur));
                }
                edit::eliminate(store, cur, next);
            }
            if Some(cur) == dynamics.first_postfree_level1 {
                break;
            }
            iter = next;
        }
    }
    store
        .atom_mut(repository)
        .set_payload(vec![0; (amount - 8) as usize]);
}

/// Seed padding for files that carry no user-data box at all.
pub fn force_padding_sans_udta(
    store: &mut AtomStore,
    dynamics: &mut Dynamics,
    prefs: &PaddingPrefs,
) {
    let total = store.child_count(0);
    let mut moov = None;
    let mut significant = None;
    let mut free_space = 0u32;
    for i in 1..=total {
        let Some(child) = store.nth_child(0, i) else {
            break;
        };
        let atom = store.atom(child);
        if atom.name.is(b"moov") {
            moov = Some(child);
        }
        if atom.name.is(b"mdat") || atom.name.is(b"moof") {
            significant = Some(child);
        }
        if (atom.name.is(b"free") || atom.name.is(b"skip"))
            && moov.is_some()
            && significant.is_none()
        {
            free_space = free_space.wrapping_add(if atom.declared_len == 1 {
                atom.extended_len as u32
            } else {
                atom.declared_len
            });
        }
    }
    dynamics.moov = dynamics.moov.or(moov);
    if free_space <= prefs.minimum && prefs.default >= 8 {
        if let Some(moov) = moov {
            let preceding = store.last_descendant(moov);
            edit::interject(
                store,
                b"free",
                StructuralKind::Leaf,
                PayloadKind::Simple,
                prefs.default,
                0,
                0,
                1,
                preceding,
            );
        }
    }
}

/// Reorder, resolve sizes, survey padding, and choose the strategy.
pub fn plan(
    store: &mut AtomStore,
    dynamics: &mut Dynamics,
    prefs: &PaddingPrefs,
    allow_patch: bool,
) -> WritePlan {
    if !store.psp_brand {
        optimize(store, dynamics);
    } else {
        dynamics.moov = store.find_named(b"moov");
    }
    sizes::resolve_lengths(store);

    let udta = path::find_atom(store, "moov.udta", false, PayloadKind::Simple, 0, false);
    dynamics.udta = udta;
    let Some(udta_id) = udta else {
        force_padding_sans_udta(store, dynamics, prefs);
        sizes::resolve_lengths(store);
        return WritePlan::RewritePlanned;
    };
    dynamics.last_udta_child = Some(store.last_descendant(udta_id));
    survey_free_space(store, dynamics);

    let growth = store.atom(udta_id).declared_len as i64 - store.original_udta_size as i64;
    let free = dynamics.max_usable_free_space as i64;
    let patchable = store.atom(udta_id).start != 0;

    let mut patch =
        allow_patch && !dynamics.moov_was_moved && patchable && free >= growth + 8;
    debug!(
        growth,
        free,
        patch,
        moved = dynamics.moov_was_moved,
        "write strategy decision"
    );

    if patch {
        if (prefs.minimum as i64) < free && free < prefs.default as i64 {
            force_padding(store, dynamics, prefs.default);
        }
        if free < prefs.minimum as i64 {
            consolidate_padding(store, dynamics, prefs.minimum);
            patch = false;
        }
        if free > prefs.maximum as i64 {
            // trim oversized padding down, which itself needs a rewrite
            consolidate_padding(store, dynamics, prefs.default);
            patch = false;
        }
        if growth.unsigned_abs() > prefs.maximum as u64 {
            // a large removal (say, artwork) should reclaim its bytes
            consolidate_padding(store, dynamics, prefs.default);
            patch = false;
        }
    } else if free <= prefs.minimum as i64 {
        if prefs.default >= 8 {
            if let Some(moov) = dynamics.moov {
                let preceding = store.last_descendant(moov);
                edit::interject(
                    store,
                    b"free",
                    StructuralKind::Leaf,
                    PayloadKind::Simple,
                    prefs.default,
                    0,
                    0,
                    1,
                    preceding,
                );
            }
        }
    } else if free < prefs.default as i64 {
        consolidate_padding(store, dynamics, prefs.default);
    }

    sizes::resolve_lengths(store);
    if patch {
        WritePlan::PatchPlanned
    } else {
        WritePlan::RewritePlanned
    }
}

/// Second pass before an in-place patch: fold the region's padding into
/// the single trailing repository, shrunk or grown by however much the
/// user data changed.
pub fn rebalance_padding_for_patch(store: &mut AtomStore, dynamics: &mut Dynamics) {
    let Some(udta_id) = dynamics.udta else {
        return;
    };
    let growth = store.atom(udta_id).declared_len as i64 - store.original_udta_size as i64;

    match dynamics.free_repository {
        Some(repo) => {
            let new_len = (store.atom(repo).declared_len as i64
                + dynamics.contained_free_space as i64
                - growth)
                .max(8) as u32;
            store
                .atom_mut(repo)
                .set_payload(vec![0; (new_len - 8) as usize]);
        }
        None => {
            let new_len = (dynamics.max_usable_free_space as i64 - growth).max(8) as u32;
            let preceding = dynamics.last_udta_child.unwrap_or(udta_id);
            let id = edit::interject(
                store,
                b"free",
                StructuralKind::Leaf,
                PayloadKind::Simple,
                new_len,
                0,
                0,
                1,
                preceding,
            );
            dynamics.free_repository = Some(id);
        }
    }

    // every other padding atom in the region folds into the repository
    let repository = dynamics.free_repository;
    let mut iter = store.atom(udta_id).successor;
    let mut guard = 0;
    while let Some(cur) = iter {
        guard += 1;
        if guard > store.len() {
            break;
        }
        let next = store.atom(cur).successor;
        if is_padding(store, cur) && Some(cur) != repository {
            if Some(cur) == dynamics.last_udta_child {
                dynamics.last_udta_child = Some(store.preceding(cur));
            }
            edit::eliminate(store, cur, next);
        }
        if Some(cur) == dynamics.first_postfree_level1 {
            break;
        }
        iter = next;
    }
    sizes::resolve_lengths(store);
}
