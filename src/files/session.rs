//! High-level parse-edit-write sessions
//!
//! [`Mp4File`] owns one file's atom store plus the per-session planner
//! state (padding repositories, chunk-offset delta, removed-byte
//! counter), all reset when a file is opened. Edits address atoms by
//! path; saving chooses between an in-place patch and a full rewrite and
//! finishes by atomically replacing the original (rename-over) unless a
//! distinct output path was requested.
//!
//! # Example
//!
//! ```rust,no_run
//! use atomkit::Mp4File;
//!
//! # fn main() -> Result<(), atomkit::EngineError> {
//! let mut file = Mp4File::new();
//! file.open("song.m4a")?;
//! file.set_metadata("moov.udta.meta.ilst.\u{A9}nam.data", 1, b"A Title")?;
//! file.save()?;
//! # Ok(())
//! # }
//! ```

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::core::atom::{Atom, AtomId, Framing, PayloadKind, UuidKind};
use crate::core::edit;
use crate::core::error::{EngineError, EngineResult};
use crate::core::path as atom_path;
use crate::core::sizes;
use crate::core::store::{AtomStore, MetadataStyle, ScanWarning};
use crate::files::layout::{self, Dynamics, PaddingPrefs, WritePlan};
use crate::files::offsets::OffsetState;
use crate::files::scanner::{self, ScanOptions};
use crate::files::writer;

/// One parse-edit-write session over a single file.
pub struct Mp4File {
    path: Option<PathBuf>,
    store: Option<AtomStore>,
    prefs: PaddingPrefs,
    dynamics: Dynamics,
    offsets: OffsetState,
    modified: bool,
    purge_all_free: bool,
    prevent_padded_update: bool,
}

impl Mp4File {
    pub fn new() -> Self {
        Mp4File {
            path: None,
            store: None,
            prefs: PaddingPrefs::default(),
            dynamics: Dynamics::default(),
            offsets: OffsetState::default(),
            modified: false,
            purge_all_free: false,
            prevent_padded_update: false,
        }
    }

    /// A session with explicit padding budget thresholds.
    pub fn with_padding(prefs: PaddingPrefs) -> Self {
        Mp4File {
            prefs,
            ..Mp4File::new()
        }
    }

    /// Never patch in place, even when padding would permit it.
    pub fn prevent_padded_update(&mut self, prevent: bool) {
        self.prevent_padded_update = prevent;
    }

    /// Open and scan a file, resetting all session state.
    pub fn open<P: AsRef<Path>>(&mut self, path: P) -> EngineResult<()> {
        let path = path.as_ref();
        let mut file = File::open(path)?;
        let store = scanner::scan(&mut file, ScanOptions::default())?;
        self.path = Some(path.to_path_buf());
        self.store = Some(store);
        self.dynamics = Dynamics::default();
        self.offsets = OffsetState::default();
        self.modified = false;
        self.purge_all_free = false;
        Ok(())
    }

    /// Full-structure scan of a file, rendered as an indented tree.
    /// Missing `moov` is tolerated here; nothing will be written.
    pub fn dump_tree<P: AsRef<Path>>(path: P) -> EngineResult<String> {
        let mut file = File::open(path.as_ref())?;
        let store = scanner::scan(&mut file, ScanOptions::default().full_structure())?;
        Ok(render_tree(&store))
    }

    pub fn store(&self) -> Option<&AtomStore> {
        self.store.as_ref()
    }

    pub fn store_mut(&mut self) -> Option<&mut AtomStore> {
        self.store.as_mut()
    }

    /// Anomalies recovered during the scan, for surfacing to the user.
    pub fn warnings(&self) -> &[ScanWarning] {
        self.store
            .as_ref()
            .map(|s| s.warnings.as_slice())
            .unwrap_or(&[])
    }

    pub fn metadata_style(&self) -> MetadataStyle {
        self.store
            .as_ref()
            .map(|s| s.metadata_style)
            .unwrap_or_default()
    }

    /// Resolve a path without creating anything.
    pub fn find(&mut self, path: &str, kind: PayloadKind, language: u16) -> Option<AtomId> {
        let store = self.store.as_mut()?;
        atom_path::find_atom(store, path, false, kind, language, false)
    }

    pub fn atom(&self, id: AtomId) -> Option<&Atom> {
        self.store.as_ref().map(|s| s.atom(id))
    }

    /// The parsed hierarchy as an indented listing.
    pub fn tree(&self) -> String {
        self.store.as_ref().map(render_tree).unwrap_or_default()
    }

    fn is_3gp(&self) -> bool {
        matches!(
            self.metadata_style(),
            MetadataStyle::ThirdGenPartner
                | MetadataStyle::ThirdGenPartnerRel6
                | MetadataStyle::ThirdGenPartnerVer2
        )
    }

    /// Guarantee `moov.udta.meta.hdlr` exists; without it iTunes refuses
    /// to see any metadata at all.
    fn ensure_handler(&mut self) -> EngineResult<()> {
        if self.metadata_style() != MetadataStyle::Itunes {
            return Ok(());
        }
        let store = self
            .store
            .as_mut()
            .ok_or(EngineError::MissingRequiredBox("moov"))?;
        let existing = atom_path::find_atom(
            store,
            "moov.udta.meta.hdlr",
            false,
            PayloadKind::Versioned,
            0,
            false,
        );
        if existing.is_some() {
            return Ok(());
        }
        let id = atom_path::find_atom(
            store,
            "moov.udta.meta.hdlr",
            true,
            PayloadKind::Versioned,
            0,
            false,
        )
        .ok_or_else(|| EngineError::BadPath("moov.udta.meta.hdlr".to_string()))?;
        let mut payload = vec![0u8; 4];
        payload.extend_from_slice(b"mdir");
        payload.extend_from_slice(b"appl");
        payload.extend_from_slice(&[0u8; 8]);
        payload.extend_from_slice(&[0u8; 2]);
        let atom = store.atom_mut(id);
        atom.framing = Framing::Versioned { version_flags: 0 };
        atom.set_payload(payload);
        Ok(())
    }

    /// Set an iTunes-style `data` atom: version/flags, four locale NULs,
    /// then the payload bytes verbatim. An empty payload removes the
    /// whole metadata box.
    pub fn set_metadata(&mut self, path: &str, flags: u32, payload: &[u8]) -> EngineResult<()> {
        atom_path::parse_path(path)?;
        if self.metadata_style() != MetadataStyle::Itunes {
            warn!("iTunes-style tags are for ordinary MPEG-4 files; skipping");
            return Ok(());
        }
        if payload.is_empty() {
            return self.remove(path, PayloadKind::Versioned, 0);
        }
        self.ensure_handler()?;
        let store = self
            .store
            .as_mut()
            .ok_or(EngineError::MissingRequiredBox("moov"))?;
        let id = atom_path::find_atom(store, path, true, PayloadKind::Versioned, 0, false)
            .ok_or_else(|| EngineError::BadPath(path.to_string()))?;
        let mut buffer = vec![0u8; 4];
        buffer.extend_from_slice(payload);
        let atom = store.atom_mut(id);
        atom.framing = Framing::Versioned {
            version_flags: flags,
        };
        atom.set_payload(buffer);
        self.modified = true;
        Ok(())
    }

    /// Set a 3GP user-data asset: version/flags, packed language, then
    /// the payload bytes (already encoded by the caller). An empty
    /// payload removes the matching-language asset.
    pub fn set_user_data(
        &mut self,
        path: &str,
        payload: &[u8],
        language: u16,
    ) -> EngineResult<()> {
        let segments = atom_path::parse_path(path)?;
        if !self.is_3gp() {
            warn!("3GP assets are only available on 3GPP files; skipping");
            return Ok(());
        }
        let terminal = segments.last().map(|s| s.name).unwrap_or([0; 4]);
        if terminal == *b"albm" && self.metadata_style() == MetadataStyle::ThirdGenPartner {
            warn!("the 'albm' asset needs a 3gp6 or later brand; skipping");
            return Ok(());
        }
        if payload.is_empty() {
            return self.remove(path, PayloadKind::PackedLanguage, language);
        }
        let store = self
            .store
            .as_mut()
            .ok_or(EngineError::MissingRequiredBox("moov"))?;
        let id = atom_path::find_atom(store, path, true, PayloadKind::PackedLanguage, language, false)
            .ok_or_else(|| EngineError::BadPath(path.to_string()))?;
        let mut buffer = language.to_be_bytes().to_vec();
        buffer.extend_from_slice(payload);
        let atom = store.atom_mut(id);
        atom.framing = Framing::PackedLanguage {
            version_flags: 0,
            language,
        };
        atom.set_payload(buffer);
        self.modified = true;
        Ok(())
    }

    /// Set a self-authored `uuid` extension atom under
    /// `moov.udta.meta`, addressed by its 4-character owner tag.
    pub fn set_extension(&mut self, tag: [u8; 4], flags: u32, payload: &[u8]) -> EngineResult<()> {
        let path = format!(
            "moov.udta.meta.uuid={}",
            crate::core::atom::AtomName::Fourcc(tag).display()
        );
        if payload.is_empty() {
            return self.remove(&path, PayloadKind::ExtendedUuid, 0);
        }
        self.ensure_handler()?;
        let store = self
            .store
            .as_mut()
            .ok_or(EngineError::MissingRequiredBox("moov"))?;
        let id = atom_path::find_atom(store, &path, true, PayloadKind::ExtendedUuid, 0, false)
            .ok_or_else(|| EngineError::BadPath(path))?;
        let mut buffer = vec![0u8; 4];
        buffer.extend_from_slice(payload);
        let atom = store.atom_mut(id);
        atom.framing = Framing::ExtendedUuid {
            kind: UuidKind::AppNamespaceV5,
            owner_tag: Some(tag),
            version_flags: flags,
        };
        atom.set_payload(buffer);
        self.modified = true;
        Ok(())
    }

    /// Remove the atom addressed by `path` (see the removal policy on
    /// [`edit::remove`]). Removing something that is not there is not a
    /// change.
    pub fn remove(&mut self, path: &str, kind: PayloadKind, language: u16) -> EngineResult<()> {
        let store = self
            .store
            .as_mut()
            .ok_or(EngineError::MissingRequiredBox("moov"))?;
        if edit::remove(store, path, kind, language) {
            self.modified = true;
        }
        Ok(())
    }

    /// Erase padding atoms; -1 erases all of them and disables in-place
    /// patching for this session.
    pub fn purge_free(&mut self, level: i32) -> EngineResult<()> {
        let store = self
            .store
            .as_mut()
            .ok_or(EngineError::MissingRequiredBox("moov"))?;
        edit::purge_free(store, level);
        if level == -1 {
            self.purge_all_free = true;
        }
        self.modified = true;
        Ok(())
    }

    /// Copy the raw `moov.udta` byte range out of the source file.
    pub fn dump_user_data<W: Write>(&mut self, out: &mut W) -> EngineResult<u64> {
        let path = self
            .path
            .clone()
            .ok_or(EngineError::MissingRequiredBox("ftyp"))?;
        let store = self
            .store
            .as_mut()
            .ok_or(EngineError::MissingRequiredBox("moov"))?;
        let udta = atom_path::find_atom(store, "moov.udta", false, PayloadKind::Simple, 0, false)
            .ok_or(EngineError::MissingRequiredBox("udta"))?;
        let start = store.atom(udta).start as u64;
        let len = store.atom(udta).declared_len as u64;
        let mut file = File::open(&path)?;
        file.seek(SeekFrom::Start(start))?;
        let mut buffer = vec![0u8; len as usize];
        file.read_exact(&mut buffer)?;
        out.write_all(&buffer)?;
        Ok(len)
    }

    /// Write changes back over the original file.
    pub fn save(&mut self) -> EngineResult<()> {
        self.write_output(None)
    }

    /// Write to a distinct output path; always a full rewrite, and the
    /// original is left untouched.
    pub fn save_as<P: AsRef<Path>>(&mut self, outfile: P) -> EngineResult<()> {
        self.write_output(Some(outfile.as_ref()))
    }

    fn write_output(&mut self, outfile: Option<&Path>) -> EngineResult<()> {
        let path = self
            .path
            .clone()
            .ok_or(EngineError::MissingRequiredBox("ftyp"))?;
        if !self.modified {
            debug!("no atoms were modified; skipping write");
            return Ok(());
        }
        let store = self
            .store
            .as_mut()
            .ok_or(EngineError::MissingRequiredBox("moov"))?;

        let allow_patch =
            outfile.is_none() && !self.purge_all_free && !self.prevent_padded_update;
        let plan = if self.purge_all_free {
            layout::force_padding_sans_udta(store, &mut self.dynamics, &self.prefs);
            sizes::resolve_lengths(store);
            WritePlan::RewritePlanned
        } else {
            layout::plan(store, &mut self.dynamics, &self.prefs, allow_patch)
        };

        // nothing may touch the disk until this passes
        writer::validate(store)?;

        let mut source = File::open(&path)?;
        match plan {
            WritePlan::PatchPlanned => {
                debug!("updating metadata in place");
                layout::rebalance_padding_for_patch(store, &mut self.dynamics);
                let udta = self
                    .dynamics
                    .udta
                    .ok_or(EngineError::MissingRequiredBox("udta"))?;
                let last = self.dynamics.last_udta_child.unwrap_or(udta);

                let mut side = tempfile::tempfile()?;
                let written = writer::write_region(store, &mut source, &mut side, udta, last)?;

                let mut original = OpenOptions::new().read(true).write(true).open(&path)?;
                if let Some(moov) = self.dynamics.moov {
                    let moov_atom = store.atom(moov);
                    original.seek(SeekFrom::Start(moov_atom.start as u64))?;
                    original.write_all(&moov_atom.declared_len.to_be_bytes())?;
                }
                let udta_start = store.atom(udta).start as u64;
                side.seek(SeekFrom::Start(0))?;
                original.seek(SeekFrom::Start(udta_start))?;
                std::io::copy(&mut (&mut side).take(written), &mut original)?;

                // whatever lies between the rewritten subtree and the
                // next stationary atom becomes one free atom
                if let Some(post) = self.dynamics.first_postfree_level1 {
                    let post_start = store.atom(post).start as u64;
                    let end = udta_start + written;
                    if post_start >= end + 8 {
                        let free_size = (post_start - end) as u32;
                        original.write_all(&free_size.to_be_bytes())?;
                        original.write_all(b"free")?;
                        original.write_all(&vec![0u8; (free_size - 8) as usize])?;
                    }
                }
                original.flush()?;
            }
            WritePlan::RewritePlanned => {
                debug!("writing full rewrite to temp file");
                let dest = outfile
                    .map(Path::to_path_buf)
                    .unwrap_or_else(|| path.clone());
                let dir = dest
                    .parent()
                    .filter(|p| !p.as_os_str().is_empty())
                    .unwrap_or_else(|| Path::new("."));
                let mut temp = tempfile::NamedTempFile::new_in(dir)?;
                let keep_gapless = self.prefs.default > 0;
                writer::write_rewrite(
                    store,
                    &mut self.offsets,
                    &mut source,
                    temp.as_file_mut(),
                    keep_gapless,
                )?;
                temp.as_file_mut().flush()?;
                temp.persist(&dest)
                    .map_err(|persist| EngineError::IoError(persist.error))?;
            }
        }
        self.modified = false;
        Ok(())
    }
}

impl Default for Mp4File {
    fn default() -> Self {
        Mp4File::new()
    }
}

fn render_tree(store: &AtomStore) -> String {
    let mut out = String::new();
    for id in store.chain() {
        let atom = store.atom(id);
        let indent = "    ".repeat((atom.depth as usize).saturating_sub(1));
        let end = atom.start as u64 + atom.physical_len(store.file_size);
        out.push_str(&format!(
            "{}Atom {} @ {} of size: {}, ends @ {}\n",
            indent,
            atom.name.display(),
            atom.start,
            atom.physical_len(store.file_size),
            end
        ));
    }
    if store.gapless_padding > 0 {
        out.push_str(&format!(
            "\u{A0}\u{A0}{} bytes of trailing null padding\n",
            store.gapless_padding
        ));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_new_session_is_empty() {
        let file = Mp4File::new();
        assert!(file.store().is_none());
        assert_eq!(file.tree(), "");
        assert_eq!(file.metadata_style(), MetadataStyle::Undefined);
    }

    #[test]
    fn test_open_missing_file() {
        let mut file = Mp4File::new();
        let result = file.open("does-not-exist.m4a");
        assert!(matches!(result, Err(EngineError::IoError(_))));
    }

    #[test]
    fn test_save_without_open() {
        let mut file = Mp4File::new();
        assert!(file.save().is_err());
    }
}
