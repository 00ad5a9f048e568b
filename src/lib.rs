//! # atomkit
//!
//! A pure Rust MPEG-4/3GP atom ("box") tree engine: parse a container's
//! box hierarchy into an editable in-memory model, locate and mutate
//! boxes by hierarchical path, recompute sizes bottom-up, patch in place
//! when padding permits or rewrite in full when it does not, adjust
//! chunk-offset tables whenever the media payload moves, and serialize
//! back to disk atomically.
//!
//! The high-level entry point is [`Mp4File`]:
//!
//! ```rust,no_run
//! use atomkit::{Mp4File, PayloadKind};
//!
//! # fn main() -> Result<(), atomkit::EngineError> {
//! let mut file = Mp4File::new();
//! file.open("movie.m4v")?;
//! file.set_metadata("moov.udta.meta.ilst.\u{A9}nam.data", 1, b"Title")?;
//! file.remove("moov.udta.meta.ilst.covr", PayloadKind::Simple, 0)?;
//! file.save()?;
//! # Ok(())
//! # }
//! ```
//!
//! The lower-level model ([`AtomStore`], [`find_atom`], the mutators in
//! [`core::edit`]) is exported for callers that drive the tree directly.

pub mod core;
pub mod files;

pub use crate::core::atom::{
    Atom, AtomId, AtomName, Framing, PayloadKind, StructuralKind, UuidKind, ANY_LANGUAGE,
};
pub use crate::core::error::{EngineError, EngineResult};
pub use crate::core::path::{find_atom, parse_path};
pub use crate::core::store::{AtomStore, MetadataStyle, ScanWarning};
pub use crate::files::layout::{PaddingPrefs, WritePlan};
pub use crate::files::scanner::{scan, ScanOptions};
pub use crate::files::session::Mp4File;
