//! Atom tree core
//!
//! This module contains the data model and the pure tree logic: the atom
//! arena, the known-atom catalog, path resolution, mutation, and size
//! resolution. File scanning and writing live in [`crate::files`].

pub mod atom;
pub mod bytes;
pub mod catalog;
pub mod edit;
pub mod error;
pub mod path;
pub mod sizes;
pub mod store;
pub mod uuid;

pub use atom::{
    Atom, AtomId, AtomName, Framing, PayloadKind, StructuralKind, UuidKind, ANY_LANGUAGE,
};
pub use error::{EngineError, EngineResult};
pub use path::{find_atom, parse_path, Segment, UuidRef};
pub use store::{AtomStore, MetadataStyle, ScanWarning};
