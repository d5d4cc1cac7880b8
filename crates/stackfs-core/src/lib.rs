//! stackfs-core: a copy-on-write union filesystem.
//!
//! This crate composes two backing filesystems, a read-only lower layer
//! and a writable upper layer, into a single logical namespace:
//!
//! - **Reads** resolve through the union: the writable layer shadows the
//!   readable layer entirely.
//! - **Mutations** land on the writable layer, copying files and parent
//!   directories up from the readable layer on first touch.
//! - **Deletions** of entries that exist only on the readable layer are
//!   recorded in an append-only whiteout log on the writable layer, so
//!   they survive remounts without touching the readable layer.
//!
//! ```text
//! caller
//!   ↓
//! SerializingFs            # one top-level operation at a time
//!   ↓
//! UnionFs                  # precedence, whiteouts, copy-up, rename
//!   ↓              ↓
//! writable layer   readable layer     (any two Filesystem impls)
//! ```
//!
//! Backing layers are anything implementing [`Filesystem`]; [`MemoryFs`]
//! is the bundled reference backing.

pub mod error;
pub mod fs;
pub mod serial;
pub mod sync;
pub mod union;

pub use error::{FsError, FsResult};
pub use fs::{File, Filesystem, MemoryFs};
pub use serial::SerializingFs;
pub use sync::FairMutex;
pub use union::{MountOptions, OverlayFile, UnionFs};

// The type vocabulary lives in the leaf crate; re-export it flat.
pub use stackfs_types::{AbsentAction, AccessBase, EntryKind, ExistsAction, Metadata, OpenFlag};
