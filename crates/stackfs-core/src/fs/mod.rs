//! The backing-layer API: the [`Filesystem`] and [`File`] traits plus the
//! bundled in-memory reference backing.
//!
//! A union mount composes two of these; any pair of implementations
//! works, as long as the upper one is writable.

mod memory;
pub(crate) mod path;
mod traits;

pub use memory::MemoryFs;
pub use traits::{File, Filesystem};
