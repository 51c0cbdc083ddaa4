//! Virtual filesystem over the swarm: a flat directory of entries and a streaming file
//! adapter per entry.

pub mod directory;
pub mod error;
pub mod file;

pub use directory::{DirEntry, VirtualDirectory};
pub use error::FsError;
pub use file::{AdapterState, StreamOptions, StreamingFile};
