//! ZIP listing and subset rewriting.
//!
//! - [`structures`]: record layouts and central directory entry parsing
//! - [`parser`]: finds and reads the central directory through [`ReadAt`](crate::io::ReadAt)
//! - [`writer`]: copies chosen local records into a new archive
//!
//! ZIP64 archives can be listed but are never rewritten. Multi-disk
//! archives are rejected.

mod parser;
mod structures;
mod writer;

pub use parser::ZipParser;
pub use structures::*;
pub use writer::ZipRebuilder;
