//! Reading and writing Android-family boot images.
//!
//! A boot image packs a kernel, a ramdisk, and optional secondboot and
//! device-tree blobs into a single page-aligned file behind a fixed header.
//! This crate speaks the plain Android dialect plus the Bump and Loki
//! community variants, emitting the Samsung SEAndroid trailer on the write
//! side, and auto-detects the dialect of unknown inputs.
//!
//! Images are processed as streams: [`Reader`] walks header, entries, and
//! data in order without materializing segments in memory, and [`Writer`]
//! mirrors the walk while maintaining the SHA-1 identity hash and the
//! page-alignment invariants.
//!
//! ```no_run
//! use std::fs::File;
//!
//! use bootimg::Reader;
//!
//! # fn main() -> bootimg::Result<()> {
//! let file = File::open("boot.img")?;
//! let mut reader = Reader::new(file);
//! let header = reader.read_header()?;
//! println!("page size: {:?}", header.page_size);
//!
//! let mut buf = [0u8; 8192];
//! while let Some(entry) = reader.read_entry()? {
//!     let mut size = 0u64;
//!     loop {
//!         let n = reader.read_data(&mut buf)?;
//!         if n == 0 {
//!             break;
//!         }
//!         size += n as u64;
//!     }
//!     println!("{}: {} bytes", entry.entry_type, size);
//! }
//! # Ok(())
//! # }
//! ```

mod entry;
pub mod errors;
mod format;
mod header;
mod reader;
pub mod stream;
mod writer;

pub use entry::{Entry, EntryType};
pub use errors::{AndroidError, Error, LokiError, Result, SegmentError};
pub use format::Format;
pub use header::{Header, HeaderFields};
pub use reader::Reader;
pub use writer::Writer;
