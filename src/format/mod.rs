//! Format drivers for the supported boot image dialects.
//!
//! The format set is closed: dialect dispatch is a tagged enum, not an open
//! registry, and bidding is a fold over the enabled variants.

pub(crate) mod android;
pub(crate) mod bump;
pub(crate) mod loki;
pub(crate) mod segment;

use core::fmt;

use crate::entry::{Entry, EntryType};
use crate::errors::Result;
use crate::header::Header;
use crate::stream::Stream;

use self::android::{AndroidReader, AndroidWriter};
use self::loki::LokiReader;

/// A boot image dialect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Format {
    Android,
    Bump,
    Loki,
}

impl Format {
    pub fn name(self) -> &'static str {
        match self {
            Format::Android => "android",
            Format::Bump => "bump",
            Format::Loki => "loki",
        }
    }

    pub fn from_name(name: &str) -> Option<Format> {
        match name {
            "android" => Some(Format::Android),
            "bump" => Some(Format::Bump),
            "loki" => Some(Format::Loki),
            _ => None,
        }
    }

    /// Every supported dialect, in bidding order.
    pub fn all() -> &'static [Format] {
        &[Format::Android, Format::Bump, Format::Loki]
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Zero-padding needed to bring `pos` up to the next `page_size` boundary.
pub(crate) fn align_page_size(pos: u64, page_size: u64) -> u64 {
    if page_size == 0 {
        return 0;
    }
    (page_size - pos % page_size) % page_size
}

/// Read-side driver for one dialect.
pub(crate) enum FormatReader {
    Android(AndroidReader),
    Bump(AndroidReader),
    Loki(LokiReader),
}

impl FormatReader {
    pub fn new(format: Format) -> Self {
        match format {
            Format::Android => FormatReader::Android(AndroidReader::new(false)),
            Format::Bump => FormatReader::Bump(AndroidReader::new(true)),
            Format::Loki => FormatReader::Loki(LokiReader::new()),
        }
    }

    pub fn format(&self) -> Format {
        match self {
            FormatReader::Android(_) => Format::Android,
            FormatReader::Bump(_) => Format::Bump,
            FormatReader::Loki(_) => Format::Loki,
        }
    }

    /// Bids confidence in the format as a number of matched bits.
    /// `Ok(None)` means the bid cannot beat `best_bid`.
    pub fn bid<S: Stream>(&mut self, stream: &mut S, best_bid: u32) -> Result<Option<u32>> {
        match self {
            FormatReader::Android(r) | FormatReader::Bump(r) => r.bid(stream, best_bid),
            FormatReader::Loki(r) => r.bid(stream, best_bid),
        }
    }

    pub fn read_header<S: Stream>(&mut self, stream: &mut S) -> Result<Header> {
        match self {
            FormatReader::Android(r) | FormatReader::Bump(r) => r.read_header(stream),
            FormatReader::Loki(r) => r.read_header(stream),
        }
    }

    pub fn read_entry<S: Stream>(&mut self, stream: &mut S) -> Result<Option<Entry>> {
        match self {
            FormatReader::Android(r) | FormatReader::Bump(r) => r.read_entry(stream),
            FormatReader::Loki(r) => r.read_entry(stream),
        }
    }

    pub fn go_to_entry<S: Stream>(
        &mut self,
        stream: &mut S,
        entry_type: EntryType,
    ) -> Result<Option<Entry>> {
        match self {
            FormatReader::Android(r) | FormatReader::Bump(r) => r.go_to_entry(stream, entry_type),
            FormatReader::Loki(r) => r.go_to_entry(stream, entry_type),
        }
    }

    pub fn read_data<S: Stream>(&mut self, stream: &mut S, buf: &mut [u8]) -> Result<usize> {
        match self {
            FormatReader::Android(r) | FormatReader::Bump(r) => r.read_data(stream, buf),
            FormatReader::Loki(r) => r.read_data(stream, buf),
        }
    }
}

/// Write-side driver for one dialect.
pub(crate) enum FormatWriter {
    Android(AndroidWriter),
    Bump(AndroidWriter),
}

impl FormatWriter {
    pub fn format(&self) -> Format {
        match self {
            FormatWriter::Android(_) => Format::Android,
            FormatWriter::Bump(_) => Format::Bump,
        }
    }

    fn driver(&mut self) -> &mut AndroidWriter {
        match self {
            FormatWriter::Android(w) | FormatWriter::Bump(w) => w,
        }
    }

    pub fn write_header<S: Stream>(&mut self, stream: &mut S, header: &Header) -> Result<()> {
        self.driver().write_header(stream, header)
    }

    pub fn write_entry<S: Stream>(&mut self, stream: &mut S, entry: &Entry) -> Result<()> {
        self.driver().write_entry(stream, entry)
    }

    pub fn write_data<S: Stream>(&mut self, stream: &mut S, buf: &[u8]) -> Result<usize> {
        self.driver().write_data(stream, buf)
    }

    pub fn finish_entry<S: Stream>(&mut self, stream: &mut S) -> Result<()> {
        self.driver().finish_entry(stream)
    }

    pub fn close<S: Stream>(&mut self, stream: &mut S) -> Result<()> {
        self.driver().close(stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alignment_padding() {
        assert_eq!(align_page_size(0, 2048), 0);
        assert_eq!(align_page_size(1, 2048), 2047);
        assert_eq!(align_page_size(2048, 2048), 0);
        assert_eq!(align_page_size(0x400, 2048), 0x400);
        assert_eq!(align_page_size(4097, 4096), 4095);
        assert_eq!(align_page_size(12345, 0), 0);
    }

    #[test]
    fn format_names_round_trip() {
        for format in Format::all() {
            assert_eq!(Format::from_name(format.name()), Some(*format));
        }
        assert_eq!(Format::from_name("sony_elf"), None);
    }
}
