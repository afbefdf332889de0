use std::io::SeekFrom;

use log::debug;

use crate::entry::{Entry, EntryType};
use crate::errors::{Error, Result};
use crate::format::{Format, FormatReader};
use crate::header::Header;
use crate::stream::Stream;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReaderState {
    New,
    Entry,
    Data,
    Fatal,
}

/// Reads a boot image as a linear walk of header, entries, and data.
///
/// The dialect is auto-detected on the first [`read_header`] call by asking
/// every enabled format driver to bid its confidence; the highest bidder
/// wins, with ties going to the earlier driver. Construction with
/// [`with_format`](Reader::with_format) skips bidding entirely.
///
/// A stream failure that the stream reports as fatal poisons the reader:
/// every later call returns [`Error::Fatal`] without touching the stream.
pub struct Reader<S: Stream> {
    stream: S,
    state: ReaderState,
    formats: Vec<FormatReader>,
    current: Option<usize>,
}

impl<S: Stream> Reader<S> {
    /// Creates a reader with every supported format enabled.
    pub fn new(stream: S) -> Self {
        Self::with_formats(stream, Format::all())
    }

    /// Creates a reader with only the given formats enabled, bidding in the
    /// given order. Duplicates are ignored.
    pub fn with_formats(stream: S, formats: &[Format]) -> Self {
        let mut enabled: Vec<FormatReader> = Vec::new();
        for format in formats {
            if enabled.iter().all(|f| f.format() != *format) {
                enabled.push(FormatReader::new(*format));
            }
        }

        Reader {
            stream,
            state: ReaderState::New,
            formats: enabled,
            current: None,
        }
    }

    /// Creates a reader locked to one format, skipping the bid.
    pub fn with_format(stream: S, format: Format) -> Self {
        let mut reader = Self::with_formats(stream, &[format]);
        reader.current = Some(0);
        reader
    }

    /// The detected or forced format, once known.
    pub fn format(&self) -> Option<Format> {
        self.current.map(|i| self.formats[i].format())
    }

    /// Tolerate a trailing device tree shorter than its declared size
    /// (Android and Bump dialects).
    pub fn set_allow_truncated_dt(&mut self, allow: bool) {
        for format in &mut self.formats {
            if let FormatReader::Android(r) | FormatReader::Bump(r) = format {
                r.set_allow_truncated_dt(allow);
            }
        }
    }

    /// Strip trailing zero padding when guessing old-style Loki ramdisk
    /// sizes instead of keeping it (the compatible default).
    pub fn set_strip_ramdisk_padding(&mut self, strip: bool) {
        for format in &mut self.formats {
            if let FormatReader::Loki(r) = format {
                r.set_strip_ramdisk_padding(strip);
            }
        }
    }

    /// Releases the underlying stream.
    pub fn into_inner(self) -> S {
        self.stream
    }

    fn poison_on_fatal(&mut self, error: Error) -> Error {
        if self.stream.is_fatal() {
            self.state = ReaderState::Fatal;
        }
        error
    }

    fn bid(&mut self) -> Result<()> {
        if self.formats.is_empty() {
            return Err(Error::NoFormatsEnabled);
        }

        let mut best_bid = 0u32;
        let mut winner = None;

        for i in 0..self.formats.len() {
            if let Err(e) = self.stream.seek(SeekFrom::Start(0)) {
                return Err(self.poison_on_fatal(e.into()));
            }

            match self.formats[i].bid(&mut self.stream, best_bid) {
                Ok(Some(bits)) if bits > best_bid => {
                    best_bid = bits;
                    winner = Some(i);
                }
                Ok(_) => {}
                Err(e) => return Err(self.poison_on_fatal(e)),
            }
        }

        match winner {
            Some(i) => {
                debug!(
                    "detected {} format ({} bits)",
                    self.formats[i].format(),
                    best_bid
                );
                self.current = Some(i);
                Ok(())
            }
            None => Err(Error::UnknownFormat),
        }
    }

    /// Detects the format if necessary and reads the logical header.
    pub fn read_header(&mut self) -> Result<Header> {
        match self.state {
            ReaderState::New => {}
            ReaderState::Fatal => return Err(Error::Fatal),
            _ => return Err(Error::InvalidState { op: "read_header" }),
        }

        if self.current.is_none() {
            self.bid()?;
        }
        let current = self.current.unwrap();

        if let Err(e) = self.stream.seek(SeekFrom::Start(0)) {
            return Err(self.poison_on_fatal(e.into()));
        }

        match self.formats[current].read_header(&mut self.stream) {
            Ok(header) => {
                self.state = ReaderState::Entry;
                Ok(header)
            }
            Err(e) => Err(self.poison_on_fatal(e)),
        }
    }

    /// Advances to the next entry, or `None` past the last one.
    pub fn read_entry(&mut self) -> Result<Option<Entry>> {
        match self.state {
            ReaderState::Entry | ReaderState::Data => {}
            ReaderState::Fatal => return Err(Error::Fatal),
            ReaderState::New => return Err(Error::InvalidState { op: "read_entry" }),
        }
        let current = self.current.unwrap();

        match self.formats[current].read_entry(&mut self.stream) {
            Ok(Some(entry)) => {
                self.state = ReaderState::Data;
                Ok(Some(entry))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(self.poison_on_fatal(e)),
        }
    }

    /// Jumps to the entry of the given type, regardless of the cursor.
    pub fn go_to_entry(&mut self, entry_type: EntryType) -> Result<Entry> {
        match self.state {
            ReaderState::Entry | ReaderState::Data => {}
            ReaderState::Fatal => return Err(Error::Fatal),
            ReaderState::New => return Err(Error::InvalidState { op: "go_to_entry" }),
        }
        let current = self.current.unwrap();

        match self.formats[current].go_to_entry(&mut self.stream, entry_type) {
            Ok(Some(entry)) => {
                self.state = ReaderState::Data;
                Ok(entry)
            }
            Ok(None) => Err(Error::EntryNotFound),
            Err(e) => Err(self.poison_on_fatal(e)),
        }
    }

    /// Reads entry data, stopping at the segment boundary. Returns 0 at
    /// the end of the current entry.
    pub fn read_data(&mut self, buf: &mut [u8]) -> Result<usize> {
        match self.state {
            ReaderState::Data => {}
            ReaderState::Fatal => return Err(Error::Fatal),
            _ => return Err(Error::InvalidState { op: "read_data" }),
        }
        let current = self.current.unwrap();

        match self.formats[current].read_data(&mut self.stream, buf) {
            Ok(n) => Ok(n),
            Err(e) => {
                // A truncated segment leaves the walk unusable
                let fatal = matches!(
                    e,
                    Error::Segment(crate::errors::SegmentError::EntryIsTruncated { .. })
                );
                let e = self.poison_on_fatal(e);
                if fatal {
                    self.state = ReaderState::Fatal;
                }
                Err(e)
            }
        }
    }

    /// Reads the whole of the current entry into a buffer.
    pub fn read_entry_data(&mut self, entry: &Entry) -> Result<Vec<u8>> {
        let mut data = Vec::with_capacity(entry.size as usize);
        let mut buf = [0u8; 8192];
        loop {
            let n = self.read_data(&mut buf)?;
            if n == 0 {
                return Ok(data);
            }
            data.extend_from_slice(&buf[..n]);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::{self, Cursor, Read, Seek, SeekFrom, Write};

    use super::*;
    use crate::errors::LokiError;
    use crate::format::android::{AndroidHeader, SAMSUNG_SEANDROID_MAGIC};
    use crate::format::bump::BUMP_MAGIC;
    use crate::format::loki::{LOKI_MAGIC, LOKI_MAGIC_OFFSET};

    fn android_image(trailer: Option<&[u8; 16]>) -> Vec<u8> {
        let mut hdr = AndroidHeader::default();
        hdr.page_size = 2048;
        hdr.kernel_size = 0x400;
        hdr.ramdisk_size = 0x200;

        // header page + kernel page + ramdisk page
        let mut data = vec![0u8; 2048 * 3];
        let mut raw = Vec::new();
        hdr.write_to(&mut raw).unwrap();
        data[..raw.len()].copy_from_slice(&raw);
        if let Some(magic) = trailer {
            data.extend_from_slice(magic);
        }
        data
    }

    #[test]
    fn plain_android_image_bids_android() {
        let mut reader = Reader::new(Cursor::new(android_image(None)));
        reader.read_header().unwrap();
        assert_eq!(reader.format(), Some(Format::Android));
    }

    #[test]
    fn seandroid_trailer_prefers_android_over_bump() {
        let mut reader = Reader::new(Cursor::new(android_image(Some(SAMSUNG_SEANDROID_MAGIC))));
        reader.read_header().unwrap();
        assert_eq!(reader.format(), Some(Format::Android));
    }

    #[test]
    fn bump_trailer_prefers_bump() {
        let mut reader = Reader::new(Cursor::new(android_image(Some(BUMP_MAGIC))));
        reader.read_header().unwrap();
        assert_eq!(reader.format(), Some(Format::Bump));
    }

    #[test]
    fn loki_magic_beats_plain_android() {
        let mut data = android_image(None);
        let at = LOKI_MAGIC_OFFSET as usize;
        data[at..at + 4].copy_from_slice(LOKI_MAGIC);
        // Old-style Loki with a gzip ramdisk so read_header succeeds
        data[2048 + 0x2c..2048 + 0x30].copy_from_slice(&0x200u32.to_le_bytes());
        data[0x1000..0x1004].copy_from_slice(&[0x1f, 0x8b, 0x08, 0x08]);

        let mut reader = Reader::new(Cursor::new(data));
        reader.read_header().unwrap();
        assert_eq!(reader.format(), Some(Format::Loki));
    }

    #[test]
    fn empty_file_is_unknown_format() {
        let mut reader = Reader::new(Cursor::new(Vec::new()));
        assert!(matches!(reader.read_header(), Err(Error::UnknownFormat)));
    }

    #[test]
    fn forced_format_skips_bidding_and_surfaces_driver_error() {
        // Android image without a Loki header: forcing Loki must fail with
        // the Loki error, not UnknownFormat
        let mut reader = Reader::with_format(Cursor::new(android_image(None)), Format::Loki);
        assert!(matches!(
            reader.read_header(),
            Err(Error::Loki(LokiError::InvalidLokiMagic))
        ));
    }

    #[test]
    fn go_to_entry_reports_missing_types() {
        // An old-style Loki image has no device tree segment at all
        let mut data = android_image(None);
        let at = LOKI_MAGIC_OFFSET as usize;
        data[at..at + 4].copy_from_slice(LOKI_MAGIC);
        data[2048 + 0x2c..2048 + 0x30].copy_from_slice(&0x200u32.to_le_bytes());
        data[0x1000..0x1004].copy_from_slice(&[0x1f, 0x8b, 0x08, 0x08]);

        let mut reader = Reader::new(Cursor::new(data));
        reader.read_header().unwrap();
        assert!(matches!(
            reader.go_to_entry(EntryType::DeviceTree),
            Err(Error::EntryNotFound)
        ));
        // The walk is repositionable afterwards
        let entry = reader.go_to_entry(EntryType::Kernel).unwrap();
        assert_eq!(entry.entry_type, EntryType::Kernel);
    }

    /// Wraps a cursor and fails fatally on any read at the poisoned offset.
    struct FatalAt {
        inner: Cursor<Vec<u8>>,
        poisoned_offset: u64,
        fatal: bool,
    }

    impl Read for FatalAt {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.inner.position() == self.poisoned_offset {
                self.fatal = true;
                return Err(io::Error::new(io::ErrorKind::Other, "injected failure"));
            }
            self.inner.read(buf)
        }
    }

    impl Write for FatalAt {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.inner.write(buf)
        }

        fn flush(&mut self) -> io::Result<()> {
            self.inner.flush()
        }
    }

    impl Seek for FatalAt {
        fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
            self.inner.seek(pos)
        }
    }

    impl Stream for FatalAt {
        fn is_fatal(&self) -> bool {
            self.fatal
        }
    }

    #[test]
    fn fatal_stream_poisons_the_reader() {
        let stream = FatalAt {
            inner: Cursor::new(vec![0u8; 0x1000]),
            poisoned_offset: LOKI_MAGIC_OFFSET,
            fatal: false,
        };
        let mut reader = Reader::new(stream);

        // The Loki bid reads at 0x400 and dies
        assert!(matches!(reader.read_header(), Err(Error::Io(_))));
        assert!(matches!(reader.read_header(), Err(Error::Fatal)));
        assert!(matches!(reader.read_entry(), Err(Error::Fatal)));
    }
}
