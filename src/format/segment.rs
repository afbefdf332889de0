//! The segment engine shared by every format driver.
//!
//! A boot image is an ordered list of typed, page-aligned segments. The
//! engine turns that layout into a linear walk: drivers install the list
//! once and the facades pull or push one segment at a time without doing
//! any offset arithmetic of their own.

use std::cmp;
use std::io::SeekFrom;

use crate::entry::{Entry, EntryType};
use crate::errors::{Error, Result, SegmentError};
use crate::format::align_page_size;
use crate::stream::{read_fully, write_fully, Stream};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SegmentState {
    Begin,
    Entries,
    End,
}

/// One read-side segment slot.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SegmentEntry {
    pub entry_type: EntryType,
    /// Absolute byte offset within the stream.
    pub offset: u64,
    pub size: u64,
    /// Whether a short file is tolerated for this slot.
    pub can_truncate: bool,
}

/// One write-side segment slot. The size is determined lazily from the
/// bytes actually streamed and finalized by `finish_entry`.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SegmentWriterEntry {
    pub entry_type: EntryType,
    pub offset: u64,
    pub size: Option<u32>,
    pub align: u64,
}

fn check_unique_types(types: impl Iterator<Item = EntryType>) -> Result<()> {
    let mut seen: Vec<EntryType> = Vec::new();
    for entry_type in types {
        if seen.contains(&entry_type) {
            return Err(SegmentError::DuplicateEntryType(entry_type).into());
        }
        seen.push(entry_type);
    }
    if seen.is_empty() {
        return Err(SegmentError::NoEntries.into());
    }
    Ok(())
}

pub(crate) struct SegmentReader {
    state: SegmentState,
    entries: Vec<SegmentEntry>,
    cur: usize,
    read_end_offset: u64,
    read_cur_offset: u64,
}

impl SegmentReader {
    pub fn new() -> Self {
        SegmentReader {
            state: SegmentState::Begin,
            entries: Vec::new(),
            cur: 0,
            read_end_offset: 0,
            read_cur_offset: 0,
        }
    }

    /// Installs the ordered segment list and rewinds the cursor.
    pub fn set_entries(&mut self, entries: Vec<SegmentEntry>) -> Result<()> {
        if self.state != SegmentState::Begin {
            return Err(SegmentError::AddEntryInIncorrectState.into());
        }
        check_unique_types(entries.iter().map(|e| e.entry_type))?;

        self.entries = entries;
        Ok(())
    }

    pub fn entries(&self) -> &[SegmentEntry] {
        &self.entries
    }

    fn move_to_entry<S: Stream>(&mut self, stream: &mut S, index: usize) -> Result<Entry> {
        let srentry = self.entries[index];

        let end_offset = srentry
            .offset
            .checked_add(srentry.size)
            .ok_or(SegmentError::EntryWouldOverflowOffset)?;

        if self.read_cur_offset != srentry.offset {
            stream.seek(SeekFrom::Start(srentry.offset))?;
        }

        self.state = SegmentState::Entries;
        self.cur = index;
        self.read_end_offset = end_offset;
        self.read_cur_offset = srentry.offset;

        Ok(Entry::new(srentry.entry_type, srentry.size))
    }

    /// Advances to the next segment, or `None` past the last one.
    pub fn read_entry<S: Stream>(&mut self, stream: &mut S) -> Result<Option<Entry>> {
        let next = match self.state {
            SegmentState::Begin => 0,
            SegmentState::Entries => self.cur + 1,
            SegmentState::End => self.entries.len(),
        };

        if next >= self.entries.len() {
            self.state = SegmentState::End;
            return Ok(None);
        }

        self.move_to_entry(stream, next).map(Some)
    }

    /// Jumps to the segment of the given type, or `None` if absent.
    pub fn go_to_entry<S: Stream>(
        &mut self,
        stream: &mut S,
        entry_type: EntryType,
    ) -> Result<Option<Entry>> {
        match self.entries.iter().position(|e| e.entry_type == entry_type) {
            Some(index) => self.move_to_entry(stream, index).map(Some),
            None => {
                self.state = SegmentState::End;
                Ok(None)
            }
        }
    }

    /// Reads up to `buf.len()` bytes, never past the current segment's end.
    /// Returns 0 at segment end.
    pub fn read_data<S: Stream>(&mut self, stream: &mut S, buf: &mut [u8]) -> Result<usize> {
        if self.state != SegmentState::Entries {
            return Err(Error::InvalidState { op: "read_data" });
        }

        let to_copy = cmp::min(
            buf.len() as u64,
            self.read_end_offset - self.read_cur_offset,
        ) as usize;

        if self.read_cur_offset.checked_add(to_copy as u64).is_none() {
            return Err(SegmentError::ReadWouldOverflowInteger.into());
        }

        let n = read_fully(stream, &mut buf[..to_copy])?;
        self.read_cur_offset += n as u64;

        // Fail if we reach EOF early
        if n == 0
            && self.read_cur_offset != self.read_end_offset
            && !self.entries[self.cur].can_truncate
        {
            return Err(SegmentError::EntryIsTruncated {
                remaining: self.read_end_offset - self.read_cur_offset,
            }
            .into());
        }

        Ok(n)
    }
}

pub(crate) struct SegmentWriter {
    state: SegmentState,
    entries: Vec<SegmentWriterEntry>,
    cur: usize,
    entry_size: u32,
    pos: Option<u64>,
}

impl SegmentWriter {
    pub fn new() -> Self {
        SegmentWriter {
            state: SegmentState::Begin,
            entries: Vec::new(),
            cur: 0,
            entry_size: 0,
            pos: None,
        }
    }

    pub fn set_entries(&mut self, entries: Vec<SegmentWriterEntry>) -> Result<()> {
        if self.state != SegmentState::Begin {
            return Err(SegmentError::AddEntryInIncorrectState.into());
        }
        check_unique_types(entries.iter().map(|e| e.entry_type))?;

        self.entries = entries;
        Ok(())
    }

    pub fn entries(&self) -> &[SegmentWriterEntry] {
        &self.entries
    }

    /// Whether every installed slot has been written and finished.
    pub fn is_done(&self) -> bool {
        self.state == SegmentState::End
    }

    /// Opens the next slot: validates the type, records the stream's
    /// current offset as the segment start, and resets the byte counter.
    pub fn write_entry<S: Stream>(&mut self, stream: &mut S, entry_type: EntryType) -> Result<()> {
        if self.pos.is_none() {
            self.pos = Some(stream.seek(SeekFrom::Current(0))?);
        }

        let next = match self.state {
            SegmentState::Begin => 0,
            SegmentState::Entries => self.cur + 1,
            SegmentState::End => self.entries.len(),
        };

        if next >= self.entries.len() {
            self.state = SegmentState::End;
            return Err(SegmentError::EndOfEntries.into());
        }
        if self.entries[next].entry_type != entry_type {
            return Err(SegmentError::UnexpectedEntryType {
                expected: self.entries[next].entry_type,
                actual: entry_type,
            }
            .into());
        }

        self.entries[next].offset = self.pos.unwrap();
        self.entry_size = 0;
        self.state = SegmentState::Entries;
        self.cur = next;

        Ok(())
    }

    pub fn write_data<S: Stream>(&mut self, stream: &mut S, buf: &[u8]) -> Result<usize> {
        if self.state != SegmentState::Entries {
            return Err(Error::InvalidState { op: "write_data" });
        }

        let pos = self.pos.unwrap();
        if buf.len() > u32::MAX as usize
            || self.entry_size.checked_add(buf.len() as u32).is_none()
            || pos.checked_add(buf.len() as u64).is_none()
        {
            return Err(SegmentError::WriteWouldOverflowInteger.into());
        }

        write_fully(stream, buf)?;

        self.entry_size += buf.len() as u32;
        self.pos = Some(pos + buf.len() as u64);

        Ok(buf.len())
    }

    /// Pads to the next page boundary, fixes the segment's size to the byte
    /// counter, and advances. Returns the finished slot's type and size.
    pub fn finish_entry<S: Stream>(&mut self, stream: &mut S) -> Result<(EntryType, u32)> {
        if self.state != SegmentState::Entries {
            return Err(Error::InvalidState { op: "finish_entry" });
        }

        let entry = &mut self.entries[self.cur];
        if entry.size.is_none() {
            entry.size = Some(self.entry_size);
        }

        if entry.align > 0 {
            let skip = align_page_size(self.pos.unwrap(), entry.align);
            if skip > 0 {
                let padding = vec![0u8; skip as usize];
                write_fully(stream, &padding)?;
                self.pos = Some(self.pos.unwrap() + skip);
            }
        }

        let finished = (entry.entry_type, entry.size.unwrap());
        if self.cur + 1 >= self.entries.len() {
            self.state = SegmentState::End;
        }
        Ok(finished)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    fn reader_entries() -> Vec<SegmentEntry> {
        vec![
            SegmentEntry {
                entry_type: EntryType::Kernel,
                offset: 16,
                size: 8,
                can_truncate: false,
            },
            SegmentEntry {
                entry_type: EntryType::Ramdisk,
                offset: 32,
                size: 4,
                can_truncate: false,
            },
        ]
    }

    #[test]
    fn rejects_bad_entry_lists() {
        let mut seg = SegmentReader::new();
        assert!(matches!(
            seg.set_entries(Vec::new()),
            Err(Error::Segment(SegmentError::NoEntries))
        ));

        let mut dup = reader_entries();
        dup[1].entry_type = EntryType::Kernel;
        assert!(matches!(
            seg.set_entries(dup),
            Err(Error::Segment(SegmentError::DuplicateEntryType(
                EntryType::Kernel
            )))
        ));
    }

    #[test]
    fn linear_walk_stops_at_segment_boundaries() {
        let mut data = vec![0u8; 64];
        data[16..24].copy_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]);
        data[32..36].copy_from_slice(&[9, 10, 11, 12]);
        let mut stream = Cursor::new(data);

        let mut seg = SegmentReader::new();
        seg.set_entries(reader_entries()).unwrap();
        assert_eq!(seg.entries().len(), 2);

        let entry = seg.read_entry(&mut stream).unwrap().unwrap();
        assert_eq!(entry, Entry::new(EntryType::Kernel, 8));

        let mut buf = [0u8; 32];
        assert_eq!(seg.read_data(&mut stream, &mut buf).unwrap(), 8);
        assert_eq!(&buf[..8], &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(seg.read_data(&mut stream, &mut buf).unwrap(), 0);

        let entry = seg.read_entry(&mut stream).unwrap().unwrap();
        assert_eq!(entry, Entry::new(EntryType::Ramdisk, 4));
        assert_eq!(seg.read_data(&mut stream, &mut buf).unwrap(), 4);

        assert!(seg.read_entry(&mut stream).unwrap().is_none());
    }

    #[test]
    fn go_to_entry_by_type() {
        let mut stream = Cursor::new(vec![0u8; 64]);
        let mut seg = SegmentReader::new();
        seg.set_entries(reader_entries()).unwrap();

        let entry = seg
            .go_to_entry(&mut stream, EntryType::Ramdisk)
            .unwrap()
            .unwrap();
        assert_eq!(entry.entry_type, EntryType::Ramdisk);

        assert!(seg
            .go_to_entry(&mut stream, EntryType::DeviceTree)
            .unwrap()
            .is_none());
    }

    #[test]
    fn truncated_entry_is_an_error() {
        // Segment claims 8 bytes but the stream ends after 4
        let mut stream = Cursor::new(vec![0u8; 20]);
        let mut seg = SegmentReader::new();
        seg.set_entries(vec![SegmentEntry {
            entry_type: EntryType::Kernel,
            offset: 16,
            size: 8,
            can_truncate: false,
        }])
        .unwrap();

        seg.read_entry(&mut stream).unwrap().unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(seg.read_data(&mut stream, &mut buf).unwrap(), 4);
        assert!(matches!(
            seg.read_data(&mut stream, &mut buf),
            Err(Error::Segment(SegmentError::EntryIsTruncated { remaining: 4 }))
        ));
    }

    #[test]
    fn truncated_entry_tolerated_when_flagged() {
        let mut stream = Cursor::new(vec![0u8; 20]);
        let mut seg = SegmentReader::new();
        seg.set_entries(vec![SegmentEntry {
            entry_type: EntryType::Kernel,
            offset: 16,
            size: 8,
            can_truncate: true,
        }])
        .unwrap();

        seg.read_entry(&mut stream).unwrap().unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(seg.read_data(&mut stream, &mut buf).unwrap(), 4);
        assert_eq!(seg.read_data(&mut stream, &mut buf).unwrap(), 0);
    }

    fn writer_entries(align: u64) -> Vec<SegmentWriterEntry> {
        vec![
            SegmentWriterEntry {
                entry_type: EntryType::Kernel,
                offset: 0,
                size: None,
                align,
            },
            SegmentWriterEntry {
                entry_type: EntryType::Ramdisk,
                offset: 0,
                size: None,
                align,
            },
        ]
    }

    #[test]
    fn write_walk_pads_each_segment() {
        let mut stream = Cursor::new(Vec::new());
        let mut seg = SegmentWriter::new();
        seg.set_entries(writer_entries(16)).unwrap();

        seg.write_entry(&mut stream, EntryType::Kernel).unwrap();
        seg.write_data(&mut stream, &[0xaa; 5]).unwrap();
        assert_eq!(
            seg.finish_entry(&mut stream).unwrap(),
            (EntryType::Kernel, 5)
        );

        seg.write_entry(&mut stream, EntryType::Ramdisk).unwrap();
        seg.write_data(&mut stream, &[0xbb; 16]).unwrap();
        assert_eq!(
            seg.finish_entry(&mut stream).unwrap(),
            (EntryType::Ramdisk, 16)
        );
        assert!(seg.is_done());

        let data = stream.into_inner();
        assert_eq!(data.len(), 32);
        assert_eq!(&data[..5], &[0xaa; 5]);
        assert_eq!(&data[5..16], &[0u8; 11]);
        assert_eq!(&data[16..32], &[0xbb; 16]);

        assert_eq!(seg.entries()[0].offset, 0);
        assert_eq!(seg.entries()[1].offset, 16);
    }

    #[test]
    fn write_entry_validates_slot_order() {
        let mut stream = Cursor::new(Vec::new());
        let mut seg = SegmentWriter::new();
        seg.set_entries(writer_entries(16)).unwrap();

        assert!(matches!(
            seg.write_entry(&mut stream, EntryType::Ramdisk),
            Err(Error::Segment(SegmentError::UnexpectedEntryType {
                expected: EntryType::Kernel,
                actual: EntryType::Ramdisk,
            }))
        ));

        seg.write_entry(&mut stream, EntryType::Kernel).unwrap();
        seg.finish_entry(&mut stream).unwrap();
        seg.write_entry(&mut stream, EntryType::Ramdisk).unwrap();
        seg.finish_entry(&mut stream).unwrap();

        assert!(matches!(
            seg.write_entry(&mut stream, EntryType::Kernel),
            Err(Error::Segment(SegmentError::EndOfEntries))
        ));
    }
}
