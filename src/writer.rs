use crate::entry::Entry;
use crate::errors::{Error, Result};
use crate::format::{Format, FormatWriter};
use crate::format::android::AndroidWriter;
use crate::header::Header;
use crate::stream::Stream;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriterState {
    New,
    Entry,
    Data,
    Closed,
    Fatal,
}

/// Writes a boot image as a linear walk mirroring [`Reader`]: one header,
/// then `write_entry`/`write_data`/`finish_entry` per segment, then a
/// single [`close`](Writer::close) that appends the trailer magic and
/// rewrites the header with the final sizes and SHA-1 identity.
///
/// Exactly one dialect is active per writer; there is no bidding.
///
/// A failed `write_data` poisons the writer, since the bytes it promised
/// cannot be unpromised. Closing before every slot is finished leaves the
/// file without trailer and final header, exactly as far as it got.
///
/// [`Reader`]: crate::Reader
pub struct Writer<S: Stream> {
    stream: S,
    state: WriterState,
    format: FormatWriter,
}

impl<S: Stream> Writer<S> {
    /// Creates a writer for the given dialect. Loki output is not
    /// supported.
    pub fn new(stream: S, format: Format) -> Result<Self> {
        let format = match format {
            Format::Android => FormatWriter::Android(AndroidWriter::new(false)),
            Format::Bump => FormatWriter::Bump(AndroidWriter::new(true)),
            Format::Loki => return Err(Error::UnsupportedFormat(format)),
        };

        Ok(Writer {
            stream,
            state: WriterState::New,
            format,
        })
    }

    pub fn format(&self) -> Format {
        self.format.format()
    }

    /// Releases the underlying stream.
    pub fn into_inner(self) -> S {
        self.stream
    }

    fn poison_on_fatal(&mut self, error: Error) -> Error {
        if self.stream.is_fatal() {
            self.state = WriterState::Fatal;
        }
        error
    }

    /// Validates the header and reserves the first page for it. The final
    /// header is not written until [`close`](Writer::close).
    pub fn write_header(&mut self, header: &Header) -> Result<()> {
        match self.state {
            WriterState::New => {}
            WriterState::Fatal => return Err(Error::Fatal),
            _ => return Err(Error::InvalidState { op: "write_header" }),
        }

        match self.format.write_header(&mut self.stream, header) {
            Ok(()) => {
                self.state = WriterState::Entry;
                Ok(())
            }
            Err(e) => Err(self.poison_on_fatal(e)),
        }
    }

    /// Opens the next segment slot. The entry type must match the next
    /// slot of the dialect's fixed order.
    pub fn write_entry(&mut self, entry: &Entry) -> Result<()> {
        match self.state {
            WriterState::Entry => {}
            WriterState::Fatal => return Err(Error::Fatal),
            _ => return Err(Error::InvalidState { op: "write_entry" }),
        }

        match self.format.write_entry(&mut self.stream, entry) {
            Ok(()) => {
                self.state = WriterState::Data;
                Ok(())
            }
            Err(e) => Err(self.poison_on_fatal(e)),
        }
    }

    /// Streams payload bytes into the current segment.
    pub fn write_data(&mut self, buf: &[u8]) -> Result<usize> {
        match self.state {
            WriterState::Data => {}
            WriterState::Fatal => return Err(Error::Fatal),
            _ => return Err(Error::InvalidState { op: "write_data" }),
        }

        match self.format.write_data(&mut self.stream, buf) {
            Ok(n) => Ok(n),
            Err(e) => {
                // The write may have partially happened; it cannot be
                // reattempted
                self.state = WriterState::Fatal;
                Err(e)
            }
        }
    }

    /// Pads the current segment to the page boundary and seals its size.
    pub fn finish_entry(&mut self) -> Result<()> {
        match self.state {
            WriterState::Data => {}
            WriterState::Fatal => return Err(Error::Fatal),
            _ => return Err(Error::InvalidState { op: "finish_entry" }),
        }

        match self.format.finish_entry(&mut self.stream) {
            Ok(()) => {
                self.state = WriterState::Entry;
                Ok(())
            }
            Err(e) => Err(self.poison_on_fatal(e)),
        }
    }

    /// Finalizes the image: trailer magic, SHA-1 identity, and the header
    /// rewrite, provided every slot was finished.
    pub fn close(&mut self) -> Result<()> {
        match self.state {
            WriterState::New | WriterState::Entry | WriterState::Data => {}
            WriterState::Fatal => return Err(Error::Fatal),
            WriterState::Closed => return Err(Error::InvalidState { op: "close" }),
        }

        match self.format.close(&mut self.stream) {
            Ok(()) => {
                self.state = WriterState::Closed;
                Ok(())
            }
            Err(e) => Err(self.poison_on_fatal(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use sha1::{Digest, Sha1};

    use super::*;
    use crate::entry::EntryType;
    use crate::errors::AndroidError;
    use crate::format::android::RAW_HEADER_SIZE;
    use crate::format::bump::BUMP_MAGIC;
    use crate::header::HeaderFields;
    use crate::reader::Reader;

    fn minimal_header(page_size: u32) -> Header {
        Header {
            page_size: Some(page_size),
            board_name: Some(String::new()),
            kernel_cmdline: Some(String::new()),
            ..Default::default()
        }
    }

    fn write_image(format: Format, header: &Header, segments: [&[u8]; 4]) -> Vec<u8> {
        let mut writer = Writer::new(Cursor::new(Vec::new()), format).unwrap();
        writer.write_header(header).unwrap();

        let types = [
            EntryType::Kernel,
            EntryType::Ramdisk,
            EntryType::SecondBoot,
            EntryType::DeviceTree,
        ];
        for (entry_type, data) in types.into_iter().zip(segments) {
            writer.write_entry(&Entry::new(entry_type, 0)).unwrap();
            if !data.is_empty() {
                writer.write_data(data).unwrap();
            }
            writer.finish_entry().unwrap();
        }
        writer.close().unwrap();

        writer.into_inner().into_inner()
    }

    #[test]
    fn minimal_android_image_layout_and_identity() {
        let kernel = vec![0xaa; 0x400];
        let ramdisk = vec![0xbb; 0x100];
        let data = write_image(
            Format::Android,
            &minimal_header(2048),
            [&kernel, &ramdisk, &[], &[]],
        );

        // header page + kernel page + ramdisk page + trailer
        assert_eq!(data.len(), 2048 * 3 + 16);
        assert_eq!(&data[..8], b"ANDROID!");
        assert_eq!(&data[2048 * 3..], b"SEANDROIDENFORCE");
        assert_eq!(&data[2048..2048 + 0x400], &kernel[..]);
        assert_eq!(&data[2048 + 0x400..2048 * 2], &[0u8; 2048 - 0x400][..]);
        assert_eq!(&data[2048 * 2..2048 * 2 + 0x100], &ramdisk[..]);

        let mut sha = Sha1::new();
        sha.update(&kernel);
        sha.update(0x400u32.to_le_bytes());
        sha.update(&ramdisk);
        sha.update(0x100u32.to_le_bytes());
        sha.update(0u32.to_le_bytes());
        // No size word for the empty device tree
        let digest = sha.finalize();

        // The id field sits after the u32 block, name, and cmdline
        let id_offset = 8 + 10 * 4 + 16 + 512;
        assert_eq!(&data[id_offset..id_offset + 20], digest.as_slice());
        assert_eq!(&data[id_offset + 20..id_offset + 32], &[0u8; 12][..]);
    }

    #[test]
    fn android_round_trip() {
        let header = Header {
            kernel_address: Some(0x1000_8000),
            ramdisk_address: Some(0x1100_0000),
            secondboot_address: Some(0x100f_0000),
            kernel_tags_address: Some(0x1000_0100),
            page_size: Some(2048),
            board_name: Some("jflte".to_string()),
            kernel_cmdline: Some("console=ttyHSL0".to_string()),
            id: None,
            supported_fields: HeaderFields::empty(),
        };
        let kernel = vec![0xaa; 0x400];
        let ramdisk = vec![0xbb; 0x100];
        let data = write_image(Format::Android, &header, [&kernel, &ramdisk, &[], &[]]);

        let mut reader = Reader::new(Cursor::new(data));
        let read_back = reader.read_header().unwrap();
        assert_eq!(reader.format(), Some(Format::Android));

        assert_eq!(read_back.kernel_address, header.kernel_address);
        assert_eq!(read_back.ramdisk_address, header.ramdisk_address);
        assert_eq!(read_back.secondboot_address, header.secondboot_address);
        assert_eq!(read_back.kernel_tags_address, header.kernel_tags_address);
        assert_eq!(read_back.page_size, header.page_size);
        assert_eq!(read_back.board_name, header.board_name);
        assert_eq!(read_back.kernel_cmdline, header.kernel_cmdline);
        assert!(read_back.id.is_some());

        let entry = reader.read_entry().unwrap().unwrap();
        assert_eq!(entry, Entry::new(EntryType::Kernel, 0x400));
        assert_eq!(reader.read_entry_data(&entry).unwrap(), kernel);

        let entry = reader.read_entry().unwrap().unwrap();
        assert_eq!(entry, Entry::new(EntryType::Ramdisk, 0x100));
        assert_eq!(reader.read_entry_data(&entry).unwrap(), ramdisk);

        // Unused trailing segments keep their slots, at size 0
        let entry = reader.read_entry().unwrap().unwrap();
        assert_eq!(entry, Entry::new(EntryType::SecondBoot, 0));
        let entry = reader.read_entry().unwrap().unwrap();
        assert_eq!(entry, Entry::new(EntryType::DeviceTree, 0));
        assert_eq!(reader.read_entry_data(&entry).unwrap(), Vec::<u8>::new());

        assert!(reader.read_entry().unwrap().is_none());
    }

    #[test]
    fn rewriting_an_image_is_bit_exact() {
        let kernel = vec![0x11; 0x900];
        let ramdisk = vec![0x22; 0x80];
        let second = vec![0x33; 0x40];
        let header = Header {
            kernel_address: Some(0x8000_0000),
            page_size: Some(4096),
            board_name: Some("board".to_string()),
            kernel_cmdline: Some("loglevel=4".to_string()),
            ..Default::default()
        };
        let first = write_image(
            Format::Android,
            &header,
            [&kernel, &ramdisk, &second, &[]],
        );

        // Read every field and segment back, write them again
        let mut reader = Reader::new(Cursor::new(first.clone()));
        let read_header = reader.read_header().unwrap();
        let mut segments: Vec<(EntryType, Vec<u8>)> = Vec::new();
        while let Some(entry) = reader.read_entry().unwrap() {
            let data = reader.read_entry_data(&entry).unwrap();
            segments.push((entry.entry_type, data));
        }

        let mut writer = Writer::new(Cursor::new(Vec::new()), Format::Android).unwrap();
        writer.write_header(&read_header).unwrap();
        for entry_type in [
            EntryType::Kernel,
            EntryType::Ramdisk,
            EntryType::SecondBoot,
            EntryType::DeviceTree,
        ] {
            writer.write_entry(&Entry::new(entry_type, 0)).unwrap();
            if let Some((_, data)) = segments.iter().find(|(t, _)| *t == entry_type) {
                writer.write_data(data).unwrap();
            }
            writer.finish_entry().unwrap();
        }
        writer.close().unwrap();

        assert_eq!(writer.into_inner().into_inner(), first);
    }

    #[test]
    fn bump_image_carries_bump_trailer_and_detects_as_bump() {
        let kernel = vec![0xaa; 0x100];
        let data = write_image(
            Format::Bump,
            &minimal_header(2048),
            [&kernel, &[], &[], &[]],
        );

        assert_eq!(&data[data.len() - 16..], BUMP_MAGIC);

        let mut reader = Reader::new(Cursor::new(data));
        reader.read_header().unwrap();
        assert_eq!(reader.format(), Some(Format::Bump));
    }

    #[test]
    fn header_validation_errors() {
        let mut writer = Writer::new(Cursor::new(Vec::new()), Format::Android).unwrap();
        assert!(matches!(
            writer.write_header(&Header::default()),
            Err(Error::Android(AndroidError::MissingPageSize))
        ));

        let mut writer = Writer::new(Cursor::new(Vec::new()), Format::Android).unwrap();
        assert!(matches!(
            writer.write_header(&minimal_header(1234)),
            Err(Error::Android(AndroidError::InvalidPageSize(1234)))
        ));

        // 15 bytes fit in the 16-byte NUL-terminated field; 16 do not
        let mut header = minimal_header(2048);
        header.board_name = Some("a".repeat(15));
        let mut writer = Writer::new(Cursor::new(Vec::new()), Format::Android).unwrap();
        writer.write_header(&header).unwrap();

        let mut header = minimal_header(2048);
        header.board_name = Some("a".repeat(16));
        let mut writer = Writer::new(Cursor::new(Vec::new()), Format::Android).unwrap();
        assert!(matches!(
            writer.write_header(&header),
            Err(Error::Android(AndroidError::BoardNameTooLong))
        ));

        let mut header = minimal_header(2048);
        header.kernel_cmdline = Some("c".repeat(512));
        let mut writer = Writer::new(Cursor::new(Vec::new()), Format::Android).unwrap();
        assert!(matches!(
            writer.write_header(&header),
            Err(Error::Android(AndroidError::KernelCmdlineTooLong))
        ));
    }

    #[test]
    fn loki_output_is_unsupported() {
        assert!(matches!(
            Writer::new(Cursor::new(Vec::new()), Format::Loki),
            Err(Error::UnsupportedFormat(Format::Loki))
        ));
    }

    #[test]
    fn state_machine_rejects_out_of_order_calls() {
        let mut writer = Writer::new(Cursor::new(Vec::new()), Format::Android).unwrap();

        assert!(matches!(
            writer.write_entry(&Entry::new(EntryType::Kernel, 0)),
            Err(Error::InvalidState { .. })
        ));
        assert!(matches!(
            writer.write_data(&[0u8; 4]),
            Err(Error::InvalidState { .. })
        ));

        writer.write_header(&minimal_header(2048)).unwrap();
        assert!(matches!(
            writer.finish_entry(),
            Err(Error::InvalidState { .. })
        ));

        writer.close().unwrap();
        assert!(matches!(writer.close(), Err(Error::InvalidState { .. })));
    }

    #[test]
    fn early_close_skips_trailer_and_header_rewrite() {
        let mut writer = Writer::new(Cursor::new(Vec::new()), Format::Android).unwrap();
        writer.write_header(&minimal_header(2048)).unwrap();
        writer.write_entry(&Entry::new(EntryType::Kernel, 0)).unwrap();
        writer.write_data(&[0xaa; 16]).unwrap();
        writer.finish_entry().unwrap();
        // Ramdisk, secondboot, and device tree never written
        writer.close().unwrap();

        let data = writer.into_inner().into_inner();
        // header page reserved but never rewritten, one kernel page, no trailer
        assert_eq!(data.len(), 2048 * 2);
        assert_eq!(&data[..RAW_HEADER_SIZE], &[0u8; RAW_HEADER_SIZE][..]);
    }
}
