//! The Android boot image dialect, which Bump shares apart from its
//! trailer magic.

use std::io::{self, Read, SeekFrom, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use log::debug;
use sha1::{Digest, Sha1};

use crate::entry::{Entry, EntryType};
use crate::errors::{AndroidError, Error, Result};
use crate::format::align_page_size;
use crate::format::bump::{BUMP_MAGIC, BUMP_MAGIC_SIZE};
use crate::format::segment::{SegmentEntry, SegmentReader, SegmentWriter, SegmentWriterEntry};
use crate::header::{Header, HeaderFields};
use crate::stream::{read_fully, write_fully, Stream};

pub(crate) const BOOT_MAGIC: &[u8; 8] = b"ANDROID!";
pub(crate) const BOOT_MAGIC_SIZE: usize = 8;
pub(crate) const BOOT_NAME_SIZE: usize = 16;
pub(crate) const BOOT_ARGS_SIZE: usize = 512;
pub(crate) const BOOT_ID_SIZE: usize = 32;
pub(crate) const BOOT_EXTRA_ARGS_SIZE: usize = 1024;

/// On-disk size of the header; it always fits within the first page.
pub(crate) const RAW_HEADER_SIZE: usize = 1632;

/// How far into the file the magic may start.
pub(crate) const MAX_HEADER_OFFSET: usize = 512 * 1024;

pub(crate) const SAMSUNG_SEANDROID_MAGIC: &[u8; 16] = b"SEANDROIDENFORCE";
pub(crate) const SAMSUNG_SEANDROID_MAGIC_SIZE: usize = 16;

/// jflte load-address layout, used when reconstructing Loki images.
pub(crate) const DEFAULT_KERNEL_OFFSET: u32 = 0x0000_8000;
pub(crate) const DEFAULT_TAGS_OFFSET: u32 = 0x0000_0100;

const PAGE_SIZES: [u32; 7] = [2048, 4096, 8192, 16384, 32768, 65536, 131072];

pub(crate) const SUPPORTED_FIELDS: HeaderFields = HeaderFields::all();

/// The raw 1632-byte header, held in host byte order.
#[derive(Debug, Clone, Copy)]
pub(crate) struct AndroidHeader {
    pub magic: [u8; BOOT_MAGIC_SIZE],
    pub kernel_size: u32,
    pub kernel_addr: u32,
    pub ramdisk_size: u32,
    pub ramdisk_addr: u32,
    pub second_size: u32,
    pub second_addr: u32,
    pub tags_addr: u32,
    pub page_size: u32,
    pub dt_size: u32,
    pub unused: u32,
    pub name: [u8; BOOT_NAME_SIZE],
    pub cmdline: [u8; BOOT_ARGS_SIZE],
    /// The SHA-1 identity occupies the first 20 bytes; the rest stay zero.
    pub id: [u8; BOOT_ID_SIZE],
    pub extra_cmdline: [u8; BOOT_EXTRA_ARGS_SIZE],
}

impl Default for AndroidHeader {
    fn default() -> Self {
        AndroidHeader {
            magic: *BOOT_MAGIC,
            kernel_size: 0,
            kernel_addr: 0,
            ramdisk_size: 0,
            ramdisk_addr: 0,
            second_size: 0,
            second_addr: 0,
            tags_addr: 0,
            page_size: 0,
            dt_size: 0,
            unused: 0,
            name: [0; BOOT_NAME_SIZE],
            cmdline: [0; BOOT_ARGS_SIZE],
            id: [0; BOOT_ID_SIZE],
            extra_cmdline: [0; BOOT_EXTRA_ARGS_SIZE],
        }
    }
}

impl AndroidHeader {
    /// Parses a header from an in-memory buffer. This does not perform the
    /// magic check, and as the buffer is fixed-size it cannot error.
    pub fn parse(buf: &[u8; RAW_HEADER_SIZE]) -> Self {
        let mut src = &buf[..];

        AndroidHeader {
            magic: {
                let mut buffer = [0; BOOT_MAGIC_SIZE];
                src.read_exact(&mut buffer).unwrap();
                buffer
            },
            kernel_size: src.read_u32::<LittleEndian>().unwrap(),
            kernel_addr: src.read_u32::<LittleEndian>().unwrap(),
            ramdisk_size: src.read_u32::<LittleEndian>().unwrap(),
            ramdisk_addr: src.read_u32::<LittleEndian>().unwrap(),
            second_size: src.read_u32::<LittleEndian>().unwrap(),
            second_addr: src.read_u32::<LittleEndian>().unwrap(),
            tags_addr: src.read_u32::<LittleEndian>().unwrap(),
            page_size: src.read_u32::<LittleEndian>().unwrap(),
            dt_size: src.read_u32::<LittleEndian>().unwrap(),
            unused: src.read_u32::<LittleEndian>().unwrap(),
            name: {
                let mut buffer = [0; BOOT_NAME_SIZE];
                src.read_exact(&mut buffer).unwrap();
                buffer
            },
            cmdline: {
                let mut buffer = [0; BOOT_ARGS_SIZE];
                src.read_exact(&mut buffer).unwrap();
                buffer
            },
            id: {
                let mut buffer = [0; BOOT_ID_SIZE];
                src.read_exact(&mut buffer).unwrap();
                buffer
            },
            extra_cmdline: {
                let mut buffer = [0; BOOT_EXTRA_ARGS_SIZE];
                src.read_exact(&mut buffer).unwrap();
                buffer
            },
        }
    }

    /// Serializes the header in little-endian byte order.
    pub fn write_to<W: Write>(&self, dst: &mut W) -> io::Result<()> {
        dst.write_all(&self.magic)?;
        dst.write_u32::<LittleEndian>(self.kernel_size)?;
        dst.write_u32::<LittleEndian>(self.kernel_addr)?;
        dst.write_u32::<LittleEndian>(self.ramdisk_size)?;
        dst.write_u32::<LittleEndian>(self.ramdisk_addr)?;
        dst.write_u32::<LittleEndian>(self.second_size)?;
        dst.write_u32::<LittleEndian>(self.second_addr)?;
        dst.write_u32::<LittleEndian>(self.tags_addr)?;
        dst.write_u32::<LittleEndian>(self.page_size)?;
        dst.write_u32::<LittleEndian>(self.dt_size)?;
        dst.write_u32::<LittleEndian>(self.unused)?;
        dst.write_all(&self.name)?;
        dst.write_all(&self.cmdline)?;
        dst.write_all(&self.id)?;
        dst.write_all(&self.extra_cmdline)
    }
}

fn find_magic(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

pub(crate) fn nul_terminated_string(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

/// Finds and parses the Android header within the first
/// `max_header_offset` bytes, returning it with its offset.
///
/// The file position is undefined afterwards.
pub(crate) fn find_header<S: Stream>(
    stream: &mut S,
    max_header_offset: usize,
) -> Result<(AndroidHeader, u64)> {
    stream.seek(SeekFrom::Start(0))?;

    let mut buf = vec![0u8; max_header_offset + RAW_HEADER_SIZE];
    let n = read_fully(stream, &mut buf)?;
    let buf = &buf[..n];

    let offset = match find_magic(buf, BOOT_MAGIC) {
        Some(offset) => offset,
        None => {
            debug!("Android magic not found in first {} bytes", max_header_offset);
            return Err(AndroidError::HeaderNotFound.into());
        }
    };

    if buf.len() - offset < RAW_HEADER_SIZE {
        debug!("Android header at {} exceeds file size", offset);
        return Err(AndroidError::HeaderOutOfBounds.into());
    }

    let mut raw = [0u8; RAW_HEADER_SIZE];
    raw.copy_from_slice(&buf[offset..offset + RAW_HEADER_SIZE]);

    Ok((AndroidHeader::parse(&raw), offset as u64))
}

/// Offset of the first byte past the last segment, where a trailer magic
/// would start.
fn end_of_segments(hdr: &AndroidHeader) -> u64 {
    let page_size = u64::from(hdr.page_size);
    let mut pos = page_size;

    for size in [hdr.kernel_size, hdr.ramdisk_size, hdr.second_size, hdr.dt_size] {
        pos += u64::from(size);
        pos += align_page_size(pos, page_size);
    }

    pos
}

/// Probes for a 16-byte trailer magic right after the segments.
/// `Ok(None)` means the magic is not there.
fn find_trailer_magic<S: Stream>(
    stream: &mut S,
    hdr: &AndroidHeader,
    magic: &[u8; 16],
) -> Result<Option<u64>> {
    let pos = end_of_segments(hdr);

    stream.seek(SeekFrom::Start(pos))?;

    let mut buf = [0u8; 16];
    let n = read_fully(stream, &mut buf)?;
    if n != magic.len() || buf != *magic {
        return Ok(None);
    }

    Ok(Some(pos))
}

/// Builds the logical header from the raw one.
pub(crate) fn convert_header(hdr: &AndroidHeader) -> Header {
    let mut id = [0u8; 20];
    id.copy_from_slice(&hdr.id[..20]);

    Header {
        kernel_address: Some(hdr.kernel_addr),
        ramdisk_address: Some(hdr.ramdisk_addr),
        secondboot_address: Some(hdr.second_addr),
        kernel_tags_address: Some(hdr.tags_addr),
        page_size: Some(hdr.page_size),
        board_name: Some(nul_terminated_string(&hdr.name)),
        kernel_cmdline: Some(nul_terminated_string(&hdr.cmdline)),
        id: Some(id),
        supported_fields: SUPPORTED_FIELDS,
    }
}

/// Read driver for Android and Bump images.
pub(crate) struct AndroidReader {
    hdr: AndroidHeader,
    header_offset: Option<u64>,
    allow_truncated_dt: bool,
    is_bump: bool,
    seg: SegmentReader,
}

impl AndroidReader {
    pub fn new(is_bump: bool) -> Self {
        AndroidReader {
            hdr: AndroidHeader::default(),
            header_offset: None,
            allow_truncated_dt: false,
            is_bump,
            seg: SegmentReader::new(),
        }
    }

    /// Tolerate a trailing device tree shorter than its declared size.
    pub fn set_allow_truncated_dt(&mut self, allow: bool) {
        self.allow_truncated_dt = allow;
    }

    pub fn bid<S: Stream>(&mut self, stream: &mut S, best_bid: u32) -> Result<Option<u32>> {
        let trailer_size = if self.is_bump {
            BUMP_MAGIC_SIZE
        } else {
            SAMSUNG_SEANDROID_MAGIC_SIZE
        };
        let max = ((BOOT_MAGIC_SIZE + trailer_size) * 8) as u32;
        if best_bid >= max {
            // This is a bid we can't win, so bail out
            return Ok(None);
        }

        let mut bid = 0u32;

        match find_header(stream, MAX_HEADER_OFFSET) {
            Ok((hdr, offset)) => {
                self.hdr = hdr;
                self.header_offset = Some(offset);
                bid += (BOOT_MAGIC_SIZE * 8) as u32;
            }
            Err(Error::Android(AndroidError::HeaderNotFound))
            | Err(Error::Android(AndroidError::HeaderOutOfBounds)) => {
                // This can't be an Android boot image
                return Ok(Some(0));
            }
            Err(e) => return Err(e),
        }

        let magic: &[u8; 16] = if self.is_bump {
            BUMP_MAGIC
        } else {
            SAMSUNG_SEANDROID_MAGIC
        };
        if find_trailer_magic(stream, &self.hdr, magic)?.is_some() {
            bid += (trailer_size * 8) as u32;
        }

        Ok(Some(bid))
    }

    pub fn read_header<S: Stream>(&mut self, stream: &mut S) -> Result<Header> {
        // A bid might not have been performed if the caller forced a
        // particular format
        if self.header_offset.is_none() {
            let (hdr, offset) = find_header(stream, MAX_HEADER_OFFSET)?;
            self.hdr = hdr;
            self.header_offset = Some(offset);
        }

        if self.hdr.page_size == 0 {
            return Err(AndroidError::InvalidPageSize(0).into());
        }

        let header = convert_header(&self.hdr);

        let page_size = u64::from(self.hdr.page_size);
        let mut pos = self.header_offset.unwrap();
        pos += RAW_HEADER_SIZE as u64;
        pos += align_page_size(pos, page_size);

        let kernel_offset = pos;
        pos += u64::from(self.hdr.kernel_size);
        pos += align_page_size(pos, page_size);

        let ramdisk_offset = pos;
        pos += u64::from(self.hdr.ramdisk_size);
        pos += align_page_size(pos, page_size);

        let second_offset = pos;
        pos += u64::from(self.hdr.second_size);
        pos += align_page_size(pos, page_size);

        let dt_offset = pos;

        // Unused trailing segments keep their slots with size 0
        let entries = vec![
            SegmentEntry {
                entry_type: EntryType::Kernel,
                offset: kernel_offset,
                size: u64::from(self.hdr.kernel_size),
                can_truncate: false,
            },
            SegmentEntry {
                entry_type: EntryType::Ramdisk,
                offset: ramdisk_offset,
                size: u64::from(self.hdr.ramdisk_size),
                can_truncate: false,
            },
            SegmentEntry {
                entry_type: EntryType::SecondBoot,
                offset: second_offset,
                size: u64::from(self.hdr.second_size),
                can_truncate: false,
            },
            SegmentEntry {
                entry_type: EntryType::DeviceTree,
                offset: dt_offset,
                size: u64::from(self.hdr.dt_size),
                can_truncate: self.allow_truncated_dt,
            },
        ];

        self.seg.set_entries(entries)?;

        Ok(header)
    }

    pub fn read_entry<S: Stream>(&mut self, stream: &mut S) -> Result<Option<Entry>> {
        self.seg.read_entry(stream)
    }

    pub fn go_to_entry<S: Stream>(
        &mut self,
        stream: &mut S,
        entry_type: EntryType,
    ) -> Result<Option<Entry>> {
        self.seg.go_to_entry(stream, entry_type)
    }

    pub fn read_data<S: Stream>(&mut self, stream: &mut S, buf: &mut [u8]) -> Result<usize> {
        self.seg.read_data(stream, buf)
    }
}

/// Write driver for Android and Bump images.
///
/// Feeds every payload byte, and the LE32 size of each finished segment
/// apart from an empty device tree, into a running SHA-1 that becomes the
/// header's identity field on close.
pub(crate) struct AndroidWriter {
    hdr: AndroidHeader,
    is_bump: bool,
    sha_ctx: Sha1,
    seg: SegmentWriter,
    file_size: Option<u64>,
}

impl AndroidWriter {
    pub fn new(is_bump: bool) -> Self {
        AndroidWriter {
            hdr: AndroidHeader::default(),
            is_bump,
            sha_ctx: Sha1::new(),
            seg: SegmentWriter::new(),
            file_size: None,
        }
    }

    pub fn write_header<S: Stream>(&mut self, stream: &mut S, header: &Header) -> Result<()> {
        self.hdr = AndroidHeader::default();

        if let Some(address) = header.kernel_address {
            self.hdr.kernel_addr = address;
        }
        if let Some(address) = header.ramdisk_address {
            self.hdr.ramdisk_addr = address;
        }
        if let Some(address) = header.secondboot_address {
            self.hdr.second_addr = address;
        }
        if let Some(address) = header.kernel_tags_address {
            self.hdr.tags_addr = address;
        }
        match header.page_size {
            Some(page_size) if PAGE_SIZES.contains(&page_size) => {
                self.hdr.page_size = page_size;
            }
            Some(page_size) => return Err(AndroidError::InvalidPageSize(page_size).into()),
            None => return Err(AndroidError::MissingPageSize.into()),
        }
        if let Some(board_name) = &header.board_name {
            if board_name.len() >= BOOT_NAME_SIZE {
                return Err(AndroidError::BoardNameTooLong.into());
            }
            self.hdr.name[..board_name.len()].copy_from_slice(board_name.as_bytes());
        }
        if let Some(cmdline) = &header.kernel_cmdline {
            if cmdline.len() >= BOOT_ARGS_SIZE {
                return Err(AndroidError::KernelCmdlineTooLong.into());
            }
            self.hdr.cmdline[..cmdline.len()].copy_from_slice(cmdline.as_bytes());
        }

        let align = u64::from(self.hdr.page_size);
        let entries = [
            EntryType::Kernel,
            EntryType::Ramdisk,
            EntryType::SecondBoot,
            EntryType::DeviceTree,
        ]
        .into_iter()
        .map(|entry_type| SegmentWriterEntry {
            entry_type,
            offset: 0,
            size: None,
            align,
        })
        .collect();
        self.seg.set_entries(entries)?;

        // Start writing after the first page
        stream.seek(SeekFrom::Start(u64::from(self.hdr.page_size)))?;

        Ok(())
    }

    pub fn write_entry<S: Stream>(&mut self, stream: &mut S, entry: &Entry) -> Result<()> {
        self.seg.write_entry(stream, entry.entry_type)
    }

    pub fn write_data<S: Stream>(&mut self, stream: &mut S, buf: &[u8]) -> Result<usize> {
        let n = self.seg.write_data(stream, buf)?;

        // The image is always hashed; the size is sometimes included and is
        // handled in finish_entry()
        self.sha_ctx.update(buf);

        Ok(n)
    }

    pub fn finish_entry<S: Stream>(&mut self, stream: &mut S) -> Result<()> {
        let (entry_type, size) = self.seg.finish_entry(stream)?;

        // Include the size for everything except empty device trees
        if entry_type != EntryType::DeviceTree || size > 0 {
            self.sha_ctx.update(size.to_le_bytes());
        }

        match entry_type {
            EntryType::Kernel => self.hdr.kernel_size = size,
            EntryType::Ramdisk => self.hdr.ramdisk_size = size,
            EntryType::SecondBoot => self.hdr.second_size = size,
            EntryType::DeviceTree => self.hdr.dt_size = size,
        }

        Ok(())
    }

    pub fn close<S: Stream>(&mut self, stream: &mut S) -> Result<()> {
        match self.file_size {
            Some(file_size) => {
                stream.seek(SeekFrom::Start(file_size))?;
            }
            None => {
                let file_size = stream.seek(SeekFrom::Current(0))?;
                self.file_size = Some(file_size);
            }
        }

        // Only finalize the image if every segment was written
        if self.seg.is_done() {
            let magic: &[u8; 16] = if self.is_bump {
                BUMP_MAGIC
            } else {
                SAMSUNG_SEANDROID_MAGIC
            };
            write_fully(stream, magic)?;

            let digest: [u8; 20] = self.sha_ctx.clone().finalize().into();
            self.hdr.id[..20].copy_from_slice(&digest);

            // Seek back to the beginning to write the patched header
            stream.seek(SeekFrom::Start(0))?;
            self.hdr.write_to(stream)?;
        }

        Ok(())
    }
}
