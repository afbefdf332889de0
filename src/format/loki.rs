//! The Loki dialect.
//!
//! Loki post-processed Android images so certain locked LG and Samsung
//! bootloaders would accept them: the original header fields were zeroed or
//! rewritten, a secondary header was dropped at a fixed offset, a copy of
//! aboot was embedded, and shellcode carrying the real ramdisk address was
//! injected. The reader reverse-engineers all of that back into the
//! original layout. There is no write driver; the tool and the bootloaders
//! it fooled are long obsolete.

use std::io::{Read, SeekFrom};

use byteorder::{LittleEndian, ReadBytesExt};
use log::debug;

use crate::entry::{Entry, EntryType};
use crate::errors::{AndroidError, Error, LokiError, Result};
use crate::format::align_page_size;
use crate::format::android::{
    self, nul_terminated_string, AndroidHeader, DEFAULT_KERNEL_OFFSET, DEFAULT_TAGS_OFFSET,
};
use crate::format::segment::{SegmentEntry, SegmentReader};
use crate::header::{Header, HeaderFields};
use crate::stream::{read_fully, search, SearchAction, Stream};

pub(crate) const LOKI_MAGIC: &[u8; 4] = b"LOKI";
pub(crate) const LOKI_MAGIC_SIZE: usize = 4;
pub(crate) const LOKI_MAGIC_OFFSET: u64 = 0x400;

/// The Loki tool never relocates the Android header far; 32 KiB is ample.
pub(crate) const LOKI_MAX_HEADER_OFFSET: usize = 32 * 1024;

/// On-disk size of the Loki header; only the first 20 bytes carry fields,
/// the remainder is reserved.
pub(crate) const RAW_LOKI_HEADER_SIZE: usize = 0x50;

/// The Thumb-2 stub the Loki tool injects. The tool overwrites the last
/// five bytes with the LE32 ramdisk address plus one trailing byte, and
/// builds differ in the tail, so searches use the sequence minus its last
/// nine bytes.
pub(crate) const LOKI_SHELLCODE_SIZE: usize = 65;
pub(crate) const LOKI_SHELLCODE: [u8; LOKI_SHELLCODE_SIZE] = [
    0xfe, 0xb5, 0x0d, 0x4d, 0xd5, 0xf8, 0x88, 0x04, 0xab, 0x68, 0x98, 0x42, 0x12, 0xd0, 0xd5,
    0xf8, 0x90, 0x64, 0x0a, 0x4c, 0xd5, 0xf8, 0x8c, 0x74, 0x07, 0xf5, 0x80, 0x57, 0x0f, 0xce,
    0x0f, 0xc4, 0x10, 0x3e, 0xfb, 0xdc, 0xd5, 0xf8, 0x88, 0x04, 0x04, 0x49, 0xd5, 0xf8, 0x8c,
    0x24, 0xa8, 0x60, 0x69, 0x61, 0x2a, 0x61, 0x00, 0x20, 0x02, 0xb0, 0xf0, 0xbd, 0x00, 0x00,
    0xff, 0xff, 0xff, 0xff, 0xee,
];

/// Ramdisk load addresses used by the LG variants of Loki, which embed
/// aboot with page-size granularity instead of 0x200.
pub(crate) fn is_lg_ramdisk_address(ramdisk_addr: u32) -> bool {
    ramdisk_addr == 0x88f0_2000 || ramdisk_addr == 0x8ef0_2000
}

pub(crate) const NEW_SUPPORTED_FIELDS: HeaderFields = HeaderFields::KERNEL_ADDRESS
    .union(HeaderFields::RAMDISK_ADDRESS)
    .union(HeaderFields::SECONDBOOT_ADDRESS)
    .union(HeaderFields::KERNEL_TAGS_ADDRESS)
    .union(HeaderFields::PAGE_SIZE)
    .union(HeaderFields::BOARD_NAME)
    .union(HeaderFields::KERNEL_CMDLINE);

pub(crate) const OLD_SUPPORTED_FIELDS: HeaderFields = HeaderFields::KERNEL_ADDRESS
    .union(HeaderFields::RAMDISK_ADDRESS)
    .union(HeaderFields::SECONDBOOT_ADDRESS)
    .union(HeaderFields::PAGE_SIZE)
    .union(HeaderFields::BOARD_NAME)
    .union(HeaderFields::KERNEL_CMDLINE);

/// The secondary header the Loki tool writes at [`LOKI_MAGIC_OFFSET`],
/// in host byte order.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct LokiHeader {
    pub magic: [u8; LOKI_MAGIC_SIZE],
    pub build: u32,
    pub orig_kernel_size: u32,
    pub orig_ramdisk_size: u32,
    pub ramdisk_addr: u32,
}

impl LokiHeader {
    /// Parses the header from an in-memory buffer; cannot error.
    pub fn parse(buf: &[u8; RAW_LOKI_HEADER_SIZE]) -> Self {
        let mut src = &buf[..];

        LokiHeader {
            magic: {
                let mut buffer = [0; LOKI_MAGIC_SIZE];
                src.read_exact(&mut buffer).unwrap();
                buffer
            },
            build: src.read_u32::<LittleEndian>().unwrap(),
            orig_kernel_size: src.read_u32::<LittleEndian>().unwrap(),
            orig_ramdisk_size: src.read_u32::<LittleEndian>().unwrap(),
            ramdisk_addr: src.read_u32::<LittleEndian>().unwrap(),
        }
    }
}

/// Reads the Loki header at its fixed offset.
///
/// The file position is undefined afterwards.
pub(crate) fn find_loki_header<S: Stream>(stream: &mut S) -> Result<(LokiHeader, u64)> {
    stream.seek(SeekFrom::Start(LOKI_MAGIC_OFFSET))?;

    let mut buf = [0u8; RAW_LOKI_HEADER_SIZE];
    let n = read_fully(stream, &mut buf)?;
    if n != RAW_LOKI_HEADER_SIZE {
        return Err(LokiError::LokiHeaderTooSmall.into());
    }

    let header = LokiHeader::parse(&buf);
    if &header.magic != LOKI_MAGIC {
        return Err(LokiError::InvalidLokiMagic.into());
    }

    debug!("found Loki header (build {})", header.build);

    Ok((header, LOKI_MAGIC_OFFSET))
}

/// Recovers the original ramdisk load address.
///
/// Newer Loki builds leave it in the injected shellcode; the last copy in
/// the file is the one the tool patched. Older builds get the jflte
/// default.
fn find_ramdisk_address<S: Stream>(
    stream: &mut S,
    hdr: &AndroidHeader,
    loki_hdr: &LokiHeader,
) -> Result<u32> {
    if loki_hdr.ramdisk_addr != 0 {
        let needle = &LOKI_SHELLCODE[..LOKI_SHELLCODE_SIZE - 9];
        let mut last_offset = None;

        search(stream, Some(0), None, needle, None, |_, offset| {
            last_offset = Some(offset);
            Ok(SearchAction::Continue)
        })?;

        let offset =
            last_offset.ok_or(LokiError::ShellcodeNotFound)? + (LOKI_SHELLCODE_SIZE - 5) as u64;

        stream.seek(SeekFrom::Start(offset))?;
        let mut buf = [0u8; 4];
        if read_fully(stream, &mut buf)? != buf.len() {
            return Err(LokiError::UnexpectedEndOfFile("ramdisk address").into());
        }

        Ok(u32::from_le_bytes(buf))
    } else {
        hdr.kernel_addr
            .checked_add(0x01ff_8000)
            .ok_or_else(|| LokiError::InvalidKernelAddress(hdr.kernel_addr).into())
    }
}

/// Reads the kernel size out of the ARM boot header at `kernel_offset`.
///
/// Early Loki builds did not preserve the size in their own header or
/// shellcode, but the kernel image itself stores it at +0x2c.
fn find_linux_kernel_size<S: Stream>(stream: &mut S, kernel_offset: u64) -> Result<u32> {
    stream.seek(SeekFrom::Start(kernel_offset + 0x2c))?;

    let mut buf = [0u8; 4];
    if read_fully(stream, &mut buf)? != buf.len() {
        return Err(LokiError::UnexpectedEndOfFile("kernel header").into());
    }

    Ok(u32::from_le_bytes(buf))
}

/// Finds the gzip'd ramdisk in an old-style image by scanning for deflate
/// headers (`1f 8b 08`) from `start_offset`.
///
/// The first occurrence with flags `0x00` and the first with flags `0x08`
/// are both remembered; `0x08` wins because the original-filename flag is
/// what the `gzip` command line tool emits.
fn find_gzip_offset_old<S: Stream>(stream: &mut S, start_offset: u64) -> Result<u64> {
    const GZIP_DEFLATE_MAGIC: [u8; 3] = [0x1f, 0x8b, 0x08];

    let mut flag0_offset: Option<u64> = None;
    let mut flag8_offset: Option<u64> = None;

    search(
        stream,
        Some(start_offset),
        None,
        &GZIP_DEFLATE_MAGIC,
        None,
        |stream, offset| {
            if flag0_offset.is_some() && flag8_offset.is_some() {
                return Ok(SearchAction::Stop);
            }

            stream.seek(SeekFrom::Start(offset + 3))?;
            let mut flags = [0u8; 1];
            if read_fully(stream, &mut flags)? != flags.len() {
                // EOF right after the magic
                return Ok(SearchAction::Stop);
            }

            if flag0_offset.is_none() && flags[0] == 0x00 {
                flag0_offset = Some(offset);
            } else if flag8_offset.is_none() && flags[0] == 0x08 {
                flag8_offset = Some(offset);
            }

            Ok(SearchAction::Continue)
        },
    )?;

    flag8_offset
        .or(flag0_offset)
        .ok_or_else(|| LokiError::NoRamdiskGzipHeaderFound.into())
}

/// Guesses the ramdisk size of an old-style image.
///
/// The ramdisk runs from the gzip header to the aboot copy Loki stores in
/// the file's tail. By default any zero padding before aboot is counted in;
/// `strip` scans backwards for the last non-zero byte instead.
fn find_ramdisk_size_old<S: Stream>(
    stream: &mut S,
    hdr: &AndroidHeader,
    ramdisk_offset: u64,
    strip: bool,
) -> Result<u32> {
    let aboot_size = if is_lg_ramdisk_address(hdr.ramdisk_addr) {
        i64::from(hdr.page_size)
    } else {
        0x200
    };

    let aboot_offset = stream.seek(SeekFrom::End(-aboot_size))?;

    if ramdisk_offset > aboot_offset {
        return Err(LokiError::RamdiskOffsetGreaterThanAbootOffset {
            ramdisk_offset,
            aboot_offset,
        }
        .into());
    }

    if !strip {
        return Ok((aboot_offset - ramdisk_offset) as u32);
    }

    let mut buf = [0u8; 1024];
    let mut cur_offset = aboot_offset;

    while cur_offset > ramdisk_offset {
        let to_read = buf.len().min((cur_offset - ramdisk_offset) as usize);
        cur_offset -= to_read as u64;

        stream.seek(SeekFrom::Start(cur_offset))?;
        if read_fully(stream, &mut buf[..to_read])? != to_read {
            return Err(LokiError::UnexpectedFileTruncation.into());
        }

        for i in (0..to_read).rev() {
            if buf[i] != 0 {
                return Ok((cur_offset - ramdisk_offset + i as u64) as u32);
            }
        }
    }

    Err(LokiError::FailedToDetermineRamdiskSize.into())
}

struct LokiLayout {
    kernel_offset: u64,
    kernel_size: u32,
    ramdisk_offset: u64,
    ramdisk_size: u32,
    dt_offset: u64,
}

/// Reconstructs an old-style image, where the Loki header preserved
/// nothing and everything is re-derived from the payload itself.
fn read_header_old<S: Stream>(
    stream: &mut S,
    hdr: &AndroidHeader,
    loki_hdr: &LokiHeader,
    strip: bool,
) -> Result<(Header, LokiLayout)> {
    if hdr.page_size == 0 {
        return Err(LokiError::PageSizeCannotBeZero.into());
    }

    let page_size = u64::from(hdr.page_size);

    // The kernel tags address is invalid in old images; reconstruct the
    // jflte default from the kernel address
    let tags_addr = hdr
        .kernel_addr
        .wrapping_sub(DEFAULT_KERNEL_OFFSET)
        .wrapping_add(DEFAULT_TAGS_OFFSET);

    let kernel_size = find_linux_kernel_size(stream, page_size)?;

    let gzip_start =
        page_size + u64::from(kernel_size) + align_page_size(u64::from(kernel_size), page_size);
    let gzip_offset = find_gzip_offset_old(stream, gzip_start)?;

    let ramdisk_size = find_ramdisk_size_old(stream, hdr, gzip_offset, strip)?;

    let ramdisk_addr = find_ramdisk_address(stream, hdr, loki_hdr)?;

    let header = Header {
        kernel_address: Some(hdr.kernel_addr),
        ramdisk_address: Some(ramdisk_addr),
        secondboot_address: Some(hdr.second_addr),
        kernel_tags_address: Some(tags_addr),
        page_size: Some(hdr.page_size),
        board_name: Some(nul_terminated_string(&hdr.name)),
        kernel_cmdline: Some(nul_terminated_string(&hdr.cmdline)),
        id: None,
        supported_fields: OLD_SUPPORTED_FIELDS,
    };

    Ok((
        header,
        LokiLayout {
            kernel_offset: page_size,
            kernel_size,
            ramdisk_offset: gzip_offset,
            ramdisk_size,
            dt_offset: 0,
        },
    ))
}

/// Reconstructs a new-style image, where the Loki header recorded the
/// original sizes and the shellcode carries the ramdisk address.
fn read_header_new<S: Stream>(
    stream: &mut S,
    hdr: &AndroidHeader,
    loki_hdr: &LokiHeader,
) -> Result<(Header, LokiLayout)> {
    if hdr.page_size == 0 {
        return Err(LokiError::PageSizeCannotBeZero.into());
    }

    let page_size = u64::from(hdr.page_size);

    // Loki embeds a copy of aboot before the device tree; its size depends
    // on the device family
    let fake_size = if is_lg_ramdisk_address(hdr.ramdisk_addr) {
        page_size
    } else {
        0x200
    };

    let ramdisk_addr = find_ramdisk_address(stream, hdr, loki_hdr)?;

    let header = Header {
        kernel_address: Some(hdr.kernel_addr),
        ramdisk_address: Some(ramdisk_addr),
        secondboot_address: Some(hdr.second_addr),
        kernel_tags_address: Some(hdr.tags_addr),
        page_size: Some(hdr.page_size),
        board_name: Some(nul_terminated_string(&hdr.name)),
        kernel_cmdline: Some(nul_terminated_string(&hdr.cmdline)),
        id: None,
        supported_fields: NEW_SUPPORTED_FIELDS,
    };

    let mut pos = page_size;

    let kernel_offset = pos;
    pos += u64::from(loki_hdr.orig_kernel_size);
    pos += align_page_size(pos, page_size);

    let ramdisk_offset = pos;
    pos += u64::from(loki_hdr.orig_ramdisk_size);
    pos += align_page_size(pos, page_size);

    if hdr.dt_size != 0 {
        pos += fake_size;
    }
    let dt_offset = pos;

    Ok((
        header,
        LokiLayout {
            kernel_offset,
            kernel_size: loki_hdr.orig_kernel_size,
            ramdisk_offset,
            ramdisk_size: loki_hdr.orig_ramdisk_size,
            dt_offset,
        },
    ))
}

/// Read driver for Loki images.
pub(crate) struct LokiReader {
    hdr: AndroidHeader,
    loki_hdr: LokiHeader,
    header_offset: Option<u64>,
    loki_offset: Option<u64>,
    strip_ramdisk_padding: bool,
    seg: SegmentReader,
}

impl LokiReader {
    pub fn new() -> Self {
        LokiReader {
            hdr: AndroidHeader::default(),
            loki_hdr: LokiHeader::default(),
            header_offset: None,
            loki_offset: None,
            strip_ramdisk_padding: false,
            seg: SegmentReader::new(),
        }
    }

    /// Strip trailing zero padding when guessing old-style ramdisk sizes.
    /// Off by default for bit-compatibility with other tools.
    pub fn set_strip_ramdisk_padding(&mut self, strip: bool) {
        self.strip_ramdisk_padding = strip;
    }

    pub fn bid<S: Stream>(&mut self, stream: &mut S, best_bid: u32) -> Result<Option<u32>> {
        let max = ((android::BOOT_MAGIC_SIZE + LOKI_MAGIC_SIZE) * 8) as u32;
        if best_bid >= max {
            // This is a bid we can't win, so bail out
            return Ok(None);
        }

        let mut bid = 0u32;

        match find_loki_header(stream) {
            Ok((loki_hdr, offset)) => {
                self.loki_hdr = loki_hdr;
                self.loki_offset = Some(offset);
                bid += (LOKI_MAGIC_SIZE * 8) as u32;
            }
            Err(Error::Loki(_)) => {
                // This can't be a Loki boot image
                return Ok(Some(0));
            }
            Err(e) => return Err(e),
        }

        match android::find_header(stream, LOKI_MAX_HEADER_OFFSET) {
            Ok((hdr, offset)) => {
                self.hdr = hdr;
                self.header_offset = Some(offset);
                bid += (android::BOOT_MAGIC_SIZE * 8) as u32;
            }
            Err(Error::Android(AndroidError::HeaderNotFound))
            | Err(Error::Android(AndroidError::HeaderOutOfBounds)) => {
                // No Android header, so no underlying image to restore
                return Ok(Some(0));
            }
            Err(e) => return Err(e),
        }

        Ok(Some(bid))
    }

    pub fn read_header<S: Stream>(&mut self, stream: &mut S) -> Result<Header> {
        // A bid might not have been performed if the caller forced a
        // particular format
        if self.loki_offset.is_none() {
            let (loki_hdr, offset) = find_loki_header(stream)?;
            self.loki_hdr = loki_hdr;
            self.loki_offset = Some(offset);
        }
        if self.header_offset.is_none() {
            let (hdr, offset) = android::find_header(stream, android::MAX_HEADER_OFFSET)?;
            self.hdr = hdr;
            self.header_offset = Some(offset);
        }

        // New-style images record the original values of the fields the
        // tool changed
        let new_style = self.loki_hdr.orig_kernel_size != 0
            && self.loki_hdr.orig_ramdisk_size != 0
            && self.loki_hdr.ramdisk_addr != 0;

        let (header, layout) = if new_style {
            debug!("restoring new-style Loki image");
            read_header_new(stream, &self.hdr, &self.loki_hdr)?
        } else {
            debug!("restoring old-style Loki image");
            read_header_old(stream, &self.hdr, &self.loki_hdr, self.strip_ramdisk_padding)?
        };

        let mut entries = vec![
            SegmentEntry {
                entry_type: EntryType::Kernel,
                offset: layout.kernel_offset,
                size: u64::from(layout.kernel_size),
                can_truncate: false,
            },
            SegmentEntry {
                entry_type: EntryType::Ramdisk,
                offset: layout.ramdisk_offset,
                size: u64::from(layout.ramdisk_size),
                can_truncate: false,
            },
        ];
        if self.hdr.dt_size > 0 && layout.dt_offset != 0 {
            entries.push(SegmentEntry {
                entry_type: EntryType::DeviceTree,
                offset: layout.dt_offset,
                size: u64::from(self.hdr.dt_size),
                can_truncate: false,
            });
        }

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
