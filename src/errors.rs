use std::io;

use thiserror::Error;

use crate::entry::EntryType;
use crate::format::Format;

/// Errors specific to the Android and Bump dialects.
#[derive(Debug, Error)]
pub enum AndroidError {
    #[error("Android header not found")]
    HeaderNotFound,
    #[error("Android header exceeds file size")]
    HeaderOutOfBounds,
    #[error("page size is missing")]
    MissingPageSize,
    #[error("invalid page size: {0}")]
    InvalidPageSize(u32),
    #[error("board name is too long")]
    BoardNameTooLong,
    #[error("kernel cmdline is too long")]
    KernelCmdlineTooLong,
}

/// Errors specific to the Loki dialect.
#[derive(Debug, Error)]
pub enum LokiError {
    #[error("too small to be a Loki image")]
    LokiHeaderTooSmall,
    #[error("invalid Loki magic")]
    InvalidLokiMagic,
    #[error("Loki shellcode not found")]
    ShellcodeNotFound,
    #[error("unexpected EOF when reading {0}")]
    UnexpectedEndOfFile(&'static str),
    #[error("invalid kernel address: {0:#010x}")]
    InvalidKernelAddress(u32),
    #[error("page size cannot be zero")]
    PageSizeCannotBeZero,
    #[error("no gzip header found for ramdisk")]
    NoRamdiskGzipHeaderFound,
    #[error("ramdisk offset {ramdisk_offset:#x} is greater than aboot offset {aboot_offset:#x}")]
    RamdiskOffsetGreaterThanAbootOffset {
        ramdisk_offset: u64,
        aboot_offset: u64,
    },
    #[error("failed to determine ramdisk size")]
    FailedToDetermineRamdiskSize,
    #[error("unexpected file truncation while scanning ramdisk")]
    UnexpectedFileTruncation,
}

/// Errors raised by the segment engine shared by every format driver.
#[derive(Debug, Error)]
pub enum SegmentError {
    #[error("cannot replace entries in current state")]
    AddEntryInIncorrectState,
    #[error("segment entry list is empty")]
    NoEntries,
    #[error("segment entry list contains duplicate type {0}")]
    DuplicateEntryType(EntryType),
    #[error("entry offset and size would overflow")]
    EntryWouldOverflowOffset,
    #[error("read would overflow integer")]
    ReadWouldOverflowInteger,
    #[error("entry is truncated (expected {remaining} more bytes)")]
    EntryIsTruncated { remaining: u64 },
    #[error("write would overflow integer")]
    WriteWouldOverflowInteger,
    #[error("expected entry type {expected}, but got {actual}")]
    UnexpectedEntryType {
        expected: EntryType,
        actual: EntryType,
    },
    #[error("no more entries to write")]
    EndOfEntries,
}

/// Any error the reader and writer facades can surface.
#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Android(#[from] AndroidError),
    #[error(transparent)]
    Loki(#[from] LokiError),
    #[error(transparent)]
    Segment(#[from] SegmentError),
    #[error("failed to determine boot image format")]
    UnknownFormat,
    #[error("no boot image formats are enabled")]
    NoFormatsEnabled,
    #[error("entry not found")]
    EntryNotFound,
    #[error("{0} format is not supported for writing")]
    UnsupportedFormat(Format),
    #[error("invalid state for {op}")]
    InvalidState { op: &'static str },
    #[error("stream is in a fatal state")]
    Fatal,
}

pub type Result<T> = std::result::Result<T, Error>;
