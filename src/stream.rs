//! Positioned byte streams and the helpers built on top of them.
//!
//! Every reader and writer in this crate works against the [`Stream`] trait
//! rather than a concrete file type, so images can live in files, memory
//! buffers, or test doubles alike.

use std::cmp;
use std::fs::File;
use std::io::{self, Cursor, Read, Seek, SeekFrom, Write};

use crate::errors::Result;

const SEARCH_BUF_SIZE: usize = 8 * 1024;

/// A positioned byte source and sink.
///
/// Once [`is_fatal`](Stream::is_fatal) reports `true`, the stream can no
/// longer be used and any facade holding it refuses further operations.
pub trait Stream: Read + Write + Seek {
    /// Whether the underlying resource has failed unrecoverably.
    fn is_fatal(&self) -> bool {
        false
    }
}

impl Stream for File {}
impl Stream for Cursor<Vec<u8>> {}
impl Stream for Cursor<&mut Vec<u8>> {}

/// What the [`search`] callback wants done after a match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchAction {
    Continue,
    Stop,
}

/// Reads until `buf` is full or EOF is reached, returning the number of
/// bytes read.
pub fn read_fully<S: Read + ?Sized>(stream: &mut S, buf: &mut [u8]) -> io::Result<usize> {
    let mut total = 0;
    while total < buf.len() {
        match stream.read(&mut buf[total..]) {
            Ok(0) => break,
            Ok(n) => total += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(total)
}

/// Writes the whole of `buf`, retrying short writes.
pub fn write_fully<S: Write + ?Sized>(stream: &mut S, buf: &[u8]) -> io::Result<()> {
    let mut total = 0;
    while total < buf.len() {
        match stream.write(&buf[total..]) {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "failed to write whole buffer",
                ));
            }
            Ok(n) => total += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Scans `stream` forward for `needle`, invoking `on_match` with the
/// absolute offset of each match.
///
/// `start` and `end` default to the current position and EOF respectively.
/// `max_matches` of `None` is unbounded. Matches do not overlap. The
/// scanner re-seeks before every buffer refill, so the callback may freely
/// reposition the stream; callback errors propagate to the caller as-is.
pub fn search<S, F>(
    stream: &mut S,
    start: Option<u64>,
    end: Option<u64>,
    needle: &[u8],
    max_matches: Option<u64>,
    mut on_match: F,
) -> Result<()>
where
    S: Stream + ?Sized,
    F: FnMut(&mut S, u64) -> Result<SearchAction>,
{
    if needle.is_empty() || max_matches == Some(0) {
        return Ok(());
    }

    let start = match start {
        Some(offset) => offset,
        None => stream.seek(SeekFrom::Current(0))?,
    };
    let end = match end {
        Some(offset) => offset,
        None => stream.seek(SeekFrom::End(0))?,
    };
    if end <= start || end - start < needle.len() as u64 {
        return Ok(());
    }

    let mut remaining = max_matches;
    let cap = cmp::max(SEARCH_BUF_SIZE, needle.len() * 2);
    let mut buf = vec![0u8; cap];
    // Absolute offset of buf[0] and the number of bytes carried over from
    // the previous round to catch matches spanning a refill boundary.
    let mut offset = start;
    let mut carry = 0usize;

    loop {
        let fill_at = offset + carry as u64;
        if fill_at >= end {
            break;
        }
        let want = cmp::min((cap - carry) as u64, end - fill_at) as usize;
        stream.seek(SeekFrom::Start(fill_at))?;
        let n = read_fully(stream, &mut buf[carry..carry + want])?;
        let filled = carry + n;
        if filled < needle.len() {
            break;
        }

        let scan_end = filled - needle.len() + 1;
        let mut i = 0;
        while i < scan_end {
            if &buf[i..i + needle.len()] == needle {
                match on_match(stream, offset + i as u64)? {
                    SearchAction::Stop => return Ok(()),
                    SearchAction::Continue => {}
                }
                if let Some(m) = remaining.as_mut() {
                    *m -= 1;
                    if *m == 0 {
                        return Ok(());
                    }
                }
                i += needle.len();
            } else {
                i += 1;
            }
        }

        if n < want {
            // EOF before the requested end
            break;
        }
        carry = needle.len() - 1;
        buf.copy_within(filled - carry..filled, 0);
        offset += (filled - carry) as u64;
    }

    Ok(())
}
