//! Incremental RESP tokenizer.
//!
//! Operates on buffered byte slices. The caller is responsible for reading
//! data from the network into a buffer; the tokenizer is purely
//! synchronous and can be invoked at arbitrary split points: a scan that
//! runs out of bytes returns `Ok(None)` and the caller retries once more
//! data arrives. Nothing is consumed until a whole unit is available, so
//! re-scanning from the start of the buffer is always correct.
//!
//! # Raw spans
//!
//! When scanning a `Bytes` buffer via [`scan`], each unit's raw span and
//! decoded payloads are zero-copy `Bytes::slice()`s into the original
//! buffer. The fallback [`scan_slice`] copies the input once for callers
//! that only have a `&[u8]`.
//!
//! # End of stream
//!
//! Only `\r\n` terminates a line; a lone `\n` does not. When `at_eof` is
//! set and the buffer holds an unterminated remainder, that remainder is
//! returned as a final unit instead of "need more data": line forms decode
//! their payload without the terminator, anything else surfaces as an
//! inline unit over the raw remainder.

use std::io::Cursor;

use bytes::Bytes;

use crate::error::ProtocolError;
use crate::types::{ProtocolUnit, UnitKind};

/// Maximum nesting depth for arrays. Prevents stack overflow from
/// malformed deeply-nested input.
const MAX_NESTING_DEPTH: usize = 64;

/// Maximum number of elements in an array. Prevents memory amplification
/// where tiny elements declare disproportionately large allocations.
const MAX_ARRAY_ELEMENTS: usize = 1_048_576;

/// Maximum length of a bulk string in bytes (512 MB, matching the backend).
const MAX_BULK_LEN: i64 = 512 * 1024 * 1024;

/// Cap for `Vec::with_capacity` in array scanning, limiting the upfront
/// allocation for hostile element counts while letting the Vec grow as
/// elements actually arrive.
const PREALLOC_CAP: usize = 1024;

/// Scans one protocol unit from the front of `buf`.
///
/// Returns `Ok(Some((unit, consumed)))` when a complete unit was
/// tokenized, `Ok(None)` when the buffer doesn't contain enough data yet,
/// or `Err(...)` when the data is malformed. With `at_eof` set, an
/// unterminated remainder becomes the final unit (see module docs).
#[inline]
pub fn scan(buf: &Bytes, at_eof: bool) -> Result<Option<(ProtocolUnit, usize)>, ProtocolError> {
    if buf.is_empty() {
        return Ok(None);
    }

    let mut cursor = Cursor::new(buf.as_ref());

    match try_scan(&mut cursor, buf, 0) {
        Ok(unit) => {
            let consumed = cursor.position() as usize;
            Ok(Some((unit, consumed)))
        }
        Err(ProtocolError::Incomplete) if at_eof => Ok(Some(final_unit(buf))),
        Err(ProtocolError::Incomplete) => Ok(None),
        Err(e) => Err(e),
    }
}

/// Copying variant of [`scan`] for callers that only have a `&[u8]`.
///
/// The input is copied once so raw spans can be handed out as owned
/// `Bytes`. Prefer [`scan`] on hot paths.
#[inline]
pub fn scan_slice(
    buf: &[u8],
    at_eof: bool,
) -> Result<Option<(ProtocolUnit, usize)>, ProtocolError> {
    let owned = Bytes::copy_from_slice(buf);
    scan(&owned, at_eof)
}

// ---------------------------------------------------------------------------
// single-pass scanner: validates and builds units in one traversal
// ---------------------------------------------------------------------------

/// Scans a complete unit from the cursor position, returning `Incomplete`
/// when the buffer doesn't contain enough data. Raw spans and payloads are
/// sliced zero-copy from `src`.
fn try_scan(
    cursor: &mut Cursor<&[u8]>,
    src: &Bytes,
    depth: usize,
) -> Result<ProtocolUnit, ProtocolError> {
    let start = cursor.position() as usize;
    let prefix = peek_byte(cursor)?;

    match prefix {
        b'+' => {
            advance(cursor, 1);
            let (line_start, line_end) = read_line(cursor)?;
            let raw = src.slice(start..cursor.position() as usize);
            Ok(ProtocolUnit::new(
                raw,
                UnitKind::Status(src.slice(line_start..line_end)),
            ))
        }
        b'-' => {
            advance(cursor, 1);
            let (line_start, line_end) = read_line(cursor)?;
            let raw = src.slice(start..cursor.position() as usize);
            Ok(ProtocolUnit::new(
                raw,
                UnitKind::Error(src.slice(line_start..line_end)),
            ))
        }
        b':' => {
            advance(cursor, 1);
            let val = read_integer_line(cursor)?;
            let raw = src.slice(start..cursor.position() as usize);
            Ok(ProtocolUnit::new(raw, UnitKind::Integer(val)))
        }
        b'$' => {
            advance(cursor, 1);
            let len = read_integer_line(cursor)?;
            if len == -1 {
                let raw = src.slice(start..cursor.position() as usize);
                return Ok(ProtocolUnit::new(raw, UnitKind::Bulk(None)));
            }
            if len < 0 {
                return Err(ProtocolError::InvalidLength(len));
            }
            if len > MAX_BULK_LEN {
                return Err(ProtocolError::BulkTooLarge(len as usize));
            }
            let len = len as usize;

            // need `len` bytes of payload + \r\n
            if remaining(cursor) < len + 2 {
                return Err(ProtocolError::Incomplete);
            }

            let pos = cursor.position() as usize;
            {
                let buf = cursor.get_ref();
                if buf[pos + len] != b'\r' || buf[pos + len + 1] != b'\n' {
                    return Err(ProtocolError::MissingTerminator);
                }
            }
            cursor.set_position((pos + len + 2) as u64);

            let raw = src.slice(start..cursor.position() as usize);
            Ok(ProtocolUnit::new(
                raw,
                UnitKind::Bulk(Some(src.slice(pos..pos + len))),
            ))
        }
        b'*' => {
            let next_depth = depth + 1;
            if next_depth > MAX_NESTING_DEPTH {
                return Err(ProtocolError::NestingTooDeep(MAX_NESTING_DEPTH));
            }

            advance(cursor, 1);
            let count = read_integer_line(cursor)?;
            if count == -1 {
                let raw = src.slice(start..cursor.position() as usize);
                return Ok(ProtocolUnit::new(raw, UnitKind::Array(None)));
            }
            if count < 0 {
                return Err(ProtocolError::InvalidLength(count));
            }
            if count as usize > MAX_ARRAY_ELEMENTS {
                return Err(ProtocolError::TooManyElements(count as usize));
            }

            // a child's need-more-data propagates up: the whole array is
            // incomplete and no bytes count as consumed
            let count = count as usize;
            let mut elements = Vec::with_capacity(count.min(PREALLOC_CAP));
            for _ in 0..count {
                elements.push(try_scan(cursor, src, next_depth)?);
            }

            let raw = src.slice(start..cursor.position() as usize);
            Ok(ProtocolUnit::new(raw, UnitKind::Array(Some(elements))))
        }
        _ => {
            // legacy inline form: a bare line with no type prefix
            let (line_start, line_end) = read_line(cursor)?;
            let raw = src.slice(start..cursor.position() as usize);
            Ok(ProtocolUnit::new(
                raw,
                UnitKind::Inline(src.slice(line_start..line_end)),
            ))
        }
    }
}

/// Builds the final unit for an unterminated remainder at end of stream.
///
/// Status and error lines decode their payload without the terminator; an
/// integer line is decoded when its digits parse cleanly. Everything else
/// (truncated bulk/array payloads, bare text) is surfaced as an inline
/// unit whose payload is the remainder with any trailing half-terminator
/// stripped.
fn final_unit(buf: &Bytes) -> (ProtocolUnit, usize) {
    let raw = buf.clone();
    let end = trim_trailing_terminator(buf);

    let kind = match buf[0] {
        b'+' => UnitKind::Status(buf.slice(1..end)),
        b'-' => UnitKind::Error(buf.slice(1..end)),
        b':' => match parse_i64(&buf[1..end]) {
            Ok(val) => UnitKind::Integer(val),
            Err(_) => UnitKind::Inline(buf.slice(0..end)),
        },
        _ => UnitKind::Inline(buf.slice(0..end)),
    };

    (ProtocolUnit::new(raw, kind), buf.len())
}

/// Index just before a trailing `\r\n` or lone `\r`, if present.
fn trim_trailing_terminator(buf: &[u8]) -> usize {
    if buf.ends_with(b"\r\n") {
        buf.len() - 2
    } else if buf.ends_with(b"\r") {
        buf.len() - 1
    } else {
        buf.len()
    }
}

// ---------------------------------------------------------------------------
// low-level cursor helpers
// ---------------------------------------------------------------------------

fn peek_byte(cursor: &Cursor<&[u8]>) -> Result<u8, ProtocolError> {
    let pos = cursor.position() as usize;
    if pos >= cursor.get_ref().len() {
        return Err(ProtocolError::Incomplete);
    }
    Ok(cursor.get_ref()[pos])
}

fn advance(cursor: &mut Cursor<&[u8]>, n: usize) {
    cursor.set_position(cursor.position() + n as u64);
}

fn remaining(cursor: &Cursor<&[u8]>) -> usize {
    let len = cursor.get_ref().len();
    let pos = cursor.position() as usize;
    len.saturating_sub(pos)
}

/// Returns the `(start, end)` byte range of the line beginning at the
/// cursor, excluding the terminator, and advances the cursor past `\r\n`.
fn read_line(cursor: &mut Cursor<&[u8]>) -> Result<(usize, usize), ProtocolError> {
    let start = cursor.position() as usize;
    let end = find_crlf(cursor)?;
    Ok((start, end))
}

/// Reads a line and parses it as an i64.
fn read_integer_line(cursor: &mut Cursor<&[u8]>) -> Result<i64, ProtocolError> {
    let (start, end) = read_line(cursor)?;
    let buf = cursor.get_ref();
    parse_i64(&buf[start..end])
}

/// Finds the next `\r\n` starting from the cursor position. Returns the
/// index of the `\r` and advances the cursor past the `\n`. A lone `\n`
/// never terminates a line.
fn find_crlf(cursor: &mut Cursor<&[u8]>) -> Result<usize, ProtocolError> {
    let buf = cursor.get_ref();
    let start = cursor.position() as usize;

    if start >= buf.len() {
        return Err(ProtocolError::Incomplete);
    }

    // memchr scan for \r, then verify \n follows
    let mut pos = start;
    while let Some(offset) = memchr::memchr(b'\r', &buf[pos..]) {
        let cr = pos + offset;
        if cr + 1 < buf.len() && buf[cr + 1] == b'\n' {
            cursor.set_position((cr + 2) as u64);
            return Ok(cr);
        }
        // bare \r without \n, keep scanning past it
        pos = cr + 1;
    }

    Err(ProtocolError::Incomplete)
}

/// Parses an i64 directly from a byte slice without allocating.
///
/// Negative numbers are accumulated in the negative direction so that
/// `i64::MIN` is representable without overflow.
fn parse_i64(buf: &[u8]) -> Result<i64, ProtocolError> {
    if buf.is_empty() {
        return Err(ProtocolError::InvalidInteger);
    }

    let (negative, digits) = if buf[0] == b'-' {
        (true, &buf[1..])
    } else {
        (false, buf)
    };

    if digits.is_empty() {
        return Err(ProtocolError::InvalidInteger);
    }

    let mut n: i64 = 0;
    for &b in digits {
        if !b.is_ascii_digit() {
            return Err(ProtocolError::InvalidInteger);
        }
        let digit = (b - b'0') as i64;
        n = n
            .checked_mul(10)
            .and_then(|n| {
                if negative {
                    n.checked_sub(digit)
                } else {
                    n.checked_add(digit)
                }
            })
            .ok_or(ProtocolError::InvalidInteger)?;
    }
    Ok(n)
}
