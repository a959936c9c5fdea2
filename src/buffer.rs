// src/buffer.rs
//! Caller-supplied output buffers.
//!
//! Strings are written as UTF-8 followed by a NUL; lists as their items, each
//! NUL terminated. The length reported on success counts the terminators.
//! Nothing is written unless the whole value fits.

use std::cell::RefCell;

use crate::error::{WarpError, WarpResult};
use crate::retry::Attempted;

/// Scratch buffers above this size are shrunk back after use.
const MAX_RETAINED_SCRATCH: usize = 1 << 20;

thread_local! {
    static SCRATCH: RefCell<Vec<u8>> = const { RefCell::new(Vec::new()) };
}

pub fn required_str(s: &str) -> usize {
    s.len() + 1
}

pub fn required_list<S: AsRef<str>>(items: &[S]) -> usize {
    items.iter().map(|s| s.as_ref().len() + 1).sum()
}

pub fn write_str(out: &mut [u8], s: &str) -> WarpResult<usize> {
    let required = required_str(s);
    if out.len() < required {
        return Err(WarpError::BufferTooSmall { required });
    }
    out[..s.len()].copy_from_slice(s.as_bytes());
    out[s.len()] = 0;
    Ok(required)
}

pub fn write_list<S: AsRef<str>>(out: &mut [u8], items: &[S]) -> WarpResult<usize> {
    let required = required_list(items);
    if out.len() < required {
        return Err(WarpError::BufferTooSmall { required });
    }
    let mut at = 0;
    for item in items {
        let bytes = item.as_ref().as_bytes();
        out[at..at + bytes.len()].copy_from_slice(bytes);
        at += bytes.len();
        out[at] = 0;
        at += 1;
    }
    Ok(at)
}

/// `None` writes nothing and reports zero bytes; an empty string still takes
/// its terminator.
pub fn write_opt_str(out: &mut [u8], s: Option<&str>) -> WarpResult<usize> {
    match s {
        Some(s) => write_str(out, s),
        None => Ok(0),
    }
}

/// Text up to the first NUL, lossily decoded.
pub fn decode_str(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

pub fn decode_opt_str(bytes: &[u8]) -> Option<String> {
    (!bytes.is_empty()).then(|| decode_str(bytes))
}

/// Items of a list written by [`write_list`]; `bytes` is exactly the used part.
pub fn decode_list(bytes: &[u8]) -> Vec<String> {
    match bytes.strip_suffix(&[0]) {
        Some(body) => body
            .split(|b| *b == 0)
            .map(|s| String::from_utf8_lossy(s).into_owned())
            .collect(),
        None => Vec::new(),
    }
}

/// Run `f` with this thread's scratch buffer, sized to at least `min_len`.
/// Falls back to a temporary buffer on reentrant use.
pub fn with_scratch<R>(min_len: usize, f: impl FnOnce(&mut Vec<u8>) -> R) -> R {
    SCRATCH.with(|cell| match cell.try_borrow_mut() {
        Ok(mut scratch) => {
            if scratch.len() < min_len {
                scratch.resize(min_len, 0);
            }
            let out = f(&mut scratch);
            if scratch.len() > MAX_RETAINED_SCRATCH {
                scratch.truncate(min_len);
                scratch.shrink_to_fit();
            }
            out
        }
        Err(_) => f(&mut vec![0; min_len]),
    })
}

/// Call `fill` with a scratch buffer, growing it on `BufferTooSmall` until
/// the value fits, then decode the used bytes.
///
/// `fill` returns the number of bytes it wrote. Growth goes to the larger of
/// the reported requirement and twice the current size.
pub fn fill_growing<R>(
    initial: usize,
    mut fill: impl FnMut(&mut [u8]) -> WarpResult<Attempted<usize>>,
    decode: impl FnOnce(&[u8]) -> R,
) -> WarpResult<Attempted<R>> {
    with_scratch(initial, |scratch| loop {
        match fill(scratch.as_mut_slice()) {
            Ok(done) => {
                let used = done.value.min(scratch.len());
                return Ok(Attempted {
                    value: decode(&scratch[..used]),
                    attempts: done.attempts,
                });
            }
            Err(WarpError::BufferTooSmall { required }) => {
                let grown = required.max(scratch.len().saturating_mul(2)).max(1);
                scratch.resize(grown, 0);
            }
            Err(err) => return Err(err),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_needs_room_for_the_terminator() {
        let mut out = [0xffu8; 5];
        assert_eq!(
            write_str(&mut out, "hello"),
            Err(WarpError::BufferTooSmall { required: 6 })
        );
        // untouched on failure
        assert_eq!(out, [0xff; 5]);

        let mut out = [0xffu8; 6];
        assert_eq!(write_str(&mut out, "hello"), Ok(6));
        assert_eq!(&out, b"hello\0");
        assert_eq!(decode_str(&out), "hello");
    }

    #[test]
    fn lists_are_nul_separated() {
        let items = ["", "AREA_OR_POINT=Area", "x"];
        let mut out = vec![0u8; required_list(&items)];
        let used = write_list(&mut out, &items).unwrap();
        assert_eq!(used, 1 + 19 + 2);
        assert_eq!(decode_list(&out[..used]), items);

        let empty: [&str; 0] = [];
        assert_eq!(write_list(&mut [], &empty), Ok(0));
        assert!(decode_list(&[]).is_empty());
    }

    #[test]
    fn optional_strings() {
        let mut out = [0u8; 4];
        assert_eq!(write_opt_str(&mut out, None), Ok(0));
        assert_eq!(decode_opt_str(&out[..0]), None);
        assert_eq!(write_opt_str(&mut out, Some("")), Ok(1));
        assert_eq!(decode_opt_str(&out[..1]), Some(String::new()));
    }

    #[test]
    fn fill_growing_retries_until_it_fits() {
        let text = "x".repeat(100);
        let mut calls = 0;
        let out = fill_growing(
            4,
            |buf| {
                calls += 1;
                write_str(buf, &text).map(|n| Attempted { value: n, attempts: 1 })
            },
            decode_str,
        )
        .unwrap();
        assert_eq!(out.value, text);
        assert_eq!(calls, 2);
    }

    #[test]
    fn reentrant_scratch_use_falls_back() {
        let inner = with_scratch(8, |outer| {
            outer[0] = 1;
            with_scratch(8, |inner| inner.len())
        });
        assert_eq!(inner, 8);
    }
}
