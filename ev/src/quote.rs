//! Quoting grammar shared by the parser and the writer
//!
//! `escaped_len` and `write_escaped` must agree byte for byte: the writer
//! sizes its output with the first and fills it with the second.

use crate::error::Result;
use crate::write::Sink;

/// Short escape for a byte, if it has one
fn short_escape(c: u8) -> Option<u8> {
    match c {
        b'\\' => Some(b'\\'),
        b'"' => Some(b'"'),
        b'\'' => Some(b'\''),
        b'$' => Some(b'$'),
        b'\n' => Some(b'n'),
        b'\r' => Some(b'r'),
        0x07 => Some(b'a'),
        0x0c => Some(b'f'),
        b'\t' => Some(b't'),
        0x0b => Some(b'v'),
        _ => None,
    }
}

fn needs_hex(c: u8, hex_high: bool) -> bool {
    c < 0x20 || c == 0x7f || (hex_high && c >= 0x80)
}

/// Length of `s` once escaped (without the surrounding quotes)
pub(crate) fn escaped_len(s: &str, hex_high: bool) -> usize {
    s.bytes()
        .map(|c| {
            if short_escape(c).is_some() {
                2
            } else if needs_hex(c, hex_high) {
                4
            } else {
                1
            }
        })
        .sum()
}

/// Write `s` escaped (without the surrounding quotes)
pub(crate) fn write_escaped<S: Sink>(s: &str, hex_high: bool, out: &mut S) -> Result<()> {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    let bytes = s.as_bytes();
    let mut run_start = 0;
    for (i, &c) in bytes.iter().enumerate() {
        let short = short_escape(c);
        if short.is_none() && !needs_hex(c, hex_high) {
            continue;
        }
        out.put(&bytes[run_start..i])?;
        run_start = i + 1;
        match short {
            Some(e) => out.put(&[b'\\', e])?,
            None => out.put(&[b'\\', b'x', HEX[usize::from(c >> 4)], HEX[usize::from(c & 0xf)]])?,
        }
    }
    out.put(&bytes[run_start..])
}

/// Undo `write_escaped`
///
/// On failure returns the byte offset within `raw` and a reason.
pub(crate) fn unescape(raw: &str) -> std::result::Result<String, (usize, &'static str)> {
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i];
        if c != b'\\' {
            out.push(c);
            i += 1;
            continue;
        }
        let Some(&e) = bytes.get(i + 1) else {
            return Err((i, "dangling backslash"));
        };
        let decoded = match e {
            b'\\' | b'"' | b'\'' | b'$' => e,
            b'n' => b'\n',
            b'r' => b'\r',
            b'a' => 0x07,
            b'f' => 0x0c,
            b't' => b'\t',
            b'v' => 0x0b,
            b'x' => {
                let hi = bytes.get(i + 2).and_then(|b| hex_digit(*b));
                let lo = bytes.get(i + 3).and_then(|b| hex_digit(*b));
                match (hi, lo) {
                    (Some(hi), Some(lo)) => {
                        out.push(hi << 4 | lo);
                        i += 4;
                        continue;
                    }
                    _ => return Err((i, "bad \\x escape")),
                }
            }
            _ => return Err((i, "unknown escape")),
        };
        out.push(decoded);
        i += 2;
    }
    String::from_utf8(out).map_err(|e| (e.utf8_error().valid_up_to(), "escaped bytes are not UTF-8"))
}

pub(crate) fn hex_digit(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'f' => Some(c - b'a' + 10),
        b'A'..=b'F' => Some(c - b'A' + 10),
        _ => None,
    }
}
