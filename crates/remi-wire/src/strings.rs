//! Compact string and modified-UTF-8 codecs
//!
//! The compact encoding is used for all protocol strings. A string is a
//! var-uint sequence count followed by one variable-width sequence per code
//! point:
//!
//! ```text
//! 0xxxxxxx                       7-bit value, one byte
//! 10xxxxxx xxxxxxxx              14-bit value, two bytes
//! 110xxxxx xxxxxxxx xxxxxxxx     21-bit code point, three bytes
//! 111xxxxx                       illegal
//! ```
//!
//! Supplementary code points may arrive either as a single 21-bit sequence
//! or as two 16-bit surrogate sequences; the reader accepts both and always
//! produces the combined code point. A null string is the dedicated sentinel
//! byte `0xff` in the length position (the 5-byte var-uint form never uses a
//! first byte above `0xf0`).
//!
//! The modified-UTF-8 codec follows the classical rules: one byte
//! `0xxxxxxx`, two bytes `110xxxxx 10xxxxxx`, three bytes
//! `1110xxxx 10xxxxxx 10xxxxxx`, NUL written in two-byte form and
//! supplementary code points as a surrogate pair of three-byte sequences.

use crate::error::{Result, WireError};
use crate::varint::{get_var_uint, put_var_uint};
use bytes::{Buf, BufMut};

/// Sentinel byte denoting a null string in the length position.
pub const NULL_SENTINEL: u8 = 0xff;

const HIGH_SURROGATE: std::ops::RangeInclusive<u32> = 0xd800..=0xdbff;
const LOW_SURROGATE: std::ops::RangeInclusive<u32> = 0xdc00..=0xdfff;

/// Length in bytes of a compact character sequence, from its first byte.
pub fn seq_len(first: u8) -> Result<usize> {
    match first {
        0x00..=0x7f => Ok(1),
        0x80..=0xbf => Ok(2),
        0xc0..=0xdf => Ok(3),
        _ => Err(WireError::Corrupted(format!(
            "illegal character sequence first byte {first:#04x}"
        ))),
    }
}

/// Decode one compact sequence. The full sequence must be present.
pub fn get_seq<B: Buf>(buf: &mut B) -> Result<u32> {
    if buf.remaining() < 1 {
        return Err(WireError::Eof);
    }
    let b1 = buf.get_u8();
    let len = seq_len(b1)?;
    if buf.remaining() < len - 1 {
        return Err(WireError::Eof);
    }
    Ok(match len {
        1 => u32::from(b1),
        2 => (u32::from(b1 & 0x3f) << 8) | u32::from(buf.get_u8()),
        _ => {
            (u32::from(b1 & 0x1f) << 16)
                | (u32::from(buf.get_u8()) << 8)
                | u32::from(buf.get_u8())
        }
    })
}

/// Encode one code point as a compact sequence.
pub fn put_seq<B: BufMut>(buf: &mut B, cp: u32) {
    if cp <= 0x7f {
        buf.put_u8(cp as u8);
    } else if cp <= 0x3fff {
        buf.put_u8(0x80 | (cp >> 8) as u8);
        buf.put_u8(cp as u8);
    } else {
        buf.put_u8(0xc0 | (cp >> 16) as u8);
        buf.put_u8((cp >> 8) as u8);
        buf.put_u8(cp as u8);
    }
}

/// Encode a non-null string: var-uint sequence count, then one sequence per
/// code point.
pub fn put_str<B: BufMut>(buf: &mut B, s: &str) {
    put_var_uint(buf, s.chars().count() as u32);
    for c in s.chars() {
        put_seq(buf, c as u32);
    }
}

/// Encode an optional string, using the null sentinel for `None`.
pub fn put_str_opt<B: BufMut>(buf: &mut B, s: Option<&str>) {
    match s {
        None => buf.put_u8(NULL_SENTINEL),
        Some(s) => put_str(buf, s),
    }
}

/// Decode a non-null string. The full encoding must be present.
pub fn get_str<B: Buf>(buf: &mut B) -> Result<String> {
    let count = get_var_uint(buf)? as usize;
    // The count is untrusted; allocation grows with actual data instead.
    let mut out = String::with_capacity(count.min(4096));
    let mut consumed = 0usize;
    while consumed < count {
        let cp = get_seq(buf)?;
        consumed += 1;
        let cp = if HIGH_SURROGATE.contains(&cp) {
            if consumed >= count {
                return Err(WireError::Corrupted(
                    "truncated surrogate pair in string".into(),
                ));
            }
            let low = get_seq(buf)?;
            consumed += 1;
            if !LOW_SURROGATE.contains(&low) {
                return Err(WireError::Corrupted(format!(
                    "unpaired high surrogate {cp:#06x}"
                )));
            }
            0x10000 + ((cp - 0xd800) << 10) + (low - 0xdc00)
        } else if LOW_SURROGATE.contains(&cp) {
            return Err(WireError::Corrupted(format!(
                "unpaired low surrogate {cp:#06x}"
            )));
        } else {
            cp
        };
        match char::from_u32(cp) {
            Some(c) => out.push(c),
            None => {
                return Err(WireError::Corrupted(format!(
                    "illegal code point {cp:#x} in string"
                )))
            }
        }
    }
    Ok(out)
}

/// Decode an optional string written by [`put_str_opt`].
pub fn get_str_opt<B: Buf>(buf: &mut B) -> Result<Option<String>> {
    if buf.remaining() < 1 {
        return Err(WireError::Eof);
    }
    if buf.chunk()[0] == NULL_SENTINEL {
        buf.advance(1);
        return Ok(None);
    }
    get_str(buf).map(Some)
}

/// Encode a string in modified UTF-8: var-uint byte length, then bytes.
pub fn put_utf<B: BufMut>(buf: &mut B, s: &str) {
    let mut byte_len = 0usize;
    for u in s.encode_utf16() {
        byte_len += match u {
            0 => 2,
            1..=0x7f => 1,
            0x80..=0x7ff => 2,
            _ => 3,
        };
    }
    put_var_uint(buf, byte_len as u32);
    for u in s.encode_utf16() {
        let u = u32::from(u);
        match u {
            1..=0x7f => buf.put_u8(u as u8),
            0 | 0x80..=0x7ff => {
                buf.put_u8(0xc0 | (u >> 6) as u8);
                buf.put_u8(0x80 | (u & 0x3f) as u8);
            }
            _ => {
                buf.put_u8(0xe0 | (u >> 12) as u8);
                buf.put_u8(0x80 | ((u >> 6) & 0x3f) as u8);
                buf.put_u8(0x80 | (u & 0x3f) as u8);
            }
        }
    }
}

/// Decode a modified-UTF-8 string written by [`put_utf`].
pub fn get_utf<B: Buf>(buf: &mut B) -> Result<String> {
    let byte_len = get_var_uint(buf)? as usize;
    if buf.remaining() < byte_len {
        return Err(WireError::Eof);
    }
    let mut bytes = vec![0u8; byte_len];
    buf.copy_to_slice(&mut bytes);

    let mut units = Vec::with_capacity(byte_len);
    let mut i = 0usize;
    while i < byte_len {
        let b1 = bytes[i];
        let (unit, width) = match b1 {
            0x00..=0x7f => (u16::from(b1), 1),
            0xc0..=0xdf => {
                if i + 1 >= byte_len {
                    return Err(WireError::Corrupted("truncated UTF-8 sequence".into()));
                }
                let b2 = bytes[i + 1];
                if b2 & 0xc0 != 0x80 {
                    return Err(WireError::Corrupted(format!(
                        "malformed UTF-8 continuation byte {b2:#04x}"
                    )));
                }
                ((u16::from(b1 & 0x1f) << 6) | u16::from(b2 & 0x3f), 2)
            }
            0xe0..=0xef => {
                if i + 2 >= byte_len {
                    return Err(WireError::Corrupted("truncated UTF-8 sequence".into()));
                }
                let (b2, b3) = (bytes[i + 1], bytes[i + 2]);
                if b2 & 0xc0 != 0x80 || b3 & 0xc0 != 0x80 {
                    return Err(WireError::Corrupted(
                        "malformed UTF-8 continuation byte".into(),
                    ));
                }
                (
                    (u16::from(b1 & 0x0f) << 12)
                        | (u16::from(b2 & 0x3f) << 6)
                        | u16::from(b3 & 0x3f),
                    3,
                )
            }
            _ => {
                return Err(WireError::Corrupted(format!(
                    "malformed UTF-8 first byte {b1:#04x}"
                )))
            }
        };
        units.push(unit);
        i += width;
    }

    String::from_utf16(&units)
        .map_err(|_| WireError::Corrupted("unpaired surrogate in UTF-8 string".into()))
}
