//! Boxed primitive encodings
//!
//! Raw primitives are written big-endian through `Buf`/`BufMut` directly.
//! Boxed primitives carry a one-byte null flag: `NULL` for an absent value,
//! otherwise `OK_TRUE` followed by the raw bytes. Boxed booleans collapse
//! the flag and the value into a single byte (`NULL`/`OK_FALSE`/`OK_TRUE`).

use crate::error::{Result, WireError};
use crate::{NOT_OK, NULL, OK_FALSE, OK_TRUE};
use bytes::{Buf, BufMut};

macro_rules! impl_boxed {
    ($put:ident, $get:ident, $ty:ty, $size:expr, $put_raw:ident, $get_raw:ident) => {
        pub fn $put<B: BufMut>(buf: &mut B, v: Option<$ty>) {
            match v {
                None => buf.put_u8(NULL),
                Some(v) => {
                    buf.put_u8(OK_TRUE);
                    buf.$put_raw(v);
                }
            }
        }

        pub fn $get<B: Buf>(buf: &mut B) -> Result<Option<$ty>> {
            if buf.remaining() < 1 {
                return Err(WireError::Eof);
            }
            match buf.get_u8() {
                NULL => Ok(None),
                OK_TRUE => {
                    if buf.remaining() < $size {
                        return Err(WireError::Eof);
                    }
                    Ok(Some(buf.$get_raw()))
                }
                other => Err(WireError::Corrupted(format!(
                    "bad boxed primitive flag {other:#04x}"
                ))),
            }
        }
    };
}

impl_boxed!(put_byte_obj, get_byte_obj, i8, 1, put_i8, get_i8);
impl_boxed!(put_int_obj, get_int_obj, i32, 4, put_i32, get_i32);
impl_boxed!(put_long_obj, get_long_obj, i64, 8, put_i64, get_i64);
impl_boxed!(put_float_obj, get_float_obj, f32, 4, put_f32, get_f32);
impl_boxed!(put_double_obj, get_double_obj, f64, 8, put_f64, get_f64);
impl_boxed!(put_char_obj, get_char_obj, u16, 2, put_u16, get_u16);

pub fn put_bool_obj<B: BufMut>(buf: &mut B, v: Option<bool>) {
    buf.put_u8(match v {
        None => NULL,
        Some(false) => OK_FALSE,
        Some(true) => OK_TRUE,
    });
}

pub fn get_bool_obj<B: Buf>(buf: &mut B) -> Result<Option<bool>> {
    if buf.remaining() < 1 {
        return Err(WireError::Eof);
    }
    match buf.get_u8() {
        NULL => Ok(None),
        OK_FALSE => Ok(Some(false)),
        OK_TRUE => Ok(Some(true)),
        other => Err(WireError::Corrupted(format!(
            "bad boxed boolean flag {other:#04x}"
        ))),
    }
}

/// Read a status byte: `Ok(false)` for `OK_FALSE`, `Ok(true)` for `OK_TRUE`.
/// `NOT_OK` is surfaced as `None` in the inner result so the caller can read
/// the serialized failure that follows.
pub fn get_status<B: Buf>(buf: &mut B) -> Result<Option<bool>> {
    if buf.remaining() < 1 {
        return Err(WireError::Eof);
    }
    match buf.get_u8() {
        OK_FALSE => Ok(Some(false)),
        OK_TRUE => Ok(Some(true)),
        NOT_OK => Ok(None),
        other => Err(WireError::Corrupted(format!(
            "bad reply status byte {other:#04x}"
        ))),
    }
}
