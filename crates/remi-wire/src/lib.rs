//! Wire encodings for the remi RMI runtime
//!
//! This crate holds the byte-level building blocks shared by both ends of a
//! session: the var-uint length encoding, the compact string and modified
//! UTF-8 codecs, boxed primitive forms, and the pluggable [`ObjectCodec`]
//! that marshals user object payloads.
//!
//! All multi-byte integers are big-endian. The reply status bytes are:
//!
//! | Byte       | Meaning                                  |
//! |------------|------------------------------------------|
//! | `NULL`     | null value (inside values only)          |
//! | `OK_FALSE` | normal reply, boolean false              |
//! | `OK_TRUE`  | normal reply, boolean true               |
//! | `NOT_OK`   | failure reply, throwable chain follows   |

pub mod codec;
pub mod error;
pub mod primitives;
pub mod strings;
pub mod varint;

pub use codec::{
    object_identity, BasicCodec, CodecObject, ObjectCodec, StackFrame, ThrowableStub,
};
pub use error::{Result, WireError};

/// Null value marker, used inside values (never as a reply status).
pub const NULL: u8 = 0;
/// Normal reply; doubles as boolean `false`.
pub const OK_FALSE: u8 = 1;
/// Normal reply; doubles as boolean `true`.
pub const OK_TRUE: u8 = 2;
/// Failure reply; a serialized throwable chain follows.
pub const NOT_OK: u8 = 3;
