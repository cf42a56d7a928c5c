//! Pluggable object codec
//!
//! The invocation protocol does not pick a serialization format for user
//! objects. It hands each object payload to an [`ObjectCodec`] and frames
//! the resulting bytes itself; object identity within a sharing scope is
//! tracked by the framing layer, keyed on `Arc` pointer identity.
//!
//! [`BasicCodec`] is the built-in implementation: a self-describing tag
//! codec covering the types the runtime itself needs (strings, byte
//! payloads, stack frames, throwables) plus common primitives, so sessions
//! work out of the box. Hosts with richer payloads supply their own codec.

use crate::error::{Result, WireError};
use crate::strings::{get_str, get_str_opt, put_str, put_str_opt};
use crate::varint::{get_var_uint, put_var_uint};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// A value that can travel through an [`ObjectCodec`].
///
/// Blanket-implemented for every `Any + Send + Sync + Debug` type; object
/// identity is the `Arc` pointer, so repeated writes of the same `Arc`
/// within one sharing scope collapse to back-references.
pub trait CodecObject: Any + Send + Sync + fmt::Debug {
    fn as_any(&self) -> &dyn Any;
}

impl<T: Any + Send + Sync + fmt::Debug> CodecObject for T {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Pointer identity of a codec object, used as the sharing-scope key.
pub fn object_identity(obj: &Arc<dyn CodecObject>) -> usize {
    Arc::as_ptr(obj) as *const () as usize
}

/// Marshaller for user object payloads.
pub trait ObjectCodec: Send + Sync {
    /// Encode `obj` into `buf`. A value the codec does not understand fails
    /// with [`WireError::NotSerializable`] naming the value.
    fn encode(&self, obj: &Arc<dyn CodecObject>, buf: &mut BytesMut) -> Result<()>;

    /// Decode one object from `buf`, consuming exactly its encoding.
    fn decode(&self, buf: &mut Bytes) -> Result<Arc<dyn CodecObject>>;
}

/// One element of a serialized stack trace.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StackFrame {
    pub class_name: String,
    pub method_name: String,
    pub file_name: Option<String>,
    pub line: u32,
}

impl StackFrame {
    pub fn new(class_name: impl Into<String>, method_name: impl Into<String>) -> Self {
        Self {
            class_name: class_name.into(),
            method_name: method_name.into(),
            file_name: None,
            line: 0,
        }
    }

    pub fn at(mut self, file_name: impl Into<String>, line: u32) -> Self {
        self.file_name = Some(file_name.into());
        self.line = line;
        self
    }

    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        put_str(buf, &self.class_name);
        put_str(buf, &self.method_name);
        put_str_opt(buf, self.file_name.as_deref());
        buf.put_u32(self.line);
    }

    pub fn decode<B: Buf>(buf: &mut B) -> Result<Self> {
        let class_name = get_str(buf)?;
        let method_name = get_str(buf)?;
        let file_name = get_str_opt(buf)?;
        if buf.remaining() < 4 {
            return Err(WireError::Eof);
        }
        let line = buf.get_u32();
        Ok(Self {
            class_name,
            method_name,
            file_name,
            line,
        })
    }
}

impl fmt::Display for StackFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.file_name {
            Some(file) => write!(
                f,
                "{}::{} ({}:{})",
                self.class_name, self.method_name, file, self.line
            ),
            None => write!(f, "{}::{}", self.class_name, self.method_name),
        }
    }
}

/// Cause chains deeper than this are rejected on decode.
const MAX_CAUSE_DEPTH: usize = 32;

/// A portable throwable: class name, message, stack frames and cause chain.
///
/// This is the terminal object of a `NOT_OK` reply and the surrogate the
/// reader falls back to when the terminal object fails to decode.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ThrowableStub {
    pub class_name: String,
    pub message: Option<String>,
    pub frames: Vec<StackFrame>,
    pub cause: Option<Box<ThrowableStub>>,
}

impl ThrowableStub {
    pub fn new(class_name: impl Into<String>, message: Option<String>) -> Self {
        Self {
            class_name: class_name.into(),
            message,
            frames: Vec::new(),
            cause: None,
        }
    }

    pub fn with_frame(mut self, frame: StackFrame) -> Self {
        self.frames.push(frame);
        self
    }

    pub fn caused_by(mut self, cause: ThrowableStub) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    /// The cause chain ordered root first, terminating with `self`.
    pub fn chain_root_first(&self) -> Vec<&ThrowableStub> {
        let mut chain = Vec::new();
        let mut cur = self;
        loop {
            chain.push(cur);
            match &cur.cause {
                Some(next) => cur = next,
                None => break,
            }
        }
        chain.reverse();
        chain
    }

    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        put_str(buf, &self.class_name);
        put_str_opt(buf, self.message.as_deref());
        put_var_uint(buf, self.frames.len() as u32);
        for frame in &self.frames {
            frame.encode(buf);
        }
        match &self.cause {
            None => buf.put_u8(0),
            Some(cause) => {
                buf.put_u8(1);
                cause.encode(buf);
            }
        }
    }

    pub fn decode<B: Buf>(buf: &mut B) -> Result<Self> {
        Self::decode_at_depth(buf, 0)
    }

    fn decode_at_depth<B: Buf>(buf: &mut B, depth: usize) -> Result<Self> {
        if depth > MAX_CAUSE_DEPTH {
            return Err(WireError::Corrupted("throwable cause chain too deep".into()));
        }
        let class_name = get_str(buf)?;
        let message = get_str_opt(buf)?;
        let frame_count = get_var_uint(buf)? as usize;
        let mut frames = Vec::new();
        for _ in 0..frame_count {
            frames.push(StackFrame::decode(buf)?);
        }
        let cause = if buf.remaining() < 1 {
            return Err(WireError::Eof);
        } else {
            match buf.get_u8() {
                0 => None,
                1 => Some(Box::new(Self::decode_at_depth(buf, depth + 1)?)),
                other => {
                    return Err(WireError::Corrupted(format!(
                        "bad throwable cause flag {other:#04x}"
                    )))
                }
            }
        };
        Ok(Self {
            class_name,
            message,
            frames,
            cause,
        })
    }
}

impl fmt::Display for ThrowableStub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.message {
            Some(msg) => write!(f, "{}: {}", self.class_name, msg),
            None => write!(f, "{}", self.class_name),
        }
    }
}

impl std::error::Error for ThrowableStub {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause
            .as_deref()
            .map(|c| c as &(dyn std::error::Error + 'static))
    }
}

// Tags for the basic codec's self-describing encoding.
const T_UNIT: u8 = 1;
const T_BOOL: u8 = 2;
const T_INT: u8 = 3;
const T_LONG: u8 = 4;
const T_FLOAT: u8 = 5;
const T_DOUBLE: u8 = 6;
const T_STRING: u8 = 7;
const T_BYTES: u8 = 8;
const T_STRING_LIST: u8 = 9;
const T_FRAMES: u8 = 10;
const T_THROWABLE: u8 = 11;

/// The built-in self-describing object codec.
#[derive(Debug, Default, Clone, Copy)]
pub struct BasicCodec;

impl ObjectCodec for BasicCodec {
    fn encode(&self, obj: &Arc<dyn CodecObject>, buf: &mut BytesMut) -> Result<()> {
        let any = obj.as_any();
        if any.downcast_ref::<()>().is_some() {
            buf.put_u8(T_UNIT);
        } else if let Some(v) = any.downcast_ref::<bool>() {
            buf.put_u8(T_BOOL);
            buf.put_u8(u8::from(*v));
        } else if let Some(v) = any.downcast_ref::<i32>() {
            buf.put_u8(T_INT);
            buf.put_i32(*v);
        } else if let Some(v) = any.downcast_ref::<i64>() {
            buf.put_u8(T_LONG);
            buf.put_i64(*v);
        } else if let Some(v) = any.downcast_ref::<f32>() {
            buf.put_u8(T_FLOAT);
            buf.put_f32(*v);
        } else if let Some(v) = any.downcast_ref::<f64>() {
            buf.put_u8(T_DOUBLE);
            buf.put_f64(*v);
        } else if let Some(v) = any.downcast_ref::<String>() {
            buf.put_u8(T_STRING);
            put_str(buf, v);
        } else if let Some(v) = any.downcast_ref::<Vec<u8>>() {
            buf.put_u8(T_BYTES);
            put_var_uint(buf, v.len() as u32);
            buf.put_slice(v);
        } else if let Some(v) = any.downcast_ref::<Vec<String>>() {
            buf.put_u8(T_STRING_LIST);
            put_var_uint(buf, v.len() as u32);
            for s in v {
                put_str(buf, s);
            }
        } else if let Some(v) = any.downcast_ref::<Vec<StackFrame>>() {
            buf.put_u8(T_FRAMES);
            put_var_uint(buf, v.len() as u32);
            for frame in v {
                frame.encode(buf);
            }
        } else if let Some(v) = any.downcast_ref::<ThrowableStub>() {
            buf.put_u8(T_THROWABLE);
            v.encode(buf);
        } else {
            return Err(WireError::NotSerializable(format!("{obj:?}")));
        }
        Ok(())
    }

    fn decode(&self, buf: &mut Bytes) -> Result<Arc<dyn CodecObject>> {
        if buf.remaining() < 1 {
            return Err(WireError::Eof);
        }
        let tag = buf.get_u8();
        Ok(match tag {
            T_UNIT => Arc::new(()),
            T_BOOL => {
                if buf.remaining() < 1 {
                    return Err(WireError::Eof);
                }
                Arc::new(buf.get_u8() != 0)
            }
            T_INT => {
                if buf.remaining() < 4 {
                    return Err(WireError::Eof);
                }
                Arc::new(buf.get_i32())
            }
            T_LONG => {
                if buf.remaining() < 8 {
                    return Err(WireError::Eof);
                }
                Arc::new(buf.get_i64())
            }
            T_FLOAT => {
                if buf.remaining() < 4 {
                    return Err(WireError::Eof);
                }
                Arc::new(buf.get_f32())
            }
            T_DOUBLE => {
                if buf.remaining() < 8 {
                    return Err(WireError::Eof);
                }
                Arc::new(buf.get_f64())
            }
            T_STRING => Arc::new(get_str(buf)?),
            T_BYTES => {
                let len = get_var_uint(buf)? as usize;
                if buf.remaining() < len {
                    return Err(WireError::Eof);
                }
                let mut bytes = vec![0u8; len];
                buf.copy_to_slice(&mut bytes);
                Arc::new(bytes)
            }
            T_STRING_LIST => {
                let count = get_var_uint(buf)? as usize;
                let mut list = Vec::new();
                for _ in 0..count {
                    list.push(get_str(buf)?);
                }
                Arc::new(list)
            }
            T_FRAMES => {
                let count = get_var_uint(buf)? as usize;
                let mut frames = Vec::new();
                for _ in 0..count {
                    frames.push(StackFrame::decode(buf)?);
                }
                Arc::new(frames)
            }
            T_THROWABLE => Arc::new(ThrowableStub::decode(buf)?),
            other => {
                return Err(WireError::Corrupted(format!(
                    "unknown basic codec tag {other:#04x}"
                )))
            }
        })
    }
}
