//! Dynamic parameter and return values
//!
//! Marshalling is driven by the declared [`ParamKind`](crate::info::ParamKind)
//! of each parameter; a [`Value`] is the runtime carrier that dispatch tables
//! and stubs exchange. `Null` stands in for null strings, null boxed
//! primitives, null objects and null remote references alike.

use crate::dispatch::{RemoteObject, SkeletonFactory, Stub};
use crate::error::{Result, SessionError};
use remi_wire::CodecObject;
use std::fmt;
use std::sync::Arc;

/// A marshalled parameter or return value.
#[derive(Clone, Debug)]
pub enum Value {
    Null,
    Boolean(bool),
    Byte(i8),
    Char(char),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Str(String),
    /// User object marshalled through the session's object codec.
    Object(Arc<dyn CodecObject>),
    /// Reference to a remote object.
    Remote(RemoteRef),
}

impl Value {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Boolean(_) => "boolean",
            Value::Byte(_) => "byte",
            Value::Char(_) => "char",
            Value::Int(_) => "int",
            Value::Long(_) => "long",
            Value::Float(_) => "float",
            Value::Double(_) => "double",
            Value::Str(_) => "string",
            Value::Object(_) => "object",
            Value::Remote(_) => "remote",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    fn mismatch(&self, expected: &str) -> SessionError {
        SessionError::Corrupted(format!(
            "expected {expected} value, got {}",
            self.kind_name()
        ))
    }

    pub fn as_boolean(&self) -> Result<bool> {
        match self {
            Value::Boolean(v) => Ok(*v),
            other => Err(other.mismatch("boolean")),
        }
    }

    pub fn as_int(&self) -> Result<i32> {
        match self {
            Value::Int(v) => Ok(*v),
            other => Err(other.mismatch("int")),
        }
    }

    pub fn as_long(&self) -> Result<i64> {
        match self {
            Value::Long(v) => Ok(*v),
            other => Err(other.mismatch("long")),
        }
    }

    pub fn as_double(&self) -> Result<f64> {
        match self {
            Value::Double(v) => Ok(*v),
            other => Err(other.mismatch("double")),
        }
    }

    pub fn into_str(self) -> Result<String> {
        match self {
            Value::Str(s) => Ok(s),
            other => Err(other.mismatch("string")),
        }
    }

    pub fn into_opt_str(self) -> Result<Option<String>> {
        match self {
            Value::Null => Ok(None),
            Value::Str(s) => Ok(Some(s)),
            other => Err(other.mismatch("string")),
        }
    }

    pub fn into_object(self) -> Result<Arc<dyn CodecObject>> {
        match self {
            Value::Object(o) => Ok(o),
            other => Err(other.mismatch("object")),
        }
    }

    pub fn into_remote(self) -> Result<RemoteRef> {
        match self {
            Value::Remote(r) => Ok(r),
            other => Err(other.mismatch("remote")),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Boolean(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Long(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Double(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

/// A remote reference travelling through an invocation: either a stub for a
/// peer-side object, or a local object to be exported on marshalling.
#[derive(Clone)]
pub enum RemoteRef {
    /// A proxy for an object exported by the peer.
    Stub(Arc<Stub>),
    /// A local object; exporting happens when the reference is marshalled.
    Local {
        object: Arc<dyn RemoteObject>,
        factory: Arc<SkeletonFactory>,
    },
}

impl RemoteRef {
    pub fn local(object: Arc<dyn RemoteObject>, factory: Arc<SkeletonFactory>) -> Self {
        RemoteRef::Local { object, factory }
    }

    pub fn as_stub(&self) -> Option<&Arc<Stub>> {
        match self {
            RemoteRef::Stub(stub) => Some(stub),
            RemoteRef::Local { .. } => None,
        }
    }

    pub fn into_stub(self) -> Result<Arc<Stub>> {
        match self {
            RemoteRef::Stub(stub) => Ok(stub),
            RemoteRef::Local { factory, .. } => Err(SessionError::Corrupted(format!(
                "expected an imported reference, got local {}",
                factory.info().name
            ))),
        }
    }
}

impl fmt::Debug for RemoteRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RemoteRef::Stub(stub) => write!(f, "RemoteRef::Stub({})", stub.id()),
            RemoteRef::Local { factory, .. } => {
                write!(f, "RemoteRef::Local({})", factory.info().name)
            }
        }
    }
}
