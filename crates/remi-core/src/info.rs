//! Remote interface metadata
//!
//! A [`RemoteInfo`] describes one remote-capable interface: a stable type
//! identifier plus an ordered method list. It is transmitted to the peer the
//! first time a reference of its type crosses the session, so the importing
//! side builds its stubs from the exporter's metadata and both sides agree
//! on method identifiers and ordinals.

use crate::error::{Result, SessionError};
use crate::ident::Identifier;
use bytes::{Buf, BufMut};
use remi_wire::strings::{get_str, put_str};
use remi_wire::varint::{get_var_uint, put_var_uint};

/// Marshalling kind of one parameter or return value.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ParamKind {
    Boolean,
    Byte,
    Char,
    Int,
    Long,
    Float,
    Double,
    BooleanObj,
    ByteObj,
    CharObj,
    IntObj,
    LongObj,
    FloatObj,
    DoubleObj,
    /// Compact-encoded string, nullable.
    Str,
    /// User object marshalled through the session's object codec.
    Object,
    /// Reference to a remote object, marshalled by identity.
    Remote,
}

impl ParamKind {
    fn tag(self) -> u8 {
        match self {
            ParamKind::Boolean => 0,
            ParamKind::Byte => 1,
            ParamKind::Char => 2,
            ParamKind::Int => 3,
            ParamKind::Long => 4,
            ParamKind::Float => 5,
            ParamKind::Double => 6,
            ParamKind::BooleanObj => 7,
            ParamKind::ByteObj => 8,
            ParamKind::CharObj => 9,
            ParamKind::IntObj => 10,
            ParamKind::LongObj => 11,
            ParamKind::FloatObj => 12,
            ParamKind::DoubleObj => 13,
            ParamKind::Str => 14,
            ParamKind::Object => 15,
            ParamKind::Remote => 16,
        }
    }

    fn from_tag(tag: u8) -> Result<Self> {
        Ok(match tag {
            0 => ParamKind::Boolean,
            1 => ParamKind::Byte,
            2 => ParamKind::Char,
            3 => ParamKind::Int,
            4 => ParamKind::Long,
            5 => ParamKind::Float,
            6 => ParamKind::Double,
            7 => ParamKind::BooleanObj,
            8 => ParamKind::ByteObj,
            9 => ParamKind::CharObj,
            10 => ParamKind::IntObj,
            11 => ParamKind::LongObj,
            12 => ParamKind::FloatObj,
            13 => ParamKind::DoubleObj,
            14 => ParamKind::Str,
            15 => ParamKind::Object,
            16 => ParamKind::Remote,
            other => {
                return Err(SessionError::Corrupted(format!(
                    "unknown parameter kind tag {other}"
                )))
            }
        })
    }

    /// True for the primitive kinds that never carry a null flag.
    pub fn is_primitive(self) -> bool {
        matches!(
            self,
            ParamKind::Boolean
                | ParamKind::Byte
                | ParamKind::Char
                | ParamKind::Int
                | ParamKind::Long
                | ParamKind::Float
                | ParamKind::Double
        )
    }
}

/// Descriptor of one declared parameter or return value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemoteParameter {
    /// Declared type name, informational.
    pub type_name: String,
    pub kind: ParamKind,
    /// Forces single-use marshalling outside the reply's sharing scope.
    pub unshared: bool,
}

impl RemoteParameter {
    pub fn new(kind: ParamKind, type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            kind,
            unshared: false,
        }
    }

    pub fn unshared(mut self) -> Self {
        self.unshared = true;
        self
    }

    /// True when this parameter is marshalled as a remote reference.
    pub fn is_remote(&self) -> bool {
        self.kind == ParamKind::Remote
    }

    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u8(self.kind.tag());
        buf.put_u8(u8::from(self.unshared));
        put_str(buf, &self.type_name);
    }

    fn decode<B: Buf>(buf: &mut B) -> Result<Self> {
        if buf.remaining() < 2 {
            return Err(SessionError::Eof);
        }
        let kind = ParamKind::from_tag(buf.get_u8())?;
        let unshared = buf.get_u8() != 0;
        let type_name = get_str(buf)?;
        Ok(Self {
            type_name,
            kind,
            unshared,
        })
    }
}

const FLAG_ASYNCHRONOUS: u8 = 1 << 0;
const FLAG_PIPE: u8 = 1 << 1;
const FLAG_HAS_RETURN: u8 = 1 << 2;
const FLAG_FAILURE_DECLARED: u8 = 1 << 3;

/// One method of a remote interface.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemoteMethod {
    /// Session-stable method identifier, used as the wire ordinal.
    pub method_id: Identifier,
    pub name: String,
    /// Declared return value, or `None` for void.
    pub return_type: Option<RemoteParameter>,
    pub parameters: Vec<RemoteParameter>,
    /// Declared exception type names.
    pub exceptions: Vec<String>,
    /// Fire-and-forget: the callee sends no reply.
    pub asynchronous: bool,
    /// The channel is handed to the method body after dispatch.
    pub pipe: bool,
    /// Exception type used to surface connection-level failures.
    pub remote_failure: String,
    /// Whether `remote_failure` was declared explicitly on the method.
    pub remote_failure_declared: bool,
}

impl RemoteMethod {
    fn encode<B: BufMut>(&self, buf: &mut B) {
        self.method_id.encode(buf);
        put_str(buf, &self.name);
        let mut flags = 0u8;
        if self.asynchronous {
            flags |= FLAG_ASYNCHRONOUS;
        }
        if self.pipe {
            flags |= FLAG_PIPE;
        }
        if self.return_type.is_some() {
            flags |= FLAG_HAS_RETURN;
        }
        if self.remote_failure_declared {
            flags |= FLAG_FAILURE_DECLARED;
        }
        buf.put_u8(flags);
        if let Some(ret) = &self.return_type {
            ret.encode(buf);
        }
        put_var_uint(buf, self.parameters.len() as u32);
        for param in &self.parameters {
            param.encode(buf);
        }
        put_var_uint(buf, self.exceptions.len() as u32);
        for ex in &self.exceptions {
            put_str(buf, ex);
        }
        put_str(buf, &self.remote_failure);
    }

    fn decode<B: Buf>(buf: &mut B) -> Result<Self> {
        let method_id = Identifier::decode(buf)?;
        let name = get_str(buf)?;
        if buf.remaining() < 1 {
            return Err(SessionError::Eof);
        }
        let flags = buf.get_u8();
        let return_type = if flags & FLAG_HAS_RETURN != 0 {
            Some(RemoteParameter::decode(buf)?)
        } else {
            None
        };
        let param_count = get_var_uint(buf)? as usize;
        let mut parameters = Vec::new();
        for _ in 0..param_count {
            parameters.push(RemoteParameter::decode(buf)?);
        }
        let exception_count = get_var_uint(buf)? as usize;
        let mut exceptions = Vec::new();
        for _ in 0..exception_count {
            exceptions.push(get_str(buf)?);
        }
        let remote_failure = get_str(buf)?;
        Ok(Self {
            method_id,
            name,
            return_type,
            parameters,
            exceptions,
            asynchronous: flags & FLAG_ASYNCHRONOUS != 0,
            pipe: flags & FLAG_PIPE != 0,
            remote_failure,
            remote_failure_declared: flags & FLAG_FAILURE_DECLARED != 0,
        })
    }
}

/// Reflected metadata of one remote interface.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemoteInfo {
    /// Session-stable identifier of the interface type.
    pub type_id: Identifier,
    pub name: String,
    /// Methods in declaration order; the index is the method ordinal.
    pub methods: Vec<RemoteMethod>,
}

impl RemoteInfo {
    pub fn builder(name: impl Into<String>) -> RemoteInfoBuilder {
        RemoteInfoBuilder {
            type_id: None,
            name: name.into(),
            methods: Vec::new(),
        }
    }

    pub fn method(&self, ordinal: u16) -> Option<&RemoteMethod> {
        self.methods.get(usize::from(ordinal))
    }

    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        self.type_id.encode(buf);
        put_str(buf, &self.name);
        put_var_uint(buf, self.methods.len() as u32);
        for method in &self.methods {
            method.encode(buf);
        }
    }

    pub fn decode<B: Buf>(buf: &mut B) -> Result<Self> {
        let type_id = Identifier::decode(buf)?;
        let name = get_str(buf)?;
        let method_count = get_var_uint(buf)? as usize;
        let mut methods = Vec::new();
        for _ in 0..method_count {
            methods.push(RemoteMethod::decode(buf)?);
        }
        Ok(Self {
            type_id,
            name,
            methods,
        })
    }
}

/// Builder for a [`RemoteInfo`]. Method identifiers are minted from the
/// random source unless fixed explicitly (well-known protocol interfaces).
pub struct RemoteInfoBuilder {
    type_id: Option<Identifier>,
    name: String,
    methods: Vec<RemoteMethod>,
}

/// Default remote-failure exception name for methods that do not declare one.
pub const DEFAULT_REMOTE_FAILURE: &str = "remi::RemoteFailure";

impl RemoteInfoBuilder {
    pub(crate) fn type_id(mut self, id: Identifier) -> Self {
        self.type_id = Some(id);
        self
    }

    pub fn method(self, name: impl Into<String>) -> RemoteMethodBuilder {
        RemoteMethodBuilder {
            info: self,
            method: RemoteMethod {
                method_id: Identifier::generate(),
                name: name.into(),
                return_type: None,
                parameters: Vec::new(),
                exceptions: Vec::new(),
                asynchronous: false,
                pipe: false,
                remote_failure: DEFAULT_REMOTE_FAILURE.to_string(),
                remote_failure_declared: false,
            },
        }
    }

    pub fn build(self) -> RemoteInfo {
        RemoteInfo {
            type_id: self.type_id.unwrap_or_else(Identifier::generate),
            name: self.name,
            methods: self.methods,
        }
    }
}

/// Builder for one method of a [`RemoteInfoBuilder`].
pub struct RemoteMethodBuilder {
    info: RemoteInfoBuilder,
    method: RemoteMethod,
}

impl RemoteMethodBuilder {
    pub(crate) fn method_id(mut self, id: Identifier) -> Self {
        self.method.method_id = id;
        self
    }

    pub fn param(mut self, param: RemoteParameter) -> Self {
        self.method.parameters.push(param);
        self
    }

    pub fn returns(mut self, param: RemoteParameter) -> Self {
        self.method.return_type = Some(param);
        self
    }

    pub fn throws(mut self, exception: impl Into<String>) -> Self {
        self.method.exceptions.push(exception.into());
        self
    }

    pub fn asynchronous(mut self) -> Self {
        self.method.asynchronous = true;
        self
    }

    pub fn pipe(mut self) -> Self {
        self.method.pipe = true;
        self
    }

    pub fn remote_failure(mut self, exception: impl Into<String>) -> Self {
        self.method.remote_failure = exception.into();
        self.method.remote_failure_declared = true;
        self
    }

    pub fn done(mut self) -> RemoteInfoBuilder {
        self.info.methods.push(self.method);
        self.info
    }
}
