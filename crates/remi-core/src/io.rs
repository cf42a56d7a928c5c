//! Invocation input and output streams
//!
//! An [`InvocationOutput`] buffers one message (a request or a reply) and
//! frames it onto the channel on `flush`. An [`InvocationInput`] refills
//! from inbound frames and decodes values incrementally; every read that
//! hits end-of-stream mid-value fails with `Eof`.
//!
//! Shared-object writes preserve object identity for the duration of one
//! message: the first write of an `Arc` goes inline, repeats become
//! back-references. Unshared writes bypass the scope entirely.

use crate::channel::ChannelCtx;
use crate::error::{Result, SessionError};
use crate::failure::{surrogate_from_triples, ThrowableInfo};
use crate::ident::Identifier;
use crate::info::{ParamKind, RemoteInfo, RemoteParameter};
use crate::mux::{MuxReader, MuxWriter};
use crate::value::{RemoteRef, Value};
use bytes::{Buf, BufMut, BytesMut};
use remi_wire::codec::object_identity;
use remi_wire::primitives as prim;
use remi_wire::strings;
use remi_wire::varint::{get_var_uint, put_var_uint};
use remi_wire::{CodecObject, StackFrame, ThrowableStub, NOT_OK, NULL, OK_FALSE, OK_TRUE};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

// Object write tags.
const OBJ_NULL: u8 = 0;
const OBJ_REF: u8 = 1;
const OBJ_INLINE: u8 = 2;

/// Upper bound for a single codec object payload.
const MAX_OBJECT_PAYLOAD: usize = 16 * 1024 * 1024;

/// Upper bound for a throwable cause chain on the wire.
const MAX_CHAIN_LENGTH: usize = 64;

/// Reply status as observed by `read_ok`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyStatus {
    /// `OK_FALSE` or `OK_TRUE`; the boolean doubles as a boolean return.
    Ok(bool),
    /// `NOT_OK`; a serialized throwable chain follows.
    NotOk,
}

pub(crate) fn encode_timeout(timeout: Option<std::time::Duration>) -> u64 {
    match timeout {
        None => u64::MAX,
        Some(d) => u64::try_from(d.as_nanos()).unwrap_or(u64::MAX - 1),
    }
}

pub(crate) fn decode_timeout(nanos: u64) -> Option<std::time::Duration> {
    if nanos == u64::MAX {
        None
    } else {
        Some(std::time::Duration::from_nanos(nanos))
    }
}

fn load_timeout(cell: &AtomicU64) -> Option<std::time::Duration> {
    decode_timeout(cell.load(Ordering::SeqCst))
}

/// Reading side of an invocation channel.
pub struct InvocationInput {
    reader: MuxReader,
    buf: BytesMut,
    scope: Vec<Arc<dyn CodecObject>>,
    ctx: ChannelCtx,
    read_timeout: Arc<AtomicU64>,
}

impl InvocationInput {
    pub(crate) fn new(reader: MuxReader, ctx: ChannelCtx, read_timeout: Arc<AtomicU64>) -> Self {
        Self {
            reader,
            buf: BytesMut::with_capacity(512),
            scope: Vec::new(),
            ctx,
            read_timeout,
        }
    }

    pub(crate) fn begin_message(&mut self) {
        self.scope.clear();
    }

    #[cfg(test)]
    pub(crate) fn buffered_len(&self) -> usize {
        self.buf.len()
    }

    /// Pull one more inbound chunk into the buffer.
    async fn fill_more(&mut self) -> Result<()> {
        let chunk = match load_timeout(&self.read_timeout) {
            None => self.reader.recv().await,
            Some(d) => tokio::time::timeout(d, self.reader.recv())
                .await
                .map_err(|_| SessionError::Timeout)?,
        };
        match chunk {
            Some(bytes) => {
                self.buf.extend_from_slice(&bytes);
                Ok(())
            }
            None => Err(SessionError::Eof),
        }
    }

    /// Ensure at least `n` buffered bytes.
    async fn fill(&mut self, n: usize) -> Result<()> {
        while self.buf.len() < n {
            self.fill_more().await?;
        }
        Ok(())
    }

    /// Decode one value, refilling on underrun. The decoder must consume
    /// nothing when it fails with `Eof`; it is retried against a longer
    /// prefix until it succeeds or the stream truly ends.
    async fn read_decoded<T, F>(&mut self, decode: F) -> Result<T>
    where
        F: Fn(&mut &[u8]) -> Result<T>,
    {
        loop {
            {
                let mut slice: &[u8] = self.buf.as_ref();
                let before = slice.len();
                match decode(&mut slice) {
                    Ok(value) => {
                        let used = before - slice.len();
                        self.buf.advance(used);
                        return Ok(value);
                    }
                    Err(SessionError::Eof) => {}
                    Err(e) => return Err(e),
                }
            }
            self.fill_more().await?;
        }
    }

    pub async fn read_boolean(&mut self) -> Result<bool> {
        self.fill(1).await?;
        Ok(self.buf.get_u8() != 0)
    }

    pub async fn read_byte(&mut self) -> Result<i8> {
        self.fill(1).await?;
        Ok(self.buf.get_i8())
    }

    pub async fn read_char(&mut self) -> Result<char> {
        self.fill(2).await?;
        let unit = self.buf.get_u16();
        char::from_u32(u32::from(unit)).ok_or_else(|| {
            SessionError::Corrupted(format!("char value {unit:#06x} is an unpaired surrogate"))
        })
    }

    pub async fn read_int(&mut self) -> Result<i32> {
        self.fill(4).await?;
        Ok(self.buf.get_i32())
    }

    pub async fn read_long(&mut self) -> Result<i64> {
        self.fill(8).await?;
        Ok(self.buf.get_i64())
    }

    pub async fn read_float(&mut self) -> Result<f32> {
        self.fill(4).await?;
        Ok(self.buf.get_f32())
    }

    pub async fn read_double(&mut self) -> Result<f64> {
        self.fill(8).await?;
        Ok(self.buf.get_f64())
    }

    pub async fn read_boolean_obj(&mut self) -> Result<Option<bool>> {
        self.read_decoded(|b| prim::get_bool_obj(b).map_err(SessionError::from))
            .await
    }

    pub async fn read_byte_obj(&mut self) -> Result<Option<i8>> {
        self.read_decoded(|b| prim::get_byte_obj(b).map_err(SessionError::from))
            .await
    }

    pub async fn read_char_obj(&mut self) -> Result<Option<char>> {
        let unit = self
            .read_decoded(|b| prim::get_char_obj(b).map_err(SessionError::from))
            .await?;
        unit.map(|u| {
            char::from_u32(u32::from(u)).ok_or_else(|| {
                SessionError::Corrupted(format!("char value {u:#06x} is an unpaired surrogate"))
            })
        })
        .transpose()
    }

    pub async fn read_int_obj(&mut self) -> Result<Option<i32>> {
        self.read_decoded(|b| prim::get_int_obj(b).map_err(SessionError::from))
            .await
    }

    pub async fn read_long_obj(&mut self) -> Result<Option<i64>> {
        self.read_decoded(|b| prim::get_long_obj(b).map_err(SessionError::from))
            .await
    }

    pub async fn read_float_obj(&mut self) -> Result<Option<f32>> {
        self.read_decoded(|b| prim::get_float_obj(b).map_err(SessionError::from))
            .await
    }

    pub async fn read_double_obj(&mut self) -> Result<Option<f64>> {
        self.read_decoded(|b| prim::get_double_obj(b).map_err(SessionError::from))
            .await
    }

    pub async fn read_var_uint(&mut self) -> Result<u32> {
        self.read_decoded(|b| get_var_uint(b).map_err(SessionError::from))
            .await
    }

    /// Read a nullable compact string.
    pub async fn read_str(&mut self) -> Result<Option<String>> {
        self.read_decoded(|b| strings::get_str_opt(b).map_err(SessionError::from))
            .await
    }

    /// Identical encoding to [`read_str`]; unshared strings simply never
    /// participate in the sharing scope.
    pub async fn read_unshared_str(&mut self) -> Result<Option<String>> {
        self.read_str().await
    }

    /// Read a modified-UTF-8 string.
    pub async fn read_utf(&mut self) -> Result<String> {
        self.read_decoded(|b| strings::get_utf(b).map_err(SessionError::from))
            .await
    }

    pub(crate) async fn read_identifier(&mut self) -> Result<Identifier> {
        self.fill(Identifier::SIZE).await?;
        Identifier::decode(&mut self.buf)
    }

    pub(crate) async fn read_version(&mut self) -> Result<u32> {
        self.fill(4).await?;
        Ok(self.buf.get_u32())
    }

    /// Read an object written with identity preservation.
    pub async fn read_shared_obj(&mut self) -> Result<Option<Arc<dyn CodecObject>>> {
        self.read_object(true).await
    }

    /// Read an object written outside the sharing scope.
    pub async fn read_unshared_obj(&mut self) -> Result<Option<Arc<dyn CodecObject>>> {
        self.read_object(false).await
    }

    async fn read_object(&mut self, shared: bool) -> Result<Option<Arc<dyn CodecObject>>> {
        self.fill(1).await?;
        let tag = self.buf.get_u8();
        match tag {
            OBJ_NULL => Ok(None),
            OBJ_REF => {
                let handle = self.read_var_uint().await? as usize;
                self.scope.get(handle).cloned().map(Some).ok_or_else(|| {
                    SessionError::Corrupted(format!("dangling object back-reference {handle}"))
                })
            }
            OBJ_INLINE => {
                let len = self.read_var_uint().await? as usize;
                if len > MAX_OBJECT_PAYLOAD {
                    return Err(SessionError::Corrupted(format!(
                        "object payload of {len} bytes exceeds maximum"
                    )));
                }
                self.fill(len).await?;
                let mut payload = self.buf.split_to(len).freeze();
                let obj = self.ctx.codec.decode(&mut payload)?;
                if payload.has_remaining() {
                    return Err(SessionError::Corrupted(
                        "codec under-consumed an object payload".into(),
                    ));
                }
                if shared {
                    self.scope.push(Arc::clone(&obj));
                }
                Ok(Some(obj))
            }
            other => Err(SessionError::Corrupted(format!(
                "bad object tag {other:#04x}"
            ))),
        }
    }

    /// Read the reply status byte.
    pub async fn read_ok(&mut self) -> Result<ReplyStatus> {
        self.fill(1).await?;
        match self.buf.get_u8() {
            OK_FALSE => Ok(ReplyStatus::Ok(false)),
            OK_TRUE => Ok(ReplyStatus::Ok(true)),
            NOT_OK => Ok(ReplyStatus::NotOk),
            other => Err(SessionError::Corrupted(format!(
                "bad reply status byte {other:#04x}"
            ))),
        }
    }

    /// Read the serialized throwable chain following a `NOT_OK` status.
    /// Falls back to a surrogate chain when the terminal object cannot be
    /// decoded, so the result is never empty.
    pub async fn read_throwable(&mut self) -> Result<ThrowableStub> {
        let chain_len = self.read_var_uint().await? as usize;
        if chain_len > MAX_CHAIN_LENGTH {
            return Err(SessionError::Corrupted(format!(
                "throwable chain of length {chain_len} exceeds maximum"
            )));
        }
        let mut triples = Vec::new();
        for _ in 0..chain_len {
            let class_name = match self.read_shared_obj().await? {
                Some(obj) => obj
                    .as_any()
                    .downcast_ref::<String>()
                    .cloned()
                    .unwrap_or_else(|| "<unknown>".to_string()),
                None => "<unknown>".to_string(),
            };
            let message = self
                .read_shared_obj()
                .await?
                .and_then(|obj| obj.as_any().downcast_ref::<String>().cloned());
            let frames = self
                .read_shared_obj()
                .await?
                .and_then(|obj| obj.as_any().downcast_ref::<Vec<StackFrame>>().cloned())
                .unwrap_or_default();
            triples.push(ThrowableInfo {
                class_name,
                message,
                frames,
            });
        }

        // Terminal throwable: prefer it, fall back to the triples.
        match self.read_shared_obj().await {
            Ok(Some(obj)) => match obj.as_any().downcast_ref::<ThrowableStub>() {
                Some(stub) => Ok(stub.clone()),
                None => Ok(surrogate_from_triples(triples)),
            },
            Ok(None) => Ok(surrogate_from_triples(triples)),
            Err(e @ (SessionError::Eof | SessionError::Timeout)) => Err(e),
            Err(_) => Ok(surrogate_from_triples(triples)),
        }
    }

    /// Read an optional remote reference, importing a stub as needed.
    pub async fn read_remote(&mut self) -> Result<Option<RemoteRef>> {
        self.fill(1).await?;
        match self.buf.get_u8() {
            NULL => Ok(None),
            OK_TRUE => {
                self.fill(2 * (Identifier::SIZE + 4)).await?;
                let obj_id = Identifier::decode(&mut self.buf)?;
                let obj_version = self.buf.get_u32();
                let type_id = Identifier::decode(&mut self.buf)?;
                let type_version = self.buf.get_u32();
                self.fill(1).await?;
                let info = match self.buf.get_u8() {
                    NULL => None,
                    OK_TRUE => Some(self.read_decoded(|b| RemoteInfo::decode(b)).await?),
                    other => {
                        return Err(SessionError::Corrupted(format!(
                            "bad remote info flag {other:#04x}"
                        )))
                    }
                };
                let core = self
                    .ctx
                    .core
                    .upgrade()
                    .ok_or(SessionError::BrokerClosed)?;
                let rref = core
                    .import_remote(obj_id, obj_version, type_id, type_version, info)
                    .await?;
                Ok(Some(rref))
            }
            other => Err(SessionError::Corrupted(format!(
                "bad remote reference flag {other:#04x}"
            ))),
        }
    }

    /// Read one parameter by its declared kind.
    pub async fn read_param(&mut self, param: &RemoteParameter) -> Result<Value> {
        Ok(match param.kind {
            ParamKind::Boolean => Value::Boolean(self.read_boolean().await?),
            ParamKind::Byte => Value::Byte(self.read_byte().await?),
            ParamKind::Char => Value::Char(self.read_char().await?),
            ParamKind::Int => Value::Int(self.read_int().await?),
            ParamKind::Long => Value::Long(self.read_long().await?),
            ParamKind::Float => Value::Float(self.read_float().await?),
            ParamKind::Double => Value::Double(self.read_double().await?),
            ParamKind::BooleanObj => opt(self.read_boolean_obj().await?.map(Value::Boolean)),
            ParamKind::ByteObj => opt(self.read_byte_obj().await?.map(Value::Byte)),
            ParamKind::CharObj => opt(self.read_char_obj().await?.map(Value::Char)),
            ParamKind::IntObj => opt(self.read_int_obj().await?.map(Value::Int)),
            ParamKind::LongObj => opt(self.read_long_obj().await?.map(Value::Long)),
            ParamKind::FloatObj => opt(self.read_float_obj().await?.map(Value::Float)),
            ParamKind::DoubleObj => opt(self.read_double_obj().await?.map(Value::Double)),
            ParamKind::Str => {
                let value = if param.unshared {
                    self.read_unshared_str().await?
                } else {
                    self.read_str().await?
                };
                opt(value.map(Value::Str))
            }
            ParamKind::Object => {
                let value = self.read_object(!param.unshared).await?;
                opt(value.map(Value::Object))
            }
            ParamKind::Remote => opt(self.read_remote().await?.map(Value::Remote)),
        })
    }
}

fn opt(value: Option<Value>) -> Value {
    value.unwrap_or(Value::Null)
}

/// Writing side of an invocation channel.
pub struct InvocationOutput {
    writer: MuxWriter,
    buf: BytesMut,
    scope: HashMap<usize, u32>,
    ctx: ChannelCtx,
    write_timeout: Arc<AtomicU64>,
    sent_any: bool,
}

impl InvocationOutput {
    pub(crate) fn new(writer: MuxWriter, ctx: ChannelCtx, write_timeout: Arc<AtomicU64>) -> Self {
        Self {
            writer,
            buf: BytesMut::with_capacity(512),
            scope: HashMap::new(),
            ctx,
            write_timeout,
            sent_any: false,
        }
    }

    pub(crate) fn begin_message(&mut self) {
        self.scope.clear();
        self.sent_any = false;
    }

    /// Discard everything buffered for the current message. Only valid
    /// before any byte of it was flushed.
    pub(crate) fn abandon_message(&mut self) {
        self.buf.clear();
        self.scope.clear();
    }

    /// Whether any byte of the current message reached the channel.
    pub(crate) fn has_sent(&self) -> bool {
        self.sent_any
    }

    pub(crate) fn close(&mut self) {
        self.writer.close();
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.writer.is_closed()
    }

    pub fn write_boolean(&mut self, v: bool) {
        self.buf.put_u8(u8::from(v));
    }

    pub fn write_byte(&mut self, v: i8) {
        self.buf.put_i8(v);
    }

    pub fn write_char(&mut self, v: char) -> Result<()> {
        let cp = v as u32;
        if cp > 0xffff {
            return Err(SessionError::NotSerializable(format!(
                "char {v:?} is outside the basic multilingual plane"
            )));
        }
        self.buf.put_u16(cp as u16);
        Ok(())
    }

    pub fn write_int(&mut self, v: i32) {
        self.buf.put_i32(v);
    }

    pub fn write_long(&mut self, v: i64) {
        self.buf.put_i64(v);
    }

    pub fn write_float(&mut self, v: f32) {
        self.buf.put_f32(v);
    }

    pub fn write_double(&mut self, v: f64) {
        self.buf.put_f64(v);
    }

    pub fn write_boolean_obj(&mut self, v: Option<bool>) {
        prim::put_bool_obj(&mut self.buf, v);
    }

    pub fn write_byte_obj(&mut self, v: Option<i8>) {
        prim::put_byte_obj(&mut self.buf, v);
    }

    pub fn write_char_obj(&mut self, v: Option<char>) -> Result<()> {
        match v {
            None => prim::put_char_obj(&mut self.buf, None),
            Some(c) => {
                let cp = c as u32;
                if cp > 0xffff {
                    return Err(SessionError::NotSerializable(format!(
                        "char {c:?} is outside the basic multilingual plane"
                    )));
                }
                prim::put_char_obj(&mut self.buf, Some(cp as u16));
            }
        }
        Ok(())
    }

    pub fn write_int_obj(&mut self, v: Option<i32>) {
        prim::put_int_obj(&mut self.buf, v);
    }

    pub fn write_long_obj(&mut self, v: Option<i64>) {
        prim::put_long_obj(&mut self.buf, v);
    }

    pub fn write_float_obj(&mut self, v: Option<f32>) {
        prim::put_float_obj(&mut self.buf, v);
    }

    pub fn write_double_obj(&mut self, v: Option<f64>) {
        prim::put_double_obj(&mut self.buf, v);
    }

    pub fn write_var_uint(&mut self, v: u32) {
        put_var_uint(&mut self.buf, v);
    }

    /// Write a nullable compact string.
    pub fn write_str(&mut self, s: Option<&str>) {
        strings::put_str_opt(&mut self.buf, s);
    }

    /// Identical encoding to [`write_str`]; unshared strings simply never
    /// participate in the sharing scope.
    pub fn write_unshared_str(&mut self, s: Option<&str>) {
        self.write_str(s);
    }

    /// Write a modified-UTF-8 string.
    pub fn write_utf(&mut self, s: &str) {
        strings::put_utf(&mut self.buf, s);
    }

    pub(crate) fn write_identifier(&mut self, id: Identifier) {
        id.encode(&mut self.buf);
    }

    pub(crate) fn write_version(&mut self, version: u32) {
        self.buf.put_u32(version);
    }

    /// Write an object with identity preservation within this message.
    pub fn write_shared_obj(&mut self, obj: Option<&Arc<dyn CodecObject>>) -> Result<()> {
        self.write_object(obj, true)
    }

    /// Write an object outside the sharing scope.
    pub fn write_unshared_obj(&mut self, obj: Option<&Arc<dyn CodecObject>>) -> Result<()> {
        self.write_object(obj, false)
    }

    fn write_object(&mut self, obj: Option<&Arc<dyn CodecObject>>, shared: bool) -> Result<()> {
        let Some(obj) = obj else {
            self.buf.put_u8(OBJ_NULL);
            return Ok(());
        };
        let identity = object_identity(obj);
        if shared {
            if let Some(&handle) = self.scope.get(&identity) {
                self.buf.put_u8(OBJ_REF);
                put_var_uint(&mut self.buf, handle);
                return Ok(());
            }
        }
        let mut payload = BytesMut::new();
        self.ctx.codec.encode(obj, &mut payload)?;
        self.buf.put_u8(OBJ_INLINE);
        put_var_uint(&mut self.buf, payload.len() as u32);
        self.buf.extend_from_slice(&payload);
        if shared {
            let handle = self.scope.len() as u32;
            self.scope.insert(identity, handle);
        }
        Ok(())
    }

    /// Write the completion marker for a normal reply.
    pub fn write_ok(&mut self, v: bool) {
        self.buf.put_u8(if v { OK_TRUE } else { OK_FALSE });
    }

    /// Write a `NOT_OK` reply: the cause chain root first, then the
    /// throwable itself through the object codec.
    pub fn write_throwable(&mut self, throwable: &ThrowableStub) -> Result<()> {
        self.buf.put_u8(NOT_OK);
        let chain = throwable.chain_root_first();
        put_var_uint(&mut self.buf, chain.len() as u32);
        for item in &chain {
            let class: Arc<dyn CodecObject> = Arc::new(item.class_name.clone());
            self.write_object(Some(&class), true)?;
            match &item.message {
                Some(message) => {
                    let message: Arc<dyn CodecObject> = Arc::new(message.clone());
                    self.write_object(Some(&message), true)?;
                }
                None => self.write_object(None, true)?,
            }
            let frames: Arc<dyn CodecObject> = Arc::new(item.frames.clone());
            self.write_object(Some(&frames), true)?;
        }
        let terminal: Arc<dyn CodecObject> = Arc::new(throwable.clone());
        self.write_object(Some(&terminal), true)
    }

    /// Write an optional remote reference, exporting the object as needed.
    pub fn write_remote(&mut self, rref: Option<&RemoteRef>) -> Result<()> {
        let Some(rref) = rref else {
            self.buf.put_u8(NULL);
            return Ok(());
        };
        let core = self
            .ctx
            .core
            .upgrade()
            .ok_or(SessionError::BrokerClosed)?;
        let marshalled = core.marshal_remote(rref)?;
        self.buf.put_u8(OK_TRUE);
        marshalled.obj_id.encode(&mut self.buf);
        self.buf.put_u32(marshalled.obj_version);
        marshalled.type_id.encode(&mut self.buf);
        self.buf.put_u32(marshalled.type_version);
        match &marshalled.info {
            Some(info) => {
                self.buf.put_u8(OK_TRUE);
                info.encode(&mut self.buf);
            }
            None => self.buf.put_u8(NULL),
        }
        Ok(())
    }

    /// Write one parameter by its declared kind.
    pub fn write_param(&mut self, param: &RemoteParameter, value: &Value) -> Result<()> {
        let mismatch = || {
            SessionError::NotSerializable(format!(
                "parameter of type {} expects {:?}",
                param.type_name, param.kind
            ))
        };
        match (param.kind, value) {
            (ParamKind::Boolean, Value::Boolean(v)) => self.write_boolean(*v),
            (ParamKind::Byte, Value::Byte(v)) => self.write_byte(*v),
            (ParamKind::Char, Value::Char(v)) => self.write_char(*v)?,
            (ParamKind::Int, Value::Int(v)) => self.write_int(*v),
            (ParamKind::Long, Value::Long(v)) => self.write_long(*v),
            (ParamKind::Float, Value::Float(v)) => self.write_float(*v),
            (ParamKind::Double, Value::Double(v)) => self.write_double(*v),
            (ParamKind::BooleanObj, Value::Boolean(v)) => self.write_boolean_obj(Some(*v)),
            (ParamKind::BooleanObj, Value::Null) => self.write_boolean_obj(None),
            (ParamKind::ByteObj, Value::Byte(v)) => self.write_byte_obj(Some(*v)),
            (ParamKind::ByteObj, Value::Null) => self.write_byte_obj(None),
            (ParamKind::CharObj, Value::Char(v)) => self.write_char_obj(Some(*v))?,
            (ParamKind::CharObj, Value::Null) => self.write_char_obj(None)?,
            (ParamKind::IntObj, Value::Int(v)) => self.write_int_obj(Some(*v)),
            (ParamKind::IntObj, Value::Null) => self.write_int_obj(None),
            (ParamKind::LongObj, Value::Long(v)) => self.write_long_obj(Some(*v)),
            (ParamKind::LongObj, Value::Null) => self.write_long_obj(None),
            (ParamKind::FloatObj, Value::Float(v)) => self.write_float_obj(Some(*v)),
            (ParamKind::FloatObj, Value::Null) => self.write_float_obj(None),
            (ParamKind::DoubleObj, Value::Double(v)) => self.write_double_obj(Some(*v)),
            (ParamKind::DoubleObj, Value::Null) => self.write_double_obj(None),
            (ParamKind::Str, Value::Str(s)) if param.unshared => {
                self.write_unshared_str(Some(s))
            }
            (ParamKind::Str, Value::Str(s)) => self.write_str(Some(s)),
            (ParamKind::Str, Value::Null) => self.write_str(None),
            (ParamKind::Object, Value::Object(o)) => {
                let o = Arc::clone(o);
                self.write_object(Some(&o), !param.unshared)?
            }
            (ParamKind::Object, Value::Null) => self.write_object(None, !param.unshared)?,
            (ParamKind::Remote, Value::Remote(r)) => self.write_remote(Some(r))?,
            (ParamKind::Remote, Value::Null) => self.write_remote(None)?,
            _ => return Err(mismatch()),
        }
        Ok(())
    }

    /// Frame the buffered message onto the channel.
    pub async fn flush(&mut self) -> Result<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        let payload = self.buf.split().freeze();
        match load_timeout(&self.write_timeout) {
            None => self.writer.send_data(payload).await?,
            Some(d) => tokio::time::timeout(d, self.writer.send_data(payload))
                .await
                .map_err(|_| SessionError::Timeout)??,
        }
        self.sent_any = true;
        Ok(())
    }
}
