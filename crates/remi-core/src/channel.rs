//! Invocation channels
//!
//! An [`InvocationChannel`] is one framed, full-duplex byte pipe drawn from
//! the session's broker. It carries at most one invocation at a time; after
//! the reply has been fully consumed it is recycled into the broker's pool,
//! or discarded on any protocol violation or I/O failure.
//!
//! The unconnected placeholder is a variant of the channel type whose every
//! operation fails with `NotConnected`.

use crate::error::{Result, SessionError};
use crate::io::{decode_timeout, encode_timeout, InvocationInput, InvocationOutput};
use crate::mux::MuxChannel;
use crate::session::SessionCore;
use remi_wire::ObjectCodec;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::OwnedSemaphorePermit;

/// Per-channel handle to session services used while marshalling.
#[derive(Clone)]
pub(crate) struct ChannelCtx {
    pub core: Weak<SessionCore>,
    pub codec: Arc<dyn ObjectCodec>,
}

/// Defaults applied to every channel a broker creates.
#[derive(Clone, Debug)]
pub(crate) struct ChannelDefaults {
    pub read_timeout: Option<Duration>,
    pub write_timeout: Option<Duration>,
    pub local_address: Option<String>,
    pub remote_address: Option<String>,
}

pub(crate) struct Connected {
    id: u32,
    input: InvocationInput,
    output: InvocationOutput,
    read_timeout: Arc<AtomicU64>,
    write_timeout: Arc<AtomicU64>,
    local_address: Option<String>,
    remote_address: Option<String>,
    closed: bool,
}

enum ChannelState {
    Connected(Box<Connected>),
    Unconnected,
}

/// One invocation channel. See the module docs for the lifecycle.
pub struct InvocationChannel {
    state: ChannelState,
    // Held for the channel's lifetime; releasing it frees broker capacity.
    permit: Option<OwnedSemaphorePermit>,
}

impl InvocationChannel {
    pub(crate) fn connected(
        mux: MuxChannel,
        ctx: ChannelCtx,
        defaults: &ChannelDefaults,
        permit: Option<OwnedSemaphorePermit>,
    ) -> Self {
        let read_timeout = Arc::new(AtomicU64::new(encode_timeout(defaults.read_timeout)));
        let write_timeout = Arc::new(AtomicU64::new(encode_timeout(defaults.write_timeout)));
        let input = InvocationInput::new(mux.reader, ctx.clone(), Arc::clone(&read_timeout));
        let output = InvocationOutput::new(mux.writer, ctx, Arc::clone(&write_timeout));
        Self {
            state: ChannelState::Connected(Box::new(Connected {
                id: mux.id,
                input,
                output,
                read_timeout,
                write_timeout,
                local_address: defaults.local_address.clone(),
                remote_address: defaults.remote_address.clone(),
                closed: false,
            })),
            permit,
        }
    }

    /// The placeholder channel: every operation fails with `NotConnected`.
    pub fn unconnected() -> Self {
        Self {
            state: ChannelState::Unconnected,
            permit: None,
        }
    }

    fn connected_ref(&self) -> Result<&Connected> {
        match &self.state {
            ChannelState::Connected(c) => Ok(c),
            ChannelState::Unconnected => Err(SessionError::NotConnected),
        }
    }

    fn connected_mut(&mut self) -> Result<&mut Connected> {
        match &mut self.state {
            ChannelState::Connected(c) => Ok(c),
            ChannelState::Unconnected => Err(SessionError::NotConnected),
        }
    }

    /// The reading side of this channel.
    pub fn reader(&mut self) -> Result<&mut InvocationInput> {
        Ok(&mut self.connected_mut()?.input)
    }

    /// The writing side of this channel.
    pub fn writer(&mut self) -> Result<&mut InvocationOutput> {
        Ok(&mut self.connected_mut()?.output)
    }

    /// Both sides at once, for pipe methods that drive the channel directly.
    pub fn split(&mut self) -> Result<(&mut InvocationInput, &mut InvocationOutput)> {
        let c = self.connected_mut()?;
        Ok((&mut c.input, &mut c.output))
    }

    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        self.connected_ref()?
            .read_timeout
            .store(encode_timeout(timeout), Ordering::SeqCst);
        Ok(())
    }

    pub fn read_timeout(&self) -> Result<Option<Duration>> {
        Ok(decode_timeout(
            self.connected_ref()?.read_timeout.load(Ordering::SeqCst),
        ))
    }

    pub fn set_write_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        self.connected_ref()?
            .write_timeout
            .store(encode_timeout(timeout), Ordering::SeqCst);
        Ok(())
    }

    pub fn write_timeout(&self) -> Result<Option<Duration>> {
        Ok(decode_timeout(
            self.connected_ref()?.write_timeout.load(Ordering::SeqCst),
        ))
    }

    /// Informational only; may be absent.
    pub fn local_address_string(&self) -> Option<&str> {
        match &self.state {
            ChannelState::Connected(c) => c.local_address.as_deref(),
            ChannelState::Unconnected => None,
        }
    }

    /// Informational only; may be absent.
    pub fn remote_address_string(&self) -> Option<&str> {
        match &self.state {
            ChannelState::Connected(c) => c.remote_address.as_deref(),
            ChannelState::Unconnected => None,
        }
    }

    /// Close the channel. Idempotent; in-flight reads observe end of
    /// stream, writes fail with a closed error.
    pub fn close(&mut self) {
        if let ChannelState::Connected(c) = &mut self.state {
            if !c.closed {
                c.closed = true;
                c.output.close();
            }
        }
        self.permit.take();
    }

    /// Whether the channel can still carry an invocation.
    pub fn is_open(&self) -> bool {
        match &self.state {
            ChannelState::Connected(c) => !c.closed && !c.output.is_closed(),
            ChannelState::Unconnected => false,
        }
    }

    pub(crate) fn id(&self) -> u32 {
        match &self.state {
            ChannelState::Connected(c) => c.id,
            ChannelState::Unconnected => 0,
        }
    }

    /// Reset both sharing scopes for the next request or reply.
    pub(crate) fn begin_message(&mut self) {
        if let ChannelState::Connected(c) = &mut self.state {
            c.input.begin_message();
            c.output.begin_message();
        }
    }
}

impl Drop for InvocationChannel {
    fn drop(&mut self) {
        // A dropped channel must not reappear anywhere: close the writer
        // half so the peer observes end of stream.
        self.close();
    }
}

impl std::fmt::Debug for InvocationChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.state {
            ChannelState::Connected(c) => f
                .debug_struct("InvocationChannel")
                .field("id", &c.id)
                .field("closed", &c.closed)
                .finish(),
            ChannelState::Unconnected => write!(f, "InvocationChannel::Unconnected"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mux::{Multiplexer, MuxRole};
    use remi_wire::BasicCodec;
    use std::sync::Arc;

    fn defaults() -> ChannelDefaults {
        ChannelDefaults {
            read_timeout: None,
            write_timeout: None,
            local_address: Some("test:left".into()),
            remote_address: Some("test:right".into()),
        }
    }

    fn ctx() -> ChannelCtx {
        ChannelCtx {
            core: Weak::new(),
            codec: Arc::new(BasicCodec),
        }
    }

    async fn channel_pair() -> (InvocationChannel, InvocationChannel, Multiplexer, Multiplexer) {
        let (a, b) = tokio::io::duplex(256 * 1024);
        let left = Multiplexer::new(a, MuxRole::Connect);
        let right = Multiplexer::new(b, MuxRole::Accept);
        let out = left.open().await.unwrap();
        let inn = right.accept().await.unwrap();
        (
            InvocationChannel::connected(out, ctx(), &defaults(), None),
            InvocationChannel::connected(inn, ctx(), &defaults(), None),
            left,
            right,
        )
    }

    #[tokio::test]
    async fn test_primitive_roundtrip() {
        let (mut tx, mut rx, _l, _r) = channel_pair().await;

        let out = tx.writer().unwrap();
        out.write_boolean(true);
        out.write_byte(-5);
        out.write_char('ä').unwrap();
        out.write_int(123_456);
        out.write_long(-9_999_999_999);
        out.write_float(1.25);
        out.write_double(-2.5);
        out.flush().await.unwrap();

        let input = rx.reader().unwrap();
        assert!(input.read_boolean().await.unwrap());
        assert_eq!(input.read_byte().await.unwrap(), -5);
        assert_eq!(input.read_char().await.unwrap(), 'ä');
        assert_eq!(input.read_int().await.unwrap(), 123_456);
        assert_eq!(input.read_long().await.unwrap(), -9_999_999_999);
        assert_eq!(input.read_float().await.unwrap(), 1.25);
        assert_eq!(input.read_double().await.unwrap(), -2.5);
        assert_eq!(input.buffered_len(), 0);
    }

    #[tokio::test]
    async fn test_boxed_and_string_roundtrip() {
        let (mut tx, mut rx, _l, _r) = channel_pair().await;

        let out = tx.writer().unwrap();
        out.write_int_obj(Some(7));
        out.write_int_obj(None);
        out.write_boolean_obj(Some(false));
        out.write_str(Some("héllo 𝄞"));
        out.write_str(None);
        out.write_utf("plain");
        out.write_var_uint(0x12345);
        out.flush().await.unwrap();

        let input = rx.reader().unwrap();
        assert_eq!(input.read_int_obj().await.unwrap(), Some(7));
        assert_eq!(input.read_int_obj().await.unwrap(), None);
        assert_eq!(input.read_boolean_obj().await.unwrap(), Some(false));
        assert_eq!(input.read_str().await.unwrap().as_deref(), Some("héllo 𝄞"));
        assert_eq!(input.read_str().await.unwrap(), None);
        assert_eq!(input.read_utf().await.unwrap(), "plain");
        assert_eq!(input.read_var_uint().await.unwrap(), 0x12345);
    }

    #[tokio::test]
    async fn test_shared_objects_collapse_to_backrefs() {
        let (mut tx, mut rx, _l, _r) = channel_pair().await;

        let obj: Arc<dyn remi_wire::CodecObject> = Arc::new("shared".to_string());
        let out = tx.writer().unwrap();
        out.write_shared_obj(Some(&obj)).unwrap();
        out.write_shared_obj(Some(&obj)).unwrap();
        out.write_unshared_obj(Some(&obj)).unwrap();
        out.flush().await.unwrap();

        let input = rx.reader().unwrap();
        let first = input.read_shared_obj().await.unwrap().unwrap();
        let second = input.read_shared_obj().await.unwrap().unwrap();
        let third = input.read_unshared_obj().await.unwrap().unwrap();

        // Identity preserved for the shared pair, not for the unshared copy.
        assert!(Arc::ptr_eq(&first, &second));
        assert!(!Arc::ptr_eq(&first, &third));
        assert_eq!(first.as_any().downcast_ref::<String>().unwrap(), "shared");
        assert_eq!(third.as_any().downcast_ref::<String>().unwrap(), "shared");
    }

    #[tokio::test]
    async fn test_scope_resets_per_message() {
        let (mut tx, mut rx, _l, _r) = channel_pair().await;

        let obj: Arc<dyn remi_wire::CodecObject> = Arc::new("scoped".to_string());
        tx.writer().unwrap().write_shared_obj(Some(&obj)).unwrap();
        tx.writer().unwrap().flush().await.unwrap();
        let a = rx.reader().unwrap().read_shared_obj().await.unwrap().unwrap();

        tx.begin_message();
        rx.begin_message();

        tx.writer().unwrap().write_shared_obj(Some(&obj)).unwrap();
        tx.writer().unwrap().flush().await.unwrap();
        let b = rx.reader().unwrap().read_shared_obj().await.unwrap().unwrap();

        // A fresh scope means a fresh inline copy, not a back-reference.
        assert!(!Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn test_throwable_roundtrip() {
        let (mut tx, mut rx, _l, _r) = channel_pair().await;

        let root = remi_wire::ThrowableStub::new("RootCause", Some("broken".into()));
        let outer = remi_wire::ThrowableStub::new("Outer", Some("call failed".into()))
            .with_frame(remi_wire::StackFrame::new("svc::Obj", "run").at("obj.rs", 3))
            .caused_by(root);

        tx.writer().unwrap().write_throwable(&outer).unwrap();
        tx.writer().unwrap().flush().await.unwrap();

        let input = rx.reader().unwrap();
        assert_eq!(
            input.read_ok().await.unwrap(),
            crate::io::ReplyStatus::NotOk
        );
        let decoded = input.read_throwable().await.unwrap();
        assert_eq!(decoded, outer);
    }

    #[tokio::test]
    async fn test_read_timeout_fails_invocation() {
        let (tx, mut rx, _l, _r) = channel_pair().await;
        rx.set_read_timeout(Some(Duration::from_millis(20))).unwrap();

        let err = rx.reader().unwrap().read_int().await.unwrap_err();
        assert!(matches!(err, SessionError::Timeout));
        drop(tx);
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_fails_reads() {
        let (mut tx, mut rx, _l, _r) = channel_pair().await;
        tx.close();
        tx.close();
        assert!(!tx.is_open());

        let err = rx.reader().unwrap().read_int().await.unwrap_err();
        assert!(matches!(err, SessionError::Eof));
    }

    #[tokio::test]
    async fn test_unconnected_placeholder() {
        let mut ch = InvocationChannel::unconnected();
        assert!(matches!(ch.reader(), Err(SessionError::NotConnected)));
        assert!(matches!(ch.writer(), Err(SessionError::NotConnected)));
        assert!(matches!(
            ch.set_read_timeout(None),
            Err(SessionError::NotConnected)
        ));
        assert!(!ch.is_open());
        assert_eq!(ch.local_address_string(), None);
    }

    #[tokio::test]
    async fn test_timeout_accessors() {
        let (ch, _rx, _l, _r) = channel_pair().await;
        assert_eq!(ch.read_timeout().unwrap(), None);
        ch.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        assert_eq!(ch.read_timeout().unwrap(), Some(Duration::from_secs(2)));
        ch.set_write_timeout(Some(Duration::from_millis(5))).unwrap();
        assert_eq!(
            ch.write_timeout().unwrap(),
            Some(Duration::from_millis(5))
        );
    }
}
