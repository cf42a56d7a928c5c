//! Stub and skeleton dispatch
//!
//! Per remote interface, a [`SkeletonFactory`] holds a dispatch table built
//! at registration time: one boxed handler per method ordinal, plus the
//! method-identifier lookup used on the wire. The factory is held through
//! an `Arc` by every stub and skeleton instance, so its table outlives each
//! of them.
//!
//! A [`Stub`] marshals calls onto a channel drawn from the session broker;
//! a [`Skeleton`] unmarshals an incoming call and invokes the target
//! object. Both lean on their support objects for channel acquisition,
//! recycling and failure reporting.

use crate::channel::InvocationChannel;
use crate::error::{Result, SessionError};
use crate::failure::{stitch_local_trace, throwable_from_error};
use crate::ident::{Identifier, VersionedIdentifier};
use crate::info::{ParamKind, RemoteInfo};
use crate::io::ReplyStatus;
use crate::session::SessionCore;
use crate::value::Value;
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::Location;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use tracing::debug;

/// Marker for objects that can be exported through a session.
///
/// Blanket-implemented; skeleton handlers downcast through `as_any`.
pub trait RemoteObject: Any + Send + Sync {
    fn as_any(&self) -> &dyn Any;
}

impl<T: Any + Send + Sync> RemoteObject for T {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

pub type MethodFuture = Pin<Box<dyn Future<Output = Result<Value>> + Send>>;
pub type MethodHandler =
    Arc<dyn Fn(Arc<dyn RemoteObject>, Vec<Value>) -> MethodFuture + Send + Sync>;
pub type PipeFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;
pub type PipeHandler =
    Arc<dyn Fn(Arc<dyn RemoteObject>, Vec<Value>, InvocationChannel) -> PipeFuture + Send + Sync>;

enum Handler {
    Method(MethodHandler),
    Pipe(PipeHandler),
    /// Declared in the interface but not provided by this implementation.
    Unimplemented,
}

/// Per-interface dispatch table, shared by all skeletons of the type.
pub struct SkeletonFactory {
    info: Arc<RemoteInfo>,
    handlers: Vec<Handler>,
    ordinals: HashMap<Identifier, u16>,
}

impl SkeletonFactory {
    pub fn builder(info: RemoteInfo) -> SkeletonFactoryBuilder {
        SkeletonFactoryBuilder {
            info,
            named: Vec::new(),
        }
    }

    pub fn info(&self) -> &Arc<RemoteInfo> {
        &self.info
    }

    fn ordinal_of(&self, method_id: Identifier) -> Option<u16> {
        self.ordinals.get(&method_id).copied()
    }
}

/// Builder collecting named handlers, resolved against the interface
/// description on `build`.
pub struct SkeletonFactoryBuilder {
    info: RemoteInfo,
    named: Vec<(String, Handler)>,
}

impl SkeletonFactoryBuilder {
    /// Register the handler for a synchronous or asynchronous method.
    pub fn method<F, Fut>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Arc<dyn RemoteObject>, Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        let handler: MethodHandler = Arc::new(move |target, args| Box::pin(handler(target, args)));
        self.named.push((name.into(), Handler::Method(handler)));
        self
    }

    /// Register the handler for a pipe method; it receives the invocation
    /// channel after the parameters have been read and owns it until close.
    pub fn pipe_method<F, Fut>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Arc<dyn RemoteObject>, Vec<Value>, InvocationChannel) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let handler: PipeHandler =
            Arc::new(move |target, args, channel| Box::pin(handler(target, args, channel)));
        self.named.push((name.into(), Handler::Pipe(handler)));
        self
    }

    /// Resolve handlers against the interface. Methods without a handler
    /// dispatch as `UnimplementedMethod`; a handler naming no declared
    /// method is an error.
    pub fn build(self) -> Result<Arc<SkeletonFactory>> {
        let info = Arc::new(self.info);
        let mut handlers: Vec<Handler> = (0..info.methods.len())
            .map(|_| Handler::Unimplemented)
            .collect();
        for (name, handler) in self.named {
            let ordinal = info
                .methods
                .iter()
                .position(|m| m.name == name)
                .ok_or_else(|| {
                    SessionError::InvalidInterface(format!(
                        "interface {} declares no method named {name}",
                        info.name
                    ))
                })?;
            match (&handler, &info.methods[ordinal]) {
                (Handler::Pipe(_), m) if !m.pipe => {
                    return Err(SessionError::InvalidInterface(format!(
                        "method {name} is not declared as a pipe"
                    )))
                }
                (Handler::Method(_), m) if m.pipe => {
                    return Err(SessionError::InvalidInterface(format!(
                        "pipe method {name} requires a pipe handler"
                    )))
                }
                _ => {}
            }
            handlers[ordinal] = handler;
        }
        let ordinals = info
            .methods
            .iter()
            .enumerate()
            .map(|(i, m)| (m.method_id, i as u16))
            .collect();
        Ok(Arc::new(SkeletonFactory {
            info,
            handlers,
            ordinals,
        }))
    }
}

/// Per-call services for skeletons.
pub struct SkeletonSupport {
    core: Weak<SessionCore>,
}

impl SkeletonSupport {
    pub(crate) fn new(core: Weak<SessionCore>) -> Self {
        Self { core }
    }

    /// Route an asynchronous invocation failure to the session's error
    /// sink. Never sent over the invocation channel.
    pub(crate) fn report_async(&self, method: &str, cause: SessionError) {
        if let Some(core) = self.core.upgrade() {
            core.report_async_failure(method, cause);
        }
    }
}

/// Dispatches invocations onto one exported object.
pub struct Skeleton {
    factory: Arc<SkeletonFactory>,
    target: Arc<dyn RemoteObject>,
    vid: Arc<VersionedIdentifier>,
}

impl Skeleton {
    pub(crate) fn new(
        factory: Arc<SkeletonFactory>,
        target: Arc<dyn RemoteObject>,
        vid: Arc<VersionedIdentifier>,
    ) -> Self {
        Self {
            factory,
            target,
            vid,
        }
    }

    pub fn info(&self) -> &Arc<RemoteInfo> {
        self.factory.info()
    }

    pub(crate) fn id(&self) -> Identifier {
        self.vid.id()
    }

    /// Dispatch one invocation whose method identifier has already been
    /// read. Returns the channel for the next invocation, or `None` when
    /// the channel was consumed by a pipe or had to be closed.
    pub(crate) async fn dispatch(
        &self,
        method_id: Identifier,
        mut channel: InvocationChannel,
        support: &SkeletonSupport,
    ) -> Result<Option<InvocationChannel>> {
        let Some(ordinal) = self.factory.ordinal_of(method_id) else {
            // The parameters cannot be read without the method description,
            // so reply and discard the channel.
            debug!(object = %self.id(), method = %method_id, "no such method");
            let err = SessionError::NoSuchMethod(method_id);
            let out = channel.writer()?;
            out.write_throwable(&throwable_from_error(&err))?;
            out.flush().await?;
            channel.close();
            return Ok(None);
        };
        let method = &self.factory.info().methods[usize::from(ordinal)];

        let mut args = Vec::with_capacity(method.parameters.len());
        {
            let input = channel.reader()?;
            for param in &method.parameters {
                args.push(input.read_param(param).await?);
            }
        }

        let handler = &self.factory.handlers[usize::from(ordinal)];
        let result = match handler {
            Handler::Pipe(h) => {
                // The method body owns the channel from here on.
                h(Arc::clone(&self.target), args, channel).await?;
                return Ok(None);
            }
            Handler::Unimplemented => Err(SessionError::UnimplementedMethod(method.name.clone())),
            Handler::Method(h) => h(Arc::clone(&self.target), args).await,
        };

        if method.asynchronous && method.return_type.is_none() {
            // Fire-and-forget: nothing goes back on the channel. A failure
            // is reported through the session's error sink instead.
            if let Err(cause) = result {
                support.report_async(&method.name, cause);
            }
            return Ok(Some(channel));
        }

        let out = channel.writer()?;
        match result {
            Ok(value) => {
                let written: Result<()> = (|| {
                    match &method.return_type {
                        None => out.write_ok(true),
                        Some(ret) if ret.kind == ParamKind::Boolean => {
                            out.write_ok(value.as_boolean()?)
                        }
                        Some(ret) => {
                            out.write_ok(true);
                            out.write_param(ret, &value)?;
                        }
                    }
                    Ok(())
                })();
                if let Err(e) = written {
                    // Nothing has been flushed yet, so the reply can be
                    // replaced wholesale by a failure reply.
                    out.abandon_message();
                    out.write_throwable(&throwable_from_error(&e))?;
                }
            }
            Err(e) => {
                debug!(object = %self.id(), method = %method.name, "invocation failed: {e}");
                out.write_throwable(&throwable_from_error(&e))?;
            }
        }
        out.flush().await?;
        Ok(Some(channel))
    }
}

/// Per-call services for stubs: channel acquisition, recycling, failure.
pub struct StubSupport {
    vid: Arc<VersionedIdentifier>,
    core: Weak<SessionCore>,
}

impl StubSupport {
    pub(crate) fn new(vid: Arc<VersionedIdentifier>, core: Weak<SessionCore>) -> Self {
        Self { vid, core }
    }

    /// Draw a channel from the broker and address it to this stub's object.
    async fn acquire(&self) -> Result<InvocationChannel> {
        let core = self.core.upgrade().ok_or(SessionError::BrokerClosed)?;
        let mut channel = core.broker().connect().await?;
        channel.begin_message();
        channel.writer()?.write_identifier(self.vid.id());
        Ok(channel)
    }

    /// Release a channel whose reply has been fully consumed.
    fn finished(&self, channel: InvocationChannel) {
        if let Some(core) = self.core.upgrade() {
            core.broker().recycle(channel);
        }
    }

    /// Discard a channel after a failure; the error passes through.
    fn failed(&self, mut channel: InvocationChannel, err: SessionError) -> SessionError {
        channel.close();
        err
    }
}

/// Local proxy for an object exported by the peer.
pub struct Stub {
    info: Arc<RemoteInfo>,
    support: StubSupport,
}

impl Stub {
    pub(crate) fn new(
        info: Arc<RemoteInfo>,
        vid: Arc<VersionedIdentifier>,
        core: Weak<SessionCore>,
    ) -> Self {
        Self {
            info,
            support: StubSupport::new(vid, core),
        }
    }

    pub fn info(&self) -> &Arc<RemoteInfo> {
        &self.info
    }

    /// The identifier of the remote object this stub proxies.
    pub fn id(&self) -> Identifier {
        self.support.vid.id()
    }

    pub(crate) fn vid(&self) -> &Arc<VersionedIdentifier> {
        &self.support.vid
    }

    /// Invoke the method at `ordinal` with `args`.
    #[track_caller]
    pub fn invoke(
        &self,
        ordinal: u16,
        args: Vec<Value>,
    ) -> impl Future<Output = Result<Value>> + Send + '_ {
        let call_site = Location::caller();
        async move { self.invoke_at(ordinal, args, call_site).await }
    }

    async fn invoke_at(
        &self,
        ordinal: u16,
        args: Vec<Value>,
        call_site: &'static Location<'static>,
    ) -> Result<Value> {
        let method = self.info.method(ordinal).ok_or_else(|| {
            SessionError::InvalidInterface(format!(
                "interface {} has no method ordinal {ordinal}",
                self.info.name
            ))
        })?;
        if method.pipe {
            return Err(SessionError::InvalidInterface(format!(
                "pipe method {} requires invoke_pipe",
                method.name
            )));
        }
        if args.len() != method.parameters.len() {
            return Err(SessionError::InvalidInterface(format!(
                "method {} takes {} parameters, got {}",
                method.name,
                method.parameters.len(),
                args.len()
            )));
        }

        let mut channel = self.support.acquire().await?;

        let marshalled: Result<()> = {
            let out = channel.writer()?;
            (|| {
                out.write_identifier(method.method_id);
                for (param, arg) in method.parameters.iter().zip(&args) {
                    out.write_param(param, arg)?;
                }
                Ok(())
            })()
        };
        if let Err(e) = marshalled {
            // A marshalling failure before any byte went out leaves the
            // channel clean, so it goes back to the pool.
            let out = channel.writer()?;
            if !out.has_sent() {
                out.abandon_message();
                self.support.finished(channel);
            } else {
                channel.close();
            }
            return Err(e);
        }
        if let Err(e) = channel.writer()?.flush().await {
            return Err(self.support.failed(channel, e));
        }

        if method.asynchronous && method.return_type.is_none() {
            self.support.finished(channel);
            return Ok(Value::Null);
        }

        let status = match channel.reader()?.read_ok().await {
            Ok(status) => status,
            Err(e) => return Err(self.support.failed(channel, e)),
        };
        match status {
            ReplyStatus::Ok(flag) => {
                let value = match &method.return_type {
                    None => Value::Null,
                    Some(ret) if ret.kind == ParamKind::Boolean => Value::Boolean(flag),
                    Some(ret) => match channel.reader()?.read_param(ret).await {
                        Ok(v) => v,
                        Err(e) => return Err(self.support.failed(channel, e)),
                    },
                };
                self.support.finished(channel);
                Ok(value)
            }
            ReplyStatus::NotOk => {
                let throwable = match channel.reader()?.read_throwable().await {
                    Ok(t) => t,
                    Err(e) => return Err(self.support.failed(channel, e)),
                };
                // The reply was fully consumed, so the channel is clean.
                self.support.finished(channel);
                Err(SessionError::RemoteFailure(stitch_local_trace(
                    throwable, call_site,
                )))
            }
        }
    }

    /// Invoke a pipe method: the request is written and flushed, then the
    /// channel is handed to the caller. It will not be recycled; close it
    /// when the pipe is done.
    pub async fn invoke_pipe(&self, ordinal: u16, args: Vec<Value>) -> Result<InvocationChannel> {
        let method = self.info.method(ordinal).ok_or_else(|| {
            SessionError::InvalidInterface(format!(
                "interface {} has no method ordinal {ordinal}",
                self.info.name
            ))
        })?;
        if !method.pipe {
            return Err(SessionError::InvalidInterface(format!(
                "method {} is not declared as a pipe",
                method.name
            )));
        }
        if args.len() != method.parameters.len() {
            return Err(SessionError::InvalidInterface(format!(
                "method {} takes {} parameters, got {}",
                method.name,
                method.parameters.len(),
                args.len()
            )));
        }

        let mut channel = self.support.acquire().await?;
        let marshalled: Result<()> = {
            let out = channel.writer()?;
            (|| {
                out.write_identifier(method.method_id);
                for (param, arg) in method.parameters.iter().zip(&args) {
                    out.write_param(param, arg)?;
                }
                Ok(())
            })()
        };
        if let Err(e) = marshalled {
            let out = channel.writer()?;
            if !out.has_sent() {
                out.abandon_message();
                self.support.finished(channel);
            } else {
                channel.close();
            }
            return Err(e);
        }
        if let Err(e) = channel.writer()?.flush().await {
            return Err(self.support.failed(channel, e));
        }
        Ok(channel)
    }
}

impl PartialEq for Stub {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

impl Eq for Stub {}

impl fmt::Debug for Stub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stub")
            .field("interface", &self.info.name)
            .field("id", &self.id())
            .finish()
    }
}
