//! Sessions
//!
//! A [`Session`] is the logical RMI bond between two processes sharing one
//! transport. It owns the broker, the registry, the bootstrap skeleton and
//! the distributed-GC driver, runs the accept loop, and coordinates
//! graceful shutdown.
//!
//! The bootstrap object is exported under a well-known identifier on both
//! sides and serves the cross-cutting calls the runtime itself needs: type
//! metadata on cache misses, live-reference diffs, name lookup and the
//! shutdown notice.

use crate::broker::{Broker, BrokerConfig};
use crate::channel::{ChannelCtx, ChannelDefaults, InvocationChannel};
use crate::dgc;
use crate::dispatch::{RemoteObject, SkeletonFactory, SkeletonSupport, Stub};
use crate::error::{Result, SessionError};
use crate::failure::throwable_from_error;
use crate::ident::Identifier;
use crate::info::{ParamKind, RemoteInfo, RemoteParameter};
use crate::mux::{Multiplexer, MuxRole};
use crate::registry::{MarshalledRemote, Registry};
use crate::value::{RemoteRef, Value};
use bytes::BytesMut;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use remi_wire::{ObjectCodec, ThrowableStub};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

// Bootstrap method ordinals.
const ORD_TYPE_INFO: u16 = 0;
const ORD_REFERENCE_DIFF: u16 = 1;
const ORD_LOOKUP: u16 = 2;
const ORD_SHUTDOWN: u16 = 3;

/// Session tuning knobs. The defaults suit most deployments.
#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// Idle channels kept for outbound reuse.
    pub pool_capacity: usize,
    /// Hard cap on concurrently open outbound channels.
    pub max_channels: usize,
    /// Pooled channels idle longer than this are closed on the next acquire.
    pub idle_timeout: Duration,
    /// Default per-channel read deadline.
    pub read_timeout: Option<Duration>,
    /// Default per-channel write deadline.
    pub write_timeout: Option<Duration>,
    /// Period of the live-reference exchange.
    pub dgc_period: Duration,
    /// Informational local address, surfaced on channels.
    pub local_address: Option<String>,
    /// Informational remote address, surfaced on channels.
    pub remote_address: Option<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            pool_capacity: 8,
            max_channels: 64,
            idle_timeout: Duration::from_secs(60),
            read_timeout: None,
            write_timeout: None,
            dgc_period: Duration::from_secs(10),
            local_address: None,
            remote_address: None,
        }
    }
}

type ErrorSink = Box<dyn Fn(SessionError) + Send + Sync>;

pub(crate) struct SessionCore {
    broker: Broker,
    registry: Registry,
    config: SessionConfig,
    bindings: Mutex<HashMap<String, Identifier>>,
    error_sink: Mutex<Option<ErrorSink>>,
    peer_admin: OnceLock<Arc<Stub>>,
    closing: AtomicBool,
    dgc_live: Mutex<HashSet<Identifier>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SessionCore {
    pub(crate) fn broker(&self) -> &Broker {
        &self.broker
    }

    pub(crate) fn registry(&self) -> &Registry {
        &self.registry
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closing.load(Ordering::SeqCst) || self.broker.is_closed()
    }

    fn peer_admin(&self) -> Result<Arc<Stub>> {
        self.peer_admin
            .get()
            .cloned()
            .ok_or(SessionError::BrokerClosed)
    }

    /// Route an asynchronous-invocation failure to the error sink, or log
    /// it when no sink is installed.
    pub(crate) fn report_async_failure(&self, method: &str, cause: SessionError) {
        let err = SessionError::AsynchronousInvocation {
            method: method.to_string(),
            cause: Box::new(cause),
        };
        let sink = self.error_sink.lock();
        match &*sink {
            Some(sink) => sink(err),
            None => warn!("{err}"),
        }
    }

    /// Produce the wire form of a remote reference, exporting local objects
    /// and bumping transmit counters.
    pub(crate) fn marshal_remote(&self, rref: &RemoteRef) -> Result<MarshalledRemote> {
        match rref {
            RemoteRef::Local { object, factory } => {
                Ok(self.registry.marshal_export(object, factory))
            }
            RemoteRef::Stub(stub) => Ok(self.registry.marshal_stub(stub)),
        }
    }

    /// Resolve a received reference. A reference to one of our own exports
    /// resolves to the local object; anything else becomes a shared stub,
    /// fetching the type description through the bootstrap call when the
    /// cache misses.
    pub(crate) fn import_remote(
        self: &Arc<Self>,
        obj_id: Identifier,
        obj_version: u32,
        type_id: Identifier,
        type_version: u32,
        info: Option<RemoteInfo>,
    ) -> BoxFuture<'static, Result<RemoteRef>> {
        let core = Arc::clone(self);
        Box::pin(async move {
            if let Some(handle) = core.registry.lookup_local(obj_id) {
                handle.vid.update_remote_version(obj_version);
                return Ok(RemoteRef::Local {
                    object: handle.object,
                    factory: handle.factory,
                });
            }
            core.registry
                .type_vid(type_id)
                .update_remote_version(type_version);

            let info = match info {
                Some(info) => {
                    if info.type_id != type_id {
                        return Err(SessionError::Corrupted(format!(
                            "reference type {type_id} carries description of {}",
                            info.type_id
                        )));
                    }
                    core.registry.insert_type(Arc::new(info))
                }
                None => match core.registry.type_info(type_id) {
                    Some(info) => info,
                    None => {
                        trace!(type_id = %type_id, "fetching type description from peer");
                        let admin = core.peer_admin()?;
                        let reply = admin
                            .invoke(
                                ORD_TYPE_INFO,
                                vec![Value::Long(type_id.to_u64() as i64)],
                            )
                            .await?;
                        let payload = reply.into_object()?;
                        let bytes = payload
                            .as_any()
                            .downcast_ref::<Vec<u8>>()
                            .ok_or_else(|| {
                                SessionError::Corrupted(
                                    "type description payload is not a byte array".into(),
                                )
                            })?;
                        let info = RemoteInfo::decode(&mut &bytes[..])?;
                        core.registry.insert_type(Arc::new(info))
                    }
                },
            };
            let stub =
                core.registry
                    .import_remote(obj_id, obj_version, info, Arc::downgrade(&core));
            Ok(RemoteRef::Stub(stub))
        })
    }

    /// One live-reference exchange: report additions and removals, then
    /// forget the removals the peer has acknowledged receiving.
    pub(crate) async fn dgc_round(self: &Arc<Self>) -> Result<()> {
        let (dead, live) = self.registry.sweep_imported();
        let removed: Vec<(Identifier, u32)> = dead
            .into_iter()
            .filter(|(id, _)| id.to_u64() >= Identifier::RESERVED_LIMIT)
            .collect();
        let added: Vec<Identifier> = {
            let last = self.dgc_live.lock();
            live.iter()
                .filter(|id| id.to_u64() >= Identifier::RESERVED_LIMIT && !last.contains(*id))
                .copied()
                .collect()
        };
        if added.is_empty() && removed.is_empty() {
            *self.dgc_live.lock() = live;
            return Ok(());
        }

        debug!(
            added = added.len(),
            removed = removed.len(),
            "sending reference diff"
        );
        let admin = self.peer_admin()?;
        admin
            .invoke(
                ORD_REFERENCE_DIFF,
                vec![
                    Value::Object(Arc::new(dgc::encode_added(&added))),
                    Value::Object(Arc::new(dgc::encode_removed(&removed))),
                ],
            )
            .await?;
        self.registry.forget_imported(&removed);
        *self.dgc_live.lock() = live;
        Ok(())
    }

    /// Tear the session down: terminal for all further operations.
    pub(crate) fn close_now(&self) {
        self.closing.store(true, Ordering::SeqCst);
        self.broker.close();
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

/// The logical RMI bond between two processes sharing one transport.
pub struct Session {
    core: Arc<SessionCore>,
}

impl Session {
    /// Establish a session over `stream` as the connecting side.
    pub async fn connect<S>(
        stream: S,
        codec: Arc<dyn ObjectCodec>,
        config: SessionConfig,
    ) -> Result<Session>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self::start(stream, codec, config, MuxRole::Connect)
    }

    /// Establish a session over `stream` as the accepting side.
    pub async fn accept<S>(
        stream: S,
        codec: Arc<dyn ObjectCodec>,
        config: SessionConfig,
    ) -> Result<Session>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self::start(stream, codec, config, MuxRole::Accept)
    }

    fn start<S>(
        stream: S,
        codec: Arc<dyn ObjectCodec>,
        config: SessionConfig,
        role: MuxRole,
    ) -> Result<Session>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let mux = Multiplexer::new(stream, role);
        let broker_config = BrokerConfig {
            pool_capacity: config.pool_capacity,
            max_channels: config.max_channels,
            idle_timeout: config.idle_timeout,
            defaults: ChannelDefaults {
                read_timeout: config.read_timeout,
                write_timeout: config.write_timeout,
                local_address: config.local_address.clone(),
                remote_address: config.remote_address.clone(),
            },
        };
        let core = Arc::new_cyclic(|weak: &Weak<SessionCore>| SessionCore {
            broker: Broker::new(
                mux,
                broker_config,
                ChannelCtx {
                    core: weak.clone(),
                    codec: Arc::clone(&codec),
                },
            ),
            registry: Registry::new(),
            config,
            bindings: Mutex::new(HashMap::new()),
            error_sink: Mutex::new(None),
            peer_admin: OnceLock::new(),
            closing: AtomicBool::new(false),
            dgc_live: Mutex::new(HashSet::new()),
            tasks: Mutex::new(Vec::new()),
        });

        let factory = bootstrap_factory()?;
        let admin: Arc<dyn RemoteObject> = Arc::new(SessionAdmin {
            core: Arc::downgrade(&core),
        });
        core.registry
            .export_with_id(Identifier::BOOTSTRAP, &admin, &factory, true);
        let peer_admin = core.registry.import_remote(
            Identifier::BOOTSTRAP,
            0,
            Arc::clone(factory.info()),
            Arc::downgrade(&core),
        );
        core.peer_admin
            .set(peer_admin)
            .map_err(|_| SessionError::InvalidInterface("bootstrap already installed".into()))?;

        let weak = Arc::downgrade(&core);
        let accept_task = tokio::spawn(accept_loop(weak.clone()));
        let dgc_task = tokio::spawn(dgc::dgc_loop(weak, core.config.dgc_period));
        core.tasks.lock().extend([accept_task, dgc_task]);

        info!(role = ?role, "session established");
        Ok(Session { core })
    }

    /// Expose a local object to the peer under a name. Bound objects are
    /// retained for the session's lifetime regardless of peer references.
    pub fn bind(
        &self,
        name: impl Into<String>,
        object: Arc<dyn RemoteObject>,
        factory: &Arc<SkeletonFactory>,
    ) {
        let vid = self.core.registry.export_local(&object, factory, true);
        let name = name.into();
        debug!(name = %name, id = %vid.id(), "bound object");
        self.core.bindings.lock().insert(name, vid.id());
    }

    /// Obtain a stub for an object the peer has bound.
    pub async fn lookup(&self, name: &str) -> Result<Arc<Stub>> {
        let admin = self.core.peer_admin()?;
        let reply = admin
            .invoke(ORD_LOOKUP, vec![Value::Str(name.to_string())])
            .await?;
        reply.into_remote()?.into_stub()
    }

    /// Install the sink receiving asynchronous-invocation failures.
    pub fn set_error_sink(&self, sink: impl Fn(SessionError) + Send + Sync + 'static) {
        *self.core.error_sink.lock() = Some(Box::new(sink));
    }

    /// Force one live-reference exchange immediately.
    pub async fn run_dgc_round(&self) -> Result<()> {
        self.core.dgc_round().await
    }

    /// Gracefully shut the session down, notifying the peer best-effort.
    pub async fn shutdown(&self) -> Result<()> {
        if self.core.closing.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Ok(admin) = self.core.peer_admin() {
            let _ = tokio::time::timeout(
                Duration::from_millis(500),
                admin.invoke(ORD_SHUTDOWN, Vec::new()),
            )
            .await;
            // The notice is queued on the writer task; let it drain before
            // the transport goes away.
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        self.core.close_now();
        info!("session shut down");
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.core.is_closed()
    }

    /// Whether an identifier currently names an exported object here.
    pub fn has_export(&self, id: Identifier) -> bool {
        self.core.registry.lookup_local(id).is_some()
    }

    pub fn config(&self) -> &SessionConfig {
        &self.core.config
    }

    pub fn exported_count(&self) -> usize {
        self.core.registry.exported_count()
    }

    /// Number of physical channels this side has opened so far.
    pub fn channels_opened(&self) -> u64 {
        self.core.broker().channels_opened()
    }

    pub fn imported_count(&self) -> usize {
        self.core.registry.imported_count()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.core.close_now();
    }
}

/// Accept loop: one task; each accepted channel gets its own dispatcher.
async fn accept_loop(weak: Weak<SessionCore>) {
    loop {
        let Some(core) = weak.upgrade() else { break };
        if core.is_closed() {
            break;
        }
        let accepted = core.broker().accept().await;
        drop(core);
        match accepted {
            Ok(channel) => {
                trace!(channel = channel.id(), "accepted invocation channel");
                tokio::spawn(channel_task(weak.clone(), channel));
            }
            Err(e) => {
                if !e.is_connection_closed() {
                    debug!("accept failed: {e}");
                }
                // Transport death is terminal for the whole session.
                if let Some(core) = weak.upgrade() {
                    core.close_now();
                }
                break;
            }
        }
    }
}

/// Dispatch loop for one accepted channel: read the target identifier and
/// method identifier, hand off to the skeleton, repeat until the channel
/// dies or a pipe takes it over.
async fn channel_task(weak: Weak<SessionCore>, mut channel: InvocationChannel) {
    let support = SkeletonSupport::new(weak.clone());
    loop {
        channel.begin_message();
        let obj_id = {
            let Ok(input) = channel.reader() else { break };
            match input.read_identifier().await {
                Ok(id) => id,
                Err(e) => {
                    if !e.is_connection_closed() {
                        debug!("invocation channel failed: {e}");
                    }
                    break;
                }
            }
        };
        let Some(core) = weak.upgrade() else { break };
        let handle = core.registry().lookup_local(obj_id);
        drop(core);
        let Some(handle) = handle else {
            // The parameters cannot be skipped without the method
            // description, so reply and discard the channel.
            debug!(id = %obj_id, "invocation for unknown object");
            let _ = reply_failure(&mut channel, &SessionError::NoSuchObject(obj_id)).await;
            break;
        };
        let method_id = {
            let Ok(input) = channel.reader() else { break };
            match input.read_identifier().await {
                Ok(id) => id,
                Err(e) => {
                    debug!("invocation channel failed: {e}");
                    break;
                }
            }
        };
        channel = match handle.skeleton.dispatch(method_id, channel, &support).await {
            Ok(Some(channel)) => channel,
            Ok(None) => break,
            Err(e) => {
                if !e.is_connection_closed() {
                    debug!("dispatch failed: {e}");
                }
                break;
            }
        };
    }
}

async fn reply_failure(channel: &mut InvocationChannel, err: &SessionError) -> Result<()> {
    let out = channel.writer()?;
    out.write_throwable(&throwable_from_error(err))?;
    out.flush().await
}

/// The bootstrap object exported by every session under the well-known
/// identifier.
struct SessionAdmin {
    core: Weak<SessionCore>,
}

impl SessionAdmin {
    fn core(&self) -> Result<Arc<SessionCore>> {
        self.core.upgrade().ok_or(SessionError::BrokerClosed)
    }

    fn type_info(&self, args: Vec<Value>) -> Result<Value> {
        let core = self.core()?;
        let bits = args
            .into_iter()
            .next()
            .unwrap_or(Value::Null)
            .as_long()?;
        let type_id = Identifier::from_u64(bits as u64);
        let info = core
            .registry
            .type_info(type_id)
            .ok_or(SessionError::NoSuchObject(type_id))?;
        let mut buf = BytesMut::new();
        info.encode(&mut buf);
        Ok(Value::Object(Arc::new(buf.to_vec())))
    }

    fn reference_diff(&self, args: Vec<Value>) -> Result<Value> {
        let core = self.core()?;
        let mut args = args.into_iter();
        let added = diff_payload(args.next())?;
        let removed = diff_payload(args.next())?;

        if !added.is_empty() {
            for id in dgc::decode_added(&added)? {
                trace!(id = %id, "peer reports live reference");
            }
        }
        if !removed.is_empty() {
            let mut dropped = 0usize;
            for (id, version) in dgc::decode_removed(&removed)? {
                if core.registry.drop_export(id, version) {
                    dropped += 1;
                }
            }
            if dropped > 0 {
                debug!(dropped, "reclaimed unreferenced exports");
            }
        }
        Ok(Value::Null)
    }

    fn lookup(&self, args: Vec<Value>) -> Result<Value> {
        let core = self.core()?;
        let name = args
            .into_iter()
            .next()
            .unwrap_or(Value::Null)
            .into_str()?;
        let id = core
            .bindings
            .lock()
            .get(&name)
            .copied()
            .ok_or_else(|| {
                SessionError::Application(ThrowableStub::new(
                    "remi::NoSuchBinding",
                    Some(name.clone()),
                ))
            })?;
        let handle = core
            .registry
            .lookup_local(id)
            .ok_or(SessionError::NoSuchObject(id))?;
        Ok(Value::Remote(RemoteRef::Local {
            object: handle.object,
            factory: handle.factory,
        }))
    }

    fn shutdown_notice(&self) -> Result<Value> {
        let core = self.core()?;
        if !core.closing.swap(true, Ordering::SeqCst) {
            info!("peer initiated session shutdown");
            core.close_now();
        }
        Ok(Value::Null)
    }
}

fn diff_payload(value: Option<Value>) -> Result<Vec<u8>> {
    match value {
        Some(Value::Object(obj)) => obj
            .as_any()
            .downcast_ref::<Vec<u8>>()
            .cloned()
            .ok_or_else(|| {
                SessionError::Corrupted("reference diff payload is not a byte array".into())
            }),
        Some(Value::Null) | None => Ok(Vec::new()),
        Some(other) => Err(SessionError::Corrupted(format!(
            "reference diff payload is {}",
            other.kind_name()
        ))),
    }
}

fn admin_of(target: &Arc<dyn RemoteObject>) -> Result<&SessionAdmin> {
    target
        .as_any()
        .downcast_ref::<SessionAdmin>()
        .ok_or_else(|| SessionError::InvalidInterface("bootstrap target type".into()))
}

/// The bootstrap interface description. Identifiers are fixed so both
/// sides agree without transmission.
fn bootstrap_info() -> RemoteInfo {
    RemoteInfo::builder("remi::SessionAdmin")
        .type_id(Identifier::reserved(1))
        .method("type_info")
        .method_id(Identifier::reserved(2))
        .param(RemoteParameter::new(ParamKind::Long, "long"))
        .returns(RemoteParameter::new(ParamKind::Object, "byte[]"))
        .done()
        .method("reference_diff")
        .method_id(Identifier::reserved(3))
        .param(RemoteParameter::new(ParamKind::Object, "byte[]"))
        .param(RemoteParameter::new(ParamKind::Object, "byte[]"))
        .done()
        .method("lookup")
        .method_id(Identifier::reserved(4))
        .param(RemoteParameter::new(ParamKind::Str, "String"))
        .returns(RemoteParameter::new(ParamKind::Remote, "Remote"))
        .done()
        .method("shutdown_notice")
        .method_id(Identifier::reserved(5))
        .asynchronous()
        .done()
        .build()
}

fn bootstrap_factory() -> Result<Arc<SkeletonFactory>> {
    SkeletonFactory::builder(bootstrap_info())
        .method("type_info", |target, args| async move {
            admin_of(&target)?.type_info(args)
        })
        .method("reference_diff", |target, args| async move {
            admin_of(&target)?.reference_diff(args)
        })
        .method("lookup", |target, args| async move {
            admin_of(&target)?.lookup(args)
        })
        .method("shutdown_notice", |target, _args| async move {
            admin_of(&target)?.shutdown_notice()
        })
        .build()
}
