//! Shared fixtures for the integration tests
#![allow(dead_code)]

use remi_core::{
    ParamKind, RemoteInfo, RemoteParameter, RemoteRef, Session, SessionConfig, SkeletonFactory,
    Value,
};
use remi_wire::{BasicCodec, StackFrame, ThrowableStub};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// Install the test log subscriber once per process. Honors `RUST_LOG`.
pub fn init_logging() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// An in-memory session pair over one duplex transport.
pub async fn session_pair() -> (Session, Session) {
    session_pair_with(SessionConfig::default(), SessionConfig::default()).await
}

pub async fn session_pair_with(
    client_config: SessionConfig,
    server_config: SessionConfig,
) -> (Session, Session) {
    let (a, b) = tokio::io::duplex(1024 * 1024);
    let server = Session::accept(b, Arc::new(BasicCodec), server_config)
        .await
        .expect("server session");
    let client = Session::connect(a, Arc::new(BasicCodec), client_config)
        .await
        .expect("client session");
    (client, server)
}

// Method ordinals of the test service interface.
pub mod test_ord {
    pub const ECHO: u16 = 0;
    pub const NOTIFY: u16 = 1;
    pub const FAIL: u16 = 2;
    pub const CREATE: u16 = 3;
    pub const CALL_ME: u16 = 4;
    pub const STREAM_SUM: u16 = 5;
}

/// Interface description of the main test service.
pub fn test_service_info() -> RemoteInfo {
    RemoteInfo::builder("test::Service")
        .method("echo")
        .param(RemoteParameter::new(ParamKind::Str, "String"))
        .returns(RemoteParameter::new(ParamKind::Str, "String"))
        .done()
        .method("notify")
        .param(RemoteParameter::new(ParamKind::Int, "int"))
        .asynchronous()
        .done()
        .method("fail")
        .param(RemoteParameter::new(ParamKind::Str, "String"))
        .throws("test::InvalidState")
        .done()
        .method("create")
        .returns(RemoteParameter::new(ParamKind::Remote, "test::Counter"))
        .done()
        .method("call_me")
        .param(RemoteParameter::new(ParamKind::Remote, "test::Callback"))
        .returns(RemoteParameter::new(ParamKind::Int, "int"))
        .done()
        .method("stream_sum")
        .param(RemoteParameter::new(ParamKind::Int, "int"))
        .pipe()
        .done()
        .build()
}

pub fn counter_info() -> RemoteInfo {
    RemoteInfo::builder("test::Counter")
        .method("increment")
        .returns(RemoteParameter::new(ParamKind::Long, "long"))
        .done()
        .build()
}

pub fn callback_info() -> RemoteInfo {
    RemoteInfo::builder("test::Callback")
        .method("ping")
        .returns(RemoteParameter::new(ParamKind::Int, "int"))
        .done()
        .build()
}

/// A counter object handed out by [`TestService::create`].
pub struct Counter {
    pub value: AtomicI64,
}

pub fn counter_factory() -> Arc<SkeletonFactory> {
    SkeletonFactory::builder(counter_info())
        .method("increment", |target, _args| async move {
            let counter = target
                .as_any()
                .downcast_ref::<Counter>()
                .expect("counter target");
            Ok(Value::Long(counter.value.fetch_add(1, Ordering::SeqCst) + 1))
        })
        .build()
        .expect("counter factory")
}

/// A callback object exported from the client side.
pub struct Callback {
    pub pinged: AtomicI64,
}

pub fn callback_factory() -> Arc<SkeletonFactory> {
    SkeletonFactory::builder(callback_info())
        .method("ping", |target, _args| async move {
            let callback = target
                .as_any()
                .downcast_ref::<Callback>()
                .expect("callback target");
            callback.pinged.fetch_add(1, Ordering::SeqCst);
            Ok(Value::Int(99))
        })
        .build()
        .expect("callback factory")
}

/// The main test service bound by most scenarios.
pub struct TestService {
    pub notified: parking_lot::Mutex<Vec<i32>>,
    pub notify_signal: Notify,
    pub counter: Arc<Counter>,
    pub counter_factory: Arc<SkeletonFactory>,
}

impl TestService {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            notified: parking_lot::Mutex::new(Vec::new()),
            notify_signal: Notify::new(),
            counter: Arc::new(Counter {
                value: AtomicI64::new(0),
            }),
            counter_factory: counter_factory(),
        })
    }
}

pub fn test_service_factory() -> Arc<SkeletonFactory> {
    SkeletonFactory::builder(test_service_info())
        .method("echo", |_target, mut args| async move {
            Ok(args.remove(0))
        })
        .method("notify", |target, args| async move {
            let service = target
                .as_any()
                .downcast_ref::<TestService>()
                .expect("service target");
            let n = args[0].as_int()?;
            if n < 0 {
                return Err(remi_core::SessionError::Application(ThrowableStub::new(
                    "test::NegativeNotify",
                    Some(format!("refusing {n}")),
                )));
            }
            service.notified.lock().push(n);
            service.notify_signal.notify_one();
            Ok(Value::Null)
        })
        .method("fail", |_target, mut args| async move {
            let message = args.remove(0).into_str()?;
            Err(remi_core::SessionError::Application(
                ThrowableStub::new("test::InvalidState", Some(message))
                    .with_frame(StackFrame::new("test::Service", "fail").at("service.rs", 42)),
            ))
        })
        .method("create", |target, _args| async move {
            let service = target
                .as_any()
                .downcast_ref::<TestService>()
                .expect("service target");
            Ok(Value::Remote(RemoteRef::local(
                Arc::clone(&service.counter) as Arc<dyn remi_core::RemoteObject>,
                Arc::clone(&service.counter_factory),
            )))
        })
        .method("call_me", |_target, mut args| async move {
            let callback = args.remove(0).into_remote()?.into_stub()?;
            let reply = callback.invoke(0, Vec::new()).await?;
            Ok(Value::Int(reply.as_int()? + 1))
        })
        .pipe_method("stream_sum", |_target, args, mut channel| async move {
            let count = args[0].as_int()?;
            let mut sum: i64 = 0;
            {
                let input = channel.reader()?;
                for _ in 0..count {
                    sum += i64::from(input.read_int().await?);
                }
            }
            let out = channel.writer()?;
            out.write_long(sum);
            out.flush().await?;
            channel.close();
            Ok(())
        })
        .build()
        .expect("test service factory")
}

/// A ready-to-use pair: the server binds a [`TestService`] as `"service"`.
pub async fn service_pair() -> (Session, Session, Arc<TestService>) {
    let (client, server) = session_pair().await;
    let service = TestService::new();
    server.bind(
        "service",
        Arc::clone(&service) as Arc<dyn remi_core::RemoteObject>,
        &test_service_factory(),
    );
    (client, server, service)
}
