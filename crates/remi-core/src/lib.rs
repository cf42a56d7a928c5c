//! Bidirectional remote method invocation runtime
//!
//! Two processes share one connection-oriented transport and expose typed
//! remote objects to one another; each side is simultaneously client and
//! server. Invocations may be synchronous (request/reply with failure
//! reconstruction), asynchronous (fire-and-forget), or open a
//! caller-driven pipe on the invocation channel.
//!
//! # Architecture
//!
//! - A [`Session`] owns everything: the channel [`Broker`] over one
//!   multiplexed transport, the per-session [`Registry`] of exported and
//!   imported objects, the bootstrap skeleton and the distributed-GC
//!   driver.
//! - Each remote interface is described by a [`RemoteInfo`] built at
//!   registration time; a [`SkeletonFactory`] turns it into a dispatch
//!   table, and imported references materialize as shared [`Stub`]s.
//! - User object payloads go through a pluggable object codec
//!   ([`remi_wire::ObjectCodec`]); the runtime only frames them.
//!
//! # Server
//!
//! ```no_run
//! use remi_core::{ParamKind, RemoteInfo, RemoteParameter, Session, SessionConfig, SkeletonFactory};
//! use remi_wire::BasicCodec;
//! use std::sync::Arc;
//!
//! struct EchoService;
//!
//! #[tokio::main]
//! async fn main() -> remi_core::Result<()> {
//!     let info = RemoteInfo::builder("demo::Echo")
//!         .method("echo")
//!         .param(RemoteParameter::new(ParamKind::Str, "String"))
//!         .returns(RemoteParameter::new(ParamKind::Str, "String"))
//!         .done()
//!         .build();
//!     let factory = SkeletonFactory::builder(info)
//!         .method("echo", |_target, mut args| async move { Ok(args.remove(0)) })
//!         .build()?;
//!
//!     let listener = tokio::net::TcpListener::bind("127.0.0.1:9920").await?;
//!     let (stream, _peer) = listener.accept().await?;
//!     let session = Session::accept(stream, Arc::new(BasicCodec), SessionConfig::default()).await?;
//!     session.bind("echo", Arc::new(EchoService), &factory);
//!
//!     // Serve until the peer shuts the session down.
//!     loop {
//!         tokio::time::sleep(std::time::Duration::from_secs(1)).await;
//!         if session.is_closed() {
//!             break;
//!         }
//!     }
//!     Ok(())
//! }
//! ```
//!
//! # Client
//!
//! ```no_run
//! use remi_core::{Session, SessionConfig, Value};
//! use remi_wire::BasicCodec;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> remi_core::Result<()> {
//!     let stream = tokio::net::TcpStream::connect("127.0.0.1:9920").await?;
//!     let session = Session::connect(stream, Arc::new(BasicCodec), SessionConfig::default()).await?;
//!
//!     let echo = session.lookup("echo").await?;
//!     let reply = echo.invoke(0, vec![Value::from("hello")]).await?;
//!     assert_eq!(reply.into_str()?, "hello");
//!
//!     session.shutdown().await?;
//!     Ok(())
//! }
//! ```

pub mod broker;
pub mod channel;
pub mod dgc;
pub mod dispatch;
pub mod error;
mod failure;
pub mod ident;
pub mod info;
pub mod io;
pub mod mux;
pub mod registry;
pub mod session;
pub mod value;

pub use broker::Broker;
pub use channel::InvocationChannel;
pub use dispatch::{
    MethodFuture, MethodHandler, PipeFuture, PipeHandler, RemoteObject, Skeleton,
    SkeletonFactory, SkeletonFactoryBuilder, SkeletonSupport, Stub, StubSupport,
};
pub use error::{Result, SessionError};
pub use ident::{Identifier, VersionedIdentifier};
pub use info::{
    ParamKind, RemoteInfo, RemoteInfoBuilder, RemoteMethod, RemoteMethodBuilder, RemoteParameter,
    DEFAULT_REMOTE_FAILURE,
};
pub use io::{InvocationInput, InvocationOutput, ReplyStatus};
pub use registry::Registry;
pub use session::{Session, SessionConfig};
pub use value::{RemoteRef, Value};

// Re-export the wire-level types that appear in this crate's public API.
pub use remi_wire::{BasicCodec, CodecObject, ObjectCodec, StackFrame, ThrowableStub};
