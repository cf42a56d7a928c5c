//! Failure reconstruction
//!
//! A failure crosses the session as a portable cause chain: `NOT_OK`, a
//! var-uint chain length, one `(class name, message, stack frames)` triple
//! per cause ordered root first, then the terminal throwable as a full
//! codec object. The receiving side prefers the terminal object; when it
//! cannot be decoded, a surrogate chain is built from the preserved triples
//! so the caller always observes a non-null cause.
//!
//! After reconstruction the caller's own frame is stitched onto the remote
//! trace. The stub frame itself never appears: the stitched frame is the
//! stub's call site, captured via `#[track_caller]`.

use crate::error::SessionError;
use remi_wire::{StackFrame, ThrowableStub};
use std::panic::Location;

/// One preserved `(class name, message, stack trace)` triple.
pub(crate) struct ThrowableInfo {
    pub class_name: String,
    pub message: Option<String>,
    pub frames: Vec<StackFrame>,
}

/// Build the portable form of an error for a `NOT_OK` reply.
pub(crate) fn throwable_from_error(err: &SessionError) -> ThrowableStub {
    match err {
        SessionError::Application(stub) | SessionError::RemoteFailure(stub) => stub.clone(),
        SessionError::NoSuchObject(id) => ThrowableStub::new(
            "remi::NoSuchObject",
            Some(format!("no such object: {id}")),
        ),
        SessionError::NoSuchMethod(id) => ThrowableStub::new(
            "remi::NoSuchMethod",
            Some(format!("no such method: {id}")),
        ),
        SessionError::UnimplementedMethod(name) => ThrowableStub::new(
            "remi::UnimplementedMethod",
            Some(format!("unimplemented method: {name}")),
        ),
        other => ThrowableStub::new("remi::RemoteFailure", Some(other.to_string())),
    }
}

/// Build a surrogate chain from preserved triples, root first. Used when the
/// terminal throwable fails to deserialize.
pub(crate) fn surrogate_from_triples(mut triples: Vec<ThrowableInfo>) -> ThrowableStub {
    let mut chain: Option<ThrowableStub> = None;
    for info in triples.drain(..) {
        let mut stub = ThrowableStub::new(info.class_name, info.message);
        stub.frames = info.frames;
        stub.cause = chain.take().map(Box::new);
        chain = Some(stub);
    }
    chain.unwrap_or_else(|| {
        ThrowableStub::new("remi::RemoteFailure", Some("empty failure chain".into()))
    })
}

/// Stitch the local call site after the remote stack, producing the
/// throwable the caller observes.
pub(crate) fn stitch_local_trace(
    mut throwable: ThrowableStub,
    call_site: &'static Location<'static>,
) -> ThrowableStub {
    throwable.frames.push(local_frame(call_site));
    throwable
}

fn local_frame(location: &'static Location<'static>) -> StackFrame {
    StackFrame::new("<local>", "invoke").at(location.file(), location.line())
}
