//! Error types for the RMI runtime

use crate::ident::Identifier;
use remi_wire::{ThrowableStub, WireError};
use thiserror::Error;

/// Session error types
#[derive(Debug, Error)]
pub enum SessionError {
    /// End of stream before the current value was fully read.
    #[error("unexpected end of stream")]
    Eof,

    /// Illegal tag or byte sequence. Fails the channel, not the session.
    #[error("corrupted stream: {0}")]
    Corrupted(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A read or write deadline was exceeded. Terminal for the channel.
    #[error("invocation timed out")]
    Timeout,

    /// The identifier does not name an exported object on this side.
    #[error("no such object: {0}")]
    NoSuchObject(Identifier),

    /// The method identifier is not part of the dispatched interface.
    #[error("no such method: {0}")]
    NoSuchMethod(Identifier),

    /// The skeleton interface predates this method.
    #[error("unimplemented method: {0}")]
    UnimplementedMethod(String),

    /// A misconfigured dispatch table or interface description.
    #[error("invalid remote interface: {0}")]
    InvalidInterface(String),

    /// An asynchronous invocation failed on the callee. Reported through the
    /// session's error sink, never over the invocation channel.
    #[error("asynchronous invocation of {method} failed: {cause}")]
    AsynchronousInvocation {
        method: String,
        #[source]
        cause: Box<SessionError>,
    },

    /// A failure thrown by the remote side, reconstructed locally.
    #[error("remote failure: {0}")]
    RemoteFailure(ThrowableStub),

    /// An application-level failure to be carried over the wire.
    #[error("{0}")]
    Application(ThrowableStub),

    /// A value the object codec cannot marshal.
    #[error("value not serializable: {0}")]
    NotSerializable(String),

    /// The session's broker has shut down. Terminal.
    #[error("broker is closed")]
    BrokerClosed,

    /// Operation on the unconnected placeholder channel.
    #[error("channel is not connected")]
    NotConnected,

    /// Operation on a channel that has been closed.
    #[error("channel is closed")]
    ChannelClosed,
}

impl From<WireError> for SessionError {
    fn from(err: WireError) -> Self {
        match err {
            WireError::Eof => SessionError::Eof,
            WireError::Corrupted(msg) => SessionError::Corrupted(msg),
            WireError::NotSerializable(msg) => SessionError::NotSerializable(msg),
            WireError::Io(e) => SessionError::Io(e),
        }
    }
}

impl SessionError {
    /// Check if this error represents a normal connection close
    /// (EOF, peer shutdown, broker shutdown).
    pub fn is_connection_closed(&self) -> bool {
        match self {
            SessionError::Eof | SessionError::ChannelClosed | SessionError::BrokerClosed => true,
            SessionError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::UnexpectedEof
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
            ),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, SessionError>;
