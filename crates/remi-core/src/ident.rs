//! Session-stable identifiers
//!
//! Every exported object, remote interface and remote method is named by an
//! [`Identifier`]: an opaque 64-bit value drawn from a cryptographically
//! strong random source so identifiers cannot be guessed by a peer. The wire
//! encoding is eight bytes, big-endian.
//!
//! A [`VersionedIdentifier`] pairs an identifier with two monotonic
//! counters used by distributed garbage collection. `local_version` counts
//! how many times this side has transmitted the identifier; the peer records
//! the highest value it has seen. `remote_version` is the highest count the
//! peer has acknowledged back. A reference is stale, and its export eligible
//! for reclamation, once the acknowledged `remote_version` has caught up
//! with `local_version`.

use crate::error::{Result, SessionError};
use bytes::{Buf, BufMut};
use rand::{rngs::OsRng, RngCore};
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

/// Opaque 64-bit session-stable identity.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Identifier(u64);

impl Identifier {
    /// Size of the wire encoding in bytes.
    pub const SIZE: usize = 8;

    /// The well-known identifier of the session bootstrap object.
    pub const BOOTSTRAP: Identifier = Identifier(0);

    // Values below this are reserved for well-known protocol objects and
    // are never produced by `generate`.
    pub(crate) const RESERVED_LIMIT: u64 = 16;

    /// Construct a reserved identifier for a well-known protocol object.
    pub(crate) const fn reserved(value: u64) -> Self {
        assert!(value < Self::RESERVED_LIMIT);
        Self(value)
    }

    /// Generate a fresh identifier from the OS random source.
    pub fn generate() -> Self {
        let mut value = OsRng.next_u64();
        while value < Self::RESERVED_LIMIT {
            value = OsRng.next_u64();
        }
        Self(value)
    }

    pub fn to_u64(self) -> u64 {
        self.0
    }

    pub fn from_u64(value: u64) -> Self {
        Self(value)
    }

    /// Encode as eight big-endian bytes.
    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u64(self.0);
    }

    /// Decode from eight big-endian bytes.
    pub fn decode<B: Buf>(buf: &mut B) -> Result<Self> {
        if buf.remaining() < Self::SIZE {
            return Err(SessionError::Eof);
        }
        Ok(Self(buf.get_u64()))
    }
}

impl fmt::Debug for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Identifier({:016x})", self.0)
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// An identifier plus the monotonic version counters driving distributed GC.
///
/// Shared via `Arc`; there is one canonical instance per identifier per
/// session, referenced by every stub or export entry for it.
#[derive(Debug)]
pub struct VersionedIdentifier {
    id: Identifier,
    local_version: AtomicU32,
    remote_version: AtomicU32,
}

impl VersionedIdentifier {
    pub fn new(id: Identifier) -> Self {
        Self {
            id,
            local_version: AtomicU32::new(0),
            remote_version: AtomicU32::new(0),
        }
    }

    pub fn id(&self) -> Identifier {
        self.id
    }

    /// Bump the transmit counter and return the new version. Called once
    /// per marshalling of this identifier.
    pub fn next_local_version(&self) -> u32 {
        self.local_version.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn local_version(&self) -> u32 {
        self.local_version.load(Ordering::SeqCst)
    }

    /// Record the highest version the peer has reported. Monotonic.
    pub fn update_remote_version(&self, version: u32) {
        self.remote_version.fetch_max(version, Ordering::SeqCst);
    }

    pub fn remote_version(&self) -> u32 {
        self.remote_version.load(Ordering::SeqCst)
    }

    /// True once the peer has acknowledged every transmission of this
    /// identifier. A stale export may then be reclaimed.
    pub fn is_acknowledged(&self) -> bool {
        self.remote_version() >= self.local_version()
    }
}

impl fmt::Display for VersionedIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}@{}/{}",
            self.id,
            self.local_version(),
            self.remote_version()
        )
    }
}
