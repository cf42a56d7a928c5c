//! Distributed garbage collection
//!
//! Each side tracks the set of imported identifiers it still considers
//! reachable. Periodically it reports a compact diff to the peer through
//! the bootstrap skeleton: additions, and removals carrying the observed
//! remote version. The peer drops each removed export at that version; a
//! re-export in flight has already bumped the version, so the stale drop is
//! ignored and the reference survives.

use crate::error::{Result, SessionError};
use crate::ident::Identifier;
use crate::session::SessionCore;
use bytes::{Buf, BufMut, BytesMut};
use remi_wire::varint::{get_var_uint, put_var_uint};
use std::sync::Weak;
use std::time::Duration;
use tracing::{debug, trace};

/// Encode the additions half of a live-set diff.
pub fn encode_added(ids: &[Identifier]) -> Vec<u8> {
    let mut buf = BytesMut::new();
    put_var_uint(&mut buf, ids.len() as u32);
    for id in ids {
        id.encode(&mut buf);
    }
    buf.to_vec()
}

pub fn decode_added(mut bytes: &[u8]) -> Result<Vec<Identifier>> {
    let count = get_var_uint(&mut bytes)? as usize;
    let mut ids = Vec::new();
    for _ in 0..count {
        ids.push(Identifier::decode(&mut bytes)?);
    }
    Ok(ids)
}

/// Encode the removals half: each entry is the identifier plus the highest
/// version this side observed for it.
pub fn encode_removed(entries: &[(Identifier, u32)]) -> Vec<u8> {
    let mut buf = BytesMut::new();
    put_var_uint(&mut buf, entries.len() as u32);
    for (id, version) in entries {
        id.encode(&mut buf);
        buf.put_u32(*version);
    }
    buf.to_vec()
}

pub fn decode_removed(mut bytes: &[u8]) -> Result<Vec<(Identifier, u32)>> {
    let count = get_var_uint(&mut bytes)? as usize;
    let mut entries = Vec::new();
    for _ in 0..count {
        let id = Identifier::decode(&mut bytes)?;
        if bytes.remaining() < 4 {
            return Err(SessionError::Eof);
        }
        entries.push((id, bytes.get_u32()));
    }
    Ok(entries)
}

/// Periodic reference-exchange driver. Exits when the session goes away or
/// closes.
pub(crate) async fn dgc_loop(core: Weak<SessionCore>, period: Duration) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick fires immediately; skip it so a fresh session does not
    // ping before it has imported anything.
    interval.tick().await;
    loop {
        interval.tick().await;
        let Some(core) = core.upgrade() else { break };
        if core.is_closed() {
            break;
        }
        match core.dgc_round().await {
            Ok(()) => trace!("reference exchange round complete"),
            Err(e) if e.is_connection_closed() => break,
            Err(e) => debug!("reference exchange failed: {e}"),
        }
    }
}
