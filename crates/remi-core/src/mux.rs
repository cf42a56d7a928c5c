//! Channel multiplexing over one byte transport
//!
//! All invocation channels of a session share a single connection-oriented
//! stream. Each logical channel is a pair of independent byte flows carried
//! in frames:
//!
//! ```text
//! channel_id: u32 (BE) | opcode: u8 | length: u32 (BE) | payload
//! ```
//!
//! Opcodes are `OPEN` (create the peer-side channel and queue it for
//! accept), `DATA` (append to the channel's inbound stream) and `CLOSE`
//! (end the inbound stream). The connecting side allocates odd channel ids,
//! the accepting side even ids; id 0 is never used.
//!
//! One writer task serializes all outbound frames; one reader task parses
//! inbound frames and routes them to per-channel queues. Frame-level
//! corruption is fatal to the whole transport, unlike corruption inside a
//! channel's payload stream which only kills that channel.

use crate::error::{Result, SessionError};
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

const OP_OPEN: u8 = 1;
const OP_DATA: u8 = 2;
const OP_CLOSE: u8 = 3;

/// Maximum payload carried by one frame.
pub const MAX_FRAME_PAYLOAD: usize = 64 * 1024;

const HEADER_SIZE: usize = 9;
const INBOUND_QUEUE: usize = 64;
const ACCEPT_QUEUE: usize = 64;
const OUTBOUND_QUEUE: usize = 256;

/// Which side of the transport this multiplexer sits on. Decides channel id
/// parity so both sides can allocate without a handshake.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum MuxRole {
    Connect,
    Accept,
}

pub(crate) struct Frame {
    channel: u32,
    op: u8,
    payload: Bytes,
}

/// One logical channel drawn from the multiplexer, split into halves.
pub(crate) struct MuxChannel {
    pub id: u32,
    pub reader: MuxReader,
    pub writer: MuxWriter,
}

/// Inbound half: an ordered stream of payload chunks.
pub(crate) struct MuxReader {
    inbound: mpsc::Receiver<Bytes>,
}

impl MuxReader {
    /// Next inbound chunk, or `None` once the channel is closed and drained.
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.inbound.recv().await
    }
}

/// Outbound half: chunks payloads into DATA frames.
pub(crate) struct MuxWriter {
    id: u32,
    outbound: mpsc::Sender<Frame>,
    shared: Weak<MuxShared>,
    closed: bool,
}

impl MuxWriter {
    pub async fn send_data(&self, payload: Bytes) -> Result<()> {
        if self.closed {
            return Err(SessionError::ChannelClosed);
        }
        let mut rest = payload;
        while !rest.is_empty() {
            let chunk = if rest.len() > MAX_FRAME_PAYLOAD {
                rest.split_to(MAX_FRAME_PAYLOAD)
            } else {
                std::mem::take(&mut rest)
            };
            self.outbound
                .send(Frame {
                    channel: self.id,
                    op: OP_DATA,
                    payload: chunk,
                })
                .await
                .map_err(|_| SessionError::ChannelClosed)?;
        }
        Ok(())
    }

    /// Close this channel. Idempotent; the CLOSE frame is best-effort.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let _ = self.outbound.try_send(Frame {
            channel: self.id,
            op: OP_CLOSE,
            payload: Bytes::new(),
        });
        if let Some(shared) = self.shared.upgrade() {
            shared.routes.lock().remove(&self.id);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

impl Drop for MuxWriter {
    fn drop(&mut self) {
        self.close();
    }
}

struct MuxShared {
    outbound: mpsc::Sender<Frame>,
    routes: Mutex<HashMap<u32, mpsc::Sender<Bytes>>>,
    next_id: AtomicU32,
    closed: AtomicBool,
}

/// Pool of logical channels over one transport stream.
pub(crate) struct Multiplexer {
    shared: Arc<MuxShared>,
    accept_rx: tokio::sync::Mutex<mpsc::Receiver<MuxChannel>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Multiplexer {
    pub fn new<S>(stream: S, role: MuxRole) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let (out_tx, out_rx) = mpsc::channel(OUTBOUND_QUEUE);
        let (accept_tx, accept_rx) = mpsc::channel(ACCEPT_QUEUE);

        let shared = Arc::new(MuxShared {
            outbound: out_tx,
            routes: Mutex::new(HashMap::new()),
            next_id: AtomicU32::new(match role {
                MuxRole::Connect => 1,
                MuxRole::Accept => 2,
            }),
            closed: AtomicBool::new(false),
        });

        let reader = tokio::spawn(read_loop(read_half, Arc::clone(&shared), accept_tx));
        let writer = tokio::spawn(write_loop(write_half, out_rx, Arc::clone(&shared)));

        Self {
            shared,
            accept_rx: tokio::sync::Mutex::new(accept_rx),
            tasks: Mutex::new(vec![reader, writer]),
        }
    }

    /// Open a new outbound channel.
    pub async fn open(&self) -> Result<MuxChannel> {
        if self.is_closed() {
            return Err(SessionError::BrokerClosed);
        }
        let id = self.shared.next_id.fetch_add(2, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(INBOUND_QUEUE);
        self.shared.routes.lock().insert(id, tx);

        let open = Frame {
            channel: id,
            op: OP_OPEN,
            payload: Bytes::new(),
        };
        if self.shared.outbound.send(open).await.is_err() {
            self.shared.routes.lock().remove(&id);
            return Err(SessionError::BrokerClosed);
        }
        trace!(channel = id, "opened outbound channel");
        Ok(MuxChannel {
            id,
            reader: MuxReader { inbound: rx },
            writer: MuxWriter {
                id,
                outbound: self.shared.outbound.clone(),
                shared: Arc::downgrade(&self.shared),
                closed: false,
            },
        })
    }

    /// Wait for a channel opened by the peer.
    pub async fn accept(&self) -> Result<MuxChannel> {
        let mut rx = self.accept_rx.lock().await;
        rx.recv().await.ok_or(SessionError::BrokerClosed)
    }

    /// Tear down the transport. All channels fail, accepters drain.
    pub fn close(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("closing multiplexer");
        self.shared.routes.lock().clear();
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }
}

impl Drop for Multiplexer {
    fn drop(&mut self) {
        self.close();
    }
}

async fn read_loop<R>(
    mut reader: ReadHalf<R>,
    shared: Arc<MuxShared>,
    accept_tx: mpsc::Sender<MuxChannel>,
) where
    R: AsyncRead + AsyncWrite + Send + 'static,
{
    let result: Result<()> = async {
        let mut header = [0u8; HEADER_SIZE];
        loop {
            if let Err(e) = reader.read_exact(&mut header).await {
                return if e.kind() == std::io::ErrorKind::UnexpectedEof {
                    Ok(())
                } else {
                    Err(e.into())
                };
            }
            let channel = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
            let op = header[4];
            let len = u32::from_be_bytes([header[5], header[6], header[7], header[8]]) as usize;
            if len > MAX_FRAME_PAYLOAD {
                return Err(SessionError::Corrupted(format!(
                    "frame payload of {len} bytes exceeds maximum {MAX_FRAME_PAYLOAD}"
                )));
            }
            match op {
                OP_OPEN => {
                    if len != 0 {
                        return Err(SessionError::Corrupted("OPEN frame with payload".into()));
                    }
                    let (tx, rx) = mpsc::channel(INBOUND_QUEUE);
                    shared.routes.lock().insert(channel, tx);
                    let ch = MuxChannel {
                        id: channel,
                        reader: MuxReader { inbound: rx },
                        writer: MuxWriter {
                            id: channel,
                            outbound: shared.outbound.clone(),
                            shared: Arc::downgrade(&shared),
                            closed: false,
                        },
                    };
                    trace!(channel, "accepted inbound channel");
                    if accept_tx.send(ch).await.is_err() {
                        return Ok(());
                    }
                }
                OP_DATA => {
                    let mut payload = vec![0u8; len];
                    reader.read_exact(&mut payload).await?;
                    let route = shared.routes.lock().get(&channel).cloned();
                    match route {
                        Some(tx) => {
                            if tx.send(Bytes::from(payload)).await.is_err() {
                                shared.routes.lock().remove(&channel);
                            }
                        }
                        None => trace!(channel, len, "dropping data for unknown channel"),
                    }
                }
                OP_CLOSE => {
                    trace!(channel, "peer closed channel");
                    shared.routes.lock().remove(&channel);
                }
                other => {
                    return Err(SessionError::Corrupted(format!(
                        "unknown frame opcode {other}"
                    )));
                }
            }
        }
    }
    .await;

    match result {
        Ok(()) => debug!("transport closed by peer"),
        Err(e) => warn!("transport read failed: {e}"),
    }
    shared.closed.store(true, Ordering::SeqCst);
    shared.routes.lock().clear();
}

async fn write_loop<W>(
    mut writer: WriteHalf<W>,
    mut rx: mpsc::Receiver<Frame>,
    shared: Arc<MuxShared>,
) where
    W: AsyncRead + AsyncWrite + Send + 'static,
{
    let mut header = [0u8; HEADER_SIZE];
    'outer: while let Some(frame) = rx.recv().await {
        let mut next = Some(frame);
        // Batch every queued frame before flushing.
        while let Some(frame) = next {
            header[0..4].copy_from_slice(&frame.channel.to_be_bytes());
            header[4] = frame.op;
            header[5..9].copy_from_slice(&(frame.payload.len() as u32).to_be_bytes());
            if writer.write_all(&header).await.is_err()
                || writer.write_all(&frame.payload).await.is_err()
            {
                warn!("transport write failed");
                break 'outer;
            }
            next = rx.try_recv().ok();
        }
        if let Err(e) = writer.flush().await {
            warn!("transport flush failed: {e}");
            break;
        }
    }
    shared.closed.store(true, Ordering::SeqCst);
    shared.routes.lock().clear();
}
