//! Channel broker
//!
//! The broker owns the session's multiplexed transport and a pool of idle
//! invocation channels for outbound reuse. `connect` prefers a pooled
//! channel and otherwise opens a new one, bounded by the channel limiter;
//! `accept` surfaces channels opened by the peer; `recycle` returns a
//! channel after its reply has been fully consumed. Closing the broker is
//! terminal: pooled channels close, later acquires and parked accepters
//! fail with `BrokerClosed`.

use crate::channel::{ChannelCtx, ChannelDefaults, InvocationChannel};
use crate::error::{Result, SessionError};
use crate::mux::Multiplexer;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Pool and capacity settings for one broker.
#[derive(Clone, Debug)]
pub(crate) struct BrokerConfig {
    pub pool_capacity: usize,
    pub max_channels: usize,
    pub idle_timeout: Duration,
    pub defaults: ChannelDefaults,
}

struct PooledChannel {
    channel: InvocationChannel,
    pooled_at: Instant,
}

/// Pool of invocation channels over one transport.
pub struct Broker {
    mux: Multiplexer,
    pool: Mutex<VecDeque<PooledChannel>>,
    limiter: Arc<tokio::sync::Semaphore>,
    closed: AtomicBool,
    opened: AtomicU64,
    config: BrokerConfig,
    ctx: ChannelCtx,
}

impl Broker {
    pub(crate) fn new(mux: Multiplexer, config: BrokerConfig, ctx: ChannelCtx) -> Self {
        Self {
            mux,
            pool: Mutex::new(VecDeque::new()),
            limiter: Arc::new(tokio::sync::Semaphore::new(config.max_channels)),
            closed: AtomicBool::new(false),
            opened: AtomicU64::new(0),
            config,
            ctx,
        }
    }

    /// A channel ready for a new outbound invocation: pooled if possible,
    /// freshly opened otherwise. Suspends when the pool is empty and the
    /// channel limit has been reached.
    pub async fn connect(&self) -> Result<InvocationChannel> {
        if self.is_closed() {
            return Err(SessionError::BrokerClosed);
        }
        loop {
            let pooled = self.pool.lock().pop_front();
            match pooled {
                None => break,
                Some(p) => {
                    if !p.channel.is_open() || p.pooled_at.elapsed() > self.config.idle_timeout {
                        // Idle expiry is transparent to the caller.
                        trace!(channel = p.channel.id(), "dropping idle pooled channel");
                        continue;
                    }
                    trace!(channel = p.channel.id(), "reusing pooled channel");
                    return Ok(p.channel);
                }
            }
        }

        let permit = Arc::clone(&self.limiter)
            .acquire_owned()
            .await
            .map_err(|_| SessionError::BrokerClosed)?;
        if self.is_closed() {
            return Err(SessionError::BrokerClosed);
        }
        let mux_channel = self.mux.open().await?;
        self.opened.fetch_add(1, Ordering::Relaxed);
        trace!(channel = mux_channel.id, "opened fresh channel");
        Ok(InvocationChannel::connected(
            mux_channel,
            self.ctx.clone(),
            &self.config.defaults,
            Some(permit),
        ))
    }

    /// Wait for a channel with an incoming invocation from the peer.
    pub async fn accept(&self) -> Result<InvocationChannel> {
        if self.is_closed() {
            return Err(SessionError::BrokerClosed);
        }
        let mux_channel = self.mux.accept().await?;
        trace!(channel = mux_channel.id, "accepted peer channel");
        Ok(InvocationChannel::connected(
            mux_channel,
            self.ctx.clone(),
            &self.config.defaults,
            None,
        ))
    }

    /// Return a channel to the pool for future outbound reuse. Closed or
    /// over-capacity channels are discarded instead; a discarded channel
    /// can never reappear in the pool.
    pub fn recycle(&self, channel: InvocationChannel) {
        if self.is_closed() || !channel.is_open() {
            return;
        }
        let mut pool = self.pool.lock();
        if pool.len() >= self.config.pool_capacity {
            trace!(channel = channel.id(), "pool full, discarding channel");
            return;
        }
        trace!(channel = channel.id(), "recycling channel");
        pool.push_back(PooledChannel {
            channel,
            pooled_at: Instant::now(),
        });
    }

    /// Close the broker: terminal for every subsequent operation.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("closing broker");
        self.limiter.close();
        self.pool.lock().clear();
        self.mux.close();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst) || self.mux.is_closed()
    }

    /// Number of physical channels this broker has opened so far.
    pub fn channels_opened(&self) -> u64 {
        self.opened.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mux::MuxRole;
    use remi_wire::BasicCodec;
    use std::sync::Weak;

    fn config(pool_capacity: usize, max_channels: usize) -> BrokerConfig {
        BrokerConfig {
            pool_capacity,
            max_channels,
            idle_timeout: Duration::from_secs(60),
            defaults: ChannelDefaults {
                read_timeout: None,
                write_timeout: None,
                local_address: None,
                remote_address: None,
            },
        }
    }

    fn ctx() -> ChannelCtx {
        ChannelCtx {
            core: Weak::new(),
            codec: Arc::new(BasicCodec),
        }
    }

    fn broker_pair(pool: usize, max: usize) -> (Broker, Broker) {
        let (a, b) = tokio::io::duplex(256 * 1024);
        (
            Broker::new(Multiplexer::new(a, MuxRole::Connect), config(pool, max), ctx()),
            Broker::new(Multiplexer::new(b, MuxRole::Accept), config(pool, max), ctx()),
        )
    }

    #[tokio::test]
    async fn test_connect_prefers_pooled_channel() {
        let (client, _server) = broker_pair(8, 64);

        let first = client.connect().await.unwrap();
        let first_id = first.id();
        client.recycle(first);

        let second = client.connect().await.unwrap();
        assert_eq!(second.id(), first_id);
    }

    #[tokio::test]
    async fn test_closed_channel_is_not_pooled() {
        let (client, _server) = broker_pair(8, 64);

        let mut ch = client.connect().await.unwrap();
        let id = ch.id();
        ch.close();
        client.recycle(ch);

        let next = client.connect().await.unwrap();
        assert_ne!(next.id(), id);
    }

    #[tokio::test]
    async fn test_pool_capacity_bound() {
        let (client, _server) = broker_pair(1, 64);

        let one = client.connect().await.unwrap();
        let two = client.connect().await.unwrap();
        let one_id = one.id();
        client.recycle(one);
        client.recycle(two); // over capacity, discarded

        let next = client.connect().await.unwrap();
        assert_eq!(next.id(), one_id);
        let fresh = client.connect().await.unwrap();
        assert_ne!(fresh.id(), one_id);
    }

    #[tokio::test]
    async fn test_idle_channels_expire() {
        let mut short = config(8, 64);
        short.idle_timeout = Duration::from_millis(10);
        let (a, _b) = tokio::io::duplex(64 * 1024);
        let client = Broker::new(Multiplexer::new(a, MuxRole::Connect), short, ctx());

        let ch = client.connect().await.unwrap();
        let id = ch.id();
        client.recycle(ch);
        tokio::time::sleep(Duration::from_millis(30)).await;

        let next = client.connect().await.unwrap();
        assert_ne!(next.id(), id);
        drop(client);
    }

    #[tokio::test]
    async fn test_close_is_terminal() {
        let (client, server) = broker_pair(8, 64);
        client.close();

        assert!(matches!(
            client.connect().await,
            Err(SessionError::BrokerClosed)
        ));
        assert!(matches!(
            client.accept().await,
            Err(SessionError::BrokerClosed)
        ));

        // The peer observes the transport going away on its next accept.
        assert!(matches!(
            server.accept().await,
            Err(SessionError::BrokerClosed)
        ));
    }

    #[tokio::test]
    async fn test_channel_limit_suspends_connect() {
        let (client, _server) = broker_pair(8, 1);

        let held = client.connect().await.unwrap();
        let blocked =
            tokio::time::timeout(Duration::from_millis(50), client.connect()).await;
        assert!(blocked.is_err(), "connect should park at the channel limit");

        drop(held); // releases the permit
        let acquired =
            tokio::time::timeout(Duration::from_millis(500), client.connect()).await;
        assert!(acquired.is_ok());
    }
}
