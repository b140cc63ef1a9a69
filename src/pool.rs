use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::connection::{dial, Channel, Connection};
use crate::{lock, Error, Result};

/// Identifies the logical caller on whose behalf leases are taken. Blocking leases for the same
/// context are handed out one at a time.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ContextId(Uuid);

impl ContextId {
    pub fn new() -> ContextId {
        ContextId(Uuid::new_v4())
    }
}

impl Default for ContextId {
    fn default() -> Self {
        ContextId::new()
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Acquire {
    /// Waits until the context's previous blocking lease has been released.
    Blocking(ContextId),
    /// Takes the next available channel regardless of what else the caller holds.
    NonBlocking,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PoolStatus {
    pub idle: usize,
    pub leased: usize,
    pub max_size: usize,
}

/// Bounded pool of channels to one server, database and credential.
///
/// Channels are dialed lazily and handshaken once. A leased [`Connection`] hands its channel
/// back when it is closed, or as soon as its last outstanding reply has been dispatched.
#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    config: Config,
    idle: Mutex<VecDeque<Arc<Channel>>>,
    capacity: Arc<Semaphore>,
    serial: Mutex<HashMap<ContextId, Arc<AsyncMutex<()>>>>,
}

impl Pool {
    pub fn new(config: Config) -> Pool {
        let capacity = Arc::new(Semaphore::new(config.max_size));
        Pool {
            inner: Arc::new(PoolInner {
                config,
                idle: Mutex::new(VecDeque::new()),
                capacity,
                serial: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Leases a handshaken connection, reusing an idle channel when one is open.
    #[instrument(skip(self), fields(addr = %self.inner.config.addr()))]
    pub async fn acquire(&self, mode: Acquire) -> Result<Connection> {
        let lease = self.wait_for_lease(mode).await?;

        let channel = match self.pop_idle() {
            Some(channel) => channel,
            None => {
                let stream = dial(&self.inner.config).await?;
                let channel = Channel::open(stream, &self.inner.config, true);
                info!(channel_id = %channel.id, "opened pooled channel");
                channel
            }
        };

        let mut conn = Connection::new(channel, Some(lease));
        if let Err(err) = conn.handshake(&self.inner.config).await {
            warn!(%err, "handshake failed, discarding channel");
            conn.discard_channel();
            return Err(err);
        }

        Ok(conn)
    }

    pub fn status(&self) -> PoolStatus {
        let idle = lock(&self.inner.idle)
            .iter()
            .filter(|channel| !channel.is_closed())
            .count();
        let max_size = self.inner.config.max_size;

        PoolStatus {
            idle,
            leased: max_size.saturating_sub(self.inner.capacity.available_permits()),
            max_size,
        }
    }

    async fn wait_for_lease(&self, mode: Acquire) -> Result<Lease> {
        let wait = async {
            let serial = match mode {
                Acquire::Blocking(id) => {
                    let guard = self.serial_lock(id).lock_owned().await;
                    Some(Serial {
                        inner: self.inner.clone(),
                        id,
                        guard: Some(guard),
                    })
                }
                Acquire::NonBlocking => None,
            };

            let permit = self
                .inner
                .capacity
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| Error::state("pool is closed"))?;

            Ok::<_, Error>(Lease {
                pool: self.clone(),
                _permit: permit,
                _serial: serial,
            })
        };

        match self.inner.config.acquire_timeout {
            Some(timeout) => tokio::time::timeout(timeout, wait)
                .await
                .map_err(|_| Error::PoolTimeout)?,
            None => wait.await,
        }
    }

    fn serial_lock(&self, id: ContextId) -> Arc<AsyncMutex<()>> {
        lock(&self.inner.serial).entry(id).or_default().clone()
    }

    fn pop_idle(&self) -> Option<Arc<Channel>> {
        let mut idle = lock(&self.inner.idle);
        while let Some(channel) = idle.pop_front() {
            if !channel.is_closed() {
                return Some(channel);
            }
            debug!(channel_id = %channel.id, "dropping closed idle channel");
        }
        None
    }
}

/// Capacity held by one leased connection: a pool permit and, for blocking leases, the
/// context's serialization guard. Both are released on drop.
pub(crate) struct Lease {
    pool: Pool,
    _permit: OwnedSemaphorePermit,
    _serial: Option<Serial>,
}

impl Lease {
    /// Puts `channel` back on the idle list, then releases the lease.
    pub(crate) fn finish(self, channel: Arc<Channel>) {
        if channel.is_closed() {
            return;
        }
        debug!(channel_id = %channel.id, "channel returned to the pool");
        lock(&self.pool.inner.idle).push_back(channel);
    }
}

struct Serial {
    inner: Arc<PoolInner>,
    id: ContextId,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for Serial {
    fn drop(&mut self) {
        drop(self.guard.take());

        let mut serial = lock(&self.inner.serial);
        if serial
            .get(&self.id)
            .is_some_and(|mutex| Arc::strong_count(mutex) == 1)
        {
            serial.remove(&self.id);
        }
    }
}
