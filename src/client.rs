use std::marker::PhantomData;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, instrument};

use crate::command::{cmd, Command};
use crate::config::Config;
use crate::connection::{Connection, ReplyFuture};
use crate::frame::Frame;
use crate::pool::{Acquire, ContextId, Pool};
use crate::pubsub::Subscriber;
use crate::reply::FromFrame;
use crate::{Error, Result};

/// Entry point: owns the pool and hands out execution contexts.
#[derive(Clone)]
pub struct Client {
    pool: Pool,
}

impl Client {
    pub fn new(config: Config) -> Client {
        Client {
            pool: Pool::new(config),
        }
    }

    pub fn open(url: &str) -> Result<Client> {
        Ok(Client::new(Config::from_url(url)?))
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    pub fn context(&self) -> Context {
        Context::new(self.pool.clone())
    }

    /// Subscribes a dedicated leased connection to `channels`. See [`Context::subscribe`].
    pub async fn subscribe(
        &self,
        channels: &[&str],
        subscriber: impl Subscriber,
    ) -> Result<Subscription> {
        self.context().subscribe(channels, subscriber).await
    }

    pub async fn psubscribe(
        &self,
        patterns: &[&str],
        subscriber: impl Subscriber,
    ) -> Result<Subscription> {
        self.context().psubscribe(patterns, subscriber).await
    }
}

/// Execution mode of a [`Context`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Mode {
    pub pipelining: bool,
    pub transactional: bool,
    /// Whether a direct submission waits for its reply.
    pub blocking_wait: bool,
}

impl Default for Mode {
    fn default() -> Self {
        Mode {
            pipelining: false,
            transactional: false,
            blocking_wait: true,
        }
    }
}

/// Outcome of [`Context::submit`].
pub enum Submitted<T> {
    Ready(T),
    /// The command is on the wire; the reply has not been waited for.
    Pending(Pending<T>),
    /// Buffered in a pipeline or queued in a transaction. Its result is delivered by
    /// [`Context::execute_pipeline`] or [`Context::exec`].
    Queued,
}

impl<T> Submitted<T> {
    pub fn is_queued(&self) -> bool {
        matches!(self, Submitted::Queued)
    }
}

/// Replies still to be awaited and converted.
pub struct Pending<T> {
    replies: Vec<ReplyFuture>,
    // A pipeline converts all of its replies as one array.
    batch: bool,
    timeout: Option<Duration>,
    _result: PhantomData<fn() -> T>,
}

impl<T: FromFrame> Pending<T> {
    fn new(replies: Vec<ReplyFuture>, batch: bool, timeout: Option<Duration>) -> Pending<T> {
        Pending {
            replies,
            batch,
            timeout,
            _result: PhantomData,
        }
    }

    /// Waits for every reply. The timeout bounds the whole wait, not each reply.
    pub async fn wait(self) -> Result<T> {
        let deadline = self.timeout.map(|timeout| Instant::now() + timeout);

        let mut frames = Vec::with_capacity(self.replies.len());
        for reply in self.replies {
            frames.push(reply.wait_until(deadline).await?);
        }

        let frame = if self.batch {
            Frame::Array(frames)
        } else {
            frames
                .pop()
                .ok_or_else(|| Error::state("no reply was submitted"))?
        };

        T::from_frame(frame)
    }
}

/// One logical caller. Routes commands according to its [`Mode`]: straight through a short
/// blocking lease, into the buffer of a held pipeline, or into a held transaction.
///
/// A context is used by one task at a time; give every concurrent task its own.
pub struct Context {
    pool: Pool,
    id: ContextId,
    mode: Mode,
    timeout: Option<Duration>,
    conn: Option<Connection>,
}

impl Context {
    fn new(pool: Pool) -> Context {
        Context {
            pool,
            id: ContextId::new(),
            mode: Mode::default(),
            timeout: None,
            conn: None,
        }
    }

    pub fn id(&self) -> ContextId {
        self.id
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn set_blocking_wait(&mut self, blocking_wait: bool) {
        self.mode.blocking_wait = blocking_wait;
    }

    /// Bounds how long a submission waits for its reply. `None` waits indefinitely.
    pub fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.timeout = timeout;
    }

    #[instrument(skip(self, command), fields(context = %self.id, command = %command.name()))]
    pub async fn submit<T: FromFrame>(&mut self, command: Command) -> Result<Submitted<T>> {
        if self.mode.pipelining {
            let result = self.held()?.write(&command);
            return self.or_reset(result).map(|_| Submitted::Queued);
        }

        if self.mode.transactional {
            let conn = self.held()?;
            let result = match conn.write(&command) {
                // QUEUED acknowledgements carry nothing; the results come with EXEC.
                Ok(()) => conn.flush().await.map(|_queued| ()),
                Err(err) => Err(err),
            };
            return self.or_reset(result).map(|_| Submitted::Queued);
        }

        let mut conn = self.pool.acquire(Acquire::Blocking(self.id)).await?;
        conn.write(&command)?;
        let replies = conn.flush().await?;
        // The channel returns to the pool as soon as the reply has been dispatched.
        conn.close();

        let pending = Pending::new(replies, false, self.timeout);
        if !self.mode.blocking_wait {
            return Ok(Submitted::Pending(pending));
        }
        pending.wait().await.map(Submitted::Ready)
    }

    /// Submits `command` and waits for its converted reply, whatever the blocking-wait setting.
    /// Refused while pipelining or in a transaction, where no reply is available yet.
    pub async fn query<T: FromFrame>(&mut self, command: Command) -> Result<T> {
        self.ensure_direct()?;

        match self.submit(command).await? {
            Submitted::Ready(value) => Ok(value),
            Submitted::Pending(pending) => pending.wait().await,
            Submitted::Queued => Err(Error::state(
                "command was queued, its result arrives with the pipeline or transaction",
            )),
        }
    }

    /// Leases a connection and buffers every following submission until
    /// [`Context::execute_pipeline`].
    pub async fn pipeline(&mut self) -> Result<()> {
        self.ensure_direct()?;

        let mut conn = self.pool.acquire(Acquire::Blocking(self.id)).await?;
        conn.begin_pipeline()?;

        self.conn = Some(conn);
        self.mode.pipelining = true;
        debug!(context = %self.id, "pipeline started");

        Ok(())
    }

    /// Flushes the pipeline in one write. The replies come back as one array, in submission
    /// order.
    pub async fn execute_pipeline(&mut self) -> Result<Submitted<Vec<Frame>>> {
        if !self.mode.pipelining {
            return Err(Error::state("no pipeline is open"));
        }
        self.mode.pipelining = false;
        let mut conn = self.take_held()?;

        let replies = conn.flush().await?;
        conn.close();

        let pending = Pending::new(replies, true, self.timeout);
        if !self.mode.blocking_wait {
            return Ok(Submitted::Pending(pending));
        }
        pending.wait().await.map(Submitted::Ready)
    }

    pub async fn multi(&mut self) -> Result<()> {
        self.ensure_direct()?;

        let mut conn = self.pool.acquire(Acquire::Blocking(self.id)).await?;
        conn.multi().await?;

        self.conn = Some(conn);
        self.mode.transactional = true;
        debug!(context = %self.id, "transaction started");

        Ok(())
    }

    /// Commits the transaction and returns one reply per queued command.
    pub async fn exec(&mut self) -> Result<Vec<Frame>> {
        let mut conn = self.end_transaction()?;
        let results = conn.exec().await;
        conn.close();
        results
    }

    pub async fn discard(&mut self) -> Result<()> {
        let mut conn = self.end_transaction()?;
        let result = conn.discard().await;
        conn.close();
        result
    }

    /// Leases a connection of its own and subscribes it to `channels`. The lease does not count
    /// as this context's blocking lease, so the context stays usable for ordinary commands.
    pub async fn subscribe(
        &self,
        channels: &[&str],
        subscriber: impl Subscriber,
    ) -> Result<Subscription> {
        self.open_subscription(cmd::subscribe(channels), subscriber)
            .await
    }

    pub async fn psubscribe(
        &self,
        patterns: &[&str],
        subscriber: impl Subscriber,
    ) -> Result<Subscription> {
        self.open_subscription(cmd::psubscribe(patterns), subscriber)
            .await
    }

    async fn open_subscription(
        &self,
        command: Command,
        subscriber: impl Subscriber,
    ) -> Result<Subscription> {
        if command.parts().len() < 2 {
            return Err(Error::state("at least one channel is required"));
        }

        let mut conn = self.pool.acquire(Acquire::NonBlocking).await?;
        conn.subscribe(&command, subscriber).await?;
        debug!(context = %self.id, channel_id = %conn.id(), "subscription opened");

        Ok(Subscription { conn })
    }

    fn ensure_direct(&self) -> Result<()> {
        if self.mode.pipelining || self.mode.transactional {
            return Err(Error::state(
                "context is already pipelining or in a transaction",
            ));
        }
        Ok(())
    }

    fn end_transaction(&mut self) -> Result<Connection> {
        if !self.mode.transactional {
            return Err(Error::state("no transaction is open"));
        }
        self.mode.transactional = false;
        self.take_held()
    }

    fn held(&mut self) -> Result<&mut Connection> {
        self.conn
            .as_mut()
            .ok_or_else(|| Error::state("context holds no connection"))
    }

    fn take_held(&mut self) -> Result<Connection> {
        self.conn
            .take()
            .ok_or_else(|| Error::state("context holds no connection"))
    }

    // A failure inside a pipeline or transaction abandons it; the held connection is closed.
    fn or_reset(&mut self, result: Result<()>) -> Result<()> {
        if result.is_err() {
            self.mode.pipelining = false;
            self.mode.transactional = false;
            self.conn = None;
        }
        result
    }
}

/// A connection in subscribing mode. Messages are delivered to the subscriber on the channel's
/// receive task.
pub struct Subscription {
    conn: Connection,
}

impl Subscription {
    /// See [`Connection::unsubscribe`].
    pub async fn unsubscribe(&mut self, channels: &[&str]) -> Result<()> {
        self.conn.unsubscribe(channels).await
    }

    pub fn is_active(&self) -> bool {
        let flags = self.conn.flags();
        flags.subscribing && !flags.closed
    }

    /// The underlying connection. After unsubscribing from everything it accepts ordinary
    /// commands again.
    pub fn into_connection(self) -> Connection {
        self.conn
    }

    pub fn close(mut self) {
        self.conn.close();
    }
}
