use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{self, AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{oneshot, Mutex as AsyncMutex};
use tokio::time::Instant;
use tokio_util::codec::Encoder;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use crate::codec::FrameCodec;
use crate::command::{cmd, Command};
use crate::config::Config;
use crate::dispatcher;
use crate::frame::Frame;
use crate::pool::Lease;
use crate::pubsub::{Push, Subscriber};
use crate::reply::FromFrame;
use crate::{lock, Error, Result};

pub(crate) type Writer = Box<dyn AsyncWrite + Send + Unpin>;

/// One physical transport channel: the write half, the state shared with the receive task, and
/// the one-shot handshake marker. A pooled channel outlives the connections leasing it.
pub(crate) struct Channel {
    pub(crate) id: Uuid,
    pub(crate) writer: AsyncMutex<Writer>,
    state: Mutex<State>,
    handshake_complete: AtomicBool,
    pub(crate) shutdown: CancellationToken,
}

pub(crate) enum ReplyKind {
    Command,
    Pipelined,
    /// Administrative replies (AUTH, SELECT, MULTI, EXEC, DISCARD). They never trigger a recycle.
    KeepAlive,
    /// The first acknowledgement of a SUBSCRIBE installs the subscriber.
    Subscribe(Box<dyn Subscriber>),
}

pub(crate) struct PendingReply {
    pub(crate) tx: oneshot::Sender<Result<Frame>>,
    pub(crate) kind: ReplyKind,
}

#[derive(Default)]
pub(crate) struct State {
    pub(crate) closed: bool,
    pub(crate) in_flight: bool,
    pub(crate) pipelining: bool,
    pub(crate) transactional: bool,
    pub(crate) subscribing: bool,
    pub(crate) pooled: bool,
    pub(crate) pending: VecDeque<PendingReply>,
    pub(crate) pipeline_outstanding: usize,
    pub(crate) subscriber: Option<Box<dyn Subscriber>>,
    pub(crate) unsubscribe_all: Option<oneshot::Sender<()>>,
    /// Set when the connection was closed while replies were still outstanding.
    pub(crate) release: Option<Lease>,
}

impl State {
    pub(crate) fn eligible_for_close(&self) -> bool {
        self.pooled
            && !self.transactional
            && !self.pipelining
            && !self.in_flight
            && !self.subscribing
            && self.pending.is_empty()
    }

    fn flags(&self) -> Flags {
        Flags {
            closed: self.closed,
            in_flight: self.in_flight,
            pipelining: self.pipelining,
            transactional: self.transactional,
            subscribing: self.subscribing,
        }
    }
}

/// Snapshot of a connection's mode flags.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Flags {
    pub closed: bool,
    pub in_flight: bool,
    pub pipelining: bool,
    pub transactional: bool,
    pub subscribing: bool,
}

impl Channel {
    /// Splits the stream and spawns its receive task. Must be called within a Tokio runtime.
    pub(crate) fn open<S>(stream: S, config: &Config, pooled: bool) -> Arc<Channel>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = io::split(stream);
        let channel = Arc::new(Channel {
            id: Uuid::new_v4(),
            writer: AsyncMutex::new(Box::new(writer)),
            state: Mutex::new(State {
                pooled,
                ..State::default()
            }),
            handshake_complete: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        });

        dispatcher::spawn(channel.clone(), reader, config);
        debug!(channel_id = %channel.id, pooled, "channel opened");

        channel
    }

    pub(crate) fn state(&self) -> MutexGuard<'_, State> {
        lock(&self.state)
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.state().closed
    }

    /// Force-closes the channel: fails every queued reply, reports the closure to the subscriber,
    /// drops any deferred lease and stops the receive task.
    pub(crate) fn teardown(&self, reason: &str) {
        let (pending, subscriber, release) = {
            let mut state = self.state();
            if state.closed {
                return;
            }
            state.closed = true;
            state.in_flight = false;
            state.pipelining = false;
            state.transactional = false;
            state.subscribing = false;
            state.unsubscribe_all = None;
            (
                std::mem::take(&mut state.pending),
                state.subscriber.take(),
                state.release.take(),
            )
        };

        debug!(channel_id = %self.id, reason, "channel closed");
        self.shutdown.cancel();

        for reply in pending {
            let _ = reply
                .tx
                .send(Err(Error::Connection(format!("channel closed: {reason}"))));
        }
        if let Some(mut subscriber) = subscriber {
            subscriber.on_error(format!("channel closed: {reason}"));
        }
        drop(release);
    }
}

/// Handle on a reply that has been queued on a connection.
///
/// Dropping it, or abandoning [`ReplyFuture::wait`] on timeout, does not retract the command: the
/// reply is still consumed in order when it arrives.
#[derive(Debug)]
#[must_use = "the reply is discarded unless waited on"]
pub struct ReplyFuture {
    rx: oneshot::Receiver<Result<Frame>>,
}

impl ReplyFuture {
    pub async fn wait(self, timeout: Option<Duration>) -> Result<Frame> {
        self.wait_until(timeout.map(|timeout| Instant::now() + timeout))
            .await
    }

    pub(crate) async fn wait_until(self, deadline: Option<Instant>) -> Result<Frame> {
        let reply = match deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, self.rx)
                .await
                .map_err(|_| Error::Timeout)?,
            None => self.rx.await,
        };

        reply.map_err(|_| Error::Connection("channel dropped the pending reply".to_string()))?
    }
}

/// A connection to the server over one channel, either leased from a [`crate::Pool`] or
/// dedicated.
///
/// Replies are matched to commands strictly in the order the commands were written.
pub struct Connection {
    channel: Arc<Channel>,
    codec: FrameCodec,
    // Encoded commands not yet flushed. Reset on every write unless pipelining.
    buffer: BytesMut,
    buffered: usize,
    lease: Option<Lease>,
    closed: bool,
}

impl Connection {
    /// Dials a dedicated, non-pooled connection and runs the AUTH/SELECT handshake.
    pub async fn connect(config: &Config) -> Result<Connection> {
        let stream = dial(config).await?;
        let mut conn = Connection::new(Channel::open(stream, config, false), None);
        conn.handshake(config).await?;
        Ok(conn)
    }

    /// Wraps an already established transport as a dedicated connection. No handshake is run.
    pub fn from_stream<S>(stream: S, config: &Config) -> Connection
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        Connection::new(Channel::open(stream, config, false), None)
    }

    pub(crate) fn new(channel: Arc<Channel>, lease: Option<Lease>) -> Connection {
        Connection {
            channel,
            codec: FrameCodec::default(),
            buffer: BytesMut::with_capacity(4096),
            buffered: 0,
            lease,
            closed: false,
        }
    }

    /// Identity of the underlying channel, stable across leases.
    pub fn id(&self) -> Uuid {
        self.channel.id
    }

    pub fn is_closed(&self) -> bool {
        self.closed || self.channel.is_closed()
    }

    /// Only pooled connections can be recycled.
    pub fn recyclable(&self) -> bool {
        self.lease.is_some()
    }

    pub fn eligible_for_close(&self) -> bool {
        self.recyclable() && self.channel.state().eligible_for_close()
    }

    pub fn flags(&self) -> Flags {
        let mut flags = self.channel.state().flags();
        flags.closed |= self.closed;
        flags
    }

    pub fn pending_replies(&self) -> usize {
        self.channel.state().pending.len()
    }

    /// Runs AUTH (when a credential is configured) and SELECT, once per channel.
    pub async fn handshake(&mut self, config: &Config) -> Result<()> {
        if self.channel.handshake_complete.load(Ordering::Acquire) {
            return Ok(());
        }

        if let Some(credential) = &config.credential {
            let auth = cmd::auth(credential.username.as_deref(), &credential.password);
            let reply = self.roundtrip(&auth, ReplyKind::KeepAlive).await?;
            expect_ok("AUTH", reply)?;
        }

        let reply = self
            .roundtrip(&cmd::select(config.database), ReplyKind::KeepAlive)
            .await?;
        expect_ok("SELECT", reply)?;

        self.channel.handshake_complete.store(true, Ordering::Release);
        debug!(channel_id = %self.channel.id, database = config.database, "handshake complete");

        Ok(())
    }

    /// Starts buffering: subsequent writes accumulate until [`Connection::flush`], and the flag
    /// clears once the last reply of the batch arrives.
    pub fn begin_pipeline(&mut self) -> Result<()> {
        self.ensure_open()?;
        let mut state = self.channel.state();
        if state.pipelining || state.transactional || state.subscribing || state.in_flight {
            return Err(Error::state(
                "a pipeline can only start on an idle connection",
            ));
        }
        state.pipelining = true;
        state.pipeline_outstanding = 0;
        Ok(())
    }

    /// Encodes `command` into the outbound buffer.
    pub fn write(&mut self, command: &Command) -> Result<()> {
        self.ensure_open()?;
        {
            let mut state = self.channel.state();
            if state.subscribing {
                return Err(Error::state(
                    "connection is subscribed, only UNSUBSCRIBE is accepted",
                ));
            }
            if state.pipelining {
                state.pipeline_outstanding += 1;
            } else {
                self.buffer.clear();
                self.buffered = 0;
            }
        }

        self.codec.encode(command, &mut self.buffer)?;
        self.buffered += 1;

        Ok(())
    }

    /// Sends the buffered frames in one write and queues one pending reply per command.
    pub async fn flush(&mut self) -> Result<Vec<ReplyFuture>> {
        self.ensure_open()?;

        if self.buffered == 0 {
            let mut state = self.channel.state();
            if state.pipelining && state.pipeline_outstanding == 0 {
                state.pipelining = false;
            }
            return Ok(Vec::new());
        }

        let mut writer = self.channel.writer.lock().await;

        // Replies are queued before the bytes hit the wire so that the receive task always finds
        // them.
        let replies = {
            let mut state = self.channel.state();
            if state.subscribing {
                return Err(Error::state("connection is subscribed"));
            }
            if state.in_flight && !state.pipelining && !state.transactional {
                return Err(Error::state("a request is already in flight on this connection"));
            }

            let pipelined = state.pipelining;
            let mut replies = Vec::with_capacity(self.buffered);
            for _ in 0..self.buffered {
                let (tx, rx) = oneshot::channel();
                let kind = if pipelined {
                    ReplyKind::Pipelined
                } else {
                    ReplyKind::Command
                };
                state.pending.push_back(PendingReply { tx, kind });
                replies.push(ReplyFuture { rx });
            }
            if !pipelined {
                state.in_flight = true;
            }
            replies
        };

        let result = write_frames(&mut writer, &self.buffer).await;
        drop(writer);

        debug!(channel_id = %self.channel.id, commands = self.buffered, "flushed");
        self.buffer.clear();
        self.buffered = 0;

        if let Err(err) = result {
            self.channel.teardown(&err.to_string());
            return Err(err.into());
        }

        Ok(replies)
    }

    /// Writes and flushes a single command.
    pub async fn send(&mut self, command: &Command) -> Result<ReplyFuture> {
        if self.channel.state().pipelining {
            return Err(Error::state("use flush to collect pipelined replies"));
        }

        self.write(command)?;
        let mut replies = self.flush().await?;
        replies
            .pop()
            .ok_or_else(|| Error::state("no reply was queued"))
    }

    /// Sends a single command and waits for its reply.
    pub async fn request(&mut self, command: &Command) -> Result<Frame> {
        self.send(command).await?.wait(None).await
    }

    pub async fn multi(&mut self) -> Result<()> {
        self.ensure_open()?;
        {
            let state = self.channel.state();
            if state.transactional {
                return Err(Error::state("MULTI calls can not be nested"));
            }
            if state.pipelining || state.subscribing {
                return Err(Error::state(
                    "a transaction can not start while pipelining or subscribed",
                ));
            }
        }

        let reply = self.roundtrip(&cmd::multi(), ReplyKind::KeepAlive).await?;
        <()>::from_frame(reply)?;
        self.channel.state().transactional = true;

        Ok(())
    }

    /// Commits the transaction. The reply holds one element per queued command, in order.
    pub async fn exec(&mut self) -> Result<Vec<Frame>> {
        self.ensure_transactional("EXEC")?;

        let reply = self.roundtrip(&cmd::exec(), ReplyKind::KeepAlive).await;
        self.channel.state().transactional = false;

        match reply? {
            Frame::Array(results) => Ok(results),
            Frame::Null => Err(Error::TransactionAborted),
            frame => Err(Error::mismatch("array", frame)),
        }
    }

    pub async fn discard(&mut self) -> Result<()> {
        self.ensure_transactional("DISCARD")?;

        let reply = self.roundtrip(&cmd::discard(), ReplyKind::KeepAlive).await;
        self.channel.state().transactional = false;

        <()>::from_frame(reply?)
    }

    /// Sends SUBSCRIBE or PSUBSCRIBE and waits for the first acknowledgement. From then on every
    /// inbound frame goes to `subscriber`.
    pub async fn subscribe(
        &mut self,
        command: &Command,
        subscriber: impl Subscriber,
    ) -> Result<()> {
        self.ensure_open()?;
        {
            let state = self.channel.state();
            if state.subscribing || state.transactional || state.pipelining {
                return Err(Error::state(
                    "subscribe needs a connection that is not subscribed, pipelining or in a transaction",
                ));
            }
        }

        let reply = self
            .roundtrip(command, ReplyKind::Subscribe(Box::new(subscriber)))
            .await?;

        if Push::is_subscribe_ack(&reply) {
            debug!(channel_id = %self.channel.id, command = %command, "subscribed");
            Ok(())
        } else {
            Err(Error::mismatch("subscribe acknowledgement", reply))
        }
    }

    /// With no channels, unsubscribes from everything and returns once the server confirms,
    /// leaving the connection usable for ordinary commands. A targeted unsubscribe only sends the
    /// scoped command; the connection stays in subscribing mode either way.
    pub async fn unsubscribe(&mut self, channels: &[&str]) -> Result<()> {
        self.ensure_open()?;
        let subscribing = self.channel.state().subscribing;
        if !subscribing {
            return Err(Error::state("connection is not subscribed"));
        }

        let mut frames = BytesMut::new();
        if !channels.is_empty() {
            self.codec.encode(&cmd::unsubscribe(channels), &mut frames)?;
            return self.write_unacknowledged(&frames).await;
        }

        let (tx, rx) = oneshot::channel();
        self.channel.state().unsubscribe_all = Some(tx);

        self.codec.encode(&cmd::unsubscribe(&[]), &mut frames)?;
        self.codec.encode(&cmd::punsubscribe(&[]), &mut frames)?;
        self.write_unacknowledged(&frames).await?;

        rx.await
            .map_err(|_| Error::Connection("channel closed while unsubscribing".to_string()))
    }

    /// Releases the connection. A pooled channel goes back to the pool when it is eligible, or
    /// once its outstanding replies have arrived; a channel left mid-transaction or subscribed is
    /// discarded. A dedicated channel is always torn down.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        let unflushed = std::mem::take(&mut self.buffered);
        self.buffer.clear();

        let Some(lease) = self.lease.take() else {
            self.channel.teardown("connection closed");
            return;
        };

        let mut state = self.channel.state();
        if state.pipelining {
            state.pipeline_outstanding = state.pipeline_outstanding.saturating_sub(unflushed);
            if state.pipeline_outstanding == 0 {
                state.pipelining = false;
            }
        }

        if state.closed {
            drop(state);
            drop(lease);
        } else if state.transactional || state.subscribing {
            drop(state);
            self.channel
                .teardown("connection closed inside a transaction or subscription");
            drop(lease);
        } else if state.eligible_for_close() {
            drop(state);
            lease.finish(self.channel.clone());
        } else {
            debug!(
                channel_id = %self.channel.id,
                pending = state.pending.len(),
                "release deferred until outstanding replies arrive"
            );
            state.release = Some(lease);
        }
    }

    /// Closes the channel without returning it to the pool.
    pub(crate) fn discard_channel(&mut self) {
        self.closed = true;
        self.channel.teardown("connection discarded");
        self.lease.take();
    }

    async fn roundtrip(&mut self, command: &Command, kind: ReplyKind) -> Result<Frame> {
        self.ensure_open()?;

        let mut frame = BytesMut::new();
        self.codec.encode(command, &mut frame)?;

        let (tx, rx) = oneshot::channel();
        let mut writer = self.channel.writer.lock().await;
        self.channel
            .state()
            .pending
            .push_back(PendingReply { tx, kind });
        let result = write_frames(&mut writer, &frame).await;
        drop(writer);

        if let Err(err) = result {
            self.channel.teardown(&err.to_string());
            return Err(err.into());
        }

        ReplyFuture { rx }.wait(None).await
    }

    // Frames whose acknowledgements are consumed by the subscriber, not the reply queue.
    async fn write_unacknowledged(&mut self, frames: &[u8]) -> Result<()> {
        let mut writer = self.channel.writer.lock().await;
        let result = write_frames(&mut writer, frames).await;
        drop(writer);

        if let Err(err) = result {
            self.channel.teardown(&err.to_string());
            return Err(err.into());
        }
        Ok(())
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(Error::state("connection is closed"));
        }
        if self.channel.is_closed() {
            return Err(Error::Connection("channel is closed".to_string()));
        }
        Ok(())
    }

    fn ensure_transactional(&self, command: &str) -> Result<()> {
        self.ensure_open()?;
        if !self.channel.state().transactional {
            return Err(Error::state(format!("{command} without MULTI")));
        }
        Ok(())
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.channel.id)
            .field("recyclable", &self.recyclable())
            .field("flags", &self.flags())
            .finish()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

pub(crate) async fn dial(config: &Config) -> Result<TcpStream> {
    let addr = config.addr();
    let connect = TcpStream::connect(&addr);

    let stream = match config.connect_timeout {
        Some(timeout) => tokio::time::timeout(timeout, connect)
            .await
            .map_err(|_| Error::Connection(format!("timed out connecting to {addr}")))?,
        None => connect.await,
    };
    let stream =
        stream.map_err(|e| Error::Connection(format!("failed to connect to {addr}: {e}")))?;

    // Commands are small; do not let Nagle hold them back.
    stream.set_nodelay(true)?;

    Ok(stream)
}

async fn write_frames(writer: &mut Writer, frames: &[u8]) -> io::Result<()> {
    writer.write_all(frames).await?;
    writer.flush().await
}

fn expect_ok(step: &str, reply: Frame) -> Result<()> {
    match reply {
        Frame::Simple(ref s) if s == "OK" => Ok(()),
        frame => Err(Error::Connection(format!("{step} failed: {frame}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eligible_for_close_over_every_flag_combination() {
        for mask in 0u8..64 {
            let bit = |n: u8| mask & (1 << n) != 0;

            let mut state = State {
                pooled: bit(0),
                transactional: bit(1),
                pipelining: bit(2),
                in_flight: bit(3),
                subscribing: bit(4),
                ..State::default()
            };
            if bit(5) {
                let (tx, _rx) = oneshot::channel();
                state.pending.push_back(PendingReply {
                    tx,
                    kind: ReplyKind::Command,
                });
            }

            let expected = bit(0) && !bit(1) && !bit(2) && !bit(3) && !bit(4) && !bit(5);
            assert_eq!(state.eligible_for_close(), expected, "flags {mask:06b}");
        }
    }

    #[test]
    fn expect_ok_rejects_errors() {
        assert!(expect_ok("SELECT", Frame::Simple("OK".to_string())).is_ok());

        let err = expect_ok("AUTH", Frame::Error("WRONGPASS invalid password".to_string()))
            .unwrap_err();
        assert!(matches!(err, Error::Connection(ref msg) if msg.contains("WRONGPASS")));
    }

    #[tokio::test]
    async fn dedicated_connections_are_never_recyclable() {
        let (client, _server) = tokio::io::duplex(64);
        let conn = Connection::from_stream(client, &Config::default());

        assert!(!conn.recyclable());
        assert!(!conn.eligible_for_close());
    }
}
