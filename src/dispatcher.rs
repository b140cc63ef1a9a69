use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::io::{AsyncRead, AsyncWriteExt};
use tokio_util::codec::FramedRead;
use tracing::{debug, instrument, warn};

use crate::codec::FrameCodec;
use crate::config::Config;
use crate::connection::{Channel, ReplyKind};
use crate::frame::Frame;
use crate::pubsub::{Push, Subscriber};
use crate::{Error, Result};

/// Spawns the receive task of `channel`. It owns the read half and routes every inbound frame,
/// in arrival order, either to the oldest pending reply or to the subscriber.
pub(crate) fn spawn<R>(channel: Arc<Channel>, reader: R, config: &Config)
where
    R: AsyncRead + Send + Unpin + 'static,
{
    let dispatcher = Dispatcher {
        frames: FramedRead::new(reader, FrameCodec::new(config.max_frame_size)),
        channel,
        idle_timeout: config.idle_timeout,
    };

    tokio::spawn(dispatcher.run());
}

struct Dispatcher<R> {
    channel: Arc<Channel>,
    frames: FramedRead<R, FrameCodec>,
    idle_timeout: Option<Duration>,
}

// Also reached when the task panics; no reply is left waiting on a dead receive task.
impl<R> Drop for Dispatcher<R> {
    fn drop(&mut self) {
        self.channel.teardown("receive task stopped");
    }
}

enum Event {
    Frame(Frame),
    Idle,
    Failed(Error),
    Eof,
}

impl<R: AsyncRead + Unpin> Dispatcher<R> {
    #[instrument(name = "dispatcher", skip(self), fields(channel_id = %self.channel.id))]
    async fn run(mut self) {
        let shutdown = self.channel.shutdown.clone();

        loop {
            let event = tokio::select! {
                _ = shutdown.cancelled() => break,
                event = self.next_event() => event,
            };

            match event {
                Event::Frame(frame) => {
                    if let Err(err) = self.dispatch(frame) {
                        warn!(%err, "closing channel");
                        self.channel.teardown(&err.to_string());
                        break;
                    }
                }
                Event::Idle => {
                    let eligible = self.channel.state().eligible_for_close();
                    if eligible {
                        debug!("idle timeout elapsed");
                        self.channel.teardown("idle timeout");
                        break;
                    }
                }
                Event::Failed(err) => {
                    warn!(%err, "failed to read from channel");
                    self.channel.teardown(&err.to_string());
                    break;
                }
                Event::Eof => {
                    self.channel.teardown("closed by peer");
                    break;
                }
            }
        }

        let mut writer = self.channel.writer.lock().await;
        if let Err(err) = writer.shutdown().await {
            debug!(%err, "failed to shut down the write half");
        }
    }

    async fn next_event(&mut self) -> Event {
        let next = match self.idle_timeout {
            Some(idle) => match tokio::time::timeout(idle, self.frames.next()).await {
                Ok(next) => next,
                Err(_) => return Event::Idle,
            },
            None => self.frames.next().await,
        };

        match next {
            Some(Ok(frame)) => Event::Frame(frame),
            Some(Err(err)) => Event::Failed(err),
            None => Event::Eof,
        }
    }

    fn dispatch(&self, frame: Frame) -> Result<()> {
        let mut state = self.channel.state();

        if state.subscribing {
            // Callbacks run without the state lock held.
            let subscriber = state.subscriber.take();
            drop(state);
            self.publish(subscriber, frame);
            return Ok(());
        }

        let Some(reply) = state.pending.pop_front() else {
            return Err(Error::Connection(format!("unsolicited reply: {frame}")));
        };

        let recycle = match reply.kind {
            ReplyKind::KeepAlive => false,
            ReplyKind::Subscribe(subscriber) => {
                if Push::is_subscribe_ack(&frame) {
                    state.subscribing = true;
                    state.subscriber = Some(subscriber);
                }
                false
            }
            ReplyKind::Pipelined => {
                state.pipeline_outstanding = state.pipeline_outstanding.saturating_sub(1);
                if state.pipeline_outstanding == 0 {
                    state.pipelining = false;
                }
                true
            }
            ReplyKind::Command => {
                state.in_flight = false;
                true
            }
        };

        // A deferred release happens before the waiter wakes, so its next lease finds the
        // channel back in the pool.
        let release = if recycle && state.eligible_for_close() {
            state.release.take()
        } else {
            None
        };
        drop(state);

        if let Some(lease) = release {
            debug!("returning channel to the pool");
            lease.finish(self.channel.clone());
        }

        // The waiter may have timed out and gone.
        let _ = reply.tx.send(Ok(frame));

        Ok(())
    }

    fn publish(&self, subscriber: Option<Box<dyn Subscriber>>, frame: Frame) {
        let Some(mut subscriber) = subscriber else {
            warn!(%frame, "no subscriber installed, dropping frame");
            return;
        };

        match Push::classify(frame) {
            Push::Message {
                channel,
                topic,
                payload,
            } => subscriber.on_message(channel, topic, payload),
            Push::Ack => {}
            Push::PatternsLeft(left) => {
                let mut state = self.channel.state();
                if left == 0 {
                    if let Some(done) = state.unsubscribe_all.take() {
                        state.subscribing = false;
                        drop(state);
                        debug!("unsubscribed from every channel");
                        let _ = done.send(());
                        return;
                    }
                }
            }
            Push::Error(message) => subscriber.on_error(message),
        }

        let mut state = self.channel.state();
        if state.subscribing && !state.closed {
            state.subscriber = Some(subscriber);
        }
    }
}
