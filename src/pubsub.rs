use std::str::FromStr;

use bytes::Bytes;
use strum_macros::EnumString;
use tokio::sync::mpsc::UnboundedSender;
use tracing::warn;

use crate::frame::Frame;

/// Receives every inbound frame of a subscribed connection.
///
/// Callbacks run on the channel's receive task, so they should return quickly.
pub trait Subscriber: Send + 'static {
    /// `channel` is the subscription that matched: the channel name itself, or the pattern for
    /// pattern subscriptions. `topic` is the channel the message was published to.
    fn on_message(&mut self, channel: Bytes, topic: Bytes, payload: Bytes);

    fn on_error(&mut self, message: String);
}

/// A published message, as delivered to an [`UnboundedSender`] subscriber.
#[derive(Clone, Debug, PartialEq)]
pub struct Message {
    pub channel: Bytes,
    pub topic: Bytes,
    pub payload: Bytes,
}

impl Subscriber for UnboundedSender<Message> {
    fn on_message(&mut self, channel: Bytes, topic: Bytes, payload: Bytes) {
        let message = Message {
            channel,
            topic,
            payload,
        };
        if self.send(message).is_err() {
            warn!("subscription receiver dropped, discarding message");
        }
    }

    fn on_error(&mut self, message: String) {
        warn!("subscription error: {}", message);
    }
}

/// First element of a frame received while subscribed.
#[derive(Debug, PartialEq, EnumString)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
enum PushKind {
    Message,
    Pmessage,
    Subscribe,
    Psubscribe,
    Unsubscribe,
    Punsubscribe,
    Pong,
}

/// What the receive task should do with a frame that arrived in subscribing mode.
#[derive(Debug, PartialEq)]
pub(crate) enum Push {
    Message {
        channel: Bytes,
        topic: Bytes,
        payload: Bytes,
    },
    /// Subscribe and unsubscribe acknowledgements, and pings.
    Ack,
    /// A `punsubscribe` acknowledgement with the number of subscriptions still active.
    PatternsLeft(i64),
    Error(String),
}

impl Push {
    pub(crate) fn classify(frame: Frame) -> Push {
        let items = match &frame {
            Frame::Array(items) => items,
            Frame::Error(msg) => return Push::Error(msg.clone()),
            frame => return Push::Error(format!("unexpected frame while subscribed: {frame}")),
        };

        let kind = items
            .first()
            .and_then(Frame::as_str)
            .and_then(|kind| PushKind::from_str(kind).ok());
        let rest = items.get(1..).unwrap_or_default();

        match (kind, rest) {
            (Some(PushKind::Message), [Frame::Bulk(channel), Frame::Bulk(payload)]) => {
                Push::Message {
                    channel: channel.clone(),
                    topic: channel.clone(),
                    payload: payload.clone(),
                }
            }
            (
                Some(PushKind::Pmessage),
                [Frame::Bulk(pattern), Frame::Bulk(topic), Frame::Bulk(payload)],
            ) => Push::Message {
                channel: pattern.clone(),
                topic: topic.clone(),
                payload: payload.clone(),
            },
            (Some(PushKind::Punsubscribe), [_, Frame::Integer(left)]) => Push::PatternsLeft(*left),
            (
                Some(
                    PushKind::Subscribe
                    | PushKind::Psubscribe
                    | PushKind::Unsubscribe
                    | PushKind::Pong,
                ),
                _,
            ) => Push::Ack,
            _ => Push::Error(format!("unexpected frame while subscribed: {frame}")),
        }
    }

    /// Whether `frame` acknowledges a SUBSCRIBE or PSUBSCRIBE.
    pub(crate) fn is_subscribe_ack(frame: &Frame) -> bool {
        match frame {
            Frame::Array(items) => matches!(
                items.first().and_then(Frame::as_str).map(PushKind::from_str),
                Some(Ok(PushKind::Subscribe | PushKind::Psubscribe))
            ),
            _ => false,
        }
    }
}
