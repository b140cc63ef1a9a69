use thiserror::Error as ThisError;

use crate::frame::{self, Frame};

/// Every failure surfaced by the client.
///
/// Transport faults (`Connection`, `Io`, `Protocol`) always take the affected channel down.
/// `ResultMismatch` and `Timeout` concern a single reply and leave the connection open.
#[derive(Debug, ThisError)]
pub enum Error {
    #[error("connection error: {0}")]
    Connection(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("protocol error: {0}")]
    Protocol(#[from] frame::Error),
    #[error("unexpected reply; expected {expected}, got {actual}")]
    ResultMismatch { expected: &'static str, actual: Frame },
    #[error("timed out waiting for the reply")]
    Timeout,
    #[error("invalid connection state: {0}")]
    State(String),
    #[error("timed out waiting for a pooled connection")]
    PoolTimeout,
    #[error("transaction aborted by the server")]
    TransactionAborted,
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl Error {
    pub(crate) fn mismatch(expected: &'static str, actual: Frame) -> Error {
        Error::ResultMismatch { expected, actual }
    }

    pub(crate) fn state(msg: impl Into<String>) -> Error {
        Error::State(msg.into())
    }

    /// The server's message when the reply was an error reply.
    pub fn server_message(&self) -> Option<&str> {
        match self {
            Error::ResultMismatch {
                actual: Frame::Error(msg),
                ..
            } => Some(msg),
            _ => None,
        }
    }
}
