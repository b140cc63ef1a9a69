pub mod client;
pub mod codec;
pub mod command;
pub mod config;
pub mod connection;
mod dispatcher;
pub mod error;
pub mod frame;
pub mod pool;
pub mod pubsub;
pub mod reply;

use std::sync::{Mutex, MutexGuard, PoisonError};

pub use client::{Client, Context, Mode, Pending, Submitted, Subscription};
pub use command::{cmd, Command};
pub use config::{Config, Credential};
pub use connection::{Connection, Flags, ReplyFuture};
pub use error::Error;
pub use frame::Frame;
pub use pool::{Acquire, ContextId, Pool, PoolStatus};
pub use pubsub::{Message, Subscriber};
pub use reply::FromFrame;

pub type Result<T> = std::result::Result<T, Error>;

// Guarded state is only mutated in short, panic-free sections, so a poisoned lock still holds
// consistent data.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
