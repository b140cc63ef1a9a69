use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};
use itertools::Itertools;

/// A command as sent to the server: the verb followed by its arguments, all byte strings.
///
/// Clients send commands to the server as RESP arrays of bulk strings.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Command {
    args: Vec<Bytes>,
}

impl Command {
    pub fn new(verb: impl IntoArg) -> Command {
        Command {
            args: vec![verb.into_arg()],
        }
    }

    pub fn arg(mut self, arg: impl IntoArg) -> Command {
        self.args.push(arg.into_arg());
        self
    }

    pub fn args<I>(mut self, args: I) -> Command
    where
        I: IntoIterator,
        I::Item: IntoArg,
    {
        self.args.extend(args.into_iter().map(IntoArg::into_arg));
        self
    }

    /// The command verb, upper-cased for logs.
    pub fn name(&self) -> String {
        self.args
            .first()
            .map(|verb| String::from_utf8_lossy(verb).to_uppercase())
            .unwrap_or_default()
    }

    pub fn parts(&self) -> &[Bytes] {
        &self.args
    }

    /// Appends the wire frame: `*<argc>\r\n` then `$<len>\r\n<bytes>\r\n` per argument, where
    /// `len` is the byte length of the argument.
    pub fn encode_into(&self, dst: &mut BytesMut) {
        dst.reserve(self.encoded_len());
        dst.put_u8(b'*');
        dst.put_slice(self.args.len().to_string().as_bytes());
        dst.put_slice(b"\r\n");
        for arg in &self.args {
            dst.put_u8(b'$');
            dst.put_slice(arg.len().to_string().as_bytes());
            dst.put_slice(b"\r\n");
            dst.put_slice(arg);
            dst.put_slice(b"\r\n");
        }
    }

    fn encoded_len(&self) -> usize {
        // Generous per-argument overhead: type byte, up to 20 length digits, two CRLFs.
        16 + self.args.iter().map(|arg| arg.len() + 25).sum::<usize>()
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}",
            self.args.iter().map(|arg| String::from_utf8_lossy(arg)).join(" ")
        )
    }
}

/// Conversion of a single command argument into its byte string.
pub trait IntoArg {
    fn into_arg(self) -> Bytes;
}

impl IntoArg for Bytes {
    fn into_arg(self) -> Bytes {
        self
    }
}

impl IntoArg for &Bytes {
    fn into_arg(self) -> Bytes {
        self.clone()
    }
}

impl IntoArg for &str {
    fn into_arg(self) -> Bytes {
        Bytes::copy_from_slice(self.as_bytes())
    }
}

impl IntoArg for String {
    fn into_arg(self) -> Bytes {
        Bytes::from(self)
    }
}

impl IntoArg for &String {
    fn into_arg(self) -> Bytes {
        Bytes::copy_from_slice(self.as_bytes())
    }
}

impl IntoArg for &[u8] {
    fn into_arg(self) -> Bytes {
        Bytes::copy_from_slice(self)
    }
}

impl IntoArg for Vec<u8> {
    fn into_arg(self) -> Bytes {
        Bytes::from(self)
    }
}

macro_rules! integer_arg {
    ($($ty:ty),*) => {
        $(
            impl IntoArg for $ty {
                fn into_arg(self) -> Bytes {
                    Bytes::from(self.to_string())
                }
            }
        )*
    };
}

integer_arg!(i32, i64, u16, u32, u64, usize);

/// Thin constructors for the handful of commands the engine itself relies on. The typed
/// command surface lives outside this crate.
pub mod cmd {
    use super::{Command, IntoArg};

    pub fn auth(username: Option<&str>, password: &str) -> Command {
        match username {
            Some(username) => Command::new("AUTH").arg(username).arg(password),
            None => Command::new("AUTH").arg(password),
        }
    }

    pub fn select(database: u32) -> Command {
        Command::new("SELECT").arg(database)
    }

    pub fn multi() -> Command {
        Command::new("MULTI")
    }

    pub fn exec() -> Command {
        Command::new("EXEC")
    }

    pub fn discard() -> Command {
        Command::new("DISCARD")
    }

    pub fn ping() -> Command {
        Command::new("PING")
    }

    pub fn get(key: impl IntoArg) -> Command {
        Command::new("GET").arg(key)
    }

    pub fn set(key: impl IntoArg, value: impl IntoArg) -> Command {
        Command::new("SET").arg(key).arg(value)
    }

    pub fn incr(key: impl IntoArg) -> Command {
        Command::new("INCR").arg(key)
    }

    pub fn del(key: impl IntoArg) -> Command {
        Command::new("DEL").arg(key)
    }

    pub fn publish(channel: impl IntoArg, payload: impl IntoArg) -> Command {
        Command::new("PUBLISH").arg(channel).arg(payload)
    }

    pub fn subscribe(channels: &[&str]) -> Command {
        Command::new("SUBSCRIBE").args(channels.iter().copied())
    }

    pub fn psubscribe(patterns: &[&str]) -> Command {
        Command::new("PSUBSCRIBE").args(patterns.iter().copied())
    }

    pub fn unsubscribe(channels: &[&str]) -> Command {
        Command::new("UNSUBSCRIBE").args(channels.iter().copied())
    }

    pub fn punsubscribe(patterns: &[&str]) -> Command {
        Command::new("PUNSUBSCRIBE").args(patterns.iter().copied())
    }
}
