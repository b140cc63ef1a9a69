use std::fmt;
use std::time::Duration;

use percent_encoding::percent_decode_str;
use url::Url;

use crate::codec::DEFAULT_MAX_FRAME_SIZE;
use crate::{Error, Result};

const DEFAULT_PORT: u16 = 6379;

/// Where to connect and how to size the pool. One pool targets exactly one
/// {host, port, database, credential}.
#[derive(Clone, Debug, PartialEq)]
pub struct Config {
    pub host: String,
    pub port: u16,
    /// Logical database selected on every new channel.
    pub database: u32,
    pub credential: Option<Credential>,
    /// Upper bound on channels, idle and leased together.
    pub max_size: usize,
    /// Channels with no inbound traffic for this long are closed, provided they are eligible.
    pub idle_timeout: Option<Duration>,
    pub connect_timeout: Option<Duration>,
    /// Bounds how long a lease waits for capacity.
    pub acquire_timeout: Option<Duration>,
    pub max_frame_size: usize,
}

#[derive(Clone, PartialEq)]
pub struct Credential {
    pub username: Option<String>,
    pub password: String,
}

impl Config {
    pub fn new(host: impl Into<String>, port: u16) -> Config {
        Config {
            host: host.into(),
            port,
            ..Config::default()
        }
    }

    /// Parses `redis://[[username]:password@]host[:port][/database]`.
    pub fn from_url(input: &str) -> Result<Config> {
        let url = Url::parse(input).map_err(|e| Error::Config(format!("{input}: {e}")))?;

        if url.scheme() != "redis" {
            return Err(Error::Config(format!(
                "unsupported scheme {:?}, expected redis://",
                url.scheme()
            )));
        }

        let host = url
            .host_str()
            .ok_or_else(|| Error::Config(format!("{input}: missing host")))?;

        let database = match url.path().trim_start_matches('/') {
            "" => 0,
            db => db
                .parse()
                .map_err(|_| Error::Config(format!("invalid database index {db:?}")))?,
        };

        let credential = match url.password() {
            Some(password) => Some(Credential {
                username: match url.username() {
                    "" => None,
                    username => Some(decode_userinfo(username)?),
                },
                password: decode_userinfo(password)?,
            }),
            None => None,
        };

        Ok(Config {
            host: host.to_string(),
            port: url.port().unwrap_or(DEFAULT_PORT),
            database,
            credential,
            ..Config::default()
        })
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn database(mut self, database: u32) -> Config {
        self.database = database;
        self
    }

    pub fn password(mut self, password: impl Into<String>) -> Config {
        self.credential = Some(Credential {
            username: None,
            password: password.into(),
        });
        self
    }

    pub fn credential(mut self, username: impl Into<String>, password: impl Into<String>) -> Config {
        self.credential = Some(Credential {
            username: Some(username.into()),
            password: password.into(),
        });
        self
    }

    pub fn max_size(mut self, max_size: usize) -> Config {
        self.max_size = max_size;
        self
    }

    pub fn idle_timeout(mut self, idle_timeout: Option<Duration>) -> Config {
        self.idle_timeout = idle_timeout;
        self
    }

    pub fn connect_timeout(mut self, connect_timeout: Option<Duration>) -> Config {
        self.connect_timeout = connect_timeout;
        self
    }

    pub fn acquire_timeout(mut self, acquire_timeout: Option<Duration>) -> Config {
        self.acquire_timeout = acquire_timeout;
        self
    }

    pub fn max_frame_size(mut self, max_frame_size: usize) -> Config {
        self.max_frame_size = max_frame_size;
        self
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            database: 0,
            credential: None,
            max_size: 8,
            idle_timeout: Some(Duration::from_secs(60)),
            connect_timeout: Some(Duration::from_secs(5)),
            acquire_timeout: Some(Duration::from_secs(5)),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

// Userinfo comes percent-encoded out of the URL.
fn decode_userinfo(part: &str) -> Result<String> {
    percent_decode_str(part)
        .decode_utf8()
        .map(|decoded| decoded.into_owned())
        .map_err(|e| Error::Config(format!("invalid credential encoding: {e}")))
}

// Never print the password.
impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}
