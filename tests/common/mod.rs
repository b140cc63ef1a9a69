#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio_util::codec::FramedRead;

use rustdis_client::codec::FrameCodec;
use rustdis_client::{Config, Frame};

/// A small in-process RESP server: enough of GET/SET/INCR/DEL, transactions, pub/sub and
/// `DEBUG SLEEP` to drive the client end to end. Every command is recorded.
pub struct MockServer {
    pub addr: SocketAddr,
    shared: Arc<Shared>,
}

#[derive(Default)]
struct Shared {
    password: Option<String>,
    store: Mutex<HashMap<Bytes, Bytes>>,
    log: Mutex<Vec<String>>,
    subscribers: Mutex<HashMap<usize, Subscriptions>>,
    connections: AtomicUsize,
}

struct Subscriptions {
    tx: UnboundedSender<Frame>,
    channels: HashSet<Bytes>,
    patterns: HashSet<Bytes>,
}

impl Subscriptions {
    fn count(&self) -> i64 {
        (self.channels.len() + self.patterns.len()) as i64
    }
}

impl MockServer {
    pub async fn start() -> MockServer {
        MockServer::start_with(None).await
    }

    pub async fn with_password(password: &str) -> MockServer {
        MockServer::start_with(Some(password.to_string())).await
    }

    async fn start_with(password: Option<String>) -> MockServer {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shared = Arc::new(Shared {
            password,
            ..Shared::default()
        });

        let accept = shared.clone();
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                let id = accept.connections.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(serve(id, socket, accept.clone()));
            }
        });

        MockServer { addr, shared }
    }

    pub fn config(&self) -> Config {
        Config::new(self.addr.ip().to_string(), self.addr.port())
    }

    /// Every command received so far, as `VERB arg arg`.
    pub fn log(&self) -> Vec<String> {
        self.shared.log.lock().unwrap().clone()
    }

    pub fn count(&self, verb: &str) -> usize {
        self.log()
            .iter()
            .filter(|line| line.split(' ').next() == Some(verb))
            .count()
    }

    /// Number of accepted TCP connections.
    pub fn connections(&self) -> usize {
        self.shared.connections.load(Ordering::SeqCst)
    }
}

async fn serve(id: usize, socket: TcpStream, shared: Arc<Shared>) {
    let (reader, mut writer) = socket.into_split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Frame>();

    tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if writer.write_all(&frame.serialize()).await.is_err() {
                break;
            }
        }
    });

    let mut frames = FramedRead::new(reader, FrameCodec::default());
    let mut session = Session {
        id,
        tx,
        shared: shared.clone(),
        queued: None,
    };

    while let Some(Ok(frame)) = frames.next().await {
        let Frame::Array(items) = frame else {
            break;
        };
        let args = items
            .into_iter()
            .filter_map(|item| match item {
                Frame::Bulk(bytes) => Some(bytes),
                _ => None,
            })
            .collect::<Vec<_>>();
        session.handle(args).await;
    }

    shared.subscribers.lock().unwrap().remove(&id);
}

struct Session {
    id: usize,
    tx: UnboundedSender<Frame>,
    shared: Arc<Shared>,
    queued: Option<Vec<Vec<Bytes>>>,
}

impl Session {
    async fn handle(&mut self, args: Vec<Bytes>) {
        let Some(verb) = args.first() else {
            return;
        };
        let verb = String::from_utf8_lossy(verb).to_uppercase();

        let mut line = verb.clone();
        for arg in &args[1..] {
            line.push(' ');
            line.push_str(&String::from_utf8_lossy(arg));
        }
        self.shared.log.lock().unwrap().push(line);

        match verb.as_str() {
            "SUBSCRIBE" | "PSUBSCRIBE" | "UNSUBSCRIBE" | "PUNSUBSCRIBE" => {
                return self.pubsub(&verb, &args[1..]);
            }
            "MULTI" => {
                self.queued = Some(Vec::new());
                return self.reply(ok());
            }
            "EXEC" => {
                let reply = match self.queued.take() {
                    Some(commands) => Frame::Array(
                        commands
                            .iter()
                            .map(|command| self.shared.execute(command))
                            .collect(),
                    ),
                    None => error("ERR EXEC without MULTI"),
                };
                return self.reply(reply);
            }
            "DISCARD" => {
                let reply = match self.queued.take() {
                    Some(_) => ok(),
                    None => error("ERR DISCARD without MULTI"),
                };
                return self.reply(reply);
            }
            _ => {}
        }

        if let Some(queued) = &mut self.queued {
            queued.push(args);
            return self.reply(Frame::Simple("QUEUED".to_string()));
        }

        if verb == "DEBUG" {
            let seconds = args
                .get(2)
                .and_then(|arg| std::str::from_utf8(arg).ok())
                .and_then(|arg| arg.parse::<f64>().ok())
                .unwrap_or(0.0);
            tokio::time::sleep(Duration::from_secs_f64(seconds)).await;
            return self.reply(ok());
        }

        let reply = self.shared.execute(&args);
        self.reply(reply);
    }

    fn reply(&self, frame: Frame) {
        let _ = self.tx.send(frame);
    }

    fn pubsub(&mut self, verb: &str, names: &[Bytes]) {
        let mut subscribers = self.shared.subscribers.lock().unwrap();
        let subscriptions = subscribers
            .entry(self.id)
            .or_insert_with(|| Subscriptions {
                tx: self.tx.clone(),
                channels: HashSet::new(),
                patterns: HashSet::new(),
            });

        let kind = Bytes::from(verb.to_lowercase());
        let mut acks = Vec::new();

        match verb {
            "SUBSCRIBE" | "PSUBSCRIBE" => {
                for name in names {
                    if verb == "SUBSCRIBE" {
                        subscriptions.channels.insert(name.clone());
                    } else {
                        subscriptions.patterns.insert(name.clone());
                    }
                    acks.push((Frame::Bulk(name.clone()), subscriptions.count()));
                }
            }
            _ => {
                let targets: Vec<Bytes> = match (verb, names.is_empty()) {
                    ("UNSUBSCRIBE", true) => subscriptions.channels.iter().cloned().collect(),
                    (_, true) => subscriptions.patterns.iter().cloned().collect(),
                    (_, false) => names.to_vec(),
                };
                if targets.is_empty() {
                    acks.push((Frame::Null, subscriptions.count()));
                }
                for name in targets {
                    if verb == "UNSUBSCRIBE" {
                        subscriptions.channels.remove(&name);
                    } else {
                        subscriptions.patterns.remove(&name);
                    }
                    acks.push((Frame::Bulk(name), subscriptions.count()));
                }
            }
        }

        for (name, count) in acks {
            self.reply(Frame::Array(vec![
                Frame::Bulk(kind.clone()),
                name,
                Frame::Integer(count),
            ]));
        }
    }
}

impl Shared {
    fn execute(&self, args: &[Bytes]) -> Frame {
        let verb = String::from_utf8_lossy(&args[0]).to_uppercase();
        let arg = |n: usize| args.get(n).cloned();

        match verb.as_str() {
            "PING" => Frame::Simple("PONG".to_string()),
            "AUTH" => match (&self.password, args.last()) {
                (None, _) => error("ERR AUTH called without any password configured"),
                (Some(password), Some(given)) if given.as_ref() == password.as_bytes() => ok(),
                _ => error("WRONGPASS invalid username-password pair or user is disabled."),
            },
            "SELECT" => match arg(1).and_then(|db| String::from_utf8(db.to_vec()).ok()) {
                Some(db) if db.parse::<u32>().is_ok_and(|db| db < 16) => ok(),
                _ => error("ERR DB index is out of range"),
            },
            "GET" => match arg(1) {
                Some(key) => match self.store.lock().unwrap().get(&key) {
                    Some(value) => Frame::Bulk(value.clone()),
                    None => Frame::Null,
                },
                None => arity(&verb),
            },
            "SET" => match (arg(1), arg(2)) {
                (Some(key), Some(value)) => {
                    self.store.lock().unwrap().insert(key, value);
                    ok()
                }
                _ => arity(&verb),
            },
            "INCR" => match arg(1) {
                Some(key) => {
                    let mut store = self.store.lock().unwrap();
                    let current = match store.get(&key) {
                        Some(value) => std::str::from_utf8(value)
                            .ok()
                            .and_then(|value| value.parse::<i64>().ok()),
                        None => Some(0),
                    };
                    match current {
                        Some(current) => {
                            store.insert(key, Bytes::from((current + 1).to_string()));
                            Frame::Integer(current + 1)
                        }
                        None => error("ERR value is not an integer or out of range"),
                    }
                }
                None => arity(&verb),
            },
            "DEL" => {
                let mut store = self.store.lock().unwrap();
                let removed = args[1..]
                    .iter()
                    .filter(|key| store.remove(*key).is_some())
                    .count();
                Frame::Integer(removed as i64)
            }
            "PUBLISH" => match (arg(1), arg(2)) {
                (Some(channel), Some(payload)) => self.publish(channel, payload),
                _ => arity(&verb),
            },
            _ => error(&format!("ERR unknown command '{verb}'")),
        }
    }

    fn publish(&self, channel: Bytes, payload: Bytes) -> Frame {
        let subscribers = self.subscribers.lock().unwrap();
        let mut receivers = 0;

        for subscriptions in subscribers.values() {
            if subscriptions.channels.contains(&channel) {
                let _ = subscriptions.tx.send(Frame::Array(vec![
                    Frame::Bulk(Bytes::from("message")),
                    Frame::Bulk(channel.clone()),
                    Frame::Bulk(payload.clone()),
                ]));
                receivers += 1;
            }
            for pattern in &subscriptions.patterns {
                if matches_pattern(pattern, &channel) {
                    let _ = subscriptions.tx.send(Frame::Array(vec![
                        Frame::Bulk(Bytes::from("pmessage")),
                        Frame::Bulk(pattern.clone()),
                        Frame::Bulk(channel.clone()),
                        Frame::Bulk(payload.clone()),
                    ]));
                    receivers += 1;
                }
            }
        }

        Frame::Integer(receivers)
    }
}

// Only trailing `*` globs.
fn matches_pattern(pattern: &[u8], channel: &[u8]) -> bool {
    match pattern.strip_suffix(b"*") {
        Some(prefix) => channel.starts_with(prefix),
        None => pattern == channel,
    }
}

fn ok() -> Frame {
    Frame::Simple("OK".to_string())
}

fn error(message: &str) -> Frame {
    Frame::Error(message.to_string())
}

fn arity(verb: &str) -> Frame {
    error(&format!(
        "ERR wrong number of arguments for '{}' command",
        verb.to_lowercase()
    ))
}
