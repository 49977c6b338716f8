//! In-process stand-in for a Redis server
//!
//! Understands `AUTH`, `SCRIPT LOAD` and `EVAL`. `EVAL` does not run Lua:
//! it reads `tokens`, `rate` and `ttl` back out of the script text and runs
//! the same token bucket natively. Key expiry follows the timestamps passed
//! to the script, so tests control time completely.

#![allow(dead_code)]

use bytes::{Bytes, BytesMut};
use limitcrab::connector::{Connector, FnConnector};
use limitcrab::resp::{Reply, ReplyParser};
use parking_lot::Mutex;
use sha1::{Digest, Sha1};
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, duplex};
use tokio::net::TcpListener;

/// How the server answers `EVAL`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Mode {
    Normal = 0,
    /// Close the connection instead of replying
    HangUp = 1,
    /// Reply `+OK` instead of the integer triple
    WrongShape = 2,
    /// Reply bytes that are not valid RESP
    Garbage = 3,
}

struct Bucket {
    last: u64,
    available: f64,
    expires_at: u64,
}

#[derive(Default)]
struct Inner {
    buckets: Mutex<HashMap<String, Bucket>>,
    scripts: Mutex<HashMap<String, String>>,
    eval_shas: Mutex<Vec<String>>,
    credentials: Mutex<Option<(Option<String>, String)>>,
    reject_script_load: AtomicBool,
    refuse: AtomicBool,
    mode: AtomicU8,
    eval_delay_ms: AtomicU64,
    dial_delay_ms: AtomicU64,
    dialed: AtomicUsize,
    open: AtomicUsize,
    peak_open: AtomicUsize,
    evals: AtomicUsize,
}

#[derive(Clone, Default)]
pub struct FakeRedis {
    inner: Arc<Inner>,
}

impl FakeRedis {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn require_auth(&self, username: Option<&str>, password: &str) {
        *self.inner.credentials.lock() = Some((username.map(String::from), password.to_string()));
    }

    pub fn reject_script_load(&self) {
        self.inner.reject_script_load.store(true, Ordering::SeqCst);
    }

    /// Make every new dial fail
    pub fn refuse_connections(&self, refuse: bool) {
        self.inner.refuse.store(refuse, Ordering::SeqCst);
    }

    pub fn set_mode(&self, mode: Mode) {
        self.inner.mode.store(mode as u8, Ordering::SeqCst);
    }

    pub fn set_eval_delay(&self, delay: Duration) {
        self.inner
            .eval_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Stall every new dial for `delay` before it connects
    pub fn set_dial_delay(&self, delay: Duration) {
        self.inner
            .dial_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn dialed(&self) -> usize {
        self.inner.dialed.load(Ordering::SeqCst)
    }

    pub fn open_connections(&self) -> usize {
        self.inner.open.load(Ordering::SeqCst)
    }

    pub fn peak_connections(&self) -> usize {
        self.inner.peak_open.load(Ordering::SeqCst)
    }

    pub fn evals(&self) -> usize {
        self.inner.evals.load(Ordering::SeqCst)
    }

    pub fn loaded_scripts(&self) -> Vec<String> {
        self.inner.scripts.lock().keys().cloned().collect()
    }

    /// Fingerprints of every script body received through `EVAL`
    pub fn eval_shas(&self) -> Vec<String> {
        self.inner.eval_shas.lock().clone()
    }

    pub fn has_key(&self, key: &str) -> bool {
        self.inner.buckets.lock().contains_key(key)
    }

    /// Connector that hands out in-memory pipes to this server
    pub fn connector(&self) -> impl Connector {
        let inner = self.inner.clone();
        FnConnector::new(move || {
            let inner = inner.clone();
            async move {
                let delay = inner.dial_delay_ms.load(Ordering::SeqCst);
                if delay > 0 {
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                }
                if inner.refuse.load(Ordering::SeqCst) {
                    return Err(io::Error::new(
                        io::ErrorKind::ConnectionRefused,
                        "fake server refusing connections",
                    ));
                }
                let (client, server) = duplex(64 * 1024);
                inner.accept();
                tokio::spawn(serve(inner, server));
                Ok(client)
            }
        })
    }

    /// Serve this fake on a loopback TCP port
    pub async fn listen(&self) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let inner = self.inner.clone();

        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                inner.accept();
                tokio::spawn(serve(inner.clone(), socket));
            }
        });
        addr
    }
}

impl Inner {
    fn accept(&self) {
        self.dialed.fetch_add(1, Ordering::SeqCst);
        let open = self.open.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_open.fetch_max(open, Ordering::SeqCst);
    }

    fn handle(&self, args: &[Bytes], authed: &mut bool) -> Option<Reply> {
        let command = String::from_utf8_lossy(&args[0]).to_uppercase();

        let required = self.credentials.lock().clone();
        if command != "AUTH" && required.is_some() && !*authed {
            return Some(Reply::Error("NOAUTH Authentication required.".into()));
        }

        let reply = match command.as_str() {
            "AUTH" => self.auth(args, authed),
            "SCRIPT" if args.len() == 3 && args[1].eq_ignore_ascii_case(b"LOAD") => {
                if self.reject_script_load.load(Ordering::SeqCst) {
                    Reply::Error("ERR Error compiling script".into())
                } else {
                    let body = String::from_utf8_lossy(&args[2]).into_owned();
                    let sha = sha_of(&body);
                    self.scripts.lock().insert(sha.clone(), body);
                    Reply::Bulk(Some(Bytes::from(sha)))
                }
            }
            "EVAL" if args.len() == 5 => match Mode::from(self.mode.load(Ordering::SeqCst)) {
                Mode::HangUp | Mode::Garbage => return None,
                Mode::WrongShape => Reply::Status("OK".into()),
                Mode::Normal => self.eval(args),
            },
            _ => Reply::Error(format!("ERR unknown command '{command}'")),
        };
        Some(reply)
    }

    fn auth(&self, args: &[Bytes], authed: &mut bool) -> Reply {
        let given = match args.len() {
            2 => (None, String::from_utf8_lossy(&args[1]).into_owned()),
            3 => (
                Some(String::from_utf8_lossy(&args[1]).into_owned()),
                String::from_utf8_lossy(&args[2]).into_owned(),
            ),
            _ => return Reply::Error("ERR wrong number of arguments for 'auth' command".into()),
        };

        match self.credentials.lock().clone() {
            Some(expected) if expected == given => {
                *authed = true;
                Reply::Status("OK".into())
            }
            Some(_) => Reply::Error("WRONGPASS invalid username-password pair".into()),
            None => Reply::Error("ERR AUTH called without any password configured".into()),
        }
    }

    fn eval(&self, args: &[Bytes]) -> Reply {
        self.evals.fetch_add(1, Ordering::SeqCst);

        let body = String::from_utf8_lossy(&args[1]).into_owned();
        self.eval_shas.lock().push(sha_of(&body));

        let (Some(tokens), Some(rate), Some(ttl)) = (
            script_param(&body, "tokens"),
            script_param(&body, "rate"),
            script_param(&body, "ttl"),
        ) else {
            return Reply::Error("ERR script parameters missing".into());
        };
        let key = String::from_utf8_lossy(&args[3]).into_owned();
        let Ok(now) = String::from_utf8_lossy(&args[4]).parse::<u64>() else {
            return Reply::Error("ERR invalid timestamp".into());
        };

        let mut buckets = self.buckets.lock();
        let (last, mut available) = match buckets.get(&key) {
            Some(b) if b.expires_at > now => (b.last, b.available),
            _ => (now, tokens),
        };

        let stamp = if now > last {
            available = tokens.min(available + (now - last) as f64 / rate);
            now
        } else {
            last
        };

        let allowed = if available >= 1.0 {
            available -= 1.0;
            1
        } else {
            0
        };

        buckets.insert(
            key,
            Bucket {
                last: stamp,
                available,
                expires_at: now + (ttl as u64) * 1_000_000_000,
            },
        );

        Reply::Array(vec![
            Reply::Integer(available.floor() as i64),
            Reply::Integer((now as f64 + (tokens - available) * rate).floor() as i64),
            Reply::Integer(allowed),
        ])
    }
}

impl From<u8> for Mode {
    fn from(value: u8) -> Self {
        match value {
            1 => Mode::HangUp,
            2 => Mode::WrongShape,
            3 => Mode::Garbage,
            _ => Mode::Normal,
        }
    }
}

async fn serve<S: AsyncRead + AsyncWrite + Unpin>(inner: Arc<Inner>, mut socket: S) {
    let mut buf = Vec::new();
    let mut chunk = vec![0u8; 16 * 1024];
    let mut authed = false;

    'conn: loop {
        let n = match socket.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        buf.extend_from_slice(&chunk[..n]);

        while let Ok(Some((command, consumed))) = ReplyParser::new().parse(&buf) {
            buf.drain(..consumed);

            let args: Vec<Bytes> = match command {
                Reply::Array(items) => items
                    .into_iter()
                    .filter_map(|item| match item {
                        Reply::Bulk(Some(b)) => Some(b),
                        _ => None,
                    })
                    .collect(),
                _ => break 'conn,
            };
            if args.is_empty() {
                break 'conn;
            }

            let is_eval = args[0].eq_ignore_ascii_case(b"EVAL");
            let delay = inner.eval_delay_ms.load(Ordering::SeqCst);
            if is_eval && delay > 0 {
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }

            let Some(reply) = inner.handle(&args, &mut authed) else {
                if is_eval && Mode::from(inner.mode.load(Ordering::SeqCst)) == Mode::Garbage {
                    let _ = socket.write_all(b"!garbage\r\n").await;
                }
                break 'conn;
            };

            let mut out = BytesMut::new();
            reply.encode(&mut out);
            if socket.write_all(&out).await.is_err() {
                break 'conn;
            }
        }
    }

    inner.open.fetch_sub(1, Ordering::SeqCst);
}

fn sha_of(body: &str) -> String {
    hex::encode(Sha1::digest(body.as_bytes()))
}

/// Read `local <name> = <number>` out of a script body
fn script_param(body: &str, name: &str) -> Option<f64> {
    let prefix = format!("local {name} = ");
    body.lines()
        .find_map(|line| line.strip_prefix(prefix.as_str()))
        .and_then(|value| value.trim().parse().ok())
}

/// Nanoseconds since the unix epoch for `t`
pub fn nanos(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH).unwrap().as_nanos() as u64
}

/// Wait until `check` holds or a second has passed
pub async fn eventually(check: impl Fn() -> bool) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
