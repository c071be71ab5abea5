//! Shared helpers for integration tests: in-memory transports, a RESP reply
//! encoder for fake servers, env and tracing guards.

use std::collections::{HashMap, VecDeque};
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use tvs_client::config::ClientConfig;
use tvs_client::transport::resp::{Frame, parse_frame};
use tvs_client::transport::{Command, Reply, Transport, TransportError};

pub fn bulk(s: &str) -> Reply {
    Reply::Bulk(s.as_bytes().to_vec())
}

/// `[cursor, [items...]]` scan page.
#[allow(dead_code)]
pub fn scan_page(cursor: &str, items: &[&str]) -> Reply {
    Reply::Array(vec![
        bulk(cursor),
        Reply::Array(items.iter().map(|s| bulk(s)).collect()),
    ])
}

/// Transport answering with pre-scripted replies in order and recording
/// every command it receives.
#[allow(dead_code)]
pub struct ScriptedTransport {
    replies: Mutex<VecDeque<Result<Reply, TransportError>>>,
    commands: Mutex<Vec<Command>>,
}

#[allow(dead_code)]
impl ScriptedTransport {
    pub fn new(replies: impl IntoIterator<Item = Result<Reply, TransportError>>) -> Self {
        Self {
            replies: Mutex::new(replies.into_iter().collect()),
            commands: Mutex::new(Vec::new()),
        }
    }

    pub fn ok(replies: impl IntoIterator<Item = Reply>) -> Self {
        Self::new(replies.into_iter().map(Ok))
    }

    pub fn commands(&self) -> Vec<Command> {
        self.commands.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.commands.lock().unwrap().len()
    }
}

impl Transport for ScriptedTransport {
    async fn execute(&self, command: Command) -> Result<Reply, TransportError> {
        self.commands.lock().unwrap().push(command);
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(TransportError::Protocol("script exhausted".to_string())))
    }
}

/// In-memory stand-in for the server side of `TVS.GETDISTANCE`.
///
/// Distances come from a fixed table. Each batch reply is sorted ascending
/// and honours `TOPN` and `MAX_DIST`, like the real server. Keys listed as
/// poisoned make the batch fail with a server error.
#[allow(dead_code)]
pub struct DistanceServer {
    distances: HashMap<String, f64>,
    poisoned: Vec<String>,
    delay: Duration,
    commands: Mutex<Vec<Command>>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
    completed: AtomicUsize,
    cancelled: AtomicUsize,
}

#[allow(dead_code)]
impl DistanceServer {
    pub fn new(distances: &[(&str, f64)]) -> Self {
        Self {
            distances: distances
                .iter()
                .map(|&(k, d)| (k.to_string(), d))
                .collect(),
            poisoned: Vec::new(),
            delay: Duration::ZERO,
            commands: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
            completed: AtomicUsize::new(0),
            cancelled: AtomicUsize::new(0),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn poison(mut self, key: &str) -> Self {
        self.poisoned.push(key.to_string());
        self
    }

    pub fn commands(&self) -> Vec<Command> {
        self.commands.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.commands.lock().unwrap().len()
    }

    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }

    pub fn cancelled(&self) -> usize {
        self.cancelled.load(Ordering::SeqCst)
    }

    fn poisoned_key(&self, command: &Command) -> Option<String> {
        command
            .arg_strings()
            .into_iter()
            .skip(3)
            .find(|arg| self.poisoned.contains(arg))
    }

    fn answer(&self, command: &Command) -> Result<Reply, TransportError> {
        let args = command.arg_strings();
        let n: usize = args[2]
            .parse()
            .map_err(|_| TransportError::Protocol("bad key count".to_string()))?;
        let keys = &args[3..3 + n];
        let mut top_n = usize::MAX;
        let mut max_dist = f64::INFINITY;
        let mut rest = args[3 + n..].iter();
        while let Some(opt) = rest.next() {
            let value = rest.next().cloned().unwrap_or_default();
            match opt.as_str() {
                "TOPN" => top_n = value.parse().unwrap(),
                "MAX_DIST" => max_dist = value.parse().unwrap(),
                _ => {}
            }
        }

        let mut scored: Vec<(String, f64)> = keys
            .iter()
            .filter_map(|k| self.distances.get(k).map(|&d| (k.clone(), d)))
            .filter(|&(_, d)| d <= max_dist)
            .collect();
        scored.sort_by(|a, b| a.1.total_cmp(&b.1));
        scored.truncate(top_n);

        Ok(Reply::Array(
            scored
                .into_iter()
                .flat_map(|(k, d)| [bulk(&k), bulk(&format!("{d:.6}"))])
                .collect(),
        ))
    }
}

/// Counts a batch as cancelled when it is dropped before finishing.
struct InFlight<'a> {
    server: &'a DistanceServer,
    finished: bool,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.server.in_flight.fetch_sub(1, Ordering::SeqCst);
        if self.finished {
            self.server.completed.fetch_add(1, Ordering::SeqCst);
        } else {
            self.server.cancelled.fetch_add(1, Ordering::SeqCst);
        }
    }
}

impl Transport for DistanceServer {
    async fn execute(&self, command: Command) -> Result<Reply, TransportError> {
        assert_eq!(command.name(), "TVS.GETDISTANCE");
        self.commands.lock().unwrap().push(command.clone());

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        let mut guard = InFlight {
            server: self,
            finished: false,
        };

        // Poisoned batches fail straight away; healthy ones take `delay`.
        let reply = match self.poisoned_key(&command) {
            Some(bad) => Err(TransportError::Server(format!("ERR poisoned key {bad}"))),
            None => {
                if !self.delay.is_zero() {
                    tokio::time::sleep(self.delay).await;
                }
                self.answer(&command)
            }
        };
        guard.finished = true;
        reply
    }
}

/// Encode a reply the way a RESP2 server would (for fake TCP servers).
#[allow(dead_code)]
pub fn encode_reply(reply: &Reply) -> Vec<u8> {
    let mut out = Vec::new();
    write_reply(&mut out, reply);
    out
}

fn write_reply(out: &mut Vec<u8>, reply: &Reply) {
    match reply {
        Reply::Nil => out.extend_from_slice(b"$-1\r\n"),
        Reply::Integer(n) => out.extend_from_slice(format!(":{n}\r\n").as_bytes()),
        Reply::Status(s) => out.extend_from_slice(format!("+{s}\r\n").as_bytes()),
        Reply::Bulk(bytes) => {
            out.extend_from_slice(format!("${}\r\n", bytes.len()).as_bytes());
            out.extend_from_slice(bytes);
            out.extend_from_slice(b"\r\n");
        }
        Reply::Array(items) => {
            out.extend_from_slice(format!("*{}\r\n", items.len()).as_bytes());
            for item in items {
                write_reply(out, item);
            }
        }
    }
}

/// Encode an error reply.
#[allow(dead_code)]
pub fn encode_error(message: &str) -> Vec<u8> {
    format!("-{message}\r\n").into_bytes()
}

/// Minimal blocking RESP server on a loopback port.
///
/// Each accepted connection gets its own thread. Every parsed command is
/// recorded (name first) and answered with the bytes `handler` returns;
/// returning no bytes closes the connection. [`FakeServer::start_closing`]
/// hangs up after every reply, like a server with a short idle timeout.
#[allow(dead_code)]
pub struct FakeServer {
    pub port: u16,
    received: Arc<Mutex<Vec<Vec<String>>>>,
    connections: Arc<AtomicUsize>,
}

#[allow(dead_code)]
impl FakeServer {
    pub fn start<F>(handler: F) -> Self
    where
        F: Fn(&[String]) -> Vec<u8> + Send + Sync + 'static,
    {
        Self::spawn(handler, false)
    }

    pub fn start_closing<F>(handler: F) -> Self
    where
        F: Fn(&[String]) -> Vec<u8> + Send + Sync + 'static,
    {
        Self::spawn(handler, true)
    }

    fn spawn<F>(handler: F, close_after_reply: bool) -> Self
    where
        F: Fn(&[String]) -> Vec<u8> + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind fake server");
        let port = listener.local_addr().unwrap().port();
        let received = Arc::new(Mutex::new(Vec::new()));
        let connections = Arc::new(AtomicUsize::new(0));
        let handler = Arc::new(handler);

        {
            let received = Arc::clone(&received);
            let connections = Arc::clone(&connections);
            thread::spawn(move || {
                for stream in listener.incoming() {
                    let Ok(stream) = stream else { break };
                    connections.fetch_add(1, Ordering::SeqCst);
                    let received = Arc::clone(&received);
                    let handler = Arc::clone(&handler);
                    thread::spawn(move || serve(stream, &*handler, &received, close_after_reply));
                }
            });
        }

        Self {
            port,
            received,
            connections,
        }
    }

    pub fn config(&self) -> ClientConfig {
        ClientConfig {
            port: self.port,
            ..ClientConfig::default()
        }
    }

    pub fn received(&self) -> Vec<Vec<String>> {
        self.received.lock().unwrap().clone()
    }

    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }
}

fn serve(
    mut stream: TcpStream,
    handler: &(dyn Fn(&[String]) -> Vec<u8> + Send + Sync),
    received: &Mutex<Vec<Vec<String>>>,
    close_after_reply: bool,
) {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        while let Ok(Some((frame, used))) = parse_frame(&buf) {
            buf.drain(..used);
            let args = frame_strings(frame);
            received.lock().unwrap().push(args.clone());
            let reply = handler(&args);
            // An empty answer hangs up on the client.
            if reply.is_empty() || stream.write_all(&reply).is_err() || close_after_reply {
                return;
            }
        }
        match stream.read(&mut chunk) {
            Ok(0) | Err(_) => return,
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
        }
    }
}

fn frame_strings(frame: Frame) -> Vec<String> {
    match frame {
        Frame::Array(Some(items)) => items
            .into_iter()
            .map(|item| match item {
                Frame::Bulk(Some(bytes)) => String::from_utf8_lossy(&bytes).into_owned(),
                other => format!("{other:?}"),
            })
            .collect(),
        other => vec![format!("{other:?}")],
    }
}

/// Captures tracing output for tests.
#[allow(dead_code)]
pub struct TestTracing {
    buffer: Arc<Mutex<Vec<u8>>>,
}

#[allow(dead_code)]
impl TestTracing {
    pub fn new() -> Self {
        Self {
            buffer: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn install(&self) -> tracing::subscriber::DefaultGuard {
        let writer = self.buffer.clone();
        let make_writer = move || TestWriter(writer.clone());
        let subscriber = tracing_subscriber::fmt()
            .with_ansi(false)
            .without_time()
            .with_max_level(tracing::Level::DEBUG)
            .with_writer(make_writer)
            .finish();
        tracing::subscriber::set_default(subscriber)
    }

    pub fn output(&self) -> String {
        let buf = self.buffer.lock().unwrap();
        String::from_utf8_lossy(&buf).to_string()
    }

    /// Assert that the captured log output contains the provided substring.
    pub fn assert_contains(&self, needle: &str) {
        let out = self.output();
        assert!(
            out.contains(needle),
            "expected logs to contain `{needle}`, got:\n{out}"
        );
    }
}

struct TestWriter(Arc<Mutex<Vec<u8>>>);

impl Write for TestWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// RAII guard for a temporarily set environment variable.
#[allow(dead_code)]
pub struct EnvGuard {
    key: String,
    prev: Option<String>,
}

#[allow(dead_code)]
impl EnvGuard {
    pub fn set(key: &str, val: impl AsRef<str>) -> Self {
        let prev = std::env::var(key).ok();
        unsafe { std::env::set_var(key, val.as_ref()) };
        Self {
            key: key.to_string(),
            prev,
        }
    }

    pub fn unset(key: &str) -> Self {
        let prev = std::env::var(key).ok();
        unsafe { std::env::remove_var(key) };
        Self {
            key: key.to_string(),
            prev,
        }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        match &self.prev {
            Some(v) => unsafe { std::env::set_var(&self.key, v) },
            None => unsafe { std::env::remove_var(&self.key) },
        }
    }
}
