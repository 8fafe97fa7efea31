use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use shadow_nexus::config::Config;
use shadow_nexus::CoreHandles;

/// A booted server on ephemeral ports with a throwaway data directory.
/// Dropping it deletes the directory (prevents /tmp accumulation across
/// parallel test runs).
pub struct TestServer {
    pub handles: CoreHandles,
    pub config: Config,
    data_dir: PathBuf,
}

impl Drop for TestServer {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.data_dir);
    }
}

impl TestServer {
    pub fn chat_addr(&self) -> SocketAddr {
        self.handles.chat_addr
    }

    pub fn file_addr(&self) -> SocketAddr {
        self.handles.file_addr
    }

    pub fn data_file(&self, name: &str) -> PathBuf {
        self.data_dir.join(name)
    }
}

/// Unique temp data dir per test (avoids parallel test contention) and a
/// config with ephemeral ports. Heartbeat timers are parked out of the way;
/// tests that exercise them shrink the values first.
pub fn test_config() -> Config {
    let data_dir = std::env::temp_dir().join(format!(
        "nexus_test_{}",
        uuid::Uuid::new_v4().simple()
    ));
    Config {
        server_ip: "127.0.0.1".to_string(),
        chat_port: 0,
        file_port: 0,
        video_port: 0,
        audio_port: 0,
        data_dir,
        handshake_timeout: Duration::from_secs(5),
        heartbeat_interval: Duration::from_secs(60),
        idle_timeout: Duration::from_secs(600),
        transfer_timeout: Duration::from_secs(30),
    }
}

pub async fn test_server() -> TestServer {
    test_server_with(test_config()).await
}

pub async fn test_server_with(config: Config) -> TestServer {
    let data_dir = config.data_dir.clone();
    let handles = shadow_nexus::start_core(config.clone())
        .await
        .expect("server boots");
    TestServer {
        handles,
        config,
        data_dir,
    }
}

/// A protocol-speaking chat client: newline-delimited JSON over a plain
/// `TcpStream`.
pub struct Peer {
    stream: TcpStream,
    buf: Vec<u8>,
}

impl Peer {
    /// Connect without handshaking, for tests that drive the first bytes
    /// themselves.
    pub async fn connect_raw(addr: SocketAddr) -> Peer {
        let stream = TcpStream::connect(addr).await.expect("connect to chat");
        Peer {
            stream,
            buf: Vec::new(),
        }
    }

    /// Connect and send the identity handshake; the welcome payload is left
    /// unread for tests that assert on it.
    pub async fn connect(addr: SocketAddr, username: &str) -> Peer {
        let mut peer = Peer::connect_raw(addr).await;
        peer.send(&serde_json::json!({ "username": username })).await;
        peer
    }

    /// Connect and consume the whole welcome sequence, including the
    /// tailored user list broadcast that follows the welcome frame.
    pub async fn connect_ready(addr: SocketAddr, username: &str) -> Peer {
        let mut peer = Peer::connect(addr, username).await;
        peer.recv_system_containing("Welcome").await;
        peer.recv_type("user_list").await;
        peer
    }

    pub async fn send(&mut self, frame: &Value) {
        let mut line = frame.to_string();
        line.push('\n');
        self.stream
            .write_all(line.as_bytes())
            .await
            .expect("send frame");
    }

    pub async fn send_raw(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).await.expect("send bytes");
    }

    /// Next frame, failing the test if none arrives in time.
    pub async fn recv(&mut self) -> Value {
        self.try_recv(Duration::from_secs(5))
            .await
            .expect("expected a frame, connection went quiet")
    }

    /// Next frame within the deadline, or `None` on silence/close.
    pub async fn try_recv(&mut self, deadline: Duration) -> Option<Value> {
        let end = Instant::now() + deadline;
        loop {
            if let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = self.buf.drain(..=pos).collect();
                let text = String::from_utf8_lossy(&line[..line.len() - 1]).to_string();
                if text.trim().is_empty() {
                    continue;
                }
                return serde_json::from_str(text.trim()).ok();
            }
            let remaining = end.checked_duration_since(Instant::now())?;
            let mut chunk = [0u8; 4096];
            match timeout(remaining, self.stream.read(&mut chunk)).await {
                Ok(Ok(0)) => return None,
                Ok(Ok(n)) => self.buf.extend_from_slice(&chunk[..n]),
                Ok(Err(_)) => return None,
                Err(_) => return None,
            }
        }
    }

    /// Skip frames until one of the given type arrives.
    pub async fn recv_type(&mut self, kind: &str) -> Value {
        for _ in 0..100 {
            let frame = self.recv().await;
            if frame["type"] == kind {
                return frame;
            }
        }
        panic!("never received a '{kind}' frame");
    }

    pub async fn recv_system_containing(&mut self, needle: &str) -> Value {
        for _ in 0..100 {
            let frame = self.recv().await;
            if frame["type"] == "system"
                && frame["content"].as_str().unwrap_or("").contains(needle)
            {
                return frame;
            }
        }
        panic!("never received a system frame containing '{needle}'");
    }

    /// Assert no traffic arrives within the window.
    pub async fn expect_silence(&mut self, window: Duration) {
        if let Some(frame) = self.try_recv(window).await {
            panic!("expected no traffic, got: {frame}");
        }
    }
}

/// Poll a JSON data file until `predicate` holds (the store's writer task
/// flushes asynchronously).
pub async fn wait_for_file<F>(path: &PathBuf, predicate: F)
where
    F: Fn(&Value) -> bool,
{
    for _ in 0..400 {
        if let Ok(raw) = std::fs::read_to_string(path)
            && let Ok(value) = serde_json::from_str::<Value>(&raw)
            && predicate(&value)
        {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("data file {path:?} never reached the expected state");
}
