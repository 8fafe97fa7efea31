use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::Value;
use tokio::io::AsyncReadExt;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpListener;
use tokio::time::timeout;

use crate::config::Config;
use crate::handlers;
use crate::models::{is_system_name, timestamp_now, MessageKind};
use crate::registry::{is_critical, ClientHandle, Registry};
use crate::store::Store;

/// Consecutive read failures tolerated before a connection is dropped.
const MAX_READ_FAILURES: u32 = 3;

/// Shared state of the chat router: configuration, the durable store, the
/// live-connection registry, and the shutdown flag.
pub struct ChatServer {
    pub config: Config,
    pub store: Arc<Store>,
    pub registry: Registry,
    pub running: Arc<AtomicBool>,
    /// Serializes append-and-fan-out so every recipient observes one scope's
    /// messages in the order the router observed them.
    route_lock: tokio::sync::Mutex<()>,
}

impl ChatServer {
    pub fn new(config: Config, store: Arc<Store>, running: Arc<AtomicBool>) -> Arc<ChatServer> {
        Arc::new(ChatServer {
            config,
            store,
            registry: Registry::new(),
            running,
            route_lock: tokio::sync::Mutex::new(()),
        })
    }
}

/// Bind the chat listener and spawn the acceptor task. Returns the bound
/// address (tests bind port 0).
pub async fn spawn(server: Arc<ChatServer>) -> std::io::Result<SocketAddr> {
    let listener =
        TcpListener::bind((server.config.bind_addr(), server.config.chat_port)).await?;
    let addr = listener.local_addr()?;
    println!("✓ Chat server started on {addr}");
    tokio::spawn(accept_loop(server, listener));
    Ok(addr)
}

/// Accept loop, polled with a 1 s timeout so the running flag can stop it.
async fn accept_loop(server: Arc<ChatServer>, listener: TcpListener) {
    while server.running.load(Ordering::Relaxed) {
        match timeout(std::time::Duration::from_secs(1), listener.accept()).await {
            Ok(Ok((stream, addr))) => {
                println!("📥 New connection from {addr}");
                tokio::spawn(handle_client(server.clone(), stream, addr));
            }
            Ok(Err(e)) => {
                if server.running.load(Ordering::Relaxed) {
                    eprintln!("❌ Error accepting connection: {e}");
                }
            }
            Err(_) => continue,
        }
    }
}

async fn handle_client(server: Arc<ChatServer>, stream: tokio::net::TcpStream, addr: SocketAddr) {
    let (mut reader, writer) = stream.into_split();
    let mut buf: Vec<u8> = Vec::new();

    // Handshake: the first frame must carry the identity, within the
    // deadline. Anything else closes the connection quietly.
    let first_line =
        match timeout(server.config.handshake_timeout, read_line(&mut reader, &mut buf)).await {
            Ok(Some(line)) => line,
            Ok(None) => return,
            Err(_) => {
                eprintln!("⏱️ Handshake timeout for {addr}");
                return;
            }
        };
    let Some(username) = parse_handshake(&first_line) else {
        eprintln!("⚠️ Invalid handshake from {addr}");
        return;
    };

    let system = is_system_name(&username);
    let conn = server.registry.register(&username, addr, system, writer);

    if system {
        println!("🔧 System identity '{username}' connected from {addr}");
    } else {
        println!("✓ User '{username}' connected from {addr}");
        server.store.update_user(&username, &addr.ip().to_string());
        send_welcome(&server, &conn).await;
    }

    // Frames that arrived in the same segment as the handshake are already
    // buffered; they are dispatched after the welcome payload.
    let mut read_failures = 0u32;
    loop {
        while let Some(line) = take_line(&mut buf) {
            process_frame(&server, &conn, &line).await;
        }
        if !server.running.load(Ordering::Relaxed) {
            break;
        }
        let mut chunk = [0u8; 4096];
        match reader.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => {
                read_failures = 0;
                buf.extend_from_slice(&chunk[..n]);
            }
            Err(e) if is_critical(&e) => break,
            Err(e) => {
                read_failures += 1;
                eprintln!("❌ Error reading from {}: {e}", conn.username);
                if read_failures >= MAX_READ_FAILURES {
                    break;
                }
            }
        }
    }

    reap(&server, vec![conn]).await;
}

/// `{"username": "<name>"}` — anything else is a handshake failure.
fn parse_handshake(line: &[u8]) -> Option<String> {
    let text = std::str::from_utf8(line).ok()?;
    let value: Value = serde_json::from_str(text).ok()?;
    let name = value.get("username")?.as_str()?.trim();
    if name.is_empty() {
        return None;
    }
    Some(name.to_string())
}

/// Read until the buffer holds a complete line. Returns `None` on EOF or a
/// critical transport error before any newline arrives.
async fn read_line(reader: &mut OwnedReadHalf, buf: &mut Vec<u8>) -> Option<Vec<u8>> {
    loop {
        if let Some(line) = take_line(buf) {
            return Some(line);
        }
        let mut chunk = [0u8; 1024];
        match reader.read(&mut chunk).await {
            Ok(0) => return None,
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
            Err(_) => return None,
        }
    }
}

/// Pop one complete newline-terminated frame off the decode buffer. A
/// buffer without a newline yields nothing, so partial reads never trigger
/// a handler.
fn take_line(buf: &mut Vec<u8>) -> Option<Vec<u8>> {
    let pos = buf.iter().position(|&b| b == b'\n')?;
    let mut line: Vec<u8> = buf.drain(..=pos).collect();
    line.pop();
    if line.last() == Some(&b'\r') {
        line.pop();
    }
    Some(line)
}

async fn process_frame(server: &Arc<ChatServer>, conn: &Arc<ClientHandle>, line: &[u8]) {
    let text = match std::str::from_utf8(line) {
        Ok(t) => t.trim(),
        Err(e) => {
            eprintln!("⚠️ Invalid UTF-8 from {}: {e}", conn.username);
            return;
        }
    };
    if text.is_empty() {
        return;
    }
    let mut msg: Value = match serde_json::from_str(text) {
        Ok(Value::Object(map)) => Value::Object(map),
        Ok(_) => {
            eprintln!("⚠️ Non-object frame from {}", conn.username);
            return;
        }
        Err(e) => {
            eprintln!("⚠️ Invalid JSON from {}: {e}", conn.username);
            return;
        }
    };

    conn.touch();
    if msg.get("timestamp").is_none() {
        msg["timestamp"] = Value::String(timestamp_now());
    }

    // Missing type defaults to a plain chat message, as deployed clients
    // rely on.
    let kind_str = msg
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or("chat")
        .to_string();
    let Some(kind) = MessageKind::from_wire(&kind_str) else {
        eprintln!("⚠️ Unknown message type '{kind_str}' from {}", conn.username);
        return;
    };

    let _route = server.route_lock.lock().await;
    handlers::dispatch(server, conn, kind, msg).await;
}

// ===== Welcome sequence =====

async fn send_welcome(server: &Arc<ChatServer>, conn: &Arc<ClientHandle>) {
    let username = conn.username.clone();
    let _route = server.route_lock.lock().await;

    let history = server.store.global_tail(300);
    let frames_ok = send_checked(server, conn, &serde_json::json!({
        "type": "chat_history",
        "messages": history,
    }))
    .await
        && send_checked(server, conn, &file_metadata_frame(server)).await
        && send_checked(server, conn, &group_list_frame(server)).await
        && send_checked(server, conn, &user_list_frame(server, &username)).await;
    if !frames_ok {
        return;
    }

    for pair in server.store.private_pairs_for(&username) {
        let Some(other) = pair.other(&username) else { continue };
        let (u1, u2) = pair.users();
        let messages = server.store.private_tail(u1, u2, 300);
        let frame = serde_json::json!({
            "type": "private_history",
            "receiver": other,
            "target_user": other,
            "messages": messages,
        });
        if !send_checked(server, conn, &frame).await {
            return;
        }
    }

    for group in server.store.groups_for(&username) {
        let frame = serde_json::json!({
            "type": "group_history",
            "group_id": group.id,
            "messages": server.store.group_tail(&group.id, 300),
        });
        if !send_checked(server, conn, &frame).await {
            return;
        }
    }

    let welcome = system_frame(&format!("Welcome {username}! You joined the chat"));
    if !send_checked(server, conn, &welcome).await {
        return;
    }

    broadcast(
        server,
        &system_frame(&format!("{username} joined the chat")),
        Some(conn.id),
    )
    .await;
    broadcast_user_lists(server).await;
}

async fn send_checked(server: &Arc<ChatServer>, conn: &Arc<ClientHandle>, frame: &Value) -> bool {
    if conn.send(frame).await.is_fatal() {
        reap(server, vec![conn.clone()]).await;
        return false;
    }
    true
}

// ===== Fan-out =====

pub fn system_frame(content: &str) -> Value {
    serde_json::json!({
        "type": "system",
        "sender": "Server",
        "content": content,
        "timestamp": timestamp_now(),
    })
}

pub fn user_list_frame(server: &ChatServer, viewer: &str) -> Value {
    serde_json::json!({
        "type": "user_list",
        "users": server.registry.user_list_for(viewer),
    })
}

pub fn group_list_frame(server: &ChatServer) -> Value {
    let groups: Vec<Value> = server
        .store
        .groups_snapshot()
        .iter()
        .map(|g| g.to_wire())
        .collect();
    serde_json::json!({ "type": "group_list", "groups": groups })
}

pub fn file_metadata_frame(server: &ChatServer) -> Value {
    serde_json::json!({
        "type": "file_metadata",
        "files": server.store.files_snapshot(),
    })
}

/// Send one frame to a single connection, reaping it on a fatal outcome.
pub async fn send_to(server: &Arc<ChatServer>, conn: &Arc<ClientHandle>, frame: &Value) {
    if conn.send(frame).await.is_fatal() {
        reap(server, vec![conn.clone()]).await;
    }
}

/// Broadcast to every non-system connection (minus an optional exclusion).
/// Targets are snapshotted under the registry lock; writes happen outside
/// it; fatal peers are reaped afterwards.
pub async fn broadcast(server: &Arc<ChatServer>, frame: &Value, exclude: Option<u64>) {
    let targets = server.registry.broadcast_targets(exclude);
    deliver(server, &targets, frame).await;
}

/// Deliver a frame to an explicit target set, then reap the dead.
pub async fn deliver(server: &Arc<ChatServer>, targets: &[Arc<ClientHandle>], frame: &Value) {
    let mut dead = Vec::new();
    for target in targets {
        if target.send(frame).await.is_fatal() {
            dead.push(target.clone());
        }
    }
    if !dead.is_empty() {
        reap(server, dead).await;
    }
}

/// Fresh tailored user list to every connected client, best-effort.
pub async fn broadcast_user_lists(server: &Arc<ChatServer>) {
    for target in server.registry.broadcast_targets(None) {
        let frame = user_list_frame(server, &target.username);
        let _ = target.send(&frame).await;
    }
}

/// Remove connections from the registry and announce the departure. The
/// leave broadcast is best-effort: failures during it only bump failure
/// counters, and the next heartbeat tick decides. That bounds reap
/// recursion at one level.
pub async fn reap(server: &Arc<ChatServer>, handles: Vec<Arc<ClientHandle>>) {
    for handle in handles {
        // A fan-out and the reader task can race to reap; only the one that
        // actually removed the entry announces.
        if server.registry.remove(handle.id).is_none() {
            continue;
        }
        println!("👋 User '{}' disconnected", handle.username);
        if handle.system {
            continue;
        }
        let leave = system_frame(&format!("{} left the chat", handle.username));
        for target in server.registry.broadcast_targets(None) {
            let _ = target.send(&leave).await;
        }
        broadcast_user_lists(server).await;
    }
}
