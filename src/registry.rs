use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;

/// A slow peer is dropped after this many consecutive failed writes.
const MAX_WRITE_FAILURES: u32 = 3;

/// Recent-chat deques keep at most this many peers.
const RECENT_LIMIT: usize = 5;

/// Result of one frame write, classified per the transport-error taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    /// Broken pipe / reset / aborted — disconnect immediately.
    Critical,
    /// Third consecutive transient failure — disconnect.
    GaveUp,
    /// Transient failure, counter below the limit — keep the connection.
    Transient,
}

impl SendOutcome {
    pub fn is_fatal(self) -> bool {
        matches!(self, SendOutcome::Critical | SendOutcome::GaveUp)
    }
}

/// One live chat connection: identity, write half, liveness bookkeeping.
/// The write half has its own async lock so fan-out tasks and the heartbeat
/// never interleave partial frames; nobody holds the registry lock across a
/// socket write.
pub struct ClientHandle {
    pub id: u64,
    pub username: String,
    pub addr: SocketAddr,
    /// Decided once at handshake from the `_…_` sentinel. System connections
    /// may emit events but receive no broadcasts and are never listed.
    pub system: bool,
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
    last_activity: Mutex<Instant>,
    failures: AtomicU32,
}

impl ClientHandle {
    /// Refresh the last-activity instant. Called for every received frame,
    /// pings and pongs included.
    pub fn touch(&self) {
        *self.last_activity.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .elapsed()
    }

    /// Write one newline-delimited frame. Success resets the failure
    /// counter; errors are classified critical or transient.
    pub async fn send(&self, frame: &Value) -> SendOutcome {
        let mut line = frame.to_string();
        line.push('\n');
        let mut writer = self.writer.lock().await;
        match writer.write_all(line.as_bytes()).await {
            Ok(()) => {
                self.failures.store(0, Ordering::Relaxed);
                SendOutcome::Sent
            }
            Err(e) if is_critical(&e) => SendOutcome::Critical,
            Err(_) => {
                let failures = self.failures.fetch_add(1, Ordering::Relaxed) + 1;
                if failures >= MAX_WRITE_FAILURES {
                    SendOutcome::GaveUp
                } else {
                    SendOutcome::Transient
                }
            }
        }
    }
}

/// Errors that mean the peer is gone rather than slow.
pub fn is_critical(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::UnexpectedEof
            | std::io::ErrorKind::NotConnected
    )
}

struct RegistryInner {
    clients: HashMap<u64, Arc<ClientHandle>>,
    recent_chats: HashMap<String, VecDeque<String>>,
}

/// Authoritative map of live connections plus the per-user recent-chat
/// deques. One lock; every lookup that escapes it returns cloned `Arc`s.
pub struct Registry {
    inner: Mutex<RegistryInner>,
    next_id: AtomicU64,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Registry {
        Registry {
            inner: Mutex::new(RegistryInner {
                clients: HashMap::new(),
                recent_chats: HashMap::new(),
            }),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn register(
        &self,
        username: &str,
        addr: SocketAddr,
        system: bool,
        writer: OwnedWriteHalf,
    ) -> Arc<ClientHandle> {
        let handle = Arc::new(ClientHandle {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            username: username.to_string(),
            addr,
            system,
            writer: tokio::sync::Mutex::new(writer),
            last_activity: Mutex::new(Instant::now()),
            failures: AtomicU32::new(0),
        });
        let mut inner = self.lock();
        inner.clients.insert(handle.id, handle.clone());
        if !system {
            inner.recent_chats.entry(username.to_string()).or_default();
        }
        handle
    }

    /// Drop a connection from the registry. Returns the handle if it was
    /// still present, so the caller runs the leave announcements exactly
    /// once even when reader task and fan-out race to reap.
    pub fn remove(&self, id: u64) -> Option<Arc<ClientHandle>> {
        self.lock().clients.remove(&id)
    }

    pub fn find_by_name(&self, name: &str) -> Option<Arc<ClientHandle>> {
        self.lock()
            .clients
            .values()
            .find(|c| c.username == name)
            .cloned()
    }

    /// Snapshot of every live connection, system identities included.
    pub fn snapshot(&self) -> Vec<Arc<ClientHandle>> {
        self.lock().clients.values().cloned().collect()
    }

    /// Broadcast targets: every non-system connection, minus an optional
    /// excluded connection id.
    pub fn broadcast_targets(&self, exclude: Option<u64>) -> Vec<Arc<ClientHandle>> {
        self.lock()
            .clients
            .values()
            .filter(|c| !c.system && Some(c.id) != exclude)
            .cloned()
            .collect()
    }

    /// Online members of a name set (non-system connections only).
    pub fn connections_named(&self, names: &HashSet<String>) -> Vec<Arc<ClientHandle>> {
        self.lock()
            .clients
            .values()
            .filter(|c| !c.system && names.contains(&c.username))
            .cloned()
            .collect()
    }

    /// The user list as seen by `viewer`: sorted live non-system names,
    /// excluding the viewer itself.
    pub fn user_list_for(&self, viewer: &str) -> Vec<String> {
        let mut names: Vec<String> = self
            .lock()
            .clients
            .values()
            .filter(|c| !c.system && c.username != viewer)
            .map(|c| c.username.clone())
            .collect();
        names.sort();
        names.dedup();
        names
    }

    pub fn live_names(&self) -> HashSet<String> {
        self.lock()
            .clients
            .values()
            .filter(|c| !c.system)
            .map(|c| c.username.clone())
            .collect()
    }

    // ===== Recent chats =====

    /// Record a send/receive peer: inserted at the front if absent, deque
    /// truncated to the limit. (Existing entries keep their position; an
    /// explicit `save_recent_chat` promotes.)
    pub fn note_recent(&self, user: &str, peer: &str) {
        let mut inner = self.lock();
        if let Some(recent) = inner.recent_chats.get_mut(user)
            && !recent.iter().any(|p| p == peer)
        {
            recent.push_front(peer.to_string());
            recent.truncate(RECENT_LIMIT);
        }
    }

    /// Move-to-front, for the client's explicit `save_recent_chat`.
    pub fn promote_recent(&self, user: &str, peer: &str) {
        let mut inner = self.lock();
        if let Some(recent) = inner.recent_chats.get_mut(user) {
            recent.retain(|p| p != peer);
            recent.push_front(peer.to_string());
            recent.truncate(RECENT_LIMIT);
        }
    }

    pub fn recent_of(&self, user: &str) -> Vec<String> {
        self.lock()
            .recent_chats
            .get(user)
            .map(|d| d.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RegistryInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}
