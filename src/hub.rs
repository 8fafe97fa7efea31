use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::events::{EventBus, EventTarget};
use crate::models::{timestamp_now, SessionInfo};

/// Which call medium a hub instance signals for. The video and audio hubs
/// run the same code on different ports and differ only in their room-page
/// path and the missed-event kind they emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallMedium {
    Video,
    Audio,
}

impl CallMedium {
    pub fn path(self) -> &'static str {
        match self {
            CallMedium::Video => "video",
            CallMedium::Audio => "audio",
        }
    }

    pub fn missed_kind(self) -> &'static str {
        match self {
            CallMedium::Video => "video_missed",
            CallMedium::Audio => "audio_missed",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            CallMedium::Video => "Video",
            CallMedium::Audio => "Audio",
        }
    }
}

struct Peer {
    name: String,
    room: Option<String>,
}

struct HubInner {
    sessions: HashMap<String, SessionInfo>,
    peers: HashMap<String, Peer>,
    rooms: HashMap<String, Vec<String>>,
}

/// WebRTC signaling hub: owns sessions, peers, and room membership. Rooms
/// are created on demand and destroyed when the participant set transitions
/// to empty, at which point a missed-call event is pushed back through the
/// chat router exactly once.
pub struct Hub {
    inner: Mutex<HubInner>,
    pub events: EventBus,
    pub medium: CallMedium,
    chat_addr: String,
    public_host: String,
    port: u16,
}

impl Hub {
    pub fn new(medium: CallMedium, chat_addr: String, public_host: String, port: u16) -> Arc<Hub> {
        Arc::new(Hub {
            inner: Mutex::new(HubInner {
                sessions: HashMap::new(),
                peers: HashMap::new(),
                rooms: HashMap::new(),
            }),
            events: EventBus::new(),
            medium,
            chat_addr,
            public_host,
            port,
        })
    }

    // ===== Sessions =====

    pub fn create_session(
        &self,
        session_type: &str,
        session_name: &str,
        creator: &str,
        chat_id: &str,
    ) -> SessionInfo {
        let id = new_short_id();
        let session = SessionInfo {
            id: id.clone(),
            session_type: session_type.to_string(),
            name: session_name.to_string(),
            creator: creator.to_string(),
            chat_id: chat_id.to_string(),
            created_at: chrono::Utc::now().to_rfc3339(),
        };
        self.lock().sessions.insert(id.clone(), session.clone());
        println!(
            "[{} HUB] Created session {id} ({session_type}) for chat {chat_id}",
            self.medium.label().to_uppercase()
        );
        session
    }

    pub fn session(&self, id: &str) -> Option<SessionInfo> {
        self.lock().sessions.get(id).cloned()
    }

    /// Joinable URL for a session.
    pub fn link_for(&self, session_id: &str) -> String {
        format!(
            "https://{}:{}/{}/{session_id}",
            self.public_host,
            self.port,
            self.medium.path()
        )
    }

    // ===== Peers & rooms =====

    /// Register a new event-stream connection and hand back its transport
    /// identity.
    pub fn connect_peer(&self) -> String {
        let sid = new_short_id();
        self.lock().peers.insert(
            sid.clone(),
            Peer {
                name: "Guest".to_string(),
                room: None,
            },
        );
        sid
    }

    /// Transport teardown: equivalent to `leave_session` for the peer's last
    /// known room, then the peer itself is forgotten.
    pub fn disconnect_peer(&self, sid: &str) {
        let room = self
            .lock()
            .peers
            .get(sid)
            .and_then(|p| p.room.clone());
        if let Some(room) = room {
            self.leave_session(sid, &room);
        }
        self.lock().peers.remove(sid);
    }

    /// Join a session. First joiner gets `user-list {my_id}`; later joiners
    /// get the current roster and existing participants get `user-connect`.
    pub fn join_session(&self, sid: &str, session_id: &str, username: &str) -> Result<(), String> {
        let mut inner = self.lock();
        if !inner.sessions.contains_key(session_id) {
            return Err("Invalid session".to_string());
        }
        let Some(peer) = inner.peers.get_mut(sid) else {
            return Err("Unknown peer".to_string());
        };
        peer.name = username.to_string();
        peer.room = Some(session_id.to_string());

        if !inner.rooms.contains_key(session_id) {
            inner
                .rooms
                .insert(session_id.to_string(), vec![sid.to_string()]);
            drop(inner);
            self.events.publish(
                EventTarget::Peer(sid.to_string()),
                "user-list",
                serde_json::json!({ "my_id": sid }),
            );
        } else {
            let roster: HashMap<String, String> = inner
                .rooms
                .get(session_id)
                .into_iter()
                .flatten()
                .filter_map(|id| inner.peers.get(id).map(|p| (id.clone(), p.name.clone())))
                .collect();
            if let Some(members) = inner.rooms.get_mut(session_id) {
                members.push(sid.to_string());
            }
            drop(inner);
            self.events.publish(
                EventTarget::Peer(sid.to_string()),
                "user-list",
                serde_json::json!({ "list": roster, "my_id": sid }),
            );
            self.events.publish(
                EventTarget::Room {
                    room: session_id.to_string(),
                    skip: Some(sid.to_string()),
                },
                "user-connect",
                serde_json::json!({ "sid": sid, "name": username }),
            );
        }
        println!(
            "[{} HUB] {username} <{sid}> joined session {session_id}",
            self.medium.label().to_uppercase()
        );
        Ok(())
    }

    /// Leave a session. Emits `user-disconnect` to the room; the transition
    /// to empty destroys the room and fires the missed-call event.
    pub fn leave_session(&self, sid: &str, session_id: &str) {
        let mut inner = self.lock();
        let mut emptied = false;
        if let Some(members) = inner.rooms.get_mut(session_id) {
            let before = members.len();
            members.retain(|m| m != sid);
            if members.len() == before {
                return;
            }
            emptied = members.is_empty();
            if emptied {
                inner.rooms.remove(session_id);
            }
        } else {
            return;
        }
        if let Some(peer) = inner.peers.get_mut(sid) {
            peer.room = None;
        }
        let session = if emptied {
            inner.sessions.remove(session_id)
        } else {
            None
        };
        drop(inner);

        self.events.publish(
            EventTarget::Room {
                room: session_id.to_string(),
                skip: None,
            },
            "user-disconnect",
            serde_json::json!({ "sid": sid }),
        );

        if let Some(session) = session {
            println!(
                "[{} HUB] Room {session_id} is now empty - notifying chat server",
                self.medium.label().to_uppercase()
            );
            let chat_addr = self.chat_addr.clone();
            let kind = self.medium.missed_kind();
            tokio::spawn(async move {
                notify_chat_missed(chat_addr, kind, session).await;
            });
        }
    }

    /// Forward WebRTC signaling data (offer/answer/ICE) verbatim between
    /// peers. The claimed `sender_id` must be the registered transport
    /// identity or the frame is dropped.
    pub fn forward_data(&self, sid: &str, msg: Value) -> bool {
        let sender_id = msg.get("sender_id").and_then(Value::as_str).unwrap_or("");
        if sender_id != sid || !self.lock().peers.contains_key(sid) {
            eprintln!(
                "[{} HUB] WARNING: sender_id mismatch, dropping data frame",
                self.medium.label().to_uppercase()
            );
            return false;
        }
        let Some(target) = msg.get("target_id").and_then(Value::as_str) else {
            return false;
        };
        self.events
            .publish(EventTarget::Peer(target.to_string()), "data", msg.clone());
        true
    }

    /// Auxiliary room event (`hand_raise`, `screen_share`, `reaction`,
    /// `audio_level`): broadcast to the room excluding the sender.
    pub fn room_event(&self, sid: &str, session_id: &str, event: &str, data: Value) {
        self.events.publish(
            EventTarget::Room {
                room: session_id.to_string(),
                skip: Some(sid.to_string()),
            },
            event,
            data,
        );
    }

    /// Is this peer currently a member of the room? Used by event streams to
    /// filter room-targeted events at delivery time.
    pub fn peer_in_room(&self, sid: &str, room: &str) -> bool {
        self.lock()
            .rooms
            .get(room)
            .map(|members| members.iter().any(|m| m == sid))
            .unwrap_or(false)
    }

    /// Current roster of a session, for tests and diagnostics.
    pub fn participants(&self, session_id: &str) -> HashMap<String, String> {
        let inner = self.lock();
        inner
            .rooms
            .get(session_id)
            .map(|members| {
                members
                    .iter()
                    .filter_map(|id| inner.peers.get(id).map(|p| (id.clone(), p.name.clone())))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HubInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// 8-hex-character identifier for sessions and peers.
fn new_short_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..8].to_string()
}

/// Open a short-lived chat-router connection as a system identity and emit
/// one missed-call frame. Errors are logged; the chat side stays untouched.
async fn notify_chat_missed(chat_addr: String, kind: &'static str, session: SessionInfo) {
    let payload = serde_json::json!({
        "type": kind,
        "sender": "SignalHub",
        "session_id": session.id,
        "session_type": session.session_type,
        "chat_id": session.chat_id,
        "timestamp": timestamp_now(),
    });

    let result = timeout(std::time::Duration::from_secs(5), async {
        let mut stream = TcpStream::connect(&chat_addr).await?;
        let handshake = serde_json::json!({ "username": "_SignalHub_" });
        stream
            .write_all(format!("{handshake}\n").as_bytes())
            .await?;
        // Give the router a beat to finish the handshake before the event.
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        stream.write_all(format!("{payload}\n").as_bytes()).await?;
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        stream.shutdown().await?;
        Ok::<(), std::io::Error>(())
    })
    .await;

    match result {
        Ok(Ok(())) => {}
        Ok(Err(e)) => eprintln!("❌ Error notifying chat server of missed call: {e}"),
        Err(_) => eprintln!("⏱️ Timed out notifying chat server of missed call"),
    }
}
