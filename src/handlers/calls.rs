use std::collections::HashSet;
use std::sync::Arc;

use serde_json::Value;

use crate::models::PairKey;
use crate::router::{self, ChatServer};

/// Missed-call events (`video_missed` / `audio_missed`), emitted by the
/// signaling hub once per room when its last participant leaves. Never
/// persisted — open clients use them to flip the existing invite's state.
/// The recipient set follows the session's scope.
pub async fn handle_missed(server: &Arc<ChatServer>, msg: Value) {
    let session_type = msg
        .get("session_type")
        .and_then(Value::as_str)
        .unwrap_or("global");
    let chat_id = msg.get("chat_id").and_then(Value::as_str).unwrap_or("global");

    match session_type {
        "global" => {
            router::broadcast(server, &msg, None).await;
        }
        "private" => {
            let mut known = server.store.known_users();
            known.extend(server.registry.live_names());
            let Some(pair) = PairKey::from_wire_key(chat_id, &known) else {
                eprintln!("⚠️ Missed-call event with unreadable chat_id '{chat_id}'");
                return;
            };
            let (u1, u2) = pair.users();
            let peers: HashSet<String> = [u1.to_string(), u2.to_string()].into();
            let targets = server.registry.connections_named(&peers);
            router::deliver(server, &targets, &msg).await;
        }
        "group" => {
            let Some(members) = server.store.members_of(chat_id) else {
                eprintln!("⚠️ Missed-call event for unknown group '{chat_id}'");
                return;
            };
            let targets = server
                .registry
                .connections_named(&members.into_iter().collect());
            router::deliver(server, &targets, &msg).await;
        }
        other => {
            eprintln!("⚠️ Missed-call event with unknown session_type '{other}'");
        }
    }
}
