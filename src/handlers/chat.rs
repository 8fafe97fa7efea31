use std::collections::HashSet;
use std::sync::Arc;

use serde_json::Value;

use crate::models::{timestamp_now, PairKey, Scope};
use crate::registry::ClientHandle;
use crate::router::{self, ChatServer};

use super::{sender_of, system_error};

/// Global-scope message: plain `chat`, `file_share`, `audio_share`, and the
/// global call invites all behave the same way — append to the global log
/// and broadcast unchanged to every non-system client, sender included.
/// Reply metadata (`replyTo`) and audio payloads pass through verbatim.
pub async fn handle_global(server: &Arc<ChatServer>, msg: Value) {
    if let (Some(sender), Some(content)) = (
        msg.get("sender").and_then(Value::as_str),
        msg.get("content").and_then(Value::as_str),
    ) {
        let preview: String = content.chars().take(50).collect();
        println!("💬 Global message from {sender}: {preview}");
    }
    server.store.append_global(msg.clone());
    router::broadcast(server, &msg, None).await;
}

/// Screen-share frames relay to everyone else and are never persisted.
pub async fn handle_screen_share(
    server: &Arc<ChatServer>,
    conn: &Arc<ClientHandle>,
    msg: Value,
) {
    router::broadcast(server, &msg, Some(conn.id)).await;
}

/// Soft-delete a message in any scope, then notify the original recipient
/// set with `message_deleted`.
pub async fn handle_delete_message(
    server: &Arc<ChatServer>,
    conn: &Arc<ClientHandle>,
    msg: Value,
) {
    let Some(message_id) = msg
        .get("message_id")
        .and_then(Value::as_str)
        .or_else(|| msg.get("id").and_then(Value::as_str))
        .map(str::to_string)
    else {
        return;
    };
    let chat_type = msg
        .get("chat_type")
        .and_then(Value::as_str)
        .unwrap_or("global");
    let Some(scope) = Scope::from_wire(chat_type) else {
        eprintln!("⚠️ delete_message with unknown chat_type '{chat_type}'");
        return;
    };
    let sender = sender_of(&msg, conn);

    match scope {
        Scope::Global => {
            if !server.store.delete_global(&message_id).await {
                system_error(server, conn, "Message not found").await;
                return;
            }
            let notice = serde_json::json!({
                "type": "message_deleted",
                "message_id": message_id,
                "chat_type": "global",
                "sender": sender,
                "timestamp": timestamp_now(),
            });
            router::broadcast(server, &notice, None).await;
        }
        Scope::Private => {
            let Some(key) = private_key_of(server, conn, &msg) else {
                system_error(server, conn, "Chat not found").await;
                return;
            };
            if !server.store.delete_private_message(&key, &message_id) {
                system_error(server, conn, "Message not found").await;
                return;
            }
            let (u1, u2) = key.users();
            let peers: HashSet<String> = [u1.to_string(), u2.to_string()].into();
            let other = key.other(&sender).unwrap_or(u2).to_string();
            let notice = serde_json::json!({
                "type": "message_deleted",
                "message_id": message_id,
                "chat_type": "private",
                "receiver": other,
                "sender": sender,
                "timestamp": timestamp_now(),
            });
            let targets = server.registry.connections_named(&peers);
            router::deliver(server, &targets, &notice).await;
        }
        Scope::Group => {
            let Some(group_id) = msg.get("group_id").and_then(Value::as_str) else {
                return;
            };
            let Some(members) = server.store.members_of(group_id) else {
                system_error(server, conn, "Group not found").await;
                return;
            };
            if !server.store.delete_group_message(group_id, &message_id) {
                system_error(server, conn, "Message not found").await;
                return;
            }
            let notice = serde_json::json!({
                "type": "message_deleted",
                "message_id": message_id,
                "chat_type": "group",
                "group_id": group_id,
                "sender": sender,
                "timestamp": timestamp_now(),
            });
            let targets = server
                .registry
                .connections_named(&members.into_iter().collect());
            router::deliver(server, &targets, &notice).await;
        }
    }
}

/// Resolve the private pair a deletion refers to: an explicit `receiver`
/// plus the requester, or a legacy `chat_key`.
fn private_key_of(
    server: &Arc<ChatServer>,
    conn: &Arc<ClientHandle>,
    msg: &Value,
) -> Option<PairKey> {
    if let Some(receiver) = msg.get("receiver").and_then(Value::as_str) {
        let sender = sender_of(msg, conn);
        return Some(PairKey::new(&sender, receiver));
    }
    let chat_key = msg.get("chat_key").and_then(Value::as_str)?;
    let mut known = server.store.known_users();
    known.extend(server.registry.live_names());
    PairKey::from_wire_key(chat_key, &known)
}
