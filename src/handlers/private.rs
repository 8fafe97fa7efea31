use std::sync::Arc;

use serde_json::Value;

use crate::models::PairKey;
use crate::registry::ClientHandle;
use crate::router::{self, ChatServer};

use super::{sender_of, system_error};

/// Direct message (text, file reference, audio blob, or private call
/// invite): canonicalize the pair, persist, update both recent-chat lists,
/// deliver to the receiver if connected, and always echo to the sender so
/// their own view reflects server ordering. An offline receiver simply
/// finds the message in storage on their next handshake.
pub async fn handle_private(server: &Arc<ChatServer>, conn: &Arc<ClientHandle>, msg: Value) {
    let sender = sender_of(&msg, conn);
    let Some(receiver) = msg.get("receiver").and_then(Value::as_str).map(str::to_string) else {
        return;
    };

    server.store.append_private(&sender, &receiver, msg.clone());
    server.registry.note_recent(&sender, &receiver);
    server.registry.note_recent(&receiver, &sender);

    if let Some(target) = server.registry.find_by_name(&receiver)
        && !target.system
    {
        router::send_to(server, &target, &msg).await;
    }

    router::send_to(server, conn, &msg).await;
}

/// Hard-delete a whole private conversation, then confirm to the requester.
pub async fn handle_delete_user_chat(
    server: &Arc<ChatServer>,
    conn: &Arc<ClientHandle>,
    msg: Value,
) {
    let sender = sender_of(&msg, conn);
    let key = if let Some(receiver) = msg.get("receiver").and_then(Value::as_str) {
        Some(PairKey::new(&sender, receiver))
    } else if let Some(chat_key) = msg.get("chat_key").and_then(Value::as_str) {
        let mut known = server.store.known_users();
        known.extend(server.registry.live_names());
        PairKey::from_wire_key(chat_key, &known)
    } else {
        None
    };
    let Some(key) = key else {
        system_error(server, conn, "Chat not found").await;
        return;
    };

    if !server.store.delete_private_pair(&key) {
        system_error(server, conn, "Chat not found").await;
        return;
    }

    let (u1, u2) = key.users();
    let other = key.other(&sender).unwrap_or(u2).to_string();
    println!("🗑️ Private chat deleted: {u1} / {u2}");
    let confirmation = serde_json::json!({
        "type": "user_chat_deleted",
        "receiver": other,
        "chat_key": format!("{u1}_{u2}"),
    });
    router::send_to(server, conn, &confirmation).await;
}
