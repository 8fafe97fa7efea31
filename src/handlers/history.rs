use std::sync::Arc;

use serde_json::Value;

use crate::registry::ClientHandle;
use crate::router::{self, ChatServer};

use super::system_error;

/// On-demand history windows are smaller than the welcome payload.
const HISTORY_LIMIT: usize = 100;

pub async fn handle_chat_history(server: &Arc<ChatServer>, conn: &Arc<ClientHandle>) {
    let frame = serde_json::json!({
        "type": "chat_history",
        "messages": server.store.global_tail(HISTORY_LIMIT),
    });
    router::send_to(server, conn, &frame).await;
}

/// The request names the peer in `receiver`; older clients still send
/// `target_user`. The reply carries both spellings.
pub async fn handle_private_history(
    server: &Arc<ChatServer>,
    conn: &Arc<ClientHandle>,
    msg: Value,
) {
    let Some(target) = msg
        .get("receiver")
        .and_then(Value::as_str)
        .or_else(|| msg.get("target_user").and_then(Value::as_str))
        .map(str::to_string)
    else {
        return;
    };
    let messages = server
        .store
        .private_tail(&conn.username, &target, HISTORY_LIMIT);
    let frame = serde_json::json!({
        "type": "private_history",
        "receiver": target,
        "target_user": target,
        "messages": messages,
    });
    router::send_to(server, conn, &frame).await;
}

/// Group history is member-only.
pub async fn handle_group_history(
    server: &Arc<ChatServer>,
    conn: &Arc<ClientHandle>,
    msg: Value,
) {
    let Some(group_id) = msg.get("group_id").and_then(Value::as_str).map(str::to_string) else {
        return;
    };
    let Some(group) = server.store.get_group(&group_id) else {
        system_error(server, conn, "Group not found").await;
        return;
    };
    if !group.is_member(&conn.username) {
        system_error(server, conn, "You are not a member of this group").await;
        return;
    }
    let frame = serde_json::json!({
        "type": "group_history",
        "group_id": group_id,
        "messages": server.store.group_tail(&group_id, HISTORY_LIMIT),
    });
    router::send_to(server, conn, &frame).await;
}
