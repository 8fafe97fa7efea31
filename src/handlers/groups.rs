use std::collections::HashSet;
use std::sync::Arc;

use serde_json::Value;

use crate::models::{next_group_id, timestamp_now, Group};
use crate::registry::ClientHandle;
use crate::router::{self, ChatServer};

use super::{sender_of, system_error};

pub async fn handle_create(server: &Arc<ChatServer>, conn: &Arc<ClientHandle>, msg: Value) {
    let Some(group_name) = msg.get("group_name").and_then(Value::as_str) else {
        return;
    };
    let creator = sender_of(&msg, conn);

    let mut members: Vec<String> = msg
        .get("members")
        .and_then(Value::as_array)
        .map(|list| {
            list.iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    if !members.iter().any(|m| m == &creator) {
        members.push(creator.clone());
    }
    members.sort();
    members.dedup();

    let group = Group {
        id: next_group_id(),
        name: group_name.to_string(),
        members,
        created_by: creator.clone(),
        admin: creator.clone(),
        created_at: timestamp_now(),
    };
    server.store.create_group(group.clone());

    let notification = serde_json::json!({
        "type": "group_created",
        "group_id": group.id,
        "group_name": group.name,
        "members": group.members,
        "created_by": group.created_by,
        "admin": group.admin,
        "timestamp": timestamp_now(),
    });
    notify_members(server, &group.members, &notification).await;
    broadcast_group_list(server).await;

    println!(
        "✓ Group '{}' created by {creator} ({} members)",
        group.name,
        group.members.len()
    );
}

/// Group-scoped message (`group_message`, `group_file`, `group_audio`, and
/// the group call invites): members only; persisted; delivered to every
/// online member including the sender.
pub async fn handle_message(server: &Arc<ChatServer>, conn: &Arc<ClientHandle>, msg: Value) {
    let Some(group_id) = msg.get("group_id").and_then(Value::as_str).map(str::to_string) else {
        return;
    };
    let sender = sender_of(&msg, conn);
    let Some(group) = server.store.get_group(&group_id) else {
        system_error(server, conn, "Group not found").await;
        return;
    };
    if !group.is_member(&sender) {
        system_error(server, conn, "You are not a member of this group").await;
        return;
    }

    server.store.append_group(&group_id, msg.clone());
    notify_members(server, &group.members, &msg).await;
}

/// Any member may add; the new member is notified along with the rest.
pub async fn handle_add_member(server: &Arc<ChatServer>, conn: &Arc<ClientHandle>, msg: Value) {
    let Some(group_id) = msg.get("group_id").and_then(Value::as_str).map(str::to_string) else {
        return;
    };
    let Some(username) = msg.get("username").and_then(Value::as_str).map(str::to_string) else {
        return;
    };
    let requester = sender_of(&msg, conn);
    let Some(group) = server.store.get_group(&group_id) else {
        system_error(server, conn, "Group not found").await;
        return;
    };
    if !group.is_member(&requester) {
        system_error(server, conn, "You are not a member of this group").await;
        return;
    }
    if group.is_member(&username) {
        return;
    }

    let Some(updated) = server.store.add_member(&group_id, &username) else {
        return;
    };
    let notification = serde_json::json!({
        "type": "group_member_added",
        "group_id": group_id,
        "group_name": updated.name,
        "username": username,
        "added_by": requester,
        "timestamp": timestamp_now(),
    });
    notify_members(server, &updated.members, &notification).await;
    broadcast_group_list(server).await;
}

/// Removal is the creator's call, except anyone may remove themself. The
/// removed user gets the notification once, alongside the remaining members.
pub async fn handle_remove_member(
    server: &Arc<ChatServer>,
    conn: &Arc<ClientHandle>,
    msg: Value,
) {
    let Some(group_id) = msg.get("group_id").and_then(Value::as_str).map(str::to_string) else {
        return;
    };
    let Some(username) = msg.get("username").and_then(Value::as_str).map(str::to_string) else {
        return;
    };
    let requester = sender_of(&msg, conn);
    let Some(group) = server.store.get_group(&group_id) else {
        system_error(server, conn, "Group not found").await;
        return;
    };
    if requester != group.created_by && requester != username {
        system_error(server, conn, "Only the group creator can remove members").await;
        return;
    }
    if !group.is_member(&username) {
        return;
    }

    let Some(mut updated) = server.store.remove_member(&group_id, &username) else {
        return;
    };
    // The admin must stay a member; fall back to the creator, then to any
    // remaining member.
    if updated.admin == username {
        let next_admin = if updated.is_member(&updated.created_by) {
            Some(updated.created_by.clone())
        } else {
            updated.members.first().cloned()
        };
        if let Some(next_admin) = next_admin
            && let Some(fixed) = server.store.set_admin(&group_id, &next_admin)
        {
            updated = fixed;
        }
    }

    let notification = serde_json::json!({
        "type": "group_member_removed",
        "group_id": group_id,
        "group_name": updated.name,
        "username": username,
        "removed_by": requester,
        "timestamp": timestamp_now(),
    });
    let mut recipients = updated.members.clone();
    recipients.push(username.clone());
    notify_members(server, &recipients, &notification).await;
    broadcast_group_list(server).await;
}

pub async fn handle_update_name(server: &Arc<ChatServer>, conn: &Arc<ClientHandle>, msg: Value) {
    let Some(group_id) = msg.get("group_id").and_then(Value::as_str).map(str::to_string) else {
        return;
    };
    let Some(new_name) = msg.get("group_name").and_then(Value::as_str) else {
        return;
    };
    let requester = sender_of(&msg, conn);
    let Some(group) = server.store.get_group(&group_id) else {
        system_error(server, conn, "Group not found").await;
        return;
    };
    if !is_admin(&group, &requester) {
        system_error(server, conn, "Only admin can rename the group").await;
        return;
    }

    let Some(updated) = server.store.rename_group(&group_id, new_name) else {
        return;
    };
    let notification = serde_json::json!({
        "type": "group_name_changed",
        "group_id": group_id,
        "group_name": updated.name,
        "old_name": group.name,
        "changed_by": requester,
        "timestamp": timestamp_now(),
    });
    notify_members(server, &updated.members, &notification).await;
    broadcast_group_list(server).await;
}

pub async fn handle_change_admin(server: &Arc<ChatServer>, conn: &Arc<ClientHandle>, msg: Value) {
    let Some(group_id) = msg.get("group_id").and_then(Value::as_str).map(str::to_string) else {
        return;
    };
    let Some(new_admin) = msg
        .get("new_admin")
        .and_then(Value::as_str)
        .or_else(|| msg.get("username").and_then(Value::as_str))
        .map(str::to_string)
    else {
        return;
    };
    let requester = sender_of(&msg, conn);
    let Some(group) = server.store.get_group(&group_id) else {
        system_error(server, conn, "Group not found").await;
        return;
    };
    if !is_admin(&group, &requester) {
        system_error(server, conn, "Only admin can transfer admin rights").await;
        return;
    }
    if !group.is_member(&new_admin) {
        system_error(server, conn, "New admin must be a group member").await;
        return;
    }

    let Some(updated) = server.store.set_admin(&group_id, &new_admin) else {
        return;
    };
    let notification = serde_json::json!({
        "type": "group_admin_changed",
        "group_id": group_id,
        "group_name": updated.name,
        "new_admin": new_admin,
        "changed_by": requester,
        "timestamp": timestamp_now(),
    });
    notify_members(server, &updated.members, &notification).await;
    broadcast_group_list(server).await;
}

/// Deleting a group drops its message log with it and removes it from every
/// client's group list.
pub async fn handle_delete(server: &Arc<ChatServer>, conn: &Arc<ClientHandle>, msg: Value) {
    let Some(group_id) = msg.get("group_id").and_then(Value::as_str).map(str::to_string) else {
        return;
    };
    let requester = sender_of(&msg, conn);
    let Some(group) = server.store.get_group(&group_id) else {
        system_error(server, conn, "Group not found").await;
        return;
    };
    if !is_admin(&group, &requester) {
        system_error(server, conn, "Only admin can delete the group").await;
        return;
    }

    server.store.delete_group(&group_id);
    let notification = serde_json::json!({
        "type": "group_deleted",
        "group_id": group_id,
        "group_name": group.name,
        "deleted_by": requester,
        "timestamp": timestamp_now(),
    });
    notify_members(server, &group.members, &notification).await;
    broadcast_group_list(server).await;

    println!("🗑️ Group '{}' deleted by {requester}", group.name);
}

/// The creator counts as admin for every admin-only operation.
fn is_admin(group: &Group, user: &str) -> bool {
    user == group.admin || user == group.created_by
}

/// Deliver a frame to every online member of a name set, sender included
/// when they are a member.
pub async fn notify_members(server: &Arc<ChatServer>, members: &[String], frame: &Value) {
    let names: HashSet<String> = members.iter().cloned().collect();
    let targets = server.registry.connections_named(&names);
    router::deliver(server, &targets, frame).await;
}

/// Refreshed `group_list` to every client.
pub async fn broadcast_group_list(server: &Arc<ChatServer>) {
    let frame = router::group_list_frame(server);
    router::broadcast(server, &frame, None).await;
}
