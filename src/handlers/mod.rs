// Handler decomposition — each chat domain in its own file. The dispatch
// table lives here; shared reply helpers too.

mod chat;
mod private;
mod groups;
mod history;
mod calls;

use std::sync::Arc;

use serde_json::Value;

use crate::models::{timestamp_now, MessageKind};
use crate::registry::ClientHandle;
use crate::router::{self, ChatServer};

/// Exhaustive dispatch over every wire kind. Runs under the router's
/// routing lock, so append-and-fan-out is a single step per frame.
pub async fn dispatch(
    server: &Arc<ChatServer>,
    conn: &Arc<ClientHandle>,
    kind: MessageKind,
    msg: Value,
) {
    use MessageKind::*;
    match kind {
        Chat | FileShare | AudioShare | VideoInvite | AudioInvite => {
            chat::handle_global(server, msg).await
        }
        ScreenShare => chat::handle_screen_share(server, conn, msg).await,
        DeleteMessage => chat::handle_delete_message(server, conn, msg).await,

        Private | PrivateFile | PrivateAudio | VideoInvitePrivate | AudioInvitePrivate => {
            private::handle_private(server, conn, msg).await
        }
        DeleteUserChat => private::handle_delete_user_chat(server, conn, msg).await,

        GroupCreate => groups::handle_create(server, conn, msg).await,
        GroupMessage | GroupFile | GroupAudio | VideoInviteGroup | AudioInviteGroup => {
            groups::handle_message(server, conn, msg).await
        }
        GroupAddMember => groups::handle_add_member(server, conn, msg).await,
        GroupRemoveMember => groups::handle_remove_member(server, conn, msg).await,
        GroupUpdateName => groups::handle_update_name(server, conn, msg).await,
        GroupChangeAdmin => groups::handle_change_admin(server, conn, msg).await,
        GroupDelete => groups::handle_delete(server, conn, msg).await,

        RequestChatHistory => history::handle_chat_history(server, conn).await,
        RequestPrivateHistory => history::handle_private_history(server, conn, msg).await,
        RequestGroupHistory => history::handle_group_history(server, conn, msg).await,

        VideoMissed | AudioMissed => calls::handle_missed(server, msg).await,

        GetUsers => {
            let frame = router::user_list_frame(server, &conn.username);
            router::send_to(server, conn, &frame).await;
        }
        RequestGroups => {
            let frame = router::group_list_frame(server);
            router::send_to(server, conn, &frame).await;
        }
        SaveRecentChat => {
            let sender = sender_of(&msg, conn);
            if let Some(target) = msg.get("target").and_then(Value::as_str) {
                server.registry.promote_recent(&sender, target);
            }
        }
        Ping => {
            let pong = serde_json::json!({ "type": "pong", "timestamp": timestamp_now() });
            router::send_to(server, conn, &pong).await;
        }
        // Activity was refreshed in the dispatch loop; nothing to forward.
        Pong => {}
    }
}

/// The `sender` field of a frame, defaulting to the connection's identity.
pub fn sender_of(msg: &Value, conn: &ClientHandle) -> String {
    msg.get("sender")
        .and_then(Value::as_str)
        .unwrap_or(&conn.username)
        .to_string()
}

/// Reply with a `system` error frame. Authorization and not-found failures
/// never disconnect.
pub async fn system_error(server: &Arc<ChatServer>, conn: &Arc<ClientHandle>, text: &str) {
    let frame = router::system_frame(text);
    router::send_to(server, conn, &frame).await;
}
