use std::time::Duration;

use crate::common::{test_config, test_server_with, Peer};

// --- Heartbeat & liveness ---

#[tokio::test]
async fn server_pings_and_pong_keeps_the_connection() {
    let mut config = test_config();
    config.heartbeat_interval = Duration::from_millis(200);
    config.idle_timeout = Duration::from_millis(900);
    let server = test_server_with(config).await;

    let mut alice = Peer::connect_ready(server.chat_addr(), "alice").await;

    let ping = alice.recv_type("ping").await;
    assert!(ping["timestamp"].is_string());
    alice
        .send(&serde_json::json!({ "type": "pong" }))
        .await;

    // Pong counted as activity: the connection survives past the idle
    // cutoff as long as we keep answering.
    for _ in 0..6 {
        alice.recv_type("ping").await;
        alice.send(&serde_json::json!({ "type": "pong" })).await;
    }
    alice
        .send(&serde_json::json!({
            "type": "chat",
            "sender": "alice",
            "content": "still here",
        }))
        .await;
    assert_eq!(alice.recv_type("chat").await["content"], "still here");
}

#[tokio::test]
async fn client_ping_gets_a_pong() {
    let server = test_server_with(test_config()).await;
    let mut alice = Peer::connect_ready(server.chat_addr(), "alice").await;

    alice.send(&serde_json::json!({ "type": "ping" })).await;
    alice.recv_type("pong").await;
}

// Scenario S5 (compressed timers): a silent client is pinged, then torn
// down once idle past the cutoff, with a leave broadcast and a refreshed
// user list to the survivors.
#[tokio::test]
async fn idle_connection_is_torn_down_with_leave_broadcast() {
    let mut config = test_config();
    config.heartbeat_interval = Duration::from_millis(200);
    config.idle_timeout = Duration::from_millis(700);
    let server = test_server_with(config).await;

    let mut alice = Peer::connect_ready(server.chat_addr(), "alice").await;
    let mut bob = Peer::connect_ready(server.chat_addr(), "bob").await;
    alice.recv_system_containing("joined the chat").await;
    alice.recv_type("user_list").await;

    // Bob goes silent; alice keeps answering pings while watching for the
    // leave announcement.
    let mut bob_got_pinged = false;
    let mut saw_leave = false;
    for _ in 0..40 {
        if let Some(frame) = bob.try_recv(Duration::from_millis(50)).await
            && frame["type"] == "ping"
        {
            bob_got_pinged = true;
        }
        if let Some(frame) = alice.try_recv(Duration::from_millis(50)).await {
            if frame["type"] == "ping" {
                alice.send(&serde_json::json!({ "type": "pong" })).await;
            }
            if frame["type"] == "system"
                && frame["content"].as_str().unwrap_or("").contains("bob left the chat")
            {
                saw_leave = true;
                break;
            }
        }
    }
    assert!(bob_got_pinged, "bob never received a heartbeat ping");
    assert!(saw_leave, "bob's idle teardown was never announced");

    // The refreshed tailored list no longer names bob.
    let list = alice.recv_type("user_list").await;
    assert_eq!(list["users"], serde_json::json!([]));
}
