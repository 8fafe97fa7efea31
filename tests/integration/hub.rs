use std::time::Duration;

use rocket::http::{ContentType, Status};
use rocket::local::asynchronous::Client;

use shadow_nexus::build_signaling_hub;
use shadow_nexus::events::EventTarget;
use shadow_nexus::hub::{CallMedium, Hub};

use crate::common::{test_config, test_server, Peer};

fn test_hub(medium: CallMedium, chat_addr: &str) -> std::sync::Arc<Hub> {
    // Port 0 keeps the link stable in assertions; the hub itself is driven
    // in-process.
    Hub::new(medium, chat_addr.to_string(), "127.0.0.1".to_string(), 0)
}

async fn recv_event(
    rx: &mut tokio::sync::broadcast::Receiver<shadow_nexus::events::HubEvent>,
) -> shadow_nexus::events::HubEvent {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("hub event in time")
        .expect("event bus open")
}

// --- HTTP surface ---

#[tokio::test]
async fn create_session_returns_short_id_and_link() {
    let config = test_config();
    let (hub, rocket) =
        build_signaling_hub(&config, CallMedium::Video, "127.0.0.1:1".to_string(), None);
    let client = Client::tracked(rocket).await.expect("valid rocket");

    let res = client
        .post("/api/create_session")
        .header(ContentType::JSON)
        .body(r#"{"session_type": "private", "session_name": "Catch-up",
                  "creator": "alice", "chat_id": "alice_bob"}"#)
        .dispatch()
        .await;
    assert_eq!(res.status(), Status::Ok);
    let body: serde_json::Value = res.into_json().await.unwrap();
    assert_eq!(body["success"], true);
    let session_id = body["session_id"].as_str().unwrap();
    assert_eq!(session_id.len(), 8);
    assert!(body["link"].as_str().unwrap().contains(&format!("/video/{session_id}")));

    let session = hub.session(session_id).unwrap();
    assert_eq!(session.session_type, "private");
    assert_eq!(session.chat_id, "alice_bob");
}

#[tokio::test]
async fn room_page_renders_only_for_known_sessions() {
    let config = test_config();
    let (hub, rocket) =
        build_signaling_hub(&config, CallMedium::Video, "127.0.0.1:1".to_string(), None);
    let client = Client::tracked(rocket).await.expect("valid rocket");

    let session = hub.create_session("global", "All hands", "alice", "global");
    let res = client.get(format!("/video/{}", session.id)).dispatch().await;
    assert_eq!(res.status(), Status::Ok);
    assert!(res.into_string().await.unwrap().contains("All hands"));

    let res = client.get("/video/deadbeef").dispatch().await;
    assert_eq!(res.status(), Status::NotFound);
}

#[tokio::test]
async fn join_unknown_session_is_rejected() {
    let config = test_config();
    let (hub, rocket) =
        build_signaling_hub(&config, CallMedium::Video, "127.0.0.1:1".to_string(), None);
    let client = Client::tracked(rocket).await.expect("valid rocket");
    let sid = hub.connect_peer();

    let res = client
        .post("/api/join_session")
        .header(ContentType::JSON)
        .body(format!(
            r#"{{"session_id": "nope", "sid": "{sid}", "username": "alice"}}"#
        ))
        .dispatch()
        .await;
    assert_eq!(res.status(), Status::NotFound);
    let body: serde_json::Value = res.into_json().await.unwrap();
    assert_eq!(body["error"], "Invalid session");
}

// --- Room membership events ---

#[tokio::test]
async fn first_joiner_gets_my_id_and_later_joiners_get_the_roster() {
    let hub = test_hub(CallMedium::Video, "127.0.0.1:1");
    let session = hub.create_session("global", "Huddle", "alice", "global");
    let mut rx = hub.events.sender.subscribe();

    let alice_sid = hub.connect_peer();
    let bob_sid = hub.connect_peer();

    hub.join_session(&alice_sid, &session.id, "alice").unwrap();
    let ev = recv_event(&mut rx).await;
    assert_eq!(ev.event, "user-list");
    assert!(matches!(ev.target, EventTarget::Peer(ref p) if *p == alice_sid));
    assert_eq!(ev.data["my_id"].as_str().unwrap(), alice_sid);
    assert!(ev.data.get("list").is_none());

    hub.join_session(&bob_sid, &session.id, "bob").unwrap();
    let roster = recv_event(&mut rx).await;
    assert_eq!(roster.event, "user-list");
    assert_eq!(roster.data["list"][&alice_sid], "alice");
    let connect = recv_event(&mut rx).await;
    assert_eq!(connect.event, "user-connect");
    assert!(
        matches!(connect.target, EventTarget::Room { ref skip, .. } if skip.as_deref() == Some(bob_sid.as_str()))
    );

    assert_eq!(hub.participants(&session.id).len(), 2);
}

#[tokio::test]
async fn data_frames_require_the_transport_identity() {
    let hub = test_hub(CallMedium::Video, "127.0.0.1:1");
    let sid = hub.connect_peer();
    let mut rx = hub.events.sender.subscribe();

    // Spoofed sender is dropped.
    let spoofed = serde_json::json!({
        "sender_id": "someone-else", "target_id": "t1", "type": "offer",
    });
    assert!(!hub.forward_data(&sid, spoofed));

    // Honest frame forwards verbatim to the target only.
    let offer = serde_json::json!({
        "sender_id": sid, "target_id": "t1", "type": "offer", "sdp": "v=0...",
    });
    assert!(hub.forward_data(&sid, offer.clone()));
    let ev = recv_event(&mut rx).await;
    assert_eq!(ev.event, "data");
    assert!(matches!(ev.target, EventTarget::Peer(ref p) if p == "t1"));
    assert_eq!(ev.data, offer);
}

#[tokio::test]
async fn auxiliary_events_skip_the_sender() {
    let hub = test_hub(CallMedium::Video, "127.0.0.1:1");
    let session = hub.create_session("global", "Hands", "alice", "global");
    let sid = hub.connect_peer();
    hub.join_session(&sid, &session.id, "alice").unwrap();
    let mut rx = hub.events.sender.subscribe();

    hub.room_event(
        &sid,
        &session.id,
        "hand_raise",
        serde_json::json!({ "user_id": "alice", "raised": true }),
    );
    let ev = recv_event(&mut rx).await;
    assert_eq!(ev.event, "hand_raise");
    assert!(
        matches!(ev.target, EventTarget::Room { ref skip, .. } if skip.as_deref() == Some(sid.as_str()))
    );
}

// --- Missed calls (scenario S4) ---

#[tokio::test]
async fn empty_room_emits_one_missed_call_to_the_private_peers() {
    let server = test_server().await;
    let mut alice = Peer::connect_ready(server.chat_addr(), "alice").await;
    let mut bob = Peer::connect_ready(server.chat_addr(), "bob").await;
    let mut carol = Peer::connect_ready(server.chat_addr(), "carol").await;
    alice.recv_system_containing("carol joined").await;
    alice.recv_type("user_list").await;

    let hub = test_hub(CallMedium::Video, &server.chat_addr().to_string());
    let session = hub.create_session("private", "Catch-up", "alice", "alice_bob");

    let sid = hub.connect_peer();
    hub.join_session(&sid, &session.id, "alice").unwrap();
    hub.leave_session(&sid, &session.id);

    // The room is destroyed and both peers of the pair get the event.
    assert!(hub.session(&session.id).is_none());
    for peer in [&mut alice, &mut bob] {
        let missed = peer.recv_type("video_missed").await;
        assert_eq!(missed["session_id"].as_str().unwrap(), session.id);
        assert_eq!(missed["session_type"], "private");
        assert_eq!(missed["chat_id"], "alice_bob");
    }
    // Exactly once, scoped to the pair: carol hears nothing.
    carol.expect_silence(Duration::from_millis(400)).await;
    alice.expect_silence(Duration::from_millis(300)).await;

    // Never persisted.
    alice
        .send(&serde_json::json!({ "type": "request_chat_history" }))
        .await;
    let history = alice.recv_type("chat_history").await;
    assert_eq!(history["messages"].as_array().unwrap().len(), 0);

    // And the hub's system identity never surfaced in presence.
    alice.send(&serde_json::json!({ "type": "get_users" })).await;
    let list = alice.recv_type("user_list").await;
    assert_eq!(list["users"], serde_json::json!(["bob", "carol"]));
}

#[tokio::test]
async fn transport_disconnect_counts_as_leaving() {
    let server = test_server().await;
    let mut alice = Peer::connect_ready(server.chat_addr(), "alice").await;

    let hub = test_hub(CallMedium::Audio, &server.chat_addr().to_string());
    let session = hub.create_session("global", "Voice", "alice", "global");

    let sid = hub.connect_peer();
    hub.join_session(&sid, &session.id, "alice").unwrap();
    hub.disconnect_peer(&sid);

    assert!(hub.session(&session.id).is_none());
    let missed = alice.recv_type("audio_missed").await;
    assert_eq!(missed["session_type"], "global");
}

#[tokio::test]
async fn leaving_a_still_populated_room_keeps_the_session() {
    let hub = test_hub(CallMedium::Video, "127.0.0.1:1");
    let session = hub.create_session("global", "Pair", "alice", "global");
    let a = hub.connect_peer();
    let b = hub.connect_peer();
    hub.join_session(&a, &session.id, "alice").unwrap();
    hub.join_session(&b, &session.id, "bob").unwrap();

    hub.leave_session(&a, &session.id);
    assert!(hub.session(&session.id).is_some());
    assert_eq!(hub.participants(&session.id).len(), 1);
}
