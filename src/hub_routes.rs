use std::path::PathBuf;
use std::sync::Arc;

use rocket::http::Status;
use rocket::response::content::RawHtml;
use rocket::response::stream::{Event, EventStream};
use rocket::serde::json::Json;
use rocket::{get, post, State};
use serde::Deserialize;
use serde_json::Value;
use tokio::time::{interval, Duration};

use crate::config::Config;
use crate::events::EventTarget;
use crate::hub::{CallMedium, Hub};

/// Build one signaling hub's Rocket. `tls` carries the cert/key pair minted
/// at boot; tests pass `None` and drive the app in-process.
pub fn build_hub(
    config: &Config,
    hub: Arc<Hub>,
    port: u16,
    tls: Option<(PathBuf, PathBuf)>,
) -> rocket::Rocket<rocket::Build> {
    let mut figment = rocket::Config::figment()
        .merge(("port", port))
        .merge(("address", config.bind_addr().to_string()));
    if let Some((certs, key)) = tls {
        figment = figment
            .merge(("tls.certs", certs.display().to_string()))
            .merge(("tls.key", key.display().to_string()));
    }

    let cors = rocket_cors::CorsOptions::default()
        .to_cors()
        .expect("Failed to create CORS");

    let medium = hub.medium;
    let mut build = rocket::custom(figment)
        .manage(hub)
        .attach(cors)
        .mount(
            "/",
            rocket::routes![
                index,
                create_session,
                event_stream,
                join_session,
                leave_session,
                relay_data,
                hand_raise,
                screen_share,
                reaction,
                audio_level,
            ],
        );
    build = match medium {
        CallMedium::Video => build.mount("/", rocket::routes![video_room]),
        CallMedium::Audio => build.mount("/", rocket::routes![audio_room]),
    };
    build
}

#[get("/")]
fn index(hub: &State<Arc<Hub>>) -> String {
    format!("Shadow Nexus {} Server Running", hub.medium.label())
}

#[get("/video/<session_id>")]
fn video_room(hub: &State<Arc<Hub>>, session_id: &str) -> Result<RawHtml<String>, Status> {
    room_page(hub, session_id)
}

#[get("/audio/<session_id>")]
fn audio_room(hub: &State<Arc<Hub>>, session_id: &str) -> Result<RawHtml<String>, Status> {
    room_page(hub, session_id)
}

/// The room page renders only for known session ids. The page itself is a
/// stub — the client shell owns the real WebRTC UI.
fn room_page(hub: &State<Arc<Hub>>, session_id: &str) -> Result<RawHtml<String>, Status> {
    let Some(session) = hub.session(session_id) else {
        return Err(Status::NotFound);
    };
    Ok(RawHtml(format!(
        "<!DOCTYPE html><html><head><title>{name}</title></head>\
         <body data-session-id=\"{id}\" data-session-type=\"{kind}\">\
         <h1>{name}</h1></body></html>",
        name = session.name,
        id = session.id,
        kind = session.session_type,
    )))
}

#[derive(Debug, Deserialize)]
struct CreateSession {
    #[serde(default = "default_session_type")]
    session_type: String,
    #[serde(default = "default_session_name")]
    session_name: String,
    #[serde(default = "default_creator")]
    creator: String,
    #[serde(default = "default_session_type")]
    chat_id: String,
}

fn default_session_type() -> String {
    "global".to_string()
}

fn default_session_name() -> String {
    "Call".to_string()
}

fn default_creator() -> String {
    "Unknown".to_string()
}

#[post("/api/create_session", format = "json", data = "<body>")]
fn create_session(hub: &State<Arc<Hub>>, body: Json<CreateSession>) -> Json<Value> {
    let session = hub.create_session(
        &body.session_type,
        &body.session_name,
        &body.creator,
        &body.chat_id,
    );
    Json(serde_json::json!({
        "success": true,
        "session_id": session.id,
        "link": hub.link_for(&session.id),
    }))
}

/// Removes the peer when its event stream is dropped — a transport close is
/// a `leave_session` for the last known room.
struct PeerGuard {
    hub: Arc<Hub>,
    sid: String,
}

impl Drop for PeerGuard {
    fn drop(&mut self) {
        self.hub.disconnect_peer(&self.sid);
    }
}

/// The hub→client half of the event protocol: an SSE stream per peer. The
/// first event is `connected {sid}`; everything else is filtered off the
/// hub's broadcast bus by target.
#[get("/api/events")]
fn event_stream(hub: &State<Arc<Hub>>) -> EventStream![] {
    let hub = hub.inner().clone();
    let sid = hub.connect_peer();
    let mut rx = hub.events.sender.subscribe();

    EventStream! {
        // Dropped when the client goes away; equivalent to leave_session.
        let _guard = PeerGuard { hub: hub.clone(), sid: sid.clone() };

        yield Event::json(&serde_json::json!({ "sid": sid })).event("connected");

        let mut heartbeat = interval(Duration::from_secs(15));
        loop {
            tokio::select! {
                event = rx.recv() => {
                    match event {
                        Ok(ev) => {
                            let mine = match &ev.target {
                                EventTarget::Peer(peer) => *peer == sid,
                                EventTarget::Room { room, skip } => {
                                    skip.as_deref() != Some(sid.as_str())
                                        && hub.peer_in_room(&sid, room)
                                }
                            };
                            if mine {
                                yield Event::json(&ev.data).event(ev.event);
                            }
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                        _ => {} // lagged
                    }
                }
                _ = heartbeat.tick() => {
                    let now = chrono::Utc::now().to_rfc3339();
                    yield Event::json(&serde_json::json!({ "time": now })).event("heartbeat");
                }
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct JoinSession {
    session_id: String,
    sid: String,
    #[serde(default = "default_guest")]
    username: String,
}

fn default_guest() -> String {
    "Guest".to_string()
}

#[post("/api/join_session", format = "json", data = "<body>")]
fn join_session(
    hub: &State<Arc<Hub>>,
    body: Json<JoinSession>,
) -> Result<Json<Value>, (Status, Json<Value>)> {
    match hub.join_session(&body.sid, &body.session_id, &body.username) {
        Ok(()) => Ok(Json(serde_json::json!({ "success": true }))),
        Err(message) => Err((
            Status::NotFound,
            Json(serde_json::json!({ "error": message })),
        )),
    }
}

#[derive(Debug, Deserialize)]
struct LeaveSession {
    session_id: String,
    sid: String,
}

#[post("/api/leave_session", format = "json", data = "<body>")]
fn leave_session(hub: &State<Arc<Hub>>, body: Json<LeaveSession>) -> Json<Value> {
    hub.leave_session(&body.sid, &body.session_id);
    Json(serde_json::json!({ "success": true }))
}

/// WebRTC offer/answer/ICE relay. The body is forwarded verbatim to
/// `target_id`. `sender_id` doubles as the caller's transport identity (the
/// sid minted on its event stream); an unregistered one drops the frame.
#[post("/api/data", format = "json", data = "<body>")]
fn relay_data(hub: &State<Arc<Hub>>, body: Json<Value>) -> Result<Json<Value>, Status> {
    let msg = body.into_inner();
    let sid = msg
        .get("sender_id")
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string();
    if hub.forward_data(&sid, msg) {
        Ok(Json(serde_json::json!({ "success": true })))
    } else {
        Err(Status::Forbidden)
    }
}

#[derive(Debug, Deserialize)]
struct RoomSignal {
    session_id: String,
    sid: String,
    user_id: String,
    #[serde(default)]
    raised: Option<bool>,
    #[serde(default)]
    sharing: Option<bool>,
    #[serde(default)]
    emoji: Option<String>,
    #[serde(default)]
    level: Option<f64>,
    #[serde(default)]
    is_speaking: Option<bool>,
}

#[post("/api/hand_raise", format = "json", data = "<body>")]
fn hand_raise(hub: &State<Arc<Hub>>, body: Json<RoomSignal>) -> Json<Value> {
    hub.room_event(
        &body.sid,
        &body.session_id,
        "hand_raise",
        serde_json::json!({ "user_id": body.user_id, "raised": body.raised.unwrap_or(false) }),
    );
    Json(serde_json::json!({ "success": true }))
}

#[post("/api/screen_share", format = "json", data = "<body>")]
fn screen_share(hub: &State<Arc<Hub>>, body: Json<RoomSignal>) -> Json<Value> {
    hub.room_event(
        &body.sid,
        &body.session_id,
        "screen_share",
        serde_json::json!({ "user_id": body.user_id, "sharing": body.sharing.unwrap_or(false) }),
    );
    Json(serde_json::json!({ "success": true }))
}

#[post("/api/reaction", format = "json", data = "<body>")]
fn reaction(hub: &State<Arc<Hub>>, body: Json<RoomSignal>) -> Json<Value> {
    hub.room_event(
        &body.sid,
        &body.session_id,
        "reaction",
        serde_json::json!({
            "user_id": body.user_id,
            "emoji": body.emoji.clone().unwrap_or_default(),
        }),
    );
    Json(serde_json::json!({ "success": true }))
}

/// Speaking-indicator levels; broadcast like the other auxiliary events.
#[post("/api/audio_level", format = "json", data = "<body>")]
fn audio_level(hub: &State<Arc<Hub>>, body: Json<RoomSignal>) -> Json<Value> {
    hub.room_event(
        &body.sid,
        &body.session_id,
        "audio_level",
        serde_json::json!({
            "user_id": body.user_id,
            "level": body.level.unwrap_or(0.0),
            "is_speaking": body.is_speaking.unwrap_or(false),
        }),
    );
    Json(serde_json::json!({ "success": true }))
}
