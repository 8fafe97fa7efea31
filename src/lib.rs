pub mod certs;
pub mod config;
pub mod events;
pub mod handlers;
pub mod heartbeat;
pub mod hub;
pub mod hub_routes;
pub mod mdns;
pub mod models;
pub mod registry;
pub mod relay;
pub mod router;
pub mod store;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use config::Config;
use hub::{CallMedium, Hub};
use relay::FileRelay;
use router::ChatServer;
use store::Store;

/// Handles to the core services: the chat router, the file relay, and the
/// shared shutdown flag. Tests bind port 0 and read the real addresses here.
pub struct CoreHandles {
    pub chat: Arc<ChatServer>,
    pub relay: Arc<FileRelay>,
    pub chat_addr: SocketAddr,
    pub file_addr: SocketAddr,
    pub running: Arc<AtomicBool>,
}

/// Boot the store, chat router, file relay, and heartbeat ticker.
pub async fn start_core(config: Config) -> std::io::Result<CoreHandles> {
    let store = Arc::new(Store::open(&config.data_dir));
    let running = Arc::new(AtomicBool::new(true));

    let chat = ChatServer::new(config.clone(), store.clone(), running.clone());
    let chat_addr = router::spawn(chat.clone()).await?;

    let relay = FileRelay::new(config.clone(), store, running.clone());
    let file_addr = relay::spawn(relay.clone()).await?;

    heartbeat::spawn_heartbeat(chat.clone());

    Ok(CoreHandles {
        chat,
        relay,
        chat_addr,
        file_addr,
        running,
    })
}

/// Broadcast the shutdown notice and stop the acceptor loops. Acceptors
/// observe the flag on their next 1 s tick; in-flight connections close with
/// the process.
pub async fn shutdown(handles: &CoreHandles) {
    let notice = router::system_frame("Server is shutting down");
    router::broadcast(&handles.chat, &notice, None).await;
    handles.running.store(false, Ordering::Relaxed);
}

/// Assemble one signaling hub (video or audio) and its Rocket. `chat_addr`
/// is where the hub's missed-call emitter reaches the chat router.
pub fn build_signaling_hub(
    config: &Config,
    medium: CallMedium,
    chat_addr: String,
    tls: Option<(PathBuf, PathBuf)>,
) -> (Arc<Hub>, rocket::Rocket<rocket::Build>) {
    let port = match medium {
        CallMedium::Video => config.video_port,
        CallMedium::Audio => config.audio_port,
    };
    let hub = Hub::new(medium, chat_addr, config.server_ip.clone(), port);
    let rocket = hub_routes::build_hub(config, hub.clone(), port, tls);
    (hub, rocket)
}
