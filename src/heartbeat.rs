use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::models::timestamp_now;
use crate::router::{self, ChatServer};

/// Spawns the liveness ticker: every heartbeat interval, tear down
/// connections idle past the cutoff, then ping everyone left. Ping send
/// failures are not grounds for disconnect — the next tick decides.
pub fn spawn_heartbeat(server: Arc<ChatServer>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(server.config.heartbeat_interval);
        // The first tick of a tokio interval fires immediately; skip it so
        // the first real check lands one interval after boot.
        ticker.tick().await;

        loop {
            ticker.tick().await;
            if !server.running.load(Ordering::Relaxed) {
                break;
            }

            let mut idle = Vec::new();
            let mut live = Vec::new();
            for handle in server.registry.snapshot() {
                if handle.idle_for() > server.config.idle_timeout {
                    idle.push(handle);
                } else {
                    live.push(handle);
                }
            }

            for handle in &idle {
                println!(
                    "⏱️ Disconnecting '{}' (idle {}s)",
                    handle.username,
                    handle.idle_for().as_secs()
                );
            }
            if !idle.is_empty() {
                router::reap(&server, idle).await;
            }

            let ping = serde_json::json!({ "type": "ping", "timestamp": timestamp_now() });
            for handle in live {
                let _ = handle.send(&ping).await;
            }
        }
    });
}
