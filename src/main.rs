use std::env;

use shadow_nexus::config::Config;
use shadow_nexus::hub::CallMedium;
use shadow_nexus::{build_signaling_hub, certs, mdns, shutdown, start_core};

#[rocket::main]
async fn main() {
    println!("\n{}", "=".repeat(60));
    println!("🚀 Shadow Nexus Collaboration Server");
    println!("{}", "=".repeat(60));
    println!("Press Ctrl+C to stop the server\n");

    let config = Config::load();
    println!(
        "Server initializing on {}:{} (chat) and {}:{} (files)",
        config.server_ip, config.chat_port, config.server_ip, config.file_port
    );

    let handles = match start_core(config.clone()).await {
        Ok(handles) => handles,
        Err(e) => {
            eprintln!("❌ Error starting server (port may be in use): {e}");
            return;
        }
    };

    let tls = match certs::ensure_certs(&config.server_ip) {
        Ok(pair) => Some(pair),
        Err(e) => {
            eprintln!("⚠️ Certificate setup failed: {e} (signaling hubs run without TLS)");
            None
        }
    };

    // The hubs live in this process; their missed-call emitter dials the
    // chat router over loopback.
    let chat_addr = format!("127.0.0.1:{}", handles.chat_addr.port());
    let (_video_hub, video_rocket) =
        build_signaling_hub(&config, CallMedium::Video, chat_addr.clone(), tls.clone());
    let (_audio_hub, audio_rocket) =
        build_signaling_hub(&config, CallMedium::Audio, chat_addr, tls);
    tokio::spawn(async move {
        if let Err(e) = video_rocket.launch().await {
            eprintln!("❌ Video hub error: {e}");
        }
    });
    tokio::spawn(async move {
        if let Err(e) = audio_rocket.launch().await {
            eprintln!("❌ Audio hub error: {e}");
        }
    });
    println!(
        "✓ Signaling hubs on https://{}:{} (video) and https://{}:{} (audio)",
        config.server_ip, config.video_port, config.server_ip, config.audio_port
    );

    let mdns_enabled = env::var("MDNS_ENABLED")
        .map(|v| v != "0" && v.to_lowercase() != "false")
        .unwrap_or(true);
    if mdns_enabled {
        let instance_name =
            env::var("MDNS_INSTANCE_NAME").unwrap_or_else(|_| "shadow-nexus".to_string());
        match mdns::start_mdns(&config, &instance_name) {
            Ok(handle) => {
                println!(
                    "📡 mDNS advertising: {} on port {}",
                    handle.fullname(),
                    config.chat_port
                );
                // Keep mDNS alive for the lifetime of the server; the OS
                // reclaims it on process exit.
                std::mem::forget(handle);
            }
            Err(e) => {
                eprintln!("⚠️  mDNS failed to start: {e} (discovery disabled, chat still works)");
            }
        }
    } else {
        println!("📡 mDNS service discovery disabled (MDNS_ENABLED=false)");
    }

    println!("✓ Waiting for connections... (Press Ctrl+C to stop)\n");
    let _ = tokio::signal::ctrl_c().await;

    println!("\n🛑 Shutting down server...");
    shutdown(&handles).await;
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    println!("✅ Server stopped successfully");
}
