use std::env;
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Server configuration. All values read from a `.env` file colocated with
/// the binary (falling back to the process environment) with LAN-friendly
/// defaults.
///
/// Environment variables:
/// - `SERVER_IP` — bind and advertisement address (default: localhost)
/// - `CHAT_PORT` — framed-JSON chat listener (default: 5555)
/// - `FILE_PORT` — file relay listener (default: 5556)
/// - `VIDEO_PORT` — video signaling hub, HTTPS (default: 5000)
/// - `AUDIO_PORT` — audio signaling hub, HTTPS (default: 5001)
/// - `DATA_DIR` — persistence directory (default: shadow_nexus_data)
#[derive(Debug, Clone)]
pub struct Config {
    pub server_ip: String,
    pub chat_port: u16,
    pub file_port: u16,
    pub video_port: u16,
    pub audio_port: u16,
    pub data_dir: PathBuf,

    /// Deadline for the first (identity) frame of a chat connection.
    pub handshake_timeout: Duration,
    /// Interval between heartbeat ticks.
    pub heartbeat_interval: Duration,
    /// Connections idle longer than this are torn down by the heartbeat.
    pub idle_timeout: Duration,
    /// Cap on a whole file upload/download exchange.
    pub transfer_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            server_ip: "localhost".to_string(),
            chat_port: 5555,
            file_port: 5556,
            video_port: 5000,
            audio_port: 5001,
            data_dir: PathBuf::from("shadow_nexus_data"),
            handshake_timeout: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(180),
            transfer_timeout: Duration::from_secs(300),
        }
    }
}

impl Config {
    /// Load configuration: `.env` next to the executable first, then a
    /// `.env` in the working directory, then the process environment.
    pub fn load() -> Self {
        if let Ok(exe) = env::current_exe()
            && let Some(dir) = exe.parent()
        {
            let _ = dotenvy::from_path(dir.join(".env"));
        }
        let _ = dotenvy::dotenv();

        let defaults = Config::default();
        Config {
            server_ip: env::var("SERVER_IP").unwrap_or(defaults.server_ip.clone()),
            chat_port: env_port("CHAT_PORT", defaults.chat_port),
            file_port: env_port("FILE_PORT", defaults.file_port),
            video_port: env_port("VIDEO_PORT", defaults.video_port),
            audio_port: env_port("AUDIO_PORT", defaults.audio_port),
            data_dir: env::var("DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir.clone()),
            ..defaults
        }
    }

    /// Resolve `SERVER_IP` to a bindable address. `localhost` maps to
    /// loopback; anything unparseable falls back to all interfaces.
    pub fn bind_addr(&self) -> IpAddr {
        if self.server_ip == "localhost" {
            return IpAddr::from([127, 0, 0, 1]);
        }
        self.server_ip
            .parse()
            .unwrap_or_else(|_| IpAddr::from([0, 0, 0, 0]))
    }

    /// `host:port` string the signaling hubs use to reach the chat router.
    pub fn chat_addr(&self) -> String {
        format!("{}:{}", self.bind_addr(), self.chat_port)
    }
}

fn env_port(key: &str, default: u16) -> u16 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
