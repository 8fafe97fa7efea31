use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpListener;
use tokio::time::timeout;

use crate::config::Config;
use crate::models::FileRecord;
use crate::store::Store;

/// The file relay: a second listener where each accepted connection serves
/// exactly one upload or download and closes. Blob bytes live only in the
/// in-memory cache; the durable store keeps the metadata index.
///
/// The relay never announces anything — clients that want a share visible
/// re-enter the chat router with a `file_share` frame, which keeps scope
/// under the router's jurisdiction.
pub struct FileRelay {
    config: Config,
    store: Arc<Store>,
    running: Arc<std::sync::atomic::AtomicBool>,
    blobs: Mutex<HashMap<String, Vec<u8>>>,
}

impl FileRelay {
    pub fn new(
        config: Config,
        store: Arc<Store>,
        running: Arc<std::sync::atomic::AtomicBool>,
    ) -> Arc<FileRelay> {
        Arc::new(FileRelay {
            config,
            store,
            running,
            blobs: Mutex::new(HashMap::new()),
        })
    }

    fn blob_of(&self, file_id: &str) -> Option<Vec<u8>> {
        self.blobs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(file_id)
            .cloned()
    }

    fn store_blob(&self, file_id: &str, data: Vec<u8>) {
        self.blobs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(file_id.to_string(), data);
    }
}

/// Bind the relay listener and spawn its acceptor. Returns the bound address.
pub async fn spawn(relay: Arc<FileRelay>) -> std::io::Result<SocketAddr> {
    let listener =
        TcpListener::bind((relay.config.bind_addr(), relay.config.file_port)).await?;
    let addr = listener.local_addr()?;
    println!("✓ File server started on {addr}");
    tokio::spawn(accept_loop(relay, listener));
    Ok(addr)
}

async fn accept_loop(relay: Arc<FileRelay>, listener: TcpListener) {
    while relay.running.load(Ordering::Relaxed) {
        match timeout(std::time::Duration::from_secs(1), listener.accept()).await {
            Ok(Ok((stream, addr))) => {
                println!("📁 File transfer connection from {addr}");
                tokio::spawn(handle_transfer(relay.clone(), stream, addr));
            }
            Ok(Err(e)) => {
                if relay.running.load(Ordering::Relaxed) {
                    eprintln!("❌ Error accepting file connection: {e}");
                }
            }
            Err(_) => continue,
        }
    }
}

/// One connection, one operation. The first frame decides upload vs
/// download; the whole exchange is bounded by the transfer deadline.
async fn handle_transfer(relay: Arc<FileRelay>, stream: tokio::net::TcpStream, addr: SocketAddr) {
    let (mut reader, mut writer) = stream.into_split();

    // Bytes past the header frame (a pipelining client) stay in the buffer
    // and are consumed by the upload/download phase.
    let mut buf = Vec::new();
    let first = match timeout(
        std::time::Duration::from_secs(30),
        read_json_line(&mut reader, &mut buf),
    )
    .await
    {
        Ok(Some(value)) => value,
        Ok(None) => return,
        Err(_) => {
            eprintln!("⏱️ File transfer timeout from {addr}");
            return;
        }
    };

    let deadline = relay.config.transfer_timeout;
    let result = if first.get("file_name").is_some() {
        timeout(
            deadline,
            handle_upload(&relay, &mut reader, &mut writer, first, buf),
        )
        .await
    } else if first.get("file_id").is_some() {
        timeout(
            deadline,
            handle_download(&relay, &mut reader, &mut writer, first, buf),
        )
        .await
    } else {
        eprintln!("⚠️ Unrecognized file transfer request from {addr}");
        return;
    };
    if result.is_err() {
        eprintln!("⏱️ File transfer deadline exceeded for {addr}");
    }
    let _ = writer.shutdown().await;
}

/// Upload: `{file_name, file_size, sender}` → index + persist → ready reply
/// → exactly `file_size` raw bytes. A short read leaves the record present
/// but incomplete; incomplete records are never listed.
async fn handle_upload(
    relay: &Arc<FileRelay>,
    reader: &mut OwnedReadHalf,
    writer: &mut OwnedWriteHalf,
    metadata: Value,
    leftover: Vec<u8>,
) {
    let Some(file_name) = metadata.get("file_name").and_then(Value::as_str) else {
        return;
    };
    let file_size = metadata
        .get("file_size")
        .and_then(Value::as_u64)
        .unwrap_or(0);
    let sender = metadata
        .get("sender")
        .and_then(Value::as_str)
        .unwrap_or("Unknown");

    let file_id = format!("{}_{file_name}", chrono::Utc::now().timestamp_millis());
    println!(
        "📤 Receiving: {file_name} ({}) from {sender}",
        format_bytes(file_size)
    );

    // Index entry goes in (and to disk) before the ready reply, so every id
    // a client learns is already in the index.
    let record = FileRecord::new(
        file_id.clone(),
        file_name.to_string(),
        file_size,
        sender.to_string(),
    );
    relay.store.add_file(record);

    let ready = serde_json::json!({ "status": "ready", "file_id": file_id });
    if send_json(writer, &ready).await.is_err() {
        return;
    }

    let mut data = Vec::with_capacity(file_size.min(16 * 1024 * 1024) as usize);
    data.extend_from_slice(&leftover);
    data.truncate(file_size as usize);
    let mut received: u64 = data.len() as u64;
    while received < file_size {
        let want = ((file_size - received).min(4096)) as usize;
        let mut chunk = vec![0u8; want];
        match reader.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => {
                data.extend_from_slice(&chunk[..n]);
                received += n as u64;
            }
            Err(e) => {
                eprintln!("❌ Error receiving file data: {e}");
                break;
            }
        }
    }

    if received == file_size {
        relay.store_blob(&file_id, data);
        relay.store.set_file_complete(&file_id, true);
        println!("✓ File received: {file_name} ({})", format_bytes(received));
    } else {
        eprintln!("⚠️ Incomplete file transfer: {received}/{file_size} bytes");
    }
}

/// Download: `{file_id, requester}` → sending reply → one ack frame → raw
/// blob bytes. Unknown ids (including blobs lost to a restart) get a
/// structured error.
async fn handle_download(
    relay: &Arc<FileRelay>,
    reader: &mut OwnedReadHalf,
    writer: &mut OwnedWriteHalf,
    request: Value,
    leftover: Vec<u8>,
) {
    let Some(file_id) = request.get("file_id").and_then(Value::as_str) else {
        return;
    };
    let requester = request
        .get("requester")
        .and_then(Value::as_str)
        .unwrap_or("Unknown");

    let record = relay.store.get_file(file_id).filter(|r| r.complete);
    let blob = relay.blob_of(file_id);
    let (Some(record), Some(blob)) = (record, blob) else {
        let error = serde_json::json!({ "status": "error", "message": "File not found" });
        let _ = send_json(writer, &error).await;
        return;
    };

    let header = serde_json::json!({
        "status": "sending",
        "file_name": record.file_name,
        "file_size": record.size,
    });
    if send_json(writer, &header).await.is_err() {
        return;
    }

    // One short acknowledgement frame before the byte stream (it may have
    // arrived pipelined with the request).
    if leftover.is_empty() {
        let mut ack = [0u8; 1024];
        let _ = reader.read(&mut ack).await;
    }

    if let Err(e) = writer.write_all(&blob).await {
        eprintln!("❌ Error sending file: {e}");
        return;
    }
    println!("✓ File sent: {} to {requester}", record.file_name);
}

/// Read one newline-terminated JSON frame; anything already read past the
/// newline stays in `buf` for the caller.
async fn read_json_line(reader: &mut OwnedReadHalf, buf: &mut Vec<u8>) -> Option<Value> {
    loop {
        if let Some(pos) = buf.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = buf.drain(..=pos).collect();
            let text = std::str::from_utf8(&line[..line.len() - 1]).ok()?;
            return match serde_json::from_str(text.trim()) {
                Ok(value) => Some(value),
                Err(e) => {
                    eprintln!("⚠️ Invalid file transfer JSON: {e}");
                    None
                }
            };
        }
        let mut chunk = [0u8; 1024];
        match reader.read(&mut chunk).await {
            Ok(0) => return None,
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
            Err(_) => return None,
        }
    }
}

async fn send_json(writer: &mut OwnedWriteHalf, value: &Value) -> std::io::Result<()> {
    let mut line = value.to_string();
    line.push('\n');
    writer.write_all(line.as_bytes()).await
}

fn format_bytes(size: u64) -> String {
    let mut size = size as f64;
    for unit in ["B", "KB", "MB", "GB"] {
        if size < 1024.0 {
            return format!("{size:.1} {unit}");
        }
        size /= 1024.0;
    }
    format!("{size:.1} TB")
}
