use std::net::SocketAddr;
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::common::{test_server, wait_for_file, Peer};

async fn read_json_line(stream: &mut TcpStream) -> Value {
    let mut buf = Vec::new();
    loop {
        if let Some(pos) = buf.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = buf.drain(..=pos).collect();
            let text = String::from_utf8_lossy(&line[..line.len() - 1]).to_string();
            return serde_json::from_str(text.trim()).expect("relay reply is JSON");
        }
        let mut chunk = [0u8; 1024];
        let n = tokio::time::timeout(Duration::from_secs(5), stream.read(&mut chunk))
            .await
            .expect("relay reply in time")
            .expect("relay socket readable");
        assert!(n > 0, "relay closed before replying");
        buf.extend_from_slice(&chunk[..n]);
    }
}

async fn upload(addr: SocketAddr, name: &str, data: &[u8], sender: &str) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let header = serde_json::json!({
        "file_name": name,
        "file_size": data.len(),
        "sender": sender,
    });
    stream
        .write_all(format!("{header}\n").as_bytes())
        .await
        .unwrap();

    let ready = read_json_line(&mut stream).await;
    assert_eq!(ready["status"], "ready");
    let file_id = ready["file_id"].as_str().unwrap().to_string();
    assert!(file_id.ends_with(&format!("_{name}")));

    stream.write_all(data).await.unwrap();
    stream.shutdown().await.unwrap();
    file_id
}

// --- Upload ---

#[tokio::test]
async fn upload_then_download_round_trips_the_bytes() {
    let server = test_server().await;
    let payload = b"eleven byte".to_vec();
    let file_id = upload(server.file_addr(), "notes.txt", &payload, "alice").await;

    // Wait for the transfer to be marked complete.
    wait_for_file(&server.data_file("files.json"), |index| {
        index[&file_id]["complete"] == true
    })
    .await;

    let mut stream = TcpStream::connect(server.file_addr()).await.unwrap();
    let request = serde_json::json!({ "file_id": file_id, "requester": "bob" });
    stream
        .write_all(format!("{request}\n").as_bytes())
        .await
        .unwrap();

    let header = read_json_line(&mut stream).await;
    assert_eq!(header["status"], "sending");
    assert_eq!(header["file_name"], "notes.txt");
    assert_eq!(header["file_size"], payload.len());

    stream.write_all(b"ready").await.unwrap();
    let mut received = Vec::new();
    stream.read_to_end(&mut received).await.unwrap();
    assert_eq!(received, payload);
}

// Invariant: the id is in the persisted index before the ready reply is
// acted on.
#[tokio::test]
async fn uploaded_id_is_indexed_before_ready() {
    let server = test_server().await;
    let file_id = upload(server.file_addr(), "indexed.bin", &[7u8; 32], "alice").await;

    wait_for_file(&server.data_file("files.json"), |index| {
        index.get(&file_id).is_some()
    })
    .await;
    let record = server.handles.chat.store.get_file(&file_id).unwrap();
    assert_eq!(record.sender, "alice");
    assert_eq!(record.size, 32);
}

#[tokio::test]
async fn zero_byte_file_completes_normally() {
    let server = test_server().await;
    let file_id = upload(server.file_addr(), "empty.txt", &[], "alice").await;

    wait_for_file(&server.data_file("files.json"), |index| {
        index[&file_id]["complete"] == true
    })
    .await;

    let mut stream = TcpStream::connect(server.file_addr()).await.unwrap();
    let request = serde_json::json!({ "file_id": file_id, "requester": "bob" });
    stream
        .write_all(format!("{request}\n").as_bytes())
        .await
        .unwrap();
    let header = read_json_line(&mut stream).await;
    assert_eq!(header["status"], "sending");
    assert_eq!(header["file_size"], 0);
    stream.write_all(b"ready").await.unwrap();
    let mut received = Vec::new();
    stream.read_to_end(&mut received).await.unwrap();
    assert!(received.is_empty());
}

#[tokio::test]
async fn short_upload_is_kept_but_never_listed() {
    let server = test_server().await;
    let mut stream = TcpStream::connect(server.file_addr()).await.unwrap();
    let header = serde_json::json!({
        "file_name": "truncated.bin",
        "file_size": 10,
        "sender": "alice",
    });
    stream
        .write_all(format!("{header}\n").as_bytes())
        .await
        .unwrap();
    let ready = read_json_line(&mut stream).await;
    let file_id = ready["file_id"].as_str().unwrap().to_string();

    stream.write_all(&[1, 2, 3, 4]).await.unwrap();
    stream.shutdown().await.unwrap();
    drop(stream);

    // The record survives, flagged incomplete, and stays out of listings.
    wait_for_file(&server.data_file("files.json"), |index| {
        index.get(&file_id).is_some()
    })
    .await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    let record = server.handles.chat.store.get_file(&file_id).unwrap();
    assert!(!record.complete);
    assert!(server.handles.chat.store.files_snapshot().is_empty());
}

// --- Download errors ---

#[tokio::test]
async fn unknown_file_id_reports_not_found() {
    let server = test_server().await;
    let mut stream = TcpStream::connect(server.file_addr()).await.unwrap();
    let request = serde_json::json!({ "file_id": "no-such-file", "requester": "bob" });
    stream
        .write_all(format!("{request}\n").as_bytes())
        .await
        .unwrap();
    let reply = read_json_line(&mut stream).await;
    assert_eq!(reply["status"], "error");
    assert_eq!(reply["message"], "File not found");
}

// --- Announcements go through the chat router, never the relay ---

#[tokio::test]
async fn file_share_is_announced_by_the_router_only() {
    let server = test_server().await;
    let mut alice = Peer::connect_ready(server.chat_addr(), "alice").await;
    let mut bob = Peer::connect_ready(server.chat_addr(), "bob").await;
    alice.recv_system_containing("joined the chat").await;
    alice.recv_type("user_list").await;

    let file_id = upload(server.file_addr(), "shared.pdf", &[9u8; 64], "alice").await;

    // The upload itself makes no chat traffic.
    alice.expect_silence(Duration::from_millis(300)).await;

    alice
        .send(&serde_json::json!({
            "type": "file_share",
            "sender": "alice",
            "file_id": file_id,
            "file_name": "shared.pdf",
            "size": 64,
        }))
        .await;
    for peer in [&mut alice, &mut bob] {
        let frame = peer.recv_type("file_share").await;
        assert_eq!(frame["file_id"].as_str().unwrap(), file_id);
    }

    // The share is recoverable as history.
    alice
        .send(&serde_json::json!({ "type": "request_chat_history" }))
        .await;
    let history = alice.recv_type("chat_history").await;
    assert_eq!(history["messages"].as_array().unwrap().len(), 1);
}
