#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};
use subscriber_sync::config::SyncConfig;
use subscriber_sync::engine::Engine;
use subscriber_sync::store::{ChangeOperation, NewChange, Snapshot, SqliteStore};
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

pub fn snapshot(value: Value) -> Snapshot {
    serde_json::from_value(value).unwrap()
}

pub fn update(entity_id: &str, new: Value) -> NewChange {
    NewChange::external(
        "subscription",
        ChangeOperation::Update,
        entity_id,
        None,
        Some(snapshot(new)),
    )
}

pub fn status_update(entity_id: &str, status: &str) -> NewChange {
    update(entity_id, json!({ "status": status }))
}

/// Engine over a fresh SQLite file. Keep the TempDir alive for the test.
pub fn engine(mut config: SyncConfig) -> (TempDir, Engine) {
    let dir = tempfile::tempdir().unwrap();
    config.database_path = dir.path().join("sync.db");
    let store = Arc::new(SqliteStore::open(&config.database_path).unwrap());
    let engine = Engine::with_store(&config, store).unwrap();
    (dir, engine)
}

/// Minimal HTTP endpoint on loopback that records request bodies and answers
/// every request with `status` after `delay`.
pub struct Responder {
    pub url: String,
    bodies: Arc<Mutex<Vec<Value>>>,
}

impl Responder {
    pub async fn start(status: u16, delay: Duration) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/hook", listener.local_addr().unwrap());
        let bodies = Arc::new(Mutex::new(Vec::new()));

        let recorded = bodies.clone();
        tokio::spawn(async move {
            loop {
                let (mut socket, _) = match listener.accept().await {
                    Ok(conn) => conn,
                    Err(_) => return,
                };
                let recorded = recorded.clone();
                tokio::spawn(async move {
                    let body = read_request(&mut socket).await;
                    if let Ok(value) = serde_json::from_slice::<Value>(&body) {
                        recorded.lock().unwrap().push(value);
                    }
                    tokio::time::sleep(delay).await;
                    let reply = format!(
                        "HTTP/1.1 {} Status\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
                        status
                    );
                    let _ = socket.write_all(reply.as_bytes()).await;
                    let _ = socket.shutdown().await;
                });
            }
        });

        Self { url, bodies }
    }

    pub fn hits(&self) -> usize {
        self.bodies.lock().unwrap().len()
    }

    pub fn bodies(&self) -> Vec<Value> {
        self.bodies.lock().unwrap().clone()
    }
}

async fn read_request(socket: &mut tokio::net::TcpStream) -> Vec<u8> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    let header_end = loop {
        let n = socket.read(&mut chunk).await.unwrap_or(0);
        if n == 0 {
            return Vec::new();
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
    };

    let headers = String::from_utf8_lossy(&buf[..header_end]).to_ascii_lowercase();
    let length = headers
        .lines()
        .find_map(|line| line.strip_prefix("content-length:"))
        .and_then(|value| value.trim().parse::<usize>().ok())
        .unwrap_or(0);

    while buf.len() < header_end + length {
        let n = socket.read(&mut chunk).await.unwrap_or(0);
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
    }
    buf[header_end..].to_vec()
}
