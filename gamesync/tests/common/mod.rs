//! Minimal in-process HTTP/1.1 server for end-to-end tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

/// How the server answers one path.
#[derive(Debug, Clone)]
pub enum Route {
    /// 200 with this body; honours `Range: bytes=N-` with 206.
    Body(Vec<u8>),
    /// A bare status code.
    Status(u16),
    /// 302 to this location.
    Redirect(String),
    /// Announce the full length, send a prefix, then go silent.
    Stall { body: Vec<u8>, send: usize },
}

/// A request the server saw.
#[derive(Debug, Clone)]
pub struct Seen {
    pub path: String,
    pub range_start: Option<u64>,
}

#[derive(Default)]
struct Shared {
    routes: HashMap<String, Route>,
    seen: Vec<Seen>,
}

pub struct TestServer {
    addr: SocketAddr,
    shared: Arc<Mutex<Shared>>,
    handle: JoinHandle<()>,
}

impl TestServer {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shared = Arc::new(Mutex::new(Shared::default()));

        let state = Arc::clone(&shared);
        let handle = tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let state = Arc::clone(&state);
                tokio::spawn(async move {
                    let _ = handle(stream, state).await;
                });
            }
        });

        Self {
            addr,
            shared,
            handle,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn route(&self, path: &str, route: Route) {
        self.shared
            .lock()
            .routes
            .insert(path.to_string(), route);
    }

    pub fn hits(&self, path: &str) -> usize {
        self.shared
            .lock()
            .seen
            .iter()
            .filter(|s| s.path == path)
            .count()
    }

    pub fn requests(&self, path: &str) -> Vec<Seen> {
        self.shared
            .lock()
            .seen
            .iter()
            .filter(|s| s.path == path)
            .cloned()
            .collect()
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn handle(mut stream: TcpStream, state: Arc<Mutex<Shared>>) -> std::io::Result<()> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Ok(());
        }
        buf.extend_from_slice(&chunk[..n]);
    }

    let head = String::from_utf8_lossy(&buf).to_string();
    let mut lines = head.lines();
    let path = lines
        .next()
        .and_then(|l| l.split_whitespace().nth(1))
        .unwrap_or("/")
        .to_string();
    let range_start = lines
        .filter_map(|l| l.split_once(':'))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("range"))
        .and_then(|(_, value)| {
            value
                .trim()
                .strip_prefix("bytes=")
                .and_then(|v| v.trim_end_matches('-').parse::<u64>().ok())
        });

    let route = {
        let mut shared = state.lock();
        shared.seen.push(Seen {
            path: path.clone(),
            range_start,
        });
        shared.routes.get(&path).cloned()
    };

    match route {
        None => respond(&mut stream, 404, &[], b"").await,
        Some(Route::Status(code)) => respond(&mut stream, code, &[], b"").await,
        Some(Route::Redirect(location)) => {
            respond(&mut stream, 302, &[("Location", location)], b"").await
        }
        Some(Route::Body(body)) => match range_start {
            Some(start) if start > 0 && (start as usize) < body.len() => {
                let range = format!("bytes {}-{}/{}", start, body.len() - 1, body.len());
                respond(&mut stream, 206, &[("Content-Range", range)], &body[start as usize..]).await
            }
            _ => respond(&mut stream, 200, &[], &body).await,
        },
        Some(Route::Stall { body, send }) => {
            let head = format!(
                "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                body.len()
            );
            stream.write_all(head.as_bytes()).await?;
            stream.write_all(&body[..send.min(body.len())]).await?;
            stream.flush().await?;
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(())
        }
    }
}

async fn respond(
    stream: &mut TcpStream,
    status: u16,
    headers: &[(&str, String)],
    body: &[u8],
) -> std::io::Result<()> {
    let reason = match status {
        200 => "OK",
        206 => "Partial Content",
        302 => "Found",
        404 => "Not Found",
        _ => "Status",
    };
    let mut head = format!(
        "HTTP/1.1 {} {}\r\nContent-Length: {}\r\nConnection: close\r\n",
        status,
        reason,
        body.len()
    );
    for (name, value) in headers {
        head.push_str(&format!("{}: {}\r\n", name, value));
    }
    head.push_str("\r\n");

    stream.write_all(head.as_bytes()).await?;
    stream.write_all(body).await?;
    stream.flush().await?;
    stream.shutdown().await
}

pub fn sha(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

/// Manifest JSON for `(path, content)` pairs.
pub fn manifest_json(version: Option<&str>, files: &[(&str, &[u8])]) -> Vec<u8> {
    let files: Vec<serde_json::Value> = files
        .iter()
        .map(|(path, data)| {
            serde_json::json!({
                "path": path,
                "size": data.len(),
                "hash": sha(data),
            })
        })
        .collect();
    let mut manifest = serde_json::json!({ "files": files });
    if let Some(version) = version {
        manifest["version"] = serde_json::Value::from(version);
    }
    serde_json::to_vec(&manifest).unwrap()
}
