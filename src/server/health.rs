//! Optional peer-check endpoint
//!
//! One-shot HTTP responder reporting the number of live tunnel sessions.

use super::PeerManager;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, warn};

/// Serves health JSON on a dedicated listener
pub struct HealthEndpoint {
    manager: Arc<PeerManager>,
}

impl HealthEndpoint {
    pub fn new(manager: Arc<PeerManager>) -> Self {
        Self { manager }
    }

    /// Accept health probes forever
    pub async fn run(&self, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, _)) => {
                    let manager = Arc::clone(&self.manager);
                    tokio::spawn(respond(stream, manager));
                }
                Err(err) => {
                    warn!("Health accept error: {}", err);
                }
            }
        }
    }
}

async fn respond(mut stream: TcpStream, manager: Arc<PeerManager>) {
    // Drain whatever request line arrived; the answer is always the same
    let mut request = [0u8; 1024];
    let _ = stream.read(&mut request).await;

    let body = serde_json::json!({
        "status": "ok",
        "connections": manager.connections(),
    })
    .to_string();

    let response = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        body.len(),
        body
    );
    if let Err(err) = stream.write_all(response.as_bytes()).await {
        debug!("Health response failed: {}", err);
    }
}
