// Minimal HTTP health endpoint
//
// GET /health answers 200 with a JSON body; anything else is 404. One
// request per connection.

use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info};

use super::messages::LinkStatus;
use super::{Bridge, BridgeError};

/// Bytes read from a request; only the request line matters
const MAX_REQUEST: usize = 1024;

#[derive(Debug, Serialize)]
struct Health {
    status: &'static str,
    uptime_s: u64,
    #[serde(flatten)]
    link: LinkStatus,
}

impl Bridge {
    pub async fn serve_health(&self, addr: &str) -> Result<(), BridgeError> {
        let listener = TcpListener::bind(addr).await?;
        info!("Health endpoint on http://{}/health", listener.local_addr()?);
        self.serve_health_listener(listener).await
    }

    pub async fn serve_health_listener(&self, listener: TcpListener) -> Result<(), BridgeError> {
        loop {
            let (stream, peer) = listener.accept().await?;
            let bridge = self.clone();
            tokio::spawn(async move {
                if let Err(e) = bridge.answer_health(stream).await {
                    debug!("Health request from {} failed: {}", peer, e);
                }
            });
        }
    }

    async fn answer_health(&self, mut stream: TcpStream) -> Result<(), BridgeError> {
        let mut buf = [0u8; MAX_REQUEST];
        let n = stream.read(&mut buf).await?;
        let request = String::from_utf8_lossy(&buf[..n]);
        let request_line = request.lines().next().unwrap_or_default();
        let mut parts = request_line.split_whitespace();

        let response = match (parts.next(), parts.next()) {
            (Some("GET"), Some("/health")) => {
                let link = self.status();
                let body = serde_json::to_string(&Health {
                    status: if link.ready { "ok" } else { "degraded" },
                    uptime_s: self.uptime().as_secs(),
                    link,
                })?;
                http_response("200 OK", "application/json", &body)
            }
            _ => http_response("404 Not Found", "text/plain", "not found"),
        };
        stream.write_all(response.as_bytes()).await?;
        stream.shutdown().await?;
        Ok(())
    }
}

fn http_response(status: &str, content_type: &str, body: &str) -> String {
    format!(
        "HTTP/1.1 {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        content_type,
        body.len(),
        body
    )
}
