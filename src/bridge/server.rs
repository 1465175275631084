// Socket server for bridge clients
//
// Each connection speaks newline-delimited JSON. Requests from one client
// run concurrently; their answers and the broadcast lines share one writer.

use std::net::SocketAddr;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use super::messages::{ClientMessage, ServerMessage, unix_ms};
use super::{Bridge, BridgeError};

/// Replies queued per client before its requests block
const CLIENT_QUEUE: usize = 64;

impl Bridge {
    /// Accept clients on `addr` until the task is dropped.
    pub async fn serve(&self, addr: &str) -> Result<(), BridgeError> {
        let listener = TcpListener::bind(addr).await?;
        info!("Listening for clients on {}", listener.local_addr()?);
        self.serve_listener(listener).await
    }

    pub async fn serve_listener(&self, listener: TcpListener) -> Result<(), BridgeError> {
        loop {
            let (stream, peer) = listener.accept().await?;
            let bridge = self.clone();
            tokio::spawn(async move {
                info!("Client connected: {}", peer);
                if let Err(e) = bridge.serve_client(stream, peer).await {
                    debug!("Client {} error: {}", peer, e);
                }
                info!("Client disconnected: {}", peer);
            });
        }
    }

    async fn serve_client(&self, stream: TcpStream, peer: SocketAddr) -> Result<(), BridgeError> {
        let (reader, mut writer) = stream.into_split();
        let mut lines = BufReader::new(reader).lines();
        let mut events = self.subscribe();
        let (reply_tx, mut reply_rx) = mpsc::channel::<ServerMessage>(CLIENT_QUEUE);

        loop {
            let outbound = tokio::select! {
                line = lines.next_line() => {
                    let Some(line) = line? else { break };
                    if line.trim().is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<ClientMessage>(&line) {
                        Ok(msg) => {
                            debug!("Client {} request {}", peer, msg.id());
                            let bridge = self.clone();
                            let reply_tx = reply_tx.clone();
                            tokio::spawn(async move {
                                let reply = bridge.handle_message(msg).await;
                                let _ = reply_tx.send(reply).await;
                            });
                            continue;
                        }
                        Err(e) => ServerMessage::Error {
                            message: format!("bad message: {}", e),
                        },
                    }
                }
                Some(reply) = reply_rx.recv() => reply,
                event = events.recv() => match event {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Client {} lagged, {} lines skipped", peer, n);
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            };
            let mut json = serde_json::to_string(&outbound)?;
            json.push('\n');
            writer.write_all(json.as_bytes()).await?;
        }
        Ok(())
    }

    /// Turn one client message into its answer.
    pub async fn handle_message(&self, msg: ClientMessage) -> ServerMessage {
        match msg {
            ClientMessage::Command {
                id,
                cmd,
                expect_reply,
            } => {
                let want = expect_reply.unwrap_or(true) && cmd.expects_reply();
                match self.request(&id, &cmd, want).await {
                    Ok(Some(body)) => ServerMessage::Reply {
                        id,
                        ok: body != "false",
                        body: Some(body),
                        error: None,
                    },
                    Ok(None) => ServerMessage::ack(&id, Ok(())),
                    Err(e) if want => ServerMessage::Reply {
                        id,
                        ok: false,
                        body: None,
                        error: Some(e.to_string()),
                    },
                    Err(e) => ServerMessage::ack(&id, Err(e.to_string())),
                }
            }
            ClientMessage::StreamStart {
                id,
                v,
                w,
                rate_hz,
                ttl_ms,
            } => {
                let result = self.stream_start(v, w, rate_hz, ttl_ms);
                ServerMessage::ack(&id, result.map_err(|e| e.to_string()))
            }
            ClientMessage::StreamUpdate { id, v, w } => {
                let result = self.stream_update(v, w);
                ServerMessage::ack(&id, result.map_err(|e| e.to_string()))
            }
            ClientMessage::StreamStop { id } => {
                let result = self.stream_stop().await;
                ServerMessage::ack(&id, result.map_err(|e| e.to_string()))
            }
            ClientMessage::Status { id } => ServerMessage::Status {
                id: Some(id),
                status: self.status(),
                ts_ms: unix_ms(),
            },
        }
    }
}
