// Host bridge
//
// Owns the one serial link to the device and shares it with any number of
// socket clients:
// - passthrough commands, correlated to device replies by tag
// - one authoritative streaming setpoint loop
// - republication of unsolicited device lines
// - health endpoint and optional zenoh telemetry

pub mod health;
pub mod link;
pub mod messages;
pub mod pending;
pub mod server;
pub mod sim;
pub mod stream;
pub mod telemetry;

use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::config::{
    DEFAULT_BOOT_TIMEOUT_MS, DEFAULT_REQUEST_TIMEOUT_MS, DEFAULT_STREAM_RATE_HZ,
    DEFAULT_STREAM_TTL_MS, RECONNECT_DELAY_MS,
};
use crate::firmware::device::BOOT_MARKER;
use crate::protocol::command::N_STOP;
use link::LinkState;
use messages::{LinkStatus, ServerMessage, WireCommand, unix_ms};
use pending::PendingTable;
use stream::ActiveStream;

/// Error types for the bridge
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("Serial link not ready")]
    LinkNotReady,

    #[error("No reply within {0}ms")]
    Timeout(u64),

    #[error("Serial link closed")]
    LinkClosed,

    #[error("Device reset while the request was pending")]
    DeviceReset,

    #[error("Too many requests in flight")]
    TooManyPending,

    #[error("No stream running")]
    NoStream,

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Zenoh error: {0}")]
    Zenoh(String),
}

/// Bridge timing knobs
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub request_timeout: Duration,
    pub boot_timeout: Duration,
    pub reconnect_delay: Duration,
    pub stream_rate_hz: u32,
    pub stream_ttl_ms: u32,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS),
            boot_timeout: Duration::from_millis(DEFAULT_BOOT_TIMEOUT_MS),
            reconnect_delay: Duration::from_millis(RECONNECT_DELAY_MS),
            stream_rate_hz: DEFAULT_STREAM_RATE_HZ,
            stream_ttl_ms: DEFAULT_STREAM_TTL_MS,
        }
    }
}

struct Inner {
    config: BridgeConfig,
    started: Instant,
    link: LinkState,
    pending: Mutex<PendingTable>,
    stream: Mutex<Option<ActiveStream>>,
    events: broadcast::Sender<ServerMessage>,
}

/// Cheap to clone; every clone drives the same link.
#[derive(Clone)]
pub struct Bridge {
    inner: Arc<Inner>,
}

/// Lock a mutex, recovering the data if a holder panicked
fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Bridge {
    pub fn new(config: BridgeConfig) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            inner: Arc::new(Inner {
                config,
                started: Instant::now(),
                link: LinkState::default(),
                pending: Mutex::new(PendingTable::new()),
                stream: Mutex::new(None),
                events,
            }),
        }
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.inner.config
    }

    pub fn uptime(&self) -> Duration {
        self.inner.started.elapsed()
    }

    /// Unsolicited lines and status changes
    pub fn subscribe(&self) -> broadcast::Receiver<ServerMessage> {
        self.inner.events.subscribe()
    }

    fn publish(&self, msg: ServerMessage) {
        // No subscribers is fine
        let _ = self.inner.events.send(msg);
    }

    fn publish_status(&self) {
        self.publish(ServerMessage::Status {
            id: None,
            status: self.status(),
            ts_ms: unix_ms(),
        });
    }

    pub fn is_ready(&self) -> bool {
        self.inner.link.is_ready()
    }

    pub fn status(&self) -> LinkStatus {
        let link = &self.inner.link;
        let last_rx = link.last_rx_ms.load(Ordering::Relaxed);
        LinkStatus {
            ready: link.is_ready(),
            device_resets: link.device_resets.load(Ordering::Relaxed),
            rx_bytes: link.rx_bytes.load(Ordering::Relaxed),
            tx_bytes: link.tx_bytes.load(Ordering::Relaxed),
            rx_lines: link.rx_lines.load(Ordering::Relaxed),
            pending: lock(&self.inner.pending).len(),
            timeouts: link.timeouts.load(Ordering::Relaxed),
            streaming: self.is_streaming(),
            last_rx_ms: (last_rx != 0).then_some(last_rx),
        }
    }

    /// Send a command to the device. With `expect_reply` the call waits for
    /// the tagged reply and returns its body; otherwise it returns once the
    /// line is queued on the link.
    pub async fn request(
        &self,
        client_id: &str,
        cmd: &WireCommand,
        expect_reply: bool,
    ) -> Result<Option<String>, BridgeError> {
        if !self.is_ready() {
            return Err(BridgeError::LinkNotReady);
        }
        if !expect_reply || !cmd.expects_reply() {
            self.inner.link.send_line(&cmd.to_line("")?).await?;
            return Ok(None);
        }

        let (tag, rx) = lock(&self.inner.pending)
            .register(client_id)
            .ok_or(BridgeError::TooManyPending)?;
        let sent = match cmd.to_line(&tag) {
            Ok(line) => self.inner.link.send_line(&line).await,
            Err(e) => Err(e),
        };
        if let Err(e) = sent {
            lock(&self.inner.pending).remove(&tag);
            return Err(e);
        }

        let timeout = self.inner.config.request_timeout;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result.map(Some),
            Ok(Err(_)) => Err(BridgeError::LinkClosed),
            Err(_) => {
                // The slot is freed here; a late reply is then just a line
                lock(&self.inner.pending).remove(&tag);
                self.inner.link.timeouts.fetch_add(1, Ordering::Relaxed);
                warn!("Request {} ({}) timed out", client_id, tag);
                Err(BridgeError::Timeout(timeout.as_millis() as u64))
            }
        }
    }

    /// A line arrived from the device.
    fn on_device_line(&self, line: &str) {
        self.inner.link.rx_lines.fetch_add(1, Ordering::Relaxed);
        if is_boot_line(line) {
            self.on_device_reset();
        } else if lock(&self.inner.pending).resolve_line(line) {
            return;
        }
        self.publish(ServerMessage::Line {
            line: line.to_string(),
            ts_ms: unix_ms(),
        });
    }

    fn on_device_reset(&self) {
        let resets = self.inner.link.device_resets.fetch_add(1, Ordering::Relaxed) + 1;
        let failed = lock(&self.inner.pending).fail_all(|| BridgeError::DeviceReset);
        warn!("Device reset detected (#{}), {} pending requests failed", resets, failed);
        self.inner.link.queue_boot_stop();
        self.publish_status();
    }

    /// Link became usable: stop the robot once, then accept requests.
    fn link_ready(&self) {
        self.inner.link.queue_boot_stop();
        self.inner.link.set_ready(true);
        info!("Link ready");
        self.publish_status();
    }

    fn link_down(&self) {
        let was_ready = self.inner.link.is_ready();
        self.inner.link.set_ready(false);
        self.inner.link.detach();
        let failed = lock(&self.inner.pending).fail_all(|| BridgeError::LinkClosed);
        if was_ready {
            warn!("Link down, {} pending requests failed", failed);
        } else {
            debug!("Link down before it became ready");
        }
        self.publish_status();
    }

    /// Stop the robot and the stream, used on shutdown.
    pub async fn shutdown(&self) {
        if self.is_streaming() {
            if let Err(e) = self.stream_stop().await {
                warn!("Stop on shutdown failed: {}", e);
            }
        } else if self.is_ready() {
            let _ = self.request("shutdown", &WireCommand::new(N_STOP), false).await;
        }
    }
}

/// The boot marker, alone or glued to a reply the reset cut short.
fn is_boot_line(line: &str) -> bool {
    line == BOOT_MARKER
        || (line.starts_with('{') && !line.contains('}') && line.ends_with(BOOT_MARKER))
}
