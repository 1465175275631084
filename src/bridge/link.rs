// Serial link: transport, boot handshake and the reconnect loop
//
// A transport is a pair of byte channels. For a real port, two blocking
// tasks pump bytes between the channels and the serialport handle; the
// simulator plugs an in-process device into the same channels.

use std::fmt;
use std::io::{Read, Write};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{Instant, sleep, timeout_at};
use tracing::{debug, info, warn};

use super::messages::{WireCommand, unix_ms};
use super::{Bridge, BridgeError, lock};
use crate::firmware::device::BOOT_MARKER;
use crate::protocol::command::{N_HELLO, N_STOP};

/// Serial read timeout; bounds how long the reader notices a closed link
const SERIAL_READ_TIMEOUT_MS: u64 = 20;

/// Longest device line kept; the rest of an oversize line is dropped
pub const MAX_DEVICE_LINE: usize = 512;

/// Reply the device gives an untagged hello
const HELLO_REPLY: &str = "{hello_ok}";

/// Byte channels to and from the device
pub struct Transport {
    pub incoming: mpsc::Receiver<Vec<u8>>,
    pub outgoing: mpsc::Sender<Vec<u8>>,
}

impl Transport {
    /// A connected pair: the bridge side and the device side.
    pub fn pair(capacity: usize) -> (Transport, Transport) {
        let (to_device, from_bridge) = mpsc::channel(capacity);
        let (to_bridge, from_device) = mpsc::channel(capacity);
        (
            Transport {
                incoming: from_device,
                outgoing: to_device,
            },
            Transport {
                incoming: from_bridge,
                outgoing: to_bridge,
            },
        )
    }
}

/// Where the bridge gets its link from on every (re)connect
#[derive(Debug, Clone)]
pub enum LinkSource {
    Serial { path: String, baud: u32 },
    Simulated,
}

impl fmt::Display for LinkSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Serial { path, baud } => write!(f, "{} @ {} baud", path, baud),
            Self::Simulated => write!(f, "simulated device"),
        }
    }
}

impl LinkSource {
    pub fn open(&self) -> Result<Transport, BridgeError> {
        match self {
            Self::Serial { path, baud } => open_serial(path, *baud),
            Self::Simulated => Ok(super::sim::spawn_simulated().0),
        }
    }
}

/// Open a serial port and start the byte pumps.
pub fn open_serial(path: &str, baud: u32) -> Result<Transport, BridgeError> {
    let port = serialport::new(path, baud)
        .timeout(Duration::from_millis(SERIAL_READ_TIMEOUT_MS))
        .open()?;
    // Whatever sat in the buffers belongs to a previous session
    port.clear(serialport::ClearBuffer::All)?;
    let mut reader = port.try_clone()?;
    let mut writer = port;

    let (in_tx, in_rx) = mpsc::channel::<Vec<u8>>(64);
    let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(64);

    tokio::task::spawn_blocking(move || {
        let mut buf = [0u8; 256];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => {}
                Ok(n) => {
                    if in_tx.blocking_send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {
                    if in_tx.is_closed() {
                        break;
                    }
                }
                Err(e) => {
                    warn!("Serial read failed: {}", e);
                    break;
                }
            }
        }
        debug!("Serial reader stopped");
    });

    tokio::task::spawn_blocking(move || {
        while let Some(bytes) = out_rx.blocking_recv() {
            if let Err(e) = writer.write_all(&bytes).and_then(|_| writer.flush()) {
                warn!("Serial write failed: {}", e);
                break;
            }
        }
        debug!("Serial writer stopped");
    });

    Ok(Transport {
        incoming: in_rx,
        outgoing: out_tx,
    })
}

/// Splits the device byte stream into lines.
#[derive(Debug, Default)]
pub struct LineBuffer {
    buf: Vec<u8>,
    overflowed: bool,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        for &b in bytes {
            match b {
                b'\n' => {
                    if !self.overflowed && !self.buf.is_empty() {
                        lines.push(String::from_utf8_lossy(&self.buf).into_owned());
                    }
                    self.buf.clear();
                    self.overflowed = false;
                }
                b'\r' => {}
                _ if self.buf.len() >= MAX_DEVICE_LINE => self.overflowed = true,
                _ => self.buf.push(b),
            }
        }
        lines
    }
}

/// Link health shared between the reader, writers and status reports
#[derive(Default)]
pub struct LinkState {
    ready: AtomicBool,
    outgoing: Mutex<Option<mpsc::Sender<Vec<u8>>>>,
    pub device_resets: AtomicU64,
    pub rx_bytes: AtomicU64,
    pub tx_bytes: AtomicU64,
    pub rx_lines: AtomicU64,
    pub timeouts: AtomicU64,
    pub last_rx_ms: AtomicU64,
}

impl LinkState {
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    pub(super) fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::Release);
    }

    fn attach(&self, tx: mpsc::Sender<Vec<u8>>) {
        *lock(&self.outgoing) = Some(tx);
    }

    pub(super) fn detach(&self) {
        *lock(&self.outgoing) = None;
    }

    fn count_rx(&self, n: usize) {
        self.rx_bytes.fetch_add(n as u64, Ordering::Relaxed);
        self.last_rx_ms.store(unix_ms(), Ordering::Relaxed);
    }

    /// Write a line whether or not the link is ready yet.
    async fn write_raw(&self, line: &str) -> Result<(), BridgeError> {
        let tx = lock(&self.outgoing).clone().ok_or(BridgeError::LinkClosed)?;
        tx.send(line.as_bytes().to_vec())
            .await
            .map_err(|_| BridgeError::LinkClosed)?;
        self.tx_bytes.fetch_add(line.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    /// Write a line on a ready link. Writes from all clients are serialized
    /// through the one outgoing channel.
    pub async fn send_line(&self, line: &str) -> Result<(), BridgeError> {
        if !self.is_ready() {
            return Err(BridgeError::LinkNotReady);
        }
        self.write_raw(line).await
    }

    /// Queue a stop without waiting. Used right after boot, when the reply
    /// is not worth waiting for.
    pub(super) fn queue_boot_stop(&self) {
        let Some(tx) = lock(&self.outgoing).clone() else {
            return;
        };
        let line = match WireCommand::new(N_STOP).to_line("") {
            Ok(line) => line,
            Err(e) => {
                warn!("Could not encode boot stop: {}", e);
                return;
            }
        };
        if tx.try_send(line.clone().into_bytes()).is_ok() {
            self.tx_bytes.fetch_add(line.len() as u64, Ordering::Relaxed);
        } else {
            warn!("Could not queue boot stop");
        }
    }
}

impl Bridge {
    /// Connect, serve, and reconnect forever.
    pub async fn run(&self, source: LinkSource) {
        loop {
            match source.open() {
                Ok(transport) => {
                    info!("Link opened: {}", source);
                    if let Err(e) = self.serve_transport(transport).await {
                        warn!("Link session ended: {}", e);
                    }
                }
                Err(e) => warn!("Failed to open {}: {}", source, e),
            }
            sleep(self.inner.config.reconnect_delay).await;
        }
    }

    /// Run one link session until the transport closes.
    pub async fn serve_transport(&self, mut transport: Transport) -> Result<(), BridgeError> {
        let link = &self.inner.link;
        link.attach(transport.outgoing.clone());
        let mut lines = LineBuffer::new();

        let result = match self.handshake(&mut transport, &mut lines).await {
            Ok(leftover) => {
                self.link_ready();
                for line in leftover {
                    self.on_device_line(&line);
                }
                self.pump(&mut transport, &mut lines).await
            }
            Err(e) => Err(e),
        };
        self.link_down();
        result
    }

    async fn pump(&self, transport: &mut Transport, lines: &mut LineBuffer) -> Result<(), BridgeError> {
        while let Some(chunk) = transport.incoming.recv().await {
            self.inner.link.count_rx(chunk.len());
            for line in lines.push(&chunk) {
                self.on_device_line(&line);
            }
        }
        Err(BridgeError::LinkClosed)
    }

    /// Wait for the boot marker, discarding anything that came before it.
    /// If the device is already running and stays quiet, fall back to a
    /// hello. Returns lines that followed the marker in the same read.
    async fn handshake(
        &self,
        transport: &mut Transport,
        lines: &mut LineBuffer,
    ) -> Result<Vec<String>, BridgeError> {
        let config = &self.inner.config;
        let deadline = Instant::now() + config.boot_timeout;
        if let Some(leftover) = self.wait_for(transport, lines, deadline, BOOT_MARKER).await? {
            info!("Boot marker received");
            return Ok(leftover);
        }

        debug!("No boot marker, trying hello");
        let hello = WireCommand::new(N_HELLO).to_line("")?;
        self.inner.link.write_raw(&hello).await?;
        let deadline = Instant::now() + config.request_timeout;
        match self.wait_for(transport, lines, deadline, HELLO_REPLY).await? {
            Some(leftover) => Ok(leftover),
            None => Err(BridgeError::Timeout(config.request_timeout.as_millis() as u64)),
        }
    }

    /// Read until `wanted` arrives as a whole line or the deadline passes.
    async fn wait_for(
        &self,
        transport: &mut Transport,
        lines: &mut LineBuffer,
        deadline: Instant,
        wanted: &str,
    ) -> Result<Option<Vec<String>>, BridgeError> {
        loop {
            let chunk = match timeout_at(deadline, transport.incoming.recv()).await {
                Ok(Some(chunk)) => chunk,
                Ok(None) => return Err(BridgeError::LinkClosed),
                Err(_) => return Ok(None),
            };
            self.inner.link.count_rx(chunk.len());
            let mut got = lines.push(&chunk).into_iter();
            for line in got.by_ref() {
                if line == wanted {
                    return Ok(Some(got.collect()));
                }
                debug!("Discarding stale line: {}", line);
            }
        }
    }
}
