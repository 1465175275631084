// Zenoh republication of device output
//
// Optional. Unsolicited device lines go to TOPIC_DEVICE_LINES as they arrive;
// link status goes to TOPIC_BRIDGE_STATUS on every change and once a second.

use std::time::Duration;

use tokio::sync::broadcast::error::RecvError;
use tokio::time::interval;
use tracing::{info, warn};

use super::messages::{ServerMessage, unix_ms};
use super::{Bridge, BridgeError};
use crate::config::{TOPIC_BRIDGE_STATUS, TOPIC_DEVICE_LINES};

/// Status heartbeat period
const STATUS_PERIOD: Duration = Duration::from_secs(1);

fn zenoh_err(e: zenoh::Error) -> BridgeError {
    BridgeError::Zenoh(e.to_string())
}

impl Bridge {
    pub async fn publish_telemetry(&self) -> Result<(), BridgeError> {
        info!("Opening Zenoh session...");
        let session = zenoh::open(zenoh::Config::default()).await.map_err(zenoh_err)?;
        let pub_lines = session
            .declare_publisher(TOPIC_DEVICE_LINES)
            .await
            .map_err(zenoh_err)?;
        let pub_status = session
            .declare_publisher(TOPIC_BRIDGE_STATUS)
            .await
            .map_err(zenoh_err)?;
        info!("Publishing to: {}, {}", TOPIC_DEVICE_LINES, TOPIC_BRIDGE_STATUS);

        let mut events = self.subscribe();
        let mut tick = interval(STATUS_PERIOD);
        loop {
            let msg = tokio::select! {
                _ = tick.tick() => ServerMessage::Status {
                    id: None,
                    status: self.status(),
                    ts_ms: unix_ms(),
                },
                event = events.recv() => match event {
                    Ok(msg) => msg,
                    Err(RecvError::Lagged(n)) => {
                        warn!("Telemetry lagged, {} messages skipped", n);
                        continue;
                    }
                    Err(RecvError::Closed) => return Ok(()),
                },
            };
            let json = serde_json::to_string(&msg)?;
            match msg {
                ServerMessage::Line { .. } => pub_lines.put(json).await.map_err(zenoh_err)?,
                ServerMessage::Status { .. } => pub_status.put(json).await.map_err(zenoh_err)?,
                _ => {}
            }
        }
    }
}
