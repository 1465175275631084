// Streaming setpoint loop
//
// At most one loop runs. It re-sends the current v/w at a fixed rate so the
// device's TTL deadman never fires while a client is driving. Starting a new
// loop aborts the old one; stopping aborts it and sends an explicit stop.
// Dropped setpoints are never retried: silence is the stop signal.

use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, info};

use super::messages::WireCommand;
use super::{Bridge, BridgeError, lock};
use crate::config::{MAX_STREAM_RATE_HZ, OUTPUT_LIMIT, SETPOINT_TTL_MAX_MS, SETPOINT_TTL_MIN_MS};
use crate::protocol::command::{N_SETPOINT, N_STOP};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamParams {
    pub rate_hz: u32,
    pub ttl_ms: u32,
    pub v: i32,
    pub w: i32,
}

impl StreamParams {
    fn validate(&self) -> Result<(), BridgeError> {
        let limit = i32::from(OUTPUT_LIMIT);
        if !(-limit..=limit).contains(&self.v) || !(-limit..=limit).contains(&self.w) {
            return Err(BridgeError::InvalidRequest(format!(
                "v/w must be within -{limit}..={limit}"
            )));
        }
        if !(1..=MAX_STREAM_RATE_HZ).contains(&self.rate_hz) {
            return Err(BridgeError::InvalidRequest(format!(
                "rate_hz must be within 1..={MAX_STREAM_RATE_HZ}"
            )));
        }
        if !(SETPOINT_TTL_MIN_MS..=SETPOINT_TTL_MAX_MS).contains(&self.ttl_ms) {
            return Err(BridgeError::InvalidRequest(format!(
                "ttl_ms must be within {SETPOINT_TTL_MIN_MS}..={SETPOINT_TTL_MAX_MS}"
            )));
        }
        // Each setpoint must still be live when the next one is sent
        if self.period_ms() >= self.ttl_ms {
            return Err(BridgeError::InvalidRequest(format!(
                "ttl_ms {} must exceed the send period of {}ms",
                self.ttl_ms,
                self.period_ms()
            )));
        }
        Ok(())
    }

    fn period_ms(&self) -> u32 {
        1000 / self.rate_hz
    }

    fn setpoint(&self) -> WireCommand {
        WireCommand {
            n: N_SETPOINT,
            d1: self.v,
            d2: self.w,
            t: Some(self.ttl_ms),
            ..WireCommand::default()
        }
    }
}

pub(super) struct ActiveStream {
    params: watch::Sender<StreamParams>,
    task: JoinHandle<()>,
}

impl Bridge {
    /// Start the loop, replacing any running one.
    pub fn stream_start(
        &self,
        v: i32,
        w: i32,
        rate_hz: Option<u32>,
        ttl_ms: Option<u32>,
    ) -> Result<(), BridgeError> {
        let params = StreamParams {
            rate_hz: rate_hz.unwrap_or(self.inner.config.stream_rate_hz),
            ttl_ms: ttl_ms.unwrap_or(self.inner.config.stream_ttl_ms),
            v,
            w,
        };
        params.validate()?;
        if !self.is_ready() {
            return Err(BridgeError::LinkNotReady);
        }

        let (tx, rx) = watch::channel(params);
        let mut slot = lock(&self.inner.stream);
        if let Some(old) = slot.take() {
            old.task.abort();
            info!("Stream replaced");
        }
        let task = tokio::spawn(stream_loop(self.clone(), rx));
        *slot = Some(ActiveStream { params: tx, task });
        info!(
            "Stream started: v={} w={} at {}Hz, ttl {}ms",
            params.v, params.w, params.rate_hz, params.ttl_ms
        );
        Ok(())
    }

    /// Change v/w of the running loop; rate and TTL stay.
    pub fn stream_update(&self, v: i32, w: i32) -> Result<(), BridgeError> {
        let slot = lock(&self.inner.stream);
        let active = slot.as_ref().ok_or(BridgeError::NoStream)?;
        let next = StreamParams {
            v,
            w,
            ..*active.params.borrow()
        };
        next.validate()?;
        active.params.send_replace(next);
        Ok(())
    }

    /// Halt the loop and send an explicit stop. The loop is halted even if
    /// the stop cannot be delivered.
    pub async fn stream_stop(&self) -> Result<(), BridgeError> {
        let old = lock(&self.inner.stream).take();
        match old {
            Some(active) => {
                active.task.abort();
                info!("Stream stopped");
            }
            None => debug!("Stream stop with no stream running"),
        }
        self.request("stream", &WireCommand::new(N_STOP), true)
            .await
            .map(|_| ())
    }

    pub fn is_streaming(&self) -> bool {
        lock(&self.inner.stream)
            .as_ref()
            .is_some_and(|active| !active.task.is_finished())
    }
}

async fn stream_loop(bridge: Bridge, params: watch::Receiver<StreamParams>) {
    let period = params.borrow().period_ms();
    let mut tick = interval(Duration::from_millis(u64::from(period)));
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tick.tick().await;
        let line = params.borrow().setpoint().to_line("");
        let sent = match line {
            Ok(line) => bridge.inner.link.send_line(&line).await,
            Err(e) => Err(e),
        };
        if let Err(e) = sent {
            debug!("Setpoint not sent: {}", e);
        }
    }
}
