// In-process simulated device
//
// Runs the firmware core against simulated pins and sensors on a tokio task,
// behind the same byte channels a serial port would use. Used by `--simulate`
// and by the bridge tests.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior, interval};
use tracing::{debug, info};

use super::link::Transport;
use crate::config::TX_QUEUE_CAPACITY;
use crate::firmware::device::Device;
use crate::firmware::hal::SimPins;
use crate::firmware::motion::MotionOwner;
use crate::firmware::sensors::SimSensors;

/// What the simulated robot is doing, refreshed every loop pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimState {
    pub owner: MotionOwner,
    pub left: i16,
    pub right: i16,
    pub reset_count: u16,
}

pub enum SimCommand {
    /// Restart as the watchdog would
    Restart,
}

/// Handle for poking the simulated device from tests
#[derive(Clone)]
pub struct SimControl {
    commands: mpsc::Sender<SimCommand>,
    state: watch::Receiver<SimState>,
}

impl SimControl {
    pub async fn restart(&self) {
        let _ = self.commands.send(SimCommand::Restart).await;
    }

    pub fn state(&self) -> SimState {
        *self.state.borrow()
    }

    /// Wait until the state satisfies `f` or `limit` passes.
    pub async fn wait_for(&self, limit: Duration, f: impl Fn(&SimState) -> bool) -> bool {
        let mut rx = self.state.clone();
        tokio::time::timeout(limit, rx.wait_for(|s| f(s)))
            .await
            .is_ok_and(|r| r.is_ok())
    }
}

/// Start a simulated device; returns the bridge side of its link.
pub fn spawn_simulated() -> (Transport, SimControl) {
    let (bridge_side, device_side) = Transport::pair(64);
    let (cmd_tx, cmd_rx) = mpsc::channel(4);
    let device = Device::new(SimPins::default(), SimSensors::default(), 0);
    let (state_tx, state_rx) = watch::channel(sim_state(&device));
    tokio::spawn(run_device(device, device_side, cmd_rx, state_tx));
    info!("Simulated device started");
    (
        bridge_side,
        SimControl {
            commands: cmd_tx,
            state: state_rx,
        },
    )
}

fn sim_state(device: &Device<SimPins, SimSensors>) -> SimState {
    let outputs = device.motion().outputs();
    SimState {
        owner: device.motion().owner(),
        left: outputs.left,
        right: outputs.right,
        reset_count: device.reset_count(),
    }
}

async fn run_device(
    mut device: Device<SimPins, SimSensors>,
    mut link: Transport,
    mut commands: mpsc::Receiver<SimCommand>,
    state: watch::Sender<SimState>,
) {
    let start = Instant::now();
    let now_ms = || start.elapsed().as_millis() as u32;
    let mut tick = interval(Duration::from_millis(1));
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut out = [0u8; TX_QUEUE_CAPACITY];
    // Bytes in flight on the wire, fed as the device queue has room
    let mut backlog: VecDeque<u8> = VecDeque::new();
    let mut control_open = true;

    loop {
        tokio::select! {
            bytes = link.incoming.recv() => match bytes {
                Some(bytes) => backlog.extend(bytes),
                None => break,
            },
            cmd = commands.recv(), if control_open => match cmd {
                Some(SimCommand::Restart) => device.restart(now_ms()),
                None => control_open = false,
            },
            _ = tick.tick() => {}
        }
        let n = backlog.len().min(device.rx_free());
        if n > 0 {
            let chunk: Vec<u8> = backlog.drain(..n).collect();
            device.receive(&chunk);
        }
        device.poll(now_ms());
        let n = device.drain_output(&mut out);
        if n > 0 && link.outgoing.send(out[..n].to_vec()).await.is_err() {
            break;
        }
        state.send_if_modified(|s| {
            let next = sim_state(&device);
            let changed = *s != next;
            *s = next;
            changed
        });
    }
    debug!("Simulated device stopped");
}
