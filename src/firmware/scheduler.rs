// Cooperative fixed-rate scheduler
//
// A small fixed table of periodic tasks. Each pass runs every task
// whose period has elapsed, in table order. A late task runs once and is
// rescheduled from now; missed periods are never replayed in a burst.

use crate::config::{CONTROL_LOOP_HZ, PROTOCOL_RX_HZ, SENSORS_SLOW_HZ};

pub const MAX_TASKS: usize = 4;

/// The periodic jobs of the device loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskId {
    ProtocolRx,
    Control,
    SensorsSlow,
}

#[derive(Debug, Clone, Copy)]
struct Task {
    id: TaskId,
    period_ms: u32,
    last_run_ms: Option<u32>,
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("Task table full ({max} tasks)", max = MAX_TASKS)]
    TableFull,

    #[error("Task rate must be between 1 and 1000 Hz")]
    BadRate,
}

#[derive(Debug, Clone)]
pub struct Scheduler {
    tasks: heapless::Vec<Task, MAX_TASKS>,
}

impl Default for Scheduler {
    /// The device's standard table: protocol receive, control loop, slow sensors
    fn default() -> Self {
        let mut scheduler = Self::empty();
        for (id, hz) in [
            (TaskId::ProtocolRx, PROTOCOL_RX_HZ),
            (TaskId::Control, CONTROL_LOOP_HZ),
            (TaskId::SensorsSlow, SENSORS_SLOW_HZ),
        ] {
            let _ = scheduler.register(id, hz);
        }
        scheduler
    }
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn empty() -> Self {
        Self {
            tasks: heapless::Vec::new(),
        }
    }

    /// Add a task running at `hz`. Tasks run in registration order.
    pub fn register(&mut self, id: TaskId, hz: u32) -> Result<(), SchedulerError> {
        if hz == 0 || hz > 1000 {
            return Err(SchedulerError::BadRate);
        }
        self.tasks
            .push(Task {
                id,
                period_ms: 1000 / hz,
                last_run_ms: None,
            })
            .map_err(|_| SchedulerError::TableFull)
    }

    /// Run one pass. `run` is called for each due task; returns how many ran.
    pub fn run_pending<F: FnMut(TaskId)>(&mut self, now_ms: u32, mut run: F) -> usize {
        let mut ran = 0;
        for task in self.tasks.iter_mut() {
            let due = match task.last_run_ms {
                None => true,
                Some(last) => now_ms.wrapping_sub(last) >= task.period_ms,
            };
            if due {
                run(task.id);
                task.last_run_ms = Some(now_ms);
                ran += 1;
            }
        }
        ran
    }

    /// Forget run history, every task becomes due immediately.
    pub fn reset(&mut self) {
        for task in self.tasks.iter_mut() {
            task.last_run_ms = None;
        }
    }

    pub fn period_ms(&self, id: TaskId) -> Option<u32> {
        self.tasks.iter().find(|t| t.id == id).map(|t| t.period_ms)
    }
}
