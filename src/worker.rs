use core::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;

use crate::channel::WorkerChannel;

/// Worker identifier: strictly positive, unique and monotonically increasing for the lifetime of
/// the process. The counter is process-wide: multiple managers share the id space
pub type WorkerId = u64;

static LAST_WORKER_ID: AtomicU64 = AtomicU64::new(0);

pub(crate) fn next_worker_id() -> WorkerId {
    LAST_WORKER_ID.fetch_add(1, Ordering::Relaxed) + 1
}

/// Current unix time in whole seconds
pub(crate) fn now_ts() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs())
}

/// Worker lifecycle state, as seen by the supervisor
#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    /// Launched, the HTTP listener is not serving yet
    Starting,
    /// Serving requests
    Running,
    /// Reached its request limit, a replacement worker is being started
    Restarting,
    /// Asked to stop, death has not been reported yet
    Terminating,
}

impl From<WorkerState> for &'static str {
    fn from(state: WorkerState) -> &'static str {
        match state {
            WorkerState::Starting => "starting",
            WorkerState::Running => "running",
            WorkerState::Restarting => "restarting",
            WorkerState::Terminating => "terminating",
        }
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s: &str = (*self).into();
        write!(f, "{}", s)
    }
}

/// The master-side view of one worker: identity, state, telemetry snapshots and restart linkage.
/// Exclusively owned by the supervisor
pub(crate) struct Worker {
    pub id: WorkerId,
    pub state: WorkerState,
    pub active_requests: u32,
    pub total_requests: u64,
    /// Requests served since the previous check tick
    pub recent_requests: u64,
    pub load_average: f32,
    /// Unix time of the last activity report. Never moved backwards by telemetry fetch
    pub activity_time: u64,
    pub creation_time: u64,
    /// Unix time of the transition into [`WorkerState::Terminating`]
    pub termination_time: u64,
    /// Set iff `state == Restarting`: the id of the replacement worker
    pub replaced_by: Option<WorkerId>,
    channel: Box<dyn WorkerChannel>,
}

impl Worker {
    pub fn new(id: WorkerId, channel: Box<dyn WorkerChannel>) -> Self {
        let now = now_ts();
        Self {
            id,
            state: WorkerState::Starting,
            active_requests: 0,
            total_requests: 0,
            recent_requests: 0,
            load_average: 0.0,
            activity_time: now,
            creation_time: now,
            termination_time: 0,
            replaced_by: None,
            channel,
        }
    }
    /// Refreshes the telemetry snapshot from the channel. A starting worker becomes running once
    /// the channel reports ready
    pub fn fetch_state(&mut self) {
        let t = self.channel.poll();
        self.active_requests = t.active_requests;
        self.load_average = t.load_average;
        if t.activity_time > self.activity_time {
            self.activity_time = t.activity_time;
        }
        self.recent_requests = t.total_requests.saturating_sub(self.total_requests);
        self.total_requests = t.total_requests;
        if self.state == WorkerState::Starting && t.ready {
            self.state = WorkerState::Running;
        }
    }
    /// Asks the worker to stop cooperatively
    pub fn terminate(&mut self, now: u64) {
        self.state = WorkerState::Terminating;
        self.termination_time = now;
        self.channel.terminate();
    }
    /// Stops the worker by force
    pub fn kill(&mut self) {
        self.state = WorkerState::Terminating;
        self.channel.kill();
    }
    pub fn age(&self, now: u64) -> u64 {
        now.saturating_sub(self.creation_time)
    }
}

#[cfg(test)]
mod test {
    use super::{next_worker_id, WorkerState};

    #[test]
    fn test_worker_ids_strictly_increase() {
        let first = next_worker_id();
        let second = next_worker_id();
        assert!(first > 0);
        assert!(second > first);
    }

    #[test]
    fn test_state_display() {
        assert_eq!(WorkerState::Restarting.to_string(), "restarting");
    }
}
