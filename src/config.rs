use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::server::ServerConfig;
use crate::{Error, Result};

/// Worker model: how workers are executed
#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerModel {
    /// Every worker is a separate process (Unix only)
    Forked,
    /// Every worker is a thread of the master process
    Threaded,
}

impl Default for WorkerModel {
    fn default() -> Self {
        if cfg!(unix) {
            WorkerModel::Forked
        } else {
            WorkerModel::Threaded
        }
    }
}

/// Bind model: how listening sockets are shared between workers
#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BindModel {
    /// The master binds one socket per location, workers get duplicated descriptors
    Duplicate,
    /// Every worker binds its own socket with `SO_REUSEPORT`
    ReusePort,
}

impl Default for BindModel {
    fn default() -> Self {
        BindModel::Duplicate
    }
}

const HAS_REUSEPORT: bool = cfg!(unix);

/// Manager configuration. Zero values of `max_servers`, `max_spare_servers`, `min_load` and
/// `max_load` are sentinels, replaced with derived defaults at validation
#[derive(Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Configuration passed to every worker's HTTP server
    pub server: ServerConfig,
    /// The minimum number of servers to keep running
    pub min_servers: u32,
    /// The maximum number of child servers to start \[min_servers*3\]
    pub max_servers: u32,
    /// The minimum number of servers to have waiting for requests
    pub min_spare_servers: u32,
    /// The maximum number of servers to have waiting for requests
    /// \[min_spare_servers + min_servers, if min_spare_servers\]
    pub max_spare_servers: u32,
    /// Minimum average loop load on workers {0-1} \[max_load/2 if max_load\]
    pub min_load: f32,
    /// Maximum average loop load on workers {0-1} \[0.7 if !min_spare_servers\]
    pub max_load: f32,
    /// Period to collect load average for, on workers
    pub load_average_period: Duration,
    /// Max number of requests to process per one worker \[0=unlimited\]
    pub max_requests: u64,
    /// Minimum time between starting and killing a worker
    pub min_worker_ttl: Duration,
    /// Interval between checks whether some waiting servers can be killed off or more workers
    /// need to be spawned
    pub check_interval: Duration,
    /// Kill a worker if it is not responding for this long \[zero=disable\]
    pub activity_timeout: Duration,
    /// Kill a worker if it has not terminated after this long \[zero=disable\]
    pub termination_timeout: Duration,
    /// Multi-processing model
    pub worker_model: WorkerModel,
    /// How to bind HTTP server sockets in workers
    pub bind_model: BindModel,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: <_>::default(),
            min_servers: 1,
            max_servers: 0,
            min_spare_servers: 0,
            max_spare_servers: 0,
            min_load: 0.0,
            max_load: 0.0,
            load_average_period: Duration::from_secs(3),
            max_requests: 0,
            min_worker_ttl: Duration::from_secs(60),
            check_interval: Duration::from_secs(1),
            activity_timeout: Duration::ZERO,
            termination_timeout: Duration::ZERO,
            worker_model: <_>::default(),
            bind_model: <_>::default(),
        }
    }
}

impl Config {
    /// Applies derived defaults and verifies cross-invariants. Called automatically by
    /// [`Manager::new`](crate::manager::Manager::new)
    pub fn validated(mut self) -> Result<Self> {
        if self.check_interval.is_zero() || self.load_average_period.is_zero() {
            return Err(Error::config(
                "check_interval, load_average_period must not be zero",
            ));
        }
        if self.max_servers == 0 {
            self.max_servers = self.min_servers * 3;
        }
        if self.max_spare_servers == 0 && self.min_spare_servers > 0 {
            self.max_spare_servers =
                (self.min_spare_servers + self.min_servers).min(self.max_servers);
        }
        if self.max_load == 0.0 && self.min_spare_servers == 0 {
            self.max_load = 0.7;
        }
        if self.min_load == 0.0 && self.max_load > 0.0 {
            self.min_load = self.max_load / 2.0;
        }
        if self.min_servers == 0 {
            return Err(Error::config("min_servers must be at least 1"));
        }
        if self.min_servers > self.max_servers {
            return Err(Error::config(
                "max_servers should be equal to or higher than min_servers",
            ));
        }
        if self.min_spare_servers > self.max_spare_servers {
            return Err(Error::config(
                "min_spare_servers should be lower than or equal to max_spare_servers",
            ));
        }
        if self.min_spare_servers >= self.max_servers {
            return Err(Error::config(
                "min_spare_servers should be lower than max_servers",
            ));
        }
        if self.max_spare_servers > self.max_servers {
            return Err(Error::config(
                "max_spare_servers should be equal to or lower than max_servers",
            ));
        }
        if !(0.0..=1.0).contains(&self.min_load) || !(0.0..=1.0).contains(&self.max_load) {
            return Err(Error::config("min_load, max_load must be within {0-1}"));
        }
        if self.worker_model == WorkerModel::Forked && !cfg!(unix) {
            return Err(Error::config(
                "the forked worker model is not supported on the current OS",
            ));
        }
        // any user-supplied socket is transferred for our ownership, which requires the
        // duplication model
        if self.server.locations.iter().any(|loc| loc.sock.is_some())
            && self.bind_model == BindModel::ReusePort
        {
            self.bind_model = BindModel::Duplicate;
        }
        if self.bind_model == BindModel::ReusePort && !HAS_REUSEPORT {
            warn!("reuse port is not supported on the current OS, falling back to duplicate model");
            self.bind_model = BindModel::Duplicate;
        }
        if self.bind_model == BindModel::ReusePort {
            for loc in &mut self.server.locations {
                loc.reuse_port = true;
            }
        }
        Ok(self)
    }
    pub(crate) fn sizing(&self) -> Sizing {
        Sizing {
            min_servers: self.min_servers,
            max_servers: self.max_servers,
            min_spare_servers: self.min_spare_servers,
            max_spare_servers: self.max_spare_servers,
            min_load: self.min_load,
            max_load: self.max_load,
            load_average_period: self.load_average_period,
            max_requests: self.max_requests,
            min_worker_ttl: self.min_worker_ttl,
            activity_timeout: self.activity_timeout,
            termination_timeout: self.termination_timeout,
        }
    }
    pub(crate) fn apply_sizing(&mut self, sizing: Sizing) {
        self.min_servers = sizing.min_servers;
        self.max_servers = sizing.max_servers;
        self.min_spare_servers = sizing.min_spare_servers;
        self.max_spare_servers = sizing.max_spare_servers;
        self.min_load = sizing.min_load;
        self.max_load = sizing.max_load;
        self.load_average_period = sizing.load_average_period;
        self.max_requests = sizing.max_requests;
        self.min_worker_ttl = sizing.min_worker_ttl;
        self.activity_timeout = sizing.activity_timeout;
        self.termination_timeout = sizing.termination_timeout;
    }
}

/// The runtime-reconfigurable subset of [`Config`]: sizing knobs only. Sockets, the worker model
/// and `check_interval` are set once at construction
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct Sizing {
    pub min_servers: u32,
    pub max_servers: u32,
    pub min_spare_servers: u32,
    pub max_spare_servers: u32,
    pub min_load: f32,
    pub max_load: f32,
    pub load_average_period: Duration,
    pub max_requests: u64,
    pub min_worker_ttl: Duration,
    pub activity_timeout: Duration,
    pub termination_timeout: Duration,
}
