#![ doc = include_str!( concat!( env!( "CARGO_MANIFEST_DIR" ), "/", "README.md" ) ) ]
#![deny(missing_docs)]
use core::fmt;
use std::env;
use std::io::Write;

pub use log::LevelFilter;

/// Master/worker telemetry and control transport
pub mod channel;
/// The in-worker runtime
mod child;
/// Supervisor configuration
pub mod config;
/// Worker load average tracking
pub mod load;
/// The manager facade
pub mod manager;
/// Forked worker-model backend
#[cfg(unix)]
mod prefork;
/// The HTTP server contract the host program implements
pub mod server;
/// Per-worker shared memory region (forked model)
#[cfg(unix)]
mod shm;
/// Listening socket ownership and duplication
mod socket;
/// The supervisor core: worker map, check loop, sizing
mod supervisor;
/// Threaded worker-model backend
mod threaded;
/// Worker records and identifiers
pub mod worker;

/// The crate result type
pub type Result<T> = std::result::Result<T, Error>;

/// The crate error type
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Invalid configuration, reported at construction or reconfiguration
    #[error("invalid configuration: {0}")]
    Config(String),
    /// The manager/supervisor has already been run
    #[error("the manager can only be run once")]
    AlreadyRunning,
    /// The control channel is full and the event can not be sent
    #[error("channel full")]
    ChannelFull,
    /// The control channel is closed (all transmitters/receivers gone)
    #[error("channel closed")]
    ChannelClosed,
    /// Receive attempt failed because the channel is empty
    #[error("channel empty")]
    ChannelEmpty,
    /// Timeouts
    #[error("timed out")]
    Timeout,
    /// Standard I/O errors
    #[error("I/O error: {0}")]
    IO(#[from] std::io::Error),
    /// OS-level errors (fork, mmap, signals)
    #[cfg(unix)]
    #[error("OS error: {0}")]
    Os(#[from] nix::errno::Errno),
    /// Errors reported by the host-supplied HTTP server
    #[error("server error: {0}")]
    Server(String),
    /// Invalid data received / parameters provided
    #[error("Invalid data")]
    InvalidData(String),
    /// The requested operation is not implemented
    #[error("not implemented")]
    Unimplemented,
    /// All other errors
    #[error("operation failed: {0}")]
    Failed(String),
}

impl From<rtsc::Error> for Error {
    fn from(err: rtsc::Error) -> Self {
        match err {
            rtsc::Error::ChannelFull => Error::ChannelFull,
            rtsc::Error::ChannelSkipped => Error::ChannelFull,
            rtsc::Error::ChannelClosed => Error::ChannelClosed,
            rtsc::Error::ChannelEmpty => Error::ChannelEmpty,
            rtsc::Error::Unimplemented => Error::Unimplemented,
            rtsc::Error::Timeout => Error::Timeout,
            rtsc::Error::InvalidData(msg) => Error::InvalidData(msg),
            rtsc::Error::Failed(msg) => Error::Failed(msg),
        }
    }
}

macro_rules! impl_error {
    ($t: ty, $key: ident) => {
        impl From<$t> for Error {
            fn from(err: $t) -> Self {
                Error::$key(err.to_string())
            }
        }
    };
}

impl_error!(oneshot::RecvError, Failed);

impl Error {
    /// Creates new invalid configuration error
    pub fn config<S: fmt::Display>(msg: S) -> Self {
        Error::Config(msg.to_string())
    }
    /// Creates new server error
    pub fn server<S: fmt::Display>(msg: S) -> Self {
        Error::Server(msg.to_string())
    }
    /// Creates new function failed error
    pub fn failed<S: fmt::Display>(msg: S) -> Self {
        Error::Failed(msg.to_string())
    }
}

/// Returns true if started in production mode (as a systemd unit)
pub fn is_production() -> bool {
    env::var("INVOCATION_ID").map_or(false, |v| !v.is_empty())
}

/// Configures stdout logger with the given filter. If started in production mode, does not log
/// timestamps
pub fn configure_logger(filter: LevelFilter) {
    let mut builder = env_logger::Builder::new();
    builder.target(env_logger::Target::Stdout);
    builder.filter_level(filter);
    if is_production() {
        builder.format(|buf, record| writeln!(buf, "{} {}", record.level(), record.args()));
    }
    builder.init();
}

/// Prelude module
pub mod prelude {
    pub use crate::config::{BindModel, Config, WorkerModel};
    pub use crate::manager::{Handle, Manager};
    pub use crate::server::{HttpServer, Location, Request, ServerConfig, ServerHooks};
    pub use crate::worker::{WorkerId, WorkerState};
    pub use std::time::Duration;
}
