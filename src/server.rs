use std::any::Any;
use std::net::TcpListener;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::Result;

/// A single request passed through the request hooks. The manager treats requests as opaque
/// objects, the host program downcasts them to its own type.
///
/// Example: `fn as_any_mut(&mut self) -> &mut dyn Any { self }`
pub trait Request: Send {
    /// Needed for downcasting a generic request into the specific type used by the server
    /// implementation
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// A single listening location of the HTTP server
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Location {
    /// Host/address to listen at
    pub host: Option<String>,
    /// TCP port to listen at
    pub port: u16,
    /// Instructs the worker's server to bind with `SO_REUSEPORT`. Set automatically by the
    /// manager in the reuse-port bind model
    pub reuse_port: bool,
    /// An already-bound listening socket. May be supplied by the host program (ownership is
    /// transferred to the manager); in the duplication bind model the manager fills it with a
    /// per-worker duplicated descriptor
    #[serde(skip)]
    pub sock: Option<TcpListener>,
}

impl Location {
    /// Creates a new location from a host address and a port
    pub fn new<H: Into<String>>(host: H, port: u16) -> Self {
        Self {
            host: Some(host.into()),
            port,
            reuse_port: false,
            sock: None,
        }
    }
    /// Creates a new location from an already-bound listening socket
    pub fn with_socket(sock: TcpListener) -> Self {
        Self {
            host: None,
            port: 0,
            reuse_port: false,
            sock: Some(sock),
        }
    }
}

/// Configuration passed to every worker's HTTP server
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Locations the server listens at
    pub locations: Vec<Location>,
}

/// Callbacks the manager installs into the worker's HTTP server. The server MUST invoke them
/// from any thread it pleases: all of them are `Send + Sync`
pub struct ServerHooks {
    /// MUST be fired once for every accepted request, before processing starts
    pub request_started: Arc<dyn Fn(&mut dyn Request) + Send + Sync>,
    /// MUST be fired once for every request previously reported as started, after the response
    /// has been finished
    pub request_finished: Arc<dyn Fn() + Send + Sync>,
    /// MUST be fired once when a graceful stop has completed and no requests are in flight
    pub stopped: Arc<dyn Fn() + Send + Sync>,
}

/// The contract of the HTTP server the manager supervises. The server itself (parsing, routing,
/// responses) is fully owned by the host program
pub trait HttpServer: Send {
    /// Applies the location set. Called once in every worker, before [`HttpServer::run`]
    fn configure(&mut self, config: ServerConfig) -> Result<()>;
    /// Installs the manager's request/stop hooks. Called once, before [`HttpServer::run`]
    fn set_hooks(&mut self, hooks: ServerHooks);
    /// Starts accepting connections and returns. Serving continues on the server's own
    /// threads until [`HttpServer::graceful_stop`]
    fn run(&mut self) -> Result<()>;
    /// Stops accepting new connections and finishes the requests in flight. When done, the
    /// server fires the `stopped` hook
    fn graceful_stop(&mut self);
}

/// Factory constructing an HTTP server inside a worker
pub type ServerFactory = Arc<dyn Fn() -> Result<Box<dyn HttpServer>> + Send + Sync>;

/// Callback fired in each worker after server creation, before listening starts
pub type SpawnHook = Arc<dyn Fn(&mut dyn HttpServer) + Send + Sync>;

/// Callback fired for every request accepted by any worker's server
pub type RequestHook = Arc<dyn Fn(&mut dyn Request) + Send + Sync>;
