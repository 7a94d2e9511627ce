use std::net::TcpListener;

use tracing::debug;

use crate::server::{Location, ServerConfig};
use crate::{Error, Result};

/// Master-side ownership of the listening sockets (duplication bind model). Every spawned worker
/// receives its own duplicated descriptor; closing the master's copy does not affect the workers.
#[derive(Default)]
pub(crate) struct Listeners {
    socks: Vec<Option<TcpListener>>,
}

impl Listeners {
    /// No master-side sockets (the reuse-port bind model: workers bind themselves)
    pub fn none() -> Self {
        Self::default()
    }
    /// Binds one listening socket per location. User-supplied sockets are adopted as-is.
    pub fn bind(config: &mut ServerConfig) -> Result<Self> {
        let mut socks = Vec::with_capacity(config.locations.len());
        for loc in &mut config.locations {
            if let Some(sock) = loc.sock.take() {
                debug!(addr = ?sock.local_addr().ok(), "adopted user-supplied socket");
                socks.push(Some(sock));
                continue;
            }
            let Some(host) = loc.host.as_deref() else {
                return Err(Error::config(
                    "neither host nor socket defined in one of the locations",
                ));
            };
            let listener = TcpListener::bind((host, loc.port))?;
            debug!(addr = ?listener.local_addr().ok(), "bound listening socket");
            socks.push(Some(listener));
        }
        Ok(Self { socks })
    }
    /// Builds a worker's server config, duplicating every master-owned descriptor
    pub fn worker_config(&self, base: &ServerConfig) -> Result<ServerConfig> {
        let mut locations = Vec::with_capacity(base.locations.len());
        for (i, loc) in base.locations.iter().enumerate() {
            let sock = match self.socks.get(i).and_then(Option::as_ref) {
                Some(listener) => Some(listener.try_clone()?),
                None => None,
            };
            locations.push(Location {
                host: loc.host.clone(),
                port: loc.port,
                reuse_port: loc.reuse_port,
                sock,
            });
        }
        Ok(ServerConfig { locations })
    }
    /// Closes every master-owned socket
    pub fn close(&mut self) {
        for sock in &mut self.socks {
            *sock = None;
        }
    }
}
