// A complete preforked pool around a trivial single-threaded HTTP server. Run it, point a
// browser at http://127.0.0.1:8080 and watch the pool breathe with the load.

use std::io::{BufRead, BufReader, Write};
use std::net::TcpListener;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use httpmpm::prelude::*;
use httpmpm::Result;

/// A toy HTTP server fulfilling the manager's contract: accepts on the duplicated descriptor,
/// answers every request with a greeting and reports request/stop events through the hooks
struct ToyServer {
    listeners: Vec<TcpListener>,
    hooks: Option<Arc<ServerHooks>>,
}

struct ToyRequest;

impl Request for ToyRequest {
    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
}

impl HttpServer for ToyServer {
    fn configure(&mut self, mut config: ServerConfig) -> Result<()> {
        for loc in &mut config.locations {
            let listener = match loc.sock.take() {
                Some(sock) => sock,
                None => TcpListener::bind((
                    loc.host.as_deref().unwrap_or("127.0.0.1"),
                    loc.port,
                ))?,
            };
            self.listeners.push(listener);
        }
        Ok(())
    }
    fn set_hooks(&mut self, hooks: ServerHooks) {
        self.hooks = Some(Arc::new(hooks));
    }
    fn run(&mut self) -> Result<()> {
        for listener in self.listeners.drain(..) {
            let hooks = self.hooks.clone();
            thread::spawn(move || {
                for stream in listener.incoming() {
                    let Ok(mut stream) = stream else { break };
                    if let Some(hooks) = &hooks {
                        (hooks.request_started)(&mut ToyRequest);
                    }
                    let mut reader = BufReader::new(&stream);
                    let mut line = String::new();
                    let _r = reader.read_line(&mut line);
                    let body = format!("hello from worker pid {}\n", std::process::id());
                    let _r = write!(
                        stream,
                        "HTTP/1.1 200 OK\r\ncontent-length: {}\r\n\r\n{}",
                        body.len(),
                        body
                    );
                    if let Some(hooks) = &hooks {
                        (hooks.request_finished)();
                    }
                }
            });
        }
        Ok(())
    }
    fn graceful_stop(&mut self) {
        // nothing in flight for longer than a socket write: report completion at once
        if let Some(hooks) = &self.hooks {
            (hooks.stopped)();
        }
    }
}

fn main() -> Result<()> {
    httpmpm::configure_logger(httpmpm::LevelFilter::Debug);
    let mut config = Config::default();
    config.server.locations.push(Location::new("127.0.0.1", 8080));
    config.min_servers = 2;
    config.max_servers = 8;
    config.max_load = 0.7;
    config.min_worker_ttl = Duration::from_secs(10);
    config.termination_timeout = Duration::from_secs(5);

    let mut manager = Manager::new(config)?;
    manager.server_factory(|| {
        Ok(Box::new(ToyServer {
            listeners: Vec::new(),
            hooks: None,
        }) as Box<dyn HttpServer>)
    });
    manager.on_start(|| {
        tracing::info!("manager is up, press Ctrl+C to stop");
    });
    manager.run()
}
