use std::sync::Arc;

use rtsc::pchannel::Sender;

use crate::config::Config;
use crate::server::{HttpServer, Request};
use crate::supervisor::{Event, Supervisor};
use crate::Result;
#[cfg(not(unix))]
use crate::Error;

/// A cloneable control handle for a manager. Usable from any thread while
/// [`Manager::run`] blocks, including host callbacks
#[derive(Clone)]
pub struct Handle {
    tx: Sender<Event>,
}

impl Handle {
    /// Initiates shutdown. Idempotent: repeated calls and calls after the shutdown has
    /// completed have no effect
    pub fn stop(&self) -> Result<()> {
        self.tx.send(Event::Stop).map_err(Into::into)
    }
    /// Replaces every running worker with a freshly spawned one
    pub fn restart_workers(&self) -> Result<()> {
        self.tx.send(Event::RestartWorkers).map_err(Into::into)
    }
    /// Applies new sizing knobs at runtime. The configuration is validated first. Sockets, the
    /// worker model and the check interval can not be changed and are ignored. Shrinking
    /// `max_servers` below the current pool size does not preempt: the pool drains through
    /// ordinary down-sizing on the following check ticks
    pub fn reconfigure(&self, config: Config) -> Result<()> {
        let config = config.validated()?;
        self.tx
            .send(Event::Reconfigure(config.sizing()))
            .map_err(Into::into)
    }
}

/// The manager: owns the supervisor and exposes the host-facing API
///
/// ```rust,no_run
/// use httpmpm::prelude::*;
///
/// let mut config = Config::default();
/// config.server.locations.push(Location::new("127.0.0.1", 8080));
/// config.min_servers = 2;
///
/// let mut manager = Manager::new(config).unwrap();
/// # fn build_server() -> httpmpm::Result<Box<dyn HttpServer>> { unimplemented!() }
/// manager.server_factory(build_server);
/// manager.run().unwrap();
/// ```
pub struct Manager {
    supervisor: Supervisor,
}

impl Manager {
    /// Validates the configuration and installs it. Nothing is started until [`Manager::run`]
    pub fn new(config: Config) -> Result<Self> {
        let config = config.validated()?;
        Ok(Self {
            supervisor: Supervisor::new(config)?,
        })
    }
    /// Returns a control handle for this manager
    pub fn handle(&self) -> Handle {
        Handle {
            tx: self.supervisor.sender(),
        }
    }
    /// Installs the server factory, called in every worker to construct the HTTP server.
    /// Mandatory: [`Manager::run`] fails without it
    pub fn server_factory<F>(&mut self, factory: F)
    where
        F: Fn() -> Result<Box<dyn HttpServer>> + Send + Sync + 'static,
    {
        self.supervisor.set_server_factory(Arc::new(factory));
    }
    /// Installs a callback fired exactly once when the supervisor reaches the running state
    pub fn on_start<F>(&mut self, f: F)
    where
        F: FnMut() + Send + 'static,
    {
        self.supervisor.set_on_start(Box::new(f));
    }
    /// Installs a callback fired in each worker after server creation, before listening starts.
    /// In the threaded model the spawning thread is parked while the callback runs, so it may
    /// touch non-thread-safe host state
    pub fn on_spawn<F>(&mut self, f: F)
    where
        F: Fn(&mut dyn HttpServer) + Send + Sync + 'static,
    {
        self.supervisor.set_on_spawn(Arc::new(f));
    }
    /// Installs a callback forwarded into every worker's server request stream
    pub fn on_request<F>(&mut self, f: F)
    where
        F: Fn(&mut dyn Request) + Send + Sync + 'static,
    {
        self.supervisor.set_on_request(Arc::new(f));
    }
    /// Runs the supervisor loop. Blocks until stopped by [`Manager::stop`], a [`Handle`] or
    /// SIGINT. May be called once per manager; a second call fails.
    ///
    /// In the forked worker model this function never returns inside a worker process: the
    /// worker serves until terminated and exits
    pub fn run(&mut self) -> Result<()> {
        match self.supervisor.run()? {
            None => Ok(()),
            #[cfg(unix)]
            Some(child) => crate::prefork::run_child(child),
            #[cfg(not(unix))]
            Some(_) => Err(Error::Unimplemented),
        }
    }
    /// Initiates shutdown (see [`Handle::stop`])
    pub fn stop(&self) -> Result<()> {
        self.handle().stop()
    }
    /// Replaces every running worker (see [`Handle::restart_workers`])
    pub fn restart_workers(&self) -> Result<()> {
        self.handle().restart_workers()
    }
    /// Applies new sizing knobs (see [`Handle::reconfigure`])
    pub fn reconfigure(&self, config: Config) -> Result<()> {
        self.handle().reconfigure(config)
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use super::Manager;
    use crate::config::{Config, WorkerModel};
    use crate::server::{HttpServer, ServerConfig, ServerHooks};
    use crate::{Error, Result};

    struct StubServer {
        hooks: Option<ServerHooks>,
    }

    impl HttpServer for StubServer {
        fn configure(&mut self, _config: ServerConfig) -> Result<()> {
            Ok(())
        }
        fn set_hooks(&mut self, hooks: ServerHooks) {
            self.hooks = Some(hooks);
        }
        fn run(&mut self) -> Result<()> {
            Ok(())
        }
        fn graceful_stop(&mut self) {
            if let Some(hooks) = &self.hooks {
                (hooks.stopped)();
            }
        }
    }

    #[test]
    fn test_missing_factory_fails_run() {
        let mut manager = Manager::new(Config {
            worker_model: WorkerModel::Threaded,
            ..<_>::default()
        })
        .unwrap();
        assert!(matches!(manager.run(), Err(Error::Config(_))));
    }

    #[test]
    fn test_threaded_run_and_stop() {
        let mut manager = Manager::new(Config {
            worker_model: WorkerModel::Threaded,
            min_servers: 1,
            ..<_>::default()
        })
        .unwrap();
        manager.server_factory(|| Ok(Box::new(StubServer { hooks: None }) as Box<dyn HttpServer>));
        let started = Arc::new(AtomicU32::new(0));
        let started_c = started.clone();
        manager.on_start(move || {
            started_c.fetch_add(1, Ordering::Relaxed);
        });
        let handle = manager.handle();
        let runner = thread::spawn(move || manager.run());
        // let the zero-delay initial check spawn the pool
        thread::sleep(Duration::from_millis(300));
        handle.stop().unwrap();
        runner.join().unwrap().unwrap();
        assert_eq!(started.load(Ordering::Relaxed), 1);
        // the manager is gone, further control requests fail or are ignored silently
        let _r = handle.stop();
    }
}
