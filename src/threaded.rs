use std::collections::BTreeMap;
use std::mem;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use rtsc::pchannel::{self, Sender};
use tracing::{error, info, warn};

use crate::channel::{ChildEvent, Telemetry, TelemetrySink, WorkerChannel};
use crate::child::{ChildRuntime, SpawnSeed};
use crate::server::ServerConfig;
use crate::supervisor::{Backend, Event, Spawn};
use crate::worker::WorkerId;
use crate::Result;

/// Heap-shared per-worker telemetry, native-typed. Every field has a single writer
#[derive(Default)]
struct ThreadShared {
    active_requests: AtomicU32,
    /// Unix seconds
    activity_time: AtomicU64,
    /// f32 bit pattern
    load_average: AtomicU32,
    total_requests: AtomicU64,
    ready: AtomicBool,
}

/// Master-side endpoint: telemetry through the shared struct, control through the worker's event
/// channel (the channel is the cross-thread wakeup)
struct ThreadedChannel {
    shared: Arc<ThreadShared>,
    control: Sender<ChildEvent>,
}

impl ThreadedChannel {
    fn send_control(&self, event: ChildEvent) {
        if self.control.send(event).is_err() {
            warn!("worker control channel is closed");
        }
    }
}

impl WorkerChannel for ThreadedChannel {
    fn poll(&self) -> Telemetry {
        Telemetry {
            active_requests: self.shared.active_requests.load(Ordering::Relaxed),
            activity_time: self.shared.activity_time.load(Ordering::Relaxed),
            load_average: f32::from_bits(self.shared.load_average.load(Ordering::Relaxed)),
            total_requests: self.shared.total_requests.load(Ordering::Relaxed),
            ready: self.shared.ready.load(Ordering::Relaxed),
        }
    }
    fn terminate(&self) {
        info!("master: terminate worker thread");
        self.send_control(ChildEvent::Terminate);
    }
    fn kill(&self) {
        info!("master: stopping worker thread loop");
        self.send_control(ChildEvent::Die);
    }
}

struct ThreadedSink {
    shared: Arc<ThreadShared>,
}

impl TelemetrySink for ThreadedSink {
    fn send_ready(&self) {
        self.shared.ready.store(true, Ordering::Relaxed);
    }
    fn send_active_requests(&self, active: u32) {
        self.shared.active_requests.store(active, Ordering::Relaxed);
    }
    fn send_activity(&self, now: u64, load_average: f32, total_requests: u64) -> bool {
        self.shared
            .load_average
            .store(load_average.to_bits(), Ordering::Relaxed);
        self.shared.activity_time.store(now, Ordering::Relaxed);
        self.shared
            .total_requests
            .store(total_requests, Ordering::Relaxed);
        true
    }
}

/// The threaded worker-model backend: every worker is a thread of the master process running its
/// own dispatch loop
pub struct ThreadedBackend {
    master: Sender<Event>,
    threads: BTreeMap<WorkerId, JoinHandle<()>>,
}

impl ThreadedBackend {
    pub fn new(master: Sender<Event>) -> Self {
        Self {
            master,
            threads: <_>::default(),
        }
    }
}

impl Backend for ThreadedBackend {
    fn create_worker(
        &mut self,
        id: WorkerId,
        server_config: ServerConfig,
        seed: &Arc<SpawnSeed>,
    ) -> Result<Spawn> {
        let shared: Arc<ThreadShared> = <_>::default();
        let (control_tx, control_rx) = pchannel::bounded(16);
        let (barrier_tx, barrier_rx) = oneshot::channel::<Result<()>>();
        let worker_shared = shared.clone();
        let master = self.master.clone();
        let seed = seed.clone();
        let control = control_tx.clone();
        let handle = thread::Builder::new()
            .name(format!("hmpm-w-{}", id))
            .spawn(move || {
                let child = match ChildRuntime::new(
                    id,
                    server_config,
                    &seed,
                    Arc::new(ThreadedSink {
                        shared: worker_shared,
                    }),
                    control,
                    control_rx,
                ) {
                    Ok(child) => {
                        if barrier_tx.send(Ok(())).is_err() {
                            return;
                        }
                        child
                    }
                    Err(e) => {
                        let _r = barrier_tx.send(Err(e));
                        return;
                    }
                };
                if let Err(e) = child.run() {
                    error!(worker = id, error = %e, "worker failed");
                }
                let _r = master.send(Event::WorkerDeath(id));
            })?;
        // parked until the worker has constructed its server, so that spawn callbacks may touch
        // non-thread-safe host state
        match barrier_rx.recv()? {
            Ok(()) => {
                self.threads.insert(id, handle);
                Ok(Spawn::Parent(Box::new(ThreadedChannel {
                    shared,
                    control: control_tx,
                })))
            }
            Err(e) => {
                let _r = handle.join();
                Err(e)
            }
        }
    }
    fn reclaim(&mut self, id: WorkerId) {
        if let Some(handle) = self.threads.remove(&id) {
            if handle.join().is_err() {
                error!(worker = id, "worker thread panicked");
            }
        }
    }
    fn stopped(&mut self) {
        // normally empty by now, drain the stragglers
        for (id, handle) in mem::take(&mut self.threads) {
            warn!(worker = id, "joining leftover worker thread");
            let _r = handle.join();
        }
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use rtsc::pchannel;

    use super::ThreadedBackend;
    use crate::channel::WorkerChannel as _;
    use crate::child::SpawnSeed;
    use crate::server::{HttpServer, ServerConfig, ServerHooks};
    use crate::supervisor::{Backend, Event, Spawn};
    use crate::Result;

    /// A stub server: listens nowhere, stops instantly
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
    fn test_spawn_terminate_death() {
        let (master_tx, master_rx) = pchannel::bounded::<Event>(16);
        let mut backend = ThreadedBackend::new(master_tx);
        let spawned = Arc::new(AtomicU32::new(0));
        let spawned_c = spawned.clone();
        let seed = Arc::new(SpawnSeed {
            factory: Arc::new(|| Ok(Box::new(StubServer { hooks: None }) as Box<dyn HttpServer>)),
            on_spawn: Some(Arc::new(move |_server| {
                spawned_c.fetch_add(1, Ordering::Relaxed);
            })),
            on_request: None,
            load_average_period: Duration::from_secs(3),
        });
        let spawn = backend
            .create_worker(1, ServerConfig::default(), &seed)
            .unwrap();
        // the spawn barrier guarantees the callback has already fired
        assert_eq!(spawned.load(Ordering::Relaxed), 1);
        let Spawn::Parent(channel) = spawn else {
            panic!("threaded backend must return a parent spawn");
        };
        // the worker publishes readiness after starting its server
        let mut ready = false;
        for _ in 0..100 {
            if channel.poll().ready {
                ready = true;
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(ready);
        channel.terminate();
        let event = master_rx.recv().unwrap();
        assert!(matches!(event, Event::WorkerDeath(1)));
        backend.reclaim(1);
        assert!(backend.threads.is_empty());
    }
}
