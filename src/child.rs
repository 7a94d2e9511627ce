use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use rtsc::pchannel::{Receiver, Sender};
use rtsc::time::interval;
use tracing::{debug, info, warn};

use crate::channel::{ChildEvent, TelemetrySink};
use crate::load::LoadTracker;
use crate::server::{HttpServer, RequestHook, ServerConfig, ServerFactory, ServerHooks, SpawnHook};
use crate::worker::{now_ts, WorkerId};
use crate::Result;

/// Everything needed to bring up the runtime inside a new worker
pub(crate) struct SpawnSeed {
    pub factory: ServerFactory,
    pub on_spawn: Option<SpawnHook>,
    pub on_request: Option<RequestHook>,
    pub load_average_period: Duration,
}

#[derive(Default)]
struct ReqCounters {
    active: AtomicU32,
    total: AtomicU64,
    recent: AtomicU64,
}

/// The in-worker runtime: drives the host-supplied HTTP server, samples the load average,
/// publishes telemetry at 1 Hz and honors terminate/die control events
pub struct ChildRuntime {
    id: WorkerId,
    server: Box<dyn HttpServer>,
    sink: Arc<dyn TelemetrySink>,
    counters: Arc<ReqCounters>,
    load: Arc<LoadTracker>,
    tx: Sender<ChildEvent>,
    rx: Receiver<ChildEvent>,
    terminating: bool,
}

impl ChildRuntime {
    pub(crate) fn new(
        id: WorkerId,
        server_config: ServerConfig,
        seed: &SpawnSeed,
        sink: Arc<dyn TelemetrySink>,
        tx: Sender<ChildEvent>,
        rx: Receiver<ChildEvent>,
    ) -> Result<Self> {
        debug!(worker = id, "worker: creating server");
        let mut server = (seed.factory)()?;
        server.configure(server_config)?;
        let counters: Arc<ReqCounters> = <_>::default();
        let load = Arc::new(LoadTracker::new(seed.load_average_period));
        server.set_hooks(Self::hooks(&counters, &load, &sink, seed.on_request.clone(), &tx));
        if let Some(on_spawn) = &seed.on_spawn {
            on_spawn(server.as_mut());
        }
        Ok(Self {
            id,
            server,
            sink,
            counters,
            load,
            tx,
            rx,
            terminating: false,
        })
    }
    fn hooks(
        counters: &Arc<ReqCounters>,
        load: &Arc<LoadTracker>,
        sink: &Arc<dyn TelemetrySink>,
        on_request: Option<RequestHook>,
        tx: &Sender<ChildEvent>,
    ) -> ServerHooks {
        let started = {
            let counters = counters.clone();
            let load = load.clone();
            let sink = sink.clone();
            move |req: &mut dyn crate::server::Request| {
                counters.total.fetch_add(1, Ordering::Relaxed);
                counters.recent.fetch_add(1, Ordering::Relaxed);
                let active = counters.active.fetch_add(1, Ordering::Relaxed) + 1;
                if active == 1 {
                    load.busy_start();
                }
                sink.send_active_requests(active);
                if let Some(on_request) = &on_request {
                    on_request(req);
                }
            }
        };
        let finished = {
            let counters = counters.clone();
            let load = load.clone();
            let sink = sink.clone();
            move || {
                let active = counters
                    .active
                    .fetch_sub(1, Ordering::Relaxed)
                    .saturating_sub(1);
                if active == 0 {
                    load.busy_end();
                }
                sink.send_active_requests(active);
            }
        };
        let stopped = {
            let tx = tx.clone();
            move || {
                let _r = tx.send(ChildEvent::Stopped);
            }
        };
        ServerHooks {
            request_started: Arc::new(started),
            request_finished: Arc::new(finished),
            stopped: Arc::new(stopped),
        }
    }
    /// A sender for posting control events into this worker's loop
    pub(crate) fn control_sender(&self) -> Sender<ChildEvent> {
        self.tx.clone()
    }
    /// Starts the server, reports readiness and dispatches control events until the worker is
    /// stopped. Telemetry is published every second
    pub fn run(mut self) -> Result<()> {
        info!(worker = self.id, "worker: running");
        self.server.run()?;
        self.sink.send_activity(now_ts(), 0.0, 0);
        self.sink.send_ready();
        let tick_tx = self.tx.clone();
        thread::Builder::new()
            .name(format!("hmpm-la-{}", self.id))
            .spawn(move || {
                for _ in interval(Duration::from_secs(1)) {
                    if let Err(rtsc::Error::ChannelClosed) = tick_tx.send(ChildEvent::Tick) {
                        break;
                    }
                }
            })?;
        while let Ok(event) = self.rx.recv() {
            match event {
                ChildEvent::Tick => {
                    if !self.publish() {
                        warn!(worker = self.id, "worker: master process died, exiting...");
                        break;
                    }
                }
                ChildEvent::Terminate => self.terminate(),
                ChildEvent::Die => break,
                ChildEvent::Stopped => {
                    debug!(worker = self.id, "worker: server stopped. unblocking loop...");
                    break;
                }
            }
        }
        info!(
            worker = self.id,
            total = self.counters.total.load(Ordering::Relaxed),
            "worker: end running"
        );
        Ok(())
    }
    /// Publishes the periodic activity report. Returns false if the master process is gone
    fn publish(&self) -> bool {
        let la = self.load.value();
        let recent = self.counters.recent.swap(0, Ordering::Relaxed);
        let total = self.counters.total.load(Ordering::Relaxed);
        debug!(
            worker = self.id,
            load_average = la,
            recent,
            total,
            "worker activity"
        );
        self.sink.send_activity(now_ts(), la, total)
    }
    fn terminate(&mut self) {
        if self.terminating {
            return;
        }
        self.terminating = true;
        info!(worker = self.id, "worker: terminating...");
        self.server.graceful_stop();
    }
}
