use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use bma_ts::Monotonic;
use rtsc::data_policy::{DataDeliveryPolicy, DeliveryPolicy};
use rtsc::pchannel::{self, Receiver, Sender};
use rtsc::time::interval;
use tracing::{debug, error, info, warn};

use crate::channel::WorkerChannel;
use crate::child::{ChildRuntime, SpawnSeed};
use crate::config::{BindModel, Config, Sizing, WorkerModel};
use crate::server::{RequestHook, ServerConfig, ServerFactory, SpawnHook};
use crate::socket::Listeners;
use crate::worker::{next_worker_id, now_ts, Worker, WorkerId, WorkerState};
use crate::{Error, Result};

/// Supervisor lifecycle state. Monotonically non-decreasing
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd)]
pub enum State {
    /// Constructed, not running yet
    Initial,
    /// The check loop is active
    Running,
    /// Shutdown initiated, waiting for the worker set to drain
    Stopping,
    /// Shut down, the loop has been released
    Stopped,
}

/// Events dispatched by the master loop. Timer threads, the signal watcher thread, worker
/// threads and [`Handle`](crate::manager::Handle) clones are the producers; the loop is the only
/// consumer
#[derive(Debug, Clone)]
pub enum Event {
    /// Periodic sizing check
    CheckTick,
    /// Periodic check for workers stuck in terminating state
    TerminationTick,
    /// SIGCHLD arrived: reap and map dead worker processes
    #[cfg(unix)]
    Sigchld,
    /// A worker died (process reaped / thread finished)
    WorkerDeath(WorkerId),
    /// Initiate shutdown
    Stop,
    /// Replace every running worker
    RestartWorkers,
    /// Apply new sizing knobs
    Reconfigure(Sizing),
}

impl DataDeliveryPolicy for Event {
    fn delivery_policy(&self) -> DeliveryPolicy {
        match self {
            // a missed tick is caught up by the next one
            Event::CheckTick | Event::TerminationTick => DeliveryPolicy::Optional,
            _ => DeliveryPolicy::Always,
        }
    }
}

/// Result of launching one worker: the master side keeps a channel, while in the forked model
/// the freshly forked child process gets its runtime back instead and must dispatch it from the
/// top level
pub enum Spawn {
    /// We are the master: the worker is launched, here is its channel
    Parent(Box<dyn WorkerChannel>),
    /// We are a freshly forked worker process
    Child(ChildRuntime),
}

enum Spawned {
    Worker(WorkerId),
    Child(ChildRuntime),
}

/// The capability set a worker-model backend provides to the supervisor
pub trait Backend: Send {
    /// Launches a worker bound to the given id
    fn create_worker(
        &mut self,
        id: WorkerId,
        server_config: ServerConfig,
        seed: &Arc<SpawnSeed>,
    ) -> Result<Spawn>;
    /// Collects ids of workers whose death has been detected out-of-band (forked model: SIGCHLD
    /// reaping)
    fn poll_deaths(&mut self) -> Vec<WorkerId> {
        Vec::new()
    }
    /// Releases backend resources of a dead worker (threaded model: joins the thread)
    fn reclaim(&mut self, id: WorkerId) {
        let _ = id;
    }
    /// Chained from the supervisor's stop
    fn stop(&mut self) {}
    /// Chained from the supervisor's stopped
    fn stopped(&mut self) {}
}

/// The multi-processing supervisor: owns the worker set, runs the periodic check, implements the
/// sizing algorithm, enforces TTL/timeouts, handles worker death and shuts down
pub struct Supervisor {
    config: Config,
    state: State,
    workers: BTreeMap<WorkerId, Worker>,
    backend: Box<dyn Backend>,
    listeners: Listeners,
    seed: Option<Arc<SpawnSeed>>,
    factory: Option<ServerFactory>,
    on_spawn: Option<SpawnHook>,
    on_request: Option<RequestHook>,
    on_start: Option<Box<dyn FnMut() + Send>>,
    tx: Sender<Event>,
    rx: Receiver<Event>,
    last_check_time: Monotonic,
    check_active: Arc<AtomicBool>,
    timers_active: Arc<AtomicBool>,
    #[cfg(unix)]
    signals: Option<signal_hook::iterator::Handle>,
}

impl Supervisor {
    pub fn new(config: Config) -> Result<Self> {
        let (tx, rx) = pchannel::bounded(1024);
        let backend: Box<dyn Backend> = match config.worker_model {
            #[cfg(unix)]
            WorkerModel::Forked => Box::new(crate::prefork::ForkedBackend::new()),
            #[cfg(not(unix))]
            WorkerModel::Forked => {
                return Err(Error::config(
                    "the forked worker model is not supported on the current OS",
                ))
            }
            WorkerModel::Threaded => Box::new(crate::threaded::ThreadedBackend::new(tx.clone())),
        };
        Ok(Self::assemble(config, backend, tx, rx))
    }
    pub fn with_backend(config: Config, backend: Box<dyn Backend>) -> Self {
        let (tx, rx) = pchannel::bounded(1024);
        Self::assemble(config, backend, tx, rx)
    }
    fn assemble(
        config: Config,
        backend: Box<dyn Backend>,
        tx: Sender<Event>,
        rx: Receiver<Event>,
    ) -> Self {
        Self {
            config,
            state: State::Initial,
            workers: <_>::default(),
            backend,
            listeners: Listeners::none(),
            seed: None,
            factory: None,
            on_spawn: None,
            on_request: None,
            on_start: None,
            tx,
            rx,
            last_check_time: Monotonic::now(),
            check_active: Arc::new(AtomicBool::new(true)),
            timers_active: Arc::new(AtomicBool::new(true)),
            #[cfg(unix)]
            signals: None,
        }
    }
    pub fn set_server_factory(&mut self, factory: ServerFactory) {
        self.factory = Some(factory);
    }
    pub fn set_on_spawn(&mut self, hook: SpawnHook) {
        self.on_spawn = Some(hook);
    }
    pub fn set_on_request(&mut self, hook: RequestHook) {
        self.on_request = Some(hook);
    }
    pub fn set_on_start(&mut self, hook: Box<dyn FnMut() + Send>) {
        self.on_start = Some(hook);
    }
    /// A producer endpoint of the master event channel
    pub fn sender(&self) -> Sender<Event> {
        self.tx.clone()
    }
    pub fn state(&self) -> State {
        self.state
    }
    /// Runs the supervisor loop until stopped. In the forked model a freshly forked worker
    /// process leaves this function with its child runtime, after dropping every master-side
    /// resource cloned over the fork (other workers' shared regions, listener descriptors)
    pub fn run(&mut self) -> Result<Option<ChildRuntime>> {
        self.start()?;
        self.spawn_timers()?;
        self.watch_signals()?;
        while self.state != State::Stopped {
            let event = match self.rx.recv() {
                Ok(event) => event,
                Err(_) => break,
            };
            if let Some(child) = self.handle_event(event)? {
                self.workers.clear();
                self.listeners.close();
                self.check_active.store(false, Ordering::Relaxed);
                self.timers_active.store(false, Ordering::Relaxed);
                #[cfg(unix)]
                if let Some(signals) = self.signals.take() {
                    signals.close();
                }
                return Ok(Some(child));
            }
        }
        Ok(None)
    }
    /// Validates the run preconditions, binds the listening sockets and enters the running
    /// state, firing the start callback
    pub fn start(&mut self) -> Result<()> {
        if self.state != State::Initial {
            return Err(Error::AlreadyRunning);
        }
        let Some(factory) = self.factory.clone() else {
            return Err(Error::config("server_factory is required"));
        };
        self.seed = Some(Arc::new(SpawnSeed {
            factory,
            on_spawn: self.on_spawn.clone(),
            on_request: self.on_request.clone(),
            load_average_period: self.config.load_average_period,
        }));
        if self.config.bind_model == BindModel::Duplicate {
            self.listeners = Listeners::bind(&mut self.config.server)?;
        }
        self.state = State::Running;
        if let Some(on_start) = self.on_start.as_mut() {
            on_start();
        }
        Ok(())
    }
    fn spawn_timers(&self) -> Result<()> {
        let period = self.config.check_interval;
        let tx = self.tx.clone();
        let check_active = self.check_active.clone();
        // the first interval tick fires instantly, giving the zero-delay initial check
        thread::Builder::new().name("hmpm-check".into()).spawn(move || {
            for _ in interval(period) {
                if !check_active.load(Ordering::Relaxed)
                    || matches!(tx.send(Event::CheckTick), Err(rtsc::Error::ChannelClosed))
                {
                    break;
                }
            }
        })?;
        let tx = self.tx.clone();
        let timers_active = self.timers_active.clone();
        thread::Builder::new().name("hmpm-term".into()).spawn(move || {
            for _ in interval(period) {
                if !timers_active.load(Ordering::Relaxed)
                    || matches!(
                        tx.send(Event::TerminationTick),
                        Err(rtsc::Error::ChannelClosed)
                    )
                {
                    break;
                }
            }
        })?;
        Ok(())
    }
    #[cfg(unix)]
    fn watch_signals(&mut self) -> Result<()> {
        use signal_hook::consts::{SIGCHLD, SIGINT};
        let mut signals = signal_hook::iterator::Signals::new([SIGINT, SIGCHLD])?;
        self.signals = Some(signals.handle());
        let tx = self.tx.clone();
        thread::Builder::new().name("hmpm-sig".into()).spawn(move || {
            for sig in signals.forever() {
                let event = match sig {
                    SIGINT => Event::Stop,
                    SIGCHLD => Event::Sigchld,
                    _ => continue,
                };
                if tx.send(event).is_err() {
                    break;
                }
            }
        })?;
        Ok(())
    }
    #[cfg(not(unix))]
    fn watch_signals(&mut self) -> Result<()> {
        Ok(())
    }
    fn handle_event(&mut self, event: Event) -> Result<Option<ChildRuntime>> {
        match event {
            Event::CheckTick => {
                if self.state == State::Running {
                    return self.check_workers();
                }
            }
            Event::TerminationTick => self.kill_not_terminated(),
            #[cfg(unix)]
            Event::Sigchld => {
                for id in self.backend.poll_deaths() {
                    if let Some(child) = self.worker_died(id)? {
                        return Ok(Some(child));
                    }
                }
            }
            Event::WorkerDeath(id) => return self.worker_died(id),
            Event::Stop => self.stop(),
            Event::RestartWorkers => {
                if self.state == State::Running {
                    return self.restart_workers();
                }
            }
            Event::Reconfigure(sizing) => self.reconfigure(sizing),
        }
        Ok(None)
    }
    /// One check tick: fetch telemetry, kill the silent, advance restart chains, auto-restart
    /// aged-out workers, then either size up or size down, never both
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss
    )]
    pub fn check_workers(&mut self) -> Result<Option<ChildRuntime>> {
        self.fetch_state();
        self.kill_not_responding();
        self.terminate_restarted_workers();
        if let Some(child) = self.autorestart_workers()? {
            return Ok(Some(child));
        }

        let recent: u64 = self.workers.values().map(|w| w.recent_requests).sum();
        let now = Monotonic::now();
        let elapsed_ms = now
            .as_duration()
            .saturating_sub(self.last_check_time.as_duration())
            .as_millis()
            .max(1) as u64;
        self.last_check_time = now;
        let req_speed = recent as f64 * 1000.0 / elapsed_ms as f64;

        let mut total: u32 = 0;
        let mut inactive: u32 = 0;
        let mut sumload: f32 = 0.0;
        for w in self.workers.values().filter(|w| {
            matches!(w.state, WorkerState::Starting | WorkerState::Running)
        }) {
            total += 1;
            sumload += w.load_average;
            if w.active_requests == 0 {
                inactive += 1;
            }
        }
        let avgload = if total > 0 { sumload / total as f32 } else { 0.0 };
        debug!(total, inactive, load_average = avgload, req_speed, "servers");

        // first check if we have too few workers
        let max_to_spawn = self.config.max_servers.saturating_sub(total);
        let mut needed = [0_u32; 3];
        if total < self.config.min_servers {
            needed[0] = self.config.min_servers - total;
        }
        if inactive < self.config.min_spare_servers {
            needed[1] = self.config.min_spare_servers - inactive;
        }
        if self.config.max_load > 0.0 && avgload > self.config.max_load {
            needed[2] = ((sumload / self.config.max_load).ceil() as u32).saturating_sub(total);
        }
        let to_spawn = max_to_spawn.min(needed.into_iter().max().unwrap_or_default());

        if to_spawn > 0 {
            debug!(
                min_servers = needed[0],
                min_spare_servers = needed[1],
                max_load = needed[2],
                allowed = max_to_spawn,
                "needed by"
            );
            info!(count = to_spawn, "adding more servers");
            for _ in 0..to_spawn {
                match self.spawn() {
                    Ok(Spawned::Worker(_)) => {}
                    Ok(Spawned::Child(child)) => return Ok(Some(child)),
                    Err(e) => {
                        // retried on the next check tick
                        error!(error = %e, "could not spawn worker");
                        break;
                    }
                }
            }
            return Ok(None);
        }

        // now check if we have too many workers
        let mut wanted = [0_u32; 2];
        if self.config.max_spare_servers > 0 && inactive > self.config.max_spare_servers {
            wanted[0] = inactive - self.config.max_spare_servers;
        }
        if self.config.min_load > 0.0 && avgload < self.config.min_load {
            wanted[1] = total.saturating_sub((sumload / self.config.min_load) as u32);
        }
        let max_to_term = total.saturating_sub(self.config.min_servers);
        let to_term = max_to_term.min(wanted.into_iter().max().unwrap_or_default());

        if to_term > 0 {
            debug!(
                max_spare_servers = wanted[0],
                min_load = wanted[1],
                allowed = max_to_term,
                "wanted to terminate by"
            );
            info!(count = to_term, "terminating servers");
            self.terminate_workers(to_term);
        }
        Ok(None)
    }
    fn fetch_state(&mut self) {
        for w in self.workers.values_mut() {
            w.fetch_state();
        }
    }
    fn kill_not_responding(&mut self) {
        if self.config.activity_timeout.is_zero() {
            return;
        }
        let timeout = self.config.activity_timeout.as_secs();
        let now = now_ts();
        let victims: Vec<WorkerId> = self
            .workers
            .values()
            .filter(|w| {
                w.state == WorkerState::Running
                    && now.saturating_sub(w.activity_time) >= timeout
            })
            .map(|w| w.id)
            .collect();
        for id in victims {
            info!(worker = id, "master: killing not responding worker");
            if let Some(w) = self.workers.get_mut(&id) {
                w.kill();
            }
        }
    }
    /// Force-kills workers stuck in terminating state. Driven by its own periodic tick so that
    /// the sizing logic stays orthogonal to shutdown latency
    fn kill_not_terminated(&mut self) {
        if self.config.termination_timeout.is_zero() {
            return;
        }
        let timeout = self.config.termination_timeout.as_secs();
        let now = now_ts();
        let victims: Vec<WorkerId> = self
            .workers
            .values()
            .filter(|w| {
                w.state == WorkerState::Terminating
                    && now.saturating_sub(w.termination_time) >= timeout
            })
            .map(|w| w.id)
            .collect();
        for id in victims {
            info!(worker = id, "master: killing not terminated worker");
            if let Some(w) = self.workers.get_mut(&id) {
                w.kill();
            }
        }
    }
    fn terminate_restarted_workers(&mut self) {
        let now = now_ts();
        let restarting: Vec<(WorkerId, Option<WorkerId>)> = self
            .workers
            .values()
            .filter(|w| w.state == WorkerState::Restarting)
            .map(|w| (w.id, w.replaced_by))
            .collect();
        for (id, replaced_by) in restarting {
            let replacement_state = replaced_by
                .and_then(|rid| self.workers.get(&rid))
                .map(|r| r.state);
            let Some(w) = self.workers.get_mut(&id) else {
                continue;
            };
            match replacement_state {
                None => {
                    // the replacement died first, return the worker to normal state to retry
                    warn!(worker = id, "master: restarting worker died");
                    w.replaced_by = None;
                    w.state = WorkerState::Running;
                }
                Some(WorkerState::Running) => {
                    info!(worker = id, "master: restarting worker ready");
                    w.terminate(now);
                }
                Some(_) => {}
            }
        }
    }
    fn autorestart_workers(&mut self) -> Result<Option<ChildRuntime>> {
        if self.config.max_requests == 0 {
            return Ok(None);
        }
        let now = now_ts();
        let ttl = self.config.min_worker_ttl.as_secs();
        let candidates: Vec<WorkerId> = self
            .workers
            .values()
            .filter(|w| {
                w.state == WorkerState::Running
                    && w.total_requests >= self.config.max_requests
                    && w.age(now) > ttl
            })
            .map(|w| w.id)
            .collect();
        for id in candidates {
            info!(worker = id, "master: worker max requests reached, restarting...");
            let new_id = match self.spawn() {
                Ok(Spawned::Worker(new_id)) => new_id,
                Ok(Spawned::Child(child)) => return Ok(Some(child)),
                Err(e) => {
                    error!(error = %e, "could not spawn replacement worker");
                    break;
                }
            };
            if let Some(w) = self.workers.get_mut(&id) {
                w.state = WorkerState::Restarting;
                w.replaced_by = Some(new_id);
            }
        }
        Ok(None)
    }
    fn spawn(&mut self) -> Result<Spawned> {
        debug!("spawn worker");
        let seed = self
            .seed
            .clone()
            .ok_or_else(|| Error::failed("supervisor is not started"))?;
        let id = next_worker_id();
        let worker_config = self.listeners.worker_config(&self.config.server)?;
        match self.backend.create_worker(id, worker_config, &seed)? {
            Spawn::Parent(channel) => {
                self.workers.insert(id, Worker::new(id, channel));
                Ok(Spawned::Worker(id))
            }
            Spawn::Child(child) => Ok(Spawned::Child(child)),
        }
    }
    fn terminate_workers(&mut self, cnt: u32) {
        if cnt == 0 {
            return;
        }
        let now = now_ts();
        let ttl = self.config.min_worker_ttl.as_secs();
        let mut victims: Vec<(WorkerId, u64)> = self
            .workers
            .values()
            .filter(|w| w.state == WorkerState::Running && w.age(now) >= ttl)
            .map(|w| (w.id, w.total_requests))
            .collect();
        info!(
            wanted = cnt,
            allowed = victims.len(),
            "terminating servers, heaviest-served first"
        );
        victims.sort_by(|a, b| b.1.cmp(&a.1));
        for (id, _) in victims.into_iter().take(cnt as usize) {
            if let Some(w) = self.workers.get_mut(&id) {
                w.terminate(now);
            }
        }
    }
    /// Handles an out-of-band worker death notification
    pub fn worker_died(&mut self, id: WorkerId) -> Result<Option<ChildRuntime>> {
        self.backend.reclaim(id);
        let Some(worker) = self.workers.remove(&id) else {
            return Ok(None);
        };
        match worker.state {
            WorkerState::Starting => error!(worker = id, "master: starting worker died"),
            WorkerState::Running | WorkerState::Restarting => {
                error!(worker = id, "master: running worker died");
            }
            WorkerState::Terminating => info!(worker = id, "master: worker terminated"),
        }
        match self.state {
            // replenishment is fast: re-check immediately
            State::Running => return self.check_workers(),
            State::Stopping => {
                if self.workers.is_empty() {
                    info!("master: all workers terminated. server stopped.");
                    self.stopped();
                }
            }
            _ => {}
        }
        Ok(None)
    }
    /// Replaces every running worker with a freshly spawned one
    pub fn restart_workers(&mut self) -> Result<Option<ChildRuntime>> {
        let running: Vec<WorkerId> = self
            .workers
            .values()
            .filter(|w| w.state == WorkerState::Running)
            .map(|w| w.id)
            .collect();
        for id in running {
            info!(worker = id, "master: restarting worker");
            let new_id = match self.spawn() {
                Ok(Spawned::Worker(new_id)) => new_id,
                Ok(Spawned::Child(child)) => return Ok(Some(child)),
                Err(e) => {
                    error!(error = %e, "could not spawn replacement worker");
                    break;
                }
            };
            if let Some(w) = self.workers.get_mut(&id) {
                w.state = WorkerState::Restarting;
                w.replaced_by = Some(new_id);
            }
        }
        Ok(None)
    }
    /// Applies new sizing knobs. Sockets, the worker model and the check interval are unchanged;
    /// a max_servers shrink below the current worker count takes effect through ordinary sizing
    /// on the following ticks
    pub fn reconfigure(&mut self, sizing: Sizing) {
        info!("master: reconfiguring sizing");
        self.config.apply_sizing(sizing);
        if let Some(seed) = &self.seed {
            self.seed = Some(Arc::new(SpawnSeed {
                factory: seed.factory.clone(),
                on_spawn: seed.on_spawn.clone(),
                on_request: seed.on_request.clone(),
                load_average_period: self.config.load_average_period,
            }));
        }
    }
    /// Initiates shutdown: closes the listening sockets, terminates or kills every worker. No-op
    /// unless running
    pub fn stop(&mut self) {
        if self.state != State::Running {
            return;
        }
        info!("master: server is stopping...");
        self.state = State::Stopping;
        // the periodic check is cancelled, the termination timer survives to force-kill
        // stragglers
        self.check_active.store(false, Ordering::Relaxed);
        self.backend.stop();
        self.listeners.close();
        if self.workers.is_empty() {
            self.stopped();
            return;
        }
        let now = now_ts();
        let ids: Vec<WorkerId> = self.workers.keys().copied().collect();
        for id in ids {
            if let Some(w) = self.workers.get_mut(&id) {
                match w.state {
                    WorkerState::Starting => w.kill(),
                    WorkerState::Running | WorkerState::Restarting => w.terminate(now),
                    WorkerState::Terminating => {}
                }
            }
        }
    }
    fn stopped(&mut self) {
        self.timers_active.store(false, Ordering::Relaxed);
        #[cfg(unix)]
        if let Some(signals) = self.signals.take() {
            signals.close();
        }
        self.backend.stopped();
        self.state = State::Stopped;
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod test {
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use parking_lot::Mutex;

    use super::{Backend, Spawn, State, Supervisor};
    use crate::channel::{Telemetry, WorkerChannel};
    use crate::child::SpawnSeed;
    use crate::config::Config;
    use crate::server::ServerConfig;
    use crate::worker::{WorkerId, WorkerState};
    use crate::{Error, Result};

    #[derive(Default)]
    struct MockState {
        telemetry: Mutex<Telemetry>,
        terminated: AtomicU32,
        killed: AtomicU32,
    }

    impl MockState {
        fn set_telemetry<F: FnOnce(&mut Telemetry)>(&self, f: F) {
            f(&mut self.telemetry.lock());
        }
        fn terminated(&self) -> u32 {
            self.terminated.load(Ordering::Relaxed)
        }
        fn killed(&self) -> u32 {
            self.killed.load(Ordering::Relaxed)
        }
    }

    struct MockChannel(Arc<MockState>);

    impl WorkerChannel for MockChannel {
        fn poll(&self) -> Telemetry {
            *self.0.telemetry.lock()
        }
        fn terminate(&self) {
            self.0.terminated.fetch_add(1, Ordering::Relaxed);
        }
        fn kill(&self) {
            self.0.killed.fetch_add(1, Ordering::Relaxed);
        }
    }

    type MockStates = Arc<Mutex<BTreeMap<WorkerId, Arc<MockState>>>>;

    struct MockBackend {
        states: MockStates,
    }

    impl Backend for MockBackend {
        fn create_worker(
            &mut self,
            id: WorkerId,
            _server_config: ServerConfig,
            _seed: &Arc<SpawnSeed>,
        ) -> Result<Spawn> {
            let state: Arc<MockState> = <_>::default();
            self.states.lock().insert(id, state.clone());
            Ok(Spawn::Parent(Box::new(MockChannel(state))))
        }
    }

    fn supervisor(config: Config) -> (Supervisor, MockStates) {
        let states: MockStates = <_>::default();
        let mut sup = Supervisor::with_backend(
            config.validated().unwrap(),
            Box::new(MockBackend {
                states: states.clone(),
            }),
        );
        // the mock backend never constructs a server
        sup.set_server_factory(Arc::new(|| Err(Error::Unimplemented)));
        (sup, states)
    }

    fn worker_ids(sup: &Supervisor) -> Vec<WorkerId> {
        sup.workers.keys().copied().collect()
    }

    #[test]
    fn test_spawn_to_min() {
        let (mut sup, _states) = supervisor(Config {
            min_servers: 2,
            ..<_>::default()
        });
        let started = Arc::new(AtomicU32::new(0));
        let started_c = started.clone();
        sup.set_on_start(Box::new(move || {
            started_c.fetch_add(1, Ordering::Relaxed);
        }));
        assert_eq!(sup.state(), State::Initial);
        sup.start().unwrap();
        assert_eq!(sup.state(), State::Running);
        assert_eq!(started.load(Ordering::Relaxed), 1);
        sup.check_workers().unwrap();
        assert_eq!(sup.workers.len(), 2);
        assert!(sup
            .workers
            .values()
            .all(|w| w.state == WorkerState::Starting));
        // second check is a no-op
        sup.check_workers().unwrap();
        assert_eq!(sup.workers.len(), 2);
        assert_eq!(started.load(Ordering::Relaxed), 1);
        // run-once semantics
        assert!(matches!(sup.start(), Err(Error::AlreadyRunning)));
    }

    #[test]
    fn test_kill_not_responding() {
        let (mut sup, states) = supervisor(Config {
            max_servers: 1,
            activity_timeout: Duration::from_secs(1),
            ..<_>::default()
        });
        sup.start().unwrap();
        sup.check_workers().unwrap();
        let id = worker_ids(&sup)[0];
        let w = sup.workers.get_mut(&id).unwrap();
        w.state = WorkerState::Running;
        w.activity_time = 0;
        sup.check_workers().unwrap();
        assert_eq!(states.lock()[&id].killed(), 1);
        // the record stays until death is reported
        assert!(sup.workers.contains_key(&id));
        assert_eq!(sup.workers[&id].state, WorkerState::Terminating);
    }

    #[test]
    fn test_autorestart() {
        let (mut sup, states) = supervisor(Config {
            max_servers: 1,
            max_requests: 1,
            min_worker_ttl: Duration::ZERO,
            ..<_>::default()
        });
        sup.start().unwrap();
        sup.check_workers().unwrap();
        let id = worker_ids(&sup)[0];
        sup.workers.get_mut(&id).unwrap().state = WorkerState::Running;
        sup.workers.get_mut(&id).unwrap().creation_time = 0;
        states.lock()[&id].set_telemetry(|t| t.total_requests = 2);
        sup.check_workers().unwrap();
        assert_eq!(sup.workers.len(), 2);
        assert_eq!(sup.workers[&id].state, WorkerState::Restarting);
        let new_id = sup.workers[&id].replaced_by.unwrap();
        assert_eq!(sup.workers[&new_id].state, WorkerState::Starting);
        // nothing happens while the replacement is still starting
        sup.check_workers().unwrap();
        assert_eq!(sup.workers.len(), 2);
        assert_eq!(states.lock()[&id].terminated(), 0);
        // the replacement becomes ready: the old worker gets terminated
        states.lock()[&new_id].set_telemetry(|t| t.ready = true);
        sup.check_workers().unwrap();
        assert_eq!(sup.workers[&new_id].state, WorkerState::Running);
        assert_eq!(states.lock()[&id].terminated(), 1);
        assert_eq!(sup.workers[&id].state, WorkerState::Terminating);
    }

    #[test]
    fn test_restarting_worker_reverts_when_replacement_dies() {
        let (mut sup, _states) = supervisor(Config {
            max_servers: 1,
            max_requests: 1,
            min_worker_ttl: Duration::ZERO,
            ..<_>::default()
        });
        sup.start().unwrap();
        sup.check_workers().unwrap();
        let id = worker_ids(&sup)[0];
        sup.workers.get_mut(&id).unwrap().state = WorkerState::Restarting;
        sup.workers.get_mut(&id).unwrap().replaced_by = Some(9999);
        sup.check_workers().unwrap();
        let w = &sup.workers[&id];
        assert_eq!(w.state, WorkerState::Running);
        assert!(w.replaced_by.is_none());
    }

    #[test]
    fn test_load_up_sizing() {
        let (mut sup, states) = supervisor(Config {
            max_servers: 5,
            max_load: 0.3,
            ..<_>::default()
        });
        sup.start().unwrap();
        sup.check_workers().unwrap();
        assert_eq!(sup.workers.len(), 1);
        let id = worker_ids(&sup)[0];
        sup.workers.get_mut(&id).unwrap().state = WorkerState::Running;
        states.lock()[&id].set_telemetry(|t| t.load_average = 1.0);
        sup.check_workers().unwrap();
        // to spawn: round_up(1/0.3) - 1 = 3
        insta::assert_snapshot!(sup.workers.len(), @"4");

        // back to min: everything running and idle, workers old enough to terminate
        for w in sup.workers.values_mut() {
            w.state = WorkerState::Running;
            w.creation_time = 0;
        }
        states.lock()[&id].set_telemetry(|t| t.load_average = 0.0);
        sup.check_workers().unwrap();
        let terminated: u32 = states.lock().values().map(|s| s.terminated()).sum();
        assert_eq!(terminated, 3);
        assert_eq!(
            sup.workers
                .values()
                .filter(|w| w.state == WorkerState::Running)
                .count(),
            1
        );
    }

    #[test]
    fn test_termination_victims_heaviest_served_first() {
        let (mut sup, states) = supervisor(Config {
            min_servers: 1,
            max_servers: 3,
            min_load: 0.5,
            max_load: 0.9,
            min_worker_ttl: Duration::ZERO,
            ..<_>::default()
        });
        sup.start().unwrap();
        sup.check_workers().unwrap();
        let id = worker_ids(&sup)[0];
        sup.workers.get_mut(&id).unwrap().state = WorkerState::Running;
        states.lock()[&id].set_telemetry(|t| t.load_average = 1.0);
        sup.check_workers().unwrap();
        assert_eq!(sup.workers.len(), 2);
        for w in sup.workers.values_mut() {
            w.state = WorkerState::Running;
            w.creation_time = 0;
        }
        let mut totals = 10_u64;
        for state in states.lock().values() {
            state.set_telemetry(|t| {
                t.load_average = 0.0;
                t.total_requests = totals;
            });
            totals += 10;
        }
        sup.check_workers().unwrap();
        // one worker terminated, and it is the one which served the most requests
        let locked = states.lock();
        let heaviest = locked
            .iter()
            .max_by_key(|(_, s)| s.telemetry.lock().total_requests)
            .map(|(id, _)| *id)
            .unwrap();
        assert_eq!(locked[&heaviest].terminated(), 1);
        let terminated: u32 = locked.values().map(|s| s.terminated()).sum();
        assert_eq!(terminated, 1);
    }

    #[test]
    fn test_no_autorestart_when_unlimited() {
        let (mut sup, states) = supervisor(Config {
            max_servers: 1,
            min_worker_ttl: Duration::ZERO,
            ..<_>::default()
        });
        sup.start().unwrap();
        sup.check_workers().unwrap();
        let id = worker_ids(&sup)[0];
        sup.workers.get_mut(&id).unwrap().state = WorkerState::Running;
        sup.workers.get_mut(&id).unwrap().creation_time = 0;
        states.lock()[&id].set_telemetry(|t| t.total_requests = 1_000_000);
        sup.check_workers().unwrap();
        assert_eq!(sup.workers.len(), 1);
        assert_eq!(sup.workers[&id].state, WorkerState::Running);
    }

    #[test]
    fn test_no_activity_kill_when_disabled() {
        let (mut sup, states) = supervisor(Config {
            max_servers: 1,
            ..<_>::default()
        });
        sup.start().unwrap();
        sup.check_workers().unwrap();
        let id = worker_ids(&sup)[0];
        sup.workers.get_mut(&id).unwrap().state = WorkerState::Running;
        sup.workers.get_mut(&id).unwrap().activity_time = 0;
        sup.check_workers().unwrap();
        assert_eq!(states.lock()[&id].killed(), 0);
    }

    #[test]
    fn test_worker_death_triggers_replenishment() {
        let (mut sup, _states) = supervisor(Config::default());
        sup.start().unwrap();
        sup.check_workers().unwrap();
        let id = worker_ids(&sup)[0];
        sup.worker_died(id).unwrap();
        assert_eq!(sup.workers.len(), 1);
        let new_id = worker_ids(&sup)[0];
        assert!(new_id > id);
    }

    #[test]
    fn test_stop_with_no_workers() {
        let (mut sup, _states) = supervisor(Config::default());
        sup.start().unwrap();
        sup.stop();
        assert_eq!(sup.state(), State::Stopped);
        // stop is idempotent
        sup.stop();
        assert_eq!(sup.state(), State::Stopped);
    }

    #[test]
    fn test_stop_drains_workers() {
        let (mut sup, states) = supervisor(Config {
            min_servers: 2,
            ..<_>::default()
        });
        sup.start().unwrap();
        sup.check_workers().unwrap();
        let ids = worker_ids(&sup);
        sup.workers.get_mut(&ids[0]).unwrap().state = WorkerState::Running;
        sup.stop();
        assert_eq!(sup.state(), State::Stopping);
        // starting workers are killed, running workers are asked to terminate
        assert_eq!(states.lock()[&ids[0]].terminated(), 1);
        assert_eq!(states.lock()[&ids[1]].killed(), 1);
        sup.worker_died(ids[0]).unwrap();
        assert_eq!(sup.state(), State::Stopping);
        sup.worker_died(ids[1]).unwrap();
        assert_eq!(sup.state(), State::Stopped);
        assert!(sup.workers.is_empty());
    }

    #[test]
    fn test_restart_workers_running_only() {
        let (mut sup, _states) = supervisor(Config {
            min_servers: 2,
            max_servers: 6,
            ..<_>::default()
        });
        sup.start().unwrap();
        sup.check_workers().unwrap();
        let ids = worker_ids(&sup);
        sup.workers.get_mut(&ids[0]).unwrap().state = WorkerState::Running;
        sup.restart_workers().unwrap();
        // one replacement for the running worker, the starting one is left alone
        assert_eq!(sup.workers.len(), 3);
        assert_eq!(sup.workers[&ids[0]].state, WorkerState::Restarting);
        assert_eq!(sup.workers[&ids[1]].state, WorkerState::Starting);
        assert!(sup.workers[&ids[0]].replaced_by.is_some());
    }

    #[test]
    fn test_reconfigure_is_idempotent() {
        let (mut sup, _states) = supervisor(Config {
            min_servers: 2,
            ..<_>::default()
        });
        sup.start().unwrap();
        let sizing = Config {
            min_servers: 3,
            ..<_>::default()
        }
        .validated()
        .unwrap()
        .sizing();
        sup.reconfigure(sizing.clone());
        sup.check_workers().unwrap();
        assert_eq!(sup.workers.len(), 3);
        sup.reconfigure(sizing);
        sup.check_workers().unwrap();
        assert_eq!(sup.workers.len(), 3);
    }

    #[test]
    fn test_min_equals_max_keeps_pool_constant() {
        let (mut sup, states) = supervisor(Config {
            min_servers: 2,
            max_servers: 2,
            min_worker_ttl: Duration::ZERO,
            max_load: 0.5,
            ..<_>::default()
        });
        sup.start().unwrap();
        sup.check_workers().unwrap();
        assert_eq!(sup.workers.len(), 2);
        for w in sup.workers.values_mut() {
            w.state = WorkerState::Running;
            w.creation_time = 0;
        }
        for state in states.lock().values() {
            state.set_telemetry(|t| t.load_average = 1.0);
        }
        // overloaded, but max_servers caps the pool
        sup.check_workers().unwrap();
        assert_eq!(sup.workers.len(), 2);
        for state in states.lock().values() {
            state.set_telemetry(|t| t.load_average = 0.0);
        }
        // idle, but min_servers floors the pool
        sup.check_workers().unwrap();
        let terminated: u32 = states.lock().values().map(|s| s.terminated()).sum();
        assert_eq!(terminated, 0);
    }

    #[test]
    fn test_min_ttl_protects_fresh_workers() {
        let (mut sup, states) = supervisor(Config {
            min_servers: 1,
            max_servers: 3,
            min_load: 0.5,
            max_load: 0.9,
            min_worker_ttl: Duration::from_secs(3600),
            ..<_>::default()
        });
        sup.start().unwrap();
        sup.check_workers().unwrap();
        let id = worker_ids(&sup)[0];
        sup.workers.get_mut(&id).unwrap().state = WorkerState::Running;
        states.lock()[&id].set_telemetry(|t| t.load_average = 1.0);
        sup.check_workers().unwrap();
        assert_eq!(sup.workers.len(), 2);
        for w in sup.workers.values_mut() {
            w.state = WorkerState::Running;
        }
        states.lock()[&id].set_telemetry(|t| t.load_average = 0.0);
        // all workers are younger than the TTL: nothing may be terminated
        sup.check_workers().unwrap();
        let terminated: u32 = states.lock().values().map(|s| s.terminated()).sum();
        assert_eq!(terminated, 0);
    }
}
