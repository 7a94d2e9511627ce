use std::collections::BTreeMap;
use std::process;
use std::sync::Arc;
use std::thread;

use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{fork, getppid, ForkResult, Pid};
use rtsc::pchannel::{self, Sender};
use tracing::{error, info};

use crate::channel::{ChildEvent, Telemetry, TelemetrySink, WorkerChannel};
use crate::child::{ChildRuntime, SpawnSeed};
use crate::server::ServerConfig;
use crate::shm::Shmem;
use crate::supervisor::{Backend, Spawn};
use crate::worker::WorkerId;
use crate::Result;

fn send_signal(pid: Pid, signum: Signal) {
    if let Err(e) = kill(pid, signum) {
        error!(pid = %pid, signal = ?signum, error = %e,
            "master process: could not send signal to worker");
    }
}

/// Master-side endpoint: telemetry through the shared region, control through POSIX signals
struct ForkedChannel {
    pid: Pid,
    shm: Shmem,
}

impl WorkerChannel for ForkedChannel {
    fn poll(&self) -> Telemetry {
        self.shm.read()
    }
    fn terminate(&self) {
        info!(pid = %self.pid, "master process: terminate worker");
        send_signal(self.pid, Signal::SIGINT);
    }
    fn kill(&self) {
        info!(pid = %self.pid, "master process: killing worker");
        send_signal(self.pid, Signal::SIGKILL);
    }
}

/// Worker-side endpoint: writes the shared region, probes master liveness on every activity
/// report
struct ForkedSink {
    shm: Shmem,
    master: Pid,
}

impl TelemetrySink for ForkedSink {
    fn send_ready(&self) {
        self.shm.set_ready();
    }
    fn send_active_requests(&self, active: u32) {
        self.shm.set_active_requests(active);
    }
    fn send_activity(&self, now: u64, load_average: f32, total_requests: u64) -> bool {
        if kill(self.master, None).is_err() {
            return false;
        }
        self.shm.set_activity(now, load_average, total_requests);
        true
    }
}

/// The forked worker-model backend: every worker is a separate process sharing only its
/// per-worker anonymous memory page with the master
pub struct ForkedBackend {
    pids: BTreeMap<i32, WorkerId>,
}

impl ForkedBackend {
    pub fn new() -> Self {
        Self {
            pids: <_>::default(),
        }
    }
}

impl Backend for ForkedBackend {
    fn create_worker(
        &mut self,
        id: WorkerId,
        server_config: ServerConfig,
        seed: &Arc<SpawnSeed>,
    ) -> Result<Spawn> {
        let shm = Shmem::create()?;
        match unsafe { fork() }? {
            ForkResult::Parent { child } => {
                self.pids.insert(child.as_raw(), id);
                Ok(Spawn::Parent(Box::new(ForkedChannel { pid: child, shm })))
            }
            ForkResult::Child => {
                // other workers' shared regions and the master's resources cloned over the fork
                // are dropped by the supervisor before this runtime is dispatched
                let (tx, rx) = pchannel::bounded(16);
                let sink: Arc<dyn TelemetrySink> = Arc::new(ForkedSink {
                    shm,
                    master: getppid(),
                });
                let child = ChildRuntime::new(id, server_config, seed, sink, tx, rx)?;
                Ok(Spawn::Child(child))
            }
        }
    }
    /// Reaps every terminated worker process and maps the pids back to worker ids
    fn poll_deaths(&mut self) -> Vec<WorkerId> {
        let mut dead = Vec::new();
        loop {
            match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::Exited(pid, _)) | Ok(WaitStatus::Signaled(pid, _, _)) => {
                    info!(pid = %pid, "master: worker process terminated");
                    if let Some(id) = self.pids.remove(&pid.as_raw()) {
                        dead.push(id);
                    }
                }
                Ok(WaitStatus::StillAlive) => break,
                Ok(_) => {}
                // ECHILD: nothing left to reap
                Err(_) => break,
            }
        }
        dead
    }
    fn reclaim(&mut self, id: WorkerId) {
        self.pids.retain(|_, worker_id| *worker_id != id);
    }
}

/// Runs a freshly forked worker process to completion and exits. SIGINT triggers the worker's
/// own graceful stop
pub fn run_child(child: ChildRuntime) -> ! {
    let result = watch_sigint(child.control_sender()).and_then(|()| child.run());
    match result {
        Ok(()) => {
            info!("worker process: exiting");
            process::exit(0);
        }
        Err(e) => {
            error!(error = %e, "worker process failed");
            process::exit(1);
        }
    }
}

fn watch_sigint(tx: Sender<ChildEvent>) -> Result<()> {
    let mut signals = signal_hook::iterator::Signals::new([signal_hook::consts::SIGINT])?;
    thread::Builder::new().name("hmpm-wsig".into()).spawn(move || {
        for _ in signals.forever() {
            if tx.send(ChildEvent::Terminate).is_err() {
                break;
            }
        }
    })?;
    Ok(())
}
