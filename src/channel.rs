use rtsc::data_policy::{DataDeliveryPolicy, DeliveryPolicy};

/// A point-in-time telemetry snapshot of one worker, as read by the master. Fields are read
/// independently from single-writer atomics: cross-field atomicity is not guaranteed and not
/// required by the sizing algorithm
#[derive(Debug, Default, Clone, Copy)]
pub struct Telemetry {
    /// Requests currently in flight
    pub active_requests: u32,
    /// Unix time of the worker's last activity report
    pub activity_time: u64,
    /// Worker load average, 0.0 to 1.0
    pub load_average: f32,
    /// Requests served since the worker start
    pub total_requests: u64,
    /// True once the worker's HTTP listener is actually serving
    pub ready: bool,
}

/// The master-side endpoint of one worker's telemetry/control transport
pub trait WorkerChannel: Send {
    /// Reads the current telemetry snapshot
    fn poll(&self) -> Telemetry;
    /// Asks the worker to stop cooperatively (SIGINT / terminate event)
    fn terminate(&self);
    /// Stops the worker by force (SIGKILL / die event)
    fn kill(&self);
}

/// The worker-side endpoint: telemetry publication. The implementation is invoked both from the
/// worker's own loop and from the HTTP server's threads
pub trait TelemetrySink: Send + Sync {
    /// Marks the worker ready: its HTTP listener is serving
    fn send_ready(&self);
    /// Publishes the number of requests in flight
    fn send_active_requests(&self, active: u32);
    /// Publishes the periodic activity report. Returns false if the master process is gone and
    /// the worker must exit
    fn send_activity(&self, now: u64, load_average: f32, total_requests: u64) -> bool;
}

/// Control events dispatched by the worker's loop
#[derive(Debug, Clone)]
pub enum ChildEvent {
    /// Periodic telemetry publication tick
    Tick,
    /// Cooperative stop: gracefully stop the HTTP server, exit when drained
    Terminate,
    /// Forced stop: exit the loop immediately
    Die,
    /// The HTTP server reported that its graceful stop has completed
    Stopped,
}

impl DataDeliveryPolicy for ChildEvent {
    fn delivery_policy(&self) -> DeliveryPolicy {
        match self {
            // a missed tick is caught up by the next one
            ChildEvent::Tick => DeliveryPolicy::Optional,
            _ => DeliveryPolicy::Always,
        }
    }
}
