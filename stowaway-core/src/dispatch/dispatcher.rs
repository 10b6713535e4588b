//! Dispatcher: the background worker and its state machine
//!
//! ```text
//!   submit ──► transforms ──► EventCache ──► launch worker (interval >= 0)
//!
//!   worker:  wait(interval + backoff) or wake
//!              │
//!              ▼
//!            update_state(online) ──► drain ──► build_packets
//!              │                                   │
//!              │        success: reset retries ◄───┤ send / dry-run
//!              │        failure: requeue, retry++ ◄┘
//!              ▼
//!            queue and cache empty, or interval < 0 ──► stop
//! ```

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::error::{Error, Result};

use super::connectivity::{Connectivity, ManualConnectivity};
use super::disk_cache::EventDiskCache;
use super::event_cache::EventCache;
use super::mode::DispatchMode;
use super::packet::{Packet, PacketFactory};
use super::record::Record;
use super::sender::{HttpPacketSender, PacketSender};
use super::stats::DispatchStats;

/// Cap on the backoff added to the interval, in multiples of the interval
const MAX_BACKOFF_FACTOR: u64 = 5;

/// Smallest backoff step in milliseconds, used when the interval is shorter
const BASE_BACKOFF_MS: u64 = 100;

/// A record transform; returning `None` drops the record
pub type Transform = Arc<dyn Fn(Record) -> Option<Record> + Send + Sync>;

/// Wait before the next cycle.
///
/// After the second consecutive failure the interval is extended by
/// `retry_count` steps, capped at five. A step is the interval, but never
/// less than 100 ms.
pub fn backoff_wait(interval_ms: i64, retry_count: u32) -> Duration {
    let interval = interval_ms.max(0).unsigned_abs();
    let mut wait = interval;
    if retry_count > 1 {
        let step = interval.max(BASE_BACKOFF_MS);
        let steps = u64::from(retry_count).min(MAX_BACKOFF_FACTOR);
        wait = wait.saturating_add(step.saturating_mul(steps));
    }
    Duration::from_millis(wait)
}

/// Captures packets in place of the network.
///
/// Clones share the same list, so a test can keep one and hand the other
/// to [`Dispatcher::set_dry_run_target`].
#[derive(Debug, Clone, Default)]
pub struct DryRunTarget {
    packets: Arc<Mutex<Vec<Packet>>>,
}

impl DryRunTarget {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, packet: Packet) {
        self.packets.lock().unwrap().push(packet);
    }

    /// Copy of every captured packet, in send order
    pub fn packets(&self) -> Vec<Packet> {
        self.packets.lock().unwrap().clone()
    }

    /// Total records across captured packets
    pub fn record_count(&self) -> usize {
        self.packets
            .lock()
            .unwrap()
            .iter()
            .map(Packet::record_count)
            .sum()
    }

    pub fn len(&self) -> usize {
        self.packets.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.packets.lock().unwrap().clear();
    }
}

#[derive(Default)]
struct WorkerState {
    running: bool,
    generation: u64,
    handle: Option<JoinHandle<()>>,
}

struct Inner {
    cache: EventCache,
    factory: PacketFactory,
    sender: Arc<dyn PacketSender>,
    connectivity: Arc<dyn Connectivity>,
    stats: DispatchStats,
    transforms: RwLock<Vec<Transform>>,
    dry_run: Mutex<Option<DryRunTarget>>,

    dispatch_interval: AtomicI64,
    dispatch_mode: Mutex<DispatchMode>,
    timeout_ms: AtomicU64,
    gzip: AtomicBool,
    retry_count: AtomicU32,

    worker: Mutex<WorkerState>,
    /// Wakes the worker early; closed when the dispatcher is dropped
    wake: Semaphore,
    /// Serializes dispatch cycles between the worker and blocking dispatch
    cycle_lock: tokio::sync::Mutex<()>,
}

impl Inner {
    fn dispatch_interval(&self) -> i64 {
        self.dispatch_interval.load(Ordering::SeqCst)
    }

    fn dispatch_mode(&self) -> DispatchMode {
        *self.dispatch_mode.lock().unwrap()
    }

    fn is_online(&self) -> bool {
        self.dispatch_mode().permits(self.connectivity.as_ref())
    }

    fn dry_run_target(&self) -> Option<DryRunTarget> {
        self.dry_run.lock().unwrap().clone()
    }

    fn wake(&self) {
        if self.wake.available_permits() == 0 {
            self.wake.add_permits(1);
        }
    }

    fn apply_transforms(&self, record: Record) -> Option<Record> {
        let transforms = self.transforms.read().unwrap();
        transforms
            .iter()
            .try_fold(record, |record, transform| transform(record))
    }

    /// One pass: reconcile, drain, send. Returns records delivered.
    ///
    /// Caller holds `cycle_lock`.
    async fn dispatch_cycle(&self) -> usize {
        if !self.cache.update_state(self.is_online()) {
            return 0;
        }

        let drained = self.cache.drain();
        let packets = self.factory.build_packets(&drained);
        tracing::debug!(
            records = drained.len(),
            packets = packets.len(),
            "Dispatching"
        );

        let dry_run = self.dry_run_target();
        let mut delivered = 0;
        let mut requeue_from = None;

        for (index, packet) in packets.iter().enumerate() {
            let success = match &dry_run {
                Some(target) => {
                    target.push(packet.clone());
                    true
                }
                None => match self.sender.send(packet).await {
                    Ok(()) => true,
                    Err(e) => {
                        tracing::warn!(error = %e, "Packet delivery failed");
                        false
                    }
                },
            };

            if !success {
                let retry_count = self.retry_count.fetch_add(1, Ordering::SeqCst) + 1;
                self.stats.inc_packet_failures();
                tracing::debug!(retry_count, "Dispatch failed, will retry");
                requeue_from = Some(packet.offset());
                break;
            }

            delivered += packet.record_count();
            self.retry_count.store(0, Ordering::SeqCst);
            self.stats.record_delivery(packet.record_count());

            if !self.is_online() {
                tracing::debug!("Went offline during dispatch");
                requeue_from = packets.get(index + 1).map(Packet::offset);
                break;
            }
        }

        if let Some(from) = requeue_from {
            tracing::debug!(
                records = drained.len() - from,
                "Requeueing unsent records"
            );
            self.cache.requeue(drained.into_iter().skip(from));
            self.cache.update_state(self.is_online());
        }

        tracing::debug!(records = delivered, "Dispatch cycle finished");
        delivered
    }

    async fn dispatch_pending(&self) -> usize {
        let _cycle = self.cycle_lock.lock().await;
        self.dispatch_cycle().await
    }

    /// Atomically stop the worker if there is nothing left for it to do
    fn finish_if_idle(&self, generation: u64) -> bool {
        if self.wake.is_closed() {
            // The dispatcher is gone; keep what the last cycle requeued.
            self.cache.update_state(false);
            return true;
        }
        let mut worker = self.worker.lock().unwrap();
        if worker.generation != generation {
            return true;
        }
        if self.dispatch_interval() < 0 || self.cache.is_empty() {
            worker.running = false;
            worker.handle = None;
            return true;
        }
        false
    }
}

/// Resets the running flag when the worker exits, including by panic
struct RunningGuard {
    inner: Arc<Inner>,
    generation: u64,
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        let mut worker = self
            .inner
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if worker.generation == self.generation && worker.running {
            if std::thread::panicking() {
                tracing::error!(generation = self.generation, "Dispatch worker panicked");
            }
            worker.running = false;
            worker.handle = None;
        }
    }
}

async fn run_worker(inner: Arc<Inner>, generation: u64) {
    let _guard = RunningGuard {
        inner: Arc::clone(&inner),
        generation,
    };
    tracing::debug!(generation, "Dispatch worker started");

    loop {
        let wait = backoff_wait(
            inner.dispatch_interval(),
            inner.retry_count.load(Ordering::SeqCst),
        );
        match tokio::time::timeout(wait, inner.wake.acquire()).await {
            Ok(Ok(permit)) => permit.forget(),
            Ok(Err(_)) => {
                tracing::debug!(generation, "Dispatcher closed, worker exiting");
                inner.cache.update_state(false);
                return;
            }
            Err(_) => {}
        }

        let _cycle = inner.cycle_lock.lock().await;
        inner.dispatch_cycle().await;

        if inner.finish_if_idle(generation) {
            tracing::debug!(generation, "Dispatch worker idle, stopping");
            return;
        }
    }
}

/// Builder for [`Dispatcher`]
pub struct DispatcherBuilder {
    config: Config,
    connectivity: Option<Arc<dyn Connectivity>>,
    sender: Option<Arc<dyn PacketSender>>,
    runtime: Option<Handle>,
}

impl DispatcherBuilder {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            connectivity: None,
            sender: None,
            runtime: None,
        }
    }

    /// Reachability source (default: always connected over wifi)
    pub fn connectivity(mut self, connectivity: Arc<dyn Connectivity>) -> Self {
        self.connectivity = Some(connectivity);
        self
    }

    /// Transport (default: [`HttpPacketSender`])
    pub fn sender(mut self, sender: Arc<dyn PacketSender>) -> Self {
        self.sender = Some(sender);
        self
    }

    /// Runtime the worker is spawned on (default: the current runtime)
    pub fn runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }

    /// Validate the config, open the offline cache and create the dispatcher
    pub fn build(self) -> Result<Dispatcher> {
        let dispatch = &self.config.dispatch;
        dispatch.validate()?;
        let endpoint = dispatch.endpoint_url()?;

        let runtime = match self.runtime {
            Some(runtime) => runtime,
            None => Handle::try_current().map_err(|_| {
                Error::Config(
                    "no tokio runtime available; build inside a runtime or pass one with DispatcherBuilder::runtime"
                        .to_string(),
                )
            })?,
        };

        let sender: Arc<dyn PacketSender> = match self.sender {
            Some(sender) => {
                sender.set_timeout(dispatch.timeout());
                sender.set_gzip(dispatch.gzip);
                sender
            }
            None => Arc::new(HttpPacketSender::new(dispatch.timeout(), dispatch.gzip)?),
        };
        let connectivity = self
            .connectivity
            .unwrap_or_else(|| Arc::new(ManualConnectivity::default()));

        let disk = EventDiskCache::for_endpoint(&self.config.cache, &endpoint);
        tracing::info!(
            endpoint = %endpoint,
            cache_dir = %disk.dir().display(),
            interval_ms = dispatch.interval_ms,
            mode = %dispatch.mode,
            "Dispatcher created"
        );

        let inner = Inner {
            cache: EventCache::new(disk),
            factory: PacketFactory::new(endpoint.to_string(), dispatch.auth_token.clone()),
            sender,
            connectivity,
            stats: DispatchStats::new(),
            transforms: RwLock::new(Vec::new()),
            dry_run: Mutex::new(None),
            dispatch_interval: AtomicI64::new(dispatch.interval_ms),
            dispatch_mode: Mutex::new(dispatch.mode),
            timeout_ms: AtomicU64::new(dispatch.timeout_ms),
            gzip: AtomicBool::new(dispatch.gzip),
            retry_count: AtomicU32::new(0),
            worker: Mutex::new(WorkerState::default()),
            wake: Semaphore::new(0),
            cycle_lock: tokio::sync::Mutex::new(()),
        };

        let dispatcher = Dispatcher {
            inner: Arc::new(inner),
            runtime,
        };

        // Resume delivery of records cached by a previous process.
        if dispatcher.dispatch_interval() >= 0 && !dispatcher.inner.cache.is_empty() {
            tracing::info!(
                containers = dispatcher.inner.cache.disk().container_count(),
                "Found cached records, starting worker"
            );
            dispatcher.launch();
        }

        Ok(dispatcher)
    }
}

/// Store-and-forward dispatcher for one collector endpoint.
///
/// All methods can be called from any thread. The background worker runs on
/// the tokio runtime captured at build time and stops when there is nothing
/// left to send.
pub struct Dispatcher {
    inner: Arc<Inner>,
    runtime: Handle,
}

impl Dispatcher {
    /// Create a dispatcher with default connectivity and transport
    pub fn new(config: Config) -> Result<Self> {
        Self::builder(config).build()
    }

    pub fn builder(config: Config) -> DispatcherBuilder {
        DispatcherBuilder::new(config)
    }

    /// Queue a record for delivery. Never blocks on the network.
    pub fn submit(&self, record: impl Into<Record>) {
        let Some(record) = self.inner.apply_transforms(record.into()) else {
            self.inner.stats.inc_records_dropped();
            tracing::trace!("Record dropped by transform");
            return;
        };

        self.inner.cache.add(record);
        if self.dispatch_interval() >= 0 {
            self.launch();
        }
    }

    /// Register a transform; transforms run in registration order on submit
    pub fn add_transform<F>(&self, transform: F)
    where
        F: Fn(Record) -> Option<Record> + Send + Sync + 'static,
    {
        self.inner
            .transforms
            .write()
            .unwrap()
            .push(Arc::new(transform));
    }

    /// Run a dispatch cycle now.
    ///
    /// Returns `true` if this started the worker. Otherwise the running
    /// worker's retry backoff is reset and its wait cut short.
    pub fn force_dispatch(&self) -> bool {
        if self.launch() {
            self.inner.wake();
            return true;
        }
        self.inner.retry_count.store(0, Ordering::SeqCst);
        self.inner.wake();
        false
    }

    /// Deliver everything pending on the calling thread.
    ///
    /// Does not start the worker; waits for an in-flight worker cycle first.
    /// Must not be called from a current-thread runtime. Returns the number
    /// of records delivered.
    pub fn force_dispatch_blocking(&self) -> Result<usize> {
        let pending = self.inner.dispatch_pending();
        match Handle::try_current() {
            Ok(current) => match current.runtime_flavor() {
                RuntimeFlavor::CurrentThread => Err(Error::Runtime(
                    "blocking dispatch is not supported on a current-thread runtime; use dispatch_pending().await"
                        .to_string(),
                )),
                _ => Ok(tokio::task::block_in_place(|| self.runtime.block_on(pending))),
            },
            Err(_) => Ok(self.runtime.block_on(pending)),
        }
    }

    /// Async counterpart of [`Dispatcher::force_dispatch_blocking`]
    pub async fn dispatch_pending(&self) -> usize {
        self.inner.dispatch_pending().await
    }

    /// Discard all queued and cached records
    pub fn clear(&self) {
        self.inner.cache.clear();
        tracing::debug!("Cleared queued and cached records");
        if self.is_worker_running() {
            self.inner.wake();
        }
    }

    /// Interval between cycles in milliseconds; negative means manual only
    pub fn dispatch_interval(&self) -> i64 {
        self.inner.dispatch_interval()
    }

    /// A non-negative interval starts the worker if records are pending
    pub fn set_dispatch_interval(&self, interval_ms: i64) {
        self.inner
            .dispatch_interval
            .store(interval_ms, Ordering::SeqCst);
        if interval_ms >= 0 && !self.inner.cache.is_empty() {
            self.launch();
        }
    }

    pub fn dispatch_mode(&self) -> DispatchMode {
        self.inner.dispatch_mode()
    }

    pub fn set_dispatch_mode(&self, mode: DispatchMode) {
        *self.inner.dispatch_mode.lock().unwrap() = mode;
        tracing::debug!(%mode, "Dispatch mode changed");
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.inner.timeout_ms.load(Ordering::SeqCst))
    }

    pub fn set_connection_timeout(&self, timeout: Duration) {
        let millis = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self.inner.timeout_ms.store(millis, Ordering::SeqCst);
        self.inner.sender.set_timeout(timeout);
    }

    pub fn dispatch_gzipped(&self) -> bool {
        self.inner.gzip.load(Ordering::SeqCst)
    }

    pub fn set_dispatch_gzipped(&self, gzip: bool) {
        self.inner.gzip.store(gzip, Ordering::SeqCst);
        self.inner.sender.set_gzip(gzip);
    }

    /// Capture packets instead of sending them; `None` restores sending
    pub fn set_dry_run_target(&self, target: Option<DryRunTarget>) {
        *self.inner.dry_run.lock().unwrap() = target;
    }

    pub fn dry_run_target(&self) -> Option<DryRunTarget> {
        self.inner.dry_run_target()
    }

    /// Consecutive failed cycles since the last successful packet
    pub fn retry_count(&self) -> u32 {
        self.inner.retry_count.load(Ordering::SeqCst)
    }

    pub fn is_worker_running(&self) -> bool {
        self.inner.worker.lock().unwrap().running
    }

    /// Whether the device is online under the current mode
    pub fn is_online(&self) -> bool {
        self.inner.is_online()
    }

    pub fn cache(&self) -> &EventCache {
        &self.inner.cache
    }

    pub fn stats(&self) -> &DispatchStats {
        &self.inner.stats
    }

    pub fn endpoint(&self) -> &str {
        self.inner.factory.endpoint()
    }

    /// Start the worker unless one is running. Returns whether it started.
    fn launch(&self) -> bool {
        if self.inner.wake.is_closed() {
            return false;
        }

        let mut worker = self.inner.worker.lock().unwrap();
        if worker.running {
            return false;
        }

        // Discard wakeups left over from a previous worker.
        while let Ok(permit) = self.inner.wake.try_acquire() {
            permit.forget();
        }

        worker.running = true;
        worker.generation += 1;
        let generation = worker.generation;
        worker.handle = Some(
            self.runtime
                .spawn(run_worker(Arc::clone(&self.inner), generation)),
        );
        true
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.inner.wake.close();
        // Keep unsent records for the next process.
        self.inner.cache.update_state(false);
        tracing::debug!("Dispatcher dropped");
    }
}
