//! Adaptive allocation engine.
//!
//! A run commits memory in decelerating chunks on a single worker thread,
//! shrinking and retrying whenever the host refuses, until the refusal
//! persists down to the device-class floor. Progress is persisted after every
//! chunk so the peak survives the process being killed mid-run.

use std::mem;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use memory::{DeviceProfile, MemoryPressureThresholds, MemorySnapshot, TelemetrySampler};
use storage::{BenchmarkHistory, BenchmarkRun, ResultStore};
use tracing::{debug, info, warn};
use util::{bytes_to_gib, format_bytes, DeviceClass};

mod events;
pub mod host;
pub mod task;

pub use events::{EngineEvent, EngineEvents};
pub use host::{HeapRegion, HostMemory, SystemHeap};
pub use task::{CancellationToken, ScheduledTask};

use events::Subscribers;

const WORKER_THREAD_NAME: &str = "rambench-alloc";

/// Continuation invoked once per run with the final committed GiB.
pub type Completion = Box<dyn FnOnce(f64) + Send + 'static>;

#[derive(Debug, Clone, Copy)]
pub struct EngineConfig {
    /// Delay before every chunk attempt.
    pub pacing: Duration,
    pub device_class: DeviceClass,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            pacing: Duration::from_millis(100),
            device_class: DeviceClass::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum EnginePhase {
    Idle,
    Running,
    /// The host refused down to the floor. Allocations are still held.
    Finalized,
}

struct AllocationRecord<R> {
    region: R,
    size: u64,
}

struct RunState<R> {
    phase: EnginePhase,
    /// Bumped by every start and stop; a worker whose generation no longer
    /// matches must not touch the run.
    generation: u64,
    allocations: Vec<AllocationRecord<R>>,
    total_bytes: u64,
    completion: Option<Completion>,
    task: Option<ScheduledTask>,
}

// Lock order: state, store, host, sampler, subscribers.
struct Shared<H: HostMemory> {
    config: EngineConfig,
    profile: DeviceProfile,
    state: Mutex<RunState<H::Region>>,
    store: Mutex<ResultStore>,
    host: Mutex<H>,
    sampler: Mutex<Box<dyn TelemetrySampler + Send>>,
    subscribers: Mutex<Subscribers>,
}

fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl<H: HostMemory> Shared<H> {
    fn publish(&self, event: EngineEvent) {
        lock(&self.subscribers).publish(&event);
    }

    fn release_all(&self, state: &mut RunState<H::Region>) -> usize {
        let records = mem::take(&mut state.allocations);
        let count = records.len();
        if count > 0 {
            let mut host = lock(&self.host);
            for record in records {
                host.release(record.region);
            }
        }
        state.total_bytes = 0;
        count
    }

    fn persist_peak(&self, total_bytes: u64) {
        if let Err(err) = lock(&self.store).update_active_peak(bytes_to_gib(total_bytes)) {
            warn!(%err, "failed to persist run peak; keeping in-memory history");
        }
    }
}

/// Drives benchmark runs against a [`HostMemory`].
///
/// At most one run is active per engine. All methods may be called from any
/// thread; none of them return errors.
pub struct AllocationEngine<H: HostMemory> {
    shared: Arc<Shared<H>>,
}

impl<H: HostMemory> AllocationEngine<H> {
    /// Creates an engine, detecting the device profile from one telemetry sample.
    pub fn new<S>(config: EngineConfig, host: H, mut sampler: S, store: ResultStore) -> Self
    where
        S: TelemetrySampler + Send + 'static,
    {
        let profile = DeviceProfile::detect(config.device_class, &mut sampler);
        Self::with_profile(config, profile, host, sampler, store)
    }

    pub fn with_profile<S>(
        config: EngineConfig,
        profile: DeviceProfile,
        host: H,
        sampler: S,
        store: ResultStore,
    ) -> Self
    where
        S: TelemetrySampler + Send + 'static,
    {
        let config = EngineConfig {
            device_class: profile.class,
            ..config
        };
        Self {
            shared: Arc::new(Shared {
                config,
                profile,
                state: Mutex::new(RunState {
                    phase: EnginePhase::Idle,
                    generation: 0,
                    allocations: Vec::new(),
                    total_bytes: 0,
                    completion: None,
                    task: None,
                }),
                store: Mutex::new(store),
                host: Mutex::new(host),
                sampler: Mutex::new(Box::new(sampler)),
                subscribers: Mutex::new(Subscribers::default()),
            }),
        }
    }

    /// Starts a run. Returns `false` without side effects if one is already running.
    ///
    /// Allocations held from a previous finalized run are released first.
    pub fn start<F>(&self, on_complete: F) -> bool
    where
        F: FnOnce(f64) + Send + 'static,
    {
        let shared = &self.shared;
        let mut state = lock(&shared.state);
        if state.phase == EnginePhase::Running {
            debug!("start ignored; a run is already active");
            return false;
        }

        let released = shared.release_all(&mut state);
        if released > 0 {
            debug!(released, "released allocations from previous run");
        }
        state.generation += 1;
        state.phase = EnginePhase::Running;
        state.completion = Some(Box::new(on_complete));
        let generation = state.generation;

        let profile = &shared.profile;
        let run = BenchmarkRun::started(
            profile.os_version.clone(),
            profile.ram_tier_gb,
            profile.class,
        );
        let history_len = {
            let mut store = lock(&shared.store);
            if let Err(err) = store.append_active(run) {
                warn!(%err, "failed to persist new run; keeping in-memory history");
            }
            store.history().len()
        };
        shared.publish(EngineEvent::Started { history_len });
        info!(
            class = %profile.class,
            ram_tier_gb = profile.ram_tier_gb,
            pacing_ms = shared.config.pacing.as_millis() as u64,
            "benchmark run started"
        );

        let token = CancellationToken::new();
        let worker = Worker {
            shared: Arc::clone(shared),
            generation,
            token: token.clone(),
        };
        match ScheduledTask::spawn(WORKER_THREAD_NAME, token, move || worker.run()) {
            Ok(task) => {
                state.task = Some(task);
            }
            Err(err) => {
                warn!(%err, "could not spawn allocation worker; finalizing empty run");
                state.phase = EnginePhase::Finalized;
                shared.publish(EngineEvent::Finalized { total_bytes: 0 });
                let completion = state.completion.take();
                drop(state);
                if let Some(completion) = completion {
                    completion(0.0);
                }
            }
        }
        true
    }

    /// Releases every allocation and returns to `Idle`.
    ///
    /// A running run concludes as cancelled and its continuation receives the
    /// amount committed at the moment of the stop. History is left untouched.
    pub fn stop(&self) {
        let shared = &self.shared;
        let (completion, total_bytes) = {
            let mut state = lock(&shared.state);
            let was_running = state.phase == EnginePhase::Running;
            if let Some(task) = state.task.as_ref() {
                task.cancel();
            }
            state.generation += 1;
            let total_bytes = state.total_bytes;
            let released = shared.release_all(&mut state);
            state.phase = EnginePhase::Idle;

            let completion = if was_running {
                shared.publish(EngineEvent::Cancelled { total_bytes });
                info!(total = %format_bytes(total_bytes), released, "benchmark run cancelled");
                state.completion.take()
            } else {
                None
            };
            (completion, total_bytes)
        };

        if let Some(completion) = completion {
            completion(bytes_to_gib(total_bytes));
        }
    }

    /// Same as [`stop`](Self::stop).
    pub fn clear(&self) {
        self.stop();
    }

    /// Wipes the stored history and the cached copy.
    pub fn clear_history(&self) {
        if let Err(err) = lock(&self.shared.store).clear() {
            warn!(%err, "failed to clear stored history; in-memory history is empty");
        }
        self.shared.publish(EngineEvent::HistoryCleared);
    }

    /// Waits for the current worker, if any, to exit.
    pub fn join(&self) {
        let task = lock(&self.shared.state).task.take();
        if let Some(task) = task {
            task.join();
        }
    }

    pub fn subscribe(&self) -> EngineEvents {
        lock(&self.shared.subscribers).subscribe()
    }

    pub fn phase(&self) -> EnginePhase {
        lock(&self.shared.state).phase
    }

    pub fn total_allocated(&self) -> u64 {
        lock(&self.shared.state).total_bytes
    }

    pub fn allocation_count(&self) -> usize {
        lock(&self.shared.state).allocations.len()
    }

    /// A fresh telemetry sample.
    pub fn current_snapshot(&self) -> MemorySnapshot {
        lock(&self.shared.sampler).sample()
    }

    pub fn history(&self) -> BenchmarkHistory {
        lock(&self.shared.store).history().to_vec()
    }

    pub fn profile(&self) -> &DeviceProfile {
        &self.shared.profile
    }
}

impl<H: HostMemory> Drop for AllocationEngine<H> {
    fn drop(&mut self) {
        if let Some(task) = lock(&self.shared.state).task.as_ref() {
            task.cancel();
        }
    }
}

enum Attempt<R> {
    Committed { region: R, size: u64 },
    Exhausted,
    Cancelled,
}

struct Worker<H: HostMemory> {
    shared: Arc<Shared<H>>,
    generation: u64,
    token: CancellationToken,
}

impl<H: HostMemory> Worker<H> {
    fn run(self) {
        let class = self.shared.config.device_class;
        // The tier stamped into the run record; a degraded sample must not move it.
        let ram_tier_gb = self.shared.profile.ram_tier_gb;
        let thresholds = MemoryPressureThresholds::default();
        // After a successful retry, later steps stay at the smaller scale.
        let mut scale_cap: Option<u64> = None;

        loop {
            if self.token.wait_timeout(self.shared.config.pacing) {
                return;
            }
            let Some(total_bytes) = self.current_total() else {
                return;
            };

            let snapshot = lock(&self.shared.sampler).sample();
            let requested = policy::next_chunk_size(class, ram_tier_gb, total_bytes);
            let size = scale_cap.map_or(requested, |cap| requested.min(cap));
            debug!(
                chunk = %format_bytes(size),
                total = %format_bytes(total_bytes),
                pressure = ?snapshot.pressure(&thresholds),
                "attempting chunk"
            );

            match self.commit_with_backoff(class, size) {
                Attempt::Committed { region, size: committed } => {
                    if committed < size {
                        scale_cap = Some(committed);
                    }
                    if !self.record(region, committed, snapshot) {
                        return;
                    }
                }
                Attempt::Exhausted => {
                    self.finalize();
                    return;
                }
                Attempt::Cancelled => return,
            }
        }
    }

    /// Committed total if this worker's run is still the running one.
    fn current_total(&self) -> Option<u64> {
        let state = lock(&self.shared.state);
        (state.generation == self.generation && state.phase == EnginePhase::Running)
            .then_some(state.total_bytes)
    }

    fn commit_with_backoff(&self, class: DeviceClass, mut size: u64) -> Attempt<H::Region> {
        loop {
            if self.token.is_cancelled() || self.current_total().is_none() {
                return Attempt::Cancelled;
            }
            if let Some(region) = self.commit(size) {
                return Attempt::Committed { region, size };
            }
            debug!(chunk = %format_bytes(size), "host refused chunk");
            match policy::shrink(class, size) {
                Some(next) => size = next,
                None => return Attempt::Exhausted,
            }
        }
    }

    fn commit(&self, size: u64) -> Option<H::Region> {
        let mut host = lock(&self.shared.host);
        let mut region = host.commit(size)?;
        host.touch(&mut region);
        Some(region)
    }

    /// Adds the region to the run. If the run was stopped while the commit was
    /// in flight the region is released instead and `false` is returned.
    fn record(&self, region: H::Region, size: u64, snapshot: MemorySnapshot) -> bool {
        let shared = &self.shared;
        let mut state = lock(&shared.state);
        if state.generation != self.generation || state.phase != EnginePhase::Running {
            lock(&shared.host).release(region);
            debug!(chunk = %format_bytes(size), "discarded chunk committed after stop");
            return false;
        }

        state.allocations.push(AllocationRecord { region, size });
        state.total_bytes += size;
        let total_bytes = state.total_bytes;
        shared.persist_peak(total_bytes);
        shared.publish(EngineEvent::ChunkCommitted {
            chunk_bytes: size,
            total_bytes,
            allocations: state.allocations.len(),
            snapshot,
        });
        true
    }

    fn finalize(&self) {
        let shared = &self.shared;
        let (completion, total_bytes) = {
            let mut state = lock(&shared.state);
            if state.generation != self.generation || state.phase != EnginePhase::Running {
                return;
            }
            state.phase = EnginePhase::Finalized;
            let total_bytes = state.allocations.iter().map(|record| record.size).sum::<u64>();
            debug_assert_eq!(total_bytes, state.total_bytes);
            shared.persist_peak(total_bytes);
            shared.publish(EngineEvent::Finalized { total_bytes });
            (state.completion.take(), total_bytes)
        };

        info!(
            total = %format_bytes(total_bytes),
            peak_gb = bytes_to_gib(total_bytes),
            "benchmark run finalized"
        );
        if let Some(completion) = completion {
            completion(bytes_to_gib(total_bytes));
        }
    }
}
