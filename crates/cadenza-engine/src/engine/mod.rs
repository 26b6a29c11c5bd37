//! The audio engine: backend ownership, lifecycle, and the process callback.
//!
//! Two locks serialize the engine against the backend's process thread:
//!
//! * the **state lock** (reentrant) guards backend selection, lifecycle
//!   transitions and every configuration call forwarded to the backend;
//! * the **process lock** is held by the process callback for the length of
//!   a cycle. The callback only ever `try_lock`s it; control paths that must
//!   not overlap a cycle (`stop`, backend replacement) take it blocking.
//!
//! The active backend and the attached session are published through
//! `arc-swap` so the process callback reads them without locking.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;

use arc_swap::{ArcSwapOption, Guard};
use crossbeam_channel::Receiver;
use parking_lot::{Condvar, Mutex, ReentrantMutex};

use crate::backend::registry::BackendRegistry;
use crate::backend::{AudioBackend, DeviceStatus};
use crate::config::EngineConfig;
use crate::error::EngineResult;
use crate::events::{EngineEvent, EventFilter, EventHub};
use crate::hw_events::{CoalescingSignal, CoalescingWorker};
use crate::latency::LatencySession;
use crate::metrics::{CycleMetrics, CycleMetricsCollector};
use crate::ports::{NoopPortManager, PendingPortDeletions, PortManager};
use crate::session::Session;

mod control;
pub mod instance;
mod latency;
mod process;
mod threads;

pub(crate) const RESET_THREAD_NAME: &str = "cadenza-hw-reset";
pub(crate) const DEVICE_LIST_THREAD_NAME: &str = "cadenza-hw-devices";
pub(crate) const LATENCY_INPUT_PORT: &str = "latency_in";
pub(crate) const LATENCY_OUTPUT_PORT: &str = "latency_out";

/// The selected backend instance together with the name it was registered
/// under.
pub struct ActiveBackend {
    pub name: String,
    pub backend: Box<dyn AudioBackend>,
}

struct SessionSlot {
    session: Arc<dyn Session>,
}

/// Lifecycle and stream shape. Written under the state lock, read anywhere.
#[derive(Default)]
struct EngineState {
    running: AtomicBool,
    freewheeling: AtomicBool,
    processed_samples: AtomicU64,
    sample_rate: AtomicU32,
    buffer_size: AtomicU32,
}

/// Per-activation bookkeeping owned by the process callback.
#[derive(Default)]
struct CycleCounters {
    start_count: AtomicU32,
    initialised_start: AtomicU32,
    init_countdown: AtomicU32,
    monitor_interval: AtomicU64,
    last_monitor_check: AtomicU64,
    latency_updates: AtomicU8,
    /// Frames left in the current cycle after `split_cycle` calls.
    remaining: AtomicU32,
}

#[derive(Default)]
struct SilenceState {
    /// Frames the current countdown started from.
    budget: AtomicU64,
    countdown: AtomicU64,
    silent: AtomicBool,
}

#[derive(Default)]
struct SessionRemoval {
    pending: AtomicBool,
    countdown: AtomicU32,
    total: AtomicU32,
    done: AtomicBool,
    lock: Mutex<()>,
    finished: Condvar,
}

#[derive(Default)]
struct LatencyState {
    mode: AtomicU8,
    session: Mutex<Option<LatencySession>>,
    /// Mirrors of the session's progress, published by the process callback.
    status: AtomicU8,
    measured: AtomicU32,
    input_port_name: Mutex<Option<String>>,
    output_port_name: Mutex<Option<String>>,
    systemic: AtomicU32,
    started_for_latency: AtomicBool,
    stopped_for_latency: AtomicBool,
}

struct HwEvents {
    reset: Arc<CoalescingSignal>,
    device_list: Arc<CoalescingSignal>,
    workers: Mutex<Vec<CoalescingWorker>>,
}

pub struct AudioEngine {
    config: EngineConfig,
    registry: BackendRegistry,
    backend: ArcSwapOption<ActiveBackend>,
    state_lock: ReentrantMutex<()>,
    process_lock: Mutex<()>,
    state: EngineState,
    events: EventHub,
    session: ArcSwapOption<SessionSlot>,
    port_manager: Arc<dyn PortManager>,
    pending_ports: PendingPortDeletions,
    metrics: CycleMetricsCollector,
    cycle: CycleCounters,
    silence: SilenceState,
    removal: SessionRemoval,
    latency: LatencyState,
    hw: HwEvents,
    devices: Mutex<Vec<DeviceStatus>>,
    last_backend_error: Mutex<Option<String>>,
    process_threads: Mutex<Vec<JoinHandle<()>>>,
    self_ref: Weak<AudioEngine>,
}

impl AudioEngine {
    /// Builds an engine with no port manager and starts its hardware event
    /// workers.
    pub fn new(config: EngineConfig) -> EngineResult<Arc<Self>> {
        Self::with_port_manager(config, Arc::new(NoopPortManager))
    }

    pub fn with_port_manager(
        config: EngineConfig,
        port_manager: Arc<dyn PortManager>,
    ) -> EngineResult<Arc<Self>> {
        config.validate()?;
        let engine = Arc::new_cyclic(|self_ref| AudioEngine {
            registry: BackendRegistry::new(),
            backend: ArcSwapOption::const_empty(),
            state_lock: ReentrantMutex::new(()),
            process_lock: Mutex::new(()),
            state: EngineState::default(),
            events: EventHub::new(config.event_channel_capacity),
            session: ArcSwapOption::const_empty(),
            port_manager,
            pending_ports: PendingPortDeletions::new(config.pending_port_capacity),
            metrics: CycleMetricsCollector::new(config.metrics_history),
            cycle: CycleCounters::default(),
            silence: SilenceState::default(),
            removal: SessionRemoval::default(),
            latency: LatencyState::default(),
            hw: HwEvents {
                reset: Arc::new(CoalescingSignal::new()),
                device_list: Arc::new(CoalescingSignal::new()),
                workers: Mutex::new(Vec::new()),
            },
            devices: Mutex::new(Vec::new()),
            last_backend_error: Mutex::new(None),
            process_threads: Mutex::new(Vec::new()),
            self_ref: self_ref.clone(),
            config,
        });
        engine.start_hw_event_processing()?;
        Ok(engine)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Spawns the reset and device-list workers if they are not running.
    pub fn start_hw_event_processing(&self) -> EngineResult<()> {
        let mut workers = self.hw.workers.lock();
        if !workers.is_empty() {
            return Ok(());
        }

        let engine = self.self_ref.clone();
        let reset = CoalescingWorker::spawn(RESET_THREAD_NAME, Arc::clone(&self.hw.reset), move |_| {
            match engine.upgrade() {
                Some(engine) => {
                    engine.reset_pass();
                    true
                }
                None => false,
            }
        })?;
        let engine = self.self_ref.clone();
        let device_list = CoalescingWorker::spawn(
            DEVICE_LIST_THREAD_NAME,
            Arc::clone(&self.hw.device_list),
            move |_| match engine.upgrade() {
                Some(engine) => {
                    engine.device_list_pass();
                    true
                }
                None => false,
            },
        )?;
        workers.push(reset);
        workers.push(device_list);
        tracing::debug!("hardware event workers started");
        Ok(())
    }

    /// Stops and joins both hardware event workers. Requests made while they
    /// are stopped stay pending until they are started again.
    pub fn stop_hw_event_processing(&self) {
        let workers: Vec<_> = self.hw.workers.lock().drain(..).collect();
        if workers.is_empty() {
            return;
        }
        for mut worker in workers {
            worker.stop();
        }
        tracing::debug!("hardware event workers stopped");
    }

    pub fn running(&self) -> bool {
        self.state.running.load(Ordering::Acquire)
    }

    pub fn freewheeling(&self) -> bool {
        self.state.freewheeling.load(Ordering::Acquire)
    }

    pub fn processed_samples(&self) -> u64 {
        self.state.processed_samples.load(Ordering::Acquire)
    }

    pub fn sample_rate(&self) -> u32 {
        self.state.sample_rate.load(Ordering::Acquire)
    }

    pub fn samples_per_cycle(&self) -> u32 {
        self.state.buffer_size.load(Ordering::Acquire)
    }

    /// Activations since the engine was created.
    pub fn start_count(&self) -> u32 {
        self.cycle.start_count.load(Ordering::Acquire)
    }

    pub fn subscribe(&self) -> Receiver<EngineEvent> {
        self.events.subscribe()
    }

    pub fn subscribe_filtered(&self, filter: EventFilter) -> Receiver<EngineEvent> {
        self.events.subscribe_filtered(filter)
    }

    /// Notifications lost because a subscriber fell behind.
    pub fn dropped_events(&self) -> u64 {
        self.events.dropped()
    }

    pub fn cycle_metrics(&self) -> CycleMetrics {
        self.metrics.snapshot()
    }

    pub fn cycle_metrics_history(&self) -> Vec<CycleMetrics> {
        self.metrics.drain_history()
    }

    pub fn registry(&self) -> &BackendRegistry {
        &self.registry
    }

    /// Snapshot of the active backend.
    pub fn current_backend(&self) -> Option<Arc<ActiveBackend>> {
        self.backend.load_full()
    }

    pub fn current_backend_name(&self) -> Option<String> {
        self.backend.load().as_ref().map(|active| active.name.clone())
    }

    pub fn session(&self) -> Option<Arc<dyn Session>> {
        self.session
            .load()
            .as_ref()
            .map(|slot| Arc::clone(&slot.session))
    }

    pub fn last_backend_error(&self) -> Option<String> {
        self.last_backend_error.lock().clone()
    }

    fn backend_guard(&self) -> Guard<Option<Arc<ActiveBackend>>> {
        self.backend.load()
    }

    fn record_backend_error(&self, err: &anyhow::Error) {
        *self.last_backend_error.lock() = Some(format!("{err:#}"));
    }

    /// Stores a new buffer size and notifies once per actual change.
    fn apply_buffer_size(&self, frames: u32) {
        let _state = self.state_lock.lock();
        let previous = self.state.buffer_size.swap(frames, Ordering::AcqRel);
        if previous == frames {
            return;
        }
        if let Some(slot) = self.session.load().as_ref() {
            slot.session.set_block_size(frames);
        }
        tracing::debug!(frames, "buffer size changed");
        self.events.emit(EngineEvent::BufferSizeChanged(frames));
    }

    /// Stores a new sample rate and notifies once per actual change.
    fn apply_sample_rate(&self, rate: u32) {
        let _state = self.state_lock.lock();
        let previous = self.state.sample_rate.swap(rate, Ordering::AcqRel);
        if previous == rate {
            return;
        }
        self.cycle
            .monitor_interval
            .store(self.config.monitor_check_interval(rate), Ordering::Release);
        if let Some(slot) = self.session.load().as_ref() {
            slot.session.set_sample_rate(rate);
        }
        tracing::debug!(rate, "sample rate changed");
        self.events.emit(EngineEvent::SampleRateChanged(rate));
    }
}

impl Drop for AudioEngine {
    fn drop(&mut self) {
        if self.running() {
            if let Err(err) = self.stop(false) {
                tracing::error!(?err, "failed to stop engine during teardown");
            }
        }
        self.stop_hw_event_processing();
        if let Err(err) = self.join_process_threads() {
            tracing::error!(?err, "process threads did not exit cleanly");
        }
    }
}
