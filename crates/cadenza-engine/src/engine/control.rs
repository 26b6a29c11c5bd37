//! Control surface: backend selection, lifecycle, and configuration calls
//! forwarded to the backend under the state lock.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use super::process::{CAPTURE_LATENCY_PENDING, PLAYBACK_LATENCY_PENDING};
use super::{ActiveBackend, AudioEngine, SessionSlot};
use crate::backend::{
    BackendDescriptor, BackendDiscovery, BackendHost, BuiltinBackends, DeviceStatus,
    StreamConfig, TransportState,
};
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::events::EngineEvent;
use crate::latency::LatencyMode;
use crate::ports::{DataType, PortHandle};
use crate::session::Session;

/// Extra time granted to a session fade before the engine gives up waiting.
const REMOVAL_GRACE: Duration = Duration::from_secs(2);
const MIN_SILENCE_SECONDS: u64 = 60;

impl AudioEngine {
    /// Registers every backend `discovery` can load.
    pub fn discover(&self, discovery: &dyn BackendDiscovery) -> EngineResult<usize> {
        self.registry.discover(discovery)
    }

    /// Registers the backends compiled into this crate.
    pub fn discover_builtin(&self) -> EngineResult<usize> {
        self.discover(&BuiltinBackends::new())
    }

    pub fn available_backends(&self) -> Vec<BackendDescriptor> {
        self.registry.available()
    }

    pub fn setup_required(&self) -> bool {
        self.registry.setup_required()
    }

    /// Instantiates the named backend and makes it the active one.
    pub fn select(&self, name: &str, arg1: &str, arg2: &str) -> EngineResult<()> {
        let _state = self.state_lock.lock();
        if self.running() {
            return Err(EngineError::EngineRunning);
        }
        let descriptor = self
            .registry
            .get(name)
            .ok_or_else(|| EngineError::BackendNotFound(name.to_owned()))?;

        let host: Weak<dyn BackendHost> = self.self_ref.clone();
        let backend = descriptor
            .factory
            .instantiate(host, arg1, arg2)
            .map_err(|err| {
                self.record_backend_error(&err);
                tracing::warn!(backend = name, error = %format!("{err:#}"), "backend instantiation failed");
                EngineError::BackendInstantiationFailed {
                    name: name.to_owned(),
                    reason: format!("{err:#}"),
                }
            })?;

        self.release_backend()?;
        let rate = backend.sample_rate();
        let frames = backend.buffer_size();
        self.backend.store(Some(Arc::new(ActiveBackend {
            name: descriptor.name.clone(),
            backend,
        })));
        self.state.sample_rate.store(rate, Ordering::Release);
        self.state.buffer_size.store(frames, Ordering::Release);
        self.cycle
            .monitor_interval
            .store(self.config.monitor_check_interval(rate), Ordering::Release);
        *self.last_backend_error.lock() = None;
        self.devices.lock().clear();
        tracing::info!(backend = name, arg1, arg2, "backend selected");
        Ok(())
    }

    /// Stops the engine and releases the active backend.
    pub fn drop_backend(&self) -> EngineResult<()> {
        let _state = self.state_lock.lock();
        self.stop(false)?;
        self.release_backend()
    }

    /// Joins the engine's process threads, then uninstalls the active
    /// backend once no cycle can reference it.
    fn release_backend(&self) -> EngineResult<()> {
        self.join_process_threads()?;
        let previous = {
            let _process = self.process_lock.lock();
            self.backend.swap(None)
        };
        if let Some(previous) = previous {
            self.discard_latency_session(&previous);
            let released = self.pending_ports.drain(previous.backend.port_engine());
            tracing::info!(backend = %previous.name, released, "backend released");
        }
        Ok(())
    }

    fn require_backend(&self) -> EngineResult<Arc<ActiveBackend>> {
        self.backend
            .load_full()
            .ok_or(EngineError::NoBackendAvailable)
    }

    fn rejected(&self, setting: &'static str, err: &anyhow::Error) -> EngineError {
        self.record_backend_error(err);
        tracing::warn!(setting, error = %format!("{err:#}"), "backend rejected request");
        EngineError::rejected(setting, err)
    }

    pub fn start(&self, for_latency: bool) -> EngineResult<()> {
        let _state = self.state_lock.lock();
        let active = self.require_backend()?;
        if self.running() {
            return Ok(());
        }

        let rate = active.backend.sample_rate();
        let frames = active.backend.buffer_size();
        self.apply_sample_rate(rate);
        self.apply_buffer_size(frames);
        self.state.processed_samples.store(0, Ordering::Release);
        self.cycle.last_monitor_check.store(0, Ordering::Relaxed);
        self.cycle
            .monitor_interval
            .store(self.config.monitor_check_interval(rate), Ordering::Release);
        let startup = if for_latency {
            0
        } else {
            self.config.startup_cycles(rate, frames)
        };
        self.cycle.init_countdown.store(startup, Ordering::Release);
        self.arm_silence(rate);

        let count = self.cycle.start_count.fetch_add(1, Ordering::AcqRel) + 1;
        self.state.running.store(true, Ordering::Release);
        if let Err(err) = active.backend.start(for_latency) {
            self.state.running.store(false, Ordering::Release);
            self.cycle.start_count.fetch_sub(1, Ordering::AcqRel);
            self.record_backend_error(&err);
            tracing::error!(backend = %active.name, error = %format!("{err:#}"), "backend failed to start");
            return Err(EngineError::rejected("start", &err));
        }

        *self.last_backend_error.lock() = None;
        if !for_latency {
            self.events.emit(EngineEvent::Running(count));
        }
        tracing::info!(
            backend = %active.name,
            sample_rate = rate,
            buffer_size = frames,
            for_latency,
            count,
            "engine started"
        );
        Ok(())
    }

    /// Stops the backend. When this returns no process cycle is executing
    /// and none will start until the next `start`.
    pub fn stop(&self, for_latency: bool) -> EngineResult<()> {
        let _state = self.state_lock.lock();
        let Some(active) = self.backend.load_full() else {
            return Ok(());
        };

        let was_running = self.running();
        if was_running {
            let _process = self.process_lock.lock();
            if let Err(err) = active.backend.stop() {
                self.record_backend_error(&err);
                tracing::error!(backend = %active.name, error = %format!("{err:#}"), "backend failed to stop");
                return Err(EngineError::rejected("stop", &err));
            }
            self.state.running.store(false, Ordering::Release);
            self.state.freewheeling.store(false, Ordering::Release);
            if self.removal.pending.load(Ordering::Acquire) {
                // no cycle is left to finish the fade
                self.finish_session_removal();
            }
        }
        self.state.processed_samples.store(0, Ordering::Release);

        if !for_latency {
            self.discard_latency_session(&active);
            self.latency.started_for_latency.store(false, Ordering::Release);
            self.latency.stopped_for_latency.store(false, Ordering::Release);
        }
        let released = self.pending_ports.drain(active.backend.port_engine());

        if was_running {
            if !for_latency {
                self.events.emit(EngineEvent::Stopped);
            }
            tracing::info!(backend = %active.name, for_latency, released, "engine stopped");
        }
        Ok(())
    }

    /// Marks the engine as stopped after the backend died on its own.
    /// Emits nothing.
    pub fn died(&self) {
        self.state.running.store(false, Ordering::Release);
        self.state.freewheeling.store(false, Ordering::Release);
        self.latency.started_for_latency.store(false, Ordering::Release);
        self.latency.stopped_for_latency.store(false, Ordering::Release);
        tracing::warn!("backend died");
    }

    /// Asks the backend to enter or leave freewheeling. The change takes
    /// effect when the backend acknowledges it.
    pub fn freewheel(&self, on: bool) -> EngineResult<()> {
        let _state = self.state_lock.lock();
        let active = self.require_backend()?;
        if on && self.latency_mode() != LatencyMode::None {
            return Err(EngineError::LatencyMeasurementInProgress);
        }
        active
            .backend
            .freewheel(on)
            .map_err(|err| self.rejected("freewheel", &err))
    }

    pub fn set_device_name(&self, name: &str) -> EngineResult<()> {
        let _state = self.state_lock.lock();
        let active = self.require_backend()?;
        active
            .backend
            .set_device_name(name)
            .map_err(|err| self.rejected("device name", &err))
    }

    pub fn set_sample_rate(&self, rate: u32) -> EngineResult<()> {
        let _state = self.state_lock.lock();
        let active = self.require_backend()?;
        active
            .backend
            .set_sample_rate(rate)
            .map_err(|err| self.rejected("sample rate", &err))?;
        self.apply_sample_rate(rate);
        Ok(())
    }

    pub fn set_buffer_size(&self, frames: u32) -> EngineResult<()> {
        let _state = self.state_lock.lock();
        let active = self.require_backend()?;
        active
            .backend
            .set_buffer_size(frames)
            .map_err(|err| self.rejected("buffer size", &err))?;
        self.apply_buffer_size(frames);
        Ok(())
    }

    pub fn set_interleaved(&self, yn: bool) -> EngineResult<()> {
        let _state = self.state_lock.lock();
        let active = self.require_backend()?;
        active
            .backend
            .set_interleaved(yn)
            .map_err(|err| self.rejected("interleaving", &err))
    }

    pub fn set_input_channels(&self, channels: u32) -> EngineResult<()> {
        let _state = self.state_lock.lock();
        let active = self.require_backend()?;
        active
            .backend
            .set_input_channels(channels)
            .map_err(|err| self.rejected("input channels", &err))
    }

    pub fn set_output_channels(&self, channels: u32) -> EngineResult<()> {
        let _state = self.state_lock.lock();
        let active = self.require_backend()?;
        active
            .backend
            .set_output_channels(channels)
            .map_err(|err| self.rejected("output channels", &err))
    }

    pub fn set_systemic_input_latency(&self, frames: u32) -> EngineResult<()> {
        let _state = self.state_lock.lock();
        let active = self.require_backend()?;
        active
            .backend
            .set_systemic_input_latency(frames)
            .map_err(|err| self.rejected("systemic input latency", &err))
    }

    pub fn set_systemic_output_latency(&self, frames: u32) -> EngineResult<()> {
        let _state = self.state_lock.lock();
        let active = self.require_backend()?;
        active
            .backend
            .set_systemic_output_latency(frames)
            .map_err(|err| self.rejected("systemic output latency", &err))
    }

    pub fn set_time_master(&self, yn: bool) -> EngineResult<()> {
        let _state = self.state_lock.lock();
        let active = self.require_backend()?;
        active
            .backend
            .set_time_master(yn)
            .map_err(|err| self.rejected("time master", &err))
    }

    /// Drops any timebase master designation. No-op while stopped.
    pub fn reset_timebase(&self) -> EngineResult<()> {
        let _state = self.state_lock.lock();
        if !self.running() {
            return Ok(());
        }
        match self.backend.load_full() {
            Some(active) => {
                if let Err(err) = active.backend.set_time_master(false) {
                    tracing::debug!(error = %format!("{err:#}"), "backend keeps its timebase master");
                }
                Ok(())
            }
            None => Ok(()),
        }
    }

    pub fn device_name(&self) -> Option<String> {
        self.backend_guard()
            .as_ref()
            .map(|active| active.backend.device_name())
    }

    pub fn available_sample_rates(&self) -> Vec<u32> {
        self.backend_guard()
            .as_ref()
            .map(|active| {
                let device = active.backend.device_name();
                active.backend.available_sample_rates(&device)
            })
            .unwrap_or_default()
    }

    pub fn available_buffer_sizes(&self) -> Vec<u32> {
        self.backend_guard()
            .as_ref()
            .map(|active| {
                let device = active.backend.device_name();
                active.backend.available_buffer_sizes(&device)
            })
            .unwrap_or_default()
    }

    pub fn stream_config(&self) -> Option<StreamConfig> {
        self.backend_guard()
            .as_ref()
            .map(|active| active.backend.stream_config())
    }

    /// Asks the backend to recompute port latencies. Results arrive through
    /// the latency callback.
    pub fn update_latencies(&self) {
        if let Some(active) = self.backend_guard().as_ref() {
            active.backend.update_latencies();
        }
    }

    /// Defers a latency update to the next process cycle.
    pub fn queue_latency_update(&self, for_playback: bool) {
        let flag = if for_playback {
            PLAYBACK_LATENCY_PENDING
        } else {
            CAPTURE_LATENCY_PENDING
        };
        self.cycle.latency_updates.fetch_or(flag, Ordering::AcqRel);
    }

    pub fn transport_start(&self) {
        if let Some(active) = self.backend_guard().as_ref() {
            active.backend.transport_start();
        }
    }

    pub fn transport_stop(&self) {
        if let Some(active) = self.backend_guard().as_ref() {
            active.backend.transport_stop();
        }
    }

    pub fn transport_state(&self) -> TransportState {
        self.backend_guard()
            .as_ref()
            .map_or(TransportState::Stopped, |active| active.backend.transport_state())
    }

    pub fn transport_locate(&self, position: u64) {
        if let Some(active) = self.backend_guard().as_ref() {
            active.backend.transport_locate(position);
        }
    }

    pub fn transport_sample(&self) -> u64 {
        self.backend_guard()
            .as_ref()
            .map_or(0, |active| active.backend.transport_sample())
    }

    pub fn get_dsp_load(&self) -> f32 {
        if !self.running() {
            return 0.0;
        }
        self.backend_guard()
            .as_ref()
            .map_or(0.0, |active| active.backend.dsp_load())
    }

    pub fn usecs_per_cycle(&self) -> u64 {
        let rate = u64::from(self.sample_rate());
        if rate == 0 {
            return 0;
        }
        1_000_000 * u64::from(self.samples_per_cycle()) / rate
    }

    pub fn raw_buffer_size(&self, kind: DataType) -> usize {
        self.backend_guard()
            .as_ref()
            .map_or(0, |active| active.backend.raw_buffer_size(kind))
    }

    pub fn sample_time(&self) -> u64 {
        self.backend_guard()
            .as_ref()
            .map_or(0, |active| active.backend.sample_time())
    }

    pub fn sample_time_at_cycle_start(&self) -> u64 {
        self.backend_guard()
            .as_ref()
            .map_or(0, |active| active.backend.sample_time_at_cycle_start())
    }

    pub fn samples_since_cycle_start(&self) -> u32 {
        self.backend_guard()
            .as_ref()
            .map_or(0, |active| active.backend.samples_since_cycle_start())
    }

    pub fn get_sync_offset(&self) -> Option<u32> {
        self.backend_guard()
            .as_ref()
            .and_then(|active| active.backend.sync_offset())
    }

    pub fn is_realtime(&self) -> bool {
        self.backend_guard()
            .as_ref()
            .is_some_and(|active| active.backend.is_realtime())
    }

    pub fn client_real_time_priority(&self) -> Option<i32> {
        self.backend_guard()
            .as_ref()
            .and_then(|active| active.backend.client_real_time_priority())
    }

    pub fn launch_device_control_app(&self) -> EngineResult<()> {
        let active = self.require_backend()?;
        active
            .backend
            .launch_control_app()
            .map_err(|err| self.rejected("control application", &err))
    }

    /// Attaches the session driven by the process callback.
    pub fn set_session(&self, session: Arc<dyn Session>) {
        let _state = self.state_lock.lock();
        session.attached(self.sample_rate(), self.samples_per_cycle());
        let previous = self.session.swap(Some(Arc::new(SessionSlot { session })));
        if let Some(previous) = previous {
            previous.session.detached();
        }
        tracing::info!("session attached");
    }

    /// Detaches the session. While running the session is faded out inside
    /// the process callback first and this call waits for the fade. The
    /// state lock is not held during the wait.
    pub fn remove_session(&self) {
        let fade_ms = {
            let _state = self.state_lock.lock();
            if self.session.load().is_none() {
                return;
            }
            let calibrating = self.latency_mode() != LatencyMode::None
                || self.latency.started_for_latency.load(Ordering::Acquire);
            if self.running() && !calibrating {
                Some(self.arm_session_removal())
            } else {
                None
            }
        };

        if let Some(fade_ms) = fade_ms {
            let deadline = Instant::now() + Duration::from_millis(u64::from(fade_ms)) + REMOVAL_GRACE;
            let mut guard = self.removal.lock.lock();
            while !self.removal.done.load(Ordering::Acquire) {
                if self
                    .removal
                    .finished
                    .wait_until(&mut guard, deadline)
                    .timed_out()
                {
                    tracing::warn!(fade_ms, "session fade did not complete, detaching anyway");
                    break;
                }
            }
            self.removal.pending.store(false, Ordering::Release);
        }

        let _state = self.state_lock.lock();
        if let Some(slot) = self.session.swap(None) {
            slot.session.detached();
        }
        tracing::info!("session removed");
    }

    /// Hands the fade to the process callback and returns its length.
    fn arm_session_removal(&self) -> u32 {
        let fade_ms = self.config.session_removal_fade_ms;
        let frames = EngineConfig::ms_to_frames(fade_ms, self.sample_rate())
            .clamp(1, u64::from(u32::MAX)) as u32;
        let _guard = self.removal.lock.lock();
        self.removal.done.store(false, Ordering::Release);
        self.removal.total.store(frames, Ordering::Release);
        self.removal.countdown.store(frames, Ordering::Release);
        self.removal.pending.store(true, Ordering::Release);
        fade_ms
    }

    fn arm_silence(&self, rate: u32) {
        let Some(seconds) = self.config.silence_after_seconds else {
            return;
        };
        let budget = seconds.saturating_mul(u64::from(rate));
        self.silence.budget.store(budget, Ordering::Release);
        self.silence.countdown.store(budget, Ordering::Release);
        self.silence.silent.store(false, Ordering::Release);
    }

    /// Re-arms silence detection with half the previous budget, but never
    /// less than a minute of audio.
    pub fn reset_silence_countdown(&self) {
        if self.config.silence_after_seconds.is_none() {
            return;
        }
        let floor = MIN_SILENCE_SECONDS * u64::from(self.sample_rate());
        let budget = (self.silence.budget.load(Ordering::Acquire) / 2).max(floor);
        self.silence.budget.store(budget, Ordering::Release);
        self.silence.countdown.store(budget, Ordering::Release);
        self.silence.silent.store(false, Ordering::Release);
        tracing::debug!(frames = budget, "silence countdown re-armed");
    }

    /// Whether silence detection has muted the engine.
    pub fn is_silent(&self) -> bool {
        self.silence.silent.load(Ordering::Acquire)
    }

    /// Frames of processing left before silence detection triggers.
    pub fn silence_countdown(&self) -> u64 {
        self.silence.countdown.load(Ordering::Acquire)
    }

    pub fn request_backend_reset(&self) {
        self.hw.reset.request();
    }

    /// Reset requests not yet picked up by the reset worker.
    pub fn backend_reset_requested(&self) -> u32 {
        self.hw.reset.pending()
    }

    pub fn is_reset_requested(&self) -> bool {
        self.backend_reset_requested() > 0
    }

    pub fn request_device_list_update(&self) {
        self.hw.device_list.request();
    }

    /// Device list cached by the last device-list pass.
    pub fn devices(&self) -> Vec<DeviceStatus> {
        self.devices.lock().clone()
    }

    /// Queues a port for release outside the process callback.
    pub fn add_pending_port_deletion(&self, port: PortHandle) -> EngineResult<()> {
        self.pending_ports
            .push(port)
            .map_err(|port| EngineError::Port(format!("deletion queue full, {port} not queued")))
    }

    /// Releases every queued port. Must not be called from the process
    /// callback.
    pub fn drain_pending_port_deletions(&self) -> usize {
        match self.backend_guard().as_ref() {
            Some(active) => self.pending_ports.drain(active.backend.port_engine()),
            None => 0,
        }
    }

    pub fn pending_port_deletions(&self) -> usize {
        self.pending_ports.len()
    }

    /// One pass of the reset worker: stop, reset the device, and restart if
    /// the engine was running.
    pub(crate) fn reset_pass(&self) {
        let _state = self.state_lock.lock();
        let Some(active) = self.backend.load_full() else {
            tracing::debug!("device reset requested without a backend");
            return;
        };
        let device = active.backend.device_name();
        let was_running = self.running();
        tracing::info!(backend = %active.name, %device, was_running, "resetting device");
        self.events.emit(EngineEvent::DeviceResetStarted);

        let result = self
            .stop(false)
            .and_then(|()| {
                active
                    .backend
                    .reset_device()
                    .map_err(|err| self.rejected("device reset", &err))
            })
            .and_then(|()| if was_running { self.start(false) } else { Ok(()) });

        match result {
            Ok(()) => {
                self.events
                    .emit(EngineEvent::BufferSizeChanged(active.backend.buffer_size()));
                self.events.emit(EngineEvent::DeviceResetFinished);
                tracing::info!(backend = %active.name, %device, "device reset finished");
            }
            Err(err) => {
                self.events.emit(EngineEvent::DeviceResetFinished);
                self.events.emit(EngineEvent::DeviceError);
                tracing::error!(backend = %active.name, %device, %err, "device reset failed");
            }
        }
    }

    /// One pass of the device-list worker.
    pub(crate) fn device_list_pass(&self) {
        let Some(active) = self.backend.load_full() else {
            tracing::debug!("device list update requested without a backend");
            return;
        };
        self.events.emit(EngineEvent::DeviceListUpdateStarted);
        match active.backend.enumerate_devices() {
            Ok(devices) => {
                let count = devices.len();
                *self.devices.lock() = devices;
                self.events.emit(EngineEvent::DeviceListChanged);
                self.events.emit(EngineEvent::DeviceListUpdateFinished);
                tracing::info!(backend = %active.name, count, "device list refreshed");
            }
            Err(err) => {
                self.record_backend_error(&err);
                self.events.emit(EngineEvent::DeviceListUpdateFinished);
                self.events.emit(EngineEvent::DeviceError);
                tracing::warn!(backend = %active.name, error = %format!("{err:#}"), "device enumeration failed");
            }
        }
    }
}
