//! The process callback and the hooks backends call into.
//!
//! Nothing here may take the state lock: `stop` holds it while it joins the
//! backend's process thread.

use std::sync::atomic::Ordering;
use std::time::Instant;

use cadenza_rt::CycleScope;

use super::{ActiveBackend, AudioEngine};
use crate::backend::{BackendHost, TransportState};
use crate::error::{CycleFailure, EngineError, EngineResult};
use crate::events::EngineEvent;
use crate::latency::LatencyMode;
use crate::metrics::cycle_period_ns;
use crate::session::Session;

pub(super) const CAPTURE_LATENCY_PENDING: u8 = 0b01;
pub(super) const PLAYBACK_LATENCY_PENDING: u8 = 0b10;

impl AudioEngine {
    fn run_cycle(&self, nframes: u32) -> Result<(), CycleFailure> {
        let Some(_process) = self.process_lock.try_lock() else {
            // a control path owns the engine; keep the device fed with silence
            self.port_manager.silence_outputs(nframes);
            return Ok(());
        };
        let _scope = CycleScope::enter();
        let started = Instant::now();
        let backend = self.backend.load();

        let queued = self.cycle.latency_updates.swap(0, Ordering::AcqRel);
        if queued != 0 {
            if let Some(active) = backend.as_ref() {
                active.backend.update_latencies();
            }
        }
        self.first_cycle_init();

        self.cycle.remaining.store(nframes, Ordering::Relaxed);
        self.port_manager.cycle_start(nframes);
        let result = self.dispatch(backend.as_deref(), nframes);
        self.port_manager.cycle_end(nframes);

        let period = cycle_period_ns(self.sample_rate(), nframes);
        self.metrics.record_cycle(started.elapsed(), period);
        result
    }

    /// Runs once per activation on the first cycle after `start`.
    fn first_cycle_init(&self) {
        let count = self.cycle.start_count.load(Ordering::Acquire);
        if self.cycle.initialised_start.load(Ordering::Relaxed) == count {
            return;
        }
        self.cycle.initialised_start.store(count, Ordering::Relaxed);
        cadenza_rt::mark_process_thread();
        cadenza_rt::enable_ftz_daz();
        self.cycle.latency_updates.fetch_or(
            CAPTURE_LATENCY_PENDING | PLAYBACK_LATENCY_PENDING,
            Ordering::AcqRel,
        );
    }

    fn dispatch(&self, active: Option<&ActiveBackend>, nframes: u32) -> Result<(), CycleFailure> {
        let measuring = self.latency_mode() != LatencyMode::None;
        if self.removal.pending.load(Ordering::Acquire) {
            if measuring || self.latency.started_for_latency.load(Ordering::Acquire) {
                // the session is not processed while calibrating, so there
                // is nothing to fade
                if !self.removal.done.load(Ordering::Acquire) {
                    self.finish_session_removal();
                }
            } else {
                return self.session_removal_cycle(nframes);
            }
        }
        if measuring {
            return self.latency_cycle(active, nframes);
        }

        let init = self.cycle.init_countdown.load(Ordering::Acquire);
        if init > 0 {
            self.cycle.init_countdown.store(init - 1, Ordering::Release);
            self.port_manager.silence_outputs(nframes);
            return Ok(());
        }

        if self.latency.started_for_latency.load(Ordering::Acquire) {
            // restarted for calibration but nothing is measuring yet
            self.port_manager.silence_outputs(nframes);
            return Ok(());
        }

        if self.silence_cycle(nframes) {
            return Ok(());
        }

        let slot = self.session.load();
        let session = slot.as_deref().map(|slot| slot.session.as_ref());

        if self.freewheeling() {
            let ok = session.map_or(true, |session| session.freewheel(nframes));
            self.events.emit(EngineEvent::Freewheel(nframes));
            return if ok { Ok(()) } else { Err(CycleFailure::Session) };
        }

        let ok = match session {
            Some(session) => session.process(nframes),
            None => {
                self.port_manager.silence_outputs(nframes);
                true
            }
        };
        let frames = u64::from(nframes);
        let processed = self.state.processed_samples.fetch_add(frames, Ordering::AcqRel) + frames;
        if let Some(session) = session {
            self.check_monitoring(session, processed);
        }

        if ok {
            Ok(())
        } else {
            Err(CycleFailure::Session)
        }
    }

    fn check_monitoring(&self, session: &dyn Session, processed: u64) {
        let interval = self.cycle.monitor_interval.load(Ordering::Relaxed);
        if interval == 0 {
            return;
        }
        let last = self.cycle.last_monitor_check.load(Ordering::Relaxed);
        if last + interval < processed {
            session.check_monitoring();
            self.cycle
                .last_monitor_check
                .store(processed, Ordering::Relaxed);
        }
    }

    /// Counts processed frames toward silence; returns `true` once the engine
    /// has gone silent.
    fn silence_cycle(&self, nframes: u32) -> bool {
        if self.config.silence_after_seconds.is_none() {
            return false;
        }
        if self.silence.silent.load(Ordering::Acquire) {
            self.port_manager.silence_outputs(nframes);
            return true;
        }
        let remaining = self.silence.countdown.load(Ordering::Acquire);
        let next = remaining.saturating_sub(u64::from(nframes));
        self.silence.countdown.store(next, Ordering::Release);
        if next > 0 {
            return false;
        }
        self.silence.silent.store(true, Ordering::Release);
        self.events.emit(EngineEvent::BecameSilent);
        self.port_manager.silence_outputs(nframes);
        true
    }

    fn latency_cycle(&self, active: Option<&ActiveBackend>, nframes: u32) -> Result<(), CycleFailure> {
        self.port_manager.silence_outputs(nframes);
        let Some(active) = active else {
            return Ok(());
        };
        // the control thread holds this only while installing or removing
        let Some(mut guard) = self.latency.session.try_lock() else {
            return Ok(());
        };
        let Some(session) = guard.as_mut() else {
            return Ok(());
        };
        let result = session.run_cycle(active.backend.port_engine(), nframes);
        self.latency
            .status
            .store(session.status() as u8, Ordering::Release);
        if let Some(delay) = session.measured() {
            self.publish_measured(Some(delay));
        }
        result
    }

    fn session_removal_cycle(&self, nframes: u32) -> Result<(), CycleFailure> {
        let slot = self.session.load();
        let Some(slot) = slot.as_ref() else {
            self.port_manager.silence_outputs(nframes);
            self.finish_session_removal();
            return Ok(());
        };
        let remaining = self.removal.countdown.load(Ordering::Acquire);
        if remaining == 0 {
            self.port_manager.silence_outputs(nframes);
            return Ok(());
        }

        let total = self.removal.total.load(Ordering::Acquire).max(1);
        let next = remaining.saturating_sub(nframes);
        slot.session.set_output_gain(next as f32 / total as f32);
        let ok = slot.session.process(nframes);
        self.removal.countdown.store(next, Ordering::Release);
        if next == 0 {
            slot.session.midi_panic();
            self.finish_session_removal();
        }
        if ok {
            Ok(())
        } else {
            Err(CycleFailure::Session)
        }
    }

    pub(super) fn finish_session_removal(&self) {
        self.removal.done.store(true, Ordering::Release);
        let _guard = self.removal.lock.lock();
        self.removal.finished.notify_all();
    }

    /// Splits the running cycle at `offset` frames. Only valid inside the
    /// process callback.
    pub fn split_cycle(&self, offset: u32) -> EngineResult<()> {
        if !cadenza_rt::in_cycle() {
            return Err(EngineError::NotInProcessThread);
        }
        let remaining = self.cycle.remaining.load(Ordering::Relaxed);
        if offset > remaining {
            return Err(EngineError::InvalidSplitOffset { offset, remaining });
        }
        self.port_manager.split_cycle(offset);
        self.cycle
            .remaining
            .store(remaining - offset, Ordering::Relaxed);
        Ok(())
    }
}

impl BackendHost for AudioEngine {
    fn process(&self, nframes: u32) -> Result<(), CycleFailure> {
        self.run_cycle(nframes)
    }

    fn buffer_size_change(&self, frames: u32) {
        self.apply_buffer_size(frames);
    }

    fn sample_rate_change(&self, rate: u32) {
        self.apply_sample_rate(rate);
    }

    fn freewheel_callback(&self, on: bool) {
        self.state.freewheeling.store(on, Ordering::Release);
    }

    fn port_registration_callback(&self) -> EngineResult<()> {
        self.port_manager
            .registration_changed()
            .map_err(|err| EngineError::Port(format!("{err:#}")))
    }

    fn latency_callback(&self, for_playback: bool) {
        self.port_manager.update_latencies(for_playback);
        if let Some(slot) = self.session.load().as_ref() {
            slot.session.update_latency(for_playback);
        }
    }

    fn halted_callback(&self, reason: &str) {
        let was_running = self.state.running.swap(false, Ordering::AcqRel);
        self.state.freewheeling.store(false, Ordering::Release);
        if let Some(slot) = self.session.load().as_ref() {
            slot.session.engine_halted();
        }
        self.events.emit(EngineEvent::Halted(reason.to_owned()));
        tracing::warn!(reason, was_running, "backend halted");
    }

    fn xrun_callback(&self) {
        self.events.emit(EngineEvent::Xrun);
    }

    fn device_error_callback(&self) {
        self.events.emit(EngineEvent::DeviceError);
    }

    fn timebase_callback(&self, state: TransportState, nframes: u32, position: u64, new_position: bool) {
        if let Some(slot) = self.session.load().as_ref() {
            slot.session.timebase(state, nframes, position, new_position);
        }
    }

    fn sync_callback(&self, state: TransportState, position: u64) -> bool {
        self.session
            .load()
            .as_ref()
            .map_or(true, |slot| slot.session.sync(state, position))
    }

    fn thread_init_callback(&self) {
        cadenza_rt::mark_process_thread();
        cadenza_rt::enable_ftz_daz();
    }

    fn request_backend_reset(&self) {
        AudioEngine::request_backend_reset(self);
    }

    fn request_device_list_update(&self) {
        AudioEngine::request_device_list_update(self);
    }
}

