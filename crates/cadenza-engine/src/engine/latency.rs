//! Round-trip latency calibration.
//!
//! A measurement restarts the backend in its calibration configuration,
//! registers a dedicated port pair connected to the configured physical
//! ports, and lets the process callback drive the detector instead of the
//! session. Stopping it restores whatever state the engine was in before.

use std::sync::atomic::Ordering;

use super::{ActiveBackend, AudioEngine, LATENCY_INPUT_PORT, LATENCY_OUTPUT_PORT};
use crate::error::{EngineError, EngineResult};
use crate::latency::{LatencyMode, LatencySession, LatencyStatus, MeasurementKind};
use crate::ports::{DataType, PortDirection, PortHandle};

impl AudioEngine {
    /// Physical capture port the measurement listens on.
    pub fn set_latency_input_port(&self, name: &str) {
        *self.latency.input_port_name.lock() = Some(name.to_owned());
    }

    /// Physical playback port the measurement signal is sent to.
    pub fn set_latency_output_port(&self, name: &str) {
        *self.latency.output_port_name.lock() = Some(name.to_owned());
    }

    pub fn latency_input_port(&self) -> Option<String> {
        self.latency.input_port_name.lock().clone()
    }

    pub fn latency_output_port(&self) -> Option<String> {
        self.latency.output_port_name.lock().clone()
    }

    pub fn latency_mode(&self) -> LatencyMode {
        LatencyMode::from_u8(self.latency.mode.load(Ordering::Acquire))
    }

    /// Progress of the running measurement; `Idle` when none exists.
    pub fn latency_status(&self) -> LatencyStatus {
        LatencyStatus::from_u8(self.latency.status.load(Ordering::Acquire))
    }

    /// Measured round trip in frames. Survives `stop_latency_detection` and
    /// is cleared when the next measurement starts.
    pub fn latency_signal_delay(&self) -> Option<u32> {
        match self.latency.measured.load(Ordering::Acquire) {
            0 => None,
            stored => Some(stored - 1),
        }
    }

    /// Systemic latency the backend reports for the measurement ports.
    pub fn loopback_systemic_latency(&self) -> u32 {
        self.latency.systemic.load(Ordering::Acquire)
    }

    pub(super) fn publish_measured(&self, delay: Option<u32>) {
        let stored = delay.map_or(0, |delay| delay.saturating_add(1));
        self.latency.measured.store(stored, Ordering::Release);
    }

    /// Restarts the backend in its calibration configuration. Idempotent
    /// while a calibration restart is already in effect.
    pub fn prepare_for_latency_measurement(&self) -> EngineResult<()> {
        let _state = self.state_lock.lock();
        let active = self
            .backend
            .load_full()
            .ok_or(EngineError::NoBackendAvailable)?;
        if self.latency.started_for_latency.load(Ordering::Acquire) {
            return Ok(());
        }

        if self.running() {
            self.stop(true)?;
            self.latency.stopped_for_latency.store(true, Ordering::Release);
        }
        if let Err(err) = active.backend.configure_for_latency_measurement(true) {
            tracing::warn!(backend = %active.name, error = %format!("{err:#}"), "backend has no calibration configuration");
        }
        // suppress session traffic from the very first calibration cycle
        self.latency.started_for_latency.store(true, Ordering::Release);
        if let Err(err) = self.start(true) {
            self.latency.started_for_latency.store(false, Ordering::Release);
            let _ = active.backend.configure_for_latency_measurement(false);
            self.restart_after_latency();
            return Err(err);
        }
        tracing::debug!(backend = %active.name, "engine restarted for latency measurement");
        Ok(())
    }

    pub fn start_latency_detection(&self, kind: MeasurementKind) -> EngineResult<()> {
        let _state = self.state_lock.lock();
        if self.latency_mode() != LatencyMode::None || self.latency.session.lock().is_some() {
            return Err(EngineError::LatencyMeasurementInProgress);
        }
        let active = self
            .backend
            .load_full()
            .ok_or(EngineError::NoBackendAvailable)?;
        let (Some(input_name), Some(output_name)) =
            (self.latency_input_port(), self.latency_output_port())
        else {
            return Err(EngineError::LatencyPortsNotConfigured);
        };

        self.prepare_for_latency_measurement()?;
        // ports from an earlier measurement may still hold the names
        self.drain_pending_port_deletions();

        let (input, output) = match register_probe_ports(&active, kind, &input_name, &output_name) {
            Ok(ports) => ports,
            Err(err) => {
                tracing::error!(%err, ?kind, "could not set up latency measurement ports");
                self.stop_latency_detection();
                return Err(err);
            }
        };

        let ports = active.backend.port_engine();
        let systemic = ports
            .latency_range(input, false)
            .max
            .saturating_add(ports.latency_range(output, true).max);
        self.latency.systemic.store(systemic, Ordering::Release);
        let flush = 2 * u64::from(self.samples_per_cycle()) + u64::from(systemic);

        let session = LatencySession::new(
            kind,
            input,
            output,
            self.sample_rate(),
            flush,
            &self.config.latency,
        );
        self.publish_measured(None);
        self.latency
            .status
            .store(session.status() as u8, Ordering::Release);
        *self.latency.session.lock() = Some(session);
        self.latency
            .mode
            .store(LatencyMode::from(kind) as u8, Ordering::Release);
        tracing::info!(?kind, input = %input_name, output = %output_name, flush, systemic, "latency measurement started");
        Ok(())
    }

    /// Ends the measurement, keeps its result, and restores the engine to
    /// the state it had before `prepare_for_latency_measurement`.
    pub fn stop_latency_detection(&self) {
        let _state = self.state_lock.lock();
        let active = self.backend.load_full();
        if let Some(active) = active.as_deref() {
            self.discard_latency_session(active);
        } else {
            self.latency.mode.store(LatencyMode::None as u8, Ordering::Release);
        }

        if self.latency.started_for_latency.swap(false, Ordering::AcqRel) {
            if let Some(active) = active.as_deref() {
                if let Err(err) = self.stop(true) {
                    tracing::warn!(%err, "could not stop calibration run");
                }
                if let Err(err) = active.backend.configure_for_latency_measurement(false) {
                    tracing::debug!(error = %format!("{err:#}"), "backend kept calibration configuration");
                }
            }
        }
        self.restart_after_latency();
    }

    fn restart_after_latency(&self) {
        if !self.latency.stopped_for_latency.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Err(err) = self.start(false) {
            tracing::error!(%err, "could not restart engine after latency measurement");
        }
    }

    /// Removes the measurement session and releases its ports. Ports are
    /// queued for deletion while the backend runs.
    pub(super) fn discard_latency_session(&self, active: &ActiveBackend) {
        self.latency.mode.store(LatencyMode::None as u8, Ordering::Release);
        let Some(session) = self.latency.session.lock().take() else {
            return;
        };
        self.latency
            .status
            .store(LatencyStatus::Idle as u8, Ordering::Release);
        self.publish_measured(session.measured());

        let (input, output) = session.ports();
        for port in [input, output] {
            self.release_probe_port(active, port);
        }
        tracing::info!(
            kind = ?session.kind(),
            measured = ?session.measured(),
            status = ?session.status(),
            "latency measurement stopped"
        );
    }

    fn release_probe_port(&self, active: &ActiveBackend, port: PortHandle) {
        if self.running() {
            if let Err(port) = self.pending_ports.push(port) {
                tracing::warn!(%port, "deletion queue full, releasing port immediately");
                active.backend.port_engine().unregister_port(port);
            }
        } else {
            active.backend.port_engine().unregister_port(port);
        }
    }
}

fn register_probe_ports(
    active: &ActiveBackend,
    kind: MeasurementKind,
    input_name: &str,
    output_name: &str,
) -> EngineResult<(PortHandle, PortHandle)> {
    let ports = active.backend.port_engine();
    let data_type = match kind {
        MeasurementKind::Audio => DataType::Audio,
        MeasurementKind::Midi => DataType::Midi,
    };
    let port_error = |err: anyhow::Error| EngineError::Port(format!("{err:#}"));

    let input = ports
        .register_port(LATENCY_INPUT_PORT, data_type, PortDirection::Input)
        .map_err(port_error)?;
    let output = match ports.register_port(LATENCY_OUTPUT_PORT, data_type, PortDirection::Output) {
        Ok(output) => output,
        Err(err) => {
            ports.unregister_port(input);
            return Err(port_error(err));
        }
    };
    let connected = ports
        .connect(input, input_name)
        .and_then(|()| ports.connect(output, output_name));
    if let Err(err) = connected {
        ports.unregister_port(input);
        ports.unregister_port(output);
        return Err(port_error(err));
    }
    Ok((input, output))
}
