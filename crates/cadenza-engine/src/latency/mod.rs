//! Loopback latency measurement.
//!
//! A [`LatencySession`] owns one detector and the port pair it plays and
//! records through. The engine runs it from the process callback in place of
//! session processing while a measurement is active.

use crate::backend::safety::zero_f32;
use crate::config::{EngineConfig, LatencyConfig};
use crate::error::CycleFailure;
use crate::ports::{PortEngine, PortHandle};

pub mod mididm;
pub mod mtdm;

pub use mididm::MidiDm;
pub use mtdm::{Mtdm, ResolveError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MeasurementKind {
    Audio,
    Midi,
}

/// What the process callback is currently measuring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LatencyMode {
    None = 0,
    Audio = 1,
    Midi = 2,
}

impl LatencyMode {
    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            1 => LatencyMode::Audio,
            2 => LatencyMode::Midi,
            _ => LatencyMode::None,
        }
    }
}

impl From<MeasurementKind> for LatencyMode {
    fn from(kind: MeasurementKind) -> Self {
        match kind {
            MeasurementKind::Audio => LatencyMode::Audio,
            MeasurementKind::Midi => LatencyMode::Midi,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LatencyStatus {
    /// No measurement session exists.
    Idle = 0,
    /// Draining device buffers before the detector runs.
    Flushing = 1,
    Measuring = 2,
    Converged = 3,
    TimedOut = 4,
}

impl LatencyStatus {
    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            1 => LatencyStatus::Flushing,
            2 => LatencyStatus::Measuring,
            3 => LatencyStatus::Converged,
            4 => LatencyStatus::TimedOut,
            _ => LatencyStatus::Idle,
        }
    }
}

enum Detector {
    Audio(AudioProbe),
    Midi(MidiDm),
}

struct AudioProbe {
    mtdm: Mtdm,
    settle_remaining: u64,
    stable: u32,
    last: Option<f64>,
}

pub struct LatencySession {
    kind: MeasurementKind,
    detector: Detector,
    input: PortHandle,
    output: PortHandle,
    flush_remaining: u64,
    timeout_remaining: u64,
    measured: Option<u32>,
    status: LatencyStatus,
    params: LatencyConfig,
}

impl LatencySession {
    pub(crate) fn new(
        kind: MeasurementKind,
        input: PortHandle,
        output: PortHandle,
        sample_rate: u32,
        flush_frames: u64,
        params: &LatencyConfig,
    ) -> Self {
        let detector = match kind {
            MeasurementKind::Audio => Detector::Audio(AudioProbe {
                mtdm: Mtdm::new(sample_rate),
                settle_remaining: EngineConfig::ms_to_frames(params.settle_ms, sample_rate),
                stable: 0,
                last: None,
            }),
            MeasurementKind::Midi => Detector::Midi(MidiDm::new()),
        };
        Self {
            kind,
            detector,
            input,
            output,
            flush_remaining: flush_frames,
            timeout_remaining: EngineConfig::ms_to_frames(params.timeout_ms, sample_rate)
                + flush_frames,
            measured: None,
            status: if flush_frames > 0 {
                LatencyStatus::Flushing
            } else {
                LatencyStatus::Measuring
            },
            params: params.clone(),
        }
    }

    pub fn kind(&self) -> MeasurementKind {
        self.kind
    }

    pub fn ports(&self) -> (PortHandle, PortHandle) {
        (self.input, self.output)
    }

    pub fn status(&self) -> LatencyStatus {
        self.status
    }

    /// Round trip in frames, once converged.
    pub fn measured(&self) -> Option<u32> {
        self.measured
    }

    /// One process cycle. Runs on the backend's process thread.
    pub(crate) fn run_cycle(
        &mut self,
        ports: &dyn PortEngine,
        nframes: u32,
    ) -> Result<(), CycleFailure> {
        let frames = u64::from(nframes);
        if self.flush_remaining > 0 {
            let ok = match self.kind {
                MeasurementKind::Audio => {
                    ports.with_audio_io(self.input, self.output, nframes, &mut |_, out| {
                        zero_f32(out);
                    })
                }
                MeasurementKind::Midi => {
                    ports.with_midi_io(self.input, self.output, nframes, &mut |_, out| {
                        out.clear();
                    })
                }
            };
            self.flush_remaining = self.flush_remaining.saturating_sub(frames);
            self.timeout_remaining = self.timeout_remaining.saturating_sub(frames);
            if self.flush_remaining == 0 {
                self.status = LatencyStatus::Measuring;
            }
            return if ok { Ok(()) } else { Err(CycleFailure::DetectorPorts) };
        }

        let ok = match &mut self.detector {
            Detector::Audio(probe) => {
                let mtdm = &mut probe.mtdm;
                ports.with_audio_io(self.input, self.output, nframes, &mut |input, output| {
                    mtdm.process(input, output);
                })
            }
            Detector::Midi(dm) => {
                ports.with_midi_io(self.input, self.output, nframes, &mut |input, output| {
                    dm.process(nframes, input, output);
                })
            }
        };
        if !ok {
            return Err(CycleFailure::DetectorPorts);
        }

        if self.status == LatencyStatus::Measuring {
            self.evaluate(frames);
        }
        Ok(())
    }

    fn evaluate(&mut self, frames: u64) {
        let params = &self.params;
        let result = match &mut self.detector {
            Detector::Audio(probe) => probe.window(frames, params),
            Detector::Midi(dm) => dm.converged(params.midi_min_samples, params.midi_max_stddev),
        };
        if let Some(delay) = result {
            self.measured = Some(delay);
            self.status = LatencyStatus::Converged;
            return;
        }
        self.timeout_remaining = self.timeout_remaining.saturating_sub(frames);
        if self.timeout_remaining == 0 {
            self.status = LatencyStatus::TimedOut;
        }
    }
}

impl AudioProbe {
    /// Evaluates one window; returns the delay once enough consecutive
    /// windows agree.
    fn window(&mut self, frames: u64, params: &LatencyConfig) -> Option<u32> {
        if self.settle_remaining > 0 {
            self.settle_remaining = self.settle_remaining.saturating_sub(frames);
            return None;
        }
        let valid = match self.mtdm.resolve() {
            Ok(delay) if self.mtdm.error() < params.max_phase_error => Some(delay),
            Ok(_) | Err(ResolveError::PhaseError(_)) => {
                // a polarity-inverting loop resolves only with the flip applied
                self.mtdm.invert();
                None
            }
            Err(ResolveError::NoSignal) => None,
        };

        let Some(delay) = valid else {
            self.stable = 0;
            self.last = None;
            return None;
        };
        match self.last {
            Some(previous) if (delay - previous).abs() <= 1.0 => self.stable += 1,
            _ => self.stable = 1,
        }
        self.last = Some(delay);
        if self.stable >= params.stable_windows {
            Some(delay.round().max(0.0) as u32)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::{DataType, LatencyRange, MidiBuffer, MidiEvent, PortDirection};
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    /// One audio and one MIDI loop with a fixed delay.
    struct LoopPorts {
        delay: usize,
        audio: Mutex<VecDeque<f32>>,
        midi: Mutex<(u64, VecDeque<(u64, MidiEvent)>)>,
    }

    impl LoopPorts {
        fn new(delay: usize) -> Self {
            Self {
                delay,
                audio: Mutex::new(std::iter::repeat(0.0).take(delay).collect()),
                midi: Mutex::new((0, VecDeque::new())),
            }
        }
    }

    impl PortEngine for LoopPorts {
        fn register_port(
            &self,
            _: &str,
            _: DataType,
            _: PortDirection,
        ) -> anyhow::Result<PortHandle> {
            Ok(PortHandle(0))
        }
        fn unregister_port(&self, _: PortHandle) {}
        fn connect(&self, _: PortHandle, _: &str) -> anyhow::Result<()> {
            Ok(())
        }
        fn physical_ports(&self, _: DataType, _: PortDirection) -> Vec<String> {
            Vec::new()
        }
        fn latency_range(&self, _: PortHandle, _: bool) -> LatencyRange {
            LatencyRange::default()
        }

        fn with_audio_io(
            &self,
            _: PortHandle,
            _: PortHandle,
            nframes: u32,
            f: &mut dyn FnMut(&[f32], &mut [f32]),
        ) -> bool {
            let mut line = self.audio.lock();
            let input: Vec<f32> = (0..nframes).map(|_| line.pop_front().unwrap_or(0.0)).collect();
            let mut output = vec![0.0; nframes as usize];
            f(&input, &mut output);
            line.extend(output);
            true
        }

        fn with_midi_io(
            &self,
            _: PortHandle,
            _: PortHandle,
            nframes: u32,
            f: &mut dyn FnMut(&[MidiEvent], &mut MidiBuffer),
        ) -> bool {
            let mut guard = self.midi.lock();
            let (clock, queue) = &mut *guard;
            let end = *clock + u64::from(nframes);
            let mut input = Vec::new();
            while let Some(&(due, event)) = queue.front() {
                if due >= end {
                    break;
                }
                queue.pop_front();
                input.push(MidiEvent {
                    time: (due - *clock) as u32,
                    ..event
                });
            }
            let mut output = MidiBuffer::with_capacity(8);
            f(&input, &mut output);
            for event in output.events() {
                queue.push_back((*clock + u64::from(event.time) + self.delay as u64, *event));
            }
            *clock = end;
            true
        }
    }

    struct NoPorts;

    impl PortEngine for NoPorts {
        fn register_port(
            &self,
            _: &str,
            _: DataType,
            _: PortDirection,
        ) -> anyhow::Result<PortHandle> {
            anyhow::bail!("no ports")
        }
        fn unregister_port(&self, _: PortHandle) {}
        fn connect(&self, _: PortHandle, _: &str) -> anyhow::Result<()> {
            Ok(())
        }
        fn physical_ports(&self, _: DataType, _: PortDirection) -> Vec<String> {
            Vec::new()
        }
        fn latency_range(&self, _: PortHandle, _: bool) -> LatencyRange {
            LatencyRange::default()
        }
        fn with_audio_io(
            &self,
            _: PortHandle,
            _: PortHandle,
            _: u32,
            _: &mut dyn FnMut(&[f32], &mut [f32]),
        ) -> bool {
            false
        }
        fn with_midi_io(
            &self,
            _: PortHandle,
            _: PortHandle,
            _: u32,
            _: &mut dyn FnMut(&[MidiEvent], &mut MidiBuffer),
        ) -> bool {
            false
        }
    }

    fn run(session: &mut LatencySession, ports: &dyn PortEngine, cycles: usize) {
        for _ in 0..cycles {
            session.run_cycle(ports, 256).unwrap();
            if session.status() == LatencyStatus::Converged {
                break;
            }
        }
    }

    #[test]
    fn audio_session_converges_after_flush_and_settle() {
        let ports = LoopPorts::new(733);
        let params = LatencyConfig::default();
        let mut session = LatencySession::new(
            MeasurementKind::Audio,
            PortHandle(1),
            PortHandle(2),
            48_000,
            1024,
            &params,
        );
        assert_eq!(session.status(), LatencyStatus::Flushing);
        session.run_cycle(&ports, 256).unwrap();
        assert_eq!(session.status(), LatencyStatus::Flushing);

        run(&mut session, &ports, 2_000);
        assert_eq!(session.status(), LatencyStatus::Converged);
        let measured = session.measured().unwrap();
        assert!(measured.abs_diff(733) <= 1, "measured {measured}");
    }

    #[test]
    fn midi_session_converges() {
        let ports = LoopPorts::new(300);
        let params = LatencyConfig::default();
        let mut session = LatencySession::new(
            MeasurementKind::Midi,
            PortHandle(1),
            PortHandle(2),
            48_000,
            512,
            &params,
        );
        run(&mut session, &ports, 200);
        assert_eq!(session.status(), LatencyStatus::Converged);
        assert_eq!(session.measured(), Some(300));
    }

    #[test]
    fn silent_loop_times_out() {
        let params = LatencyConfig {
            timeout_ms: 100,
            settle_ms: 0,
            ..LatencyConfig::default()
        };
        let mut session = LatencySession::new(
            MeasurementKind::Midi,
            PortHandle(1),
            PortHandle(2),
            48_000,
            0,
            &params,
        );
        // nothing sent comes back within the timeout
        let ports = LoopPorts::new(1 << 20);
        run(&mut session, &ports, 40);
        assert_eq!(session.status(), LatencyStatus::TimedOut);
        assert_eq!(session.measured(), None);
    }

    #[test]
    fn missing_ports_fail_the_cycle() {
        let params = LatencyConfig::default();
        let mut session = LatencySession::new(
            MeasurementKind::Audio,
            PortHandle(1),
            PortHandle(2),
            48_000,
            0,
            &params,
        );
        assert_eq!(
            session.run_cycle(&NoPorts, 64),
            Err(CycleFailure::DetectorPorts)
        );
    }
}
