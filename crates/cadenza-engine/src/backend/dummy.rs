//! Reference backend without hardware.
//!
//! A clocked thread calls the engine once per period. Three devices are
//! offered: `Silence` captures zeros, `Noise` captures low-level white noise
//! and `Loopback` captures what was played, delayed by one period plus the
//! configured loopback latency. MIDI follows the same loopback path.
//!
//! Buffer size and sample rate changes are applied from the calling thread
//! while it holds the cycle lock, so the engine always sees them between
//! cycles. The process thread never delivers them itself. While configured
//! for latency measurement both are pinned and changes are rejected.

use std::collections::VecDeque;
use std::mem;
use std::ops::RangeInclusive;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};
use atomic_float::AtomicF32;
use parking_lot::{Mutex, RwLock};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::safety::{mix_f32, sanitize_f32, zero_f32};
use super::{
    AudioBackend, BackendCapabilities, BackendDescriptor, BackendFactory, BackendHost,
    DeviceStatus, TransportState,
};
use crate::ports::{
    DataType, LatencyRange, MidiBuffer, MidiEvent, PortDirection, PortEngine, PortHandle,
};

pub const NAME: &str = "dummy";

pub const SAMPLE_RATES: [u32; 8] = [
    22_050, 24_000, 44_100, 48_000, 88_200, 96_000, 176_400, 192_000,
];
pub const MIN_BUFFER_SIZE: u32 = 16;
pub const MAX_BUFFER_SIZE: u32 = 8192;
pub const MAX_LOOPBACK_LATENCY: u32 = 65_536;
/// Accepted range of the `speed` clock multiplier.
pub const SPEED_RANGE: RangeInclusive<f64> = 0.01..=1000.0;
const MAX_CHANNELS: u32 = 128;
const MIDI_EVENTS_PER_CYCLE: usize = 256;
const MIDI_LOOPBACK_CAPACITY: usize = 4096;
/// Consecutive failed cycles after which the backend halts.
const MAX_CONSECUTIVE_FAILURES: u32 = 16;
const NOISE_LEVEL: f32 = 0.1;
const RT_THREAD_NAME: &str = "cadenza-dummy-rt";

const TRANSPORT_STOPPED: u8 = 0;
const TRANSPORT_STARTING: u8 = 1;
const TRANSPORT_ROLLING: u8 = 2;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DummyDevice {
    Silence,
    Noise,
    Loopback,
}

impl DummyDevice {
    pub const ALL: [DummyDevice; 3] = [DummyDevice::Silence, DummyDevice::Noise, DummyDevice::Loopback];

    pub fn name(self) -> &'static str {
        match self {
            DummyDevice::Silence => "Silence",
            DummyDevice::Noise => "Noise",
            DummyDevice::Loopback => "Loopback",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|device| device.name().eq_ignore_ascii_case(name))
    }
}

/// Options accepted as the second selection argument, e.g.
/// `"latency=256,speed=4"`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DummyOptions {
    /// Extra loopback delay on top of one period, in frames.
    pub loopback_latency: u32,
    /// Clock multiplier; `2.0` runs cycles twice as fast as real time.
    pub speed: f64,
}

impl Default for DummyOptions {
    fn default() -> Self {
        Self {
            loopback_latency: 0,
            speed: 1.0,
        }
    }
}

impl DummyOptions {
    pub fn parse(text: &str) -> Result<Self> {
        let mut options = Self::default();
        let items = text
            .split(|c: char| c == ',' || c.is_whitespace())
            .filter(|item| !item.is_empty());
        for item in items {
            let (key, value) = item
                .split_once('=')
                .ok_or_else(|| anyhow!("expected key=value, got '{item}'"))?;
            match key {
                "latency" => {
                    let frames: u32 = value
                        .parse()
                        .with_context(|| format!("invalid loopback latency '{value}'"))?;
                    if frames > MAX_LOOPBACK_LATENCY {
                        bail!("loopback latency {frames} exceeds {MAX_LOOPBACK_LATENCY} frames");
                    }
                    options.loopback_latency = frames;
                }
                "speed" => {
                    let speed: f64 = value
                        .parse()
                        .with_context(|| format!("invalid speed '{value}'"))?;
                    if !SPEED_RANGE.contains(&speed) {
                        bail!(
                            "speed {speed} is outside {}..={}",
                            SPEED_RANGE.start(),
                            SPEED_RANGE.end()
                        );
                    }
                    options.speed = speed;
                }
                other => bail!("unknown dummy backend option '{other}'"),
            }
        }
        Ok(options)
    }
}

pub fn descriptor() -> BackendDescriptor {
    BackendDescriptor::new(
        NAME,
        BackendCapabilities {
            realtime: false,
            requires_driver_selection: false,
            can_change_sample_rate_when_running: true,
            can_change_buffer_size_when_running: true,
            can_set_systemic_latency: true,
            has_control_app: false,
        },
        Arc::new(DummyFactory),
    )
}

struct DummyFactory;

impl BackendFactory for DummyFactory {
    /// `arg1` names the device (empty selects `Silence`), `arg2` carries
    /// [`DummyOptions`].
    fn instantiate(
        &self,
        host: Weak<dyn BackendHost>,
        arg1: &str,
        arg2: &str,
    ) -> Result<Box<dyn AudioBackend>> {
        Ok(Box::new(DummyBackend::new(host, arg1, arg2)?))
    }
}

pub struct DummyBackend {
    host: Weak<dyn BackendHost>,
    shared: Arc<Shared>,
    thread: Mutex<Option<JoinHandle<()>>>,
    latency_mode: AtomicBool,
    device_resets: AtomicU32,
}

struct Shared {
    running: AtomicBool,
    freewheel_requested: AtomicBool,
    freewheeling: AtomicBool,
    latencies_pending: AtomicBool,
    sample_rate: AtomicU32,
    buffer_size: AtomicU32,
    interleaved: AtomicBool,
    sample_time: AtomicU64,
    cycle_start_time: AtomicU64,
    cycle_start_ns: AtomicU64,
    epoch: Instant,
    dsp_load: AtomicF32,
    xruns: AtomicU64,
    transport: AtomicU8,
    transport_position: AtomicU64,
    transport_relocated: AtomicBool,
    time_master: AtomicBool,
    speed: f64,
    loopback_latency: u32,
    cycle: Mutex<CycleState>,
    ports: DummyPorts,
}

impl DummyBackend {
    pub fn new(host: Weak<dyn BackendHost>, device: &str, options: &str) -> Result<Self> {
        let device = if device.is_empty() {
            DummyDevice::Silence
        } else {
            DummyDevice::from_name(device)
                .ok_or_else(|| anyhow!("unknown dummy device '{device}'"))?
        };
        let options = DummyOptions::parse(options)?;
        let sample_rate = 48_000;
        let buffer_size = 1024;
        let ports = DummyPorts::new(2, 2);

        Ok(Self {
            host,
            shared: Arc::new(Shared {
                running: AtomicBool::new(false),
                freewheel_requested: AtomicBool::new(false),
                freewheeling: AtomicBool::new(false),
                latencies_pending: AtomicBool::new(false),
                sample_rate: AtomicU32::new(sample_rate),
                buffer_size: AtomicU32::new(buffer_size),
                interleaved: AtomicBool::new(false),
                sample_time: AtomicU64::new(0),
                cycle_start_time: AtomicU64::new(0),
                cycle_start_ns: AtomicU64::new(0),
                epoch: Instant::now(),
                dsp_load: AtomicF32::new(0.0),
                xruns: AtomicU64::new(0),
                transport: AtomicU8::new(TRANSPORT_STOPPED),
                transport_position: AtomicU64::new(0),
                transport_relocated: AtomicBool::new(false),
                time_master: AtomicBool::new(false),
                speed: options.speed,
                loopback_latency: options.loopback_latency,
                cycle: Mutex::new(CycleState::new(
                    device,
                    ports.outputs(),
                    buffer_size,
                    options.loopback_latency,
                )),
                ports,
            }),
            thread: Mutex::new(None),
            latency_mode: AtomicBool::new(false),
            device_resets: AtomicU32::new(0),
        })
    }

    /// Cycles that missed their deadline since the backend was created.
    pub fn xruns(&self) -> u64 {
        self.shared.xruns.load(Ordering::Relaxed)
    }

    pub fn device_resets(&self) -> u32 {
        self.device_resets.load(Ordering::Relaxed)
    }

    fn running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    fn reconfigure_cycle(&self, cycle: &mut CycleState) {
        cycle.reconfigure(
            self.shared.ports.outputs(),
            self.shared.buffer_size.load(Ordering::Relaxed),
            self.shared.loopback_latency,
        );
    }

    fn notify_registration(&self) {
        if let Some(host) = self.host.upgrade() {
            if let Err(err) = host.port_registration_callback() {
                tracing::warn!(%err, "port graph reconciliation failed");
            }
        }
    }
}

impl AudioBackend for DummyBackend {
    fn name(&self) -> &str {
        NAME
    }

    fn start(&self, for_latency: bool) -> Result<()> {
        if self.running() {
            bail!("dummy backend is already running");
        }
        if let Some(stale) = self.thread.lock().take() {
            // left behind by a halted run
            let _ = stale.join();
        }
        if self.host.strong_count() == 0 {
            bail!("engine was dropped");
        }
        let host = self.host.clone();

        let device = {
            let mut cycle = self.shared.cycle.lock();
            self.reconfigure_cycle(&mut cycle);
            cycle.frame = 0;
            cycle.device
        };
        self.shared.sample_time.store(0, Ordering::Relaxed);
        self.shared.cycle_start_time.store(0, Ordering::Relaxed);
        self.shared.dsp_load.store(0.0, Ordering::Relaxed);
        self.shared.running.store(true, Ordering::Release);

        let shared = Arc::clone(&self.shared);
        let handle = thread::Builder::new()
            .name(RT_THREAD_NAME.into())
            .spawn(move || run_cycles(&shared, &host))
            .map_err(|err| {
                self.shared.running.store(false, Ordering::Release);
                anyhow!("failed to spawn dummy process thread: {err}")
            })?;
        *self.thread.lock() = Some(handle);

        tracing::info!(
            device = device.name(),
            sample_rate = self.sample_rate(),
            buffer_size = self.buffer_size(),
            for_latency,
            "dummy backend started"
        );
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        self.shared.running.store(false, Ordering::Release);
        let handle = self.thread.lock().take();
        if let Some(handle) = handle {
            if handle.thread().id() == thread::current().id() {
                return Ok(());
            }
            handle
                .join()
                .map_err(|_| anyhow!("dummy process thread panicked"))?;
            tracing::info!("dummy backend stopped");
        }
        self.shared.freewheeling.store(false, Ordering::Relaxed);
        self.shared.freewheel_requested.store(false, Ordering::Relaxed);
        Ok(())
    }

    fn freewheel(&self, on: bool) -> Result<()> {
        self.shared.freewheel_requested.store(on, Ordering::Release);
        if !self.running() && self.shared.freewheeling.swap(on, Ordering::AcqRel) != on {
            if let Some(host) = self.host.upgrade() {
                host.freewheel_callback(on);
            }
        }
        Ok(())
    }

    fn dsp_load(&self) -> f32 {
        self.shared.dsp_load.load(Ordering::Relaxed)
    }

    fn transport_start(&self) {
        self.shared
            .transport
            .store(TRANSPORT_STARTING, Ordering::Release);
    }

    fn transport_stop(&self) {
        self.shared
            .transport
            .store(TRANSPORT_STOPPED, Ordering::Release);
    }

    fn transport_state(&self) -> TransportState {
        match self.shared.transport.load(Ordering::Acquire) {
            TRANSPORT_STARTING => TransportState::Starting,
            TRANSPORT_ROLLING => TransportState::Rolling,
            _ => TransportState::Stopped,
        }
    }

    fn transport_locate(&self, position: u64) {
        self.shared
            .transport_position
            .store(position, Ordering::Release);
        self.shared
            .transport_relocated
            .store(true, Ordering::Release);
    }

    fn transport_sample(&self) -> u64 {
        self.shared.transport_position.load(Ordering::Acquire)
    }

    fn set_time_master(&self, yn: bool) -> Result<()> {
        self.shared.time_master.store(yn, Ordering::Release);
        Ok(())
    }

    fn device_name(&self) -> String {
        self.shared.cycle.lock().device.name().to_owned()
    }

    fn sample_rate(&self) -> u32 {
        self.shared.sample_rate.load(Ordering::Acquire)
    }

    fn buffer_size(&self) -> u32 {
        self.shared.buffer_size.load(Ordering::Acquire)
    }

    fn interleaved(&self) -> bool {
        self.shared.interleaved.load(Ordering::Relaxed)
    }

    fn input_channels(&self) -> u32 {
        self.shared.ports.inputs()
    }

    fn output_channels(&self) -> u32 {
        self.shared.ports.outputs()
    }

    fn systemic_input_latency(&self) -> u32 {
        self.shared.ports.systemic_input.load(Ordering::Relaxed)
    }

    fn systemic_output_latency(&self) -> u32 {
        self.shared.ports.systemic_output.load(Ordering::Relaxed)
    }

    fn available_sample_rates(&self, _device: &str) -> Vec<u32> {
        SAMPLE_RATES.to_vec()
    }

    fn available_buffer_sizes(&self, _device: &str) -> Vec<u32> {
        (MIN_BUFFER_SIZE.trailing_zeros()..=MAX_BUFFER_SIZE.trailing_zeros())
            .map(|shift| 1 << shift)
            .collect()
    }

    fn set_device_name(&self, name: &str) -> Result<()> {
        let device =
            DummyDevice::from_name(name).ok_or_else(|| anyhow!("unknown dummy device '{name}'"))?;
        self.shared.cycle.lock().device = device;
        Ok(())
    }

    fn set_sample_rate(&self, rate: u32) -> Result<()> {
        if !SAMPLE_RATES.contains(&rate) {
            bail!("unsupported sample rate {rate}");
        }
        if self.latency_mode.load(Ordering::Acquire) && rate != self.sample_rate() {
            bail!("sample rate is pinned while calibrating loopback latency");
        }
        let _cycle = self.shared.cycle.lock();
        self.shared.sample_rate.store(rate, Ordering::Release);
        if let Some(host) = self.host.upgrade() {
            host.sample_rate_change(rate);
        }
        Ok(())
    }

    fn set_buffer_size(&self, frames: u32) -> Result<()> {
        if !frames.is_power_of_two() || !(MIN_BUFFER_SIZE..=MAX_BUFFER_SIZE).contains(&frames) {
            bail!("unsupported buffer size {frames}");
        }
        if self.latency_mode.load(Ordering::Acquire) && frames != self.buffer_size() {
            bail!("buffer size is pinned while calibrating loopback latency");
        }
        let mut cycle = self.shared.cycle.lock();
        self.shared.buffer_size.store(frames, Ordering::Release);
        self.reconfigure_cycle(&mut cycle);
        if let Some(host) = self.host.upgrade() {
            host.buffer_size_change(frames);
        }
        Ok(())
    }

    fn set_interleaved(&self, yn: bool) -> Result<()> {
        self.shared.interleaved.store(yn, Ordering::Relaxed);
        Ok(())
    }

    fn set_input_channels(&self, channels: u32) -> Result<()> {
        if self.running() {
            bail!("channel count cannot change while running");
        }
        if channels == 0 || channels > MAX_CHANNELS {
            bail!("unsupported input channel count {channels}");
        }
        self.shared.ports.set_inputs(channels);
        self.notify_registration();
        Ok(())
    }

    fn set_output_channels(&self, channels: u32) -> Result<()> {
        if self.running() {
            bail!("channel count cannot change while running");
        }
        if channels == 0 || channels > MAX_CHANNELS {
            bail!("unsupported output channel count {channels}");
        }
        self.shared.ports.set_outputs(channels);
        self.notify_registration();
        Ok(())
    }

    fn set_systemic_input_latency(&self, frames: u32) -> Result<()> {
        self.shared
            .ports
            .systemic_input
            .store(frames, Ordering::Relaxed);
        Ok(())
    }

    fn set_systemic_output_latency(&self, frames: u32) -> Result<()> {
        self.shared
            .ports
            .systemic_output
            .store(frames, Ordering::Relaxed);
        Ok(())
    }

    fn reset_device(&self) -> Result<()> {
        let mut cycle = self.shared.cycle.lock();
        self.reconfigure_cycle(&mut cycle);
        self.device_resets.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(device = cycle.device.name(), "dummy device reset");
        Ok(())
    }

    fn enumerate_devices(&self) -> Result<Vec<DeviceStatus>> {
        Ok(DummyDevice::ALL
            .into_iter()
            .map(|device| DeviceStatus::new(device.name(), true))
            .collect())
    }

    fn update_latencies(&self) {
        if self.running() {
            self.shared.latencies_pending.store(true, Ordering::Release);
        } else if let Some(host) = self.host.upgrade() {
            host.latency_callback(false);
            host.latency_callback(true);
        }
    }

    fn configure_for_latency_measurement(&self, enable: bool) -> Result<()> {
        self.latency_mode.store(enable, Ordering::Release);
        tracing::debug!(enable, "dummy backend calibration mode");
        Ok(())
    }

    fn sample_time(&self) -> u64 {
        self.shared.sample_time.load(Ordering::Acquire)
    }

    fn sample_time_at_cycle_start(&self) -> u64 {
        self.shared.cycle_start_time.load(Ordering::Acquire)
    }

    fn samples_since_cycle_start(&self) -> u32 {
        if !self.running() {
            return 0;
        }
        let started = self.shared.cycle_start_ns.load(Ordering::Acquire);
        let now = nanos_since(self.shared.epoch);
        let elapsed = now.saturating_sub(started);
        let frames = elapsed * u64::from(self.sample_rate()) / 1_000_000_000;
        frames.min(u64::from(self.buffer_size())) as u32
    }

    fn raw_buffer_size(&self, kind: DataType) -> usize {
        match kind {
            DataType::Audio => self.buffer_size() as usize * mem::size_of::<f32>(),
            DataType::Midi => MIDI_EVENTS_PER_CYCLE * mem::size_of::<MidiEvent>(),
        }
    }

    fn is_realtime(&self) -> bool {
        false
    }

    fn port_engine(&self) -> &dyn PortEngine {
        &self.shared.ports
    }
}

impl Drop for DummyBackend {
    fn drop(&mut self) {
        if let Err(err) = self.stop() {
            tracing::error!(?err, "failed to stop dummy backend");
        }
    }
}

enum CycleOutcome {
    Continue(Duration),
    Halt,
}

/// Drives cycles until stopped. The host is upgraded once per cycle and
/// released before sleeping, so dropping the engine ends the loop.
fn run_cycles(shared: &Shared, host: &Weak<dyn BackendHost>) {
    match host.upgrade() {
        Some(host) => host.thread_init_callback(),
        None => return,
    }
    let mut deadline = Instant::now();
    let mut failures = 0u32;

    while shared.running.load(Ordering::Acquire) {
        let Some(host) = host.upgrade() else {
            shared.running.store(false, Ordering::Release);
            tracing::debug!("engine dropped, dummy process thread exits");
            break;
        };
        let period = match shared.run_one_cycle(host.as_ref(), &mut failures) {
            CycleOutcome::Continue(period) => period,
            CycleOutcome::Halt => {
                shared.running.store(false, Ordering::Release);
                host.halted_callback("dummy backend: process callback keeps failing");
                break;
            }
        };

        if shared.freewheeling.load(Ordering::Relaxed) {
            drop(host);
            deadline = Instant::now();
            thread::yield_now();
            continue;
        }

        deadline += period;
        let now = Instant::now();
        if now > deadline {
            shared.xruns.fetch_add(1, Ordering::Relaxed);
            host.xrun_callback();
            deadline = now;
        } else {
            drop(host);
            thread::sleep(deadline - now);
        }
    }
}

impl Shared {
    fn run_one_cycle(&self, host: &dyn BackendHost, failures: &mut u32) -> CycleOutcome {
        let mut cycle = self.cycle.lock();
        let nframes = self.buffer_size.load(Ordering::Acquire);
        let rate = self.sample_rate.load(Ordering::Acquire);

        let requested = self.freewheel_requested.load(Ordering::Acquire);
        if self.freewheeling.swap(requested, Ordering::AcqRel) != requested {
            host.freewheel_callback(requested);
        }

        let started = Instant::now();
        self.cycle_start_time.store(cycle.frame, Ordering::Release);
        self.cycle_start_ns
            .store(nanos_since(self.epoch), Ordering::Release);
        self.drive_transport(host, nframes);

        self.ports.capture(&mut cycle, nframes);
        let result = host.process(nframes);
        self.ports.playback(&mut cycle, nframes);

        cycle.frame += u64::from(nframes);
        self.sample_time.store(cycle.frame, Ordering::Release);
        if self.latencies_pending.swap(false, Ordering::AcqRel) {
            host.latency_callback(false);
            host.latency_callback(true);
        }

        let period = Duration::from_secs_f64(f64::from(nframes) / (f64::from(rate) * self.speed));
        let load = started.elapsed().as_secs_f32() / period.as_secs_f32().max(f32::EPSILON);
        self.dsp_load.store(load.min(1.0), Ordering::Relaxed);

        match result {
            Ok(()) => *failures = 0,
            Err(failure) => {
                *failures += 1;
                tracing::trace!(?failure, consecutive = *failures, "dummy cycle failed");
                if *failures >= MAX_CONSECUTIVE_FAILURES {
                    return CycleOutcome::Halt;
                }
            }
        }
        CycleOutcome::Continue(period)
    }

    fn drive_transport(&self, host: &dyn BackendHost, nframes: u32) {
        match self.transport.load(Ordering::Acquire) {
            TRANSPORT_STARTING => {
                let position = self.transport_position.load(Ordering::Acquire);
                if host.sync_callback(TransportState::Starting, position) {
                    self.transport.store(TRANSPORT_ROLLING, Ordering::Release);
                }
            }
            TRANSPORT_ROLLING => {
                let position = self
                    .transport_position
                    .fetch_add(u64::from(nframes), Ordering::AcqRel);
                if self.time_master.load(Ordering::Acquire) {
                    let relocated = self.transport_relocated.swap(false, Ordering::AcqRel);
                    host.timebase_callback(TransportState::Rolling, nframes, position, relocated);
                }
            }
            _ => {}
        }
    }
}

fn nanos_since(epoch: Instant) -> u64 {
    epoch.elapsed().as_nanos().min(u128::from(u64::MAX)) as u64
}

/// Per-cycle device state, guarded by the cycle lock.
struct CycleState {
    device: DummyDevice,
    /// Absolute frame at the start of the next cycle.
    frame: u64,
    delay: u64,
    lines: Vec<DelayLine>,
    midi: MidiDelay,
    rng: StdRng,
}

impl CycleState {
    fn new(device: DummyDevice, outputs: u32, buffer_size: u32, loopback_latency: u32) -> Self {
        let mut state = Self {
            device,
            frame: 0,
            delay: 0,
            lines: Vec::new(),
            midi: MidiDelay::new(MIDI_LOOPBACK_CAPACITY),
            rng: StdRng::from_entropy(),
        };
        state.reconfigure(outputs, buffer_size, loopback_latency);
        state
    }

    fn reconfigure(&mut self, outputs: u32, buffer_size: u32, loopback_latency: u32) {
        self.delay = u64::from(buffer_size) + u64::from(loopback_latency);
        let capacity = (self.delay + u64::from(MAX_BUFFER_SIZE)) as usize;
        self.lines = (0..outputs.max(1)).map(|_| DelayLine::new(capacity)).collect();
        self.midi.clear();
    }

    fn capture_audio(&mut self, channel: u32, out: &mut [f32]) {
        match self.device {
            DummyDevice::Silence => zero_f32(out),
            DummyDevice::Noise => {
                for sample in out.iter_mut() {
                    *sample = self.rng.gen_range(-NOISE_LEVEL..NOISE_LEVEL);
                }
            }
            DummyDevice::Loopback => {
                let line = &self.lines[channel as usize % self.lines.len()];
                line.read(self.frame, self.delay, out);
                sanitize_f32(out);
            }
        }
    }

    fn capture_midi(&mut self, nframes: u32, out: &mut MidiBuffer) {
        if self.device == DummyDevice::Loopback {
            self.midi.drain_into(self.frame, nframes, out);
        }
    }

    fn begin_playback(&mut self, nframes: u32) {
        for line in &mut self.lines {
            line.clear_span(self.frame, nframes as usize);
        }
    }

    fn play_audio(&mut self, channel: u32, samples: &[f32]) {
        let index = channel as usize % self.lines.len();
        self.lines[index].mix(self.frame, samples);
    }

    fn play_midi(&mut self, events: &[MidiEvent]) {
        for event in events {
            let due = self.frame + u64::from(event.time) + self.delay;
            self.midi.push(due, *event);
        }
    }
}

struct DelayLine {
    buf: Vec<f32>,
    mask: usize,
}

impl DelayLine {
    fn new(capacity: usize) -> Self {
        let capacity = capacity.next_power_of_two();
        Self {
            buf: vec![0.0; capacity],
            mask: capacity - 1,
        }
    }

    fn index(&self, frame: u64) -> usize {
        (frame as usize) & self.mask
    }

    fn clear_span(&mut self, start: u64, len: usize) {
        for offset in 0..len as u64 {
            let index = self.index(start + offset);
            self.buf[index] = 0.0;
        }
    }

    fn mix(&mut self, start: u64, src: &[f32]) {
        for (offset, sample) in (0u64..).zip(src) {
            let index = self.index(start + offset);
            self.buf[index] += *sample;
        }
    }

    fn read(&self, start: u64, delay: u64, out: &mut [f32]) {
        for (offset, sample) in (0u64..).zip(out.iter_mut()) {
            let frame = start + offset;
            *sample = if frame >= delay {
                self.buf[self.index(frame - delay)]
            } else {
                0.0
            };
        }
    }
}

struct MidiDelay {
    queue: VecDeque<(u64, MidiEvent)>,
    capacity: usize,
}

impl MidiDelay {
    fn new(capacity: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    fn clear(&mut self) {
        self.queue.clear();
    }

    fn push(&mut self, due: u64, event: MidiEvent) {
        if self.queue.len() < self.capacity {
            self.queue.push_back((due, event));
        }
    }

    fn drain_into(&mut self, start: u64, nframes: u32, out: &mut MidiBuffer) {
        let end = start + u64::from(nframes);
        while let Some(&(due, event)) = self.queue.front() {
            if due >= end {
                break;
            }
            self.queue.pop_front();
            let time = due.saturating_sub(start) as u32;
            if !out.push(MidiEvent { time, ..event }) {
                break;
            }
        }
    }
}

struct DummyPort {
    name: String,
    kind: DataType,
    direction: PortDirection,
    physical: Option<u32>,
    audio: Mutex<Vec<f32>>,
    midi: Mutex<MidiBuffer>,
}

/// Port table of the dummy backend. Handles are never reused.
struct DummyPorts {
    slots: RwLock<Vec<Option<DummyPort>>>,
    inputs: AtomicU32,
    outputs: AtomicU32,
    systemic_input: AtomicU32,
    systemic_output: AtomicU32,
}

const PHYSICAL_CAPTURE: &str = "system:capture_";
const PHYSICAL_PLAYBACK: &str = "system:playback_";
const PHYSICAL_MIDI_CAPTURE: &str = "system:midi_capture_1";
const PHYSICAL_MIDI_PLAYBACK: &str = "system:midi_playback_1";

impl DummyPorts {
    fn new(inputs: u32, outputs: u32) -> Self {
        Self {
            slots: RwLock::new(Vec::new()),
            inputs: AtomicU32::new(inputs),
            outputs: AtomicU32::new(outputs),
            systemic_input: AtomicU32::new(0),
            systemic_output: AtomicU32::new(0),
        }
    }

    fn inputs(&self) -> u32 {
        self.inputs.load(Ordering::Relaxed)
    }

    fn outputs(&self) -> u32 {
        self.outputs.load(Ordering::Relaxed)
    }

    fn set_inputs(&self, channels: u32) {
        self.inputs.store(channels, Ordering::Relaxed);
    }

    fn set_outputs(&self, channels: u32) {
        self.outputs.store(channels, Ordering::Relaxed);
    }

    /// Resolves a physical port name to its channel index for an engine port
    /// of the given kind and direction.
    fn physical_channel(&self, kind: DataType, direction: PortDirection, name: &str) -> Option<u32> {
        match (kind, direction) {
            (DataType::Audio, PortDirection::Input) => {
                parse_channel(name, PHYSICAL_CAPTURE).filter(|ch| *ch < self.inputs())
            }
            (DataType::Audio, PortDirection::Output) => {
                parse_channel(name, PHYSICAL_PLAYBACK).filter(|ch| *ch < self.outputs())
            }
            (DataType::Midi, PortDirection::Input) => (name == PHYSICAL_MIDI_CAPTURE).then_some(0),
            (DataType::Midi, PortDirection::Output) => (name == PHYSICAL_MIDI_PLAYBACK).then_some(0),
        }
    }

    fn capture(&self, cycle: &mut CycleState, nframes: u32) {
        let slots = self.slots.read();
        for port in slots.iter().flatten() {
            match (port.kind, port.direction) {
                (DataType::Audio, PortDirection::Input) => {
                    let mut buffer = port.audio.lock();
                    let frames = (nframes as usize).min(buffer.len());
                    let out = &mut buffer[..frames];
                    match port.physical {
                        Some(channel) => cycle.capture_audio(channel, out),
                        None => zero_f32(out),
                    }
                }
                (DataType::Audio, PortDirection::Output) => zero_f32(&mut port.audio.lock()),
                (DataType::Midi, PortDirection::Input) => {
                    let mut buffer = port.midi.lock();
                    buffer.clear();
                    if port.physical.is_some() {
                        cycle.capture_midi(nframes, &mut buffer);
                    }
                }
                (DataType::Midi, PortDirection::Output) => port.midi.lock().clear(),
            }
        }
    }

    fn playback(&self, cycle: &mut CycleState, nframes: u32) {
        cycle.begin_playback(nframes);
        let slots = self.slots.read();
        for port in slots.iter().flatten() {
            let (PortDirection::Output, Some(channel)) = (port.direction, port.physical) else {
                continue;
            };
            match port.kind {
                DataType::Audio => {
                    let buffer = port.audio.lock();
                    let frames = (nframes as usize).min(buffer.len());
                    cycle.play_audio(channel, &buffer[..frames]);
                }
                DataType::Midi => cycle.play_midi(port.midi.lock().events()),
            }
        }
    }
}

fn parse_channel(name: &str, prefix: &str) -> Option<u32> {
    let index: u32 = name.strip_prefix(prefix)?.parse().ok()?;
    index.checked_sub(1)
}

impl PortEngine for DummyPorts {
    fn register_port(
        &self,
        name: &str,
        kind: DataType,
        direction: PortDirection,
    ) -> Result<PortHandle> {
        let mut slots = self.slots.write();
        if slots.iter().flatten().any(|port| port.name == name) {
            bail!("port '{name}' already exists");
        }
        let id = u32::try_from(slots.len()).context("port table is full")?;
        let (audio, midi) = match kind {
            DataType::Audio => (vec![0.0; MAX_BUFFER_SIZE as usize], MidiBuffer::with_capacity(1)),
            DataType::Midi => (Vec::new(), MidiBuffer::with_capacity(MIDI_EVENTS_PER_CYCLE)),
        };
        slots.push(Some(DummyPort {
            name: name.to_owned(),
            kind,
            direction,
            physical: None,
            audio: Mutex::new(audio),
            midi: Mutex::new(midi),
        }));
        Ok(PortHandle(id))
    }

    fn unregister_port(&self, port: PortHandle) {
        if let Some(slot) = self.slots.write().get_mut(port.0 as usize) {
            *slot = None;
        }
    }

    fn connect(&self, port: PortHandle, physical: &str) -> Result<()> {
        let mut slots = self.slots.write();
        let entry = slots
            .get_mut(port.0 as usize)
            .and_then(Option::as_mut)
            .ok_or_else(|| anyhow!("unknown {port}"))?;
        let channel = self
            .physical_channel(entry.kind, entry.direction, physical)
            .ok_or_else(|| anyhow!("'{}' cannot connect to '{physical}'", entry.name))?;
        entry.physical = Some(channel);
        Ok(())
    }

    fn physical_ports(&self, kind: DataType, direction: PortDirection) -> Vec<String> {
        match (kind, direction) {
            (DataType::Audio, PortDirection::Input) => (1..=self.inputs())
                .map(|ch| format!("{PHYSICAL_CAPTURE}{ch}"))
                .collect(),
            (DataType::Audio, PortDirection::Output) => (1..=self.outputs())
                .map(|ch| format!("{PHYSICAL_PLAYBACK}{ch}"))
                .collect(),
            (DataType::Midi, PortDirection::Input) => vec![PHYSICAL_MIDI_CAPTURE.to_owned()],
            (DataType::Midi, PortDirection::Output) => vec![PHYSICAL_MIDI_PLAYBACK.to_owned()],
        }
    }

    fn latency_range(&self, port: PortHandle, _for_playback: bool) -> LatencyRange {
        let slots = self.slots.read();
        let Some(entry) = slots.get(port.0 as usize).and_then(Option::as_ref) else {
            return LatencyRange::default();
        };
        if entry.physical.is_none() {
            return LatencyRange::default();
        }
        match entry.direction {
            PortDirection::Input => LatencyRange::fixed(self.systemic_input.load(Ordering::Relaxed)),
            PortDirection::Output => {
                LatencyRange::fixed(self.systemic_output.load(Ordering::Relaxed))
            }
        }
    }

    fn with_audio_io(
        &self,
        input: PortHandle,
        output: PortHandle,
        nframes: u32,
        f: &mut dyn FnMut(&[f32], &mut [f32]),
    ) -> bool {
        if input == output {
            return false;
        }
        let slots = self.slots.read();
        let lookup = |handle: PortHandle, direction: PortDirection| {
            slots
                .get(handle.0 as usize)
                .and_then(Option::as_ref)
                .filter(|port| port.kind == DataType::Audio && port.direction == direction)
        };
        let (Some(input), Some(output)) = (
            lookup(input, PortDirection::Input),
            lookup(output, PortDirection::Output),
        ) else {
            return false;
        };
        let captured = input.audio.lock();
        let mut played = output.audio.lock();
        let frames = (nframes as usize).min(captured.len()).min(played.len());
        f(&captured[..frames], &mut played[..frames]);
        true
    }

    fn with_midi_io(
        &self,
        input: PortHandle,
        output: PortHandle,
        _nframes: u32,
        f: &mut dyn FnMut(&[MidiEvent], &mut MidiBuffer),
    ) -> bool {
        if input == output {
            return false;
        }
        let slots = self.slots.read();
        let lookup = |handle: PortHandle, direction: PortDirection| {
            slots
                .get(handle.0 as usize)
                .and_then(Option::as_ref)
                .filter(|port| port.kind == DataType::Midi && port.direction == direction)
        };
        let (Some(input), Some(output)) = (
            lookup(input, PortDirection::Input),
            lookup(output, PortDirection::Output),
        ) else {
            return false;
        };
        let captured = input.midi.lock();
        let mut played = output.midi.lock();
        f(captured.events(), &mut played);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{CycleFailure, EngineResult};

    #[derive(Default)]
    struct CountingHost {
        cycles: AtomicU64,
        frames: AtomicU64,
        buffer_changes: AtomicU32,
        halted: AtomicBool,
    }

    impl BackendHost for CountingHost {
        fn process(&self, nframes: u32) -> Result<(), CycleFailure> {
            self.cycles.fetch_add(1, Ordering::SeqCst);
            self.frames.fetch_add(u64::from(nframes), Ordering::SeqCst);
            Ok(())
        }
        fn buffer_size_change(&self, _frames: u32) {
            self.buffer_changes.fetch_add(1, Ordering::SeqCst);
        }
        fn sample_rate_change(&self, _rate: u32) {}
        fn freewheel_callback(&self, _on: bool) {}
        fn port_registration_callback(&self) -> EngineResult<()> {
            Ok(())
        }
        fn latency_callback(&self, _for_playback: bool) {}
        fn halted_callback(&self, _reason: &str) {
            self.halted.store(true, Ordering::SeqCst);
        }
        fn xrun_callback(&self) {}
        fn device_error_callback(&self) {}
        fn timebase_callback(&self, _: TransportState, _: u32, _: u64, _: bool) {}
        fn sync_callback(&self, _: TransportState, _: u64) -> bool {
            true
        }
        fn thread_init_callback(&self) {}
        fn request_backend_reset(&self) {}
        fn request_device_list_update(&self) {}
    }

    fn backend_with(host: &Arc<CountingHost>, device: &str, options: &str) -> DummyBackend {
        let host: Arc<dyn BackendHost> = host.clone();
        DummyBackend::new(Arc::downgrade(&host), device, options).unwrap()
    }

    #[test]
    fn options_parse_latency_and_speed() {
        let options = DummyOptions::parse("latency=256, speed=4").unwrap();
        assert_eq!(options.loopback_latency, 256);
        assert!((options.speed - 4.0).abs() < f64::EPSILON);
        assert_eq!(DummyOptions::parse("").unwrap(), DummyOptions::default());

        assert!(DummyOptions::parse("speed=0").is_err());
        assert!(DummyOptions::parse("speed=1e-300").is_err());
        assert!(DummyOptions::parse("speed=inf").is_err());
        assert!(DummyOptions::parse("speed=0.01").is_ok());
        assert!(DummyOptions::parse("latency=abc").is_err());
        assert!(DummyOptions::parse("colour=blue").is_err());
        assert!(DummyOptions::parse("latency").is_err());
    }

    #[test]
    fn calibration_pins_the_period() {
        let host = Arc::new(CountingHost::default());
        let backend = backend_with(&host, "Loopback", "");
        backend.set_buffer_size(256).unwrap();
        backend.configure_for_latency_measurement(true).unwrap();

        assert!(backend.set_buffer_size(512).is_err());
        assert!(backend.set_sample_rate(44_100).is_err());
        backend.set_buffer_size(256).unwrap();
        assert_eq!(backend.buffer_size(), 256);

        backend.configure_for_latency_measurement(false).unwrap();
        backend.set_buffer_size(512).unwrap();
        backend.set_sample_rate(44_100).unwrap();
        assert_eq!(backend.stream_config().sample_rate, 44_100);
    }

    #[test]
    fn unknown_device_is_rejected() {
        let host = Arc::new(CountingHost::default());
        let host: Arc<dyn BackendHost> = host;
        assert!(DummyBackend::new(Arc::downgrade(&host), "Theremin", "").is_err());
    }

    #[test]
    fn delay_line_returns_delayed_signal() {
        let mut line = DelayLine::new(64);
        let mut out = [0.0; 8];
        for cycle in 0..4u64 {
            let start = cycle * 8;
            line.read(start, 12, &mut out);
            line.clear_span(start, 8);
            let ramp: Vec<f32> = (0..8).map(|i| (start + i) as f32).collect();
            line.mix(start, &ramp);
            if cycle == 3 {
                // frame 24 + i was written 12 frames earlier
                let expected: Vec<f32> = (0..8).map(|i| (24 + i - 12) as f32).collect();
                assert_eq!(out.to_vec(), expected);
            }
        }
    }

    #[test]
    fn setters_validate_and_call_back_between_cycles() {
        let host = Arc::new(CountingHost::default());
        let backend = backend_with(&host, "Silence", "");
        assert!(backend.set_sample_rate(12_345).is_err());
        assert!(backend.set_buffer_size(1000).is_err());
        assert!(backend.set_buffer_size(16_384).is_err());

        backend.set_buffer_size(256).unwrap();
        assert_eq!(backend.buffer_size(), 256);
        assert_eq!(host.buffer_changes.load(Ordering::SeqCst), 1);
        assert_eq!(backend.available_buffer_sizes("").first(), Some(&16));
        assert_eq!(backend.available_buffer_sizes("").last(), Some(&8192));
    }

    #[test]
    fn clocked_thread_runs_until_stopped() {
        let host = Arc::new(CountingHost::default());
        let backend = backend_with(&host, "Noise", "speed=16");
        backend.set_buffer_size(64).unwrap();
        backend.start(false).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while host.cycles.load(Ordering::SeqCst) < 8 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        backend.stop().unwrap();

        let cycles = host.cycles.load(Ordering::SeqCst);
        assert!(cycles >= 8);
        assert_eq!(backend.sample_time(), cycles * 64);
        assert!(!host.halted.load(Ordering::SeqCst));
        thread::sleep(Duration::from_millis(20));
        assert_eq!(host.cycles.load(Ordering::SeqCst), cycles);
    }

    #[test]
    fn physical_ports_follow_channel_counts() {
        let host = Arc::new(CountingHost::default());
        let backend = backend_with(&host, "", "");
        backend.set_input_channels(3).unwrap();
        let ports = backend.port_engine();
        assert_eq!(
            ports.physical_ports(DataType::Audio, PortDirection::Input),
            ["system:capture_1", "system:capture_2", "system:capture_3"]
        );

        let input = ports
            .register_port("probe_in", DataType::Audio, PortDirection::Input)
            .unwrap();
        assert!(ports.connect(input, "system:playback_1").is_err());
        assert!(ports.connect(input, "system:capture_4").is_err());
        ports.connect(input, "system:capture_3").unwrap();
        backend.set_systemic_input_latency(32).unwrap();
        assert_eq!(ports.latency_range(input, false), LatencyRange::fixed(32));
        assert!(ports
            .register_port("probe_in", DataType::Audio, PortDirection::Input)
            .is_err());
    }
}
