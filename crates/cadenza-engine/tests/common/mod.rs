#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use cadenza_engine::{AudioEngine, EngineConfig, EngineEvent, EventKind, Session, TransportState};
use crossbeam_channel::Receiver;
use parking_lot::Mutex;

pub const TIMEOUT: Duration = Duration::from_secs(10);

/// Session double that counts every call the engine makes.
#[derive(Default)]
pub struct RecordingSession {
    pub cycles: AtomicU64,
    pub frames: AtomicU64,
    pub freewheel_cycles: AtomicU64,
    pub monitor_checks: AtomicU64,
    pub sample_rate: AtomicU32,
    pub block_size: AtomicU32,
    pub attached: AtomicBool,
    pub detached: AtomicBool,
    pub halted: AtomicBool,
    pub midi_panics: AtomicU32,
    pub latency_updates: AtomicU32,
    pub timebase_calls: AtomicU32,
    pub sync_calls: AtomicU32,
    pub fail: AtomicBool,
    pub gains: Mutex<Vec<f32>>,
}

impl Session for RecordingSession {
    fn process(&self, nframes: u32) -> bool {
        self.cycles.fetch_add(1, Ordering::SeqCst);
        self.frames.fetch_add(u64::from(nframes), Ordering::SeqCst);
        !self.fail.load(Ordering::SeqCst)
    }

    fn freewheel(&self, nframes: u32) -> bool {
        self.freewheel_cycles.fetch_add(1, Ordering::SeqCst);
        self.frames.fetch_add(u64::from(nframes), Ordering::SeqCst);
        true
    }

    fn set_sample_rate(&self, rate: u32) {
        self.sample_rate.store(rate, Ordering::SeqCst);
    }

    fn set_block_size(&self, frames: u32) {
        self.block_size.store(frames, Ordering::SeqCst);
    }

    fn check_monitoring(&self) {
        self.monitor_checks.fetch_add(1, Ordering::SeqCst);
    }

    fn attached(&self, sample_rate: u32, block_size: u32) {
        self.set_sample_rate(sample_rate);
        self.set_block_size(block_size);
        self.attached.store(true, Ordering::SeqCst);
    }

    fn detached(&self) {
        self.detached.store(true, Ordering::SeqCst);
    }

    fn update_latency(&self, _for_playback: bool) {
        self.latency_updates.fetch_add(1, Ordering::SeqCst);
    }

    fn set_output_gain(&self, gain: f32) {
        self.gains.lock().push(gain);
    }

    fn midi_panic(&self) {
        self.midi_panics.fetch_add(1, Ordering::SeqCst);
    }

    fn engine_halted(&self) {
        self.halted.store(true, Ordering::SeqCst);
    }

    fn timebase(&self, _state: TransportState, _nframes: u32, _position: u64, _new_position: bool) {
        self.timebase_calls.fetch_add(1, Ordering::SeqCst);
    }

    fn sync(&self, _state: TransportState, _position: u64) -> bool {
        self.sync_calls.fetch_add(1, Ordering::SeqCst);
        true
    }
}

impl RecordingSession {
    pub fn cycles(&self) -> u64 {
        self.cycles.load(Ordering::SeqCst)
    }
}

/// Defaults suited to tests: no startup silence and no realtime promotion.
pub fn test_config() -> EngineConfig {
    EngineConfig {
        startup_silence_cycles: Some(0),
        process_thread_priority: None,
        ..EngineConfig::default()
    }
}

pub fn dummy_engine(config: EngineConfig, device: &str, options: &str) -> Arc<AudioEngine> {
    let engine = AudioEngine::new(config).expect("engine");
    engine.discover_builtin().expect("builtin backends");
    engine.select("dummy", device, options).expect("select dummy");
    engine
}

pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    condition()
}

/// Next event of `kind`, skipping others.
pub fn next_of_kind(rx: &Receiver<EngineEvent>, kind: EventKind, timeout: Duration) -> Option<EngineEvent> {
    let deadline = Instant::now() + timeout;
    loop {
        let remaining = deadline.checked_duration_since(Instant::now())?;
        match rx.recv_timeout(remaining) {
            Ok(event) if event.kind() == kind => return Some(event),
            Ok(_) => {}
            Err(_) => return None,
        }
    }
}

/// Collects whatever arrives within `window`.
pub fn collect_for(rx: &Receiver<EngineEvent>, window: Duration) -> Vec<EngineEvent> {
    let deadline = Instant::now() + window;
    let mut events = Vec::new();
    while let Some(remaining) = deadline.checked_duration_since(Instant::now()) {
        match rx.recv_timeout(remaining) {
            Ok(event) => events.push(event),
            Err(_) => break,
        }
    }
    events
}
