use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use cadenza_engine::{AudioEngine, BackendHost, EngineConfig, Session};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

#[derive(Default)]
struct CountingSession {
    frames: AtomicU64,
}

impl Session for CountingSession {
    fn process(&self, nframes: u32) -> bool {
        self.frames.fetch_add(u64::from(nframes), Ordering::Relaxed);
        true
    }
}

fn engine() -> Arc<AudioEngine> {
    let config = EngineConfig {
        startup_silence_cycles: Some(0),
        process_thread_priority: None,
        ..EngineConfig::default()
    };
    let engine = AudioEngine::new(config).expect("engine");
    engine.discover_builtin().expect("builtin backends");
    engine.select("dummy", "Silence", "").expect("select dummy");
    engine
}

// The backend is selected but never started: the benchmark thread drives the
// callback itself.
fn process_callback(c: &mut Criterion) {
    let mut group = c.benchmark_group("process_callback");
    group.measurement_time(Duration::from_secs(5));

    for frames in [64_u32, 256, 1024] {
        let engine = engine();
        group.bench_with_input(BenchmarkId::new("no_session", frames), &frames, |b, &n| {
            b.iter(|| engine.process(black_box(n)).expect("cycle"));
        });

        engine.set_session(Arc::new(CountingSession::default()));
        group.bench_with_input(BenchmarkId::new("session", frames), &frames, |b, &n| {
            b.iter(|| engine.process(black_box(n)).expect("cycle"));
        });
        engine.remove_session();
    }

    group.finish();
}

criterion_group!(benches, process_callback);
criterion_main!(benches);
