mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use cadenza_engine::{
    AudioEngine, EngineConfig, EngineError, LatencyConfig, LatencyMode, LatencyStatus,
    MeasurementKind,
};
use common::{dummy_engine, test_config, wait_until, RecordingSession, TIMEOUT};

fn loopback_engine(latency: u32) -> Arc<AudioEngine> {
    let config = EngineConfig {
        latency: LatencyConfig {
            settle_ms: 200,
            timeout_ms: 60_000,
            ..LatencyConfig::default()
        },
        ..test_config()
    };
    let engine = dummy_engine(config, "Loopback", &format!("latency={latency},speed=16"));
    engine.set_buffer_size(512).unwrap();
    engine
}

#[test]
fn measurement_requires_configured_ports() {
    let engine = loopback_engine(0);
    assert_eq!(
        engine.start_latency_detection(MeasurementKind::Audio),
        Err(EngineError::LatencyPortsNotConfigured)
    );
    assert_eq!(engine.latency_mode(), LatencyMode::None);
    assert!(!engine.running());
}

#[test]
fn measurement_requires_a_backend() {
    let engine = AudioEngine::new(test_config()).unwrap();
    engine.set_latency_input_port("system:capture_1");
    engine.set_latency_output_port("system:playback_1");
    assert_eq!(
        engine.start_latency_detection(MeasurementKind::Midi),
        Err(EngineError::NoBackendAvailable)
    );
}

#[test]
fn audio_round_trip_is_measured() {
    let engine = loopback_engine(256);
    engine.set_latency_input_port("system:capture_1");
    engine.set_latency_output_port("system:playback_1");
    engine.start_latency_detection(MeasurementKind::Audio).unwrap();
    assert_eq!(engine.latency_mode(), LatencyMode::Audio);
    assert!(engine.running());
    assert_eq!(
        engine.start_latency_detection(MeasurementKind::Audio),
        Err(EngineError::LatencyMeasurementInProgress)
    );

    assert!(wait_until(TIMEOUT, || engine.latency_status() == LatencyStatus::Converged));
    // one period of device buffering plus the configured loopback delay
    let measured = engine.latency_signal_delay().unwrap();
    assert!(measured.abs_diff(512 + 256) <= 1, "measured {measured}");

    engine.stop_latency_detection();
    assert_eq!(engine.latency_mode(), LatencyMode::None);
    assert_eq!(engine.latency_status(), LatencyStatus::Idle);
    assert_eq!(engine.latency_signal_delay(), Some(measured));
    // the engine was stopped before the measurement and is stopped again
    assert!(!engine.running());
}

#[test]
fn midi_round_trip_is_measured() {
    let engine = loopback_engine(100);
    engine.set_latency_input_port("system:midi_capture_1");
    engine.set_latency_output_port("system:midi_playback_1");
    engine.start_latency_detection(MeasurementKind::Midi).unwrap();
    assert_eq!(engine.latency_mode(), LatencyMode::Midi);

    assert!(wait_until(TIMEOUT, || engine.latency_status() == LatencyStatus::Converged));
    assert_eq!(engine.latency_signal_delay(), Some(512 + 100));
    engine.stop_latency_detection();
    assert_eq!(engine.latency_signal_delay(), Some(612));
}

#[test]
fn measurement_suspends_and_restores_a_running_session() {
    let engine = loopback_engine(0);
    let session = Arc::new(RecordingSession::default());
    engine.set_session(session.clone());
    engine.start(false).unwrap();
    assert!(wait_until(TIMEOUT, || session.cycles() > 2));

    engine.set_latency_input_port("system:midi_capture_1");
    engine.set_latency_output_port("system:midi_playback_1");
    engine.set_systemic_input_latency(32).unwrap();
    engine.set_systemic_output_latency(16).unwrap();
    engine.start_latency_detection(MeasurementKind::Midi).unwrap();
    assert_eq!(engine.loopback_systemic_latency(), 48);

    // the session is not processed while the detector owns the cycle
    let cycles = session.cycles();
    assert!(wait_until(TIMEOUT, || engine.latency_status() == LatencyStatus::Converged));
    assert_eq!(session.cycles(), cycles);

    let before = engine.start_count();
    engine.stop_latency_detection();
    assert!(engine.running());
    assert_eq!(engine.start_count(), before + 1);
    assert!(wait_until(TIMEOUT, || session.cycles() > cycles));

    // the queued probe ports are released on the next maintenance pass
    engine.stop(false).unwrap();
    assert_eq!(engine.pending_port_deletions(), 0);
}

#[test]
fn session_removed_during_measurement_detaches_at_once() {
    let engine = loopback_engine(0);
    let session = Arc::new(RecordingSession::default());
    engine.set_session(session.clone());
    engine.start(false).unwrap();
    assert!(wait_until(TIMEOUT, || session.cycles() > 2));

    engine.set_latency_input_port("system:midi_capture_1");
    engine.set_latency_output_port("system:midi_playback_1");
    engine.start_latency_detection(MeasurementKind::Midi).unwrap();

    let started = Instant::now();
    engine.remove_session();
    assert!(started.elapsed() < Duration::from_secs(1), "{:?}", started.elapsed());
    assert!(engine.session().is_none());
    assert!(session.detached.load(Ordering::SeqCst));
    // the session was not running, so there was nothing to fade
    assert!(session.gains.lock().is_empty());

    assert!(wait_until(TIMEOUT, || engine.latency_status() == LatencyStatus::Converged));
    engine.stop_latency_detection();
    assert!(engine.running());
    engine.stop(false).unwrap();
}

#[test]
fn unknown_physical_port_aborts_the_measurement() {
    let engine = loopback_engine(0);
    engine.set_latency_input_port("system:capture_9");
    engine.set_latency_output_port("system:playback_1");
    assert!(matches!(
        engine.start_latency_detection(MeasurementKind::Audio),
        Err(EngineError::Port(_))
    ));
    assert_eq!(engine.latency_mode(), LatencyMode::None);
    assert!(!engine.running());

    // the failed attempt left nothing behind
    engine.set_latency_input_port("system:capture_1");
    engine.start_latency_detection(MeasurementKind::Audio).unwrap();
    engine.stop_latency_detection();
}

#[test]
fn stopping_the_engine_ends_the_measurement() {
    let engine = loopback_engine(0);
    engine.set_latency_input_port("system:midi_capture_1");
    engine.set_latency_output_port("system:midi_playback_1");
    engine.start_latency_detection(MeasurementKind::Midi).unwrap();
    engine.stop(false).unwrap();
    assert_eq!(engine.latency_mode(), LatencyMode::None);
    assert_eq!(engine.latency_status(), LatencyStatus::Idle);
    engine.start_latency_detection(MeasurementKind::Midi).unwrap();
    engine.stop_latency_detection();
}
