use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};

const CONFIG_DIR: &str = "cadenza";
const CONFIG_FILE: &str = "engine.json";

/// Tunables for the engine core. Every field has a default so partial JSON
/// documents are accepted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Monitor-input checks per second of processed audio.
    pub monitor_check_hz: u32,
    /// Cycles of silence after each start. `None` derives the count from the
    /// stream: `max(4, (sample_rate / buffer_size) / 8)`.
    pub startup_silence_cycles: Option<u32>,
    /// Emit `BecameSilent` after this many seconds of processing.
    pub silence_after_seconds: Option<u64>,
    pub session_removal_fade_ms: u32,
    pub event_channel_capacity: usize,
    pub pending_port_capacity: usize,
    pub metrics_history: usize,
    /// `SCHED_FIFO` priority for threads created with
    /// `create_process_thread`. `None` leaves them in the default class.
    pub process_thread_priority: Option<i32>,
    pub latency: LatencyConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            monitor_check_hz: 10,
            startup_silence_cycles: None,
            silence_after_seconds: None,
            session_removal_fade_ms: 500,
            event_channel_capacity: 1024,
            pending_port_capacity: 256,
            metrics_history: 512,
            process_thread_priority: Some(70),
            latency: LatencyConfig::default(),
        }
    }
}

/// Convergence parameters for the loopback latency detectors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LatencyConfig {
    /// Detector run time before the first window is evaluated.
    pub settle_ms: u32,
    /// Consecutive agreeing windows required for an audio result.
    pub stable_windows: u32,
    /// Largest per-bit phase error for a window to count as valid.
    pub max_phase_error: f64,
    /// Processed audio after which a measurement is declared timed out.
    pub timeout_ms: u32,
    pub midi_min_samples: u32,
    pub midi_max_stddev: f64,
}

impl Default for LatencyConfig {
    fn default() -> Self {
        Self {
            settle_ms: 500,
            stable_windows: 4,
            max_phase_error: 0.3,
            timeout_ms: 10_000,
            midi_min_samples: 16,
            midi_max_stddev: 2.0,
        }
    }
}

impl EngineConfig {
    pub fn from_json_str(data: &str) -> EngineResult<Self> {
        let config: Self =
            serde_json::from_str(data).map_err(|err| EngineError::Config(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> EngineResult<Self> {
        let path = path.as_ref();
        let data = fs::read_to_string(path)
            .map_err(|err| EngineError::Config(format!("{}: {err}", path.display())))?;
        Self::from_json_str(&data)
    }

    /// Reads `<config dir>/cadenza/engine.json`, falling back to defaults when
    /// the file is missing or malformed.
    pub fn load_or_default() -> Self {
        let Some(path) = Self::default_path() else {
            return Self::default();
        };
        if !path.exists() {
            return Self::default();
        }
        match Self::load(&path) {
            Ok(config) => config,
            Err(err) => {
                tracing::warn!(path = %path.display(), %err, "ignoring engine configuration");
                Self::default()
            }
        }
    }

    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join(CONFIG_DIR).join(CONFIG_FILE))
    }

    pub fn validate(&self) -> EngineResult<()> {
        if self.monitor_check_hz == 0 {
            return Err(EngineError::Config("monitor_check_hz must be positive".into()));
        }
        if self.event_channel_capacity == 0 {
            return Err(EngineError::Config(
                "event_channel_capacity must be positive".into(),
            ));
        }
        if self.pending_port_capacity == 0 {
            return Err(EngineError::Config(
                "pending_port_capacity must be positive".into(),
            ));
        }
        if self.latency.stable_windows == 0 {
            return Err(EngineError::Config(
                "latency.stable_windows must be positive".into(),
            ));
        }
        if !(0.0..0.5).contains(&self.latency.max_phase_error) {
            return Err(EngineError::Config(
                "latency.max_phase_error must lie in [0, 0.5)".into(),
            ));
        }
        Ok(())
    }

    /// Cycles of startup silence for the given stream shape.
    pub fn startup_cycles(&self, sample_rate: u32, buffer_size: u32) -> u32 {
        self.startup_silence_cycles
            .unwrap_or_else(|| (sample_rate / buffer_size.max(1) / 8).max(4))
    }

    pub(crate) fn monitor_check_interval(&self, sample_rate: u32) -> u64 {
        u64::from(sample_rate / self.monitor_check_hz.max(1))
    }

    pub(crate) fn ms_to_frames(ms: u32, sample_rate: u32) -> u64 {
        u64::from(ms) * u64::from(sample_rate) / 1000
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn partial_documents_keep_defaults() {
        let config = EngineConfig::from_json_str(r#"{ "monitor_check_hz": 20 }"#).unwrap();
        assert_eq!(config.monitor_check_hz, 20);
        assert_eq!(config.latency, LatencyConfig::default());
        assert_eq!(config.session_removal_fade_ms, 500);
    }

    #[test]
    fn invalid_values_are_rejected() {
        let err = EngineConfig::from_json_str(r#"{ "monitor_check_hz": 0 }"#).unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));

        let err =
            EngineConfig::from_json_str(r#"{ "latency": { "max_phase_error": 0.7 } }"#).unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));
    }

    #[test]
    fn load_reads_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "startup_silence_cycles": 0, "silence_after_seconds": 30 }}"#).unwrap();
        let config = EngineConfig::load(file.path()).unwrap();
        assert_eq!(config.startup_silence_cycles, Some(0));
        assert_eq!(config.silence_after_seconds, Some(30));
    }

    #[test]
    fn startup_cycles_follow_stream_shape() {
        let config = EngineConfig::default();
        assert_eq!(config.startup_cycles(48_000, 1024), 5);
        assert_eq!(config.startup_cycles(48_000, 4096), 4);
        let fixed = EngineConfig {
            startup_silence_cycles: Some(0),
            ..EngineConfig::default()
        };
        assert_eq!(fixed.startup_cycles(48_000, 64), 0);
    }
}
