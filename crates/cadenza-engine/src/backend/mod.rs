//! Driver backends and the hooks they call back into.
//!
//! A backend owns the device and its process thread(s). The engine drives it
//! through [`AudioBackend`] and receives cycles and device notifications
//! through [`BackendHost`], which backends hold as a `Weak` reference.

use std::fmt;
use std::sync::{Arc, Weak};

use anyhow::{anyhow, Result};

use crate::error::{CycleFailure, EngineResult};
use crate::ports::{DataType, PortEngine};

#[cfg(feature = "dummy")]
pub mod dummy;
pub mod registry;
pub mod safety;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StreamConfig {
    pub sample_rate: u32,
    pub buffer_frames: u32,
    pub in_channels: u32,
    pub out_channels: u32,
    pub interleaved: bool,
}

impl StreamConfig {
    pub fn new(
        sample_rate: u32,
        buffer_frames: u32,
        in_channels: u32,
        out_channels: u32,
        interleaved: bool,
    ) -> Self {
        Self {
            sample_rate,
            buffer_frames,
            in_channels,
            out_channels,
            interleaved,
        }
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self::new(48_000, 1024, 2, 2, false)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TransportState {
    Stopped,
    Starting,
    Rolling,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceStatus {
    pub name: String,
    pub available: bool,
}

impl DeviceStatus {
    pub fn new(name: impl Into<String>, available: bool) -> Self {
        Self {
            name: name.into(),
            available,
        }
    }
}

/// What a backend supports, reported before it is instantiated.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BackendCapabilities {
    pub realtime: bool,
    pub requires_driver_selection: bool,
    pub can_change_sample_rate_when_running: bool,
    pub can_change_buffer_size_when_running: bool,
    pub can_set_systemic_latency: bool,
    pub has_control_app: bool,
}

/// A driver connection. Every method takes `&self`; implementations are
/// shared between the control thread and their own process thread.
pub trait AudioBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Starts the process thread. `for_latency` asks for the most
    /// deterministic buffering the device offers.
    fn start(&self, for_latency: bool) -> Result<()>;

    /// Stops the process thread and waits for it to exit.
    fn stop(&self) -> Result<()>;

    /// Requests freewheeling. The backend acknowledges through
    /// [`BackendHost::freewheel_callback`].
    fn freewheel(&self, on: bool) -> Result<()>;

    /// Fraction of the cycle period spent processing, in `0.0..=1.0`.
    fn dsp_load(&self) -> f32;

    fn transport_start(&self) {}

    fn transport_stop(&self) {}

    fn transport_state(&self) -> TransportState {
        TransportState::Stopped
    }

    fn transport_locate(&self, _position: u64) {}

    fn transport_sample(&self) -> u64 {
        0
    }

    fn set_time_master(&self, _yn: bool) -> Result<()> {
        Ok(())
    }

    fn device_name(&self) -> String;

    fn sample_rate(&self) -> u32;

    fn buffer_size(&self) -> u32;

    fn interleaved(&self) -> bool {
        false
    }

    fn input_channels(&self) -> u32;

    fn output_channels(&self) -> u32;

    fn systemic_input_latency(&self) -> u32 {
        0
    }

    fn systemic_output_latency(&self) -> u32 {
        0
    }

    fn available_sample_rates(&self, device: &str) -> Vec<u32>;

    fn available_buffer_sizes(&self, device: &str) -> Vec<u32>;

    fn set_device_name(&self, name: &str) -> Result<()>;

    fn set_sample_rate(&self, rate: u32) -> Result<()>;

    fn set_buffer_size(&self, frames: u32) -> Result<()>;

    fn set_interleaved(&self, yn: bool) -> Result<()>;

    fn set_input_channels(&self, channels: u32) -> Result<()>;

    fn set_output_channels(&self, channels: u32) -> Result<()>;

    fn set_systemic_input_latency(&self, frames: u32) -> Result<()>;

    fn set_systemic_output_latency(&self, frames: u32) -> Result<()>;

    /// Tears down and re-opens the current device.
    fn reset_device(&self) -> Result<()>;

    fn enumerate_devices(&self) -> Result<Vec<DeviceStatus>>;

    /// Asynchronous: port latencies are reported later through
    /// [`BackendHost::latency_callback`].
    fn update_latencies(&self);

    fn configure_for_latency_measurement(&self, _enable: bool) -> Result<()> {
        Ok(())
    }

    /// Frames processed since the backend started.
    fn sample_time(&self) -> u64;

    fn sample_time_at_cycle_start(&self) -> u64;

    fn samples_since_cycle_start(&self) -> u32;

    /// Offset of the current cycle against the device clock, if known.
    fn sync_offset(&self) -> Option<u32> {
        None
    }

    /// Size in bytes of one cycle's buffer for the given data type.
    fn raw_buffer_size(&self, kind: DataType) -> usize;

    fn is_realtime(&self) -> bool;

    fn client_real_time_priority(&self) -> Option<i32> {
        None
    }

    fn launch_control_app(&self) -> Result<()> {
        Err(anyhow!("{} has no device control application", self.name()))
    }

    fn port_engine(&self) -> &dyn PortEngine;

    fn stream_config(&self) -> StreamConfig {
        StreamConfig::new(
            self.sample_rate(),
            self.buffer_size(),
            self.input_channels(),
            self.output_channels(),
            self.interleaved(),
        )
    }
}

/// Entry points the engine exposes to the active backend.
pub trait BackendHost: Send + Sync {
    /// Runs one cycle. Called on the backend's process thread.
    fn process(&self, nframes: u32) -> Result<(), CycleFailure>;

    /// Delivered between cycles, never while one is executing.
    fn buffer_size_change(&self, frames: u32);

    /// Delivered between cycles, never while one is executing.
    fn sample_rate_change(&self, rate: u32);

    fn freewheel_callback(&self, on: bool);

    /// The backend's port set changed.
    fn port_registration_callback(&self) -> EngineResult<()>;

    fn latency_callback(&self, for_playback: bool);

    /// The device is gone. Must not call back into the backend.
    fn halted_callback(&self, reason: &str);

    fn xrun_callback(&self);

    fn device_error_callback(&self);

    fn timebase_callback(&self, state: TransportState, nframes: u32, position: u64, new_position: bool);

    fn sync_callback(&self, state: TransportState, position: u64) -> bool;

    /// Called once on every thread the backend creates for processing.
    fn thread_init_callback(&self);

    fn request_backend_reset(&self);

    fn request_device_list_update(&self);
}

/// Constructs backend instances.
pub trait BackendFactory: Send + Sync {
    /// `arg1`/`arg2` are backend specific, for example a device name and an
    /// option string.
    fn instantiate(
        &self,
        host: Weak<dyn BackendHost>,
        arg1: &str,
        arg2: &str,
    ) -> Result<Box<dyn AudioBackend>>;

    /// Whether the backend can run without any user configuration.
    fn already_configured(&self) -> bool {
        false
    }
}

#[derive(Clone)]
pub struct BackendDescriptor {
    pub name: String,
    pub capabilities: BackendCapabilities,
    pub factory: Arc<dyn BackendFactory>,
}

impl BackendDescriptor {
    pub fn new(
        name: impl Into<String>,
        capabilities: BackendCapabilities,
        factory: Arc<dyn BackendFactory>,
    ) -> Self {
        Self {
            name: name.into(),
            capabilities,
            factory,
        }
    }
}

impl fmt::Debug for BackendDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendDescriptor")
            .field("name", &self.name)
            .field("capabilities", &self.capabilities)
            .finish_non_exhaustive()
    }
}

/// A backend that was found but could not be loaded.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DiscoveryFailure {
    pub source: String,
    pub reason: String,
}

pub type Discovered = std::result::Result<BackendDescriptor, DiscoveryFailure>;

/// Locates backend implementations. An `Err` means the mechanism itself is
/// unavailable; individual load failures are returned as entries.
pub trait BackendDiscovery {
    fn discover(&self) -> Result<Vec<Discovered>>;
}

/// Discovery over backends compiled into the binary.
#[derive(Clone, Default)]
pub struct BuiltinBackends {
    extra: Vec<Discovered>,
}

impl BuiltinBackends {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, descriptor: BackendDescriptor) -> Self {
        self.extra.push(Ok(descriptor));
        self
    }

    pub fn with_failure(mut self, source: impl Into<String>, reason: impl Into<String>) -> Self {
        self.extra.push(Err(DiscoveryFailure {
            source: source.into(),
            reason: reason.into(),
        }));
        self
    }
}

impl BackendDiscovery for BuiltinBackends {
    fn discover(&self) -> Result<Vec<Discovered>> {
        let mut found = Vec::with_capacity(self.extra.len() + 1);
        #[cfg(feature = "dummy")]
        found.push(Ok(dummy::descriptor()));
        found.extend(self.extra.iter().cloned());
        Ok(found)
    }
}
