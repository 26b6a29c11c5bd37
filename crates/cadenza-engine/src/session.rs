use crate::backend::TransportState;

/// The mix-graph owner the engine drives once per cycle.
///
/// Every method is called with `&self`; implementations keep their own
/// interior state. `process`, `freewheel`, `set_output_gain`, `midi_panic`,
/// `check_monitoring`, `timebase` and `sync` run on the backend's process
/// thread and must not block.
pub trait Session: Send + Sync {
    /// Renders one cycle. Returning `false` fails the cycle.
    fn process(&self, nframes: u32) -> bool;

    /// Renders one cycle while the engine is detached from device timing.
    fn freewheel(&self, nframes: u32) -> bool {
        self.process(nframes)
    }

    fn set_sample_rate(&self, _sample_rate: u32) {}

    fn set_block_size(&self, _frames: u32) {}

    fn check_monitoring(&self) {}

    /// Called when the session is installed with `AudioEngine::set_session`.
    fn attached(&self, sample_rate: u32, block_size: u32) {
        self.set_sample_rate(sample_rate);
        self.set_block_size(block_size);
    }

    fn detached(&self) {}

    fn update_latency(&self, _for_playback: bool) {}

    /// Gain applied to the session's outputs; used for the removal fade.
    fn set_output_gain(&self, _gain: f32) {}

    fn midi_panic(&self) {}

    fn engine_halted(&self) {}

    fn timebase(&self, _state: TransportState, _nframes: u32, _position: u64, _new_position: bool) {}

    /// Asked while the transport is starting; `true` once the session is
    /// ready to roll.
    fn sync(&self, _state: TransportState, _position: u64) -> bool {
        true
    }
}
