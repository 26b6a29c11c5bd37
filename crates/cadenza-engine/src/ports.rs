//! Port-side collaborators.
//!
//! [`PortEngine`] is implemented by backends and owns the actual port buffers.
//! [`PortManager`] is the graph owner that reconciles connections and
//! latencies; the engine only forwards notifications to it.

use std::fmt;

use anyhow::Result;
use crossbeam_queue::ArrayQueue;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PortHandle(pub u32);

impl fmt::Display for PortHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "port#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataType {
    Audio,
    Midi,
}

/// Direction as seen by the engine: it reads from `Input` ports and writes
/// to `Output` ports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PortDirection {
    Input,
    Output,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LatencyRange {
    pub min: u32,
    pub max: u32,
}

impl LatencyRange {
    pub const fn fixed(frames: u32) -> Self {
        Self {
            min: frames,
            max: frames,
        }
    }
}

/// A short MIDI message stamped with its frame offset inside a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MidiEvent {
    pub time: u32,
    pub size: u8,
    pub data: [u8; 3],
}

impl MidiEvent {
    /// Builds an event from up to three bytes; longer messages are truncated.
    pub fn new(time: u32, bytes: &[u8]) -> Self {
        let size = bytes.len().min(3);
        let mut data = [0u8; 3];
        data[..size].copy_from_slice(&bytes[..size]);
        Self {
            time,
            size: size as u8,
            data,
        }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data[..usize::from(self.size)]
    }
}

/// Fixed-capacity MIDI event buffer. Pushing never reallocates.
#[derive(Debug, Clone)]
pub struct MidiBuffer {
    events: Vec<MidiEvent>,
}

impl MidiBuffer {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            events: Vec::with_capacity(capacity.max(1)),
        }
    }

    /// Appends an event, returning `false` when the buffer is full.
    #[inline]
    pub fn push(&mut self, event: MidiEvent) -> bool {
        if self.events.len() == self.events.capacity() {
            return false;
        }
        self.events.push(event);
        true
    }

    #[inline]
    pub fn clear(&mut self) {
        self.events.clear();
    }

    pub fn events(&self) -> &[MidiEvent] {
        &self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

/// Port registry and buffer access exposed by a backend.
pub trait PortEngine: Send + Sync {
    fn register_port(&self, name: &str, kind: DataType, direction: PortDirection)
        -> Result<PortHandle>;

    fn unregister_port(&self, port: PortHandle);

    /// Connects an engine port to a physical port by name.
    fn connect(&self, port: PortHandle, physical: &str) -> Result<()>;

    /// Names of the physical ports an engine port of the given direction can
    /// be connected to.
    fn physical_ports(&self, kind: DataType, direction: PortDirection) -> Vec<String>;

    fn latency_range(&self, port: PortHandle, for_playback: bool) -> LatencyRange;

    /// Runs `f` with the current cycle's buffers for an input/output pair.
    /// Returns `false` without calling `f` when either port is unknown.
    fn with_audio_io(
        &self,
        input: PortHandle,
        output: PortHandle,
        nframes: u32,
        f: &mut dyn FnMut(&[f32], &mut [f32]),
    ) -> bool;

    fn with_midi_io(
        &self,
        input: PortHandle,
        output: PortHandle,
        nframes: u32,
        f: &mut dyn FnMut(&[MidiEvent], &mut MidiBuffer),
    ) -> bool;
}

/// Graph owner notified by the engine. Every method defaults to a no-op.
pub trait PortManager: Send + Sync {
    /// The backend's port set changed; reconcile the connection graph.
    fn registration_changed(&self) -> Result<()> {
        Ok(())
    }

    fn update_latencies(&self, _for_playback: bool) {}

    fn cycle_start(&self, _nframes: u32) {}

    fn cycle_end(&self, _nframes: u32) {}

    fn silence_outputs(&self, _nframes: u32) {}

    /// Advance every port buffer by `offset` frames inside the current cycle.
    fn split_cycle(&self, _offset: u32) {}
}

#[derive(Debug, Default)]
pub struct NoopPortManager;

impl PortManager for NoopPortManager {}

/// Ports waiting to be unregistered outside the realtime path.
pub struct PendingPortDeletions {
    queue: ArrayQueue<PortHandle>,
}

impl PendingPortDeletions {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: ArrayQueue::new(capacity.max(1)),
        }
    }

    /// Queues a port. A full queue hands the port back to the caller.
    pub fn push(&self, port: PortHandle) -> Result<(), PortHandle> {
        self.queue.push(port)
    }

    /// Unregisters every queued port. Not realtime safe.
    pub fn drain(&self, ports: &dyn PortEngine) -> usize {
        let mut released = 0;
        while let Some(port) = self.queue.pop() {
            ports.unregister_port(port);
            released += 1;
        }
        released
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct RecordingPorts {
        released: Mutex<Vec<PortHandle>>,
    }

    impl PortEngine for RecordingPorts {
        fn register_port(&self, _: &str, _: DataType, _: PortDirection) -> Result<PortHandle> {
            Ok(PortHandle(0))
        }

        fn unregister_port(&self, port: PortHandle) {
            self.released.lock().push(port);
        }

        fn connect(&self, _: PortHandle, _: &str) -> Result<()> {
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

    #[test]
    fn midi_buffer_refuses_to_grow() {
        let mut buffer = MidiBuffer::with_capacity(2);
        assert!(buffer.push(MidiEvent::new(0, &[0x90, 60, 100])));
        assert!(buffer.push(MidiEvent::new(1, &[0x80, 60, 0])));
        assert!(!buffer.push(MidiEvent::new(2, &[0xf8])));
        assert_eq!(buffer.len(), 2);
        assert_eq!(buffer.events()[1].bytes(), &[0x80, 60, 0]);
    }

    #[test]
    fn pending_deletions_drain_in_order() {
        let pending = PendingPortDeletions::new(2);
        pending.push(PortHandle(3)).unwrap();
        pending.push(PortHandle(7)).unwrap();
        assert_eq!(pending.push(PortHandle(9)), Err(PortHandle(9)));

        let ports = RecordingPorts::default();
        assert_eq!(pending.drain(&ports), 2);
        assert!(pending.is_empty());
        assert_eq!(*ports.released.lock(), vec![PortHandle(3), PortHandle(7)]);
    }
}
