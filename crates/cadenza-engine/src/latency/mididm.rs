//! MIDI round-trip timer.
//!
//! Every cycle sends one Song Position Pointer whose 14-bit payload is the
//! frame counter at the time of sending. A returning message yields the
//! round trip modulo 16384 frames.

use crate::ports::{MidiBuffer, MidiEvent};

const SONG_POSITION: u8 = 0xf2;
const STAMP_MASK: u64 = 0x3fff;

#[derive(Debug, Clone, Default)]
pub struct MidiDm {
    /// Frames processed since the detector was created.
    clock: u64,
    sent: u64,
    received: u64,
    count: u64,
    mean: f64,
    m2: f64,
    min: u64,
    max: u64,
}

impl MidiDm {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sends this cycle's stamp and times every returned stamp in `input`.
    pub fn process(&mut self, nframes: u32, input: &[MidiEvent], output: &mut MidiBuffer) {
        output.clear();
        let stamp = self.clock & STAMP_MASK;
        let message = [SONG_POSITION, (stamp & 0x7f) as u8, ((stamp >> 7) & 0x7f) as u8];
        if output.push(MidiEvent::new(0, &message)) {
            self.sent += 1;
        }

        for event in input {
            let bytes = event.bytes();
            if bytes.len() != 3 || bytes[0] != SONG_POSITION {
                continue;
            }
            let returned = u64::from(bytes[1] & 0x7f) | (u64::from(bytes[2] & 0x7f) << 7);
            let now = (self.clock + u64::from(event.time)) & STAMP_MASK;
            let delay = now.wrapping_sub(returned) & STAMP_MASK;
            self.record(delay);
        }
        self.clock += u64::from(nframes);
    }

    fn record(&mut self, delay: u64) {
        self.received += 1;
        self.count += 1;
        if self.count == 1 {
            self.min = delay;
            self.max = delay;
        } else {
            self.min = self.min.min(delay);
            self.max = self.max.max(delay);
        }
        let value = delay as f64;
        let delta = value - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (value - self.mean);
    }

    pub fn sent(&self) -> u64 {
        self.sent
    }

    pub fn received(&self) -> u64 {
        self.received
    }

    pub fn samples(&self) -> u64 {
        self.count
    }

    pub fn mean(&self) -> f64 {
        self.mean
    }

    pub fn stddev(&self) -> f64 {
        if self.count < 2 {
            return 0.0;
        }
        (self.m2 / (self.count - 1) as f64).sqrt()
    }

    pub fn min(&self) -> u64 {
        self.min
    }

    pub fn max(&self) -> u64 {
        self.max
    }

    /// Rounded mean delay once enough consistent returns were seen.
    pub fn converged(&self, min_samples: u32, max_stddev: f64) -> Option<u32> {
        if self.count < u64::from(min_samples) || self.stddev() > max_stddev {
            return None;
        }
        Some(self.mean.round() as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    #[test]
    fn measures_a_fixed_round_trip() {
        let mut dm = MidiDm::new();
        let nframes = 256u32;
        let delay = 700u64;
        let mut in_flight: VecDeque<(u64, MidiEvent)> = VecDeque::new();
        let mut output = MidiBuffer::with_capacity(8);
        let mut clock = 0u64;

        for _ in 0..64 {
            let mut input = Vec::new();
            while let Some(&(due, event)) = in_flight.front() {
                if due >= clock + u64::from(nframes) {
                    break;
                }
                in_flight.pop_front();
                input.push(MidiEvent {
                    time: (due - clock) as u32,
                    ..event
                });
            }
            dm.process(nframes, &input, &mut output);
            for event in output.events() {
                in_flight.push_back((clock + u64::from(event.time) + delay, *event));
            }
            clock += u64::from(nframes);
        }

        assert!(dm.received() > 16);
        assert_eq!(dm.min(), 700);
        assert_eq!(dm.max(), 700);
        assert_eq!(dm.converged(16, 2.0), Some(700));
    }

    #[test]
    fn needs_enough_consistent_samples() {
        let mut dm = MidiDm::new();
        for delay in [100, 300, 100, 300] {
            dm.record(delay);
        }
        assert_eq!(dm.converged(16, 2.0), None);
        assert_eq!(dm.converged(4, 2.0), None);
        assert!((dm.mean() - 200.0).abs() < f64::EPSILON);
    }

    #[test]
    fn other_messages_are_ignored() {
        let mut dm = MidiDm::new();
        let mut output = MidiBuffer::with_capacity(4);
        let noise = [MidiEvent::new(3, &[0x90, 60, 100]), MidiEvent::new(5, &[0xf8])];
        dm.process(128, &noise, &mut output);
        assert_eq!(dm.received(), 0);
        assert_eq!(dm.sent(), 1);
        assert_eq!(output.events()[0].bytes(), &[0xf2, 0, 0]);
    }
}
