//! Multi-tone delay measurement.
//!
//! Thirteen sine tones are played simultaneously. The phase of the highest
//! tone gives the delay modulo 16 frames; each further tone resolves one more
//! bit from its phase difference against the first, for a range of 65536
//! frames.

use std::f64::consts::TAU;

use thiserror::Error;

const TONES: usize = 13;
/// Phase increments in 1/65536 of a cycle per frame.
const STEPS: [u32; TONES] = [
    4096, 2048, 3072, 2560, 2304, 2176, 1088, 1312, 1552, 1800, 3332, 3586, 3841,
];
const REFERENCE_LEVEL: f32 = 0.2;
const TONE_LEVEL: f32 = 0.01;
/// Frames accumulated between filter updates.
const BLOCK: u32 = 16;
const LOWPASS_HZ: f64 = 200.0;
const MIN_MAGNITUDE: f64 = 0.001;
/// Per-bit phase error above which a window cannot be resolved at all.
const ABORT_ERROR: f64 = 0.4;
const DENORMAL_GUARD: f64 = 1e-20;

#[derive(Debug, Error, Clone, Copy, PartialEq)]
pub enum ResolveError {
    #[error("no test signal on the input")]
    NoSignal,
    #[error("phase error {0:.3} too large to resolve")]
    PhaseError(f64),
}

#[derive(Clone, Copy, Default)]
struct Tone {
    phase: u32,
    step: u32,
    xa: f64,
    ya: f64,
    x1: f64,
    y1: f64,
    x2: f64,
    y2: f64,
}

impl Tone {
    fn angle(&self) -> f64 {
        self.y2.atan2(self.x2) / TAU
    }
}

pub struct Mtdm {
    tones: [Tone; TONES],
    count: u32,
    wlp: f64,
    inverted: bool,
    delay: f64,
    error: f64,
}

impl Mtdm {
    pub fn new(sample_rate: u32) -> Self {
        let mut tones = [Tone::default(); TONES];
        for (tone, step) in tones.iter_mut().zip(STEPS) {
            tone.step = step;
            tone.phase = 128;
        }
        Self {
            tones,
            count: 0,
            wlp: LOWPASS_HZ / f64::from(sample_rate.max(1)),
            inverted: false,
            delay: 0.0,
            error: 0.0,
        }
    }

    /// Correlates `input` against the tones and writes the next block of the
    /// test signal to `output`.
    pub fn process(&mut self, input: &[f32], output: &mut [f32]) {
        for (vip, vop) in input.iter().zip(output.iter_mut()) {
            let vip = f64::from(*vip);
            let mut out = 0.0f32;
            for (index, tone) in self.tones.iter_mut().enumerate() {
                let angle = TAU * f64::from(tone.phase & 0xffff) / 65536.0;
                tone.phase = tone.phase.wrapping_add(tone.step);
                let c = angle.cos();
                let s = -angle.sin();
                let level = if index == 0 { REFERENCE_LEVEL } else { TONE_LEVEL };
                out += level * s as f32;
                tone.xa += s * vip;
                tone.ya += c * vip;
            }
            *vop = out;

            self.count += 1;
            if self.count == BLOCK {
                self.count = 0;
                let wlp = self.wlp;
                for tone in &mut self.tones {
                    tone.x1 += wlp * (tone.xa - tone.x1 + DENORMAL_GUARD);
                    tone.y1 += wlp * (tone.ya - tone.y1 + DENORMAL_GUARD);
                    tone.x2 += wlp * (tone.x1 - tone.x2 + DENORMAL_GUARD);
                    tone.y2 += wlp * (tone.y1 - tone.y2 + DENORMAL_GUARD);
                    tone.xa = 0.0;
                    tone.ya = 0.0;
                }
            }
        }
    }

    /// Resolves the current delay in frames from the filtered correlations.
    pub fn resolve(&mut self) -> Result<f64, ResolveError> {
        let reference = self.tones[0];
        if reference.x2.hypot(reference.y2) < MIN_MAGNITUDE {
            return Err(ResolveError::NoSignal);
        }
        let mut d = reference.angle();
        if self.inverted {
            d += 0.5;
        }
        if d > 0.5 {
            d -= 1.0;
        }

        let f0 = f64::from(reference.step);
        let mut weight = 1.0;
        self.error = 0.0;
        for tone in &self.tones[1..] {
            let mut p = tone.angle() - d * f64::from(tone.step) / f0;
            if self.inverted {
                p += 0.5;
            }
            p -= p.floor();
            p *= 2.0;
            let k = p.round();
            let e = (p - k).abs();
            self.error = self.error.max(e);
            if e > ABORT_ERROR {
                return Err(ResolveError::PhaseError(e));
            }
            if (k as i64) & 1 == 1 {
                d += weight;
            }
            weight *= 2.0;
        }
        self.delay = f64::from(BLOCK) * d;
        Ok(self.delay)
    }

    /// Last successfully resolved delay.
    pub fn delay(&self) -> f64 {
        self.delay
    }

    /// Worst per-bit phase error of the last resolve.
    pub fn error(&self) -> f64 {
        self.error
    }

    pub fn inverted(&self) -> bool {
        self.inverted
    }

    /// Toggles the polarity assumed for the return path.
    pub fn invert(&mut self) {
        self.inverted = !self.inverted;
    }
}
