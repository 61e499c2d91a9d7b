//! Sine wave oscillator

use core::f32::consts::TAU;

use tracing::warn;

use crate::error::{EngineError, EngineResult};
use crate::source::Generate;

/// Frequency a new oscillator starts at (A4).
pub const DEFAULT_FREQUENCY: f32 = 440.0;

/// A sine oscillator writing the same signal to every output channel.
///
/// Phase is kept in radians within `[0, 2π)` and advances continuously across
/// ticks. A frequency change applies from the next frame on without any phase
/// correction, so abrupt changes can click.
#[derive(Clone, Debug)]
pub struct Oscillator {
    phase: f32,
    frequency: f32,
    sample_rate: u32,
}

impl Oscillator {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            phase: 0.0,
            frequency: DEFAULT_FREQUENCY,
            sample_rate,
        }
    }

    /// Start at `frequency` instead of [`DEFAULT_FREQUENCY`]. Invalid values are
    /// ignored with a warning.
    pub fn with_frequency(mut self, frequency: f32) -> Self {
        if let Err(e) = self.set_frequency(frequency) {
            warn!("keeping {} Hz: {}", self.frequency, e);
        }
        self
    }

    /// Phase advance per frame, in radians.
    #[inline]
    fn phase_increment(&self, frequency: f32) -> f32 {
        TAU * (frequency / self.sample_rate as f32)
    }

    #[inline]
    pub fn frequency(&self) -> f32 {
        self.frequency
    }

    #[inline]
    pub fn phase(&self) -> f32 {
        self.phase
    }

    #[inline]
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Change the frequency, effective on the next generated frame.
    pub fn set_frequency(&mut self, frequency: f32) -> EngineResult<()> {
        if !frequency.is_finite() || frequency < 0.0 {
            return Err(EngineError::InvalidInput(format!(
                "frequency must be a finite, non-negative number of Hz, got {}",
                frequency
            )));
        }
        if !self.phase_increment(frequency).is_finite() {
            return Err(EngineError::InvalidInput(format!(
                "{} Hz cannot be generated at a sample rate of {}",
                frequency, self.sample_rate
            )));
        }
        self.frequency = frequency;
        Ok(())
    }
}

impl Generate for Oscillator {
    fn render(&mut self, out: &mut [f32], channels: usize) {
        let phase_inc = self.phase_increment(self.frequency);
        if !phase_inc.is_finite() {
            // only reachable with a zero sample rate
            out.fill(0.0);
            return;
        }

        for frame in out.chunks_mut(channels.max(1)) {
            frame.fill(self.phase.sin());

            self.phase += phase_inc;
            if self.phase >= TAU {
                self.phase %= TAU;
            }
        }
    }

    fn is_exhausted(&self) -> bool {
        false
    }
}
