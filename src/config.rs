//! Engine configuration

use std::time::Duration;

use crate::source::MixPolicy;

/// Default production period.
pub const DEFAULT_TICK_PERIOD: Duration = Duration::from_millis(5);

/// Default ring capacity in frames (~42ms at 48kHz).
pub const DEFAULT_CAPACITY_FRAMES: usize = 2048;

/// Default number of interleaved output channels.
pub const DEFAULT_CHANNELS: usize = 2;

/// How much faster than real time each tick produces, as a ratio (1.5x).
pub const PRODUCTION_MARGIN: (u128, u128) = (3, 2);

/// Default depth of each control queue.
pub const DEFAULT_COMMAND_CAPACITY: usize = 64;

/// Settings shared by the engine, its runner and the control channel.
///
/// The sample rate is not part of the configuration: it arrives with `init`.
#[derive(Clone, Debug, PartialEq)]
pub struct EngineConfig {
    pub channels: usize,
    pub capacity_frames: usize,
    pub tick_period: Duration,
    /// Explicit frames per tick; derived from the sample rate when `None`.
    pub frames_per_tick: Option<usize>,
    pub mix_policy: MixPolicy,
    pub command_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            channels: DEFAULT_CHANNELS,
            capacity_frames: DEFAULT_CAPACITY_FRAMES,
            tick_period: DEFAULT_TICK_PERIOD,
            frames_per_tick: None,
            mix_policy: MixPolicy::default(),
            command_capacity: DEFAULT_COMMAND_CAPACITY,
        }
    }
}

impl EngineConfig {
    /// Set the number of output channels (1 or 2)
    pub fn with_channels(mut self, channels: usize) -> Self {
        self.channels = channels;
        self
    }

    /// Set the ring capacity in frames
    pub fn with_capacity_frames(mut self, frames: usize) -> Self {
        self.capacity_frames = frames;
        self
    }

    /// Set the production period
    pub fn with_tick_period(mut self, period: Duration) -> Self {
        self.tick_period = period;
        self
    }

    /// Produce a fixed number of frames per tick instead of deriving it
    pub fn with_frames_per_tick(mut self, frames: usize) -> Self {
        self.frames_per_tick = Some(frames);
        self
    }

    pub fn with_mix_policy(mut self, policy: MixPolicy) -> Self {
        self.mix_policy = policy;
        self
    }

    pub fn with_command_capacity(mut self, capacity: usize) -> Self {
        self.command_capacity = capacity;
        self
    }

    /// Frames generated on every tick at `sample_rate`.
    ///
    /// Covers one period plus [`PRODUCTION_MARGIN`], so production stays ahead of the
    /// render callback despite scheduling jitter. Never exceeds half the ring.
    pub fn frames_per_tick(&self, sample_rate: u32) -> usize {
        let derived = self.frames_per_tick.unwrap_or_else(|| {
            let (num, den) = PRODUCTION_MARGIN;
            let scaled = sample_rate as u128 * self.tick_period.as_nanos() * num;
            let per_tick = den * 1_000_000_000;
            ((scaled + per_tick - 1) / per_tick) as usize
        });
        derived.clamp(1, (self.capacity_frames / 2).max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derives_frames_per_tick_from_rate() {
        let config = EngineConfig::default();
        // 48000 * 0.005 * 1.5
        assert_eq!(config.frames_per_tick(48_000), 360);
        assert_eq!(config.frames_per_tick(44_100), 331);
    }

    #[test]
    fn explicit_frames_are_bounded_by_the_ring() {
        let config = EngineConfig::default()
            .with_capacity_frames(256)
            .with_frames_per_tick(1000);
        assert_eq!(config.frames_per_tick(48_000), 128);
    }
}
