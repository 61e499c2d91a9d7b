//! Audio sources feeding the ring buffer.
//!
//! An engine is built around exactly one [`AudioSource`]. The variant is chosen at
//! `init` and never changes; switching source type means building a new engine.
//!
//! - [`Oscillator`] - sine tone with a settable frequency
//! - [`MultiTrackPlayer`] - mixes decoded audio files, each with its own playhead

use std::fmt;

use tracing::trace;

use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::ring::Producer;

pub mod decode;
#[cfg(feature = "opus")]
pub mod opus;
pub mod oscillator;
pub mod player;

pub use decode::{AudioFile, DecodedAudio};
pub use oscillator::{Oscillator, DEFAULT_FREQUENCY};
pub use player::{
    BatchSummary, FileOutcome, MixPolicy, MultiTrackPlayer, Track, TrackInfo, DEFAULT_MIX_CEILING,
};

/// Something that fills interleaved sample blocks.
pub trait Generate {
    /// Overwrite `out` with the next `out.len() / channels` frames.
    fn render(&mut self, out: &mut [f32], channels: usize);

    /// `true` once the source has nothing left to play.
    fn is_exhausted(&self) -> bool;
}

/// The kind of source an engine was initialized with.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SourceType {
    Oscillator,
    MultiTrackPlayer,
}

impl fmt::Display for SourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceType::Oscillator => f.write_str("oscillator"),
            SourceType::MultiTrackPlayer => f.write_str("multi-track player"),
        }
    }
}

#[enum_delegate::implement(Generate, pub trait Generate { fn render(&mut self, out: &mut [f32], channels: usize); fn is_exhausted(&self) -> bool; })]
#[derive(Clone, Debug)]
pub enum AudioSource {
    Oscillator(Oscillator),
    Player(MultiTrackPlayer),
}

impl AudioSource {
    pub fn source_type(&self) -> SourceType {
        match self {
            AudioSource::Oscillator(_) => SourceType::Oscillator,
            AudioSource::Player(_) => SourceType::MultiTrackPlayer,
        }
    }

    /// Generate `frames` frames and write them into the ring.
    ///
    /// `scratch` is reused between calls so a steady block size never allocates.
    /// Returns the number of samples written.
    pub fn process(
        &mut self,
        frames: usize,
        producer: &mut Producer,
        scratch: &mut Vec<f32>,
    ) -> usize {
        let channels = producer.channels();
        scratch.resize(frames * channels, 0.0);
        self.render(scratch, channels);

        let written = producer.write(scratch);
        trace!(frames, written, "produced block");
        written
    }

    pub fn set_frequency(&mut self, frequency: f32) -> EngineResult<()> {
        match self {
            AudioSource::Oscillator(osc) => osc.set_frequency(frequency),
            AudioSource::Player(_) => Err(wrong_type(
                "setFrequency",
                SourceType::Oscillator,
                SourceType::MultiTrackPlayer,
            )),
        }
    }

    pub fn load_file(&mut self, file: AudioFile) -> EngineResult<TrackInfo> {
        match self {
            AudioSource::Player(player) => player.load_file(file),
            AudioSource::Oscillator(_) => Err(wrong_type(
                "loadAudioFile",
                SourceType::MultiTrackPlayer,
                SourceType::Oscillator,
            )),
        }
    }

    pub fn load_files(&mut self, files: Vec<AudioFile>) -> EngineResult<BatchSummary> {
        match self {
            AudioSource::Player(player) => Ok(player.load_files(files)),
            AudioSource::Oscillator(_) => Err(wrong_type(
                "loadAudioFiles",
                SourceType::MultiTrackPlayer,
                SourceType::Oscillator,
            )),
        }
    }

    pub fn reset(&mut self) -> EngineResult<()> {
        match self {
            AudioSource::Player(player) => {
                player.reset();
                Ok(())
            }
            AudioSource::Oscillator(_) => Err(wrong_type(
                "reset",
                SourceType::MultiTrackPlayer,
                SourceType::Oscillator,
            )),
        }
    }

    /// Move playback to `seconds` from the start. Returns the target frame.
    pub fn seek(&mut self, seconds: f64) -> EngineResult<usize> {
        match self {
            AudioSource::Player(player) => player.seek_to_time(seconds),
            AudioSource::Oscillator(_) => Err(wrong_type(
                "seek",
                SourceType::MultiTrackPlayer,
                SourceType::Oscillator,
            )),
        }
    }
}

fn wrong_type(operation: &'static str, needs: SourceType, has: SourceType) -> EngineError {
    EngineError::unsupported(
        operation,
        format!("needs a {} source, engine has a {} source", needs, has),
    )
}

/// Builds the source an engine is initialized with.
///
/// Hosts that package the engine differently can supply their own factory.
pub trait SourceFactory: Send {
    fn create(
        &self,
        source_type: SourceType,
        sample_rate: u32,
        config: &EngineConfig,
    ) -> EngineResult<AudioSource>;
}

/// Builds the crate's own [`Oscillator`] and [`MultiTrackPlayer`].
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultSourceFactory;

impl SourceFactory for DefaultSourceFactory {
    fn create(
        &self,
        source_type: SourceType,
        sample_rate: u32,
        config: &EngineConfig,
    ) -> EngineResult<AudioSource> {
        if sample_rate == 0 {
            return Err(EngineError::InitializationFailure(
                "sample rate must be non-zero".into(),
            ));
        }

        Ok(match source_type {
            SourceType::Oscillator => Oscillator::new(sample_rate).into(),
            SourceType::MultiTrackPlayer => MultiTrackPlayer::new(config.channels, sample_rate)
                .with_mix_policy(config.mix_policy)
                .into(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ring::RingBuffer;

    fn create(source_type: SourceType) -> AudioSource {
        DefaultSourceFactory
            .create(source_type, 48_000, &EngineConfig::default())
            .unwrap()
    }

    #[test]
    fn factory_builds_requested_type() {
        assert_eq!(create(SourceType::Oscillator).source_type(), SourceType::Oscillator);
        assert_eq!(
            create(SourceType::MultiTrackPlayer).source_type(),
            SourceType::MultiTrackPlayer
        );
    }

    #[test]
    fn factory_rejects_zero_sample_rate() {
        let err = DefaultSourceFactory
            .create(SourceType::Oscillator, 0, &EngineConfig::default())
            .unwrap_err();
        assert!(matches!(err, EngineError::InitializationFailure(_)));
    }

    #[test]
    fn process_writes_whole_block() {
        let ring = RingBuffer::new(256, 2).unwrap();
        let mut producer = ring.producer().unwrap();
        let mut source = create(SourceType::Oscillator);
        let mut scratch = Vec::with_capacity(128);

        assert_eq!(source.process(64, &mut producer, &mut scratch), 128);
        assert_eq!(ring.frames_to_read(), 64);
    }

    #[test]
    fn operations_check_the_source_type() {
        let mut player = create(SourceType::MultiTrackPlayer);
        assert!(matches!(
            player.set_frequency(330.0),
            Err(EngineError::UnsupportedOperation { operation: "setFrequency", .. })
        ));
        assert!(player.reset().is_ok());

        let mut osc = create(SourceType::Oscillator);
        assert!(osc.set_frequency(330.0).is_ok());
        assert!(matches!(
            osc.reset(),
            Err(EngineError::UnsupportedOperation { operation: "reset", .. })
        ));
        assert!(matches!(
            osc.load_files(vec![]),
            Err(EngineError::UnsupportedOperation { .. })
        ));
        assert!(matches!(
            osc.seek(1.0),
            Err(EngineError::UnsupportedOperation { operation: "seek", .. })
        ));
        assert_eq!(player.seek(0.5), Ok(24_000));
    }

    #[test]
    fn oscillator_never_runs_dry() {
        let mut source = create(SourceType::Oscillator);
        let mut out = [0.0f32; 32];
        source.render(&mut out, 2);
        assert!(!source.is_exhausted());
        assert!(create(SourceType::MultiTrackPlayer).is_exhausted());
    }
}
