//! The producing side of the pipeline.
//!
//! An [`Engine`] owns one [`AudioSource`] and the writing half of one
//! [`RingBuffer`], both created at `init`. While running, every [`tick`](Engine::tick)
//! generates a fixed-size block and writes it into the ring. Commands arrive through
//! [`Engine::handle`], or in bulk from an [`EngineEndpoint`] via [`Engine::serve`].

use std::fmt;

use tracing::{debug, error, info, trace, warn};

use crate::config::EngineConfig;
use crate::control::{Command, EngineEndpoint, Envelope, LoadReport, Response};
use crate::error::{EngineError, EngineResult};
use crate::ring::{Producer, RingBuffer};
use crate::source::{
    AudioFile, AudioSource, BatchSummary, DefaultSourceFactory, SourceFactory, SourceType,
    TrackInfo,
};

/// Lifecycle of an engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EngineState {
    Uninitialized,
    Initializing,
    Ready,
    Running,
    Stopped,
    Failed,
}

impl EngineState {
    /// `true` once a source and ring exist.
    #[inline]
    pub fn is_initialized(self) -> bool {
        matches!(
            self,
            EngineState::Ready | EngineState::Running | EngineState::Stopped
        )
    }
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EngineState::Uninitialized => "uninitialized",
            EngineState::Initializing => "initializing",
            EngineState::Ready => "ready",
            EngineState::Running => "running",
            EngineState::Stopped => "stopped",
            EngineState::Failed => "failed",
        };
        f.write_str(name)
    }
}

const CONFIGURED: &[EngineState] = &[
    EngineState::Ready,
    EngineState::Running,
    EngineState::Stopped,
];

/// Everything created by a successful `init`.
struct Pipeline {
    source: AudioSource,
    producer: Producer,
    sample_rate: u32,
    frames_per_tick: usize,
    /// Reused block buffer, sized for one tick.
    scratch: Vec<f32>,
}

/// Produces audio into a ring buffer on a fixed schedule.
pub struct Engine {
    config: EngineConfig,
    state: EngineState,
    pipeline: Option<Pipeline>,
    factory: Box<dyn SourceFactory>,
    ticks: u64,
    skipped_ticks: u64,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Self {
        Self::with_factory(config, DefaultSourceFactory)
    }

    /// Build sources through `factory` instead of the built-in one.
    pub fn with_factory(config: EngineConfig, factory: impl SourceFactory + 'static) -> Self {
        Self {
            config,
            state: EngineState::Uninitialized,
            pipeline: None,
            factory: Box::new(factory),
            ticks: 0,
            skipped_ticks: 0,
        }
    }

    #[inline]
    pub fn state(&self) -> EngineState {
        self.state
    }

    #[inline]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn source_type(&self) -> Option<SourceType> {
        self.pipeline.as_ref().map(|p| p.source.source_type())
    }

    pub fn source(&self) -> Option<&AudioSource> {
        self.pipeline.as_ref().map(|p| &p.source)
    }

    /// The shared buffer handle, once initialized.
    pub fn buffer(&self) -> Option<&RingBuffer> {
        self.pipeline.as_ref().map(|p| p.producer.ring())
    }

    pub fn sample_rate(&self) -> Option<u32> {
        self.pipeline.as_ref().map(|p| p.sample_rate)
    }

    pub fn frames_per_tick(&self) -> Option<usize> {
        self.pipeline.as_ref().map(|p| p.frames_per_tick)
    }

    /// Ticks that produced a block.
    #[inline]
    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    /// Ticks skipped because the block would not have fit.
    #[inline]
    pub fn skipped_ticks(&self) -> u64 {
        self.skipped_ticks
    }

    /// Apply one command and build its response.
    pub fn handle(&mut self, command: Command) -> Response {
        let operation = command.name();
        debug!(operation, state = %self.state, "handling command");

        let response = match command {
            Command::Init {
                sample_rate,
                source_type,
            } => {
                let result = self.init(sample_rate, source_type);
                Response::Initialized {
                    source_type: self.source_type().unwrap_or(source_type),
                    result,
                }
            }
            Command::Start => Response::Started(self.start()),
            Command::Stop => Response::Stopped(self.stop()),
            Command::SetFrequency { frequency } => {
                Response::FrequencySet(self.set_frequency(frequency))
            }
            Command::LoadAudioFile { file } => {
                Response::AudioFileReceived(self.load_file(file).map(|info| LoadReport::Single {
                    file_name: info.name,
                    frames: info.frames,
                }))
            }
            Command::LoadAudioFiles { files } => {
                Response::AudioFileReceived(self.load_files(files).map(LoadReport::Batch))
            }
            Command::Reset => Response::Reset(self.reset()),
            Command::Seek { seconds } => Response::Seeked(self.seek(seconds)),
        };

        if let Some(err) = response.error() {
            warn!(operation, state = %self.state, "command failed: {}", err);
        }
        response
    }

    /// Handle every command waiting on `endpoint` and send back the responses.
    ///
    /// A command is only taken off the queue while its response has somewhere to
    /// go; once the response queue is full the rest wait for the next call.
    /// Returns the number of commands handled.
    pub fn serve(&mut self, endpoint: &mut EngineEndpoint) -> usize {
        let mut handled = 0;
        while endpoint.can_reply() {
            let Some(Envelope { id, body }) = endpoint.recv() else {
                break;
            };
            let response = self.handle(body);
            if let Err(e) = endpoint.reply(Envelope { id, body: response }) {
                warn!(id = %id, "could not deliver response: {}", e);
            }
            handled += 1;
        }
        if !endpoint.can_reply() {
            trace!(handled, "response queue full, leaving commands queued");
        }
        handled
    }

    /// Create the source and the ring buffer.
    ///
    /// Calling this again once initialized changes nothing and returns the existing
    /// buffer handle.
    pub fn init(&mut self, sample_rate: u32, source_type: SourceType) -> EngineResult<RingBuffer> {
        if let Some(pipeline) = self.pipeline.as_ref().filter(|_| self.state.is_initialized()) {
            let existing = pipeline.source.source_type();
            if existing != source_type {
                warn!(
                    requested = %source_type,
                    existing = %existing,
                    "engine already initialized with another source type, keeping it"
                );
            }
            return Ok(pipeline.producer.ring().clone());
        }

        self.state = EngineState::Initializing;
        match self.build_pipeline(sample_rate, source_type) {
            Ok(pipeline) => {
                let ring = pipeline.producer.ring().clone();
                info!(
                    source = %source_type,
                    sample_rate,
                    ring = ring.id(),
                    capacity_frames = ring.capacity_frames(),
                    frames_per_tick = pipeline.frames_per_tick,
                    "engine ready"
                );
                self.pipeline = Some(pipeline);
                self.state = EngineState::Ready;
                Ok(ring)
            }
            Err(e) => {
                error!(source = %source_type, sample_rate, "engine initialization failed: {}", e);
                self.pipeline = None;
                self.state = EngineState::Failed;
                Err(e)
            }
        }
    }

    fn build_pipeline(&self, sample_rate: u32, source_type: SourceType) -> EngineResult<Pipeline> {
        let source = self.factory.create(source_type, sample_rate, &self.config)?;

        let ring = RingBuffer::new(self.config.capacity_frames, self.config.channels)
            .map_err(|e| EngineError::InitializationFailure(e.to_string()))?;
        let producer = ring.producer().ok_or_else(|| {
            EngineError::InitializationFailure("ring buffer producer already claimed".into())
        })?;

        let frames_per_tick = self.config.frames_per_tick(sample_rate);
        Ok(Pipeline {
            source,
            producer,
            sample_rate,
            frames_per_tick,
            scratch: Vec::with_capacity(frames_per_tick * self.config.channels),
        })
    }

    /// Begin producing on every tick.
    pub fn start(&mut self) -> EngineResult<RingBuffer> {
        let ring = self
            .pipeline_for("start", &[EngineState::Ready, EngineState::Stopped])?
            .producer
            .ring()
            .clone();
        self.state = EngineState::Running;
        info!(ring = ring.id(), "engine started");
        Ok(ring)
    }

    /// Stop producing. Samples already in the ring keep draining.
    pub fn stop(&mut self) -> EngineResult<()> {
        self.pipeline_for("stop", &[EngineState::Running])?;
        self.state = EngineState::Stopped;
        info!("engine stopped");
        Ok(())
    }

    pub fn set_frequency(&mut self, frequency: f32) -> EngineResult<()> {
        self.pipeline_for("setFrequency", CONFIGURED)?
            .source
            .set_frequency(frequency)?;
        debug!(frequency, "frequency set");
        Ok(())
    }

    pub fn load_file(&mut self, file: AudioFile) -> EngineResult<TrackInfo> {
        self.pipeline_for("loadAudioFile", CONFIGURED)?
            .source
            .load_file(file)
    }

    pub fn load_files(&mut self, files: Vec<AudioFile>) -> EngineResult<BatchSummary> {
        self.pipeline_for("loadAudioFiles", CONFIGURED)?
            .source
            .load_files(files)
    }

    /// Rewind every loaded track.
    pub fn reset(&mut self) -> EngineResult<()> {
        self.pipeline_for("reset", CONFIGURED)?.source.reset()
    }

    /// Move every loaded track to `seconds` from its start.
    pub fn seek(&mut self, seconds: f64) -> EngineResult<usize> {
        self.pipeline_for("seek", CONFIGURED)?.source.seek(seconds)
    }

    /// Run one production period.
    ///
    /// Produces a block if the engine is running and the block fits into the ring's
    /// free space; a block that would not fit is skipped whole. Returns the number of
    /// samples written.
    pub fn tick(&mut self) -> usize {
        if self.state != EngineState::Running {
            return 0;
        }
        let Some(Pipeline {
            source,
            producer,
            frames_per_tick,
            scratch,
            ..
        }) = self.pipeline.as_mut()
        else {
            return 0;
        };

        if producer.frames_to_write() < *frames_per_tick {
            self.skipped_ticks += 1;
            trace!(
                free_frames = producer.frames_to_write(),
                frames_per_tick = *frames_per_tick,
                "ring full, skipping tick"
            );
            return 0;
        }

        self.ticks += 1;
        source.process(*frames_per_tick, producer, scratch)
    }

    fn pipeline_for(
        &mut self,
        operation: &'static str,
        allowed: &[EngineState],
    ) -> EngineResult<&mut Pipeline> {
        if !allowed.contains(&self.state) {
            return Err(EngineError::unsupported(
                operation,
                format!("not valid while the engine is {}", self.state),
            ));
        }
        self.pipeline.as_mut().ok_or_else(|| {
            EngineError::unsupported(operation, "engine has no source".to_string())
        })
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("state", &self.state)
            .field("source_type", &self.source_type())
            .field("buffer", &self.buffer())
            .field("ticks", &self.ticks)
            .field("skipped_ticks", &self.skipped_ticks)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::decode::tests::wav_bytes;
    use crate::source::Generate;

    fn ready(source_type: SourceType) -> Engine {
        let mut engine = Engine::default();
        engine.init(48_000, source_type).unwrap();
        engine
    }

    #[test]
    fn init_builds_pipeline() {
        let mut engine = Engine::default();
        assert_eq!(engine.state(), EngineState::Uninitialized);

        let ring = engine.init(48_000, SourceType::Oscillator).unwrap();
        assert_eq!(engine.state(), EngineState::Ready);
        assert_eq!(engine.source_type(), Some(SourceType::Oscillator));
        assert_eq!(engine.buffer(), Some(&ring));
        assert_eq!(ring.capacity_frames(), engine.config().capacity_frames);
        assert_eq!(engine.frames_per_tick(), Some(360));
    }

    #[test]
    fn failed_init_can_be_retried() {
        let mut engine = Engine::default();
        assert!(matches!(
            engine.init(0, SourceType::Oscillator),
            Err(EngineError::InitializationFailure(_))
        ));
        assert_eq!(engine.state(), EngineState::Failed);
        assert!(engine.buffer().is_none());

        assert!(engine.start().is_err());
        assert!(engine.init(44_100, SourceType::Oscillator).is_ok());
        assert_eq!(engine.state(), EngineState::Ready);
    }

    #[test]
    fn bad_ring_geometry_fails_init() {
        let mut engine = Engine::new(EngineConfig::default().with_channels(3));
        let err = engine.init(48_000, SourceType::Oscillator).unwrap_err();
        assert!(matches!(err, EngineError::InitializationFailure(_)));
        assert_eq!(engine.state(), EngineState::Failed);
    }

    #[test]
    fn repeated_init_returns_same_handle_and_keeps_running() {
        let mut engine = ready(SourceType::Oscillator);
        let first = engine.buffer().cloned().unwrap();
        engine.start().unwrap();
        engine.tick();

        let again = engine.init(48_000, SourceType::MultiTrackPlayer).unwrap();
        assert_eq!(again, first);
        assert_eq!(engine.state(), EngineState::Running);
        assert_eq!(engine.source_type(), Some(SourceType::Oscillator));

        match engine.handle(Command::Init {
            sample_rate: 48_000,
            source_type: SourceType::MultiTrackPlayer,
        }) {
            Response::Initialized {
                result: Ok(ring),
                source_type,
            } => {
                assert_eq!(ring, first);
                assert_eq!(source_type, SourceType::Oscillator);
            }
            other => panic!("unexpected response {:?}", other),
        }
    }

    #[test]
    fn start_and_stop_follow_the_state_table() {
        let mut engine = Engine::default();
        assert!(engine.start().is_err());
        assert!(engine.stop().is_err());

        engine.init(48_000, SourceType::Oscillator).unwrap();
        assert!(engine.stop().is_err());
        assert_eq!(engine.state(), EngineState::Ready);

        engine.start().unwrap();
        assert_eq!(engine.state(), EngineState::Running);
        assert!(matches!(
            engine.start(),
            Err(EngineError::UnsupportedOperation { operation: "start", .. })
        ));

        engine.stop().unwrap();
        assert_eq!(engine.state(), EngineState::Stopped);
        assert!(engine.stop().is_err());

        engine.start().unwrap();
        assert_eq!(engine.state(), EngineState::Running);
    }

    #[test]
    fn set_frequency_on_player_is_unsupported() {
        let mut engine = ready(SourceType::MultiTrackPlayer);
        engine.start().unwrap();

        let response = engine.handle(Command::SetFrequency { frequency: 330.0 });
        assert!(!response.is_success());
        assert!(matches!(
            response.error(),
            Some(EngineError::UnsupportedOperation { operation: "setFrequency", .. })
        ));
        assert_eq!(engine.state(), EngineState::Running);
    }

    #[test]
    fn player_operations_on_oscillator_are_unsupported() {
        let mut engine = ready(SourceType::Oscillator);
        for command in [
            Command::Reset,
            Command::LoadAudioFiles { files: vec![] },
            Command::LoadAudioFile {
                file: AudioFile::new("a.wav", wav_bytes(&[0], 1, 48_000)),
            },
        ] {
            let response = engine.handle(command);
            assert!(matches!(
                response.error(),
                Some(EngineError::UnsupportedOperation { .. })
            ));
        }
        assert_eq!(engine.state(), EngineState::Ready);
    }

    #[test]
    fn operations_before_init_are_unsupported() {
        let mut engine = Engine::default();
        assert!(matches!(
            engine.set_frequency(330.0),
            Err(EngineError::UnsupportedOperation { .. })
        ));
        assert!(engine.reset().is_err());
        assert_eq!(engine.state(), EngineState::Uninitialized);
    }

    #[test]
    fn ticks_only_while_running() {
        let mut engine = ready(SourceType::Oscillator);
        assert_eq!(engine.tick(), 0);

        engine.start().unwrap();
        assert_eq!(engine.tick(), 360 * 2);
        assert_eq!(engine.buffer().unwrap().frames_to_read(), 360);

        engine.stop().unwrap();
        assert_eq!(engine.tick(), 0);
        assert_eq!(engine.buffer().unwrap().frames_to_read(), 360);
    }

    #[test]
    fn skips_ticks_that_would_lap_the_reader() {
        let config = EngineConfig::default()
            .with_capacity_frames(100)
            .with_frames_per_tick(40);
        let mut engine = Engine::new(config);
        engine.init(48_000, SourceType::Oscillator).unwrap();
        engine.start().unwrap();

        assert_eq!(engine.tick(), 80);
        assert_eq!(engine.tick(), 80);
        // 80 frames queued, only 19 free
        assert_eq!(engine.tick(), 0);
        assert_eq!(engine.skipped_ticks(), 1);
        assert_eq!(engine.buffer().unwrap().frames_to_read(), 80);

        let mut consumer = engine.buffer().unwrap().consumer().unwrap();
        let mut out = vec![0.0f32; 80];
        consumer.read(&mut out);
        assert_eq!(engine.tick(), 80);
        assert_eq!(engine.ticks(), 3);
    }

    #[test]
    fn loads_and_resets_player_tracks() {
        let mut engine = ready(SourceType::MultiTrackPlayer);
        let response = engine.handle(Command::LoadAudioFile {
            file: AudioFile::new("a.wav", wav_bytes(&[16384; 32], 2, 48_000)),
        });
        assert_eq!(
            response,
            Response::AudioFileReceived(Ok(LoadReport::Single {
                file_name: "a.wav".into(),
                frames: 16,
            }))
        );

        engine.start().unwrap();
        engine.tick();
        assert!(engine.source().unwrap().is_exhausted());

        assert!(engine.handle(Command::Reset).is_success());
        assert!(!engine.source().unwrap().is_exhausted());
    }

    #[test]
    fn serve_waits_for_room_in_the_response_queue() {
        let (mut controller, mut endpoint) = crate::control::channel(2);
        let mut engine = Engine::default();

        controller.init(48_000, SourceType::Oscillator).unwrap();
        assert_eq!(engine.serve(&mut endpoint), 1);
        controller.poll();

        controller.set_frequency(100.0).unwrap();
        controller.set_frequency(200.0).unwrap();
        assert_eq!(engine.serve(&mut endpoint), 2);

        // both response slots are taken, so start must not run yet
        let start = controller.start().unwrap();
        assert!(!endpoint.can_reply());
        assert_eq!(engine.serve(&mut endpoint), 0);
        assert_eq!(engine.state(), EngineState::Ready);

        assert_eq!(controller.poll().len(), 2);
        assert_eq!(engine.serve(&mut endpoint), 1);
        let replies = controller.poll();
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].id, start);
        assert_eq!(engine.state(), EngineState::Running);
        assert_eq!(controller.state(), EngineState::Running);
    }

    #[test]
    fn seek_starts_player_mid_file() {
        let mut engine = Engine::new(
            EngineConfig::default()
                .with_channels(1)
                .with_frames_per_tick(4),
        );
        engine.init(8000, SourceType::MultiTrackPlayer).unwrap();
        let samples: Vec<i16> = (0..8000).map(|i| if i < 4000 { 0 } else { 16384 }).collect();
        engine
            .load_file(AudioFile::new("half.wav", wav_bytes(&samples, 1, 8000)))
            .unwrap();

        assert_eq!(
            engine.handle(Command::Seek { seconds: 0.5 }),
            Response::Seeked(Ok(4000))
        );
        engine.start().unwrap();
        engine.tick();

        let mut consumer = engine.buffer().unwrap().consumer().unwrap();
        let mut out = [0.0f32; 4];
        assert_eq!(consumer.read(&mut out), 4);
        assert_eq!(out, [0.5; 4]);

        let response = engine.handle(Command::Seek { seconds: -2.0 });
        assert!(matches!(response.error(), Some(EngineError::InvalidInput(_))));
    }

    #[test]
    fn custom_factory_is_used() {
        struct LoudOscillator;

        impl SourceFactory for LoudOscillator {
            fn create(
                &self,
                _source_type: SourceType,
                sample_rate: u32,
                _config: &EngineConfig,
            ) -> EngineResult<AudioSource> {
                Ok(crate::source::Oscillator::new(sample_rate)
                    .with_frequency(1000.0)
                    .into())
            }
        }

        let mut engine = Engine::with_factory(EngineConfig::default(), LoudOscillator);
        engine.init(48_000, SourceType::MultiTrackPlayer).unwrap();
        assert_eq!(engine.source_type(), Some(SourceType::Oscillator));
        match engine.source() {
            Some(AudioSource::Oscillator(osc)) => assert_eq!(osc.frequency(), 1000.0),
            other => panic!("unexpected source {:?}", other),
        }
    }
}
