//! Strom - low-latency producer/consumer audio pipeline.
//!
//! A background [`Engine`] generates audio from an [`AudioSource`] and writes it into
//! a lock-free shared [`RingBuffer`]. A [`RenderConsumer`], driven by the platform's
//! real-time audio callback, drains the ring once per quantum and holds the last
//! sample whenever the ring runs dry.
//!
//! The engine is controlled through a message [`channel`]: the [`Controller`] sends
//! [`Command`]s and receives [`Response`]s, and the [`EngineRunner`] serves them on
//! the production thread between ticks.
//!
//! ```no_run
//! use strom::{channel, Engine, EngineConfig, EngineRunner, RenderConsumer, SourceType};
//!
//! let config = EngineConfig::default();
//! let (mut controller, endpoint) = channel(config.command_capacity);
//! let runner = EngineRunner::spawn(Engine::new(config.clone()), endpoint).unwrap();
//! let (mut render, mut attacher) = RenderConsumer::new(config.channels);
//!
//! controller.init(48_000, SourceType::Oscillator).unwrap();
//! controller.start().unwrap();
//! // ... once `controller.poll()` has seen `Initialized`:
//! if let Some(consumer) = controller.buffer().and_then(|b| b.consumer()) {
//!     attacher.attach(consumer).unwrap();
//! }
//!
//! let mut quantum = [0.0f32; 256];
//! render.render(&mut quantum);
//! runner.shutdown();
//! ```

pub mod config;
pub mod control;
pub mod engine;
pub mod error;
pub mod render;
pub mod ring;
pub mod runner;
pub mod sink;
pub mod source;

pub use config::EngineConfig;
pub use control::{
    channel, Command, Controller, EngineEndpoint, Envelope, LoadReport, Reply, Request, RequestId,
    Response,
};
pub use engine::{Engine, EngineState};
pub use error::{ControlError, EngineError, EngineResult};
pub use render::{Attacher, RenderConsumer, DEFAULT_QUANTUM_FRAMES, UNDERRUN_LOG_INTERVAL};
pub use ring::{Consumer, Producer, RingBuffer};
pub use runner::EngineRunner;
pub use source::{
    AudioFile, AudioSource, BatchSummary, DefaultSourceFactory, FileOutcome, Generate, MixPolicy,
    MultiTrackPlayer, Oscillator, SourceFactory, SourceType, Track, TrackInfo,
};

#[cfg(feature = "cpal_sink")]
pub use error::OutputError;
#[cfg(feature = "cpal_sink")]
pub use sink::CpalSink;
