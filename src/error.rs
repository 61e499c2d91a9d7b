//! Error types
//!
//! Engine-side failures travel back to the caller inside [`Response`](crate::Response)
//! payloads, so [`EngineError`] is `Clone` and carries owned strings only.

use thiserror::Error;

/// Errors produced by the engine, its sources and the ring buffer.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    /// No shared buffer could be created, or source setup failed.
    ///
    /// Moves the engine to [`EngineState::Failed`](crate::EngineState::Failed).
    #[error("initialization failed: {0}")]
    InitializationFailure(String),

    /// The operation is not valid for the current state or source type.
    ///
    /// Rejected locally with no state change.
    #[error("{operation} is not supported: {reason}")]
    UnsupportedOperation {
        operation: &'static str,
        reason: String,
    },

    /// Input rejected before any processing was attempted.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A single file could not be decoded.
    #[error("failed to decode {file}: {reason}")]
    DecodeFailure { file: String, reason: String },
}

impl EngineError {
    pub(crate) fn unsupported(operation: &'static str, reason: impl Into<String>) -> Self {
        EngineError::UnsupportedOperation {
            operation,
            reason: reason.into(),
        }
    }
}

/// Result type for engine operations
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors raised on the controlling side of the control channel.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ControlError {
    /// The command was refused before being sent (e.g. issued before `init`).
    #[error("command rejected: {0}")]
    Rejected(EngineError),

    /// The command queue towards the engine is full.
    #[error("command queue is full")]
    QueueFull,

    /// The engine side of the channel has gone away.
    #[error("engine is disconnected")]
    Disconnected,
}

/// Errors from the native audio output.
#[cfg(feature = "cpal_sink")]
#[derive(Error, Debug)]
pub enum OutputError {
    #[error("no audio output device found")]
    NoDevice,

    #[error("failed to get device config: {0}")]
    Config(#[from] cpal::DefaultStreamConfigError),

    #[error("failed to build output stream: {0}")]
    Build(#[from] cpal::BuildStreamError),

    #[error("failed to start output stream: {0}")]
    Play(#[from] cpal::PlayStreamError),

    #[error("unsupported sample format: {0}")]
    UnsupportedFormat(String),

    #[error("output thread exited before the stream started")]
    ThreadExited,
}
