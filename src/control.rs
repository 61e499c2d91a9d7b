//! Message protocol between the controlling thread and the engine.
//!
//! [`channel`] creates a [`Controller`] for the UI side and an [`EngineEndpoint`]
//! for the engine side, connected by two wait-free `rtrb` queues: commands flow one
//! way, responses the other. Every command is wrapped in an [`Envelope`] with a
//! fresh [`RequestId`], and the response to it carries the same id.
//!
//! The controller mirrors the engine's state from the responses it sees. While an
//! `init` is in flight, other commands are held back in a pending queue and sent in
//! their original order once initialization succeeds.

use std::collections::VecDeque;
use std::fmt;

use rtrb::RingBuffer as Queue;
use tracing::{debug, info, warn};

use crate::engine::EngineState;
use crate::error::{ControlError, EngineError, EngineResult};
use crate::ring::RingBuffer;
use crate::source::{AudioFile, BatchSummary, SourceType};

/// Correlates a response with the command that caused it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(pub u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A request to the engine.
#[derive(Clone, Debug, PartialEq)]
pub enum Command {
    Init {
        sample_rate: u32,
        source_type: SourceType,
    },
    Start,
    Stop,
    SetFrequency {
        frequency: f32,
    },
    LoadAudioFile {
        file: AudioFile,
    },
    LoadAudioFiles {
        files: Vec<AudioFile>,
    },
    Reset,
    /// Move every player track to a position, in seconds from the start.
    Seek {
        seconds: f64,
    },
}

impl Command {
    /// Operation name used in logs and errors.
    pub fn name(&self) -> &'static str {
        match self {
            Command::Init { .. } => "init",
            Command::Start => "start",
            Command::Stop => "stop",
            Command::SetFrequency { .. } => "setFrequency",
            Command::LoadAudioFile { .. } => "loadAudioFile",
            Command::LoadAudioFiles { .. } => "loadAudioFiles",
            Command::Reset => "reset",
            Command::Seek { .. } => "seek",
        }
    }
}

/// What a load request produced.
#[derive(Clone, Debug, PartialEq)]
pub enum LoadReport {
    Single { file_name: String, frames: usize },
    Batch(BatchSummary),
}

impl fmt::Display for LoadReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoadReport::Single { file_name, frames } => {
                write!(f, "loaded {} ({} frames)", file_name, frames)
            }
            LoadReport::Batch(summary) => write!(f, "{}", summary),
        }
    }
}

/// The engine's answer to a [`Command`].
#[derive(Clone, Debug, PartialEq)]
pub enum Response {
    Initialized {
        result: EngineResult<RingBuffer>,
        source_type: SourceType,
    },
    Started(EngineResult<RingBuffer>),
    Stopped(EngineResult<()>),
    FrequencySet(EngineResult<()>),
    AudioFileReceived(EngineResult<LoadReport>),
    Reset(EngineResult<()>),
    /// Frame the tracks were moved to.
    Seeked(EngineResult<usize>),
}

impl Response {
    pub fn is_success(&self) -> bool {
        match self {
            Response::Initialized { result, .. } | Response::Started(result) => result.is_ok(),
            Response::Stopped(result) | Response::FrequencySet(result) | Response::Reset(result) => {
                result.is_ok()
            }
            Response::AudioFileReceived(Ok(LoadReport::Batch(summary))) => summary.is_success(),
            Response::AudioFileReceived(result) => result.is_ok(),
            Response::Seeked(result) => result.is_ok(),
        }
    }

    /// The error carried by a failed response.
    pub fn error(&self) -> Option<&EngineError> {
        match self {
            Response::Initialized { result, .. } | Response::Started(result) => result.as_ref().err(),
            Response::Stopped(result) | Response::FrequencySet(result) | Response::Reset(result) => {
                result.as_ref().err()
            }
            Response::AudioFileReceived(result) => result.as_ref().err(),
            Response::Seeked(result) => result.as_ref().err(),
        }
    }

    /// Human-readable outcome.
    pub fn message(&self) -> String {
        if let Some(err) = self.error() {
            return err.to_string();
        }
        match self {
            Response::Initialized { source_type, .. } => format!("initialized {} source", source_type),
            Response::Started(_) => "started".into(),
            Response::Stopped(_) => "stopped".into(),
            Response::FrequencySet(_) => "frequency set".into(),
            Response::AudioFileReceived(Ok(report)) => report.to_string(),
            Response::AudioFileReceived(Err(_)) => String::new(),
            Response::Reset(_) => "playback reset".into(),
            Response::Seeked(Ok(frame)) => format!("moved to frame {}", frame),
            Response::Seeked(Err(_)) => String::new(),
        }
    }
}

/// A message tagged with the request it belongs to.
#[derive(Clone, Debug, PartialEq)]
pub struct Envelope<T> {
    pub id: RequestId,
    pub body: T,
}

pub type Request = Envelope<Command>;
pub type Reply = Envelope<Response>;

/// Create a connected controller and engine endpoint.
///
/// `capacity` bounds the number of in-flight messages in each direction.
pub fn channel(capacity: usize) -> (Controller, EngineEndpoint) {
    let capacity = capacity.max(1);
    let (command_tx, command_rx) = Queue::new(capacity);
    let (response_tx, response_rx) = Queue::new(capacity);

    (
        Controller {
            commands: command_tx,
            responses: response_rx,
            state: EngineState::Uninitialized,
            source_type: None,
            buffer: None,
            pending: VecDeque::new(),
            next_id: 1,
        },
        EngineEndpoint {
            commands: command_rx,
            responses: response_tx,
        },
    )
}

/// The controlling side of the channel.
pub struct Controller {
    commands: rtrb::Producer<Request>,
    responses: rtrb::Consumer<Reply>,
    state: EngineState,
    source_type: Option<SourceType>,
    buffer: Option<RingBuffer>,
    /// Commands held back while `Initializing`, plus any that did not fit the queue
    /// when flushed.
    pending: VecDeque<Request>,
    next_id: u64,
}

impl Controller {
    /// Engine state as of the last response seen.
    #[inline]
    pub fn state(&self) -> EngineState {
        self.state
    }

    #[inline]
    pub fn source_type(&self) -> Option<SourceType> {
        self.source_type
    }

    /// The shared buffer handle, once initialization has succeeded.
    #[inline]
    pub fn buffer(&self) -> Option<&RingBuffer> {
        self.buffer.as_ref()
    }

    /// Number of commands held back, waiting for initialization or for room in the
    /// command queue.
    #[inline]
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub fn init(
        &mut self,
        sample_rate: u32,
        source_type: SourceType,
    ) -> Result<RequestId, ControlError> {
        self.send(Command::Init {
            sample_rate,
            source_type,
        })
    }

    pub fn start(&mut self) -> Result<RequestId, ControlError> {
        self.send(Command::Start)
    }

    pub fn stop(&mut self) -> Result<RequestId, ControlError> {
        self.send(Command::Stop)
    }

    pub fn set_frequency(&mut self, frequency: f32) -> Result<RequestId, ControlError> {
        self.send(Command::SetFrequency { frequency })
    }

    pub fn load_audio_file(&mut self, file: AudioFile) -> Result<RequestId, ControlError> {
        self.send(Command::LoadAudioFile { file })
    }

    pub fn load_audio_files(&mut self, files: Vec<AudioFile>) -> Result<RequestId, ControlError> {
        self.send(Command::LoadAudioFiles { files })
    }

    pub fn reset(&mut self) -> Result<RequestId, ControlError> {
        self.send(Command::Reset)
    }

    pub fn seek(&mut self, seconds: f64) -> Result<RequestId, ControlError> {
        self.send(Command::Seek { seconds })
    }

    /// Send a command, or hold it back if initialization is still in progress.
    ///
    /// Anything but `init` is rejected before the engine has been initialized. While
    /// deferred commands are still waiting, new ones line up behind them.
    pub fn send(&mut self, command: Command) -> Result<RequestId, ControlError> {
        let is_init = matches!(command, Command::Init { .. });

        match self.state {
            EngineState::Uninitialized | EngineState::Failed if !is_init => {
                return Err(ControlError::Rejected(EngineError::unsupported(
                    command.name(),
                    format!("engine is {}, call init first", self.state),
                )));
            }
            EngineState::Initializing => {
                let request = self.envelope(command);
                let id = request.id;
                debug!(id = %id, command = request.body.name(), "engine initializing, deferring command");
                self.pending.push_back(request);
                return Ok(id);
            }
            _ => {}
        }

        let request = self.envelope(command);
        let id = request.id;
        if !self.pending.is_empty() {
            // earlier deferred commands still waiting for room go first
            debug!(id = %id, command = request.body.name(), "queueing behind deferred commands");
            self.pending.push_back(request);
            self.flush_pending();
            return Ok(id);
        }
        self.push(request)?;
        if is_init && matches!(self.state, EngineState::Uninitialized | EngineState::Failed) {
            self.state = EngineState::Initializing;
        }
        Ok(id)
    }

    /// Collect every response that has arrived, updating the mirrored state.
    ///
    /// A successful `Initialized` releases the pending queue in order; a failed one
    /// discards it.
    pub fn poll(&mut self) -> Vec<Reply> {
        let mut replies = Vec::new();
        while let Ok(reply) = self.responses.pop() {
            self.observe(&reply);
            replies.push(reply);
        }

        if !self.pending.is_empty() && self.state != EngineState::Initializing {
            self.flush_pending();
        }
        replies
    }

    /// `true` if the engine side has been dropped.
    pub fn is_disconnected(&self) -> bool {
        self.commands.is_abandoned()
    }

    fn envelope(&mut self, body: Command) -> Request {
        let id = RequestId(self.next_id);
        self.next_id += 1;
        Envelope { id, body }
    }

    fn push(&mut self, request: Request) -> Result<(), ControlError> {
        if self.commands.is_abandoned() {
            return Err(ControlError::Disconnected);
        }
        self.commands
            .push(request)
            .map_err(|rtrb::PushError::Full(_)| ControlError::QueueFull)
    }

    fn observe(&mut self, reply: &Reply) {
        match &reply.body {
            Response::Initialized {
                result: Ok(buffer),
                source_type,
            } => {
                if self.state == EngineState::Initializing {
                    self.state = EngineState::Ready;
                }
                self.source_type = Some(*source_type);
                self.buffer = Some(buffer.clone());
                info!(id = %reply.id, source = %source_type, "engine initialized");
            }
            Response::Initialized { result: Err(e), .. } => {
                warn!(id = %reply.id, "engine initialization failed: {}", e);
                self.state = EngineState::Failed;
                self.source_type = None;
                self.buffer = None;
                for request in self.pending.drain(..) {
                    warn!(
                        id = %request.id,
                        command = request.body.name(),
                        "discarding command deferred during failed initialization"
                    );
                }
            }
            Response::Started(Ok(_)) => self.state = EngineState::Running,
            Response::Stopped(Ok(_)) => self.state = EngineState::Stopped,
            _ => {}
        }
    }

    fn flush_pending(&mut self) {
        while let Some(request) = self.pending.pop_front() {
            let id = request.id;
            debug!(id = %id, command = request.body.name(), "sending deferred command");
            if let Err(e) = self.commands.push(request) {
                // queue full: retry on the next poll, order preserved
                let rtrb::PushError::Full(request) = e;
                self.pending.push_front(request);
                warn!(id = %id, remaining = self.pending.len(), "command queue full, deferring flush");
                return;
            }
        }
    }
}

impl fmt::Debug for Controller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Controller")
            .field("state", &self.state)
            .field("source_type", &self.source_type)
            .field("buffer", &self.buffer.as_ref().map(RingBuffer::id))
            .field("pending", &self.pending.len())
            .finish()
    }
}

/// The engine side of the channel.
pub struct EngineEndpoint {
    commands: rtrb::Consumer<Request>,
    responses: rtrb::Producer<Reply>,
}

impl EngineEndpoint {
    /// Next command, if one is waiting.
    pub fn recv(&mut self) -> Option<Request> {
        self.commands.pop().ok()
    }

    /// `true` if there is room for at least one more response.
    #[inline]
    pub fn can_reply(&self) -> bool {
        self.responses.slots() > 0
    }

    /// Send a response back.
    ///
    /// A full response queue drops the reply and reports [`ControlError::QueueFull`];
    /// check [`can_reply`](Self::can_reply) before taking on a command.
    pub fn reply(&mut self, reply: Reply) -> Result<(), ControlError> {
        if self.responses.is_abandoned() {
            return Err(ControlError::Disconnected);
        }
        self.responses.push(reply).map_err(|rtrb::PushError::Full(reply)| {
            warn!(id = %reply.id, "response queue full, dropping reply");
            ControlError::QueueFull
        })
    }

    /// `true` if the controller has been dropped.
    pub fn is_disconnected(&self) -> bool {
        self.commands.is_abandoned()
    }
}

impl fmt::Debug for EngineEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineEndpoint")
            .field("queued_commands", &self.commands.slots())
            .finish()
    }
}
