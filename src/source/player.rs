//! Multi-track file player
//!
//! Every loaded file becomes a [`Track`] with its own playhead. Rendering sums the
//! current frame of every active track and advances all of them together, so tracks
//! stay aligned to the moment they were loaded or last reset.

use std::fmt;

use hashbrown::HashMap;
use itertools::Itertools;
use tracing::{debug, info, warn};

use crate::error::{EngineError, EngineResult};
use crate::source::decode::{self, AudioFile, DecodedAudio};
use crate::source::Generate;

/// Peak level the default clamp policy lets through.
pub const DEFAULT_MIX_CEILING: f32 = 2.0;

/// How overlapping tracks are combined.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum MixPolicy {
    /// Plain sum, hard clamped to `[-ceiling, ceiling]`.
    Clamp { ceiling: f32 },
    /// Sum divided by the number of tracks still playing at that frame.
    Normalize,
}

impl Default for MixPolicy {
    fn default() -> Self {
        MixPolicy::Clamp {
            ceiling: DEFAULT_MIX_CEILING,
        }
    }
}

impl MixPolicy {
    #[inline]
    fn apply(&self, sample: f32, active: usize) -> f32 {
        match *self {
            MixPolicy::Clamp { ceiling } => sample.clamp(-ceiling, ceiling),
            MixPolicy::Normalize if active > 1 => sample / active as f32,
            MixPolicy::Normalize => sample,
        }
    }
}

/// Rearrange interleaved samples from `from` channels to `to` channels.
///
/// Mono is copied to every output channel, a stereo pair folds down to its mean
/// for mono output, and channels past the second are dropped.
fn conform_channels(samples: &[f32], from: usize, to: usize) -> Vec<f32> {
    let from = from.max(1);
    if from == to {
        return samples.to_vec();
    }

    let frames = samples.len() / from;
    let mut out = Vec::with_capacity(frames * to);
    for frame in samples.chunks_exact(from) {
        match (frame, to) {
            ([mono, ..], _) if from == 1 => out.extend(std::iter::repeat(*mono).take(to)),
            ([left, right, ..], 1) => out.push((left + right) * 0.5),
            ([left, right, ..], _) => {
                out.push(*left);
                out.push(*right);
            }
            _ => {}
        }
    }
    out
}

/// One decoded file and its playhead.
#[derive(Clone, Debug)]
pub struct Track {
    name: String,
    /// Interleaved at the player's channel count.
    samples: Vec<f32>,
    channels: usize,
    sample_rate: u32,
    /// Next frame to play.
    playhead: usize,
}

impl Track {
    /// Build a track from interleaved samples, converting them to `channels` channels.
    pub fn new(
        name: impl Into<String>,
        samples: &[f32],
        source_channels: usize,
        sample_rate: u32,
        channels: usize,
    ) -> Self {
        let channels = channels.max(1);
        Self {
            name: name.into(),
            samples: conform_channels(samples, source_channels, channels),
            channels,
            sample_rate,
            playhead: 0,
        }
    }

    fn from_decoded(name: String, decoded: DecodedAudio, channels: usize) -> Self {
        Self::new(
            name,
            &decoded.samples,
            decoded.channels,
            decoded.sample_rate,
            channels,
        )
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn frames(&self) -> usize {
        self.samples.len() / self.channels
    }

    #[inline]
    pub fn playhead(&self) -> usize {
        self.playhead
    }

    #[inline]
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    #[inline]
    pub fn is_finished(&self) -> bool {
        self.playhead >= self.frames()
    }

    fn info(&self) -> TrackInfo {
        TrackInfo {
            name: self.name.clone(),
            frames: self.frames(),
            channels: self.channels,
            sample_rate: self.sample_rate,
        }
    }
}

/// What a successful load produced.
#[derive(Clone, Debug, PartialEq)]
pub struct TrackInfo {
    pub name: String,
    pub frames: usize,
    pub channels: usize,
    pub sample_rate: u32,
}

/// Result of loading one file out of a batch.
#[derive(Clone, Debug, PartialEq)]
pub struct FileOutcome {
    pub name: String,
    pub result: EngineResult<TrackInfo>,
}

/// Per-file results of a batch load.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct BatchSummary {
    pub outcomes: Vec<FileOutcome>,
}

impl BatchSummary {
    pub fn loaded(&self) -> usize {
        self.outcomes.iter().filter(|o| o.result.is_ok()).count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes.len() - self.loaded()
    }

    /// A batch counts as loaded if at least one of its files made it.
    pub fn is_success(&self) -> bool {
        self.loaded() > 0
    }
}

impl fmt::Display for BatchSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "loaded {} of {} files", self.loaded(), self.outcomes.len())?;
        if self.failed() > 0 {
            let failures = self
                .outcomes
                .iter()
                .filter_map(|o| o.result.as_ref().err().map(|e| format!("{}: {}", o.name, e)))
                .join("; ");
            write!(f, " ({})", failures)?;
        }
        Ok(())
    }
}

/// Mixes any number of decoded tracks.
#[derive(Clone, Debug)]
pub struct MultiTrackPlayer {
    tracks: Vec<Track>,
    /// Track name to position in `tracks`.
    index: HashMap<String, usize>,
    channels: usize,
    sample_rate: u32,
    policy: MixPolicy,
}

impl MultiTrackPlayer {
    pub fn new(channels: usize, sample_rate: u32) -> Self {
        Self {
            tracks: Vec::new(),
            index: HashMap::new(),
            channels: channels.max(1),
            sample_rate,
            policy: MixPolicy::default(),
        }
    }

    pub fn with_mix_policy(mut self, policy: MixPolicy) -> Self {
        self.policy = policy;
        self
    }

    #[inline]
    pub fn channels(&self) -> usize {
        self.channels
    }

    #[inline]
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    #[inline]
    pub fn mix_policy(&self) -> MixPolicy {
        self.policy
    }

    /// Add a track, replacing any track with the same name in place.
    ///
    /// Returns `true` if an existing track was replaced.
    pub fn add_track(&mut self, track: Track) -> bool {
        if track.sample_rate != self.sample_rate {
            warn!(
                track = %track.name,
                track_rate = track.sample_rate,
                output_rate = self.sample_rate,
                "sample rate mismatch, track will play at the wrong speed"
            );
        }

        match self.index.get(&track.name).copied() {
            Some(i) => {
                self.tracks[i] = track;
                true
            }
            None => {
                self.index.insert(track.name.clone(), self.tracks.len());
                self.tracks.push(track);
                false
            }
        }
    }

    /// Decode one file and add it to the mix.
    pub fn load_file(&mut self, file: AudioFile) -> EngineResult<TrackInfo> {
        let name = file.name.clone();
        let decoded = decode::decode(file)?;
        let track = Track::from_decoded(name, decoded, self.channels);
        let info = track.info();

        let replaced = self.add_track(track);
        info!(
            track = %info.name,
            frames = info.frames,
            replaced,
            tracks = self.tracks.len(),
            "loaded track"
        );
        Ok(info)
    }

    /// Decode a batch of files and make the decodable ones the new track set.
    ///
    /// Every file is attempted regardless of earlier failures. If none of them
    /// decodes, the current tracks are left alone.
    pub fn load_files(&mut self, files: Vec<AudioFile>) -> BatchSummary {
        let mut loaded = Vec::with_capacity(files.len());
        let mut outcomes = Vec::with_capacity(files.len());

        for file in files {
            let name = file.name.clone();
            let result = decode::decode(file).map(|decoded| {
                let track = Track::from_decoded(name.clone(), decoded, self.channels);
                let info = track.info();
                loaded.push(track);
                info
            });
            if let Err(e) = &result {
                warn!(file = %name, "failed to load file: {}", e);
            }
            outcomes.push(FileOutcome { name, result });
        }

        let summary = BatchSummary { outcomes };
        if !loaded.is_empty() {
            self.tracks.clear();
            self.index.clear();
            for track in loaded {
                self.add_track(track);
            }
        }

        info!(
            loaded = summary.loaded(),
            failed = summary.failed(),
            tracks = self.tracks.len(),
            "batch load finished"
        );
        summary
    }

    /// Rewind every track to its first frame.
    pub fn reset(&mut self) {
        for track in self.tracks.iter_mut() {
            track.playhead = 0;
        }
        debug!(tracks = self.tracks.len(), "rewound all tracks");
    }

    /// Move every playhead to `frame`, or to the end of tracks shorter than that.
    pub fn seek(&mut self, frame: usize) {
        for track in self.tracks.iter_mut() {
            track.playhead = frame.min(track.frames());
        }
        debug!(frame, tracks = self.tracks.len(), "moved all playheads");
    }

    /// Move every playhead to `seconds` into the tracks, at the player's sample rate.
    pub fn seek_to_time(&mut self, seconds: f64) -> EngineResult<usize> {
        if !seconds.is_finite() || seconds < 0.0 {
            return Err(EngineError::InvalidInput(format!(
                "seek position must be a finite, non-negative number of seconds, got {}",
                seconds
            )));
        }
        let frame = (seconds * self.sample_rate as f64).round() as usize;
        self.seek(frame);
        Ok(frame)
    }

    pub fn playheads(&self) -> Vec<usize> {
        self.tracks.iter().map(Track::playhead).collect()
    }

    #[inline]
    pub fn track_count(&self) -> usize {
        self.tracks.len()
    }

    pub fn track_names(&self) -> Vec<&str> {
        self.tracks.iter().map(Track::name).collect()
    }

    pub fn tracks(&self) -> &[Track] {
        &self.tracks
    }
}

impl Generate for MultiTrackPlayer {
    fn render(&mut self, out: &mut [f32], channels: usize) {
        let channels = channels.max(1);
        let policy = self.policy;

        for frame in out.chunks_mut(channels) {
            frame.fill(0.0);
            let mut active = 0;

            for track in self.tracks.iter_mut().filter(|t| !t.is_finished()) {
                let base = track.playhead * track.channels;
                for (ch, sample) in frame.iter_mut().enumerate() {
                    *sample += track.samples[base + ch % track.channels];
                }
                track.playhead += 1;
                active += 1;
            }

            for sample in frame.iter_mut() {
                *sample = policy.apply(*sample, active);
            }
        }
    }

    fn is_exhausted(&self) -> bool {
        self.tracks.iter().all(Track::is_finished)
    }
}
