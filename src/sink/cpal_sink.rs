//! CPAL audio output sink

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, SizedSample, SupportedStreamConfig};
use tracing::{error, info, warn};

use crate::error::OutputError;
use crate::render::{Attacher, RenderConsumer};
use crate::ring::{Consumer, MAX_CHANNELS};

/// Largest block rendered in one go inside the callback, in frames.
const SCRATCH_FRAMES: usize = 4096;

/// Counters shared between the callback and the sink.
#[derive(Default)]
struct Stats {
    frames: AtomicU64,
    quanta: AtomicU64,
    underruns: AtomicU64,
}

/// Plays a ring buffer on a CPAL output device.
///
/// The stream lives on its own thread; its callback drives a [`RenderConsumer`].
/// Until a ring is attached the device plays silence.
pub struct CpalSink {
    attacher: Attacher,
    sample_rate: u32,
    device_channels: usize,
    stats: Arc<Stats>,
    shutdown: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl CpalSink {
    /// Open the default output device for `channels` interleaved ring channels.
    pub fn default_output(channels: usize) -> Result<Self, OutputError> {
        let host = cpal::default_host();
        let device = host.default_output_device().ok_or(OutputError::NoDevice)?;
        let config = device.default_output_config()?;
        Self::new(&device, &config, channels)
    }

    /// Create a sink for the given device and config.
    pub fn new(
        device: &cpal::Device,
        config: &SupportedStreamConfig,
        channels: usize,
    ) -> Result<Self, OutputError> {
        let sample_format = config.sample_format();
        let stream_config = config.config();
        let sample_rate = stream_config.sample_rate.0;
        let device_channels = stream_config.channels as usize;

        let (render, attacher) = RenderConsumer::new(channels);
        let stats = Arc::new(Stats::default());
        let shutdown = Arc::new(AtomicBool::new(false));
        let (ready_tx, ready_rx) = mpsc::sync_channel(1);

        // the stream is not Send on every platform, so it is built on the thread that keeps it
        let device = device.clone();
        let thread_stats = stats.clone();
        let thread_shutdown = shutdown.clone();
        let thread = thread::Builder::new()
            .name("strom-output".into())
            .spawn(move || {
                let stream =
                    match build_stream(&device, sample_format, &stream_config, render, thread_stats) {
                        Ok(stream) => stream,
                        Err(e) => {
                            let _ = ready_tx.send(Err(e));
                            return;
                        }
                    };
                if let Err(e) = stream.play() {
                    let _ = ready_tx.send(Err(OutputError::from(e)));
                    return;
                }
                let _ = ready_tx.send(Ok(()));

                while !thread_shutdown.load(Ordering::Acquire) {
                    thread::park();
                }
                drop(stream);
            })
            .map_err(|_| OutputError::ThreadExited)?;

        ready_rx.recv().map_err(|_| OutputError::ThreadExited)??;
        info!(sample_rate, device_channels, ?sample_format, "output stream started");

        Ok(Self {
            attacher,
            sample_rate,
            device_channels,
            stats,
            shutdown,
            thread: Some(thread),
        })
    }

    /// Start playing `consumer`'s ring. Only one ring can ever be attached.
    pub fn attach(&mut self, consumer: Consumer) -> Result<(), Consumer> {
        self.attacher.attach(consumer)
    }

    #[inline]
    pub fn is_attached(&self) -> bool {
        self.attacher.is_attached()
    }

    /// Device sample rate; engines feeding this sink should be initialized with it.
    #[inline]
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    #[inline]
    pub fn device_channels(&self) -> usize {
        self.device_channels
    }

    /// Frames handed to the device so far.
    #[inline]
    pub fn frames_played(&self) -> u64 {
        self.stats.frames.load(Ordering::Relaxed)
    }

    /// Render quanta that had to fall back to sample-and-hold.
    #[inline]
    pub fn underruns(&self) -> u64 {
        self.stats.underruns.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn quanta(&self) -> u64 {
        self.stats.quanta.load(Ordering::Relaxed)
    }
}

impl Drop for CpalSink {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            thread.thread().unpark();
            if thread.join().is_err() {
                error!("output thread panicked");
            }
        }
    }
}

fn build_stream(
    device: &cpal::Device,
    sample_format: SampleFormat,
    stream_config: &cpal::StreamConfig,
    render: RenderConsumer,
    stats: Arc<Stats>,
) -> Result<cpal::Stream, OutputError> {
    let stream = match sample_format {
        SampleFormat::F32 => build_typed(device, stream_config, render, stats, |s| s)?,
        SampleFormat::I16 => build_typed(device, stream_config, render, stats, |s| {
            (s * i16::MAX as f32) as i16
        })?,
        SampleFormat::U16 => build_typed(device, stream_config, render, stats, |s| {
            ((s + 1.0) * 0.5 * u16::MAX as f32) as u16
        })?,
        other => return Err(OutputError::UnsupportedFormat(format!("{:?}", other))),
    };
    Ok(stream)
}

/// Build a stream whose callback renders into a scratch block and converts each
/// hard-clipped sample with `convert`.
fn build_typed<T: SizedSample + Send + 'static>(
    device: &cpal::Device,
    stream_config: &cpal::StreamConfig,
    mut render: RenderConsumer,
    stats: Arc<Stats>,
    convert: fn(f32) -> T,
) -> Result<cpal::Stream, cpal::BuildStreamError> {
    let device_channels = (stream_config.channels as usize).max(1);
    let channels = render.channels();
    let mut scratch = vec![0.0f32; SCRATCH_FRAMES * MAX_CHANNELS];

    device.build_output_stream(
        stream_config,
        move |data: &mut [T], _| {
            for block in data.chunks_mut(SCRATCH_FRAMES * device_channels) {
                let frames = block.len() / device_channels;
                let rendered = &mut scratch[..frames * channels];
                render.render(rendered);

                for (out, frame) in block
                    .chunks_exact_mut(device_channels)
                    .zip(rendered.chunks_exact(channels))
                {
                    for (ch, sample) in out.iter_mut().enumerate() {
                        let s = frame[ch.min(channels - 1)].clamp(-1.0, 1.0);
                        *sample = convert(s);
                    }
                }
                stats.frames.fetch_add(frames as u64, Ordering::Relaxed);
            }
            stats.quanta.store(render.quanta(), Ordering::Relaxed);
            stats.underruns.store(render.underruns(), Ordering::Relaxed);
        },
        |err| warn!("output stream error: {}", err),
        None,
    )
}
