//! Real-time side of the pipeline.
//!
//! [`RenderConsumer`] is driven by the platform's audio callback once per quantum.
//! It never allocates or blocks: it reads what the producer has published and, when
//! the ring runs dry, holds the last sample of each channel instead of dropping to
//! zero.

use rtrb::RingBuffer as HandOff;
use tracing::{info, warn};

use crate::ring::{Consumer, MAX_CHANNELS};

/// Frames requested per render callback when the platform doesn't say otherwise.
pub const DEFAULT_QUANTUM_FRAMES: usize = 128;

/// Only one in this many underrun quanta is logged.
pub const UNDERRUN_LOG_INTERVAL: u64 = 100;

/// Hands one [`Consumer`] over to a [`RenderConsumer`] running on another thread.
///
/// The hand-over goes through a single-slot wait-free queue, so the audio thread
/// picks it up without taking a lock. Only the first attach is accepted.
pub struct Attacher {
    sender: rtrb::Producer<Consumer>,
    channels: usize,
    attached: bool,
}

impl Attacher {
    /// Give the render side its ring.
    ///
    /// Returns the consumer back if a ring was already attached or if its channel
    /// count differs from the render layout.
    pub fn attach(&mut self, consumer: Consumer) -> Result<(), Consumer> {
        if self.attached {
            warn!(
                ring = consumer.ring().id(),
                "render consumer already has a ring, refusing to re-attach"
            );
            return Err(consumer);
        }
        if consumer.channels() != self.channels {
            warn!(
                ring = consumer.ring().id(),
                ring_channels = consumer.channels(),
                render_channels = self.channels,
                "channel layout mismatch, refusing to attach"
            );
            return Err(consumer);
        }

        let id = consumer.ring().id();
        self.sender
            .push(consumer)
            .map_err(|rtrb::PushError::Full(c)| c)?;
        self.attached = true;
        info!(ring = id, "attached ring to render consumer");
        Ok(())
    }

    #[inline]
    pub fn is_attached(&self) -> bool {
        self.attached
    }
}

/// Drains a ring buffer once per render quantum.
pub struct RenderConsumer {
    pending: rtrb::Consumer<Consumer>,
    ring: Option<Consumer>,
    channels: usize,
    /// Last genuinely read frame, repeated while the ring is empty.
    held: [f32; MAX_CHANNELS],
    quanta: u64,
    underruns: u64,
}

impl RenderConsumer {
    /// Create a render consumer for `channels` interleaved output channels, together
    /// with the [`Attacher`] that will later supply its ring.
    pub fn new(channels: usize) -> (Self, Attacher) {
        let channels = channels.clamp(1, MAX_CHANNELS);
        let (sender, pending) = HandOff::new(1);

        (
            Self {
                pending,
                ring: None,
                channels,
                held: [0.0; MAX_CHANNELS],
                quanta: 0,
                underruns: 0,
            },
            Attacher {
                sender,
                channels,
                attached: false,
            },
        )
    }

    /// Fill one quantum of interleaved output.
    ///
    /// Emits silence until a ring is attached. Returns the number of frames that
    /// came from the ring; the remainder of `out` was filled by sample-and-hold.
    pub fn render(&mut self, out: &mut [f32]) -> usize {
        if self.ring.is_none() {
            if let Ok(consumer) = self.pending.pop() {
                self.ring = Some(consumer);
            }
        }

        self.quanta += 1;
        let channels = self.channels;

        let Some(ring) = self.ring.as_mut() else {
            out.fill(0.0);
            return 0;
        };

        let read = ring.read(out);
        if read >= channels {
            self.held[..channels].copy_from_slice(&out[read - channels..read]);
        }

        if read < out.len() {
            for (i, sample) in out[read..].iter_mut().enumerate() {
                *sample = self.held[(read + i) % channels];
            }

            self.underruns += 1;
            if self.underruns % UNDERRUN_LOG_INTERVAL == 1 {
                warn!(
                    underruns = self.underruns,
                    missing_frames = (out.len() - read) / channels,
                    "buffer underrun, holding last sample"
                );
            }
        }

        read / channels
    }

    #[inline]
    pub fn channels(&self) -> usize {
        self.channels
    }

    #[inline]
    pub fn is_attached(&self) -> bool {
        self.ring.is_some()
    }

    /// Quanta rendered so far.
    #[inline]
    pub fn quanta(&self) -> u64 {
        self.quanta
    }

    /// Quanta that could not be filled entirely from the ring.
    #[inline]
    pub fn underruns(&self) -> u64 {
        self.underruns
    }
}

#[cfg(test)]
mod tests {
    use std::io;
    use std::sync::{Arc, Mutex};

    use tracing_subscriber::fmt::MakeWriter;

    use super::*;
    use crate::ring::RingBuffer;

    #[test]
    fn silent_before_attach() {
        let (mut render, _attacher) = RenderConsumer::new(2);
        let mut out = [0.5f32; 8];
        assert_eq!(render.render(&mut out), 0);
        assert!(out.iter().all(|s| *s == 0.0));
        assert!(!render.is_attached());
        assert_eq!(render.underruns(), 0);
    }

    #[test]
    fn passes_samples_through_once_attached() {
        let ring = RingBuffer::new(64, 2).unwrap();
        let mut producer = ring.producer().unwrap();
        let (mut render, mut attacher) = RenderConsumer::new(2);
        attacher.attach(ring.consumer().unwrap()).unwrap();

        let block: Vec<f32> = (0..8).map(|i| i as f32 * 0.1).collect();
        producer.write(&block);

        let mut out = [0.0f32; 8];
        assert_eq!(render.render(&mut out), 4);
        assert_eq!(&out[..], &block[..]);
        assert_eq!(render.underruns(), 0);
    }

    #[test]
    fn underrun_holds_last_frame_bit_for_bit() {
        let ring = RingBuffer::new(64, 2).unwrap();
        let mut producer = ring.producer().unwrap();
        let (mut render, mut attacher) = RenderConsumer::new(2);
        attacher.attach(ring.consumer().unwrap()).unwrap();

        let left = 0.123_456_79f32;
        let right = -0.987_654_3f32;
        producer.write(&[0.5, 0.5, left, right]);

        let mut out = [0.0f32; 8];
        assert_eq!(render.render(&mut out), 2);
        for frame in out[4..].chunks(2) {
            assert_eq!(frame[0].to_bits(), left.to_bits());
            assert_eq!(frame[1].to_bits(), right.to_bits());
        }

        // nothing new: the whole quantum is held
        let mut out = [0.0f32; 8];
        assert_eq!(render.render(&mut out), 0);
        for frame in out.chunks(2) {
            assert_eq!(frame[0].to_bits(), left.to_bits());
            assert_eq!(frame[1].to_bits(), right.to_bits());
        }
        assert_eq!(render.underruns(), 2);

        // production resumes, output follows again
        producer.write(&[0.25, 0.75, 0.25, 0.75, 0.25, 0.75, 0.25, 0.75]);
        let mut out = [0.0f32; 8];
        assert_eq!(render.render(&mut out), 4);
        assert_eq!(out, [0.25, 0.75, 0.25, 0.75, 0.25, 0.75, 0.25, 0.75]);
    }

    #[derive(Clone, Default)]
    struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

    impl io::Write for CapturedLogs {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl<'a> MakeWriter<'a> for CapturedLogs {
        type Writer = CapturedLogs;

        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    #[test]
    fn underrun_warning_is_throttled() {
        let logs = CapturedLogs::default();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(logs.clone())
            .with_ansi(false)
            .with_max_level(tracing::Level::WARN)
            .finish();

        let ring = RingBuffer::new(16, 1).unwrap();
        let (mut render, mut attacher) = RenderConsumer::new(1);
        tracing::subscriber::with_default(subscriber, || {
            attacher.attach(ring.consumer().unwrap()).unwrap();
            let mut out = [0.0f32; 4];
            for _ in 0..2 * UNDERRUN_LOG_INTERVAL + 50 {
                render.render(&mut out);
            }
        });

        assert_eq!(render.underruns(), 2 * UNDERRUN_LOG_INTERVAL + 50);
        let output = String::from_utf8(logs.0.lock().unwrap().clone()).unwrap();
        let warnings: Vec<&str> = output
            .lines()
            .filter(|line| line.contains("buffer underrun"))
            .collect();
        // the 1st, 101st and 201st underruns
        assert_eq!(warnings.len(), 3, "{}", output);
        assert!(warnings[0].contains("underruns=1 "));
        assert!(warnings[1].contains("underruns=101 "));
        assert!(warnings[2].contains("underruns=201 "));
    }

    #[test]
    fn attaches_only_once() {
        let first = RingBuffer::new(16, 1).unwrap();
        let second = RingBuffer::new(16, 1).unwrap();
        let (mut render, mut attacher) = RenderConsumer::new(1);

        assert!(attacher.attach(first.consumer().unwrap()).is_ok());
        let rejected = attacher.attach(second.consumer().unwrap()).unwrap_err();
        assert_eq!(rejected.ring(), &second);

        let mut out = [0.0f32; 4];
        render.render(&mut out);
        assert!(render.is_attached());
    }

    #[test]
    fn refuses_mismatched_channels() {
        let ring = RingBuffer::new(16, 1).unwrap();
        let (_render, mut attacher) = RenderConsumer::new(2);
        assert!(attacher.attach(ring.consumer().unwrap()).is_err());
        assert!(!attacher.is_attached());
    }
}
