//! Shared-memory ring buffer between the producer thread and the render callback.
//!
//! The whole buffer is one contiguous allocation of sample slots:
//!
//! ```text
//! [0] read index   (written by the consumer only)
//! [1] write index  (written by the producer only)
//! [2] reserved
//! [3] reserved
//! [4 ..]           C payload slots, interleaved per channel
//! ```
//!
//! Every slot is an atomic 32-bit cell. Indices are plain slot offsets in `[0, C)`,
//! payload slots hold `f32` bit patterns. Each index has exactly one writer, which is
//! what lets the two sides share the buffer without locks: the producer publishes its
//! index with `Release` after filling the payload, the consumer observes it with
//! `Acquire` before reading.
//!
//! No slot is reserved to tell "full" apart from "empty": a producer that writes
//! exactly `C` samples ahead of the reader leaves both indices equal, which reads
//! back as an empty buffer. [`Producer::write`] never blocks and overwrites unread
//! samples when it laps the reader.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use delegate::delegate;
use tracing::debug;

use crate::error::{EngineError, EngineResult};

/// Number of header slots in front of the payload.
pub const HEADER_SLOTS: usize = 4;
/// Header slot holding the read index.
pub const READ_INDEX_SLOT: usize = 0;
/// Header slot holding the write index.
pub const WRITE_INDEX_SLOT: usize = 1;

/// Largest ring the buffer will allocate, in frames (~21s at 48kHz).
pub const MAX_CAPACITY_FRAMES: usize = 1 << 20;

/// Maximum number of interleaved channels.
pub const MAX_CHANNELS: usize = 2;

/// Only one in this many overrun events is reported.
const OVERRUN_LOG_INTERVAL: u64 = 100;

static NEXT_BUFFER_ID: AtomicU64 = AtomicU64::new(1);

/// Samples readable for the given indices: `(write - read + C) mod C`.
#[inline]
pub fn available_to_read(read: usize, write: usize, capacity: usize) -> usize {
    (write + capacity - read) % capacity
}

/// Samples writable without lapping the reader: `(read - write - 1 + C) mod C`.
///
/// [`Producer::write`] does not enforce this; it is what a well-paced producer checks.
#[inline]
pub fn available_to_write(read: usize, write: usize, capacity: usize) -> usize {
    (read + capacity - write - 1) % capacity
}

struct Shared {
    id: u64,
    capacity: usize,
    channels: usize,
    slots: Box<[AtomicU32]>,
    producer_claimed: AtomicBool,
    consumer_claimed: AtomicBool,
}

impl Shared {
    #[inline]
    fn index(&self, slot: usize) -> usize {
        self.slots[slot].load(Ordering::Acquire) as usize
    }

    #[inline]
    fn publish(&self, slot: usize, value: usize) {
        self.slots[slot].store(value as u32, Ordering::Release);
    }

    #[inline]
    fn payload(&self) -> &[AtomicU32] {
        &self.slots[HEADER_SLOTS..]
    }
}

/// A fixed-capacity shared ring buffer.
///
/// This is also the shared-buffer handle passed around by the control channel:
/// cloning is cheap, and two handles compare equal only if they refer to the same
/// region.
///
/// Writing and reading happen through the [`Producer`] and [`Consumer`] halves,
/// each of which can be claimed once.
#[derive(Clone)]
pub struct RingBuffer {
    shared: Arc<Shared>,
}

impl RingBuffer {
    /// Allocate a ring holding `capacity_frames` frames of `channels` interleaved samples.
    pub fn new(capacity_frames: usize, channels: usize) -> EngineResult<Self> {
        if channels == 0 || channels > MAX_CHANNELS {
            return Err(EngineError::InvalidInput(format!(
                "ring buffer supports 1 to {} channels, got {}",
                MAX_CHANNELS, channels
            )));
        }
        if capacity_frames < 2 || capacity_frames > MAX_CAPACITY_FRAMES {
            return Err(EngineError::InvalidInput(format!(
                "ring buffer capacity must be between 2 and {} frames, got {}",
                MAX_CAPACITY_FRAMES, capacity_frames
            )));
        }

        let capacity = capacity_frames * channels;
        let slots = (0..HEADER_SLOTS + capacity)
            .map(|_| AtomicU32::new(0))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        let id = NEXT_BUFFER_ID.fetch_add(1, Ordering::Relaxed);
        debug!(id, capacity, channels, "allocated ring buffer");

        Ok(Self {
            shared: Arc::new(Shared {
                id,
                capacity,
                channels,
                slots,
                producer_claimed: AtomicBool::new(false),
                consumer_claimed: AtomicBool::new(false),
            }),
        })
    }

    /// Process-unique id of the underlying region.
    #[inline]
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    /// Capacity `C` in samples.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    /// Capacity in frames.
    #[inline]
    pub fn capacity_frames(&self) -> usize {
        self.shared.capacity / self.shared.channels
    }

    #[inline]
    pub fn channels(&self) -> usize {
        self.shared.channels
    }

    #[inline]
    pub fn read_index(&self) -> usize {
        self.shared.index(READ_INDEX_SLOT)
    }

    #[inline]
    pub fn write_index(&self) -> usize {
        self.shared.index(WRITE_INDEX_SLOT)
    }

    /// Samples available to the consumer.
    #[inline]
    pub fn available_to_read(&self) -> usize {
        available_to_read(self.read_index(), self.write_index(), self.capacity())
    }

    /// Samples the producer can write without overwriting unread data.
    #[inline]
    pub fn available_to_write(&self) -> usize {
        available_to_write(self.read_index(), self.write_index(), self.capacity())
    }

    #[inline]
    pub fn frames_to_read(&self) -> usize {
        self.available_to_read() / self.channels()
    }

    #[inline]
    pub fn frames_to_write(&self) -> usize {
        self.available_to_write() / self.channels()
    }

    /// Claim the writing half. Returns `None` if it was already claimed.
    pub fn producer(&self) -> Option<Producer> {
        if self.shared.producer_claimed.swap(true, Ordering::AcqRel) {
            return None;
        }
        Some(Producer {
            ring: self.clone(),
            write: self.write_index(),
            overruns: 0,
        })
    }

    /// Claim the reading half. Returns `None` if it was already claimed.
    pub fn consumer(&self) -> Option<Consumer> {
        if self.shared.consumer_claimed.swap(true, Ordering::AcqRel) {
            return None;
        }
        Some(Consumer {
            ring: self.clone(),
            read: self.read_index(),
        })
    }
}

impl PartialEq for RingBuffer {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

impl Eq for RingBuffer {}

impl fmt::Debug for RingBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RingBuffer")
            .field("id", &self.id())
            .field("capacity", &self.capacity())
            .field("channels", &self.channels())
            .field("read_index", &self.read_index())
            .field("write_index", &self.write_index())
            .finish()
    }
}

/// The single writer of a [`RingBuffer`]. Owns the write index.
pub struct Producer {
    ring: RingBuffer,
    /// Local copy of the write index; only this half ever changes it.
    write: usize,
    overruns: u64,
}

impl Producer {
    delegate! {
        to self.ring {
            pub fn capacity(&self) -> usize;
            pub fn channels(&self) -> usize;
            pub fn available_to_read(&self) -> usize;
            pub fn available_to_write(&self) -> usize;
            pub fn frames_to_read(&self) -> usize;
            pub fn frames_to_write(&self) -> usize;
        }
    }

    /// The ring this producer writes into.
    pub fn ring(&self) -> &RingBuffer {
        &self.ring
    }

    /// Copy `samples` in at the write index and publish the new index.
    ///
    /// Never blocks. If the reader is further behind than the free space allows,
    /// unread samples are overwritten. Returns `samples.len()`.
    pub fn write(&mut self, samples: &[f32]) -> usize {
        let shared = &*self.ring.shared;
        let capacity = shared.capacity;

        let free = available_to_write(shared.index(READ_INDEX_SLOT), self.write, capacity);
        if samples.len() > free {
            self.overruns += 1;
            if self.overruns % OVERRUN_LOG_INTERVAL == 1 {
                debug!(
                    id = shared.id,
                    requested = samples.len(),
                    free,
                    overruns = self.overruns,
                    "producer lapped the reader, overwriting unread samples"
                );
            }
        }

        let payload = shared.payload();
        for (i, sample) in samples.iter().enumerate() {
            payload[(self.write + i) % capacity].store(sample.to_bits(), Ordering::Relaxed);
        }

        self.write = (self.write + samples.len()) % capacity;
        shared.publish(WRITE_INDEX_SLOT, self.write);

        samples.len()
    }

    /// Number of writes that lapped the reader so far.
    #[inline]
    pub fn overruns(&self) -> u64 {
        self.overruns
    }
}

impl fmt::Debug for Producer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Producer")
            .field("ring", &self.ring.id())
            .field("write", &self.write)
            .finish()
    }
}

/// The single reader of a [`RingBuffer`]. Owns the read index.
pub struct Consumer {
    ring: RingBuffer,
    read: usize,
}

impl Consumer {
    delegate! {
        to self.ring {
            pub fn capacity(&self) -> usize;
            pub fn channels(&self) -> usize;
            pub fn available_to_read(&self) -> usize;
            pub fn available_to_write(&self) -> usize;
            pub fn frames_to_read(&self) -> usize;
        }
    }

    /// The ring this consumer reads from.
    pub fn ring(&self) -> &RingBuffer {
        &self.ring
    }

    /// Read whole frames into `out`, stopping at the first unavailable frame.
    ///
    /// Returns the number of samples read; the rest of `out` is left untouched.
    /// Bounded time, no allocation.
    pub fn read(&mut self, out: &mut [f32]) -> usize {
        let shared = &*self.ring.shared;
        let capacity = shared.capacity;
        let channels = shared.channels;

        let available = available_to_read(self.read, shared.index(WRITE_INDEX_SLOT), capacity);
        let wanted = out.len() - out.len() % channels;
        let count = wanted.min(available - available % channels);

        let payload = shared.payload();
        for (i, sample) in out[..count].iter_mut().enumerate() {
            *sample = f32::from_bits(payload[(self.read + i) % capacity].load(Ordering::Relaxed));
        }

        self.read = (self.read + count) % capacity;
        shared.publish(READ_INDEX_SLOT, self.read);

        count
    }
}

impl fmt::Debug for Consumer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Consumer")
            .field("ring", &self.ring.id())
            .field("read", &self.read)
            .finish()
    }
}
