//! Where finished blocks go after they leave the graph.
//!
//! The [`Engine`](crate::Engine)'s output pump reads each published block
//! from the [`SwapBuffer`](crate::SwapBuffer) and hands it to an
//! [`AudioOutput`]. Blocks are interleaved.

use rtrb::Producer;

#[cfg(feature = "cpal_sink")]
mod cpal;
mod device;

#[cfg(feature = "cpal_sink")]
pub use self::cpal::{CpalOutput, OutputError};
pub use device::CpalDevice;

/// A consumer of interleaved blocks, typically an audio device.
pub trait AudioOutput: Send + 'static {
    /// Deliver one block. Returns `false` if the block was dropped.
    fn push(&mut self, block: &[f32]) -> bool;
}

/// Pushes interleaved samples into an `rtrb` ring buffer.
///
/// Useful for sending audio to another thread, for recording and for
/// tests. A block that does not fit whole is skipped rather than written
/// in part.
pub struct RtrbOutput {
    producer: Producer<f32>,
    dropped: u64,
}

impl RtrbOutput {
    pub fn new(producer: Producer<f32>) -> Self {
        Self {
            producer,
            dropped: 0,
        }
    }

    /// Returns how many sample slots are available
    #[inline]
    pub fn available(&self) -> usize {
        self.producer.slots()
    }

    /// Blocks skipped because the ring buffer was full.
    #[inline]
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

impl AudioOutput for RtrbOutput {
    fn push(&mut self, block: &[f32]) -> bool {
        let Ok(mut chunk) = self.producer.write_chunk_uninit(block.len()) else {
            self.dropped += 1;
            tracing::trace!(dropped = self.dropped, "output ring full, block skipped");
            return false;
        };
        chunk.fill_from_iter(block.iter().copied());
        true
    }
}
