//! Sample-accurate tapes and the heads that play them back.

mod buffer;
mod head;
#[cfg(feature = "vorbis_src")]
mod vorbis;

pub use buffer::{Layout, SharedTape, TapeBuffer};
pub use head::{TapeHead, TapeWindow};

/// Errors raised while building or writing a tape.
#[derive(Debug, thiserror::Error)]
pub enum TapeError {
    #[error("block holds {actual} samples, expected {expected}")]
    BlockLength { expected: usize, actual: usize },
    #[error("capacity {capacity} is smaller than one block of {frames_per_block} frames")]
    CapacityTooSmall {
        capacity: usize,
        frames_per_block: usize,
    },
    #[error("channels differ in length")]
    ChannelMismatch,
    #[error("a tape needs at least one channel")]
    ZeroChannels,
    #[error("a block written at sample {offset} would end past the last addressable sample")]
    OffsetOverflow { offset: usize },
    #[cfg(feature = "vorbis_src")]
    #[error("failed to open audio file: {0}")]
    Io(#[from] std::io::Error),
    #[cfg(feature = "vorbis_src")]
    #[error("failed to decode vorbis stream: {0}")]
    Vorbis(#[from] lewton::VorbisError),
}
