//! Host-owned render context.

/// Fixed parameters shared by every stage, tape and buffer of one engine.
///
/// The host builds one of these and hands it (by reference) to the graph,
/// the stages and the tapes. Two engines with different contexts can run
/// side by side in one process.
///
/// ```
/// use tapegraph::RenderContext;
///
/// let ctx = RenderContext::new(44_100, 256).with_channels(1);
/// assert_eq!(ctx.block_len(), 256);
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RenderContext {
    /// Sample rate in Hz (e.g., 44100, 48000)
    pub sample_rate: u32,
    /// Frames rendered per block, per channel
    pub frames_per_block: usize,
    /// Number of audio channels carried by a block
    pub channels: usize,
}

impl RenderContext {
    /// Create a stereo context.
    pub fn new(sample_rate: u32, frames_per_block: usize) -> Self {
        Self {
            sample_rate,
            frames_per_block: frames_per_block.max(1),
            channels: 2,
        }
    }

    /// Set the number of channels (builder pattern).
    pub fn with_channels(mut self, channels: usize) -> Self {
        self.channels = channels.max(1);
        self
    }

    /// Samples in one block across all channels.
    #[inline]
    pub fn block_len(&self) -> usize {
        self.frames_per_block * self.channels
    }

    /// Duration of one block in seconds.
    #[inline]
    pub fn block_seconds(&self) -> f64 {
        self.frames_per_block as f64 / self.sample_rate as f64
    }

    /// Convert a time in seconds to a sample index, truncating.
    #[inline]
    pub fn seconds_to_samples(&self, seconds: f32) -> usize {
        (seconds.max(0.0) * self.sample_rate as f32) as usize
    }
}

impl Default for RenderContext {
    fn default() -> Self {
        Self::new(48_000, 512)
    }
}
