use std::collections::VecDeque;
use std::ops::Range;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::context::RenderContext;
use crate::tape::TapeError;

/// Writes remembered for [`TapeBuffer::modified_since`].
const EDIT_HISTORY: usize = 32;

/// A tape shared between the stage that records it and any number of heads.
pub type SharedTape = Arc<RwLock<TapeBuffer>>;

/// Sample order of a multi-channel block.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Layout {
    /// `[ch0 frames][ch1 frames]...`
    #[default]
    ChannelMajor,
    /// `[ch0 s0, ch1 s0, ch0 s1, ch1 s1, ...]`
    Interleaved,
}

/// Per-channel sample store addressed by absolute sample position.
///
/// A *dynamic* tape grows to fit every write and keeps everything. A *fixed*
/// tape holds at most `capacity` samples per channel: it materializes the
/// trailing window `[max(0, record_position - capacity), record_position)`
/// of an unbounded timeline and slides that window when a write falls
/// outside it.
///
/// Blocks passed to [`record`](Self::record) are channel-major and exactly
/// `frames_per_block * channels` long. Reads outside the materialized range
/// return silence.
///
/// ```
/// use tapegraph::{Layout, RenderContext, TapeBuffer};
///
/// let ctx = RenderContext::new(48_000, 4).with_channels(2);
/// let mut tape = TapeBuffer::new(&ctx);
/// tape.record_at(&[1.0, 2.0, 3.0, 4.0, 10.0, 20.0, 30.0, 40.0], 0).unwrap();
///
/// let out = tape.playback_at(4, 1, Layout::ChannelMajor);
/// assert_eq!(out, [2.0, 3.0, 4.0, 0.0, 20.0, 30.0, 40.0, 0.0]);
/// ```
#[derive(Clone, Debug)]
pub struct TapeBuffer {
    channels: Vec<Vec<f32>>,
    frames_per_block: usize,
    sample_rate: u32,
    capacity: Option<usize>,
    record_position: usize,
    playback_position: usize,
    revision: u64,
    /// `(revision, absolute range)` of the most recent writes
    edits: VecDeque<(u64, Range<usize>)>,
}

impl TapeBuffer {
    /// An empty dynamic tape.
    pub fn new(ctx: &RenderContext) -> Self {
        Self {
            channels: vec![Vec::new(); ctx.channels],
            frames_per_block: ctx.frames_per_block,
            sample_rate: ctx.sample_rate,
            capacity: None,
            record_position: 0,
            playback_position: 0,
            revision: 0,
            edits: VecDeque::with_capacity(EDIT_HISTORY),
        }
    }

    /// A fixed tape holding `capacity` samples per channel.
    pub fn with_capacity(ctx: &RenderContext, capacity: usize) -> Result<Self, TapeError> {
        if capacity < ctx.frames_per_block {
            return Err(TapeError::CapacityTooSmall {
                capacity,
                frames_per_block: ctx.frames_per_block,
            });
        }
        Ok(Self {
            channels: vec![vec![0.0; capacity]; ctx.channels],
            capacity: Some(capacity),
            ..Self::new(ctx)
        })
    }

    /// A fixed tape sized in seconds.
    pub fn with_capacity_seconds(ctx: &RenderContext, seconds: f32) -> Result<Self, TapeError> {
        Self::with_capacity(ctx, ctx.seconds_to_samples(seconds))
    }

    /// A dynamic tape preloaded with previously recorded channel data.
    ///
    /// The record position is placed at the end of the data.
    pub fn from_channels(
        frames_per_block: usize,
        sample_rate: u32,
        channels: Vec<Vec<f32>>,
    ) -> Result<Self, TapeError> {
        let len = channels.first().map(Vec::len).ok_or(TapeError::ZeroChannels)?;
        if channels.iter().any(|ch| ch.len() != len) {
            return Err(TapeError::ChannelMismatch);
        }
        Ok(Self {
            channels,
            frames_per_block: frames_per_block.max(1),
            sample_rate,
            capacity: None,
            record_position: len,
            playback_position: 0,
            revision: 0,
            edits: VecDeque::with_capacity(EDIT_HISTORY),
        })
    }

    /// Wrap in a [`SharedTape`].
    pub fn shared(self) -> SharedTape {
        Arc::new(RwLock::new(self))
    }

    #[inline]
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    #[inline]
    pub fn frames_per_block(&self) -> usize {
        self.frames_per_block
    }

    #[inline]
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    #[inline]
    pub fn capacity(&self) -> Option<usize> {
        self.capacity
    }

    #[inline]
    pub fn is_fixed(&self) -> bool {
        self.capacity.is_some()
    }

    /// One past the furthest sample ever written.
    #[inline]
    pub fn record_position(&self) -> usize {
        self.record_position
    }

    #[inline]
    pub fn playback_position(&self) -> usize {
        self.playback_position
    }

    pub fn set_playback_position(&mut self, position: usize) {
        self.playback_position = position;
    }

    /// Logical extent: the capacity of a fixed tape, the written length of
    /// a dynamic one.
    pub fn size(&self) -> usize {
        match self.capacity {
            Some(cap) => cap,
            None => self.channels.first().map_or(0, Vec::len),
        }
    }

    pub fn size_in_seconds(&self) -> f32 {
        self.size() as f32 / self.sample_rate as f32
    }

    /// Absolute sample range currently held in memory.
    pub fn window(&self) -> Range<usize> {
        match self.capacity {
            Some(cap) => {
                let start = self.record_position.saturating_sub(cap);
                start..start + cap
            }
            None => 0..self.size(),
        }
    }

    /// Counter bumped by every write and by [`clear`](Self::clear).
    #[inline]
    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Whether a write after `revision` touched the absolute samples `range`.
    ///
    /// Only the last few writes are remembered. Older revisions always
    /// report a modification.
    pub fn modified_since(&self, revision: u64, range: Range<usize>) -> bool {
        if revision >= self.revision || range.is_empty() {
            return false;
        }
        let oldest = self.edits.front().map_or(self.revision, |(rev, _)| *rev);
        if oldest > revision + 1 {
            return true;
        }
        self.edits
            .iter()
            .any(|(rev, written)| *rev > revision && written.start < range.end && range.start < written.end)
    }

    fn log_edit(&mut self, range: Range<usize>) {
        self.revision += 1;
        if self.edits.len() == EDIT_HISTORY {
            self.edits.pop_front();
        }
        self.edits.push_back((self.revision, range));
    }

    /// Raw materialized data of one channel, starting at `window().start`.
    pub fn channel(&self, ch: usize) -> Option<&[f32]> {
        self.channels.get(ch).map(Vec::as_slice)
    }

    /// Append one block at the record position.
    pub fn record(&mut self, block: &[f32]) -> Result<(), TapeError> {
        self.record_at(block, self.record_position)
    }

    pub fn record_at_seconds(&mut self, block: &[f32], seconds: f32) -> Result<(), TapeError> {
        let offset = (seconds.max(0.0) * self.sample_rate as f32) as usize;
        self.record_at(block, offset)
    }

    /// Write one channel-major block starting at absolute sample `offset`.
    pub fn record_at(&mut self, block: &[f32], offset: usize) -> Result<(), TapeError> {
        let frames = self.frames_per_block;
        let expected = frames * self.channels.len();
        if block.len() != expected {
            return Err(TapeError::BlockLength {
                expected,
                actual: block.len(),
            });
        }

        let Some(write_end) = offset.checked_add(frames) else {
            return Err(TapeError::OffsetOverflow { offset });
        };
        let (local, touched) = match self.capacity {
            Some(cap) => (self.slide_window(cap, offset, write_end), offset..write_end),
            None => {
                // a gap before the write is zero-filled too
                let grown_from = self.size().min(offset);
                for ch in self.channels.iter_mut() {
                    if ch.len() < write_end {
                        ch.resize(write_end, 0.0);
                    }
                }
                (offset, grown_from..write_end)
            }
        };

        for (ch, src) in self.channels.iter_mut().zip(block.chunks_exact(frames)) {
            ch[local..local + frames].copy_from_slice(src);
        }

        self.record_position = self.record_position.max(write_end);
        self.log_edit(touched);
        Ok(())
    }

    /// Move a fixed window so that `[start, end)` fits, returning the local
    /// index of `start`.
    fn slide_window(&mut self, cap: usize, start: usize, end: usize) -> usize {
        let mut window = self.window();

        if end > window.end {
            let shift = end - window.end;
            for ch in self.channels.iter_mut() {
                if shift >= cap {
                    ch.fill(0.0);
                } else {
                    ch.copy_within(shift.., 0);
                    ch[cap - shift..].fill(0.0);
                }
            }
            window = window.start + shift..window.end + shift;
            tracing::trace!(shift, window = ?window, "tape window moved forward");
        }

        if start < window.start {
            let shift = window.start - start;
            for ch in self.channels.iter_mut() {
                if shift >= cap {
                    ch.fill(0.0);
                } else {
                    ch.copy_within(..cap - shift, shift);
                    ch[..shift].fill(0.0);
                }
            }
            window = start..start + cap;
            // window end and record position must agree
            self.record_position = window.end;
            tracing::trace!(shift, window = ?window, "tape window moved backward");
        }

        start - window.start
    }

    /// Sample at absolute index `index`, or silence outside the window.
    #[inline]
    pub fn sample(&self, ch: usize, index: usize) -> f32 {
        let window = self.window();
        if !window.contains(&index) {
            return 0.0;
        }
        self.channels
            .get(ch)
            .and_then(|data| data.get(index - window.start))
            .copied()
            .unwrap_or(0.0)
    }

    /// One block from the playback position.
    pub fn playback(&self, layout: Layout) -> Vec<f32> {
        self.playback_at(self.frames_per_block, self.playback_position, layout)
    }

    pub fn playback_at_seconds(&self, frames: usize, seconds: f32, layout: Layout) -> Vec<f32> {
        let offset = (seconds.max(0.0) * self.sample_rate as f32) as usize;
        self.playback_at(frames, offset, layout)
    }

    /// Read `frames` per channel starting at absolute sample `offset`.
    pub fn playback_at(&self, frames: usize, offset: usize, layout: Layout) -> Vec<f32> {
        let mut out = vec![0.0; frames * self.channels.len()];
        self.read_into(&mut out, offset, layout);
        out
    }

    /// Fill `out` with `out.len() / channels` frames from `offset`.
    pub fn read_into(&self, out: &mut [f32], offset: usize, layout: Layout) {
        let channels = self.channels.len();
        if channels == 0 {
            return;
        }
        let frames = out.len() / channels;
        let window = self.window();

        for (ch, data) in self.channels.iter().enumerate() {
            for i in 0..frames {
                let value = match offset.checked_add(i) {
                    Some(index) if window.contains(&index) => {
                        data.get(index - window.start).copied().unwrap_or(0.0)
                    }
                    _ => 0.0,
                };
                match layout {
                    Layout::ChannelMajor => out[ch * frames + i] = value,
                    Layout::Interleaved => out[i * channels + ch] = value,
                }
            }
        }
    }

    /// Drop all recorded data and rewind both positions.
    ///
    /// A fixed tape keeps its capacity and is zero-filled.
    pub fn clear(&mut self) {
        for ch in self.channels.iter_mut() {
            match self.capacity {
                Some(_) => ch.fill(0.0),
                None => ch.clear(),
            }
        }
        self.record_position = 0;
        self.playback_position = 0;
        self.log_edit(0..usize::MAX);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> RenderContext {
        RenderContext::new(48_000, 4).with_channels(2)
    }

    #[test]
    fn wrong_block_length_is_rejected() {
        let mut tape = TapeBuffer::new(&ctx());
        let err = tape.record(&[0.0; 3]).unwrap_err();
        assert!(matches!(err, TapeError::BlockLength { expected: 8, actual: 3 }));
        assert_eq!(tape.size(), 0);
    }

    #[test]
    fn backward_shift_keeps_window_anchored_to_record_position() {
        let mut tape = TapeBuffer::with_capacity(&ctx(), 8).unwrap();
        tape.record_at(&[1.0; 8], 16).unwrap();
        assert_eq!(tape.window(), 12..20);

        tape.record_at(&[2.0; 8], 10).unwrap();
        assert_eq!(tape.window(), 10..18);
        assert_eq!(tape.record_position(), 18);
        assert_eq!(tape.sample(0, 10), 2.0);
        assert_eq!(tape.sample(0, 16), 1.0);
        assert_eq!(tape.sample(0, 14), 0.0);
    }

    #[test]
    fn offsets_at_the_end_of_the_timeline() {
        let mut tape = TapeBuffer::new(&ctx());
        tape.record(&[1.0; 8]).unwrap();

        let err = tape.record_at(&[1.0; 8], usize::MAX - 2).unwrap_err();
        assert!(matches!(err, TapeError::OffsetOverflow { .. }));
        assert_eq!(tape.size(), 4);
        assert_eq!(tape.revision(), 1);

        let out = tape.playback_at(4, usize::MAX - 1, Layout::Interleaved);
        assert_eq!(out, [0.0; 8]);
    }

    #[test]
    fn writes_are_tracked_by_range() {
        let mut tape = TapeBuffer::new(&ctx());
        tape.record_at(&[1.0; 8], 0).unwrap();
        let seen = tape.revision();

        tape.record_at(&[2.0; 8], 20).unwrap();
        // the gap 4..20 was filled along with the block
        assert!(tape.modified_since(seen, 10..12));
        assert!(!tape.modified_since(seen, 0..4));
        assert!(!tape.modified_since(tape.revision(), 0..100));

        tape.clear();
        assert!(tape.modified_since(seen, 0..4));
    }

    #[test]
    fn forgotten_writes_count_as_modified() {
        let mut tape = TapeBuffer::new(&ctx());
        for _ in 0..=EDIT_HISTORY {
            tape.record(&[0.0; 8]).unwrap();
        }
        // only far-away writes happened, but the oldest ones are forgotten
        assert!(tape.modified_since(0, 1_000_000..1_000_004));
        assert!(!tape.modified_since(1, 1_000_000..1_000_004));
    }

    #[test]
    fn clear_keeps_fixed_capacity() {
        let mut tape = TapeBuffer::with_capacity(&ctx(), 8).unwrap();
        tape.record(&[1.0; 8]).unwrap();
        tape.clear();
        assert_eq!(tape.size(), 8);
        assert_eq!(tape.record_position(), 0);
        assert_eq!(tape.channel(0), Some(&[0.0; 8][..]));
    }
}
