use std::ops::Range;
use std::sync::{Arc, Weak};

use parking_lot::RwLock;

use crate::context::RenderContext;
use crate::tape::{Layout, SharedTape, TapeBuffer};

const DEFAULT_WINDOW_SECONDS: f32 = 2.0;

/// The slice of a tape a [`TapeHead`] has materialized for reading.
///
/// Offsets are head positions (`0..tape.size()`), not absolute tape indices.
/// A looping head whose next block crosses the tape end also keeps a short
/// *seam*: the span on the far side of the loop point.
#[derive(Clone, Debug, Default)]
pub struct TapeWindow {
    offset: usize,
    len: usize,
    channels: usize,
    data: Vec<f32>,
    seam_offset: usize,
    seam_len: usize,
    seam_data: Vec<f32>,
    forward: bool,
    /// tape size last seen, the loop length
    size: usize,
    /// absolute tape index of head position 0 when the window was read
    origin: usize,
    /// tape revision the window is known to match
    revision: u64,
    valid: bool,
}

impl TapeWindow {
    #[inline]
    pub fn offset(&self) -> usize {
        self.offset
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// Channel-major window data, `len` samples per channel.
    #[inline]
    pub fn data(&self) -> &[f32] {
        &self.data
    }

    /// Head positions held past the loop point, if any.
    pub fn seam(&self) -> Option<Range<usize>> {
        (self.seam_len > 0).then(|| self.seam_offset..self.seam_offset + self.seam_len)
    }

    fn covers(&self, range: &Range<usize>) -> bool {
        let within = |offset: usize, len: usize| offset <= range.start && range.end <= offset + len;
        range.is_empty()
            || within(self.offset, self.len)
            || (self.seam_len > 0 && within(self.seam_offset, self.seam_len))
    }

    #[inline]
    fn sample(&self, ch: usize, pos: usize) -> f32 {
        if ch >= self.channels {
            0.0
        } else if pos >= self.offset && pos < self.offset + self.len {
            self.data[ch * self.len + pos - self.offset]
        } else if pos >= self.seam_offset && pos < self.seam_offset + self.seam_len {
            self.seam_data[ch * self.seam_len + pos - self.seam_offset]
        } else {
            0.0
        }
    }
}

/// A playback cursor over a [`TapeBuffer`].
///
/// The head does not own its tape: it holds a weak reference, so the tape
/// can be dropped or swapped at any time and the head simply falls silent.
///
/// Speed is stored in samples per block and may be negative. A speed set
/// with [`set_speed`](Self::set_speed) becomes active only after the next
/// [`update_position`](Self::update_position), so the block currently being
/// advanced is always advanced with the speed it was rendered at.
///
/// ```
/// use tapegraph::{RenderContext, TapeBuffer, TapeHead};
///
/// let ctx = RenderContext::new(48_000, 4).with_channels(1);
/// let tape = TapeBuffer::from_channels(4, 48_000, vec![vec![0.0; 64]]).unwrap().shared();
///
/// let mut head = TapeHead::new(&ctx).with_tape(&tape);
/// head.update_position(0);
/// head.update_position(1);
/// assert_eq!(head.position(), 4);
///
/// head.set_speed(2.0);
/// head.update_position(2);
/// assert_eq!(head.position(), 8);
/// head.update_position(3);
/// assert_eq!(head.position(), 16);
/// ```
#[derive(Debug)]
pub struct TapeHead {
    tape: Weak<RwLock<TapeBuffer>>,
    frames_per_block: usize,
    sample_rate: u32,

    position: usize,
    speed: i64,
    pending_speed: Option<i64>,
    stopped: bool,
    looping: bool,
    last_time: Option<u64>,

    window_capacity: usize,
    window: TapeWindow,
    uploads: u64,
}

impl TapeHead {
    /// An unbound head at position 0, playing forward at normal speed.
    pub fn new(ctx: &RenderContext) -> Self {
        let mut head = Self {
            tape: Weak::new(),
            frames_per_block: ctx.frames_per_block,
            sample_rate: ctx.sample_rate,
            position: 0,
            speed: ctx.frames_per_block as i64,
            pending_speed: None,
            stopped: false,
            looping: false,
            last_time: None,
            window_capacity: 0,
            window: TapeWindow::default(),
            uploads: 0,
        };
        head.set_window_seconds(DEFAULT_WINDOW_SECONDS);
        head
    }

    pub fn with_tape(mut self, tape: &SharedTape) -> Self {
        self.set_tape(tape);
        self
    }

    pub fn with_window_seconds(mut self, seconds: f32) -> Self {
        self.set_window_seconds(seconds);
        self
    }

    pub fn with_loop(mut self, looping: bool) -> Self {
        self.looping = looping;
        self
    }

    /// Point the head at another tape. The next update re-anchors the clock.
    pub fn set_tape(&mut self, tape: &SharedTape) {
        self.tape = Arc::downgrade(tape);
        self.last_time = None;
        self.window.valid = false;
    }

    pub fn detach(&mut self) {
        self.tape = Weak::new();
        self.window.valid = false;
    }

    pub fn tape(&self) -> Option<SharedTape> {
        self.tape.upgrade()
    }

    #[inline]
    pub fn is_bound(&self) -> bool {
        self.tape.strong_count() > 0
    }

    /// Size of the window the head materializes, never less than one block.
    pub fn set_window_seconds(&mut self, seconds: f32) {
        let samples = (seconds.max(0.0) * self.sample_rate as f32) as usize;
        self.window_capacity = samples.max(self.frames_per_block);
        self.window.valid = false;
    }

    #[inline]
    pub fn position(&self) -> usize {
        self.position
    }

    pub fn position_in_seconds(&self) -> f32 {
        self.position as f32 / self.sample_rate as f32
    }

    pub fn set_position(&mut self, samples: usize) {
        self.position = samples;
    }

    pub fn set_position_seconds(&mut self, seconds: f32) {
        self.set_position((seconds.max(0.0) * self.sample_rate as f32) as usize);
    }

    /// Set the playback speed as a ratio of normal speed (negative plays backwards).
    ///
    /// Before the first update the new speed applies at once; afterwards it
    /// is deferred to the next update.
    pub fn set_speed(&mut self, ratio: f32) {
        let samples = (ratio * self.frames_per_block as f32).round() as i64;
        if self.last_time.is_none() {
            self.speed = samples;
            self.pending_speed = None;
        } else {
            self.pending_speed = Some(samples);
        }
    }

    #[inline]
    pub fn speed_ratio(&self) -> f32 {
        self.speed as f32 / self.frames_per_block as f32
    }

    #[inline]
    pub fn speed_samples_per_block(&self) -> i64 {
        self.speed
    }

    #[inline]
    pub fn speed_samples_per_second(&self) -> f32 {
        self.speed as f32 * self.sample_rate as f32 / self.frames_per_block as f32
    }

    /// A speed waiting for the next update, in samples per block.
    #[inline]
    pub fn pending_speed(&self) -> Option<i64> {
        self.pending_speed
    }

    pub fn start(&mut self) {
        self.stopped = false;
    }

    pub fn stop(&mut self) {
        self.stopped = true;
    }

    #[inline]
    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    pub fn set_loop(&mut self, looping: bool) {
        self.looping = looping;
    }

    #[inline]
    pub fn is_looping(&self) -> bool {
        self.looping
    }

    #[inline]
    pub fn is_at_beginning(&self) -> bool {
        self.position == 0
    }

    pub fn is_at_end(&self) -> bool {
        match self.tape.upgrade() {
            Some(tape) => self.position >= tape.read().size(),
            None => false,
        }
    }

    /// Advance the head to block time `time`.
    ///
    /// The first call after creation or rebinding only anchors the clock.
    /// A clock that moves backwards re-anchors without moving the head.
    pub fn update_position(&mut self, time: u64) {
        let Some(last) = self.last_time else {
            self.last_time = Some(time);
            return;
        };
        if time < last {
            tracing::debug!(time, last, "tape head clock moved backwards, re-anchoring");
            self.last_time = Some(time);
            return;
        }
        let delta = time - last;
        if delta == 0 {
            return;
        }
        self.last_time = Some(time);

        // advance with the speed the previous blocks were rendered at
        let advance = delta as i64 * self.speed;
        if let Some(speed) = self.pending_speed.take() {
            self.speed = speed;
        }
        if self.stopped || advance == 0 {
            return;
        }
        let Some(tape) = self.tape.upgrade() else {
            return;
        };
        let size = tape.read().size() as i64;

        let target = self.position as i64 + advance;
        if self.looping && size > 0 {
            self.position = target.rem_euclid(size) as usize;
        } else if advance > 0 && target >= size {
            self.position = size.max(0) as usize;
            self.stopped = true;
        } else if advance < 0 && target <= 0 {
            self.position = 0;
            self.stopped = true;
        } else {
            self.position = target as usize;
        }
    }

    #[inline]
    pub fn window(&self) -> &TapeWindow {
        &self.window
    }

    #[inline]
    pub fn window_size_samples(&self) -> usize {
        self.window_capacity
    }

    pub fn window_size_seconds(&self) -> f32 {
        self.window_capacity as f32 / self.sample_rate as f32
    }

    #[inline]
    pub fn window_offset_samples(&self) -> usize {
        self.window.offset
    }

    pub fn window_offset_seconds(&self) -> f32 {
        self.window.offset as f32 / self.sample_rate as f32
    }

    /// How many times the window has been re-read from the tape.
    #[inline]
    pub fn uploads(&self) -> u64 {
        self.uploads
    }

    /// Positions the next block will read, clipped to the tape, and the
    /// wrapped span when a looping block crosses the loop point.
    fn needed(&self, size: usize) -> (Range<usize>, Option<Range<usize>>) {
        let reach = self.speed.unsigned_abs() as usize + 1;
        let looping = self.looping && size > 0;
        let position = if looping { self.position % size } else { self.position };

        if self.speed >= 0 {
            let end = position.saturating_add(reach + 1);
            if looping && end > size {
                (position..size, Some(0..(end - size).min(size)))
            } else {
                (position.min(size)..end.min(size), None)
            }
        } else {
            let end = position.saturating_add(1).min(size);
            if looping && reach > position {
                (0..end, Some(size.saturating_sub(reach - position)..size))
            } else {
                (position.saturating_sub(reach).min(size)..end, None)
            }
        }
    }

    fn outdated_against(&self, tape: &TapeBuffer) -> bool {
        let window = &self.window;
        if !window.valid || window.forward != (self.speed >= 0) || window.origin != tape.window().start {
            return true;
        }
        let absolute = |offset: usize, len: usize| window.origin + offset..window.origin + offset + len;
        if tape.modified_since(window.revision, absolute(window.offset, window.len))
            || tape.modified_since(window.revision, absolute(window.seam_offset, window.seam_len))
        {
            return true;
        }
        let (span, wrapped) = self.needed(tape.size());
        !window.covers(&span) || wrapped.is_some_and(|w| !window.covers(&w))
    }

    /// Whether the window must be re-read before the next block.
    ///
    /// Writes elsewhere on the tape leave the window alone; only a write
    /// inside it or a fixed tape sliding under it forces a re-read.
    pub fn is_outdated(&self) -> bool {
        match self.tape.upgrade() {
            Some(tape) => self.outdated_against(&tape.read()),
            // a window over a dropped tape must be discarded
            None => self.window.valid,
        }
    }

    /// Re-read the window from the tape around the current position.
    pub fn refresh_window(&mut self) {
        match self.tape.upgrade() {
            Some(tape) => self.refresh_from(&tape.read()),
            None => self.window.valid = false,
        }
    }

    fn refresh_from(&mut self, tape: &TapeBuffer) {
        let size = tape.size();
        let len = self.window_capacity.min(size);
        let forward = self.speed >= 0;
        let (span, wrapped) = self.needed(size);
        let offset = if forward {
            span.start.min(size - len)
        } else {
            span.end.saturating_sub(len).min(size - len)
        };

        let origin = tape.window().start;
        let channels = tape.channel_count();
        let window = &mut self.window;
        window.offset = offset;
        window.len = len;
        window.channels = channels;
        window.data.resize(len * channels, 0.0);
        tape.read_into(&mut window.data, origin + offset, Layout::ChannelMajor);

        let seam = wrapped.filter(|w| !window.covers(w)).unwrap_or(0..0);
        window.seam_offset = seam.start;
        window.seam_len = seam.len();
        window.seam_data.resize(seam.len() * channels, 0.0);
        tape.read_into(&mut window.seam_data, origin + seam.start, Layout::ChannelMajor);

        window.forward = forward;
        window.size = size;
        window.origin = origin;
        window.revision = tape.revision();
        window.valid = true;
        self.uploads += 1;
        tracing::trace!(offset, len, seam = ?self.window.seam(), forward, "tape head window refreshed");
    }

    /// Refresh the window only if it no longer serves the next block.
    pub fn ensure_window(&mut self) -> bool {
        let Some(tape) = self.tape.upgrade() else {
            let stale = self.window.valid;
            self.window.valid = false;
            return stale;
        };
        let tape = tape.read();
        if self.outdated_against(&tape) {
            self.refresh_from(&tape);
            return true;
        }
        // no write since the last check touched the window
        self.window.revision = tape.revision();
        self.window.size = tape.size();
        false
    }

    /// Render one channel-major block into `out` from the window.
    ///
    /// Reads between samples are linearly interpolated. A stopped or unbound
    /// head renders silence.
    pub fn read_block(&self, out: &mut [f32], channels: usize) {
        out.fill(0.0);
        if self.stopped || !self.window.valid || channels == 0 {
            return;
        }
        let size = self.window.size;
        let frames = out.len() / channels;
        if size == 0 || frames == 0 {
            return;
        }
        let step = self.speed as f64 / self.frames_per_block as f64;
        let wrap = self.looping;

        for (ch, block) in out.chunks_exact_mut(frames).enumerate().take(channels) {
            for (i, sample) in block.iter_mut().enumerate() {
                let mut p = self.position as f64 + step * i as f64;
                if wrap {
                    p = p.rem_euclid(size as f64);
                }
                if p < 0.0 || p >= size as f64 {
                    continue;
                }
                let i0 = p.floor() as usize;
                let frac = (p - i0 as f64) as f32;
                let i1 = if wrap { (i0 + 1) % size } else { i0 + 1 };
                let a = self.window.sample(ch, i0);
                let b = if frac > 0.0 { self.window.sample(ch, i1) } else { 0.0 };
                *sample = a + (b - a) * frac;
            }
        }
    }
}
