//! Gain/volume control effect

use crate::control::{Control, Inbox, DEFAULT_CAPACITY};
use crate::port::{Port, RenderIo};
use crate::stage::{Stage, StageCore};

/// Messages to control gain
#[derive(Clone, Copy, Debug)]
pub enum GainMessage {
    /// Set the gain multiplier (1.0 = unity, 0.0 = silence)
    SetGain(f32),
}

/// Scales its input, with optional smoothing toward the target gain.
///
/// Also carries an init-only `offset` port (one sample) whose value is added
/// to every output sample; the host writes it with
/// [`StageGraph::write_port`](crate::StageGraph::write_port).
pub struct Gain {
    core: StageCore,
    inbox: Inbox<GainMessage>,
    gain: f32,
    /// Smoothing to prevent clicks on rapid gain changes
    smoothed_gain: f32,
    /// Smoothing coefficient (0.0 = instant, 1.0 = no change)
    smooth_coeff: f32,
}

impl Gain {
    pub fn new(gain: f32) -> Self {
        Self {
            core: StageCore::new(vec![
                Port::input("in"),
                Port::output("out"),
                Port::init_only("offset", 1),
            ]),
            inbox: Inbox::new(),
            gain,
            smoothed_gain: gain,
            smooth_coeff: 0.0,
        }
    }

    /// Set the smoothing time in milliseconds
    pub fn with_smoothing_ms(mut self, ms: f32, sample_rate: u32) -> Self {
        // after `ms` milliseconds the gain has covered ~63% of the step
        let samples = (ms / 1000.0) * sample_rate as f32;
        self.smooth_coeff = if samples > 0.0 { (-1.0 / samples).exp() } else { 0.0 };
        self
    }

    pub fn control(&mut self) -> Control<GainMessage> {
        self.inbox.open(self.core.gid(), DEFAULT_CAPACITY)
    }

    #[inline]
    pub fn gain(&self) -> f32 {
        self.gain
    }
}

impl Stage for Gain {
    fn core(&self) -> &StageCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut StageCore {
        &mut self.core
    }

    fn name(&self) -> &str {
        "gain"
    }

    fn render(&mut self, _time: u64, io: &mut RenderIo<'_>) {
        for GainMessage::SetGain(g) in self.inbox.drain() {
            self.gain = g;
        }

        let frames = io.ctx().frames_per_block;
        let (inputs, mut outputs) = io.split();
        let offset = inputs.param("offset").and_then(|p| p.first().copied()).unwrap_or(0.0);
        let input = inputs.get(0);
        let Some(out) = outputs.get(0) else {
            return;
        };
        if input.is_empty() {
            out.fill(offset);
            return;
        }

        let target = self.gain;
        let coeff = self.smooth_coeff;
        let mut current = self.smoothed_gain;

        for (ch, (out_ch, in_ch)) in out
            .chunks_mut(frames)
            .zip(input.chunks(frames))
            .enumerate()
        {
            // every channel follows the same gain curve
            let mut gain = self.smoothed_gain;
            for (o, &i) in out_ch.iter_mut().zip(in_ch) {
                gain = target + coeff * (gain - target);
                *o = i * gain + offset;
            }
            if ch == 0 {
                current = gain;
            }
        }

        self.smoothed_gain = current;
    }
}
