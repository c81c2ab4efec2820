//! Sine wave oscillator

use crate::control::{Control, Inbox, DEFAULT_CAPACITY};
use crate::port::{Port, RenderIo};
use crate::stage::{Stage, StageCore};

/// Messages to control a Sine oscillator
#[derive(Clone, Copy, Debug)]
pub enum SineMessage {
    SetFrequency(f32),
    SetAmplitude(f32),
}

/// A sine wave oscillator, identical on every channel.
pub struct Sine {
    core: StageCore,
    inbox: Inbox<SineMessage>,
    frequency: f32,
    phase: f32,
    amplitude: f32,
}

impl Sine {
    pub fn new(frequency: f32) -> Self {
        Self {
            core: StageCore::new(vec![Port::output("out")]),
            inbox: Inbox::new(),
            frequency,
            phase: 0.0,
            amplitude: 0.25, // -12dB, safe default
        }
    }

    pub fn with_amplitude(mut self, amplitude: f32) -> Self {
        self.amplitude = amplitude.clamp(0.0, 1.0);
        self
    }

    pub fn control(&mut self) -> Control<SineMessage> {
        self.inbox.open(self.core.gid(), DEFAULT_CAPACITY)
    }

    #[inline]
    pub fn frequency(&self) -> f32 {
        self.frequency
    }

    #[inline]
    pub fn amplitude(&self) -> f32 {
        self.amplitude
    }
}

impl Stage for Sine {
    fn core(&self) -> &StageCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut StageCore {
        &mut self.core
    }

    fn name(&self) -> &str {
        "sine"
    }

    fn render(&mut self, _time: u64, io: &mut RenderIo<'_>) {
        for msg in self.inbox.drain() {
            match msg {
                SineMessage::SetFrequency(f) => self.frequency = f.max(0.0),
                SineMessage::SetAmplitude(a) => self.amplitude = a.clamp(0.0, 1.0),
            }
        }

        let ctx = *io.ctx();
        let phase_inc = self.frequency / ctx.sample_rate as f32;
        let Some(out) = io.output(0) else {
            return;
        };

        let frames = ctx.frames_per_block.min(out.len());
        let (first, rest) = out.split_at_mut(frames);
        for sample in first.iter_mut() {
            *sample = (self.phase * core::f32::consts::TAU).sin() * self.amplitude;
            self.phase += phase_inc;
            // Branchless phase wrap (phase is always positive)
            self.phase -= (self.phase >= 1.0) as u32 as f32;
        }

        for channel in rest.chunks_exact_mut(frames.max(1)) {
            channel.copy_from_slice(first);
        }
    }
}
