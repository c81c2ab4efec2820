//! The graph's terminal stage.

use std::sync::Arc;

use crate::context::RenderContext;
use crate::port::{Port, RenderIo};
use crate::stage::{Stage, StageCore};
use crate::swap::SwapBuffer;

/// The sink of every graph: interleaves its input block, writes it to a
/// [`SwapBuffer`], publishes it and wakes the consumer.
pub struct FinalStage {
    core: StageCore,
    swap: Arc<SwapBuffer>,
    scratch: Vec<f32>,
}

impl FinalStage {
    pub fn new(swap: Arc<SwapBuffer>) -> Self {
        Self {
            core: StageCore::new(vec![Port::input("in")]),
            swap,
            scratch: Vec::new(),
        }
    }

    pub fn swap(&self) -> &Arc<SwapBuffer> {
        &self.swap
    }
}

impl Stage for FinalStage {
    fn core(&self) -> &StageCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut StageCore {
        &mut self.core
    }

    fn name(&self) -> &str {
        "final"
    }

    fn is_sink(&self) -> bool {
        true
    }

    fn bind(&mut self, ctx: &RenderContext) -> bool {
        if self.swap.len() != ctx.block_len() {
            tracing::error!(
                gid = %self.core.gid(),
                swap_len = self.swap.len(),
                block_len = ctx.block_len(),
                "swap buffer does not hold one block"
            );
            return false;
        }
        self.scratch.resize(ctx.block_len(), 0.0);
        true
    }

    fn render(&mut self, time: u64, io: &mut RenderIo<'_>) {
        let ctx = *io.ctx();
        let input = io.input(0);
        let frames = ctx.frames_per_block;

        self.scratch.fill(0.0);
        for (ch, channel) in input.chunks(frames).take(ctx.channels).enumerate() {
            for (i, &s) in channel.iter().enumerate() {
                self.scratch[i * ctx.channels + ch] = s;
            }
        }

        self.swap.write_buffer(&self.scratch);
        self.swap.swap_buffers();
        self.swap.notify();
        tracing::trace!(time, "block published");
    }
}
