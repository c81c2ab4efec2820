use crate::context::RenderContext;
use crate::control::{Control, Inbox, DEFAULT_CAPACITY};
use crate::port::{Port, RenderIo};
use crate::stage::{Stage, StageCore};
use crate::tape::SharedTape;

#[derive(Clone, Debug)]
pub enum RecorderMessage {
    Arm,
    Disarm,
    SetTape(SharedTape),
}

/// Passes its input through unchanged and, while armed, appends every block
/// to a shared tape.
///
/// Binding fails if the tape's block shape does not match the context.
pub struct TapeRecorder {
    core: StageCore,
    inbox: Inbox<RecorderMessage>,
    tape: SharedTape,
    armed: bool,
    /// set after the first failed write so the log is not flooded
    failed: bool,
}

impl TapeRecorder {
    pub fn new(tape: SharedTape) -> Self {
        Self {
            core: StageCore::new(vec![Port::input("in"), Port::output("out")]),
            inbox: Inbox::new(),
            tape,
            armed: true,
            failed: false,
        }
    }

    /// Start disarmed.
    pub fn disarmed(mut self) -> Self {
        self.armed = false;
        self
    }

    pub fn control(&mut self) -> Control<RecorderMessage> {
        self.inbox.open(self.core.gid(), DEFAULT_CAPACITY)
    }

    #[inline]
    pub fn is_armed(&self) -> bool {
        self.armed
    }

    pub fn tape(&self) -> &SharedTape {
        &self.tape
    }
}

impl Stage for TapeRecorder {
    fn core(&self) -> &StageCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut StageCore {
        &mut self.core
    }

    fn name(&self) -> &str {
        "tape_recorder"
    }

    fn bind(&mut self, ctx: &RenderContext) -> bool {
        let tape = self.tape.read();
        let fits = tape.channel_count() == ctx.channels
            && tape.frames_per_block() == ctx.frames_per_block;
        if !fits {
            tracing::error!(
                gid = %self.core.gid(),
                tape_channels = tape.channel_count(),
                tape_frames = tape.frames_per_block(),
                channels = ctx.channels,
                frames = ctx.frames_per_block,
                "tape does not match the render context"
            );
        }
        fits
    }

    fn render(&mut self, _time: u64, io: &mut RenderIo<'_>) {
        for msg in self.inbox.drain() {
            match msg {
                RecorderMessage::Arm => self.armed = true,
                RecorderMessage::Disarm => self.armed = false,
                RecorderMessage::SetTape(tape) => {
                    self.tape = tape;
                    self.failed = false;
                }
            }
        }

        let (inputs, mut outputs) = io.split();
        let input = inputs.get(0);
        if let Some(out) = outputs.get(0) {
            let n = out.len().min(input.len());
            out[..n].copy_from_slice(&input[..n]);
            out[n..].fill(0.0);
        }

        if !self.armed || input.is_empty() {
            return;
        }
        if let Err(e) = self.tape.write().record(input) {
            if !self.failed {
                tracing::warn!(gid = %self.core.gid(), error = %e, "tape recording failed");
                self.failed = true;
            }
        }
    }
}
