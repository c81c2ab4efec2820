//! Tape playback source

use delegate::delegate;

use crate::context::RenderContext;
use crate::control::{Control, Inbox, DEFAULT_CAPACITY};
use crate::port::{Port, RenderIo};
use crate::stage::{Stage, StageCore};
use crate::tape::{SharedTape, TapeHead};

/// Messages to control a [`TapePlayback`]
#[derive(Clone, Debug)]
pub enum TapeMessage {
    /// Speed ratio, negative plays backwards. Applied from the next block on.
    SetSpeed(f32),
    SetPosition(usize),
    SetPositionSeconds(f32),
    Start,
    Stop,
    SetLoop(bool),
    SetTape(SharedTape),
}

/// Plays a shared tape through a [`TapeHead`].
///
/// Every block the head is advanced to the block time, its window is
/// re-read only if it no longer covers the block, and the block is rendered
/// from the window.
pub struct TapePlayback {
    core: StageCore,
    inbox: Inbox<TapeMessage>,
    head: TapeHead,
}

impl TapePlayback {
    pub fn new(ctx: &RenderContext, tape: &SharedTape) -> Self {
        Self::with_head(TapeHead::new(ctx).with_tape(tape))
    }

    pub fn with_head(head: TapeHead) -> Self {
        Self {
            core: StageCore::new(vec![Port::output("out")]),
            inbox: Inbox::new(),
            head,
        }
    }

    pub fn control(&mut self) -> Control<TapeMessage> {
        self.inbox.open(self.core.gid(), DEFAULT_CAPACITY)
    }

    #[inline]
    pub fn head(&self) -> &TapeHead {
        &self.head
    }

    #[inline]
    pub fn head_mut(&mut self) -> &mut TapeHead {
        &mut self.head
    }

    delegate! {
        to self.head {
            pub fn set_speed(&mut self, ratio: f32);
            pub fn set_position(&mut self, samples: usize);
            pub fn set_position_seconds(&mut self, seconds: f32);
            pub fn start(&mut self);
            pub fn stop(&mut self);
            pub fn set_loop(&mut self, looping: bool);
            pub fn set_tape(&mut self, tape: &SharedTape);
            pub fn position(&self) -> usize;
            pub fn is_stopped(&self) -> bool;
            pub fn is_at_beginning(&self) -> bool;
            pub fn is_at_end(&self) -> bool;
        }
    }
}

fn apply(head: &mut TapeHead, msg: TapeMessage) {
    match msg {
        TapeMessage::SetSpeed(ratio) => head.set_speed(ratio),
        TapeMessage::SetPosition(p) => head.set_position(p),
        TapeMessage::SetPositionSeconds(s) => head.set_position_seconds(s),
        TapeMessage::Start => head.start(),
        TapeMessage::Stop => head.stop(),
        TapeMessage::SetLoop(l) => head.set_loop(l),
        TapeMessage::SetTape(tape) => head.set_tape(&tape),
    }
}

impl Stage for TapePlayback {
    fn core(&self) -> &StageCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut StageCore {
        &mut self.core
    }

    fn name(&self) -> &str {
        "tape_playback"
    }

    fn bind(&mut self, _ctx: &RenderContext) -> bool {
        if !self.head.is_bound() {
            tracing::debug!(gid = %self.core.gid(), "tape playback bound without a tape");
        }
        true
    }

    fn render(&mut self, time: u64, io: &mut RenderIo<'_>) {
        for msg in self.inbox.drain() {
            apply(&mut self.head, msg);
        }

        self.head.update_position(time);
        self.head.ensure_window();

        let channels = io.ctx().channels;
        if let Some(out) = io.output(0) {
            self.head.read_block(out, channels);
        }
    }
}
