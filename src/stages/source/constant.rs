use crate::control::{Control, Inbox, DEFAULT_CAPACITY};
use crate::port::{Port, RenderIo};
use crate::stage::{Stage, StageCore};

#[derive(Clone, Copy, Debug)]
pub enum ConstantMessage {
    SetValue(f32),
}

/// Emits the same value on every sample of every channel.
pub struct Constant {
    core: StageCore,
    inbox: Inbox<ConstantMessage>,
    value: f32,
}

impl Constant {
    pub fn new(value: f32) -> Self {
        Self {
            core: StageCore::new(vec![Port::output("out")]),
            inbox: Inbox::new(),
            value,
        }
    }

    pub fn control(&mut self) -> Control<ConstantMessage> {
        self.inbox.open(self.core.gid(), DEFAULT_CAPACITY)
    }

    #[inline]
    pub fn value(&self) -> f32 {
        self.value
    }
}

impl Stage for Constant {
    fn core(&self) -> &StageCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut StageCore {
        &mut self.core
    }

    fn name(&self) -> &str {
        "constant"
    }

    fn render(&mut self, _time: u64, io: &mut RenderIo<'_>) {
        for ConstantMessage::SetValue(v) in self.inbox.drain() {
            self.value = v;
        }
        if let Some(out) = io.output(0) {
            out.fill(self.value);
        }
    }
}
