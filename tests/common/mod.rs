#![allow(dead_code)]

use std::sync::Arc;

use parking_lot::Mutex;
use tapegraph::{Gid, Port, RenderContext, RenderIo, Stage, StageCore};

pub type RenderLog = Arc<Mutex<Vec<Gid>>>;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

pub fn ctx() -> RenderContext {
    RenderContext::new(48_000, 8).with_channels(1)
}

/// A stage with any number of inputs and outputs that records when it
/// renders and writes `1 + sum(inputs)` to every output.
pub struct Probe {
    core: StageCore,
    sink: bool,
    log: RenderLog,
    pub fail_init: bool,
    pub fail_bind: bool,
}

impl Probe {
    pub fn new(inputs: usize, outputs: usize, log: &RenderLog) -> Self {
        let ports = (0..inputs)
            .map(|i| Port::input(format!("in{}", i)))
            .chain((0..outputs).map(|i| Port::output(format!("out{}", i))))
            .collect();
        Self {
            core: StageCore::new(ports),
            sink: false,
            log: log.clone(),
            fail_init: false,
            fail_bind: false,
        }
    }

    pub fn sink(inputs: usize, log: &RenderLog) -> Self {
        Self {
            sink: true,
            ..Self::new(inputs, 0, log)
        }
    }

    pub fn failing_init(mut self) -> Self {
        self.fail_init = true;
        self
    }

    pub fn failing_bind(mut self) -> Self {
        self.fail_bind = true;
        self
    }

    pub fn boxed(self) -> Box<dyn Stage> {
        Box::new(self)
    }
}

impl Stage for Probe {
    fn core(&self) -> &StageCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut StageCore {
        &mut self.core
    }

    fn name(&self) -> &str {
        "probe"
    }

    fn is_sink(&self) -> bool {
        self.sink
    }

    fn init(&mut self, _ctx: &RenderContext) -> bool {
        !self.fail_init
    }

    fn bind(&mut self, _ctx: &RenderContext) -> bool {
        !self.fail_bind
    }

    fn render(&mut self, _time: u64, io: &mut RenderIo<'_>) {
        self.log.lock().push(self.core.gid());

        let (inputs, mut outputs) = io.split();
        let len = outputs.get(0).map_or(0, |o| o.len());
        let mut acc = vec![1.0; len];
        for n in 0..inputs.len() {
            for (a, &x) in acc.iter_mut().zip(inputs.get(n)) {
                *a += x;
            }
        }
        for n in 0..outputs.len() {
            if let Some(out) = outputs.get(n) {
                out.copy_from_slice(&acc);
            }
        }
    }
}

/// Connect `a -> b`, panicking if the ports do not allow it.
pub fn link(a: &mut dyn Stage, b: &mut dyn Stage) {
    assert!(a.connect(b), "failed to connect {} -> {}", a.gid(), b.gid());
}
