//! Mixer effect - sums multiple inputs together

use crate::port::{Port, RenderIo};
use crate::stage::{Stage, StageCore};

/// Sums up to `inputs` upstream blocks with equal weight.
///
/// Each upstream stage connected to the mixer takes the next free input.
/// Unconnected inputs own a silent block and contribute nothing.
pub struct Mixer {
    core: StageCore,
}

impl Mixer {
    pub fn new(inputs: usize) -> Self {
        let mut ports: Vec<Port> = (0..inputs.max(1))
            .map(|i| Port::input(format!("in{i}")))
            .collect();
        ports.push(Port::output("out"));
        Self {
            core: StageCore::new(ports),
        }
    }

    pub fn num_inputs(&self) -> usize {
        self.core.ports().len() - 1
    }
}

impl Stage for Mixer {
    fn core(&self) -> &StageCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut StageCore {
        &mut self.core
    }

    fn name(&self) -> &str {
        "mixer"
    }

    fn render(&mut self, _time: u64, io: &mut RenderIo<'_>) {
        let (inputs, mut outputs) = io.split();
        let Some(out) = outputs.get(0) else {
            return;
        };
        out.fill(0.0);

        for n in 0..inputs.len() {
            for (o, &i) in out.iter_mut().zip(inputs.get(n)) {
                *o += i;
            }
        }
    }
}
