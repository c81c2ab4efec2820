//! Host-level driver: block clock, graph and output pump.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::context::RenderContext;
use crate::graph::{GraphError, StageGraph};
use crate::output::AudioOutput;
use crate::swap::SwapBuffer;

const PUMP_POLL: Duration = Duration::from_millis(1);

struct Pump {
    stop: Arc<AtomicBool>,
    thread: JoinHandle<()>,
}

/// Drives a [`StageGraph`] one block at a time and feeds its output to an
/// [`AudioOutput`] on a separate thread.
///
/// The graph's sink is expected to publish every block to the engine's
/// [`SwapBuffer`] (as [`FinalStage`](crate::stages::FinalStage) does). The
/// output pump waits on the swap buffer, reads each published block and
/// pushes it to the output, so a slow device never blocks rendering.
///
/// ```
/// use std::sync::Arc;
/// use tapegraph::{Engine, RenderContext, Stage, StageGraph, SwapBuffer};
/// use tapegraph::stages::{Constant, FinalStage};
///
/// let ctx = RenderContext::new(48_000, 8).with_channels(1);
/// let swap = Arc::new(SwapBuffer::new(ctx.block_len()));
///
/// let mut source = Constant::new(0.5);
/// let mut sink = FinalStage::new(swap.clone());
/// source.connect(&mut sink);
/// let sink_gid = sink.gid();
///
/// let stages: Vec<Box<dyn Stage>> = vec![Box::new(source), Box::new(sink)];
/// let graph = StageGraph::from_sink(ctx, stages, sink_gid).unwrap();
///
/// let mut engine = Engine::new(graph, swap);
/// engine.initialize().unwrap();
/// engine.process();
/// assert_eq!(engine.time(), 1);
/// assert_eq!(**engine.swap().read_buffer(), [0.5; 8]);
/// ```
pub struct Engine {
    graph: Arc<StageGraph>,
    swap: Arc<SwapBuffer>,
    /// Blocks processed so far; the time passed to the next render
    time: u64,
    pump: Option<Pump>,
}

impl Engine {
    pub fn new(graph: StageGraph, swap: Arc<SwapBuffer>) -> Self {
        Self {
            graph: Arc::new(graph),
            swap,
            time: 0,
            pump: None,
        }
    }

    #[inline]
    pub fn ctx(&self) -> &RenderContext {
        self.graph.ctx()
    }

    pub fn initialize(&self) -> Result<(), GraphError> {
        self.graph.initialize()
    }

    /// Shared handle to the graph, for structural edits from other threads.
    #[inline]
    pub fn graph(&self) -> &Arc<StageGraph> {
        &self.graph
    }

    #[inline]
    pub fn swap(&self) -> &Arc<SwapBuffer> {
        &self.swap
    }

    #[inline]
    pub fn time(&self) -> u64 {
        self.time
    }

    /// Render one block at the current time and advance the clock.
    ///
    /// Call this from the render thread, ahead of the output by a few
    /// blocks:
    ///
    /// ```no_run
    /// # fn engine() -> tapegraph::Engine { unimplemented!() }
    /// # let mut engine = engine();
    /// use std::time::{Duration, Instant};
    ///
    /// let start = Instant::now();
    /// let rate = engine.ctx().sample_rate as f64;
    /// let frames = engine.ctx().frames_per_block as f64;
    ///
    /// loop {
    ///     let target = (start.elapsed().as_secs_f64() * rate / frames) as u64 + 4;
    ///     while engine.time() < target {
    ///         engine.process();
    ///     }
    ///     std::thread::sleep(Duration::from_micros(500));
    /// }
    /// ```
    pub fn process(&mut self) {
        self.graph.render(self.time);
        self.time += 1;
    }

    /// Start a thread that forwards every published block to `output`.
    ///
    /// Replaces (and joins) any running output thread.
    pub fn spawn_output<O: AudioOutput>(&mut self, mut output: O) {
        self.stop_output();

        let stop = Arc::new(AtomicBool::new(false));
        let swap = self.swap.clone();
        let thread = {
            let stop = stop.clone();
            std::thread::spawn(move || {
                let mut dropped = 0u64;
                while !stop.load(Ordering::Acquire) {
                    if !swap.wait_timeout(PUMP_POLL) {
                        continue;
                    }
                    let block = swap.read_buffer();
                    if !output.push(&block) {
                        dropped += 1;
                    }
                }
                tracing::debug!(dropped, "output pump stopped");
            })
        };

        self.pump = Some(Pump { stop, thread });
    }

    /// Stop and join the output thread. Returns `false` if none was running.
    pub fn stop_output(&mut self) -> bool {
        let Some(pump) = self.pump.take() else {
            return false;
        };
        pump.stop.store(true, Ordering::Release);
        if pump.thread.join().is_err() {
            tracing::error!("output pump panicked");
        }
        true
    }

    #[inline]
    pub fn is_output_running(&self) -> bool {
        self.pump.is_some()
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.stop_output();
    }
}
