//! Tapegraph - block-based audio render graph with sample-accurate tapes
//!
//! Design principles:
//! - One explicit [`RenderContext`] per engine, no global state
//! - The graph owns its stages by [`Gid`]; adjacency is GID sets, never pointers
//! - Structural edits are all-or-nothing and safe while a render thread is running
//! - Stage parameters arrive over lock-free message queues ([`Control`])
//! - Tapes are shared, heads only ever hold weak references to them
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use tapegraph::{Engine, RenderContext, Stage, StageGraph, SwapBuffer, TapeBuffer};
//! use tapegraph::stages::{FinalStage, Sine, TapeRecorder};
//!
//! let ctx = RenderContext::new(48_000, 64);
//! let swap = Arc::new(SwapBuffer::new(ctx.block_len()));
//! let tape = TapeBuffer::new(&ctx).shared();
//!
//! let mut sine = Sine::new(440.0);
//! let mut rec = TapeRecorder::new(tape.clone());
//! let mut out = FinalStage::new(swap.clone());
//! sine.connect(&mut rec);
//! rec.connect(&mut out);
//! let sink = out.gid();
//!
//! let stages: Vec<Box<dyn Stage>> = vec![Box::new(sine), Box::new(rec), Box::new(out)];
//! let mut engine = Engine::new(StageGraph::from_sink(ctx, stages, sink).unwrap(), swap);
//! engine.initialize().unwrap();
//!
//! for _ in 0..4 {
//!     engine.process();
//! }
//! assert_eq!(tape.read().size(), 4 * 64);
//! ```

mod context;
mod control;
mod engine;
mod graph;
mod port;
mod stage;
mod swap;
mod tape;

pub mod output;
pub mod stages;

pub use context::RenderContext;
pub use control::{Control, Inbox};
pub use engine::Engine;
pub use graph::{GraphError, StageGraph};
pub use output::{AudioOutput, RtrbOutput};
pub use port::{Inputs, Outputs, Port, PortBus, PortKey, PortRole, RenderIo};
pub use stage::{Gid, GidSet, Stage, StageCore};
pub use swap::SwapBuffer;
pub use tape::{Layout, SharedTape, TapeBuffer, TapeError, TapeHead, TapeWindow};
