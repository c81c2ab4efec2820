//! Built-in CPU stages.
//!
//! Stages are organized into three categories:
//!
//! ## Sources ([`source`])
//!
//! Produce blocks with no upstream stages:
//! - [`Sine`] - Sine oscillator with frequency/amplitude control
//! - [`Constant`] - A steady value on every sample
//! - [`TapePlayback`] - A [`TapeHead`](crate::TapeHead) reading a shared tape
//!
//! ## Effects ([`effect`])
//!
//! Transform upstream blocks:
//! - [`Gain`] - Volume control with smoothing
//! - [`Mixer`] - Sum several inputs
//! - [`TapeRecorder`] - Record the block into a shared tape and pass it on
//!
//! ## Sinks ([`sink`])
//!
//! - [`FinalStage`] - Hand the finished block to a [`SwapBuffer`](crate::SwapBuffer)
//!
//! Stages with runtime parameters hand out a [`Control`](crate::Control)
//! through their `control()` method; messages are applied at the start of
//! the next block.

pub mod effect;
pub mod sink;
pub mod source;

pub use effect::{Gain, GainMessage, Mixer, RecorderMessage, TapeRecorder};
pub use sink::FinalStage;
pub use source::{Constant, ConstantMessage, Sine, SineMessage, TapeMessage, TapePlayback};
