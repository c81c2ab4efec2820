mod gain;
mod mixer;
mod recorder;

pub use gain::{Gain, GainMessage};
pub use mixer::Mixer;
pub use recorder::{RecorderMessage, TapeRecorder};
