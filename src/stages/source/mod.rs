mod constant;
mod playback;
mod sine;

pub use constant::{Constant, ConstantMessage};
pub use playback::{TapeMessage, TapePlayback};
pub use sine::{Sine, SineMessage};
