//! Lock-free control messages from host threads to stages.

use crate::stage::Gid;

/// Default number of queued messages per stage.
pub const DEFAULT_CAPACITY: usize = 64;

/// A handle for sending messages to one stage.
///
/// Returned by a stage's `control()` method before the stage is moved into a
/// graph. Messages are drained at the start of the stage's next
/// [`render`](crate::Stage::render) call, so sending never touches the
/// graph lock.
///
/// ```
/// use tapegraph::stages::{Gain, GainMessage};
///
/// let mut gain = Gain::new(1.0);
/// let mut ctl = gain.control();
/// ctl.send(GainMessage::SetGain(0.25)).ok();
/// ```
pub struct Control<M: Send + 'static> {
    gid: Gid,
    sender: rtrb::Producer<M>,
}

impl<M: Send + 'static> Control<M> {
    /// Queue a message for the stage.
    ///
    /// Returns the message back if the queue is full.
    pub fn send(&mut self, msg: M) -> Result<(), M> {
        self.sender.push(msg).map_err(|rtrb::PushError::Full(m)| m)
    }

    /// GID of the stage this handle controls.
    #[inline]
    pub fn gid(&self) -> Gid {
        self.gid
    }

    /// Free slots in the queue.
    #[inline]
    pub fn slots(&self) -> usize {
        self.sender.slots()
    }
}

/// The receiving end, held by the stage.
pub struct Inbox<M> {
    receiver: Option<rtrb::Consumer<M>>,
}

impl<M: Send + 'static> Inbox<M> {
    pub fn new() -> Self {
        Self { receiver: None }
    }

    /// Open a fresh queue, dropping any previous one.
    pub fn open(&mut self, gid: Gid, capacity: usize) -> Control<M> {
        let (sender, receiver) = rtrb::RingBuffer::new(capacity.max(1));
        self.receiver = Some(receiver);
        Control { gid, sender }
    }

    /// Pending messages, oldest first.
    pub fn drain(&mut self) -> impl Iterator<Item = M> + '_ {
        let mut rx = self.receiver.as_mut();
        core::iter::from_fn(move || rx.as_mut()?.pop().ok())
    }
}

impl<M: Send + 'static> Default for Inbox<M> {
    fn default() -> Self {
        Self::new()
    }
}
