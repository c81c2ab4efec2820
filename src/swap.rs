//! Double buffer between the render thread and the output thread.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::{ArcSwap, Guard};
use parking_lot::Mutex;

/// Two fixed-size blocks with interchangeable read and write roles.
///
/// The producer fills the write block with [`write_buffer`](Self::write_buffer),
/// publishes it with [`swap_buffers`](Self::swap_buffers) and raises the
/// ready flag with [`notify`](Self::notify). The consumer spins in
/// [`wait`](Self::wait) and then reads the published block with
/// [`read_buffer`](Self::read_buffer), which never takes a lock.
///
/// ```
/// use tapegraph::SwapBuffer;
///
/// let swap = SwapBuffer::new(4);
/// swap.write_buffer(&[1.0, 2.0, 3.0, 4.0]);
/// assert_eq!(**swap.read_buffer(), [0.0; 4]);
///
/// swap.swap_buffers();
/// swap.notify();
/// swap.wait();
/// assert_eq!(**swap.read_buffer(), [1.0, 2.0, 3.0, 4.0]);
/// ```
pub struct SwapBuffer {
    len: usize,
    read: ArcSwap<Vec<f32>>,
    write: Mutex<Arc<Vec<f32>>>,
    ready: AtomicBool,
}

impl SwapBuffer {
    pub fn new(len: usize) -> Self {
        Self {
            len,
            read: ArcSwap::from_pointee(vec![0.0; len]),
            write: Mutex::new(Arc::new(vec![0.0; len])),
            ready: AtomicBool::new(false),
        }
    }

    /// Samples per block.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Copy `data` into the write block.
    ///
    /// Extra samples are dropped; a short block is padded with silence.
    pub fn write_buffer(&self, data: &[f32]) {
        let mut write = self.write.lock();
        let block = Arc::make_mut(&mut write);
        let n = data.len().min(self.len);
        block[..n].copy_from_slice(&data[..n]);
        block[n..].fill(0.0);
    }

    /// Publish the write block and take the old read block back for writing.
    pub fn swap_buffers(&self) {
        let mut write = self.write.lock();
        let filled = Arc::clone(&write);
        *write = self.read.swap(filled);
    }

    /// The most recently published block.
    #[inline]
    pub fn read_buffer(&self) -> Guard<Arc<Vec<f32>>> {
        self.read.load()
    }

    /// Copy the published block into `out`.
    pub fn read_into(&self, out: &mut [f32]) {
        let block = self.read.load();
        let n = out.len().min(block.len());
        out[..n].copy_from_slice(&block[..n]);
    }

    /// Zero both blocks.
    pub fn clear(&self) {
        let mut write = self.write.lock();
        Arc::make_mut(&mut write).fill(0.0);
        self.read.store(Arc::new(vec![0.0; self.len]));
    }

    #[inline]
    pub fn notify(&self) {
        self.ready.store(true, Ordering::Release);
    }

    /// Consume the ready flag if it is raised.
    #[inline]
    pub fn try_wait(&self) -> bool {
        self.ready.swap(false, Ordering::AcqRel)
    }

    /// Spin until the producer notifies.
    pub fn wait(&self) {
        while !self.try_wait() {
            std::hint::spin_loop();
            std::thread::yield_now();
        }
    }

    /// Like [`wait`](Self::wait), but give up after `timeout`.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.try_wait() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::yield_now();
        }
    }
}

impl std::fmt::Debug for SwapBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SwapBuffer")
            .field("len", &self.len)
            .field("ready", &self.ready.load(Ordering::Relaxed))
            .finish()
    }
}
