//! Background prefetch for pipe-fed inputs.
//!
//! When the producer on the far side of a pipe cannot tolerate head-of-line
//! blocking, a reader thread drains the source into a single-producer
//! single-consumer ring buffer as fast as it will go. The decoder pulls
//! through [`PrefetchReader`]'s [`Read`] impl, which blocks only while the
//! ring is empty and the source is still open.

use std::io::{self, Read};
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Ring capacity, sized in TS frames.
const RING_SIZE: usize = 188 * 1024 * 100;

/// How long either side sleeps when it finds the ring full or empty.
const BACKOFF: Duration = Duration::from_millis(1);

/// Lock-free SPSC ring buffer: the reader thread owns the write position,
/// the decoder owns the read position.
struct RingBuffer {
    buffer: Box<[u8]>,
    write_pos: AtomicUsize,
    read_pos: AtomicUsize,
    closed: AtomicBool,
}

// Safety: the producer writes and the consumer reads disjoint regions,
// published through the Acquire/Release position stores below.
unsafe impl Send for RingBuffer {}
unsafe impl Sync for RingBuffer {}

impl RingBuffer {
    fn new() -> Self {
        Self {
            buffer: vec![0u8; RING_SIZE].into_boxed_slice(),
            write_pos: AtomicUsize::new(0),
            read_pos: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        }
    }

    fn available(&self) -> usize {
        let write = self.write_pos.load(Ordering::Acquire);
        let read = self.read_pos.load(Ordering::Acquire);
        if write >= read {
            write - read
        } else {
            RING_SIZE - read + write
        }
    }

    /// Producer side: copy as much of `data` as fits, returning the count.
    fn write(&self, data: &[u8]) -> usize {
        let mut write = self.write_pos.load(Ordering::Acquire);
        let read = self.read_pos.load(Ordering::Acquire);

        // One slot stays free to distinguish full from empty.
        let free = if write >= read {
            RING_SIZE - write + read - 1
        } else {
            read - write - 1
        };
        let to_write = data.len().min(free);
        if to_write == 0 {
            return 0;
        }

        // Raw-pointer copies: no `&mut` to the shared buffer is ever formed.
        let dst = self.buffer.as_ptr() as *mut u8;
        let first = to_write.min(RING_SIZE - write);
        unsafe {
            ptr::copy_nonoverlapping(data.as_ptr(), dst.add(write), first);
            if first < to_write {
                ptr::copy_nonoverlapping(data.as_ptr().add(first), dst, to_write - first);
            }
        }

        write = (write + to_write) % RING_SIZE;
        self.write_pos.store(write, Ordering::Release);
        to_write
    }

    /// Consumer side: copy up to `dest.len()` published bytes out.
    fn read_into(&self, dest: &mut [u8]) -> usize {
        let write = self.write_pos.load(Ordering::Acquire);
        let read = self.read_pos.load(Ordering::Acquire);

        let available = if write >= read {
            write - read
        } else {
            RING_SIZE - read + write
        };
        let to_read = dest.len().min(available);
        if to_read == 0 {
            return 0;
        }

        let src = self.buffer.as_ptr();
        let first = to_read.min(RING_SIZE - read);
        unsafe {
            ptr::copy_nonoverlapping(src.add(read), dest.as_mut_ptr(), first);
            if first < to_read {
                ptr::copy_nonoverlapping(src, dest.as_mut_ptr().add(first), to_read - first);
            }
        }

        self.read_pos
            .store((read + to_read) % RING_SIZE, Ordering::Release);
        to_read
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// A [`Read`] adapter fed by a background thread.
pub struct PrefetchReader {
    ring: Arc<RingBuffer>,
    error: Arc<std::sync::Mutex<Option<io::Error>>>,
}

impl PrefetchReader {
    pub fn new<R: Read + Send + 'static>(mut source: R) -> Self {
        let ring = Arc::new(RingBuffer::new());
        let error = Arc::new(std::sync::Mutex::new(None));
        let producer = Arc::clone(&ring);
        let producer_error = Arc::clone(&error);

        thread::spawn(move || {
            let mut chunk = vec![0u8; 64 * 1024];
            loop {
                match source.read(&mut chunk) {
                    Ok(0) => break,
                    Ok(n) => {
                        let mut written = 0;
                        while written < n {
                            let w = producer.write(&chunk[written..n]);
                            if w == 0 {
                                thread::sleep(BACKOFF);
                            }
                            written += w;
                        }
                    }
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        if let Ok(mut slot) = producer_error.lock() {
                            *slot = Some(e);
                        }
                        break;
                    }
                }
            }
            producer.close();
        });

        Self { ring, error }
    }
}

impl Read for PrefetchReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            let n = self.ring.read_into(buf);
            if n > 0 {
                return Ok(n);
            }
            if self.ring.is_closed() && self.ring.available() == 0 {
                if let Ok(mut slot) = self.error.lock() {
                    if let Some(e) = slot.take() {
                        return Err(e);
                    }
                }
                return Ok(0);
            }
            thread::sleep(BACKOFF);
        }
    }
}
