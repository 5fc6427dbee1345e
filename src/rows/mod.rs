//! The row ring buffer: a bounded blocking FIFO between the background
//! reader task (producer) and the application (consumer).
//!
//! Two sizing modes: count-bounded (capacity = fetch size, unlimited bytes)
//! or size-bounded (capacity in bytes, unlimited count). End-of-result is a
//! sentinel the producer enqueues exactly once, after any stored error, so a
//! waiting consumer always learns the outcome in bounded time.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::errors::Error;
use crate::query::Tuple;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RingBufferLimit {
    Rows(usize),
    Bytes(usize),
}

#[derive(Debug, Default)]
struct QueueState {
    deque: VecDeque<Tuple>,
    bytes: usize,
    end_enqueued: bool,
    closed: bool,
    skip_rows: bool,
    error: Option<Error>,
}

#[derive(Debug)]
pub struct RowRingBuffer {
    limit: RingBufferLimit,
    state: Mutex<QueueState>,
    space_available: Notify,
    rows_available: Notify,
    /// How many times a put had to wait for space; observable backpressure.
    put_blocked: AtomicU64,
}

impl RowRingBuffer {
    pub fn with_row_capacity(rows: usize) -> RowRingBuffer {
        RowRingBuffer::new(RingBufferLimit::Rows(rows.max(1)))
    }

    pub fn with_byte_capacity(bytes: usize) -> RowRingBuffer {
        RowRingBuffer::new(RingBufferLimit::Bytes(bytes.max(1)))
    }

    pub fn new(limit: RingBufferLimit) -> RowRingBuffer {
        RowRingBuffer {
            limit,
            state: Mutex::new(QueueState::default()),
            space_available: Notify::new(),
            rows_available: Notify::new(),
            put_blocked: AtomicU64::new(0),
        }
    }

    pub fn limit(&self) -> RingBufferLimit {
        self.limit
    }

    /// Enqueue one tuple, waiting while the buffer is full. Rows offered
    /// after close, or while skip mode is on, are dropped without blocking.
    pub async fn put(&self, tuple: Tuple) -> Result<(), Error> {
        loop {
            let notified = self.space_available.notified();
            {
                let mut state = self.state.lock();
                if state.closed || state.skip_rows {
                    return Ok(());
                }
                if state.end_enqueued {
                    // One sentinel per result; nothing follows it.
                    return Ok(());
                }
                if self.has_space(&state, &tuple) {
                    state.bytes += tuple.size_bytes();
                    state.deque.push_back(tuple);
                    drop(state);
                    self.rows_available.notify_one();
                    return Ok(());
                }
                self.put_blocked.fetch_add(1, Ordering::Relaxed);
            }
            notified.await;
        }
    }

    fn has_space(&self, state: &QueueState, tuple: &Tuple) -> bool {
        match self.limit {
            RingBufferLimit::Rows(capacity) => state.deque.len() < capacity,
            // An oversized single tuple may enter an empty queue; otherwise
            // the byte budget is a hard ceiling.
            RingBufferLimit::Bytes(capacity) => {
                state.deque.is_empty() || state.bytes + tuple.size_bytes() <= capacity
            }
        }
    }

    /// Dequeue the next tuple. `Ok(None)` means the result is exhausted; a
    /// stored producer error surfaces exactly once, after the buffered rows.
    pub async fn take(&self) -> Result<Option<Tuple>, Error> {
        loop {
            let notified = self.rows_available.notified();
            {
                let mut state = self.state.lock();
                if let Some(tuple) = state.deque.pop_front() {
                    state.bytes -= tuple.size_bytes();
                    drop(state);
                    self.space_available.notify_one();
                    return Ok(Some(tuple));
                }
                if state.end_enqueued || state.closed {
                    if let Some(error) = state.error.take() {
                        return Err(error);
                    }
                    return Ok(None);
                }
            }
            notified.await;
        }
    }

    /// Switch the producer to drain-and-discard: rows keep coming off the
    /// wire but are dropped, so the producer never blocks again.
    pub fn set_skip_rows(&self) {
        let mut state = self.state.lock();
        state.skip_rows = true;
        drop(state);
        self.space_available.notify_waiters();
    }

    pub fn is_skipping_rows(&self) -> bool {
        self.state.lock().skip_rows
    }

    /// Store the fatal error the consumer must see. Call before the sentinel.
    pub fn set_handler_error(&self, error: Error) {
        let mut state = self.state.lock();
        if state.error.is_none() {
            state.error = Some(error);
        }
    }

    /// Enqueue the end-of-rows sentinel. Idempotent.
    pub fn add_end_of_rows(&self) {
        let mut state = self.state.lock();
        if state.end_enqueued {
            return;
        }
        state.end_enqueued = true;
        drop(state);
        self.rows_available.notify_waiters();
    }

    /// Close from either side: stops the producer (skip mode) and releases a
    /// waiting consumer with the sentinel.
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        state.skip_rows = true;
        state.end_enqueued = true;
        drop(state);
        self.space_available.notify_waiters();
        self.rows_available.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn is_finished(&self) -> bool {
        self.state.lock().end_enqueued
    }

    pub fn buffered_rows(&self) -> usize {
        self.state.lock().deque.len()
    }

    pub fn buffered_bytes(&self) -> usize {
        self.state.lock().bytes
    }

    /// Number of times the producer blocked on a full buffer.
    pub fn put_blocked_count(&self) -> u64 {
        self.put_blocked.load(Ordering::Relaxed)
    }
}
