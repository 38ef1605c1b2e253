// rawble Source Code File
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project
// root for full license information.

//! Bounded multi-producer/single-consumer FIFO with blocking, timed and
//! predicate-scanning gets.
//!
//! One of these sits between every socket reader thread and the callers
//! waiting for replies: the reader `put`s decoded events, submitters block
//! in [`RingBuffer::get_until`] for the event matching their request.
//! Shutdown interrupts blocked callers with a dedicated outcome instead of
//! letting them run into their full timeout.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// Outcome of a blocked ring operation that did not yield an element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RingError {
    #[error("ring operation timed out")]
    TimedOut,
    /// Woken by `interrupt_read`/`interrupt_write` (component shutdown).
    #[error("ring operation interrupted")]
    Interrupted,
}

struct Inner<T> {
    queue: VecDeque<T>,
    read_interrupted: bool,
    write_interrupted: bool,
}

pub struct RingBuffer<T> {
    inner: Mutex<Inner<T>>,
    not_empty: Condvar,
    not_full: Condvar,
    capacity: usize,
}

impl<T> RingBuffer<T> {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "ring capacity must be non-zero");
        Self {
            inner: Mutex::new(Inner {
                queue: VecDeque::with_capacity(capacity),
                read_interrupted: false,
                write_interrupted: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Appends an element, blocking while the ring is full.
    pub fn put(&self, value: T) -> Result<(), RingError> {
        self.put_deadline(value, None)
    }

    /// Appends an element, blocking at most `timeout` while the ring is full.
    pub fn put_timeout(&self, value: T, timeout: Duration) -> Result<(), RingError> {
        self.put_deadline(value, Some(Instant::now() + timeout))
    }

    fn put_deadline(&self, value: T, deadline: Option<Instant>) -> Result<(), RingError> {
        let mut inner = self.inner.lock().unwrap();
        loop {
            if inner.write_interrupted {
                return Err(RingError::Interrupted);
            }
            if inner.queue.len() < self.capacity {
                inner.queue.push_back(value);
                self.not_empty.notify_all();
                return Ok(());
            }
            inner = match deadline {
                None => self.not_full.wait(inner).unwrap(),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(RingError::TimedOut);
                    }
                    self.not_full.wait_timeout(inner, deadline - now).unwrap().0
                }
            };
        }
    }

    /// Removes the head element, blocking while the ring is empty.
    pub fn get(&self) -> Result<T, RingError> {
        self.get_deadline(None)
    }

    /// Removes the head element, blocking at most `timeout`.
    pub fn get_timeout(&self, timeout: Duration) -> Result<T, RingError> {
        self.get_deadline(Some(Instant::now() + timeout))
    }

    fn get_deadline(&self, deadline: Option<Instant>) -> Result<T, RingError> {
        let mut inner = self.inner.lock().unwrap();
        loop {
            if inner.read_interrupted {
                return Err(RingError::Interrupted);
            }
            if let Some(value) = inner.queue.pop_front() {
                self.not_full.notify_all();
                return Ok(value);
            }
            inner = match deadline {
                None => self.not_empty.wait(inner).unwrap(),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(RingError::TimedOut);
                    }
                    self.not_empty
                        .wait_timeout(inner, deadline - now)
                        .unwrap()
                        .0
                }
            };
        }
    }

    /// Returns the first element satisfying `pred`, waiting up to `timeout`
    /// for one to arrive.
    ///
    /// With `consume_only_match` set, non-matching elements stay queued for
    /// other consumers (each is tested once); otherwise non-matching heads
    /// are dropped while scanning.
    pub fn get_until<F>(
        &self,
        mut pred: F,
        consume_only_match: bool,
        timeout: Duration,
    ) -> Result<T, RingError>
    where
        F: FnMut(&T) -> bool,
    {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock().unwrap();
        // Elements before this index were already tested and left in place.
        let mut scanned = 0usize;
        loop {
            if inner.read_interrupted {
                return Err(RingError::Interrupted);
            }
            if consume_only_match {
                let mut found = None;
                for i in scanned..inner.queue.len() {
                    if pred(&inner.queue[i]) {
                        found = Some(i);
                        break;
                    }
                }
                scanned = inner.queue.len();
                if let Some(i) = found {
                    let value = inner.queue.remove(i).expect("index scanned under lock");
                    scanned = i;
                    self.not_full.notify_all();
                    return Ok(value);
                }
            } else {
                while let Some(front) = inner.queue.front() {
                    let matched = pred(front);
                    let value = inner.queue.pop_front().expect("front checked under lock");
                    self.not_full.notify_all();
                    if matched {
                        return Ok(value);
                    }
                }
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(RingError::TimedOut);
            }
            inner = self
                .not_empty
                .wait_timeout(inner, deadline - now)
                .unwrap()
                .0;
        }
    }

    /// Drops all queued elements.
    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.queue.clear();
        self.not_full.notify_all();
    }

    /// Wakes all blocked getters with [`RingError::Interrupted`]; sticky
    /// until [`RingBuffer::reset_interrupts`].
    pub fn interrupt_read(&self) {
        self.inner.lock().unwrap().read_interrupted = true;
        self.not_empty.notify_all();
    }

    /// Wakes all blocked putters with [`RingError::Interrupted`]; sticky
    /// until [`RingBuffer::reset_interrupts`].
    pub fn interrupt_write(&self) {
        self.inner.lock().unwrap().write_interrupted = true;
        self.not_full.notify_all();
    }

    pub fn reset_interrupts(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.read_interrupted = false;
        inner.write_interrupted = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn fifo_order_preserved() {
        let ring = RingBuffer::new(8);
        for i in 0..5 {
            ring.put(i).unwrap();
        }
        for i in 0..5 {
            assert_eq!(ring.get().unwrap(), i);
        }
    }

    #[test]
    fn concurrent_writer_reader_sees_all_values_in_order() {
        let ring = Arc::new(RingBuffer::new(4));
        let writer = {
            let ring = ring.clone();
            thread::spawn(move || {
                for i in 0..1000u32 {
                    ring.put(i).unwrap();
                }
            })
        };
        for i in 0..1000u32 {
            assert_eq!(
                ring.get_timeout(Duration::from_secs(5)).unwrap(),
                i,
                "reader must observe original order"
            );
        }
        writer.join().unwrap();
        assert!(ring.is_empty());
    }

    #[test]
    fn get_timeout_expires() {
        let ring: RingBuffer<u8> = RingBuffer::new(2);
        let begin = Instant::now();
        assert_eq!(
            ring.get_timeout(Duration::from_millis(50)),
            Err(RingError::TimedOut)
        );
        assert!(begin.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn put_blocks_when_full_until_get() {
        let ring = Arc::new(RingBuffer::new(1));
        ring.put(1u8).unwrap();
        assert_eq!(
            ring.put_timeout(2, Duration::from_millis(20)),
            Err(RingError::TimedOut)
        );
        let getter = {
            let ring = ring.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(30));
                ring.get().unwrap()
            })
        };
        ring.put_timeout(3, Duration::from_secs(5)).unwrap();
        assert_eq!(getter.join().unwrap(), 1);
        assert_eq!(ring.get().unwrap(), 3);
    }

    #[test]
    fn get_until_drops_non_matches_when_consuming() {
        let ring = RingBuffer::new(8);
        for i in 0..6 {
            ring.put(i).unwrap();
        }
        let v = ring
            .get_until(|v| *v == 3, false, Duration::from_millis(100))
            .unwrap();
        assert_eq!(v, 3);
        // 0..=2 were dropped, 4 and 5 remain
        assert_eq!(ring.get().unwrap(), 4);
        assert_eq!(ring.get().unwrap(), 5);
        assert!(ring.is_empty());
    }

    #[test]
    fn get_until_keeps_non_matches_otherwise() {
        let ring = RingBuffer::new(8);
        for i in 0..6 {
            ring.put(i).unwrap();
        }
        let v = ring
            .get_until(|v| *v == 3, true, Duration::from_millis(100))
            .unwrap();
        assert_eq!(v, 3);
        assert_eq!(ring.len(), 5);
        assert_eq!(ring.get().unwrap(), 0);
    }

    #[test]
    fn get_until_times_out_without_match() {
        let ring = RingBuffer::new(4);
        ring.put(1).unwrap();
        let begin = Instant::now();
        assert_eq!(
            ring.get_until(|v| *v == 9, true, Duration::from_millis(50)),
            Err(RingError::TimedOut)
        );
        assert!(begin.elapsed() >= Duration::from_millis(50));
        // non-match untouched
        assert_eq!(ring.len(), 1);
    }

    #[test]
    fn get_until_waits_for_late_match() {
        let ring = Arc::new(RingBuffer::new(4));
        let putter = {
            let ring = ring.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(30));
                ring.put(7u8).unwrap();
            })
        };
        let v = ring
            .get_until(|v| *v == 7, true, Duration::from_secs(5))
            .unwrap();
        assert_eq!(v, 7);
        putter.join().unwrap();
    }

    #[test]
    fn interrupt_wakes_blocked_getter() {
        let ring: Arc<RingBuffer<u8>> = Arc::new(RingBuffer::new(2));
        let getter = {
            let ring = ring.clone();
            thread::spawn(move || ring.get())
        };
        thread::sleep(Duration::from_millis(20));
        ring.interrupt_read();
        assert_eq!(getter.join().unwrap(), Err(RingError::Interrupted));

        // sticky until reset
        assert_eq!(ring.get(), Err(RingError::Interrupted));
        ring.reset_interrupts();
        ring.put(1).unwrap();
        assert_eq!(ring.get(), Ok(1));
    }

    #[test]
    fn clear_empties_and_unblocks_putters() {
        let ring = Arc::new(RingBuffer::new(1));
        ring.put(1u8).unwrap();
        let putter = {
            let ring = ring.clone();
            thread::spawn(move || ring.put(2))
        };
        thread::sleep(Duration::from_millis(20));
        ring.clear();
        putter.join().unwrap().unwrap();
        assert_eq!(ring.get().unwrap(), 2);
    }
}
