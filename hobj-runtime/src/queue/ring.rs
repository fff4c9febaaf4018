//! Resizable circular buffer backing a queue.
//!
//! `first` is the index of the head item, or `EMPTY` when the buffer holds
//! nothing. `next` is where the next back-insert lands. With `first >= 0`,
//! `first == next` means full, never empty.

use std::collections::TryReserveError;

const EMPTY: isize = -1;

pub(crate) struct Ring<T> {
    buf: Vec<Option<T>>,
    first: isize,
    next: usize,
}

impl<T> Ring<T> {
    /// An empty ring of `capacity` slots. Fails instead of aborting when the
    /// buffer cannot be allocated.
    pub(crate) fn new(capacity: usize) -> Result<Self, TryReserveError> {
        let mut buf = Vec::new();
        buf.try_reserve_exact(capacity)?;
        buf.resize_with(capacity, || None);
        Ok(Self {
            buf,
            first: EMPTY,
            next: 0,
        })
    }

    pub(crate) fn capacity(&self) -> usize {
        self.buf.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.first == EMPTY
    }

    pub(crate) fn is_full(&self) -> bool {
        !self.is_empty() && self.head() == self.next
    }

    pub(crate) fn len(&self) -> usize {
        if self.is_empty() {
            0
        } else if self.next > self.head() {
            self.next - self.head()
        } else {
            self.capacity() - self.head() + self.next
        }
    }

    fn head(&self) -> usize {
        self.first as usize
    }

    /// Append at the tail. The buffer must not be full.
    pub(crate) fn push_back(&mut self, item: T) {
        debug_assert!(!self.is_full());
        self.buf[self.next] = Some(item);
        if self.is_empty() {
            self.first = self.next as isize;
        }
        self.next = (self.next + 1) % self.capacity();
    }

    /// Insert at the head. The buffer must not be full.
    pub(crate) fn push_front(&mut self, item: T) {
        debug_assert!(!self.is_full());
        if self.is_empty() {
            self.push_back(item);
            return;
        }
        let head = (self.head() + self.capacity() - 1) % self.capacity();
        self.buf[head] = Some(item);
        self.first = head as isize;
    }

    pub(crate) fn pop_front(&mut self) -> Option<T> {
        if self.is_empty() {
            return None;
        }
        let head = self.head();
        let item = self.buf[head].take();
        let head = (head + 1) % self.capacity();
        self.first = if head == self.next { EMPTY } else { head as isize };
        item
    }

    pub(crate) fn front(&self) -> Option<&T> {
        if self.is_empty() {
            return None;
        }
        self.buf[self.head()].as_ref()
    }

    /// Move the contents into a buffer of `capacity` slots, head first.
    ///
    /// On allocation failure the ring is left untouched.
    pub(crate) fn resize(&mut self, capacity: usize) -> Result<(), TryReserveError> {
        debug_assert!(capacity > self.len());
        let mut buf: Vec<Option<T>> = Vec::new();
        buf.try_reserve_exact(capacity)?;

        let len = self.len();
        while let Some(item) = self.pop_front() {
            buf.push(Some(item));
        }
        buf.resize_with(capacity, || None);

        self.buf = buf;
        self.first = if len == 0 { EMPTY } else { 0 };
        self.next = len % capacity;
        Ok(())
    }
}
