//! Ring buffer for scrollback replay
//!
//! A fixed-capacity FIFO over opaque chunks. When the buffer is full the
//! oldest chunk is overwritten, which keeps the last N chunks of output
//! without unbounded memory growth.

use std::collections::VecDeque;

use crate::error::{Result, TermspaceError};

pub struct RingBuffer<T> {
    items: VecDeque<T>,
    capacity: usize,
}

impl<T> RingBuffer<T> {
    /// Create a ring buffer holding at most `capacity` items. Capacity
    /// must be at least 1.
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(TermspaceError::InvalidArgument(
                "ring buffer capacity must be at least 1".to_string(),
            ));
        }
        Ok(Self {
            items: VecDeque::with_capacity(capacity),
            capacity,
        })
    }

    /// Append an item, evicting the oldest when full.
    pub fn push(&mut self, item: T) {
        if self.items.len() == self.capacity {
            self.items.pop_front();
        }
        self.items.push_back(item);
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.iter()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }
}

impl<T: Clone> RingBuffer<T> {
    /// Snapshot in insertion order, oldest first.
    pub fn get_all(&self) -> Vec<T> {
        self.items.iter().cloned().collect()
    }
}
