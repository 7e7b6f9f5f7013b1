//! # Log Buffer
//!
//! Ordered log lines streamed by the device.
//!
//! ## Eviction
//! ```text
//! capacity = 3
//!
//!   push "a"  →  [a]
//!   push "b"  →  [a, b]
//!   push "c"  →  [a, b, c]
//!   push "d"  →  [b, c, d]      evicted = 1
//!
//!   replace [w, x, y, z]  →  [x, y, z]   evicted = 2
//! ```
//! A capacity of `0` means unbounded.

use std::collections::VecDeque;

/// Capped, append-only sequence of log lines.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogBuffer {
    lines: VecDeque<String>,
    capacity: usize,
    evicted: u64,
}

impl LogBuffer {
    /// Creates an empty buffer. `capacity == 0` disables the cap.
    pub fn new(capacity: usize) -> Self {
        LogBuffer {
            lines: VecDeque::with_capacity(capacity.min(256)),
            capacity,
            evicted: 0,
        }
    }

    /// Creates a buffer without a cap.
    pub fn unbounded() -> Self {
        Self::new(0)
    }

    /// Appends one line, evicting the oldest if the buffer is full.
    pub fn push(&mut self, line: String) {
        if self.capacity > 0 && self.lines.len() >= self.capacity {
            self.lines.pop_front();
            self.evicted += 1;
        }
        self.lines.push_back(line);
    }

    /// Replaces the whole buffer.
    ///
    /// If `lines` exceeds capacity only the most recent lines are kept.
    pub fn replace(&mut self, lines: Vec<String>) {
        self.lines.clear();
        let skip = if self.capacity > 0 {
            lines.len().saturating_sub(self.capacity)
        } else {
            0
        };
        self.evicted += skip as u64;
        self.lines.extend(lines.into_iter().skip(skip));
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Configured cap (`0` = unbounded).
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Total number of lines dropped by the cap since creation.
    pub fn evicted(&self) -> u64 {
        self.evicted
    }

    /// Most recent line, if any.
    pub fn last(&self) -> Option<&str> {
        self.lines.back().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.lines.iter().map(String::as_str)
    }

    /// Owned copy of the lines, oldest first.
    pub fn to_vec(&self) -> Vec<String> {
        self.lines.iter().cloned().collect()
    }
}
