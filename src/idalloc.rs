//! Monotonic ID allocators with free-list reuse, parameterized by a
//! per-client range (spec §4.4): node, buffer, audio-bus, control-bus IDs.
//!
//! Grounded in `VoiceAllocator::alloc_control_buses`/`return_control_buses`
//! in the teacher (`imbolc-core::audio::engine::voice_allocator`), which
//! pools freed control-bus triples for reuse via a plain `Vec` used as a
//! stack. We generalize that pop/push pool into a range-bounded allocator
//! and add the batch semantics spec.md §4.4/§8 (S3) requires: a request is
//! serviced either *entirely* from the free-list (when it holds enough
//! entries) or *entirely* from the advancing cursor — never a mix, which
//! keeps a single `allocate` call's IDs uniformly "fresh" or uniformly
//! "reused" and avoids the out-of-order-acknowledgment race the spec's
//! rationale describes.

use std::sync::Mutex;

use crate::error::{OscError, Result};

struct Inner {
    cursor: i32,
    free_list: Vec<i32>,
    allocated: std::collections::HashSet<i32>,
}

/// A mutex-protected allocator over the inclusive range `[low, high]`.
pub struct IdAllocator {
    low: i32,
    high: i32,
    state: Mutex<Inner>,
}

impl IdAllocator {
    pub fn new(low: i32, high: i32) -> Self {
        IdAllocator {
            low,
            high,
            state: Mutex::new(Inner {
                cursor: low,
                free_list: Vec::new(),
                allocated: std::collections::HashSet::new(),
            }),
        }
    }

    /// Allocate `n` IDs. Serviced entirely from the free-list when it holds
    /// at least `n` entries (in insertion order); otherwise serviced
    /// entirely from the advancing cursor, failing [`OscError::Exhausted`]
    /// if that would cross `high`.
    pub fn allocate(&self, n: usize) -> Result<Vec<i32>> {
        let mut inner = self.state.lock().unwrap();
        let ids = if inner.free_list.len() >= n {
            inner.free_list.drain(0..n).collect::<Vec<_>>()
        } else {
            let start = inner.cursor;
            let end = start as i64 + n as i64 - 1;
            if n == 0 {
                Vec::new()
            } else if end > self.high as i64 {
                return Err(OscError::Exhausted);
            } else {
                inner.cursor = (end + 1) as i32;
                (start..=end as i32).collect::<Vec<_>>()
            }
        };
        for &id in &ids {
            inner.allocated.insert(id);
        }
        Ok(ids)
    }

    /// Return `ids` to the free-list, preserving the order given. Fails
    /// with [`OscError::InvalidId`] (and mutates nothing) if any id is not
    /// currently allocated.
    pub fn free(&self, ids: &[i32]) -> Result<()> {
        let mut inner = self.state.lock().unwrap();
        for &id in ids {
            if !inner.allocated.contains(&id) {
                return Err(OscError::InvalidId(id));
            }
        }
        for &id in ids {
            inner.allocated.remove(&id);
            inner.free_list.push(id);
        }
        Ok(())
    }

    pub fn low(&self) -> i32 {
        self.low
    }

    pub fn high(&self) -> i32 {
        self.high
    }

    pub fn currently_allocated(&self) -> std::collections::HashSet<i32> {
        self.state.lock().unwrap().allocated.clone()
    }
}
