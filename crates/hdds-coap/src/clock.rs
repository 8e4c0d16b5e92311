// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

// Millisecond tick counter.
//
// Ticks wrap at u32::MAX (about 49.7 days). Deadlines are absolute tick
// values compared with `is_due`, which stays correct across the wrap as long
// as no deadline is more than `MAX_SPAN_MS` away. `ticks_after` clamps to
// that span.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Source of the engine's current tick (milliseconds).
pub trait TickSource: Send {
    fn now(&self) -> u32;
}

/// Milliseconds since construction, wrapping at `u32::MAX`.
#[derive(Debug)]
pub struct MonotonicTicks {
    origin: Instant,
}

impl MonotonicTicks {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicTicks {
    fn default() -> Self {
        Self::new()
    }
}

impl TickSource for MonotonicTicks {
    fn now(&self) -> u32 {
        // Truncation is the wrap.
        self.origin.elapsed().as_millis() as u32
    }
}

/// Manually advanced tick source. Clones share the same counter.
#[derive(Debug, Clone, Default)]
pub struct ManualTicks(Arc<AtomicU32>);

impl ManualTicks {
    pub fn new(start: u32) -> Self {
        Self(Arc::new(AtomicU32::new(start)))
    }

    pub fn set(&self, ticks: u32) {
        self.0.store(ticks, Ordering::SeqCst);
    }

    pub fn advance(&self, ms: u32) {
        self.0.fetch_add(ms, Ordering::SeqCst);
    }
}

impl TickSource for ManualTicks {
    fn now(&self) -> u32 {
        self.0.load(Ordering::SeqCst)
    }
}

/// Longest distance between now and a deadline that `is_due` can order.
pub const MAX_SPAN_MS: u32 = i32::MAX as u32;

/// Deadline `ms` after `now`, with `ms` clamped to `MAX_SPAN_MS`.
pub fn ticks_after(now: u32, ms: u64) -> u32 {
    let span = u32::try_from(ms).map_or(MAX_SPAN_MS, |ms| ms.min(MAX_SPAN_MS));
    now.wrapping_add(span)
}

/// Deadline `secs` seconds after `now`, clamped like [`ticks_after`].
pub fn ticks_after_secs(now: u32, secs: u32) -> u32 {
    ticks_after(now, u64::from(secs) * 1000)
}

/// `deadline` is at or before `now`, across tick wrap.
pub fn is_due(now: u32, deadline: u32) -> bool {
    now.wrapping_sub(deadline) <= MAX_SPAN_MS
}
