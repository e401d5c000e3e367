//! Rate-limited error logging for disk faults.
//!
//! A failing disk tends to fail every call; logging each one buries the log.
//! `SampledLogger` emits at most one line per window and reports how many
//! were suppressed in between.

use std::fmt::Display;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug)]
pub struct SampledLogger {
    target: &'static str,
    window_ms: u64,
    /// `u64::MAX` until the first line is emitted.
    last_emit_ms: AtomicU64,
    suppressed: AtomicU64,
}

impl SampledLogger {
    pub fn new(target: &'static str, window_ms: u64) -> Self {
        Self {
            target,
            window_ms,
            last_emit_ms: AtomicU64::new(u64::MAX),
            suppressed: AtomicU64::new(0),
        }
    }

    /// Claims the current window. Returns the number of suppressed events
    /// since the last emitted line, or `None` if this event is suppressed.
    pub fn sample(&self, now_ms: u64) -> Option<u64> {
        let last = self.last_emit_ms.load(Ordering::Acquire);
        let due = last == u64::MAX || now_ms.saturating_sub(last) >= self.window_ms;
        if due
            && self
                .last_emit_ms
                .compare_exchange(last, now_ms, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            return Some(self.suppressed.swap(0, Ordering::AcqRel));
        }
        self.suppressed.fetch_add(1, Ordering::AcqRel);
        None
    }

    pub fn error(&self, now_ms: u64, context: impl Display, err: impl Display) {
        if let Some(suppressed) = self.sample(now_ms) {
            log::error!(
                target: self.target,
                "{context}: {err} ({suppressed} similar errors suppressed)"
            );
        }
    }
}
