//! Memory accountant: byte budget for stored values.
//!
//! Holds a single running total against a fixed ceiling. It knows nothing
//! about items, so admission and release never touch the item table's locks.

use std::sync::atomic::{AtomicUsize, Ordering};

use tracing::{debug, warn};

/// Byte counter with an admission gate.
#[derive(Debug)]
pub struct MemoryAccountant {
    /// Bytes currently charged.
    bytes_in_use: AtomicUsize,

    /// Ceiling in bytes.
    max_bytes: usize,
}

impl MemoryAccountant {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            bytes_in_use: AtomicUsize::new(0),
            max_bytes,
        }
    }

    /// Whether `bytes` more could be admitted right now.
    ///
    /// This and [`track_allocation`](Self::track_allocation) are the plain
    /// check-then-charge pair for callers that serialize admission themselves.
    /// The store admits through [`try_allocate`](Self::try_allocate) and
    /// [`try_replace`](Self::try_replace), which check and charge in one CAS.
    pub fn can_accommodate(&self, bytes: usize) -> bool {
        self.bytes_in_use().saturating_add(bytes) <= self.max_bytes
    }

    /// Charge `bytes` unconditionally.
    pub fn track_allocation(&self, bytes: usize) {
        let now = self.bytes_in_use.fetch_add(bytes, Ordering::AcqRel) + bytes;
        debug!(bytes, in_use = now, "Tracked allocation");
    }

    /// Release `bytes`, flooring the counter at zero.
    pub fn track_deallocation(&self, bytes: usize) {
        let result = self
            .bytes_in_use
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |cur| {
                Some(cur.saturating_sub(bytes))
            });
        if let Ok(prev) = result {
            if prev < bytes {
                warn!(
                    in_use = prev,
                    released = bytes,
                    "Memory counter would go negative, clamped to zero"
                );
            }
        }
    }

    /// Charge `bytes` only if the ceiling allows it.
    pub fn try_allocate(&self, bytes: usize) -> bool {
        self.try_replace(0, bytes)
    }

    /// Atomically swap a charge of `old` bytes for `new` bytes if the result fits.
    pub fn try_replace(&self, old: usize, new: usize) -> bool {
        let max = self.max_bytes;
        self.bytes_in_use
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |cur| {
                let next = cur.saturating_sub(old).saturating_add(new);
                (next <= max).then_some(next)
            })
            .is_ok()
    }

    /// Bytes that must be released before `new` bytes (replacing `old`) fit.
    pub fn shortfall(&self, old: usize, new: usize) -> usize {
        self.bytes_in_use()
            .saturating_sub(old)
            .saturating_add(new)
            .saturating_sub(self.max_bytes)
    }

    pub fn bytes_in_use(&self) -> usize {
        self.bytes_in_use.load(Ordering::Acquire)
    }

    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }

    /// Usage as a fraction of the ceiling (0.0 - 1.0).
    pub fn usage_fraction(&self) -> f64 {
        if self.max_bytes == 0 {
            return 0.0;
        }
        (self.bytes_in_use() as f64 / self.max_bytes as f64).min(1.0)
    }

    pub fn reset(&self) {
        self.bytes_in_use.store(0, Ordering::Release);
    }
}
