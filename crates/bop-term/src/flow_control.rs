use std::sync::atomic::{AtomicI64, Ordering};

use crossbeam_utils::CachePadded;

/// Read-only view of the flow-control limit a publication may write up to.
///
/// The limit is computed elsewhere from receiver feedback and is treated as
/// eventually consistent and monotonic.
pub trait PositionIndicator: Send + Sync {
    fn position(&self) -> i64;
}

/// Limit counter updated by the receiver-tracking side and read by publishers.
#[derive(Debug, Default)]
pub struct AtomicPosition {
    value: CachePadded<AtomicI64>,
}

impl AtomicPosition {
    pub fn new(initial: i64) -> Self {
        Self {
            value: CachePadded::new(AtomicI64::new(initial)),
        }
    }

    #[inline]
    pub fn set_ordered(&self, position: i64) {
        self.value.store(position, Ordering::Release);
    }

    /// Raises the limit to `position` if it is ahead. Returns true when it moved.
    #[inline]
    pub fn propose_max_ordered(&self, position: i64) -> bool {
        self.value.fetch_max(position, Ordering::AcqRel) < position
    }

    #[inline]
    pub fn get_volatile(&self) -> i64 {
        self.value.load(Ordering::Acquire)
    }
}

impl PositionIndicator for AtomicPosition {
    #[inline]
    fn position(&self) -> i64 {
        self.get_volatile()
    }
}

/// Limit that never gates; useful for IPC-style publications with no receivers to track.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnboundedLimit;

impl PositionIndicator for UnboundedLimit {
    #[inline]
    fn position(&self) -> i64 {
        i64::MAX
    }
}
