use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::BackpressureKind;

/// Point-in-time snapshot of publication metrics.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PublicationMetricsSnapshot {
    /// Messages written by `offer`
    pub offers: u64,
    /// Claims handed out by `try_claim`
    pub claims: u64,
    /// Payload bytes offered or claimed
    pub bytes_published: u64,
    /// Calls rejected at the flow-control limit
    pub would_block_flow_control: u64,
    /// Calls that exhausted the active term
    pub would_block_rotation: u64,
    /// Calls that found the next term still waiting on the cleaner
    pub would_block_cleaning: u64,
    /// Rotations this publication performed
    pub rotations: u64,
    /// Rotation attempts that lost to a concurrent rotation
    pub stale_rotations: u64,
}

impl PublicationMetricsSnapshot {
    pub fn would_block_total(&self) -> u64 {
        self.would_block_flow_control + self.would_block_rotation + self.would_block_cleaning
    }
}

/// Lock-free counters shared by every thread publishing through one publication.
#[derive(Debug, Default)]
pub struct PublicationMetrics {
    offers: AtomicU64,
    claims: AtomicU64,
    bytes_published: AtomicU64,
    would_block_flow_control: AtomicU64,
    would_block_rotation: AtomicU64,
    would_block_cleaning: AtomicU64,
    rotations: AtomicU64,
    stale_rotations: AtomicU64,
}

impl PublicationMetrics {
    pub fn record_offer(&self, bytes: usize) {
        self.offers.fetch_add(1, Ordering::Relaxed);
        self.bytes_published
            .fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_claim(&self, bytes: usize) {
        self.claims.fetch_add(1, Ordering::Relaxed);
        self.bytes_published
            .fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn incr_would_block(&self, kind: BackpressureKind) {
        match kind {
            BackpressureKind::FlowControl => {
                self.would_block_flow_control
                    .fetch_add(1, Ordering::Relaxed);
            }
            BackpressureKind::TermRotation => {
                self.would_block_rotation.fetch_add(1, Ordering::Relaxed);
            }
            BackpressureKind::Cleaning => {
                self.would_block_cleaning.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn incr_rotation(&self) {
        self.rotations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_stale_rotation(&self) {
        self.stale_rotations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> PublicationMetricsSnapshot {
        PublicationMetricsSnapshot {
            offers: self.offers.load(Ordering::Relaxed),
            claims: self.claims.load(Ordering::Relaxed),
            bytes_published: self.bytes_published.load(Ordering::Relaxed),
            would_block_flow_control: self.would_block_flow_control.load(Ordering::Relaxed),
            would_block_rotation: self.would_block_rotation.load(Ordering::Relaxed),
            would_block_cleaning: self.would_block_cleaning.load(Ordering::Relaxed),
            rotations: self.rotations.load(Ordering::Relaxed),
            stale_rotations: self.stale_rotations.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate_by_kind() {
        let metrics = PublicationMetrics::default();
        metrics.record_offer(100);
        metrics.record_claim(20);
        metrics.incr_would_block(BackpressureKind::FlowControl);
        metrics.incr_would_block(BackpressureKind::TermRotation);
        metrics.incr_would_block(BackpressureKind::TermRotation);
        metrics.incr_rotation();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.offers, 1);
        assert_eq!(snapshot.claims, 1);
        assert_eq!(snapshot.bytes_published, 120);
        assert_eq!(snapshot.would_block_rotation, 2);
        assert_eq!(snapshot.would_block_total(), 3);
        assert_eq!(snapshot.rotations, 1);
        assert_eq!(snapshot.stale_rotations, 0);
    }
}
