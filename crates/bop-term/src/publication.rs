//! Publisher handle: non-blocking offer and claim against the active term,
//! term rotation, and shared-handle reference counting.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, Ordering};

use arc_swap::ArcSwapOption;
use crossbeam_utils::CachePadded;
use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, info, trace, warn};

use crate::appender::{AppendOutcome, ClaimOutcome, TermAppender};
use crate::claim::BufferClaim;
use crate::config::RegistrationId;
use crate::descriptor::{FRAME_ALIGNMENT, TermStatus, align};
use crate::error::{BackpressureKind, TermError, TermResult};
use crate::flow_control::PositionIndicator;
use crate::metrics::{PublicationMetrics, PublicationMetricsSnapshot};
use crate::position::{
    buffer_index, calculate_position, position_bits_to_shift, rotate_next, rotate_previous,
};
use crate::term_buffer::{TermBuffer, TermBuffers};

/// Registration side of a publication's lifecycle.
///
/// `inc_ref` and `close` serialize on [`lifecycle_lock`]; the registry is told
/// exactly once, while that lock is held, when the last reference goes away.
///
/// [`lifecycle_lock`]: PublicationRegistry::lifecycle_lock
pub trait PublicationRegistry: Send + Sync {
    fn lifecycle_lock(&self) -> &Mutex<()>;

    fn release_publication(&self, registration_id: RegistrationId);
}

/// Result of one attempt to move the active term forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotationOutcome {
    /// This caller advanced the active term.
    Rotated,
    /// Another caller already rotated past the exhausted term.
    Stale,
    /// The next term has not been cleaned yet.
    AwaitingClean,
}

/// Identity of a publication within its conductor.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PublicationKey {
    pub channel: String,
    pub stream_id: i32,
    pub session_id: i32,
}

/// Writer end of a channel and stream.
///
/// A publication is shared by any number of publisher threads. `offer` and
/// `try_claim` never block: backpressure and term rotation are reported as
/// [`TermError::WouldBlock`] and the caller decides when to retry.
pub struct Publication {
    registry: Arc<dyn PublicationRegistry>,
    key: PublicationKey,
    registration_id: RegistrationId,
    initial_term_id: i32,
    active_term_id: CachePadded<AtomicI32>,
    position_bits_to_shift: u32,
    term_buffer_length: usize,
    appender: TermAppender,
    limit: Arc<dyn PositionIndicator>,
    terms: ArcSwapOption<TermBuffers>,
    ref_count: AtomicI32,
    metrics: PublicationMetrics,
}

impl Publication {
    /// Builds a publication over `terms`, stamping their default headers and
    /// activating the term for `initial_term_id`.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<dyn PublicationRegistry>,
        channel: impl Into<String>,
        stream_id: i32,
        session_id: i32,
        registration_id: RegistrationId,
        initial_term_id: i32,
        mtu_length: usize,
        terms: TermBuffers,
        limit: Arc<dyn PositionIndicator>,
    ) -> TermResult<Self> {
        let term_buffer_length = terms.capacity();
        let appender = TermAppender::new(term_buffer_length, mtu_length)?;
        terms.initialise(session_id, stream_id, initial_term_id);
        Ok(Self {
            registry,
            key: PublicationKey {
                channel: channel.into(),
                stream_id,
                session_id,
            },
            registration_id,
            initial_term_id,
            active_term_id: CachePadded::new(AtomicI32::new(initial_term_id)),
            position_bits_to_shift: position_bits_to_shift(term_buffer_length),
            term_buffer_length,
            appender,
            limit,
            terms: ArcSwapOption::from_pointee(terms),
            ref_count: AtomicI32::new(1),
            metrics: PublicationMetrics::default(),
        })
    }

    pub fn channel(&self) -> &str {
        &self.key.channel
    }

    pub fn stream_id(&self) -> i32 {
        self.key.stream_id
    }

    pub fn session_id(&self) -> i32 {
        self.key.session_id
    }

    pub fn key(&self) -> &PublicationKey {
        &self.key
    }

    pub fn registration_id(&self) -> RegistrationId {
        self.registration_id
    }

    pub fn initial_term_id(&self) -> i32 {
        self.initial_term_id
    }

    #[inline]
    pub fn active_term_id(&self) -> i32 {
        self.active_term_id.load(Ordering::Acquire)
    }

    pub fn term_buffer_length(&self) -> usize {
        self.term_buffer_length
    }

    pub fn position_bits_to_shift(&self) -> u32 {
        self.position_bits_to_shift
    }

    /// Largest message `offer` accepts; larger payloads are fragmented up to this.
    pub fn max_message_length(&self) -> usize {
        self.appender.max_message_length()
    }

    /// Largest payload a single frame, and therefore a claim, can carry.
    pub fn max_payload_length(&self) -> usize {
        self.appender.max_payload_length()
    }

    pub fn metrics(&self) -> PublicationMetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn ref_count(&self) -> i32 {
        self.ref_count.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.terms.load().is_none()
    }

    /// Term set, or `None` once the publication has been released.
    pub fn term_buffers(&self) -> Option<Arc<TermBuffers>> {
        self.terms.load_full()
    }

    /// Stream position of the active term's tail.
    pub fn position(&self) -> TermResult<i64> {
        let guard = self.terms.load();
        let terms = guard.as_ref().ok_or(TermError::Closed)?;
        let term_id = self.active_term_id();
        let term = terms.get(buffer_index(self.initial_term_id, term_id));
        Ok(self.position_of(term_id, term.tail_volatile()))
    }

    /// Current flow-control limit. Not read once the publication is closed.
    pub fn position_limit(&self) -> TermResult<i64> {
        if self.is_closed() {
            return Err(TermError::Closed);
        }
        Ok(self.limit.position())
    }

    #[inline]
    fn position_of(&self, term_id: i32, term_offset: usize) -> i64 {
        calculate_position(
            term_id,
            term_offset as i32,
            self.position_bits_to_shift,
            self.initial_term_id,
        )
    }

    /// Offers `payload` as one message and returns the stream position after it.
    ///
    /// Messages longer than [`max_payload_length`] are fragmented. On
    /// `WouldBlock` nothing was written and the call should be retried.
    ///
    /// [`max_payload_length`]: Publication::max_payload_length
    pub fn offer(&self, payload: &[u8]) -> TermResult<i64> {
        let max = self.appender.max_message_length();
        if payload.len() > max {
            return Err(TermError::MessageTooLarge {
                length: payload.len(),
                max,
            });
        }

        let guard = self.terms.load();
        let terms = guard.as_ref().ok_or(TermError::Closed)?;
        let term_id = self.active_term_id();
        let index = buffer_index(self.initial_term_id, term_id);
        let term = terms.get(index);
        self.check_flow_control(term_id, term)?;

        match self.appender.append(term, payload)? {
            AppendOutcome::Written { next_offset, .. } => {
                self.metrics.record_offer(payload.len());
                Ok(self.position_of(term_id, next_offset))
            }
            AppendOutcome::TermExhausted => Err(self.on_term_exhausted(terms, term_id, index)),
        }
    }

    /// Offers `buffer[offset..offset + length]`.
    pub fn offer_range(&self, buffer: &[u8], offset: usize, length: usize) -> TermResult<i64> {
        let end = offset
            .checked_add(length)
            .filter(|end| *end <= buffer.len())
            .ok_or(TermError::InvalidRange {
                offset,
                length,
                capacity: buffer.len(),
            })?;
        self.offer(&buffer[offset..end])
    }

    /// Reserves a frame of `length` payload bytes for zero-copy writing.
    ///
    /// ```rust
    /// use bop_term::test_support::anonymous_publication;
    ///
    /// let (publication, _registry) = anonymous_publication(64 * 1024, 7);
    /// let mut claim = publication.try_claim(5).expect("claim");
    /// claim.buffer_mut().copy_from_slice(b"hello");
    /// claim.commit();
    /// ```
    pub fn try_claim(&self, length: usize) -> TermResult<BufferClaim> {
        self.appender.check_claim_length(length)?;

        let terms = self.terms.load_full().ok_or(TermError::Closed)?;
        let term_id = self.active_term_id();
        let index = buffer_index(self.initial_term_id, term_id);
        let term = terms.get(index);
        self.check_flow_control(term_id, term)?;

        match self.appender.claim(term, length)? {
            ClaimOutcome::Claimed {
                frame_offset,
                frame_length,
            } => {
                self.metrics.record_claim(length);
                let position =
                    self.position_of(term_id, frame_offset + align(frame_length, FRAME_ALIGNMENT));
                Ok(BufferClaim::new(
                    terms,
                    index,
                    frame_offset,
                    frame_length,
                    position,
                ))
            }
            ClaimOutcome::TermExhausted => Err(self.on_term_exhausted(&terms, term_id, index)),
        }
    }

    fn check_flow_control(&self, term_id: i32, term: &TermBuffer) -> TermResult<()> {
        let position = self.position_of(term_id, term.tail_volatile());
        let limit = self.limit.position();
        if position >= limit {
            self.metrics.incr_would_block(BackpressureKind::FlowControl);
            trace!(
                registration_id = %self.registration_id,
                position,
                limit,
                "publication at flow-control limit"
            );
            return Err(TermError::would_block(BackpressureKind::FlowControl));
        }
        Ok(())
    }

    fn on_term_exhausted(&self, terms: &TermBuffers, term_id: i32, index: usize) -> TermError {
        let kind = match self.rotate(terms, term_id, index) {
            RotationOutcome::Rotated | RotationOutcome::Stale => BackpressureKind::TermRotation,
            RotationOutcome::AwaitingClean => BackpressureKind::Cleaning,
        };
        self.metrics.incr_would_block(kind);
        TermError::would_block(kind)
    }

    /// Moves the active term from `term_id` (at `index`) to `term_id + 1`.
    ///
    /// The next term is claimed by swapping its status from clean to in use, so
    /// exactly one caller performs each transition; the header stamp and the
    /// cleaning mark are published before the active term id.
    fn rotate(&self, terms: &TermBuffers, term_id: i32, index: usize) -> RotationOutcome {
        let next_index = rotate_next(index);
        let next = terms.get(next_index);
        if !next.compare_and_set_status(TermStatus::Clean, TermStatus::InUse) {
            return match next.status() {
                TermStatus::NeedsCleaning if self.active_term_id() == term_id => {
                    warn!(
                        registration_id = %self.registration_id,
                        term_id,
                        next_index,
                        "term rotation waiting on cleaner"
                    );
                    RotationOutcome::AwaitingClean
                }
                _ => {
                    self.metrics.incr_stale_rotation();
                    RotationOutcome::Stale
                }
            };
        }

        if self.active_term_id() != term_id {
            next.compare_and_set_status(TermStatus::InUse, TermStatus::Clean);
            self.metrics.incr_stale_rotation();
            return RotationOutcome::Stale;
        }

        let new_term_id = term_id.wrapping_add(1);
        next.set_default_header_term_id(new_term_id);
        let previous_index = rotate_previous(index);
        terms
            .get(previous_index)
            .status_ordered(TermStatus::NeedsCleaning);

        match self.active_term_id.compare_exchange(
            term_id,
            new_term_id,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                self.metrics.incr_rotation();
                debug!(
                    registration_id = %self.registration_id,
                    term_id = new_term_id,
                    active_index = next_index,
                    cleaning_index = previous_index,
                    "rotated term"
                );
                RotationOutcome::Rotated
            }
            Err(_) => {
                self.metrics.incr_stale_rotation();
                RotationOutcome::Stale
            }
        }
    }

    /// Adds a reference for another owner of this handle.
    pub fn inc_ref(&self) -> TermResult<()> {
        let guard = self.registry.lifecycle_lock().lock();
        self.inc_ref_locked(&guard)
    }

    /// `inc_ref` for callers already holding the registry's lifecycle lock.
    pub(crate) fn inc_ref_locked(&self, _guard: &MutexGuard<'_, ()>) -> TermResult<()> {
        let count = self.ref_count.load(Ordering::Acquire);
        if count <= 0 {
            return Err(TermError::Closed);
        }
        self.ref_count.store(count + 1, Ordering::Release);
        Ok(())
    }

    /// Drops one reference. The last one notifies the registry and releases the
    /// term buffers; later calls are no-ops.
    pub fn close(&self) {
        let _guard = self.registry.lifecycle_lock().lock();
        let count = self.ref_count.load(Ordering::Acquire);
        if count <= 0 {
            return;
        }
        self.ref_count.store(count - 1, Ordering::Release);
        if count > 1 {
            return;
        }

        self.registry.release_publication(self.registration_id);
        // In-flight offers and open claims keep their own handle to the set.
        self.terms.store(None);
        info!(
            registration_id = %self.registration_id,
            channel = %self.key.channel,
            stream_id = self.key.stream_id,
            session_id = self.key.session_id,
            "released publication"
        );
    }
}

impl fmt::Debug for Publication {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Publication")
            .field("channel", &self.key.channel)
            .field("stream_id", &self.key.stream_id)
            .field("session_id", &self.key.session_id)
            .field("registration_id", &self.registration_id)
            .field("initial_term_id", &self.initial_term_id)
            .field("active_term_id", &self.active_term_id())
            .field("ref_count", &self.ref_count())
            .finish()
    }
}
