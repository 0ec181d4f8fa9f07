//! Term buffers: the log region frames are appended into plus the control region.
//!
//! Each term owns one mapped region laid out as
//!
//! ```text
//! | log (capacity) | tail | high-water-mark | status | default header |
//! |                |<----- STATE_BUFFER_LENGTH ----->| TEMPLATE_LENGTH|
//! ```
//!
//! The control counters are accessed only through atomics; the log is written
//! through ranges reserved by a single writer, with the frame length published
//! last.

use std::ptr;
use std::sync::atomic::{AtomicI32, AtomicI64, Ordering};

use byteorder::{ByteOrder, LittleEndian};
use tracing::debug;

use crate::config::RegistrationId;
use crate::descriptor::{
    DATA_HEADER_LENGTH, FRAME_LENGTH_FIELD_OFFSET, HEADER_TEMPLATE_LENGTH,
    HIGH_WATER_MARK_OFFSET, STATE_BUFFER_LENGTH, STATUS_OFFSET, TAIL_COUNTER_OFFSET,
    TERM_ID_FIELD_OFFSET, TermStatus, check_state_length, check_term_length,
    encode_default_header,
};
use crate::error::{TermError, TermResult};
use crate::fs::TermLayout;
use crate::position::TERM_COUNT;
use crate::storage::MappedRegion;

pub struct TermBuffer {
    region: MappedRegion,
    capacity: usize,
}

impl TermBuffer {
    /// Bytes of mapping a term of `capacity` needs.
    pub const fn region_length(capacity: usize) -> usize {
        capacity + STATE_BUFFER_LENGTH + HEADER_TEMPLATE_LENGTH
    }

    pub fn new(region: MappedRegion, capacity: usize) -> TermResult<Self> {
        check_term_length(capacity)?;
        let state_length = region
            .len()
            .checked_sub(capacity + HEADER_TEMPLATE_LENGTH)
            .ok_or_else(|| {
                TermError::invalid_config(format!(
                    "region of {} bytes cannot hold a term of {capacity} bytes",
                    region.len()
                ))
            })?;
        check_state_length(state_length)?;
        Ok(Self { region, capacity })
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    pub fn region(&self) -> &MappedRegion {
        &self.region
    }

    #[inline]
    fn state_ptr(&self, offset: usize) -> *mut u8 {
        debug_assert!(offset < STATE_BUFFER_LENGTH);
        unsafe { self.region.as_ptr().add(self.capacity + offset) }
    }

    #[inline]
    fn template_ptr(&self) -> *mut u8 {
        unsafe {
            self.region
                .as_ptr()
                .add(self.capacity + STATE_BUFFER_LENGTH)
        }
    }

    #[inline]
    fn tail_counter(&self) -> &AtomicI64 {
        // Mappings are page aligned and the capacity is a power of two of at
        // least 64 KiB, so every counter is naturally aligned.
        unsafe { &*(self.state_ptr(TAIL_COUNTER_OFFSET) as *const AtomicI64) }
    }

    #[inline]
    fn high_water_mark_counter(&self) -> &AtomicI32 {
        unsafe { &*(self.state_ptr(HIGH_WATER_MARK_OFFSET) as *const AtomicI32) }
    }

    #[inline]
    fn status_word(&self) -> &AtomicI32 {
        unsafe { &*(self.state_ptr(STATUS_OFFSET) as *const AtomicI32) }
    }

    #[inline]
    fn template_term_id(&self) -> &AtomicI32 {
        unsafe { &*(self.template_ptr().add(TERM_ID_FIELD_OFFSET) as *const AtomicI32) }
    }

    #[inline]
    fn clamp(&self, raw: i64) -> usize {
        raw.clamp(0, self.capacity as i64) as usize
    }

    /// Bytes reserved so far, capped at capacity.
    #[inline]
    pub fn tail(&self) -> usize {
        self.clamp(self.tail_counter().load(Ordering::Relaxed))
    }

    /// Bytes reserved so far, capped at capacity, with acquire ordering.
    #[inline]
    pub fn tail_volatile(&self) -> usize {
        self.clamp(self.tail_counter().load(Ordering::Acquire))
    }

    /// Unclamped tail counter. Exceeds capacity once writers have overrun the term.
    #[inline]
    pub fn raw_tail_volatile(&self) -> i64 {
        self.tail_counter().load(Ordering::Acquire)
    }

    #[inline]
    pub fn high_water_mark(&self) -> usize {
        self.clamp(i64::from(
            self.high_water_mark_counter().load(Ordering::Relaxed),
        ))
    }

    #[inline]
    pub fn high_water_mark_volatile(&self) -> usize {
        self.clamp(i64::from(
            self.high_water_mark_counter().load(Ordering::Acquire),
        ))
    }

    #[inline]
    pub fn status(&self) -> TermStatus {
        TermStatus::from_raw(self.status_word().load(Ordering::Acquire))
    }

    #[inline]
    pub fn status_ordered(&self, status: TermStatus) {
        self.status_word().store(status.as_raw(), Ordering::Release);
    }

    /// Atomically moves the status from `expected` to `update`.
    #[inline]
    pub fn compare_and_set_status(&self, expected: TermStatus, update: TermStatus) -> bool {
        self.status_word()
            .compare_exchange(
                expected.as_raw(),
                update.as_raw(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Zeroes the log and resets the tail and high-water mark, then publishes `Clean`.
    ///
    /// Must not run while the term is active or while a claim into it is open.
    /// The status word is left untouched until the final release store, so a
    /// rotation cannot claim the term part way through. The default header
    /// template survives.
    pub fn clean(&self) {
        unsafe {
            ptr::write_bytes(self.region.as_ptr(), 0, self.capacity);
        }
        self.tail_counter().store(0, Ordering::Relaxed);
        self.high_water_mark_counter().store(0, Ordering::Relaxed);
        self.status_ordered(TermStatus::Clean);
    }

    /// Writes the default header template. Only called while the term set is
    /// being set up and no writer can observe it.
    pub(crate) fn write_default_header(&self, session_id: i32, stream_id: i32, term_id: i32) {
        let header = encode_default_header(session_id, stream_id, term_id);
        unsafe {
            ptr::copy_nonoverlapping(header.as_ptr(), self.template_ptr(), DATA_HEADER_LENGTH);
        }
    }

    /// Copy of the default header with the term id read atomically.
    pub fn default_header(&self) -> [u8; DATA_HEADER_LENGTH] {
        let mut header = [0u8; DATA_HEADER_LENGTH];
        let template = self.template_ptr();
        unsafe {
            ptr::copy_nonoverlapping(template, header.as_mut_ptr(), TERM_ID_FIELD_OFFSET);
            let after = TERM_ID_FIELD_OFFSET + 4;
            ptr::copy_nonoverlapping(
                template.add(after),
                header.as_mut_ptr().add(after),
                DATA_HEADER_LENGTH - after,
            );
        }
        LittleEndian::write_i32(
            &mut header[TERM_ID_FIELD_OFFSET..],
            self.default_header_term_id(),
        );
        header
    }

    #[inline]
    pub fn default_header_term_id(&self) -> i32 {
        i32::from_le(self.template_term_id().load(Ordering::Acquire))
    }

    /// Stamps `term_id` into the header every frame appended to this term inherits.
    #[inline]
    pub fn set_default_header_term_id(&self, term_id: i32) {
        self.template_term_id()
            .store(term_id.to_le(), Ordering::Release);
    }

    /// Reserves `length` bytes, returning the offset the reservation starts at.
    /// The result may lie beyond capacity.
    #[inline]
    pub(crate) fn get_and_add_tail(&self, length: usize) -> i64 {
        self.tail_counter()
            .fetch_add(length as i64, Ordering::AcqRel)
    }

    #[inline]
    pub(crate) fn advance_high_water_mark(&self, offset: usize) {
        let capped = offset.min(self.capacity) as i32;
        self.high_water_mark_counter()
            .fetch_max(capped, Ordering::AcqRel);
    }

    /// Copies `src` into the log at `offset`.
    ///
    /// # Safety
    ///
    /// The caller must own the reservation covering `offset..offset + src.len()`.
    #[inline]
    pub(crate) unsafe fn write_log(&self, offset: usize, src: &[u8]) {
        debug_assert!(offset + src.len() <= self.capacity);
        unsafe {
            ptr::copy_nonoverlapping(src.as_ptr(), self.region.as_ptr().add(offset), src.len());
        }
    }

    /// Mutable view of a reserved log range.
    ///
    /// # Safety
    ///
    /// The caller must own the reservation covering the range and must not hand
    /// out overlapping views.
    #[inline]
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn log_slice_mut(&self, offset: usize, length: usize) -> &mut [u8] {
        debug_assert!(offset + length <= self.capacity);
        unsafe { std::slice::from_raw_parts_mut(self.region.as_ptr().add(offset), length) }
    }

    #[inline]
    fn frame_length_word(&self, frame_offset: usize) -> &AtomicI32 {
        debug_assert!(frame_offset % 4 == 0 && frame_offset + 4 <= self.capacity);
        unsafe {
            &*(self
                .region
                .as_ptr()
                .add(frame_offset + FRAME_LENGTH_FIELD_OFFSET) as *const AtomicI32)
        }
    }

    /// Publishes a frame by storing its length with release ordering.
    #[inline]
    pub(crate) fn frame_length_ordered(&self, frame_offset: usize, frame_length: i32) {
        self.frame_length_word(frame_offset)
            .store(frame_length.to_le(), Ordering::Release);
    }

    /// Length of the frame at `frame_offset`, zero while it is unpublished.
    #[inline]
    pub fn frame_length_volatile(&self, frame_offset: usize) -> i32 {
        i32::from_le(self.frame_length_word(frame_offset).load(Ordering::Acquire))
    }

    /// Copies `dst.len()` bytes of the log starting at `offset` into `dst`.
    ///
    /// Only meaningful for published frames.
    pub fn copy_out(&self, offset: usize, dst: &mut [u8]) -> TermResult<()> {
        let end = offset
            .checked_add(dst.len())
            .filter(|end| *end <= self.capacity)
            .ok_or(TermError::InvalidRange {
                offset,
                length: dst.len(),
                capacity: self.capacity,
            })?;
        unsafe {
            ptr::copy_nonoverlapping(
                self.region.as_ptr().add(offset),
                dst.as_mut_ptr(),
                end - offset,
            );
        }
        Ok(())
    }

    #[inline]
    pub(crate) fn set_tail(&self, tail: i64) {
        self.tail_counter().store(tail, Ordering::Release);
    }

    pub fn flush(&self) -> TermResult<()> {
        self.region.flush()
    }
}

impl std::fmt::Debug for TermBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TermBuffer")
            .field("capacity", &self.capacity)
            .field("tail", &self.raw_tail_volatile())
            .field("status", &self.status())
            .field("term_id", &self.default_header_term_id())
            .finish()
    }
}

/// The three terms of a publication, indexed by `buffer_index`.
#[derive(Debug)]
pub struct TermBuffers {
    terms: [TermBuffer; TERM_COUNT],
}

impl TermBuffers {
    pub fn from_terms(terms: [TermBuffer; TERM_COUNT]) -> TermResult<Self> {
        let capacity = terms[0].capacity();
        if terms.iter().any(|term| term.capacity() != capacity) {
            return Err(TermError::invalid_config(
                "term buffers in a set must share one capacity",
            ));
        }
        Ok(Self { terms })
    }

    /// Three terms in private anonymous mappings.
    pub fn anonymous(capacity: usize) -> TermResult<Self> {
        check_term_length(capacity)?;
        let mut terms = Vec::with_capacity(TERM_COUNT);
        for _ in 0..TERM_COUNT {
            let region = MappedRegion::anonymous(TermBuffer::region_length(capacity))?;
            terms.push(TermBuffer::new(region, capacity)?);
        }
        Self::from_vec(terms)
    }

    /// Three terms in files under `layout`, keyed by the publication identity.
    pub fn create_files(
        layout: &TermLayout,
        channel: &str,
        stream_id: i32,
        session_id: i32,
        registration_id: RegistrationId,
        capacity: usize,
        unlink_on_drop: bool,
    ) -> TermResult<Self> {
        check_term_length(capacity)?;
        let mut terms = Vec::with_capacity(TERM_COUNT);
        for index in 0..TERM_COUNT {
            let path = layout.term_path(channel, stream_id, session_id, registration_id, index);
            let region = MappedRegion::create_file(
                &path,
                TermBuffer::region_length(capacity),
                unlink_on_drop,
            )?;
            terms.push(TermBuffer::new(region, capacity)?);
        }
        debug!(
            dir = %layout
                .publication_dir(channel, stream_id, session_id, registration_id)
                .display(),
            capacity,
            "created term files"
        );
        Self::from_vec(terms)
    }

    fn from_vec(terms: Vec<TermBuffer>) -> TermResult<Self> {
        let terms: [TermBuffer; TERM_COUNT] = terms
            .try_into()
            .map_err(|_| TermError::invalid_state("expected exactly three term buffers"))?;
        Self::from_terms(terms)
    }

    /// Stamps default headers and activates the first term.
    ///
    /// The term at index `i` starts with term id `initial_term_id + i`; rotation
    /// re-stamps each term before it becomes active.
    pub(crate) fn initialise(&self, session_id: i32, stream_id: i32, initial_term_id: i32) {
        for (index, term) in self.terms.iter().enumerate() {
            term.write_default_header(
                session_id,
                stream_id,
                initial_term_id.wrapping_add(index as i32),
            );
            let status = if index == 0 {
                TermStatus::InUse
            } else {
                TermStatus::Clean
            };
            term.status_ordered(status);
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.terms[0].capacity()
    }

    /// Term at `index`.
    ///
    /// # Panics
    ///
    /// Panics when `index >= TERM_COUNT`.
    #[inline]
    pub fn get(&self, index: usize) -> &TermBuffer {
        &self.terms[index]
    }

    pub fn iter(&self) -> impl Iterator<Item = &TermBuffer> {
        self.terms.iter()
    }

    pub fn flush(&self) -> TermResult<()> {
        for term in &self.terms {
            term.flush()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::{SESSION_ID_FIELD_OFFSET, STREAM_ID_FIELD_OFFSET, TERM_MIN_LENGTH};
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use std::thread;
    use tempfile::TempDir;

    fn term(capacity: usize) -> TermBuffer {
        let region = MappedRegion::anonymous(TermBuffer::region_length(capacity)).expect("map");
        TermBuffer::new(region, capacity).expect("term")
    }

    #[test]
    fn rejects_bad_capacity_and_short_regions() {
        let region = MappedRegion::anonymous(200_000).expect("map");
        assert!(matches!(
            TermBuffer::new(region, 100_000),
            Err(TermError::InvalidConfig(_))
        ));

        let region =
            MappedRegion::anonymous(TERM_MIN_LENGTH + HEADER_TEMPLATE_LENGTH).expect("map");
        assert!(matches!(
            TermBuffer::new(region, TERM_MIN_LENGTH),
            Err(TermError::InvalidConfig(msg)) if msg.contains("state buffer")
        ));

        let region = MappedRegion::anonymous(1024).expect("map");
        assert!(TermBuffer::new(region, TERM_MIN_LENGTH).is_err());
    }

    #[test]
    fn tail_is_clamped_to_capacity() {
        let term = term(TERM_MIN_LENGTH);
        assert_eq!(term.tail(), 0);
        assert_eq!(term.get_and_add_tail(64), 0);
        assert_eq!(term.tail_volatile(), 64);
        term.set_tail(TERM_MIN_LENGTH as i64 + 4096);
        assert_eq!(term.tail(), TERM_MIN_LENGTH);
        assert_eq!(term.tail_volatile(), TERM_MIN_LENGTH);
        assert_eq!(term.raw_tail_volatile(), TERM_MIN_LENGTH as i64 + 4096);
    }

    #[test]
    fn high_water_mark_only_advances() {
        let term = term(TERM_MIN_LENGTH);
        term.advance_high_water_mark(640);
        term.advance_high_water_mark(320);
        assert_eq!(term.high_water_mark(), 640);
        term.advance_high_water_mark(usize::MAX / 2);
        assert_eq!(term.high_water_mark_volatile(), TERM_MIN_LENGTH);
    }

    #[test]
    fn status_transitions() {
        let term = term(TERM_MIN_LENGTH);
        assert_eq!(term.status(), TermStatus::Clean);
        assert!(term.compare_and_set_status(TermStatus::Clean, TermStatus::InUse));
        assert!(!term.compare_and_set_status(TermStatus::Clean, TermStatus::InUse));
        term.status_ordered(TermStatus::NeedsCleaning);
        assert_eq!(term.status(), TermStatus::NeedsCleaning);
    }

    #[test]
    fn clean_zeroes_log_and_state_but_keeps_header() {
        let term = term(TERM_MIN_LENGTH);
        term.write_default_header(11, 22, 33);
        unsafe { term.write_log(128, &[0xFF; 64]) };
        term.get_and_add_tail(192);
        term.advance_high_water_mark(192);
        term.status_ordered(TermStatus::NeedsCleaning);

        term.clean();

        let mut bytes = [1u8; 64];
        term.copy_out(128, &mut bytes).expect("copy");
        assert!(bytes.iter().all(|b| *b == 0));
        assert_eq!(term.tail(), 0);
        assert_eq!(term.high_water_mark(), 0);
        assert_eq!(term.status(), TermStatus::Clean);
        assert_eq!(term.default_header_term_id(), 33);
    }

    #[test]
    fn rotation_cannot_claim_a_term_mid_clean() {
        const ROUNDS: usize = 200;

        let term = term(TERM_MIN_LENGTH);
        term.status_ordered(TermStatus::InUse);
        let claims = AtomicUsize::new(0);
        let stop = AtomicBool::new(false);
        let mut observed = Vec::with_capacity(ROUNDS);

        thread::scope(|scope| {
            scope.spawn(|| {
                while !stop.load(Ordering::Acquire) {
                    if term.compare_and_set_status(TermStatus::Clean, TermStatus::InUse) {
                        claims.fetch_add(1, Ordering::AcqRel);
                    } else {
                        std::hint::spin_loop();
                    }
                }
            });

            for round in 0..ROUNDS {
                term.status_ordered(TermStatus::NeedsCleaning);
                let offset = term.get_and_add_tail(4096) as usize;
                unsafe { term.write_log(offset, &[0xAB; 4096]) };
                term.clean();
                while claims.load(Ordering::Acquire) <= round {
                    thread::yield_now();
                }
                observed.push((term.status(), term.tail()));
            }
            stop.store(true, Ordering::Release);
        });

        assert_eq!(claims.load(Ordering::Acquire), ROUNDS, "one claim per clean");
        assert!(
            observed
                .iter()
                .all(|(status, tail)| *status == TermStatus::InUse && *tail == 0),
            "claimed term reverted to clean or kept its tail"
        );
        let mut log = vec![1u8; TERM_MIN_LENGTH];
        term.copy_out(0, &mut log).expect("copy");
        assert!(log.iter().all(|b| *b == 0));
    }

    #[test]
    fn default_header_reflects_stamped_term_id() {
        let term = term(TERM_MIN_LENGTH);
        term.write_default_header(-1, 1001, 7);
        term.set_default_header_term_id(8);
        let header = term.default_header();
        assert_eq!(LittleEndian::read_i32(&header[TERM_ID_FIELD_OFFSET..]), 8);
        assert_eq!(LittleEndian::read_i32(&header[SESSION_ID_FIELD_OFFSET..]), -1);
        assert_eq!(LittleEndian::read_i32(&header[STREAM_ID_FIELD_OFFSET..]), 1001);
    }

    #[test]
    fn frame_length_is_published_little_endian() {
        let term = term(TERM_MIN_LENGTH);
        term.frame_length_ordered(96, 132);
        assert_eq!(term.frame_length_volatile(96), 132);
        let mut bytes = [0u8; 4];
        term.copy_out(96, &mut bytes).expect("copy");
        assert_eq!(bytes, 132i32.to_le_bytes());
    }

    #[test]
    fn copy_out_rejects_ranges_past_capacity() {
        let term = term(TERM_MIN_LENGTH);
        let mut bytes = [0u8; 8];
        assert!(matches!(
            term.copy_out(TERM_MIN_LENGTH - 4, &mut bytes),
            Err(TermError::InvalidRange { .. })
        ));
    }

    #[test]
    fn initialise_activates_first_term() {
        let terms = TermBuffers::anonymous(TERM_MIN_LENGTH).expect("terms");
        terms.initialise(5, 6, i32::MAX);
        assert_eq!(terms.get(0).status(), TermStatus::InUse);
        assert_eq!(terms.get(1).status(), TermStatus::Clean);
        assert_eq!(terms.get(2).status(), TermStatus::Clean);
        assert_eq!(terms.get(0).default_header_term_id(), i32::MAX);
        assert_eq!(terms.get(1).default_header_term_id(), i32::MIN);
        assert_eq!(terms.capacity(), TERM_MIN_LENGTH);
        assert_eq!(terms.iter().count(), TERM_COUNT);
    }

    #[test]
    fn mismatched_capacities_are_rejected() {
        let terms = [term(TERM_MIN_LENGTH), term(TERM_MIN_LENGTH), term(2 * TERM_MIN_LENGTH)];
        assert!(matches!(
            TermBuffers::from_terms(terms),
            Err(TermError::InvalidConfig(_))
        ));
    }

    #[test]
    fn file_backed_terms_share_bytes_with_the_file() {
        let tmp = TempDir::new().expect("tempdir");
        let layout = TermLayout::new(tmp.path());
        let id = RegistrationId::new(1);
        let terms = TermBuffers::create_files(&layout, "ipc", 10, 20, id, TERM_MIN_LENGTH, false)
            .expect("terms");
        terms.initialise(20, 10, 3);
        terms.flush().expect("flush");

        let path = layout.term_path("ipc", 10, 20, id, 1);
        let bytes = std::fs::read(&path).expect("read");
        assert_eq!(bytes.len(), TermBuffer::region_length(TERM_MIN_LENGTH));
        let template = TERM_MIN_LENGTH + STATE_BUFFER_LENGTH;
        assert_eq!(
            LittleEndian::read_i32(&bytes[template + TERM_ID_FIELD_OFFSET..]),
            4
        );
        assert_eq!(
            LittleEndian::read_i32(&bytes[TERM_MIN_LENGTH + STATUS_OFFSET..]),
            TermStatus::Clean.as_raw()
        );
    }
}
