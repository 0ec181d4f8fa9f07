//! Helpers for tests and demos: an in-memory registry, fixed flow-control
//! limits, anonymous publications and a frame scanner standing in for a reader.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use byteorder::{ByteOrder, LittleEndian};
use parking_lot::Mutex;

use crate::config::RegistrationId;
use crate::descriptor::{
    DATA_HEADER_LENGTH, FLAGS_FIELD_OFFSET, FRAME_ALIGNMENT, TERM_ID_FIELD_OFFSET,
    TERM_OFFSET_FIELD_OFFSET, TYPE_FIELD_OFFSET, align,
};
use crate::flow_control::PositionIndicator;
use crate::publication::{Publication, PublicationRegistry};
use crate::term_buffer::{TermBuffer, TermBuffers};

pub const TEST_CHANNEL: &str = "ipc";
pub const TEST_STREAM_ID: i32 = 10;
pub const TEST_SESSION_ID: i32 = 1;
pub const TEST_MTU_LENGTH: usize = 1408;

/// Registry that records every release notification.
#[derive(Debug, Default)]
pub struct RecordingRegistry {
    lifecycle: Mutex<()>,
    released: Mutex<Vec<RegistrationId>>,
    next_registration_id: AtomicI64,
}

impl RecordingRegistry {
    pub fn released(&self) -> Vec<RegistrationId> {
        self.released.lock().clone()
    }

    fn next_registration_id(&self) -> RegistrationId {
        RegistrationId::new(self.next_registration_id.fetch_add(1, Ordering::Relaxed) + 1)
    }
}

impl PublicationRegistry for RecordingRegistry {
    fn lifecycle_lock(&self) -> &Mutex<()> {
        &self.lifecycle
    }

    fn release_publication(&self, registration_id: RegistrationId) {
        self.released.lock().push(registration_id);
    }
}

/// Flow-control limit pinned to one position.
#[derive(Debug, Clone, Copy)]
pub struct FixedLimit {
    position: i64,
}

impl FixedLimit {
    pub fn new(position: i64) -> Self {
        Self { position }
    }

    pub fn unbounded() -> Self {
        Self::new(i64::MAX)
    }
}

impl PositionIndicator for FixedLimit {
    fn position(&self) -> i64 {
        self.position
    }
}

/// Publication over anonymous terms registered with `registry`.
pub fn publication_for<L>(
    registry: Arc<RecordingRegistry>,
    term_length: usize,
    initial_term_id: i32,
    limit: Arc<L>,
) -> Arc<Publication>
where
    L: PositionIndicator + 'static,
{
    let registration_id = registry.next_registration_id();
    let terms = TermBuffers::anonymous(term_length).expect("anonymous term buffers");
    let publication = Publication::new(
        registry,
        TEST_CHANNEL,
        TEST_STREAM_ID,
        TEST_SESSION_ID,
        registration_id,
        initial_term_id,
        TEST_MTU_LENGTH,
        terms,
        limit,
    )
    .expect("publication");
    Arc::new(publication)
}

pub fn publication_with_limit<L>(
    term_length: usize,
    initial_term_id: i32,
    limit: Arc<L>,
) -> (Arc<Publication>, Arc<RecordingRegistry>)
where
    L: PositionIndicator + 'static,
{
    let registry = Arc::new(RecordingRegistry::default());
    let publication = publication_for(registry.clone(), term_length, initial_term_id, limit);
    (publication, registry)
}

/// Publication with no flow-control limit.
pub fn anonymous_publication(
    term_length: usize,
    initial_term_id: i32,
) -> (Arc<Publication>, Arc<RecordingRegistry>) {
    publication_with_limit(
        term_length,
        initial_term_id,
        Arc::new(FixedLimit::unbounded()),
    )
}

/// Moves a term's tail as if `tail` bytes had already been appended.
pub fn set_tail(term: &TermBuffer, tail: i64) {
    term.set_tail(tail);
}

/// A published frame as a reader would see it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub term_offset: usize,
    pub frame_length: usize,
    pub frame_type: u16,
    pub flags: u8,
    pub term_id: i32,
    pub payload: Vec<u8>,
}

/// Scans published frames from the start of `term` up to the first unpublished one.
pub fn read_frames(term: &TermBuffer) -> Vec<Frame> {
    let mut frames = Vec::new();
    let mut offset = 0;
    while offset + DATA_HEADER_LENGTH <= term.capacity() {
        let frame_length = term.frame_length_volatile(offset);
        if frame_length <= 0 {
            break;
        }
        let frame_length = frame_length as usize;
        let mut header = [0u8; DATA_HEADER_LENGTH];
        term.copy_out(offset, &mut header).expect("frame header");
        let frame_type = LittleEndian::read_u16(&header[TYPE_FIELD_OFFSET..]);
        let payload_length = frame_length.saturating_sub(DATA_HEADER_LENGTH);
        let mut payload = vec![0u8; payload_length];
        if frame_type == crate::descriptor::HDR_TYPE_DATA {
            term.copy_out(offset + DATA_HEADER_LENGTH, &mut payload)
                .expect("frame payload");
        }
        assert_eq!(
            LittleEndian::read_i32(&header[TERM_OFFSET_FIELD_OFFSET..]) as usize,
            offset,
            "frame term offset"
        );
        frames.push(Frame {
            term_offset: offset,
            frame_length,
            frame_type,
            flags: header[FLAGS_FIELD_OFFSET],
            term_id: LittleEndian::read_i32(&header[TERM_ID_FIELD_OFFSET..]),
            payload,
        });
        offset += align(frame_length, FRAME_ALIGNMENT);
    }
    frames
}
