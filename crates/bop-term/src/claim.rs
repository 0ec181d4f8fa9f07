use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian};

use crate::descriptor::{
    DATA_HEADER_LENGTH, HDR_TYPE_PAD, RESERVED_VALUE_FIELD_OFFSET, TYPE_FIELD_OFFSET,
};
use crate::term_buffer::{TermBuffer, TermBuffers};

/// Zero-copy reservation of one frame inside the active term.
///
/// The frame is invisible to readers until [`commit`] publishes it or [`abort`]
/// turns it into padding. Both consume the claim. A claim dropped without either
/// is a programming error: debug builds assert, release builds pad the frame so
/// readers can skip it.
///
/// The claim keeps the term set mapped, so it stays valid even if the
/// publication is released while the claim is open.
///
/// [`commit`]: BufferClaim::commit
/// [`abort`]: BufferClaim::abort
#[must_use = "commit() or abort() the claim to publish or skip the reserved frame"]
pub struct BufferClaim {
    terms: Arc<TermBuffers>,
    index: usize,
    frame_offset: usize,
    frame_length: usize,
    position: i64,
    consumed: bool,
}

impl BufferClaim {
    pub(crate) fn new(
        terms: Arc<TermBuffers>,
        index: usize,
        frame_offset: usize,
        frame_length: usize,
        position: i64,
    ) -> Self {
        Self {
            terms,
            index,
            frame_offset,
            frame_length,
            position,
            consumed: false,
        }
    }

    #[inline]
    fn term(&self) -> &TermBuffer {
        self.terms.get(self.index)
    }

    /// Offset of the frame header within its term.
    #[inline]
    pub fn frame_offset(&self) -> usize {
        self.frame_offset
    }

    /// Header plus payload length.
    #[inline]
    pub fn frame_length(&self) -> usize {
        self.frame_length
    }

    #[inline]
    pub fn length(&self) -> usize {
        self.frame_length - DATA_HEADER_LENGTH
    }

    /// Stream position just past the claimed frame.
    #[inline]
    pub fn position(&self) -> i64 {
        self.position
    }

    /// Index of the term holding the claim.
    #[inline]
    pub fn term_index(&self) -> usize {
        self.index
    }

    /// Writable payload of the claimed frame.
    pub fn buffer_mut(&mut self) -> &mut [u8] {
        // The range was reserved by a single fetch_add and is owned by this claim.
        unsafe {
            self.term()
                .log_slice_mut(self.frame_offset + DATA_HEADER_LENGTH, self.length())
        }
    }

    /// Sets the reserved value carried in the frame header.
    pub fn set_reserved_value(&mut self, value: i64) {
        let header = unsafe { self.term().log_slice_mut(self.frame_offset, DATA_HEADER_LENGTH) };
        LittleEndian::write_i64(&mut header[RESERVED_VALUE_FIELD_OFFSET..], value);
    }

    /// Publishes the frame to readers.
    pub fn commit(mut self) {
        self.consumed = true;
        self.term()
            .frame_length_ordered(self.frame_offset, self.frame_length as i32);
    }

    /// Publishes the frame as padding so readers skip it.
    pub fn abort(mut self) {
        self.consumed = true;
        self.write_padding();
    }

    fn write_padding(&self) {
        let header = unsafe { self.term().log_slice_mut(self.frame_offset, DATA_HEADER_LENGTH) };
        LittleEndian::write_u16(&mut header[TYPE_FIELD_OFFSET..], HDR_TYPE_PAD);
        self.term()
            .frame_length_ordered(self.frame_offset, self.frame_length as i32);
    }
}

impl Drop for BufferClaim {
    fn drop(&mut self) {
        if self.consumed {
            return;
        }
        self.write_padding();
        debug_assert!(
            std::thread::panicking(),
            "buffer claim dropped without commit or abort"
        );
    }
}

impl std::fmt::Debug for BufferClaim {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferClaim")
            .field("term_index", &self.index)
            .field("frame_offset", &self.frame_offset)
            .field("frame_length", &self.frame_length)
            .field("position", &self.position)
            .finish()
    }
}
