//! Bounded appends and claims into a single term.
//!
//! Every reservation is one `fetch_add` on the term tail, so concurrent writers
//! never overlap. A reservation that crosses the end of the term is turned into a
//! padding frame (when it started inside the term) and reported as exhausted; the
//! publication then rotates to the next term.

use byteorder::{ByteOrder, LittleEndian};

use crate::descriptor::{
    BEGIN_FRAG_FLAG, DATA_HEADER_LENGTH, END_FRAG_FLAG, FLAGS_FIELD_OFFSET, FRAME_ALIGNMENT,
    FRAME_LENGTH_FIELD_OFFSET, HDR_TYPE_DATA, HDR_TYPE_PAD, TERM_OFFSET_FIELD_OFFSET,
    TYPE_FIELD_OFFSET, UNFRAGMENTED, align, check_mtu_length, check_term_length,
    max_message_length,
};
use crate::error::{TermError, TermResult};
use crate::term_buffer::TermBuffer;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    /// The message was written; `next_offset` is the term tail after it.
    Written { term_offset: usize, next_offset: usize },
    /// The term has no room left; rotate and retry.
    TermExhausted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// A frame was reserved at `frame_offset`; `frame_length` includes the header.
    Claimed {
        frame_offset: usize,
        frame_length: usize,
    },
    TermExhausted,
}

/// Writes frames into terms of one capacity with one MTU.
#[derive(Debug, Clone, Copy)]
pub struct TermAppender {
    capacity: usize,
    max_message_length: usize,
    max_payload_length: usize,
}

impl TermAppender {
    pub fn new(term_length: usize, mtu_length: usize) -> TermResult<Self> {
        check_term_length(term_length)?;
        check_mtu_length(mtu_length, term_length)?;
        Ok(Self {
            capacity: term_length,
            max_message_length: max_message_length(term_length),
            max_payload_length: mtu_length - DATA_HEADER_LENGTH,
        })
    }

    #[inline]
    pub fn max_message_length(&self) -> usize {
        self.max_message_length
    }

    #[inline]
    pub fn max_payload_length(&self) -> usize {
        self.max_payload_length
    }

    /// Bytes of log a message of `length` occupies once framed and aligned.
    pub fn framed_length(&self, length: usize) -> usize {
        if length <= self.max_payload_length {
            return align(length + DATA_HEADER_LENGTH, FRAME_ALIGNMENT);
        }
        let full_frames = length / self.max_payload_length;
        let remaining = length % self.max_payload_length;
        let last_frame = if remaining > 0 {
            align(remaining + DATA_HEADER_LENGTH, FRAME_ALIGNMENT)
        } else {
            0
        };
        full_frames * align(self.max_payload_length + DATA_HEADER_LENGTH, FRAME_ALIGNMENT)
            + last_frame
    }

    /// Appends `payload`, fragmenting it when it exceeds one frame.
    pub fn append(&self, term: &TermBuffer, payload: &[u8]) -> TermResult<AppendOutcome> {
        self.check_term(term)?;
        let length = payload.len();
        if length > self.max_message_length {
            return Err(TermError::MessageTooLarge {
                length,
                max: self.max_message_length,
            });
        }

        let required = self.framed_length(length);
        let Some(frame_offset) = self.reserve(term, required) else {
            return Ok(AppendOutcome::TermExhausted);
        };

        let header = term.default_header();
        if length <= self.max_payload_length {
            write_frame(term, &header, frame_offset, payload, UNFRAGMENTED);
        } else {
            let mut offset = frame_offset;
            let mut chunks = payload.chunks(self.max_payload_length).peekable();
            let mut flags = BEGIN_FRAG_FLAG;
            while let Some(chunk) = chunks.next() {
                if chunks.peek().is_none() {
                    flags |= END_FRAG_FLAG;
                }
                write_frame(term, &header, offset, chunk, flags);
                offset += align(chunk.len() + DATA_HEADER_LENGTH, FRAME_ALIGNMENT);
                flags = 0;
            }
        }

        Ok(AppendOutcome::Written {
            term_offset: frame_offset,
            next_offset: frame_offset + required,
        })
    }

    /// Reserves one unfragmented frame for `length` payload bytes.
    ///
    /// The header is written with a zero frame length; the frame becomes visible
    /// only when the claim is committed or aborted.
    pub fn claim(&self, term: &TermBuffer, length: usize) -> TermResult<ClaimOutcome> {
        self.check_term(term)?;
        self.check_claim_length(length)?;

        let frame_length = length + DATA_HEADER_LENGTH;
        let Some(frame_offset) = self.reserve(term, align(frame_length, FRAME_ALIGNMENT)) else {
            return Ok(ClaimOutcome::TermExhausted);
        };
        let mut header = term.default_header();
        stamp_header(&mut header, frame_offset, UNFRAGMENTED, HDR_TYPE_DATA);
        unsafe {
            term.write_log(
                frame_offset + FRAME_LENGTH_FIELD_OFFSET + 4,
                &header[FRAME_LENGTH_FIELD_OFFSET + 4..],
            );
        }
        Ok(ClaimOutcome::Claimed {
            frame_offset,
            frame_length,
        })
    }

    pub fn check_claim_length(&self, length: usize) -> TermResult<()> {
        if length > self.max_payload_length {
            return Err(TermError::InvalidClaimLength {
                length,
                max: self.max_payload_length,
            });
        }
        Ok(())
    }

    fn check_term(&self, term: &TermBuffer) -> TermResult<()> {
        if term.capacity() != self.capacity {
            return Err(TermError::invalid_state(format!(
                "appender for {} byte terms used on a {} byte term",
                self.capacity,
                term.capacity()
            )));
        }
        Ok(())
    }

    /// Reserves `aligned_length` bytes. Returns `None` when the term is exhausted,
    /// after padding out the remainder if this reservation was the one to cross
    /// the end.
    fn reserve(&self, term: &TermBuffer, aligned_length: usize) -> Option<usize> {
        let raw_offset = term.get_and_add_tail(aligned_length);
        let resulting = raw_offset + aligned_length as i64;
        if resulting > self.capacity as i64 {
            if raw_offset < self.capacity as i64 {
                let frame_offset = raw_offset as usize;
                pad_to_end(term, frame_offset);
                term.advance_high_water_mark(self.capacity);
            }
            return None;
        }
        term.advance_high_water_mark(resulting as usize);
        Some(raw_offset as usize)
    }
}

fn stamp_header(
    header: &mut [u8; DATA_HEADER_LENGTH],
    frame_offset: usize,
    flags: u8,
    frame_type: u16,
) {
    header[FLAGS_FIELD_OFFSET] = flags;
    LittleEndian::write_u16(&mut header[TYPE_FIELD_OFFSET..], frame_type);
    LittleEndian::write_i32(&mut header[TERM_OFFSET_FIELD_OFFSET..], frame_offset as i32);
}

fn write_frame(
    term: &TermBuffer,
    template: &[u8; DATA_HEADER_LENGTH],
    frame_offset: usize,
    payload: &[u8],
    flags: u8,
) {
    let mut header = *template;
    stamp_header(&mut header, frame_offset, flags, HDR_TYPE_DATA);
    unsafe {
        term.write_log(
            frame_offset + FRAME_LENGTH_FIELD_OFFSET + 4,
            &header[FRAME_LENGTH_FIELD_OFFSET + 4..],
        );
        term.write_log(frame_offset + DATA_HEADER_LENGTH, payload);
    }
    term.frame_length_ordered(frame_offset, (payload.len() + DATA_HEADER_LENGTH) as i32);
}

fn pad_to_end(term: &TermBuffer, frame_offset: usize) {
    let mut header = term.default_header();
    stamp_header(&mut header, frame_offset, UNFRAGMENTED, HDR_TYPE_PAD);
    unsafe {
        term.write_log(
            frame_offset + FRAME_LENGTH_FIELD_OFFSET + 4,
            &header[FRAME_LENGTH_FIELD_OFFSET + 4..],
        );
    }
    term.frame_length_ordered(frame_offset, (term.capacity() - frame_offset) as i32);
}
