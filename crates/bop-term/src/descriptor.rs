//! Layout of a term: the log region frames are appended into, the control region
//! holding the tail, high-water-mark and status, and the data frame header.

use byteorder::{ByteOrder, LittleEndian};

use crate::error::{TermError, TermResult};

pub const CACHE_LINE_LENGTH: usize = 64;

/// Smallest supported term capacity (64 KiB).
pub const TERM_MIN_LENGTH: usize = 64 * 1024;
/// Largest supported term capacity (1 GiB).
pub const TERM_MAX_LENGTH: usize = 1024 * 1024 * 1024;

pub const TAIL_COUNTER_OFFSET: usize = 0;
pub const HIGH_WATER_MARK_OFFSET: usize = TAIL_COUNTER_OFFSET + CACHE_LINE_LENGTH;
pub const STATUS_OFFSET: usize = HIGH_WATER_MARK_OFFSET + CACHE_LINE_LENGTH;
/// Control region length; each counter sits on its own cache line.
pub const STATE_BUFFER_LENGTH: usize = STATUS_OFFSET + CACHE_LINE_LENGTH;
/// Space reserved after the control region for the default frame header.
pub const HEADER_TEMPLATE_LENGTH: usize = CACHE_LINE_LENGTH;

pub const FRAME_ALIGNMENT: usize = 32;

pub const DATA_HEADER_LENGTH: usize = 32;
pub const FRAME_LENGTH_FIELD_OFFSET: usize = 0;
pub const VERSION_FIELD_OFFSET: usize = 4;
pub const FLAGS_FIELD_OFFSET: usize = 5;
pub const TYPE_FIELD_OFFSET: usize = 6;
pub const TERM_OFFSET_FIELD_OFFSET: usize = 8;
pub const SESSION_ID_FIELD_OFFSET: usize = 12;
pub const STREAM_ID_FIELD_OFFSET: usize = 16;
pub const TERM_ID_FIELD_OFFSET: usize = 20;
pub const RESERVED_VALUE_FIELD_OFFSET: usize = 24;

pub const CURRENT_VERSION: u8 = 0;
pub const HDR_TYPE_PAD: u16 = 0x00;
pub const HDR_TYPE_DATA: u16 = 0x01;

pub const BEGIN_FRAG_FLAG: u8 = 0x80;
pub const END_FRAG_FLAG: u8 = 0x40;
pub const UNFRAGMENTED: u8 = BEGIN_FRAG_FLAG | END_FRAG_FLAG;

/// Lifecycle of a term buffer as seen by the publisher and the cleaner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum TermStatus {
    Clean = 0,
    InUse = 1,
    NeedsCleaning = 2,
}

impl TermStatus {
    #[inline]
    pub const fn as_raw(self) -> i32 {
        self as i32
    }

    /// Decodes a raw status word. Unknown values force a clean.
    #[inline]
    pub const fn from_raw(raw: i32) -> Self {
        match raw {
            0 => TermStatus::Clean,
            1 => TermStatus::InUse,
            _ => TermStatus::NeedsCleaning,
        }
    }
}

/// Encodes the default data header a publication stamps on every frame.
///
/// Frame length, flags and term offset are filled in per frame by the appender.
pub fn encode_default_header(
    session_id: i32,
    stream_id: i32,
    term_id: i32,
) -> [u8; DATA_HEADER_LENGTH] {
    let mut header = [0u8; DATA_HEADER_LENGTH];
    header[VERSION_FIELD_OFFSET] = CURRENT_VERSION;
    header[FLAGS_FIELD_OFFSET] = UNFRAGMENTED;
    LittleEndian::write_u16(&mut header[TYPE_FIELD_OFFSET..], HDR_TYPE_DATA);
    LittleEndian::write_i32(&mut header[SESSION_ID_FIELD_OFFSET..], session_id);
    LittleEndian::write_i32(&mut header[STREAM_ID_FIELD_OFFSET..], stream_id);
    LittleEndian::write_i32(&mut header[TERM_ID_FIELD_OFFSET..], term_id);
    header
}

/// Rounds `value` up to the next multiple of `alignment` (a power of two).
#[inline]
pub const fn align(value: usize, alignment: usize) -> usize {
    (value + (alignment - 1)) & !(alignment - 1)
}

/// Largest message, fragmented or not, a term of `capacity` bytes accepts.
#[inline]
pub const fn max_message_length(capacity: usize) -> usize {
    capacity / 8
}

/// Validates the capacity of a log region.
pub fn check_term_length(capacity: usize) -> TermResult<()> {
    if capacity < TERM_MIN_LENGTH {
        return Err(TermError::invalid_config(format!(
            "term length {capacity} less than min length {TERM_MIN_LENGTH}"
        )));
    }
    if capacity > TERM_MAX_LENGTH {
        return Err(TermError::invalid_config(format!(
            "term length {capacity} greater than max length {TERM_MAX_LENGTH}"
        )));
    }
    if !capacity.is_power_of_two() {
        return Err(TermError::invalid_config(format!(
            "term length {capacity} not a power of two"
        )));
    }
    if capacity % FRAME_ALIGNMENT != 0 {
        return Err(TermError::invalid_config(format!(
            "term length {capacity} not a multiple of {FRAME_ALIGNMENT}"
        )));
    }
    Ok(())
}

/// Validates the size of a control region.
pub fn check_state_length(length: usize) -> TermResult<()> {
    if length < STATE_BUFFER_LENGTH {
        return Err(TermError::invalid_config(format!(
            "state buffer length {length} less than min length {STATE_BUFFER_LENGTH}"
        )));
    }
    Ok(())
}

/// Validates an MTU against the term it will be used with.
pub fn check_mtu_length(mtu: usize, term_length: usize) -> TermResult<()> {
    if mtu <= DATA_HEADER_LENGTH {
        return Err(TermError::invalid_config(format!(
            "mtu length {mtu} must exceed header length {DATA_HEADER_LENGTH}"
        )));
    }
    if mtu % FRAME_ALIGNMENT != 0 {
        return Err(TermError::invalid_config(format!(
            "mtu length {mtu} not a multiple of {FRAME_ALIGNMENT}"
        )));
    }
    if mtu > max_message_length(term_length) {
        return Err(TermError::invalid_config(format!(
            "mtu length {mtu} exceeds max message length {} for term length {term_length}",
            max_message_length(term_length)
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_counters_do_not_share_cache_lines() {
        assert_eq!(TAIL_COUNTER_OFFSET % CACHE_LINE_LENGTH, 0);
        assert_eq!(HIGH_WATER_MARK_OFFSET % CACHE_LINE_LENGTH, 0);
        assert_eq!(STATUS_OFFSET % CACHE_LINE_LENGTH, 0);
        assert!(STATE_BUFFER_LENGTH >= STATUS_OFFSET + 4);
        assert!(HEADER_TEMPLATE_LENGTH >= DATA_HEADER_LENGTH);
    }

    #[test]
    fn align_rounds_up_to_frame_boundary() {
        assert_eq!(align(0, FRAME_ALIGNMENT), 0);
        assert_eq!(align(1, FRAME_ALIGNMENT), 32);
        assert_eq!(align(32, FRAME_ALIGNMENT), 32);
        assert_eq!(align(132, FRAME_ALIGNMENT), 160);
    }

    #[test]
    fn term_length_must_be_power_of_two_in_range() {
        assert!(check_term_length(64 * 1024).is_ok());
        assert!(check_term_length(16 * 1024 * 1024).is_ok());
        assert!(matches!(
            check_term_length(96 * 1024),
            Err(TermError::InvalidConfig(msg)) if msg.contains("power of two")
        ));
        assert!(check_term_length(32 * 1024).is_err());
        assert!(check_term_length(2 * TERM_MAX_LENGTH).is_err());
    }

    #[test]
    fn state_length_must_cover_control_region() {
        assert!(check_state_length(STATE_BUFFER_LENGTH).is_ok());
        assert!(check_state_length(STATE_BUFFER_LENGTH - 1).is_err());
    }

    #[test]
    fn mtu_checks() {
        assert!(check_mtu_length(4096, 64 * 1024).is_ok());
        assert!(check_mtu_length(DATA_HEADER_LENGTH, 64 * 1024).is_err());
        assert!(check_mtu_length(4100, 64 * 1024).is_err());
        assert!(check_mtu_length(16 * 1024, 64 * 1024).is_err());
    }

    #[test]
    fn default_header_layout() {
        let header = encode_default_header(0x0102_0304, 42, -7);
        assert_eq!(LittleEndian::read_i32(&header[FRAME_LENGTH_FIELD_OFFSET..]), 0);
        assert_eq!(header[FLAGS_FIELD_OFFSET], UNFRAGMENTED);
        assert_eq!(LittleEndian::read_u16(&header[TYPE_FIELD_OFFSET..]), HDR_TYPE_DATA);
        assert_eq!(
            &header[SESSION_ID_FIELD_OFFSET..SESSION_ID_FIELD_OFFSET + 4],
            &[4, 3, 2, 1]
        );
        assert_eq!(LittleEndian::read_i32(&header[STREAM_ID_FIELD_OFFSET..]), 42);
        assert_eq!(LittleEndian::read_i32(&header[TERM_ID_FIELD_OFFSET..]), -7);
        assert_eq!(LittleEndian::read_i64(&header[RESERVED_VALUE_FIELD_OFFSET..]), 0);
    }

    #[test]
    fn status_round_trip() {
        for status in [
            TermStatus::Clean,
            TermStatus::InUse,
            TermStatus::NeedsCleaning,
        ] {
            assert_eq!(TermStatus::from_raw(status.as_raw()), status);
        }
        assert_eq!(TermStatus::from_raw(77), TermStatus::NeedsCleaning);
    }
}
