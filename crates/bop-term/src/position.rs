//! Mapping between the unbounded logical stream and the three physical terms.
//!
//! A position packs the number of terms since `initial_term_id` into the high bits
//! and the offset inside the term into the low `position_bits_to_shift` bits:
//!
//! ```text
//! | terms since initial term id | term offset              |
//! |-----------------------------|--------------------------|
//! | 64 - shift bits             | shift = log2(capacity)   |
//! ```

/// Number of terms a publication rotates through.
pub const TERM_COUNT: usize = 3;

/// Index of the term buffer holding `term_id`.
#[inline]
pub fn buffer_index(initial_term_id: i32, term_id: i32) -> usize {
    i64::from(term_id.wrapping_sub(initial_term_id)).rem_euclid(TERM_COUNT as i64) as usize
}

/// Index of the buffer that becomes active after `index`.
#[inline]
pub const fn rotate_next(index: usize) -> usize {
    (index + 1) % TERM_COUNT
}

/// Index of the buffer two terms behind `index` (equivalently one ahead of next).
#[inline]
pub const fn rotate_previous(index: usize) -> usize {
    (index + 2) % TERM_COUNT
}

/// Shift converting a term count into a position, `log2(capacity)`.
#[inline]
pub const fn position_bits_to_shift(term_capacity: usize) -> u32 {
    term_capacity.trailing_zeros()
}

/// Logical position of `term_offset` within `term_id`.
#[inline]
pub fn calculate_position(
    term_id: i32,
    term_offset: i32,
    position_bits_to_shift: u32,
    initial_term_id: i32,
) -> i64 {
    let term_count = i64::from(term_id.wrapping_sub(initial_term_id));
    (term_count << position_bits_to_shift) + i64::from(term_offset)
}

/// Term id containing `position`.
#[inline]
pub fn term_id_for_position(
    position: i64,
    position_bits_to_shift: u32,
    initial_term_id: i32,
) -> i32 {
    ((position >> position_bits_to_shift) as i32).wrapping_add(initial_term_id)
}

/// Offset inside its term of `position`.
#[inline]
pub fn term_offset_for_position(position: i64, position_bits_to_shift: u32) -> i32 {
    let mask = (1_i64 << position_bits_to_shift) - 1;
    (position & mask) as i32
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn buffer_index_starts_at_zero_for_initial_term() {
        assert_eq!(buffer_index(7, 7), 0);
        assert_eq!(buffer_index(7, 8), 1);
        assert_eq!(buffer_index(7, 9), 2);
        assert_eq!(buffer_index(7, 10), 0);
    }

    #[test]
    fn buffer_index_handles_term_id_wrap() {
        let initial = i32::MAX - 1;
        assert_eq!(buffer_index(initial, initial), 0);
        assert_eq!(buffer_index(initial, i32::MAX), 1);
        assert_eq!(buffer_index(initial, i32::MIN), 2);
        assert_eq!(buffer_index(initial, i32::MIN + 1), 0);
    }

    #[test]
    fn rotation_helpers_form_a_ring() {
        for index in 0..TERM_COUNT {
            assert_eq!(rotate_next(rotate_previous(index)), index);
            assert_eq!(rotate_previous(rotate_next(index)), index);
            assert_eq!(rotate_previous(index), rotate_next(rotate_next(index)));
            assert_ne!(rotate_next(index), index);
            assert_ne!(rotate_previous(index), index);
        }
    }

    #[test]
    fn position_of_limit_scenario() {
        let shift = position_bits_to_shift(65_536);
        assert_eq!(shift, 16);
        assert_eq!(calculate_position(7, 1000, shift, 7), 1000);
        assert_eq!(calculate_position(8, 0, shift, 7), 65_536);
        assert_eq!(calculate_position(9, 32, shift, 7), 2 * 65_536 + 32);
    }

    proptest! {
        #[test]
        fn buffer_index_cycles_with_period_three(
            initial in any::<i32>(),
            start in 0i32..1_000_000,
            run in 1usize..64,
        ) {
            let mut seen = [0usize; TERM_COUNT];
            for step in 0..run {
                let term_id = initial.wrapping_add(start).wrapping_add(step as i32);
                let index = buffer_index(initial, term_id);
                prop_assert!(index < TERM_COUNT);
                let following = buffer_index(initial, term_id.wrapping_add(1));
                prop_assert_eq!(following, rotate_next(index));
                prop_assert_eq!(buffer_index(initial, term_id.wrapping_add(3)), index);
                seen[index] += 1;
            }
            if run >= TERM_COUNT {
                prop_assert!(seen.iter().all(|count| *count > 0));
            }
        }

        #[test]
        fn position_decodes_to_term_and_offset(
            initial in any::<i32>(),
            terms in 0i32..100_000,
            shift in 16u32..31,
            offset_seed in any::<u32>(),
        ) {
            let capacity = 1_i64 << shift;
            let offset = (i64::from(offset_seed) % capacity) as i32;
            let term_id = initial.wrapping_add(terms);
            let position = calculate_position(term_id, offset, shift, initial);
            prop_assert!(position >= 0);
            prop_assert_eq!(term_id_for_position(position, shift, initial), term_id);
            prop_assert_eq!(term_offset_for_position(position, shift), offset);
        }

        #[test]
        fn position_is_monotonic_across_terms(
            initial in any::<i32>(),
            terms in 0i32..100_000,
            a in 0i32..65_536,
            b in 0i32..65_536,
        ) {
            let shift = 16;
            let term_id = initial.wrapping_add(terms);
            let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
            let low = calculate_position(term_id, lo, shift, initial);
            let high = calculate_position(term_id, hi, shift, initial);
            let next_term = calculate_position(term_id.wrapping_add(1), 0, shift, initial);
            prop_assert!(low <= high);
            prop_assert!(high < next_term);
        }
    }
}
