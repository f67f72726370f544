/// Sequence numbers cycle on a 14-bit ring: two septet header characters
/// carry them on the wire.
pub const SEQUENCE_MODULUS: u16 = 16384;

const HALF_RING: u16 = SEQUENCE_MODULUS / 2;

/// Returns whether or not a wrapping sequence number is greater than another.
/// sequence_greater_than(2,1) will return true
/// sequence_greater_than(1,2) will return false
/// sequence_greater_than(1,1) will return false
pub fn sequence_greater_than(s1: u16, s2: u16) -> bool {
    ((s1 > s2) && (s1 - s2 <= HALF_RING)) || ((s1 < s2) && (s2 - s1 > HALF_RING))
}

/// Returns whether or not a wrapping sequence number is less than another.
/// sequence_less_than(1,2) will return true
/// sequence_less_than(2,1) will return false
/// sequence_less_than(1,1) will return false
pub fn sequence_less_than(s1: u16, s2: u16) -> bool {
    sequence_greater_than(s2, s1)
}

/// Advances a sequence number one step around the ring.
pub fn sequence_advance(s: u16) -> u16 {
    (s + 1) % SEQUENCE_MODULUS
}

#[cfg(test)]
mod sequence_compare_tests {
    use super::{sequence_advance, sequence_greater_than, sequence_less_than, SEQUENCE_MODULUS};

    #[test]
    fn greater_is_greater() {
        assert!(sequence_greater_than(2, 1));
    }

    #[test]
    fn greater_is_not_equal() {
        assert!(!sequence_greater_than(2, 2));
    }

    #[test]
    fn greater_is_not_less() {
        assert!(!sequence_greater_than(1, 2));
    }

    #[test]
    fn less_is_less() {
        assert!(sequence_less_than(1, 2));
    }

    #[test]
    fn less_is_not_equal() {
        assert!(!sequence_less_than(2, 2));
    }

    #[test]
    fn less_is_not_greater() {
        assert!(!sequence_less_than(2, 1));
    }

    #[test]
    fn greater_across_wrap() {
        let near_top = SEQUENCE_MODULUS - 1;
        assert!(sequence_greater_than(1, near_top));
        assert!(sequence_less_than(near_top, 1));
    }

    #[test]
    fn advance_wraps_at_modulus() {
        assert_eq!(sequence_advance(SEQUENCE_MODULUS - 1), 0);
        assert_eq!(sequence_advance(5), 6);
    }
}
