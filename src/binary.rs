//! Binary step encoding
//!
//! Every approval step is assigned a small sequential index by configuration
//! ordering. At runtime a step is represented by the single bit `1 << index`,
//! an event's progress (`step`) is the OR of all satisfied bits, and its
//! completion mask (`target`) is the OR of all required bits.

/// Highest step index a single approval may carry. Progress masks are `u64`,
/// so a configured flow is limited to 64 steps.
pub const MAX_STEP_INDEX: u8 = 63;

/// Convert a configuration step index into its runtime bit.
pub fn bit(step_index: u8) -> u64 {
    1u64 << step_index
}

/// True when every bit required by `target` is set in `step`.
pub fn is_complete(step: u64, target: u64) -> bool {
    (step & target) == target
}

/// True when none of the bits in `mask` are set in `step`. Used to find the
/// first not-yet-satisfied component when scanning in ascending bit order.
pub fn is_pending(step: u64, mask: u64) -> bool {
    (step & mask) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bit_shifts_sequential_indices() {
        assert_eq!(bit(0), 1);
        assert_eq!(bit(1), 2);
        assert_eq!(bit(2), 4);
        assert_eq!(bit(MAX_STEP_INDEX), 1 << 63);
    }

    #[test]
    fn completion_requires_full_target() {
        let target = bit(0) | bit(1) | bit(2);

        assert!(!is_complete(0, target));
        assert!(!is_complete(bit(0) | bit(2), target));
        assert!(is_complete(target, target));
        // extra bits beyond target do not break completion
        assert!(is_complete(target | bit(5), target));
    }

    #[test]
    fn zero_target_is_always_complete() {
        assert!(is_complete(0, 0));
        assert!(is_complete(bit(3), 0));
    }

    #[test]
    fn pending_checks_single_bits() {
        let step = bit(0) | bit(2);

        assert!(!is_pending(step, bit(0)));
        assert!(is_pending(step, bit(1)));
        assert!(!is_pending(step, bit(2)));
    }
}
