/// `log2(n)` for a power of two `n`
pub const fn log2(n: usize) -> u32 {
    debug_assert!(n.is_power_of_two());
    n.trailing_zeros()
}

/// Round up `n` to the nearest multiple of `to`, which must be a power of two
pub const fn align_up(n: usize, to: usize) -> usize {
    debug_assert!(to.is_power_of_two());
    (n + to - 1) & !(to - 1)
}

/// Round down `n` to the nearest multiple of `to`, which must be a power of two
pub const fn align_down(n: usize, to: usize) -> usize {
    debug_assert!(to.is_power_of_two());
    n & !(to - 1)
}

/// Test if `n` is a multiple of `align`
pub const fn is_aligned(n: usize, align: usize) -> bool {
    n & (align - 1) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    pub fn log2_computes_correctly() {
        assert_eq!(log2(1), 0);
        assert_eq!(log2(8), 3);
        assert_eq!(log2(4096), 12);
    }

    #[test]
    fn align_rounds_both_ways() {
        assert_eq!(align_up(13, 4), 16);
        assert_eq!(align_up(16, 16), 16);
        assert_eq!(align_up(0, 4096), 0);
        assert_eq!(align_down(4097, 4096), 4096);
        assert_eq!(align_down(4095, 4096), 0);
        assert!(is_aligned(0x2000, 0x1000));
        assert!(!is_aligned(0x2008, 16));
    }
}
