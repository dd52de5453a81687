/// Round up `n` to the nearest multiple of `to`
pub fn round_up(n: usize, to: usize) -> usize {
    to * ((n + to - 1) / to)
}

/// Round down `n` to the nearest multiple of `to`
pub fn round_down(n: usize, to: usize) -> usize {
    to * (n / to)
}

/// Align `n` up to `align`, which must be a power of two
pub const fn align_up(n: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    (n + align - 1) & !(align - 1)
}

/// Align `n` down to `align`, which must be a power of two
pub const fn align_down(n: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    n & !(align - 1)
}

/// The 64-bit finalizer from MurmurHash3. Every input bit affects every output
/// bit, which is what we want for pointers (low bits are mostly zero).
pub const fn fmix64(mut k: u64) -> u64 {
    k ^= k >> 33;
    k = k.wrapping_mul(0xff51_afd7_ed55_8ccd);
    k ^= k >> 33;
    k = k.wrapping_mul(0xc4ce_b9fe_1a85_ec53);
    k ^= k >> 33;
    k
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    pub fn rounding_computes_correctly() {
        assert_eq!(round_up(9, 4), 12);
        assert_eq!(round_up(8, 4), 8);
        assert_eq!(round_up(0, 4096), 0);
        assert_eq!(round_down(4097, 4096), 4096);
        assert_eq!(align_up(17, 16), 32);
        assert_eq!(align_up(32, 16), 32);
        assert_eq!(align_down(4095, 2048), 2048);
    }

    #[test]
    pub fn fmix64_spreads_page_aligned_pointers() {
        let buckets: std::collections::HashSet<u64> = (0..64u64)
            .map(|i| fmix64(0x7f00_0000_0000 + i * 4096) % 1024)
            .collect();
        // 64 page-aligned addresses should land in many distinct buckets
        assert!(buckets.len() > 48);
        assert_eq!(fmix64(0), 0);
    }
}
