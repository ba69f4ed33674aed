use std::fmt;

/// A key type for [`TableOfTables`](super::TableOfTables), fixing how the key
/// is split into a main table index and a child table index.
pub trait TableKey: Copy + fmt::Debug {
    /// Bits of the key indexing a child table. The main table is indexed by
    /// the next `TABLE_BITS` bits, and anything above that must be zero.
    const TABLE_BITS: u32;

    /// Size of the filled memfd that is tiled over every table. Bigger regions
    /// mean fewer mappings, and Linux caps those (`vm.max_map_count`).
    const MEMFD_REGION_SIZE: usize;

    fn to_u64(self) -> u64;
}

/// 32-bit guest addresses: 2^16 child tables of 2^16 slots.
impl TableKey for u32 {
    const TABLE_BITS: u32 = 16;
    const MEMFD_REGION_SIZE: usize = 1 << 16;

    fn to_u64(self) -> u64 {
        self as u64
    }
}

/// 64-bit guest addresses. Only 48 bits of address are in use, which splits
/// into 2^24 child tables of 2^24 slots.
#[cfg(target_pointer_width = "64")]
impl TableKey for u64 {
    const TABLE_BITS: u32 = 24;
    const MEMFD_REGION_SIZE: usize = 1 << 24;

    fn to_u64(self) -> u64 {
        self
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct SplitKey {
    pub(crate) high: usize,
    pub(crate) low: usize,
}

impl SplitKey {
    /// # Panics
    ///
    /// - If `key` has bits set above `2 * K::TABLE_BITS`
    pub(crate) fn new<K: TableKey>(key: K) -> Self {
        let bits = key.to_u64();
        let mask = (1u64 << K::TABLE_BITS) - 1;
        let high = bits >> K::TABLE_BITS;
        assert!(
            high & !mask == 0,
            "key {bits:#x} does not fit in {} bits",
            2 * K::TABLE_BITS
        );
        Self {
            high: high as usize,
            low: (bits & mask) as usize,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn u32_keys_split_in_half() {
        assert_eq!(SplitKey::new(25u32), SplitKey { high: 0, low: 25 });
        assert_eq!(
            SplitKey::new((25u32 << 16) | 255),
            SplitKey { high: 25, low: 255 }
        );
        assert_eq!(
            SplitKey::new(u32::MAX),
            SplitKey {
                high: 0xffff,
                low: 0xffff
            }
        );
    }

    #[test]
    #[cfg(target_pointer_width = "64")]
    fn u64_keys_use_48_bits() {
        assert_eq!(
            SplitKey::new(0x0000_1234_5678_9abcu64),
            SplitKey {
                high: 0x12_3456,
                low: 0x78_9abc
            }
        );
    }

    #[test]
    #[cfg(target_pointer_width = "64")]
    #[should_panic(expected = "does not fit in 48 bits")]
    fn u64_keys_with_top_bits_panic() {
        SplitKey::new(0xdead_beef_1234_5678u64);
    }
}
