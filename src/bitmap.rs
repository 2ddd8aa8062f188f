//! Two-level priority bit map with O(1) highest-priority lookup.
//!
//! One 16-bit major word has a bit per group of sixteen priorities; one
//! 16-bit minor word per group has a bit per priority. A set bit mirrors a
//! non-empty ready chain at that priority. Lookup finds the first set bit of
//! the major word, then of the selected minor word, and combines the two
//! into a priority index. Not internally synchronized.

use core::fmt;

use crate::Priority;

/// Number of distinct priority levels the bit map can mirror.
pub const PRIORITY_LEVELS: usize = 256;

const GROUPS: usize = 16;
const GROUP_SHIFT: u32 = 4;
const GROUP_MASK: usize = 0xf;

const_assert_eq!(PRIORITY_LEVELS, GROUPS * GROUPS);

/// Precomputed major/minor indices and masks for one priority level.
///
/// Computed once whenever a thread's priority changes, so `add`/`remove` on
/// the hot path shift no bits.
#[derive(Clone, Copy, Debug)]
pub struct BitmapInfo {
    group: usize,
    major_mask: u16,
    minor_mask: u16,
}

impl BitmapInfo {
    pub fn new(priority: Priority) -> BitmapInfo {
        let group = priority as usize >> GROUP_SHIFT;
        BitmapInfo {
            group,
            major_mask: 1 << group,
            minor_mask: 1 << (priority as usize & GROUP_MASK),
        }
    }
}

impl Default for BitmapInfo {
    fn default() -> Self {
        BitmapInfo::new(0)
    }
}

/// The two-level bit map itself.
pub struct PriorityBitmap {
    major: u16,
    minor: [u16; GROUPS],
}

impl PriorityBitmap {
    pub const fn new() -> PriorityBitmap {
        PriorityBitmap {
            major: 0,
            minor: [0; GROUPS],
        }
    }

    /// Marks the priority described by `info` as ready.
    ///
    /// The first entry of a minor group also sets the group's major bit.
    pub fn add(&mut self, info: &BitmapInfo) {
        self.minor[info.group] |= info.minor_mask;
        self.major |= info.major_mask;
    }

    /// Clears the priority described by `info`.
    ///
    /// Removing the last entry of a minor group also clears the major bit.
    pub fn remove(&mut self, info: &BitmapInfo) {
        self.minor[info.group] &= !info.minor_mask;
        if self.minor[info.group] == 0 {
            self.major &= !info.major_mask;
        }
    }

    pub fn is_empty(&self) -> bool {
        self.major == 0
    }

    /// The numerically lowest currently-added priority, if any.
    pub fn get_highest(&self) -> Option<Priority> {
        if self.major == 0 {
            return None;
        }
        let group = first_set(self.major);
        let minor = first_set(self.minor[group]);
        Some(((group << GROUP_SHIFT) | minor) as Priority)
    }
}

impl Default for PriorityBitmap {
    fn default() -> Self {
        PriorityBitmap::new()
    }
}

impl fmt::Debug for PriorityBitmap {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "PriorityBitmap {{ major={:#06x} }}", self.major)
    }
}

/// Index of the first (least significant) set bit of a non-zero word.
#[cfg(not(feature = "soft-ffs"))]
#[inline]
fn first_set(word: u16) -> usize {
    debug_assert!(word != 0);
    word.trailing_zeros() as usize
}

/// Lookup-table find-first-set for targets without a count-zeros
/// instruction: two 8-bit table probes resolve a 16-bit word.
#[cfg(feature = "soft-ffs")]
#[inline]
fn first_set(word: u16) -> usize {
    const TABLE: [u8; 256] = build_first_set_table();
    debug_assert!(word != 0);
    let low = word as u8;
    if low != 0 {
        TABLE[low as usize] as usize
    } else {
        8 + TABLE[(word >> 8) as usize] as usize
    }
}

#[cfg(feature = "soft-ffs")]
const fn build_first_set_table() -> [u8; 256] {
    let mut table = [0u8; 256];
    let mut value = 1usize;
    while value < 256 {
        let mut bit = 0u8;
        while value & (1 << bit) == 0 {
            bit += 1;
        }
        table[value] = bit;
        value += 1;
    }
    table
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_map_has_no_highest() {
        let map = PriorityBitmap::new();
        assert!(map.is_empty());
        assert_eq!(map.get_highest(), None);
    }

    #[test]
    fn highest_is_numerically_lowest() {
        let mut map = PriorityBitmap::new();
        for p in [200u8, 17, 3, 17, 255] {
            map.add(&BitmapInfo::new(p));
        }
        assert_eq!(map.get_highest(), Some(3));

        map.remove(&BitmapInfo::new(3));
        assert_eq!(map.get_highest(), Some(17));
    }

    #[test]
    fn removing_last_of_group_clears_major_bit() {
        let mut map = PriorityBitmap::new();
        let a = BitmapInfo::new(0x42); // group 4
        let b = BitmapInfo::new(0x4f); // group 4
        map.add(&a);
        map.add(&b);
        map.remove(&a);
        assert_eq!(map.get_highest(), Some(0x4f));
        map.remove(&b);
        assert!(map.is_empty());
        assert_eq!(map.get_highest(), None);
    }

    /// For random add/remove sequences, `get_highest` tracks the minimum of
    /// the multiset of added priorities and `is_empty` matches exactly.
    #[test]
    fn tracks_reference_model() {
        let mut map = PriorityBitmap::new();
        let mut model: Vec<u8> = Vec::new();

        // Deterministic pseudo-random walk.
        let mut state = 0x2545_f491u32;
        for _ in 0..10_000 {
            state = state.wrapping_mul(1_103_515_245).wrapping_add(12_345);
            let p = (state >> 16) as u8;
            if state & 1 == 0 || model.is_empty() {
                // The bit map mirrors chain emptiness, one bit per level.
                if !model.contains(&p) {
                    map.add(&BitmapInfo::new(p));
                    model.push(p);
                }
            } else {
                let victim = model.swap_remove((state as usize >> 8) % model.len());
                map.remove(&BitmapInfo::new(victim));
            }
            assert_eq!(map.get_highest(), model.iter().min().copied());
            assert_eq!(map.is_empty(), model.is_empty());
        }
    }
}
