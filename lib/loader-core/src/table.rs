// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The device allocation table.
//!
//! A bounded array of `{address, size, live}` records covering every region
//! the loader has handed to the host. Write, read, and execute requests are
//! checked against it before any memory is touched, so a bad address comes
//! back as a protocol error instead of a bus fault.
//!
//! The table does not merge or split records; range arithmetic is the
//! underlying allocator's business. Lookup is a linear probe — the table is
//! 64 entries and the probe runs between serial frames, so nothing fancier
//! is warranted.

/// Capacity of the table. Exhaustion refuses further allocations even if
/// the underlying allocator still has space.
pub const MAX_ALLOCATIONS: usize = 64;

#[derive(Copy, Clone, Debug, Default)]
struct Record {
    address: u32,
    size: u32,
    live: bool,
}

/// Error returned when every slot is live.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct TableFull;

#[derive(Debug)]
pub struct AllocTable {
    records: [Record; MAX_ALLOCATIONS],
}

impl Default for AllocTable {
    fn default() -> Self {
        Self::new()
    }
}

impl AllocTable {
    pub const fn new() -> Self {
        Self {
            records: [Record {
                address: 0,
                size: 0,
                live: false,
            }; MAX_ALLOCATIONS],
        }
    }

    /// Records a new live region. The caller has already obtained the
    /// memory from the allocator, which guarantees live ranges don't
    /// overlap.
    pub fn insert(&mut self, address: u32, size: u32) -> Result<(), TableFull> {
        for r in &mut self.records {
            if !r.live {
                *r = Record {
                    address,
                    size,
                    live: true,
                };
                return Ok(());
            }
        }
        Err(TableFull)
    }

    /// Retires the record whose base address is exactly `address`. Returns
    /// false if no live record matches.
    pub fn remove(&mut self, address: u32) -> bool {
        for r in &mut self.records {
            if r.live && r.address == address {
                r.live = false;
                return true;
            }
        }
        false
    }

    /// True if `address` is the base of a live region. Used by free and by
    /// the host-side mirror checks.
    pub fn contains_exact(&self, address: u32) -> bool {
        self.records
            .iter()
            .any(|r| r.live && r.address == address)
    }

    /// True if `[address, address + size)` lies entirely inside one live
    /// region. Returns false on 32-bit overflow of the query range.
    pub fn range_fits(&self, address: u32, size: u32) -> bool {
        let Some(end) = address.checked_add(size) else {
            return false;
        };
        self.records.iter().any(|r| {
            // Record end in 64-bit space: a region may butt up against the
            // top of the address space.
            let r_end = u64::from(r.address) + u64::from(r.size);
            r.live && address >= r.address && u64::from(end) <= r_end
        })
    }

    pub fn live_count(&self) -> usize {
        self.records.iter().filter(|r| r.live).count()
    }

    /// Live `(address, size)` pairs, in slot order.
    pub fn iter_live(&self) -> impl Iterator<Item = (u32, u32)> + '_ {
        self.records
            .iter()
            .filter(|r| r.live)
            .map(|r| (r.address, r.size))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_remove_lifecycle() {
        let mut t = AllocTable::new();
        t.insert(0x4000_0000, 64).unwrap();
        assert!(t.contains_exact(0x4000_0000));
        assert_eq!(t.live_count(), 1);

        assert!(t.remove(0x4000_0000));
        assert!(!t.contains_exact(0x4000_0000));
        assert_eq!(t.live_count(), 0);

        // Double free is a no-op reported to the caller.
        assert!(!t.remove(0x4000_0000));
    }

    #[test]
    fn slots_are_reused_after_free() {
        let mut t = AllocTable::new();
        for i in 0..MAX_ALLOCATIONS as u32 {
            t.insert(0x1000 * i, 16).unwrap();
        }
        assert_eq!(t.insert(0xdead_0000, 16), Err(TableFull));

        assert!(t.remove(0x3000));
        t.insert(0xdead_0000, 16).unwrap();
        assert!(t.contains_exact(0xdead_0000));
    }

    #[test]
    fn range_fits_is_exact() {
        let mut t = AllocTable::new();
        t.insert(0x100, 0x40).unwrap();

        assert!(t.range_fits(0x100, 0x40));
        assert!(t.range_fits(0x100, 1));
        assert!(t.range_fits(0x13F, 1));
        assert!(t.range_fits(0x120, 0x20));

        assert!(!t.range_fits(0x100, 0x41));
        assert!(!t.range_fits(0xFF, 2));
        assert!(!t.range_fits(0x140, 1));
        assert!(!t.range_fits(0x0, 1));
    }

    #[test]
    fn range_fits_rejects_wraparound() {
        let mut t = AllocTable::new();
        t.insert(0xFFFF_FF00, 0x100).unwrap();

        assert!(t.range_fits(0xFFFF_FF00, 0x100));
        assert!(t.range_fits(0xFFFF_FFFF, 1));
        // addr + size wraps past zero.
        assert!(!t.range_fits(0xFFFF_FFFF, 2));
        assert!(!t.range_fits(0xFFFF_FF00, 0x101));
    }

    #[test]
    fn freed_records_do_not_satisfy_lookups() {
        let mut t = AllocTable::new();
        t.insert(0x2000, 0x80).unwrap();
        assert!(t.range_fits(0x2000, 0x80));
        t.remove(0x2000);
        assert!(!t.range_fits(0x2000, 1));
        assert!(!t.contains_exact(0x2000));
    }
}
