//! Address decoder: maps a flat 64-bit global address into
//! `(kind, instance, local offset)` by binary search over a sorted,
//! disjoint region table.

use crate::error::DecodeError;
use crate::types::{Address, MemoryKind, Size};

/// One mapped region of the global address space.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Region {
    pub base: Address,
    pub size: Size,
    pub kind: MemoryKind,
    pub instance_id: u32,
    pub label: String,
}

impl Region {
    fn end(&self) -> Address {
        self.base + self.size
    }
}

/// The result of a successful decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Route {
    pub kind: MemoryKind,
    pub instance_id: u32,
    pub offset: Address,
}

/// Sorted, disjoint set of address regions.
#[derive(Debug, Default, Clone)]
pub struct AddressDecoder {
    regions: Vec<Region>,
}

impl AddressDecoder {
    pub fn new() -> Self {
        Self {
            regions: Vec::new(),
        }
    }

    /// Registers a new region. Fails if the size is zero or the new range
    /// overlaps any existing region. O(log n) insertion point search, O(n)
    /// shift (regions are kept sorted by base for binary-search lookup).
    pub fn add_region(
        &mut self,
        base: Address,
        size: Size,
        kind: MemoryKind,
        instance_id: u32,
        label: impl Into<String>,
    ) -> Result<(), DecodeError> {
        if size == 0 {
            return Err(DecodeError::ZeroSizeRegion);
        }
        let end = base + size;
        let insert_at = self.regions.partition_point(|r| r.base < base);

        if let Some(prev) = insert_at.checked_sub(1).and_then(|i| self.regions.get(i)) {
            if prev.end() > base {
                return Err(DecodeError::Overlap {
                    base,
                    end,
                    other_base: prev.base,
                    other_end: prev.end(),
                });
            }
        }
        if let Some(next) = self.regions.get(insert_at) {
            if next.base < end {
                return Err(DecodeError::Overlap {
                    base,
                    end,
                    other_base: next.base,
                    other_end: next.end(),
                });
            }
        }

        self.regions.insert(
            insert_at,
            Region {
                base,
                size,
                kind,
                instance_id,
                label: label.into(),
            },
        );
        Ok(())
    }

    fn region_for(&self, addr: Address) -> Option<&Region> {
        let idx = self.regions.partition_point(|r| r.base <= addr);
        if idx == 0 {
            return None;
        }
        let region = &self.regions[idx - 1];
        if addr < region.end() {
            Some(region)
        } else {
            None
        }
    }

    /// Decodes a single address.
    pub fn decode(&self, addr: Address) -> Result<Route, DecodeError> {
        self.region_for(addr)
            .map(|r| Route {
                kind: r.kind,
                instance_id: r.instance_id,
                offset: addr - r.base,
            })
            .ok_or(DecodeError::Unmapped(addr))
    }

    /// Decodes a range, requiring that the entire `[addr, addr+size)` span
    /// lies within a single region.
    pub fn decode_range(&self, addr: Address, size: Size) -> Result<Route, DecodeError> {
        let region = self.region_for(addr).ok_or(DecodeError::Unmapped(addr))?;
        if addr + size > region.end() {
            return Err(DecodeError::CrossesRegion(addr, size));
        }
        Ok(Route {
            kind: region.kind,
            instance_id: region.instance_id,
            offset: addr - region.base,
        })
    }

    /// Finds the global base address of a given `(kind, instance_id)`
    /// region, used by the legacy `(kind, id, offset)` DMA entry point.
    pub fn base_of(&self, kind: MemoryKind, instance_id: u32) -> Option<Address> {
        self.regions
            .iter()
            .find(|r| r.kind == kind && r.instance_id == instance_id)
            .map(|r| r.base)
    }

    /// True if `[addr, addr+size)` decodes to a single region.
    pub fn is_valid_range(&self, addr: Address, size: Size) -> bool {
        self.decode_range(addr, size).is_ok()
    }

    /// Read-only enumeration of all regions, in base order, for diagnostics.
    pub fn regions(&self) -> &[Region] {
        &self.regions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_round_trip() {
        let mut dec = AddressDecoder::new();
        dec.add_region(0x1000, 0x1000, MemoryKind::External, 0, "ext0")
            .unwrap();
        let route = dec.decode(0x1000 + 0x42).unwrap();
        assert_eq!(route.kind, MemoryKind::External);
        assert_eq!(route.instance_id, 0);
        assert_eq!(route.offset, 0x42);
    }

    #[test]
    fn rejects_overlap() {
        let mut dec = AddressDecoder::new();
        dec.add_region(0x0, 0x100, MemoryKind::L3Tile, 0, "a").unwrap();
        let err = dec
            .add_region(0x80, 0x100, MemoryKind::L3Tile, 1, "b")
            .unwrap_err();
        assert!(matches!(err, DecodeError::Overlap { .. }));
    }

    #[test]
    fn rejects_zero_size() {
        let mut dec = AddressDecoder::new();
        let err = dec
            .add_region(0x0, 0, MemoryKind::L3Tile, 0, "a")
            .unwrap_err();
        assert_eq!(err, DecodeError::ZeroSizeRegion);
    }

    #[test]
    fn unmapped_address_fails() {
        let mut dec = AddressDecoder::new();
        dec.add_region(0x1000, 0x100, MemoryKind::L2Bank, 0, "b")
            .unwrap();
        assert_eq!(dec.decode(0x500), Err(DecodeError::Unmapped(0x500)));
        assert_eq!(dec.decode(0x2000), Err(DecodeError::Unmapped(0x2000)));
    }

    #[test]
    fn cross_region_range_fails() {
        let mut dec = AddressDecoder::new();
        dec.add_region(0x0, 0x100, MemoryKind::L2Bank, 0, "a")
            .unwrap();
        dec.add_region(0x100, 0x100, MemoryKind::L2Bank, 1, "b")
            .unwrap();
        assert!(matches!(
            dec.decode_range(0x90, 0x20),
            Err(DecodeError::CrossesRegion(_, _))
        ));
    }

    #[test]
    fn stress_thousand_regions() {
        let mut dec = AddressDecoder::new();
        let mut bases = Vec::new();
        let mut cursor: Address = 0;
        // deterministic pseudo-random spacing via a simple LCG, avoids a
        // rand dependency for a one-off test.
        let mut state: u64 = 0x243F6A8885A308D3;
        for i in 0..1000u32 {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1);
            let gap = 4096 + (state >> 40) % 4096;
            cursor += gap;
            dec.add_region(cursor, 4096, MemoryKind::External, i, format!("r{i}"))
                .unwrap();
            bases.push(cursor);
        }
        for &base in &bases {
            let mid = base + 2048;
            let route = dec.decode(mid).unwrap();
            assert_eq!(route.offset, 2048);
        }
        assert!(dec.decode(bases[0] - 1).is_err());
    }
}
