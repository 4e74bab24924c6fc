//! Resource-handle surface exposed to external callers (§6): a uniform
//! `(kind, id, base_address, capacity)` handle plus a manager façade that
//! routes `read`/`write`/`allocate` calls through the decoder to the right
//! buffer and allocator.

use std::collections::HashMap;

use crate::decoder::AddressDecoder;
use crate::error::{AllocError, DecodeError};
use crate::memory::allocator::{Allocator, BumpAllocator, NULL_ADDRESS};
use crate::memory::buffer::{Buffer, BufferBank};
use crate::types::{Address, ComponentType, Size};

/// A resource handle. Equality is `(kind, id)` only — base/capacity are
/// cached metadata, not identity.
#[derive(Debug, Clone, Copy)]
pub struct ResourceHandle {
    pub kind: ComponentType,
    pub id: u32,
    pub base_address: Address,
    pub capacity: Size,
}

impl PartialEq for ResourceHandle {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind && self.id == other.id
    }
}
impl Eq for ResourceHandle {}

impl ResourceHandle {
    pub fn is_memory(&self) -> bool {
        self.kind.is_memory()
    }
    pub fn is_compute(&self) -> bool {
        self.kind.is_compute()
    }
    pub fn is_data_movement(&self) -> bool {
        self.kind.is_data_movement()
    }
}

/// Cumulative statistics exposed by `get_system_stats` (a supplemental
/// feature pulled from `original_source/include/sw/kpu/resource_stats.hpp`,
/// not spelled out in spec.md's component design body).
#[derive(Debug, Default, Clone, PartialEq)]
pub struct SystemStats {
    pub total_bytes_moved: u64,
    pub total_allocations: u64,
    pub peak_bytes_allocated: u64,
    pub per_kind_busy_cycles: HashMap<ComponentType, u64>,
}

/// One state snapshot for `get_state`.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceState {
    pub ready: bool,
    pub last_access_cycle: u64,
    pub bytes_in_use: Size,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct Key(ComponentType, u32);

/// Owns every buffer bank and an allocator per memory resource; routes
/// address-based operations through the shared decoder.
#[derive(Default)]
pub struct ResourceManager {
    decoder: AddressDecoder,
    banks: HashMap<ComponentType, BufferBank>,
    allocators: HashMap<Key, Box<dyn Allocator>>,
    stats: SystemStats,
}

impl ResourceManager {
    pub fn new(decoder: AddressDecoder) -> Self {
        Self {
            decoder,
            banks: HashMap::new(),
            allocators: HashMap::new(),
            stats: SystemStats::default(),
        }
    }

    pub fn decoder(&self) -> &AddressDecoder {
        &self.decoder
    }

    pub fn decoder_mut(&mut self) -> &mut AddressDecoder {
        &mut self.decoder
    }

    pub fn register_buffer(&mut self, kind: ComponentType, buffer: Buffer) {
        self.banks.entry(kind).or_default().push(buffer);
    }

    pub fn register_allocator(&mut self, kind: ComponentType, id: u32, alloc: Box<dyn Allocator>) {
        self.allocators.insert(Key(kind, id), alloc);
    }

    pub fn get_resource(&self, kind: ComponentType, id: u32) -> Option<ResourceHandle> {
        let buf = self.banks.get(&kind)?.get(id)?;
        let base = self.decoder.base_of(kind_to_memory_kind(kind)?, id)?;
        Some(ResourceHandle {
            kind,
            id,
            base_address: base,
            capacity: buf.capacity(),
        })
    }

    pub fn allocate(
        &mut self,
        handle: ResourceHandle,
        size: Size,
        alignment: Size,
        label: &str,
    ) -> Result<Option<Address>, AllocError> {
        let key = Key(handle.kind, handle.id);
        let alloc = self
            .allocators
            .entry(key)
            .or_insert_with(|| Box::new(BumpAllocator::new(handle.base_address, handle.capacity)));
        let addr = alloc.allocate(size, alignment, label)?;
        if addr == NULL_ADDRESS {
            return Ok(None);
        }
        self.stats.total_allocations += 1;
        self.stats.peak_bytes_allocated = self
            .stats
            .peak_bytes_allocated
            .max(self.allocators.values().map(|a| a.bytes_in_use()).sum());
        Ok(Some(addr))
    }

    pub fn deallocate(&mut self, handle: ResourceHandle, address: Address) -> Result<(), AllocError> {
        let key = Key(handle.kind, handle.id);
        match self.allocators.get_mut(&key) {
            Some(alloc) => alloc.deallocate(address),
            None => Err(AllocError::ForeignAddress(address)),
        }
    }

    pub fn read(&mut self, address: Address, size: Size) -> Result<Vec<u8>, DecodeError> {
        let route = self.decoder.decode_range(address, size)?;
        let bank = self.banks.get_mut(&memory_kind_to_component(route.kind)).expect("bank registered");
        let buf = bank.get_mut(route.instance_id).expect("instance registered");
        let mut out = vec![0u8; size as usize];
        buf.read(route.offset, &mut out, size);
        self.stats.total_bytes_moved += size;
        Ok(out)
    }

    pub fn write(&mut self, address: Address, bytes: &[u8]) -> Result<(), DecodeError> {
        let size = bytes.len() as Size;
        let route = self.decoder.decode_range(address, size)?;
        let bank = self.banks.get_mut(&memory_kind_to_component(route.kind)).expect("bank registered");
        let buf = bank.get_mut(route.instance_id).expect("instance registered");
        buf.write(route.offset, bytes, size);
        self.stats.total_bytes_moved += size;
        Ok(())
    }

    pub fn memset(&mut self, address: Address, byte: u8, size: Size) -> Result<(), DecodeError> {
        let buf = vec![byte; size as usize];
        self.write(address, &buf)
    }

    pub fn copy(&mut self, src: Address, dst: Address, size: Size) -> Result<(), DecodeError> {
        let data = self.read(src, size)?;
        self.write(dst, &data)
    }

    pub fn find_resource_for_address(&self, address: Address) -> Option<ComponentType> {
        self.decoder
            .decode(address)
            .ok()
            .map(|r| memory_kind_to_component(r.kind))
    }

    pub fn is_valid_range(&self, address: Address, size: Size) -> bool {
        self.decoder.is_valid_range(address, size)
    }

    pub fn reset_allocations(&mut self, handle: ResourceHandle) {
        if let Some(alloc) = self.allocators.get_mut(&Key(handle.kind, handle.id)) {
            alloc.reset();
        }
    }

    pub fn clear(&mut self, handle: ResourceHandle) {
        if let Some(bank) = self.banks.get_mut(&handle.kind) {
            if let Some(buf) = bank.get_mut(handle.id) {
                buf.reset();
            }
        }
    }

    pub fn get_state(&self, handle: ResourceHandle) -> Option<ResourceState> {
        let buf = self.banks.get(&handle.kind)?.get(handle.id)?;
        let bytes_in_use = self
            .allocators
            .get(&Key(handle.kind, handle.id))
            .map(|a| a.bytes_in_use())
            .unwrap_or(0);
        Some(ResourceState {
            ready: buf.is_ready(),
            last_access_cycle: buf.last_access_cycle(),
            bytes_in_use,
        })
    }

    pub fn get_utilization(&self, handle: ResourceHandle) -> f64 {
        match self.allocators.get(&Key(handle.kind, handle.id)) {
            Some(a) if a.capacity() > 0 => a.bytes_in_use() as f64 / a.capacity() as f64,
            _ => 0.0,
        }
    }

    pub fn get_system_stats(&self) -> &SystemStats {
        &self.stats
    }

    pub fn bank(&self, kind: ComponentType) -> Option<&BufferBank> {
        self.banks.get(&kind)
    }

    pub fn bank_mut(&mut self, kind: ComponentType) -> Option<&mut BufferBank> {
        self.banks.get_mut(&kind)
    }
}

fn kind_to_memory_kind(kind: ComponentType) -> Option<crate::types::MemoryKind> {
    use crate::types::MemoryKind as M;
    Some(match kind {
        ComponentType::HostMemory => M::HostMemory,
        ComponentType::KpuMemory => M::External,
        ComponentType::L3Tile => M::L3Tile,
        ComponentType::L2Bank => M::L2Bank,
        ComponentType::L1 => M::L1Buffer,
        ComponentType::PageBuffer => M::PageBuffer,
        _ => return None,
    })
}

fn memory_kind_to_component(kind: crate::types::MemoryKind) -> ComponentType {
    use crate::types::MemoryKind as M;
    match kind {
        M::HostMemory => ComponentType::HostMemory,
        M::External => ComponentType::KpuMemory,
        M::L3Tile => ComponentType::L3Tile,
        M::L2Bank => ComponentType::L2Bank,
        M::L1Buffer => ComponentType::L1,
        M::PageBuffer => ComponentType::PageBuffer,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MemoryKind;

    fn make_manager() -> (ResourceManager, ResourceHandle) {
        let mut dec = AddressDecoder::new();
        dec.add_region(0x0, 0x1000, MemoryKind::External, 0, "ext0")
            .unwrap();
        let mut mgr = ResourceManager::new(dec);
        mgr.register_buffer(ComponentType::KpuMemory, Buffer::new(0, 0x1000));
        let handle = mgr.get_resource(ComponentType::KpuMemory, 0).unwrap();
        (mgr, handle)
    }

    #[test]
    fn allocate_then_write_then_read() {
        let (mut mgr, handle) = make_manager();
        let addr = mgr.allocate(handle, 64, 8, "buf").unwrap().unwrap();
        mgr.write(addr, &[1, 2, 3, 4]).unwrap();
        let data = mgr.read(addr, 4).unwrap();
        assert_eq!(data, vec![1, 2, 3, 4]);
    }

    #[test]
    fn copy_moves_bytes_between_addresses() {
        let (mut mgr, handle) = make_manager();
        let a = mgr.allocate(handle, 16, 8, "a").unwrap().unwrap();
        let b = mgr.allocate(handle, 16, 8, "b").unwrap().unwrap();
        mgr.write(a, &[7, 7, 7, 7]).unwrap();
        mgr.copy(a, b, 4).unwrap();
        assert_eq!(mgr.read(b, 4).unwrap(), vec![7, 7, 7, 7]);
    }

    #[test]
    fn find_resource_for_address_roundtrip() {
        let (mgr, _handle) = make_manager();
        assert_eq!(
            mgr.find_resource_for_address(0x10),
            Some(ComponentType::KpuMemory)
        );
        assert_eq!(mgr.find_resource_for_address(0x5000), None);
    }
}
