//! Scalar types shared across the datapath: byte addresses, byte counts,
//! cycle ticks, and the tagged `DataType` describing an element format.

use serde::{Deserialize, Serialize};

/// A 64-bit byte address in the global (decoder-routed) address space.
pub type Address = u64;

/// A 64-bit byte count.
pub type Size = u64;

/// A monotonic cycle tick.
pub type Cycle = u64;

/// The six memory kinds making up the datapath, ordered outward-in from
/// DRAM to the compute fabric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MemoryKind {
    HostMemory,
    External,
    L3Tile,
    L2Bank,
    L1Buffer,
    PageBuffer,
}

impl MemoryKind {
    pub const ALL: [MemoryKind; 6] = [
        MemoryKind::HostMemory,
        MemoryKind::External,
        MemoryKind::L3Tile,
        MemoryKind::L2Bank,
        MemoryKind::L1Buffer,
        MemoryKind::PageBuffer,
    ];
}

impl std::fmt::Display for MemoryKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            MemoryKind::HostMemory => "HostMemory",
            MemoryKind::External => "External",
            MemoryKind::L3Tile => "L3Tile",
            MemoryKind::L2Bank => "L2Bank",
            MemoryKind::L1Buffer => "L1Buffer",
            MemoryKind::PageBuffer => "PageBuffer",
        };
        f.write_str(s)
    }
}

/// Element data type, carrying enough metadata to compute sizes and pick an
/// accumulator type without a second lookup table at call sites.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    Float32,
    Float16,
    BFloat16,
    Int32,
    Int8,
    UInt8,
    Int4Packed,
}

impl DataType {
    /// Size in bytes of one element (for `Int4Packed`, two elements share
    /// one byte, so this returns the per-pair byte size).
    pub const fn size_bytes(self) -> Size {
        match self {
            DataType::Float32 | DataType::Int32 => 4,
            DataType::Float16 | DataType::BFloat16 => 2,
            DataType::Int8 | DataType::UInt8 => 1,
            DataType::Int4Packed => 1,
        }
    }

    pub const fn bit_width(self) -> u32 {
        match self {
            DataType::Float32 | DataType::Int32 => 32,
            DataType::Float16 | DataType::BFloat16 => 16,
            DataType::Int8 | DataType::UInt8 => 8,
            DataType::Int4Packed => 4,
        }
    }

    pub const fn is_signed(self) -> bool {
        !matches!(self, DataType::UInt8)
    }

    pub const fn is_packed(self) -> bool {
        matches!(self, DataType::Int4Packed)
    }

    /// The data type an accumulator holding a sum-of-products of this type
    /// should use, e.g. int8 -> int32, f16 -> f32.
    pub const fn accumulator(self) -> DataType {
        match self {
            DataType::Float32 => DataType::Float32,
            DataType::Float16 | DataType::BFloat16 => DataType::Float32,
            DataType::Int32 => DataType::Int32,
            DataType::Int8 | DataType::UInt8 | DataType::Int4Packed => DataType::Int32,
        }
    }

    pub fn from_name(name: &str) -> Option<DataType> {
        Some(match name {
            "float32" | "f32" => DataType::Float32,
            "float16" | "f16" => DataType::Float16,
            "bfloat16" | "bf16" => DataType::BFloat16,
            "int32" | "i32" => DataType::Int32,
            "int8" | "i8" => DataType::Int8,
            "uint8" | "u8" => DataType::UInt8,
            "int4" | "int4packed" => DataType::Int4Packed,
            _ => return None,
        })
    }
}

/// The full component taxonomy from the trace event schema (§6), also used
/// to tag resource handles so a single enum distinguishes every addressable
/// or schedulable thing in the datapath.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ComponentType {
    HostMemory,
    HostCpu,
    PcieBus,
    DmaEngine,
    BlockMover,
    Streamer,
    KpuMemory,
    L3Tile,
    L2Bank,
    L1,
    PageBuffer,
    ComputeFabric,
    SystolicArray,
    StorageScheduler,
    MemoryOrchestrator,
}

impl ComponentType {
    pub const fn is_memory(self) -> bool {
        matches!(
            self,
            ComponentType::HostMemory
                | ComponentType::KpuMemory
                | ComponentType::L3Tile
                | ComponentType::L2Bank
                | ComponentType::L1
                | ComponentType::PageBuffer
        )
    }

    pub const fn is_compute(self) -> bool {
        matches!(self, ComponentType::ComputeFabric | ComponentType::SystolicArray)
    }

    pub const fn is_data_movement(self) -> bool {
        matches!(
            self,
            ComponentType::DmaEngine | ComponentType::BlockMover | ComponentType::Streamer
        )
    }

    /// Fixed process ordering for the Chrome trace exporter, so the viewer
    /// lays tracks out in physical pipeline order: Host -> PCIe -> DMA ->
    /// Memory -> L3 -> BM -> L2 -> Streamer -> L1 -> Fabric.
    pub const fn chrome_process_id(self) -> u32 {
        match self {
            ComponentType::HostMemory => 0,
            ComponentType::HostCpu => 1,
            ComponentType::PcieBus => 2,
            ComponentType::DmaEngine => 3,
            ComponentType::KpuMemory => 4,
            ComponentType::MemoryOrchestrator => 4,
            ComponentType::L3Tile => 5,
            ComponentType::BlockMover => 6,
            ComponentType::L2Bank => 7,
            ComponentType::Streamer => 8,
            ComponentType::L1 => 9,
            ComponentType::ComputeFabric => 10,
            ComponentType::SystolicArray => 10,
            ComponentType::PageBuffer => 11,
            ComponentType::StorageScheduler => 12,
        }
    }
}

/// Ceiling division, the cycle-count workhorse used by every engine's
/// latency formula.
pub const fn div_ceil(a: u64, b: u64) -> u64 {
    debug_assert!(b != 0);
    (a + b - 1) / b
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accumulator_mapping() {
        assert_eq!(DataType::Int8.accumulator(), DataType::Int32);
        assert_eq!(DataType::Float16.accumulator(), DataType::Float32);
        assert_eq!(DataType::Float32.accumulator(), DataType::Float32);
    }

    #[test]
    fn div_ceil_basic() {
        assert_eq!(div_ceil(10, 3), 4);
        assert_eq!(div_ceil(9, 3), 3);
        assert_eq!(div_ceil(1, 3), 1);
    }
}
