//! `HardwareContext` (§9 "Ownership graph"): owns the resource manager, the
//! trace logger, and one instance of each engine. Nothing is shared via
//! `Rc`/`Arc` — every engine borrows the resource manager and logger only
//! for the duration of its own `step()` call, exactly as the design note
//! prescribes ("thread a mutable hardware context reference through
//! step()`, never give engines their own copy of shared state").

use serde::{Deserialize, Serialize};

use crate::decoder::AddressDecoder;
use crate::engines::{BlockMoverEngine, ComputeBackend, ComputeEngine, DmaEngine, StreamerEngine};
use crate::error::EngineError;
use crate::isa::instruction::StreamerOperands;
use crate::memory::buffer::Buffer;
use crate::memory::resource::ResourceManager;
use crate::trace::event::TraceLogger;
use crate::types::{Address, ComponentType, Cycle, MemoryKind, Size};

/// One buffer instance's capacity, for `HardwareConfig`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BufferSpec {
    pub count: u32,
    pub capacity_bytes: Size,
}

impl BufferSpec {
    pub fn new(count: u32, capacity_bytes: Size) -> Self {
        Self { count, capacity_bytes }
    }
}

/// Topology knobs accepted by `HardwareContext::new`. File-based (JSON/YAML)
/// loading is out of scope; this is the in-memory config surface every
/// simulator needs, mirroring the teacher's `SimConfig` derive pattern.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HardwareConfig {
    pub host_memory: BufferSpec,
    pub external: BufferSpec,
    pub l3_tile: BufferSpec,
    pub l2_bank: BufferSpec,
    pub l1_buffer: BufferSpec,
    pub page_buffer: BufferSpec,
    pub external_bandwidth_gbps: f64,
    pub clock_freq_ghz: f64,
    pub systolic_array_size: usize,
}

impl Default for HardwareConfig {
    /// A reasonable single-KPU topology: one instance of each memory kind,
    /// a 16x16 systolic array, 1 GHz clock.
    fn default() -> Self {
        Self {
            host_memory: BufferSpec::new(1, 64 << 20),
            external: BufferSpec::new(1, 256 << 20),
            l3_tile: BufferSpec::new(1, 2 << 20),
            l2_bank: BufferSpec::new(4, 256 << 10),
            l1_buffer: BufferSpec::new(4, 64 << 10),
            page_buffer: BufferSpec::new(1, 4096),
            external_bandwidth_gbps: 32.0,
            clock_freq_ghz: 1.0,
            systolic_array_size: 16,
        }
    }
}

/// Wires a `ResourceManager`, a `TraceLogger`, and one instance of every
/// engine into a single simulatable unit. Engines are advanced in the fixed
/// per-cycle order DMA -> Block Mover -> Streamer -> Compute (§4.9); the
/// vector engine has no queue of its own and runs synchronously inside a
/// streamer or compute completion.
pub struct HardwareContext {
    resources: ResourceManager,
    trace: TraceLogger,
    pub dma: DmaEngine,
    pub block_mover: BlockMoverEngine,
    pub streamer: StreamerEngine,
    pub compute: ComputeEngine,
    cycle: Cycle,
}

fn register_bank(
    mgr: &mut ResourceManager,
    dec: &mut AddressDecoder,
    kind: MemoryKind,
    component: ComponentType,
    spec: BufferSpec,
    bandwidth_gbps: Option<f64>,
    base: &mut Address,
) {
    for id in 0..spec.count {
        dec.add_region(*base, spec.capacity_bytes, kind, id, format!("{kind}{id}")).expect("non-overlapping by construction");
        let mut buf = Buffer::new(id, spec.capacity_bytes);
        if let Some(bw) = bandwidth_gbps {
            buf = buf.with_bandwidth(bw);
        }
        mgr.register_buffer(component, buf);
        *base += spec.capacity_bytes;
    }
}

impl HardwareContext {
    pub fn new(config: HardwareConfig) -> Self {
        let mut dec = AddressDecoder::new();
        let mut mgr = ResourceManager::default();
        let mut base: Address = 0;

        register_bank(&mut mgr, &mut dec, MemoryKind::HostMemory, ComponentType::HostMemory, config.host_memory, None, &mut base);
        register_bank(
            &mut mgr,
            &mut dec,
            MemoryKind::External,
            ComponentType::KpuMemory,
            config.external,
            Some(config.external_bandwidth_gbps),
            &mut base,
        );
        register_bank(&mut mgr, &mut dec, MemoryKind::L3Tile, ComponentType::L3Tile, config.l3_tile, None, &mut base);
        register_bank(&mut mgr, &mut dec, MemoryKind::L2Bank, ComponentType::L2Bank, config.l2_bank, None, &mut base);
        register_bank(&mut mgr, &mut dec, MemoryKind::L1Buffer, ComponentType::L1, config.l1_buffer, None, &mut base);
        register_bank(&mut mgr, &mut dec, MemoryKind::PageBuffer, ComponentType::PageBuffer, config.page_buffer, None, &mut base);

        *mgr.decoder_mut() = dec;

        let bytes_per_cycle = (config.external_bandwidth_gbps * 1e9 / 8.0) / (config.clock_freq_ghz * 1e9);

        Self {
            resources: mgr,
            trace: TraceLogger::new(),
            dma: DmaEngine::new(0, bytes_per_cycle),
            block_mover: BlockMoverEngine::new(0),
            streamer: StreamerEngine::new(0),
            compute: ComputeEngine::new(0, ComputeBackend::SystolicArray { size: config.systolic_array_size }),
            cycle: 0,
        }
    }

    pub fn resources(&self) -> &ResourceManager {
        &self.resources
    }

    pub fn resources_mut(&mut self) -> &mut ResourceManager {
        &mut self.resources
    }

    pub fn trace(&self) -> &TraceLogger {
        &self.trace
    }

    pub fn cycle(&self) -> Cycle {
        self.cycle
    }

    pub fn any_engine_busy(&self) -> bool {
        self.dma.is_busy() || self.block_mover.is_busy() || self.streamer.is_busy() || self.compute.is_busy()
    }

    /// Enqueues a DMA transfer. A thin facade so callers outside this module
    /// never need to borrow `resources` and `dma` separately (the engine's
    /// own `enqueue` takes `&ResourceManager` for range validation).
    pub fn enqueue_dma(&mut self, src: Address, dst: Address, size: Size, on_complete: Option<u32>) -> Result<(), EngineError> {
        self.dma.enqueue(&self.resources, src, dst, size, on_complete)
    }

    /// Enqueues a streamer job, same rationale as `enqueue_dma`.
    pub fn enqueue_streamer(&mut self, op: StreamerOperands, on_complete: Option<u32>) -> Result<(), EngineError> {
        self.streamer.enqueue(&self.resources, op, on_complete)
    }

    /// Advances every engine by exactly one cycle and returns the
    /// instruction ids that retired during it, in engine-advance order.
    pub fn step(&mut self) -> Vec<u32> {
        let mut retired = Vec::new();
        if let Some(id) = self.dma.process(self.cycle, &mut self.resources, &mut self.trace) {
            retired.push(id);
        }
        if let Some(id) = self.block_mover.process(self.cycle, &mut self.resources, &mut self.trace) {
            retired.push(id);
        }
        if let Some(id) = self.streamer.process(self.cycle, &mut self.resources, &mut self.trace) {
            retired.push(id);
        }
        if let Some(id) = self.compute.process(self.cycle, &mut self.resources, &mut self.trace) {
            retired.push(id);
        }
        self.cycle += 1;
        retired
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_maps_all_six_memory_kinds() {
        let hw = HardwareContext::new(HardwareConfig::default());
        for kind in [
            ComponentType::HostMemory,
            ComponentType::KpuMemory,
            ComponentType::L3Tile,
            ComponentType::L2Bank,
            ComponentType::L1,
            ComponentType::PageBuffer,
        ] {
            assert!(hw.resources().bank(kind).is_some(), "{kind:?} should have a registered bank");
        }
    }

    #[test]
    fn step_advances_cycle_counter() {
        let mut hw = HardwareContext::new(HardwareConfig::default());
        assert_eq!(hw.cycle(), 0);
        hw.step();
        assert_eq!(hw.cycle(), 1);
    }

    #[test]
    fn idle_hardware_is_not_busy() {
        let hw = HardwareContext::new(HardwareConfig::default());
        assert!(!hw.any_engine_busy());
    }
}
