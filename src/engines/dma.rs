//! DMA engine (§4.4): one FIFO queue of address-based byte transfers. Only
//! one transfer is in-flight at a time; queued transfers wait their turn.
//! Timing follows the teacher's `div_ceil`-based cost idiom from
//! `memory/offchip_load.rs`/`offchip_store.rs`.

use std::collections::VecDeque;

use crate::error::{DecodeError, EngineError};
use crate::memory::resource::ResourceManager;
use crate::trace::event::{DmaPayload, Payload, TraceLogger, TransactionType};
use crate::types::{Address, ComponentType, Cycle, MemoryKind, Size, div_ceil};

#[derive(Debug, Clone)]
struct Transfer {
    src: Address,
    dst: Address,
    size: Size,
    on_complete: Option<u32>,
    started_at: Option<Cycle>,
    latency: Option<Cycle>,
    transaction_id: Option<u64>,
}

/// A single DMA engine instance. `bandwidth_bytes_per_cycle` models
/// External's single scalar bandwidth attribute (§3); bit-exact DRAM
/// timing is explicitly out of scope (§1).
pub struct DmaEngine {
    pub id: u32,
    bandwidth_bytes_per_cycle: f64,
    queue: VecDeque<Transfer>,
}

impl DmaEngine {
    pub fn new(id: u32, bandwidth_bytes_per_cycle: f64) -> Self {
        Self {
            id,
            bandwidth_bytes_per_cycle,
            queue: VecDeque::new(),
        }
    }

    pub fn is_busy(&self) -> bool {
        !self.queue.is_empty()
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn latency_for(&self, size: Size) -> Cycle {
        div_ceil(size, self.bandwidth_bytes_per_cycle.max(1.0) as u64).max(1)
    }

    pub fn enqueue(
        &mut self,
        mgr: &ResourceManager,
        src: Address,
        dst: Address,
        size: Size,
        on_complete: Option<u32>,
    ) -> Result<(), EngineError> {
        mgr.decoder().decode_range(src, size)?;
        mgr.decoder().decode_range(dst, size)?;
        self.queue.push_back(Transfer {
            src,
            dst,
            size,
            on_complete,
            started_at: None,
            latency: None,
            transaction_id: None,
        });
        Ok(())
    }

    /// Legacy `(kind, id, offset)` entry point: resolves to a global
    /// address via the decoder, then behaves exactly like `enqueue`.
    pub fn enqueue_legacy(
        &mut self,
        mgr: &ResourceManager,
        src_kind: MemoryKind,
        src_id: u32,
        src_offset: Address,
        dst_kind: MemoryKind,
        dst_id: u32,
        dst_offset: Address,
        size: Size,
        on_complete: Option<u32>,
    ) -> Result<(), EngineError> {
        let src_base = mgr
            .decoder()
            .base_of(src_kind, src_id)
            .ok_or(EngineError::Decode(DecodeError::Unmapped(src_offset)))?;
        let dst_base = mgr
            .decoder()
            .base_of(dst_kind, dst_id)
            .ok_or(EngineError::Decode(DecodeError::Unmapped(dst_offset)))?;
        self.enqueue(mgr, src_base + src_offset, dst_base + dst_offset, size, on_complete)
    }

    /// Advances the engine by one cycle. Completes the head transfer once
    /// its modeled latency has elapsed, moving bytes through `mgr` and
    /// logging ISSUED/COMPLETED trace events. Returns the instruction id
    /// that retired this cycle, if any.
    pub fn process(&mut self, cycle: Cycle, mgr: &mut ResourceManager, logger: &mut TraceLogger) -> Option<u32> {
        let transfer = self.queue.front_mut()?;
        if transfer.started_at.is_none() {
            transfer.started_at = Some(cycle);
            let size = transfer.size;
            let latency = self.latency_for(size);
            let transfer = self.queue.front_mut()?;
            transfer.latency = Some(latency);
            transfer.transaction_id = logger.issue(
                cycle,
                ComponentType::DmaEngine,
                self.id,
                TransactionType::Transfer,
                Some(Payload::Dma(DmaPayload {
                    src_loc: format!("{:#x}", transfer.src),
                    dst_loc: format!("{:#x}", transfer.dst),
                    bytes_transferred: transfer.size,
                    bandwidth_gbps: self.bandwidth_bytes_per_cycle,
                })),
                None,
            );
            return None;
        }

        let elapsed = cycle - transfer.started_at.unwrap();
        if elapsed + 1 < transfer.latency.unwrap() {
            return None;
        }

        let transfer = self.queue.pop_front().unwrap();
        let data = mgr.read(transfer.src, transfer.size).expect("decoder validated at enqueue");
        mgr.write(transfer.dst, &data).expect("decoder validated at enqueue");
        if let Some(txn) = transfer.transaction_id {
            logger.complete(
                txn,
                cycle,
                Some(Payload::Dma(DmaPayload {
                    src_loc: format!("{:#x}", transfer.src),
                    dst_loc: format!("{:#x}", transfer.dst),
                    bytes_transferred: transfer.size,
                    bandwidth_gbps: self.bandwidth_bytes_per_cycle,
                })),
            );
        }
        transfer.on_complete
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::AddressDecoder;
    use crate::memory::buffer::Buffer;

    fn manager() -> ResourceManager {
        let mut dec = AddressDecoder::new();
        dec.add_region(0x0, 0x1000, MemoryKind::External, 0, "ext").unwrap();
        dec.add_region(0x1000, 0x1000, MemoryKind::L3Tile, 0, "l3").unwrap();
        let mut mgr = ResourceManager::new(dec);
        mgr.register_buffer(ComponentType::KpuMemory, Buffer::new(0, 0x1000));
        mgr.register_buffer(ComponentType::L3Tile, Buffer::new(0, 0x1000));
        mgr
    }

    #[test]
    fn transfer_completes_and_moves_bytes() {
        let mut mgr = manager();
        mgr.write(0x10, &[1, 2, 3, 4]).unwrap();
        let mut logger = TraceLogger::new();
        let mut dma = DmaEngine::new(0, 4.0); // 4 bytes/cycle -> 1 cycle for 4 bytes
        dma.enqueue(&mgr, 0x10, 0x1004, 4, Some(42)).unwrap();

        let mut cycle = 0;
        let mut completed = None;
        while completed.is_none() && cycle < 100 {
            completed = dma.process(cycle, &mut mgr, &mut logger);
            cycle += 1;
        }
        assert_eq!(completed, Some(42));
        assert_eq!(mgr.read(0x1004, 4).unwrap(), vec![1, 2, 3, 4]);

        let events = logger.events();
        assert!(events.iter().any(|e| e.status == crate::trace::Status::Issued));
        assert!(events.iter().any(|e| e.status == crate::trace::Status::Completed));
    }

    #[test]
    fn minimum_latency_is_one_cycle() {
        let mgr = manager();
        let dma = DmaEngine::new(0, 1_000_000.0);
        assert_eq!(dma.latency_for(1), 1);
    }

    #[test]
    fn unmapped_enqueue_fails_synchronously() {
        let mgr = manager();
        let mut dma = DmaEngine::new(0, 4.0);
        let err = dma.enqueue(&mgr, 0xFFFF_0000, 0x1004, 4, None).unwrap_err();
        assert!(matches!(err, EngineError::Decode(DecodeError::Unmapped(_))));
    }
}
