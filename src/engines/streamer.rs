//! Streamer (§4.6): staggered row/column feed between one L2 bank and one
//! L1 buffer, grounded on the teacher's `operator/streamify.rs` row-at-a-
//! time iteration idiom. Elements are always `f32` (4 bytes) — the
//! datapath's `*_BIAS_ACTIVATION` drains operate on dequantized
//! accumulator output, never on packed/narrow formats.
//!
//! A fused `DRAIN_OUTPUT_BIAS_ACTIVATION` is any drain whose operands carry
//! a bias address or a non-`None` activation; the engine does not need the
//! originating opcode to decide this.

use std::collections::VecDeque;

use crate::engines::vector_engine::VectorEngine;
use crate::error::EngineError;
use crate::isa::instruction::{Activation, StreamDirection, StreamerOperands};
use crate::memory::resource::ResourceManager;
use crate::trace::event::{TraceLogger, TransactionType};
use crate::types::{ComponentType, Cycle};

const ELEM: usize = 4;

#[derive(Debug, Clone)]
struct Job {
    op: StreamerOperands,
    on_complete: Option<u32>,
    started_at: Option<Cycle>,
    transaction_id: Option<u64>,
}

pub struct StreamerEngine {
    pub id: u32,
    vector_engine: VectorEngine,
    queue: VecDeque<Job>,
}

impl StreamerEngine {
    pub fn new(id: u32) -> Self {
        Self {
            id,
            vector_engine: VectorEngine::new(),
            queue: VecDeque::new(),
        }
    }

    pub fn is_busy(&self) -> bool {
        !self.queue.is_empty()
    }

    pub fn enqueue(
        &mut self,
        mgr: &ResourceManager,
        op: StreamerOperands,
        on_complete: Option<u32>,
    ) -> Result<(), EngineError> {
        if op.height == 0 || op.width == 0 {
            return Err(EngineError::ZeroDimension);
        }
        if let Some(addr) = op.bias_addr {
            mgr.decoder().decode_range(addr, (op.width * ELEM) as u64)?;
        }
        self.queue.push_back(Job {
            op,
            on_complete,
            started_at: None,
            transaction_id: None,
        });
        Ok(())
    }

    pub fn latency_for(op: &StreamerOperands) -> Cycle {
        // systolic fill-and-drain: height rows plus (fabric_size - 1) cycles
        // for the pipeline to fully fill.
        (op.height as Cycle + op.fabric_size.saturating_sub(1) as Cycle).max(1)
    }

    fn run_transfer(&self, mgr: &mut ResourceManager, op: &StreamerOperands) {
        let n = op.height * op.width;
        let bytes_len = n * ELEM;

        let mut bytes = vec![0u8; bytes_len];
        match op.direction {
            StreamDirection::L2ToL1 => {
                let bank = mgr.bank_mut(ComponentType::L2Bank).expect("L2 bank registered");
                let buf = bank.get_mut(op.l2_id).expect("L2 instance registered");
                buf.read(op.l2_addr, &mut bytes, bytes_len as u64);
            }
            StreamDirection::L1ToL2 => {
                let bank = mgr.bank_mut(ComponentType::L1).expect("L1 bank registered");
                let buf = bank.get_mut(op.l1_id).expect("L1 instance registered");
                buf.read(op.l1_addr, &mut bytes, bytes_len as u64);
            }
        }

        let mut values: Vec<f32> = bytes.chunks_exact(ELEM).map(|c| f32::from_le_bytes(c.try_into().unwrap())).collect();

        let fused = op.bias_addr.is_some() || !matches!(op.activation, Activation::None);
        if fused {
            let bias = op.bias_addr.map(|addr| {
                let raw = mgr.read(addr, (op.width * ELEM) as u64).expect("bias range validated at enqueue");
                raw.chunks_exact(ELEM).map(|c| f32::from_le_bytes(c.try_into().unwrap())).collect::<Vec<_>>()
            });
            self.vector_engine.bias_activate(&mut values, op.width, bias.as_deref(), op.activation);
        }

        let out_bytes: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        match op.direction {
            StreamDirection::L2ToL1 => {
                let bank = mgr.bank_mut(ComponentType::L1).expect("L1 bank registered");
                let buf = bank.get_mut(op.l1_id).expect("L1 instance registered");
                buf.write(op.l1_addr, &out_bytes, bytes_len as u64);
            }
            StreamDirection::L1ToL2 => {
                let bank = mgr.bank_mut(ComponentType::L2Bank).expect("L2 bank registered");
                let buf = bank.get_mut(op.l2_id).expect("L2 instance registered");
                buf.write(op.l2_addr, &out_bytes, bytes_len as u64);
            }
        }
    }

    pub fn process(&mut self, cycle: Cycle, mgr: &mut ResourceManager, logger: &mut TraceLogger) -> Option<u32> {
        let job = self.queue.front_mut()?;
        if job.started_at.is_none() {
            job.started_at = Some(cycle);
            job.transaction_id = logger.issue(
                cycle,
                ComponentType::Streamer,
                self.id,
                TransactionType::Transfer,
                None,
                Some(format!("{:?} {:?}", job.op.direction, job.op.stream_type)),
            );
            return None;
        }

        let elapsed = cycle - job.started_at.unwrap();
        if elapsed + 1 < Self::latency_for(&job.op) {
            return None;
        }

        let job = self.queue.pop_front().unwrap();
        self.run_transfer(mgr, &job.op);
        if let Some(txn) = job.transaction_id {
            logger.complete(txn, cycle, None);
        }
        job.on_complete
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::AddressDecoder;
    use crate::isa::instruction::StreamType;
    use crate::memory::buffer::Buffer;
    use crate::types::MemoryKind;

    fn manager() -> ResourceManager {
        let mut dec = AddressDecoder::new();
        dec.add_region(0x0, 0x1000, MemoryKind::L2Bank, 0, "l2").unwrap();
        dec.add_region(0x1000, 0x1000, MemoryKind::L1Buffer, 0, "l1").unwrap();
        dec.add_region(0x2000, 0x1000, MemoryKind::External, 0, "ext").unwrap();
        let mut mgr = ResourceManager::new(dec);
        mgr.register_buffer(ComponentType::L2Bank, Buffer::new(0, 0x1000));
        mgr.register_buffer(ComponentType::L1, Buffer::new(0, 0x1000));
        mgr.register_buffer(ComponentType::KpuMemory, Buffer::new(0, 0x1000));
        mgr
    }

    fn base_op() -> StreamerOperands {
        StreamerOperands {
            l2_id: 0,
            l2_addr: 0,
            l1_id: 0,
            l1_addr: 0,
            height: 1,
            width: 2,
            fabric_size: 2,
            direction: StreamDirection::L2ToL1,
            stream_type: StreamType::Row,
            bias_addr: None,
            activation: Activation::None,
        }
    }

    fn run_to_completion(eng: &mut StreamerEngine, mgr: &mut ResourceManager, logger: &mut TraceLogger) -> u32 {
        let mut cycle = 0;
        loop {
            if let Some(id) = eng.process(cycle, mgr, logger) {
                return id;
            }
            cycle += 1;
            assert!(cycle < 100);
        }
    }

    #[test]
    fn plain_feed_copies_floats() {
        let mut mgr = manager();
        let bytes: Vec<u8> = [1.5f32, -2.5].iter().flat_map(|v| v.to_le_bytes()).collect();
        mgr.write(0, &bytes).unwrap();
        let mut eng = StreamerEngine::new(0);
        let mut logger = TraceLogger::new();
        eng.enqueue(&mgr, base_op(), Some(1)).unwrap();
        run_to_completion(&mut eng, &mut mgr, &mut logger);
        let out = mgr.read(0x1000, 8).unwrap();
        let v0 = f32::from_le_bytes(out[0..4].try_into().unwrap());
        let v1 = f32::from_le_bytes(out[4..8].try_into().unwrap());
        assert_eq!((v0, v1), (1.5, -2.5));
    }

    #[test]
    fn fused_bias_activation_applies_pipeline() {
        let mut mgr = manager();
        let bytes: Vec<u8> = [-1.0f32, 2.0].iter().flat_map(|v| v.to_le_bytes()).collect();
        mgr.write(0, &bytes).unwrap();
        let bias: Vec<u8> = [1.0f32, -5.0].iter().flat_map(|v| v.to_le_bytes()).collect();
        mgr.write(0x2000, &bias).unwrap();

        let mut op = base_op();
        op.bias_addr = Some(0x2000);
        op.activation = Activation::ReLU;

        let mut eng = StreamerEngine::new(0);
        let mut logger = TraceLogger::new();
        eng.enqueue(&mgr, op, None).unwrap();
        run_to_completion(&mut eng, &mut mgr, &mut logger);

        let out = mgr.read(0x1000, 8).unwrap();
        let v0 = f32::from_le_bytes(out[0..4].try_into().unwrap());
        let v1 = f32::from_le_bytes(out[4..8].try_into().unwrap());
        // (-1+1)=0 -> relu 0 ; (2-5)=-3 -> relu 0
        assert_eq!((v0, v1), (0.0, 0.0));
    }

    #[test]
    fn zero_dimension_rejected() {
        let mgr = manager();
        let mut eng = StreamerEngine::new(0);
        let mut op = base_op();
        op.width = 0;
        assert_eq!(eng.enqueue(&mgr, op, None), Err(EngineError::ZeroDimension));
    }
}
