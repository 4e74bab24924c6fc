//! The data-movement ISA (§3, §4.9): a tagged instruction set where each
//! variant carries the operand schema for one opcode family. Dispatch is a
//! single `match` on `Instruction::opcode()`, no boxing, no virtual tables —
//! the sum-type idiom the teacher uses for `Elem<T>` in `primitives/elem.rs`,
//! generalized to a whole instruction set.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::types::{Address, Cycle, Size};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Matrix {
    A,
    B,
    C,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TileCoord {
    pub ti: usize,
    pub tj: usize,
    pub tk: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Transform {
    Identity,
    Transpose,
    BlockReshape,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StreamDirection {
    L2ToL1,
    L1ToL2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StreamType {
    Row,
    Col,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Activation {
    None,
    ReLU,
    GELU,
    Sigmoid,
    Tanh,
    SiLU,
    Softplus,
    LeakyReLU,
}

/// DMA-family operand payload (`LOAD_TILE`, `STORE_TILE`, `PREFETCH_TILE`).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DmaOperands {
    pub matrix: Matrix,
    pub tile_coord: TileCoord,
    pub l3_offset: Address,
    pub size: Size,
    pub buffer_slot: u8,
}

/// Which way a block-mover job crosses the L3/L2 boundary: `MOVE_TILE` goes
/// L3->L2, `WRITEBACK_TILE` goes L2->L3. Source and destination ids/offsets
/// are always read relative to the bank `direction` says they live in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BlockMoverDirection {
    L3ToL2,
    L2ToL3,
}

/// Block-mover-family operand payload (`MOVE_TILE`, `TRANSPOSE_TILE`,
/// `WRITEBACK_TILE`, `RESHAPE_TILE`).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BlockMoverOperands {
    pub src_id: u32,
    pub src_offset: Address,
    pub dst_id: u32,
    pub dst_offset: Address,
    pub height: usize,
    pub width: usize,
    pub element_size: Size,
    pub transform: Transform,
    pub direction: BlockMoverDirection,
}

/// Streamer-family operand payload (`FEED_ROWS`, `FEED_COLS`,
/// `DRAIN_OUTPUT`, `BROADCAST_ROW`, `BROADCAST_COL`), and the fused
/// `*_BIAS_ACTIVATION` drains routed through the vector engine.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StreamerOperands {
    pub l2_id: u32,
    pub l2_addr: Address,
    pub l1_id: u32,
    pub l1_addr: Address,
    pub height: usize,
    pub width: usize,
    pub fabric_size: usize,
    pub direction: StreamDirection,
    pub stream_type: StreamType,
    pub bias_addr: Option<Address>,
    pub activation: Activation,
}

/// Sync-family payload: empty, or a mask naming which pending sets to wait
/// on. Per spec §9, `BARRIER` ignores the mask and always waits on every
/// engine — the mask is retained as metadata for `WAIT_*`/`SIGNAL` only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SyncOperands {
    pub mask: Option<u32>,
}

/// Control-family payload (`SET_TILE_SIZE`, `SET_BUFFER`, `SET_STRIDE`,
/// `LOOP_BEGIN`, `LOOP_END`, `NOP`, `HALT`). Reserved for future use; the
/// executor treats all of these except `HALT` as no-ops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ControlOperands {
    pub value: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Operands {
    Dma(DmaOperands),
    BlockMover(BlockMoverOperands),
    Streamer(StreamerOperands),
    Sync(SyncOperands),
    Control(ControlOperands),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Opcode {
    LoadTile,
    StoreTile,
    PrefetchTile,
    MoveTile,
    TransposeTile,
    WritebackTile,
    ReshapeTile,
    FeedRows,
    FeedCols,
    DrainOutput,
    DrainOutputBiasActivation,
    BroadcastRow,
    BroadcastCol,
    Barrier,
    WaitDma,
    WaitBm,
    WaitStr,
    Signal,
    SetTileSize,
    SetBuffer,
    SetStride,
    LoopBegin,
    LoopEnd,
    Nop,
    Halt,
}

impl Opcode {
    pub const fn is_dma(self) -> bool {
        matches!(self, Opcode::LoadTile | Opcode::StoreTile | Opcode::PrefetchTile)
    }
    pub const fn is_block_mover(self) -> bool {
        matches!(
            self,
            Opcode::MoveTile | Opcode::TransposeTile | Opcode::WritebackTile | Opcode::ReshapeTile
        )
    }
    pub const fn is_streamer(self) -> bool {
        matches!(
            self,
            Opcode::FeedRows
                | Opcode::FeedCols
                | Opcode::DrainOutput
                | Opcode::DrainOutputBiasActivation
                | Opcode::BroadcastRow
                | Opcode::BroadcastCol
        )
    }
    pub const fn is_sync(self) -> bool {
        matches!(
            self,
            Opcode::Barrier | Opcode::WaitDma | Opcode::WaitBm | Opcode::WaitStr | Opcode::Signal
        )
    }
    pub const fn is_control(self) -> bool {
        matches!(
            self,
            Opcode::SetTileSize
                | Opcode::SetBuffer
                | Opcode::SetStride
                | Opcode::LoopBegin
                | Opcode::LoopEnd
                | Opcode::Nop
                | Opcode::Halt
        )
    }
}

/// One ISA instruction. `instruction_id` is unique within a program and is
/// the only handle dependency edges reference (invariant: no `deps` entry
/// may exceed its own id — ids are program order).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instruction {
    pub instruction_id: u32,
    pub opcode: Opcode,
    pub earliest_cycle: Cycle,
    pub deadline_cycle: Cycle,
    pub deps: BTreeSet<u32>,
    pub label: String,
    pub operands: Operands,
}

impl Instruction {
    pub fn new(instruction_id: u32, opcode: Opcode, operands: Operands, label: impl Into<String>) -> Self {
        Self {
            instruction_id,
            opcode,
            earliest_cycle: 0,
            deadline_cycle: Cycle::MAX,
            deps: BTreeSet::new(),
            label: label.into(),
            operands,
        }
    }

    pub fn with_deps(mut self, deps: impl IntoIterator<Item = u32>) -> Self {
        self.deps = deps.into_iter().collect();
        self
    }

    pub fn with_earliest(mut self, cycle: Cycle) -> Self {
        self.earliest_cycle = cycle;
        self
    }

    pub fn dma(&self) -> Option<&DmaOperands> {
        match &self.operands {
            Operands::Dma(o) => Some(o),
            _ => None,
        }
    }

    pub fn block_mover(&self) -> Option<&BlockMoverOperands> {
        match &self.operands {
            Operands::BlockMover(o) => Some(o),
            _ => None,
        }
    }

    pub fn streamer(&self) -> Option<&StreamerOperands> {
        match &self.operands {
            Operands::Streamer(o) => Some(o),
            _ => None,
        }
    }

    /// Validates invariant 2: no dependency may reference a *later* id.
    pub fn deps_are_well_ordered(&self) -> bool {
        self.deps.iter().all(|&d| d < self.instruction_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deps_ordering_invariant() {
        let ok = Instruction::new(5, Opcode::Nop, Operands::Control(ControlOperands::default()), "n")
            .with_deps([1, 2, 3]);
        assert!(ok.deps_are_well_ordered());

        let bad = Instruction::new(5, Opcode::Nop, Operands::Control(ControlOperands::default()), "n")
            .with_deps([1, 7]);
        assert!(!bad.deps_are_well_ordered());
    }

    #[test]
    fn opcode_family_predicates_are_disjoint() {
        for op in [
            Opcode::LoadTile,
            Opcode::MoveTile,
            Opcode::FeedRows,
            Opcode::Barrier,
            Opcode::Halt,
        ] {
            let count = [
                op.is_dma(),
                op.is_block_mover(),
                op.is_streamer(),
                op.is_sync(),
                op.is_control(),
            ]
            .into_iter()
            .filter(|b| *b)
            .count();
            assert_eq!(count, 1, "{op:?} should belong to exactly one family");
        }
    }
}
