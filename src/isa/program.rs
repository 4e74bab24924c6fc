//! The `Program` aggregate (§3): a compiled ISA program plus the memory-map
//! hints and estimates the executor and reporting layer need. Produced
//! once by the program builder, immutable thereafter, executable many
//! times against different argument bases.

use serde::{Deserialize, Serialize};

use crate::isa::instruction::Instruction;
use crate::types::{Address, Size};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dims {
    pub m: usize,
    pub n: usize,
    pub k: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tiles {
    pub ti: usize,
    pub tj: usize,
    pub tk: usize,
    pub l1_ki: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataflowTag {
    OutputStationary,
    WeightStationary,
    InputStationary,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocSpan {
    pub instance_id: u32,
    pub offset: Address,
    pub size: Size,
    pub label: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryMap {
    pub a_base: Address,
    pub b_base: Address,
    pub c_base: Address,
    /// Per-matrix base within the L3Tile instance's own address space,
    /// mirroring `a_base`/`b_base`/`c_base` for External: `LoadTile`'s
    /// `l3_offset` is relative to whichever matrix it names, so without
    /// these A/B/C tiles would all land at the same L3 bytes.
    pub l3_a_base: Address,
    pub l3_b_base: Address,
    pub l3_c_base: Address,
    pub bias_base: Option<Address>,
    /// Fixed L1 address of the fabric's output PSUM, shared by every
    /// `(ti,tj)` block (one output tile is resident at a time; the same
    /// address is where `DRAIN_OUTPUT*` later reads from). The executor
    /// accumulates the fabric's per-`tk` partial product here instead of
    /// routing it through a streamer field that already names a different
    /// tile.
    pub psum_l1_addr: Address,
    pub l3_allocs: Vec<AllocSpan>,
    pub l2_allocs: Vec<AllocSpan>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Estimates {
    pub total_cycles: u64,
    pub external_bytes: u64,
    pub l3_bytes: u64,
    pub l2_bytes: u64,
    pub arith_intensity: f64,
    pub gflops: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Program {
    pub name: String,
    pub dims: Dims,
    pub tiles: Tiles,
    pub dataflow_tag: DataflowTag,
    pub instructions: Vec<Instruction>,
    pub memory_map: MemoryMap,
    pub estimates: Estimates,
}

impl Program {
    /// Invariant 2 over the whole program: no instruction's deps reference
    /// a higher instruction id.
    pub fn deps_well_ordered(&self) -> bool {
        self.instructions.iter().all(Instruction::deps_are_well_ordered)
    }

    pub fn instruction(&self, id: u32) -> Option<&Instruction> {
        self.instructions.iter().find(|i| i.instruction_id == id)
    }

    pub fn next_instruction_id(&self) -> u32 {
        self.instructions
            .iter()
            .map(|i| i.instruction_id)
            .max()
            .map(|m| m + 1)
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::isa::instruction::{ControlOperands, Opcode, Operands};

    fn program_with(ids_and_deps: &[(u32, &[u32])]) -> Program {
        let instructions = ids_and_deps
            .iter()
            .map(|(id, deps)| {
                Instruction::new(*id, Opcode::Nop, Operands::Control(ControlOperands::default()), "n")
                    .with_deps(deps.iter().copied())
            })
            .collect();
        Program {
            name: "p".into(),
            dims: Dims { m: 1, n: 1, k: 1 },
            tiles: Tiles {
                ti: 1,
                tj: 1,
                tk: 1,
                l1_ki: 1,
            },
            dataflow_tag: DataflowTag::OutputStationary,
            instructions,
            memory_map: MemoryMap::default(),
            estimates: Estimates::default(),
        }
    }

    #[test]
    fn well_ordered_program_passes() {
        let p = program_with(&[(0, &[]), (1, &[0]), (2, &[0, 1])]);
        assert!(p.deps_well_ordered());
    }

    #[test]
    fn forward_reference_fails() {
        let p = program_with(&[(0, &[1]), (1, &[])]);
        assert!(!p.deps_well_ordered());
    }
}
