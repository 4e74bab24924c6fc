//! Sequential executor (§4.9): walks a `Program`'s instructions in id order,
//! dispatching the next instruction whose dependencies are satisfied one at
//! a time per `step()`, and advancing the hardware by one cycle each call —
//! the teacher's per-cycle `run()` loop idiom generalized from its fixed
//! pipeline to a dependency-ordered instruction stream.
//!
//! The tagged ISA has no explicit compute opcode: physically, accumulation
//! happens inside the fabric as a side effect of feeding operands. This
//! executor triggers the compute engine when a `FEED_COLS` instruction is
//! dispatched, pairing it with the most recently dispatched `FEED_ROWS`
//! (output-stationary lowering always emits rows-then-cols for the same
//! tile) and routing the result into the `FEED_COLS` instruction's own L2
//! destination, reusing that field as the PSUM landing site. Both the
//! streamer copy and the compute job share the `FEED_COLS` instruction's
//! id as their completion token, so the `DRAIN_OUTPUT*` instruction that
//! depends on it only unblocks once both have retired.

use std::collections::{BTreeSet, HashMap};

use crate::engines::MatmulJobSpec;
use crate::error::ExecError;
use crate::hardware::HardwareContext;
use crate::isa::instruction::{Activation, Instruction, Matrix, Opcode, Operands, StreamerOperands};
use crate::isa::program::{MemoryMap, Program};
use crate::memory::resource::ResourceManager;
use crate::types::{Cycle, MemoryKind};

/// Resolves the External-buffer-relative address a `DmaOperands.l3_offset`
/// corresponds to: tiles are laid out at the same relative offset in both
/// External and L3Tile (the program builder guarantees this), so the
/// matrix's base address plus the tile-relative offset gives the External
/// side without needing a second address field on the instruction. This is
/// an offset within the External buffer, not yet a flat global address.
fn external_addr_for(map: &MemoryMap, matrix: Matrix, l3_offset: u64) -> u64 {
    let base = match matrix {
        Matrix::A => map.a_base,
        Matrix::B => map.b_base,
        Matrix::C => map.c_base,
    };
    base + l3_offset
}

/// Mirrors `external_addr_for` but resolves the offset within the L3Tile
/// instance's own address space instead of External's: A, B and C each get
/// a disjoint L3 region (`MemoryMap::l3_{a,b,c}_base`), so the same
/// `l3_offset` that's relative to `matrix`'s region doesn't collide with
/// the other two matrices' tiles at the same relative offset.
fn l3_addr_for(map: &MemoryMap, matrix: Matrix, l3_offset: u64) -> u64 {
    let base = match matrix {
        Matrix::A => map.l3_a_base,
        Matrix::B => map.l3_b_base,
        Matrix::C => map.l3_c_base,
    };
    base + l3_offset
}

/// Both `DmaOperands.l3_offset` and `external_addr_for`'s result are
/// offsets relative to their own buffer's start, not flat addresses in the
/// decoder's global space (which places `External`/`L3Tile` after whatever
/// regions precede them, e.g. `HostMemory`). The DMA engine's `enqueue`
/// validates against the global decoder, so both sides need their bank's
/// base added before dispatch.
fn global_addr(mgr: &ResourceManager, kind: MemoryKind, instance_id: u32, offset: u64) -> u64 {
    mgr.decoder()
        .base_of(kind, instance_id)
        .unwrap_or_else(|| panic!("{kind:?}{instance_id} not registered in decoder"))
        + offset
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecState {
    Idle,
    Running,
    Waiting,
    Completed,
    Error,
}

pub struct SequentialExecutor {
    program: Program,
    hw: HardwareContext,
    next_index: usize,
    completed: BTreeSet<u32>,
    remaining_for: HashMap<u32, u32>,
    last_feed_rows: Option<StreamerOperands>,
    /// Number of `FEED_COLS`-triggered compute jobs issued since the last
    /// drain: `0` means the next one overwrites the PSUM, anything higher
    /// means it accumulates into it.
    psum_tk_count: u32,
    state: ExecState,
    cycle_budget: Cycle,
}

impl SequentialExecutor {
    pub fn new(program: Program, hw: HardwareContext, cycle_budget: Cycle) -> Self {
        let mut instructions_sorted = program.instructions.clone();
        instructions_sorted.sort_by_key(|i| i.instruction_id);
        let program = Program {
            instructions: instructions_sorted,
            ..program
        };
        Self {
            program,
            hw,
            next_index: 0,
            completed: BTreeSet::new(),
            remaining_for: HashMap::new(),
            last_feed_rows: None,
            psum_tk_count: 0,
            state: ExecState::Idle,
            cycle_budget,
        }
    }

    pub fn state(&self) -> ExecState {
        self.state
    }

    pub fn hardware(&self) -> &HardwareContext {
        &self.hw
    }

    pub fn hardware_mut(&mut self) -> &mut HardwareContext {
        &mut self.hw
    }

    pub fn is_done(&self) -> bool {
        matches!(self.state, ExecState::Completed | ExecState::Error)
    }

    fn deps_satisfied(&self, instr: &Instruction) -> bool {
        instr.deps.iter().all(|d| self.completed.contains(d))
    }

    fn mark_retirement(&mut self, id: u32) {
        let remaining = self.remaining_for.entry(id).or_insert(1);
        *remaining = remaining.saturating_sub(1);
        if *remaining == 0 {
            self.completed.insert(id);
        }
    }

    fn require_remaining(&mut self, id: u32, count: u32) {
        self.remaining_for.insert(id, count);
    }

    /// Dispatches at most one ready instruction into its engine's queue (or
    /// completes it instantly for sync/control ops). Returns `true` if an
    /// instruction was dispatched.
    fn try_dispatch(&mut self) -> Result<bool, ExecError> {
        if self.next_index >= self.program.instructions.len() {
            return Ok(false);
        }
        let instr = self.program.instructions[self.next_index].clone();
        if !self.deps_satisfied(&instr) {
            return Ok(false);
        }

        match &instr.operands {
            Operands::Dma(d) => {
                let external_rel = external_addr_for(&self.program.memory_map, d.matrix, d.l3_offset);
                let external = global_addr(self.hw.resources(), MemoryKind::External, 0, external_rel);
                let l3_rel = l3_addr_for(&self.program.memory_map, d.matrix, d.l3_offset);
                let l3 = global_addr(self.hw.resources(), MemoryKind::L3Tile, 0, l3_rel);
                let (src, dst) = match instr.opcode {
                    Opcode::StoreTile => (l3, external),
                    _ => (external, l3),
                };
                self.hw.enqueue_dma(src, dst, d.size, Some(instr.instruction_id))?;
            }
            Operands::BlockMover(b) => {
                self.hw.block_mover.enqueue(*b, Some(instr.instruction_id))?;
            }
            Operands::Streamer(s) => {
                self.hw.enqueue_streamer(*s, Some(instr.instruction_id))?;
                if instr.opcode == Opcode::FeedRows {
                    self.last_feed_rows = Some(*s);
                } else if instr.opcode == Opcode::FeedCols {
                    if let Some(rows) = self.last_feed_rows.take() {
                        // the paired FeedRows/FeedCols tile shapes give the
                        // per-tile matmul dims directly; no need to touch
                        // the whole-problem `Program.dims`. The PSUM lands
                        // in L1 at the program's fixed output slot, where
                        // DRAIN_OUTPUT* reads it back from; every tk after
                        // the first for a given (ti,tj) accumulates into it
                        // instead of overwriting the prior tk's partial sum.
                        let spec = MatmulJobSpec {
                            a_l1_id: rows.l1_id,
                            a_addr: rows.l1_addr,
                            b_l1_id: s.l1_id,
                            b_addr: s.l1_addr,
                            out_l1_id: s.l1_id,
                            out_addr: self.program.memory_map.psum_l1_addr,
                            m: rows.height,
                            n: s.width,
                            k: rows.width,
                            bias_addr: None,
                            activation: Activation::None,
                            accumulate: self.psum_tk_count > 0,
                        };
                        self.psum_tk_count += 1;
                        self.hw.compute.enqueue(spec, Some(instr.instruction_id))?;
                        self.require_remaining(instr.instruction_id, 2);
                    }
                } else if matches!(instr.opcode, Opcode::DrainOutput | Opcode::DrainOutputBiasActivation) {
                    self.psum_tk_count = 0;
                }
            }
            Operands::Sync(_) => {
                let ready = match instr.opcode {
                    Opcode::Barrier => !self.hw.any_engine_busy(),
                    Opcode::WaitDma => !self.hw.dma.is_busy(),
                    Opcode::WaitBm => !self.hw.block_mover.is_busy(),
                    Opcode::WaitStr => !self.hw.streamer.is_busy(),
                    Opcode::Signal => true,
                    _ => true,
                };
                if !ready {
                    self.state = ExecState::Waiting;
                    return Ok(false);
                }
                self.completed.insert(instr.instruction_id);
            }
            Operands::Control(_) => {
                if instr.opcode == Opcode::Halt {
                    self.state = ExecState::Completed;
                }
                self.completed.insert(instr.instruction_id);
            }
        }

        self.next_index += 1;
        Ok(true)
    }

    /// Advances the hardware by one cycle, retires any instructions whose
    /// engine jobs completed, and dispatches the next ready instruction (if
    /// any). Call repeatedly until `is_done()`.
    pub fn step(&mut self) -> Result<(), ExecError> {
        if self.is_done() {
            return Ok(());
        }
        self.state = ExecState::Running;

        for id in self.hw.step() {
            self.mark_retirement(id);
        }

        let dispatched = self.try_dispatch()?;

        if self.next_index >= self.program.instructions.len() && !self.hw.any_engine_busy() {
            self.state = ExecState::Completed;
        } else if !dispatched && self.state != ExecState::Completed {
            self.state = ExecState::Waiting;
        }

        if self.hw.cycle() > self.cycle_budget {
            self.state = ExecState::Error;
            return Err(ExecError::CycleBudgetExhausted(self.cycle_budget));
        }
        Ok(())
    }

    /// Runs to completion or error, bounded by `cycle_budget`.
    pub fn run(&mut self) -> Result<(), ExecError> {
        while !self.is_done() {
            self.step()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::HardwareConfig;
    use crate::isa::instruction::ControlOperands;
    use crate::isa::program::{DataflowTag, Dims, Estimates, Tiles};

    fn trivial_program() -> Program {
        Program {
            name: "nop_halt".into(),
            dims: Dims { m: 1, n: 1, k: 1 },
            tiles: Tiles { ti: 1, tj: 1, tk: 1, l1_ki: 1 },
            dataflow_tag: DataflowTag::OutputStationary,
            instructions: vec![
                Instruction::new(0, Opcode::Nop, Operands::Control(ControlOperands::default()), "n0"),
                Instruction::new(1, Opcode::Halt, Operands::Control(ControlOperands::default()), "halt").with_deps([0]),
            ],
            memory_map: MemoryMap::default(),
            estimates: Estimates::default(),
        }
    }

    #[test]
    fn runs_nop_then_halts() {
        let hw = HardwareContext::new(HardwareConfig::default());
        let mut exec = SequentialExecutor::new(trivial_program(), hw, 1000);
        exec.run().unwrap();
        assert_eq!(exec.state(), ExecState::Completed);
    }

    #[test]
    fn load_tile_resolves_external_and_l3_bases_through_the_decoder() {
        use crate::isa::instruction::{DmaOperands, Matrix, TileCoord};

        let mut hw = HardwareContext::new(HardwareConfig::default());
        let external_base = hw.resources().decoder().base_of(MemoryKind::External, 0).unwrap();
        let l3_base = hw.resources().decoder().base_of(MemoryKind::L3Tile, 0).unwrap();
        assert_ne!(external_base, 0, "External must not sit at address 0 behind HostMemory");
        hw.resources_mut().write(external_base, &[9, 8, 7, 6]).unwrap();

        let program = Program {
            name: "load_one_tile".into(),
            dims: Dims { m: 1, n: 1, k: 1 },
            tiles: Tiles { ti: 1, tj: 1, tk: 1, l1_ki: 1 },
            dataflow_tag: DataflowTag::OutputStationary,
            instructions: vec![Instruction::new(
                0,
                Opcode::LoadTile,
                Operands::Dma(DmaOperands {
                    matrix: Matrix::A,
                    tile_coord: TileCoord { ti: 0, tj: 0, tk: 0 },
                    l3_offset: 0,
                    size: 4,
                    buffer_slot: 0,
                }),
                "load_a",
            )],
            memory_map: MemoryMap::default(),
            estimates: Estimates::default(),
        };

        let mut exec = SequentialExecutor::new(program, hw, 1000);
        exec.run().unwrap();
        assert_eq!(exec.state(), ExecState::Completed);
        assert_eq!(exec.hardware_mut().resources_mut().read(l3_base, 4).unwrap(), vec![9, 8, 7, 6]);
    }

    #[test]
    fn cycle_budget_exhaustion_is_an_error() {
        let mut dma_only = trivial_program();
        // a dep on a never-dispatched id makes the program unsatisfiable.
        dma_only.instructions[1] = dma_only.instructions[1].clone().with_deps([99]);
        let hw = HardwareContext::new(HardwareConfig::default());
        let mut exec = SequentialExecutor::new(dma_only, hw, 4);
        let err = exec.run().unwrap_err();
        assert!(matches!(err, ExecError::CycleBudgetExhausted(4)));
    }
}
