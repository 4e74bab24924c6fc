//! Kernel abstraction (§3, §4.13): the public façade wrapping a compiled
//! `Program` with argument metadata and derived cost figures. Grounded on
//! the teacher's pattern of wrapping a built graph in a thin result struct
//! (`step_sim::SimResult` bundling the DAM graph plus run statistics) —
//! generalized here to wrap an ISA `Program` instead of a graph handle.

use crate::isa::program::Program;
use crate::types::{DataType, Size};

/// Which slot a `KernelArgument` occupies in the argument list. Order
/// matters: invariant 4 fixes `A, B, bias, C` for a biased MLP kernel and
/// `A, B, C` otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgumentRole {
    Input,
    Bias,
    Output,
}

/// `(name, dtype, shape, is_output, size_bytes)` — `size_bytes` is always
/// `prod(shape) * dtype.size_bytes()`, computed once at construction so
/// callers never recompute it from `shape`.
#[derive(Debug, Clone, PartialEq)]
pub struct KernelArgument {
    pub name: String,
    pub role: ArgumentRole,
    pub dtype: DataType,
    pub shape: Vec<Size>,
    pub size_bytes: Size,
}

impl KernelArgument {
    pub fn new(name: impl Into<String>, role: ArgumentRole, dtype: DataType, shape: Vec<Size>) -> Self {
        let size_bytes = shape.iter().product::<Size>() * dtype.size_bytes();
        Self {
            name: name.into(),
            role,
            dtype,
            shape,
            size_bytes,
        }
    }

    pub fn is_output(&self) -> bool {
        matches!(self.role, ArgumentRole::Output)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Matmul,
    BatchMatmul,
    Mlp,
    Custom,
}

/// Per-kind instruction counts plus byte-traffic figures, filled in by
/// `KernelCompiler::compile_matmul`/`compile_mlp` and retrievable afterward
/// via `last_stats()`.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CompilationStats {
    pub dma_count: usize,
    pub block_mover_count: usize,
    pub streamer_count: usize,
    pub sync_count: usize,
    pub control_count: usize,
    pub external_bytes: u64,
    pub l3_bytes: u64,
    pub l2_bytes: u64,
    pub arith_intensity: f64,
}

impl CompilationStats {
    pub fn from_program(program: &Program) -> Self {
        use crate::isa::instruction::Opcode;
        let mut stats = CompilationStats {
            external_bytes: program.estimates.external_bytes,
            l3_bytes: program.estimates.l3_bytes,
            l2_bytes: program.estimates.l2_bytes,
            arith_intensity: program.estimates.arith_intensity,
            ..Default::default()
        };
        for instr in &program.instructions {
            if instr.opcode.is_dma() {
                stats.dma_count += 1;
            } else if instr.opcode.is_block_mover() {
                stats.block_mover_count += 1;
            } else if instr.opcode.is_streamer() {
                stats.streamer_count += 1;
            } else if instr.opcode.is_sync() {
                stats.sync_count += 1;
            } else if matches!(instr.opcode, Opcode::Nop | Opcode::Halt) || instr.opcode.is_control() {
                stats.control_count += 1;
            }
        }
        stats
    }
}

/// `(program, op_kind, dtype, arguments, activation?, has_bias)`. Dimensions
/// and tile shape are read straight off the wrapped program rather than
/// duplicated, so a kernel can never disagree with the program it compiled.
#[derive(Debug, Clone, PartialEq)]
pub struct Kernel {
    pub name: String,
    pub program: Program,
    pub op_kind: OpKind,
    pub dtype: DataType,
    pub arguments: Vec<KernelArgument>,
    pub activation: crate::isa::instruction::Activation,
    pub has_bias: bool,
}

impl Kernel {
    pub fn m(&self) -> usize {
        self.program.dims.m
    }
    pub fn n(&self) -> usize {
        self.program.dims.n
    }
    pub fn k(&self) -> usize {
        self.program.dims.k
    }

    pub fn tiles(&self) -> crate::isa::program::Tiles {
        self.program.tiles
    }

    pub fn total_flops(&self) -> u64 {
        2 * (self.program.dims.m * self.program.dims.n * self.program.dims.k) as u64
    }

    pub fn arithmetic_intensity(&self) -> f64 {
        self.program.estimates.arith_intensity
    }

    pub fn argument(&self, name: &str) -> Option<&KernelArgument> {
        self.arguments.iter().find(|a| a.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn argument_size_bytes_is_product_of_shape_and_dtype() {
        let arg = KernelArgument::new("A", ArgumentRole::Input, DataType::Float32, vec![4, 8]);
        assert_eq!(arg.size_bytes, 4 * 8 * 4);
        assert!(!arg.is_output());
    }

    #[test]
    fn output_argument_role_round_trips() {
        let arg = KernelArgument::new("C", ArgumentRole::Output, DataType::Float32, vec![4, 4]);
        assert!(arg.is_output());
    }
}
