//! Kernel compiler (§4.13): the public entry point gluing the tile
//! optimizer and the program builder together, the way the teacher's
//! `proto_driver` wires a `SimConfig` into a constructed graph — here the
//! "config" is `(M, N, K, dtype, activation, options)` and the constructed
//! graph is an ISA `Program` wrapped in a `Kernel`.

use crate::error::CompileError;
use crate::isa::instruction::Activation;
use crate::isa::program::{DataflowTag, Dims};
use crate::types::{DataType, Size};

use super::kernel::{ArgumentRole, CompilationStats, Kernel, KernelArgument, OpKind};
use super::program_builder::{BuildOptions, ProgramBuilder};
use super::tile_optimizer::{optimize_tiles, Hierarchy, TileConfig, TileStrategy};

/// How `compile_matmul`/`compile_mlp` pick a dataflow when the caller
/// doesn't pin one. `Auto` follows spec §4.13 step 3: output-stationary for
/// square-ish problems, weight-stationary once `K` dwarfs `M` (a tall,
/// narrow weight matrix is cheaper to keep resident and stream `A`/`C`
/// against).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dataflow {
    Auto,
    OutputStationary,
    WeightStationary,
    InputStationary,
}

fn auto_dataflow(dims: Dims) -> DataflowTag {
    if dims.k > dims.m.saturating_mul(4) {
        DataflowTag::WeightStationary
    } else {
        DataflowTag::OutputStationary
    }
}

fn resolve_dataflow(choice: Dataflow, dims: Dims) -> DataflowTag {
    match choice {
        Dataflow::Auto => auto_dataflow(dims),
        Dataflow::OutputStationary => DataflowTag::OutputStationary,
        Dataflow::WeightStationary => DataflowTag::WeightStationary,
        Dataflow::InputStationary => DataflowTag::InputStationary,
    }
}

/// Options accepted by `compile_matmul`/`compile_mlp`. Leaving a `tiles`
/// dimension at `0` (the `Default` value) tells the compiler to run the
/// tile optimizer instead of trusting an explicit shape.
#[derive(Debug, Clone, Copy)]
pub struct MatmulOptions {
    pub dtype: DataType,
    pub tiles: Option<TileConfig>,
    pub dataflow: Dataflow,
    pub double_buffering: bool,
    pub fabric_size: usize,
    pub hierarchy: Hierarchy,
    pub tile_strategy: TileStrategy,
}

impl Default for MatmulOptions {
    fn default() -> Self {
        Self {
            dtype: DataType::Float32,
            tiles: None,
            dataflow: Dataflow::Auto,
            double_buffering: true,
            fabric_size: 16,
            hierarchy: Hierarchy {
                l3_tile_capacity: 2 << 20,
                l2_bank_capacity: 256 << 10,
                l1_buffer_capacity: 64 << 10,
                num_l3: 1,
                num_l2: 4,
                num_l1: 4,
            },
            tile_strategy: TileStrategy::Analytical,
        }
    }
}

fn validate_tiles(tiles: TileConfig) -> Result<(), CompileError> {
    if tiles.ti == 0 || tiles.tj == 0 || tiles.tk == 0 {
        return Err(CompileError::BadTileShape {
            ti: tiles.ti,
            tj: tiles.tj,
            tk: tiles.tk,
        });
    }
    Ok(())
}

/// Stateful only in that it remembers the `CompilationStats` of its most
/// recent compile, mirroring spec §4.13's `last_stats()` accessor — the
/// kernels it produces are otherwise immutable and independent of each
/// other.
#[derive(Debug, Default)]
pub struct KernelCompiler {
    last_stats: Option<CompilationStats>,
}

fn l3_capacity(hierarchy: &Hierarchy) -> Size {
    hierarchy.l3_tile_capacity * hierarchy.num_l3 as u64
}

impl KernelCompiler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_stats(&self) -> Option<CompilationStats> {
        self.last_stats
    }

    fn resolve_tiles(&self, dims: Dims, options: &MatmulOptions) -> Result<TileConfig, CompileError> {
        let tiles = match options.tiles {
            Some(t) => t,
            None => optimize_tiles(dims, options.dtype, &options.hierarchy, options.tile_strategy, options.fabric_size),
        };
        validate_tiles(tiles)?;
        Ok(tiles)
    }

    /// Builds the `A[M,K]`, `B[K,N]`, `C[M,N]` argument list (inserting
    /// `bias[N]` before `C` per invariant 4 when `has_bias`).
    fn arguments(dims: Dims, dtype: DataType, has_bias: bool) -> Vec<KernelArgument> {
        let mut args = vec![
            KernelArgument::new("A", ArgumentRole::Input, dtype, vec![dims.m as Size, dims.k as Size]),
            KernelArgument::new("B", ArgumentRole::Input, dtype, vec![dims.k as Size, dims.n as Size]),
        ];
        if has_bias {
            args.push(KernelArgument::new("bias", ArgumentRole::Bias, dtype, vec![dims.n as Size]));
        }
        args.push(KernelArgument::new("C", ArgumentRole::Output, dtype, vec![dims.m as Size, dims.n as Size]));
        args
    }

    /// `compile_matmul(M, N, K, options)`: resolves tiles (auto-optimizing
    /// on demand), picks a dataflow, builds the program, and wraps it.
    pub fn compile_matmul(&mut self, m: usize, n: usize, k: usize, options: MatmulOptions) -> Result<Kernel, CompileError> {
        let dims = Dims { m, n, k };
        let tiles = self.resolve_tiles(dims, &options)?;
        let dataflow = resolve_dataflow(options.dataflow, dims);

        let build_options = BuildOptions {
            dtype: options.dtype,
            has_bias: false,
            activation: Activation::None,
            double_buffering: options.double_buffering,
            fabric_size: options.fabric_size,
        };
        let program = ProgramBuilder::new(l3_capacity(&options.hierarchy)).build_matmul(dims, tiles, dataflow, build_options);

        self.last_stats = Some(CompilationStats::from_program(&program));

        Ok(Kernel {
            name: "matmul".into(),
            arguments: Self::arguments(dims, options.dtype, false),
            op_kind: OpKind::Matmul,
            dtype: options.dtype,
            activation: Activation::None,
            has_bias: false,
            program,
        })
    }

    /// `compile_mlp(M, N, K, activation, has_bias, options)`: identical to
    /// `compile_matmul` except it inserts `bias[N]` and routes the drain
    /// through the fused vector-engine opcode (`DRAIN_OUTPUT_BIAS_ACTIVATION`).
    pub fn compile_mlp(&mut self, m: usize, n: usize, k: usize, activation: Activation, has_bias: bool, options: MatmulOptions) -> Result<Kernel, CompileError> {
        let dims = Dims { m, n, k };
        let tiles = self.resolve_tiles(dims, &options)?;
        let dataflow = resolve_dataflow(options.dataflow, dims);

        let build_options = BuildOptions {
            dtype: options.dtype,
            has_bias,
            activation,
            double_buffering: options.double_buffering,
            fabric_size: options.fabric_size,
        };
        let program = ProgramBuilder::new(l3_capacity(&options.hierarchy)).build_matmul(dims, tiles, dataflow, build_options);

        self.last_stats = Some(CompilationStats::from_program(&program));

        Ok(Kernel {
            name: "mlp".into(),
            arguments: Self::arguments(dims, options.dtype, has_bias),
            op_kind: OpKind::Mlp,
            dtype: options.dtype,
            activation,
            has_bias,
            program,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::isa::instruction::Opcode;

    #[test]
    fn compile_matmul_auto_tiles_and_populates_stats() {
        let mut compiler = KernelCompiler::new();
        let kernel = compiler.compile_matmul(64, 64, 64, MatmulOptions::default()).unwrap();
        assert_eq!(kernel.op_kind, OpKind::Matmul);
        assert_eq!(kernel.arguments.len(), 3);
        assert!(compiler.last_stats().unwrap().dma_count > 0);
    }

    #[test]
    fn compile_mlp_inserts_bias_before_c_and_fuses_drain() {
        let mut compiler = KernelCompiler::new();
        let kernel = compiler
            .compile_mlp(32, 32, 32, Activation::ReLU, true, MatmulOptions::default())
            .unwrap();
        let names: Vec<_> = kernel.arguments.iter().map(|a| a.name.as_str()).collect();
        assert_eq!(names, vec!["A", "B", "bias", "C"]);
        assert!(kernel.program.instructions.iter().any(|i| i.opcode == Opcode::DrainOutputBiasActivation));
    }

    #[test]
    fn tall_k_selects_weight_stationary_under_auto() {
        let mut compiler = KernelCompiler::new();
        let kernel = compiler.compile_matmul(8, 8, 4096, MatmulOptions::default()).unwrap();
        assert_eq!(kernel.program.dataflow_tag, DataflowTag::WeightStationary);
    }

    #[test]
    fn explicit_zero_tile_dim_is_rejected() {
        let mut compiler = KernelCompiler::new();
        let mut options = MatmulOptions::default();
        options.tiles = Some(TileConfig { ti: 0, tj: 8, tk: 8, l1_ki: 8 });
        let err = compiler.compile_matmul(8, 8, 8, options).unwrap_err();
        assert!(matches!(err, CompileError::BadTileShape { ti: 0, .. }));
    }
}
