//! The kernel compiler: tile optimizer, output-stationary program builder,
//! and the kernel/kernel-graph façade that wraps compiled programs for
//! callers (§4.11-§4.14).

pub mod kernel;
pub mod kernel_compiler;
pub mod kernel_graph;
pub mod program_builder;
pub mod tile_optimizer;

pub use kernel::{ArgumentRole, CompilationStats, Kernel, KernelArgument, OpKind};
pub use kernel_compiler::{Dataflow, KernelCompiler, MatmulOptions};
pub use kernel_graph::{Edge, FusedPair, KernelGraph, KernelGraphCompileResult, KernelNode, NodeId};
pub use program_builder::{BuildOptions, ProgramBuilder};
pub use tile_optimizer::{Hierarchy, TileConfig, TileStrategy};
