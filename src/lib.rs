//! A cycle-accurate simulator for a Knowledge Processing Unit (KPU): the
//! data-movement ISA and its two executors, the kernel compiler that lowers
//! matmul/MLP descriptions into ISA programs, and the per-cycle datapath
//! components (address decoder, memory buffers, DMA/Block Mover/Streamer/
//! compute-fabric engines) those programs run against.

pub mod compiler;
pub mod decoder;
pub mod engines;
pub mod error;
pub mod executor;
pub mod hardware;
pub mod isa;
pub mod memory;
pub mod trace;
pub mod types;

pub use compiler::{Kernel, KernelCompiler, KernelGraph, ProgramBuilder};
pub use decoder::AddressDecoder;
pub use error::{AllocError, CompileError, DecodeError, EngineError, ExecError, FormatError, GraphError};
pub use executor::{ConcurrentEstimator, SequentialExecutor};
pub use hardware::{HardwareConfig, HardwareContext};
pub use isa::{Instruction, Opcode, Program};
pub use types::{Address, ComponentType, Cycle, DataType, MemoryKind, Size};
