//! The data-movement ISA: instruction set, program aggregate, tile cache,
//! and the binary/JSON program codecs.

pub mod instruction;
pub mod program;
pub mod serializer;
pub mod tile_cache;

pub use instruction::{Instruction, Opcode, Operands};
pub use program::Program;
pub use tile_cache::TileCache;
