//! Crate-wide typed error enums, one per failure category from the error
//! handling design: configuration, decoding, capacity, protocol, program,
//! and format errors never collapse into a single catch-all.

use crate::types::{Address, Size};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("address {0:#x} is not mapped to any region")]
    Unmapped(Address),
    #[error("range [{0:#x}, {1:#x}) crosses more than one region")]
    CrossesRegion(Address, Size),
    #[error("region [{base:#x}, {end:#x}) overlaps existing region [{other_base:#x}, {other_end:#x})")]
    Overlap {
        base: Address,
        end: Address,
        other_base: Address,
        other_end: Address,
    },
    #[error("region size must be non-zero")]
    ZeroSizeRegion,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AllocError {
    #[error("alignment {0} is not a power of two")]
    BadAlignment(Size),
    #[error("address {0:#x} was not allocated by this allocator")]
    ForeignAddress(Address),
    #[error("address {0:#x} is already free")]
    DoubleFree(Address),
    #[error("block size {given} does not match pool block size {expected}")]
    WrongBlockSize { given: Size, expected: Size },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("engine is busy with another operation")]
    Busy,
    #[error("operation has a zero-sized dimension")]
    ZeroDimension,
    #[error("engine queue is full")]
    QueueFull,
    #[error(transparent)]
    Decode(#[from] DecodeError),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExecError {
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error("instruction references unknown instance id {0}")]
    InvalidInstance(u32),
    #[error("tile coordinate ({ti},{tj},{tk}) is out of range")]
    TileCoordOutOfRange { ti: usize, tj: usize, tk: usize },
    #[error("cycle budget of {0} cycles exhausted before program retired")]
    CycleBudgetExhausted(u64),
}

#[derive(Error, Debug)]
pub enum FormatError {
    #[error("bad magic number: expected 0x4B505544, got {0:#010x}")]
    BadMagic(u32),
    #[error("unsupported format version {0}")]
    UnsupportedVersion(u32),
    #[error("file truncated while reading {0}")]
    Truncated(&'static str),
    #[error("unknown opcode byte {0}")]
    BadOpcode(u8),
    #[error("unknown operand tag {0}")]
    BadOperandTag(u8),
    #[error("unknown dataflow tag byte {0}")]
    BadDataflowTag(u8),
    #[error("unknown activation byte {0}")]
    BadActivation(u8),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GraphError {
    #[error("adding edge {from} -> {to} would create a cycle")]
    WouldCreateCycle { from: String, to: String },
    #[error("node {node} has no port named {port}")]
    UnknownPort { node: String, port: String },
    #[error("node id {0} not found in graph")]
    UnknownNode(u32),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CompileError {
    #[error("tile shape ({ti},{tj},{tk}) does not divide the padded problem")]
    BadTileShape { ti: usize, tj: usize, tk: usize },
    #[error(transparent)]
    Graph(#[from] GraphError),
}
