//! Datapath engines: one struct per physical engine, each owning a FIFO
//! job queue and a `process(cycle, &mut ResourceManager, &mut TraceLogger)`
//! step function. No engine owns its memory; everything is routed through
//! the shared `ResourceManager` (§9's ownership design note).

pub mod block_mover;
pub mod compute;
pub mod dma;
pub mod sfu;
pub mod streamer;
pub mod vector_engine;

pub use block_mover::BlockMoverEngine;
pub use compute::{ComputeBackend, ComputeEngine, MatmulJobSpec};
pub use dma::DmaEngine;
pub use sfu::Sfu;
pub use streamer::StreamerEngine;
pub use vector_engine::VectorEngine;
