//! Output-stationary program builder (§4.12): lowers `(M, N, K, TileConfig)`
//! into an ISA program via the nested `ti -> tj -> tk` loop the spec
//! describes, consulting the tile cache to elide redundant `LOAD_TILE`s.
//! No teacher call site does this lowering directly (DAM graphs are wired
//! once at construction, not compiled from a loop nest); grounded on spec
//! §4.12 and the already-built `isa::tile_cache::TileCache`.

use std::collections::HashMap;

use crate::isa::instruction::{
    Activation, BlockMoverDirection, BlockMoverOperands, DmaOperands, Instruction, Matrix, Opcode, Operands, StreamDirection, StreamType, StreamerOperands,
    SyncOperands, TileCoord, Transform,
};
use crate::isa::program::{AllocSpan, DataflowTag, Dims, Estimates, MemoryMap, Program, Tiles};
use crate::isa::tile_cache::{TileCache, TileKey};
use crate::types::{Address, DataType, Size};

use super::tile_optimizer::TileConfig;

#[derive(Debug, Clone, Copy)]
pub struct BuildOptions {
    pub dtype: DataType,
    pub has_bias: bool,
    pub activation: Activation,
    pub double_buffering: bool,
    pub fabric_size: usize,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            dtype: DataType::Float32,
            has_bias: false,
            activation: Activation::None,
            double_buffering: true,
            fabric_size: 16,
        }
    }
}

/// Lays out A/B/C (and an optional bias vector) contiguously in the flat
/// External address space, padded to whole tiles. The same padded sizes
/// give each matrix its own non-overlapping base within the L3Tile
/// instance's address space too — `LoadTile`'s per-tile `l3_offset` is
/// relative to whichever matrix it names, so the External and L3 bases are
/// independent (different address spaces) but computed identically.
fn external_layout(dims: Dims, tiles: TileConfig, elem: Size, has_bias: bool) -> MemoryMap {
    let padded_m = dims.m.div_ceil(tiles.ti) * tiles.ti;
    let padded_n = dims.n.div_ceil(tiles.tj) * tiles.tj;
    let padded_k = dims.k.div_ceil(tiles.tk) * tiles.tk;

    let a_base: Address = 0;
    let b_base = a_base + (padded_m * padded_k) as u64 * elem;
    let c_base = b_base + (padded_k * padded_n) as u64 * elem;
    let bias_base = has_bias.then_some(c_base + (padded_m * padded_n) as u64 * elem);

    let l3_a_base: Address = 0;
    let l3_b_base = l3_a_base + (padded_m * padded_k) as u64 * elem;
    let l3_c_base = l3_b_base + (padded_k * padded_n) as u64 * elem;

    MemoryMap {
        a_base,
        b_base,
        c_base,
        l3_a_base,
        l3_b_base,
        l3_c_base,
        bias_base,
        psum_l1_addr: 0,
        l3_allocs: Vec::new(),
        l2_allocs: Vec::new(),
    }
}

pub struct ProgramBuilder {
    next_id: u32,
    instructions: Vec<Instruction>,
    tile_cache: TileCache,
    /// Tracks which `LOAD_TILE` instruction last populated each tile, so a
    /// cache hit can still give its consumer a real dependency edge instead
    /// of none at all.
    tile_producer: HashMap<TileKey, u32>,
    l3_allocs: Vec<AllocSpan>,
    external_bytes: u64,
    l3_bytes: u64,
    l2_bytes: u64,
}

impl ProgramBuilder {
    pub fn new(l3_capacity_bytes: Size) -> Self {
        Self {
            next_id: 0,
            instructions: Vec::new(),
            tile_cache: TileCache::new(l3_capacity_bytes),
            tile_producer: HashMap::new(),
            l3_allocs: Vec::new(),
            external_bytes: 0,
            l3_bytes: 0,
            l2_bytes: 0,
        }
    }

    fn next(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn emit(&mut self, opcode: Opcode, operands: Operands, deps: impl IntoIterator<Item = u32>, label: impl Into<String>) -> u32 {
        let id = self.next();
        self.instructions.push(Instruction::new(id, opcode, operands, label).with_deps(deps));
        id
    }

    /// Loads a tile into L3 if the cache doesn't already hold it, returning
    /// the instruction id downstream consumers must depend on. On a cache
    /// hit that's still the id of whichever `LOAD_TILE` last populated the
    /// tile, not `None` — the consumer still needs to wait on it, it's just
    /// not re-emitted. `l3_offset` is relative to `matrix`'s own region (the
    /// executor resolves both the External and L3 physical addresses from
    /// `matrix` + `l3_offset` against the program's `MemoryMap`, using
    /// different per-matrix bases for each space); `l3_base` is that
    /// matrix's L3-space base, used only for the `l3_allocs` bookkeeping so
    /// it records the tile's real physical span.
    fn load_tile_if_needed(&mut self, matrix: Matrix, coord: TileCoord, l3_offset: Address, l3_base: Address, size: Size, label: String) -> Option<u32> {
        let key = TileKey {
            matrix,
            ti: coord.ti,
            tj: coord.tj,
            tk: coord.tk,
        };
        if self.tile_cache.touch(key, 0) {
            return self.tile_producer.get(&key).copied();
        }
        let id = self.emit(
            Opcode::LoadTile,
            Operands::Dma(DmaOperands {
                matrix,
                tile_coord: coord,
                l3_offset,
                size,
                buffer_slot: 0,
            }),
            [],
            label,
        );
        self.tile_producer.insert(key, id);
        self.tile_cache.insert_after_load(key, size, 0);
        self.l3_allocs.push(AllocSpan {
            instance_id: 0,
            offset: l3_base + l3_offset,
            size,
            label: format!("l3_{matrix:?}_{}_{}", coord.ti, coord.tk.max(coord.tj)),
        });
        self.external_bytes += size;
        Some(id)
    }

    /// Lowers a dense matmul (plus optional fused bias/activation, for
    /// `compile_mlp`) into an output-stationary ISA program.
    pub fn build_matmul(mut self, dims: Dims, tiles: TileConfig, dataflow: DataflowTag, options: BuildOptions) -> Program {
        let elem = options.dtype.size_bytes();
        let memory_map = external_layout(dims, tiles, elem, options.has_bias);

        let num_ti = dims.m.div_ceil(tiles.ti);
        let num_tj = dims.n.div_ceil(tiles.tj);
        let num_tk = dims.k.div_ceil(tiles.tk);

        let a_tile_bytes = (tiles.ti * tiles.tk) as u64 * elem;
        let b_tile_bytes = (tiles.tk * tiles.tj) as u64 * elem;
        let c_tile_bytes = (tiles.ti * tiles.tj) as u64 * elem;

        // fixed L2 layout: A/B double-buffered (if enabled), C resident
        // for the whole (ti,tj) accumulation.
        let db = if options.double_buffering { 2 } else { 1 };
        let l2_a_region: Address = 0;
        let l2_b_region: Address = l2_a_region + db as u64 * a_tile_bytes;
        let l2_c_region: Address = l2_b_region + db as u64 * b_tile_bytes;

        let l1_a_addr: Address = 0;
        let l1_b_addr: Address = l1_a_addr + a_tile_bytes;
        let l1_out_addr: Address = l1_b_addr + b_tile_bytes;

        // All output tiles share one PSUM slot (`memory_map.psum_l1_addr`),
        // so the next tile's first `FEED_COLS` (the one whose triggered
        // compute overwrites rather than accumulates) must not dispatch
        // until the previous tile's drain has read it back out.
        let mut prev_drain: Option<u32> = None;

        for ti in 0..num_ti {
            for tj in 0..num_tj {
                let mut tk_deps: Vec<u32> = Vec::new();

                for tk in 0..num_tk {
                    let slot = if options.double_buffering { tk % 2 } else { 0 };

                    let a_l3_offset = ((ti as u64) * num_tk as u64 + tk as u64) * a_tile_bytes;
                    let a_load = self.load_tile_if_needed(Matrix::A, TileCoord { ti, tj: 0, tk }, a_l3_offset, memory_map.l3_a_base, a_tile_bytes, format!("load_a_{ti}_{tk}"));

                    let b_l3_offset = ((tk as u64) * num_tj as u64 + tj as u64) * b_tile_bytes;
                    let b_load = self.load_tile_if_needed(Matrix::B, TileCoord { ti: 0, tj, tk }, b_l3_offset, memory_map.l3_b_base, b_tile_bytes, format!("load_b_{tk}_{tj}"));

                    let l2_a_addr = l2_a_region + slot as u64 * a_tile_bytes;
                    let move_a = self.emit(
                        Opcode::MoveTile,
                        Operands::BlockMover(BlockMoverOperands {
                            src_id: 0,
                            src_offset: memory_map.l3_a_base + a_l3_offset,
                            dst_id: 0,
                            dst_offset: l2_a_addr,
                            height: tiles.ti,
                            width: tiles.tk,
                            element_size: elem,
                            transform: Transform::Identity,
                            direction: BlockMoverDirection::L3ToL2,
                        }),
                        a_load,
                        format!("move_a_{ti}_{tk}"),
                    );
                    self.l3_bytes += a_tile_bytes;

                    let b_transform = if matches!(dataflow, DataflowTag::WeightStationary) { Transform::Transpose } else { Transform::Identity };
                    let l2_b_addr = l2_b_region + slot as u64 * b_tile_bytes;
                    let move_b = self.emit(
                        Opcode::MoveTile,
                        Operands::BlockMover(BlockMoverOperands {
                            src_id: 0,
                            src_offset: memory_map.l3_b_base + b_l3_offset,
                            dst_id: 0,
                            dst_offset: l2_b_addr,
                            height: tiles.tk,
                            width: tiles.tj,
                            element_size: elem,
                            transform: b_transform,
                            direction: BlockMoverDirection::L3ToL2,
                        }),
                        b_load,
                        format!("move_b_{tk}_{tj}"),
                    );
                    self.l3_bytes += b_tile_bytes;

                    let feed_rows = self.emit(
                        Opcode::FeedRows,
                        Operands::Streamer(StreamerOperands {
                            l2_id: 0,
                            l2_addr: l2_a_addr,
                            l1_id: 0,
                            l1_addr: l1_a_addr,
                            height: tiles.ti,
                            width: tiles.tk,
                            fabric_size: options.fabric_size,
                            direction: StreamDirection::L2ToL1,
                            stream_type: StreamType::Row,
                            bias_addr: None,
                            activation: Activation::None,
                        }),
                        [move_a],
                        format!("feed_rows_{ti}_{tk}"),
                    );
                    self.l2_bytes += a_tile_bytes;

                    let mut feed_cols_deps = vec![move_b, feed_rows];
                    if tk == 0 {
                        feed_cols_deps.extend(prev_drain);
                    }
                    let feed_cols = self.emit(
                        Opcode::FeedCols,
                        Operands::Streamer(StreamerOperands {
                            l2_id: 0,
                            l2_addr: l2_b_addr,
                            l1_id: 0,
                            l1_addr: l1_b_addr,
                            height: tiles.tk,
                            width: tiles.tj,
                            fabric_size: options.fabric_size,
                            direction: StreamDirection::L2ToL1,
                            stream_type: StreamType::Col,
                            bias_addr: None,
                            activation: Activation::None,
                        }),
                        feed_cols_deps,
                        format!("feed_cols_{tk}_{tj}"),
                    );
                    self.l2_bytes += b_tile_bytes;

                    tk_deps.push(feed_cols);

                    if !options.double_buffering && tk + 1 < num_tk {
                        self.emit(Opcode::Barrier, Operands::Sync(SyncOperands::default()), [feed_cols], format!("barrier_{ti}_{tj}_{tk}"));
                    }
                }

                let fused = options.has_bias || !matches!(options.activation, Activation::None);
                let drain_opcode = if fused { Opcode::DrainOutputBiasActivation } else { Opcode::DrainOutput };
                let l2_c_addr = l2_c_region;
                let bias_addr = options.has_bias.then(|| memory_map.bias_base.expect("bias_base set when has_bias") + (tj * tiles.tj) as u64 * elem);
                let drain = self.emit(
                    drain_opcode,
                    Operands::Streamer(StreamerOperands {
                        l2_id: 0,
                        l2_addr: l2_c_addr,
                        l1_id: 0,
                        l1_addr: l1_out_addr,
                        height: tiles.ti,
                        width: tiles.tj,
                        fabric_size: options.fabric_size,
                        direction: StreamDirection::L1ToL2,
                        stream_type: StreamType::Row,
                        bias_addr,
                        activation: options.activation,
                    }),
                    tk_deps,
                    format!("drain_{ti}_{tj}"),
                );
                prev_drain = Some(drain);
                self.l2_bytes += c_tile_bytes;

                let c_l3_offset = ((ti as u64) * num_tj as u64 + tj as u64) * c_tile_bytes;
                let writeback = self.emit(
                    Opcode::WritebackTile,
                    Operands::BlockMover(BlockMoverOperands {
                        src_id: 0,
                        src_offset: l2_c_addr,
                        dst_id: 0,
                        dst_offset: memory_map.l3_c_base + c_l3_offset,
                        height: tiles.ti,
                        width: tiles.tj,
                        element_size: elem,
                        transform: Transform::Identity,
                        direction: BlockMoverDirection::L2ToL3,
                    }),
                    [drain],
                    format!("writeback_{ti}_{tj}"),
                );
                self.l3_bytes += c_tile_bytes;
                self.l3_allocs.push(AllocSpan {
                    instance_id: 0,
                    offset: memory_map.l3_c_base + c_l3_offset,
                    size: c_tile_bytes,
                    label: format!("l3_C_{ti}_{tj}"),
                });

                self.emit(
                    Opcode::StoreTile,
                    Operands::Dma(DmaOperands {
                        matrix: Matrix::C,
                        tile_coord: TileCoord { ti, tj, tk: 0 },
                        l3_offset: c_l3_offset,
                        size: c_tile_bytes,
                        buffer_slot: 0,
                    }),
                    [writeback],
                    format!("store_c_{ti}_{tj}"),
                );
                self.external_bytes += c_tile_bytes;
            }
        }

        let macs = (dims.m * dims.n * dims.k) as u64;
        let total_bytes = (self.external_bytes + self.l3_bytes + self.l2_bytes).max(1);
        let estimates = Estimates {
            total_cycles: 0, // filled in by the concurrent estimator, not the builder
            external_bytes: self.external_bytes,
            l3_bytes: self.l3_bytes,
            l2_bytes: self.l2_bytes,
            arith_intensity: (2 * macs) as f64 / total_bytes as f64,
            gflops: 0.0,
        };

        let mut memory_map = memory_map;
        memory_map.l3_allocs = self.l3_allocs;
        memory_map.psum_l1_addr = l1_out_addr;

        Program {
            name: "matmul".into(),
            dims,
            tiles: Tiles {
                ti: tiles.ti,
                tj: tiles.tj,
                tk: tiles.tk,
                l1_ki: tiles.l1_ki,
            },
            dataflow_tag: dataflow,
            instructions: self.instructions,
            memory_map,
            estimates,
        }
    }
}
