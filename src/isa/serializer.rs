//! Binary (`.kpubin`) and JSON (`.kpujson`) program codecs (§6). The binary
//! layout is little-endian throughout; magic/version are validated on load
//! and a mismatch is fatal. JSON is a lossless `serde_json` mirror of the
//! same `Program` value.

use std::collections::BTreeSet;
use std::io::{Cursor, Read, Write};

use crate::error::FormatError;
use crate::isa::instruction::{
    Activation, BlockMoverDirection, BlockMoverOperands, ControlOperands, DmaOperands, Instruction,
    Matrix, Opcode, Operands, StreamDirection, StreamType, StreamerOperands, SyncOperands, TileCoord,
    Transform,
};
use crate::isa::program::{AllocSpan, DataflowTag, Dims, Estimates, MemoryMap, Program, Tiles};

pub const MAGIC: u32 = 0x4B50_5544; // "KPUD"
pub const VERSION: u32 = 1;

// ---------------------------------------------------------------- opcodes

fn opcode_to_byte(op: Opcode) -> u8 {
    match op {
        Opcode::LoadTile => 0,
        Opcode::StoreTile => 1,
        Opcode::PrefetchTile => 2,
        Opcode::MoveTile => 3,
        Opcode::TransposeTile => 4,
        Opcode::WritebackTile => 5,
        Opcode::ReshapeTile => 6,
        Opcode::FeedRows => 7,
        Opcode::FeedCols => 8,
        Opcode::DrainOutput => 9,
        Opcode::DrainOutputBiasActivation => 10,
        Opcode::BroadcastRow => 11,
        Opcode::BroadcastCol => 12,
        Opcode::Barrier => 13,
        Opcode::WaitDma => 14,
        Opcode::WaitBm => 15,
        Opcode::WaitStr => 16,
        Opcode::Signal => 17,
        Opcode::SetTileSize => 18,
        Opcode::SetBuffer => 19,
        Opcode::SetStride => 20,
        Opcode::LoopBegin => 21,
        Opcode::LoopEnd => 22,
        Opcode::Nop => 23,
        Opcode::Halt => 24,
    }
}

fn byte_to_opcode(b: u8) -> Result<Opcode, FormatError> {
    Ok(match b {
        0 => Opcode::LoadTile,
        1 => Opcode::StoreTile,
        2 => Opcode::PrefetchTile,
        3 => Opcode::MoveTile,
        4 => Opcode::TransposeTile,
        5 => Opcode::WritebackTile,
        6 => Opcode::ReshapeTile,
        7 => Opcode::FeedRows,
        8 => Opcode::FeedCols,
        9 => Opcode::DrainOutput,
        10 => Opcode::DrainOutputBiasActivation,
        11 => Opcode::BroadcastRow,
        12 => Opcode::BroadcastCol,
        13 => Opcode::Barrier,
        14 => Opcode::WaitDma,
        15 => Opcode::WaitBm,
        16 => Opcode::WaitStr,
        17 => Opcode::Signal,
        18 => Opcode::SetTileSize,
        19 => Opcode::SetBuffer,
        20 => Opcode::SetStride,
        21 => Opcode::LoopBegin,
        22 => Opcode::LoopEnd,
        23 => Opcode::Nop,
        24 => Opcode::Halt,
        other => return Err(FormatError::BadOpcode(other)),
    })
}

// ------------------------------------------------------------- primitives

struct Writer(Vec<u8>);

impl Writer {
    fn u8(&mut self, v: u8) {
        self.0.push(v);
    }
    fn u16(&mut self, v: u16) {
        self.0.extend_from_slice(&v.to_le_bytes());
    }
    fn u32(&mut self, v: u32) {
        self.0.extend_from_slice(&v.to_le_bytes());
    }
    fn u64(&mut self, v: u64) {
        self.0.extend_from_slice(&v.to_le_bytes());
    }
    fn f64(&mut self, v: f64) {
        self.0.extend_from_slice(&v.to_le_bytes());
    }
    fn bytes(&mut self, v: &[u8]) {
        self.0.extend_from_slice(v);
    }
    fn str_field(&mut self, s: &str, len_bytes: usize) {
        match len_bytes {
            2 => self.u16(s.len() as u16),
            4 => self.u32(s.len() as u32),
            _ => unreachable!(),
        }
        self.bytes(s.as_bytes());
    }
}

struct Reader<'a> {
    cursor: Cursor<&'a [u8]>,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self {
            cursor: Cursor::new(data),
        }
    }
    fn u8(&mut self, ctx: &'static str) -> Result<u8, FormatError> {
        let mut b = [0u8; 1];
        self.cursor.read_exact(&mut b).map_err(|_| FormatError::Truncated(ctx))?;
        Ok(b[0])
    }
    fn u16(&mut self, ctx: &'static str) -> Result<u16, FormatError> {
        let mut b = [0u8; 2];
        self.cursor.read_exact(&mut b).map_err(|_| FormatError::Truncated(ctx))?;
        Ok(u16::from_le_bytes(b))
    }
    fn u32(&mut self, ctx: &'static str) -> Result<u32, FormatError> {
        let mut b = [0u8; 4];
        self.cursor.read_exact(&mut b).map_err(|_| FormatError::Truncated(ctx))?;
        Ok(u32::from_le_bytes(b))
    }
    fn u64(&mut self, ctx: &'static str) -> Result<u64, FormatError> {
        let mut b = [0u8; 8];
        self.cursor.read_exact(&mut b).map_err(|_| FormatError::Truncated(ctx))?;
        Ok(u64::from_le_bytes(b))
    }
    fn f64(&mut self, ctx: &'static str) -> Result<f64, FormatError> {
        let mut b = [0u8; 8];
        self.cursor.read_exact(&mut b).map_err(|_| FormatError::Truncated(ctx))?;
        Ok(f64::from_le_bytes(b))
    }
    fn string(&mut self, len: usize, ctx: &'static str) -> Result<String, FormatError> {
        let mut buf = vec![0u8; len];
        self.cursor.read_exact(&mut buf).map_err(|_| FormatError::Truncated(ctx))?;
        String::from_utf8(buf).map_err(|_| FormatError::Truncated(ctx))
    }
}

// --------------------------------------------------------------- encode

pub fn encode_binary(program: &Program) -> Vec<u8> {
    let mut w = Writer(Vec::new());
    w.u32(MAGIC);
    w.u32(VERSION);
    w.str_field(&program.name, 4);
    w.u64(program.dims.m as u64);
    w.u64(program.dims.n as u64);
    w.u64(program.dims.k as u64);
    w.u64(program.tiles.ti as u64);
    w.u64(program.tiles.tj as u64);
    w.u64(program.tiles.tk as u64);
    w.u64(program.tiles.l1_ki as u64);
    w.u8(dataflow_to_byte(program.dataflow_tag));
    w.u32(program.instructions.len() as u32);

    for instr in &program.instructions {
        w.u8(opcode_to_byte(instr.opcode));
        w.u8(operand_tag(&instr.operands));
        w.u32(instr.earliest_cycle as u32);
        w.u32(instr.deadline_cycle.min(u32::MAX as u64) as u32);
        w.u32(instr.instruction_id);
        w.u32(instr.deps.len() as u32);
        for d in &instr.deps {
            w.u32(*d);
        }
        w.str_field(&instr.label, 2);
        encode_operands(&mut w, &instr.operands);
    }

    w.u64(program.memory_map.a_base);
    w.u64(program.memory_map.b_base);
    w.u64(program.memory_map.c_base);
    w.u64(program.memory_map.l3_a_base);
    w.u64(program.memory_map.l3_b_base);
    w.u64(program.memory_map.l3_c_base);
    match program.memory_map.bias_base {
        Some(addr) => {
            w.u8(1);
            w.u64(addr);
        }
        None => {
            w.u8(0);
            w.u64(0);
        }
    }
    w.u64(program.memory_map.psum_l1_addr);
    w.u32(program.memory_map.l3_allocs.len() as u32);
    for a in &program.memory_map.l3_allocs {
        encode_alloc(&mut w, a);
    }
    w.u32(program.memory_map.l2_allocs.len() as u32);
    for a in &program.memory_map.l2_allocs {
        encode_alloc(&mut w, a);
    }

    w.u64(program.estimates.total_cycles);
    w.u64(program.estimates.external_bytes);
    w.u64(program.estimates.l3_bytes);
    w.u64(program.estimates.l2_bytes);
    w.f64(program.estimates.arith_intensity);
    w.f64(program.estimates.gflops);

    w.0
}

fn encode_alloc(w: &mut Writer, a: &AllocSpan) {
    w.u32(a.instance_id);
    w.u64(a.offset);
    w.u64(a.size);
    w.str_field(&a.label, 2);
}

fn dataflow_to_byte(d: DataflowTag) -> u8 {
    match d {
        DataflowTag::OutputStationary => 0,
        DataflowTag::WeightStationary => 1,
        DataflowTag::InputStationary => 2,
    }
}

fn byte_to_dataflow(b: u8) -> Result<DataflowTag, FormatError> {
    Ok(match b {
        0 => DataflowTag::OutputStationary,
        1 => DataflowTag::WeightStationary,
        2 => DataflowTag::InputStationary,
        _ => return Err(FormatError::BadDataflowTag(b)),
    })
}

fn operand_tag(o: &Operands) -> u8 {
    match o {
        Operands::Dma(_) => 0,
        Operands::BlockMover(_) => 1,
        Operands::Streamer(_) => 2,
        Operands::Sync(_) => 3,
        Operands::Control(_) => 4,
    }
}

fn encode_operands(w: &mut Writer, o: &Operands) {
    match o {
        Operands::Dma(d) => {
            w.u8(match d.matrix {
                Matrix::A => 0,
                Matrix::B => 1,
                Matrix::C => 2,
            });
            w.u64(d.tile_coord.ti as u64);
            w.u64(d.tile_coord.tj as u64);
            w.u64(d.tile_coord.tk as u64);
            w.u64(d.l3_offset);
            w.u64(d.size);
            w.u8(d.buffer_slot);
        }
        Operands::BlockMover(b) => {
            w.u32(b.src_id);
            w.u64(b.src_offset);
            w.u32(b.dst_id);
            w.u64(b.dst_offset);
            w.u64(b.height as u64);
            w.u64(b.width as u64);
            w.u64(b.element_size);
            w.u8(match b.transform {
                Transform::Identity => 0,
                Transform::Transpose => 1,
                Transform::BlockReshape => 2,
            });
            w.u8(match b.direction {
                BlockMoverDirection::L3ToL2 => 0,
                BlockMoverDirection::L2ToL3 => 1,
            });
        }
        Operands::Streamer(s) => {
            w.u32(s.l2_id);
            w.u64(s.l2_addr);
            w.u32(s.l1_id);
            w.u64(s.l1_addr);
            w.u64(s.height as u64);
            w.u64(s.width as u64);
            w.u64(s.fabric_size as u64);
            w.u8(match s.direction {
                StreamDirection::L2ToL1 => 0,
                StreamDirection::L1ToL2 => 1,
            });
            w.u8(match s.stream_type {
                StreamType::Row => 0,
                StreamType::Col => 1,
            });
            match s.bias_addr {
                Some(addr) => {
                    w.u8(1);
                    w.u64(addr);
                }
                None => {
                    w.u8(0);
                    w.u64(0);
                }
            }
            w.u8(activation_to_byte(s.activation));
        }
        Operands::Sync(s) => match s.mask {
            Some(m) => {
                w.u8(1);
                w.u32(m);
            }
            None => {
                w.u8(0);
                w.u32(0);
            }
        },
        Operands::Control(c) => match c.value {
            Some(v) => {
                w.u8(1);
                w.u64(v);
            }
            None => {
                w.u8(0);
                w.u64(0);
            }
        },
    }
}

fn activation_to_byte(a: Activation) -> u8 {
    match a {
        Activation::None => 0,
        Activation::ReLU => 1,
        Activation::GELU => 2,
        Activation::Sigmoid => 3,
        Activation::Tanh => 4,
        Activation::SiLU => 5,
        Activation::Softplus => 6,
        Activation::LeakyReLU => 7,
    }
}

fn byte_to_activation(b: u8) -> Result<Activation, FormatError> {
    Ok(match b {
        0 => Activation::None,
        1 => Activation::ReLU,
        2 => Activation::GELU,
        3 => Activation::Sigmoid,
        4 => Activation::Tanh,
        5 => Activation::SiLU,
        6 => Activation::Softplus,
        7 => Activation::LeakyReLU,
        _ => return Err(FormatError::BadActivation(b)),
    })
}

// --------------------------------------------------------------- decode

pub fn decode_binary(data: &[u8]) -> Result<Program, FormatError> {
    let mut r = Reader::new(data);
    let magic = r.u32("magic")?;
    if magic != MAGIC {
        return Err(FormatError::BadMagic(magic));
    }
    let version = r.u32("version")?;
    if version != VERSION {
        return Err(FormatError::UnsupportedVersion(version));
    }
    let name_len = r.u32("name_len")? as usize;
    let name = r.string(name_len, "name")?;

    let dims = Dims {
        m: r.u64("M")? as usize,
        n: r.u64("N")? as usize,
        k: r.u64("K")? as usize,
    };
    let tiles = Tiles {
        ti: r.u64("Ti")? as usize,
        tj: r.u64("Tj")? as usize,
        tk: r.u64("Tk")? as usize,
        l1_ki: r.u64("L1_Ki")? as usize,
    };
    let dataflow_tag = byte_to_dataflow(r.u8("dataflow")?)?;
    let num_instr = r.u32("num_instr")?;

    let mut instructions = Vec::with_capacity(num_instr as usize);
    for _ in 0..num_instr {
        let opcode = byte_to_opcode(r.u8("opcode")?)?;
        let operand_type = r.u8("operand_type")?;
        let earliest_cycle = r.u32("earliest")? as u64;
        let deadline_cycle = r.u32("deadline")? as u64;
        let instruction_id = r.u32("id")?;
        let num_deps = r.u32("num_deps")?;
        let mut deps = BTreeSet::new();
        for _ in 0..num_deps {
            deps.insert(r.u32("dep")?);
        }
        let label_len = r.u16("label_len")? as usize;
        let label = r.string(label_len, "label")?;
        let operands = decode_operands(&mut r, operand_type)?;
        instructions.push(Instruction {
            instruction_id,
            opcode,
            earliest_cycle,
            deadline_cycle,
            deps,
            label,
            operands,
        });
    }

    let a_base = r.u64("a_base")?;
    let b_base = r.u64("b_base")?;
    let c_base = r.u64("c_base")?;
    let l3_a_base = r.u64("l3_a_base")?;
    let l3_b_base = r.u64("l3_b_base")?;
    let l3_c_base = r.u64("l3_c_base")?;
    let has_bias_base = r.u8("has_bias_base")?;
    let bias_base_val = r.u64("bias_base")?;
    let bias_base = if has_bias_base == 1 { Some(bias_base_val) } else { None };
    let psum_l1_addr = r.u64("psum_l1_addr")?;
    let num_l3 = r.u32("num_l3")?;
    let mut l3_allocs = Vec::with_capacity(num_l3 as usize);
    for _ in 0..num_l3 {
        l3_allocs.push(decode_alloc(&mut r)?);
    }
    let num_l2 = r.u32("num_l2")?;
    let mut l2_allocs = Vec::with_capacity(num_l2 as usize);
    for _ in 0..num_l2 {
        l2_allocs.push(decode_alloc(&mut r)?);
    }

    let estimates = Estimates {
        total_cycles: r.u64("total_cycles")?,
        external_bytes: r.u64("ext_bytes")?,
        l3_bytes: r.u64("l3_bytes")?,
        l2_bytes: r.u64("l2_bytes")?,
        arith_intensity: r.f64("arith_intensity")?,
        gflops: r.f64("est_gflops")?,
    };

    Ok(Program {
        name,
        dims,
        tiles,
        dataflow_tag,
        instructions,
        memory_map: MemoryMap {
            a_base,
            b_base,
            c_base,
            l3_a_base,
            l3_b_base,
            l3_c_base,
            bias_base,
            psum_l1_addr,
            l3_allocs,
            l2_allocs,
        },
        estimates,
    })
}

fn decode_alloc(r: &mut Reader) -> Result<AllocSpan, FormatError> {
    let instance_id = r.u32("alloc.instance_id")?;
    let offset = r.u64("alloc.offset")?;
    let size = r.u64("alloc.size")?;
    let label_len = r.u16("alloc.label_len")? as usize;
    let label = r.string(label_len, "alloc.label")?;
    Ok(AllocSpan {
        instance_id,
        offset,
        size,
        label,
    })
}

fn decode_operands(r: &mut Reader, tag: u8) -> Result<Operands, FormatError> {
    Ok(match tag {
        0 => {
            let matrix = match r.u8("matrix")? {
                0 => Matrix::A,
                1 => Matrix::B,
                _ => Matrix::C,
            };
            let tile_coord = TileCoord {
                ti: r.u64("ti")? as usize,
                tj: r.u64("tj")? as usize,
                tk: r.u64("tk")? as usize,
            };
            Operands::Dma(DmaOperands {
                matrix,
                tile_coord,
                l3_offset: r.u64("l3_offset")?,
                size: r.u64("size")?,
                buffer_slot: r.u8("buffer_slot")?,
            })
        }
        1 => Operands::BlockMover(BlockMoverOperands {
            src_id: r.u32("src_id")?,
            src_offset: r.u64("src_offset")?,
            dst_id: r.u32("dst_id")?,
            dst_offset: r.u64("dst_offset")?,
            height: r.u64("height")? as usize,
            width: r.u64("width")? as usize,
            element_size: r.u64("element_size")?,
            transform: match r.u8("transform")? {
                0 => Transform::Identity,
                1 => Transform::Transpose,
                _ => Transform::BlockReshape,
            },
            direction: match r.u8("direction")? {
                0 => BlockMoverDirection::L3ToL2,
                _ => BlockMoverDirection::L2ToL3,
            },
        }),
        2 => {
            let l2_id = r.u32("l2_id")?;
            let l2_addr = r.u64("l2_addr")?;
            let l1_id = r.u32("l1_id")?;
            let l1_addr = r.u64("l1_addr")?;
            let height = r.u64("height")? as usize;
            let width = r.u64("width")? as usize;
            let fabric_size = r.u64("fabric_size")? as usize;
            let direction = match r.u8("direction")? {
                0 => StreamDirection::L2ToL1,
                _ => StreamDirection::L1ToL2,
            };
            let stream_type = match r.u8("stream_type")? {
                0 => StreamType::Row,
                _ => StreamType::Col,
            };
            let has_bias = r.u8("has_bias")?;
            let bias_val = r.u64("bias_addr")?;
            let bias_addr = if has_bias == 1 { Some(bias_val) } else { None };
            let activation = byte_to_activation(r.u8("activation")?)?;
            Operands::Streamer(StreamerOperands {
                l2_id,
                l2_addr,
                l1_id,
                l1_addr,
                height,
                width,
                fabric_size,
                direction,
                stream_type,
                bias_addr,
                activation,
            })
        }
        3 => {
            let has_mask = r.u8("has_mask")?;
            let mask_val = r.u32("mask")?;
            Operands::Sync(SyncOperands {
                mask: if has_mask == 1 { Some(mask_val) } else { None },
            })
        }
        4 => {
            let has_value = r.u8("has_value")?;
            let value_val = r.u64("value")?;
            Operands::Control(ControlOperands {
                value: if has_value == 1 { Some(value_val) } else { None },
            })
        }
        other => return Err(FormatError::BadOperandTag(other)),
    })
}

// ---------------------------------------------------------------- json

pub fn encode_json(program: &Program) -> Result<String, FormatError> {
    Ok(serde_json::to_string_pretty(program)?)
}

pub fn decode_json(data: &str) -> Result<Program, FormatError> {
    Ok(serde_json::from_str(data)?)
}

fn write_file(path: &std::path::Path, data: &[u8]) -> Result<(), FormatError> {
    let mut f = std::fs::File::create(path)?;
    f.write_all(data)?;
    Ok(())
}

pub fn save_binary(program: &Program, path: &std::path::Path) -> Result<(), FormatError> {
    write_file(path, &encode_binary(program))
}

pub fn load_binary(path: &std::path::Path) -> Result<Program, FormatError> {
    let mut data = Vec::new();
    std::fs::File::open(path)?.read_to_end(&mut data)?;
    decode_binary(&data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::{KernelCompiler, MatmulOptions};
    use crate::isa::instruction::Opcode;

    fn sample_program() -> Program {
        let instructions = vec![
            Instruction::new(
                0,
                Opcode::LoadTile,
                Operands::Dma(DmaOperands {
                    matrix: Matrix::A,
                    tile_coord: TileCoord { ti: 1, tj: 2, tk: 3 },
                    l3_offset: 0x100,
                    size: 4096,
                    buffer_slot: 2,
                }),
                "load_a_0_0",
            ),
            Instruction::new(
                1,
                Opcode::Barrier,
                Operands::Sync(SyncOperands { mask: None }),
                "barrier",
            )
            .with_deps([0]),
            Instruction::new(
                2,
                Opcode::Halt,
                Operands::Control(ControlOperands::default()),
                "halt",
            )
            .with_deps([1]),
        ];
        Program {
            name: "matmul_16x16x16".into(),
            dims: Dims { m: 16, n: 16, k: 16 },
            tiles: Tiles {
                ti: 16,
                tj: 16,
                tk: 16,
                l1_ki: 16,
            },
            dataflow_tag: DataflowTag::OutputStationary,
            instructions,
            memory_map: MemoryMap {
                a_base: 0,
                b_base: 0x1000,
                c_base: 0x2000,
                l3_a_base: 0,
                l3_b_base: 0x1000,
                l3_c_base: 0x2000,
                bias_base: None,
                psum_l1_addr: 0,
                l3_allocs: vec![AllocSpan {
                    instance_id: 0,
                    offset: 0,
                    size: 4096,
                    label: "a_tile".into(),
                }],
                l2_allocs: vec![],
            },
            estimates: Estimates {
                total_cycles: 4096,
                external_bytes: 8192,
                l3_bytes: 4096,
                l2_bytes: 4096,
                arith_intensity: 2.0,
                gflops: 12.5,
            },
        }
    }

    /// Uses a compiled MLP rather than `sample_program()` because it's the
    /// only fixture with a non-`None` `bias_base` and a non-zero
    /// `psum_l1_addr` — the two fields a prior bug silently dropped on the
    /// binary path without any test noticing.
    fn mlp_program() -> Program {
        let mut compiler = KernelCompiler::new();
        compiler
            .compile_mlp(32, 64, 128, Activation::ReLU, true, MatmulOptions::default())
            .unwrap()
            .program
    }

    #[test]
    fn binary_round_trips() {
        let p = mlp_program();
        assert!(p.memory_map.bias_base.is_some());
        assert_ne!(p.memory_map.psum_l1_addr, 0);
        let bytes = encode_binary(&p);
        let back = decode_binary(&bytes).unwrap();
        assert_eq!(p, back);
    }

    #[test]
    fn json_round_trips() {
        let p = mlp_program();
        let json = encode_json(&p).unwrap();
        let back = decode_json(&json).unwrap();
        assert_eq!(p, back);
    }

    #[test]
    fn bad_magic_is_fatal() {
        let mut bytes = encode_binary(&sample_program());
        bytes[0] = 0xFF;
        assert!(matches!(decode_binary(&bytes), Err(FormatError::BadMagic(_))));
    }

    #[test]
    fn truncated_file_is_an_error() {
        let bytes = encode_binary(&sample_program());
        let truncated = &bytes[..bytes.len() - 10];
        assert!(decode_binary(truncated).is_err());
    }
}
