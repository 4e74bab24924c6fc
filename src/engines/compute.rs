//! Compute engine (§4.8): matrix multiply-accumulate over two L1-resident
//! operands, writing an f32 PSUM tile back into L1 (the same buffer
//! `DRAIN_OUTPUT*` later reads from). Backend dispatch
//! is a plain `match` on `ComputeBackend`, not a trait object — the same
//! closed-set-of-kinds idiom the ISA uses for `Operands`, since the set of
//! backends is fixed and known at compile time (a design note in §9 calls
//! this out explicitly).

use std::collections::VecDeque;

use crate::engines::sfu::Sfu;
use crate::error::EngineError;
use crate::isa::instruction::Activation;
use crate::memory::resource::ResourceManager;
use crate::trace::event::{ComputePayload, Payload, TraceLogger, TransactionType};
use crate::types::{Address, ComponentType, Cycle};

const ELEM: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComputeBackend {
    /// Naive triple-nested-loop matmul: one MAC per cycle.
    BasicMatmul,
    /// A `size x size` systolic array: fill-and-drain pipeline latency
    /// instead of one MAC per cycle.
    SystolicArray { size: usize },
}

#[derive(Debug, Clone, Copy)]
pub struct MatmulJobSpec {
    pub a_l1_id: u32,
    pub a_addr: Address,
    pub b_l1_id: u32,
    pub b_addr: Address,
    pub out_l1_id: u32,
    pub out_addr: Address,
    pub m: usize,
    pub n: usize,
    pub k: usize,
    pub bias_addr: Option<Address>,
    pub activation: Activation,
    /// `true` for every `tk` after the first in a `(ti,tj)` accumulation
    /// block: the fabric's partial product is added to whatever is already
    /// at `out_addr` instead of overwriting it.
    pub accumulate: bool,
}

#[derive(Debug, Clone, Copy)]
struct Job {
    spec: MatmulJobSpec,
    on_complete: Option<u32>,
    started_at: Option<Cycle>,
    transaction_id: Option<u64>,
}

pub struct ComputeEngine {
    pub id: u32,
    backend: ComputeBackend,
    sfu: Sfu,
    queue: VecDeque<Job>,
}

impl ComputeEngine {
    pub fn new(id: u32, backend: ComputeBackend) -> Self {
        Self {
            id,
            backend,
            sfu: Sfu::new(),
            queue: VecDeque::new(),
        }
    }

    pub fn backend(&self) -> ComputeBackend {
        self.backend
    }

    pub fn is_busy(&self) -> bool {
        !self.queue.is_empty()
    }

    pub fn enqueue(&mut self, spec: MatmulJobSpec, on_complete: Option<u32>) -> Result<(), EngineError> {
        if spec.m == 0 || spec.n == 0 || spec.k == 0 {
            return Err(EngineError::ZeroDimension);
        }
        self.queue.push_back(Job {
            spec,
            on_complete,
            started_at: None,
            transaction_id: None,
        });
        Ok(())
    }

    pub fn latency_for(&self, spec: &MatmulJobSpec) -> Cycle {
        match self.backend {
            ComputeBackend::BasicMatmul => (spec.m * spec.n * spec.k) as Cycle,
            ComputeBackend::SystolicArray { size } => {
                let fill_drain = size.saturating_sub(1) * 2;
                (spec.m.max(spec.n).max(spec.k) + fill_drain) as Cycle
            }
        }
        .max(1)
    }

    fn component_type(&self) -> ComponentType {
        match self.backend {
            ComputeBackend::BasicMatmul => ComponentType::ComputeFabric,
            ComputeBackend::SystolicArray { .. } => ComponentType::SystolicArray,
        }
    }

    fn read_matrix(mgr: &mut ResourceManager, kind: ComponentType, instance: u32, addr: Address, n: usize) -> Vec<f32> {
        let bank = mgr.bank_mut(kind).expect("bank registered");
        let buf = bank.get_mut(instance).expect("instance registered");
        let mut bytes = vec![0u8; n * ELEM];
        buf.read(addr, &mut bytes, (n * ELEM) as u64);
        bytes.chunks_exact(ELEM).map(|c| f32::from_le_bytes(c.try_into().unwrap())).collect()
    }

    fn run_matmul(&self, mgr: &mut ResourceManager, spec: &MatmulJobSpec) -> u64 {
        let a = Self::read_matrix(mgr, ComponentType::L1, spec.a_l1_id, spec.a_addr, spec.m * spec.k);
        let b = Self::read_matrix(mgr, ComponentType::L1, spec.b_l1_id, spec.b_addr, spec.k * spec.n);

        let mut out = vec![0f32; spec.m * spec.n];
        for i in 0..spec.m {
            for j in 0..spec.n {
                let mut acc = 0f32;
                for p in 0..spec.k {
                    acc += a[i * spec.k + p] * b[p * spec.n + j];
                }
                out[i * spec.n + j] = acc;
            }
        }

        if spec.accumulate {
            let bank = mgr.bank_mut(ComponentType::L1).expect("L1 bank registered");
            let buf = bank.get_mut(spec.out_l1_id).expect("L1 instance registered");
            let mut prior = vec![0u8; out.len() * ELEM];
            let prior_len = prior.len() as u64;
            buf.read(spec.out_addr, &mut prior, prior_len);
            for (v, c) in out.iter_mut().zip(prior.chunks_exact(ELEM)) {
                *v += f32::from_le_bytes(c.try_into().unwrap());
            }
        }

        if let Some(bias_addr) = spec.bias_addr {
            let bias = {
                let raw = mgr.read(bias_addr, (spec.n * ELEM) as u64).expect("bias range validated at enqueue");
                raw.chunks_exact(ELEM).map(|c| f32::from_le_bytes(c.try_into().unwrap())).collect::<Vec<_>>()
            };
            for (i, v) in out.iter_mut().enumerate() {
                *v += bias[i % spec.n];
            }
        }
        if !matches!(spec.activation, Activation::None) {
            self.sfu.apply_slice(&mut out, spec.activation);
        }

        let out_bytes: Vec<u8> = out.iter().flat_map(|v| v.to_le_bytes()).collect();
        let bank = mgr.bank_mut(ComponentType::L1).expect("L1 bank registered");
        let buf = bank.get_mut(spec.out_l1_id).expect("L1 instance registered");
        buf.write(spec.out_addr, &out_bytes, out_bytes.len() as u64);

        (spec.m * spec.n * spec.k) as u64
    }

    pub fn process(&mut self, cycle: Cycle, mgr: &mut ResourceManager, logger: &mut TraceLogger) -> Option<u32> {
        let component_type = self.component_type();
        let id = self.id;
        let job = self.queue.front_mut()?;
        if job.started_at.is_none() {
            job.started_at = Some(cycle);
            job.transaction_id = logger.issue(
                cycle,
                component_type,
                id,
                TransactionType::MatMul,
                None,
                Some(format!("{}x{}x{}", job.spec.m, job.spec.n, job.spec.k)),
            );
            return None;
        }

        let elapsed = cycle - job.started_at.unwrap();
        let spec = job.spec;
        let latency = self.latency_for(&spec);
        if elapsed + 1 < latency {
            return None;
        }

        let job = self.queue.pop_front().unwrap();
        let macs = self.run_matmul(mgr, &job.spec);
        if let Some(txn) = job.transaction_id {
            logger.complete(
                txn,
                cycle,
                Some(Payload::Compute(ComputePayload {
                    op: "matmul".into(),
                    macs,
                })),
            );
        }
        job.on_complete
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::AddressDecoder;
    use crate::memory::buffer::Buffer;
    use crate::types::MemoryKind;

    fn manager() -> ResourceManager {
        let mut dec = AddressDecoder::new();
        dec.add_region(0x0, 0x1000, MemoryKind::L1Buffer, 0, "l1").unwrap();
        dec.add_region(0x1000, 0x1000, MemoryKind::L2Bank, 0, "l2").unwrap();
        let mut mgr = ResourceManager::new(dec);
        mgr.register_buffer(ComponentType::L1, Buffer::new(0, 0x1000));
        mgr.register_buffer(ComponentType::L2Bank, Buffer::new(0, 0x1000));
        mgr
    }

    fn write_matrix(mgr: &mut ResourceManager, addr: Address, values: &[f32]) {
        let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        mgr.write(addr, &bytes).unwrap();
    }

    fn run_to_completion(eng: &mut ComputeEngine, mgr: &mut ResourceManager, logger: &mut TraceLogger) -> u32 {
        let mut cycle = 0;
        loop {
            if let Some(id) = eng.process(cycle, mgr, logger) {
                return id;
            }
            cycle += 1;
            assert!(cycle < 10_000);
        }
    }

    #[test]
    fn basic_matmul_2x2_identity() {
        let mut mgr = manager();
        write_matrix(&mut mgr, 0, &[1.0, 2.0, 3.0, 4.0]);
        write_matrix(&mut mgr, 0x100, &[1.0, 0.0, 0.0, 1.0]);

        let spec = MatmulJobSpec {
            a_l1_id: 0,
            a_addr: 0,
            b_l1_id: 0,
            b_addr: 0x100,
            out_l1_id: 0,
            out_addr: 0x200,
            m: 2,
            n: 2,
            k: 2,
            bias_addr: None,
            activation: Activation::None,
            accumulate: false,
        };

        let mut eng = ComputeEngine::new(0, ComputeBackend::BasicMatmul);
        let mut logger = TraceLogger::new();
        eng.enqueue(spec, Some(9)).unwrap();
        let id = run_to_completion(&mut eng, &mut mgr, &mut logger);
        assert_eq!(id, 9);

        let out = mgr.read(0x200, 16).unwrap();
        let values: Vec<f32> = out.chunks_exact(4).map(|c| f32::from_le_bytes(c.try_into().unwrap())).collect();
        assert_eq!(values, vec![1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn systolic_latency_scales_with_array_size() {
        let eng = ComputeEngine::new(0, ComputeBackend::SystolicArray { size: 16 });
        let spec = MatmulJobSpec {
            a_l1_id: 0,
            a_addr: 0,
            b_l1_id: 0,
            b_addr: 0,
            out_l1_id: 0,
            out_addr: 0,
            m: 16,
            n: 16,
            k: 16,
            bias_addr: None,
            activation: Activation::None,
            accumulate: false,
        };
        let latency = eng.latency_for(&spec);
        assert!(latency >= 16 && latency <= 16 * 3, "latency={latency}");
    }

    #[test]
    fn zero_dimension_rejected() {
        let mut eng = ComputeEngine::new(0, ComputeBackend::BasicMatmul);
        let spec = MatmulJobSpec {
            a_l1_id: 0,
            a_addr: 0,
            b_l1_id: 0,
            b_addr: 0,
            out_l1_id: 0,
            out_addr: 0,
            m: 0,
            n: 2,
            k: 2,
            bias_addr: None,
            activation: Activation::None,
            accumulate: false,
        };
        assert_eq!(eng.enqueue(spec, None), Err(EngineError::ZeroDimension));
    }

    #[test]
    fn accumulate_adds_to_existing_psum_instead_of_overwriting() {
        let mut mgr = manager();
        write_matrix(&mut mgr, 0, &[1.0, 1.0, 1.0, 1.0]);
        write_matrix(&mut mgr, 0x100, &[1.0, 1.0, 1.0, 1.0]);
        write_matrix(&mut mgr, 0x200, &[5.0, 5.0, 5.0, 5.0]);

        let spec = MatmulJobSpec {
            a_l1_id: 0,
            a_addr: 0,
            b_l1_id: 0,
            b_addr: 0x100,
            out_l1_id: 0,
            out_addr: 0x200,
            m: 2,
            n: 2,
            k: 2,
            bias_addr: None,
            activation: Activation::None,
            accumulate: true,
        };

        let mut eng = ComputeEngine::new(0, ComputeBackend::BasicMatmul);
        let mut logger = TraceLogger::new();
        eng.enqueue(spec, Some(1)).unwrap();
        run_to_completion(&mut eng, &mut mgr, &mut logger);

        let out = mgr.read(0x200, 16).unwrap();
        let values: Vec<f32> = out.chunks_exact(4).map(|c| f32::from_le_bytes(c.try_into().unwrap())).collect();
        // each output element is 1*1+1*1=2, plus the prior 5.0 already resident.
        assert_eq!(values, vec![7.0, 7.0, 7.0, 7.0]);
    }
}
