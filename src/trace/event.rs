//! The trace event schema (§6) and its logger. This *is* the crate's
//! logging layer — the teacher's `utils/events.rs` `LoggableEventSimple` /
//! `SimpleEvent` pattern generalized from one domain-specific struct into
//! the full component/transaction/status taxonomy every engine writes to.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::types::{ComponentType, Cycle};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionType {
    Read,
    Write,
    Transfer,
    Copy,
    Compute,
    MatMul,
    DotProduct,
    Configure,
    Sync,
    Fence,
    Allocate,
    Deallocate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    Issued,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DmaPayload {
    pub src_loc: String,
    pub dst_loc: String,
    pub bytes_transferred: u64,
    pub bandwidth_gbps: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComputePayload {
    pub op: String,
    pub macs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlPayload {
    pub info: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryPayload {
    pub address: u64,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Payload {
    Dma(DmaPayload),
    Compute(ComputePayload),
    Control(ControlPayload),
    Memory(MemoryPayload),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceEvent {
    pub transaction_id: u64,
    pub cycle_issue: Cycle,
    /// 0 while the transaction is still in flight.
    pub cycle_complete: Cycle,
    pub component_type: ComponentType,
    pub component_id: u32,
    pub transaction_type: TransactionType,
    pub status: Status,
    pub payload: Option<Payload>,
    pub description: Option<String>,
    pub clock_freq_ghz: Option<f64>,
}

impl TraceEvent {
    pub fn duration_cycles(&self) -> Option<Cycle> {
        if self.cycle_complete == 0 {
            None
        } else {
            Some(self.cycle_complete - self.cycle_issue)
        }
    }
}

/// A single global sink every engine writes to, gated by a per-component
/// enable flag. Consumers read `events()` after the simulation ends —
/// there is no live subscriber model.
#[derive(Debug, Default)]
pub struct TraceLogger {
    events: Vec<TraceEvent>,
    next_transaction_id: u64,
    enabled: HashMap<ComponentType, bool>,
}

impl TraceLogger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_enabled(&mut self, component: ComponentType, enabled: bool) {
        self.enabled.insert(component, enabled);
    }

    pub fn is_enabled(&self, component: ComponentType) -> bool {
        *self.enabled.get(&component).unwrap_or(&true)
    }

    fn alloc_transaction_id(&mut self) -> u64 {
        let id = self.next_transaction_id;
        self.next_transaction_id += 1;
        id
    }

    /// Logs an `Issued` event and returns the freshly allocated transaction
    /// id the caller must pass to `complete`. Returns `None` (and allocates
    /// no id) if the component is disabled.
    pub fn issue(
        &mut self,
        cycle: Cycle,
        component_type: ComponentType,
        component_id: u32,
        transaction_type: TransactionType,
        payload: Option<Payload>,
        description: Option<String>,
    ) -> Option<u64> {
        if !self.is_enabled(component_type) {
            return None;
        }
        let transaction_id = self.alloc_transaction_id();
        self.events.push(TraceEvent {
            transaction_id,
            cycle_issue: cycle,
            cycle_complete: 0,
            component_type,
            component_id,
            transaction_type,
            status: Status::Issued,
            payload,
            description,
            clock_freq_ghz: None,
        });
        Some(transaction_id)
    }

    /// Logs the matching `Completed` event for a transaction id previously
    /// returned by `issue`.
    pub fn complete(&mut self, transaction_id: u64, cycle: Cycle, payload: Option<Payload>) {
        if let Some(issued) = self
            .events
            .iter()
            .find(|e| e.transaction_id == transaction_id && e.status == Status::Issued)
            .cloned()
        {
            self.events.push(TraceEvent {
                cycle_complete: cycle,
                status: Status::Completed,
                payload: payload.or(issued.payload.clone()),
                ..issued
            });
        }
    }

    pub fn fail(&mut self, transaction_id: u64, cycle: Cycle, description: impl Into<String>) {
        if let Some(issued) = self
            .events
            .iter()
            .find(|e| e.transaction_id == transaction_id && e.status == Status::Issued)
            .cloned()
        {
            self.events.push(TraceEvent {
                cycle_complete: cycle,
                status: Status::Failed,
                description: Some(description.into()),
                ..issued
            });
        }
    }

    pub fn events(&self) -> &[TraceEvent] {
        &self.events
    }

    pub fn clear(&mut self) {
        self.events.clear();
        self.next_transaction_id = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issue_then_complete_orders_correctly() {
        let mut logger = TraceLogger::new();
        let txn = logger
            .issue(
                10,
                ComponentType::DmaEngine,
                0,
                TransactionType::Transfer,
                Some(Payload::Dma(DmaPayload {
                    src_loc: "External:0".into(),
                    dst_loc: "L3Tile:0".into(),
                    bytes_transferred: 4096,
                    bandwidth_gbps: 32.0,
                })),
                None,
            )
            .unwrap();
        logger.complete(txn, 20, None);
        let events: Vec<_> = logger.events().iter().filter(|e| e.transaction_id == txn).collect();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].status, Status::Issued);
        assert_eq!(events[1].status, Status::Completed);
        assert_eq!(events[1].duration_cycles(), Some(10));
    }

    #[test]
    fn disabled_component_logs_nothing() {
        let mut logger = TraceLogger::new();
        logger.set_enabled(ComponentType::DmaEngine, false);
        let txn = logger.issue(0, ComponentType::DmaEngine, 0, TransactionType::Transfer, None, None);
        assert!(txn.is_none());
        assert!(logger.events().is_empty());
    }

    #[test]
    fn dma_payload_reports_exact_byte_count() {
        let mut logger = TraceLogger::new();
        let txn = logger
            .issue(
                0,
                ComponentType::DmaEngine,
                0,
                TransactionType::Transfer,
                Some(Payload::Dma(DmaPayload {
                    src_loc: "a".into(),
                    dst_loc: "b".into(),
                    bytes_transferred: 777,
                    bandwidth_gbps: 1.0,
                })),
                None,
            )
            .unwrap();
        logger.complete(txn, 1, None);
        let completed = logger
            .events()
            .iter()
            .find(|e| e.transaction_id == txn && e.status == Status::Completed)
            .unwrap();
        match completed.payload.as_ref().unwrap() {
            Payload::Dma(p) => assert_eq!(p.bytes_transferred, 777),
            _ => panic!("expected DMA payload"),
        }
    }
}
