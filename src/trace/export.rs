//! Export formats (§6): CSV, a JSON wrapper, and Chrome's `about:tracing`
//! format, in physical-pipeline viewer order.

use serde::Serialize;

use crate::error::FormatError;
use crate::trace::event::{Payload, Status, TraceEvent};
use crate::types::ComponentType;

fn payload_to_string(payload: &Option<Payload>) -> String {
    match payload {
        None => String::new(),
        Some(Payload::Dma(p)) => format!(
            "{}->{} {}B @ {:.2}GB/s",
            p.src_loc, p.dst_loc, p.bytes_transferred, p.bandwidth_gbps
        ),
        Some(Payload::Compute(p)) => format!("{} {} macs", p.op, p.macs),
        Some(Payload::Control(p)) => p.info.clone(),
        Some(Payload::Memory(p)) => format!("addr={:#x} size={}", p.address, p.size),
    }
}

/// One CSV row per event (columns per §6).
pub fn export_csv(events: &[TraceEvent]) -> Result<String, FormatError> {
    let mut writer = csv::WriterBuilder::new().from_writer(Vec::new());
    writer
        .write_record([
            "TransactionID",
            "ComponentType",
            "ComponentID",
            "TransactionType",
            "Status",
            "CycleIssue",
            "CycleComplete",
            "DurationCycles",
            "TimeIssueNs",
            "TimeCompleteNs",
            "DurationNs",
            "Payload",
            "Description",
        ])
        .map_err(|e| FormatError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?;

    for e in events {
        let freq = e.clock_freq_ghz.unwrap_or(1.0);
        let time_issue_ns = e.cycle_issue as f64 / freq;
        let time_complete_ns = if e.cycle_complete == 0 {
            0.0
        } else {
            e.cycle_complete as f64 / freq
        };
        let duration_cycles = e.duration_cycles().unwrap_or(0);
        let duration_ns = if e.cycle_complete == 0 {
            0.0
        } else {
            time_complete_ns - time_issue_ns
        };
        writer
            .write_record([
                e.transaction_id.to_string(),
                format!("{:?}", e.component_type),
                e.component_id.to_string(),
                format!("{:?}", e.transaction_type),
                format!("{:?}", e.status),
                e.cycle_issue.to_string(),
                e.cycle_complete.to_string(),
                duration_cycles.to_string(),
                time_issue_ns.to_string(),
                time_complete_ns.to_string(),
                duration_ns.to_string(),
                payload_to_string(&e.payload),
                e.description.clone().unwrap_or_default(),
            ])
            .map_err(|e| FormatError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?;
    }

    let bytes = writer
        .into_inner()
        .map_err(|e| FormatError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?;
    String::from_utf8(bytes).map_err(|e| FormatError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))
}

#[derive(Serialize)]
struct JsonTraceFile<'a> {
    traces: &'a [TraceEvent],
}

pub fn export_json(events: &[TraceEvent]) -> Result<String, FormatError> {
    Ok(serde_json::to_string_pretty(&JsonTraceFile { traces: events })?)
}

#[derive(Serialize)]
#[serde(tag = "ph")]
enum ChromeEvent {
    #[serde(rename = "M")]
    Meta {
        pid: u32,
        name: &'static str,
        args: ChromeMetaArgs,
    },
    #[serde(rename = "X")]
    Complete {
        pid: u32,
        tid: u32,
        name: String,
        ts: f64,
        dur: f64,
        cat: String,
    },
    #[serde(rename = "i")]
    Instant {
        pid: u32,
        tid: u32,
        name: String,
        ts: f64,
        s: &'static str,
    },
}

#[derive(Serialize)]
struct ChromeMetaArgs {
    name: String,
}

/// Chrome trace format (`about:tracing`): metadata events first, then
/// complete (`X`) events for finished ops, instant (`i`) events for
/// still-in-flight ones. `ts`/`dur` are microseconds.
pub fn export_chrome(events: &[TraceEvent]) -> Result<String, FormatError> {
    let mut out = Vec::new();

    let mut seen_pids: Vec<(u32, &'static str)> = Vec::new();
    for e in events {
        let pid = e.component_type.chrome_process_id();
        let name = component_display_name(e.component_type);
        if !seen_pids.iter().any(|(p, _)| *p == pid) {
            seen_pids.push((pid, name));
        }
    }
    seen_pids.sort_by_key(|(pid, _)| *pid);
    for (pid, name) in &seen_pids {
        out.push(ChromeEvent::Meta {
            pid: *pid,
            name: "process_name",
            args: ChromeMetaArgs { name: name.to_string() },
        });
        out.push(ChromeEvent::Meta {
            pid: *pid,
            name: "thread_name",
            args: ChromeMetaArgs {
                name: format!("{name} lane"),
            },
        });
    }

    for e in events.iter().filter(|e| e.status == Status::Completed) {
        let freq = e.clock_freq_ghz.unwrap_or(1.0);
        let ts = (e.cycle_issue as f64 / freq) * 1000.0; // ns -> us
        let dur = e.duration_cycles().unwrap_or(0) as f64 / freq * 1000.0;
        out.push(ChromeEvent::Complete {
            pid: e.component_type.chrome_process_id(),
            tid: e.component_id,
            name: format!("{:?}", e.transaction_type),
            ts,
            dur,
            cat: format!("{:?}", e.component_type),
        });
    }
    for e in events.iter().filter(|e| e.status == Status::Issued || e.status == Status::InProgress) {
        let freq = e.clock_freq_ghz.unwrap_or(1.0);
        let ts = (e.cycle_issue as f64 / freq) * 1000.0;
        out.push(ChromeEvent::Instant {
            pid: e.component_type.chrome_process_id(),
            tid: e.component_id,
            name: format!("{:?}", e.transaction_type),
            ts,
            s: "p",
        });
    }

    Ok(serde_json::to_string_pretty(&out)?)
}

fn component_display_name(kind: ComponentType) -> &'static str {
    match kind {
        ComponentType::HostMemory => "Host Memory",
        ComponentType::HostCpu => "Host CPU",
        ComponentType::PcieBus => "PCIe Bus",
        ComponentType::DmaEngine => "DMA Engine",
        ComponentType::KpuMemory => "KPU Memory",
        ComponentType::MemoryOrchestrator => "Memory Orchestrator",
        ComponentType::L3Tile => "L3 Tile",
        ComponentType::BlockMover => "Block Mover",
        ComponentType::L2Bank => "L2 Bank",
        ComponentType::Streamer => "Streamer",
        ComponentType::L1 => "L1 Buffer",
        ComponentType::ComputeFabric => "Compute Fabric",
        ComponentType::SystolicArray => "Systolic Array",
        ComponentType::PageBuffer => "Page Buffer",
        ComponentType::StorageScheduler => "Storage Scheduler",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::event::{DmaPayload, TraceLogger, TransactionType};

    fn sample_events() -> Vec<TraceEvent> {
        let mut logger = TraceLogger::new();
        let txn = logger
            .issue(
                0,
                ComponentType::DmaEngine,
                0,
                TransactionType::Transfer,
                Some(Payload::Dma(DmaPayload {
                    src_loc: "External:0".into(),
                    dst_loc: "L3Tile:0".into(),
                    bytes_transferred: 1024,
                    bandwidth_gbps: 16.0,
                })),
                None,
            )
            .unwrap();
        logger.complete(txn, 8, None);
        logger.events().to_vec()
    }

    #[test]
    fn csv_export_has_header_and_one_row_per_event() {
        let events = sample_events();
        let csv = export_csv(&events).unwrap();
        let lines: Vec<_> = csv.lines().collect();
        assert_eq!(lines.len(), 1 + events.len());
        assert!(lines[0].starts_with("TransactionID"));
    }

    #[test]
    fn json_export_wraps_in_traces_key() {
        let events = sample_events();
        let json = export_json(&events).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert!(value.get("traces").unwrap().as_array().unwrap().len() == events.len());
    }

    #[test]
    fn chrome_export_orders_metadata_before_events() {
        let events = sample_events();
        let chrome = export_chrome(&events).unwrap();
        let value: serde_json::Value = serde_json::from_str(&chrome).unwrap();
        let arr = value.as_array().unwrap();
        assert_eq!(arr[0]["ph"], "M");
    }
}
