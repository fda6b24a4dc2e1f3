//! End-to-end demo: a controller session plus a simulated traced process
//! in the same binary.
//!
//! Four producer threads hammer the index lane while one emits detail
//! records that trip the marking policy on `open`. Run with
//! `RUST_LOG=info cargo run -p ada-controller --bin demo`.

use ada_agent::{hooks, Agent, AgentConfig};
use ada_controller::{ControllerConfig, ControllerSession, JsonManifestWriter};
use ada_fabric::{ModeParams, PatternSpec, Probe, SessionId};
use std::sync::Arc;
use std::time::Duration;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let session = SessionId { host_pid: std::process::id(), session_id: 1 };
    let swept = ada_fabric::cleanup_stale_sessions();
    if swept > 0 {
        log::info!("swept {swept} stale segments");
    }

    let mut controller = ControllerSession::create(
        session,
        ControllerConfig {
            reporter_interval: Some(Duration::from_millis(500)),
            ..Default::default()
        },
    )?;
    controller.start(JsonManifestWriter::create("ada-demo-manifest.jsonl")?)?;

    // The "injected" agent.
    let agent = Arc::new(Agent::attach(
        session,
        AgentConfig {
            mode: ModeParams::for_drain_interval(1_000_000),
            patterns: vec![PatternSpec::symbol_literal("open")],
            ..Default::default()
        },
    )?);
    agent.publish_ready();

    let mut workers = Vec::new();
    for worker in 0..4u64 {
        let agent = Arc::clone(&agent);
        workers.push(std::thread::spawn(move || {
            let symbols = ["read", "write", "open", "close"];
            for i in 0..200_000u64 {
                let function_id = (worker << 32) | (i % 64);
                agent.emit_index_enter(function_id);
                if worker == 0 && i % 1_000 == 0 {
                    let symbol = symbols[(i / 1_000) as usize % symbols.len()];
                    hooks::on_enter(
                        &agent,
                        function_id,
                        &hooks::RegSnapshot { regs: [i; 8] },
                        &i.to_le_bytes(),
                        &Probe { symbol, module: "libc.so", message: "" },
                    );
                }
                agent.emit_index_leave(function_id, 0);
            }
        }));
    }
    for worker in workers {
        worker.join().expect("worker thread");
    }

    // Let the drain catch up, then wind down.
    std::thread::sleep(Duration::from_millis(50));
    let metrics = controller.stop()?;

    println!(
        "captured {} records ({} dropped), {} rings drained over {} cycles",
        metrics.events_captured,
        metrics.events_dropped_total(),
        metrics.rings_drained,
        metrics.drain_cycles,
    );
    if let Some(ratio) = metrics.dump_ratio() {
        println!("detail windows persisted: {:.0}%", ratio * 100.0);
    }
    Ok(())
}
