//! Agent-side behavior against a bare fabric (no drain thread): routing by
//! mode, first-touch registration, fallback paths, and shutdown halting.

use ada_agent::{Agent, AgentConfig};
use ada_fabric::layout::{LaneKind, SLOT_ACTIVE};
use ada_fabric::record::{DetailEvent, EnterEvent, KIND_DETAIL, KIND_ENTER, KIND_LEAVE};
use ada_fabric::{AgentMode, Fabric, FabricError, ModeParams, PatternSpec, Probe, SessionId};
use std::sync::atomic::{AtomicU32, Ordering};

static NEXT_SESSION: AtomicU32 = AtomicU32::new(1);

fn session() -> SessionId {
    SessionId {
        host_pid: std::process::id(),
        session_id: 0xA6_0000 | NEXT_SESSION.fetch_add(1, Ordering::Relaxed),
    }
}

fn fast_mode() -> ModeParams {
    ModeParams::for_drain_interval(5_000_000)
}

/// Pretend the drain just ran.
fn beat(fabric: &Fabric) {
    fabric
        .control()
        .drain_heartbeat_ns
        .store(ada_fabric::monotonic_ns(), Ordering::Release);
}

/// Drive the agent into per_thread_only.
fn promote(fabric: &Fabric, agent: &Agent) {
    fabric.control().registry_ready.store(1, Ordering::Release);
    for _ in 0..5 {
        beat(fabric);
        agent.force_tick();
    }
    assert_eq!(agent.mode(), AgentMode::PerThreadOnly);
}

#[test]
fn attach_requires_a_controller() {
    let cfg = AgentConfig {
        fabric: ada_fabric::FabricConfig {
            attach_timeout: std::time::Duration::from_millis(50),
            ..Default::default()
        },
        ..Default::default()
    };
    let Err(err) = Agent::attach(session(), cfg) else {
        panic!("attach succeeded without a controller");
    };
    assert!(err.is_retryable());
}

#[test]
fn starts_global_only_and_writes_fallback() {
    let s = session();
    let controller = Fabric::create(s).unwrap();
    let agent = Agent::attach(s, AgentConfig::default()).unwrap();
    agent.publish_ready();

    assert_eq!(agent.mode(), AgentMode::GlobalOnly);
    assert_eq!(controller.control().agent_attached.load(Ordering::Acquire), 1);

    agent.emit_index_enter(0x10);
    agent.emit_index_leave(0x10, 0);

    // Nothing registered, everything on the fallback ring.
    let registry = controller.registry();
    assert_eq!(registry.slots_in_state(SLOT_ACTIVE).count(), 0);

    let mut kinds = Vec::new();
    controller
        .pool()
        .fallback()
        .ring()
        .consume_frames(usize::MAX, |kind, _| kinds.push(kind));
    assert_eq!(kinds, vec![KIND_ENTER, KIND_LEAVE]);
}

#[test]
fn per_thread_mode_registers_and_fills_the_index_lane() {
    let s = session();
    let controller = Fabric::create(s).unwrap();
    let agent = Agent::attach(
        s,
        AgentConfig { mode: fast_mode(), ..Default::default() },
    )
    .unwrap();
    promote(&controller, &agent);

    for i in 0..100 {
        agent.emit_index_enter(i);
        agent.emit_index_leave(i, i * 2);
    }

    let registry = controller.registry();
    let slots: Vec<_> = registry.slots_in_state(SLOT_ACTIVE).collect();
    assert_eq!(slots.len(), 1);
    let (_, slot) = slots[0];
    assert_eq!(slot.lane(LaneKind::Index).events.load(Ordering::Relaxed), 200);
    assert_eq!(slot.events_emitted.load(Ordering::Relaxed), 200);

    // Steady state leaves the fallback untouched.
    assert!(controller.pool().fallback().ring().is_empty());

    // Records round-trip byte-exact from the active ring.
    let handle = slot.lane(LaneKind::Index).active_ring.load(Ordering::Relaxed);
    let mut first = None;
    controller.pool().ring(handle).consume_frames(1, |kind, payload| {
        assert_eq!(kind, KIND_ENTER);
        first = EnterEvent::decode(payload);
    });
    assert_eq!(first.unwrap().function_id, 0);
}

#[test]
fn dual_write_mirrors_to_fallback() {
    let s = session();
    let controller = Fabric::create(s).unwrap();
    let agent = Agent::attach(
        s,
        AgentConfig { mode: fast_mode(), ..Default::default() },
    )
    .unwrap();

    // One tick after ready: dual write, not yet promoted.
    controller.control().registry_ready.store(1, Ordering::Release);
    beat(&controller);
    agent.force_tick();
    assert_eq!(agent.mode(), AgentMode::DualWrite);

    agent.emit_index_enter(7);

    let registry = controller.registry();
    let (_, slot) = registry.slots_in_state(SLOT_ACTIVE).next().unwrap();
    assert_eq!(slot.lane(LaneKind::Index).events.load(Ordering::Relaxed), 1);

    let mut fallback_records = 0;
    controller
        .pool()
        .fallback()
        .ring()
        .consume_frames(usize::MAX, |_, _| fallback_records += 1);
    assert_eq!(fallback_records, 1);
}

#[test]
fn detail_marks_count_and_windows_dump_on_post_roll() {
    let s = session();
    let controller = Fabric::create(s).unwrap();
    let agent = Agent::attach(
        s,
        AgentConfig {
            mode: fast_mode(),
            patterns: vec![PatternSpec::symbol_literal("open")],
            window: ada_fabric::WindowConfig { pre_roll_ns: 0, post_roll_ns: 0 },
            ..Default::default()
        },
    )
    .unwrap();
    promote(&controller, &agent);

    let regs = [0u64; 8];
    let miss = Probe { symbol: "read", module: "libc", message: "" };
    let hit = Probe { symbol: "OPEN", module: "libc", message: "" };

    agent.emit_detail(1, &regs, &[1, 2, 3], &miss);
    // Zero post-roll: the marked window closes for dump on the marking
    // event itself, carrying its pre-roll neighbor along.
    agent.emit_detail(2, &regs, &[4, 5], &hit);

    let registry = controller.registry();
    let (_, slot) = registry.slots_in_state(SLOT_ACTIVE).next().unwrap();
    assert_eq!(slot.marks_seen.load(Ordering::Relaxed), 1);
    assert_eq!(slot.windows_dumped.load(Ordering::Relaxed), 1);
    assert_eq!(slot.detail.rings_submitted.load(Ordering::Relaxed), 1);

    // The submitted ring holds the whole window, decodable.
    let submitted = slot.detail.submit.pop().unwrap();
    let mut decoded = Vec::new();
    controller.pool().ring(submitted).consume_frames(usize::MAX, |kind, payload| {
        assert_eq!(kind, KIND_DETAIL);
        decoded.push(DetailEvent::decode(payload).unwrap().function_id);
    });
    assert_eq!(decoded, vec![1, 2]);

    // The next unmarked event opens a fresh window in the fresh ring.
    agent.emit_detail(3, &regs, &[], &miss);
    assert_eq!(slot.windows_dumped.load(Ordering::Relaxed), 1);
    let active = slot.detail.active_ring.load(Ordering::Relaxed);
    let mut tail = Vec::new();
    controller.pool().ring(active).consume_frames(usize::MAX, |_, payload| {
        tail.push(DetailEvent::decode(payload).unwrap().function_id);
    });
    assert_eq!(tail, vec![3]);
}

#[test]
fn epoch_bump_forces_reregistration_without_record_loss() {
    let s = session();
    let controller = Fabric::create(s).unwrap();
    let agent = Agent::attach(
        s,
        AgentConfig { mode: fast_mode(), ..Default::default() },
    )
    .unwrap();
    promote(&controller, &agent);

    for i in 0..10 {
        agent.emit_index_enter(i);
    }
    let registry = controller.registry();
    let (old_idx, old_slot) = registry.slots_in_state(SLOT_ACTIVE).next().unwrap();
    let old_epoch = old_slot.epoch.load(Ordering::Relaxed);

    // Controller bumps the epoch; next tick + emit re-registers.
    controller.control().registry_epoch.fetch_add(1, Ordering::Release);
    beat(&controller);
    agent.force_tick();
    agent.emit_index_enter(99);

    // The old slot is retired with its partial ring submitted; a new
    // active slot carries the post-bump record.
    let retired: Vec<_> = registry
        .slots_in_state(ada_fabric::layout::SLOT_RETIRED)
        .collect();
    assert_eq!(retired.len(), 1);
    assert_eq!(retired[0].0, old_idx);
    assert_eq!(retired[0].1.index.submit.len(), 1);

    let (_, new_slot) = registry.slots_in_state(SLOT_ACTIVE).next().unwrap();
    assert_eq!(new_slot.epoch.load(Ordering::Relaxed), old_epoch + 1);
    assert_eq!(new_slot.index.events.load(Ordering::Relaxed), 1);

    // Every record is either in the retired submit queue or the new lane:
    let submitted = retired[0].1.index.submit.pop().unwrap();
    let mut count = 0;
    controller.pool().ring(submitted).consume_frames(usize::MAX, |_, _| count += 1);
    let new_handle = new_slot.index.active_ring.load(Ordering::Relaxed);
    controller.pool().ring(new_handle).consume_frames(usize::MAX, |_, _| count += 1);
    assert_eq!(count, 11);
}

#[test]
fn shutdown_halts_emission_lazily() {
    let s = session();
    let controller = Fabric::create(s).unwrap();
    let agent = Agent::attach(s, AgentConfig::default()).unwrap();

    agent.emit_index_enter(1);
    controller.control().shutdown_requested.store(1, Ordering::Release);
    agent.force_tick();
    assert!(agent.is_halted());

    agent.emit_index_enter(2);
    let mut records = 0;
    controller.pool().fallback().ring().consume_frames(usize::MAX, |_, _| records += 1);
    assert_eq!(records, 1);
}

#[test]
fn second_global_init_is_rejected() {
    let s = session();
    let _controller = Fabric::create(s).unwrap();

    let first = ada_agent::agent_init(s.host_pid, s.session_id, AgentConfig::default());
    assert!(first.is_ok());
    assert!(ada_agent::global_agent().is_some());

    match ada_agent::agent_init(s.host_pid, s.session_id, AgentConfig::default()) {
        Err(FabricError::AlreadyInitialized) => {}
        Err(other) => panic!("expected AlreadyInitialized, got {other:?}"),
        Ok(_) => panic!("second agent_init succeeded"),
    }
}
