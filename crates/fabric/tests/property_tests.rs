//! Property-based tests for the ring, pool, policy, and window pieces.
//!
//! Ring and pool properties run against a real shared-memory fabric (one
//! short-lived session per case, destroyed on exit); the byte-level and
//! bookkeeping properties run on plain values.

use ada_fabric::record::{EnterEvent, LeaveEvent};
use ada_fabric::{
    Fabric, MarkingPolicy, PatternSpec, PersistenceWindow, Probe, PushError, SessionId,
};
use proptest::prelude::*;
use std::sync::atomic::{AtomicU32, Ordering};

static NEXT_SESSION: AtomicU32 = AtomicU32::new(1);

fn fresh_fabric() -> Fabric {
    let session = SessionId {
        host_pid: std::process::id(),
        session_id: 0x9_0000 | NEXT_SESSION.fetch_add(1, Ordering::Relaxed),
    };
    Fabric::create(session).expect("create test fabric")
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    /// Unconsumed bytes never exceed capacity, across any push/consume mix.
    #[test]
    fn prop_ring_bounded_span(
        ops in prop::collection::vec((prop::bool::ANY, 0usize..120), 1..150),
    ) {
        let fabric = fresh_fabric();
        let pool = fabric.pool();
        let handle = pool.pop_free().unwrap();
        let ring = pool.ring(handle);

        for (push, len) in ops {
            if push {
                let _ = ring.push_frame(1, &vec![0xAB; len]);
            } else {
                ring.consume_frames(1, |_, _| {});
            }
            prop_assert!(ring.used_bytes() <= ring.capacity());
        }
    }

    /// Every payload that gets in comes back byte-exact and in order.
    #[test]
    fn prop_ring_round_trip_exact(
        payloads in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..200), 1..50),
    ) {
        let fabric = fresh_fabric();
        let pool = fabric.pool();
        let ring = pool.ring(pool.pop_free().unwrap());

        let mut accepted = Vec::new();
        for p in &payloads {
            match ring.push_frame(3, p) {
                Ok(()) => accepted.push(p.clone()),
                Err(PushError::Full) => break,
                Err(PushError::Oversize) => unreachable!("payloads are far below slab size"),
            }
        }

        let mut drained = Vec::new();
        ring.consume_frames(usize::MAX, |kind, payload| {
            assert_eq!(kind, 3);
            drained.push(payload.to_vec());
        });
        prop_assert_eq!(drained, accepted);
    }

    /// Drop-oldest removes exactly one record per call and keeps the
    /// remaining records in order.
    #[test]
    fn prop_drop_oldest_preserves_suffix(
        count in 2usize..40,
        drops in 1usize..10,
    ) {
        let fabric = fresh_fabric();
        let pool = fabric.pool();
        let ring = pool.ring(pool.pop_free().unwrap());

        for i in 0..count {
            ring.push_frame(1, &(i as u64).to_le_bytes()).unwrap();
        }
        let drops = drops.min(count);
        let mut removed = 0;
        for _ in 0..drops {
            removed += ring.drop_oldest();
        }
        prop_assert_eq!(removed, drops);

        let mut next = drops as u64;
        ring.consume_frames(usize::MAX, |_, payload| {
            let v = u64::from_le_bytes(payload.try_into().unwrap());
            assert_eq!(v, next);
            next += 1;
        });
        prop_assert_eq!(next, count as u64);
    }

    /// Free-list pop/push conserves the ring population.
    #[test]
    fn prop_pool_conserves_rings(take in 1usize..100) {
        let fabric = fresh_fabric();
        let pool = fabric.pool();
        let start = pool.free_count();

        let mut held = Vec::new();
        for _ in 0..take {
            match pool.pop_free() {
                Some(h) => held.push(h),
                None => break,
            }
        }
        prop_assert_eq!(pool.free_count() as usize, start as usize - held.len());

        for h in held {
            pool.push_free(h);
        }
        prop_assert_eq!(pool.free_count(), start);
    }
}

proptest! {
    /// Index event wire format round-trips for arbitrary field values.
    #[test]
    fn prop_index_events_round_trip(fid in any::<u64>(), ts in any::<u64>(), ret in any::<u64>()) {
        let enter = EnterEvent { function_id: fid, timestamp_ns: ts };
        prop_assert_eq!(EnterEvent::decode(&enter.encode()), Some(enter));

        let leave = LeaveEvent { function_id: fid, timestamp_ns: ts, ret };
        prop_assert_eq!(LeaveEvent::decode(&leave.encode()), Some(leave));
    }

    /// Window counters add up and the snapshot is stable.
    #[test]
    fn prop_window_accounting(
        events in prop::collection::vec((any::<bool>(), 1u64..1000), 0..300),
    ) {
        let mut w = PersistenceWindow::new(0);
        let mut now = 0u64;
        let mut marks = 0u64;

        for (marked, dt) in &events {
            now += dt;
            w.observe(now, *marked);
            if *marked {
                marks += 1;
            }
        }

        let s = w.snapshot();
        prop_assert_eq!(s.total_events, events.len() as u64);
        prop_assert_eq!(s.marked_events, marks);
        prop_assert_eq!(s.mark_seen, marks > 0);
        prop_assert_eq!(w.snapshot(), s);
        if s.mark_seen {
            prop_assert!(s.first_mark_ns <= s.last_event_ns);
        }
    }

    /// Case-insensitive literals match both casings of the same symbol.
    #[test]
    fn prop_literal_case_folding(symbol in "[a-zA-Z_]{1,16}") {
        let policy = MarkingPolicy::new(vec![PatternSpec::symbol_literal(symbol.clone())]).unwrap();
        let upper = symbol.to_uppercase();
        let lower = symbol.to_lowercase();
        let upper_probe = Probe { symbol: &upper, module: "", message: "" };
        let lower_probe = Probe { symbol: &lower, module: "", message: "" };
        prop_assert!(policy.matches(&upper_probe));
        prop_assert!(policy.matches(&lower_probe));
    }
}
