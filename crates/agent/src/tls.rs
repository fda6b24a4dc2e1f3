//! Per-thread routing cache.
//!
//! The emit fast path must find its lane in one thread-local load. The
//! cache stores the claimed slot (or the orphan verdict) together with the
//! registry epoch it was obtained under; a later epoch in the agent's
//! process-local mirror invalidates it, which is what makes controller
//! epoch bumps take effect without any per-thread signaling.

use ada_fabric::PersistenceWindow;
use std::cell::{Cell, RefCell};

/// Where this thread's records go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Route {
    /// Never registered (or invalidated).
    Unregistered,
    /// Owns this registry slot.
    Slot(u32),
    /// Registry full: global fallback lane.
    Orphan,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct SlotCache {
    pub route: Route,
    /// Epoch `route` was decided under; meaningless for `Unregistered`.
    pub epoch: u64,
}

thread_local! {
    static SLOT_CACHE: Cell<SlotCache> =
        const { Cell::new(SlotCache { route: Route::Unregistered, epoch: 0 }) };

    static DETAIL_WINDOW: RefCell<Option<PersistenceWindow>> = const { RefCell::new(None) };
}

#[inline]
pub(crate) fn cached() -> SlotCache {
    SLOT_CACHE.with(Cell::get)
}

#[inline]
pub(crate) fn cache(route: Route, epoch: u64) {
    SLOT_CACHE.with(|c| c.set(SlotCache { route, epoch }));
}

/// Run `f` on this thread's detail window, opening it at `now_ns` first if
/// none exists yet.
pub(crate) fn with_window<R>(now_ns: u64, f: impl FnOnce(&mut PersistenceWindow) -> R) -> R {
    DETAIL_WINDOW.with(|w| {
        let mut slot = w.borrow_mut();
        let window = slot.get_or_insert_with(|| PersistenceWindow::new(now_ns));
        f(window)
    })
}

/// Drop the window so the next detail event opens a fresh one (used when
/// the thread re-registers under a new epoch).
pub(crate) fn reset_window() {
    DETAIL_WINDOW.with(|w| *w.borrow_mut() = None);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_round_trips_per_thread() {
        cache(Route::Slot(5), 3);
        let c = cached();
        assert_eq!(c.route, Route::Slot(5));
        assert_eq!(c.epoch, 3);

        std::thread::spawn(|| {
            assert_eq!(cached().route, Route::Unregistered);
        })
        .join()
        .unwrap();
    }

    #[test]
    fn window_opens_once_and_resets() {
        reset_window();
        let id0 = with_window(100, |w| w.window_id());
        with_window(200, |w| w.observe(200, false));
        let total = with_window(300, |w| w.total_events());
        assert_eq!(id0, 0);
        assert_eq!(total, 1);

        reset_window();
        assert_eq!(with_window(400, |w| w.total_events()), 0);
    }
}
