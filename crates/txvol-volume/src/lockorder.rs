//! Lock order checking
//!
//! Locks are ranked registry → suspend → state. A thread may only block on a
//! lock whose rank is not below any lock it already holds. Non-blocking
//! attempts are exempt because they cannot close a wait cycle.
//!
//! The checker is compiled in debug builds only; in release builds every
//! function here is an empty inline.

/// Rank of a lock class
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum LockLevel {
    /// Registry-wide reader/writer lock
    Registry = 0,
    /// Per-volume suspend lock
    Suspend = 1,
    /// Per-volume state lock
    State = 2,
}

#[cfg(debug_assertions)]
mod imp {
    use super::LockLevel;
    use std::cell::RefCell;

    thread_local! {
        static HELD: RefCell<[usize; 3]> = const { RefCell::new([0; 3]) };
    }

    pub fn before_blocking(level: LockLevel) {
        HELD.with(|held| {
            let held = held.borrow();
            for rank in (level as usize + 1)..held.len() {
                assert!(
                    held[rank] == 0,
                    "lock order violation: blocking on {level:?} while holding a lock of rank {rank}"
                );
            }
        });
    }

    pub fn acquired(level: LockLevel) {
        HELD.with(|held| held.borrow_mut()[level as usize] += 1);
    }

    pub fn released(level: LockLevel) {
        HELD.with(|held| {
            let mut held = held.borrow_mut();
            let slot = &mut held[level as usize];
            *slot = slot.saturating_sub(1);
        });
    }

    pub fn held(level: LockLevel) -> usize {
        HELD.with(|held| held.borrow()[level as usize])
    }
}

#[cfg(not(debug_assertions))]
mod imp {
    use super::LockLevel;

    #[inline]
    pub fn before_blocking(_level: LockLevel) {}

    #[inline]
    pub fn acquired(_level: LockLevel) {}

    #[inline]
    pub fn released(_level: LockLevel) {}

    #[inline]
    pub fn held(_level: LockLevel) -> usize {
        0
    }
}

/// Assert that the calling thread may block on a lock of `level`.
///
/// # Panics
/// In debug builds, when the thread holds a lock ranked after `level`.
pub fn before_blocking(level: LockLevel) {
    imp::before_blocking(level);
}

/// Record that the calling thread now holds a lock of `level`
pub fn acquired(level: LockLevel) {
    imp::acquired(level);
}

/// Record that the calling thread released a lock of `level`
pub fn released(level: LockLevel) {
    imp::released(level);
}

/// Number of locks of `level` the calling thread holds (always 0 in release)
#[must_use]
pub fn held(level: LockLevel) -> usize {
    imp::held(level)
}

#[cfg(all(test, debug_assertions))]
mod tests {
    use super::*;

    #[test]
    fn test_forward_order_allowed() {
        before_blocking(LockLevel::Registry);
        acquired(LockLevel::Registry);
        before_blocking(LockLevel::Suspend);
        acquired(LockLevel::Suspend);
        before_blocking(LockLevel::State);
        acquired(LockLevel::State);
        assert_eq!(held(LockLevel::State), 1);

        released(LockLevel::State);
        released(LockLevel::Suspend);
        released(LockLevel::Registry);
        assert_eq!(held(LockLevel::Registry), 0);
    }

    #[test]
    #[should_panic(expected = "lock order violation")]
    fn test_state_then_suspend_panics() {
        acquired(LockLevel::State);
        before_blocking(LockLevel::Suspend);
    }

    #[test]
    #[should_panic(expected = "lock order violation")]
    fn test_suspend_then_registry_panics() {
        acquired(LockLevel::Suspend);
        before_blocking(LockLevel::Registry);
    }

    #[test]
    fn test_release_is_saturating() {
        released(LockLevel::State);
        assert_eq!(held(LockLevel::State), 0);
    }
}
