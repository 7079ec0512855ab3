//! Lock ordering enforcement.
//!
//! Every object owns exactly one mutex, and cross-object acquisitions must
//! follow the container-first order: context, then mixer, then element
//! (source, clock, connection). [`OrderedMutex`] wraps `parking_lot::Mutex`
//! with a rank; debug builds keep a per-thread stack of held ranks and
//! assert that each new acquisition has a strictly higher rank than the
//! deepest lock already held. Release builds compile down to the bare mutex.

use parking_lot::{Mutex, MutexGuard};

/// Context root.
pub(crate) const RANK_CONTEXT: u8 = 0;
/// Fixed mixers.
pub(crate) const RANK_MIXER: u8 = 1;
/// Sources, clocks and the connection.
pub(crate) const RANK_ELEMENT: u8 = 2;

#[cfg(debug_assertions)]
mod tracker {
    use std::cell::RefCell;

    thread_local! {
        static HELD: RefCell<Vec<u8>> = const { RefCell::new(Vec::new()) };
    }

    pub(super) fn push(rank: u8) {
        HELD.with(|held| {
            let mut held = held.borrow_mut();
            if let Some(&top) = held.last() {
                assert!(
                    rank > top,
                    "lock order violation: acquiring rank {rank} while holding rank {top}"
                );
            }
            held.push(rank);
        });
    }

    pub(super) fn pop(rank: u8) {
        HELD.with(|held| {
            let popped = held.borrow_mut().pop();
            debug_assert_eq!(popped, Some(rank), "unbalanced lock release");
        });
    }
}

/// A mutex that participates in the pipeline lock hierarchy.
pub(crate) struct OrderedMutex<T> {
    rank: u8,
    inner: Mutex<T>,
}

impl<T> OrderedMutex<T> {
    pub(crate) fn new(rank: u8, value: T) -> Self {
        Self {
            rank,
            inner: Mutex::new(value),
        }
    }

    pub(crate) fn lock(&self) -> OrderedGuard<'_, T> {
        #[cfg(debug_assertions)]
        tracker::push(self.rank);
        OrderedGuard {
            guard: self.inner.lock(),
            rank: self.rank,
        }
    }
}

/// Guard returned by [`OrderedMutex::lock`].
pub(crate) struct OrderedGuard<'a, T> {
    guard: MutexGuard<'a, T>,
    #[cfg_attr(not(debug_assertions), allow(dead_code))]
    rank: u8,
}

impl<T> std::ops::Deref for OrderedGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> std::ops::DerefMut for OrderedGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<T> Drop for OrderedGuard<'_, T> {
    fn drop(&mut self) {
        #[cfg(debug_assertions)]
        tracker::pop(self.rank);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn container_first_order_is_accepted() {
        let mixer = OrderedMutex::new(RANK_MIXER, 0u32);
        let element = OrderedMutex::new(RANK_ELEMENT, 0u32);
        let _m = mixer.lock();
        let _e = element.lock();
    }

    #[test]
    fn sequential_same_rank_is_accepted() {
        let a = OrderedMutex::new(RANK_ELEMENT, 0u32);
        let b = OrderedMutex::new(RANK_ELEMENT, 0u32);
        drop(a.lock());
        drop(b.lock());
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "lock order violation")]
    fn element_before_mixer_panics_in_debug() {
        let mixer = OrderedMutex::new(RANK_MIXER, 0u32);
        let element = OrderedMutex::new(RANK_ELEMENT, 0u32);
        let _e = element.lock();
        let _m = mixer.lock();
    }
}
