//! Bounded slot counting for registries with a size limit.

use std::sync::atomic::{AtomicUsize, Ordering};

/// Counts occupied slots against an optional maximum.
///
/// A slot is reserved before the expensive part of an insert (spawning a
/// process) so concurrent callers cannot all pass a length check and then
/// overshoot the limit.
#[derive(Debug)]
pub(crate) struct Slots {
    used: AtomicUsize,
    max: Option<usize>,
}

impl Slots {
    pub(crate) fn new(max: Option<usize>) -> Self {
        Self {
            used: AtomicUsize::new(0),
            max,
        }
    }

    pub(crate) fn max(&self) -> Option<usize> {
        self.max
    }

    /// Reserves a slot, or returns `None` if the limit is reached.
    ///
    /// The slot is released when the reservation is dropped unless it is
    /// committed.
    pub(crate) fn try_reserve(&self) -> Option<Reservation<'_>> {
        let max = self.max.unwrap_or(usize::MAX);
        self.used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                (used < max).then_some(used + 1)
            })
            .ok()
            .map(|_| Reservation {
                slots: self,
                committed: false,
            })
    }

    /// Releases a committed slot. Call once per removed entry.
    pub(crate) fn release(&self) {
        // Saturate so an unbalanced release never wraps the counter.
        let _ = self
            .used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                used.checked_sub(1)
            });
    }

    #[cfg(test)]
    pub(crate) fn used(&self) -> usize {
        self.used.load(Ordering::Acquire)
    }
}

/// A reserved slot; released on drop unless committed.
#[must_use = "dropping a reservation releases the slot"]
pub(crate) struct Reservation<'a> {
    slots: &'a Slots,
    committed: bool,
}

impl Reservation<'_> {
    /// Keeps the slot occupied; the owner must call [`Slots::release`]
    /// when the entry goes away.
    pub(crate) fn commit(mut self) {
        self.committed = true;
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if !self.committed {
            self.slots.release();
        }
    }
}
