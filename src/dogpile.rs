//! The dogpile-effect coordinator.
//!
//! A small fixed table of pending-miss markers, indexed by
//! `fingerprint mod table size`. When a lookup misses (or the entry is about
//! to expire), the first caller takes the slot's marker and is invited to
//! compute the value; callers arriving while the marker is pending either
//! wait for the computation (synchronous path), get told they would block
//! (asynchronous path), or are served the still-resident stale value.
//!
//! The table is purely advisory. Two unrelated fingerprints sharing a slot
//! simply overwrite each other's markers, which at worst lets a duplicate
//! computation through, bounded by the collision rate.

use std::time::Duration;

use parking_lot::{Condvar, Mutex};

#[derive(Default)]
struct DeState {
    fingerprint: u64,
    /// Wall-clock ms at which the pending marker lapses; zero when idle.
    deadline: u64,
}

struct DeSlot {
    state: Mutex<DeState>,
    resolved: Condvar,
}

/// Outcome of probing a slot for a missing (or near-expiry) fingerprint.
pub(crate) enum DeProbe {
    /// The caller took the marker and should compute the value.
    Marked,
    /// Another caller is already computing; the marker lapses at `deadline`.
    Pending { deadline: u64 },
}

pub(crate) struct DogpileTable {
    slots: Box<[DeSlot]>,
}

impl DogpileTable {
    pub fn new(size: usize) -> Self {
        let slots = (0..size)
            .map(|_| DeSlot {
                state: Mutex::new(DeState::default()),
                resolved: Condvar::new(),
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self { slots }
    }

    fn slot(&self, fingerprint: u64) -> &DeSlot {
        &self.slots[(fingerprint % self.slots.len() as u64) as usize]
    }

    /// Probes the marker for `fingerprint`. An idle, lapsed or
    /// foreign-fingerprint slot is taken over with a marker lapsing at
    /// `deadline`; a live marker for the same fingerprint is left alone.
    pub fn probe(&self, fingerprint: u64, now: u64, deadline: u64) -> DeProbe {
        let slot = self.slot(fingerprint);
        let mut state = slot.state.lock();

        if state.deadline > now && state.fingerprint == fingerprint {
            DeProbe::Pending {
                deadline: state.deadline,
            }
        } else {
            state.fingerprint = fingerprint;
            state.deadline = deadline;
            DeProbe::Marked
        }
    }

    /// Blocks until the marker for `fingerprint` is resolved, lapses, or
    /// `until` passes, whichever comes first. Spurious wakeups are fine;
    /// callers re-probe in a loop.
    pub fn wait(&self, fingerprint: u64, now: u64, until: u64) {
        let slot = self.slot(fingerprint);
        let mut state = slot.state.lock();

        let lapse = state.deadline.min(until);
        if state.deadline > now && state.fingerprint == fingerprint && lapse > now {
            let _ = slot
                .resolved
                .wait_for(&mut state, Duration::from_millis(lapse - now));
        }
    }

    /// Resolves the marker for `fingerprint` (called on commit) and wakes
    /// every waiter on the slot.
    pub fn complete(&self, fingerprint: u64) {
        let slot = self.slot(fingerprint);
        {
            let mut state = slot.state.lock();
            if state.fingerprint == fingerprint {
                state.deadline = 0;
            }
        }
        slot.resolved.notify_all();
    }

    /// Resets every slot to idle. Used by `clear`.
    pub fn clear(&self) {
        for slot in self.slots.iter() {
            {
                let mut state = slot.state.lock();
                state.deadline = 0;
            }
            slot.resolved.notify_all();
        }
    }
}
