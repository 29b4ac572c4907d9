//! One-shot completion cell and delivery modes

use std::sync::mpsc::Sender;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::outcome::Outcome;

/// Single-assignment cell holding the outcome of a run.
///
/// Readers block until the value is set; afterwards every read returns
/// immediately with a clone.
#[derive(Default)]
pub struct Completion {
    slot: Mutex<Option<Outcome>>,
    ready: Condvar,
}

impl Completion {
    fn lock(&self) -> MutexGuard<'_, Option<Outcome>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Store the outcome. Returns `false` if one was already stored.
    pub fn set(&self, outcome: Outcome) -> bool {
        let mut slot = self.lock();
        if slot.is_some() {
            return false;
        }
        *slot = Some(outcome);
        self.ready.notify_all();
        true
    }

    pub fn get(&self) -> Option<Outcome> {
        self.lock().clone()
    }

    pub fn wait(&self) -> Outcome {
        let mut slot = self.lock();
        loop {
            if let Some(outcome) = &*slot {
                return outcome.clone();
            }
            slot = self
                .ready
                .wait(slot)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Like [`wait`](Self::wait), giving up after `timeout`.
    ///
    /// A timeout too large to represent as an instant waits forever.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Outcome> {
        let Some(deadline) = Instant::now().checked_add(timeout) else {
            return Some(self.wait());
        };
        let mut slot = self.lock();
        loop {
            if let Some(outcome) = &*slot {
                return Some(outcome.clone());
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            slot = self
                .ready
                .wait_timeout(slot, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }
}

/// Where the outcome goes once a run finishes.
pub enum Delivery {
    /// The switch owns the exit decision: status 0 when clean, 1 on timeout.
    Exit,
    /// Forward to a caller-owned channel, then drop the sender.
    Sink(Sender<Outcome>),
}

/// Process exit policy of [`Delivery::Exit`].
pub(crate) fn exit_with(outcome: &Outcome) -> ! {
    let code = match outcome.clone().into_result() {
        Ok(()) => {
            log::info!("Shutdown complete");
            0
        }
        Err(e) => {
            log::error!("{e}");
            eprintln!("{e}");
            1
        }
    };
    log::logger().flush();
    std::process::exit(code)
}
