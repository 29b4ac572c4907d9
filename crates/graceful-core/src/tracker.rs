//! Active-task bookkeeping for a shutdown run.
//!
//! Works like a wait group whose members have names: the run thread waits
//! until the set drains or the deadline passes, and on timeout reads back
//! who is still inside.

use std::collections::BTreeSet;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use crate::outcome::Outcome;

/// Names of tasks currently executing.
#[derive(Default)]
pub struct ActiveTasks {
    names: Mutex<BTreeSet<String>>,
    drained: Condvar,
}

/// RAII guard that removes its task from the set on drop.
///
/// Dropped on normal return and during unwinding, so a panicking task is
/// still accounted as finished.
pub struct ActiveGuard {
    set: Arc<ActiveTasks>,
    name: String,
}

impl ActiveTasks {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, BTreeSet<String>> {
        self.names.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record `name` as running.
    pub fn enter(self: &Arc<Self>, name: &str) -> ActiveGuard {
        self.lock().insert(name.to_string());
        ActiveGuard {
            set: Arc::clone(self),
            name: name.to_string(),
        }
    }

    fn leave(&self, name: &str) {
        let mut names = self.lock();
        names.remove(name);
        if names.is_empty() {
            self.drained.notify_all();
        }
    }

    /// Number of tasks still running.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Block until every task left or `deadline` passed; `None` waits
    /// without a deadline.
    ///
    /// The set is ordered, so the timeout report comes out sorted.
    pub fn wait_until(&self, deadline: Option<Instant>) -> Outcome {
        let mut names = self.lock();
        loop {
            if names.is_empty() {
                return Outcome::Clean;
            }
            names = match deadline {
                None => self
                    .drained
                    .wait(names)
                    .unwrap_or_else(PoisonError::into_inner),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Outcome::Timeout(names.iter().cloned().collect());
                    }
                    self.drained
                        .wait_timeout(names, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
            };
        }
    }
}

impl ActiveGuard {
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.set.leave(&self.name);
    }
}
