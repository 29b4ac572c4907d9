//! Completion result of a shutdown run

use serde::Serialize;

/// Result of one shutdown run.
///
/// Only liveness is reported: a task that returned (or panicked) before the
/// deadline counts as finished.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "tasks", rename_all = "lowercase")]
pub enum Outcome {
    /// Every task returned before the deadline.
    Clean,
    /// Deadline elapsed; names of the tasks still running, sorted.
    Timeout(Vec<String>),
}

impl Outcome {
    /// Build a timeout outcome, sorting names for a reproducible report.
    pub fn timeout(names: impl IntoIterator<Item = String>) -> Self {
        let mut names: Vec<String> = names.into_iter().collect();
        names.sort();
        Self::Timeout(names)
    }

    pub fn is_clean(&self) -> bool {
        matches!(self, Self::Clean)
    }

    /// Names of tasks that missed the deadline (empty when clean).
    pub fn stuck_tasks(&self) -> &[String] {
        match self {
            Self::Clean => &[],
            Self::Timeout(names) => names,
        }
    }

    pub fn into_result(self) -> Result<(), TimeoutError> {
        match self {
            Self::Clean => Ok(()),
            Self::Timeout(names) => Err(TimeoutError(names)),
        }
    }
}

/// Tasks that failed to finish in time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeoutError(pub Vec<String>);

impl std::fmt::Display for TimeoutError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "shutdown timeout, tasks left: {}", self.0.join(", "))
    }
}

impl std::error::Error for TimeoutError {}
