//! Named shutdown tasks

use std::collections::HashMap;

/// Zero-argument cleanup action, run at most once. Errors are the action's
/// own business.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Mapping from task name to action; names are unique.
#[derive(Default)]
pub struct TaskRegistry {
    tasks: HashMap<String, Task>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a task, silently replacing any task with the same name.
    ///
    /// Returns `true` when an existing task was replaced.
    pub fn insert(&mut self, name: String, task: Task) -> bool {
        self.tasks.insert(name, task).is_some()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Move every registered task out, ordered by name.
    ///
    /// Tasks inserted afterwards stay in the registry for nobody to run.
    pub fn take(&mut self) -> Vec<(String, Task)> {
        let mut tasks: Vec<(String, Task)> = std::mem::take(&mut self.tasks).into_iter().collect();
        tasks.sort_by(|a, b| a.0.cmp(&b.0));
        tasks
    }
}
