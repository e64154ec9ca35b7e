use std::collections::VecDeque;

use super::Task;

/// FIFO of tasks pending against one buffer.
#[derive(Debug, Default)]
pub struct TaskQueue {
    tasks: VecDeque<Task>,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, task: Task) {
        tracing::trace!(task = %task.name(), pending = self.tasks.len() + 1, "task queued");
        self.tasks.push_back(task);
    }

    /// Remove every task, oldest first.
    pub fn drain(&mut self) -> Vec<Task> {
        self.tasks.drain(..).collect()
    }

    /// Put drained tasks back in front of anything queued since, keeping
    /// their original order.
    pub fn restore(&mut self, tasks: Vec<Task>) {
        for task in tasks.into_iter().rev() {
            self.tasks.push_front(task);
        }
    }

    pub fn size(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Task> {
        self.tasks.iter()
    }
}
