//! Executor that polls queued tasks.

use crate::runtime::TaskQueue;

use std::sync::Arc;

pub(crate) struct Executor {
    queue: Arc<TaskQueue>,
}

impl Executor {
    pub(crate) fn new(queue: Arc<TaskQueue>) -> Self {
        Self { queue }
    }

    /// Polls the tasks that were ready when the tick started.
    ///
    /// Tasks woken during the tick wait for the next one, so a task that
    /// keeps yielding cannot starve the main future.
    pub(crate) fn tick(&self) {
        for _ in 0..self.queue.len() {
            match self.queue.pop() {
                Some(task) => task.run(),
                None => break,
            }
        }
    }

    /// Polls until no task is ready.
    pub(crate) fn drain(&self) {
        while let Some(task) = self.queue.pop() {
            task.run();
        }
    }
}
