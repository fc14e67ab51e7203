use crate::bridge::{BlockingPool, Unblock};
use crate::runtime::TaskQueue;
use crate::utils::lock;
use crate::utils::slab::Slab;

use std::sync::{Arc, Mutex};

use tracing::debug;

/// State shared between a [`Runtime`](crate::Runtime) and the tasks and
/// helper threads working on its behalf.
pub(crate) struct Handle {
    pub(crate) queue: Arc<TaskQueue>,
    pub(crate) pool: BlockingPool,
    blocking: Mutex<Slab<Arc<dyn Unblock>>>,
}

impl Handle {
    pub(crate) fn new(pool: BlockingPool) -> Self {
        Self {
            queue: Arc::new(TaskQueue::new()),
            pool,
            blocking: Mutex::new(Slab::new()),
        }
    }

    /// Records a blocking call in flight; the key releases it again.
    pub(crate) fn register_blocking(&self, unblock: Arc<dyn Unblock>) -> usize {
        lock(&self.blocking).insert(unblock)
    }

    pub(crate) fn unregister_blocking(&self, key: usize) {
        lock(&self.blocking).remove(key);
    }

    pub(crate) fn blocking_calls(&self) -> usize {
        lock(&self.blocking).len()
    }

    /// Fires the unblock function of every blocking call in flight.
    pub(crate) fn interrupt_blocking(&self) -> usize {
        let pending: Vec<Arc<dyn Unblock>> = lock(&self.blocking).iter().cloned().collect();

        for unblock in &pending {
            unblock.unblock();
        }

        if !pending.is_empty() {
            debug!(count = pending.len(), "interrupted blocking calls");
        }

        pending.len()
    }
}
