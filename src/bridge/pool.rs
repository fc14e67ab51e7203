//! Helper threads that run blocking calls off the runtime thread.
//!
//! Threads are spawned on demand up to a cap and retire after sitting idle
//! for the keep-alive period. A job never waits behind another running job
//! while the cap allows a new thread.

use crate::utils::lock;

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, OnceLock, PoisonError};
use std::thread;
use std::time::Duration;

use tracing::{debug, trace, warn};

pub(crate) type Job = Box<dyn FnOnce() + Send + 'static>;

#[derive(Clone, Debug)]
pub(crate) struct PoolConfig {
    pub(crate) max_threads: usize,
    pub(crate) keep_alive: Duration,
    pub(crate) thread_name: String,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_threads: 512,
            keep_alive: Duration::from_secs(10),
            thread_name: String::from("kbridge-blocking"),
        }
    }
}

#[derive(Clone)]
pub(crate) struct BlockingPool {
    inner: Arc<Inner>,
}

struct Inner {
    state: Mutex<State>,
    condvar: Condvar,
    config: PoolConfig,
}

#[derive(Default)]
struct State {
    jobs: VecDeque<Job>,
    threads: usize,
    idle: usize,
    // Idle threads already claimed by a queued job.
    notified: usize,
    next_id: usize,
    shutdown: bool,
}

impl BlockingPool {
    pub(crate) fn new(config: PoolConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
                condvar: Condvar::new(),
                config,
            }),
        }
    }

    /// Pool used by bridged calls made outside any runtime.
    pub(crate) fn global() -> &'static BlockingPool {
        static GLOBAL: OnceLock<BlockingPool> = OnceLock::new();
        GLOBAL.get_or_init(|| BlockingPool::new(PoolConfig::default()))
    }

    /// Hands `job` to a helper thread.
    ///
    /// Fails with the `errno` of the thread spawn when no helper is idle and
    /// none could be started, or with `ECANCELED` after shutdown.
    pub(crate) fn execute(&self, job: Job) -> Result<(), i32> {
        let mut state = lock(&self.inner.state);

        if state.shutdown {
            return Err(libc::ECANCELED);
        }

        if state.idle > state.notified {
            state.notified += 1;
            state.jobs.push_back(job);
            self.inner.condvar.notify_one();
            return Ok(());
        }

        if state.threads >= self.inner.config.max_threads {
            trace!(
                threads = state.threads,
                "blocking pool saturated, job queued"
            );
            state.jobs.push_back(job);
            return Ok(());
        }

        let id = state.next_id;
        let inner = self.inner.clone();
        let spawned = thread::Builder::new()
            .name(format!("{}-{}", self.inner.config.thread_name, id))
            .spawn(move || run_worker(inner, id));

        match spawned {
            Ok(_) => {
                state.next_id += 1;
                state.threads += 1;
                state.jobs.push_back(job);
                Ok(())
            }
            Err(error) if state.threads > 0 => {
                warn!(%error, "failed to start blocking helper, job queued");
                state.jobs.push_back(job);
                Ok(())
            }
            Err(error) => Err(error.raw_os_error().unwrap_or(libc::EAGAIN)),
        }
    }

    #[cfg(test)]
    fn threads(&self) -> usize {
        lock(&self.inner.state).threads
    }

    /// Stops accepting jobs and lets idle helpers exit. Jobs already queued
    /// still run.
    pub(crate) fn shutdown(&self) {
        let mut state = lock(&self.inner.state);
        if state.shutdown {
            return;
        }

        state.shutdown = true;
        self.inner.condvar.notify_all();
        debug!(threads = state.threads, "blocking pool shut down");
    }
}

fn run_worker(inner: Arc<Inner>, id: usize) {
    trace!(id, "blocking helper started");

    let mut state = lock(&inner.state);

    'work: loop {
        while let Some(job) = state.jobs.pop_front() {
            drop(state);
            job();
            state = lock(&inner.state);
        }

        if state.shutdown {
            break;
        }

        state.idle += 1;

        loop {
            let (guard, result) = inner
                .condvar
                .wait_timeout(state, inner.config.keep_alive)
                .unwrap_or_else(PoisonError::into_inner);
            state = guard;

            if state.notified > 0 {
                state.notified -= 1;
                state.idle -= 1;
                continue 'work;
            }

            if state.shutdown || (result.timed_out() && state.jobs.is_empty()) {
                state.idle -= 1;
                break 'work;
            }
        }
    }

    state.threads -= 1;
    trace!(id, "blocking helper exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Instant;

    fn config(max_threads: usize, keep_alive: Duration) -> PoolConfig {
        PoolConfig {
            max_threads,
            keep_alive,
            thread_name: String::from("pool-test"),
        }
    }

    #[test]
    fn jobs_do_not_queue_behind_a_blocked_helper() {
        let pool = BlockingPool::new(config(4, Duration::from_secs(1)));
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let (done_tx, done_rx) = mpsc::channel();

        pool.execute(Box::new(move || {
            let _ = release_rx.recv();
        }))
        .unwrap();

        pool.execute(Box::new(move || done_tx.send(()).unwrap()))
            .unwrap();

        done_rx
            .recv_timeout(Duration::from_secs(2))
            .expect("second job stuck behind the first");
        release_tx.send(()).unwrap();
    }

    #[test]
    fn idle_helpers_are_reused() {
        let pool = BlockingPool::new(config(4, Duration::from_secs(5)));

        for _ in 0..3 {
            let (tx, rx) = mpsc::channel();
            pool.execute(Box::new(move || tx.send(()).unwrap())).unwrap();
            rx.recv_timeout(Duration::from_secs(2)).unwrap();
            // Give the helper time to park before the next job arrives.
            thread::sleep(Duration::from_millis(20));
        }

        assert_eq!(pool.threads(), 1);
    }

    #[test]
    fn idle_helpers_retire_after_keep_alive() {
        let pool = BlockingPool::new(config(2, Duration::from_millis(20)));
        let (tx, rx) = mpsc::channel();
        pool.execute(Box::new(move || tx.send(()).unwrap())).unwrap();
        rx.recv_timeout(Duration::from_secs(2)).unwrap();

        let start = Instant::now();
        while pool.threads() > 0 {
            assert!(start.elapsed() < Duration::from_secs(2));
            thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn shutdown_rejects_new_jobs() {
        let pool = BlockingPool::new(config(1, Duration::from_secs(1)));
        pool.shutdown();

        assert_eq!(pool.execute(Box::new(|| {})), Err(libc::ECANCELED));
    }
}
