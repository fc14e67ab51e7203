//! Timer and sleep functionality for the async runtime.
//!
//! Timers live in a per-thread driver owned by the runtime thread. The
//! runtime fires expired timers each loop iteration and parks no longer
//! than the earliest remaining deadline.

use std::cell::RefCell;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant};

thread_local! {
    static TIMER_DRIVER: RefCell<TimerDriver> = const { RefCell::new(TimerDriver::new()) };
}

struct TimerDriver {
    timers: Vec<Timer>,
    next_id: u64,
}

struct Timer {
    id: u64,
    deadline: Instant,
    waker: Waker,
}

impl TimerDriver {
    const fn new() -> Self {
        Self {
            timers: Vec::new(),
            next_id: 0,
        }
    }

    /// Registers or refreshes the timer with `id`, returning its id.
    fn register(&mut self, id: Option<u64>, deadline: Instant, waker: &Waker) -> u64 {
        if let Some(id) = id
            && let Some(timer) = self.timers.iter_mut().find(|timer| timer.id == id)
        {
            if !timer.waker.will_wake(waker) {
                timer.waker = waker.clone();
            }
            return id;
        }

        let id = self.next_id;
        self.next_id += 1;
        self.timers.push(Timer {
            id,
            deadline,
            waker: waker.clone(),
        });

        id
    }

    fn cancel(&mut self, id: u64) {
        self.timers.retain(|timer| timer.id != id);
    }

    /// Wakes and removes expired timers. Returns true if any remain.
    fn fire_expired(&mut self) -> bool {
        let now = Instant::now();
        self.timers.retain(|timer| {
            if now >= timer.deadline {
                timer.waker.wake_by_ref();
                false
            } else {
                true
            }
        });

        !self.timers.is_empty()
    }

    fn next_remaining(&self) -> Option<Duration> {
        let now = Instant::now();
        self.timers
            .iter()
            .map(|timer| timer.deadline.saturating_duration_since(now))
            .min()
    }
}

/// A future that completes after a specified duration.
///
/// Created via [`sleep`]. Registers with the runtime's timer driver on
/// first poll and is woken when the deadline passes.
#[derive(Debug)]
pub struct Sleep {
    deadline: Instant,
    timer: Option<u64>,
}

impl Sleep {
    pub fn new(duration: Duration) -> Self {
        Self {
            deadline: Instant::now() + duration,
            timer: None,
        }
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }
}

impl Future for Sleep {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if Instant::now() >= self.deadline {
            return Poll::Ready(());
        }

        let deadline = self.deadline;
        let id = TIMER_DRIVER.with(|driver| {
            driver
                .borrow_mut()
                .register(self.timer, deadline, cx.waker())
        });
        self.timer = Some(id);

        Poll::Pending
    }
}

impl Drop for Sleep {
    fn drop(&mut self) {
        if let Some(id) = self.timer {
            // The driver may already be gone during thread teardown.
            let _ = TIMER_DRIVER.try_with(|driver| driver.borrow_mut().cancel(id));
        }
    }
}

/// Sleeps for the specified duration.
///
/// Must be awaited on a runtime thread; the runtime fires the timer.
///
/// # Example
/// ```ignore
/// use kbridge::sleep;
/// use std::time::Duration;
///
/// async {
///     sleep(Duration::from_millis(100)).await;
/// };
/// ```
pub fn sleep(duration: Duration) -> Sleep {
    Sleep::new(duration)
}

/// Fires expired timers. Returns true if timers are still pending.
pub(crate) fn process_timers() -> bool {
    TIMER_DRIVER.with(|driver| driver.borrow_mut().fire_expired())
}

/// Time until the earliest pending deadline, if any.
pub(crate) fn next_timer_remaining() -> Option<Duration> {
    TIMER_DRIVER.with(|driver| driver.borrow().next_remaining())
}
