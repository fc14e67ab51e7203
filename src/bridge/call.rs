//! Result slot shared between a suspended task and the helper thread that
//! performs its blocking call.

use crate::utils::lock;

use std::future::Future;
use std::mem;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};

use tracing::trace;

enum Slot<T> {
    Pending(Option<Waker>),
    Complete(T),
    Taken,
    // The suspended task went away before the outcome arrived.
    Abandoned,
}

type Salvage<T> = Box<dyn FnOnce(T) + Send>;

/// One in-flight blocking call.
///
/// The helper thread writes the outcome exactly once; the suspended task
/// takes it exactly once. Any `errno` the call produced is part of the
/// outcome, read on the helper thread before the slot is written.
///
/// An outcome nobody will take is passed to the salvage function instead
/// of being dropped, on whichever side lets go last.
pub(crate) struct BlockingCall<T> {
    slot: Mutex<Slot<T>>,
    salvage: Mutex<Option<Salvage<T>>>,
}

impl<T> BlockingCall<T> {
    pub(crate) fn new(salvage: Salvage<T>) -> Arc<Self> {
        Arc::new(Self {
            slot: Mutex::new(Slot::Pending(None)),
            salvage: Mutex::new(Some(salvage)),
        })
    }

    /// Stores the outcome and wakes the suspended task.
    pub(crate) fn complete(&self, value: T) {
        let mut slot = lock(&self.slot);

        match &mut *slot {
            Slot::Pending(waker) => {
                let waker = waker.take();
                *slot = Slot::Complete(value);
                drop(slot);

                if let Some(waker) = waker {
                    waker.wake();
                }
            }
            Slot::Abandoned => {
                *slot = Slot::Taken;
                drop(slot);
                self.salvage(value);
            }
            Slot::Complete(_) | Slot::Taken => {
                debug_assert!(false, "blocking call completed twice");
            }
        }
    }

    /// Gives up on the outcome. One that already arrived is salvaged now,
    /// a later one when it arrives.
    pub(crate) fn abandon(&self) {
        let mut slot = lock(&self.slot);

        match mem::replace(&mut *slot, Slot::Taken) {
            Slot::Pending(_) => *slot = Slot::Abandoned,
            Slot::Complete(value) => {
                drop(slot);
                self.salvage(value);
            }
            Slot::Taken | Slot::Abandoned => {}
        }
    }

    fn salvage(&self, value: T) {
        let salvage = lock(&self.salvage).take();
        if let Some(salvage) = salvage {
            trace!("salvaging outcome of abandoned blocking call");
            salvage(value);
        }
    }

    #[cfg(test)]
    fn is_complete(&self) -> bool {
        matches!(*lock(&self.slot), Slot::Complete(_))
    }

    fn poll_take(&self, cx: &mut Context<'_>) -> Poll<T> {
        let mut slot = lock(&self.slot);

        match mem::replace(&mut *slot, Slot::Taken) {
            Slot::Complete(value) => Poll::Ready(value),
            Slot::Pending(_) => {
                *slot = Slot::Pending(Some(cx.waker().clone()));
                Poll::Pending
            }
            Slot::Taken | Slot::Abandoned => panic!("blocking call result taken twice"),
        }
    }
}

/// Resolves once the helper thread has written the call's outcome.
///
/// Dropping it before then abandons the call.
pub(crate) struct Completion<T> {
    call: Arc<BlockingCall<T>>,
}

impl<T> Completion<T> {
    pub(crate) fn new(call: Arc<BlockingCall<T>>) -> Self {
        Self { call }
    }
}

impl<T> Future for Completion<T> {
    type Output = T;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.call.poll_take(cx)
    }
}

impl<T> Drop for Completion<T> {
    fn drop(&mut self) {
        self.call.abandon();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::task::Wake;

    struct CountingWaker(AtomicUsize);

    impl Wake for CountingWaker {
        fn wake(self: Arc<Self>) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn completion_wakes_the_registered_waker() {
        let counter = Arc::new(CountingWaker(AtomicUsize::new(0)));
        let waker = Waker::from(counter.clone());
        let mut cx = Context::from_waker(&waker);

        let call = BlockingCall::new(Box::new(drop::<Result<usize, i32>>));
        let mut completion = Completion::new(call.clone());

        assert!(Pin::new(&mut completion).poll(&mut cx).is_pending());
        assert!(!call.is_complete());

        call.complete(Err::<usize, i32>(libc::EBADF));
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
        assert!(call.is_complete());

        match Pin::new(&mut completion).poll(&mut cx) {
            Poll::Ready(outcome) => assert_eq!(outcome, Err(libc::EBADF)),
            Poll::Pending => panic!("completed call still pending"),
        }
    }

    #[test]
    fn completion_before_first_poll_is_ready() {
        let counter = Arc::new(CountingWaker(AtomicUsize::new(0)));
        let waker = Waker::from(counter.clone());
        let mut cx = Context::from_waker(&waker);

        let call = BlockingCall::new(Box::new(drop::<usize>));
        call.complete(7usize);

        let mut completion = Completion::new(call);
        assert!(matches!(
            Pin::new(&mut completion).poll(&mut cx),
            Poll::Ready(7)
        ));
        assert_eq!(counter.0.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn outcome_arriving_after_abandon_is_salvaged() {
        let (tx, rx) = mpsc::channel();
        let call = BlockingCall::new(Box::new(move |value: usize| tx.send(value).unwrap()));

        drop(Completion::new(call.clone()));
        assert!(rx.try_recv().is_err());

        call.complete(3);
        assert_eq!(rx.try_recv(), Ok(3));
    }

    #[test]
    fn outcome_left_untaken_is_salvaged_on_drop() {
        let (tx, rx) = mpsc::channel();
        let call = BlockingCall::new(Box::new(move |value: usize| tx.send(value).unwrap()));
        let completion = Completion::new(call.clone());

        call.complete(5);
        assert!(rx.try_recv().is_err());

        drop(completion);
        assert_eq!(rx.try_recv(), Ok(5));
    }

    #[test]
    fn taken_outcome_is_not_salvaged() {
        let counter = Arc::new(CountingWaker(AtomicUsize::new(0)));
        let waker = Waker::from(counter);
        let mut cx = Context::from_waker(&waker);

        let (tx, rx) = mpsc::channel();
        let call = BlockingCall::new(Box::new(move |value: usize| tx.send(value).unwrap()));
        let mut completion = Completion::new(call.clone());

        call.complete(9);
        assert!(matches!(
            Pin::new(&mut completion).poll(&mut cx),
            Poll::Ready(9)
        ));

        drop(completion);
        assert!(rx.try_recv().is_err());
    }
}
