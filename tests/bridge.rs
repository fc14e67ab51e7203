mod common;

use common::{init_tracing, pipe, write_byte};
use kbridge::bridge::run_blocking;
use kbridge::{
    Error, Flags, Interest, ReadinessQueue, Runtime, RuntimeBuilder, Subscription, Target, Task,
    last_os_error, sleep, yield_now,
};
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::future::{Future, poll_fn};
use std::sync::{Arc, Mutex, mpsc};
use std::task::Poll;
use std::thread;
use std::time::{Duration, Instant};

#[test]
fn test_other_tasks_run_while_waiting() {
    init_tracing();
    let mut rt = Runtime::new();
    let queue = Arc::new(ReadinessQueue::new().unwrap());
    let ticks = Arc::new(AtomicUsize::new(0));

    let waiter = queue.clone();
    let counter = ticks.clone();

    let start = Instant::now();
    rt.block_on(async move {
        let wait = Task::spawn(async move { waiter.wait(4, Some(Duration::from_millis(500))).await });

        let worker = Task::spawn(async move {
            for _ in 0..10 {
                sleep(Duration::from_millis(5)).await;
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        worker.await;
        assert!(!wait.is_finished(), "waiter returned before its timeout");
        assert!(wait.await.unwrap().is_empty());
    });

    assert_eq!(ticks.load(Ordering::SeqCst), 10);
    assert!(start.elapsed() >= Duration::from_millis(500));
}

#[test]
fn test_events_arrive_while_task_is_suspended() {
    let mut rt = Runtime::new();
    let queue = Arc::new(ReadinessQueue::new().unwrap());
    let (read, write) = pipe();
    let target = Target::Descriptor(read.as_raw_fd());

    queue
        .update(&[Subscription::add(target, Interest::READABLE).with_tag(9)])
        .unwrap();

    let waiter = queue.clone();
    let events = rt.block_on(async move {
        let wait = Task::spawn(async move { waiter.wait(4, None).await });

        sleep(Duration::from_millis(20)).await;
        write_byte(write.as_raw_fd());

        wait.await
    });

    let events = events.unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].tag, 9);
}

#[test]
fn test_interrupt_from_join_handle() {
    init_tracing();
    let mut rt = Runtime::new();
    let queue = Arc::new(ReadinessQueue::new().unwrap());
    let waiter = queue.clone();

    let start = Instant::now();
    let (result, code) = rt.block_on(async move {
        let wait = Task::spawn(async move {
            let result = waiter.wait(4, None).await;
            (result, last_os_error())
        });

        sleep(Duration::from_millis(20)).await;
        assert!(wait.interrupt());

        wait.await
    });

    assert_eq!(result, Err(Error::Interrupted));
    assert_eq!(code, libc::EINTR);
    assert!(start.elapsed() < Duration::from_secs(5));
}

#[test]
fn test_interrupt_without_blocking_call_is_a_no_op() {
    let mut rt = Runtime::new();

    rt.block_on(async {
        let task = Task::spawn(async {
            yield_now().await;
            1
        });

        assert!(!task.interrupt());
        assert_eq!(task.await, 1);
    });
}

#[test]
fn test_unblocker_ends_wait() {
    let mut rt = Runtime::new();
    let queue = Arc::new(ReadinessQueue::new().unwrap());
    let unblocker = queue.unblocker();

    assert!(!unblocker.unblock(), "nothing is waiting yet");

    let waiter = queue.clone();
    let result = rt.block_on(async move {
        let wait = Task::spawn(async move { waiter.wait(4, Some(Duration::from_secs(30))).await });

        sleep(Duration::from_millis(20)).await;
        assert!(unblocker.unblock());

        wait.await
    });

    assert_eq!(result, Err(Error::Interrupted));
}

#[test]
fn test_unblock_from_another_thread_during_wait_blocking() {
    let queue = Arc::new(ReadinessQueue::new().unwrap());
    let unblocker = queue.unblocker();

    let handle = thread::spawn(move || {
        thread::sleep(Duration::from_millis(30));
        unblocker.unblock()
    });

    let start = Instant::now();
    let result = queue.wait_blocking(4, None);

    assert_eq!(result, Err(Error::Interrupted));
    assert_eq!(last_os_error(), libc::EINTR);
    assert!(handle.join().unwrap());
    assert!(start.elapsed() < Duration::from_secs(5));
}

#[test]
fn test_second_wait_is_already_waiting() {
    let mut rt = Runtime::new();
    let queue = Arc::new(ReadinessQueue::new().unwrap());
    let first = queue.clone();
    let second = queue.clone();

    rt.block_on(async move {
        let wait = Task::spawn(async move { first.wait(4, Some(Duration::from_secs(30))).await });
        sleep(Duration::from_millis(20)).await;

        let err = second.wait(4, Some(Duration::ZERO)).await.unwrap_err();
        assert_eq!(err, Error::AlreadyWaiting);
        assert_eq!(last_os_error(), libc::EBUSY);

        assert!(wait.interrupt());
        assert_eq!(wait.await, Err(Error::Interrupted));
    });
}

#[test]
fn test_close_during_wait() {
    let mut rt = Runtime::new();
    let queue = Arc::new(ReadinessQueue::new().unwrap());
    let waiter = queue.clone();
    let closer = queue.clone();

    let result = rt.block_on(async move {
        let wait = Task::spawn(async move { waiter.wait(4, None).await });
        sleep(Duration::from_millis(20)).await;

        closer.close().unwrap();
        wait.await
    });

    assert_eq!(result, Err(Error::InvalidHandle));
}

#[test]
fn test_runtime_interrupts_all_blocking_calls() {
    let mut rt = RuntimeBuilder::new().max_blocking_threads(4).build();
    let queues: Vec<_> = (0..3)
        .map(|_| Arc::new(ReadinessQueue::new().unwrap()))
        .collect();

    let handles: Vec<_> = queues
        .iter()
        .map(|queue| {
            let queue = queue.clone();
            rt.spawn(async move { queue.wait(4, None).await })
        })
        .collect();

    rt.block_on(async { sleep(Duration::from_millis(30)).await });
    assert_eq!(rt.blocking_calls(), 3);
    assert_eq!(rt.interrupt_blocking(), 3);

    for handle in handles {
        assert_eq!(rt.block_on(handle), Err(Error::Interrupted));
    }
    assert_eq!(rt.blocking_calls(), 0);
}

#[test]
fn test_saturated_pool_queues_calls() {
    let mut rt = RuntimeBuilder::new()
        .max_blocking_threads(1)
        .thread_name("saturated")
        .build();
    let order = Arc::new(AtomicUsize::new(0));

    let first = order.clone();
    let second = order.clone();
    let (a, b) = rt.block_on(async move {
        let a = Task::spawn(async move {
            run_blocking(
                move || {
                    thread::sleep(Duration::from_millis(30));
                    first.fetch_add(1, Ordering::SeqCst)
                },
                Arc::new(|| {}),
            )
            .await
        });
        let b = Task::spawn(async move {
            run_blocking(move || second.fetch_add(1, Ordering::SeqCst), Arc::new(|| {})).await
        });

        (a.await.unwrap(), b.await.unwrap())
    });

    assert_eq!((a, b), (0, 1));
}

#[test]
fn test_run_blocking_uses_named_helper() {
    let (tx, rx) = mpsc::channel();
    let mut rt = Runtime::new();

    let name = rt
        .block_on(run_blocking(
            move || {
                let name = thread::current().name().map(str::to_owned);
                tx.send(()).unwrap();
                name
            },
            Arc::new(|| {}),
        ))
        .unwrap();

    rx.recv_timeout(Duration::from_secs(1)).unwrap();
    assert!(name.unwrap().starts_with("kbridge-blocking"));
}

#[test]
fn test_interrupt_fires_custom_unblock() {
    let mut rt = Runtime::new();
    let unblocked = Arc::new(AtomicBool::new(false));
    let flag = unblocked.clone();
    let (release_tx, release_rx) = mpsc::channel::<()>();

    rt.block_on(async move {
        let call = Task::spawn(async move {
            let release = Mutex::new(Some(release_tx));
            run_blocking(
                move || {
                    let _ = release_rx.recv();
                },
                Arc::new(move || {
                    flag.store(true, Ordering::SeqCst);
                    release.lock().unwrap().take();
                }),
            )
            .await
        });

        sleep(Duration::from_millis(20)).await;
        assert!(call.interrupt());
        call.await.unwrap();
    });

    assert!(unblocked.load(Ordering::SeqCst));
}

#[test]
fn test_dropping_bridged_future_unblocks_helper() {
    let mut rt = Runtime::new();
    let unblocked = Arc::new(AtomicBool::new(false));
    let flag = unblocked.clone();
    let (release_tx, release_rx) = mpsc::channel::<()>();
    let (done_tx, done_rx) = mpsc::channel();

    rt.block_on(async move {
        let release = Mutex::new(Some(release_tx));
        let mut call = Box::pin(run_blocking(
            move || {
                let _ = release_rx.recv();
                done_tx.send(()).unwrap();
            },
            Arc::new(move || {
                flag.store(true, Ordering::SeqCst);
                release.lock().unwrap().take();
            }),
        ));

        poll_fn(|cx| {
            assert!(call.as_mut().poll(cx).is_pending());
            Poll::Ready(())
        })
        .await;

        drop(call);
    });

    assert!(unblocked.load(Ordering::SeqCst));
    done_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("helper still parked after the future was dropped");
}

#[test]
fn test_dropped_wait_keeps_collected_events() {
    init_tracing();
    let mut rt = Runtime::new();
    let queue = ReadinessQueue::new().unwrap();
    let (read, write) = pipe();
    let target = Target::Descriptor(read.as_raw_fd());

    queue
        .update(&[Subscription::add(target, Interest::READABLE)
            .with_flags(Flags::ONESHOT)
            .with_tag(5)])
        .unwrap();

    let events = rt.block_on(async {
        let mut wait = Box::pin(queue.wait(8, None));
        poll_fn(|cx| {
            assert!(wait.as_mut().poll(cx).is_pending());
            Poll::Ready(())
        })
        .await;

        // The helper picks the event up while nobody is polling the wait.
        write_byte(write.as_raw_fd());
        thread::sleep(Duration::from_millis(100));
        drop(wait);

        queue.wait(8, Some(Duration::from_millis(300))).await
    });

    let events = events.unwrap();
    assert_eq!(events.len(), 1, "oneshot event lost with the dropped wait");
    assert_eq!(events[0].tag, 5);
}

#[test]
fn test_queue_stays_claimed_until_abandoned_helper_returns() {
    let mut rt = Runtime::new();
    let queue = ReadinessQueue::new().unwrap();
    let (read, write) = pipe();
    let target = Target::Descriptor(read.as_raw_fd());

    queue
        .update(&[Subscription::add(target, Interest::READABLE)
            .with_flags(Flags::ONESHOT)
            .with_tag(6)])
        .unwrap();

    let events = rt.block_on(async {
        let mut wait = Box::pin(queue.wait(8, None));
        poll_fn(|cx| {
            assert!(wait.as_mut().poll(cx).is_pending());
            Poll::Ready(())
        })
        .await;

        drop(wait);
        write_byte(write.as_raw_fd());

        // Whichever wait sees the event, it must surface exactly once.
        let start = Instant::now();
        loop {
            match queue.wait(8, Some(Duration::from_millis(300))).await {
                Err(Error::AlreadyWaiting) => {
                    assert!(start.elapsed() < Duration::from_secs(5));
                    sleep(Duration::from_millis(5)).await;
                }
                other => break other,
            }
        }
    });

    let events = events.unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].tag, 6);

    let again = rt
        .block_on(queue.wait(8, Some(Duration::from_millis(30))))
        .unwrap();
    assert!(again.is_empty());
}
