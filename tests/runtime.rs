use kbridge::{JoinSet, Runtime, RuntimeBuilder, Task, sleep, yield_now};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

#[test]
fn test_block_on_returns_output() {
    let mut rt = Runtime::new();
    assert_eq!(rt.block_on(async { 42 }), 42);
}

#[test]
fn test_builder_multiple_instances() {
    let mut rt1 = RuntimeBuilder::new().build();
    let mut rt2 = RuntimeBuilder::new()
        .max_blocking_threads(2)
        .thread_keep_alive(Duration::from_millis(100))
        .thread_name("second")
        .build();

    assert_eq!(rt1.block_on(async { 10 }), 10);
    assert_eq!(rt2.block_on(async { 20 }), 20);
}

#[test]
#[should_panic(expected = "max_blocking_threads must be at least 1")]
fn test_builder_rejects_empty_pool() {
    let _ = RuntimeBuilder::new().max_blocking_threads(0);
}

#[test]
fn test_spawned_tasks_finish_before_block_on_returns() {
    let mut rt = Runtime::new();
    let counter = Arc::new(AtomicUsize::new(0));

    for _ in 0..5 {
        let counter = counter.clone();
        rt.spawn(async move {
            counter.fetch_add(1, Ordering::SeqCst);
        });
    }

    rt.block_on(async {});
    assert_eq!(counter.load(Ordering::SeqCst), 5);
}

#[test]
fn test_nested_spawns_run() {
    let mut rt = Runtime::new();
    let values = Arc::new(Mutex::new(Vec::new()));

    let v0 = values.clone();
    let v1 = values.clone();
    let v2 = values.clone();
    let v3 = values.clone();

    rt.block_on(async move {
        v0.lock().unwrap().push(1);

        Task::spawn(async move {
            v1.lock().unwrap().push(2);

            Task::spawn(async move {
                v2.lock().unwrap().push(3);
            });
        });

        Task::spawn(async move {
            v3.lock().unwrap().push(4);
        });
    });

    let mut vals = values.lock().unwrap().clone();
    vals.sort();
    assert_eq!(vals, vec![1, 2, 3, 4]);
}

#[test]
#[should_panic(expected = "Task::spawn() called outside of a runtime context")]
fn test_spawn_panics_outside_runtime() {
    Task::spawn(async {});
}

#[test]
fn test_join_handle_returns_value() {
    let mut rt = Runtime::new();
    let handle = rt.spawn(async { "done" });

    assert_eq!(rt.block_on(handle), "done");
}

#[test]
fn test_join_set_collects_outputs_in_order() {
    let mut rt = Runtime::new();

    let outputs = rt.block_on(async {
        let mut set = JoinSet::new();
        for i in 0..5u64 {
            set.push(Task::spawn(async move {
                // Later tasks finish first.
                sleep(Duration::from_millis(25 - 5 * i)).await;
                i
            }));
        }

        assert_eq!(set.len(), 5);
        let outputs = set.await_all().await;
        assert!(set.is_empty());
        outputs
    });

    assert_eq!(outputs, vec![0, 1, 2, 3, 4]);
}

#[test]
fn test_yield_now_interleaves_tasks() {
    let mut rt = Runtime::new();
    let log = Arc::new(Mutex::new(Vec::new()));

    let a = log.clone();
    let b = log.clone();

    rt.block_on(async move {
        let first = Task::spawn(async move {
            for i in 0..3 {
                a.lock().unwrap().push(("a", i));
                yield_now().await;
            }
        });
        let second = Task::spawn(async move {
            for i in 0..3 {
                b.lock().unwrap().push(("b", i));
                yield_now().await;
            }
        });

        first.await;
        second.await;
    });

    let log = log.lock().unwrap();
    assert_eq!(log.len(), 6);
    assert_eq!(log[0], ("a", 0));
    assert_eq!(log[1], ("b", 0));
    assert_eq!(log[2], ("a", 1));
}

#[test]
fn test_sleep_waits_at_least_duration() {
    let mut rt = Runtime::new();

    let start = Instant::now();
    rt.block_on(async {
        sleep(Duration::from_millis(50)).await;
    });

    assert!(start.elapsed() >= Duration::from_millis(50));
}

#[test]
fn test_zero_sleep_is_fast() {
    let mut rt = Runtime::new();

    let start = Instant::now();
    rt.block_on(async {
        sleep(Duration::ZERO).await;
    });

    assert!(start.elapsed() < Duration::from_millis(10));
}

#[test]
fn test_concurrent_sleeps_overlap() {
    let mut rt = Runtime::new();

    let start = Instant::now();
    rt.block_on(async {
        let mut set = JoinSet::new();
        for _ in 0..10 {
            set.push(Task::spawn(sleep(Duration::from_millis(40))));
        }
        set.await_all().await;
    });

    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_millis(40));
    assert!(elapsed < Duration::from_millis(400), "sleeps ran serially");
}
