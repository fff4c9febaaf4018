//! Multithreaded queue behaviour: blocking, shutdown and cancellation.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

use hobj_runtime::{
    Backend, CancellationSource, End, Limit, QueueError, QueueHandle, QueueState, Registry,
    RegistryConfig, Timeout,
};

fn lock_free_registry() -> Registry {
    Registry::with_config(RegistryConfig {
        backend: Backend::LockFree,
        ..RegistryConfig::default()
    })
    .unwrap()
}

#[test]
fn test_limit_one_shutdown_sequence() {
    let registry = Registry::new();
    let queue = QueueHandle::create(&registry, Limit::Max(1)).unwrap();
    queue.enqueue("first", Timeout::Forever, End::Back).unwrap();

    let second = {
        let queue = queue.clone();
        thread::spawn(move || queue.enqueue("second", Timeout::Immediate, End::Back))
    };
    let err = second.join().unwrap().unwrap_err();
    assert_eq!(err.kind(), QueueError::Timeout);
    assert_eq!(err.into_inner(), "second");

    assert_eq!(queue.shutdown(Timeout::Immediate), Err(QueueError::Timeout));
    assert_eq!(queue.dequeue(Timeout::Immediate), Ok("first"));
    assert_eq!(queue.shutdown(Timeout::Immediate), Ok(()));
    assert_eq!(queue.state(), QueueState::Invalid);
    assert!(registry.is_empty());
}

#[test]
fn test_producers_and_consumers_move_every_item() {
    const PRODUCERS: u64 = 4;
    const CONSUMERS: usize = 4;
    const PER_PRODUCER: u64 = 5_000;

    for registry in [Registry::new(), lock_free_registry()] {
        let queue = QueueHandle::create(&registry, Limit::Max(64)).unwrap();
        let total = Arc::new(AtomicU64::new(0));
        let received = Arc::new(AtomicU64::new(0));

        let consumers: Vec<_> = (0..CONSUMERS)
            .map(|_| {
                let queue = queue.clone();
                let total = Arc::clone(&total);
                let received = Arc::clone(&received);
                thread::spawn(move || {
                    while let Ok(v) = queue.dequeue(Timeout::Forever) {
                        total.fetch_add(v, Ordering::Relaxed);
                        received.fetch_add(1, Ordering::Relaxed);
                    }
                })
            })
            .collect();

        let producers: Vec<_> = (0..PRODUCERS)
            .map(|p| {
                let queue = queue.clone();
                thread::spawn(move || {
                    for i in 0..PER_PRODUCER {
                        queue.push(p * PER_PRODUCER + i).unwrap();
                    }
                })
            })
            .collect();
        for producer in producers {
            producer.join().unwrap();
        }

        queue.shutdown(Timeout::Forever).unwrap();
        for consumer in consumers {
            consumer.join().unwrap();
        }

        let n = PRODUCERS * PER_PRODUCER;
        assert_eq!(received.load(Ordering::Relaxed), n);
        assert_eq!(total.load(Ordering::Relaxed), n * (n - 1) / 2);
        assert!(registry.is_empty());
    }
}

#[test]
fn test_fifo_per_producer() {
    let registry = Registry::new();
    let queue = QueueHandle::create(&registry, Limit::Max(8)).unwrap();

    let producer = {
        let queue = queue.clone();
        thread::spawn(move || {
            for i in 0..1_000u32 {
                queue.push(i).unwrap();
            }
        })
    };
    for expected in 0..1_000u32 {
        assert_eq!(queue.dequeue(Timeout::Forever), Ok(expected));
    }
    producer.join().unwrap();
}

#[test]
fn test_shutdown_wakes_every_blocked_consumer() {
    let registry = Registry::new();
    let queue: QueueHandle<u32> = QueueHandle::create(&registry, Limit::Unbounded).unwrap();
    let ready = Arc::new(Barrier::new(5));

    let consumers: Vec<_> = (0..4)
        .map(|_| {
            let queue = queue.clone();
            let ready = Arc::clone(&ready);
            thread::spawn(move || {
                ready.wait();
                queue.dequeue(Timeout::Forever)
            })
        })
        .collect();
    ready.wait();
    thread::sleep(Duration::from_millis(20));

    assert_eq!(queue.shutdown(Timeout::After(Duration::from_secs(5))), Ok(()));
    for consumer in consumers {
        let result = consumer.join().unwrap();
        assert!(matches!(
            result,
            Err(QueueError::Shutdown) | Err(QueueError::Invalid)
        ));
    }
}

#[test]
fn test_shutdown_wakes_blocked_producer() {
    let registry = Registry::new();
    let queue = QueueHandle::create(&registry, Limit::Max(1)).unwrap();
    queue.push(0u32).unwrap();

    let producer = {
        let queue = queue.clone();
        thread::spawn(move || queue.enqueue(1, Timeout::Forever, End::Back))
    };
    thread::sleep(Duration::from_millis(20));

    assert_eq!(queue.shutdown(Timeout::Immediate), Err(QueueError::Timeout));
    let err = producer.join().unwrap().unwrap_err();
    assert_eq!(err.kind(), QueueError::Shutdown);

    assert_eq!(queue.dequeue(Timeout::Immediate), Ok(0));
    assert_eq!(queue.shutdown(Timeout::Immediate), Ok(()));
}

#[test]
fn test_cancelled_dequeue_leaves_no_waiter() {
    let registry = Registry::new();
    let queue: QueueHandle<u32> = QueueHandle::create(&registry, Limit::Unbounded).unwrap();
    let source = CancellationSource::new();

    let consumer = {
        let queue = queue.clone();
        let token = source.token();
        thread::spawn(move || {
            let start = Instant::now();
            let result = queue.dequeue_cancellable(Timeout::Forever, &token);
            (result, start.elapsed())
        })
    };
    thread::sleep(Duration::from_millis(30));

    source.cancel();
    let (result, elapsed) = consumer.join().unwrap();
    assert_eq!(result, Err(QueueError::Cancelled));
    assert!(elapsed < Duration::from_secs(5));

    // Drains immediately only if the cancelled thread unregistered itself.
    assert_eq!(queue.shutdown(Timeout::Immediate), Ok(()));
}

#[test]
fn test_cancel_during_shutdown_wait() {
    let registry = Registry::new();
    let queue = QueueHandle::create(&registry, Limit::Unbounded).unwrap();
    queue.push(1u32).unwrap();
    let source = CancellationSource::new();

    let closer = {
        let queue = queue.clone();
        let token = source.token();
        thread::spawn(move || queue.shutdown_cancellable(Timeout::Forever, &token))
    };
    thread::sleep(Duration::from_millis(20));
    source.cancel();

    assert_eq!(closer.join().unwrap(), Err(QueueError::Cancelled));
    assert_eq!(queue.state(), QueueState::Draining);
    assert_eq!(queue.dequeue(Timeout::Immediate), Ok(1));
    assert_eq!(queue.shutdown(Timeout::Immediate), Ok(()));
}

#[test]
fn test_child_token_cancels_with_parent() {
    let registry = Registry::new();
    let queue: QueueHandle<u32> = QueueHandle::create(&registry, Limit::Unbounded).unwrap();
    let parent = CancellationSource::new();
    let child = parent.token().child();

    let consumer = {
        let queue = queue.clone();
        thread::spawn(move || queue.dequeue_cancellable(Timeout::Forever, &child))
    };
    thread::sleep(Duration::from_millis(20));

    parent.cancel();
    assert_eq!(consumer.join().unwrap(), Err(QueueError::Cancelled));
}

#[test]
fn test_concurrent_shutdown_releases_once() {
    let registry = Registry::new();
    let queue: QueueHandle<u32> = QueueHandle::create(&registry, Limit::Unbounded).unwrap();
    let barrier = Arc::new(Barrier::new(4));

    let closers: Vec<_> = (0..4)
        .map(|_| {
            let queue = queue.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                queue.shutdown(Timeout::Forever)
            })
        })
        .collect();
    for closer in closers {
        let result = closer.join().unwrap();
        assert!(matches!(result, Ok(()) | Err(QueueError::Invalid)));
    }
    assert!(registry.is_empty());
}

#[test]
fn test_timed_dequeue_honours_deadline() {
    let registry = Registry::new();
    let queue: QueueHandle<u32> = QueueHandle::create(&registry, Limit::Unbounded).unwrap();

    let start = Instant::now();
    assert_eq!(queue.dequeue(0.05), Err(QueueError::Timeout));
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_millis(50));
    assert!(elapsed < Duration::from_secs(5));
}
