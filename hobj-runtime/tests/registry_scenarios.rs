//! Registry scenarios across both backends.

use std::any::Any;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

use hobj_runtime::{Backend, Class, Handle, Ref, Registry, RegistryConfig, RegistryError, TypeTag};

struct Task {
    id: u32,
}

impl Class for Task {
    const TAG: TypeTag = TypeTag::new("task");
}

struct TimerTask {
    task: Task,
    period_ms: u64,
}

impl Class for TimerTask {
    const TAG: TypeTag = TypeTag::new("task:timer");

    fn upcast(&self, tag: &str) -> Option<&dyn Any> {
        (tag == Task::TAG.as_str()).then_some(&self.task as &dyn Any)
    }
}

struct Tracked(Arc<AtomicUsize>);

impl Class for Tracked {
    const TAG: TypeTag = TypeTag::new("tracked");
}

impl Drop for Tracked {
    fn drop(&mut self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

fn registries() -> Vec<Registry> {
    [Backend::Locked, Backend::LockFree]
        .into_iter()
        .map(|backend| {
            Registry::with_config(RegistryConfig {
                backend,
                ..RegistryConfig::default()
            })
            .unwrap()
        })
        .collect()
}

#[test]
fn test_ten_thousand_objects() {
    for registry in registries() {
        let handles: Vec<Handle> = (0..10_000)
            .map(|id| Ref::into_handle(registry.create(Task { id }).unwrap()))
            .collect();

        assert_eq!(registry.gather("").len(), 10_000);
        assert_eq!(registry.gather("task").len(), 10_000);
        assert!(registry.capacity() >= 10_000);

        for handle in &handles {
            registry.release(*handle).unwrap();
        }
        assert!(registry.gather("").is_empty());
        assert!(registry.is_empty());

        let stats = registry.stats();
        assert_eq!(stats.created, 10_000);
        assert_eq!(stats.destroyed, 10_000);
        for handle in handles.iter().step_by(997) {
            assert!(registry.lookup(*handle).is_none());
        }
    }
}

#[test]
fn test_derived_type_seen_through_ancestor() {
    for registry in registries() {
        let timer = registry
            .create(TimerTask {
                task: Task { id: 7 },
                period_ms: 250,
            })
            .unwrap();
        let _plain = registry.create(Task { id: 8 }).unwrap();

        let mut ids = Vec::new();
        registry.apply("task", |_, obj| {
            if let Some(task) = obj.cast::<Task>() {
                ids.push(task.id);
            }
        });
        ids.sort_unstable();
        assert_eq!(ids, vec![7, 8]);
        assert_eq!(registry.gather("task:timer"), vec![Ref::handle(&timer)]);

        let obj = registry.lookup(Ref::handle(&timer)).unwrap();
        assert_eq!(obj.cast::<TimerTask>().map(|t| t.period_ms), Some(250));
        assert!(obj.downcast::<Task>().is_err());
    }
}

#[test]
fn test_release_after_destruction_is_invalid() {
    for registry in registries() {
        let handle = Ref::into_handle(registry.create(Task { id: 1 }).unwrap());
        registry.release(handle).unwrap();
        assert_eq!(registry.release(handle), Err(RegistryError::Invalid(handle)));
    }
}

#[test]
fn test_concurrent_churn() {
    const THREADS: usize = 8;
    const ROUNDS: usize = 2_000;

    for registry in registries() {
        let drops = Arc::new(AtomicUsize::new(0));
        let shared = Ref::into_handle(registry.create(Tracked(Arc::clone(&drops))).unwrap());
        let barrier = Arc::new(Barrier::new(THREADS));

        let workers: Vec<_> = (0..THREADS)
            .map(|_| {
                let registry = registry.clone();
                let drops = Arc::clone(&drops);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    for _ in 0..ROUNDS {
                        let own = registry.create(Tracked(Arc::clone(&drops))).unwrap();
                        let seen = registry.lookup(shared).unwrap();
                        assert!(seen.cast::<Tracked>().is_some());
                        drop(own);
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }

        assert_eq!(drops.load(Ordering::SeqCst), THREADS * ROUNDS);
        assert_eq!(registry.refcount(shared), Some(1));
        registry.release(shared).unwrap();
        assert_eq!(drops.load(Ordering::SeqCst), THREADS * ROUNDS + 1);
        assert!(registry.is_empty());
    }
}

#[test]
fn test_last_reference_on_other_thread_destroys() {
    for registry in registries() {
        let drops = Arc::new(AtomicUsize::new(0));
        let handle = Ref::into_handle(registry.create(Tracked(Arc::clone(&drops))).unwrap());
        let held = registry.lookup(handle).unwrap();

        registry.release(handle).unwrap();
        assert_eq!(drops.load(Ordering::SeqCst), 0);

        thread::spawn(move || drop(held)).join().unwrap();
        assert_eq!(drops.load(Ordering::SeqCst), 1);
        assert!(registry.lookup(handle).is_none());
    }
}

#[test]
fn test_fixed_table_exhausts() {
    for backend in [Backend::Locked, Backend::LockFree] {
        let registry = Registry::with_config(RegistryConfig {
            backend,
            initial_slots: 8,
            growable: false,
            ..RegistryConfig::default()
        })
        .unwrap();
        let held: Vec<_> = (0..8).map(|id| registry.create(Task { id }).unwrap()).collect();

        let err = registry.create(Task { id: 99 }).err().unwrap();
        assert_eq!(err, RegistryError::Exhausted { capacity: 8 });
        drop(held);
        assert!(registry.create(Task { id: 100 }).is_ok());
    }
}

#[test]
fn test_growth_serves_creation_until_ceiling() {
    for backend in [Backend::Locked, Backend::LockFree] {
        let registry = Registry::with_config(RegistryConfig {
            backend,
            initial_slots: 2,
            max_slots: 64,
            probe_limit: 2,
            ..RegistryConfig::default()
        })
        .unwrap();

        // Below the ceiling a failed scan doubles the table and the retry succeeds.
        let mut held: Vec<_> = (0..32).map(|id| registry.create(Task { id }).unwrap()).collect();
        assert!(registry.capacity() >= 32);

        let err = loop {
            match registry.create(Task { id: 0 }) {
                Ok(task) => held.push(task),
                Err(err) => break err,
            }
        };
        assert_eq!(err, RegistryError::Exhausted { capacity: 64 });
        assert_eq!(registry.capacity(), 64);
        assert_eq!(registry.len(), held.len());
        assert_eq!(registry.stats().growths, 5);
    }
}

#[test]
fn test_release_inside_visit_is_counted() {
    let registry = Registry::with_config(RegistryConfig {
        backend: Backend::LockFree,
        ..RegistryConfig::default()
    })
    .unwrap();
    let drops = Arc::new(AtomicUsize::new(0));
    let handle = Ref::into_handle(registry.create(Tracked(Arc::clone(&drops))).unwrap());

    let visiting = registry.clone();
    registry.apply("tracked", |seen, _| {
        visiting.release(seen).unwrap();
    });

    assert_eq!(drops.load(Ordering::SeqCst), 1);
    let stats = registry.stats();
    assert_eq!((stats.live, stats.created, stats.destroyed), (0, 1, 1));
    assert!(registry.lookup(handle).is_none());
}
