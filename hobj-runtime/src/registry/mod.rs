//! # Handle Registry
//!
//! Maps opaque [`Handle`]s to reference-counted, type-tagged objects so they
//! can be shared across threads without sharing raw pointers.
//!
//! ## Design
//!
//! Every slot holds `(handle, refcount, Arc<dyn Object>)`. The slot index is
//! `handle & (table_len - 1)`; the table length is always a power of two.
//! Creating an object scans a bounded run of fresh handle values for a free
//! slot and doubles the table once if none is found.
//!
//! The registry count and the `Arc` strong count move together:
//! - the slot owns one strong pointer for as long as its count is non-zero;
//! - every [`Ref`] owns one registry count and one strong pointer.
//!
//! Dropping a `Ref` is the discard operation. The thread whose discard takes
//! the count to zero removes the slot and drops the slot's pointer outside
//! any table lock, so the object's destructor runs synchronously on that
//! thread once the last `Ref` is gone.
//!
//! Two backends implement [`SlotTable`]:
//! - `locked`: one mutex around the table.
//! - `atomic`: per-slot atomic state words, locked only to grow.
//!
//! ## Technical References
//!
//! - [Handles vs Pointers](https://floooh.github.io/2018/06/17/handles-vs-pointers.html)
//!
//! # Example
//!
//! ```rust,ignore
//! use hobj_runtime::{Class, Ref, Registry, TypeTag};
//!
//! struct Task { id: u32 }
//! impl Class for Task { const TAG: TypeTag = TypeTag::new("task"); }
//!
//! let registry = Registry::new();
//! let handle = Ref::into_handle(registry.create(Task { id: 1 })?);
//!
//! // ... on another thread ...
//! if let Some(task) = registry.lookup_as::<Task>(handle) {
//!     println!("task {}", task.id);
//! }
//!
//! registry.release(handle)?;
//! ```

mod atomic;
mod locked;

use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use crate::config::{Backend, ConfigError, RegistryConfig};
use crate::object::{Class, Handle, Object};

use self::atomic::AtomicTable;
use self::locked::LockedTable;

/// Shared pointer to a stored object.
pub(crate) type Shared = Arc<dyn Object>;

// ============================================================================
// Errors
// ============================================================================

/// Errors returned by registry operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    /// No free slot could be found and the table cannot grow.
    #[error("registry exhausted at {capacity} slots")]
    Exhausted {
        /// Table size when creation failed.
        capacity: usize,
    },
    /// The handle names no live object.
    #[error("invalid handle {0}")]
    Invalid(Handle),
}

// ============================================================================
// Slot Table Seam
// ============================================================================

/// Returned by [`SlotTable::insert`] when no slot is available.
pub(crate) struct Exhausted {
    pub(crate) object: Shared,
    pub(crate) capacity: usize,
}

/// Outcome of dropping one registry count.
pub(crate) enum Release {
    /// Other references remain.
    Alive,
    /// The count reached zero; the slot is already free.
    Dead(Shared),
    /// The handle did not match its slot.
    Invalid,
}

pub(crate) struct TableStats {
    pub(crate) live: usize,
    pub(crate) capacity: usize,
    pub(crate) growths: u64,
}

/// Storage behind a [`Registry`].
pub(crate) trait SlotTable: Send + Sync {
    /// Store `object` with a count of one under a fresh handle.
    fn insert(&self, object: Shared) -> Result<Handle, Exhausted>;

    /// Add one count if `handle` is live.
    fn acquire(&self, handle: Handle) -> Option<Shared>;

    /// Drop one count.
    fn release(&self, handle: Handle) -> Release;

    /// Current count, if `handle` is live.
    fn refcount(&self, handle: Handle) -> Option<usize>;

    /// Call `visitor` for each live object whose tag descends from `tag`.
    ///
    /// Returns the objects whose last count was dropped by the visit itself.
    fn visit(
        &self,
        tag: &str,
        visitor: &mut dyn FnMut(Handle, &dyn Object),
    ) -> Vec<(Handle, Shared)>;

    fn stats(&self) -> TableStats;

    /// Add one count to a handle the caller already holds a count on.
    fn retain(&self, handle: Handle) -> bool {
        self.acquire(handle).is_some()
    }
}

// ============================================================================
// Registry
// ============================================================================

/// Point-in-time registry counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryStats {
    /// Objects currently registered.
    pub live: usize,
    /// Current table size.
    pub capacity: usize,
    /// Objects created since the registry was built.
    pub created: u64,
    /// Objects destroyed since the registry was built.
    pub destroyed: u64,
    /// Times the table doubled.
    pub growths: u64,
    /// Creations refused for lack of space.
    pub exhausted: u64,
}

struct RegistryInner {
    table: Box<dyn SlotTable>,
    config: RegistryConfig,
    created: AtomicU64,
    destroyed: AtomicU64,
    exhausted: AtomicU64,
}

/// A table of handle-addressed, reference-counted objects.
///
/// Cloning is cheap and yields another view of the same table.
#[derive(Clone)]
pub struct Registry {
    inner: Arc<RegistryInner>,
}

impl Registry {
    /// Create a registry with the default configuration.
    pub fn new() -> Self {
        Self::build(RegistryConfig::default())
    }

    /// Create a registry, validating `config` first.
    pub fn with_config(config: RegistryConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self::build(config))
    }

    fn build(config: RegistryConfig) -> Self {
        let ceiling = config.ceiling();
        let table: Box<dyn SlotTable> = match config.backend {
            Backend::Locked => Box::new(LockedTable::new(
                config.initial_slots,
                ceiling,
                config.probe_limit,
            )),
            Backend::LockFree => Box::new(AtomicTable::new(
                config.initial_slots,
                ceiling,
                config.probe_limit,
            )),
        };
        Self {
            inner: Arc::new(RegistryInner {
                table,
                config,
                created: AtomicU64::new(0),
                destroyed: AtomicU64::new(0),
                exhausted: AtomicU64::new(0),
            }),
        }
    }

    /// The configuration this registry was built with.
    pub fn config(&self) -> &RegistryConfig {
        &self.inner.config
    }

    /// Register `value` and return the creation reference.
    ///
    /// On failure `value` has already been dropped.
    pub fn create<T: Class>(&self, value: T) -> Result<Ref<T>, RegistryError> {
        let object = Arc::new(value);
        match self.inner.table.insert(Arc::clone(&object) as Shared) {
            Ok(handle) => {
                self.inner.created.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(%handle, tag = %T::TAG, "object created");
                Ok(Ref {
                    registry: self.clone(),
                    handle,
                    object,
                })
            }
            Err(Exhausted { capacity, .. }) => {
                self.inner.exhausted.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(capacity, tag = %T::TAG, "registry exhausted");
                Err(RegistryError::Exhausted { capacity })
            }
        }
    }

    /// Take a new reference to the object named by `handle`.
    ///
    /// Returns `None` for stale, unknown or fully discarded handles.
    pub fn lookup(&self, handle: Handle) -> Option<ObjRef> {
        let object = self.inner.table.acquire(handle)?;
        Some(Ref {
            registry: self.clone(),
            handle,
            object,
        })
    }

    /// Take a new reference if `handle` names a live object of exactly type `T`.
    pub fn lookup_as<T: Class>(&self, handle: Handle) -> Option<Ref<T>> {
        let object = self.inner.table.acquire(handle)?;
        match object.into_any().downcast::<T>() {
            Ok(object) => Some(Ref {
                registry: self.clone(),
                handle,
                object,
            }),
            Err(_) => {
                self.discard(handle);
                None
            }
        }
    }

    /// Drop a count that was detached from its [`Ref`] with [`Ref::into_handle`].
    pub fn release(&self, handle: Handle) -> Result<(), RegistryError> {
        match self.inner.table.release(handle) {
            Release::Alive => Ok(()),
            Release::Dead(object) => {
                self.destroyed(handle, object);
                Ok(())
            }
            Release::Invalid => Err(RegistryError::Invalid(handle)),
        }
    }

    /// Visit every live object whose type descends from `tag`.
    ///
    /// With the locked backend the visitor runs under the table lock and must
    /// not create, look up or discard objects in this registry.
    pub fn apply<F>(&self, tag: &str, mut visitor: F)
    where
        F: FnMut(Handle, &dyn Object),
    {
        for (handle, object) in self.inner.table.visit(tag, &mut visitor) {
            self.destroyed(handle, object);
        }
    }

    /// Handles of every live object whose type descends from `tag`.
    pub fn gather(&self, tag: &str) -> Vec<Handle> {
        let mut handles = Vec::new();
        self.apply(tag, |handle, _| handles.push(handle));
        handles
    }

    /// Current reference count of `handle`, if live.
    pub fn refcount(&self, handle: Handle) -> Option<usize> {
        self.inner.table.refcount(handle)
    }

    /// Number of live objects.
    pub fn len(&self) -> usize {
        self.inner.table.stats().live
    }

    /// Check if no objects are registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current table size in slots.
    pub fn capacity(&self) -> usize {
        self.inner.table.stats().capacity
    }

    /// Snapshot of the registry counters.
    pub fn stats(&self) -> RegistryStats {
        let table = self.inner.table.stats();
        RegistryStats {
            live: table.live,
            capacity: table.capacity,
            created: self.inner.created.load(Ordering::Relaxed),
            destroyed: self.inner.destroyed.load(Ordering::Relaxed),
            growths: table.growths,
            exhausted: self.inner.exhausted.load(Ordering::Relaxed),
        }
    }

    /// Whether two values refer to the same registry.
    pub fn ptr_eq(&self, other: &Registry) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Discard path for counts owned by a [`Ref`].
    fn discard(&self, handle: Handle) {
        match self.inner.table.release(handle) {
            Release::Alive => {}
            Release::Dead(object) => self.destroyed(handle, object),
            Release::Invalid => panic!("discard of unregistered handle {handle}"),
        }
    }

    fn destroyed(&self, handle: Handle, object: Shared) {
        self.inner.destroyed.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(%handle, tag = %object.type_tag(), "object released");
        drop(object);
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("backend", &self.inner.config.backend)
            .field("stats", &self.stats())
            .finish()
    }
}

// ============================================================================
// References
// ============================================================================

/// A counted reference to a registry object.
///
/// Dropping it discards the count. The object is destroyed when the last
/// reference, counted or detached, is gone.
pub struct Ref<T: ?Sized> {
    registry: Registry,
    handle: Handle,
    object: Arc<T>,
}

/// A reference whose concrete type is not known statically.
pub type ObjRef = Ref<dyn Object>;

impl<T: ?Sized> Ref<T> {
    /// The handle this reference counts against.
    pub fn handle(this: &Self) -> Handle {
        this.handle
    }

    /// The registry that owns the object.
    pub fn registry(this: &Self) -> &Registry {
        &this.registry
    }

    /// Detach the count from this guard and return the bare handle.
    ///
    /// The object stays alive until [`Registry::release`] is called with the
    /// handle.
    pub fn into_handle(this: Self) -> Handle {
        let handle = this.handle;
        let retained = this.registry.inner.table.retain(handle);
        assert!(retained, "live reference lost its slot");
        handle
    }

    /// Whether two references point at the same object.
    pub fn ptr_eq(a: &Self, b: &Self) -> bool {
        Arc::ptr_eq(&a.object, &b.object)
    }

    pub(crate) fn downgrade(this: &Self) -> Weak<T> {
        Arc::downgrade(&this.object)
    }
}

impl ObjRef {
    /// Cast to `U`, the concrete class or one of its ancestors.
    pub fn cast<U: Class>(&self) -> Option<&U> {
        self.object.cast::<U>()
    }

    /// Convert into a typed reference if the concrete type is exactly `U`.
    pub fn downcast<U: Class>(self) -> Result<Ref<U>, ObjRef> {
        if !self.object.is::<U>() {
            return Err(self);
        }
        match self.registry.lookup_as::<U>(self.handle) {
            Some(typed) => Ok(typed),
            None => Err(self),
        }
    }
}

impl<T: ?Sized> Deref for Ref<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.object
    }
}

impl<T: ?Sized> Clone for Ref<T> {
    fn clone(&self) -> Self {
        let retained = self.registry.inner.table.retain(self.handle);
        assert!(retained, "live reference lost its slot");
        Self {
            registry: self.registry.clone(),
            handle: self.handle,
            object: Arc::clone(&self.object),
        }
    }
}

impl<T: ?Sized> Drop for Ref<T> {
    fn drop(&mut self) {
        self.registry.discard(self.handle);
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for Ref<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ref")
            .field("handle", &self.handle)
            .field("object", &&*self.object)
            .finish()
    }
}
