//! # Object Header
//!
//! Handles, type tags and the traits every registry-managed object implements.
//!
//! ## Handles
//!
//! A [`Handle`] is an opaque, process-unique 64-bit token. It is the only
//! thing that crosses thread (or C) boundaries; the object itself stays behind
//! the registry and is reached through `Registry::lookup`. Handle values come
//! from a monotonically increasing counter and zero is never issued, so
//! `Option<Handle>` is the same size as `u64` and `0` is the null handle.
//!
//! ## Type Tags
//!
//! A [`TypeTag`] is a colon-separated ancestor chain such as `"task:timer"`.
//! A cast to `U` succeeds when `U::TAG` is a prefix of the object's chain,
//! ending on a `:` boundary. Derived types embed their base and expose it
//! through [`Class::upcast`], so a cast to any ancestor always has something to
//! return.
//!
//! ## Technical References
//!
//! - [Handles vs Pointers](https://floooh.github.io/2018/06/17/handles-vs-pointers.html)

use std::any::Any;
use std::fmt;
use std::num::NonZeroU64;
use std::sync::Arc;

// ============================================================================
// Handle
// ============================================================================

/// An opaque token naming a live registry object.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct Handle(NonZeroU64);

impl Handle {
    /// Rebuild a handle from its raw value; `0` is the null handle.
    pub const fn from_raw(raw: u64) -> Option<Self> {
        match NonZeroU64::new(raw) {
            Some(v) => Some(Handle(v)),
            None => None,
        }
    }

    /// The raw value, suitable for passing across FFI.
    pub const fn into_raw(self) -> u64 {
        self.0.get()
    }

    /// Slot index for a table of `1 << bits` entries.
    #[inline]
    pub(crate) fn index(self, bits: u32) -> usize {
        (self.0.get() & ((1u64 << bits) - 1)) as usize
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handle({:#x})", self.0)
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl From<Handle> for u64 {
    fn from(h: Handle) -> u64 {
        h.into_raw()
    }
}

// ============================================================================
// Type Tag
// ============================================================================

/// Colon-separated ancestor chain identifying an object's class.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct TypeTag(&'static str);

impl TypeTag {
    /// Create a tag from its full chain, e.g. `"task:timer"`.
    pub const fn new(chain: &'static str) -> Self {
        TypeTag(chain)
    }

    /// The full chain.
    pub const fn as_str(&self) -> &'static str {
        self.0
    }

    /// Whether `ancestor` names this class or one of its bases.
    ///
    /// The empty string matches every tag.
    pub fn is_a(&self, ancestor: &str) -> bool {
        if ancestor.is_empty() {
            return true;
        }
        match self.0.strip_prefix(ancestor) {
            Some(rest) => rest.is_empty() || rest.starts_with(':'),
            None => false,
        }
    }

    /// The most-derived class name, the last link of the chain.
    pub fn leaf(&self) -> &'static str {
        self.0.rsplit(':').next().unwrap_or(self.0)
    }

    /// The tag of the immediate base class, if any.
    pub fn parent(&self) -> Option<TypeTag> {
        self.0.rfind(':').map(|i| TypeTag(&self.0[..i]))
    }
}

impl fmt::Debug for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TypeTag({:?})", self.0)
    }
}

impl fmt::Display for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

// ============================================================================
// Object / Class
// ============================================================================

/// A concrete class that can live in the registry.
///
/// ```rust,ignore
/// struct Task { id: u32 }
/// impl Class for Task { const TAG: TypeTag = TypeTag::new("task"); }
///
/// struct TimerTask { task: Task, period: Duration }
/// impl Class for TimerTask {
///     const TAG: TypeTag = TypeTag::new("task:timer");
///     fn upcast(&self, tag: &str) -> Option<&dyn Any> {
///         (tag == Task::TAG.as_str()).then_some(&self.task as &dyn Any)
///     }
/// }
/// ```
pub trait Class: Send + Sync + 'static {
    /// Full ancestor chain of this class.
    const TAG: TypeTag;

    /// View of an embedded base class, addressed by its full tag.
    ///
    /// Only called with strict ancestors of [`Class::TAG`].
    fn upcast(&self, _tag: &str) -> Option<&dyn Any> {
        None
    }
}

/// Object-safe face of a [`Class`], as stored in the registry.
pub trait Object: Send + Sync + 'static {
    /// Runtime type tag.
    fn type_tag(&self) -> TypeTag;

    /// The concrete value, for exact-type downcasts.
    fn as_any(&self) -> &dyn Any;

    /// Convert a shared pointer for exact-type downcasts.
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;

    /// The view of this object as the class named `tag`.
    fn view(&self, tag: &str) -> Option<&dyn Any>;
}

impl<T: Class> Object for T {
    fn type_tag(&self) -> TypeTag {
        T::TAG
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }

    fn view(&self, tag: &str) -> Option<&dyn Any> {
        if tag == T::TAG.as_str() {
            Some(self)
        } else if T::TAG.is_a(tag) {
            self.upcast(tag)
        } else {
            None
        }
    }
}

impl dyn Object {
    /// Whether the concrete type is exactly `U`.
    pub fn is<U: Class>(&self) -> bool {
        self.as_any().is::<U>()
    }

    /// Cast to `U`, the concrete class or one of its ancestors.
    pub fn cast<U: Class>(&self) -> Option<&U> {
        self.view(U::TAG.as_str())?.downcast_ref::<U>()
    }
}

impl fmt::Debug for dyn Object {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Object")
            .field("tag", &self.type_tag())
            .finish_non_exhaustive()
    }
}
