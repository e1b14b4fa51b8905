//! Callable handle registry
//!
//! Script callables are parked in a table keyed by an opaque integer. The
//! table hands out move-only [`CallableHandle`]s: whichever component holds a
//! handle owns the registration, and the registration ends exactly once, when
//! the handle is consumed or dropped.

use dashmap::DashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Opaque key identifying one registration.
///
/// Keys are never reused, so a stale key can not alias a newer callable.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandleKey(u64);

impl HandleKey {
    /// Return the raw integer backing this key.
    #[inline]
    pub fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for HandleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

struct RegistryShared<C> {
    next_key: AtomicU64,
    entries: DashMap<HandleKey, C>,
}

/// Table mapping handle keys to script callables.
///
/// `register` may be called from any thread when `C: Send + Sync`. Invoking
/// a callable is the caller's business and must happen on the thread that
/// owns the interpreter.
pub struct CallableRegistry<C> {
    shared: Arc<RegistryShared<C>>,
}

impl<C> CallableRegistry<C> {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(RegistryShared {
                next_key: AtomicU64::new(1),
                entries: DashMap::new(),
            }),
        }
    }

    /// Park a callable and return the handle that owns it.
    pub fn register(&self, callable: C) -> CallableHandle<C> {
        let key = HandleKey(self.shared.next_key.fetch_add(1, Ordering::Relaxed));
        self.shared.entries.insert(key, callable);
        tracing::trace!(handle = %key, "callable registered");
        CallableHandle {
            key,
            shared: Arc::clone(&self.shared),
        }
    }

    /// Number of live registrations.
    pub fn len(&self) -> usize {
        self.shared.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.entries.is_empty()
    }

    pub fn contains(&self, key: HandleKey) -> bool {
        self.shared.entries.contains_key(&key)
    }

    /// Drop every live registration. Used on interpreter shutdown.
    ///
    /// Handles still held elsewhere become inert: taking from them yields
    /// `None` and dropping them is a no-op.
    pub fn release_all(&self) -> usize {
        let released = self.shared.entries.len();
        self.shared.entries.clear();
        if released > 0 {
            tracing::debug!(released, "released outstanding callables");
        }
        released
    }
}

impl<C> Clone for CallableRegistry<C> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<C> Default for CallableRegistry<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> fmt::Debug for CallableRegistry<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallableRegistry")
            .field("live", &self.len())
            .finish()
    }
}

/// Move-only ownership of one registration.
///
/// There is no way to copy a handle, so a registration is released exactly
/// once: by [`take`](Self::take), [`invoke`](Self::invoke),
/// [`release`](Self::release), or drop.
#[must_use = "dropping a handle releases the callable without invoking it"]
pub struct CallableHandle<C> {
    key: HandleKey,
    shared: Arc<RegistryShared<C>>,
}

impl<C> CallableHandle<C> {
    #[inline]
    pub fn key(&self) -> HandleKey {
        self.key
    }

    /// Remove the callable from the registry and hand it to the caller.
    ///
    /// Returns `None` if the registry was already cleared by `release_all`.
    pub fn take(self) -> Option<C> {
        self.shared.entries.remove(&self.key).map(|(_, callable)| callable)
    }

    /// Run `f` with the callable, releasing the registration first.
    pub fn invoke<R>(self, f: impl FnOnce(C) -> R) -> Option<R> {
        self.take().map(f)
    }

    /// Clone the callable out for a repeated call without ending the
    /// registration. The map lock is not held while the clone is in use.
    pub fn get(&self) -> Option<C>
    where
        C: Clone,
    {
        self.shared
            .entries
            .get(&self.key)
            .map(|entry| entry.value().clone())
    }

    /// Release without invoking.
    pub fn release(self) {
        drop(self);
    }
}

impl<C> Drop for CallableHandle<C> {
    fn drop(&mut self) {
        if self.shared.entries.remove(&self.key).is_some() {
            tracing::trace!(handle = %self.key, "callable released");
        }
    }
}

impl<C> fmt::Debug for CallableHandle<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CallableHandle").field(&self.key).finish()
    }
}
