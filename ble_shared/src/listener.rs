//! Copy-on-write listener lists backing the public callback-trait surface
//! (`AdapterStatusListener`, `GattCharListener`, `ChangedAdapterSetListener`,
//! ...). Registration/deregistration never blocks an in-flight dispatch: a
//! writer swaps in a freshly cloned `Vec` under the lock, while a dispatcher
//! clones the `Arc<Vec<_>>` snapshot, releases the lock, and iterates it
//! without holding anything that a concurrent registration would contend on.
//!
//! This is distinct from [`crate::pubsub`], which is the internal
//! channel-based fan-out used between background tasks rather than the
//! application-facing listener traits.

use std::sync::{Arc, RwLock};

pub struct ListenerList<T: ?Sized> {
    inner: RwLock<Arc<Vec<Arc<T>>>>,
}

impl<T: ?Sized> Default for ListenerList<T> {
    fn default() -> Self {
        Self {
            inner: RwLock::new(Arc::new(Vec::new())),
        }
    }
}

impl<T: ?Sized> ListenerList<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a listener, returning its position for later removal.
    pub fn add(&self, listener: Arc<T>) {
        let mut guard = self.inner.write().unwrap();
        let mut next = (**guard).clone();
        next.push(listener);
        *guard = Arc::new(next);
    }

    /// Removes every listener pointer-equal to `listener`.
    pub fn remove(&self, listener: &Arc<T>) {
        let mut guard = self.inner.write().unwrap();
        let next: Vec<Arc<T>> = (**guard)
            .iter()
            .filter(|l| !Arc::ptr_eq(l, listener))
            .cloned()
            .collect();
        *guard = Arc::new(next);
    }

    /// Drops every registered listener. Used by `close()`/`shutdown()`.
    pub fn clear(&self) {
        let mut guard = self.inner.write().unwrap();
        *guard = Arc::new(Vec::new());
    }

    /// Returns an immutable snapshot safe to iterate without holding the lock.
    pub fn snapshot(&self) -> Arc<Vec<Arc<T>>> {
        self.inner.read().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    trait Probe: Send + Sync {
        fn hit(&self);
    }

    struct Counter(AtomicUsize);
    impl Probe for Counter {
        fn hit(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn dispatch_sees_stable_snapshot_during_concurrent_registration() {
        let list: ListenerList<dyn Probe> = ListenerList::new();
        let a = Arc::new(Counter(AtomicUsize::new(0)));
        list.add(a.clone());

        let snapshot = list.snapshot();
        // Registering a second listener must not affect the snapshot already taken.
        let b = Arc::new(Counter(AtomicUsize::new(0)));
        list.add(b.clone() as Arc<dyn Probe>);
        assert_eq!(snapshot.len(), 1);
        assert_eq!(list.len(), 2);

        for l in snapshot.iter() {
            l.hit();
        }
        assert_eq!(a.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn remove_drops_only_matching_pointer() {
        let list: ListenerList<dyn Probe> = ListenerList::new();
        let a: Arc<dyn Probe> = Arc::new(Counter(AtomicUsize::new(0)));
        let b: Arc<dyn Probe> = Arc::new(Counter(AtomicUsize::new(0)));
        list.add(a.clone());
        list.add(b.clone());

        list.remove(&a);
        assert_eq!(list.len(), 1);
        assert!(Arc::ptr_eq(&list.snapshot()[0], &b));
    }

    #[test]
    fn clear_empties_the_list() {
        let list: ListenerList<dyn Probe> = ListenerList::new();
        list.add(Arc::new(Counter(AtomicUsize::new(0))));
        list.clear();
        assert!(list.is_empty());
    }
}
