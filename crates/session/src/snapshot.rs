// Copy-on-write listener lists.
//
// Readers take an immutable snapshot and iterate it without holding the
// lock; writers clone the vector, mutate the clone and swap it in. A
// listener added or removed during a notification round only affects the
// next round.

use std::sync::{Arc, PoisonError, RwLock};

#[derive(Debug)]
pub struct SnapshotList<T> {
    items: RwLock<Arc<Vec<T>>>,
}

impl<T> Default for SnapshotList<T> {
    fn default() -> Self {
        Self { items: RwLock::new(Arc::new(Vec::new())) }
    }
}

impl<T: Clone> SnapshotList<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Arc<Vec<T>> {
        Arc::clone(&self.items.read().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn push(&self, item: T) {
        self.update(|items| items.push(item));
    }

    /// Keep only the items matching `keep`; returns how many were removed.
    pub fn retain(&self, mut keep: impl FnMut(&T) -> bool) -> usize {
        let mut removed = 0;
        self.update(|items| {
            let before = items.len();
            items.retain(|item| keep(item));
            removed = before - items.len();
        });
        removed
    }

    pub fn update(&self, mutate: impl FnOnce(&mut Vec<T>)) {
        let mut guard = self.items.write().unwrap_or_else(PoisonError::into_inner);
        let mut next = guard.as_ref().clone();
        mutate(&mut next);
        *guard = Arc::new(next);
    }

    pub fn clear(&self) {
        self.update(Vec::clear);
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }
}

/// Identity comparison for shared trait objects (ignores vtable pointers).
pub fn same_object<T: ?Sized>(left: &Arc<T>, right: &Arc<T>) -> bool {
    std::ptr::eq(Arc::as_ptr(left) as *const (), Arc::as_ptr(right) as *const ())
}
