//! Copy-on-write list with constant time snapshots.

use std::sync::Arc;

use arc_swap::ArcSwap;

/// A list whose readers iterate immutable snapshots.
///
/// Mutations copy the current vector and atomically swap the new one in;
/// taking a snapshot only bumps a reference count. A snapshot never observes
/// mutations made after it was taken.
#[derive(Debug)]
pub struct SnapshotList<T> {
    items: ArcSwap<Vec<T>>,
}

impl<T: Clone> SnapshotList<T> {
    /// Create an empty list.
    #[must_use]
    pub fn new() -> Self {
        Self { items: ArcSwap::from_pointee(Vec::new()) }
    }

    /// Current contents.
    #[must_use]
    pub fn snapshot(&self) -> Arc<Vec<T>> {
        self.items.load_full()
    }

    /// Append an item.
    pub fn push(&self, item: T) {
        self.items.rcu(|current| {
            let mut next = Vec::with_capacity(current.len() + 1);
            next.extend(current.iter().cloned());
            next.push(item.clone());
            next
        });
    }

    /// Remove every item matching `predicate`. Returns how many were removed.
    pub fn remove_where(&self, predicate: impl Fn(&T) -> bool) -> usize {
        let mut removed = 0;
        self.items.rcu(|current| {
            let next = current.iter().filter(|item| !predicate(item)).cloned().collect::<Vec<_>>();
            removed = current.len() - next.len();
            next
        });
        removed
    }

    /// Drop every item, returning the last contents.
    pub fn clear(&self) -> Arc<Vec<T>> {
        self.items.swap(Arc::new(Vec::new()))
    }

    /// Number of items in the current snapshot.
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.load().len()
    }

    /// Whether the current snapshot is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.load().is_empty()
    }
}

impl<T: Clone> Default for SnapshotList<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_isolated_from_mutation() {
        let list = SnapshotList::new();
        list.push(1);
        list.push(2);

        let snapshot = list.snapshot();
        list.push(3);
        assert_eq!(list.remove_where(|v| *v == 1), 1);

        assert_eq!(*snapshot, vec![1, 2]);
        assert_eq!(*list.snapshot(), vec![2, 3]);
    }

    #[test]
    fn test_snapshot_shares_storage() {
        let list = SnapshotList::new();
        list.push("a".to_owned());
        let a = list.snapshot();
        let b = list.snapshot();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_clear() {
        let list = SnapshotList::new();
        list.push(1);
        let previous = list.clear();
        assert_eq!(*previous, vec![1]);
        assert!(list.is_empty());
    }
}
