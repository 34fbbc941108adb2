//! Per-connection session store.
//!
//! Holds at most one value per type for the lifetime of a connection, so
//! handlers can stash state across messages without a global lookup.

use parking_lot::RwLock;
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

/// Type-keyed heterogeneous store scoped to one connection.
#[derive(Default)]
pub struct SessionItems {
    items: RwLock<HashMap<TypeId, Arc<dyn Any + Send + Sync>>>,
}

impl SessionItems {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the value stored for `T`, if any.
    pub fn get<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        let value = self.items.read().get(&TypeId::of::<T>()).cloned()?;
        value.downcast::<T>().ok()
    }

    /// Stores `value`, returning the value it replaced.
    pub fn insert<T: Any + Send + Sync>(&self, value: T) -> Option<Arc<T>> {
        let previous = self
            .items
            .write()
            .insert(TypeId::of::<T>(), Arc::new(value))?;
        previous.downcast::<T>().ok()
    }

    /// Returns the stored value for `T`, inserting one built by `init` first
    /// when absent.
    pub fn get_or_insert_with<T, F>(&self, init: F) -> Arc<T>
    where
        T: Any + Send + Sync,
        F: FnOnce() -> T,
    {
        if let Some(existing) = self.get::<T>() {
            return existing;
        }

        let mut items = self.items.write();
        let entry = items
            .entry(TypeId::of::<T>())
            .or_insert_with(|| Arc::new(init()))
            .clone();
        match entry.downcast::<T>() {
            Ok(value) => value,
            Err(_) => unreachable!("session entry keyed by TypeId holds a different type"),
        }
    }

    /// Removes and returns the value stored for `T`.
    pub fn remove<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        let previous = self.items.write().remove(&TypeId::of::<T>())?;
        previous.downcast::<T>().ok()
    }

    /// Whether a value of type `T` is stored.
    pub fn contains<T: Any + Send + Sync>(&self) -> bool {
        self.items.read().contains_key(&TypeId::of::<T>())
    }

    /// Number of stored values.
    pub fn len(&self) -> usize {
        self.items.read().len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.items.read().is_empty()
    }

    /// Drops every stored value.
    pub fn clear(&self) {
        self.items.write().clear();
    }
}

impl std::fmt::Debug for SessionItems {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionItems")
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct Nickname(String);

    #[derive(Debug, PartialEq)]
    struct Score(u32);

    #[test]
    fn test_one_value_per_type() {
        let session = SessionItems::new();
        assert!(session.insert(Nickname("ada".into())).is_none());
        session.insert(Score(3));

        let previous = session.insert(Nickname("grace".into()));
        assert_eq!(previous.as_deref(), Some(&Nickname("ada".into())));
        assert_eq!(session.get::<Nickname>().as_deref(), Some(&Nickname("grace".into())));
        assert_eq!(session.len(), 2);
    }

    #[test]
    fn test_get_or_insert_with_keeps_existing() {
        let session = SessionItems::new();
        let first = session.get_or_insert_with(|| Score(1));
        let second = session.get_or_insert_with(|| Score(99));

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(*second, Score(1));
    }

    #[test]
    fn test_remove_and_clear() {
        let session = SessionItems::new();
        session.insert(Score(7));
        session.insert(Nickname("x".into()));

        assert_eq!(session.remove::<Score>().as_deref(), Some(&Score(7)));
        assert!(!session.contains::<Score>());
        assert!(session.remove::<Score>().is_none());

        session.clear();
        assert!(session.is_empty());
    }
}
