//! Ordered, open registry of named values attached to a sandbox

use crate::sandbox::grain::Grain;
use std::any::Any;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// A value stored in the registry.
///
/// Every attribute can be downcast to its concrete type. Attributes created
/// through [`Attribute::grain`] additionally carry a [`Grain`] view, which is
/// what the sandbox drives during activation and disposal.
#[derive(Clone)]
pub struct Attribute {
    value: Arc<dyn Any + Send + Sync>,
    grain: Option<Arc<dyn Grain>>,
}

impl Attribute {
    /// Wrap a plain value
    pub fn value<T: Any + Send + Sync>(value: T) -> Self {
        Self {
            value: Arc::new(value),
            grain: None,
        }
    }

    /// Wrap a grain
    pub fn grain<G: Grain>(grain: G) -> Self {
        Self::shared_grain(Arc::new(grain))
    }

    /// Wrap a grain the caller keeps a handle to
    pub fn shared_grain<G: Grain>(grain: Arc<G>) -> Self {
        let value: Arc<dyn Any + Send + Sync> = grain.clone();
        Self {
            value,
            grain: Some(grain as Arc<dyn Grain>),
        }
    }

    /// Whether this attribute satisfies the grain capability
    pub fn is_grain(&self) -> bool {
        self.grain.is_some()
    }

    /// The grain view, if any
    pub fn as_grain(&self) -> Option<Arc<dyn Grain>> {
        self.grain.clone()
    }

    /// Typed access to the stored value
    pub fn downcast<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        Arc::clone(&self.value).downcast::<T>().ok()
    }
}

impl fmt::Debug for Attribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Attribute")
            .field("is_grain", &self.is_grain())
            .finish_non_exhaustive()
    }
}

/// Insertion-ordered `name -> Attribute` map.
///
/// Re-inserting an existing name replaces the value in place: the entry keeps
/// the position of its first insertion. All operations take `&self` and are
/// safe to call from several threads.
#[derive(Default)]
pub struct Attributes {
    entries: RwLock<Vec<(String, Attribute)>>,
}

impl Attributes {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, Vec<(String, Attribute)>> {
        self.entries.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Vec<(String, Attribute)>> {
        self.entries.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert or replace `name`, returning the previous attribute
    pub fn insert(&self, name: impl Into<String>, attribute: Attribute) -> Option<Attribute> {
        let name = name.into();
        let mut entries = self.write();

        match entries.iter_mut().find(|(key, _)| *key == name) {
            Some((_, slot)) => Some(std::mem::replace(slot, attribute)),
            None => {
                entries.push((name, attribute));
                None
            }
        }
    }

    /// Look up an attribute
    pub fn get(&self, name: &str) -> Option<Attribute> {
        self.read()
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, attribute)| attribute.clone())
    }

    /// Look up an attribute and downcast it
    pub fn get_as<T: Any + Send + Sync>(&self, name: &str) -> Option<Arc<T>> {
        self.get(name).and_then(|attribute| attribute.downcast::<T>())
    }

    /// Remove an attribute
    pub fn remove(&self, name: &str) -> Option<Attribute> {
        let mut entries = self.write();
        let index = entries.iter().position(|(key, _)| key == name)?;
        Some(entries.remove(index).1)
    }

    /// Whether `name` is present
    pub fn contains(&self, name: &str) -> bool {
        self.read().iter().any(|(key, _)| key == name)
    }

    /// Names in iteration order
    pub fn names(&self) -> Vec<String> {
        self.read().iter().map(|(key, _)| key.clone()).collect()
    }

    /// Number of attributes
    pub fn len(&self) -> usize {
        self.read().len()
    }

    /// Whether the registry is empty
    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Snapshot of every grain, with its name, in iteration order
    pub fn grains(&self) -> Vec<(String, Arc<dyn Grain>)> {
        self.read()
            .iter()
            .filter_map(|(key, attribute)| attribute.as_grain().map(|grain| (key.clone(), grain)))
            .collect()
    }
}

impl fmt::Debug for Attributes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use crate::sandbox::instance::Sandbox;
    use async_trait::async_trait;

    struct NoopGrain;

    #[async_trait]
    impl Grain for NoopGrain {
        async fn setup(&self, _sandbox: &Sandbox) -> Result<()> {
            Ok(())
        }

        async fn dispose(&self) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_insertion_order() {
        let attributes = Attributes::new();
        attributes.insert("c", Attribute::value(1u8));
        attributes.insert("a", Attribute::value(2u8));
        attributes.insert("b", Attribute::value(3u8));

        assert_eq!(attributes.names(), vec!["c", "a", "b"]);
        assert_eq!(attributes.len(), 3);
    }

    #[test]
    fn test_replacement_keeps_position() {
        let attributes = Attributes::new();
        attributes.insert("first", Attribute::value("one"));
        attributes.insert("second", Attribute::value("two"));

        let previous = attributes.insert("first", Attribute::value("uno"));

        assert!(previous.is_some());
        assert_eq!(attributes.names(), vec!["first", "second"]);
        assert_eq!(*attributes.get_as::<&str>("first").unwrap(), "uno");
    }

    #[test]
    fn test_grains_excludes_plain_values() {
        let attributes = Attributes::new();
        attributes.insert("A", Attribute::grain(NoopGrain));
        attributes.insert("B", Attribute::value("not a grain".to_string()));

        let grains = attributes.grains();
        assert_eq!(grains.len(), 1);
        assert_eq!(grains[0].0, "A");
    }

    #[test]
    fn test_downcast_mismatch_is_none() {
        let attributes = Attributes::new();
        attributes.insert("n", Attribute::value(42u32));

        assert!(attributes.get_as::<String>("n").is_none());
        assert_eq!(*attributes.get_as::<u32>("n").unwrap(), 42);
    }

    #[test]
    fn test_grain_is_downcastable() {
        let attributes = Attributes::new();
        attributes.insert("noop", Attribute::grain(NoopGrain));

        assert!(attributes.get_as::<NoopGrain>("noop").is_some());
        assert!(attributes.get("noop").unwrap().is_grain());
    }

    #[test]
    fn test_remove() {
        let attributes = Attributes::new();
        attributes.insert("x", Attribute::value(1i32));
        attributes.insert("y", Attribute::value(2i32));

        assert!(attributes.remove("x").is_some());
        assert!(attributes.remove("x").is_none());
        assert!(!attributes.contains("x"));
        assert_eq!(attributes.names(), vec!["y"]);
    }

    #[test]
    fn test_concurrent_attach() {
        let attributes = Arc::new(Attributes::new());

        let handles: Vec<_> = (0..8)
            .map(|t| {
                let attributes = Arc::clone(&attributes);
                std::thread::spawn(move || {
                    for i in 0..50 {
                        attributes.insert(format!("{}-{}", t, i), Attribute::grain(NoopGrain));
                        let _ = attributes.grains();
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(attributes.len(), 400);
        assert_eq!(attributes.grains().len(), 400);
    }
}
