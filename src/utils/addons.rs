//! Typed extension storage
//!
//! Outputs, scene nodes and buffers carry an [`AddonSet`] so that code
//! outside this crate can attach its own state to them. Entries are keyed
//! by type; lifetime is tied to the host object.

use std::{
    any::{Any, TypeId},
    cell::RefCell,
    collections::HashMap,
    fmt,
    rc::Rc,
};

/// Storage for one addon value per type
#[derive(Default)]
pub struct AddonSet {
    map: RefCell<HashMap<TypeId, Rc<dyn Any>>>,
}

impl AddonSet {
    /// Create an empty set
    pub fn new() -> Self {
        Default::default()
    }

    /// Attach a value, replacing any previous addon of the same type
    pub fn insert<T: Any>(&self, value: T) -> Option<Rc<T>> {
        self.map
            .borrow_mut()
            .insert(TypeId::of::<T>(), Rc::new(value))
            .and_then(|old| old.downcast::<T>().ok())
    }

    /// Access the addon of the given type, if any
    pub fn get<T: Any>(&self) -> Option<Rc<T>> {
        self.map
            .borrow()
            .get(&TypeId::of::<T>())
            .cloned()
            .and_then(|value| value.downcast::<T>().ok())
    }

    /// Detach and return the addon of the given type
    pub fn remove<T: Any>(&self) -> Option<Rc<T>> {
        self.map
            .borrow_mut()
            .remove(&TypeId::of::<T>())
            .and_then(|value| value.downcast::<T>().ok())
    }

    /// Returns true if an addon of the given type is attached
    pub fn contains<T: Any>(&self) -> bool {
        self.map.borrow().contains_key(&TypeId::of::<T>())
    }
}

impl fmt::Debug for AddonSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AddonSet")
            .field("len", &self.map.borrow().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_get_remove() {
        struct Marker(u32);

        let addons = AddonSet::new();
        assert!(addons.get::<Marker>().is_none());

        addons.insert(Marker(3));
        assert_eq!(addons.get::<Marker>().unwrap().0, 3);

        let old = addons.insert(Marker(4)).unwrap();
        assert_eq!(old.0, 3);

        assert_eq!(addons.remove::<Marker>().unwrap().0, 4);
        assert!(!addons.contains::<Marker>());
    }
}
