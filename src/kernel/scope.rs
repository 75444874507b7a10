//! Sealed namespaces.
//!
//! A scope splits into a dunder region (names starting with `__`) and an
//! ordinary region. Once locked, writes and deletes aimed at the dunder
//! region are dropped without error, so guest code cannot desynchronise a
//! scope from its built-in set or its module identity. The ordinary region
//! stays writable: it holds the module's own globals.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use indexmap::IndexMap;

use super::store::{LockedMapping, LockedObject};
use super::value::Value;

pub struct Scope {
    entries: RefCell<IndexMap<String, Value>>,
    locked: Cell<bool>,
}

pub fn is_dunder(name: &str) -> bool {
    name.starts_with("__")
}

impl Scope {
    pub fn new() -> Rc<Self> {
        Rc::new(Self {
            entries: RefCell::new(IndexMap::new()),
            locked: Cell::new(false),
        })
    }

    /// A scope whose only entry is the given built-in set.
    pub fn with_builtins(builtins: Rc<LockedMapping>) -> Rc<Self> {
        let scope = Self::new();
        scope.set("__builtins__", Value::Mapping(builtins));
        scope
    }

    pub fn lock(&self) {
        self.locked.set(true);
    }

    pub fn is_locked(&self) -> bool {
        self.locked.get()
    }

    pub fn get(&self, name: &str) -> Option<Value> {
        self.entries.borrow().get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.borrow().contains_key(name)
    }

    pub fn set(&self, name: &str, value: Value) {
        if self.is_locked() && is_dunder(name) {
            return;
        }
        self.entries.borrow_mut().insert(name.to_string(), value);
    }

    /// Returns whether `name` was bound. Locked dunder entries report as
    /// bound but stay in place.
    pub fn remove(&self, name: &str) -> bool {
        if self.is_locked() && is_dunder(name) {
            return self.contains(name);
        }
        self.entries.borrow_mut().shift_remove(name).is_some()
    }

    pub fn builtins(&self) -> Option<Rc<LockedMapping>> {
        match self.get("__builtins__") {
            Some(Value::Mapping(m)) => Some(m),
            _ => None,
        }
    }

    /// The module export object (`__mod`).
    pub fn exports(&self) -> Option<Rc<LockedObject>> {
        match self.get("__mod") {
            Some(Value::Object(o)) => Some(o),
            _ => None,
        }
    }

    /// Global name resolution: own entries, then names bound on the
    /// module's export object, then the built-in set.
    pub fn lookup(&self, name: &str) -> Option<Value> {
        if let Some(v) = self.get(name) {
            return Some(v);
        }
        if let Some(exports) = self.exports()
            && let Some(v) = exports.instance_attr(name)
        {
            return Some(v);
        }
        self.builtins()?.get_str(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.entries.borrow().keys().cloned().collect()
    }

    pub fn snapshot(&self) -> Vec<(String, Value)> {
        self.entries
            .borrow()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Entries outside the dunder region.
    pub fn ordinary(&self) -> Vec<(String, Value)> {
        self.entries
            .borrow()
            .iter()
            .filter(|(k, _)| !is_dunder(k))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_locked_scope_ignores_dunder_writes() {
        let scope = Scope::with_builtins(Rc::new(LockedMapping::new()));
        scope.set("__name__", Value::str("main"));
        scope.lock();
        scope.set("__name__", Value::str("evil"));
        assert!(scope.remove("__builtins__"));
        assert!(scope.builtins().is_some());
        assert_eq!(scope.get("__name__").unwrap().as_str(), Some("main"));

        scope.set("x", Value::Int(1));
        assert!(scope.remove("x"));
        assert!(!scope.contains("x"));
    }

    #[test]
    fn test_lookup_falls_back_to_builtins() {
        let builtins = Rc::new(LockedMapping::new());
        builtins.insert_str("len", Value::Int(0)).unwrap();
        let scope = Scope::with_builtins(builtins);
        assert!(scope.lookup("len").is_some());
        assert!(scope.lookup("open").is_none());
        assert!(scope.ordinary().is_empty());
    }
}
