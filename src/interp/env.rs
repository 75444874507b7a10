//! Function-local variable environments.

use std::cell::RefCell;
use std::collections::HashSet;
use std::rc::Rc;

use indexmap::IndexMap;

use crate::kernel::value::Value;

/// Locals of one function activation, chained to the environment the
/// function closed over.
pub struct Env {
    vars: RefCell<IndexMap<String, Value>>,
    parent: Option<Rc<Env>>,
    nonlocals: RefCell<HashSet<String>>,
}

impl Env {
    pub fn new(parent: Option<Rc<Env>>) -> Rc<Self> {
        Rc::new(Self {
            vars: RefCell::new(IndexMap::new()),
            parent,
            nonlocals: RefCell::new(HashSet::new()),
        })
    }

    pub fn parent(&self) -> Option<&Rc<Env>> {
        self.parent.as_ref()
    }

    pub fn get_local(&self, name: &str) -> Option<Value> {
        self.vars.borrow().get(name).cloned()
    }

    /// Resolve `name` through this environment and its enclosing ones.
    pub fn get(&self, name: &str) -> Option<Value> {
        if let Some(v) = self.get_local(name) {
            return Some(v);
        }
        let mut env = self.parent.clone();
        while let Some(e) = env {
            if let Some(v) = e.get_local(name) {
                return Some(v);
            }
            env = e.parent.clone();
        }
        None
    }

    fn owner_of(self: &Rc<Self>, name: &str) -> Option<Rc<Env>> {
        let mut env = self.parent.clone();
        while let Some(e) = env {
            if e.vars.borrow().contains_key(name) {
                return Some(e);
            }
            env = e.parent.clone();
        }
        None
    }

    pub fn set(self: &Rc<Self>, name: &str, value: Value) {
        if self.nonlocals.borrow().contains(name)
            && let Some(owner) = self.owner_of(name)
        {
            owner.vars.borrow_mut().insert(name.to_string(), value);
            return;
        }
        self.vars.borrow_mut().insert(name.to_string(), value);
    }

    /// Mark `name` as belonging to an enclosing function. Fails when no
    /// enclosing function binds it.
    pub fn declare_nonlocal(self: &Rc<Self>, name: &str) -> bool {
        if self.owner_of(name).is_none() {
            return false;
        }
        self.nonlocals.borrow_mut().insert(name.to_string());
        true
    }

    pub fn remove(self: &Rc<Self>, name: &str) -> bool {
        if self.nonlocals.borrow().contains(name)
            && let Some(owner) = self.owner_of(name)
        {
            return owner.vars.borrow_mut().shift_remove(name).is_some();
        }
        self.vars.borrow_mut().shift_remove(name).is_some()
    }

    pub fn local_names(&self) -> Vec<String> {
        self.vars.borrow().keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nonlocal_writes_reach_the_enclosing_binding() {
        let outer = Env::new(None);
        outer.set("count", Value::Int(0));
        let inner = Env::new(Some(outer.clone()));
        assert!(inner.declare_nonlocal("count"));
        inner.set("count", Value::Int(5));
        assert_eq!(outer.get_local("count").and_then(|v| v.as_int()), Some(5));
        assert!(inner.get_local("count").is_none());
        assert!(!inner.declare_nonlocal("missing"));
    }

    #[test]
    fn test_plain_writes_shadow() {
        let outer = Env::new(None);
        outer.set("x", Value::Int(1));
        let inner = Env::new(Some(outer.clone()));
        inner.set("x", Value::Int(2));
        assert_eq!(outer.get("x").and_then(|v| v.as_int()), Some(1));
        assert_eq!(inner.get("x").and_then(|v| v.as_int()), Some(2));
    }
}
