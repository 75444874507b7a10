//! Capability store: lockable mappings and objects.
//!
//! Both types follow "construct mutable, then permanently freeze". Locking
//! is monotonic: there is no unlock. Freezing recurses into every store value
//! reachable through the frozen value, including through lists and tuples.

use std::cell::{Cell, RefCell};
use std::collections::HashSet;
use std::hash::{Hash, Hasher};
use std::rc::Rc;

use indexmap::IndexMap;

use super::types::SealedType;
use super::value::{Value, release};
use crate::error::KernelError;
use crate::interp::TraceFrame;

/// Hashable projection of a guest value, used as a mapping key.
#[derive(Clone)]
pub enum MapKey {
    None,
    Int(i64),
    Float(u64),
    Str(Rc<str>),
    Bytes(Rc<[u8]>),
    Tuple(Rc<[MapKey]>),
    /// Keyed by identity (types, objects, callables).
    Ref(usize, Value),
}

impl MapKey {
    /// Returns `None` for unhashable values (lists and mappings).
    pub fn from_value(v: &Value) -> Option<Self> {
        Some(match v {
            Value::None => MapKey::None,
            Value::Bool(b) => MapKey::Int(*b as i64),
            Value::Int(i) => MapKey::Int(*i),
            Value::Float(f) => {
                if f.fract() == 0.0 && f.abs() < 9.0e15 {
                    MapKey::Int(*f as i64)
                } else {
                    MapKey::Float(f.to_bits())
                }
            }
            Value::Str(s) => MapKey::Str(s.clone()),
            Value::Bytes(b) => MapKey::Bytes(b.clone()),
            Value::Tuple(items) => MapKey::Tuple(
                items
                    .iter()
                    .map(MapKey::from_value)
                    .collect::<Option<Vec<_>>>()?
                    .into(),
            ),
            Value::List(_) | Value::Mapping(_) => return None,
            other => MapKey::Ref(other.identity(), other.clone()),
        })
    }

    pub fn str(s: &str) -> Self {
        MapKey::Str(Rc::from(s))
    }

    pub fn to_value(&self) -> Value {
        match self {
            MapKey::None => Value::None,
            MapKey::Int(i) => Value::Int(*i),
            MapKey::Float(bits) => Value::Float(f64::from_bits(*bits)),
            MapKey::Str(s) => Value::Str(s.clone()),
            MapKey::Bytes(b) => Value::Bytes(b.clone()),
            MapKey::Tuple(items) => Value::tuple(items.iter().map(MapKey::to_value).collect()),
            MapKey::Ref(_, v) => v.clone(),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            MapKey::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Rendering used in error messages.
    pub fn describe(&self) -> String {
        match self {
            MapKey::None => "None".into(),
            MapKey::Int(i) => i.to_string(),
            MapKey::Float(bits) => f64::from_bits(*bits).to_string(),
            MapKey::Str(s) => s.to_string(),
            MapKey::Bytes(b) => format!("b{:?}", String::from_utf8_lossy(b)),
            MapKey::Tuple(items) => format!(
                "({})",
                items.iter().map(MapKey::describe).collect::<Vec<_>>().join(", ")
            ),
            MapKey::Ref(_, v) => format!("{v:?}"),
        }
    }
}

impl PartialEq for MapKey {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (MapKey::None, MapKey::None) => true,
            (MapKey::Int(a), MapKey::Int(b)) => a == b,
            (MapKey::Float(a), MapKey::Float(b)) => a == b,
            (MapKey::Str(a), MapKey::Str(b)) => a == b,
            (MapKey::Bytes(a), MapKey::Bytes(b)) => a == b,
            (MapKey::Tuple(a), MapKey::Tuple(b)) => a == b,
            (MapKey::Ref(a, _), MapKey::Ref(b, _)) => a == b,
            _ => false,
        }
    }
}

impl Eq for MapKey {}

impl Hash for MapKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            MapKey::None => {}
            MapKey::Int(i) => i.hash(state),
            MapKey::Float(bits) => bits.hash(state),
            MapKey::Str(s) => s.hash(state),
            MapKey::Bytes(b) => b.hash(state),
            MapKey::Tuple(items) => items.hash(state),
            MapKey::Ref(id, _) => id.hash(state),
        }
    }
}

/// Key/value store with a one-way lock.
pub struct LockedMapping {
    entries: RefCell<IndexMap<MapKey, Value>>,
    locked: Cell<bool>,
    label: Rc<str>,
}

impl Default for LockedMapping {
    fn default() -> Self {
        Self::new()
    }
}

impl LockedMapping {
    pub fn new() -> Self {
        Self::labelled("Dict")
    }

    /// A mapping whose lock errors name it as `label`.
    pub fn labelled(label: &str) -> Self {
        Self {
            entries: RefCell::new(IndexMap::new()),
            locked: Cell::new(false),
            label: Rc::from(label),
        }
    }

    pub fn from_pairs(pairs: impl IntoIterator<Item = (MapKey, Value)>) -> Self {
        let mapping = Self::new();
        mapping.entries.borrow_mut().extend(pairs);
        mapping
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn is_locked(&self) -> bool {
        self.locked.get()
    }

    fn refuse(&self, key: &MapKey) -> KernelError {
        KernelError::locked(key.describe(), self.label.to_string())
    }

    pub fn len(&self) -> usize {
        self.entries.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.borrow().is_empty()
    }

    pub fn get(&self, key: &MapKey) -> Option<Value> {
        self.entries.borrow().get(key).cloned()
    }

    pub fn get_str(&self, name: &str) -> Option<Value> {
        self.get(&MapKey::str(name))
    }

    pub fn contains(&self, key: &MapKey) -> bool {
        self.entries.borrow().contains_key(key)
    }

    pub fn keys(&self) -> Vec<MapKey> {
        self.entries.borrow().keys().cloned().collect()
    }

    pub fn values(&self) -> Vec<Value> {
        self.entries.borrow().values().cloned().collect()
    }

    pub fn items(&self) -> Vec<(MapKey, Value)> {
        self.entries
            .borrow()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn insert(&self, key: MapKey, value: Value) -> Result<(), KernelError> {
        if self.is_locked() {
            return Err(self.refuse(&key));
        }
        self.entries.borrow_mut().insert(key, value);
        Ok(())
    }

    pub fn insert_str(&self, name: &str, value: Value) -> Result<(), KernelError> {
        self.insert(MapKey::str(name), value)
    }

    /// Remove `key`. Absent keys are reported as `Ok(None)` so that callers
    /// can choose between a default and a `KeyError`; a locked mapping
    /// refuses only when the key is present.
    pub fn remove(&self, key: &MapKey) -> Result<Option<Value>, KernelError> {
        if !self.contains(key) {
            return Ok(None);
        }
        if self.is_locked() {
            return Err(self.refuse(key));
        }
        Ok(self.entries.borrow_mut().shift_remove(key))
    }

    /// Remove and return the most recently inserted pair.
    pub fn popitem(&self) -> Result<Option<(MapKey, Value)>, KernelError> {
        let last = self.entries.borrow().last().map(|(k, _)| k.clone());
        let Some(key) = last else {
            return Ok(None);
        };
        if self.is_locked() {
            return Err(self.refuse(&key));
        }
        Ok(self.entries.borrow_mut().pop())
    }

    /// Insert `default` if `key` is absent; return the resulting value.
    pub fn setdefault(&self, key: MapKey, default: Value) -> Result<Value, KernelError> {
        if let Some(existing) = self.get(&key) {
            return Ok(existing);
        }
        self.insert(key, default.clone())?;
        Ok(default)
    }

    pub fn update(&self, pairs: Vec<(MapKey, Value)>) -> Result<(), KernelError> {
        if self.is_locked()
            && let Some((key, _)) = pairs.first()
        {
            return Err(self.refuse(key));
        }
        self.entries.borrow_mut().extend(pairs);
        Ok(())
    }

    pub fn clear(&self) -> Result<(), KernelError> {
        if self.is_locked() && !self.is_empty() {
            return Err(KernelError::locked("*", self.label.to_string()));
        }
        self.entries.borrow_mut().clear();
        Ok(())
    }

    /// Unlocked shallow copy.
    pub fn copy(&self) -> LockedMapping {
        LockedMapping {
            entries: RefCell::new(self.entries.borrow().clone()),
            locked: Cell::new(false),
            label: self.label.clone(),
        }
    }

    /// Lock this mapping only, leaving its values as they are.
    pub fn lock_shallow(&self) {
        self.locked.set(true);
    }

    /// Lock this mapping and every store value reachable from it.
    pub fn freeze(&self) {
        let mut seen = HashSet::new();
        seen.insert(self as *const LockedMapping as usize);
        self.lock_shallow();
        freeze_reachable(self.values(), &mut seen);
    }
}

/// State carried by instances of exception types.
pub struct ExceptionState {
    pub(crate) args: RefCell<Vec<Value>>,
    pub(crate) trace: RefCell<Vec<TraceFrame>>,
    pub(crate) session: Cell<u64>,
}

impl ExceptionState {
    pub fn new(args: Vec<Value>) -> Self {
        Self {
            args: RefCell::new(args),
            trace: RefCell::new(Vec::new()),
            session: Cell::new(0),
        }
    }

    pub fn args(&self) -> Vec<Value> {
        self.args.borrow().clone()
    }
}

impl Drop for LockedMapping {
    fn drop(&mut self) {
        let entries = std::mem::take(self.entries.get_mut());
        let mut children = Vec::with_capacity(entries.len());
        for (key, value) in entries {
            if let MapKey::Ref(_, key) = key {
                children.push(key);
            }
            children.push(value);
        }
        release(children);
    }
}

/// Property bag backed by an overflow mapping.
///
/// Attributes declared on the object's class live in `fields` and are
/// written through the class path; everything else lands in `overflow`.
pub struct LockedObject {
    class: Rc<SealedType>,
    fields: RefCell<IndexMap<String, Value>>,
    overflow: LockedMapping,
    locked: Cell<bool>,
    exception: Option<ExceptionState>,
    exports: bool,
}

impl LockedObject {
    pub fn new(class: Rc<SealedType>) -> Self {
        let label = class.name().to_string();
        Self {
            class,
            fields: RefCell::new(IndexMap::new()),
            overflow: LockedMapping::labelled(&label),
            locked: Cell::new(false),
            exception: None,
            exports: false,
        }
    }

    pub fn exception(class: Rc<SealedType>, args: Vec<Value>) -> Self {
        let mut obj = Self::new(class);
        obj.exception = Some(ExceptionState::new(args));
        obj
    }

    /// Export object of a module (`__mod`). Guest functions stored on it
    /// are sealed into capabilities by the attribute layer.
    pub fn module_exports(class: Rc<SealedType>, name: &str) -> Self {
        let mut obj = Self::new(class);
        obj.exports = true;
        obj.overflow = LockedMapping::labelled(&format!("module '{name}'"));
        // A fresh mapping cannot be locked.
        let _ = obj.overflow.insert_str("__name__", Value::str(name));
        obj
    }

    pub fn class(&self) -> &Rc<SealedType> {
        &self.class
    }

    pub fn is_locked(&self) -> bool {
        self.locked.get()
    }

    pub fn is_exports(&self) -> bool {
        self.exports
    }

    pub fn exception_state(&self) -> Option<&ExceptionState> {
        self.exception.as_ref()
    }

    pub fn label(&self) -> String {
        if self.exports {
            return self.overflow.label().to_string();
        }
        format!("{} object", self.class.name())
    }

    /// Instance attribute lookup: declared fields, then overflow.
    pub fn instance_attr(&self, name: &str) -> Option<Value> {
        if let Some(v) = self.fields.borrow().get(name) {
            return Some(v.clone());
        }
        self.overflow.get_str(name)
    }

    pub fn has_instance_attr(&self, name: &str) -> bool {
        self.fields.borrow().contains_key(name) || self.overflow.contains(&MapKey::str(name))
    }

    pub fn store_field(&self, name: &str, value: Value) -> Result<(), KernelError> {
        if self.is_locked() {
            return Err(KernelError::locked(name, self.label()));
        }
        self.fields.borrow_mut().insert(name.to_string(), value);
        Ok(())
    }

    pub fn store_overflow(&self, name: &str, value: Value) -> Result<(), KernelError> {
        if self.is_locked() {
            return Err(KernelError::locked(name, self.label()));
        }
        self.overflow
            .insert_str(name, value)
            .map_err(|_| KernelError::locked(name, self.label()))
    }

    /// Delete an instance attribute; `Ok(false)` when it does not exist.
    pub fn remove_attr(&self, name: &str) -> Result<bool, KernelError> {
        if !self.has_instance_attr(name) {
            return Ok(false);
        }
        if self.is_locked() {
            return Err(KernelError::locked(name, self.label()));
        }
        if self.fields.borrow_mut().shift_remove(name).is_some() {
            return Ok(true);
        }
        Ok(self
            .overflow
            .remove(&MapKey::str(name))
            .map_err(|_| KernelError::locked(name, self.label()))?
            .is_some())
    }

    /// Names of all instance attributes, fields first.
    pub fn attr_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.fields.borrow().keys().cloned().collect();
        for key in self.overflow.keys() {
            if let Some(s) = key.as_str()
                && !names.iter().any(|n| n == s)
            {
                names.push(s.to_string());
            }
        }
        names
    }

    /// Lock the object and its overflow storage without descending into
    /// the stored values.
    pub fn lock_shallow(&self) {
        self.locked.set(true);
        self.overflow.lock_shallow();
    }

    pub fn freeze(&self) {
        let mut seen = HashSet::new();
        seen.insert(self as *const LockedObject as usize);
        self.lock_shallow();
        freeze_reachable(self.reachable(), &mut seen);
    }

    fn reachable(&self) -> Vec<Value> {
        let mut values = self.overflow.values();
        values.extend(self.fields.borrow().values().cloned());
        values
    }
}

impl Drop for LockedObject {
    fn drop(&mut self) {
        let fields = std::mem::take(self.fields.get_mut());
        release(fields.into_values().collect());
    }
}

/// Lock `value` and every store value reachable from it. Values that are
/// not store values are left as they are.
pub fn freeze_value(value: &Value) {
    freeze_reachable(vec![value.clone()], &mut HashSet::new());
}

fn freeze_reachable(mut pending: Vec<Value>, seen: &mut HashSet<usize>) {
    while let Some(value) = pending.pop() {
        match &value {
            Value::Mapping(m) => {
                if seen.insert(Rc::as_ptr(m) as usize) {
                    m.lock_shallow();
                    pending.extend(m.values());
                }
            }
            Value::Object(o) => {
                if seen.insert(Rc::as_ptr(o) as usize) {
                    o.lock_shallow();
                    pending.extend(o.reachable());
                }
            }
            Value::List(l) => {
                if seen.insert(Rc::as_ptr(l) as usize) {
                    pending.extend(l.borrow().iter().cloned());
                }
            }
            Value::Tuple(t) => pending.extend(t.iter().cloned()),
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::types::{TypeBuilder, TypeKind};

    fn class(name: &str) -> Rc<SealedType> {
        TypeBuilder::new(name, TypeKind::Class).build().unwrap()
    }

    #[test]
    fn test_locked_mapping_refuses_mutation_but_allows_reads() {
        let m = LockedMapping::new();
        m.insert_str("a", Value::Int(1)).unwrap();
        m.freeze();
        assert!(m.is_locked());
        assert!(matches!(
            m.insert_str("b", Value::Int(2)),
            Err(KernelError::LockedValue { ref key, ref target }) if key == "b" && target == "Dict"
        ));
        assert!(m.remove(&MapKey::str("a")).is_err());
        assert!(m.popitem().is_err());
        assert!(m.clear().is_err());
        assert!(m.update(vec![(MapKey::str("c"), Value::None)]).is_err());
        assert_eq!(m.get_str("a").and_then(|v| v.as_int()), Some(1));
        assert_eq!(m.len(), 1);
    }

    #[test]
    fn test_locked_mapping_absent_removal_is_not_an_error() {
        let m = LockedMapping::new();
        m.freeze();
        assert!(m.remove(&MapKey::str("missing")).unwrap().is_none());
        assert!(m.popitem().unwrap().is_none());
    }

    #[test]
    fn test_setdefault_inserts_only_when_absent() {
        let m = LockedMapping::new();
        let v = m.setdefault(MapKey::str("k"), Value::Int(1)).unwrap();
        assert_eq!(v.as_int(), Some(1));
        let v = m.setdefault(MapKey::str("k"), Value::Int(2)).unwrap();
        assert_eq!(v.as_int(), Some(1));
        m.freeze();
        assert_eq!(
            m.setdefault(MapKey::str("k"), Value::Int(3))
                .unwrap()
                .as_int(),
            Some(1)
        );
        assert!(m.setdefault(MapKey::str("other"), Value::Int(3)).is_err());
    }

    #[test]
    fn test_copy_is_unlocked() {
        let m = LockedMapping::new();
        m.insert_str("a", Value::Int(1)).unwrap();
        m.freeze();
        let c = m.copy();
        assert!(!c.is_locked());
        c.insert_str("b", Value::Int(2)).unwrap();
        assert_eq!(m.len(), 1);
    }

    #[test]
    fn test_freeze_reaches_nested_store_values_through_lists() {
        let inner = Rc::new(LockedMapping::new());
        let obj = Rc::new(LockedObject::new(class("Thing")));
        let outer = LockedMapping::new();
        outer
            .insert_str(
                "items",
                Value::list(vec![Value::Mapping(inner.clone()), Value::Object(obj.clone())]),
            )
            .unwrap();
        outer.freeze();
        assert!(inner.is_locked());
        assert!(obj.is_locked());
        assert!(obj.store_overflow("x", Value::None).is_err());
    }

    #[test]
    fn test_freeze_handles_cycles() {
        let a = Rc::new(LockedMapping::new());
        let list = Value::list(Vec::new());
        a.insert_str("self", list.clone()).unwrap();
        if let Value::List(l) = &list {
            l.borrow_mut().push(Value::Mapping(a.clone()));
        }
        freeze_value(&Value::Mapping(a.clone()));
        assert!(a.is_locked());
    }

    #[test]
    fn test_object_lock_is_monotonic() {
        let obj = LockedObject::new(class("Point"));
        obj.store_overflow("x", Value::Int(1)).unwrap();
        obj.freeze();
        let err = obj.store_overflow("x", Value::Int(2)).unwrap_err();
        assert_eq!(err, KernelError::locked("x", "Point object"));
        assert!(obj.remove_attr("x").is_err());
        assert!(!obj.remove_attr("absent").unwrap());
        assert_eq!(obj.instance_attr("x").and_then(|v| v.as_int()), Some(1));
    }

    #[test]
    fn test_map_keys_unify_bools_ints_and_integral_floats() {
        let a = MapKey::from_value(&Value::Bool(true)).unwrap();
        let b = MapKey::from_value(&Value::Int(1)).unwrap();
        let c = MapKey::from_value(&Value::Float(1.0)).unwrap();
        assert!(a == b && b == c);
        assert!(MapKey::from_value(&Value::list(vec![])).is_none());
    }

    #[test]
    fn test_locked_mapping_allows_no_op_mutations() {
        let m = LockedMapping::new();
        m.freeze();
        m.clear().unwrap();
        m.update(Vec::new()).unwrap();
        assert!(m.is_empty());
    }

    #[test]
    fn test_deep_nesting_freezes_and_drops_iteratively() {
        let point = class("Point");
        let mut value = Value::Int(0);
        for depth in 0..200_000 {
            value = match depth % 4 {
                0 => Value::list(vec![value]),
                1 => Value::tuple(vec![value]),
                2 => Value::Mapping(Rc::new(LockedMapping::from_pairs([(MapKey::str("k"), value)]))),
                _ => {
                    let obj = LockedObject::new(point.clone());
                    obj.store_overflow("inner", value).unwrap();
                    Value::Object(Rc::new(obj))
                }
            };
        }
        freeze_value(&value);
        let Value::Object(outer) = &value else {
            panic!("expected an object at the top");
        };
        assert!(outer.is_locked());
        drop(value);
    }
}
