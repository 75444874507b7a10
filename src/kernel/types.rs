//! Sealed types.
//!
//! A type is built by an explicit pipeline: allocate, populate attributes,
//! snapshot bases and the C3 method resolution order, then optionally seal.
//! Bases and MRO are immutable from the moment the type exists; sealing
//! ("metalocking") additionally freezes the type's own attribute table and
//! is irreversible.

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};

use indexmap::IndexMap;

use super::value::Value;
use crate::error::{ErrorKind, KernelError};

static NEXT_IDENTITY: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity marker for types.
pub fn next_identity() -> u64 {
    NEXT_IDENTITY.fetch_add(1, Ordering::Relaxed)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeKind {
    /// The metatype `type`. Never handed to guest code.
    Root,
    /// `object`, the root of every MRO.
    Object,
    Builtin(Builtin),
    Error(ErrorKind),
    /// Guest-defined class.
    Class,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Builtin {
    NoneType,
    Bool,
    Int,
    Float,
    Str,
    Bytes,
    List,
    Tuple,
    Dict,
    Function,
    NativeFunction,
    Method,
    Capability,
    Code,
    Cell,
    Scope,
    Property,
    ClassMethod,
    StaticMethod,
    Super,
    LockedObject,
    Module,
    SignedClass,
}

pub struct SealedType {
    name: Rc<str>,
    identity: u64,
    kind: TypeKind,
    bases: Vec<Rc<SealedType>>,
    // Linearization without the type itself.
    mro: Vec<Rc<SealedType>>,
    attrs: RefCell<IndexMap<String, Value>>,
    metalocked: Cell<bool>,
    doc: Option<Rc<str>>,
    subclasses: RefCell<Vec<Weak<SealedType>>>,
}

impl SealedType {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn identity(&self) -> u64 {
        self.identity
    }

    pub fn kind(&self) -> TypeKind {
        self.kind
    }

    pub fn doc(&self) -> Option<Rc<str>> {
        self.doc.clone()
    }

    pub fn bases(&self) -> &[Rc<SealedType>] {
        &self.bases
    }

    /// Full method resolution order, starting with the type itself.
    pub fn mro(self: &Rc<Self>) -> Vec<Rc<SealedType>> {
        let mut out = Vec::with_capacity(self.mro.len() + 1);
        out.push(self.clone());
        out.extend(self.mro.iter().cloned());
        out
    }

    pub fn is_metalocked(&self) -> bool {
        self.metalocked.get()
    }

    /// Seal the attribute table. Irreversible.
    pub fn metalock(&self) {
        self.metalocked.set(true);
    }

    pub fn own_attr(&self, name: &str) -> Option<Value> {
        self.attrs.borrow().get(name).cloned()
    }

    pub fn own_attr_names(&self) -> Vec<String> {
        self.attrs.borrow().keys().cloned().collect()
    }

    /// Look `name` up along the MRO.
    pub fn lookup(&self, name: &str) -> Option<Value> {
        if let Some(v) = self.own_attr(name) {
            return Some(v);
        }
        self.mro.iter().find_map(|t| t.own_attr(name))
    }

    /// Look `name` up along the MRO, skipping every type up to and
    /// including `after` (the `super` lookup).
    pub fn lookup_after(self: &Rc<Self>, after: &Rc<SealedType>, name: &str) -> Option<Value> {
        let mro = self.mro();
        let start = mro.iter().position(|t| Rc::ptr_eq(t, after))? + 1;
        mro[start..].iter().find_map(|t| t.own_attr(name))
    }

    pub fn set_attr(&self, name: &str, value: Value) -> Result<(), KernelError> {
        if self.is_metalocked() {
            return Err(KernelError::locked(name, format!("type '{}'", self.name)));
        }
        self.attrs.borrow_mut().insert(name.to_string(), value);
        Ok(())
    }

    /// Delete an own attribute; `Ok(false)` when absent.
    pub fn remove_attr(&self, name: &str) -> Result<bool, KernelError> {
        if !self.attrs.borrow().contains_key(name) {
            return Ok(false);
        }
        if self.is_metalocked() {
            return Err(KernelError::locked(name, format!("type '{}'", self.name)));
        }
        Ok(self.attrs.borrow_mut().shift_remove(name).is_some())
    }

    pub fn is_subtype_of(&self, other: &SealedType) -> bool {
        std::ptr::eq(self, other) || self.mro.iter().any(|t| std::ptr::eq(&**t, other))
    }

    /// The nearest exception kind in the MRO, if this is an exception type.
    pub fn error_kind(&self) -> Option<ErrorKind> {
        std::iter::once(self.kind)
            .chain(self.mro.iter().map(|t| t.kind))
            .find_map(|k| match k {
                TypeKind::Error(e) => Some(e),
                _ => None,
            })
    }

    /// Whether `builtin` appears in this type's MRO.
    pub fn derives_from(&self, builtin: Builtin) -> bool {
        self.kind == TypeKind::Builtin(builtin)
            || self
                .mro
                .iter()
                .any(|t| t.kind == TypeKind::Builtin(builtin))
    }

    /// Live subclasses (the raw `__subclasses__` view).
    pub fn subclasses(&self) -> Vec<Rc<SealedType>> {
        self.subclasses
            .borrow()
            .iter()
            .filter_map(Weak::upgrade)
            .collect()
    }
}

/// Explicit construction pipeline for [`SealedType`].
pub struct TypeBuilder {
    name: String,
    kind: TypeKind,
    bases: Vec<Rc<SealedType>>,
    attrs: IndexMap<String, Value>,
    doc: Option<Rc<str>>,
    seal: bool,
}

impl TypeBuilder {
    pub fn new(name: &str, kind: TypeKind) -> Self {
        Self {
            name: name.to_string(),
            kind,
            bases: Vec::new(),
            attrs: IndexMap::new(),
            doc: None,
            seal: false,
        }
    }

    pub fn bases(mut self, bases: Vec<Rc<SealedType>>) -> Self {
        self.bases = bases;
        self
    }

    pub fn base(mut self, base: &Rc<SealedType>) -> Self {
        self.bases.push(base.clone());
        self
    }

    pub fn attr(mut self, name: &str, value: Value) -> Self {
        self.attrs.insert(name.to_string(), value);
        self
    }

    pub fn attrs(mut self, attrs: IndexMap<String, Value>) -> Self {
        self.attrs.extend(attrs);
        self
    }

    pub fn doc(mut self, doc: Option<Rc<str>>) -> Self {
        self.doc = doc;
        self
    }

    /// Seal the type as the last pipeline step.
    pub fn sealed(mut self) -> Self {
        self.seal = true;
        self
    }

    /// Run the pipeline. Fails when no consistent MRO exists.
    pub fn build(self) -> Result<Rc<SealedType>, String> {
        let mro = linearize(&self.name, &self.bases)?;
        Ok(self.finish(mro))
    }

    /// Run the pipeline for a type with at most one base, whose MRO is
    /// always the base's own.
    pub(crate) fn build_chain(self) -> Rc<SealedType> {
        debug_assert!(self.bases.len() <= 1);
        let mro = self.bases.first().map(|b| b.mro()).unwrap_or_default();
        self.finish(mro)
    }

    fn finish(self, mro: Vec<Rc<SealedType>>) -> Rc<SealedType> {
        let ty = Rc::new(SealedType {
            name: Rc::from(self.name.as_str()),
            identity: next_identity(),
            kind: self.kind,
            bases: self.bases,
            mro,
            attrs: RefCell::new(self.attrs),
            metalocked: Cell::new(self.seal),
            doc: self.doc,
            subclasses: RefCell::new(Vec::new()),
        });
        for base in &ty.bases {
            base.subclasses.borrow_mut().push(Rc::downgrade(&ty));
        }
        ty
    }
}

/// C3 linearization of `bases`, excluding the new type itself.
fn linearize(name: &str, bases: &[Rc<SealedType>]) -> Result<Vec<Rc<SealedType>>, String> {
    let mut sequences: Vec<Vec<Rc<SealedType>>> = bases.iter().map(|b| b.mro()).collect();
    sequences.push(bases.to_vec());
    let mut out: Vec<Rc<SealedType>> = Vec::new();
    loop {
        sequences.retain(|s| !s.is_empty());
        if sequences.is_empty() {
            return Ok(out);
        }
        let candidate = sequences.iter().find_map(|seq| {
            let head = &seq[0];
            let in_tail = sequences
                .iter()
                .any(|s| s[1..].iter().any(|t| Rc::ptr_eq(t, head)));
            (!in_tail).then(|| head.clone())
        });
        let Some(next) = candidate else {
            return Err(format!(
                "cannot create a consistent method resolution order for '{name}'"
            ));
        };
        for seq in &mut sequences {
            if Rc::ptr_eq(&seq[0], &next) {
                seq.remove(0);
            }
        }
        out.push(next);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(ty: &Rc<SealedType>) -> Vec<String> {
        ty.mro().iter().map(|t| t.name().to_string()).collect()
    }

    #[test]
    fn test_c3_diamond() {
        let object = TypeBuilder::new("object", TypeKind::Object).build().unwrap();
        let a = TypeBuilder::new("A", TypeKind::Class).base(&object).build().unwrap();
        let b = TypeBuilder::new("B", TypeKind::Class).base(&a).build().unwrap();
        let c = TypeBuilder::new("C", TypeKind::Class).base(&a).build().unwrap();
        let d = TypeBuilder::new("D", TypeKind::Class)
            .bases(vec![b.clone(), c.clone()])
            .build()
            .unwrap();
        assert_eq!(names(&d), ["D", "B", "C", "A", "object"]);
        assert!(d.is_subtype_of(&a));
        assert!(!a.is_subtype_of(&d));
    }

    #[test]
    fn test_inconsistent_mro_is_rejected() {
        let object = TypeBuilder::new("object", TypeKind::Object).build().unwrap();
        let a = TypeBuilder::new("A", TypeKind::Class).base(&object).build().unwrap();
        let b = TypeBuilder::new("B", TypeKind::Class).base(&a).build().unwrap();
        assert!(
            TypeBuilder::new("X", TypeKind::Class)
                .bases(vec![a, b])
                .build()
                .is_err()
        );
    }

    #[test]
    fn test_metalock_freezes_attribute_table() {
        let t = TypeBuilder::new("T", TypeKind::Class)
            .attr("x", Value::Int(1))
            .build()
            .unwrap();
        t.set_attr("y", Value::Int(2)).unwrap();
        t.metalock();
        assert!(t.set_attr("z", Value::Int(3)).is_err());
        assert!(t.remove_attr("x").is_err());
        assert_eq!(t.lookup("y").and_then(|v| v.as_int()), Some(2));
    }

    #[test]
    fn test_identities_are_unique_and_lookup_follows_mro() {
        let base = TypeBuilder::new("Base", TypeKind::Class)
            .attr("greet", Value::str("hi"))
            .build()
            .unwrap();
        let child = TypeBuilder::new("Child", TypeKind::Class).base(&base).build().unwrap();
        assert_ne!(base.identity(), child.identity());
        assert!(child.lookup("greet").is_some());
        assert!(child.lookup_after(&child, "greet").is_some());
        assert!(child.lookup_after(&base, "greet").is_none());
        assert_eq!(base.subclasses().len(), 1);
    }
}
