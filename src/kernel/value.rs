//! Runtime values.
//!
//! Guest-visible compound values are tagged variants over the capability
//! store types ([`LockedMapping`], [`LockedObject`], [`SealedType`]) plus the
//! callables the evaluator needs. The `Code`, `Cell` and `Scope` variants are
//! internal: they exist because the raw object model can produce them, and
//! the reflection mediator refuses to hand them to guest code.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::ops::Deref;
use std::rc::Rc;

use indexmap::IndexMap;

use super::scope::Scope;
use super::store::{LockedMapping, LockedObject};
use super::types::SealedType;
use crate::interp::{Env, EvalResult, Interpreter};
use crate::script::ast::FunctionDef;

#[derive(Clone)]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(Rc<str>),
    Bytes(Rc<[u8]>),
    List(Rc<ListCell>),
    Tuple(Rc<TupleItems>),
    Mapping(Rc<LockedMapping>),
    Object(Rc<LockedObject>),
    Type(Rc<SealedType>),
    Function(Rc<Function>),
    Native(Rc<NativeFn>),
    Bound(Rc<BoundMethod>),
    Capability(Rc<SealedCapability>),
    Descriptor(Rc<Descriptor>),
    Super(Rc<SuperProxy>),
    Code(Rc<CodeObject>),
    Cell(Rc<ClosureCell>),
    Scope(Rc<Scope>),
}

impl Value {
    pub fn str(s: &str) -> Self {
        Value::Str(Rc::from(s))
    }

    pub fn list(items: Vec<Value>) -> Self {
        Value::List(Rc::new(ListCell(RefCell::new(items))))
    }

    pub fn tuple(items: Vec<Value>) -> Self {
        Value::Tuple(Rc::new(TupleItems(items.into_boxed_slice())))
    }

    pub fn bytes(data: &[u8]) -> Self {
        Value::Bytes(Rc::from(data))
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Value::None)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::Bool(b) => Some(*b as i64),
            _ => None,
        }
    }

    pub fn as_type(&self) -> Option<&Rc<SealedType>> {
        match self {
            Value::Type(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&Rc<LockedObject>> {
        match self {
            Value::Object(o) => Some(o),
            _ => None,
        }
    }

    /// Object identity. Reference values use their allocation address;
    /// immediates have no stable identity and hash their contents instead.
    pub fn identity(&self) -> usize {
        fn addr<T: ?Sized>(rc: &Rc<T>) -> usize {
            Rc::as_ptr(rc) as *const () as usize
        }
        match self {
            Value::None => 0,
            Value::Bool(b) => 1 + *b as usize,
            Value::Int(i) => *i as usize,
            Value::Float(f) => f.to_bits() as usize,
            Value::Str(s) => addr(s),
            Value::Bytes(b) => addr(b),
            Value::List(l) => addr(l),
            Value::Tuple(t) => addr(t),
            Value::Mapping(m) => addr(m),
            Value::Object(o) => addr(o),
            Value::Type(t) => t.identity() as usize,
            Value::Function(f) => addr(f),
            Value::Native(n) => addr(n),
            Value::Bound(b) => addr(b),
            Value::Capability(c) => addr(c),
            Value::Descriptor(d) => addr(d),
            Value::Super(s) => addr(s),
            Value::Code(c) => addr(c),
            Value::Cell(c) => addr(c),
            Value::Scope(s) => addr(s),
        }
    }

    /// `is` comparison.
    pub fn same(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::None, Value::None) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a.to_bits() == b.to_bits(),
            (Value::Str(a), Value::Str(b)) => Rc::ptr_eq(a, b) || a == b,
            (Value::Type(a), Value::Type(b)) => Rc::ptr_eq(a, b),
            (a, b) if std::mem::discriminant(a) == std::mem::discriminant(b) => {
                a.identity() == b.identity()
            }
            _ => false,
        }
    }

    /// Short type name used in error messages.
    pub fn type_name(&self) -> String {
        match self {
            Value::None => "NoneType".into(),
            Value::Bool(_) => "bool".into(),
            Value::Int(_) => "int".into(),
            Value::Float(_) => "float".into(),
            Value::Str(_) => "str".into(),
            Value::Bytes(_) => "bytes".into(),
            Value::List(_) => "list".into(),
            Value::Tuple(_) => "tuple".into(),
            Value::Mapping(_) => "dict".into(),
            Value::Object(o) => o.class().name().to_string(),
            Value::Type(_) => "type".into(),
            Value::Function(_) => "function".into(),
            Value::Native(_) => "builtin_function".into(),
            Value::Bound(_) => "method".into(),
            Value::Capability(_) => "capability".into(),
            Value::Descriptor(d) => match **d {
                Descriptor::Property { .. } => "property".into(),
                Descriptor::ClassMethod(_) => "classmethod".into(),
                Descriptor::StaticMethod(_) => "staticmethod".into(),
            },
            Value::Super(_) => "super".into(),
            Value::Code(_) => "code".into(),
            Value::Cell(_) => "cell".into(),
            Value::Scope(_) => "scope".into(),
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::None => write!(f, "None"),
            Value::Bool(b) => write!(f, "{}", if *b { "True" } else { "False" }),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(x) => write!(f, "{x:?}"),
            Value::Str(s) => write!(f, "{s:?}"),
            Value::Bytes(b) => write!(f, "b{:?}", String::from_utf8_lossy(b)),
            Value::List(l) => f.debug_list().entries(l.borrow().iter()).finish(),
            Value::Tuple(t) => {
                let mut d = f.debug_tuple("");
                for item in t.iter() {
                    d.field(item);
                }
                d.finish()
            }
            Value::Mapping(m) => write!(f, "<dict of {} entries>", m.len()),
            Value::Object(o) => write!(f, "<{} object>", o.class().name()),
            Value::Type(t) => write!(f, "<class '{}'>", t.name()),
            Value::Function(func) => write!(f, "<function {}>", func.def.name),
            Value::Native(n) => write!(f, "<built-in function {}>", n.name),
            Value::Bound(_) => write!(f, "<bound method>"),
            Value::Capability(c) => write!(f, "function({})", c.signature),
            other => write!(f, "<{}>", other.type_name()),
        }
    }
}

/// Backing store of a list value.
pub struct ListCell(RefCell<Vec<Value>>);

impl Deref for ListCell {
    type Target = RefCell<Vec<Value>>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Drop for ListCell {
    fn drop(&mut self) {
        release(std::mem::take(self.0.get_mut()));
    }
}

/// Backing store of a tuple value.
pub struct TupleItems(Box<[Value]>);

impl Deref for TupleItems {
    type Target = [Value];

    fn deref(&self) -> &[Value] {
        &self.0
    }
}

impl Drop for TupleItems {
    fn drop(&mut self) {
        release(std::mem::take(&mut self.0).into_vec());
    }
}

thread_local! {
    static RELEASING: Cell<bool> = const { Cell::new(false) };
    static PENDING: RefCell<Vec<Value>> = const { RefCell::new(Vec::new()) };
}

/// Drop the children of a container without recursing into them.
///
/// Containers call this from their `Drop` impls. The outermost call drains
/// a per-thread queue; nested calls only push onto it, so tearing down an
/// arbitrarily deep structure uses constant stack.
pub(crate) fn release(children: Vec<Value>) {
    if children.is_empty() {
        return;
    }
    if PENDING
        .try_with(|pending| pending.borrow_mut().extend(children))
        .is_err()
    {
        return;
    }
    if RELEASING.try_with(|r| r.replace(true)).unwrap_or(true) {
        return;
    }
    while let Some(value) = PENDING.try_with(|p| p.borrow_mut().pop()).ok().flatten() {
        drop(value);
    }
    let _ = RELEASING.try_with(|r| r.set(false));
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::str(s)
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(Rc::from(s))
    }
}

/// Class cell shared by the methods of one class body; filled once the
/// class has been built so that `__class__` resolves inside methods.
pub type ClassCell = Rc<RefCell<Option<Rc<SealedType>>>>;

/// A guest function: a definition plus the state it closed over.
pub struct Function {
    pub def: Rc<FunctionDef>,
    pub defaults: Vec<Value>,
    pub kw_defaults: Vec<Option<Value>>,
    pub globals: Rc<Scope>,
    pub env: Option<Rc<Env>>,
    pub class_cell: Option<ClassCell>,
    pub file: Rc<str>,
}

impl Function {
    pub fn name(&self) -> &str {
        &self.def.name
    }

    pub fn signature(&self) -> String {
        self.def.params.signature()
    }
}

pub type NativeImpl = dyn Fn(&Interpreter, Args) -> EvalResult<Value>;

/// A host-implemented callable.
pub struct NativeFn {
    pub name: Rc<str>,
    pub doc: Option<Rc<str>>,
    pub func: Box<NativeImpl>,
}

impl NativeFn {
    pub fn value(
        name: &str,
        func: impl Fn(&Interpreter, Args) -> EvalResult<Value> + 'static,
    ) -> Value {
        Value::Native(Rc::new(NativeFn {
            name: Rc::from(name),
            doc: None,
            func: Box::new(func),
        }))
    }

    pub fn documented(
        name: &str,
        doc: &str,
        func: impl Fn(&Interpreter, Args) -> EvalResult<Value> + 'static,
    ) -> Value {
        Value::Native(Rc::new(NativeFn {
            name: Rc::from(name),
            doc: Some(Rc::from(doc)),
            func: Box::new(func),
        }))
    }
}

pub struct BoundMethod {
    pub receiver: Value,
    pub func: Value,
}

impl BoundMethod {
    pub fn value(receiver: Value, func: Value) -> Value {
        Value::Bound(Rc::new(BoundMethod { receiver, func }))
    }
}

/// Output of the API sealer: callable, documented, and otherwise opaque.
pub struct SealedCapability {
    pub(crate) target: Value,
    pub signature: Rc<str>,
    pub doc: Option<Rc<str>>,
}

pub enum Descriptor {
    Property {
        fget: Option<Value>,
        fset: Option<Value>,
        fdel: Option<Value>,
        doc: Option<Rc<str>>,
    },
    ClassMethod(Value),
    StaticMethod(Value),
}

/// Result of the two-argument `super(cls, receiver)`.
pub struct SuperProxy {
    pub start: Rc<SealedType>,
    pub receiver: Value,
}

/// Raw code object, reachable only through a function's `__code__` slot.
pub struct CodeObject {
    pub def: Rc<FunctionDef>,
    pub file: Rc<str>,
}

/// Raw closure cell: one variable of an enclosing function frame.
pub struct ClosureCell {
    pub env: Rc<Env>,
    pub name: String,
}

/// Call arguments.
#[derive(Clone, Default)]
pub struct Args {
    pub positional: Vec<Value>,
    pub keywords: IndexMap<String, Value>,
}

impl Args {
    pub fn new(positional: Vec<Value>) -> Self {
        Self {
            positional,
            keywords: IndexMap::new(),
        }
    }

    pub fn with_keyword(mut self, name: &str, value: Value) -> Self {
        self.keywords.insert(name.to_string(), value);
        self
    }

    pub fn prepend(mut self, receiver: Value) -> Self {
        self.positional.insert(0, receiver);
        self
    }

    pub fn len(&self) -> usize {
        self.positional.len() + self.keywords.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bind arguments to named slots the way a host signature
    /// `fname(names[0], names[1], ...)` would, with the first `required`
    /// slots mandatory.
    pub fn parse(
        &self,
        fname: &str,
        names: &[&str],
        required: usize,
    ) -> EvalResult<Vec<Option<Value>>> {
        use crate::interp::type_error;
        if self.positional.len() > names.len() {
            return Err(type_error(format!(
                "{fname}() takes at most {} arguments ({} given)",
                names.len(),
                self.positional.len()
            )));
        }
        let mut slots: Vec<Option<Value>> = vec![None; names.len()];
        for (i, v) in self.positional.iter().enumerate() {
            slots[i] = Some(v.clone());
        }
        for (key, v) in &self.keywords {
            let Some(i) = names.iter().position(|n| n == key) else {
                return Err(type_error(format!(
                    "{fname}() got an unexpected keyword argument '{key}'"
                )));
            };
            if slots[i].is_some() {
                return Err(type_error(format!(
                    "{fname}() got multiple values for argument '{key}'"
                )));
            }
            slots[i] = Some(v.clone());
        }
        if let Some(missing) = slots.iter().take(required).position(Option::is_none) {
            return Err(type_error(format!(
                "{fname}() missing required argument: '{}'",
                names[missing]
            )));
        }
        Ok(slots)
    }

    /// Positional-only form of [`Args::parse`].
    pub fn exact(&self, fname: &str, min: usize, max: usize) -> EvalResult<&[Value]> {
        use crate::interp::type_error;
        if !self.keywords.is_empty() {
            return Err(type_error(format!(
                "{fname}() takes no keyword arguments"
            )));
        }
        let n = self.positional.len();
        if n < min || n > max {
            let expected = if min == max {
                format!("{min}")
            } else {
                format!("{min} to {max}")
            };
            return Err(type_error(format!(
                "{fname}() takes {expected} arguments ({n} given)"
            )));
        }
        Ok(&self.positional)
    }
}
