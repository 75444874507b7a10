//! The raw object model: attribute lookup, binding and storage.
//!
//! Nothing here applies policy. Guest attribute syntax reaches this layer
//! only through [`crate::kernel::mediator`], which screens what comes back.

use std::rc::Rc;

use super::{EvalResult, Interpreter, attribute_error, locked, type_error};
use crate::kernel::sealer;
use crate::kernel::store::LockedObject;
use crate::kernel::types::{SealedType, TypeKind};
use crate::kernel::value::{
    Args, BoundMethod, ClosureCell, CodeObject, Descriptor, Function, NativeFn, SuperProxy, Value,
};

/// Attributes of a locked object that are never writable.
const PROTECTED: &[&str] = &["__locked__", "__proxydict__"];

/// Type attributes that only the construction pipeline sets.
const TYPE_READONLY: &[&str] = &[
    "__name__", "__qualname__", "__bases__", "__base__", "__mro__", "__class__", "__dict__",
];

impl Interpreter {
    pub fn get_attr(&self, obj: &Value, name: &str) -> EvalResult<Value> {
        self.lookup_attr(obj, name)?.ok_or_else(|| {
            attribute_error(match obj {
                Value::Type(t) => format!("type object '{}' has no attribute '{name}'", t.name()),
                _ => format!("'{}' object has no attribute '{name}'", obj.type_name()),
            })
        })
    }

    /// Raw attribute lookup; `Ok(None)` when the attribute does not exist.
    pub fn lookup_attr(&self, obj: &Value, name: &str) -> EvalResult<Option<Value>> {
        match name {
            "__class__" => return Ok(Some(Value::Type(self.type_of(obj)))),
            "__getattribute__" => return Ok(Some(raw_accessor(obj, "__getattribute__"))),
            "__setattr__" => return Ok(Some(raw_accessor(obj, "__setattr__"))),
            "__delattr__" => return Ok(Some(raw_accessor(obj, "__delattr__"))),
            _ => {}
        }
        match obj {
            Value::Type(t) => self.type_attr(t, name),
            Value::Object(o) => self.object_attr(obj, o, name),
            Value::Super(s) => self.super_attr(s, name),
            Value::Function(f) => match function_attr(f, name) {
                Some(v) => Ok(Some(v)),
                None => self.class_attr(obj, name),
            },
            Value::Native(n) => match name {
                "__name__" => Ok(Some(Value::Str(n.name.clone()))),
                "__doc__" => Ok(Some(doc_value(&n.doc))),
                _ => self.class_attr(obj, name),
            },
            Value::Bound(b) => match name {
                "__self__" => Ok(Some(b.receiver.clone())),
                "__func__" => Ok(Some(b.func.clone())),
                _ => self.lookup_attr(&b.func, name),
            },
            Value::Capability(c) => Ok(match name {
                "__doc__" => Some(doc_value(&c.doc)),
                "__signature__" => Some(Value::Str(c.signature.clone())),
                _ => None,
            }),
            Value::Code(c) => Ok(code_attr(c, name)),
            Value::Cell(c) => Ok(match name {
                "cell_contents" => Some(c.env.get_local(&c.name).unwrap_or(Value::None)),
                _ => None,
            }),
            Value::Descriptor(d) => match (&**d, name) {
                (Descriptor::Property { fget, .. }, "fget") => Ok(Some(opt(fget))),
                (Descriptor::Property { fset, .. }, "fset") => Ok(Some(opt(fset))),
                (Descriptor::Property { fdel, .. }, "fdel") => Ok(Some(opt(fdel))),
                (Descriptor::Property { doc, .. }, "__doc__") => Ok(Some(doc_value(doc))),
                (Descriptor::ClassMethod(f) | Descriptor::StaticMethod(f), "__func__") => {
                    Ok(Some(f.clone()))
                }
                _ => self.class_attr(obj, name),
            },
            _ => self.class_attr(obj, name),
        }
    }

    /// Attribute found on the value's type, bound to the value.
    fn class_attr(&self, obj: &Value, name: &str) -> EvalResult<Option<Value>> {
        let ty = self.type_of(obj);
        match ty.lookup(name) {
            Some(v) => self.bind(v, obj, &ty).map(Some),
            None => Ok(None),
        }
    }

    /// Apply descriptor semantics to a class attribute fetched for `receiver`.
    fn bind(&self, value: Value, receiver: &Value, owner: &Rc<SealedType>) -> EvalResult<Value> {
        match &value {
            Value::Function(_) | Value::Native(_) => Ok(BoundMethod::value(receiver.clone(), value)),
            Value::Descriptor(d) => match &**d {
                Descriptor::Property { fget: Some(fget), .. } => {
                    self.call(fget, Args::new(vec![receiver.clone()]))
                }
                Descriptor::Property { fget: None, .. } => {
                    Err(attribute_error("unreadable attribute"))
                }
                Descriptor::ClassMethod(f) => {
                    Ok(BoundMethod::value(Value::Type(owner.clone()), f.clone()))
                }
                Descriptor::StaticMethod(f) => Ok(f.clone()),
            },
            _ => Ok(value),
        }
    }

    fn type_attr(&self, t: &Rc<SealedType>, name: &str) -> EvalResult<Option<Value>> {
        let special = match name {
            "__name__" | "__qualname__" => Some(Value::str(t.name())),
            "__doc__" => Some(doc_value(&t.doc())),
            "__bases__" => Some(types_tuple(t.bases())),
            "__base__" => Some(t.bases().first().cloned().map(Value::Type).unwrap_or(Value::None)),
            "__mro__" => Some(types_tuple(&t.mro())),
            "__dict__" => Some(Value::None),
            "__subclasses__" => {
                let target = t.clone();
                Some(NativeFn::value("__subclasses__", move |_, args| {
                    args.exact("__subclasses__", 0, 0)?;
                    Ok(types_list(&target.subclasses()))
                }))
            }
            _ => None,
        };
        if special.is_some() {
            return Ok(special);
        }
        if let Some(v) = t.lookup(name) {
            return Ok(Some(match &v {
                Value::Descriptor(d) => match &**d {
                    Descriptor::ClassMethod(f) => BoundMethod::value(Value::Type(t.clone()), f.clone()),
                    Descriptor::StaticMethod(f) => f.clone(),
                    Descriptor::Property { .. } => v.clone(),
                },
                _ => v.clone(),
            }));
        }
        if name == "metalock" && t.kind() == TypeKind::Class {
            let target = t.clone();
            return Ok(Some(NativeFn::documented(
                "metalock",
                "Seal the class attribute table. Irreversible.",
                move |_, args| {
                    args.exact("metalock", 0, 0)?;
                    target.metalock();
                    tracing::debug!(class = %target.name(), "class metalocked");
                    Ok(Value::Type(target.clone()))
                },
            )));
        }
        Ok(None)
    }

    fn object_attr(&self, value: &Value, o: &Rc<LockedObject>, name: &str) -> EvalResult<Option<Value>> {
        match name {
            "__dict__" => return Ok(Some(Value::None)),
            "__locked__" => return Ok(Some(Value::Bool(o.is_locked()))),
            _ => {}
        }
        if let Some(state) = o.exception_state() {
            match name {
                "args" => return Ok(Some(Value::tuple(state.args()))),
                "__traceback__" => {
                    let lines = super::render_trace(&state.trace.borrow());
                    return Ok(Some(Value::list(lines.into_iter().map(Value::from).collect())));
                }
                _ => {}
            }
        }
        let class = o.class().clone();
        let declared = class.lookup(name);
        if let Some(Value::Descriptor(d)) = &declared
            && let Descriptor::Property { .. } = &**d
        {
            return self.bind(Value::Descriptor(d.clone()), value, &class).map(Some);
        }
        if let Some(v) = o.instance_attr(name) {
            return Ok(Some(v));
        }
        match declared {
            Some(v) => self.bind(v, value, &class).map(Some),
            None => Ok(None),
        }
    }

    fn super_attr(&self, s: &SuperProxy, name: &str) -> EvalResult<Option<Value>> {
        let owner = match &s.receiver {
            Value::Type(t) => t.clone(),
            other => self.type_of(other),
        };
        let Some(v) = owner.lookup_after(&s.start, name) else {
            return Ok(None);
        };
        if let Value::Type(_) = &s.receiver
            && let Value::Function(_) | Value::Native(_) = &v
        {
            return Ok(Some(v));
        }
        self.bind(v, &s.receiver, &owner).map(Some)
    }

    pub fn set_attr(&self, obj: &Value, name: &str, value: Value) -> EvalResult<()> {
        match obj {
            Value::Object(o) => {
                if PROTECTED.contains(&name) {
                    return Err(locked(name, &o.label()));
                }
                if matches!(name, "__class__" | "__dict__") {
                    return Err(attribute_error(format!("attribute '{name}' is read-only")));
                }
                let value = match &value {
                    Value::Function(_) if o.is_exports() => sealer::seal_function(self, &value)?,
                    _ => value,
                };
                match o.class().lookup(name) {
                    Some(Value::Descriptor(d)) => match &*d {
                        Descriptor::Property { fset: Some(fset), fget, .. } => {
                            if o.is_locked() && fget.is_some() {
                                return Err(locked(name, &o.label()));
                            }
                            self.call(fset, Args::new(vec![obj.clone(), value]))?;
                            Ok(())
                        }
                        Descriptor::Property { fset: None, .. } => {
                            Err(attribute_error(format!("can't set attribute '{name}'")))
                        }
                        _ => Ok(o.store_field(name, value)?),
                    },
                    Some(_) => Ok(o.store_field(name, value)?),
                    None => Ok(o.store_overflow(name, value)?),
                }
            }
            Value::Type(t) => {
                if TYPE_READONLY.contains(&name) {
                    return Err(attribute_error(format!("readonly attribute '{name}'")));
                }
                Ok(t.set_attr(name, value)?)
            }
            other => Err(attribute_error(format!(
                "'{}' object attribute '{name}' is read-only",
                other.type_name()
            ))),
        }
    }

    pub fn del_attr(&self, obj: &Value, name: &str) -> EvalResult<()> {
        match obj {
            Value::Object(o) => {
                if PROTECTED.contains(&name) {
                    return Err(locked(name, &o.label()));
                }
                if let Some(Value::Descriptor(d)) = o.class().lookup(name)
                    && let Descriptor::Property { fdel, .. } = &*d
                {
                    let Some(fdel) = fdel else {
                        return Err(attribute_error(format!("can't delete attribute '{name}'")));
                    };
                    self.call(fdel, Args::new(vec![obj.clone()]))?;
                    return Ok(());
                }
                if o.remove_attr(name)? {
                    Ok(())
                } else {
                    Err(attribute_error(format!(
                        "'{}' object has no attribute '{name}'",
                        obj.type_name()
                    )))
                }
            }
            Value::Type(t) => {
                if TYPE_READONLY.contains(&name) {
                    return Err(attribute_error(format!("readonly attribute '{name}'")));
                }
                if t.remove_attr(name)? {
                    Ok(())
                } else {
                    Err(attribute_error(format!(
                        "type object '{}' has no attribute '{name}'",
                        t.name()
                    )))
                }
            }
            other => Err(attribute_error(format!(
                "'{}' object attribute '{name}' is read-only",
                other.type_name()
            ))),
        }
    }

    /// Sorted attribute names, as `dir()` reports them.
    pub fn attr_names(&self, obj: &Value) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        let types = match obj {
            Value::Type(t) => t.mro(),
            Value::Object(o) => {
                names.extend(o.attr_names());
                o.class().mro()
            }
            Value::Capability(_) => return vec!["__doc__".into(), "__signature__".into()],
            other => self.type_of(other).mro(),
        };
        for t in types {
            names.extend(t.own_attr_names());
        }
        names.sort();
        names.dedup();
        names
    }

    /// A dunder hook defined by a guest class, bound to `obj`.
    pub(crate) fn class_hook(&self, obj: &Value, name: &str) -> EvalResult<Option<Value>> {
        let Value::Object(o) = obj else {
            return Ok(None);
        };
        let class = o.class().clone();
        match class.lookup(name) {
            Some(v) => self.bind(v, obj, &class).map(Some),
            None => Ok(None),
        }
    }

    /// `super(cls, receiver)`.
    pub fn make_super(&self, start: &Value, receiver: Value) -> EvalResult<Value> {
        let Value::Type(start) = start else {
            return Err(type_error("super() argument 1 must be a type"));
        };
        let ok = match &receiver {
            Value::Type(t) => t.is_subtype_of(start),
            other => self.isinstance(other, start),
        };
        if !ok {
            return Err(type_error(
                "super(type, obj): obj must be an instance or subtype of type",
            ));
        }
        Ok(Value::Super(Rc::new(SuperProxy {
            start: start.clone(),
            receiver,
        })))
    }
}

/// Unmediated `__getattribute__`/`__setattr__`/`__delattr__` of `obj`.
fn raw_accessor(obj: &Value, which: &'static str) -> Value {
    let receiver = obj.clone();
    NativeFn::value(which, move |interp, args| match which {
        "__getattribute__" => {
            let parts = args.exact(which, 1, 1)?;
            let name = attr_name(&parts[0])?;
            interp.get_attr(&receiver, name)
        }
        "__setattr__" => {
            let parts = args.exact(which, 2, 2)?;
            let name = attr_name(&parts[0])?;
            interp.set_attr(&receiver, name, parts[1].clone())?;
            Ok(Value::None)
        }
        _ => {
            let parts = args.exact(which, 1, 1)?;
            let name = attr_name(&parts[0])?;
            interp.del_attr(&receiver, name)?;
            Ok(Value::None)
        }
    })
}

pub(crate) fn attr_name(v: &Value) -> EvalResult<&str> {
    v.as_str()
        .ok_or_else(|| type_error(format!("attribute name must be string, not '{}'", v.type_name())))
}

fn function_attr(f: &Rc<Function>, name: &str) -> Option<Value> {
    Some(match name {
        "__name__" | "__qualname__" => Value::str(f.name()),
        "__doc__" => doc_value(&f.def.doc),
        "__defaults__" => {
            if f.defaults.is_empty() {
                Value::None
            } else {
                Value::tuple(f.defaults.clone())
            }
        }
        "__code__" => Value::Code(Rc::new(CodeObject {
            def: f.def.clone(),
            file: f.file.clone(),
        })),
        "__globals__" => Value::Scope(f.globals.clone()),
        "__closure__" => {
            let env = f.env.as_ref()?;
            let cells: Vec<Value> = env
                .local_names()
                .into_iter()
                .map(|name| {
                    Value::Cell(Rc::new(ClosureCell {
                        env: env.clone(),
                        name,
                    }))
                })
                .collect();
            if cells.is_empty() {
                Value::None
            } else {
                Value::tuple(cells)
            }
        }
        _ => return None,
    })
}

fn code_attr(c: &CodeObject, name: &str) -> Option<Value> {
    Some(match name {
        "co_name" => Value::str(&c.def.name),
        "co_filename" => Value::Str(c.file.clone()),
        "co_firstlineno" => Value::Int(c.def.line as i64),
        "co_argcount" => Value::Int(c.def.params.args.len() as i64),
        "co_varnames" => Value::tuple(
            c.def
                .params
                .args
                .iter()
                .map(|p| Value::str(&p.name))
                .collect(),
        ),
        _ => return None,
    })
}

fn doc_value(doc: &Option<Rc<str>>) -> Value {
    doc.clone().map(Value::Str).unwrap_or(Value::None)
}

fn opt(v: &Option<Value>) -> Value {
    v.clone().unwrap_or(Value::None)
}

fn types_tuple(types: &[Rc<SealedType>]) -> Value {
    Value::tuple(types.iter().cloned().map(Value::Type).collect())
}

fn types_list(types: &[Rc<SealedType>]) -> Value {
    Value::list(types.iter().cloned().map(Value::Type).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interp::testing::interpreter;
    use crate::kernel::types::Builtin;

    #[test]
    fn test_raw_layer_exposes_internals() {
        let (interp, _) = interpreter();
        let scope = crate::kernel::scope::Scope::new();
        interp
            .run_trusted("def outer():\n    x = 1\n    def inner():\n        return x\n    return inner\nf = outer()\n", &scope, "<t>")
            .unwrap();
        let f = scope.get("f").unwrap();
        assert!(matches!(interp.get_attr(&f, "__code__").unwrap(), Value::Code(_)));
        assert!(matches!(interp.get_attr(&f, "__globals__").unwrap(), Value::Scope(_)));
        let Value::Tuple(cells) = interp.get_attr(&f, "__closure__").unwrap() else {
            panic!("expected a tuple of cells")
        };
        let contents = interp.get_attr(&cells[0], "cell_contents").unwrap();
        assert_eq!(contents.as_int(), Some(1));
    }

    #[test]
    fn test_type_structure_is_read_only() {
        let (interp, _) = interpreter();
        let int = Value::Type(interp.prelude().builtin(Builtin::Int).clone());
        let err = interp.set_attr(&int, "__bases__", Value::tuple(vec![])).unwrap_err();
        assert!(err.to_string().contains("readonly"));
        let err = interp.set_attr(&int, "extra", Value::Int(1)).unwrap_err();
        assert_eq!(err.type_name(), "LockedValueError");
    }

    #[test]
    fn test_protected_object_attributes() {
        let (interp, _) = interpreter();
        let cls = interp.prelude().builtin(Builtin::LockedObject).clone();
        let obj = Value::Object(Rc::new(LockedObject::new(cls)));
        assert!(interp.set_attr(&obj, "__locked__", Value::Bool(false)).is_err());
        assert!(interp.del_attr(&obj, "__proxydict__").is_err());
        interp.set_attr(&obj, "a", Value::Int(3)).unwrap();
        assert_eq!(interp.get_attr(&obj, "a").unwrap().as_int(), Some(3));
        assert!(interp.get_attr(&obj, "__dict__").unwrap().is_none());
    }
}
