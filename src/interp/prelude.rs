//! Built-in type objects shared by every scope of a session tree.
//!
//! All of them are sealed at creation: guest code can subclass the few that
//! admit subclassing, but never patch them.

use std::collections::HashMap;
use std::rc::Rc;

use indexmap::IndexMap;

use super::methods;
use super::{EvalResult, Interpreter, type_error};
use crate::error::ErrorKind;
use crate::kernel::signed;
use crate::kernel::types::{Builtin, SealedType, TypeBuilder, TypeKind};
use crate::kernel::value::{Args, Descriptor, NativeFn, Value};

const BUILTIN_NAMES: &[(Builtin, &str)] = &[
    (Builtin::NoneType, "NoneType"),
    (Builtin::Int, "int"),
    (Builtin::Float, "float"),
    (Builtin::Str, "str"),
    (Builtin::Bytes, "bytes"),
    (Builtin::List, "list"),
    (Builtin::Tuple, "tuple"),
    (Builtin::Dict, "dict"),
    (Builtin::Function, "function"),
    (Builtin::NativeFunction, "builtin_function"),
    (Builtin::Method, "method"),
    (Builtin::Capability, "capability"),
    (Builtin::Code, "code"),
    (Builtin::Cell, "cell"),
    (Builtin::Scope, "scope"),
    (Builtin::Property, "property"),
    (Builtin::ClassMethod, "classmethod"),
    (Builtin::StaticMethod, "staticmethod"),
    (Builtin::Super, "super"),
    (Builtin::LockedObject, "Object"),
    (Builtin::Module, "module"),
    (Builtin::SignedClass, "SignedClass"),
];

pub struct Prelude {
    root: Rc<SealedType>,
    object: Rc<SealedType>,
    builtins: HashMap<Builtin, Rc<SealedType>>,
    errors: IndexMap<ErrorKind, Rc<SealedType>>,
}

impl Prelude {
    pub fn new() -> Rc<Self> {
        let root = TypeBuilder::new("type", TypeKind::Root).sealed().build_chain();
        let object = TypeBuilder::new("object", TypeKind::Object)
            .attr("__init__", NativeFn::value("__init__", object_init))
            .doc(Some(Rc::from("The most base type")))
            .sealed()
            .build_chain();

        let mut builtins = HashMap::new();
        for (builtin, name) in BUILTIN_NAMES {
            let ty = TypeBuilder::new(name, TypeKind::Builtin(*builtin))
                .base(&object)
                .attrs(methods::for_builtin(*builtin))
                .attrs(extra_attrs(*builtin))
                .sealed()
                .build_chain();
            builtins.insert(*builtin, ty);
        }
        // bool derives from int.
        let bool_type = TypeBuilder::new("bool", TypeKind::Builtin(Builtin::Bool))
            .base(&builtins[&Builtin::Int])
            .sealed()
            .build_chain();
        builtins.insert(Builtin::Bool, bool_type);

        let mut errors: IndexMap<ErrorKind, Rc<SealedType>> = IndexMap::new();
        for kind in ErrorKind::ALL {
            let base = match kind.parent() {
                Some(parent) => errors[&parent].clone(),
                None => object.clone(),
            };
            let mut builder = TypeBuilder::new(kind.name(), TypeKind::Error(*kind)).base(&base);
            if *kind == ErrorKind::Exception {
                builder = builder
                    .attr("__init__", NativeFn::value("__init__", exception_init))
                    .doc(Some(Rc::from("Common base class for all exceptions")));
            }
            errors.insert(*kind, builder.sealed().build_chain());
        }

        Rc::new(Self {
            root,
            object,
            builtins,
            errors,
        })
    }

    /// The metatype. Kernel code only; guest code never receives it.
    pub fn root(&self) -> &Rc<SealedType> {
        &self.root
    }

    pub fn object(&self) -> &Rc<SealedType> {
        &self.object
    }

    pub fn builtin(&self, builtin: Builtin) -> &Rc<SealedType> {
        &self.builtins[&builtin]
    }

    pub fn error_type(&self, kind: ErrorKind) -> &Rc<SealedType> {
        &self.errors[&kind]
    }

    pub fn error_types(&self) -> impl Iterator<Item = (ErrorKind, &Rc<SealedType>)> {
        self.errors.iter().map(|(k, t)| (*k, t))
    }

    /// Guest-visible name of a built-in type, as bound in the built-in set.
    pub fn builtin_types(&self) -> Vec<(&'static str, Rc<SealedType>)> {
        let mut out = vec![("object", self.object.clone())];
        for (builtin, name) in [
            (Builtin::Int, "int"),
            (Builtin::Float, "float"),
            (Builtin::Bool, "bool"),
            (Builtin::Str, "str"),
            (Builtin::Bytes, "bytes"),
            (Builtin::List, "list"),
            (Builtin::Tuple, "tuple"),
            (Builtin::Dict, "dict"),
            (Builtin::Dict, "Dict"),
            (Builtin::Property, "property"),
            (Builtin::ClassMethod, "classmethod"),
            (Builtin::StaticMethod, "staticmethod"),
            (Builtin::LockedObject, "Object"),
        ] {
            out.push((name, self.builtin(builtin).clone()));
        }
        out
    }
}

fn extra_attrs(builtin: Builtin) -> IndexMap<String, Value> {
    let mut attrs = IndexMap::new();
    match builtin {
        Builtin::LockedObject => {
            attrs.insert(
                "__init__".to_string(),
                NativeFn::value("__init__", locked_object_init),
            );
            attrs.insert(
                "lock".to_string(),
                NativeFn::documented(
                    "lock",
                    "Permanently lock the object and everything it holds.",
                    locked_object_lock,
                ),
            );
        }
        Builtin::SignedClass => {
            attrs.insert("public_key".to_string(), Value::None);
            attrs.insert(
                "verify".to_string(),
                Value::Descriptor(Rc::new(Descriptor::ClassMethod(NativeFn::documented(
                    "verify",
                    "Check whether another class carries a valid identity token.",
                    signed_verify,
                )))),
            );
        }
        _ => {}
    }
    attrs
}

fn object_init(_: &Interpreter, args: Args) -> EvalResult<Value> {
    if args.positional.len() > 1 || !args.keywords.is_empty() {
        return Err(type_error("object() takes no arguments"));
    }
    Ok(Value::None)
}

fn locked_object_init(_: &Interpreter, args: Args) -> EvalResult<Value> {
    let [receiver] = args.positional.as_slice() else {
        return Err(type_error("Object() takes keyword arguments only"));
    };
    let Value::Object(obj) = receiver else {
        return Err(type_error("Object.__init__ requires an Object"));
    };
    for (name, value) in args.keywords {
        obj.store_overflow(&name, value)?;
    }
    Ok(Value::None)
}

fn locked_object_lock(_: &Interpreter, args: Args) -> EvalResult<Value> {
    let receiver = args.exact("lock", 1, 1)?;
    let Value::Object(obj) = &receiver[0] else {
        return Err(type_error("lock() requires an Object"));
    };
    obj.freeze();
    Ok(receiver[0].clone())
}

fn exception_init(_: &Interpreter, args: Args) -> EvalResult<Value> {
    if !args.keywords.is_empty() {
        return Err(type_error("exceptions take no keyword arguments"));
    }
    let Some((Value::Object(obj), rest)) = args.positional.split_first() else {
        return Err(type_error("Exception.__init__ requires an exception"));
    };
    if let Some(state) = obj.exception_state() {
        *state.args.borrow_mut() = rest.to_vec();
    }
    Ok(Value::None)
}

fn signed_verify(_: &Interpreter, args: Args) -> EvalResult<Value> {
    let parts = args.exact("verify", 2, 2)?;
    let Value::Type(cls) = &parts[0] else {
        return Ok(Value::Bool(false));
    };
    let Value::Type(other) = &parts[1] else {
        return Ok(Value::Bool(false));
    };
    let key = match cls.lookup("public_key") {
        Some(Value::Str(s)) => s.as_bytes().to_vec(),
        Some(Value::Bytes(b)) => b.to_vec(),
        _ => return Ok(Value::Bool(false)),
    };
    let Some(Value::Str(token)) = other.lookup("__verifier__") else {
        return Ok(Value::Bool(false));
    };
    let ok = signed::verify(&token, &key, other.identity());
    tracing::debug!(class = %other.name(), ok, "signed class verification");
    Ok(Value::Bool(ok))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_types_mirror_the_kind_hierarchy() {
        let prelude = Prelude::new();
        let lookup = prelude.error_type(ErrorKind::KeyError);
        assert!(lookup.is_subtype_of(prelude.error_type(ErrorKind::LookupError)));
        assert!(lookup.is_subtype_of(prelude.error_type(ErrorKind::Exception)));
        assert_eq!(lookup.error_kind(), Some(ErrorKind::KeyError));
        assert!(lookup.is_metalocked());
    }

    #[test]
    fn test_bool_is_an_int() {
        let prelude = Prelude::new();
        let b = prelude.builtin(Builtin::Bool);
        assert!(b.is_subtype_of(prelude.builtin(Builtin::Int)));
        assert!(b.is_subtype_of(prelude.object()));
        assert!(!prelude.root().is_subtype_of(prelude.object()));
    }
}
