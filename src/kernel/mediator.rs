//! Reflection mediator.
//!
//! Every attribute step guest code performs lands here, whether it came
//! from attribute syntax, from the guarded `getattr`/`setattr`/`delattr`
//! built-ins, or from a replacement field in a format template. The raw
//! object model answers the lookup; the mediator decides whether the
//! answer may be handed out.

use std::rc::Rc;

use super::format;
use super::sealer;
use super::store::{LockedMapping, MapKey};
use super::types::TypeKind;
use super::value::{Args, BoundMethod, NativeFn, Value};
use crate::error::ErrorKind;
use crate::interp::{EvalResult, Interpreter, attribute_error, forbidden, type_error};

/// Names refused in every position, at run time as well as by the rewriter.
pub const ALWAYS_FORBIDDEN: &[&str] = &["__code__", "gi_code", "f_code", "ag_code", "__class__"];

/// Mediated attribute read. With a `binder` the lookup is performed the
/// way `binder.__getattribute__(obj, name)` would.
pub fn getattr(
    interp: &Interpreter,
    obj: &Value,
    name: &str,
    binder: Option<&Value>,
) -> EvalResult<Value> {
    resolve(interp, obj, name, binder)?.ok_or_else(|| missing(obj, name))
}

/// Mediated lookup; `Ok(None)` when the attribute does not exist.
pub fn lookup(interp: &Interpreter, obj: &Value, name: &str) -> EvalResult<Option<Value>> {
    resolve(interp, obj, name, None)
}

pub fn setattr(interp: &Interpreter, obj: &Value, name: &str, value: Value) -> EvalResult<()> {
    refuse_name(name)?;
    if let Value::Code(_) = value {
        return Err(forbidden("code objects cannot be assigned"));
    }
    interp.set_attr(obj, name, value)
}

pub fn delattr(interp: &Interpreter, obj: &Value, name: &str) -> EvalResult<()> {
    refuse_name(name)?;
    interp.del_attr(obj, name)
}

/// Reject values that would hand guest code a live scope, a code object,
/// a closure cell or the root type.
pub fn screen(value: Value) -> EvalResult<Value> {
    let refused = match &value {
        Value::Type(t) => t.kind() == TypeKind::Root,
        Value::Scope(_) | Value::Code(_) | Value::Cell(_) => true,
        Value::List(items) => matches!(items.borrow().first(), Some(Value::Cell(_))),
        Value::Tuple(items) => matches!(items.first(), Some(Value::Cell(_))),
        _ => false,
    };
    if refused {
        return Err(forbidden(format!(
            "access to a {} value is not allowed",
            value.type_name()
        )));
    }
    Ok(value)
}

fn refuse_name(name: &str) -> EvalResult<()> {
    if ALWAYS_FORBIDDEN.contains(&name) {
        return Err(forbidden(format!("attribute '{name}' is not accessible")));
    }
    Ok(())
}

fn missing(obj: &Value, name: &str) -> Box<crate::interp::GuestError> {
    attribute_error(match obj {
        Value::Type(t) => format!("type object '{}' has no attribute '{name}'", t.name()),
        _ => format!("'{}' object has no attribute '{name}'", obj.type_name()),
    })
}

fn resolve(
    interp: &Interpreter,
    obj: &Value,
    name: &str,
    binder: Option<&Value>,
) -> EvalResult<Option<Value>> {
    refuse_name(name)?;
    // Redirected accessors act on the real receiver, not on a super proxy.
    let receiver = match obj {
        Value::Super(s) => s.receiver.clone(),
        other => other.clone(),
    };
    match name {
        "__subclasses__" => {
            return Ok(Some(sealer::capability(
                NativeFn::value("__subclasses__", |_, args| {
                    args.exact("__subclasses__", 0, 0)?;
                    Ok(Value::list(Vec::new()))
                }),
                "",
                None,
            )));
        }
        "__getattribute__" => return Ok(Some(BoundMethod::value(receiver, guarded_getattr()))),
        "__setattr__" => return Ok(Some(BoundMethod::value(receiver, guarded_setattr()))),
        "__delattr__" => return Ok(Some(BoundMethod::value(receiver, guarded_delattr()))),
        _ => {}
    }
    if let Some(Value::Type(t)) = binder
        && !interp.isinstance(obj, t)
    {
        return Err(type_error(format!(
            "descriptor '__getattribute__' requires a '{}' object but received a '{}'",
            t.name(),
            obj.type_name()
        )));
    }
    match interp.lookup_attr(obj, name)? {
        Some(v) => screen(v).map(Some),
        None => Ok(None),
    }
}

fn guarded_getattr() -> Value {
    sealer::capability(
        NativeFn::value("getattr", |interp, args| {
            let slots = args.parse("getattr", &["obj", "name", "default", "binder"], 2)?;
            let (Some(obj), Some(name)) = (&slots[0], &slots[1]) else {
                return Err(type_error("getattr() missing required argument"));
            };
            let name = name.as_str().ok_or_else(|| {
                type_error(format!(
                    "attribute name must be string, not '{}'",
                    name.type_name()
                ))
            })?;
            let binder = slots[3].as_ref().filter(|b| !b.is_none());
            match (resolve(interp, obj, name, binder), &slots[2]) {
                (Ok(Some(v)), _) => Ok(v),
                (Ok(None), Some(default)) => Ok(default.clone()),
                (Ok(None), None) => Err(missing(obj, name)),
                (Err(e), Some(default)) if e.is_a(ErrorKind::AttributeError) => Ok(default.clone()),
                (Err(e), _) => Err(e),
            }
        }),
        "obj, name, default=..., binder=None",
        Some("Read an attribute through the reflection mediator."),
    )
}

fn guarded_setattr() -> Value {
    sealer::capability(
        NativeFn::value("setattr", |interp, args| {
            let parts = args.exact("setattr", 3, 3)?;
            let name = name_arg(&parts[1])?;
            setattr(interp, &parts[0], name, parts[2].clone())?;
            Ok(Value::None)
        }),
        "obj, name, value",
        Some("Write an attribute through the reflection mediator."),
    )
}

fn guarded_delattr() -> Value {
    sealer::capability(
        NativeFn::value("delattr", |interp, args| {
            let parts = args.exact("delattr", 2, 2)?;
            let name = name_arg(&parts[1])?;
            delattr(interp, &parts[0], name)?;
            Ok(Value::None)
        }),
        "obj, name",
        Some("Delete an attribute through the reflection mediator."),
    )
}

fn name_arg(v: &Value) -> EvalResult<&str> {
    v.as_str().ok_or_else(|| {
        type_error(format!(
            "attribute name must be string, not '{}'",
            v.type_name()
        ))
    })
}

/// `s.format(*args, **kw)`. A receiver that is not a string keeps its own
/// `format` method, looked up through the mediator.
fn safe_format_capability() -> Value {
    sealer::capability(
        NativeFn::value("safe_format", |interp, args| {
            let Args {
                positional,
                keywords,
            } = args;
            let Some((receiver, rest)) = positional.split_first() else {
                return Err(type_error("safe_format() missing required argument: 's'"));
            };
            let Value::Str(template) = receiver else {
                let method = getattr(interp, receiver, "format", None)?;
                return interp.call(
                    &method,
                    Args {
                        positional: rest.to_vec(),
                        keywords,
                    },
                );
            };
            let named = LockedMapping::from_pairs(
                keywords
                    .into_iter()
                    .map(|(k, v)| (MapKey::str(&k), v)),
            );
            let named = Value::Mapping(Rc::new(named));
            Ok(Value::from(format::safe_format(
                interp,
                template,
                rest,
                Some(&named),
            )?))
        }),
        "s, *args, **kwargs",
        Some("str.format with every attribute step mediated."),
    )
}

fn safe_format_map_capability() -> Value {
    sealer::capability(
        NativeFn::value("safe_format_map", |interp, args| {
            let parts = args.exact("safe_format_map", 2, 2)?;
            match &parts[0] {
                Value::Str(template) => Ok(Value::from(format::safe_format(
                    interp,
                    template,
                    &[],
                    Some(&parts[1]),
                )?)),
                other => {
                    let method = getattr(interp, other, "format_map", None)?;
                    interp.call(&method, Args::new(vec![parts[1].clone()]))
                }
            }
        }),
        "s, mapping",
        Some("str.format_map with every attribute step mediated."),
    )
}

/// The guarded reflective built-ins, each sealed as a capability.
pub fn guarded_builtins() -> Vec<(&'static str, Value)> {
    vec![
        ("getattr", guarded_getattr()),
        ("setattr", guarded_setattr()),
        ("delattr", guarded_delattr()),
        ("safe_format", safe_format_capability()),
        ("safe_format_map", safe_format_map_capability()),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interp::builtins::install_for_tests;
    use crate::interp::testing::{interpreter, output};
    use crate::kernel::scope::Scope;

    fn run(src: &str) -> Result<String, String> {
        let (interp, buf) = interpreter();
        let scope = Scope::with_builtins(Rc::new(LockedMapping::new()));
        install_for_tests(&interp, &scope);
        interp
            .run_source(src, &scope, "<test>", false)
            .map(|_| output(&buf))
            .map_err(|e| e.to_string())
    }

    fn trusted_function(interp: &Interpreter) -> Value {
        let scope = Scope::new();
        interp
            .run_trusted(
                "def outer():\n    x = 1\n    def inner():\n        return x\n    return inner\nf = outer()\n",
                &scope,
                "<t>",
            )
            .unwrap();
        scope.get("f").unwrap()
    }

    #[test]
    fn test_internal_values_are_never_returned() {
        let (interp, _) = interpreter();
        let f = trusted_function(&interp);
        for name in ["__globals__", "__closure__", "__code__", "__class__"] {
            let err = getattr(&interp, &f, name, None).unwrap_err();
            assert_eq!(err.type_name(), "ForbiddenAccessError", "{name}");
        }
        assert_eq!(
            getattr(&interp, &f, "__name__", None).unwrap().as_str(),
            Some("inner")
        );
    }

    #[test]
    fn test_screen_rejects_cell_lists() {
        let (interp, _) = interpreter();
        let f = trusted_function(&interp);
        let cells = interp.get_attr(&f, "__closure__").unwrap();
        let Value::Tuple(cells) = cells else {
            panic!("expected closure cells")
        };
        let smuggled = Value::list(vec![cells[0].clone(), Value::Int(1)]);
        assert!(screen(smuggled).is_err());
        assert!(screen(Value::list(vec![Value::Int(1), cells[0].clone()])).is_ok());
        let root = Value::Type(interp.prelude().root().clone());
        assert!(screen(root).is_err());
    }

    #[test]
    fn test_subclasses_is_always_empty() {
        let out = run("class A:\n    pass\nclass B(A):\n    pass\nprint(getattr(A, '__subclasses__')())\n")
            .unwrap();
        assert_eq!(out, "[]\n");
    }

    #[test]
    fn test_guarded_accessors() {
        let out = run(
            "class P:\n    pass\np = P()\nsetattr(p, 'x', 1)\nprint(getattr(p, 'x'), getattr(p, 'y', 'dflt'))\n\
             g = getattr(p, '__getattribute__')\nprint(g('x'))\ndelattr(p, 'x')\nprint(hasattr(p, 'x'))\n",
        )
        .unwrap();
        assert_eq!(out, "1 dflt\n1\nFalse\n");
    }

    #[test]
    fn test_binder_must_match_receiver() {
        let err = run("class A:\n    pass\nclass B:\n    pass\ngetattr(B(), 'x', binder=A)\n").unwrap_err();
        assert!(err.starts_with("TypeError"), "{err}");
    }

    #[test]
    fn test_capabilities_hide_their_target() {
        let out = run("print(getattr, getattr.__doc__)\nprint(hasattr(getattr, 'target'))\n").unwrap();
        assert_eq!(
            out,
            "function(obj, name, default=..., binder=None) Read an attribute through the reflection mediator.\nFalse\n"
        );
    }

    #[test]
    fn test_setattr_refuses_forbidden_names() {
        let err = run("class P:\n    pass\nsetattr(P(), '__class__', P)\n").unwrap_err();
        assert!(err.starts_with("ForbiddenAccessError"), "{err}");
    }

    #[test]
    fn test_safe_format_capability() {
        let out = run("print(safe_format('{0}+{k}', 1, k=2), safe_format_map('{a}', {'a': 3}))\n").unwrap();
        assert_eq!(out, "1+2 3\n");
    }
}
