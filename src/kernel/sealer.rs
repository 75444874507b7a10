//! API sealer.
//!
//! A sealed capability forwards calls to a target it never exposes. The
//! only attributes guest code can read from one are `__doc__` and
//! `__signature__`.

use std::rc::Rc;

use super::scope::Scope;
use super::store::{LockedMapping, LockedObject};
use super::types::Builtin;
use super::value::{Args, NativeFn, SealedCapability, Value};
use crate::interp::{EvalResult, Interpreter, type_error};
use crate::script;

/// Wrap `target` into an opaque capability.
pub fn capability(target: Value, signature: &str, doc: Option<&str>) -> Value {
    Value::Capability(Rc::new(SealedCapability {
        target,
        signature: Rc::from(signature),
        doc: doc.map(Rc::from),
    }))
}

/// A host function sealed as a capability.
pub fn native(
    name: &str,
    signature: &str,
    doc: Option<&str>,
    func: impl Fn(&Interpreter, Args) -> EvalResult<Value> + 'static,
) -> Value {
    capability(NativeFn::value(name, func), signature, doc)
}

/// Compile `wrapper` as the body of a throwaway function whose parameters
/// are the names in `bound`, call it once with the bound values, and seal
/// whatever it binds to `entry`.
///
/// ```text
/// def _(k1, k2, ...):
///     <wrapper>
///     return <entry>
/// ```
///
/// The throwaway scope has an empty built-in set. Only trusted callers pass
/// wrapper text; a malformed wrapper surfaces as a `SyntaxError`.
pub fn seal(
    interp: &Interpreter,
    wrapper: &str,
    bound: &[(&str, Value)],
    entry: &str,
) -> EvalResult<Value> {
    let params: Vec<&str> = bound.iter().map(|(k, _)| *k).collect();
    let mut src = format!("def _({}):\n", params.join(", "));
    for line in wrapper.lines() {
        src.push_str("    ");
        src.push_str(line);
        src.push('\n');
    }
    src.push_str(&format!("    return {entry}\n"));

    let stmts = script::parse_module(&src)?;
    let scope = Scope::with_builtins(Rc::new(LockedMapping::labelled("builtins")));
    scope.lock();
    interp.run_module(&stmts, &scope, "<sealed>", false)?;
    let Some(factory) = scope.get("_") else {
        return Err(type_error("sealed wrapper did not compile to a function"));
    };
    let values = bound.iter().map(|(_, v)| v.clone()).collect();
    let target = interp.call(&factory, Args::new(values))?;
    seal_function(interp, &target)
}

/// Seal an existing callable, keeping its signature and docstring.
pub fn seal_function(interp: &Interpreter, value: &Value) -> EvalResult<Value> {
    let (signature, doc) = match value {
        Value::Capability(_) => return Ok(value.clone()),
        Value::Function(f) => (f.signature(), f.def.doc.clone()),
        Value::Native(n) => ("*args, **kwargs".to_string(), n.doc.clone()),
        Value::Bound(b) => match &b.func {
            Value::Function(f) => {
                let sig = f.def.params.args.iter().skip(1).map(|p| match p.default {
                    Some(_) => format!("{}=...", p.name),
                    None => p.name.clone(),
                });
                (sig.collect::<Vec<_>>().join(", "), f.def.doc.clone())
            }
            _ => ("*args, **kwargs".to_string(), None),
        },
        other => {
            return Err(type_error(format!(
                "fn() argument must be a function, not '{}'",
                interp.type_of(other).name()
            )));
        }
    };
    Ok(Value::Capability(Rc::new(SealedCapability {
        target: value.clone(),
        signature: Rc::from(signature),
        doc,
    })))
}

/// Mapping operations an interface projection exposes.
const INTERFACE_METHODS: &[&str] = &[
    "clear", "copy", "get", "items", "keys", "pop", "popitem", "setdefault", "update", "values",
];

/// Project a mapping into a fresh object whose attributes are capabilities
/// over that one mapping. The object itself is returned unlocked.
pub fn make_interface(interp: &Interpreter, mapping: &Rc<LockedMapping>) -> EvalResult<Rc<LockedObject>> {
    let class = interp.prelude().builtin(Builtin::LockedObject).clone();
    let iface = LockedObject::new(class);
    let target = Value::Mapping(mapping.clone());

    for name in INTERFACE_METHODS {
        let method = interp.get_attr(&target, name)?;
        iface.store_overflow(name, seal_function(interp, &method)?)?;
    }

    let m = target.clone();
    iface.store_overflow(
        "__contains__",
        native("__contains__", "key", None, move |interp, a| {
            let parts = a.exact("__contains__", 1, 1)?;
            Ok(Value::Bool(interp.contains(&m, &parts[0])?))
        }),
    )?;
    let m = target.clone();
    iface.store_overflow(
        "__getitem__",
        native("__getitem__", "key", None, move |interp, a| {
            let parts = a.exact("__getitem__", 1, 1)?;
            interp.get_item(&m, &parts[0])
        }),
    )?;
    let m = target.clone();
    iface.store_overflow(
        "__setitem__",
        native("__setitem__", "key, value", None, move |interp, a| {
            let parts = a.exact("__setitem__", 2, 2)?;
            interp.set_item(&m, parts[0].clone(), parts[1].clone())?;
            Ok(Value::None)
        }),
    )?;
    let m = target.clone();
    iface.store_overflow(
        "__delitem__",
        native("__delitem__", "key", None, move |interp, a| {
            let parts = a.exact("__delitem__", 1, 1)?;
            interp.del_item(&m, &parts[0])?;
            Ok(Value::None)
        }),
    )?;
    let m = target.clone();
    iface.store_overflow(
        "iter",
        native("iter", "", None, move |interp, a| {
            a.exact("iter", 0, 0)?;
            Ok(Value::list(interp.iterate(&m)?))
        }),
    )?;
    let m = target;
    iface.store_overflow(
        "len",
        native("len", "", None, move |interp, a| {
            a.exact("len", 0, 0)?;
            Ok(Value::Int(interp.len(&m)? as i64))
        }),
    )?;
    Ok(Rc::new(iface))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interp::builtins::install_for_tests;
    use crate::interp::testing::{interpreter, output};
    use crate::kernel::store::MapKey;

    #[test]
    fn test_seal_binds_values_and_hides_them() {
        let (interp, buf) = interpreter();
        let state = Rc::new(LockedMapping::from_pairs([(MapKey::str("n"), Value::Int(41))]));
        let incr = seal(
            &interp,
            "def fn():\n    state['n'] = state['n'] + 1\n    return state['n']",
            &[("state", Value::Mapping(state.clone()))],
            "fn",
        )
        .unwrap();

        let scope = Scope::with_builtins(Rc::new(LockedMapping::new()));
        install_for_tests(&interp, &scope);
        scope.set("incr", incr);
        interp
            .run_source(
                "print(incr(), incr)\nprint(dir(incr))\n\
                 for name in ['state', '__closure__', '__globals__', '__func__', '__self__', '__wrapped__']:\n    print(hasattr(incr, name))\n",
                &scope,
                "<t>",
                false,
            )
            .unwrap();
        assert_eq!(
            output(&buf),
            "42 function()\n['__doc__', '__signature__']\nFalse\nFalse\nFalse\nFalse\nFalse\nFalse\n"
        );
        assert_eq!(state.get_str("n").unwrap().as_int(), Some(42));
    }

    #[test]
    fn test_seal_reports_syntax_errors() {
        let (interp, _) = interpreter();
        let err = seal(&interp, "fn = lambda: (", &[], "fn").unwrap_err();
        assert_eq!(err.type_name(), "SyntaxError");
    }

    #[test]
    fn test_wrapper_has_no_builtins() {
        let (interp, _) = interpreter();
        let cap = seal(&interp, "fn = lambda: len([])", &[], "fn").unwrap();
        let err = interp.call(&cap, Args::default()).unwrap_err();
        assert_eq!(err.type_name(), "NameError");
    }

    #[test]
    fn test_interface_projects_one_mapping() {
        let (interp, buf) = interpreter();
        let backing = Rc::new(LockedMapping::new());
        let iface = make_interface(&interp, &backing).unwrap();
        iface.freeze();

        let scope = Scope::with_builtins(Rc::new(LockedMapping::new()));
        install_for_tests(&interp, &scope);
        scope.set("m", Value::Object(iface));
        interp
            .run_source(
                "m.__setitem__('a', 1)\nm.update({'b': 2})\nprint(m.len(), m.get('a'), m.__contains__('b'), m.iter())\n\
                 print(m.setdefault('c', 3), sorted(m.keys()), m.pop('a'))\n",
                &scope,
                "<t>",
                false,
            )
            .unwrap();
        assert_eq!(output(&buf), "2 1 True ['a', 'b']\n3 ['a', 'b', 'c'] 1\n");
        assert_eq!(backing.len(), 2);
    }
}
