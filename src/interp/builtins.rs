//! The host's default built-in set.
//!
//! This is the unfiltered set a trusted embedding would hand to its own
//! code: it still contains the raw primitives (`open`, `exec`, `eval`,
//! `compile`, `globals`, `type`, `__import__`) and the raw reflective
//! accessors. Guest scopes never see it directly; the scope manager copies
//! it, strips the dangerous entries and installs sealed replacements.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::rc::Rc;

use indexmap::IndexMap;

use super::{EvalResult, Interpreter, Prelude, error, forbidden, type_error, value_error};
use crate::error::ErrorKind;
use crate::kernel::store::{LockedMapping, LockedObject, MapKey, freeze_value};
use crate::kernel::types::Builtin;
use crate::kernel::value::{Args, CodeObject, Descriptor, NativeFn, Value};
use crate::kernel::{format, sealer};
use crate::script::ast::{BinOp, FunctionDef, Params};
use crate::script;

/// Names of the raw primitives the scope manager must never pass through.
pub const RAW_PRIMITIVES: &[&str] = &[
    "__import__",
    "__loader__",
    "__spec__",
    "open",
    "exec",
    "eval",
    "globals",
    "type",
    "compile",
];

type Table = IndexMap<String, Value>;

fn def(
    table: &mut Table,
    name: &str,
    f: impl Fn(&Interpreter, Args) -> EvalResult<Value> + 'static,
) {
    table.insert(name.to_string(), NativeFn::value(name, f));
}

/// Build the unfiltered built-in set.
pub fn host_builtins(prelude: &Prelude) -> LockedMapping {
    let mut t = Table::new();
    raw_primitives(&mut t);
    core_functions(&mut t);
    numeric_functions(&mut t);
    sequence_functions(&mut t);
    reflection_functions(&mut t);
    store_functions(&mut t);
    for (name, ty) in prelude.builtin_types() {
        t.insert(name.to_string(), Value::Type(ty));
    }
    for (kind, ty) in prelude.error_types() {
        t.insert(kind.name().to_string(), Value::Type(ty.clone()));
    }
    let table = LockedMapping::labelled("builtins");
    for (k, v) in t {
        // A fresh mapping is never locked.
        let _ = table.insert_str(&k, v);
    }
    table
}

fn raw_primitives(t: &mut Table) {
    def(t, "open", |interp, a| {
        let slots = a.parse("open", &["file", "mode"], 1)?;
        let Some(Value::Str(path)) = &slots[0] else {
            return Err(type_error("open() path must be str"));
        };
        let text = std::fs::read_to_string(&**path)
            .map_err(|e| error(ErrorKind::Exception, format!("cannot open {path}: {e}")))?;
        let handle = LockedObject::new(interp.prelude().builtin(Builtin::LockedObject).clone());
        handle.store_overflow("name", Value::Str(path.clone()))?;
        handle.store_overflow(
            "read",
            NativeFn::value("read", move |_, _| Ok(Value::str(&text))),
        )?;
        Ok(Value::Object(Rc::new(handle)))
    });
    def(t, "compile", |_, a| {
        let slots = a.parse("compile", &["source", "filename", "mode"], 1)?;
        let Some(Value::Str(src)) = &slots[0] else {
            return Err(type_error("compile() source must be str"));
        };
        let file = match &slots[1] {
            Some(Value::Str(f)) => f.clone(),
            _ => Rc::from("<string>"),
        };
        let body = script::parse_module(src)?;
        let def = FunctionDef {
            name: "<module>".to_string(),
            params: Params {
                args: Vec::new(),
                vararg: None,
                kwonly: Vec::new(),
                kwarg: None,
            },
            body,
            decorators: Vec::new(),
            line: 1,
            doc: None,
        };
        Ok(Value::Code(Rc::new(CodeObject {
            def: Rc::new(def),
            file,
        })))
    });
    def(t, "exec", |interp, a| {
        let slots = a.parse("exec", &["source", "globals", "locals"], 1)?;
        let scope = raw_target_scope(interp, &slots[1])?;
        match &slots[0] {
            Some(Value::Str(src)) => interp.exec_source(src, &scope, None, false)?,
            Some(Value::Code(code)) => {
                interp.run_module(&code.def.body, &scope, &code.file, false)?;
            }
            _ => return Err(type_error("exec() arg 1 must be a string or code object")),
        }
        Ok(Value::None)
    });
    def(t, "eval", |interp, a| {
        let slots = a.parse("eval", &["source", "globals", "locals"], 1)?;
        let scope = raw_target_scope(interp, &slots[1])?;
        let Some(Value::Str(src)) = &slots[0] else {
            return Err(type_error("eval() arg 1 must be a string"));
        };
        interp.eval_source(src, &scope, None, false)
    });
    def(t, "globals", |interp, a| {
        a.exact("globals", 0, 0)?;
        interp
            .current_scope()
            .map(Value::Scope)
            .ok_or_else(|| forbidden("no running scope"))
    });
    def(t, "type", |interp, a| {
        let parts = a.exact("type", 1, 3)?;
        match parts {
            [v] => Ok(Value::Type(interp.type_of(v))),
            [name, bases, attrs] => build_class(interp, name, bases, attrs),
            _ => Err(type_error("type() takes 1 or 3 arguments")),
        }
    });
    def(t, "__import__", |_, _| {
        Err(error(
            ErrorKind::ImportError,
            "no import machinery is installed in this scope",
        ))
    });
}

fn raw_target_scope(
    interp: &Interpreter,
    globals: &Option<Value>,
) -> EvalResult<Rc<crate::kernel::scope::Scope>> {
    match globals {
        Some(Value::Scope(s)) => Ok(s.clone()),
        None | Some(Value::None) => interp
            .current_scope()
            .ok_or_else(|| forbidden("no running scope")),
        Some(other) => Err(type_error(format!(
            "globals must be a scope, not {}",
            other.type_name()
        ))),
    }
}

/// Three-argument `type(name, bases, attrs)`.
pub(crate) fn build_class(
    interp: &Interpreter,
    name: &Value,
    bases: &Value,
    attrs: &Value,
) -> EvalResult<Value> {
    let Value::Str(name) = name else {
        return Err(type_error("type() argument 1 must be str"));
    };
    let Value::Tuple(bases) = bases else {
        return Err(type_error("type() argument 2 must be tuple"));
    };
    let Value::Mapping(attrs) = attrs else {
        return Err(type_error("type() argument 3 must be dict"));
    };
    let mut table = IndexMap::new();
    for (k, v) in attrs.items() {
        let Some(k) = k.as_str() else {
            return Err(type_error("type() attribute names must be str"));
        };
        table.insert(k.to_string(), v);
    }
    let doc = match table.get("__doc__") {
        Some(Value::Str(s)) => Some(s.clone()),
        _ => None,
    };
    let cls = interp.create_class(super::ClassSpec {
        name: name.to_string(),
        bases: bases.to_vec(),
        attrs: table,
        keywords: IndexMap::new(),
        doc,
    })?;
    Ok(Value::Type(cls))
}

fn core_functions(t: &mut Table) {
    def(t, "print", |interp, a| {
        let mut sep = " ".to_string();
        let mut end = "\n".to_string();
        for (k, v) in &a.keywords {
            let text = match v {
                Value::None => continue,
                Value::Str(s) => s.to_string(),
                other => {
                    return Err(type_error(format!(
                        "{k} must be None or a string, not {}",
                        other.type_name()
                    )));
                }
            };
            match k.as_str() {
                "sep" => sep = text,
                "end" => end = text,
                _ => {
                    return Err(type_error(format!(
                        "print() got an unexpected keyword argument '{k}'"
                    )));
                }
            }
        }
        let parts = a
            .positional
            .iter()
            .map(|v| interp.to_str(v))
            .collect::<EvalResult<Vec<_>>>()?;
        interp.write(&format!("{}{end}", parts.join(&sep)));
        Ok(Value::None)
    });
    def(t, "len", |interp, a| {
        let parts = a.exact("len", 1, 1)?;
        Ok(Value::Int(interp.len(&parts[0])? as i64))
    });
    def(t, "repr", |interp, a| {
        let parts = a.exact("repr", 1, 1)?;
        Ok(Value::from(interp.repr(&parts[0])?))
    });
    def(t, "format", |interp, a| {
        let parts = a.exact("format", 1, 2)?;
        let spec = match parts.get(1) {
            Some(Value::Str(s)) => s.to_string(),
            Some(other) => {
                return Err(type_error(format!(
                    "format() argument 2 must be str, not {}",
                    other.type_name()
                )));
            }
            None => String::new(),
        };
        Ok(Value::from(format::format_value(interp, &parts[0], &spec)?))
    });
    def(t, "chr", |_, a| {
        let parts = a.exact("chr", 1, 1)?;
        let code = parts[0]
            .as_int()
            .ok_or_else(|| type_error("an integer is required"))?;
        u32::try_from(code)
            .ok()
            .and_then(char::from_u32)
            .map(|c| Value::from(c.to_string()))
            .ok_or_else(|| value_error("chr() arg not in range"))
    });
    def(t, "ord", |_, a| {
        let parts = a.exact("ord", 1, 1)?;
        let Value::Str(s) = &parts[0] else {
            return Err(type_error("ord() expected string of length 1"));
        };
        let mut chars = s.chars();
        match (chars.next(), chars.next()) {
            (Some(c), None) => Ok(Value::Int(c as i64)),
            _ => Err(type_error("ord() expected a character")),
        }
    });
    def(t, "hash", |interp, a| {
        let parts = a.exact("hash", 1, 1)?;
        let key = interp.map_key(&parts[0])?;
        let mut h = DefaultHasher::new();
        key.hash(&mut h);
        Ok(Value::Int(h.finish() as i64))
    });
    def(t, "id", |_, a| {
        let parts = a.exact("id", 1, 1)?;
        Ok(Value::Int(parts[0].identity() as i64))
    });
}

fn int_arg(v: &Value, fname: &str) -> EvalResult<i64> {
    v.as_int().ok_or_else(|| {
        type_error(format!(
            "{fname}() argument must be an integer, not {}",
            v.type_name()
        ))
    })
}

fn radix(t: &mut Table, name: &'static str, prefix: &'static str) {
    def(t, name, move |_, a| {
        let parts = a.exact(name, 1, 1)?;
        let i = int_arg(&parts[0], name)?;
        let sign = if i < 0 { "-" } else { "" };
        let n = i.unsigned_abs();
        let digits = match prefix {
            "0x" => format!("{n:x}"),
            "0o" => format!("{n:o}"),
            _ => format!("{n:b}"),
        };
        Ok(Value::from(format!("{sign}{prefix}{digits}")))
    });
}

fn numeric_functions(t: &mut Table) {
    radix(t, "hex", "0x");
    radix(t, "oct", "0o");
    radix(t, "bin", "0b");
    def(t, "abs", |_, a| {
        let parts = a.exact("abs", 1, 1)?;
        match &parts[0] {
            Value::Int(i) => i
                .checked_abs()
                .map(Value::Int)
                .ok_or_else(|| error(ErrorKind::OverflowError, "integer overflow")),
            Value::Bool(b) => Ok(Value::Int(*b as i64)),
            Value::Float(f) => Ok(Value::Float(f.abs())),
            other => Err(type_error(format!(
                "bad operand type for abs(): '{}'",
                other.type_name()
            ))),
        }
    });
    def(t, "round", |_, a| {
        let slots = a.parse("round", &["number", "ndigits"], 1)?;
        let digits = match &slots[1] {
            None | Some(Value::None) => None,
            Some(v) => Some(int_arg(v, "round")?),
        };
        match (&slots[0], digits) {
            (Some(Value::Int(i)), _) => Ok(Value::Int(*i)),
            (Some(Value::Bool(b)), _) => Ok(Value::Int(*b as i64)),
            (Some(Value::Float(f)), None) => {
                let r = f.round_ties_even();
                if !r.is_finite() || r.abs() >= i64::MAX as f64 {
                    return Err(error(ErrorKind::OverflowError, "cannot convert float to integer"));
                }
                Ok(Value::Int(r as i64))
            }
            (Some(Value::Float(f)), Some(n)) => {
                let scale = 10f64.powi(n.clamp(-300, 300) as i32);
                Ok(Value::Float((f * scale).round_ties_even() / scale))
            }
            (Some(other), _) => Err(type_error(format!(
                "type {} doesn't define __round__",
                other.type_name()
            ))),
            (None, _) => Err(type_error("round() missing required argument")),
        }
    });
    def(t, "divmod", |interp, a| {
        let parts = a.exact("divmod", 2, 2)?;
        let q = interp.binary(BinOp::FloorDiv, &parts[0], &parts[1])?;
        let r = interp.binary(BinOp::Mod, &parts[0], &parts[1])?;
        Ok(Value::tuple(vec![q, r]))
    });
    def(t, "pow", |interp, a| {
        let parts = a.exact("pow", 2, 3)?;
        let Some(modulus) = parts.get(2) else {
            return interp.binary(BinOp::Pow, &parts[0], &parts[1]);
        };
        let (base, exp, m) = (
            int_arg(&parts[0], "pow")?,
            int_arg(&parts[1], "pow")?,
            int_arg(modulus, "pow")?,
        );
        if m == 0 {
            return Err(value_error("pow() 3rd argument cannot be 0"));
        }
        if exp < 0 {
            return Err(value_error("pow() 2nd argument cannot be negative when 3rd argument specified"));
        }
        let m = m as i128;
        let (mut acc, mut b, mut e) = (1i128, (base as i128).rem_euclid(m), exp);
        while e > 0 {
            if e & 1 == 1 {
                acc = (acc * b).rem_euclid(m);
            }
            b = (b * b).rem_euclid(m);
            e >>= 1;
        }
        Ok(Value::Int(acc as i64))
    });
    def(t, "sum", |interp, a| {
        let parts = a.exact("sum", 1, 2)?;
        let mut total = parts.get(1).cloned().unwrap_or(Value::Int(0));
        if matches!(total, Value::Str(_)) {
            return Err(type_error("sum() can't sum strings"));
        }
        for item in interp.iterate(&parts[0])? {
            total = interp.binary(BinOp::Add, &total, &item)?;
        }
        Ok(total)
    });
    for which in ["min", "max"] {
        def(t, which, move |interp, a| extremum(interp, a, which));
    }
}

fn extremum(interp: &Interpreter, a: Args, which: &str) -> EvalResult<Value> {
    let mut key = None;
    let mut default = None;
    for (k, v) in &a.keywords {
        match k.as_str() {
            "key" if !v.is_none() => key = Some(v.clone()),
            "key" => {}
            "default" => default = Some(v.clone()),
            _ => {
                return Err(type_error(format!(
                    "{which}() got an unexpected keyword argument '{k}'"
                )));
            }
        }
    }
    let items = match a.positional.as_slice() {
        [] => return Err(type_error(format!("{which} expected at least 1 argument"))),
        [one] => interp.iterate(one)?,
        many => many.to_vec(),
    };
    let mut best: Option<(Value, Value)> = None;
    for item in items {
        let k = match &key {
            Some(f) => interp.call(f, Args::new(vec![item.clone()]))?,
            None => item.clone(),
        };
        let replace = match &best {
            None => true,
            Some((bk, _)) => {
                let ord = interp.order(&k, bk, if which == "min" { "<" } else { ">" })?;
                if which == "min" {
                    ord == std::cmp::Ordering::Less
                } else {
                    ord == std::cmp::Ordering::Greater
                }
            }
        };
        if replace {
            best = Some((k, item));
        }
    }
    match (best, default) {
        (Some((_, v)), _) => Ok(v),
        (None, Some(d)) => Ok(d),
        (None, None) => Err(value_error(format!("{which}() arg is an empty sequence"))),
    }
}

fn sequence_functions(t: &mut Table) {
    def(t, "range", |_, a| {
        let parts = a.exact("range", 1, 3)?;
        let ints = parts
            .iter()
            .map(|v| int_arg(v, "range"))
            .collect::<EvalResult<Vec<_>>>()?;
        let (start, stop, step) = match ints.as_slice() {
            [stop] => (0, *stop, 1),
            [start, stop] => (*start, *stop, 1),
            [start, stop, step, ..] => (*start, *stop, *step),
            [] => return Err(type_error("range expected at least 1 argument")),
        };
        if step == 0 {
            return Err(value_error("range() arg 3 must not be zero"));
        }
        let mut out = Vec::new();
        let mut i = start;
        while (step > 0 && i < stop) || (step < 0 && i > stop) {
            out.push(Value::Int(i));
            match i.checked_add(step) {
                Some(next) => i = next,
                None => break,
            }
        }
        Ok(Value::list(out))
    });
    def(t, "enumerate", |interp, a| {
        let slots = a.parse("enumerate", &["iterable", "start"], 1)?;
        let start = match &slots[1] {
            Some(v) => int_arg(v, "enumerate")?,
            None => 0,
        };
        let items = interp.iterate(slots[0].as_ref().unwrap_or(&Value::None))?;
        Ok(Value::list(
            items
                .into_iter()
                .enumerate()
                .map(|(i, v)| Value::tuple(vec![Value::Int(start + i as i64), v]))
                .collect(),
        ))
    });
    def(t, "zip", |interp, a| {
        let columns = a
            .positional
            .iter()
            .map(|v| interp.iterate(v))
            .collect::<EvalResult<Vec<_>>>()?;
        let n = columns.iter().map(Vec::len).min().unwrap_or(0);
        Ok(Value::list(
            (0..n)
                .map(|i| Value::tuple(columns.iter().map(|c| c[i].clone()).collect()))
                .collect(),
        ))
    });
    def(t, "sorted", |interp, a| {
        let slots = a.parse("sorted", &["iterable", "key", "reverse"], 1)?;
        let mut items = interp.iterate(slots[0].as_ref().unwrap_or(&Value::None))?;
        let key = slots[1].as_ref().filter(|k| !k.is_none());
        let reverse = match &slots[2] {
            Some(r) => interp.truthy(r)?,
            None => false,
        };
        interp.sort_values(&mut items, key, reverse)?;
        Ok(Value::list(items))
    });
    def(t, "reversed", |interp, a| {
        let parts = a.exact("reversed", 1, 1)?;
        let mut items = interp.iterate(&parts[0])?;
        items.reverse();
        Ok(Value::list(items))
    });
    def(t, "any", |interp, a| {
        let parts = a.exact("any", 1, 1)?;
        for item in interp.iterate(&parts[0])? {
            if interp.truthy(&item)? {
                return Ok(Value::Bool(true));
            }
        }
        Ok(Value::Bool(false))
    });
    def(t, "all", |interp, a| {
        let parts = a.exact("all", 1, 1)?;
        for item in interp.iterate(&parts[0])? {
            if !interp.truthy(&item)? {
                return Ok(Value::Bool(false));
            }
        }
        Ok(Value::Bool(true))
    });
    def(t, "map", |interp, a| {
        let Some((f, iterables)) = a.positional.split_first() else {
            return Err(type_error("map() must have at least two arguments"));
        };
        if iterables.is_empty() {
            return Err(type_error("map() must have at least two arguments"));
        }
        let columns = iterables
            .iter()
            .map(|v| interp.iterate(v))
            .collect::<EvalResult<Vec<_>>>()?;
        let n = columns.iter().map(Vec::len).min().unwrap_or(0);
        let mut out = Vec::with_capacity(n);
        for i in 0..n {
            let args = columns.iter().map(|c| c[i].clone()).collect();
            out.push(interp.call(f, Args::new(args))?);
        }
        Ok(Value::list(out))
    });
    def(t, "filter", |interp, a| {
        let parts = a.exact("filter", 2, 2)?;
        let mut out = Vec::new();
        for item in interp.iterate(&parts[1])? {
            let keep = match &parts[0] {
                Value::None => interp.truthy(&item)?,
                f => {
                    let r = interp.call(f, Args::new(vec![item.clone()]))?;
                    interp.truthy(&r)?
                }
            };
            if keep {
                out.push(item);
            }
        }
        Ok(Value::list(out))
    });
}

fn type_arg<'a>(v: &'a Value, fname: &str) -> EvalResult<Vec<&'a Rc<crate::kernel::types::SealedType>>> {
    match v {
        Value::Type(t) => Ok(vec![t]),
        Value::Tuple(items) => items
            .iter()
            .map(|i| {
                i.as_type()
                    .ok_or_else(|| type_error(format!("{fname}() arg 2 must be a type or tuple of types")))
            })
            .collect(),
        _ => Err(type_error(format!(
            "{fname}() arg 2 must be a type or tuple of types"
        ))),
    }
}

fn reflection_functions(t: &mut Table) {
    def(t, "isinstance", |interp, a| {
        let parts = a.exact("isinstance", 2, 2)?;
        let types = type_arg(&parts[1], "isinstance")?;
        Ok(Value::Bool(types.iter().any(|ty| interp.isinstance(&parts[0], ty))))
    });
    def(t, "issubclass", |_, a| {
        let parts = a.exact("issubclass", 2, 2)?;
        let Value::Type(sub) = &parts[0] else {
            return Err(type_error("issubclass() arg 1 must be a class"));
        };
        let types = type_arg(&parts[1], "issubclass")?;
        Ok(Value::Bool(types.iter().any(|ty| sub.is_subtype_of(ty))))
    });
    def(t, "hasattr", |interp, a| {
        let parts = a.exact("hasattr", 2, 2)?;
        let name = super::attr::attr_name(&parts[1])?;
        match crate::kernel::mediator::lookup(interp, &parts[0], name) {
            Ok(found) => Ok(Value::Bool(found.is_some())),
            Err(e) if e.is_a(ErrorKind::AttributeError) => Ok(Value::Bool(false)),
            Err(e) => Err(e),
        }
    });
    def(t, "callable", |interp, a| {
        let parts = a.exact("callable", 1, 1)?;
        let yes = match &parts[0] {
            Value::Function(_)
            | Value::Native(_)
            | Value::Bound(_)
            | Value::Capability(_)
            | Value::Type(_) => true,
            Value::Descriptor(d) => matches!(**d, Descriptor::StaticMethod(_)),
            obj @ Value::Object(_) => interp.class_hook(obj, "__call__")?.is_some(),
            _ => false,
        };
        Ok(Value::Bool(yes))
    });
    def(t, "dir", |interp, a| {
        let parts = a.exact("dir", 0, 1)?;
        let mut names = match parts.first() {
            Some(v) => interp.attr_names(v),
            None => interp
                .current_scope()
                .map(|s| s.names())
                .unwrap_or_default(),
        };
        names.sort();
        Ok(Value::list(names.into_iter().map(Value::from).collect()))
    });
    def(t, "getattr", |interp, a| {
        let parts = a.exact("getattr", 2, 3)?;
        let name = super::attr::attr_name(&parts[1])?;
        match (interp.lookup_attr(&parts[0], name)?, parts.get(2)) {
            (Some(v), _) => Ok(v),
            (None, Some(d)) => Ok(d.clone()),
            (None, None) => interp.get_attr(&parts[0], name),
        }
    });
    def(t, "setattr", |interp, a| {
        let parts = a.exact("setattr", 3, 3)?;
        let name = super::attr::attr_name(&parts[1])?;
        interp.set_attr(&parts[0], name, parts[2].clone())?;
        Ok(Value::None)
    });
    def(t, "delattr", |interp, a| {
        let parts = a.exact("delattr", 2, 2)?;
        let name = super::attr::attr_name(&parts[1])?;
        interp.del_attr(&parts[0], name)?;
        Ok(Value::None)
    });
    def(t, "super", |interp, a| {
        let parts = a.exact("super", 0, 2)?;
        match parts {
            [start, receiver] => interp.make_super(start, receiver.clone()),
            _ => Err(error(ErrorKind::RuntimeError, "super(): no arguments")),
        }
    });
}

fn store_functions(t: &mut Table) {
    def(t, "freeze", |_, a| {
        let parts = a.exact("freeze", 1, 1)?;
        freeze_value(&parts[0]);
        Ok(parts[0].clone())
    });
    def(t, "istype", |interp, a| {
        let parts = a.exact("istype", 2, 2)?;
        let Value::Type(ty) = &parts[1] else {
            return Err(type_error("istype() arg 2 must be a type"));
        };
        Ok(Value::Bool(Rc::ptr_eq(&interp.type_of(&parts[0]), ty)))
    });
    def(t, "fn", |interp, a| {
        let parts = a.exact("fn", 1, 1)?;
        sealer::seal_function(interp, &parts[0])
    });
}

/// Construct an instance of a built-in type.
pub(crate) fn construct(interp: &Interpreter, builtin: Builtin, args: Args) -> EvalResult<Value> {
    let name = interp.prelude().builtin(builtin).name().to_string();
    match builtin {
        Builtin::Int => {
            let parts = args.exact("int", 0, 2)?;
            match parts {
                [] => Ok(Value::Int(0)),
                [v] => to_int(interp, v, 10),
                [Value::Str(s), base] => {
                    let base = int_arg(base, "int")?;
                    if !(2..=36).contains(&base) {
                        return Err(value_error("int() base must be >= 2 and <= 36"));
                    }
                    parse_int(s, base as u32)
                }
                _ => Err(type_error("int() can't convert non-string with explicit base")),
            }
        }
        Builtin::Float => {
            let parts = args.exact("float", 0, 1)?;
            match parts.first() {
                None => Ok(Value::Float(0.0)),
                Some(Value::Int(i)) => Ok(Value::Float(*i as f64)),
                Some(Value::Bool(b)) => Ok(Value::Float(*b as i64 as f64)),
                Some(Value::Float(f)) => Ok(Value::Float(*f)),
                Some(Value::Str(s)) => s
                    .trim()
                    .replace('_', "")
                    .parse::<f64>()
                    .map(Value::Float)
                    .map_err(|_| value_error(format!("could not convert string to float: '{s}'"))),
                Some(other) => Err(type_error(format!(
                    "float() argument must be a string or a number, not '{}'",
                    other.type_name()
                ))),
            }
        }
        Builtin::Str => {
            let parts = args.exact("str", 0, 3)?;
            match parts {
                [] => Ok(Value::str("")),
                [v] => Ok(Value::from(interp.to_str(v)?)),
                [Value::Bytes(b), ..] => std::str::from_utf8(b)
                    .map(Value::str)
                    .map_err(|e| value_error(format!("'utf-8' codec can't decode: {e}"))),
                _ => Err(type_error("decoding to str: need a bytes-like object")),
            }
        }
        Builtin::Bool => {
            let parts = args.exact("bool", 0, 1)?;
            match parts.first() {
                None => Ok(Value::Bool(false)),
                Some(v) => Ok(Value::Bool(interp.truthy(v)?)),
            }
        }
        Builtin::Bytes => {
            let parts = args.exact("bytes", 0, 3)?;
            match parts {
                [] => Ok(Value::bytes(&[])),
                [Value::Str(s), ..] => Ok(Value::bytes(s.as_bytes())),
                [Value::Int(n)] => {
                    let n = usize::try_from(*n).map_err(|_| value_error("negative count"))?;
                    Ok(Value::bytes(&vec![0; n]))
                }
                [Value::Bytes(b)] => Ok(Value::Bytes(b.clone())),
                [iterable] => {
                    let data = interp
                        .iterate(iterable)?
                        .iter()
                        .map(|v| {
                            v.as_int()
                                .and_then(|i| u8::try_from(i).ok())
                                .ok_or_else(|| value_error("bytes must be in range(0, 256)"))
                        })
                        .collect::<EvalResult<Vec<u8>>>()?;
                    Ok(Value::bytes(&data))
                }
                _ => Err(type_error("bytes() takes a string with an encoding")),
            }
        }
        Builtin::List => {
            let parts = args.exact("list", 0, 1)?;
            match parts.first() {
                None => Ok(Value::list(Vec::new())),
                Some(v) => Ok(Value::list(interp.iterate(v)?)),
            }
        }
        Builtin::Tuple => {
            let parts = args.exact("tuple", 0, 1)?;
            match parts.first() {
                None => Ok(Value::tuple(Vec::new())),
                Some(v) => Ok(Value::tuple(interp.iterate(v)?)),
            }
        }
        Builtin::Dict => {
            let mapping = LockedMapping::new();
            match args.positional.as_slice() {
                [] => {}
                [source] => mapping.update(super::methods::mapping_pairs(interp, source)?)?,
                _ => return Err(type_error("dict expected at most 1 argument")),
            }
            for (k, v) in &args.keywords {
                mapping.insert(MapKey::str(k), v.clone())?;
            }
            Ok(Value::Mapping(Rc::new(mapping)))
        }
        Builtin::Property => {
            let slots = args.parse("property", &["fget", "fset", "fdel", "doc"], 0)?;
            let given = |i: usize| slots[i].clone().filter(|v| !v.is_none());
            let doc = match &slots[3] {
                Some(Value::Str(s)) => Some(s.clone()),
                _ => match given(0) {
                    Some(Value::Function(f)) => f.def.doc.clone(),
                    _ => None,
                },
            };
            Ok(Value::Descriptor(Rc::new(Descriptor::Property {
                fget: given(0),
                fset: given(1),
                fdel: given(2),
                doc,
            })))
        }
        Builtin::ClassMethod => {
            let parts = args.exact("classmethod", 1, 1)?;
            Ok(Value::Descriptor(Rc::new(Descriptor::ClassMethod(parts[0].clone()))))
        }
        Builtin::StaticMethod => {
            let parts = args.exact("staticmethod", 1, 1)?;
            Ok(Value::Descriptor(Rc::new(Descriptor::StaticMethod(parts[0].clone()))))
        }
        Builtin::Super => {
            let parts = args.exact("super", 2, 2)?;
            interp.make_super(&parts[0], parts[1].clone())
        }
        _ => Err(type_error(format!("cannot create '{name}' instances"))),
    }
}

fn to_int(interp: &Interpreter, v: &Value, base: u32) -> EvalResult<Value> {
    match v {
        Value::Int(i) => Ok(Value::Int(*i)),
        Value::Bool(b) => Ok(Value::Int(*b as i64)),
        Value::Float(f) => {
            if !f.is_finite() {
                return Err(error(ErrorKind::OverflowError, "cannot convert float to integer"));
            }
            let t = f.trunc();
            if t.abs() >= i64::MAX as f64 {
                return Err(error(ErrorKind::OverflowError, "int too large"));
            }
            Ok(Value::Int(t as i64))
        }
        Value::Str(s) => parse_int(s, base),
        other => Err(type_error(format!(
            "int() argument must be a string or a number, not '{}'",
            interp.type_of(other).name()
        ))),
    }
}

fn parse_int(s: &str, base: u32) -> EvalResult<Value> {
    let cleaned = s.trim().replace('_', "");
    let (negative, digits) = match cleaned.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, cleaned.strip_prefix('+').unwrap_or(&cleaned)),
    };
    let digits = match base {
        16 => digits.strip_prefix("0x").or_else(|| digits.strip_prefix("0X")).unwrap_or(digits),
        8 => digits.strip_prefix("0o").or_else(|| digits.strip_prefix("0O")).unwrap_or(digits),
        2 => digits.strip_prefix("0b").or_else(|| digits.strip_prefix("0B")).unwrap_or(digits),
        _ => digits,
    };
    let invalid = || value_error(format!("invalid literal for int() with base {base}: '{s}'"));
    if digits.is_empty() || digits.starts_with(['+', '-']) {
        return Err(invalid());
    }
    let magnitude = i128::from_str_radix(digits, base).map_err(|_| invalid())?;
    let value = if negative { -magnitude } else { magnitude };
    i64::try_from(value)
        .map(Value::Int)
        .map_err(|_| error(ErrorKind::OverflowError, "int too large"))
}

/// Install the host set plus the guarded reflective built-ins into a bare
/// test scope.
#[cfg(test)]
pub(crate) fn install_for_tests(interp: &Interpreter, scope: &Rc<crate::kernel::scope::Scope>) {
    let target = scope.builtins().expect("test scope has a built-in set");
    for (k, v) in host_builtins(interp.prelude()).items() {
        target.insert(k, v).unwrap();
    }
    for (name, v) in crate::kernel::mediator::guarded_builtins() {
        target.insert_str(name, v).unwrap();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
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

    #[test]
    fn test_host_set_contains_the_raw_primitives() {
        let prelude = Prelude::new();
        let set = host_builtins(&prelude);
        for name in ["open", "exec", "eval", "compile", "globals", "type", "__import__"] {
            assert!(set.get_str(name).is_some(), "{name} missing");
        }
        assert!(set.get_str("KeyError").is_some());
    }

    #[test]
    fn test_numeric_builtins() {
        let out = run(
            "print(abs(-3), round(2.5), round(3.14159, 2), divmod(-7, 2), pow(3, 4, 5))\n\
             print(hex(255), bin(-5), int('ff', 16), int(' 42 '), float('1.5'))\n\
             print(min([3, 1, 2]), max(1, 5, key=lambda v: -v), sum([1, 2, 3], 10))\n",
        )
        .unwrap();
        assert_eq!(
            out,
            "3 2 3.14 (-4, 1) 1\n0xff -0b101 255 42 1.5\n1 1 16\n"
        );
    }

    #[test]
    fn test_sequence_builtins() {
        let out = run(
            "print(list(enumerate('ab', 1)), list(zip([1, 2, 3], 'xy')))\n\
             print(sorted([3, 1, 2], reverse=True), list(reversed((1, 2))), range(0, 10, 3))\n\
             print(list(map(lambda a, b: a + b, [1, 2], [10, 20])), list(filter(None, [0, 1, '', 'a'])))\n",
        )
        .unwrap();
        assert_eq!(
            out,
            "[(1, 'a'), (2, 'b')] [(1, 'x'), (2, 'y')]\n[3, 2, 1] [2, 1] [0, 3, 6, 9]\n[11, 22] [1, 'a']\n"
        );
    }

    #[test]
    fn test_conversion_errors() {
        let err = run("int('x1')\n").unwrap_err();
        assert!(err.starts_with("ValueError: invalid literal"), "{err}");
        let err = run("range(1, 2, 0)\n").unwrap_err();
        assert!(err.contains("must not be zero"), "{err}");
        let err = run("len(5)\n").unwrap_err();
        assert!(err.starts_with("TypeError"), "{err}");
    }

    #[test]
    fn test_store_builtins() {
        let out = run(
            "o = Object(a=1)\nd = freeze({'o': o})\nprint(istype(d, dict), istype(True, int), isinstance(True, int))\n\
             try:\n    o.a = 2\nexcept LockedValueError:\n    print('locked')\n",
        )
        .unwrap();
        assert_eq!(out, "True False True\nlocked\n");
    }

    #[test]
    fn test_raw_type_builds_classes() {
        let out = run(
            "C = type('C', (), {'x': 1, 'get': lambda self: self.x})\nprint(C().get(), C.__name__)\n",
        )
        .unwrap();
        assert_eq!(out, "1 C\n");
    }
}
