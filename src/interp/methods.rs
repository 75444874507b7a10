//! Methods of the built-in types. Each takes its receiver as the first
//! positional argument.

use std::rc::Rc;

use indexmap::IndexMap;

use super::{EvalResult, Interpreter, index_error, key_error, type_error, value_error};
use crate::kernel::format;
use crate::kernel::store::{LockedMapping, MapKey};
use crate::kernel::types::Builtin;
use crate::kernel::value::{Args, Descriptor, ListCell, NativeFn, Value};

type Methods = IndexMap<String, Value>;

fn add(
    methods: &mut Methods,
    name: &str,
    f: impl Fn(&Interpreter, Args) -> EvalResult<Value> + 'static,
) {
    methods.insert(name.to_string(), NativeFn::value(name, f));
}

pub(crate) fn for_builtin(builtin: Builtin) -> Methods {
    let mut m = Methods::new();
    match builtin {
        Builtin::Str => str_methods(&mut m),
        Builtin::List => list_methods(&mut m),
        Builtin::Tuple => {
            add(&mut m, "index", |i, a| seq_index_of(i, a, "tuple"));
            add(&mut m, "count", |i, a| seq_count(i, a, "tuple"));
        }
        Builtin::Dict => dict_methods(&mut m),
        Builtin::Bytes => {
            add(&mut m, "decode", |_, a| {
                let slots = a.parse("decode", &["self", "encoding", "errors"], 1)?;
                let Some(Value::Bytes(b)) = &slots[0] else {
                    return Err(type_error("decode() requires a bytes object"));
                };
                match std::str::from_utf8(b) {
                    Ok(s) => Ok(Value::str(s)),
                    Err(e) => Err(value_error(format!("'utf-8' codec can't decode: {e}"))),
                }
            });
            add(&mut m, "hex", |_, a| {
                let parts = a.exact("hex", 1, 1)?;
                let Value::Bytes(b) = &parts[0] else {
                    return Err(type_error("hex() requires a bytes object"));
                };
                Ok(Value::from(b.iter().map(|x| format!("{x:02x}")).collect::<String>()))
            });
        }
        Builtin::Int => add(&mut m, "bit_length", |_, a| {
            let parts = a.exact("bit_length", 1, 1)?;
            let i = parts[0].as_int().unwrap_or(0);
            Ok(Value::Int(64 - i.unsigned_abs().leading_zeros() as i64))
        }),
        Builtin::Float => add(&mut m, "is_integer", |_, a| {
            let parts = a.exact("is_integer", 1, 1)?;
            match &parts[0] {
                Value::Float(f) => Ok(Value::Bool(f.is_finite() && f.fract() == 0.0)),
                _ => Err(type_error("is_integer() requires a float")),
            }
        }),
        Builtin::Property => {
            for which in ["getter", "setter", "deleter"] {
                add(&mut m, which, move |_, a| property_with(a, which));
            }
        }
        _ => {}
    }
    m
}

fn str_self<'a>(args: &'a Args, name: &str) -> EvalResult<(&'a str, &'a [Value])> {
    match args.positional.split_first() {
        Some((Value::Str(s), rest)) => Ok((s, rest)),
        _ => Err(type_error(format!("descriptor '{name}' requires a 'str' object"))),
    }
}

fn str_arg<'a>(v: &'a Value, name: &str) -> EvalResult<&'a str> {
    v.as_str().ok_or_else(|| {
        type_error(format!(
            "{name}() argument must be str, not {}",
            v.type_name()
        ))
    })
}

fn char_index(s: &str, byte: usize) -> i64 {
    s[..byte].chars().count() as i64
}

fn str_methods(m: &mut Methods) {
    add(m, "upper", |_, a| Ok(Value::from(str_self(&a, "upper")?.0.to_uppercase())));
    add(m, "lower", |_, a| Ok(Value::from(str_self(&a, "lower")?.0.to_lowercase())));
    add(m, "capitalize", |_, a| {
        let (s, _) = str_self(&a, "capitalize")?;
        let mut chars = s.chars();
        Ok(Value::from(match chars.next() {
            Some(c) => c.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
            None => String::new(),
        }))
    });
    add(m, "title", |_, a| {
        let (s, _) = str_self(&a, "title")?;
        let mut out = String::with_capacity(s.len());
        let mut prev_alpha = false;
        for c in s.chars() {
            if prev_alpha {
                out.extend(c.to_lowercase());
            } else {
                out.extend(c.to_uppercase());
            }
            prev_alpha = c.is_alphabetic();
        }
        Ok(Value::from(out))
    });
    for which in ["strip", "lstrip", "rstrip"] {
        add(m, which, move |_, a| {
            let (s, rest) = str_self(&a, which)?;
            let set: Option<Vec<char>> = match rest.first() {
                None | Some(Value::None) => None,
                Some(v) => Some(str_arg(v, which)?.chars().collect()),
            };
            let pred = |c: char| match &set {
                Some(chars) => chars.contains(&c),
                None => c.is_whitespace(),
            };
            let out = match which {
                "strip" => s.trim_matches(pred),
                "lstrip" => s.trim_start_matches(pred),
                _ => s.trim_end_matches(pred),
            };
            Ok(Value::str(out))
        });
    }
    add(m, "split", |_, a| {
        let slots = a.parse("split", &["self", "sep", "maxsplit"], 1)?;
        let Some(Value::Str(s)) = &slots[0] else {
            return Err(type_error("split() requires a str"));
        };
        let maxsplit = match &slots[2] {
            Some(v) => v.as_int().ok_or_else(|| type_error("maxsplit must be an integer"))?,
            None => -1,
        };
        let parts: Vec<Value> = match &slots[1] {
            None | Some(Value::None) => {
                let mut out = Vec::new();
                let mut rest = s.trim_start();
                while !rest.is_empty() {
                    if maxsplit >= 0 && out.len() as i64 == maxsplit {
                        out.push(Value::str(rest.trim_end()));
                        break;
                    }
                    let end = rest.find(char::is_whitespace).unwrap_or(rest.len());
                    out.push(Value::str(&rest[..end]));
                    rest = rest[end..].trim_start();
                }
                out
            }
            Some(sep) => {
                let sep = str_arg(sep, "split")?;
                if sep.is_empty() {
                    return Err(value_error("empty separator"));
                }
                if maxsplit < 0 {
                    s.split(sep).map(Value::str).collect()
                } else {
                    s.splitn(maxsplit as usize + 1, sep).map(Value::str).collect()
                }
            }
        };
        Ok(Value::list(parts))
    });
    add(m, "splitlines", |_, a| {
        let (s, _) = str_self(&a, "splitlines")?;
        Ok(Value::list(s.lines().map(Value::str).collect()))
    });
    add(m, "join", |interp, a| {
        let parts = a.exact("join", 2, 2)?;
        let Value::Str(sep) = &parts[0] else {
            return Err(type_error("join() requires a str"));
        };
        let items = interp.iterate(&parts[1])?;
        let strs = items
            .iter()
            .map(|v| {
                v.as_str().map(str::to_string).ok_or_else(|| {
                    type_error(format!(
                        "sequence item: expected str instance, {} found",
                        v.type_name()
                    ))
                })
            })
            .collect::<EvalResult<Vec<_>>>()?;
        Ok(Value::from(strs.join(sep)))
    });
    add(m, "replace", |_, a| {
        let parts = a.exact("replace", 3, 4)?;
        let (s, old, new) = (
            str_arg(&parts[0], "replace")?,
            str_arg(&parts[1], "replace")?,
            str_arg(&parts[2], "replace")?,
        );
        let count = parts.get(3).and_then(Value::as_int).unwrap_or(-1);
        Ok(Value::from(if count < 0 {
            s.replace(old, new)
        } else {
            s.replacen(old, new, count as usize)
        }))
    });
    for which in ["startswith", "endswith"] {
        add(m, which, move |_, a| {
            let (s, rest) = str_self(&a, which)?;
            let Some(arg) = rest.first() else {
                return Err(type_error(format!("{which}() takes at least 1 argument")));
            };
            let candidates: Vec<&Value> = match arg {
                Value::Tuple(items) => items.iter().collect(),
                one => vec![one],
            };
            for c in candidates {
                let c = str_arg(c, which)?;
                let hit = if which == "startswith" { s.starts_with(c) } else { s.ends_with(c) };
                if hit {
                    return Ok(Value::Bool(true));
                }
            }
            Ok(Value::Bool(false))
        });
    }
    for which in ["find", "rfind", "index"] {
        add(m, which, move |_, a| {
            let (s, rest) = str_self(&a, which)?;
            let Some(sub) = rest.first() else {
                return Err(type_error(format!("{which}() takes at least 1 argument")));
            };
            let sub = str_arg(sub, which)?;
            let pos = if which == "rfind" { s.rfind(sub) } else { s.find(sub) };
            match (pos, which) {
                (Some(b), _) => Ok(Value::Int(char_index(s, b))),
                (None, "index") => Err(value_error("substring not found")),
                (None, _) => Ok(Value::Int(-1)),
            }
        });
    }
    add(m, "count", |_, a| {
        let parts = a.exact("count", 2, 2)?;
        let (s, sub) = (str_arg(&parts[0], "count")?, str_arg(&parts[1], "count")?);
        let n = if sub.is_empty() {
            s.chars().count() + 1
        } else {
            s.matches(sub).count()
        };
        Ok(Value::Int(n as i64))
    });
    let predicates: [(&str, fn(char) -> bool); 4] = [
        ("isdigit", |c| c.is_ascii_digit()),
        ("isalpha", char::is_alphabetic),
        ("isalnum", char::is_alphanumeric),
        ("isspace", char::is_whitespace),
    ];
    for (name, pred) in predicates {
        add(m, name, move |_, a| {
            let (s, _) = str_self(&a, name)?;
            Ok(Value::Bool(!s.is_empty() && s.chars().all(pred)))
        });
    }
    add(m, "isupper", |_, a| {
        let (s, _) = str_self(&a, "isupper")?;
        Ok(Value::Bool(
            s.chars().any(char::is_alphabetic) && !s.chars().any(char::is_lowercase),
        ))
    });
    add(m, "islower", |_, a| {
        let (s, _) = str_self(&a, "islower")?;
        Ok(Value::Bool(
            s.chars().any(char::is_alphabetic) && !s.chars().any(char::is_uppercase),
        ))
    });
    add(m, "zfill", |_, a| {
        let parts = a.exact("zfill", 2, 2)?;
        let s = str_arg(&parts[0], "zfill")?;
        let width = parts[1].as_int().unwrap_or(0).max(0) as usize;
        let len = s.chars().count();
        if len >= width {
            return Ok(Value::str(s));
        }
        let (sign, digits) = match s.strip_prefix(['-', '+']) {
            Some(d) => (&s[..1], d),
            None => ("", s),
        };
        Ok(Value::from(format!("{sign}{}{digits}", "0".repeat(width - len))))
    });
    for which in ["center", "ljust", "rjust"] {
        add(m, which, move |_, a| {
            let parts = a.exact(which, 2, 3)?;
            let s = str_arg(&parts[0], which)?;
            let width = parts[1].as_int().unwrap_or(0).max(0) as usize;
            let fill = match parts.get(2) {
                Some(v) => {
                    let f = str_arg(v, which)?;
                    let mut chars = f.chars();
                    match (chars.next(), chars.next()) {
                        (Some(c), None) => c,
                        _ => return Err(type_error("the fill character must be exactly one character long")),
                    }
                }
                None => ' ',
            };
            let len = s.chars().count();
            if len >= width {
                return Ok(Value::str(s));
            }
            let pad = width - len;
            let (left, right) = match which {
                "ljust" => (0, pad),
                "rjust" => (pad, 0),
                _ => (pad / 2, pad - pad / 2),
            };
            let fill = |n: usize| std::iter::repeat_n(fill, n).collect::<String>();
            Ok(Value::from(format!("{}{s}{}", fill(left), fill(right))))
        });
    }
    add(m, "partition", |_, a| {
        let parts = a.exact("partition", 2, 2)?;
        let (s, sep) = (str_arg(&parts[0], "partition")?, str_arg(&parts[1], "partition")?);
        Ok(Value::tuple(match s.split_once(sep) {
            Some((head, tail)) => vec![Value::str(head), Value::str(sep), Value::str(tail)],
            None => vec![Value::str(s), Value::str(""), Value::str("")],
        }))
    });
    add(m, "encode", |_, a| {
        let (s, _) = str_self(&a, "encode")?;
        Ok(Value::bytes(s.as_bytes()))
    });
    add(m, "format", |interp, a| {
        let (template, rest) = str_self(&a, "format")?;
        let named = Value::Mapping(Rc::new(LockedMapping::from_pairs(
            a.keywords.iter().map(|(k, v)| (MapKey::str(k), v.clone())),
        )));
        Ok(Value::from(format::safe_format(interp, template, rest, Some(&named))?))
    });
    add(m, "format_map", |interp, a| {
        let parts = a.exact("format_map", 2, 2)?;
        let template = str_arg(&parts[0], "format_map")?;
        Ok(Value::from(format::safe_format(interp, template, &[], Some(&parts[1]))?))
    });
}

fn list_self<'a>(
    args: &'a Args,
    name: &str,
) -> EvalResult<(&'a Rc<ListCell>, &'a [Value])> {
    match args.positional.split_first() {
        Some((Value::List(l), rest)) => Ok((l, rest)),
        _ => Err(type_error(format!("descriptor '{name}' requires a 'list' object"))),
    }
}

fn list_methods(m: &mut Methods) {
    add(m, "append", |_, a| {
        a.exact("append", 2, 2)?;
        let (l, rest) = list_self(&a, "append")?;
        l.borrow_mut().push(rest[0].clone());
        Ok(Value::None)
    });
    add(m, "extend", |interp, a| {
        a.exact("extend", 2, 2)?;
        let (l, rest) = list_self(&a, "extend")?;
        let items = interp.iterate(&rest[0])?;
        l.borrow_mut().extend(items);
        Ok(Value::None)
    });
    add(m, "insert", |_, a| {
        a.exact("insert", 3, 3)?;
        let (l, rest) = list_self(&a, "insert")?;
        let i = rest[0].as_int().ok_or_else(|| type_error("insert() index must be an integer"))?;
        let mut list = l.borrow_mut();
        let len = list.len() as i64;
        let at = if i < 0 { (i + len).max(0) } else { i.min(len) };
        list.insert(at as usize, rest[1].clone());
        Ok(Value::None)
    });
    add(m, "pop", |_, a| {
        a.exact("pop", 1, 2)?;
        let (l, rest) = list_self(&a, "pop")?;
        let mut list = l.borrow_mut();
        if list.is_empty() {
            return Err(index_error("pop from empty list"));
        }
        let len = list.len() as i64;
        let i = rest.first().and_then(Value::as_int).unwrap_or(-1);
        let at = if i < 0 { i + len } else { i };
        if at < 0 || at >= len {
            return Err(index_error("pop index out of range"));
        }
        Ok(list.remove(at as usize))
    });
    add(m, "remove", |interp, a| {
        a.exact("remove", 2, 2)?;
        let (l, rest) = list_self(&a, "remove")?;
        let items = l.borrow().clone();
        for (i, v) in items.iter().enumerate() {
            if interp.eq(v, &rest[0])? {
                l.borrow_mut().remove(i);
                return Ok(Value::None);
            }
        }
        Err(value_error("list.remove(x): x not in list"))
    });
    add(m, "index", |i, a| seq_index_of(i, a, "list"));
    add(m, "count", |i, a| seq_count(i, a, "list"));
    add(m, "reverse", |_, a| {
        a.exact("reverse", 1, 1)?;
        list_self(&a, "reverse")?.0.borrow_mut().reverse();
        Ok(Value::None)
    });
    add(m, "sort", |interp, a| {
        let slots = a.parse("sort", &["self", "key", "reverse"], 1)?;
        let Some(Value::List(l)) = &slots[0] else {
            return Err(type_error("sort() requires a list"));
        };
        let key = slots[1].as_ref().filter(|k| !k.is_none());
        let reverse = match &slots[2] {
            Some(r) => interp.truthy(r)?,
            None => false,
        };
        let mut items = l.borrow().clone();
        interp.sort_values(&mut items, key, reverse)?;
        *l.borrow_mut() = items;
        Ok(Value::None)
    });
    add(m, "copy", |_, a| {
        a.exact("copy", 1, 1)?;
        Ok(Value::list(list_self(&a, "copy")?.0.borrow().clone()))
    });
    add(m, "clear", |_, a| {
        a.exact("clear", 1, 1)?;
        list_self(&a, "clear")?.0.borrow_mut().clear();
        Ok(Value::None)
    });
}

fn seq_items(interp: &Interpreter, v: &Value, name: &str) -> EvalResult<Vec<Value>> {
    match v {
        Value::List(_) | Value::Tuple(_) => interp.iterate(v),
        _ => Err(type_error(format!("descriptor requires a '{name}' object"))),
    }
}

fn seq_index_of(interp: &Interpreter, a: Args, name: &str) -> EvalResult<Value> {
    let parts = a.exact("index", 2, 2)?;
    for (i, v) in seq_items(interp, &parts[0], name)?.iter().enumerate() {
        if interp.eq(v, &parts[1])? {
            return Ok(Value::Int(i as i64));
        }
    }
    Err(value_error(format!("{name}.index(x): x not in {name}")))
}

fn seq_count(interp: &Interpreter, a: Args, name: &str) -> EvalResult<Value> {
    let parts = a.exact("count", 2, 2)?;
    let mut n = 0;
    for v in seq_items(interp, &parts[0], name)? {
        if interp.eq(&v, &parts[1])? {
            n += 1;
        }
    }
    Ok(Value::Int(n))
}

fn dict_self<'a>(args: &'a Args, name: &str) -> EvalResult<(&'a Rc<LockedMapping>, &'a [Value])> {
    match args.positional.split_first() {
        Some((Value::Mapping(m), rest)) => Ok((m, rest)),
        _ => Err(type_error(format!("descriptor '{name}' requires a 'dict' object"))),
    }
}

/// Pairs from a mapping, a list of pairs, or keyword arguments.
pub(crate) fn mapping_pairs(interp: &Interpreter, source: &Value) -> EvalResult<Vec<(MapKey, Value)>> {
    if let Value::Mapping(m) = source {
        return Ok(m.items());
    }
    let mut out = Vec::new();
    for item in interp.iterate(source)? {
        let pair = interp.iterate(&item)?;
        let [k, v] = pair.as_slice() else {
            return Err(value_error(
                "dictionary update sequence element has wrong length; 2 is required",
            ));
        };
        out.push((interp.map_key(k)?, v.clone()));
    }
    Ok(out)
}

fn dict_methods(m: &mut Methods) {
    add(m, "get", |interp, a| {
        a.exact("get", 2, 3)?;
        let (d, rest) = dict_self(&a, "get")?;
        let key = interp.map_key(&rest[0])?;
        Ok(d.get(&key).unwrap_or_else(|| rest.get(1).cloned().unwrap_or(Value::None)))
    });
    add(m, "keys", |_, a| {
        a.exact("keys", 1, 1)?;
        let (d, _) = dict_self(&a, "keys")?;
        Ok(Value::list(d.keys().iter().map(MapKey::to_value).collect()))
    });
    add(m, "values", |_, a| {
        a.exact("values", 1, 1)?;
        Ok(Value::list(dict_self(&a, "values")?.0.values()))
    });
    add(m, "items", |_, a| {
        a.exact("items", 1, 1)?;
        let (d, _) = dict_self(&a, "items")?;
        Ok(Value::list(
            d.items()
                .into_iter()
                .map(|(k, v)| Value::tuple(vec![k.to_value(), v]))
                .collect(),
        ))
    });
    add(m, "pop", |interp, a| {
        a.exact("pop", 2, 3)?;
        let (d, rest) = dict_self(&a, "pop")?;
        match d.remove(&interp.map_key(&rest[0])?)? {
            Some(v) => Ok(v),
            None => match rest.get(1) {
                Some(default) => Ok(default.clone()),
                None => Err(key_error(interp.repr(&rest[0])?)),
            },
        }
    });
    add(m, "popitem", |_, a| {
        a.exact("popitem", 1, 1)?;
        let (d, _) = dict_self(&a, "popitem")?;
        match d.popitem()? {
            Some((k, v)) => Ok(Value::tuple(vec![k.to_value(), v])),
            None => Err(key_error("popitem(): dictionary is empty")),
        }
    });
    add(m, "setdefault", |interp, a| {
        a.exact("setdefault", 2, 3)?;
        let (d, rest) = dict_self(&a, "setdefault")?;
        let default = rest.get(1).cloned().unwrap_or(Value::None);
        Ok(d.setdefault(interp.map_key(&rest[0])?, default)?)
    });
    add(m, "update", |interp, a| {
        let (d, rest) = dict_self(&a, "update")?;
        let mut pairs = match rest {
            [] => Vec::new(),
            [source] => mapping_pairs(interp, source)?,
            _ => return Err(type_error("update expected at most 1 argument")),
        };
        pairs.extend(a.keywords.iter().map(|(k, v)| (MapKey::str(k), v.clone())));
        d.update(pairs)?;
        Ok(Value::None)
    });
    add(m, "clear", |_, a| {
        a.exact("clear", 1, 1)?;
        dict_self(&a, "clear")?.0.clear()?;
        Ok(Value::None)
    });
    add(m, "copy", |_, a| {
        a.exact("copy", 1, 1)?;
        Ok(Value::Mapping(Rc::new(dict_self(&a, "copy")?.0.copy())))
    });
    add(m, "lock", |_, a| {
        a.exact("lock", 1, 1)?;
        let (d, _) = dict_self(&a, "lock")?;
        d.freeze();
        Ok(Value::Mapping(d.clone()))
    });
}

/// `prop.getter(f)` and friends: a copy of the property with one slot replaced.
fn property_with(a: Args, which: &str) -> EvalResult<Value> {
    let parts = a.exact(which, 2, 2)?;
    let Value::Descriptor(d) = &parts[0] else {
        return Err(type_error(format!("{which}() requires a property")));
    };
    let Descriptor::Property {
        fget,
        fset,
        fdel,
        doc,
    } = &**d
    else {
        return Err(type_error(format!("{which}() requires a property")));
    };
    let f = Some(parts[1].clone());
    let (fget, fset, fdel) = match which {
        "getter" => (f, fset.clone(), fdel.clone()),
        "setter" => (fget.clone(), f, fdel.clone()),
        _ => (fget.clone(), fset.clone(), f),
    };
    Ok(Value::Descriptor(Rc::new(Descriptor::Property {
        fget,
        fset,
        fdel,
        doc: doc.clone(),
    })))
}

#[cfg(test)]
mod tests {
    use crate::interp::testing::interpreter;
    use crate::kernel::scope::Scope;
    use crate::kernel::store::LockedMapping;
    use std::rc::Rc;

    fn eval(src: &str) -> String {
        let (interp, _) = interpreter();
        let scope = Scope::with_builtins(Rc::new(LockedMapping::new()));
        crate::interp::builtins::install_for_tests(&interp, &scope);
        let v = interp.eval_source(src, &scope, None, true).unwrap();
        interp.repr(&v).unwrap()
    }

    #[test]
    fn test_string_methods() {
        assert_eq!(eval("' a b  c '.split()"), "['a', 'b', 'c']");
        assert_eq!(eval("'a,b,c'.split(',', 1)"), "['a', 'b,c']");
        assert_eq!(eval("'-'.join(['x', 'y'])"), "'x-y'");
        assert_eq!(eval("'xxhixx'.strip('x')"), "'hi'");
        assert_eq!(eval("'hello'.find('l')"), "2");
        assert_eq!(eval("'42'.zfill(5)"), "'00042'");
        assert_eq!(eval("'ab'.center(6, '*')"), "'**ab**'");
        assert_eq!(eval("'{0}-{name}'.format(1, name='n')"), "'1-n'");
    }

    #[test]
    fn test_list_and_dict_methods() {
        assert_eq!(eval("(lambda l: (l.sort(reverse=True), l)[1])([3, 1, 2])"), "[3, 2, 1]");
        assert_eq!(eval("(lambda d: (d.setdefault('k', 5), d.pop('k'), d.get('k', 0)))({})"), "(5, 5, 0)");
        assert_eq!(eval("sorted({'a': 1, 'b': 2}.items())"), "[('a', 1), ('b', 2)]");
    }

    #[test]
    fn test_locked_dict_refuses_mutation() {
        let (interp, _) = interpreter();
        let scope = Scope::with_builtins(Rc::new(LockedMapping::new()));
        crate::interp::builtins::install_for_tests(&interp, &scope);
        let err = interp
            .run_source("d = {'a': 1}.lock()\nprint(d['a'])\nd.update({'b': 2})\n", &scope, "<t>", false)
            .unwrap_err();
        assert_eq!(err.type_name(), "LockedValueError");
    }
}
