//! Standard library capability objects.
//!
//! `math`, `json` and `re` reach guest scopes as frozen objects whose every
//! attribute is a sealed capability. Guest code can call them but never
//! reaches the host functions behind them.

use std::io;
use std::rc::Rc;

use regex::{Captures, Regex};
use serde::Serialize;

use super::sealer;
use super::store::{LockedMapping, LockedObject, MapKey};
use super::types::Builtin;
use super::value::{Args, Value};
use crate::error::ErrorKind;
use crate::interp::{EvalResult, Interpreter, Prelude, error, index_error, type_error, value_error};

/// Regex flag values as guest code sees them.
pub const IGNORECASE: i64 = 2;
pub const MULTILINE: i64 = 8;
pub const DOTALL: i64 = 16;

/// All standard library objects, by the name they are installed under.
pub fn modules(prelude: &Prelude) -> Vec<(&'static str, Value)> {
    vec![
        ("math", math(prelude)),
        ("json", json(prelude)),
        ("re", re(prelude)),
    ]
}

fn frozen_object(prelude: &Prelude, entries: Vec<(&str, Value)>) -> Value {
    let obj = LockedObject::new(prelude.builtin(Builtin::LockedObject).clone());
    for (name, value) in entries {
        // A fresh object is never locked.
        let _ = obj.store_overflow(name, value);
    }
    obj.freeze();
    Value::Object(Rc::new(obj))
}

// ---------------------------------------------------------------------------
// math
// ---------------------------------------------------------------------------

fn float_arg(v: &Value, fname: &str) -> EvalResult<f64> {
    match v {
        Value::Int(i) => Ok(*i as f64),
        Value::Bool(b) => Ok(*b as i64 as f64),
        Value::Float(f) => Ok(*f),
        other => Err(type_error(format!(
            "{fname}() argument must be a number, not '{}'",
            other.type_name()
        ))),
    }
}

fn int_arg(v: &Value, fname: &str) -> EvalResult<i64> {
    match v {
        Value::Int(i) => Ok(*i),
        Value::Bool(b) => Ok(*b as i64),
        other => Err(type_error(format!(
            "{fname}() argument must be an integer, not '{}'",
            other.type_name()
        ))),
    }
}

fn domain_error() -> Box<crate::interp::GuestError> {
    value_error("math domain error")
}

/// Map a float result back to a guest value, turning NaN and overflow
/// from finite inputs into the errors guest code expects.
fn checked(inputs: &[f64], result: f64) -> EvalResult<Value> {
    if result.is_nan() && !inputs.iter().any(|x| x.is_nan()) {
        return Err(domain_error());
    }
    if result.is_infinite() && inputs.iter().all(|x| x.is_finite()) {
        return Err(error(ErrorKind::OverflowError, "math range error"));
    }
    Ok(Value::Float(result))
}

fn to_int(f: f64, fname: &str) -> EvalResult<Value> {
    if f.is_nan() {
        return Err(value_error(format!("{fname}(): cannot convert float NaN to integer")));
    }
    if f.is_infinite() || f.abs() >= 9.2e18 {
        return Err(error(ErrorKind::OverflowError, "cannot convert float infinity to integer"));
    }
    Ok(Value::Int(f as i64))
}

fn unary(name: &'static str, doc: &'static str, f: fn(f64) -> f64) -> (&'static str, Value) {
    let cap = sealer::native(name, "x", Some(doc), move |_, a| {
        let parts = a.exact(name, 1, 1)?;
        let x = float_arg(&parts[0], name)?;
        checked(&[x], f(x))
    });
    (name, cap)
}

fn binary(name: &'static str, doc: &'static str, f: fn(f64, f64) -> f64) -> (&'static str, Value) {
    let cap = sealer::native(name, "x, y", Some(doc), move |_, a| {
        let parts = a.exact(name, 2, 2)?;
        let x = float_arg(&parts[0], name)?;
        let y = float_arg(&parts[1], name)?;
        checked(&[x, y], f(x, y))
    });
    (name, cap)
}

fn predicate(name: &'static str, f: fn(f64) -> bool) -> (&'static str, Value) {
    let cap = sealer::native(name, "x", None, move |_, a| {
        let parts = a.exact(name, 1, 1)?;
        Ok(Value::Bool(f(float_arg(&parts[0], name)?)))
    });
    (name, cap)
}

fn math(prelude: &Prelude) -> Value {
    let mut entries = vec![
        ("pi", Value::Float(std::f64::consts::PI)),
        ("e", Value::Float(std::f64::consts::E)),
        ("tau", Value::Float(std::f64::consts::TAU)),
        ("inf", Value::Float(f64::INFINITY)),
        ("nan", Value::Float(f64::NAN)),
        unary("sqrt", "Return the square root of x.", f64::sqrt),
        unary("exp", "Return e raised to the power of x.", f64::exp),
        unary("fabs", "Return the absolute value of the float x.", f64::abs),
        unary("sin", "Return the sine of x (measured in radians).", f64::sin),
        unary("cos", "Return the cosine of x (measured in radians).", f64::cos),
        unary("tan", "Return the tangent of x (measured in radians).", f64::tan),
        unary("asin", "Return the arc sine (measured in radians) of x.", f64::asin),
        unary("acos", "Return the arc cosine (measured in radians) of x.", f64::acos),
        unary("atan", "Return the arc tangent (measured in radians) of x.", f64::atan),
        unary("degrees", "Convert angle x from radians to degrees.", f64::to_degrees),
        unary("radians", "Convert angle x from degrees to radians.", f64::to_radians),
        binary("atan2", "Return the arc tangent of y/x, in radians.", f64::atan2),
        binary("hypot", "Return the Euclidean distance, sqrt(x*x + y*y).", f64::hypot),
        binary("copysign", "Return x with the sign of y.", f64::copysign),
        binary("pow", "Return x**y (x to the power of y).", f64::powf),
        predicate("isnan", f64::is_nan),
        predicate("isinf", f64::is_infinite),
        predicate("isfinite", f64::is_finite),
    ];

    entries.push((
        "fmod",
        sealer::native("fmod", "x, y", Some("Return fmod(x, y)."), |_, a| {
            let parts = a.exact("fmod", 2, 2)?;
            let x = float_arg(&parts[0], "fmod")?;
            let y = float_arg(&parts[1], "fmod")?;
            if y == 0.0 || x.is_infinite() {
                return Err(domain_error());
            }
            Ok(Value::Float(x % y))
        }),
    ));
    entries.push((
        "log",
        sealer::native(
            "log",
            "x, base=...",
            Some("Return the logarithm of x to the given base (natural by default)."),
            |_, a| {
                let parts = a.exact("log", 1, 2)?;
                let x = float_arg(&parts[0], "log")?;
                if x <= 0.0 {
                    return Err(domain_error());
                }
                match parts.get(1) {
                    None => Ok(Value::Float(x.ln())),
                    Some(b) => {
                        let base = float_arg(b, "log")?;
                        if base <= 0.0 || base == 1.0 {
                            return Err(domain_error());
                        }
                        Ok(Value::Float(x.ln() / base.ln()))
                    }
                }
            },
        ),
    ));
    for (name, f) in [("log2", f64::log2 as fn(f64) -> f64), ("log10", f64::log10)] {
        entries.push((
            name,
            sealer::native(name, "x", None, move |_, a| {
                let parts = a.exact(name, 1, 1)?;
                let x = float_arg(&parts[0], name)?;
                if x <= 0.0 {
                    return Err(domain_error());
                }
                Ok(Value::Float(f(x)))
            }),
        ));
    }
    for (name, f) in [
        ("floor", f64::floor as fn(f64) -> f64),
        ("ceil", f64::ceil),
        ("trunc", f64::trunc),
    ] {
        entries.push((
            name,
            sealer::native(name, "x", None, move |_, a| {
                let parts = a.exact(name, 1, 1)?;
                match &parts[0] {
                    Value::Int(i) => Ok(Value::Int(*i)),
                    other => to_int(f(float_arg(other, name)?), name),
                }
            }),
        ));
    }
    entries.push((
        "gcd",
        sealer::native("gcd", "*integers", Some("Greatest common divisor."), |_, a| {
            let mut acc: i64 = 0;
            for v in &a.exact("gcd", 0, usize::MAX)?.to_vec() {
                let mut b = int_arg(v, "gcd")?.unsigned_abs();
                let mut x = acc.unsigned_abs();
                while b != 0 {
                    (x, b) = (b, x % b);
                }
                acc = i64::try_from(x).map_err(|_| error(ErrorKind::OverflowError, "int too large"))?;
            }
            Ok(Value::Int(acc))
        }),
    ));
    entries.push((
        "factorial",
        sealer::native("factorial", "n", Some("Find n!."), |_, a| {
            let parts = a.exact("factorial", 1, 1)?;
            let n = int_arg(&parts[0], "factorial")?;
            if n < 0 {
                return Err(value_error("factorial() not defined for negative values"));
            }
            let mut acc: i64 = 1;
            for k in 2..=n {
                acc = acc
                    .checked_mul(k)
                    .ok_or_else(|| error(ErrorKind::OverflowError, "int too large"))?;
            }
            Ok(Value::Int(acc))
        }),
    ));
    frozen_object(prelude, entries)
}

// ---------------------------------------------------------------------------
// json
// ---------------------------------------------------------------------------

const MAX_JSON_DEPTH: usize = 200;

fn to_json(interp: &Interpreter, value: &Value, sort_keys: bool, depth: usize) -> EvalResult<serde_json::Value> {
    if depth > MAX_JSON_DEPTH {
        return Err(value_error("Circular reference detected"));
    }
    Ok(match value {
        Value::None => serde_json::Value::Null,
        Value::Bool(b) => serde_json::Value::Bool(*b),
        Value::Int(i) => serde_json::Value::from(*i),
        Value::Float(f) => serde_json::Number::from_f64(*f)
            .map(serde_json::Value::Number)
            .ok_or_else(|| value_error("Out of range float values are not JSON compliant"))?,
        Value::Str(s) => serde_json::Value::String(s.to_string()),
        Value::List(items) => {
            let items = items.borrow().clone();
            serde_json::Value::Array(
                items
                    .iter()
                    .map(|v| to_json(interp, v, sort_keys, depth + 1))
                    .collect::<EvalResult<_>>()?,
            )
        }
        Value::Tuple(items) => serde_json::Value::Array(
            items
                .iter()
                .map(|v| to_json(interp, v, sort_keys, depth + 1))
                .collect::<EvalResult<_>>()?,
        ),
        Value::Mapping(m) => {
            let mut pairs = Vec::with_capacity(m.len());
            for (k, v) in m.items() {
                let key = match &k {
                    MapKey::Str(s) => s.to_string(),
                    MapKey::Int(i) => i.to_string(),
                    MapKey::Float(bits) => crate::interp::float_repr(f64::from_bits(*bits)),
                    MapKey::None => "null".to_string(),
                    _ => {
                        return Err(type_error(format!(
                            "keys must be str, int, float, bool or None, not {}",
                            k.to_value().type_name()
                        )));
                    }
                };
                pairs.push((key, to_json(interp, &v, sort_keys, depth + 1)?));
            }
            if sort_keys {
                pairs.sort_by(|a, b| a.0.cmp(&b.0));
            }
            serde_json::Value::Object(pairs.into_iter().collect())
        }
        other => {
            return Err(type_error(format!(
                "Object of type {} is not JSON serializable",
                interp.type_of(other).name()
            )));
        }
    })
}

fn from_json(value: serde_json::Value) -> Value {
    match value {
        serde_json::Value::Null => Value::None,
        serde_json::Value::Bool(b) => Value::Bool(b),
        serde_json::Value::Number(n) => match n.as_i64() {
            Some(i) => Value::Int(i),
            None => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
        },
        serde_json::Value::String(s) => Value::str(&s),
        serde_json::Value::Array(items) => Value::list(items.into_iter().map(from_json).collect()),
        serde_json::Value::Object(map) => Value::Mapping(Rc::new(LockedMapping::from_pairs(
            map.into_iter().map(|(k, v)| (MapKey::str(&k), from_json(v))),
        ))),
    }
}

/// Writes JSON with the separators guest code expects: `", "` and `": "`
/// on one line, or `","` plus a newline per item when indenting.
struct GuestFormatter {
    indent: Option<Vec<u8>>,
    level: usize,
    has_value: bool,
    ensure_ascii: bool,
}

impl GuestFormatter {
    fn newline<W: ?Sized + io::Write>(&self, w: &mut W) -> io::Result<()> {
        if let Some(indent) = &self.indent {
            w.write_all(b"\n")?;
            for _ in 0..self.level {
                w.write_all(indent)?;
            }
        }
        Ok(())
    }

    fn separator<W: ?Sized + io::Write>(&self, w: &mut W, first: bool) -> io::Result<()> {
        if !first {
            w.write_all(b",")?;
            if self.indent.is_none() {
                w.write_all(b" ")?;
            }
        }
        self.newline(w)
    }
}

impl serde_json::ser::Formatter for GuestFormatter {
    fn begin_array<W: ?Sized + io::Write>(&mut self, w: &mut W) -> io::Result<()> {
        self.level += 1;
        self.has_value = false;
        w.write_all(b"[")
    }

    fn end_array<W: ?Sized + io::Write>(&mut self, w: &mut W) -> io::Result<()> {
        self.level -= 1;
        if self.has_value {
            self.newline(w)?;
        }
        w.write_all(b"]")
    }

    fn begin_array_value<W: ?Sized + io::Write>(&mut self, w: &mut W, first: bool) -> io::Result<()> {
        self.separator(w, first)
    }

    fn end_array_value<W: ?Sized + io::Write>(&mut self, _w: &mut W) -> io::Result<()> {
        self.has_value = true;
        Ok(())
    }

    fn begin_object<W: ?Sized + io::Write>(&mut self, w: &mut W) -> io::Result<()> {
        self.level += 1;
        self.has_value = false;
        w.write_all(b"{")
    }

    fn end_object<W: ?Sized + io::Write>(&mut self, w: &mut W) -> io::Result<()> {
        self.level -= 1;
        if self.has_value {
            self.newline(w)?;
        }
        w.write_all(b"}")
    }

    fn begin_object_key<W: ?Sized + io::Write>(&mut self, w: &mut W, first: bool) -> io::Result<()> {
        self.separator(w, first)
    }

    fn begin_object_value<W: ?Sized + io::Write>(&mut self, w: &mut W) -> io::Result<()> {
        w.write_all(b": ")
    }

    fn end_object_value<W: ?Sized + io::Write>(&mut self, _w: &mut W) -> io::Result<()> {
        self.has_value = true;
        Ok(())
    }

    fn write_string_fragment<W: ?Sized + io::Write>(&mut self, w: &mut W, fragment: &str) -> io::Result<()> {
        if !self.ensure_ascii || fragment.is_ascii() {
            return w.write_all(fragment.as_bytes());
        }
        let mut units = [0u16; 2];
        for c in fragment.chars() {
            if c.is_ascii() {
                w.write_all(&[c as u8])?;
            } else {
                for unit in c.encode_utf16(&mut units) {
                    write!(w, "\\u{unit:04x}")?;
                }
            }
        }
        Ok(())
    }
}

fn json(prelude: &Prelude) -> Value {
    let dumps = sealer::native(
        "dumps",
        "obj, indent=None, sort_keys=False, ensure_ascii=True",
        Some("Serialize obj to a JSON formatted str."),
        |interp, a| {
            let slots = a.parse("dumps", &["obj", "indent", "sort_keys", "ensure_ascii"], 1)?;
            let indent = match &slots[1] {
                None | Some(Value::None) => None,
                Some(Value::Int(n)) => Some(vec![b' '; (*n).max(0) as usize]),
                Some(Value::Str(s)) => Some(s.as_bytes().to_vec()),
                Some(other) => {
                    return Err(type_error(format!(
                        "indent must be an int or str, not {}",
                        other.type_name()
                    )));
                }
            };
            let sort_keys = match &slots[2] {
                Some(v) => interp.truthy(v)?,
                None => false,
            };
            let ensure_ascii = match &slots[3] {
                Some(v) => interp.truthy(v)?,
                None => true,
            };
            let obj = slots[0].clone().unwrap_or(Value::None);
            let doc = to_json(interp, &obj, sort_keys, 0)?;

            let mut buf = Vec::new();
            let formatter = GuestFormatter {
                indent,
                level: 0,
                has_value: false,
                ensure_ascii,
            };
            let mut ser = serde_json::Serializer::with_formatter(&mut buf, formatter);
            doc.serialize(&mut ser)
                .map_err(|e| value_error(format!("cannot serialize: {e}")))?;
            Ok(Value::str(&String::from_utf8_lossy(&buf)))
        },
    );
    let loads = sealer::native(
        "loads",
        "s",
        Some("Deserialize s (a str or bytes holding a JSON document) to a guest value."),
        |_, a| {
            let parts = a.exact("loads", 1, 1)?;
            let parsed: Result<serde_json::Value, _> = match &parts[0] {
                Value::Str(s) => serde_json::from_str(s),
                Value::Bytes(b) => serde_json::from_slice(b),
                other => {
                    return Err(type_error(format!(
                        "the JSON object must be str or bytes, not {}",
                        other.type_name()
                    )));
                }
            };
            parsed
                .map(from_json)
                .map_err(|e| value_error(format!("invalid JSON: {e}")))
        },
    );
    frozen_object(prelude, vec![("dumps", dumps), ("loads", loads)])
}

// ---------------------------------------------------------------------------
// re
// ---------------------------------------------------------------------------

struct Compiled {
    source: Rc<str>,
    flags: i64,
    search: Regex,
    anchored: Regex,
    full: Regex,
}

impl Compiled {
    fn new(pattern: &str, flags: i64) -> EvalResult<Rc<Self>> {
        let mut inline = String::new();
        if flags & IGNORECASE != 0 {
            inline.push('i');
        }
        if flags & MULTILINE != 0 {
            inline.push('m');
        }
        if flags & DOTALL != 0 {
            inline.push('s');
        }
        let prefix = if inline.is_empty() {
            String::new()
        } else {
            format!("(?{inline})")
        };
        let build = |body: String| {
            Regex::new(&format!("{prefix}{body}"))
                .map_err(|e| value_error(format!("invalid pattern {pattern:?}: {e}")))
        };
        Ok(Rc::new(Self {
            source: Rc::from(pattern),
            flags,
            search: build(pattern.to_string())?,
            anchored: build(format!(r"\A(?:{pattern})"))?,
            full: build(format!(r"\A(?:{pattern})\z"))?,
        }))
    }

    fn group_count(&self) -> usize {
        self.search.captures_len() - 1
    }

    fn names(&self) -> Rc<Vec<Option<String>>> {
        Rc::new(self.search.capture_names().map(|n| n.map(str::to_string)).collect())
    }
}

struct MatchData {
    subject: Rc<str>,
    spans: Vec<Option<(usize, usize)>>,
    names: Rc<Vec<Option<String>>>,
}

impl MatchData {
    fn new(subject: &Rc<str>, caps: &Captures, names: Rc<Vec<Option<String>>>) -> Self {
        Self {
            subject: subject.clone(),
            spans: (0..caps.len())
                .map(|i| caps.get(i).map(|m| (m.start(), m.end())))
                .collect(),
            names,
        }
    }

    fn index(&self, key: &Value) -> EvalResult<usize> {
        let found = match key {
            Value::Int(i) if *i >= 0 && (*i as usize) < self.spans.len() => Some(*i as usize),
            Value::Str(name) => self
                .names
                .iter()
                .position(|n| n.as_deref() == Some(&**name)),
            _ => None,
        };
        found.ok_or_else(|| index_error("no such group"))
    }

    fn group(&self, i: usize) -> Value {
        match self.spans[i] {
            Some((s, e)) => Value::str(&self.subject[s..e]),
            None => Value::None,
        }
    }

    fn span(&self, i: usize) -> (i64, i64) {
        let char_index = |byte: usize| self.subject[..byte].chars().count() as i64;
        match self.spans[i] {
            Some((s, e)) => (char_index(s), char_index(e)),
            None => (-1, -1),
        }
    }
}

fn group_arg(args: &Args, fname: &str) -> EvalResult<Value> {
    let parts = args.exact(fname, 0, 1)?;
    Ok(parts.first().cloned().unwrap_or(Value::Int(0)))
}

fn match_object(prelude: &Prelude, data: MatchData) -> Value {
    let data = Rc::new(data);
    let d = data.clone();
    let group = sealer::native("group", "*groups", None, move |_, a| {
        let parts = a.exact("group", 0, usize::MAX)?;
        match parts {
            [] => Ok(d.group(0)),
            [one] => Ok(d.group(d.index(one)?)),
            many => Ok(Value::tuple(
                many.iter()
                    .map(|k| d.index(k).map(|i| d.group(i)))
                    .collect::<EvalResult<_>>()?,
            )),
        }
    });
    let d = data.clone();
    let groups = sealer::native("groups", "default=None", None, move |_, a| {
        let parts = a.exact("groups", 0, 1)?;
        let default = parts.first().cloned().unwrap_or(Value::None);
        Ok(Value::tuple(
            (1..d.spans.len())
                .map(|i| match d.group(i) {
                    Value::None => default.clone(),
                    v => v,
                })
                .collect(),
        ))
    });
    let d = data.clone();
    let groupdict = sealer::native("groupdict", "", None, move |_, a| {
        a.exact("groupdict", 0, 0)?;
        let pairs = d
            .names
            .iter()
            .enumerate()
            .filter_map(|(i, n)| n.as_ref().map(|n| (MapKey::str(n), d.group(i))));
        Ok(Value::Mapping(Rc::new(LockedMapping::from_pairs(pairs))))
    });
    let d = data.clone();
    let start = sealer::native("start", "group=0", None, move |_, a| {
        Ok(Value::Int(d.span(d.index(&group_arg(&a, "start")?)?).0))
    });
    let d = data.clone();
    let end = sealer::native("end", "group=0", None, move |_, a| {
        Ok(Value::Int(d.span(d.index(&group_arg(&a, "end")?)?).1))
    });
    let d = data.clone();
    let span = sealer::native("span", "group=0", None, move |_, a| {
        let (s, e) = d.span(d.index(&group_arg(&a, "span")?)?);
        Ok(Value::tuple(vec![Value::Int(s), Value::Int(e)]))
    });
    frozen_object(
        prelude,
        vec![
            ("string", Value::Str(data.subject.clone())),
            ("group", group),
            ("groups", groups),
            ("groupdict", groupdict),
            ("start", start),
            ("end", end),
            ("span", span),
        ],
    )
}

fn subject_arg(v: &Value, fname: &str) -> EvalResult<Rc<str>> {
    match v {
        Value::Str(s) => Ok(s.clone()),
        other => Err(type_error(format!(
            "{fname}() expected string, not '{}'",
            other.type_name()
        ))),
    }
}

/// Translate a replacement template (`\1`, `\g<name>`) into the syntax
/// `Captures::expand` understands.
fn expand_template(template: &str) -> String {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '$' => out.push_str("$$"),
            '\\' => match chars.peek().copied() {
                Some(d) if d.is_ascii_digit() => {
                    let mut num = String::new();
                    while let Some(d) = chars.peek().copied()
                        && d.is_ascii_digit()
                        && num.len() < 2
                    {
                        num.push(d);
                        chars.next();
                    }
                    out.push_str(&format!("${{{num}}}"));
                }
                Some('g') => {
                    chars.next();
                    if chars.peek() == Some(&'<') {
                        chars.next();
                        let name: String = chars.by_ref().take_while(|c| *c != '>').collect();
                        out.push_str(&format!("${{{name}}}"));
                    } else {
                        out.push_str("\\g");
                    }
                }
                Some('n') => {
                    chars.next();
                    out.push('\n');
                }
                Some('t') => {
                    chars.next();
                    out.push('\t');
                }
                Some('\\') => {
                    chars.next();
                    out.push('\\');
                }
                _ => out.push('\\'),
            },
            c => out.push(c),
        }
    }
    out
}

fn search_op(interp: &Interpreter, compiled: &Compiled, op: &str, subject: &Rc<str>) -> Value {
    let regex = match op {
        "match" => &compiled.anchored,
        "fullmatch" => &compiled.full,
        _ => &compiled.search,
    };
    match regex.captures(subject) {
        Some(caps) => match_object(interp.prelude(), MatchData::new(subject, &caps, compiled.names())),
        None => Value::None,
    }
}

fn findall(compiled: &Compiled, subject: &str) -> Value {
    let groups = compiled.group_count();
    let text = |m: Option<regex::Match>| Value::str(m.map(|m| m.as_str()).unwrap_or(""));
    let found = compiled
        .search
        .captures_iter(subject)
        .map(|caps| match groups {
            0 => text(caps.get(0)),
            1 => text(caps.get(1)),
            n => Value::tuple((1..=n).map(|i| text(caps.get(i))).collect()),
        })
        .collect();
    Value::list(found)
}

fn substitute(
    interp: &Interpreter,
    compiled: &Compiled,
    repl: &Value,
    subject: &Rc<str>,
    count: i64,
) -> EvalResult<(String, i64)> {
    let template = match repl {
        Value::Str(s) => Some(expand_template(s)),
        _ => None,
    };
    let mut out = String::with_capacity(subject.len());
    let mut last = 0;
    let mut n = 0;
    for caps in compiled.search.captures_iter(subject) {
        if count > 0 && n >= count {
            break;
        }
        let Some(whole) = caps.get(0) else { continue };
        out.push_str(&subject[last..whole.start()]);
        match &template {
            Some(t) => caps.expand(t, &mut out),
            None => {
                let m = match_object(interp.prelude(), MatchData::new(subject, &caps, compiled.names()));
                match interp.call(repl, Args::new(vec![m]))? {
                    Value::Str(s) => out.push_str(&s),
                    other => {
                        return Err(type_error(format!(
                            "expected str instance, {} found",
                            other.type_name()
                        )));
                    }
                }
            }
        }
        last = whole.end();
        n += 1;
    }
    out.push_str(&subject[last..]);
    Ok((out, n))
}

fn split(compiled: &Compiled, subject: &str, maxsplit: i64) -> Value {
    let mut parts = Vec::new();
    let mut last = 0;
    let mut n = 0;
    for caps in compiled.search.captures_iter(subject) {
        if maxsplit > 0 && n >= maxsplit {
            break;
        }
        let Some(whole) = caps.get(0) else { continue };
        parts.push(Value::str(&subject[last..whole.start()]));
        for i in 1..caps.len() {
            parts.push(caps.get(i).map(|m| Value::str(m.as_str())).unwrap_or(Value::None));
        }
        last = whole.end();
        n += 1;
    }
    parts.push(Value::str(&subject[last..]));
    Value::list(parts)
}

fn count_arg(v: &Option<Value>, fname: &str) -> EvalResult<i64> {
    match v {
        None => Ok(0),
        Some(v) => int_arg(v, fname),
    }
}

/// A pattern argument is either source text or a compiled pattern object.
fn pattern_arg(pattern: &Value, flags: &Option<Value>) -> EvalResult<Rc<Compiled>> {
    let flags = count_arg(flags, "compile")?;
    match pattern {
        Value::Str(s) => Compiled::new(s, flags),
        Value::Object(obj) => match (obj.instance_attr("pattern"), obj.instance_attr("flags")) {
            (Some(Value::Str(s)), Some(Value::Int(f))) => Compiled::new(&s, f | flags),
            _ => Err(type_error("first argument must be string or compiled pattern")),
        },
        other => Err(type_error(format!(
            "first argument must be string or compiled pattern, not '{}'",
            other.type_name()
        ))),
    }
}

fn pattern_object(prelude: &Prelude, compiled: Rc<Compiled>) -> Value {
    let mut entries = vec![
        ("pattern", Value::Str(compiled.source.clone())),
        ("flags", Value::Int(compiled.flags)),
        ("groups", Value::Int(compiled.group_count() as i64)),
    ];
    for op in ["match", "fullmatch", "search"] {
        let c = compiled.clone();
        entries.push((
            op,
            sealer::native(op, "string", None, move |interp, a| {
                let parts = a.exact(op, 1, 1)?;
                Ok(search_op(interp, &c, op, &subject_arg(&parts[0], op)?))
            }),
        ));
    }
    let c = compiled.clone();
    entries.push((
        "findall",
        sealer::native("findall", "string", None, move |_, a| {
            let parts = a.exact("findall", 1, 1)?;
            Ok(findall(&c, &subject_arg(&parts[0], "findall")?))
        }),
    ));
    let c = compiled.clone();
    entries.push((
        "sub",
        sealer::native("sub", "repl, string, count=0", None, move |interp, a| {
            let slots = a.parse("sub", &["repl", "string", "count"], 2)?;
            let (repl, subject) = (slots[0].clone().unwrap_or(Value::None), slots[1].clone().unwrap_or(Value::None));
            let (out, _) = substitute(interp, &c, &repl, &subject_arg(&subject, "sub")?, count_arg(&slots[2], "sub")?)?;
            Ok(Value::str(&out))
        }),
    ));
    let c = compiled;
    entries.push((
        "split",
        sealer::native("split", "string, maxsplit=0", None, move |_, a| {
            let slots = a.parse("split", &["string", "maxsplit"], 1)?;
            let subject = slots[0].clone().unwrap_or(Value::None);
            Ok(split(&c, &subject_arg(&subject, "split")?, count_arg(&slots[1], "split")?))
        }),
    ));
    frozen_object(prelude, entries)
}

fn re(prelude: &Prelude) -> Value {
    let mut entries = vec![
        ("I", Value::Int(IGNORECASE)),
        ("IGNORECASE", Value::Int(IGNORECASE)),
        ("M", Value::Int(MULTILINE)),
        ("MULTILINE", Value::Int(MULTILINE)),
        ("S", Value::Int(DOTALL)),
        ("DOTALL", Value::Int(DOTALL)),
        (
            "compile",
            sealer::native(
                "compile",
                "pattern, flags=0",
                Some("Compile a regular expression pattern, returning a Pattern object."),
                |interp, a| {
                    let slots = a.parse("compile", &["pattern", "flags"], 1)?;
                    let pattern = slots[0].clone().unwrap_or(Value::None);
                    Ok(pattern_object(interp.prelude(), pattern_arg(&pattern, &slots[1])?))
                },
            ),
        ),
        (
            "escape",
            sealer::native("escape", "pattern", Some("Escape special characters in a string."), |_, a| {
                let parts = a.exact("escape", 1, 1)?;
                Ok(Value::str(&regex::escape(&subject_arg(&parts[0], "escape")?)))
            }),
        ),
    ];
    for op in ["match", "fullmatch", "search"] {
        entries.push((
            op,
            sealer::native(op, "pattern, string, flags=0", None, move |interp, a| {
                let slots = a.parse(op, &["pattern", "string", "flags"], 2)?;
                let pattern = slots[0].clone().unwrap_or(Value::None);
                let subject = slots[1].clone().unwrap_or(Value::None);
                let compiled = pattern_arg(&pattern, &slots[2])?;
                Ok(search_op(interp, &compiled, op, &subject_arg(&subject, op)?))
            }),
        ));
    }
    entries.push((
        "findall",
        sealer::native("findall", "pattern, string, flags=0", None, |_, a| {
            let slots = a.parse("findall", &["pattern", "string", "flags"], 2)?;
            let pattern = slots[0].clone().unwrap_or(Value::None);
            let subject = slots[1].clone().unwrap_or(Value::None);
            let compiled = pattern_arg(&pattern, &slots[2])?;
            Ok(findall(&compiled, &subject_arg(&subject, "findall")?))
        }),
    ));
    entries.push((
        "sub",
        sealer::native("sub", "pattern, repl, string, count=0, flags=0", None, |interp, a| {
            let slots = a.parse("sub", &["pattern", "repl", "string", "count", "flags"], 3)?;
            let pattern = slots[0].clone().unwrap_or(Value::None);
            let repl = slots[1].clone().unwrap_or(Value::None);
            let subject = slots[2].clone().unwrap_or(Value::None);
            let compiled = pattern_arg(&pattern, &slots[4])?;
            let (out, _) = substitute(
                interp,
                &compiled,
                &repl,
                &subject_arg(&subject, "sub")?,
                count_arg(&slots[3], "sub")?,
            )?;
            Ok(Value::str(&out))
        }),
    ));
    entries.push((
        "subn",
        sealer::native("subn", "pattern, repl, string, count=0, flags=0", None, |interp, a| {
            let slots = a.parse("subn", &["pattern", "repl", "string", "count", "flags"], 3)?;
            let pattern = slots[0].clone().unwrap_or(Value::None);
            let repl = slots[1].clone().unwrap_or(Value::None);
            let subject = slots[2].clone().unwrap_or(Value::None);
            let compiled = pattern_arg(&pattern, &slots[4])?;
            let (out, n) = substitute(
                interp,
                &compiled,
                &repl,
                &subject_arg(&subject, "subn")?,
                count_arg(&slots[3], "subn")?,
            )?;
            Ok(Value::tuple(vec![Value::str(&out), Value::Int(n)]))
        }),
    ));
    entries.push((
        "split",
        sealer::native("split", "pattern, string, maxsplit=0, flags=0", None, |_, a| {
            let slots = a.parse("split", &["pattern", "string", "maxsplit", "flags"], 2)?;
            let pattern = slots[0].clone().unwrap_or(Value::None);
            let subject = slots[1].clone().unwrap_or(Value::None);
            let compiled = pattern_arg(&pattern, &slots[3])?;
            Ok(split(&compiled, &subject_arg(&subject, "split")?, count_arg(&slots[2], "split")?))
        }),
    ));
    frozen_object(prelude, entries)
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
        for (name, module) in modules(interp.prelude()) {
            scope.set(name, module);
        }
        interp
            .run_source(src, &scope, "<test>", false)
            .map(|_| output(&buf))
            .map_err(|e| e.to_string())
    }

    #[test]
    fn test_math_functions_and_domain_errors() {
        let out = run(
            "print(math.sqrt(16), math.floor(2.7), math.ceil(2.1), math.gcd(12, 18), math.factorial(5))\n\
             print(round(math.log(8, 2), 6), math.isnan(math.nan), math.pi > 3)\n\
             try:\n    math.sqrt(-1)\nexcept ValueError as e:\n    print(e)\n",
        )
        .unwrap();
        assert_eq!(out, "4.0 2 3 6 120\n3.0 True True\nmath domain error\n");
    }

    #[test]
    fn test_json_round_trip_matches_guest_layout() {
        let out = run(
            "s = json.dumps({'b': [1, 2.5, None], 'a': True})\nprint(s)\n\
             print(json.dumps({'b': 1, 'a': 2}, sort_keys=True))\n\
             print(json.dumps([1, {'k': 'v'}], indent=2))\n\
             print(json.dumps('caf\\u00e9'))\n\
             d = json.loads(s)\nprint(d['b'], d['a'])\n",
        )
        .unwrap();
        assert_eq!(
            out,
            "{\"b\": [1, 2.5, null], \"a\": true}\n{\"a\": 2, \"b\": 1}\n\
             [\n  1,\n  {\n    \"k\": \"v\"\n  }\n]\n\"caf\\u00e9\"\n[1, 2.5, None] True\n"
        );
    }

    #[test]
    fn test_json_rejects_unserializable_and_bad_input() {
        let err = run("json.dumps(object())").unwrap_err();
        assert!(err.starts_with("TypeError"), "{err}");
        let err = run("json.loads('{')").unwrap_err();
        assert!(err.starts_with("ValueError"), "{err}");
    }

    #[test]
    fn test_re_operations() {
        let out = run(
            "m = re.match(r'(\\w+)-(\\d+)', 'item-42 rest')\n\
             print(m.group(0), m.group(2), m.groups(), m.span(1))\n\
             print(re.match('x', 'ax'), re.search('x', 'ax').start())\n\
             print(re.findall(r'\\d+', 'a1b22c333'), re.split(r',\\s*', 'a, b,c'))\n\
             print(re.sub(r'(\\w)(\\d)', r'\\2\\1', 'a1 b2'), re.sub('o', lambda m: '0', 'foo', count=1))\n\
             p = re.compile('HELLO', re.I)\nprint(p.fullmatch('hello') is not None, p.pattern)\n",
        )
        .unwrap();
        assert_eq!(
            out,
            "item-42 42 ('item', '42') (0, 4)\nNone 1\n['1', '22', '333'] ['a', 'b', 'c']\n1a 2b f0o\nTrue HELLO\n"
        );
    }

    #[test]
    fn test_stdlib_objects_are_frozen() {
        let err = run("math.pi = 3").unwrap_err();
        assert!(err.starts_with("LockedValueError"), "{err}");
        let out = run("print(math.sqrt)").unwrap();
        assert_eq!(out, "function(x)\n");
    }

    #[test]
    fn test_expand_template() {
        assert_eq!(expand_template(r"\1-\g<word>$"), "${1}-${word}$$");
    }
}
