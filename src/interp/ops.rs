//! Operators, conversions and the container protocol.

use std::cmp::Ordering;
use std::rc::Rc;

use super::{EvalResult, Interpreter, error, index_error, key_error, type_error, value_error};
use crate::error::ErrorKind;
use crate::kernel::format;
use crate::kernel::store::MapKey;
use crate::kernel::value::{Args, Descriptor, Value};
use crate::script::ast::{BinOp, UnaryOp};

impl Interpreter {
    pub fn repr(&self, value: &Value) -> EvalResult<String> {
        Ok(match value {
            Value::None => "None".into(),
            Value::Bool(true) => "True".into(),
            Value::Bool(false) => "False".into(),
            Value::Int(i) => i.to_string(),
            Value::Float(f) => float_repr(*f),
            Value::Str(s) => str_repr(s),
            Value::Bytes(b) => bytes_repr(b),
            Value::List(items) => {
                let items = items.borrow().clone();
                return self.guarded(value, "[...]", |interp| {
                    Ok(format!("[{}]", interp.join_reprs(&items)?))
                });
            }
            Value::Tuple(items) => {
                if items.len() == 1 {
                    return self.descend("while getting the repr of an object", |interp| {
                        Ok(format!("({},)", interp.repr(&items[0])?))
                    });
                }
                return self.guarded(value, "(...)", |interp| {
                    Ok(format!("({})", interp.join_reprs(items)?))
                });
            }
            Value::Mapping(m) => {
                return self.guarded(value, "{...}", |interp| {
                    let mut parts = Vec::with_capacity(m.len());
                    for (k, v) in m.items() {
                        parts.push(format!("{}: {}", interp.repr(&k.to_value())?, interp.repr(&v)?));
                    }
                    Ok(format!("{{{}}}", parts.join(", ")))
                });
            }
            Value::Object(o) => {
                if let Some(hook) = self.class_hook(value, "__repr__")? {
                    return self.hook_string(&hook, "__repr__");
                }
                if let Some(state) = o.exception_state() {
                    let args = state.args();
                    let inner = match args.as_slice() {
                        [one] => self.repr(one)?,
                        many => self.join_reprs(many)?,
                    };
                    return Ok(format!("{}({inner})", o.class().name()));
                }
                if o.is_exports() {
                    return Ok(format!("<{}>", o.label()));
                }
                format!("<{} object>", o.class().name())
            }
            Value::Type(t) => format!("<class '{}'>", t.name()),
            Value::Function(f) => format!("<function {}>", f.name()),
            Value::Native(n) => format!("<built-in function {}>", n.name),
            Value::Bound(b) => match &b.func {
                Value::Function(f) => format!("<bound method {}>", f.name()),
                Value::Native(n) => format!("<bound method {}>", n.name),
                _ => "<bound method>".into(),
            },
            Value::Capability(c) => format!("function({})", c.signature),
            Value::Descriptor(d) => match **d {
                Descriptor::Property { .. } => "<property object>".into(),
                Descriptor::ClassMethod(_) => "<classmethod object>".into(),
                Descriptor::StaticMethod(_) => "<staticmethod object>".into(),
            },
            Value::Super(s) => format!("<super: <class '{}'>>", s.start.name()),
            Value::Code(c) => format!("<code object {}>", c.def.name),
            Value::Cell(_) => "<cell>".into(),
            Value::Scope(_) => "<scope>".into(),
        })
    }

    /// Render a container once; a container reached again while it is
    /// being rendered shows as `marker`.
    fn guarded(
        &self,
        value: &Value,
        marker: &str,
        render: impl FnOnce(&Self) -> EvalResult<String>,
    ) -> EvalResult<String> {
        let id = value.identity();
        if !self.repr_guard.borrow_mut().insert(id) {
            return Ok(marker.to_string());
        }
        let result = self.descend("while getting the repr of an object", render);
        self.repr_guard.borrow_mut().remove(&id);
        result
    }

    fn join_reprs(&self, items: &[Value]) -> EvalResult<String> {
        let parts = items
            .iter()
            .map(|v| self.repr(v))
            .collect::<EvalResult<Vec<_>>>()?;
        Ok(parts.join(", "))
    }

    fn hook_string(&self, hook: &Value, name: &str) -> EvalResult<String> {
        match self.call(hook, Args::default())? {
            Value::Str(s) => Ok(s.to_string()),
            other => Err(type_error(format!(
                "{name} returned non-string (type {})",
                other.type_name()
            ))),
        }
    }

    /// `str(value)`.
    pub fn to_str(&self, value: &Value) -> EvalResult<String> {
        match value {
            Value::Str(s) => Ok(s.to_string()),
            Value::Object(o) => {
                if let Some(hook) = self.class_hook(value, "__str__")? {
                    return self.hook_string(&hook, "__str__");
                }
                if let Some(state) = o.exception_state() {
                    return match state.args().as_slice() {
                        [] => Ok(String::new()),
                        [one] => self.to_str(one),
                        many => self.repr(&Value::tuple(many.to_vec())),
                    };
                }
                self.repr(value)
            }
            other => self.repr(other),
        }
    }

    pub fn truthy(&self, value: &Value) -> EvalResult<bool> {
        Ok(match value {
            Value::None => false,
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::Float(f) => *f != 0.0,
            Value::Str(s) => !s.is_empty(),
            Value::Bytes(b) => !b.is_empty(),
            Value::List(l) => !l.borrow().is_empty(),
            Value::Tuple(t) => !t.is_empty(),
            Value::Mapping(m) => !m.is_empty(),
            Value::Object(_) => match self.class_hook(value, "__len__")? {
                Some(_) => self.len(value)? != 0,
                None => true,
            },
            _ => true,
        })
    }

    pub fn eq(&self, a: &Value, b: &Value) -> EvalResult<bool> {
        if let Some(r) = numeric_pair(a, b) {
            return Ok(match r {
                (Num::Int(x), Num::Int(y)) => x == y,
                (x, y) => x.float() == y.float(),
            });
        }
        Ok(match (a, b) {
            (Value::None, Value::None) => true,
            (Value::Str(x), Value::Str(y)) => x == y,
            (Value::Bytes(x), Value::Bytes(y)) => x == y,
            (Value::List(x), Value::List(y)) => {
                if Rc::ptr_eq(x, y) {
                    return Ok(true);
                }
                let (x, y) = (x.borrow().clone(), y.borrow().clone());
                self.seq_eq(&x, &y)?
            }
            (Value::Tuple(x), Value::Tuple(y)) => self.seq_eq(x, y)?,
            (Value::Mapping(x), Value::Mapping(y)) => {
                if x.len() != y.len() {
                    return Ok(false);
                }
                self.descend("in comparison", |interp| {
                    for (k, v) in x.items() {
                        match y.get(&k) {
                            Some(w) if interp.eq(&v, &w)? => {}
                            _ => return Ok(false),
                        }
                    }
                    Ok(true)
                })?
            }
            (Value::Object(_), _) | (_, Value::Object(_)) => {
                for (lhs, rhs) in [(a, b), (b, a)] {
                    if let Some(hook) = self.class_hook(lhs, "__eq__")? {
                        let r = self.call(&hook, Args::new(vec![rhs.clone()]))?;
                        return self.truthy(&r);
                    }
                }
                a.same(b)
            }
            _ => a.same(b),
        })
    }

    fn seq_eq(&self, x: &[Value], y: &[Value]) -> EvalResult<bool> {
        if x.len() != y.len() {
            return Ok(false);
        }
        self.descend("in comparison", |interp| {
            for (a, b) in x.iter().zip(y) {
                if !interp.eq(a, b)? {
                    return Ok(false);
                }
            }
            Ok(true)
        })
    }

    /// Ordering for `<`, `<=`, `>`, `>=` and sorting.
    pub fn order(&self, a: &Value, b: &Value, op: &str) -> EvalResult<Ordering> {
        if let Some(pair) = numeric_pair(a, b) {
            return match pair {
                (Num::Int(x), Num::Int(y)) => Ok(x.cmp(&y)),
                (x, y) => x
                    .float()
                    .partial_cmp(&y.float())
                    .ok_or_else(|| value_error("cannot order NaN")),
            };
        }
        match (a, b) {
            (Value::Str(x), Value::Str(y)) => Ok(x.cmp(y)),
            (Value::Bytes(x), Value::Bytes(y)) => Ok(x.cmp(y)),
            (Value::List(x), Value::List(y)) => {
                let (x, y) = (x.borrow().clone(), y.borrow().clone());
                self.seq_order(&x, &y, op)
            }
            (Value::Tuple(x), Value::Tuple(y)) => self.seq_order(x, y, op),
            _ => Err(type_error(format!(
                "'{op}' not supported between instances of '{}' and '{}'",
                a.type_name(),
                b.type_name()
            ))),
        }
    }

    fn seq_order(&self, x: &[Value], y: &[Value], op: &str) -> EvalResult<Ordering> {
        self.descend("in comparison", |interp| {
            for (a, b) in x.iter().zip(y) {
                if !interp.eq(a, b)? {
                    return interp.order(a, b, op);
                }
            }
            Ok(x.len().cmp(&y.len()))
        })
    }

    /// Stable sort by an optional key function.
    pub fn sort_values(&self, items: &mut Vec<Value>, key: Option<&Value>, reverse: bool) -> EvalResult<()> {
        let keys = match key {
            Some(f) => items
                .iter()
                .map(|v| self.call(f, Args::new(vec![v.clone()])))
                .collect::<EvalResult<Vec<_>>>()?,
            None => items.clone(),
        };
        let mut indexed: Vec<(Value, Value)> = keys.into_iter().zip(items.drain(..)).collect();
        let mut failure = None;
        indexed.sort_by(|(ka, _), (kb, _)| {
            if failure.is_some() {
                return Ordering::Equal;
            }
            let ord = match self.order(ka, kb, "<") {
                Ok(o) => o,
                Err(e) => {
                    failure = Some(e);
                    Ordering::Equal
                }
            };
            if reverse { ord.reverse() } else { ord }
        });
        items.extend(indexed.into_iter().map(|(_, v)| v));
        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub fn binary(&self, op: BinOp, a: &Value, b: &Value) -> EvalResult<Value> {
        if let Some(pair) = numeric_pair(a, b) {
            return match pair {
                (Num::Int(x), Num::Int(y)) => int_op(op, x, y),
                (x, y) => float_op(op, x.float(), y.float()),
            };
        }
        let unsupported = || {
            type_error(format!(
                "unsupported operand type(s) for {}: '{}' and '{}'",
                op.symbol(),
                a.type_name(),
                b.type_name()
            ))
        };
        match (op, a, b) {
            (BinOp::Add, Value::Str(x), Value::Str(y)) => Ok(Value::from(format!("{x}{y}"))),
            (BinOp::Add, Value::Bytes(x), Value::Bytes(y)) => {
                Ok(Value::bytes(&[x.as_ref(), y.as_ref()].concat()))
            }
            (BinOp::Add, Value::List(x), Value::List(y)) => {
                let mut out = x.borrow().clone();
                out.extend(y.borrow().iter().cloned());
                Ok(Value::list(out))
            }
            (BinOp::Add, Value::Tuple(x), Value::Tuple(y)) => {
                Ok(Value::tuple(x.iter().chain(y.iter()).cloned().collect()))
            }
            (BinOp::Mul, seq, Value::Int(n)) | (BinOp::Mul, Value::Int(n), seq) => {
                let n = (*n).max(0) as usize;
                match seq {
                    Value::Str(s) => Ok(Value::from(s.repeat(n))),
                    Value::Bytes(bytes) => Ok(Value::bytes(&bytes.repeat(n))),
                    Value::List(l) => Ok(Value::list(repeat(&l.borrow(), n))),
                    Value::Tuple(t) => Ok(Value::tuple(repeat(t, n))),
                    _ => Err(unsupported()),
                }
            }
            (BinOp::Mod, Value::Str(fmt), args) => {
                Ok(Value::from(format::percent_format(self, fmt, args)?))
            }
            _ => Err(unsupported()),
        }
    }

    pub fn unary(&self, op: UnaryOp, v: &Value) -> EvalResult<Value> {
        match (op, v) {
            (UnaryOp::Not, v) => Ok(Value::Bool(!self.truthy(v)?)),
            (UnaryOp::Neg, Value::Float(f)) => Ok(Value::Float(-f)),
            (UnaryOp::Pos, Value::Float(f)) => Ok(Value::Float(*f)),
            (op, v) => {
                let Some(i) = v.as_int() else {
                    return Err(type_error(format!(
                        "bad operand type for unary operator: '{}'",
                        v.type_name()
                    )));
                };
                match op {
                    UnaryOp::Neg => i.checked_neg().map(Value::Int).ok_or_else(overflow),
                    UnaryOp::Pos => Ok(Value::Int(i)),
                    _ => Ok(Value::Int(!i)),
                }
            }
        }
    }

    /// Materialise an iterable.
    pub fn iterate(&self, v: &Value) -> EvalResult<Vec<Value>> {
        match v {
            Value::List(l) => Ok(l.borrow().clone()),
            Value::Tuple(t) => Ok(t.to_vec()),
            Value::Str(s) => Ok(s.chars().map(|c| Value::from(c.to_string())).collect()),
            Value::Bytes(b) => Ok(b.iter().map(|x| Value::Int(*x as i64)).collect()),
            Value::Mapping(m) => Ok(m.keys().iter().map(MapKey::to_value).collect()),
            Value::Object(_) => match self.class_hook(v, "__iter__")? {
                Some(hook) => {
                    let result = self.call(&hook, Args::default())?;
                    if result.same(v) {
                        return Err(type_error("__iter__ must return an iterable other than the object itself"));
                    }
                    self.iterate(&result)
                }
                None => Err(not_iterable(v)),
            },
            _ => Err(not_iterable(v)),
        }
    }

    pub fn contains(&self, container: &Value, item: &Value) -> EvalResult<bool> {
        match container {
            Value::Str(s) => match item {
                Value::Str(needle) => Ok(s.contains(needle.as_ref())),
                other => Err(type_error(format!(
                    "'in <string>' requires string as left operand, not {}",
                    other.type_name()
                ))),
            },
            Value::Bytes(b) => match item {
                Value::Int(i) => Ok(b.iter().any(|x| *x as i64 == *i)),
                Value::Bytes(needle) => Ok(needle.is_empty()
                    || b.windows(needle.len()).any(|w| w == needle.as_ref())),
                _ => Err(type_error("a bytes-like object or int is required")),
            },
            Value::Mapping(m) => Ok(m.contains(&self.map_key(item)?)),
            Value::Object(_) => match self.class_hook(container, "__contains__")? {
                Some(hook) => {
                    let r = self.call(&hook, Args::new(vec![item.clone()]))?;
                    self.truthy(&r)
                }
                None => self.contains_any(&self.iterate(container)?, item),
            },
            other => self.contains_any(&self.iterate(other)?, item),
        }
    }

    fn contains_any(&self, items: &[Value], item: &Value) -> EvalResult<bool> {
        for v in items {
            if v.same(item) || self.eq(v, item)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    pub fn len(&self, v: &Value) -> EvalResult<usize> {
        match v {
            Value::Str(s) => Ok(s.chars().count()),
            Value::Bytes(b) => Ok(b.len()),
            Value::List(l) => Ok(l.borrow().len()),
            Value::Tuple(t) => Ok(t.len()),
            Value::Mapping(m) => Ok(m.len()),
            Value::Object(_) => match self.class_hook(v, "__len__")? {
                Some(hook) => match self.call(&hook, Args::default())? {
                    Value::Int(n) if n >= 0 => Ok(n as usize),
                    Value::Int(_) => Err(value_error("__len__() should return >= 0")),
                    other => Err(type_error(format!(
                        "'{}' object cannot be interpreted as an integer",
                        other.type_name()
                    ))),
                },
                None => Err(no_len(v)),
            },
            _ => Err(no_len(v)),
        }
    }

    pub fn map_key(&self, v: &Value) -> EvalResult<MapKey> {
        MapKey::from_value(v)
            .ok_or_else(|| type_error(format!("unhashable type: '{}'", v.type_name())))
    }

    pub fn get_item(&self, obj: &Value, key: &Value) -> EvalResult<Value> {
        match obj {
            Value::List(l) => {
                let l = l.borrow();
                let i = seq_index(key, l.len(), "list")?;
                Ok(l[i].clone())
            }
            Value::Tuple(t) => Ok(t[seq_index(key, t.len(), "tuple")?].clone()),
            Value::Str(s) => {
                let chars: Vec<char> = s.chars().collect();
                let i = seq_index(key, chars.len(), "string")?;
                Ok(Value::from(chars[i].to_string()))
            }
            Value::Bytes(b) => Ok(Value::Int(b[seq_index(key, b.len(), "bytes")?] as i64)),
            Value::Mapping(m) => {
                let k = self.map_key(key)?;
                m.get(&k).ok_or_else(|| key_error(self.repr(key).unwrap_or_default()))
            }
            Value::Object(_) => match self.class_hook(obj, "__getitem__")? {
                Some(hook) => self.call(&hook, Args::new(vec![key.clone()])),
                None => Err(not_subscriptable(obj)),
            },
            _ => Err(not_subscriptable(obj)),
        }
    }

    pub fn set_item(&self, obj: &Value, key: Value, value: Value) -> EvalResult<()> {
        match obj {
            Value::List(l) => {
                let mut l = l.borrow_mut();
                let i = seq_index(&key, l.len(), "list")?;
                l[i] = value;
                Ok(())
            }
            Value::Mapping(m) => Ok(m.insert(self.map_key(&key)?, value)?),
            Value::Object(_) => match self.class_hook(obj, "__setitem__")? {
                Some(hook) => {
                    self.call(&hook, Args::new(vec![key, value]))?;
                    Ok(())
                }
                None => Err(no_assignment(obj)),
            },
            _ => Err(no_assignment(obj)),
        }
    }

    pub fn del_item(&self, obj: &Value, key: &Value) -> EvalResult<()> {
        match obj {
            Value::List(l) => {
                let mut l = l.borrow_mut();
                let i = seq_index(key, l.len(), "list")?;
                l.remove(i);
                Ok(())
            }
            Value::Mapping(m) => match m.remove(&self.map_key(key)?)? {
                Some(_) => Ok(()),
                None => Err(key_error(self.repr(key)?)),
            },
            Value::Object(_) => match self.class_hook(obj, "__delitem__")? {
                Some(hook) => {
                    self.call(&hook, Args::new(vec![key.clone()]))?;
                    Ok(())
                }
                None => Err(no_deletion(obj)),
            },
            _ => Err(no_deletion(obj)),
        }
    }

    pub fn slice(&self, obj: &Value, lo: Option<i64>, hi: Option<i64>, step: Option<i64>) -> EvalResult<Value> {
        let step = slice_step(step)?;
        match obj {
            Value::List(l) => {
                let l = l.borrow();
                Ok(Value::list(
                    slice_indices(l.len(), lo, hi, step).into_iter().map(|i| l[i].clone()).collect(),
                ))
            }
            Value::Tuple(t) => Ok(Value::tuple(
                slice_indices(t.len(), lo, hi, step).into_iter().map(|i| t[i].clone()).collect(),
            )),
            Value::Str(s) => {
                let chars: Vec<char> = s.chars().collect();
                Ok(Value::from(
                    slice_indices(chars.len(), lo, hi, step)
                        .into_iter()
                        .map(|i| chars[i])
                        .collect::<String>(),
                ))
            }
            Value::Bytes(b) => Ok(Value::bytes(
                &slice_indices(b.len(), lo, hi, step).into_iter().map(|i| b[i]).collect::<Vec<_>>(),
            )),
            _ => Err(not_subscriptable(obj)),
        }
    }

    pub fn set_slice(&self, obj: &Value, lo: Option<i64>, hi: Option<i64>, step: Option<i64>, value: Value) -> EvalResult<()> {
        let Value::List(l) = obj else {
            return Err(no_assignment(obj));
        };
        let items = self.iterate(&value)?;
        let step = slice_step(step)?;
        let mut list = l.borrow_mut();
        let indices = slice_indices(list.len(), lo, hi, step);
        if step == 1 {
            let start = indices
                .first()
                .copied()
                .unwrap_or_else(|| clamp_start(lo, list.len()));
            let end = start + indices.len();
            list.splice(start..end, items);
            return Ok(());
        }
        if indices.len() != items.len() {
            return Err(value_error(format!(
                "attempt to assign sequence of size {} to extended slice of size {}",
                items.len(),
                indices.len()
            )));
        }
        for (i, v) in indices.into_iter().zip(items) {
            list[i] = v;
        }
        Ok(())
    }

    pub fn del_slice(&self, obj: &Value, lo: Option<i64>, hi: Option<i64>, step: Option<i64>) -> EvalResult<()> {
        let Value::List(l) = obj else {
            return Err(no_deletion(obj));
        };
        let step = slice_step(step)?;
        let mut list = l.borrow_mut();
        let mut indices = slice_indices(list.len(), lo, hi, step);
        indices.sort_unstable();
        for i in indices.into_iter().rev() {
            list.remove(i);
        }
        Ok(())
    }
}

#[derive(Clone, Copy)]
enum Num {
    Int(i64),
    Float(f64),
}

impl Num {
    fn float(self) -> f64 {
        match self {
            Num::Int(i) => i as f64,
            Num::Float(f) => f,
        }
    }
}

fn numeric(v: &Value) -> Option<Num> {
    match v {
        Value::Bool(b) => Some(Num::Int(*b as i64)),
        Value::Int(i) => Some(Num::Int(*i)),
        Value::Float(f) => Some(Num::Float(*f)),
        _ => None,
    }
}

fn numeric_pair(a: &Value, b: &Value) -> Option<(Num, Num)> {
    Some((numeric(a)?, numeric(b)?))
}

fn overflow() -> Box<super::GuestError> {
    error(ErrorKind::OverflowError, "integer overflow")
}

fn zero_division(what: &str) -> Box<super::GuestError> {
    error(ErrorKind::ZeroDivisionError, what)
}

fn int_op(op: BinOp, x: i64, y: i64) -> EvalResult<Value> {
    let checked = |r: Option<i64>| r.map(Value::Int).ok_or_else(overflow);
    match op {
        BinOp::Add => checked(x.checked_add(y)),
        BinOp::Sub => checked(x.checked_sub(y)),
        BinOp::Mul => checked(x.checked_mul(y)),
        BinOp::Div => {
            if y == 0 {
                return Err(zero_division("division by zero"));
            }
            Ok(Value::Float(x as f64 / y as f64))
        }
        BinOp::FloorDiv => {
            if y == 0 {
                return Err(zero_division("integer division or modulo by zero"));
            }
            let q = x.checked_div(y).ok_or_else(overflow)?;
            Ok(Value::Int(if x % y != 0 && ((x < 0) != (y < 0)) { q - 1 } else { q }))
        }
        BinOp::Mod => {
            if y == 0 {
                return Err(zero_division("integer division or modulo by zero"));
            }
            let r = x.checked_rem(y).unwrap_or(0);
            Ok(Value::Int(if r != 0 && ((r < 0) != (y < 0)) { r + y } else { r }))
        }
        BinOp::Pow => {
            if y < 0 {
                return Ok(Value::Float((x as f64).powf(y as f64)));
            }
            let exp = u32::try_from(y).map_err(|_| overflow())?;
            checked(x.checked_pow(exp))
        }
        BinOp::BitAnd => Ok(Value::Int(x & y)),
        BinOp::BitOr => Ok(Value::Int(x | y)),
        BinOp::BitXor => Ok(Value::Int(x ^ y)),
        BinOp::LShift => {
            if y < 0 {
                return Err(value_error("negative shift count"));
            }
            if x == 0 {
                return Ok(Value::Int(0));
            }
            if y >= 63 {
                return Err(overflow());
            }
            checked(x.checked_mul(1i64 << y))
        }
        BinOp::RShift => {
            if y < 0 {
                return Err(value_error("negative shift count"));
            }
            Ok(Value::Int(if y >= 64 { if x < 0 { -1 } else { 0 } } else { x >> y }))
        }
    }
}

fn float_op(op: BinOp, x: f64, y: f64) -> EvalResult<Value> {
    let v = match op {
        BinOp::Add => x + y,
        BinOp::Sub => x - y,
        BinOp::Mul => x * y,
        BinOp::Div => {
            if y == 0.0 {
                return Err(zero_division("float division by zero"));
            }
            x / y
        }
        BinOp::FloorDiv => {
            if y == 0.0 {
                return Err(zero_division("float floor division by zero"));
            }
            (x / y).floor()
        }
        BinOp::Mod => {
            if y == 0.0 {
                return Err(zero_division("float modulo"));
            }
            let r = x % y;
            if r != 0.0 && ((r < 0.0) != (y < 0.0)) { r + y } else { r }
        }
        BinOp::Pow => x.powf(y),
        _ => {
            return Err(type_error(format!(
                "unsupported operand type(s) for {}: 'float'",
                op.symbol()
            )));
        }
    };
    Ok(Value::Float(v))
}

fn repeat(items: &[Value], n: usize) -> Vec<Value> {
    (0..n).flat_map(|_| items.iter().cloned()).collect()
}

fn seq_index(key: &Value, len: usize, what: &str) -> EvalResult<usize> {
    let Some(i) = key.as_int() else {
        return Err(type_error(format!(
            "{what} indices must be integers, not {}",
            key.type_name()
        )));
    };
    let idx = if i < 0 { i + len as i64 } else { i };
    if idx < 0 || idx >= len as i64 {
        return Err(index_error(format!("{what} index out of range")));
    }
    Ok(idx as usize)
}

fn slice_step(step: Option<i64>) -> EvalResult<i64> {
    match step {
        Some(0) => Err(value_error("slice step cannot be zero")),
        Some(s) => Ok(s),
        None => Ok(1),
    }
}

fn clamp_start(lo: Option<i64>, len: usize) -> usize {
    let len = len as i64;
    match lo {
        None => 0,
        Some(v) if v < 0 => (v + len).max(0) as usize,
        Some(v) => v.min(len) as usize,
    }
}

/// Indices selected by `[start:stop:step]` over a sequence of `len` items.
pub(crate) fn slice_indices(len: usize, start: Option<i64>, stop: Option<i64>, step: i64) -> Vec<usize> {
    let len = len as i64;
    let (lower, upper) = if step > 0 { (0, len) } else { (-1, len - 1) };
    let adjust = |v: Option<i64>, default: i64| match v {
        None => default,
        Some(v) if v < 0 => (v + len).max(lower),
        Some(v) => v.min(upper),
    };
    let start = adjust(start, if step > 0 { lower } else { upper });
    let stop = adjust(stop, if step > 0 { upper } else { lower });
    let mut out = Vec::new();
    let mut i = start;
    while (step > 0 && i < stop) || (step < 0 && i > stop) {
        out.push(i as usize);
        i += step;
    }
    out
}

fn not_iterable(v: &Value) -> Box<super::GuestError> {
    type_error(format!("'{}' object is not iterable", v.type_name()))
}

fn no_len(v: &Value) -> Box<super::GuestError> {
    type_error(format!("object of type '{}' has no len()", v.type_name()))
}

fn not_subscriptable(v: &Value) -> Box<super::GuestError> {
    type_error(format!("'{}' object is not subscriptable", v.type_name()))
}

fn no_assignment(v: &Value) -> Box<super::GuestError> {
    type_error(format!(
        "'{}' object does not support item assignment",
        v.type_name()
    ))
}

fn no_deletion(v: &Value) -> Box<super::GuestError> {
    type_error(format!(
        "'{}' object does not support item deletion",
        v.type_name()
    ))
}

pub(crate) fn float_repr(f: f64) -> String {
    if f.is_nan() {
        return "nan".into();
    }
    if f.is_infinite() {
        return if f > 0.0 { "inf" } else { "-inf" }.into();
    }
    let abs = f.abs();
    if abs != 0.0 && !(1e-4..1e16).contains(&abs) {
        // Rust renders 1e20 / 1.5e-5; the guest language shows 1e+20 / 1.5e-05.
        let s = format!("{f:e}");
        let (mantissa, exp) = s.split_once('e').unwrap_or((&s, "0"));
        let (sign, digits) = match exp.strip_prefix('-') {
            Some(d) => ('-', d),
            None => ('+', exp),
        };
        return format!("{mantissa}e{sign}{digits:0>2}");
    }
    if f.fract() == 0.0 {
        return format!("{f:.1}");
    }
    format!("{f}")
}

pub(crate) fn str_repr(s: &str) -> String {
    let quote = if s.contains('\'') && !s.contains('"') { '"' } else { '\'' };
    let mut out = String::with_capacity(s.len() + 2);
    out.push(quote);
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c == quote => {
                out.push('\\');
                out.push(c);
            }
            c if (c as u32) < 0x20 || c as u32 == 0x7f => out.push_str(&format!("\\x{:02x}", c as u32)),
            c => out.push(c),
        }
    }
    out.push(quote);
    out
}

fn bytes_repr(b: &[u8]) -> String {
    let mut out = String::from("b'");
    for &byte in b {
        match byte {
            b'\\' => out.push_str("\\\\"),
            b'\'' => out.push_str("\\'"),
            b'\n' => out.push_str("\\n"),
            b'\r' => out.push_str("\\r"),
            b'\t' => out.push_str("\\t"),
            0x20..=0x7e => out.push(byte as char),
            _ => out.push_str(&format!("\\x{byte:02x}")),
        }
    }
    out.push('\'');
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interp::testing::interpreter;

    #[test]
    fn test_slice_indices_follow_sequence_semantics() {
        assert_eq!(slice_indices(5, None, None, 1), [0, 1, 2, 3, 4]);
        assert_eq!(slice_indices(5, Some(-2), None, 1), [3, 4]);
        assert_eq!(slice_indices(5, None, None, -1), [4, 3, 2, 1, 0]);
        assert_eq!(slice_indices(5, Some(10), Some(-10), -2), [4, 2, 0]);
        assert!(slice_indices(5, Some(3), Some(1), 1).is_empty());
    }

    #[test]
    fn test_integer_arithmetic_is_checked() {
        let (interp, _) = interpreter();
        let err = interp
            .binary(BinOp::Mul, &Value::Int(i64::MAX), &Value::Int(2))
            .unwrap_err();
        assert_eq!(err.type_name(), "OverflowError");
        let v = interp.binary(BinOp::FloorDiv, &Value::Int(-7), &Value::Int(2)).unwrap();
        assert_eq!(v.as_int(), Some(-4));
        let v = interp.binary(BinOp::Mod, &Value::Int(-7), &Value::Int(3)).unwrap();
        assert_eq!(v.as_int(), Some(2));
        let err = interp.binary(BinOp::Div, &Value::Int(1), &Value::Int(0)).unwrap_err();
        assert_eq!(err.type_name(), "ZeroDivisionError");
    }

    #[test]
    fn test_reprs() {
        assert_eq!(float_repr(1.0), "1.0");
        assert_eq!(float_repr(0.1), "0.1");
        assert_eq!(float_repr(1e20), "1e+20");
        assert_eq!(float_repr(1.5e-5), "1.5e-05");
        assert_eq!(str_repr("it's"), "\"it's\"");
        assert_eq!(str_repr("a\nb"), "'a\\nb'");
        assert_eq!(bytes_repr(b"\x00a"), "b'\\x00a'");
    }

    #[test]
    fn test_recursive_containers_render_once() {
        let (interp, _) = interpreter();
        let list = Value::list(vec![Value::Int(1)]);
        if let Value::List(l) = &list {
            l.borrow_mut().push(list.clone());
        }
        assert_eq!(interp.repr(&list).unwrap(), "[1, [...]]");
        if let Value::List(l) = &list {
            l.borrow_mut().clear();
        }
    }

    #[test]
    fn test_sort_reports_incomparable_values() {
        let (interp, _) = interpreter();
        let mut items = vec![Value::Int(2), Value::str("a")];
        let err = interp.sort_values(&mut items, None, false).unwrap_err();
        assert_eq!(err.type_name(), "TypeError");
        let mut items = vec![Value::Int(3), Value::Float(1.5), Value::Int(2)];
        interp.sort_values(&mut items, None, true).unwrap();
        assert_eq!(format!("{items:?}"), "[3, 2, 1.5]");
    }

    #[test]
    fn test_self_containing_lists_compare_to_recursion_error() {
        let (interp, _) = interpreter();
        let cyclic = || {
            let list = Value::list(Vec::new());
            if let Value::List(l) = &list {
                l.borrow_mut().push(list.clone());
            }
            list
        };
        let (a, b) = (cyclic(), cyclic());
        let err = interp.eq(&a, &b).unwrap_err();
        assert_eq!(err.type_name(), "RecursionError");
        let err = interp.order(&a, &b, "<").unwrap_err();
        assert_eq!(err.type_name(), "RecursionError");
        assert!(interp.eq(&a, &a).unwrap());
        for v in [a, b] {
            if let Value::List(l) = &v {
                l.borrow_mut().clear();
            }
        }
    }

    #[test]
    fn test_deep_nesting_is_bounded_in_repr() {
        let (interp, _) = interpreter();
        let mut value = Value::Int(0);
        for _ in 0..10_000 {
            value = Value::tuple(vec![value]);
        }
        let err = interp.repr(&value).unwrap_err();
        assert_eq!(err.type_name(), "RecursionError");
        let shallow = Value::list(vec![Value::tuple(vec![Value::Int(1)])]);
        assert_eq!(interp.repr(&shallow).unwrap(), "[(1,)]");
    }
}
