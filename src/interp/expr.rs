//! Expression evaluation.

use std::rc::Rc;

use indexmap::IndexMap;

use super::exec::{Frame, Locals};
use super::{Env, EvalResult, Interpreter, error, type_error};
use crate::error::ErrorKind;
use crate::kernel::mediator;
use crate::kernel::store::LockedMapping;
use crate::kernel::value::{Args, Value};
use crate::script::ast::{Arg, BoolOp, CmpOp, Comprehension, Constant, Expr, Keyword};

impl Interpreter {
    pub(crate) fn eval(&self, frame: &Frame, expr: &Expr) -> EvalResult<Value> {
        match expr {
            Expr::Name(name, _) => self.lookup_name(frame, name),
            Expr::Const(c) => Ok(constant(c)),
            Expr::Attribute { value, attr, .. } => {
                let obj = self.eval(frame, value)?;
                mediator::getattr(self, &obj, attr, None)
            }
            Expr::Subscript { value, index, .. } => {
                let obj = self.eval(frame, value)?;
                if let Expr::Slice { lower, upper, step } = &**index {
                    let (lo, hi, st) = self.slice_bounds(frame, lower, upper, step)?;
                    return self.slice(&obj, lo, hi, st);
                }
                let key = self.eval(frame, index)?;
                self.get_item(&obj, &key)
            }
            Expr::Slice { .. } => Err(error(ErrorKind::SyntaxError, "slice outside subscript")),
            Expr::Call {
                func,
                args,
                keywords,
            } => {
                let callee = self.eval(frame, func)?;
                let args = self.eval_args(frame, args, keywords)?;
                self.call(&callee, args)
            }
            Expr::BinOp { left, op, right } => {
                let l = self.eval(frame, left)?;
                let r = self.eval(frame, right)?;
                self.binary(*op, &l, &r)
            }
            Expr::Unary { op, operand } => {
                let v = self.eval(frame, operand)?;
                self.unary(*op, &v)
            }
            Expr::BoolOp { op, values } => {
                let mut last = Value::None;
                for (i, e) in values.iter().enumerate() {
                    last = self.eval(frame, e)?;
                    if i + 1 == values.len() {
                        break;
                    }
                    let t = self.truthy(&last)?;
                    match op {
                        BoolOp::And if !t => break,
                        BoolOp::Or if t => break,
                        _ => {}
                    }
                }
                Ok(last)
            }
            Expr::Compare {
                left,
                ops,
                comparators,
            } => {
                let mut lhs = self.eval(frame, left)?;
                for (op, rhs) in ops.iter().zip(comparators) {
                    let rhs = self.eval(frame, rhs)?;
                    if !self.compare(*op, &lhs, &rhs)? {
                        return Ok(Value::Bool(false));
                    }
                    lhs = rhs;
                }
                Ok(Value::Bool(true))
            }
            Expr::IfExp { test, body, orelse } => {
                let t = self.eval(frame, test)?;
                if self.truthy(&t)? {
                    self.eval(frame, body)
                } else {
                    self.eval(frame, orelse)
                }
            }
            Expr::Lambda(def) => self.make_function(frame, def),
            Expr::List(items, _) => Ok(Value::list(self.eval_all(frame, items)?)),
            Expr::Tuple(items, _) => Ok(Value::tuple(self.eval_all(frame, items)?)),
            Expr::Dict(pairs) => {
                let mapping = LockedMapping::new();
                for (k, v) in pairs {
                    let key = self.eval(frame, k)?;
                    let value = self.eval(frame, v)?;
                    mapping.insert(self.map_key(&key)?, value)?;
                }
                Ok(Value::Mapping(Rc::new(mapping)))
            }
            Expr::ListComp { elt, generators } => {
                let inner = self.comprehension_frame(frame);
                let mut out = Vec::new();
                self.run_generators(&inner, generators, &mut |interp: &Interpreter| {
                    out.push(interp.eval(&inner, elt)?);
                    Ok(())
                })?;
                Ok(Value::list(out))
            }
            Expr::DictComp {
                key,
                value,
                generators,
            } => {
                let inner = self.comprehension_frame(frame);
                let mapping = LockedMapping::new();
                self.run_generators(&inner, generators, &mut |interp: &Interpreter| {
                    let k = interp.eval(&inner, key)?;
                    let v = interp.eval(&inner, value)?;
                    mapping.insert(interp.map_key(&k)?, v)?;
                    Ok(())
                })?;
                Ok(Value::Mapping(Rc::new(mapping)))
            }
        }
    }

    fn eval_all(&self, frame: &Frame, items: &[Expr]) -> EvalResult<Vec<Value>> {
        items.iter().map(|e| self.eval(frame, e)).collect()
    }

    fn eval_args(&self, frame: &Frame, args: &[Arg], keywords: &[Keyword]) -> EvalResult<Args> {
        let mut positional = Vec::with_capacity(args.len());
        for arg in args {
            match arg {
                Arg::Positional(e) => positional.push(self.eval(frame, e)?),
                Arg::Starred(e) => {
                    let v = self.eval(frame, e)?;
                    positional.extend(self.iterate(&v)?);
                }
            }
        }
        let mut kw = IndexMap::new();
        for keyword in keywords {
            let value = self.eval(frame, &keyword.value)?;
            let pairs = match &keyword.name {
                Some(name) => vec![(name.clone(), value)],
                None => self.keyword_pairs(&value)?,
            };
            for (name, value) in pairs {
                if kw.insert(name.clone(), value).is_some() {
                    return Err(type_error(format!(
                        "got multiple values for keyword argument '{name}'"
                    )));
                }
            }
        }
        Ok(Args {
            positional,
            keywords: kw,
        })
    }

    /// Entries of a `**mapping` argument.
    pub(crate) fn keyword_pairs(&self, value: &Value) -> EvalResult<Vec<(String, Value)>> {
        let Value::Mapping(m) = value else {
            return Err(type_error(format!(
                "argument after ** must be a mapping, not {}",
                value.type_name()
            )));
        };
        m.items()
            .into_iter()
            .map(|(k, v)| match k.as_str() {
                Some(name) => Ok((name.to_string(), v)),
                None => Err(type_error("keywords must be strings")),
            })
            .collect()
    }

    pub(crate) fn slice_bounds(
        &self,
        frame: &Frame,
        lower: &Option<Box<Expr>>,
        upper: &Option<Box<Expr>>,
        step: &Option<Box<Expr>>,
    ) -> EvalResult<(Option<i64>, Option<i64>, Option<i64>)> {
        let bound = |e: &Option<Box<Expr>>| -> EvalResult<Option<i64>> {
            let Some(e) = e else { return Ok(None) };
            match self.eval(frame, e)? {
                Value::None => Ok(None),
                v => v.as_int().map(Some).ok_or_else(|| {
                    type_error("slice indices must be integers or None")
                }),
            }
        };
        Ok((bound(lower)?, bound(upper)?, bound(step)?))
    }

    fn comprehension_frame(&self, frame: &Frame) -> Frame {
        Frame::new(
            frame.globals.clone(),
            Locals::Function(Env::new(frame.enclosing_env())),
            frame.class_cell.clone(),
            &frame.function,
            &frame.file,
        )
    }

    fn run_generators(
        &self,
        frame: &Frame,
        generators: &[Comprehension],
        body: &mut dyn FnMut(&Self) -> EvalResult<()>,
    ) -> EvalResult<()> {
        let Some((first, rest)) = generators.split_first() else {
            return body(self);
        };
        let iterable = self.eval(frame, &first.iter)?;
        'items: for item in self.iterate(&iterable)? {
            self.assign(frame, &first.target, item)?;
            for cond in &first.ifs {
                let c = self.eval(frame, cond)?;
                if !self.truthy(&c)? {
                    continue 'items;
                }
            }
            self.run_generators(frame, rest, body)?;
        }
        Ok(())
    }

    pub(crate) fn compare(&self, op: CmpOp, lhs: &Value, rhs: &Value) -> EvalResult<bool> {
        use std::cmp::Ordering;
        Ok(match op {
            CmpOp::Eq => self.eq(lhs, rhs)?,
            CmpOp::NotEq => !self.eq(lhs, rhs)?,
            CmpOp::Is => lhs.same(rhs),
            CmpOp::IsNot => !lhs.same(rhs),
            CmpOp::In => self.contains(rhs, lhs)?,
            CmpOp::NotIn => !self.contains(rhs, lhs)?,
            CmpOp::Lt => self.order(lhs, rhs, "<")? == Ordering::Less,
            CmpOp::LtE => self.order(lhs, rhs, "<=")? != Ordering::Greater,
            CmpOp::Gt => self.order(lhs, rhs, ">")? == Ordering::Greater,
            CmpOp::GtE => self.order(lhs, rhs, ">=")? != Ordering::Less,
        })
    }
}

fn constant(c: &Constant) -> Value {
    match c {
        Constant::None => Value::None,
        Constant::Bool(b) => Value::Bool(*b),
        Constant::Int(i) => Value::Int(*i),
        Constant::Float(f) => Value::Float(*f),
        Constant::Str(s) => Value::Str(s.clone()),
        Constant::Bytes(b) => Value::Bytes(b.clone()),
    }
}

#[cfg(test)]
mod tests {
    use crate::interp::testing::interpreter;
    use crate::kernel::scope::Scope;
    use crate::kernel::store::LockedMapping;
    use crate::kernel::value::Value;
    use std::rc::Rc;

    fn eval(src: &str) -> Value {
        let (interp, _) = interpreter();
        let scope = Scope::with_builtins(Rc::new(LockedMapping::new()));
        crate::interp::builtins::install_for_tests(&interp, &scope);
        interp.eval_source(src, &scope, None, true).unwrap()
    }

    #[test]
    fn test_comparison_chains_short_circuit() {
        assert!(matches!(eval("1 < 2 < 3"), Value::Bool(true)));
        assert!(matches!(eval("3 > 2 > 2"), Value::Bool(false)));
        assert!(matches!(eval("'a' in 'cat' and 2 not in [1]"), Value::Bool(true)));
    }

    #[test]
    fn test_bool_ops_return_operands() {
        assert_eq!(eval("0 or 'x'").as_str(), Some("x"));
        assert_eq!(eval("[] and 1").type_name(), "list");
    }

    #[test]
    fn test_comprehensions_do_not_leak_targets() {
        let (interp, _) = interpreter();
        let scope = Scope::with_builtins(Rc::new(LockedMapping::new()));
        crate::interp::builtins::install_for_tests(&interp, &scope);
        interp
            .run_source(
                "ys = [x * 2 for x in range(4) if x % 2 == 0]\nd = {k: v for k, v in [(1, 'a'), (2, 'b')]}\n",
                &scope,
                "<test>",
                false,
            )
            .unwrap();
        assert!(scope.get("x").is_none());
        let ys = scope.get("ys").unwrap();
        assert_eq!(format!("{ys:?}"), "[0, 4]");
        let Some(Value::Mapping(d)) = scope.get("d") else {
            panic!("expected a dict")
        };
        assert_eq!(d.len(), 2);
    }

    #[test]
    fn test_star_and_double_star_arguments() {
        let v = eval("(lambda *a, **k: (len(a), sorted(k.keys())))(*[1, 2], **{'x': 1, 'y': 2})");
        assert_eq!(format!("{v:?}"), "(2, [\"x\", \"y\"])");
    }
}
