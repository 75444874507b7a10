//! Program rewriter.
//!
//! One bottom-up pass over each parsed chunk, run before any of it executes.
//! Reflective syntax is either rejected outright or redirected to the
//! mediated built-ins:
//!
//! | source                          | becomes                                  |
//! |---------------------------------|------------------------------------------|
//! | `x.__code__`, `x.__class__`, .. | `ForbiddenNameError`                     |
//! | `global n`                      | `ForbiddenSyntaxError`                   |
//! | `super()`                       | `super(__class__, <first parameter>)`    |
//! | `o.__setattr__(a, v)`           | `setattr(o, a, v)`                       |
//! | `o.__getattribute__(a)`         | `getattr(o, a, binder=o)`                |
//! | `o.__delattr__(a)`              | `delattr(o, a)`                          |
//! | `s.format(..)`                  | `safe_format(s, ..)`                     |
//! | `import a.b as c`               | `__import__([{name, asname}], __loader__)` |

use std::rc::Rc;

use super::mediator::ALWAYS_FORBIDDEN;
use crate::error::KernelError;
use crate::script::ast::{
    Alias, Arg, ClassDef, Comprehension, Constant, Ctx, Expr, FunctionDef, Handler, Keyword,
    Param, Params, Stmt, StmtKind, WithItem,
};

/// Names refused in read position unless they are the callee of a call
/// the rewriter redirects.
const READ_FORBIDDEN: &[&str] = &[
    "__getattribute__",
    "__setattr__",
    "__delattr__",
    "gi_frame",
    "ag_frame",
    "__closure__",
    "__globals__",
    "__subclasses__",
    "f_globals",
    "f_locals",
    "f_back",
    "tb_frame",
    "cell_contents",
];

type Rewrite<T> = Result<T, KernelError>;

pub fn rewrite_module(stmts: Vec<Stmt>) -> Rewrite<Vec<Stmt>> {
    let mut rw = Rewriter::default();
    rw.block(stmts)
}

pub fn rewrite_expression(expr: Expr) -> Rewrite<Expr> {
    let mut rw = Rewriter::default();
    rw.expr(expr)
}

#[derive(Default)]
struct Rewriter {
    // First parameter of each enclosing `def`, innermost last.
    first_params: Vec<Option<String>>,
    line: usize,
}

impl Rewriter {
    fn block(&mut self, stmts: Vec<Stmt>) -> Rewrite<Vec<Stmt>> {
        stmts.into_iter().map(|s| self.stmt(s)).collect()
    }

    fn stmt(&mut self, stmt: Stmt) -> Rewrite<Stmt> {
        self.line = stmt.line;
        let line = stmt.line;
        let kind = match stmt.kind {
            StmtKind::Expr(e) => StmtKind::Expr(self.expr(e)?),
            StmtKind::Assign { targets, value } => StmtKind::Assign {
                targets: self.exprs(targets)?,
                value: self.expr(value)?,
            },
            StmtKind::AugAssign { target, op, value } => StmtKind::AugAssign {
                target: self.expr(target)?,
                op,
                value: self.expr(value)?,
            },
            StmtKind::FunctionDef(def) => StmtKind::FunctionDef(self.function(def)?),
            StmtKind::ClassDef(def) => StmtKind::ClassDef(self.class(def)?),
            StmtKind::Return(e) => StmtKind::Return(self.opt(e)?),
            StmtKind::If { test, body, orelse } => StmtKind::If {
                test: self.expr(test)?,
                body: self.block(body)?,
                orelse: self.block(orelse)?,
            },
            StmtKind::While { test, body, orelse } => StmtKind::While {
                test: self.expr(test)?,
                body: self.block(body)?,
                orelse: self.block(orelse)?,
            },
            StmtKind::For {
                target,
                iter,
                body,
                orelse,
            } => StmtKind::For {
                target: self.expr(target)?,
                iter: self.expr(iter)?,
                body: self.block(body)?,
                orelse: self.block(orelse)?,
            },
            StmtKind::With { items, body } => StmtKind::With {
                items: items
                    .into_iter()
                    .map(|item| -> Rewrite<WithItem> {
                        Ok(WithItem {
                            context: self.expr(item.context)?,
                            target: self.opt(item.target)?,
                        })
                    })
                    .collect::<Rewrite<_>>()?,
                body: self.block(body)?,
            },
            StmtKind::Try {
                body,
                handlers,
                orelse,
                finalbody,
            } => StmtKind::Try {
                body: self.block(body)?,
                handlers: handlers
                    .into_iter()
                    .map(|h| -> Rewrite<Handler> {
                        Ok(Handler {
                            kind: self.opt(h.kind)?,
                            name: h.name,
                            body: self.block(h.body)?,
                        })
                    })
                    .collect::<Rewrite<_>>()?,
                orelse: self.block(orelse)?,
                finalbody: self.block(finalbody)?,
            },
            StmtKind::Raise { exc, cause } => StmtKind::Raise {
                exc: self.opt(exc)?,
                cause: self.opt(cause)?,
            },
            StmtKind::Delete(targets) => StmtKind::Delete(self.exprs(targets)?),
            StmtKind::Assert { test, msg } => StmtKind::Assert {
                test: self.expr(test)?,
                msg: self.opt(msg)?,
            },
            StmtKind::Global(_) => {
                return Err(KernelError::ForbiddenSyntax {
                    what: "'global' declaration".into(),
                    line,
                });
            }
            StmtKind::Import(names) => {
                let call = import_call(&names, Vec::new());
                StmtKind::Expr(call)
            }
            StmtKind::ImportFrom {
                module,
                names,
                level,
            } => {
                let module = match module {
                    Some(m) => Expr::str(&m),
                    None => Expr::Const(Constant::None),
                };
                let call = import_call(&names, vec![module, Expr::Const(Constant::Int(level as i64))]);
                StmtKind::Expr(call)
            }
            other @ (StmtKind::Nonlocal(_)
            | StmtKind::Pass
            | StmtKind::Break
            | StmtKind::Continue) => other,
        };
        Ok(Stmt::new(line, kind))
    }

    fn function(&mut self, def: Rc<FunctionDef>) -> Rewrite<Rc<FunctionDef>> {
        let def = Rc::unwrap_or_clone(def);
        let decorators = self.exprs(def.decorators)?;
        let params = self.params(def.params)?;
        self.first_params.push(params.first_name().map(str::to_string));
        let body = self.block(def.body);
        self.first_params.pop();
        Ok(Rc::new(FunctionDef {
            body: body?,
            params,
            decorators,
            ..def
        }))
    }

    fn params(&mut self, mut params: Params) -> Rewrite<Params> {
        let default = |rw: &mut Self, p: Param| -> Rewrite<Param> {
            Ok(Param {
                default: rw.opt(p.default)?,
                name: p.name,
            })
        };
        params.args = std::mem::take(&mut params.args)
            .into_iter()
            .map(|p| default(self, p))
            .collect::<Rewrite<_>>()?;
        params.kwonly = std::mem::take(&mut params.kwonly)
            .into_iter()
            .map(|p| default(self, p))
            .collect::<Rewrite<_>>()?;
        Ok(params)
    }

    fn class(&mut self, def: Rc<ClassDef>) -> Rewrite<Rc<ClassDef>> {
        let def = Rc::unwrap_or_clone(def);
        Ok(Rc::new(ClassDef {
            bases: self.exprs(def.bases)?,
            keywords: self.keywords(def.keywords)?,
            decorators: self.exprs(def.decorators)?,
            body: self.block(def.body)?,
            ..def
        }))
    }

    fn exprs(&mut self, exprs: Vec<Expr>) -> Rewrite<Vec<Expr>> {
        exprs.into_iter().map(|e| self.expr(e)).collect()
    }

    fn opt(&mut self, expr: Option<Expr>) -> Rewrite<Option<Expr>> {
        expr.map(|e| self.expr(e)).transpose()
    }

    fn boxed(&mut self, expr: Box<Expr>) -> Rewrite<Box<Expr>> {
        Ok(Box::new(self.expr(*expr)?))
    }

    fn keywords(&mut self, keywords: Vec<Keyword>) -> Rewrite<Vec<Keyword>> {
        keywords
            .into_iter()
            .map(|k| -> Rewrite<Keyword> {
                Ok(Keyword {
                    name: k.name,
                    value: self.expr(k.value)?,
                })
            })
            .collect()
    }

    fn args(&mut self, args: Vec<Arg>) -> Rewrite<Vec<Arg>> {
        args.into_iter()
            .map(|a| -> Rewrite<Arg> {
                Ok(match a {
                    Arg::Positional(e) => Arg::Positional(self.expr(e)?),
                    Arg::Starred(e) => Arg::Starred(self.expr(e)?),
                })
            })
            .collect()
    }

    fn generators(&mut self, generators: Vec<Comprehension>) -> Rewrite<Vec<Comprehension>> {
        generators
            .into_iter()
            .map(|g| -> Rewrite<Comprehension> {
                Ok(Comprehension {
                    target: self.expr(g.target)?,
                    iter: self.expr(g.iter)?,
                    ifs: self.exprs(g.ifs)?,
                })
            })
            .collect()
    }

    fn forbidden(&self, name: &str) -> KernelError {
        KernelError::ForbiddenName {
            name: name.to_string(),
            line: self.line,
        }
    }

    /// Check and rewrite an attribute reference. `callee` marks the
    /// attribute as the function of a call being redirected.
    fn attribute(&mut self, value: Box<Expr>, attr: String, ctx: Ctx, callee: bool) -> Rewrite<Expr> {
        if ALWAYS_FORBIDDEN.contains(&attr.as_str()) {
            return Err(self.forbidden(&attr));
        }
        if ctx == Ctx::Load && !callee && READ_FORBIDDEN.contains(&attr.as_str()) {
            return Err(self.forbidden(&attr));
        }
        Ok(Expr::Attribute {
            value: self.boxed(value)?,
            attr,
            ctx,
        })
    }

    fn expr(&mut self, expr: Expr) -> Rewrite<Expr> {
        Ok(match expr {
            e @ (Expr::Name(..) | Expr::Const(_)) => e,
            Expr::Attribute { value, attr, ctx } => self.attribute(value, attr, ctx, false)?,
            Expr::Subscript { value, index, ctx } => Expr::Subscript {
                value: self.boxed(value)?,
                index: self.boxed(index)?,
                ctx,
            },
            Expr::Slice { lower, upper, step } => Expr::Slice {
                lower: lower.map(|e| self.boxed(e)).transpose()?,
                upper: upper.map(|e| self.boxed(e)).transpose()?,
                step: step.map(|e| self.boxed(e)).transpose()?,
            },
            Expr::Call {
                func,
                args,
                keywords,
            } => self.call(*func, args, keywords)?,
            Expr::BinOp { left, op, right } => Expr::BinOp {
                left: self.boxed(left)?,
                op,
                right: self.boxed(right)?,
            },
            Expr::Unary { op, operand } => Expr::Unary {
                op,
                operand: self.boxed(operand)?,
            },
            Expr::BoolOp { op, values } => Expr::BoolOp {
                op,
                values: self.exprs(values)?,
            },
            Expr::Compare {
                left,
                ops,
                comparators,
            } => Expr::Compare {
                left: self.boxed(left)?,
                ops,
                comparators: self.exprs(comparators)?,
            },
            Expr::IfExp { test, body, orelse } => Expr::IfExp {
                test: self.boxed(test)?,
                body: self.boxed(body)?,
                orelse: self.boxed(orelse)?,
            },
            Expr::Lambda(def) => {
                // Lambdas keep the enclosing method's first parameter.
                let def = Rc::unwrap_or_clone(def);
                let params = self.params(def.params)?;
                let body = self.block(def.body)?;
                Expr::Lambda(Rc::new(FunctionDef { params, body, ..def }))
            }
            Expr::List(items, ctx) => Expr::List(self.exprs(items)?, ctx),
            Expr::Tuple(items, ctx) => Expr::Tuple(self.exprs(items)?, ctx),
            Expr::Dict(pairs) => Expr::Dict(
                pairs
                    .into_iter()
                    .map(|(k, v)| -> Rewrite<(Expr, Expr)> { Ok((self.expr(k)?, self.expr(v)?)) })
                    .collect::<Rewrite<_>>()?,
            ),
            Expr::ListComp { elt, generators } => Expr::ListComp {
                elt: self.boxed(elt)?,
                generators: self.generators(generators)?,
            },
            Expr::DictComp {
                key,
                value,
                generators,
            } => Expr::DictComp {
                key: self.boxed(key)?,
                value: self.boxed(value)?,
                generators: self.generators(generators)?,
            },
        })
    }

    fn call(&mut self, func: Expr, args: Vec<Arg>, keywords: Vec<Keyword>) -> Rewrite<Expr> {
        if is_name(&func, "super") && args.is_empty() && keywords.is_empty() {
            let this = self
                .first_params
                .last()
                .cloned()
                .flatten()
                .unwrap_or_else(|| "self".to_string());
            return Ok(Expr::call(
                func,
                vec![
                    Arg::Positional(Expr::name("__class__")),
                    Arg::Positional(Expr::name(&this)),
                ],
                Vec::new(),
            ));
        }

        let Expr::Attribute {
            value,
            attr,
            ctx: Ctx::Load,
        } = func
        else {
            return Ok(Expr::call(
                self.expr(func)?,
                self.args(args)?,
                self.keywords(keywords)?,
            ));
        };

        match attr.as_str() {
            "__setattr__" => {
                let receiver = self.expr(*value)?;
                let args = self.args(args)?;
                let keywords = self.keywords(keywords)?;
                if is_super_call(&receiver) {
                    return Ok(Expr::call(attr_of(receiver, &attr), args, keywords));
                }
                let args = if args.len() > 2 {
                    args
                } else {
                    prepend(receiver, args)
                };
                Ok(Expr::call(Expr::name("setattr"), args, keywords))
            }
            "__getattribute__" | "__delattr__" if !args.is_empty() => {
                let receiver = self.expr(*value)?;
                let mut args = self.args(args)?;
                let keywords = self.keywords(keywords)?;
                if is_super_call(&receiver) {
                    return Ok(Expr::call(attr_of(receiver, &attr), args, keywords));
                }
                // Unbound form: `T.__getattribute__(obj, name)`.
                let (obj, name) = if args.len() > 1 {
                    let name = args.remove(1);
                    (args.remove(0), name)
                } else {
                    (Arg::Positional(receiver.clone()), args.remove(0))
                };
                if attr == "__delattr__" {
                    return Ok(Expr::call(Expr::name("delattr"), vec![obj, name], keywords));
                }
                Ok(Expr::call(
                    Expr::name("getattr"),
                    vec![obj, name],
                    vec![Keyword {
                        name: Some("binder".into()),
                        value: receiver,
                    }],
                ))
            }
            "format" => {
                let receiver = self.expr(*value)?;
                let args = prepend(receiver, self.args(args)?);
                Ok(Expr::call(
                    Expr::name("safe_format"),
                    args,
                    self.keywords(keywords)?,
                ))
            }
            "format_map" => {
                let receiver = self.expr(*value)?;
                let args = prepend(receiver, self.args(args)?);
                Ok(Expr::call(Expr::name("safe_format_map"), args, Vec::new()))
            }
            _ => Ok(Expr::call(
                self.attribute(value, attr, Ctx::Load, false)?,
                self.args(args)?,
                self.keywords(keywords)?,
            )),
        }
    }
}

fn is_name(expr: &Expr, name: &str) -> bool {
    matches!(expr, Expr::Name(n, _) if n == name)
}

fn is_super_call(expr: &Expr) -> bool {
    matches!(expr, Expr::Call { func, .. } if is_name(func, "super"))
}

fn attr_of(value: Expr, attr: &str) -> Expr {
    Expr::Attribute {
        value: Box::new(value),
        attr: attr.to_string(),
        ctx: Ctx::Load,
    }
}

fn prepend(receiver: Expr, mut args: Vec<Arg>) -> Vec<Arg> {
    args.insert(0, Arg::Positional(receiver));
    args
}

/// `__import__([{"name": .., "asname": ..}, ..], __loader__, *extra)`.
fn import_call(names: &[Alias], extra: Vec<Expr>) -> Expr {
    let aliases = names
        .iter()
        .map(|alias| {
            let asname = alias
                .asname
                .clone()
                .unwrap_or_else(|| alias.name.rsplit('.').next().unwrap_or(&alias.name).to_string());
            Expr::Dict(vec![
                (Expr::str("name"), Expr::str(&alias.name)),
                (Expr::str("asname"), Expr::str(&asname)),
            ])
        })
        .collect();
    let mut args = vec![
        Arg::Positional(Expr::List(aliases, Ctx::Load)),
        Arg::Positional(Expr::name("__loader__")),
    ];
    args.extend(extra.into_iter().map(Arg::Positional));
    Expr::call(Expr::name("__import__"), args, Vec::new())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::parse_module;

    fn rewrite(src: &str) -> Rewrite<Vec<Stmt>> {
        rewrite_module(parse_module(src).unwrap())
    }

    fn first_expr(src: &str) -> Expr {
        let stmts = rewrite(src).unwrap();
        match stmts.into_iter().last().map(|s| s.kind) {
            Some(StmtKind::Expr(e)) => e,
            other => panic!("expected an expression statement, got {other:?}"),
        }
    }

    fn callee(expr: &Expr) -> &str {
        match expr {
            Expr::Call { func, .. } => match &**func {
                Expr::Name(n, _) => n,
                other => panic!("unexpected callee {other:?}"),
            },
            other => panic!("expected a call, got {other:?}"),
        }
    }

    #[test]
    fn test_forbidden_names() {
        for src in ["f.__code__\n", "x.__class__ = 1\n", "del o.gi_code\n", "f.__globals__\n"] {
            let err = rewrite(src).unwrap_err();
            assert!(matches!(err, KernelError::ForbiddenName { .. }), "{src}: {err}");
        }
        // Write position is only refused for the always-forbidden set.
        assert!(rewrite("o.__globals__ = 1\n").is_ok());
    }

    #[test]
    fn test_global_is_rejected_with_its_line() {
        let err = rewrite("x = 1\ndef f():\n    global x\n").unwrap_err();
        assert_eq!(
            err,
            KernelError::ForbiddenSyntax {
                what: "'global' declaration".into(),
                line: 3
            }
        );
    }

    #[test]
    fn test_reflective_calls_are_redirected() {
        assert_eq!(callee(&first_expr("o.__setattr__('a', 1)\n")), "setattr");
        assert_eq!(callee(&first_expr("object.__setattr__(o, 'a', 1)\n")), "setattr");
        assert_eq!(callee(&first_expr("o.__delattr__('a')\n")), "delattr");
        assert_eq!(callee(&first_expr("'{}'.format(1)\n")), "safe_format");
        assert_eq!(callee(&first_expr("s.format_map(m)\n")), "safe_format_map");

        let Expr::Call { args, keywords, .. } = first_expr("T.__getattribute__(o, 'a')\n") else {
            panic!("expected a call")
        };
        assert!(matches!(args[0].expr(), Expr::Name(n, _) if n == "o"));
        assert_eq!(keywords[0].name.as_deref(), Some("binder"));
        assert!(matches!(&keywords[0].value, Expr::Name(n, _) if n == "T"));

        // Without arguments there is nothing to redirect.
        assert!(rewrite("o.__getattribute__()\n").is_err());
    }

    #[test]
    fn test_zero_argument_super() {
        let stmts = rewrite("class A:\n    def m(this):\n        return super().m()\n").unwrap();
        let StmtKind::ClassDef(class) = &stmts[0].kind else {
            panic!()
        };
        let StmtKind::FunctionDef(def) = &class.body[0].kind else {
            panic!()
        };
        let StmtKind::Return(Some(Expr::Call { func, .. })) = &def.body[0].kind else {
            panic!()
        };
        let Expr::Attribute { value, .. } = &**func else {
            panic!()
        };
        let Expr::Call { args, .. } = &**value else {
            panic!()
        };
        assert!(matches!(args[0].expr(), Expr::Name(n, _) if n == "__class__"));
        assert!(matches!(args[1].expr(), Expr::Name(n, _) if n == "this"));
    }

    #[test]
    fn test_super_setattr_is_left_alone() {
        let expr = first_expr("super().__setattr__('a', 1)\n");
        let Expr::Call { func, .. } = expr else { panic!() };
        assert!(matches!(&*func, Expr::Attribute { attr, .. } if attr == "__setattr__"));
    }

    #[test]
    fn test_imports_become_calls() {
        let expr = first_expr("import a.b\n");
        assert_eq!(callee(&expr), "__import__");
        let Expr::Call { args, .. } = expr else { panic!() };
        let Expr::List(items, _) = args[0].expr() else {
            panic!()
        };
        let Expr::Dict(pairs) = &items[0] else { panic!() };
        assert!(matches!(&pairs[1].1, Expr::Const(Constant::Str(s)) if &**s == "b"));

        let Expr::Call { args, .. } = first_expr("from .m import x as y\n") else {
            panic!()
        };
        assert_eq!(args.len(), 4);
        assert!(matches!(args[3].expr(), Expr::Const(Constant::Int(1))));
    }
}
