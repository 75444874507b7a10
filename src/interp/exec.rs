//! Statement execution.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use indexmap::IndexMap;

use super::call::ClassSpec;
use super::{
    Env, EvalResult, GuestError, Interpreter, TraceFrame, error, name_error, runtime_error,
    type_error,
};
use crate::error::{ErrorKind, KernelError};
use crate::kernel::mediator;
use crate::kernel::scope::Scope;
use crate::kernel::store::LockedMapping;
use crate::kernel::value::{Args, ClassCell, Value};
use crate::script::ast::{ClassDef, Expr, Handler, Stmt, StmtKind, WithItem};

/// Where a frame keeps its local names.
pub(crate) enum Locals {
    /// Module level: locals are the scope itself.
    Module,
    Function(Rc<Env>),
    Class {
        ns: Rc<RefCell<IndexMap<String, Value>>>,
        outer: Option<Rc<Env>>,
        cell: ClassCell,
    },
    /// Explicit locals mapping handed to `exec`/`eval`.
    Mapping(Rc<LockedMapping>),
}

pub(crate) struct Frame {
    pub globals: Rc<Scope>,
    pub locals: Locals,
    pub class_cell: Option<ClassCell>,
    pub function: Rc<str>,
    pub file: Rc<str>,
    pub line: Cell<usize>,
    // Errors being handled, innermost last; bare `raise` re-raises the top.
    pub handling: RefCell<Vec<Box<GuestError>>>,
}

impl Frame {
    pub fn new(
        globals: Rc<Scope>,
        locals: Locals,
        class_cell: Option<ClassCell>,
        function: &str,
        file: &str,
    ) -> Self {
        Self {
            globals,
            locals,
            class_cell,
            function: Rc::from(function),
            file: Rc::from(file),
            line: Cell::new(0),
            handling: RefCell::new(Vec::new()),
        }
    }

    /// Environment a function or comprehension created here closes over.
    pub fn enclosing_env(&self) -> Option<Rc<Env>> {
        match &self.locals {
            Locals::Function(env) => Some(env.clone()),
            Locals::Class { outer, .. } => outer.clone(),
            Locals::Module | Locals::Mapping(_) => None,
        }
    }

    pub fn trace_frame(&self) -> TraceFrame {
        TraceFrame::new(
            self.function.clone(),
            self.file.clone(),
            self.line.get(),
            self.globals.clone(),
        )
    }
}

pub(crate) enum Flow {
    Normal,
    Return(Value),
    Break,
    Continue,
}

impl Interpreter {
    pub(crate) fn exec_module_body(
        &self,
        frame: &Frame,
        stmts: &[Stmt],
        interactive: bool,
    ) -> EvalResult<Option<Value>> {
        let (body, tail) = match stmts.split_last() {
            Some((last, rest)) if interactive && matches!(last.kind, StmtKind::Expr(_)) => {
                (rest, Some(last))
            }
            _ => (stmts, None),
        };
        match self.exec_block(frame, body)? {
            Flow::Normal | Flow::Return(_) => {}
            Flow::Break | Flow::Continue => {
                return Err(error(ErrorKind::SyntaxError, "'break' outside loop"));
            }
        }
        let Some(Stmt {
            line,
            kind: StmtKind::Expr(expr),
        }) = tail
        else {
            return Ok(None);
        };
        frame.line.set(*line);
        Ok(Some(self.eval(frame, expr)?))
    }

    pub(crate) fn exec_block(&self, frame: &Frame, stmts: &[Stmt]) -> EvalResult<Flow> {
        for stmt in stmts {
            match self.exec_stmt(frame, stmt)? {
                Flow::Normal => {}
                other => return Ok(other),
            }
        }
        Ok(Flow::Normal)
    }

    fn exec_stmt(&self, frame: &Frame, stmt: &Stmt) -> EvalResult<Flow> {
        frame.line.set(stmt.line);
        match &stmt.kind {
            StmtKind::Expr(expr) => {
                self.eval(frame, expr)?;
            }
            StmtKind::Assign { targets, value } => {
                let value = self.eval(frame, value)?;
                for target in targets {
                    self.assign(frame, target, value.clone())?;
                }
            }
            StmtKind::AugAssign { target, op, value } => self.exec_aug_assign(frame, target, *op, value)?,
            StmtKind::FunctionDef(def) => {
                let mut func = self.make_function(frame, def)?;
                for deco in def.decorators.iter().rev() {
                    let deco = self.eval(frame, deco)?;
                    func = self.call(&deco, Args::new(vec![func]))?;
                }
                self.store_name(frame, &def.name, func)?;
            }
            StmtKind::ClassDef(def) => {
                let cls = self.exec_class(frame, def)?;
                self.store_name(frame, &def.name, cls)?;
            }
            StmtKind::Return(value) => {
                let value = match value {
                    Some(expr) => self.eval(frame, expr)?,
                    None => Value::None,
                };
                return Ok(Flow::Return(value));
            }
            StmtKind::If { test, body, orelse } => {
                let test = self.eval(frame, test)?;
                return if self.truthy(&test)? {
                    self.exec_block(frame, body)
                } else {
                    self.exec_block(frame, orelse)
                };
            }
            StmtKind::While { test, body, orelse } => {
                loop {
                    let cond = self.eval(frame, test)?;
                    if !self.truthy(&cond)? {
                        return self.exec_block(frame, orelse);
                    }
                    match self.exec_block(frame, body)? {
                        Flow::Break => break,
                        Flow::Return(v) => return Ok(Flow::Return(v)),
                        Flow::Normal | Flow::Continue => {}
                    }
                }
            }
            StmtKind::For {
                target,
                iter,
                body,
                orelse,
            } => {
                let iterable = self.eval(frame, iter)?;
                let mut broke = false;
                for item in self.iterate(&iterable)? {
                    self.assign(frame, target, item)?;
                    match self.exec_block(frame, body)? {
                        Flow::Break => {
                            broke = true;
                            break;
                        }
                        Flow::Return(v) => return Ok(Flow::Return(v)),
                        Flow::Normal | Flow::Continue => {}
                    }
                }
                if !broke {
                    return self.exec_block(frame, orelse);
                }
            }
            StmtKind::With { items, body } => return self.exec_with(frame, items, body),
            StmtKind::Try {
                body,
                handlers,
                orelse,
                finalbody,
            } => return self.exec_try(frame, body, handlers, orelse, finalbody),
            StmtKind::Raise { exc, cause } => {
                let Some(exc) = exc else {
                    let current = frame.handling.borrow().last().cloned();
                    return Err(current
                        .unwrap_or_else(|| runtime_error("no active exception to re-raise")));
                };
                let value = self.eval(frame, exc)?;
                if let Some(cause) = cause {
                    self.eval(frame, cause)?;
                }
                return Err(self.to_raise(value)?);
            }
            StmtKind::Delete(targets) => {
                for target in targets {
                    self.delete(frame, target)?;
                }
            }
            StmtKind::Assert { test, msg } => {
                let test = self.eval(frame, test)?;
                if !self.truthy(&test)? {
                    let msg = match msg {
                        Some(m) => {
                            let m = self.eval(frame, m)?;
                            self.to_str(&m)?
                        }
                        None => String::new(),
                    };
                    return Err(error(ErrorKind::AssertionError, msg));
                }
            }
            StmtKind::Global(_) => {
                return Err(KernelError::ForbiddenSyntax {
                    what: "global declaration".into(),
                    line: stmt.line,
                }
                .into());
            }
            StmtKind::Nonlocal(names) => {
                let Locals::Function(env) = &frame.locals else {
                    return Err(error(
                        ErrorKind::SyntaxError,
                        "nonlocal declaration not allowed at module level",
                    ));
                };
                for name in names {
                    if !env.declare_nonlocal(name) {
                        return Err(error(
                            ErrorKind::SyntaxError,
                            format!("no binding for nonlocal '{name}' found"),
                        ));
                    }
                }
            }
            StmtKind::Import(_) | StmtKind::ImportFrom { .. } => {
                return Err(error(
                    ErrorKind::ImportError,
                    "import statements are not available in this context",
                ));
            }
            StmtKind::Pass => {}
            StmtKind::Break => return Ok(Flow::Break),
            StmtKind::Continue => return Ok(Flow::Continue),
        }
        Ok(Flow::Normal)
    }

    fn exec_aug_assign(
        &self,
        frame: &Frame,
        target: &Expr,
        op: crate::script::ast::BinOp,
        value: &Expr,
    ) -> EvalResult<()> {
        match target {
            Expr::Name(name, _) => {
                let current = self.lookup_name(frame, name)?;
                let rhs = self.eval(frame, value)?;
                let result = self.inplace(op, current, rhs)?;
                self.store_name(frame, name, result)
            }
            Expr::Attribute { value: obj, attr, .. } => {
                let obj = self.eval(frame, obj)?;
                let current = mediator::getattr(self, &obj, attr, None)?;
                let rhs = self.eval(frame, value)?;
                let result = self.inplace(op, current, rhs)?;
                mediator::setattr(self, &obj, attr, result)
            }
            Expr::Subscript {
                value: obj, index, ..
            } => {
                let obj = self.eval(frame, obj)?;
                let key = self.eval(frame, index)?;
                let current = self.get_item(&obj, &key)?;
                let rhs = self.eval(frame, value)?;
                let result = self.inplace(op, current, rhs)?;
                self.set_item(&obj, key, result)
            }
            _ => Err(error(
                ErrorKind::SyntaxError,
                "illegal expression for augmented assignment",
            )),
        }
    }

    /// `+=` on a list extends it in place; every other operator rebinds.
    fn inplace(&self, op: crate::script::ast::BinOp, current: Value, rhs: Value) -> EvalResult<Value> {
        if op == crate::script::ast::BinOp::Add
            && let Value::List(list) = &current
        {
            let items = self.iterate(&rhs)?;
            list.borrow_mut().extend(items);
            return Ok(current);
        }
        self.binary(op, &current, &rhs)
    }

    fn exec_class(&self, frame: &Frame, def: &Rc<ClassDef>) -> EvalResult<Value> {
        let bases = def
            .bases
            .iter()
            .map(|b| self.eval(frame, b))
            .collect::<EvalResult<Vec<_>>>()?;
        let mut keywords = IndexMap::new();
        for kw in &def.keywords {
            let value = self.eval(frame, &kw.value)?;
            match &kw.name {
                Some(name) => {
                    keywords.insert(name.clone(), value);
                }
                None => {
                    for (k, v) in self.keyword_pairs(&value)? {
                        keywords.insert(k, v);
                    }
                }
            }
        }

        let ns = Rc::new(RefCell::new(IndexMap::new()));
        let cell: ClassCell = Rc::new(RefCell::new(None));
        let body_frame = Frame::new(
            frame.globals.clone(),
            Locals::Class {
                ns: ns.clone(),
                outer: frame.enclosing_env(),
                cell: cell.clone(),
            },
            frame.class_cell.clone(),
            &def.name,
            &frame.file,
        );
        self.in_frame(&body_frame, |interp| {
            interp.exec_block(&body_frame, &def.body).map(|_| ())
        })?;
        let attrs = ns.take();

        let cls = self.create_class(ClassSpec {
            name: def.name.clone(),
            bases,
            attrs,
            keywords,
            doc: def.doc.clone(),
        })?;
        *cell.borrow_mut() = Some(cls.clone());

        let mut value = Value::Type(cls);
        for deco in def.decorators.iter().rev() {
            let deco = self.eval(frame, deco)?;
            value = self.call(&deco, Args::new(vec![value]))?;
        }
        Ok(value)
    }

    fn exec_with(&self, frame: &Frame, items: &[WithItem], body: &[Stmt]) -> EvalResult<Flow> {
        let Some((item, rest)) = items.split_first() else {
            return self.exec_block(frame, body);
        };
        let manager = self.eval(frame, &item.context)?;
        let enter = mediator::getattr(self, &manager, "__enter__", None)?;
        let exit = mediator::getattr(self, &manager, "__exit__", None)?;
        let entered = self.call(&enter, Args::default())?;

        let result = match &item.target {
            Some(target) => self.assign(frame, target, entered),
            None => Ok(()),
        }
        .and_then(|_| self.exec_with(frame, rest, body));

        match result {
            Ok(flow) => {
                self.call(&exit, Args::new(vec![Value::None, Value::None, Value::None]))?;
                Ok(flow)
            }
            Err(err) => {
                let exc = self.exception_object(&err);
                let kind = match &exc {
                    Value::Object(o) => Value::Type(o.class().clone()),
                    _ => Value::None,
                };
                let suppress = self.call(&exit, Args::new(vec![kind, exc, Value::None]))?;
                if self.truthy(&suppress)? {
                    Ok(Flow::Normal)
                } else {
                    Err(err)
                }
            }
        }
    }

    fn exec_try(
        &self,
        frame: &Frame,
        body: &[Stmt],
        handlers: &[Handler],
        orelse: &[Stmt],
        finalbody: &[Stmt],
    ) -> EvalResult<Flow> {
        let outcome = match self.exec_block(frame, body) {
            Ok(Flow::Normal) => self.exec_block(frame, orelse),
            Ok(flow) => Ok(flow),
            Err(err) => self.handle(frame, err, handlers),
        };
        if finalbody.is_empty() {
            return outcome;
        }
        match self.exec_block(frame, finalbody)? {
            Flow::Normal => outcome,
            flow => Ok(flow),
        }
    }

    fn handle(&self, frame: &Frame, err: Box<GuestError>, handlers: &[Handler]) -> EvalResult<Flow> {
        for handler in handlers {
            let matched = match &handler.kind {
                None => true,
                Some(expr) => {
                    let kind = self.eval(frame, expr)?;
                    self.handler_matches(&err, &kind)?
                }
            };
            if !matched {
                continue;
            }
            if let Some(name) = &handler.name {
                let exc = self.exception_object(&err);
                self.store_name(frame, name, exc)?;
            }
            frame.handling.borrow_mut().push(err);
            let result = self.exec_block(frame, &handler.body);
            frame.handling.borrow_mut().pop();
            if let Some(name) = &handler.name {
                // The handler body may already have removed it.
                let _ = self.delete_name(frame, name);
            }
            return result;
        }
        Err(err)
    }

    fn handler_matches(&self, err: &GuestError, kind: &Value) -> EvalResult<bool> {
        match kind {
            Value::Type(t) if t.error_kind().is_some() => Ok(self.error_matches(err, t)),
            Value::Tuple(items) => {
                for item in items.iter() {
                    if self.handler_matches(err, item)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            _ => Err(type_error(
                "catching classes that do not inherit from Exception is not allowed",
            )),
        }
    }

    /// The error raised by `raise value`.
    pub(crate) fn to_raise(&self, value: Value) -> EvalResult<Box<GuestError>> {
        match value {
            Value::Type(t) if t.error_kind().is_some() => match self.instantiate(&t, Args::default())? {
                Value::Object(obj) => Ok(GuestError::raised(obj)),
                _ => Err(type_error("exception construction did not produce an exception")),
            },
            Value::Object(obj) if obj.exception_state().is_some() => Ok(GuestError::raised(obj)),
            _ => Err(type_error("exceptions must derive from Exception")),
        }
    }

    pub(crate) fn assign(&self, frame: &Frame, target: &Expr, value: Value) -> EvalResult<()> {
        match target {
            Expr::Name(name, _) => self.store_name(frame, name, value),
            Expr::Attribute { value: obj, attr, .. } => {
                let obj = self.eval(frame, obj)?;
                mediator::setattr(self, &obj, attr, value)
            }
            Expr::Subscript {
                value: obj, index, ..
            } => {
                let obj = self.eval(frame, obj)?;
                if let Expr::Slice { lower, upper, step } = &**index {
                    let (lo, hi, st) = self.slice_bounds(frame, lower, upper, step)?;
                    return self.set_slice(&obj, lo, hi, st, value);
                }
                let key = self.eval(frame, index)?;
                self.set_item(&obj, key, value)
            }
            Expr::Tuple(targets, _) | Expr::List(targets, _) => {
                let items = self.iterate(&value)?;
                if items.len() != targets.len() {
                    return Err(error(
                        ErrorKind::ValueError,
                        format!(
                            "cannot unpack {} values into {} targets",
                            items.len(),
                            targets.len()
                        ),
                    ));
                }
                for (t, v) in targets.iter().zip(items) {
                    self.assign(frame, t, v)?;
                }
                Ok(())
            }
            _ => Err(error(ErrorKind::SyntaxError, "cannot assign to expression")),
        }
    }

    fn delete(&self, frame: &Frame, target: &Expr) -> EvalResult<()> {
        match target {
            Expr::Name(name, _) => self.delete_name(frame, name),
            Expr::Attribute { value: obj, attr, .. } => {
                let obj = self.eval(frame, obj)?;
                mediator::delattr(self, &obj, attr)
            }
            Expr::Subscript {
                value: obj, index, ..
            } => {
                let obj = self.eval(frame, obj)?;
                if let Expr::Slice { lower, upper, step } = &**index {
                    let (lo, hi, st) = self.slice_bounds(frame, lower, upper, step)?;
                    return self.del_slice(&obj, lo, hi, st);
                }
                let key = self.eval(frame, index)?;
                self.del_item(&obj, &key)
            }
            Expr::Tuple(targets, _) | Expr::List(targets, _) => {
                for t in targets {
                    self.delete(frame, t)?;
                }
                Ok(())
            }
            _ => Err(error(ErrorKind::SyntaxError, "cannot delete expression")),
        }
    }

    pub(crate) fn lookup_name(&self, frame: &Frame, name: &str) -> EvalResult<Value> {
        let local = match &frame.locals {
            Locals::Module => None,
            Locals::Function(env) => env.get(name),
            Locals::Class { ns, outer, .. } => ns
                .borrow()
                .get(name)
                .cloned()
                .or_else(|| outer.as_ref().and_then(|env| env.get(name))),
            Locals::Mapping(m) => m.get_str(name),
        };
        if let Some(v) = local {
            return Ok(v);
        }
        if name == "__class__"
            && let Some(cell) = &frame.class_cell
            && let Some(cls) = cell.borrow().clone()
        {
            return Ok(Value::Type(cls));
        }
        frame.globals.lookup(name).ok_or_else(|| name_error(name))
    }

    pub(crate) fn store_name(&self, frame: &Frame, name: &str, value: Value) -> EvalResult<()> {
        match &frame.locals {
            Locals::Module => frame.globals.set(name, value),
            Locals::Function(env) => env.set(name, value),
            Locals::Class { ns, .. } => {
                ns.borrow_mut().insert(name.to_string(), value);
            }
            Locals::Mapping(m) => m.insert_str(name, value)?,
        }
        Ok(())
    }

    fn delete_name(&self, frame: &Frame, name: &str) -> EvalResult<()> {
        let removed = match &frame.locals {
            Locals::Module => frame.globals.remove(name),
            Locals::Function(env) => env.remove(name),
            Locals::Class { ns, .. } => ns.borrow_mut().shift_remove(name).is_some(),
            Locals::Mapping(m) => m.remove(&crate::kernel::store::MapKey::str(name))?.is_some(),
        };
        if removed { Ok(()) } else { Err(name_error(name)) }
    }
}

#[cfg(test)]
mod tests {
    use crate::interp::testing::{interpreter, output};
    use crate::kernel::scope::Scope;
    use crate::kernel::store::LockedMapping;
    use std::rc::Rc;

    fn run(src: &str) -> String {
        let (interp, buf) = interpreter();
        let scope = Scope::with_builtins(Rc::new(LockedMapping::new()));
        crate::interp::builtins::install_for_tests(&interp, &scope);
        interp.run_source(src, &scope, "<test>", false).unwrap();
        output(&buf)
    }

    #[test]
    fn test_loops_with_else_and_break() {
        let out = run(
            "for i in range(5):\n    if i == 3:\n        break\nelse:\n    print('no')\nprint(i)\n\
             n = 0\nwhile n < 3:\n    n += 1\nelse:\n    print('done', n)\n",
        );
        assert_eq!(out, "3\ndone 3\n");
    }

    #[test]
    fn test_try_finally_ordering() {
        let out = run(
            "def f():\n    try:\n        raise ValueError('x')\n    except ValueError as e:\n        print('caught', e)\n        return 1\n    finally:\n        print('finally')\n\
             print(f())\n",
        );
        assert_eq!(out, "caught x\nfinally\n1\n");
    }

    #[test]
    fn test_with_calls_exit_on_error_and_can_suppress() {
        let out = run(
            "class CM:\n    def __enter__(self):\n        print('enter')\n        return 5\n    def __exit__(self, t, e, tb):\n        print('exit', t is not None)\n        return True\n\
             with CM() as v:\n    print(v)\n    raise KeyError('k')\nprint('after')\n",
        );
        assert_eq!(out, "enter\n5\nexit True\nafter\n");
    }

    #[test]
    fn test_closures_and_nonlocal() {
        let out = run(
            "def counter():\n    n = 0\n    def inc():\n        nonlocal n\n        n += 1\n        return n\n    return inc\n\
             c = counter()\nc()\nprint(c())\n",
        );
        assert_eq!(out, "2\n");
    }

    #[test]
    fn test_bare_raise_reraises_the_handled_error() {
        let (interp, _) = interpreter();
        let scope = Scope::with_builtins(Rc::new(LockedMapping::new()));
        crate::interp::builtins::install_for_tests(&interp, &scope);
        let err = interp
            .run_source(
                "try:\n    [][1]\nexcept IndexError:\n    raise\n",
                &scope,
                "<test>",
                false,
            )
            .unwrap_err();
        assert_eq!(err.type_name(), "IndexError");
    }
}
