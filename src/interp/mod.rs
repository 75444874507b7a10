//! Tree-walking evaluator for guest source.
//!
//! The evaluator knows nothing about policy. Everything it runs has already
//! passed the program rewriter, every attribute step it performs goes through
//! the reflection mediator, and every name it resolves comes from an explicit
//! [`Scope`] handed in by the caller.
//!
//! ```text
//!   source ──parse──▶ AST ──rewrite──▶ AST ──exec──▶ Scope
//!                                        │
//!                        attribute steps └──▶ kernel::mediator
//! ```

mod attr;
pub mod builtins;
mod call;
mod env;
mod exception;
mod exec;
mod expr;
mod methods;
mod ops;
mod prelude;

use std::cell::{Cell, RefCell};
use std::collections::HashSet;
use std::io::Write;
use std::rc::Rc;

pub use call::ClassSpec;
pub use env::Env;
pub use exception::{
    EvalResult, GuestError, Payload, TraceFrame, attribute_error, error, forbidden, index_error,
    key_error, name_error, runtime_error, type_error, value_error,
};
pub use prelude::Prelude;

pub(crate) use exception::render_trace;
pub(crate) use ops::{float_repr, slice_indices, str_repr};
use exec::{Frame, Locals};

use crate::error::{ErrorKind, KernelError};
use crate::kernel::rewriter;
use crate::kernel::scope::Scope;
use crate::kernel::store::LockedMapping;
use crate::kernel::types::{Builtin, SealedType};
use crate::kernel::value::{Descriptor, Value};
use crate::script::{self, ParseError};

/// Nesting limit for guest calls.
pub const MAX_DEPTH: usize = 150;

pub struct Interpreter {
    prelude: Rc<Prelude>,
    out: Rc<RefCell<dyn Write>>,
    session: u64,
    depth: Cell<usize>,
    scopes: RefCell<Vec<Rc<Scope>>>,
    repr_guard: RefCell<HashSet<usize>>,
}

impl Interpreter {
    pub fn new(prelude: Rc<Prelude>, out: Rc<RefCell<dyn Write>>, session: u64) -> Self {
        Self {
            prelude,
            out,
            session,
            depth: Cell::new(0),
            scopes: RefCell::new(Vec::new()),
            repr_guard: RefCell::new(HashSet::new()),
        }
    }

    pub fn prelude(&self) -> &Rc<Prelude> {
        &self.prelude
    }

    pub fn session(&self) -> u64 {
        self.session
    }

    pub fn output(&self) -> Rc<RefCell<dyn Write>> {
        self.out.clone()
    }

    /// Write guest output. Write failures on the sink are not guest errors.
    pub fn write(&self, text: &str) {
        let mut out = self.out.borrow_mut();
        if let Err(e) = out.write_all(text.as_bytes()).and_then(|_| out.flush()) {
            tracing::warn!("failed to write guest output: {e}");
        }
    }

    /// Scope of the innermost running frame.
    pub fn current_scope(&self) -> Option<Rc<Scope>> {
        self.scopes.borrow().last().cloned()
    }

    /// Parse, rewrite and execute guest source against `scope`. In
    /// interactive mode the value of a trailing expression statement is
    /// returned.
    pub fn run_source(
        &self,
        src: &str,
        scope: &Rc<Scope>,
        file: &str,
        interactive: bool,
    ) -> EvalResult<Option<Value>> {
        let stmts = script::parse_module(src).map_err(syntax_error)?;
        let stmts = rewriter::rewrite_module(stmts).inspect_err(|e| {
            tracing::info!(file, "guest source rejected: {e}");
        })?;
        self.run_module(&stmts, scope, file, interactive)
    }

    /// Execute source that did not come from guest code, without rewriting.
    pub fn run_trusted(&self, src: &str, scope: &Rc<Scope>, file: &str) -> EvalResult<()> {
        let stmts = script::parse_module(src).map_err(syntax_error)?;
        self.run_module(&stmts, scope, file, false)?;
        Ok(())
    }

    pub fn run_module(
        &self,
        stmts: &[script::ast::Stmt],
        scope: &Rc<Scope>,
        file: &str,
        interactive: bool,
    ) -> EvalResult<Option<Value>> {
        let frame = Frame::new(scope.clone(), Locals::Module, None, "<module>", file);
        self.in_frame(&frame, |interp| interp.exec_module_body(&frame, stmts, interactive))
    }

    /// Execute `src` with optional explicit locals, as the `exec` built-ins do.
    pub fn exec_source(
        &self,
        src: &str,
        scope: &Rc<Scope>,
        locals: Option<Rc<LockedMapping>>,
        rewrite: bool,
    ) -> EvalResult<()> {
        let mut stmts = script::parse_module(src).map_err(syntax_error)?;
        if rewrite {
            stmts = rewriter::rewrite_module(stmts)?;
        }
        let locals = match locals {
            Some(m) => Locals::Mapping(m),
            None => Locals::Module,
        };
        let frame = Frame::new(scope.clone(), locals, None, "<module>", "<string>");
        self.in_frame(&frame, |interp| {
            interp.exec_module_body(&frame, &stmts, false).map(|_| ())
        })
    }

    /// Evaluate a single expression, as the `eval` built-ins do.
    pub fn eval_source(
        &self,
        src: &str,
        scope: &Rc<Scope>,
        locals: Option<Rc<LockedMapping>>,
        rewrite: bool,
    ) -> EvalResult<Value> {
        let mut expr = script::parse_expression(src).map_err(syntax_error)?;
        if rewrite {
            expr = rewriter::rewrite_expression(expr)?;
        }
        let locals = match locals {
            Some(m) => Locals::Mapping(m),
            None => Locals::Module,
        };
        let frame = Frame::new(scope.clone(), locals, None, "<module>", "<string>");
        self.in_frame(&frame, |interp| interp.eval(&frame, &expr))
    }

    /// Run `body` with `frame` pushed, recording the frame on any error
    /// that escapes it.
    fn in_frame<T>(&self, frame: &Frame, body: impl FnOnce(&Self) -> EvalResult<T>) -> EvalResult<T> {
        let depth = self.depth.get();
        if depth >= MAX_DEPTH {
            return Err(error(
                ErrorKind::RecursionError,
                "maximum recursion depth exceeded",
            ));
        }
        self.depth.set(depth + 1);
        self.scopes.borrow_mut().push(frame.globals.clone());
        let result = body(self);
        self.scopes.borrow_mut().pop();
        self.depth.set(depth);
        result.map_err(|mut err| {
            err.push_frame(frame.trace_frame(), self.session);
            err
        })
    }

    /// Run `body` one container level deeper. Structural comparison and
    /// repr recurse through nested values and share the call depth limit.
    pub(crate) fn descend<T>(&self, context: &str, body: impl FnOnce(&Self) -> EvalResult<T>) -> EvalResult<T> {
        let depth = self.depth.get();
        if depth >= MAX_DEPTH {
            return Err(error(
                ErrorKind::RecursionError,
                format!("maximum recursion depth exceeded {context}"),
            ));
        }
        self.depth.set(depth + 1);
        let result = body(self);
        self.depth.set(depth);
        result
    }

    /// Type of any value. May return the root type; callers that hand the
    /// result to guest code must go through the mediator.
    pub fn type_of(&self, value: &Value) -> Rc<SealedType> {
        let p = &self.prelude;
        let b = |builtin| p.builtin(builtin).clone();
        match value {
            Value::None => b(Builtin::NoneType),
            Value::Bool(_) => b(Builtin::Bool),
            Value::Int(_) => b(Builtin::Int),
            Value::Float(_) => b(Builtin::Float),
            Value::Str(_) => b(Builtin::Str),
            Value::Bytes(_) => b(Builtin::Bytes),
            Value::List(_) => b(Builtin::List),
            Value::Tuple(_) => b(Builtin::Tuple),
            Value::Mapping(_) => b(Builtin::Dict),
            Value::Object(o) => o.class().clone(),
            Value::Type(_) => p.root().clone(),
            Value::Function(_) => b(Builtin::Function),
            Value::Native(_) => b(Builtin::NativeFunction),
            Value::Bound(_) => b(Builtin::Method),
            Value::Capability(_) => b(Builtin::Capability),
            Value::Descriptor(d) => match **d {
                Descriptor::Property { .. } => b(Builtin::Property),
                Descriptor::ClassMethod(_) => b(Builtin::ClassMethod),
                Descriptor::StaticMethod(_) => b(Builtin::StaticMethod),
            },
            Value::Super(_) => b(Builtin::Super),
            Value::Code(_) => b(Builtin::Code),
            Value::Cell(_) => b(Builtin::Cell),
            Value::Scope(_) => b(Builtin::Scope),
        }
    }

    pub fn isinstance(&self, value: &Value, ty: &SealedType) -> bool {
        self.type_of(value).is_subtype_of(ty)
    }

    /// The guest object standing for an error, as bound by `except ... as e`.
    pub fn exception_object(&self, err: &GuestError) -> Value {
        use crate::kernel::store::LockedObject;
        let obj = match err.payload() {
            Payload::Raised(obj) => obj.clone(),
            _ => {
                let class = self.prelude.error_type(err.kind()).clone();
                Rc::new(LockedObject::exception(class, vec![Value::from(err.message())]))
            }
        };
        if let Some(state) = obj.exception_state() {
            *state.trace.borrow_mut() = err.trace().to_vec();
            state.session.set(err.session());
        }
        Value::Object(obj)
    }

    /// Whether `err` is caught by a handler naming `ty`.
    pub fn error_matches(&self, err: &GuestError, ty: &SealedType) -> bool {
        match err.payload() {
            Payload::Raised(obj) => obj.class().is_subtype_of(ty),
            _ => self.prelude.error_type(err.kind()).is_subtype_of(ty),
        }
    }
}

pub(crate) fn syntax_error(err: ParseError) -> Box<GuestError> {
    error(ErrorKind::SyntaxError, err.to_string())
}

impl From<ParseError> for Box<GuestError> {
    fn from(err: ParseError) -> Self {
        syntax_error(err)
    }
}

/// Kernel refusal carried as a guest error.
pub(crate) fn locked(key: &str, target: &str) -> Box<GuestError> {
    KernelError::locked(key, target).into()
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// Interpreter writing into a shared buffer, plus that buffer.
    pub fn interpreter() -> (Interpreter, Rc<RefCell<Vec<u8>>>) {
        let buf = Rc::new(RefCell::new(Vec::new()));
        let interp = Interpreter::new(Prelude::new(), buf.clone(), 1);
        (interp, buf)
    }

    pub fn output(buf: &Rc<RefCell<Vec<u8>>>) -> String {
        String::from_utf8_lossy(&buf.borrow()).into_owned()
    }
}
