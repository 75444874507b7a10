//! Guest errors.
//!
//! Every failure inside the evaluator travels as a boxed [`GuestError`]. The
//! call-stack trace it accumulates is private: guest code only ever sees the
//! pre-rendered text, and the walkable frames (which hold the scopes they ran
//! in) are released only to the holder of the launching session's
//! [`ShellToken`].

use std::fmt;
use std::rc::Rc;

use crate::error::{ErrorKind, KernelError};
use crate::kernel::scope::Scope;
use crate::kernel::store::LockedObject;
use crate::kernel::value::Value;
use crate::session::ShellToken;

pub type EvalResult<T> = Result<T, Box<GuestError>>;

/// One entry of a call-stack trace.
#[derive(Clone)]
pub struct TraceFrame {
    pub function: Rc<str>,
    pub file: Rc<str>,
    pub line: usize,
    scope: Option<Rc<Scope>>,
}

impl TraceFrame {
    pub(crate) fn new(function: Rc<str>, file: Rc<str>, line: usize, scope: Rc<Scope>) -> Self {
        Self {
            function,
            file,
            line,
            scope: Some(scope),
        }
    }

    /// Scope the frame executed against.
    pub fn scope(&self) -> Option<&Rc<Scope>> {
        self.scope.as_ref()
    }

    pub fn render(&self) -> String {
        format!(
            "  File \"{}\", line {}, in {}",
            self.file, self.line, self.function
        )
    }
}

#[derive(Clone)]
pub enum Payload {
    Kernel(KernelError),
    Builtin(ErrorKind, String),
    /// An exception object raised by guest code.
    Raised(Rc<LockedObject>),
}

#[derive(Clone)]
pub struct GuestError {
    payload: Payload,
    // Innermost frame first.
    trace: Vec<TraceFrame>,
    session: u64,
}

impl GuestError {
    pub fn new(payload: Payload) -> Box<Self> {
        Box::new(Self {
            payload,
            trace: Vec::new(),
            session: 0,
        })
    }

    /// Re-raise a guest exception object, resuming the trace it carries.
    pub fn raised(obj: Rc<LockedObject>) -> Box<Self> {
        let (trace, session) = match obj.exception_state() {
            Some(state) => (state.trace.borrow().clone(), state.session.get()),
            None => (Vec::new(), 0),
        };
        Box::new(Self {
            payload: Payload::Raised(obj),
            trace,
            session,
        })
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn kind(&self) -> ErrorKind {
        match &self.payload {
            Payload::Kernel(e) => e.kind(),
            Payload::Builtin(kind, _) => *kind,
            Payload::Raised(obj) => obj.class().error_kind().unwrap_or(ErrorKind::Exception),
        }
    }

    pub fn is_a(&self, kind: ErrorKind) -> bool {
        self.kind().is_a(kind)
    }

    pub fn type_name(&self) -> String {
        match &self.payload {
            Payload::Raised(obj) => obj.class().name().to_string(),
            _ => self.kind().name().to_string(),
        }
    }

    pub fn message(&self) -> String {
        match &self.payload {
            Payload::Kernel(e) => e.to_string(),
            Payload::Builtin(_, msg) => msg.clone(),
            Payload::Raised(obj) => {
                let args = obj.exception_state().map(|s| s.args()).unwrap_or_default();
                render_args(&args)
            }
        }
    }

    pub(crate) fn push_frame(&mut self, frame: TraceFrame, session: u64) {
        if self.session == 0 {
            self.session = session;
        }
        self.trace.push(frame);
    }

    pub(crate) fn trace(&self) -> &[TraceFrame] {
        &self.trace
    }

    pub(crate) fn session(&self) -> u64 {
        self.session
    }

    /// The walkable trace, for the session that issued `token` only.
    pub fn traceback(&self, token: &ShellToken) -> Option<&[TraceFrame]> {
        (token.session() == self.session && self.session != 0).then_some(self.trace.as_slice())
    }

    /// Text rendering of the trace, outermost call first.
    pub fn rendered_trace(&self) -> Vec<String> {
        render_trace(&self.trace)
    }
}

pub(crate) fn render_trace(trace: &[TraceFrame]) -> Vec<String> {
    trace.iter().rev().map(TraceFrame::render).collect()
}

fn render_args(args: &[Value]) -> String {
    match args {
        [] => String::new(),
        [Value::Str(s)] => s.to_string(),
        [one] => format!("{one:?}"),
        many => format!("{:?}", Value::tuple(many.to_vec())),
    }
}

impl fmt::Debug for GuestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.type_name(), self.message())
    }
}

impl fmt::Display for GuestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = self.message();
        if msg.is_empty() {
            write!(f, "{}", self.type_name())
        } else {
            write!(f, "{}: {}", self.type_name(), msg)
        }
    }
}

impl std::error::Error for GuestError {}

impl From<KernelError> for Box<GuestError> {
    fn from(err: KernelError) -> Self {
        GuestError::new(Payload::Kernel(err))
    }
}

pub fn error(kind: ErrorKind, msg: impl Into<String>) -> Box<GuestError> {
    GuestError::new(Payload::Builtin(kind, msg.into()))
}

pub fn type_error(msg: impl Into<String>) -> Box<GuestError> {
    error(ErrorKind::TypeError, msg)
}

pub fn value_error(msg: impl Into<String>) -> Box<GuestError> {
    error(ErrorKind::ValueError, msg)
}

pub fn attribute_error(msg: impl Into<String>) -> Box<GuestError> {
    error(ErrorKind::AttributeError, msg)
}

pub fn name_error(name: &str) -> Box<GuestError> {
    error(ErrorKind::NameError, format!("name '{name}' is not defined"))
}

pub fn index_error(msg: impl Into<String>) -> Box<GuestError> {
    error(ErrorKind::IndexError, msg)
}

pub fn key_error(key: impl Into<String>) -> Box<GuestError> {
    error(ErrorKind::KeyError, key)
}

pub fn runtime_error(msg: impl Into<String>) -> Box<GuestError> {
    error(ErrorKind::RuntimeError, msg)
}

pub fn forbidden(msg: impl Into<String>) -> Box<GuestError> {
    KernelError::ForbiddenAccess(msg.into()).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_uses_kind_and_message() {
        let err = type_error("bad operand");
        assert_eq!(err.to_string(), "TypeError: bad operand");
        let err: Box<GuestError> = KernelError::ModuleResolution("pkg".into()).into();
        assert_eq!(err.to_string(), "ModuleResolutionError: no module named 'pkg'");
        assert!(err.is_a(ErrorKind::ImportError));
    }

    #[test]
    fn test_trace_is_withheld_from_other_sessions() {
        let mut err = value_error("x");
        let scope = Scope::new();
        err.push_frame(TraceFrame::new("f".into(), "<stdin>".into(), 3, scope), 7);
        assert!(err.traceback(&ShellToken::issue(8)).is_none());
        let frames = err.traceback(&ShellToken::issue(7)).unwrap();
        assert_eq!(frames.len(), 1);
        assert!(frames[0].scope().is_some());
        assert_eq!(
            err.rendered_trace(),
            vec!["  File \"<stdin>\", line 3, in f".to_string()]
        );
    }
}
