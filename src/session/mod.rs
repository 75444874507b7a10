//! Shell sessions.
//!
//! A [`Session`] is one sealed top-level scope, the interpreter that runs
//! against it, and the [`ShellToken`] that alone unlocks the real call-stack
//! traces of errors raised inside it. Sessions nest: the `nest()` built-in
//! launches a child at `depth + 1` reading from the same input, and the
//! parent resumes when the child's input ends.

pub mod chunk;
pub mod input;

use std::cell::RefCell;
use std::io::{self, Write};
use std::path::PathBuf;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::interp::{EvalResult, GuestError, Interpreter, Prelude, runtime_error};
use crate::kernel::manager::ScopeManager;
use crate::kernel::scope::Scope;
use crate::kernel::sealer;
use crate::kernel::store::LockedObject;
use crate::kernel::types::Builtin;
use crate::kernel::value::Value;
use crate::loader::source::LocalSource;
use crate::loader::{Fetcher, Loader, LoaderSettings};

pub use chunk::Chunker;
pub use input::{EditorInput, Line, LineSource, ScriptedInput};

pub const PRIMARY_PROMPT: &str = ">>> ";
pub const CONTINUATION_PROMPT: &str = "... ";

static NEXT_SESSION: AtomicU64 = AtomicU64::new(1);

/// Proof of being the trusted launcher of one session.
#[derive(Debug)]
pub struct ShellToken {
    session: u64,
}

impl ShellToken {
    pub(crate) fn issue(session: u64) -> Self {
        Self { session }
    }

    pub fn session(&self) -> u64 {
        self.session
    }
}

/// Settings shared by a session and every session nested inside it.
#[derive(Clone)]
pub struct SessionConfig {
    pub prelude: Rc<Prelude>,
    pub local_root: PathBuf,
    pub loader: LoaderSettings,
    pub fetcher: Rc<dyn Fetcher>,
    pub output: Rc<RefCell<dyn Write>>,
    pub banners: bool,
}

/// Builds a value for the top-level scope once the interpreter exists.
pub type Injection = Box<dyn FnOnce(&Interpreter) -> EvalResult<Value>>;

pub struct LaunchOptions {
    pub config: SessionConfig,
    pub depth: usize,
    /// Reported as `__file__` and in traces.
    pub file: String,
    /// Input for `nest()`. Without it the built-in is not installed.
    pub input: Option<Rc<RefCell<dyn LineSource>>>,
    /// One named value bound in the top-level scope only.
    pub inject: Option<(String, Injection)>,
}

impl LaunchOptions {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            depth: 1,
            file: "<shell>".to_string(),
            input: None,
            inject: None,
        }
    }
}

pub struct Session {
    interp: Interpreter,
    // Keeps the module table and search stack alive for the session.
    _manager: Rc<ScopeManager>,
    scope: Rc<Scope>,
    token: ShellToken,
    depth: usize,
    file: String,
    banners: bool,
}

impl Session {
    pub fn launch(options: LaunchOptions) -> EvalResult<Self> {
        let LaunchOptions {
            config,
            depth,
            file,
            input,
            inject,
        } = options;
        let id = NEXT_SESSION.fetch_add(1, Ordering::Relaxed);
        let token = ShellToken::issue(id);
        let interp = Interpreter::new(config.prelude.clone(), config.output.clone(), id);

        let loader = Loader::new(config.loader.clone(), config.fetcher.clone());
        loader.push(Rc::new(LocalSource::new(&config.local_root)));
        let manager = ScopeManager::new(config.prelude.clone(), loader);

        let mut extra = Vec::new();
        if let Some(input) = input {
            extra.push(("nest".to_string(), nest_capability(config.clone(), input, depth)));
        }
        let scope = manager.top_level(&interp, &file, extra)?;
        if let Some((name, build)) = inject {
            let value = build(&interp)?;
            scope.set(&name, value);
        }
        tracing::info!(session = id, depth, "session started");
        Ok(Self {
            interp,
            _manager: manager,
            scope,
            token,
            depth,
            file,
            banners: config.banners,
        })
    }

    pub fn token(&self) -> &ShellToken {
        &self.token
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn scope(&self) -> &Rc<Scope> {
        &self.scope
    }

    pub fn interpreter(&self) -> &Interpreter {
        &self.interp
    }

    /// Run a whole script against the top-level scope.
    pub fn run_script(&self, src: &str) -> EvalResult<()> {
        self.interp.run_source(src, &self.scope, &self.file, false)?;
        Ok(())
    }

    /// Run one interactive chunk, echoing a trailing expression's value.
    /// Errors are reported, not returned.
    pub fn run_chunk(&self, chunk: &str) -> bool {
        let result = self
            .interp
            .run_source(chunk, &self.scope, &self.file, true)
            .and_then(|value| match value {
                Some(v) if !v.is_none() => self.interp.repr(&v).map(Some),
                _ => Ok(None),
            });
        match result {
            Ok(Some(text)) => {
                self.interp.write(&format!("{text}\n"));
                true
            }
            Ok(None) => true,
            Err(err) => {
                self.report(&err);
                false
            }
        }
    }

    /// Print `err` as a traceback. The walkable trace is read with this
    /// session's token.
    pub fn report(&self, err: &GuestError) {
        let text = format_traceback(err, &self.token);
        self.interp.write(&text);
    }

    /// Read, chunk and run input until it ends.
    pub fn interact(&self, input: &Rc<RefCell<dyn LineSource>>) -> io::Result<()> {
        if self.banners {
            self.interp.write(&format!("Nest shell {}\n", self.depth));
        }
        let mut chunker = Chunker::new();
        loop {
            let prompt = if chunker.is_empty() {
                PRIMARY_PROMPT
            } else {
                CONTINUATION_PROMPT
            };
            // The borrow ends before the chunk runs; `nest()` reads from the
            // same source.
            let line = input.borrow_mut().read_line(prompt)?;
            let chunk = match line {
                Line::Text(text) => chunker.push(&text),
                Line::Interrupted => {
                    chunker.clear();
                    continue;
                }
                Line::Eof => match chunker.finish() {
                    Some(chunk) => {
                        input.borrow_mut().remember(&chunk);
                        self.run_chunk(&chunk);
                        break;
                    }
                    None => break,
                },
            };
            if let Some(chunk) = chunk {
                input.borrow_mut().remember(&chunk);
                self.run_chunk(&chunk);
            }
        }
        if self.banners {
            self.interp.write(&format!("Unnest shell {}\n", self.depth));
        }
        tracing::info!(session = self.token.session(), depth = self.depth, "session ended");
        Ok(())
    }
}

pub fn format_traceback(err: &GuestError, token: &ShellToken) -> String {
    let mut out = String::from("Traceback (most recent call last):\n");
    let lines = match err.traceback(token) {
        Some(frames) => frames.iter().rev().map(|f| f.render()).collect(),
        None => err.rendered_trace(),
    };
    for line in lines {
        out.push_str(&line);
        out.push('\n');
    }
    out.push_str(&err.to_string());
    out.push('\n');
    out
}

fn nest_capability(config: SessionConfig, input: Rc<RefCell<dyn LineSource>>, depth: usize) -> Value {
    sealer::native(
        "nest",
        "",
        Some("Start a nested shell on the same input. Returns None when it exits."),
        move |_, a| {
            a.exact("nest", 0, 0)?;
            let child = Session::launch(LaunchOptions {
                config: config.clone(),
                depth: depth + 1,
                file: "<shell>".to_string(),
                input: Some(input.clone()),
                inject: None,
            })?;
            child
                .interact(&input)
                .map_err(|e| runtime_error(format!("nested shell input failed: {e}")))?;
            Ok(Value::None)
        },
    )
}

/// The counter object the demo shell injects as `obj`: `access()`,
/// `incr()` and `decr()` over one private integer.
pub fn demo_counter(interp: &Interpreter) -> EvalResult<Value> {
    let count = Value::list(vec![Value::Int(0)]);
    let methods = [
        ("access", "def fn():\n    return count[0]\n"),
        ("incr", "def fn():\n    count[0] += 1\n    return count[0]\n"),
        ("decr", "def fn():\n    count[0] -= 1\n    return count[0]\n"),
    ];
    let obj = LockedObject::new(interp.prelude().builtin(Builtin::LockedObject).clone());
    for (name, wrapper) in methods {
        let cap = sealer::seal(interp, wrapper, &[("count", count.clone())], "fn")?;
        obj.store_overflow(name, cap)?;
    }
    obj.freeze();
    Ok(Value::Object(Rc::new(obj)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::MemoryFetcher;

    fn config(root: &std::path::Path) -> (SessionConfig, Rc<RefCell<Vec<u8>>>) {
        let buf = Rc::new(RefCell::new(Vec::new()));
        let config = SessionConfig {
            prelude: Prelude::new(),
            local_root: root.to_path_buf(),
            loader: LoaderSettings::default(),
            fetcher: Rc::new(MemoryFetcher::new()),
            output: buf.clone(),
            banners: true,
        };
        (config, buf)
    }

    fn shell(lines: &[&str], demo: bool) -> String {
        let dir = tempfile::tempdir().unwrap();
        let (config, buf) = config(dir.path());
        let input: Rc<RefCell<dyn LineSource>> = Rc::new(RefCell::new(ScriptedInput::new(lines.to_vec())));
        let mut options = LaunchOptions::new(config);
        options.input = Some(input.clone());
        if demo {
            let build: Injection = Box::new(demo_counter);
            options.inject = Some(("obj".to_string(), build));
        }
        let session = Session::launch(options).unwrap();
        session.interact(&input).unwrap();
        String::from_utf8_lossy(&buf.borrow()).into_owned()
    }

    #[test]
    fn test_echo_and_blocks() {
        let out = shell(&["1 + 2", "None", "def f(x):", "    return x * 2", "", "f(4)"], false);
        assert_eq!(out, "Nest shell 1\n3\n8\nUnnest shell 1\n");
    }

    #[test]
    fn test_errors_print_a_traceback_and_the_loop_continues() {
        let out = shell(&["1 / 0", "'after'"], false);
        assert!(out.starts_with("Nest shell 1\nTraceback (most recent call last):\n"), "{out}");
        assert!(out.contains("ZeroDivisionError: division by zero\n"), "{out}");
        assert!(out.ends_with("'after'\nUnnest shell 1\n"), "{out}");
    }

    #[test]
    fn test_nest_runs_a_child_on_the_same_input() {
        let out = shell(&["x = 1", "nest()", "x = 2", "print(x)"], false);
        assert_eq!(out, "Nest shell 1\nNest shell 2\n2\nUnnest shell 2\nUnnest shell 1\n");
    }

    #[test]
    fn test_demo_counter_hides_its_state() {
        let out = shell(
            &["obj.incr()", "obj.incr()", "obj.decr()", "obj.access()", "hasattr(obj.access, 'count')"],
            true,
        );
        assert_eq!(out, "Nest shell 1\n1\n2\n1\n1\nFalse\nUnnest shell 1\n");
    }

    #[test]
    fn test_injected_value_is_not_visible_to_modules() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("watcher.py"), "try:\n    obj\n    SEEN = True\nexcept NameError:\n    SEEN = False\n").unwrap();
        let (config, buf) = config(dir.path());
        let mut options = LaunchOptions::new(config);
        let build: Injection = Box::new(demo_counter);
        options.inject = Some(("obj".to_string(), build));
        let session = Session::launch(options).unwrap();
        session.run_script("import watcher\nprint(watcher.SEEN, obj.access())\n").unwrap();
        assert_eq!(String::from_utf8_lossy(&buf.borrow()), "False 0\n");
    }

    #[test]
    fn test_tokens_unlock_only_their_own_session() {
        let dir = tempfile::tempdir().unwrap();
        let (config, _) = config(dir.path());
        let a = Session::launch(LaunchOptions::new(config.clone())).unwrap();
        let b = Session::launch(LaunchOptions::new(config)).unwrap();
        let err = a.run_script("def f():\n    raise ValueError('x')\nf()\n").unwrap_err();
        assert!(err.traceback(a.token()).is_some_and(|t| !t.is_empty()));
        assert!(err.traceback(b.token()).is_none());
    }
}
