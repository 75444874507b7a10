//! Scope manager.
//!
//! Every scope guest code runs in, top level or imported module, is built
//! here along one path:
//!
//! 1. copy the host built-in set and strip the raw primitives and the
//!    exception types
//! 2. install sealed replacements (`type`, `super`, `getattr`, `exec`, ...)
//!    and lock the built-in set
//! 3. re-install the exception types, the standard library objects and
//!    `SignedClass` into the ordinary region
//! 4. fill the dunder region and lock the scope
//!
//! The manager also owns the session's [`Loader`] and executes the modules
//! it resolves.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use sha2::{Digest, Sha256};

use super::mediator;
use super::scope::Scope;
use super::sealer;
use super::stdlib;
use super::store::{LockedMapping, LockedObject, MapKey};
use super::types::{Builtin, TypeKind};
use super::value::Value;
use crate::error::ErrorKind;
use crate::interp::builtins::{RAW_PRIMITIVES, build_class, host_builtins};
use crate::interp::{EvalResult, Interpreter, Prelude, error, forbidden, runtime_error, type_error, value_error};
use crate::loader::resolve::{self, ImportContext};
use crate::loader::{
    ALLOWED_SCHEMES, FoundModule, Loader, ModuleKind, Source, archive, check_name, collapse_slashes, git, parent_dir,
};

/// `__name__` of a session's top-level scope.
pub const TOP_LEVEL_NAME: &str = "__?none?__";

/// Identity of the scope being built.
pub struct ModuleSpec {
    pub name: String,
    pub file: String,
    pub path: String,
    pub package: String,
    pub exports: Rc<LockedObject>,
    /// Value bound to `__loader__`.
    pub loader: Value,
    /// Additional sealed built-ins for this scope only.
    pub extra_builtins: Vec<(String, Value)>,
}

pub struct ScopeManager {
    prelude: Rc<Prelude>,
    loader: Loader,
    filtered: LockedMapping,
    stdlib: Vec<(&'static str, Value)>,
    this: Weak<ScopeManager>,
}

/// The host set minus the raw primitives and every exception type.
fn filtered_builtins(prelude: &Prelude) -> LockedMapping {
    let host = host_builtins(prelude);
    for (key, value) in host.items() {
        let raw = key.as_str().is_some_and(|k| RAW_PRIMITIVES.contains(&k));
        let exception = matches!(&value, Value::Type(t) if t.error_kind().is_some());
        if raw || exception {
            // The host set is never locked.
            let _ = host.remove(&key);
        }
    }
    host
}

fn upgrade(this: &Weak<ScopeManager>) -> EvalResult<Rc<ScopeManager>> {
    this.upgrade().ok_or_else(|| runtime_error("the session owning this capability has ended"))
}

impl ScopeManager {
    pub fn new(prelude: Rc<Prelude>, loader: Loader) -> Rc<Self> {
        Rc::new_cyclic(|this| Self {
            filtered: filtered_builtins(&prelude),
            stdlib: stdlib::modules(&prelude),
            prelude,
            loader,
            this: this.clone(),
        })
    }

    pub fn prelude(&self) -> &Rc<Prelude> {
        &self.prelude
    }

    pub fn loader(&self) -> &Loader {
        &self.loader
    }

    pub fn new_exports(&self, name: &str) -> Rc<LockedObject> {
        Rc::new(LockedObject::module_exports(
            self.prelude.builtin(Builtin::Module).clone(),
            name,
        ))
    }

    /// A session's top-level scope. `__loader__` resolves through the
    /// whole search stack.
    pub fn top_level(
        &self,
        interp: &Interpreter,
        file: &str,
        extra_builtins: Vec<(String, Value)>,
    ) -> EvalResult<Rc<Scope>> {
        self.build_scope(
            interp,
            ModuleSpec {
                name: TOP_LEVEL_NAME.to_string(),
                file: file.to_string(),
                path: String::new(),
                package: String::new(),
                exports: self.new_exports(TOP_LEVEL_NAME),
                loader: self.search_getter(),
                extra_builtins,
            },
        )
    }

    pub fn build_scope(&self, interp: &Interpreter, spec: ModuleSpec) -> EvalResult<Rc<Scope>> {
        let builtins = Rc::new(self.filtered.copy());
        let scope = Scope::with_builtins(builtins.clone());

        for (name, value) in mediator::guarded_builtins() {
            builtins.insert_str(name, value)?;
        }
        let home = Rc::downgrade(&scope);
        builtins.insert_str("type", type_capability())?;
        builtins.insert_str("super", super_capability())?;
        builtins.insert_str("globals", globals_capability(home.clone()))?;
        builtins.insert_str("exec", exec_capability(home.clone(), false))?;
        builtins.insert_str("eval", exec_capability(home, true))?;
        builtins.insert_str("importer", self.importer())?;
        let ctx = ImportContext {
            name: spec.name.clone(),
            package: spec.package.clone(),
            exports: spec.exports.clone(),
        };
        builtins.insert_str(
            "__import__",
            sealer::native(
                "__import__",
                "aliases, loader, module=None, level=0",
                Some("Import through the mediated loader."),
                move |interp, a| resolve::import(interp, &ctx, a),
            ),
        )?;
        for (name, value) in spec.extra_builtins {
            builtins.insert_str(&name, sealer::seal_function(interp, &value)?)?;
        }
        builtins.lock_shallow();

        for (kind, ty) in self.prelude.error_types() {
            scope.set(kind.name(), Value::Type(ty.clone()));
        }
        for (name, module) in &self.stdlib {
            scope.set(name, module.clone());
        }
        scope.set(
            "SignedClass",
            Value::Type(self.prelude.builtin(Builtin::SignedClass).clone()),
        );

        scope.set("__name__", Value::str(&spec.name));
        scope.set("__file__", Value::str(&spec.file));
        scope.set("__path__", Value::str(&spec.path));
        scope.set("__package__", Value::str(&spec.package));
        scope.set("__mod", Value::Object(spec.exports));
        scope.set("__loader__", spec.loader);
        scope.lock();
        tracing::debug!(module = %spec.name, "sealed scope built");
        Ok(scope)
    }

    /// Top-level `__loader__`: a loader for whichever registered source
    /// serves the name, or `None`.
    pub fn search_getter(&self) -> Value {
        let this = self.this.clone();
        sealer::native(
            "loader_getter",
            "fullname",
            Some("Return a loader for fullname, or None when no source serves it."),
            move |_, a| {
                let parts = a.exact("loader_getter", 1, 1)?;
                let Some(fullname) = parts[0].as_str() else {
                    return Err(type_error("module name must be str"));
                };
                let manager = upgrade(&this)?;
                Ok(match manager.loader.locate(fullname) {
                    Some(source) => manager.loader_capability(source),
                    None => Value::None,
                })
            },
        )
    }

    /// `__loader__` inside a module: always the module's own source.
    fn source_getter(&self, source: Rc<dyn Source>) -> Value {
        let loader = self.loader_capability(source);
        sealer::native("loader_getter", "fullname=None", None, move |_, a| {
            a.exact("loader_getter", 0, 1)?;
            Ok(loader.clone())
        })
    }

    fn loader_capability(&self, source: Rc<dyn Source>) -> Value {
        let this = self.this.clone();
        sealer::native(
            "loader",
            "name, timeout=0",
            Some("Load a module from this source. A timeout of 0 or None uses the configured default."),
            move |interp, a| {
                let slots = a.parse("loader", &["name", "timeout"], 1)?;
                let Some(Value::Str(name)) = &slots[0] else {
                    return Err(type_error("module name must be str"));
                };
                let timeout = match &slots[1] {
                    None | Some(Value::None) => 0,
                    Some(v @ (Value::Int(_) | Value::Bool(_))) => v.as_int().unwrap_or(0),
                    Some(other) => {
                        return Err(type_error(format!(
                            "timeout must be an integer, not '{}'",
                            interp.type_of(other).name()
                        )));
                    }
                };
                let manager = upgrade(&this)?;
                Ok(manager
                    .load(interp, &source, name, timeout)?
                    .unwrap_or(Value::None))
            },
        )
    }

    /// Resolve `name` in `source` and execute it once per session.
    pub fn load(
        &self,
        interp: &Interpreter,
        source: &Rc<dyn Source>,
        name: &str,
        timeout: i64,
    ) -> EvalResult<Option<Value>> {
        check_name(name)?;
        if self.loader.is_loading(name) {
            tracing::debug!(module = name, "import of a module still executing refused");
            return Ok(None);
        }
        let Some(found) = source.find(name, self.loader.timeout(timeout))? else {
            tracing::debug!(module = name, source = source.label(), "module not found");
            return Ok(None);
        };
        if let Some(module) = self.loader.cached(&found.location) {
            return Ok(Some(module));
        }
        let location = found.location.clone();
        self.loader.begin(name);
        let result = self.execute(interp, source, found);
        self.loader.finish(name);
        let module = result?;
        self.loader.record(&location, module.clone());
        Ok(Some(module))
    }

    fn execute(&self, interp: &Interpreter, source: &Rc<dyn Source>, found: FoundModule) -> EvalResult<Value> {
        let digest = Sha256::digest(&found.bytes);
        tracing::info!(
            module = %found.name,
            location = %found.location,
            sha256 = %format!("{digest:x}"),
            "loading module"
        );
        if found.kind == ModuleKind::Raw {
            return Ok(Value::bytes(&found.bytes));
        }
        let text = String::from_utf8(found.bytes).map_err(|_| {
            error(
                ErrorKind::ImportError,
                format!("source of module '{}' is not valid UTF-8", found.name),
            )
        })?;
        let file = collapse_slashes(&found.file);
        let package = match found.kind {
            ModuleKind::Package => found.name.clone(),
            _ => found
                .name
                .rsplit_once('.')
                .map(|(parent, _)| parent.to_string())
                .unwrap_or_default(),
        };
        let exports = self.new_exports(&found.name);
        let scope = self.build_scope(
            interp,
            ModuleSpec {
                name: found.name.clone(),
                path: parent_dir(&file),
                file: file.clone(),
                package,
                exports: exports.clone(),
                loader: self.source_getter(source.clone()),
                extra_builtins: Vec::new(),
            },
        )?;
        let installed = scope.ordinary();
        interp.run_source(&text, &scope, &file, false)?;
        publish(interp, &scope, &exports, &installed)?;
        exports.lock_shallow();
        Ok(Value::Object(exports))
    }

    /// The guest-visible `importer` object.
    fn importer(&self) -> Value {
        let class = self.prelude.builtin(Builtin::LockedObject).clone();
        let obj = LockedObject::new(class);
        let this = self.this.clone();
        let remote = sealer::native(
            "remote_repo",
            "modules, base_url, zip_pwd=None",
            Some("Register a remote module source for the duration of a with block."),
            move |interp, a| {
                let slots = a.parse("remote_repo", &["modules", "base_url", "zip_pwd"], 2)?;
                let modules = module_list(&slots[0], None)?;
                let Some(Value::Str(base)) = &slots[1] else {
                    return Err(type_error("base_url must be str"));
                };
                let password = match &slots[2] {
                    None | Some(Value::None) => None,
                    Some(Value::Str(s)) => Some(s.as_bytes().to_vec()),
                    Some(Value::Bytes(b)) => Some(b.to_vec()),
                    Some(_) => return Err(type_error("zip_pwd must be str or bytes")),
                };
                upgrade(&this)?.repo_context(interp, modules, base, password)
            },
        );
        // A fresh object is never locked.
        let _ = obj.store_overflow("remote_repo", remote);
        for provider in ["github", "gitlab", "bitbucket"] {
            let this = self.this.clone();
            let name = format!("{provider}_repo");
            let signature = if provider == "gitlab" {
                "username, repo, module=None, branch=None, commit=None, domain='gitlab.com'"
            } else {
                "username, repo, module=None, branch=None, commit=None"
            };
            let fname = name.clone();
            let cap = sealer::native(&name, signature, None, move |interp, a| {
                let slots = a.parse(
                    &fname,
                    &["username", "repo", "module", "branch", "commit", "domain"],
                    2,
                )?;
                let text = |i: usize| -> EvalResult<Option<String>> {
                    match &slots[i] {
                        None | Some(Value::None) => Ok(None),
                        Some(Value::Str(s)) => Ok(Some(s.to_string())),
                        Some(other) => Err(type_error(format!(
                            "{fname}() arguments must be str, not '{}'",
                            other.type_name()
                        ))),
                    }
                };
                let (Some(user), Some(repo)) = (text(0)?, text(1)?) else {
                    return Err(type_error(format!("{fname}() requires username and repo")));
                };
                let (branch, commit, domain) = (text(3)?, text(4)?, text(5)?);
                let revision = git::revision(branch.as_deref(), commit.as_deref())
                    .map_err(|e| value_error(e.to_string()))?;
                let base = match provider {
                    "github" => git::github_url(&user, &repo, revision),
                    "gitlab" => git::gitlab_url(&user, &repo, revision, domain.as_deref()),
                    _ => git::bitbucket_url(&user, &repo, revision),
                };
                let modules = module_list(&slots[2], Some(&repo))?;
                upgrade(&this)?.repo_context(interp, modules, &base, None)
            });
            let _ = obj.store_overflow(&name, cap);
        }
        obj.freeze();
        Value::Object(Rc::new(obj))
    }

    /// Context object whose `__enter__` registers the source and yields
    /// the loader getter and whose `__exit__` always unregisters it.
    fn repo_context(
        &self,
        interp: &Interpreter,
        modules: Vec<String>,
        base: &str,
        password: Option<Vec<u8>>,
    ) -> EvalResult<Value> {
        if !self.loader.settings().allow_remote {
            return Err(error(
                ErrorKind::ImportError,
                "remote module sources are disabled",
            ));
        }
        let base = base.trim();
        let scheme = base
            .split_once("://")
            .map(|(s, _)| s.to_ascii_lowercase())
            .unwrap_or_default();
        if !ALLOWED_SCHEMES.contains(&scheme.as_str()) {
            return Err(error(
                ErrorKind::ImportError,
                format!("unsupported URL scheme in '{base}'"),
            ));
        }
        let url = base.to_string();

        let registered: Rc<RefCell<Option<Rc<dyn Source>>>> = Rc::new(RefCell::new(None));
        let this = self.this.clone();
        let slot = registered.clone();
        let enter = sealer::native("__enter__", "", None, move |_, a| {
            a.exact("__enter__", 0, 0)?;
            let manager = upgrade(&this)?;
            if slot.borrow().is_some() {
                return Err(runtime_error("this remote source is already registered"));
            }
            let source = archive::remote_source(
                &url,
                modules.clone(),
                password.as_deref(),
                manager.loader.fetcher().clone(),
                manager.loader.settings().fetch_timeout,
            )?;
            manager.loader.push(source.clone());
            *slot.borrow_mut() = Some(source);
            Ok(manager.search_getter())
        });
        let this = self.this.clone();
        let exit = sealer::native("__exit__", "exc_type, exc, tb", None, move |_, _| {
            let taken = registered.borrow_mut().take();
            if let Some(source) = taken
                && let Some(manager) = this.upgrade()
            {
                manager.loader.remove(&source);
            }
            Ok(Value::Bool(false))
        });

        let ctx = LockedObject::new(interp.prelude().builtin(Builtin::LockedObject).clone());
        ctx.store_overflow("__enter__", enter)?;
        ctx.store_overflow("__exit__", exit)?;
        ctx.freeze();
        Ok(Value::Object(Rc::new(ctx)))
    }
}

/// Copy every public name the module bound in its scope, and did not
/// export itself, onto its export object.
fn publish(
    interp: &Interpreter,
    scope: &Rc<Scope>,
    exports: &Rc<LockedObject>,
    installed: &[(String, Value)],
) -> EvalResult<()> {
    let target = Value::Object(exports.clone());
    for (name, value) in scope.ordinary() {
        if name.starts_with('_') || exports.has_instance_attr(&name) {
            continue;
        }
        if installed.iter().any(|(k, v)| *k == name && v.same(&value)) {
            continue;
        }
        interp.set_attr(&target, &name, value)?;
    }
    Ok(())
}

fn module_list(value: &Option<Value>, default: Option<&str>) -> EvalResult<Vec<String>> {
    let items = match value {
        None | Some(Value::None) => match default {
            Some(d) => return Ok(vec![d.to_string()]),
            None => return Err(type_error("a module list is required")),
        },
        Some(Value::Str(s)) => return Ok(vec![s.to_string()]),
        Some(Value::List(items)) => items.borrow().clone(),
        Some(Value::Tuple(items)) => items.to_vec(),
        Some(other) => {
            return Err(type_error(format!(
                "modules must be a list of str, not '{}'",
                other.type_name()
            )));
        }
    };
    items
        .iter()
        .map(|v| match v {
            Value::Str(s) => Ok(s.to_string()),
            _ => Err(type_error("modules must be a list of str")),
        })
        .collect()
}

fn type_capability() -> Value {
    sealer::native(
        "type",
        "object_or_name, bases=..., dict=...",
        Some("type(object) returns the type of object; type(name, bases, dict) builds a class."),
        |interp, a| match a.exact("type", 1, 3)? {
            [v] => {
                let ty = interp.type_of(v);
                match ty.kind() {
                    TypeKind::Root | TypeKind::Builtin(Builtin::Code | Builtin::Cell | Builtin::Scope) => {
                        Err(forbidden(format!("type of '{}' is not available", ty.name())))
                    }
                    _ => Ok(Value::Type(ty)),
                }
            }
            [name, bases, attrs] => build_class(interp, name, bases, attrs),
            _ => Err(type_error("type() takes 1 or 3 arguments")),
        },
    )
}

fn super_capability() -> Value {
    sealer::native(
        "super",
        "type, obj",
        Some("Proxy that delegates attribute lookups to the class after type in the MRO of obj."),
        |interp, a| match a.exact("super", 0, 2)? {
            [start, receiver] => interp.make_super(start, receiver.clone()),
            [_] => Err(type_error("super() with one argument is not supported")),
            _ => Err(runtime_error("super(): no arguments")),
        },
    )
}

fn home_scope(home: &Weak<Scope>) -> EvalResult<Rc<Scope>> {
    home.upgrade()
        .ok_or_else(|| runtime_error("the module scope behind this capability is gone"))
}

fn globals_capability(home: Weak<Scope>) -> Value {
    sealer::native(
        "globals",
        "",
        Some("Read-only snapshot of the module's globals."),
        move |interp, a| {
            a.exact("globals", 0, 0)?;
            let scope = home_scope(&home)?;
            let snapshot = LockedMapping::from_pairs(
                scope
                    .ordinary()
                    .into_iter()
                    .map(|(k, v)| (MapKey::str(&k), v)),
            );
            snapshot.lock_shallow();
            let iface = sealer::make_interface(interp, &Rc::new(snapshot))?;
            iface.lock_shallow();
            Ok(Value::Object(iface))
        },
    )
}

/// Scope and locals an `exec`/`eval` call runs against.
fn exec_target(
    home: &Weak<Scope>,
    globals: &Option<Value>,
    locals: &Option<Value>,
) -> EvalResult<(Rc<Scope>, Option<Rc<LockedMapping>>)> {
    let locals = match locals {
        None | Some(Value::None) => None,
        Some(Value::Mapping(m)) => Some(m.clone()),
        Some(other) => {
            return Err(type_error(format!(
                "locals must be a dict, not {}",
                other.type_name()
            )));
        }
    };
    let scope = match globals {
        None | Some(Value::None) => {
            let home = home_scope(home)?;
            if locals.is_some() {
                let builtins = home
                    .builtins()
                    .unwrap_or_else(|| Rc::new(LockedMapping::labelled("builtins")));
                Scope::with_builtins(builtins)
            } else {
                home
            }
        }
        Some(Value::Mapping(g)) => {
            let scope = Scope::new();
            for (key, value) in g.items() {
                let Some(name) = key.as_str() else {
                    return Err(type_error("globals keys must be str"));
                };
                scope.set(name, value);
            }
            if !scope.contains("__builtins__") {
                scope.set(
                    "__builtins__",
                    Value::Mapping(Rc::new(LockedMapping::labelled("builtins"))),
                );
            }
            scope
        }
        Some(other) => {
            return Err(type_error(format!(
                "globals must be a dict, not {}",
                other.type_name()
            )));
        }
    };
    Ok((scope, locals))
}

fn exec_capability(home: Weak<Scope>, eval: bool) -> Value {
    let name = if eval { "eval" } else { "exec" };
    let doc = if eval {
        "Evaluate an expression in the module's sealed scope or the given globals."
    } else {
        "Execute source in the module's sealed scope or the given globals."
    };
    sealer::native(
        name,
        "source, globals=None, locals=None",
        Some(doc),
        move |interp, a| {
            let slots = a.parse(name, &["source", "globals", "locals"], 1)?;
            let Some(Value::Str(src)) = &slots[0] else {
                return Err(type_error(format!("{name}() arg 1 must be a string")));
            };
            let (scope, locals) = exec_target(&home, &slots[1], &slots[2])?;
            if eval {
                interp.eval_source(src, &scope, locals, true)
            } else {
                interp.exec_source(src, &scope, locals, true)?;
                Ok(Value::None)
            }
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interp::testing::{interpreter, output};
    use crate::loader::source::LocalSource;
    use crate::loader::{LoaderSettings, MemoryFetcher};

    // The manager must share the interpreter's prelude, or guest `except`
    // clauses name different exception classes than the ones raised.
    fn manager_with_root(interp: &Interpreter, root: &std::path::Path) -> Rc<ScopeManager> {
        let loader = Loader::new(LoaderSettings::default(), Rc::new(MemoryFetcher::new()));
        loader.push(Rc::new(LocalSource::new(root)));
        ScopeManager::new(interp.prelude().clone(), loader)
    }

    fn run(src: &str) -> Result<String, String> {
        let dir = tempfile::tempdir().unwrap();
        run_in(dir.path(), src)
    }

    fn run_in(root: &std::path::Path, src: &str) -> Result<String, String> {
        let (interp, buf) = interpreter();
        let manager = manager_with_root(&interp, root);
        let scope = manager.top_level(&interp, "<test>", Vec::new()).unwrap();
        interp
            .run_source(src, &scope, "<test>", false)
            .map(|_| output(&buf))
            .map_err(|e| e.to_string())
    }

    #[test]
    fn test_raw_primitives_are_replaced() {
        let out = run("print(type(1))\nprint(exec, globals)\n").unwrap();
        assert_eq!(
            out,
            "<class 'int'>\nfunction(source, globals=None, locals=None) function()\n"
        );
        let err = run("open('/etc/passwd')").unwrap_err();
        assert!(err.starts_with("NameError"), "{err}");
        let err = run("compile('1', 'x', 'exec')").unwrap_err();
        assert!(err.starts_with("NameError"), "{err}");
    }

    #[test]
    fn test_type_refuses_the_root_type() {
        let err = run("type(int)").unwrap_err();
        assert!(err.starts_with("ForbiddenAccessError"), "{err}");
        let out = run("C = type('C', (object,), {'x': 1})\nprint(C().x)\n").unwrap();
        assert_eq!(out, "1\n");
    }

    #[test]
    fn test_dunder_region_is_locked() {
        let out = run(
            "__name__ = 'evil'\n__builtins__ = {}\nprint(__name__, __package__ == '', len([1]))\n",
        )
        .unwrap();
        assert_eq!(out, "__?none?__ True 1\n");
        let err = run("__builtins__['open'] = print").unwrap_err();
        assert!(err.starts_with("LockedValueError"), "{err}");
    }

    #[test]
    fn test_exceptions_and_stdlib_live_in_the_ordinary_region() {
        let out = run(
            "try:\n    {}['k']\nexcept KeyError:\n    print('caught')\n\
             print(math.floor(1.5), SignedClass.__name__)\n",
        )
        .unwrap();
        assert_eq!(out, "caught\n1 SignedClass\n");
    }

    #[test]
    fn test_exec_and_eval_targets() {
        let out = run(
            "x = 5\nexec('y = x + 1')\nprint(y, eval('x * 2'))\n\
             g = {'a': 2}\nexec('b = a * 3', g)\nprint(g.get('b'))\n\
             loc = {}\nexec('z = 1', None, loc)\nprint(loc['z'])\n",
        )
        .unwrap();
        assert_eq!(out, "6 10\nNone\n1\n");
        // Explicit globals without __builtins__ get none.
        let err = run("exec('len([])', {})").unwrap_err();
        assert!(err.starts_with("NameError"), "{err}");
        // exec source is rewritten.
        let err = run("exec('f.__globals__')").unwrap_err();
        assert!(err.starts_with("ForbiddenNameError"), "{err}");
    }

    #[test]
    fn test_globals_is_a_locked_snapshot() {
        let out = run("a = 1\ng = globals()\nprint(g.get('a'), g.__contains__('__builtins__'))\n").unwrap();
        assert_eq!(out, "1 False\n");
        let err = run("a = 1\ng = globals()\ng.update({'a': 2})\n").unwrap_err();
        assert!(err.starts_with("LockedValueError"), "{err}");
    }

    #[test]
    fn test_super_forms() {
        let err = run("super(int)").unwrap_err();
        assert!(err.starts_with("TypeError"), "{err}");
        let out = run(
            "class A:\n    def hi(self):\n        return 'A'\n\
             class B(A):\n    def hi(self):\n        return 'B' + super().hi()\n\
             print(B().hi())\n",
        )
        .unwrap();
        assert_eq!(out, "BA\n");
    }

    #[test]
    fn test_local_import_publishes_and_seals() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("helper.py"),
            "def double(n):\n    return n * 2\n_hidden = 1\nVALUE = 21\n",
        )
        .unwrap();
        let out = run_in(
            dir.path(),
            "import helper\nfrom helper import VALUE\n\
             print(helper.double(VALUE), helper.double)\n\
             print(hasattr(helper, '_hidden'), hasattr(helper, 'math'))\n",
        )
        .unwrap();
        assert_eq!(out, "42 function(n)\nFalse False\n");
    }

    #[test]
    fn test_missing_module_is_recoverable() {
        let out = run(
            "try:\n    import nowhere\nexcept ModuleResolutionError as e:\n    print('missing', e)\n",
        )
        .unwrap();
        assert_eq!(out, "missing no module named 'nowhere'\n");
    }

    #[test]
    fn test_remote_repo_rejects_schemes_before_fetching() {
        let err = run("importer.remote_repo(['m'], 'file:///etc/')").unwrap_err();
        assert!(err.starts_with("ImportError"), "{err}");
        let err = run("importer.github_repo('u', 'r', branch='b', commit='c')").unwrap_err();
        assert!(err.starts_with("ValueError"), "{err}");
    }
}
