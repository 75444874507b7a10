//! Mediated module loading.
//!
//! A session owns one [`Loader`]: a stack of registered [`Source`]s, the
//! module table that makes every module run at most once, and the transport
//! remote sources fetch through. Name lookup walks the stack from the most
//! recently registered source down to the local root at the bottom.
//!
//! Executing a found module is the scope manager's job; this module only
//! decides where a name comes from.

pub mod archive;
pub mod fetch;
pub mod git;
pub mod resolve;
pub mod source;

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::rc::Rc;
use std::time::Duration;

use crate::error::KernelError;
use crate::kernel::value::Value;

pub use fetch::{FetchError, Fetched, Fetcher, HttpFetcher, MemoryFetcher};

/// URL schemes a remote source may use.
pub const ALLOWED_SCHEMES: &[&str] = &["http", "https", "ftp", "scp", "sftp", "gopher", "tftp"];

#[derive(Debug, Clone)]
pub struct LoaderSettings {
    /// Applied when a guest passes `timeout=0`.
    pub fetch_timeout: Duration,
    pub allow_remote: bool,
}

impl Default for LoaderSettings {
    fn default() -> Self {
        Self {
            fetch_timeout: Duration::from_secs(10),
            allow_remote: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleKind {
    Module,
    Package,
    /// A non-source asset; loads as `bytes`.
    Raw,
}

/// A resolved module, ready to execute.
#[derive(Debug, Clone)]
pub struct FoundModule {
    pub name: String,
    pub kind: ModuleKind,
    /// The path or URL reported as `__file__`.
    pub file: String,
    /// Identity key in the module table.
    pub location: String,
    pub bytes: Vec<u8>,
}

/// Somewhere modules come from.
pub trait Source {
    /// Human-readable origin, used in logs.
    fn label(&self) -> &str;

    /// Whether this source declares the top-level component of `fullname`.
    fn serves(&self, fullname: &str) -> bool;

    /// Resolve `fullname` to a module or package. `Ok(None)` means the name
    /// is not here, which is never fatal.
    fn find(&self, fullname: &str, timeout: Duration) -> Result<Option<FoundModule>, KernelError>;
}

pub fn top_level(fullname: &str) -> &str {
    fullname.split('.').next().unwrap_or(fullname)
}

/// Refuse names that could step outside a source's root.
pub fn check_name(fullname: &str) -> Result<(), KernelError> {
    if fullname.is_empty()
        || fullname.starts_with('.')
        || fullname.contains("..")
        || fullname.contains("//")
    {
        return Err(KernelError::ImportSyntax(format!(
            "refusing module name '{fullname}'"
        )));
    }
    Ok(())
}

/// Module and package candidate paths for a dotted name:
/// `a/b.py` and `a/b/__init__.py`.
pub fn candidate_paths(fullname: &str) -> (String, String) {
    let path = fullname.replace('.', "/");
    (format!("{path}.py"), format!("{path}/__init__.py"))
}

/// Collapse repeated slashes, leaving a `scheme://` separator intact.
pub fn collapse_slashes(path: &str) -> String {
    let (prefix, rest) = match path.split_once("://") {
        Some((scheme, rest)) => (format!("{scheme}://"), rest),
        None => (String::new(), path),
    };
    let mut out = prefix;
    let mut prev_slash = false;
    for c in rest.chars() {
        if c == '/' && prev_slash {
            continue;
        }
        prev_slash = c == '/';
        out.push(c);
    }
    out
}

/// The directory part of a file path or URL, with a trailing `/`.
pub fn parent_dir(file: &str) -> String {
    match file.rfind('/') {
        Some(i) => file[..=i].to_string(),
        None => String::new(),
    }
}

/// Per-session loading state.
pub struct Loader {
    stack: RefCell<Vec<Rc<dyn Source>>>,
    modules: RefCell<HashMap<String, Value>>,
    in_progress: RefCell<HashSet<String>>,
    fetcher: Rc<dyn Fetcher>,
    settings: LoaderSettings,
}

impl Loader {
    pub fn new(settings: LoaderSettings, fetcher: Rc<dyn Fetcher>) -> Self {
        Self {
            stack: RefCell::new(Vec::new()),
            modules: RefCell::new(HashMap::new()),
            in_progress: RefCell::new(HashSet::new()),
            fetcher,
            settings,
        }
    }

    pub fn settings(&self) -> &LoaderSettings {
        &self.settings
    }

    pub fn fetcher(&self) -> &Rc<dyn Fetcher> {
        &self.fetcher
    }

    /// Register `source` above every source already registered.
    pub fn push(&self, source: Rc<dyn Source>) {
        tracing::info!(source = source.label(), "module source registered");
        self.stack.borrow_mut().push(source);
    }

    /// Unregister `source`. Returns whether it was registered.
    pub fn remove(&self, source: &Rc<dyn Source>) -> bool {
        let mut stack = self.stack.borrow_mut();
        match stack.iter().rposition(|s| Rc::ptr_eq(s, source)) {
            Some(i) => {
                stack.remove(i);
                tracing::info!(source = source.label(), "module source removed");
                true
            }
            None => false,
        }
    }

    /// Labels of the registered sources, most recent first.
    pub fn sources(&self) -> Vec<String> {
        self.stack
            .borrow()
            .iter()
            .rev()
            .map(|s| s.label().to_string())
            .collect()
    }

    /// The most recently registered source that serves `fullname`.
    pub fn locate(&self, fullname: &str) -> Option<Rc<dyn Source>> {
        let found = self
            .stack
            .borrow()
            .iter()
            .rev()
            .find(|s| s.serves(fullname))
            .cloned();
        match &found {
            Some(source) => tracing::debug!(fullname, source = source.label(), "module source located"),
            None => tracing::debug!(fullname, "no module source serves this name"),
        }
        found
    }

    pub fn timeout(&self, requested: i64) -> Duration {
        if requested <= 0 {
            self.settings.fetch_timeout
        } else {
            Duration::from_secs(requested as u64)
        }
    }

    pub fn cached(&self, location: &str) -> Option<Value> {
        self.modules.borrow().get(location).cloned()
    }

    pub fn record(&self, location: &str, module: Value) {
        self.modules.borrow_mut().insert(location.to_string(), module);
    }

    pub fn is_loading(&self, fullname: &str) -> bool {
        self.in_progress.borrow().contains(fullname)
    }

    pub fn begin(&self, fullname: &str) {
        self.in_progress.borrow_mut().insert(fullname.to_string());
    }

    pub fn finish(&self, fullname: &str) {
        self.in_progress.borrow_mut().remove(fullname);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Named(&'static str, &'static str);

    impl Source for Named {
        fn label(&self) -> &str {
            self.0
        }

        fn serves(&self, fullname: &str) -> bool {
            top_level(fullname) == self.1
        }

        fn find(&self, _: &str, _: Duration) -> Result<Option<FoundModule>, KernelError> {
            Ok(None)
        }
    }

    fn loader() -> Loader {
        Loader::new(LoaderSettings::default(), Rc::new(MemoryFetcher::new()))
    }

    #[test]
    fn test_most_recent_source_wins() {
        let loader = loader();
        let first: Rc<dyn Source> = Rc::new(Named("first", "pkg"));
        let second: Rc<dyn Source> = Rc::new(Named("second", "pkg"));
        loader.push(first.clone());
        loader.push(second.clone());
        assert_eq!(loader.locate("pkg.mod").unwrap().label(), "second");
        assert!(loader.remove(&second));
        assert_eq!(loader.locate("pkg.mod").unwrap().label(), "first");
        assert!(!loader.remove(&second));
        assert!(loader.locate("other").is_none());
    }

    #[test]
    fn test_name_checks_and_paths() {
        assert!(check_name("pkg.mod").is_ok());
        for bad in [".pkg", "pkg..mod", "a//b", ""] {
            assert!(check_name(bad).is_err(), "{bad}");
        }
        assert_eq!(
            candidate_paths("a.b"),
            ("a/b.py".to_string(), "a/b/__init__.py".to_string())
        );
        assert_eq!(collapse_slashes("http://h//a///b.py"), "http://h/a/b.py");
        assert_eq!(parent_dir("http://h/a/b.py"), "http://h/a/");
        assert_eq!(parent_dir("b.py"), "");
    }

    #[test]
    fn test_timeout_zero_means_default() {
        let loader = loader();
        assert_eq!(loader.timeout(0), Duration::from_secs(10));
        assert_eq!(loader.timeout(3), Duration::from_secs(3));
    }
}
