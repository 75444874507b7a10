//! Directory-backed and served-tree sources.

use std::io;
use std::path::PathBuf;
use std::rc::Rc;
use std::time::Duration;

use super::{FoundModule, Fetcher, ModuleKind, Source, candidate_paths, collapse_slashes, top_level};
use crate::error::KernelError;

/// Modules under a local directory. Serves every name; it sits at the
/// bottom of a session's stack.
pub struct LocalSource {
    root: PathBuf,
    label: String,
}

impl LocalSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let label = root.display().to_string();
        Self { root, label }
    }
}

impl Source for LocalSource {
    fn label(&self) -> &str {
        &self.label
    }

    fn serves(&self, _fullname: &str) -> bool {
        true
    }

    fn find(&self, fullname: &str, _timeout: Duration) -> Result<Option<FoundModule>, KernelError> {
        let (module, package) = candidate_paths(fullname);
        for (rel, kind) in [(module, ModuleKind::Module), (package, ModuleKind::Package)] {
            let path = self.root.join(&rel);
            match std::fs::read(&path) {
                Ok(bytes) => {
                    let file = path.display().to_string();
                    return Ok(Some(FoundModule {
                        name: fullname.to_string(),
                        kind,
                        location: file.clone(),
                        file,
                        bytes,
                    }));
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => {
                    tracing::warn!(path = %path.display(), "cannot read module file: {e}");
                }
            }
        }
        Ok(None)
    }
}

/// A tree of files served one at a time under a base URL.
pub struct TreeSource {
    base: String,
    modules: Vec<String>,
    fetcher: Rc<dyn Fetcher>,
}

impl TreeSource {
    pub fn new(base: &str, modules: Vec<String>, fetcher: Rc<dyn Fetcher>) -> Self {
        Self {
            base: base.to_string(),
            modules,
            fetcher,
        }
    }
}

impl Source for TreeSource {
    fn label(&self) -> &str {
        &self.base
    }

    fn serves(&self, fullname: &str) -> bool {
        self.modules.iter().any(|m| m == top_level(fullname))
    }

    fn find(&self, fullname: &str, timeout: Duration) -> Result<Option<FoundModule>, KernelError> {
        let (module, package) = candidate_paths(fullname);
        for (rel, kind) in [(module, ModuleKind::Module), (package, ModuleKind::Package)] {
            let url = collapse_slashes(&format!("{}{rel}", self.base));
            match self.fetcher.fetch(&url, timeout) {
                Ok(doc) => {
                    return Ok(Some(FoundModule {
                        name: fullname.to_string(),
                        kind,
                        file: url.clone(),
                        location: url,
                        bytes: doc.body,
                    }));
                }
                Err(error) => tracing::debug!(url, %error, "candidate missed"),
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::MemoryFetcher;

    #[test]
    fn test_local_source_prefers_module_over_package() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("pkg/sub")).unwrap();
        std::fs::write(dir.path().join("pkg/__init__.py"), "A = 1\n").unwrap();
        std::fs::write(dir.path().join("pkg/sub.py"), "B = 2\n").unwrap();
        std::fs::write(dir.path().join("pkg/sub/__init__.py"), "C = 3\n").unwrap();

        let source = LocalSource::new(dir.path());
        let t = Duration::from_secs(1);
        let found = source.find("pkg", t).unwrap().unwrap();
        assert_eq!(found.kind, ModuleKind::Package);
        let found = source.find("pkg.sub", t).unwrap().unwrap();
        assert_eq!(found.kind, ModuleKind::Module);
        assert_eq!(found.bytes, b"B = 2\n");
        assert!(source.find("missing", t).unwrap().is_none());
    }

    #[test]
    fn test_tree_source_tries_file_then_package() {
        let fetcher = Rc::new(MemoryFetcher::new());
        fetcher.insert("http://h/lib/pkg/__init__.py", Some("text/plain"), "X = 1\n");
        let source = TreeSource::new("http://h/lib/", vec!["pkg".into()], fetcher.clone());
        assert!(source.serves("pkg.inner"));
        assert!(!source.serves("other"));

        let found = source.find("pkg", Duration::from_secs(1)).unwrap().unwrap();
        assert_eq!(found.kind, ModuleKind::Package);
        assert_eq!(found.file, "http://h/lib/pkg/__init__.py");
        assert_eq!(
            fetcher.requests(),
            vec!["http://h/lib/pkg.py", "http://h/lib/pkg/__init__.py"]
        );
    }
}
