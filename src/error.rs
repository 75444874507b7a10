//! Kernel error taxonomy.
//!
//! [`KernelError`] covers the conditions the confinement kernel itself
//! raises. [`ErrorKind`] names every exception type guest code can observe,
//! kernel and built-in alike, together with its place in the hierarchy.

/// Errors raised by the confinement kernel.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum KernelError {
    /// Mutation of a locked mapping, object or sealed type.
    #[error("cannot modify '{key}': {target} is locked")]
    LockedValue { key: String, target: String },

    /// Static rejection of a reserved attribute name.
    #[error("forbidden name '{name}' (line {line})")]
    ForbiddenName { name: String, line: usize },

    /// Static rejection of a forbidden statement form.
    #[error("forbidden syntax: {what} (line {line})")]
    ForbiddenSyntax { what: String, line: usize },

    /// Run-time mediation refused to hand out a value.
    #[error("forbidden access: {0}")]
    ForbiddenAccess(String),

    /// No registered source resolved the module name.
    #[error("no module named '{0}'")]
    ModuleResolution(String),

    /// Fetched content is neither a served tree, a tar archive nor a zip archive.
    #[error("unrecognised archive format at {0}")]
    ArchiveFormat(String),

    /// Malformed alias list or identifier handed to the import entry point.
    #[error("malformed import: {0}")]
    ImportSyntax(String),
}

impl KernelError {
    pub fn locked(key: impl Into<String>, target: impl Into<String>) -> Self {
        KernelError::LockedValue {
            key: key.into(),
            target: target.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            KernelError::LockedValue { .. } => ErrorKind::LockedValueError,
            KernelError::ForbiddenName { .. } => ErrorKind::ForbiddenNameError,
            KernelError::ForbiddenSyntax { .. } => ErrorKind::ForbiddenSyntaxError,
            KernelError::ForbiddenAccess(_) => ErrorKind::ForbiddenAccessError,
            KernelError::ModuleResolution(_) => ErrorKind::ModuleResolutionError,
            KernelError::ArchiveFormat(_) => ErrorKind::ArchiveFormatError,
            KernelError::ImportSyntax(_) => ErrorKind::ImportSyntaxError,
        }
    }
}

/// Every exception type visible to guest code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Exception,
    TypeError,
    ValueError,
    NameError,
    AttributeError,
    LookupError,
    KeyError,
    IndexError,
    ArithmeticError,
    ZeroDivisionError,
    OverflowError,
    RuntimeError,
    RecursionError,
    NotImplementedError,
    ImportError,
    ModuleNotFoundError,
    AssertionError,
    SyntaxError,
    StopIteration,
    LockedValueError,
    ForbiddenNameError,
    ForbiddenSyntaxError,
    ForbiddenAccessError,
    ModuleResolutionError,
    ArchiveFormatError,
    ImportSyntaxError,
}

impl ErrorKind {
    /// All kinds, parents before children.
    pub const ALL: &'static [ErrorKind] = &[
        ErrorKind::Exception,
        ErrorKind::TypeError,
        ErrorKind::ValueError,
        ErrorKind::NameError,
        ErrorKind::AttributeError,
        ErrorKind::LookupError,
        ErrorKind::KeyError,
        ErrorKind::IndexError,
        ErrorKind::ArithmeticError,
        ErrorKind::ZeroDivisionError,
        ErrorKind::OverflowError,
        ErrorKind::RuntimeError,
        ErrorKind::RecursionError,
        ErrorKind::NotImplementedError,
        ErrorKind::ImportError,
        ErrorKind::ModuleNotFoundError,
        ErrorKind::AssertionError,
        ErrorKind::SyntaxError,
        ErrorKind::StopIteration,
        ErrorKind::LockedValueError,
        ErrorKind::ForbiddenNameError,
        ErrorKind::ForbiddenSyntaxError,
        ErrorKind::ForbiddenAccessError,
        ErrorKind::ModuleResolutionError,
        ErrorKind::ArchiveFormatError,
        ErrorKind::ImportSyntaxError,
    ];

    pub fn name(self) -> &'static str {
        match self {
            ErrorKind::Exception => "Exception",
            ErrorKind::TypeError => "TypeError",
            ErrorKind::ValueError => "ValueError",
            ErrorKind::NameError => "NameError",
            ErrorKind::AttributeError => "AttributeError",
            ErrorKind::LookupError => "LookupError",
            ErrorKind::KeyError => "KeyError",
            ErrorKind::IndexError => "IndexError",
            ErrorKind::ArithmeticError => "ArithmeticError",
            ErrorKind::ZeroDivisionError => "ZeroDivisionError",
            ErrorKind::OverflowError => "OverflowError",
            ErrorKind::RuntimeError => "RuntimeError",
            ErrorKind::RecursionError => "RecursionError",
            ErrorKind::NotImplementedError => "NotImplementedError",
            ErrorKind::ImportError => "ImportError",
            ErrorKind::ModuleNotFoundError => "ModuleNotFoundError",
            ErrorKind::AssertionError => "AssertionError",
            ErrorKind::SyntaxError => "SyntaxError",
            ErrorKind::StopIteration => "StopIteration",
            ErrorKind::LockedValueError => "LockedValueError",
            ErrorKind::ForbiddenNameError => "ForbiddenNameError",
            ErrorKind::ForbiddenSyntaxError => "ForbiddenSyntaxError",
            ErrorKind::ForbiddenAccessError => "ForbiddenAccessError",
            ErrorKind::ModuleResolutionError => "ModuleResolutionError",
            ErrorKind::ArchiveFormatError => "ArchiveFormatError",
            ErrorKind::ImportSyntaxError => "ImportSyntaxError",
        }
    }

    pub fn parent(self) -> Option<ErrorKind> {
        use ErrorKind::*;
        match self {
            Exception => None,
            KeyError | IndexError => Some(LookupError),
            ZeroDivisionError | OverflowError => Some(ArithmeticError),
            RecursionError | NotImplementedError => Some(RuntimeError),
            ModuleNotFoundError | ArchiveFormatError => Some(ImportError),
            ModuleResolutionError => Some(ModuleNotFoundError),
            LockedValueError | ForbiddenAccessError => Some(RuntimeError),
            ForbiddenNameError | ForbiddenSyntaxError | ImportSyntaxError => Some(SyntaxError),
            _ => Some(Exception),
        }
    }

    /// Whether `self` is `ancestor` or derives from it.
    pub fn is_a(self, ancestor: ErrorKind) -> bool {
        let mut current = Some(self);
        while let Some(kind) = current {
            if kind == ancestor {
                return true;
            }
            current = kind.parent();
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parents_precede_children() {
        for (i, kind) in ErrorKind::ALL.iter().enumerate() {
            if let Some(parent) = kind.parent() {
                let p = ErrorKind::ALL.iter().position(|k| *k == parent).unwrap();
                assert!(p < i, "{} listed before its parent", kind.name());
            }
        }
    }

    #[test]
    fn test_kernel_kinds_sit_under_builtin_families() {
        assert!(ErrorKind::ModuleResolutionError.is_a(ErrorKind::ImportError));
        assert!(ErrorKind::ForbiddenNameError.is_a(ErrorKind::SyntaxError));
        assert!(ErrorKind::LockedValueError.is_a(ErrorKind::Exception));
        assert!(!ErrorKind::KeyError.is_a(ErrorKind::IndexError));
    }

    #[test]
    fn test_locked_value_message_names_key_and_target() {
        let err = KernelError::locked("x", "Dict");
        assert_eq!(err.to_string(), "cannot modify 'x': Dict is locked");
        assert_eq!(err.kind(), ErrorKind::LockedValueError);
    }
}
