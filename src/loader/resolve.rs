//! The mediated import entry point.
//!
//! Rewritten `import` statements call `__import__(aliases, loader_getter,
//! module=None, level=0)`. Resolution never touches the importing scope: it
//! works from an [`ImportContext`] copied out of that scope when it was
//! built, and binds results onto the importing module's export object.
//!
//! A lone `*` alias binds the source module's `__all__` when it defines
//! one, and its public attributes otherwise.

use std::rc::Rc;

use crate::error::{ErrorKind, KernelError};
use crate::interp::{EvalResult, Interpreter, error, type_error};
use crate::kernel::mediator;
use crate::kernel::store::LockedObject;
use crate::kernel::value::{Args, Value};

/// What `__import__` knows about the module it serves.
#[derive(Clone)]
pub struct ImportContext {
    pub name: String,
    pub package: String,
    pub exports: Rc<LockedObject>,
}

#[derive(Debug, Clone, PartialEq)]
struct Alias {
    name: String,
    asname: String,
}

const WILDCARD: &str = "*";

impl Alias {
    fn same(name: &str) -> Self {
        Self {
            name: name.to_string(),
            asname: name.to_string(),
        }
    }

    fn is_wildcard(&self) -> bool {
        self.name == WILDCARD
    }
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    matches!(chars.next(), Some(c) if c.is_alphabetic() || c == '_')
        && chars.all(|c| c.is_alphanumeric() || c == '_')
}

fn is_dotted(s: &str) -> bool {
    s.split('.').all(is_identifier)
}

fn malformed(msg: impl Into<String>) -> Box<crate::interp::GuestError> {
    KernelError::ImportSyntax(msg.into()).into()
}

fn parse_aliases(value: &Value) -> EvalResult<Vec<Alias>> {
    let Value::List(items) = value else {
        return Err(malformed("aliases must be a list of mappings"));
    };
    let items = items.borrow().clone();
    if items.is_empty() {
        return Err(malformed("'import' what?"));
    }
    let mut aliases = Vec::with_capacity(items.len());
    for item in &items {
        let Value::Mapping(m) = item else {
            return Err(malformed("aliases must be a list of mappings"));
        };
        let name = match m.get_str("name") {
            Some(Value::Str(s)) if is_dotted(&s) || &*s == WILDCARD => s.to_string(),
            Some(Value::Str(s)) => return Err(malformed(format!("'{s}' is not a valid module name"))),
            _ => return Err(malformed("alias is missing a 'name'")),
        };
        let asname = match m.get_str("asname") {
            None | Some(Value::None) => name.rsplit('.').next().unwrap_or(&name).to_string(),
            Some(Value::Str(s)) if name == WILDCARD && &*s == WILDCARD => s.to_string(),
            Some(Value::Str(s)) if name != WILDCARD && is_identifier(&s) => s.to_string(),
            Some(other) => {
                return Err(malformed(format!(
                    "'{}' is not a valid identifier",
                    other.as_str().unwrap_or("?")
                )));
            }
        };
        aliases.push(Alias { name, asname });
    }
    if aliases.len() > 1 && aliases.iter().any(Alias::is_wildcard) {
        return Err(malformed("'*' must be the only imported name"));
    }
    Ok(aliases)
}

fn not_found(fullname: &str) -> Box<crate::interp::GuestError> {
    KernelError::ModuleResolution(fullname.to_string()).into()
}

/// Ask `getter` for a loader and `loader` for the module.
fn load(interp: &Interpreter, getter: &Value, fullname: &str) -> EvalResult<Option<Value>> {
    let top = crate::loader::top_level(fullname);
    let loader = interp.call(getter, Args::new(vec![Value::str(top)]))?;
    if loader.is_none() {
        return Ok(None);
    }
    let module = interp.call(&loader, Args::new(vec![Value::str(fullname)]))?;
    Ok((!module.is_none()).then_some(module))
}

fn bind(ctx: &ImportContext, alias: &Alias, value: Value) -> EvalResult<()> {
    ctx.exports.store_overflow(&alias.asname, value)?;
    Ok(())
}

/// Components of the base package for a relative import of `level`. An
/// empty result means the import collapses to an absolute one.
fn relative_base(ctx: &ImportContext, level: usize) -> EvalResult<Vec<String>> {
    let comps: Vec<String> = ctx
        .package
        .split('.')
        .filter(|c| !c.is_empty())
        .map(str::to_string)
        .collect();
    let drop = level.saturating_sub(1);
    if drop > comps.len() {
        return Err(error(
            ErrorKind::ImportError,
            format!(
                "attempted relative import beyond top-level package from '{}'",
                ctx.name
            ),
        ));
    }
    Ok(comps[..comps.len() - drop].to_vec())
}

/// Entry point behind the guest-visible `__import__`.
pub fn import(interp: &Interpreter, ctx: &ImportContext, args: Args) -> EvalResult<Value> {
    let slots = args.parse("__import__", &["aliases", "loader", "module", "level"], 2)?;
    let aliases = parse_aliases(slots[0].as_ref().unwrap_or(&Value::None))?;
    let getter = slots[1].clone().unwrap_or(Value::None);
    let module = match &slots[2] {
        None | Some(Value::None) => None,
        Some(Value::Str(s)) if is_dotted(s) => Some(s.to_string()),
        Some(_) => return Err(malformed("module must be a dotted name or None")),
    };
    let level = match &slots[3] {
        None => 0,
        Some(Value::Int(n)) if *n >= 0 => *n as usize,
        Some(_) => return Err(type_error("level must be a non-negative integer")),
    };

    let wildcard = aliases.iter().any(Alias::is_wildcard);
    if !wildcard {
        refuse_rebinding(ctx, &aliases)?;
    }

    let base = if level > 0 { relative_base(ctx, level)? } else { Vec::new() };
    if module.is_none() && base.is_empty() {
        if wildcard {
            return Err(malformed("'*' can only be imported from a module"));
        }
        // `import a.b` and relative imports that climb to the root.
        for alias in &aliases {
            tracing::debug!(importer = %ctx.name, name = %alias.name, "import");
            let found = load(interp, &getter, &alias.name)?.ok_or_else(|| not_found(&alias.name))?;
            bind(ctx, alias, found)?;
        }
        return Ok(Value::None);
    }

    let mut comps = base;
    comps.extend(module.iter().flat_map(|m| m.split('.')).map(str::to_string));
    let fullname = comps.join(".");
    tracing::debug!(importer = %ctx.name, module = %fullname, level, "from-import");
    let source = load(interp, &getter, &fullname)?.ok_or_else(|| not_found(&fullname))?;

    let aliases = if wildcard {
        let names = public_names(interp, &source)?;
        tracing::debug!(importer = %ctx.name, module = %fullname, count = names.len(), "wildcard import");
        let aliases: Vec<Alias> = names.iter().map(|n| Alias::same(n)).collect();
        refuse_rebinding(ctx, &aliases)?;
        aliases
    } else {
        aliases
    };
    for alias in &aliases {
        let value = match attribute_path(interp, &source, &alias.name) {
            Ok(v) => v,
            Err(e) if e.is_a(ErrorKind::AttributeError) => {
                let sub = format!("{fullname}.{}", alias.name);
                load(interp, &getter, &sub)?.ok_or_else(|| {
                    error(
                        ErrorKind::ImportError,
                        format!("cannot import name '{}' from '{fullname}'", alias.name),
                    )
                })?
            }
            Err(e) => return Err(e),
        };
        bind(ctx, alias, value)?;
    }
    Ok(Value::None)
}

fn refuse_rebinding(ctx: &ImportContext, aliases: &[Alias]) -> EvalResult<()> {
    for alias in aliases {
        if ctx.exports.has_instance_attr(&alias.asname) {
            return Err(malformed(format!(
                "'{}' is already bound on module '{}'",
                alias.asname, ctx.name
            )));
        }
    }
    Ok(())
}

/// Names a wildcard import binds: `__all__` if the source defines it,
/// otherwise every attribute not starting with an underscore.
fn public_names(interp: &Interpreter, source: &Value) -> EvalResult<Vec<String>> {
    if let Some(all) = mediator::lookup(interp, source, "__all__")? {
        return interp
            .iterate(&all)?
            .iter()
            .map(|v| match v {
                Value::Str(s) if is_identifier(s) => Ok(s.to_string()),
                _ => Err(type_error("items in __all__ must be identifiers")),
            })
            .collect();
    }
    let names = match source {
        Value::Object(o) => o.attr_names(),
        other => interp.attr_names(other),
    };
    Ok(names.into_iter().filter(|n| !n.starts_with('_')).collect())
}

fn attribute_path(interp: &Interpreter, root: &Value, path: &str) -> EvalResult<Value> {
    let mut value = root.clone();
    for part in path.split('.') {
        value = mediator::getattr(interp, &value, part, None)?;
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::store::{LockedMapping, MapKey};
    use crate::kernel::types::Builtin;
    use crate::interp::testing::interpreter;

    fn alias(name: &str, asname: Option<&str>) -> Value {
        let mut pairs = vec![(MapKey::str("name"), Value::str(name))];
        if let Some(a) = asname {
            pairs.push((MapKey::str("asname"), Value::str(a)));
        }
        Value::Mapping(Rc::new(LockedMapping::from_pairs(pairs)))
    }

    fn context(interp: &Interpreter, name: &str, package: &str) -> ImportContext {
        let class = interp.prelude().builtin(Builtin::Module).clone();
        ImportContext {
            name: name.into(),
            package: package.into(),
            exports: Rc::new(LockedObject::module_exports(class, name)),
        }
    }

    #[test]
    fn test_alias_validation() {
        assert!(parse_aliases(&Value::list(vec![])).is_err());
        assert!(parse_aliases(&Value::list(vec![alias("a-b", None)])).is_err());
        assert!(parse_aliases(&Value::list(vec![alias("a", Some("1x"))])).is_err());
        let parsed = parse_aliases(&Value::list(vec![alias("a.b", None)])).unwrap();
        assert_eq!(parsed[0].asname, "b");
        let parsed = parse_aliases(&Value::list(vec![alias("*", None)])).unwrap();
        assert!(parsed[0].is_wildcard());
        assert!(parse_aliases(&Value::list(vec![alias("*", Some("x"))])).is_err());
        assert!(parse_aliases(&Value::list(vec![alias("*", None), alias("a", None)])).is_err());
    }

    #[test]
    fn test_relative_base() {
        let (interp, _) = interpreter();
        let ctx = context(&interp, "pkg.sub.mod", "pkg.sub");
        assert_eq!(relative_base(&ctx, 1).unwrap(), vec!["pkg", "sub"]);
        assert_eq!(relative_base(&ctx, 2).unwrap(), vec!["pkg"]);
        assert!(relative_base(&ctx, 3).unwrap().is_empty());
        let err = relative_base(&ctx, 4).unwrap_err();
        assert_eq!(err.type_name(), "ImportError");
    }

    #[test]
    fn test_unresolved_getter_is_module_resolution_error() {
        let (interp, _) = interpreter();
        let ctx = context(&interp, "m", "");
        let getter = crate::kernel::sealer::native("getter", "fullname", None, |_, _| Ok(Value::None));
        let args = Args::new(vec![Value::list(vec![alias("nowhere", None)]), getter]);
        let err = import(&interp, &ctx, args).unwrap_err();
        assert_eq!(err.type_name(), "ModuleResolutionError");
    }

    #[test]
    fn test_rebinding_an_exported_name_is_refused() {
        let (interp, _) = interpreter();
        let ctx = context(&interp, "m", "");
        ctx.exports.store_overflow("x", Value::Int(1)).unwrap();
        let getter = crate::kernel::sealer::native("getter", "fullname", None, |_, _| Ok(Value::None));
        let args = Args::new(vec![Value::list(vec![alias("x", None)]), getter]);
        let err = import(&interp, &ctx, args).unwrap_err();
        assert_eq!(err.type_name(), "ImportSyntaxError");
    }
}
