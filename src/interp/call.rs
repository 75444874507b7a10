//! Calls, function binding and class construction.

use std::rc::Rc;

use indexmap::IndexMap;

use super::exec::{Flow, Frame, Locals};
use super::{Env, EvalResult, Interpreter, builtins, forbidden, type_error, value_error};
use crate::kernel::signed;
use crate::kernel::store::{LockedMapping, LockedObject};
use crate::kernel::types::{Builtin, SealedType, TypeBuilder, TypeKind};
use crate::kernel::value::{Args, Descriptor, Function, Value};
use crate::script::ast::FunctionDef;

/// Everything a class statement (or three-argument `type`) hands to the
/// construction pipeline.
pub struct ClassSpec {
    pub name: String,
    pub bases: Vec<Value>,
    pub attrs: IndexMap<String, Value>,
    pub keywords: IndexMap<String, Value>,
    pub doc: Option<Rc<str>>,
}

impl Interpreter {
    pub fn call(&self, callee: &Value, args: Args) -> EvalResult<Value> {
        match callee {
            Value::Function(f) => self.call_function(f, args),
            Value::Native(n) => (n.func)(self, args),
            Value::Bound(b) => self.call(&b.func, args.prepend(b.receiver.clone())),
            Value::Capability(c) => self.call(&c.target, args),
            Value::Type(t) => self.instantiate(t, args),
            Value::Descriptor(d) => match &**d {
                Descriptor::StaticMethod(f) => self.call(f, args),
                _ => Err(type_error(format!(
                    "'{}' object is not callable",
                    callee.type_name()
                ))),
            },
            Value::Object(_) => match self.class_hook(callee, "__call__")? {
                Some(hook) => self.call(&hook, args),
                None => Err(type_error(format!(
                    "'{}' object is not callable",
                    callee.type_name()
                ))),
            },
            other => Err(type_error(format!(
                "'{}' object is not callable",
                other.type_name()
            ))),
        }
    }

    /// Look `name` up on `receiver` (raw layer) and call it.
    pub fn call_method(&self, receiver: &Value, name: &str, args: Args) -> EvalResult<Value> {
        let method = self.get_attr(receiver, name)?;
        self.call(&method, args)
    }

    fn call_function(&self, func: &Rc<Function>, args: Args) -> EvalResult<Value> {
        let env = Env::new(func.env.clone());
        self.bind_params(func, args, &env)?;
        let frame = Frame::new(
            func.globals.clone(),
            Locals::Function(env),
            func.class_cell.clone(),
            func.name(),
            &func.file,
        );
        self.in_frame(&frame, |interp| {
            match interp.exec_block(&frame, &func.def.body)? {
                Flow::Return(v) => Ok(v),
                _ => Ok(Value::None),
            }
        })
    }

    fn bind_params(&self, func: &Function, args: Args, env: &Rc<Env>) -> EvalResult<()> {
        let params = &func.def.params;
        let name = func.name();
        let Args {
            positional,
            mut keywords,
        } = args;

        let n = params.args.len();
        let mut extra = Vec::new();
        for (i, value) in positional.into_iter().enumerate() {
            match params.args.get(i) {
                Some(p) => env.set(&p.name, value),
                None => extra.push(value),
            }
        }
        match &params.vararg {
            Some(vararg) => env.set(vararg, Value::tuple(extra)),
            None if !extra.is_empty() => {
                return Err(type_error(format!(
                    "{name}() takes {n} positional arguments but {} were given",
                    n + extra.len()
                )));
            }
            None => {}
        }

        for p in params.args.iter().chain(&params.kwonly) {
            if let Some(value) = keywords.shift_remove(&p.name) {
                if env.get_local(&p.name).is_some() {
                    return Err(type_error(format!(
                        "{name}() got multiple values for argument '{}'",
                        p.name
                    )));
                }
                env.set(&p.name, value);
            }
        }
        match &params.kwarg {
            Some(kwarg) => {
                let rest = LockedMapping::new();
                for (key, value) in keywords {
                    rest.insert_str(&key, value)?;
                }
                env.set(kwarg, Value::Mapping(Rc::new(rest)));
            }
            None => {
                if let Some(key) = keywords.keys().next() {
                    return Err(type_error(format!(
                        "{name}() got an unexpected keyword argument '{key}'"
                    )));
                }
            }
        }

        let first_default = n - func.defaults.len();
        for (i, p) in params.args.iter().enumerate() {
            if env.get_local(&p.name).is_some() {
                continue;
            }
            if i < first_default {
                return Err(type_error(format!(
                    "{name}() missing required positional argument: '{}'",
                    p.name
                )));
            }
            env.set(&p.name, func.defaults[i - first_default].clone());
        }
        for (p, default) in params.kwonly.iter().zip(&func.kw_defaults) {
            if env.get_local(&p.name).is_some() {
                continue;
            }
            match default {
                Some(v) => env.set(&p.name, v.clone()),
                None => {
                    return Err(type_error(format!(
                        "{name}() missing required keyword-only argument: '{}'",
                        p.name
                    )));
                }
            }
        }
        Ok(())
    }

    pub(crate) fn make_function(&self, frame: &Frame, def: &Rc<FunctionDef>) -> EvalResult<Value> {
        let defaults = def
            .params
            .args
            .iter()
            .filter_map(|p| p.default.as_ref())
            .map(|e| self.eval(frame, e))
            .collect::<EvalResult<Vec<_>>>()?;
        let kw_defaults = def
            .params
            .kwonly
            .iter()
            .map(|p| p.default.as_ref().map(|e| self.eval(frame, e)).transpose())
            .collect::<EvalResult<Vec<_>>>()?;
        let class_cell = match &frame.locals {
            Locals::Class { cell, .. } => Some(cell.clone()),
            _ => frame.class_cell.clone(),
        };
        Ok(Value::Function(Rc::new(Function {
            def: def.clone(),
            defaults,
            kw_defaults,
            globals: frame.globals.clone(),
            env: frame.enclosing_env(),
            class_cell,
            file: frame.file.clone(),
        })))
    }

    /// Call a type: build an instance and run its `__init__`.
    pub fn instantiate(&self, cls: &Rc<SealedType>, args: Args) -> EvalResult<Value> {
        let obj = match cls.kind() {
            TypeKind::Root => return Err(forbidden("the root type cannot be called")),
            TypeKind::Builtin(Builtin::LockedObject | Builtin::SignedClass) => {
                LockedObject::new(cls.clone())
            }
            TypeKind::Builtin(b) => return builtins::construct(self, b, args),
            _ => match cls.error_kind() {
                Some(_) => LockedObject::exception(cls.clone(), Vec::new()),
                None => LockedObject::new(cls.clone()),
            },
        };
        let obj = Value::Object(Rc::new(obj));
        if let Some(init) = cls.lookup("__init__") {
            let result = self.call(&init, args.prepend(obj.clone()))?;
            if !result.is_none() {
                return Err(type_error("__init__() should return None"));
            }
        }
        Ok(obj)
    }

    /// The class construction pipeline: validate bases, linearize, populate,
    /// then (for signed classes) sign and seal.
    pub fn create_class(&self, spec: ClassSpec) -> EvalResult<Rc<SealedType>> {
        let mut bases = Vec::with_capacity(spec.bases.len());
        for base in &spec.bases {
            let Value::Type(t) = base else {
                return Err(type_error(format!(
                    "bases must be types, not {}",
                    base.type_name()
                )));
            };
            match t.kind() {
                TypeKind::Root => return Err(forbidden("cannot derive from the root type")),
                TypeKind::Object
                | TypeKind::Class
                | TypeKind::Error(_)
                | TypeKind::Builtin(Builtin::LockedObject | Builtin::SignedClass) => {}
                TypeKind::Builtin(_) => {
                    return Err(type_error(format!(
                        "type '{}' is not an acceptable base type",
                        t.name()
                    )));
                }
            }
            bases.push(t.clone());
        }
        if bases.is_empty() {
            bases.push(self.prelude().object().clone());
        }

        let mut keywords = spec.keywords;
        if keywords.contains_key("metaclass") {
            return Err(type_error("metaclasses are not supported"));
        }
        let signed = bases.iter().any(|b| b.derives_from(Builtin::SignedClass));
        let private_key = if signed {
            Some(keywords.shift_remove("private_key").ok_or_else(|| {
                type_error(format!(
                    "class '{}' derives from SignedClass and requires a private_key",
                    spec.name
                ))
            })?)
        } else {
            None
        };
        if let Some(key) = keywords.keys().next() {
            return Err(type_error(format!(
                "unexpected class keyword argument '{key}'"
            )));
        }

        let cls = TypeBuilder::new(&spec.name, TypeKind::Class)
            .bases(bases)
            .attrs(spec.attrs)
            .doc(spec.doc)
            .build()
            .map_err(type_error)?;

        if let Some(key) = private_key {
            let pem: Vec<u8> = match &key {
                Value::Str(s) => s.as_bytes().to_vec(),
                Value::Bytes(b) => b.to_vec(),
                other => {
                    return Err(type_error(format!(
                        "private_key must be str or bytes, not {}",
                        other.type_name()
                    )));
                }
            };
            let token = signed::sign(&pem, cls.identity()).map_err(|e| {
                value_error(format!("cannot sign class '{}': {e}", cls.name()))
            })?;
            cls.set_attr("__verifier__", Value::from(token))?;
            cls.metalock();
            tracing::debug!(class = %cls.name(), identity = cls.identity(), "signed class sealed");
        }
        Ok(cls)
    }
}

#[cfg(test)]
mod tests {
    use crate::interp::testing::{interpreter, output};
    use crate::kernel::scope::Scope;
    use crate::kernel::store::LockedMapping;
    use std::rc::Rc;

    fn run(src: &str) -> Result<String, String> {
        let (interp, buf) = interpreter();
        let scope = Scope::with_builtins(Rc::new(LockedMapping::new()));
        crate::interp::builtins::install_for_tests(&interp, &scope);
        interp
            .run_source(src, &scope, "<test>", false)
            .map(|_| output(&buf))
            .map_err(|e| e.to_string())
    }

    #[test]
    fn test_argument_binding() {
        let out = run(
            "def f(a, b=2, *rest, key, opt=None, **extra):\n    return (a, b, rest, key, opt, sorted(extra))\n\
             print(f(1, key=3))\nprint(f(1, 5, 6, 7, key=3, z=0))\n",
        )
        .unwrap();
        assert_eq!(out, "(1, 2, (), 3, None, [])\n(1, 5, (6, 7), 3, None, ['z'])\n");
    }

    #[test]
    fn test_binding_errors() {
        let err = run("def f(a):\n    pass\nf()\n").unwrap_err();
        assert!(err.contains("missing required positional argument: 'a'"), "{err}");
        let err = run("def f(a):\n    pass\nf(1, a=2)\n").unwrap_err();
        assert!(err.contains("multiple values"), "{err}");
        let err = run("def f():\n    pass\nf(x=1)\n").unwrap_err();
        assert!(err.contains("unexpected keyword argument 'x'"), "{err}");
    }

    #[test]
    fn test_inheritance_and_super() {
        let out = run(
            "class A:\n    def __init__(self, x):\n        self.x = x\n    def who(self):\n        return 'A'\n\
             class B(A):\n    def __init__(self, x):\n        super().__init__(x + 1)\n    def who(self):\n        return 'B' + super().who()\n\
             b = B(1)\nprint(b.x, b.who(), isinstance(b, A))\n",
        )
        .unwrap();
        assert_eq!(out, "2 BA True\n");
    }

    #[test]
    fn test_builtin_bases_are_refused() {
        let err = run("class S(int):\n    pass\n").unwrap_err();
        assert!(err.contains("not an acceptable base type"), "{err}");
    }

    #[test]
    fn test_call_hook_and_descriptors() {
        let out = run(
            "class C:\n    def __init__(self):\n        self._v = 1\n    @property\n    def v(self):\n        return self._v\n\
             \x20   @v.setter\n    def v(self, value):\n        self._v = value * 10\n    @classmethod\n    def make(cls):\n        return cls()\n\
             \x20   @staticmethod\n    def twice(n):\n        return n * 2\n    def __call__(self, n):\n        return n + self.v\n\
             c = C.make()\nc.v = 2\nprint(c.v, C.twice(4), c(1))\n",
        )
        .unwrap();
        assert_eq!(out, "20 8 21\n");
    }
}
