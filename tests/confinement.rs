mod common;

use common::Harness;
use encap::session::{Injection, demo_counter};

const CLOSURE: &str = "\
def outer():
    secret = 41
    def inner():
        return secret + 1
    return inner
f = outer()
";

#[test]
fn test_rejected_programs_run_nothing() {
    let h = Harness::new();
    let err = h.run("print('before')\nglobal x\n").unwrap_err();
    assert!(err.starts_with("ForbiddenSyntaxError"), "{err}");
    assert_eq!(h.output(), "");

    let err = h.run("print('before')\nprint(f.__globals__)\n").unwrap_err();
    assert!(err.starts_with("ForbiddenNameError"), "{err}");
    assert_eq!(h.output(), "");
}

#[test]
fn test_rejected_modules_run_nothing() {
    let h = Harness::new();
    h.write("bad.py", "print('bad runs')\ndef g():\n    pass\nc = g.__code__\n");
    let err = h.run("import bad\n").unwrap_err();
    assert!(err.starts_with("ForbiddenNameError"), "{err}");
    assert_eq!(h.output(), "");
}

#[test]
fn test_reflection_never_yields_internals() {
    let h = Harness::new();
    for name in ["__globals__", "__closure__", "__code__", "__class__"] {
        let err = h
            .run(&format!("{CLOSURE}getattr(f, '{name}')\n"))
            .unwrap_err();
        assert!(err.starts_with("ForbiddenAccessError"), "{name}: {err}");
    }
    let err = h
        .run(&format!("{CLOSURE}safe_format('{{0.__globals__}}', f)\n"))
        .unwrap_err();
    assert!(err.starts_with("ForbiddenAccessError"), "{err}");
    let out = h.run(&format!("{CLOSURE}print(f(), f.__name__)\n")).unwrap();
    assert_eq!(out, "42 inner\n");
}

#[test]
fn test_freeze_locks_nested_stores() {
    let h = Harness::new();
    let out = h
        .run(
            "d = freeze({'inner': [{'n': 1}], 'obj': Object(v=2)})\n\
             for attempt in range(3):\n\
             \x20   try:\n\
             \x20       if attempt == 0:\n\
             \x20           d['new'] = 1\n\
             \x20       elif attempt == 1:\n\
             \x20           d['inner'][0]['n'] = 5\n\
             \x20       else:\n\
             \x20           d['obj'].v = 3\n\
             \x20   except LockedValueError:\n\
             \x20       print('locked', attempt)\n\
             d['inner'].append('lists stay open')\n\
             print(d['inner'][0]['n'], d['obj'].v, len(d['inner']))\n",
        )
        .unwrap();
    assert_eq!(out, "locked 0\nlocked 1\nlocked 2\n1 2 2\n");
}

#[test]
fn test_sealed_capabilities_hide_their_state() {
    let build: Injection = Box::new(demo_counter);
    let h = Harness::with_injection("obj", build);
    let out = h
        .run(
            "print(obj.incr(), obj.incr(), obj.decr(), obj.access())\n\
             print(obj.access)\n\
             print([hasattr(obj.incr, n) for n in ['count', '__globals__', '__closure__', '__wrapped__']])\n",
        )
        .unwrap();
    assert_eq!(out, "1 2 1 1\nfunction()\n[False, False, False, False]\n");

    let err = h.run("obj.incr = None\n").unwrap_err();
    assert!(err.starts_with("LockedValueError"), "{err}");
}

#[test]
fn test_sealed_guest_functions_keep_only_their_signature() {
    let h = Harness::new();
    let out = h
        .run(
            "def add(a, b=2):\n    '''Add two numbers.'''\n    return a + b\n\
             g = fn(add)\n\
             print(g(1), g, g.__doc__)\n\
             print(hasattr(g, '__globals__'), hasattr(g, '__defaults__'))\n",
        )
        .unwrap();
    assert_eq!(out, "3 function(a, b=...) Add two numbers.\nFalse False\n");
}

#[test]
fn test_tracebacks_are_plain_strings() {
    let h = Harness::new();
    let out = h
        .run(
            "def boom():\n    return 1 / 0\n\
             try:\n    boom()\nexcept ZeroDivisionError as e:\n    t = e.__traceback__\n\
             print(isinstance(t, list), all([isinstance(line, str) for line in t]))\n",
        )
        .unwrap();
    assert_eq!(out, "True True\n");
}

#[test]
fn test_runaway_nesting_raises_instead_of_crashing() {
    let h = Harness::new();
    let err = h
        .run("a = []\na.append(a)\nb = []\nb.append(b)\nprint(a == b)\n")
        .unwrap_err();
    assert!(err.starts_with("RecursionError"), "{err}");

    let err = h
        .run(&format!("x = {}1{}\n", "(".repeat(1000), ")".repeat(1000)))
        .unwrap_err();
    assert!(err.starts_with("SyntaxError"), "{err}");

    let out = h
        .run("deep = []\nfor i in range(100000):\n    deep = [deep]\ndeep = None\nprint('released')\n")
        .unwrap();
    assert_eq!(out, "released\n");
}
