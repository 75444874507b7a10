mod common;

use common::Harness;

fn serve(h: &Harness, base: &str, who: &str) {
    h.fetcher.insert(
        &format!("{base}shared.py"),
        Some("text/plain"),
        format!("WHO = '{who}'\n"),
    );
}

#[test]
fn test_most_recent_source_wins_and_exit_restores_order() {
    let h = Harness::new();
    h.write("shared.py", "WHO = 'local'\n");
    serve(&h, "http://a/", "a");
    serve(&h, "http://b/", "b");

    let out = h
        .run(
            "with importer.remote_repo(['shared'], 'http://a/'):\n\
             \x20   with importer.remote_repo(['shared'], 'http://b/'):\n\
             \x20       import shared as inner\n\
             \x20   import shared as outer\n\
             import shared as bottom\n\
             print(inner.WHO, outer.WHO, bottom.WHO)\n",
        )
        .unwrap();
    assert_eq!(out, "b a local\n");
}

#[test]
fn test_sources_only_serve_their_declared_modules() {
    let h = Harness::new();
    h.write("other.py", "WHO = 'local other'\n");
    h.fetcher
        .insert("http://a/other.py", Some("text/plain"), "WHO = 'remote other'\n");

    let out = h
        .run(
            "with importer.remote_repo(['shared'], 'http://a/'):\n\
             \x20   import other\n\
             print(other.WHO)\n",
        )
        .unwrap();
    assert_eq!(out, "local other\n");
    assert!(!h.fetcher.requests().iter().any(|u| u == "http://a/other.py"));
}

#[test]
fn test_local_packages_and_relative_imports() {
    let h = Harness::new();
    h.write("app/__init__.py", "");
    h.write("app/util.py", "def shout(s):\n    return s.upper() + '!'\n");
    h.write(
        "app/main.py",
        "from .util import shout\nfrom . import util\nGREETING = shout('hi')\nSAME = util.shout is shout\n",
    );
    let out = h
        .run("from app.main import GREETING, SAME\nprint(GREETING, SAME)\n")
        .unwrap();
    assert_eq!(out, "HI! True\n");
}

#[test]
fn test_relative_import_beyond_the_root_fails() {
    let h = Harness::new();
    h.write("solo.py", "from .. import nothing\n");
    let err = h.run("import solo\n").unwrap_err();
    assert!(err.starts_with("ImportError"), "{err}");
}

#[test]
fn test_modules_execute_once_per_session() {
    let h = Harness::new();
    h.write("counted.py", "print('executing counted')\n");
    let out = h
        .run("import counted\nimport counted as again\nprint(counted is again)\n")
        .unwrap();
    assert_eq!(out, "executing counted\nTrue\n");
}

#[test]
fn test_rebinding_an_imported_name_is_an_import_syntax_error() {
    let h = Harness::new();
    h.write("one.py", "X = 1\n");
    let err = h.run("import one\nimport one\n").unwrap_err();
    assert!(err.starts_with("ImportSyntaxError"), "{err}");
}

#[test]
fn test_wildcard_imports_bind_public_names_or_all() {
    let h = Harness::new();
    h.write("shapes.py", "SIDES = 4\n_hidden = 1\ndef area(n):\n    return n * n\n");
    h.write("listed.py", "__mod.__all__ = ['kept']\nkept = 'yes'\ndropped = 'no'\n");
    let out = h
        .run(
            "from shapes import *\n\
             from listed import *\n\
             print(SIDES, area(3), kept)\n\
             print(hasattr(__mod, '_hidden'), hasattr(__mod, 'dropped'))\n",
        )
        .unwrap();
    assert_eq!(out, "4 9 yes\nFalse False\n");

    let err = h.run("from shapes import *\nfrom shapes import *\n").unwrap_err();
    assert!(err.starts_with("ImportSyntaxError"), "{err}");
}
