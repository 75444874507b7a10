mod common;

use std::time::Duration;

use common::{Harness, encrypted_zip_archive, tar_gz, zip_archive};

const MOD_PY: &str = "\
print('mod runs')
try:
    import pkg.mod as again
except ModuleResolutionError:
    print('self-import refused')
VALUE = 7
";

fn harness_with_zip() -> Harness {
    let h = Harness::new();
    let body = zip_archive(&[
        ("pkg/__init__.py", b"print('pkg init')\n".as_slice()),
        ("pkg/mod.py", MOD_PY.as_bytes()),
        ("LICENSE", b"MIT\n".as_slice()),
    ]);
    h.fetcher
        .insert("http://h/lib.zip", Some("application/zip"), body);
    h
}

#[test]
fn test_zip_module_runs_once_and_self_import_is_refused() {
    let h = harness_with_zip();
    let out = h
        .run(
            "with importer.remote_repo(['pkg'], 'http://h/lib.zip') as find:\n\
             \x20   import pkg.mod\n\
             \x20   import pkg.mod as again\n\
             print(mod.VALUE, again is mod, find)\n",
        )
        .unwrap();
    assert_eq!(out, "mod runs\nself-import refused\n7 True function(fullname)\n");
    // One fetch of the archive; module lookups are served from memory.
    assert_eq!(h.fetcher.requests(), vec!["http://h/lib.zip"]);
}

#[test]
fn test_source_is_popped_after_the_block() {
    let h = harness_with_zip();
    let err = h
        .run(
            "with importer.remote_repo(['pkg'], 'http://h/lib.zip'):\n    pass\nimport pkg\n",
        )
        .unwrap_err();
    assert!(err.starts_with("ModuleResolutionError"), "{err}");
}

#[test]
fn test_source_is_popped_when_the_block_raises() {
    let h = harness_with_zip();
    let out = h
        .run(
            "try:\n\
             \x20   with importer.remote_repo(['pkg'], 'http://h/lib.zip'):\n\
             \x20       raise ValueError('boom')\n\
             except ValueError as e:\n\
             \x20   print('caught', e)\n\
             try:\n\
             \x20   import pkg\n\
             except ModuleResolutionError:\n\
             \x20   print('gone')\n",
        )
        .unwrap();
    assert_eq!(out, "caught boom\ngone\n");
}

#[test]
fn test_package_import_and_raw_assets() {
    let h = harness_with_zip();
    let out = h
        .run(
            "with importer.remote_repo(['pkg', 'LICENSE'], 'http://h/lib.zip'):\n\
             \x20   import pkg\n\
             \x20   import LICENSE\n\
             print(pkg.__name__, LICENSE)\n",
        )
        .unwrap();
    assert_eq!(out, "pkg init\npkg b'MIT\\n'\n");
}

#[test]
fn test_tarball_sources_work_like_zips() {
    let h = Harness::new();
    let body = tar_gz(&[("tools.py", b"def triple(n):\n    return n * 3\n".as_slice())]);
    h.fetcher
        .insert("https://h/t.tar.gz", Some("application/gzip"), body);
    let out = h
        .run(
            "with importer.remote_repo('tools', 'https://h/t.tar.gz'):\n\
             \x20   from tools import triple\n\
             print(triple(5), triple)\n",
        )
        .unwrap();
    assert_eq!(out, "15 function(n)\n");
}

#[test]
fn test_served_trees_are_fetched_file_by_file() {
    let h = Harness::new();
    h.fetcher.insert("http://h/tree", Some("text/html"), "<html></html>");
    h.fetcher
        .insert("http://h/tree/util/__init__.py", Some("text/plain"), "NAME = 'util'\n");
    let out = h
        .run(
            "with importer.remote_repo(['util'], 'http://h/tree'):\n\
             \x20   import util\n\
             print(util.NAME)\n",
        )
        .unwrap();
    assert_eq!(out, "util\n");
    assert_eq!(
        h.fetcher.requests(),
        vec![
            "http://h/tree",
            "http://h/tree/util.py",
            "http://h/tree/util/__init__.py"
        ]
    );
}

#[test]
fn test_unknown_content_is_an_archive_format_error() {
    let h = Harness::new();
    h.fetcher
        .insert("http://h/blob", Some("application/octet-stream"), vec![0u8; 64]);
    let err = h
        .run("with importer.remote_repo(['x'], 'http://h/blob'):\n    pass\n")
        .unwrap_err();
    assert!(err.starts_with("ArchiveFormatError"), "{err}");
}

#[test]
fn test_disallowed_schemes_are_refused_before_fetching() {
    let h = Harness::new();
    for url in ["file:///etc/", "javascript:alert(1)", "data:text/plain,x"] {
        let err = h
            .run(&format!("importer.remote_repo(['x'], '{url}')\n"))
            .unwrap_err();
        assert!(err.starts_with("ImportError"), "{url}: {err}");
    }
    assert!(h.fetcher.requests().is_empty());
}

#[test]
fn test_git_hosts_build_raw_content_urls() {
    let h = Harness::new();
    h.fetcher.insert(
        "https://raw.githubusercontent.com/acme/widgets/v2/widgets.py",
        Some("text/plain"),
        "KIND = 'widget'\n",
    );
    let out = h
        .run(
            "with importer.github_repo('acme', 'widgets', branch='v2'):\n\
             \x20   import widgets\n\
             print(widgets.KIND)\n",
        )
        .unwrap();
    assert_eq!(out, "widget\n");
    assert_eq!(
        h.fetcher.requests()[0],
        "https://raw.githubusercontent.com/acme/widgets/v2/"
    );
}

#[test]
fn test_password_protected_zips_need_zip_pwd() {
    let locked = || {
        let h = Harness::new();
        let body = encrypted_zip_archive(&[("secret.py", b"WORD = 'swordfish'\n".as_slice())], b"hunter2");
        h.fetcher
            .insert("http://h/locked.zip", Some("application/zip"), body);
        h
    };
    let out = locked()
        .run(
            "with importer.remote_repo(['secret'], 'http://h/locked.zip', zip_pwd='hunter2'):\n\
             \x20   import secret\n\
             print(secret.WORD)\n",
        )
        .unwrap();
    assert_eq!(out, "swordfish\n");

    let err = locked()
        .run("with importer.remote_repo(['secret'], 'http://h/locked.zip'):\n    import secret\n")
        .unwrap_err();
    assert!(err.starts_with("ArchiveFormatError"), "{err}");
}

#[test]
fn test_tree_fetches_honour_the_loader_timeout() {
    let h = Harness::new();
    h.fetcher
        .insert("http://h/tree/slow.py", Some("text/plain"), "N = 1\n");
    let out = h
        .run(
            "with importer.remote_repo(['slow', 'fast'], 'http://h/tree') as find:\n\
             \x20   load = find('slow')\n\
             \x20   print(load('slow', timeout=3).N, load('fast', timeout=None))\n",
        )
        .unwrap();
    assert_eq!(out, "1 None\n");
    let secs = |n| Duration::from_secs(n);
    assert_eq!(h.fetcher.timeouts(), vec![secs(10), secs(3), secs(10), secs(10)]);

    let err = h
        .run("with importer.remote_repo(['slow'], 'http://h/tree') as find:\n    find('slow')('slow', timeout='3')\n")
        .unwrap_err();
    assert!(err.starts_with("TypeError"), "{err}");
}

#[test]
fn test_other_allowed_schemes_resolve_as_unresolved_modules() {
    let h = Harness::new();
    let err = h
        .run("with importer.remote_repo(['x'], 'ftp://h/pub'):\n    import x\n")
        .unwrap_err();
    assert!(err.starts_with("ModuleResolutionError"), "{err}");
    assert_eq!(h.fetcher.requests()[0], "ftp://h/pub");
}
