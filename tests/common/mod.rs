//! Shared harness for end-to-end tests.

#![allow(dead_code)]

use std::cell::RefCell;
use std::path::Path;
use std::rc::Rc;

use encap::interp::Prelude;
use encap::loader::{LoaderSettings, MemoryFetcher};
use encap::session::{Injection, LaunchOptions, Session, SessionConfig};
use tempfile::TempDir;

pub const SIGNING_KEY: &str = include_str!("../fixtures/signing_key.pem");
pub const SIGNING_PUB: &str = include_str!("../fixtures/signing_key.pub.pem");
pub const OTHER_KEY: &str = include_str!("../fixtures/other_key.pem");
pub const OTHER_PUB: &str = include_str!("../fixtures/other_key.pub.pem");

pub struct Harness {
    pub session: Session,
    pub fetcher: Rc<MemoryFetcher>,
    pub root: TempDir,
    out: Rc<RefCell<Vec<u8>>>,
}

impl Harness {
    pub fn new() -> Self {
        Self::build(None)
    }

    pub fn with_injection(name: &str, build: Injection) -> Self {
        Self::build(Some((name.to_string(), build)))
    }

    fn build(inject: Option<(String, Injection)>) -> Self {
        let root = tempfile::tempdir().unwrap();
        let fetcher = Rc::new(MemoryFetcher::new());
        let out = Rc::new(RefCell::new(Vec::new()));
        let config = SessionConfig {
            prelude: Prelude::new(),
            local_root: root.path().to_path_buf(),
            loader: LoaderSettings::default(),
            fetcher: fetcher.clone(),
            output: out.clone(),
            banners: false,
        };
        let mut options = LaunchOptions::new(config);
        options.inject = inject;
        let session = Session::launch(options).unwrap();
        Self {
            session,
            fetcher,
            root,
            out,
        }
    }

    /// Write a module file under the local root.
    pub fn write(&self, rel: &str, body: &str) {
        let path = self.root.path().join(rel);
        if let Some(parent) = Path::new(&path).parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, body).unwrap();
    }

    /// Run `src` at top level. Returns the output produced, or the error
    /// rendered as `Type: message` with the output left in place.
    pub fn run(&self, src: &str) -> Result<String, String> {
        self.session.run_script(src).map_err(|e| e.to_string())?;
        let out = self.output();
        self.clear();
        Ok(out)
    }

    /// Output written so far by a failed run.
    pub fn output(&self) -> String {
        String::from_utf8_lossy(&self.out.borrow()).into_owned()
    }

    pub fn clear(&self) {
        self.out.borrow_mut().clear();
    }
}

/// A zip archive holding `files`.
pub fn zip_archive(files: &[(&str, &[u8])]) -> Vec<u8> {
    use std::io::Write;
    let mut writer = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
    for (name, body) in files {
        writer
            .start_file(*name, zip::write::SimpleFileOptions::default())
            .unwrap();
        writer.write_all(body).unwrap();
    }
    writer.finish().unwrap().into_inner()
}

/// A zip archive whose entries are encrypted with `password`.
pub fn encrypted_zip_archive(files: &[(&str, &[u8])], password: &[u8]) -> Vec<u8> {
    use std::io::Write;
    use zip::unstable::write::FileOptionsExt;
    let mut writer = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
    for (name, body) in files {
        let options = zip::write::SimpleFileOptions::default().with_deprecated_encryption(password);
        writer.start_file(*name, options).unwrap();
        writer.write_all(body).unwrap();
    }
    writer.finish().unwrap().into_inner()
}

/// A gzip-compressed tarball holding `files`.
pub fn tar_gz(files: &[(&str, &[u8])]) -> Vec<u8> {
    use std::io::Write;
    let mut builder = tar::Builder::new(Vec::new());
    for (name, body) in files {
        let mut header = tar::Header::new_ustar();
        header.set_size(body.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, name, *body).unwrap();
    }
    let raw = builder.into_inner().unwrap();
    let mut enc = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    enc.write_all(&raw).unwrap();
    enc.finish().unwrap()
}
