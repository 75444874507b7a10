//! Remote content detection and archive-backed sources.
//!
//! A remote base URL is fetched once when its source is registered. What
//! comes back decides the source type: a failed fetch or a document whose
//! content type mentions `text` means a served tree, a tarball or a zip
//! file becomes an in-memory archive, and anything else is refused.
//! Tarballs may be plain or compressed with gzip, bzip2 or xz; the
//! compression is recognised by its magic number.

use std::borrow::Cow;
use std::io::{Cursor, Read};
use std::rc::Rc;
use std::time::Duration;

use bzip2::read::BzDecoder;
use flate2::read::GzDecoder;
use indexmap::IndexMap;
use xz2::read::XzDecoder;
use zip::ZipArchive;

use super::source::TreeSource;
use super::{FetchError, Fetched, Fetcher, FoundModule, ModuleKind, Source, candidate_paths, top_level};
use crate::error::KernelError;

pub enum Archive {
    Tar(IndexMap<String, Vec<u8>>),
    Zip {
        bytes: Vec<u8>,
        names: Vec<String>,
        password: Option<Vec<u8>>,
    },
}

impl Archive {
    pub fn kind(&self) -> &'static str {
        match self {
            Archive::Tar(_) => "tar",
            Archive::Zip { .. } => "zip",
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        match self {
            Archive::Tar(entries) => entries.contains_key(name),
            Archive::Zip { names, .. } => names.iter().any(|n| n == name),
        }
    }

    pub fn read(&self, name: &str) -> Result<Vec<u8>, String> {
        match self {
            Archive::Tar(entries) => entries
                .get(name)
                .cloned()
                .ok_or_else(|| format!("{name} is not in the archive")),
            Archive::Zip {
                bytes, password, ..
            } => {
                let mut archive = ZipArchive::new(Cursor::new(bytes.as_slice())).map_err(|e| e.to_string())?;
                let mut file = match password {
                    Some(pwd) => archive.by_name_decrypt(name, pwd),
                    None => archive.by_name(name),
                }
                .map_err(|e| e.to_string())?;
                let mut out = Vec::new();
                file.read_to_end(&mut out).map_err(|e| e.to_string())?;
                Ok(out)
            }
        }
    }
}

const GZIP_MAGIC: &[u8] = &[0x1f, 0x8b];
const BZIP2_MAGIC: &[u8] = b"BZh";
const XZ_MAGIC: &[u8] = &[0xfd, b'7', b'z', b'X', b'Z', 0x00];

/// Strip a recognised compression layer. Bodies that do not decode are
/// returned as they are.
fn decompress(body: &[u8]) -> Cow<'_, [u8]> {
    let mut out = Vec::new();
    let read = if body.starts_with(GZIP_MAGIC) {
        GzDecoder::new(body).read_to_end(&mut out)
    } else if body.starts_with(BZIP2_MAGIC) {
        BzDecoder::new(body).read_to_end(&mut out)
    } else if body.starts_with(XZ_MAGIC) {
        XzDecoder::new(body).read_to_end(&mut out)
    } else {
        return Cow::Borrowed(body);
    };
    match read {
        Ok(_) => Cow::Owned(out),
        Err(error) => {
            tracing::debug!(%error, "compressed body did not decode");
            Cow::Borrowed(body)
        }
    }
}

fn read_tar(body: &[u8]) -> Option<IndexMap<String, Vec<u8>>> {
    let data = decompress(body);
    if data.len() < 512 || &data[257..262] != b"ustar" {
        return None;
    }
    let mut archive = tar::Archive::new(&*data);
    let mut entries = IndexMap::new();
    for entry in archive.entries().ok()? {
        let mut entry = entry.ok()?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let name = entry
            .path()
            .ok()?
            .to_string_lossy()
            .trim_start_matches("./")
            .to_string();
        let mut bytes = Vec::new();
        entry.read_to_end(&mut bytes).ok()?;
        entries.insert(name, bytes);
    }
    Some(entries)
}

fn read_zip(body: &[u8], password: Option<&[u8]>) -> Option<Archive> {
    let archive = ZipArchive::new(Cursor::new(body)).ok()?;
    let names = archive.file_names().map(str::to_string).collect();
    Some(Archive::Zip {
        bytes: body.to_vec(),
        names,
        password: password.map(<[u8]>::to_vec),
    })
}

pub enum Content {
    Tree,
    Archive(Archive),
}

/// Classify what a base URL served.
pub fn detect(base: &str, fetched: Result<Fetched, FetchError>, password: Option<&[u8]>) -> Result<Content, KernelError> {
    let doc = match fetched {
        Ok(doc) => doc,
        Err(error) => {
            tracing::debug!(base, %error, "base URL not fetchable, treating it as a served tree");
            return Ok(Content::Tree);
        }
    };
    if doc
        .content_type
        .as_deref()
        .is_some_and(|ct| ct.to_ascii_lowercase().contains("text"))
    {
        return Ok(Content::Tree);
    }
    if let Some(entries) = read_tar(&doc.body) {
        return Ok(Content::Archive(Archive::Tar(entries)));
    }
    if let Some(archive) = read_zip(&doc.body, password) {
        return Ok(Content::Archive(archive));
    }
    Err(KernelError::ArchiveFormat(base.to_string()))
}

/// An archive fetched once and served from memory.
pub struct ArchiveSource {
    base: String,
    modules: Vec<String>,
    archive: Archive,
}

impl ArchiveSource {
    pub fn new(base: &str, modules: Vec<String>, archive: Archive) -> Self {
        Self {
            base: base.to_string(),
            modules,
            archive,
        }
    }
}

impl Source for ArchiveSource {
    fn label(&self) -> &str {
        &self.base
    }

    /// Declared modules, plus raw assets named exactly.
    fn serves(&self, fullname: &str) -> bool {
        self.modules
            .iter()
            .any(|m| m == top_level(fullname) || m == fullname)
    }

    fn find(&self, fullname: &str, _timeout: Duration) -> Result<Option<FoundModule>, KernelError> {
        let (module, package) = candidate_paths(fullname);
        let hit = [
            (module, ModuleKind::Module),
            (package, ModuleKind::Package),
            (fullname.to_string(), ModuleKind::Raw),
        ]
        .into_iter()
        .find(|(entry, _)| self.archive.contains(entry));
        let Some((entry, kind)) = hit else {
            return Ok(None);
        };
        let bytes = self
            .archive
            .read(&entry)
            .map_err(|e| KernelError::ArchiveFormat(format!("{} ({entry}: {e})", self.base)))?;
        Ok(Some(FoundModule {
            name: fullname.to_string(),
            kind,
            location: format!("{}{entry}", self.base),
            file: entry,
            bytes,
        }))
    }
}

/// Fetch `url` once, exactly as given, and build the matching source.
/// Tree lookups and module locations use `url` with a trailing `/`.
pub fn remote_source(
    url: &str,
    modules: Vec<String>,
    password: Option<&[u8]>,
    fetcher: Rc<dyn Fetcher>,
    timeout: Duration,
) -> Result<Rc<dyn Source>, KernelError> {
    let fetched = fetcher.fetch(url, timeout);
    let content = detect(url, fetched, password)?;
    let base = if url.ends_with('/') {
        url.to_string()
    } else {
        format!("{url}/")
    };
    let base = base.as_str();
    let source: Rc<dyn Source> = match content {
        Content::Tree => {
            tracing::info!(base, "remote source is a served tree");
            Rc::new(TreeSource::new(base, modules, fetcher))
        }
        Content::Archive(archive) => {
            tracing::info!(base, kind = archive.kind(), "remote source is an archive");
            Rc::new(ArchiveSource::new(base, modules, archive))
        }
    };
    Ok(source)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::MemoryFetcher;
    use std::io::Write;

    fn tarball(files: &[(&str, &str)]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        for (name, body) in files {
            let mut header = tar::Header::new_ustar();
            header.set_size(body.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, name, body.as_bytes()).unwrap();
        }
        builder.into_inner().unwrap()
    }

    fn gzip(raw: Vec<u8>) -> Vec<u8> {
        let mut enc = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        enc.write_all(&raw).unwrap();
        enc.finish().unwrap()
    }

    fn bzip2(raw: Vec<u8>) -> Vec<u8> {
        let mut enc = bzip2::write::BzEncoder::new(Vec::new(), bzip2::Compression::default());
        enc.write_all(&raw).unwrap();
        enc.finish().unwrap()
    }

    fn xz(raw: Vec<u8>) -> Vec<u8> {
        let mut enc = xz2::write::XzEncoder::new(Vec::new(), 6);
        enc.write_all(&raw).unwrap();
        enc.finish().unwrap()
    }

    fn zipfile(files: &[(&str, &str)]) -> Vec<u8> {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        for (name, body) in files {
            writer
                .start_file(*name, zip::write::SimpleFileOptions::default())
                .unwrap();
            writer.write_all(body.as_bytes()).unwrap();
        }
        writer.finish().unwrap().into_inner()
    }

    fn fetched(content_type: Option<&str>, body: Vec<u8>) -> Result<Fetched, FetchError> {
        Ok(Fetched {
            content_type: content_type.map(str::to_string),
            body,
        })
    }

    #[test]
    fn test_detects_every_kind() {
        let base = "http://h/x";
        assert!(matches!(
            detect(base, Err(FetchError::Missing(base.into())), None).unwrap(),
            Content::Tree
        ));
        assert!(matches!(
            detect(base, fetched(Some("text/html; charset=utf-8"), b"<html>".to_vec()), None).unwrap(),
            Content::Tree
        ));
        let packers: [fn(Vec<u8>) -> Vec<u8>; 4] = [|raw| raw, gzip, bzip2, xz];
        for pack in packers {
            let body = pack(tarball(&[("pkg/__init__.py", "A = 1\n")]));
            match detect(base, fetched(Some("application/octet-stream"), body), None).unwrap() {
                Content::Archive(Archive::Tar(entries)) => {
                    assert_eq!(entries["pkg/__init__.py"], b"A = 1\n");
                }
                _ => panic!("expected a tarball"),
            }
        }
        let body = zipfile(&[("pkg/__init__.py", "A = 1\n")]);
        match detect(base, fetched(None, body), None).unwrap() {
            Content::Archive(a) => assert_eq!(a.kind(), "zip"),
            Content::Tree => panic!("expected a zip"),
        }
        let err = detect(base, fetched(None, b"garbage".to_vec()), None).err().unwrap();
        assert!(matches!(err, KernelError::ArchiveFormat(_)));
    }

    #[test]
    fn test_archive_lookup_by_manifest() {
        let body = zipfile(&[
            ("pkg/__init__.py", "A = 1\n"),
            ("pkg/mod.py", "B = 2\n"),
            ("data.bin", "\x01\x02"),
        ]);
        let Some(archive) = read_zip(&body, None) else {
            panic!("not a zip");
        };
        let source = ArchiveSource::new("http://h/a.zip/", vec!["pkg".into(), "data.bin".into()], archive);
        let t = Duration::from_secs(1);

        let pkg = source.find("pkg", t).unwrap().unwrap();
        assert_eq!((pkg.kind, pkg.file.as_str()), (ModuleKind::Package, "pkg/__init__.py"));
        let m = source.find("pkg.mod", t).unwrap().unwrap();
        assert_eq!(m.kind, ModuleKind::Module);
        assert_eq!(m.location, "http://h/a.zip/pkg/mod.py");
        let raw = source.find("data.bin", t).unwrap().unwrap();
        assert_eq!((raw.kind, raw.bytes), (ModuleKind::Raw, vec![1, 2]));
        assert!(source.find("pkg.missing", t).unwrap().is_none());
    }

    #[test]
    fn test_remote_source_fetches_the_url_as_given() {
        let fetcher = Rc::new(MemoryFetcher::new());
        fetcher.insert("http://h/a.zip", Some("application/zip"), zipfile(&[("m.py", "X = 1\n")]));
        let t = Duration::from_secs(2);

        let zipped = remote_source("http://h/a.zip", vec!["m".into()], None, fetcher.clone(), t).unwrap();
        assert_eq!(zipped.label(), "http://h/a.zip/");
        assert_eq!(zipped.find("m", t).unwrap().unwrap().location, "http://h/a.zip/m.py");

        let tree = remote_source("http://h/tree", vec!["m".into()], None, fetcher.clone(), t).unwrap();
        assert!(tree.find("m", t).unwrap().is_none());
        assert_eq!(
            fetcher.requests(),
            vec![
                "http://h/a.zip",
                "http://h/tree",
                "http://h/tree/m.py",
                "http://h/tree/m/__init__.py"
            ]
        );
    }
}
