//! Filesystem capability interface used to persist input, intermediate and
//! output files.
//!
//! One local backend exists today; the trait keeps the door open for remote
//! backends without the executors caring. Backends are addressed by URL,
//! e.g. `local:///var/data/input`.

use std::fs::OpenOptions;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};

/// How a file is opened.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Perm {
    Read,
    /// Create if absent, truncate if present.
    Write,
}

pub trait FileHandle: Read + Write + Send {}

impl FileHandle for std::fs::File {}

pub trait FileSystem: Send + Sync {
    fn open(&self, name: &str, perm: Perm) -> Result<Box<dyn FileHandle>>;
    /// Atomic within one backend; used to publish reduce output.
    fn rename(&self, src: &str, dst: &str) -> Result<()>;
    fn unlink(&self, name: &str) -> Result<()>;
}

/// A [`FileSystem`] rooted at a local directory.
pub struct LocalFs {
    root: PathBuf,
}

impl LocalFs {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        if !root.is_dir() {
            bail!("not a directory: {}", root.display());
        }
        Ok(Self { root })
    }
}

impl FileSystem for LocalFs {
    fn open(&self, name: &str, perm: Perm) -> Result<Box<dyn FileHandle>> {
        let path = self.root.join(name);
        let file = match perm {
            Perm::Read => OpenOptions::new().read(true).open(&path),
            Perm::Write => OpenOptions::new().write(true).create(true).truncate(true).open(&path),
        }
        .with_context(|| format!("open {}", path.display()))?;
        Ok(Box::new(file))
    }

    fn rename(&self, src: &str, dst: &str) -> Result<()> {
        std::fs::rename(self.root.join(src), self.root.join(dst))
            .with_context(|| format!("rename {src} -> {dst}"))?;
        Ok(())
    }

    fn unlink(&self, name: &str) -> Result<()> {
        std::fs::remove_file(self.root.join(name)).with_context(|| format!("unlink {name}"))?;
        Ok(())
    }
}

/// Creates the [`FileSystem`] addressed by `url`.
pub fn from_url(url: &str) -> Result<Arc<dyn FileSystem>> {
    let Some((protocol, param)) = url.split_once("://") else {
        bail!("invalid filesystem url: {url}");
    };
    match protocol {
        "local" => Ok(Arc::new(LocalFs::new(param)?)),
        other => bail!("unsupported filesystem protocol: {other}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_write_read_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let fs = from_url(&format!("local://{}", dir.path().display())).unwrap();

        let mut fh = fs.open("a.txt", Perm::Write).unwrap();
        fh.write_all(b"hello").unwrap();
        drop(fh);

        let mut fh = fs.open("a.txt", Perm::Read).unwrap();
        let mut buf = String::new();
        fh.read_to_string(&mut buf).unwrap();
        assert_eq!(buf, "hello");
    }

    #[test]
    fn rename_publishes_and_unlink_discards() {
        let dir = tempfile::tempdir().unwrap();
        let fs = from_url(&format!("local://{}", dir.path().display())).unwrap();

        fs.open("out.tmp", Perm::Write).unwrap();
        fs.rename("out.tmp", "out").unwrap();
        assert!(dir.path().join("out").exists());
        assert!(!dir.path().join("out.tmp").exists());

        fs.unlink("out").unwrap();
        assert!(!dir.path().join("out").exists());
    }

    #[test]
    fn rejects_unknown_protocol_and_missing_dir() {
        assert!(from_url("s3://bucket").is_err());
        assert!(from_url("local:///definitely/not/here").is_err());
        assert!(from_url("no-scheme").is_err());
    }
}
