//! Raster blob storage.
//!
//! Blobs are addressed by a relative, `/`-separated path such as
//! `images/ab/ab12...ef.jpg`. Callers translate I/O failures into the
//! pipeline error that fits their operation (unreadable source, failed
//! write), so the trait stays on `std::io::Result`.

use sha2::{Digest, Sha256};
use std::fs;
use std::io::{self, Write};
use std::path::{Component, Path, PathBuf};

pub trait BlobStore: Send + Sync {
    fn read(&self, path: &str) -> io::Result<Vec<u8>>;

    /// Write the blob, replacing any previous content at `path`.
    fn write(&self, path: &str, data: &[u8]) -> io::Result<()>;

    fn delete(&self, path: &str) -> io::Result<()>;

    fn exists(&self, path: &str) -> io::Result<bool>;
}

/// Content-addressed path for an uploaded raster.
pub fn content_path(data: &[u8], extension: &str) -> String {
    let digest = format!("{:x}", Sha256::digest(data));
    let ext = extension.trim_start_matches('.').to_lowercase();
    format!("images/{}/{}.{}", &digest[..2], digest, ext)
}

/// Short hex tag derived from content, used in generated file names.
pub fn content_tag(data: &[u8]) -> String {
    let digest = format!("{:x}", Sha256::digest(data));
    digest[..8].to_string()
}

/// Filesystem-backed store rooted at a directory.
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Resolve a relative blob path, refusing anything that escapes the root.
    fn resolve(&self, path: &str) -> io::Result<PathBuf> {
        let rel = Path::new(path);
        let escapes = rel
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if path.is_empty() || escapes {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid blob path: {:?}", path),
            ));
        }
        Ok(self.root.join(rel))
    }
}

impl BlobStore for FsBlobStore {
    fn read(&self, path: &str) -> io::Result<Vec<u8>> {
        fs::read(self.resolve(path)?)
    }

    fn write(&self, path: &str, data: &[u8]) -> io::Result<()> {
        let target = self.resolve(path)?;
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }

        // Write beside the target and rename so readers never see a partial file.
        let tmp = target.with_extension("partial");
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(data)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &target).inspect_err(|_| {
            let _ = fs::remove_file(&tmp);
        })
    }

    fn delete(&self, path: &str) -> io::Result<()> {
        match fs::remove_file(self.resolve(path)?) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn exists(&self, path: &str) -> io::Result<bool> {
        Ok(self.resolve(path)?.is_file())
    }
}
