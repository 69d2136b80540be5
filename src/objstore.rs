//! Object-store seam.
//!
//! The platform's large artifacts (scan binaries, manifests, worker output,
//! quantification results) live in buckets behind this trait. Production
//! deployments bind it to a cloud store; the filesystem implementation
//! below backs local runs and tests. Absent objects surface as a
//! distinguished `NotFound` so callers can map them to a 404-class error
//! instead of a backend failure.

use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("object not found: {bucket}/{path}")]
    NotFound { bucket: String, path: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub trait ObjectStore: Send + Sync {
    fn read(&self, bucket: &str, path: &str) -> Result<Vec<u8>, StoreError>;
    fn write(&self, bucket: &str, path: &str, data: &[u8]) -> Result<(), StoreError>;
    fn delete(&self, bucket: &str, path: &str) -> Result<(), StoreError>;
    /// List object paths under a prefix, relative to the bucket root.
    fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<String>, StoreError>;
    /// Server-side copy between buckets.
    fn copy(
        &self,
        src_bucket: &str,
        src_path: &str,
        dst_bucket: &str,
        dst_path: &str,
    ) -> Result<(), StoreError>;
}

/// Filesystem-backed store: `<root>/<bucket>/<path>`.
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        FsObjectStore { root: root.into() }
    }

    fn full_path(&self, bucket: &str, path: &str) -> PathBuf {
        self.root.join(bucket).join(path)
    }

    fn collect(dir: &Path, base: &Path, out: &mut Vec<String>) -> std::io::Result<()> {
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let p = entry.path();
            if p.is_dir() {
                Self::collect(&p, base, out)?;
            } else if let Ok(rel) = p.strip_prefix(base) {
                out.push(rel.to_string_lossy().replace('\\', "/"));
            }
        }
        Ok(())
    }
}

impl ObjectStore for FsObjectStore {
    fn read(&self, bucket: &str, path: &str) -> Result<Vec<u8>, StoreError> {
        match fs::read(self.full_path(bucket, path)) {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(StoreError::NotFound {
                bucket: bucket.to_string(),
                path: path.to_string(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    fn write(&self, bucket: &str, path: &str, data: &[u8]) -> Result<(), StoreError> {
        let full = self.full_path(bucket, path);
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(full, data)?;
        Ok(())
    }

    fn delete(&self, bucket: &str, path: &str) -> Result<(), StoreError> {
        match fs::remove_file(self.full_path(bucket, path)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(StoreError::NotFound {
                bucket: bucket.to_string(),
                path: path.to_string(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<String>, StoreError> {
        let base = self.root.join(bucket);
        if !base.exists() {
            return Ok(Vec::new());
        }
        let mut all = Vec::new();
        Self::collect(&base, &base, &mut all)?;
        all.retain(|p| p.starts_with(prefix));
        all.sort();
        Ok(all)
    }

    fn copy(
        &self,
        src_bucket: &str,
        src_path: &str,
        dst_bucket: &str,
        dst_path: &str,
    ) -> Result<(), StoreError> {
        let data = self.read(src_bucket, src_path)?;
        self.write(dst_bucket, dst_path, &data)
    }
}
