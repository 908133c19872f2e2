//! Local directory backend adapter.
//!
//! Serves objects out of a plain filesystem directory. Writes go to a
//! hidden temp file next to the destination, are fsynced, then renamed so a
//! partial upload is never visible.

use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::io::AsyncWriteExt;
use tracing::debug;

use cloudpool_common::backend::normalize_key;
use cloudpool_common::{BackendAdapter, ObjectDescriptor, ObjectReader, Result, StorageError};

const TEMP_PREFIX: &str = ".cloudpool-upload-";

pub struct DirectoryAdapter {
    name: String,
    base_path: PathBuf,
}

impl DirectoryAdapter {
    pub fn new(name: impl Into<String>, base_path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            base_path: base_path.into(),
        }
    }

    fn full_path(&self, key: &str) -> Result<PathBuf> {
        Ok(self.base_path.join(normalize_key(key)?))
    }

    fn not_found_or_io(&self, key: &str, e: io::Error) -> StorageError {
        if e.kind() == io::ErrorKind::NotFound {
            StorageError::NotFound(key.to_string())
        } else {
            StorageError::Io(e)
        }
    }

    fn descriptor(&self, key: &str, meta: &std::fs::Metadata) -> ObjectDescriptor {
        let modified = meta
            .modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());
        ObjectDescriptor {
            path: key.to_string(),
            size: meta.len(),
            modified,
            backend: self.name.clone(),
        }
    }
}

/// Relative path of `path` under `base` with `/` separators.
fn logical_path(base: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(base).ok()?;
    let parts: Vec<String> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    Some(parts.join("/"))
}

#[async_trait]
impl BackendAdapter for DirectoryAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn upload(
        &self,
        path: &str,
        mut reader: ObjectReader,
        size: Option<u64>,
    ) -> Result<ObjectDescriptor> {
        let dest = self.full_path(path)?;
        let parent = dest.parent().unwrap_or(&self.base_path).to_path_buf();
        tokio::fs::create_dir_all(&parent).await?;

        let tmp_path = parent.join(format!("{}{}", TEMP_PREFIX, uuid::Uuid::new_v4()));
        let result = async {
            let mut file = tokio::fs::File::create(&tmp_path).await?;
            let written = tokio::io::copy(&mut reader, &mut file).await?;
            file.flush().await?;
            file.sync_all().await?;
            Ok::<u64, io::Error>(written)
        }
        .await;

        let written = match result {
            Ok(n) => n,
            Err(e) => {
                let _ = tokio::fs::remove_file(&tmp_path).await;
                return Err(match e.kind() {
                    io::ErrorKind::ConnectionAborted => StorageError::Cancelled,
                    _ => StorageError::Io(e),
                });
            }
        };
        if let Some(expected) = size {
            if expected != written {
                let _ = tokio::fs::remove_file(&tmp_path).await;
                return Err(StorageError::Io(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("expected {} bytes, received {}", expected, written),
                )));
            }
        }

        tokio::fs::rename(&tmp_path, &dest).await?;
        debug!(backend = %self.name, key = %path, size = written, "Directory upload complete");

        let meta = tokio::fs::metadata(&dest).await?;
        Ok(self.descriptor(path, &meta))
    }

    async fn download(&self, path: &str) -> Result<ObjectReader> {
        let src = self.full_path(path)?;
        let file = tokio::fs::File::open(&src)
            .await
            .map_err(|e| self.not_found_or_io(path, e))?;
        if !file.metadata().await?.is_file() {
            return Err(StorageError::NotFound(path.to_string()));
        }
        Ok(Box::new(file))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectDescriptor>> {
        // Walk only the directory part of the prefix, then filter by the rest.
        let dir_part = match prefix.rfind('/') {
            Some(idx) => &prefix[..idx],
            None => "",
        };
        let search_dir = if dir_part.is_empty() {
            self.base_path.clone()
        } else {
            self.base_path.join(normalize_key(dir_part)?)
        };

        let mut objects = Vec::new();
        let mut stack = vec![search_dir];
        while let Some(dir) = stack.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };

            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                let meta = entry.metadata().await?;

                if meta.is_dir() {
                    stack.push(path);
                } else if meta.is_file() {
                    if entry.file_name().to_string_lossy().starts_with(TEMP_PREFIX) {
                        continue;
                    }
                    if let Some(key) = logical_path(&self.base_path, &path) {
                        if key.starts_with(prefix) {
                            objects.push(self.descriptor(&key, &meta));
                        }
                    }
                }
            }
        }

        objects.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(objects)
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let target = self.full_path(path)?;
        tokio::fs::remove_file(&target)
            .await
            .map_err(|e| self.not_found_or_io(path, e))?;
        debug!(backend = %self.name, key = %path, "Directory delete complete");
        Ok(())
    }

    async fn stat(&self, path: &str) -> Result<ObjectDescriptor> {
        let target = self.full_path(path)?;
        let meta = tokio::fs::metadata(&target)
            .await
            .map_err(|e| self.not_found_or_io(path, e))?;
        if !meta.is_file() {
            return Err(StorageError::NotFound(path.to_string()));
        }
        Ok(self.descriptor(path, &meta))
    }

    async fn is_available(&self) -> bool {
        tokio::fs::metadata(&self.base_path)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false)
    }
}
