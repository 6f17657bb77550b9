use crate::error::StoreError;
use crate::traits::{FileStorage, StoredFile};
use async_trait::async_trait;
use std::io;
use std::path::{Component, Path, PathBuf};
use tokio::fs;
use uuid::Uuid;

/// Stores uploads under `<root>/<owner>/<scope>/<uuid>-<name>`.
#[derive(Debug, Clone)]
pub struct LocalFileStorage {
    root: PathBuf,
}

impl LocalFileStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> Result<PathBuf, StoreError> {
        let candidate = PathBuf::from(path);
        let escapes = candidate
            .components()
            .any(|component| matches!(component, Component::ParentDir));
        if escapes || !candidate.starts_with(&self.root) {
            return Err(StoreError::Io(io::Error::new(
                io::ErrorKind::PermissionDenied,
                format!("path is outside the storage root: {path}"),
            )));
        }
        Ok(candidate)
    }
}

/// Keep letters, digits, dot, dash and underscore; everything else becomes `_`.
pub fn sanitize_file_name(name: &str) -> String {
    let base = Path::new(name)
        .file_name()
        .and_then(|value| value.to_str())
        .unwrap_or("upload");

    let cleaned: String = base
        .chars()
        .map(|ch| {
            if ch.is_alphanumeric() || matches!(ch, '.' | '-' | '_') {
                ch
            } else {
                '_'
            }
        })
        .collect();

    let trimmed = cleaned.trim_matches('.');
    if trimmed.is_empty() {
        "upload".to_string()
    } else {
        trimmed.to_string()
    }
}

#[async_trait]
impl FileStorage for LocalFileStorage {
    async fn store(
        &self,
        owner_id: Uuid,
        scope_id: Uuid,
        bytes: &[u8],
        name: &str,
    ) -> Result<StoredFile, StoreError> {
        let directory = self
            .root
            .join(owner_id.to_string())
            .join(scope_id.to_string());
        fs::create_dir_all(&directory).await?;

        let target = directory.join(format!("{}-{}", Uuid::new_v4(), sanitize_file_name(name)));
        fs::write(&target, bytes).await?;

        Ok(StoredFile {
            path: target.to_string_lossy().to_string(),
            original_name: name.to_string(),
            size_bytes: bytes.len() as u64,
        })
    }

    async fn read(&self, path: &str) -> Result<Vec<u8>, StoreError> {
        let resolved = self.resolve(path)?;
        Ok(fs::read(resolved).await?)
    }

    async fn delete(&self, path: &str) -> Result<(), StoreError> {
        let resolved = self.resolve(path)?;
        match fs::remove_file(resolved).await {
            Ok(()) => Ok(()),
            Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(error) => Err(error.into()),
        }
    }
}
