//! 按用户划分目录的本地文件存储。

use sha2::{Digest, Sha256};
use std::io;
use std::path::{Component, Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio::fs;
use tokio::io::{AsyncWriteExt, ErrorKind};
use tracing::{info, warn};

use crate::atomic::{AtomicFile, TEMP_PREFIX};

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("invalid path")]
    InvalidPath,
    #[error("{0}")]
    InvalidName(&'static str),
    #[error("file size exceeds limit")]
    TooLarge,
    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(Clone, Debug)]
pub struct Storage {
    root: PathBuf,
    max_file_size: u64,
}

impl Storage {
    /// `max_file_size` 为 0 表示不限制单个文件大小。
    pub fn new(root: PathBuf, max_file_size: u64) -> Self {
        Self {
            root,
            max_file_size,
        }
    }

    pub async fn ensure_root(&self) -> io::Result<()> {
        fs::create_dir_all(&self.root).await
    }

    pub fn root_path(&self) -> &Path {
        &self.root
    }

    pub fn user_dir(&self, user_id: u64) -> PathBuf {
        self.root.join(user_id.to_string())
    }

    /// 创建用户目录（已存在时不报错）。
    pub async fn ensure_user_dir(&self, user_id: u64) -> Result<PathBuf, StorageError> {
        let dir = self.user_dir(user_id);
        fs::create_dir_all(&dir).await?;
        self.ensure_no_symlink_components(&dir, false).await?;
        Ok(dir)
    }

    async fn resolve_file(
        &self,
        user_id: u64,
        name: &str,
        allow_missing_leaf: bool,
    ) -> Result<PathBuf, StorageError> {
        let name = validate_name(name)?;
        let target = self.user_dir(user_id).join(name);
        self.ensure_no_symlink_components(&target, allow_missing_leaf)
            .await?;
        Ok(target)
    }

    async fn ensure_no_symlink_components(
        &self,
        target: &Path,
        allow_missing_leaf: bool,
    ) -> Result<(), StorageError> {
        let relative = target
            .strip_prefix(&self.root)
            .map_err(|_| StorageError::InvalidPath)?;
        let mut current = PathBuf::from(&self.root);
        let mut components = relative.components().peekable();

        while let Some(component) = components.next() {
            current.push(component.as_os_str());
            match fs::symlink_metadata(&current).await {
                Ok(metadata) => {
                    if metadata.file_type().is_symlink() {
                        return Err(StorageError::InvalidPath);
                    }
                    if components.peek().is_some() && !metadata.is_dir() {
                        return Err(StorageError::InvalidPath);
                    }
                }
                Err(err) if err.kind() == ErrorKind::NotFound && allow_missing_leaf => {
                    return Ok(());
                }
                Err(err) => return Err(StorageError::Io(err)),
            }
        }

        Ok(())
    }

    /// 列出用户目录下的可见普通文件，目录不存在时先创建。
    pub async fn list_files(&self, user_id: u64) -> Result<Vec<String>, StorageError> {
        let dir = self.ensure_user_dir(user_id).await?;
        let mut entries = fs::read_dir(&dir).await?;
        let mut names = Vec::new();

        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with('.') {
                continue;
            }
            if entry.file_type().await?.is_file() {
                names.push(name);
            }
        }

        names.sort_by_key(|name| name.to_lowercase());
        Ok(names)
    }

    /// 在用户目录内创建暂存文件，提交前对外不可见。
    pub async fn stage(&self, user_id: u64, name: &str) -> Result<StagedFile, StorageError> {
        self.ensure_user_dir(user_id).await?;
        let target = self.resolve_file(user_id, name, true).await?;
        let atomic = AtomicFile::new(&target).await?;
        Ok(StagedFile {
            name: name.to_string(),
            atomic,
            hasher: Sha256::new(),
            size: 0,
            max_size: self.max_file_size,
        })
    }

    pub async fn delete_file(&self, user_id: u64, name: &str) -> Result<(), StorageError> {
        let target = self.resolve_file(user_id, name, false).await?;
        fs::remove_file(target).await?;
        Ok(())
    }

    /// 清理各用户目录中超过 `max_age` 的暂存文件，返回删除数量。
    pub async fn sweep_stale_temps(&self, max_age: Duration) -> io::Result<usize> {
        let mut users = match fs::read_dir(&self.root).await {
            Ok(dir) => dir,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(0),
            Err(err) => return Err(err),
        };

        let now = SystemTime::now();
        let mut removed = 0;
        while let Some(user_dir) = users.next_entry().await? {
            if !user_dir.file_type().await?.is_dir() {
                continue;
            }
            let mut entries = fs::read_dir(user_dir.path()).await?;
            while let Some(entry) = entries.next_entry().await? {
                if !entry.file_name().to_string_lossy().starts_with(TEMP_PREFIX) {
                    continue;
                }
                let metadata = entry.metadata().await?;
                if !metadata.is_file() {
                    continue;
                }
                let age = match metadata.modified().map(|modified| now.duration_since(modified)) {
                    Ok(Ok(age)) => age,
                    _ => continue,
                };
                if age < max_age {
                    continue;
                }
                let path = entry.path();
                match fs::remove_file(&path).await {
                    Ok(()) => {
                        info!(path = ?path, "removed stale upload temp file");
                        removed += 1;
                    }
                    Err(err) => {
                        warn!(path = ?path, error = %err, "failed to remove stale upload temp file")
                    }
                }
            }
        }
        Ok(removed)
    }
}

/// 文件名必须是单个普通路径段。
fn validate_name(name: &str) -> Result<&str, StorageError> {
    if name.trim().is_empty() {
        return Err(StorageError::InvalidName("file name is required"));
    }
    if name.contains(['/', '\\', '\0']) {
        return Err(StorageError::InvalidPath);
    }
    let mut components = Path::new(name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => {}
        _ => return Err(StorageError::InvalidPath),
    }
    if name.starts_with('.') {
        return Err(StorageError::InvalidName("hidden file names are not allowed"));
    }
    Ok(name)
}

/// 写入中的上传文件：边写边计算 SHA-256。
pub struct StagedFile {
    name: String,
    atomic: AtomicFile,
    hasher: Sha256,
    size: u64,
    max_size: u64,
}

/// 已提交文件的摘要信息。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredFile {
    pub name: String,
    pub checksum: String,
    pub size: u64,
}

impl StagedFile {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn write(&mut self, chunk: &[u8]) -> Result<(), StorageError> {
        self.size += chunk.len() as u64;
        if self.max_size > 0 && self.size > self.max_size {
            return Err(StorageError::TooLarge);
        }
        self.hasher.update(chunk);
        self.atomic.file_mut().write_all(chunk).await?;
        Ok(())
    }

    /// 原子替换目标文件并返回摘要。
    pub async fn commit(self) -> Result<StoredFile, StorageError> {
        let checksum = hex::encode(self.hasher.finalize());
        self.atomic.finalize().await?;
        Ok(StoredFile {
            name: self.name,
            checksum,
            size: self.size,
        })
    }

    pub async fn discard(self) {
        self.atomic.cleanup().await;
    }
}
