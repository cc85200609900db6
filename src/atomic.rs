//! 临时写入与原子替换的辅助方法。

use std::io;
use std::path::{Path, PathBuf};
use tokio::fs::{self, File};
use uuid::Uuid;

/// 临时文件名前缀；列目录时据此跳过未完成的写入。
pub const TEMP_PREFIX: &str = ".axo-tmp.";

/// 可用于原子替换的临时文件封装。
///
/// 未调用 [`AtomicFile::finalize`] 就被丢弃时（包括所在 future 被取消），
/// 临时文件会被同步删除。
#[derive(Debug)]
pub struct AtomicFile {
    target: PathBuf,
    file: File,
    guard: TempGuard,
}

/// 持有临时文件路径，析构时删除该文件。
#[derive(Debug)]
struct TempGuard {
    path: PathBuf,
    armed: bool,
}

impl TempGuard {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for TempGuard {
    fn drop(&mut self) {
        if self.armed {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

impl AtomicFile {
    /// 在目标路径同目录创建临时文件。
    pub async fn new(target: &Path) -> io::Result<Self> {
        let parent = target
            .parent()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "invalid target path"))?;
        let temp_path = parent.join(format!("{TEMP_PREFIX}{}", Uuid::new_v4()));
        let file = File::create(&temp_path).await?;
        Ok(Self {
            target: target.to_path_buf(),
            file,
            guard: TempGuard {
                path: temp_path,
                armed: true,
            },
        })
    }

    /// 返回临时文件的可写句柄。
    pub fn file_mut(&mut self) -> &mut File {
        &mut self.file
    }

    /// 放弃并清理临时文件。
    pub async fn cleanup(self) {
        let Self { file, mut guard, .. } = self;
        drop(file);
        guard.disarm();
        let _ = fs::remove_file(&guard.path).await;
    }

    /// 同步并原子替换目标文件。
    pub async fn finalize(self) -> io::Result<()> {
        let Self {
            target,
            file,
            mut guard,
        } = self;
        file.sync_all().await?;
        drop(file);

        if let Err(err) = fs::rename(&guard.path, &target).await {
            #[cfg(windows)]
            {
                if fs::remove_file(&target).await.is_ok() {
                    fs::rename(&guard.path, &target).await?;
                } else {
                    return Err(err);
                }
            }
            #[cfg(not(windows))]
            {
                return Err(err);
            }
        }
        guard.disarm();

        if let Some(parent) = target.parent() {
            let _ = sync_dir(parent).await;
        }

        Ok(())
    }
}

async fn sync_dir(path: &Path) -> io::Result<()> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let dir = std::fs::File::open(path)?;
        dir.sync_all()
    })
    .await
    .map_err(|err| io::Error::other(err.to_string()))?
}
