//! 用户与文件记录的持久化：`UserStore` 抽象及基于 JSON 快照的实现。

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::info;

use crate::atomic::AtomicFile;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("record not found")]
    NotFound,
    #[error("login already exists")]
    Conflict,
    #[error("store backend failure: {0}")]
    Backend(#[from] io::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserRecord {
    pub id: u64,
    pub login: String,
    pub password_hash: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileRecord {
    pub user_id: u64,
    pub name: String,
    pub checksum: String,
    pub size: u64,
}

/// 处理器依赖的持久化操作。
#[async_trait]
pub trait UserStore: Send + Sync {
    async fn lookup_user_by_login(&self, login: &str) -> Result<UserRecord, StoreError>;

    /// 新建用户并返回带有分配 id 的记录；登录名重复时返回 `Conflict`。
    async fn create_user(&self, login: &str, password_hash: &str)
    -> Result<UserRecord, StoreError>;

    /// 记录上传文件；同名文件覆盖旧记录。
    async fn record_file(&self, record: FileRecord) -> Result<(), StoreError>;

    async fn files_by_checksum(
        &self,
        user_id: u64,
        checksum: &str,
    ) -> Result<Vec<FileRecord>, StoreError>;

    /// 删除文件记录；记录不存在时视为成功。
    async fn remove_file(&self, user_id: u64, name: &str) -> Result<(), StoreError>;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StoreState {
    next_id: u64,
    users: Vec<UserRecord>,
    files: Vec<FileRecord>,
}

/// 内存表加可选 JSON 快照文件，每次变更后原子重写快照。
#[derive(Debug)]
pub struct JsonStore {
    state: Mutex<StoreState>,
    path: Option<PathBuf>,
}

impl JsonStore {
    /// 不落盘的空存储。
    #[cfg(test)]
    pub fn in_memory() -> Self {
        Self {
            state: Mutex::new(StoreState::default()),
            path: None,
        }
    }

    /// 从快照文件加载；文件不存在时以空表启动。
    pub async fn open(path: PathBuf) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).await?;
        }
        let state = match fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(io::Error::other)?,
            Err(err) if err.kind() == io::ErrorKind::NotFound => StoreState::default(),
            Err(err) => return Err(err.into()),
        };
        info!(
            path = %path.display(),
            users = state.users.len(),
            files = state.files.len(),
            "user store loaded"
        );
        Ok(Self {
            state: Mutex::new(state),
            path: Some(path),
        })
    }

    /// 在副本上执行变更，快照写入成功后才替换内存状态。
    async fn mutate<T>(
        &self,
        change: impl FnOnce(&mut StoreState) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut state = self.state.lock().await;
        let mut next = state.clone();
        let result = change(&mut next)?;
        if let Some(path) = &self.path {
            persist(path, &next).await?;
        }
        *state = next;
        Ok(result)
    }
}

async fn persist(path: &Path, state: &StoreState) -> Result<(), StoreError> {
    let bytes = serde_json::to_vec_pretty(state).map_err(io::Error::other)?;
    let mut atomic = AtomicFile::new(path).await?;
    if let Err(err) = atomic.file_mut().write_all(&bytes).await {
        atomic.cleanup().await;
        return Err(err.into());
    }
    atomic.finalize().await?;
    Ok(())
}

#[async_trait]
impl UserStore for JsonStore {
    async fn lookup_user_by_login(&self, login: &str) -> Result<UserRecord, StoreError> {
        let state = self.state.lock().await;
        state
            .users
            .iter()
            .find(|user| user.login == login)
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    async fn create_user(
        &self,
        login: &str,
        password_hash: &str,
    ) -> Result<UserRecord, StoreError> {
        self.mutate(|state| {
            if state.users.iter().any(|user| user.login == login) {
                return Err(StoreError::Conflict);
            }
            state.next_id += 1;
            let record = UserRecord {
                id: state.next_id,
                login: login.to_string(),
                password_hash: password_hash.to_string(),
            };
            state.users.push(record.clone());
            Ok(record)
        })
        .await
    }

    async fn record_file(&self, record: FileRecord) -> Result<(), StoreError> {
        self.mutate(|state| {
            state
                .files
                .retain(|file| !(file.user_id == record.user_id && file.name == record.name));
            state.files.push(record);
            Ok(())
        })
        .await
    }

    async fn files_by_checksum(
        &self,
        user_id: u64,
        checksum: &str,
    ) -> Result<Vec<FileRecord>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .files
            .iter()
            .filter(|file| file.user_id == user_id && file.checksum.eq_ignore_ascii_case(checksum))
            .cloned()
            .collect())
    }

    async fn remove_file(&self, user_id: u64, name: &str) -> Result<(), StoreError> {
        self.mutate(|state| {
            state
                .files
                .retain(|file| !(file.user_id == user_id && file.name == name));
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn file(user_id: u64, name: &str, checksum: &str) -> FileRecord {
        FileRecord {
            user_id,
            name: name.to_string(),
            checksum: checksum.to_string(),
            size: 3,
        }
    }

    #[tokio::test]
    async fn create_assigns_increasing_ids_and_rejects_duplicates() {
        let store = JsonStore::in_memory();
        let alice = store.create_user("alice", "h1").await.unwrap();
        let bob = store.create_user("bob", "h2").await.unwrap();
        assert!(bob.id > alice.id);
        assert!(matches!(
            store.create_user("alice", "h3").await,
            Err(StoreError::Conflict)
        ));
        let found = store.lookup_user_by_login("alice").await.unwrap();
        assert_eq!(found, alice);
        assert!(matches!(
            store.lookup_user_by_login("carol").await,
            Err(StoreError::NotFound)
        ));
    }

    #[tokio::test]
    async fn file_records_are_scoped_per_user() {
        let store = JsonStore::in_memory();
        store.record_file(file(1, "a.txt", "abc")).await.unwrap();
        store.record_file(file(1, "b.txt", "abc")).await.unwrap();
        store.record_file(file(2, "a.txt", "abc")).await.unwrap();
        store.record_file(file(1, "a.txt", "def")).await.unwrap();

        let matches = store.files_by_checksum(1, "ABC").await.unwrap();
        assert_eq!(matches, vec![file(1, "b.txt", "abc")]);

        store.remove_file(1, "b.txt").await.unwrap();
        assert!(store.files_by_checksum(1, "abc").await.unwrap().is_empty());
        assert_eq!(store.files_by_checksum(2, "abc").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn snapshot_survives_reopen() {
        let temp = tempdir().expect("tempdir");
        let path = temp.path().join("db").join("users.json");
        {
            let store = JsonStore::open(path.clone()).await.unwrap();
            store.create_user("alice", "hash").await.unwrap();
            store.record_file(file(1, "r.pdf", "ff")).await.unwrap();
        }
        let store = JsonStore::open(path).await.unwrap();
        let alice = store.lookup_user_by_login("alice").await.unwrap();
        assert_eq!(alice.id, 1);
        let bob = store.create_user("bob", "hash").await.unwrap();
        assert_eq!(bob.id, 2);
        assert_eq!(store.files_by_checksum(1, "ff").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn corrupt_snapshot_is_a_backend_error() {
        let temp = tempdir().expect("tempdir");
        let path = temp.path().join("users.json");
        std::fs::write(&path, b"{not json").expect("write");
        assert!(matches!(
            JsonStore::open(path).await,
            Err(StoreError::Backend(_))
        ));
    }
}
