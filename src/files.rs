//! 文件上传、列表与删除处理器。
//!
//! 每个请求只访问调用者自己的目录，用户 id 来自已校验的 [`Principal`]。

use axum::extract::multipart::{Multipart, MultipartRejection};
use axum::extract::rejection::JsonRejection;
use axum::extract::{Extension, Json};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::auth::Principal;
use crate::config::UploadPolicy;
use crate::error::{ApiError, ErrorKind};
use crate::response::{ApiResult, Reply};
use crate::storage::{StagedFile, Storage, StorageError};
use crate::store::{FileRecord, UserStore};

/// 上传表单中承载文件的字段名。
const FILE_FIELD: &str = "file";

#[derive(Debug, Clone, Copy)]
pub struct UploadConfig {
    pub policy: UploadPolicy,
    /// 孤立暂存文件的保留时间，为 0 时不清理。
    pub temp_ttl: Duration,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct FileListing {
    pub userid: String,
    pub files: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct DeleteRequest {
    #[serde(default)]
    files: Option<Vec<String>>,
    #[serde(default)]
    checksum: Option<String>,
}

/// 接收多文件上传。全部字段读完之后才决定提交哪些文件。
pub async fn upload_files(
    principal: Principal,
    Extension(storage): Extension<Arc<Storage>>,
    Extension(store): Extension<Arc<dyn UserStore>>,
    Extension(config): Extension<Arc<UploadConfig>>,
    multipart: Result<Multipart, MultipartRejection>,
) -> ApiResult<&'static str> {
    let mut multipart = multipart.map_err(|rejection| {
        ApiError::classify(ErrorKind::BadRequest, rejection)
            .with_message("malformed multipart body")
            .with_sender("files.upload")
    })?;

    let mut received = Vec::new();
    if let Err(err) =
        receive_files(&storage, principal.user_id, &mut multipart, &mut received).await
    {
        match config.policy {
            UploadPolicy::Atomic => {
                warn!(
                    user_id = principal.user_id,
                    discarded = received.len(),
                    "upload failed, discarding batch"
                );
                discard_all(received).await;
            }
            UploadPolicy::BestEffort => {
                let kept = received.len();
                if let Err(commit_err) =
                    commit_all(store.as_ref(), principal.user_id, received).await
                {
                    warn!(
                        user_id = principal.user_id,
                        error = %commit_err,
                        "failed to keep files received before upload error"
                    );
                } else {
                    warn!(
                        user_id = principal.user_id,
                        kept, "upload failed, keeping files received so far"
                    );
                }
            }
        }
        return Err(err.with_sender("files.upload"));
    }

    if received.is_empty() {
        return Err(ApiError::bad_request("no file in upload").with_sender("files.upload"));
    }

    let count = received.len();
    commit_all(store.as_ref(), principal.user_id, received)
        .await
        .map_err(|err| err.with_sender("files.upload"))?;
    info!(login = %principal.login, user_id = principal.user_id, count, "files uploaded");
    Ok(Reply::ok("OK"))
}

/// 逐个读取 `file` 字段并写入暂存文件；出错时当前字段的暂存文件会被清理。
async fn receive_files(
    storage: &Storage,
    user_id: u64,
    multipart: &mut Multipart,
    received: &mut Vec<StagedFile>,
) -> Result<(), ApiError> {
    while let Some(mut field) = multipart
        .next_field()
        .await
        .map_err(|err| ApiError::classify(ErrorKind::BadRequest, err))?
    {
        if field.name() != Some(FILE_FIELD) {
            continue;
        }
        let name = field
            .file_name()
            .map(str::to_string)
            .ok_or_else(|| ApiError::bad_request("file field without file name"))?;

        let mut staged = storage.stage(user_id, &name).await?;
        loop {
            let chunk = match field.chunk().await {
                Ok(Some(chunk)) => chunk,
                Ok(None) => break,
                Err(err) => {
                    staged.discard().await;
                    return Err(ApiError::classify(ErrorKind::BadRequest, err));
                }
            };
            if let Err(err) = staged.write(&chunk).await {
                staged.discard().await;
                return Err(err.into());
            }
        }
        debug!(user_id, name = staged.name(), "upload field received");
        received.push(staged);
    }
    Ok(())
}

async fn discard_all(staged: Vec<StagedFile>) {
    for file in staged {
        file.discard().await;
    }
}

/// 依次提交暂存文件并写入文件记录；失败时丢弃尚未提交的部分。
async fn commit_all(
    store: &dyn UserStore,
    user_id: u64,
    staged: Vec<StagedFile>,
) -> Result<(), ApiError> {
    let mut pending = staged.into_iter();
    while let Some(file) = pending.next() {
        let stored = match file.commit().await {
            Ok(stored) => stored,
            Err(err) => {
                discard_all(pending.collect()).await;
                return Err(err.into());
            }
        };
        let recorded = store
            .record_file(FileRecord {
                user_id,
                name: stored.name,
                checksum: stored.checksum,
                size: stored.size,
            })
            .await;
        if let Err(err) = recorded {
            discard_all(pending.collect()).await;
            return Err(err.into());
        }
    }
    Ok(())
}

/// 列出调用者目录中的文件。
pub async fn list_files(
    principal: Principal,
    Extension(storage): Extension<Arc<Storage>>,
) -> ApiResult<FileListing> {
    let files = storage
        .list_files(principal.user_id)
        .await
        .map_err(|err| ApiError::from(err).with_sender("files.list"))?;
    debug!(user_id = principal.user_id, count = files.len(), "list files");
    Ok(Reply::ok(FileListing {
        userid: principal.user_id.to_string(),
        files,
    }))
}

/// 按文件名或校验和删除文件，二者必须且只能给出一个。
pub async fn delete_files(
    principal: Principal,
    Extension(storage): Extension<Arc<Storage>>,
    Extension(store): Extension<Arc<dyn UserStore>>,
    payload: Result<Json<DeleteRequest>, JsonRejection>,
) -> ApiResult<&'static str> {
    let Json(request) = payload.map_err(|rejection| {
        ApiError::classify(ErrorKind::BadRequest, rejection)
            .with_message("malformed delete request")
            .with_sender("files.delete")
    })?;

    let deleted = match (request.files, request.checksum) {
        (Some(files), None) if !files.is_empty() => {
            delete_by_name(&storage, store.as_ref(), principal.user_id, &files).await
        }
        (None, Some(checksum)) if !checksum.trim().is_empty() => {
            delete_by_checksum(&storage, store.as_ref(), principal.user_id, checksum.trim()).await
        }
        _ => Err(ApiError::bad_request(
            "either files or checksum must be given",
        )),
    }
    .map_err(|err| err.with_sender("files.delete"))?;

    info!(login = %principal.login, user_id = principal.user_id, deleted, "files deleted");
    Ok(Reply::ok("OK"))
}

async fn delete_by_name(
    storage: &Storage,
    store: &dyn UserStore,
    user_id: u64,
    names: &[String],
) -> Result<usize, ApiError> {
    for name in names {
        storage.delete_file(user_id, name).await?;
        store.remove_file(user_id, name).await?;
    }
    Ok(names.len())
}

async fn delete_by_checksum(
    storage: &Storage,
    store: &dyn UserStore,
    user_id: u64,
    checksum: &str,
) -> Result<usize, ApiError> {
    let records = store.files_by_checksum(user_id, checksum).await?;
    if records.is_empty() {
        return Err(ApiError::not_found("no file with that checksum"));
    }
    for record in &records {
        match storage.delete_file(user_id, &record.name).await {
            Ok(()) => {}
            // 记录存在但文件已不在磁盘上：只清理记录。
            Err(StorageError::Io(err)) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!(user_id, name = %record.name, "stale file record");
            }
            Err(err) => return Err(err.into()),
        }
        store.remove_file(user_id, &record.name).await?;
    }
    Ok(records.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{JsonStore, StoreError, UserRecord};
    use async_trait::async_trait;
    use tempfile::tempdir;

    /// 用户查询正常，但写文件记录总是失败。
    struct RecordFailsStore;

    #[async_trait]
    impl UserStore for RecordFailsStore {
        async fn lookup_user_by_login(&self, _login: &str) -> Result<UserRecord, StoreError> {
            Err(StoreError::NotFound)
        }

        async fn create_user(&self, _login: &str, _hash: &str) -> Result<UserRecord, StoreError> {
            Err(StoreError::Conflict)
        }

        async fn record_file(&self, _record: FileRecord) -> Result<(), StoreError> {
            Err(StoreError::Backend(std::io::Error::other("disk full")))
        }

        async fn files_by_checksum(
            &self,
            _user_id: u64,
            _checksum: &str,
        ) -> Result<Vec<FileRecord>, StoreError> {
            Ok(Vec::new())
        }

        async fn remove_file(&self, _user_id: u64, _name: &str) -> Result<(), StoreError> {
            Ok(())
        }
    }

    struct Fixture {
        _temp: tempfile::TempDir,
        storage: Arc<Storage>,
        store: Arc<dyn UserStore>,
        principal: Principal,
    }

    async fn fixture() -> Fixture {
        let temp = tempdir().expect("tempdir");
        let storage = Arc::new(Storage::new(temp.path().join("storage"), 0));
        storage.ensure_root().await.unwrap();
        let store = JsonStore::in_memory();
        let user = store.create_user("alice", "hash").await.unwrap();
        Fixture {
            _temp: temp,
            storage,
            store: Arc::new(store),
            principal: Principal {
                login: user.login,
                user_id: user.id,
            },
        }
    }

    async fn put_file(fixture: &Fixture, name: &str, contents: &[u8]) {
        let mut staged = fixture
            .storage
            .stage(fixture.principal.user_id, name)
            .await
            .unwrap();
        staged.write(contents).await.unwrap();
        commit_all(
            fixture.store.as_ref(),
            fixture.principal.user_id,
            vec![staged],
        )
        .await
        .unwrap();
    }

    async fn delete(fixture: &Fixture, request: DeleteRequest) -> ApiResult<&'static str> {
        delete_files(
            fixture.principal.clone(),
            Extension(fixture.storage.clone()),
            Extension(fixture.store.clone()),
            Ok(Json(request)),
        )
        .await
    }

    #[tokio::test]
    async fn committed_files_are_recorded_with_checksum() {
        let fixture = fixture().await;
        put_file(&fixture, "a.txt", b"abc").await;
        let records = fixture
            .store
            .files_by_checksum(
                1,
                "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad",
            )
            .await
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].name, "a.txt");
        assert_eq!(records[0].size, 3);
    }

    #[tokio::test]
    async fn record_failure_discards_remaining_staged_files() {
        let fixture = fixture().await;
        let mut staged = Vec::new();
        for name in ["a.txt", "b.txt", "c.txt"] {
            let mut file = fixture.storage.stage(1, name).await.unwrap();
            file.write(b"abc").await.unwrap();
            staged.push(file);
        }

        let err = commit_all(&RecordFailsStore, 1, staged).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InternalServerError);

        let names: Vec<_> = std::fs::read_dir(fixture.storage.user_dir(1))
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["a.txt"]);
    }

    #[tokio::test]
    async fn delete_by_name_removes_file_and_record() {
        let fixture = fixture().await;
        put_file(&fixture, "a.txt", b"abc").await;
        delete(
            &fixture,
            DeleteRequest {
                files: Some(vec!["a.txt".to_string()]),
                checksum: None,
            },
        )
        .await
        .unwrap();
        assert!(fixture.storage.list_files(1).await.unwrap().is_empty());

        let err = delete(
            &fixture,
            DeleteRequest {
                files: Some(vec!["a.txt".to_string()]),
                checksum: None,
            },
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn delete_by_checksum_removes_every_match() {
        let fixture = fixture().await;
        put_file(&fixture, "a.txt", b"same").await;
        put_file(&fixture, "b.txt", b"same").await;
        put_file(&fixture, "c.txt", b"other").await;
        let checksum = fixture
            .store
            .files_by_checksum(1, &hex::encode(<sha2::Sha256 as sha2::Digest>::digest(b"same")))
            .await
            .unwrap()[0]
            .checksum
            .clone();

        delete(
            &fixture,
            DeleteRequest {
                files: None,
                checksum: Some(checksum.to_uppercase()),
            },
        )
        .await
        .unwrap();
        assert_eq!(fixture.storage.list_files(1).await.unwrap(), vec!["c.txt"]);

        let err = delete(
            &fixture,
            DeleteRequest {
                files: None,
                checksum: Some(checksum),
            },
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn delete_requires_exactly_one_selector() {
        let fixture = fixture().await;
        let cases = [
            DeleteRequest::default(),
            DeleteRequest {
                files: Some(Vec::new()),
                checksum: None,
            },
            DeleteRequest {
                files: Some(vec!["a.txt".to_string()]),
                checksum: Some("abc".to_string()),
            },
        ];
        for request in cases {
            let err = delete(&fixture, request).await.unwrap_err();
            assert_eq!(err.kind(), ErrorKind::BadRequest);
        }
    }

    #[tokio::test]
    async fn delete_rejects_traversal() {
        let fixture = fixture().await;
        let err = delete(
            &fixture,
            DeleteRequest {
                files: Some(vec!["../2/secret.txt".to_string()]),
                checksum: None,
            },
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Forbidden);
    }

    #[tokio::test]
    async fn listing_reports_user_id_as_string() {
        let fixture = fixture().await;
        put_file(&fixture, "report.pdf", b"%PDF").await;
        let reply = list_files(fixture.principal.clone(), Extension(fixture.storage.clone()))
            .await
            .unwrap();
        let response = axum::response::IntoResponse::into_response(reply);
        let bytes = http_body_util::BodyExt::collect(response.into_body())
            .await
            .unwrap()
            .to_bytes();
        let listing: FileListing = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(listing.userid, "1");
        assert_eq!(listing.files, vec!["report.pdf"]);
    }
}
