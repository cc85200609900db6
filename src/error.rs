//! 统一的错误分类、状态码映射与错误响应渲染。

use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use std::borrow::Cow;
use std::error::Error as StdError;
use std::io::ErrorKind as IoErrorKind;
use tracing::{debug, error, warn};

use crate::password::PasswordError;
use crate::response;
use crate::storage::StorageError;
use crate::store::StoreError;

type Cause = Box<dyn StdError + Send + Sync + 'static>;

/// 失败种类的封闭集合；状态码与错误码都只由种类决定。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    BadRequest,
    Unauthorized,
    Forbidden,
    NotFound,
    Conflict,
    TooManyRequests,
    InternalServerError,
    Timeout,
    /// 最外层捕获到的 panic，属于“不应发生”的故障。
    SystemError,
}

impl ErrorKind {
    #[cfg(test)]
    pub const ALL: [ErrorKind; 9] = [
        ErrorKind::BadRequest,
        ErrorKind::Unauthorized,
        ErrorKind::Forbidden,
        ErrorKind::NotFound,
        ErrorKind::Conflict,
        ErrorKind::TooManyRequests,
        ErrorKind::InternalServerError,
        ErrorKind::Timeout,
        ErrorKind::SystemError,
    ];

    /// 种类对应的 HTTP 状态码。
    pub const fn status(self) -> StatusCode {
        match self {
            ErrorKind::BadRequest => StatusCode::BAD_REQUEST,
            ErrorKind::Unauthorized => StatusCode::UNAUTHORIZED,
            ErrorKind::Forbidden => StatusCode::FORBIDDEN,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Conflict => StatusCode::CONFLICT,
            ErrorKind::TooManyRequests => StatusCode::TOO_MANY_REQUESTS,
            ErrorKind::InternalServerError => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
            ErrorKind::SystemError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// 稳定的机器可读错误码。
    pub const fn code(self) -> &'static str {
        match self {
            ErrorKind::BadRequest => "REQ-001",
            ErrorKind::Unauthorized => "AUTH-001",
            ErrorKind::Forbidden => "AUTH-002",
            ErrorKind::NotFound => "RES-001",
            ErrorKind::Conflict => "RES-002",
            ErrorKind::TooManyRequests => "REQ-002",
            ErrorKind::InternalServerError => "SYS-001",
            ErrorKind::Timeout => "SYS-002",
            ErrorKind::SystemError => "SYS-999",
        }
    }

    /// 未指定时对外展示的默认文案。
    pub const fn public_message(self) -> &'static str {
        match self {
            ErrorKind::BadRequest => "Bad Request",
            ErrorKind::Unauthorized => "Unauthorized",
            ErrorKind::Forbidden => "Forbidden",
            ErrorKind::NotFound => "Not Found",
            ErrorKind::Conflict => "Conflict",
            ErrorKind::TooManyRequests => "Too Many Requests",
            ErrorKind::InternalServerError => "Internal Server Error",
            ErrorKind::Timeout => "Request Timeout",
            ErrorKind::SystemError => "System Error",
        }
    }
}

/// 已分类的 API 错误：对外只暴露种类与公开文案，内部原因仅写入日志。
#[derive(Debug, thiserror::Error)]
#[error("{}: {message}", .kind.code())]
pub struct ApiError {
    kind: ErrorKind,
    message: Cow<'static, str>,
    #[source]
    cause: Option<Cause>,
    sender: &'static str,
    retry_after: Option<u64>,
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    status: u16,
    code: &'static str,
    message: &'a str,
}

impl ApiError {
    pub fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            message: Cow::Borrowed(kind.public_message()),
            cause: None,
            sender: "-",
            retry_after: None,
        }
    }

    /// 包装任意内部错误，保留原始错误供日志使用。
    pub fn classify<E>(kind: ErrorKind, err: E) -> Self
    where
        E: Into<Cause>,
    {
        Self {
            cause: Some(err.into()),
            ..Self::new(kind)
        }
    }

    pub fn bad_request(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorKind::BadRequest).with_message(message)
    }

    pub fn unauthorized() -> Self {
        Self::new(ErrorKind::Unauthorized)
    }

    pub fn forbidden(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorKind::Forbidden).with_message(message)
    }

    pub fn not_found(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorKind::NotFound).with_message(message)
    }

    pub fn conflict(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorKind::Conflict).with_message(message)
    }

    pub fn too_many_requests(retry_after: u64) -> Self {
        Self {
            retry_after: Some(retry_after),
            ..Self::new(ErrorKind::TooManyRequests)
        }
    }

    pub fn internal<E>(err: E) -> Self
    where
        E: Into<Cause>,
    {
        Self::classify(ErrorKind::InternalServerError, err)
    }

    pub fn timeout() -> Self {
        Self::new(ErrorKind::Timeout)
    }

    pub fn system(detail: impl Into<String>) -> Self {
        Self::classify(ErrorKind::SystemError, detail.into())
    }

    pub fn with_message(mut self, message: impl Into<Cow<'static, str>>) -> Self {
        self.message = message.into();
        self
    }

    /// 标记产生错误的操作，便于日志追踪。
    pub fn with_sender(mut self, sender: &'static str) -> Self {
        self.sender = sender;
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    #[cfg(test)]
    pub fn message(&self) -> &str {
        &self.message
    }

    fn log(&self) {
        let code = self.kind.code();
        let cause = self.cause.as_deref().map(|cause| render_cause_chain(cause));
        let cause = cause.as_deref().unwrap_or("-");
        match self.kind {
            ErrorKind::SystemError => {
                error!(sender = self.sender, code, system = true, cause, "unexpected failure")
            }
            ErrorKind::InternalServerError | ErrorKind::Timeout => {
                error!(sender = self.sender, code, cause, "request failed")
            }
            ErrorKind::Unauthorized | ErrorKind::Forbidden | ErrorKind::TooManyRequests => {
                warn!(sender = self.sender, code, cause, message = %self.message, "request rejected")
            }
            _ => debug!(sender = self.sender, code, cause, message = %self.message, "request rejected"),
        }
    }
}

fn render_cause_chain(err: &(dyn StdError + 'static)) -> String {
    let mut rendered = err.to_string();
    let mut source = err.source();
    while let Some(inner) = source {
        rendered.push_str(": ");
        rendered.push_str(&inner.to_string());
        source = inner.source();
    }
    rendered
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        self.log();
        let status = self.kind.status();
        let body = ErrorBody {
            status: status.as_u16(),
            code: self.kind.code(),
            message: &self.message,
        };
        let mut response = response::send(status, &body);
        if let Some(retry_after) = self.retry_after.filter(|value| *value > 0)
            && let Ok(value) = HeaderValue::from_str(&retry_after.to_string())
        {
            response.headers_mut().insert(header::RETRY_AFTER, value);
        }
        response
    }
}

impl From<StorageError> for ApiError {
    fn from(error: StorageError) -> Self {
        match error {
            StorageError::InvalidPath => ApiError::forbidden("invalid path").with_sender("storage"),
            StorageError::InvalidName(reason) => {
                ApiError::bad_request(reason).with_sender("storage")
            }
            StorageError::TooLarge => {
                ApiError::bad_request("file size exceeds limit").with_sender("storage")
            }
            StorageError::Io(err) if err.kind() == IoErrorKind::NotFound => {
                ApiError::classify(ErrorKind::NotFound, err).with_sender("storage")
            }
            StorageError::Io(err) => ApiError::internal(err).with_sender("storage"),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::NotFound => ApiError::not_found("Not Found").with_sender("store"),
            StoreError::Conflict => ApiError::conflict("login already taken").with_sender("store"),
            err @ StoreError::Backend(_) => ApiError::internal(err).with_sender("store"),
        }
    }
}

impl From<PasswordError> for ApiError {
    fn from(error: PasswordError) -> Self {
        match error {
            PasswordError::Mismatch => ApiError::unauthorized().with_sender("password"),
            err @ PasswordError::Hashing(_) => ApiError::internal(err).with_sender("password"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;
    use std::collections::HashSet;

    #[test]
    fn status_is_fixed_per_kind() {
        for kind in ErrorKind::ALL {
            assert_eq!(kind.status(), kind.status());
            assert_eq!(ApiError::new(kind).into_response().status(), kind.status());
        }
        assert_eq!(ErrorKind::Unauthorized.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(ErrorKind::Forbidden.status(), StatusCode::FORBIDDEN);
    }

    #[test]
    fn codes_are_unique() {
        let codes: HashSet<_> = ErrorKind::ALL.iter().map(|kind| kind.code()).collect();
        assert_eq!(codes.len(), ErrorKind::ALL.len());
        assert!(ErrorKind::Unauthorized.code().starts_with("AUTH-"));
    }

    #[test]
    fn system_error_is_distinct_from_internal() {
        assert_ne!(
            ErrorKind::SystemError.code(),
            ErrorKind::InternalServerError.code()
        );
    }

    #[test]
    fn classify_keeps_cause_for_logs() {
        let io = std::io::Error::other("disk on fire");
        let err = ApiError::classify(ErrorKind::InternalServerError, io);
        assert_eq!(err.message(), "Internal Server Error");
        let source = StdError::source(&err).map(ToString::to_string);
        assert_eq!(source.as_deref(), Some("disk on fire"));
    }

    #[tokio::test]
    async fn body_hides_internal_cause() {
        let err = ApiError::internal(std::io::Error::other("secret path /var/lib/x"));
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "application/json"
        );
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["status"], 500);
        assert_eq!(body["code"], "SYS-001");
        assert_eq!(body["message"], "Internal Server Error");
        assert!(!String::from_utf8_lossy(&bytes).contains("secret"));
    }

    #[test]
    fn too_many_requests_sets_retry_after() {
        let response = ApiError::too_many_requests(42).into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers().get(header::RETRY_AFTER).unwrap(), "42");
    }

    #[test]
    fn storage_errors_map_to_kinds() {
        assert_eq!(
            ApiError::from(StorageError::InvalidPath).kind(),
            ErrorKind::Forbidden
        );
        let missing = std::io::Error::new(IoErrorKind::NotFound, "gone");
        assert_eq!(
            ApiError::from(StorageError::Io(missing)).kind(),
            ErrorKind::NotFound
        );
        assert_eq!(
            ApiError::from(StoreError::Conflict).kind(),
            ErrorKind::Conflict
        );
    }
}
