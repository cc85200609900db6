//! 统一的 JSON 响应封装。
//!
//! 处理器只返回 [`Reply`] 或 [`ApiError`]，真正的写出由 axum 在最外层完成，
//! 因而每个请求只会有一个状态行与一个响应体。

use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use tracing::error;

use crate::error::ApiError;

const FALLBACK_BODY: &str =
    r#"{"status":500,"code":"SYS-001","message":"Internal Server Error"}"#;

pub type ApiResult<T> = Result<Reply<T>, ApiError>;

/// 成功响应：状态码加可序列化的负载。
#[derive(Debug)]
pub struct Reply<T> {
    status: StatusCode,
    payload: T,
}

impl<T> Reply<T> {
    pub fn ok(payload: T) -> Self {
        Self::with_status(StatusCode::OK, payload)
    }

    pub fn with_status(status: StatusCode, payload: T) -> Self {
        Self { status, payload }
    }
}

impl<T: Serialize> IntoResponse for Reply<T> {
    fn into_response(self) -> Response {
        send(self.status, &self.payload)
    }
}

/// 以 JSON 序列化负载并构建响应。
pub fn send<T: Serialize + ?Sized>(status: StatusCode, payload: &T) -> Response {
    let (status, body) = match serde_json::to_vec(payload) {
        Ok(body) => (status, body),
        Err(err) => {
            error!(sender = "response.send", error = %err, "failed to serialize response");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                FALLBACK_BODY.as_bytes().to_vec(),
            )
        }
    };
    (
        status,
        [(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        )],
        body,
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;
    use serde::ser::Error as _;
    use serde::Serializer;

    struct Unserializable;

    impl Serialize for Unserializable {
        fn serialize<S: Serializer>(&self, _serializer: S) -> Result<S::Ok, S::Error> {
            Err(S::Error::custom("nope"))
        }
    }

    #[tokio::test]
    async fn reply_is_json_with_status() {
        let response = Reply::with_status(StatusCode::CREATED, "OK").into_response();
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "application/json"
        );
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&bytes[..], br#""OK""#);
    }

    #[tokio::test]
    async fn serialization_failure_falls_back_to_internal_error() {
        let response = send(StatusCode::OK, &Unserializable);
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["code"], "SYS-001");
    }
}
