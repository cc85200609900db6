//! 处理器外层管线：请求截止时间与 panic 兜底。
//!
//! 处理器只返回值，响应由这里之外的 axum 写出一次；超时会直接丢弃
//! 处理器的 future，因此超时之后不会再有任何写入。

use axum::body::Body as AxumBody;
use axum::extract::State;
use axum::http::Request;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use std::any::Any;
use std::time::Duration;
use tracing::warn;

use crate::error::ApiError;

/// 在给定时间内完成请求，否则返回 `Timeout` 错误。
pub async fn enforce_deadline(
    State(limit): State<Option<Duration>>,
    request: Request<AxumBody>,
    next: Next,
) -> Response {
    let Some(limit) = limit else {
        return next.run(request).await;
    };
    let path = request.uri().path().to_string();
    match tokio::time::timeout(limit, next.run(request)).await {
        Ok(response) => response,
        Err(_) => {
            warn!(path, limit_secs = limit.as_secs_f64(), "request deadline exceeded");
            ApiError::timeout().with_sender("deadline").into_response()
        }
    }
}

/// 将处理器中的 panic 渲染为 `SystemError`。
pub fn panic_response(panic: Box<dyn Any + Send + 'static>) -> Response {
    let detail = if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else {
        "panic with non-string payload".to_string()
    };
    ApiError::system(detail).with_sender("panic").into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Router;
    use axum::http::StatusCode;
    use axum::routing::get;
    use http_body_util::BodyExt;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tower::ServiceExt;
    use tower_http::catch_panic::CatchPanicLayer;

    fn pipeline(router: Router, limit: Option<Duration>) -> Router {
        router
            .layer(CatchPanicLayer::custom(panic_response))
            .layer(axum::middleware::from_fn_with_state(limit, enforce_deadline))
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn get_request(path: &str) -> Request<AxumBody> {
        Request::builder().uri(path).body(AxumBody::empty()).unwrap()
    }

    #[tokio::test]
    async fn panic_becomes_system_error() {
        let app = pipeline(
            Router::new().route(
                "/boom",
                get(|| async {
                    if true {
                        panic!("invariant broken");
                    }
                    "unreachable"
                }),
            ),
            None,
        );
        let response = app.oneshot(get_request("/boom")).await.unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = body_json(response).await;
        assert_eq!(body["code"], "SYS-999");
        assert_eq!(body["message"], "System Error");
    }

    #[tokio::test]
    async fn slow_handler_is_cut_off_and_never_finishes() {
        let finished = Arc::new(AtomicUsize::new(0));
        let flag = finished.clone();
        let app = pipeline(
            Router::new().route(
                "/slow",
                get(move || {
                    let flag = flag.clone();
                    async move {
                        tokio::time::sleep(Duration::from_millis(500)).await;
                        flag.fetch_add(1, Ordering::SeqCst);
                        "late"
                    }
                }),
            ),
            Some(Duration::from_millis(20)),
        );
        let response = app.oneshot(get_request("/slow")).await.unwrap();
        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(body_json(response).await["code"], "SYS-002");
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(finished.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn handler_runs_exactly_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let app = pipeline(
            Router::new().route(
                "/once",
                get(move || {
                    let counter = counter.clone();
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Err::<&str, _>(ApiError::forbidden("no"))
                    }
                }),
            ),
            Some(Duration::from_secs(5)),
        );
        let response = app.oneshot(get_request("/once")).await.unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(response.headers().get_all("content-type").iter().count(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
