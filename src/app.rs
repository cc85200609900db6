//! 路由表与请求管线的组装。
//!
//! 管线由外到内：CORS、请求 span、安全响应头、请求截止时间、panic 兜底、路由。

use axum::extract::{DefaultBodyLimit, Extension, connect_info::ConnectInfo};
use axum::http::Request;
use axum::routing::{delete, get, post, put};
use axum::{Router, middleware};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::CorsLayer;
use tower_http::trace::{DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::{Level, info_span};

use crate::auth::{self, Authenticator, LoginThrottle};
use crate::error::ApiError;
use crate::files::{self, UploadConfig};
use crate::http::{self, ForwardedTrust, resolve_client_ip};
use crate::middleware::{enforce_deadline, panic_response};
use crate::storage::Storage;
use crate::store::UserStore;
use crate::version;

/// 处理器共享的服务对象，通过 `Extension` 注入。
#[derive(Clone)]
pub struct Services {
    pub authenticator: Arc<Authenticator>,
    pub store: Arc<dyn UserStore>,
    pub storage: Arc<Storage>,
    pub throttle: Arc<LoginThrottle>,
    pub upload: Arc<UploadConfig>,
    pub forwarded: ForwardedTrust,
}

/// 构建完整的路由与中间件栈。`request_timeout` 为 `None` 时不设截止时间。
pub fn build_router(
    services: Services,
    request_timeout: Option<Duration>,
    cors: Option<CorsLayer>,
) -> Router {
    let mut app = Router::new()
        .route("/api/auth/register", post(auth::register))
        .route("/api/auth/login", post(auth::login))
        .route("/api/auth/check", get(auth::check))
        .route("/api/auth/logout", post(auth::logout))
        .route(
            "/api/files/upload",
            put(files::upload_files)
                .post(files::upload_files)
                .layer(DefaultBodyLimit::disable()),
        )
        .route("/api/files/list", get(files::list_files))
        .route("/api/files/delete", delete(files::delete_files))
        .route("/api/version", get(version::get_version_info))
        .fallback(route_not_found)
        .layer(CatchPanicLayer::custom(panic_response))
        .layer(middleware::from_fn_with_state(
            request_timeout,
            enforce_deadline,
        ))
        .layer(middleware::from_fn(http::add_security_headers))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|request: &Request<_>| {
                    let connect_ip = request
                        .extensions()
                        .get::<ConnectInfo<SocketAddr>>()
                        .map(|ConnectInfo(addr)| addr.ip());
                    let trust = request
                        .extensions()
                        .get::<ForwardedTrust>()
                        .copied()
                        .unwrap_or_default();
                    let client_ip = resolve_client_ip(request.headers(), connect_ip, trust)
                        .map(|ip| ip.to_string())
                        .unwrap_or_else(|| "unknown".to_string());

                    info_span!(
                        env!("CARGO_CRATE_NAME"),
                        client_ip,
                        method = ?request.method(),
                        path = ?request.uri().path(),
                    )
                })
                .on_request(DefaultOnRequest::new().level(Level::DEBUG))
                .on_response(DefaultOnResponse::new().level(Level::DEBUG)),
        )
        .layer(Extension(services.authenticator))
        .layer(Extension(services.store))
        .layer(Extension(services.storage))
        .layer(Extension(services.throttle))
        .layer(Extension(services.upload))
        .layer(Extension(services.forwarded));

    if let Some(cors_layer) = cors {
        app = app.layer(cors_layer);
    }
    app
}

async fn route_not_found() -> ApiError {
    ApiError::not_found("Not Found").with_sender("router")
}
