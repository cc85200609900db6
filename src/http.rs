//! HTTP 辅助工具：请求方案识别、客户端 IP、CORS 与安全头。

use axum::body::Body as AxumBody;
use axum::extract::{FromRequestParts, connect_info::ConnectInfo};
use axum::http::request::Parts;
use axum::http::{HeaderMap, HeaderValue, Request, header};
use axum::{middleware, response::Response};
use std::convert::Infallible;
use std::net::{IpAddr, SocketAddr};
use tower_http::cors::{AllowHeaders, AllowMethods, AllowOrigin, CorsLayer};
use tracing::warn;

#[derive(Clone, Copy, Debug)]
pub enum RequestScheme {
    Http,
    Https,
}

impl RequestScheme {
    /// 判断请求是否为 HTTPS。
    pub fn is_https(self) -> bool {
        matches!(self, RequestScheme::Https)
    }
}

/// 构建 CORS Layer（支持逗号分隔的来源列表）。
pub fn build_cors_layer(cors_origins: Option<&str>) -> Option<CorsLayer> {
    let origins = cors_origins?
        .split(',')
        .map(|origin| origin.trim())
        .filter(|origin| !origin.is_empty())
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(origin, "invalid cors origin");
                None
            }
        })
        .collect::<Vec<_>>();

    if origins.is_empty() {
        return None;
    }

    Some(
        CorsLayer::new()
            .allow_origin(AllowOrigin::list(origins))
            .allow_methods(AllowMethods::mirror_request())
            .allow_headers(AllowHeaders::mirror_request())
            .allow_credentials(true),
    )
}

/// 从 `x-forwarded-for` 解析客户端 IP。
pub fn extract_forwarded_ip(headers: &HeaderMap) -> Option<IpAddr> {
    headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .and_then(|value| value.parse::<IpAddr>().ok())
}

/// 是否采信 `x-forwarded-for`；只应在可信反向代理之后开启。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ForwardedTrust(pub bool);

/// 计算客户端 IP：默认只用连接地址，信任代理时优先取转发头。
pub fn resolve_client_ip(
    headers: &HeaderMap,
    connect_ip: Option<IpAddr>,
    trust: ForwardedTrust,
) -> Option<IpAddr> {
    if trust.0 {
        extract_forwarded_ip(headers).or(connect_ip)
    } else {
        connect_ip
    }
}

/// 请求的客户端 IP；没有连接信息时为 `None`。
#[derive(Clone, Copy, Debug)]
pub struct ClientIp(pub Option<IpAddr>);

impl<S> FromRequestParts<S> for ClientIp
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let connect_ip = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip());
        let trust = parts
            .extensions
            .get::<ForwardedTrust>()
            .copied()
            .unwrap_or_default();
        Ok(ClientIp(resolve_client_ip(&parts.headers, connect_ip, trust)))
    }
}

/// 判断请求是否为 HTTPS（含反向代理头）。
pub fn is_https_request(headers: &HeaderMap, scheme: RequestScheme) -> bool {
    if let Some(value) = headers
        .get("x-forwarded-proto")
        .and_then(|value| value.to_str().ok())
    {
        return value.eq_ignore_ascii_case("https");
    }
    scheme.is_https()
}

/// 添加基础安全响应头。
pub async fn add_security_headers(request: Request<AxumBody>, next: middleware::Next) -> Response {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    headers.insert(header::X_FRAME_OPTIONS, HeaderValue::from_static("DENY"));
    headers.insert(
        header::X_CONTENT_TYPE_OPTIONS,
        HeaderValue::from_static("nosniff"),
    );
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    response
}
