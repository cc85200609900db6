//! TLS 证书加载。

use axum_server::tls_rustls::RustlsConfig;
use std::io;
use std::path::Path;
use tokio::fs;
use tracing::info;

/// 读取 PEM 格式的证书与私钥并构建 Rustls 配置。
pub async fn load_rustls_config(cert_path: &Path, key_path: &Path) -> io::Result<RustlsConfig> {
    let cert = fs::read(cert_path).await.map_err(|err| {
        io::Error::new(
            err.kind(),
            format!("cannot read TLS cert {}: {err}", cert_path.display()),
        )
    })?;
    let key = fs::read(key_path).await.map_err(|err| {
        io::Error::new(
            err.kind(),
            format!("cannot read TLS key {}: {err}", key_path.display()),
        )
    })?;
    let config = RustlsConfig::from_pem(cert, key).await?;
    info!(cert = %cert_path.display(), "TLS certificate loaded");
    Ok(config)
}
