//! API 版本信息处理器。

use serde::Serialize;

use crate::response::{ApiResult, Reply};

#[derive(Debug, Serialize)]
pub struct VersionInfo {
    version: &'static str,
}

/// 返回当前版本号，无需登录。
pub async fn get_version_info() -> ApiResult<VersionInfo> {
    Ok(Reply::ok(VersionInfo {
        version: env!("CARGO_PKG_VERSION"),
    }))
}
