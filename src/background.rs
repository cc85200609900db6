//! 登录失败记录清理与上传暂存文件清理的后台任务。

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::auth::LoginThrottle;
use crate::config::{LOGIN_PRUNE_INTERVAL_SECS, UPLOAD_SWEEP_INTERVAL_SECS};
use crate::files::UploadConfig;
use crate::storage::Storage;

/// 启动后台任务（登录失败记录清理与孤立暂存文件清理）。
pub fn spawn_background_tasks(
    storage: Arc<Storage>,
    throttle: Arc<LoginThrottle>,
    upload: Arc<UploadConfig>,
) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(LOGIN_PRUNE_INTERVAL_SECS));
        loop {
            interval.tick().await;
            throttle.prune().await;
            debug!("login attempts pruned");
        }
    });

    if upload.temp_ttl.is_zero() {
        return;
    }
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(UPLOAD_SWEEP_INTERVAL_SECS));
        loop {
            interval.tick().await;
            if let Err(err) = storage.sweep_stale_temps(upload.temp_ttl).await {
                warn!(error = %err, "upload temp cleanup failed");
            }
        }
    });
}
