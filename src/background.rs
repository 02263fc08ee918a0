//! 会话清理与访问日志落盘的后台任务。

use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tracing::warn;

use crate::config::{LOG_FLUSH_INTERVAL_SECS, SESSION_PRUNE_INTERVAL_SECS};
use crate::state::ServerState;

/// 启动后台任务：周期性清理过期会话，按秒批量落盘日志。
pub fn spawn_background_tasks(state: Arc<ServerState>) {
    let prune_state = state.clone();
    tokio::spawn(async move {
        let mut interval =
            tokio::time::interval(Duration::from_secs(SESSION_PRUNE_INTERVAL_SECS));
        loop {
            interval.tick().await;
            prune_state.auth.purge_expired().await;
        }
    });

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(LOG_FLUSH_INTERVAL_SECS));
        loop {
            interval.tick().await;
            let pending = state.log.drain_pending().await;
            if pending.is_empty() {
                continue;
            }
            let Some(path) = state.config().await.log_file.clone() else {
                continue;
            };
            if let Err(err) = flush_lines(&path, &pending).await {
                warn!(path = %path.display(), error = %err, "log flush failed");
            }
        }
    });
}

/// 将一批日志行追加写入文件（每个周期一次写操作）。
async fn flush_lines(path: &Path, lines: &[String]) -> io::Result<()> {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    let mut block = lines.join("\n");
    block.push('\n');
    file.write_all(block.as_bytes()).await?;
    file.flush().await
}
