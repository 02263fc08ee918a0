//! multipart 上传处理器。

use axum::extract::{Extension, Multipart, Query};
use axum::http::StatusCode;
use std::sync::Arc;
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use tracing::info;

use crate::error::ApiError;
use crate::files::DirQuery;
use crate::share::ShareRoot;
use crate::state::ServerState;

/// 保存 multipart 字段 `file` 到 `dir` 指定的目录；目标目录必须已存在，
/// 最终保存路径再次做越权检查。
pub async fn upload_file(
    Extension(state): Extension<Arc<ServerState>>,
    Query(DirQuery { dir }): Query<DirQuery>,
    mut multipart: Multipart,
) -> Result<StatusCode, ApiError> {
    let config = state.config().await;
    let share = ShareRoot::new(config.share_root.clone());
    let rel_dir = dir.unwrap_or_default();
    let target_dir = share.resolve(&rel_dir)?;
    let is_dir = fs::metadata(&target_dir)
        .await
        .map(|metadata| metadata.is_dir())
        .unwrap_or(false);
    if !is_dir {
        return Err(ApiError::BadRequest("target directory does not exist".into()));
    }

    let mut saved = false;
    while let Some(mut field) = multipart
        .next_field()
        .await
        .map_err(|err| ApiError::BadRequest(err.to_string()))?
    {
        if field.name() != Some("file") {
            continue;
        }
        let Some(file_name) = field.file_name().and_then(sanitize_file_name) else {
            return Err(ApiError::BadRequest("no file".into()));
        };

        let save_rel = if rel_dir.is_empty() {
            file_name.clone()
        } else {
            format!("{rel_dir}/{file_name}")
        };
        let save_path = share.resolve(&save_rel)?;

        let mut file = File::create(&save_path)
            .await
            .map_err(|err| ApiError::Internal(err.to_string()))?;
        while let Some(chunk) = field
            .chunk()
            .await
            .map_err(|err| ApiError::BadRequest(err.to_string()))?
        {
            file.write_all(&chunk)
                .await
                .map_err(|err| ApiError::Internal(err.to_string()))?;
        }
        file.flush()
            .await
            .map_err(|err| ApiError::Internal(err.to_string()))?;

        info!(path = save_rel, "upload saved");
        state.log(format!("upload saved: {save_rel}")).await;
        saved = true;
    }

    if saved {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::BadRequest("no file field".into()))
    }
}

/// 去掉客户端附带的目录部分，只保留文件名本身。
fn sanitize_file_name(name: &str) -> Option<String> {
    let name = name
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default()
        .trim()
        .to_string();
    if name.is_empty() || name == "." || name == ".." {
        None
    } else {
        Some(name)
    }
}
