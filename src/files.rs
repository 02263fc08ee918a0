//! 文件列表、下载与目录操作处理器。

use axum::body::Body as AxumBody;
use axum::extract::{Extension, Path as AxumPath, Query};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Json as JsonResponse, Response};
use futures_util::TryStreamExt;
use httpdate::fmt_http_date;
use serde::Deserialize;
use std::fs::Metadata;
use std::path::Path;
use std::sync::Arc;
use tokio::fs::{self, File};
use tokio_util::io::ReaderStream;
use tracing::{debug, warn};

use crate::archive;
use crate::error::ApiError;
use crate::frontend;
use crate::share::{DirEntry, ShareRoot};
use crate::state::ServerState;

#[derive(Deserialize)]
pub(crate) struct DirQuery {
    pub(crate) dir: Option<String>,
}

#[derive(Deserialize)]
pub(crate) struct PathQuery {
    path: String,
}

#[derive(Deserialize)]
struct NameBody {
    #[serde(default)]
    name: String,
}

/// 列出目录内容，`dir` 缺省为共享根目录。
pub async fn list_files(
    Extension(state): Extension<Arc<ServerState>>,
    Query(query): Query<DirQuery>,
) -> Result<JsonResponse<Vec<DirEntry>>, ApiError> {
    let config = state.config().await;
    let share = ShareRoot::new(config.share_root.clone());
    let entries = share.list(query.dir.as_deref().unwrap_or("")).await?;
    debug!(
        dir = query.dir.as_deref().unwrap_or(""),
        count = entries.len(),
        "list directory"
    );
    Ok(JsonResponse(entries))
}

/// Catch-all GET: `.zip` requests go to the archive streamer, real share
/// files are streamed, anything else falls back to the front-end assets.
pub async fn get_entry(
    Extension(state): Extension<Arc<ServerState>>,
    AxumPath(path): AxumPath<String>,
) -> Result<Response, ApiError> {
    if path.ends_with(".zip") {
        return archive::download_zip(state, &path).await;
    }

    let config = state.config().await;
    let share = ShareRoot::new(config.share_root.clone());
    let target = share.resolve(&path)?;
    match fs::metadata(&target).await {
        Ok(metadata) if metadata.is_file() => stream_file(&target, &metadata).await,
        _ => frontend::serve_asset(&path),
    }
}

async fn stream_file(target: &Path, metadata: &Metadata) -> Result<Response, ApiError> {
    let mime = mime_guess::from_path(target).first_or_octet_stream();

    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(mime.essence_str())
            .map_err(|_| ApiError::Internal("invalid mime type".into()))?,
    );
    headers.insert(
        header::CONTENT_LENGTH,
        HeaderValue::from_str(&metadata.len().to_string())
            .map_err(|_| ApiError::Internal("invalid content length".into()))?,
    );
    if let Ok(modified) = metadata.modified()
        && let Ok(value) = HeaderValue::from_str(&fmt_http_date(modified))
    {
        headers.insert(header::LAST_MODIFIED, value);
    }

    let file = File::open(target)
        .await
        .map_err(|err| ApiError::Internal(err.to_string()))?;
    let path_for_log = target.display().to_string();
    let stream = ReaderStream::new(file).inspect_err(move |err| {
        warn!(path = %path_for_log, error = %err, "file transfer interrupted");
    });
    Ok((headers, AxumBody::from_stream(stream)).into_response())
}

/// 删除文件或递归删除目录。
pub async fn delete_entry(
    Extension(state): Extension<Arc<ServerState>>,
    AxumPath(path): AxumPath<String>,
) -> Result<StatusCode, ApiError> {
    let config = state.config().await;
    let share = ShareRoot::new(config.share_root.clone());
    share.delete(&path).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// 新建文件夹（含中间目录），JSON 体 `{name}`，`dir` 指定父目录。
pub async fn create_folder(
    Extension(state): Extension<Arc<ServerState>>,
    Query(DirQuery { dir }): Query<DirQuery>,
    body: String,
) -> Result<StatusCode, ApiError> {
    let payload: NameBody =
        serde_json::from_str(&body).map_err(|_| ApiError::BadRequest("invalid request".into()))?;
    let name = payload.name.trim();
    if name.is_empty() {
        return Err(ApiError::BadRequest("name is required".into()));
    }

    let relative = match dir.as_deref() {
        Some(parent) if !parent.is_empty() => format!("{parent}/{name}"),
        _ => name.to_string(),
    };
    let config = state.config().await;
    let share = ShareRoot::new(config.share_root.clone());
    share.create_dir(&relative).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// 重命名文件或目录，JSON 体 `{name}`，`path` 指定原条目。
pub async fn rename_entry(
    Extension(state): Extension<Arc<ServerState>>,
    Query(PathQuery { path }): Query<PathQuery>,
    body: String,
) -> Result<StatusCode, ApiError> {
    let payload: NameBody =
        serde_json::from_str(&body).map_err(|_| ApiError::BadRequest("invalid request".into()))?;
    let name = payload.name.trim();
    if name.is_empty() {
        return Err(ApiError::BadRequest("name is required".into()));
    }
    if path.is_empty() {
        return Err(ApiError::BadRequest("path is required".into()));
    }

    let config = state.config().await;
    let share = ShareRoot::new(config.share_root.clone());
    share.rename(&path, name).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use tempfile::tempdir;

    fn make_state() -> (tempfile::TempDir, Arc<ServerState>) {
        let temp = tempdir().expect("tempdir");
        let root = temp.path().join("share");
        std::fs::create_dir_all(&root).expect("create share root");
        let state = Arc::new(ServerState::new(ServerConfig {
            share_root: root,
            ..ServerConfig::default()
        }));
        (temp, state)
    }

    #[tokio::test]
    async fn delete_rejects_traversal_and_keeps_file() {
        let (temp, state) = make_state();
        let outside = temp.path().join("outside.txt");
        std::fs::write(&outside, b"keep me").expect("write outside");

        let result = delete_entry(
            Extension(state),
            AxumPath("../outside.txt".to_string()),
        )
        .await;

        assert!(matches!(result, Err(ApiError::PathEscape)));
        assert!(outside.exists());
    }

    #[tokio::test]
    async fn delete_missing_entry_is_not_found() {
        let (_temp, state) = make_state();
        let result = delete_entry(Extension(state), AxumPath("nope.txt".to_string())).await;
        assert!(matches!(result, Err(ApiError::NotFound(_))));
    }

    #[tokio::test]
    async fn list_missing_dir_is_not_found() {
        let (_temp, state) = make_state();
        let result = list_files(
            Extension(state),
            Query(DirQuery {
                dir: Some("missing".to_string()),
            }),
        )
        .await;
        assert!(matches!(result, Err(ApiError::NotFound(_))));
    }

    #[tokio::test]
    async fn create_folder_builds_intermediates() {
        let (_temp, state) = make_state();
        let root = state.config().await.share_root.clone();

        let status = create_folder(
            Extension(state),
            Query(DirQuery {
                dir: Some("a/b".to_string()),
            }),
            r#"{"name":"c"}"#.to_string(),
        )
        .await
        .expect("create folder");

        assert_eq!(status, StatusCode::NO_CONTENT);
        assert!(root.join("a/b/c").is_dir());
    }

    #[tokio::test]
    async fn create_folder_rejects_bad_bodies() {
        let (_temp, state) = make_state();
        let result = create_folder(
            Extension(state.clone()),
            Query(DirQuery { dir: None }),
            "not json".to_string(),
        )
        .await;
        assert!(matches!(result, Err(ApiError::BadRequest(_))));

        let result = create_folder(
            Extension(state),
            Query(DirQuery { dir: None }),
            r#"{"name":"  "}"#.to_string(),
        )
        .await;
        assert!(matches!(result, Err(ApiError::BadRequest(_))));
    }

    #[tokio::test]
    async fn rename_moves_entry_within_directory() {
        let (_temp, state) = make_state();
        let root = state.config().await.share_root.clone();
        std::fs::write(root.join("old.txt"), b"x").expect("write");

        let status = rename_entry(
            Extension(state),
            Query(PathQuery {
                path: "old.txt".to_string(),
            }),
            r#"{"name":"new.txt"}"#.to_string(),
        )
        .await
        .expect("rename");

        assert_eq!(status, StatusCode::NO_CONTENT);
        assert!(root.join("new.txt").exists());
        assert!(!root.join("old.txt").exists());
    }
}
