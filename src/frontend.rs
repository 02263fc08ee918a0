//! 嵌入式前端页面与图片资源服务。

use axum::body::Body as AxumBody;
use axum::extract::Path as AxumPath;
use axum::http::{HeaderMap, HeaderValue, header};
use axum::response::{IntoResponse, Response};
use rust_embed::RustEmbed;

use crate::error::ApiError;

const PAGE: &str = "webserver.html";

#[derive(RustEmbed)]
#[folder = "assets"]
/// 嵌入式前端资源（页面与图片）。
pub struct FrontendAssets;

/// 站点首页。
pub async fn serve_index() -> Result<Response, ApiError> {
    serve_asset("")
}

/// `/image/*`：应用自带图片资源。
pub async fn serve_image(AxumPath(path): AxumPath<String>) -> Result<Response, ApiError> {
    load_embedded_asset(&format!("image/{path}"))?
        .ok_or_else(|| ApiError::NotFound("not found".into()))
}

/// 按路径取资源；不存在且不像文件名时回退到主页面。
pub fn serve_asset(path: &str) -> Result<Response, ApiError> {
    if let Some(response) = load_embedded_asset(path)? {
        return Ok(response);
    }
    if (path.is_empty() || !path.contains('.'))
        && let Some(response) = load_embedded_asset(PAGE)?
    {
        return Ok(response);
    }
    Err(ApiError::NotFound("not found".into()))
}

fn load_embedded_asset(path: &str) -> Result<Option<Response>, ApiError> {
    let Some(asset) = FrontendAssets::get(path) else {
        return Ok(None);
    };
    let mime = mime_guess::from_path(path).first_or_octet_stream();
    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(mime.essence_str())
            .map_err(|_| ApiError::Internal("invalid mime type".into()))?,
    );
    Ok(Some(
        (headers, AxumBody::from(asset.data.into_owned())).into_response(),
    ))
}
