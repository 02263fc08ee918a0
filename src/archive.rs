//! 目录与单文件的 zip 打包下载。
//!
//! The archive is deflated into an anonymous spool file inside a blocking
//! task and then streamed, so memory stays bounded no matter how large the
//! share is and the spool disappears on drop.

use axum::body::Body as AxumBody;
use axum::http::{HeaderMap, HeaderValue, header};
use axum::response::{IntoResponse, Response};
use futures_util::TryStreamExt;
use percent_encoding::{NON_ALPHANUMERIC, utf8_percent_encode};
use std::fs::File;
use std::io::{self, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::io::ReaderStream;
use tracing::warn;
use zip::CompressionMethod;
use zip::write::{SimpleFileOptions, ZipWriter};

use crate::error::ApiError;
use crate::share::ShareRoot;
use crate::state::ServerState;

/// `GET <path>.zip`：目录整体打包；允许列表内的单文件单独打包；其余 404。
pub async fn download_zip(state: Arc<ServerState>, zip_path: &str) -> Result<Response, ApiError> {
    let Some(target_rel) = zip_path.strip_suffix(".zip") else {
        return Err(ApiError::NotFound("not found".into()));
    };

    let config = state.config().await;
    let share = ShareRoot::new(config.share_root.clone());
    let target = share.resolve(target_rel)?;
    let metadata = tokio::fs::metadata(&target)
        .await
        .map_err(|_| ApiError::NotFound("not found".into()))?;

    let packed_as_dir = metadata.is_dir();
    if !packed_as_dir && !single_file_allowed(&target, &config.single_zip_exts) {
        return Err(ApiError::NotFound("not found".into()));
    }

    let zip_name = match target.file_name() {
        Some(name) => format!("{}.zip", name.to_string_lossy()),
        None => return Err(ApiError::NotFound("not found".into())),
    };

    let build_target: PathBuf = target.clone();
    let spool = tokio::task::spawn_blocking(move || {
        if packed_as_dir {
            zip_dir(&build_target)
        } else {
            zip_single(&build_target)
        }
    })
    .await
    .map_err(|err| ApiError::Internal(err.to_string()))?
    .map_err(|err| ApiError::Internal(err.to_string()))?;

    let archive_len = spool
        .metadata()
        .map_err(|err| ApiError::Internal(err.to_string()))?
        .len();

    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/zip"),
    );
    headers.insert(header::CONTENT_DISPOSITION, content_disposition(&zip_name));
    headers.insert(
        header::CONTENT_LENGTH,
        HeaderValue::from_str(&archive_len.to_string())
            .map_err(|_| ApiError::Internal("invalid content length".into()))?,
    );

    let file = tokio::fs::File::from_std(spool);
    let path_for_log = zip_path.to_string();
    let stream = ReaderStream::new(file).inspect_err(move |err| {
        warn!(path = %path_for_log, error = %err, "zip transfer interrupted");
    });
    Ok((headers, AxumBody::from_stream(stream)).into_response())
}

fn single_file_allowed(path: &Path, allowed: &[String]) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            let ext = ext.to_ascii_lowercase();
            allowed.iter().any(|allowed| *allowed == ext)
        })
        .unwrap_or(false)
}

fn deflate_options() -> SimpleFileOptions {
    SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .large_file(true)
}

/// 递归打包整个目录；归档内路径相对于被打包目录。
fn zip_dir(dir: &Path) -> io::Result<File> {
    let spool = tempfile::tempfile()?;
    let mut writer = ZipWriter::new(spool);
    add_dir(&mut writer, dir, dir)?;
    finish_spool(writer)
}

fn add_dir(writer: &mut ZipWriter<File>, root: &Path, dir: &Path) -> io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let metadata = entry.metadata()?;
        if metadata.is_dir() {
            add_dir(writer, root, &path)?;
            continue;
        }
        let name = path
            .strip_prefix(root)
            .map_err(io::Error::other)?
            .to_string_lossy()
            .replace(std::path::MAIN_SEPARATOR, "/");
        writer
            .start_file(name, deflate_options())
            .map_err(io::Error::other)?;
        let mut file = File::open(&path)?;
        io::copy(&mut file, writer)?;
    }
    Ok(())
}

/// 单文件打包：归档内只有该文件本身。
fn zip_single(file_path: &Path) -> io::Result<File> {
    let spool = tempfile::tempfile()?;
    let mut writer = ZipWriter::new(spool);
    let name = file_path
        .file_name()
        .ok_or_else(|| io::Error::other("file has no name"))?
        .to_string_lossy()
        .to_string();
    writer
        .start_file(name, deflate_options())
        .map_err(io::Error::other)?;
    let mut file = File::open(file_path)?;
    io::copy(&mut file, &mut writer)?;
    finish_spool(writer)
}

fn finish_spool(writer: ZipWriter<File>) -> io::Result<File> {
    let mut spool = writer.finish().map_err(io::Error::other)?;
    spool.seek(SeekFrom::Start(0))?;
    Ok(spool)
}

/// RFC 6266 下载文件名：ASCII 回退 + 非 ASCII 时附加 `filename*`。
fn content_disposition(name: &str) -> HeaderValue {
    let fallback: String = name
        .chars()
        .map(|c| {
            if c == '"' || !(c.is_ascii_graphic() || c == ' ') {
                '_'
            } else {
                c
            }
        })
        .collect();
    let mut value = format!("attachment; filename=\"{fallback}\"");
    if !name.is_ascii() {
        value.push_str(&format!(
            "; filename*=UTF-8''{}",
            utf8_percent_encode(name, NON_ALPHANUMERIC)
        ));
    }
    HeaderValue::from_str(&value).unwrap_or_else(|_| HeaderValue::from_static("attachment"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use tempfile::tempdir;

    #[test]
    fn zip_dir_reproduces_nested_files() {
        let temp = tempdir().expect("tempdir");
        let root = temp.path().join("folder");
        std::fs::create_dir_all(root.join("sub/deeper")).expect("create dirs");
        std::fs::write(root.join("top.txt"), b"top level").expect("write");
        std::fs::write(root.join("sub/inner.txt"), b"inner bytes").expect("write");
        std::fs::write(root.join("sub/deeper/leaf.bin"), vec![7u8; 4096]).expect("write");

        let spool = zip_dir(&root).expect("zip dir");
        let mut archive = zip::ZipArchive::new(spool).expect("read archive");
        assert_eq!(archive.len(), 3);

        for (name, expected) in [
            ("top.txt", b"top level".to_vec()),
            ("sub/inner.txt", b"inner bytes".to_vec()),
            ("sub/deeper/leaf.bin", vec![7u8; 4096]),
        ] {
            let mut entry = archive.by_name(name).expect(name);
            let mut contents = Vec::new();
            entry.read_to_end(&mut contents).expect("read entry");
            assert_eq!(contents, expected, "mismatch for {name}");
        }
    }

    #[test]
    fn zip_single_wraps_one_file() {
        let temp = tempdir().expect("tempdir");
        let path = temp.path().join("manual.pdf");
        std::fs::write(&path, b"%PDF-1.4 fake").expect("write");

        let spool = zip_single(&path).expect("zip single");
        let mut archive = zip::ZipArchive::new(spool).expect("read archive");
        assert_eq!(archive.len(), 1);
        let mut entry = archive.by_name("manual.pdf").expect("entry");
        let mut contents = Vec::new();
        entry.read_to_end(&mut contents).expect("read entry");
        assert_eq!(contents, b"%PDF-1.4 fake");
    }

    #[test]
    fn allow_list_matches_extension_case_insensitively() {
        let allowed = vec!["pdf".to_string()];
        assert!(single_file_allowed(Path::new("a/b/doc.PDF"), &allowed));
        assert!(single_file_allowed(Path::new("doc.pdf"), &allowed));
        assert!(!single_file_allowed(Path::new("doc.txt"), &allowed));
        assert!(!single_file_allowed(Path::new("no_extension"), &allowed));
    }

    #[test]
    fn disposition_ascii_name_has_single_parameter() {
        let value = content_disposition("report.zip");
        let value = value.to_str().expect("ascii header");
        assert_eq!(value, "attachment; filename=\"report.zip\"");
    }

    #[test]
    fn disposition_unicode_name_gets_extended_parameter() {
        let value = content_disposition("资料.zip");
        let value = value.to_str().expect("ascii header");
        assert!(value.starts_with("attachment; filename=\"__.zip\""));
        assert!(value.contains("filename*=UTF-8''"));
        // RFC 5987 payload decodes back to the original name
        assert!(value.contains("%E8%B5%84%E6%96%99"));
    }
}
