//! Path containment and share-tree operations.
//!
//! Every client-supplied path is resolved through [`ShareRoot::resolve`]
//! before it touches disk. Resolution is lexical: percent-decoding first,
//! then component-wise normalization that rejects anything which could
//! climb out of the root, so the result is always the root itself or a
//! descendant of it.

use percent_encoding::percent_decode_str;
use serde::Serialize;
use std::cmp::Ordering;
use std::io;
use std::path::{Component, Path, PathBuf};
use tokio::fs;

#[derive(Debug)]
pub enum ShareError {
    /// The supplied path would resolve outside the share root.
    Escape,
    Io(io::Error),
}

impl From<io::Error> for ShareError {
    fn from(err: io::Error) -> Self {
        ShareError::Io(err)
    }
}

/// 单个列表项，按前端约定序列化。
#[derive(Serialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct DirEntry {
    pub name: String,
    pub is_folder: bool,
    pub can_open: bool,
    pub size: String,
}

#[derive(Clone, Debug)]
pub struct ShareRoot {
    root: PathBuf,
}

impl ShareRoot {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root_path(&self) -> &Path {
        &self.root
    }

    /// Maps a client-supplied relative path to an absolute path under the
    /// share root. An empty path resolves to the root itself.
    pub fn resolve(&self, relative: &str) -> Result<PathBuf, ShareError> {
        let decoded = percent_decode_str(relative).decode_utf8_lossy();
        // Tolerate Windows-style separators from clients.
        let slashed = decoded.replace('\\', "/");
        let trimmed = slashed.trim_start_matches('/');

        let mut normalized = PathBuf::new();
        for component in Path::new(trimmed).components() {
            match component {
                Component::Normal(segment) => normalized.push(segment),
                Component::CurDir => continue,
                Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                    return Err(ShareError::Escape);
                }
            }
        }

        Ok(self.root.join(normalized))
    }

    /// 列出目录的直接子项；子文件夹递归统计大小。
    pub async fn list(&self, relative: &str) -> Result<Vec<DirEntry>, ShareError> {
        let target = self.resolve(relative)?;
        // The recursive size walk is synchronous work; keep it off the
        // request workers.
        tokio::task::spawn_blocking(move || list_dir_sync(&target))
            .await
            .map_err(|err| ShareError::Io(io::Error::other(err)))?
    }

    pub async fn delete(&self, relative: &str) -> Result<(), ShareError> {
        let target = self.resolve(relative)?;
        let metadata = fs::metadata(&target).await?;
        if metadata.is_dir() {
            fs::remove_dir_all(target).await?;
        } else {
            fs::remove_file(target).await?;
        }
        Ok(())
    }

    /// Creates the directory along with missing parents.
    pub async fn create_dir(&self, relative: &str) -> Result<(), ShareError> {
        let target = self.resolve(relative)?;
        fs::create_dir_all(target).await?;
        Ok(())
    }

    /// Renames an entry in place. The new name must be a single path
    /// component so the target cannot leave the entry's directory.
    pub async fn rename(&self, relative: &str, new_name: &str) -> Result<(), ShareError> {
        let from = self.resolve(relative)?;
        if from == self.root {
            return Err(ShareError::Escape);
        }
        let mut components = Path::new(new_name).components();
        let valid = matches!(
            (components.next(), components.next()),
            (Some(Component::Normal(_)), None)
        );
        if !valid || new_name.contains('\\') {
            return Err(ShareError::Escape);
        }
        let parent = from.parent().unwrap_or(&self.root);
        let to = parent.join(new_name);
        fs::rename(from, to).await?;
        Ok(())
    }
}

fn list_dir_sync(dir: &Path) -> Result<Vec<DirEntry>, ShareError> {
    if !dir.is_dir() {
        return Err(ShareError::Io(io::Error::new(
            io::ErrorKind::NotFound,
            "directory not found",
        )));
    }
    let mut entries = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        let metadata = entry.metadata()?;
        if metadata.is_dir() {
            entries.push(DirEntry {
                name,
                is_folder: true,
                can_open: true,
                size: size_label(folder_size(&entry.path())),
            });
        } else {
            entries.push(DirEntry {
                name,
                is_folder: false,
                can_open: false,
                size: size_label(metadata.len()),
            });
        }
    }

    entries.sort_by(|a, b| match (a.is_folder, b.is_folder) {
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        _ => a.name.to_lowercase().cmp(&b.name.to_lowercase()),
    });

    Ok(entries)
}

/// 递归统计文件夹内所有文件的总大小；不可读的子项按 0 计。
pub fn folder_size(dir: &Path) -> u64 {
    let Ok(read_dir) = std::fs::read_dir(dir) else {
        return 0;
    };
    let mut total = 0;
    for entry in read_dir.flatten() {
        let Ok(metadata) = entry.metadata() else {
            continue;
        };
        if metadata.is_dir() {
            total += folder_size(&entry.path());
        } else {
            total += metadata.len();
        }
    }
    total
}

/// Below 1 MiB the label is two-decimal KB, otherwise two-decimal MB.
/// Clients parse this exact shape.
pub fn size_label(bytes: u64) -> String {
    const MIB: u64 = 1024 * 1024;
    if bytes < MIB {
        format!("{:.2} KB", bytes as f64 / 1024.0)
    } else {
        format!("{:.2} MB", bytes as f64 / MIB as f64)
    }
}
