//! CLI arguments, server configuration and the `key=value` config file.

use clap::Parser;
use std::io;
use std::path::{Path, PathBuf};
use tracing::warn;

pub const DEFAULT_PORT: u16 = 8000;
pub const DEFAULT_PASSWORD: &str = "123456";
pub const DEFAULT_SINGLE_ZIP_EXTS: &[&str] = &["pdf"];
/// 登录保持时长（秒）。
pub const AUTH_TTL_SECS: u64 = 10 * 60;
pub const LOG_RING_CAPACITY: usize = 1000;
pub const LOG_FLUSH_INTERVAL_SECS: u64 = 1;
pub const SESSION_PRUNE_INTERVAL_SECS: u64 = 60;
pub const SHUTDOWN_GRACE_SECS: u64 = 5;
pub const PORT_PROBE_TIMEOUT_MS: u64 = 1000;

/// One immutable configuration snapshot. Replaced wholesale on
/// reconfiguration; never mutated while handlers hold a reference.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub share_root: PathBuf,
    pub port: u16,
    pub login_enabled: bool,
    pub password: String,
    /// Extensions allowed for the single-file zip convenience path.
    pub single_zip_exts: Vec<String>,
    pub log_file: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            share_root: PathBuf::new(),
            port: DEFAULT_PORT,
            login_enabled: true,
            password: DEFAULT_PASSWORD.to_string(),
            single_zip_exts: DEFAULT_SINGLE_ZIP_EXTS
                .iter()
                .map(|ext| ext.to_string())
                .collect(),
            log_file: None,
        }
    }
}

/// 从 `key=value` 配置文件载入配置，缺失的键取默认值。
pub fn load_config(path: &Path) -> ServerConfig {
    let mut config = ServerConfig::default();
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) => {
            warn!(path = %path.display(), error = %err, "config file unreadable, using defaults");
            return config;
        }
    };

    for line in contents.lines() {
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let value = value.trim();
        match key.trim() {
            "dir" => config.share_root = PathBuf::from(value),
            "port" => {
                config.port = value.parse().unwrap_or(DEFAULT_PORT);
            }
            "pw_enabled" => config.login_enabled = value == "1",
            "password" => config.password = value.to_string(),
            "zip_exts" => {
                let exts: Vec<String> = value
                    .split(',')
                    .map(|ext| ext.trim().trim_start_matches('.').to_ascii_lowercase())
                    .filter(|ext| !ext.is_empty())
                    .collect();
                if !exts.is_empty() {
                    config.single_zip_exts = exts;
                }
            }
            "log_file" => {
                if !value.is_empty() {
                    config.log_file = Some(PathBuf::from(value));
                }
            }
            _ => {}
        }
    }

    config
}

/// 回写配置文件，供控制层在修改设置后持久化。
pub fn save_config(path: &Path, config: &ServerConfig) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let contents = format!(
        "dir={}\nport={}\npw_enabled={}\npassword={}\nzip_exts={}\n",
        config.share_root.display(),
        config.port,
        if config.login_enabled { "1" } else { "0" },
        config.password,
        config.single_zip_exts.join(","),
    );
    std::fs::write(path, contents)
}

/// CLI arguments and environment configuration for the server binary.
#[derive(Parser, Debug)]
#[command(name = "lanshare", version, about = "LAN file sharing server")]
pub struct Args {
    #[arg(
        short = 'c',
        long,
        env = "LANSHARE_CONFIG",
        default_value = "config/config.txt",
        help = "Path to the key=value config file"
    )]
    pub config: PathBuf,
    #[arg(
        short = 'd',
        long,
        env = "LANSHARE_DIR",
        help = "Share directory (overrides the config file)"
    )]
    pub dir: Option<PathBuf>,
    #[arg(
        short = 'p',
        long,
        env = "LANSHARE_PORT",
        help = "Listen port (overrides the config file)"
    )]
    pub port: Option<u16>,
}
