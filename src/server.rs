//! Server lifecycle and request routing.
//!
//! [`Server`] is the surface the external control layer drives: `start`
//! binds the listener, `stop` shuts it down and clears per-client state,
//! `reconfigure` swaps the config in place when the port is unchanged and
//! restarts the listener otherwise.

use axum::body::Body as AxumBody;
use axum::extract::{ConnectInfo, DefaultBodyLimit, Extension, Path as AxumPath};
use axum::http::Request;
use axum::response::{IntoResponse, Json as JsonResponse, Response};
use axum::routing::{get, post};
use axum::{Router, middleware};
use axum_server::Handle;
use chrono::Local;
use percent_encoding::percent_decode_str;
use serde_json::json;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, broadcast};
use tokio::task::JoinHandle;
use tower_http::trace::{DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::{Level, error, info, info_span, warn};

use crate::auth::{auth_config, auth_login};
use crate::background::spawn_background_tasks;
use crate::config::{PORT_PROBE_TIMEOUT_MS, SHUTDOWN_GRACE_SECS, ServerConfig};
use crate::error::ApiError;
use crate::files::{create_folder, delete_entry, get_entry, list_files, rename_entry};
use crate::frontend::{serve_image, serve_index};
use crate::http::{add_security_headers, resolve_client_ip};
use crate::state::{ServerState, list_clients};
use crate::upload::upload_file;

struct RunningServer {
    handle: Handle,
    task: JoinHandle<()>,
    port: u16,
}

/// 服务生命周期对象，供外部控制层调用。
pub struct Server {
    state: Arc<ServerState>,
    inner: Mutex<Option<RunningServer>>,
    running: AtomicBool,
    background_started: AtomicBool,
}

impl Server {
    pub fn new() -> Self {
        Self {
            state: Arc::new(ServerState::new(ServerConfig::default())),
            inner: Mutex::new(None),
            running: AtomicBool::new(false),
            background_started: AtomicBool::new(false),
        }
    }

    /// Binds the listener and begins serving. Refusals (bad share dir,
    /// occupied port, already running) are logged and leave the server
    /// stopped; nothing escapes to the caller beyond the `false`.
    pub async fn start(&self, config: ServerConfig) -> bool {
        let mut inner = self.inner.lock().await;
        if inner.is_some() {
            self.state
                .log("start ignored: server already running".to_string())
                .await;
            return false;
        }
        if !config.share_root.is_dir() {
            self.state
                .log(format!(
                    "start failed: share directory {} does not exist",
                    config.share_root.display()
                ))
                .await;
            return false;
        }

        let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
        let listener = match std::net::TcpListener::bind(addr) {
            Ok(listener) => listener,
            Err(err) => {
                warn!(port = config.port, error = %err, "port unavailable");
                self.state
                    .log(format!("port {} unavailable: {err}", config.port))
                    .await;
                return false;
            }
        };
        if let Err(err) = listener.set_nonblocking(true) {
            self.state
                .log(format!("listener setup failed: {err}"))
                .await;
            return false;
        }

        let port = config.port;
        let share_root = config.share_root.clone();
        self.state.replace_config(config).await;

        let app = build_router(self.state.clone());
        let handle = Handle::new();
        let server = axum_server::from_tcp(listener)
            .handle(handle.clone())
            .serve(app.into_make_service_with_connect_info::<SocketAddr>());
        let task_state = self.state.clone();
        let task = tokio::spawn(async move {
            if let Err(err) = server.await {
                error!(error = %err, "server terminated unexpectedly");
                task_state
                    .log(format!("server terminated: {err}"))
                    .await;
            }
        });

        if !self.background_started.swap(true, Ordering::SeqCst) {
            spawn_background_tasks(self.state.clone());
        }

        self.state
            .log(format!("serving at http://localhost:{port}"))
            .await;
        self.state
            .log(format!("LAN address: http://{}:{port}", local_ip()))
            .await;
        self.state
            .log(format!("share directory: {}", share_root.display()))
            .await;
        info!(port, "server started");

        *inner = Some(RunningServer { handle, task, port });
        self.running.store(true, Ordering::SeqCst);
        true
    }

    /// Graceful shutdown: closes the listener and the advisory socket and
    /// clears login sessions plus client activity.
    pub async fn stop(&self) {
        let running = self.inner.lock().await.take();
        if let Some(running) = running {
            running
                .handle
                .graceful_shutdown(Some(Duration::from_secs(SHUTDOWN_GRACE_SECS)));
            if let Err(err) = running.task.await {
                warn!(error = %err, "listener task join failed");
            }
            self.state.log("server stopped".to_string()).await;
            info!("server stopped");
        }

        self.state.close_advisory().await;
        let cleared = self.state.auth.clear_all().await;
        if !cleared.is_empty() {
            self.state
                .log(format!("cleared login sessions: {cleared:?}"))
                .await;
        }
        self.state.activity.clear().await;
        self.running.store(false, Ordering::SeqCst);
    }

    /// 无中断刷新：会话总是清空；端口未变时原地替换配置，端口变化时
    /// 先停后启（短暂不可用可接受）。
    pub async fn reconfigure(&self, config: ServerConfig) -> bool {
        let cleared = self.state.auth.clear_all().await;
        if !cleared.is_empty() {
            self.state
                .log(format!("reconfigure: cleared login sessions: {cleared:?}"))
                .await;
        }
        self.state.activity.clear().await;

        let current_port = self.inner.lock().await.as_ref().map(|running| running.port);
        match current_port {
            Some(port) if port == config.port => {
                self.state.replace_config(config).await;
                self.state
                    .log("configuration refreshed in place".to_string())
                    .await;
                true
            }
            Some(_) => {
                self.state
                    .log("port changed, restarting listener".to_string())
                    .await;
                self.stop().await;
                self.start(config).await
            }
            None => self.start(config).await,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// 订阅操作者日志流（GUI 实时显示用）。
    pub fn subscribe_logs(&self) -> broadcast::Receiver<String> {
        self.state.log.subscribe()
    }

    pub async fn log_snapshot(&self) -> Vec<String> {
        self.state.log.snapshot().await
    }

    pub(crate) fn state(&self) -> &Arc<ServerState> {
        &self.state
    }
}

impl Default for Server {
    fn default() -> Self {
        Self::new()
    }
}

/// 固定顺序的路由表；具体路径优先于通配路径。
pub(crate) fn build_router(state: Arc<ServerState>) -> Router {
    Router::new()
        .route("/", get(serve_index))
        .route("/list", get(list_files))
        .route("/clients", get(list_clients))
        .route("/config", get(auth_config))
        .route("/port/{action}", get(port_action))
        .route("/image/{*path}", get(serve_image))
        .route("/login", post(auth_login))
        .route(
            "/upload",
            post(upload_file).layer(DefaultBodyLimit::disable()),
        )
        .route("/newfolder", post(create_folder))
        .route("/rename", post(rename_entry))
        .route("/{*path}", get(get_entry).delete(delete_entry))
        .layer(middleware::from_fn(access_log))
        .layer(middleware::from_fn(add_security_headers))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|request: &Request<_>| {
                    info_span!(
                        env!("CARGO_CRATE_NAME"),
                        method = ?request.method(),
                        path = ?request.uri().path(),
                    )
                })
                .on_request(DefaultOnRequest::new().level(Level::DEBUG))
                .on_response(DefaultOnResponse::new().level(Level::DEBUG)),
        )
        .layer(Extension(state))
}

/// 每个请求一行访问日志，并刷新该 IP 的最后访问时间。
async fn access_log(
    Extension(state): Extension<Arc<ServerState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: Request<AxumBody>,
    next: middleware::Next,
) -> Response {
    let method = request.method().clone();
    let raw_path = request
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| request.uri().path().to_string());
    let ip = resolve_client_ip(request.headers(), Some(addr.ip())).unwrap_or(addr.ip());

    let response = next.run(request).await;

    // decode for readability; keep the raw string when it will not decode
    let display_path = match percent_decode_str(&raw_path).decode_utf8() {
        Ok(decoded) => decoded.to_string(),
        Err(_) => raw_path,
    };
    state.activity.touch(ip).await;
    state
        .log(format!(
            "{ip} [{}] {method} {display_path} {}",
            Local::now().format("%d/%b/%Y %H:%M:%S"),
            response.status().as_u16()
        ))
        .await;

    response
}

/// `/port/check|open|close`：探测、占用、释放配置端口的辅助套接字。
async fn port_action(
    Extension(state): Extension<Arc<ServerState>>,
    AxumPath(action): AxumPath<String>,
) -> Result<Response, ApiError> {
    let port = state.config().await.port;
    match action.as_str() {
        "check" => {
            let available = tokio::task::spawn_blocking(move || probe_port(port))
                .await
                .unwrap_or(false);
            Ok(JsonResponse(json!({"port": port, "available": available})).into_response())
        }
        "open" => {
            let mut advisory = state.advisory_port.lock().await;
            if advisory.is_some() {
                return Err(ApiError::BadRequest("port already opened".into()));
            }
            match std::net::TcpListener::bind(("0.0.0.0", port)) {
                Ok(listener) => {
                    *advisory = Some(listener);
                    Ok(JsonResponse(json!({"port": port, "opened": true})).into_response())
                }
                Err(err) => Ok(JsonResponse(
                    json!({"port": port, "opened": false, "error": err.to_string()}),
                )
                .into_response()),
            }
        }
        "close" => {
            let closed = state.advisory_port.lock().await.take().is_some();
            if closed {
                Ok(JsonResponse(json!({"closed": true})).into_response())
            } else {
                Ok(
                    JsonResponse(json!({"closed": false, "error": "no port opened"}))
                        .into_response(),
                )
            }
        }
        _ => Err(ApiError::NotFound("not found".into())),
    }
}

/// 端口可用 = 本机回环上无人接受连接。
fn probe_port(port: u16) -> bool {
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    std::net::TcpStream::connect_timeout(&addr, Duration::from_millis(PORT_PROBE_TIMEOUT_MS))
        .is_err()
}

/// 取局域网地址用于日志展示，失败时退回回环地址。
fn local_ip() -> IpAddr {
    std::net::UdpSocket::bind("0.0.0.0:0")
        .and_then(|socket| {
            socket.connect(("8.8.8.8", 80))?;
            socket.local_addr()
        })
        .map(|addr| addr.ip())
        .unwrap_or_else(|_| IpAddr::from([127, 0, 0, 1]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::IpAddr;
    use tempfile::tempdir;

    fn make_config(port: u16, share_root: std::path::PathBuf) -> ServerConfig {
        ServerConfig {
            share_root,
            port,
            ..ServerConfig::default()
        }
    }

    fn share_dir(temp: &tempfile::TempDir) -> std::path::PathBuf {
        let root = temp.path().join("share");
        std::fs::create_dir_all(&root).expect("create share root");
        root
    }

    fn free_port() -> u16 {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("probe listener");
        let port = listener.local_addr().expect("local addr").port();
        drop(listener);
        port
    }

    fn client_ip() -> IpAddr {
        "192.168.1.50".parse().expect("ip")
    }

    #[tokio::test]
    async fn start_refuses_occupied_port_and_logs_it() {
        let temp = tempdir().expect("tempdir");
        let root = share_dir(&temp);
        let blocker = std::net::TcpListener::bind("0.0.0.0:0").expect("blocker");
        let port = blocker.local_addr().expect("local addr").port();

        let server = Server::new();
        assert!(!server.start(make_config(port, root)).await);
        assert!(!server.is_running());

        let log = server.log_snapshot().await;
        assert!(
            log.iter().any(|line| line.contains("unavailable")),
            "expected a port-unavailable log line, got {log:?}"
        );
    }

    #[tokio::test]
    async fn start_twice_fails_second_without_crashing() {
        let temp = tempdir().expect("tempdir");
        let root = share_dir(&temp);
        let port = free_port();

        let first = Server::new();
        assert!(first.start(make_config(port, root.clone())).await);

        let second = Server::new();
        assert!(!second.start(make_config(port, root)).await);
        assert!(!second.is_running());
        assert!(first.is_running());

        let log = second.log_snapshot().await;
        assert!(log.iter().any(|line| line.contains("unavailable")));

        first.stop().await;
        assert!(!first.is_running());
    }

    #[tokio::test]
    async fn stop_clears_sessions_and_activity() {
        let temp = tempdir().expect("tempdir");
        let root = share_dir(&temp);
        let server = Server::new();
        assert!(server.start(make_config(free_port(), root)).await);

        let state = server.state();
        assert!(
            state
                .auth
                .check_or_login(true, "123456", client_ip(), "123456")
                .await
        );
        state.activity.touch(client_ip()).await;

        server.stop().await;
        assert!(!server.is_running());
        assert!(!state.auth.is_authenticated(client_ip()).await);
        assert!(state.activity.snapshot().await.is_empty());
    }

    #[tokio::test]
    async fn reconfigure_same_port_swaps_config_and_invalidates_sessions() {
        let temp = tempdir().expect("tempdir");
        let root = share_dir(&temp);
        let port = free_port();
        let server = Server::new();
        assert!(server.start(make_config(port, root.clone())).await);

        let state = server.state();
        assert!(
            state
                .auth
                .check_or_login(true, "123456", client_ip(), "123456")
                .await
        );

        let mut new_config = make_config(port, root);
        new_config.password = "rotated".to_string();
        assert!(server.reconfigure(new_config).await);

        // listener survived the in-place swap
        assert!(server.is_running());
        assert_eq!(state.config().await.password, "rotated");
        // previously authenticated IP must log in again
        assert!(!state.auth.is_authenticated(client_ip()).await);
        assert!(
            !state
                .auth
                .check_or_login(true, "rotated", client_ip(), "123456")
                .await
        );
        assert!(
            state
                .auth
                .check_or_login(true, "rotated", client_ip(), "rotated")
                .await
        );

        server.stop().await;
    }

    #[tokio::test]
    async fn reconfigure_new_port_restarts_listener() {
        let temp = tempdir().expect("tempdir");
        let root = share_dir(&temp);
        let server = Server::new();
        assert!(server.start(make_config(free_port(), root.clone())).await);

        let new_port = free_port();
        assert!(server.reconfigure(make_config(new_port, root)).await);
        assert!(server.is_running());
        assert_eq!(server.state().config().await.port, new_port);

        server.stop().await;
    }

    #[test]
    fn probe_reports_bound_port_as_unavailable() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("listener");
        let port = listener.local_addr().expect("local addr").port();
        assert!(!probe_port(port));
        drop(listener);
        assert!(probe_port(port));
    }
}
