//! 基于客户端 IP 的登录会话与认证接口。

use axum::extract::{ConnectInfo, Extension};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json as JsonResponse, Response};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

use crate::http::resolve_client_ip;
use crate::state::ServerState;

/// Per-IP login sessions with a sliding expiry window.
pub struct AuthStore {
    pub(crate) sessions: Mutex<HashMap<IpAddr, Instant>>,
    ttl: Duration,
}

impl AuthStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    /// 登录语义：未启用登录时直接放行且不记录；已有未过期会话时
    /// 免密并刷新时间戳；否则按明文密码精确比对。
    pub async fn check_or_login(
        &self,
        login_enabled: bool,
        expected: &str,
        ip: IpAddr,
        supplied: &str,
    ) -> bool {
        if !login_enabled {
            return true;
        }
        let mut sessions = self.sessions.lock().await;
        let now = Instant::now();
        sessions.retain(|_, seen| now.duration_since(*seen) <= self.ttl);

        if let Some(seen) = sessions.get_mut(&ip) {
            *seen = now;
            return true;
        }
        if supplied == expected {
            sessions.insert(ip, now);
            return true;
        }
        false
    }

    /// 当前 IP 是否仍在登录保持期内。
    pub async fn is_authenticated(&self, ip: IpAddr) -> bool {
        let mut sessions = self.sessions.lock().await;
        let now = Instant::now();
        sessions.retain(|_, seen| now.duration_since(*seen) <= self.ttl);
        sessions.contains_key(&ip)
    }

    pub async fn purge_expired(&self) {
        let mut sessions = self.sessions.lock().await;
        let now = Instant::now();
        sessions.retain(|_, seen| now.duration_since(*seen) <= self.ttl);
    }

    /// Drops every session and returns the cleared IPs for the log.
    pub async fn clear_all(&self) -> Vec<IpAddr> {
        let mut sessions = self.sessions.lock().await;
        sessions.drain().map(|(ip, _)| ip).collect()
    }
}

#[derive(Deserialize)]
struct LoginRequest {
    #[serde(default)]
    password: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ConfigStatus {
    enable_login: bool,
    authenticated: bool,
}

/// 登录接口：返回 `{"success": bool}`，格式错误的请求体返回 400。
pub async fn auth_login(
    Extension(state): Extension<Arc<ServerState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: String,
) -> Response {
    let Ok(payload) = serde_json::from_str::<LoginRequest>(&body) else {
        return (
            StatusCode::BAD_REQUEST,
            JsonResponse(json!({"success": false, "error": "invalid request"})),
        )
            .into_response();
    };

    let config = state.config().await;
    let ip = resolve_client_ip(&headers, Some(addr.ip())).unwrap_or(addr.ip());
    let success = state
        .auth
        .check_or_login(
            config.login_enabled,
            &config.password,
            ip,
            &payload.password,
        )
        .await;

    if !config.login_enabled {
        state.log(format!("login disabled, {ip} granted without password")).await;
    } else if success {
        state.log(format!("login ok: {ip}")).await;
    } else {
        state.log(format!("login failed: {ip}")).await;
    }

    JsonResponse(json!({"success": success})).into_response()
}

/// 返回登录开关与当前请求 IP 的认证状态，供浏览器轮询。
pub async fn auth_config(
    Extension(state): Extension<Arc<ServerState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> JsonResponse<ConfigStatus> {
    let config = state.config().await;
    let ip = resolve_client_ip(&headers, Some(addr.ip())).unwrap_or(addr.ip());
    JsonResponse(ConfigStatus {
        enable_login: config.login_enabled,
        authenticated: state.auth.is_authenticated(ip).await,
    })
}
