//! Shared mutable server state, injected into the router instead of living
//! in globals: the config snapshot, login sessions, per-client activity,
//! the operator log buffer and the advisory port socket.

use axum::extract::Extension;
use axum::response::Json as JsonResponse;
use chrono::{DateTime, Local};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock, broadcast};

use crate::auth::AuthStore;
use crate::config::{AUTH_TTL_SECS, LOG_RING_CAPACITY, ServerConfig};

const LOG_CHANNEL_CAPACITY: usize = 256;

pub struct ServerState {
    config: RwLock<Arc<ServerConfig>>,
    pub auth: AuthStore,
    pub activity: ClientActivity,
    pub log: LogBuffer,
    /// Advisory listener held by `/port/open`, distinct from the main
    /// listener.
    pub(crate) advisory_port: Mutex<Option<std::net::TcpListener>>,
}

impl ServerState {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config: RwLock::new(Arc::new(config)),
            auth: AuthStore::new(Duration::from_secs(AUTH_TTL_SECS)),
            activity: ClientActivity::default(),
            log: LogBuffer::new(LOG_RING_CAPACITY),
            advisory_port: Mutex::new(None),
        }
    }

    /// Consistent snapshot for the duration of one request.
    pub async fn config(&self) -> Arc<ServerConfig> {
        self.config.read().await.clone()
    }

    pub async fn replace_config(&self, config: ServerConfig) {
        *self.config.write().await = Arc::new(config);
    }

    pub async fn log(&self, message: impl Into<String>) {
        self.log.append(message.into()).await;
    }

    pub async fn close_advisory(&self) {
        self.advisory_port.lock().await.take();
    }
}

/// 所有来访客户端的最后访问时间（不限于已登录的）。
#[derive(Default)]
pub struct ClientActivity {
    seen: Mutex<HashMap<IpAddr, DateTime<Local>>>,
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct ClientSeen {
    pub ip: String,
    pub last_seen: String,
}

impl ClientActivity {
    pub async fn touch(&self, ip: IpAddr) {
        self.seen.lock().await.insert(ip, Local::now());
    }

    /// Entries sorted by last-seen, most recent first.
    pub async fn snapshot(&self) -> Vec<ClientSeen> {
        let seen = self.seen.lock().await;
        let mut entries: Vec<(IpAddr, DateTime<Local>)> =
            seen.iter().map(|(ip, ts)| (*ip, *ts)).collect();
        entries.sort_by(|a, b| b.1.cmp(&a.1));
        entries
            .into_iter()
            .map(|(ip, ts)| ClientSeen {
                ip: ip.to_string(),
                last_seen: ts.format("%Y-%m-%d %H:%M:%S").to_string(),
            })
            .collect()
    }

    pub async fn clear(&self) -> Vec<IpAddr> {
        self.seen.lock().await.drain().map(|(ip, _)| ip).collect()
    }
}

/// 操作者可见的访问日志：有界内存环 + 订阅通道 + 待落盘队列。
pub struct LogBuffer {
    lines: Mutex<VecDeque<String>>,
    pending: Mutex<Vec<String>>,
    tx: broadcast::Sender<String>,
    capacity: usize,
}

impl LogBuffer {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(LOG_CHANNEL_CAPACITY);
        Self {
            lines: Mutex::new(VecDeque::with_capacity(capacity)),
            pending: Mutex::new(Vec::new()),
            tx,
            capacity,
        }
    }

    /// Stamps and records one line. Never touches the filesystem; the
    /// background flusher drains `pending` on its own schedule.
    pub async fn append(&self, message: String) {
        let line = format!("{} {}", Local::now().format("%Y-%m-%d %H:%M:%S"), message);
        {
            let mut lines = self.lines.lock().await;
            if lines.len() == self.capacity {
                lines.pop_front();
            }
            lines.push_back(line.clone());
        }
        self.pending.lock().await.push(line.clone());
        // no receivers is fine
        let _ = self.tx.send(line);
    }

    pub async fn snapshot(&self) -> Vec<String> {
        self.lines.lock().await.iter().cloned().collect()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.tx.subscribe()
    }

    pub async fn drain_pending(&self) -> Vec<String> {
        std::mem::take(&mut *self.pending.lock().await)
    }
}

/// 返回已见客户端及最后访问时间，按时间降序。
pub async fn list_clients(
    Extension(state): Extension<Arc<ServerState>>,
) -> JsonResponse<Vec<ClientSeen>> {
    JsonResponse(state.activity.snapshot().await)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn activity_sorts_most_recent_first() {
        let activity = ClientActivity::default();
        let first: IpAddr = "10.0.0.1".parse().expect("ip");
        let second: IpAddr = "10.0.0.2".parse().expect("ip");

        {
            let mut seen = activity.seen.lock().await;
            seen.insert(first, Local::now() - chrono::Duration::seconds(30));
            seen.insert(second, Local::now());
        }

        let snapshot = activity.snapshot().await;
        assert_eq!(snapshot[0].ip, "10.0.0.2");
        assert_eq!(snapshot[1].ip, "10.0.0.1");
    }

    #[tokio::test]
    async fn log_ring_is_capped() {
        let log = LogBuffer::new(3);
        for i in 0..5 {
            log.append(format!("line {i}")).await;
        }
        let snapshot = log.snapshot().await;
        assert_eq!(snapshot.len(), 3);
        assert!(snapshot[0].ends_with("line 2"));
        assert!(snapshot[2].ends_with("line 4"));
    }

    #[tokio::test]
    async fn pending_drains_once() {
        let log = LogBuffer::new(10);
        log.append("a".to_string()).await;
        log.append("b".to_string()).await;
        assert_eq!(log.drain_pending().await.len(), 2);
        assert!(log.drain_pending().await.is_empty());
    }

    #[tokio::test]
    async fn subscribers_see_appends() {
        let log = LogBuffer::new(10);
        let mut rx = log.subscribe();
        log.append("hello".to_string()).await;
        let line = rx.recv().await.expect("broadcast line");
        assert!(line.ends_with("hello"));
    }
}
