//! Proxy availability tracking.
//!
//! The manager holds the configured proxy endpoints in preference
//! order. A monitor tick re-checks the stalest entry once its last
//! check is older than the heartbeat interval, using a short-timeout
//! `get-host-type` round-trip; an endpoint is available iff it answers
//! `"proxy"`. `kick` forces every entry due and, when all proxies are
//! currently unavailable, checks immediately.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use metrics::gauge;
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tracing::{debug, warn};
use walb_proto::host_type::get_host_type_client;
use walb_proto::{Packet, HOST_TYPE_PROXY};

#[derive(Debug, Clone)]
struct Entry {
    addr: SocketAddr,
    is_available: bool,
    checked_at: Instant,
}

/// Tracks which proxies currently accept transfers.
pub struct ProxyManager {
    node_id: String,
    heartbeat_interval: Duration,
    socket_timeout: Duration,
    entries: Mutex<Vec<Entry>>,
}

impl ProxyManager {
    /// Create a manager over the configured proxy list.
    #[must_use]
    pub fn new(
        node_id: &str,
        proxies: &[SocketAddr],
        heartbeat_interval: Duration,
        socket_timeout: Duration,
    ) -> Self {
        let due = Instant::now().checked_sub(heartbeat_interval).unwrap_or_else(Instant::now);
        Self {
            node_id: node_id.to_string(),
            heartbeat_interval,
            socket_timeout,
            entries: Mutex::new(
                proxies
                    .iter()
                    .map(|&addr| Entry { addr, is_available: true, checked_at: due })
                    .collect(),
            ),
        }
    }

    /// Currently-available proxies in configuration order.
    #[must_use]
    pub fn available_list(&self) -> Vec<SocketAddr> {
        self.entries.lock().iter().filter(|e| e.is_available).map(|e| e.addr).collect()
    }

    /// Status lines: one per proxy.
    #[must_use]
    pub fn status_lines(&self) -> Vec<String> {
        let now = Instant::now();
        self.entries
            .lock()
            .iter()
            .map(|e| {
                let next_check = self
                    .heartbeat_interval
                    .as_secs() as i64
                    - now.duration_since(e.checked_at).as_secs() as i64;
                format!(
                    "host {} isAvailable {} timeToNextCheck {next_check}",
                    e.addr,
                    u8::from(e.is_available)
                )
            })
            .collect()
    }

    /// Force every entry due for a re-check; when no proxy is
    /// available, check one immediately.
    pub async fn kick(&self) {
        let all_unavailable = {
            let mut entries = self.entries.lock();
            let due = Instant::now().checked_sub(self.heartbeat_interval).unwrap_or_else(Instant::now);
            let mut all_unavailable = !entries.is_empty();
            for e in entries.iter_mut() {
                if e.is_available {
                    all_unavailable = false;
                }
                e.checked_at = due;
            }
            all_unavailable
        };
        if all_unavailable {
            self.try_check_availability().await;
        }
    }

    /// One monitor tick: re-check the stalest overdue entry, if any.
    pub async fn try_check_availability(&self) {
        let target = {
            let entries = self.entries.lock();
            let deadline = Instant::now().checked_sub(self.heartbeat_interval);
            let Some(deadline) = deadline else { return };
            entries
                .iter()
                .filter(|e| e.checked_at <= deadline)
                .min_by_key(|e| e.checked_at)
                .map(|e| e.addr)
        };
        let Some(addr) = target else { return };

        let is_available = self.check_availability(addr).await;
        let checked_at = Instant::now();
        let mut entries = self.entries.lock();
        if let Some(e) = entries.iter_mut().find(|e| e.addr == addr) {
            if e.is_available != is_available {
                debug!(proxy = %addr, is_available, "proxy availability changed");
            }
            e.is_available = is_available;
            e.checked_at = checked_at;
        }
        let available = entries.iter().filter(|e| e.is_available).count();
        drop(entries);
        gauge!("walb_storage_available_proxies").set(available as f64);
    }

    async fn check_availability(&self, addr: SocketAddr) -> bool {
        let connect = tokio::time::timeout(self.socket_timeout, TcpStream::connect(addr)).await;
        let stream = match connect {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                warn!(proxy = %addr, error = %e, "proxy heartbeat connect failed");
                return false;
            }
            Err(_) => {
                warn!(proxy = %addr, "proxy heartbeat connect timed out");
                return false;
            }
        };
        let mut pkt = Packet::with_timeout(stream, self.socket_timeout);
        match get_host_type_client(&mut pkt, &self.node_id).await {
            Ok(ty) if ty == HOST_TYPE_PROXY => true,
            Ok(ty) => {
                warn!(proxy = %addr, host_type = %ty, "endpoint is not a proxy");
                false
            }
            Err(e) => {
                warn!(proxy = %addr, error = %e, "proxy heartbeat failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::net::TcpListener;
    use walb_proto::host_type::get_host_type_server;

    use super::*;

    async fn spawn_host(host_type: &'static str) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else { break };
                let mut pkt = Packet::new(stream);
                let _ = get_host_type_server(&mut pkt, "peer0", host_type).await;
            }
        });
        addr
    }

    #[tokio::test]
    async fn test_check_marks_proxy_available() {
        let good = spawn_host(HOST_TYPE_PROXY).await;
        let mgr = ProxyManager::new(
            "storage0",
            &[good],
            Duration::from_secs(60),
            Duration::from_secs(2),
        );
        mgr.try_check_availability().await;
        assert_eq!(mgr.available_list(), vec![good]);
    }

    #[tokio::test]
    async fn test_non_proxy_marked_unavailable() {
        let archive = spawn_host("archive").await;
        let mgr = ProxyManager::new(
            "storage0",
            &[archive],
            Duration::from_secs(60),
            Duration::from_secs(2),
        );
        mgr.try_check_availability().await;
        assert!(mgr.available_list().is_empty());
    }

    #[tokio::test]
    async fn test_dead_endpoint_marked_unavailable() {
        // Bind then drop to get an address nobody is listening on.
        let dead = {
            let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
            l.local_addr().unwrap()
        };
        let mgr = ProxyManager::new(
            "storage0",
            &[dead],
            Duration::from_secs(60),
            Duration::from_millis(500),
        );
        mgr.try_check_availability().await;
        assert!(mgr.available_list().is_empty());

        // kick with everything unavailable triggers an immediate
        // re-check instead of waiting for the interval.
        mgr.kick().await;
        assert!(mgr.available_list().is_empty());
    }

    #[tokio::test]
    async fn test_config_order_preserved() {
        let p1 = spawn_host(HOST_TYPE_PROXY).await;
        let p2 = spawn_host(HOST_TYPE_PROXY).await;
        let mgr = ProxyManager::new(
            "storage0",
            &[p1, p2],
            Duration::from_secs(60),
            Duration::from_secs(2),
        );
        // Two ticks check both entries (stalest first).
        mgr.try_check_availability().await;
        mgr.try_check_availability().await;
        assert_eq!(mgr.available_list(), vec![p1, p2]);
    }
}
