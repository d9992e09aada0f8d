//! Peer-table adapter.
//!
//! Reads the current peer snapshot from the live WireGuard interface and
//! mutates it to add or remove peers. The default backend shells out to
//! `wg show <interface> dump` / `wg set <interface> peer ...`; every call
//! runs under a timeout so a hung external command cannot block the tick
//! loop or the HTTP server.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, instrument, warn};

/// Timeout applied to `snapshot()`.
const SNAPSHOT_TIMEOUT: Duration = Duration::from_secs(10);
/// Timeout applied to `interface_status()`.
const STATUS_TIMEOUT: Duration = Duration::from_secs(5);
/// Timeout applied to `add()`/`remove()`.
const MUTATE_TIMEOUT: Duration = Duration::from_secs(10);

/// Coarse health of the underlying interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterfaceStatus {
    /// `wg show <interface>` succeeded.
    Running,
    /// The command failed, timed out, or is not installed.
    Error,
}

impl InterfaceStatus {
    /// The literal string the status API reports.
    pub fn as_str(self) -> &'static str {
        match self {
            InterfaceStatus::Running => "running",
            InterfaceStatus::Error => "error",
        }
    }
}

/// One peer's row from `wg show <interface> dump`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerSnapshot {
    /// Received bytes, lifetime counter as reported by the kernel.
    pub rx: i64,
    /// Transmitted bytes, lifetime counter as reported by the kernel.
    pub tx: i64,
    /// Unix seconds of the latest handshake; `0` means "never".
    pub handshake_unix_seconds: i64,
    /// `ip:port` the peer was last seen at, if any.
    pub endpoint: Option<String>,
}

/// Reads and mutates the live peer table of a WireGuard interface.
///
/// `add`/`remove` must be idempotent from the caller's perspective: adding
/// an existing peer or removing an absent one still reports success.
#[async_trait]
pub trait PeerTableAdapter: Send + Sync {
    /// A consistent read of every peer currently configured on the interface.
    ///
    /// Command failure (missing binary, non-zero exit, timeout) is
    /// non-fatal: it is logged and an empty map is returned, which the
    /// Session Engine treats as "no peers visible this tick".
    async fn snapshot(&self) -> HashMap<String, PeerSnapshot>;

    /// Add `pubkey` to the interface with the given allowed client IP.
    async fn add(&self, pubkey: &str, client_ip: &str) -> bool;

    /// Remove `pubkey` from the interface.
    async fn remove(&self, pubkey: &str) -> bool;

    /// A coarse health probe, independent of any particular peer.
    async fn interface_status(&self) -> InterfaceStatus;
}

/// The default backend: shells out to the `wg` command-line tool.
pub struct WgAdapter {
    interface: String,
}

impl WgAdapter {
    /// Build an adapter targeting the given WireGuard interface name.
    pub fn new(interface: impl Into<String>) -> Self {
        Self {
            interface: interface.into(),
        }
    }

    /// Parse `wg show <interface> dump` output per the adapter's parsing
    /// contract: tab-separated rows, one per peer, after a header row.
    /// Columns used: 1 (pubkey), 3 (endpoint, `"(none)"` → `None`), 5
    /// (handshake seconds), 6 (rx bytes), 7 (tx bytes). Rows with fewer
    /// than 7 fields are skipped.
    fn parse_dump(output: &str) -> HashMap<String, PeerSnapshot> {
        let mut peers = HashMap::new();
        for line in output.lines().skip(1) {
            let fields: Vec<&str> = line.split('\t').collect();
            if fields.len() < 7 {
                continue;
            }
            let pubkey = fields[0].to_string();
            let endpoint = match fields[2] {
                "(none)" | "" => None,
                other => Some(other.to_string()),
            };
            let handshake = fields[4].parse::<i64>().unwrap_or(0);
            let rx = fields[5].parse::<i64>().unwrap_or(0);
            let tx = fields[6].parse::<i64>().unwrap_or(0);
            peers.insert(
                pubkey,
                PeerSnapshot {
                    rx,
                    tx,
                    handshake_unix_seconds: handshake,
                    endpoint,
                },
            );
        }
        peers
    }
}

#[async_trait]
impl PeerTableAdapter for WgAdapter {
    #[instrument(skip(self), fields(interface = %self.interface))]
    async fn snapshot(&self) -> HashMap<String, PeerSnapshot> {
        let run = Command::new("wg")
            .args(["show", &self.interface, "dump"])
            .output();
        match timeout(SNAPSHOT_TIMEOUT, run).await {
            Ok(Ok(output)) if output.status.success() => {
                let text = String::from_utf8_lossy(&output.stdout);
                Self::parse_dump(&text)
            }
            Ok(Ok(output)) => {
                debug!(status = ?output.status, "wg show dump exited non-zero");
                HashMap::new()
            }
            Ok(Err(err)) => {
                debug!(error = %err, "failed to spawn wg show dump");
                HashMap::new()
            }
            Err(_) => {
                debug!("wg show dump timed out");
                HashMap::new()
            }
        }
    }

    #[instrument(skip(self, client_ip), fields(interface = %self.interface))]
    async fn add(&self, pubkey: &str, client_ip: &str) -> bool {
        let allowed_ips = format!("{client_ip}/32");
        let run = Command::new("wg")
            .args([
                "set",
                &self.interface,
                "peer",
                pubkey,
                "allowed-ips",
                &allowed_ips,
            ])
            .output();
        match timeout(MUTATE_TIMEOUT, run).await {
            Ok(Ok(output)) if output.status.success() => true,
            Ok(Ok(output)) => {
                warn!(status = ?output.status, "wg set peer add failed");
                false
            }
            Ok(Err(err)) => {
                warn!(error = %err, "failed to spawn wg set peer add");
                false
            }
            Err(_) => {
                warn!("wg set peer add timed out");
                false
            }
        }
    }

    #[instrument(skip(self), fields(interface = %self.interface))]
    async fn remove(&self, pubkey: &str) -> bool {
        let run = Command::new("wg")
            .args(["set", &self.interface, "peer", pubkey, "remove"])
            .output();
        match timeout(MUTATE_TIMEOUT, run).await {
            Ok(Ok(output)) if output.status.success() => true,
            Ok(Ok(output)) => {
                warn!(status = ?output.status, "wg set peer remove failed");
                false
            }
            Ok(Err(err)) => {
                warn!(error = %err, "failed to spawn wg set peer remove");
                false
            }
            Err(_) => {
                warn!("wg set peer remove timed out");
                false
            }
        }
    }

    #[instrument(skip(self), fields(interface = %self.interface))]
    async fn interface_status(&self) -> InterfaceStatus {
        let run = Command::new("wg").args(["show", &self.interface]).output();
        match timeout(STATUS_TIMEOUT, run).await {
            Ok(Ok(output)) if output.status.success() => InterfaceStatus::Running,
            _ => InterfaceStatus::Error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_dump_skips_header_and_short_rows() {
        let dump = "private\tpublic\n\
                    AAA=\t(preshared)\t(none)\tallowed\t0\t100\t200\tkeepalive\n\
                    short\trow\n\
                    BBB=\t(preshared)\t1.2.3.4:51820\tallowed\t1690000000\t300\t400\tkeepalive";
        let peers = WgAdapter::parse_dump(dump);
        assert_eq!(peers.len(), 2);
        let a = &peers["AAA="];
        assert_eq!(a.handshake_unix_seconds, 0);
        assert_eq!(a.rx, 100);
        assert_eq!(a.tx, 200);
        assert_eq!(a.endpoint, None);
        let b = &peers["BBB="];
        assert_eq!(b.handshake_unix_seconds, 1690000000);
        assert_eq!(b.endpoint.as_deref(), Some("1.2.3.4:51820"));
    }

    #[test]
    fn parse_dump_of_empty_output_is_empty() {
        assert!(WgAdapter::parse_dump("").is_empty());
        assert!(WgAdapter::parse_dump("header only\n").is_empty());
    }

    #[test]
    fn status_as_str_matches_api_contract() {
        assert_eq!(InterfaceStatus::Running.as_str(), "running");
        assert_eq!(InterfaceStatus::Error.as_str(), "error");
    }
}
