//! Persistence Bridge: the Handler's one-way fan-out target, durably
//! recording every interface's lease table as `{"lease_by_interface": {...}}`
//! and restoring it at startup.
//!
//! Writes are atomic (write to a temp file, then rename over the target)
//! so a crash mid-write never leaves a truncated snapshot on disk.

use std::collections::HashMap;
use std::fs;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::error::{DhcpError, Result};
use crate::handler::Sink;
use crate::lease::Lease;

/// On-disk shape: dotted-quad address, RFC3339
/// timestamps, field names `expiry`/`last_ack` (not the Rust-internal
/// `SystemTime`).
#[derive(Serialize, Deserialize, Clone)]
struct OnDiskLease {
    num: u32,
    addr: Ipv4Addr,
    hardware_addr: String,
    hostname: Option<String>,
    hostname_override: Option<String>,
    expiry: DateTime<Utc>,
    last_ack: DateTime<Utc>,
}

#[derive(Serialize, Deserialize, Default)]
struct OnDiskFile {
    lease_by_interface: HashMap<String, Vec<OnDiskLease>>,
}

fn to_datetime(t: SystemTime) -> DateTime<Utc> {
    DateTime::<Utc>::from(t)
}

fn from_datetime(t: DateTime<Utc>) -> SystemTime {
    let nanos = t.timestamp_nanos_opt().unwrap_or(0);
    if nanos <= 0 {
        UNIX_EPOCH
    } else {
        UNIX_EPOCH + std::time::Duration::from_nanos(nanos as u64)
    }
}

impl From<&Lease> for OnDiskLease {
    fn from(l: &Lease) -> Self {
        OnDiskLease {
            num: l.num,
            addr: l.addr,
            hardware_addr: l.hardware_addr.clone(),
            hostname: l.hostname.clone(),
            hostname_override: l.hostname_override.clone(),
            expiry: to_datetime(l.expiry),
            last_ack: to_datetime(l.last_ack),
        }
    }
}

impl From<OnDiskLease> for Lease {
    fn from(l: OnDiskLease) -> Self {
        Lease {
            num: l.num,
            addr: l.addr,
            hardware_addr: l.hardware_addr,
            hostname: l.hostname,
            hostname_override: l.hostname_override,
            expiry: from_datetime(l.expiry),
            last_ack: from_datetime(l.last_ack),
        }
    }
}

/// Loads the on-disk snapshot once at startup and serializes subsequent
/// `publish` calls into it, writing through on every change.
pub struct PersistenceBridge {
    path: PathBuf,
    state: Mutex<OnDiskFile>,
}

impl PersistenceBridge {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            state: Mutex::new(OnDiskFile::default()),
        }
    }

    /// A missing lease file is not an error — it means a fresh deployment
    /// with no prior leases to restore.
    pub fn load(&self) -> Result<()> {
        if !self.path.exists() {
            debug!(path = %self.path.display(), "no lease file to restore");
            return Ok(());
        }
        let content = fs::read_to_string(&self.path)
            .map_err(|e| DhcpError::Persistence(format!("reading {}: {e}", self.path.display())))?;
        let parsed: OnDiskFile = serde_json::from_str(&content)
            .map_err(|e| DhcpError::Persistence(format!("parsing {}: {e}", self.path.display())))?;
        let count: usize = parsed.lease_by_interface.values().map(|v| v.len()).sum();
        *self.state.lock().unwrap() = parsed;
        info!(path = %self.path.display(), leases = count, "restored lease snapshot");
        Ok(())
    }

    /// Leases restored for one interface's Handler to replay through
    /// `Handler::set_leases` at startup.
    pub fn leases_for(&self, interface: &str) -> Vec<Lease> {
        self.state
            .lock()
            .unwrap()
            .lease_by_interface
            .get(interface)
            .map(|leases| leases.iter().cloned().map(Lease::from).collect())
            .unwrap_or_default()
    }

    fn write(&self) -> Result<()> {
        let state = self.state.lock().unwrap();
        let content = serde_json::to_string_pretty(&*state)
            .map_err(|e| DhcpError::Persistence(format!("encoding lease snapshot: {e}")))?;
        drop(state);
        write_atomic(&self.path, &content)
    }
}

fn write_atomic(path: &Path, content: &str) -> Result<()> {
    let tmp_path = path.with_extension("tmp");
    fs::write(&tmp_path, content)
        .map_err(|e| DhcpError::Persistence(format!("writing {}: {e}", tmp_path.display())))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = fs::metadata(&tmp_path)
            .map_err(|e| DhcpError::Persistence(format!("stat {}: {e}", tmp_path.display())))?
            .permissions();
        perms.set_mode(0o600);
        fs::set_permissions(&tmp_path, perms)
            .map_err(|e| DhcpError::Persistence(format!("chmod {}: {e}", tmp_path.display())))?;
    }
    fs::rename(&tmp_path, path)
        .map_err(|e| DhcpError::Persistence(format!("renaming to {}: {e}", path.display())))?;
    Ok(())
}

impl Sink for PersistenceBridge {
    fn publish(&self, interface: &str, leases: Vec<Lease>) {
        {
            let mut state = self.state.lock().unwrap();
            state
                .lease_by_interface
                .insert(interface.to_string(), leases.iter().map(OnDiskLease::from).collect());
        }
        if let Err(e) = self.write() {
            error!(interface, error = %e, "failed to persist lease snapshot");
        }
    }
}

/// A single `(interface, leases)` change notification, as handed to the
/// bridge's background task by an `mpsc`-backed `Sink` adapter. The
/// Handler never sees this channel directly — it only sees the `Sink`
/// trait — keeping the dependency one-way.
pub struct ChangeMessage {
    pub interface: String,
    pub leases: Vec<Lease>,
}

/// An `mpsc`-backed `Sink` that hands snapshots off to a background task
/// instead of writing to disk on the Handler's own call stack.
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<ChangeMessage>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::UnboundedSender<ChangeMessage>) -> Self {
        Self { tx }
    }
}

impl Sink for ChannelSink {
    fn publish(&self, interface: &str, leases: Vec<Lease>) {
        let _ = self.tx.send(ChangeMessage {
            interface: interface.to_string(),
            leases,
        });
    }
}

/// Drains `rx`, writing each change through to `bridge`. Runs for the
/// daemon's lifetime as a supervised task.
pub async fn run(bridge: Arc<PersistenceBridge>, mut rx: mpsc::UnboundedReceiver<ChangeMessage>) {
    while let Some(msg) = rx.recv().await {
        bridge.publish(&msg.interface, msg.leases);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn lease(num: u32) -> Lease {
        Lease {
            num,
            addr: Ipv4Addr::new(10, 0, 0, 10 + num as u8),
            hardware_addr: format!("aa:bb:cc:00:00:{num:02x}"),
            hostname: Some("toaster".into()),
            hostname_override: None,
            expiry: SystemTime::now() + Duration::from_secs(1200),
            last_ack: SystemTime::now(),
        }
    }

    #[test]
    fn missing_file_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let bridge = PersistenceBridge::new(dir.path().join("leases.json"));
        assert!(bridge.load().is_ok());
        assert!(bridge.leases_for("eth0").is_empty());
    }

    #[test]
    fn publish_then_reload_restores_leases() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("leases.json");
        let bridge = PersistenceBridge::new(&path);
        let original = vec![lease(0), lease(1)];
        bridge.publish("eth0", original.clone());

        let reopened = PersistenceBridge::new(&path);
        reopened.load().unwrap();
        let restored = reopened.leases_for("eth0");
        assert_eq!(restored.len(), 2);
        assert_eq!(restored[0].hardware_addr, "aa:bb:cc:00:00:00");
        assert_eq!(restored[0].expiry, original[0].expiry);
        assert_eq!(restored[0].last_ack, original[0].last_ack);
    }

    #[test]
    fn file_permissions_are_owner_only() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("leases.json");
        let bridge = PersistenceBridge::new(&path);
        bridge.publish("eth0", vec![lease(0)]);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
            assert_eq!(mode, 0o600);
        }
    }
}
