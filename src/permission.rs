//! Permission acquisition.
//!
//! Every network operation is gated on a set of host capabilities. The gate
//! checks what is already granted, batches the missing capabilities into a
//! single request, and suspends the caller until the host answers. A partial
//! grant counts as denial; the connector does not attempt degraded
//! operation.

use async_trait::async_trait;
use std::collections::HashMap;
use std::process::Command;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::OnboardError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    LocationAccess,
    WifiStateRead,
    WifiStateWrite,
}

/// Host side of permission handling: what is granted now, and a single
/// batched request for anything missing. The response is a terminal
/// callback, not polled.
#[async_trait]
pub trait PermissionHost: Send + Sync {
    fn is_granted(&self, capability: Capability) -> bool;

    /// Request the given capabilities in one batch; returns the subset the
    /// host approved.
    async fn request(&self, capabilities: &[Capability]) -> Vec<Capability>;
}

pub struct PermissionGate {
    host: Arc<dyn PermissionHost>,
    in_flight: AtomicBool,
}

impl PermissionGate {
    pub fn new(host: Arc<dyn PermissionHost>) -> Self {
        PermissionGate {
            host,
            in_flight: AtomicBool::new(false),
        }
    }

    /// Ensure every capability in `required` is granted.
    ///
    /// Already-granted capabilities are not re-requested; if none are
    /// missing this returns without suspending. At most one request may be
    /// outstanding: a second call while one is pending fails fast with
    /// `RequestInFlight` rather than queuing.
    pub async fn ensure(&self, required: &[Capability]) -> Result<(), OnboardError> {
        let missing: Vec<Capability> = required
            .iter()
            .copied()
            .filter(|c| !self.host.is_granted(*c))
            .collect();

        if missing.is_empty() {
            return Ok(());
        }

        if self
            .in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(OnboardError::RequestInFlight);
        }

        let granted = self.host.request(&missing).await;
        self.in_flight.store(false, Ordering::SeqCst);

        // Partial grant is a denial
        if missing.iter().all(|c| granted.contains(c)) {
            Ok(())
        } else {
            Err(OnboardError::PermissionDenied)
        }
    }
}

/// Permission host backed by NetworkManager's polkit permissions.
///
/// `auth` answers count as granted: polkit raises its own dialog when the
/// guarded operation actually runs, which is the host's native
/// request-then-callback flow.
pub struct NmPermissionHost;

fn polkit_action(capability: Capability) -> &'static str {
    match capability {
        // Scan results are the location-sensitive datum on this host
        Capability::LocationAccess => "org.freedesktop.NetworkManager.wifi.scan",
        Capability::WifiStateRead => "org.freedesktop.NetworkManager.network-control",
        Capability::WifiStateWrite => "org.freedesktop.NetworkManager.settings.modify.system",
    }
}

/// Query polkit permission values from NetworkManager.
///
/// # Command Executed
/// ```bash
/// nmcli -t general permissions
/// ```
///
/// Output is terse `PERMISSION:VALUE` pairs, one per line, with VALUE one
/// of `yes`, `no`, `auth` or `unknown`.
fn query_permissions() -> Result<HashMap<String, String>, OnboardError> {
    let output = Command::new("nmcli")
        .args(["-t", "general", "permissions"])
        .output()
        .map_err(|e| OnboardError::HostCommand(e.to_string()))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(OnboardError::HostCommand(stderr.to_string()));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    Ok(parse_permissions(&stdout))
}

fn parse_permissions(stdout: &str) -> HashMap<String, String> {
    let mut permissions = HashMap::new();

    for line in stdout.lines() {
        // Split on first colon only (the action name contains dots, not colons)
        let parts: Vec<&str> = line.splitn(2, ':').collect();
        if parts.len() == 2 {
            permissions.insert(parts[0].to_string(), parts[1].to_string());
        }
    }

    permissions
}

fn value_grants(value: Option<&String>) -> bool {
    matches!(value.map(String::as_str), Some("yes") | Some("auth"))
}

#[async_trait]
impl PermissionHost for NmPermissionHost {
    fn is_granted(&self, capability: Capability) -> bool {
        match query_permissions() {
            Ok(permissions) => value_grants(permissions.get(polkit_action(capability))),
            Err(e) => {
                tracing::warn!(err = %e, "could not query host permissions");
                false
            }
        }
    }

    async fn request(&self, capabilities: &[Capability]) -> Vec<Capability> {
        let Ok(permissions) = query_permissions() else {
            return Vec::new();
        };

        capabilities
            .iter()
            .copied()
            .filter(|c| value_grants(permissions.get(polkit_action(*c))))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::Notify;

    struct FakeHost {
        granted: Vec<Capability>,
        approves: Vec<Capability>,
        release: Option<Arc<Notify>>,
        requests: AtomicBool,
    }

    impl FakeHost {
        fn new(granted: Vec<Capability>, approves: Vec<Capability>) -> Self {
            FakeHost {
                granted,
                approves,
                release: None,
                requests: AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl PermissionHost for FakeHost {
        fn is_granted(&self, capability: Capability) -> bool {
            self.granted.contains(&capability)
        }

        async fn request(&self, capabilities: &[Capability]) -> Vec<Capability> {
            self.requests.store(true, Ordering::SeqCst);
            if let Some(release) = &self.release {
                release.notified().await;
            }
            capabilities
                .iter()
                .copied()
                .filter(|c| self.approves.contains(c))
                .collect()
        }
    }

    const ALL: [Capability; 3] = [
        Capability::LocationAccess,
        Capability::WifiStateRead,
        Capability::WifiStateWrite,
    ];

    #[tokio::test]
    async fn pre_granted_capabilities_skip_the_request() {
        let host = Arc::new(FakeHost::new(ALL.to_vec(), Vec::new()));
        let gate = PermissionGate::new(host.clone());

        gate.ensure(&ALL).await.unwrap();
        assert!(!host.requests.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn missing_capabilities_are_requested_and_granted() {
        let host = Arc::new(FakeHost::new(
            vec![Capability::LocationAccess],
            vec![Capability::WifiStateRead, Capability::WifiStateWrite],
        ));
        let gate = PermissionGate::new(host.clone());

        gate.ensure(&ALL).await.unwrap();
        assert!(host.requests.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn partial_grant_is_denied() {
        let host = Arc::new(FakeHost::new(
            Vec::new(),
            vec![Capability::LocationAccess, Capability::WifiStateRead],
        ));
        let gate = PermissionGate::new(host);

        let err = gate.ensure(&ALL).await.unwrap_err();
        assert!(matches!(err, OnboardError::PermissionDenied));
    }

    #[tokio::test]
    async fn second_ensure_while_pending_fails_fast() {
        let release = Arc::new(Notify::new());
        let mut host = FakeHost::new(Vec::new(), ALL.to_vec());
        host.release = Some(release.clone());

        let gate = Arc::new(PermissionGate::new(Arc::new(host)));

        let pending = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.ensure(&ALL).await })
        };
        tokio::task::yield_now().await;

        let err = gate.ensure(&ALL).await.unwrap_err();
        assert!(matches!(err, OnboardError::RequestInFlight));

        release.notify_one();
        pending.await.unwrap().unwrap();
    }

    #[test]
    fn parses_terse_permission_output() {
        let permissions = parse_permissions(
            "org.freedesktop.NetworkManager.wifi.scan:yes\n\
             org.freedesktop.NetworkManager.network-control:auth\n\
             org.freedesktop.NetworkManager.settings.modify.system:no\n",
        );

        assert!(value_grants(permissions.get("org.freedesktop.NetworkManager.wifi.scan")));
        assert!(value_grants(permissions.get("org.freedesktop.NetworkManager.network-control")));
        assert!(!value_grants(permissions.get("org.freedesktop.NetworkManager.settings.modify.system")));
        assert!(!value_grants(permissions.get("missing")));
    }
}
