//! Connectivity observation.
//!
//! Subscribes to the host's broadcast-style connectivity-change channel and
//! distills each notification into a [`ConnectivitySnapshot`] of the active
//! network. Only wireless snapshots are emitted; cellular or wired churn
//! never drives onboarding decisions. The gateway is re-resolved on every
//! pass because it can change across reassociation.
//!
//! The production host uses `nmcli monitor` as the change channel: one tick
//! per output line, plus one initial tick so the state that existed before
//! subscribing is evaluated immediately.

use async_trait::async_trait;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;

use crate::error::OnboardError;
use crate::gateway::GatewayResolver;

const DEFAULT_PROBE_URL: &str = "http://connectivitycheck.gstatic.com/generate_204";

const PROBE_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Wifi,
    Other,
}

/// Classification of the active network at one point in time. Derived and
/// transient; never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectivitySnapshot {
    pub transport: Transport,
    pub has_internet: bool,
    pub gateway: Option<Ipv4Addr>,
}

/// The host's view of whichever network currently carries traffic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveNetwork {
    pub transport: Transport,
    pub has_internet: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubscriptionId(u64);

/// Host side of connectivity observation: a change-notification channel and
/// an active-network query.
#[async_trait]
pub trait ConnectivityHost: Send + Sync {
    /// Each tick signals that the active network may have changed.
    async fn subscribe(&self, ticks: mpsc::Sender<()>) -> Result<SubscriptionId, OnboardError>;

    async fn unsubscribe(&self, id: SubscriptionId);

    async fn active_network(&self) -> Option<ActiveNetwork>;
}

/// Turns raw change ticks into wireless connectivity snapshots.
///
/// Holds at most one live subscription; registering again replaces the
/// previous one.
pub struct ConnectivityObserver {
    host: Arc<dyn ConnectivityHost>,
    resolver: Arc<dyn GatewayResolver>,
    subscription: Option<SubscriptionId>,
    task: Option<JoinHandle<()>>,
}

impl ConnectivityObserver {
    pub fn new(host: Arc<dyn ConnectivityHost>, resolver: Arc<dyn GatewayResolver>) -> Self {
        ConnectivityObserver {
            host,
            resolver,
            subscription: None,
            task: None,
        }
    }

    pub async fn register(
        &mut self,
        snapshots: mpsc::Sender<ConnectivitySnapshot>,
    ) -> Result<(), OnboardError> {
        self.unregister().await;

        let (tick_tx, mut tick_rx) = mpsc::channel(8);
        let id = self.host.subscribe(tick_tx).await?;
        self.subscription = Some(id);

        let host = self.host.clone();
        let resolver = self.resolver.clone();
        self.task = Some(tokio::spawn(async move {
            while tick_rx.recv().await.is_some() {
                let Some(active) = host.active_network().await else {
                    continue;
                };
                if active.transport != Transport::Wifi {
                    continue;
                }

                let snapshot = ConnectivitySnapshot {
                    transport: Transport::Wifi,
                    has_internet: active.has_internet,
                    gateway: resolver.resolve(),
                };
                if snapshots.send(snapshot).await.is_err() {
                    break;
                }
            }
        }));

        Ok(())
    }

    pub async fn unregister(&mut self) {
        if let Some(id) = self.subscription.take() {
            self.host.unsubscribe(id).await;
        }
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Connectivity host backed by NetworkManager.
pub struct NmConnectivityHost {
    interface: Option<String>,
    probe_url: String,
    next_id: AtomicU64,
    subscriptions: Mutex<HashMap<u64, JoinHandle<()>>>,
}

impl NmConnectivityHost {
    pub fn new(interface: Option<String>, probe_url: Option<String>) -> Self {
        NmConnectivityHost {
            interface,
            probe_url: probe_url.unwrap_or_else(|| DEFAULT_PROBE_URL.to_string()),
            next_id: AtomicU64::new(0),
            subscriptions: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl ConnectivityHost for NmConnectivityHost {
    /// # Command Executed
    /// ```bash
    /// nmcli monitor
    /// ```
    ///
    /// Every line NetworkManager prints becomes one tick.
    async fn subscribe(&self, ticks: mpsc::Sender<()>) -> Result<SubscriptionId, OnboardError> {
        let mut child = Command::new("nmcli")
            .arg("monitor")
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| OnboardError::HostCommand(e.to_string()))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| OnboardError::HostCommand("nmcli monitor has no stdout".to_string()))?;

        let task = tokio::spawn(async move {
            // The child lives here so aborting the task kills the monitor
            let _child = child;

            // Evaluate the pre-existing state immediately
            if ticks.send(()).await.is_err() {
                return;
            }

            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(_)) = lines.next_line().await {
                if ticks.send(()).await.is_err() {
                    break;
                }
            }
        });

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.subscriptions.lock().await.insert(id, task);
        Ok(SubscriptionId(id))
    }

    async fn unsubscribe(&self, id: SubscriptionId) {
        if let Some(task) = self.subscriptions.lock().await.remove(&id.0) {
            task.abort();
        }
    }

    /// # Commands Executed
    /// ```bash
    /// nmcli -t -f DEVICE,TYPE,STATE device
    /// nmcli networking connectivity check
    /// ```
    async fn active_network(&self) -> Option<ActiveNetwork> {
        let output = Command::new("nmcli")
            .args(["-t", "-f", "DEVICE,TYPE,STATE", "device"])
            .output()
            .await
            .ok()?;

        if !output.status.success() {
            return None;
        }

        let rows = parse_devices(&String::from_utf8_lossy(&output.stdout));
        let transport = pick_active(&rows, self.interface.as_deref())?;

        let has_internet = match self.check_connectivity().await {
            Some(known) => known,
            None => {
                // NetworkManager answered `unknown`; probe directly
                let url = self.probe_url.clone();
                tokio::task::spawn_blocking(move || probe_reachability(&url))
                    .await
                    .unwrap_or(false)
            }
        };

        Some(ActiveNetwork { transport, has_internet })
    }
}

impl NmConnectivityHost {
    async fn check_connectivity(&self) -> Option<bool> {
        let output = Command::new("nmcli")
            .args(["networking", "connectivity", "check"])
            .output()
            .await
            .ok()?;

        if !output.status.success() {
            return None;
        }

        internet_from(String::from_utf8_lossy(&output.stdout).trim())
    }
}

fn parse_devices(stdout: &str) -> Vec<(String, String, String)> {
    let mut rows = Vec::new();

    for line in stdout.lines() {
        let parts: Vec<&str> = line.split(':').collect();
        if parts.len() >= 3 {
            rows.push((
                parts[0].to_string(),
                parts[1].to_string(),
                parts[2].to_string(),
            ));
        }
    }

    rows
}

/// Pick the transport of the active network: the bound interface when one
/// is configured, otherwise any connected wireless device, otherwise any
/// connected device.
fn pick_active(rows: &[(String, String, String)], bound: Option<&str>) -> Option<Transport> {
    let transport_of = |kind: &str| if kind == "wifi" { Transport::Wifi } else { Transport::Other };

    if let Some(bound) = bound {
        return rows
            .iter()
            .find(|(device, _, state)| device == bound && state == "connected")
            .map(|(_, kind, _)| transport_of(kind));
    }

    rows.iter()
        .find(|(_, kind, state)| kind == "wifi" && state == "connected")
        .or_else(|| rows.iter().find(|(_, _, state)| state == "connected"))
        .map(|(_, kind, _)| transport_of(kind))
}

/// Map NetworkManager's connectivity word; `unknown` means "probe yourself".
fn internet_from(value: &str) -> Option<bool> {
    match value {
        "full" => Some(true),
        "unknown" => None,
        _ => Some(false),
    }
}

/// Blocking GET against a generate-204 endpoint. Anything other than a 204
/// (including a portal intercept rewriting the response) means no internet.
fn probe_reachability(url: &str) -> bool {
    match ureq::get(url).timeout(PROBE_TIMEOUT).call() {
        Ok(response) => response.status() == 204,
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    #[test]
    fn parses_terse_device_rows() {
        let rows = parse_devices("wlan0:wifi:connected\neth0:ethernet:unavailable\nlo:loopback:unmanaged (externally)\n");
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0], ("wlan0".into(), "wifi".into(), "connected".into()));
    }

    #[test]
    fn bound_interface_wins_over_other_devices() {
        let rows = parse_devices("eth0:ethernet:connected\nwlan0:wifi:connected\n");
        assert_eq!(pick_active(&rows, Some("wlan0")), Some(Transport::Wifi));
        assert_eq!(pick_active(&rows, Some("eth0")), Some(Transport::Other));
        assert_eq!(pick_active(&rows, Some("wlan1")), None);
    }

    #[test]
    fn unbound_pick_prefers_connected_wireless() {
        let rows = parse_devices("eth0:ethernet:connected\nwlan0:wifi:connected\n");
        assert_eq!(pick_active(&rows, None), Some(Transport::Wifi));

        let wired_only = parse_devices("eth0:ethernet:connected\nwlan0:wifi:disconnected\n");
        assert_eq!(pick_active(&wired_only, None), Some(Transport::Other));

        let nothing = parse_devices("wlan0:wifi:disconnected\n");
        assert_eq!(pick_active(&nothing, None), None);
    }

    #[test]
    fn connectivity_words_classify() {
        assert_eq!(internet_from("full"), Some(true));
        assert_eq!(internet_from("portal"), Some(false));
        assert_eq!(internet_from("limited"), Some(false));
        assert_eq!(internet_from("none"), Some(false));
        assert_eq!(internet_from("unknown"), None);
    }

    struct FakeHost {
        // Each tick consumes one scripted state, keeping the test
        // independent of when the observer task gets scheduled
        script: Mutex<VecDeque<Option<ActiveNetwork>>>,
        ticks: Mutex<Option<mpsc::Sender<()>>>,
        unsubscribed: AtomicU64,
        next_id: AtomicU64,
    }

    impl FakeHost {
        fn new() -> Self {
            FakeHost {
                script: Mutex::new(VecDeque::new()),
                ticks: Mutex::new(None),
                unsubscribed: AtomicU64::new(0),
                next_id: AtomicU64::new(0),
            }
        }

        async fn push(&self, active: Option<ActiveNetwork>) {
            self.script.lock().await.push_back(active);
            let sender = self.ticks.lock().await.clone();
            if let Some(sender) = sender {
                let _ = sender.send(()).await;
            }
        }
    }

    #[async_trait]
    impl ConnectivityHost for FakeHost {
        async fn subscribe(&self, ticks: mpsc::Sender<()>) -> Result<SubscriptionId, OnboardError> {
            *self.ticks.lock().await = Some(ticks);
            Ok(SubscriptionId(self.next_id.fetch_add(1, Ordering::SeqCst)))
        }

        async fn unsubscribe(&self, _id: SubscriptionId) {
            self.unsubscribed.fetch_add(1, Ordering::SeqCst);
            *self.ticks.lock().await = None;
        }

        async fn active_network(&self) -> Option<ActiveNetwork> {
            self.script.lock().await.pop_front().flatten()
        }
    }

    struct FixedResolver(Option<Ipv4Addr>);

    impl GatewayResolver for FixedResolver {
        fn resolve(&self) -> Option<Ipv4Addr> {
            self.0
        }
    }

    #[tokio::test]
    async fn non_wireless_churn_is_filtered_out() {
        let host = Arc::new(FakeHost::new());
        let resolver = Arc::new(FixedResolver(Some(Ipv4Addr::new(192, 168, 4, 1))));
        let mut observer = ConnectivityObserver::new(host.clone(), resolver);

        let (tx, mut rx) = mpsc::channel(8);
        observer.register(tx).await.unwrap();

        host.push(Some(ActiveNetwork { transport: Transport::Other, has_internet: true }))
            .await;
        host.push(None).await;
        host.push(Some(ActiveNetwork { transport: Transport::Wifi, has_internet: false }))
            .await;

        let snapshot = rx.recv().await.unwrap();
        assert_eq!(snapshot.transport, Transport::Wifi);
        assert!(!snapshot.has_internet);
        assert_eq!(snapshot.gateway, Some(Ipv4Addr::new(192, 168, 4, 1)));

        // The wired and absent networks produced nothing
        assert!(rx.try_recv().is_err());

        observer.unregister().await;
        assert_eq!(host.unsubscribed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn reregistering_replaces_the_subscription() {
        let host = Arc::new(FakeHost::new());
        let resolver = Arc::new(FixedResolver(None));
        let mut observer = ConnectivityObserver::new(host.clone(), resolver);

        let (tx1, _rx1) = mpsc::channel(8);
        observer.register(tx1).await.unwrap();
        let (tx2, _rx2) = mpsc::channel(8);
        observer.register(tx2).await.unwrap();

        assert_eq!(host.unsubscribed.load(Ordering::SeqCst), 1);
    }
}
