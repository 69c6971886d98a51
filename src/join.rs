//! Network join strategies.
//!
//! Two structurally different ways of getting the host onto the target
//! network, selected once at startup by host capability tier and never
//! switched mid-flow:
//!
//! - **Suggestion**: register a declarative join hint and let the host's own
//!   network selection act on it. The call answers accepted/rejected
//!   immediately; join confirmation arrives out-of-band on the general
//!   connectivity channel.
//! - **Specifier**: imperatively request the join and receive the outcome as
//!   a stream of terminal signals (joined, unavailable, lost). This is the
//!   fallback for older hosts; it needs an explicit process-to-network bind
//!   on join and a settle delay before the join can be trusted, since the
//!   legacy path has no strong completion signal.
//!
//! The production hosts drive NetworkManager through `nmcli`.

use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;

use crate::error::OnboardError;
use crate::permission::Capability;

/// NetworkManager versions from here on get the declarative path.
const MIN_SUGGESTION_VERSION: (u32, u32) = (1, 16);

/// Route metric applied when binding process traffic to the joined network.
/// Low enough to win against the usual defaults (ethernet 100, wifi 600).
const BIND_ROUTE_METRIC: u32 = 50;

const WATCH_INTERVAL: Duration = Duration::from_secs(2);

/// The network to onboard onto. Immutable for the connector's lifetime.
#[derive(Debug, Clone)]
pub struct TargetNetwork {
    pub ssid: String,
    pub passphrase: String,
}

impl TargetNetwork {
    /// WPA2-PSK passphrases are 8 to 63 bytes.
    pub fn new(ssid: impl Into<String>, passphrase: impl Into<String>) -> Result<Self, OnboardError> {
        let ssid = ssid.into();
        let passphrase = passphrase.into();

        if ssid.is_empty() {
            return Err(OnboardError::InvalidTarget("SSID must not be empty".to_string()));
        }
        if passphrase.len() < 8 || passphrase.len() > 63 {
            return Err(OnboardError::InvalidTarget(
                "WPA2 passphrase must be 8 to 63 characters".to_string(),
            ));
        }

        Ok(TargetNetwork { ssid, passphrase })
    }
}

/// Opaque identity of a joined network (the device name on this host).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkHandle(String);

impl NetworkHandle {
    pub fn new(id: impl Into<String>) -> Self {
        NetworkHandle(id.into())
    }
}

impl fmt::Display for NetworkHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Asynchronous result of a join attempt. Each transition is consumed
/// exactly once by the handoff controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinOutcome {
    Joined(NetworkHandle),
    Unavailable,
    Lost(NetworkHandle),
}

/// Immediate answer to a declarative join hint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuggestionStatus {
    Accepted,
    Rejected(i32),
}

/// Identifies an outstanding imperative join registration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistrationId(u64);

/// Host side of the declarative join path.
#[async_trait]
pub trait SuggestionHost: Send + Sync {
    async fn add(&self, target: &TargetNetwork) -> Result<SuggestionStatus, OnboardError>;
    async fn remove(&self, target: &TargetNetwork) -> Result<(), OnboardError>;
}

/// Host side of the imperative join path. Outcomes are delivered through
/// the given sender; `release` revokes a registration and stops delivery.
#[async_trait]
pub trait SpecifierHost: Send + Sync {
    async fn request(
        &self,
        target: &TargetNetwork,
        events: mpsc::Sender<JoinOutcome>,
    ) -> Result<RegistrationId, OnboardError>;

    async fn release(&self, id: RegistrationId);

    /// Pin process-wide outbound traffic to the joined network so that
    /// subsequent address resolution hits it rather than a default route.
    async fn bind(&self, handle: &NetworkHandle) -> Result<(), OnboardError>;
}

/// Host capability tier; decides the join strategy once at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostTier {
    Suggestion,
    Specifier,
}

impl HostTier {
    pub fn detect() -> HostTier {
        tier_for(nm_version())
    }
}

fn tier_for(version: Option<(u32, u32)>) -> HostTier {
    match version {
        Some(v) if v >= MIN_SUGGESTION_VERSION => HostTier::Suggestion,
        _ => HostTier::Specifier,
    }
}

fn nm_version() -> Option<(u32, u32)> {
    let output = std::process::Command::new("nmcli")
        .arg("--version")
        .output()
        .ok()?;
    parse_nm_version(&String::from_utf8_lossy(&output.stdout))
}

/// Parse `nmcli tool, version 1.42.4` into `(1, 42)`.
fn parse_nm_version(line: &str) -> Option<(u32, u32)> {
    let version = line.trim().rsplit(' ').next()?;
    let mut parts = version.split('.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next()?.parse().ok()?;
    Some((major, minor))
}

/// What `begin` left the flow waiting on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BeginStatus {
    /// Hint accepted; the host joins out-of-band and confirmation comes via
    /// the connectivity channel.
    Accepted,
    /// Request issued; outcomes arrive on the join channel.
    Pending,
}

pub struct SuggestionStrategy {
    host: Arc<dyn SuggestionHost>,
    registered: bool,
}

pub struct SpecifierStrategy {
    host: Arc<dyn SpecifierHost>,
    registration: Option<RegistrationId>,
}

/// Polymorphic join capability; exactly one variant is active per attempt.
pub enum JoinStrategy {
    Suggestion(SuggestionStrategy),
    Specifier(SpecifierStrategy),
}

impl JoinStrategy {
    pub fn suggestion(host: Arc<dyn SuggestionHost>) -> Self {
        JoinStrategy::Suggestion(SuggestionStrategy { host, registered: false })
    }

    pub fn specifier(host: Arc<dyn SpecifierHost>) -> Self {
        JoinStrategy::Specifier(SpecifierStrategy { host, registration: None })
    }

    /// The capability subset this variant needs from the permission gate.
    pub fn required_capabilities(&self) -> &'static [Capability] {
        match self {
            JoinStrategy::Suggestion(_) => {
                &[Capability::LocationAccess, Capability::WifiStateWrite]
            }
            JoinStrategy::Specifier(_) => &[
                Capability::LocationAccess,
                Capability::WifiStateRead,
                Capability::WifiStateWrite,
            ],
        }
    }

    /// Kick off the join. Suggestion rejection surfaces as `JoinRejected`.
    ///
    /// Registration is idempotent: an outstanding imperative registration is
    /// released before a new one is issued, so listeners never stack.
    pub async fn begin(
        &mut self,
        target: &TargetNetwork,
        events: mpsc::Sender<JoinOutcome>,
    ) -> Result<BeginStatus, OnboardError> {
        match self {
            JoinStrategy::Suggestion(s) => match s.host.add(target).await? {
                SuggestionStatus::Accepted => {
                    s.registered = true;
                    Ok(BeginStatus::Accepted)
                }
                SuggestionStatus::Rejected(code) => Err(OnboardError::JoinRejected(code)),
            },
            JoinStrategy::Specifier(s) => {
                if let Some(previous) = s.registration.take() {
                    s.host.release(previous).await;
                }
                let id = s.host.request(target, events).await?;
                s.registration = Some(id);
                Ok(BeginStatus::Pending)
            }
        }
    }

    pub async fn bind(&self, handle: &NetworkHandle) -> Result<(), OnboardError> {
        match self {
            JoinStrategy::Suggestion(_) => Ok(()),
            JoinStrategy::Specifier(s) => s.host.bind(handle).await,
        }
    }

    /// Release listener registrations after a successful onboarding. The
    /// suggestion profile stays: removing it would drop the network the
    /// flow just joined.
    pub async fn conclude(&mut self) {
        match self {
            JoinStrategy::Suggestion(s) => {
                s.registered = false;
            }
            JoinStrategy::Specifier(s) => {
                if let Some(id) = s.registration.take() {
                    s.host.release(id).await;
                }
            }
        }
    }

    /// Revoke whatever registration is outstanding, including the
    /// declarative hint itself. Used on every abort path.
    pub async fn teardown(&mut self, target: &TargetNetwork) {
        match self {
            JoinStrategy::Suggestion(s) => {
                if s.registered {
                    s.registered = false;
                    if let Err(e) = s.host.remove(target).await {
                        tracing::warn!(err = %e, ssid = %target.ssid, "could not remove join suggestion");
                    }
                }
            }
            JoinStrategy::Specifier(s) => {
                if let Some(id) = s.registration.take() {
                    s.host.release(id).await;
                }
            }
        }
    }
}

/// Declarative join host: registers an autoconnect profile and leaves the
/// join to NetworkManager's own selection logic.
pub struct NmSuggestionHost {
    interface: Option<String>,
}

impl NmSuggestionHost {
    pub fn new(interface: Option<String>) -> Self {
        NmSuggestionHost { interface }
    }
}

#[async_trait]
impl SuggestionHost for NmSuggestionHost {
    /// # Command Executed
    /// ```bash
    /// nmcli connection add type wifi con-name <ssid> ifname <iface|*> ssid <ssid> \
    ///     wifi-sec.key-mgmt wpa-psk wifi-sec.psk <passphrase> connection.autoconnect yes
    /// ```
    async fn add(&self, target: &TargetNetwork) -> Result<SuggestionStatus, OnboardError> {
        let ifname = self.interface.as_deref().unwrap_or("*");
        let output = Command::new("nmcli")
            .args([
                "connection",
                "add",
                "type",
                "wifi",
                "con-name",
                target.ssid.as_str(),
                "ifname",
                ifname,
                "ssid",
                target.ssid.as_str(),
                "wifi-sec.key-mgmt",
                "wpa-psk",
                "wifi-sec.psk",
                target.passphrase.as_str(),
                "connection.autoconnect",
                "yes",
            ])
            .output()
            .await
            .map_err(|e| OnboardError::HostCommand(e.to_string()))?;

        if output.status.success() {
            Ok(SuggestionStatus::Accepted)
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            tracing::debug!(ssid = %target.ssid, %stderr, "suggestion rejected");
            Ok(SuggestionStatus::Rejected(output.status.code().unwrap_or(-1)))
        }
    }

    /// # Command Executed
    /// ```bash
    /// nmcli connection delete <ssid>
    /// ```
    async fn remove(&self, target: &TargetNetwork) -> Result<(), OnboardError> {
        let output = Command::new("nmcli")
            .args(["connection", "delete", target.ssid.as_str()])
            .output()
            .await
            .map_err(|e| OnboardError::HostCommand(e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(OnboardError::HostCommand(stderr.to_string()));
        }

        Ok(())
    }
}

/// Imperative join host: connects the named interface directly and watches
/// the device afterwards so a dropped network surfaces as `Lost`.
pub struct NmSpecifierHost {
    interface: String,
    next_id: AtomicU64,
    registrations: Mutex<HashMap<u64, JoinHandle<()>>>,
}

impl NmSpecifierHost {
    pub fn new(interface: String) -> Self {
        NmSpecifierHost {
            interface,
            next_id: AtomicU64::new(0),
            registrations: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl SpecifierHost for NmSpecifierHost {
    /// # Command Executed
    /// ```bash
    /// nmcli device wifi connect <ssid> password <passphrase> ifname <interface>
    /// ```
    async fn request(
        &self,
        target: &TargetNetwork,
        events: mpsc::Sender<JoinOutcome>,
    ) -> Result<RegistrationId, OnboardError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let interface = self.interface.clone();
        let ssid = target.ssid.clone();
        let passphrase = target.passphrase.clone();

        let task = tokio::spawn(async move {
            let output = Command::new("nmcli")
                .args([
                    "device",
                    "wifi",
                    "connect",
                    ssid.as_str(),
                    "password",
                    passphrase.as_str(),
                    "ifname",
                    interface.as_str(),
                ])
                .output()
                .await;

            let output = match output {
                Ok(output) => output,
                Err(e) => {
                    tracing::warn!(err = %e, "could not execute nmcli connect");
                    let _ = events.send(JoinOutcome::Unavailable).await;
                    return;
                }
            };

            if !output.status.success() {
                // Error message from stderr (preferred) or stdout
                let stderr = String::from_utf8_lossy(&output.stderr);
                let stdout = String::from_utf8_lossy(&output.stdout);
                let message = if stderr.is_empty() { stdout } else { stderr };
                tracing::debug!(%ssid, %message, "imperative join failed");
                let _ = events.send(JoinOutcome::Unavailable).await;
                return;
            }

            let handle = NetworkHandle::new(&interface);
            if events.send(JoinOutcome::Joined(handle.clone())).await.is_err() {
                return;
            }

            // Watch for the joined network disappearing
            loop {
                tokio::time::sleep(WATCH_INTERVAL).await;
                match device_state(&interface).await {
                    Some(state) if state.starts_with("100") => {}
                    _ => {
                        let _ = events.send(JoinOutcome::Lost(handle)).await;
                        return;
                    }
                }
            }
        });

        self.registrations.lock().await.insert(id, task);
        Ok(RegistrationId(id))
    }

    async fn release(&self, id: RegistrationId) {
        if let Some(task) = self.registrations.lock().await.remove(&id.0) {
            task.abort();
        }
    }

    /// # Command Executed
    /// ```bash
    /// nmcli device modify <handle> ipv4.route-metric 50
    /// ```
    async fn bind(&self, handle: &NetworkHandle) -> Result<(), OnboardError> {
        let metric = BIND_ROUTE_METRIC.to_string();
        let output = Command::new("nmcli")
            .args([
                "device",
                "modify",
                handle.0.as_str(),
                "ipv4.route-metric",
                metric.as_str(),
            ])
            .output()
            .await
            .map_err(|e| OnboardError::HostCommand(e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(OnboardError::HostCommand(stderr.to_string()));
        }

        Ok(())
    }
}

/// Read the device state field, e.g. `100 (connected)`.
///
/// # Command Executed
/// ```bash
/// nmcli -t -f GENERAL.STATE device show <interface>
/// ```
async fn device_state(interface: &str) -> Option<String> {
    let output = Command::new("nmcli")
        .args(["-t", "-f", "GENERAL.STATE", "device", "show", interface])
        .output()
        .await
        .ok()?;

    if !output.status.success() {
        return None;
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    for line in stdout.lines() {
        let parts: Vec<&str> = line.splitn(2, ':').collect();
        if parts.len() == 2 && parts[0] == "GENERAL.STATE" {
            return Some(parts[1].to_string());
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_requires_non_empty_ssid() {
        assert!(TargetNetwork::new("", "12345678").is_err());
    }

    #[test]
    fn target_enforces_wpa2_passphrase_length() {
        assert!(TargetNetwork::new("ESP32_Config", "1234567").is_err());
        assert!(TargetNetwork::new("ESP32_Config", "12345678").is_ok());
        assert!(TargetNetwork::new("ESP32_Config", "x".repeat(63)).is_ok());
        assert!(TargetNetwork::new("ESP32_Config", "x".repeat(64)).is_err());
    }

    #[test]
    fn parses_nmcli_version_line() {
        assert_eq!(parse_nm_version("nmcli tool, version 1.42.4"), Some((1, 42)));
        assert_eq!(parse_nm_version("nmcli tool, version 1.16.0\n"), Some((1, 16)));
        assert_eq!(parse_nm_version("garbage"), None);
    }

    #[test]
    fn tier_selection_is_deterministic() {
        assert_eq!(tier_for(Some((1, 42))), HostTier::Suggestion);
        assert_eq!(tier_for(Some((1, 16))), HostTier::Suggestion);
        assert_eq!(tier_for(Some((1, 14))), HostTier::Specifier);
        assert_eq!(tier_for(Some((0, 9))), HostTier::Specifier);
        assert_eq!(tier_for(None), HostTier::Specifier);
    }

    struct CountingSpecifierHost {
        requests: AtomicU64,
        releases: Mutex<Vec<RegistrationId>>,
    }

    impl CountingSpecifierHost {
        fn new() -> Self {
            CountingSpecifierHost {
                requests: AtomicU64::new(0),
                releases: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl SpecifierHost for CountingSpecifierHost {
        async fn request(
            &self,
            _target: &TargetNetwork,
            _events: mpsc::Sender<JoinOutcome>,
        ) -> Result<RegistrationId, OnboardError> {
            let id = self.requests.fetch_add(1, Ordering::SeqCst);
            Ok(RegistrationId(id))
        }

        async fn release(&self, id: RegistrationId) {
            self.releases.lock().await.push(id);
        }

        async fn bind(&self, _handle: &NetworkHandle) -> Result<(), OnboardError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn reissued_request_revokes_the_previous_registration() {
        let host = Arc::new(CountingSpecifierHost::new());
        let mut strategy = JoinStrategy::specifier(host.clone());
        let target = TargetNetwork::new("ESP32_Config", "12345678").unwrap();
        let (tx, _rx) = mpsc::channel(4);

        strategy.begin(&target, tx.clone()).await.unwrap();
        strategy.begin(&target, tx.clone()).await.unwrap();

        assert_eq!(host.requests.load(Ordering::SeqCst), 2);
        assert_eq!(&*host.releases.lock().await, &[RegistrationId(0)]);

        strategy.teardown(&target).await;
        assert_eq!(
            &*host.releases.lock().await,
            &[RegistrationId(0), RegistrationId(1)]
        );
    }

    struct RejectingSuggestionHost;

    #[async_trait]
    impl SuggestionHost for RejectingSuggestionHost {
        async fn add(&self, _target: &TargetNetwork) -> Result<SuggestionStatus, OnboardError> {
            Ok(SuggestionStatus::Rejected(4))
        }

        async fn remove(&self, _target: &TargetNetwork) -> Result<(), OnboardError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn rejected_suggestion_surfaces_the_status_code() {
        let mut strategy = JoinStrategy::suggestion(Arc::new(RejectingSuggestionHost));
        let target = TargetNetwork::new("ESP32_Config", "12345678").unwrap();
        let (tx, _rx) = mpsc::channel(4);

        let err = strategy.begin(&target, tx).await.unwrap_err();
        assert!(matches!(err, OnboardError::JoinRejected(4)));
    }

    #[test]
    fn capability_sets_differ_per_variant() {
        let suggestion = JoinStrategy::suggestion(Arc::new(RejectingSuggestionHost));
        let specifier = JoinStrategy::specifier(Arc::new(CountingSpecifierHost::new()));

        assert_eq!(suggestion.required_capabilities().len(), 2);
        assert_eq!(specifier.required_capabilities().len(), 3);
    }
}
