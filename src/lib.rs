//! Wi-Fi Onboarding Connector
//!
//! This library drives a host through joining a known wireless network,
//! confirms the join succeeded, resolves the network's gateway address,
//! classifies internet reachability, and hands off exactly once to an
//! external browser pointed at the gateway's captive-portal login page.
//! Once onboarding has completed, the flow is skipped on every later start,
//! surviving process restarts.
//!
//! # Modules
//!
//! - [`config`] - Configuration management for saved networks and settings
//! - [`permission`] - Capability checks and batched permission requests
//! - [`join`] - Declarative and imperative network join strategies
//! - [`connectivity`] - Connectivity-change observation and classification
//! - [`gateway`] - Gateway address resolution from DHCP lease state
//! - [`store`] - Durable record of onboarding completion
//! - [`browse`] - Browser handoff to the captive-portal login page
//! - [`flow`] - The onboarding state machine tying it all together
//! - [`interface`] - WiFi interface discovery and resolution
//! - [`error`] - Custom error types for the library
//!
//! # Example Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use wifi_onboard::{
//!     FileStore, FlowHosts, HandoffController, JoinStrategy, PermissionGate, TargetNetwork,
//!     DEFAULT_SETTLE_DELAY,
//! };
//! use wifi_onboard::connectivity::NmConnectivityHost;
//! use wifi_onboard::gateway::LeaseTableResolver;
//! use wifi_onboard::join::NmSuggestionHost;
//! use wifi_onboard::permission::NmPermissionHost;
//! use wifi_onboard::browse::SystemBrowser;
//!
//! # async fn run() -> anyhow::Result<()> {
//! let target = TargetNetwork::new("ESP32_Config", "12345678")?;
//! let hosts = FlowHosts {
//!     gate: PermissionGate::new(Arc::new(NmPermissionHost)),
//!     strategy: JoinStrategy::suggestion(Arc::new(NmSuggestionHost::new(None))),
//!     connectivity: Arc::new(NmConnectivityHost::new(None, None)),
//!     resolver: Arc::new(LeaseTableResolver::new(None)),
//!     store: Arc::new(FileStore::new(FileStore::default_path()?)),
//!     browser: Arc::new(SystemBrowser),
//! };
//!
//! let controller = HandoffController::new(target, hosts, DEFAULT_SETTLE_DELAY);
//! let report = controller.start().await?;
//! println!("{}", report.state);
//! # Ok(())
//! # }
//! ```

/// Configuration module for managing saved networks and application settings.
/// Handles reading/writing TOML config files and credential storage.
pub mod config;

/// Browser handoff module. Derives the login URL and invokes the external
/// browsing agent.
pub mod browse;

/// Connectivity observation module. Classifies the active network's
/// transport and internet reachability on every change notification.
pub mod connectivity;

/// Error module defining custom error types for the library.
/// Uses `thiserror` for ergonomic error handling.
pub mod error;

/// Flow module containing the onboarding state machine and its single-fire
/// handoff guarantee.
pub mod flow;

/// Gateway module resolving the active network's IPv4 gateway from DHCP
/// lease state.
pub mod gateway;

/// Interface module for WiFi adapter discovery and resolution.
pub mod interface;

/// Join module with the declarative (suggestion) and imperative (specifier)
/// join strategies.
pub mod join;

/// Permission module gating network operations on host capabilities.
pub mod permission;

/// Store module persisting whether onboarding has completed once.
pub mod store;

// Re-export the pieces an embedder wires together for convenient access
pub use browse::{BrowseAction, SystemBrowser, login_url};
pub use connectivity::{ConnectivitySnapshot, Transport};
pub use error::OnboardError;
pub use flow::{
    AbortReason, DEFAULT_SETTLE_DELAY, FlowHosts, FlowReport, FlowState, HandoffController,
};
pub use gateway::{GatewayResolver, LeaseTableResolver, decode_gateway};
pub use join::{HostTier, JoinOutcome, JoinStrategy, NetworkHandle, TargetNetwork};
pub use permission::{Capability, PermissionGate};
pub use store::{FileStore, MemoryStore, OnboardingStateStore};
