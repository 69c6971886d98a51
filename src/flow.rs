//! Onboarding handoff controller.
//!
//! Drives the end-to-end flow: prior-completion check, permission
//! acquisition, network join, connectivity observation, gateway resolution,
//! and the single browser handoff. Permission results, join outcomes and
//! connectivity snapshots all arrive on unspecified delivery contexts; the
//! controller funnels every one of them through one `select!` loop, which is
//! the single serialization point for state transitions.
//!
//! The browser handoff and the persisted completion write are gated by a
//! single-fire latch: however many snapshots carry a resolvable gateway,
//! they fire at most once per attempt. Once onboarding has completed once,
//! later starts short-circuit straight to `Done`.

use std::fmt;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;

use crate::browse::{BrowseAction, login_url};
use crate::connectivity::{ConnectivityHost, ConnectivityObserver, ConnectivitySnapshot};
use crate::error::OnboardError;
use crate::gateway::GatewayResolver;
use crate::join::{BeginStatus, JoinOutcome, JoinStrategy, TargetNetwork};
use crate::permission::PermissionGate;
use crate::store::OnboardingStateStore;

/// How long the specifier path waits after a join signal before trusting
/// the join. The legacy path has no strong completion signal, so this is a
/// policy knob, not a correctness guarantee.
pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_secs(5);

/// Why an onboarding attempt terminated without a handoff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbortReason {
    PermissionDenied,
    JoinRejected(i32),
    JoinUnavailable,
    JoinLost,
    Cancelled,
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AbortReason::PermissionDenied => {
                write!(f, "Permissions required to connect to Wi-Fi")
            }
            AbortReason::JoinRejected(code) => {
                write!(f, "Failed to add suggestion. Status code: {}", code)
            }
            AbortReason::JoinUnavailable => write!(f, "Target network is unavailable"),
            AbortReason::JoinLost => write!(f, "Target network was lost"),
            AbortReason::Cancelled => write!(f, "Onboarding cancelled"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlowState {
    Idle,
    CheckingPriorCompletion,
    RequestingPermission,
    Joining,
    AwaitingConnectivity,
    ResolvingReachability,
    HandoffFired,
    Done,
    Aborted(AbortReason),
}

impl FlowState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, FlowState::Done | FlowState::Aborted(_))
    }
}

impl fmt::Display for FlowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlowState::Idle => write!(f, "Idle"),
            FlowState::CheckingPriorCompletion => write!(f, "Checking previous onboarding..."),
            FlowState::RequestingPermission => write!(f, "Checking permissions..."),
            FlowState::Joining => write!(f, "Requesting to join the network..."),
            FlowState::AwaitingConnectivity => write!(f, "Waiting for connection..."),
            FlowState::ResolvingReachability => write!(f, "Checking internet access..."),
            FlowState::HandoffFired => write!(f, "Opening the network login page..."),
            FlowState::Done => write!(f, "Onboarding complete"),
            FlowState::Aborted(reason) => write!(f, "{}", reason),
        }
    }
}

/// What a finished attempt looked like.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowReport {
    pub state: FlowState,
    pub handoff_url: Option<String>,
    /// False after a successful handoff means the completion record did not
    /// persist; the next start will repeat the flow, which is safe.
    pub store_persisted: bool,
    /// Internet classification of the snapshot that drove the handoff.
    pub has_internet: Option<bool>,
}

/// Everything the controller talks to. Each field is an injected seam so
/// the flow is testable with in-memory fakes.
pub struct FlowHosts {
    pub gate: PermissionGate,
    pub strategy: JoinStrategy,
    pub connectivity: Arc<dyn ConnectivityHost>,
    pub resolver: Arc<dyn GatewayResolver>,
    pub store: Arc<dyn OnboardingStateStore>,
    pub browser: Arc<dyn BrowseAction>,
}

struct FlowMachine {
    strategy: JoinStrategy,
    observer: ConnectivityObserver,
}

pub struct HandoffController {
    target: TargetNetwork,
    gate: PermissionGate,
    machine: Mutex<FlowMachine>,
    store: Arc<dyn OnboardingStateStore>,
    browser: Arc<dyn BrowseAction>,
    settle_delay: Duration,
    state: StdMutex<FlowState>,
    cancel: CancellationToken,
}

impl HandoffController {
    pub fn new(target: TargetNetwork, hosts: FlowHosts, settle_delay: Duration) -> Self {
        let observer = ConnectivityObserver::new(hosts.connectivity, hosts.resolver);
        HandoffController {
            target,
            gate: hosts.gate,
            machine: Mutex::new(FlowMachine { strategy: hosts.strategy, observer }),
            store: hosts.store,
            browser: hosts.browser,
            settle_delay,
            state: StdMutex::new(FlowState::Idle),
            cancel: CancellationToken::new(),
        }
    }

    pub fn state(&self) -> FlowState {
        self.state.lock().unwrap().clone()
    }

    /// Cancel the running flow. Synchronous; the flow observes the token,
    /// unregisters every outstanding registration and subscription, and
    /// terminates in `Aborted(Cancelled)`. Callbacks that were already in
    /// flight land in dropped channels and are ignored.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    fn set_state(&self, next: FlowState) {
        let mut state = self.state.lock().unwrap();
        tracing::debug!(from = %state, to = %next, "flow transition");
        *state = next;
    }

    /// Run the flow to a terminal state.
    ///
    /// Aborts come back as `Ok` with `FlowState::Aborted(reason)` so every
    /// reason keeps its own status string; `Err` is reserved for protocol
    /// misuse (`FlowInFlight`) and host command failures.
    pub async fn start(&self) -> Result<FlowReport, OnboardError> {
        {
            let mut state = self.state.lock().unwrap();
            match *state {
                FlowState::Idle | FlowState::Done | FlowState::Aborted(_) => {}
                _ => return Err(OnboardError::FlowInFlight),
            }
            *state = FlowState::CheckingPriorCompletion;
        }

        // Idempotent short-circuit across restarts: read once, skip everything
        if self.store.has_completed_once() {
            tracing::info!("onboarding already completed once; nothing to do");
            self.set_state(FlowState::Done);
            return Ok(FlowReport {
                state: FlowState::Done,
                handoff_url: None,
                store_persisted: true,
                has_internet: None,
            });
        }

        // Held for the whole attempt; every callback below funnels through
        // this task
        let mut machine = self.machine.lock().await;
        let machine = &mut *machine;

        self.set_state(FlowState::RequestingPermission);
        let ensured = tokio::select! {
            _ = self.cancel.cancelled() => {
                return Ok(self.abort(machine, AbortReason::Cancelled).await);
            }
            result = self.gate.ensure(machine.strategy.required_capabilities()) => result,
        };
        match ensured {
            Ok(()) => {}
            Err(OnboardError::PermissionDenied) => {
                return Ok(self.abort(machine, AbortReason::PermissionDenied).await);
            }
            Err(e) => return self.fail(machine, e).await,
        }

        self.set_state(FlowState::Joining);
        let (join_tx, mut join_rx) = mpsc::channel::<JoinOutcome>(8);
        let (snap_tx, mut snap_rx) = mpsc::channel::<ConnectivitySnapshot>(8);

        match machine.strategy.begin(&self.target, join_tx).await {
            Ok(BeginStatus::Accepted) => {
                // Declarative path: the host joins out-of-band, confirmation
                // arrives on the connectivity channel
                if let Err(e) = machine.observer.register(snap_tx.clone()).await {
                    return self.fail(machine, e).await;
                }
                self.set_state(FlowState::AwaitingConnectivity);
            }
            Ok(BeginStatus::Pending) => {}
            Err(OnboardError::JoinRejected(code)) => {
                return Ok(self.abort(machine, AbortReason::JoinRejected(code)).await);
            }
            Err(e) => return self.fail(machine, e).await,
        }

        // Settle timer for the specifier path; armed by its join signal
        let settle = tokio::time::sleep(Duration::ZERO);
        tokio::pin!(settle);
        let mut settle_armed = false;

        let mut handoff_fired = false;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    return Ok(self.abort(machine, AbortReason::Cancelled).await);
                }

                Some(outcome) = join_rx.recv() => match outcome {
                    JoinOutcome::Joined(handle) => {
                        if self.state() != FlowState::Joining {
                            continue;
                        }
                        // Bind immediately so resolution hits the target
                        // network, not a default route
                        if let Err(e) = machine.strategy.bind(&handle).await {
                            return self.fail(machine, e).await;
                        }
                        tracing::info!(network = %handle, "joined target network");
                        settle
                            .as_mut()
                            .reset(tokio::time::Instant::now() + self.settle_delay);
                        settle_armed = true;
                    }
                    JoinOutcome::Unavailable => {
                        return Ok(self.abort(machine, AbortReason::JoinUnavailable).await);
                    }
                    JoinOutcome::Lost(handle) => {
                        if !handoff_fired {
                            tracing::info!(network = %handle, "target network lost");
                            return Ok(self.abort(machine, AbortReason::JoinLost).await);
                        }
                    }
                },

                _ = &mut settle, if settle_armed => {
                    settle_armed = false;
                    // No stronger completion signal exists on this path;
                    // trust the join now and start watching connectivity
                    if let Err(e) = machine.observer.register(snap_tx.clone()).await {
                        return self.fail(machine, e).await;
                    }
                    self.set_state(FlowState::AwaitingConnectivity);
                }

                Some(snapshot) = snap_rx.recv() => {
                    if self.state() != FlowState::AwaitingConnectivity || handoff_fired {
                        continue;
                    }
                    let Some(gateway) = snapshot.gateway else {
                        // Not fatal: a gateway may appear on a later snapshot
                        tracing::debug!(reason = %OnboardError::GatewayUnresolvable, "still waiting");
                        continue;
                    };

                    self.set_state(FlowState::ResolvingReachability);

                    // Single-fire latch: the browse action and the completion
                    // write happen for at most one snapshot per attempt
                    handoff_fired = true;
                    let url = login_url(gateway);
                    tracing::info!(%url, has_internet = snapshot.has_internet, "handing off to browser");
                    self.browser.open_url(&url);
                    self.set_state(FlowState::HandoffFired);

                    let store_persisted = match self.store.mark_completed() {
                        Ok(()) => true,
                        Err(e) => {
                            // The handoff is not reversed; the next start
                            // repeats the flow, which is safe
                            tracing::warn!(err = %e, "handoff fired but completion write failed");
                            false
                        }
                    };

                    machine.strategy.conclude().await;
                    machine.observer.unregister().await;
                    self.set_state(FlowState::Done);

                    return Ok(FlowReport {
                        state: FlowState::Done,
                        handoff_url: Some(url),
                        store_persisted,
                        has_internet: Some(snapshot.has_internet),
                    });
                }
            }
        }
    }

    async fn abort(&self, machine: &mut FlowMachine, reason: AbortReason) -> FlowReport {
        self.teardown(machine).await;
        let state = FlowState::Aborted(reason);
        tracing::info!(status = %state, "onboarding aborted");
        self.set_state(state.clone());
        FlowReport {
            state,
            handoff_url: None,
            store_persisted: false,
            has_internet: None,
        }
    }

    /// Host-level failure: tear down and surface the error, leaving the
    /// machine restartable.
    async fn fail(
        &self,
        machine: &mut FlowMachine,
        error: OnboardError,
    ) -> Result<FlowReport, OnboardError> {
        self.teardown(machine).await;
        self.set_state(FlowState::Idle);
        Err(error)
    }

    async fn teardown(&self, machine: &mut FlowMachine) {
        machine.strategy.teardown(&self.target).await;
        machine.observer.unregister().await;
    }
}
