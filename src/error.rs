use thiserror::Error;

#[derive(Error, Debug)]
pub enum OnboardError {
    #[error("Permissions required to connect to Wi-Fi were denied")]
    PermissionDenied,

    #[error("A permission request is already in flight")]
    RequestInFlight,

    #[error("An onboarding flow is already in progress")]
    FlowInFlight,

    #[error("Failed to add suggestion. Status code: {0}")]
    JoinRejected(i32),

    #[error("Target network is unavailable")]
    JoinUnavailable,

    #[error("Target network was lost before onboarding completed")]
    JoinLost,

    #[error("No gateway could be resolved for the active network")]
    GatewayUnresolvable,

    #[error("Failed to persist onboarding state: {0}")]
    StoreWriteFailed(String),

    #[error("Invalid target network: {0}")]
    InvalidTarget(String),

    #[error("Failed to execute nmcli: {0}")]
    HostCommand(String),
}
