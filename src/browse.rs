//! Browser handoff.
//!
//! The connector does not speak the captive-portal protocol itself; once a
//! gateway is resolvable it hands a login URL to an external browsing agent
//! and is done.

use std::net::Ipv4Addr;
use std::process::Command;

/// Login URL served by the target network's gateway.
pub fn login_url(gateway: Ipv4Addr) -> String {
    format!("http://{}/login", gateway)
}

/// External browsing agent. Fire-and-forget; no return value is observed.
pub trait BrowseAction: Send + Sync {
    fn open_url(&self, url: &str);
}

/// Opens URLs with the desktop's default browser via `xdg-open`.
pub struct SystemBrowser;

impl BrowseAction for SystemBrowser {
    fn open_url(&self, url: &str) {
        if let Err(e) = Command::new("xdg-open").arg(url).spawn() {
            tracing::warn!(err = %e, url, "could not launch browser");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn login_url_is_gateway_rooted() {
        let url = login_url(Ipv4Addr::new(192, 168, 4, 1));
        assert_eq!(url, "http://192.168.4.1/login");
    }
}
