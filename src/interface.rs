use anyhow::{Context, Result};
use std::path::Path;
use std::process::Command;

use crate::error::OnboardError;

#[derive(Debug, Clone)]
pub struct WifiInterface {
    pub name: String,
    pub state: String,
}

/// List all WiFi interfaces known to NetworkManager
pub fn list_wifi_interfaces() -> Result<Vec<WifiInterface>> {
    let output = Command::new("nmcli")
        .args(["-t", "-f", "DEVICE,TYPE,STATE", "device"])
        .output()
        .context("Failed to execute nmcli")?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(OnboardError::HostCommand(stderr.to_string()).into());
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    let mut interfaces = Vec::new();

    for line in stdout.lines() {
        let parts: Vec<&str> = line.split(':').collect();
        if parts.len() >= 3 && parts[1] == "wifi" {
            interfaces.push(WifiInterface {
                name: parts[0].to_string(),
                state: parts[2].to_string(),
            });
        }
    }

    Ok(interfaces)
}

/// Check whether a network interface is wireless by examining sysfs
pub fn is_wireless(interface_name: &str) -> bool {
    // A wireless device exposes a `wireless` subdirectory
    let wireless_path = format!("/sys/class/net/{}/wireless", interface_name);
    if Path::new(&wireless_path).exists() {
        return true;
    }

    // Alternative: check uevent for the wlan device type
    let uevent_path = format!("/sys/class/net/{}/uevent", interface_name);
    if let Ok(content) = std::fs::read_to_string(&uevent_path) {
        if content.lines().any(|l| l == "DEVTYPE=wlan") {
            return true;
        }
    }

    false
}

/// Find the first WiFi interface on the host
pub fn find_wifi_interface() -> Result<WifiInterface> {
    let interfaces = list_wifi_interfaces()?;

    interfaces
        .into_iter()
        .next()
        .ok_or_else(|| OnboardError::HostCommand("No WiFi interface found".to_string()).into())
}

/// Get a specific interface by name, verifying it's a WiFi interface
pub fn get_interface(name: &str) -> Result<WifiInterface> {
    let interfaces = list_wifi_interfaces()?;

    interfaces
        .into_iter()
        .find(|i| i.name == name)
        .ok_or_else(|| {
            OnboardError::HostCommand(format!("Interface '{}' is not a WiFi device", name)).into()
        })
}

/// Resolve interface: use provided name or auto-detect the first WiFi interface
pub fn resolve_interface(interface: Option<&str>) -> Result<WifiInterface> {
    match interface {
        Some(name) => get_interface(name),
        None => find_wifi_interface(),
    }
}
