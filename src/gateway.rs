//! Gateway address resolution.
//!
//! Resolves the IPv4 gateway of the active wireless network from the kernel
//! route table at `/proc/net/route`. The table stores each address as a
//! 32-bit value with the least-significant byte first, so a raw gateway of
//! `0x0101A8C0` reads back as `192.168.1.1`.
//!
//! Resolution is a pure read with no caching: the gateway can change across
//! reassociation, so callers re-resolve on every connectivity snapshot.

use std::fs;
use std::net::Ipv4Addr;

use crate::interface;

const ROUTE_TABLE: &str = "/proc/net/route";

// RTF_UP | RTF_GATEWAY
const GATEWAY_FLAGS: u32 = 0x0003;

/// Source of the active network's IPv4 gateway address.
pub trait GatewayResolver: Send + Sync {
    /// Returns `None` when no lease information is available, e.g. when the
    /// host is not currently on a DHCP-configured wireless network.
    fn resolve(&self) -> Option<Ipv4Addr>;
}

/// Decode a raw 32-bit lease gateway into dotted-quad form.
///
/// Octet order is least-significant byte first.
pub fn decode_gateway(raw: u32) -> Ipv4Addr {
    Ipv4Addr::new(
        (raw & 0xff) as u8,
        ((raw >> 8) & 0xff) as u8,
        ((raw >> 16) & 0xff) as u8,
        ((raw >> 24) & 0xff) as u8,
    )
}

/// Resolver backed by the kernel route table.
///
/// When bound to an interface, only that interface's default route is
/// considered; otherwise any wireless interface's default route qualifies.
pub struct LeaseTableResolver {
    interface: Option<String>,
}

impl LeaseTableResolver {
    pub fn new(interface: Option<String>) -> Self {
        LeaseTableResolver { interface }
    }
}

impl GatewayResolver for LeaseTableResolver {
    fn resolve(&self) -> Option<Ipv4Addr> {
        let table = fs::read_to_string(ROUTE_TABLE).ok()?;
        let accept = |iface: &str| match self.interface.as_deref() {
            Some(bound) => iface == bound,
            None => interface::is_wireless(iface),
        };
        default_gateway(&table, &accept).map(decode_gateway)
    }
}

/// Extract the raw gateway word of the first matching default route.
///
/// Rows are `Iface Destination Gateway Flags ...` with addresses as
/// little-endian hex. A default route has destination `00000000` and both
/// RTF_UP and RTF_GATEWAY set.
fn default_gateway(table: &str, accept: &dyn Fn(&str) -> bool) -> Option<u32> {
    for line in table.lines().skip(1) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 4 {
            continue;
        }

        let (iface, destination, gateway, flags) = (fields[0], fields[1], fields[2], fields[3]);
        if destination != "00000000" || !accept(iface) {
            continue;
        }

        let flags = u32::from_str_radix(flags, 16).unwrap_or(0);
        if flags & GATEWAY_FLAGS != GATEWAY_FLAGS {
            continue;
        }

        match u32::from_str_radix(gateway, 16) {
            Ok(raw) if raw != 0 => return Some(raw),
            _ => continue,
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
Iface\tDestination\tGateway \tFlags\tRefCnt\tUse\tMetric\tMask\t\tMTU\tWindow\tIRTT
eth0\t00000000\t010AA8C0\t0003\t0\t0\t100\t00000000\t0\t0\t0
wlan0\t00000000\t0104A8C0\t0003\t0\t0\t600\t00000000\t0\t0\t0
wlan0\t0004A8C0\t00000000\t0001\t0\t0\t600\t00FFFFFF\t0\t0\t0
";

    #[test]
    fn decodes_least_significant_byte_first() {
        assert_eq!(decode_gateway(0x0101A8C0), Ipv4Addr::new(192, 168, 1, 1));
    }

    #[test]
    fn finds_default_route_for_bound_interface() {
        let raw = default_gateway(SAMPLE, &|iface| iface == "wlan0").unwrap();
        assert_eq!(decode_gateway(raw), Ipv4Addr::new(192, 168, 4, 1));
    }

    #[test]
    fn skips_interfaces_the_filter_rejects() {
        assert_eq!(default_gateway(SAMPLE, &|_| false), None);
    }

    #[test]
    fn ignores_non_default_and_flagless_rows() {
        // The wlan0 subnet row has destination != 0 and no RTF_GATEWAY
        let raw = default_gateway(SAMPLE, &|iface| iface == "wlan0").unwrap();
        assert_eq!(raw, 0x0104A8C0);
    }

    #[test]
    fn empty_table_yields_none() {
        assert_eq!(default_gateway("Iface\tDestination\tGateway\n", &|_| true), None);
    }
}
