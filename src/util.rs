//! Host helpers: local address detection, default gateway, PID file.

use std::fs;
use std::io::{self, Write};
use std::net::{IpAddr, Ipv4Addr, UdpSocket};
use std::path::Path;

use log::warn;

// ── IP address ────────────────────────────────────────────────────────────────

/// Detect the primary outbound IPv4 address by connecting a UDP socket
/// (no packets are sent). `None` when there is no route.
pub fn get_own_ip() -> Option<Ipv4Addr> {
    let sock = UdpSocket::bind("0.0.0.0:0").ok()?;
    sock.connect("8.8.8.8:80").ok()?;
    match sock.local_addr().ok()?.ip() {
        IpAddr::V4(ip) if !ip.is_unspecified() => Some(ip),
        _ => None,
    }
}

/// First three octets of the local /24, the default discovery range.
pub fn local_network_prefix() -> Option<[u8; 3]> {
    get_own_ip().map(|ip| {
        let [a, b, c, _] = ip.octets();
        [a, b, c]
    })
}

/// Read the default gateway from `/proc/net/route`.
pub fn get_default_gateway() -> Option<Ipv4Addr> {
    let content = fs::read_to_string("/proc/net/route").ok()?;
    parse_default_gateway(&content)
}

fn parse_default_gateway(route_table: &str) -> Option<Ipv4Addr> {
    for line in route_table.lines().skip(1) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        // Iface Destination Gateway Flags ...
        if fields.len() >= 3 && fields[1] == "00000000" {
            if let Ok(hex) = u32::from_str_radix(fields[2], 16) {
                let [a, b, c, d] = hex.to_le_bytes();
                return Some(Ipv4Addr::new(a, b, c, d));
            }
        }
    }
    None
}

// ── PID file ──────────────────────────────────────────────────────────────────

/// Write the current process PID to `path`.
pub fn write_pid_file(path: &Path) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut f = fs::File::create(path)?;
    writeln!(f, "{}", std::process::id())?;
    Ok(())
}

/// Remove the PID file, logging a warning on failure.
pub fn remove_pid_file(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        warn!("failed to remove PID file {}: {e}", path.display());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gateway_from_route_table() {
        let table = "Iface\tDestination\tGateway \tFlags\tRefCnt\tUse\tMetric\tMask\n\
                     eth0\t00000000\t0101A8C0\t0003\t0\t0\t100\t00000000\n\
                     eth0\t0001A8C0\t00000000\t0001\t0\t0\t100\t00FFFFFF\n";
        assert_eq!(parse_default_gateway(table), Some(Ipv4Addr::new(192, 168, 1, 1)));
        assert_eq!(parse_default_gateway("Iface\tDestination\n"), None);
    }

    #[test]
    fn pid_file_round_trip() {
        let path = std::env::temp_dir().join(format!("classcam-{}.pid", uuid::Uuid::new_v4()));
        write_pid_file(&path).unwrap();
        let pid: u32 = fs::read_to_string(&path).unwrap().trim().parse().unwrap();
        assert_eq!(pid, std::process::id());
        remove_pid_file(&path);
        assert!(!path.exists());
    }
}
