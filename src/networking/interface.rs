use if_addrs::{get_if_addrs, IfAddr};
use local_ip_address::local_ip;
use log::{debug, warn};
use std::net::{IpAddr, Ipv4Addr};

/// Best-effort outbound-facing local IP, falling back to loopback.
///
/// Only used to recognise our own announcements, so failure is never fatal.
pub fn local_address() -> IpAddr {
    match local_ip() {
        Ok(ip) => {
            debug!("Resolved local address: {}", ip);
            ip
        }
        Err(err) => {
            warn!("Failed to determine local IP ({}), falling back to loopback", err);
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        }
    }
}

/// Subnet broadcast address of the interface that owns `local`.
///
/// Falls back to the limited broadcast address when no interface matches.
pub fn broadcast_address(local: IpAddr) -> Ipv4Addr {
    let interfaces = match get_if_addrs() {
        Ok(interfaces) => interfaces,
        Err(err) => {
            warn!("Failed to get network interfaces: {}", err);
            return Ipv4Addr::BROADCAST;
        }
    };

    for interface in interfaces {
        if let IfAddr::V4(addr) = &interface.addr {
            if IpAddr::V4(addr.ip) != local {
                continue;
            }
            let broadcast = addr
                .broadcast
                .unwrap_or_else(|| subnet_broadcast(addr.ip, addr.netmask));
            debug!("Using broadcast address {} on interface {}", broadcast, interface.name);
            return broadcast;
        }
    }

    debug!("No interface owns {}, using limited broadcast", local);
    Ipv4Addr::BROADCAST
}

fn subnet_broadcast(ip: Ipv4Addr, netmask: Ipv4Addr) -> Ipv4Addr {
    Ipv4Addr::from(u32::from(ip) | !u32::from(netmask))
}
