use std::net::{IpAddr, SocketAddr, ToSocketAddrs, UdpSocket};

use anyhow::Context;
use regex::Regex;
use tracing::Level;

use crate::exec::{ExecOptions, Executor};

const NFS_PORT: u16 = 2049;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouteInfo {
    pub gateway: Option<String>,
    pub device: Option<String>,
    pub source: Option<String>,
}

pub fn ip_address(host: &str, ipv6: bool) -> anyhow::Result<IpAddr> {
    let host = match host {
        "127.0.0.1" | "localhost" | "::1" => "",
        other => other,
    };
    if host.is_empty() {
        return egress_address(ipv6);
    }
    let addrs = (host, NFS_PORT)
        .to_socket_addrs()
        .with_context(|| format!("failed to resolve host {host}"))?;
    for addr in addrs {
        if addr.ip().is_loopback() {
            continue;
        }
        match (ipv6, addr) {
            (false, SocketAddr::V4(v4)) => return Ok(IpAddr::V4(*v4.ip())),
            (true, SocketAddr::V6(v6)) => return Ok(IpAddr::V6(*v6.ip())),
            _ => {}
        }
    }
    anyhow::bail!(
        "unable to get IP{} address for host {host}",
        if ipv6 { "v6" } else { "v4" }
    )
}

fn egress_address(ipv6: bool) -> anyhow::Result<IpAddr> {
    // A connected UDP socket resolves the egress address without sending
    // any packet.
    let (bind, probe) = if ipv6 {
        ("[::]:0", "[2001:4860:4860::8888]:53")
    } else {
        ("0.0.0.0:0", "8.8.8.8:53")
    };
    let probed = UdpSocket::bind(bind).and_then(|socket| {
        socket.connect(probe)?;
        socket.local_addr()
    });
    match probed {
        Ok(addr) => Ok(addr.ip()),
        Err(_) => {
            if let Ok(host) = std::env::var("HOSTNAME") {
                if let Ok(addr) = ip_address(&host, ipv6) {
                    return Ok(addr);
                }
            }
            // No egress route and no resolvable hostname; settle for
            // loopback so single-host runs still work.
            Ok(if ipv6 {
                IpAddr::V6(std::net::Ipv6Addr::LOCALHOST)
            } else {
                IpAddr::V4(std::net::Ipv4Addr::LOCALHOST)
            })
        }
    }
}

pub async fn route(exec: &Executor, ipaddr: &str) -> RouteInfo {
    let opts = ExecOptions::default()
        .at(Level::TRACE)
        .with_msg("Get routing info: ");
    match exec.run(&format!("ip route get {ipaddr}"), &opts).await {
        Ok(output) => parse_route(&output.stdout),
        Err(err) => {
            tracing::trace!(error = %err, "route lookup failed");
            RouteInfo::default()
        }
    }
}

pub fn parse_route(out: &str) -> RouteInfo {
    let Ok(re) = Regex::new(r"(\svia\s+(\S+))?\sdev\s+(\S+).*\ssrc\s+(\S+)") else {
        return RouteInfo::default();
    };
    match re.captures(out) {
        Some(caps) => RouteInfo {
            gateway: caps.get(2).map(|m| m.as_str().to_string()),
            device: caps.get(3).map(|m| m.as_str().to_string()),
            source: caps.get(4).map(|m| m.as_str().to_string()),
        },
        None => RouteInfo::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_route_with_gateway() {
        let out = "10.0.0.5 via 192.168.1.1 dev eth0 src 192.168.1.20 uid 1000\n";
        let info = parse_route(out);
        assert_eq!(info.gateway.as_deref(), Some("192.168.1.1"));
        assert_eq!(info.device.as_deref(), Some("eth0"));
        assert_eq!(info.source.as_deref(), Some("192.168.1.20"));
    }

    #[test]
    fn parse_route_direct() {
        let out = "192.168.1.7 dev wlan0 src 192.168.1.20 uid 1000\n";
        let info = parse_route(out);
        assert_eq!(info.gateway, None);
        assert_eq!(info.device.as_deref(), Some("wlan0"));
        assert_eq!(info.source.as_deref(), Some("192.168.1.20"));
    }

    #[test]
    fn parse_route_garbage_is_empty() {
        assert_eq!(parse_route("RTNETLINK answers: Network is unreachable"), RouteInfo::default());
    }

    #[test]
    fn local_ip_address_is_never_unspecified() {
        // Resolution can legitimately fail on a machine with no route at
        // all; when it succeeds the address must be usable in a filter.
        if let Ok(addr) = ip_address("", false) {
            assert!(!addr.is_unspecified());
        }
    }
}
