// Network-visible address discovery for LAN stream URLs.

use std::net::{IpAddr, Ipv4Addr};

use tokio::net::UdpSocket;
use tracing::debug;

/// Routing a UDP socket picks the interface used for outbound traffic; no packet is sent.
const PROBE_ADDR: &str = "8.8.8.8:80";

/// Address other hosts on the LAN can reach us on, falling back to loopback.
pub async fn network_address() -> IpAddr {
    match probe().await {
        Ok(ip) if !ip.is_unspecified() => ip,
        Ok(_) => IpAddr::V4(Ipv4Addr::LOCALHOST),
        Err(e) => {
            debug!("network address probe failed: {}", e);
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        }
    }
}

async fn probe() -> std::io::Result<IpAddr> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
    socket.connect(PROBE_ADDR).await?;
    Ok(socket.local_addr()?.ip())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_network_address_is_concrete() {
        assert!(!network_address().await.is_unspecified());
    }
}
