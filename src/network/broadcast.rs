//! UDP limited-broadcast helpers

use std::io;
use std::net::Ipv4Addr;
use tokio::net::UdpSocket;

/// IPv4 addresses of every interface that is up, multicast capable and not
/// loopback
#[cfg(unix)]
pub fn broadcast_interfaces() -> Vec<Ipv4Addr> {
    use nix::ifaddrs::getifaddrs;
    use nix::net::if_::InterfaceFlags;
    use std::net::SocketAddrV4;

    let addrs = match getifaddrs() {
        Ok(addrs) => addrs,
        Err(e) => {
            tracing::warn!("Failed to enumerate network interfaces: {}", e);
            return Vec::new();
        }
    };

    addrs
        .filter(|ifa| {
            ifa.flags.contains(InterfaceFlags::IFF_UP)
                && ifa.flags.contains(InterfaceFlags::IFF_MULTICAST)
                && !ifa.flags.contains(InterfaceFlags::IFF_LOOPBACK)
        })
        .filter_map(|ifa| {
            let sin = ifa.address.as_ref()?.as_sockaddr_in().copied()?;
            let addr = *SocketAddrV4::from(sin).ip();
            tracing::trace!("Broadcast interface {}: {}", ifa.interface_name, addr);
            Some(addr)
        })
        .filter(|addr| !addr.is_loopback())
        .collect()
}

#[cfg(not(unix))]
pub fn broadcast_interfaces() -> Vec<Ipv4Addr> {
    tracing::warn!("Interface enumeration not supported on this platform");
    Vec::new()
}

/// Send one datagram to the limited-broadcast address from `local`
pub async fn send_broadcast_datagram(local: Ipv4Addr, port: u16, data: &[u8]) -> io::Result<usize> {
    let socket = UdpSocket::bind((local, 0)).await?;
    socket.set_broadcast(true)?;
    socket.send_to(data, (Ipv4Addr::BROADCAST, port)).await
}
