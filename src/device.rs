//! # Network device abstraction
//!
//! Reworked from the teacher's `device.rs`: the raw `NetworkDevice` trait
//! (arbitrary byte send/receive plus a stats/info block) is replaced by the
//! narrower surface the core actually exposes upward — raw frame
//! injection/transmission, UDP send with listener registration, and IP
//! routing — all reporting through [`crate::error::NetError`] instead of
//! redefining a parallel error enum.

use alloc::boxed::Box;
use alloc::vec::Vec;

use crate::error::{NetError, Reason};
use crate::ethernet::MacAddress;
use crate::ip::Ipv4Address;
use crate::udp::{ListenerRegistry, UdpListener};

/// A single configured interface: its link address, assigned IP, subnet
/// mask and default gateway (the fields DHCP fills in once bound).
#[derive(Debug, Clone, Copy)]
pub struct Interface {
    pub mac: MacAddress,
    pub ip: Ipv4Address,
    pub netmask: Ipv4Address,
    pub gateway: Ipv4Address,
}

impl Interface {
    pub const fn unconfigured(mac: MacAddress) -> Self {
        Self {
            mac,
            ip: Ipv4Address::UNSPECIFIED,
            netmask: Ipv4Address::UNSPECIFIED,
            gateway: Ipv4Address::UNSPECIFIED,
        }
    }

    /// Whether `dest` is on the local subnet given this interface's
    /// address/mask, per §3's routing rule.
    pub fn is_local(&self, dest: Ipv4Address) -> bool {
        let ip: u32 = self.ip.into();
        let mask: u32 = self.netmask.into();
        let dest: u32 = dest.into();
        (ip & mask) == (dest & mask)
    }
}

/// Routing decision for an outbound IP packet: which IP to ARP-resolve
/// for the next hop (§3 — the interface's own subnet, or the default
/// gateway otherwise).
pub fn route_ip(iface: &Interface, dest: Ipv4Address) -> Result<Ipv4Address, NetError> {
    if iface.ip == Ipv4Address::UNSPECIFIED {
        return Err(NetError::Resource(Reason::NoRoute));
    }
    if iface.is_local(dest) || dest == Ipv4Address::BROADCAST {
        Ok(dest)
    } else if iface.gateway != Ipv4Address::UNSPECIFIED {
        Ok(iface.gateway)
    } else {
        Err(NetError::Resource(Reason::NoRoute))
    }
}

/// The surface a network device exposes to the rest of the core: raw
/// frame transmission and a place to register UDP listeners. Kept
/// intentionally narrow — everything else (ARP, DHCP, DNS, TCP) is
/// built on top of it in [`crate::stack`].
pub trait NetDevice: Send + Sync {
    /// Transmits a complete Ethernet frame.
    fn send_raw(&self, frame: &[u8]) -> Result<(), NetError>;

    /// Polls for one received Ethernet frame, if any is queued.
    fn poll_raw(&self) -> Option<Vec<u8>>;

    /// The device's own link address.
    fn mac(&self) -> MacAddress;
}

/// Sends a UDP datagram out through `device`, wrapping it in IP and
/// Ethernet headers addressed to `dest_mac` (already ARP-resolved by
/// the caller).
pub fn send_udp(
    device: &dyn NetDevice,
    iface: &Interface,
    dest_mac: MacAddress,
    dest_ip: Ipv4Address,
    src_port: u16,
    dest_port: u16,
    payload: Vec<u8>,
) -> Result<(), NetError> {
    let datagram = crate::udp::UdpDatagram::new(iface.ip, dest_ip, src_port, dest_port, payload);
    let ip_packet = crate::ip::Ipv4Packet::new(
        iface.ip,
        dest_ip,
        crate::ip::PROTOCOL_UDP,
        datagram.to_bytes(),
    );
    let frame = crate::ethernet::EthernetFrame::new(
        dest_mac,
        iface.mac,
        crate::ethernet::ETHERTYPE_IPV4,
        ip_packet.to_bytes(),
    );
    device.send_raw(&frame.to_bytes())
}

/// Loopback device used in tests and by the shell when no VirtIO
/// transport is attached (grounded on the teacher's `LoopbackDevice`).
pub struct LoopbackDevice {
    queue: spin::Mutex<Vec<Vec<u8>>>,
    mac: MacAddress,
}

impl LoopbackDevice {
    pub fn new() -> Self {
        Self {
            queue: spin::Mutex::new(Vec::new()),
            mac: MacAddress::new([0x00, 0x00, 0x00, 0x00, 0x00, 0x01]),
        }
    }
}

impl Default for LoopbackDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl NetDevice for LoopbackDevice {
    fn send_raw(&self, frame: &[u8]) -> Result<(), NetError> {
        self.queue.lock().push(frame.to_vec());
        Ok(())
    }

    fn poll_raw(&self) -> Option<Vec<u8>> {
        self.queue.lock().pop()
    }

    fn mac(&self) -> MacAddress {
        self.mac
    }
}

/// Per-interface UDP listener registration, delegating to
/// [`ListenerRegistry`].
pub struct UdpBindings {
    registry: spin::Mutex<ListenerRegistry>,
}

impl UdpBindings {
    pub fn new() -> Self {
        Self {
            registry: spin::Mutex::new(ListenerRegistry::new()),
        }
    }

    pub fn register_udp_listener(&self, port: u16, listener: Box<dyn UdpListener>) -> Result<(), NetError> {
        self.registry.lock().register(port, listener)
    }

    pub fn unregister_udp_listener(&self, port: u16) {
        self.registry.lock().unregister(port);
    }

    pub fn dispatch(&self, src: Ipv4Address, src_port: u16, dest: Ipv4Address, dest_port: u16, payload: &[u8]) -> bool {
        self.registry.lock().dispatch(src, src_port, dest, dest_port, payload)
    }

    pub fn allocate_ephemeral_port(&self) -> Result<u16, NetError> {
        self.registry.lock().allocate_ephemeral_port()
    }
}

impl Default for UdpBindings {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_subnet_routes_direct() {
        let iface = Interface {
            mac: MacAddress::new([2, 0, 0, 0, 0, 1]),
            ip: Ipv4Address::new(192, 168, 1, 10),
            netmask: Ipv4Address::new(255, 255, 255, 0),
            gateway: Ipv4Address::new(192, 168, 1, 1),
        };
        let dest = Ipv4Address::new(192, 168, 1, 55);
        assert_eq!(route_ip(&iface, dest).unwrap(), dest);
    }

    #[test]
    fn remote_subnet_routes_via_gateway() {
        let iface = Interface {
            mac: MacAddress::new([2, 0, 0, 0, 0, 1]),
            ip: Ipv4Address::new(192, 168, 1, 10),
            netmask: Ipv4Address::new(255, 255, 255, 0),
            gateway: Ipv4Address::new(192, 168, 1, 1),
        };
        let dest = Ipv4Address::new(8, 8, 8, 8);
        assert_eq!(route_ip(&iface, dest).unwrap(), iface.gateway);
    }

    #[test]
    fn loopback_echoes_frames() {
        let dev = LoopbackDevice::new();
        dev.send_raw(&[1, 2, 3]).unwrap();
        assert_eq!(dev.poll_raw(), Some(alloc::vec![1, 2, 3]));
        assert_eq!(dev.poll_raw(), None);
    }
}
