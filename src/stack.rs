//! # NetStack
//!
//! Ties a device, an interface, the ARP cache, the DHCP client, the DNS
//! resolver and the TCP pool together into the one value a kernel thread
//! actually owns and calls into. Grounded on the §9 design note: rather
//! than process-wide singletons, every piece of state the teacher keeps
//! as a global (`ARP_CACHE`, `TCP_CONNECTIONS`, ...) is a field here, and
//! the device/connection cyclic reference is resolved the way the note
//! prescribes — connections refer back to their owning stack only
//! through the pool's own slot indices, never a raw pointer.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::arp::{self, ArpCache, ArpPacket};
use crate::collab::{Scheduler, TimeSource};
use crate::device::{route_ip, Interface, NetDevice, UdpBindings};
use crate::dhcp::{self, DhcpClient, DhcpLease};
use crate::dns::DnsResolver;
use crate::error::NetError;
use crate::ethernet::{EthernetFrame, MacAddress, ETHERTYPE_ARP, ETHERTYPE_IPV4};
use crate::icmp::IcmpPacket;
use crate::ip::{Ipv4Address, Ipv4Packet, PROTOCOL_ICMP, PROTOCOL_TCP, PROTOCOL_UDP};
use crate::shell::{ShellCommandHandler, ShellServer};
use crate::tcp::{self, TcpHeader};
use crate::udp::{UdpDatagram, UdpListener};

/// Queues datagrams addressed to a fixed port so a blocking `resolve`/
/// `run_once` loop elsewhere can poll them out one at a time. Bridges the
/// RX dispatch path (driven from `poll_rx`) to DHCP and DNS, both of
/// which expect a synchronous `recv`-style callback.
struct SingleSlotListener {
    pending: spin::Mutex<Option<Vec<u8>>>,
}

impl SingleSlotListener {
    fn new() -> Self {
        Self {
            pending: spin::Mutex::new(None),
        }
    }

    fn take(&self) -> Option<Vec<u8>> {
        self.pending.lock().take()
    }
}

impl UdpListener for SingleSlotListener {
    fn on_udp(&self, _src: Ipv4Address, _src_port: u16, _dest: Ipv4Address, payload: &[u8]) {
        *self.pending.lock() = Some(payload.to_vec());
    }
}

/// The networking core's top-level value: one interface, its device, and
/// every protocol engine built on top of it.
pub struct NetStack {
    device: Box<dyn NetDevice>,
    iface: spin::Mutex<Interface>,
    arp_cache: spin::Mutex<ArpCache>,
    udp: UdpBindings,
    tcp: tcp::Pool,
    dns: DnsResolver,
}

impl NetStack {
    pub fn new(device: Box<dyn NetDevice>) -> Self {
        let mac = device.mac();
        Self {
            device,
            iface: spin::Mutex::new(Interface::unconfigured(mac)),
            arp_cache: spin::Mutex::new(ArpCache::new()),
            udp: UdpBindings::new(),
            tcp: tcp::Pool::new(),
            dns: DnsResolver::new(),
        }
    }

    pub fn mac(&self) -> MacAddress {
        self.device.mac()
    }

    pub fn interface(&self) -> Interface {
        *self.iface.lock()
    }

    pub fn set_interface(&self, iface: Interface) {
        *self.iface.lock() = iface;
    }

    fn broadcast_frame(&self, ethertype: u16, payload: Vec<u8>) -> EthernetFrame {
        EthernetFrame::new(MacAddress::BROADCAST, self.mac(), ethertype, payload)
    }

    /// Resolves `ip`'s link address, blocking (cooperative 1 ms polling,
    /// 3 s timeout) per §4.3.
    pub fn resolve(&self, ip: Ipv4Address, scheduler: &dyn Scheduler, time: &dyn TimeSource) -> Result<MacAddress, NetError> {
        let our_ip = self.interface().ip;
        let our_mac = self.mac();
        arp::resolve(&self.arp_cache, ip, our_mac, our_ip, scheduler, time, |req| {
            let frame = self.broadcast_frame(ETHERTYPE_ARP, req.to_bytes());
            let _ = self.device.send_raw(&frame.to_bytes());
        })
    }

    /// Picks the next hop for `dest` and resolves its MAC.
    fn resolve_route(&self, dest: Ipv4Address, scheduler: &dyn Scheduler, time: &dyn TimeSource) -> Result<MacAddress, NetError> {
        let iface = self.interface();
        let next_hop = route_ip(&iface, dest)?;
        self.resolve(next_hop, scheduler, time)
    }

    /// Processes exactly one queued raw frame, if any. Intended to be
    /// called from the soft-IRQ handler registered for
    /// [`crate::collab::SOFTIRQ_NET_RX`].
    pub fn poll_rx(&self, time: &dyn TimeSource) {
        let Some(raw) = self.device.poll_raw() else {
            return;
        };
        let Some(frame) = EthernetFrame::parse(&raw) else {
            return;
        };

        match frame.ethertype {
            ETHERTYPE_ARP => {
                if let Ok(pkt) = ArpPacket::parse(&frame.payload) {
                    let iface = self.interface();
                    let mut cache = self.arp_cache.lock();
                    if let Some(reply) = arp::process(&mut cache, &pkt, self.mac(), iface.ip) {
                        let eth = EthernetFrame::new(reply.target_mac, self.mac(), ETHERTYPE_ARP, reply.to_bytes());
                        let _ = self.device.send_raw(&eth.to_bytes());
                    }
                }
            }
            ETHERTYPE_IPV4 => {
                if let Some(packet) = Ipv4Packet::parse(&frame.payload) {
                    self.handle_ipv4(frame.src_mac, packet, time);
                }
            }
            _ => {}
        }
    }

    fn handle_ipv4(&self, peer_mac: MacAddress, packet: Ipv4Packet, time: &dyn TimeSource) {
        if !packet.verify_checksum() {
            return;
        }
        let iface = self.interface();
        if packet.dest_addr != iface.ip && packet.dest_addr != Ipv4Address::BROADCAST {
            return;
        }
        // Opportunistically learn the sender's MAC from any unicast IP
        // frame, not just ARP traffic, so replies on this flow don't need
        // a fresh resolution.
        self.arp_cache.lock().insert(packet.src_addr, peer_mac);

        match packet.protocol {
            PROTOCOL_ICMP => {
                if let Some(icmp) = IcmpPacket::parse(&packet.payload) {
                    if icmp.icmp_type == crate::icmp::ICMP_ECHO_REQUEST {
                        let reply = IcmpPacket::echo_reply(icmp.identifier, icmp.sequence, icmp.data.clone());
                        let ip_reply = Ipv4Packet::new(iface.ip, packet.src_addr, PROTOCOL_ICMP, reply.to_bytes());
                        let eth = EthernetFrame::new(peer_mac, self.mac(), ETHERTYPE_IPV4, ip_reply.to_bytes());
                        let _ = self.device.send_raw(&eth.to_bytes());
                    }
                }
            }
            PROTOCOL_UDP => {
                if let Ok(dg) = UdpDatagram::parse(&packet.payload) {
                    if dg.verify_checksum(packet.src_addr, iface.ip) {
                        self.udp
                            .dispatch(packet.src_addr, dg.header.src_port, iface.ip, dg.header.dest_port, &dg.data);
                    }
                }
            }
            PROTOCOL_TCP => {
                if tcp::verify_checksum(packet.src_addr, iface.ip, &packet.payload) {
                    if let Ok((header, offset)) = TcpHeader::parse(&packet.payload) {
                        self.tcp.process_rx(iface.ip, packet.src_addr, header, &packet.payload[offset..], time, |l, r, h, p| {
                            self.emit_tcp_segment(l, r, h, p);
                        });
                    }
                }
            }
            _ => {}
        }
    }

    /// Wraps a TCP segment in IP + Ethernet and sends it, looking up the
    /// peer's MAC in the ARP cache. A cache miss silently drops the
    /// segment rather than blocking the receive/timer path on a fresh
    /// resolution; the retransmit sweep will retry.
    fn emit_tcp_segment(&self, local: Ipv4Address, remote: Ipv4Address, header: &TcpHeader, payload: &[u8]) {
        let seg = header.to_segment(local, remote, payload);
        let ip_packet = Ipv4Packet::new(local, remote, PROTOCOL_TCP, seg);
        if let Some(mac) = self.arp_cache.lock().lookup(remote) {
            let eth = EthernetFrame::new(mac, self.mac(), ETHERTYPE_IPV4, ip_packet.to_bytes());
            let _ = self.device.send_raw(&eth.to_bytes());
        }
    }

    /// Runs the 200 ms TCP retransmit/cleanup sweep. Intended to be
    /// driven by a [`crate::collab::PeriodicTimer`] registered for
    /// [`crate::collab::SOFTIRQ_TCP_TIMER`].
    pub fn tcp_tick(&self, time: &dyn TimeSource) {
        self.tcp.tick(time, |local, remote, header, payload| {
            self.emit_tcp_segment(local, remote, header, payload);
        });
    }

    /// Opens an outbound TCP connection, blocking until established or
    /// the 5 s connect timeout.
    pub fn tcp_connect(
        &self,
        remote_ip: Ipv4Address,
        remote_port: u16,
        scheduler: &dyn Scheduler,
        time: &dyn TimeSource,
    ) -> Result<usize, NetError> {
        let iface = self.interface();
        let local_port = self.udp.allocate_ephemeral_port().unwrap_or(40000);
        let mac = self.resolve_route(remote_ip, scheduler, time)?;
        self.arp_cache.lock().insert(remote_ip, mac);
        let iss = time.now_ms() as u32;
        let slot = self.tcp.connect(iface.ip, local_port, remote_ip, remote_port, mac, iss, time, |conn, seg| {
            let bytes = seg.header.to_segment(conn.tuple.local_ip, conn.tuple.remote_ip, &seg.payload);
            let ip_packet = Ipv4Packet::new(conn.tuple.local_ip, conn.tuple.remote_ip, PROTOCOL_TCP, bytes);
            let eth = EthernetFrame::new(mac, self.mac(), ETHERTYPE_IPV4, ip_packet.to_bytes());
            let _ = self.device.send_raw(&eth.to_bytes());
        })?;
        self.tcp.wait_connected(slot, scheduler, time)?;
        Ok(slot)
    }

    pub fn tcp_listen(&self, local_port: u16) -> Result<usize, NetError> {
        self.tcp.listen(self.interface().ip, local_port)
    }

    pub fn tcp_accept(&self, listener: usize, scheduler: &dyn Scheduler) -> Result<usize, NetError> {
        self.tcp.accept(listener, scheduler)
    }

    pub fn tcp_send(&self, slot: usize, data: &[u8], scheduler: &dyn Scheduler, time: &dyn TimeSource) -> Result<usize, NetError> {
        self.tcp.send(slot, data, scheduler, time, |conn, seg| {
            self.emit_tcp_segment(conn.tuple.local_ip, conn.tuple.remote_ip, &seg.header, &seg.payload);
        })
    }

    pub fn tcp_recv(&self, slot: usize, buf: &mut [u8], scheduler: &dyn Scheduler) -> Result<usize, NetError> {
        self.tcp.recv(slot, buf, scheduler)
    }

    pub fn tcp_close(&self, slot: usize, time: &dyn TimeSource) {
        self.tcp.close(slot, time, |conn, seg| {
            self.emit_tcp_segment(conn.tuple.local_ip, conn.tuple.remote_ip, &seg.header, &seg.payload);
        });
    }

    /// Runs DHCP to completion (`Init` through `Bound`), applying the
    /// resulting lease to this stack's interface.
    pub fn dhcp_bind(&self, boot_xid: u32, scheduler: &dyn Scheduler, time: &dyn TimeSource) -> Result<DhcpLease, NetError> {
        let listener = Arc::new(SingleSlotListener::new());
        self.udp
            .register_udp_listener(crate::udp::DHCP_CLIENT_PORT, Box::new(ArcListener(listener.clone())))?;

        let mut client = DhcpClient::new(self.mac(), boot_xid);
        let result = client.run_once(
            scheduler,
            time,
            |pkt| {
                let bytes = pkt.to_bytes();
                let dg = UdpDatagram::new(
                    Ipv4Address::UNSPECIFIED,
                    Ipv4Address::BROADCAST,
                    crate::udp::DHCP_CLIENT_PORT,
                    crate::udp::DHCP_SERVER_PORT,
                    bytes,
                );
                let ip_packet = Ipv4Packet::new(Ipv4Address::UNSPECIFIED, Ipv4Address::BROADCAST, PROTOCOL_UDP, dg.to_bytes());
                let eth = self.broadcast_frame(ETHERTYPE_IPV4, ip_packet.to_bytes());
                let _ = self.device.send_raw(&eth.to_bytes());
            },
            |deadline| loop {
                if let Some(bytes) = listener.take() {
                    if let Ok(pkt) = dhcp::DhcpPacket::parse(&bytes) {
                        return Some(pkt);
                    }
                    continue;
                }
                if scheduler.current_task_stopping() || time.now_ms() >= deadline {
                    return None;
                }
                scheduler.sleep(1_000_000);
            },
        );

        self.udp.unregister_udp_listener(crate::udp::DHCP_CLIENT_PORT);

        if let Ok(lease) = &result {
            let mut iface = self.iface.lock();
            iface.ip = lease.ip;
            iface.netmask = lease.mask;
            iface.gateway = lease.router.unwrap_or(Ipv4Address::UNSPECIFIED);
        }
        result
    }

    /// Resolves `name` to an IPv4 address, trying the cache first.
    pub fn dns_resolve(&self, name: &str, scheduler: &dyn Scheduler, time: &dyn TimeSource) -> Result<Ipv4Address, NetError> {
        let listener = Arc::new(SingleSlotListener::new());
        self.udp
            .register_udp_listener(crate::dns::DNS_SOURCE_PORT, Box::new(ArcListener(listener.clone())))?;

        let dns_server = self.interface().gateway;
        let result = self.dns.resolve(
            name,
            scheduler,
            time,
            |_id, query| {
                let dg = UdpDatagram::new(self.interface().ip, dns_server, crate::dns::DNS_SOURCE_PORT, crate::udp::DNS_PORT, query.to_vec());
                let ip_packet = Ipv4Packet::new(self.interface().ip, dns_server, PROTOCOL_UDP, dg.to_bytes());
                if let Ok(mac) = self.resolve(dns_server, scheduler, time) {
                    let eth = EthernetFrame::new(mac, self.mac(), ETHERTYPE_IPV4, ip_packet.to_bytes());
                    let _ = self.device.send_raw(&eth.to_bytes());
                }
            },
            || listener.take(),
        );

        self.udp.unregister_udp_listener(crate::dns::DNS_SOURCE_PORT);
        result
    }

    pub fn register_udp_listener(&self, port: u16, listener: Box<dyn UdpListener>) -> Result<(), NetError> {
        self.udp.register_udp_listener(port, listener)
    }

    pub fn unregister_udp_listener(&self, port: u16) {
        self.udp.unregister_udp_listener(port);
    }

    /// Runs the UDP shell on `port` until the calling task is asked to
    /// stop, dispatching each command through `handler`.
    pub fn run_shell(&self, handler: &dyn ShellCommandHandler, port: u16, scheduler: &dyn Scheduler, time: &dyn TimeSource) -> Result<(), NetError> {
        let server = Arc::new(ShellServer::new(port));
        self.udp.register_udp_listener(port, Box::new(ShellListener(server.clone())))?;

        server.run(handler, scheduler, |dest_ip, dest_port, payload| {
            if let Ok(mac) = self.resolve_route(dest_ip, scheduler, time) {
                let iface = self.interface();
                let _ = crate::device::send_udp(self.device.as_ref(), &iface, mac, dest_ip, port, dest_port, payload);
            }
        });

        self.udp.unregister_udp_listener(port);
        Ok(())
    }
}

/// Bridges an `Arc<ShellServer>` into the `Box<dyn UdpListener>` the
/// registry expects, the same way [`ArcListener`] does for DHCP/DNS.
struct ShellListener(Arc<ShellServer>);
impl UdpListener for ShellListener {
    fn on_udp(&self, src: Ipv4Address, src_port: u16, dest: Ipv4Address, payload: &[u8]) {
        self.0.on_udp(src, src_port, dest, payload);
    }
}

/// Bridges an `Arc<SingleSlotListener>` into the `Box<dyn UdpListener>`
/// the registry expects.
struct ArcListener(Arc<SingleSlotListener>);
impl UdpListener for ArcListener {
    fn on_udp(&self, src: Ipv4Address, src_port: u16, dest: Ipv4Address, payload: &[u8]) {
        self.0.on_udp(src, src_port, dest, payload);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::LoopbackDevice;
    use core::sync::atomic::{AtomicU64, Ordering};

    struct FixedTime(AtomicU64);
    impl TimeSource for FixedTime {
        fn boot_time(&self) -> (u64, u32) {
            (self.0.load(Ordering::SeqCst) / 1000, 0)
        }
        fn now_ms(&self) -> u64 {
            self.0.load(Ordering::SeqCst)
        }
    }

    #[test]
    fn new_stack_reports_device_mac() {
        let dev = LoopbackDevice::new();
        let mac = dev.mac();
        let stack = NetStack::new(Box::new(dev));
        assert_eq!(stack.mac(), mac);
    }

    #[test]
    fn unresolved_arp_times_out_quickly_when_cancelled() {
        struct StoppingScheduler;
        impl Scheduler for StoppingScheduler {
            fn sleep(&self, _ns: u64) {}
            fn task_start(&self, _f: fn(*mut u8), _ctx: *mut u8) -> crate::collab::TaskHandle {
                crate::collab::TaskHandle(0)
            }
            fn task_set_stopping(&self, _h: crate::collab::TaskHandle) {}
            fn task_wait(&self, _h: crate::collab::TaskHandle) {}
            fn current_task_stopping(&self) -> bool {
                true
            }
        }
        let stack = NetStack::new(Box::new(LoopbackDevice::new()));
        let time = FixedTime(AtomicU64::new(0));
        let result = stack.resolve(Ipv4Address::new(10, 0, 0, 1), &StoppingScheduler, &time);
        assert_eq!(result, Err(NetError::Cancelled));
    }
}
