//! # ARP (Address Resolution Protocol)
//!
//! Maps IPv4 addresses to MAC addresses. The cache is a fixed-size array
//! with overwrite-first eviction rather than a `BTreeMap`, so a spinning
//! resolver can never grow the cache past a known bound.

use alloc::vec::Vec;

use crate::collab::{Scheduler, TimeSource};
use crate::error::{NetError, Reason};
use crate::ethernet::MacAddress;
use crate::ip::Ipv4Address;

/// ARP operation: Request.
pub const ARP_REQUEST: u16 = 1;
/// ARP operation: Reply.
pub const ARP_REPLY: u16 = 2;

/// Hardware type: Ethernet.
const HARDWARE_ETHERNET: u16 = 1;
/// Protocol type: IPv4.
const PROTOCOL_IPV4: u16 = 0x0800;

/// Number of entries held by the ARP cache.
const CACHE_SIZE: usize = 16;

/// Deadline for `resolve()`, matching the per-operation timeout table.
const RESOLVE_TIMEOUT_MS: u64 = 3_000;
/// Poll granularity while waiting for a reply.
const RESOLVE_POLL_MS: u64 = 1;

/// ARP packet.
#[derive(Debug, Clone)]
pub struct ArpPacket {
    pub hardware_type: u16,
    pub protocol_type: u16,
    pub hw_addr_len: u8,
    pub proto_addr_len: u8,
    pub operation: u16,
    pub sender_mac: MacAddress,
    pub sender_ip: Ipv4Address,
    pub target_mac: MacAddress,
    pub target_ip: Ipv4Address,
}

impl ArpPacket {
    pub const SIZE: usize = 28;

    pub fn request(sender_mac: MacAddress, sender_ip: Ipv4Address, target_ip: Ipv4Address) -> Self {
        Self {
            hardware_type: HARDWARE_ETHERNET,
            protocol_type: PROTOCOL_IPV4,
            hw_addr_len: 6,
            proto_addr_len: 4,
            operation: ARP_REQUEST,
            sender_mac,
            sender_ip,
            target_mac: MacAddress::ZERO,
            target_ip,
        }
    }

    pub fn reply(
        sender_mac: MacAddress,
        sender_ip: Ipv4Address,
        target_mac: MacAddress,
        target_ip: Ipv4Address,
    ) -> Self {
        Self {
            hardware_type: HARDWARE_ETHERNET,
            protocol_type: PROTOCOL_IPV4,
            hw_addr_len: 6,
            proto_addr_len: 4,
            operation: ARP_REPLY,
            sender_mac,
            sender_ip,
            target_mac,
            target_ip,
        }
    }

    /// Builds the reply to `self` (a request), swapping sender/target and
    /// substituting our own MAC as the new sender.
    pub fn reply_to(&self, our_mac: MacAddress, our_ip: Ipv4Address) -> Self {
        Self::reply(our_mac, our_ip, self.sender_mac, self.sender_ip)
    }

    pub fn parse(data: &[u8]) -> Result<Self, NetError> {
        if data.len() < Self::SIZE {
            return Err(NetError::BadPacket(Reason::ShortFrame));
        }

        let hardware_type = u16::from_be_bytes([data[0], data[1]]);
        let protocol_type = u16::from_be_bytes([data[2], data[3]]);
        let hw_addr_len = data[4];
        let proto_addr_len = data[5];
        let operation = u16::from_be_bytes([data[6], data[7]]);

        if hardware_type != HARDWARE_ETHERNET
            || protocol_type != PROTOCOL_IPV4
            || hw_addr_len != 6
            || proto_addr_len != 4
        {
            return Err(NetError::BadPacket(Reason::BadHeader));
        }

        let sender_mac =
            MacAddress::from_bytes(&data[8..14]).ok_or(NetError::BadPacket(Reason::ShortFrame))?;
        let sender_ip = Ipv4Address::from_bytes(&data[14..18])
            .ok_or(NetError::BadPacket(Reason::ShortFrame))?;
        let target_mac =
            MacAddress::from_bytes(&data[18..24]).ok_or(NetError::BadPacket(Reason::ShortFrame))?;
        let target_ip = Ipv4Address::from_bytes(&data[24..28])
            .ok_or(NetError::BadPacket(Reason::ShortFrame))?;

        Ok(Self {
            hardware_type,
            protocol_type,
            hw_addr_len,
            proto_addr_len,
            operation,
            sender_mac,
            sender_ip,
            target_mac,
            target_ip,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(Self::SIZE);
        bytes.extend_from_slice(&self.hardware_type.to_be_bytes());
        bytes.extend_from_slice(&self.protocol_type.to_be_bytes());
        bytes.push(self.hw_addr_len);
        bytes.push(self.proto_addr_len);
        bytes.extend_from_slice(&self.operation.to_be_bytes());
        bytes.extend_from_slice(&self.sender_mac.0);
        bytes.extend_from_slice(&self.sender_ip.0);
        bytes.extend_from_slice(&self.target_mac.0);
        bytes.extend_from_slice(&self.target_ip.0);
        bytes
    }
}

#[derive(Debug, Clone, Copy)]
struct ArpEntry {
    ip: Ipv4Address,
    mac: MacAddress,
    valid: bool,
}

impl ArpEntry {
    const EMPTY: Self = Self {
        ip: Ipv4Address::ANY,
        mac: MacAddress::ZERO,
        valid: false,
    };
}

/// Fixed-size IP→MAC cache with a single lock (caller-supplied).
pub struct ArpCache {
    entries: [ArpEntry; CACHE_SIZE],
}

impl ArpCache {
    pub const fn new() -> Self {
        Self {
            entries: [ArpEntry::EMPTY; CACHE_SIZE],
        }
    }

    /// Updates the existing entry for `ip`, else fills the first free
    /// slot, else overwrites slot 0.
    pub fn insert(&mut self, ip: Ipv4Address, mac: MacAddress) {
        if let Some(e) = self.entries.iter_mut().find(|e| e.valid && e.ip == ip) {
            e.mac = mac;
            return;
        }
        if let Some(e) = self.entries.iter_mut().find(|e| !e.valid) {
            *e = ArpEntry { ip, mac, valid: true };
            return;
        }
        self.entries[0] = ArpEntry { ip, mac, valid: true };
    }

    pub fn lookup(&self, ip: Ipv4Address) -> Option<MacAddress> {
        self.entries
            .iter()
            .find(|e| e.valid && e.ip == ip)
            .map(|e| e.mac)
    }

    pub fn entries(&self) -> impl Iterator<Item = (Ipv4Address, MacAddress)> + '_ {
        self.entries.iter().filter(|e| e.valid).map(|e| (e.ip, e.mac))
    }

    pub fn len(&self) -> usize {
        self.entries.iter().filter(|e| e.valid).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&mut self) {
        self.entries = [ArpEntry::EMPTY; CACHE_SIZE];
    }
}

impl Default for ArpCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Processes an inbound ARP packet against our address, returning a reply
/// to transmit when the packet was a request addressed to us.
///
/// Per §4.3: for both request and reply, the sender's mapping is learned;
/// a reply is only synthesised for requests targeting our own IP.
pub fn process(cache: &mut ArpCache, packet: &ArpPacket, our_mac: MacAddress, our_ip: Ipv4Address) -> Option<ArpPacket> {
    cache.insert(packet.sender_ip, packet.sender_mac);

    if packet.operation == ARP_REQUEST && packet.target_ip == our_ip {
        Some(packet.reply_to(our_mac, our_ip))
    } else {
        None
    }
}

/// Resolves `ip` to a MAC address: cache fast path, else broadcasts a
/// request and cooperatively polls the cache at 1 ms granularity for up
/// to 3 seconds.
///
/// `send_request` is invoked at most once, with the request already built;
/// it is the caller's job to hand it to the device (keeps this function
/// independent of the concrete `NetDevice` type).
pub fn resolve(
    cache: &spin::Mutex<ArpCache>,
    ip: Ipv4Address,
    our_mac: MacAddress,
    our_ip: Ipv4Address,
    scheduler: &dyn Scheduler,
    time: &dyn TimeSource,
    mut send_request: impl FnMut(&ArpPacket),
) -> Result<MacAddress, NetError> {
    if let Some(mac) = cache.lock().lookup(ip) {
        return Ok(mac);
    }

    let request = ArpPacket::request(our_mac, our_ip, ip);
    send_request(&request);

    let deadline = time.now_ms().saturating_add(RESOLVE_TIMEOUT_MS);
    loop {
        if scheduler.current_task_stopping() {
            return Err(NetError::Cancelled);
        }
        if let Some(mac) = cache.lock().lookup(ip) {
            return Ok(mac);
        }
        if time.now_ms() >= deadline {
            return Err(NetError::Timeout(Reason::ArpTimeout));
        }
        scheduler.sleep(RESOLVE_POLL_MS * 1_000_000);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reply_swaps_sender_and_target() {
        let our_mac = MacAddress::new([0x02, 0x00, 0x00, 0x00, 0x00, 0x01]);
        let our_ip = Ipv4Address::new(10, 0, 0, 42);
        let peer_mac = MacAddress::new([0xaa, 0xbb, 0xcc, 0x00, 0x00, 0x01]);
        let peer_ip = Ipv4Address::new(10, 0, 0, 1);

        let request = ArpPacket::request(peer_mac, peer_ip, our_ip);
        let mut cache = ArpCache::new();
        let reply = process(&mut cache, &request, our_mac, our_ip).expect("reply expected");

        assert_eq!(reply.operation, ARP_REPLY);
        assert_eq!(reply.sender_mac, our_mac);
        assert_eq!(reply.sender_ip, our_ip);
        assert_eq!(reply.target_mac, peer_mac);
        assert_eq!(reply.target_ip, peer_ip);
        assert_eq!(cache.lookup(peer_ip), Some(peer_mac));
    }

    #[test]
    fn cache_overwrites_slot_zero_when_full() {
        let mut cache = ArpCache::new();
        for i in 0..CACHE_SIZE {
            cache.insert(Ipv4Address::new(10, 0, 0, i as u8), MacAddress::new([0, 0, 0, 0, 0, i as u8]));
        }
        assert_eq!(cache.len(), CACHE_SIZE);
        let overflow_mac = MacAddress::new([9, 9, 9, 9, 9, 9]);
        cache.insert(Ipv4Address::new(10, 0, 0, 200), overflow_mac);
        assert_eq!(cache.lookup(Ipv4Address::new(10, 0, 0, 200)), Some(overflow_mac));
        assert_eq!(cache.lookup(Ipv4Address::new(10, 0, 0, 0)), None);
    }

    #[test]
    fn roundtrip_bytes() {
        let pkt = ArpPacket::request(
            MacAddress::new([1, 2, 3, 4, 5, 6]),
            Ipv4Address::new(1, 2, 3, 4),
            Ipv4Address::new(5, 6, 7, 8),
        );
        let bytes = pkt.to_bytes();
        assert_eq!(bytes.len(), ArpPacket::SIZE);
        let parsed = ArpPacket::parse(&bytes).unwrap();
        assert_eq!(parsed.sender_ip, pkt.sender_ip);
        assert_eq!(parsed.target_ip, pkt.target_ip);
    }
}
