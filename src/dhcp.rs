//! # DHCP client
//!
//! Lease acquisition and renewal state machine (RFC 2131 subset: DISCOVER
//! / OFFER / REQUEST / ACK / NAK). The wire codec has no teacher
//! counterpart — `services/net/src/config.rs` models the *state machine*
//! but never serialises a BOOTP packet — so the codec here is grounded on
//! the sibling UDP/DNS modules' `parse`/`to_bytes` idiom instead.

use alloc::vec::Vec;

use crate::collab::{Scheduler, TimeSource};
use crate::error::{NetError, Reason};
use crate::ethernet::MacAddress;
use crate::ip::Ipv4Address;

const MAGIC_COOKIE: [u8; 4] = [0x63, 0x82, 0x53, 0x63];
const FIXED_PART_LEN: usize = 236;
const OPT_END: u8 = 255;
const OPT_PAD: u8 = 0;

const OP_BOOTREQUEST: u8 = 1;
const OP_BOOTREPLY: u8 = 2;
const HTYPE_ETHERNET: u8 = 1;
const FLAG_BROADCAST: u16 = 0x8000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DhcpMessageType {
    Discover = 1,
    Offer = 2,
    Request = 3,
    Decline = 4,
    Ack = 5,
    Nak = 6,
    Release = 7,
    Inform = 8,
}

impl DhcpMessageType {
    fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            1 => Self::Discover,
            2 => Self::Offer,
            3 => Self::Request,
            4 => Self::Decline,
            5 => Self::Ack,
            6 => Self::Nak,
            7 => Self::Release,
            8 => Self::Inform,
            _ => return None,
        })
    }
}

/// Options parsed out of a BOOTP packet. Absent fields stay `None`.
#[derive(Debug, Clone, Default)]
pub struct DhcpOptions {
    pub message_type: Option<DhcpMessageType>,
    pub subnet_mask: Option<Ipv4Address>,
    pub router: Option<Ipv4Address>,
    pub dns: Option<Ipv4Address>,
    pub requested_ip: Option<Ipv4Address>,
    pub lease_time: Option<u32>,
    pub server_id: Option<Ipv4Address>,
}

#[derive(Debug, Clone)]
pub struct DhcpPacket {
    pub op: u8,
    pub xid: u32,
    pub secs: u16,
    pub flags: u16,
    pub ciaddr: Ipv4Address,
    pub yiaddr: Ipv4Address,
    pub siaddr: Ipv4Address,
    pub giaddr: Ipv4Address,
    pub chaddr: MacAddress,
    pub options: DhcpOptions,
}

impl DhcpPacket {
    /// Builds a client→server request (DISCOVER or REQUEST).
    pub fn request(
        msg_type: DhcpMessageType,
        xid: u32,
        chaddr: MacAddress,
        requested_ip: Option<Ipv4Address>,
        server_id: Option<Ipv4Address>,
    ) -> Self {
        Self {
            op: OP_BOOTREQUEST,
            xid,
            secs: 0,
            flags: FLAG_BROADCAST,
            ciaddr: Ipv4Address::ANY,
            yiaddr: Ipv4Address::ANY,
            siaddr: Ipv4Address::ANY,
            giaddr: Ipv4Address::ANY,
            chaddr,
            options: DhcpOptions {
                message_type: Some(msg_type),
                requested_ip,
                server_id,
                ..Default::default()
            },
        }
    }

    pub fn parse(data: &[u8]) -> Result<Self, NetError> {
        if data.len() < FIXED_PART_LEN + MAGIC_COOKIE.len() {
            return Err(NetError::BadPacket(Reason::ShortFrame));
        }
        if data[236..240] != MAGIC_COOKIE {
            return Err(NetError::BadPacket(Reason::WrongMagic));
        }

        let op = data[0];
        if data[1] != HTYPE_ETHERNET {
            return Err(NetError::BadPacket(Reason::BadHeader));
        }
        let xid = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
        let secs = u16::from_be_bytes([data[8], data[9]]);
        let flags = u16::from_be_bytes([data[10], data[11]]);
        let ciaddr = Ipv4Address::from_bytes(&data[12..16]).unwrap();
        let yiaddr = Ipv4Address::from_bytes(&data[16..20]).unwrap();
        let siaddr = Ipv4Address::from_bytes(&data[20..24]).unwrap();
        let giaddr = Ipv4Address::from_bytes(&data[24..28]).unwrap();
        let chaddr = MacAddress::from_bytes(&data[28..34]).unwrap();

        let options = parse_options(&data[240..])?;

        Ok(Self {
            op,
            xid,
            secs,
            flags,
            ciaddr,
            yiaddr,
            siaddr,
            giaddr,
            chaddr,
            options,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(FIXED_PART_LEN + 32);
        out.push(self.op);
        out.push(HTYPE_ETHERNET);
        out.push(6); // hlen
        out.push(0); // hops
        out.extend_from_slice(&self.xid.to_be_bytes());
        out.extend_from_slice(&self.secs.to_be_bytes());
        out.extend_from_slice(&self.flags.to_be_bytes());
        out.extend_from_slice(self.ciaddr.as_bytes());
        out.extend_from_slice(self.yiaddr.as_bytes());
        out.extend_from_slice(self.siaddr.as_bytes());
        out.extend_from_slice(self.giaddr.as_bytes());
        out.extend_from_slice(&self.chaddr.0);
        out.extend_from_slice(&[0u8; 10]); // chaddr padding (16 - 6)
        out.extend_from_slice(&[0u8; 64]); // sname
        out.extend_from_slice(&[0u8; 128]); // file
        out.extend_from_slice(&MAGIC_COOKIE);

        if let Some(mt) = self.options.message_type {
            out.push(53);
            out.push(1);
            out.push(mt as u8);
        }
        if let Some(ip) = self.options.requested_ip {
            out.push(50);
            out.push(4);
            out.extend_from_slice(ip.as_bytes());
        }
        if let Some(ip) = self.options.server_id {
            out.push(54);
            out.push(4);
            out.extend_from_slice(ip.as_bytes());
        }
        out.push(OPT_END);
        out
    }
}

fn parse_options(data: &[u8]) -> Result<DhcpOptions, NetError> {
    let mut opts = DhcpOptions::default();
    let mut i = 0;
    while i < data.len() {
        let code = data[i];
        if code == OPT_END {
            break;
        }
        if code == OPT_PAD {
            i += 1;
            continue;
        }
        if i + 1 >= data.len() {
            break;
        }
        let len = data[i + 1] as usize;
        if i + 2 + len > data.len() {
            return Err(NetError::BadPacket(Reason::UnknownOption));
        }
        let value = &data[i + 2..i + 2 + len];
        match code {
            53 if len == 1 => opts.message_type = DhcpMessageType::from_u8(value[0]),
            1 if len == 4 => opts.subnet_mask = Ipv4Address::from_bytes(value),
            3 if len >= 4 => opts.router = Ipv4Address::from_bytes(&value[0..4]),
            6 if len >= 4 => opts.dns = Ipv4Address::from_bytes(&value[0..4]),
            50 if len == 4 => opts.requested_ip = Ipv4Address::from_bytes(value),
            51 if len == 4 => {
                opts.lease_time = Some(u32::from_be_bytes([value[0], value[1], value[2], value[3]]))
            }
            54 if len == 4 => opts.server_id = Ipv4Address::from_bytes(value),
            _ => {}
        }
        i += 2 + len;
    }
    Ok(opts)
}

/// A bound lease, valid once ACK'd.
#[derive(Debug, Clone, Copy)]
pub struct DhcpLease {
    pub ip: Ipv4Address,
    pub mask: Ipv4Address,
    pub router: Option<Ipv4Address>,
    pub dns: Option<Ipv4Address>,
    pub server: Ipv4Address,
    pub lease_seconds: u32,
    pub acquired_at_ms: u64,
}

impl DhcpLease {
    pub fn renewal_deadline_ms(&self) -> u64 {
        self.acquired_at_ms + (self.lease_seconds as u64 / 2) * 1000
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Init,
    Discover,
    Request,
    Bound,
}

const DISCOVER_RETRIES: u32 = 3;
const DISCOVER_BACKOFF_MS: u64 = 2_000;
const TOTAL_FAILURE_SLEEP_MS: u64 = 5_000;
const PER_ATTEMPT_TIMEOUT_MS: u64 = 3_000;

/// The client task's state, plus the transaction id it is currently
/// correlating responses against.
pub struct DhcpClient {
    state: State,
    xid: u32,
    our_mac: MacAddress,
    lease: Option<DhcpLease>,
}

impl DhcpClient {
    /// `boot_xid` is read once from the boot-time counter collaborator,
    /// never an entropy source — correlation only needs uniqueness
    /// across this client's own attempts.
    pub fn new(our_mac: MacAddress, boot_xid: u32) -> Self {
        Self {
            state: State::Init,
            xid: boot_xid,
            our_mac,
            lease: None,
        }
    }

    pub fn lease(&self) -> Option<DhcpLease> {
        self.lease
    }

    /// Runs one full acquire-or-renew cycle, blocking (via the scheduler's
    /// cooperative sleep) until a lease is bound, the task is asked to
    /// stop, or acquisition fails permanently for this call.
    ///
    /// `send` transmits a built request packet; `recv_offer_or_ack` polls
    /// for the next inbound DHCP packet addressed to us, returning `None`
    /// on a per-attempt timeout.
    pub fn run_once(
        &mut self,
        scheduler: &dyn Scheduler,
        time: &dyn TimeSource,
        mut send: impl FnMut(&DhcpPacket),
        mut recv: impl FnMut(u64) -> Option<DhcpPacket>,
    ) -> Result<DhcpLease, NetError> {
        loop {
            if scheduler.current_task_stopping() {
                return Err(NetError::Cancelled);
            }
            match self.state {
                State::Init => {
                    self.state = State::Discover;
                }
                State::Discover => {
                    let mut offer = None;
                    for attempt in 0..DISCOVER_RETRIES {
                        self.xid = self.xid.wrapping_add(1);
                        let pkt = DhcpPacket::request(DhcpMessageType::Discover, self.xid, self.our_mac, None, None);
                        send(&pkt);
                        let deadline = time.now_ms() + PER_ATTEMPT_TIMEOUT_MS;
                        if let Some(reply) = recv(deadline) {
                            if reply.xid == self.xid
                                && reply.chaddr == self.our_mac
                                && reply.options.message_type == Some(DhcpMessageType::Offer)
                            {
                                offer = Some(reply);
                                break;
                            }
                        }
                        if attempt + 1 < DISCOVER_RETRIES {
                            scheduler.sleep(DISCOVER_BACKOFF_MS * 1_000_000);
                        }
                    }
                    match offer {
                        Some(o) => {
                            self.lease = Some(partial_lease(&o, time.now_ms()));
                            self.state = State::Request;
                        }
                        None => {
                            scheduler.sleep(TOTAL_FAILURE_SLEEP_MS * 1_000_000);
                            self.state = State::Init;
                        }
                    }
                }
                State::Request => {
                    let offer = self.lease.take().ok_or(NetError::Protocol(Reason::BadHeader))?;
                    self.xid = self.xid.wrapping_add(1);
                    let pkt = DhcpPacket::request(
                        DhcpMessageType::Request,
                        self.xid,
                        self.our_mac,
                        Some(offer.ip),
                        Some(offer.server),
                    );
                    send(&pkt);
                    let deadline = time.now_ms() + PER_ATTEMPT_TIMEOUT_MS;
                    match recv(deadline) {
                        Some(reply)
                            if reply.xid == self.xid
                                && reply.chaddr == self.our_mac
                                && reply.options.message_type == Some(DhcpMessageType::Ack) =>
                        {
                            let lease = full_lease(&reply, time.now_ms())?;
                            self.lease = Some(lease);
                            self.state = State::Bound;
                            log::info!("dhcp: bound {} (server {})", lease.ip, lease.server);
                            return Ok(lease);
                        }
                        Some(reply) if reply.options.message_type == Some(DhcpMessageType::Nak) => {
                            log::debug!("dhcp: offer rejected with NAK, restarting");
                            self.state = State::Init;
                        }
                        _ => {
                            self.state = State::Init;
                        }
                    }
                }
                State::Bound => {
                    let lease = self.lease.ok_or(NetError::Protocol(Reason::BadHeader))?;
                    let deadline = lease.renewal_deadline_ms();
                    while time.now_ms() < deadline {
                        if scheduler.current_task_stopping() {
                            return Err(NetError::Cancelled);
                        }
                        scheduler.sleep(1_000_000_000);
                    }
                    self.xid = self.xid.wrapping_add(1);
                    let pkt = DhcpPacket::request(
                        DhcpMessageType::Request,
                        self.xid,
                        self.our_mac,
                        Some(lease.ip),
                        Some(lease.server),
                    );
                    send(&pkt);
                    let attempt_deadline = time.now_ms() + PER_ATTEMPT_TIMEOUT_MS;
                    match recv(attempt_deadline) {
                        Some(reply)
                            if reply.xid == self.xid
                                && reply.options.message_type == Some(DhcpMessageType::Ack) =>
                        {
                            let renewed = full_lease(&reply, time.now_ms())?;
                            self.lease = Some(renewed);
                            log::debug!("dhcp: lease on {} renewed", renewed.ip);
                            return Ok(renewed);
                        }
                        _ => {
                            log::debug!("dhcp: renewal failed, restarting discovery");
                            self.lease = None;
                            self.state = State::Init;
                        }
                    }
                }
            }
        }
    }
}

fn partial_lease(offer: &DhcpPacket, now_ms: u64) -> DhcpLease {
    DhcpLease {
        ip: offer.yiaddr,
        mask: offer.options.subnet_mask.unwrap_or(Ipv4Address::new(255, 255, 255, 0)),
        router: offer.options.router,
        dns: offer.options.dns,
        server: offer.options.server_id.unwrap_or(offer.siaddr),
        lease_seconds: offer.options.lease_time.unwrap_or(3600),
        acquired_at_ms: now_ms,
    }
}

fn full_lease(ack: &DhcpPacket, now_ms: u64) -> Result<DhcpLease, NetError> {
    Ok(DhcpLease {
        ip: ack.yiaddr,
        mask: ack
            .options
            .subnet_mask
            .ok_or(NetError::Protocol(Reason::BadHeader))?,
        router: ack.options.router,
        dns: ack.options.dns,
        server: ack.options.server_id.ok_or(NetError::Protocol(Reason::BadHeader))?,
        lease_seconds: ack.options.lease_time.unwrap_or(3600),
        acquired_at_ms: now_ms,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn discover_roundtrip() {
        let mac = MacAddress::new([2, 0, 0, 0, 0, 1]);
        let pkt = DhcpPacket::request(DhcpMessageType::Discover, 0x1234_5678, mac, None, None);
        let bytes = pkt.to_bytes();
        let parsed = DhcpPacket::parse(&bytes).unwrap();
        assert_eq!(parsed.xid, 0x1234_5678);
        assert_eq!(parsed.chaddr, mac);
        assert_eq!(parsed.options.message_type, Some(DhcpMessageType::Discover));
    }

    #[test]
    fn ack_options_parse() {
        let mac = MacAddress::new([2, 0, 0, 0, 0, 1]);
        let mut ack = DhcpPacket::request(DhcpMessageType::Ack, 7, mac, None, None);
        ack.op = OP_BOOTREPLY;
        ack.yiaddr = Ipv4Address::new(192, 168, 1, 50);
        ack.options.subnet_mask = Some(Ipv4Address::new(255, 255, 255, 0));
        ack.options.router = Some(Ipv4Address::new(192, 168, 1, 1));
        ack.options.lease_time = Some(3600);
        ack.options.server_id = Some(Ipv4Address::new(192, 168, 1, 1));

        let bytes = ack.to_bytes();
        // message type + requested_ip (absent) + server_id are re-serialised;
        // subnet/router/lease options aren't emitted by `to_bytes` (client
        // never sends them), so patch them in to exercise the parser on a
        // server-shaped packet.
        let mut patched = bytes.clone();
        let end = patched.len() - 1; // strip trailing OPT_END
        patched.truncate(end);
        patched.push(1);
        patched.push(4);
        patched.extend_from_slice(&[255, 255, 255, 0]);
        patched.push(3);
        patched.push(4);
        patched.extend_from_slice(&[192, 168, 1, 1]);
        patched.push(51);
        patched.push(4);
        patched.extend_from_slice(&3600u32.to_be_bytes());
        patched.push(OPT_END);

        let parsed = DhcpPacket::parse(&patched).unwrap();
        assert_eq!(parsed.options.subnet_mask, Some(Ipv4Address::new(255, 255, 255, 0)));
        assert_eq!(parsed.options.router, Some(Ipv4Address::new(192, 168, 1, 1)));
        assert_eq!(parsed.options.lease_time, Some(3600));
        let lease = full_lease(&parsed, 0).unwrap();
        assert_eq!(lease.ip, Ipv4Address::new(192, 168, 1, 50));
    }
}
