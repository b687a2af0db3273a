//! # TCP endpoint
//!
//! Per-connection state machine over a fixed-size pool, reworked from the
//! teacher's `tcp.rs` (which uses a growable `BTreeMap` of connections and
//! a full congestion-control/SACK/Nagle stack) down to exactly the design
//! here: a 32-slot pool indexed by a 32-bucket XOR hash, two-level locking
//! (`pool_lock` before `conn.lock`), and a 200 ms retransmit sweep with
//! 1 s→8 s doubling back-off. MSS-option parsing is kept from the
//! teacher almost verbatim; congestion control, SACK and Nagle coalescing
//! are dropped (see DESIGN.md).

use alloc::collections::VecDeque;
use alloc::vec::Vec;
use bitflags::bitflags;

use crate::collab::{Scheduler, TimeSource};
use crate::error::{NetError, Reason};
use crate::ip::{checksum_bytes, Ipv4Address};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TcpFlags: u8 {
        const FIN = 0x01;
        const SYN = 0x02;
        const RST = 0x04;
        const PSH = 0x08;
        const ACK = 0x10;
    }
}

/// Number of connection-pool slots and hash buckets (per §4.5.5, the
/// bucket count is fixed at 32 regardless of pool size; this
/// implementation sizes the pool to match).
pub const POOL_SIZE: usize = 32;
const HASH_BUCKETS: usize = 32;

const SEND_RING_CAP: usize = 8192;
const RECV_RING_CAP: usize = 8192;

pub const DEFAULT_MSS: u16 = 536;
const INITIAL_RTO_MS: u64 = 1_000;
const MAX_RTO_MS: u64 = 8_000;
const TIME_WAIT_MS: u64 = 2_000;
/// Retransmit sweep period, driven externally by a [`crate::collab::PeriodicTimer`].
pub const RETRANSMIT_TICK_MS: u64 = 200;
const ACCEPT_POLL_MS: u64 = 1;
const CONNECT_TIMEOUT_MS: u64 = 5_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Free,
    Listen,
    SynSent,
    SynReceived,
    Established,
    FinWait1,
    FinWait2,
    CloseWait,
    LastAck,
    Closing,
    TimeWait,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FourTuple {
    pub local_ip: Ipv4Address,
    pub local_port: u16,
    pub remote_ip: Ipv4Address,
    pub remote_port: u16,
}

/// `h = lip ^ rip ^ (lport<<16) ^ rport`, folded twice (16→8 bits), then
/// taken modulo the bucket count (§4.5.5).
fn hash4(t: &FourTuple) -> usize {
    let lip: u32 = t.local_ip.into();
    let rip: u32 = t.remote_ip.into();
    let mut h: u32 = lip ^ rip ^ ((t.local_port as u32) << 16) ^ (t.remote_port as u32);
    h ^= h >> 16;
    h ^= h >> 8;
    (h as usize) & (HASH_BUCKETS - 1)
}

#[derive(Debug, Clone)]
pub struct TcpHeader {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    pub ack: u32,
    pub flags: TcpFlags,
    pub window: u16,
    pub checksum: u16,
    pub urgent_ptr: u16,
    pub mss: Option<u16>,
}

impl TcpHeader {
    pub const MIN_SIZE: usize = 20;

    pub fn parse(data: &[u8]) -> Result<(Self, usize), NetError> {
        if data.len() < Self::MIN_SIZE {
            return Err(NetError::BadPacket(Reason::ShortFrame));
        }
        let src_port = u16::from_be_bytes([data[0], data[1]]);
        let dst_port = u16::from_be_bytes([data[2], data[3]]);
        let seq = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
        let ack = u32::from_be_bytes([data[8], data[9], data[10], data[11]]);
        let data_offset = (data[12] >> 4) as usize * 4;
        let flags = TcpFlags::from_bits_truncate(data[13]);
        let window = u16::from_be_bytes([data[14], data[15]]);
        let checksum = u16::from_be_bytes([data[16], data[17]]);
        let urgent_ptr = u16::from_be_bytes([data[18], data[19]]);

        if data_offset < Self::MIN_SIZE || data.len() < data_offset {
            return Err(NetError::BadPacket(Reason::BadHeader));
        }
        let mss = parse_mss_option(&data[Self::MIN_SIZE..data_offset]);

        Ok((
            Self {
                src_port,
                dst_port,
                seq,
                ack,
                flags,
                window,
                checksum,
                urgent_ptr,
                mss,
            },
            data_offset,
        ))
    }

    /// Serialises header + options + payload and fills in the checksum
    /// against the given pseudo-header addresses.
    pub fn to_segment(&self, src: Ipv4Address, dst: Ipv4Address, payload: &[u8]) -> Vec<u8> {
        let options = match self.mss {
            Some(mss) => build_mss_option(mss),
            None => Vec::new(),
        };
        let data_offset = ((Self::MIN_SIZE + options.len()) / 4) as u8;

        let mut seg = Vec::with_capacity(Self::MIN_SIZE + options.len() + payload.len());
        seg.extend_from_slice(&self.src_port.to_be_bytes());
        seg.extend_from_slice(&self.dst_port.to_be_bytes());
        seg.extend_from_slice(&self.seq.to_be_bytes());
        seg.extend_from_slice(&self.ack.to_be_bytes());
        seg.push(data_offset << 4);
        seg.push(self.flags.bits());
        seg.extend_from_slice(&self.window.to_be_bytes());
        seg.extend_from_slice(&[0, 0]); // checksum placeholder
        seg.extend_from_slice(&self.urgent_ptr.to_be_bytes());
        seg.extend_from_slice(&options);
        seg.extend_from_slice(payload);

        let checksum = tcp_checksum(src, dst, &seg);
        seg[16] = (checksum >> 8) as u8;
        seg[17] = (checksum & 0xFF) as u8;
        seg
    }
}

fn parse_mss_option(options: &[u8]) -> Option<u16> {
    let mut i = 0;
    while i < options.len() {
        match options[i] {
            0 => break,       // end of options
            1 => i += 1,      // no-op
            2 if i + 3 < options.len() && options[i + 1] == 4 => {
                return Some(u16::from_be_bytes([options[i + 2], options[i + 3]]));
            }
            _ => {
                if i + 1 >= options.len() {
                    break;
                }
                let len = options[i + 1].max(2) as usize;
                i += len;
                continue;
            }
        }
    }
    None
}

fn build_mss_option(mss: u16) -> Vec<u8> {
    let mut out = alloc::vec![2u8, 4];
    out.extend_from_slice(&mss.to_be_bytes());
    out
}

fn tcp_checksum(src: Ipv4Address, dst: Ipv4Address, segment: &[u8]) -> u16 {
    let mut buf = Vec::with_capacity(12 + segment.len());
    buf.extend_from_slice(src.as_bytes());
    buf.extend_from_slice(dst.as_bytes());
    buf.push(0);
    buf.push(crate::ip::PROTOCOL_TCP);
    buf.extend_from_slice(&(segment.len() as u16).to_be_bytes());
    buf.extend_from_slice(segment);
    checksum_bytes(&buf)
}

/// Verifies a received segment's checksum: the pseudo-header sum over the
/// segment as transmitted (checksum field included) must fold to zero.
pub fn verify_checksum(src: Ipv4Address, dst: Ipv4Address, segment: &[u8]) -> bool {
    tcp_checksum(src, dst, segment) == 0
}

/// One connection-pool slot.
pub struct Connection {
    pub state: State,
    pub tuple: FourTuple,
    pub snd_una: u32,
    pub snd_nxt: u32,
    pub snd_wnd: u16,
    pub rcv_nxt: u32,
    pub rcv_wnd: u16,
    pub iss: u32,
    pub irs: u32,
    pub peer_mss: u16,
    pub send_ring: VecDeque<u8>,
    pub recv_ring: VecDeque<u8>,
    pub rto_ms: u64,
    pub retransmit_deadline: Option<u64>,
    pub time_wait_deadline: Option<u64>,
    pub data_ready: bool,
    pub conn_ready: bool,
    pub resolved_mac: Option<crate::ethernet::MacAddress>,
    pub listener_slot: Option<usize>,
    pub accepted: bool,
    pub peer_reset: bool,
}

impl Connection {
    fn free() -> Self {
        Self {
            state: State::Free,
            tuple: FourTuple {
                local_ip: Ipv4Address::ANY,
                local_port: 0,
                remote_ip: Ipv4Address::ANY,
                remote_port: 0,
            },
            snd_una: 0,
            snd_nxt: 0,
            snd_wnd: RECV_RING_CAP as u16,
            rcv_nxt: 0,
            rcv_wnd: RECV_RING_CAP as u16,
            iss: 0,
            irs: 0,
            peer_mss: DEFAULT_MSS,
            send_ring: VecDeque::new(),
            recv_ring: VecDeque::new(),
            rto_ms: INITIAL_RTO_MS,
            retransmit_deadline: None,
            time_wait_deadline: None,
            data_ready: false,
            conn_ready: false,
            resolved_mac: None,
            listener_slot: None,
            accepted: false,
            peer_reset: false,
        }
    }

    fn reset_to_free(&mut self) {
        *self = Self::free();
    }
}

/// A segment ready to go out: header plus payload, still missing the
/// pseudo-header's own addresses (the caller supplies those, since only
/// it knows which interface/IP pair is sending).
pub struct OutSegment {
    pub header: TcpHeader,
    pub payload: Vec<u8>,
}

fn make_header(conn: &Connection, flags: TcpFlags, seq: u32, with_mss: Option<u16>) -> TcpHeader {
    TcpHeader {
        src_port: conn.tuple.local_port,
        dst_port: conn.tuple.remote_port,
        seq,
        ack: conn.rcv_nxt,
        flags,
        window: conn.recv_wnd_available(),
        checksum: 0,
        urgent_ptr: 0,
        mss: with_mss,
    }
}

impl Connection {
    fn recv_wnd_available(&self) -> u16 {
        (RECV_RING_CAP - self.recv_ring.len()).min(u16::MAX as usize) as u16
    }
}

struct PoolIndex {
    used: [bool; POOL_SIZE],
    buckets: [Vec<usize>; HASH_BUCKETS],
}

impl PoolIndex {
    fn new() -> Self {
        const EMPTY: Vec<usize> = Vec::new();
        Self {
            used: [false; POOL_SIZE],
            buckets: [EMPTY; HASH_BUCKETS],
        }
    }
}

/// The fixed-size TCP connection pool.
pub struct Pool {
    index: spin::Mutex<PoolIndex>,
    slots: Vec<spin::Mutex<Connection>>,
}

impl Pool {
    pub fn new() -> Self {
        let mut slots = Vec::with_capacity(POOL_SIZE);
        for _ in 0..POOL_SIZE {
            slots.push(spin::Mutex::new(Connection::free()));
        }
        Self {
            index: spin::Mutex::new(PoolIndex::new()),
            slots,
        }
    }

    fn alloc_slot(&self) -> Option<usize> {
        let mut idx = self.index.lock();
        let slot = idx.used.iter().position(|u| !u)?;
        idx.used[slot] = true;
        Some(slot)
    }

    fn insert_hash(&self, slot: usize, tuple: &FourTuple) {
        let mut idx = self.index.lock();
        idx.buckets[hash4(tuple)].push(slot);
    }

    fn remove_hash(&self, slot: usize, tuple: &FourTuple) {
        let mut idx = self.index.lock();
        let bucket = &mut idx.buckets[hash4(tuple)];
        bucket.retain(|&s| s != slot);
    }

    fn find_connection(&self, tuple: &FourTuple) -> Option<usize> {
        let idx = self.index.lock();
        let bucket = &idx.buckets[hash4(tuple)];
        for &slot in bucket {
            let conn = self.slots[slot].lock();
            if conn.tuple == *tuple && conn.state != State::Free {
                return Some(slot);
            }
        }
        None
    }

    fn find_listener(&self, local_ip: Ipv4Address, local_port: u16) -> Option<usize> {
        for (i, slot) in self.slots.iter().enumerate() {
            let conn = slot.lock();
            if conn.state == State::Listen
                && conn.tuple.local_port == local_port
                && (conn.tuple.local_ip == local_ip || conn.tuple.local_ip == Ipv4Address::ANY)
            {
                return Some(i);
            }
        }
        None
    }

    pub fn lock(&self, slot: usize) -> spin::MutexGuard<'_, Connection> {
        self.slots[slot].lock()
    }

    /// Opens a listening slot on `local_port`; the listener is never
    /// inserted into the hash table (§4.5.5).
    pub fn listen(&self, local_ip: Ipv4Address, local_port: u16) -> Result<usize, NetError> {
        let slot = self.alloc_slot().ok_or(NetError::Resource(Reason::NoFreeSlot))?;
        let mut conn = self.lock(slot);
        conn.state = State::Listen;
        conn.tuple = FourTuple {
            local_ip,
            local_port,
            remote_ip: Ipv4Address::ANY,
            remote_port: 0,
        };
        Ok(slot)
    }

    /// Polls for a completed passive-open connection spawned by
    /// `listener_slot`, with brief waits, until one is ready or the task
    /// is told to stop.
    pub fn accept(&self, listener_slot: usize, scheduler: &dyn Scheduler) -> Result<usize, NetError> {
        loop {
            if scheduler.current_task_stopping() {
                return Err(NetError::Cancelled);
            }
            for (i, slot) in self.slots.iter().enumerate() {
                let mut conn = slot.lock();
                if conn.listener_slot == Some(listener_slot)
                    && conn.state == State::Established
                    && !conn.accepted
                {
                    conn.accepted = true;
                    return Ok(i);
                }
            }
            scheduler.sleep(ACCEPT_POLL_MS * 1_000_000);
        }
    }

    /// Actively opens a connection. ARP resolution (`resolved_mac`) must
    /// already have happened in the caller, before any lock here is
    /// taken (§4.5.4).
    pub fn connect(
        &self,
        local_ip: Ipv4Address,
        local_port: u16,
        remote_ip: Ipv4Address,
        remote_port: u16,
        resolved_mac: crate::ethernet::MacAddress,
        iss: u32,
        time: &dyn TimeSource,
        mut transmit: impl FnMut(&Connection, &OutSegment),
    ) -> Result<usize, NetError> {
        let slot = self.alloc_slot().ok_or(NetError::Resource(Reason::NoFreeSlot))?;
        let tuple = FourTuple {
            local_ip,
            local_port,
            remote_ip,
            remote_port,
        };
        self.insert_hash(slot, &tuple);

        let mut conn = self.lock(slot);
        conn.tuple = tuple;
        conn.state = State::SynSent;
        conn.iss = iss;
        conn.snd_una = iss;
        conn.snd_nxt = iss;
        conn.resolved_mac = Some(resolved_mac);

        let header = make_header(&conn, TcpFlags::SYN, conn.snd_nxt, Some(DEFAULT_MSS));
        transmit(&conn, &OutSegment { header, payload: Vec::new() });
        conn.snd_nxt = conn.snd_nxt.wrapping_add(1);
        conn.retransmit_deadline = Some(time.now_ms() + conn.rto_ms);

        Ok(slot)
    }

    /// Blocks (cooperative 1 ms polling) until `connect`'s handshake
    /// completes, or the 5 s connect timeout / cancellation fires.
    pub fn wait_connected(&self, slot: usize, scheduler: &dyn Scheduler, time: &dyn TimeSource) -> Result<(), NetError> {
        let deadline = time.now_ms() + CONNECT_TIMEOUT_MS;
        loop {
            {
                let mut conn = self.lock(slot);
                if conn.conn_ready {
                    conn.conn_ready = false;
                    return match conn.state {
                        State::Established => Ok(()),
                        State::Closed => Err(NetError::PeerReset),
                        _ => Ok(()),
                    };
                }
            }
            if scheduler.current_task_stopping() {
                return Err(NetError::Cancelled);
            }
            if time.now_ms() >= deadline {
                return Err(NetError::Timeout(Reason::ConnectTimeout));
            }
            scheduler.sleep(1_000_000);
        }
    }

    /// Fragments `data` into `min(peer_mss, free ring space)` segments,
    /// transmitting each with ACK|PSH, looping under the connection lock
    /// (dropped across each back-pressure sleep).
    pub fn send(
        &self,
        slot: usize,
        data: &[u8],
        scheduler: &dyn Scheduler,
        time: &dyn TimeSource,
        mut transmit: impl FnMut(&Connection, &OutSegment),
    ) -> Result<usize, NetError> {
        let mut written = 0usize;
        while written < data.len() {
            if scheduler.current_task_stopping() {
                return if written == 0 { Err(NetError::Cancelled) } else { Ok(written) };
            }
            let mut conn = self.lock(slot);
            match conn.state {
                State::Established | State::CloseWait => {}
                State::Closed | State::TimeWait if conn.peer_reset => return Err(NetError::PeerReset),
                State::Closed | State::TimeWait => return Ok(written),
                _ => return Err(NetError::Protocol(Reason::UnexpectedFlags)),
            }

            let capacity = SEND_RING_CAP - conn.send_ring.len();
            if capacity == 0 {
                drop(conn);
                scheduler.sleep(1_000_000);
                continue;
            }

            let seg_len = capacity.min(conn.peer_mss as usize).min(data.len() - written);
            let seg = &data[written..written + seg_len];
            conn.send_ring.extend(seg.iter().copied());

            let seq = conn.snd_nxt;
            let header = make_header(&conn, TcpFlags::ACK | TcpFlags::PSH, seq, None);
            transmit(&conn, &OutSegment { header, payload: seg.to_vec() });
            conn.snd_nxt = conn.snd_nxt.wrapping_add(seg_len as u32);
            if conn.retransmit_deadline.is_none() {
                conn.retransmit_deadline = Some(time.now_ms() + conn.rto_ms);
            }
            written += seg_len;
        }
        Ok(written)
    }

    /// Returns buffered bytes, `0` on orderly EOF (peer FIN, ring
    /// drained), or an error.
    pub fn recv(
        &self,
        slot: usize,
        buf: &mut [u8],
        scheduler: &dyn Scheduler,
    ) -> Result<usize, NetError> {
        loop {
            let mut conn = self.lock(slot);
            if !conn.recv_ring.is_empty() {
                let n = buf.len().min(conn.recv_ring.len());
                for b in buf.iter_mut().take(n) {
                    *b = conn.recv_ring.pop_front().unwrap();
                }
                if conn.recv_ring.is_empty() {
                    conn.data_ready = false;
                }
                return Ok(n);
            }
            if conn.peer_reset {
                return Err(NetError::PeerReset);
            }
            match conn.state {
                State::CloseWait | State::Closed | State::LastAck | State::TimeWait => return Ok(0),
                _ => {}
            }
            drop(conn);
            if scheduler.current_task_stopping() {
                return Err(NetError::Cancelled);
            }
            scheduler.sleep(1_000_000);
        }
    }

    /// User-initiated close; idempotent and safe in every state.
    pub fn close(&self, slot: usize, time: &dyn TimeSource, mut transmit: impl FnMut(&Connection, &OutSegment)) {
        let mut conn = self.lock(slot);
        match conn.state {
            State::Established => {
                let seq = conn.snd_nxt;
                let header = make_header(&conn, TcpFlags::FIN | TcpFlags::ACK, seq, None);
                transmit(&conn, &OutSegment { header, payload: Vec::new() });
                conn.snd_nxt = conn.snd_nxt.wrapping_add(1);
                conn.state = State::FinWait1;
                if conn.retransmit_deadline.is_none() {
                    conn.retransmit_deadline = Some(time.now_ms() + conn.rto_ms);
                }
            }
            State::CloseWait => {
                let seq = conn.snd_nxt;
                let header = make_header(&conn, TcpFlags::FIN | TcpFlags::ACK, seq, None);
                transmit(&conn, &OutSegment { header, payload: Vec::new() });
                conn.snd_nxt = conn.snd_nxt.wrapping_add(1);
                conn.state = State::LastAck;
                if conn.retransmit_deadline.is_none() {
                    conn.retransmit_deadline = Some(time.now_ms() + conn.rto_ms);
                }
            }
            State::Listen | State::SynSent | State::Free => {
                conn.state = State::Closed;
            }
            _ => {}
            // Already closing/closed: no-op, second close returns cleanly.
        }
    }

    /// Applies an inbound segment to whichever connection (or listener)
    /// it matches, per the §4.5.1 transition table. Never returns an
    /// error that should reach a user operation — malformed or
    /// unmatched segments are handled (dropped, or answered with RST)
    /// internally.
    pub fn process_rx(
        &self,
        local_ip: Ipv4Address,
        remote_ip: Ipv4Address,
        header: TcpHeader,
        payload: &[u8],
        time: &dyn TimeSource,
        mut transmit_raw: impl FnMut(Ipv4Address, Ipv4Address, &TcpHeader, &[u8]),
    ) {
        let tuple = FourTuple {
            local_ip,
            local_port: header.dst_port,
            remote_ip,
            remote_port: header.src_port,
        };

        if let Some(slot) = self.find_connection(&tuple) {
            let mut conn = self.lock(slot);
            self.step(&mut conn, &header, payload, time, &mut transmit_raw);
            return;
        }

        if header.flags.contains(TcpFlags::SYN) && !header.flags.contains(TcpFlags::ACK) {
            if let Some(listener) = self.find_listener(local_ip, header.dst_port) {
                if let Some(new_slot) = self.alloc_slot() {
                    self.insert_hash(new_slot, &tuple);
                    let mut conn = self.lock(new_slot);
                    conn.tuple = tuple;
                    conn.state = State::SynReceived;
                    conn.listener_slot = Some(listener);
                    conn.irs = header.seq;
                    conn.rcv_nxt = header.seq.wrapping_add(1);
                    conn.peer_mss = header.mss.unwrap_or(DEFAULT_MSS);
                    let iss = time.now_ms() as u32;
                    conn.iss = iss;
                    conn.snd_una = iss;
                    conn.snd_nxt = iss;
                    let out = make_header(&conn, TcpFlags::SYN | TcpFlags::ACK, conn.snd_nxt, Some(DEFAULT_MSS));
                    transmit_raw(local_ip, remote_ip, &out, &[]);
                    conn.snd_nxt = conn.snd_nxt.wrapping_add(1);
                    conn.retransmit_deadline = Some(time.now_ms() + conn.rto_ms);
                }
            }
            return;
        }

        if !header.flags.contains(TcpFlags::RST) {
            let rst = TcpHeader {
                src_port: header.dst_port,
                dst_port: header.src_port,
                seq: header.ack,
                ack: header.seq.wrapping_add(payload.len() as u32),
                flags: TcpFlags::RST,
                window: 0,
                checksum: 0,
                urgent_ptr: 0,
                mss: None,
            };
            transmit_raw(local_ip, remote_ip, &rst, &[]);
        }
    }

    fn step(
        &self,
        conn: &mut Connection,
        header: &TcpHeader,
        payload: &[u8],
        time: &dyn TimeSource,
        transmit_raw: &mut impl FnMut(Ipv4Address, Ipv4Address, &TcpHeader, &[u8]),
    ) {
        if header.flags.contains(TcpFlags::RST) && !matches!(conn.state, State::Listen | State::Free) {
            conn.state = State::Closed;
            conn.peer_reset = true;
            conn.conn_ready = true;
            conn.data_ready = true;
            conn.retransmit_deadline = None;
            return;
        }

        let ack_advances = header.flags.contains(TcpFlags::ACK)
            && (header.ack.wrapping_sub(conn.snd_una) as i32) > 0
            && (header.ack.wrapping_sub(conn.snd_nxt) as i32) <= 0;
        if ack_advances {
            let advanced = header.ack.wrapping_sub(conn.snd_una) as usize;
            for _ in 0..advanced.min(conn.send_ring.len()) {
                conn.send_ring.pop_front();
            }
            conn.snd_una = header.ack;
            if conn.snd_una == conn.snd_nxt {
                conn.retransmit_deadline = None;
                conn.rto_ms = INITIAL_RTO_MS;
            }
        }

        let local_ip = conn.tuple.local_ip;
        let remote_ip = conn.tuple.remote_ip;
        let mut send_ack = |conn: &Connection, transmit_raw: &mut impl FnMut(Ipv4Address, Ipv4Address, &TcpHeader, &[u8])| {
            let out = make_header(conn, TcpFlags::ACK, conn.snd_nxt, None);
            transmit_raw(local_ip, remote_ip, &out, &[]);
        };

        match conn.state {
            State::SynSent => {
                if header.flags.contains(TcpFlags::SYN) && header.flags.contains(TcpFlags::ACK) && header.ack == conn.snd_nxt {
                    conn.irs = header.seq;
                    conn.rcv_nxt = header.seq.wrapping_add(1);
                    conn.peer_mss = header.mss.unwrap_or(DEFAULT_MSS);
                    conn.state = State::Established;
                    conn.conn_ready = true;
                    conn.retransmit_deadline = None;
                    send_ack(conn, transmit_raw);
                } else if header.flags.contains(TcpFlags::ACK) {
                    let rst = TcpHeader {
                        src_port: conn.tuple.local_port,
                        dst_port: conn.tuple.remote_port,
                        seq: header.ack,
                        ack: 0,
                        flags: TcpFlags::RST,
                        window: 0,
                        checksum: 0,
                        urgent_ptr: 0,
                        mss: None,
                    };
                    transmit_raw(local_ip, remote_ip, &rst, &[]);
                }
            }
            State::SynReceived => {
                if header.flags.contains(TcpFlags::ACK) && header.ack == conn.snd_nxt {
                    conn.state = State::Established;
                    conn.conn_ready = true;
                    conn.retransmit_deadline = None;
                }
            }
            State::Established => {
                if !payload.is_empty() {
                    if header.seq == conn.rcv_nxt {
                        let room = RECV_RING_CAP - conn.recv_ring.len();
                        let take = payload.len().min(room);
                        conn.recv_ring.extend(payload[..take].iter().copied());
                        conn.rcv_nxt = conn.rcv_nxt.wrapping_add(take as u32);
                        conn.data_ready = true;
                        send_ack(conn, transmit_raw);
                    } else {
                        send_ack(conn, transmit_raw);
                    }
                }
                if header.flags.contains(TcpFlags::FIN) && header.seq.wrapping_add(payload.len() as u32) == conn.rcv_nxt {
                    conn.rcv_nxt = conn.rcv_nxt.wrapping_add(1);
                    conn.state = State::CloseWait;
                    conn.data_ready = true;
                    send_ack(conn, transmit_raw);
                }
            }
            State::FinWait1 => {
                let fin_acked = header.flags.contains(TcpFlags::ACK) && header.ack == conn.snd_nxt;
                let got_fin = header.flags.contains(TcpFlags::FIN);
                if got_fin {
                    conn.rcv_nxt = conn.rcv_nxt.wrapping_add(1);
                    send_ack(conn, transmit_raw);
                }
                conn.state = match (got_fin, fin_acked) {
                    (true, true) => {
                        conn.time_wait_deadline = Some(time.now_ms() + TIME_WAIT_MS);
                        State::TimeWait
                    }
                    (true, false) => State::Closing,
                    (false, true) => {
                        conn.retransmit_deadline = None;
                        State::FinWait2
                    }
                    (false, false) => State::FinWait1,
                };
            }
            State::FinWait2 => {
                if header.flags.contains(TcpFlags::FIN) {
                    conn.rcv_nxt = conn.rcv_nxt.wrapping_add(1);
                    send_ack(conn, transmit_raw);
                    conn.time_wait_deadline = Some(time.now_ms() + TIME_WAIT_MS);
                    conn.state = State::TimeWait;
                }
            }
            State::Closing => {
                if header.flags.contains(TcpFlags::ACK) && header.ack == conn.snd_nxt {
                    conn.time_wait_deadline = Some(time.now_ms() + TIME_WAIT_MS);
                    conn.state = State::TimeWait;
                }
            }
            State::LastAck => {
                if header.flags.contains(TcpFlags::ACK) && header.ack == conn.snd_nxt {
                    conn.state = State::Closed;
                    conn.conn_ready = true;
                    conn.retransmit_deadline = None;
                }
            }
            State::CloseWait | State::TimeWait | State::Closed | State::Listen | State::Free => {}
        }
    }

    /// Runs the 200 ms retransmit/cleanup sweep over every non-Free slot.
    pub fn tick(&self, time: &dyn TimeSource, mut transmit_raw: impl FnMut(Ipv4Address, Ipv4Address, &TcpHeader, &[u8])) {
        let now = time.now_ms();
        let mut to_free: Vec<usize> = Vec::new();

        for (i, slot) in self.slots.iter().enumerate() {
            let mut conn = slot.lock();
            if conn.state == State::Free {
                continue;
            }

            if conn.state == State::TimeWait {
                if let Some(d) = conn.time_wait_deadline {
                    if now >= d {
                        conn.state = State::Closed;
                    }
                }
            }
            if conn.state == State::Closed {
                to_free.push(i);
                continue;
            }

            let due = conn.retransmit_deadline.map(|d| now >= d).unwrap_or(false);
            if !due {
                continue;
            }

            let local_ip = conn.tuple.local_ip;
            let remote_ip = conn.tuple.remote_ip;
            match conn.state {
                State::SynSent => {
                    conn.snd_nxt = conn.snd_una;
                    let header = make_header(&conn, TcpFlags::SYN, conn.snd_nxt, Some(DEFAULT_MSS));
                    transmit_raw(local_ip, remote_ip, &header, &[]);
                    conn.snd_nxt = conn.snd_nxt.wrapping_add(1);
                }
                State::SynReceived => {
                    let header = make_header(&conn, TcpFlags::SYN | TcpFlags::ACK, conn.snd_una, Some(DEFAULT_MSS));
                    transmit_raw(local_ip, remote_ip, &header, &[]);
                }
                State::FinWait1 | State::LastAck | State::Closing => {
                    if conn.snd_una != conn.snd_nxt && !conn.send_ring.is_empty() {
                        retransmit_unacked(&mut conn, local_ip, remote_ip, transmit_raw.by_ref());
                    } else {
                        let fin_seq = conn.snd_nxt.wrapping_sub(1);
                        let header = make_header(&conn, TcpFlags::FIN | TcpFlags::ACK, fin_seq, None);
                        transmit_raw(local_ip, remote_ip, &header, &[]);
                    }
                }
                State::Established | State::CloseWait => {
                    if conn.snd_una != conn.snd_nxt {
                        retransmit_unacked(&mut conn, local_ip, remote_ip, transmit_raw.by_ref());
                    }
                }
                _ => {}
            }

            conn.rto_ms = (conn.rto_ms * 2).min(MAX_RTO_MS);
            conn.retransmit_deadline = Some(now + conn.rto_ms);
        }

        for i in to_free {
            let tuple = {
                let conn = self.lock(i);
                conn.tuple
            };
            self.remove_hash(i, &tuple);
            {
                let mut conn = self.lock(i);
                conn.reset_to_free();
            }
            let mut idx = self.index.lock();
            idx.used[i] = false;
        }
    }
}

fn retransmit_unacked(
    conn: &mut Connection,
    local_ip: Ipv4Address,
    remote_ip: Ipv4Address,
    transmit_raw: &mut dyn FnMut(Ipv4Address, Ipv4Address, &TcpHeader, &[u8]),
) {
    let used = conn.send_ring.len();
    let take = used.min(conn.peer_mss as usize);
    let bytes: Vec<u8> = conn.send_ring.iter().take(take).copied().collect();
    let header = make_header(conn, TcpFlags::ACK | TcpFlags::PSH, conn.snd_una, None);
    transmit_raw(local_ip, remote_ip, &header, &bytes);
}

impl Default for Pool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
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

    struct NoopScheduler;
    impl Scheduler for NoopScheduler {
        fn sleep(&self, _ns: u64) {}
        fn task_start(&self, _f: fn(*mut u8), _ctx: *mut u8) -> crate::collab::TaskHandle {
            crate::collab::TaskHandle(0)
        }
        fn task_set_stopping(&self, _h: crate::collab::TaskHandle) {}
        fn task_wait(&self, _h: crate::collab::TaskHandle) {}
        fn current_task_stopping(&self) -> bool {
            false
        }
    }

    #[test]
    fn active_open_single_segment() {
        let pool = Pool::new();
        let time = FixedTime(AtomicU64::new(0));
        let local = Ipv4Address::new(10, 0, 0, 42);
        let remote = Ipv4Address::new(10, 0, 0, 5);
        let mac = crate::ethernet::MacAddress([2, 0, 0, 0, 0, 1]);

        let slot = pool
            .connect(local, 40000, remote, 80, mac, 1000, &time, |_c, _seg| {})
            .unwrap();

        let syn_ack = TcpHeader {
            src_port: 80,
            dst_port: 40000,
            seq: 5000,
            ack: 1001,
            flags: TcpFlags::SYN | TcpFlags::ACK,
            window: 4096,
            checksum: 0,
            urgent_ptr: 0,
            mss: Some(1460),
        };
        pool.process_rx(local, remote, syn_ack, &[], &time, |_l, _r, _h, _p| {});

        {
            let conn = pool.lock(slot);
            assert_eq!(conn.state, State::Established);
            assert_eq!(conn.peer_mss, 1460);
        }

        let mut sent = Vec::new();
        let n = pool
            .send(slot, b"GET /\r\n\r\n", &NoopScheduler, &time, |_c, seg| {
                sent.push((seg.header.seq, seg.payload.clone()));
            })
            .unwrap();
        assert_eq!(n, 9);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, 1001);
        assert_eq!(sent[0].1, b"GET /\r\n\r\n");

        let ack = TcpHeader {
            src_port: 80,
            dst_port: 40000,
            seq: 5001,
            ack: 1010,
            flags: TcpFlags::ACK,
            window: 4096,
            checksum: 0,
            urgent_ptr: 0,
            mss: None,
        };
        pool.process_rx(local, remote, ack, &[], &time, |_l, _r, _h, _p| {});
        let conn = pool.lock(slot);
        assert_eq!(conn.snd_una, 1010);
        assert!(conn.retransmit_deadline.is_none());
    }

    #[test]
    fn retransmit_backoff_doubles() {
        let pool = Pool::new();
        let time = FixedTime(AtomicU64::new(0));
        let local = Ipv4Address::new(10, 0, 0, 42);
        let remote = Ipv4Address::new(10, 0, 0, 5);
        let mac = crate::ethernet::MacAddress([2, 0, 0, 0, 0, 1]);
        let slot = pool
            .connect(local, 1, remote, 2, mac, 0, &time, |_c, _s| {})
            .unwrap();
        {
            let mut conn = pool.lock(slot);
            conn.state = State::Established;
            conn.snd_una = 1;
            conn.snd_nxt = 1;
        }
        let mut retransmits = Vec::new();
        let n = pool
            .send(slot, &[0u8; 100], &NoopScheduler, &time, |_c, seg| {
                retransmits.push((time.now_ms(), seg.header.seq));
            })
            .unwrap();
        assert_eq!(n, 100);

        let deadlines = [1000u64, 3000, 7000, 15000];
        for d in deadlines {
            time.0.store(d, Ordering::SeqCst);
            pool.tick(&time, |l, r, h, p| {
                retransmits.push((time.now_ms(), h.seq));
                let _ = (l, r, p);
            });
        }
        assert_eq!(retransmits.len(), 5); // initial send + 4 retransmits
        for (_, seq) in &retransmits {
            assert_eq!(*seq, 1);
        }
    }

    #[test]
    fn passive_close_drains_then_eof() {
        let pool = Pool::new();
        let time = FixedTime(AtomicU64::new(0));
        let local = Ipv4Address::new(10, 0, 0, 42);
        let remote = Ipv4Address::new(10, 0, 0, 5);
        let slot = pool.listen(local, 80).unwrap();
        let _ = slot;
        // Fabricate an established connection directly (bypassing the
        // SYN handshake, which is exercised by `active_open_single_segment`).
        let est_slot = pool.alloc_slot().unwrap();
        pool.insert_hash(
            est_slot,
            &FourTuple {
                local_ip: local,
                local_port: 80,
                remote_ip: remote,
                remote_port: 4242,
            },
        );
        {
            let mut conn = pool.lock(est_slot);
            conn.tuple = FourTuple {
                local_ip: local,
                local_port: 80,
                remote_ip: remote,
                remote_port: 4242,
            };
            conn.state = State::Established;
            conn.rcv_nxt = 100;
            conn.snd_nxt = 200;
            conn.snd_una = 200;
            conn.recv_ring.extend([1u8, 2, 3, 4]);
        }

        let fin = TcpHeader {
            src_port: 4242,
            dst_port: 80,
            seq: 100,
            ack: 200,
            flags: TcpFlags::FIN | TcpFlags::ACK,
            window: 4096,
            checksum: 0,
            urgent_ptr: 0,
            mss: None,
        };
        pool.process_rx(local, remote, fin, &[], &time, |_l, _r, _h, _p| {});
        assert_eq!(pool.lock(est_slot).state, State::CloseWait);

        let mut buf = [0u8; 8];
        let n = pool.recv(est_slot, &mut buf, &NoopScheduler).unwrap();
        assert_eq!(n, 4);
        assert_eq!(&buf[..4], &[1, 2, 3, 4]);
        let eof = pool.recv(est_slot, &mut buf, &NoopScheduler).unwrap();
        assert_eq!(eof, 0);

        pool.close(est_slot, &time, |_c, _s| {});
        assert_eq!(pool.lock(est_slot).state, State::LastAck);
    }
}
