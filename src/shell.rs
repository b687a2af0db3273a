//! # UDP shell protocol
//!
//! Reworked from `original_source/net/udp_shell.cpp`'s `UdpShell`/`UdpPrinter`
//! pair: a single-pending-command mailbox fed by [`crate::udp::UdpListener`],
//! drained by a polling loop that executes the command through a
//! kernel-supplied [`ShellCommandHandler`] and replies in ≤1384-byte
//! chunks. Command parsing/dispatch itself stays out of scope — the
//! handler is the embedding kernel's `Cmd::Dispatch` equivalent.

use alloc::string::String;
use alloc::vec::Vec;

use crate::collab::Scheduler;
use crate::ip::Ipv4Address;
use crate::udp::UdpListener;

/// "NOSH" in ASCII.
pub const MAGIC: u32 = 0x4E4F_5348;
pub const FLAG_LAST: u16 = 0x0001;
pub const HEADER_SIZE: usize = 16;
pub const CHUNK_SIZE: usize = 1384;
const MAX_COMMAND_LEN: usize = 256;
const POLL_MS: u64 = 10;

#[derive(Debug, Clone, Copy)]
struct ShellHeader {
    magic: u32,
    seq_no: u32,
    chunk_idx: u16,
    flags: u16,
    payload_len: u16,
}

impl ShellHeader {
    fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < HEADER_SIZE {
            return None;
        }
        Some(Self {
            magic: u32::from_be_bytes([data[0], data[1], data[2], data[3]]),
            seq_no: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
            chunk_idx: u16::from_be_bytes([data[8], data[9]]),
            flags: u16::from_be_bytes([data[10], data[11]]),
            payload_len: u16::from_be_bytes([data[12], data[13]]),
        })
    }

    fn to_bytes(self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        out[0..4].copy_from_slice(&self.magic.to_be_bytes());
        out[4..8].copy_from_slice(&self.seq_no.to_be_bytes());
        out[8..10].copy_from_slice(&self.chunk_idx.to_be_bytes());
        out[10..12].copy_from_slice(&self.flags.to_be_bytes());
        out[12..14].copy_from_slice(&self.payload_len.to_be_bytes());
        out
    }
}

fn build_chunk(seq_no: u32, chunk_idx: u16, last: bool, payload: &[u8]) -> Vec<u8> {
    let header = ShellHeader {
        magic: MAGIC,
        seq_no,
        chunk_idx,
        flags: if last { FLAG_LAST } else { 0 },
        payload_len: payload.len() as u16,
    };
    let mut out = Vec::with_capacity(HEADER_SIZE + payload.len());
    out.extend_from_slice(&header.to_bytes());
    out.extend_from_slice(payload);
    out
}

/// Splits `output` into the reply chunk datagrams for one command: empty
/// output becomes a single zero-length chunk with LAST set (§6).
pub fn build_reply(seq_no: u32, output: &[u8]) -> Vec<Vec<u8>> {
    if output.is_empty() {
        return alloc::vec![build_chunk(seq_no, 0, true, &[])];
    }
    output
        .chunks(CHUNK_SIZE)
        .enumerate()
        .map(|(i, chunk)| {
            let last = (i + 1) * CHUNK_SIZE >= output.len();
            build_chunk(seq_no, i as u16, last, chunk)
        })
        .collect()
}

/// Executes a shell command and returns its textual output, supplied by
/// the embedding kernel (command parsing and dispatch are out of scope
/// here, matching `Cmd::Dispatch` in the original).
pub trait ShellCommandHandler: Send + Sync {
    fn execute(&self, command: &str) -> String;
}

#[derive(Debug, Clone)]
struct Pending {
    command: String,
    sender_ip: Ipv4Address,
    sender_port: u16,
    seq_no: u32,
}

/// Single-pending-command mailbox registered as a [`UdpListener`] on the
/// shell's port. A command arriving while one is already pending is
/// dropped, matching the original's "drop if previous command still
/// pending" rule.
pub struct ShellServer {
    port: u16,
    pending: spin::Mutex<Option<Pending>>,
}

impl ShellServer {
    pub fn new(port: u16) -> Self {
        Self {
            port,
            pending: spin::Mutex::new(None),
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Executes one pending command (if any) through `handler` and
    /// returns the reply datagrams to send back to the sender.
    fn drain(&self, handler: &dyn ShellCommandHandler) -> Option<(Ipv4Address, u16, Vec<Vec<u8>>)> {
        let pending = self.pending.lock().take()?;
        let output = handler.execute(&pending.command);
        let chunks = build_reply(pending.seq_no, output.as_bytes());
        Some((pending.sender_ip, pending.sender_port, chunks))
    }

    /// Runs the 10 ms poll loop (matching the original's `Sleep(10ms)`
    /// cadence), sending reply datagrams via `send` until the task is
    /// asked to stop.
    pub fn run(&self, handler: &dyn ShellCommandHandler, scheduler: &dyn Scheduler, mut send: impl FnMut(Ipv4Address, u16, Vec<u8>)) {
        while !scheduler.current_task_stopping() {
            if let Some((dest_ip, dest_port, chunks)) = self.drain(handler) {
                for chunk in chunks {
                    send(dest_ip, dest_port, chunk);
                }
            } else {
                scheduler.sleep(POLL_MS * 1_000_000);
            }
        }
    }
}

impl UdpListener for ShellServer {
    fn on_udp(&self, src: Ipv4Address, src_port: u16, _dest: Ipv4Address, payload: &[u8]) {
        let mut pending = self.pending.lock();
        if pending.is_some() {
            return;
        }
        let Some(hdr) = ShellHeader::parse(payload) else {
            return;
        };
        if hdr.magic != MAGIC {
            return;
        }
        let declared = hdr.payload_len as usize;
        if payload.len() < HEADER_SIZE || declared > payload.len() - HEADER_SIZE {
            return;
        }

        let take = declared.min(MAX_COMMAND_LEN);
        let mut bytes = payload[HEADER_SIZE..HEADER_SIZE + take].to_vec();
        while matches!(bytes.last(), Some(b'\n') | Some(b'\r')) {
            bytes.pop();
        }
        if bytes.is_empty() {
            return;
        }
        let command = String::from_utf8_lossy(&bytes).into_owned();

        *pending = Some(Pending {
            command,
            sender_ip: src,
            sender_port: src_port,
            seq_no: hdr.seq_no,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoHandler;
    impl ShellCommandHandler for EchoHandler {
        fn execute(&self, command: &str) -> String {
            alloc::format!("echo: {command}")
        }
    }

    fn frame(seq_no: u32, command: &str) -> Vec<u8> {
        let mut out = build_chunk(seq_no, 0, true, command.as_bytes());
        // payload_len in build_chunk is already the command length; reuse
        // it directly as the inbound frame.
        out.truncate(HEADER_SIZE + command.len());
        out
    }

    #[test]
    fn dispatches_and_echoes_seq_no() {
        let server = ShellServer::new(9000);
        server.on_udp(Ipv4Address::new(10, 0, 0, 5), 4000, Ipv4Address::ANY, &frame(77, "uptime\r\n"));

        let (ip, port, chunks) = server.drain(&EchoHandler).expect("a command was pending");
        assert_eq!(ip, Ipv4Address::new(10, 0, 0, 5));
        assert_eq!(port, 4000);
        assert_eq!(chunks.len(), 1);
        let hdr = ShellHeader::parse(&chunks[0]).unwrap();
        assert_eq!(hdr.magic, MAGIC);
        assert_eq!(hdr.seq_no, 77);
        assert_eq!(hdr.flags & FLAG_LAST, FLAG_LAST);
        assert_eq!(&chunks[0][HEADER_SIZE..], b"echo: uptime");
    }

    #[test]
    fn empty_command_is_ignored() {
        let server = ShellServer::new(9000);
        server.on_udp(Ipv4Address::new(10, 0, 0, 5), 4000, Ipv4Address::ANY, &frame(1, "\r\n"));
        assert!(server.drain(&EchoHandler).is_none());
    }

    #[test]
    fn busy_server_drops_second_command() {
        let server = ShellServer::new(9000);
        server.on_udp(Ipv4Address::new(10, 0, 0, 5), 4000, Ipv4Address::ANY, &frame(1, "first"));
        server.on_udp(Ipv4Address::new(10, 0, 0, 6), 4001, Ipv4Address::ANY, &frame(2, "second"));
        let (ip, _port, _chunks) = server.drain(&EchoHandler).unwrap();
        assert_eq!(ip, Ipv4Address::new(10, 0, 0, 5));
    }

    #[test]
    fn empty_output_is_a_single_zero_length_last_chunk() {
        let chunks = build_reply(5, &[]);
        assert_eq!(chunks.len(), 1);
        let hdr = ShellHeader::parse(&chunks[0]).unwrap();
        assert_eq!(hdr.payload_len, 0);
        assert_eq!(hdr.flags & FLAG_LAST, FLAG_LAST);
    }

    #[test]
    fn output_spanning_two_chunks_sets_last_on_final_only() {
        let output = alloc::vec![b'x'; CHUNK_SIZE + 10];
        let chunks = build_reply(1, &output);
        assert_eq!(chunks.len(), 2);
        let first = ShellHeader::parse(&chunks[0]).unwrap();
        let second = ShellHeader::parse(&chunks[1]).unwrap();
        assert_eq!(first.flags & FLAG_LAST, 0);
        assert_eq!(second.flags & FLAG_LAST, FLAG_LAST);
        assert_eq!(second.payload_len, 10);
    }
}
