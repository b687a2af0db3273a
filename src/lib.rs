//! # netcore
//!
//! The networking core of a small OS kernel: a VirtIO-net transport, the
//! ARP/DHCP/DNS supporting protocols, a TCP endpoint state machine, and
//! enough UDP/ICMP plumbing to host a remote shell. Runs in kernel space —
//! no heap-less restriction, but no OS underneath either; every blocking
//! operation is driven by a [`collab::Scheduler`] the embedding kernel
//! supplies rather than by threads or an async runtime.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │     NOSH shell       │   HTTP client     │
//! ├───────────────────────────────────────────┤
//! │    TCP      │     UDP     │    ICMP       │
//! ├─────────────────────────────────────────┤
//! │              IP Layer                    │
//! ├─────────────────────────────────────────┤
//! │         ARP  │  DHCP  │  DNS             │
//! ├─────────────────────────────────────────┤
//! │              Ethernet Layer              │
//! ├─────────────────────────────────────────┤
//! │       Network Device (virtio-net)        │
//! └─────────────────────────────────────────┘
//! ```
//!
//! [`stack::NetStack`] is the one value a kernel thread owns: it ties a
//! [`device::NetDevice`] to an [`device::Interface`] and every protocol
//! engine built on top of it. There is no process-wide singleton.

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]

extern crate alloc;

pub mod error;
pub mod collab;

pub mod ethernet;
pub mod arp;
pub mod ip;
pub mod icmp;
pub mod udp;
pub mod dhcp;
pub mod dns;
pub mod tcp;

pub mod virtio;
pub mod device;
pub mod stack;

pub mod shell;

#[cfg(feature = "http-client")]
pub mod http;

pub use collab::{Allocator, PageTable, PeriodicTimer, Scheduler, SoftIrq, TaskHandle, TimeSource};
pub use collab::{SOFTIRQ_NET_RX, SOFTIRQ_TCP_TIMER};
pub use device::{Interface, NetDevice, UdpBindings};
pub use error::{NetError, Reason};
pub use ethernet::{EthernetFrame, MacAddress};
pub use ip::{Ipv4Address, Ipv4Packet};
pub use stack::NetStack;
pub use tcp::Pool as TcpPool;
