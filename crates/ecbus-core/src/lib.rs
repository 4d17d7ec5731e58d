#![warn(missing_docs)]

//! ecbus-core: foundational types shared by every layer of the master stack.
//!
//! This crate provides the pieces that have no protocol knowledge of their own:
//! - Configuration types
//! - Error handling
//! - Wire constants
//! - The fixed-capacity buffer pool used on the real-time path
//! - The hardware port abstraction and frame interceptors
//!
//! Wire encoding lives in `ecbus-protocol`, the per-slave mailbox in
//! `ecbus-mailbox` and the datagram engine and cyclic loop in `ecbus-master`.

/// Wire and sizing constants shared across layers.
pub mod constants {
    /// Ethertype carried by every fieldbus frame.
    pub const ETHERTYPE_ECAT: u16 = 0x88A4;
    /// UDP port used when frames are tunneled over UDP.
    pub const ECAT_UDP_PORT: u16 = 0x88A4;
    /// Size of the Ethernet header (two MAC addresses plus ethertype).
    pub const ETH_HEADER_SIZE: usize = 14;
    /// Size of the EtherCAT frame header following the Ethernet header.
    pub const FRAME_HEADER_SIZE: usize = 2;
    /// Size of a datagram header (cmd, idx, address, len/flags, irq).
    pub const DATAGRAM_HEADER_SIZE: usize = 10;
    /// Size of the work counter trailing every datagram payload.
    pub const WKC_SIZE: usize = 2;
    /// Size of the mailbox header.
    pub const MAILBOX_HEADER_SIZE: usize = 6;
    /// Largest Ethernet frame without FCS.
    pub const ETH_FRAME_LEN: usize = 1518;
    /// Default MTU of the Ethernet payload.
    pub const DEFAULT_MTU: usize = 1500;
    /// Capacity of a single pool entry buffer.
    pub const MAX_POOL_DATA_SIZE: usize = 1600;
    /// Number of distinct datagram indices (one byte on the wire).
    pub const DATAGRAM_INDEX_COUNT: usize = 256;
    /// Largest datagram payload expressible in the 11 bit length field.
    pub const MAX_DATAGRAM_PAYLOAD: usize = 0x07FF;
}

/// Configuration options for the master, its pools and mailboxes.
pub mod config;
/// Error types and results.
pub mod error;
/// Frame interception for capture and diagnostics.
pub mod interceptor;
/// MAC address helpers.
pub mod mac;
/// Fixed-capacity buffer pool and index-linked entry lists.
pub mod pool;
/// Mailbox protocol identifiers and support masks.
pub mod protocols;
/// Hardware port abstraction for pluggable frame I/O.
pub mod transport;
