use std::{default::Default, time::Duration};

use crate::{
    constants::{DEFAULT_MTU, MAX_POOL_DATA_SIZE},
    mac::{MacAddress, BROADCAST_MAC},
    protocols::{MailboxProtocols, MailboxType, DEFAULT_MAILBOX_PRIORITY},
};

#[derive(Clone, Debug)]
/// Configuration options to tune the master, its pools and mailboxes.
pub struct Config {
    /// Make the underlying socket block when true, otherwise non-blocking.
    pub blocking_mode: bool,
    /// Number of pre-allocated entries in the datagram pool.
    pub pool_size: usize,
    /// Capacity of each pool entry in bytes.
    pub pool_entry_size: usize,
    /// Maximum Ethernet payload per frame (EtherCAT header plus datagrams).
    pub mtu: usize,
    /// Source MAC address stamped into outgoing frames.
    pub source_mac: MacAddress,
    /// Destination MAC address stamped into outgoing frames.
    pub destination_mac: MacAddress,
    /// Default receive timeout for scheduled datagrams.
    pub datagram_timeout: Duration,
    /// Sleep between cycles when the master polls on its own.
    pub cycle_interval: Duration,
    /// Default deadline for mailbox requests.
    pub mailbox_timeout: Duration,
    /// Interval at which a mailbox handler checks the read slot without being kicked.
    pub mailbox_poll_interval: Duration,
    /// Send and receive buffers allocated per slave mailbox.
    pub mailbox_pool_size: usize,
    /// Write attempts per handler turn before a buffer is requeued at the head.
    pub mailbox_write_retries: u8,
    /// Order in which ready tag queues are drained.
    pub mailbox_priority: [MailboxType; 7],
    /// Socket receive buffer size in bytes (None = use system default).
    /// Corresponds to SO_RCVBUF socket option.
    pub socket_recv_buffer_size: Option<usize>,
    /// Socket send buffer size in bytes (None = use system default).
    /// Corresponds to SO_SNDBUF socket option.
    pub socket_send_buffer_size: Option<usize>,
    /// How long a blocking receive may wait for a frame.
    pub socket_polling_timeout: Option<Duration>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            blocking_mode: false,
            pool_size: 256,
            pool_entry_size: MAX_POOL_DATA_SIZE,
            mtu: DEFAULT_MTU,
            source_mac: MacAddress::new([0x00, 0x30, 0x64, 0x0f, 0x83, 0x35]),
            destination_mac: BROADCAST_MAC,
            datagram_timeout: Duration::from_millis(2),
            cycle_interval: Duration::from_millis(1),
            mailbox_timeout: Duration::from_secs(1),
            mailbox_poll_interval: Duration::from_millis(10),
            mailbox_pool_size: 64,
            mailbox_write_retries: 10,
            mailbox_priority: DEFAULT_MAILBOX_PRIORITY,
            socket_recv_buffer_size: None, // Use system default
            socket_send_buffer_size: None, // Use system default
            socket_polling_timeout: Some(Duration::from_millis(1)),
        }
    }
}

/// Location and size of one sync manager channel in slave memory.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SyncManager {
    /// Sync manager number (selects the status register).
    pub number: u8,
    /// Physical start address of the buffer.
    pub address: u16,
    /// Buffer length in bytes.
    pub length: u16,
}

impl SyncManager {
    /// First sync manager status register; each channel occupies 8 bytes.
    pub const STATUS_REGISTER_BASE: u16 = 0x0805;

    /// Address of this channel's status register.
    pub fn status_register(&self) -> u16 {
        Self::STATUS_REGISTER_BASE + ((self.number as u16) << 3)
    }
}

/// Per-slave mailbox configuration.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SlaveConfig {
    /// Position of the slave on the bus.
    pub position: u16,
    /// Configured station address used for FPRD/FPWR.
    pub fixed_address: u16,
    /// Master-to-slave mailbox sync manager (conventionally SM0).
    pub write_sm: SyncManager,
    /// Slave-to-master mailbox sync manager (conventionally SM1).
    pub read_sm: SyncManager,
    /// Mailbox protocols the slave implements.
    pub supported: MailboxProtocols,
}

impl SlaveConfig {
    /// Creates a slave configuration using the conventional mailbox layout
    /// (SM0 at 0x1000 for writes, SM1 at 0x1080 for reads, 128 bytes each).
    pub fn new(position: u16, fixed_address: u16, supported: MailboxProtocols) -> Self {
        Self {
            position,
            fixed_address,
            write_sm: SyncManager { number: 0, address: 0x1000, length: 128 },
            read_sm: SyncManager { number: 1, address: 0x1080, length: 128 },
            supported,
        }
    }
}
