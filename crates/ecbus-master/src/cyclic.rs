//! Cyclic datagrams: one outstanding datagram transaction each.

use std::{
    fmt,
    time::{Duration, Instant},
};

use ecbus_core::{error::Result, pool::PoolEntry};
use ecbus_protocol::{Command, DatagramHeader};

/// How a scheduled datagram ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatagramOutcome<'a> {
    /// The datagram came back; `payload` is what the slaves left in it.
    Response {
        /// Work counter accumulated by the responding slaves.
        wkc: u16,
        /// Returned payload, borrowed from the receive buffer.
        payload: &'a [u8],
    },
    /// No response arrived before the deadline.
    Timeout,
}

impl DatagramOutcome<'_> {
    /// Work counter of a response, `None` for a timeout.
    pub fn wkc(&self) -> Option<u16> {
        match self {
            DatagramOutcome::Response { wkc, .. } => Some(*wkc),
            DatagramOutcome::Timeout => None,
        }
    }

    /// Returns true for a timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, DatagramOutcome::Timeout)
    }
}

/// Completion callback of a scheduled datagram.
///
/// Runs inside the cyclic loop, so it has to be short and must not block.
pub type DatagramCallback = Box<dyn FnOnce(DatagramOutcome<'_>) + Send>;

/// One datagram transaction tied to a leased index and a pool entry.
///
/// The pool entry holds the encoded request (header, payload and a zero
/// work counter) from creation until the transaction completes.
pub struct CyclicDatagram {
    index: u8,
    entry: PoolEntry,
    command: Command,
    timeout: Duration,
    deadline: Option<Instant>,
    queued: bool,
    generation: u64,
    callback: Option<DatagramCallback>,
}

impl CyclicDatagram {
    pub(crate) fn new(
        index: u8,
        entry: PoolEntry,
        command: Command,
        timeout: Duration,
        callback: DatagramCallback,
    ) -> Self {
        Self {
            index,
            entry,
            command,
            timeout,
            deadline: None,
            queued: false,
            generation: 0,
            callback: Some(callback),
        }
    }

    pub(crate) fn with_generation(mut self, generation: u64) -> Self {
        self.generation = generation;
        self
    }

    /// Correlation index.
    pub fn index(&self) -> u8 {
        self.index
    }

    /// Tells apart successive transactions that lease the same index.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Command code of the request.
    pub fn command(&self) -> Command {
        self.command
    }

    /// Receive timeout, counted from transmission.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Absolute deadline, set once the datagram has been transmitted.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// The encoded request.
    pub fn encoded(&self) -> &[u8] {
        self.entry.as_slice()
    }

    /// Decodes the header of the encoded request.
    pub fn header(&self) -> Result<DatagramHeader> {
        DatagramHeader::decode(self.entry.as_slice())
    }

    /// Returns true once the datagram went out on the wire.
    pub fn is_sent(&self) -> bool {
        self.deadline.is_some()
    }

    /// Returns true while waiting in the transmit queue.
    pub fn is_queued(&self) -> bool {
        self.queued
    }

    /// Returns true if the datagram was sent and its deadline is behind `now`.
    pub fn is_expired(&self, now: Instant) -> bool {
        self.deadline.map_or(false, |deadline| now >= deadline)
    }

    pub(crate) fn set_queued(&mut self, queued: bool) {
        self.queued = queued;
    }

    pub(crate) fn mark_sent(&mut self, now: Instant) {
        self.queued = false;
        self.deadline = Some(now + self.timeout);
    }

    /// Fires the callback with `outcome` and hands back the pool entry.
    pub(crate) fn complete(mut self, outcome: DatagramOutcome<'_>) -> PoolEntry {
        if let Some(callback) = self.callback.take() {
            callback(outcome);
        }
        self.entry
    }

    /// Drops the callback unfired and hands back the pool entry.
    pub(crate) fn into_entry(self) -> PoolEntry {
        self.entry
    }
}

impl fmt::Debug for CyclicDatagram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CyclicDatagram")
            .field("index", &self.index)
            .field("command", &self.command)
            .field("timeout", &self.timeout)
            .field("deadline", &self.deadline)
            .field("queued", &self.queued)
            .field("generation", &self.generation)
            .finish()
    }
}
