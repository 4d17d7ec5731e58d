//! Error taxonomy for the master stack.
//!
//! Every failure on the real-time path is returned as a typed value so the
//! cyclic loop can make a bounded-time decision each cycle. `Timeout` is an
//! expected steady-state outcome on a lossy link and is kept distinct from
//! data-carrying results.

use std::{fmt, io, result};

use thiserror::Error;

/// Result type alias using [`ErrorKind`].
pub type Result<T> = result::Result<T, ErrorKind>;

/// A resource that can run dry.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Resource {
    /// The buffer pool has no free entry.
    PoolEntries,
    /// All 256 datagram indices are in flight.
    DatagramIndices,
    /// A mailbox has no free send or receive buffer.
    MailboxBuffers,
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Resource::PoolEntries => f.write_str("pool entries"),
            Resource::DatagramIndices => f.write_str("datagram indices"),
            Resource::MailboxBuffers => f.write_str("mailbox buffers"),
        }
    }
}

/// Reasons wire data could not be decoded.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DecodingErrorKind {
    /// Frame shorter than its headers.
    FrameTooShort,
    /// Ethertype is not the fieldbus ethertype.
    EtherType,
    /// EtherCAT frame header carries an unsupported type.
    FrameType,
    /// Unknown datagram command code.
    Command,
    /// Unknown mailbox type tag.
    MailboxType,
    /// Datagram length runs past the end of the frame.
    DatagramTruncated,
    /// Mailbox length runs past the end of the buffer.
    MailboxTruncated,
}

impl fmt::Display for DecodingErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodingErrorKind::FrameTooShort => f.write_str("frame too short"),
            DecodingErrorKind::EtherType => f.write_str("unexpected ethertype"),
            DecodingErrorKind::FrameType => f.write_str("unsupported frame type"),
            DecodingErrorKind::Command => f.write_str("unknown datagram command"),
            DecodingErrorKind::MailboxType => f.write_str("unknown mailbox type"),
            DecodingErrorKind::DatagramTruncated => f.write_str("datagram truncated"),
            DecodingErrorKind::MailboxTruncated => f.write_str("mailbox message truncated"),
        }
    }
}

/// Errors returned by the master stack.
#[derive(Debug, Error)]
pub enum ErrorKind {
    /// A pool, the index space or a mailbox buffer set is exhausted.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(Resource),
    /// A frame or buffer would exceed its capacity.
    #[error("capacity exceeded: {required} bytes required, {available} available")]
    CapacityExceeded {
        /// Bytes the operation needed.
        required: usize,
        /// Bytes that were left.
        available: usize,
    },
    /// No response arrived before the deadline.
    #[error("timed out waiting for response")]
    Timeout,
    /// A response did not match any outstanding request. Only used for
    /// diagnostics; public operations drop stale responses silently.
    #[error("stale response")]
    StaleResponse,
    /// Non-blocking inspection found nothing.
    #[error("empty")]
    Empty,
    /// The hardware port failed to send or receive.
    #[error("device error: {0}")]
    DeviceError(#[from] io::Error),
    /// Received data could not be decoded.
    #[error("decoding error: {0}")]
    DecodingError(DecodingErrorKind),
    /// The slave does not implement the requested mailbox protocol.
    #[error("mailbox protocol {0:#04x} not supported by slave")]
    UnsupportedProtocol(u8),
    /// No slave is registered under this position.
    #[error("unknown slave {0}")]
    UnknownSlave(u16),
    /// The mailbox was torn down while the request was pending.
    #[error("mailbox closed")]
    MailboxClosed,
    /// A pool entry was handed to an owner that did not allocate it.
    #[error("buffer belongs to another pool")]
    ForeignEntry,
}

impl ErrorKind {
    /// Returns true for errors a caller is expected to recover from by
    /// backing off and retrying.
    pub fn is_transient(&self) -> bool {
        matches!(self, ErrorKind::ResourceExhausted(_) | ErrorKind::Timeout)
    }

    /// Returns true if this is a timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, ErrorKind::Timeout)
    }
}

impl From<DecodingErrorKind> for ErrorKind {
    fn from(kind: DecodingErrorKind) -> Self {
        ErrorKind::DecodingError(kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_messages() {
        let err = ErrorKind::ResourceExhausted(Resource::DatagramIndices);
        assert_eq!(err.to_string(), "resource exhausted: datagram indices");

        let err = ErrorKind::CapacityExceeded { required: 1600, available: 1500 };
        assert_eq!(err.to_string(), "capacity exceeded: 1600 bytes required, 1500 available");
    }

    #[test]
    fn test_io_error_becomes_device_error() {
        let err: ErrorKind = io::Error::new(io::ErrorKind::BrokenPipe, "link down").into();
        assert!(matches!(err, ErrorKind::DeviceError(_)));
        assert!(!err.is_transient());
    }

    #[test]
    fn test_transient_classification() {
        assert!(ErrorKind::Timeout.is_transient());
        assert!(ErrorKind::ResourceExhausted(Resource::PoolEntries).is_transient());
        assert!(!ErrorKind::MailboxClosed.is_transient());
    }
}
