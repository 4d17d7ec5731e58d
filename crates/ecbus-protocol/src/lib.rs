#![warn(missing_docs)]

//! ecbus-protocol: bit-exact wire codecs for the fieldbus master.
//!
//! Frames are an Ethernet header, a two byte EtherCAT frame header and a
//! chain of datagrams. Mailbox messages travel inside datagram payloads and
//! carry their own six byte header. All bit-packed fields are handled with
//! explicit masks so the layout does not depend on the compiler.

/// Datagram command codes and addressing.
pub mod command;
/// Datagram header codec and iteration over a frame's datagrams.
pub mod datagram;
/// Ethernet and EtherCAT frame headers, frame building and parsing.
pub mod frame;
/// Mailbox header codec.
pub mod mailbox;
/// Mailbox sequence counter.
pub mod sequence;

pub use command::{Address, Command};
pub use datagram::{Datagram, DatagramHeader, Datagrams};
pub use ecbus_core::protocols::{MailboxProtocols, MailboxType};
pub use frame::{EthernetHeader, Frame, FrameHeader, FrameWriter};
pub use mailbox::MailboxHeader;
pub use sequence::MailboxCounter;
