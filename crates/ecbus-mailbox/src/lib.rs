#![warn(missing_docs)]

//! ecbus-mailbox: per-slave mailbox channel.
//!
//! A slave exposes one write slot and one read slot for mailbox traffic and
//! processes a single request at a time. [`Mailbox`] turns that into a queued,
//! sequenced request/response service shared by every mailbox protocol. A
//! [`MailboxHandler`] thread drives it; callers block in
//! [`Mailbox::write`], [`Mailbox::transceive`] or [`Mailbox::read`] until
//! their own reply arrives or their deadline passes.

mod handler;
mod mailbox;
mod mailbox_state;
/// Per-tag queues of pooled mailbox buffers.
pub mod queue;
/// Mailbox traffic statistics.
pub mod statistics;
mod ticket;
/// Access to the slave's sync manager channels.
pub mod transport;

pub use handler::MailboxHandler;
pub use mailbox::{Mailbox, MailboxMessage, Reply, RequestHandle};
pub use mailbox_state::{HandshakeState, SmState};
pub use statistics::MailboxStatistics;
pub use transport::MailboxTransport;
