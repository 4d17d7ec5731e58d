#![warn(missing_docs)]

//! ecbus-master: frame/datagram engine, hardware ports and the cyclic master loop.

/// Cyclic datagrams and their completion outcomes.
pub mod cyclic;
/// Datagram engine: frame packing, response matching and the timeout sweep.
pub mod engine;
/// Bundled hardware ports.
pub mod hw;
/// Datagram index leasing.
pub mod index;
/// Mailbox transport carried by engine datagrams.
pub mod mailbox_port;
/// The master and its polling loop.
pub mod master;
/// Engine counters.
pub mod statistics;
/// Time utilities for the master.
pub mod time;

pub use cyclic::{DatagramCallback, DatagramOutcome};
pub use engine::DatagramEngine;
pub use hw::{LoopbackPort, UdpPort};
pub use index::IndexAllocator;
pub use mailbox_port::EngineTransport;
pub use master::Master;
pub use statistics::MasterStatistics;
pub use time::{Clock, ManualClock, SystemClock};
