#![warn(missing_docs)]

//! ecbus: public facade of the master stack.
//!
//! Re-exports the types needed to drive a bus:
//!
//! - The master and its ports (`Master`, `UdpPort`, `LoopbackPort`)
//! - Datagram scheduling (`Command`, `Address`, `DatagramOutcome`)
//! - Slave mailboxes (`Mailbox`, `MailboxType`, `SlaveConfig`)
//! - Configuration and errors (`Config`, `ErrorKind`)
//!
//! Example
//! ```ignore
//! use std::time::{Duration, Instant};
//! use ecbus::prelude::*;
//!
//! let (port, _bus) = LoopbackPort::pair();
//! let mut master = Master::new(port, Config::default());
//! master.datagram_schedule(
//!     Command::Brd,
//!     Address::Physical { adp: 0, ado: 0x0130 },
//!     &[0, 0],
//!     None,
//!     Box::new(|outcome| println!("AL status wkc {:?}", outcome.wkc())),
//! )?;
//! master.manual_poll(Instant::now())?;
//!
//! let mailbox = master.add_slave(SlaveConfig::new(0, 0x1001, MailboxProtocols::COE))?;
//! let reply = mailbox.transceive(MailboxType::Coe, 0, &sdo_upload, Duration::from_secs(1))?;
//! ```

// Core configuration, errors and extension points
pub use ecbus_core::{
    config::{Config, SlaveConfig, SyncManager},
    error::{ErrorKind, Resource, Result},
    interceptor::{FrameInterceptor, NoOpInterceptor},
    mac::MacAddress,
    pool::{Pool, PoolEntry},
    transport::HardwarePort,
};
// Mailboxes
pub use ecbus_mailbox::{Mailbox, MailboxMessage, MailboxStatistics, Reply};
// Master, engine and ports
pub use ecbus_master::{
    DatagramCallback, DatagramEngine, DatagramOutcome, LoopbackPort, Master, MasterStatistics,
    UdpPort,
};
// Wire types
pub use ecbus_protocol::{Address, Command, MailboxHeader, MailboxProtocols, MailboxType};

/// Convenience prelude with the most commonly used items.
pub mod prelude {
    pub use crate::{
        Address, Command, Config, DatagramOutcome, ErrorKind, LoopbackPort, Mailbox,
        MailboxProtocols, MailboxType, Master, SlaveConfig, UdpPort,
    };
}
