//! Hardware ports shipped with the master.
//!
//! Raw Ethernet drivers live outside this crate and plug in through
//! [`HardwarePort`](ecbus_core::transport::HardwarePort).

mod loopback;
mod udp;

pub use loopback::LoopbackPort;
pub use udp::UdpPort;
