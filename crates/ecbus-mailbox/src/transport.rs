use ecbus_core::{
    config::{SlaveConfig, SyncManager},
    error::Result,
};

use crate::mailbox_state::SmState;

/// Access to a slave's mailbox sync managers.
///
/// Each call is one round trip on the bus and may block until the cyclic
/// loop has carried it. Returned work counters are 1 when the slave
/// processed the access and 0 when it did not.
pub trait MailboxTransport: Send + Sync {
    /// Reads the state of a sync manager slot.
    fn slot_state(&self, slave: &SlaveConfig, sync_manager: &SyncManager) -> Result<SmState>;

    /// Writes `data` into the slave's write mailbox.
    fn write(&self, slave: &SlaveConfig, data: &[u8]) -> Result<u16>;

    /// Reads the slave's read mailbox into `buffer`.
    fn read(&self, slave: &SlaveConfig, buffer: &mut [u8]) -> Result<u16>;
}
