//! Mailbox access carried by the datagram engine.

use std::{sync::Arc, time::Duration};

use crossbeam_channel::{bounded, Receiver};
use ecbus_core::{
    config::{SlaveConfig, SyncManager},
    error::{ErrorKind, Result},
};
use ecbus_mailbox::{MailboxTransport, SmState};
use ecbus_protocol::{Address, Command};
use tracing::debug;

use crate::{cyclic::DatagramOutcome, engine::DatagramEngine};

/// Extra time a caller waits beyond the datagram timeout for the cyclic
/// loop to deliver the completion.
const COMPLETION_GRACE: Duration = Duration::from_millis(100);

/// A scheduled access: the transaction it occupies and where its outcome
/// arrives.
struct Pending {
    index: u8,
    generation: u64,
    completion: Receiver<Result<(u16, Vec<u8>)>>,
}

/// [`MailboxTransport`] that turns each sync manager access into one
/// configured-address datagram: FPRD of the status register for the slot
/// state, FPWR into the write mailbox and FPRD from the read mailbox.
///
/// Every call blocks the mailbox handler until the cyclic loop has carried
/// the datagram and delivered its completion.
#[derive(Debug, Clone)]
pub struct EngineTransport {
    engine: Arc<DatagramEngine>,
    timeout: Duration,
}

impl EngineTransport {
    /// Creates a transport whose datagrams time out after `timeout`.
    pub fn new(engine: Arc<DatagramEngine>, timeout: Duration) -> Self {
        Self { engine, timeout }
    }

    fn submit(&self, command: Command, address: Address, payload: &[u8]) -> Result<Pending> {
        let (sender, completion) = bounded(1);
        let index = self.engine.cyclic_datagram_init(
            command,
            address,
            payload,
            self.timeout,
            Box::new(move |outcome| {
                let result = match outcome {
                    DatagramOutcome::Response { wkc, payload } => Ok((wkc, payload.to_vec())),
                    DatagramOutcome::Timeout => Err(ErrorKind::Timeout),
                };
                // the caller may have given up already
                let _ = sender.send(result);
            }),
        )?;
        // nothing completes a datagram before it is scheduled
        let generation = self.engine.generation(index).ok_or(ErrorKind::Timeout)?;
        if let Err(err) = self.engine.schedule(index) {
            self.engine.cancel_generation(index, generation);
            return Err(err);
        }
        Ok(Pending { index, generation, completion })
    }

    /// Waits for a completion and copies a response payload into `response`.
    ///
    /// If the cyclic loop does not deliver in time the datagram is withdrawn,
    /// so an abandoned access never reaches the slave later.
    fn wait(&self, pending: Pending, response: Option<&mut [u8]>) -> Result<u16> {
        let outcome = match pending.completion.recv_timeout(self.timeout + COMPLETION_GRACE) {
            Ok(outcome) => outcome,
            Err(_) => {
                if self.engine.cancel_generation(pending.index, pending.generation) {
                    debug!("withdrew unanswered mailbox datagram {}", pending.index);
                    return Err(ErrorKind::Timeout);
                }
                // completed between the timeout and the withdrawal
                pending.completion.try_recv().map_err(|_| ErrorKind::Timeout)?
            }
        };
        let (wkc, data) = outcome?;
        if let Some(response) = response {
            let len = response.len().min(data.len());
            response[..len].copy_from_slice(&data[..len]);
        }
        Ok(wkc)
    }
}

impl MailboxTransport for EngineTransport {
    fn slot_state(&self, slave: &SlaveConfig, sync_manager: &SyncManager) -> Result<SmState> {
        let address =
            Address::Physical { adp: slave.fixed_address, ado: sync_manager.status_register() };
        let mut status = [0u8; 1];
        let pending = self.submit(Command::Fprd, address, &status)?;
        if self.wait(pending, Some(&mut status))? == 0 {
            return Err(ErrorKind::Timeout);
        }
        Ok(SmState::from_status(status[0]))
    }

    fn write(&self, slave: &SlaveConfig, data: &[u8]) -> Result<u16> {
        let address = Address::Physical { adp: slave.fixed_address, ado: slave.write_sm.address };
        let pending = self.submit(Command::Fpwr, address, data)?;
        self.wait(pending, None)
    }

    fn read(&self, slave: &SlaveConfig, buffer: &mut [u8]) -> Result<u16> {
        let address = Address::Physical { adp: slave.fixed_address, ado: slave.read_sm.address };
        buffer.fill(0);
        let pending = self.submit(Command::Fprd, address, buffer)?;
        self.wait(pending, Some(buffer))
    }
}
