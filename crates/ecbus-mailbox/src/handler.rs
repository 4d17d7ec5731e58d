//! The mailbox handler: one turn of the per-slave state machine, and the
//! worker thread that runs turns whenever it is kicked or its poll
//! interval elapses.

use std::{
    io,
    sync::Arc,
    thread::{self, JoinHandle},
    time::Instant,
};

use crossbeam_channel::RecvTimeoutError;
use ecbus_core::{
    error::{ErrorKind, Result},
    pool::PoolEntry,
    protocols::MailboxType,
};
use ecbus_protocol::{mailbox::read_message, sequence::UNSEQUENCED, MailboxHeader};
use tracing::{debug, error, trace, warn};

use crate::{
    mailbox::{InFlight, Mailbox, MailboxInner, MailboxMessage, Reply},
    mailbox_state::{HandshakeState, SmState},
};

impl Mailbox {
    /// Runs one handler turn at `now`:
    /// expires an overdue reply wait, reads the slave's read slot when a
    /// read is due and starts the next queued request if the channel is free.
    pub fn run_once(&self, now: Instant) -> Result<()> {
        if self.is_closed() {
            return Err(ErrorKind::MailboxClosed);
        }
        self.expire(now);
        self.poll_read_slot(now)?;
        self.send_next(now)
    }

    fn expire(&self, now: Instant) {
        let mut guard = self.lock();
        let inner = &mut *guard;
        if inner.handshake != HandshakeState::AwaitResponse {
            return;
        }
        let overdue = inner.in_flight.as_ref().map_or(false, |f| now >= f.request.deadline);
        if !overdue {
            return;
        }
        if let Some(in_flight) = inner.in_flight.take() {
            in_flight.request.ticket.complete(Err(ErrorKind::Timeout));
            inner.consumed = true;
            inner.handshake = HandshakeState::Timeout;
            inner.statistics.timeouts += 1;
            debug!(
                "slave {} did not answer mailbox counter {} in time",
                self.slave.position,
                inner.counter.last()
            );
        }
    }

    fn poll_read_slot(&self, now: Instant) -> Result<()> {
        {
            let mut inner = self.lock();
            let due = inner.read_scheduled
                || inner.handshake == HandshakeState::AwaitResponse
                || inner.next_poll.map_or(true, |next| now >= next);
            if !due {
                return Ok(());
            }
            inner.read_scheduled = false;
            inner.next_poll = Some(now + self.config.mailbox_poll_interval);
        }

        // drain everything the slave has queued, at most one message per
        // receive buffer
        for _ in 0..self.recv_pool.capacity() {
            if !self.read_one()? {
                break;
            }
        }
        Ok(())
    }

    /// Reads and routes one message if the read slot is full. Returns
    /// whether a message was taken out of the slot.
    fn read_one(&self) -> Result<bool> {
        let state = self.transport.slot_state(&self.slave, &self.slave.read_sm)?;
        self.lock().sm_state = state;
        if state == SmState::Empty {
            return Ok(false);
        }

        let mut entry = match self.recv_pool.try_get() {
            Ok(entry) => entry,
            Err(_) => {
                warn!(
                    "receive buffers of slave {} exhausted, leaving read mailbox full",
                    self.slave.position
                );
                return Ok(false);
            }
        };
        let len = usize::from(self.slave.read_sm.length);
        let wkc = match self.transport.read(&self.slave, &mut entry.buffer_mut()[..len]) {
            Ok(wkc) => wkc,
            Err(err) => {
                self.recv_pool.put(entry);
                return Err(err);
            }
        };
        if wkc == 0 {
            self.recv_pool.put(entry);
            return Ok(false);
        }
        entry.set_len(len);
        self.lock().sm_state = SmState::Empty;
        self.route_inbound(entry);
        Ok(true)
    }

    fn route_inbound(&self, entry: PoolEntry) {
        let header = match read_message(entry.as_slice()) {
            Ok((header, _)) => header,
            Err(err) => {
                warn!("dropping mailbox message from slave {}: {}", self.slave.position, err);
                self.lock().statistics.invalid_dropped += 1;
                self.recv_pool.put(entry);
                return;
            }
        };
        if !self.slave.supported.supports(header.mailbox_type) {
            warn!(
                "dropping {} message from slave {} which does not support it",
                header.mailbox_type, self.slave.position
            );
            self.lock().statistics.invalid_dropped += 1;
            self.recv_pool.put(entry);
            return;
        }

        let mut guard = self.lock();
        let inner = &mut *guard;
        inner.statistics.messages_received += 1;

        if header.counter == UNSEQUENCED {
            self.push_received(inner, header.mailbox_type, entry);
            return;
        }

        if inner.consumed || !inner.counter.matches_last(header.counter) {
            inner.statistics.stale_dropped += 1;
            trace!(
                "dropping stale {} reply from slave {} (counter {}, last sent {})",
                header.mailbox_type,
                self.slave.position,
                header.counter,
                inner.counter.last()
            );
            drop(guard);
            self.recv_pool.put(entry);
            return;
        }

        inner.consumed = true;
        let waiting = if inner.handshake == HandshakeState::AwaitResponse {
            inner.in_flight.take()
        } else {
            None
        };
        match waiting {
            Some(in_flight) => {
                inner.handshake = HandshakeState::Complete;
                let wkc = in_flight.wkc;
                let outcome = MailboxMessage::decode(entry.as_slice())
                    .map(|message| Reply::Response { wkc, message });
                in_flight.request.ticket.complete(outcome);
                drop(guard);
                self.recv_pool.put(entry);
            }
            // reply to a request that was only written
            None => self.push_received(inner, header.mailbox_type, entry),
        }
    }

    fn push_received(&self, inner: &mut MailboxInner, tag: MailboxType, entry: PoolEntry) {
        if let Err(entry) = inner.recv_queues.enqueue_tail(tag, entry) {
            self.recv_pool.put(entry);
            return;
        }
        self.readable[tag.slot()].notify_one();
    }

    fn send_next(&self, now: Instant) -> Result<()> {
        let (tag, mut entry) = match self.take_next(now) {
            Some(next) => next,
            None => return Ok(()),
        };

        match self.transport.slot_state(&self.slave, &self.slave.write_sm) {
            Ok(SmState::Empty) => {}
            Ok(SmState::Full) => {
                trace!("write mailbox of slave {} still full", self.slave.position);
                self.requeue(tag, entry);
                return Ok(());
            }
            Err(err) => {
                self.requeue(tag, entry);
                return Err(err);
            }
        }

        let counter = {
            let mut guard = self.lock();
            let inner = &mut *guard;
            let counter = inner.counter.next();
            inner.consumed = false;
            if inner.handshake == HandshakeState::SendPending {
                inner.handshake = HandshakeState::AwaitEcho;
            }
            counter
        };
        MailboxHeader::stamp_counter(entry.buffer_mut(), counter);

        let len = usize::from(self.slave.write_sm.length);
        let mut failures = 0u64;
        let mut acknowledged = None;
        let mut device_error = None;
        for _ in 0..self.config.mailbox_write_retries.max(1) {
            match self.transport.write(&self.slave, &entry.buffer()[..len]) {
                Ok(0) => failures += 1,
                Ok(wkc) => {
                    acknowledged = Some(wkc);
                    break;
                }
                Err(err) => {
                    device_error = Some(err);
                    break;
                }
            }
        }
        self.lock().statistics.write_retries += failures;

        let wkc = match acknowledged {
            Some(wkc) => wkc,
            None => {
                warn!(
                    "slave {} did not accept {} mailbox write after {} attempts, requeueing",
                    self.slave.position, tag, failures
                );
                self.requeue(tag, entry);
                return device_error.map_or(Ok(()), Err);
            }
        };

        entry.fire_callback();

        let mut guard = self.lock();
        let inner = &mut *guard;
        inner.statistics.messages_sent += 1;
        match inner.in_flight.take() {
            Some(in_flight) if in_flight.abandoned => {
                inner.consumed = true;
                inner.handshake = HandshakeState::Timeout;
            }
            Some(mut in_flight) if in_flight.request.expects_response => {
                inner.handshake = HandshakeState::AwaitResponse;
                in_flight.wkc = wkc;
                inner.in_flight = Some(in_flight);
                inner.read_scheduled = true;
            }
            Some(in_flight) => {
                inner.handshake = HandshakeState::Complete;
                in_flight.request.ticket.complete(Ok(Reply::Written { wkc }));
            }
            // closed while writing
            None => inner.consumed = true,
        }
        trace!("wrote {} mailbox message with counter {} to slave {}", tag, counter, self.slave.position);
        drop(guard);

        self.send_pool.put(entry);
        Ok(())
    }

    /// Takes the next request by priority and marks the channel busy.
    /// Requests whose deadline has already passed complete with a timeout
    /// without being written.
    fn take_next(&self, now: Instant) -> Option<(MailboxType, PoolEntry)> {
        let mut guard = self.lock();
        let inner = &mut *guard;
        if !inner.handshake.is_ready() {
            return None;
        }
        loop {
            let (tag, entry) = inner.send_queues.next_by_priority(&self.config.mailbox_priority)?;
            let index = entry.index();
            let request = match inner.requests[index].take() {
                Some(request) => request,
                None => {
                    self.send_pool.put(entry);
                    continue;
                }
            };
            if now >= request.deadline {
                request.ticket.complete(Err(ErrorKind::Timeout));
                inner.statistics.timeouts += 1;
                self.send_pool.put(entry);
                continue;
            }
            inner.handshake = HandshakeState::SendPending;
            inner.in_flight = Some(InFlight { index, request, abandoned: false, wkc: 0 });
            return Some((tag, entry));
        }
    }

    /// Puts an unwritten request back at the head of its queue.
    fn requeue(&self, tag: MailboxType, entry: PoolEntry) {
        let mut guard = self.lock();
        let inner = &mut *guard;
        inner.handshake = HandshakeState::Idle;
        inner.consumed = true;
        let in_flight = match inner.in_flight.take() {
            Some(in_flight) if !in_flight.abandoned => in_flight,
            _ => {
                drop(guard);
                self.send_pool.put(entry);
                return;
            }
        };
        let index = entry.index();
        match inner.send_queues.enqueue_head(tag, entry) {
            Ok(()) => {
                inner.requests[index] = Some(in_flight.request);
                inner.statistics.requeued += 1;
            }
            Err(entry) => {
                in_flight.request.ticket.complete(Err(ErrorKind::ForeignEntry));
                drop(guard);
                self.send_pool.put(entry);
            }
        }
    }

    /// Handler loop: one turn per kick, or per poll interval without kicks.
    fn run(&self) {
        debug!("mailbox handler for slave {} started", self.slave.position);
        loop {
            match self.kick_receiver.recv_timeout(self.config.mailbox_poll_interval) {
                Ok(()) | Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
            match self.run_once(Instant::now()) {
                Ok(()) => {}
                Err(ErrorKind::MailboxClosed) => break,
                Err(err) if err.is_transient() => {
                    debug!("mailbox handler for slave {}: {}", self.slave.position, err)
                }
                Err(err) => error!("mailbox handler for slave {}: {}", self.slave.position, err),
            }
        }
        debug!("mailbox handler for slave {} stopped", self.slave.position);
    }
}

/// Worker thread driving one [`Mailbox`].
///
/// Dropping the handler closes the mailbox and joins the thread.
#[derive(Debug)]
pub struct MailboxHandler {
    mailbox: Arc<Mailbox>,
    thread: Option<JoinHandle<()>>,
}

impl MailboxHandler {
    /// Starts the handler thread for `mailbox`.
    pub fn spawn(mailbox: Arc<Mailbox>) -> io::Result<Self> {
        let worker = mailbox.clone();
        let thread = thread::Builder::new()
            .name(format!("ecbus-mailbox-{}", mailbox.slave().position))
            .spawn(move || worker.run())?;
        Ok(Self { mailbox, thread: Some(thread) })
    }

    /// The mailbox this handler drives.
    pub fn mailbox(&self) -> &Arc<Mailbox> {
        &self.mailbox
    }

    /// Returns true while the handler thread is alive.
    pub fn is_running(&self) -> bool {
        self.thread.as_ref().map_or(false, |thread| !thread.is_finished())
    }

    /// Closes the mailbox and waits for the thread to exit.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if let Some(thread) = self.thread.take() {
            self.mailbox.close();
            if thread.join().is_err() {
                error!("mailbox handler for slave {} panicked", self.mailbox.slave().position);
            }
        }
    }
}

impl Drop for MailboxHandler {
    fn drop(&mut self) {
        self.shutdown();
    }
}
