use std::{
    fmt,
    sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError},
    time::{Duration, Instant},
};

use crossbeam_channel::{bounded, Receiver, Sender};
use ecbus_core::{
    config::{Config, SlaveConfig},
    constants::MAILBOX_HEADER_SIZE,
    error::{ErrorKind, Resource, Result},
    pool::{Pool, PoolEntry},
    protocols::MailboxType,
};
use ecbus_protocol::{
    mailbox::{read_message, write_message},
    MailboxCounter, MailboxHeader,
};
use tracing::debug;

use crate::{
    mailbox_state::{HandshakeState, SmState},
    queue::TagQueues,
    statistics::MailboxStatistics,
    ticket::Ticket,
    transport::MailboxTransport,
};

/// A message read from a slave's mailbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailboxMessage {
    /// Decoded mailbox header.
    pub header: MailboxHeader,
    /// Payload following the header.
    pub payload: Vec<u8>,
}

impl MailboxMessage {
    /// Decodes a raw mailbox message.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let (header, payload) = read_message(bytes)?;
        Ok(Self { header, payload: payload.to_vec() })
    }

    /// Protocol tag of the message.
    pub fn mailbox_type(&self) -> MailboxType {
        self.header.mailbox_type
    }

    /// Returns true if the slave answered with a mailbox error reply.
    pub fn is_error(&self) -> bool {
        self.header.mailbox_type == MailboxType::Error
    }
}

/// Outcome of a completed mailbox request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// The slave acknowledged the write; no reply was awaited.
    Written {
        /// Work counter of the acknowledged write.
        wkc: u16,
    },
    /// The slave answered with a sequence-matched message.
    Response {
        /// Work counter of the write that carried the request.
        wkc: u16,
        /// The answer.
        message: MailboxMessage,
    },
}

impl Reply {
    /// Work counter of the write that carried the request.
    pub fn wkc(&self) -> u16 {
        match self {
            Reply::Written { wkc } | Reply::Response { wkc, .. } => *wkc,
        }
    }

    /// The response message, if one was awaited.
    pub fn into_message(self) -> Option<MailboxMessage> {
        match self {
            Reply::Written { .. } => None,
            Reply::Response { message, .. } => Some(message),
        }
    }
}

/// Handle to a request queued with [`Mailbox::enqueue_tail`] or
/// [`Mailbox::enqueue_head`]; pass it to [`Mailbox::wait`].
#[derive(Debug)]
pub struct RequestHandle {
    index: usize,
    ticket: Arc<Ticket<Reply>>,
    deadline: Instant,
}

impl RequestHandle {
    /// Index of the send buffer carrying the request.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Point in time after which the request is abandoned.
    pub fn deadline(&self) -> Instant {
        self.deadline
    }
}

#[derive(Debug)]
pub(crate) struct Request {
    pub(crate) ticket: Arc<Ticket<Reply>>,
    pub(crate) expects_response: bool,
    pub(crate) deadline: Instant,
}

#[derive(Debug)]
pub(crate) struct InFlight {
    pub(crate) index: usize,
    pub(crate) request: Request,
    pub(crate) abandoned: bool,
    /// Work counter of the acknowledged write, once written.
    pub(crate) wkc: u16,
}

#[derive(Debug)]
pub(crate) struct MailboxInner {
    pub(crate) handshake: HandshakeState,
    pub(crate) sm_state: SmState,
    pub(crate) counter: MailboxCounter,
    /// The reply to the last stamped counter has been delivered or given up on.
    pub(crate) consumed: bool,
    pub(crate) send_queues: TagQueues,
    pub(crate) recv_queues: TagQueues,
    /// Pending requests, indexed by send buffer.
    pub(crate) requests: Vec<Option<Request>>,
    pub(crate) in_flight: Option<InFlight>,
    pub(crate) read_scheduled: bool,
    pub(crate) next_poll: Option<Instant>,
    pub(crate) closed: bool,
    pub(crate) statistics: MailboxStatistics,
}

/// Queued, sequenced request/response channel to one slave.
///
/// Requests for every mailbox protocol share the slave's single write slot.
/// They wait in one queue per protocol and are written one at a time in
/// the configured priority order; a request that awaits a reply keeps the
/// channel busy until its reply arrives or its deadline passes.
pub struct Mailbox {
    pub(crate) slave: SlaveConfig,
    pub(crate) config: Config,
    pub(crate) transport: Arc<dyn MailboxTransport>,
    pub(crate) send_pool: Pool,
    pub(crate) recv_pool: Pool,
    pub(crate) inner: Mutex<MailboxInner>,
    pub(crate) readable: [Condvar; 7],
    kick_sender: Sender<()>,
    pub(crate) kick_receiver: Receiver<()>,
}

impl Mailbox {
    /// Creates the mailbox of `slave`, allocating its send and receive buffers.
    pub fn new(slave: SlaveConfig, config: &Config, transport: Arc<dyn MailboxTransport>) -> Self {
        let entry_size = usize::from(slave.write_sm.length.max(slave.read_sm.length))
            .max(MAILBOX_HEADER_SIZE);
        let send_pool = Pool::open(config.mailbox_pool_size, entry_size);
        let recv_pool = Pool::open(config.mailbox_pool_size, entry_size);
        let (kick_sender, kick_receiver) = bounded(1);

        let inner = MailboxInner {
            handshake: HandshakeState::Idle,
            sm_state: SmState::Empty,
            counter: MailboxCounter::new(),
            consumed: true,
            send_queues: TagQueues::new(send_pool.capacity()),
            recv_queues: TagQueues::new(recv_pool.capacity()),
            requests: (0..send_pool.capacity()).map(|_| None).collect(),
            in_flight: None,
            read_scheduled: false,
            next_poll: None,
            closed: false,
            statistics: MailboxStatistics::default(),
        };
        debug!("created mailbox for slave {} ({:#06x})", slave.position, slave.fixed_address);

        Self {
            slave,
            config: config.clone(),
            transport,
            send_pool,
            recv_pool,
            inner: Mutex::new(inner),
            readable: std::array::from_fn(|_| Condvar::new()),
            kick_sender,
            kick_receiver,
        }
    }

    /// Slave this mailbox talks to.
    pub fn slave(&self) -> &SlaveConfig {
        &self.slave
    }

    /// Current handshake state.
    pub fn handshake_state(&self) -> HandshakeState {
        self.lock().handshake
    }

    /// Last observed state of the slave's read slot.
    pub fn sm_state(&self) -> SmState {
        self.lock().sm_state
    }

    /// Most recently stamped sequence counter, 0 before the first send.
    pub fn last_counter(&self) -> u8 {
        self.lock().counter.last()
    }

    /// Snapshot of the traffic counters.
    pub fn statistics(&self) -> MailboxStatistics {
        self.lock().statistics.clone()
    }

    /// Number of requests waiting to be written for `tag`.
    pub fn pending(&self, tag: MailboxType) -> usize {
        self.lock().send_queues.len(tag)
    }

    /// Number of received messages waiting to be read for `tag`.
    pub fn received(&self, tag: MailboxType) -> usize {
        self.lock().recv_queues.len(tag)
    }

    /// Returns true once [`close`](Mailbox::close) has run.
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Takes a send buffer, waiting up to `timeout` for one to be returned.
    pub fn get_free_send_buffer(&self, timeout: Duration) -> Result<PoolEntry> {
        if self.is_closed() {
            return Err(ErrorKind::MailboxClosed);
        }
        self.send_pool
            .get(timeout)
            .map_err(|_| ErrorKind::ResourceExhausted(Resource::MailboxBuffers))
    }

    /// Fills a send buffer with a mailbox header and `payload`. The message
    /// must fit the slave's write slot.
    pub fn prepare_send_buffer(
        &self,
        entry: &mut PoolEntry,
        tag: MailboxType,
        address: u16,
        payload: &[u8],
    ) -> Result<()> {
        let required = MAILBOX_HEADER_SIZE + payload.len();
        let available = usize::from(self.slave.write_sm.length);
        if required > available {
            return Err(ErrorKind::CapacityExceeded { required, available });
        }
        let buffer = entry.buffer_mut();
        buffer.fill(0);
        let len = write_message(buffer, &MailboxHeader::new(tag, address, 0), payload)?;
        entry.set_len(len);
        Ok(())
    }

    /// Queues a prepared send buffer behind the pending requests of its
    /// protocol. When `expects_response` is set the request completes with
    /// the slave's sequence-matched reply, otherwise with the write's
    /// acknowledgement.
    pub fn enqueue_tail(
        &self,
        entry: PoolEntry,
        expects_response: bool,
        deadline: Instant,
    ) -> Result<RequestHandle> {
        self.enqueue(entry, expects_response, deadline, false)
    }

    /// Queues a prepared send buffer ahead of the pending requests of its
    /// protocol.
    pub fn enqueue_head(
        &self,
        entry: PoolEntry,
        expects_response: bool,
        deadline: Instant,
    ) -> Result<RequestHandle> {
        self.enqueue(entry, expects_response, deadline, true)
    }

    /// Blocks until the request completes or its deadline passes. A request
    /// that times out is withdrawn and never retried.
    pub fn wait(&self, handle: RequestHandle) -> Result<Reply> {
        match handle.ticket.wait_until(handle.deadline) {
            Some(outcome) => outcome,
            None => self.abandon(&handle),
        }
    }

    /// Writes one message and waits for the slave to acknowledge it.
    /// Returns the work counter of the write.
    pub fn write(
        &self,
        tag: MailboxType,
        address: u16,
        payload: &[u8],
        timeout: Duration,
    ) -> Result<u16> {
        let handle = self.submit(tag, address, payload, timeout, false)?;
        self.wait(handle).map(|reply| reply.wkc())
    }

    /// Writes one message and waits for the slave's reply to it.
    pub fn transceive(
        &self,
        tag: MailboxType,
        address: u16,
        payload: &[u8],
        timeout: Duration,
    ) -> Result<MailboxMessage> {
        let handle = self.submit(tag, address, payload, timeout, true)?;
        self.wait(handle)?.into_message().ok_or(ErrorKind::Empty)
    }

    /// Takes the next received message of `tag`, waiting up to `timeout`.
    ///
    /// Delivers unsequenced messages and replies to requests that were only
    /// written, never the reply a blocked [`transceive`](Mailbox::transceive)
    /// is waiting for.
    pub fn read(&self, tag: MailboxType, timeout: Duration) -> Result<MailboxMessage> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.lock();
        loop {
            if inner.closed {
                return Err(ErrorKind::MailboxClosed);
            }
            if let Some(entry) = inner.recv_queues.pop(tag) {
                drop(inner);
                return self.consume_received(entry);
            }
            inner.read_scheduled = true;
            self.kick();

            let now = Instant::now();
            if now >= deadline {
                inner.statistics.timeouts += 1;
                return Err(ErrorKind::Timeout);
            }
            inner = self.readable[tag.slot()]
                .wait_timeout(inner, deadline - now)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|poisoned| poisoned.into_inner().0);
        }
    }

    /// Takes the next received message of `tag` without waiting.
    pub fn try_read(&self, tag: MailboxType) -> Result<MailboxMessage> {
        let entry = self.lock().recv_queues.pop(tag).ok_or(ErrorKind::Empty)?;
        self.consume_received(entry)
    }

    /// Asks the handler to check the read slot on its next turn.
    pub fn sched_read(&self) {
        self.lock().read_scheduled = true;
        self.kick();
    }

    /// Wakes the handler.
    pub fn kick(&self) {
        // a full channel means a wake-up is already pending
        let _ = self.kick_sender.try_send(());
    }

    /// Tears the mailbox down. Pending and blocked callers fail with
    /// `MailboxClosed` and every queued buffer goes back to its pool.
    /// Returns the number of buffers that were still held elsewhere.
    pub fn close(&self) -> usize {
        let mut guard = self.lock();
        if guard.closed {
            return 0;
        }
        let inner = &mut *guard;
        inner.closed = true;
        let queued = inner.send_queues.drain();
        let received = inner.recv_queues.drain();
        for (_, entry) in &queued {
            if let Some(request) = inner.requests[entry.index()].take() {
                request.ticket.complete(Err(ErrorKind::MailboxClosed));
            }
        }
        if let Some(in_flight) = inner.in_flight.take() {
            in_flight.request.ticket.complete(Err(ErrorKind::MailboxClosed));
        }
        inner.handshake = HandshakeState::Idle;
        drop(guard);

        queued.into_iter().for_each(|(_, entry)| self.send_pool.put(entry));
        received.into_iter().for_each(|(_, entry)| self.recv_pool.put(entry));
        self.readable.iter().for_each(Condvar::notify_all);
        self.kick();

        debug!("closed mailbox of slave {}", self.slave.position);
        self.send_pool.close() + self.recv_pool.close()
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, MailboxInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn submit(
        &self,
        tag: MailboxType,
        address: u16,
        payload: &[u8],
        timeout: Duration,
        expects_response: bool,
    ) -> Result<RequestHandle> {
        let deadline = Instant::now() + timeout;
        self.check_supported(tag)?;
        let mut entry = self.get_free_send_buffer(timeout)?;
        if let Err(err) = self.prepare_send_buffer(&mut entry, tag, address, payload) {
            self.send_pool.put(entry);
            return Err(err);
        }
        self.enqueue_tail(entry, expects_response, deadline)
    }

    fn check_supported(&self, tag: MailboxType) -> Result<()> {
        if self.slave.supported.supports(tag) {
            Ok(())
        } else {
            Err(ErrorKind::UnsupportedProtocol(tag.to_u8()))
        }
    }

    fn enqueue(
        &self,
        entry: PoolEntry,
        expects_response: bool,
        deadline: Instant,
        at_head: bool,
    ) -> Result<RequestHandle> {
        if !self.send_pool.owns(&entry) {
            return Err(ErrorKind::ForeignEntry);
        }
        let tag = match MailboxHeader::decode(entry.buffer()) {
            Ok(header) => header.mailbox_type,
            Err(err) => {
                self.send_pool.put(entry);
                return Err(err);
            }
        };
        if let Err(err) = self.check_supported(tag) {
            self.send_pool.put(entry);
            return Err(err);
        }

        let mut guard = self.lock();
        if guard.closed {
            drop(guard);
            self.send_pool.put(entry);
            return Err(ErrorKind::MailboxClosed);
        }
        let inner = &mut *guard;
        let index = entry.index();
        let queued = if at_head {
            inner.send_queues.enqueue_head(tag, entry)
        } else {
            inner.send_queues.enqueue_tail(tag, entry)
        };
        if let Err(entry) = queued {
            drop(guard);
            self.send_pool.put(entry);
            return Err(ErrorKind::ForeignEntry);
        }
        let ticket = Arc::new(Ticket::new());
        inner.requests[index] = Some(Request { ticket: ticket.clone(), expects_response, deadline });
        drop(guard);

        self.kick();
        Ok(RequestHandle { index, ticket, deadline })
    }

    fn abandon(&self, handle: &RequestHandle) -> Result<Reply> {
        let mut guard = self.lock();
        if let Some(outcome) = handle.ticket.take() {
            return outcome;
        }
        let inner = &mut *guard;
        if let Some((_, entry)) = inner.send_queues.remove(handle.index) {
            inner.requests[handle.index] = None;
            inner.statistics.timeouts += 1;
            drop(guard);
            self.send_pool.put(entry);
        } else if let Some(in_flight) =
            inner.in_flight.as_mut().filter(|in_flight| in_flight.index == handle.index)
        {
            in_flight.abandoned = true;
            inner.statistics.timeouts += 1;
            // once the write went through only the reply is outstanding
            if inner.handshake == HandshakeState::AwaitResponse {
                inner.in_flight = None;
                inner.consumed = true;
                inner.handshake = HandshakeState::Timeout;
            }
        }
        Err(ErrorKind::Timeout)
    }

    fn consume_received(&self, entry: PoolEntry) -> Result<MailboxMessage> {
        let message = MailboxMessage::decode(entry.as_slice());
        self.recv_pool.put(entry);
        message
    }
}

impl fmt::Debug for Mailbox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mailbox")
            .field("slave", &self.slave)
            .field("send_pool", &self.send_pool)
            .field("recv_pool", &self.recv_pool)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use ecbus_core::{config::SyncManager, protocols::MailboxProtocols};

    use super::*;

    /// Transport that never acknowledges anything.
    struct DeadSlave;

    impl MailboxTransport for DeadSlave {
        fn slot_state(&self, _: &SlaveConfig, _: &SyncManager) -> Result<SmState> {
            Ok(SmState::Empty)
        }

        fn write(&self, _: &SlaveConfig, _: &[u8]) -> Result<u16> {
            Ok(0)
        }

        fn read(&self, _: &SlaveConfig, _: &mut [u8]) -> Result<u16> {
            Ok(0)
        }
    }

    fn mailbox(supported: MailboxProtocols) -> Mailbox {
        let config = Config { mailbox_pool_size: 4, ..Config::default() };
        Mailbox::new(SlaveConfig::new(0, 0x1001, supported), &config, Arc::new(DeadSlave))
    }

    fn prepared(mailbox: &Mailbox, tag: MailboxType) -> PoolEntry {
        let mut entry = mailbox.get_free_send_buffer(Duration::ZERO).unwrap();
        mailbox.prepare_send_buffer(&mut entry, tag, 0x1001, &[1, 2, 3]).unwrap();
        entry
    }

    #[test]
    fn test_prepare_send_buffer_writes_header() {
        let mailbox = mailbox(MailboxProtocols::COE);
        let entry = prepared(&mailbox, MailboxType::Coe);
        let (header, payload) = read_message(entry.as_slice()).unwrap();
        assert_eq!(header.mailbox_type, MailboxType::Coe);
        assert_eq!(header.address, 0x1001);
        assert_eq!(header.counter, 0);
        assert_eq!(payload, &[1, 2, 3]);
    }

    #[test]
    fn test_oversized_request_rejected() {
        let mailbox = mailbox(MailboxProtocols::COE);
        let mut entry = mailbox.get_free_send_buffer(Duration::ZERO).unwrap();
        let payload = vec![0u8; 128];
        assert!(matches!(
            mailbox.prepare_send_buffer(&mut entry, MailboxType::Coe, 0, &payload),
            Err(ErrorKind::CapacityExceeded { required: 134, available: 128 })
        ));
    }

    #[test]
    fn test_unsupported_protocol_rejected() {
        let mailbox = mailbox(MailboxProtocols::COE);
        let err = mailbox
            .write(MailboxType::Foe, 0x1001, &[0], Duration::from_millis(10))
            .unwrap_err();
        assert!(matches!(err, ErrorKind::UnsupportedProtocol(0x04)));

        let entry = prepared(&mailbox, MailboxType::Eoe);
        let deadline = Instant::now() + Duration::from_secs(1);
        assert!(matches!(
            mailbox.enqueue_tail(entry, false, deadline),
            Err(ErrorKind::UnsupportedProtocol(0x02))
        ));
        // the rejected buffer went back to the pool
        assert_eq!(mailbox.send_pool.available(), 4);
    }

    #[test]
    fn test_foreign_entry_rejected() {
        let mailbox = mailbox(MailboxProtocols::ALL);
        let other = Pool::open(1, 128);
        let entry = other.get(Duration::ZERO).unwrap();
        let deadline = Instant::now() + Duration::from_secs(1);
        assert!(matches!(
            mailbox.enqueue_tail(entry, false, deadline),
            Err(ErrorKind::ForeignEntry)
        ));
    }

    #[test]
    fn test_queued_request_times_out_and_is_withdrawn() {
        let mailbox = mailbox(MailboxProtocols::ALL);
        let entry = prepared(&mailbox, MailboxType::Coe);
        let handle = mailbox
            .enqueue_tail(entry, true, Instant::now() + Duration::from_millis(5))
            .unwrap();
        assert_eq!(mailbox.pending(MailboxType::Coe), 1);

        assert!(matches!(mailbox.wait(handle), Err(ErrorKind::Timeout)));
        assert_eq!(mailbox.pending(MailboxType::Coe), 0);
        assert_eq!(mailbox.send_pool.available(), 4);
        assert_eq!(mailbox.statistics().timeouts, 1);
    }

    #[test]
    fn test_read_times_out_when_nothing_arrives() {
        let mailbox = mailbox(MailboxProtocols::ALL);
        assert!(matches!(
            mailbox.read(MailboxType::Eoe, Duration::from_millis(5)),
            Err(ErrorKind::Timeout)
        ));
        assert!(matches!(mailbox.try_read(MailboxType::Eoe), Err(ErrorKind::Empty)));
    }

    #[test]
    fn test_close_fails_pending_requests() {
        let mailbox = mailbox(MailboxProtocols::ALL);
        let entry = prepared(&mailbox, MailboxType::Soe);
        let handle = mailbox
            .enqueue_tail(entry, false, Instant::now() + Duration::from_secs(5))
            .unwrap();

        assert_eq!(mailbox.close(), 0);
        assert!(matches!(mailbox.wait(handle), Err(ErrorKind::MailboxClosed)));
        assert!(matches!(
            mailbox.get_free_send_buffer(Duration::ZERO),
            Err(ErrorKind::MailboxClosed)
        ));
        assert!(matches!(
            mailbox.read(MailboxType::Soe, Duration::from_millis(1)),
            Err(ErrorKind::MailboxClosed)
        ));
    }

    #[test]
    fn test_close_wakes_blocked_reader() {
        let mailbox = Arc::new(mailbox(MailboxProtocols::ALL));
        let outcome = Arc::new(Mutex::new(None));
        let reader = {
            let mailbox = mailbox.clone();
            let outcome = outcome.clone();
            std::thread::spawn(move || {
                let result = mailbox.read(MailboxType::Coe, Duration::from_secs(5));
                *outcome.lock().unwrap() = Some(result.is_err());
            })
        };
        std::thread::sleep(Duration::from_millis(20));
        mailbox.close();
        reader.join().unwrap();
        assert_eq!(*outcome.lock().unwrap(), Some(true));
    }
}
