//! The frame/datagram engine.
//!
//! Datagrams are created with [`DatagramEngine::cyclic_datagram_init`], which
//! leases one of the 256 correlation indices and encodes the request into a
//! pool entry, and queued with [`DatagramEngine::schedule`]. Each cycle the
//! master calls [`transmit`](DatagramEngine::transmit) to pack queued
//! datagrams into as few frames as the MTU allows,
//! [`process_rx_frame`](DatagramEngine::process_rx_frame) for every received
//! frame and [`sweep`](DatagramEngine::sweep) to time out transactions whose
//! response never came. Every transaction ends in exactly one callback,
//! after which its index and buffer are released.
//!
//! Each outstanding datagram sits behind its own lock. No lock is held while
//! a callback runs.

use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    time::{Duration, Instant},
};

use crossbeam_channel::{unbounded, Receiver, Sender};
use ecbus_core::{
    config::Config,
    constants::{DATAGRAM_HEADER_SIZE, DATAGRAM_INDEX_COUNT, FRAME_HEADER_SIZE, WKC_SIZE},
    error::{ErrorKind, Resource, Result},
    interceptor::FrameInterceptor,
    pool::{Pool, PoolEntry},
    transport::HardwarePort,
};
use ecbus_protocol::{datagram::encode_datagram, Address, Command, Frame, FrameWriter};
use tracing::{error, trace, warn};

use crate::{
    cyclic::{CyclicDatagram, DatagramCallback, DatagramOutcome},
    index::IndexAllocator,
    statistics::MasterStatistics,
};

type Slot = Mutex<Option<CyclicDatagram>>;

/// Builds frames, tracks outstanding datagrams by index and delivers their
/// completions.
pub struct DatagramEngine {
    config: Config,
    pool: Arc<Pool>,
    indices: Mutex<IndexAllocator>,
    slots: Vec<Slot>,
    tx_sender: Sender<u8>,
    tx_receiver: Receiver<u8>,
    statistics: Mutex<MasterStatistics>,
    generations: AtomicU64,
}

impl DatagramEngine {
    /// Creates an engine with its own datagram pool sized from `config`.
    pub fn new(config: &Config) -> Self {
        let pool = Arc::new(Pool::open(config.pool_size, config.pool_entry_size));
        Self::with_pool(config, pool)
    }

    /// Creates an engine drawing its buffers from `pool`.
    pub fn with_pool(config: &Config, pool: Arc<Pool>) -> Self {
        Self::with_indices(config, pool, IndexAllocator::new())
    }

    /// Creates an engine with a given index allocator.
    pub fn with_indices(config: &Config, pool: Arc<Pool>, indices: IndexAllocator) -> Self {
        let (tx_sender, tx_receiver) = unbounded();
        Self {
            config: config.clone(),
            pool,
            indices: Mutex::new(indices),
            slots: (0..DATAGRAM_INDEX_COUNT).map(|_| Mutex::new(None)).collect(),
            tx_sender,
            tx_receiver,
            statistics: Mutex::new(MasterStatistics::default()),
            generations: AtomicU64::new(1),
        }
    }

    /// Pool the datagram buffers come from.
    pub fn pool(&self) -> &Arc<Pool> {
        &self.pool
    }

    /// Number of datagrams holding an index.
    pub fn in_flight(&self) -> usize {
        self.indices().in_use()
    }

    /// Number of datagrams waiting for the next transmit.
    pub fn queued(&self) -> usize {
        self.tx_receiver.len()
    }

    /// Returns true if a datagram holds `index`.
    pub fn is_outstanding(&self, index: u8) -> bool {
        self.slot(index).is_some()
    }

    /// Snapshot of the traffic counters.
    pub fn statistics(&self) -> MasterStatistics {
        self.stats().clone()
    }

    /// Resets the traffic counters.
    pub fn reset_statistics(&self) {
        self.stats().reset();
    }

    /// Leases an index and encodes a request datagram into a pool buffer.
    ///
    /// The datagram is not sent until it is passed to
    /// [`schedule`](DatagramEngine::schedule). `callback` fires exactly once,
    /// unless the datagram is cancelled.
    pub fn cyclic_datagram_init(
        &self,
        command: Command,
        address: Address,
        payload: &[u8],
        timeout: Duration,
        callback: DatagramCallback,
    ) -> Result<u8> {
        let required = DATAGRAM_HEADER_SIZE + payload.len() + WKC_SIZE;
        let available =
            self.pool.entry_size().min(self.config.mtu.saturating_sub(FRAME_HEADER_SIZE));
        if required > available {
            return Err(ErrorKind::CapacityExceeded { required, available });
        }

        let index =
            self.indices().lease().ok_or(ErrorKind::ResourceExhausted(Resource::DatagramIndices))?;
        let mut entry = match self.pool.try_get() {
            Ok(entry) => entry,
            Err(err) => {
                self.indices().release(index);
                return Err(err);
            }
        };
        match encode_datagram(entry.buffer_mut(), command, index, address, payload) {
            Ok(len) => entry.set_len(len),
            Err(err) => {
                self.release(index, entry);
                return Err(err);
            }
        }

        let generation = self.generations.fetch_add(1, Ordering::Relaxed);
        *self.slot(index) = Some(
            CyclicDatagram::new(index, entry, command, timeout, callback).with_generation(generation),
        );
        trace!("initialised {} datagram with index {}", command, index);
        Ok(index)
    }

    /// Queues an initialised datagram for the next transmit. Scheduling a
    /// datagram that is already queued does nothing; a datagram that was
    /// sent or is unknown fails with `Empty`.
    pub fn schedule(&self, index: u8) -> Result<()> {
        let mut slot = self.slot(index);
        match slot.as_mut() {
            Some(datagram) if !datagram.is_sent() => {
                if !datagram.is_queued() {
                    datagram.set_queued(true);
                    // the receiver lives as long as the engine
                    let _ = self.tx_sender.send(index);
                }
                Ok(())
            }
            _ => Err(ErrorKind::Empty),
        }
    }

    /// Initialises and queues a datagram in one step. Returns its index.
    pub fn datagram_schedule(
        &self,
        command: Command,
        address: Address,
        payload: &[u8],
        timeout: Duration,
        callback: DatagramCallback,
    ) -> Result<u8> {
        let index = self.cyclic_datagram_init(command, address, payload, timeout, callback)?;
        self.schedule(index)?;
        Ok(index)
    }

    /// Destroys an outstanding datagram without running its callback.
    /// Returns false if nothing held `index`.
    pub fn cancel(&self, index: u8) -> bool {
        let datagram = self.slot(index).take();
        match datagram {
            Some(datagram) => {
                trace!("cancelled datagram with index {}", index);
                self.release(index, datagram.into_entry());
                true
            }
            None => false,
        }
    }

    /// Generation of the transaction holding `index`, if any. Pair it with
    /// [`cancel_generation`](DatagramEngine::cancel_generation) to withdraw
    /// a transaction without touching a later one that reuses its index.
    pub fn generation(&self, index: u8) -> Option<u64> {
        self.slot(index).as_ref().map(CyclicDatagram::generation)
    }

    /// Like [`cancel`](DatagramEngine::cancel), but only if `index` is still
    /// held by the transaction of `generation`.
    pub fn cancel_generation(&self, index: u8, generation: u64) -> bool {
        let datagram = {
            let mut slot = self.slot(index);
            match slot.as_ref() {
                Some(datagram) if datagram.generation() == generation => slot.take(),
                _ => None,
            }
        };
        match datagram {
            Some(datagram) => {
                trace!("withdrew datagram with index {}", index);
                self.release(index, datagram.into_entry());
                true
            }
            None => false,
        }
    }

    /// Packs queued datagrams into frames and sends them through `port`.
    /// Returns the number of frames sent.
    ///
    /// Datagrams count as sent, and their deadlines start, once they are
    /// packed; a frame the interceptor suppresses or the port fails to send
    /// is left to the timeout sweep.
    pub fn transmit<P: HardwarePort + ?Sized>(
        &self,
        port: &mut P,
        interceptor: &mut dyn FrameInterceptor,
        now: Instant,
    ) -> Result<usize> {
        let mut frames = 0;
        let mut carry: Option<u8> = None;

        while carry.is_some() || !self.tx_receiver.is_empty() {
            if !port.send_finished() {
                break;
            }
            let mtu = port.mtu().min(self.config.mtu);
            let buffer = match port.tx_buffer() {
                Ok(buffer) => buffer,
                Err(err) => {
                    error!("failed to acquire transmit buffer: {}", err);
                    self.stats().send_errors += 1;
                    self.requeue(carry);
                    return Err(err.into());
                }
            };
            let mut packed = 0u64;

            let mut writer = match FrameWriter::new(
                &mut *buffer,
                mtu,
                self.config.destination_mac,
                self.config.source_mac,
            ) {
                Ok(writer) => writer,
                Err(err) => {
                    self.requeue(carry);
                    return Err(err);
                }
            };
            while let Some(index) = carry.take().or_else(|| self.tx_receiver.try_recv().ok()) {
                let mut slot = self.slot(index);
                let size = match slot.as_ref() {
                    Some(datagram) if datagram.is_queued() => datagram.encoded().len(),
                    // cancelled, or re-queued under a reused index
                    _ => continue,
                };
                if size > writer.remaining() {
                    if writer.is_empty() {
                        let oversized = slot.take();
                        drop(slot);
                        warn!("datagram {} does not fit the port MTU of {} bytes", index, mtu);
                        if let Some(datagram) = oversized {
                            self.finish(index, datagram, DatagramOutcome::Timeout);
                            self.stats().datagram_timeouts += 1;
                        }
                        continue;
                    }
                    carry = Some(index);
                    break;
                }
                if let Some(datagram) = slot.as_mut() {
                    if let Err(err) = writer.append_encoded(datagram.encoded()) {
                        drop(slot);
                        self.requeue(Some(index));
                        return Err(err);
                    }
                    datagram.mark_sent(now);
                    packed += 1;
                }
            }
            if writer.is_empty() {
                break;
            }
            let len = writer.finish();

            if !interceptor.on_send(&mut buffer[..len]) {
                trace!("interceptor suppressed a frame with {} datagrams", packed);
                continue;
            }
            if let Err(err) = port.send(len) {
                error!("failed to send frame of {} bytes: {}", len, err);
                self.stats().send_errors += 1;
                self.requeue(carry);
                return Err(err.into());
            }
            frames += 1;
            let mut stats = self.stats();
            stats.frames_sent += 1;
            stats.datagrams_sent += packed;
        }

        self.requeue(carry);
        Ok(frames)
    }

    /// Dispatches the datagrams of a received frame. Returns how many of
    /// them completed an outstanding transaction.
    ///
    /// Datagrams whose index has no outstanding, sent transaction with the
    /// same command are dropped. Frames that are not EtherCAT frames fail
    /// with a decoding error.
    pub fn process_rx_frame(&self, frame: &[u8]) -> Result<usize> {
        let frame = match Frame::parse(frame) {
            Ok(frame) => frame,
            Err(err) => {
                self.stats().foreign_frames += 1;
                return Err(err);
            }
        };
        self.stats().frames_received += 1;

        let mut matched = 0;
        let mut stale = 0;
        for datagram in frame.datagrams() {
            let datagram = match datagram {
                Ok(datagram) => datagram,
                Err(err) => {
                    warn!("dropping the rest of a received frame: {}", err);
                    break;
                }
            };
            let index = datagram.index();
            let outstanding = {
                let mut slot = self.slot(index);
                match slot.as_ref() {
                    Some(pending) if pending.is_sent() && pending.command() == datagram.command() => {
                        slot.take()
                    }
                    _ => None,
                }
            };
            match outstanding {
                Some(pending) => {
                    trace!("datagram {} answered with wkc {}", index, datagram.wkc());
                    let outcome =
                        DatagramOutcome::Response { wkc: datagram.wkc(), payload: datagram.payload() };
                    self.finish(index, pending, outcome);
                    matched += 1;
                }
                None => {
                    trace!("dropping stale {} datagram with index {}", datagram.command(), index);
                    stale += 1;
                }
            }
        }

        let mut stats = self.stats();
        stats.datagrams_matched += matched as u64;
        stats.stale_datagrams += stale;
        Ok(matched)
    }

    /// Times out every sent datagram whose deadline is behind `now`.
    /// Returns how many were completed.
    pub fn sweep(&self, now: Instant) -> usize {
        let snapshot = self.indices().clone();
        let mut expired = 0;
        for index in snapshot.leased() {
            let datagram = {
                let mut slot = self.slot(index);
                if slot.as_ref().map_or(false, |datagram| datagram.is_expired(now)) {
                    slot.take()
                } else {
                    None
                }
            };
            if let Some(datagram) = datagram {
                trace!("datagram {} timed out", index);
                self.finish(index, datagram, DatagramOutcome::Timeout);
                expired += 1;
            }
        }
        if expired > 0 {
            self.stats().datagram_timeouts += expired as u64;
        }
        expired
    }

    /// Completes every outstanding datagram with a timeout and closes the
    /// pool. Returns the number of pool entries still on loan.
    pub fn close(&self) -> usize {
        while self.tx_receiver.try_recv().is_ok() {}
        for index in 0..DATAGRAM_INDEX_COUNT {
            let index = index as u8;
            let datagram = self.slot(index).take();
            if let Some(datagram) = datagram {
                self.finish(index, datagram, DatagramOutcome::Timeout);
            }
        }
        self.pool.close()
    }

    /// Puts a popped, still queued index back on the transmit queue.
    fn requeue(&self, index: Option<u8>) {
        if let Some(index) = index {
            // the receiver lives as long as the engine
            let _ = self.tx_sender.send(index);
        }
    }

    fn finish(&self, index: u8, datagram: CyclicDatagram, outcome: DatagramOutcome<'_>) {
        let entry = datagram.complete(outcome);
        self.release(index, entry);
    }

    fn release(&self, index: u8, entry: PoolEntry) {
        self.indices().release(index);
        self.pool.put(entry);
    }

    fn slot(&self, index: u8) -> MutexGuard<'_, Option<CyclicDatagram>> {
        self.slots[usize::from(index)].lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn indices(&self) -> MutexGuard<'_, IndexAllocator> {
        self.indices.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn stats(&self) -> MutexGuard<'_, MasterStatistics> {
        self.statistics.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for DatagramEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatagramEngine")
            .field("pool", &self.pool)
            .field("in_flight", &self.in_flight())
            .field("queued", &self.queued())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::{
        io,
        sync::atomic::{AtomicUsize, Ordering},
    };

    use ecbus_core::{
        constants::{ETH_FRAME_LEN, ETH_HEADER_SIZE},
        interceptor::NoOpInterceptor,
        mac::BROADCAST_MAC,
    };

    use super::*;

    struct CapturePort {
        tx: Vec<u8>,
        sent: Vec<Vec<u8>>,
        mtu: usize,
    }

    impl CapturePort {
        fn new(mtu: usize) -> Self {
            Self { tx: vec![0; ETH_FRAME_LEN], sent: Vec::new(), mtu }
        }
    }

    impl HardwarePort for CapturePort {
        fn tx_buffer(&mut self) -> io::Result<&mut [u8]> {
            Ok(&mut self.tx)
        }

        fn send(&mut self, len: usize) -> io::Result<()> {
            self.sent.push(self.tx[..len].to_vec());
            Ok(())
        }

        fn receive_frame<'a>(&mut self, _buffer: &'a mut [u8]) -> io::Result<&'a [u8]> {
            Err(io::ErrorKind::WouldBlock.into())
        }

        fn mtu(&self) -> usize {
            self.mtu
        }
    }

    /// Turns a sent frame into the reply every slave would produce: same
    /// datagrams, work counter set to `wkc`.
    fn answer(frame: &[u8], wkc: u16) -> Vec<u8> {
        let parsed = Frame::parse(frame).unwrap();
        let mut buffer = vec![0u8; ETH_FRAME_LEN];
        let mut writer = FrameWriter::new(&mut buffer, 1500, BROADCAST_MAC, BROADCAST_MAC).unwrap();
        for datagram in parsed.datagrams() {
            let datagram = datagram.unwrap();
            writer.append_encoded(&parsed.region()[datagram.offset()..datagram.end()]).unwrap();
            writer.set_last_wkc(wkc);
        }
        let len = writer.finish();
        buffer.truncate(len);
        buffer
    }

    fn counting_callback(counter: &Arc<AtomicUsize>, timeouts: &Arc<AtomicUsize>) -> DatagramCallback {
        let counter = counter.clone();
        let timeouts = timeouts.clone();
        Box::new(move |outcome| {
            counter.fetch_add(1, Ordering::SeqCst);
            if outcome.is_timeout() {
                timeouts.fetch_add(1, Ordering::SeqCst);
            }
        })
    }

    fn engine(pool_size: usize) -> DatagramEngine {
        let config = Config { pool_size, ..Config::default() };
        let pool = Arc::new(Pool::open(config.pool_size, config.pool_entry_size));
        DatagramEngine::with_indices(&config, pool, IndexAllocator::with_start(0))
    }

    fn brd(engine: &DatagramEngine, callback: DatagramCallback) -> Result<u8> {
        engine.datagram_schedule(
            Command::Brd,
            Address::Physical { adp: 0, ado: 0x0130 },
            &[0, 0],
            Duration::from_millis(1),
            callback,
        )
    }

    #[test]
    fn test_index_space_exhaustion() {
        let engine = engine(300);
        for _ in 0..256 {
            brd(&engine, Box::new(|_| {})).unwrap();
        }
        assert!(matches!(
            brd(&engine, Box::new(|_| {})),
            Err(ErrorKind::ResourceExhausted(Resource::DatagramIndices))
        ));
        assert_eq!(engine.in_flight(), 256);
        // the failed attempt did not keep a buffer
        assert_eq!(engine.pool().available(), 300 - 256);
    }

    #[test]
    fn test_pool_exhaustion_releases_index() {
        let engine = engine(1);
        brd(&engine, Box::new(|_| {})).unwrap();
        assert!(matches!(
            brd(&engine, Box::new(|_| {})),
            Err(ErrorKind::ResourceExhausted(Resource::PoolEntries))
        ));
        assert_eq!(engine.in_flight(), 1);
    }

    #[test]
    fn test_transmit_packs_datagrams_into_one_frame() {
        let engine = engine(8);
        let mut port = CapturePort::new(1500);
        for _ in 0..3 {
            brd(&engine, Box::new(|_| {})).unwrap();
        }

        let frames = engine.transmit(&mut port, &mut NoOpInterceptor, Instant::now()).unwrap();
        assert_eq!(frames, 1);
        let frame = Frame::parse(&port.sent[0]).unwrap();
        let indices: Vec<u8> = frame.datagrams().map(|d| d.unwrap().index()).collect();
        assert_eq!(indices, vec![0, 1, 2]);
        assert_eq!(engine.queued(), 0);
        assert_eq!(engine.statistics().datagrams_sent, 3);
    }

    #[test]
    fn test_transmit_splits_at_mtu() {
        let engine = engine(8);
        // frame header plus two 14 byte datagrams
        let mut port = CapturePort::new(FRAME_HEADER_SIZE + 28);
        for _ in 0..3 {
            brd(&engine, Box::new(|_| {})).unwrap();
        }

        let frames = engine.transmit(&mut port, &mut NoOpInterceptor, Instant::now()).unwrap();
        assert_eq!(frames, 2);
        assert_eq!(Frame::parse(&port.sent[0]).unwrap().datagrams().count(), 2);
        assert_eq!(Frame::parse(&port.sent[1]).unwrap().datagrams().count(), 1);
        assert_eq!(port.sent[0].len(), ETH_HEADER_SIZE + FRAME_HEADER_SIZE + 28);
    }

    #[test]
    fn test_response_completes_exactly_once() {
        let engine = engine(8);
        let mut port = CapturePort::new(1500);
        let calls = Arc::new(AtomicUsize::new(0));
        let timeouts = Arc::new(AtomicUsize::new(0));
        let index = brd(&engine, counting_callback(&calls, &timeouts)).unwrap();

        engine.transmit(&mut port, &mut NoOpInterceptor, Instant::now()).unwrap();
        let reply = answer(&port.sent[0], 3);

        assert_eq!(engine.process_rx_frame(&reply).unwrap(), 1);
        assert_eq!(engine.process_rx_frame(&reply).unwrap(), 0);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(timeouts.load(Ordering::SeqCst), 0);
        assert!(!engine.is_outstanding(index));
        assert_eq!(engine.in_flight(), 0);
        assert_eq!(engine.pool().available(), 8);

        let stats = engine.statistics();
        assert_eq!(stats.datagrams_matched, 1);
        assert_eq!(stats.stale_datagrams, 1);
    }

    #[test]
    fn test_response_carries_payload_and_wkc() {
        let engine = engine(2);
        let mut port = CapturePort::new(1500);
        let seen = Arc::new(Mutex::new(None));
        let sink = seen.clone();
        engine
            .datagram_schedule(
                Command::Fprd,
                Address::Physical { adp: 0x1001, ado: 0x0130 },
                &[0xAA, 0xBB],
                Duration::from_millis(5),
                Box::new(move |outcome| {
                    if let DatagramOutcome::Response { wkc, payload } = outcome {
                        *sink.lock().unwrap() = Some((wkc, payload.to_vec()));
                    }
                }),
            )
            .unwrap();

        engine.transmit(&mut port, &mut NoOpInterceptor, Instant::now()).unwrap();
        engine.process_rx_frame(&answer(&port.sent[0], 1)).unwrap();
        assert_eq!(*seen.lock().unwrap(), Some((1, vec![0xAA, 0xBB])));
    }

    #[test]
    fn test_unsent_datagram_ignores_echo() {
        let sender = engine(4);
        let mut port = CapturePort::new(1500);
        brd(&sender, Box::new(|_| {})).unwrap();
        sender.transmit(&mut port, &mut NoOpInterceptor, Instant::now()).unwrap();
        let reply = answer(&port.sent[0], 1);

        // same index, initialised but not yet sent
        let receiver = engine(4);
        let index = receiver
            .cyclic_datagram_init(
                Command::Brd,
                Address::Physical { adp: 0, ado: 0x0130 },
                &[0, 0],
                Duration::from_millis(1),
                Box::new(|_| {}),
            )
            .unwrap();
        assert_eq!(index, 0);
        assert_eq!(receiver.process_rx_frame(&reply).unwrap(), 0);
        assert!(receiver.is_outstanding(0));
    }

    #[test]
    fn test_command_mismatch_is_stale() {
        let engine = engine(4);
        let mut port = CapturePort::new(1500);
        brd(&engine, Box::new(|_| {})).unwrap();
        engine.transmit(&mut port, &mut NoOpInterceptor, Instant::now()).unwrap();

        let mut reply = answer(&port.sent[0], 1);
        reply[ETH_HEADER_SIZE + FRAME_HEADER_SIZE] = Command::Bwr.to_u8();
        assert_eq!(engine.process_rx_frame(&reply).unwrap(), 0);
        assert_eq!(engine.in_flight(), 1);
    }

    #[test]
    fn test_sweep_times_out_after_deadline() {
        let engine = engine(4);
        let mut port = CapturePort::new(1500);
        let calls = Arc::new(AtomicUsize::new(0));
        let timeouts = Arc::new(AtomicUsize::new(0));
        brd(&engine, counting_callback(&calls, &timeouts)).unwrap();

        let start = Instant::now();
        engine.transmit(&mut port, &mut NoOpInterceptor, start).unwrap();
        assert_eq!(engine.sweep(start + Duration::from_micros(500)), 0);
        assert_eq!(engine.sweep(start + Duration::from_millis(1)), 1);
        assert_eq!(engine.sweep(start + Duration::from_millis(2)), 0);

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(timeouts.load(Ordering::SeqCst), 1);
        assert_eq!(engine.in_flight(), 0);
        assert_eq!(engine.statistics().datagram_timeouts, 1);
        brd(&engine, Box::new(|_| {})).unwrap();
    }

    #[test]
    fn test_unsent_datagram_never_expires() {
        let engine = engine(2);
        let index = engine
            .cyclic_datagram_init(
                Command::Nop,
                Address::Logical(0),
                &[],
                Duration::from_millis(1),
                Box::new(|_| {}),
            )
            .unwrap();
        assert_eq!(engine.sweep(Instant::now() + Duration::from_secs(1)), 0);
        assert!(engine.is_outstanding(index));
    }

    #[test]
    fn test_cancel_skips_callback_and_transmit() {
        let engine = engine(4);
        let mut port = CapturePort::new(1500);
        let calls = Arc::new(AtomicUsize::new(0));
        let timeouts = Arc::new(AtomicUsize::new(0));
        let index = brd(&engine, counting_callback(&calls, &timeouts)).unwrap();

        assert!(engine.cancel(index));
        assert!(!engine.cancel(index));
        assert_eq!(engine.transmit(&mut port, &mut NoOpInterceptor, Instant::now()).unwrap(), 0);
        assert!(port.sent.is_empty());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(engine.pool().available(), 4);
    }

    #[test]
    fn test_schedule_twice_sends_once() {
        let engine = engine(4);
        let mut port = CapturePort::new(1500);
        let index = brd(&engine, Box::new(|_| {})).unwrap();
        engine.schedule(index).unwrap();
        engine.transmit(&mut port, &mut NoOpInterceptor, Instant::now()).unwrap();
        assert_eq!(Frame::parse(&port.sent[0]).unwrap().datagrams().count(), 1);
        assert!(matches!(engine.schedule(index), Err(ErrorKind::Empty)));
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let engine = engine(2);
        let payload = vec![0u8; 1500];
        let err = engine
            .datagram_schedule(
                Command::Lwr,
                Address::Logical(0),
                &payload,
                Duration::from_millis(1),
                Box::new(|_| {}),
            )
            .unwrap_err();
        assert!(matches!(err, ErrorKind::CapacityExceeded { required: 1512, available: 1498 }));
        assert_eq!(engine.in_flight(), 0);
    }

    struct DropAll;

    impl FrameInterceptor for DropAll {
        fn on_receive(&mut self, _frame: &mut [u8]) -> bool {
            true
        }

        fn on_send(&mut self, _frame: &mut [u8]) -> bool {
            false
        }
    }

    #[test]
    fn test_suppressed_frame_times_out() {
        let engine = engine(2);
        let mut port = CapturePort::new(1500);
        let calls = Arc::new(AtomicUsize::new(0));
        let timeouts = Arc::new(AtomicUsize::new(0));
        brd(&engine, counting_callback(&calls, &timeouts)).unwrap();

        let start = Instant::now();
        assert_eq!(engine.transmit(&mut port, &mut DropAll, start).unwrap(), 0);
        assert!(port.sent.is_empty());
        engine.sweep(start + Duration::from_millis(5));
        assert_eq!(timeouts.load(Ordering::SeqCst), 1);
    }

    /// Port whose transmit buffer becomes unavailable after a number of frames.
    struct FailingBufferPort {
        inner: CapturePort,
        buffers_left: usize,
    }

    impl HardwarePort for FailingBufferPort {
        fn tx_buffer(&mut self) -> io::Result<&mut [u8]> {
            if self.buffers_left == 0 {
                return Err(io::Error::new(io::ErrorKind::Other, "no transmit buffer"));
            }
            self.buffers_left -= 1;
            self.inner.tx_buffer()
        }

        fn send(&mut self, len: usize) -> io::Result<()> {
            self.inner.send(len)
        }

        fn receive_frame<'a>(&mut self, buffer: &'a mut [u8]) -> io::Result<&'a [u8]> {
            self.inner.receive_frame(buffer)
        }

        fn mtu(&self) -> usize {
            self.inner.mtu()
        }
    }

    #[test]
    fn test_carried_datagram_survives_buffer_failure() {
        let engine = engine(4);
        // room for exactly one 14 byte datagram per frame
        let mut port =
            FailingBufferPort { inner: CapturePort::new(FRAME_HEADER_SIZE + 14), buffers_left: 1 };
        let calls = Arc::new(AtomicUsize::new(0));
        let timeouts = Arc::new(AtomicUsize::new(0));
        brd(&engine, counting_callback(&calls, &timeouts)).unwrap();
        let second = brd(&engine, counting_callback(&calls, &timeouts)).unwrap();

        let start = Instant::now();
        assert!(engine.transmit(&mut port, &mut NoOpInterceptor, start).is_err());
        assert_eq!(port.inner.sent.len(), 1);
        assert_eq!(engine.queued(), 1);
        assert_eq!(engine.statistics().send_errors, 1);

        port.buffers_left = 1;
        assert_eq!(engine.transmit(&mut port, &mut NoOpInterceptor, start).unwrap(), 1);
        let frame = Frame::parse(&port.inner.sent[1]).unwrap();
        assert_eq!(frame.datagrams().next().unwrap().unwrap().index(), second);

        assert_eq!(engine.sweep(start + Duration::from_secs(10)), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(engine.in_flight(), 0);
    }

    #[test]
    fn test_datagram_over_port_mtu_counts_as_timeout() {
        let engine = engine(2);
        // smaller than one datagram
        let mut port = CapturePort::new(FRAME_HEADER_SIZE + 8);
        let calls = Arc::new(AtomicUsize::new(0));
        let timeouts = Arc::new(AtomicUsize::new(0));
        brd(&engine, counting_callback(&calls, &timeouts)).unwrap();

        assert_eq!(engine.transmit(&mut port, &mut NoOpInterceptor, Instant::now()).unwrap(), 0);
        assert_eq!(timeouts.load(Ordering::SeqCst), 1);
        assert_eq!(engine.statistics().datagram_timeouts, 1);
        assert_eq!(engine.in_flight(), 0);
    }

    #[test]
    fn test_cancel_generation_spares_reused_index() {
        let engine = engine(2);
        let index = brd(&engine, Box::new(|_| {})).unwrap();
        let stale = engine.generation(index).unwrap();
        assert!(engine.cancel(index));

        // lease every other index so the next one is the cancelled index again
        let mut reused = brd(&engine, Box::new(|_| {})).unwrap();
        while reused != index {
            assert!(engine.cancel(reused));
            reused = brd(&engine, Box::new(|_| {})).unwrap();
        }
        assert_ne!(engine.generation(index), Some(stale));
        assert!(!engine.cancel_generation(index, stale));
        assert!(engine.is_outstanding(index));

        let current = engine.generation(index).unwrap();
        assert!(engine.cancel_generation(index, current));
        assert_eq!(engine.in_flight(), 0);
        assert_eq!(engine.pool().available(), 2);
    }

    #[test]
    fn test_foreign_frame_is_counted() {
        let engine = engine(2);
        let mut frame = vec![0u8; 64];
        frame[12..14].copy_from_slice(&0x0800u16.to_be_bytes());
        assert!(engine.process_rx_frame(&frame).is_err());
        assert_eq!(engine.statistics().foreign_frames, 1);
    }

    #[test]
    fn test_close_times_out_outstanding() {
        let engine = engine(4);
        let calls = Arc::new(AtomicUsize::new(0));
        let timeouts = Arc::new(AtomicUsize::new(0));
        brd(&engine, counting_callback(&calls, &timeouts)).unwrap();
        brd(&engine, counting_callback(&calls, &timeouts)).unwrap();

        assert_eq!(engine.close(), 0);
        assert_eq!(timeouts.load(Ordering::SeqCst), 2);
        assert_eq!(engine.in_flight(), 0);
    }
}
