use std::{
    collections::HashMap,
    fmt, io,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::{sleep, yield_now},
    time::{Duration, Instant},
};

use ecbus_core::{
    config::{Config, SlaveConfig},
    constants::ETH_FRAME_LEN,
    error::{ErrorKind, Result},
    interceptor::{FrameInterceptor, NoOpInterceptor},
    transport::HardwarePort,
};
use ecbus_mailbox::{Mailbox, MailboxHandler};
use ecbus_protocol::{Address, Command};
use tracing::{debug, error, warn};

use crate::{
    cyclic::DatagramCallback,
    engine::DatagramEngine,
    mailbox_port::EngineTransport,
    statistics::MasterStatistics,
    time::{Clock, SystemClock},
};

/// The master: one hardware port, the datagram engine driven by the cyclic
/// loop, and one mailbox handler per registered slave.
pub struct Master<P: HardwarePort> {
    config: Config,
    port: P,
    engine: Arc<DatagramEngine>,
    slaves: HashMap<u16, MailboxHandler>,
    receive_buffer: Vec<u8>,
    interceptor: Box<dyn FrameInterceptor>,
    clock: Arc<dyn Clock>,
    stop: Arc<AtomicBool>,
}

impl<P: HardwarePort> Master<P> {
    /// Creates a master on `port` with the system clock and no interceptor.
    pub fn new(port: P, config: Config) -> Self {
        Self::with_clock_and_interceptor(
            port,
            config,
            Arc::new(SystemClock),
            Box::new(NoOpInterceptor),
        )
    }

    /// Creates a master with a custom frame interceptor.
    pub fn with_interceptor(port: P, config: Config, interceptor: Box<dyn FrameInterceptor>) -> Self {
        Self::with_clock_and_interceptor(port, config, Arc::new(SystemClock), interceptor)
    }

    /// Creates a master with a custom clock and frame interceptor.
    pub fn with_clock_and_interceptor(
        port: P,
        config: Config,
        clock: Arc<dyn Clock>,
        interceptor: Box<dyn FrameInterceptor>,
    ) -> Self {
        let engine = Arc::new(DatagramEngine::new(&config));
        debug!("master started with mtu {}", port.mtu().min(config.mtu));
        Self {
            config,
            port,
            engine,
            slaves: HashMap::new(),
            receive_buffer: vec![0; ETH_FRAME_LEN],
            interceptor,
            clock,
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Registers a slave and starts its mailbox handler. Mailbox traffic is
    /// carried by this master's datagrams, so it only progresses while the
    /// master is polled.
    pub fn add_slave(&mut self, slave: SlaveConfig) -> Result<Arc<Mailbox>> {
        let position = slave.position;
        if let Some(handler) = self.slaves.remove(&position) {
            warn!("replacing mailbox of slave {}", position);
            handler.stop();
        }
        let transport = EngineTransport::new(self.engine.clone(), self.config.datagram_timeout);
        let mailbox = Arc::new(Mailbox::new(slave, &self.config, Arc::new(transport)));
        let handler = MailboxHandler::spawn(mailbox.clone())?;
        self.slaves.insert(position, handler);
        Ok(mailbox)
    }

    /// Mailbox of the slave at `position`.
    pub fn mailbox(&self, position: u16) -> Result<Arc<Mailbox>> {
        self.slaves
            .get(&position)
            .map(|handler| handler.mailbox().clone())
            .ok_or(ErrorKind::UnknownSlave(position))
    }

    /// Number of registered slaves.
    pub fn slave_count(&self) -> usize {
        self.slaves.len()
    }

    /// Schedules a datagram for the next cycle. `timeout` defaults to
    /// [`Config::datagram_timeout`].
    pub fn datagram_schedule(
        &self,
        command: Command,
        address: Address,
        payload: &[u8],
        timeout: Option<Duration>,
        callback: DatagramCallback,
    ) -> Result<u8> {
        let timeout = timeout.unwrap_or(self.config.datagram_timeout);
        self.engine.datagram_schedule(command, address, payload, timeout, callback)
    }

    /// Runs one cycle at the current time of the master's clock.
    pub fn poll(&mut self) -> Result<()> {
        let now = self.clock.now();
        self.manual_poll(now)
    }

    /// Runs one cycle at `time`: sends queued datagrams, dispatches every
    /// received frame, times out overdue datagrams and wakes the mailbox
    /// handlers. Returns the first device error of the cycle.
    pub fn manual_poll(&mut self, time: Instant) -> Result<()> {
        let mut result = Ok(());

        if let Err(err) = self.engine.transmit(&mut self.port, self.interceptor.as_mut(), time) {
            result = Err(err);
        }
        if let Err(err) = self.receive_all() {
            if result.is_ok() {
                result = Err(err);
            }
        }
        self.engine.sweep(time);
        for handler in self.slaves.values() {
            handler.mailbox().kick();
        }
        result
    }

    /// Polls until [`stop_handle`](Master::stop_handle) is raised, sleeping
    /// for the configured cycle interval between cycles (blocking call).
    pub fn start_polling(&mut self) {
        self.start_polling_with_duration(Some(self.config.cycle_interval))
    }

    /// Polls until stopped, with a custom sleep between cycles; `None`
    /// only yields (blocking call).
    pub fn start_polling_with_duration(&mut self, sleep_duration: Option<Duration>) {
        while !self.stop.load(Ordering::Acquire) {
            // failures are logged where they happen
            let _ = self.poll();
            match sleep_duration {
                None => yield_now(),
                Some(duration) => sleep(duration),
            };
        }
        self.stop.store(false, Ordering::Release);
    }

    /// Flag that ends [`start_polling`](Master::start_polling) when set,
    /// usable from another thread.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        self.stop.clone()
    }

    /// Snapshot of the engine counters.
    pub fn statistics(&self) -> MasterStatistics {
        self.engine.statistics()
    }

    /// The datagram engine.
    pub fn engine(&self) -> &Arc<DatagramEngine> {
        &self.engine
    }

    /// The hardware port.
    pub fn port(&self) -> &P {
        &self.port
    }

    /// Mutable access to the hardware port.
    pub fn port_mut(&mut self) -> &mut P {
        &mut self.port
    }

    /// Shuts the master down: outstanding datagrams time out, mailbox
    /// handlers stop and the port is closed.
    pub fn close(mut self) -> Result<()> {
        // completing the datagrams first unblocks handlers waiting on them
        self.engine.close();
        for (_, handler) in self.slaves.drain() {
            handler.stop();
        }
        self.port.close()?;
        debug!("master closed");
        Ok(())
    }

    fn receive_all(&mut self) -> Result<()> {
        loop {
            let len = match self.port.receive_frame(&mut self.receive_buffer) {
                Ok(frame) => frame.len(),
                Err(e) => {
                    if e.kind() == io::ErrorKind::WouldBlock {
                        return Ok(());
                    }
                    error!("failed to receive frame: {}", e);
                    return Err(e.into());
                }
            };
            let frame = &mut self.receive_buffer[..len];
            if self.interceptor.on_receive(frame) {
                if let Err(err) = self.engine.process_rx_frame(frame) {
                    warn!("ignoring received frame: {}", err);
                }
            }
            if self.port.is_blocking_mode() {
                return Ok(());
            }
        }
    }
}

impl<P: HardwarePort> fmt::Debug for Master<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Master")
            .field("engine", &self.engine)
            .field("slaves", &self.slaves.len())
            .field("stopped", &self.stop.load(Ordering::Relaxed))
            .finish()
    }
}
