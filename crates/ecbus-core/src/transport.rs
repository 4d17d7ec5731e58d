//! Hardware port abstraction for pluggable frame I/O.

use std::io::Result;

/// Raw frame device the datagram engine transmits through.
///
/// Implementations own their transmit buffer. The engine borrows it with
/// [`tx_buffer`](HardwarePort::tx_buffer), fills one frame and hands it back
/// with [`send`](HardwarePort::send); it never holds on to the buffer across
/// sends. Concrete ports (UDP, loopback, raw sockets) are opened by their own
/// constructors.
pub trait HardwarePort: Send {
    /// Borrows the buffer the next frame is built in.
    fn tx_buffer(&mut self) -> Result<&mut [u8]>;

    /// Transmits the first `len` bytes of the transmit buffer.
    fn send(&mut self, len: usize) -> Result<()>;

    /// Returns true once the previous send has left the device and the
    /// transmit buffer may be reused.
    fn send_finished(&mut self) -> bool {
        true
    }

    /// Receives one frame into `buffer`. Fails with
    /// [`WouldBlock`](std::io::ErrorKind::WouldBlock) if no frame is pending.
    fn receive_frame<'a>(&mut self, buffer: &'a mut [u8]) -> Result<&'a [u8]>;

    /// Returns whether receives block until a frame arrives.
    fn is_blocking_mode(&self) -> bool {
        false
    }

    /// Largest Ethernet payload the device carries.
    fn mtu(&self) -> usize;

    /// Releases the device.
    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}
