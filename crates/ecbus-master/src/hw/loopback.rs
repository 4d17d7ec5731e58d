use std::io;

use crossbeam_channel::{unbounded, Receiver, Sender, TryRecvError};
use ecbus_core::{
    constants::{DEFAULT_MTU, ETH_FRAME_LEN},
    transport::HardwarePort,
};

/// In-process port; frames sent on one end of a pair arrive at the other.
///
/// Used to run a master against a simulated bus.
#[derive(Debug)]
pub struct LoopbackPort {
    tx: Vec<u8>,
    sender: Sender<Vec<u8>>,
    receiver: Receiver<Vec<u8>>,
    mtu: usize,
}

impl LoopbackPort {
    /// Creates two connected ports with the default MTU.
    pub fn pair() -> (Self, Self) {
        Self::pair_with_mtu(DEFAULT_MTU)
    }

    /// Creates two connected ports carrying Ethernet payloads of up to `mtu` bytes.
    pub fn pair_with_mtu(mtu: usize) -> (Self, Self) {
        let (a_sender, b_receiver) = unbounded();
        let (b_sender, a_receiver) = unbounded();
        let a = Self { tx: vec![0; ETH_FRAME_LEN], sender: a_sender, receiver: a_receiver, mtu };
        let b = Self { tx: vec![0; ETH_FRAME_LEN], sender: b_sender, receiver: b_receiver, mtu };
        (a, b)
    }

    /// Sends a complete frame, bypassing the transmit buffer.
    pub fn send_frame(&self, frame: &[u8]) -> io::Result<()> {
        self.sender
            .send(frame.to_vec())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "loopback peer closed"))
    }

    /// Takes the next received frame without copying it.
    pub fn try_recv_frame(&self) -> Option<Vec<u8>> {
        self.receiver.try_recv().ok()
    }

    /// Number of frames waiting to be received.
    pub fn pending(&self) -> usize {
        self.receiver.len()
    }
}

impl HardwarePort for LoopbackPort {
    fn tx_buffer(&mut self) -> io::Result<&mut [u8]> {
        Ok(&mut self.tx)
    }

    fn send(&mut self, len: usize) -> io::Result<()> {
        let frame = self.tx.get(..len).ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "frame longer than transmit buffer")
        })?;
        self.sender
            .send(frame.to_vec())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "loopback peer closed"))
    }

    fn receive_frame<'a>(&mut self, buffer: &'a mut [u8]) -> io::Result<&'a [u8]> {
        match self.receiver.try_recv() {
            Ok(frame) => {
                let len = frame.len().min(buffer.len());
                buffer[..len].copy_from_slice(&frame[..len]);
                Ok(&buffer[..len])
            }
            Err(TryRecvError::Empty) => Err(io::ErrorKind::WouldBlock.into()),
            Err(TryRecvError::Disconnected) => {
                Err(io::Error::new(io::ErrorKind::BrokenPipe, "loopback peer closed"))
            }
        }
    }

    fn mtu(&self) -> usize {
        self.mtu
    }
}
