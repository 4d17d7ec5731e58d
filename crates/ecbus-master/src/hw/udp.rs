use std::{
    io,
    net::{IpAddr, SocketAddr, ToSocketAddrs, UdpSocket},
};

use ecbus_core::{
    config::Config,
    constants::{ETH_FRAME_LEN, ETH_HEADER_SIZE},
    mac::{MacAddress, BROADCAST_MAC},
    transport::HardwarePort,
};
use ecbus_protocol::EthernetHeader;
use socket2::Socket as Socket2;
use tracing::debug;

/// Applies the socket options from the configuration.
fn apply_socket_options(socket: &UdpSocket, peer: &SocketAddr, config: &Config) -> io::Result<()> {
    let socket2 = Socket2::from(socket.try_clone()?);

    if let Some(size) = config.socket_recv_buffer_size {
        socket2.set_recv_buffer_size(size)?;
    }
    if let Some(size) = config.socket_send_buffer_size {
        socket2.set_send_buffer_size(size)?;
    }
    if let IpAddr::V4(ip) = peer.ip() {
        if ip.is_broadcast() {
            socket.set_broadcast(true)?;
        }
    }

    socket.set_nonblocking(!config.blocking_mode)?;
    if config.blocking_mode {
        socket.set_read_timeout(config.socket_polling_timeout)?;
    }
    Ok(())
}

/// Port that tunnels frames through UDP.
///
/// The UDP payload is the EtherCAT part of the frame (frame header and
/// datagrams); the Ethernet header is stripped on send and synthesised on
/// receive.
#[derive(Debug)]
pub struct UdpPort {
    socket: UdpSocket,
    peer: SocketAddr,
    tx: Vec<u8>,
    mtu: usize,
    is_blocking_mode: bool,
}

impl UdpPort {
    /// Binds to `local` and sends every frame to `peer`.
    pub fn bind<A: ToSocketAddrs>(local: A, peer: SocketAddr, config: &Config) -> io::Result<Self> {
        Self::from_socket(UdpSocket::bind(local)?, peer, config)
    }

    /// Wraps an already bound socket.
    pub fn from_socket(socket: UdpSocket, peer: SocketAddr, config: &Config) -> io::Result<Self> {
        apply_socket_options(&socket, &peer, config)?;
        debug!("opened UDP port {} towards {}", socket.local_addr()?, peer);
        Ok(Self {
            socket,
            peer,
            tx: vec![0; ETH_FRAME_LEN],
            mtu: config.mtu,
            is_blocking_mode: config.blocking_mode,
        })
    }

    /// Local address the port is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Address frames are sent to.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }
}

impl HardwarePort for UdpPort {
    fn tx_buffer(&mut self) -> io::Result<&mut [u8]> {
        Ok(&mut self.tx)
    }

    fn send(&mut self, len: usize) -> io::Result<()> {
        let payload = self.tx.get(ETH_HEADER_SIZE..len).ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "frame shorter than its Ethernet header")
        })?;
        self.socket.send_to(payload, self.peer)?;
        Ok(())
    }

    fn receive_frame<'a>(&mut self, buffer: &'a mut [u8]) -> io::Result<&'a [u8]> {
        if buffer.len() <= ETH_HEADER_SIZE {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "receive buffer too small"));
        }
        let received = match self.socket.recv_from(&mut buffer[ETH_HEADER_SIZE..]) {
            Ok((len, _)) => len,
            // blocking reads report an expired read timeout as TimedOut on some platforms
            Err(err) if err.kind() == io::ErrorKind::TimedOut => {
                return Err(io::ErrorKind::WouldBlock.into())
            }
            Err(err) => return Err(err),
        };
        EthernetHeader::new(BROADCAST_MAC, MacAddress::default())
            .encode(buffer)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err.to_string()))?;
        Ok(&buffer[..ETH_HEADER_SIZE + received])
    }

    fn is_blocking_mode(&self) -> bool {
        self.is_blocking_mode
    }

    fn mtu(&self) -> usize {
        self.mtu
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use ecbus_core::constants::FRAME_HEADER_SIZE;
    use ecbus_protocol::{Command, Frame, FrameWriter};

    use super::*;

    fn bound_pair() -> (UdpPort, UdpPort) {
        let a = UdpSocket::bind("127.0.0.1:0").unwrap();
        let b = UdpSocket::bind("127.0.0.1:0").unwrap();
        let (a_addr, b_addr) = (a.local_addr().unwrap(), b.local_addr().unwrap());
        let config = Config {
            blocking_mode: true,
            socket_polling_timeout: Some(Duration::from_secs(1)),
            ..Config::default()
        };
        (
            UdpPort::from_socket(a, b_addr, &config).unwrap(),
            UdpPort::from_socket(b, a_addr, &config).unwrap(),
        )
    }

    #[test]
    fn test_frame_crosses_udp() {
        let (mut a, mut b) = bound_pair();
        let mtu = a.mtu();
        let buffer = a.tx_buffer().unwrap();
        let mut writer = FrameWriter::new(buffer, mtu, BROADCAST_MAC, MacAddress::default()).unwrap();
        writer.add_datagram_phys(Command::Fprd, 5, 0x1001, 0x0130, &[0, 0]).unwrap();
        let len = writer.finish();
        a.send(len).unwrap();

        let mut receive = vec![0u8; ETH_FRAME_LEN];
        let frame = b.receive_frame(&mut receive).unwrap();
        assert_eq!(frame.len(), len);
        let parsed = Frame::parse(frame).unwrap();
        let datagram = parsed.datagrams().next().unwrap().unwrap();
        assert_eq!(datagram.index(), 5);
        assert_eq!(datagram.command(), Command::Fprd);
    }

    #[test]
    fn test_short_frame_rejected() {
        let (mut a, _b) = bound_pair();
        let err = a.send(FRAME_HEADER_SIZE).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }
}
