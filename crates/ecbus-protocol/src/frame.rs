//! Ethernet and EtherCAT frame headers, frame building and parsing.

use byteorder::{BigEndian, ByteOrder, LittleEndian};
use ecbus_core::{
    constants::{DATAGRAM_HEADER_SIZE, ETHERTYPE_ECAT, ETH_HEADER_SIZE, FRAME_HEADER_SIZE, WKC_SIZE},
    error::{DecodingErrorKind, ErrorKind, Result},
    mac::MacAddress,
};

use crate::{
    command::{Address, Command},
    datagram::{encode_datagram, set_more_flag, DatagramHeader, Datagrams},
};

/// Frame type announcing a chain of datagrams.
pub const FRAME_TYPE_COMMANDS: u8 = 0x01;

const FRAME_LENGTH_MASK: u16 = 0x07FF;
const FRAME_TYPE_SHIFT: u16 = 12;

/// Ethernet II header.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct EthernetHeader {
    /// Destination hardware address.
    pub destination: MacAddress,
    /// Source hardware address.
    pub source: MacAddress,
    /// Protocol ethertype, big endian on the wire.
    pub ethertype: u16,
}

impl EthernetHeader {
    /// Creates a header carrying the fieldbus ethertype.
    pub fn new(destination: MacAddress, source: MacAddress) -> Self {
        Self { destination, source, ethertype: ETHERTYPE_ECAT }
    }

    /// Writes the header into the first 14 bytes of `buffer`.
    pub fn encode(&self, buffer: &mut [u8]) -> Result<()> {
        if buffer.len() < ETH_HEADER_SIZE {
            return Err(ErrorKind::CapacityExceeded {
                required: ETH_HEADER_SIZE,
                available: buffer.len(),
            });
        }
        buffer[0..6].copy_from_slice(&self.destination.octets());
        buffer[6..12].copy_from_slice(&self.source.octets());
        BigEndian::write_u16(&mut buffer[12..14], self.ethertype);
        Ok(())
    }

    /// Reads a header from the start of `buffer`.
    pub fn decode(buffer: &[u8]) -> Result<Self> {
        if buffer.len() < ETH_HEADER_SIZE {
            return Err(DecodingErrorKind::FrameTooShort.into());
        }
        let mut destination = [0u8; 6];
        let mut source = [0u8; 6];
        destination.copy_from_slice(&buffer[0..6]);
        source.copy_from_slice(&buffer[6..12]);
        Ok(Self {
            destination: destination.into(),
            source: source.into(),
            ethertype: BigEndian::read_u16(&buffer[12..14]),
        })
    }
}

/// Two byte EtherCAT header: datagram bytes in bits 0..10, type in 12..15.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FrameHeader {
    /// Length of all datagrams in bytes.
    pub length: u16,
    /// Frame type, [`FRAME_TYPE_COMMANDS`] for datagram chains.
    pub frame_type: u8,
}

impl FrameHeader {
    /// Packs the header into its wire word.
    pub fn to_raw(self) -> u16 {
        (self.length & FRAME_LENGTH_MASK) | (u16::from(self.frame_type & 0x0F) << FRAME_TYPE_SHIFT)
    }

    /// Unpacks a wire word.
    pub fn from_raw(raw: u16) -> Self {
        Self { length: raw & FRAME_LENGTH_MASK, frame_type: (raw >> FRAME_TYPE_SHIFT) as u8 }
    }
}

/// Builds a frame in place inside a caller-provided buffer.
///
/// Every appended datagram clears its own "more" bit and sets the one of the
/// datagram before it, so the frame is well formed after each call.
#[derive(Debug)]
pub struct FrameWriter<'a> {
    buffer: &'a mut [u8],
    mtu: usize,
    len: usize,
    last: Option<usize>,
    count: usize,
}

impl<'a> FrameWriter<'a> {
    /// Writes the Ethernet and frame headers into `buffer`. `mtu` bounds the
    /// Ethernet payload, i.e. the frame header plus all datagrams.
    pub fn new(
        buffer: &'a mut [u8],
        mtu: usize,
        destination: MacAddress,
        source: MacAddress,
    ) -> Result<Self> {
        let header_len = ETH_HEADER_SIZE + FRAME_HEADER_SIZE;
        if buffer.len() < header_len || mtu < FRAME_HEADER_SIZE {
            return Err(ErrorKind::CapacityExceeded {
                required: header_len,
                available: buffer.len().min(mtu + ETH_HEADER_SIZE),
            });
        }
        EthernetHeader::new(destination, source).encode(buffer)?;
        let mut writer = Self { buffer, mtu, len: header_len, last: None, count: 0 };
        writer.write_frame_header();
        Ok(writer)
    }

    /// Appends a datagram and returns the offset of its payload in the frame.
    pub fn add_datagram(
        &mut self,
        command: Command,
        index: u8,
        address: Address,
        payload: &[u8],
    ) -> Result<usize> {
        let required = DATAGRAM_HEADER_SIZE + payload.len() + WKC_SIZE;
        self.reserve(required)?;
        let offset = self.len;
        encode_datagram(&mut self.buffer[offset..], command, index, address, payload)?;
        self.link(offset, required);
        Ok(offset + DATAGRAM_HEADER_SIZE)
    }

    /// Appends a physically addressed datagram.
    pub fn add_datagram_phys(
        &mut self,
        command: Command,
        index: u8,
        adp: u16,
        ado: u16,
        payload: &[u8],
    ) -> Result<usize> {
        self.add_datagram(command, index, Address::Physical { adp, ado }, payload)
    }

    /// Appends a logically addressed datagram.
    pub fn add_datagram_log(
        &mut self,
        command: Command,
        index: u8,
        address: u32,
        payload: &[u8],
    ) -> Result<usize> {
        self.add_datagram(command, index, Address::Logical(address), payload)
    }

    /// Appends an already encoded datagram (header, payload and work counter).
    pub fn append_encoded(&mut self, datagram: &[u8]) -> Result<()> {
        let header = DatagramHeader::decode(datagram)?;
        let required = header.encoded_len();
        if datagram.len() < required {
            return Err(DecodingErrorKind::DatagramTruncated.into());
        }
        self.reserve(required)?;
        let offset = self.len;
        self.buffer[offset..offset + required].copy_from_slice(&datagram[..required]);
        self.link(offset, required);
        Ok(())
    }

    /// Overwrites the work counter of the most recently added datagram.
    pub fn set_last_wkc(&mut self, wkc: u16) {
        if self.last.is_some() {
            let end = self.len;
            LittleEndian::write_u16(&mut self.buffer[end - WKC_SIZE..end], wkc);
        }
    }

    /// Bytes still available for datagrams.
    pub fn remaining(&self) -> usize {
        let used = self.len - ETH_HEADER_SIZE;
        self.mtu.saturating_sub(used).min(self.buffer.len() - self.len)
    }

    /// Returns true if a datagram of `payload_len` bytes would still fit.
    pub fn fits(&self, payload_len: usize) -> bool {
        DATAGRAM_HEADER_SIZE + payload_len + WKC_SIZE <= self.remaining()
    }

    /// Number of datagrams in the frame.
    pub fn datagram_count(&self) -> usize {
        self.count
    }

    /// Returns true if no datagram has been added.
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Current frame length in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// The frame built so far.
    pub fn as_slice(&self) -> &[u8] {
        &self.buffer[..self.len]
    }

    /// Finishes the frame and returns its length.
    pub fn finish(self) -> usize {
        self.len
    }

    fn reserve(&self, required: usize) -> Result<()> {
        let available = self.remaining();
        if required > available {
            return Err(ErrorKind::CapacityExceeded { required, available });
        }
        Ok(())
    }

    fn link(&mut self, offset: usize, size: usize) {
        if let Some(previous) = self.last {
            set_more_flag(&mut self.buffer[previous..], true);
        }
        set_more_flag(&mut self.buffer[offset..], false);
        self.last = Some(offset);
        self.len += size;
        self.count += 1;
        self.write_frame_header();
    }

    fn write_frame_header(&mut self) {
        let length = (self.len - ETH_HEADER_SIZE - FRAME_HEADER_SIZE) as u16;
        let header = FrameHeader { length, frame_type: FRAME_TYPE_COMMANDS };
        LittleEndian::write_u16(
            &mut self.buffer[ETH_HEADER_SIZE..ETH_HEADER_SIZE + FRAME_HEADER_SIZE],
            header.to_raw(),
        );
    }
}

/// A received frame with validated headers.
#[derive(Copy, Clone, Debug)]
pub struct Frame<'a> {
    ethernet: EthernetHeader,
    header: FrameHeader,
    region: &'a [u8],
}

impl<'a> Frame<'a> {
    /// Validates the headers of a raw Ethernet frame. Trailing padding past
    /// the frame header's length is ignored.
    pub fn parse(buffer: &'a [u8]) -> Result<Self> {
        if buffer.len() < ETH_HEADER_SIZE + FRAME_HEADER_SIZE {
            return Err(DecodingErrorKind::FrameTooShort.into());
        }
        let ethernet = EthernetHeader::decode(buffer)?;
        if ethernet.ethertype != ETHERTYPE_ECAT {
            return Err(DecodingErrorKind::EtherType.into());
        }
        let header = FrameHeader::from_raw(LittleEndian::read_u16(
            &buffer[ETH_HEADER_SIZE..ETH_HEADER_SIZE + FRAME_HEADER_SIZE],
        ));
        if header.frame_type != FRAME_TYPE_COMMANDS {
            return Err(DecodingErrorKind::FrameType.into());
        }
        let start = ETH_HEADER_SIZE + FRAME_HEADER_SIZE;
        let region = buffer
            .get(start..start + header.length as usize)
            .ok_or(DecodingErrorKind::DatagramTruncated)?;
        Ok(Self { ethernet, header, region })
    }

    /// The Ethernet header.
    pub fn ethernet(&self) -> &EthernetHeader {
        &self.ethernet
    }

    /// The EtherCAT frame header.
    pub fn header(&self) -> FrameHeader {
        self.header
    }

    /// Raw datagram bytes.
    pub fn region(&self) -> &'a [u8] {
        self.region
    }

    /// Iterates the datagrams of the frame.
    pub fn datagrams(&self) -> Datagrams<'a> {
        Datagrams::new(self.region)
    }
}
