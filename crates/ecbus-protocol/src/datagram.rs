//! Datagram header codec and iteration over the datagrams of a frame.
//!
//! Wire layout, little endian:
//!
//! ```text
//! | cmd u8 | idx u8 | address u32 | len/flags u16 | irq u16 | payload .. | wkc u16 |
//! ```
//!
//! The length word packs the payload length in bits 0..10, the circulating
//! flag in bit 14 and the "more datagrams follow" flag in bit 15.

use std::convert::TryFrom;

use byteorder::{ByteOrder, LittleEndian};
use ecbus_core::{
    constants::{DATAGRAM_HEADER_SIZE, MAX_DATAGRAM_PAYLOAD, WKC_SIZE},
    error::{DecodingErrorKind, ErrorKind, Result},
};

use crate::command::{Address, Command};

const LENGTH_MASK: u16 = 0x07FF;
const CIRCULATING_FLAG: u16 = 0x4000;
const MORE_FLAG: u16 = 0x8000;

const LEN_FLAGS_OFFSET: usize = 6;

/// Decoded datagram header.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DatagramHeader {
    /// Command code.
    pub command: Command,
    /// Correlation index echoed back by the slaves.
    pub index: u8,
    /// Raw 32-bit address.
    pub address: u32,
    /// Payload length in bytes.
    pub length: u16,
    /// Set by a slave when the frame has circulated once already.
    pub circulating: bool,
    /// Another datagram follows in the same frame.
    pub more: bool,
    /// Interrupt request field.
    pub irq: u16,
}

impl DatagramHeader {
    /// Creates a header for a request carrying `length` payload bytes.
    pub fn new(command: Command, index: u8, address: Address, length: u16) -> Self {
        Self {
            command,
            index,
            address: address.to_raw(),
            length,
            circulating: false,
            more: false,
            irq: 0,
        }
    }

    /// The address interpreted for this header's command.
    pub fn address(&self) -> Address {
        Address::from_raw(self.command, self.address)
    }

    /// Total encoded size of the datagram including payload and work counter.
    pub fn encoded_len(&self) -> usize {
        DATAGRAM_HEADER_SIZE + self.length as usize + WKC_SIZE
    }

    /// Writes the header into the first ten bytes of `buffer`.
    pub fn encode(&self, buffer: &mut [u8]) -> Result<()> {
        if buffer.len() < DATAGRAM_HEADER_SIZE {
            return Err(ErrorKind::CapacityExceeded {
                required: DATAGRAM_HEADER_SIZE,
                available: buffer.len(),
            });
        }
        let mut len_flags = self.length & LENGTH_MASK;
        if self.circulating {
            len_flags |= CIRCULATING_FLAG;
        }
        if self.more {
            len_flags |= MORE_FLAG;
        }
        buffer[0] = self.command.to_u8();
        buffer[1] = self.index;
        LittleEndian::write_u32(&mut buffer[2..6], self.address);
        LittleEndian::write_u16(&mut buffer[LEN_FLAGS_OFFSET..8], len_flags);
        LittleEndian::write_u16(&mut buffer[8..10], self.irq);
        Ok(())
    }

    /// Reads a header from the start of `buffer`.
    pub fn decode(buffer: &[u8]) -> Result<Self> {
        if buffer.len() < DATAGRAM_HEADER_SIZE {
            return Err(DecodingErrorKind::DatagramTruncated.into());
        }
        let len_flags = LittleEndian::read_u16(&buffer[LEN_FLAGS_OFFSET..8]);
        Ok(Self {
            command: Command::try_from(buffer[0])?,
            index: buffer[1],
            address: LittleEndian::read_u32(&buffer[2..6]),
            length: len_flags & LENGTH_MASK,
            circulating: len_flags & CIRCULATING_FLAG != 0,
            more: len_flags & MORE_FLAG != 0,
            irq: LittleEndian::read_u16(&buffer[8..10]),
        })
    }
}

/// Sets or clears the "more follows" bit of an encoded datagram in place.
pub fn set_more_flag(datagram: &mut [u8], more: bool) {
    let word = &mut datagram[LEN_FLAGS_OFFSET..LEN_FLAGS_OFFSET + 2];
    let mut len_flags = LittleEndian::read_u16(word);
    if more {
        len_flags |= MORE_FLAG;
    } else {
        len_flags &= !MORE_FLAG;
    }
    LittleEndian::write_u16(word, len_flags);
}

/// Encodes a complete request datagram (header, payload, zero work counter)
/// into `buffer` and returns the encoded length.
pub fn encode_datagram(
    buffer: &mut [u8],
    command: Command,
    index: u8,
    address: Address,
    payload: &[u8],
) -> Result<usize> {
    if payload.len() > MAX_DATAGRAM_PAYLOAD {
        return Err(ErrorKind::CapacityExceeded {
            required: payload.len(),
            available: MAX_DATAGRAM_PAYLOAD,
        });
    }
    let header = DatagramHeader::new(command, index, address, payload.len() as u16);
    let total = header.encoded_len();
    if buffer.len() < total {
        return Err(ErrorKind::CapacityExceeded { required: total, available: buffer.len() });
    }
    header.encode(buffer)?;
    let payload_end = DATAGRAM_HEADER_SIZE + payload.len();
    buffer[DATAGRAM_HEADER_SIZE..payload_end].copy_from_slice(payload);
    LittleEndian::write_u16(&mut buffer[payload_end..total], 0);
    Ok(total)
}

/// A datagram borrowed from a received frame.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Datagram<'a> {
    header: DatagramHeader,
    payload: &'a [u8],
    wkc: u16,
    offset: usize,
}

impl<'a> Datagram<'a> {
    /// Decodes the datagram starting at `offset` within `region`.
    pub fn parse(region: &'a [u8], offset: usize) -> Result<Self> {
        let rest = region.get(offset..).ok_or(DecodingErrorKind::DatagramTruncated)?;
        let header = DatagramHeader::decode(rest)?;
        if rest.len() < header.encoded_len() {
            return Err(DecodingErrorKind::DatagramTruncated.into());
        }
        let payload_end = DATAGRAM_HEADER_SIZE + header.length as usize;
        Ok(Self {
            header,
            payload: &rest[DATAGRAM_HEADER_SIZE..payload_end],
            wkc: LittleEndian::read_u16(&rest[payload_end..payload_end + WKC_SIZE]),
            offset,
        })
    }

    /// The decoded header.
    pub fn header(&self) -> &DatagramHeader {
        &self.header
    }

    /// Command code.
    pub fn command(&self) -> Command {
        self.header.command
    }

    /// Correlation index.
    pub fn index(&self) -> u8 {
        self.header.index
    }

    /// Address interpreted for the command.
    pub fn address(&self) -> Address {
        self.header.address()
    }

    /// Payload bytes.
    pub fn payload(&self) -> &'a [u8] {
        self.payload
    }

    /// Work counter trailing the payload.
    pub fn wkc(&self) -> u16 {
        self.wkc
    }

    /// Returns true if another datagram follows.
    pub fn has_more(&self) -> bool {
        self.header.more
    }

    /// Offset of this datagram within the datagram region.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Offset just past this datagram's work counter.
    pub fn end(&self) -> usize {
        self.offset + self.header.encoded_len()
    }
}

/// Lazy sequence over the datagrams chained in a frame.
///
/// The position is derived from the previous datagram's length and "more"
/// bit only, so the sequence can be restarted or cloned at any point.
#[derive(Clone, Debug)]
pub struct Datagrams<'a> {
    region: &'a [u8],
    next: Option<usize>,
}

impl<'a> Datagrams<'a> {
    /// Iterates the datagram region of a frame (everything after the
    /// EtherCAT frame header).
    pub fn new(region: &'a [u8]) -> Self {
        let next = if region.is_empty() { None } else { Some(0) };
        Self { region, next }
    }

    /// Decodes the first datagram of the region.
    pub fn first(&self) -> Option<Result<Datagram<'a>>> {
        if self.region.is_empty() {
            return None;
        }
        Some(Datagram::parse(self.region, 0))
    }

    /// Decodes the datagram chained after `current`, if its "more" bit is set.
    pub fn after(&self, current: &Datagram<'a>) -> Option<Result<Datagram<'a>>> {
        if !current.has_more() {
            return None;
        }
        Some(Datagram::parse(self.region, current.end()))
    }

    /// Rewinds to the first datagram.
    pub fn restart(&mut self) {
        self.next = if self.region.is_empty() { None } else { Some(0) };
    }
}

impl<'a> Iterator for Datagrams<'a> {
    type Item = Result<Datagram<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        let offset = self.next.take()?;
        let parsed = Datagram::parse(self.region, offset);
        if let Ok(datagram) = &parsed {
            if datagram.has_more() {
                self.next = Some(datagram.end());
            }
        }
        Some(parsed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain(datagrams: &[(Command, u8, Address, &[u8])]) -> Vec<u8> {
        let mut region = vec![0u8; 512];
        let mut len = 0;
        let mut previous: Option<usize> = None;
        for (command, index, address, payload) in datagrams {
            let written =
                encode_datagram(&mut region[len..], *command, *index, *address, payload).unwrap();
            if let Some(prev) = previous {
                set_more_flag(&mut region[prev..], true);
            }
            previous = Some(len);
            len += written;
        }
        region.truncate(len);
        region
    }

    #[test]
    fn test_header_encode_decode() {
        let mut header =
            DatagramHeader::new(Command::Fprd, 0x42, Address::Physical { adp: 0x1001, ado: 0x0805 }, 2);
        header.more = true;
        header.irq = 0xBEEF;
        let mut buffer = [0u8; DATAGRAM_HEADER_SIZE];
        header.encode(&mut buffer).unwrap();

        assert_eq!(buffer[0], 0x04);
        assert_eq!(buffer[1], 0x42);
        assert_eq!(&buffer[2..6], &[0x01, 0x10, 0x05, 0x08]);
        assert_eq!(&buffer[6..8], &[0x02, 0x80]);
        assert_eq!(DatagramHeader::decode(&buffer).unwrap(), header);
    }

    #[test]
    fn test_encoded_datagram_decodes_to_same_fields() {
        let payload = [1u8, 2, 3, 4, 5];
        let address = Address::Logical(0x0001_2000);
        let region = chain(&[(Command::Lrw, 7, address, &payload)]);

        let datagram = Datagrams::new(&region).first().unwrap().unwrap();
        assert_eq!(datagram.command(), Command::Lrw);
        assert_eq!(datagram.index(), 7);
        assert_eq!(datagram.address(), address);
        assert_eq!(datagram.header().length as usize, payload.len());
        assert_eq!(datagram.payload(), &payload);
        assert_eq!(datagram.wkc(), 0);
        assert!(!datagram.has_more());
    }

    #[test]
    fn test_iterate_chained_datagrams() {
        let region = chain(&[
            (Command::Brd, 1, Address::Physical { adp: 0, ado: 0x0130 }, &[0, 0]),
            (Command::Fpwr, 2, Address::Physical { adp: 0x1001, ado: 0x1000 }, &[9; 16]),
            (Command::Nop, 3, Address::Logical(0), &[]),
        ]);

        let mut datagrams = Datagrams::new(&region);
        let indices: Vec<u8> = datagrams.by_ref().map(|d| d.unwrap().index()).collect();
        assert_eq!(indices, vec![1, 2, 3]);
        assert!(datagrams.next().is_none());

        datagrams.restart();
        assert_eq!(datagrams.count(), 3);
    }

    #[test]
    fn test_first_and_after() {
        let region = chain(&[
            (Command::Fprd, 10, Address::Physical { adp: 1, ado: 2 }, &[0; 4]),
            (Command::Fprd, 11, Address::Physical { adp: 1, ado: 6 }, &[0; 4]),
        ]);
        let datagrams = Datagrams::new(&region);
        let first = datagrams.first().unwrap().unwrap();
        let second = datagrams.after(&first).unwrap().unwrap();
        assert_eq!(second.index(), 11);
        assert!(datagrams.after(&second).is_none());
    }

    #[test]
    fn test_truncated_datagram_is_reported() {
        let mut region = chain(&[(Command::Fprd, 1, Address::Logical(0), &[0; 8])]);
        region.truncate(region.len() - 1);
        let mut datagrams = Datagrams::new(&region);
        assert!(matches!(
            datagrams.next(),
            Some(Err(ErrorKind::DecodingError(DecodingErrorKind::DatagramTruncated)))
        ));
        assert!(datagrams.next().is_none());
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let mut buffer = vec![0u8; 4096];
        let payload = vec![0u8; MAX_DATAGRAM_PAYLOAD + 1];
        assert!(matches!(
            encode_datagram(&mut buffer, Command::Lwr, 0, Address::Logical(0), &payload),
            Err(ErrorKind::CapacityExceeded { .. })
        ));
    }

    #[test]
    fn test_set_more_flag_keeps_length() {
        let mut buffer = [0u8; 32];
        encode_datagram(&mut buffer, Command::Bwr, 0, Address::Logical(0), &[0; 3]).unwrap();
        set_more_flag(&mut buffer, true);
        let header = DatagramHeader::decode(&buffer).unwrap();
        assert!(header.more);
        assert_eq!(header.length, 3);
        set_more_flag(&mut buffer, false);
        assert!(!DatagramHeader::decode(&buffer).unwrap().more);
    }
}
