//! Mailbox header codec.
//!
//! ```text
//! | length u16 | address u16 | channel:6 priority:2 | type:4 counter:3 reserved:1 | payload .. |
//! ```

use std::convert::TryFrom;

use byteorder::{ByteOrder, LittleEndian};
use ecbus_core::{
    constants::MAILBOX_HEADER_SIZE,
    error::{DecodingErrorKind, ErrorKind, Result},
    protocols::MailboxType,
};

const CHANNEL_MASK: u8 = 0x3F;
const PRIORITY_SHIFT: u8 = 6;
const TYPE_MASK: u8 = 0x0F;
const COUNTER_SHIFT: u8 = 4;
const COUNTER_MASK: u8 = 0x07;

/// Decoded mailbox header.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct MailboxHeader {
    /// Payload length in bytes, not counting the header.
    pub length: u16,
    /// Station address of the originator (or destination for requests).
    pub address: u16,
    /// Channel, reserved for future use by the protocol.
    pub channel: u8,
    /// Priority, 0 (lowest) to 3.
    pub priority: u8,
    /// Sub-protocol tag.
    pub mailbox_type: MailboxType,
    /// Sequence counter, 0 for unsequenced messages.
    pub counter: u8,
}

impl MailboxHeader {
    /// Creates a header for an unsequenced message of `length` payload bytes.
    pub fn new(mailbox_type: MailboxType, address: u16, length: u16) -> Self {
        Self { length, address, channel: 0, priority: 0, mailbox_type, counter: 0 }
    }

    /// Writes the header into the first six bytes of `buffer`.
    pub fn encode(&self, buffer: &mut [u8]) -> Result<()> {
        if buffer.len() < MAILBOX_HEADER_SIZE {
            return Err(ErrorKind::CapacityExceeded {
                required: MAILBOX_HEADER_SIZE,
                available: buffer.len(),
            });
        }
        LittleEndian::write_u16(&mut buffer[0..2], self.length);
        LittleEndian::write_u16(&mut buffer[2..4], self.address);
        buffer[4] = (self.channel & CHANNEL_MASK) | ((self.priority & 0x03) << PRIORITY_SHIFT);
        buffer[5] = (self.mailbox_type.to_u8() & TYPE_MASK)
            | ((self.counter & COUNTER_MASK) << COUNTER_SHIFT);
        Ok(())
    }

    /// Reads a header from the start of `buffer`.
    pub fn decode(buffer: &[u8]) -> Result<Self> {
        if buffer.len() < MAILBOX_HEADER_SIZE {
            return Err(DecodingErrorKind::MailboxTruncated.into());
        }
        Ok(Self {
            length: LittleEndian::read_u16(&buffer[0..2]),
            address: LittleEndian::read_u16(&buffer[2..4]),
            channel: buffer[4] & CHANNEL_MASK,
            priority: buffer[4] >> PRIORITY_SHIFT,
            mailbox_type: MailboxType::try_from(buffer[5] & TYPE_MASK)?,
            counter: (buffer[5] >> COUNTER_SHIFT) & COUNTER_MASK,
        })
    }

    /// Rewrites only the counter bits of an encoded header.
    pub fn stamp_counter(buffer: &mut [u8], counter: u8) {
        if buffer.len() >= MAILBOX_HEADER_SIZE {
            buffer[5] = (buffer[5] & !(COUNTER_MASK << COUNTER_SHIFT))
                | ((counter & COUNTER_MASK) << COUNTER_SHIFT);
        }
    }
}

/// Encodes a header followed by `payload` and returns the message length.
pub fn write_message(buffer: &mut [u8], header: &MailboxHeader, payload: &[u8]) -> Result<usize> {
    let total = MAILBOX_HEADER_SIZE + payload.len();
    if buffer.len() < total || payload.len() > u16::MAX as usize {
        return Err(ErrorKind::CapacityExceeded { required: total, available: buffer.len() });
    }
    let header = MailboxHeader { length: payload.len() as u16, ..*header };
    header.encode(buffer)?;
    buffer[MAILBOX_HEADER_SIZE..total].copy_from_slice(payload);
    Ok(total)
}

/// Splits a raw mailbox message into its header and payload.
pub fn read_message(buffer: &[u8]) -> Result<(MailboxHeader, &[u8])> {
    let header = MailboxHeader::decode(buffer)?;
    let end = MAILBOX_HEADER_SIZE + header.length as usize;
    let payload = buffer.get(MAILBOX_HEADER_SIZE..end).ok_or(DecodingErrorKind::MailboxTruncated)?;
    Ok((header, payload))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_bit_layout() {
        let header = MailboxHeader {
            length: 0x000A,
            address: 0x1001,
            channel: 0x15,
            priority: 2,
            mailbox_type: MailboxType::Coe,
            counter: 5,
        };
        let mut buffer = [0u8; MAILBOX_HEADER_SIZE];
        header.encode(&mut buffer).unwrap();

        assert_eq!(buffer, [0x0A, 0x00, 0x01, 0x10, 0x95, 0x53]);
        assert_eq!(MailboxHeader::decode(&buffer).unwrap(), header);
    }

    #[test]
    fn test_stamp_counter_preserves_type() {
        let mut buffer = [0u8; MAILBOX_HEADER_SIZE];
        MailboxHeader::new(MailboxType::Voe, 0, 0).encode(&mut buffer).unwrap();
        MailboxHeader::stamp_counter(&mut buffer, 7);
        let header = MailboxHeader::decode(&buffer).unwrap();
        assert_eq!(header.mailbox_type, MailboxType::Voe);
        assert_eq!(header.counter, 7);
        assert_eq!(buffer[5] & 0x80, 0);
    }

    #[test]
    fn test_message_round_trip() {
        let mut buffer = [0u8; 32];
        let header = MailboxHeader::new(MailboxType::Foe, 0x1002, 0);
        let len = write_message(&mut buffer, &header, b"firmware").unwrap();
        assert_eq!(len, MAILBOX_HEADER_SIZE + 8);

        let (decoded, payload) = read_message(&buffer).unwrap();
        assert_eq!(decoded.length, 8);
        assert_eq!(payload, b"firmware");
    }

    #[test]
    fn test_unknown_type_and_truncation() {
        let mut buffer = [0x02, 0x00, 0x00, 0x00, 0x00, 0x06, 0xFF];
        assert!(matches!(
            MailboxHeader::decode(&buffer),
            Err(ErrorKind::DecodingError(DecodingErrorKind::MailboxType))
        ));
        buffer[5] = 0x03;
        assert!(matches!(
            read_message(&buffer),
            Err(ErrorKind::DecodingError(DecodingErrorKind::MailboxTruncated))
        ));
    }
}
