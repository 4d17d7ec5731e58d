//! Mailbox protocol identifiers.
//!
//! These live in the core crate because both the configuration (priority
//! order, per-slave support masks) and the wire codecs need them.

use std::{convert::TryFrom, fmt};

use crate::error::{DecodingErrorKind, ErrorKind};

/// Mailbox type tag carried in the low nibble of the mailbox header.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MailboxType {
    /// Error reply from the slave's mailbox state machine.
    Error = 0x00,
    /// ADS over EtherCAT.
    Aoe = 0x01,
    /// Ethernet over EtherCAT.
    Eoe = 0x02,
    /// CANopen over EtherCAT.
    Coe = 0x03,
    /// File access over EtherCAT.
    Foe = 0x04,
    /// Servo profile over EtherCAT.
    Soe = 0x05,
    /// Vendor specific.
    Voe = 0x0F,
}

impl MailboxType {
    /// Every mailbox type, in wire-value order.
    pub const ALL: [MailboxType; 7] = [
        MailboxType::Error,
        MailboxType::Aoe,
        MailboxType::Eoe,
        MailboxType::Coe,
        MailboxType::Foe,
        MailboxType::Soe,
        MailboxType::Voe,
    ];

    /// Dense slot number (0..7) used to index per-type tables.
    pub fn slot(self) -> usize {
        match self {
            MailboxType::Error => 0,
            MailboxType::Aoe => 1,
            MailboxType::Eoe => 2,
            MailboxType::Coe => 3,
            MailboxType::Foe => 4,
            MailboxType::Soe => 5,
            MailboxType::Voe => 6,
        }
    }

    /// Returns the wire value of this type.
    pub fn to_u8(self) -> u8 {
        self as u8
    }

    /// Support bit for this protocol, `None` for the error type which
    /// every mailbox implements.
    pub fn support_flag(self) -> Option<MailboxProtocols> {
        match self {
            MailboxType::Error => None,
            MailboxType::Aoe => Some(MailboxProtocols::AOE),
            MailboxType::Eoe => Some(MailboxProtocols::EOE),
            MailboxType::Coe => Some(MailboxProtocols::COE),
            MailboxType::Foe => Some(MailboxProtocols::FOE),
            MailboxType::Soe => Some(MailboxProtocols::SOE),
            MailboxType::Voe => Some(MailboxProtocols::VOE),
        }
    }
}

impl TryFrom<u8> for MailboxType {
    type Error = ErrorKind;

    fn try_from(value: u8) -> Result<Self, ErrorKind> {
        match value {
            0x00 => Ok(MailboxType::Error),
            0x01 => Ok(MailboxType::Aoe),
            0x02 => Ok(MailboxType::Eoe),
            0x03 => Ok(MailboxType::Coe),
            0x04 => Ok(MailboxType::Foe),
            0x05 => Ok(MailboxType::Soe),
            0x0F => Ok(MailboxType::Voe),
            _ => Err(ErrorKind::DecodingError(DecodingErrorKind::MailboxType)),
        }
    }
}

impl fmt::Display for MailboxType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MailboxType::Error => "ERR",
            MailboxType::Aoe => "AoE",
            MailboxType::Eoe => "EoE",
            MailboxType::Coe => "CoE",
            MailboxType::Foe => "FoE",
            MailboxType::Soe => "SoE",
            MailboxType::Voe => "VoE",
        };
        f.write_str(name)
    }
}

/// Drain order used when several tag queues are ready at once:
/// error first, bulk transfers last.
pub const DEFAULT_MAILBOX_PRIORITY: [MailboxType; 7] = [
    MailboxType::Error,
    MailboxType::Coe,
    MailboxType::Soe,
    MailboxType::Foe,
    MailboxType::Aoe,
    MailboxType::Eoe,
    MailboxType::Voe,
];

/// Set of mailbox protocols a slave supports.
///
/// Bit values follow the slave information interface mailbox-protocol word.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default, Hash)]
pub struct MailboxProtocols(u16);

impl MailboxProtocols {
    /// No protocol.
    pub const NONE: Self = Self(0x0000);
    /// ADS over EtherCAT.
    pub const AOE: Self = Self(0x0001);
    /// Ethernet over EtherCAT.
    pub const EOE: Self = Self(0x0002);
    /// CANopen over EtherCAT.
    pub const COE: Self = Self(0x0004);
    /// File access over EtherCAT.
    pub const FOE: Self = Self(0x0008);
    /// Servo profile over EtherCAT.
    pub const SOE: Self = Self(0x0010);
    /// Vendor specific.
    pub const VOE: Self = Self(0x0020);
    /// Every protocol.
    pub const ALL: Self = Self(0x003F);

    /// Builds a set from the raw support word.
    pub const fn from_bits(bits: u16) -> Self {
        Self(bits & Self::ALL.0)
    }

    /// Returns the raw support word.
    pub const fn bits(self) -> u16 {
        self.0
    }

    /// Returns true if every protocol in `other` is supported.
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Returns true if messages of `mailbox_type` may be exchanged.
    pub fn supports(self, mailbox_type: MailboxType) -> bool {
        mailbox_type.support_flag().map_or(true, |flag| self.contains(flag))
    }
}

impl std::ops::BitOr for MailboxProtocols {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mailbox_type_round_trip() {
        for ty in MailboxType::ALL {
            assert_eq!(MailboxType::try_from(ty.to_u8()).unwrap(), ty);
        }
        assert!(MailboxType::try_from(0x06).is_err());
    }

    #[test]
    fn test_slots_are_dense() {
        let mut seen = [false; 7];
        for ty in MailboxType::ALL {
            assert!(!seen[ty.slot()]);
            seen[ty.slot()] = true;
        }
        assert!(seen.iter().all(|s| *s));
    }

    #[test]
    fn test_protocol_support() {
        let supported = MailboxProtocols::COE | MailboxProtocols::FOE;
        assert!(supported.supports(MailboxType::Coe));
        assert!(supported.supports(MailboxType::Foe));
        assert!(!supported.supports(MailboxType::Eoe));
        // the error mailbox is always available
        assert!(MailboxProtocols::NONE.supports(MailboxType::Error));
    }

    #[test]
    fn test_from_bits_masks_unknown() {
        assert_eq!(MailboxProtocols::from_bits(0xFFFF), MailboxProtocols::ALL);
    }
}
