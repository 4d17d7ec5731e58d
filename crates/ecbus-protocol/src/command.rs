use std::{convert::TryFrom, fmt};

use ecbus_core::error::{DecodingErrorKind, ErrorKind};

/// Datagram command code.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Command {
    /// No operation; slaves ignore the datagram.
    Nop = 0x00,
    /// Auto-increment physical read.
    Aprd = 0x01,
    /// Auto-increment physical write.
    Apwr = 0x02,
    /// Auto-increment physical read/write.
    Aprw = 0x03,
    /// Configured address physical read.
    Fprd = 0x04,
    /// Configured address physical write.
    Fpwr = 0x05,
    /// Configured address physical read/write.
    Fprw = 0x06,
    /// Broadcast read.
    Brd = 0x07,
    /// Broadcast write.
    Bwr = 0x08,
    /// Broadcast read/write.
    Brw = 0x09,
    /// Logical memory read.
    Lrd = 0x0A,
    /// Logical memory write.
    Lwr = 0x0B,
    /// Logical memory read/write.
    Lrw = 0x0C,
    /// Auto-increment physical read, multiple write.
    Armw = 0x0D,
    /// Configured address physical read, multiple write.
    Frmw = 0x0E,
}

impl Command {
    /// Returns the wire value.
    pub fn to_u8(self) -> u8 {
        self as u8
    }

    /// Returns true for commands that address the logical process image.
    pub fn is_logical(self) -> bool {
        matches!(self, Command::Lrd | Command::Lwr | Command::Lrw)
    }
}

impl TryFrom<u8> for Command {
    type Error = ErrorKind;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0x00 => Command::Nop,
            0x01 => Command::Aprd,
            0x02 => Command::Apwr,
            0x03 => Command::Aprw,
            0x04 => Command::Fprd,
            0x05 => Command::Fpwr,
            0x06 => Command::Fprw,
            0x07 => Command::Brd,
            0x08 => Command::Bwr,
            0x09 => Command::Brw,
            0x0A => Command::Lrd,
            0x0B => Command::Lwr,
            0x0C => Command::Lrw,
            0x0D => Command::Armw,
            0x0E => Command::Frmw,
            _ => return Err(DecodingErrorKind::Command.into()),
        })
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Datagram address.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Address {
    /// Slave position or configured address plus a register offset.
    Physical {
        /// Position (auto-increment) or station address (configured).
        adp: u16,
        /// Offset in slave memory.
        ado: u16,
    },
    /// 32-bit address in the logical process image.
    Logical(u32),
}

impl Address {
    /// Returns the 32-bit wire value. For physical addresses `adp` occupies
    /// the low half and `ado` the high half.
    pub fn to_raw(self) -> u32 {
        match self {
            Address::Physical { adp, ado } => u32::from(adp) | (u32::from(ado) << 16),
            Address::Logical(address) => address,
        }
    }

    /// Interprets a wire value according to the command it belongs to.
    pub fn from_raw(command: Command, raw: u32) -> Self {
        if command.is_logical() {
            Address::Logical(raw)
        } else {
            Address::Physical { adp: raw as u16, ado: (raw >> 16) as u16 }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_codes() {
        for code in 0x00..=0x0E {
            let command = Command::try_from(code).unwrap();
            assert_eq!(command.to_u8(), code);
        }
        assert!(matches!(
            Command::try_from(0x0F),
            Err(ErrorKind::DecodingError(DecodingErrorKind::Command))
        ));
    }

    #[test]
    fn test_physical_address_packing() {
        let address = Address::Physical { adp: 0x1001, ado: 0x0130 };
        assert_eq!(address.to_raw(), 0x0130_1001);
        assert_eq!(Address::from_raw(Command::Fprd, 0x0130_1001), address);
    }

    #[test]
    fn test_logical_address() {
        let address = Address::from_raw(Command::Lrw, 0x0001_0000);
        assert_eq!(address, Address::Logical(0x0001_0000));
        assert!(Command::Lrw.is_logical());
        assert!(!Command::Fpwr.is_logical());
    }
}
