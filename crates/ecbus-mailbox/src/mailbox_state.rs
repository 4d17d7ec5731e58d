/// Logical request/response state of a slave mailbox.
///
/// Moves `Idle -> SendPending -> AwaitEcho -> AwaitResponse -> Complete | Timeout`
/// and back to `Idle` when the handler picks the next request. Write-only
/// requests skip `AwaitResponse`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HandshakeState {
    /// Nothing in flight.
    #[default]
    Idle,

    /// A buffer has been taken from its queue and is about to be written.
    SendPending,

    /// The buffer is being written; waiting for the slave to acknowledge it.
    AwaitEcho,

    /// The request was accepted; waiting for the sequence-matched reply.
    AwaitResponse,

    /// The last handshake finished with a reply or acknowledgement.
    Complete,

    /// The last handshake ran past its deadline.
    Timeout,
}

impl HandshakeState {
    /// Returns true while a handshake occupies the channel.
    pub fn is_in_flight(&self) -> bool {
        matches!(
            self,
            HandshakeState::SendPending | HandshakeState::AwaitEcho | HandshakeState::AwaitResponse
        )
    }

    /// Returns true if the handler may start the next handshake.
    pub fn is_ready(&self) -> bool {
        !self.is_in_flight()
    }
}

/// Hardware state of a sync manager mailbox slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SmState {
    /// The slot holds no unread data.
    #[default]
    Empty,

    /// The slot holds data its reader has not consumed yet.
    Full,
}

impl SmState {
    /// Mailbox-full bit of the sync manager status register.
    pub const FULL_BIT: u8 = 0x08;

    /// Decodes a sync manager status register.
    pub fn from_status(status: u8) -> Self {
        if status & Self::FULL_BIT != 0 {
            SmState::Full
        } else {
            SmState::Empty
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_flight_states() {
        assert!(!HandshakeState::Idle.is_in_flight());
        assert!(HandshakeState::SendPending.is_in_flight());
        assert!(HandshakeState::AwaitEcho.is_in_flight());
        assert!(HandshakeState::AwaitResponse.is_in_flight());
        assert!(HandshakeState::Complete.is_ready());
        assert!(HandshakeState::Timeout.is_ready());
    }

    #[test]
    fn test_sm_state_from_status() {
        assert_eq!(SmState::from_status(0x08), SmState::Full);
        assert_eq!(SmState::from_status(0x2D), SmState::Full);
        assert_eq!(SmState::from_status(0x20), SmState::Empty);
    }
}
