/// Counter value of an unsequenced message.
pub const UNSEQUENCED: u8 = 0;

/// Largest mailbox counter value (three bits on the wire).
pub const MAX_COUNTER: u8 = 7;

/// Rolling three-bit counter stamped on outgoing mailbox messages.
///
/// Yields 1, 2, .., 7, 1, .. and never 0, which is reserved for messages
/// that do not take part in sequencing.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MailboxCounter {
    last: u8,
}

impl MailboxCounter {
    /// Creates a counter that has not stamped anything yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Advances and returns the next counter value.
    pub fn next(&mut self) -> u8 {
        self.last = if self.last >= MAX_COUNTER { 1 } else { self.last + 1 };
        self.last
    }

    /// The most recently stamped value, `UNSEQUENCED` before the first call
    /// to [`next`](MailboxCounter::next).
    pub fn last(&self) -> u8 {
        self.last
    }

    /// Returns true if `counter` is the most recently stamped value.
    pub fn matches_last(&self, counter: u8) -> bool {
        counter != UNSEQUENCED && counter == self.last
    }
}
