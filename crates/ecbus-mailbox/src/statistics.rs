//! Per-mailbox traffic statistics.

/// Counters kept by one slave mailbox.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MailboxStatistics {
    /// Messages written to and acknowledged by the slave
    pub messages_sent: u64,
    /// Messages read from the slave
    pub messages_received: u64,
    /// Write attempts the slave did not acknowledge
    pub write_retries: u64,
    /// Buffers put back at the head of their queue after exhausting retries
    pub requeued: u64,
    /// Replies dropped because their sequence counter did not match
    pub stale_dropped: u64,
    /// Messages dropped because their protocol is unsupported or undecodable
    pub invalid_dropped: u64,
    /// Requests that ran past their deadline
    pub timeouts: u64,
}

impl MailboxStatistics {
    /// Returns the share of write attempts that were not acknowledged (0.0 to 1.0).
    pub fn write_failure_rate(&self) -> f32 {
        let attempts = self.messages_sent + self.write_retries;
        if attempts == 0 {
            return 0.0;
        }
        self.write_retries as f32 / attempts as f32
    }

    /// Resets all counters.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_failure_rate() {
        let mut stats = MailboxStatistics::default();
        assert_eq!(stats.write_failure_rate(), 0.0);

        stats.messages_sent = 3;
        stats.write_retries = 1;
        assert!((stats.write_failure_rate() - 0.25).abs() < 0.001);
    }

    #[test]
    fn test_reset() {
        let mut stats = MailboxStatistics { timeouts: 4, stale_dropped: 2, ..Default::default() };
        stats.reset();
        assert_eq!(stats, MailboxStatistics::default());
    }
}
