//! Frame and datagram counters of the cyclic loop.

/// Traffic statistics of one master.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MasterStatistics {
    /// Frames handed to the hardware port
    pub frames_sent: u64,
    /// EtherCAT frames received
    pub frames_received: u64,
    /// Received frames that were not EtherCAT frames
    pub foreign_frames: u64,
    /// Datagrams packed into sent frames
    pub datagrams_sent: u64,
    /// Datagrams matched to an outstanding transaction
    pub datagrams_matched: u64,
    /// Received datagrams with no matching outstanding transaction
    pub stale_datagrams: u64,
    /// Datagrams completed by the timeout sweep
    pub datagram_timeouts: u64,
    /// Failed hardware sends
    pub send_errors: u64,
}

impl MasterStatistics {
    /// Returns the share of sent datagrams that timed out (0.0 to 1.0).
    pub fn timeout_rate(&self) -> f32 {
        if self.datagrams_sent == 0 {
            return 0.0;
        }
        self.datagram_timeouts as f32 / self.datagrams_sent as f32
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
    fn test_timeout_rate() {
        let mut stats = MasterStatistics::default();
        assert_eq!(stats.timeout_rate(), 0.0);

        stats.datagrams_sent = 200;
        stats.datagram_timeouts = 5;
        assert!((stats.timeout_rate() - 0.025).abs() < 0.001);
    }

    #[test]
    fn test_reset() {
        let mut stats = MasterStatistics { frames_sent: 9, stale_datagrams: 1, ..Default::default() };
        stats.reset();
        assert_eq!(stats, MasterStatistics::default());
    }
}
