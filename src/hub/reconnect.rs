use std::time::Duration;

/// Delays between reconnection attempts. Attempt `n` waits `delays[n]`;
/// once the list is exhausted the connection gives up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    delays: Vec<Duration>,
}

impl ReconnectPolicy {
    pub fn new(delays: Vec<Duration>) -> Self {
        ReconnectPolicy { delays }
    }

    pub fn from_millis(delays_ms: &[u64]) -> Self {
        ReconnectPolicy::new(delays_ms.iter().copied().map(Duration::from_millis).collect())
    }

    /// No automatic retries at all
    pub fn never() -> Self {
        ReconnectPolicy::new(Vec::new())
    }

    pub fn next_delay(&self, attempt: usize) -> Option<Duration> {
        self.delays.get(attempt).copied()
    }

    pub fn max_attempts(&self) -> usize {
        self.delays.len()
    }
}

impl Default for ReconnectPolicy {
    /// 0s, 2s, 10s, 30s
    fn default() -> Self {
        ReconnectPolicy::from_millis(&[0, 2_000, 10_000, 30_000])
    }
}
