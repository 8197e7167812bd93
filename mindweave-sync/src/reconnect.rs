//! Connection state machine and retry backoff for the client agent.
//!
//! ```text
//!                 Connect                Opened
//!  Disconnected ─────────► Connecting ─────────► Connected
//!       ▲                      │                    │
//!       │ Disconnect           │ TransportFailed    │ TransportFailed
//!       │ (from any state)     ▼                    ▼
//!       │               Reconnecting { attempt } ◄──┘
//!       │                 │   ▲  │ RetryScheduled (attempt + 1)
//!       │                 │   └──┘
//!       │                 │ Opened ──► Connected ──Stalled { attempt }──► Reconnecting { attempt }
//!       │                 │ RetriesExhausted
//!       │                 ▼
//!       └──────────────  Failed ──Connect──► Connecting
//! ```
//!
//! Opening a socket does not refill the retry budget. A connection that is
//! lost before the server sends anything after `Joined` reports `Stalled`
//! and the count carries on from where it was; only a connection that made
//! progress starts again at attempt 0.
//!
//! Transitions are pure; the agent's event loop owns the timers.

use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    Disconnected,
    Connecting,
    Connected,
    /// `attempt` retries have been scheduled since the connection was lost.
    Reconnecting { attempt: u32 },
    /// Retry budget exhausted. Queued edits are kept; leaving this state
    /// takes an explicit `Connect`.
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentEvent {
    Connect,
    Opened,
    TransportFailed,
    /// The connection was lost before it made progress. `attempt` is the
    /// retry count it was opened with.
    Stalled { attempt: u32 },
    RetryScheduled,
    RetriesExhausted,
    Disconnect,
}

impl AgentState {
    /// Next state, or `None` when `event` does not apply here.
    pub fn on(self, event: AgentEvent) -> Option<AgentState> {
        use AgentEvent as E;
        use AgentState as S;

        match (self, event) {
            (S::Disconnected | S::Failed, E::Connect) => Some(S::Connecting),
            (S::Connecting | S::Reconnecting { .. }, E::Opened) => Some(S::Connected),
            (S::Connecting | S::Connected, E::TransportFailed) => Some(S::Reconnecting { attempt: 0 }),
            (S::Connected, E::Stalled { attempt }) => Some(S::Reconnecting { attempt }),
            // A retry failed; the next one is scheduled from here.
            (S::Reconnecting { attempt }, E::TransportFailed) => Some(S::Reconnecting { attempt }),
            (S::Reconnecting { attempt }, E::RetryScheduled) => Some(S::Reconnecting {
                attempt: attempt.saturating_add(1),
            }),
            (S::Reconnecting { .. }, E::RetriesExhausted) => Some(S::Failed),
            (S::Disconnected, E::Disconnect) => None,
            (_, E::Disconnect) => Some(S::Disconnected),
            _ => None,
        }
    }

    pub fn is_connected(self) -> bool {
        self == AgentState::Connected
    }

    pub fn name(self) -> &'static str {
        match self {
            AgentState::Disconnected => "disconnected",
            AgentState::Connecting => "connecting",
            AgentState::Connected => "connected",
            AgentState::Reconnecting { .. } => "reconnecting",
            AgentState::Failed => "failed",
        }
    }
}

/// Exponential backoff: `min(initial * factor^attempt, max)`, at most
/// `max_attempts` retries.
#[derive(Debug, Clone, PartialEq)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
    pub factor: f64,
    pub max_attempts: u32,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(500),
            max: Duration::from_secs(30),
            factor: 2.0,
            max_attempts: 10,
        }
    }
}

impl Backoff {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_initial(mut self, duration: Duration) -> Self {
        self.initial = duration;
        self
    }

    #[must_use]
    pub fn with_max(mut self, duration: Duration) -> Self {
        self.max = duration;
        self
    }

    #[must_use]
    pub fn with_factor(mut self, factor: f64) -> Self {
        self.factor = factor.max(1.0);
        self
    }

    #[must_use]
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Delay before retry number `attempt` (0-based), or `None` once the
    /// budget is spent.
    pub fn delay(&self, attempt: u32) -> Option<Duration> {
        if attempt >= self.max_attempts {
            return None;
        }
        let scaled = self.initial.as_secs_f64() * self.factor.powi(attempt.min(i32::MAX as u32) as i32);
        let capped = scaled.min(self.max.as_secs_f64());
        Some(Duration::from_secs_f64(capped))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path() {
        let s = AgentState::Disconnected;
        let s = s.on(AgentEvent::Connect).unwrap();
        assert_eq!(s, AgentState::Connecting);
        let s = s.on(AgentEvent::Opened).unwrap();
        assert!(s.is_connected());
        assert_eq!(s.on(AgentEvent::Disconnect), Some(AgentState::Disconnected));
    }

    #[test]
    fn test_loss_and_retries() {
        let mut s = AgentState::Connected.on(AgentEvent::TransportFailed).unwrap();
        assert_eq!(s, AgentState::Reconnecting { attempt: 0 });

        for expected in 1..=3 {
            s = s.on(AgentEvent::RetryScheduled).unwrap();
            assert_eq!(s, AgentState::Reconnecting { attempt: expected });
            s = s.on(AgentEvent::TransportFailed).unwrap();
            assert_eq!(s, AgentState::Reconnecting { attempt: expected });
        }

        assert_eq!(s.on(AgentEvent::Opened), Some(AgentState::Connected));
        assert_eq!(s.on(AgentEvent::RetriesExhausted), Some(AgentState::Failed));
    }

    #[test]
    fn test_stalled_connection_keeps_retry_count() {
        let s = AgentState::Reconnecting { attempt: 2 };
        let s = s.on(AgentEvent::Opened).unwrap();
        assert_eq!(s, AgentState::Connected);
        assert_eq!(
            s.on(AgentEvent::Stalled { attempt: 2 }),
            Some(AgentState::Reconnecting { attempt: 2 })
        );
        // Only a live connection can stall.
        assert_eq!(AgentState::Connecting.on(AgentEvent::Stalled { attempt: 1 }), None);
        assert_eq!(
            AgentState::Reconnecting { attempt: 1 }.on(AgentEvent::Stalled { attempt: 1 }),
            None
        );
    }

    #[test]
    fn test_failed_needs_explicit_connect() {
        let s = AgentState::Failed;
        assert_eq!(s.on(AgentEvent::Opened), None);
        assert_eq!(s.on(AgentEvent::RetryScheduled), None);
        assert_eq!(s.on(AgentEvent::Connect), Some(AgentState::Connecting));
        assert_eq!(s.on(AgentEvent::Disconnect), Some(AgentState::Disconnected));
    }

    #[test]
    fn test_disconnect_cancels_retry() {
        let s = AgentState::Reconnecting { attempt: 4 };
        assert_eq!(s.on(AgentEvent::Disconnect), Some(AgentState::Disconnected));
        assert_eq!(AgentState::Disconnected.on(AgentEvent::Disconnect), None);
    }

    #[test]
    fn test_invalid_events() {
        assert_eq!(AgentState::Connected.on(AgentEvent::Connect), None);
        assert_eq!(AgentState::Disconnected.on(AgentEvent::Opened), None);
        assert_eq!(AgentState::Connecting.on(AgentEvent::RetriesExhausted), None);
        assert_eq!(AgentState::Connected.on(AgentEvent::RetryScheduled), None);
    }

    #[test]
    fn test_backoff_doubles_up_to_cap() {
        let backoff = Backoff::new()
            .with_initial(Duration::from_millis(100))
            .with_max(Duration::from_millis(1000))
            .with_max_attempts(6);

        assert_eq!(backoff.delay(0), Some(Duration::from_millis(100)));
        assert_eq!(backoff.delay(1), Some(Duration::from_millis(200)));
        assert_eq!(backoff.delay(3), Some(Duration::from_millis(800)));
        assert_eq!(backoff.delay(4), Some(Duration::from_millis(1000)));
        assert_eq!(backoff.delay(5), Some(Duration::from_millis(1000)));
        assert_eq!(backoff.delay(6), None);
    }

    #[test]
    fn test_zero_attempts_never_retries() {
        let backoff = Backoff::new().with_max_attempts(0);
        assert_eq!(backoff.delay(0), None);
    }
}
