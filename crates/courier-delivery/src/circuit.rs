//! Circuit breaker implementation for transport failure protection.
//!
//! Provides per-transport circuit breakers that fail fast during SMTP
//! outages and probe for recovery after a cooldown. Prevents pile-up by
//! refusing delivery attempts while the relay is presumed down.
//!
//! # State Machine
//!
//! ```text
//!      3 consecutive failures          cooldown elapsed, next can_request()
//!  CLOSED ──────────────────▶ OPEN ─────────────────────▶ HALF-OPEN
//!    ▲                          ▲                            │    │
//!    │                          │  record_failure()          │    │
//!    │                          └────────────────────────────┘    │
//!    │                              record_success()               │
//!    └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! The failure counter is never decremented. A success while Closed does
//! not clear accumulated failures; only the Half-Open to Closed transition
//! zeroes the counter. Three failures spread across an otherwise healthy
//! stretch still open the circuit.
//!
//! # Usage
//!
//! ```no_run
//! use courier_delivery::circuit::{CircuitBreakerManager, CircuitConfig};
//!
//! # async fn example() {
//! let manager = CircuitBreakerManager::new(CircuitConfig::default());
//!
//! if manager.can_request("smtp.example.com").await {
//!     let send_result: Result<(), &str> = Ok(());
//!     match send_result {
//!         Ok(()) => manager.record_success("smtp.example.com").await,
//!         Err(_) => manager.record_failure("smtp.example.com").await,
//!     }
//! }
//! # }
//! ```

use std::{collections::HashMap, sync::Arc, time::Duration};

use courier_core::time::{Clock, RealClock};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

/// Circuit breaker configuration shared by all transport keys.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitConfig {
    /// Consecutive failures required to open the circuit.
    pub failure_threshold: u32,
    /// Time the circuit stays open before permitting a probe.
    pub cooldown: Duration,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self { failure_threshold: 3, cooldown: Duration::from_secs(10) }
    }
}

/// Current state of a circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CircuitState {
    /// Normal operation, all attempts allowed.
    Closed,
    /// Transport unhealthy, attempts blocked until cooldown elapses.
    Open,
    /// Probing recovery, attempts allowed until one outcome resolves.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// State and counters for a single transport's circuit breaker.
#[derive(Debug, Clone)]
pub struct CircuitStats {
    /// Current circuit state.
    pub state: CircuitState,
    /// Consecutive failures since the counter was last zeroed.
    pub consecutive_failures: u32,
    /// When the last failure was recorded.
    pub last_failure_at: Option<std::time::Instant>,
    /// When the circuit last changed state.
    pub last_state_change: std::time::Instant,
}

impl CircuitStats {
    fn new(now: std::time::Instant) -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            last_failure_at: None,
            last_state_change: now,
        }
    }
}

/// Thread-safe circuit breaker manager keyed by transport.
///
/// Holds one breaker per transport key (typically the SMTP relay host).
/// State lives in process memory, so each worker instance protects itself
/// independently; replicas may disagree briefly during an outage, which is
/// an accepted tradeoff for avoiding cross-instance coordination.
#[derive(Debug)]
pub struct CircuitBreakerManager {
    config: CircuitConfig,
    clock: Arc<dyn Clock>,
    circuits: Arc<Mutex<HashMap<String, CircuitStats>>>,
}

impl CircuitBreakerManager {
    /// Creates a new circuit breaker manager with the given configuration.
    pub fn new(config: CircuitConfig) -> Self {
        Self::with_clock(config, Arc::new(RealClock::new()))
    }

    /// Creates a manager with an injected clock for deterministic tests.
    pub fn with_clock(config: CircuitConfig, clock: Arc<dyn Clock>) -> Self {
        Self { config, clock, circuits: Arc::new(Mutex::new(HashMap::new())) }
    }

    /// Determines if a delivery attempt may proceed for the given transport.
    ///
    /// Closed and Half-Open circuits permit the attempt. An Open circuit
    /// blocks until the cooldown has elapsed since the last failure; the
    /// first call after that moves the circuit to Half-Open and permits the
    /// probe, so this check is itself a state transition.
    #[allow(clippy::significant_drop_tightening)] // Atomic check-and-transition required
    pub async fn can_request(&self, transport_key: &str) -> bool {
        let now = self.clock.now();
        let mut circuits = self.circuits.lock().await;
        let stats =
            circuits.entry(transport_key.to_string()).or_insert_with(|| CircuitStats::new(now));

        match stats.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let cooled = stats
                    .last_failure_at
                    .is_none_or(|at| now.duration_since(at) > self.config.cooldown);

                if cooled {
                    tracing::info!(
                        transport_key,
                        "circuit breaker half-open, permitting probe"
                    );
                    stats.state = CircuitState::HalfOpen;
                    stats.last_state_change = now;
                    true
                } else {
                    false
                }
            },
        }
    }

    /// Records a successful delivery outcome for the transport.
    ///
    /// Closes the circuit and zeroes the failure counter when Half-Open. A
    /// success while Closed leaves the counter untouched: no partial credit
    /// for intermittent recovery.
    #[allow(clippy::significant_drop_tightening)] // Atomic state transition required
    pub async fn record_success(&self, transport_key: &str) {
        let now = self.clock.now();
        let mut circuits = self.circuits.lock().await;
        let stats =
            circuits.entry(transport_key.to_string()).or_insert_with(|| CircuitStats::new(now));

        match stats.state {
            CircuitState::Closed => {},
            CircuitState::Open => {
                tracing::warn!(transport_key, "success recorded while circuit open");
            },
            CircuitState::HalfOpen => {
                tracing::info!(transport_key, "circuit breaker closing, transport recovered");
                stats.state = CircuitState::Closed;
                stats.consecutive_failures = 0;
                stats.last_state_change = now;
            },
        }
    }

    /// Records a failed delivery outcome for the transport.
    ///
    /// Opens the circuit once the consecutive failure threshold is reached,
    /// and immediately reopens it on any Half-Open failure, even the first
    /// probe.
    #[allow(clippy::significant_drop_tightening)] // Atomic state transition required
    pub async fn record_failure(&self, transport_key: &str) {
        let now = self.clock.now();
        let mut circuits = self.circuits.lock().await;
        let stats =
            circuits.entry(transport_key.to_string()).or_insert_with(|| CircuitStats::new(now));

        stats.consecutive_failures = stats.consecutive_failures.saturating_add(1);
        stats.last_failure_at = Some(now);

        match stats.state {
            CircuitState::Closed => {
                if stats.consecutive_failures >= self.config.failure_threshold {
                    tracing::warn!(
                        transport_key,
                        failures = stats.consecutive_failures,
                        "circuit breaker opening"
                    );
                    stats.state = CircuitState::Open;
                    stats.last_state_change = now;
                }
            },
            CircuitState::Open => {},
            CircuitState::HalfOpen => {
                tracing::warn!(transport_key, "probe failed, circuit breaker reopening");
                stats.state = CircuitState::Open;
                stats.last_state_change = now;
            },
        }
    }

    /// Returns current circuit breaker statistics for a transport.
    pub async fn circuit_stats(&self, transport_key: &str) -> Option<CircuitStats> {
        let circuits = self.circuits.lock().await;
        circuits.get(transport_key).cloned()
    }

    /// Returns all circuit breaker statistics.
    pub async fn all_circuit_stats(&self) -> HashMap<String, CircuitStats> {
        self.circuits.lock().await.clone()
    }

    /// Forces a circuit to the specified state (for testing/admin purposes).
    #[allow(clippy::significant_drop_tightening)] // Atomic state change required
    pub async fn force_circuit_state(&self, transport_key: &str, state: CircuitState) {
        let now = self.clock.now();
        let mut circuits = self.circuits.lock().await;
        let stats =
            circuits.entry(transport_key.to_string()).or_insert_with(|| CircuitStats::new(now));

        stats.state = state;
        stats.last_state_change = now;

        if state == CircuitState::Open {
            stats.last_failure_at = Some(now);
        }

        if state == CircuitState::Closed {
            stats.consecutive_failures = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use courier_core::time::TestClock;

    use super::*;

    const KEY: &str = "smtp.example.com";

    fn test_manager() -> (CircuitBreakerManager, TestClock) {
        let clock = TestClock::new();
        let manager = CircuitBreakerManager::with_clock(
            CircuitConfig::default(),
            Arc::new(clock.clone()),
        );
        (manager, clock)
    }

    #[tokio::test]
    async fn circuit_starts_closed() {
        let (manager, _clock) = test_manager();
        assert!(manager.can_request(KEY).await);

        let stats = manager.circuit_stats(KEY).await.unwrap();
        assert_eq!(stats.state, CircuitState::Closed);
    }

    #[tokio::test]
    async fn threshold_failures_open_circuit() {
        let (manager, _clock) = test_manager();

        manager.record_failure(KEY).await;
        manager.record_failure(KEY).await;
        assert!(manager.can_request(KEY).await, "below threshold stays closed");

        manager.record_failure(KEY).await;
        assert!(!manager.can_request(KEY).await, "third failure opens circuit");

        let stats = manager.circuit_stats(KEY).await.unwrap();
        assert_eq!(stats.state, CircuitState::Open);
    }

    #[tokio::test]
    async fn closed_success_gives_no_partial_credit() {
        let (manager, _clock) = test_manager();

        manager.record_failure(KEY).await;
        manager.record_failure(KEY).await;
        manager.record_success(KEY).await;

        let stats = manager.circuit_stats(KEY).await.unwrap();
        assert_eq!(stats.consecutive_failures, 2, "success in closed must not reset counter");

        // One more failure reaches the threshold despite the intervening
        // success.
        manager.record_failure(KEY).await;
        assert!(!manager.can_request(KEY).await);
    }

    #[tokio::test]
    async fn cooldown_gate_respects_clock() {
        let (manager, clock) = test_manager();

        for _ in 0..3 {
            manager.record_failure(KEY).await;
        }
        assert!(!manager.can_request(KEY).await);

        clock.advance(Duration::from_secs(9));
        assert!(!manager.can_request(KEY).await, "still cooling down");

        clock.advance(Duration::from_secs(2));
        assert!(manager.can_request(KEY).await, "first post-cooldown call permits probe");

        let stats = manager.circuit_stats(KEY).await.unwrap();
        assert_eq!(stats.state, CircuitState::HalfOpen);
    }

    #[tokio::test]
    async fn half_open_success_closes_and_resets_counter() {
        let (manager, clock) = test_manager();

        for _ in 0..3 {
            manager.record_failure(KEY).await;
        }
        clock.advance(Duration::from_secs(11));
        assert!(manager.can_request(KEY).await);

        manager.record_success(KEY).await;

        let stats = manager.circuit_stats(KEY).await.unwrap();
        assert_eq!(stats.state, CircuitState::Closed);
        assert_eq!(stats.consecutive_failures, 0);

        // A fresh outage needs the full threshold again.
        manager.record_failure(KEY).await;
        manager.record_failure(KEY).await;
        assert!(manager.can_request(KEY).await);
    }

    #[tokio::test]
    async fn half_open_failure_reopens_immediately() {
        let (manager, clock) = test_manager();

        for _ in 0..3 {
            manager.record_failure(KEY).await;
        }
        clock.advance(Duration::from_secs(11));
        assert!(manager.can_request(KEY).await, "probe permitted");

        // Even the very first probe failing must reopen, not close.
        manager.record_failure(KEY).await;
        assert!(!manager.can_request(KEY).await);

        let stats = manager.circuit_stats(KEY).await.unwrap();
        assert_eq!(stats.state, CircuitState::Open);
    }

    #[tokio::test]
    async fn reopened_circuit_requires_fresh_cooldown() {
        let (manager, clock) = test_manager();

        for _ in 0..3 {
            manager.record_failure(KEY).await;
        }
        clock.advance(Duration::from_secs(11));
        assert!(manager.can_request(KEY).await);
        manager.record_failure(KEY).await;

        clock.advance(Duration::from_secs(9));
        assert!(!manager.can_request(KEY).await, "cooldown restarts from probe failure");

        clock.advance(Duration::from_secs(2));
        assert!(manager.can_request(KEY).await);
    }

    #[tokio::test]
    async fn transports_are_isolated() {
        let (manager, _clock) = test_manager();

        for _ in 0..3 {
            manager.record_failure("relay-a").await;
        }

        assert!(!manager.can_request("relay-a").await);
        assert!(manager.can_request("relay-b").await);
    }

    #[tokio::test]
    async fn force_circuit_state_overrides() {
        let (manager, _clock) = test_manager();

        manager.force_circuit_state(KEY, CircuitState::Open).await;
        assert!(!manager.can_request(KEY).await);

        manager.force_circuit_state(KEY, CircuitState::Closed).await;
        assert!(manager.can_request(KEY).await);
        let stats = manager.circuit_stats(KEY).await.unwrap();
        assert_eq!(stats.consecutive_failures, 0);
    }
}
