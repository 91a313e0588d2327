//! Per-domain circuit breaker
//!
//! Three states per registrable domain:
//!
//! - CLOSED: failures count up; hitting the threshold opens the circuit.
//! - OPEN: every check short-circuits with `infra:circuit_open` until
//!   the recovery timeout lapses, then HALF_OPEN.
//! - HALF_OPEN: up to `breaker_half_open_max` probes in flight. Any
//!   failure reopens; a success majority closes fully and resets the
//!   failure count.
//!
//! Transitions are linearisable per host: each entry mutates under its
//! DashMap shard guard, one mutator at a time. Circuit-open rejections
//! never reach the network, so they are invisible to the proxy pool.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::BreakerConfig;
use crate::error::FailReason;

/// Circuit state, exposed for status snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct Circuit {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Instant,
    half_open_in_flight: u32,
    half_open_successes: u32,
}

impl Circuit {
    fn new() -> Self {
        Self {
            state: BreakerState::Closed,
            consecutive_failures: 0,
            opened_at: Instant::now(),
            half_open_in_flight: 0,
            half_open_successes: 0,
        }
    }
}

/// Breaker status for the `infrastructure` section.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerStatus {
    pub domains_tracked: usize,
    pub closed: usize,
    pub open: usize,
    pub half_open: usize,
    pub total_opened: u64,
    pub total_blocked: u64,
    pub failure_threshold: u32,
    pub recovery_timeout_ms: u64,
}

/// The per-domain circuit breaker.
#[derive(Debug)]
pub struct CircuitBreaker {
    circuits: DashMap<String, Circuit>,
    total_opened: AtomicU64,
    total_blocked: AtomicU64,
    cfg: BreakerConfig,
}

impl CircuitBreaker {
    pub fn new(cfg: BreakerConfig) -> Self {
        Self {
            circuits: DashMap::new(),
            total_opened: AtomicU64::new(0),
            total_blocked: AtomicU64::new(0),
            cfg,
        }
    }

    fn recovery_elapsed(&self, circuit: &Circuit) -> bool {
        circuit.opened_at.elapsed().as_millis() as u64 >= self.cfg.breaker_recovery_ms
    }

    /// Admission check for one request to `host`. On OPEN past the
    /// recovery timeout the circuit moves to HALF_OPEN and this call
    /// becomes one of its probes.
    pub fn check(&self, host: &str) -> Result<(), FailReason> {
        let mut circuit = self
            .circuits
            .entry(host.to_string())
            .or_insert_with(Circuit::new);

        if circuit.state == BreakerState::Open && self.recovery_elapsed(&circuit) {
            circuit.state = BreakerState::HalfOpen;
            circuit.half_open_in_flight = 0;
            circuit.half_open_successes = 0;
            info!(host, "Circuit HALF_OPEN after recovery timeout");
        }

        match circuit.state {
            BreakerState::Closed => Ok(()),
            BreakerState::Open => {
                self.total_blocked.fetch_add(1, Ordering::Relaxed);
                Err(FailReason::CircuitOpen)
            }
            BreakerState::HalfOpen => {
                if circuit.half_open_in_flight >= self.cfg.breaker_half_open_max {
                    self.total_blocked.fetch_add(1, Ordering::Relaxed);
                    Err(FailReason::CircuitOpen)
                } else {
                    circuit.half_open_in_flight += 1;
                    debug!(host, probes = circuit.half_open_in_flight, "Half-open probe admitted");
                    Ok(())
                }
            }
        }
    }

    /// Record a successful fetch for the host.
    pub fn record_success(&self, host: &str) {
        let Some(mut circuit) = self.circuits.get_mut(host) else {
            return;
        };

        match circuit.state {
            BreakerState::Closed => {
                circuit.consecutive_failures = 0;
            }
            BreakerState::HalfOpen => {
                circuit.half_open_in_flight = circuit.half_open_in_flight.saturating_sub(1);
                circuit.half_open_successes += 1;
                let needed = self.cfg.breaker_half_open_max.div_ceil(2);
                if circuit.half_open_successes >= needed {
                    circuit.state = BreakerState::Closed;
                    circuit.consecutive_failures = 0;
                    info!(host, "Circuit CLOSED after successful probes");
                }
            }
            BreakerState::Open => {}
        }
    }

    /// Record a failed fetch for the host.
    pub fn record_failure(&self, host: &str) {
        let mut circuit = self
            .circuits
            .entry(host.to_string())
            .or_insert_with(Circuit::new);

        circuit.consecutive_failures += 1;

        match circuit.state {
            BreakerState::HalfOpen => {
                circuit.state = BreakerState::Open;
                circuit.opened_at = Instant::now();
                circuit.half_open_in_flight = 0;
                warn!(host, "Circuit REOPENED on half-open failure");
            }
            BreakerState::Closed => {
                if circuit.consecutive_failures >= self.cfg.breaker_threshold {
                    circuit.state = BreakerState::Open;
                    circuit.opened_at = Instant::now();
                    self.total_opened.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        host,
                        failures = circuit.consecutive_failures,
                        "Circuit OPEN"
                    );
                }
            }
            BreakerState::Open => {}
        }
    }

    /// Release an admitted half-open probe without recording an
    /// outcome. Cancelled requests use this so the probe budget is not
    /// leaked.
    pub fn record_cancelled(&self, host: &str) {
        if let Some(mut circuit) = self.circuits.get_mut(host) {
            if circuit.state == BreakerState::HalfOpen {
                circuit.half_open_in_flight = circuit.half_open_in_flight.saturating_sub(1);
            }
        }
    }

    /// Non-consuming fast path used before the probe stage: true only
    /// while the host is OPEN inside its recovery window. Unlike
    /// [`check`](Self::check) this never admits a half-open probe.
    pub fn reject_fast(&self, host: &str) -> bool {
        match self.circuits.get(host) {
            Some(circuit)
                if circuit.state == BreakerState::Open && !self.recovery_elapsed(&circuit) =>
            {
                self.total_blocked.fetch_add(1, Ordering::Relaxed);
                true
            }
            _ => false,
        }
    }

    /// Atomic snapshot of the current state for a host.
    pub fn state(&self, host: &str) -> BreakerState {
        match self.circuits.get(host) {
            Some(circuit) => {
                if circuit.state == BreakerState::Open && self.recovery_elapsed(&circuit) {
                    BreakerState::HalfOpen
                } else {
                    circuit.state
                }
            }
            None => BreakerState::Closed,
        }
    }

    pub fn failure_count(&self, host: &str) -> u32 {
        self.circuits
            .get(host)
            .map(|c| c.consecutive_failures)
            .unwrap_or(0)
    }

    pub fn status(&self) -> BreakerStatus {
        let mut closed = 0;
        let mut open = 0;
        let mut half_open = 0;
        for entry in self.circuits.iter() {
            match entry.state {
                BreakerState::Closed => closed += 1,
                BreakerState::Open => {
                    if self.recovery_elapsed(&entry) {
                        half_open += 1;
                    } else {
                        open += 1;
                    }
                }
                BreakerState::HalfOpen => half_open += 1,
            }
        }

        BreakerStatus {
            domains_tracked: self.circuits.len(),
            closed,
            open,
            half_open,
            total_opened: self.total_opened.load(Ordering::Relaxed),
            total_blocked: self.total_blocked.load(Ordering::Relaxed),
            failure_threshold: self.cfg.breaker_threshold,
            recovery_timeout_ms: self.cfg.breaker_recovery_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn breaker(threshold: u32, recovery_ms: u64) -> CircuitBreaker {
        CircuitBreaker::new(BreakerConfig {
            breaker_threshold: threshold,
            breaker_recovery_ms: recovery_ms,
            breaker_half_open_max: 3,
        })
    }

    #[test]
    fn test_closed_allows() {
        let breaker = breaker(12, 30_000);
        assert!(breaker.check("acme.com.br").is_ok());
        assert_eq!(breaker.state("acme.com.br"), BreakerState::Closed);
    }

    #[test]
    fn test_opens_at_threshold() {
        let breaker = breaker(3, 30_000);
        for _ in 0..2 {
            breaker.record_failure("acme.com.br");
        }
        assert_eq!(breaker.state("acme.com.br"), BreakerState::Closed);
        breaker.record_failure("acme.com.br");
        assert_eq!(breaker.state("acme.com.br"), BreakerState::Open);
        assert_eq!(breaker.check("acme.com.br").unwrap_err(), FailReason::CircuitOpen);
        assert_eq!(breaker.status().total_opened, 1);
    }

    #[test]
    fn test_single_failure_threshold_one() {
        let breaker = breaker(1, 30_000);
        breaker.record_failure("acme.com.br");
        assert_eq!(breaker.check("acme.com.br").unwrap_err(), FailReason::CircuitOpen);
    }

    #[test]
    fn test_success_resets_counter() {
        let breaker = breaker(3, 30_000);
        breaker.record_failure("acme.com.br");
        breaker.record_failure("acme.com.br");
        breaker.record_success("acme.com.br");
        breaker.record_failure("acme.com.br");
        // Counter was reset, so still closed
        assert_eq!(breaker.state("acme.com.br"), BreakerState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_to_half_open_after_recovery() {
        let breaker = breaker(1, 1_000);
        breaker.record_failure("acme.com.br");
        assert!(breaker.check("acme.com.br").is_err());

        tokio::time::advance(Duration::from_millis(1_100)).await;
        // First check after the window becomes a half-open probe
        assert!(breaker.check("acme.com.br").is_ok());
        assert_eq!(breaker.state("acme.com.br"), BreakerState::HalfOpen);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_admits_bounded_probes() {
        let breaker = breaker(1, 1_000);
        breaker.record_failure("acme.com.br");
        tokio::time::advance(Duration::from_millis(1_100)).await;

        assert!(breaker.check("acme.com.br").is_ok());
        assert!(breaker.check("acme.com.br").is_ok());
        assert!(breaker.check("acme.com.br").is_ok());
        // Fourth probe rejected
        assert_eq!(breaker.check("acme.com.br").unwrap_err(), FailReason::CircuitOpen);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_failure_reopens() {
        let breaker = breaker(1, 1_000);
        breaker.record_failure("acme.com.br");
        tokio::time::advance(Duration::from_millis(1_100)).await;
        assert!(breaker.check("acme.com.br").is_ok());

        breaker.record_failure("acme.com.br");
        assert_eq!(breaker.state("acme.com.br"), BreakerState::Open);
        assert!(breaker.check("acme.com.br").is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_success_majority_closes() {
        let breaker = breaker(1, 1_000);
        breaker.record_failure("acme.com.br");
        tokio::time::advance(Duration::from_millis(1_100)).await;

        assert!(breaker.check("acme.com.br").is_ok());
        assert!(breaker.check("acme.com.br").is_ok());
        breaker.record_success("acme.com.br");
        // ceil(3/2) = 2 successes close the circuit
        breaker.record_success("acme.com.br");
        assert_eq!(breaker.state("acme.com.br"), BreakerState::Closed);
        assert_eq!(breaker.failure_count("acme.com.br"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_releases_probe_budget() {
        let breaker = breaker(1, 1_000);
        breaker.record_failure("acme.com.br");
        tokio::time::advance(Duration::from_millis(1_100)).await;

        for _ in 0..3 {
            assert!(breaker.check("acme.com.br").is_ok());
        }
        assert!(breaker.check("acme.com.br").is_err());
        breaker.record_cancelled("acme.com.br");
        // Budget freed, one more probe fits
        assert!(breaker.check("acme.com.br").is_ok());
    }

    #[test]
    fn test_hosts_are_independent() {
        let breaker = breaker(1, 30_000);
        breaker.record_failure("a.com.br");
        assert!(breaker.check("a.com.br").is_err());
        assert!(breaker.check("b.com.br").is_ok());
    }
}
