//! Circuit breaker over the KV scratchpad.
//!
//! Repeated non-cancel failures open the circuit, pausing all processing for
//! a cooldown. The three fields (`circuit_state`, `circuit_failures`,
//! `circuit_open_until`) are persisted per channel so the breaker survives
//! restarts mid-cooldown.
//!
//! State machine: `closed` counts failures; at the threshold it becomes
//! `open` with a deadline. Once the deadline passes the scheduler's check
//! transitions it to `half-open`, which admits exactly one probe item — a
//! success closes the circuit, a failure reopens it for a fresh cooldown.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use utoipa::ToSchema;

use crate::Result;
use crate::db::Database;

/// KV key holding the breaker state
const KEY_STATE: &str = "circuit_state";
/// KV key holding the consecutive failure count
const KEY_FAILURES: &str = "circuit_failures";
/// KV key holding the RFC 3339 open deadline
const KEY_OPEN_UNTIL: &str = "circuit_open_until";

/// Breaker state as persisted in the scratchpad
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "kebab-case")]
pub enum CircuitState {
    /// Normal operation
    Closed,
    /// Cooling down after the failure threshold was crossed
    Open,
    /// Cooldown elapsed; one probe item is admitted
    HalfOpen,
}

impl CircuitState {
    /// Scratchpad representation
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half-open",
        }
    }

    /// Parse the scratchpad representation; unknown text reads as closed
    pub fn from_str_lossy(value: &str) -> Self {
        match value {
            "open" => CircuitState::Open,
            "half-open" => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }
}

/// What the scheduler should do this tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerDecision {
    /// Process normally
    Proceed,
    /// Admit exactly one probe item
    HalfOpen,
    /// Skip the tick; the circuit is open until the deadline
    Skip {
        /// When the open period ends
        until: DateTime<Utc>,
    },
}

/// Failure-counting circuit breaker persisted in the KV scratchpad
pub struct CircuitBreaker {
    db: Arc<Database>,
    channel: String,
    threshold: u32,
    cooldown: Duration,
}

impl CircuitBreaker {
    /// Create a breaker for one channel. `threshold` 0 disables it entirely.
    pub fn new(db: Arc<Database>, channel: String, threshold: u32, cooldown: Duration) -> Self {
        Self {
            db,
            channel,
            threshold,
            cooldown,
        }
    }

    /// Whether the breaker is enabled
    pub fn enabled(&self) -> bool {
        self.threshold > 0
    }

    /// Current persisted state
    pub async fn state(&self) -> Result<CircuitState> {
        let raw = self.db.kv_get(&self.channel, KEY_STATE).await?;
        Ok(raw
            .map(|v| CircuitState::from_str_lossy(&v))
            .unwrap_or(CircuitState::Closed))
    }

    /// Current consecutive failure count
    pub async fn failures(&self) -> Result<i64> {
        self.db.kv_get_i64(&self.channel, KEY_FAILURES, 0).await
    }

    /// The open deadline, when one is recorded
    pub async fn open_until(&self) -> Result<Option<DateTime<Utc>>> {
        let raw = self.db.kv_get(&self.channel, KEY_OPEN_UNTIL).await?;
        Ok(raw.and_then(|v| {
            DateTime::parse_from_rfc3339(&v)
                .ok()
                .map(|dt| dt.with_timezone(&Utc))
        }))
    }

    /// Tick-start decision: proceed, admit one probe, or skip until deadline.
    ///
    /// Performs the open → half-open transition when the deadline has passed,
    /// writing the new state before the probe runs so a crash mid-probe
    /// cannot silently close the circuit.
    pub async fn check(&self) -> Result<BreakerDecision> {
        if !self.enabled() {
            return Ok(BreakerDecision::Proceed);
        }

        match self.state().await? {
            CircuitState::Closed => Ok(BreakerDecision::Proceed),
            CircuitState::HalfOpen => Ok(BreakerDecision::HalfOpen),
            CircuitState::Open => {
                let now = Utc::now();
                match self.open_until().await? {
                    Some(until) if now < until => Ok(BreakerDecision::Skip { until }),
                    _ => {
                        self.db
                            .kv_put(&self.channel, KEY_STATE, CircuitState::HalfOpen.as_str())
                            .await?;
                        tracing::info!(channel = %self.channel, "circuit breaker half-open, admitting one probe");
                        Ok(BreakerDecision::HalfOpen)
                    }
                }
            }
        }
    }

    /// Record a non-cancel failure. Crossing the threshold opens the circuit
    /// for one cooldown; a failure while half-open reopens it.
    pub async fn record_failure(&self) -> Result<()> {
        if !self.enabled() {
            return Ok(());
        }

        let failures = self.failures().await? + 1;
        self.db
            .kv_put(&self.channel, KEY_FAILURES, &failures.to_string())
            .await?;

        if failures >= i64::from(self.threshold) {
            let until = Utc::now()
                + chrono::Duration::from_std(self.cooldown)
                    .unwrap_or_else(|_| chrono::Duration::seconds(300));
            self.db
                .kv_put(&self.channel, KEY_STATE, CircuitState::Open.as_str())
                .await?;
            self.db
                .kv_put(&self.channel, KEY_OPEN_UNTIL, &until.to_rfc3339())
                .await?;

            tracing::warn!(
                channel = %self.channel,
                failures,
                open_until = %until,
                "circuit breaker opened"
            );
        }

        Ok(())
    }

    /// Record a success: failure count resets and the circuit closes.
    pub async fn record_success(&self) -> Result<()> {
        if !self.enabled() {
            return Ok(());
        }

        self.db.kv_put(&self.channel, KEY_FAILURES, "0").await?;
        self.db
            .kv_put(&self.channel, KEY_STATE, CircuitState::Closed.as_str())
            .await?;
        self.db.kv_delete(&self.channel, KEY_OPEN_UNTIL).await?;

        Ok(())
    }
}
