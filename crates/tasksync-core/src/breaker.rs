//! Health-scored circuit breaker
//!
//! Gates sync attempts and turns their outcomes into a 0-100 health score.
//! The breaker never fails: it only does arithmetic over recorded outcomes
//! and a monotonic clock, so I/O failures elsewhere are absorbed here instead
//! of cascading into retry storms.
//!
//! After `max_consecutive_errors` failures the breaker trips and rejects
//! attempts for a cooldown. Once the cooldown elapses a single probe attempt
//! is admitted; if that probe fails too, the breaker re-trips with a doubled
//! cooldown (capped at `max_cooldown`).

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::BreakerConfig;
use crate::error::{SyncError, SyncResult};

/// Default score required before progressive sync may advance
pub const DEFAULT_READY_SCORE: u8 = 50;

/// Coarse health classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthBand {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthBand {
    fn from_score(score: u8) -> Self {
        match score {
            80..=100 => HealthBand::Healthy,
            50..=79 => HealthBand::Degraded,
            _ => HealthBand::Unhealthy,
        }
    }
}

impl fmt::Display for HealthBand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthBand::Healthy => write!(f, "healthy"),
            HealthBand::Degraded => write!(f, "degraded"),
            HealthBand::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

/// Snapshot of breaker health, recomputed on demand
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    pub score: u8,
    pub overall_band: HealthBand,
    pub is_ready_for_progressive_sync: bool,
    pub recommendations: Vec<String>,
}

/// Raw breaker counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct CircuitBreakerMetrics {
    pub consecutive_errors: u32,
    pub last_sync_duration_ms: u64,
    pub conflict_count: u64,
    pub total_attempts: u64,
}

#[derive(Debug, Clone, Copy)]
enum Outcome {
    Success(Duration),
    Error,
    Conflict,
}

#[derive(Debug)]
struct BreakerState {
    metrics: CircuitBreakerMetrics,
    window: VecDeque<Outcome>,
    cooldown_until: Option<Instant>,
    current_cooldown: Duration,
    /// Tripped and not yet closed again by a success
    tripped: bool,
    in_flight_since: Option<Instant>,
    destroyed: bool,
}

impl BreakerState {
    fn new(base_cooldown: Duration) -> Self {
        Self {
            metrics: CircuitBreakerMetrics::default(),
            window: VecDeque::new(),
            cooldown_until: None,
            current_cooldown: base_cooldown,
            tripped: false,
            in_flight_since: None,
            destroyed: false,
        }
    }
}

/// Circuit breaker shared by every replication attempt in the process
#[derive(Debug)]
pub struct CircuitBreaker {
    config: BreakerConfig,
    ready_score: u8,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    /// Create a breaker with the given thresholds
    pub fn new(config: BreakerConfig) -> Self {
        let state = BreakerState::new(config.cooldown());
        Self {
            config,
            ready_score: DEFAULT_READY_SCORE,
            state: Mutex::new(state),
        }
    }

    /// Set the score required for `is_ready_for_progressive_sync`
    pub fn with_ready_score(mut self, score: u8) -> Self {
        self.ready_score = score;
        self
    }

    fn state(&self) -> MutexGuard<'_, BreakerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn push_outcome(&self, state: &mut BreakerState, outcome: Outcome) {
        state.window.push_back(outcome);
        while state.window.len() > self.config.window_size.max(1) {
            state.window.pop_front();
        }
    }

    // ==================== Recording ====================

    /// Record a completed sync attempt
    pub fn record_success(&self, duration: Duration) {
        let mut state = self.state();
        state.metrics.consecutive_errors = 0;
        state.metrics.total_attempts += 1;
        state.metrics.last_sync_duration_ms = duration.as_millis() as u64;
        state.in_flight_since = None;
        if state.tripped {
            info!("Circuit breaker closed after successful probe");
            state.tripped = false;
            state.current_cooldown = self.config.cooldown();
        }
        self.push_outcome(&mut state, Outcome::Success(duration));
    }

    /// Record a failed sync attempt
    pub fn record_error(&self, context: &str, details: &str) {
        let mut state = self.state();
        state.metrics.consecutive_errors += 1;
        state.metrics.total_attempts += 1;
        state.in_flight_since = None;
        self.push_outcome(&mut state, Outcome::Error);

        warn!(
            context,
            details,
            consecutive_errors = state.metrics.consecutive_errors,
            "Sync attempt failed"
        );

        if state.metrics.consecutive_errors < self.config.max_consecutive_errors {
            return;
        }

        let cooldown = if state.tripped {
            (state.current_cooldown * 2).min(self.config.max_cooldown())
        } else {
            self.config.cooldown()
        };
        state.tripped = true;
        state.current_cooldown = cooldown;
        state.cooldown_until = Some(Instant::now() + cooldown);
        warn!(
            context,
            cooldown_ms = cooldown.as_millis() as u64,
            "Circuit breaker tripped"
        );
    }

    /// Record a resolved conflict
    ///
    /// Conflicts lower the score but never trip the breaker.
    pub fn record_conflict(&self, context: &str, details: &str) {
        let mut state = self.state();
        state.metrics.conflict_count += 1;
        self.push_outcome(&mut state, Outcome::Conflict);
        debug!(context, details, "Conflict recorded");
    }

    /// Mark the start of an attempt, used to detect hung syncs
    pub fn begin_attempt(&self) {
        self.state().in_flight_since = Some(Instant::now());
    }

    // ==================== Gate ====================

    /// Whether a sync attempt may start now
    pub fn can_sync(&self) -> bool {
        let state = self.state();
        if state.destroyed {
            return false;
        }

        let now = Instant::now();
        if state.cooldown_until.is_some_and(|until| now < until) {
            return false;
        }

        if let Some(started) = state.in_flight_since {
            if now.duration_since(started) > self.config.max_sync_duration() {
                return false;
            }
            // Half-open: only one probe at a time
            if state.metrics.consecutive_errors >= self.config.max_consecutive_errors {
                return false;
            }
        }

        true
    }

    /// Longest an attempt may run before it counts as hung
    pub fn max_sync_duration(&self) -> Duration {
        self.config.max_sync_duration()
    }

    /// Time left before the cooldown expires
    pub fn cooldown_remaining(&self) -> Option<Duration> {
        let state = self.state();
        let until = state.cooldown_until?;
        let remaining = until.saturating_duration_since(Instant::now());
        (!remaining.is_zero()).then_some(remaining)
    }

    /// Run a sync attempt through the breaker
    ///
    /// Rejects with [`SyncError::CircuitOpen`] before calling `f` when the
    /// breaker is open. Otherwise the outcome (including a timeout) is
    /// recorded and returned.
    pub async fn execute<T, F, Fut>(
        &self,
        context: &'static str,
        timeout: Duration,
        f: F,
    ) -> SyncResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = SyncResult<T>>,
    {
        if !self.can_sync() {
            debug!(context, "Attempt short-circuited by breaker");
            return Err(SyncError::CircuitOpen);
        }

        self.begin_attempt();
        let started = Instant::now();

        match tokio::time::timeout(timeout, f()).await {
            Ok(Ok(value)) => {
                self.record_success(started.elapsed());
                Ok(value)
            }
            Ok(Err(e)) => {
                self.record_error(context, &e.to_string());
                Err(e)
            }
            Err(_) => {
                let e = SyncError::Timeout {
                    operation: context,
                    after: timeout,
                };
                self.record_error(context, &e.to_string());
                Err(e)
            }
        }
    }

    // ==================== Reporting ====================

    /// Current counters
    pub fn metrics(&self) -> CircuitBreakerMetrics {
        self.state().metrics
    }

    /// Conflicts per attempt, as a percentage
    pub fn get_conflict_rate(&self) -> f64 {
        let metrics = self.metrics();
        metrics.conflict_count as f64 / metrics.total_attempts.max(1) as f64 * 100.0
    }

    /// Compute the health report from the rolling window
    pub fn health_report(&self) -> HealthReport {
        let state = self.state();
        let max_errors = self.config.max_consecutive_errors;
        let consecutive = state.metrics.consecutive_errors;

        let attempts = state
            .window
            .iter()
            .filter(|o| !matches!(o, Outcome::Conflict))
            .count();
        let conflicts = state.window.len() - attempts;
        let window_conflict_rate = conflicts as f64 / attempts.max(1) as f64 * 100.0;

        let durations: Vec<Duration> = state
            .window
            .iter()
            .filter_map(|o| match o {
                Outcome::Success(d) => Some(*d),
                _ => None,
            })
            .collect();
        let duration_ratio = if durations.is_empty() {
            0.0
        } else {
            let avg = durations.iter().sum::<Duration>() / durations.len() as u32;
            (avg.as_secs_f64() / self.config.max_sync_duration().as_secs_f64().max(f64::EPSILON))
                .min(1.0)
        };

        let error_penalty = (consecutive as f64 * 20.0).min(60.0);
        let conflict_penalty = (window_conflict_rate * 0.3).min(30.0);
        let duration_penalty = duration_ratio * 10.0;
        let score = (100.0 - error_penalty - conflict_penalty - duration_penalty)
            .round()
            .clamp(0.0, 100.0) as u8;

        let mut recommendations = Vec::new();
        if state.destroyed {
            recommendations.push("Breaker destroyed; create a new engine to sync again".to_string());
        }
        if state.cooldown_until.is_some_and(|until| Instant::now() < until) {
            recommendations.push("Cooling down after repeated failures; sync resumes shortly".to_string());
        }
        if consecutive >= max_errors {
            recommendations.push(format!(
                "{} consecutive sync errors; check remote connectivity and credentials",
                consecutive
            ));
        } else if consecutive > 0 {
            recommendations.push("Recent sync errors; monitor connectivity".to_string());
        }
        if conflict_penalty >= 15.0 {
            recommendations.push(
                "High conflict rate; avoid editing the same tasks on several devices at once"
                    .to_string(),
            );
        } else if conflicts > 0 {
            recommendations.push("Some conflicts were resolved automatically; review the audit log".to_string());
        }
        if duration_ratio >= 0.5 {
            recommendations.push("Syncs are slow; consider a smaller batch size".to_string());
        }

        HealthReport {
            score,
            overall_band: HealthBand::from_score(score),
            is_ready_for_progressive_sync: !state.destroyed && score >= self.ready_score,
            recommendations,
        }
    }

    // ==================== Lifecycle ====================

    /// Clear all counters and any pending cooldown
    pub fn reset(&self) {
        let mut state = self.state();
        let destroyed = state.destroyed;
        *state = BreakerState::new(self.config.cooldown());
        state.destroyed = destroyed;
        debug!("Circuit breaker reset");
    }

    /// Reset and permanently close the gate
    pub fn destroy(&self) {
        let mut state = self.state();
        *state = BreakerState::new(self.config.cooldown());
        state.destroyed = true;
    }

    /// Whether `destroy()` has been called
    pub fn is_destroyed(&self) -> bool {
        self.state().destroyed
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(BreakerConfig::default())
    }
}
