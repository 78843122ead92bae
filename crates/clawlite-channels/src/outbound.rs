use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use clawlite_core::{ClawLiteError, Event, EventBus, Result};

use crate::adapter::ChannelConnector;

/// Consecutive failures strictly above this open the circuit — the 6th
/// consecutive failure is the one that trips it.
const CIRCUIT_FAILURE_THRESHOLD: u32 = 5;
/// How long an open circuit blocks sends before a half-open probe.
const CIRCUIT_COOLDOWN: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

#[derive(Debug)]
struct CircuitBreaker {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    blocked_count: u64,
}

impl CircuitBreaker {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            opened_at: None,
            blocked_count: 0,
        }
    }

    /// May a send proceed right now? While open, every rejected send
    /// increments `blocked_count`.
    fn allow_request(&mut self) -> bool {
        match self.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let elapsed = self.opened_at.map(|t| t.elapsed()).unwrap_or_default();
                if elapsed >= CIRCUIT_COOLDOWN {
                    // Single probe decides recovery
                    self.state = CircuitState::HalfOpen;
                    true
                } else {
                    self.blocked_count += 1;
                    false
                }
            }
            CircuitState::HalfOpen => {
                self.blocked_count += 1;
                false
            }
        }
    }

    fn record_success(&mut self) {
        self.consecutive_failures = 0;
        self.state = CircuitState::Closed;
        self.opened_at = None;
    }

    fn record_failure(&mut self) {
        self.consecutive_failures += 1;
        if self.consecutive_failures > CIRCUIT_FAILURE_THRESHOLD {
            self.state = CircuitState::Open;
            self.opened_at = Some(Instant::now());
        }
    }

    fn cooldown_remaining(&self) -> Duration {
        match (self.state, self.opened_at) {
            (CircuitState::Open, Some(at)) => CIRCUIT_COOLDOWN.saturating_sub(at.elapsed()),
            _ => Duration::ZERO,
        }
    }
}

/// Point-in-time metrics snapshot for the health evaluator and status
/// surface.
#[derive(Debug, Clone, Serialize)]
pub struct OutboundMetrics {
    pub circuit_state: CircuitState,
    pub circuit_consecutive_failures: u32,
    pub circuit_blocked_count: u64,
    pub circuit_cooldown_remaining_s: f64,
    pub sent_count: u64,
    pub failed_count: u64,
    pub last_attempt_latency_s: f64,
    pub avg_attempt_latency_s: f64,
}

#[derive(Default)]
struct LatencyStats {
    last: f64,
    sum: f64,
    count: u64,
}

/// Per-instance outbound path: idempotency cache, circuit breaker, bounded
/// retries with jittered backoff, failure classification and counters.
pub struct OutboundDispatcher {
    channel: String,
    account: String,
    breaker: Mutex<CircuitBreaker>,
    /// Recently *delivered* idempotency keys; a repeat inside the window is
    /// acknowledged without resending.
    recent_sent: Mutex<HashMap<String, Instant>>,
    dedupe_window: Duration,
    send_timeout: Duration,
    max_attempts: u32,
    latency: Mutex<LatencyStats>,
    sent_count: AtomicU64,
    failed_count: AtomicU64,
    fallback_channel: Option<String>,
    events: EventBus,
}

impl OutboundDispatcher {
    pub fn new(
        channel: impl Into<String>,
        account: impl Into<String>,
        send_timeout: Duration,
        max_attempts: u32,
        dedupe_window: Duration,
        fallback_channel: Option<String>,
        events: EventBus,
    ) -> Self {
        Self {
            channel: channel.into(),
            account: account.into(),
            breaker: Mutex::new(CircuitBreaker::new()),
            recent_sent: Mutex::new(HashMap::new()),
            dedupe_window,
            send_timeout,
            max_attempts: max_attempts.max(1),
            latency: Mutex::new(LatencyStats::default()),
            sent_count: AtomicU64::new(0),
            failed_count: AtomicU64::new(0),
            fallback_channel,
            events,
        }
    }

    pub fn metrics(&self) -> OutboundMetrics {
        let breaker = self.breaker.lock();
        let latency = self.latency.lock();
        OutboundMetrics {
            circuit_state: breaker.state,
            circuit_consecutive_failures: breaker.consecutive_failures,
            circuit_blocked_count: breaker.blocked_count,
            circuit_cooldown_remaining_s: breaker.cooldown_remaining().as_secs_f64(),
            sent_count: self.sent_count.load(Ordering::Relaxed),
            failed_count: self.failed_count.load(Ordering::Relaxed),
            last_attempt_latency_s: latency.last,
            avg_attempt_latency_s: if latency.count > 0 {
                latency.sum / latency.count as f64
            } else {
                0.0
            },
        }
    }

    /// The fallback destination recorded on rejected sends, "none" when not
    /// configured.
    fn fallback_label(&self) -> String {
        self.fallback_channel.clone().unwrap_or_else(|| "none".into())
    }

    /// Deliver one outbound message through the connector.
    ///
    /// Returns `Ok(false)` when the idempotency cache acknowledged the send
    /// without resending, `Ok(true)` on an actual delivery. The fallback
    /// republish, when the circuit rejects the send, is left to the caller
    /// via the returned error — the manager owns cross-channel routing.
    pub async fn dispatch(
        &self,
        connector: &dyn ChannelConnector,
        idempotency_key: &str,
        chat_id: &str,
        thread_id: Option<&str>,
        text: &str,
    ) -> Result<bool> {
        // 1. Idempotency: a recent successful delivery with the same key is
        //    acknowledged, not resent.
        {
            let mut recent = self.recent_sent.lock();
            let now = Instant::now();
            recent.retain(|_, at| now.duration_since(*at) <= self.dedupe_window);
            if recent.contains_key(idempotency_key) {
                debug!(channel = %self.channel, key = idempotency_key, "outbound deduplicated");
                return Ok(false);
            }
        }

        // 2. Circuit state: while open, reject without touching the backend.
        if !self.breaker.lock().allow_request() {
            self.events.publish(Event::OutboundFailed {
                channel: self.channel.clone(),
                code: "channel_unavailable".into(),
                fallback: self.fallback_label(),
            });
            warn!(
                channel = %self.channel,
                account = %self.account,
                fallback = %self.fallback_label(),
                "outbound rejected: circuit open"
            );
            return Err(ClawLiteError::ChannelUnavailable {
                channel: self.channel.clone(),
                reason: "circuit open".into(),
            });
        }

        // 3/4. Attempt loop with per-attempt timeout, classification and
        //      jittered exponential backoff.
        let mut last_code = "provider_send_failed";
        for attempt in 1..=self.max_attempts {
            let started = Instant::now();
            let result = tokio::time::timeout(
                self.send_timeout,
                connector.send(chat_id, thread_id, text),
            )
            .await;
            let elapsed = started.elapsed().as_secs_f64();
            {
                let mut latency = self.latency.lock();
                latency.last = elapsed;
                latency.sum += elapsed;
                latency.count += 1;
            }

            match result {
                Ok(Ok(())) => {
                    self.breaker.lock().record_success();
                    self.sent_count.fetch_add(1, Ordering::Relaxed);
                    self.recent_sent
                        .lock()
                        .insert(idempotency_key.to_string(), Instant::now());
                    self.events.publish(Event::OutboundSent {
                        channel: self.channel.clone(),
                        account: self.account.clone(),
                        attempts: attempt,
                    });
                    return Ok(true);
                }
                Ok(Err(e)) => {
                    last_code = "provider_send_failed";
                    warn!(
                        channel = %self.channel,
                        attempt,
                        error = %e,
                        "outbound send failed"
                    );
                }
                Err(_) => {
                    last_code = "provider_timeout";
                    warn!(
                        channel = %self.channel,
                        attempt,
                        timeout_s = self.send_timeout.as_secs(),
                        "outbound send timed out"
                    );
                }
            }

            if attempt < self.max_attempts {
                tokio::time::sleep(backoff_duration(attempt, 30)).await;
            }
        }

        // 5. Exhausted: one breaker failure per delivery attempt series.
        self.breaker.lock().record_failure();
        self.failed_count.fetch_add(1, Ordering::Relaxed);
        self.events.publish(Event::OutboundFailed {
            channel: self.channel.clone(),
            code: last_code.into(),
            fallback: self.fallback_label(),
        });
        Err(ClawLiteError::ChannelUnavailable {
            channel: self.channel.clone(),
            reason: last_code.into(),
        })
    }

    pub fn fallback_channel(&self) -> Option<&str> {
        self.fallback_channel.as_deref()
    }
}

/// Exponential backoff with ±25% jitter: 1s, 2s, 4s, … capped at `max_secs`.
pub fn backoff_duration(consecutive_failures: u32, max_secs: u64) -> Duration {
    let base = 1u64
        .checked_shl(consecutive_failures.saturating_sub(1).min(6))
        .unwrap_or(max_secs);
    let capped = base.min(max_secs);
    let jitter_ms = (rand::random::<u64>() % (capped * 500 + 1)) as i64 - (capped as i64 * 250);
    let ms = (capped as i64 * 1000 + jitter_ms).max(100) as u64;
    Duration::from_millis(ms)
}
