use serde::Serialize;

use crate::outbound::{CircuitState, OutboundMetrics};

/// Per-check severity. Channel health is the worst of its checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthLevel {
    Ok,
    Warning,
    Error,
}

impl HealthLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthLevel::Ok => "ok",
            HealthLevel::Warning => "warning",
            HealthLevel::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthCheck {
    pub id: &'static str,
    pub label: &'static str,
    pub value: f64,
    pub warning_gt: f64,
    pub error_gt: f64,
    pub level: HealthLevel,
}

#[derive(Debug, Clone, Serialize)]
pub struct OutboundHealth {
    pub level: HealthLevel,
    pub checks: Vec<HealthCheck>,
}

fn threshold_check(
    id: &'static str,
    label: &'static str,
    value: f64,
    warning_gt: f64,
    error_gt: f64,
) -> HealthCheck {
    let level = if value > error_gt {
        HealthLevel::Error
    } else if value > warning_gt {
        HealthLevel::Warning
    } else {
        HealthLevel::Ok
    };
    HealthCheck {
        id,
        label,
        value,
        warning_gt,
        error_gt,
        level,
    }
}

/// Evaluate outbound health from a metrics snapshot.
///
/// Thresholds (value > warning / value > error):
/// - send latency (last or avg, whichever is worse): 5 s / 15 s
/// - consecutive failures: 3 / 5
/// - circuit blocked sends: 1 / 5
/// - cooldown remaining while open: 5 s / 15 s (an open circuit is at
///   least a warning even with a short cooldown; half-open is a warning)
pub fn evaluate_outbound_health(metrics: &OutboundMetrics) -> OutboundHealth {
    let mut checks = Vec::new();

    let latency = metrics
        .last_attempt_latency_s
        .max(metrics.avg_attempt_latency_s);
    checks.push(threshold_check("latency", "send latency (s)", latency, 5.0, 15.0));

    checks.push(threshold_check(
        "consecutive_failures",
        "consecutive failures",
        metrics.circuit_consecutive_failures as f64,
        3.0,
        5.0,
    ));

    checks.push(threshold_check(
        "circuit_blocked",
        "circuit blocked sends",
        metrics.circuit_blocked_count as f64,
        1.0,
        5.0,
    ));

    match metrics.circuit_state {
        CircuitState::Open => {
            let mut check = threshold_check(
                "circuit_open_cooldown",
                "circuit open cooldown (s)",
                metrics.circuit_cooldown_remaining_s,
                5.0,
                15.0,
            );
            if check.level == HealthLevel::Ok {
                check.level = HealthLevel::Warning;
            }
            checks.push(check);
        }
        CircuitState::HalfOpen => {
            checks.push(HealthCheck {
                id: "circuit_half_open",
                label: "circuit half-open",
                value: 1.0,
                warning_gt: 0.0,
                error_gt: f64::MAX,
                level: HealthLevel::Warning,
            });
        }
        CircuitState::Closed => {}
    }

    let level = checks
        .iter()
        .map(|c| c.level)
        .max()
        .unwrap_or(HealthLevel::Ok);
    OutboundHealth { level, checks }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metrics() -> OutboundMetrics {
        OutboundMetrics {
            circuit_state: CircuitState::Closed,
            circuit_consecutive_failures: 0,
            circuit_blocked_count: 0,
            circuit_cooldown_remaining_s: 0.0,
            sent_count: 0,
            failed_count: 0,
            last_attempt_latency_s: 0.0,
            avg_attempt_latency_s: 0.0,
        }
    }

    #[test]
    fn healthy_metrics_are_ok() {
        assert_eq!(evaluate_outbound_health(&metrics()).level, HealthLevel::Ok);
    }

    #[test]
    fn latency_thresholds() {
        let mut m = metrics();
        m.last_attempt_latency_s = 6.0;
        assert_eq!(evaluate_outbound_health(&m).level, HealthLevel::Warning);
        m.last_attempt_latency_s = 16.0;
        assert_eq!(evaluate_outbound_health(&m).level, HealthLevel::Error);
        // Average counts too
        let mut m = metrics();
        m.avg_attempt_latency_s = 20.0;
        assert_eq!(evaluate_outbound_health(&m).level, HealthLevel::Error);
    }

    #[test]
    fn failure_thresholds_are_strict_greater_than() {
        let mut m = metrics();
        m.circuit_consecutive_failures = 3;
        assert_eq!(evaluate_outbound_health(&m).level, HealthLevel::Ok);
        m.circuit_consecutive_failures = 4;
        assert_eq!(evaluate_outbound_health(&m).level, HealthLevel::Warning);
        m.circuit_consecutive_failures = 6;
        assert_eq!(evaluate_outbound_health(&m).level, HealthLevel::Error);
    }

    #[test]
    fn blocked_sends_thresholds() {
        let mut m = metrics();
        m.circuit_blocked_count = 2;
        assert_eq!(evaluate_outbound_health(&m).level, HealthLevel::Warning);
        m.circuit_blocked_count = 6;
        assert_eq!(evaluate_outbound_health(&m).level, HealthLevel::Error);
    }

    #[test]
    fn open_circuit_is_at_least_warning() {
        let mut m = metrics();
        m.circuit_state = CircuitState::Open;
        m.circuit_cooldown_remaining_s = 1.0; // below the warning threshold
        assert_eq!(evaluate_outbound_health(&m).level, HealthLevel::Warning);
        m.circuit_cooldown_remaining_s = 20.0;
        assert_eq!(evaluate_outbound_health(&m).level, HealthLevel::Error);
    }

    #[test]
    fn half_open_is_warning() {
        let mut m = metrics();
        m.circuit_state = CircuitState::HalfOpen;
        assert_eq!(evaluate_outbound_health(&m).level, HealthLevel::Warning);
    }

    #[test]
    fn worst_check_wins() {
        let mut m = metrics();
        m.last_attempt_latency_s = 6.0; // warning
        m.circuit_consecutive_failures = 6; // error
        let health = evaluate_outbound_health(&m);
        assert_eq!(health.level, HealthLevel::Error);
        assert!(health.checks.len() >= 3);
    }
}
