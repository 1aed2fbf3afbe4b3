use crate::types::{AnomalyThresholds, AnomalyVector, BlockReason, MetricBreach, Period};
use tracing::warn;

/// Fraction of a threshold at which a metric is flagged as "near" for
/// observability. Advisory only; never part of the gating decision.
const NEAR_THRESHOLD_RATIO: f64 = 0.8;

/// Outcome of evaluating a closing period.
#[derive(Debug, Clone, PartialEq)]
pub enum TransitionDecision {
    Blocked(BlockReason),
    Ready,
}

/// Compute the `CLOSING -> *` transition. The transition is computed,
/// never chosen: any anomaly breach blocks, then the discrepancy check
/// runs, then the period is release-ready.
pub fn evaluate_transition(period: &Period) -> TransitionDecision {
    let breaches = anomaly_breaches(&period.anomaly_vector, &period.thresholds);
    if !breaches.is_empty() {
        return TransitionDecision::Blocked(BlockReason::Anomaly { breaches });
    }

    warn_near_thresholds(&period.key.to_string(), &period.anomaly_vector, &period.thresholds);

    let epsilon = (period.final_liability_cents - period.credited_to_owa_cents).abs();
    if epsilon > period.thresholds.epsilon_cents {
        return TransitionDecision::Blocked(BlockReason::Discrepancy {
            epsilon_cents: epsilon,
            threshold_cents: period.thresholds.epsilon_cents,
        });
    }

    TransitionDecision::Ready
}

/// Per-metric breach check: observed strictly above threshold breaches.
/// `delta_vs_baseline` is compared by magnitude.
pub fn anomaly_breaches(
    observed: &AnomalyVector,
    thresholds: &AnomalyThresholds,
) -> Vec<MetricBreach> {
    let metrics = [
        ("variance_ratio", observed.variance_ratio, thresholds.variance_ratio),
        ("dup_rate", observed.dup_rate, thresholds.dup_rate),
        ("gap_minutes", observed.gap_minutes, thresholds.gap_minutes),
        (
            "delta_vs_baseline",
            observed.delta_vs_baseline.abs(),
            thresholds.delta_vs_baseline,
        ),
    ];

    metrics
        .into_iter()
        .filter(|(_, value, ceiling)| value > ceiling)
        .map(|(metric, observed, threshold)| MetricBreach {
            metric: metric.to_string(),
            observed,
            threshold,
        })
        .collect()
}

fn warn_near_thresholds(period: &str, observed: &AnomalyVector, thresholds: &AnomalyThresholds) {
    let metrics = [
        ("variance_ratio", observed.variance_ratio, thresholds.variance_ratio),
        ("dup_rate", observed.dup_rate, thresholds.dup_rate),
        ("gap_minutes", observed.gap_minutes, thresholds.gap_minutes),
        (
            "delta_vs_baseline",
            observed.delta_vs_baseline.abs(),
            thresholds.delta_vs_baseline,
        ),
    ];
    for (metric, value, ceiling) in metrics {
        if value <= ceiling && ceiling > 0.0 && value >= ceiling * NEAR_THRESHOLD_RATIO {
            warn!(period, metric, observed = value, threshold = ceiling, "anomaly metric near threshold");
        }
    }
}
