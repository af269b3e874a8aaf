//! Decay scoring: pure functions, no I/O.
//!
//! A node's decay score grows from 0.0 toward 1.0 as time passes without
//! access. The curve's half-life is the configured base scaled by stability,
//! and the rate is slowed further for important nodes:
//!
//! ```text
//! half_life     = base * (stability / 3.0)
//! lambda        = ln(2) / half_life
//! adjusted_rate = lambda * (6 - importance) / 5.0
//! decay_score   = 1 - exp(-adjusted_rate * days_since_access)
//! ```
//!
//! Recomputation is idempotent: the score is a pure function of the config
//! and the node's scores and access age.

use chrono::{DateTime, Utc};

const SECONDS_PER_DAY: f64 = 86_400.0;

/// Compute the decay score for a node, clamped to [0.0, 1.0].
///
/// Negative `days_since_access` is treated as 0. A zero stability or a
/// non-positive half-life yields 0.0.
pub fn decay_score(
    base_half_life_days: f64,
    importance: u8,
    stability: u8,
    days_since_access: f64,
) -> f64 {
    if stability == 0 {
        return 0.0;
    }
    let half_life = base_half_life_days * (f64::from(stability) / 3.0);
    if half_life <= 0.0 || !half_life.is_finite() {
        return 0.0;
    }

    let days = days_since_access.max(0.0);
    let lambda = std::f64::consts::LN_2 / half_life;
    let adjusted_rate = lambda * f64::from(6 - importance.min(5)) / 5.0;

    (1.0 - (-adjusted_rate * days).exp()).clamp(0.0, 1.0)
}

/// Days since a node was last touched.
///
/// Falls back from `last_accessed_at` to `created_at` to 0. Graph-side
/// updates express the same three branches inside the query text so NULL
/// attributes never reach arithmetic (see `storage::cypher`).
pub fn days_since_access(
    now: DateTime<Utc>,
    last_accessed_at: Option<DateTime<Utc>>,
    created_at: Option<DateTime<Utc>>,
) -> f64 {
    let anchor = match last_accessed_at.or(created_at) {
        Some(ts) => ts,
        None => return 0.0,
    };
    let days = (now - anchor).num_seconds() as f64 / SECONDS_PER_DAY;
    days.max(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_zero_days_zero_decay() {
        assert_eq!(decay_score(180.0, 3, 3, 0.0), 0.0);
    }

    #[test]
    fn test_default_half_life_two_days() {
        // base 180, importance 3, stability 3, 2 days since access:
        // half_life = 180, lambda = ln2/180, rate = lambda * 3/5
        // decay = 1 - exp(-rate * 2) ≈ 0.0046
        let score = decay_score(180.0, 3, 3, 2.0);
        assert!((score - 0.0046).abs() < 0.0005, "got {score}");
    }

    #[test]
    fn test_short_half_life_two_days() {
        // The same node under a 30-day half-life decays ~6x faster; a
        // regression here means the base default leaked back to 30.
        let score = decay_score(30.0, 3, 3, 2.0);
        assert!((score - 0.027).abs() < 0.001, "got {score}");
    }

    #[test]
    fn test_clamped_to_unit_interval() {
        let score = decay_score(1.0, 1, 1, 100_000.0);
        assert!(score <= 1.0);
        assert!(score >= 0.0);
        assert!((score - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_negative_days_treated_as_zero() {
        assert_eq!(decay_score(180.0, 3, 3, -5.0), 0.0);
    }

    #[test]
    fn test_zero_stability_defensive() {
        assert_eq!(decay_score(180.0, 3, 0, 365.0), 0.0);
    }

    #[test]
    fn test_non_positive_half_life_defensive() {
        assert_eq!(decay_score(0.0, 3, 3, 365.0), 0.0);
        assert_eq!(decay_score(-180.0, 3, 3, 365.0), 0.0);
    }

    #[test]
    fn test_importance_slows_decay() {
        // importance 5 → rate = lambda/5; importance 1 → rate = lambda
        let slow = decay_score(180.0, 5, 3, 90.0);
        let fast = decay_score(180.0, 1, 3, 90.0);
        assert!(slow < fast, "slow={slow} fast={fast}");
        // Exactly a 5x rate ratio at the exponent level
        let lambda = std::f64::consts::LN_2 / 180.0;
        assert!((slow - (1.0 - (-lambda / 5.0 * 90.0).exp())).abs() < 1e-12);
        assert!((fast - (1.0 - (-lambda * 90.0).exp())).abs() < 1e-12);
    }

    #[test]
    fn test_stability_stretches_half_life() {
        // stability 5 stretches the half-life to base * 5/3
        let stable = decay_score(180.0, 3, 5, 90.0);
        let volatile = decay_score(180.0, 3, 1, 90.0);
        assert!(stable < volatile);
    }

    #[test]
    fn test_monotonic_in_days() {
        let mut prev = 0.0;
        for days in [0.0, 1.0, 10.0, 100.0, 1000.0] {
            let score = decay_score(180.0, 3, 3, days);
            assert!(score >= prev);
            prev = score;
        }
    }

    #[test]
    fn test_recomputation_idempotent() {
        let a = decay_score(180.0, 2, 4, 42.5);
        let b = decay_score(180.0, 2, 4, 42.5);
        assert_eq!(a, b);
    }

    #[test]
    fn test_days_since_access_prefers_last_accessed() {
        let now = Utc::now();
        let accessed = now - Duration::days(3);
        let created = now - Duration::days(30);
        let days = days_since_access(now, Some(accessed), Some(created));
        assert!((days - 3.0).abs() < 0.001);
    }

    #[test]
    fn test_days_since_access_falls_back_to_created() {
        let now = Utc::now();
        let created = now - Duration::days(30);
        let days = days_since_access(now, None, Some(created));
        assert!((days - 30.0).abs() < 0.001);
    }

    #[test]
    fn test_days_since_access_no_timestamps() {
        assert_eq!(days_since_access(Utc::now(), None, None), 0.0);
    }

    #[test]
    fn test_days_since_access_future_timestamp_clamped() {
        let now = Utc::now();
        let future = now + Duration::days(2);
        assert_eq!(days_since_access(now, Some(future), None), 0.0);
    }
}
