//! Property-based tests for the linear backoff policy.
//!
//! Validates:
//! 1. Zero jitter: delay = min(base + attempt * increment, max)
//! 2. Delays never decrease with the attempt number (no jitter)
//! 3. Delays never exceed max_delay (no jitter)
//! 4. Jitter stays within ±jitter_percent of the linear delay
//! 5. Jittered delays never exceed max_delay
//! 6. Retry sessions exhaust after exactly max_attempts retries

use std::time::Duration;

use proptest::prelude::*;

use embellish_core::config::RetryConfig;
use embellish_core::retry::{BackoffPolicy, RetrySession};

// =============================================================================
// Strategies
// =============================================================================

fn arb_attempt() -> impl Strategy<Value = u32> {
    0_u32..100
}

fn arb_policy(jitter: f64) -> impl Strategy<Value = BackoffPolicy> {
    (1_u64..5_000, 0_u64..2_000, 1_u64..60_000, 0_u32..50)
        .prop_filter("max >= base", |(base, _, max, _)| max >= base)
        .prop_map(move |(base, step, max, attempts)| BackoffPolicy {
            base_delay: Duration::from_millis(base),
            increment: Duration::from_millis(step),
            max_delay: Duration::from_millis(max),
            max_attempts: attempts,
            jitter_percent: jitter,
        })
}

fn ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap()
}

// =============================================================================
// Property: Linear formula
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(500))]

    #[test]
    fn zero_jitter_matches_formula(policy in arb_policy(0.0), attempt in arb_attempt()) {
        let expected = (ms(policy.base_delay) + u64::from(attempt) * ms(policy.increment))
            .min(ms(policy.max_delay));
        prop_assert_eq!(ms(policy.delay_for_attempt(attempt)), expected);
    }

    #[test]
    fn delays_monotone_and_capped(policy in arb_policy(0.0), attempt in arb_attempt()) {
        let here = policy.delay_for_attempt(attempt);
        let next = policy.delay_for_attempt(attempt + 1);
        prop_assert!(next >= here);
        prop_assert!(next <= policy.max_delay);
    }

    #[test]
    fn jitter_bounded(policy in arb_policy(0.25), attempt in arb_attempt()) {
        let linear = BackoffPolicy { jitter_percent: 0.0, ..policy.clone() }.delay_for_attempt(attempt);
        let jittered = ms(policy.delay_for_attempt(attempt));
        let spread = (ms(linear) as f64 * 0.25).ceil() as u64;
        prop_assert!(jittered + spread + 1 >= ms(linear), "{jittered} too low for {linear:?}");
        prop_assert!(jittered <= ms(linear) + spread, "{jittered} too high for {linear:?}");
    }

    #[test]
    fn jitter_never_exceeds_cap(policy in arb_policy(0.5), attempt in arb_attempt()) {
        prop_assert!(policy.delay_for_attempt(attempt) <= policy.max_delay);
    }
}

// =============================================================================
// Property: Session budget
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    #[test]
    fn session_exhausts_after_budget(max_attempts in 0_u32..30) {
        let mut session = RetrySession::new(max_attempts);
        let mut retries = 0;
        while !session.exhausted() {
            session.attempt += 1;
            retries += 1;
        }
        prop_assert_eq!(retries, max_attempts);
    }

    #[test]
    fn config_jitter_is_clamped(jitter in -2.0_f64..3.0) {
        let policy = BackoffPolicy::from_config(&RetryConfig { jitter_percent: jitter, ..RetryConfig::default() });
        prop_assert!((0.0..=1.0).contains(&policy.jitter_percent));
    }
}
