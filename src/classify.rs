//! Error classification: raw executor message -> (category, type).
//!
//! Pure functions over two substring tables. Priority order matters:
//! explicit top-level signals are checked before the generic scans so a
//! message that happens to contain an `account`-looking phrase in its
//! detail text is not misclassified, and the `account` table is checked
//! before `infrastructure` so a permanent failure is never downgraded to
//! a retryable one.

use crate::ledger::ErrorCategory;

/// Emitted by executors that ran out of their step allowance. Checked
/// before the substring tables; the trailing detail text often names the
/// screen the run stopped on and must not influence classification.
pub const STEP_BUDGET_SIGNAL: &str = "step budget exhausted";

/// Permanent, subject-level failures. Never retried.
const ACCOUNT_PATTERNS: &[(&str, &str)] = &[
    ("suspended", "account_suspended"),
    ("banned", "account_banned"),
    ("verification required", "needs_verification"),
    ("verify your account", "needs_verification"),
    ("account locked", "account_locked"),
    ("logged out", "logged_out"),
    ("login required", "logged_out"),
    ("permanently rate limited", "rate_limited_permanent"),
];

/// Transient environment/dependency failures. Retried up to the
/// infrastructure ceiling.
const INFRA_PATTERNS: &[(&str, &str)] = &[
    ("connection timed out", "connection_timeout"),
    ("connection timeout", "connection_timeout"),
    ("connection refused", "connection_refused"),
    ("connection reset", "connection_reset"),
    ("broken pipe", "connection_reset"),
    ("crashed", "dependency_crashed"),
    ("not responding", "upstream_stuck"),
    ("device offline", "device_offline"),
    ("session expired", "session_expired"),
];

/// Classify a raw error message.
///
/// Unmatched messages come back as `(Unknown, "")` and are retryable by
/// policy, bounded by the unknown attempt ceiling.
pub fn classify(message: &str) -> (ErrorCategory, &'static str) {
    let lowered = message.to_lowercase();

    if lowered.starts_with(STEP_BUDGET_SIGNAL) {
        return (ErrorCategory::Unknown, "step_budget_exhausted");
    }

    for (pattern, error_type) in ACCOUNT_PATTERNS {
        if lowered.contains(pattern) {
            return (ErrorCategory::Account, error_type);
        }
    }
    for (pattern, error_type) in INFRA_PATTERNS {
        if lowered.contains(pattern) {
            return (ErrorCategory::Infrastructure, error_type);
        }
    }
    (ErrorCategory::Unknown, "")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_account_patterns_classify() {
        let (category, error_type) = classify("Account suspended pending review");
        assert_eq!(category, ErrorCategory::Account);
        assert_eq!(error_type, "account_suspended");

        let (category, _) = classify("You have been permanently rate limited");
        assert_eq!(category, ErrorCategory::Account);
    }

    #[test]
    fn test_infrastructure_patterns_classify() {
        let (category, error_type) = classify("connect to device: Connection timed out");
        assert_eq!(category, ErrorCategory::Infrastructure);
        assert_eq!(error_type, "connection_timeout");

        let (category, error_type) = classify("automation bridge crashed unexpectedly");
        assert_eq!(category, ErrorCategory::Infrastructure);
        assert_eq!(error_type, "dependency_crashed");
    }

    #[test]
    fn test_account_wins_over_infrastructure() {
        // Both tables match; the permanent category must win.
        let (category, _) = classify("session expired because account was suspended");
        assert_eq!(category, ErrorCategory::Account);
    }

    #[test]
    fn test_step_budget_signal_checked_first() {
        // Detail text mentions a banned-content screen but the run simply
        // ran out of steps; this must not classify as an account failure.
        let (category, error_type) =
            classify("step budget exhausted after 40 steps on 'content banned notice' screen");
        assert_eq!(category, ErrorCategory::Unknown);
        assert_eq!(error_type, "step_budget_exhausted");
    }

    #[test]
    fn test_unmatched_is_unknown() {
        let (category, error_type) = classify("something inexplicable happened");
        assert_eq!(category, ErrorCategory::Unknown);
        assert_eq!(error_type, "");
    }

    #[test]
    fn test_classification_is_case_insensitive() {
        let (category, _) = classify("ACCOUNT BANNED");
        assert_eq!(category, ErrorCategory::Account);
    }
}
