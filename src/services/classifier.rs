//! Upstream error classification.
//!
//! Maps raw upstream failures (status codes and message text) onto the
//! four outcome classes the breakers and the failover loop consume. The
//! rules are ordered: transport-level and 5xx failures are transient,
//! client mistakes are non-retryable, 429 and generic server errors are
//! retryable, and anything else falls through to unknown.

use crate::models::error::{ErrorClass, UpstreamError};
use once_cell::sync::Lazy;
use regex::RegexSet;

static TRANSIENT_PATTERNS: Lazy<RegexSet> = Lazy::new(|| {
    RegexSet::new([
        r"(?i)connection (refused|reset|closed|aborted)",
        r"(?i)timed? ?out",
        r"(?i)broken pipe",
        r"(?i)dns (error|failure)",
        r"(?i)name resolution",
        r"(?i)no route to host",
        r"(?i)network (unreachable|error)",
        r"(?i)tls handshake",
        r"(?i)bad gateway",
        r"(?i)service unavailable",
        r"(?i)gateway timeout",
    ])
    .expect("transient classifier patterns are valid")
});

static NON_RETRYABLE_PATTERNS: Lazy<RegexSet> = Lazy::new(|| {
    RegexSet::new([
        r"(?i)not found",
        r"(?i)unauthori[sz]ed",
        r"(?i)forbidden",
        r"(?i)invalid (argument|request|model|parameter)",
        r"(?i)bad request",
        r"(?i)unsupported",
        r"(?i)malformed",
    ])
    .expect("non-retryable classifier patterns are valid")
});

static RETRYABLE_PATTERNS: Lazy<RegexSet> = Lazy::new(|| {
    RegexSet::new([r"(?i)too many requests", r"(?i)rate limit", r"(?i)server error"])
        .expect("retryable classifier patterns are valid")
});

/// Classifies an HTTP status code.
///
/// # Examples
///
/// ```rust
/// use corral::models::error::ErrorClass;
/// use corral::services::classifier::classify_status;
///
/// assert_eq!(classify_status(503), ErrorClass::Transient);
/// assert_eq!(classify_status(429), ErrorClass::Retryable);
/// assert_eq!(classify_status(404), ErrorClass::NonRetryable);
/// ```
pub fn classify_status(status: u16) -> ErrorClass {
    match status {
        502 | 503 | 504 => ErrorClass::Transient,
        429 => ErrorClass::Retryable,
        500..=599 => ErrorClass::Retryable,
        400..=499 => ErrorClass::NonRetryable,
        _ => ErrorClass::Unknown,
    }
}

/// Classifies an error message by pattern.
pub fn classify_message(message: &str) -> ErrorClass {
    if TRANSIENT_PATTERNS.is_match(message) {
        ErrorClass::Transient
    } else if NON_RETRYABLE_PATTERNS.is_match(message) {
        ErrorClass::NonRetryable
    } else if RETRYABLE_PATTERNS.is_match(message) {
        ErrorClass::Retryable
    } else {
        ErrorClass::Unknown
    }
}

/// Classifies an upstream failure.
///
/// The status code wins when it yields a definite class; the message text
/// is the fallback for transport failures that never produced a response.
pub fn classify(error: &UpstreamError) -> ErrorClass {
    if let Some(status) = error.status {
        let class = classify_status(status);
        if class != ErrorClass::Unknown {
            return class;
        }
    }

    classify_message(&error.message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_failures_are_transient() {
        assert_eq!(classify_message("connection refused"), ErrorClass::Transient);
        assert_eq!(classify_message("operation timed out"), ErrorClass::Transient);
        assert_eq!(classify_message("Connection reset by peer"), ErrorClass::Transient);
    }

    #[test]
    fn client_mistakes_are_non_retryable() {
        assert_eq!(classify_message("model not found"), ErrorClass::NonRetryable);
        assert_eq!(classify_message("Unauthorized"), ErrorClass::NonRetryable);
        assert_eq!(classify_message("invalid argument: top_k"), ErrorClass::NonRetryable);
    }

    #[test]
    fn rate_limits_are_retryable() {
        assert_eq!(classify_status(429), ErrorClass::Retryable);
        assert_eq!(classify_message("rate limit exceeded"), ErrorClass::Retryable);
    }

    #[test]
    fn unmatched_text_is_unknown() {
        assert_eq!(classify_message("something odd happened"), ErrorClass::Unknown);
    }

    #[test]
    fn status_takes_precedence_over_message() {
        let err = UpstreamError::with_status("weird message", 503);
        assert_eq!(classify(&err), ErrorClass::Transient);
    }

    #[test]
    fn message_is_fallback_without_status() {
        let err = UpstreamError::new("connection refused");
        assert_eq!(classify(&err), ErrorClass::Transient);
    }
}
