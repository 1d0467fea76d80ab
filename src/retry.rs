//! Retry engine (C4)
//!
//! Wraps a single-attempt sender in exponential-backoff retry with error
//! classification. Base delay 1s, multiplier 2, cap 5s, default 2 retries
//! (3 attempts total).

use crate::error::BrokerError;
use std::time::Duration;

const BASE_DELAY: Duration = Duration::from_secs(1);
const MAX_DELAY: Duration = Duration::from_secs(5);
const DEFAULT_RETRIES: u32 = 2;

/// Error classification used by the retry table below. `ExtensionError`
/// strings are pattern-matched; exact matching isn't required but these
/// predicates must all be covered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Timeout,
    Connection,
    TransientNetwork,
    Validation,
    Unknown,
}

impl ErrorClass {
    pub fn is_retryable(self) -> bool {
        !matches!(self, ErrorClass::Validation)
    }
}

/// Classifies an extension-reported error string per the table below.
pub fn classify_extension_error(message: &str) -> ErrorClass {
    let lower = message.to_lowercase();

    const VALIDATION_MARKERS: &[&str] = &[
        "invalid reference",
        "element not found",
        "selector invalid",
        "permission denied",
        "invalid parameter",
    ];
    if VALIDATION_MARKERS.iter().any(|m| lower.contains(m)) {
        return ErrorClass::Validation;
    }

    if lower.contains("deadline expired") || lower.contains("timeout") {
        return ErrorClass::Timeout;
    }

    if lower.contains("socket closed") || lower.contains("not yet connected") || lower.contains("connection") {
        return ErrorClass::Connection;
    }

    const TRANSIENT_MARKERS: &[&str] = &["network", "temporary", "busy", "rate limit"];
    if TRANSIENT_MARKERS.iter().any(|m| lower.contains(m)) {
        return ErrorClass::TransientNetwork;
    }

    ErrorClass::Unknown
}

/// Computes the backoff delay before retry attempt `attempt` (1-indexed:
/// the delay before the *second* attempt is `attempt = 1`).
pub fn backoff_delay(attempt: u32) -> Duration {
    let scaled = BASE_DELAY.saturating_mul(1u32 << attempt.min(16));
    scaled.min(MAX_DELAY)
}

/// Runs `make_attempt` up to `max_retries + 1` times, retrying only on
/// retryable failures and sleeping with exponential backoff between
/// attempts. Retries always use a fresh wire id — `make_attempt` is
/// responsible for that since it owns envelope construction.
pub async fn with_retry<F, Fut, T>(max_retries: u32, mut make_attempt: F) -> (Result<T, BrokerError>, u32)
where
    F: FnMut(u32) -> Fut,
    Fut: std::future::Future<Output = Result<T, BrokerError>>,
{
    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        match make_attempt(attempt).await {
            Ok(value) => return (Ok(value), attempt),
            Err(err) if !err.is_retryable() => return (Err(err), attempt),
            Err(err) => {
                if attempt > max_retries {
                    return (
                        Err(BrokerError::MaxRetriesExceeded {
                            attempts: attempt,
                            source: Box::new(err),
                        }),
                        attempt,
                    );
                }
                let delay = backoff_delay(attempt);
                tracing::debug!(attempt, ?delay, error = %err, "retrying after transient failure");
                tokio::time::sleep(delay).await;
            }
        }
    }
}

pub fn default_max_retries() -> u32 {
    DEFAULT_RETRIES
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_errors_are_never_retryable() {
        for msg in [
            "invalid reference: r3",
            "Element not found",
            "selector invalid: ###",
            "permission denied",
            "invalid parameter: timeout",
        ] {
            assert_eq!(classify_extension_error(msg), ErrorClass::Validation, "{msg}");
            assert!(!classify_extension_error(msg).is_retryable());
        }
    }

    #[test]
    fn known_retryable_classes_cover_the_table() {
        assert_eq!(classify_extension_error("deadline expired"), ErrorClass::Timeout);
        assert_eq!(classify_extension_error("socket closed"), ErrorClass::Connection);
        assert_eq!(classify_extension_error("network blip"), ErrorClass::TransientNetwork);
        assert_eq!(classify_extension_error("temporary failure"), ErrorClass::TransientNetwork);
        assert_eq!(classify_extension_error("server busy"), ErrorClass::TransientNetwork);
        assert_eq!(classify_extension_error("rate limit exceeded"), ErrorClass::TransientNetwork);
    }

    #[test]
    fn unknown_errors_default_to_retryable() {
        assert_eq!(classify_extension_error("something bizarre happened"), ErrorClass::Unknown);
        assert!(ErrorClass::Unknown.is_retryable());
    }

    #[test]
    fn backoff_is_exponential_and_capped() {
        assert_eq!(backoff_delay(0), Duration::from_secs(1));
        assert_eq!(backoff_delay(1), Duration::from_secs(2));
        assert_eq!(backoff_delay(2), Duration::from_secs(4));
        assert_eq!(backoff_delay(3), Duration::from_secs(5)); // capped
        assert_eq!(backoff_delay(10), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn retries_transient_failure_then_succeeds() {
        let attempts = std::sync::atomic::AtomicU32::new(0);
        let (result, attempt_count) = with_retry(2, |_attempt| {
            let attempts = &attempts;
            async move {
                let n = attempts.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                if n == 0 {
                    Err(BrokerError::ExtensionError("network timeout".into()))
                } else {
                    Ok(42)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempt_count, 2);
    }

    #[tokio::test]
    async fn non_retryable_error_fails_on_first_attempt() {
        let attempts = std::sync::atomic::AtomicU32::new(0);
        let (result, attempt_count) = with_retry(2, |_attempt| {
            let attempts = &attempts;
            async move {
                attempts.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                Err::<(), _>(BrokerError::ExtensionError("element not found".into()))
            }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(attempt_count, 1);
        assert_eq!(attempts.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhausted_retries_surface_max_retries_exceeded() {
        let (result, attempt_count) = with_retry(2, |_attempt| async { Err::<(), _>(BrokerError::MessageTimeout) }).await;
        assert!(matches!(result, Err(BrokerError::MaxRetriesExceeded { attempts: 3, .. })));
        assert_eq!(attempt_count, 3);
    }
}
