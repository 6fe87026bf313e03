use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use http::HeaderMap;
use http::header::RETRY_AFTER;

const MAX_ERROR_BODY_LEN: usize = 2048;

pub(crate) fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Parses a `Retry-After` header as either delta-seconds or an RFC 7231
/// HTTP-date. Malformed values yield `None` so callers fall back to backoff.
pub(crate) fn parse_retry_after(headers: &HeaderMap, now: SystemTime) -> Option<Duration> {
    let value = headers.get(RETRY_AFTER)?;
    let raw_value = value.to_str().ok()?.trim();
    if let Ok(seconds) = raw_value.parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }

    let date = httpdate::parse_http_date(raw_value).ok()?;
    match date.duration_since(now) {
        Ok(duration) => Some(duration),
        Err(_) => Some(Duration::ZERO),
    }
}

pub(crate) fn truncate_body(body: &[u8]) -> String {
    let text = String::from_utf8_lossy(body);
    if text.chars().count() <= MAX_ERROR_BODY_LEN {
        return text.into_owned();
    }

    let truncated: String = text.chars().take(MAX_ERROR_BODY_LEN).collect();
    format!("{truncated}...(truncated)")
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, SystemTime};

    use http::HeaderValue;

    use super::{parse_retry_after, truncate_body};

    #[test]
    fn parse_retry_after_delta_seconds() {
        let mut headers = http::HeaderMap::new();
        headers.insert(http::header::RETRY_AFTER, HeaderValue::from_static("5"));
        assert_eq!(
            parse_retry_after(&headers, SystemTime::UNIX_EPOCH),
            Some(Duration::from_secs(5))
        );
    }

    #[test]
    fn parse_retry_after_http_date() {
        let now = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000_000);
        let retry_at = now + Duration::from_secs(30);
        let mut headers = http::HeaderMap::new();
        let retry_at_text = httpdate::fmt_http_date(retry_at);
        headers.insert(
            http::header::RETRY_AFTER,
            HeaderValue::from_str(&retry_at_text).expect("valid retry-after date"),
        );
        assert_eq!(
            parse_retry_after(&headers, now),
            Some(Duration::from_secs(30))
        );
    }

    #[test]
    fn parse_retry_after_past_date_clamps_to_zero() {
        let now = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000_000);
        let retry_at = now - Duration::from_secs(30);
        let mut headers = http::HeaderMap::new();
        let retry_at_text = httpdate::fmt_http_date(retry_at);
        headers.insert(
            http::header::RETRY_AFTER,
            HeaderValue::from_str(&retry_at_text).expect("valid retry-after date"),
        );
        assert_eq!(parse_retry_after(&headers, now), Some(Duration::ZERO));
    }

    #[test]
    fn parse_retry_after_malformed_is_none() {
        let mut headers = http::HeaderMap::new();
        headers.insert(
            http::header::RETRY_AFTER,
            HeaderValue::from_static("soonish"),
        );
        assert_eq!(parse_retry_after(&headers, SystemTime::UNIX_EPOCH), None);
    }

    #[test]
    fn truncate_body_keeps_short_bodies() {
        assert_eq!(truncate_body(b"short"), "short");
    }

    #[test]
    fn truncate_body_truncates_long_bodies() {
        let long = "x".repeat(5000);
        let truncated = truncate_body(long.as_bytes());
        assert!(truncated.ends_with("...(truncated)"));
        assert!(truncated.len() < long.len());
    }
}
