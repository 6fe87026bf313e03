use std::collections::BTreeMap;
use std::time::{Duration, SystemTime};

use http::header::{CONTENT_TYPE, LOCATION};
use http::{HeaderMap, StatusCode};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::util::parse_retry_after;

/// The structured error envelope servers use to describe failures.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SerializableError {
    pub error_code: String,
    pub error_name: String,
    #[serde(default)]
    pub error_instance_id: String,
    #[serde(default)]
    pub parameters: BTreeMap<String, serde_json::Value>,
}

impl std::fmt::Display for SerializableError {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(formatter, "{} ({})", self.error_name, self.error_code)?;
        if !self.error_instance_id.is_empty() {
            write!(formatter, " instance {}", self.error_instance_id)?;
        }
        Ok(())
    }
}

/// Exactly one classification per inspected response.
#[derive(Debug)]
pub(crate) enum Classification {
    Success,
    RetryOther { location: Url },
    Throttle { retry_after: Option<Duration> },
    Unavailable,
    Remote { error: SerializableError },
    UnknownRemote,
}

/// Maps a response to its classification. The body must already be buffered;
/// every rule reads the same bytes. QoS statuses take priority over the
/// error envelope, and anything unparseable falls through to
/// `UnknownRemote`.
pub(crate) fn classify_response(
    status: StatusCode,
    headers: &HeaderMap,
    body: &[u8],
    now: SystemTime,
    known_base: impl Fn(&Url) -> bool,
) -> Classification {
    if status.as_u16() / 100 <= 2 {
        return Classification::Success;
    }

    match status {
        StatusCode::PERMANENT_REDIRECT => {
            // A 308 pointing outside the configured bases is not a QoS
            // signal; it falls through to the terminal catch-all.
            if let Some(location) = redirect_location(headers)
                && known_base(&location)
            {
                return Classification::RetryOther { location };
            }
        }
        StatusCode::TOO_MANY_REQUESTS => {
            return Classification::Throttle {
                retry_after: parse_retry_after(headers, now),
            };
        }
        StatusCode::SERVICE_UNAVAILABLE => {
            return Classification::Unavailable;
        }
        _ => {}
    }

    if has_json_content_type(headers)
        && let Ok(error) = serde_json::from_slice::<SerializableError>(body)
    {
        return Classification::Remote { error };
    }

    Classification::UnknownRemote
}

fn redirect_location(headers: &HeaderMap) -> Option<Url> {
    let location = headers.get(LOCATION)?.to_str().ok()?;
    Url::parse(location).ok()
}

fn has_json_content_type(headers: &HeaderMap) -> bool {
    headers
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.to_ascii_lowercase().contains("json"))
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, SystemTime};

    use http::{HeaderMap, HeaderValue, StatusCode};
    use url::Url;

    use super::{Classification, classify_response};

    fn known_base(url: &Url) -> bool {
        url.host_str() == Some("b.test")
    }

    fn classify(status: StatusCode, headers: &HeaderMap, body: &[u8]) -> Classification {
        classify_response(status, headers, body, SystemTime::UNIX_EPOCH, known_base)
    }

    #[test]
    fn informational_and_success_statuses_are_success() {
        let headers = HeaderMap::new();
        assert!(matches!(
            classify(StatusCode::OK, &headers, b""),
            Classification::Success
        ));
        assert!(matches!(
            classify(StatusCode::CONTINUE, &headers, b""),
            Classification::Success
        ));
        assert!(matches!(
            classify(StatusCode::NO_CONTENT, &headers, b""),
            Classification::Success
        ));
    }

    #[test]
    fn permanent_redirect_to_known_base_is_retry_other() {
        let mut headers = HeaderMap::new();
        headers.insert(
            http::header::LOCATION,
            HeaderValue::from_static("https://b.test/x"),
        );
        match classify(StatusCode::PERMANENT_REDIRECT, &headers, b"") {
            Classification::RetryOther { location } => {
                assert_eq!(location.as_str(), "https://b.test/x");
            }
            other => panic!("unexpected classification: {other:?}"),
        }
    }

    #[test]
    fn permanent_redirect_to_unknown_base_is_unknown_remote() {
        let mut headers = HeaderMap::new();
        headers.insert(
            http::header::LOCATION,
            HeaderValue::from_static("https://evil.test/x"),
        );
        assert!(matches!(
            classify(StatusCode::PERMANENT_REDIRECT, &headers, b""),
            Classification::UnknownRemote
        ));
    }

    #[test]
    fn permanent_redirect_without_location_is_unknown_remote() {
        let headers = HeaderMap::new();
        assert!(matches!(
            classify(StatusCode::PERMANENT_REDIRECT, &headers, b""),
            Classification::UnknownRemote
        ));
    }

    #[test]
    fn too_many_requests_carries_retry_after() {
        let mut headers = HeaderMap::new();
        headers.insert(http::header::RETRY_AFTER, HeaderValue::from_static("2"));
        match classify(StatusCode::TOO_MANY_REQUESTS, &headers, b"") {
            Classification::Throttle { retry_after } => {
                assert_eq!(retry_after, Some(Duration::from_secs(2)));
            }
            other => panic!("unexpected classification: {other:?}"),
        }
    }

    #[test]
    fn malformed_retry_after_falls_back_to_none() {
        let mut headers = HeaderMap::new();
        headers.insert(
            http::header::RETRY_AFTER,
            HeaderValue::from_static("whenever"),
        );
        match classify(StatusCode::TOO_MANY_REQUESTS, &headers, b"") {
            Classification::Throttle { retry_after } => assert_eq!(retry_after, None),
            other => panic!("unexpected classification: {other:?}"),
        }
    }

    #[test]
    fn service_unavailable_is_unavailable() {
        let headers = HeaderMap::new();
        assert!(matches!(
            classify(StatusCode::SERVICE_UNAVAILABLE, &headers, b""),
            Classification::Unavailable
        ));
    }

    #[test]
    fn json_error_envelope_is_remote() {
        let mut headers = HeaderMap::new();
        headers.insert(
            http::header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        let body = br#"{
            "errorCode": "CONFLICT",
            "errorName": "Default:Conflict",
            "errorInstanceId": "1234",
            "parameters": {"key": "value"}
        }"#;
        match classify(StatusCode::CONFLICT, &headers, body) {
            Classification::Remote { error } => {
                assert_eq!(error.error_code, "CONFLICT");
                assert_eq!(error.error_name, "Default:Conflict");
                assert_eq!(error.error_instance_id, "1234");
            }
            other => panic!("unexpected classification: {other:?}"),
        }
    }

    #[test]
    fn unparseable_envelope_falls_through_to_unknown_remote() {
        let mut headers = HeaderMap::new();
        headers.insert(
            http::header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        assert!(matches!(
            classify(StatusCode::INTERNAL_SERVER_ERROR, &headers, b"not json"),
            Classification::UnknownRemote
        ));
    }

    #[test]
    fn non_json_error_body_is_unknown_remote() {
        let mut headers = HeaderMap::new();
        headers.insert(
            http::header::CONTENT_TYPE,
            HeaderValue::from_static("text/html"),
        );
        assert!(matches!(
            classify(StatusCode::BAD_GATEWAY, &headers, b"<html>oops</html>"),
            Classification::UnknownRemote
        ));
    }
}
