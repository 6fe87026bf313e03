use std::time::Duration;

use bytes::Bytes;
use http::Method;
use tracing::{debug, info};
use url::Url;

use crate::backoff::ExponentialBackoff;
use crate::body::{RawBody, RequestBody, buffer_raw_body, buffered_raw_body, empty_raw_body};
use crate::classify::{Classification, classify_response};
use crate::client::{CallHandle, ClientShared};
use crate::config::{NodeSelectionStrategy, RetryOnSocketException, RetryOnTimeout, ServerQos};
use crate::error::Error;
use crate::request::Request;
use crate::response::{Response, ResponseBody};
use crate::transport::{IoError, IoErrorKind, TransportRequest};
use crate::util::truncate_body;

/// Drives one logical call through attempts until a single terminal outcome.
///
/// Each suspension point — credit acquisition, dispatch, body buffering, the
/// backoff timer — selects against the call's cancel flag with cancellation
/// first, so a cancel that races a completing future wins and the losing
/// future (and any response body it carried) is dropped. Exactly one permit
/// is held per attempt and released before the caller observes the outcome.
pub(crate) async fn execute_call(
    shared: &ClientShared,
    request: Request,
    handle: &CallHandle,
) -> Result<Response, Error> {
    let (method, original_url, headers, request_body) = request.into_parts();
    let one_shot = request_body.is_one_shot();
    let mut body = BodySource::new(request_body);
    let mut backoff = ExponentialBackoff::new(shared.max_num_retries, shared.backoff_slot_size);
    let mut remaining_relocations = shared.max_num_relocations;
    let mut last_io_error: Option<IoError> = None;
    let mut attempt = 0_usize;

    if matches!(
        shared.node_selection_strategy,
        NodeSelectionStrategy::RoundRobin
    ) {
        shared.selector.advance();
    }
    // A request that cannot be rooted under any configured base has no valid
    // target; it is rejected before any attempt is dispatched.
    let mut current_url = shared
        .selector
        .redirect_to_current(&original_url)
        .ok_or_else(|| Error::InvalidUri {
            uri: original_url.to_string(),
        })?;

    loop {
        attempt += 1;
        if handle.is_cancelled() {
            return Err(cancelled(&method, &current_url));
        }

        let limiter = shared.limiters.limiter_for(&current_url);
        let permit = tokio::select! {
            biased;
            _ = handle.cancelled() => return Err(cancelled(&method, &current_url)),
            permit = limiter.acquire() => permit,
        };

        debug!(attempt, url = %current_url, method = %method, "dispatching attempt");
        let outcome = {
            let send = shared.transport.send(TransportRequest {
                method: method.clone(),
                url: current_url.clone(),
                headers: headers.clone(),
                body: body.take_for_dispatch(),
            });
            tokio::select! {
                biased;
                _ = handle.cancelled() => {
                    permit.on_ignore();
                    return Err(cancelled(&method, &current_url));
                }
                outcome = send => outcome,
            }
        };

        let response = match outcome {
            Ok(response) => response,
            Err(io_error) => {
                shared.selector.mark_as_failed(&current_url);
                permit.on_ignore();
                info!(
                    attempt,
                    url = %current_url,
                    kind = %io_error.kind(),
                    error = %io_error,
                    "attempt failed with io error"
                );
                let (next_url, delay) = plan_io_retry(
                    shared,
                    &mut backoff,
                    &mut remaining_relocations,
                    one_shot,
                    &method,
                    &current_url,
                    attempt,
                    io_error,
                    &mut last_io_error,
                )?;
                info!(
                    backoff_ms = delay.as_millis() as u64,
                    retry_url = %next_url,
                    "retrying call after failure"
                );
                current_url = next_url;
                sleep_or_cancel(handle, delay, &method, &current_url).await?;
                continue;
            }
        };

        shared.selector.mark_as_succeeded(&current_url);
        let status = response.status;
        if status.as_u16() / 100 <= 2 {
            permit.on_success();
            debug!(attempt, status = status.as_u16(), "request completed");
            return Ok(Response::new(
                status,
                response.headers,
                ResponseBody::Streaming(response.body),
            ));
        }

        // The body is inspected by more than one classification rule, so it
        // is buffered (consuming and closing the stream) exactly once.
        let response_headers = response.headers;
        let buffered = tokio::select! {
            biased;
            _ = handle.cancelled() => {
                permit.on_ignore();
                return Err(cancelled(&method, &current_url));
            }
            buffered = buffer_raw_body(response.body) => buffered,
        };
        let body_bytes = match buffered {
            Ok(bytes) => bytes,
            Err(io_error) => {
                shared.selector.mark_as_failed(&current_url);
                permit.on_ignore();
                info!(
                    attempt,
                    url = %current_url,
                    error = %io_error,
                    "failed to buffer response body"
                );
                let (next_url, delay) = plan_io_retry(
                    shared,
                    &mut backoff,
                    &mut remaining_relocations,
                    one_shot,
                    &method,
                    &current_url,
                    attempt,
                    io_error,
                    &mut last_io_error,
                )?;
                current_url = next_url;
                sleep_or_cancel(handle, delay, &method, &current_url).await?;
                continue;
            }
        };

        let classification = classify_response(
            status,
            &response_headers,
            &body_bytes,
            shared.clock.now_system(),
            |url: &Url| shared.selector.is_known_base(url),
        );

        match classification {
            Classification::Success => {
                permit.on_success();
                return Ok(Response::new(
                    status,
                    response_headers,
                    ResponseBody::Buffered(body_bytes),
                ));
            }
            Classification::Remote { error } => {
                permit.on_ignore();
                return Err(Error::Remote {
                    status: status.as_u16(),
                    method,
                    uri: current_url.to_string(),
                    error,
                });
            }
            Classification::UnknownRemote => {
                permit.on_ignore();
                return Err(Error::UnknownRemote {
                    status: status.as_u16(),
                    method,
                    uri: current_url.to_string(),
                    body: truncate_body(&body_bytes),
                });
            }
            Classification::Throttle { retry_after } => {
                permit.on_dropped();
                if matches!(shared.server_qos, ServerQos::Propagate429And503ToCaller) {
                    return Ok(Response::new(
                        status,
                        response_headers,
                        ResponseBody::Buffered(body_bytes),
                    ));
                }
                let Some(drawn) = backoff.next_backoff() else {
                    return Err(retries_exhausted(
                        &method,
                        &current_url,
                        attempt,
                        last_io_error.take(),
                    ));
                };
                check_replayable(one_shot, &method, &current_url)?;
                // A throttle is a local load signal; the same URL is retried.
                let delay = retry_after.unwrap_or(drawn);
                debug!(
                    backoff_ms = delay.as_millis() as u64,
                    url = %current_url,
                    "rescheduling call after throttle response"
                );
                sleep_or_cancel(handle, delay, &method, &current_url).await?;
            }
            Classification::Unavailable => {
                permit.on_dropped();
                if matches!(shared.server_qos, ServerQos::Propagate429And503ToCaller) {
                    return Ok(Response::new(
                        status,
                        response_headers,
                        ResponseBody::Buffered(body_bytes),
                    ));
                }
                shared.selector.mark_as_failed(&current_url);
                let Some(delay) = backoff.next_backoff() else {
                    return Err(retries_exhausted(
                        &method,
                        &current_url,
                        attempt,
                        last_io_error.take(),
                    ));
                };
                check_replayable(one_shot, &method, &current_url)?;
                let Some(next_url) = shared.selector.redirect_to_next(&current_url) else {
                    return Err(retries_exhausted(
                        &method,
                        &current_url,
                        attempt,
                        last_io_error.take(),
                    ));
                };
                if next_url != current_url {
                    remaining_relocations = remaining_relocations.saturating_sub(1);
                }
                debug!(
                    backoff_ms = delay.as_millis() as u64,
                    retry_url = %next_url,
                    "retrying call after unavailable response"
                );
                current_url = next_url;
                sleep_or_cancel(handle, delay, &method, &current_url).await?;
            }
            Classification::RetryOther { location } => {
                permit.on_ignore();
                if remaining_relocations == 0 {
                    return Err(Error::RelocationsExhausted {
                        method,
                        uri: current_url.to_string(),
                    });
                }
                check_replayable(one_shot, &method, &current_url)?;
                let Some(next_url) = shared.selector.redirect_to(&current_url, &location) else {
                    // The classifier only emits RetryOther for known bases.
                    return Err(Error::Internal {
                        message: format!(
                            "redirect target {location} passed classification but failed selection"
                        ),
                    });
                };
                remaining_relocations -= 1;
                debug!(url = %current_url, redirect_url = %next_url, "following redirect");
                // Explicit server instruction; no backoff before the retry.
                current_url = next_url;
            }
        }
    }
}

/// Decides whether an IO failure may be retried and where, consuming one
/// backoff slot. Gate order follows the original behavior: the socket and
/// timeout switches first, then backoff exhaustion, then body replayability,
/// then failover availability.
#[allow(clippy::too_many_arguments)]
fn plan_io_retry(
    shared: &ClientShared,
    backoff: &mut ExponentialBackoff,
    remaining_relocations: &mut usize,
    one_shot: bool,
    method: &Method,
    current_url: &Url,
    attempt: usize,
    io_error: IoError,
    last_io_error: &mut Option<IoError>,
) -> Result<(Url, Duration), Error> {
    if !io_retry_allowed(shared, &io_error) {
        return Err(retries_exhausted(
            method,
            current_url,
            attempt,
            Some(io_error),
        ));
    }
    let Some(delay) = backoff.next_backoff() else {
        return Err(retries_exhausted(
            method,
            current_url,
            attempt,
            Some(io_error),
        ));
    };
    check_replayable(one_shot, method, current_url)?;
    let Some(next_url) = shared.selector.redirect_to_next(current_url) else {
        return Err(retries_exhausted(
            method,
            current_url,
            attempt,
            Some(io_error),
        ));
    };
    if next_url != *current_url {
        *remaining_relocations = remaining_relocations.saturating_sub(1);
    }
    *last_io_error = Some(io_error);
    Ok((next_url, delay))
}

fn io_retry_allowed(shared: &ClientShared, io_error: &IoError) -> bool {
    if matches!(
        shared.retry_on_socket_exception,
        RetryOnSocketException::DangerousDisabled
    ) {
        return false;
    }
    match shared.retry_on_timeout {
        // Read timeouts are not retried: the operation may have succeeded
        // server-side.
        RetryOnTimeout::Disabled => io_error.kind() != IoErrorKind::ReadTimeout,
        RetryOnTimeout::DangerousEnableAtRiskOfRetryStorms => true,
    }
}

fn check_replayable(one_shot: bool, method: &Method, url: &Url) -> Result<(), Error> {
    if one_shot {
        return Err(Error::BodyNotReplayable {
            method: method.clone(),
            uri: url.to_string(),
        });
    }
    Ok(())
}

async fn sleep_or_cancel(
    handle: &CallHandle,
    delay: Duration,
    method: &Method,
    url: &Url,
) -> Result<(), Error> {
    if delay.is_zero() {
        return Ok(());
    }
    tokio::select! {
        biased;
        _ = handle.cancelled() => Err(cancelled(method, url)),
        _ = tokio::time::sleep(delay) => Ok(()),
    }
}

fn cancelled(method: &Method, url: &Url) -> Error {
    Error::Cancelled {
        method: method.clone(),
        uri: url.to_string(),
    }
}

fn retries_exhausted(
    method: &Method,
    url: &Url,
    attempts: usize,
    cause: Option<IoError>,
) -> Error {
    Error::RetriesExhausted {
        method: method.clone(),
        uri: url.to_string(),
        attempts,
        cause,
    }
}

/// Produces the wire body for each dispatch. Replayable sources are cloned
/// per attempt; a one-shot source can be taken once, and the retry gates
/// guarantee it never needs to be taken again.
enum BodySource {
    Empty,
    Replayable(Bytes),
    OneShot(Option<RawBody>),
}

impl BodySource {
    fn new(body: RequestBody) -> Self {
        match body {
            RequestBody::Empty => Self::Empty,
            RequestBody::Replayable(bytes) => Self::Replayable(bytes),
            RequestBody::OneShot(raw) => Self::OneShot(Some(raw)),
        }
    }

    fn take_for_dispatch(&mut self) -> RawBody {
        match self {
            Self::Empty => empty_raw_body(),
            Self::Replayable(bytes) => buffered_raw_body(bytes.clone()),
            Self::OneShot(slot) => slot.take().unwrap_or_else(empty_raw_body),
        }
    }
}
