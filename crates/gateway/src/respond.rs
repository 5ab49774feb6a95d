//! Render engine decisions as HTTP responses.

use crate::engine::{Action, Decision};
use crate::rate_limit::RateLimitDecision;
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse as _, Response};
use peac_verify::problem::{PROBLEM_CONTENT_TYPE, ProblemDetails, VerifyCode};

pub const HEADER_VERIFIED: &str = "x-peac-verified";
pub const HEADER_ENGINE: &str = "x-peac-engine";
pub const HEADER_WARNING: &str = "x-peac-warning";

/// Render a non-forward decision as a Problem Details response.
///
/// Panics are avoided throughout; malformed header values degrade to
/// omitting the header rather than failing the response.
#[must_use]
pub fn render(decision: &Decision, instance: &str) -> Response {
    let (code, detail) = match &decision.action {
        Action::Error { code, detail } => (*code, detail.clone()),
        Action::Challenge { detail } => (VerifyCode::ReceiptMissing, detail.clone()),
        // Callers route forwards elsewhere; reaching this arm is a bug, and
        // the request is refused.
        Action::Forward(_) => (
            VerifyCode::InternalError,
            Some("forward action reached the renderer".into()),
        ),
    };

    let mut problem = ProblemDetails::new(code).with_instance(instance);
    if let Some(detail) = detail {
        problem = problem.with_detail(detail);
    }

    let status = StatusCode::from_u16(code.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut response = (status, axum::Json(problem)).into_response();
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static(PROBLEM_CONTENT_TYPE),
    );

    if matches!(status.as_u16(), 401 | 402) {
        let challenge = format!(
            r#"PEAC realm="peac", error="{}", error_uri="{}""#,
            code.as_str(),
            code.type_uri()
        );
        if let Ok(value) = HeaderValue::from_str(&challenge) {
            headers.insert(header::WWW_AUTHENTICATE, value);
        }
    }

    if let Some(rate) = &decision.rate {
        apply_rate_headers(headers, rate);
    }

    response
}

/// Attach `RateLimit-*` (and `Retry-After` when denied) to any response.
pub fn apply_rate_headers(headers: &mut HeaderMap, rate: &RateLimitDecision) {
    insert_num(headers, "ratelimit-limit", u64::from(rate.limit));
    insert_num(headers, "ratelimit-remaining", u64::from(rate.remaining));
    insert_num(headers, "ratelimit-reset", rate.reset_secs);
    if let Some(retry_after) = rate.retry_after_secs {
        insert_num(headers, "retry-after", retry_after);
    }
}

/// Attach verification marks for a forwarded (verified) request.
pub fn apply_principal_headers(headers: &mut HeaderMap, engine: &str, warnings: &[String]) {
    headers.insert(
        HeaderName::from_static(HEADER_VERIFIED),
        HeaderValue::from_static("true"),
    );
    if let Ok(value) = HeaderValue::from_str(engine) {
        headers.insert(HeaderName::from_static(HEADER_ENGINE), value);
    }
    for warning in warnings {
        if let Ok(value) = HeaderValue::from_str(warning) {
            headers.append(HeaderName::from_static(HEADER_WARNING), value);
        }
    }
}

fn insert_num(headers: &mut HeaderMap, name: &'static str, value: u64) {
    if let Ok(value) = HeaderValue::from_str(&value.to_string()) {
        headers.insert(HeaderName::from_static(name), value);
    }
}
