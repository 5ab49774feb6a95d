//! Pass verified (or bypassed) requests to the origin, or answer directly
//! when no upstream is configured.

use crate::engine::{GatewayRequest, Principal};
use crate::respond;
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse as _, Response};
use peac_verify::problem::{ProblemDetails, VerifyCode};
use serde_json::json;
use url::Url;

/// Hop-by-hop headers never copied across the proxy boundary.
const HOP_BY_HOP: [&str; 9] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "host",
];

pub struct Forwarder {
    client: reqwest::Client,
    upstream: Option<Url>,
}

impl Forwarder {
    pub fn new(upstream: Option<Url>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self { client, upstream })
    }

    /// Forward the request, or answer with a verification summary when the
    /// gateway runs without an upstream.
    pub async fn dispatch(
        &self,
        req: &GatewayRequest,
        body: &[u8],
        principal: Option<&Principal>,
    ) -> Response {
        match &self.upstream {
            Some(upstream) => self.proxy(upstream, req, body, principal).await,
            None => self_response(principal),
        }
    }

    async fn proxy(
        &self,
        upstream: &Url,
        req: &GatewayRequest,
        body: &[u8],
        principal: Option<&Principal>,
    ) -> Response {
        let mut url = match upstream.join(&req.path) {
            Ok(url) => url,
            Err(e) => return internal_error(format!("upstream url: {e}")),
        };
        url.set_query(req.query.as_deref());

        let method = match reqwest::Method::from_bytes(req.method.as_bytes()) {
            Ok(method) => method,
            Err(_) => return internal_error(format!("method {:?}", req.method)),
        };

        let mut outbound = HeaderMap::new();
        for (name, value) in &req.headers {
            if HOP_BY_HOP.iter().any(|h| name.eq_ignore_ascii_case(h))
                || name.eq_ignore_ascii_case("content-length")
            {
                continue;
            }
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                outbound.append(name, value);
            }
        }
        if let Some(principal) = principal {
            respond::apply_principal_headers(
                &mut outbound,
                principal.engine.as_str(),
                &principal.warnings,
            );
        }

        let upstream_response = self
            .client
            .request(method, url)
            .headers(outbound)
            .body(body.to_vec())
            .send()
            .await;

        let upstream_response = match upstream_response {
            Ok(response) => response,
            Err(e) => {
                tracing::error!(error = %e, "upstream request failed");
                return internal_error("upstream request failed".to_owned());
            }
        };

        let status = StatusCode::from_u16(upstream_response.status().as_u16())
            .unwrap_or(StatusCode::BAD_GATEWAY);
        let mut headers = HeaderMap::new();
        for (name, value) in upstream_response.headers() {
            if HOP_BY_HOP.iter().any(|h| name.as_str().eq_ignore_ascii_case(h)) {
                continue;
            }
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_str().as_bytes()),
                HeaderValue::from_bytes(value.as_bytes()),
            ) {
                headers.append(name, value);
            }
        }

        let bytes = match upstream_response.bytes().await {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::error!(error = %e, "upstream body read failed");
                return internal_error("upstream body read failed".to_owned());
            }
        };

        let mut response = (status, bytes.to_vec()).into_response();
        *response.headers_mut() = headers;
        response
    }
}

fn self_response(principal: Option<&Principal>) -> Response {
    let body = match principal {
        None => json!({ "bypass": true }),
        Some(principal) => json!({
            "verified": true,
            "engine": principal.engine.as_str(),
            "issuer": principal.issuer,
            "warnings": principal.warnings,
        }),
    };
    let mut response = (StatusCode::OK, axum::Json(body)).into_response();
    if let Some(principal) = principal {
        respond::apply_principal_headers(
            response.headers_mut(),
            principal.engine.as_str(),
            &principal.warnings,
        );
    }
    response
}

fn internal_error(detail: String) -> Response {
    let problem = ProblemDetails::new(VerifyCode::InternalError).with_detail(detail);
    let mut response = (StatusCode::INTERNAL_SERVER_ERROR, axum::Json(problem)).into_response();
    response.headers_mut().insert(
        axum::http::header::CONTENT_TYPE,
        HeaderValue::from_static(peac_verify::problem::PROBLEM_CONTENT_TYPE),
    );
    response
}
