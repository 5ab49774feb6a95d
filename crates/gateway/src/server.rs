//! HTTP surface: a single fallback route feeds every request through the
//! decision engine.

use crate::config::GatewayConfig;
use crate::engine::{Action, DecisionEngine, GatewayRequest};
use crate::forward::Forwarder;
use crate::respond;
use axum::Router;
use axum::extract::{ConnectInfo, Request, State};
use axum::response::Response;
use peac_verify::problem::VerifyCode;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

/// Request bodies are buffered for the JSON transport profile and upstream
/// forwarding; this bounds that buffer.
const MAX_BODY_BYTES: usize = 1024 * 1024;

pub struct AppState {
    pub cfg: GatewayConfig,
    pub engine: DecisionEngine,
    pub forwarder: Forwarder,
}

pub fn build_state(cfg: GatewayConfig) -> anyhow::Result<Arc<AppState>> {
    let engine = DecisionEngine::new(&cfg);
    let forwarder = Forwarder::new(cfg.upstream_url.clone())?;
    Ok(Arc::new(AppState {
        cfg,
        engine,
        forwarder,
    }))
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new().fallback(gate).with_state(state)
}

/// Bind-and-run with graceful shutdown.
pub async fn serve(
    listener: tokio::net::TcpListener,
    state: Arc<AppState>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let app = router(state);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await?;
    Ok(())
}

async fn gate(
    State(state): State<Arc<AppState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    request: Request,
) -> Response {
    let (parts, body) = request.into_parts();

    let body = match axum::body::to_bytes(body, MAX_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(_) => {
            let decision = crate::engine::Decision {
                action: Action::Error {
                    code: VerifyCode::InvalidTransport,
                    detail: Some("request body unreadable or too large".into()),
                },
                rate: None,
            };
            return respond::render(&decision, parts.uri.path());
        }
    };

    let headers: Vec<(String, String)> = parts
        .headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_owned(), v.to_owned()))
        })
        .collect();

    let req = GatewayRequest {
        method: parts.method.as_str().to_owned(),
        scheme: header_value(&headers, "x-forwarded-proto").unwrap_or_else(|| "https".to_owned()),
        authority: header_value(&headers, "host")
            .or_else(|| parts.uri.authority().map(ToString::to_string))
            .unwrap_or_else(|| state.cfg.listen_addr.to_string()),
        path: parts.uri.path().to_owned(),
        query: parts.uri.query().map(str::to_owned),
        body_json: decode_json_body(&headers, &body),
        client_ip: client_ip(&headers, peer),
        headers,
    };

    let decision = state.engine.decide(&req).await;
    match &decision.action {
        Action::Forward(principal) => {
            let mut response = state
                .forwarder
                .dispatch(&req, &body, principal.as_ref())
                .await;
            if let Some(rate) = &decision.rate {
                respond::apply_rate_headers(response.headers_mut(), rate);
            }
            response
        }
        _ => respond::render(&decision, &req.path),
    }
}

fn header_value(headers: &[(String, String)], name: &str) -> Option<String> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.clone())
}

fn decode_json_body(headers: &[(String, String)], body: &[u8]) -> Option<serde_json::Value> {
    if body.is_empty() {
        return None;
    }
    let content_type = header_value(headers, "content-type")?;
    if !content_type.to_ascii_lowercase().contains("json") {
        return None;
    }
    serde_json::from_slice(body).ok()
}

fn client_ip(headers: &[(String, String)], peer: SocketAddr) -> IpAddr {
    header_value(headers, "x-forwarded-for")
        .and_then(|value| {
            value
                .split(',')
                .next()
                .and_then(|first| first.trim().parse::<IpAddr>().ok())
        })
        .unwrap_or_else(|| peer.ip())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_ip_prefers_forwarded_for() {
        let peer: SocketAddr = "127.0.0.1:9".parse().expect("addr");
        let headers = vec![(
            "X-Forwarded-For".to_owned(),
            "203.0.113.9, 10.0.0.1".to_owned(),
        )];
        assert_eq!(
            client_ip(&headers, peer),
            "203.0.113.9".parse::<IpAddr>().expect("ip")
        );
        assert_eq!(client_ip(&[], peer), peer.ip());
    }

    #[test]
    fn json_bodies_require_a_json_content_type() {
        let body = br#"{"peac_receipt": "a.b.c"}"#;
        let json_headers = vec![("Content-Type".to_owned(), "application/json".to_owned())];
        assert!(decode_json_body(&json_headers, body).is_some());

        let text_headers = vec![("Content-Type".to_owned(), "text/plain".to_owned())];
        assert!(decode_json_body(&text_headers, body).is_none());
        assert!(decode_json_body(&json_headers, b"").is_none());
    }
}
