#![allow(dead_code)]

use axum::Router;
use axum::routing::get;
use peac_gateway::config::GatewayConfig;
use peac_gateway::server;
use peac_test_support::TestIssuer;
use serde_json::json;
use std::net::SocketAddr;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::net::TcpListener;
use tokio::sync::oneshot;

/// A server that shuts down when dropped.
pub struct Spawned {
    pub base_url: String,
    pub addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
}

impl Drop for Spawned {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

pub async fn spawn_gateway(cfg: GatewayConfig) -> Spawned {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local_addr");
    let state = server::build_state(cfg).expect("gateway state");
    let (tx, rx) = oneshot::channel::<()>();
    tokio::spawn(async move {
        let _ = server::serve(listener, state, async move {
            let _ = rx.await;
        })
        .await;
    });
    Spawned {
        base_url: format!("http://{addr}"),
        addr,
        shutdown: Some(tx),
    }
}

async fn spawn_router(app: Router) -> Spawned {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local_addr");
    let (tx, rx) = oneshot::channel::<()>();
    let server = axum::serve(listener, app).with_graceful_shutdown(async move {
        let _ = rx.await;
    });
    tokio::spawn(async move {
        let _ = server.await;
    });
    Spawned {
        base_url: format!("http://{addr}"),
        addr,
        shutdown: Some(tx),
    }
}

/// Spin up a stub issuer origin serving its JWKS document.
pub async fn spawn_issuer(seed: u8) -> (TestIssuer, Spawned) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local_addr");
    let issuer = TestIssuer::new(seed, format!("http://{addr}"));
    let doc = issuer.jwks_document();

    let app = Router::new().route(
        "/.well-known/jwks.json",
        get(move || {
            let doc = doc.clone();
            async move { axum::Json(doc) }
        }),
    );
    let (tx, rx) = oneshot::channel::<()>();
    let server = axum::serve(listener, app).with_graceful_shutdown(async move {
        let _ = rx.await;
    });
    tokio::spawn(async move {
        let _ = server.await;
    });

    (
        issuer,
        Spawned {
            base_url: format!("http://{addr}"),
            addr,
            shutdown: Some(tx),
        },
    )
}

/// An upstream that echoes method, path, and selected headers.
pub async fn spawn_upstream_echo() -> Spawned {
    async fn echo(
        method: axum::http::Method,
        uri: axum::http::Uri,
        headers: axum::http::HeaderMap,
    ) -> axum::Json<serde_json::Value> {
        let get_header = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_owned)
        };
        axum::Json(json!({
            "method": method.as_str(),
            "path": uri.path(),
            "peac_verified": get_header("x-peac-verified"),
            "peac_engine": get_header("x-peac-engine"),
            "peac_warning": get_header("x-peac-warning"),
        }))
    }

    let app = Router::new().fallback(echo);
    spawn_router(app).await
}

pub fn now_unix() -> i64 {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock after epoch")
        .as_secs();
    i64::try_from(secs).expect("epoch seconds fit i64")
}

/// A gateway config with a realistic allowlist and insecure fetch enabled so
/// stub origins on 127.0.0.1 are reachable.
pub fn local_config(issuer_origins: &[&str]) -> GatewayConfig {
    GatewayConfig {
        issuer_allowlist: issuer_origins.iter().map(|s| (*s).to_owned()).collect(),
        unsafe_allow_insecure_fetch: true,
        ..GatewayConfig::default()
    }
}
