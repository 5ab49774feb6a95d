//! Mode behavior, bypass paths, and the fail-closed misconfiguration check,
//! end to end.

mod common;

use common::{local_config, spawn_gateway};
use peac_gateway::config::{GateMode, GatewayConfig};
use serde_json::Value;

#[tokio::test]
async fn bypass_path_forwards_with_empty_allowlist() {
    let cfg = GatewayConfig {
        bypass_paths: vec!["/health".into()],
        ..GatewayConfig::default()
    };
    let gateway = spawn_gateway(cfg).await;

    let resp = reqwest::get(format!("{}/health", gateway.base_url))
        .await
        .expect("request");
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.expect("json");
    assert_eq!(body["bypass"], true);
}

#[tokio::test]
async fn empty_allowlist_fails_closed_on_every_other_path() {
    let cfg = GatewayConfig {
        bypass_paths: vec!["/health".into()],
        ..GatewayConfig::default()
    };
    let gateway = spawn_gateway(cfg).await;

    for path in ["/", "/api/v1/verify", "/deep/nested/path"] {
        let resp = reqwest::get(format!("{}{path}", gateway.base_url))
            .await
            .expect("request");
        assert_eq!(resp.status(), 500, "{path}");
        assert_eq!(
            resp.headers()
                .get("content-type")
                .and_then(|v| v.to_str().ok()),
            Some("application/problem+json")
        );
        let body: Value = resp.json().await.expect("json");
        assert_eq!(body["code"], "E_CONFIG_ISSUER_ALLOWLIST_REQUIRED");
        assert_eq!(body["status"], 500);
    }
}

#[tokio::test]
async fn tap_only_mode_rejects_unsigned_requests_with_401() {
    let gateway = spawn_gateway(local_config(&["https://issuer.example"])).await;

    let resp = reqwest::get(format!("{}/api/data", gateway.base_url))
        .await
        .expect("request");
    assert_eq!(resp.status(), 401);

    let www = resp
        .headers()
        .get("www-authenticate")
        .and_then(|v| v.to_str().ok())
        .expect("www-authenticate")
        .to_owned();
    assert!(www.starts_with("PEAC realm=\"peac\""));
    assert!(www.contains("E_TAP_SIGNATURE_MISSING"));

    let body: Value = resp.json().await.expect("json");
    assert_eq!(body["code"], "E_TAP_SIGNATURE_MISSING");
    assert_eq!(
        body["type"],
        "https://peacprotocol.org/problems/E_TAP_SIGNATURE_MISSING"
    );
}

#[tokio::test]
async fn receipt_or_tap_mode_challenges_with_402() {
    let mut cfg = local_config(&["https://issuer.example"]);
    cfg.mode = GateMode::ReceiptOrTap;
    let gateway = spawn_gateway(cfg).await;

    let resp = reqwest::get(format!("{}/api/data", gateway.base_url))
        .await
        .expect("request");
    assert_eq!(resp.status(), 402);

    let www = resp
        .headers()
        .get("www-authenticate")
        .and_then(|v| v.to_str().ok())
        .expect("www-authenticate")
        .to_owned();
    assert!(www.contains("E_RECEIPT_MISSING"));

    let body: Value = resp.json().await.expect("json");
    assert_eq!(body["code"], "E_RECEIPT_MISSING");
    assert_eq!(body["title"], "Receipt Missing");
}
