//! End-to-end tests: the full router on an ephemeral port, driven over HTTP.

mod common;

use common::{start_gateway, start_gateway_with_config, TestGateway, ADMIN_KEY, BASE_CONFIG};
use futures::future::join_all;
use pixelforge_internal::ledger::LedgerConnectionInfo;
use reqwest::StatusCode;
use serde_json::{json, Value};

const BLOCKING_CONFIG: &str = r#"
[provider]
type = "dummy"

[[blocking.rules]]
rule_type = "IP_BLOCKING"
name = "abusive range"
priority = 10
config = { cidrs = ["203.0.113.0/24"] }

[[blocking.rules]]
rule_type = "FINGERPRINT_BLOCKING"
name = "device farm"
priority = 5
config = { fingerprints = ["deadbeef01"] }
"#;

async fn remaining_free(gateway: &TestGateway, ip: &str) -> u64 {
    let usage: Value = gateway
        .client
        .get(gateway.url("/api/usage"))
        .header("x-forwarded-for", ip)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    usage["remainingFreeGenerations"].as_u64().unwrap()
}

async fn balance(gateway: &TestGateway, user_id: &str) -> i64 {
    gateway.app_state.points.balance(user_id).await.unwrap()
}

/// Spend the whole free quota for `ip` on `flux-schnell`
async fn exhaust_free_quota(gateway: &TestGateway, ip: &str, session: Option<&str>) {
    for i in 0..3 {
        let response = gateway
            .generate(ip, session, json!({ "prompt": format!("warm-up {i}") }))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
    assert_eq!(remaining_free(gateway, ip).await, 0);
}

#[tokio::test]
async fn test_anonymous_generation_uses_one_free_unit() {
    let gateway = start_gateway().await;
    let ip = "198.51.100.10";
    assert_eq!(remaining_free(&gateway, ip).await, 3);

    let response = gateway
        .generate(ip, None, json!({ "prompt": "a red fox", "model": "flux-schnell" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = response.json().await.unwrap();

    assert_eq!(body["remainingFreeGenerations"], 2);
    assert_eq!(body["pointsConsumed"], json!({ "free": 1, "paid": 0, "total": 1 }));
    assert_eq!(body["trackingMethod"], "ip");
    assert_eq!(body["userPoints"], Value::Null);
    assert!(body["image"].as_str().unwrap().ends_with(".webp"));
    assert!(body["generationId"].is_string());

    assert_eq!(remaining_free(&gateway, ip).await, 2);
    assert_eq!(gateway.provider_calls(), 1);
}

#[tokio::test]
async fn test_premium_model_requires_login() {
    let gateway = start_gateway().await;

    let response = gateway
        .generate(
            "198.51.100.11",
            None,
            json!({ "prompt": "a castle", "model": "flux-1.1-pro" }),
        )
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"], "This model requires you to sign in");
    assert_eq!(gateway.provider_calls(), 0);
    assert_eq!(remaining_free(&gateway, "198.51.100.11").await, 3);
}

#[tokio::test]
async fn test_blocked_callers_change_nothing() {
    let gateway =
        start_gateway_with_config(BLOCKING_CONFIG, LedgerConnectionInfo::new_memory()).await;
    gateway.credit("user-blocked", 10).await;

    let blocked_ip = gateway
        .generate("203.0.113.7", Some("user-blocked"), json!({ "prompt": "x" }))
        .send()
        .await
        .unwrap();
    assert_eq!(blocked_ip.status(), StatusCode::FORBIDDEN);
    let body: Value = blocked_ip.json().await.unwrap();
    assert_eq!(body["error"], "Access restricted");

    let blocked_fingerprint = gateway
        .generate("198.51.100.12", None, json!({ "prompt": "x" }))
        .header("x-fingerprint-hash", "DEADBEEF01")
        .send()
        .await
        .unwrap();
    assert_eq!(blocked_fingerprint.status(), StatusCode::FORBIDDEN);

    assert_eq!(gateway.provider_calls(), 0);
    assert_eq!(remaining_free(&gateway, "203.0.113.7").await, 3);
    assert_eq!(remaining_free(&gateway, "198.51.100.12").await, 3);
    assert_eq!(balance(&gateway, "user-blocked").await, 10);
}

#[tokio::test]
async fn test_exhausted_quota_is_rejected_before_provider() {
    let gateway = start_gateway().await;
    let ip = "198.51.100.13";
    exhaust_free_quota(&gateway, ip, None).await;

    let response = gateway
        .generate(ip, None, json!({ "prompt": "one more" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    let body: Value = response.json().await.unwrap();
    assert_eq!(
        body["error"],
        "Insufficient free generations. Sign in or purchase points to continue."
    );
    assert_eq!(gateway.provider_calls(), 3);
}

#[tokio::test]
async fn test_fingerprint_quota_follows_device_across_ips() {
    let gateway = start_gateway().await;
    let fingerprint = "a1b2c3d4e5";
    for i in 0..3 {
        let response = gateway
            .generate("198.51.100.21", None, json!({ "prompt": format!("warm-up {i}") }))
            .header("x-fingerprint-hash", fingerprint)
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    let response = gateway
        .generate("198.51.100.22", None, json!({ "prompt": "new network" }))
        .header("x-fingerprint-hash", fingerprint)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    let body: Value = response.json().await.unwrap();
    assert_eq!(
        body["error"],
        "Insufficient free generations. Sign in or purchase points to continue."
    );
    assert_eq!(gateway.provider_calls(), 3);
    assert_eq!(remaining_free(&gateway, "198.51.100.22").await, 3);
}

async fn assert_paid_generation(gateway: TestGateway) {
    let ip = "198.51.100.14";
    let credit = gateway.credit("user-100", 100).await;
    assert_eq!(credit["newBalance"], 100);
    exhaust_free_quota(&gateway, ip, Some("user-100")).await;
    assert_eq!(balance(&gateway, "user-100").await, 100);

    let response = gateway
        .generate(
            ip,
            Some("user-100"),
            json!({ "prompt": "a harbor at night", "model": "flux-dev", "format": "png" }),
        )
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["pointsConsumed"], json!({ "free": 0, "paid": 2, "total": 2 }));
    assert_eq!(body["userPoints"], 98);
    assert_eq!(body["remainingFreeGenerations"], 0);
    assert!(body["image"].as_str().unwrap().ends_with(".png"));

    let points: Value = gateway
        .client
        .get(gateway.url("/api/points"))
        .header(
            "cookie",
            format!("pixelforge-session={}", gateway.session_token("user-100")),
        )
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(points, json!({ "userId": "user-100", "points": 98 }));

    let history: Value = gateway
        .client
        .get(gateway.url("/api/points/history?limit=10"))
        .bearer_auth(gateway.session_token("user-100"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let transactions = history["transactions"].as_array().unwrap();
    assert_eq!(transactions.len(), 2);
    assert_eq!(transactions[0]["amount"], -2);
    assert_eq!(transactions[0]["balanceAfter"], 98);
    assert_eq!(transactions[1]["amount"], 100);
}

#[tokio::test]
async fn test_paid_generation_memory_ledger() {
    assert_paid_generation(start_gateway().await).await;
}

#[tokio::test]
async fn test_paid_generation_sqlite_ledger() {
    let ledger = LedgerConnectionInfo::new_sqlite("sqlite::memory:")
        .await
        .unwrap();
    assert_paid_generation(start_gateway_with_config(BASE_CONFIG, ledger).await).await;
}

#[tokio::test]
async fn test_concurrent_paid_generations_never_overdraw() {
    let gateway = start_gateway().await;
    let ip = "198.51.100.15";
    gateway.credit("user-5", 5).await;
    exhaust_free_quota(&gateway, ip, Some("user-5")).await;

    let responses = join_all((0..10).map(|i| {
        gateway
            .generate(ip, Some("user-5"), json!({ "prompt": format!("burst {i}") }))
            .send()
    }))
    .await;

    let succeeded = responses
        .iter()
        .filter(|r| r.as_ref().unwrap().status() == StatusCode::OK)
        .count();
    assert_eq!(succeeded, 5);
    assert_eq!(balance(&gateway, "user-5").await, 0);
}

#[tokio::test]
async fn test_credit_requires_admin_key() {
    let gateway = start_gateway().await;
    let body = json!({ "userId": "user-1", "amount": 10, "reason": "purchase" });

    let missing = gateway
        .client
        .post(gateway.url("/internal/points/credit"))
        .json(&body)
        .send()
        .await
        .unwrap();
    assert_eq!(missing.status(), StatusCode::UNAUTHORIZED);

    let wrong = gateway
        .client
        .post(gateway.url("/internal/points/credit"))
        .bearer_auth(format!("{ADMIN_KEY}-nope"))
        .json(&body)
        .send()
        .await
        .unwrap();
    assert_eq!(wrong.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(balance(&gateway, "user-1").await, 0);
}

#[tokio::test]
async fn test_bad_requests() {
    let gateway = start_gateway().await;

    let missing_prompt = gateway
        .generate("198.51.100.16", None, json!({ "model": "flux-schnell" }))
        .send()
        .await
        .unwrap();
    assert_eq!(missing_prompt.status(), StatusCode::BAD_REQUEST);

    let unknown_model = gateway
        .generate("198.51.100.16", None, json!({ "prompt": "x", "model": "sdxl" }))
        .send()
        .await
        .unwrap();
    assert_eq!(unknown_model.status(), StatusCode::BAD_REQUEST);
    let body: Value = unknown_model.json().await.unwrap();
    assert_eq!(body["error"], "Unknown model: sdxl");

    let not_found = gateway
        .client
        .get(gateway.url("/api/nope"))
        .send()
        .await
        .unwrap();
    assert_eq!(not_found.status(), StatusCode::NOT_FOUND);

    assert_eq!(gateway.provider_calls(), 0);
}

#[tokio::test]
async fn test_health_and_models() {
    let gateway = start_gateway().await;

    let health: Value = gateway
        .client
        .get(gateway.url("/health"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["gateway"], "ok");

    let models: Value = gateway
        .client
        .get(gateway.url("/api/models"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let premium = models["models"]
        .as_array()
        .unwrap()
        .iter()
        .find(|m| m["id"] == "flux-1.1-pro")
        .unwrap();
    assert_eq!(premium["requiresLogin"], true);
    assert_eq!(premium["cost"], 4);
}
