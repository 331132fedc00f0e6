use std::net::SocketAddr;
use std::sync::Arc;

use pixelforge_internal::auth::{AdminAuth, SessionAuth};
use pixelforge_internal::config_parser::Config;
use pixelforge_internal::endpoints::build_router;
use pixelforge_internal::gateway_util::{setup_blocking, AppStateData};
use pixelforge_internal::ledger::LedgerConnectionInfo;
use pixelforge_internal::providers::ProviderConfig;
use reqwest::{Client, RequestBuilder};
use secrecy::SecretString;
use serde_json::Value;

pub const SESSION_SECRET: &str = "e2e-session-secret";
pub const ADMIN_KEY: &str = "e2e-admin-key";

pub const BASE_CONFIG: &str = r#"
[provider]
type = "dummy"
"#;

pub struct TestGateway {
    pub addr: SocketAddr,
    pub app_state: AppStateData,
    pub client: Client,
}

impl TestGateway {
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{path}", self.addr)
    }

    pub fn provider_calls(&self) -> u64 {
        match self.app_state.provider.as_ref() {
            ProviderConfig::Dummy(provider) => provider.call_count(),
            ProviderConfig::Replicate(_) => 0,
        }
    }

    pub fn session_token(&self, user_id: &str) -> String {
        self.app_state
            .identity_resolver
            .session_auth()
            .issue_token(user_id, None)
            .unwrap()
    }

    /// `POST /api/generate` from a given client IP, optionally with a session
    pub fn generate(&self, ip: &str, session: Option<&str>, body: Value) -> RequestBuilder {
        let request = self
            .client
            .post(self.url("/api/generate"))
            .header("x-forwarded-for", ip)
            .json(&body);
        match session {
            Some(user_id) => request.header(
                "cookie",
                format!("pixelforge-session={}", self.session_token(user_id)),
            ),
            None => request,
        }
    }

    pub async fn credit(&self, user_id: &str, amount: i64) -> Value {
        let response = self
            .client
            .post(self.url("/internal/points/credit"))
            .bearer_auth(ADMIN_KEY)
            .json(&serde_json::json!({
                "userId": user_id,
                "amount": amount,
                "reason": "purchase",
            }))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
        response.json().await.unwrap()
    }
}

pub async fn start_gateway() -> TestGateway {
    start_gateway_with_config(BASE_CONFIG, LedgerConnectionInfo::new_memory()).await
}

/// Serve the full router on an ephemeral port with the given config and ledger
pub async fn start_gateway_with_config(
    config_toml: &str,
    ledger: LedgerConnectionInfo,
) -> TestGateway {
    let config = Arc::new(Config::load_from_toml_str(config_toml).unwrap());
    let provider = config.provider.clone().load().unwrap();
    let blocking_manager = setup_blocking(&config, None).await;
    let app_state = AppStateData::new_with_components(
        config.clone(),
        ledger,
        provider,
        SessionAuth::new(
            Some(SecretString::from(SESSION_SECRET.to_string())),
            &config.auth,
        ),
        AdminAuth::new(Some(SecretString::from(ADMIN_KEY.to_string()))),
        blocking_manager,
    )
    .unwrap();

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let router = build_router(app_state.clone());
    tokio::spawn(async move { axum::serve(listener, router).await });

    TestGateway {
        addr,
        app_state,
        client: Client::new(),
    }
}
