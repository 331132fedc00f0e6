#![cfg(test)]

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::http::{header, HeaderMap, HeaderValue};
use secrecy::SecretString;

use crate::auth::{AdminAuth, SessionAuth};
use crate::config_parser::Config;
use crate::gateway_util::AppStateData;
use crate::ledger::LedgerConnectionInfo;
use crate::model_table::{ModelConfig, ModelTable};
use crate::providers::dummy::{DummyProvider, ERROR_MODEL};
use crate::providers::ProviderConfig;

pub const TEST_SESSION_SECRET: &str = "unit-test-session-secret";
pub const TEST_ADMIN_KEY: &str = "unit-test-admin-key";

pub struct TestAppState {
    pub app_state: AppStateData,
    pub provider: ProviderCalls,
}

/// Call counter for the dummy provider inside an app state
pub struct ProviderCalls(Arc<ProviderConfig>);

impl ProviderCalls {
    pub fn call_count(&self) -> u64 {
        match self.0.as_ref() {
            ProviderConfig::Dummy(provider) => provider.call_count(),
            ProviderConfig::Replicate(_) => 0,
        }
    }
}

/// The default model table plus `broken`, which always fails at the provider
pub fn test_config() -> Config {
    let mut models: BTreeMap<String, ModelConfig> = ModelTable::default()
        .iter()
        .map(|(id, model)| (id.clone(), model.clone()))
        .collect();
    models.insert(
        "broken".to_string(),
        ModelConfig {
            cost: 1,
            requires_login: false,
            provider_model: ERROR_MODEL.to_string(),
            display_name: None,
        },
    );
    let models = ModelTable::new(models).expect("test model table should be valid");
    Config {
        models,
        ..Default::default()
    }
}

pub fn get_unit_test_app_state() -> TestAppState {
    let config = Arc::new(test_config());
    let app_state = AppStateData::new_with_components(
        config.clone(),
        LedgerConnectionInfo::new_memory(),
        ProviderConfig::Dummy(DummyProvider::default()),
        SessionAuth::new(
            Some(SecretString::from(TEST_SESSION_SECRET.to_string())),
            &config.auth,
        ),
        AdminAuth::new(Some(SecretString::from(TEST_ADMIN_KEY.to_string()))),
        None,
    )
    .expect("test app state should build");
    TestAppState {
        provider: ProviderCalls(app_state.provider.clone()),
        app_state,
    }
}

/// Headers carrying a valid session cookie for `user_id`
pub fn session_headers(app_state: &AppStateData, user_id: &str) -> HeaderMap {
    let token = app_state
        .identity_resolver
        .session_auth()
        .issue_token(user_id, None)
        .expect("session token should encode");
    let mut headers = HeaderMap::new();
    headers.insert(
        header::COOKIE,
        HeaderValue::from_str(&format!("pixelforge-session={token}"))
            .expect("token should be a valid header value"),
    );
    headers
}
