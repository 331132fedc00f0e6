use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{Error, ErrorDetails};

/// Pricing and access settings for a single model
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModelConfig {
    /// Points charged per generation
    pub cost: u32,
    /// Premium models cannot be used without a session
    #[serde(default)]
    pub requires_login: bool,
    /// Provider-side model path, e.g. `black-forest-labs/flux-schnell`
    pub provider_model: String,
    #[serde(default)]
    pub display_name: Option<String>,
}

/// Model id -> config. Ordered so the pricing listing is stable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModelTable(BTreeMap<String, ModelConfig>);

impl ModelTable {
    pub fn new(models: BTreeMap<String, ModelConfig>) -> Result<Self, Error> {
        let table = Self(models);
        table.validate()?;
        Ok(table)
    }

    pub fn get(&self, model_id: &str) -> Option<&ModelConfig> {
        self.0.get(model_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ModelConfig)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn validate(&self) -> Result<(), Error> {
        if self.0.is_empty() {
            return Err(Error::new(ErrorDetails::Config {
                message: "At least one model must be configured".to_string(),
            }));
        }
        for (model_id, config) in &self.0 {
            if config.cost == 0 {
                return Err(Error::new(ErrorDetails::Config {
                    message: format!("`models.{model_id}.cost` must be greater than 0"),
                }));
            }
            if config.provider_model.trim().is_empty() {
                return Err(Error::new(ErrorDetails::Config {
                    message: format!("`models.{model_id}.provider_model` must not be empty"),
                }));
            }
        }
        Ok(())
    }
}

fn model(cost: u32, requires_login: bool, provider_model: &str, display_name: &str) -> ModelConfig {
    ModelConfig {
        cost,
        requires_login,
        provider_model: provider_model.to_string(),
        display_name: Some(display_name.to_string()),
    }
}

impl Default for ModelTable {
    fn default() -> Self {
        let mut models = BTreeMap::new();
        models.insert(
            "flux-schnell".to_string(),
            model(1, false, "black-forest-labs/flux-schnell", "FLUX.1 [schnell]"),
        );
        models.insert(
            "flux-dev".to_string(),
            model(2, false, "black-forest-labs/flux-dev", "FLUX.1 [dev]"),
        );
        models.insert(
            "flux-1.1-pro".to_string(),
            model(4, true, "black-forest-labs/flux-1.1-pro", "FLUX1.1 [pro]"),
        );
        models.insert(
            "flux-1.1-pro-ultra".to_string(),
            model(
                6,
                true,
                "black-forest-labs/flux-1.1-pro-ultra",
                "FLUX1.1 [pro] ultra",
            ),
        );
        models.insert(
            "depth".to_string(),
            model(3, true, "black-forest-labs/flux-depth-pro", "FLUX.1 Depth [pro]"),
        );
        models.insert(
            "canny".to_string(),
            model(3, true, "black-forest-labs/flux-canny-pro", "FLUX.1 Canny [pro]"),
        );
        Self(models)
    }
}
