//! Immutable table of selectable chat models.

use std::collections::HashMap;

use anyhow::{Result, bail};

use crate::settings::ModelConfig;

/// Known chat models, built once at startup.
#[derive(Debug, Clone)]
pub struct ModelRegistry {
    models: Vec<ModelConfig>,
    by_id: HashMap<String, usize>,
    default_index: usize,
}

impl ModelRegistry {
    /// Build the registry, checking that ids are unique and that the default
    /// model and every fallback refer to known models.
    pub fn new(models: Vec<ModelConfig>, default_model: &str) -> Result<Self> {
        if models.is_empty() {
            bail!("at least one model must be configured");
        }

        let mut by_id = HashMap::with_capacity(models.len());
        for (index, model) in models.iter().enumerate() {
            if by_id.insert(model.id.clone(), index).is_some() {
                bail!("duplicate model id {:?}", model.id);
            }
        }

        for model in &models {
            if let Some(fallback) = &model.fallback
                && !by_id.contains_key(fallback)
            {
                bail!(
                    "model {:?} falls back to unknown model {:?}",
                    model.id,
                    fallback
                );
            }
        }

        let Some(&default_index) = by_id.get(default_model) else {
            bail!("default model {default_model:?} is not configured");
        };

        Ok(Self {
            models,
            by_id,
            default_index,
        })
    }

    pub fn get(&self, id: &str) -> Option<&ModelConfig> {
        self.by_id.get(id).map(|&index| &self.models[index])
    }

    pub fn contains(&self, id: &str) -> bool {
        self.by_id.contains_key(id)
    }

    pub fn default_model(&self) -> &ModelConfig {
        &self.models[self.default_index]
    }

    /// Map a stored model id to a known model, substituting the default for
    /// ids that are no longer configured.
    pub fn resolve(&self, id: &str) -> &ModelConfig {
        self.get(id).unwrap_or_else(|| self.default_model())
    }

    /// The model to try once when `id` fails, if one is configured and distinct.
    pub fn fallback_for(&self, id: &str) -> Option<&ModelConfig> {
        let fallback = self.get(id)?.fallback.as_deref()?;
        if fallback == id {
            return None;
        }
        self.get(fallback)
    }

    pub fn models(&self) -> &[ModelConfig] {
        &self.models
    }
}
