//! Model catalog: the providers and models the router can choose from
//!
//! The catalog is read-mostly. It is built once at startup (from the built-in
//! defaults, optionally extended by `[[models]]` entries in the config file) and
//! shared behind an `Arc`.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Capability tags a model can advertise and a request can require
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Chat,
    Completion,
    Analysis,
    Creative,
    Code,
    Reasoning,
    ToolCalling,
    Vision,
    LongContext,
    JsonMode,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Capability::Chat => "chat",
            Capability::Completion => "completion",
            Capability::Analysis => "analysis",
            Capability::Creative => "creative",
            Capability::Code => "code",
            Capability::Reasoning => "reasoning",
            Capability::ToolCalling => "tool_calling",
            Capability::Vision => "vision",
            Capability::LongContext => "long_context",
            Capability::JsonMode => "json_mode",
        };
        f.write_str(name)
    }
}

impl std::str::FromStr for Capability {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_lowercase().replace('-', "_");
        serde_json::from_value(serde_json::Value::String(normalized))
            .map_err(|_| format!("unknown capability: {}", s))
    }
}

/// Price per 1000 tokens, in USD
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Pricing {
    pub input_per_1k: f64,
    pub output_per_1k: f64,
}

impl Pricing {
    pub fn new(input_per_1k: f64, output_per_1k: f64) -> Self {
        Self {
            input_per_1k,
            output_per_1k,
        }
    }
}

/// A callable model variant offered by a provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Model {
    /// Unique id within the catalog (e.g. "gpt-4o-mini")
    pub id: String,
    /// Owning provider name (e.g. "openai")
    pub provider: String,
    pub capabilities: Vec<Capability>,
    pub pricing: Pricing,
    /// Maximum input tokens the model accepts
    pub context_window: usize,
    /// Qualitative speed rating, 1 (slow) to 10 (fast)
    pub speed: u8,
    /// Qualitative quality rating, 1 (weak) to 10 (strong)
    pub quality: u8,
    /// Historical reliability, 0.0 - 1.0
    #[serde(default = "default_reliability")]
    pub reliability: f64,
    #[serde(default)]
    pub deprecated: bool,
    #[serde(default)]
    pub beta: bool,
    /// Requests per minute allowed by the provider for this model
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit_rpm: Option<u32>,
}

fn default_reliability() -> f64 {
    0.99
}

impl Model {
    pub fn new(id: impl Into<String>, provider: impl Into<String>, pricing: Pricing) -> Self {
        Self {
            id: id.into(),
            provider: provider.into(),
            capabilities: vec![Capability::Chat, Capability::Completion],
            pricing,
            context_window: 128_000,
            speed: 5,
            quality: 5,
            reliability: default_reliability(),
            deprecated: false,
            beta: false,
            rate_limit_rpm: None,
        }
    }

    pub fn with_capabilities(mut self, capabilities: &[Capability]) -> Self {
        self.capabilities = capabilities.to_vec();
        self
    }

    pub fn with_ratings(mut self, speed: u8, quality: u8) -> Self {
        self.speed = speed.clamp(1, 10);
        self.quality = quality.clamp(1, 10);
        self
    }

    pub fn with_context_window(mut self, tokens: usize) -> Self {
        self.context_window = tokens;
        self
    }

    pub fn with_rate_limit(mut self, rpm: u32) -> Self {
        self.rate_limit_rpm = Some(rpm);
        self
    }

    pub fn deprecated(mut self) -> Self {
        self.deprecated = true;
        self
    }

    pub fn supports(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }

    pub fn supports_all(&self, required: &[Capability]) -> bool {
        required.iter().all(|c| self.supports(*c))
    }
}

/// Queryable registry of models keyed by id
#[derive(Debug, Clone, Default)]
pub struct ModelCatalog {
    models: Vec<Model>,
    index: HashMap<String, usize>,
}

impl ModelCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a catalog from a list of models. Later duplicates replace earlier ones.
    pub fn from_models(models: impl IntoIterator<Item = Model>) -> Self {
        let mut catalog = Self::new();
        for model in models {
            catalog.upsert(model);
        }
        catalog
    }

    /// Insert a model, replacing any existing entry with the same id
    pub fn upsert(&mut self, model: Model) {
        match self.index.get(&model.id) {
            Some(&idx) => self.models[idx] = model,
            None => {
                self.index.insert(model.id.clone(), self.models.len());
                self.models.push(model);
            }
        }
    }

    pub fn get(&self, model_id: &str) -> Option<&Model> {
        self.index.get(model_id).map(|&idx| &self.models[idx])
    }

    pub fn models(&self) -> &[Model] {
        &self.models
    }

    pub fn by_provider<'a>(&'a self, provider: &'a str) -> impl Iterator<Item = &'a Model> + 'a {
        self.models.iter().filter(move |m| m.provider == provider)
    }

    /// Distinct provider names in catalog order
    pub fn providers(&self) -> Vec<&str> {
        let mut seen = Vec::new();
        for model in &self.models {
            if !seen.contains(&model.provider.as_str()) {
                seen.push(model.provider.as_str());
            }
        }
        seen
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    /// Built-in catalog of commonly used hosted models
    pub fn builtin() -> Self {
        use Capability::*;

        Self::from_models([
            Model::new("gpt-4o", "openai", Pricing::new(0.0025, 0.01))
                .with_capabilities(&[
                    Chat,
                    Completion,
                    Analysis,
                    Creative,
                    Code,
                    Reasoning,
                    ToolCalling,
                    Vision,
                    JsonMode,
                ])
                .with_ratings(7, 9),
            Model::new("gpt-4o-mini", "openai", Pricing::new(0.00015, 0.0006))
                .with_capabilities(&[
                    Chat,
                    Completion,
                    Analysis,
                    Creative,
                    Code,
                    ToolCalling,
                    JsonMode,
                ])
                .with_ratings(9, 7),
            Model::new("gpt-3.5-turbo", "openai", Pricing::new(0.0005, 0.0015))
                .with_capabilities(&[Chat, Completion])
                .with_context_window(16_385)
                .with_ratings(9, 5)
                .deprecated(),
            Model::new("claude-3-5-sonnet-20241022", "anthropic", Pricing::new(0.003, 0.015))
                .with_capabilities(&[
                    Chat,
                    Completion,
                    Analysis,
                    Creative,
                    Code,
                    Reasoning,
                    ToolCalling,
                    Vision,
                    LongContext,
                ])
                .with_context_window(200_000)
                .with_ratings(7, 10),
            Model::new("claude-3-5-haiku-20241022", "anthropic", Pricing::new(0.0008, 0.004))
                .with_capabilities(&[Chat, Completion, Analysis, Code, ToolCalling, LongContext])
                .with_context_window(200_000)
                .with_ratings(9, 7),
            Model::new("gemini-1.5-flash", "google", Pricing::new(0.000075, 0.0003))
                .with_capabilities(&[Chat, Completion, Analysis, Creative, Vision, LongContext])
                .with_context_window(1_000_000)
                .with_ratings(10, 6),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upsert_replaces_existing_id() {
        let mut catalog = ModelCatalog::new();
        catalog.upsert(Model::new("m1", "p1", Pricing::new(0.001, 0.002)));
        catalog.upsert(Model::new("m1", "p2", Pricing::new(0.003, 0.004)));

        assert_eq!(catalog.len(), 1);
        assert_eq!(catalog.get("m1").map(|m| m.provider.as_str()), Some("p2"));
    }

    #[test]
    fn test_builtin_catalog_has_unique_ids() {
        let catalog = ModelCatalog::builtin();
        let mut ids: Vec<_> = catalog.models().iter().map(|m| m.id.clone()).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), catalog.len());
        assert!(catalog.providers().contains(&"anthropic"));
    }

    #[test]
    fn test_supports_all() {
        let model = Model::new("m", "p", Pricing::new(0.0, 0.0))
            .with_capabilities(&[Capability::Chat, Capability::Code]);
        assert!(model.supports_all(&[Capability::Code]));
        assert!(!model.supports_all(&[Capability::Code, Capability::Vision]));
        assert!(model.supports_all(&[]));
    }

    #[test]
    fn test_capability_parses_kebab_case() {
        assert_eq!("tool-calling".parse::<Capability>(), Ok(Capability::ToolCalling));
        assert_eq!("Code".parse::<Capability>(), Ok(Capability::Code));
        assert!("telepathy".parse::<Capability>().is_err());
    }
}
