use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Supported upstream wire dialects.
/// The kind decides endpoint path, auth headers, system-prompt placement and
/// the response shape that content and usage are read from.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
pub enum ProviderKind {
    #[default]
    #[serde(rename = "openai-compatible", alias = "openai")]
    OpenAiCompatible,
    #[serde(rename = "anthropic", alias = "claude")]
    Anthropic,
    #[serde(rename = "gemini", alias = "google")]
    Gemini,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::OpenAiCompatible => "openai-compatible",
            ProviderKind::Anthropic => "anthropic",
            ProviderKind::Gemini => "gemini",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "openai-compatible" | "openai" | "openai_compatible" => {
                Some(ProviderKind::OpenAiCompatible)
            }
            "anthropic" | "claude" => Some(ProviderKind::Anthropic),
            "gemini" | "google" => Some(ProviderKind::Gemini),
            _ => None,
        }
    }

    /// Default base URL for each provider kind.
    pub fn default_base_url(&self) -> &'static str {
        match self {
            ProviderKind::OpenAiCompatible => "https://api.openai.com/v1",
            ProviderKind::Anthropic => "https://api.anthropic.com",
            ProviderKind::Gemini => "https://generativelanguage.googleapis.com/v1beta",
        }
    }

    /// Infer the dialect from the base URL first, then from the model name.
    /// Anything unrecognised speaks the OpenAI-compatible protocol.
    pub fn infer(base_url: &str, model: &str) -> Self {
        let url = base_url.to_lowercase();
        if url.contains("anthropic.com") {
            return ProviderKind::Anthropic;
        }
        if url.contains("generativelanguage.googleapis.com") {
            return ProviderKind::Gemini;
        }

        let model = model.to_lowercase();
        if model.starts_with("claude") {
            ProviderKind::Anthropic
        } else if model.starts_with("gemini") {
            ProviderKind::Gemini
        } else {
            ProviderKind::OpenAiCompatible
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ModelStatus {
    #[default]
    Active,
    Inactive,
    Deprecated,
}

/// One configured upstream: provider, model and credentials.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelEntry {
    pub name: String,
    /// Explicit dialect; inferred from `base_url` / model id when absent.
    #[serde(default)]
    pub provider: Option<ProviderKind>,
    #[serde(default)]
    pub base_url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub status: ModelStatus,
    #[serde(default)]
    pub is_primary: bool,
    #[serde(default)]
    pub cost_per_1k_tokens: f64,
    /// Provider-neutral extras. `model` holds the upstream model id.
    #[serde(default)]
    pub params: Map<String, Value>,
}

impl ModelEntry {
    pub fn new(
        name: impl Into<String>,
        kind: ProviderKind,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        let mut params = Map::new();
        params.insert("model".into(), Value::String(model.into()));
        Self {
            name: name.into(),
            provider: Some(kind),
            base_url: base_url.into(),
            api_key: api_key.into(),
            status: ModelStatus::Active,
            is_primary: false,
            cost_per_1k_tokens: 0.0,
            params,
        }
    }

    pub fn with_cost(mut self, cost_per_1k_tokens: f64) -> Self {
        self.cost_per_1k_tokens = cost_per_1k_tokens;
        self
    }

    pub fn with_status(mut self, status: ModelStatus) -> Self {
        self.status = status;
        self
    }

    /// The model id sent upstream. Falls back to the entry name.
    pub fn model_id(&self) -> &str {
        self.params
            .get("model")
            .and_then(|v| v.as_str())
            .unwrap_or(&self.name)
    }

    pub fn kind(&self) -> ProviderKind {
        self.provider
            .unwrap_or_else(|| ProviderKind::infer(&self.base_url, self.model_id()))
    }

    /// Base URL with the kind's default applied and no trailing slash.
    pub fn resolved_base_url(&self) -> String {
        let base = if self.base_url.trim().is_empty() {
            self.kind().default_base_url()
        } else {
            self.base_url.trim()
        };
        base.trim_end_matches('/').to_string()
    }

    pub fn is_active(&self) -> bool {
        self.status == ModelStatus::Active
    }

    /// Adapter cache key: `provider:base_url:api_key_prefix`.
    pub fn adapter_key(&self) -> String {
        let prefix: String = self.api_key.chars().take(8).collect();
        format!(
            "{}:{}:{}",
            self.kind().as_str(),
            self.resolved_base_url(),
            prefix
        )
    }

    /// Health cache key: `(provider, base_url, model)`.
    pub fn health_key(&self) -> (ProviderKind, String, String) {
        (
            self.kind(),
            self.resolved_base_url(),
            self.model_id().to_string(),
        )
    }

    /// Extras forwarded to the upstream body, minus the model id.
    pub fn extra_params(&self) -> Map<String, Value> {
        let mut extras = self.params.clone();
        extras.remove("model");
        extras
    }
}

/// Public view returned by the admin API. Never exposes the full api_key.
#[derive(Debug, Serialize)]
pub struct ModelEntryInfo {
    pub name: String,
    pub provider: &'static str,
    pub base_url: String,
    pub model: String,
    pub api_key_preview: String,
    pub status: ModelStatus,
    pub is_primary: bool,
    pub cost_per_1k_tokens: f64,
}

impl From<&ModelEntry> for ModelEntryInfo {
    fn from(e: &ModelEntry) -> Self {
        let preview = if e.api_key.len() > 8 {
            format!("{}...{}", &e.api_key[..4], &e.api_key[e.api_key.len() - 4..])
        } else {
            "****".to_string()
        };
        Self {
            name: e.name.clone(),
            provider: e.kind().as_str(),
            base_url: e.resolved_base_url(),
            model: e.model_id().to_string(),
            api_key_preview: preview,
            status: e.status,
            is_primary: e.is_primary,
            cost_per_1k_tokens: e.cost_per_1k_tokens,
        }
    }
}

/// One optional primary plus ordered backups.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PoolConfig {
    #[serde(default)]
    pub primary: Option<ModelEntry>,
    #[serde(default)]
    pub backups: Vec<ModelEntry>,
}

impl PoolConfig {
    /// All entries in failover order: primary first, then backups.
    pub fn ordered(&self) -> Vec<ModelEntry> {
        let mut entries = Vec::with_capacity(self.backups.len() + 1);
        if let Some(primary) = &self.primary {
            let mut primary = primary.clone();
            primary.is_primary = true;
            entries.push(primary);
        }
        entries.extend(self.backups.iter().cloned().map(|mut e| {
            e.is_primary = false;
            e
        }));
        entries
    }

    pub fn has_active(&self) -> bool {
        self.ordered().iter().any(ModelEntry::is_active)
    }
}
