//! Model descriptors (§3.3): the static facts about a model that provider
//! adapters, the history transformer and the cost calculator all need —
//! which wire API it speaks, what modalities it accepts, and its per-MTok
//! pricing.

use serde::{Deserialize, Serialize};

/// Which provider-native wire protocol a model speaks. Adapters dispatch on
/// this tag rather than on duck-typed shape inspection (Design Notes §9).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ApiKind {
    AnthropicMessages,
    OpenAiCompletions,
    OpenAiResponses,
    GoogleGenerative,
}

impl std::fmt::Display for ApiKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ApiKind::AnthropicMessages => "anthropic-messages",
            ApiKind::OpenAiCompletions => "openai-completions",
            ApiKind::OpenAiResponses => "openai-responses",
            ApiKind::GoogleGenerative => "google-generative",
        };
        write!(f, "{s}")
    }
}

/// An input modality a model accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputModality {
    Text,
    Image,
}

/// Per-million-token pricing, in USD.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct CostRates {
    pub input: f64,
    pub output: f64,
    pub cache_read: f64,
    pub cache_write: f64,
}

/// Static facts about a model: wire API, capabilities, and pricing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelDescriptor {
    pub id: String,
    pub name: String,
    pub provider: String,
    pub api: ApiKind,
    pub base_url: String,
    pub reasoning: bool,
    pub input: Vec<InputModality>,
    pub cost: CostRates,
    pub context_window: u32,
    pub max_tokens: u32,
}

impl ModelDescriptor {
    /// True if this model accepts image input; used by the history
    /// transformer's image-filtering policy (§4.3).
    pub fn accepts_images(&self) -> bool {
        self.input.contains(&InputModality::Image)
    }

    /// A minimal descriptor for ad hoc / local-server use where pricing and
    /// capability metadata aren't known. Cost accumulates to zero and image
    /// input is assumed unsupported — callers with vision models should
    /// build a full descriptor instead.
    pub fn minimal(id: impl Into<String>, api: ApiKind, base_url: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            provider: "custom".to_string(),
            api,
            base_url: base_url.into(),
            reasoning: false,
            input: vec![InputModality::Text],
            cost: CostRates::default(),
            context_window: 0,
            max_tokens: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_kind_display_matches_wire_strings() {
        assert_eq!(ApiKind::AnthropicMessages.to_string(), "anthropic-messages");
        assert_eq!(ApiKind::OpenAiCompletions.to_string(), "openai-completions");
        assert_eq!(ApiKind::OpenAiResponses.to_string(), "openai-responses");
        assert_eq!(ApiKind::GoogleGenerative.to_string(), "google-generative");
    }

    #[test]
    fn test_accepts_images() {
        let mut model = ModelDescriptor::minimal("gpt-4o", ApiKind::OpenAiCompletions, "https://api.openai.com/v1");
        assert!(!model.accepts_images());
        model.input.push(InputModality::Image);
        assert!(model.accepts_images());
    }
}
