use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A stored prompt template, as handed out by a `TemplateStore`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptTemplate {
    pub id: String,
    pub name: String,
    pub content: String,
    pub model: String,
    #[serde(default)]
    pub parameters: Map<String, Value>,
}

impl PromptTemplate {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        content: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            content: content.into(),
            model: model.into(),
            parameters: Map::new(),
        }
    }
}

/// What a node asks of the model provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelRequest {
    /// Fully resolved prompt text.
    pub prompt: String,
    pub model_id: String,
    #[serde(default)]
    pub parameters: Map<String, Value>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl TokenUsage {
    pub fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
        }
    }
}

/// What the model provider answers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelResponse {
    pub text: String,
    #[serde(default)]
    pub usage: TokenUsage,
    /// Provider-reported cost, in the provider's currency unit.
    #[serde(default)]
    pub cost: f64,
}

impl ModelResponse {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Default::default()
        }
    }

    pub fn with_usage(mut self, usage: TokenUsage, cost: f64) -> Self {
        self.usage = usage;
        self.cost = cost;
        self
    }
}
