//! External providers invoked by job handlers.

use std::fmt;

use serde::{Deserialize, Serialize};

/// An external dependency guarded by its own circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Anthropic,
    #[serde(rename = "openai")]
    OpenAi,
    Email,
}

impl Provider {
    pub const ALL: [Provider; 3] = [Provider::Anthropic, Provider::OpenAi, Provider::Email];

    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Anthropic => "anthropic",
            Provider::OpenAi => "openai",
            Provider::Email => "email",
        }
    }

    /// Whether this provider serves AI requests.
    pub fn is_ai(&self) -> bool {
        matches!(self, Provider::Anthropic | Provider::OpenAi)
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Provider requested by a job payload's `provider` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderPreference {
    Anthropic,
    #[serde(rename = "openai")]
    OpenAi,
    /// Pick whichever AI provider is available at call time.
    Auto,
}

impl ProviderPreference {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "anthropic" | "claude" => Some(Self::Anthropic),
            "openai" => Some(Self::OpenAi),
            "auto" | "either" => Some(Self::Auto),
            _ => None,
        }
    }

    /// The fixed provider, or `None` for dynamic selection.
    pub fn fixed(&self) -> Option<Provider> {
        match self {
            Self::Anthropic => Some(Provider::Anthropic),
            Self::OpenAi => Some(Provider::OpenAi),
            Self::Auto => None,
        }
    }
}
