//! Static table of known providers.

/// One provider entry.
///
/// Credentialed providers speak the chat-completions dialect over HTTPS.
/// Credential-free providers are local model hosts and are only ever
/// considered when explicitly enabled or forced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderSpec {
    /// Lowercase provider name (e.g. `"openai"`).
    pub name: &'static str,
    /// Model used when no override is given.
    pub default_model: &'static str,
    /// Environment key holding the API credential.
    pub credential_env: &'static str,
    /// Environment key overriding the base URL.
    pub base_url_env: &'static str,
    /// Base URL used when `base_url_env` is unset.
    pub default_base_url: &'static str,
    /// Environment key overriding the default model.
    pub model_env: &'static str,
    /// `false` marks a local provider.
    pub requires_credential: bool,
}

impl ProviderSpec {
    /// Credential-free providers are local model hosts.
    pub fn is_local(&self) -> bool {
        !self.requires_credential
    }
}

const BUILTIN: &[ProviderSpec] = &[
    ProviderSpec {
        name: "openai",
        default_model: "gpt-4o-mini",
        credential_env: "OPENAI_API_KEY",
        base_url_env: "OPENAI_BASE_URL",
        default_base_url: "https://api.openai.com",
        model_env: "OPENAI_MODEL",
        requires_credential: true,
    },
    ProviderSpec {
        name: "anthropic",
        default_model: "claude-3-5-sonnet-latest",
        credential_env: "ANTHROPIC_API_KEY",
        base_url_env: "ANTHROPIC_BASE_URL",
        default_base_url: "https://api.anthropic.com",
        model_env: "ANTHROPIC_MODEL",
        requires_credential: true,
    },
    ProviderSpec {
        name: "deepseek",
        default_model: "deepseek-chat",
        credential_env: "DEEPSEEK_API_KEY",
        base_url_env: "DEEPSEEK_BASE_URL",
        default_base_url: "https://api.deepseek.com",
        model_env: "DEEPSEEK_MODEL",
        requires_credential: true,
    },
    ProviderSpec {
        name: "groq",
        default_model: "llama-3.3-70b-versatile",
        credential_env: "GROQ_API_KEY",
        base_url_env: "GROQ_BASE_URL",
        default_base_url: "https://api.groq.com/openai",
        model_env: "GROQ_MODEL",
        requires_credential: true,
    },
    ProviderSpec {
        name: "ollama",
        default_model: "llama3.2:3b",
        credential_env: "",
        base_url_env: "OLLAMA_BASE_URL",
        default_base_url: "http://localhost:11434",
        model_env: "OLLAMA_MODEL",
        requires_credential: false,
    },
];

/// Lookup table of providers.
#[derive(Debug, Clone)]
pub struct ProviderCatalog {
    providers: Vec<ProviderSpec>,
}

impl ProviderCatalog {
    /// The built-in table: `openai`, `anthropic`, `deepseek`, `groq`, `ollama`.
    pub fn builtin() -> Self {
        Self {
            providers: BUILTIN.to_vec(),
        }
    }

    /// A catalog with a custom table.
    pub fn new(providers: Vec<ProviderSpec>) -> Self {
        Self { providers }
    }

    /// Find a provider by name (case-insensitive).
    pub fn get(&self, name: &str) -> Option<&ProviderSpec> {
        self.providers
            .iter()
            .find(|p| p.name.eq_ignore_ascii_case(name.trim()))
    }

    pub fn iter(&self) -> impl Iterator<Item = &ProviderSpec> {
        self.providers.iter()
    }
}

impl Default for ProviderCatalog {
    fn default() -> Self {
        Self::builtin()
    }
}
