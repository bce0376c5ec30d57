//! Environment-driven configuration: provider API-key resolution (§6) plus
//! the original local-server URL helpers, kept for callers building an
//! ad hoc [`crate::model::ModelDescriptor`] against a self-hosted endpoint
//! via [`crate::model::ModelDescriptor::minimal`].
//!
//! ## API key resolution
//!
//! [`resolve_api_key`] implements the provider → environment-variable
//! priority table from §6, keyed by [`ModelDescriptor::provider`] (not the
//! narrower four-value [`crate::model::ApiKind`] wire tag, since several
//! distinct providers — Groq, OpenRouter, xAI, Cerebras, zAI — all speak the
//! `openai-completions` wire format but draw from different environment
//! variables). [`DirectTransport`](crate::transport::DirectTransport) calls
//! this once per `prompt()` unless the caller supplied an explicit key on
//! [`crate::types::AgentOptions`].
//!
//! ## Local server URLs
//!
//! - `OPEN_AGENT_BASE_URL`: override base URL for any provider
//! - `OPEN_AGENT_MODEL`: override model name (when prefer_env is true)

use std::env;
use std::str::FromStr;

/// One provider's environment-variable lookup chain, in priority order.
/// Anthropic is the only entry with more than one variable: an OAuth token
/// takes precedence over a plain API key (§4.1 OAuth handling).
fn env_chain(provider: &str) -> Option<&'static [&'static str]> {
    match provider.to_ascii_lowercase().as_str() {
        "google" | "google-generative" | "gemini" => Some(&["GEMINI_API_KEY"]),
        "openai" => Some(&["OPENAI_API_KEY"]),
        "anthropic" => Some(&["ANTHROPIC_OAUTH_TOKEN", "ANTHROPIC_API_KEY"]),
        "xai" => Some(&["XAI_API_KEY"]),
        "groq" => Some(&["GROQ_API_KEY"]),
        "cerebras" => Some(&["CEREBRAS_API_KEY"]),
        "openrouter" => Some(&["OPENROUTER_API_KEY"]),
        "zai" => Some(&["ZAI_API_KEY"]),
        _ => None,
    }
}

/// Resolves an API key for `provider` by walking its environment-variable
/// chain in priority order. Returns `None` if the provider is unrecognized
/// or none of its variables are set (callers turn that into a
/// [`crate::Error::config`]; this function stays infallible so it can also
/// be used for best-effort probing).
pub fn resolve_api_key(provider: &str) -> Option<String> {
    env_chain(provider)?
        .iter()
        .find_map(|var| env::var(var).ok())
}

/// The environment variable names checked for `provider`, for error messages
/// that tell the caller exactly what to set. Empty if the provider isn't in
/// the §6 table.
pub fn api_key_env_vars(provider: &str) -> &'static [&'static str] {
    env_chain(provider).unwrap_or(&[])
}

/// Local OpenAI-compatible server a [`ModelDescriptor`](crate::model::ModelDescriptor)
/// can point `base_url` at, for development against a self-hosted model
/// rather than a hosted provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalServer {
    LMStudio,
    Ollama,
    LlamaCpp,
    VLLM,
}

impl LocalServer {
    pub fn default_url(&self) -> &'static str {
        match self {
            LocalServer::LMStudio => "http://localhost:1234/v1",
            LocalServer::Ollama => "http://localhost:11434/v1",
            LocalServer::LlamaCpp => "http://localhost:8080/v1",
            LocalServer::VLLM => "http://localhost:8000/v1",
        }
    }
}

impl FromStr for LocalServer {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "lmstudio" | "lm-studio" | "lm_studio" => Ok(LocalServer::LMStudio),
            "ollama" => Ok(LocalServer::Ollama),
            "llamacpp" | "llama-cpp" | "llama_cpp" | "llama.cpp" => Ok(LocalServer::LlamaCpp),
            "vllm" => Ok(LocalServer::VLLM),
            _ => Err(format!("Unknown local server: {}", s)),
        }
    }
}

/// Resolves a base URL: `OPEN_AGENT_BASE_URL` env var, then `server`'s
/// default, then `fallback`, then LM Studio's default as a last resort.
pub fn get_base_url(server: Option<LocalServer>, fallback: Option<&str>) -> String {
    if let Ok(url) = env::var("OPEN_AGENT_BASE_URL") {
        return url;
    }
    if let Some(s) = server {
        return s.default_url().to_string();
    }
    fallback
        .unwrap_or(LocalServer::LMStudio.default_url())
        .to_string()
}

/// Resolves a model name: `OPEN_AGENT_MODEL` env var (if `prefer_env`), else
/// `fallback`.
pub fn get_model(fallback: Option<&str>, prefer_env: bool) -> Option<String> {
    if prefer_env {
        if let Ok(model) = env::var("OPEN_AGENT_MODEL") {
            return Some(model);
        }
    }
    fallback.map(|s| s.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Environment variable tests must not run concurrently with each other.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn test_resolve_api_key_anthropic_prefers_oauth() {
        let _guard = ENV_LOCK.lock().unwrap();
        unsafe {
            env::set_var("ANTHROPIC_OAUTH_TOKEN", "sk-ant-oat-test");
            env::set_var("ANTHROPIC_API_KEY", "sk-ant-api-test");
        }
        assert_eq!(
            resolve_api_key("anthropic"),
            Some("sk-ant-oat-test".to_string())
        );
        unsafe {
            env::remove_var("ANTHROPIC_OAUTH_TOKEN");
        }
        assert_eq!(
            resolve_api_key("anthropic"),
            Some("sk-ant-api-test".to_string())
        );
        unsafe {
            env::remove_var("ANTHROPIC_API_KEY");
        }
    }

    #[test]
    fn test_resolve_api_key_unknown_provider() {
        let _guard = ENV_LOCK.lock().unwrap();
        assert_eq!(resolve_api_key("not-a-real-provider"), None);
    }

    #[test]
    fn test_api_key_env_vars_lists_chain() {
        assert_eq!(api_key_env_vars("groq"), &["GROQ_API_KEY"]);
        assert_eq!(
            api_key_env_vars("anthropic"),
            &["ANTHROPIC_OAUTH_TOKEN", "ANTHROPIC_API_KEY"]
        );
        assert!(api_key_env_vars("unknown").is_empty());
    }

    #[test]
    fn test_local_server_from_str() {
        assert_eq!("lmstudio".parse::<LocalServer>(), Ok(LocalServer::LMStudio));
        assert_eq!("llama.cpp".parse::<LocalServer>(), Ok(LocalServer::LlamaCpp));
        assert!("unknown".parse::<LocalServer>().is_err());
    }

    #[test]
    fn test_get_base_url_with_server() {
        let _guard = ENV_LOCK.lock().unwrap();
        unsafe {
            env::remove_var("OPEN_AGENT_BASE_URL");
        }
        assert_eq!(
            get_base_url(Some(LocalServer::Ollama), None),
            "http://localhost:11434/v1"
        );
    }
}
