use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    // --- Chat LLM Provider Args ---
    /// Type of LLM provider for chat completion (gemini, ollama)
    #[arg(long, env = "CHAT_LLM_TYPE", default_value = "gemini")]
    pub chat_llm_type: String,

    /// API Key for the Chat LLM provider
    #[arg(long, env = "CHAT_API_KEY", default_value = "")]
    pub chat_api_key: String,

    /// Base URL for the Chat LLM provider API (e.g., http://localhost:11434 for Ollama)
    #[arg(long, env = "CHAT_BASE_URL")] // No default, let adapters handle defaults if None
    pub chat_base_url: Option<String>,

    /// Ordered model fallback list, fastest/cheapest first. Later models
    /// are only tried when an earlier one runs out of quota.
    #[arg(
        long,
        env = "FALLBACK_MODELS",
        value_delimiter = ',',
        default_value = "gemini-2.5-flash,gemini-2.5-flash-lite,gemini-2.5-pro,gemini-2.0-flash"
    )]
    pub fallback_models: Vec<String>,

    // --- Chat Store Args ---
    /// Chat store type (memory, redis)
    #[arg(long, env = "STORE_TYPE", default_value = "memory")]
    pub store_type: String,

    /// Redis URL for the chat store (e.g., redis://127.0.0.1:6379)
    #[arg(long, env = "STORE_REDIS_URL", default_value = "redis://127.0.0.1:6379")]
    pub store_redis_url: String,

    /// Prefix for Redis chat store keys.
    #[arg(long, env = "STORE_REDIS_PREFIX", default_value = "paradoc:")]
    pub store_redis_prefix: String,

    // --- Server Args ---
    /// Host address and port for the server to listen on.
    #[arg(long, env = "SERVER_ADDR", default_value = "127.0.0.1:4000")]
    pub server_addr: String,

    /// Simulate/message requests allowed per second across all clients. 0 disables limiting.
    #[arg(long, env = "RATE_LIMIT_PER_SECOND", default_value = "10")]
    pub rate_limit_per_second: u32,

    /// Optional path to the TLS certificate file (PEM format) for enabling HTTPS. Requires --tls-key-path.
    #[arg(long, env = "TLS_CERT_PATH")]
    pub tls_cert_path: Option<String>,

    /// Optional path to the TLS private key file (PEM format) for enabling HTTPS. Requires --tls-cert-path.
    #[arg(long, env = "TLS_KEY_PATH")]
    pub tls_key_path: Option<String>,

    #[arg(long, env = "ENABLE_TLS", default_value = "false")]
    pub enable_tls: bool,
}

#[cfg(test)]
impl Args {
    pub fn for_tests() -> Self {
        Self {
            chat_llm_type: "gemini".into(),
            chat_api_key: String::new(),
            chat_base_url: None,
            fallback_models: vec!["gemini-2.5-flash".into()],
            store_type: "memory".into(),
            store_redis_url: "redis://127.0.0.1:6379".into(),
            store_redis_prefix: "paradoc:".into(),
            server_addr: "127.0.0.1:0".into(),
            rate_limit_per_second: 0,
            tls_cert_path: None,
            tls_key_path: None,
            enable_tls: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fallback_models_split_on_commas() {
        let args = Args::parse_from([
            "paradoc",
            "--chat-api-key",
            "k",
            "--fallback-models",
            "gemini-2.5-flash,gemini-2.0-flash",
        ]);
        assert_eq!(args.fallback_models, vec!["gemini-2.5-flash", "gemini-2.0-flash"]);
    }

    #[test]
    fn defaults_cover_the_full_fallback_chain() {
        let args = Args::parse_from(["paradoc"]);
        assert_eq!(args.fallback_models.len(), 4);
        assert_eq!(args.fallback_models[0], "gemini-2.5-flash");
        assert_eq!(args.store_type, "memory");
    }
}
