use serde::Deserialize;

// =======================================================
// COMPRESSION CONFIG + DEFAULTS
// =======================================================
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CompressionConfig {
    /// Encodings advertised in Accept-Encoding, in preference order.
    pub encodings: Vec<String>,
    /// Upper bound on a decoded body; larger bodies are rejected as malformed.
    pub max_decoded_bytes: u64,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            encodings: vec!["gzip".into(), "deflate".into(), "br".into()],
            max_decoded_bytes: 64 * 1024 * 1024,
        }
    }
}

impl CompressionConfig {
    pub fn encodings(&self) -> &[String] {
        &self.encodings
    }

    pub fn max_decoded_bytes(&self) -> u64 {
        self.max_decoded_bytes
    }

    pub(crate) fn apply_defaults(&mut self) {
        if self.max_decoded_bytes == 0 {
            self.max_decoded_bytes = CompressionConfig::default().max_decoded_bytes;
        }
        for enc in &mut self.encodings {
            *enc = enc.trim().to_ascii_lowercase();
        }
        self.encodings.retain(|enc| !enc.is_empty());
    }
}

// =======================================================
// TRANSPORT CONFIG + DEFAULTS
// =======================================================
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub connect_timeout_secs: u64,
    pub request_timeout_secs: u64,
    pub pool_max_idle_per_host: usize,
    pub user_agent: String,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 5,
            request_timeout_secs: 30,
            pool_max_idle_per_host: 16,
            user_agent: "lowband/0.1.0".into(),
        }
    }
}

impl TransportConfig {
    pub fn connect_timeout_secs(&self) -> u64 {
        self.connect_timeout_secs
    }

    pub fn request_timeout_secs(&self) -> u64 {
        self.request_timeout_secs
    }

    pub fn pool_max_idle_per_host(&self) -> usize {
        self.pool_max_idle_per_host
    }

    pub fn user_agent(&self) -> &str {
        &self.user_agent
    }

    pub(crate) fn apply_defaults_from(&mut self, defaults: &TransportConfig) {
        if self.connect_timeout_secs == 0 {
            self.connect_timeout_secs = defaults.connect_timeout_secs;
        }
        if self.request_timeout_secs == 0 {
            self.request_timeout_secs = defaults.request_timeout_secs;
        }
        if self.user_agent.is_empty() {
            self.user_agent = defaults.user_agent.clone();
        }
    }
}
