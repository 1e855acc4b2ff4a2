use anyhow::Result;
use agora_core::auth::AuthPolicy;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fs;

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub presence: PresenceConfig,
    #[serde(default)]
    pub calls: CallsConfig,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
pub struct AuthConfig {
    pub jwt_secret: String,
    /// "strict" rejects connections with bad credentials; "relaxed"
    /// admits them as anonymous and logs loudly.
    #[serde(default)]
    pub policy: AuthPolicy,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: generate_random_hex(64),
            policy: AuthPolicy::default(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
pub struct PresenceConfig {
    /// Grace period before a disconnect is committed as offline.
    #[serde(default = "default_offline_grace_ms")]
    pub offline_grace_ms: u64,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            offline_grace_ms: default_offline_grace_ms(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
pub struct CallsConfig {
    /// How long an unanswered call rings before it is marked missed.
    #[serde(default = "default_ring_timeout_secs")]
    pub ring_timeout_secs: u64,
    /// How long terminal calls are retained so late signaling is
    /// rejected rather than treated as unknown.
    #[serde(default = "default_retention_secs")]
    pub retention_secs: u64,
}

impl Default for CallsConfig {
    fn default() -> Self {
        Self {
            ring_timeout_secs: default_ring_timeout_secs(),
            retention_secs: default_retention_secs(),
        }
    }
}

// ── Helpers ──────────────────────────────────────────────────────────────────

/// Generate a cryptographically random hex string of the given length.
fn generate_random_hex(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| {
            let idx = rng.gen_range(0..16u8);
            char::from(if idx < 10 {
                b'0' + idx
            } else {
                b'a' + idx - 10
            })
        })
        .collect()
}

fn default_bind_address() -> String {
    "0.0.0.0:8080".into()
}
fn default_offline_grace_ms() -> u64 {
    5_000
}
fn default_ring_timeout_secs() -> u64 {
    30
}
fn default_retention_secs() -> u64 {
    60
}

fn looks_like_placeholder_secret(raw: &str) -> bool {
    let normalized = raw.trim().to_ascii_lowercase();
    if normalized.is_empty() {
        return true;
    }
    normalized.contains("change_me")
        || normalized.contains("replace_me")
        || normalized.starts_with("example")
        || normalized == "devsecret"
        || normalized == "secret"
}

fn validate_secret_configuration(config: &Config) -> Result<()> {
    let jwt_secret = config.auth.jwt_secret.trim();
    if jwt_secret.len() < 32 || looks_like_placeholder_secret(jwt_secret) {
        anyhow::bail!(
            "Invalid auth.jwt_secret: use a strong random secret (at least 32 characters) and never leave placeholder values"
        );
    }
    Ok(())
}

/// Generate a commented config file template with the given values filled in.
fn generate_config_template(config: &Config) -> String {
    format!(
        r#"# Agora Gateway Configuration
# Generated automatically on first run. Edit as needed.

[server]
bind_address = "{bind_address}"

[auth]
# Shared secret for verifying session tokens minted by the main API.
jwt_secret = "{jwt_secret}"
# "strict" rejects bad credentials; "relaxed" degrades them to anonymous.
policy = "{policy}"

[presence]
# Milliseconds a user may be fully disconnected before going offline.
offline_grace_ms = {offline_grace_ms}

[calls]
# Seconds an unanswered call rings before being marked missed.
ring_timeout_secs = {ring_timeout_secs}
# Seconds a finished call is retained for late-signaling rejection.
retention_secs = {retention_secs}
"#,
        bind_address = config.server.bind_address,
        jwt_secret = config.auth.jwt_secret,
        policy = match config.auth.policy {
            AuthPolicy::Strict => "strict",
            AuthPolicy::Relaxed => "relaxed",
        },
        offline_grace_ms = config.presence.offline_grace_ms,
        ring_timeout_secs = config.calls.ring_timeout_secs,
        retention_secs = config.calls.retention_secs,
    )
}

// ── Config Loading ───────────────────────────────────────────────────────────

impl Config {
    pub fn load(path: &str) -> Result<Self> {
        let mut config = if std::path::Path::new(path).exists() {
            let content = fs::read_to_string(path)?;
            toml::from_str(&content)?
        } else {
            tracing::info!("Config file not found at '{}', generating defaults...", path);
            let config = Config::default();

            if let Some(parent) = std::path::Path::new(path).parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(path, generate_config_template(&config))?;
            tracing::info!("Generated default config at '{}'", path);
            config
        };

        // Environment variable overrides
        if let Ok(value) = std::env::var("AGORA_BIND_ADDRESS") {
            config.server.bind_address = value;
        }
        if let Ok(value) = std::env::var("AGORA_JWT_SECRET") {
            config.auth.jwt_secret = value;
        }
        if let Ok(value) = std::env::var("AGORA_AUTH_POLICY") {
            match value.trim().to_ascii_lowercase().as_str() {
                "strict" => config.auth.policy = AuthPolicy::Strict,
                "relaxed" => config.auth.policy = AuthPolicy::Relaxed,
                _ => {
                    tracing::warn!(
                        "Ignoring invalid AGORA_AUTH_POLICY value '{}'; expected strict or relaxed",
                        value
                    );
                }
            }
        }
        if let Ok(value) = std::env::var("AGORA_OFFLINE_GRACE_MS") {
            if let Ok(parsed) = value.parse::<u64>() {
                config.presence.offline_grace_ms = parsed;
            }
        }
        if let Ok(value) = std::env::var("AGORA_RING_TIMEOUT_SECS") {
            if let Ok(parsed) = value.parse::<u64>() {
                config.calls.ring_timeout_secs = parsed.max(1);
            }
        }
        if let Ok(value) = std::env::var("AGORA_CALL_RETENTION_SECS") {
            if let Ok(parsed) = value.parse::<u64>() {
                config.calls.retention_secs = parsed;
            }
        }

        validate_secret_configuration(&config)?;
        Ok(config)
    }
}
