//! Configuration Loader (C11): layers CLI flags, environment variables, a
//! TOML config file, and built-in defaults into a validated `Settings`
//! value (§4.11, §6).

use std::net::UdpSocket;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::errors::{CouncilError, CouncilResult};
use crate::model_client::ModelEndpoint;

fn default_config_path() -> PathBuf {
    PathBuf::from("./council.toml")
}

/// CLI flags, layered over env vars, over the config file, over defaults.
#[derive(clap::Parser, Debug, Clone)]
#[command(name = "council", about = "Multi-model deliberation orchestrator")]
pub struct Args {
    /// Path to the TOML configuration file.
    #[arg(long, env = "COUNCIL_CONFIG")]
    pub config: Option<PathBuf>,

    /// Base URL of the OpenAI-compatible model backend.
    #[arg(long, env = "COUNCIL_API_BASE_URL")]
    pub api_base_url: Option<String>,

    /// API key for the model backend, if required.
    #[arg(long, env = "COUNCIL_API_KEY")]
    pub api_key: Option<String>,

    /// Bind address for the HTTP surface.
    #[arg(long, env = "COUNCIL_IP_ADDRESS")]
    pub ip_address: Option<String>,

    /// Bind port for the HTTP surface.
    #[arg(long, env = "COUNCIL_PORT")]
    pub port: Option<u16>,

    /// Comma-separated council model ids.
    #[arg(long, env = "COUNCIL_MEMBERS", value_delimiter = ',')]
    pub council_members: Option<Vec<String>>,

    /// Chairman model id.
    #[arg(long, env = "COUNCIL_CHAIRMAN")]
    pub chairman: Option<String>,

    /// Number of Stage 2 rounds to run this session.
    #[arg(long, env = "COUNCIL_ROUNDS")]
    pub rounds: Option<u32>,

    /// Directory for the file-based conversation store.
    #[arg(long, env = "COUNCIL_DATA_DIR")]
    pub data_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, Default)]
struct FileConfig {
    #[serde(default)]
    api_base_url: Option<String>,
    #[serde(default)]
    api_key: Option<String>,
    #[serde(default)]
    ip_address: Option<String>,
    #[serde(default)]
    port: Option<u16>,
    #[serde(default)]
    data_dir: Option<PathBuf>,
    #[serde(default)]
    models: Option<FileModelsConfig>,
    #[serde(default)]
    deliberation: Option<FileDeliberationConfig>,
    #[serde(default)]
    title_generation: Option<FileTitleConfig>,
}

#[derive(Debug, Clone, Deserialize, Default)]
struct FileModelsConfig {
    chairman: Option<String>,
    council_members: Option<Vec<String>>,
    /// Per-model endpoint overrides, keyed by model id. A model absent here
    /// (or with an empty field) inherits the global endpoint (§3
    /// `ModelEndpoint` resolution precedence).
    #[serde(default)]
    endpoints: std::collections::HashMap<String, FileEndpointOverride>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub(crate) struct FileEndpointOverride {
    #[serde(default)]
    pub(crate) base_url: Option<String>,
    #[serde(default)]
    pub(crate) api_key: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
struct FileDeliberationConfig {
    rounds: Option<u32>,
    max_rounds: Option<u32>,
    enable_cross_review: Option<bool>,
    quality_threshold: Option<f32>,
}

#[derive(Debug, Clone, Deserialize, Default)]
struct FileTitleConfig {
    enabled: Option<bool>,
    max_concurrent: Option<usize>,
    timeout_seconds: Option<u64>,
    retry_attempts: Option<u32>,
    reasoning_hints: Option<Vec<String>>,
}

/// Per-request deliberation parameters (§3 `DeliberationConfig`).
#[derive(Debug, Clone)]
pub struct DeliberationConfig {
    pub council_members: Vec<String>,
    pub chairman: String,
    pub rounds: u32,
    pub max_rounds: u32,
    pub enable_cross_review: bool,
    pub quality_threshold: f32,
}

/// The fully-resolved, validated configuration value, immutable for the
/// life of the process.
#[derive(Debug, Clone)]
pub struct Settings {
    pub api_base_url: String,
    pub api_key: Option<String>,
    pub ip_address: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub deliberation: DeliberationConfig,
    pub title_enabled: bool,
    pub title_max_concurrent: usize,
    pub title_timeout_secs: u64,
    pub title_retry_attempts: u32,
    pub title_reasoning_hints: Vec<String>,
    /// Per-model endpoint overrides (§3 `ModelEndpoint` resolution
    /// precedence: per-model → global → built-in default). Empty string in
    /// either override field means "inherit" per §3.
    pub(crate) model_endpoints: std::collections::HashMap<String, FileEndpointOverride>,
}

impl Settings {
    /// Layer CLI flags (highest) > environment variables (already captured
    /// by clap's `env` attribute on `Args`) > TOML file > built-in defaults
    /// (lowest), then validate.
    pub fn load(args: Args) -> CouncilResult<Self> {
        let config_path = args.config.clone().unwrap_or_else(default_config_path);
        let file_config = load_file_config(&config_path);

        let models = file_config.models.clone().unwrap_or_default();
        let deliberation_file = file_config.deliberation.clone().unwrap_or_default();
        let title_file = file_config.title_generation.clone().unwrap_or_default();

        let api_base_url = args
            .api_base_url
            .or(file_config.api_base_url)
            .unwrap_or_else(|| "http://localhost:8080".to_string());

        let api_key = args.api_key.or(file_config.api_key);

        let ip_address = args
            .ip_address
            .or(file_config.ip_address)
            .filter(|s| !s.is_empty())
            .unwrap_or_else(detect_local_ipv4);

        let port = args.port.or(file_config.port).unwrap_or(8787);

        let data_dir = args
            .data_dir
            .or(file_config.data_dir)
            .unwrap_or_else(|| PathBuf::from("./council-data"));

        let council_members = args
            .council_members
            .or(models.council_members)
            .ok_or_else(|| CouncilError::ConfigInvalid("models.council_members is required".into()))?;
        if council_members.is_empty() {
            return Err(CouncilError::ConfigInvalid(
                "models.council_members must not be empty".into(),
            ));
        }

        let chairman = args
            .chairman
            .or(models.chairman)
            .ok_or_else(|| CouncilError::ConfigInvalid("models.chairman is required".into()))?;

        let max_rounds = deliberation_file
            .max_rounds
            .unwrap_or(council_core::limits::MAX_ROUNDS_CAP.min(5));
        if max_rounds < 1 || max_rounds > council_core::limits::MAX_ROUNDS_CAP {
            return Err(CouncilError::ConfigInvalid(format!(
                "deliberation.max_rounds must be in [1,{}], got {}",
                council_core::limits::MAX_ROUNDS_CAP,
                max_rounds
            )));
        }

        let rounds = args
            .rounds
            .or(deliberation_file.rounds)
            .unwrap_or(council_core::limits::DEFAULT_ROUNDS);
        if rounds < 1 || rounds > max_rounds {
            return Err(CouncilError::ConfigInvalid(format!(
                "deliberation.rounds ({rounds}) must be between 1 and max_rounds ({max_rounds})"
            )));
        }

        let enable_cross_review = deliberation_file.enable_cross_review.unwrap_or(true);
        let quality_threshold = deliberation_file
            .quality_threshold
            .unwrap_or(council_core::limits::DEFAULT_QUALITY_THRESHOLD);

        Ok(Settings {
            api_base_url,
            api_key,
            ip_address,
            port,
            data_dir,
            deliberation: DeliberationConfig {
                council_members,
                chairman,
                rounds,
                max_rounds,
                enable_cross_review,
                quality_threshold,
            },
            title_enabled: title_file.enabled.unwrap_or(true),
            title_max_concurrent: title_file
                .max_concurrent
                .unwrap_or(council_core::limits::DEFAULT_TITLE_MAX_CONCURRENT),
            title_timeout_secs: title_file
                .timeout_seconds
                .unwrap_or(council_core::limits::DEFAULT_TITLE_TIMEOUT_SECS),
            title_retry_attempts: title_file
                .retry_attempts
                .unwrap_or(council_core::limits::DEFAULT_TITLE_RETRY_ATTEMPTS),
            title_reasoning_hints: title_file
                .reasoning_hints
                .unwrap_or_else(|| vec!["thinking".into(), "reasoning".into(), "o1".into()]),
            model_endpoints: models.endpoints,
        })
    }

    /// Resolve a model id to a connection endpoint. Precedence per §3:
    /// per-model override field (if present and non-empty) → global field →
    /// built-in default. An empty string in an override is treated as
    /// "inherit", same as an absent one.
    pub fn resolve_endpoint(&self, model: &str) -> ModelEndpoint {
        let override_ = self.model_endpoints.get(model);
        let base_url = override_
            .and_then(|o| o.base_url.as_deref())
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| self.api_base_url.clone());
        let api_key = override_
            .and_then(|o| o.api_key.as_deref())
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .or_else(|| self.api_key.clone());
        ModelEndpoint {
            model: model.to_string(),
            base_url,
            api_key,
        }
    }
}

fn load_file_config(path: &Path) -> FileConfig {
    match std::fs::read_to_string(path) {
        Ok(contents) => toml::from_str(&contents).unwrap_or_else(|e| {
            tracing::warn!(path = %path.display(), error = %e, "failed to parse config file, using defaults");
            FileConfig::default()
        }),
        Err(_) => FileConfig::default(),
    }
}

/// Detect the primary local IPv4 address by opening a UDP "connection" to a
/// well-known public address (no packets are actually sent). Falls back to
/// loopback if detection fails.
fn detect_local_ipv4() -> String {
    UdpSocket::bind("0.0.0.0:0")
        .and_then(|socket| {
            socket.connect("8.8.8.8:80")?;
            socket.local_addr()
        })
        .map(|addr| addr.ip().to_string())
        .unwrap_or_else(|_| "127.0.0.1".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_args() -> Args {
        Args {
            config: Some(PathBuf::from("/nonexistent/council.toml")),
            api_base_url: Some("http://localhost:1234".into()),
            api_key: None,
            ip_address: Some("127.0.0.1".into()),
            port: Some(9000),
            council_members: Some(vec!["a".into(), "b".into()]),
            chairman: Some("chair".into()),
            rounds: None,
            data_dir: None,
        }
    }

    #[test]
    fn test_load_with_defaults() {
        let settings = Settings::load(base_args()).unwrap();
        assert_eq!(settings.deliberation.chairman, "chair");
        assert_eq!(settings.deliberation.council_members.len(), 2);
        assert_eq!(settings.deliberation.rounds, 1);
    }

    #[test]
    fn test_missing_chairman_is_invalid() {
        let mut args = base_args();
        args.chairman = None;
        let err = Settings::load(args).unwrap_err();
        assert!(matches!(err, CouncilError::ConfigInvalid(_)));
    }

    #[test]
    fn test_empty_council_is_invalid() {
        let mut args = base_args();
        args.council_members = Some(vec![]);
        let err = Settings::load(args).unwrap_err();
        assert!(matches!(err, CouncilError::ConfigInvalid(_)));
    }

    #[test]
    fn test_rounds_exceeding_max_rounds_is_invalid() {
        let mut args = base_args();
        args.rounds = Some(99);
        let err = Settings::load(args).unwrap_err();
        assert!(matches!(err, CouncilError::ConfigInvalid(_)));
    }

    #[test]
    fn test_cli_flag_wins_over_default() {
        // P12: CLI flag beats file/env/default regardless of load order.
        let settings = Settings::load(base_args()).unwrap();
        assert_eq!(settings.port, 9000);
    }

    #[test]
    fn test_resolve_endpoint_inherits_base_url() {
        let settings = Settings::load(base_args()).unwrap();
        let endpoint = settings.resolve_endpoint("chair");
        assert_eq!(endpoint.base_url, "http://localhost:1234");
        assert_eq!(endpoint.model, "chair");
    }

    #[test]
    fn test_resolve_endpoint_per_model_override_wins() {
        let mut settings = Settings::load(base_args()).unwrap();
        settings.model_endpoints.insert(
            "a".to_string(),
            FileEndpointOverride {
                base_url: Some("http://override:9999".into()),
                api_key: Some("override-key".into()),
            },
        );
        let endpoint = settings.resolve_endpoint("a");
        assert_eq!(endpoint.base_url, "http://override:9999");
        assert_eq!(endpoint.api_key.as_deref(), Some("override-key"));

        // Unrelated model still inherits the global endpoint.
        let other = settings.resolve_endpoint("b");
        assert_eq!(other.base_url, "http://localhost:1234");
    }

    #[test]
    fn test_resolve_endpoint_empty_override_inherits() {
        let mut settings = Settings::load(base_args()).unwrap();
        settings.model_endpoints.insert(
            "a".to_string(),
            FileEndpointOverride {
                base_url: Some(String::new()),
                api_key: None,
            },
        );
        let endpoint = settings.resolve_endpoint("a");
        assert_eq!(endpoint.base_url, "http://localhost:1234");
    }
}
