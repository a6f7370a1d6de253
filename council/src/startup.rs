//! Startup Validator (C13): confirms the configured backend is reachable
//! and every configured model is loaded before the HTTP surface starts
//! accepting connections.

use std::collections::HashSet;

use tracing::{error, info};

use crate::config::Settings;
use crate::errors::CouncilError;
use crate::model_client::ModelClient;

/// Validate `settings` against the live backend. Returns `Ok(())` if every
/// council member and the chairman are present in `/v1/models`, otherwise
/// the specific error (mapping to exit codes 2/3 per §6). Each required
/// model is resolved through `Settings::resolve_endpoint` first, so a
/// per-model endpoint override is checked against its own backend rather
/// than the global default.
pub async fn validate(settings: &Settings, client: &ModelClient) -> Result<(), CouncilError> {
    let mut required: Vec<&str> = settings
        .deliberation
        .council_members
        .iter()
        .map(String::as_str)
        .collect();
    required.push(&settings.deliberation.chairman);

    let endpoints: Vec<_> = required.iter().map(|model| settings.resolve_endpoint(model)).collect();

    let mut distinct_urls: Vec<&str> = endpoints.iter().map(|e| e.base_url.as_str()).collect();
    distinct_urls.sort_unstable();
    distinct_urls.dedup();

    let mut available: HashSet<String> = HashSet::new();
    for base_url in distinct_urls {
        let api_key = endpoints
            .iter()
            .find(|e| e.base_url == base_url)
            .and_then(|e| e.api_key.as_deref());
        let models = client.list_models(base_url, api_key).await.map_err(|e| {
            error!(base_url = %base_url, error = %e, "model backend unreachable");
            CouncilError::BackendUnreachable(format!("{base_url}: {e}"))
        })?;
        available.extend(models);
    }

    let missing: Vec<&str> = required
        .into_iter()
        .filter(|model| !available.contains(*model))
        .collect();

    if !missing.is_empty() {
        error!(?missing, "required models not loaded on backend");
        return Err(CouncilError::ModelNotLoaded(missing.join(", ")));
    }

    info!(
        council = ?settings.deliberation.council_members,
        chairman = %settings.deliberation.chairman,
        "startup validation passed"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeliberationConfig;
    use std::path::PathBuf;

    fn sample_settings() -> Settings {
        Settings {
            api_base_url: "http://localhost:8080".to_string(),
            api_key: None,
            ip_address: "127.0.0.1".to_string(),
            port: 8787,
            data_dir: PathBuf::from("./data"),
            deliberation: DeliberationConfig {
                council_members: vec!["a".to_string(), "b".to_string()],
                chairman: "chair".to_string(),
                rounds: 1,
                max_rounds: 3,
                enable_cross_review: true,
                quality_threshold: 1.5,
            },
            title_enabled: true,
            title_max_concurrent: 2,
            title_timeout_secs: 30,
            title_retry_attempts: 3,
            title_reasoning_hints: vec!["thinking".to_string()],
            model_endpoints: std::collections::HashMap::new(),
        }
    }

    #[tokio::test]
    async fn test_validate_against_unreachable_backend_maps_to_backend_unreachable() {
        let settings = sample_settings();
        let client = ModelClient::new();
        let result = validate(&settings, &client).await;
        // No server listening on localhost:8080 in the test environment.
        assert!(matches!(result, Err(CouncilError::BackendUnreachable(_))));
    }

    #[tokio::test]
    async fn test_validate_queries_overridden_endpoint_for_its_own_unreachability() {
        let mut settings = sample_settings();
        settings.model_endpoints.insert(
            "b".to_string(),
            crate::config::FileEndpointOverride {
                base_url: Some("http://localhost:8081".to_string()),
                api_key: None,
            },
        );
        let client = ModelClient::new();
        let result = validate(&settings, &client).await;
        // Neither localhost:8080 nor localhost:8081 has a server listening;
        // the override's distinct base URL must still be queried and fail.
        assert!(matches!(result, Err(CouncilError::BackendUnreachable(_))));
    }
}
