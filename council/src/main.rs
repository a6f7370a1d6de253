//! Council - multi-model deliberation orchestrator
//!
//! Fans a query out to a council of models, runs anonymized peer review
//! across one or more rounds, and has a designated chairman synthesize the
//! final answer. A background title service names new conversations from
//! their first message.

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::{fmt, EnvFilter};

mod anonymizer;
mod config;
mod controller;
mod conversation;
mod errors;
mod events;
mod model_client;
mod persistence;
mod push_broker;
mod ranking;
mod server;
mod stage_runner;
mod startup;
mod title_service;
mod token_tracker;

use config::{Args, Settings};
use model_client::ModelClient;
use persistence::FileStore;
use push_broker::PushBroker;
use stage_runner::StageRunner;
use title_service::{TitleService, TitleServiceConfig};

#[tokio::main]
async fn main() -> ExitCode {
    // Load .env from ~/.council/.env if present, else the current directory.
    let env_path = dirs::home_dir()
        .map(|h| h.join(".council").join(".env"))
        .filter(|p| p.exists());
    if let Some(path) = env_path {
        let _ = dotenvy::from_path(&path);
    } else {
        let _ = dotenvy::dotenv();
    }

    fmt().with_env_filter(EnvFilter::from_default_env()).init();

    let args = Args::parse();

    let settings = match Settings::load(args) {
        Ok(s) => s,
        Err(e) => {
            tracing::error!(error = %e, "configuration invalid");
            eprintln!("error: {e}");
            eprintln!("hint: check council.toml or the --config/--chairman/--council-members flags");
            return ExitCode::from(e.exit_code() as u8);
        }
    };
    let settings = Arc::new(settings);

    let client = Arc::new(ModelClient::new());

    if let Err(e) = startup::validate(&settings, &client).await {
        tracing::error!(error = %e, "startup validation failed");
        eprintln!("error: {e}");
        match &e {
            errors::CouncilError::BackendUnreachable(_) => {
                eprintln!("hint: confirm the model backend is running at {}", settings.api_base_url);
            }
            errors::CouncilError::ModelNotLoaded(_) => {
                eprintln!("hint: load the missing models on the backend before retrying");
            }
            _ => {}
        }
        return ExitCode::from(e.exit_code() as u8);
    }

    let persistence = match FileStore::open(settings.data_dir.clone()).await {
        Ok(store) => store as Arc<dyn persistence::PersistenceAdapter>,
        Err(e) => {
            tracing::error!(error = %e, "failed to open conversation store");
            eprintln!("error: {e}");
            return ExitCode::from(e.exit_code() as u8);
        }
    };

    let broker = PushBroker::new();

    let chairman_endpoint = settings.resolve_endpoint(&settings.deliberation.chairman);
    let title_config = TitleServiceConfig {
        enabled: settings.title_enabled,
        workers: council_core::limits::DEFAULT_TITLE_WORKERS,
        max_concurrent: settings.title_max_concurrent,
        timeout_secs: settings.title_timeout_secs,
        retry_attempts: settings.title_retry_attempts,
        reasoning_hints: settings.title_reasoning_hints.clone(),
    };
    let title_service = Arc::new(TitleService::new(
        title_config,
        Arc::clone(&client),
        chairman_endpoint,
        Arc::clone(&persistence),
        broker.clone(),
    ));
    title_service.spawn_workers();
    title_service.rescan_on_startup().await;

    let settings_for_resolve = Arc::clone(&settings);
    let runner = Arc::new(StageRunner::new(Arc::clone(&client), move |model: &str| {
        settings_for_resolve.resolve_endpoint(model)
    }));

    let controller = Arc::new(controller::Controller::new(
        runner,
        Arc::clone(&persistence),
        Arc::clone(&title_service),
    ));

    let state = server::AppState {
        settings: Arc::clone(&settings),
        persistence,
        controller,
        broker,
        client,
    };

    println!();
    println!("council listening on {}:{}", settings.ip_address, settings.port);
    println!(
        "council: {} members, chairman: {}",
        settings.deliberation.council_members.len(),
        settings.deliberation.chairman
    );
    println!();

    if let Err(e) = server::run(state).await {
        tracing::error!(error = %e, "server exited with error");
        eprintln!("error: {e}");
        return ExitCode::from(1);
    }

    ExitCode::SUCCESS
}
