//! Azure PostgreSQL action: run SQL scripts against an Azure database
//!
//! Probes the server with psql. When the runner cannot reach it, a temporary
//! firewall rule is added for the runner's address, the scripts run, and the
//! rule is removed again on the way out.

use std::process::ExitCode;
use std::sync::Arc;

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

mod azure;
mod config;
mod errors;
mod executor;
mod files;
mod inputs;
mod orchestrator;
mod psql;
mod telemetry;
mod workflow;

use azure::{AzureConnector, HttpPublicIpSource};
use config::ActionConfig;
use errors::ActionError;
use executor::PsqlScriptRunner;
use inputs::ActionInputs;
use orchestrator::{Orchestrator, RunReport};
use psql::probe::PsqlProbe;
use psql::PsqlTool;

#[tokio::main]
async fn main() -> ExitCode {
    let config = config::load_config();
    init_logging(config.as_ref().ok().and_then(|c| c.logging.level.as_deref()));

    info!("Azure PostgreSQL action v{}", env!("CARGO_PKG_VERSION"));

    let user_agent = telemetry::UserAgentGuard::install();
    let result = match &config {
        Ok(config) => run(config, user_agent.value()).await,
        Err(e) => Err(ActionError::configuration(format!("{e:#}"))),
    };
    drop(user_agent);

    match result {
        Ok(report) => {
            info!(
                "Done: {} file(s) executed{}",
                report.files_executed,
                if report.firewall_rule_added { " through a temporary firewall rule" } else { "" }
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("Error occurred while running action:\n{e}");
            workflow::error(&e.to_string());
            ExitCode::FAILURE
        }
    }
}

async fn run(config: &ActionConfig, user_agent: &str) -> Result<RunReport, ActionError> {
    match &config.loaded_from {
        Some(path) => info!("Configuration loaded from {}", path.display()),
        None => info!("No configuration file found, using defaults"),
    }

    let inputs = ActionInputs::from_env()?;

    let tool = Arc::new(PsqlTool::new(&config.psql));
    let ip_source = HttpPublicIpSource::new(&config.azure.public_ip_endpoint)
        .map_err(ActionError::provisioning)?;

    let orchestrator = Orchestrator::new(
        Arc::new(PsqlProbe::new(tool.clone())),
        Arc::new(AzureConnector::new(user_agent, config.azure.clone())),
        Arc::new(ip_source),
        Arc::new(PsqlScriptRunner::new(tool)),
    );

    orchestrator.run(&inputs).await
}

/// `RUST_LOG` wins; then the config file; then `RUNNER_DEBUG=1` for debug.
fn init_logging(configured_level: Option<&str>) {
    let runner_debug = std::env::var("RUNNER_DEBUG").as_deref() == Ok("1");
    let level = configured_level.unwrap_or(if runner_debug { "debug" } else { "info" });
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_level(true)
        .compact()
        .init();
}
