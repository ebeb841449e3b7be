//! One-shot entry point: detect the platform, load configuration, run a
//! single reconciliation tick and exit. Scheduling and mutual exclusion are
//! the invoker's business (a timer with concurrency 1).

use std::process::ExitCode;
use std::sync::Arc;

use tracing::{error, info};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use poolscale_application::AutoScaler;
use poolscale_domain::Controller;
use poolscale_infrastructure::{AwsController, AzureController, GcpController};
use poolscale_shared::{Platform, PlatformConfig, RuntimeConfig};

#[tokio::main]
async fn main() -> ExitCode {
    init_logging();

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %err, "could not complete the reconciliation tick");
            ExitCode::FAILURE
        }
    }
}

/// One JSON object per line on stdout; `RUST_LOG` overrides the filter.
fn init_logging() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().json())
        .init();
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let platform = Platform::detect()?;
    let cfg = RuntimeConfig::from_env(platform)?;

    let (group_key, group_id) = cfg.group_key_and_id();
    info!(
        platform = ?platform,
        group_key,
        group_id,
        worker_pool_id = %cfg.spacelift.worker_pool_id,
        "starting reconciliation tick"
    );

    let controller: Arc<dyn Controller> = match &cfg.platform {
        PlatformConfig::Aws(aws) => Arc::new(AwsController::new(&cfg.spacelift, aws).await?),
        PlatformConfig::Azure(azure) => {
            Arc::new(AzureController::new(&cfg.spacelift, azure).await?)
        }
        PlatformConfig::Gcp(gcp) => Arc::new(GcpController::new(&cfg.spacelift, gcp).await?),
    };

    AutoScaler::new(controller, cfg.scaling).scale().await?;

    info!("reconciliation tick finished");
    Ok(())
}
