//! llmsv Server Entry Point

use clap::Parser;
use llmsv::cli::{Cli, Commands};
use llmsv::config::AppConfig;
use llmsv::service::ModelService;
use llmsv::{logging, server, AppState};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut config = AppConfig::from_env();
    let restore = match cli.command {
        Some(Commands::Serve(args)) => {
            config.host = args.host;
            config.port = args.port;
            !args.no_restore
        }
        None => true,
    };

    let _log_guard = logging::init(&config.supervisor.log_dir)?;
    config.validate()?;

    info!(
        backend = %config.backend.program,
        infer_backend = %config.backend.infer_backend,
        starting_port = config.starting_port,
        "Starting llmsv v{}",
        env!("CARGO_PKG_VERSION")
    );

    let service = ModelService::new(&config)?;
    if restore {
        let report = service.restore().await?;
        info!(
            restored = report.restored.len(),
            failed = report.failed.len(),
            "Restored saved deployments"
        );
        for (path, error) in &report.failed {
            warn!(path = %path.display(), error = %error, "Deployment was not restored");
        }
    }

    let bind_addr = format!("{}:{}", config.host, config.port);
    server::run(AppState::new(service), &bind_addr, config.enable_cors).await
}
