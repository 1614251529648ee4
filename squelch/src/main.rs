mod config;
mod logging;

use clap::Parser;
use config::{Config, ConfigError};
use metrics_exporter_prometheus::PrometheusBuilder;
use patrol::bootstrap::{BootstrapError, install_rules};
use patrol::metrics_defs::{ALL_METRICS, VERSION_DETAILS};
use patrol::patrol::PatrolError;
use patrol::{Components, SetupError};
use shared::admin_service::AdminService;
use shared::gauge;
use shared::http::run_http_service;
use shared::metrics_defs::describe_metrics;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::signal;
use tokio::task::JoinHandle;

const VERSION: &str = env!("CARGO_PKG_VERSION");
// Versions of the backend and rule set this build was released against.
const PROMETHEUS_VERSION: &str = match option_env!("SQUELCH_PROMETHEUS_VERSION") {
    Some(v) => v,
    None => "undefined",
};
const PROMETHEUS_RULES_VERSION: &str = match option_env!("SQUELCH_PROMETHEUS_RULES_VERSION") {
    Some(v) => v,
    None => "undefined",
};

#[derive(Parser)]
#[command(name = "squelch", disable_version_flag = true)]
struct Cli {
    #[arg(long, default_value = "squelch.yaml")]
    config_file: PathBuf,

    /// Print version information and exit
    #[arg(long)]
    version: bool,
}

#[derive(thiserror::Error, Debug)]
enum SquelchError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Setup(#[from] SetupError),
    #[error("could not install metrics recorder: {0}")]
    Metrics(#[from] metrics_exporter_prometheus::BuildError),
    #[error("bootstrap failed: {0}")]
    Bootstrap(#[from] BootstrapError),
    #[error("admin listener failed: {0}")]
    Admin(#[from] std::io::Error),
    #[error("admin listener task failed: {0}")]
    AdminTask(#[from] tokio::task::JoinError),
    #[error(transparent)]
    Patrol(#[from] PatrolError),
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    if cli.version {
        print!(
            "version: {VERSION}\nprometheus: {PROMETHEUS_VERSION}\nprometheus-rules: {PROMETHEUS_RULES_VERSION}\n"
        );
        return ExitCode::FAILURE;
    }

    let config = match Config::from_file(&cli.config_file) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}: {e}", cli.config_file.display());
            return ExitCode::FAILURE;
        }
    };

    let _sentry = logging::init(&config.common.logging);

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            tracing::error!(error = %e, "could not start runtime");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(config)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "squelch exited with error");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: Config) -> Result<(), SquelchError> {
    let metrics = PrometheusBuilder::new().install_recorder()?;
    describe_metrics(ALL_METRICS);
    gauge!(
        VERSION_DETAILS,
        "version" => VERSION,
        "prometheus_version" => PROMETHEUS_VERSION,
        "prometheus_rules_version" => PROMETHEUS_RULES_VERSION
    )
    .set(1.0);

    let Components {
        patrol,
        bootstrap_reconciler,
    } = patrol::build(&config.patrol)?;

    // Raised by the patrol task once bootstrap is done and the loop runs.
    let ready = Arc::new(AtomicBool::new(false));
    let is_ready = {
        let ready = ready.clone();
        move || ready.load(Ordering::Relaxed)
    };
    let admin = AdminService::new(is_ready, move || metrics.render());

    let host = config.common.admin_listener.host.clone();
    let port = config.common.admin_listener.port;
    let mut admin_task =
        tokio::spawn(async move { run_http_service::<_, _, std::io::Error>(&host, port, admin).await });

    let mut shutdown = tokio::spawn(wait_for_shutdown());

    if let Some(bootstrap) = &config.patrol.bootstrap {
        let (result, stop) =
            run_to_completion(install_rules(bootstrap, &bootstrap_reconciler), &mut shutdown).await;
        result?;
        if stop {
            admin_task.abort();
            return Ok(());
        }
    }

    let patrol = patrol.spawn(ready);

    tokio::select! {
        _ = &mut shutdown => {}
        result = &mut admin_task => {
            result??;
        }
    }

    let grace = config.common.shutdown_grace();
    tracing::info!(?grace, "shutting down");
    patrol.shutdown(grace).await?;
    admin_task.abort();

    Ok(())
}

/// Drives `work` to the end even when `shutdown` completes first. The flag is
/// set when shutdown was requested meanwhile; `shutdown` is not polled again
/// in that case.
async fn run_to_completion<F: Future>(
    work: F,
    shutdown: &mut JoinHandle<()>,
) -> (F::Output, bool) {
    tokio::pin!(work);
    let mut requested = false;

    loop {
        tokio::select! {
            output = &mut work => return (output, requested),
            _ = &mut *shutdown, if !requested => {
                tracing::info!("shutdown requested, finishing bootstrap first");
                requested = true;
            }
        }
    }
}

async fn wait_for_shutdown() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "could not listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "could not listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("received SIGINT"),
        _ = terminate => tracing::info!("received SIGTERM"),
    }
}
