use std::process::ExitCode;

use ef_consume::cancellation::Cancellation;
use ef_consume::config::RunnerConfig;
use ef_consume::filter::Filter;
use ef_consume::models::result::log_results;
use ef_consume::models::suite::FixtureSuite;
use tracing::{error, info, warn};
use tracing_subscriber::{filter::EnvFilter, FmtSubscriber};

/// Consumes the fixtures under `FIXTURES_PATH` with the transport selected by
/// `CONSUME_MODE`. Exits non-zero when any fixture fails.
#[tokio::main]
async fn main() -> eyre::Result<ExitCode> {
    let config = RunnerConfig::load()?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("ef_consume=info,ef_fixtures=info"));
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let skip = match &config.skip_file {
        Some(path) => Filter::load_file(path)?,
        None => Filter::default(),
    };
    let suite = FixtureSuite::new(&config.fixtures_path, skip);

    let cancel = Cancellation::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                warn!("interrupted, finishing in-flight fixtures");
                on_signal.cancel();
            }
            Err(err) => error!("could not listen for ctrl-c: {err}"),
        }
    });

    let results = suite.run(&config, cancel).await?;
    let tally = log_results(&results);
    if tally.failed > 0 {
        return Ok(ExitCode::FAILURE);
    }
    info!("all fixtures passed");
    Ok(ExitCode::SUCCESS)
}
