use std::future::Future;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;

mod app;
mod cli;
mod config;
mod eid;
mod lock;
mod rows;
mod semantic;
mod storage;
mod store;
#[cfg(test)]
mod tests;
mod web;

/// How long exit waits on blocking work such as an unfinished model download.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = cli::Args::parse();
    let paths = app::AppFactory::get_paths()?;

    match args.command {
        cli::Command::Daemon {} => block_on(web::start_daemon(paths)),
        command => block_on(cli::run(command, paths)),
    }
}

/// Run `future` on a fresh runtime. Blocking tasks still running afterwards
/// get [`SHUTDOWN_TIMEOUT`] before they are abandoned.
fn block_on(future: impl Future<Output = anyhow::Result<()>>) -> anyhow::Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    let result = runtime.block_on(future);
    runtime.shutdown_timeout(SHUTDOWN_TIMEOUT);
    result
}
