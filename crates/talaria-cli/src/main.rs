//! The talaria daemon.
//!
//! Everything is configured through `TL_*` environment variables; see
//! [`talaria::Config`]. The process runs the scan scheduler until it is
//! killed. The HTTP presentation layer is expected to clone the signal
//! sender (for `POST /run-scan`) and subscribe to the event broadcaster.

use std::sync::Arc;

use anyhow::{Context, Result};
use log::info;
use tokio::sync::mpsc;

use talaria::{Broadcaster, Config, Scanner, Store, skopeo};

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let config = Config::from_env().context("invalid configuration")?;
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(config.log_level.clone()),
    )
    .init();

    info!(
        "starting talaria against {} (branch {})",
        config.git_repo_url, config.git_branch
    );

    let config = Arc::new(config);
    let store = Arc::new(Store::open(&config.db_path).context("failed to open store")?);
    skopeo::write_auth_file(&config).context("failed to write registry auth file")?;

    let events = Broadcaster::default();
    let (signal_sender, signal_receiver) = mpsc::channel::<String>(8);

    let scanner = Scanner::new(Arc::clone(&config), store, events)?;

    // Keep the sender alive for the life of the process; the scheduler only
    // stops once every sender is gone.
    let _signal_sender = signal_sender;
    scanner.run(signal_receiver).await
}
