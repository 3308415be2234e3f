use anyhow::Result;
use signal_hook::consts::{SIGINT, SIGTERM};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tracing::info;

use wavealert360::config::Config;
use wavealert360::supervisor::Supervisor;

fn main() -> Result<()> {
    let config = Config::load()?;
    wavealert360::install_tracing(config.debug);
    info!("wavealertd starting (run_dir {})", config.run_dir);

    let shutdown = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(SIGTERM, shutdown.clone())?;
    signal_hook::flag::register(SIGINT, shutdown.clone())?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async move {
        let supervisor = Supervisor::new(config, shutdown)?;
        supervisor.run().await
    })
}
