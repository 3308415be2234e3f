use anyhow::Result;
use signal_hook::consts::{SIGINT, SIGTERM};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tracing::{error, info};

use wavealert360::config::Config;
use wavealert360::led::LedService;

fn main() -> Result<()> {
    let config = Config::load()?;
    wavealert360::install_tracing(config.debug);
    info!("wavealert-led starting");

    let shutdown = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(SIGTERM, shutdown.clone())?;
    signal_hook::flag::register(SIGINT, shutdown.clone())?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async move {
        let service = match LedService::new(config, shutdown) {
            Ok(service) => service,
            Err(err) => {
                // Lock contention is fatal for the entering instance.
                error!("LED service cannot start: {:#}", err);
                return Err(err);
            }
        };
        service.run().await
    })
}
