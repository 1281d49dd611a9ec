//! The Tessera binary.

use std::{env, path::Path};

use tessera::{TesseraServer, logger};
use tessera_core::SchedulerConfig;
use tessera_utils::TilePos;
use tokio::{runtime::Builder, signal};

const CONFIG_PATH: &str = "config/tessera_config.json5";
const CRASH_DIR: &str = "crash-reports";

fn main() -> anyhow::Result<()> {
    logger::init()?;

    let config = SchedulerConfig::load_or_create(Path::new(CONFIG_PATH))?;
    let runtime = Builder::new_multi_thread()
        .worker_threads(config.resolved_worker_threads())
        .thread_name("tessera-worker")
        .enable_all()
        .build()?;

    let mut server = TesseraServer::new(config, runtime.handle().clone());
    let cancel_token = server.cancel_token.clone();
    runtime.spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            log::info!("Received shutdown signal");
            cancel_token.cancel();
        }
    });

    server.prime_spawn(TilePos::ZERO);
    let result = server.run(Path::new(CRASH_DIR));

    if let Some(dir) = env::var_os("TESSERA_DEBUG_DUMP")
        && let Err(err) = server.dump_debug(Path::new(&dir))
    {
        log::warn!("Failed to write debug dump: {err:#}");
    }
    server.shutdown();
    result
}
