//! Long-running process that hosts the queue manager: loads configuration,
//! registers processors, starts every queue's worker pool plus the
//! scheduler, metrics loop, and (if enabled) the USB stream bridge, then
//! waits for a shutdown signal before draining.

use autoweave_core::config::Config;
use autoweave_core::job::JobKind;
use autoweave_core::registry::{
    processor_fn, with_logging, with_retry, with_timeout, ProcessorOutcome, ProcessorRegistryBuilder,
};
use autoweave_core::{logging, manager::QueueManager};

const SHUTDOWN_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

/// Registers a processor for every [`JobKind`] this deployment understands.
/// Real processors belong to the collaborating subsystems (USB daemon,
/// plugin loader, LLM batcher, memory indexer); this crate only defines the
/// registry and the decorators, so what's wired here is a logging-and-retry
/// stub that acknowledges the job without doing real work. A production
/// deployment replaces this function with one that registers the real
/// handlers.
fn build_registry() -> autoweave_core::registry::ProcessorRegistry {
    let mut builder = ProcessorRegistryBuilder::new();
    for kind in [
        JobKind::UsbAttach,
        JobKind::UsbDetach,
        JobKind::UsbScan,
        JobKind::PluginLoad,
        JobKind::PluginUnload,
        JobKind::PluginExecute,
        JobKind::PluginValidate,
        JobKind::PluginReload,
        JobKind::LlmBatch,
        JobKind::LlmEmbeddings,
        JobKind::LlmCompletion,
        JobKind::SystemMaintenance,
        JobKind::SystemCleanup,
        JobKind::SystemHealth,
        JobKind::SystemBackup,
        JobKind::MemoryVectorize,
        JobKind::MemoryIndex,
        JobKind::MemorySearch,
        JobKind::MemoryCleanup,
    ] {
        let base = processor_fn(move |ctx| async move {
            ctx.log(autoweave_core::job::LogLevel::Info, format!("{kind} stub processor ran"));
            Ok(ProcessorOutcome::empty())
        });
        let decorated = with_timeout(with_retry(with_logging(base), 1), std::time::Duration::from_secs(30));
        builder = builder.register(kind, decorated);
    }
    builder.build()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    logging::init_tracing();

    let config = load_config()?;
    let registry = build_registry();

    let manager = QueueManager::initialize(config, registry).await?;
    tracing::info!(queues = ?manager.queue_names(), "queue-server ready");

    manager.shutdown_consumer().wait_for_shutdown().await;
    tracing::info!("shutdown signal received, draining");
    manager.graceful_shutdown(SHUTDOWN_TIMEOUT).await?;

    Ok(())
}

/// Reads configuration from a `CONFIG_PATH`-named JSON file if set,
/// otherwise falls back to environment variables alone.
fn load_config() -> anyhow::Result<Config> {
    match std::env::var("CONFIG_PATH") {
        Ok(path) => {
            let raw = std::fs::read_to_string(&path)
                .map_err(|e| anyhow::anyhow!("reading config file {path:?}: {e}"))?;
            let config: Config = serde_json::from_str(&raw)
                .map_err(|e| anyhow::anyhow!("parsing config file {path:?}: {e}"))?;
            Ok(config)
        }
        Err(_) => Ok(Config::from_env()),
    }
}
