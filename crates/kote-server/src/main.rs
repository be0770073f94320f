use std::sync::Arc;

use anyhow::Context;
use kote_db::{DatabaseConfig, PermissionLevel, Store, SETTING_PREFIX};
use kote_loader::{
    builtin, ChatClient, CommandWorker, Dispatcher, LoaderConfig, ModuleManager, QueueHandle,
    RegistrySet, SandboxConfig,
};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

mod console;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = LoaderConfig::from_env().context("failed to read loader config")?;
    tracing::info!(
        config = %config.config_file.display(),
        plugin_dir = %config.plugin_dir.display(),
        "starting kote"
    );

    // Database connection; migrations run on open
    let db_config = DatabaseConfig::from_env();
    tracing::info!("opening database...");
    let store = Arc::new(
        Store::open(&db_config)
            .await
            .context("failed to open database")?,
    );

    let Some(owner_id) = config.owner_id else {
        anyhow::bail!("no owner configured; set KOTE_OWNER_ID or owner_id in the config file");
    };
    store
        .set_user_level(owner_id, PermissionLevel::Owner)
        .await
        .context("failed to record owner")?;
    if store.setting(SETTING_PREFIX).is_none() {
        store
            .set_setting(SETTING_PREFIX, &config.default_prefix)
            .await
            .context("failed to seed command prefix")?;
    }

    tokio::fs::create_dir_all(&config.plugin_dir)
        .await
        .with_context(|| format!("failed to create {}", config.plugin_dir.display()))?;

    let client = Arc::new(console::ConsoleClient::new());
    let dispatcher = Arc::new(Dispatcher::new(
        client.clone() as Arc<dyn ChatClient>,
        RegistrySet::shared(),
    ));
    let (queue, receiver) = QueueHandle::channel();
    let manager = ModuleManager::builder(config, store, dispatcher.clone(), queue)
        .sandbox(SandboxConfig::from_env())
        .natives(builtin::all())
        .build();

    let worker = CommandWorker::new(manager.clone(), receiver);
    let results = worker.startup().await;
    let failed = results.iter().filter(|r| r.is_error()).count();
    tracing::info!(
        loaded = results.len() - failed,
        failed,
        prefix = %manager.prefix(),
        "modules loaded"
    );
    for result in results.iter().filter(|r| r.is_error()) {
        tracing::warn!(module = %result.module, "{result}");
    }

    let cancel = CancellationToken::new();
    let worker_handle = worker.spawn(cancel.clone());
    let console_handle = tokio::spawn(console::run(
        client,
        dispatcher,
        owner_id,
        cancel.clone(),
    ));

    // Closing stdin leaves the mailbox running; only a signal stops the bot.
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
    }
    tracing::info!("shutting down");
    cancel.cancel();

    if let Err(e) = worker_handle.await {
        tracing::error!(error = %e, "command worker panicked");
    }
    console_handle.abort();
    Ok(())
}
