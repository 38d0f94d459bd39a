//! modreg - registers the modules listed in `MODULES` and reports the
//! registry contents.

use std::sync::Arc;

use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use modreg::cache::{MongoCoordinator, OwnerId};
use modreg::config::Config;
use modreg::database::{CONFIG_TABLE, MODULE_TABLE, ModuleRegistry, MongoStore};

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // If RUST_LOG is not set, default to "info" level for our crate
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("modreg=info,mongodb=warn"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .init();

    let config = Config::from_env()?;
    info!("Configuration loaded ({} module(s) in manifest)", config.modules.len());

    info!("Connecting to MongoDB...");
    let store = MongoStore::connect(&config.mongodb_uri, &config.mongodb_database).await?;
    store.ensure_indexes(MODULE_TABLE, &["slug", "class"]).await?;
    store.ensure_indexes(CONFIG_TABLE, &["module_id"]).await?;

    let coordinator = MongoCoordinator::new(store.database());
    let owner = OwnerId::for_process();
    info!("Running as {}", owner);

    let registry = ModuleRegistry::new(
        Arc::new(store),
        Arc::new(coordinator),
        owner,
        &config.registry,
    );

    for module in &config.modules {
        match registry
            .register(&module.slug, &module.name, &module.implementing_class, module.active)
            .await
        {
            Ok(id) => {
                if module.active {
                    registry.set_active(id, true).await?;
                }
                info!("Module '{}' -> {}", module.slug, id);
            }
            Err(e) => warn!("Failed to register module '{}': {}", module.slug, e),
        }
    }

    let modules = registry.modules().await?;
    let active = modules.iter().filter(|m| m.active).count();
    info!("{} module(s) registered, {} active", modules.len(), active);

    Ok(())
}
