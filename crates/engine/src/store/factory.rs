use std::sync::Arc;

use crate::store::{DatabaseConfig, SqliteStore, Store};

/// Connects, migrates and returns the configured store.
pub async fn create_store(config: &DatabaseConfig) -> crate::Result<Arc<dyn Store>> {
    config.validate().map_err(crate::Error::Config)?;

    let store = SqliteStore::connect(config).await?;
    store.init().await?;
    Ok(Arc::new(store))
}
