use deadpool_postgres::{Config, Pool, PoolConfig, Runtime};
use tokio_postgres::NoTls;
use tracing::info;

use crate::error::StoreError;

/// Create a connection pool from a database URL
pub fn create_pool(database_url: &str, max_size: Option<usize>) -> Result<Pool, StoreError> {
    let pg_config: tokio_postgres::Config = database_url
        .parse()
        .map_err(|e: tokio_postgres::Error| StoreError::Config(format!("invalid database URL: {}", e)))?;

    let mut cfg = Config::new();
    if let Some(host) = pg_config.get_hosts().first() {
        match host {
            tokio_postgres::config::Host::Tcp(h) => cfg.host = Some(h.clone()),
            #[cfg(unix)]
            tokio_postgres::config::Host::Unix(p) => {
                cfg.host = Some(p.to_string_lossy().to_string())
            }
        }
    }
    if let Some(port) = pg_config.get_ports().first() {
        cfg.port = Some(*port);
    }
    if let Some(user) = pg_config.get_user() {
        cfg.user = Some(user.to_string());
    }
    if let Some(password) = pg_config.get_password() {
        cfg.password = Some(String::from_utf8_lossy(password).to_string());
    }
    if let Some(dbname) = pg_config.get_dbname() {
        cfg.dbname = Some(dbname.to_string());
    }
    if let Some(max_size) = max_size {
        cfg.pool = Some(PoolConfig::new(max_size));
    }

    cfg.create_pool(Some(Runtime::Tokio1), NoTls)
        .map_err(|e| StoreError::Config(format!("failed to create pool: {}", e)))
}

/// Apply the market data schema and its change-notification triggers
pub async fn run_migrations(pool: &Pool) -> Result<(), StoreError> {
    let client = pool.get().await?;

    let migration_sql = include_str!("../migrations/001_initial.sql");
    client.batch_execute(migration_sql).await?;

    info!("database migrations applied successfully");
    Ok(())
}
