//! MySQL routing store

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::mysql::{MySqlPool, MySqlPoolOptions};
use tracing::{debug, warn};

use super::{ACQUIRE_TIMEOUT, RoutingStore};

/// Routing store backed by the `devices` table in MySQL.
#[derive(Debug, Clone)]
pub struct MysqlStore {
    pool: MySqlPool,
}

impl MysqlStore {
    /// Create a store over a lazily-connected pool.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection string cannot be parsed.
    pub fn connect(connection_string: &str, max_connections: u32) -> Result<Self> {
        let pool = MySqlPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(ACQUIRE_TIMEOUT)
            .connect_lazy(connection_string)
            .context("invalid MySQL connection string")?;
        Ok(Self { pool })
    }
}

#[async_trait]
impl RoutingStore for MysqlStore {
    async fn query(&self, guid: &str) -> Option<String> {
        let instance = sqlx::query_scalar::<_, Option<String>>(
            "SELECT mpsinstance FROM devices WHERE guid = ?",
        )
        .bind(guid)
        .fetch_optional(&self.pool)
        .await;

        match instance {
            Ok(row) => row.flatten().filter(|host| !host.is_empty()),
            Err(e) => {
                warn!("instance lookup failed for device {}: {}", guid, e);
                None
            }
        }
    }

    async fn health(&self) -> bool {
        match sqlx::query("SELECT 1").fetch_one(&self.pool).await {
            Ok(_) => true,
            Err(e) => {
                debug!("health probe failed: {}", e);
                false
            }
        }
    }
}
