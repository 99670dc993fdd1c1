//! Database layer for Relist.
//!
//! Uses PostgreSQL with sqlx. Shared tables live in `public`; every tenant
//! has its own schema selected per transaction through `search_path`.

pub mod tenants;

pub use tenants::{
    validate_schema_name, InMemoryTenantDirectory, PgTenantDirectory, Tenant, TenantDirectory,
    TenantId,
};

use sqlx::{postgres::PgPoolOptions, PgPool, Postgres, Transaction};

use crate::config::DatabaseConfig;
use crate::error::{RelistError, Result};
use crate::jobs::ActionRegistry;

/// Database connection and shared-schema operations.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Create a new database connection pool.
    pub async fn new(config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.acquire_timeout)
            .connect(&config.url)
            .await?;

        Ok(Self { pool })
    }

    /// Wrap an existing pool.
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run the shared-schema migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| RelistError::from(sqlx::Error::Migrate(Box::new(e))))?;
        Ok(())
    }

    /// Get the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Upsert the action reference table from the registry.
    pub async fn sync_action_types(&self, registry: &ActionRegistry) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for def in registry.definitions() {
            sqlx::query(
                r#"
                INSERT INTO action_types (code, name, mutating, default_priority, default_max_retries, rpc_class)
                VALUES ($1, $2, $3, $4, $5, $6)
                ON CONFLICT (code) DO UPDATE SET
                    name = EXCLUDED.name,
                    mutating = EXCLUDED.mutating,
                    default_priority = EXCLUDED.default_priority,
                    default_max_retries = EXCLUDED.default_max_retries,
                    rpc_class = EXCLUDED.rpc_class
                "#,
            )
            .bind(def.code.as_str())
            .bind(&def.name)
            .bind(def.mutating)
            .bind(def.default_priority.score())
            .bind(def.default_max_retries as i32)
            .bind(def.rpc_class.as_str())
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }
}

/// Begin a transaction scoped to one tenant's schema.
pub async fn begin_tenant_tx(
    pool: &PgPool,
    tenant: &Tenant,
) -> Result<Transaction<'static, Postgres>> {
    let schema = tenant.checked_schema()?;
    let mut tx = pool.begin().await?;
    // Identifiers cannot be bound; the schema was validated above.
    sqlx::query(&format!("SET LOCAL search_path TO \"{}\", public", schema))
        .execute(&mut *tx)
        .await?;
    Ok(tx)
}
