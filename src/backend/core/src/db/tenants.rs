//! Tenant namespaces.
//!
//! Each tenant owns one Postgres schema. The directory of tenants lives in
//! the shared `public.tenants` table.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::collections::HashMap;
use std::fmt;

use crate::error::{RelistError, Result};

const MAX_IDENTIFIER_LEN: usize = 63;

/// Stable tenant identifier, as carried in executor tokens.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TenantId(String);

impl TenantId {
    /// Lowercase ASCII letters, digits, `_` and `-`, starting with a letter or digit.
    pub fn parse(raw: impl Into<String>) -> Result<Self> {
        let raw = raw.into();
        let valid = !raw.is_empty()
            && raw.len() <= MAX_IDENTIFIER_LEN
            && raw
                .chars()
                .next()
                .is_some_and(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
            && raw
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-');

        if valid {
            Ok(Self(raw))
        } else {
            Err(RelistError::invalid_tenant(raw))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Conventional schema name for this tenant.
    pub fn default_schema(&self) -> String {
        format!("tenant_{}", self.0.replace('-', "_"))
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for TenantId {
    type Error = RelistError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(value)
    }
}

impl From<TenantId> for String {
    fn from(id: TenantId) -> Self {
        id.0
    }
}

/// A tenant and its namespace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tenant {
    pub id: TenantId,
    pub schema: String,
    pub active: bool,
}

impl Tenant {
    pub fn new(id: TenantId) -> Self {
        let schema = id.default_schema();
        Self {
            id,
            schema,
            active: true,
        }
    }

    /// The schema name, checked to be a plain identifier so it can be
    /// interpolated into `SET LOCAL search_path`.
    pub fn checked_schema(&self) -> Result<&str> {
        validate_schema_name(&self.schema)?;
        Ok(&self.schema)
    }
}

/// Accepts `[a-z_][a-z0-9_]*` up to 63 bytes, excluding reserved prefixes.
pub fn validate_schema_name(schema: &str) -> Result<()> {
    let mut chars = schema.chars();
    let first_ok = chars
        .next()
        .is_some_and(|c| c.is_ascii_lowercase() || c == '_');
    let rest_ok = chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');

    if !first_ok
        || !rest_ok
        || schema.len() > MAX_IDENTIFIER_LEN
        || schema.starts_with("pg_")
        || schema == "public"
        || schema == "information_schema"
    {
        return Err(RelistError::invalid_tenant(schema));
    }
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════════════
// Directory
// ═══════════════════════════════════════════════════════════════════════════════

/// Source of truth for which tenants exist and are active.
#[async_trait]
pub trait TenantDirectory: Send + Sync {
    async fn get(&self, id: &TenantId) -> Result<Option<Tenant>>;

    async fn active_tenants(&self) -> Result<Vec<Tenant>>;
}

/// Tenant directory held in memory.
#[derive(Debug, Default)]
pub struct InMemoryTenantDirectory {
    tenants: RwLock<HashMap<TenantId, Tenant>>,
}

impl InMemoryTenantDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tenants(tenants: impl IntoIterator<Item = Tenant>) -> Self {
        let directory = Self::new();
        for tenant in tenants {
            directory.upsert(tenant);
        }
        directory
    }

    pub fn upsert(&self, tenant: Tenant) {
        self.tenants.write().insert(tenant.id.clone(), tenant);
    }

    pub fn set_active(&self, id: &TenantId, active: bool) {
        if let Some(tenant) = self.tenants.write().get_mut(id) {
            tenant.active = active;
        }
    }
}

#[async_trait]
impl TenantDirectory for InMemoryTenantDirectory {
    async fn get(&self, id: &TenantId) -> Result<Option<Tenant>> {
        Ok(self.tenants.read().get(id).cloned())
    }

    async fn active_tenants(&self) -> Result<Vec<Tenant>> {
        let mut tenants: Vec<Tenant> = self
            .tenants
            .read()
            .values()
            .filter(|t| t.active)
            .cloned()
            .collect();
        tenants.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(tenants)
    }
}

/// Tenant directory backed by `public.tenants`.
#[derive(Clone)]
pub struct PgTenantDirectory {
    pool: PgPool,
}

#[derive(Debug, sqlx::FromRow)]
struct TenantRow {
    id: String,
    schema_name: String,
    active: bool,
}

impl TryFrom<TenantRow> for Tenant {
    type Error = RelistError;

    fn try_from(row: TenantRow) -> Result<Self> {
        Ok(Self {
            id: TenantId::parse(row.id)?,
            schema: row.schema_name,
            active: row.active,
        })
    }
}

impl PgTenantDirectory {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Register a tenant row. Creating the schema itself is provisioning and
    /// happens elsewhere.
    pub async fn register(&self, tenant: &Tenant) -> Result<()> {
        validate_schema_name(&tenant.schema)?;
        sqlx::query(
            r#"
            INSERT INTO tenants (id, schema_name, active)
            VALUES ($1, $2, $3)
            ON CONFLICT (id) DO UPDATE SET
                schema_name = EXCLUDED.schema_name,
                active = EXCLUDED.active
            "#,
        )
        .bind(tenant.id.as_str())
        .bind(&tenant.schema)
        .bind(tenant.active)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl TenantDirectory for PgTenantDirectory {
    async fn get(&self, id: &TenantId) -> Result<Option<Tenant>> {
        let row = sqlx::query_as::<_, TenantRow>(
            "SELECT id, schema_name, active FROM tenants WHERE id = $1",
        )
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(Tenant::try_from).transpose()
    }

    async fn active_tenants(&self) -> Result<Vec<Tenant>> {
        let rows = sqlx::query_as::<_, TenantRow>(
            "SELECT id, schema_name, active FROM tenants WHERE active ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut tenants = Vec::with_capacity(rows.len());
        for row in rows {
            match Tenant::try_from(row) {
                Ok(tenant) => tenants.push(tenant),
                Err(e) => tracing::warn!(error = %e, "Skipping tenant with invalid identifier"),
            }
        }
        Ok(tenants)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tenant_id_validation() {
        assert!(TenantId::parse("shop-42").is_ok());
        assert!(TenantId::parse("Shop").is_err());
        assert!(TenantId::parse("").is_err());
        assert!(TenantId::parse("a; DROP TABLE x").is_err());
        assert!(TenantId::parse("-lead").is_err());
    }

    #[test]
    fn test_schema_name_validation() {
        assert!(validate_schema_name("tenant_shop_42").is_ok());
        assert!(validate_schema_name("public").is_err());
        assert!(validate_schema_name("pg_catalog").is_err());
        assert!(validate_schema_name("tenant\"; --").is_err());
        assert!(validate_schema_name("9lives").is_err());
    }

    #[test]
    fn test_default_schema() {
        let tenant = Tenant::new(TenantId::parse("shop-42").unwrap());
        assert_eq!(tenant.schema, "tenant_shop_42");
        assert!(tenant.checked_schema().is_ok());
    }

    #[tokio::test]
    async fn test_in_memory_directory_filters_inactive() {
        let a = Tenant::new(TenantId::parse("a").unwrap());
        let b = Tenant::new(TenantId::parse("b").unwrap());
        let directory = InMemoryTenantDirectory::with_tenants([a.clone(), b.clone()]);
        directory.set_active(&b.id, false);

        let active = directory.active_tenants().await.unwrap();
        assert_eq!(active, vec![a]);
        assert!(directory.get(&b.id).await.unwrap().is_some());
    }
}
