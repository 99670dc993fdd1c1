//! Executor handshake authentication.
//!
//! The executor presents a bearer JWT whose subject is its tenant id. The
//! tenant must exist and be active; any tenant named separately in the
//! handshake is advisory and loses to the token.

use axum::http::{header, HeaderMap};
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::warn;

use crate::config::ExecutorConfig;
use crate::db::{Tenant, TenantDirectory, TenantId};
use crate::error::{ErrorCode, RelistError};

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Missing bearer token")]
    MissingToken,
    #[error("Token has expired")]
    Expired,
    #[error("Invalid token: {0}")]
    Invalid(String),
    #[error("Unknown tenant: {0}")]
    UnknownTenant(String),
    #[error("Tenant is inactive: {0}")]
    InactiveTenant(String),
    #[error("Tenant lookup failed: {0}")]
    Directory(String),
}

impl From<AuthError> for RelistError {
    fn from(err: AuthError) -> Self {
        let code = match &err {
            AuthError::MissingToken => ErrorCode::Unauthorized,
            AuthError::Expired => ErrorCode::TokenExpired,
            AuthError::Invalid(_) => ErrorCode::InvalidToken,
            AuthError::UnknownTenant(_) => ErrorCode::Forbidden,
            AuthError::InactiveTenant(_) => ErrorCode::TenantInactive,
            AuthError::Directory(_) => ErrorCode::InternalError,
        };
        RelistError::new(code, err.to_string())
    }
}

/// Claims carried by an executor token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorClaims {
    /// Tenant id
    pub sub: String,
    pub exp: i64,
    pub iat: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aud: Option<String>,
}

/// Verifies executor tokens against the tenant directory.
pub struct ExecutorAuth {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
    issuer: Option<String>,
    audience: Option<String>,
    directory: Arc<dyn TenantDirectory>,
}

impl ExecutorAuth {
    pub fn new(config: &ExecutorConfig, directory: Arc<dyn TenantDirectory>) -> Self {
        let mut validation = Validation::default();
        if let Some(issuer) = &config.jwt_issuer {
            validation.set_issuer(&[issuer]);
        }
        match &config.jwt_audience {
            Some(audience) => validation.set_audience(&[audience]),
            None => validation.validate_aud = false,
        }

        Self {
            encoding_key: EncodingKey::from_secret(config.jwt_secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(config.jwt_secret.as_bytes()),
            validation,
            issuer: config.jwt_issuer.clone(),
            audience: config.jwt_audience.clone(),
            directory,
        }
    }

    /// Mint a token for a tenant's executor.
    pub fn issue_token(&self, tenant: &TenantId, ttl: Duration) -> Result<String, AuthError> {
        let now = Utc::now();
        let claims = ExecutorClaims {
            sub: tenant.to_string(),
            exp: (now + ttl).timestamp(),
            iat: now.timestamp(),
            iss: self.issuer.clone(),
            aud: self.audience.clone(),
        };
        encode(&Header::default(), &claims, &self.encoding_key)
            .map_err(|e| AuthError::Invalid(format!("Failed to encode token: {}", e)))
    }

    pub fn verify(&self, token: &str) -> Result<ExecutorClaims, AuthError> {
        decode::<ExecutorClaims>(token, &self.decoding_key, &self.validation)
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => AuthError::Expired,
                _ => AuthError::Invalid(e.to_string()),
            })
    }

    /// Resolve the tenant a connecting executor acts for.
    pub async fn authenticate(
        &self,
        token: Option<&str>,
        claimed_tenant: Option<&str>,
    ) -> Result<Tenant, AuthError> {
        let token = token.ok_or(AuthError::MissingToken)?;
        let claims = self.verify(token)?;
        let tenant_id =
            TenantId::parse(&claims.sub).map_err(|_| AuthError::Invalid("Bad subject".into()))?;

        if let Some(claimed) = claimed_tenant {
            if claimed != tenant_id.as_str() {
                warn!(
                    verified = %tenant_id,
                    claimed = %claimed,
                    "Handshake tenant disagrees with token; using token"
                );
            }
        }

        let tenant = self
            .directory
            .get(&tenant_id)
            .await
            .map_err(|e| AuthError::Directory(e.to_string()))?
            .ok_or_else(|| AuthError::UnknownTenant(tenant_id.to_string()))?;

        if !tenant.active {
            return Err(AuthError::InactiveTenant(tenant_id.to_string()));
        }
        Ok(tenant)
    }
}

/// Token from an `Authorization: Bearer` header.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::InMemoryTenantDirectory;

    fn setup() -> (ExecutorAuth, Arc<InMemoryTenantDirectory>) {
        let directory = Arc::new(InMemoryTenantDirectory::with_tenants([
            Tenant::new(TenantId::parse("acme").unwrap()),
            Tenant::new(TenantId::parse("globex").unwrap()),
        ]));
        let auth = ExecutorAuth::new(&ExecutorConfig::default(), directory.clone());
        (auth, directory)
    }

    #[tokio::test]
    async fn test_valid_token_resolves_tenant() {
        let (auth, _) = setup();
        let token = auth
            .issue_token(&TenantId::parse("acme").unwrap(), Duration::hours(1))
            .unwrap();
        let tenant = auth.authenticate(Some(&token), None).await.unwrap();
        assert_eq!(tenant.id.as_str(), "acme");
    }

    #[tokio::test]
    async fn test_token_wins_over_claimed_tenant() {
        let (auth, _) = setup();
        let token = auth
            .issue_token(&TenantId::parse("acme").unwrap(), Duration::hours(1))
            .unwrap();
        let tenant = auth.authenticate(Some(&token), Some("globex")).await.unwrap();
        assert_eq!(tenant.id.as_str(), "acme");
    }

    #[tokio::test]
    async fn test_rejections() {
        let (auth, directory) = setup();

        assert!(matches!(
            auth.authenticate(None, None).await,
            Err(AuthError::MissingToken)
        ));
        assert!(matches!(
            auth.authenticate(Some("not-a-jwt"), None).await,
            Err(AuthError::Invalid(_))
        ));

        let expired = auth
            .issue_token(&TenantId::parse("acme").unwrap(), Duration::hours(-2))
            .unwrap();
        assert!(matches!(
            auth.authenticate(Some(&expired), None).await,
            Err(AuthError::Expired)
        ));

        let unknown = auth
            .issue_token(&TenantId::parse("initech").unwrap(), Duration::hours(1))
            .unwrap();
        assert!(matches!(
            auth.authenticate(Some(&unknown), None).await,
            Err(AuthError::UnknownTenant(_))
        ));

        directory.set_active(&TenantId::parse("globex").unwrap(), false);
        let inactive = auth
            .issue_token(&TenantId::parse("globex").unwrap(), Duration::hours(1))
            .unwrap();
        assert!(matches!(
            auth.authenticate(Some(&inactive), None).await,
            Err(AuthError::InactiveTenant(_))
        ));
    }

    #[test]
    fn test_bearer_token_parsing() {
        let mut headers = HeaderMap::new();
        assert_eq!(bearer_token(&headers), None);
        headers.insert(header::AUTHORIZATION, "Bearer abc.def".parse().unwrap());
        assert_eq!(bearer_token(&headers), Some("abc.def"));
    }
}
