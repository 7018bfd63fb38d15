use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use shared::domain::UserId;

pub const MIN_TOKEN_TTL_SECONDS: i64 = 60;
pub const MAX_TOKEN_TTL_SECONDS: i64 = 24 * 60 * 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Publish,
    Subscribe,
    Presence,
}

/// Channel pattern to permitted operations. A pattern ending in `*` matches
/// every channel sharing its prefix; anything else matches exactly.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CapabilitySet(BTreeMap<String, BTreeSet<Operation>>);

impl CapabilitySet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn grant(mut self, pattern: impl Into<String>, operations: &[Operation]) -> Self {
        self.0
            .entry(pattern.into())
            .or_default()
            .extend(operations.iter().copied());
        self
    }

    pub fn allows(&self, channel: &str, operation: Operation) -> bool {
        self.0.iter().any(|(pattern, operations)| {
            operations.contains(&operation) && pattern_matches(pattern, channel)
        })
    }

    pub fn patterns(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }
}

fn pattern_matches(pattern: &str, channel: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => channel.starts_with(prefix),
        None => pattern == channel,
    }
}

/// The fixed capability set every end user connects with.
pub fn user_capabilities(user_id: &UserId) -> CapabilitySet {
    let full = [Operation::Publish, Operation::Subscribe, Operation::Presence];
    CapabilitySet::new()
        .grant("conversation:*", &full)
        .grant("presence:*", &full)
        .grant("moderation:*", &[Operation::Subscribe])
        .grant(
            format!("coaching:{user_id}:*"),
            &[Operation::Publish, Operation::Subscribe],
        )
}

#[derive(Debug, Clone)]
pub struct TokenConfig {
    pub api_key: String,
    pub api_secret: String,
    pub ttl_seconds: i64,
}

impl TokenConfig {
    pub fn effective_ttl_seconds(&self) -> i64 {
        self.ttl_seconds
            .clamp(MIN_TOKEN_TTL_SECONDS, MAX_TOKEN_TTL_SECONDS)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub iss: String,
    pub sub: String,
    pub iat: i64,
    pub exp: i64,
    pub capability: CapabilitySet,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

pub fn mint_token(
    cfg: &TokenConfig,
    user_id: &UserId,
    capabilities: &CapabilitySet,
) -> Result<IssuedToken, jsonwebtoken::errors::Error> {
    let now = Utc::now();
    let exp = now + Duration::seconds(cfg.effective_ttl_seconds());
    let claims = Claims {
        iss: cfg.api_key.clone(),
        sub: format!("user:{user_id}"),
        iat: now.timestamp(),
        exp: exp.timestamp(),
        capability: capabilities.clone(),
    };

    let token = encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(cfg.api_secret.as_bytes()),
    )?;
    let expires_at = Utc
        .timestamp_opt(claims.exp, 0)
        .single()
        .unwrap_or(exp);
    Ok(IssuedToken { token, expires_at })
}

pub fn verify_token(cfg: &TokenConfig, token: &str) -> Result<Claims, jsonwebtoken::errors::Error> {
    let mut validation = Validation::default();
    validation.set_issuer(&[cfg.api_key.as_str()]);
    let data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(cfg.api_secret.as_bytes()),
        &validation,
    )?;
    Ok(data.claims)
}

#[async_trait]
pub trait TokenIssuer: Send + Sync {
    async fn issue(
        &self,
        user_id: &UserId,
        capabilities: &CapabilitySet,
    ) -> anyhow::Result<IssuedToken>;
}

pub struct JwtTokenIssuer {
    config: TokenConfig,
}

impl JwtTokenIssuer {
    pub fn new(config: TokenConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl TokenIssuer for JwtTokenIssuer {
    async fn issue(
        &self,
        user_id: &UserId,
        capabilities: &CapabilitySet,
    ) -> anyhow::Result<IssuedToken> {
        Ok(mint_token(&self.config, user_id, capabilities)?)
    }
}

#[cfg(test)]
#[path = "tests/capability_tests.rs"]
mod tests;
