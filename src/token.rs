//! Signed, time bounded session tokens.
//!
//! Tokens are plain JWTs signed with a shared HMAC secret. The server keeps
//! no record of what it issued: a token is valid as long as its signature
//! checks out and its expiry is in the future, there is no revocation.

use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use crate::conf::TokenConfig;
use crate::errors::{Result, SonoError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenKind {
    Access,
    Refresh,
}

/// Wire format of the claims.
#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: String,
    /// Expiry in whole seconds, rounded up.
    exp: i64,
    /// Exact expiry in nanoseconds since the epoch, the one actually checked.
    exp_ns: i64,
    kind: TokenKind,
    ext_id: String,
}

/// What a valid token says about its holder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub subject: String,
    pub kind: TokenKind,
    pub linked_identity: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: &'static str,
}

impl TokenPair {
    pub fn bearer(access_token: String, refresh_token: String) -> Self {
        TokenPair {
            access_token,
            refresh_token,
            token_type: "bearer",
        }
    }
}

#[derive(Clone)]
pub struct TokenCodec {
    algorithm: Algorithm,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    access_ttl: Duration,
    refresh_ttl: Duration,
}

impl std::fmt::Debug for TokenCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenCodec")
            .field("algorithm", &self.algorithm)
            .field("access_ttl", &self.access_ttl)
            .field("refresh_ttl", &self.refresh_ttl)
            .finish_non_exhaustive()
    }
}

impl TokenCodec {
    /// Only the HMAC family can be used with a shared secret.
    pub fn new(config: &TokenConfig) -> Result<Self> {
        let algorithm = Algorithm::from_str(&config.algorithm).map_err(|_| {
            anyhow::anyhow!("unknown token algorithm {}", config.algorithm)
        })?;
        if !matches!(
            algorithm,
            Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512
        ) {
            return Err(anyhow::anyhow!(
                "token algorithm {:?} needs a key pair, only HS256, HS384 and HS512 are supported",
                algorithm
            )
            .into());
        }
        if config.secret.is_empty() {
            return Err(anyhow::anyhow!("token secret cannot be empty").into());
        }
        if config.access_ttl_minutes <= 0 || config.refresh_ttl_days <= 0 {
            return Err(anyhow::anyhow!("token lifetimes must be positive").into());
        }
        let access_ttl = Duration::try_minutes(config.access_ttl_minutes).ok_or_else(|| {
            anyhow::anyhow!("access_ttl_minutes {} is out of range", config.access_ttl_minutes)
        })?;
        let refresh_ttl = Duration::try_days(config.refresh_ttl_days).ok_or_else(|| {
            anyhow::anyhow!("refresh_ttl_days {} is out of range", config.refresh_ttl_days)
        })?;

        Ok(TokenCodec {
            algorithm,
            encoding_key: EncodingKey::from_secret(config.secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(config.secret.as_bytes()),
            access_ttl,
            refresh_ttl,
        })
    }

    pub fn ttl(&self, kind: TokenKind) -> Duration {
        match kind {
            TokenKind::Access => self.access_ttl,
            TokenKind::Refresh => self.refresh_ttl,
        }
    }

    pub fn issue(
        &self,
        subject: &str,
        kind: TokenKind,
        linked_identity: &str,
        now: DateTime<Utc>,
    ) -> Result<String> {
        let expires_at = now
            .checked_add_signed(self.ttl(kind))
            .ok_or_else(|| anyhow::anyhow!("token expiry out of range"))?;
        let exp_ns = expires_at
            .timestamp_nanos_opt()
            .ok_or_else(|| anyhow::anyhow!("token expiry {expires_at} out of range"))?;
        let claims = Claims {
            sub: subject.to_string(),
            exp: expires_at.timestamp() + i64::from(expires_at.timestamp_subsec_nanos() > 0),
            exp_ns,
            kind,
            ext_id: linked_identity.to_string(),
        };
        let token = encode(&Header::new(self.algorithm), &claims, &self.encoding_key)
            .map_err(|err| anyhow::anyhow!("cannot sign token: {err}"))?;
        Ok(token)
    }

    /// Bad signature, wrong algorithm, garbage and expiry all come back as
    /// the same [`SonoError::InvalidToken`]. A token issued at `t` is valid
    /// for any `now < t + ttl`, to the nanosecond.
    pub fn validate(&self, token: &str, now: DateTime<Utc>) -> Result<Session> {
        let mut validation = Validation::new(self.algorithm);
        // expiry is checked against the caller's clock below
        validation.validate_exp = false;
        validation.set_required_spec_claims(&["exp", "sub"]);

        let data = decode::<Claims>(token, &self.decoding_key, &validation).map_err(|err| {
            log::debug!("rejecting token: {err}");
            SonoError::InvalidToken
        })?;
        let claims = data.claims;
        let expired = match now.timestamp_nanos_opt() {
            Some(now_ns) => now_ns >= claims.exp_ns,
            None => true,
        };
        if expired {
            log::debug!("rejecting token for {}: expired", claims.sub);
            return Err(SonoError::InvalidToken);
        }

        Ok(Session {
            subject: claims.sub,
            kind: claims.kind,
            linked_identity: claims.ext_id,
        })
    }

    pub fn issue_pair(&self, subject: &str, linked_identity: &str, now: DateTime<Utc>) -> Result<TokenPair> {
        Ok(TokenPair::bearer(
            self.issue(subject, TokenKind::Access, linked_identity, now)?,
            self.issue(subject, TokenKind::Refresh, linked_identity, now)?,
        ))
    }
}
