//! Login through the external provider and session token lifecycle.
//!
//! `complete_login` walks code exchange, profile fetch, identity linking and
//! token issuance in that order. Nothing is written locally before both
//! provider calls succeeded.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use reqwest::Url;

use crate::conf::SonoConfig;
use crate::db::{self, Runner, User};
use crate::errors::{Result, SonoError};
use crate::identity::{self, ExternalIdentity};
use crate::provider::IdentityProvider;
use crate::token::{TokenCodec, TokenKind, TokenPair};

pub struct SessionIssuer {
    codec: TokenCodec,
    provider: Arc<dyn IdentityProvider>,
    login_url: Url,
    bootstrap_superuser: Option<String>,
}

impl SessionIssuer {
    pub fn new(config: &SonoConfig, provider: Arc<dyn IdentityProvider>) -> Result<Self> {
        let mut login_url = Url::parse(&config.provider.authorize_url).map_err(|err| {
            anyhow::anyhow!(
                "invalid authorize url {}: {err}",
                config.provider.authorize_url
            )
        })?;
        login_url
            .query_pairs_mut()
            .append_pair("response_type", "code")
            .append_pair("client_id", &config.provider.client_id)
            .append_pair("redirect_uri", &config.provider.redirect_uri);

        Ok(SessionIssuer {
            codec: TokenCodec::new(&config.token)?,
            provider,
            login_url,
            bootstrap_superuser: config
                .first_superuser_external_id
                .clone()
                .filter(|id| !id.is_empty()),
        })
    }

    pub fn codec(&self) -> &TokenCodec {
        &self.codec
    }

    /// Where to send the browser to start a login.
    pub fn begin_login(&self) -> &Url {
        &self.login_url
    }

    pub async fn complete_login<D: Runner>(
        &self,
        db: &D,
        code: &str,
        now: DateTime<Utc>,
    ) -> Result<TokenPair> {
        let provider_token = self.provider.exchange_code(code).await?;
        let profile = self.provider.fetch_profile(&provider_token).await?;

        let external_id = match profile.id {
            Some(id) if !id.is_empty() => id,
            _ => {
                return Err(SonoError::UpstreamAuth(
                    "Could not get provider user id".to_string(),
                ))
            }
        };
        let identity = ExternalIdentity {
            external_id,
            email: profile.default_email,
            first_name: profile.first_name,
            last_name: profile.last_name,
        };

        let bootstrap = self.bootstrap_superuser.clone();
        let user = db
            .run(move |c| identity::find_or_link(c, &identity, bootstrap.as_deref()))
            .await?;
        log::info!("user {} logged in", user.id);

        self.codec
            .issue_pair(&user.id.to_string(), &user.external_id, now)
    }

    /// Trade a refresh token for a new pair. Every failure reads as
    /// [`SonoError::InvalidToken`] so callers can't tell an unknown user from
    /// an inactive one.
    pub async fn refresh<D: Runner>(
        &self,
        db: &D,
        token: &str,
        now: DateTime<Utc>,
    ) -> Result<TokenPair> {
        let session = self.codec.validate(token, now)?;
        if session.kind != TokenKind::Refresh {
            return Err(SonoError::InvalidToken);
        }

        let user = match self.load_user(db, &session.subject).await? {
            Some(user) if user.is_active => user,
            _ => return Err(SonoError::InvalidToken),
        };
        if session.linked_identity != user.external_id {
            log::info!(
                "refresh token of user {} linked to {} but user is now {}",
                user.id,
                session.linked_identity,
                user.external_id
            );
            return Err(SonoError::InvalidToken);
        }

        self.codec
            .issue_pair(&user.id.to_string(), &user.external_id, now)
    }

    /// Resolve the user behind an access token.
    pub async fn authenticate<D: Runner>(
        &self,
        db: &D,
        token: &str,
        now: DateTime<Utc>,
    ) -> Result<User> {
        let session = self.codec.validate(token, now)?;
        if session.kind != TokenKind::Access {
            return Err(SonoError::InvalidToken);
        }
        self.load_user(db, &session.subject)
            .await?
            .ok_or(SonoError::InvalidToken)
    }

    async fn load_user<D: Runner>(&self, db: &D, subject: &str) -> Result<Option<User>> {
        let user_id: i32 = match subject.parse() {
            Ok(id) => id,
            Err(_) => return Err(SonoError::InvalidToken),
        };
        Ok(db.run(move |c| db::get_user(c, user_id)).await?)
    }
}
