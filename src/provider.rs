use std::time::Duration;

use serde::{Deserialize, Deserializer};

use crate::conf::ProviderConfig;
use crate::errors::{Result, SonoError};

/// Profile as returned by the provider's user info endpoint. Every field is
/// optional on the wire, the session issuer decides what is mandatory.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ProviderProfile {
    #[serde(default, deserialize_with = "string_or_number")]
    pub id: Option<String>,
    #[serde(default)]
    pub default_email: Option<String>,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
}

/// The two calls made to the third party once the user came back with an
/// authorization code.
#[rocket::async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Trade the authorization code for a provider access token.
    async fn exchange_code(&self, code: &str) -> Result<String>;

    async fn fetch_profile(&self, access_token: &str) -> Result<ProviderProfile>;
}

#[derive(Debug, Deserialize)]
struct CodeExchange {
    access_token: Option<String>,
}

/// OAuth2 provider reached over HTTP, Yandex flavoured: the code exchange is
/// a form POST and the user info call authenticates with `OAuth <token>`.
#[derive(Debug, Clone)]
pub struct HttpProvider {
    client: reqwest::Client,
    token_url: String,
    userinfo_url: String,
    client_id: String,
    client_secret: String,
}

impl HttpProvider {
    pub fn new(config: &ProviderConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|err| anyhow::anyhow!("cannot build http client: {err}"))?;
        Ok(HttpProvider {
            client,
            token_url: config.token_url.clone(),
            userinfo_url: config.userinfo_url.clone(),
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone(),
        })
    }
}

fn upstream(context: &str, err: reqwest::Error) -> SonoError {
    log::error!("{context}: {err}");
    match err.status() {
        Some(status) => SonoError::UpstreamAuth(format!("{context}: HTTP {status}")),
        None => SonoError::UpstreamAuth(context.to_string()),
    }
}

#[rocket::async_trait]
impl IdentityProvider for HttpProvider {
    async fn exchange_code(&self, code: &str) -> Result<String> {
        let form = [
            ("grant_type", "authorization_code"),
            ("code", code),
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
        ];
        let exchange: CodeExchange = self
            .client
            .post(&self.token_url)
            .form(&form)
            .send()
            .await
            .and_then(|resp| resp.error_for_status())
            .map_err(|err| upstream("code exchange failed", err))?
            .json()
            .await
            .map_err(|err| upstream("unreadable code exchange response", err))?;

        match exchange.access_token {
            Some(token) if !token.is_empty() => Ok(token),
            _ => Err(SonoError::UpstreamAuth(
                "Could not get provider access token".to_string(),
            )),
        }
    }

    async fn fetch_profile(&self, access_token: &str) -> Result<ProviderProfile> {
        self.client
            .get(&self.userinfo_url)
            .header(reqwest::header::AUTHORIZATION, format!("OAuth {access_token}"))
            .send()
            .await
            .and_then(|resp| resp.error_for_status())
            .map_err(|err| upstream("user info request failed", err))?
            .json()
            .await
            .map_err(|err| upstream("unreadable user info response", err))
    }
}

fn string_or_number<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Id {
        Text(String),
        Number(i64),
    }

    Ok(match Option::<Id>::deserialize(deserializer)? {
        Some(Id::Text(s)) => Some(s),
        Some(Id::Number(n)) => Some(n.to_string()),
        None => None,
    })
}
