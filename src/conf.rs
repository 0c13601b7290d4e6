use figment::Figment;
use serde::Deserialize;
use std::path::PathBuf;

pub const YANDEX_AUTHORIZE_URL: &str = "https://oauth.yandex.ru/authorize";
pub const YANDEX_TOKEN_URL: &str = "https://oauth.yandex.ru/token";
pub const YANDEX_USERINFO_URL: &str = "https://login.yandex.ru/info";

/// Process wide settings. Extracted once at startup from the rocket figment
/// and handed to each component when it is built; never mutated afterward.
#[derive(Debug, Clone, Deserialize)]
pub struct SonoConfig {
    #[serde(default = "default_upload_root")]
    pub upload_root: PathBuf,
    #[serde(default = "default_max_upload_mib")]
    pub max_upload_mib: u64,
    #[serde(default)]
    pub first_superuser_external_id: Option<String>,
    pub token: TokenConfig,
    pub provider: ProviderConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TokenConfig {
    pub secret: String,
    #[serde(default = "default_algorithm")]
    pub algorithm: String,
    #[serde(default = "default_access_ttl_minutes")]
    pub access_ttl_minutes: i64,
    #[serde(default = "default_refresh_ttl_days")]
    pub refresh_ttl_days: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderConfig {
    pub client_id: String,
    pub client_secret: String,
    pub redirect_uri: String,
    #[serde(default = "default_authorize_url")]
    pub authorize_url: String,
    #[serde(default = "default_token_url")]
    pub token_url: String,
    #[serde(default = "default_userinfo_url")]
    pub userinfo_url: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_upload_root() -> PathBuf {
    PathBuf::from("uploads")
}

fn default_max_upload_mib() -> u64 {
    512
}

fn default_algorithm() -> String {
    "HS256".to_string()
}

fn default_access_ttl_minutes() -> i64 {
    30
}

fn default_refresh_ttl_days() -> i64 {
    7
}

fn default_authorize_url() -> String {
    YANDEX_AUTHORIZE_URL.to_string()
}

fn default_token_url() -> String {
    YANDEX_TOKEN_URL.to_string()
}

fn default_userinfo_url() -> String {
    YANDEX_USERINFO_URL.to_string()
}

fn default_timeout_secs() -> u64 {
    10
}

impl SonoConfig {
    pub fn from_figment(figment: &Figment) -> Result<Self, figment::Error> {
        figment.extract()
    }
}
