//! Server configuration read from the environment.
//!
//! Secrets are wrapped in [`SecretString`] and only exposed where they are
//! used. Provider credentials are optional: a provider without them is simply
//! not offered.

use std::{path::PathBuf, time::Duration};

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use secrecy::SecretString;
use thiserror::Error;

const DEFAULT_DATABASE_URL: &str = "sqlite://feedback-hub.db";
const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 8080;
const DEFAULT_JWT_TTL_HOURS: i64 = 24;
const DEFAULT_HEALTH_CHECK_INTERVAL_SECS: u64 = 300;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("environment variable {0} is not set")]
    Missing(&'static str),
    #[error("environment variable {name} is invalid: {reason}")]
    Invalid { name: &'static str, reason: String },
}

/// OAuth application credentials for one provider.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub client_id: String,
    pub client_secret: SecretString,
    /// Override of the provider API base URL.
    pub api_base: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SlackConfig {
    pub oauth: ProviderConfig,
    pub signing_secret: SecretString,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub database_url: String,
    pub host: String,
    pub port: u16,
    pub public_base_url: String,
    pub jwt_secret: SecretString,
    pub jwt_ttl: chrono::Duration,
    pub credentials_key: SecretString,
    pub migrations_dir: PathBuf,
    pub health_check_interval: Duration,
    pub slack: Option<SlackConfig>,
    pub zendesk: Option<ProviderConfig>,
    pub intercom: Option<ProviderConfig>,
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build the configuration from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| {
            lookup(name)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let database_url =
            var("DATABASE_URL").unwrap_or_else(|| DEFAULT_DATABASE_URL.to_string());
        let host = var("HOST").unwrap_or_else(|| DEFAULT_HOST.to_string());
        let port = parse_or("PORT", var("PORT"), DEFAULT_PORT)?;
        let public_base_url = var("PUBLIC_BASE_URL")
            .unwrap_or_else(|| format!("http://{host}:{port}"))
            .trim_end_matches('/')
            .to_string();
        url::Url::parse(&public_base_url).map_err(|e| ConfigError::Invalid {
            name: "PUBLIC_BASE_URL",
            reason: e.to_string(),
        })?;

        let jwt_secret = var("JWT_SECRET").ok_or(ConfigError::Missing("JWT_SECRET"))?;
        let jwt_key = BASE64.decode(&jwt_secret).map_err(|e| ConfigError::Invalid {
            name: "JWT_SECRET",
            reason: format!("not valid base64: {e}"),
        })?;
        if jwt_key.len() < 32 {
            return Err(ConfigError::Invalid {
                name: "JWT_SECRET",
                reason: "must decode to at least 32 bytes".to_string(),
            });
        }

        let jwt_ttl_hours =
            parse_or("JWT_TTL_HOURS", var("JWT_TTL_HOURS"), DEFAULT_JWT_TTL_HOURS)?;
        if jwt_ttl_hours <= 0 {
            return Err(ConfigError::Invalid {
                name: "JWT_TTL_HOURS",
                reason: "must be positive".to_string(),
            });
        }

        let credentials_key =
            var("CREDENTIALS_KEY").ok_or(ConfigError::Missing("CREDENTIALS_KEY"))?;
        match BASE64.decode(&credentials_key) {
            Ok(key) if key.len() == 32 => {}
            Ok(key) => {
                return Err(ConfigError::Invalid {
                    name: "CREDENTIALS_KEY",
                    reason: format!("must decode to 32 bytes, got {}", key.len()),
                });
            }
            Err(e) => {
                return Err(ConfigError::Invalid {
                    name: "CREDENTIALS_KEY",
                    reason: format!("not valid base64: {e}"),
                });
            }
        }

        let migrations_dir = var("MIGRATIONS_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(db::default_migrations_dir);

        let health_secs = parse_or(
            "HEALTH_CHECK_INTERVAL_SECS",
            var("HEALTH_CHECK_INTERVAL_SECS"),
            DEFAULT_HEALTH_CHECK_INTERVAL_SECS,
        )?;
        if health_secs == 0 {
            return Err(ConfigError::Invalid {
                name: "HEALTH_CHECK_INTERVAL_SECS",
                reason: "must be positive".to_string(),
            });
        }

        let slack = match provider_config(
            &var,
            "SLACK_CLIENT_ID",
            "SLACK_CLIENT_SECRET",
            "SLACK_API_BASE",
        )? {
            Some(oauth) => Some(SlackConfig {
                oauth,
                signing_secret: var("SLACK_SIGNING_SECRET")
                    .map(SecretString::from)
                    .ok_or(ConfigError::Missing("SLACK_SIGNING_SECRET"))?,
            }),
            None => None,
        };
        let zendesk = provider_config(
            &var,
            "ZENDESK_CLIENT_ID",
            "ZENDESK_CLIENT_SECRET",
            "ZENDESK_API_BASE",
        )?;
        let intercom = provider_config(
            &var,
            "INTERCOM_CLIENT_ID",
            "INTERCOM_CLIENT_SECRET",
            "INTERCOM_API_BASE",
        )?;

        Ok(Self {
            database_url,
            host,
            port,
            public_base_url,
            jwt_secret: SecretString::from(jwt_secret),
            jwt_ttl: chrono::Duration::hours(jwt_ttl_hours),
            credentials_key: SecretString::from(credentials_key),
            migrations_dir,
            health_check_interval: Duration::from_secs(health_secs),
            slack,
            zendesk,
            intercom,
        })
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Names of the providers that have credentials, for startup logging.
    pub fn configured_providers(&self) -> Vec<&'static str> {
        let mut providers = Vec::new();
        if self.slack.is_some() {
            providers.push("slack");
        }
        if self.zendesk.is_some() {
            providers.push("zendesk");
        }
        if self.intercom.is_some() {
            providers.push("intercom");
        }
        providers
    }
}

fn parse_or<T: std::str::FromStr>(
    name: &'static str,
    value: Option<String>,
    default: T,
) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match value {
        Some(raw) => raw.parse().map_err(|e: T::Err| ConfigError::Invalid {
            name,
            reason: e.to_string(),
        }),
        None => Ok(default),
    }
}

/// A provider is configured when its client id is set; the secret is then required.
fn provider_config(
    var: &impl Fn(&str) -> Option<String>,
    id_name: &'static str,
    secret_name: &'static str,
    base_name: &'static str,
) -> Result<Option<ProviderConfig>, ConfigError> {
    let Some(client_id) = var(id_name) else {
        return Ok(None);
    };
    let client_secret = var(secret_name).ok_or(ConfigError::Missing(secret_name))?;
    Ok(Some(ProviderConfig {
        client_id,
        client_secret: SecretString::from(client_secret),
        api_base: var(base_name),
    }))
}
