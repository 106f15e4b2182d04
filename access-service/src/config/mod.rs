use secrecy::Secret;
use serde::Deserialize;
use service_core::config as core_config;
use service_core::error::AppError;
use std::env;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct AccessConfig {
    #[serde(flatten)]
    pub common: core_config::Config,
    pub store: StoreBackend,
    pub mongodb: MongoConfig,
    pub token: TokenConfig,
    pub sweep: SweepConfig,
    pub dispatch: DispatchConfig,
    /// Upper bound for any single caller-facing operation.
    pub operation_timeout_ms: u64,
    /// TOML file describing sites, doors, roles and user contacts.
    pub directory_path: Option<String>,
    pub smtp: SmtpConfig,
    pub msg91: Msg91Config,
    pub fcm: FcmConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Memory,
    Mongodb,
}

impl FromStr for StoreBackend {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "memory" => Ok(StoreBackend::Memory),
            "mongodb" | "mongo" => Ok(StoreBackend::Mongodb),
            other => Err(AppError::ConfigError(anyhow::anyhow!(
                "Unknown STORE_BACKEND '{}', expected 'memory' or 'mongodb'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MongoConfig {
    pub uri: String,
    pub database: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TokenConfig {
    pub signing_secret: Secret<String>,
    pub default_ttl_minutes: i64,
    pub max_ttl_minutes: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SweepConfig {
    pub interval_secs: u64,
    /// Holds this close to expiry get an expiring-soon warning.
    pub expiring_soon_minutes: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DispatchConfig {
    pub delivery_timeout_ms: u64,
    pub max_attempts: u32,
    pub retry_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub from_email: String,
    pub from_name: String,
    pub enabled: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Msg91Config {
    pub auth_key: String,
    pub sender_id: String,
    pub country_code: String,
    pub enabled: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FcmConfig {
    pub project_id: String,
    pub access_token: String,
    pub enabled: bool,
}

impl AccessConfig {
    pub fn load() -> Result<Self, AppError> {
        let common_config = core_config::Config::load()?;
        let is_prod = env::var("ENVIRONMENT").unwrap_or_else(|_| "dev".to_string()) == "prod";

        let store: StoreBackend = get_env("STORE_BACKEND", Some("mongodb"), is_prod)?.parse()?;
        let mongo_uri_default = match store {
            StoreBackend::Memory => Some(""),
            StoreBackend::Mongodb => None,
        };

        Ok(AccessConfig {
            common: common_config,
            store,
            mongodb: MongoConfig {
                uri: get_env("MONGODB_URI", mongo_uri_default, is_prod)?,
                database: get_env("MONGODB_DATABASE", Some("access_db"), is_prod)?,
            },
            token: TokenConfig {
                signing_secret: Secret::new(get_env(
                    "TOKEN_SIGNING_SECRET",
                    Some("dev-only-access-token-secret"),
                    is_prod,
                )?),
                default_ttl_minutes: parse_env("TOKEN_DEFAULT_TTL_MINUTES", 60),
                max_ttl_minutes: parse_env("TOKEN_MAX_TTL_MINUTES", 24 * 60),
            },
            sweep: SweepConfig {
                interval_secs: parse_env("SWEEP_INTERVAL_SECS", 60),
                expiring_soon_minutes: parse_env("SWEEP_EXPIRING_SOON_MINUTES", 10),
            },
            dispatch: DispatchConfig {
                delivery_timeout_ms: parse_env("DISPATCH_DELIVERY_TIMEOUT_MS", 5_000),
                max_attempts: parse_env("DISPATCH_MAX_ATTEMPTS", 5),
                retry_interval_secs: parse_env("DISPATCH_RETRY_INTERVAL_SECS", 30),
            },
            operation_timeout_ms: parse_env("OPERATION_TIMEOUT_MS", 10_000),
            directory_path: env::var("DIRECTORY_PATH").ok(),
            smtp: SmtpConfig {
                host: get_env("SMTP_HOST", Some("smtp.gmail.com"), is_prod)?,
                port: parse_env("SMTP_PORT", 587),
                user: get_env("SMTP_USER", Some(""), is_prod)?,
                password: get_env("SMTP_PASSWORD", Some(""), is_prod)?,
                from_email: get_env("SMTP_FROM_EMAIL", Some("noreply@example.com"), is_prod)?,
                from_name: get_env("SMTP_FROM_NAME", Some("Site Access"), is_prod)?,
                enabled: parse_env("SMTP_ENABLED", false),
            },
            msg91: Msg91Config {
                auth_key: get_env("MSG91_AUTH_KEY", Some(""), is_prod)?,
                sender_id: get_env("MSG91_SENDER_ID", Some(""), is_prod)?,
                country_code: get_env("MSG91_COUNTRY_CODE", Some("91"), is_prod)?,
                enabled: parse_env("MSG91_ENABLED", false),
            },
            fcm: FcmConfig {
                project_id: get_env("FCM_PROJECT_ID", Some(""), is_prod)?,
                access_token: get_env("FCM_ACCESS_TOKEN", Some(""), is_prod)?,
                enabled: parse_env("FCM_ENABLED", false),
            },
        })
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }
}

impl DispatchConfig {
    pub fn delivery_timeout(&self) -> Duration {
        Duration::from_millis(self.delivery_timeout_ms)
    }

    /// How long an in-flight claim is honoured before another sender may
    /// take it over. Twice the delivery timeout, so a live attempt always
    /// finishes inside its lease.
    pub fn claim_lease(&self) -> Duration {
        self.delivery_timeout() * 2
    }
}

fn get_env(key: &str, default: Option<&str>, is_prod: bool) -> Result<String, AppError> {
    match env::var(key) {
        Ok(val) => Ok(val),
        Err(_) => {
            if is_prod {
                Err(AppError::ConfigError(anyhow::anyhow!(
                    "{} is required in production but not set",
                    key
                )))
            } else if let Some(def) = default {
                Ok(def.to_string())
            } else {
                Err(AppError::ConfigError(anyhow::anyhow!(
                    "{} is required but not set",
                    key
                )))
            }
        }
    }
}

fn parse_env<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
