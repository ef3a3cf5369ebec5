use std::{net::SocketAddr, str::FromStr};

use anyhow::{Context, anyhow};

const DEFAULT_DATABASE_URL: &str = "sqlite://careline.db?mode=rwc";
const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8080";

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub bind_addr: SocketAddr,
    pub jwt_secret: String,
    pub db_max_connections: u32,
    /// Base URL of the user profile service; profiles are only known from
    /// tokens seen by this process when unset.
    pub profile_service_url: Option<String>,
    /// Push gateway endpoint; notifications are logged only when unset.
    pub push_webhook_url: Option<String>,
    pub projection_retries: u32,
}

impl Config {
    /// Reads `.env` if present, then the process environment.
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv::dotenv().ok();
        Self::from_lookup(|key| dotenv::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let var = |key: &str| lookup(key).map(|v| v.trim().to_owned()).filter(|v| !v.is_empty());

        let jwt_secret = var("JWT_SECRET").ok_or_else(|| anyhow!("JWT_SECRET missing"))?;

        Ok(Self {
            database_url: var("DATABASE_URL").unwrap_or_else(|| DEFAULT_DATABASE_URL.to_owned()),
            bind_addr: parse_or(var("BIND_ADDR"), "BIND_ADDR", DEFAULT_BIND_ADDR.parse()?)?,
            jwt_secret,
            db_max_connections: parse_or(var("DB_MAX_CONNECTIONS"), "DB_MAX_CONNECTIONS", 16)?,
            profile_service_url: var("PROFILE_SERVICE_URL").map(|url| url.trim_end_matches('/').to_owned()),
            push_webhook_url: var("PUSH_WEBHOOK_URL"),
            projection_retries: parse_or(var("PROJECTION_RETRIES"), "PROJECTION_RETRIES", 3)?,
        })
    }
}

fn parse_or<T>(value: Option<String>, key: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match value {
        Some(raw) => raw.parse().with_context(|| format!("{key}={raw:?} is not valid")),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config(vars: &[(&str, &str)]) -> anyhow::Result<Config> {
        let vars: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_need_only_a_secret() {
        let cfg = config(&[("JWT_SECRET", "s3cret")]).unwrap();

        assert_eq!(cfg.database_url, DEFAULT_DATABASE_URL);
        assert_eq!(cfg.bind_addr, "0.0.0.0:8080".parse().unwrap());
        assert_eq!(cfg.db_max_connections, 16);
        assert_eq!(cfg.projection_retries, 3);
        assert_eq!(cfg.profile_service_url, None);
        assert_eq!(cfg.push_webhook_url, None);
    }

    #[test]
    fn missing_secret_is_fatal() {
        let err = config(&[]).unwrap_err();
        assert!(err.to_string().contains("JWT_SECRET"));

        assert!(config(&[("JWT_SECRET", "   ")]).is_err());
    }

    #[test]
    fn overrides_are_parsed() {
        let cfg = config(&[
            ("JWT_SECRET", "s3cret"),
            ("DATABASE_URL", "sqlite::memory:"),
            ("BIND_ADDR", "127.0.0.1:9000"),
            ("DB_MAX_CONNECTIONS", "4"),
            ("PROFILE_SERVICE_URL", "http://profiles.local/"),
            ("PUSH_WEBHOOK_URL", "http://push.local/send"),
            ("PROJECTION_RETRIES", "5"),
        ])
        .unwrap();

        assert_eq!(cfg.database_url, "sqlite::memory:");
        assert_eq!(cfg.bind_addr.port(), 9000);
        assert_eq!(cfg.db_max_connections, 4);
        assert_eq!(cfg.profile_service_url.as_deref(), Some("http://profiles.local"));
        assert_eq!(cfg.push_webhook_url.as_deref(), Some("http://push.local/send"));
        assert_eq!(cfg.projection_retries, 5);
    }

    #[test]
    fn garbage_numbers_are_rejected() {
        let err = config(&[("JWT_SECRET", "s"), ("DB_MAX_CONNECTIONS", "many")]).unwrap_err();
        assert!(err.to_string().contains("DB_MAX_CONNECTIONS"));

        assert!(config(&[("JWT_SECRET", "s"), ("BIND_ADDR", "nowhere")]).is_err());
    }
}
