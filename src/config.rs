use std::{fmt, str::FromStr};

use axum::http::Uri;
use base64ct::{Base64UrlUnpadded, Encoding};
use rand::{rngs::OsRng, RngCore};

/// Error raised while loading [`Settings`] from the environment.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),
    #[error("invalid value for {var}: {reason}")]
    Invalid { var: &'static str, reason: String },
}

/// Deployment environment tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AppEnv {
    #[default]
    Local,
    Staging,
    Production,
}

impl FromStr for AppEnv {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "local" => Ok(Self::Local),
            "staging" => Ok(Self::Staging),
            "production" => Ok(Self::Production),
            other => Err(format!(
                "expected one of local, staging, production, got {other:?}"
            )),
        }
    }
}

impl fmt::Display for AppEnv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Local => "local",
            Self::Staging => "staging",
            Self::Production => "production",
        })
    }
}

#[derive(Clone)]
pub struct Settings {
    pub app_name: String,
    pub app_key: String,
    pub app_url: String,
    pub app_env: AppEnv,
    pub host: String,
    pub port: u16,
    pub frontend_url: String,
    /// Parsed `CORS_ORIGINS`, trailing slashes stripped.
    pub cors_origins: Vec<String>,
    pub db_host: String,
    pub db_port: u16,
    pub db_user: String,
    pub db_password: String,
    pub db_database: String,
    pub db_echo: bool,
    pub db_pool_size: u32,
    pub db_max_overflow: u32,
    /// `db_pool_size + db_max_overflow`, checked at load time.
    pub db_max_connections: u32,
}

impl fmt::Debug for Settings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Settings")
            .field("app_name", &self.app_name)
            .field("app_key", &"<redacted>")
            .field("app_url", &self.app_url)
            .field("app_env", &self.app_env)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("frontend_url", &self.frontend_url)
            .field("cors_origins", &self.cors_origins)
            .field("db_host", &self.db_host)
            .field("db_port", &self.db_port)
            .field("db_user", &self.db_user)
            .field("db_password", &"<redacted>")
            .field("db_database", &self.db_database)
            .field("db_echo", &self.db_echo)
            .field("db_pool_size", &self.db_pool_size)
            .field("db_max_overflow", &self.db_max_overflow)
            .field("db_max_connections", &self.db_max_connections)
            .finish()
    }
}

impl Settings {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds settings from an arbitrary variable source. Empty values count
    /// as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.is_empty());
        let required = |key: &'static str| get(key).ok_or(ConfigError::Missing(key));

        let cors_origins = match get("CORS_ORIGINS") {
            Some(raw) => parse_cors(&raw).map_err(|reason| ConfigError::Invalid {
                var: "CORS_ORIGINS",
                reason,
            })?,
            None => Vec::new(),
        };

        let db_pool_size = parse_or(get("DB_POOL_SIZE"), "DB_POOL_SIZE", 100u32)?;
        if db_pool_size == 0 {
            return Err(ConfigError::Invalid {
                var: "DB_POOL_SIZE",
                reason: "pool size must be at least 1".into(),
            });
        }
        let db_max_overflow = parse_or(get("DB_MAX_OVERFLOW"), "DB_MAX_OVERFLOW", 10u32)?;
        let db_max_connections = db_pool_size
            .checked_add(db_max_overflow)
            .ok_or_else(|| ConfigError::Invalid {
                var: "DB_MAX_OVERFLOW",
                reason: format!(
                    "pool size {db_pool_size} plus overflow {db_max_overflow} exceeds {}",
                    u32::MAX
                ),
            })?;

        // SQLALCHEMY_ECHO is the older spelling, still honoured.
        let db_echo = match get("DB_ECHO")
            .map(|v| ("DB_ECHO", v))
            .or_else(|| get("SQLALCHEMY_ECHO").map(|v| ("SQLALCHEMY_ECHO", v)))
        {
            Some((var, v)) => parse_bool(&v).ok_or_else(|| ConfigError::Invalid {
                var,
                reason: format!("{v:?} is not a boolean"),
            })?,
            None => false,
        };

        Ok(Self {
            app_name: get("APP_NAME").unwrap_or_else(|| "backend-skeleton".into()),
            app_key: get("APP_KEY").unwrap_or_else(generate_app_key),
            app_url: get("APP_URL").unwrap_or_else(|| "http://localhost:8000".into()),
            app_env: parse_or(get("APP_ENV"), "APP_ENV", AppEnv::Local)?,
            host: get("APP_HOST").unwrap_or_else(|| "0.0.0.0".into()),
            port: parse_or(get("APP_PORT"), "APP_PORT", 8000u16)?,
            frontend_url: get("FRONTEND_URL").unwrap_or_else(|| "http://localhost:5173".into()),
            cors_origins,
            db_host: required("DB_HOST")?,
            db_port: parse_required(get("DB_PORT"), "DB_PORT")?,
            db_user: required("DB_USER")?,
            db_password: get("DB_PASSWORD").unwrap_or_default(),
            db_database: required("DB_DATABASE")?,
            db_echo,
            db_pool_size,
            db_max_overflow,
            db_max_connections,
        })
    }

    /// Every origin the CORS layer accepts: the configured list followed by
    /// the application and frontend URLs.
    pub fn all_cors_origins(&self) -> Vec<String> {
        self.cors_origins
            .iter()
            .cloned()
            .chain([self.app_url.clone(), self.frontend_url.clone()])
            .collect()
    }
}

/// Accepts either `a, b, c` or a JSON array string `["a", "b"]`.
pub fn parse_cors(raw: &str) -> Result<Vec<String>, String> {
    let entries: Vec<String> = if raw.starts_with('[') {
        serde_json::from_str(raw).map_err(|e| format!("not a JSON array of strings: {e}"))?
    } else {
        raw.split(',').map(|s| s.trim().to_string()).collect()
    };

    entries.iter().map(|e| normalize_origin(e)).collect()
}

fn normalize_origin(entry: &str) -> Result<String, String> {
    if entry.is_empty() {
        return Err("empty origin entry".into());
    }
    let uri: Uri = entry
        .parse()
        .map_err(|e| format!("{entry:?} is not a valid URL: {e}"))?;
    if uri.scheme().is_none() || uri.host().is_none() {
        return Err(format!("{entry:?} must be an absolute URL with scheme and host"));
    }
    Ok(entry.trim_end_matches('/').to_string())
}

fn parse_bool(v: &str) -> Option<bool> {
    match v.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "t" | "yes" | "y" | "on" => Some(true),
        "0" | "false" | "f" | "no" | "n" | "off" => Some(false),
        _ => None,
    }
}

fn parse_required<T>(value: Option<String>, var: &'static str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    let value = value.ok_or(ConfigError::Missing(var))?;
    value.parse::<T>().map_err(|e| ConfigError::Invalid {
        var,
        reason: e.to_string(),
    })
}

fn parse_or<T>(value: Option<String>, var: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    match value {
        Some(_) => parse_required(value, var),
        None => Ok(default),
    }
}

fn generate_app_key() -> String {
    let mut key = [0u8; 32];
    OsRng.fill_bytes(&mut key);
    Base64UrlUnpadded::encode_string(&key)
}
