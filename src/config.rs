//! Process configuration from `PETDISPATCH_*` environment variables.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use chrono::FixedOffset;
use thiserror::Error;
use ulid::Ulid;

use crate::dispatch::{DispatchMode, DispatcherSettings};
use crate::engine::EngineSettings;

const PREFIX: &str = "PETDISPATCH_";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{key}: cannot parse {value:?}")]
    Invalid { key: String, value: String },
    #[error("{key}: {reason}")]
    OutOfRange { key: String, reason: &'static str },
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub metrics_port: Option<u16>,
    pub log_level: String,
    pub public_base_url: String,
    /// `(token, admin id)` pairs.
    pub admin_tokens: Vec<(String, Ulid)>,
    pub default_radius_km: f64,
    pub utc_offset: FixedOffset,
    pub dispatch_timeout: Duration,
    pub dispatch_concurrency: usize,
    pub dispatch_mode: DispatchMode,
    pub listing_concurrency: usize,
    pub compact_threshold: u64,
    pub mail_webhook_url: Option<String>,
    pub seed_file: Option<PathBuf>,
}

impl Config {
    /// Load `.env` if present, then read the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. Keys are given without the prefix.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| {
            lookup(&format!("{PREFIX}{key}"))
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let utc_offset_minutes: i32 = parse_or(&get, "UTC_OFFSET_MINUTES", 0)?;
        let utc_offset = FixedOffset::east_opt(utc_offset_minutes * 60).ok_or(ConfigError::OutOfRange {
            key: format!("{PREFIX}UTC_OFFSET_MINUTES"),
            reason: "must be within ±24h",
        })?;

        let default_radius_km: f64 = parse_or(&get, "DEFAULT_RADIUS_KM", 15.0)?;
        if !default_radius_km.is_finite() || default_radius_km < 0.0 {
            return Err(ConfigError::OutOfRange {
                key: format!("{PREFIX}DEFAULT_RADIUS_KM"),
                reason: "must be a non-negative number",
            });
        }

        let dispatch_mode = match get("DISPATCH_MODE").as_deref().map(str::to_ascii_lowercase).as_deref() {
            None | Some("detached") => DispatchMode::Detached,
            Some("inline") => DispatchMode::Inline,
            Some(other) => {
                return Err(ConfigError::Invalid {
                    key: format!("{PREFIX}DISPATCH_MODE"),
                    value: other.to_string(),
                });
            }
        };

        let config = Self {
            bind: get("BIND").unwrap_or_else(|| "0.0.0.0".into()),
            port: parse_or(&get, "PORT", 8080)?,
            data_dir: get("DATA_DIR").map_or_else(|| PathBuf::from("./data"), PathBuf::from),
            metrics_port: parse_opt(&get, "METRICS_PORT")?,
            log_level: get("LOG_LEVEL").unwrap_or_else(|| "info".into()),
            public_base_url: get("PUBLIC_BASE_URL").unwrap_or_else(|| "http://localhost:8080".into()),
            admin_tokens: get("ADMIN_TOKENS")
                .map(|raw| parse_tokens(&raw))
                .transpose()?
                .unwrap_or_default(),
            default_radius_km,
            utc_offset,
            dispatch_timeout: Duration::from_millis(parse_or(&get, "DISPATCH_TIMEOUT_MS", 3_000)?),
            dispatch_concurrency: positive(parse_or(&get, "DISPATCH_CONCURRENCY", 4)?, "DISPATCH_CONCURRENCY")?,
            dispatch_mode,
            listing_concurrency: positive(parse_or(&get, "LISTING_CONCURRENCY", 8)?, "LISTING_CONCURRENCY")?,
            compact_threshold: parse_or(&get, "COMPACT_THRESHOLD", 1_000)?,
            mail_webhook_url: get("MAIL_WEBHOOK_URL"),
            seed_file: get("SEED_FILE").map(PathBuf::from),
        };
        Ok(config)
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("petdispatch.wal")
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            utc_offset: self.utc_offset,
            default_radius_km: self.default_radius_km,
            listing_concurrency: self.listing_concurrency,
            dispatch_mode: self.dispatch_mode,
        }
    }

    pub fn dispatcher_settings(&self) -> DispatcherSettings {
        DispatcherSettings {
            timeout: self.dispatch_timeout,
            concurrency: self.dispatch_concurrency,
        }
    }
}

fn parse_opt<T: FromStr>(get: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>, ConfigError> {
    get(key)
        .map(|value| {
            value.parse().map_err(|_| ConfigError::Invalid {
                key: format!("{PREFIX}{key}"),
                value,
            })
        })
        .transpose()
}

fn parse_or<T: FromStr>(get: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T, ConfigError> {
    Ok(parse_opt(get, key)?.unwrap_or(default))
}

fn positive(value: usize, key: &str) -> Result<usize, ConfigError> {
    if value == 0 {
        return Err(ConfigError::OutOfRange {
            key: format!("{PREFIX}{key}"),
            reason: "must be at least 1",
        });
    }
    Ok(value)
}

/// `token:adminUlid,token:adminUlid`
fn parse_tokens(raw: &str) -> Result<Vec<(String, Ulid)>, ConfigError> {
    raw.split(',')
        .map(str::trim)
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let invalid = || ConfigError::Invalid {
                key: format!("{PREFIX}ADMIN_TOKENS"),
                value: "<redacted>".into(),
            };
            let (token, id) = pair.rsplit_once(':').ok_or_else(invalid)?;
            let token = token.trim();
            if token.is_empty() {
                return Err(invalid());
            }
            let id = Ulid::from_string(id.trim()).map_err(|_| invalid())?;
            Ok((token.to_string(), id))
        })
        .collect()
}
