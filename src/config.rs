//! Configuration types.
//!
//! Everything is read from environment variables. Unset variables fall back
//! to the defaults below; malformed values are reported as [`ConfigError`].

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;

/// Default Telegram Bot API endpoint.
pub const DEFAULT_TELEGRAM_API_BASE: &str = "https://api.telegram.org";

/// Retry interval used when the automation interval is configured as zero.
const FALLBACK_RETRY_INTERVAL: Duration = Duration::from_secs(30);

/// Largest accepted value for any `*_SECS` setting (ten years).
const MAX_CONFIGURED_SECS: u64 = 10 * 365 * 24 * 60 * 60;

/// Conversation and channel settings used by the flow engine.
#[derive(Debug, Clone)]
pub struct BotConfig {
    /// Bot username used to build `https://t.me/<bot>?start=<id>` links.
    pub bot_username: String,
    /// Public URL of the school channel shown in the subscription gate.
    pub school_channel_url: String,
    /// Chat id or `@handle` of the school channel.
    pub school_channel_id: String,
    /// Public URL of the course channel.
    pub course_channel_url: String,
    /// Chat id of the course channel. `None` means discover it at runtime.
    pub course_channel_id: Option<String>,
    /// Delay between registration and the referral-program epilogue.
    pub epilogue_delay: Duration,
    /// Period of the automation scheduler tick.
    pub automation_interval: Duration,
    /// Upper bound for a single membership check.
    pub oracle_timeout: Duration,
    pub notifications: NotificationConfig,
}

impl BotConfig {
    /// How long to wait before re-checking a deferred epilogue that could not
    /// be delivered yet.
    pub fn fallback_retry_interval(&self) -> Duration {
        if self.automation_interval.is_zero() {
            FALLBACK_RETRY_INTERVAL
        } else {
            self.automation_interval
        }
    }
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            bot_username: "tajwid_bot".to_string(),
            school_channel_url: "https://t.me/tartil_madrasa".to_string(),
            school_channel_id: "@tartil_madrasa".to_string(),
            course_channel_url: "https://t.me/tajwid_course".to_string(),
            course_channel_id: None,
            epilogue_delay: Duration::from_secs(10),
            automation_interval: Duration::from_secs(30),
            oracle_timeout: Duration::from_secs(5),
            notifications: NotificationConfig::default(),
        }
    }
}

/// Who gets told about new registrations.
#[derive(Debug, Clone, Default)]
pub struct NotificationConfig {
    pub enabled: bool,
    pub recipient_ids: Vec<i64>,
    /// Usernames resolved to ids through stored profiles at send time.
    pub recipient_usernames: Vec<String>,
    /// Username notified when neither the configuration nor the stored admin
    /// list names anyone.
    pub fallback_username: Option<String>,
}

/// Telegram transport settings. Absent when no bot token is configured.
#[derive(Debug, Clone)]
pub struct TelegramConfig {
    pub bot_token: SecretString,
    pub api_base_url: String,
    pub webhook_url: Option<String>,
    pub webhook_secret: Option<SecretString>,
}

/// Process-level settings for the binary.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub db_path: PathBuf,
    pub http_port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./data/tajwid.db"),
            http_port: 8080,
        }
    }
}

/// Full application configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bot: BotConfig,
    pub telegram: Option<TelegramConfig>,
    pub server: ServerConfig,
}

impl AppConfig {
    /// Load configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let defaults = BotConfig::default();
        let bot = BotConfig {
            bot_username: get("TAJWID_BOT_USERNAME")
                .map(|u| u.trim_start_matches('@').to_string())
                .unwrap_or(defaults.bot_username),
            school_channel_url: get("TAJWID_SCHOOL_CHANNEL_URL")
                .unwrap_or(defaults.school_channel_url),
            school_channel_id: get("TAJWID_SCHOOL_CHANNEL_ID").unwrap_or(defaults.school_channel_id),
            course_channel_url: get("TAJWID_COURSE_CHANNEL_URL")
                .unwrap_or(defaults.course_channel_url),
            course_channel_id: get("TAJWID_COURSE_CHANNEL_ID"),
            epilogue_delay: secs(&get, "TAJWID_EPILOGUE_DELAY_SECS", defaults.epilogue_delay)?,
            automation_interval: secs(
                &get,
                "TAJWID_AUTOMATION_INTERVAL_SECS",
                defaults.automation_interval,
            )?,
            oracle_timeout: secs(&get, "TAJWID_ORACLE_TIMEOUT_SECS", defaults.oracle_timeout)?,
            notifications: NotificationConfig {
                enabled: parse_or(&get, "TAJWID_NOTIFY_ENABLED", false)?,
                recipient_ids: csv(&get, "TAJWID_NOTIFY_USER_IDS")?,
                recipient_usernames: csv::<String, _>(&get, "TAJWID_NOTIFY_USERNAMES")?
                    .into_iter()
                    .map(|u| u.trim_start_matches('@').to_string())
                    .filter(|u| !u.is_empty())
                    .collect(),
                fallback_username: get("TAJWID_NOTIFY_FALLBACK_USERNAME")
                    .map(|u| u.trim_start_matches('@').to_string())
                    .filter(|u| !u.is_empty()),
            },
        };

        if get("TELEGRAM_BOT_TOKEN").is_none() {
            if let Some(key) = ["TELEGRAM_WEBHOOK_URL", "TELEGRAM_WEBHOOK_SECRET"]
                .into_iter()
                .find(|key| get(*key).is_some())
            {
                tracing::warn!("{key} is set but the bot token is not");
                return Err(ConfigError::MissingEnvVar("TELEGRAM_BOT_TOKEN".to_string()));
            }
        }

        let telegram = get("TELEGRAM_BOT_TOKEN").map(|token| TelegramConfig {
            bot_token: SecretString::from(token),
            api_base_url: get("TELEGRAM_API_BASE_URL")
                .unwrap_or_else(|| DEFAULT_TELEGRAM_API_BASE.to_string())
                .trim_end_matches('/')
                .to_string(),
            webhook_url: get("TELEGRAM_WEBHOOK_URL"),
            webhook_secret: get("TELEGRAM_WEBHOOK_SECRET").map(SecretString::from),
        });

        let server_defaults = ServerConfig::default();
        let server = ServerConfig {
            db_path: get("TAJWID_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or(server_defaults.db_path),
            http_port: parse_or(&get, "TAJWID_HTTP_PORT", server_defaults.http_port)?,
        };

        Ok(Self {
            bot,
            telegram,
            server,
        })
    }
}

fn parse_or<T, F>(get: &F, key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => raw.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("{raw:?}: {e}"),
        }),
        None => Ok(default),
    }
}

fn secs<F>(get: &F, key: &str, default: Duration) -> Result<Duration, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let secs = parse_or(get, key, default.as_secs())?;
    if secs > MAX_CONFIGURED_SECS {
        return Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("{secs} exceeds the maximum of {MAX_CONFIGURED_SECS} seconds"),
        });
    }
    Ok(Duration::from_secs(secs))
}

fn csv<T, F>(get: &F, key: &str) -> Result<Vec<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = get(key) else {
        return Ok(Vec::new());
    };
    raw.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(|item| {
            item.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("{item:?}: {e}"),
            })
        })
        .collect()
}
