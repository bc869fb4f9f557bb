//! Configuration types.
//!
//! Everything is read from environment variables with documented defaults.
//! `from_lookup` takes the variable source as a closure so tests never touch
//! the process environment.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use chrono::Weekday;
use chrono_tz::Tz;
use secrecy::SecretString;

use crate::error::ConfigError;
use crate::phone::PhoneNumber;

/// Recipient-local send policy.
#[derive(Debug, Clone)]
pub struct PolicyConfig {
    /// First permitted local hour (inclusive).
    pub window_start: u32,
    /// First forbidden local hour (exclusive end).
    pub window_end: u32,
    pub rest_day: Weekday,
    pub daily_cap: u32,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            window_start: 9,
            window_end: 18,
            rest_day: Weekday::Sun,
            daily_cap: 4,
        }
    }
}

/// Recurring scheduler trigger.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub tick_cron: String,
    /// Timezone the active window is evaluated in.
    pub server_timezone: Tz,
    pub active_start_hour: u32,
    pub active_end_hour: u32,
    /// Pause between recipients within one tick.
    pub recipient_delay: Duration,
    pub send_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_cron: "0 */15 * * * *".to_string(),
            server_timezone: chrono_tz::America::New_York,
            active_start_hour: 8,
            active_end_hour: 19,
            recipient_delay: Duration::from_millis(1000),
            send_timeout: Duration::from_secs(15),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConversationConfig {
    /// How long an AwaitingResponse state stays valid.
    pub awaiting_window: chrono::Duration,
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            awaiting_window: chrono::Duration::hours(24),
        }
    }
}

#[derive(Debug, Clone)]
pub struct InjectorConfig {
    pub retention_days: i64,
}

impl Default for InjectorConfig {
    fn default() -> Self {
        Self { retention_days: 30 }
    }
}

/// Twilio credentials. Absent means the dry-run transport is used.
#[derive(Debug, Clone)]
pub struct TwilioConfig {
    pub account_sid: String,
    pub auth_token: SecretString,
    pub from_number: PhoneNumber,
}

#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub port: u16,
    /// Bearer token for `/admin/*`. Admin routes reject everything when unset.
    pub admin_token: Option<SecretString>,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            admin_token: None,
        }
    }
}

/// Full engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub db_path: PathBuf,
    pub http: HttpConfig,
    pub scheduler: SchedulerConfig,
    pub policy: PolicyConfig,
    pub conversation: ConversationConfig,
    pub injector: InjectorConfig,
    pub twilio: Option<TwilioConfig>,
    pub catalog_seed: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./data/sms-cadence.db"),
            http: HttpConfig::default(),
            scheduler: SchedulerConfig::default(),
            policy: PolicyConfig::default(),
            conversation: ConversationConfig::default(),
            injector: InjectorConfig::default(),
            twilio: None,
            catalog_seed: None,
        }
    }
}

impl EngineConfig {
    /// Build config from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build config from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let http = HttpConfig {
            port: parse_or(&var, "SMS_HTTP_PORT", defaults.http.port)?,
            admin_token: var("SMS_ADMIN_TOKEN").map(SecretString::from),
        };

        let tick_cron = var("SMS_TICK_CRON").unwrap_or(defaults.scheduler.tick_cron);
        cron::Schedule::from_str(&tick_cron).map_err(|e| ConfigError::InvalidValue {
            key: "SMS_TICK_CRON".into(),
            message: e.to_string(),
        })?;

        let server_timezone = match var("SMS_SERVER_TIMEZONE") {
            Some(name) => name.parse::<Tz>().map_err(|_| ConfigError::InvalidValue {
                key: "SMS_SERVER_TIMEZONE".into(),
                message: format!("unknown timezone {name}"),
            })?,
            None => defaults.scheduler.server_timezone,
        };

        let scheduler = SchedulerConfig {
            tick_cron,
            server_timezone,
            active_start_hour: parse_or(
                &var,
                "SMS_ACTIVE_START_HOUR",
                defaults.scheduler.active_start_hour,
            )?,
            active_end_hour: parse_or(
                &var,
                "SMS_ACTIVE_END_HOUR",
                defaults.scheduler.active_end_hour,
            )?,
            recipient_delay: Duration::from_millis(parse_or(&var, "SMS_RECIPIENT_DELAY_MS", 1000)?),
            send_timeout: Duration::from_secs(parse_or(&var, "SMS_SEND_TIMEOUT_SECS", 15)?),
        };
        check_hours("SMS_ACTIVE_*_HOUR", scheduler.active_start_hour, scheduler.active_end_hour)?;

        let policy = PolicyConfig {
            window_start: parse_or(&var, "SMS_SEND_WINDOW_START", defaults.policy.window_start)?,
            window_end: parse_or(&var, "SMS_SEND_WINDOW_END", defaults.policy.window_end)?,
            rest_day: parse_or(&var, "SMS_REST_DAY", defaults.policy.rest_day)?,
            daily_cap: parse_or(&var, "SMS_DAILY_CAP", defaults.policy.daily_cap)?,
        };
        check_hours("SMS_SEND_WINDOW_*", policy.window_start, policy.window_end)?;

        let conversation = ConversationConfig {
            awaiting_window: chrono::Duration::hours(parse_or(
                &var,
                "SMS_AWAITING_WINDOW_HOURS",
                24i64,
            )?),
        };

        let injector = InjectorConfig {
            retention_days: parse_or(
                &var,
                "SMS_INJECTION_RETENTION_DAYS",
                defaults.injector.retention_days,
            )?,
        };

        let twilio = match var("TWILIO_ACCOUNT_SID") {
            Some(account_sid) => {
                let auth_token = var("TWILIO_AUTH_TOKEN")
                    .ok_or_else(|| ConfigError::MissingEnvVar("TWILIO_AUTH_TOKEN".into()))?;
                let from_raw = var("TWILIO_FROM_NUMBER")
                    .ok_or_else(|| ConfigError::MissingEnvVar("TWILIO_FROM_NUMBER".into()))?;
                let from_number =
                    PhoneNumber::parse(&from_raw).map_err(|e| ConfigError::InvalidValue {
                        key: "TWILIO_FROM_NUMBER".into(),
                        message: e.to_string(),
                    })?;
                Some(TwilioConfig {
                    account_sid,
                    auth_token: SecretString::from(auth_token),
                    from_number,
                })
            }
            None => None,
        };

        Ok(Self {
            db_path: var("SMS_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.db_path),
            http,
            scheduler,
            policy,
            conversation,
            injector,
            twilio,
            catalog_seed: var("SMS_CATALOG_SEED").map(PathBuf::from),
        })
    }
}

fn parse_or<T>(
    var: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match var(key) {
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("{raw:?}: {e}"),
        }),
        None => Ok(default),
    }
}

fn check_hours(key: &str, start: u32, end: u32) -> Result<(), ConfigError> {
    if start >= end || end > 24 {
        return Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("window {start}..{end} is empty or past midnight"),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use secrecy::ExposeSecret;

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_when_unset() {
        let config = EngineConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.http.port, 8080);
        assert!(config.http.admin_token.is_none());
        assert_eq!(config.policy.window_start, 9);
        assert_eq!(config.policy.window_end, 18);
        assert_eq!(config.policy.rest_day, Weekday::Sun);
        assert_eq!(config.policy.daily_cap, 4);
        assert_eq!(config.scheduler.active_start_hour, 8);
        assert_eq!(config.scheduler.active_end_hour, 19);
        assert_eq!(config.scheduler.server_timezone, chrono_tz::America::New_York);
        assert_eq!(config.conversation.awaiting_window, chrono::Duration::hours(24));
        assert_eq!(config.injector.retention_days, 30);
        assert!(config.twilio.is_none());
    }

    #[test]
    fn overrides_parse() {
        let config = EngineConfig::from_lookup(lookup(&[
            ("SMS_HTTP_PORT", "9090"),
            ("SMS_ADMIN_TOKEN", "s3cret"),
            ("SMS_REST_DAY", "Sat"),
            ("SMS_DAILY_CAP", "2"),
            ("SMS_SERVER_TIMEZONE", "America/Denver"),
            ("SMS_RECIPIENT_DELAY_MS", "0"),
        ]))
        .unwrap();
        assert_eq!(config.http.port, 9090);
        assert_eq!(
            config.http.admin_token.as_ref().unwrap().expose_secret(),
            "s3cret"
        );
        assert_eq!(config.policy.rest_day, Weekday::Sat);
        assert_eq!(config.policy.daily_cap, 2);
        assert_eq!(config.scheduler.server_timezone, chrono_tz::America::Denver);
        assert_eq!(config.scheduler.recipient_delay, Duration::ZERO);
    }

    #[test]
    fn invalid_number_is_reported_with_key() {
        let err = EngineConfig::from_lookup(lookup(&[("SMS_DAILY_CAP", "four")])).unwrap_err();
        match err {
            ConfigError::InvalidValue { key, .. } => assert_eq!(key, "SMS_DAILY_CAP"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn invalid_cron_rejected() {
        assert!(EngineConfig::from_lookup(lookup(&[("SMS_TICK_CRON", "every minute")])).is_err());
    }

    #[test]
    fn inverted_window_rejected() {
        assert!(
            EngineConfig::from_lookup(lookup(&[
                ("SMS_SEND_WINDOW_START", "18"),
                ("SMS_SEND_WINDOW_END", "9"),
            ]))
            .is_err()
        );
    }

    #[test]
    fn twilio_requires_all_fields() {
        let err =
            EngineConfig::from_lookup(lookup(&[("TWILIO_ACCOUNT_SID", "AC123")])).unwrap_err();
        assert!(matches!(err, ConfigError::MissingEnvVar(_)));

        let config = EngineConfig::from_lookup(lookup(&[
            ("TWILIO_ACCOUNT_SID", "AC123"),
            ("TWILIO_AUTH_TOKEN", "tok"),
            ("TWILIO_FROM_NUMBER", "+1 (555) 000-1111"),
        ]))
        .unwrap();
        let twilio = config.twilio.unwrap();
        assert_eq!(twilio.from_number.as_str(), "15550001111");
    }
}
