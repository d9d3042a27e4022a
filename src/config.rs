//! Configuration types.

use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;

const ENV_MAX_USERS_BATCH: &str = "SPAM_PIPELINE_MAX_USERS_BATCH";
const ENV_MAX_CLASSIFY_REQUESTS: &str = "SPAM_PIPELINE_MAX_CLASSIFY_REQUESTS";
const ENV_MAX_LOOKUPS: &str = "SPAM_PIPELINE_MAX_LOOKUPS";
const ENV_CALL_TIMEOUT_MS: &str = "SPAM_PIPELINE_CALL_TIMEOUT_MS";

/// Environment variables carrying the three required limits.
const LIMIT_ENV_VARS: [&str; 3] = [
    ENV_MAX_USERS_BATCH,
    ENV_MAX_CLASSIFY_REQUESTS,
    ENV_MAX_LOOKUPS,
];

/// Pipeline tuning, fixed for the lifetime of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    /// Maximum number of users sent to a single `fetch_messages` call.
    pub max_users_batch: usize,
    /// Size of the classifier worker pool.
    pub max_concurrent_classifications: usize,
    /// Maximum number of user lookups in flight at once.
    pub max_concurrent_lookups: usize,
    /// Upper bound on any single external call. `None` waits indefinitely.
    pub call_timeout: Option<Duration>,
}

impl PipelineConfig {
    /// Build a config, rejecting zero-sized limits.
    pub fn new(
        max_users_batch: usize,
        max_concurrent_classifications: usize,
        max_concurrent_lookups: usize,
    ) -> Result<Self, ConfigError> {
        let config = Self {
            max_users_batch,
            max_concurrent_classifications,
            max_concurrent_lookups,
            call_timeout: None,
        };
        config.validate()?;
        Ok(config)
    }

    /// Apply a per-call timeout to every external call.
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = Some(timeout);
        self
    }

    /// Build config from environment variables.
    ///
    /// The three limits are required; the call timeout is optional.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::new(
            required_env(ENV_MAX_USERS_BATCH)?,
            required_env(ENV_MAX_CLASSIFY_REQUESTS)?,
            required_env(ENV_MAX_LOOKUPS)?,
        )?;

        if let Ok(raw) = std::env::var(ENV_CALL_TIMEOUT_MS) {
            let millis: u64 = parse_value(ENV_CALL_TIMEOUT_MS, &raw)?;
            config.call_timeout = Some(Duration::from_millis(millis));
        }

        Ok(config)
    }

    /// Like [`from_env`](Self::from_env), but returns `fallback` when none
    /// of the three limits is set. Setting only some of them is an error.
    pub fn from_env_or(fallback: PipelineConfig) -> Result<Self, ConfigError> {
        if LIMIT_ENV_VARS
            .iter()
            .all(|key| std::env::var_os(key).is_none())
        {
            return Ok(fallback);
        }
        Self::from_env()
    }

    /// Check that every limit allows at least one unit of work.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let limits = [
            ("max_users_batch", self.max_users_batch),
            (
                "max_concurrent_classifications",
                self.max_concurrent_classifications,
            ),
            ("max_concurrent_lookups", self.max_concurrent_lookups),
        ];
        for (key, value) in limits {
            if value == 0 {
                return Err(ConfigError::InvalidValue {
                    key: key.to_string(),
                    message: "must be greater than zero".to_string(),
                });
            }
        }
        Ok(())
    }
}

fn required_env<T: FromStr>(key: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    let raw = std::env::var(key).map_err(|_| ConfigError::MissingEnvVar(key.to_string()))?;
    parse_value(key, &raw)
}

fn parse_value<T: FromStr>(key: &str, raw: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("{raw:?}: {e}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_accepts_positive_limits() {
        let config = PipelineConfig::new(2, 5, 8).unwrap();
        assert_eq!(config.max_users_batch, 2);
        assert_eq!(config.max_concurrent_classifications, 5);
        assert_eq!(config.max_concurrent_lookups, 8);
        assert!(config.call_timeout.is_none());
    }

    #[test]
    fn new_rejects_zero_batch() {
        let err = PipelineConfig::new(0, 5, 8).unwrap_err();
        match err {
            ConfigError::InvalidValue { key, .. } => assert_eq!(key, "max_users_batch"),
            other => panic!("Expected InvalidValue, got {:?}", other),
        }
    }

    #[test]
    fn new_rejects_zero_pool() {
        assert!(PipelineConfig::new(2, 0, 8).is_err());
        assert!(PipelineConfig::new(2, 5, 0).is_err());
    }

    #[test]
    fn with_call_timeout_sets_timeout() {
        let config = PipelineConfig::new(1, 1, 1)
            .unwrap()
            .with_call_timeout(Duration::from_millis(250));
        assert_eq!(config.call_timeout, Some(Duration::from_millis(250)));
    }

    #[test]
    fn parse_value_reports_key_on_garbage() {
        let err = parse_value::<usize>("SOME_KEY", "many").unwrap_err();
        match err {
            ConfigError::InvalidValue { key, message } => {
                assert_eq!(key, "SOME_KEY");
                assert!(message.contains("many"));
            }
            other => panic!("Expected InvalidValue, got {:?}", other),
        }
    }

    #[test]
    fn parse_value_trims_whitespace() {
        assert_eq!(parse_value::<usize>("K", " 7 ").unwrap(), 7);
    }

    // ── Environment tests ───────────────────────────────────────────

    /// Serializes the tests below, which share the process environment.
    static ENV_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

    fn with_env<R>(vars: &[(&str, &str)], f: impl FnOnce() -> R) -> R {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        // SAFETY: ENV_LOCK is held, and only these tests touch SPAM_PIPELINE_* vars.
        unsafe {
            for key in LIMIT_ENV_VARS.iter().chain([&ENV_CALL_TIMEOUT_MS]) {
                std::env::remove_var(key);
            }
            for (key, value) in vars {
                std::env::set_var(key, value);
            }
        }
        let result = f();
        // SAFETY: as above.
        unsafe {
            for (key, _) in vars {
                std::env::remove_var(key);
            }
        }
        result
    }

    #[test]
    fn from_env_reads_all_limits() {
        let config = with_env(
            &[
                (ENV_MAX_USERS_BATCH, "3"),
                (ENV_MAX_CLASSIFY_REQUESTS, "4"),
                (ENV_MAX_LOOKUPS, "9"),
            ],
            PipelineConfig::from_env,
        )
        .unwrap();
        assert_eq!(config, PipelineConfig::new(3, 4, 9).unwrap());
        assert!(config.call_timeout.is_none());
    }

    #[test]
    fn from_env_reads_optional_call_timeout() {
        let config = with_env(
            &[
                (ENV_MAX_USERS_BATCH, "3"),
                (ENV_MAX_CLASSIFY_REQUESTS, "4"),
                (ENV_MAX_LOOKUPS, "9"),
                (ENV_CALL_TIMEOUT_MS, "1500"),
            ],
            PipelineConfig::from_env,
        )
        .unwrap();
        assert_eq!(config.call_timeout, Some(Duration::from_millis(1500)));
    }

    #[test]
    fn from_env_reports_missing_limit() {
        let err = with_env(
            &[(ENV_MAX_USERS_BATCH, "10"), (ENV_MAX_LOOKUPS, "9")],
            PipelineConfig::from_env,
        )
        .unwrap_err();
        match err {
            ConfigError::MissingEnvVar(key) => assert_eq!(key, ENV_MAX_CLASSIFY_REQUESTS),
            other => panic!("Expected MissingEnvVar, got {:?}", other),
        }
    }

    #[test]
    fn from_env_rejects_zero_limit() {
        let err = with_env(
            &[
                (ENV_MAX_USERS_BATCH, "3"),
                (ENV_MAX_CLASSIFY_REQUESTS, "0"),
                (ENV_MAX_LOOKUPS, "9"),
            ],
            PipelineConfig::from_env,
        )
        .unwrap_err();
        match err {
            ConfigError::InvalidValue { key, .. } => {
                assert_eq!(key, "max_concurrent_classifications")
            }
            other => panic!("Expected InvalidValue, got {:?}", other),
        }
    }

    #[test]
    fn from_env_rejects_unparsable_limit() {
        let err = with_env(
            &[
                (ENV_MAX_USERS_BATCH, "lots"),
                (ENV_MAX_CLASSIFY_REQUESTS, "4"),
                (ENV_MAX_LOOKUPS, "9"),
            ],
            PipelineConfig::from_env,
        )
        .unwrap_err();
        match err {
            ConfigError::InvalidValue { key, .. } => assert_eq!(key, ENV_MAX_USERS_BATCH),
            other => panic!("Expected InvalidValue, got {:?}", other),
        }
    }

    #[test]
    fn from_env_or_uses_fallback_when_nothing_is_set() {
        let fallback = PipelineConfig::new(2, 5, 16).unwrap();
        let config = with_env(&[], || PipelineConfig::from_env_or(fallback.clone())).unwrap();
        assert_eq!(config, fallback);
    }

    #[test]
    fn from_env_or_rejects_partial_limits() {
        let fallback = PipelineConfig::new(2, 5, 16).unwrap();
        let err = with_env(&[(ENV_MAX_USERS_BATCH, "10")], || {
            PipelineConfig::from_env_or(fallback)
        })
        .unwrap_err();
        assert!(matches!(err, ConfigError::MissingEnvVar(_)));
    }

    #[test]
    fn from_env_or_prefers_complete_environment() {
        let fallback = PipelineConfig::new(2, 5, 16).unwrap();
        let config = with_env(
            &[
                (ENV_MAX_USERS_BATCH, "10"),
                (ENV_MAX_CLASSIFY_REQUESTS, "4"),
                (ENV_MAX_LOOKUPS, "9"),
            ],
            || PipelineConfig::from_env_or(fallback),
        )
        .unwrap();
        assert_eq!(config.max_users_batch, 10);
    }

    #[test]
    fn from_env_rejects_unparsable_timeout() {
        let err = with_env(
            &[
                (ENV_MAX_USERS_BATCH, "3"),
                (ENV_MAX_CLASSIFY_REQUESTS, "4"),
                (ENV_MAX_LOOKUPS, "9"),
                (ENV_CALL_TIMEOUT_MS, "soon"),
            ],
            PipelineConfig::from_env,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { key, .. } if key == ENV_CALL_TIMEOUT_MS));
    }
}
