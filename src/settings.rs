use serde::Deserialize;

/// Configuration consumed directly by the core, per the external-interfaces
/// contract. Loading this from a file/env layer is the embedder's job; the
/// core only needs the validated snapshot.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub max_concurrent_tasks: usize,
    pub task_max_cost: f64,
    pub task_max_duration_seconds: u64,
    pub heartbeat_interval_seconds: f64,
    pub heartbeat_timeout_seconds: f64,
    pub retry_delay_seconds: f64,
    pub background_model: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            max_concurrent_tasks: 3,
            task_max_cost: 10.0,
            task_max_duration_seconds: 3600,
            heartbeat_interval_seconds: 60.0,
            heartbeat_timeout_seconds: 300.0,
            retry_delay_seconds: 30.0,
            background_model: None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("max_concurrent_tasks must be >= 1")]
    ZeroConcurrency,
    #[error("task_max_cost must be positive")]
    NonPositiveCost,
    #[error("task_max_duration_seconds must be positive")]
    NonPositiveDuration,
    #[error("heartbeat_interval_seconds must be positive")]
    NonPositiveInterval,
    #[error("heartbeat_timeout_seconds must be positive")]
    NonPositiveTimeout,
    #[error("retry_delay_seconds must be non-negative")]
    NegativeRetryDelay,
    #[error(transparent)]
    Load(#[from] config::ConfigError),
}

impl Settings {
    pub fn validate(&self) -> std::result::Result<(), SettingsError> {
        if self.max_concurrent_tasks < 1 {
            return Err(SettingsError::ZeroConcurrency);
        }
        if self.task_max_cost <= 0.0 {
            return Err(SettingsError::NonPositiveCost);
        }
        if self.task_max_duration_seconds == 0 {
            return Err(SettingsError::NonPositiveDuration);
        }
        if self.heartbeat_interval_seconds <= 0.0 {
            return Err(SettingsError::NonPositiveInterval);
        }
        if self.heartbeat_timeout_seconds <= 0.0 {
            return Err(SettingsError::NonPositiveTimeout);
        }
        if self.retry_delay_seconds < 0.0 {
            return Err(SettingsError::NegativeRetryDelay);
        }
        Ok(())
    }

    /// Layers `Settings::default()` under an optional TOML file and
    /// `TASKCORE_*` environment overrides, validating the result.
    pub fn load(config_path: Option<&str>) -> std::result::Result<Self, SettingsError> {
        let defaults = Settings::default();
        let mut builder = config::Config::builder()
            .set_default("max_concurrent_tasks", defaults.max_concurrent_tasks as i64)?
            .set_default("task_max_cost", defaults.task_max_cost)?
            .set_default(
                "task_max_duration_seconds",
                defaults.task_max_duration_seconds as i64,
            )?
            .set_default(
                "heartbeat_interval_seconds",
                defaults.heartbeat_interval_seconds,
            )?
            .set_default(
                "heartbeat_timeout_seconds",
                defaults.heartbeat_timeout_seconds,
            )?
            .set_default("retry_delay_seconds", defaults.retry_delay_seconds)?;

        if let Some(path) = config_path {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }
        builder = builder.add_source(config::Environment::with_prefix("TASKCORE"));

        let settings: Settings = builder.build()?.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert!(Settings::default().validate().is_ok());
    }

    #[test]
    fn rejects_zero_concurrency() {
        let mut s = Settings::default();
        s.max_concurrent_tasks = 0;
        assert!(matches!(s.validate(), Err(SettingsError::ZeroConcurrency)));
    }
}
