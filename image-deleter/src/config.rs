// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Interfaces for working with image deleter configuration

use serde::Deserialize;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

/// Default failed-deletion retry interval, in seconds.
const DEFAULT_RETRY_INTERVAL_SECONDS: f64 = 30.0;

/// Configuration for the image deletion coordinator
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    /// How long to wait before moving failed deletions back onto the work
    /// queue, in seconds.
    #[serde(default = "default_retry_interval_seconds")]
    pub retry_interval_seconds: f64,
}

fn default_retry_interval_seconds() -> f64 {
    DEFAULT_RETRY_INTERVAL_SECONDS
}

impl Default for Config {
    fn default() -> Config {
        Config { retry_interval_seconds: DEFAULT_RETRY_INTERVAL_SECONDS }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config from {}: {err}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        err: std::io::Error,
    },
    #[error("Failed to parse config from {}: {err}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        err: toml::de::Error,
    },
    #[error("Invalid retry interval {0}: must be a finite, non-negative number of seconds")]
    InvalidRetryInterval(f64),
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .map_err(|err| ConfigError::Io { path: path.into(), err })?;
        let config: Config = toml::from_str(&contents)
            .map_err(|err| ConfigError::Parse { path: path.into(), err })?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if !self.retry_interval_seconds.is_finite()
            || self.retry_interval_seconds < 0.0
        {
            return Err(ConfigError::InvalidRetryInterval(
                self.retry_interval_seconds,
            ));
        }
        Ok(())
    }

    /// The failed-deletion retry interval as a [`Duration`].
    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs_f64(self.retry_interval_seconds)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults() {
        let config = Config::default();
        assert_eq!(config.retry_interval_seconds, 30.0);
        assert_eq!(config.retry_interval(), Duration::from_secs(30));
    }

    #[test]
    fn parse_overrides_and_defaults() {
        let config: Config =
            toml::from_str("retry_interval_seconds = 2.5").unwrap();
        assert_eq!(config.retry_interval_seconds, 2.5);
        assert_eq!(config.retry_interval(), Duration::from_millis(2500));

        // An empty document falls back to the default.
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.retry_interval_seconds, 30.0);
    }

    #[test]
    fn validation_rejects_bad_intervals() {
        for bad in [-1.0, f64::NAN, f64::INFINITY] {
            let config = Config { retry_interval_seconds: bad };
            let err = config.validate().unwrap_err();
            assert!(
                matches!(err, ConfigError::InvalidRetryInterval(_)),
                "expected InvalidRetryInterval for {bad}, got {err}"
            );
        }
    }

    #[test]
    fn from_file_missing_path() {
        let err = Config::from_file("/nonexistent/image-deleter.toml")
            .unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }), "{err}");
    }
}
