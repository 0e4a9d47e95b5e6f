//! Configuration: defaults, an optional TOML file and environment
//! overrides. Command-line flags are applied on top by the binary.
//!
//! Priority: CLI flags > environment > config file > defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::archive::{FilterPolicy, PrefilterOptions, RebuildOptions};
use crate::archive::filter::{DEFAULT_BUFFER_HOURS, DEFAULT_REDUCTION_THRESHOLD};
use crate::error::ConfigError;
use crate::job::{PoolOptions, DEFAULT_MAX_CONCURRENT_JOBS, DEFAULT_STALE_AFTER};
use crate::parser::ProcessParserConfig;

pub const ENV_CONFIG_FILE: &str = "LOGSIEVE_CONFIG";
pub const ENV_ENGINE: &str = "LOGSIEVE_ENGINE";
pub const ENV_TEMP_DIR: &str = "LOGSIEVE_TEMP_DIR";
pub const ENV_MAX_JOBS: &str = "LOGSIEVE_MAX_JOBS";
pub const ENV_PARSER_TIMEOUT: &str = "LOGSIEVE_PARSER_TIMEOUT";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Where filtered and downloaded archives are written
    pub temp_dir: PathBuf,
    pub max_concurrent_jobs: usize,
    /// Leftover filtered archives at least this old are removed at start-up
    pub stale_after_secs: u64,
    pub filter: FilterConfig,
    pub parser: ParserConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    pub buffer_hours: i64,
    pub reduction_threshold: f64,
    pub prefer_parallel_codec: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParserConfig {
    pub engine: PathBuf,
    pub extra_args: Vec<String>,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Pretty,
    Json,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            temp_dir: std::env::temp_dir(),
            max_concurrent_jobs: DEFAULT_MAX_CONCURRENT_JOBS,
            stale_after_secs: DEFAULT_STALE_AFTER.as_secs(),
            filter: FilterConfig::default(),
            parser: ParserConfig::default(),
            log: LogConfig::default(),
        }
    }
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            buffer_hours: DEFAULT_BUFFER_HOURS,
            reduction_threshold: DEFAULT_REDUCTION_THRESHOLD,
            prefer_parallel_codec: true,
        }
    }
}

impl Default for ParserConfig {
    fn default() -> Self {
        Self {
            engine: PathBuf::from("legacy-parser"),
            extra_args: Vec::new(),
            timeout_secs: 1800,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

impl Config {
    /// Load from `path`, or `LOGSIEVE_CONFIG` when no path is given, then
    /// apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        Self::load_with(path, |key| std::env::var(key).ok())
    }

    /// [`Config::load`] with an explicit environment lookup.
    pub fn load_with<F>(path: Option<&Path>, env: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = match Self::resolve_path_with(path, &env) {
            Some(path) => Self::from_file(&path)?,
            None => Self::default(),
        };
        config.apply_env(env)?;
        Ok(config)
    }

    /// The file [`Config::load`] reads, if any.
    pub fn resolve_path(path: Option<&Path>) -> Option<PathBuf> {
        Self::resolve_path_with(path, |key| std::env::var(key).ok())
    }

    fn resolve_path_with<F>(path: Option<&Path>, env: F) -> Option<PathBuf>
    where
        F: Fn(&str) -> Option<String>,
    {
        path.map(Path::to_path_buf)
            .or_else(|| env(ENV_CONFIG_FILE).map(PathBuf::from))
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml(&contents).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    pub fn from_toml(contents: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }

    fn apply_env<F>(&mut self, env: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(engine) = env(ENV_ENGINE) {
            self.parser.engine = PathBuf::from(engine);
        }
        if let Some(dir) = env(ENV_TEMP_DIR) {
            self.temp_dir = PathBuf::from(dir);
        }
        if let Some(jobs) = env(ENV_MAX_JOBS) {
            self.max_concurrent_jobs = parse_env(ENV_MAX_JOBS, &jobs)?;
        }
        if let Some(timeout) = env(ENV_PARSER_TIMEOUT) {
            self.parser.timeout_secs = parse_env(ENV_PARSER_TIMEOUT, &timeout)?;
        }
        Ok(())
    }

    /// Reject values the pipeline cannot work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let threshold = self.filter.reduction_threshold;
        if !(0.0..1.0).contains(&threshold) {
            return Err(ConfigError::Invalid(format!(
                "filter.reduction_threshold must be in [0, 1), got {threshold}"
            )));
        }
        if self.filter.buffer_hours < 0 {
            return Err(ConfigError::Invalid(
                "filter.buffer_hours must not be negative".to_string(),
            ));
        }
        if self.max_concurrent_jobs == 0 {
            return Err(ConfigError::Invalid(
                "max_concurrent_jobs must be > 0".to_string(),
            ));
        }
        if self.stale_after_secs < self.parser.timeout_secs {
            return Err(ConfigError::Invalid(format!(
                "stale_after_secs must be at least parser.timeout_secs ({})",
                self.parser.timeout_secs
            )));
        }
        if self.parser.timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "parser.timeout_secs must be > 0".to_string(),
            ));
        }
        if self.parser.engine.as_os_str().is_empty() {
            return Err(ConfigError::Invalid(
                "parser.engine must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    pub fn filter_policy(&self) -> FilterPolicy {
        FilterPolicy {
            buffer: chrono::Duration::hours(self.filter.buffer_hours),
            reduction_threshold: self.filter.reduction_threshold,
        }
    }

    pub fn prefilter_options(&self) -> PrefilterOptions {
        PrefilterOptions {
            policy: self.filter_policy(),
            rebuild: RebuildOptions {
                temp_dir: self.temp_dir.clone(),
                prefer_parallel: self.filter.prefer_parallel_codec,
            },
        }
    }

    pub fn parser_config(&self) -> ProcessParserConfig {
        ProcessParserConfig {
            engine: self.parser.engine.clone(),
            extra_args: self.parser.extra_args.clone(),
            timeout: Duration::from_secs(self.parser.timeout_secs),
        }
    }

    pub fn pool_options(&self) -> PoolOptions {
        PoolOptions {
            max_concurrent_jobs: self.max_concurrent_jobs,
            stale_after: Duration::from_secs(self.stale_after_secs),
        }
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::Invalid(format!("{key}: cannot parse {value:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_are_valid() {
        let config = Config::load_with(None, env(&[])).unwrap();
        assert_eq!(config, Config::default());
        config.validate().unwrap();
        assert_eq!(config.filter.buffer_hours, 2);
        assert_eq!(config.parser.timeout_secs, 1800);
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let config = Config::from_toml(
            r#"
            max_concurrent_jobs = 4

            [filter]
            reduction_threshold = 0.5

            [log]
            format = "json"
            "#,
        )
        .unwrap();
        assert_eq!(config.max_concurrent_jobs, 4);
        assert_eq!(config.filter.reduction_threshold, 0.5);
        assert_eq!(config.filter.buffer_hours, DEFAULT_BUFFER_HOURS);
        assert_eq!(config.log.format, LogFormat::Json);
        assert_eq!(config.parser.engine, PathBuf::from("legacy-parser"));
    }

    #[test]
    fn environment_overrides_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logsieve.toml");
        std::fs::write(&path, "[parser]\nengine = \"/opt/file-engine\"\ntimeout_secs = 60\n")
            .unwrap();

        let config = Config::load_with(
            None,
            env(&[
                (ENV_CONFIG_FILE, path.to_str().unwrap()),
                (ENV_ENGINE, "/opt/env-engine"),
                (ENV_MAX_JOBS, "8"),
            ]),
        )
        .unwrap();
        assert_eq!(config.parser.engine, PathBuf::from("/opt/env-engine"));
        assert_eq!(config.parser.timeout_secs, 60);
        assert_eq!(config.max_concurrent_jobs, 8);
    }

    #[test]
    fn flag_path_wins_over_environment_path() {
        let lookup = env(&[(ENV_CONFIG_FILE, "/etc/logsieve/env.toml")]);
        assert_eq!(
            Config::resolve_path_with(Some(Path::new("/tmp/flag.toml")), &lookup),
            Some(PathBuf::from("/tmp/flag.toml"))
        );
        assert_eq!(
            Config::resolve_path_with(None, &lookup),
            Some(PathBuf::from("/etc/logsieve/env.toml"))
        );
        assert_eq!(Config::resolve_path_with(None, env(&[])), None);
    }

    #[test]
    fn sweep_age_must_outlast_a_mode() {
        let mut config = Config::default();
        assert!(config.stale_after_secs >= config.parser.timeout_secs);

        config.stale_after_secs = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        config.stale_after_secs = config.parser.timeout_secs;
        config.validate().unwrap();
    }

    #[test]
    fn bad_environment_values_are_rejected() {
        let err = Config::load_with(None, env(&[(ENV_PARSER_TIMEOUT, "soon")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn missing_file_is_an_error() {
        let err = Config::load_with(Some(Path::new("/nonexistent/logsieve.toml")), env(&[]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn validate_rejects_out_of_range_values() {
        let mut config = Config::default();
        config.filter.reduction_threshold = 1.0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.max_concurrent_jobs = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.parser.timeout_secs = 0;
        assert!(config.validate().is_err());
    }
}
