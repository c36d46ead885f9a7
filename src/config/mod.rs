//! Recognized configuration options and their resolution.
//!
//! Every option is resolved from three places in fixed priority order: the
//! process environment, the static configuration file, then the
//! compile-time default. The winning source is recorded next to the value
//! so a session's effective configuration can always be explained.

use std::path::Path;
use std::time::Duration;

use rustc_hash::FxHashMap;
use thiserror::Error;
use tracing::debug;

use crate::tape::write_labels::TapeFlushMode;

/// Floor and default of the positioning wall-clock ceiling.
pub const POSITION_TIMEOUT_FLOOR: Duration = Duration::from_secs(900);

/// Default byte ceiling between deferred flushes.
pub const DEFAULT_MAX_BYTES_BEFORE_FLUSH: u64 = 32 * 1024 * 1024 * 1024;
/// Default file-count ceiling between deferred flushes.
pub const DEFAULT_MAX_FILES_BEFORE_FLUSH: u64 = 200;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {category} {name}: {detail}")]
    InvalidValue {
        category: &'static str,
        name: &'static str,
        detail: String,
    },

    #[error("failed to read configuration file: {0}")]
    Io(String),
}

/// Where a resolved value came from.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ConfigSource {
    Environment,
    ConfigFile,
    CompileTimeDefault,
}

/// A resolved option together with the source that won.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ResolvedEntry<T> {
    pub value: T,
    pub source: ConfigSource,
}

/// The legacy `CATEGORY NAME value` configuration file, parsed into a
/// lookup table. Lines starting with `#` and blank lines are skipped.
#[derive(Debug, Default)]
pub struct ConfigFile {
    entries: FxHashMap<(String, String), String>,
}

impl ConfigFile {
    pub fn empty() -> ConfigFile {
        ConfigFile::default()
    }

    pub fn load(path: &Path) -> Result<ConfigFile, ConfigError> {
        match std::fs::read_to_string(path) {
            Ok(content) => Ok(Self::parse(&content)),
            // a missing file simply contributes nothing
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ConfigFile::empty()),
            Err(e) => Err(ConfigError::Io(e.to_string())),
        }
    }

    pub fn parse(content: &str) -> ConfigFile {
        let mut entries = FxHashMap::default();
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut parts = line.split_whitespace();
            let (Some(category), Some(name), Some(value)) =
                (parts.next(), parts.next(), parts.next())
            else {
                continue;
            };
            entries.insert(
                (category.to_string(), name.to_string()),
                value.to_string(),
            );
        }
        ConfigFile { entries }
    }

    pub fn get(&self, category: &str, name: &str) -> Option<&str> {
        self.entries
            .get(&(category.to_string(), name.to_string()))
            .map(String::as_str)
    }
}

/// The options this crate recognizes, resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeConfig {
    pub tape_flush_mode: ResolvedEntry<TapeFlushMode>,
    pub max_bytes_before_flush: ResolvedEntry<u64>,
    pub max_files_before_flush: ResolvedEntry<u64>,
    pub position_timeout: ResolvedEntry<Duration>,
}

impl BridgeConfig {
    /// Resolves every option against the real process environment and the
    /// given configuration file.
    pub fn resolve(file: &ConfigFile) -> Result<BridgeConfig, ConfigError> {
        Self::resolve_with_env(file, |name| std::env::var(name).ok())
    }

    /// Resolution against an explicit environment lookup, so tests control
    /// the environment without mutating the process.
    pub fn resolve_with_env(
        file: &ConfigFile,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<BridgeConfig, ConfigError> {
        let tape_flush_mode = resolve_entry(
            file,
            &env,
            "TAPEBRIDGE",
            "TAPEFLUSHMODE",
            "TAPEBRIDGE_TAPEFLUSHMODE",
            TapeFlushMode::NFlushesPerFile,
            parse_flush_mode,
        )?;
        let max_bytes_before_flush = resolve_entry(
            file,
            &env,
            "TAPEBRIDGE",
            "MAXBYTESBEFOREFLUSH",
            "TAPEBRIDGE_MAXBYTESBEFOREFLUSH",
            DEFAULT_MAX_BYTES_BEFORE_FLUSH,
            parse_u64,
        )?;
        let max_files_before_flush = resolve_entry(
            file,
            &env,
            "TAPEBRIDGE",
            "MAXFILESBEFOREFLUSH",
            "TAPEBRIDGE_MAXFILESBEFOREFLUSH",
            DEFAULT_MAX_FILES_BEFORE_FLUSH,
            parse_u64,
        )?;
        let position_timeout = resolve_entry(
            file,
            &env,
            "TAPE",
            "POSITION_TIMEOUT",
            "TAPE_POSITION_TIMEOUT",
            POSITION_TIMEOUT_FLOOR,
            parse_position_timeout,
        )?;

        let config = BridgeConfig {
            tape_flush_mode,
            max_bytes_before_flush,
            max_files_before_flush,
            position_timeout,
        };
        debug!(?config, "resolved configuration");
        Ok(config)
    }
}

fn resolve_entry<T>(
    file: &ConfigFile,
    env: impl Fn(&str) -> Option<String>,
    category: &'static str,
    name: &'static str,
    env_name: &'static str,
    default: T,
    parse: fn(&str, &'static str, &'static str) -> Result<T, ConfigError>,
) -> Result<ResolvedEntry<T>, ConfigError> {
    if let Some(raw) = env(env_name) {
        return Ok(ResolvedEntry {
            value: parse(&raw, category, name)?,
            source: ConfigSource::Environment,
        });
    }
    if let Some(raw) = file.get(category, name) {
        return Ok(ResolvedEntry {
            value: parse(raw, category, name)?,
            source: ConfigSource::ConfigFile,
        });
    }
    Ok(ResolvedEntry {
        value: default,
        source: ConfigSource::CompileTimeDefault,
    })
}

fn parse_flush_mode(
    raw: &str,
    category: &'static str,
    name: &'static str,
) -> Result<TapeFlushMode, ConfigError> {
    match raw {
        "N_FLUSHES_PER_FILE" => Ok(TapeFlushMode::NFlushesPerFile),
        "ONE_FLUSH_PER_N_FILES" => Ok(TapeFlushMode::OneFlushPerNFiles),
        other => Err(ConfigError::InvalidValue {
            category,
            name,
            detail: format!(
                "\"{}\" is neither N_FLUSHES_PER_FILE nor ONE_FLUSH_PER_N_FILES",
                other
            ),
        }),
    }
}

fn parse_u64(raw: &str, category: &'static str, name: &'static str) -> Result<u64, ConfigError> {
    raw.parse::<u64>().map_err(|e| ConfigError::InvalidValue {
        category,
        name,
        detail: e.to_string(),
    })
}

/// The positioning ceiling is clamped up to its floor: a site can make the
/// engine more patient, never less.
fn parse_position_timeout(
    raw: &str,
    category: &'static str,
    name: &'static str,
) -> Result<Duration, ConfigError> {
    let seconds = raw.parse::<u64>().map_err(|e| ConfigError::InvalidValue {
        category,
        name,
        detail: e.to_string(),
    })?;
    Ok(Duration::from_secs(seconds).max(POSITION_TIMEOUT_FLOOR))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn test_defaults_when_nothing_is_set() {
        let config = BridgeConfig::resolve_with_env(&ConfigFile::empty(), no_env).unwrap();
        assert_eq!(
            config.tape_flush_mode,
            ResolvedEntry {
                value: TapeFlushMode::NFlushesPerFile,
                source: ConfigSource::CompileTimeDefault
            }
        );
        assert_eq!(config.position_timeout.value, POSITION_TIMEOUT_FLOOR);
        assert_eq!(config.position_timeout.source, ConfigSource::CompileTimeDefault);
    }

    #[test]
    fn test_config_file_wins_over_default() {
        let file = ConfigFile::parse(
            "# site configuration\n\
             TAPEBRIDGE TAPEFLUSHMODE ONE_FLUSH_PER_N_FILES\n\
             TAPEBRIDGE MAXFILESBEFOREFLUSH 500\n\
             TAPE POSITION_TIMEOUT 1800\n",
        );
        let config = BridgeConfig::resolve_with_env(&file, no_env).unwrap();
        assert_eq!(config.tape_flush_mode.value, TapeFlushMode::OneFlushPerNFiles);
        assert_eq!(config.tape_flush_mode.source, ConfigSource::ConfigFile);
        assert_eq!(config.max_files_before_flush.value, 500);
        assert_eq!(config.position_timeout.value, Duration::from_secs(1800));
        // untouched options keep their defaults
        assert_eq!(config.max_bytes_before_flush.source, ConfigSource::CompileTimeDefault);
    }

    #[test]
    fn test_environment_wins_over_config_file() {
        let file = ConfigFile::parse("TAPEBRIDGE TAPEFLUSHMODE ONE_FLUSH_PER_N_FILES\n");
        let env = |name: &str| {
            (name == "TAPEBRIDGE_TAPEFLUSHMODE").then(|| "N_FLUSHES_PER_FILE".to_string())
        };
        let config = BridgeConfig::resolve_with_env(&file, env).unwrap();
        assert_eq!(config.tape_flush_mode.value, TapeFlushMode::NFlushesPerFile);
        assert_eq!(config.tape_flush_mode.source, ConfigSource::Environment);
    }

    #[rstest]
    #[case::below_floor("60", POSITION_TIMEOUT_FLOOR)]
    #[case::at_floor("900", Duration::from_secs(900))]
    #[case::above_floor("3600", Duration::from_secs(3600))]
    fn test_position_timeout_floor_clamp(#[case] raw: &str, #[case] expected: Duration) {
        let file = ConfigFile::parse(&format!("TAPE POSITION_TIMEOUT {}\n", raw));
        let config = BridgeConfig::resolve_with_env(&file, no_env).unwrap();
        assert_eq!(config.position_timeout.value, expected);
    }

    #[rstest]
    #[case::flush_mode("TAPEBRIDGE TAPEFLUSHMODE SOMETIMES\n")]
    #[case::bytes("TAPEBRIDGE MAXBYTESBEFOREFLUSH lots\n")]
    #[case::timeout("TAPE POSITION_TIMEOUT soon\n")]
    fn test_invalid_values_are_rejected(#[case] content: &str) {
        let file = ConfigFile::parse(content);
        let actual = BridgeConfig::resolve_with_env(&file, no_env);
        assert!(matches!(actual, Err(ConfigError::InvalidValue { .. })));
    }

    #[test]
    fn test_config_file_parse_skips_noise() {
        let file = ConfigFile::parse(
            "# comment\n\
             \n\
             INCOMPLETE LINE\n\
             TAPE POSITION_TIMEOUT 901 trailing words ignored\n",
        );
        assert_eq!(file.get("TAPE", "POSITION_TIMEOUT"), Some("901"));
        assert_eq!(file.get("INCOMPLETE", "LINE"), None);
    }

    #[test]
    fn test_missing_file_contributes_nothing() {
        let file = ConfigFile::load(Path::new("/nonexistent/castor.conf")).unwrap();
        assert_eq!(file.get("TAPE", "POSITION_TIMEOUT"), None);
    }
}
