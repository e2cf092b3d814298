//! Configuration for the dispatch server and CLI.
//!
//! Sources, lowest to highest precedence: defaults, the key=value file at
//! `<home>/config`, `HEIDI_*` environment variables, CLI flags (applied by
//! the binaries).

use crate::types::AuditMode;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Environment variable naming the Heidi home directory.
pub const HOME_ENV: &str = "HEIDI_HOME";

const ENV_PREFIX: &str = "HEIDI_";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("invalid config line: {0}")]
    InvalidLine(String),
    #[error("invalid boolean value for {key}: {value}")]
    InvalidBool { key: String, value: String },
    #[error("invalid integer value for {key}: {value}")]
    InvalidInt { key: String, value: String },
    #[error("invalid command for {key}: {value}")]
    InvalidCommand { key: String, value: String },
    #[error("unable to determine home directory; set HEIDI_HOME")]
    NoHome,
}

/// Server, executor, loop and transport settings.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct Config {
    /// Root for runs, the config file and the engine socket.
    pub home: PathBuf,

    // HTTP surface
    pub host: String,
    pub port: u16,
    pub api_key: Option<String>,

    // Executors
    pub default_executor: String,
    pub default_model: Option<String>,
    pub session_timeout_sec: u64,
    /// 0 disables the timeout.
    pub process_timeout_sec: u64,
    /// Command overrides by executor name (`<name>_cmd` keys).
    pub executor_cmds: BTreeMap<String, Vec<String>>,

    // Loop controller
    pub loop_max_retries: u32,
    pub loop_max_retries_ceiling: u32,
    pub loop_backoff_ms: u64,
    pub audit_mode: AuditMode,

    // Streaming
    pub stream_poll_ms: u64,

    // Engine RPC transport
    pub rpc_socket_path: Option<PathBuf>,
    pub rpc_connect_timeout_ms: u64,
    pub rpc_request_timeout_ms: u64,
    pub rpc_max_retries: u32,
    pub rpc_backoff_ms: u64,

    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            home: default_home().unwrap_or_else(|| PathBuf::from(".heidi")),
            host: "127.0.0.1".to_string(),
            port: 7777,
            api_key: None,
            default_executor: "copilot".to_string(),
            default_model: None,
            session_timeout_sec: 120,
            process_timeout_sec: 0,
            executor_cmds: BTreeMap::new(),
            loop_max_retries: 2,
            loop_max_retries_ceiling: 10,
            loop_backoff_ms: 1000,
            audit_mode: AuditMode::Token,
            stream_poll_ms: 500,
            rpc_socket_path: None,
            rpc_connect_timeout_ms: 500,
            rpc_request_timeout_ms: 30_000,
            rpc_max_retries: 2,
            rpc_backoff_ms: 500,
            log_level: "info".to_string(),
        }
    }
}

/// `$HEIDI_HOME`, else `~/.heidi`.
pub fn default_home() -> Option<PathBuf> {
    if let Some(home) = std::env::var_os(HOME_ENV).filter(|v| !v.is_empty()) {
        return Some(PathBuf::from(home));
    }
    dirs::home_dir().map(|home| home.join(".heidi"))
}

impl Config {
    /// Loads configuration from the process environment.
    pub fn load() -> Result<Self, ConfigError> {
        let home = default_home().ok_or(ConfigError::NoHome)?;
        Self::load_from(&home, std::env::vars())
    }

    /// Loads `<home>/config` (if present) and then applies `HEIDI_*` vars.
    pub fn load_from<I>(home: &Path, vars: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut config = Self {
            home: home.to_path_buf(),
            ..Self::default()
        };
        let path = config.config_path();
        if path.is_file() {
            config.load_file(&path)?;
        }
        config.apply_env(vars)?;
        Ok(config)
    }

    /// Load a config file, overlaying existing values.
    pub fn load_file(&mut self, path: &Path) -> Result<(), ConfigError> {
        let content = std::fs::read_to_string(path)?;
        self.parse_content(&content, &path.display().to_string())
    }

    fn parse_content(&mut self, content: &str, source: &str) -> Result<(), ConfigError> {
        for line in content.lines() {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }

            let Some((key, value)) = trimmed.split_once('=') else {
                return Err(ConfigError::InvalidLine(line.to_string()));
            };

            let key = key.trim();
            let value = Self::unquote(value.trim());
            if !self.apply_value(key, &value)? {
                eprintln!("Warning: unknown config key in {source}: {key}");
            }
        }
        Ok(())
    }

    /// Applies `HEIDI_<KEY>` variables. Unrelated `HEIDI_*` variables are ignored.
    pub fn apply_env<I>(&mut self, vars: I) -> Result<(), ConfigError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (name, value) in vars {
            let Some(rest) = name.strip_prefix(ENV_PREFIX) else {
                continue;
            };
            if name == HOME_ENV {
                continue;
            }
            let key = rest.to_ascii_lowercase();
            self.apply_value(&key, value.trim())?;
        }
        Ok(())
    }

    fn unquote(value: &str) -> String {
        if value.len() >= 2
            && ((value.starts_with('"') && value.ends_with('"'))
                || (value.starts_with('\'') && value.ends_with('\'')))
        {
            return value[1..value.len() - 1].to_string();
        }
        value.to_string()
    }

    /// Apply a single config value. Returns false for unknown keys.
    fn apply_value(&mut self, key: &str, value: &str) -> Result<bool, ConfigError> {
        match key {
            "host" => self.host = value.to_string(),
            "port" => self.port = parse_int(key, value)?,
            "api_key" => self.api_key = non_empty(value),
            "default_executor" => self.default_executor = value.to_string(),
            "default_model" | "model" => self.default_model = non_empty(value),
            "session_timeout_sec" => self.session_timeout_sec = parse_int(key, value)?,
            "process_timeout_sec" => self.process_timeout_sec = parse_int(key, value)?,
            "loop_max_retries" => self.loop_max_retries = parse_int(key, value)?,
            "loop_max_retries_ceiling" => self.loop_max_retries_ceiling = parse_int(key, value)?,
            "loop_backoff_ms" => self.loop_backoff_ms = parse_int(key, value)?,
            "audit_mode" => {
                self.audit_mode = match value {
                    "token" => AuditMode::Token,
                    "executor" => AuditMode::Executor,
                    _ => {
                        return Err(ConfigError::InvalidLine(format!(
                            "audit_mode must be 'token' or 'executor', got '{value}'"
                        )))
                    }
                }
            }
            "executor_audit" => {
                self.audit_mode = if parse_bool(key, value)? {
                    AuditMode::Executor
                } else {
                    AuditMode::Token
                };
            }
            "stream_poll_ms" => self.stream_poll_ms = parse_int(key, value)?,
            "rpc_socket_path" => self.rpc_socket_path = non_empty(value).map(PathBuf::from),
            "rpc_connect_timeout_ms" => self.rpc_connect_timeout_ms = parse_int(key, value)?,
            "rpc_request_timeout_ms" => self.rpc_request_timeout_ms = parse_int(key, value)?,
            "rpc_max_retries" => self.rpc_max_retries = parse_int(key, value)?,
            "rpc_backoff_ms" => self.rpc_backoff_ms = parse_int(key, value)?,
            "log_level" => self.log_level = value.to_string(),
            _ => {
                let Some(name) = key.strip_suffix("_cmd").filter(|n| !n.is_empty()) else {
                    return Ok(false);
                };
                if value.is_empty() {
                    self.executor_cmds.remove(name);
                } else {
                    let argv = shlex::split(value)
                        .filter(|argv| !argv.is_empty())
                        .ok_or_else(|| ConfigError::InvalidCommand {
                            key: key.to_string(),
                            value: value.to_string(),
                        })?;
                    self.executor_cmds.insert(name.to_string(), argv);
                }
            }
        }
        Ok(true)
    }

    pub fn config_path(&self) -> PathBuf {
        self.home.join("config")
    }

    /// Directory holding one subdirectory per run.
    pub fn runs_dir(&self) -> PathBuf {
        self.home.join("runs")
    }

    /// Engine socket, `<home>/run/heidid.sock` unless overridden.
    pub fn socket_path(&self) -> PathBuf {
        self.rpc_socket_path
            .clone()
            .unwrap_or_else(|| self.home.join("run").join("heidid.sock"))
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn non_empty(value: &str) -> Option<String> {
    (!value.is_empty()).then(|| value.to_string())
}

fn parse_int<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidInt {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.to_lowercase().as_str() {
        "true" | "1" | "yes" | "y" | "on" => Ok(true),
        "false" | "0" | "no" | "n" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidBool {
            key: key.to_string(),
            value: value.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn vars(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn default_config_has_expected_values() {
        let config = Config::default();
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 7777);
        assert_eq!(config.default_executor, "copilot");
        assert_eq!(config.session_timeout_sec, 120);
        assert_eq!(config.loop_max_retries, 2);
        assert_eq!(config.audit_mode, AuditMode::Token);
        assert_eq!(config.rpc_connect_timeout_ms, 500);
        assert_eq!(config.rpc_request_timeout_ms, 30_000);
        assert_eq!(config.rpc_max_retries, 2);
        assert!(config.api_key.is_none());
    }

    #[test]
    fn parse_simple_config() {
        let mut config = Config::default();
        let content = r#"
# comment
port=8080
api_key="s3cret"
audit_mode=executor
loop_backoff_ms = 10
"#;
        config.parse_content(content, "test").unwrap();
        assert_eq!(config.port, 8080);
        assert_eq!(config.api_key.as_deref(), Some("s3cret"));
        assert_eq!(config.audit_mode, AuditMode::Executor);
        assert_eq!(config.loop_backoff_ms, 10);
    }

    #[test]
    fn parse_executor_commands() {
        let mut config = Config::default();
        config
            .parse_content("jules_cmd=jules remote new --session 'two words'", "test")
            .unwrap();
        assert_eq!(
            config.executor_cmds["jules"],
            vec!["jules", "remote", "new", "--session", "two words"]
        );

        config
            .parse_content("opencode_cmd=\"opencode run\"", "test")
            .unwrap();
        assert_eq!(config.executor_cmds["opencode"], vec!["opencode", "run"]);

        let err = config.parse_content("opencode_cmd=bad 'quote", "test");
        assert!(matches!(err, Err(ConfigError::InvalidCommand { .. })));
    }

    #[test]
    fn rejects_line_without_equals() {
        let mut config = Config::default();
        assert!(config.parse_content("port 8080", "test").is_err());
    }

    #[test]
    fn rejects_bad_integers_and_modes() {
        let mut config = Config::default();
        assert!(matches!(
            config.parse_content("port=http", "test"),
            Err(ConfigError::InvalidInt { .. })
        ));
        assert!(config.parse_content("audit_mode=vibes", "test").is_err());
    }

    #[test]
    fn unknown_keys_are_not_fatal() {
        let mut config = Config::default();
        config.parse_content("mystery=1", "test").unwrap();
    }

    #[test]
    fn parse_bool_accepts_variants() {
        assert!(parse_bool("test", "true").unwrap());
        assert!(parse_bool("test", "on").unwrap());
        assert!(!parse_bool("test", "no").unwrap());
        assert!(parse_bool("test", "maybe").is_err());
    }

    #[test]
    fn env_overrides_file() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("config"), "port=8000\nhost=0.0.0.0\n").unwrap();

        let config = Config::load_from(
            dir.path(),
            vars(&[
                ("HEIDI_PORT", "9000"),
                ("HEIDI_OPENCODE_CMD", "opencode run --fast"),
                ("HEIDI_ADDR", "ignored"),
                ("PATH", "/usr/bin"),
            ]),
        )
        .unwrap();

        assert_eq!(config.port, 9000);
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.executor_cmds["opencode"], vec!["opencode", "run", "--fast"]);
        assert_eq!(config.home, dir.path());
    }

    #[test]
    fn derived_paths() {
        let config = Config {
            home: PathBuf::from("/srv/heidi"),
            ..Config::default()
        };
        assert_eq!(config.runs_dir(), PathBuf::from("/srv/heidi/runs"));
        assert_eq!(
            config.socket_path(),
            PathBuf::from("/srv/heidi/run/heidid.sock")
        );
        assert_eq!(config.bind_addr(), "127.0.0.1:7777");
    }
}
