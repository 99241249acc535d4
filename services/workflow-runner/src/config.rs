//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! Credentials are loaded from the WORKFLOW_CREDENTIALS env var or
//! `runner.credentials_file`, never stored in the TOML directly.

use common::Secret;
use runner::RunnerOptions;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use upstream::BackoffPolicy;

/// Env var holding credentials, separated by commas or newlines.
pub const CREDENTIALS_ENV: &str = "WORKFLOW_CREDENTIALS";

/// Upper bound on every configured wait or timeout (one week).
pub const MAX_WAIT_SECS: u64 = 7 * 24 * 60 * 60;

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub runner: RunnerConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    pub command: CommandConfig,
    #[serde(default)]
    pub items: ItemsConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Coordinator settings
#[derive(Debug, Deserialize)]
pub struct RunnerConfig {
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default = "default_acquire_timeout")]
    pub acquire_timeout_secs: u64,
    #[serde(default)]
    pub log_format: LogFormat,
    /// List items without running them; `--dry-run` also turns this on
    #[serde(default)]
    pub dry_run: bool,
    /// Where to write the JSON run report, if anywhere
    #[serde(default)]
    pub report_path: Option<PathBuf>,
    /// File with one credential per line (alternative to WORKFLOW_CREDENTIALS)
    #[serde(default)]
    pub credentials_file: Option<PathBuf>,
    #[serde(skip)]
    pub credentials: Vec<Secret<String>>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            acquire_timeout_secs: default_acquire_timeout(),
            log_format: LogFormat::default(),
            dry_run: false,
            report_path: None,
            credentials_file: None,
            credentials: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

/// Retry and backoff settings
#[derive(Debug, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_secs")]
    pub max_delay_secs: u64,
    #[serde(default = "default_rate_limit_wait_secs")]
    pub rate_limit_wait_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_secs: default_max_delay_secs(),
            rate_limit_wait_secs: default_rate_limit_wait_secs(),
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> BackoffPolicy {
        BackoffPolicy {
            max_attempts: self.max_attempts,
            base: Duration::from_millis(self.base_delay_ms),
            cap: Duration::from_secs(self.max_delay_secs),
            rate_limit_wait: Duration::from_secs(self.rate_limit_wait_secs),
        }
    }
}

/// External command run once per item attempt
#[derive(Debug, Clone, Deserialize)]
pub struct CommandConfig {
    pub program: String,
    /// Arguments; `{item}` is replaced with the item identifier
    #[serde(default)]
    pub args: Vec<String>,
    /// Env var the credential token is exported as
    #[serde(default)]
    pub credential_env: Option<String>,
    #[serde(default = "default_command_timeout")]
    pub timeout_secs: u64,
}

/// Item identifiers, inline and/or from a file
#[derive(Debug, Default, Deserialize)]
pub struct ItemsConfig {
    #[serde(default)]
    pub ids: Vec<String>,
    #[serde(default)]
    pub file: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
pub struct MetricsConfig {
    /// Prometheus scrape endpoint; metrics are not exported when unset
    #[serde(default)]
    pub listen_addr: Option<SocketAddr>,
}

fn default_max_concurrency() -> usize {
    runner::DEFAULT_MAX_CONCURRENCY
}

fn default_acquire_timeout() -> u64 {
    300
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_max_delay_secs() -> u64 {
    60
}

fn default_rate_limit_wait_secs() -> u64 {
    60
}

fn default_command_timeout() -> u64 {
    600
}

impl Config {
    /// Load configuration from a TOML file, then overlay environment variables.
    ///
    /// Credential resolution order:
    /// 1. WORKFLOW_CREDENTIALS env var
    /// 2. credentials_file path from config
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;

        if let Ok(raw) = std::env::var(CREDENTIALS_ENV) {
            config.runner.credentials = parse_credentials(&raw);
        } else if let Some(ref file) = config.runner.credentials_file {
            let raw = std::fs::read_to_string(file).map_err(|e| {
                common::Error::Config(format!(
                    "failed to read credentials_file {}: {e}",
                    file.display()
                ))
            })?;
            config.runner.credentials = parse_credentials(&raw);
        }

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> common::Result<()> {
        let nonzero = [
            ("acquire_timeout_secs", self.runner.acquire_timeout_secs),
            ("max_attempts", u64::from(self.retry.max_attempts)),
            ("base_delay_ms", self.retry.base_delay_ms),
            ("max_delay_secs", self.retry.max_delay_secs),
            ("timeout_secs", self.command.timeout_secs),
        ];
        for (name, value) in nonzero {
            if value == 0 {
                return Err(common::Error::Config(format!(
                    "{name} must be greater than 0"
                )));
            }
        }

        let bounded = [
            ("acquire_timeout_secs", self.runner.acquire_timeout_secs),
            ("base_delay_ms", self.retry.base_delay_ms / 1000),
            ("max_delay_secs", self.retry.max_delay_secs),
            ("rate_limit_wait_secs", self.retry.rate_limit_wait_secs),
            ("timeout_secs", self.command.timeout_secs),
        ];
        for (name, secs) in bounded {
            if secs > MAX_WAIT_SECS {
                return Err(common::Error::Config(format!(
                    "{name} must not exceed {MAX_WAIT_SECS} seconds"
                )));
            }
        }

        if self.command.program.trim().is_empty() {
            return Err(common::Error::Config(
                "command.program must not be empty".into(),
            ));
        }

        if let Some(ref env) = self.command.credential_env
            && self.runner.credentials.is_empty()
        {
            return Err(common::Error::Config(format!(
                "credential_env = {env:?} but no credentials were provided \
                 (set {CREDENTIALS_ENV} or runner.credentials_file)"
            )));
        }

        Ok(())
    }

    /// Coordinator options, with the simulated rate-limit hook read from the
    /// environment.
    pub fn runner_options(&self) -> RunnerOptions {
        RunnerOptions {
            max_concurrency: self.runner.max_concurrency,
            acquire_timeout: Some(Duration::from_secs(self.runner.acquire_timeout_secs)),
            backoff: self.retry.policy(),
            ..RunnerOptions::from_env()
        }
    }

    /// Inline ids followed by the ids file, blank lines and `#` comments
    /// skipped. Order is preserved and duplicates are kept.
    pub fn load_items(&self) -> common::Result<Vec<String>> {
        let mut items: Vec<String> = self
            .items
            .ids
            .iter()
            .map(|id| id.trim().to_owned())
            .filter(|id| !id.is_empty())
            .collect();

        if let Some(ref file) = self.items.file {
            let contents = std::fs::read_to_string(file).map_err(|e| {
                common::Error::Config(format!("failed to read items file {}: {e}", file.display()))
            })?;
            items.extend(
                contents
                    .lines()
                    .map(str::trim)
                    .filter(|line| !line.is_empty() && !line.starts_with('#'))
                    .map(str::to_owned),
            );
        }

        Ok(items)
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("workflow-runner.toml")
    }
}

fn parse_credentials(raw: &str) -> Vec<Secret<String>> {
    raw.split([',', '\n'])
        .map(str::trim)
        .filter(|token| !token.is_empty() && !token.starts_with('#'))
        .map(|token| Secret::new(token.to_owned()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Mutex to serialize tests that mutate environment variables, preventing
    /// data races when tests run in parallel.
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    /// SAFETY: Callers must hold ENV_MUTEX to prevent concurrent env mutation.
    unsafe fn set_env(key: &str, val: &str) {
        unsafe { std::env::set_var(key, val) };
    }

    unsafe fn remove_env(key: &str) {
        unsafe { std::env::remove_var(key) };
    }

    fn minimal_toml() -> &'static str {
        r#"
[command]
program = "echo"
args = ["processing", "{item}"]
"#
    }

    fn write_config(dir: &tempfile::TempDir, contents: &str) -> PathBuf {
        let path = dir.path().join("config.toml");
        std::fs::write(&path, contents).unwrap();
        path
    }

    fn exposed(config: &Config) -> Vec<&str> {
        config
            .runner
            .credentials
            .iter()
            .map(|c| c.expose().as_str())
            .collect()
    }

    #[test]
    fn test_load_minimal_config_uses_defaults() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { remove_env(CREDENTIALS_ENV) };
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, minimal_toml());

        let config = Config::load(&path).unwrap();
        assert_eq!(config.runner.max_concurrency, 3);
        assert_eq!(config.runner.acquire_timeout_secs, 300);
        assert_eq!(config.runner.log_format, LogFormat::Json);
        assert!(!config.runner.dry_run);
        assert_eq!(config.retry.policy(), BackoffPolicy::default());
        assert_eq!(config.command.timeout_secs, 600);
        assert!(config.command.credential_env.is_none());
        assert!(config.runner.credentials.is_empty());
        assert!(config.metrics.listen_addr.is_none());
    }

    #[test]
    fn test_load_full_config() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { set_env(CREDENTIALS_ENV, "sk-one") };
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            &dir,
            r#"
[runner]
max_concurrency = 20
acquire_timeout_secs = 30
log_format = "pretty"
dry_run = true
report_path = "out/report.json"

[retry]
max_attempts = 5
base_delay_ms = 250
max_delay_secs = 10
rate_limit_wait_secs = 45

[command]
program = "claude"
args = ["-p", "Review {item}"]
credential_env = "ANTHROPIC_API_KEY"
timeout_secs = 120

[items]
ids = ["a", "b"]

[metrics]
listen_addr = "127.0.0.1:9100"
"#,
        );

        let config = Config::load(&path).unwrap();
        unsafe { remove_env(CREDENTIALS_ENV) };

        assert_eq!(config.runner.max_concurrency, 20);
        assert_eq!(config.runner.log_format, LogFormat::Pretty);
        assert!(config.runner.dry_run);
        assert_eq!(
            config.runner.report_path.as_deref(),
            Some(Path::new("out/report.json"))
        );
        assert_eq!(config.command.credential_env.as_deref(), Some("ANTHROPIC_API_KEY"));
        assert_eq!(
            config.metrics.listen_addr,
            Some("127.0.0.1:9100".parse().unwrap())
        );

        let options = config.runner_options();
        assert_eq!(options.max_concurrency, 20, "clamping happens in the coordinator");
        assert_eq!(options.acquire_timeout, Some(Duration::from_secs(30)));
        assert_eq!(options.backoff.max_attempts, 5);
        assert_eq!(options.backoff.base, Duration::from_millis(250));
        assert_eq!(options.backoff.cap, Duration::from_secs(10));
        assert_eq!(options.backoff.rate_limit_wait, Duration::from_secs(45));
    }

    #[test]
    fn test_load_missing_file() {
        let result = Config::load(Path::new("/nonexistent/path/config.toml"));
        assert!(matches!(result, Err(common::Error::Io(_))));
    }

    #[test]
    fn test_load_invalid_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, "not valid {{{{ toml");
        assert!(matches!(Config::load(&path), Err(common::Error::Toml(_))));
    }

    #[test]
    fn test_missing_command_section_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, "[runner]\nmax_concurrency = 2\n");
        assert!(Config::load(&path).is_err());
    }

    #[test]
    fn test_credentials_from_env() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, minimal_toml());

        unsafe { set_env(CREDENTIALS_ENV, "sk-aaa, sk-bbb\nsk-ccc,,") };
        let config = Config::load(&path).unwrap();
        unsafe { remove_env(CREDENTIALS_ENV) };

        assert_eq!(exposed(&config), vec!["sk-aaa", "sk-bbb", "sk-ccc"]);
    }

    #[test]
    fn test_credentials_from_file() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { remove_env(CREDENTIALS_ENV) };
        let dir = tempfile::tempdir().unwrap();
        let creds = dir.path().join("creds");
        std::fs::write(&creds, "# primary\nsk-file-1\n\n  sk-file-2  \n").unwrap();
        let path = write_config(
            &dir,
            &format!(
                "[runner]\ncredentials_file = \"{}\"\n{}",
                creds.display(),
                minimal_toml()
            ),
        );

        let config = Config::load(&path).unwrap();
        assert_eq!(exposed(&config), vec!["sk-file-1", "sk-file-2"]);
    }

    #[test]
    fn test_credentials_env_overrides_file() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            &dir,
            &format!(
                "[runner]\ncredentials_file = \"/nonexistent/creds\"\n{}",
                minimal_toml()
            ),
        );

        unsafe { set_env(CREDENTIALS_ENV, "sk-env-wins") };
        let config = Config::load(&path).unwrap();
        unsafe { remove_env(CREDENTIALS_ENV) };

        assert_eq!(
            exposed(&config),
            vec!["sk-env-wins"],
            "WORKFLOW_CREDENTIALS must take precedence over a missing credentials_file"
        );
    }

    #[test]
    fn test_credentials_file_nonexistent_returns_error() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { remove_env(CREDENTIALS_ENV) };
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            &dir,
            &format!(
                "[runner]\ncredentials_file = \"/nonexistent/creds\"\n{}",
                minimal_toml()
            ),
        );

        let err = Config::load(&path).unwrap_err().to_string();
        assert!(err.contains("failed to read credentials_file"), "got: {err}");
    }

    #[test]
    fn test_credential_env_without_credentials_rejected() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { remove_env(CREDENTIALS_ENV) };
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            &dir,
            r#"
[command]
program = "claude"
credential_env = "ANTHROPIC_API_KEY"
"#,
        );

        let err = Config::load(&path).unwrap_err().to_string();
        assert!(err.contains("no credentials were provided"), "got: {err}");
    }

    #[test]
    fn test_zero_values_rejected() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { remove_env(CREDENTIALS_ENV) };
        let cases = [
            ("[retry]\nmax_attempts = 0\n", "max_attempts"),
            ("[retry]\nbase_delay_ms = 0\n", "base_delay_ms"),
            ("[retry]\nmax_delay_secs = 0\n", "max_delay_secs"),
            ("[runner]\nacquire_timeout_secs = 0\n", "acquire_timeout_secs"),
        ];
        for (section, field) in cases {
            let dir = tempfile::tempdir().unwrap();
            let path = write_config(&dir, &format!("{section}{}", minimal_toml()));
            let err = Config::load(&path).unwrap_err().to_string();
            assert!(
                err.contains(&format!("{field} must be greater than 0")),
                "{field}: got {err}"
            );
        }

        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, "[command]\nprogram = \"echo\"\ntimeout_secs = 0\n");
        assert!(Config::load(&path).is_err(), "timeout_secs = 0 must be rejected");
    }

    #[test]
    fn test_oversized_waits_rejected() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { remove_env(CREDENTIALS_ENV) };
        let cases = [
            ("[runner]\nacquire_timeout_secs = 9223372036854775807\n", "acquire_timeout_secs"),
            ("[retry]\nrate_limit_wait_secs = 9223372036854775807\n", "rate_limit_wait_secs"),
            ("[retry]\nmax_delay_secs = 604801\n", "max_delay_secs"),
            ("[retry]\nbase_delay_ms = 9223372036854775807\n", "base_delay_ms"),
        ];
        for (section, field) in cases {
            let dir = tempfile::tempdir().unwrap();
            let path = write_config(&dir, &format!("{section}{}", minimal_toml()));
            let err = Config::load(&path).unwrap_err().to_string();
            assert!(
                err.contains(&format!("{field} must not exceed {MAX_WAIT_SECS} seconds")),
                "{field}: got {err}"
            );
        }

        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            &dir,
            &format!("[runner]\nacquire_timeout_secs = {MAX_WAIT_SECS}\n{}", minimal_toml()),
        );
        assert!(Config::load(&path).is_ok(), "the bound itself is accepted");
    }

    #[test]
    fn test_empty_program_rejected() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { remove_env(CREDENTIALS_ENV) };
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, "[command]\nprogram = \"  \"\n");
        let err = Config::load(&path).unwrap_err().to_string();
        assert!(err.contains("command.program"), "got: {err}");
    }

    #[test]
    fn test_unknown_log_format_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            &dir,
            &format!("[runner]\nlog_format = \"xml\"\n{}", minimal_toml()),
        );
        assert!(matches!(Config::load(&path), Err(common::Error::Toml(_))));
    }

    #[test]
    fn test_load_items_merges_inline_and_file() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { remove_env(CREDENTIALS_ENV) };
        let dir = tempfile::tempdir().unwrap();
        let items = dir.path().join("items.txt");
        std::fs::write(&items, "# backlog\nissue-3\n\n issue-4 \n").unwrap();
        let path = write_config(
            &dir,
            &format!(
                "[items]\nids = [\"issue-1\", \" \", \"issue-2\"]\nfile = \"{}\"\n{}",
                items.display(),
                minimal_toml()
            ),
        );

        let config = Config::load(&path).unwrap();
        assert_eq!(
            config.load_items().unwrap(),
            vec!["issue-1", "issue-2", "issue-3", "issue-4"]
        );
    }

    #[test]
    fn test_load_items_missing_file_is_error() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { remove_env(CREDENTIALS_ENV) };
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            &dir,
            &format!("[items]\nfile = \"/nonexistent/items\"\n{}", minimal_toml()),
        );
        let config = Config::load(&path).unwrap();
        assert!(config.load_items().is_err());
    }

    #[test]
    fn test_resolve_path_cli_arg() {
        let path = Config::resolve_path(Some("/custom/path.toml"));
        assert_eq!(path, PathBuf::from("/custom/path.toml"));
    }

    #[test]
    fn test_resolve_path_env_var() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { set_env("CONFIG_PATH", "/env/path.toml") };
        let path = Config::resolve_path(None);
        assert_eq!(path, PathBuf::from("/env/path.toml"));
        unsafe { remove_env("CONFIG_PATH") };
    }

    #[test]
    fn test_resolve_path_default() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { remove_env("CONFIG_PATH") };
        let path = Config::resolve_path(None);
        assert_eq!(path, PathBuf::from("workflow-runner.toml"));
    }

    #[test]
    fn test_resolve_path_cli_overrides_env() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { set_env("CONFIG_PATH", "/env/should-lose.toml") };
        let path = Config::resolve_path(Some("/cli/wins.toml"));
        assert_eq!(
            path,
            PathBuf::from("/cli/wins.toml"),
            "CLI arg must take precedence over CONFIG_PATH env var"
        );
        unsafe { remove_env("CONFIG_PATH") };
    }

    #[test]
    fn test_credentials_are_redacted_in_debug() {
        let creds = parse_credentials("sk-very-secret-token");
        let debug = format!("{creds:?}");
        assert!(!debug.contains("very-secret"), "got: {debug}");
    }
}
