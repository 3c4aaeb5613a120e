use anyhow::{anyhow, bail, Context, Result};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use aigate_core::TierThresholds;

use crate::dispatch::{DispatchConfig, QueueClientConfig, QueueEndpoints};
use crate::importer::ImportConfig;

#[derive(Clone)]
pub struct GitHubAppConfig {
    pub app_id: u64,
    pub private_key: String,
}

#[derive(Clone)]
pub struct BitbucketConfig {
    pub username: String,
    pub app_password: String,
}

#[derive(Clone)]
pub struct AzureDevOpsConfig {
    pub organization: String,
    pub pat: String,
}

#[derive(Clone)]
pub struct Config {
    pub port: u16,
    /// Directory for persistent state (SQLite database).
    pub state_dir: PathBuf,
    /// Root of the per-pull-request analysis directories.
    pub workspace_dir: PathBuf,
    /// Webhooks are rejected when unset.
    pub github_webhook_secret: Option<String>,
    /// Bearer token for `/rerun`. The endpoint is disabled when unset.
    pub rerun_auth_token: Option<String>,
    pub github: Option<GitHubAppConfig>,
    pub bitbucket: Option<BitbucketConfig>,
    pub azure_devops: Option<AzureDevOpsConfig>,
    pub details_base_url: Option<String>,
    pub dispatch: DispatchConfig,
    pub queue_client: QueueClientConfig,
    pub import: ImportConfig,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("port", &self.port)
            .field("state_dir", &self.state_dir)
            .field("workspace_dir", &self.workspace_dir)
            .field("github", &self.github.as_ref().map(|g| g.app_id))
            .field("bitbucket", &self.bitbucket.is_some())
            .field("azure_devops", &self.azure_devops.is_some())
            .field("dispatch", &self.dispatch)
            .finish_non_exhaustive()
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_vars(|name| env::var(name).ok())
    }

    /// Build the configuration from a variable lookup.
    pub fn from_vars(var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |name: &str| parse_optional_string(var(name));

        let port = parse_or(&var, "PORT", 3000u16)?;
        let state_dir = get("STATE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));
        let workspace_dir = get("WORKSPACE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("./workspace"));

        let github = match (get("GITHUB_APP_ID"), get("GITHUB_PRIVATE_KEY")) {
            (Some(app_id), Some(private_key)) => Some(GitHubAppConfig {
                app_id: app_id
                    .parse::<u64>()
                    .context("GITHUB_APP_ID must be a valid number")?,
                private_key: private_key.replace("\\n", "\n"),
            }),
            (None, None) => None,
            _ => bail!("GITHUB_APP_ID and GITHUB_PRIVATE_KEY must be set together"),
        };

        let bitbucket = match (get("BITBUCKET_USERNAME"), get("BITBUCKET_APP_PASSWORD")) {
            (Some(username), Some(app_password)) => Some(BitbucketConfig {
                username,
                app_password,
            }),
            (None, None) => None,
            _ => bail!("BITBUCKET_USERNAME and BITBUCKET_APP_PASSWORD must be set together"),
        };

        let azure_devops = match (get("AZURE_DEVOPS_ORGANIZATION"), get("AZURE_DEVOPS_PAT")) {
            (Some(organization), Some(pat)) => Some(AzureDevOpsConfig { organization, pat }),
            (None, None) => None,
            _ => bail!("AZURE_DEVOPS_ORGANIZATION and AZURE_DEVOPS_PAT must be set together"),
        };

        let defaults = DispatchConfig::default();
        let default_thresholds = TierThresholds::default();
        let thresholds = TierThresholds {
            small: parse_or(&var, "QUEUE_SMALL_MAX_LINES", default_thresholds.small)?,
            medium: parse_or(&var, "QUEUE_MEDIUM_MAX_LINES", default_thresholds.medium)?,
            large: parse_or(&var, "QUEUE_LARGE_MAX_LINES", default_thresholds.large)?,
        };
        if !thresholds.is_ascending() {
            bail!(
                "queue tier thresholds must be ascending (small {} <= medium {} <= large {})",
                thresholds.small,
                thresholds.medium,
                thresholds.large
            );
        }

        let poll_interval = parse_secs(&var, "ANALYSIS_POLL_INTERVAL_SECS", defaults.poll_interval)?;
        let soft_timeout = parse_secs(&var, "ANALYSIS_SOFT_TIMEOUT_SECS", defaults.soft_timeout)?;
        let hard_timeout = parse_secs(&var, "ANALYSIS_HARD_TIMEOUT_SECS", defaults.hard_timeout)?;
        if poll_interval.is_zero() {
            bail!("ANALYSIS_POLL_INTERVAL_SECS must be greater than zero");
        }
        if soft_timeout > hard_timeout {
            bail!("ANALYSIS_SOFT_TIMEOUT_SECS must not exceed ANALYSIS_HARD_TIMEOUT_SECS");
        }

        let dispatch = DispatchConfig {
            queues: QueueEndpoints {
                small: get("QUEUE_SMALL_URL"),
                medium: get("QUEUE_MEDIUM_URL"),
                large: get("QUEUE_LARGE_URL"),
            },
            thresholds,
            poll_interval,
            soft_timeout,
            hard_timeout,
            analyzer_path: get("ANALYZER_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.analyzer_path),
            debug: parse_flag(&var, "AIGATE_DEBUG")?,
            test_mode: parse_flag(&var, "AIGATE_TEST_MODE")?,
        };

        let queue_defaults = QueueClientConfig::default();
        let queue_client = QueueClientConfig {
            request_timeout: parse_secs(
                &var,
                "QUEUE_REQUEST_TIMEOUT_SECS",
                queue_defaults.request_timeout,
            )?,
            max_retries: parse_or(&var, "QUEUE_MAX_RETRIES", queue_defaults.max_retries)?,
            retry_backoff: queue_defaults.retry_backoff,
        };

        let import_defaults = ImportConfig::default();
        let import = ImportConfig {
            max_attempts: parse_or(&var, "IMPORT_MAX_ATTEMPTS", import_defaults.max_attempts)?,
            retry_delay: Duration::from_millis(parse_or(
                &var,
                "IMPORT_RETRY_DELAY_MS",
                import_defaults.retry_delay.as_millis() as u64,
            )?),
        };
        if import.max_attempts == 0 {
            bail!("IMPORT_MAX_ATTEMPTS must be at least 1");
        }

        Ok(Config {
            port,
            state_dir,
            workspace_dir,
            github_webhook_secret: get("GITHUB_WEBHOOK_SECRET"),
            rerun_auth_token: get("RERUN_AUTH_TOKEN"),
            github,
            bitbucket,
            azure_devops,
            details_base_url: get("DETAILS_BASE_URL"),
            dispatch,
            queue_client,
            import,
        })
    }

    pub fn database_path(&self) -> PathBuf {
        self.state_dir.join("aigate-state.db")
    }
}

/// Treat missing, empty and whitespace-only values as unset.
pub fn parse_optional_string(value: Option<String>) -> Option<String> {
    value.filter(|s| !s.trim().is_empty())
}

fn parse_or<T>(var: &impl Fn(&str) -> Option<String>, name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match parse_optional_string(var(name)) {
        Some(value) => value
            .trim()
            .parse::<T>()
            .map_err(|e| anyhow!("{} must be a valid number: {}", name, e)),
        None => Ok(default),
    }
}

fn parse_secs(
    var: &impl Fn(&str) -> Option<String>,
    name: &str,
    default: Duration,
) -> Result<Duration> {
    parse_or(var, name, default.as_secs()).map(Duration::from_secs)
}

fn parse_flag(var: &impl Fn(&str) -> Option<String>, name: &str) -> Result<bool> {
    match parse_optional_string(var(name)).as_deref().map(str::trim) {
        None => Ok(false),
        Some("1") | Some("true") | Some("yes") => Ok(true),
        Some("0") | Some("false") | Some("no") => Ok(false),
        Some(other) => bail!("{} must be a boolean, got {:?}", name, other),
    }
}
