//! Environment-driven configuration.
//!
//! Every knob lives in a `TL_*` environment variable; only the repository
//! URL and auth token are required. Timespans use humantime's `1d12h30m`
//! style. A missing or unparsable value is a [`ConfigError`], which the CLI
//! turns into a non-zero exit.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    MissingVar(&'static str),
    #[error("invalid value {value:?} for {var}: {reason}")]
    InvalidValue {
        var: &'static str,
        value: String,
        reason: String,
    },
}

/// Fully resolved runtime configuration. Constructed once at startup and
/// passed explicitly to the scheduler and the presentation layer.
#[derive(Debug, Clone)]
pub struct Config {
    pub is_development: bool,
    pub log_level: String,
    pub server_port: u16,
    pub db_path: PathBuf,
    pub webhook_api_key: String,
    pub update_delay: Duration,

    pub git_repo_url: String,
    pub git_branch: String,
    pub git_auth_token: String,
    pub git_repo_path: PathBuf,
    pub git_user_name: String,
    pub git_user_email: String,

    pub compose_file_pattern: String,
    pub valid_releases: Vec<String>,
    pub legacy_aliases_enabled: bool,
    pub max_concurrent_pushes: usize,

    pub skopeo_cache_duration: Duration,
    pub skopeo_cache_variance: f64,
    pub docker_username: Option<String>,
    pub docker_password: Option<String>,
    pub docker_auth_file: PathBuf,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let environment = var_or("TL_ENVIRONMENT", "prod");
        Ok(Self {
            is_development: matches!(environment.as_str(), "dev" | "development"),
            log_level: var_or("TL_LOG_LEVEL", "info"),
            server_port: parse_var("TL_SERVER_PORT", "5001")?,
            db_path: PathBuf::from(var_or("TL_DB_PATH", "/data/talaria.db")),
            webhook_api_key: var_or("TL_WEBHOOK_API_KEY", "57d88647-208e-4ee1-88fc-365836f95ee4"),
            update_delay: parse_timespan("TL_UPDATE_DELAY", "1d")?,

            git_repo_url: required_var("TL_GIT_REPO_URL")?,
            git_branch: var_or("TL_GIT_BRANCH", "main"),
            git_auth_token: required_var("TL_GIT_AUTH_TOKEN")?,
            git_repo_path: PathBuf::from(var_or("TL_GIT_REPO_PATH", "/data/repository")),
            git_user_name: var_or("TL_GIT_USER_NAME", "talaria"),
            git_user_email: var_or("TL_GIT_USER_EMAIL", "talaria@localhost"),

            compose_file_pattern: var_or("TL_DOCKER_COMPOSE_FILE_PATTERN", "docker-compose*.y*ml"),
            valid_releases: var_or("TL_VALID_RELEASES", "latest|stable|mainline|develop")
                .split('|')
                .filter(|r| !r.is_empty())
                .map(str::to_string)
                .collect(),
            legacy_aliases_enabled: parse_bool(&var_or("TL_TALOS_SHORT_FORM_COMPAT", "false")),
            max_concurrent_pushes: parse_var("TL_MAX_CONCURRENT_PUSHES", "5")?,

            skopeo_cache_duration: parse_timespan("TL_SKOPEO_CACHE_DURATION", "12h")?,
            skopeo_cache_variance: parse_var("TL_SKOPEO_CACHE_VARIANCE", "0.1")?,
            docker_username: env::var("TL_DOCKER_USERNAME").ok().filter(|v| !v.is_empty()),
            docker_password: env::var("TL_DOCKER_PASSWORD").ok().filter(|v| !v.is_empty()),
            docker_auth_file: PathBuf::from(var_or("TL_DOCKER_AUTH_FILE", "/data/skopeo-auth.json")),
        })
    }

    #[cfg(test)]
    pub(crate) fn for_tests(dir: &std::path::Path) -> Self {
        Self {
            is_development: true,
            log_level: "debug".to_string(),
            server_port: 5001,
            db_path: dir.join("talaria.db"),
            webhook_api_key: "test-key".to_string(),
            update_delay: Duration::from_secs(86400),
            git_repo_url: "https://gitlab.example.com/acme/deploy.git".to_string(),
            git_branch: "main".to_string(),
            git_auth_token: "token".to_string(),
            git_repo_path: dir.join("repository"),
            git_user_name: "talaria".to_string(),
            git_user_email: "talaria@localhost".to_string(),
            compose_file_pattern: "docker-compose*.y*ml".to_string(),
            valid_releases: ["latest", "stable", "mainline", "develop"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            legacy_aliases_enabled: false,
            max_concurrent_pushes: 5,
            skopeo_cache_duration: Duration::from_secs(12 * 3600),
            skopeo_cache_variance: 0.0,
            docker_username: None,
            docker_password: None,
            docker_auth_file: dir.join("skopeo-auth.json"),
        }
    }
}

fn var_or(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

fn required_var(name: &'static str) -> Result<String, ConfigError> {
    env::var(name)
        .ok()
        .filter(|v| !v.is_empty())
        .ok_or(ConfigError::MissingVar(name))
}

fn parse_var<T: std::str::FromStr>(name: &'static str, default: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    let value = var_or(name, default);
    value.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
        var: name,
        value,
        reason: e.to_string(),
    })
}

fn parse_timespan(name: &'static str, default: &str) -> Result<Duration, ConfigError> {
    let value = var_or(name, default);
    humantime::parse_duration(&value).map_err(|e| ConfigError::InvalidValue {
        var: name,
        value,
        reason: e.to_string(),
    })
}

/// `true`/`1` (or any non-zero integer) are truthy; everything else is not.
fn parse_bool(value: &str) -> bool {
    let value = value.to_lowercase();
    value == "true" || value.parse::<i64>().map(|n| n != 0).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    const REQUIRED: [(&str, Option<&str>); 2] = [
        ("TL_GIT_REPO_URL", Some("https://gitlab.example.com/a/b.git")),
        ("TL_GIT_AUTH_TOKEN", Some("token")),
    ];

    #[test]
    fn defaults_apply_when_only_required_vars_are_set() {
        temp_env::with_vars(REQUIRED, || {
            let config = Config::from_env().expect("config");
            assert!(!config.is_development);
            assert_eq!(config.server_port, 5001);
            assert_eq!(config.git_branch, "main");
            assert_eq!(config.update_delay, Duration::from_secs(86400));
            assert_eq!(config.skopeo_cache_duration, Duration::from_secs(12 * 3600));
            assert_eq!(config.skopeo_cache_variance, 0.1);
            assert_eq!(config.max_concurrent_pushes, 5);
            assert_eq!(config.compose_file_pattern, "docker-compose*.y*ml");
            assert_eq!(
                config.valid_releases,
                vec!["latest", "stable", "mainline", "develop"]
            );
            assert!(!config.legacy_aliases_enabled);
        });
    }

    #[test]
    fn missing_repo_url_is_a_config_error() {
        temp_env::with_vars(
            [
                ("TL_GIT_REPO_URL", None),
                ("TL_GIT_AUTH_TOKEN", Some("token")),
            ],
            || {
                let err = Config::from_env().expect_err("must fail");
                assert!(matches!(err, ConfigError::MissingVar("TL_GIT_REPO_URL")));
            },
        );
    }

    #[test]
    fn timespans_parse_compound_values() {
        temp_env::with_vars(
            [
                REQUIRED[0],
                REQUIRED[1],
                ("TL_UPDATE_DELAY", Some("1d2h3m4s")),
            ],
            || {
                let config = Config::from_env().expect("config");
                assert_eq!(
                    config.update_delay,
                    Duration::from_secs(86400 + 2 * 3600 + 3 * 60 + 4)
                );
            },
        );
    }

    #[test]
    fn invalid_timespan_is_a_config_error() {
        temp_env::with_vars(
            [REQUIRED[0], REQUIRED[1], ("TL_UPDATE_DELAY", Some("soon"))],
            || {
                let err = Config::from_env().expect_err("must fail");
                assert!(matches!(
                    err,
                    ConfigError::InvalidValue {
                        var: "TL_UPDATE_DELAY",
                        ..
                    }
                ));
            },
        );
    }

    #[test]
    fn development_environment_is_detected() {
        temp_env::with_vars(
            [REQUIRED[0], REQUIRED[1], ("TL_ENVIRONMENT", Some("dev"))],
            || {
                assert!(Config::from_env().expect("config").is_development);
            },
        );
    }

    #[test]
    fn compatibility_flag_accepts_truthy_values() {
        for (value, expected) in [("true", true), ("1", true), ("7", true), ("0", false), ("no", false)] {
            temp_env::with_vars(
                [
                    REQUIRED[0],
                    REQUIRED[1],
                    ("TL_TALOS_SHORT_FORM_COMPAT", Some(value)),
                ],
                || {
                    assert_eq!(
                        Config::from_env().expect("config").legacy_aliases_enabled,
                        expected,
                        "value {value:?}"
                    );
                },
            );
        }
    }

    #[test]
    fn release_allow_list_splits_on_pipes() {
        temp_env::with_vars(
            [REQUIRED[0], REQUIRED[1], ("TL_VALID_RELEASES", Some("latest|edge"))],
            || {
                let config = Config::from_env().expect("config");
                assert_eq!(config.valid_releases, vec!["latest", "edge"]);
            },
        );
    }
}
