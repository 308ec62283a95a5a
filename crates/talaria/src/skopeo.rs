//! Registry probing via the `skopeo` binary, with a persistent cache.
//!
//! Both operations shell out to the probe and parse its JSON. Successful
//! payloads are cached in the store under a stable hash of the command, with
//! a variance-jittered expiration so entries populated in the same scan do
//! not all expire in the same instant.

use std::env;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use chrono::{DateTime, Utc};
use log::{debug, info};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::process::Command;

use crate::config::Config;
use crate::image::DEFAULT_DOMAIN;
use crate::store::Store;

/// A failed or unparsable probe invocation.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("skopeo {command} exited with status {status}: {stderr}")]
    Probe {
        command: String,
        status: i32,
        stderr: String,
    },
    #[error("malformed skopeo output for {command}: {message}")]
    Malformed { command: String, message: String },
}

/// Subset of `skopeo inspect` output the engine cares about.
#[derive(Debug, Clone, Deserialize)]
pub struct SkopeoInspectResponse {
    #[serde(rename = "Name", default)]
    pub name: String,
    #[serde(rename = "Digest")]
    pub digest: String,
    #[serde(rename = "Created")]
    pub created: DateTime<Utc>,
    #[serde(rename = "Architecture", default)]
    pub architecture: String,
    #[serde(rename = "Os", default)]
    pub os: String,
    #[serde(rename = "Layers", default)]
    pub layers: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ListTagsResponse {
    #[serde(rename = "Tags", default)]
    tags: Vec<String>,
}

/// Registry probe client. Cheap to share behind an `Arc`.
pub struct Skopeo {
    store: Arc<Store>,
    cache_duration: Duration,
    cache_variance: f64,
    auth_file: Option<PathBuf>,
}

impl Skopeo {
    pub fn new(config: &Config, store: Arc<Store>) -> Self {
        let auth_file = (config.docker_username.is_some() && config.docker_password.is_some())
            .then(|| config.docker_auth_file.clone());
        Self {
            store,
            cache_duration: config.skopeo_cache_duration,
            cache_variance: config.skopeo_cache_variance,
            auth_file,
        }
    }

    /// List the tags the registry knows for an untagged reference, in the
    /// registry's own order.
    pub async fn list_tags(&self, image: &str) -> Result<Vec<String>> {
        let args = ["list-tags".to_string(), format!("docker://{image}")];
        let payload = self.run(&args).await?;
        let parsed: ListTagsResponse =
            serde_json::from_str(&payload).map_err(|e| RegistryError::Malformed {
                command: args.join(" "),
                message: e.to_string(),
            })?;
        debug!("found {} tags for {image}", parsed.tags.len());
        Ok(parsed.tags)
    }

    /// Inspect a full reference, returning at least its digest and creation
    /// timestamp.
    pub async fn inspect(&self, image: &str) -> Result<SkopeoInspectResponse> {
        let args = ["inspect".to_string(), format!("docker://{image}")];
        let payload = self.run(&args).await?;
        let parsed: SkopeoInspectResponse =
            serde_json::from_str(&payload).map_err(|e| RegistryError::Malformed {
                command: args.join(" "),
                message: e.to_string(),
            })?;
        debug!("inspected {image}: digest {}", parsed.digest);
        Ok(parsed)
    }

    async fn run(&self, args: &[String]) -> Result<String> {
        let key = cache_key(args);
        if let Some(hit) = self.store.cache_get(&key, self.cache_duration)? {
            debug!("using cached result for skopeo {}", args.join(" "));
            return Ok(hit);
        }

        let mut command = Command::new(skopeo_program());
        command.args(args).stdin(Stdio::null());
        if let Some(auth_file) = &self.auth_file {
            if auth_file.exists() {
                command.arg("--authfile").arg(auth_file);
            }
        }

        debug!("running skopeo {}", args.join(" "));
        let output = command
            .output()
            .await
            .with_context(|| format!("failed to run skopeo {}", args.join(" ")))?;
        if !output.status.success() {
            return Err(RegistryError::Probe {
                command: args.join(" "),
                status: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            }
            .into());
        }

        let payload = String::from_utf8_lossy(&output.stdout).trim().to_string();
        let jitter = 1.0 + (rand::random::<f64>() * 2.0 * self.cache_variance - self.cache_variance);
        let expires_at = Utc::now()
            + chrono::Duration::from_std(self.cache_duration.mul_f64(jitter.max(0.0)))
                .context("cache duration out of range")?;
        self.store.cache_set(&key, &payload, expires_at)?;
        Ok(payload)
    }
}

/// Stable hash of a probe command. `:` inside arguments is escaped before
/// joining on `:` so `["a:b"]` and `["a", "b"]` can never collide.
fn cache_key(args: &[String]) -> String {
    let joined = args
        .iter()
        .map(|a| a.replace(':', "::"))
        .collect::<Vec<_>>()
        .join(":");
    format!("{:x}", Sha256::digest(joined.as_bytes()))
}

fn skopeo_program() -> String {
    env::var("TALARIA_SKOPEO_BIN").unwrap_or_else(|_| "skopeo".to_string())
}

/// Materialize the registry auth file for the default registry, if
/// credentials are configured. Returns the path written, mode 0600.
pub fn write_auth_file(config: &Config) -> Result<Option<PathBuf>> {
    let (Some(username), Some(password)) = (&config.docker_username, &config.docker_password)
    else {
        return Ok(None);
    };

    let auth = BASE64.encode(format!("{username}:{password}"));
    let payload = serde_json::json!({ "auths": { (DEFAULT_DOMAIN): { "auth": auth } } });

    let path = &config.docker_auth_file;
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("failed to create auth file directory {}", parent.display())
            })?;
        }
    }
    std::fs::write(path, serde_json::to_vec(&payload)?)
        .with_context(|| format!("failed to write auth file {}", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
            .with_context(|| format!("failed to restrict auth file {}", path.display()))?;
    }

    info!("registry authentication configured at {}", path.display());
    Ok(Some(path.clone()))
}
