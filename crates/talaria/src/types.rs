//! Domain types shared across the update engine.
//!
//! The version lattice lives here: [`SemanticVersion`] with its precision
//! rules and [`SemanticVersion::compare`], the [`BumpSize`] ceiling, and the
//! parsed image-reference structures produced by [`crate::image`].

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// How many components a semantic version carries.
///
/// A two-component version and a three-component version are never
/// comparable; [`SemanticVersion::compare`] reports the mismatch instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VersionPrecision {
    Major,
    Minor,
    Patch,
}

/// The largest allowed magnitude of version change for a target.
///
/// Ordered: `Digest < Patch < Minor < Major`. Used both as the policy
/// ceiling on a target and as the reported magnitude of a found upgrade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BumpSize {
    Digest,
    Patch,
    Minor,
    Major,
}

/// Result of comparing two semantic versions of equal precision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionDelta {
    Equal,
    Patch,
    Minor,
    Major,
    Downgrade,
    PrecisionMismatch,
}

/// A parsed `[v]major[.minor[.patch]]` tag body.
///
/// Invariant: `patch` is only present when `minor` is (enforced by the
/// grammar, which nests the capture groups).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SemanticVersion {
    pub major: u64,
    pub minor: Option<u64>,
    pub patch: Option<u64>,
    /// Optional version prefix (`v`). Opaque for ordering; the updater uses
    /// it only as an equality filter.
    pub version_prefix: Option<String>,
}

impl SemanticVersion {
    pub fn precision(&self) -> VersionPrecision {
        match (self.minor, self.patch) {
            (Some(_), Some(_)) => VersionPrecision::Patch,
            (Some(_), None) => VersionPrecision::Minor,
            _ => VersionPrecision::Major,
        }
    }

    /// Compare `from` against `to`, reporting the magnitude of the step.
    ///
    /// Versions of different precision are never comparable. Otherwise the
    /// components are compared major-first; a strictly greater component
    /// reports that level, a strictly lesser one reports a downgrade.
    pub fn compare(from: &SemanticVersion, to: &SemanticVersion) -> VersionDelta {
        if from.precision() != to.precision() {
            return VersionDelta::PrecisionMismatch;
        }
        if to.major > from.major {
            return VersionDelta::Major;
        }
        if to.major < from.major {
            return VersionDelta::Downgrade;
        }
        match (from.minor, to.minor) {
            (Some(f), Some(t)) if t > f => return VersionDelta::Minor,
            (Some(f), Some(t)) if t < f => return VersionDelta::Downgrade,
            _ => {}
        }
        match (from.patch, to.patch) {
            (Some(f), Some(t)) if t > f => VersionDelta::Patch,
            (Some(f), Some(t)) if t < f => VersionDelta::Downgrade,
            _ => VersionDelta::Equal,
        }
    }
}

impl fmt::Display for SemanticVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(prefix) = &self.version_prefix {
            write!(f, "{prefix}")?;
        }
        write!(f, "{}", self.major)?;
        if let Some(minor) = self.minor {
            write!(f, ".{minor}")?;
            if let Some(patch) = self.patch {
                write!(f, ".{patch}")?;
            }
        }
        Ok(())
    }
}

/// The version half of a tag: either a semantic version or a release name
/// from the configured allow-list (`latest`, `stable`, ...).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TagVersion {
    Semantic(SemanticVersion),
    Release(String),
}

impl fmt::Display for TagVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TagVersion::Semantic(v) => write!(f, "{v}"),
            TagVersion::Release(r) => write!(f, "{r}"),
        }
    }
}

/// A parsed tag: a version plus an optional `-variant` suffix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedTag {
    pub version: TagVersion,
    pub variant: Option<String>,
}

impl fmt::Display for ParsedTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.version)?;
        if let Some(variant) = &self.variant {
            write!(f, "-{variant}")?;
        }
        Ok(())
    }
}

/// A tag with an optional pinned digest (`sha<N>:<hex>`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedTagAndDigest {
    pub tag: ParsedTag,
    pub digest: Option<String>,
}

impl ParsedTagAndDigest {
    /// Human-facing rendering with the digest body truncated to 8 hex chars.
    pub fn to_short_string(&self) -> String {
        match &self.digest {
            None => self.tag.to_string(),
            Some(digest) => {
                let body = digest.strip_prefix("sha256:").unwrap_or(digest);
                let short: String = body.chars().take(8).collect();
                format!("{}@{}", self.tag, short)
            }
        }
    }
}

impl fmt::Display for ParsedTagAndDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.tag)?;
        if let Some(digest) = &self.digest {
            write!(f, "@{digest}")?;
        }
        Ok(())
    }
}

/// A fully parsed image reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedImage {
    pub name: String,
    /// The reference without tag or digest, exactly as written
    /// (`docker.io/library/alpine`, `grafana/grafana`, `alpine`). This is
    /// what the registry probe is handed.
    pub untagged: String,
    pub domain: Option<String>,
    pub namespace: Option<String>,
    pub tag_and_digest: Option<ParsedTagAndDigest>,
}

impl ParsedImage {
    pub fn to_short_string(&self) -> String {
        match &self.tag_and_digest {
            Some(td) => format!("{}:{}", self.name, td.to_short_string()),
            None => self.name.clone(),
        }
    }

    /// One commit-body line describing an update, e.g.
    /// `nginx: 1.25.2 → 1.25.3@abcdef01`.
    pub fn diff_string(source: &ParsedImage, destination: Option<&ParsedTagAndDigest>) -> String {
        let left = source
            .tag_and_digest
            .as_ref()
            .map(ParsedTagAndDigest::to_short_string)
            .unwrap_or_else(|| "(untagged)".to_string());
        let right = destination
            .map(ParsedTagAndDigest::to_short_string)
            .unwrap_or_else(|| "(untagged)".to_string());
        format!("{}: {left} → {right}", source.name)
    }
}

impl fmt::Display for ParsedImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts: Vec<&str> = Vec::new();
        if let Some(domain) = &self.domain {
            parts.push(domain);
        }
        if let Some(namespace) = &self.namespace {
            parts.push(namespace);
        }
        parts.push(&self.name);
        write!(f, "{}", parts.join("/"))?;
        if let Some(td) = &self.tag_and_digest {
            write!(f, ":{td}")?;
        }
        Ok(())
    }
}

/// One update target extracted from a compose file. Never mutated after
/// extraction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DockerComposeTarget {
    pub file_path: std::path::PathBuf,
    pub service_key: String,
    /// 0-based index of the `image:` line within the file.
    pub line: usize,
    pub current_image_string: String,
    pub bump: BumpSize,
    pub skip: bool,
}

impl fmt::Display for DockerComposeTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "DockerCompose:{}:{}",
            self.file_path.display(),
            self.service_key
        )
    }
}

/// Outcome of the CI pipeline attached to a pushed commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStatus {
    Unknown,
    Success,
    Failure,
}

/// Durable record of a pushed update commit.
///
/// Created with [`PipelineStatus::Unknown`] when a push completes; advanced
/// to success/failure by the webhook reconciler. Persists forever.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitInfo {
    pub commit_hash: String,
    pub commit_short_hash: String,
    pub commit_url: Option<String>,
    pub commit_timestamp: DateTime<Utc>,
    pub pipeline_url: Option<String>,
    pub pipeline_status: PipelineStatus,
    pub pipeline_timestamp: Option<DateTime<Utc>>,
    /// Pipeline wall-clock duration in seconds, as reported by the webhook.
    pub pipeline_duration: Option<f64>,
}
