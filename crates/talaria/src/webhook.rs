//! Pipeline-webhook reconciliation.
//!
//! The presentation layer authenticates and deserializes the HTTP request;
//! this module only advances stored [`crate::types::CommitInfo`] rows from
//! pipeline events. Everything that does not clearly describe a finished
//! top-level pipeline for a known commit is ignored.

use anyhow::Result;
use chrono::Utc;
use log::debug;
use serde::Deserialize;

use crate::store::Store;
use crate::types::PipelineStatus;

/// The only `X-Gitlab-Event` value the reconciler acts on.
pub const PIPELINE_EVENT: &str = "pipeline hook";

/// Pipeline event payload, reduced to the fields the reconciler reads.
/// Unknown fields are ignored wholesale.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PipelineEvent {
    #[serde(default)]
    pub object_attributes: PipelineAttributes,
    #[serde(default)]
    pub commit: CommitAttributes,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PipelineAttributes {
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub sha: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    /// Pipeline duration in seconds.
    #[serde(default)]
    pub duration: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CommitAttributes {
    #[serde(default)]
    pub url: Option<String>,
}

/// Absorb one pipeline event. Returns whether a stored commit was updated.
pub fn handle_deployment_webhook(
    store: &Store,
    event: Option<&str>,
    payload: &PipelineEvent,
) -> Result<bool> {
    if !event.is_some_and(|e| e.eq_ignore_ascii_case(PIPELINE_EVENT)) {
        return Ok(false);
    }

    let attributes = &payload.object_attributes;

    // Child pipelines report the same sha as their parent; only the
    // top-level pipeline outcome counts.
    if attributes.source.as_deref() == Some("parent_pipeline") {
        return Ok(false);
    }

    let status = match attributes.status.as_deref() {
        Some("success") => PipelineStatus::Success,
        Some("failed") => PipelineStatus::Failure,
        _ => return Ok(false),
    };

    let Some(sha) = attributes.sha.as_deref() else {
        return Ok(false);
    };
    let Some(mut commit) = store.get_commit(sha)? else {
        debug!("ignoring pipeline event for unknown commit {sha}");
        return Ok(false);
    };

    commit.pipeline_status = status;
    commit.commit_url = payload.commit.url.clone();
    commit.pipeline_url = attributes.url.clone();
    commit.pipeline_timestamp = Some(Utc::now());
    commit.pipeline_duration = attributes.duration;
    store.put_commit(&commit)?;
    debug!("recorded pipeline {status:?} for commit {sha}");
    Ok(true)
}
