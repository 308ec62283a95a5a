//! The scan scheduler and bounded update pipeline.
//!
//! One cooperatively scheduled loop owns the working tree. Each scan
//! re-clones the tracked repository, fans the discovered targets out over
//! the registry (interleaved at every subprocess await point), truncates the
//! results to the per-commit cap, rewrites the matched lines, and pushes a
//! single commit. Per-target failures never abort a scan; per-scan failures
//! never wedge the loop.

use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use futures::future::join_all;
use log::{debug, error, info, warn};
use tokio::sync::mpsc;

use crate::compose;
use crate::config::Config;
use crate::events::{Broadcaster, ScanEvent};
use crate::git::GitRepo;
use crate::image::ImageParser;
use crate::skopeo::Skopeo;
use crate::store::Store;
use crate::types::{
    CommitInfo, DockerComposeTarget, ParsedImage, ParsedTagAndDigest, PipelineStatus,
};
use crate::updater::{Updater, is_upgrade};

/// Sentinel accepted on the signal channel to trigger an immediate scan.
pub const SCAN_NOW: &str = "scan_now";

/// Title of every update commit.
pub const COMMIT_TITLE: &str = "[talaria] Updating images";

struct PlannedUpdate {
    target: DockerComposeTarget,
    current: ParsedImage,
    desired: ParsedImage,
}

/// The scan orchestrator.
pub struct Scanner {
    config: Arc<Config>,
    store: Arc<Store>,
    parser: Arc<ImageParser>,
    updater: Updater,
    events: Broadcaster,
}

impl Scanner {
    pub fn new(config: Arc<Config>, store: Arc<Store>, events: Broadcaster) -> Result<Self> {
        let parser = Arc::new(ImageParser::new(&config.valid_releases)?);
        let skopeo = Arc::new(Skopeo::new(&config, Arc::clone(&store)));
        let updater = Updater::new(skopeo, Arc::clone(&parser));
        Ok(Self {
            config,
            store,
            parser,
            updater,
            events,
        })
    }

    /// Scheduler loop. Runs for the life of the process and returns only
    /// once every signal sender has been dropped.
    pub async fn run(self, mut signals: mpsc::Receiver<String>) -> Result<()> {
        loop {
            let next_run = match self.store.next_run_at() {
                Ok(at) => at,
                Err(err) => {
                    error!("failed to read next run time: {err:#}");
                    None
                }
            };

            let now = Utc::now();
            let Some(next_run) = next_run.filter(|at| *at > now) else {
                info!("scheduled time reached or not set, running scan");
                self.scan_and_reschedule().await;
                continue;
            };

            let wait = (next_run - now).to_std().unwrap_or_default();
            match tokio::time::timeout(wait, signals.recv()).await {
                Ok(Some(signal)) if signal == SCAN_NOW => {
                    info!("immediate scan requested");
                    self.scan_and_reschedule().await;
                }
                Ok(Some(signal)) => warn!("ignoring unknown scheduler signal {signal:?}"),
                Ok(None) => {
                    info!("signal channel closed, stopping scheduler");
                    return Ok(());
                }
                Err(_elapsed) => {
                    info!("scheduled scan triggered by timeout");
                    self.scan_and_reschedule().await;
                }
            }
        }
    }

    /// Run one scan and advance the schedule afterwards, whatever the
    /// outcome, so a broken scan cannot wedge the loop.
    pub async fn scan_and_reschedule(&self) {
        if let Err(err) = self.run_scan().await {
            error!("scan failed: {err:#}");
            self.events.publish(ScanEvent::ScanFailed {
                message: format!("{err:#}"),
            });
        }

        let delay = chrono::Duration::from_std(self.config.update_delay)
            .unwrap_or_else(|_| chrono::Duration::days(365));
        if let Err(err) = self.store.set_next_run_at(Some(Utc::now() + delay)) {
            error!("failed to persist next run time: {err:#}");
            tokio::time::sleep(self.config.update_delay).await;
        }
    }

    /// One full scan: clone, discover, probe, edit, commit, push.
    pub async fn run_scan(&self) -> Result<()> {
        info!("running scan");
        self.events.publish(ScanEvent::ScanStarted);

        match self.store.cleanup_expired_cache() {
            Ok(0) => {}
            Ok(removed) => debug!("dropped {removed} expired cache entries"),
            Err(err) => warn!("cache cleanup failed: {err:#}"),
        }

        let repo = GitRepo::new(&self.config);
        repo.delete()?;
        repo.clone().await?;
        repo.configure_identity().await?;

        let files = compose::find_compose_files(
            &self.config.git_repo_path,
            &self.config.compose_file_pattern,
        )?;
        info!("found {} compose files", files.len());

        let mut targets = Vec::new();
        for file in &files {
            let scan = compose::extract_targets(file, self.config.legacy_aliases_enabled)?;
            for error in &scan.errors {
                warn!(
                    "unable to parse compose file image in {}: {error}",
                    file.display()
                );
            }
            for target in scan.targets {
                if target.skip {
                    info!("skipping image {} due to configured skip", target.service_key);
                    self.events.publish(ScanEvent::TargetSkipped {
                        service: target.service_key.clone(),
                    });
                } else {
                    targets.push(target);
                }
            }
        }

        let results = join_all(targets.iter().map(|t| self.update_target(t))).await;
        let mut updates: Vec<PlannedUpdate> = results.into_iter().flatten().collect();

        info!(
            "found {} updates, taking the first {}",
            updates.len(),
            self.config.max_concurrent_pushes
        );
        updates.truncate(self.config.max_concurrent_pushes);

        if !updates.is_empty() {
            info!("applying changes to git repo");
            let mut changes = Vec::with_capacity(updates.len());
            for update in &updates {
                compose::apply_update(&update.target, &update.desired.to_string())?;
                changes.push(ParsedImage::diff_string(
                    &update.current,
                    update.desired.tag_and_digest.as_ref(),
                ));
            }

            repo.add_all().await?;
            repo.commit(COMMIT_TITLE, Some(&changes.join("\n"))).await?;
            repo.push().await?;

            let commit_hash = repo.head_commit().await?;
            let commit_short_hash = repo.head_commit_short().await?;
            self.store.put_commit(&CommitInfo {
                commit_hash: commit_hash.clone(),
                commit_short_hash,
                commit_url: None,
                commit_timestamp: Utc::now(),
                pipeline_url: None,
                pipeline_status: PipelineStatus::Unknown,
                pipeline_timestamp: None,
                pipeline_duration: None,
            })?;
            self.events.publish(ScanEvent::CommitPushed {
                commit_hash,
                update_count: updates.len(),
            });
        }

        self.events.publish(ScanEvent::ScanCompleted {
            update_count: updates.len(),
        });
        info!("scan complete");
        Ok(())
    }

    /// One per-target update job. Failures are logged and isolated so the
    /// other targets proceed.
    async fn update_target(&self, target: &DockerComposeTarget) -> Option<PlannedUpdate> {
        match self.try_update_target(target).await {
            Ok(update) => update,
            Err(err) => {
                warn!("update check for {target} failed: {err:#}");
                None
            }
        }
    }

    async fn try_update_target(
        &self,
        target: &DockerComposeTarget,
    ) -> Result<Option<PlannedUpdate>> {
        // No default-domain injection here: the rewritten line must keep the
        // reference shape the file already used.
        let Some(current) = self.parser.try_parse(&target.current_image_string, false) else {
            warn!("failed to parse image {}", target.current_image_string);
            return Ok(None);
        };

        info!("checking for updates for {current}");
        let candidates = self
            .updater
            .sorted_candidate_tags(&current, target.bump)
            .await?;
        debug!(
            "found {} candidate tags for {current} with bump size {:?}",
            candidates.len(),
            target.bump
        );
        let Some(desired_tag) = candidates.into_iter().next() else {
            return Ok(None);
        };

        debug!("using desired tag {desired_tag} for {current}");
        let (digest, _created) = self.updater.digest_for(&current, &desired_tag).await?;
        if is_upgrade(current.tag_and_digest.as_ref(), &desired_tag, &digest)?.is_none() {
            debug!("desired tag {desired_tag} with digest {digest} for {current} is not an upgrade");
            return Ok(None);
        }

        let desired = ParsedImage {
            tag_and_digest: Some(ParsedTagAndDigest {
                tag: desired_tag,
                digest: Some(digest),
            }),
            ..current.clone()
        };
        let change = ParsedImage::diff_string(&current, desired.tag_and_digest.as_ref());
        info!("found upgrade {change}");
        self.events.publish(ScanEvent::UpdateFound {
            service: target.service_key.clone(),
            change,
        });

        Ok(Some(PlannedUpdate {
            target: target.clone(),
            current,
            desired,
        }))
    }
}
