//! Candidate selection for image upgrades.
//!
//! Pure selection logic ([`select_candidates`], [`is_upgrade`]) plus the
//! [`Updater`] that feeds it from the registry probe.

use std::sync::Arc;

use anyhow::{Result, bail};
use chrono::{DateTime, Utc};

use crate::image::ImageParser;
use crate::skopeo::Skopeo;
use crate::types::{
    BumpSize, ParsedImage, ParsedTag, ParsedTagAndDigest, SemanticVersion, TagVersion,
    VersionDelta,
};

/// Release name assumed when the current reference has no tag at all.
const UNTAGGED_RELEASE: &str = "latest";

/// Registry-backed updater.
pub struct Updater {
    skopeo: Arc<Skopeo>,
    parser: Arc<ImageParser>,
}

impl Updater {
    pub fn new(skopeo: Arc<Skopeo>, parser: Arc<ImageParser>) -> Self {
        Self { skopeo, parser }
    }

    /// List the registry's tags for `image` and order the valid upgrades
    /// from most to least preferred under `max_bump`.
    pub async fn sorted_candidate_tags(
        &self,
        image: &ParsedImage,
        max_bump: BumpSize,
    ) -> Result<Vec<ParsedTag>> {
        let tags = self.skopeo.list_tags(&image.untagged).await?;
        let parsed: Vec<ParsedTag> = tags
            .iter()
            .filter_map(|t| self.parser.try_parse_tag(t))
            .collect();
        Ok(select_candidates(image, &parsed, max_bump))
    }

    /// Resolve the digest and creation timestamp for `image` at `tag`.
    pub async fn digest_for(
        &self,
        image: &ParsedImage,
        tag: &ParsedTag,
    ) -> Result<(String, DateTime<Utc>)> {
        let inspect = self
            .skopeo
            .inspect(&format!("{}:{tag}", image.untagged))
            .await?;
        Ok((inspect.digest, inspect.created))
    }
}

/// Order the parsed registry tags that are valid upgrades for `current`
/// under `max_bump`, most preferred first.
///
/// Registry order is preserved for the release-tag cases, so "pick the
/// first match" follows probe order. Semantic candidates must keep the
/// current precision, variant, and version prefix, and are sorted by
/// `(major, minor, patch)` descending with missing components low.
pub fn select_candidates(
    current: &ParsedImage,
    tags: &[ParsedTag],
    max_bump: BumpSize,
) -> Vec<ParsedTag> {
    let Some(current_td) = &current.tag_and_digest else {
        // Untagged references are promoted to a pinned `latest`.
        return tags
            .iter()
            .find(|t| {
                t.variant.is_none()
                    && t.version == TagVersion::Release(UNTAGGED_RELEASE.to_string())
            })
            .cloned()
            .into_iter()
            .collect();
    };

    match &current_td.tag.version {
        TagVersion::Release(release) => tags
            .iter()
            .find(|t| {
                t.variant == current_td.tag.variant
                    && t.version == TagVersion::Release(release.clone())
            })
            .cloned()
            .into_iter()
            .collect(),
        TagVersion::Semantic(active) => {
            let variant = &current_td.tag.variant;
            let mut versions: Vec<SemanticVersion> = tags
                .iter()
                .filter(|t| t.variant == *variant)
                .filter_map(|t| match &t.version {
                    TagVersion::Semantic(v) => Some(v),
                    TagVersion::Release(_) => None,
                })
                .filter(|v| v.version_prefix == active.version_prefix)
                .filter(|v| {
                    match SemanticVersion::compare(active, v) {
                        VersionDelta::Major => max_bump >= BumpSize::Major,
                        VersionDelta::Minor => max_bump >= BumpSize::Minor,
                        VersionDelta::Patch => max_bump >= BumpSize::Patch,
                        // An equal version can still be a digest-level move.
                        VersionDelta::Equal => true,
                        VersionDelta::Downgrade | VersionDelta::PrecisionMismatch => false,
                    }
                })
                .cloned()
                .collect();

            versions.sort_by_key(|v| {
                std::cmp::Reverse((
                    v.major,
                    v.minor.map_or(-1, |m| m as i64),
                    v.patch.map_or(-1, |p| p as i64),
                ))
            });

            versions
                .into_iter()
                .map(|version| ParsedTag {
                    version: TagVersion::Semantic(version),
                    variant: variant.clone(),
                })
                .collect()
        }
    }
}

/// Decide whether `(to_tag, to_digest)` is an upgrade over the current tag
/// and digest, and of what magnitude.
///
/// Mixing a semantic current tag with a release candidate (or vice versa)
/// is a contract violation by the caller and fails fast.
pub fn is_upgrade(
    from: Option<&ParsedTagAndDigest>,
    to_tag: &ParsedTag,
    to_digest: &str,
) -> Result<Option<BumpSize>> {
    let Some(from) = from else {
        return Ok(Some(BumpSize::Digest));
    };

    match (&from.tag.version, &to_tag.version) {
        (TagVersion::Release(_), _) => {
            // Releases only ever move their pinned digest.
            match &from.digest {
                Some(digest) if digest == to_digest => Ok(None),
                _ => Ok(Some(BumpSize::Digest)),
            }
        }
        (TagVersion::Semantic(_), TagVersion::Release(_)) => {
            bail!(
                "candidate tag {to_tag} is not comparable with current tag {}: one is semantic and one is not",
                from.tag
            )
        }
        (TagVersion::Semantic(from_version), TagVersion::Semantic(to_version)) => {
            let bump = match SemanticVersion::compare(from_version, to_version) {
                VersionDelta::Major => BumpSize::Major,
                VersionDelta::Minor => BumpSize::Minor,
                VersionDelta::Patch => BumpSize::Patch,
                VersionDelta::Equal => BumpSize::Digest,
                VersionDelta::Downgrade | VersionDelta::PrecisionMismatch => return Ok(None),
            };
            match &from.digest {
                Some(digest) if digest == to_digest => Ok(None),
                _ => Ok(Some(bump)),
            }
        }
    }
}
