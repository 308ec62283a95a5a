//! Image-reference grammar.
//!
//! A single anchored regular grammar covering
//! `[domain/][namespace/]name[:tag[@digest]]` plus standalone tags. The
//! release-name allow-list is configuration, so the compiled parser is built
//! once per [`crate::config::Config`] and shared.

use anyhow::{Context, Result, bail};
use regex::{Captures, Regex};
use thiserror::Error;

use crate::types::{ParsedImage, ParsedTag, ParsedTagAndDigest, SemanticVersion, TagVersion};

/// Injected when a reference names no registry.
pub const DEFAULT_DOMAIN: &str = "docker.io";
/// Injected alongside the default domain when a reference has no namespace.
pub const DEFAULT_NAMESPACE: &str = "library";

/// A reference the grammar does not accept.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unable to parse image reference {0:?}")]
pub struct ParseError(pub String);

/// Compiled image-reference grammar for one release allow-list.
#[derive(Debug, Clone)]
pub struct ImageParser {
    image: Regex,
    tag_and_digest: Regex,
    tag: Regex,
}

impl ImageParser {
    /// Compile the grammar for the given release names (e.g.
    /// `["latest", "stable", "mainline", "develop"]`).
    pub fn new(valid_releases: &[String]) -> Result<Self> {
        if valid_releases.is_empty() {
            bail!("release allow-list must not be empty");
        }
        let releases = valid_releases
            .iter()
            .map(|r| regex::escape(r))
            .collect::<Vec<_>>()
            .join("|");

        let tag_pattern = format!(
            r"(?P<versionprefix>v)?(?:(?:(?P<major>\d{{1,6}})(?:\.(?P<minor>\d{{1,6}})(?:\.(?P<patch>\d{{1,6}}))?)?)|(?P<release>{releases}))(?:-(?P<variant>\w+))?"
        );
        let tag_and_digest_pattern =
            format!(r"(?P<tag>{tag_pattern})(?:@(?P<digest>sha\d+:[a-f0-9]+))?");
        let image_pattern = format!(
            r"(?P<untagged>(?:(?P<domain>[\w.\-_]+\.[\w.\-_]+(?::\d+)?)/)?(?:(?P<namespace>(?:[\w.\-_]+)(?:/[\w.\-_]+)*)/)?(?P<name>[a-z0-9.\-_]+))(?::(?P<taganddigest>{tag_and_digest_pattern}))?"
        );

        Ok(Self {
            image: Regex::new(&format!("^{image_pattern}$"))
                .context("failed to compile image grammar")?,
            tag_and_digest: Regex::new(&format!("^{tag_and_digest_pattern}$"))
                .context("failed to compile tag-and-digest grammar")?,
            tag: Regex::new(&format!("^{tag_pattern}$")).context("failed to compile tag grammar")?,
        })
    }

    /// Parse a full image reference, failing with [`ParseError`].
    ///
    /// With `insert_default_domain`, a reference without a domain gets
    /// `docker.io` (and, if it also lacks a namespace, `library`). The
    /// `untagged` field always preserves the reference as written.
    pub fn parse(&self, image: &str, insert_default_domain: bool) -> Result<ParsedImage, ParseError> {
        self.try_parse(image, insert_default_domain)
            .ok_or_else(|| ParseError(image.to_string()))
    }

    /// Like [`ImageParser::parse`] but returning `None` on a non-match.
    pub fn try_parse(&self, image: &str, insert_default_domain: bool) -> Option<ParsedImage> {
        let captures = self.image.captures(image)?;

        let mut domain = group(&captures, "domain");
        let mut namespace = group(&captures, "namespace");
        let name = group(&captures, "name")?;
        let untagged = group(&captures, "untagged")?;

        if insert_default_domain && domain.is_none() {
            domain = Some(DEFAULT_DOMAIN.to_string());
            if namespace.is_none() {
                namespace = Some(DEFAULT_NAMESPACE.to_string());
            }
        }

        let tag_and_digest = parse_tag_and_digest_captures(&captures);

        Some(ParsedImage {
            name,
            untagged,
            domain,
            namespace,
            tag_and_digest,
        })
    }

    /// Parse a standalone `tag[@digest]` string.
    pub fn try_parse_tag_and_digest(&self, text: &str) -> Option<ParsedTagAndDigest> {
        let captures = self.tag_and_digest.captures(text)?;
        parse_tag_and_digest_captures(&captures)
    }

    /// Parse a standalone tag string.
    pub fn try_parse_tag(&self, text: &str) -> Option<ParsedTag> {
        let captures = self.tag.captures(text)?;
        parse_tag_captures(&captures)
    }
}

fn parse_tag_and_digest_captures(captures: &Captures<'_>) -> Option<ParsedTagAndDigest> {
    let tag = parse_tag_captures(captures)?;
    Some(ParsedTagAndDigest {
        tag,
        digest: group(captures, "digest"),
    })
}

fn parse_tag_captures(captures: &Captures<'_>) -> Option<ParsedTag> {
    let version = if let Some(major) = group(captures, "major") {
        TagVersion::Semantic(SemanticVersion {
            major: major.parse().ok()?,
            minor: int_group(captures, "minor"),
            patch: int_group(captures, "patch"),
            version_prefix: group(captures, "versionprefix"),
        })
    } else if let Some(release) = group(captures, "release") {
        TagVersion::Release(release)
    } else {
        return None;
    };

    Some(ParsedTag {
        version,
        variant: group(captures, "variant"),
    })
}

fn group(captures: &Captures<'_>, name: &str) -> Option<String> {
    captures
        .name(name)
        .map(|m| m.as_str().to_string())
        .filter(|s| !s.is_empty())
}

fn int_group(captures: &Captures<'_>, name: &str) -> Option<u64> {
    group(captures, name).and_then(|s| s.parse().ok())
}
