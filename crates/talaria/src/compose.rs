//! Compose-manifest scanning.
//!
//! Discovery walks the cloned working tree for files matching the configured
//! glob; extraction recovers `{service, image, policy}` triples from each
//! file by pure indentation analysis. No tree-shaped YAML parsing happens
//! anywhere: the write path must preserve every byte outside the single
//! rewritten `image:` line, and the scanner must tolerate files a structural
//! parser would reject.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use glob::Pattern;
use log::debug;
use thiserror::Error;
use walkdir::WalkDir;

use crate::types::{BumpSize, DockerComposeTarget};

/// A per-line extraction failure. Recorded, logged as a warning by the
/// caller, and never fatal to the scan. Line numbers are 1-based for humans.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TargetError {
    #[error("line {line}: {reason}")]
    MalformedTarget { line: usize, reason: String },
    #[error("line {line}: no update policy annotation found")]
    MissingPolicy { line: usize },
}

/// Everything extracted from one compose file.
#[derive(Debug, Default)]
pub struct ComposeScan {
    pub targets: Vec<DockerComposeTarget>,
    pub errors: Vec<TargetError>,
}

/// Walk `root` for compose files matching `pattern`, excluding anything
/// under a `.git` segment. Traversal is sorted by file name so target order
/// is stable across scans.
pub fn find_compose_files(root: &Path, pattern: &str) -> Result<Vec<PathBuf>> {
    let pattern = Pattern::new(pattern)
        .with_context(|| format!("invalid compose file pattern {pattern:?}"))?;

    let mut files = Vec::new();
    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry.with_context(|| format!("failed to walk {}", root.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        if entry.path().components().any(|c| c.as_os_str() == ".git") {
            continue;
        }
        let name = entry.file_name().to_string_lossy();
        if pattern.matches(&name) {
            debug!("found compose file {}", entry.path().display());
            files.push(entry.path().to_path_buf());
        }
    }
    Ok(files)
}

/// Extract every update target from one compose file.
///
/// Each `image:` line either yields a [`DockerComposeTarget`] or a
/// [`TargetError`]; errors never abort the rest of the file.
pub fn extract_targets(path: &Path, legacy_aliases: bool) -> Result<ComposeScan> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("failed to read compose file {}", path.display()))?;
    let lines: Vec<&str> = content.lines().collect();

    let mut scan = ComposeScan::default();
    for (line_index, line) in lines.iter().enumerate() {
        let Some(rest) = line.trim().strip_prefix("image:") else {
            continue;
        };
        let image = unquote(rest.trim());
        if image.is_empty() {
            continue;
        }

        match parse_image_line(&lines, line_index, legacy_aliases) {
            Ok((service_key, bump, skip)) => {
                debug!(
                    "found image {image:?} at line {} in service {service_key:?}",
                    line_index + 1
                );
                scan.targets.push(DockerComposeTarget {
                    file_path: path.to_path_buf(),
                    service_key,
                    line: line_index,
                    current_image_string: image.to_string(),
                    bump,
                    skip,
                });
            }
            Err(err) => scan.errors.push(err),
        }
    }
    Ok(scan)
}

/// Rewrite the single `image:` line of `target` to `new_image`, preserving
/// the line's leading whitespace and every other byte of the file.
pub fn apply_update(target: &DockerComposeTarget, new_image: &str) -> Result<()> {
    let content = fs::read_to_string(&target.file_path)
        .with_context(|| format!("failed to read {}", target.file_path.display()))?;
    let mut lines: Vec<String> = content.split_inclusive('\n').map(str::to_string).collect();

    let line = lines.get_mut(target.line).ok_or_else(|| {
        anyhow!(
            "line {} is out of bounds for {}",
            target.line,
            target.file_path.display()
        )
    })?;
    let indent: String = line
        .chars()
        .take_while(|c| *c == ' ' || *c == '\t')
        .collect();
    *line = format!("{indent}image: {new_image}\n");

    fs::write(&target.file_path, lines.concat())
        .with_context(|| format!("failed to write {}", target.file_path.display()))
}

fn parse_image_line(
    lines: &[&str],
    line_index: usize,
    legacy_aliases: bool,
) -> Result<(String, BumpSize, bool), TargetError> {
    let service_key = find_service_key(lines, line_index)?;
    let (bump, skip) = find_policy(lines, line_index, legacy_aliases)?;
    Ok((service_key, bump, skip))
}

fn indentation(line: &str) -> usize {
    line.chars().take_while(|c| c.is_whitespace()).count()
}

/// Nearest preceding non-comment line with strictly less indentation and a
/// `:` in it; its key is the service name.
fn find_service_key(lines: &[&str], line_index: usize) -> Result<String, TargetError> {
    let current_indent = indentation(lines[line_index]);
    for line in lines[..line_index].iter().rev() {
        if indentation(line) >= current_indent {
            continue;
        }
        if !line.contains(':') || line.trim().starts_with('#') {
            continue;
        }
        let key = line.split(':').next().unwrap_or_default().trim();
        return Ok(key.to_string());
    }
    Err(TargetError::MalformedTarget {
        line: line_index + 1,
        reason: "no service key found above `image:` entry".to_string(),
    })
}

/// Scan downward from the `image:` line for a sibling policy annotation.
fn find_policy(
    lines: &[&str],
    line_index: usize,
    legacy_aliases: bool,
) -> Result<(BumpSize, bool), TargetError> {
    let current_indent = indentation(lines[line_index]);
    for (i, line) in lines.iter().enumerate().skip(line_index + 1) {
        let indent = indentation(line);
        if indent < current_indent {
            break;
        }
        if indent != current_indent {
            continue;
        }
        let stripped = line.trim();
        if stripped.starts_with("x-talaria:") {
            return parse_block_annotation(lines, i, current_indent);
        }
        if let Some(value) = stripped.strip_prefix("x-tl:") {
            return parse_shorthand(value, i + 1, legacy_aliases);
        }
        if legacy_aliases && stripped.starts_with("x-talos:") {
            return parse_block_annotation(lines, i, current_indent);
        }
    }
    Err(TargetError::MissingPolicy {
        line: line_index + 1,
    })
}

/// `x-talaria:` block: a deeper-indented block with optional `bump:` and
/// `skip:` keys. Defaults are `Digest` and `false`.
fn parse_block_annotation(
    lines: &[&str],
    start_line: usize,
    base_indent: usize,
) -> Result<(BumpSize, bool), TargetError> {
    let mut bump = BumpSize::Digest;
    let mut skip = false;

    for (i, line) in lines.iter().enumerate().skip(start_line + 1) {
        if indentation(line) <= base_indent {
            break;
        }
        let stripped = line.trim();
        if let Some(value) = stripped.strip_prefix("bump:") {
            bump = parse_bump_value(value.trim(), i + 1)?;
        } else if let Some(value) = stripped.strip_prefix("skip:") {
            skip = parse_skip_value(value.trim());
        }
    }
    Ok((bump, skip))
}

fn parse_bump_value(value: &str, line: usize) -> Result<BumpSize, TargetError> {
    match unquote(value).trim().to_lowercase().as_str() {
        "major" => Ok(BumpSize::Major),
        "minor" => Ok(BumpSize::Minor),
        "patch" => Ok(BumpSize::Patch),
        "digest" => Ok(BumpSize::Digest),
        _ => Err(TargetError::MalformedTarget {
            line,
            reason: format!("invalid bump value {value:?}"),
        }),
    }
}

/// `true|yes|1`, `false|no|0`, or any integer (positive means skip).
/// Unrecognized values fall back to `false`.
fn parse_skip_value(value: &str) -> bool {
    let value = unquote(value).trim().to_lowercase();
    match value.as_str() {
        "true" | "yes" | "1" => true,
        "false" | "no" | "0" => false,
        other => other.parse::<i64>().map(|n| n > 0).unwrap_or(false),
    }
}

/// `x-tl:` single-character shorthand.
fn parse_shorthand(
    value: &str,
    line: usize,
    legacy_aliases: bool,
) -> Result<(BumpSize, bool), TargetError> {
    let mut value = unquote(value.trim()).to_string();
    if legacy_aliases {
        value.truncate(value.chars().next().map_or(0, char::len_utf8));
    }
    match value.as_str() {
        "x" => Ok((BumpSize::Digest, true)),
        "+" => Ok((BumpSize::Major, false)),
        "^" => Ok((BumpSize::Minor, false)),
        "~" => Ok((BumpSize::Patch, false)),
        "@" => Ok((BumpSize::Digest, false)),
        _ => Err(TargetError::MalformedTarget {
            line,
            reason: format!("invalid x-tl value {value:?}"),
        }),
    }
}

fn unquote(item: &str) -> &str {
    let stripped = item
        .strip_prefix('\'')
        .and_then(|s| s.strip_suffix('\''))
        .or_else(|| item.strip_prefix('"').and_then(|s| s.strip_suffix('"')));
    stripped.unwrap_or(item)
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::tempdir;

    use super::*;

    fn write_compose(dir: &Path, name: &str, content: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, content).expect("write compose file");
        path
    }

    const BASIC: &str = "\
services:
  web:
    image: nginx:1.25.3
    x-talaria:
      bump: minor
  cache:
    image: redis:7.2.1-alpine
    x-tl: '~'
";

    #[test]
    fn extracts_one_target_per_image_line() {
        let td = tempdir().expect("tempdir");
        let path = write_compose(td.path(), "docker-compose.yml", BASIC);

        let scan = extract_targets(&path, false).expect("scan");
        assert!(scan.errors.is_empty());
        assert_eq!(scan.targets.len(), 2);

        let web = &scan.targets[0];
        assert_eq!(web.service_key, "web");
        assert_eq!(web.line, 2);
        assert_eq!(web.current_image_string, "nginx:1.25.3");
        assert_eq!(web.bump, BumpSize::Minor);
        assert!(!web.skip);

        let cache = &scan.targets[1];
        assert_eq!(cache.service_key, "cache");
        assert_eq!(cache.bump, BumpSize::Patch);
    }

    #[test]
    fn quoted_references_and_annotations_are_unquoted() {
        let td = tempdir().expect("tempdir");
        let path = write_compose(
            td.path(),
            "docker-compose.yml",
            "services:\n  app:\n    image: \"ghcr.io/acme/app:2.0\"\n    x-talaria:\n      bump: \"PATCH\"\n      skip: 'yes'\n",
        );

        let scan = extract_targets(&path, false).expect("scan");
        let target = &scan.targets[0];
        assert_eq!(target.current_image_string, "ghcr.io/acme/app:2.0");
        assert_eq!(target.bump, BumpSize::Patch);
        assert!(target.skip);
    }

    #[test]
    fn empty_references_are_silently_ignored() {
        let td = tempdir().expect("tempdir");
        let path = write_compose(
            td.path(),
            "docker-compose.yml",
            "services:\n  app:\n    image:\n",
        );
        let scan = extract_targets(&path, false).expect("scan");
        assert!(scan.targets.is_empty());
        assert!(scan.errors.is_empty());
    }

    #[test]
    fn missing_service_key_is_a_malformed_target() {
        let td = tempdir().expect("tempdir");
        let path = write_compose(td.path(), "docker-compose.yml", "image: nginx:1\n");
        let scan = extract_targets(&path, false).expect("scan");
        assert!(scan.targets.is_empty());
        assert!(matches!(
            scan.errors[0],
            TargetError::MalformedTarget { line: 1, .. }
        ));
    }

    #[test]
    fn missing_annotation_is_a_missing_policy() {
        let td = tempdir().expect("tempdir");
        let path = write_compose(
            td.path(),
            "docker-compose.yml",
            "services:\n  app:\n    image: nginx:1\n",
        );
        let scan = extract_targets(&path, false).expect("scan");
        assert_eq!(scan.errors, vec![TargetError::MissingPolicy { line: 3 }]);
    }

    #[test]
    fn annotation_search_stops_at_the_next_service() {
        let td = tempdir().expect("tempdir");
        let path = write_compose(
            td.path(),
            "docker-compose.yml",
            "services:\n  a:\n    image: nginx:1\n  b:\n    image: redis:7\n    x-tl: '@'\n",
        );
        let scan = extract_targets(&path, false).expect("scan");
        // Service a has no annotation of its own; b's must not leak upward.
        assert_eq!(scan.targets.len(), 1);
        assert_eq!(scan.targets[0].service_key, "b");
        assert_eq!(scan.errors, vec![TargetError::MissingPolicy { line: 3 }]);
    }

    #[test]
    fn comments_are_not_service_keys() {
        let td = tempdir().expect("tempdir");
        let path = write_compose(
            td.path(),
            "docker-compose.yml",
            "services:\n  app:\n    # image: commented\n    image: nginx:1\n    x-tl: '@'\n",
        );
        let scan = extract_targets(&path, false).expect("scan");
        assert_eq!(scan.targets[0].service_key, "app");
    }

    #[test]
    fn shorthand_values_map_to_policies() {
        let cases = [
            ("x", BumpSize::Digest, true),
            ("+", BumpSize::Major, false),
            ("^", BumpSize::Minor, false),
            ("~", BumpSize::Patch, false),
            ("@", BumpSize::Digest, false),
        ];
        for (value, bump, skip) in cases {
            let td = tempdir().expect("tempdir");
            let path = write_compose(
                td.path(),
                "docker-compose.yml",
                &format!("services:\n  app:\n    image: nginx:1\n    x-tl: '{value}'\n"),
            );
            let scan = extract_targets(&path, false).expect("scan");
            assert_eq!(scan.targets[0].bump, bump, "value {value:?}");
            assert_eq!(scan.targets[0].skip, skip, "value {value:?}");
        }
    }

    #[test]
    fn unknown_shorthand_is_malformed() {
        let td = tempdir().expect("tempdir");
        let path = write_compose(
            td.path(),
            "docker-compose.yml",
            "services:\n  app:\n    image: nginx:1\n    x-tl: '?'\n",
        );
        let scan = extract_targets(&path, false).expect("scan");
        assert!(matches!(
            scan.errors[0],
            TargetError::MalformedTarget { .. }
        ));
    }

    #[test]
    fn legacy_aliases_accept_x_talos_and_long_shorthand() {
        let content = "services:\n  app:\n    image: nginx:1\n    x-talos:\n      bump: major\n  b:\n    image: redis:7\n    x-tl: xkcd\n";
        let td = tempdir().expect("tempdir");
        let path = write_compose(td.path(), "docker-compose.yml", content);

        let strict = extract_targets(&path, false).expect("scan");
        assert_eq!(strict.targets.len(), 0);
        assert_eq!(strict.errors.len(), 2);

        let legacy = extract_targets(&path, true).expect("scan");
        assert!(legacy.errors.is_empty());
        assert_eq!(legacy.targets[0].bump, BumpSize::Major);
        // Multi-character shorthand collapses to its first character.
        assert!(legacy.targets[1].skip);
    }

    #[test]
    fn apply_update_touches_exactly_one_line() {
        let td = tempdir().expect("tempdir");
        let content = "services:\n  web:\n    image: nginx:1.25.3   # pinned\n    x-tl: '^'\n  # trailing comment\n";
        let path = write_compose(td.path(), "docker-compose.yml", content);
        let scan = extract_targets(&path, false).expect("scan");
        let target = &scan.targets[0];

        apply_update(target, "nginx:1.26.0@sha256:abc123").expect("apply");

        let updated = fs::read_to_string(&path).expect("read back");
        let expected = "services:\n  web:\n    image: nginx:1.26.0@sha256:abc123\n    x-tl: '^'\n  # trailing comment\n";
        assert_eq!(updated, expected);
    }

    #[test]
    fn apply_update_preserves_tab_indentation() {
        let td = tempdir().expect("tempdir");
        let content = "services:\n\tweb:\n\t\timage: nginx:1\n\t\tx-tl: '@'\n";
        let path = write_compose(td.path(), "docker-compose.yml", content);
        let scan = extract_targets(&path, false).expect("scan");

        apply_update(&scan.targets[0], "nginx:2").expect("apply");
        assert_eq!(
            fs::read_to_string(&path).expect("read back"),
            "services:\n\tweb:\n\t\timage: nginx:2\n\t\tx-tl: '@'\n"
        );
    }

    #[test]
    fn discovery_matches_the_glob_and_skips_git() {
        let td = tempdir().expect("tempdir");
        let root = td.path();
        fs::create_dir_all(root.join("stacks/media")).expect("mkdir");
        fs::create_dir_all(root.join(".git/objects")).expect("mkdir");
        write_compose(root, "docker-compose.yml", BASIC);
        write_compose(&root.join("stacks/media"), "docker-compose.override.yaml", BASIC);
        write_compose(&root.join(".git/objects"), "docker-compose.yml", BASIC);
        write_compose(root, "notes.yml", "services: {}\n");

        let files = find_compose_files(root, "docker-compose*.y*ml").expect("walk");
        assert_eq!(files.len(), 2);
        assert!(files.iter().all(|f| !f.to_string_lossy().contains(".git")));
    }
}
