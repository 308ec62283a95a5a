//! Property-based tests for engine invariants.
//!
//! These verify properties that should hold for all inputs:
//! - `compare` is reflexive, antisymmetric for major steps, and reports a
//!   precision mismatch exactly when precisions differ
//! - parsing a rendered reference round-trips to the same structure
//! - candidate selection never proposes a downgrade or a precision change

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use crate::image::ImageParser;
    use crate::types::{
        BumpSize, ParsedImage, ParsedTag, ParsedTagAndDigest, SemanticVersion, TagVersion,
        VersionDelta,
    };
    use crate::updater::select_candidates;

    fn parser() -> ImageParser {
        let releases: Vec<String> = ["latest", "stable", "mainline", "develop"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        ImageParser::new(&releases).expect("compile grammar")
    }

    fn version_strategy() -> impl Strategy<Value = SemanticVersion> {
        (
            0u64..999_999,
            proptest::option::of(0u64..999_999),
            proptest::bool::ANY,
        )
            .prop_flat_map(|(major, minor, prefixed)| {
                let patch = match minor {
                    Some(_) => proptest::option::of(0u64..999_999).boxed(),
                    None => Just(None::<u64>).boxed(),
                };
                patch.prop_map(move |patch| SemanticVersion {
                    major,
                    minor,
                    patch,
                    version_prefix: prefixed.then(|| "v".to_string()),
                })
            })
    }

    proptest! {
        /// Property: compare(v, v) is always EQUAL.
        #[test]
        fn compare_is_reflexive(v in version_strategy()) {
            prop_assert_eq!(SemanticVersion::compare(&v, &v), VersionDelta::Equal);
        }

        /// Property: a MAJOR step back is a DOWNGRADE, and vice versa.
        #[test]
        fn major_steps_are_antisymmetric(a in version_strategy(), b in version_strategy()) {
            if SemanticVersion::compare(&a, &b) == VersionDelta::Major {
                prop_assert_eq!(SemanticVersion::compare(&b, &a), VersionDelta::Downgrade);
            }
        }

        /// Property: PRECISION_MISMATCH is reported iff precisions differ.
        #[test]
        fn mismatch_iff_precisions_differ(a in version_strategy(), b in version_strategy()) {
            let mismatch = SemanticVersion::compare(&a, &b) == VersionDelta::PrecisionMismatch;
            prop_assert_eq!(mismatch, a.precision() != b.precision());
        }

        /// Property: rendering a version and re-parsing it as a tag yields
        /// the same structure.
        #[test]
        fn version_rendering_round_trips(v in version_strategy()) {
            let tag = parser().try_parse_tag(&v.to_string()).expect("re-parse");
            prop_assert_eq!(tag.version, TagVersion::Semantic(v));
            prop_assert_eq!(tag.variant, None);
        }

        /// Property: rendering a full reference and re-parsing it yields the
        /// same structure.
        #[test]
        fn reference_rendering_round_trips(
            namespaced in proptest::bool::ANY,
            name in "[a-z0-9]{1,12}",
            v in version_strategy(),
            digest in proptest::option::of("[a-f0-9]{16}"),
        ) {
            let image = ParsedImage {
                untagged: if namespaced { format!("acme/{name}") } else { name.clone() },
                name,
                domain: None,
                namespace: namespaced.then(|| "acme".to_string()),
                tag_and_digest: Some(ParsedTagAndDigest {
                    tag: ParsedTag { version: TagVersion::Semantic(v), variant: None },
                    digest: digest.map(|d| format!("sha256:{d}")),
                }),
            };
            let reparsed = parser().try_parse(&image.to_string(), false).expect("re-parse");
            prop_assert_eq!(reparsed, image);
        }

        /// Property: for a semantic current tag, every candidate keeps the
        /// precision, variant, and prefix, none is a downgrade, and the list
        /// is sorted strictly descending.
        #[test]
        fn candidates_preserve_the_lattice(
            current in version_strategy(),
            pool in proptest::collection::vec(version_strategy(), 0..24),
        ) {
            let image = ParsedImage {
                name: "app".to_string(),
                untagged: "app".to_string(),
                domain: None,
                namespace: None,
                tag_and_digest: Some(ParsedTagAndDigest {
                    tag: ParsedTag {
                        version: TagVersion::Semantic(current.clone()),
                        variant: None,
                    },
                    digest: None,
                }),
            };
            let tags: Vec<ParsedTag> = pool
                .into_iter()
                .map(|v| ParsedTag { version: TagVersion::Semantic(v), variant: None })
                .collect();

            let candidates = select_candidates(&image, &tags, BumpSize::Major);

            let versions: Vec<&SemanticVersion> = candidates
                .iter()
                .map(|c| match &c.version {
                    TagVersion::Semantic(v) => v,
                    TagVersion::Release(_) => panic!("release candidate for semantic current"),
                })
                .collect();

            for v in &versions {
                prop_assert_eq!(v.precision(), current.precision());
                prop_assert_eq!(&v.version_prefix, &current.version_prefix);
                prop_assert_ne!(
                    SemanticVersion::compare(&current, v),
                    VersionDelta::Downgrade
                );
            }
            for pair in versions.windows(2) {
                let key = |v: &SemanticVersion| {
                    (
                        v.major,
                        v.minor.map_or(-1, |m| m as i64),
                        v.patch.map_or(-1, |p| p as i64),
                    )
                };
                prop_assert!(key(pair[0]) >= key(pair[1]));
            }
        }
    }
}
