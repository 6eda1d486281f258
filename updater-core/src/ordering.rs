//! Tag ordering policies.
//!
//! A policy ranks tag names; ties are broken by the most recent creation
//! (else observation) timestamp and finally by name, so selection is total.

use std::cmp::Ordering;
use std::fmt;

use semver::Version;
use serde::{Deserialize, Serialize};

use crate::types::TagInfo;

/// How candidate tags are ranked for an environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TagPolicy {
    /// Plain string order; the string-max tag wins.
    Lexical,
    /// Semantic versions, prerelease tags excluded. Non-semver tags rank
    /// below every version.
    #[default]
    Semver,
    /// Like `Semver`, but prerelease versions take part in the ranking.
    SemverPrerelease,
}

impl fmt::Display for TagPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TagPolicy::Lexical => write!(f, "lexical"),
            TagPolicy::Semver => write!(f, "semver"),
            TagPolicy::SemverPrerelease => write!(f, "semver_prerelease"),
        }
    }
}

/// Rank of a single tag. `Unversioned` sorts below every `Version`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
enum Rank<'a> {
    Unversioned,
    Version(Version),
    Name(&'a str),
}

impl TagPolicy {
    fn rank<'a>(&self, tag: &'a str) -> Rank<'a> {
        match self {
            TagPolicy::Lexical => Rank::Name(tag),
            TagPolicy::Semver => match parse_version(tag) {
                Some(v) if v.pre.is_empty() => Rank::Version(v),
                _ => Rank::Unversioned,
            },
            TagPolicy::SemverPrerelease => match parse_version(tag) {
                Some(v) => Rank::Version(v),
                None => Rank::Unversioned,
            },
        }
    }

    /// Compare two tag names by rank only. Distinct names may compare equal
    /// under the semver policies (`16` vs `16.0.0`, or two non-semver tags).
    pub fn compare(&self, a: &str, b: &str) -> Ordering {
        self.rank(a).cmp(&self.rank(b))
    }

    /// Tags sorted highest rank first; equal ranks fall back to name order,
    /// highest first.
    pub fn sort_descending(&self, tags: &[String]) -> Vec<String> {
        let mut sorted = tags.to_vec();
        sorted.sort_by(|a, b| self.compare(b, a).then_with(|| b.cmp(a)));
        sorted.dedup();
        sorted
    }

    /// Every tag tied for the highest rank. Empty when `tags` is empty.
    ///
    /// A single entry means no timestamp lookup is needed to decide.
    pub fn top_candidates(&self, tags: &[String]) -> Vec<String> {
        let Some(best) = tags.iter().max_by(|a, b| self.compare(a, b)) else {
            return Vec::new();
        };
        let best_rank = self.rank(best);
        let mut top: Vec<String> = tags
            .iter()
            .filter(|tag| self.rank(tag) == best_rank)
            .cloned()
            .collect();
        top.sort();
        top.dedup();
        top
    }

    /// Pick the winner among fully-resolved tags.
    pub fn select<'a>(&self, tags: &'a [TagInfo]) -> Option<&'a TagInfo> {
        tags.iter().max_by(|a, b| {
            self.compare(&a.name, &b.name)
                .then_with(|| a.effective_time().cmp(&b.effective_time()))
                .then_with(|| a.name.cmp(&b.name))
        })
    }

    /// Whether `tag` ranks at or above `other`.
    pub fn at_least(&self, tag: &str, other: &str) -> bool {
        self.compare(tag, other) != Ordering::Less
    }
}

/// Lenient semantic version parsing for image tags.
///
/// Accepts an optional `v` prefix and pads missing minor/patch components:
/// `v1.25` parses as `1.25.0`. Returns `None` for anything else.
pub fn parse_version(tag: &str) -> Option<Version> {
    let stripped = tag
        .strip_prefix('v')
        .or_else(|| tag.strip_prefix('V'))
        .unwrap_or(tag);

    let split_at = stripped.find(|c: char| c == '-' || c == '+').unwrap_or(stripped.len());
    let (core, suffix) = stripped.split_at(split_at);

    let parts: Vec<&str> = core.split('.').collect();
    if parts.is_empty() || parts.len() > 3 {
        return None;
    }
    let mut numbers = [0u64; 3];
    for (slot, part) in numbers.iter_mut().zip(&parts) {
        if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        *slot = part.parse().ok()?;
    }

    let normalized = format!("{}.{}.{}{}", numbers[0], numbers[1], numbers[2], suffix);
    Version::parse(&normalized).ok()
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};
    use rstest::rstest;

    use super::*;
    use crate::types::Digest;

    fn tags(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn info(name: &str, age_minutes: i64) -> TagInfo {
        let now = Utc::now();
        TagInfo {
            name: name.to_string(),
            digest: Digest::from(format!("sha256:{name}")),
            created_at: Some(now - Duration::minutes(age_minutes)),
            observed_at: now,
        }
    }

    #[rstest]
    #[case("1.25.1", Some("1.25.1"))]
    #[case("v1.25", Some("1.25.0"))]
    #[case("16", Some("16.0.0"))]
    #[case("2.0.0-rc.1", Some("2.0.0-rc.1"))]
    #[case("1.2.3.4", None)]
    #[case("latest", None)]
    #[case("sha-abc123", None)]
    #[case("1.x", None)]
    fn lenient_version_parsing(#[case] tag: &str, #[case] expected: Option<&str>) {
        let parsed = parse_version(tag).map(|v| v.to_string());
        assert_eq!(parsed.as_deref(), expected);
    }

    #[test]
    fn semver_and_lexical_pick_different_winners() {
        let input = tags(&["1.24.0", "1.25.0", "1.25.1", "latest", "sha-abc123"]);
        assert_eq!(TagPolicy::Semver.top_candidates(&input), vec!["1.25.1"]);
        assert_eq!(TagPolicy::Lexical.top_candidates(&input), vec!["sha-abc123"]);
    }

    #[test]
    fn non_semver_tags_rank_below_versions() {
        let input = tags(&["latest", "0.0.1", "stable"]);
        let sorted = TagPolicy::Semver.sort_descending(&input);
        assert_eq!(sorted[0], "0.0.1");
    }

    #[test]
    fn prerelease_excluded_unless_allowed() {
        let input = tags(&["1.0.0", "1.1.0-rc.1"]);
        assert_eq!(TagPolicy::Semver.top_candidates(&input), vec!["1.0.0"]);
        assert_eq!(
            TagPolicy::SemverPrerelease.top_candidates(&input),
            vec!["1.1.0-rc.1"]
        );
    }

    #[test]
    fn equal_versions_tie_and_break_on_timestamp() {
        let input = tags(&["16", "16.0.0", "15.4"]);
        let top = TagPolicy::Semver.top_candidates(&input);
        assert_eq!(top, vec!["16", "16.0.0"]);

        let resolved = vec![info("16", 30), info("16.0.0", 5)];
        let winner = TagPolicy::Semver.select(&resolved).expect("winner");
        assert_eq!(winner.name, "16.0.0", "most recent creation wins the tie");
    }

    #[test]
    fn only_unversioned_tags_all_tie() {
        let input = tags(&["latest", "stable", "edge"]);
        assert_eq!(TagPolicy::Semver.top_candidates(&input).len(), 3);

        let resolved = vec![info("latest", 1), info("stable", 60), info("edge", 10)];
        let winner = TagPolicy::Semver.select(&resolved).expect("winner");
        assert_eq!(winner.name, "latest");
    }

    #[test]
    fn at_least_accepts_equal_rank() {
        assert!(TagPolicy::Semver.at_least("1.25.1", "1.25.0"));
        assert!(TagPolicy::Semver.at_least("latest", "stable"));
        assert!(!TagPolicy::Semver.at_least("1.24.0", "1.25.0"));
        assert!(TagPolicy::Lexical.at_least("b", "a"));
    }

    #[test]
    fn empty_input_has_no_candidates() {
        assert!(TagPolicy::Semver.top_candidates(&[]).is_empty());
        assert!(TagPolicy::Lexical.select(&[]).is_none());
    }

    #[test]
    fn policy_serializes_snake_case() {
        let yaml = serde_yaml::to_string(&TagPolicy::SemverPrerelease).expect("ser");
        assert_eq!(yaml.trim(), "semver_prerelease");
    }
}
