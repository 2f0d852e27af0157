//! Purge planner (spec §4.D): turns a filter policy plus retention policy
//! into a concrete [`PurgePlan`] — tags first, then manifests left
//! unreferenced once those tags are gone, with locked entries skipped
//! unless `include_locked` is set.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use regex::Regex;

use crate::error::{PurgeError, Result};
use crate::models::{FilterEntry, Manifest, PurgePlan, RetentionPolicy, Tag};
use crate::resolver::ForbiddenSet;

/// Compiles a single shell-style glob (`*` and `?`, anchored) into a
/// [`Regex`] (spec §4.D "glob→regex compile"). `*` also works as a literal
/// regex passthrough when it contains no glob metacharacters and looks like
/// an existing anchored pattern (e.g. callers may pass a raw `^v.*$`).
pub fn compile_tag_pattern(pattern: &str) -> Result<Regex> {
    if pattern.starts_with('^') || pattern.ends_with('$') {
        return Regex::new(pattern).map_err(|e| invalid_filter(pattern, e));
    }
    let mut regex_src = String::from("^");
    for ch in pattern.chars() {
        match ch {
            '*' => regex_src.push_str(".*"),
            '?' => regex_src.push('.'),
            c if "\\.+()|[]{}^$".contains(c) => {
                regex_src.push('\\');
                regex_src.push(c);
            }
            c => regex_src.push(c),
        }
    }
    regex_src.push('$');
    Regex::new(&regex_src).map_err(|e| invalid_filter(pattern, e))
}

/// Wraps a glob-compile failure as `InvalidFilter` (spec §4.D.1 step 1:
/// "compilation failure → `InvalidFilter`"; §7 error table: "Regex compile
/// fails / malformed policy JSON" triggers `InvalidFilter`), rather than
/// letting the bare `regex::Error` conversion produce `PurgeError::Regex`,
/// which callers can't distinguish from the spec's named error kind.
fn invalid_filter(pattern: &str, e: regex::Error) -> PurgeError {
    PurgeError::InvalidFilter(format!("bad tag pattern {pattern:?}: {e}"))
}

/// Compiles every glob in a [`FilterEntry`] into one alternation matcher.
pub fn compile_filter(entry: &FilterEntry) -> Result<Vec<Regex>> {
    entry.tags.iter().map(|p| compile_tag_pattern(p)).collect()
}

fn matches_any(patterns: &[Regex], name: &str) -> bool {
    patterns.iter().any(|re| re.is_match(name))
}

/// Plans tag and manifest deletions for one repository.
pub struct PurgePlanner<'a> {
    retention: &'a RetentionPolicy,
}

impl<'a> PurgePlanner<'a> {
    pub fn new(retention: &'a RetentionPolicy) -> Self {
        Self { retention }
    }

    /// Selects which tags to delete (spec §4.D "tag kill list"):
    /// glob-filtered, age-cutoff, then keep-N most recent survive, newest
    /// first with ties broken by name ascending (spec §3 "Retention
    /// policy: keep").
    pub fn plan_tags(&self, tags: &[Tag], filters: &[Regex]) -> Vec<Tag> {
        if self.retention.untagged_only {
            return Vec::new();
        }

        let mut matched: Vec<&Tag> = tags
            .iter()
            .filter(|t| matches_any(filters, &t.name))
            .filter(|t| self.retention.include_locked || !t.changeable.is_locked())
            .collect();

        if let Some(cutoff) = self.retention.age_cutoff {
            matched.retain(|t| is_older_than(t.last_update_time, cutoff));
        }

        matched.sort_by(|a, b| sort_key(b).cmp(&sort_key(a)));

        let to_delete = if self.retention.keep > 0 {
            matched
                .into_iter()
                .skip(self.retention.keep)
                .cloned()
                .collect()
        } else {
            matched.into_iter().cloned().collect()
        };

        to_delete
    }

    /// Spec §4.D.2 steps 1-2: manifests that would become untagged once the
    /// tag kill list executes, minus anything outside the age cutoff. This
    /// is the candidate set that must be handed to
    /// [`crate::resolver::DependencyResolver::resolve`] *before* forbidden-set
    /// subtraction — passing the full manifest inventory instead would make
    /// every referrer's subject look like "also a candidate" and defeat
    /// referrer protection (spec §4.C.2).
    pub fn tentative_manifest_candidates(
        &self,
        all_manifests: &[Manifest],
        surviving_tag_names: &HashSet<String>,
    ) -> Vec<String> {
        all_manifests
            .iter()
            .filter(|m| self.is_untagged_candidate(m, surviving_tag_names))
            .filter(|m| match self.retention.age_cutoff {
                Some(cutoff) => is_older_than(m.last_update_time, cutoff),
                None => true,
            })
            .map(|m| m.digest.clone())
            .collect()
    }

    fn is_untagged_candidate(&self, m: &Manifest, surviving_tag_names: &HashSet<String>) -> bool {
        if self.retention.untagged_only {
            m.tags.is_empty()
        } else {
            m.tags.iter().all(|t| !surviving_tag_names.contains(t))
        }
    }

    /// Selects which manifests to delete (spec §4.D "manifest kill list"):
    /// untagged candidates (after the tag kill list is applied), minus
    /// anything the dependency resolver marks forbidden, minus locked
    /// entries unless `include_locked`.
    pub fn plan_manifests(
        &self,
        all_manifests: &[Manifest],
        surviving_tag_names: &HashSet<String>,
        forbidden: &ForbiddenSet,
    ) -> Vec<Manifest> {
        all_manifests
            .iter()
            .filter(|m| self.is_untagged_candidate(m, surviving_tag_names))
            .filter(|m| self.retention.include_locked || !m.changeable.is_locked())
            .filter(|m| !forbidden.contains(&m.digest))
            .filter(|m| match self.retention.age_cutoff {
                Some(cutoff) => is_older_than(m.last_update_time, cutoff),
                None => true,
            })
            .cloned()
            .collect()
    }

    /// Assembles a full plan. `candidate_manifests` is every manifest the
    /// repository currently has; `forbidden` comes from
    /// [`crate::resolver::DependencyResolver`] run over the tags that will
    /// survive `tags_to_delete`.
    pub fn build_plan(
        &self,
        repository: &str,
        tags: &[Tag],
        manifests: &[Manifest],
        filters: &[Regex],
        forbidden: &ForbiddenSet,
    ) -> PurgePlan {
        let tags_to_delete = self.plan_tags(tags, filters);
        let deleted_names: HashSet<&str> =
            tags_to_delete.iter().map(|t| t.name.as_str()).collect();
        let surviving_tag_names: HashSet<String> = tags
            .iter()
            .filter(|t| !deleted_names.contains(t.name.as_str()))
            .map(|t| t.name.clone())
            .collect();

        let manifests_to_delete =
            self.plan_manifests(manifests, &surviving_tag_names, forbidden);

        PurgePlan {
            repository: repository.to_string(),
            tags_to_delete,
            manifests_to_delete,
        }
    }
}

fn is_older_than(timestamp: Option<DateTime<Utc>>, cutoff: DateTime<Utc>) -> bool {
    match timestamp {
        Some(t) => t < cutoff,
        // Entries with no recorded timestamp are treated as eligible —
        // there is no evidence they're newer than the cutoff.
        None => true,
    }
}

fn sort_key(tag: &Tag) -> (DateTime<Utc>, std::cmp::Reverse<&str>) {
    let time = tag.last_update_time.unwrap_or_else(|| DateTime::<Utc>::MIN_UTC);
    (time, std::cmp::Reverse(tag.name.as_str()))
}
