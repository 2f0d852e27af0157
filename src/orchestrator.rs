//! Orchestrator (spec §4.G): the top-level driver. Resolves which
//! repositories are in scope from a [`FilterPolicy`], pre-warms an ABAC
//! token batched across all of them, then runs List → Plan → Resolve →
//! Purge for each repository in turn, aggregating results.

use std::sync::Arc;

use crate::client::RegistryClient;
use crate::error::Result;
use crate::lister;
use crate::models::{FilterEntry, FilterPolicy, RepositoryResult, RetentionPolicy};
use crate::planner::{compile_filter, compile_tag_pattern, PurgePlanner};
use crate::purger::Purger;
use crate::resolver::DependencyResolver;

/// True when `repository` names a literal repository rather than a glob
/// pattern that must be matched against the live catalog (spec §4.G step 1:
/// "the full registry catalog filtered against the filter policy's
/// repository globs").
fn is_repository_glob(repository: &str) -> bool {
    repository.contains('*') || repository.contains('?')
}

pub struct Orchestrator {
    client: Arc<RegistryClient>,
    retention: RetentionPolicy,
    concurrency: usize,
}

impl Orchestrator {
    pub fn new(client: RegistryClient, retention: RetentionPolicy, concurrency: usize) -> Self {
        Self {
            client: Arc::new(client),
            retention,
            concurrency,
        }
    }

    /// Runs the full purge across every enabled entry of `policy`,
    /// repository by repository. Per-repository errors are captured in
    /// that repository's [`RepositoryResult::first_error`] rather than
    /// aborting the whole batch — one bad repository shouldn't block the
    /// rest (spec §4.G "Aggregate").
    pub async fn run(&self, policy: &FilterPolicy) -> Result<Vec<RepositoryResult>> {
        let entries = self.resolve_repository_entries(policy).await?;

        let repo_names: Vec<String> = entries.iter().map(|e| e.repository.clone()).collect();

        // Pre-warm the ABAC token once, scoped to every repository this run
        // will touch, instead of refreshing per-repository (spec §4.A
        // "scope-aware refresh": batch the scope to avoid N token
        // exchanges for N repositories).
        let _ = self.client.warm_token(&repo_names).await;

        let mut results = Vec::with_capacity(entries.len());
        for entry in &entries {
            results.push(self.run_one(entry).await);
        }
        Ok(results)
    }

    /// Expands each enabled filter entry into one or more concrete
    /// repository entries (spec §4.G step 1). A literal repository name
    /// (no glob metacharacters) passes through unchanged — listing the full
    /// catalog just to match one exact name would be wasted round trips.
    /// A glob name is matched against every repository the catalog
    /// currently holds, the same tag globs carried over to each match.
    async fn resolve_repository_entries(&self, policy: &FilterPolicy) -> Result<Vec<FilterEntry>> {
        let mut resolved = Vec::new();
        let mut catalog: Option<Vec<String>> = None;

        for entry in &policy.repositories {
            if !entry.enabled {
                continue;
            }
            if !is_repository_glob(&entry.repository) {
                resolved.push(entry.clone());
                continue;
            }

            if catalog.is_none() {
                catalog = Some(lister::list_all_repositories(&self.client).await?);
            }
            let pattern = compile_tag_pattern(&entry.repository)?;
            for repo in catalog.as_ref().unwrap() {
                if pattern.is_match(repo) {
                    resolved.push(FilterEntry {
                        repository: repo.clone(),
                        tags: entry.tags.clone(),
                        enabled: true,
                    });
                }
            }
        }

        Ok(resolved)
    }

    async fn run_one(&self, entry: &crate::models::FilterEntry) -> RepositoryResult {
        let repository = &entry.repository;

        let filters = match compile_filter(entry) {
            Ok(f) => f,
            Err(e) => {
                return RepositoryResult {
                    repository: repository.clone(),
                    first_error: Some(e.to_string()),
                    ..Default::default()
                }
            }
        };

        let tags = match lister::list_all_tags(&self.client, repository).await {
            Ok(tags) => tags,
            Err(e) if e.is_not_found() => {
                return RepositoryResult {
                    repository: repository.clone(),
                    ..Default::default()
                }
            }
            Err(e) => {
                return RepositoryResult {
                    repository: repository.clone(),
                    first_error: Some(e.to_string()),
                    ..Default::default()
                }
            }
        };

        let manifests = match lister::list_all_manifests(&self.client, repository).await {
            Ok(manifests) => manifests,
            Err(e) if e.is_not_found() => Vec::new(),
            Err(e) => {
                return RepositoryResult {
                    repository: repository.clone(),
                    first_error: Some(e.to_string()),
                    ..Default::default()
                }
            }
        };

        let planner = PurgePlanner::new(&self.retention);
        let tentative_tags_to_delete = planner.plan_tags(&tags, &filters);
        let deleted_names: std::collections::HashSet<&str> = tentative_tags_to_delete
            .iter()
            .map(|t| t.name.as_str())
            .collect();
        let surviving_digests: Vec<String> = tags
            .iter()
            .filter(|t| !deleted_names.contains(t.name.as_str()))
            .map(|t| t.digest.clone())
            .collect();
        let surviving_tag_names: std::collections::HashSet<String> = tags
            .iter()
            .filter(|t| !deleted_names.contains(t.name.as_str()))
            .map(|t| t.name.clone())
            .collect();

        // Only the manifests that would actually become deletion candidates
        // (untagged-after-tag-kill, within the age cutoff) are handed to the
        // resolver — not the full repository inventory, or every referrer's
        // subject would look like "also a candidate" (spec §4.D.2 steps 1-2,
        // §4.C.2).
        let candidate_digests =
            planner.tentative_manifest_candidates(&manifests, &surviving_tag_names);

        let resolver = DependencyResolver::new(&self.client, repository);
        let forbidden = match resolver.resolve(&surviving_digests, &candidate_digests).await {
            Ok(f) => f,
            Err(e) => {
                return RepositoryResult {
                    repository: repository.clone(),
                    first_error: Some(e.to_string()),
                    ..Default::default()
                }
            }
        };

        let plan = planner.build_plan(repository, &tags, &manifests, &filters, &forbidden);

        let purger = Purger::new(Arc::clone(&self.client), &self.retention, self.concurrency);
        purger.execute(plan).await
    }
}
