//! Purger (spec §4.F): executes one repository's [`PurgePlan`] — unlocking
//! locked entries first when `include_locked` is set, deleting every tag
//! before any manifest (spec §3 invariant: a manifest is never removed
//! while a tag still names it), via the bounded-concurrency [`WorkerPool`].

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::client::{DeleteOutcome, RegistryClient};
use crate::error::Result;
use crate::models::{ChangeableAttributes, PurgePlan, RepositoryResult, RetentionPolicy};
use crate::output;
use crate::pool::WorkerPool;

pub struct Purger<'a> {
    client: Arc<RegistryClient>,
    retention: &'a RetentionPolicy,
    concurrency: usize,
}

impl<'a> Purger<'a> {
    pub fn new(client: Arc<RegistryClient>, retention: &'a RetentionPolicy, concurrency: usize) -> Self {
        Self {
            client,
            retention,
            concurrency,
        }
    }

    /// Executes `plan`. In dry-run mode, no network deletes are issued and
    /// the plan's counts are reported as-is (spec §8 "dry-run purity": the
    /// registry state must be byte-identical before and after).
    pub async fn execute(&self, plan: PurgePlan) -> RepositoryResult {
        if plan.is_empty() {
            return RepositoryResult {
                repository: plan.repository,
                ..Default::default()
            };
        }

        if self.retention.dry_run {
            let host = self.client.display_host();
            for tag in &plan.tags_to_delete {
                println!("[dry-run] {host}/{}:{}", plan.repository, tag.name);
            }
            for manifest in &plan.manifests_to_delete {
                println!("[dry-run] {host}/{}@{}", plan.repository, manifest.digest);
            }
            return RepositoryResult {
                repository: plan.repository.clone(),
                deleted_tags: plan.tags_to_delete.len(),
                deleted_manifests: plan.manifests_to_delete.len(),
                first_error: None,
            };
        }

        let repository = plan.repository.clone();

        if self.retention.include_locked {
            self.unlock_all(&repository, &plan).await;
        }

        let pool = WorkerPool::new(self.concurrency);
        let deleted_tags = Arc::new(AtomicUsize::new(0));
        let deleted_manifests = Arc::new(AtomicUsize::new(0));

        let host = self.client.display_host().to_string();
        let tag_names: Vec<String> = plan.tags_to_delete.iter().map(|t| t.name.clone()).collect();
        let tag_outcome = {
            let client = Arc::clone(&self.client);
            let repo = repository.clone();
            let counter = Arc::clone(&deleted_tags);
            let host = host.clone();
            pool.run(tag_names, move |name, _cancel| {
                let client = Arc::clone(&client);
                let repo = repo.clone();
                let counter = Arc::clone(&counter);
                let host = host.clone();
                async move {
                    let outcome = client.delete_tag(&repo, &name).await?;
                    match outcome {
                        DeleteOutcome::Deleted => {
                            counter.fetch_add(1, Ordering::SeqCst);
                            output::print_deleted_tag(&host, &repo, &name);
                        }
                        DeleteOutcome::SkippedNotFound => {
                            output::print_skip(&format!("{repo}:{name}"), 404);
                        }
                        DeleteOutcome::SkippedNotAllowed => {
                            output::print_skip(&format!("{repo}:{name}"), 405);
                        }
                    }
                    Ok(())
                }
            })
            .await
        };

        if let Some(err) = tag_outcome.first_error {
            return RepositoryResult {
                repository,
                deleted_tags: deleted_tags.load(Ordering::SeqCst),
                deleted_manifests: 0,
                first_error: Some(err.to_string()),
            };
        }

        let manifest_digests: Vec<String> = plan
            .manifests_to_delete
            .iter()
            .map(|m| m.digest.clone())
            .collect();
        let manifest_outcome = {
            let client = Arc::clone(&self.client);
            let repo = repository.clone();
            let counter = Arc::clone(&deleted_manifests);
            let host = host.clone();
            pool.run(manifest_digests, move |digest, _cancel| {
                let client = Arc::clone(&client);
                let repo = repo.clone();
                let counter = Arc::clone(&counter);
                let host = host.clone();
                async move {
                    let outcome = client.delete_manifest(&repo, &digest).await?;
                    match outcome {
                        DeleteOutcome::Deleted => {
                            counter.fetch_add(1, Ordering::SeqCst);
                            output::print_deleted_manifest(&host, &repo, &digest);
                        }
                        DeleteOutcome::SkippedNotFound => {
                            output::print_skip(&format!("{repo}@{digest}"), 404);
                        }
                        DeleteOutcome::SkippedNotAllowed => {
                            output::print_skip(&format!("{repo}@{digest}"), 405);
                        }
                    }
                    Ok(())
                }
            })
            .await
        };

        RepositoryResult {
            repository,
            deleted_tags: deleted_tags.load(Ordering::SeqCst),
            deleted_manifests: deleted_manifests.load(Ordering::SeqCst),
            first_error: manifest_outcome.first_error.map(|e| e.to_string()),
        }
    }

    /// Clears `deleteEnabled`/`writeEnabled` on every planned entry before
    /// attempting its delete. Best-effort: a failed unlock is logged as a
    /// warning, and deletion is still attempted — servers that allow
    /// deletion-through-lock proceed anyway; others 405, which `delete_tag`/
    /// `delete_manifest` already swallow (spec §4.F step 1).
    async fn unlock_all(&self, repository: &str, plan: &PurgePlan) {
        for tag in &plan.tags_to_delete {
            if tag.changeable.is_locked() {
                if let Err(e) = self
                    .client
                    .update_tag_attributes(repository, &tag.name, ChangeableAttributes::unlocked())
                    .await
                {
                    eprintln!("[WARN] failed to unlock {repository}:{}: {e}", tag.name);
                }
            }
        }
        for manifest in &plan.manifests_to_delete {
            if manifest.changeable.is_locked() {
                if let Err(e) = self
                    .client
                    .update_manifest_attributes(
                        repository,
                        &manifest.digest,
                        ChangeableAttributes::unlocked(),
                    )
                    .await
                {
                    eprintln!(
                        "[WARN] failed to unlock {repository}@{}: {e}",
                        manifest.digest
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ChangeableAttributes, Manifest, Tag};

    fn sample_plan() -> PurgePlan {
        PurgePlan {
            repository: "repo".to_string(),
            tags_to_delete: vec![Tag {
                name: "old".to_string(),
                digest: "sha256:a".to_string(),
                last_update_time: None,
                changeable: ChangeableAttributes::unlocked(),
            }],
            manifests_to_delete: vec![Manifest {
                digest: "sha256:b".to_string(),
                media_type: "application/vnd.oci.image.manifest.v1+json".to_string(),
                tags: vec![],
                last_update_time: None,
                changeable: ChangeableAttributes::unlocked(),
            }],
        }
    }

    #[tokio::test]
    async fn dry_run_reports_counts_without_deleting() {
        let mut server = mockito::Server::new_async().await;
        // No mocks registered: any network call would panic-via-error, proving
        // dry-run never hits the wire.
        let client = Arc::new(RegistryClient::new(&server.url(), None).unwrap());
        let retention = RetentionPolicy {
            dry_run: true,
            ..Default::default()
        };
        let purger = Purger::new(client, &retention, 2);
        let result = purger.execute(sample_plan()).await;
        assert_eq!(result.deleted_tags, 1);
        assert_eq!(result.deleted_manifests, 1);
        server.reset();
    }

    #[tokio::test]
    async fn execute_deletes_tags_then_manifests() {
        let mut server = mockito::Server::new_async().await;
        let tag_mock = server
            .mock("DELETE", "/acr/v1/repo/_tags/old")
            .with_status(202)
            .create_async()
            .await;
        let manifest_mock = server
            .mock("DELETE", "/v2/repo/manifests/sha256:b")
            .with_status(202)
            .create_async()
            .await;

        let client = Arc::new(RegistryClient::new(&server.url(), None).unwrap());
        let retention = RetentionPolicy::default();
        let purger = Purger::new(client, &retention, 2);
        let result = purger.execute(sample_plan()).await;

        assert_eq!(result.deleted_tags, 1);
        assert_eq!(result.deleted_manifests, 1);
        assert!(result.first_error.is_none());
        tag_mock.assert_async().await;
        manifest_mock.assert_async().await;
    }

    #[tokio::test]
    async fn empty_plan_is_a_no_op() {
        let server = mockito::Server::new_async().await;
        let client = Arc::new(RegistryClient::new(&server.url(), None).unwrap());
        let retention = RetentionPolicy::default();
        let purger = Purger::new(client, &retention, 2);
        let result = purger
            .execute(PurgePlan {
                repository: "repo".to_string(),
                ..Default::default()
            })
            .await;
        assert_eq!(result.deleted_tags, 0);
        assert_eq!(result.deleted_manifests, 0);
    }
}
