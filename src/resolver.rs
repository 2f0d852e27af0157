//! Dependency resolver (spec §4.C): computes the set of manifest digests
//! that must never be deleted because something reachable from a surviving
//! tag still depends on them — index children, `subject` referrers, and the
//! digests tags still point at.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::Mutex;

use crate::client::RegistryClient;
use crate::error::Result;
use crate::models::{is_artifact_media_type, is_index_media_type, Digest, ManifestBody};

/// The set of digests that must survive a purge regardless of the planner's
/// kill-list candidates (spec §4.C "ForbiddenSet").
#[derive(Debug, Default, Clone)]
pub struct ForbiddenSet {
    digests: HashSet<Digest>,
}

impl ForbiddenSet {
    pub fn contains(&self, digest: &str) -> bool {
        self.digests.contains(digest)
    }

    pub fn len(&self) -> usize {
        self.digests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.digests.is_empty()
    }
}

/// Resolves the forbidden set for one repository.
///
/// `surviving_tag_digests` are the digests tags will still point at after
/// the tag kill-list is applied; `candidate_manifests` are the digests the
/// planner is considering for deletion (only these need their bodies
/// fetched, since only they could turn out to be protected dependencies of
/// something that survives).
pub struct DependencyResolver<'a> {
    client: &'a RegistryClient,
    repository: &'a str,
}

impl<'a> DependencyResolver<'a> {
    pub fn new(client: &'a RegistryClient, repository: &'a str) -> Self {
        Self { client, repository }
    }

    pub async fn resolve(
        &self,
        surviving_tag_digests: &[Digest],
        candidate_manifests: &[Digest],
    ) -> Result<ForbiddenSet> {
        let mut forbidden: HashSet<Digest> = surviving_tag_digests.iter().cloned().collect();

        let candidate_media_types = self.fetch_media_types(candidate_manifests).await?;

        let referrer_protections = self
            .protect_referrers_whose_subject_survives(candidate_manifests, &candidate_media_types)
            .await?;
        forbidden.extend(referrer_protections);

        let dependencies = self.expand_dependencies(surviving_tag_digests).await?;
        forbidden.extend(dependencies);

        Ok(ForbiddenSet { digests: forbidden })
    }

    /// Implements spec §4.D.2 step 3: a candidate referrer manifest (one
    /// carrying a `subject`) is retained — not deleted — while its subject
    /// still exists, since deleting it would silently break referrer
    /// discovery for the subject it describes. A referrer whose subject is
    /// itself also a deletion candidate is not protected by this rule (it
    /// may still be protected separately if its subject is a surviving
    /// manifest for some other reason). 404 during resolution is non-fatal
    /// per spec §9 — the manifest may already be gone, in which case it
    /// protects nothing.
    async fn protect_referrers_whose_subject_survives(
        &self,
        candidates: &[Digest],
        media_types: &HashMap<Digest, String>,
    ) -> Result<HashSet<Digest>> {
        let candidate_set: HashSet<&str> = candidates.iter().map(String::as_str).collect();
        let mut protected = HashSet::new();
        for digest in candidates {
            let is_artifact = media_types
                .get(digest)
                .map(|mt| is_artifact_media_type(mt))
                .unwrap_or(false);
            if !is_artifact {
                continue;
            }
            match self.fetch_body(digest).await {
                Ok(Some(body)) => {
                    if let Some(subject) = body.subject {
                        if !candidate_set.contains(subject.digest.as_str()) {
                            protected.insert(digest.clone());
                        }
                    }
                }
                Ok(None) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }
        Ok(protected)
    }

    /// BFS over every dependency edge reachable from the given roots: index
    /// children (`manifests[]`) *and* the `subject` edge (spec §4.C.1 index
    /// expansion, §4.C.3 "transitively close step 4.C.1 starting from those
    /// digests" — the subject a surviving manifest points at must survive
    /// too, per spec invariant 3: "for every OCI manifest M with
    /// subject=S ... S is not in the kill list"). Uses a concurrent seen-set
    /// so repeated fan-in digests are fetched at most once and cycles
    /// terminate (spec §4.C "cycle guard").
    async fn expand_dependencies(&self, roots: &[Digest]) -> Result<HashSet<Digest>> {
        let seen: Arc<Mutex<HashSet<Digest>>> = Arc::new(Mutex::new(HashSet::new()));
        let mut frontier: Vec<Digest> = roots.to_vec();
        let mut discovered = HashSet::new();

        while !frontier.is_empty() {
            let mut next_frontier = Vec::new();
            for digest in frontier.drain(..) {
                {
                    let mut seen = seen.lock().await;
                    if !seen.insert(digest.clone()) {
                        continue;
                    }
                }
                match self.fetch_body(&digest).await {
                    Ok(Some(body)) => {
                        for child in body.manifests {
                            discovered.insert(child.digest.clone());
                            next_frontier.push(child.digest);
                        }
                        if let Some(subject) = body.subject {
                            discovered.insert(subject.digest.clone());
                            next_frontier.push(subject.digest);
                        }
                    }
                    Ok(None) => {}
                    Err(e) if e.is_not_found() => {}
                    Err(e) => return Err(e),
                }
            }
            frontier = next_frontier;
        }

        Ok(discovered)
    }

    async fn fetch_media_types(&self, digests: &[Digest]) -> Result<HashMap<Digest, String>> {
        let mut out = HashMap::new();
        for digest in digests {
            if let Ok(Some(body)) = self.fetch_body_with_media_type(digest).await {
                out.insert(digest.clone(), body);
            }
        }
        Ok(out)
    }

    async fn fetch_body_with_media_type(&self, digest: &str) -> Result<Option<String>> {
        match self.client.get_manifest_bytes(self.repository, digest).await {
            Ok(bytes) => {
                let value: Value = serde_json::from_slice(&bytes)?;
                Ok(value
                    .get("mediaType")
                    .and_then(Value::as_str)
                    .map(|s| s.to_string()))
            }
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Returns `None` on 404 (non-fatal per spec §9), `Some(body)` on a
    /// parseable manifest document. A non-index, non-artifact manifest
    /// parses to an empty [`ManifestBody`] and contributes nothing.
    async fn fetch_body(&self, digest: &str) -> Result<Option<ManifestBody>> {
        match self.client.get_manifest_bytes(self.repository, digest).await {
            Ok(bytes) => {
                let value: Value = serde_json::from_slice(&bytes)?;
                let media_type = value.get("mediaType").and_then(Value::as_str).unwrap_or("");
                if !is_index_media_type(media_type) && !is_artifact_media_type(media_type) {
                    return Ok(Some(ManifestBody::default()));
                }
                let body: ManifestBody = serde_json::from_value(value)?;
                Ok(Some(body))
            }
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn forbidden_set_includes_index_children() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/v2/repo/manifests/sha256:index")
            .with_status(200)
            .with_body(
                r#"{"mediaType":"application/vnd.oci.image.index.v1+json","manifests":[{"digest":"sha256:child","mediaType":"application/vnd.oci.image.manifest.v1+json"}]}"#,
            )
            .create_async()
            .await;
        server
            .mock("GET", "/v2/repo/manifests/sha256:child")
            .with_status(200)
            .with_body(r#"{"mediaType":"application/vnd.oci.image.manifest.v1+json"}"#)
            .create_async()
            .await;

        let client = RegistryClient::new(&server.url(), None).unwrap();
        let resolver = DependencyResolver::new(&client, "repo");
        let forbidden = resolver
            .resolve(&["sha256:index".to_string()], &[])
            .await
            .unwrap();

        assert!(forbidden.contains("sha256:index"));
        assert!(forbidden.contains("sha256:child"));
    }

    #[tokio::test]
    async fn forbidden_set_protects_subject_of_a_surviving_referrer() {
        // tag v1 -> sig (surviving); sig.subject = img (untagged elsewhere).
        // Deleting img would orphan the still-tagged referrer sig, so
        // resolving from sig's digest must pull img into the forbidden set.
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/v2/repo/manifests/sha256:sig")
            .with_status(200)
            .with_body(
                r#"{"mediaType":"application/vnd.oci.artifact.manifest.v1+json","subject":{"digest":"sha256:img","mediaType":"application/vnd.oci.image.manifest.v1+json"}}"#,
            )
            .create_async()
            .await;
        server
            .mock("GET", "/v2/repo/manifests/sha256:img")
            .with_status(200)
            .with_body(r#"{"mediaType":"application/vnd.oci.image.manifest.v1+json"}"#)
            .create_async()
            .await;

        let client = RegistryClient::new(&server.url(), None).unwrap();
        let resolver = DependencyResolver::new(&client, "repo");
        let forbidden = resolver
            .resolve(
                &["sha256:sig".to_string()],
                &["sha256:img".to_string()],
            )
            .await
            .unwrap();

        assert!(
            forbidden.contains("sha256:img"),
            "img must be protected: it is the subject of the still-tagged referrer sig"
        );
    }

    #[tokio::test]
    async fn forbidden_set_protects_referrer_whose_subject_survives() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/v2/repo/manifests/sha256:artifact")
            .with_status(200)
            .with_body(
                r#"{"mediaType":"application/vnd.oci.artifact.manifest.v1+json","subject":{"digest":"sha256:base","mediaType":"application/vnd.oci.image.manifest.v1+json"}}"#,
            )
            .create_async()
            .await;

        let client = RegistryClient::new(&server.url(), None).unwrap();
        let resolver = DependencyResolver::new(&client, "repo");
        let forbidden = resolver
            .resolve(&[], &["sha256:artifact".to_string()])
            .await
            .unwrap();

        assert!(forbidden.contains("sha256:artifact"));
    }

    #[tokio::test]
    async fn forbidden_set_does_not_protect_referrer_when_subject_also_deleted() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/v2/repo/manifests/sha256:artifact")
            .with_status(200)
            .with_body(
                r#"{"mediaType":"application/vnd.oci.artifact.manifest.v1+json","subject":{"digest":"sha256:base","mediaType":"application/vnd.oci.image.manifest.v1+json"}}"#,
            )
            .create_async()
            .await;

        let client = RegistryClient::new(&server.url(), None).unwrap();
        let resolver = DependencyResolver::new(&client, "repo");
        let forbidden = resolver
            .resolve(
                &[],
                &["sha256:artifact".to_string(), "sha256:base".to_string()],
            )
            .await
            .unwrap();

        assert!(!forbidden.contains("sha256:artifact"));
    }

    #[tokio::test]
    async fn missing_manifest_during_resolution_is_non_fatal() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/v2/repo/manifests/sha256:gone")
            .with_status(404)
            .create_async()
            .await;

        let client = RegistryClient::new(&server.url(), None).unwrap();
        let resolver = DependencyResolver::new(&client, "repo");
        let forbidden = resolver
            .resolve(&["sha256:gone".to_string()], &[])
            .await
            .unwrap();

        assert!(forbidden.contains("sha256:gone"));
        assert_eq!(forbidden.len(), 1);
    }
}
