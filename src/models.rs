use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Content digest, e.g. `sha256:c5b1261d...`. The registry's primary key for
/// manifest bytes; multiple tags may share one.
pub type Digest = String;

/// `changeableAttributes` as returned by the ACR-style `_tags`/`_manifests`
/// endpoints. Controls whether delete/write operations are permitted
/// server-side (spec §3 invariant 2, §4.F unlock-before-delete).
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
pub struct ChangeableAttributes {
    #[serde(rename = "deleteEnabled", default = "default_true")]
    pub delete_enabled: bool,
    #[serde(rename = "writeEnabled", default = "default_true")]
    pub write_enabled: bool,
}

fn default_true() -> bool {
    true
}

impl ChangeableAttributes {
    pub fn unlocked() -> Self {
        Self {
            delete_enabled: true,
            write_enabled: true,
        }
    }

    /// True when either flag blocks modification (spec GLOSSARY "Lock").
    pub fn is_locked(&self) -> bool {
        !self.delete_enabled || !self.write_enabled
    }
}

/// A single tag entry as enumerated by `/acr/v1/<repo>/_tags` (spec §3 "Tag").
#[derive(Debug, Clone, Deserialize)]
pub struct Tag {
    pub name: String,
    pub digest: Digest,
    #[serde(rename = "lastUpdateTime")]
    pub last_update_time: Option<DateTime<Utc>>,
    #[serde(rename = "changeableAttributes", default = "ChangeableAttributes::unlocked")]
    pub changeable: ChangeableAttributes,
}

/// A child descriptor inside a manifest-list/index document (spec §3 "Index").
#[derive(Debug, Clone, Deserialize)]
pub struct ManifestDescriptor {
    pub digest: Digest,
    #[serde(rename = "mediaType")]
    pub media_type: String,
}

/// Minimal parse of a manifest/index/artifact document body, just enough to
/// walk the dependency graphs in spec §4.C. Unknown fields are ignored.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ManifestBody {
    #[serde(default)]
    pub manifests: Vec<ManifestDescriptor>,
    #[serde(default)]
    pub subject: Option<ManifestDescriptor>,
}

/// A single manifest entry as enumerated by `/acr/v1/<repo>/_manifests`
/// (spec §3 "Manifest").
#[derive(Debug, Clone, Deserialize)]
pub struct Manifest {
    pub digest: Digest,
    #[serde(rename = "mediaType")]
    pub media_type: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(rename = "lastUpdateTime")]
    pub last_update_time: Option<DateTime<Utc>>,
    #[serde(rename = "changeableAttributes", default = "ChangeableAttributes::unlocked")]
    pub changeable: ChangeableAttributes,
}

pub const MEDIA_TYPE_DOCKER_MANIFEST_V2: &str =
    "application/vnd.docker.distribution.manifest.v2+json";
pub const MEDIA_TYPE_DOCKER_MANIFEST_LIST: &str =
    "application/vnd.docker.distribution.manifest.list.v2+json";
pub const MEDIA_TYPE_OCI_IMAGE_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
pub const MEDIA_TYPE_OCI_IMAGE_INDEX: &str = "application/vnd.oci.image.index.v1+json";
pub const MEDIA_TYPE_OCI_ARTIFACT_MANIFEST: &str = "application/vnd.oci.artifact.manifest.v1+json";
pub const MEDIA_TYPE_ORAS_ARTIFACT_MANIFEST: &str =
    "application/vnd.cncf.oras.artifact.manifest.v1+json";

/// All media types the client asks for via `Accept` when fetching manifest
/// bytes (spec §4.A `GetManifestBytes`, §6 "Manifest media types").
pub const ALL_MANIFEST_MEDIA_TYPES: &[&str] = &[
    MEDIA_TYPE_OCI_IMAGE_MANIFEST,
    MEDIA_TYPE_OCI_IMAGE_INDEX,
    MEDIA_TYPE_DOCKER_MANIFEST_V2,
    MEDIA_TYPE_DOCKER_MANIFEST_LIST,
    MEDIA_TYPE_OCI_ARTIFACT_MANIFEST,
    MEDIA_TYPE_ORAS_ARTIFACT_MANIFEST,
];

/// True when `media_type` identifies a manifest-list / image-index (spec
/// §3 "Index/List", §6).
pub fn is_index_media_type(media_type: &str) -> bool {
    media_type == MEDIA_TYPE_DOCKER_MANIFEST_LIST || media_type == MEDIA_TYPE_OCI_IMAGE_INDEX
}

/// True when `media_type` identifies an OCI/ORAS artifact manifest, which
/// may carry a `subject` (spec §3 "Artifact").
pub fn is_artifact_media_type(media_type: &str) -> bool {
    media_type == MEDIA_TYPE_OCI_ARTIFACT_MANIFEST || media_type == MEDIA_TYPE_ORAS_ARTIFACT_MANIFEST
}

/// Opaque credential pair handed to the client (spec §1: "the core treats
/// credentials as an opaque `{username, password}`"). Loading these from a
/// Docker/OCI credential store is explicitly out of core scope.
#[derive(Debug, Clone)]
pub struct Credential {
    pub username: String,
    pub password: String,
}

/// One entry of the filter policy file (spec §3 "Filter policy", §6 "Filter
/// policy file").
#[derive(Debug, Clone, Deserialize)]
pub struct FilterEntry {
    pub repository: String,
    #[serde(default = "default_tag_globs")]
    pub tags: Vec<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_tag_globs() -> Vec<String> {
    vec!["*".to_string()]
}

/// Top-level filter policy document: `{version, repositories: [...]}`.
#[derive(Debug, Clone, Deserialize)]
pub struct FilterPolicy {
    pub version: String,
    pub repositories: Vec<FilterEntry>,
}

impl FilterPolicy {
    /// Builds a single-repository, single-pattern policy directly from a
    /// `--filter repo:pattern` CLI argument, bypassing the policy file.
    pub fn single(repository: impl Into<String>, tag_pattern: impl Into<String>) -> Self {
        Self {
            version: "v1".to_string(),
            repositories: vec![FilterEntry {
                repository: repository.into(),
                tags: vec![tag_pattern.into()],
                enabled: true,
            }],
        }
    }
}

/// Retention policy (spec §3 "Retention policy").
#[derive(Debug, Clone)]
pub struct RetentionPolicy {
    pub age_cutoff: Option<DateTime<Utc>>,
    pub keep: usize,
    pub untagged_only: bool,
    pub include_locked: bool,
    pub dry_run: bool,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            age_cutoff: None,
            keep: 0,
            untagged_only: false,
            include_locked: false,
            dry_run: false,
        }
    }
}

/// Output of the Purge Planner (spec §4.D) for one repository: two ordered
/// kill lists, tags first.
#[derive(Debug, Default, Clone)]
pub struct PurgePlan {
    pub repository: String,
    pub tags_to_delete: Vec<Tag>,
    pub manifests_to_delete: Vec<Manifest>,
}

impl PurgePlan {
    pub fn is_empty(&self) -> bool {
        self.tags_to_delete.is_empty() && self.manifests_to_delete.is_empty()
    }
}

/// Aggregated result for one repository after the Purger has run (spec
/// §4.G "Aggregate").
#[derive(Debug, Default, Clone)]
pub struct RepositoryResult {
    pub repository: String,
    pub deleted_tags: usize,
    pub deleted_manifests: usize,
    pub first_error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn changeable_attributes_default_is_unlocked() {
        let attrs: ChangeableAttributes = serde_json::from_str("{}").unwrap();
        assert!(!attrs.is_locked());
    }

    #[test]
    fn changeable_attributes_locked_when_delete_disabled() {
        let attrs = ChangeableAttributes {
            delete_enabled: false,
            write_enabled: true,
        };
        assert!(attrs.is_locked());
    }

    #[test]
    fn is_index_media_type_recognizes_both_list_types() {
        assert!(is_index_media_type(MEDIA_TYPE_DOCKER_MANIFEST_LIST));
        assert!(is_index_media_type(MEDIA_TYPE_OCI_IMAGE_INDEX));
        assert!(!is_index_media_type(MEDIA_TYPE_DOCKER_MANIFEST_V2));
    }

    #[test]
    fn is_artifact_media_type_recognizes_oci_and_oras() {
        assert!(is_artifact_media_type(MEDIA_TYPE_OCI_ARTIFACT_MANIFEST));
        assert!(is_artifact_media_type(MEDIA_TYPE_ORAS_ARTIFACT_MANIFEST));
        assert!(!is_artifact_media_type(MEDIA_TYPE_OCI_IMAGE_MANIFEST));
    }

    #[test]
    fn filter_policy_single_builds_one_entry() {
        let policy = FilterPolicy::single("myrepo", "^v.*$");
        assert_eq!(policy.repositories.len(), 1);
        assert_eq!(policy.repositories[0].repository, "myrepo");
        assert_eq!(policy.repositories[0].tags, vec!["^v.*$".to_string()]);
    }

    #[test]
    fn filter_entry_defaults_to_wildcard_and_enabled() {
        let entry: FilterEntry = serde_json::from_str(r#"{"repository":"r"}"#).unwrap();
        assert_eq!(entry.tags, vec!["*".to_string()]);
        assert!(entry.enabled);
    }
}
