use chrono::{DateTime, Duration, Utc};
use clap::Parser;

use crate::error::PurgeError;
use crate::models::{Credential, FilterPolicy, RetentionPolicy};

/// Parses a compound duration string such as `"30d"` or `"2h30m"` (spec §6
/// `--ago <duration>`). Recognizes `d` (days), `h` (hours), and `m`
/// (minutes) suffixes, each optional, summed together; at least one
/// component is required.
fn parse_duration(input: &str) -> Result<Duration, PurgeError> {
    let mut total = Duration::zero();
    let mut digits = String::new();
    let mut saw_component = false;

    for ch in input.chars() {
        if ch.is_ascii_digit() {
            digits.push(ch);
            continue;
        }
        if digits.is_empty() {
            return Err(PurgeError::InvalidFilter(format!(
                "malformed duration {input:?}: expected digits before unit {ch:?}"
            )));
        }
        let amount: i64 = digits.parse().map_err(|_| {
            PurgeError::InvalidFilter(format!("malformed duration {input:?}: number overflow"))
        })?;
        digits.clear();
        total = total
            + match ch {
                'd' => Duration::days(amount),
                'h' => Duration::hours(amount),
                'm' => Duration::minutes(amount),
                other => {
                    return Err(PurgeError::InvalidFilter(format!(
                        "malformed duration {input:?}: unknown unit {other:?}"
                    )))
                }
            };
        saw_component = true;
    }

    if !digits.is_empty() || !saw_component {
        return Err(PurgeError::InvalidFilter(format!(
            "malformed duration {input:?}: expected a trailing unit (d/h/m)"
        )));
    }

    Ok(total)
}

/// acr-purge — concurrent purge administrator for OCI-compatible registries
#[derive(Parser, Debug)]
#[command(name = "acr-purge", version, about)]
pub struct Cli {
    /// Registry host, e.g. myregistry.azurecr.io
    #[arg(long, env = "ACR_PURGE_REGISTRY")]
    pub registry: String,

    /// Repository name (repeatable). Omit to process every repository in
    /// the catalog. Mutually exclusive with --filter-file.
    #[arg(long = "filter")]
    pub filters: Vec<String>,

    /// Path to a filter policy file (spec "Filter policy file" shape:
    /// {version, repositories: [...]}). Overrides --filter when given.
    #[arg(long = "filter-file")]
    pub filter_file: Option<String>,

    /// Delete tags/manifests last updated more than this long ago, e.g.
    /// "30d" or "2h30m"
    #[arg(long)]
    pub ago: Option<String>,

    /// Keep the N most recently updated tags per repository, delete the rest
    #[arg(long, default_value_t = 0)]
    pub keep: usize,

    /// Only consider untagged manifests for deletion
    #[arg(long, default_value_t = false)]
    pub untagged: bool,

    /// Unlock locked tags/manifests before deleting them
    #[arg(long, default_value_t = false)]
    pub include_locked: bool,

    /// Maximum concurrent requests against the registry
    #[arg(long)]
    pub concurrency: Option<usize>,

    /// Preview the plan without deleting anything
    #[arg(long, default_value_t = false)]
    pub dry_run: bool,

    /// Username for basic/refresh-token auth
    #[arg(long, env = "ACR_PURGE_USERNAME")]
    pub username: Option<String>,

    /// Password or refresh token for auth
    #[arg(long, env = "ACR_PURGE_PASSWORD")]
    pub password: Option<String>,

    /// Verbose output
    #[arg(short, long, default_value_t = false)]
    pub verbose: bool,
}

impl Cli {
    pub fn credential(&self) -> Option<Credential> {
        match (&self.username, &self.password) {
            (Some(username), Some(password)) => Some(Credential {
                username: username.clone(),
                password: password.clone(),
            }),
            (None, Some(password)) => Some(Credential {
                username: String::new(),
                password: password.clone(),
            }),
            _ => None,
        }
    }

    /// Builds the [`FilterPolicy`] from `--filter-file`, or from the
    /// repeatable `--filter repo[:pattern]` flags, or a catch-all
    /// `*:*` when neither is given (spec §6 "no --repo means every
    /// repository in the catalog").
    pub fn filter_policy(&self) -> anyhow::Result<FilterPolicy> {
        if let Some(path) = &self.filter_file {
            let contents = std::fs::read_to_string(path)?;
            let policy: FilterPolicy = serde_json::from_str(&contents).map_err(|e| {
                PurgeError::InvalidFilter(format!("malformed filter policy file {path:?}: {e}"))
            })?;
            return Ok(policy);
        }

        if self.filters.is_empty() {
            return Ok(FilterPolicy::single("*", "*"));
        }

        let repositories = self
            .filters
            .iter()
            .map(|raw| match raw.split_once(':') {
                Some((repo, pattern)) => crate::models::FilterEntry {
                    repository: repo.to_string(),
                    tags: vec![pattern.to_string()],
                    enabled: true,
                },
                None => crate::models::FilterEntry {
                    repository: raw.clone(),
                    tags: vec!["*".to_string()],
                    enabled: true,
                },
            })
            .collect();

        Ok(FilterPolicy {
            version: "v1".to_string(),
            repositories,
        })
    }

    pub fn retention_policy(&self) -> anyhow::Result<RetentionPolicy> {
        let age_cutoff: Option<DateTime<Utc>> = self
            .ago
            .as_deref()
            .map(parse_duration)
            .transpose()?
            .map(|d| Utc::now() - d);

        Ok(RetentionPolicy {
            age_cutoff,
            keep: self.keep,
            untagged_only: self.untagged,
            include_locked: self.include_locked,
            dry_run: self.dry_run,
        })
    }

    pub fn resolved_concurrency(&self) -> usize {
        self.concurrency.unwrap_or_else(num_cpus::get)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_policy_defaults_to_wildcard_when_nothing_given() {
        let cli = Cli::parse_from(["acr-purge", "--registry", "r.azurecr.io"]);
        let policy = cli.filter_policy().unwrap();
        assert_eq!(policy.repositories.len(), 1);
        assert_eq!(policy.repositories[0].repository, "*");
    }

    #[test]
    fn filter_policy_splits_repo_and_pattern() {
        let cli = Cli::parse_from([
            "acr-purge",
            "--registry",
            "r.azurecr.io",
            "--filter",
            "myrepo:v*",
        ]);
        let policy = cli.filter_policy().unwrap();
        assert_eq!(policy.repositories[0].repository, "myrepo");
        assert_eq!(policy.repositories[0].tags, vec!["v*".to_string()]);
    }

    #[test]
    fn credential_requires_password_at_minimum() {
        let cli = Cli::parse_from(["acr-purge", "--registry", "r.azurecr.io"]);
        assert!(cli.credential().is_none());
    }

    #[test]
    fn filter_policy_rejects_malformed_filter_file_as_invalid_filter() {
        let mut path = std::env::temp_dir();
        path.push(format!("acr-purge-test-{}.json", std::process::id()));
        std::fs::write(&path, "{ not json").unwrap();

        let cli = Cli::parse_from([
            "acr-purge",
            "--registry",
            "r.azurecr.io",
            "--filter-file",
            path.to_str().unwrap(),
        ]);
        let err = cli.filter_policy().unwrap_err();
        let _ = std::fs::remove_file(&path);
        assert!(err.downcast_ref::<PurgeError>().map(|e| matches!(e, PurgeError::InvalidFilter(_))).unwrap_or(false));
    }

    #[test]
    fn parse_duration_handles_days_only() {
        assert_eq!(parse_duration("30d").unwrap(), Duration::days(30));
    }

    #[test]
    fn parse_duration_handles_compound_hours_minutes() {
        assert_eq!(
            parse_duration("2h30m").unwrap(),
            Duration::hours(2) + Duration::minutes(30)
        );
    }

    #[test]
    fn parse_duration_rejects_unknown_unit() {
        assert!(parse_duration("30x").is_err());
    }

    #[test]
    fn parse_duration_rejects_missing_unit() {
        assert!(parse_duration("30").is_err());
    }

    #[test]
    fn retention_policy_applies_ago_as_cutoff() {
        let cli = Cli::parse_from([
            "acr-purge",
            "--registry",
            "r.azurecr.io",
            "--ago",
            "1d",
        ]);
        let retention = cli.retention_policy().unwrap();
        assert!(retention.age_cutoff.is_some());
        assert!(retention.age_cutoff.unwrap() < Utc::now());
    }

    #[test]
    fn retention_policy_rejects_malformed_ago() {
        let cli = Cli::parse_from([
            "acr-purge",
            "--registry",
            "r.azurecr.io",
            "--ago",
            "nonsense",
        ]);
        assert!(cli.retention_policy().is_err());
    }
}
