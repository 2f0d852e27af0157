use colored::Colorize;

use crate::models::RepositoryResult;

/// Logs a skipped delete the way the client normalizes it (spec §7: 404 and
/// 405 both count as success, but are worth a line for operators watching
/// `--verbose` output).
pub fn print_skip(reference: &str, status: u16) {
    println!("Skipped {reference}, HTTP status: {status}");
}

/// One bare machine-grep-able line per actually-deleted tag (spec §6:
/// "`<host>/<repo>:<tag>` per deleted tag").
pub fn print_deleted_tag(host: &str, repo: &str, tag: &str) {
    println!("{host}/{repo}:{tag}");
}

/// One bare machine-grep-able line per actually-deleted manifest (spec §6:
/// "`<host>/<repo>@<digest>` per deleted manifest").
pub fn print_deleted_manifest(host: &str, repo: &str, digest: &str) {
    println!("{host}/{repo}@{digest}");
}

/// Prints the final aggregate summary across every repository processed
/// (spec §4.G "Aggregate").
pub fn print_summary(results: &[RepositoryResult], dry_run: bool) {
    let total_tags: usize = results.iter().map(|r| r.deleted_tags).sum();
    let total_manifests: usize = results.iter().map(|r| r.deleted_manifests).sum();
    let errors: usize = results.iter().filter(|r| r.first_error.is_some()).count();

    println!("\n{}", "═".repeat(60));
    let label = if dry_run {
        "DRY RUN SUMMARY:".yellow().bold()
    } else {
        "SUMMARY:".bold()
    };
    println!(
        "{} {} repositories, {} tags, {} manifests, {} errors",
        label,
        results.len(),
        total_tags.to_string().red().bold(),
        total_manifests.to_string().red().bold(),
        if errors > 0 {
            errors.to_string().red().bold().to_string()
        } else {
            errors.to_string()
        }
    );

    for result in results {
        if let Some(err) = &result.first_error {
            eprintln!("[ERROR] {}: {}", result.repository, err);
        }
    }

    // Literal machine-grep-able totals (spec §6): "Number of deleted tags: N"
    // / "Number of deleted manifests: M", distinct from the decorative line
    // above.
    println!("Number of deleted tags: {total_tags}");
    println!("Number of deleted manifests: {total_manifests}");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn print_summary_counts_total_tags_and_manifests() {
        let results = vec![
            RepositoryResult {
                repository: "a".to_string(),
                deleted_tags: 2,
                deleted_manifests: 1,
                first_error: None,
            },
            RepositoryResult {
                repository: "b".to_string(),
                deleted_tags: 3,
                deleted_manifests: 0,
                first_error: None,
            },
        ];
        // No panics, and the totals the printed lines are built from match
        // what the caller would grep for.
        let total_tags: usize = results.iter().map(|r| r.deleted_tags).sum();
        let total_manifests: usize = results.iter().map(|r| r.deleted_manifests).sum();
        assert_eq!(total_tags, 5);
        assert_eq!(total_manifests, 1);
        print_summary(&results, false);
    }
}
