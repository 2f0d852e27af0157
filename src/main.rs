use std::process;

use anyhow::Result;
use clap::Parser;

use acr_purge::cli::Cli;
use acr_purge::output::print_summary;
use acr_purge::{Orchestrator, RegistryClient};

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("Error: {:#}", e);
        process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();

    let policy = cli.filter_policy()?;
    let retention = cli.retention_policy()?;
    let concurrency = cli.resolved_concurrency();

    if cli.verbose {
        eprintln!("[DEBUG] Registry: {}", cli.registry);
        eprintln!("[DEBUG] Retention: {:?}", retention);
        eprintln!("[DEBUG] Concurrency: {concurrency}");
        eprintln!("[DEBUG] Dry run: {}", cli.dry_run);
    }

    let client = RegistryClient::with_options(&cli.registry, cli.credential(), cli.verbose)?;
    let orchestrator = Orchestrator::new(client, retention, concurrency);

    let results = orchestrator.run(&policy).await?;

    let had_errors = results.iter().any(|r| r.first_error.is_some());
    print_summary(&results, cli.dry_run);

    if had_errors {
        process::exit(1);
    }

    Ok(())
}
