use anyhow::{anyhow, ensure, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;

use aigate_core::{
    select_tier, CommitSha, EventRepository, Provider, PullRequestAction, PullRequestEvent,
    TierThresholds,
};

/// aigate: operator tooling for the pull request analysis service
#[derive(Parser, Debug)]
#[command(name = "aigate")]
#[command(about = "Operator tooling for the aigate service", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Re-run the analysis of a pull request on a running server
    Rerun(RerunArgs),
    /// Show which queue tier a change of the given size is sent to
    Tier(TierArgs),
}

#[derive(Parser, Debug)]
struct RerunArgs {
    /// Base URL of the aigate server
    #[arg(long, default_value = "http://localhost:3000")]
    server: String,

    /// Re-run token (if not provided, will use AIGATE_RERUN_TOKEN environment variable)
    #[arg(long)]
    token: Option<String>,

    /// Provider hosting the repository
    #[arg(long, default_value = "github", value_parser = ["github", "bitbucket", "azure_devops"])]
    provider: String,

    /// Provider's repository id
    #[arg(long)]
    repository_id: String,

    /// Repository owner (organization, workspace or project)
    #[arg(long)]
    owner: String,

    /// Repository name
    #[arg(long)]
    name: String,

    /// Clone URL; defaults to the GitHub URL for owner/name
    #[arg(long)]
    clone_url: Option<String>,

    /// GitHub App installation id
    #[arg(long)]
    installation_id: Option<u64>,

    /// Pull request number
    #[arg(long)]
    pr: u64,

    /// Base commit SHA
    #[arg(long)]
    base: String,

    /// Head commit SHA
    #[arg(long)]
    head: String,

    /// If set, print the request instead of sending it
    #[arg(long)]
    dry_run: bool,
}

#[derive(Parser, Debug)]
struct TierArgs {
    /// Estimated changed text lines
    lines: u64,

    #[arg(long, default_value_t = TierThresholds::default().small)]
    small: u64,

    #[arg(long, default_value_t = TierThresholds::default().medium)]
    medium: u64,

    #[arg(long, default_value_t = TierThresholds::default().large)]
    large: u64,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Rerun(args) => rerun(args),
        Commands::Tier(args) => tier(args),
    }
}

fn rerun_event(args: &RerunArgs) -> Result<PullRequestEvent> {
    let provider: Provider = args.provider.parse().map_err(|e: String| anyhow!(e))?;
    let clone_url = args
        .clone_url
        .clone()
        .unwrap_or_else(|| format!("https://github.com/{}/{}.git", args.owner, args.name));

    let event = PullRequestEvent {
        provider,
        action: PullRequestAction::Synchronize,
        merged: false,
        repository: EventRepository {
            external_id: args.repository_id.clone(),
            owner: args.owner.clone(),
            name: args.name.clone(),
            clone_url,
        },
        installation_id: args.installation_id,
        pr_number: args.pr,
        base_sha: CommitSha(args.base.clone()),
        head_sha: CommitSha(args.head.clone()),
        correlation_id: None,
    };
    ensure!(
        event.has_well_formed_shas(),
        "--base and --head must be hex commit SHAs"
    );
    Ok(event)
}

fn rerun(args: RerunArgs) -> Result<()> {
    let event = rerun_event(&args)?;

    if args.dry_run {
        println!("POST {}/rerun", args.server.trim_end_matches('/'));
        println!("{}", serde_json::to_string_pretty(&event)?);
        return Ok(());
    }

    let token = match args.token {
        Some(token) => token,
        None => std::env::var("AIGATE_RERUN_TOKEN")
            .context("No token provided. Use --token or set AIGATE_RERUN_TOKEN")?,
    };

    let url = format!("{}/rerun", args.server.trim_end_matches('/'));
    eprintln!(
        "Re-running PR #{} in {}/{} at {}...",
        event.pr_number,
        event.repository.owner,
        event.repository.name,
        event.head_sha.short()
    );

    let response = reqwest::blocking::Client::new()
        .post(&url)
        .bearer_auth(token)
        .json(&event)
        .send()
        .context("Failed to send re-run request")?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().unwrap_or_default();
        return Err(anyhow!("Server returned {}: {}", status, body));
    }

    let body: Value = response.json().context("Failed to parse re-run response")?;
    if body["success"].as_bool() == Some(true) {
        println!("Analysis completed successfully");
        Ok(())
    } else {
        Err(anyhow!(
            "Analysis failed; see the check run on the pull request for details"
        ))
    }
}

fn tier(args: TierArgs) -> Result<()> {
    let thresholds = TierThresholds {
        small: args.small,
        medium: args.medium,
        large: args.large,
    };
    if !thresholds.is_ascending() {
        return Err(anyhow!("Thresholds must satisfy small <= medium <= large"));
    }
    let tier = select_tier(args.lines, &thresholds)?;
    println!("{}", tier);
    Ok(())
}
