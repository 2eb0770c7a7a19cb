use std::path::Path;
use std::process;

use anyhow::Result;
use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use colored::*;

use circle_rerun::report;
use circle_rerun::{AnalyzerRegistry, Build, CircleClient, CircleRerunError, GitContext, Project};

#[derive(Parser)]
#[command(
    name = "circle-rerun",
    about = "Check CircleCI build status and re-run failed tests locally",
    long_about = r#"
Check the status of CircleCI builds for the repository you are standing in,
and re-run the tests a failed build reported, locally, without digging
through the CircleCI web UI.

Builds are looked up for the current branch by default; pass a build number
or --src/--branch to look elsewhere.
"#,
    version,
    after_help = r#"
EXAMPLES:
  # Status of the newest build on the current branch
  crr build

  # Status of a specific build
  crr build 1290

  # Re-run the tests that failed on CI, locally
  crr runfailed

  # Cancel / retry the newest build on this branch
  crr cancel
  crr retry

  # Another project or branch
  crr build --src fastmonkeys/pelsu --branch master

ENVIRONMENT:
  CIRCLECI_TOKEN    Your CircleCI API token (or pass --token)

EXIT CODES:
  0    Success
  1    Missing credentials, not a git repository, build not found, or API error
       (runfailed exits with the re-run's status when tests fail again)
"#
)]
struct Cli {
    /// CircleCI API token
    #[arg(long, env = "CIRCLECI_TOKEN", global = true, hide_env_values = true)]
    token: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct Target {
    /// Build number; defaults to the newest build on the branch
    build_id: Option<u32>,

    /// Project as OWNER/REPO; defaults to the origin remote
    #[arg(long, value_name = "OWNER/REPO")]
    src: Option<String>,

    /// Branch to look up; defaults to the checked-out branch
    #[arg(long)]
    branch: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the status of a build
    ///
    /// Prints the build's commit and a one-line lifecycle message. For a
    /// failed build, the failed steps are analyzed and each failed test is
    /// listed with the file and line it failed at; output no analyzer
    /// understands is shown raw.
    Build(Target),
    /// Re-run a failed build's tests locally
    ///
    /// Analyzes the failed steps and runs, per step, a command that
    /// re-runs exactly the tests that failed on CI. Exits with the first
    /// failing re-run's status.
    Runfailed(Target),
    /// Cancel a build
    Cancel(Target),
    /// Retry a build
    Retry(Target),
    /// Bump a build to the front of the queue
    Prioritize,
    /// Show version information
    Version,
}

fn print_error(text: &str) {
    println!("{} {}", "✗".red().bold(), text.red());
}

fn print_success(text: &str) {
    println!("{} {}", "✓".green().bold(), text.green());
}

fn print_info(text: &str) {
    println!("{} {}", "→".yellow(), text);
}

fn client(token: Option<String>) -> Result<CircleClient> {
    let token = token.ok_or_else(|| {
        CircleRerunError::MissingCredential(
            "no CircleCI API token supplied\n  help: pass --token or set CIRCLECI_TOKEN"
                .to_string(),
        )
    })?;
    Ok(CircleClient::new(token)?)
}

fn resolve_project(src: Option<&str>) -> Result<Project> {
    match src {
        Some(src) => Ok(src.parse()?),
        None => GitContext::discover(Path::new("."))?.project(),
    }
}

/// Picks the build a command acts on: an explicit build number when given,
/// otherwise the newest build on the branch.
async fn resolve_build(client: &CircleClient, project: &Project, target: &Target) -> Result<Build> {
    if let Some(build_num) = target.build_id {
        return Ok(client.get_build(project, build_num).await?);
    }

    let branch = match &target.branch {
        Some(branch) => branch.clone(),
        None => GitContext::discover(Path::new("."))?.current_branch()?,
    };

    let builds = client.list_builds(project, 100, 0, None).await?;
    builds
        .into_iter()
        .find(|build| build.branch.as_deref() == Some(branch.as_str()))
        .ok_or_else(|| {
            CircleRerunError::BuildNotFound(format!(
                "no recent build for branch `{}` on {}\n  help: pass a build number, or --branch NAME",
                branch, project
            ))
            .into()
        })
}

async fn cmd_build(client: &CircleClient, target: &Target) -> Result<()> {
    let project = resolve_project(target.src.as_deref())?;
    let build = resolve_build(client, &project, target).await?;

    println!("{}", report::summary_line(&build));

    let message = report::describe_state(&build, Utc::now());
    if build.is_success() {
        print_success(&message);
    } else if build.is_failed() || build.is_infrastructure_fail() {
        print_error(&message);
    } else {
        print_info(&message);
    }

    if build.is_failed() {
        println!();
        let registry = AnalyzerRegistry::new();
        let analyzed = report::analyze_failed_actions(client, &registry, &project, &build).await?;

        for step in &analyzed {
            let command = step.action.command.as_deref().unwrap_or(&step.action.name);
            println!("Failed when running {}:", command);

            if step.has_records() {
                for section in &step.sections {
                    match section {
                        Ok(record) => println!("  {}", report::failure_line(record)),
                        Err(err) => println!("  {}", err.to_string().dimmed()),
                    }
                }
            } else if let Some(url) = &step.action.output_url {
                let output = client.get_output(url).await?;
                println!("{}", report::strip_ansi(&output));
            }
        }
    }

    if target.build_id.is_none() {
        if let Ok(git) = GitContext::discover(Path::new(".")) {
            if let Ok(head) = git.current_commit() {
                if head != build.vcs_revision {
                    print_info("warning: Your HEAD is different than CircleCI's");
                }
            }
        }
    }

    Ok(())
}

async fn cmd_runfailed(client: &CircleClient, target: &Target) -> Result<()> {
    let project = resolve_project(target.src.as_deref())?;
    let build = resolve_build(client, &project, target).await?;

    println!("{}", report::summary_line(&build));

    if !build.is_finished() {
        print_info("Build is not finished.");
        return Ok(());
    }
    if !build.is_failed() {
        print_info("Build didn't fail.");
        return Ok(());
    }

    let registry = AnalyzerRegistry::new();
    let analyzed = report::analyze_failed_actions(client, &registry, &project, &build).await?;

    let failed: usize = analyzed.iter().map(|step| step.records().count()).sum();
    println!("Failed {} tests.", failed);

    let mut exit_code = 0;
    for step in &analyzed {
        match step.rerun_command() {
            Some(command) => {
                println!("{}", command);
                let status = command.execute()?;
                if exit_code == 0 && !status.success() {
                    exit_code = status.code().unwrap_or(1);
                }
            }
            None => print_info(&format!("nothing to re-run for {}", step.action.name)),
        }
    }

    if exit_code != 0 {
        process::exit(exit_code);
    }
    Ok(())
}

async fn cmd_cancel(client: &CircleClient, target: &Target) -> Result<()> {
    let project = resolve_project(target.src.as_deref())?;
    let build = resolve_build(client, &project, target).await?;

    println!("{}", report::summary_line(&build));

    let canceled = client.cancel_build(&project, build.build_num).await?;
    print_info(&format!(
        "Build {} is now {}.",
        canceled.build_num, canceled.status
    ));

    Ok(())
}

async fn cmd_retry(client: &CircleClient, target: &Target) -> Result<()> {
    let project = resolve_project(target.src.as_deref())?;
    let build = resolve_build(client, &project, target).await?;

    println!("{}", report::summary_line(&build));

    let retried = client.retry_build(&project, build.build_num).await?;
    print_success(&format!("Retrying as build {}.", retried.build_num));
    print_info(&report::describe_state(&retried, Utc::now()));

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Build(target) => cmd_build(&client(cli.token)?, &target).await?,
        Commands::Runfailed(target) => cmd_runfailed(&client(cli.token)?, &target).await?,
        Commands::Cancel(target) => cmd_cancel(&client(cli.token)?, &target).await?,
        Commands::Retry(target) => cmd_retry(&client(cli.token)?, &target).await?,
        Commands::Prioritize => {
            // TODO: Implement queue prioritization
            println!("Build prioritization not yet implemented");
        }
        Commands::Version => {
            println!("circle-rerun {}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}
