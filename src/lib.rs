//! # circle-rerun
//!
//! Check CircleCI build status for the branch you are standing on and
//! re-run the tests a failed build reported, locally.
//!
//! This library backs the `crr` CLI tool. The pieces:
//!
//! - **API Client**: [`CircleClient`] for the CircleCI v1.1 API
//! - **Git Context**: [`GitContext`] reads the commit, branch, and project
//!   from the local checkout
//! - **Analyzers**: [`AnalyzerRegistry`] dispatches a failed action's
//!   output to the first [`Analyzer`] that claims it, producing
//!   [`FailureRecord`]s
//! - **Re-runs**: [`RunCommand`] is the local command that re-runs exactly
//!   the failed tests
//!
//! ## Quick Start
//!
//! ```no_run
//! # use anyhow::Result;
//! # async fn example() -> Result<()> {
//! use circle_rerun::{report, AnalyzerRegistry, CircleClient, Project};
//!
//! let client = CircleClient::new("your-token")?;
//! let project = Project::new("fastmonkeys", "pelsu");
//!
//! // Newest build on a branch.
//! let builds = client.list_builds(&project, 100, 0, None).await?;
//! let build = builds
//!     .iter()
//!     .find(|b| b.branch.as_deref() == Some("main"))
//!     .ok_or_else(|| anyhow::anyhow!("no build for branch"))?;
//!
//! // On failure, pull out the failing tests and their re-run commands.
//! if build.is_failed() {
//!     let registry = AnalyzerRegistry::new();
//!     let analyzed =
//!         report::analyze_failed_actions(&client, &registry, &project, build).await?;
//!     for step in &analyzed {
//!         for record in step.records() {
//!             println!("{}", report::failure_line(record));
//!         }
//!         if let Some(command) = step.rerun_command() {
//!             println!("{}", command);
//!         }
//!     }
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Error Handling
//!
//! Boundary failures are typed as [`CircleRerunError`]; application code
//! returns `anyhow::Result` and carries them in the chain. Failure output
//! that cannot be parsed is never an error: each bad section becomes a
//! [`SectionParseError`] value next to the records that did parse.

pub mod analyzer;
pub mod api;
pub mod error;
pub mod git;
pub mod report;

pub use analyzer::{
    AnalyzedStep, Analyzer, AnalyzerRegistry, FailureRecord, PytestAnalyzer, RunCommand,
    SectionErrorKind, SectionParseError, SectionResult,
};
pub use api::{Action, Build, CircleClient, Project, Step};
pub use error::CircleRerunError;
pub use git::{parse_remote_url, GitContext};
