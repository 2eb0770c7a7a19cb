//! Human-readable build reporting and failure-analysis orchestration.

use anyhow::Result;
use chrono::{DateTime, Utc};
use regex::Regex;

use crate::analyzer::{AnalyzedStep, AnalyzerRegistry, FailureRecord};
use crate::api::{Build, CircleClient, Project};

/// First line printed for any resolved build: abbreviated revision and
/// commit subject.
pub fn summary_line(build: &Build) -> String {
    format!(
        "{} {}",
        build.short_revision(),
        build.subject.as_deref().unwrap_or("")
    )
    .trim_end()
    .to_string()
}

/// One-sentence lifecycle message for a build.
///
/// `now` is passed in so running-build durations are stable under test.
pub fn describe_state(build: &Build, now: DateTime<Utc>) -> String {
    match build.lifecycle.as_str() {
        "queued" => "Your build is in the queue.".to_string(),
        "running" => match build.start_time {
            Some(started) => format!(
                "Your build has been running for {} minutes",
                minutes_between(started, now)
            ),
            None => "Your build is running.".to_string(),
        },
        "finished" => match build.outcome.as_deref().unwrap_or("") {
            "success" => "Your build was successful.".to_string(),
            "failed" => "Your build failed.".to_string(),
            "infrastructure_fail" => {
                "Your build failed due to infrastructure failure.".to_string()
            }
            other => format!("Your build was {}?", other),
        },
        other => format!("Your build seems to be {}?", other),
    }
}

/// One line locating a failed test.
///
/// When the failure was raised in the file the test came from, point at
/// the exact line; otherwise name the originating test file, which is the
/// file a re-run has to target.
pub fn failure_line(record: &FailureRecord) -> String {
    if record.fail_file == record.origin_file {
        format!(
            "{}:{} {}",
            record.fail_file, record.fail_line, record.method_name
        )
    } else {
        format!("{} {}", record.origin_file, record.method_name)
    }
}

/// Removes ANSI color codes from raw log output.
pub fn strip_ansi(text: &str) -> String {
    let ansi_re = Regex::new(r"\x1b\[[0-9;]*m").unwrap();
    ansi_re.replace_all(text, "").to_string()
}

fn minutes_between(start: DateTime<Utc>, now: DateTime<Utc>) -> i64 {
    let seconds = (now - start).num_seconds() as f64;
    (seconds / 60.0).round() as i64
}

/// Walks a build's failed actions and attaches analyzer output to each.
///
/// Builds taken from the list endpoint carry no steps, so the detail is
/// fetched once up front. Output is fetched only for actions an analyzer
/// claims; unclaimed failed actions are kept as unparsed fallbacks whose
/// raw output the caller can fetch when it wants to show it.
pub async fn analyze_failed_actions<'a>(
    client: &CircleClient,
    registry: &'a AnalyzerRegistry,
    project: &Project,
    build: &Build,
) -> Result<Vec<AnalyzedStep<'a>>> {
    let detailed;
    let build = if build.steps.is_empty() {
        detailed = client.get_build(project, build.build_num).await?;
        &detailed
    } else {
        build
    };

    let mut analyzed = Vec::new();
    for action in build.failed_actions() {
        let analyzer = match registry.select(action) {
            Some(analyzer) => analyzer,
            None => {
                analyzed.push(AnalyzedStep::unparsed(action.clone()));
                continue;
            }
        };
        let output_url = match &action.output_url {
            Some(url) => url,
            None => {
                analyzed.push(AnalyzedStep::unparsed(action.clone()));
                continue;
            }
        };
        let output = client.get_output(output_url).await?;
        let sections = analyzer.analyze(&output);
        analyzed.push(AnalyzedStep::analyzed(action.clone(), analyzer, sections));
    }

    Ok(analyzed)
}
