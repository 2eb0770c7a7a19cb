//! Failure-output analysis and re-run command construction.
//!
//! A failed CircleCI action carries the raw output of the test runner that
//! failed. An [`Analyzer`] knows one runner's report format: it extracts a
//! [`FailureRecord`] per failed test and builds the local command that
//! re-runs exactly those tests. Analyzers live in an [`AnalyzerRegistry`],
//! which hands each failed action to the first analyzer that claims it.
//!
//! The one analyzer shipped here is [`PytestAnalyzer`], covering pytest's
//! sectioned failure report.

use std::fmt;
use std::process::{Command, ExitStatus};

use anyhow::{Context, Result};
use regex::Regex;

use crate::api::Action;

/// A single failed test extracted from a build's output.
///
/// # See Also
///
/// * [`Analyzer::analyze`] - Where these are produced
/// * [`Analyzer::rerun_command`] - What consumes them
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureRecord {
    /// File the failing test was collected from (named by the progress
    /// banner preceding the failure section).
    pub origin_file: String,
    /// File the failure was raised in.
    pub fail_file: String,
    /// Line number of the failure site.
    pub fail_line: u32,
    /// Test class name.
    pub class_name: String,
    /// Test method name.
    pub method_name: String,
}

/// Why a failure section could not be turned into a [`FailureRecord`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectionErrorKind {
    /// The header line carries no `class.method` token.
    MalformedHeader,
    /// The location line is not of the `file:line:context` form.
    MalformedLocation,
    /// The location line number is not a non-negative integer.
    InvalidLineNumber,
    /// No preceding section names the originating test file.
    MissingBanner,
}

/// A failure section that matched the failure marker but could not be
/// parsed.
///
/// One bad section never aborts analysis of the rest of the output; the
/// error is kept alongside the records that did parse, in output order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SectionParseError {
    pub kind: SectionErrorKind,
    /// The offending section text.
    pub section: String,
}

impl SectionParseError {
    fn new(kind: SectionErrorKind, section: &str) -> Self {
        SectionParseError {
            kind,
            section: section.trim().to_string(),
        }
    }
}

impl fmt::Display for SectionParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let what = match self.kind {
            SectionErrorKind::MalformedHeader => "header has no class.method token",
            SectionErrorKind::MalformedLocation => "location line is not file:line:context",
            SectionErrorKind::InvalidLineNumber => "location line number is not a number",
            SectionErrorKind::MissingBanner => "no preceding section names the test file",
        };
        write!(
            f,
            "could not parse failure section ({}): {}",
            what,
            self.section.lines().next().unwrap_or("")
        )
    }
}

impl std::error::Error for SectionParseError {}

/// Outcome of parsing one failure section.
pub type SectionResult = Result<FailureRecord, SectionParseError>;

/// A failure-output analyzer for one test runner.
///
/// Implementations are registered in an [`AnalyzerRegistry`]; the first
/// analyzer whose [`applies`](Analyzer::applies) accepts a failed action
/// analyzes that action's output and builds its re-run command. Adding a
/// runner means adding an implementation, never touching dispatch.
pub trait Analyzer {
    /// Short identifier attached to analyzed steps (e.g. `"pytest"`).
    fn name(&self) -> &'static str;

    /// Whether this analyzer understands the given action's output.
    ///
    /// Must be a pure check over the action metadata; no I/O happens here.
    fn applies(&self, action: &Action) -> bool;

    /// Extracts one entry per failure section, in output order.
    fn analyze(&self, output: &str) -> Vec<SectionResult>;

    /// Builds the local command re-running exactly the given failures.
    fn rerun_command(&self, command: &str, records: &[FailureRecord]) -> RunCommand;
}

/// Analyzer for pytest's sectioned failure report.
///
/// pytest separates report sections with blank lines. A failure section
/// starts with an underscore-padded `Class.method` header and carries a
/// `file:line:context` location on its second line; the section before it
/// ends with the progress line naming the file the test came from:
///
/// ```text
/// tests/test_cart.py F
///
/// ______________ TestCart.test_remove_item ______________
/// tests/test_cart.py:42: AssertionError
/// ```
pub struct PytestAnalyzer {
    marker: Regex,
}

impl PytestAnalyzer {
    /// Sections arrive with network line endings; pytest's blank separator
    /// line is therefore `\r\n\r\n`.
    const SECTION_BOUNDARY: &'static str = "\r\n\r\n";

    fn parse_section(&self, section: &str, previous: Option<&str>) -> SectionResult {
        let trimmed = section.trim();
        let mut lines = trimmed.lines();

        let header = lines.next().unwrap_or("");
        let (class_name, method_name) = split_header(header)
            .ok_or_else(|| SectionParseError::new(SectionErrorKind::MalformedHeader, section))?;

        let location = lines.next().unwrap_or("").trim();
        let parts: Vec<&str> = location.split(':').collect();
        if parts.len() != 3 {
            return Err(SectionParseError::new(
                SectionErrorKind::MalformedLocation,
                section,
            ));
        }
        let fail_line: u32 = parts[1]
            .parse()
            .map_err(|_| SectionParseError::new(SectionErrorKind::InvalidLineNumber, section))?;

        let origin_file = previous
            .and_then(banner_file)
            .ok_or_else(|| SectionParseError::new(SectionErrorKind::MissingBanner, section))?;

        Ok(FailureRecord {
            origin_file,
            fail_file: parts[0].to_string(),
            fail_line,
            class_name,
            method_name,
        })
    }
}

impl Default for PytestAnalyzer {
    fn default() -> Self {
        PytestAnalyzer {
            marker: Regex::new(r":\d+:").unwrap(),
        }
    }
}

impl Analyzer for PytestAnalyzer {
    fn name(&self) -> &'static str {
        "pytest"
    }

    fn applies(&self, action: &Action) -> bool {
        action
            .command
            .as_deref()
            .and_then(|command| command.split_whitespace().next())
            .map(|program| program == "py.test" || program == "pytest")
            .unwrap_or(false)
    }

    fn analyze(&self, output: &str) -> Vec<SectionResult> {
        let sections: Vec<&str> = output.split(Self::SECTION_BOUNDARY).collect();
        sections
            .iter()
            .enumerate()
            .filter(|(_, section)| self.marker.is_match(section))
            .map(|(i, section)| {
                let previous = if i > 0 { Some(sections[i - 1]) } else { None };
                self.parse_section(section, previous)
            })
            .collect()
    }

    fn rerun_command(&self, command: &str, records: &[FailureRecord]) -> RunCommand {
        let mut tokens: Vec<String> = command.split_whitespace().map(str::to_string).collect();

        let mut files: Vec<String> = Vec::new();
        for record in records {
            if !files.contains(&record.origin_file) {
                files.push(record.origin_file.clone());
            }
        }
        tokens.extend(files);

        tokens.push("-k".to_string());
        let selector = records
            .iter()
            .map(|record| format!("{} and {}", record.class_name, record.method_name))
            .collect::<Vec<_>>()
            .join(" or ");
        tokens.push(selector);

        RunCommand::new(tokens)
    }
}

/// Pulls `class.method` out of a header such as
/// `"______ TestCart.test_remove_item ______"`. The split is on the first
/// `.`, so method names may themselves contain dots.
fn split_header(header: &str) -> Option<(String, String)> {
    let token = header
        .trim()
        .trim_matches('_')
        .split_whitespace()
        .next()?;
    let (class_name, method_name) = token.split_once('.')?;
    if class_name.is_empty() || method_name.is_empty() {
        return None;
    }
    Some((class_name.to_string(), method_name.to_string()))
}

/// First whitespace-separated token of a section's last line, which in a
/// pytest report is the file path of the progress banner.
fn banner_file(section: &str) -> Option<String> {
    section
        .trim_end()
        .lines()
        .next_back()?
        .split_whitespace()
        .next()
        .map(str::to_string)
}

/// Ordered collection of analyzers.
///
/// Dispatch is first-match-wins: [`select`](AnalyzerRegistry::select) walks
/// the analyzers in registration order and returns the first that claims
/// the action. At most one analyzer handles any step.
pub struct AnalyzerRegistry {
    analyzers: Vec<Box<dyn Analyzer>>,
}

impl AnalyzerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with an explicit analyzer list, in dispatch order.
    pub fn with_analyzers(analyzers: Vec<Box<dyn Analyzer>>) -> Self {
        AnalyzerRegistry { analyzers }
    }

    /// First registered analyzer that claims the action, if any.
    pub fn select(&self, action: &Action) -> Option<&dyn Analyzer> {
        self.analyzers
            .iter()
            .find(|analyzer| analyzer.applies(action))
            .map(|analyzer| analyzer.as_ref())
    }
}

impl Default for AnalyzerRegistry {
    fn default() -> Self {
        AnalyzerRegistry {
            analyzers: vec![Box::new(PytestAnalyzer::default())],
        }
    }
}

/// Analysis attached to one failed action of a build.
///
/// Built fresh for every query; nothing here is persisted.
pub struct AnalyzedStep<'a> {
    pub action: Action,
    /// The analyzer that claimed the action, if any.
    pub analyzer: Option<&'a dyn Analyzer>,
    /// One entry per failure section, in output order.
    pub sections: Vec<SectionResult>,
}

impl<'a> AnalyzedStep<'a> {
    pub fn analyzed(
        action: Action,
        analyzer: &'a dyn Analyzer,
        sections: Vec<SectionResult>,
    ) -> Self {
        AnalyzedStep {
            action,
            analyzer: Some(analyzer),
            sections,
        }
    }

    /// A failed action no analyzer claimed; callers fall back to raw
    /// output.
    pub fn unparsed(action: Action) -> Self {
        AnalyzedStep {
            action,
            analyzer: None,
            sections: Vec::new(),
        }
    }

    /// Name of the analyzer that claimed the action.
    pub fn analyzer_kind(&self) -> Option<&'static str> {
        self.analyzer.map(|analyzer| analyzer.name())
    }

    /// Records that parsed, in output order.
    pub fn records(&self) -> impl Iterator<Item = &FailureRecord> {
        self.sections.iter().filter_map(|section| section.as_ref().ok())
    }

    /// Sections that failed to parse, in output order.
    pub fn parse_errors(&self) -> impl Iterator<Item = &SectionParseError> {
        self.sections.iter().filter_map(|section| section.as_ref().err())
    }

    pub fn has_records(&self) -> bool {
        self.sections.iter().any(|section| section.is_ok())
    }

    /// Local command re-running exactly this step's failed tests.
    ///
    /// `None` when no analyzer claimed the step, nothing parsed, or the
    /// action carries no command to re-run.
    pub fn rerun_command(&self) -> Option<RunCommand> {
        let analyzer = self.analyzer?;
        let command = self.action.command.as_deref()?;
        let records: Vec<FailureRecord> = self.records().cloned().collect();
        if records.is_empty() {
            return None;
        }
        Some(analyzer.rerun_command(command, &records))
    }
}

impl fmt::Debug for AnalyzedStep<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnalyzedStep")
            .field("action", &self.action.name)
            .field("analyzer", &self.analyzer_kind())
            .field("sections", &self.sections)
            .finish()
    }
}

/// A local command as a token vector.
///
/// [`Display`](fmt::Display) joins the tokens with spaces, which is what
/// gets echoed before the command runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunCommand {
    tokens: Vec<String>,
}

impl RunCommand {
    pub fn new(tokens: Vec<String>) -> Self {
        RunCommand { tokens }
    }

    pub fn tokens(&self) -> &[String] {
        &self.tokens
    }

    pub fn program(&self) -> &str {
        self.tokens.first().map(String::as_str).unwrap_or("")
    }

    pub fn args(&self) -> &[String] {
        self.tokens.get(1..).unwrap_or(&[])
    }

    /// Runs the command as a child process sharing this process's stdio,
    /// blocking until it exits.
    ///
    /// # Errors
    ///
    /// Returns an error when the program cannot be spawned at all; a child
    /// that runs and fails is reported through the returned [`ExitStatus`].
    pub fn execute(&self) -> Result<ExitStatus> {
        Command::new(self.program())
            .args(self.args())
            .status()
            .with_context(|| format!("cannot run `{}`", self))
    }
}

impl fmt::Display for RunCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.tokens.join(" "))
    }
}
