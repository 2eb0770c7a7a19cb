//! CircleCI v1.1 API client and build models.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CircleRerunError;

const DEFAULT_BASE_URL: &str = "https://circleci.com/api/v1.1";

/// A GitHub project addressed as `owner/repo`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Project {
    pub owner: String,
    pub name: String,
}

impl Project {
    pub fn new(owner: impl Into<String>, name: impl Into<String>) -> Self {
        Project {
            owner: owner.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for Project {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.name)
    }
}

impl FromStr for Project {
    type Err = CircleRerunError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('/') {
            Some((owner, name)) if !owner.is_empty() && !name.is_empty() && !name.contains('/') => {
                Ok(Project::new(owner, name))
            }
            _ => Err(CircleRerunError::ParseError(format!(
                "cannot parse project `{}`\n  help: expected OWNER/REPO, e.g. fastmonkeys/pelsu",
                s
            ))),
        }
    }
}

/// One build as returned by the CircleCI v1.1 API.
///
/// The list endpoint returns builds without `steps`; the detail endpoint
/// fills them in.
///
/// # See Also
///
/// * [`Step`] - Individual build steps
/// * [`CircleClient::get_build`] - Method to fetch the detailed form
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Build {
    /// The build number, unique within the project.
    pub build_num: u32,
    /// Git branch this build ran for.
    pub branch: Option<String>,
    /// Full hex id of the commit that was built.
    pub vcs_revision: String,
    /// Commit subject line.
    pub subject: Option<String>,
    /// Where the build is in its lifetime: `queued`, `scheduled`,
    /// `not_run`, `not_running`, `running` or `finished`.
    pub lifecycle: String,
    /// How a finished build ended: `canceled`, `infrastructure_fail`,
    /// `timedout`, `failed`, `no_tests` or `success`. Absent until the
    /// build finishes.
    pub outcome: Option<String>,
    /// Combined status string (e.g. "failed", "fixed", "running").
    pub status: String,
    /// When the build started running, if it has.
    pub start_time: Option<DateTime<Utc>>,
    /// Build steps; only present on the detail endpoint.
    #[serde(default)]
    pub steps: Vec<Step>,
}

impl Build {
    pub fn is_finished(&self) -> bool {
        self.lifecycle == "finished"
    }

    pub fn is_running(&self) -> bool {
        self.lifecycle == "running"
    }

    pub fn is_queued(&self) -> bool {
        self.lifecycle == "queued"
    }

    pub fn is_failed(&self) -> bool {
        self.is_finished() && self.outcome.as_deref() == Some("failed")
    }

    pub fn is_success(&self) -> bool {
        self.is_finished() && self.outcome.as_deref() == Some("success")
    }

    pub fn is_infrastructure_fail(&self) -> bool {
        self.is_finished() && self.outcome.as_deref() == Some("infrastructure_fail")
    }

    /// Abbreviated commit id, as shown in build summaries.
    pub fn short_revision(&self) -> &str {
        self.vcs_revision.get(..7).unwrap_or(&self.vcs_revision)
    }

    pub fn failed_actions(&self) -> impl Iterator<Item = &Action> {
        self.steps
            .iter()
            .flat_map(|step| step.actions.iter())
            .filter(|action| action.is_failed())
    }
}

/// A single step in a build.
///
/// A step groups related actions that are executed sequentially.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Step {
    pub name: String,
    pub actions: Vec<Action>,
}

impl Step {
    pub fn has_failures(&self) -> bool {
        self.actions.iter().any(|action| action.is_failed())
    }
}

/// An individual action within a build step.
///
/// The smallest unit of execution with its own status and output.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Action {
    /// The name of the action (e.g. "py.test tests").
    pub name: String,
    /// Execution status (e.g. "success", "failed", "timedout").
    pub status: String,
    /// Whether this action failed.
    pub failed: Option<bool>,
    /// URL to fetch the full output for this action.
    pub output_url: Option<String>,
    /// The type of action (e.g. "test", "deploy").
    #[serde(rename = "type")]
    pub action_type: String,
    /// Shell command the action ran, when it ran one.
    #[serde(default, alias = "bash_command")]
    pub command: Option<String>,
    /// Execution time in milliseconds.
    pub run_time_millis: Option<u64>,
}

impl Action {
    pub fn is_failed(&self) -> bool {
        self.failed.unwrap_or(false) || self.status == "failed"
    }

    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.run_time_millis.unwrap_or(0))
    }
}

/// HTTP client for the CircleCI v1.1 API.
///
/// # Authentication
///
/// Requires a CircleCI personal API token, passed in explicitly; the
/// constructor never reads the environment.
///
/// # Examples
///
/// ```no_run
/// # use anyhow::Result;
/// # async fn example() -> Result<()> {
/// use circle_rerun::{CircleClient, Project};
///
/// let client = CircleClient::new("your-token")?;
/// let project = Project::new("fastmonkeys", "pelsu");
/// let build = client.get_build(&project, 1290).await?;
/// println!("Build status: {}", build.status);
/// # Ok(())
/// # }
/// ```
pub struct CircleClient {
    token: String,
    client: reqwest::Client,
    base_url: String,
}

impl CircleClient {
    /// Creates a client talking to circleci.com.
    ///
    /// # Errors
    ///
    /// Returns [`CircleRerunError::MissingCredential`] when the token is
    /// empty.
    pub fn new(token: impl Into<String>) -> Result<Self, CircleRerunError> {
        Self::with_base_url(token, DEFAULT_BASE_URL)
    }

    /// Client pointed at a different API root; tests use this.
    pub fn with_base_url(
        token: impl Into<String>,
        base_url: impl Into<String>,
    ) -> Result<Self, CircleRerunError> {
        let token = token.into();
        if token.is_empty() {
            return Err(CircleRerunError::MissingCredential(
                "no CircleCI API token supplied\n  help: pass --token or set CIRCLECI_TOKEN"
                    .to_string(),
            ));
        }

        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()?;

        Ok(CircleClient {
            token,
            client,
            base_url: base_url.into(),
        })
    }

    /// Recent builds of a project, newest first.
    ///
    /// `filter` narrows by status the way the API does ("completed",
    /// "successful", "failed", "running"); `None` returns everything.
    pub async fn list_builds(
        &self,
        project: &Project,
        limit: u32,
        offset: u32,
        filter: Option<&str>,
    ) -> Result<Vec<Build>, CircleRerunError> {
        let mut url = format!(
            "{}/project/github/{}?limit={}&offset={}",
            self.base_url, project, limit, offset
        );
        if let Some(filter) = filter {
            url.push_str("&filter=");
            url.push_str(filter);
        }

        let body = self.request(self.client.get(&url)).await?;
        Ok(serde_json::from_str(&body)?)
    }

    /// A build with its steps filled in.
    pub async fn get_build(
        &self,
        project: &Project,
        build_num: u32,
    ) -> Result<Build, CircleRerunError> {
        let url = format!("{}/project/github/{}/{}", self.base_url, project, build_num);
        let body = self
            .request(self.client.get(&url))
            .await
            .map_err(|err| not_found(err, project, build_num))?;
        Ok(serde_json::from_str(&body)?)
    }

    /// Fetches an action's output and joins its log messages.
    ///
    /// Output URLs point at blobs holding a JSON array of `{"message": ..}`
    /// entries; anything that does not parse that way is returned verbatim.
    pub async fn get_output(&self, output_url: &str) -> Result<String, CircleRerunError> {
        let text = self.request(self.client.get(output_url)).await?;

        if let Ok(entries) = serde_json::from_str::<Vec<serde_json::Value>>(&text) {
            let messages: Vec<String> = entries
                .iter()
                .filter_map(|entry| entry.get("message").and_then(|m| m.as_str()))
                .map(|s| s.to_string())
                .collect();
            return Ok(messages.join(""));
        }

        Ok(text)
    }

    /// Cancels a build, returning it in its canceled state.
    pub async fn cancel_build(
        &self,
        project: &Project,
        build_num: u32,
    ) -> Result<Build, CircleRerunError> {
        let url = format!(
            "{}/project/github/{}/{}/cancel",
            self.base_url, project, build_num
        );
        let body = self
            .request(self.client.post(&url))
            .await
            .map_err(|err| not_found(err, project, build_num))?;
        Ok(serde_json::from_str(&body)?)
    }

    /// Retries a build, returning the newly created build.
    pub async fn retry_build(
        &self,
        project: &Project,
        build_num: u32,
    ) -> Result<Build, CircleRerunError> {
        let url = format!(
            "{}/project/github/{}/{}/retry",
            self.base_url, project, build_num
        );
        let body = self
            .request(self.client.post(&url))
            .await
            .map_err(|err| not_found(err, project, build_num))?;
        Ok(serde_json::from_str(&body)?)
    }

    async fn request(&self, builder: reqwest::RequestBuilder) -> Result<String, CircleRerunError> {
        let response = builder
            .header("Circle-Token", &self.token)
            .header("Accept", "application/json")
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "<no response body>".to_string());
            return Err(CircleRerunError::ApiError {
                status: status.as_u16(),
                message,
            });
        }

        Ok(response.text().await?)
    }
}

fn not_found(err: CircleRerunError, project: &Project, build_num: u32) -> CircleRerunError {
    match err {
        CircleRerunError::ApiError { status: 404, .. } => CircleRerunError::BuildNotFound(format!(
            "build {} does not exist for {}",
            build_num, project
        )),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn detail_json() -> serde_json::Value {
        json!({
            "build_num": 1290,
            "branch": "main",
            "vcs_revision": "0123456789abcdef0123456789abcdef01234567",
            "subject": "Fix rounding in checkout totals",
            "lifecycle": "finished",
            "outcome": "failed",
            "status": "failed",
            "start_time": "2016-03-04T12:00:00.123Z",
            "steps": [{
                "name": "py.test tests",
                "actions": [{
                    "name": "py.test tests",
                    "status": "failed",
                    "failed": true,
                    "output_url": "https://example.com/output/1",
                    "type": "test",
                    "bash_command": "py.test tests",
                    "run_time_millis": 73210
                }]
            }]
        })
    }

    #[test]
    fn build_deserializes_from_detail_payload() {
        let build: Build = serde_json::from_value(detail_json()).unwrap();

        assert_eq!(build.build_num, 1290);
        assert!(build.is_finished());
        assert!(build.is_failed());
        assert!(!build.is_success());
        assert!(build.start_time.is_some());
        assert_eq!(build.steps.len(), 1);

        let action = &build.steps[0].actions[0];
        assert!(action.is_failed());
        assert_eq!(action.command.as_deref(), Some("py.test tests"));
        assert_eq!(action.duration(), Duration::from_millis(73210));
    }

    #[test]
    fn build_from_list_payload_has_no_steps() {
        let build: Build = serde_json::from_value(json!({
            "build_num": 1291,
            "branch": "main",
            "vcs_revision": "89abcdef0123456789abcdef0123456789abcdef",
            "subject": "Bump requests",
            "lifecycle": "running",
            "outcome": null,
            "status": "running",
            "start_time": "2016-03-04T12:10:00Z"
        }))
        .unwrap();

        assert!(build.steps.is_empty());
        assert!(build.is_running());
        assert!(!build.is_failed());
    }

    #[test]
    fn short_revision_is_seven_chars() {
        let build: Build = serde_json::from_value(detail_json()).unwrap();
        assert_eq!(build.short_revision(), "0123456");
    }

    #[test]
    fn failed_actions_walks_all_steps() {
        let build: Build = serde_json::from_value(detail_json()).unwrap();
        assert_eq!(build.failed_actions().count(), 1);
        assert!(build.steps[0].has_failures());
    }

    #[test]
    fn project_parses_owner_and_repo() {
        let project: Project = "fastmonkeys/pelsu".parse().unwrap();
        assert_eq!(project, Project::new("fastmonkeys", "pelsu"));
        assert_eq!(project.to_string(), "fastmonkeys/pelsu");

        assert!("fastmonkeys".parse::<Project>().is_err());
        assert!("/pelsu".parse::<Project>().is_err());
        assert!("fastmonkeys/".parse::<Project>().is_err());
        assert!("a/b/c".parse::<Project>().is_err());
    }

    #[test]
    fn empty_token_is_rejected() {
        let err = match CircleClient::new("") {
            Ok(_) => panic!("empty token must be rejected"),
            Err(err) => err,
        };
        assert!(matches!(err, CircleRerunError::MissingCredential(_)));

        assert!(CircleClient::new("valid-token").is_ok());
    }
}
