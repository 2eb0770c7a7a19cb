//! Local git context: the commit, branch, and project the CLI acts on.

use std::path::Path;

use anyhow::{Context, Result};
use git2::Repository;

use crate::api::Project;
use crate::error::CircleRerunError;

/// Read-only view of the repository a command runs inside.
///
/// Commands that are told the project and branch explicitly never build
/// one of these; everything else discovers it from the working directory.
pub struct GitContext {
    repo: Repository,
}

impl GitContext {
    /// Discovers the repository containing `path`.
    ///
    /// # Errors
    ///
    /// Returns [`CircleRerunError::NotARepository`] when `path` is not
    /// inside a git checkout.
    pub fn discover(path: &Path) -> Result<Self> {
        let repo = Repository::discover(path).map_err(|_| {
            CircleRerunError::NotARepository(format!(
                "{} is not inside a git checkout\n  help: run from a repository or pass --src OWNER/REPO and --branch",
                path.display()
            ))
        })?;
        Ok(GitContext { repo })
    }

    /// Full hex id of the commit HEAD points at.
    pub fn current_commit(&self) -> Result<String> {
        let head = self.repo.head().context("cannot resolve HEAD")?;
        let commit = head
            .peel_to_commit()
            .context("HEAD does not point at a commit")?;
        Ok(commit.id().to_string())
    }

    /// Name of the branch HEAD is on, or `"detached"`.
    pub fn current_branch(&self) -> Result<String> {
        let head = self.repo.head().context("cannot resolve HEAD")?;
        Ok(head.shorthand().unwrap_or("detached").to_string())
    }

    /// Project identity taken from the `origin` remote.
    pub fn project(&self) -> Result<Project> {
        let remote = self.repo.find_remote("origin").context(
            "cannot find an `origin` remote\n  help: pass --src OWNER/REPO instead",
        )?;
        let url = remote.url().context("`origin` remote has no URL")?;
        let (owner, name) = parse_remote_url(url).with_context(|| {
            format!(
                "cannot read a GitHub project from remote `{}`\n  help: pass --src OWNER/REPO instead",
                url
            )
        })?;
        Ok(Project::new(owner, name))
    }
}

/// Extracts `(owner, repo)` from a git remote URL.
///
/// Supports:
/// - git@github.com:owner/repo.git
/// - https://github.com/owner/repo.git
/// - https://github.com/owner/repo
pub fn parse_remote_url(url: &str) -> Option<(String, String)> {
    // SSH format: git@github.com:owner/repo.git
    if let Some(rest) = url.strip_prefix("git@github.com:") {
        return split_owner_repo(rest);
    }

    if url.contains("github.com") {
        if let Ok(parsed) = url::Url::parse(url) {
            if let Some(found) = split_owner_repo(parsed.path().trim_start_matches('/')) {
                return Some(found);
            }
        }

        // Fallback: simple string parsing for URLs without a scheme
        let rest = url
            .split("github.com")
            .nth(1)?
            .trim_start_matches(['/', ':']);
        return split_owner_repo(rest);
    }

    None
}

fn split_owner_repo(path: &str) -> Option<(String, String)> {
    let path = path.trim_end_matches(".git");
    let parts: Vec<&str> = path.splitn(2, '/').collect();
    if parts.len() == 2 && !parts[0].is_empty() && !parts[1].is_empty() {
        Some((parts[0].to_string(), parts[1].to_string()))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use git2::Signature;
    use tempfile::TempDir;

    fn init_repo(dir: &Path) -> Repository {
        let repo = Repository::init(dir).unwrap();
        {
            let mut config = repo.config().unwrap();
            config.set_str("user.name", "tester").unwrap();
            config.set_str("user.email", "tester@example.com").unwrap();
        }
        repo
    }

    fn commit_file(repo: &Repository, name: &str) -> git2::Oid {
        let workdir = repo.workdir().unwrap();
        std::fs::write(workdir.join(name), "content\n").unwrap();

        let mut index = repo.index().unwrap();
        index.add_path(Path::new(name)).unwrap();
        index.write().unwrap();
        let tree_id = index.write_tree().unwrap();
        let tree = repo.find_tree(tree_id).unwrap();

        let sig = Signature::now("tester", "tester@example.com").unwrap();
        repo.commit(Some("HEAD"), &sig, &sig, "initial", &tree, &[])
            .unwrap()
    }

    #[test]
    fn discover_finds_repo_from_subdirectory() {
        let dir = TempDir::new().unwrap();
        let repo = init_repo(dir.path());
        commit_file(&repo, "README.md");

        let sub = dir.path().join("src");
        std::fs::create_dir(&sub).unwrap();

        assert!(GitContext::discover(&sub).is_ok());
    }

    #[test]
    fn discover_outside_a_repo_fails() {
        let dir = TempDir::new().unwrap();
        let err = match GitContext::discover(dir.path()) {
            Ok(_) => panic!("discovery outside a repository must fail"),
            Err(err) => err,
        };
        assert!(matches!(
            err.downcast_ref::<CircleRerunError>(),
            Some(CircleRerunError::NotARepository(_))
        ));
    }

    #[test]
    fn current_commit_and_branch_follow_head() {
        let dir = TempDir::new().unwrap();
        let repo = init_repo(dir.path());
        let oid = commit_file(&repo, "README.md");

        let commit = repo.find_commit(oid).unwrap();
        repo.branch("feature/checkout", &commit, false).unwrap();
        repo.set_head("refs/heads/feature/checkout").unwrap();

        let git = GitContext::discover(dir.path()).unwrap();
        assert_eq!(git.current_commit().unwrap(), oid.to_string());
        assert_eq!(git.current_branch().unwrap(), "feature/checkout");
    }

    #[test]
    fn project_comes_from_origin_remote() {
        let dir = TempDir::new().unwrap();
        let repo = init_repo(dir.path());
        commit_file(&repo, "README.md");
        repo.remote("origin", "git@github.com:fastmonkeys/pelsu.git")
            .unwrap();

        let git = GitContext::discover(dir.path()).unwrap();
        assert_eq!(git.project().unwrap(), Project::new("fastmonkeys", "pelsu"));
    }

    #[test]
    fn project_without_origin_fails() {
        let dir = TempDir::new().unwrap();
        let repo = init_repo(dir.path());
        commit_file(&repo, "README.md");

        let git = GitContext::discover(dir.path()).unwrap();
        assert!(git.project().is_err());
    }

    #[test]
    fn parse_remote_url_variants() {
        let cases = [
            "git@github.com:fastmonkeys/pelsu.git",
            "https://github.com/fastmonkeys/pelsu.git",
            "https://github.com/fastmonkeys/pelsu",
            "ssh://git@github.com/fastmonkeys/pelsu.git",
            "github.com/fastmonkeys/pelsu",
        ];

        for url in cases {
            assert_eq!(
                parse_remote_url(url),
                Some(("fastmonkeys".to_string(), "pelsu".to_string())),
                "failed for {}",
                url
            );
        }
    }

    #[test]
    fn parse_remote_url_rejects_non_github() {
        assert_eq!(parse_remote_url("git@gitlab.com:owner/repo.git"), None);
        assert_eq!(parse_remote_url("not a url"), None);
        assert_eq!(parse_remote_url("https://github.com/"), None);
    }
}
