//! Git command invocation using [`tokio::process::Command`].
//!
//! Every operation shells out to the system `git` binary.  Credential
//! handling is transparent to callers: the SSH overlay (and, for the
//! upstream forwarder, a fully rebuilt environment) is injected via the
//! `env` parameters.

use std::collections::HashMap;
use std::path::Path;
use std::process::{ExitStatus, Stdio};

use anyhow::{bail, Context, Result};
use tokio::process::Command;
use tracing::{debug, instrument};

// ---------------------------------------------------------------------------
// Invoker
// ---------------------------------------------------------------------------

/// Captured result of a git subprocess.
#[derive(Debug)]
pub struct GitOutput {
    pub stdout: String,
    pub stderr: String,
    pub status: ExitStatus,
}

impl GitOutput {
    pub fn success(&self) -> bool {
        self.status.success()
    }

    /// Non-empty stdout lines, trimmed.
    pub fn stdout_lines(&self) -> Vec<String> {
        self.stdout
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect()
    }
}

/// Run `git <args>` in `repo` with `env` applied on top of the ambient
/// environment.  A non-zero exit is reported through [`GitOutput`], not as
/// an error; only a failure to spawn is an `Err`.
#[instrument(skip(env), fields(repo = %repo.display(), args = ?args))]
pub async fn run_git(repo: &Path, args: &[&str], env: &HashMap<String, String>) -> Result<GitOutput> {
    let mut cmd = Command::new("git");
    cmd.args(args).current_dir(repo);
    cmd.env("GIT_TERMINAL_PROMPT", "0");
    for (key, value) in env {
        cmd.env(key, value);
    }
    run(cmd).await
}

/// Run `git <args>` in `repo` with `env` as the entire environment (the
/// ambient environment is cleared first).  Used by the forwarder, which must
/// not leak the backend's quarantine object store into the push.
#[instrument(skip(env), fields(repo = %repo.display(), args = ?args))]
pub async fn run_git_replacing_env(
    repo: &Path,
    args: &[&str],
    env: &HashMap<String, String>,
) -> Result<GitOutput> {
    let mut cmd = Command::new("git");
    cmd.args(args).current_dir(repo);
    cmd.env_clear();
    cmd.envs(env);
    cmd.env("GIT_TERMINAL_PROMPT", "0");
    run(cmd).await
}

async fn run(mut cmd: Command) -> Result<GitOutput> {
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());

    let output = cmd.output().await.context("failed to spawn git")?;

    let result = GitOutput {
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        status: output.status,
    };
    debug!(status = %result.status, "git exited");
    Ok(result)
}

// ---------------------------------------------------------------------------
// Typed wrappers
// ---------------------------------------------------------------------------

/// `git fetch origin --prune` inside a mirror.  Errors carry the fetch
/// stderr so the failure can be surfaced to the operator.
pub async fn fetch_origin_prune(repo: &Path, env: &HashMap<String, String>) -> Result<()> {
    let output = run_git(repo, &["fetch", "origin", "--prune"], env).await?;
    if !output.success() {
        bail!(
            "git fetch origin --prune failed (status {}): {}",
            output.status,
            output.stderr.trim(),
        );
    }
    Ok(())
}

/// `git merge-base --is-ancestor <old> <new>`: exit 0 means `old` is an
/// ancestor of `new` (a fast-forward).
pub async fn is_ancestor(repo: &Path, old: &str, new: &str) -> Result<bool> {
    let output = run_git(
        repo,
        &["merge-base", "--is-ancestor", old, new],
        &HashMap::new(),
    )
    .await?;
    Ok(output.success())
}

/// `git rev-parse --verify <refish>`: `Some(oid)` when the ref resolves,
/// `None` when it does not exist.
pub async fn rev_parse_verify(repo: &Path, refish: &str) -> Result<Option<String>> {
    let output = run_git(repo, &["rev-parse", "--verify", refish], &HashMap::new()).await?;
    if !output.success() {
        return Ok(None);
    }
    Ok(Some(output.stdout.trim().to_string()))
}

/// `git rev-list <tip> --not <base>`: commits reachable from `tip` but not
/// from `base`, one oid per line.
pub async fn rev_list_not(repo: &Path, tip: &str, base: &str) -> Result<Vec<String>> {
    let output = run_git(repo, &["rev-list", tip, "--not", base], &HashMap::new()).await?;
    if !output.success() {
        bail!(
            "git rev-list {tip} --not {base} failed (status {}): {}",
            output.status,
            output.stderr.trim(),
        );
    }
    Ok(output.stdout_lines())
}

/// `git diff --name-only <base> <tip>`: the net set of changed file names.
pub async fn diff_name_only(repo: &Path, base: &str, tip: &str) -> Result<Vec<String>> {
    let output = run_git(repo, &["diff", "--name-only", base, tip], &HashMap::new()).await?;
    if !output.success() {
        bail!(
            "git diff --name-only {base} {tip} failed (status {}): {}",
            output.status,
            output.stderr.trim(),
        );
    }
    Ok(output.stdout_lines())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command as StdCommand;

    fn git(dir: &Path, args: &[&str]) {
        let status = StdCommand::new("git")
            .args(args)
            .current_dir(dir)
            .env("GIT_AUTHOR_NAME", "test")
            .env("GIT_AUTHOR_EMAIL", "test@example.com")
            .env("GIT_COMMITTER_NAME", "test")
            .env("GIT_COMMITTER_EMAIL", "test@example.com")
            .status()
            .unwrap();
        assert!(status.success(), "git {args:?} failed");
    }

    fn init_repo_with_commits(dir: &Path) -> (String, String) {
        git(dir, &["init", "-q", "-b", "main"]);
        std::fs::write(dir.join("a.txt"), "one").unwrap();
        git(dir, &["add", "."]);
        git(dir, &["commit", "-q", "-m", "one"]);
        let first = head(dir);
        std::fs::write(dir.join("b.txt"), "two").unwrap();
        git(dir, &["add", "."]);
        git(dir, &["commit", "-q", "-m", "two"]);
        (first, head(dir))
    }

    fn head(dir: &Path) -> String {
        let out = StdCommand::new("git")
            .args(["rev-parse", "HEAD"])
            .current_dir(dir)
            .output()
            .unwrap();
        String::from_utf8_lossy(&out.stdout).trim().to_string()
    }

    #[tokio::test]
    async fn ancestor_detection() {
        let tmp = tempfile::tempdir().unwrap();
        let (first, second) = init_repo_with_commits(tmp.path());
        assert!(is_ancestor(tmp.path(), &first, &second).await.unwrap());
        assert!(!is_ancestor(tmp.path(), &second, &first).await.unwrap());
    }

    #[tokio::test]
    async fn rev_parse_missing_ref_is_none() {
        let tmp = tempfile::tempdir().unwrap();
        init_repo_with_commits(tmp.path());
        let found = rev_parse_verify(tmp.path(), "refs/heads/main").await.unwrap();
        assert!(found.is_some());
        let missing = rev_parse_verify(tmp.path(), "refs/remotes/origin/nope")
            .await
            .unwrap();
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn rev_list_and_diff() {
        let tmp = tempfile::tempdir().unwrap();
        let (first, second) = init_repo_with_commits(tmp.path());
        let commits = rev_list_not(tmp.path(), &second, &first).await.unwrap();
        assert_eq!(commits, vec![second.clone()]);
        let files = diff_name_only(tmp.path(), &first, &second).await.unwrap();
        assert_eq!(files, vec!["b.txt".to_string()]);
        let none = rev_list_not(tmp.path(), &first, &second).await.unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn nonzero_exit_is_not_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        init_repo_with_commits(tmp.path());
        let output = run_git(tmp.path(), &["rev-parse", "--verify", "bogus"], &HashMap::new())
            .await
            .unwrap();
        assert!(!output.success());
    }
}
