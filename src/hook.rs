//! Pre-receive callback mode.
//!
//! The git backend invokes each mirror's `hooks/pre-receive`, a shell
//! wrapper that re-enters this binary as `git-proxy pre-receive <repo>`.
//! The callback reads the ref updates from stdin, re-reads the same config
//! the server loaded (same file, same environment contract), runs the
//! validator, and reports the decision through its exit code: 0 commits the
//! local refs, 1 makes the backend reject the entire push.
//!
//! It runs inside the parent's per-repo critical section and must not try
//! to reacquire it, open ports, or otherwise act like the server.

use anyhow::{Context, Result};
use tokio::io::AsyncReadExt;

use crate::config::{load_config, ssh_env, RuntimeConfig};
use crate::git::MirrorStore;
use crate::validate::{validate_and_push, RefUpdate, ValidationContext};

/// Run the callback for `repo_name`.  Returns the process exit code.
pub async fn run(repo_name: &str) -> Result<i32> {
    let runtime = RuntimeConfig::from_env()?;
    let config = load_config(&runtime.config_path)?;

    let Some(policy) = config.repos.get(repo_name) else {
        eprintln!("pre-receive: unknown repo: {repo_name}");
        return Ok(1);
    };

    let mut input = String::new();
    tokio::io::stdin()
        .read_to_string(&mut input)
        .await
        .context("failed to read ref updates from stdin")?;

    let updates = RefUpdate::parse_input(&input)?;
    if updates.is_empty() {
        return Ok(0);
    }

    let store = MirrorStore::new(&runtime.repos_dir);
    let mirror = store.path(repo_name);
    let ssh = ssh_env(&runtime, &config);
    let ctx = ValidationContext {
        mirror: &mirror,
        policy,
        ssh_env: &ssh,
    };

    let verdict = validate_and_push(&updates, &ctx).await?;
    if verdict.allowed {
        println!("{}", verdict.message);
        Ok(0)
    } else {
        // The backend relays stderr to the client as `remote:` lines.
        eprint!("{}", verdict.message);
        Ok(1)
    }
}
