//! Mirror store: the directory of bare repositories the proxy serves from.
//!
//! Each configured logical repo owns one bare mirror whose `origin` remote
//! points at the upstream.  Bootstrap initialises the mirror, configures the
//! remote and receive settings, and installs the pre-receive hook wrapper.
//! Sync refreshes the mirror from upstream before every request.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use tracing::{debug, info, instrument};

use crate::config::RepoPolicy;
use crate::git::commands::{fetch_origin_prune, run_git};

/// Fetch refspecs carried by every mirror's `origin` remote.  The first
/// keeps the mirror's own branches equal to upstream's; the second populates
/// the `refs/remotes/origin/*` baseline the validator compares against.
const MIRROR_REFSPEC: &str = "+refs/heads/*:refs/heads/*";
const BASELINE_REFSPEC: &str = "+refs/heads/*:refs/remotes/origin/*";

#[derive(Debug, Clone)]
pub struct MirrorStore {
    root: PathBuf,
}

impl MirrorStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Filesystem path of the mirror for `name`.  Logical names may contain
    /// `/`, which becomes a sub-path under the store root.
    pub fn path(&self, name: &str) -> PathBuf {
        self.root.join(format!("{name}.git"))
    }

    /// Initialise the mirror for `name` and bring its configuration up to
    /// date.  Idempotent; called for every configured repo at startup.
    #[instrument(skip(self, policy, hook_exe), fields(%name))]
    pub async fn bootstrap(&self, name: &str, policy: &RepoPolicy, hook_exe: &Path) -> Result<()> {
        let path = self.path(name);
        init_bare(&path).await?;
        configure_origin(&path, &policy.upstream).await?;
        configure_receive(&path).await?;
        install_pre_receive_hook(&path, name, hook_exe).await?;
        info!(mirror = %path.display(), upstream = %policy.upstream, "mirror ready");
        Ok(())
    }

    /// Refresh the mirror from upstream: `git fetch origin --prune` with the
    /// SSH overlay.  Runs before any git-backend invocation so clients see
    /// upstream-authoritative state.
    #[instrument(skip(self, ssh_env), fields(%name))]
    pub async fn sync(&self, name: &str, ssh_env: &HashMap<String, String>) -> Result<()> {
        let path = self.path(name);
        fetch_origin_prune(&path, ssh_env).await?;
        debug!("mirror synced with upstream");
        Ok(())
    }
}

/// `git init --bare` at `path` unless a repository is already there.
async fn init_bare(path: &Path) -> Result<()> {
    if path.join("HEAD").is_file() {
        debug!(path = %path.display(), "bare repo already exists; skipping init");
        return Ok(());
    }

    tokio::fs::create_dir_all(path)
        .await
        .with_context(|| format!("failed to create mirror directory: {}", path.display()))?;

    let output = run_git(path, &["init", "--bare", "-q"], &HashMap::new()).await?;
    if !output.success() {
        bail!(
            "git init --bare failed (status {}): {}",
            output.status,
            output.stderr.trim(),
        );
    }
    Ok(())
}

/// Point `origin` at the upstream URL and pin the fetch refspecs.
async fn configure_origin(path: &Path, upstream: &str) -> Result<()> {
    let add = run_git(path, &["remote", "add", "origin", upstream], &HashMap::new()).await?;
    if !add.success() {
        if !add.stderr.contains("already exists") {
            bail!(
                "git remote add origin failed (status {}): {}",
                add.status,
                add.stderr.trim(),
            );
        }
        let set = run_git(
            path,
            &["remote", "set-url", "origin", upstream],
            &HashMap::new(),
        )
        .await?;
        if !set.success() {
            bail!(
                "git remote set-url origin failed (status {}): {}",
                set.status,
                set.stderr.trim(),
            );
        }
    }

    git_config(path, &["--replace-all", "remote.origin.fetch", MIRROR_REFSPEC]).await?;
    git_config(path, &["--add", "remote.origin.fetch", BASELINE_REFSPEC]).await?;
    Ok(())
}

/// Receive settings required by the push path: HTTP pushes enabled, and the
/// receive quarantine off -- the forwarder reads objects from the main store
/// while the pre-receive callback is still running.
async fn configure_receive(path: &Path) -> Result<()> {
    git_config(path, &["http.receivepack", "true"]).await?;
    git_config(path, &["receive.quarantine", "false"]).await?;
    Ok(())
}

async fn git_config(path: &Path, args: &[&str]) -> Result<()> {
    let mut full = vec!["config"];
    full.extend_from_slice(args);
    let output = run_git(path, &full, &HashMap::new()).await?;
    if !output.success() {
        bail!(
            "git config {args:?} failed (status {}): {}",
            output.status,
            output.stderr.trim(),
        );
    }
    Ok(())
}

/// Write `hooks/pre-receive` as an executable wrapper that re-enters this
/// binary in hook mode.  Rewritten on every start so the script tracks the
/// running executable's path.
async fn install_pre_receive_hook(path: &Path, name: &str, hook_exe: &Path) -> Result<()> {
    let hooks_dir = path.join("hooks");
    tokio::fs::create_dir_all(&hooks_dir)
        .await
        .with_context(|| format!("failed to create hooks dir: {}", hooks_dir.display()))?;

    let script = format!(
        "#!/bin/sh\nexec \"{}\" pre-receive \"{}\"\n",
        hook_exe.display(),
        name,
    );
    let hook_path = hooks_dir.join("pre-receive");
    tokio::fs::write(&hook_path, script)
        .await
        .with_context(|| format!("failed to write hook: {}", hook_path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(&hook_path, std::fs::Permissions::from_mode(0o755))
            .await
            .with_context(|| format!("failed to chmod hook: {}", hook_path.display()))?;
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
