//! Push validation and upstream forwarding.
//!
//! The heart of the proxy: every ref update in a push is classified and
//! checked against policy (branch admission, force-push control, divergence,
//! protected paths), and only when the whole batch passes is each update
//! replayed to upstream.  A rejection anywhere rejects everything; an
//! upstream failure mid-forward stops the remainder and rejects the push,
//! which also rolls back the local acceptance.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{bail, Context, Result};
use tracing::{debug, info, instrument, warn};

use crate::config::{ForcePush, RepoPolicy};
use crate::git::commands::{
    diff_name_only, is_ancestor, rev_list_not, rev_parse_verify, run_git_replacing_env,
};
use crate::pattern::PatternSet;

/// The 40-zero oid git uses for "no such object".
pub const ZERO_OID: &str = "0000000000000000000000000000000000000000";

/// Environment variable the git backend sets to point at its quarantine
/// object store during receive.  It must never reach the upstream push.
const QUARANTINE_VAR: &str = "GIT_QUARANTINE_PATH";

// ---------------------------------------------------------------------------
// Ref updates
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefUpdate {
    pub old: String,
    pub new: String,
    pub ref_name: String,
}

impl RefUpdate {
    /// Parse one `<old_oid> <new_oid> <ref_name>` line.
    pub fn parse_line(line: &str) -> Result<Self> {
        let mut fields = line.split_whitespace();
        let (old, new, ref_name) = match (fields.next(), fields.next(), fields.next()) {
            (Some(old), Some(new), Some(ref_name)) if fields.next().is_none() => {
                (old, new, ref_name)
            }
            _ => bail!("malformed ref update line: {line:?}"),
        };
        anyhow::ensure!(is_oid(old), "malformed old oid in update line: {line:?}");
        anyhow::ensure!(is_oid(new), "malformed new oid in update line: {line:?}");
        Ok(Self {
            old: old.to_string(),
            new: new.to_string(),
            ref_name: ref_name.to_string(),
        })
    }

    /// Parse the full pre-receive stdin.  Whitespace-only input is an empty
    /// update list (a successful no-op for the hook).
    pub fn parse_input(input: &str) -> Result<Vec<Self>> {
        input
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(Self::parse_line)
            .collect()
    }
}

fn is_oid(s: &str) -> bool {
    s.len() == 40 && s.bytes().all(|b| b.is_ascii_hexdigit())
}

fn short(oid: &str) -> &str {
    &oid[..8.min(oid.len())]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateClass {
    Create,
    Delete,
    FastForward,
    ForceUpdate,
}

// ---------------------------------------------------------------------------
// Context and verdict
// ---------------------------------------------------------------------------

/// Everything the validator needs to know about the repo being pushed to.
pub struct ValidationContext<'a> {
    pub mirror: &'a Path,
    pub policy: &'a RepoPolicy,
    pub ssh_env: &'a HashMap<String, String>,
}

#[derive(Debug)]
pub struct Verdict {
    pub allowed: bool,
    pub message: String,
}

impl Verdict {
    fn rejected(errors: &[String]) -> Self {
        Self {
            allowed: false,
            message: rejection_envelope(errors),
        }
    }
}

/// An update that survived pass 1, with what pass 2 needs to forward it.
#[derive(Debug)]
struct Accepted {
    update: RefUpdate,
    branch: String,
    class: UpdateClass,
    is_force_push: bool,
}

// ---------------------------------------------------------------------------
// Two-pass protocol
// ---------------------------------------------------------------------------

/// Validate every update, then forward every update; all-or-nothing.
#[instrument(skip_all, fields(mirror = %ctx.mirror.display(), updates = updates.len()))]
pub async fn validate_and_push(
    updates: &[RefUpdate],
    ctx: &ValidationContext<'_>,
) -> Result<Verdict> {
    let policy = Patterns::compile(ctx.policy)?;

    // Pass 1: validate everything, collecting every error rather than
    // stopping at the first.
    let mut errors = Vec::new();
    let mut accepted = Vec::new();
    for update in updates {
        match validate_update(update, ctx, &policy).await? {
            Ok(acc) => accepted.push(acc),
            Err(error) => {
                warn!(ref_name = %update.ref_name, %error, "update rejected");
                errors.push(error);
            }
        }
    }
    if !errors.is_empty() {
        return Ok(Verdict::rejected(&errors));
    }

    // Pass 2: forward in input order.  Nothing was pushed unless pass 1
    // accepted the whole batch.
    let env = push_environment(ctx.ssh_env);
    for acc in &accepted {
        if let Err(stderr) = forward_update(acc, ctx.mirror, &env).await? {
            return Ok(Verdict::rejected(&[format!(
                "Failed to push to upstream:\n{stderr}"
            )]));
        }
        info!(
            branch = %acc.branch,
            class = ?acc.class,
            force = acc.is_force_push,
            "forwarded to upstream"
        );
    }

    Ok(Verdict {
        allowed: true,
        message: "All refs validated and pushed successfully".to_string(),
    })
}

struct Patterns {
    allowed: Option<PatternSet>,
    blocked: Option<PatternSet>,
    protected: PatternSet,
}

impl Patterns {
    fn compile(policy: &RepoPolicy) -> Result<Self> {
        Ok(Self {
            allowed: policy
                .allowed_branches
                .as_deref()
                .map(PatternSet::branches)
                .transpose()
                .context("invalid allowed_branches pattern")?,
            blocked: policy
                .blocked_branches
                .as_deref()
                .map(PatternSet::branches)
                .transpose()
                .context("invalid blocked_branches pattern")?,
            protected: PatternSet::paths(&policy.protected_paths)
                .context("invalid protected_paths pattern")?,
        })
    }
}

/// Check one update against policy.  The outer `Result` is infrastructure
/// failure (git could not run); the inner one is the policy decision.
async fn validate_update(
    update: &RefUpdate,
    ctx: &ValidationContext<'_>,
    patterns: &Patterns,
) -> Result<std::result::Result<Accepted, String>> {
    // Branch admission.
    let Some(branch) = update.ref_name.strip_prefix("refs/heads/") else {
        return Ok(Err(format!(
            "Only branch pushes allowed (refs/heads/*), got: {}",
            update.ref_name
        )));
    };
    if let Some(allowed) = &patterns.allowed {
        if !allowed.matches(branch) {
            return Ok(Err(format!(
                "Branch '{branch}' is not in allowed list. Allowed patterns: {}",
                allowed.joined()
            )));
        }
    } else if let Some(blocked) = &patterns.blocked {
        if blocked.matches(branch) {
            return Ok(Err(format!(
                "Branch '{branch}' is blocked. Blocked patterns: {}",
                blocked.joined()
            )));
        }
    }

    // Force-push classification.  A zero new oid is a deletion regardless
    // of the old side, covering the degenerate zero-to-zero update.
    let (class, is_force_push) = if update.new == ZERO_OID {
        if ctx.policy.force_push == ForcePush::Deny {
            return Ok(Err(
                "Branch deletion is not allowed (force_push: deny)".to_string()
            ));
        }
        (UpdateClass::Delete, false)
    } else if update.old == ZERO_OID {
        (UpdateClass::Create, false)
    } else if is_ancestor(ctx.mirror, &update.old, &update.new).await? {
        (UpdateClass::FastForward, false)
    } else {
        if ctx.policy.force_push == ForcePush::Deny {
            return Ok(Err(format!(
                "Force push detected and not allowed. Old: {}, New: {}",
                short(&update.old),
                short(&update.new)
            )));
        }
        (UpdateClass::ForceUpdate, true)
    };

    // Divergence check: the client's old oid must match the mirror's view
    // of upstream.  Skipped for creates (no baseline) and force pushes
    // (history rewrite is the point).
    if !is_force_push && class != UpdateClass::Create {
        let remote_ref = format!("refs/remotes/origin/{branch}");
        if let Some(remote) = rev_parse_verify(ctx.mirror, &remote_ref).await? {
            if remote != update.old {
                return Ok(Err(format!(
                    "Upstream has diverged. Expected: {}, Actual: {}. Please fetch and rebase.",
                    short(&update.old),
                    short(&remote)
                )));
            }
        }
        // No such branch upstream yet: nothing to diverge from.
    }

    // Protected paths: the net diff against the base branch must not touch
    // any protected pattern.
    if !patterns.protected.is_empty() && class != UpdateClass::Delete {
        let base = format!("origin/{}", ctx.policy.base_branch);
        if rev_parse_verify(ctx.mirror, &base).await?.is_none() {
            return Ok(Err(format!(
                "Base branch {base} not found. Cannot validate protected paths."
            )));
        }

        let new_commits = rev_list_not(ctx.mirror, &update.new, &base).await?;
        if new_commits.is_empty() {
            // Tip already reachable from base; fast-forwarding to or past
            // base introduces nothing to check.
            debug!(branch = %branch, "No new commits to check");
        } else {
            let changed = diff_name_only(ctx.mirror, &base, &update.new).await?;
            let violations: Vec<&String> = changed
                .iter()
                .filter(|path| patterns.protected.matches(path))
                .collect();
            if !violations.is_empty() {
                let mut message = String::from("Changes to protected paths detected:");
                for path in violations {
                    message.push_str("\n  - ");
                    message.push_str(path);
                }
                return Ok(Err(message));
            }
        }
    }

    Ok(Ok(Accepted {
        update: update.clone(),
        branch: branch.to_string(),
        class,
        is_force_push,
    }))
}

/// Replay one accepted update to upstream.  `Ok(Err(stderr))` is an
/// upstream rejection; the caller stops forwarding and fails the push.
async fn forward_update(
    acc: &Accepted,
    mirror: &Path,
    env: &HashMap<String, String>,
) -> Result<std::result::Result<(), String>> {
    let refspec;
    let args: Vec<&str> = match acc.class {
        UpdateClass::Delete => vec!["push", "origin", "--delete", &acc.branch],
        _ if acc.is_force_push => {
            refspec = format!("{}:refs/heads/{}", acc.update.new, acc.branch);
            vec!["push", "--force", "origin", &refspec]
        }
        _ => {
            refspec = format!("{}:refs/heads/{}", acc.update.new, acc.branch);
            vec!["push", "origin", &refspec]
        }
    };

    let output = run_git_replacing_env(mirror, &args, env).await?;
    if output.success() {
        Ok(Ok(()))
    } else {
        Ok(Err(output.stderr.trim_end().to_string()))
    }
}

/// The forwarder's environment: the ambient environment minus the backend's
/// quarantine variable, plus the SSH overlay.  Passed as a full replacement
/// so the push sees the main object store, not the quarantine.
fn push_environment(ssh_env: &HashMap<String, String>) -> HashMap<String, String> {
    let mut env: HashMap<String, String> = std::env::vars()
        .filter(|(key, _)| key != QUARANTINE_VAR)
        .collect();
    for (key, value) in ssh_env {
        env.insert(key.clone(), value.clone());
    }
    env
}

// ---------------------------------------------------------------------------
// Rejection formatting
// ---------------------------------------------------------------------------

/// The envelope every policy and forwarding rejection is wrapped in before
/// it reaches the client via the pre-receive stderr channel.
pub fn rejection_envelope(errors: &[String]) -> String {
    let bar = "=".repeat(50);
    let mut out = String::new();
    out.push('\n');
    out.push_str(&bar);
    out.push('\n');
    out.push_str("PUSH REJECTED\n");
    out.push_str(&bar);
    out.push('\n');
    for error in errors {
        out.push_str(error);
        out.push('\n');
    }
    out.push_str(&bar);
    out.push('\n');
    out.push('\n');
    out
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
