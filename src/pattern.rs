//! Glob matching for branch admission and protected paths.
//!
//! Shell-style patterns, anchored to the full string and case-sensitive.
//! `*` stays within one path segment; `**` crosses segments.  `?` and
//! `[...]` character classes are supported (globset defaults).

use anyhow::{Context, Result};
use globset::{GlobBuilder, GlobSet, GlobSetBuilder};

/// A compiled, immutable set of glob patterns.
#[derive(Debug, Clone)]
pub struct PatternSet {
    set: GlobSet,
    sources: Vec<String>,
}

impl PatternSet {
    /// Compile branch-name patterns.  A leading `refs/heads/` on a pattern
    /// is stripped so that patterns and branch names live in the same
    /// namespace.
    pub fn branches<S: AsRef<str>>(patterns: &[S]) -> Result<Self> {
        let mut builder = GlobSetBuilder::new();
        let mut sources = Vec::with_capacity(patterns.len());
        for pattern in patterns {
            let pattern = pattern.as_ref();
            let stripped = pattern.strip_prefix("refs/heads/").unwrap_or(pattern);
            builder.add(compile(stripped)?);
            sources.push(pattern.to_string());
        }
        let set = builder.build().context("failed to build branch glob set")?;
        Ok(Self { set, sources })
    }

    /// Compile protected-path patterns.  A trailing `/` is normalized: the
    /// pattern `foo/` matches everything under `foo` and the bare `foo`
    /// itself.
    pub fn paths<S: AsRef<str>>(patterns: &[S]) -> Result<Self> {
        let mut builder = GlobSetBuilder::new();
        let mut sources = Vec::with_capacity(patterns.len());
        for pattern in patterns {
            let pattern = pattern.as_ref();
            match pattern.strip_suffix('/') {
                Some(dir) if !dir.is_empty() => {
                    builder.add(compile(&format!("{dir}/**"))?);
                    builder.add(compile(dir)?);
                }
                _ => {
                    builder.add(compile(pattern)?);
                }
            }
            sources.push(pattern.to_string());
        }
        let set = builder.build().context("failed to build path glob set")?;
        Ok(Self { set, sources })
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    /// Whether `candidate` matches at least one pattern in the set.
    pub fn matches(&self, candidate: &str) -> bool {
        self.set.is_match(candidate)
    }

    /// The original pattern strings, joined for error messages.
    pub fn joined(&self) -> String {
        self.sources.join(", ")
    }
}

fn compile(pattern: &str) -> Result<globset::Glob> {
    GlobBuilder::new(pattern)
        .literal_separator(true)
        .build()
        .with_context(|| format!("invalid glob pattern: {pattern}"))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn branches(patterns: &[&str]) -> PatternSet {
        PatternSet::branches(patterns).unwrap()
    }

    fn paths(patterns: &[&str]) -> PatternSet {
        PatternSet::paths(patterns).unwrap()
    }

    #[test]
    fn star_is_segment_local() {
        let set = branches(&["agent/*"]);
        assert!(set.matches("agent/test-feature"));
        assert!(!set.matches("agent/a/b"));
        assert!(!set.matches("main"));
    }

    #[test]
    fn bare_star_matches_single_segment_names() {
        let set = branches(&["*"]);
        assert!(set.matches("main"));
        assert!(!set.matches("agent/x"));
    }

    #[test]
    fn double_star_crosses_segments() {
        let set = branches(&["release/**"]);
        assert!(set.matches("release/1/hotfix"));
        let set = paths(&[".github/**"]);
        assert!(set.matches(".github/workflows/ci.yml"));
        assert!(!set.matches("github/workflows/ci.yml"));
    }

    #[test]
    fn refs_heads_prefix_stripped_from_branch_patterns() {
        let set = branches(&["refs/heads/main"]);
        assert!(set.matches("main"));
    }

    #[test]
    fn trailing_slash_matches_dir_and_contents() {
        let set = paths(&["foo/"]);
        assert!(set.matches("foo"));
        assert!(set.matches("foo/bar"));
        assert!(set.matches("foo/bar/baz.txt"));
        assert!(!set.matches("foobar"));
    }

    #[test]
    fn anchored_and_case_sensitive() {
        let set = paths(&["*.lock"]);
        assert!(set.matches("Cargo.lock"));
        assert!(!set.matches("sub/Cargo.lock"));
        assert!(!set.matches("Cargo.LOCK"));
    }

    #[test]
    fn question_mark_and_classes() {
        let set = branches(&["v?"]);
        assert!(set.matches("v1"));
        assert!(!set.matches("v10"));
        let set = paths(&["file[0-9].txt"]);
        assert!(set.matches("file3.txt"));
        assert!(!set.matches("fileA.txt"));
    }

    #[test]
    fn duplicates_and_order_do_not_change_result() {
        let a = paths(&["docs/**", "*.lock"]);
        let b = paths(&["*.lock", "docs/**", "*.lock"]);
        for candidate in ["docs/x.md", "Cargo.lock", "src/lib.rs"] {
            assert_eq!(a.matches(candidate), b.matches(candidate));
        }
    }

    #[test]
    fn empty_set_matches_nothing() {
        let set = paths(&[] as &[&str]);
        assert!(set.is_empty());
        assert!(!set.matches("anything"));
    }
}
