//! Git subprocess wrappers and mirror management.
//!
//! All operations shell out to the `git` binary via `tokio::process::Command`
//! for non-blocking execution.  SSH credential injection happens through
//! environment variables supplied by callers.

pub mod commands;
pub mod mirror;

pub use mirror::MirrorStore;
