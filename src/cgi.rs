//! CGI gateway around `git-http-backend`.
//!
//! The backend is spawned as a CGI child: the incoming HTTP request is
//! translated into the CGI environment, the request body is streamed to the
//! child's stdin, and the child's CGI-framed stdout (headers, blank line,
//! body) is parsed back into an HTTP response.  The body is opaque to the
//! gateway; pack streams and side-band messages flow through untouched.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use anyhow::{bail, Context, Result};
use axum::body::Body;
use axum::http::request::Parts;
use axum::http::{header::HeaderName, HeaderValue, StatusCode};
use axum::response::Response;
use bytes::Bytes;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::OnceCell;
use tracing::{debug, instrument, warn};

const SERVER_SOFTWARE: &str = concat!("git-proxy/", env!("CARGO_PKG_VERSION"));

// ---------------------------------------------------------------------------
// Backend discovery
// ---------------------------------------------------------------------------

static BACKEND_PATH: OnceCell<PathBuf> = OnceCell::const_new();

const BACKEND_CANDIDATES: &[&str] = &[
    "/usr/lib/git-core/git-http-backend",
    "/usr/libexec/git-core/git-http-backend",
];

/// Locate `git-http-backend`, trying the well-known install paths and then
/// `git --exec-path`.  The first hit is cached for the process lifetime.
pub async fn backend_path() -> Result<&'static Path> {
    let path = BACKEND_PATH
        .get_or_try_init(|| async {
            for candidate in BACKEND_CANDIDATES {
                let candidate = Path::new(candidate);
                if candidate.is_file() {
                    return Ok(candidate.to_path_buf());
                }
            }
            let output = Command::new("git")
                .arg("--exec-path")
                .output()
                .await
                .context("failed to run git --exec-path")?;
            if output.status.success() {
                let exec_path = String::from_utf8_lossy(&output.stdout);
                let candidate = Path::new(exec_path.trim()).join("git-http-backend");
                if candidate.is_file() {
                    return Ok(candidate);
                }
            }
            bail!("git-http-backend not found in any candidate location");
        })
        .await?;
    Ok(path.as_path())
}

// ---------------------------------------------------------------------------
// Environment
// ---------------------------------------------------------------------------

/// CGI environment for a request against the mirror at `mirror`.
/// `script_name` is `/<repo>.git`; `path_info` is the remaining tail.
fn build_env(
    mirror: &Path,
    script_name: &str,
    path_info: &str,
    parts: &Parts,
    body_len: usize,
) -> Vec<(String, String)> {
    let host = parts
        .headers
        .get(axum::http::header::HOST)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("localhost");
    let (server_name, server_port) = match host.rsplit_once(':') {
        Some((name, port)) if port.chars().all(|c| c.is_ascii_digit()) => (name, port),
        _ => (host, "80"),
    };

    let mirror_str = mirror.display().to_string();
    let mut env = vec![
        ("REQUEST_METHOD".to_string(), parts.method.as_str().to_string()),
        (
            "QUERY_STRING".to_string(),
            parts.uri.query().unwrap_or("").to_string(),
        ),
        ("CONTENT_LENGTH".to_string(), body_len.to_string()),
        ("PATH_INFO".to_string(), path_info.to_string()),
        (
            "PATH_TRANSLATED".to_string(),
            format!("{mirror_str}{path_info}"),
        ),
        ("SCRIPT_NAME".to_string(), script_name.to_string()),
        ("SERVER_NAME".to_string(), server_name.to_string()),
        ("SERVER_PORT".to_string(), server_port.to_string()),
        ("SERVER_PROTOCOL".to_string(), "HTTP/1.1".to_string()),
        ("GATEWAY_INTERFACE".to_string(), "CGI/1.1".to_string()),
        ("SERVER_SOFTWARE".to_string(), SERVER_SOFTWARE.to_string()),
        ("GIT_PROJECT_ROOT".to_string(), mirror_str),
        ("GIT_HTTP_EXPORT_ALL".to_string(), "1".to_string()),
        ("GIT_HTTP_RECEIVE_PACK".to_string(), "true".to_string()),
        ("GIT_HTTP_UPLOAD_PACK".to_string(), "true".to_string()),
    ];

    if let Some(content_type) = parts
        .headers
        .get(axum::http::header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
    {
        env.push(("CONTENT_TYPE".to_string(), content_type.to_string()));
    }

    for (name, value) in &parts.headers {
        if let Ok(value) = value.to_str() {
            let cgi_name = format!(
                "HTTP_{}",
                name.as_str().to_ascii_uppercase().replace('-', "_")
            );
            env.push((cgi_name, value.to_string()));
        }
    }

    env
}

// ---------------------------------------------------------------------------
// Gateway
// ---------------------------------------------------------------------------

/// Run the git backend for one request and translate its output into an
/// HTTP response.
#[instrument(skip(parts, body), fields(mirror = %mirror.display(), %script_name, %path_info))]
pub async fn serve(
    mirror: &Path,
    script_name: &str,
    path_info: &str,
    parts: &Parts,
    body: Bytes,
) -> Result<Response> {
    let backend = backend_path().await?;
    let env = build_env(mirror, script_name, path_info, parts, body.len());

    let mut cmd = Command::new(backend);
    cmd.current_dir(mirror);
    for (key, value) in &env {
        cmd.env(key, value);
    }
    cmd.stdin(Stdio::piped());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());

    debug!(backend = %backend.display(), "spawning git-http-backend");
    let mut child = cmd.spawn().context("failed to spawn git-http-backend")?;

    let mut stdin = child
        .stdin
        .take()
        .context("failed to open git-http-backend stdin")?;
    // Feed the body from a separate task so a child that produces output
    // before draining its input cannot deadlock against us.
    let writer = tokio::spawn(async move {
        let _ = stdin.write_all(&body).await;
        let _ = stdin.shutdown().await;
    });

    let output = child
        .wait_with_output()
        .await
        .context("failed to collect git-http-backend output")?;
    let _ = writer.await;

    if !output.status.success() {
        warn!(
            status = %output.status,
            stderr = %String::from_utf8_lossy(&output.stderr).trim(),
            "git-http-backend exited non-zero"
        );
    } else if !output.stderr.is_empty() {
        debug!(stderr = %String::from_utf8_lossy(&output.stderr).trim(), "backend stderr");
    }

    // Even on non-zero exit the parsed body goes back to the client so the
    // end user sees git's native error.
    parse_cgi_output(&output.stdout).into_response()
}

// ---------------------------------------------------------------------------
// CGI output framing
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct CgiOutput {
    status: StatusCode,
    headers: Vec<(String, String)>,
    body: Bytes,
}

impl CgiOutput {
    fn into_response(self) -> Result<Response> {
        let mut builder = Response::builder().status(self.status);
        for (name, value) in &self.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .with_context(|| format!("invalid CGI header name: {name}"))?;
            let value = HeaderValue::from_str(value)
                .with_context(|| format!("invalid CGI header value for {name}"))?;
            builder = builder.header(name, value);
        }
        builder
            .body(Body::from(self.body))
            .context("failed to build response from CGI output")
    }
}

/// Split the child's stdout at the first `\r\n\r\n` or `\n\n` and parse the
/// header section.  Output without a separator is treated as all headers
/// with an empty body.
fn parse_cgi_output(stdout: &[u8]) -> CgiOutput {
    let (header_bytes, body) = split_headers(stdout);
    let header_text = String::from_utf8_lossy(header_bytes);

    let mut status = StatusCode::OK;
    let mut headers = Vec::new();
    for line in header_text.lines() {
        let line = line.trim_end_matches('\r');
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let name = name.trim();
        let value = value.trim();
        if name.eq_ignore_ascii_case("status") {
            // "NNN Reason-Phrase"; only the code is representable on the
            // wire, the phrase is informational.
            let code = value.split_whitespace().next().unwrap_or("");
            match code.parse::<u16>().ok().and_then(|c| StatusCode::from_u16(c).ok()) {
                Some(parsed) => status = parsed,
                None => warn!(%value, "unparseable CGI Status header; defaulting to 200"),
            }
        } else {
            headers.push((name.to_string(), value.to_string()));
        }
    }

    CgiOutput {
        status,
        headers,
        body: Bytes::copy_from_slice(body),
    }
}

/// Find the first header/body separator, scanning byte-by-byte so the
/// earliest of `\r\n\r\n` and `\n\n` wins.
fn split_headers(output: &[u8]) -> (&[u8], &[u8]) {
    for i in 0..output.len() {
        if output[i..].starts_with(b"\r\n\r\n") {
            return (&output[..i], &output[i + 4..]);
        }
        if output[i..].starts_with(b"\n\n") {
            return (&output[..i], &output[i + 2..]);
        }
    }
    (output, &[])
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;

    fn parts(method: &str, uri: &str, headers: &[(&str, &str)]) -> Parts {
        let mut builder = Request::builder().method(method).uri(uri);
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        builder.body(()).unwrap().into_parts().0
    }

    #[test]
    fn crlf_framing_with_status() {
        let raw = b"Status: 404 Not Found\r\nContent-Type: text/plain\r\n\r\nmissing";
        let parsed = parse_cgi_output(raw);
        assert_eq!(parsed.status, StatusCode::NOT_FOUND);
        assert_eq!(
            parsed.headers,
            vec![("Content-Type".to_string(), "text/plain".to_string())]
        );
        assert_eq!(&parsed.body[..], b"missing");
    }

    #[test]
    fn lf_framing_defaults_to_200() {
        let raw = b"Content-Type: application/x-git-upload-pack-advertisement\n\n0000";
        let parsed = parse_cgi_output(raw);
        assert_eq!(parsed.status, StatusCode::OK);
        assert_eq!(&parsed.body[..], b"0000");
    }

    #[test]
    fn missing_separator_means_empty_body() {
        let raw = b"Content-Type: text/plain\nX-Thing: 1";
        let parsed = parse_cgi_output(raw);
        assert_eq!(parsed.headers.len(), 2);
        assert!(parsed.body.is_empty());
    }

    #[test]
    fn earliest_separator_wins() {
        // The LF-LF at offset 24 precedes the CRLF-CRLF later in the body.
        let raw = b"Content-Type: text/plain\n\nbody\r\n\r\nmore";
        let parsed = parse_cgi_output(raw);
        assert_eq!(&parsed.body[..], b"body\r\n\r\nmore");
    }

    #[test]
    fn body_bytes_are_opaque() {
        let raw = b"Content-Type: application/octet-stream\r\n\r\n\x00\x01PACK\n\n\xff";
        let parsed = parse_cgi_output(raw);
        assert_eq!(&parsed.body[..], b"\x00\x01PACK\n\n\xff");
    }

    #[test]
    fn status_header_is_case_insensitive() {
        let raw = b"sTaTuS: 500 Oops\r\n\r\n";
        let parsed = parse_cgi_output(raw);
        assert_eq!(parsed.status, StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn env_contains_cgi_and_git_variables() {
        let parts = parts(
            "POST",
            "http://proxy.local:8080/team/app.git/git-receive-pack?service=git-receive-pack",
            &[
                ("Host", "proxy.local:8080"),
                ("Content-Type", "application/x-git-receive-pack-request"),
                ("Git-Protocol", "version=2"),
            ],
        );
        let env = build_env(
            Path::new("/var/lib/git-proxy/repos/team/app.git"),
            "/team/app.git",
            "/git-receive-pack",
            &parts,
            42,
        );
        let get = |key: &str| {
            env.iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.as_str())
                .unwrap_or_else(|| panic!("missing env var {key}"))
        };

        assert_eq!(get("REQUEST_METHOD"), "POST");
        assert_eq!(get("QUERY_STRING"), "service=git-receive-pack");
        assert_eq!(get("CONTENT_LENGTH"), "42");
        assert_eq!(get("CONTENT_TYPE"), "application/x-git-receive-pack-request");
        assert_eq!(get("PATH_INFO"), "/git-receive-pack");
        assert_eq!(
            get("PATH_TRANSLATED"),
            "/var/lib/git-proxy/repos/team/app.git/git-receive-pack"
        );
        assert_eq!(get("SCRIPT_NAME"), "/team/app.git");
        assert_eq!(get("SERVER_NAME"), "proxy.local");
        assert_eq!(get("SERVER_PORT"), "8080");
        assert_eq!(get("SERVER_PROTOCOL"), "HTTP/1.1");
        assert_eq!(get("GATEWAY_INTERFACE"), "CGI/1.1");
        assert_eq!(get("GIT_PROJECT_ROOT"), "/var/lib/git-proxy/repos/team/app.git");
        assert_eq!(get("GIT_HTTP_EXPORT_ALL"), "1");
        assert_eq!(get("GIT_HTTP_RECEIVE_PACK"), "true");
        assert_eq!(get("GIT_HTTP_UPLOAD_PACK"), "true");
        assert_eq!(get("HTTP_GIT_PROTOCOL"), "version=2");
        assert_eq!(get("HTTP_HOST"), "proxy.local:8080");
    }

    #[test]
    fn host_without_port_defaults_to_80() {
        let parts = parts("GET", "/x.git/info/refs", &[("Host", "proxy.local")]);
        let env = build_env(Path::new("/repos/x.git"), "/x.git", "/info/refs", &parts, 0);
        let get = |key: &str| {
            env.iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.as_str())
                .unwrap()
        };
        assert_eq!(get("SERVER_NAME"), "proxy.local");
        assert_eq!(get("SERVER_PORT"), "80");
    }
}
