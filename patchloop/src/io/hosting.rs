//! Code hosting API: opening pull requests.
//!
//! Speaks the GitHub REST shape (`POST /repos/{owner}/{repo}/pulls` with a
//! bearer token), which GitHub Enterprise and Gitea-style hosts also accept.
//! Errors are returned to the caller once; nothing here retries.

use std::sync::LazyLock;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use crate::io::config::HostingConfig;

/// `owner/repo` pair parsed from a remote URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoSlug {
    pub owner: String,
    pub repo: String,
}

/// Parse `owner/repo` from an https, ssh or scp-style remote URL.
///
/// Returns `None` for local paths and anything without two path segments.
pub fn parse_repo_slug(remote_url: &str) -> Option<RepoSlug> {
    static SLUG_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"^(?:https?://[^/]+/|ssh://(?:[^@/]+@)?[^/]+/|[^@/\s]+@[^:/\s]+:)([^/\s]+)/([^/\s]+?)(?:\.git)?/?$")
            .expect("repo slug regex is valid")
    });
    let caps = SLUG_RE.captures(remote_url.trim())?;
    Some(RepoSlug {
        owner: caps[1].to_string(),
        repo: caps[2].to_string(),
    })
}

/// Pull request to open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullRequestSpec {
    pub slug: RepoSlug,
    pub title: String,
    pub body: String,
    /// Branch with the changes.
    pub head: String,
    /// Branch to merge into.
    pub base: String,
}

/// Pull request created on the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullRequest {
    pub url: String,
    pub remote_id: String,
}

pub trait CodeHost: Send + Sync {
    /// Fail fast when the host cannot authenticate.
    fn check_credentials(&self) -> Result<()>;

    fn open_pull_request(&self, spec: &PullRequestSpec) -> Result<PullRequest>;
}

/// GitHub-compatible REST client.
pub struct GitHubHost {
    client: reqwest::blocking::Client,
    api_base: String,
    token_env: String,
    token: Option<String>,
}

impl GitHubHost {
    /// Read the token from the configured environment variable. A missing
    /// token is reported by [`CodeHost::check_credentials`], not here, so
    /// projects without a remote still work.
    pub fn from_env(config: &HostingConfig, timeout: Duration) -> Result<Self> {
        let token = std::env::var(&config.token_env)
            .ok()
            .filter(|t| !t.trim().is_empty());
        Self::new(config, token, timeout)
    }

    pub fn new(config: &HostingConfig, token: Option<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("patchloop/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("build http client")?;
        Ok(Self {
            client,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            token_env: config.token_env.clone(),
            token,
        })
    }
}

impl CodeHost for GitHubHost {
    fn check_credentials(&self) -> Result<()> {
        if self.token.is_none() {
            bail!("missing credential: {} is not set", self.token_env);
        }
        Ok(())
    }

    #[instrument(skip_all, fields(owner = %spec.slug.owner, repo = %spec.slug.repo, head = %spec.head))]
    fn open_pull_request(&self, spec: &PullRequestSpec) -> Result<PullRequest> {
        let token = self
            .token
            .as_deref()
            .ok_or_else(|| anyhow!("missing credential: {} is not set", self.token_env))?;
        let url = format!(
            "{}/repos/{}/{}/pulls",
            self.api_base, spec.slug.owner, spec.slug.repo
        );
        let body = CreatePullBody {
            title: &spec.title,
            head: &spec.head,
            base: &spec.base,
            body: &spec.body,
        };

        let response = self
            .client
            .post(&url)
            .bearer_auth(token)
            .header("accept", "application/vnd.github+json")
            .header("x-github-api-version", "2022-11-28")
            .json(&body)
            .send()
            .context("send pull request")?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().unwrap_or_default();
            bail!("pull request creation failed ({status}): {}", text.trim());
        }
        let created: CreatedPull = response.json().context("parse pull request response")?;
        info!(number = created.number, url = %created.html_url, "pull request opened");
        Ok(PullRequest {
            url: created.html_url,
            remote_id: created.number.to_string(),
        })
    }
}

#[derive(Serialize)]
struct CreatePullBody<'a> {
    title: &'a str,
    head: &'a str,
    base: &'a str,
    body: &'a str,
}

#[derive(Deserialize)]
struct CreatedPull {
    html_url: String,
    number: u64,
}

#[cfg(test)]
mod tests {
    use std::io::{BufRead, BufReader, Read, Write};
    use std::net::TcpListener;
    use std::thread;

    use super::*;

    fn slug(owner: &str, repo: &str) -> Option<RepoSlug> {
        Some(RepoSlug {
            owner: owner.to_string(),
            repo: repo.to_string(),
        })
    }

    #[test]
    fn parses_common_remote_forms() {
        assert_eq!(parse_repo_slug("https://github.com/acme/web.git"), slug("acme", "web"));
        assert_eq!(parse_repo_slug("https://github.com/acme/web"), slug("acme", "web"));
        assert_eq!(parse_repo_slug("git@github.com:acme/web.git"), slug("acme", "web"));
        assert_eq!(
            parse_repo_slug("ssh://git@github.example.com/acme/web.git"),
            slug("acme", "web")
        );
    }

    #[test]
    fn local_paths_have_no_slug() {
        assert_eq!(parse_repo_slug("/srv/git/web.git"), None);
        assert_eq!(parse_repo_slug("file:///srv/git/web.git"), None);
        assert_eq!(parse_repo_slug("https://github.com/acme"), None);
    }

    #[test]
    fn missing_token_fails_credential_check() {
        let host = GitHubHost::new(&HostingConfig::default(), None, Duration::from_secs(1))
            .expect("host");
        let err = host.check_credentials().expect_err("no token");
        assert!(err.to_string().contains("GITHUB_TOKEN"));
    }

    /// Serve exactly one HTTP response and hand back the raw request head.
    fn one_shot_server(status_line: &'static str, body: &'static str) -> (String, thread::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr");
        let handle = thread::spawn(move || {
            let (stream, _) = listener.accept().expect("accept");
            let mut reader = BufReader::new(stream.try_clone().expect("clone"));
            let mut head = String::new();
            let mut content_length = 0usize;
            loop {
                let mut line = String::new();
                reader.read_line(&mut line).expect("read line");
                if line == "\r\n" || line.is_empty() {
                    break;
                }
                if let Some(value) = line.to_ascii_lowercase().strip_prefix("content-length:") {
                    content_length = value.trim().parse().expect("length");
                }
                head.push_str(&line);
            }
            let mut payload = vec![0u8; content_length];
            reader.read_exact(&mut payload).expect("body");
            head.push_str(&String::from_utf8_lossy(&payload));

            let mut stream = stream;
            write!(
                stream,
                "{status_line}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                body.len()
            )
            .expect("write response");
            head
        });
        (format!("http://{addr}"), handle)
    }

    fn spec() -> PullRequestSpec {
        PullRequestSpec {
            slug: RepoSlug {
                owner: "acme".to_string(),
                repo: "web".to_string(),
            },
            title: "Add hello".to_string(),
            body: "body".to_string(),
            head: "patchloop/abc".to_string(),
            base: "main".to_string(),
        }
    }

    #[test]
    fn opens_pull_request_with_bearer_token() {
        let (base, server) = one_shot_server(
            "HTTP/1.1 201 Created",
            r#"{"html_url":"https://github.com/acme/web/pull/7","number":7}"#,
        );
        let config = HostingConfig {
            api_base: base,
            ..HostingConfig::default()
        };
        let host = GitHubHost::new(&config, Some("sekret".to_string()), Duration::from_secs(10))
            .expect("host");
        let pr = host.open_pull_request(&spec()).expect("open");
        assert_eq!(pr.url, "https://github.com/acme/web/pull/7");
        assert_eq!(pr.remote_id, "7");

        let request = server.join().expect("server");
        assert!(request.starts_with("POST /repos/acme/web/pulls"));
        assert!(request.to_ascii_lowercase().contains("authorization: bearer sekret"));
        assert!(request.contains("\"head\":\"patchloop/abc\""));
    }

    #[test]
    fn api_error_is_reported_with_status() {
        let (base, server) = one_shot_server(
            "HTTP/1.1 422 Unprocessable Entity",
            r#"{"message":"Validation Failed"}"#,
        );
        let config = HostingConfig {
            api_base: base,
            ..HostingConfig::default()
        };
        let host = GitHubHost::new(&config, Some("t".to_string()), Duration::from_secs(10))
            .expect("host");
        let err = host.open_pull_request(&spec()).expect_err("422");
        assert!(err.to_string().contains("422"));
        assert!(err.to_string().contains("Validation Failed"));
        server.join().expect("server");
    }
}
