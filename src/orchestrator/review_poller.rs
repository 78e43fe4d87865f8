//! Review feedback poller — one-shot notification when a tracked pull
//! request receives review feedback.
//!
//! State machine: `Idle` (no URL) → `Watching` (URL set, polling) →
//! `Satisfied` (feedback reported, polling stopped). Setting a different
//! URL returns to `Watching`; clearing it returns to `Idle`. Failed
//! checks leave the state untouched and are retried next tick.

use std::env;
use std::future::Future;
use std::pin::Pin;
use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::models::snapshot::ReviewState;
use crate::{AppError, Result};

/// Query interface for review feedback availability.
pub trait ReviewSource: Send + Sync {
    /// Whether the pull request at `pr_url` has any review feedback.
    fn check_feedback<'a>(
        &'a self,
        pr_url: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<bool>> + Send + 'a>>;
}

/// Coordinates of a GitHub pull request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullRequestRef {
    /// Repository owner.
    pub owner: String,
    /// Repository name.
    pub repo: String,
    /// Pull request number.
    pub number: u64,
}

#[allow(clippy::expect_used)] // Literal pattern; exercised by the pull request URL tests.
fn pr_url_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^https?://[^/]+/(?P<owner>[^/]+)/(?P<repo>[^/]+)/pull/(?P<number>\d+)/?")
            .expect("pull request pattern compiles")
    })
}

impl PullRequestRef {
    /// Parse `https://github.com/<owner>/<repo>/pull/<n>[/...]`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Review` if the URL is not a pull request URL.
    pub fn parse(url: &str) -> Result<Self> {
        let caps = pr_url_pattern()
            .captures(url.trim())
            .ok_or_else(|| AppError::Review(format!("not a pull request url: {url}")))?;
        let number = caps["number"]
            .parse()
            .map_err(|err| AppError::Review(format!("invalid pull request number: {err}")))?;
        Ok(Self {
            owner: caps["owner"].to_owned(),
            repo: caps["repo"].to_owned(),
            number,
        })
    }
}

/// Review source backed by the GitHub REST API.
///
/// Feedback is available once the pull request has at least one review
/// or one review comment.
pub struct GithubReviewSource {
    client: reqwest::Client,
    api_base: String,
    token: Option<String>,
}

impl GithubReviewSource {
    /// Build a source for `api_base` with an optional bearer token.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Review` if the HTTP client cannot be built.
    pub fn new(api_base: &str, token: Option<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("agent-conductor/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            api_base: api_base.trim_end_matches('/').to_owned(),
            token,
        })
    }

    /// Build a source reading the token from `GITHUB_TOKEN`, if set.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Review` if the HTTP client cannot be built.
    pub fn from_env(api_base: &str, timeout: Duration) -> Result<Self> {
        let token = env::var("GITHUB_TOKEN").ok().filter(|t| !t.is_empty());
        if token.is_none() {
            debug!("GITHUB_TOKEN not set; review polling is unauthenticated");
        }
        Self::new(api_base, token, timeout)
    }

    /// Whether a token will be sent with requests.
    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        self.token.is_some()
    }

    /// Endpoints queried for a pull request, in order.
    #[must_use]
    pub fn endpoints(&self, pr: &PullRequestRef) -> [String; 2] {
        let base = format!(
            "{}/repos/{}/{}/pulls/{}",
            self.api_base, pr.owner, pr.repo, pr.number
        );
        [format!("{base}/reviews"), format!("{base}/comments")]
    }

    async fn has_items(&self, url: &str) -> Result<bool> {
        let mut request = self
            .client
            .get(url)
            .header("Accept", "application/vnd.github+json");
        if let Some(ref token) = self.token {
            request = request.bearer_auth(token);
        }
        let response = request.send().await?.error_for_status()?;
        let body: Value = response.json().await?;
        Ok(body.as_array().is_some_and(|items| !items.is_empty()))
    }
}

impl ReviewSource for GithubReviewSource {
    fn check_feedback<'a>(
        &'a self,
        pr_url: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<bool>> + Send + 'a>> {
        Box::pin(async move {
            let pr = PullRequestRef::parse(pr_url)?;
            for endpoint in self.endpoints(&pr) {
                if self.has_items(&endpoint).await? {
                    return Ok(true);
                }
            }
            Ok(false)
        })
    }
}

/// Review polling phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReviewPhase {
    /// No URL tracked.
    Idle,
    /// Polling the tracked URL.
    Watching(String),
    /// Feedback reported for the tracked URL; polling stopped.
    Satisfied(String),
}

/// One-shot review feedback state machine.
#[derive(Debug, Clone)]
pub struct ReviewPoller {
    phase: ReviewPhase,
}

impl Default for ReviewPoller {
    fn default() -> Self {
        Self::new()
    }
}

impl ReviewPoller {
    /// Poller in the `Idle` phase.
    #[must_use]
    pub fn new() -> Self {
        Self {
            phase: ReviewPhase::Idle,
        }
    }

    /// Current phase.
    #[must_use]
    pub fn phase(&self) -> &ReviewPhase {
        &self.phase
    }

    /// Track a new URL (`Watching`) or clear it (`Idle`).
    ///
    /// Re-setting the URL already tracked is a no-op, so feedback is not
    /// reported twice for the same pull request.
    pub fn set_tracked_url(&mut self, url: Option<String>) {
        match url {
            None => {
                if self.phase != ReviewPhase::Idle {
                    info!("review tracking cleared");
                }
                self.phase = ReviewPhase::Idle;
            }
            Some(url) => {
                if self.tracked_url() == Some(url.as_str()) {
                    return;
                }
                info!(url, "tracking pull request for review feedback");
                self.phase = ReviewPhase::Watching(url);
            }
        }
    }

    /// URL tracked in any phase.
    #[must_use]
    pub fn tracked_url(&self) -> Option<&str> {
        match &self.phase {
            ReviewPhase::Idle => None,
            ReviewPhase::Watching(url) | ReviewPhase::Satisfied(url) => Some(url),
        }
    }

    /// URL to query this tick; `None` unless `Watching`.
    #[must_use]
    pub fn pending_url(&self) -> Option<&str> {
        match &self.phase {
            ReviewPhase::Watching(url) => Some(url),
            _ => None,
        }
    }

    /// Apply one check result. Returns the URL when feedback is seen for
    /// the first time; the caller fires the callback exactly then.
    pub fn observe(&mut self, result: Result<bool>) -> Option<String> {
        let ReviewPhase::Watching(url) = &self.phase else {
            return None;
        };
        match result {
            Ok(true) => {
                let url = url.clone();
                info!(url, "review feedback available");
                self.phase = ReviewPhase::Satisfied(url.clone());
                Some(url)
            }
            Ok(false) => None,
            Err(err) => {
                warn!(%err, url, "review feedback check failed; retrying next tick");
                None
            }
        }
    }

    /// Externally visible state.
    #[must_use]
    pub fn state(&self) -> ReviewState {
        ReviewState {
            tracked_url: self.tracked_url().map(str::to_owned),
            feedback_seen: matches!(self.phase, ReviewPhase::Satisfied(_)),
        }
    }
}
