//! Per-request deadline, cancellation and waiting policy.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::errors::{GitHubError, GitHubResult};

/// What to do when no credential has budget for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WaitPolicy {
    /// Return immediately with a rate-limit error.
    #[default]
    FailFast,
    /// Wait for the earliest window reset, up to `max_wait`.
    Queue {
        /// Longest acceptable wait.
        max_wait: Duration,
    },
}

/// Caller-controlled limits threaded through every suspension point.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    deadline: Option<Instant>,
    cancel: Option<CancellationToken>,
    wait_policy: Option<WaitPolicy>,
    required_scopes: Vec<String>,
    bypass_cache: bool,
}

impl RequestContext {
    /// Context without deadline or cancellation.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails the operation once `timeout` has elapsed from now.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Instant::now() + timeout);
        self
    }

    /// Fails the operation at `deadline`.
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Cancels the operation when `token` fires.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Overrides the client's default wait policy.
    pub fn with_wait_policy(mut self, policy: WaitPolicy) -> Self {
        self.wait_policy = Some(policy);
        self
    }

    /// Requires credentials carrying these scopes.
    pub fn with_scopes<I, S>(mut self, scopes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_scopes = scopes.into_iter().map(Into::into).collect();
        self
    }

    /// Skips fresh cache entries and always asks GitHub.
    pub fn bypass_cache(mut self) -> Self {
        self.bypass_cache = true;
        self
    }

    /// Wait policy, falling back to `default`.
    pub fn wait_policy_or(&self, default: WaitPolicy) -> WaitPolicy {
        self.wait_policy.unwrap_or(default)
    }

    /// Required scopes.
    pub fn required_scopes(&self) -> &[String] {
        &self.required_scopes
    }

    /// Whether fresh cache entries are ignored.
    pub fn cache_bypassed(&self) -> bool {
        self.bypass_cache
    }

    /// Time left before the deadline, if one is set.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Fails if the caller already gave up.
    pub fn check(&self) -> GitHubResult<()> {
        if self.cancel.as_ref().map(|t| t.is_cancelled()).unwrap_or(false) {
            return Err(GitHubError::cancelled());
        }
        if self.deadline.map(|d| d <= Instant::now()).unwrap_or(false) {
            return Err(GitHubError::deadline_exceeded());
        }
        Ok(())
    }

    /// Drives `fut` until it completes or the caller gives up.
    ///
    /// Giving up drops `fut`; work it merely observes (such as a coalesced
    /// call running on its own task) keeps going.
    pub async fn run<F, T>(&self, fut: F) -> GitHubResult<T>
    where
        F: Future<Output = GitHubResult<T>>,
    {
        self.check()?;
        let cancelled = async {
            match &self.cancel {
                Some(token) => token.cancelled().await,
                None => std::future::pending::<()>().await,
            }
        };
        let deadline = async {
            match self.deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;
            _ = cancelled => Err(GitHubError::cancelled()),
            _ = deadline => Err(GitHubError::deadline_exceeded()),
            result = fut => result,
        }
    }

    /// Cancellable sleep.
    pub async fn sleep(&self, delay: Duration) -> GitHubResult<()> {
        self.run(async {
            tokio::time::sleep(delay).await;
            Ok(())
        })
        .await
    }

    /// Same scopes and policy, without the caller's deadline or token.
    ///
    /// Used for work shared between several callers.
    pub(crate) fn detached(&self) -> Self {
        Self {
            deadline: None,
            cancel: None,
            wait_policy: self.wait_policy,
            required_scopes: self.required_scopes.clone(),
            bypass_cache: self.bypass_cache,
        }
    }
}
