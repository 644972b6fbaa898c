//! Issue operations.

use serde::Serialize;

use crate::client::{GitHubClient, Response};
use crate::errors::GitHubResult;
use crate::pagination::{Page, MAX_PER_PAGE};
use crate::resilience::RequestContext;
use crate::types::Issue;

/// Service for issue operations.
pub struct IssuesService<'a> {
    client: &'a GitHubClient,
}

impl<'a> IssuesService<'a> {
    /// Creates a new issues service.
    pub fn new(client: &'a GitHubClient) -> Self {
        Self { client }
    }

    /// Lists one page of issues in a repository. Pull requests are included,
    /// as GitHub returns them; see [`Issue::is_pull_request`].
    pub async fn list(
        &self,
        owner: &str,
        repo: &str,
        params: &ListIssuesParams,
        cursor: Option<&str>,
        ctx: &RequestContext,
    ) -> GitHubResult<Response<Page<Issue>>> {
        self.client
            .list(&format!("/repos/{}/{}/issues", owner, repo), params, cursor, ctx)
            .await
    }

    /// Gets an issue.
    pub async fn get(
        &self,
        owner: &str,
        repo: &str,
        issue_number: u32,
        ctx: &RequestContext,
    ) -> GitHubResult<Response<Issue>> {
        self.client
            .get(&format!("/repos/{}/{}/issues/{}", owner, repo, issue_number), ctx)
            .await
    }
}

/// Parameters for listing issues.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ListIssuesParams {
    /// Filter by milestone number, `*` or `none`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub milestone: Option<String>,
    /// Filter by state.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<IssueStateFilter>,
    /// Filter by assignee.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assignee: Option<String>,
    /// Filter by creator.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub creator: Option<String>,
    /// Filter by mentioned user.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mentioned: Option<String>,
    /// Filter by labels (comma-separated).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub labels: Option<String>,
    /// Sort field.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sort: Option<IssueSort>,
    /// Sort direction.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub direction: Option<SortDirection>,
    /// Only issues updated at or after this ISO 8601 time.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub since: Option<String>,
    /// Items per page.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub per_page: Option<u32>,
}

impl ListIssuesParams {
    /// Filters by state.
    pub fn state(mut self, state: IssueStateFilter) -> Self {
        self.state = Some(state);
        self
    }

    /// Filters by labels.
    pub fn labels<I, S>(mut self, labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let joined: Vec<String> = labels.into_iter().map(|l| l.as_ref().to_string()).collect();
        self.labels = Some(joined.join(","));
        self
    }

    /// Sets the sort order.
    pub fn sort(mut self, sort: IssueSort, direction: SortDirection) -> Self {
        self.sort = Some(sort);
        self.direction = Some(direction);
        self
    }

    /// Sets items per page, capped at 100.
    pub fn per_page(mut self, per_page: u32) -> Self {
        self.per_page = Some(per_page.min(MAX_PER_PAGE));
        self
    }
}

/// Issue state filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IssueStateFilter {
    /// Open issues.
    Open,
    /// Closed issues.
    Closed,
    /// Both.
    All,
}

/// Issue sort field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IssueSort {
    /// Creation time.
    Created,
    /// Last update.
    Updated,
    /// Comment count.
    Comments,
}

/// Sort direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    /// Ascending.
    Asc,
    /// Descending.
    Desc,
}
