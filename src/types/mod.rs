//! Typed results of the façade operations.
//!
//! Only fields GitHub always returns are required; everything else
//! defaults so that trimmed or preview payloads still deserialize.

use std::collections::BTreeMap;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// GitHub user (minimal representation).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    /// User ID.
    pub id: u64,
    /// Username (login).
    pub login: String,
    /// User node ID.
    #[serde(default)]
    pub node_id: String,
    /// Avatar URL.
    #[serde(default)]
    pub avatar_url: String,
    /// User type (User, Organization, Bot).
    #[serde(rename = "type", default)]
    pub user_type: String,
    /// Site admin flag.
    #[serde(default)]
    pub site_admin: bool,
    /// Profile URL.
    #[serde(default)]
    pub html_url: String,
}

/// GitHub repository.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Repository {
    /// Repository ID.
    pub id: u64,
    /// Node ID.
    #[serde(default)]
    pub node_id: String,
    /// Repository name.
    pub name: String,
    /// Full name (owner/repo).
    pub full_name: String,
    /// Owner information.
    pub owner: User,
    /// Whether the repository is private.
    #[serde(default)]
    pub private: bool,
    /// Repository description.
    pub description: Option<String>,
    /// Whether the repository is a fork.
    #[serde(default)]
    pub fork: bool,
    /// HTML URL.
    #[serde(default)]
    pub html_url: String,
    /// Default branch.
    #[serde(default)]
    pub default_branch: String,
    /// Primary language.
    pub language: Option<String>,
    /// Fork count.
    #[serde(default)]
    pub forks_count: u32,
    /// Stargazer count.
    #[serde(default)]
    pub stargazers_count: u32,
    /// Open issue count (pull requests included).
    #[serde(default)]
    pub open_issues_count: u32,
    /// Topics.
    #[serde(default)]
    pub topics: Vec<String>,
    /// Whether issues are enabled.
    #[serde(default = "default_true")]
    pub has_issues: bool,
    /// Whether the repository is archived.
    #[serde(default)]
    pub archived: bool,
    /// License information.
    pub license: Option<License>,
    /// Creation time.
    pub created_at: Option<DateTime<Utc>>,
    /// Last update time.
    pub updated_at: Option<DateTime<Utc>>,
    /// Last push time.
    pub pushed_at: Option<DateTime<Utc>>,
}

fn default_true() -> bool {
    true
}

/// Repository license.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct License {
    /// License key.
    pub key: String,
    /// License name.
    pub name: String,
    /// SPDX ID.
    pub spdx_id: Option<String>,
}

/// GitHub issue. The issues endpoint also returns pull requests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Issue {
    /// Issue ID.
    pub id: u64,
    /// Node ID.
    #[serde(default)]
    pub node_id: String,
    /// Issue number.
    pub number: u32,
    /// Issue title.
    pub title: String,
    /// Issue body.
    pub body: Option<String>,
    /// Issue state.
    pub state: IssueState,
    /// Issue author.
    pub user: Option<User>,
    /// Labels.
    #[serde(default)]
    pub labels: Vec<Label>,
    /// Assignees.
    #[serde(default)]
    pub assignees: Vec<User>,
    /// Milestone.
    pub milestone: Option<Milestone>,
    /// Whether the issue is locked.
    #[serde(default)]
    pub locked: bool,
    /// Comment count.
    #[serde(default)]
    pub comments: u32,
    /// HTML URL.
    #[serde(default)]
    pub html_url: String,
    /// Present when the issue is a pull request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pull_request: Option<serde_json::Value>,
    /// Creation time.
    pub created_at: Option<DateTime<Utc>>,
    /// Last update time.
    pub updated_at: Option<DateTime<Utc>>,
    /// Close time.
    pub closed_at: Option<DateTime<Utc>>,
}

impl Issue {
    /// Returns true when this entry is a pull request.
    pub fn is_pull_request(&self) -> bool {
        self.pull_request.is_some()
    }
}

/// Issue state.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum IssueState {
    /// Open issue.
    Open,
    /// Closed issue.
    Closed,
}

/// GitHub label.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Label {
    /// Label ID.
    pub id: u64,
    /// Label name.
    pub name: String,
    /// Label description.
    pub description: Option<String>,
    /// Label color (hex).
    #[serde(default)]
    pub color: String,
}

/// GitHub milestone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Milestone {
    /// Milestone ID.
    pub id: u64,
    /// Milestone number.
    pub number: u32,
    /// Milestone title.
    pub title: String,
    /// Milestone state.
    pub state: MilestoneState,
    /// Open issue count.
    #[serde(default)]
    pub open_issues: u32,
    /// Closed issue count.
    #[serde(default)]
    pub closed_issues: u32,
    /// Due date.
    pub due_on: Option<DateTime<Utc>>,
}

/// Milestone state.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MilestoneState {
    /// Open milestone.
    Open,
    /// Closed milestone.
    Closed,
}

/// Body of `GET /rate_limit`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RateLimitOverview {
    /// Budgets by resource (`core`, `graphql`, `search`, ...).
    pub resources: BTreeMap<String, RateLimitResource>,
}

/// One resource of [`RateLimitOverview`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct RateLimitResource {
    /// Window size.
    pub limit: u32,
    /// Units left.
    pub remaining: u32,
    /// Reset time as a Unix timestamp.
    pub reset: i64,
    /// Units used.
    #[serde(default)]
    pub used: u32,
}

impl RateLimitResource {
    /// Reset time, if the timestamp is representable.
    pub fn reset_at(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_opt(self.reset, 0).single()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_issue_tolerates_sparse_payloads() {
        let issue: Issue = serde_json::from_value(json!({
            "id": 1,
            "number": 7,
            "title": "Crash on start",
            "body": null,
            "state": "open",
            "user": {"id": 2, "login": "octocat"},
            "pull_request": {"url": "https://api.github.com/repos/o/r/pulls/7"}
        }))
        .unwrap();
        assert_eq!(issue.state, IssueState::Open);
        assert!(issue.is_pull_request());
        assert!(issue.labels.is_empty());
    }

    #[test]
    fn test_rate_limit_overview() {
        let overview: RateLimitOverview = serde_json::from_value(json!({
            "resources": {
                "core": {"limit": 5000, "remaining": 4999, "reset": 1700000000, "used": 1},
                "graphql": {"limit": 5000, "remaining": 5000, "reset": 1700000000}
            },
            "rate": {"limit": 5000, "remaining": 4999, "reset": 1700000000, "used": 1}
        }))
        .unwrap();
        let core = overview.resources["core"];
        assert_eq!(core.remaining, 4999);
        assert_eq!(core.reset_at().unwrap().timestamp(), 1_700_000_000);
        assert_eq!(overview.resources["graphql"].used, 0);
    }
}
