//! Repository operations.

use crate::client::{GitHubClient, Response};
use crate::errors::GitHubResult;
use crate::pagination::{Page, PaginationParams};
use crate::resilience::RequestContext;
use crate::types::Repository;

/// Service for repository operations.
pub struct RepositoriesService<'a> {
    client: &'a GitHubClient,
}

impl<'a> RepositoriesService<'a> {
    /// Creates a new repositories service.
    pub fn new(client: &'a GitHubClient) -> Self {
        Self { client }
    }

    /// Gets a repository.
    pub async fn get(
        &self,
        owner: &str,
        repo: &str,
        ctx: &RequestContext,
    ) -> GitHubResult<Response<Repository>> {
        self.client
            .get(&format!("/repos/{}/{}", owner, repo), ctx)
            .await
    }

    /// Lists one page of an organization's repositories.
    pub async fn list_for_org(
        &self,
        org: &str,
        params: &PaginationParams,
        cursor: Option<&str>,
        ctx: &RequestContext,
    ) -> GitHubResult<Response<Page<Repository>>> {
        self.client
            .list(&format!("/orgs/{}/repos", org), params, cursor, ctx)
            .await
    }

    /// Lists one page of a user's public repositories.
    pub async fn list_for_user(
        &self,
        username: &str,
        params: &PaginationParams,
        cursor: Option<&str>,
        ctx: &RequestContext,
    ) -> GitHubResult<Response<Page<Repository>>> {
        self.client
            .list(&format!("/users/{}/repos", username), params, cursor, ctx)
            .await
    }
}
