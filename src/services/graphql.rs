//! GraphQL operations against `POST /graphql`.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value as Json;
use tracing::warn;

use crate::client::{GitHubClient, RequestSpec, Response, ResponseMeta};
use crate::errors::{GitHubError, GitHubErrorKind, GitHubResult, RateLimitInfo};
use crate::graphql::{
    Batch, CostEstimate, GraphQlError, GraphQlResult, OperationDefinition, OperationKind,
    QueryPlan, Selection,
};
use crate::observability::TelemetryEvent;
use crate::resilience::{GraphQlRateLimit, RequestContext};

/// GraphQL request body.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GraphQlRequest<'a> {
    query: &'a str,
    variables: &'a Json,
    #[serde(skip_serializing_if = "Option::is_none")]
    operation_name: Option<&'a str>,
}

/// Service for GraphQL operations.
pub struct GraphQlService<'a> {
    client: &'a GitHubClient,
}

impl<'a> GraphQlService<'a> {
    /// Creates a new GraphQL service.
    pub fn new(client: &'a GitHubClient) -> Self {
        Self { client }
    }

    /// Estimates an operation without sending it.
    pub fn estimate(
        &self,
        query: &str,
        variables: &Json,
        operation_name: Option<&str>,
    ) -> GitHubResult<CostEstimate> {
        self.client.planner().estimate(query, operation_name, variables)
    }

    /// Runs an operation.
    ///
    /// Operations within the node ceiling are sent as they are. Larger ones
    /// are split into sub-queries, sent in batches that each stay under the
    /// ceiling, and merged back into the shape of the original document.
    ///
    /// # Errors
    ///
    /// `QueryTooLarge` when no split fits, `InvalidQuery` when the document
    /// does not parse, plus any error of the underlying requests. Errors
    /// GitHub reports inside a successful response are returned in the
    /// result, not as `Err`.
    ///
    /// A split operation whose request fails keeps going: the failure is
    /// reported as an error on the affected sub-query's paths and the other
    /// batches still merge. It only fails as a whole when no batch succeeds
    /// or the caller cancels.
    pub async fn run(
        &self,
        query: &str,
        variables: &Json,
        operation_name: Option<&str>,
        ctx: &RequestContext,
    ) -> GitHubResult<Response<GraphQlResult>> {
        let plan = self.client.planner().plan(query, operation_name, variables)?;
        if plan.is_split() {
            self.client.telemetry().emit(TelemetryEvent::QueryPlanned {
                estimated_cost: plan.estimate().node_count,
                sub_queries: plan.sub_queries().len(),
            });
        }

        let group = operation_group(plan.operation());
        let shareable = plan.operation().kind == OperationKind::Query;
        let mut meta = ResponseMeta::default();
        let mut execution = plan.execution();
        let mut first_failure: Option<GitHubError> = None;
        let mut answered = false;

        while let Some(batch) = execution.next_batch() {
            let body = serde_json::to_vec(&GraphQlRequest {
                query: &batch.query,
                variables: &batch.variables,
                operation_name: batch.operation_name.as_deref(),
            })?;
            let spec = RequestSpec::graphql(
                self.client.graphql_url().clone(),
                Bytes::from(body),
                group.clone(),
                batch_points(&plan, &batch),
                shareable,
            );
            let outcome = match self.client.fetch(spec, ctx).await {
                Ok(fetched) => {
                    meta.absorb(&fetched.meta);
                    fetched.decode::<GraphQlResult>()
                }
                Err(error) => Err(error),
            };
            match outcome {
                Ok(result) => {
                    answered = true;
                    execution.complete(&batch, result);
                }
                Err(error) if plan.is_split() && !caller_gave_up(&error) => {
                    warn!(
                        sub_queries = batch.members.len(),
                        error = %error,
                        "GraphQL batch failed; continuing with the rest of the plan"
                    );
                    execution.fail(&batch, &error);
                    first_failure.get_or_insert(error);
                }
                Err(error) => return Err(error),
            }
        }

        if let (false, Some(error)) = (answered, first_failure) {
            return Err(error);
        }
        Ok(Response {
            data: execution.finish()?,
            meta,
        })
    }

    /// Runs an operation and decodes `data` into `T`.
    ///
    /// # Errors
    ///
    /// Any error GitHub reports fails the call: `NOT_FOUND` maps to
    /// `NotFound`, `FORBIDDEN` to `Forbidden`, anything else to
    /// `QueryFailed`.
    pub async fn run_typed<T: DeserializeOwned>(
        &self,
        query: &str,
        variables: &Json,
        operation_name: Option<&str>,
        ctx: &RequestContext,
    ) -> GitHubResult<Response<T>> {
        let Response { data, meta } = self.run(query, variables, operation_name, ctx).await?;
        if let Some(first) = data.errors.first() {
            if data.errors.len() > 1 {
                warn!(errors = data.errors.len(), "GraphQL response carried several errors");
            }
            return Err(error_from_graphql(first));
        }
        let data = serde_json::from_value(data.data).map_err(|e| {
            GitHubError::deserialization(format!("Failed to deserialize GraphQL data: {}", e))
        })?;
        Ok(Response { data, meta })
    }
}

fn caller_gave_up(error: &GitHubError) -> bool {
    matches!(
        error.kind(),
        GitHubErrorKind::Cancelled | GitHubErrorKind::DeadlineExceeded
    )
}

/// `graphql:<first root field>`.
fn operation_group(operation: &OperationDefinition) -> String {
    let root = operation.selection_set.iter().find_map(|s| match s {
        Selection::Field(field) => Some(field.name.as_str()),
        _ => None,
    });
    format!("graphql:{}", root.unwrap_or(operation.kind.as_str()))
}

/// Points reserved for one batch: the whole estimate for an unsplit
/// operation, otherwise the batch's share of it.
fn batch_points(plan: &QueryPlan, batch: &Batch) -> u32 {
    let estimate = plan.estimate();
    let points = if plan.is_split() && estimate.node_count > 0 {
        (estimate.points.saturating_mul(batch.cost) / estimate.node_count).max(1)
    } else {
        estimate.points
    };
    u32::try_from(points).unwrap_or(u32::MAX)
}

/// Maps an error GitHub reported in a GraphQL response.
pub(crate) fn error_from_graphql(error: &GraphQlError) -> GitHubError {
    let kind = match error.error_type.as_deref() {
        Some("NOT_FOUND") => GitHubErrorKind::NotFound,
        Some("FORBIDDEN") => GitHubErrorKind::Forbidden,
        Some("RATE_LIMITED") => GitHubErrorKind::RateLimited,
        _ => GitHubErrorKind::QueryFailed,
    };
    let mut mapped = GitHubError::new(kind, error.message.clone());
    if let Some(code) = &error.error_type {
        mapped = mapped.with_github_code(code.clone());
    }
    mapped
}

/// GraphQL answers an exhausted budget with 200 and a `RATE_LIMITED` error.
pub(crate) fn graphql_rate_limited(
    result: &GraphQlResult,
    rate_limit: Option<RateLimitInfo>,
) -> Option<GitHubError> {
    let error = result.error_of_type("RATE_LIMITED")?;
    let mapped = error_from_graphql(error);
    Some(match rate_limit {
        Some(info) => mapped.with_rate_limit(info),
        None => mapped,
    })
}

/// The `rateLimit` object selected by the query, if any. Split queries
/// select it under a sub-query alias.
pub(crate) fn reported_rate_limit(data: &Json) -> Option<GraphQlRateLimit> {
    data.as_object()?
        .iter()
        .filter(|(key, _)| *key == "rateLimit" || key.ends_with("_rateLimit"))
        .find_map(|(_, value)| serde_json::from_value(value.clone()).ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use test_case::test_case;

    #[test_case(Some("NOT_FOUND"), GitHubErrorKind::NotFound; "not found")]
    #[test_case(Some("FORBIDDEN"), GitHubErrorKind::Forbidden; "forbidden")]
    #[test_case(Some("RATE_LIMITED"), GitHubErrorKind::RateLimited; "rate limited")]
    #[test_case(Some("SOMETHING_ELSE"), GitHubErrorKind::QueryFailed; "other type")]
    #[test_case(None, GitHubErrorKind::QueryFailed; "untyped")]
    fn test_error_from_graphql(error_type: Option<&str>, kind: GitHubErrorKind) {
        let error = GraphQlError {
            message: "boom".into(),
            error_type: error_type.map(str::to_string),
            path: Vec::new(),
            locations: Vec::new(),
            extensions: None,
        };
        let mapped = error_from_graphql(&error);
        assert_eq!(mapped.kind(), kind);
        assert_eq!(mapped.github_code(), error_type);
    }

    #[test]
    fn test_reported_rate_limit_under_alias() {
        let data = json!({
            "s0_repository": {"name": "widgets"},
            "s0_rateLimit": {"cost": 3, "remaining": 4990, "resetAt": "2030-01-01T00:00:00Z", "limit": 5000}
        });
        let reported = reported_rate_limit(&data).unwrap();
        assert_eq!(reported.cost, 3);
        assert_eq!(reported.limit, Some(5000));
        assert!(reported_rate_limit(&json!({"viewer": {"login": "octocat"}})).is_none());
    }

    #[test]
    fn test_operation_group() {
        let document = crate::graphql::parse("query { viewer { login } repository(owner: \"o\", name: \"r\") { name } }").unwrap();
        let operation = document.operation(None).unwrap();
        assert_eq!(operation_group(operation), "graphql:viewer");
    }
}
