//! Query planning through the client: split operations must come back in
//! the same shape as the operation sent whole.

use std::sync::Arc;

use integrations_github_access::config::GraphQlConfig;
use integrations_github_access::graphql::CostModel;
use integrations_github_access::mocks::{
    issue_graph, CollectingTelemetry, MockResponse, MockTransport,
};
use integrations_github_access::observability::{Telemetry, TelemetryEvent};
use integrations_github_access::{
    CredentialConfig, GitHubClient, GitHubConfig, GitHubErrorKind, RequestContext,
};
use pretty_assertions::assert_eq;
use serde_json::{json, Value};

const ISSUES: &str = r#"
query Issues($owner: String!) {
  repository(owner: $owner, name: "widgets") {
    name
    issues(first: 40) {
      totalCount
      nodes {
        number
        title
        comments(first: 10) { nodes { body } }
      }
    }
  }
}
"#;

const GITHUB_NODE_LIMIT: u64 = 100;

fn config(cost_ceiling: u64) -> GitHubConfig {
    GitHubConfig::builder()
        .credential(CredentialConfig::pat("ghp_graph"))
        .graphql(GraphQlConfig {
            cost_ceiling,
            ..GraphQlConfig::default()
        })
        .build()
        .unwrap()
}

fn transport() -> Arc<MockTransport> {
    Arc::new(
        MockTransport::new()
            .with_graph(issue_graph(25, 3).with_node_limit(GITHUB_NODE_LIMIT, CostModel::default())),
    )
}

#[tokio::test]
async fn test_split_query_matches_whole_query() {
    let variables = json!({"owner": "octo"});

    let whole_transport = Arc::new(MockTransport::new().with_graph(issue_graph(25, 3)));
    let whole_client = GitHubClient::with_transport(config(500_000), whole_transport).unwrap();
    let whole = whole_client
        .run_graphql(ISSUES, &variables, None, &RequestContext::new())
        .await
        .unwrap();
    assert!(whole.data.errors.is_empty(), "{:?}", whole.data.errors);

    let sink = Arc::new(CollectingTelemetry::default());
    let split_transport = transport();
    let split_client = GitHubClient::builder(config(GITHUB_NODE_LIMIT))
        .transport(split_transport.clone())
        .telemetry(Telemetry::new(sink.clone()))
        .build()
        .unwrap();
    let split = split_client
        .run_graphql(ISSUES, &variables, None, &RequestContext::new())
        .await
        .unwrap();

    assert!(split.data.errors.is_empty(), "{:?}", split.data.errors);
    assert_eq!(split.data.data, whole.data.data);

    let nodes = split.data.data["repository"]["issues"]["nodes"].as_array().unwrap();
    assert_eq!(nodes.len(), 25);
    assert_eq!(nodes[24]["number"], json!(25));
    assert_eq!(split.data.data["repository"]["name"], json!("widgets"));

    // Pages of ten: the third comes back short, so the fourth is never sent.
    assert_eq!(split_transport.calls_to("/graphql"), 3);
    assert_eq!(split.meta.attempts, 3);
    assert_eq!(
        sink.count(|e| matches!(e, TelemetryEvent::QueryPlanned { sub_queries: 5, .. })),
        1
    );
}

#[tokio::test]
async fn test_unsplit_query_over_github_limit_fails_typed() {
    // The planner believes the query fits; GitHub refuses it.
    let client = GitHubClient::with_transport(config(1_000), transport()).unwrap();

    let error = client
        .run_graphql_typed::<Value>(ISSUES, &json!({"owner": "octo"}), None, &RequestContext::new())
        .await
        .unwrap_err();
    assert_eq!(error.kind(), GitHubErrorKind::QueryFailed);
    assert_eq!(error.github_code(), Some("MAX_NODE_LIMIT_EXCEEDED"));
}

#[tokio::test]
async fn test_oversized_connection_is_refused_before_sending() {
    let transport = transport();
    let client = GitHubClient::with_transport(config(GITHUB_NODE_LIMIT), transport.clone()).unwrap();

    let error = client
        .run_graphql(
            "query { viewer { repositories(first: 500) { totalCount } } }",
            &json!({}),
            None,
            &RequestContext::new(),
        )
        .await
        .unwrap_err();
    assert_eq!(error.kind(), GitHubErrorKind::QueryTooLarge);
    assert_eq!(transport.call_count(), 0);
}

#[test]
fn test_estimate_does_not_send() {
    let transport = transport();
    let client = GitHubClient::with_transport(config(GITHUB_NODE_LIMIT), transport.clone()).unwrap();

    let estimate = client
        .estimate_graphql_cost(ISSUES, &json!({"owner": "octo"}), Some("Issues"))
        .unwrap();
    assert_eq!(estimate.node_count, 400);
    assert_eq!(estimate.points, 1);
    assert_eq!(transport.call_count(), 0);
}

#[tokio::test]
async fn test_failed_batch_keeps_pages_already_fetched() {
    let transport = Arc::new(
        MockTransport::new()
            .with_graph(issue_graph(25, 3).with_node_limit(GITHUB_NODE_LIMIT, CostModel::default()))
            .fail_graph_call(2, MockResponse::error(502, "Bad Gateway")),
    );
    let config = GitHubConfig::builder()
        .credential(CredentialConfig::pat("ghp_graph"))
        .graphql(GraphQlConfig {
            cost_ceiling: GITHUB_NODE_LIMIT,
            ..GraphQlConfig::default()
        })
        .no_retry()
        .build()
        .unwrap();
    let client = GitHubClient::with_transport(config, transport.clone()).unwrap();

    let result = client
        .run_graphql(ISSUES, &json!({"owner": "octo"}), None, &RequestContext::new())
        .await
        .unwrap();

    // Later pages depend on the failed page's cursor and are never sent.
    assert_eq!(transport.calls_to("/graphql"), 2);
    assert_eq!(result.data.data["repository"]["name"], json!("widgets"));
    let numbers: Vec<u64> = result.data.data["repository"]["issues"]["nodes"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|n| n["number"].as_u64())
        .collect();
    assert!(!numbers.is_empty() && numbers.len() < 25);
    assert_eq!(numbers, (1..=numbers.len() as u64).collect::<Vec<_>>());

    let failure = result
        .data
        .errors
        .iter()
        .find(|e| e.path == vec![json!("repository"), json!("issues")])
        .unwrap();
    assert_eq!(failure.extensions.as_ref().unwrap()["status"], json!(502));
}

#[tokio::test]
async fn test_unsplit_request_failure_is_returned() {
    let transport = Arc::new(
        MockTransport::new()
            .with_graph(issue_graph(3, 1))
            .fail_graph_call(1, MockResponse::error(502, "Bad Gateway")),
    );
    let config = GitHubConfig::builder()
        .credential(CredentialConfig::pat("ghp_graph"))
        .no_retry()
        .build()
        .unwrap();
    let client = GitHubClient::with_transport(config, transport).unwrap();

    let error = client
        .run_graphql(ISSUES, &json!({"owner": "octo"}), None, &RequestContext::new())
        .await
        .unwrap_err();
    assert_eq!(error.kind(), GitHubErrorKind::ServerError);
}

#[test]
fn test_deeply_nested_document_is_refused_without_sending() {
    let transport = transport();
    let client = GitHubClient::with_transport(config(GITHUB_NODE_LIMIT), transport.clone()).unwrap();
    let depth = 100_000;
    let query = format!("query {{ {} id {} }}", "viewer { ".repeat(depth), "} ".repeat(depth));

    let error = client
        .estimate_graphql_cost(&query, &json!({}), None)
        .unwrap_err();
    assert_eq!(error.kind(), GitHubErrorKind::InvalidQuery);
    assert_eq!(transport.call_count(), 0);
}
