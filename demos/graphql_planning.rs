//! Runs a GraphQL query too large for a single request.
//!
//! The comment selection below asks for up to 100 x 100 x 100 nodes, which
//! GitHub refuses outright. The client estimates it, splits it into
//! sub-queries under the node ceiling and merges the answers.
//!
//! Run with:
//! ```
//! GITHUB_TOKEN=ghp_xxxxxxxxxxxx cargo run --example graphql_planning
//! ```

use integrations_github_access::observability::{init_logging, LogLevel, LoggingConfig};
use integrations_github_access::{GitHubClient, GitHubConfig, RequestContext};
use serde_json::json;
use std::time::Duration;

const QUERY: &str = r#"
query Discussions($owner: String!, $name: String!) {
  repository(owner: $owner, name: $name) {
    nameWithOwner
    pullRequests(first: 100, states: OPEN) {
      totalCount
      nodes {
        number
        title
        reviews(first: 100) {
          nodes {
            comments(first: 100) { totalCount }
          }
        }
      }
    }
  }
}
"#;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    init_logging(LoggingConfig::new().with_level(LogLevel::Info))?;

    let config = GitHubConfig::builder().credentials_from_env().build()?;
    let (client, health) = GitHubClient::connect(config).await?;
    println!(
        "health: healthy={} latency={:?} scopes={:?}",
        health.healthy, health.latency, health.scopes
    );

    let variables = json!({"owner": "rust-lang", "name": "rust"});
    let estimate = client.estimate_graphql_cost(QUERY, &variables, None)?;
    println!(
        "estimate: {} nodes, {} points (ceiling {})",
        estimate.node_count,
        estimate.points,
        client.config().graphql.cost_ceiling
    );

    let ctx = RequestContext::new().with_timeout(Duration::from_secs(120));
    let response = client.run_graphql(QUERY, &variables, None, &ctx).await?;
    let pulls = &response.data.data["repository"]["pullRequests"];
    println!(
        "{} open pull requests, {} returned, {} requests made",
        pulls["totalCount"],
        pulls["nodes"].as_array().map(Vec::len).unwrap_or(0),
        response.meta.attempts
    );
    for error in &response.data.errors {
        println!("error at {}: {}", error.path_string(), error.message);
    }
    if let Some(rate) = &response.meta.rate_limit {
        println!("graphql budget: {}/{} until {}", rate.remaining, rate.limit, rate.reset_at);
    }

    let handle = client.spawn_maintenance();
    handle.shutdown().await;
    Ok(())
}
