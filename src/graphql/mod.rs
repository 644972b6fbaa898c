//! GraphQL support: parsing, cost estimation and query planning.
//!
//! GitHub rejects queries whose nodes exceed a fixed limit. Documents are
//! parsed here, their node cost estimated from nested connection page
//! sizes, and oversized queries split into sub-queries whose results merge
//! back into the shape the caller asked for.

mod ast;
mod cost;
mod merge;
mod parser;
mod planner;
mod printer;

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use ast::{
    expand_fragments, Directive, Document, Field, FragmentDefinition, FragmentSpread,
    InlineFragment, OperationDefinition, OperationKind, Selection, TypeRef, Value as InputValue,
    VariableDefinition, MAX_EXPANDED_SELECTIONS,
};
pub use cost::{CostAggregation, CostEstimate, CostModel, MultiplierRule};
pub use merge::{merge, SubResult};
pub use parser::{parse, MAX_DEPTH};
pub use planner::{
    Batch, ChunkInfo, PageDirection, PlanExecution, QueryPlan, QueryPlanner, SubQuery,
};
pub use printer::print;

use crate::errors::GitHubResult;

/// Estimates the node cost of `query` under `model`.
pub fn estimate_cost(
    model: &CostModel,
    query: &str,
    operation_name: Option<&str>,
    variables: &Value,
) -> GitHubResult<CostEstimate> {
    let document = expand_fragments(&parse(query)?)?;
    let operation = document.operation(operation_name)?;
    Ok(model.estimate(operation, &operation.resolve_variables(variables)))
}

/// GraphQL error as reported by GitHub.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphQlError {
    /// Error message.
    pub message: String,
    /// GitHub error type, e.g. `NOT_FOUND` or `RATE_LIMITED`.
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
    /// Response path of the failing field.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub path: Vec<Value>,
    /// Source locations.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub locations: Vec<GraphQlLocation>,
    /// Extra error data.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extensions: Option<Value>,
}

impl GraphQlError {
    /// Path rendered as `a.b.0.c`.
    pub fn path_string(&self) -> String {
        self.path
            .iter()
            .map(|p| match p {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .collect::<Vec<_>>()
            .join(".")
    }
}

/// Location in the query document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphQlLocation {
    /// Line number.
    pub line: u32,
    /// Column number.
    pub column: u32,
}

/// `data` and `errors` of a GraphQL response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphQlResult {
    /// Response data; null when the request failed entirely.
    #[serde(default)]
    pub data: Value,
    /// Errors, possibly alongside partial data.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<GraphQlError>,
}

impl GraphQlResult {
    /// True when errors were reported.
    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    /// First error of the given GitHub type.
    pub fn error_of_type(&self, error_type: &str) -> Option<&GraphQlError> {
        self.errors
            .iter()
            .find(|e| e.error_type.as_deref() == Some(error_type))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_estimate_cost_resolves_named_operation() {
        let query = "query A { viewer { login } } query B($n: Int!) { viewer { repositories(first: $n) { totalCount } } }";
        let cost = estimate_cost(&CostModel::default(), query, Some("B"), &json!({"n": 40})).unwrap();
        assert_eq!(cost.node_count, 40);
        assert!(estimate_cost(&CostModel::default(), query, None, &json!({})).is_err());
    }

    #[test]
    fn test_result_deserializes_github_errors() {
        let result: GraphQlResult = serde_json::from_value(json!({
            "data": null,
            "errors": [{
                "type": "RATE_LIMITED",
                "message": "API rate limit exceeded",
                "path": ["repository", "issues", 0],
                "locations": [{"line": 1, "column": 9}]
            }]
        }))
        .unwrap();
        assert!(result.has_errors());
        let error = result.error_of_type("RATE_LIMITED").unwrap();
        assert_eq!(error.path_string(), "repository.issues.0");
        assert_eq!(error.locations[0], GraphQlLocation { line: 1, column: 9 });
    }
}
