//! Static cost estimation for GraphQL operations.
//!
//! GitHub bounds a query by the number of nodes it may return, computed from
//! the `first`/`last` page sizes of nested connections. The estimate never
//! looks at data, only at the document and its variables.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as Json};

use super::ast::{Field, OperationDefinition, Selection};
use crate::errors::{GitHubError, GitHubResult};

/// Which fields count as connections.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MultiplierRule {
    /// Every field carrying a page-size argument.
    AllConnections,
    /// Only the listed field names.
    Only(Vec<String>),
}

/// How connection costs add up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CostAggregation {
    /// Sum of page-size products along each root-to-leaf connection path.
    LeafPaths,
    /// Sum of page-size products at every connection, inner and leaf.
    AllConnections,
}

/// Tunable cost model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostModel {
    /// Arguments read as page sizes.
    pub page_size_arguments: Vec<String>,
    /// Which fields multiply.
    pub multiplier: MultiplierRule,
    /// Aggregation across connections.
    pub aggregation: CostAggregation,
    /// Page size assumed when the argument is absent or unresolvable.
    pub default_page_size: u64,
    /// Requests per rate-limit point.
    pub requests_per_point: u64,
}

impl Default for CostModel {
    fn default() -> Self {
        Self {
            page_size_arguments: vec!["first".to_string(), "last".to_string()],
            multiplier: MultiplierRule::AllConnections,
            aggregation: CostAggregation::LeafPaths,
            default_page_size: 100,
            requests_per_point: 100,
        }
    }
}

/// Estimated size of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct CostEstimate {
    /// Nodes the operation may return under the model's aggregation.
    pub node_count: u64,
    /// Connection fetches GitHub performs to answer it.
    pub request_count: u64,
    /// Rate-limit points GitHub would charge.
    pub points: u64,
}

impl CostModel {
    /// Checks the model is usable.
    pub fn validate(&self) -> GitHubResult<()> {
        if self.page_size_arguments.is_empty() {
            return Err(GitHubError::configuration(
                "Cost model needs at least one page-size argument",
            ));
        }
        if self.default_page_size == 0 {
            return Err(GitHubError::configuration(
                "Cost model default page size must be positive",
            ));
        }
        if self.requests_per_point == 0 {
            return Err(GitHubError::configuration(
                "Cost model requests per point must be positive",
            ));
        }
        Ok(())
    }

    /// Estimates an operation; `variables` must already include defaults.
    pub fn estimate(
        &self,
        operation: &OperationDefinition,
        variables: &Map<String, Json>,
    ) -> CostEstimate {
        let node_count = self.selections_cost(&operation.selection_set, variables);
        let request_count = self.selections_requests(&operation.selection_set, variables);
        let points = ((request_count + self.requests_per_point / 2) / self.requests_per_point).max(1);
        CostEstimate {
            node_count,
            request_count,
            points,
        }
    }

    /// Page size of `field` when it counts as a connection.
    pub fn page_size(&self, field: &Field, variables: &Map<String, Json>) -> Option<u64> {
        if let MultiplierRule::Only(names) = &self.multiplier {
            if !names.iter().any(|n| n == &field.name) {
                return None;
            }
        }
        let mut found = false;
        let mut size = 0;
        for argument in &self.page_size_arguments {
            if let Some(value) = field.argument(argument) {
                found = true;
                size = size.max(value.as_u64(variables).unwrap_or(self.default_page_size));
            }
        }
        if !found {
            return None;
        }
        Some(size)
    }

    /// Cost of a selection set with a unit prefix multiplier.
    pub(crate) fn selections_cost(
        &self,
        selections: &[Selection],
        variables: &Map<String, Json>,
    ) -> u64 {
        selections
            .iter()
            .map(|s| self.selection_cost(s, variables))
            .fold(0u64, u64::saturating_add)
    }

    /// Cost of one selection with a unit prefix multiplier.
    ///
    /// Both aggregations are linear in the prefix, so the cost below a path
    /// with multiplier `m` is `m` times this value.
    pub(crate) fn selection_cost(&self, selection: &Selection, variables: &Map<String, Json>) -> u64 {
        match selection {
            Selection::Field(field) => match self.page_size(field, variables) {
                Some(size) => size.saturating_mul(self.per_node_cost(field, variables)),
                None => self.selections_cost(&field.selection_set, variables),
            },
            Selection::InlineFragment(fragment) => {
                self.selections_cost(&fragment.selection_set, variables)
            }
            Selection::FragmentSpread(_) => 0,
        }
    }

    /// Cost contributed by each node of a connection field.
    pub(crate) fn per_node_cost(&self, field: &Field, variables: &Map<String, Json>) -> u64 {
        let inner = self.selections_cost(&field.selection_set, variables);
        match self.aggregation {
            CostAggregation::LeafPaths => inner.max(1),
            CostAggregation::AllConnections => inner.saturating_add(1),
        }
    }

    fn selections_requests(&self, selections: &[Selection], variables: &Map<String, Json>) -> u64 {
        selections
            .iter()
            .map(|selection| match selection {
                Selection::Field(field) => {
                    let inner = self.selections_requests(&field.selection_set, variables);
                    match self.page_size(field, variables) {
                        Some(size) => size.saturating_mul(inner).saturating_add(1),
                        None => inner,
                    }
                }
                Selection::InlineFragment(fragment) => {
                    self.selections_requests(&fragment.selection_set, variables)
                }
                Selection::FragmentSpread(_) => 0,
            })
            .fold(0u64, u64::saturating_add)
    }
}
