//! Splitting oversized queries into sub-queries that each fit the ceiling.
//!
//! A query above the ceiling is cut two ways. Sibling selections are
//! partitioned into groups that fit, recursing into whichever selection is
//! too heavy on its own. A heavy connection that is not nested under another
//! connection is paged instead: it is fetched in consecutive chunks, each
//! following the cursor returned by the previous one. Sub-queries are sent
//! in batches, with every root field aliased by its sub-query prefix.

use std::collections::{HashMap, HashSet};

use serde_json::{Map, Value as Json};
use tracing::debug;

use super::ast::*;
use super::cost::{CostAggregation, CostEstimate, CostModel};
use super::merge::{merge, SubResult};
use super::printer::print_operation;
use super::{parse, GraphQlError, GraphQlResult};
use crate::config::GraphQlConfig;
use crate::errors::{GitHubError, GitHubErrorKind, GitHubResult};

/// Alias of the `pageInfo` selection injected into paged chunks.
pub(crate) const PAGE_INFO_ALIAS: &str = "_gqlPlanPageInfo";
const CURSOR_PLACEHOLDER: &str = "_gqlPlanCursor";

/// Paging direction of a chunked connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageDirection {
    /// `first` / `after`
    Forward,
    /// `last` / `before`
    Backward,
}

/// Response keys of the parts of a connection the merge needs.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct ConnectionShape {
    /// Keys of `nodes` and `edges` selections.
    pub(crate) lists: Vec<String>,
    /// Key of the caller's own `pageInfo` selection with the keys of its
    /// boundary fields, by field name.
    pub(crate) page_infos: Vec<(String, HashMap<String, String>)>,
}

/// Position of a sub-query within a paged connection.
#[derive(Debug, Clone)]
pub struct ChunkInfo {
    /// Chunks of one connection share a group.
    pub group: usize,
    /// Response-key path from the root to the connection.
    pub path: Vec<String>,
    /// Zero-based chunk position.
    pub position: usize,
    /// Chunks in the group.
    pub total: usize,
    /// Paging direction.
    pub direction: PageDirection,
    /// Nodes requested by this chunk.
    pub page_size: u64,
    /// Variable carrying the cursor from the previous chunk.
    pub cursor_variable: Option<String>,
    pub(crate) shape: ConnectionShape,
}

/// One executable part of a plan.
#[derive(Debug, Clone)]
pub struct SubQuery {
    /// Index within the plan.
    pub index: usize,
    /// Prefix of this sub-query's root aliases inside a batch.
    pub alias_prefix: String,
    /// Root selections, before aliasing.
    pub selections: Vec<Selection>,
    /// Estimated node cost.
    pub cost: u64,
    /// Set for chunks of a paged connection.
    pub chunk: Option<ChunkInfo>,
}

/// A request to send: one or more sub-queries in a single document.
#[derive(Debug, Clone)]
pub struct Batch {
    /// Sub-query indexes answered by this request.
    pub members: Vec<usize>,
    /// Query document.
    pub query: String,
    /// Variables.
    pub variables: Json,
    /// Operation name.
    pub operation_name: Option<String>,
    /// Summed estimated cost.
    pub cost: u64,
}

/// Result of planning one operation.
#[derive(Debug, Clone)]
pub struct QueryPlan {
    query: String,
    operation_name: Option<String>,
    operation: OperationDefinition,
    variables: Map<String, Json>,
    estimate: CostEstimate,
    ceiling: u64,
    sub_queries: Vec<SubQuery>,
    passthrough: bool,
}

impl QueryPlan {
    /// Estimate of the whole operation.
    pub fn estimate(&self) -> CostEstimate {
        self.estimate
    }

    /// Ceiling the plan was built for.
    pub fn ceiling(&self) -> u64 {
        self.ceiling
    }

    /// True when the operation had to be split.
    pub fn is_split(&self) -> bool {
        !self.passthrough
    }

    /// Sub-queries in execution order.
    pub fn sub_queries(&self) -> &[SubQuery] {
        &self.sub_queries
    }

    /// Operation with fragments expanded.
    pub fn operation(&self) -> &OperationDefinition {
        &self.operation
    }

    /// Starts executing the plan.
    pub fn execution(&self) -> PlanExecution<'_> {
        PlanExecution {
            plan: self,
            states: vec![SubState::Pending; self.sub_queries.len()],
            cursors: HashMap::new(),
            results: Vec::new(),
        }
    }

    /// Combines sub-results into the result of the original operation.
    pub fn merge(&self, results: &[SubResult]) -> GraphQlResult {
        merge(self, results)
    }

    fn render(&self, members: &[usize], cursors: &HashMap<usize, String>) -> Batch {
        if self.passthrough {
            return Batch {
                members: members.to_vec(),
                query: self.query.clone(),
                variables: Json::Object(self.variables.clone()),
                operation_name: self.operation_name.clone(),
                cost: self.estimate.node_count,
            };
        }

        let mut selection_set = Vec::new();
        let mut cursor_definitions = Vec::new();
        let mut variables = Map::new();
        let mut cost = 0u64;
        for &index in members {
            let sub = &self.sub_queries[index];
            cost = cost.saturating_add(sub.cost);
            selection_set.extend(alias_root(&sub.selections, &sub.alias_prefix));
            if let Some(name) = sub.chunk.as_ref().and_then(|c| c.cursor_variable.as_ref()) {
                cursor_definitions.push(VariableDefinition {
                    name: name.clone(),
                    ty: TypeRef::NonNull(Box::new(TypeRef::Named("String".into()))),
                    default_value: None,
                });
                if let Some(cursor) = cursors.get(&index) {
                    variables.insert(name.clone(), Json::String(cursor.clone()));
                }
            }
        }

        let mut used = HashSet::new();
        visit_selection_variables(&selection_set, &mut |name| {
            used.insert(name.to_string());
        });
        for directive in &self.operation.directives {
            for (_, value) in &directive.arguments {
                value.visit_variables(&mut |name| {
                    used.insert(name.to_string());
                });
            }
        }

        let mut definitions: Vec<VariableDefinition> = self
            .operation
            .variables
            .iter()
            .filter(|d| used.contains(&d.name))
            .cloned()
            .collect();
        for definition in &definitions {
            if let Some(value) = self.variables.get(&definition.name) {
                variables.insert(definition.name.clone(), value.clone());
            }
        }
        definitions.extend(cursor_definitions);

        let operation = OperationDefinition {
            kind: OperationKind::Query,
            name: self.operation.name.clone(),
            variables: definitions,
            directives: self.operation.directives.clone(),
            selection_set,
        };
        let mut query = String::new();
        print_operation(&mut query, &operation);
        Batch {
            members: members.to_vec(),
            query,
            variables: Json::Object(variables),
            operation_name: operation.name,
            cost,
        }
    }
}

/// Plans operations against a cost ceiling.
#[derive(Debug, Clone)]
pub struct QueryPlanner {
    model: CostModel,
    ceiling: u64,
    max_sub_queries: usize,
}

impl QueryPlanner {
    /// Creates a planner.
    pub fn new(model: CostModel, ceiling: u64, max_sub_queries: usize) -> Self {
        Self {
            model,
            ceiling,
            max_sub_queries: max_sub_queries.max(1),
        }
    }

    /// Planner configured from [`GraphQlConfig`].
    pub fn from_config(config: &GraphQlConfig) -> Self {
        Self::new(
            config.cost_model.clone(),
            config.cost_ceiling,
            config.max_sub_queries,
        )
    }

    /// Cost model in use.
    pub fn model(&self) -> &CostModel {
        &self.model
    }

    /// Node ceiling per request.
    pub fn ceiling(&self) -> u64 {
        self.ceiling
    }

    /// Estimates an operation without planning it.
    pub fn estimate(
        &self,
        query: &str,
        operation_name: Option<&str>,
        variables: &Json,
    ) -> GitHubResult<CostEstimate> {
        let document = expand_fragments(&parse(query)?)?;
        let operation = document.operation(operation_name)?;
        Ok(self
            .model
            .estimate(operation, &operation.resolve_variables(variables)))
    }

    /// Plans an operation.
    ///
    /// Operations within the ceiling pass through unchanged. Larger queries
    /// are split so every sub-query fits.
    ///
    /// # Errors
    ///
    /// `QueryTooLarge` when the operation is a mutation or subscription above
    /// the ceiling, when a single connection's own page size exceeds it, or
    /// when the split would need more than the configured number of
    /// sub-queries. `InvalidQuery` when the document does not parse.
    pub fn plan(
        &self,
        query: &str,
        operation_name: Option<&str>,
        variables: &Json,
    ) -> GitHubResult<QueryPlan> {
        let document = expand_fragments(&parse(query)?)?;
        let operation = document.operation(operation_name)?.clone();
        let resolved = operation.resolve_variables(variables);
        let estimate = self.model.estimate(&operation, &resolved);
        let provided = variables.as_object().cloned().unwrap_or_default();

        let mut plan = QueryPlan {
            query: query.to_string(),
            operation_name: operation_name.map(str::to_string),
            operation,
            variables: provided,
            estimate,
            ceiling: self.ceiling,
            sub_queries: Vec::new(),
            passthrough: true,
        };

        if estimate.node_count <= self.ceiling {
            plan.sub_queries.push(SubQuery {
                index: 0,
                alias_prefix: String::new(),
                selections: plan.operation.selection_set.clone(),
                cost: estimate.node_count,
                chunk: None,
            });
            return Ok(plan);
        }

        if plan.operation.kind != OperationKind::Query {
            return Err(GitHubError::query_too_large(format!(
                "{} costs {} nodes, above the ceiling of {}; only queries can be split",
                plan.operation.kind.as_str(),
                estimate.node_count,
                self.ceiling
            )));
        }

        let mut splitter = Splitter {
            model: &self.model,
            variables: &resolved,
            next_group: 0,
        };
        let pieces = splitter.split(&plan.operation.selection_set, 1, self.ceiling)?;
        if pieces.len() < 2 {
            return Err(GitHubError::query_too_large(format!(
                "Query costs {} nodes and cannot be split below the ceiling of {}",
                estimate.node_count, self.ceiling
            )));
        }
        if pieces.len() > self.max_sub_queries {
            return Err(GitHubError::query_too_large(format!(
                "Query would need {} sub-queries, more than the limit of {}",
                pieces.len(),
                self.max_sub_queries
            )));
        }

        for (index, piece) in pieces.into_iter().enumerate() {
            let mut selections = piece.selections;
            let chunk = piece.chunk.map(|c| {
                let cursor_variable = (c.position > 0).then(|| format!("_s{}_cursor", index));
                if let Some(name) = &cursor_variable {
                    rename_variable(&mut selections, CURSOR_PLACEHOLDER, name);
                }
                ChunkInfo {
                    group: c.group,
                    path: c.path,
                    position: c.position,
                    total: c.total,
                    direction: c.direction,
                    page_size: c.page_size,
                    cursor_variable,
                    shape: c.shape,
                }
            });
            let cost = self.model.selections_cost(&selections, &resolved);
            if cost > self.ceiling {
                return Err(GitHubError::query_too_large(format!(
                    "Sub-query {} still costs {} nodes, above the ceiling of {}",
                    index, cost, self.ceiling
                )));
            }
            plan.sub_queries.push(SubQuery {
                index,
                alias_prefix: format!("s{}_", index),
                selections,
                cost,
                chunk,
            });
        }
        plan.passthrough = false;

        debug!(
            estimated = estimate.node_count,
            ceiling = self.ceiling,
            sub_queries = plan.sub_queries.len(),
            "Split GraphQL query"
        );
        Ok(plan)
    }
}

struct PieceChunk {
    group: usize,
    path: Vec<String>,
    position: usize,
    total: usize,
    direction: PageDirection,
    page_size: u64,
    shape: ConnectionShape,
}

struct Piece {
    selections: Vec<Selection>,
    chunk: Option<PieceChunk>,
}

impl Piece {
    fn plain(selections: Vec<Selection>) -> Self {
        Self {
            selections,
            chunk: None,
        }
    }

    fn wrap(self, key: Option<&str>, outer: impl FnOnce(Vec<Selection>) -> Selection) -> Self {
        let chunk = self.chunk.map(|mut chunk| {
            if let Some(key) = key {
                chunk.path.insert(0, key.to_string());
            }
            chunk
        });
        Self {
            selections: vec![outer(self.selections)],
            chunk,
        }
    }
}

struct Splitter<'a> {
    model: &'a CostModel,
    variables: &'a Map<String, Json>,
    next_group: usize,
}

impl Splitter<'_> {
    /// Splits `selections`, found below a path whose connections multiply
    /// to `prefix`, into pieces that each cost at most `budget`.
    fn split(&mut self, selections: &[Selection], prefix: u64, budget: u64) -> GitHubResult<Vec<Piece>> {
        let costs: Vec<u64> = selections
            .iter()
            .map(|s| self.model.selection_cost(s, self.variables).saturating_mul(prefix))
            .collect();
        if costs.iter().fold(0u64, |a, c| a.saturating_add(*c)) <= budget {
            return Ok(vec![Piece::plain(selections.to_vec())]);
        }

        let mut zero = Vec::new();
        let mut light = Vec::new();
        let mut heavy = Vec::new();
        for (index, (selection, &cost)) in selections.iter().zip(&costs).enumerate() {
            if cost == 0 {
                zero.push(index);
            } else if cost <= budget {
                light.push((index, cost));
            } else {
                heavy.extend(self.split_heavy(selection, prefix, budget)?);
            }
        }

        // First-fit decreasing.
        light.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        let mut bins: Vec<(u64, Vec<usize>)> = Vec::new();
        for (index, cost) in light {
            match bins.iter_mut().find(|(used, _)| used + cost <= budget) {
                Some(bin) => {
                    bin.0 += cost;
                    bin.1.push(index);
                }
                None => bins.push((cost, vec![index])),
            }
        }
        if !zero.is_empty() {
            match bins.first_mut() {
                Some(bin) => bin.1.extend(zero),
                None => bins.push((0, zero)),
            }
        }

        let mut pieces: Vec<Piece> = bins
            .into_iter()
            .map(|(_, mut members)| {
                members.sort_unstable();
                Piece::plain(members.into_iter().map(|i| selections[i].clone()).collect())
            })
            .collect();
        pieces.extend(heavy);
        Ok(pieces)
    }

    fn split_heavy(&mut self, selection: &Selection, prefix: u64, budget: u64) -> GitHubResult<Vec<Piece>> {
        match selection {
            Selection::InlineFragment(fragment) => Ok(self
                .split(&fragment.selection_set, prefix, budget)?
                .into_iter()
                .map(|piece| {
                    piece.wrap(None, |selection_set| {
                        Selection::InlineFragment(InlineFragment {
                            selection_set,
                            ..fragment.clone()
                        })
                    })
                })
                .collect()),
            Selection::Field(field) => match self.model.page_size(field, self.variables) {
                None => Ok(self
                    .split(&field.selection_set, prefix, budget)?
                    .into_iter()
                    .map(|piece| piece.wrap(Some(field.response_key()), |s| with_selections(field, s)))
                    .collect()),
                Some(size) => self.split_connection(field, size, prefix, budget),
            },
            Selection::FragmentSpread(spread) => Err(GitHubError::invalid_query(format!(
                "Unexpanded fragment `{}`",
                spread.name
            ))),
        }
    }

    fn split_connection(
        &mut self,
        field: &Field,
        size: u64,
        prefix: u64,
        budget: u64,
    ) -> GitHubResult<Vec<Piece>> {
        let own = prefix.saturating_mul(size);
        if own > budget {
            return Err(GitHubError::query_too_large(format!(
                "Connection `{}` alone requests {} nodes, above the ceiling of {}",
                field.response_key(),
                own,
                budget
            )));
        }

        let per_node = self.model.per_node_cost(field, self.variables);
        if prefix == 1 && per_node <= budget {
            if let Some(direction) = page_direction(field) {
                return Ok(self.chunk(field, size, per_node, direction, budget));
            }
        }

        let inner_budget = match self.model.aggregation {
            CostAggregation::LeafPaths => budget,
            CostAggregation::AllConnections => budget - own,
        };
        if inner_budget == 0 {
            return Err(GitHubError::query_too_large(format!(
                "Connection `{}` leaves no room for its selections under the ceiling",
                field.response_key()
            )));
        }
        let inner = self.split(&field.selection_set, own, inner_budget)?;
        if inner.len() < 2 {
            return Err(GitHubError::query_too_large(format!(
                "Connection `{}` cannot be split below the ceiling of {}",
                field.response_key(),
                budget
            )));
        }
        Ok(inner
            .into_iter()
            .map(|piece| piece.wrap(Some(field.response_key()), |s| with_selections(field, s)))
            .collect())
    }

    fn chunk(
        &mut self,
        field: &Field,
        size: u64,
        per_node: u64,
        direction: PageDirection,
        budget: u64,
    ) -> Vec<Piece> {
        let step = (budget / per_node).clamp(1, size);
        let total = ((size + step - 1) / step) as usize;
        let group = self.next_group;
        self.next_group += 1;
        let shape = connection_shape(&field.selection_set);
        let (size_argument, cursor_argument) = match direction {
            PageDirection::Forward => ("first", "after"),
            PageDirection::Backward => ("last", "before"),
        };

        (0..total)
            .map(|position| {
                let page_size = if position + 1 == total {
                    size - step * (total as u64 - 1)
                } else {
                    step
                };
                let mut chunk = field.clone();
                chunk.set_argument(size_argument, Value::Int(page_size as i64));
                if position > 0 {
                    chunk.set_argument(cursor_argument, Value::Variable(CURSOR_PLACEHOLDER.into()));
                }
                chunk.selection_set.push(page_info_selection());
                Piece {
                    selections: vec![Selection::Field(chunk)],
                    chunk: Some(PieceChunk {
                        group,
                        path: vec![field.response_key().to_string()],
                        position,
                        total,
                        direction,
                        page_size,
                        shape: shape.clone(),
                    }),
                }
            })
            .collect()
    }
}

fn with_selections(field: &Field, selection_set: Vec<Selection>) -> Selection {
    Selection::Field(Field {
        selection_set,
        ..field.clone()
    })
}

fn page_direction(field: &Field) -> Option<PageDirection> {
    match (field.argument("first").is_some(), field.argument("last").is_some()) {
        (true, false) => Some(PageDirection::Forward),
        (false, true) => Some(PageDirection::Backward),
        _ => None,
    }
}

fn page_info_selection() -> Selection {
    let mut page_info = Field::new("pageInfo");
    page_info.alias = Some(PAGE_INFO_ALIAS.to_string());
    page_info.selection_set = ["hasNextPage", "endCursor", "hasPreviousPage", "startCursor"]
        .into_iter()
        .map(|name| Selection::Field(Field::new(name)))
        .collect();
    Selection::Field(page_info)
}

/// Fields of a selection set with inline fragments flattened.
pub(crate) fn flatten_fields<'a>(selections: &'a [Selection], out: &mut Vec<&'a Field>) {
    for selection in selections {
        match selection {
            Selection::Field(field) => out.push(field),
            Selection::InlineFragment(fragment) => flatten_fields(&fragment.selection_set, out),
            Selection::FragmentSpread(_) => {}
        }
    }
}

fn connection_shape(selections: &[Selection]) -> ConnectionShape {
    let mut fields = Vec::new();
    flatten_fields(selections, &mut fields);
    let mut shape = ConnectionShape::default();
    for field in fields {
        let key = field.response_key().to_string();
        match field.name.as_str() {
            "nodes" | "edges" if !shape.lists.contains(&key) => shape.lists.push(key),
            "pageInfo" => {
                let mut inner = Vec::new();
                flatten_fields(&field.selection_set, &mut inner);
                let keys = inner
                    .into_iter()
                    .map(|f| (f.name.clone(), f.response_key().to_string()))
                    .collect();
                shape.page_infos.push((key, keys));
            }
            _ => {}
        }
    }
    shape
}

fn alias_root(selections: &[Selection], prefix: &str) -> Vec<Selection> {
    selections
        .iter()
        .map(|selection| match selection {
            Selection::Field(field) => {
                let mut field = field.clone();
                field.alias = Some(format!("{}{}", prefix, field.response_key()));
                Selection::Field(field)
            }
            Selection::InlineFragment(fragment) => {
                let mut fragment = fragment.clone();
                fragment.selection_set = alias_root(&fragment.selection_set, prefix);
                Selection::InlineFragment(fragment)
            }
            other => other.clone(),
        })
        .collect()
}

fn rename_variable(selections: &mut [Selection], from: &str, to: &str) {
    for selection in selections {
        match selection {
            Selection::Field(field) => {
                for (_, value) in &mut field.arguments {
                    if matches!(value, Value::Variable(name) if name == from) {
                        *value = Value::Variable(to.to_string());
                    }
                }
                rename_variable(&mut field.selection_set, from, to);
            }
            Selection::InlineFragment(fragment) => {
                rename_variable(&mut fragment.selection_set, from, to)
            }
            Selection::FragmentSpread(_) => {}
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SubState {
    Pending,
    InFlight,
    Done,
    Skipped,
}

/// Drives a [`QueryPlan`]: hands out batches and collects their results.
///
/// Chunks of a paged connection become ready once the chunk before them has
/// returned a cursor; a chunk reporting no further page ends its group.
#[derive(Debug)]
pub struct PlanExecution<'p> {
    plan: &'p QueryPlan,
    states: Vec<SubState>,
    cursors: HashMap<usize, String>,
    results: Vec<SubResult>,
}

impl<'p> PlanExecution<'p> {
    /// The plan being executed.
    pub fn plan(&self) -> &'p QueryPlan {
        self.plan
    }

    /// Next request to send, packing ready sub-queries while their summed
    /// cost stays within the ceiling. `None` once nothing is left to send.
    pub fn next_batch(&mut self) -> Option<Batch> {
        let plan = self.plan;
        let mut members = Vec::new();
        let mut cost = 0u64;
        for (index, sub) in plan.sub_queries.iter().enumerate() {
            if self.states[index] != SubState::Pending {
                continue;
            }
            let ready = match &sub.chunk {
                Some(chunk) if chunk.position > 0 => self.cursors.contains_key(&index),
                _ => true,
            };
            if !ready {
                continue;
            }
            if !members.is_empty() && cost.saturating_add(sub.cost) > plan.ceiling {
                continue;
            }
            cost = cost.saturating_add(sub.cost);
            members.push(index);
        }
        if members.is_empty() {
            return None;
        }
        for &index in &members {
            self.states[index] = SubState::InFlight;
        }
        Some(plan.render(&members, &self.cursors))
    }

    /// Records the response to `batch`.
    pub fn complete(&mut self, batch: &Batch, response: GraphQlResult) {
        if !self.plan.is_split() {
            for &index in &batch.members {
                self.states[index] = SubState::Done;
            }
            self.results.push(SubResult {
                index: 0,
                data: response.data,
                errors: response.errors,
            });
            return;
        }

        let plan = self.plan;
        let mut errors: HashMap<usize, Vec<GraphQlError>> = HashMap::new();
        for mut error in response.errors {
            let owner = batch.members.iter().copied().find(|&index| {
                let prefix = &plan.sub_queries[index].alias_prefix;
                match error.path.first_mut() {
                    Some(Json::String(head)) => match head.strip_prefix(prefix.as_str()) {
                        Some(stripped) => {
                            *head = stripped.to_string();
                            true
                        }
                        None => false,
                    },
                    _ => false,
                }
            });
            let owner = owner.unwrap_or(batch.members[0]);
            errors.entry(owner).or_default().push(error);
        }

        for &index in &batch.members {
            let sub = &plan.sub_queries[index];
            let data = strip_prefix(&response.data, &sub.alias_prefix);
            if let Some(chunk) = &sub.chunk {
                self.follow_cursor(index, chunk, &data);
            }
            self.states[index] = SubState::Done;
            self.results.push(SubResult {
                index,
                data,
                errors: errors.remove(&index).unwrap_or_default(),
            });
        }
    }

    fn follow_cursor(&mut self, index: usize, chunk: &ChunkInfo, data: &Json) {
        if chunk.position + 1 >= chunk.total {
            return;
        }
        let page_info = chunk
            .path
            .iter()
            .try_fold(data, |value, key| value.get(key))
            .and_then(|connection| connection.get(PAGE_INFO_ALIAS));
        let (more, cursor) = match chunk.direction {
            PageDirection::Forward => ("hasNextPage", "endCursor"),
            PageDirection::Backward => ("hasPreviousPage", "startCursor"),
        };
        let next = page_info.and_then(|info| {
            let more = info.get(more).and_then(Json::as_bool).unwrap_or(false);
            let cursor = info.get(cursor).and_then(Json::as_str)?;
            more.then(|| cursor.to_string())
        });

        match next {
            Some(cursor) => {
                self.cursors.insert(index + 1, cursor);
            }
            None => self.skip_rest_of_group(index, chunk),
        }
    }

    fn skip_rest_of_group(&mut self, index: usize, chunk: &ChunkInfo) {
        let remaining = chunk.total - chunk.position - 1;
        for skipped in index + 1..=index + remaining {
            self.states[skipped] = SubState::Skipped;
        }
    }

    /// Records that the request for `batch` failed as a whole.
    ///
    /// Every member contributes no data and one error per root response key
    /// (the connection path for paged chunks). Later chunks of a failed
    /// connection are skipped, so the merged connection ends at the last
    /// page received and its `pageInfo` says more remain.
    pub fn fail(&mut self, batch: &Batch, error: &GitHubError) {
        let plan = self.plan;
        for &index in &batch.members {
            let sub = &plan.sub_queries[index];
            let paths: Vec<Vec<String>> = match &sub.chunk {
                Some(chunk) => {
                    self.skip_rest_of_group(index, chunk);
                    vec![chunk.path.clone()]
                }
                None => {
                    let mut fields = Vec::new();
                    flatten_fields(&sub.selections, &mut fields);
                    let mut keys: Vec<Vec<String>> = Vec::new();
                    for field in fields {
                        let key = vec![field.response_key().to_string()];
                        if !keys.contains(&key) {
                            keys.push(key);
                        }
                    }
                    keys
                }
            };
            let errors = paths
                .into_iter()
                .map(|path| request_error(path, error))
                .collect();
            self.states[index] = SubState::Done;
            self.results.push(SubResult {
                index,
                data: Json::Null,
                errors,
            });
        }
    }

    /// Merges everything received.
    ///
    /// # Errors
    ///
    /// `QueryFailed` when batches handed out were never completed.
    pub fn finish(self) -> GitHubResult<GraphQlResult> {
        let unfinished = self
            .states
            .iter()
            .filter(|s| matches!(s, SubState::Pending | SubState::InFlight))
            .count();
        if unfinished > 0 {
            return Err(GitHubError::new(
                GitHubErrorKind::QueryFailed,
                format!("{} sub-queries never completed", unfinished),
            ));
        }
        Ok(self.plan.merge(&self.results))
    }
}

/// A failed request reported in GraphQL error form at `path`.
fn request_error(path: Vec<String>, error: &GitHubError) -> GraphQlError {
    let mut extensions = Map::new();
    extensions.insert("kind".to_string(), Json::String(error.kind().to_string()));
    if let Some(status) = error.status_code() {
        extensions.insert("status".to_string(), Json::from(status));
    }
    GraphQlError {
        message: error.message().to_string(),
        error_type: error.github_code().map(str::to_string),
        path: path.into_iter().map(Json::String).collect(),
        locations: Vec::new(),
        extensions: Some(Json::Object(extensions)),
    }
}

fn strip_prefix(data: &Json, prefix: &str) -> Json {
    match data.as_object() {
        Some(map) => Json::Object(
            map.iter()
                .filter_map(|(key, value)| {
                    key.strip_prefix(prefix)
                        .map(|key| (key.to_string(), value.clone()))
                })
                .collect(),
        ),
        None => Json::Null,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn planner(ceiling: u64) -> QueryPlanner {
        QueryPlanner::new(CostModel::default(), ceiling, 64)
    }

    const NESTED: &str = "query Deep($owner: String!) { repository(owner: $owner, name: \"r\") { name issues(first: 100) { totalCount nodes { comments(first: 100) { nodes { reactions(first: 100) { totalCount } } } } } } }";

    #[test]
    fn test_query_within_ceiling_passes_through() {
        let plan = planner(500_000)
            .plan("query { viewer { repositories(first: 10) { totalCount } } }", None, &json!({}))
            .unwrap();
        assert!(!plan.is_split());
        assert_eq!(plan.sub_queries().len(), 1);

        let mut execution = plan.execution();
        let batch = execution.next_batch().unwrap();
        assert_eq!(batch.query, "query { viewer { repositories(first: 10) { totalCount } } }");
        assert!(execution.next_batch().is_none());
    }

    #[test]
    fn test_million_node_query_is_paged_under_ceiling() {
        let plan = planner(500_000)
            .plan(NESTED, None, &json!({"owner": "o"}))
            .unwrap();
        assert!(plan.is_split());
        assert_eq!(plan.estimate().node_count, 1_000_000);
        assert!(plan.sub_queries().len() >= 2);
        for sub in plan.sub_queries() {
            assert!(sub.cost <= 500_000, "sub-query {} costs {}", sub.index, sub.cost);
        }

        let chunks: Vec<&ChunkInfo> = plan
            .sub_queries()
            .iter()
            .filter_map(|s| s.chunk.as_ref())
            .collect();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].path, vec!["repository".to_string(), "issues".to_string()]);
        assert_eq!(chunks[0].page_size, 50);
        assert_eq!(chunks[1].page_size, 50);
        assert!(chunks[0].cursor_variable.is_none());
        assert!(chunks[1].cursor_variable.is_some());
    }

    #[test]
    fn test_second_chunk_waits_for_cursor() {
        let plan = planner(500_000)
            .plan(NESTED, None, &json!({"owner": "o"}))
            .unwrap();
        let mut execution = plan.execution();

        let first = execution.next_batch().unwrap();
        assert!(first.query.contains("_gqlPlanPageInfo: pageInfo"));
        assert!(first.query.contains("$owner: String!"));
        assert!(execution.next_batch().is_none());

        let chunk_index = plan
            .sub_queries()
            .iter()
            .find(|s| s.chunk.as_ref().map_or(false, |c| c.position == 0))
            .unwrap()
            .index;
        let prefix = format!("s{}_repository", chunk_index);
        let mut data = Map::new();
        for &member in &first.members {
            let key = format!("s{}_repository", member);
            if key == prefix {
                data.insert(
                    key,
                    json!({"issues": {"totalCount": 70, "nodes": [], "_gqlPlanPageInfo": {
                        "hasNextPage": true, "endCursor": "c49", "hasPreviousPage": false, "startCursor": "c0"
                    }}}),
                );
            } else {
                data.insert(key, json!({"name": "r"}));
            }
        }
        execution.complete(
            &first,
            GraphQlResult {
                data: Json::Object(data),
                errors: Vec::new(),
            },
        );

        let second = execution.next_batch().unwrap();
        let cursor_var = plan.sub_queries()[second.members[0]]
            .chunk
            .as_ref()
            .unwrap()
            .cursor_variable
            .clone()
            .unwrap();
        assert_eq!(second.variables[&cursor_var], json!("c49"));
        assert!(second.query.contains(&format!("after: ${}", cursor_var)));
    }

    #[test]
    fn test_last_chunk_ending_early_skips_rest() {
        let plan = planner(500_000)
            .plan(NESTED, None, &json!({"owner": "o"}))
            .unwrap();
        let mut execution = plan.execution();
        let first = execution.next_batch().unwrap();
        let data: Map<String, Json> = first
            .members
            .iter()
            .map(|m| {
                (
                    format!("s{}_repository", m),
                    json!({"name": "r", "issues": {"totalCount": 3, "nodes": [], "_gqlPlanPageInfo": {
                        "hasNextPage": false, "endCursor": "c2", "hasPreviousPage": false, "startCursor": "c0"
                    }}}),
                )
            })
            .collect();
        execution.complete(
            &first,
            GraphQlResult {
                data: Json::Object(data),
                errors: Vec::new(),
            },
        );
        assert!(execution.next_batch().is_none());
        let merged = execution.finish().unwrap();
        assert_eq!(merged.data["repository"]["issues"]["totalCount"], json!(3));
        assert!(merged.data["repository"]["issues"].get(PAGE_INFO_ALIAS).is_none());
    }

    #[test]
    fn test_sibling_connections_are_partitioned() {
        let query = "query { a: search(query: \"x\", type: ISSUE, first: 60) { nodes { ... on Issue { labels(first: 10) { totalCount } } } } b: search(query: \"y\", type: ISSUE, first: 50) { nodes { ... on Issue { labels(first: 10) { totalCount } } } } viewer { login } }";
        let plan = planner(700).plan(query, None, &json!({})).unwrap();
        assert_eq!(plan.estimate().node_count, 1_100);
        assert_eq!(plan.sub_queries().len(), 2);
        assert!(plan.sub_queries().iter().all(|s| s.chunk.is_none()));
        let mut execution = plan.execution();
        assert_eq!(execution.next_batch().unwrap().members, vec![0]);
        assert_eq!(execution.next_batch().unwrap().members, vec![1]);
    }

    fn root_keys(sub: &SubQuery) -> Vec<String> {
        let mut fields = Vec::new();
        flatten_fields(&sub.selections, &mut fields);
        fields.iter().map(|f| f.response_key().to_string()).collect()
    }

    #[test]
    fn test_failed_batch_keeps_other_results() {
        let query = "query { a: search(query: \"x\", type: ISSUE, first: 60) { nodes { ... on Issue { labels(first: 10) { totalCount } } } } b: search(query: \"y\", type: ISSUE, first: 50) { nodes { ... on Issue { labels(first: 10) { totalCount } } } } }";
        let plan = planner(700).plan(query, None, &json!({})).unwrap();
        let mut execution = plan.execution();
        let first = execution.next_batch().unwrap();
        let second = execution.next_batch().unwrap();

        let sub = &plan.sub_queries()[second.members[0]];
        let kept = root_keys(sub);
        let data: Map<String, Json> = kept
            .iter()
            .map(|key| (format!("{}{}", sub.alias_prefix, key), json!({"nodes": []})))
            .collect();
        execution.complete(
            &second,
            GraphQlResult {
                data: Json::Object(data),
                errors: Vec::new(),
            },
        );
        execution.fail(
            &first,
            &GitHubError::new(GitHubErrorKind::ServerError, "bad gateway"),
        );

        let merged = execution.finish().unwrap();
        let lost = root_keys(&plan.sub_queries()[first.members[0]]);
        for key in &kept {
            assert_eq!(merged.data[key.as_str()]["nodes"], json!([]));
        }
        for key in &lost {
            assert!(merged.data.get(key.as_str()).is_none());
        }
        assert_eq!(merged.errors.len(), lost.len());
        assert_eq!(merged.errors[0].path, vec![json!(lost[0])]);
        assert_eq!(merged.errors[0].message, "bad gateway");
        assert_eq!(
            merged.errors[0].extensions.as_ref().unwrap()["kind"],
            json!("server_error")
        );
    }

    #[test]
    fn test_failed_chunk_skips_the_rest_of_its_connection() {
        let plan = planner(500_000)
            .plan(NESTED, None, &json!({"owner": "o"}))
            .unwrap();
        let mut execution = plan.execution();
        let first = execution.next_batch().unwrap();
        execution.fail(&first, &GitHubError::new(GitHubErrorKind::Timeout, "timed out"));

        assert!(execution.next_batch().is_none());
        let merged = execution.finish().unwrap();
        assert!(merged.data.is_null());
        assert!(merged
            .errors
            .iter()
            .any(|e| e.path == vec![json!("repository"), json!("issues")]));
    }

    #[test]
    fn test_oversized_single_connection_is_rejected() {
        let err = planner(1_000)
            .plan("query { viewer { repositories(first: 5000) { totalCount } } }", None, &json!({}))
            .unwrap_err();
        assert_eq!(err.kind(), GitHubErrorKind::QueryTooLarge);
    }

    #[test]
    fn test_mutations_are_never_split() {
        let err = planner(10)
            .plan(
                "mutation { addStar(input: {starrableId: \"x\"}) { starrable { stargazers(first: 100) { totalCount } } } }",
                None,
                &json!({}),
            )
            .unwrap_err();
        assert_eq!(err.kind(), GitHubErrorKind::QueryTooLarge);
    }

    #[test]
    fn test_sub_query_limit_is_enforced() {
        let err = QueryPlanner::new(CostModel::default(), 500_000, 1)
            .plan(NESTED, None, &json!({"owner": "o"}))
            .unwrap_err();
        assert_eq!(err.kind(), GitHubErrorKind::QueryTooLarge);
    }

    #[test]
    fn test_unpageable_connection_splits_its_children() {
        // Both page-size arguments set, so the connection cannot be paged.
        let query = "query { viewer { repositories(first: 10, last: 10) { nodes { issues(first: 10) { nodes { a: labels(first: 10) { totalCount } b: assignees(first: 10) { totalCount } } } } } } }";
        let plan = planner(1_000).plan(query, None, &json!({})).unwrap();
        assert_eq!(plan.estimate().node_count, 2_000);
        assert_eq!(plan.sub_queries().len(), 2);
        assert!(plan.sub_queries().iter().all(|s| s.cost == 1_000));
    }

    #[test]
    fn test_all_connections_budget_accounts_for_outer_nodes() {
        let model = CostModel {
            aggregation: CostAggregation::AllConnections,
            ..CostModel::default()
        };
        let plan = QueryPlanner::new(model, 500_000, 64)
            .plan(NESTED, None, &json!({"owner": "o"}))
            .unwrap();
        for sub in plan.sub_queries() {
            assert!(sub.cost <= 500_000);
        }
    }

    #[test]
    fn test_unused_variables_are_not_declared_in_batches() {
        let query = "query($owner: String!, $unused: Int) { repository(owner: $owner, name: \"r\") { issues(first: 100) { nodes { comments(first: 100) { nodes { reactions(first: 100) { totalCount } } } } } } }";
        let plan = planner(500_000)
            .plan(query, None, &json!({"owner": "o", "unused": 1}))
            .unwrap();
        let batch = plan.execution().next_batch().unwrap();
        assert!(!batch.query.contains("$unused"));
        assert!(batch.variables.get("unused").is_none());
    }
}
