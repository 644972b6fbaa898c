//! Test doubles for the GitHub access layer.
//!
//! - [`MockTransport`]: scripted HTTP responses with delays and call counts
//! - [`FakeGraph`]: evaluates GraphQL documents against an in-memory graph
//! - [`CollectingTelemetry`]: records every telemetry event

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use parking_lot::Mutex;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Method, StatusCode};
use serde::Serialize;
use serde_json::{json, Map, Value as Json};

use crate::errors::{GitHubError, GitHubErrorKind, GitHubResult};
use crate::graphql::{
    expand_fragments, parse, CostModel, Field, GraphQlError, GraphQlResult, Selection,
};
use crate::observability::{TelemetryEvent, TelemetrySink};
use crate::transport::{HttpRequest, HttpResponse, HttpTransport};

/// A scripted response.
#[derive(Debug, Clone)]
pub struct MockResponse {
    /// Status code.
    pub status: u16,
    /// Response body.
    pub body: Bytes,
    /// Headers.
    pub headers: Vec<(String, String)>,
    /// Delay before responding.
    pub delay: Option<Duration>,
    /// Fails the request at the transport level instead of answering.
    pub error: Option<GitHubError>,
}

impl MockResponse {
    /// Response with a JSON body.
    pub fn json<T: Serialize>(status: u16, body: &T) -> Self {
        Self {
            status,
            body: Bytes::from(serde_json::to_vec(body).unwrap_or_default()),
            headers: vec![("content-type".into(), "application/json".into())],
            delay: None,
            error: None,
        }
    }

    /// 200 with a JSON body.
    pub fn ok<T: Serialize>(body: &T) -> Self {
        Self::json(200, body)
    }

    /// 304 without a body.
    pub fn not_modified() -> Self {
        Self {
            status: 304,
            body: Bytes::new(),
            headers: Vec::new(),
            delay: None,
            error: None,
        }
    }

    /// GitHub-style error response.
    pub fn error(status: u16, message: &str) -> Self {
        Self::json(
            status,
            &json!({
                "message": message,
                "documentation_url": "https://docs.github.com/rest"
            }),
        )
    }

    /// 403 with an exhausted primary rate limit, resetting in a minute.
    pub fn rate_limited() -> Self {
        let reset = Utc::now().timestamp() + 60;
        Self::error(403, "API rate limit exceeded").with_rate_limit(5000, 0, reset)
    }

    /// Connection failure.
    pub fn network_error() -> Self {
        Self {
            error: Some(GitHubError::new(
                GitHubErrorKind::TransientNetwork,
                "connection reset by peer",
            )),
            ..Self::not_modified()
        }
    }

    /// Adds a delay to the response.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Adds a header to the response.
    pub fn with_header(mut self, key: &str, value: &str) -> Self {
        self.headers.push((key.to_string(), value.to_string()));
        self
    }

    /// Adds an `ETag`.
    pub fn with_etag(self, etag: &str) -> Self {
        self.with_header("etag", etag)
    }

    /// Adds rate limit headers.
    pub fn with_rate_limit(self, limit: u32, remaining: u32, reset_timestamp: i64) -> Self {
        self.with_header("x-ratelimit-limit", &limit.to_string())
            .with_header("x-ratelimit-remaining", &remaining.to_string())
            .with_header("x-ratelimit-reset", &reset_timestamp.to_string())
    }

    fn header_map(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for (name, value) in &self.headers {
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                headers.append(name, value);
            }
        }
        headers
    }
}

#[derive(Debug)]
struct Route {
    method: Method,
    path: String,
    responses: VecDeque<MockResponse>,
}

/// Transport answering from scripted routes.
///
/// Each route answers with its queued responses in order and repeats the
/// last one once the queue is down to it. Requests without a route get a
/// 404. With a [`FakeGraph`] attached, `POST .../graphql` is evaluated
/// against it.
#[derive(Debug, Default)]
pub struct MockTransport {
    routes: Mutex<Vec<Route>>,
    requests: Mutex<Vec<HttpRequest>>,
    graph: Option<FakeGraph>,
    graph_delay: Option<Duration>,
    graph_failures: Mutex<HashMap<usize, MockResponse>>,
    graph_calls: AtomicUsize,
}

impl MockTransport {
    /// Creates a transport without routes.
    pub fn new() -> Self {
        Self::default()
    }

    /// Serves GraphQL requests from `graph`.
    pub fn with_graph(mut self, graph: FakeGraph) -> Self {
        self.graph = Some(graph);
        self
    }

    /// Delays every GraphQL answer.
    pub fn with_graph_delay(mut self, delay: Duration) -> Self {
        self.graph_delay = Some(delay);
        self
    }

    /// Answers the `call`-th GraphQL request (1-based) with `response`
    /// instead of evaluating it against the graph.
    pub fn fail_graph_call(self, call: usize, response: MockResponse) -> Self {
        self.graph_failures.lock().insert(call, response);
        self
    }

    /// Queues `response` for `method path`.
    pub fn on(&self, method: Method, path: &str, response: MockResponse) -> &Self {
        let mut routes = self.routes.lock();
        match routes
            .iter_mut()
            .find(|r| r.method == method && r.path == path)
        {
            Some(route) => route.responses.push_back(response),
            None => routes.push(Route {
                method,
                path: path.to_string(),
                responses: VecDeque::from([response]),
            }),
        }
        self
    }

    /// Queues a response for `GET path`.
    pub fn on_get(&self, path: &str, response: MockResponse) -> &Self {
        self.on(Method::GET, path, response)
    }

    /// Every request received, in order.
    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().clone()
    }

    /// Number of requests received.
    pub fn call_count(&self) -> usize {
        self.requests.lock().len()
    }

    /// Number of requests received for `path`.
    pub fn calls_to(&self, path: &str) -> usize {
        self.requests
            .lock()
            .iter()
            .filter(|r| r.url.path() == path)
            .count()
    }

    fn next_response(&self, method: &Method, path: &str) -> Option<MockResponse> {
        let mut routes = self.routes.lock();
        let route = routes
            .iter_mut()
            .find(|r| &r.method == method && r.path == path)?;
        if route.responses.len() > 1 {
            route.responses.pop_front()
        } else {
            route.responses.front().cloned()
        }
    }

    fn answer_graphql(&self, request: &HttpRequest) -> Option<MockResponse> {
        let graph = self.graph.as_ref()?;
        if request.method != Method::POST || !request.url.path().ends_with("/graphql") {
            return None;
        }
        let call = self.graph_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(failure) = self.graph_failures.lock().remove(&call) {
            return Some(failure);
        }
        let body: Json = request
            .body
            .as_ref()
            .and_then(|b| serde_json::from_slice(b).ok())
            .unwrap_or(Json::Null);
        let query = body.get("query").and_then(Json::as_str).unwrap_or_default();
        let variables = body.get("variables").cloned().unwrap_or(Json::Null);
        let operation = body.get("operationName").and_then(Json::as_str);
        let result = graph.execute(query, operation, &variables);
        let mut response = MockResponse::ok(&result);
        response.delay = self.graph_delay;
        Some(response)
    }
}

#[async_trait]
impl HttpTransport for MockTransport {
    async fn send(&self, request: HttpRequest) -> GitHubResult<HttpResponse> {
        self.requests.lock().push(request.clone());

        let response = self
            .next_response(&request.method, request.url.path())
            .or_else(|| self.answer_graphql(&request))
            .unwrap_or_else(|| {
                MockResponse::error(
                    404,
                    &format!("No mock for {} {}", request.method, request.url.path()),
                )
            });

        if let Some(delay) = response.delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(error) = response.error.clone() {
            return Err(error);
        }
        let status = StatusCode::from_u16(response.status)
            .map_err(|e| GitHubError::new(GitHubErrorKind::Unknown, e.to_string()))?;
        Ok(HttpResponse::new(status, response.header_map(), response.body))
    }
}

/// Telemetry sink keeping every event.
#[derive(Debug, Default)]
pub struct CollectingTelemetry {
    events: Mutex<Vec<TelemetryEvent>>,
}

impl CollectingTelemetry {
    /// Events recorded so far.
    pub fn events(&self) -> Vec<TelemetryEvent> {
        self.events.lock().clone()
    }

    /// Number of recorded events matching `predicate`.
    pub fn count(&self, predicate: impl Fn(&TelemetryEvent) -> bool) -> usize {
        self.events.lock().iter().filter(|e| predicate(e)).count()
    }

    /// Forgets recorded events.
    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl TelemetrySink for CollectingTelemetry {
    fn record(&self, event: &TelemetryEvent) {
        self.events.lock().push(event.clone());
    }
}

/// In-memory GraphQL server.
///
/// The graph is plain JSON: objects are types, arrays under a field that
/// carries `first`/`last` are connections. Connections answer `nodes`,
/// `edges { cursor node }`, `pageInfo` and `totalCount`, with cursors of
/// the form `c{index}`. Arguments other than the paging ones are ignored.
#[derive(Debug, Clone)]
pub struct FakeGraph {
    root: Json,
    node_limit: Option<(u64, CostModel)>,
}

struct Eval<'a> {
    variables: &'a Map<String, Json>,
    errors: Vec<GraphQlError>,
}

impl FakeGraph {
    /// Graph rooted at `root`.
    pub fn new(root: Json) -> Self {
        Self {
            root,
            node_limit: None,
        }
    }

    /// Refuses documents estimated above `limit` nodes under `model`, the
    /// way GitHub answers with `MAX_NODE_LIMIT_EXCEEDED`.
    pub fn with_node_limit(mut self, limit: u64, model: CostModel) -> Self {
        self.node_limit = Some((limit, model));
        self
    }

    /// Executes a document.
    pub fn execute(&self, query: &str, operation_name: Option<&str>, variables: &Json) -> GraphQlResult {
        match self.try_execute(query, operation_name, variables) {
            Ok(result) => result,
            Err(error) => GraphQlResult {
                data: Json::Null,
                errors: vec![graph_error(
                    error.message(),
                    error.github_code().unwrap_or("INVALID_QUERY"),
                )],
            },
        }
    }

    fn try_execute(
        &self,
        query: &str,
        operation_name: Option<&str>,
        variables: &Json,
    ) -> GitHubResult<GraphQlResult> {
        let document = expand_fragments(&parse(query)?)?;
        let operation = document.operation(operation_name)?;
        let resolved = operation.resolve_variables(variables);

        if let Some((limit, model)) = &self.node_limit {
            let estimate = model.estimate(operation, &resolved);
            if estimate.node_count > *limit {
                return Err(GitHubError::new(
                    GitHubErrorKind::QueryTooLarge,
                    format!(
                        "This query requests up to {} possible nodes which exceeds the maximum limit of {}.",
                        estimate.node_count, limit
                    ),
                )
                .with_github_code("MAX_NODE_LIMIT_EXCEEDED"));
            }
        }

        let mut eval = Eval {
            variables: &resolved,
            errors: Vec::new(),
        };
        let data = eval.object(&self.root, &operation.selection_set, &[]);
        Ok(GraphQlResult {
            data,
            errors: eval.errors,
        })
    }
}

fn graph_error(message: &str, error_type: &str) -> GraphQlError {
    GraphQlError {
        message: message.to_string(),
        error_type: Some(error_type.to_string()),
        path: Vec::new(),
        locations: Vec::new(),
        extensions: None,
    }
}

impl Eval<'_> {
    fn object(&mut self, source: &Json, selections: &[Selection], path: &[Json]) -> Json {
        let mut out = Map::new();
        self.collect(source, selections, path, &mut out);
        Json::Object(out)
    }

    fn collect(&mut self, source: &Json, selections: &[Selection], path: &[Json], out: &mut Map<String, Json>) {
        for selection in selections {
            match selection {
                Selection::Field(field) => {
                    let key = field.response_key().to_string();
                    let mut field_path = path.to_vec();
                    field_path.push(Json::String(key.clone()));
                    let value = self.field(source, field, &field_path);
                    match out.get_mut(&key) {
                        Some(existing) => merge_into(existing, value),
                        None => {
                            out.insert(key, value);
                        }
                    }
                }
                Selection::InlineFragment(fragment) => {
                    let applies = match (&fragment.type_condition, source.get("__typename")) {
                        (Some(condition), Some(Json::String(typename))) => condition == typename,
                        _ => true,
                    };
                    if applies {
                        self.collect(source, &fragment.selection_set, path, out);
                    }
                }
                Selection::FragmentSpread(_) => {}
            }
        }
    }

    fn field(&mut self, source: &Json, field: &Field, path: &[Json]) -> Json {
        let value = source.get(&field.name).cloned().unwrap_or(Json::Null);
        let paged = field.argument("first").is_some() || field.argument("last").is_some();
        match value {
            Json::Array(items) if paged => self.connection(&items, field, path),
            Json::Array(items) if !field.selection_set.is_empty() => Json::Array(
                items
                    .iter()
                    .enumerate()
                    .map(|(i, item)| {
                        let mut item_path = path.to_vec();
                        item_path.push(Json::from(i));
                        self.object(item, &field.selection_set, &item_path)
                    })
                    .collect(),
            ),
            Json::Object(_) if !field.selection_set.is_empty() => {
                self.object(&value, &field.selection_set, path)
            }
            Json::Null if field.selection_set.is_empty() => Json::Null,
            Json::Null => {
                if field.name != "rateLimit" {
                    self.errors.push(GraphQlError {
                        path: path.to_vec(),
                        ..graph_error(&format!("Could not resolve `{}`", field.name), "NOT_FOUND")
                    });
                }
                Json::Null
            }
            scalar => scalar,
        }
    }

    fn cursor_index(&self, field: &Field, name: &str) -> Option<usize> {
        let cursor = field.argument(name)?.to_json(self.variables);
        cursor.as_str()?.strip_prefix('c')?.parse().ok()
    }

    fn connection(&mut self, items: &[Json], field: &Field, path: &[Json]) -> Json {
        let mut start = self.cursor_index(field, "after").map(|i| i + 1).unwrap_or(0);
        let mut end = self.cursor_index(field, "before").unwrap_or(items.len());
        start = start.min(items.len());
        end = end.clamp(start, items.len());
        if let Some(first) = field.argument("first").and_then(|v| v.as_u64(self.variables)) {
            end = end.min(start + first as usize);
        }
        if let Some(last) = field.argument("last").and_then(|v| v.as_u64(self.variables)) {
            start = start.max(end.saturating_sub(last as usize));
        }

        let page_info = json!({
            "hasNextPage": end < items.len(),
            "hasPreviousPage": start > 0,
            "startCursor": (start < end).then(|| format!("c{}", start)),
            "endCursor": (start < end).then(|| format!("c{}", end - 1)),
        });
        let source = json!({
            "totalCount": items.len(),
            "pageInfo": page_info,
        });

        let mut out = Map::new();
        for selection in &field.selection_set {
            let Selection::Field(sub) = selection else {
                continue;
            };
            let key = sub.response_key().to_string();
            let mut sub_path = path.to_vec();
            sub_path.push(Json::String(key.clone()));
            let value = match sub.name.as_str() {
                "nodes" => Json::Array(
                    (start..end)
                        .map(|i| {
                            let mut node_path = sub_path.clone();
                            node_path.push(Json::from(i - start));
                            self.object(&items[i], &sub.selection_set, &node_path)
                        })
                        .collect(),
                ),
                "edges" => Json::Array(
                    (start..end)
                        .map(|i| {
                            let edge = json!({ "cursor": format!("c{}", i), "node": items[i].clone() });
                            self.object(&edge, &sub.selection_set, &sub_path)
                        })
                        .collect(),
                ),
                _ => self.field(&source, sub, &sub_path),
            };
            match out.get_mut(&key) {
                Some(existing) => merge_into(existing, value),
                None => {
                    out.insert(key, value);
                }
            }
        }
        Json::Object(out)
    }
}

fn merge_into(target: &mut Json, source: Json) {
    match (target, source) {
        (Json::Object(target), Json::Object(source)) => {
            for (key, value) in source {
                match target.get_mut(&key) {
                    Some(existing) => merge_into(existing, value),
                    None => {
                        target.insert(key, value);
                    }
                }
            }
        }
        (Json::Array(target), Json::Array(source)) => {
            for (existing, value) in target.iter_mut().zip(source) {
                merge_into(existing, value);
            }
        }
        _ => {}
    }
}

/// Builds a graph of `count` issues, each with `comments` comments.
pub fn issue_graph(count: usize, comments: usize) -> FakeGraph {
    let issues: Vec<Json> = (0..count)
        .map(|i| {
            json!({
                "number": i + 1,
                "title": format!("Issue {}", i + 1),
                "comments": (0..comments)
                    .map(|c| json!({ "id": format!("{}-{}", i + 1, c), "body": format!("comment {}", c) }))
                    .collect::<Vec<_>>(),
            })
        })
        .collect();
    FakeGraph::new(json!({
        "repository": {
            "__typename": "Repository",
            "name": "widgets",
            "issues": issues,
        },
        "viewer": { "login": "octocat" },
    }))
}

/// Headers of a webhook delivery signed with `secret`.
pub fn webhook_headers(
    secret: &str,
    delivery_id: &str,
    event: &str,
    payload: &[u8],
) -> GitHubResult<HeaderMap> {
    let signature = crate::webhooks::compute_signature(secret, payload)?;
    let mut headers = HeaderMap::new();
    let pairs = [
        (crate::webhooks::DELIVERY_HEADER, delivery_id),
        (crate::webhooks::EVENT_HEADER, event),
        (crate::webhooks::SIGNATURE_HEADER, signature.as_str()),
    ];
    for (name, value) in pairs {
        let value = HeaderValue::from_str(value)
            .map_err(|e| GitHubError::new(GitHubErrorKind::MalformedWebhook, e.to_string()))?;
        headers.insert(HeaderName::from_static(name), value);
    }
    Ok(headers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use url::Url;

    #[tokio::test]
    async fn test_routes_answer_in_order_then_repeat() {
        let transport = MockTransport::new();
        transport
            .on_get("/a", MockResponse::error(502, "bad gateway"))
            .on_get("/a", MockResponse::ok(&json!({"ok": true})));

        let url = Url::parse("https://api.github.com/a").unwrap();
        let mut statuses = Vec::new();
        for _ in 0..3 {
            let response = transport
                .send(HttpRequest::new(Method::GET, url.clone()))
                .await
                .unwrap();
            statuses.push(response.status.as_u16());
        }
        assert_eq!(statuses, vec![502, 200, 200]);
        assert_eq!(transport.calls_to("/a"), 3);

        let missing = transport
            .send(HttpRequest::new(
                Method::GET,
                Url::parse("https://api.github.com/b").unwrap(),
            ))
            .await
            .unwrap();
        assert_eq!(missing.status, StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_fake_graph_pages_forward_and_backward() {
        let graph = issue_graph(5, 0);
        let forward = graph.execute(
            "query($after: String) { repository { issues(first: 2, after: $after) { totalCount nodes { number } pageInfo { hasNextPage endCursor } } } }",
            None,
            &json!({"after": "c1"}),
        );
        assert_eq!(
            forward.data,
            json!({"repository": {"issues": {
                "totalCount": 5,
                "nodes": [{"number": 3}, {"number": 4}],
                "pageInfo": {"hasNextPage": true, "endCursor": "c3"}
            }}})
        );

        let backward = graph.execute(
            "{ repository { issues(last: 2) { edges { cursor node { number } } pageInfo { hasPreviousPage startCursor } } } }",
            None,
            &Json::Null,
        );
        assert_eq!(
            backward.data,
            json!({"repository": {"issues": {
                "edges": [{"cursor": "c3", "node": {"number": 4}}, {"cursor": "c4", "node": {"number": 5}}],
                "pageInfo": {"hasPreviousPage": true, "startCursor": "c3"}
            }}})
        );
    }

    #[test]
    fn test_fake_graph_aliases_and_node_limit() {
        let graph = issue_graph(3, 2).with_node_limit(4, CostModel::default());
        let ok = graph.execute(
            "{ r: repository { open: issues(first: 2) { nodes { title } } } }",
            None,
            &Json::Null,
        );
        assert_eq!(
            ok.data,
            json!({"r": {"open": {"nodes": [{"title": "Issue 1"}, {"title": "Issue 2"}]}}})
        );

        let refused = graph.execute(
            "{ repository { issues(first: 3) { nodes { comments(first: 2) { totalCount } } } } }",
            None,
            &Json::Null,
        );
        assert!(refused.data.is_null());
        assert!(refused.error_of_type("MAX_NODE_LIMIT_EXCEEDED").is_some());
    }

    #[test]
    fn test_collecting_telemetry_counts() {
        let sink = CollectingTelemetry::default();
        sink.record(&TelemetryEvent::CacheEvicted { count: 2 });
        sink.record(&TelemetryEvent::CacheHit {
            signature: "GET /x".into(),
        });
        assert_eq!(
            sink.count(|e| matches!(e, TelemetryEvent::CacheHit { .. })),
            1
        );
        sink.clear();
        assert!(sink.events().is_empty());
    }
}
