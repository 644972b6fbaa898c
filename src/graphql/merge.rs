//! Reassembling sub-query results into the shape of the original operation.

use std::collections::BTreeMap;

use serde_json::{Map, Value as Json};

use super::ast::Selection;
use super::planner::{flatten_fields, ChunkInfo, PageDirection, QueryPlan, PAGE_INFO_ALIAS};
use super::{GraphQlError, GraphQlResult};

/// Response of one sub-query, with its alias prefix already removed.
#[derive(Debug, Clone, Default)]
pub struct SubResult {
    /// Sub-query index.
    pub index: usize,
    /// `data` of the sub-query; null when it failed entirely.
    pub data: Json,
    /// Errors attributed to the sub-query, paths rewritten.
    pub errors: Vec<GraphQlError>,
}

/// Merges sub-results of `plan`.
///
/// Objects are merged field by field. Lists fetched twice (the same page of
/// a connection selected by two sub-queries) merge element-wise. Chunks of a
/// paged connection concatenate their `nodes` and `edges` in page order and
/// report the outer page boundaries. Keys come out in document order.
pub fn merge(plan: &QueryPlan, results: &[SubResult]) -> GraphQlResult {
    if !plan.is_split() {
        return results
            .first()
            .map(|r| GraphQlResult {
                data: r.data.clone(),
                errors: r.errors.clone(),
            })
            .unwrap_or_default();
    }

    let mut ordered: Vec<&SubResult> = results.iter().collect();
    ordered.sort_by_key(|r| r.index);

    let mut data = Json::Object(Map::new());
    let mut any_data = false;
    let mut errors = Vec::new();
    let mut groups: BTreeMap<usize, Vec<(&ChunkInfo, &SubResult)>> = BTreeMap::new();

    for result in ordered {
        errors.extend(result.errors.iter().cloned());
        let Some(sub) = plan.sub_queries().get(result.index) else {
            continue;
        };
        match &sub.chunk {
            Some(chunk) => groups.entry(chunk.group).or_default().push((chunk, result)),
            None if !result.data.is_null() => {
                any_data = true;
                deep_merge(&mut data, result.data.clone());
            }
            None => {}
        }
    }

    for (_, mut chunks) in groups {
        chunks.sort_by_key(|(chunk, _)| chunk.position);
        if let Some(combined) = combine_chunks(&chunks) {
            any_data = true;
            deep_merge(&mut data, combined);
        }
    }

    GraphQlResult {
        data: if any_data {
            reorder(data, &plan.operation().selection_set)
        } else {
            Json::Null
        },
        errors,
    }
}

fn combine_chunks(chunks: &[(&ChunkInfo, &SubResult)]) -> Option<Json> {
    let (first, head) = chunks.first()?;
    if head.data.is_null() {
        return None;
    }
    let mut base = head.data.clone();
    let Some(connection) = pointer_mut(&mut base, &first.path) else {
        return Some(base);
    };

    let mut last: Option<&Map<String, Json>> = None;
    for (chunk, result) in &chunks[1..] {
        let Some(next) = pointer(&result.data, &chunk.path) else {
            break;
        };
        for key in &first.shape.lists {
            let Some(Json::Array(incoming)) = next.get(key) else {
                continue;
            };
            if let Some(Json::Array(existing)) = connection.get_mut(key) {
                match first.direction {
                    PageDirection::Forward => existing.extend(incoming.iter().cloned()),
                    PageDirection::Backward => {
                        let mut merged = incoming.clone();
                        merged.append(existing);
                        *existing = merged;
                    }
                }
            }
        }
        last = Some(next);
    }

    if let Some(last) = last {
        let boundary: &[&str] = match first.direction {
            PageDirection::Forward => &["hasNextPage", "endCursor"],
            PageDirection::Backward => &["hasPreviousPage", "startCursor"],
        };
        for (page_info_key, keys) in &first.shape.page_infos {
            let (Some(Json::Object(target)), Some(Json::Object(source))) =
                (connection.get_mut(page_info_key), last.get(page_info_key))
            else {
                continue;
            };
            for name in boundary {
                if let Some(key) = keys.get(*name) {
                    if let Some(value) = source.get(key) {
                        target.insert(key.clone(), value.clone());
                    }
                }
            }
        }
    }
    Some(base)
}

fn pointer<'a>(value: &'a Json, path: &[String]) -> Option<&'a Map<String, Json>> {
    path.iter()
        .try_fold(value, |value, key| value.get(key))
        .and_then(Json::as_object)
}

fn pointer_mut<'a>(value: &'a mut Json, path: &[String]) -> Option<&'a mut Map<String, Json>> {
    path.iter()
        .try_fold(value, |value, key| value.get_mut(key))
        .and_then(Json::as_object_mut)
}

/// Merges `source` into `target`. Existing non-null scalars win.
pub(crate) fn deep_merge(target: &mut Json, source: Json) {
    match (target, source) {
        (Json::Object(target), Json::Object(source)) => {
            for (key, value) in source {
                match target.get_mut(&key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        target.insert(key, value);
                    }
                }
            }
        }
        (Json::Array(target), Json::Array(source)) => {
            for (index, value) in source.into_iter().enumerate() {
                match target.get_mut(index) {
                    Some(existing) => deep_merge(existing, value),
                    None => target.push(value),
                }
            }
        }
        (target, source) => {
            if target.is_null() {
                *target = source;
            }
        }
    }
}

/// Rebuilds objects with keys in selection order, dropping planner fields.
fn reorder(value: Json, selections: &[Selection]) -> Json {
    match value {
        Json::Object(mut map) => {
            let mut fields = Vec::new();
            flatten_fields(selections, &mut fields);

            let mut out = Map::new();
            for field in &fields {
                let key = field.response_key();
                if out.contains_key(key) {
                    continue;
                }
                let Some(child) = map.remove(key) else {
                    continue;
                };
                let children: Vec<Selection> = fields
                    .iter()
                    .filter(|f| f.response_key() == key)
                    .flat_map(|f| f.selection_set.iter().cloned())
                    .collect();
                out.insert(key.to_string(), reorder(child, &children));
            }
            for (key, child) in map {
                if key != PAGE_INFO_ALIAS {
                    out.insert(key, child);
                }
            }
            Json::Object(out)
        }
        Json::Array(items) => Json::Array(
            items
                .into_iter()
                .map(|item| reorder(item, selections))
                .collect(),
        ),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graphql::{CostModel, QueryPlanner};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_deep_merge_combines_objects_and_lists() {
        let mut target = json!({"repo": {"name": "r", "items": [{"a": 1}, {"a": 2}]}});
        deep_merge(
            &mut target,
            json!({"repo": {"stars": 3, "items": [{"b": 1}, {"b": 2}, {"b": 3}]}}),
        );
        assert_eq!(
            target,
            json!({"repo": {"name": "r", "items": [{"a": 1, "b": 1}, {"a": 2, "b": 2}, {"b": 3}], "stars": 3}})
        );
    }

    #[test]
    fn test_deep_merge_keeps_existing_values() {
        let mut target = json!({"a": 1, "b": null});
        deep_merge(&mut target, json!({"a": 2, "b": 5}));
        assert_eq!(target, json!({"a": 1, "b": 5}));
    }

    #[test]
    fn test_chunks_concatenate_and_take_outer_boundaries() {
        let query = "query { repository(owner: \"o\", name: \"r\") { issues(first: 4) { pageInfo { endCursor hasNextPage startCursor } nodes { labels(first: 100) { totalCount } } } } }";
        let plan = QueryPlanner::new(CostModel::default(), 200, 16)
            .plan(query, None, &json!({}))
            .unwrap();
        assert_eq!(plan.sub_queries().len(), 2);

        let page = |nodes: Json, start: &str, end: &str, next: bool| {
            json!({"repository": {"issues": {
                "pageInfo": {"endCursor": end, "hasNextPage": next, "startCursor": start},
                "nodes": nodes,
                "_gqlPlanPageInfo": {"hasNextPage": next, "endCursor": end, "hasPreviousPage": false, "startCursor": start}
            }}})
        };
        let results = vec![
            SubResult {
                index: 0,
                data: page(json!([{"labels": {"totalCount": 1}}, {"labels": {"totalCount": 2}}]), "c0", "c1", true),
                errors: Vec::new(),
            },
            SubResult {
                index: 1,
                data: page(json!([{"labels": {"totalCount": 3}}, {"labels": {"totalCount": 4}}]), "c2", "c3", false),
                errors: Vec::new(),
            },
        ];

        let merged = plan.merge(&results);
        assert_eq!(
            merged.data,
            json!({"repository": {"issues": {
                "pageInfo": {"endCursor": "c3", "hasNextPage": false, "startCursor": "c0"},
                "nodes": [
                    {"labels": {"totalCount": 1}}, {"labels": {"totalCount": 2}},
                    {"labels": {"totalCount": 3}}, {"labels": {"totalCount": 4}}
                ]
            }}})
        );
    }

    #[test]
    fn test_backward_chunks_prepend_earlier_pages() {
        let query = "query { viewer { starredRepositories(last: 4) { nodes { languages(first: 100) { totalCount } } } } }";
        let plan = QueryPlanner::new(CostModel::default(), 200, 16)
            .plan(query, None, &json!({}))
            .unwrap();
        let page = |ids: [u64; 2]| {
            json!({"viewer": {"starredRepositories": {"nodes": [
                {"languages": {"totalCount": ids[0]}}, {"languages": {"totalCount": ids[1]}}
            ]}}})
        };
        let merged = plan.merge(&[
            SubResult {
                index: 0,
                data: page([3, 4]),
                errors: Vec::new(),
            },
            SubResult {
                index: 1,
                data: page([1, 2]),
                errors: Vec::new(),
            },
        ]);
        let totals: Vec<u64> = merged.data["viewer"]["starredRepositories"]["nodes"]
            .as_array()
            .unwrap()
            .iter()
            .map(|n| n["languages"]["totalCount"].as_u64().unwrap())
            .collect();
        assert_eq!(totals, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_keys_follow_document_order() {
        let query = "query { viewer { login zeta: repositories(first: 100) { nodes { issues(first: 100) { totalCount } } } alpha: followers(first: 100) { nodes { issues(first: 100) { totalCount } } } } }";
        let plan = QueryPlanner::new(CostModel::default(), 10_000, 16)
            .plan(query, None, &json!({}))
            .unwrap();
        assert!(plan.is_split());

        let results: Vec<SubResult> = plan
            .sub_queries()
            .iter()
            .rev()
            .map(|sub| {
                let mut viewer = Map::new();
                let mut fields = Vec::new();
                flatten_fields(&sub.selections, &mut fields);
                for root in fields {
                    let mut inner = Vec::new();
                    flatten_fields(&root.selection_set, &mut inner);
                    for field in inner {
                        let value = match field.name.as_str() {
                            "login" => json!("octocat"),
                            _ => json!({"nodes": []}),
                        };
                        viewer.insert(field.response_key().to_string(), value);
                    }
                }
                SubResult {
                    index: sub.index,
                    data: json!({ "viewer": viewer }),
                    errors: Vec::new(),
                }
            })
            .collect();

        let merged = plan.merge(&results);
        let keys: Vec<&String> = merged.data["viewer"].as_object().unwrap().keys().collect();
        assert_eq!(keys, vec!["login", "zeta", "alpha"]);
    }

    #[test]
    fn test_all_failed_sub_queries_yield_null_data() {
        let query = "query { a: search(query: \"x\", type: ISSUE, first: 60) { nodes { ... on Issue { labels(first: 10) { totalCount } } } } b: search(query: \"y\", type: ISSUE, first: 50) { nodes { ... on Issue { labels(first: 10) { totalCount } } } } }";
        let plan = QueryPlanner::new(CostModel::default(), 700, 16)
            .plan(query, None, &json!({}))
            .unwrap();
        let error: GraphQlError = serde_json::from_value(json!({"message": "boom", "path": ["a"]})).unwrap();
        let merged = plan.merge(&[
            SubResult {
                index: 0,
                data: Json::Null,
                errors: vec![error.clone()],
            },
            SubResult {
                index: 1,
                data: Json::Null,
                errors: Vec::new(),
            },
        ]);
        assert!(merged.data.is_null());
        assert_eq!(merged.errors, vec![error]);
    }
}
