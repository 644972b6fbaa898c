//! Executable GraphQL document model.

use serde_json::{Map, Value as Json};

use crate::errors::{GitHubError, GitHubResult};

/// A parsed executable document.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Document {
    /// Operations in source order.
    pub operations: Vec<OperationDefinition>,
    /// Fragment definitions in source order.
    pub fragments: Vec<FragmentDefinition>,
}

impl Document {
    /// Picks the operation to run.
    ///
    /// Without a name the document must hold exactly one operation.
    pub fn operation(&self, name: Option<&str>) -> GitHubResult<&OperationDefinition> {
        match name {
            Some(name) => self
                .operations
                .iter()
                .find(|op| op.name.as_deref() == Some(name))
                .ok_or_else(|| GitHubError::invalid_query(format!("Unknown operation `{}`", name))),
            None => match self.operations.as_slice() {
                [single] => Ok(single),
                [] => Err(GitHubError::invalid_query("Document contains no operation")),
                _ => Err(GitHubError::invalid_query(
                    "Document contains several operations; an operation name is required",
                )),
            },
        }
    }

    /// Fragment by name.
    pub fn fragment(&self, name: &str) -> Option<&FragmentDefinition> {
        self.fragments.iter().find(|f| f.name == name)
    }
}

/// Operation type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    /// `query`
    Query,
    /// `mutation`
    Mutation,
    /// `subscription`
    Subscription,
}

impl OperationKind {
    /// Keyword.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Query => "query",
            Self::Mutation => "mutation",
            Self::Subscription => "subscription",
        }
    }
}

/// `query Name($var: Type) @dir { ... }`
#[derive(Debug, Clone, PartialEq)]
pub struct OperationDefinition {
    /// Operation type.
    pub kind: OperationKind,
    /// Optional name.
    pub name: Option<String>,
    /// Variable definitions.
    pub variables: Vec<VariableDefinition>,
    /// Directives.
    pub directives: Vec<Directive>,
    /// Root selections.
    pub selection_set: Vec<Selection>,
}

impl OperationDefinition {
    /// Caller variables completed with declared defaults.
    pub fn resolve_variables(&self, provided: &Json) -> Map<String, Json> {
        let mut resolved = provided.as_object().cloned().unwrap_or_default();
        for definition in &self.variables {
            if !resolved.contains_key(&definition.name) {
                if let Some(default) = &definition.default_value {
                    resolved.insert(definition.name.clone(), default.to_json(&Map::new()));
                }
            }
        }
        resolved
    }
}

/// `$name: Type = default`
#[derive(Debug, Clone, PartialEq)]
pub struct VariableDefinition {
    /// Name without `$`.
    pub name: String,
    /// Declared type.
    pub ty: TypeRef,
    /// Default value.
    pub default_value: Option<Value>,
}

/// Variable type reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypeRef {
    /// `Name`
    Named(String),
    /// `[Type]`
    List(Box<TypeRef>),
    /// `Type!`
    NonNull(Box<TypeRef>),
}

/// One entry of a selection set.
#[derive(Debug, Clone, PartialEq)]
pub enum Selection {
    /// A field.
    Field(Field),
    /// `... on Type { }` or `... @dir { }`
    InlineFragment(InlineFragment),
    /// `...Name`
    FragmentSpread(FragmentSpread),
}

/// A field selection.
#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    /// Alias.
    pub alias: Option<String>,
    /// Field name.
    pub name: String,
    /// Arguments in source order.
    pub arguments: Vec<(String, Value)>,
    /// Directives.
    pub directives: Vec<Directive>,
    /// Sub-selections; empty for leaf fields.
    pub selection_set: Vec<Selection>,
}

impl Field {
    /// Creates a leaf field.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            alias: None,
            name: name.into(),
            arguments: Vec::new(),
            directives: Vec::new(),
            selection_set: Vec::new(),
        }
    }

    /// Key of this field in the response.
    pub fn response_key(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.name)
    }

    /// Argument value by name.
    pub fn argument(&self, name: &str) -> Option<&Value> {
        self.arguments
            .iter()
            .find(|(arg, _)| arg == name)
            .map(|(_, value)| value)
    }

    /// Sets or replaces an argument.
    pub fn set_argument(&mut self, name: &str, value: Value) {
        match self.arguments.iter_mut().find(|(arg, _)| arg == name) {
            Some(slot) => slot.1 = value,
            None => self.arguments.push((name.to_string(), value)),
        }
    }
}

/// Inline fragment.
#[derive(Debug, Clone, PartialEq)]
pub struct InlineFragment {
    /// `on Type`
    pub type_condition: Option<String>,
    /// Directives.
    pub directives: Vec<Directive>,
    /// Selections.
    pub selection_set: Vec<Selection>,
}

/// Named fragment spread.
#[derive(Debug, Clone, PartialEq)]
pub struct FragmentSpread {
    /// Fragment name.
    pub name: String,
    /// Directives.
    pub directives: Vec<Directive>,
}

/// `fragment Name on Type { ... }`
#[derive(Debug, Clone, PartialEq)]
pub struct FragmentDefinition {
    /// Name.
    pub name: String,
    /// Type condition.
    pub type_condition: String,
    /// Directives.
    pub directives: Vec<Directive>,
    /// Selections.
    pub selection_set: Vec<Selection>,
}

/// `@name(args)`
#[derive(Debug, Clone, PartialEq)]
pub struct Directive {
    /// Name without `@`.
    pub name: String,
    /// Arguments.
    pub arguments: Vec<(String, Value)>,
}

/// Input value literal.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// `$name`
    Variable(String),
    /// Integer literal.
    Int(i64),
    /// Float literal.
    Float(f64),
    /// String literal (block strings included).
    String(String),
    /// `true` / `false`
    Boolean(bool),
    /// `null`
    Null,
    /// Enum value.
    Enum(String),
    /// `[...]`
    List(Vec<Value>),
    /// `{...}`
    Object(Vec<(String, Value)>),
}

impl Value {
    /// Substitutes variables and converts to JSON. Missing variables are null.
    pub fn to_json(&self, variables: &Map<String, Json>) -> Json {
        match self {
            Self::Variable(name) => variables.get(name).cloned().unwrap_or(Json::Null),
            Self::Int(i) => Json::from(*i),
            Self::Float(f) => serde_json::Number::from_f64(*f)
                .map(Json::Number)
                .unwrap_or(Json::Null),
            Self::String(s) | Self::Enum(s) => Json::String(s.clone()),
            Self::Boolean(b) => Json::Bool(*b),
            Self::Null => Json::Null,
            Self::List(items) => Json::Array(items.iter().map(|v| v.to_json(variables)).collect()),
            Self::Object(fields) => Json::Object(
                fields
                    .iter()
                    .map(|(k, v)| (k.clone(), v.to_json(variables)))
                    .collect(),
            ),
        }
    }

    /// Non-negative integer after variable substitution.
    pub fn as_u64(&self, variables: &Map<String, Json>) -> Option<u64> {
        match self {
            Self::Int(i) => u64::try_from(*i).ok(),
            Self::Variable(name) => variables.get(name).and_then(Json::as_u64),
            _ => None,
        }
    }

    /// Calls `f` with every variable referenced.
    pub fn visit_variables<'a>(&'a self, f: &mut impl FnMut(&'a str)) {
        match self {
            Self::Variable(name) => f(name),
            Self::List(items) => items.iter().for_each(|v| v.visit_variables(f)),
            Self::Object(fields) => fields.iter().for_each(|(_, v)| v.visit_variables(f)),
            _ => {}
        }
    }
}

/// Calls `f` with every variable referenced by `selections`.
pub(crate) fn visit_selection_variables<'a>(
    selections: &'a [Selection],
    f: &mut impl FnMut(&'a str),
) {
    fn directives<'a>(list: &'a [Directive], f: &mut impl FnMut(&'a str)) {
        for directive in list {
            for (_, value) in &directive.arguments {
                value.visit_variables(f);
            }
        }
    }

    for selection in selections {
        match selection {
            Selection::Field(field) => {
                for (_, value) in &field.arguments {
                    value.visit_variables(f);
                }
                directives(&field.directives, f);
                visit_selection_variables(&field.selection_set, f);
            }
            Selection::InlineFragment(fragment) => {
                directives(&fragment.directives, f);
                visit_selection_variables(&fragment.selection_set, f);
            }
            Selection::FragmentSpread(spread) => directives(&spread.directives, f),
        }
    }
}

/// Most selections an operation may hold once fragments are expanded.
pub const MAX_EXPANDED_SELECTIONS: usize = 100_000;

/// Replaces every fragment spread with an equivalent inline fragment.
///
/// # Errors
///
/// Fails with `InvalidQuery` on unknown fragments and on fragment cycles, and
/// with `QueryTooLarge` when an operation expands past
/// [`MAX_EXPANDED_SELECTIONS`].
pub fn expand_fragments(document: &Document) -> GitHubResult<Document> {
    fn expand(
        selections: &[Selection],
        document: &Document,
        stack: &mut Vec<String>,
        budget: &mut usize,
    ) -> GitHubResult<Vec<Selection>> {
        let mut out = Vec::with_capacity(selections.len());
        for selection in selections {
            *budget = budget.checked_sub(1).ok_or_else(|| {
                GitHubError::query_too_large(format!(
                    "Operation expands to more than {} selections",
                    MAX_EXPANDED_SELECTIONS
                ))
            })?;
            out.push(match selection {
                Selection::Field(field) => {
                    let mut field = field.clone();
                    field.selection_set = expand(&field.selection_set, document, stack, budget)?;
                    Selection::Field(field)
                }
                Selection::InlineFragment(fragment) => {
                    let mut fragment = fragment.clone();
                    fragment.selection_set =
                        expand(&fragment.selection_set, document, stack, budget)?;
                    Selection::InlineFragment(fragment)
                }
                Selection::FragmentSpread(spread) => {
                    if stack.contains(&spread.name) {
                        return Err(GitHubError::invalid_query(format!(
                            "Fragment cycle through `{}`",
                            spread.name
                        )));
                    }
                    let definition = document.fragment(&spread.name).ok_or_else(|| {
                        GitHubError::invalid_query(format!("Unknown fragment `{}`", spread.name))
                    })?;
                    stack.push(spread.name.clone());
                    let selection_set =
                        expand(&definition.selection_set, document, stack, budget)?;
                    stack.pop();
                    let mut directives = definition.directives.clone();
                    directives.extend(spread.directives.iter().cloned());
                    Selection::InlineFragment(InlineFragment {
                        type_condition: Some(definition.type_condition.clone()),
                        directives,
                        selection_set,
                    })
                }
            });
        }
        Ok(out)
    }

    let mut operations = Vec::with_capacity(document.operations.len());
    for operation in &document.operations {
        let mut operation = operation.clone();
        let mut budget = MAX_EXPANDED_SELECTIONS;
        operation.selection_set = expand(
            &operation.selection_set,
            document,
            &mut Vec::new(),
            &mut budget,
        )?;
        operations.push(operation);
    }
    Ok(Document {
        operations,
        fragments: Vec::new(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::GitHubErrorKind;
    use crate::graphql::parse;

    #[test]
    fn test_diamond_fragments_stop_at_the_expansion_cap() {
        // Each fragment spreads the next twice: 2^40 leaves once expanded.
        let mut source = String::from("query { viewer { ...F0 } }\n");
        for i in 0..40 {
            source.push_str(&format!("fragment F{} on User {{ ...F{} ...F{} }}\n", i, i + 1, i + 1));
        }
        source.push_str("fragment F40 on User { login }\n");

        let document = parse(&source).unwrap();
        let err = expand_fragments(&document).unwrap_err();
        assert_eq!(err.kind(), GitHubErrorKind::QueryTooLarge);
    }

    #[test]
    fn test_small_diamond_expands_fully() {
        let document = parse(
            "query { viewer { ...A } }
             fragment A on User { ...B ...B }
             fragment B on User { login }",
        )
        .unwrap();
        let expanded = expand_fragments(&document).unwrap();
        let Selection::Field(viewer) = &expanded.operations[0].selection_set[0] else {
            panic!("expected field");
        };
        let Selection::InlineFragment(a) = &viewer.selection_set[0] else {
            panic!("expected fragment");
        };
        assert_eq!(a.selection_set.len(), 2);
        assert!(expanded.fragments.is_empty());
    }
}
