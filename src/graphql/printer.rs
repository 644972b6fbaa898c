//! Compact single-line printing.

use std::fmt::Write;

use super::ast::*;

/// Prints a document on a single line with normalized spacing.
///
/// Parsing the output yields the same document.
pub fn print(document: &Document) -> String {
    let mut out = String::new();
    for operation in &document.operations {
        if !out.is_empty() {
            out.push(' ');
        }
        print_operation(&mut out, operation);
    }
    for fragment in &document.fragments {
        if !out.is_empty() {
            out.push(' ');
        }
        let _ = write!(out, "fragment {} on {}", fragment.name, fragment.type_condition);
        print_directives(&mut out, &fragment.directives);
        out.push(' ');
        print_selection_set(&mut out, &fragment.selection_set);
    }
    out
}

/// Prints a single operation.
pub fn print_operation(out: &mut String, operation: &OperationDefinition) {
    out.push_str(operation.kind.as_str());
    if let Some(name) = &operation.name {
        out.push(' ');
        out.push_str(name);
    }
    if !operation.variables.is_empty() {
        out.push('(');
        for (i, variable) in operation.variables.iter().enumerate() {
            if i > 0 {
                out.push_str(", ");
            }
            let _ = write!(out, "${}: ", variable.name);
            print_type(out, &variable.ty);
            if let Some(default) = &variable.default_value {
                out.push_str(" = ");
                print_value(out, default);
            }
        }
        out.push(')');
    }
    print_directives(out, &operation.directives);
    out.push(' ');
    print_selection_set(out, &operation.selection_set);
}

fn print_type(out: &mut String, ty: &TypeRef) {
    match ty {
        TypeRef::Named(name) => out.push_str(name),
        TypeRef::List(inner) => {
            out.push('[');
            print_type(out, inner);
            out.push(']');
        }
        TypeRef::NonNull(inner) => {
            print_type(out, inner);
            out.push('!');
        }
    }
}

pub(crate) fn print_selection_set(out: &mut String, selections: &[Selection]) {
    out.push('{');
    for selection in selections {
        out.push(' ');
        match selection {
            Selection::Field(field) => {
                if let Some(alias) = &field.alias {
                    let _ = write!(out, "{}: ", alias);
                }
                out.push_str(&field.name);
                print_arguments(out, &field.arguments);
                print_directives(out, &field.directives);
                if !field.selection_set.is_empty() {
                    out.push(' ');
                    print_selection_set(out, &field.selection_set);
                }
            }
            Selection::InlineFragment(fragment) => {
                out.push_str("...");
                if let Some(ty) = &fragment.type_condition {
                    let _ = write!(out, " on {}", ty);
                }
                print_directives(out, &fragment.directives);
                out.push(' ');
                print_selection_set(out, &fragment.selection_set);
            }
            Selection::FragmentSpread(spread) => {
                let _ = write!(out, "...{}", spread.name);
                print_directives(out, &spread.directives);
            }
        }
    }
    out.push_str(" }");
}

fn print_arguments(out: &mut String, arguments: &[(String, Value)]) {
    if arguments.is_empty() {
        return;
    }
    out.push('(');
    for (i, (name, value)) in arguments.iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        let _ = write!(out, "{}: ", name);
        print_value(out, value);
    }
    out.push(')');
}

fn print_directives(out: &mut String, directives: &[Directive]) {
    for directive in directives {
        let _ = write!(out, " @{}", directive.name);
        print_arguments(out, &directive.arguments);
    }
}

fn print_value(out: &mut String, value: &Value) {
    match value {
        Value::Variable(name) => {
            let _ = write!(out, "${}", name);
        }
        Value::Int(i) => {
            let _ = write!(out, "{}", i);
        }
        Value::Float(f) => {
            let _ = write!(out, "{:?}", f);
        }
        Value::String(s) => {
            out.push_str(&serde_json::Value::String(s.clone()).to_string());
        }
        Value::Boolean(b) => {
            let _ = write!(out, "{}", b);
        }
        Value::Null => out.push_str("null"),
        Value::Enum(e) => out.push_str(e),
        Value::List(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                print_value(out, item);
            }
            out.push(']');
        }
        Value::Object(fields) => {
            out.push('{');
            for (i, (name, item)) in fields.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                let _ = write!(out, "{}: ", name);
                print_value(out, item);
            }
            out.push('}');
        }
    }
}
