//! Recursive-descent parser for executable GraphQL documents.

use super::ast::*;
use crate::errors::{GitHubError, GitHubResult};

/// Deepest nesting of selection sets, list types and input values accepted.
pub const MAX_DEPTH: usize = 256;

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Punct(char),
    Spread,
    Name(String),
    Int(i64),
    Float(f64),
    Str(String),
    Eof,
}

#[derive(Debug, Clone)]
struct Spanned {
    token: Token,
    line: usize,
    column: usize,
}

struct Lexer<'a> {
    chars: std::iter::Peekable<std::str::Chars<'a>>,
    line: usize,
    column: usize,
}

impl<'a> Lexer<'a> {
    fn new(source: &'a str) -> Self {
        Self {
            chars: source.chars().peekable(),
            line: 1,
            column: 1,
        }
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.chars.next()?;
        if c == '\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        Some(c)
    }

    fn error(&self, message: impl std::fmt::Display) -> GitHubError {
        GitHubError::invalid_query(format!(
            "Syntax error at {}:{}: {}",
            self.line, self.column, message
        ))
    }

    fn tokenize(mut self) -> GitHubResult<Vec<Spanned>> {
        let mut tokens = Vec::new();
        loop {
            self.skip_ignored();
            let (line, column) = (self.line, self.column);
            let Some(&c) = self.chars.peek() else {
                tokens.push(Spanned {
                    token: Token::Eof,
                    line,
                    column,
                });
                return Ok(tokens);
            };
            let token = match c {
                '!' | '$' | '(' | ')' | ':' | '=' | '@' | '[' | ']' | '{' | '}' => {
                    self.bump();
                    Token::Punct(c)
                }
                '.' => {
                    for _ in 0..3 {
                        if self.bump() != Some('.') {
                            return Err(self.error("expected `...`"));
                        }
                    }
                    Token::Spread
                }
                '"' => self.string()?,
                '-' | '0'..='9' => self.number()?,
                c if c == '_' || c.is_ascii_alphabetic() => {
                    let mut name = String::new();
                    while let Some(&c) = self.chars.peek() {
                        if c == '_' || c.is_ascii_alphanumeric() {
                            name.push(c);
                            self.bump();
                        } else {
                            break;
                        }
                    }
                    Token::Name(name)
                }
                other => return Err(self.error(format!("unexpected character `{}`", other))),
            };
            tokens.push(Spanned {
                token,
                line,
                column,
            });
        }
    }

    fn skip_ignored(&mut self) {
        while let Some(&c) = self.chars.peek() {
            match c {
                ' ' | '\t' | '\n' | '\r' | ',' | '\u{feff}' => {
                    self.bump();
                }
                '#' => {
                    while let Some(&c) = self.chars.peek() {
                        if c == '\n' {
                            break;
                        }
                        self.bump();
                    }
                }
                _ => break,
            }
        }
    }

    fn number(&mut self) -> GitHubResult<Token> {
        let mut text = String::new();
        let mut is_float = false;
        if self.chars.peek() == Some(&'-') {
            text.push('-');
            self.bump();
        }
        while let Some(&c) = self.chars.peek() {
            match c {
                '0'..='9' => text.push(c),
                '.' | 'e' | 'E' => {
                    is_float = true;
                    text.push(c);
                }
                '+' | '-' if matches!(text.chars().last(), Some('e' | 'E')) => text.push(c),
                _ => break,
            }
            self.bump();
        }
        if is_float {
            text.parse::<f64>()
                .map(Token::Float)
                .map_err(|_| self.error(format!("invalid float `{}`", text)))
        } else {
            text.parse::<i64>()
                .map(Token::Int)
                .map_err(|_| self.error(format!("invalid integer `{}`", text)))
        }
    }

    fn string(&mut self) -> GitHubResult<Token> {
        self.bump();
        if self.chars.peek() == Some(&'"') {
            self.bump();
            if self.chars.peek() == Some(&'"') {
                self.bump();
                return self.block_string();
            }
            return Ok(Token::Str(String::new()));
        }

        let mut out = String::new();
        loop {
            match self.bump() {
                None | Some('\n') => return Err(self.error("unterminated string")),
                Some('"') => return Ok(Token::Str(out)),
                Some('\\') => match self.bump() {
                    Some('"') => out.push('"'),
                    Some('\\') => out.push('\\'),
                    Some('/') => out.push('/'),
                    Some('b') => out.push('\u{8}'),
                    Some('f') => out.push('\u{c}'),
                    Some('n') => out.push('\n'),
                    Some('r') => out.push('\r'),
                    Some('t') => out.push('\t'),
                    Some('u') => {
                        let hex: String = (0..4).filter_map(|_| self.bump()).collect();
                        let decoded = u32::from_str_radix(&hex, 16)
                            .ok()
                            .and_then(char::from_u32)
                            .ok_or_else(|| self.error(format!("invalid unicode escape `{}`", hex)))?;
                        out.push(decoded);
                    }
                    other => {
                        return Err(self.error(format!("invalid escape `{:?}`", other)));
                    }
                },
                Some(c) => out.push(c),
            }
        }
    }

    fn block_string(&mut self) -> GitHubResult<Token> {
        let mut raw = String::new();
        loop {
            match self.bump() {
                None => return Err(self.error("unterminated block string")),
                Some('"') if raw.ends_with("\"\"") && !raw.ends_with("\\\"\"") => {
                    raw.truncate(raw.len() - 2);
                    return Ok(Token::Str(block_string_value(&raw.replace("\\\"\"\"", "\"\"\""))));
                }
                Some(c) => raw.push(c),
            }
        }
    }
}

/// Common-indentation removal for block strings.
fn block_string_value(raw: &str) -> String {
    let lines: Vec<&str> = raw.lines().collect();
    let indent = lines
        .iter()
        .skip(1)
        .filter(|l| !l.trim().is_empty())
        .map(|l| l.len() - l.trim_start_matches([' ', '\t']).len())
        .min()
        .unwrap_or(0);

    let mut out: Vec<String> = lines
        .iter()
        .enumerate()
        .map(|(i, l)| {
            if i == 0 {
                l.to_string()
            } else {
                l.get(indent..).unwrap_or(l).to_string()
            }
        })
        .collect();
    while out.first().map_or(false, |l| l.trim().is_empty()) {
        out.remove(0);
    }
    while out.last().map_or(false, |l| l.trim().is_empty()) {
        out.pop();
    }
    out.join("\n")
}

struct Parser {
    tokens: Vec<Spanned>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> &Token {
        &self.tokens[self.pos.min(self.tokens.len() - 1)].token
    }

    fn next(&mut self) -> Token {
        let token = self.peek().clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        token
    }

    fn error(&self, message: impl std::fmt::Display) -> GitHubError {
        let at = &self.tokens[self.pos.min(self.tokens.len() - 1)];
        GitHubError::invalid_query(format!(
            "Syntax error at {}:{}: {}",
            at.line, at.column, message
        ))
    }

    fn eat(&mut self, c: char) -> bool {
        if self.peek() == &Token::Punct(c) {
            self.next();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, c: char) -> GitHubResult<()> {
        if self.eat(c) {
            Ok(())
        } else {
            Err(self.error(format!("expected `{}`, found {:?}", c, self.peek())))
        }
    }

    fn name(&mut self) -> GitHubResult<String> {
        match self.next() {
            Token::Name(name) => Ok(name),
            other => {
                self.pos = self.pos.saturating_sub(1);
                Err(self.error(format!("expected a name, found {:?}", other)))
            }
        }
    }

    /// Runs `f` one nesting level deeper.
    fn nested<T>(&mut self, f: impl FnOnce(&mut Self) -> GitHubResult<T>) -> GitHubResult<T> {
        if self.depth >= MAX_DEPTH {
            return Err(self.error(format!("nesting exceeds {} levels", MAX_DEPTH)));
        }
        self.depth += 1;
        let result = f(self);
        self.depth -= 1;
        result
    }

    fn peek_name(&self, keyword: &str) -> bool {
        matches!(self.peek(), Token::Name(n) if n == keyword)
    }

    fn document(&mut self) -> GitHubResult<Document> {
        let mut document = Document::default();
        while self.peek() != &Token::Eof {
            match self.peek().clone() {
                Token::Punct('{') => document.operations.push(OperationDefinition {
                    kind: OperationKind::Query,
                    name: None,
                    variables: Vec::new(),
                    directives: Vec::new(),
                    selection_set: self.selection_set()?,
                }),
                Token::Name(keyword) => match keyword.as_str() {
                    "query" | "mutation" | "subscription" => {
                        document.operations.push(self.operation()?)
                    }
                    "fragment" => document.fragments.push(self.fragment()?),
                    other => return Err(self.error(format!("unexpected `{}`", other))),
                },
                other => return Err(self.error(format!("unexpected {:?}", other))),
            }
        }
        if document.operations.is_empty() {
            return Err(GitHubError::invalid_query("Document contains no operation"));
        }
        Ok(document)
    }

    fn operation(&mut self) -> GitHubResult<OperationDefinition> {
        let kind = match self.name()?.as_str() {
            "query" => OperationKind::Query,
            "mutation" => OperationKind::Mutation,
            _ => OperationKind::Subscription,
        };
        let name = match self.peek() {
            Token::Name(_) => Some(self.name()?),
            _ => None,
        };
        let mut variables = Vec::new();
        if self.eat('(') {
            while !self.eat(')') {
                self.expect('$')?;
                let name = self.name()?;
                self.expect(':')?;
                let ty = self.type_ref()?;
                let default_value = if self.eat('=') {
                    Some(self.value(true)?)
                } else {
                    None
                };
                // Variable directives are accepted and dropped.
                self.directives()?;
                variables.push(VariableDefinition {
                    name,
                    ty,
                    default_value,
                });
            }
        }
        Ok(OperationDefinition {
            kind,
            name,
            variables,
            directives: self.directives()?,
            selection_set: self.selection_set()?,
        })
    }

    fn fragment(&mut self) -> GitHubResult<FragmentDefinition> {
        self.name()?;
        let name = self.name()?;
        if name == "on" {
            return Err(self.error("fragment cannot be named `on`"));
        }
        if !self.peek_name("on") {
            return Err(self.error("expected `on`"));
        }
        self.next();
        Ok(FragmentDefinition {
            name,
            type_condition: self.name()?,
            directives: self.directives()?,
            selection_set: self.selection_set()?,
        })
    }

    fn type_ref(&mut self) -> GitHubResult<TypeRef> {
        let inner = if self.eat('[') {
            let item = self.nested(Self::type_ref)?;
            self.expect(']')?;
            TypeRef::List(Box::new(item))
        } else {
            TypeRef::Named(self.name()?)
        };
        Ok(if self.eat('!') {
            TypeRef::NonNull(Box::new(inner))
        } else {
            inner
        })
    }

    fn selection_set(&mut self) -> GitHubResult<Vec<Selection>> {
        self.nested(Self::selection_set_body)
    }

    fn selection_set_body(&mut self) -> GitHubResult<Vec<Selection>> {
        self.expect('{')?;
        let mut selections = Vec::new();
        while !self.eat('}') {
            if self.peek() == &Token::Eof {
                return Err(self.error("unterminated selection set"));
            }
            selections.push(self.selection()?);
        }
        if selections.is_empty() {
            return Err(self.error("empty selection set"));
        }
        Ok(selections)
    }

    fn selection(&mut self) -> GitHubResult<Selection> {
        if self.peek() == &Token::Spread {
            self.next();
            if self.peek_name("on") {
                self.next();
                return Ok(Selection::InlineFragment(InlineFragment {
                    type_condition: Some(self.name()?),
                    directives: self.directives()?,
                    selection_set: self.selection_set()?,
                }));
            }
            if let Token::Name(_) = self.peek() {
                return Ok(Selection::FragmentSpread(FragmentSpread {
                    name: self.name()?,
                    directives: self.directives()?,
                }));
            }
            return Ok(Selection::InlineFragment(InlineFragment {
                type_condition: None,
                directives: self.directives()?,
                selection_set: self.selection_set()?,
            }));
        }

        let first = self.name()?;
        let (alias, name) = if self.eat(':') {
            (Some(first), self.name()?)
        } else {
            (None, first)
        };
        let arguments = self.arguments(false)?;
        let directives = self.directives()?;
        let selection_set = if self.peek() == &Token::Punct('{') {
            self.selection_set()?
        } else {
            Vec::new()
        };
        Ok(Selection::Field(Field {
            alias,
            name,
            arguments,
            directives,
            selection_set,
        }))
    }

    fn arguments(&mut self, constant: bool) -> GitHubResult<Vec<(String, Value)>> {
        let mut arguments = Vec::new();
        if self.eat('(') {
            while !self.eat(')') {
                let name = self.name()?;
                self.expect(':')?;
                arguments.push((name, self.value(constant)?));
            }
        }
        Ok(arguments)
    }

    fn directives(&mut self) -> GitHubResult<Vec<Directive>> {
        let mut directives = Vec::new();
        while self.eat('@') {
            directives.push(Directive {
                name: self.name()?,
                arguments: self.arguments(false)?,
            });
        }
        Ok(directives)
    }

    fn value(&mut self, constant: bool) -> GitHubResult<Value> {
        match self.next() {
            Token::Punct('$') if !constant => Ok(Value::Variable(self.name()?)),
            Token::Int(i) => Ok(Value::Int(i)),
            Token::Float(f) => Ok(Value::Float(f)),
            Token::Str(s) => Ok(Value::String(s)),
            Token::Name(n) => Ok(match n.as_str() {
                "true" => Value::Boolean(true),
                "false" => Value::Boolean(false),
                "null" => Value::Null,
                _ => Value::Enum(n),
            }),
            Token::Punct('[') => {
                let mut items = Vec::new();
                while !self.eat(']') {
                    items.push(self.nested(|p| p.value(constant))?);
                }
                Ok(Value::List(items))
            }
            Token::Punct('{') => {
                let mut fields = Vec::new();
                while !self.eat('}') {
                    let name = self.name()?;
                    self.expect(':')?;
                    fields.push((name, self.nested(|p| p.value(constant))?));
                }
                Ok(Value::Object(fields))
            }
            other => {
                self.pos = self.pos.saturating_sub(1);
                Err(self.error(format!("expected a value, found {:?}", other)))
            }
        }
    }
}

/// Parses an executable document.
///
/// # Errors
///
/// Returns an `InvalidQuery` error with the line and column of the first
/// syntax error, or of the point where nesting passes [`MAX_DEPTH`].
pub fn parse(source: &str) -> GitHubResult<Document> {
    let tokens = Lexer::new(source).tokenize()?;
    Parser {
        tokens,
        pos: 0,
        depth: 0,
    }
    .document()
}
