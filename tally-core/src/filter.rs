//! Attribute filter expressions for saved-object queries
//!
//! A small KQL subset: existence predicates over attribute paths combined
//! with `not`, `and`, `or` and parentheses.
//!
//! ```text
//! cases.attributes.incremental_id: *
//! not cases.attributes.incremental_id: *
//! ```

use std::fmt;

use serde_json::Value;

use crate::StorageError;

const ATTRIBUTES_SEGMENT: &str = "attributes";

/// Parsed filter expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterExpr {
    /// `<type>.attributes.<path>: *`
    Exists { object_type: String, path: Vec<String> },
    Not(Box<FilterExpr>),
    And(Vec<FilterExpr>),
    Or(Vec<FilterExpr>),
}

impl FilterExpr {
    /// Existence predicate on a dotted attribute path.
    pub fn exists(object_type: impl Into<String>, path: &str) -> Self {
        FilterExpr::Exists {
            object_type: object_type.into(),
            path: path.split('.').map(str::to_string).collect(),
        }
    }

    pub fn negate(self) -> Self {
        FilterExpr::Not(Box::new(self))
    }

    /// Parse a filter string.
    pub fn parse(input: &str) -> Result<Self, StorageError> {
        let tokens = tokenize(input)?;
        let mut parser = Parser {
            input,
            tokens,
            pos: 0,
        };
        let expr = parser.parse_or()?;
        if parser.pos != parser.tokens.len() {
            return Err(invalid(input, "unexpected trailing input"));
        }
        Ok(expr)
    }

    /// Ensure every predicate targets `object_type`.
    pub fn validate_type(&self, object_type: &str) -> Result<(), StorageError> {
        match self {
            FilterExpr::Exists {
                object_type: target,
                ..
            } => {
                if target == object_type {
                    Ok(())
                } else {
                    Err(invalid(
                        &self.to_string(),
                        &format!("predicate targets type '{target}' but the search is for '{object_type}'"),
                    ))
                }
            }
            FilterExpr::Not(inner) => inner.validate_type(object_type),
            FilterExpr::And(items) | FilterExpr::Or(items) => items
                .iter()
                .try_for_each(|item| item.validate_type(object_type)),
        }
    }

    /// Evaluate against a document's attributes.
    pub fn matches(&self, attributes: &Value) -> bool {
        match self {
            FilterExpr::Exists { path, .. } => lookup_path(attributes, path.as_slice())
                .map(|v| !v.is_null())
                .unwrap_or(false),
            FilterExpr::Not(inner) => !inner.matches(attributes),
            FilterExpr::And(items) => items.iter().all(|item| item.matches(attributes)),
            FilterExpr::Or(items) => items.iter().any(|item| item.matches(attributes)),
        }
    }
}

impl fmt::Display for FilterExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FilterExpr::Exists { object_type, path } => {
                write!(f, "{}.{}.{}: *", object_type, ATTRIBUTES_SEGMENT, path.join("."))
            }
            FilterExpr::Not(inner) => match inner.as_ref() {
                FilterExpr::And(_) | FilterExpr::Or(_) => write!(f, "not ({inner})"),
                _ => write!(f, "not {inner}"),
            },
            FilterExpr::And(items) => write_joined(f, items, " and ", |e| {
                matches!(e, FilterExpr::Or(_))
            }),
            FilterExpr::Or(items) => write_joined(f, items, " or ", |_| false),
        }
    }
}

fn write_joined(
    f: &mut fmt::Formatter<'_>,
    items: &[FilterExpr],
    sep: &str,
    needs_parens: impl Fn(&FilterExpr) -> bool,
) -> fmt::Result {
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            f.write_str(sep)?;
        }
        if needs_parens(item) {
            write!(f, "({item})")?;
        } else {
            write!(f, "{item}")?;
        }
    }
    Ok(())
}

/// Resolve a dotted path inside a JSON object.
pub fn lookup_path<'a, S: AsRef<str>>(value: &'a Value, path: &[S]) -> Option<&'a Value> {
    path.iter()
        .try_fold(value, |current, segment| current.get(segment.as_ref()))
}

fn invalid(filter: &str, reason: &str) -> StorageError {
    StorageError::InvalidFilter {
        filter: filter.to_string(),
        reason: reason.to_string(),
    }
}

// ============================================================================
// LEXER
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Word(String),
    Colon,
    Star,
    LParen,
    RParen,
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || matches!(c, '_' | '-' | '.' | '@')
}

fn tokenize(input: &str) -> Result<Vec<Token>, StorageError> {
    let mut tokens = Vec::new();
    let mut chars = input.char_indices().peekable();

    while let Some(&(start, c)) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            ':' => {
                chars.next();
                tokens.push(Token::Colon);
            }
            '*' => {
                chars.next();
                tokens.push(Token::Star);
            }
            '(' => {
                chars.next();
                tokens.push(Token::LParen);
            }
            ')' => {
                chars.next();
                tokens.push(Token::RParen);
            }
            c if is_word_char(c) => {
                let mut end = start;
                while let Some(&(idx, c)) = chars.peek() {
                    if !is_word_char(c) {
                        break;
                    }
                    end = idx + c.len_utf8();
                    chars.next();
                }
                tokens.push(Token::Word(input[start..end].to_string()));
            }
            other => {
                return Err(invalid(input, &format!("unexpected character '{other}'")));
            }
        }
    }

    if tokens.is_empty() {
        return Err(invalid(input, "empty filter"));
    }
    Ok(tokens)
}

// ============================================================================
// PARSER
// ============================================================================

struct Parser<'a> {
    input: &'a str,
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser<'_> {
    fn peek_keyword(&self, keyword: &str) -> bool {
        matches!(self.tokens.get(self.pos), Some(Token::Word(w)) if w.eq_ignore_ascii_case(keyword))
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn parse_or(&mut self) -> Result<FilterExpr, StorageError> {
        let mut items = vec![self.parse_and()?];
        while self.peek_keyword("or") {
            self.pos += 1;
            items.push(self.parse_and()?);
        }
        Ok(if items.len() == 1 {
            items.remove(0)
        } else {
            FilterExpr::Or(items)
        })
    }

    fn parse_and(&mut self) -> Result<FilterExpr, StorageError> {
        let mut items = vec![self.parse_unary()?];
        while self.peek_keyword("and") {
            self.pos += 1;
            items.push(self.parse_unary()?);
        }
        Ok(if items.len() == 1 {
            items.remove(0)
        } else {
            FilterExpr::And(items)
        })
    }

    fn parse_unary(&mut self) -> Result<FilterExpr, StorageError> {
        if self.peek_keyword("not") {
            self.pos += 1;
            return Ok(self.parse_unary()?.negate());
        }
        match self.next() {
            Some(Token::LParen) => {
                let expr = self.parse_or()?;
                match self.next() {
                    Some(Token::RParen) => Ok(expr),
                    _ => Err(invalid(self.input, "missing closing parenthesis")),
                }
            }
            Some(Token::Word(field)) => self.parse_predicate(&field),
            _ => Err(invalid(self.input, "expected a field predicate")),
        }
    }

    fn parse_predicate(&mut self, field: &str) -> Result<FilterExpr, StorageError> {
        if self.next() != Some(Token::Colon) {
            return Err(invalid(self.input, &format!("expected ':' after '{field}'")));
        }
        if self.next() != Some(Token::Star) {
            return Err(invalid(
                self.input,
                "only the existence wildcard '*' is supported as a value",
            ));
        }

        let mut segments = field.split('.');
        let object_type = segments.next().unwrap_or_default();
        if object_type.is_empty() || segments.next() != Some(ATTRIBUTES_SEGMENT) {
            return Err(invalid(
                self.input,
                &format!("field '{field}' must look like <type>.attributes.<path>"),
            ));
        }
        let path: Vec<String> = segments.map(str::to_string).collect();
        if path.is_empty() || path.iter().any(String::is_empty) {
            return Err(invalid(
                self.input,
                &format!("field '{field}' has an empty attribute path"),
            ));
        }

        Ok(FilterExpr::Exists {
            object_type: object_type.to_string(),
            path,
        })
    }
}
