//! Recursive-descent parser for filter queries.
//!
//! ```text
//! query   := or
//! or      := and ( OR and )*
//! and     := unary ( AND unary )*
//! unary   := NOT unary | primary
//! primary := '(' query ')' | atom
//! ```

use globset::{Glob, GlobBuilder};

use super::FilterError;
use super::ast::{CompareOp, Expr, Predicate};
use super::coerce::{parse_size, parse_time};

#[derive(Debug, Clone, PartialEq, Eq)]
enum TokenKind {
    LParen,
    RParen,
    And,
    Or,
    Not,
    Word(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Token {
    kind: TokenKind,
    /// Byte offset into the query.
    position: usize,
}

fn error(position: usize, message: impl Into<String>) -> FilterError {
    FilterError::Validation {
        position,
        message: message.into(),
    }
}

fn tokenize(input: &str) -> Result<Vec<Token>, FilterError> {
    let mut tokens = Vec::new();
    let mut chars = input.char_indices().peekable();
    while let Some(&(start, c)) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
            continue;
        }
        if c == '(' || c == ')' {
            chars.next();
            tokens.push(Token {
                kind: if c == '(' {
                    TokenKind::LParen
                } else {
                    TokenKind::RParen
                },
                position: start,
            });
            continue;
        }

        let mut word = String::new();
        while let Some(&(offset, c)) = chars.peek() {
            if c.is_whitespace() || c == '(' || c == ')' {
                break;
            }
            chars.next();
            word.push(c);
            if c == '"' {
                let mut closed = false;
                while let Some((_, c)) = chars.next() {
                    word.push(c);
                    if c == '\\' {
                        if let Some((_, escaped)) = chars.next() {
                            word.push(escaped);
                        }
                    } else if c == '"' {
                        closed = true;
                        break;
                    }
                }
                if !closed {
                    return Err(error(offset, "unterminated quoted value"));
                }
            }
        }

        let kind = if word.eq_ignore_ascii_case("and") {
            TokenKind::And
        } else if word.eq_ignore_ascii_case("or") {
            TokenKind::Or
        } else if word.eq_ignore_ascii_case("not") {
            TokenKind::Not
        } else {
            TokenKind::Word(word)
        };
        tokens.push(Token {
            kind,
            position: start,
        });
    }
    Ok(tokens)
}

/// Bound on both parser recursion and syntax-tree height. Evaluation walks
/// the tree recursively, so an unbounded query could exhaust the stack.
const MAX_DEPTH: usize = 256;

struct Parser {
    tokens: Vec<Token>,
    index: usize,
    end: usize,
    nesting: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.index)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.index).cloned();
        self.index += 1;
        token
    }

    fn grow(height: usize, position: usize) -> Result<usize, FilterError> {
        if height >= MAX_DEPTH {
            return Err(error(position, "query nests too deeply"));
        }
        Ok(height + 1)
    }

    fn enter(&mut self, position: usize) -> Result<(), FilterError> {
        if self.nesting >= MAX_DEPTH {
            return Err(error(position, "query nests too deeply"));
        }
        self.nesting += 1;
        Ok(())
    }

    // Each parse step returns the expression with its tree height.
    fn parse_or(&mut self) -> Result<(Expr, usize), FilterError> {
        let (mut left, mut height) = self.parse_and()?;
        while let Some(Token {
            kind: TokenKind::Or,
            position,
        }) = self.peek().cloned()
        {
            self.next();
            let (right, right_height) = self.parse_and()?;
            height = Self::grow(height.max(right_height), position)?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok((left, height))
    }

    fn parse_and(&mut self) -> Result<(Expr, usize), FilterError> {
        let (mut left, mut height) = self.parse_unary()?;
        while let Some(Token {
            kind: TokenKind::And,
            position,
        }) = self.peek().cloned()
        {
            self.next();
            let (right, right_height) = self.parse_unary()?;
            height = Self::grow(height.max(right_height), position)?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok((left, height))
    }

    fn parse_unary(&mut self) -> Result<(Expr, usize), FilterError> {
        if let Some(Token {
            kind: TokenKind::Not,
            position,
        }) = self.peek().cloned()
        {
            self.next();
            self.enter(position)?;
            let (inner, height) = self.parse_unary()?;
            self.nesting -= 1;
            return Ok((Expr::Not(Box::new(inner)), Self::grow(height, position)?));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<(Expr, usize), FilterError> {
        let Some(token) = self.next() else {
            return Err(error(self.end, "unexpected end of query"));
        };
        match token.kind {
            TokenKind::LParen => {
                self.enter(token.position)?;
                let inner = self.parse_or()?;
                self.nesting -= 1;
                match self.next() {
                    Some(Token {
                        kind: TokenKind::RParen,
                        ..
                    }) => Ok(inner),
                    Some(other) => Err(error(other.position, "expected ')'")),
                    None => Err(error(token.position, "unmatched '('")),
                }
            }
            TokenKind::Word(word) => Ok((Expr::Atom(parse_atom(&word, token.position)?), 1)),
            TokenKind::RParen => Err(error(token.position, "unexpected ')'")),
            TokenKind::And | TokenKind::Or => Err(error(
                token.position,
                "operator is missing its left operand",
            )),
            TokenKind::Not => Err(error(token.position, "unexpected NOT")),
        }
    }
}

/// Parses a query into its syntax tree.
pub fn parse(query: &str) -> Result<Expr, FilterError> {
    let tokens = tokenize(query)?;
    if tokens.is_empty() {
        return Err(error(0, "query is empty"));
    }
    let mut parser = Parser {
        tokens,
        index: 0,
        end: query.len(),
        nesting: 0,
    };
    let (expr, _) = parser.parse_or()?;
    if let Some(token) = parser.peek() {
        let message = match token.kind {
            TokenKind::RParen => "unmatched ')'",
            _ => "expected AND or OR between predicates",
        };
        return Err(error(token.position, message));
    }
    Ok(expr)
}

const FIELDS: &[&str] = &["tag", "mime_type", "size", "modified_time", "path", "backend"];

fn parse_atom(word: &str, position: usize) -> Result<Predicate, FilterError> {
    let name_len = word
        .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
        .unwrap_or(word.len());
    let field = word[..name_len].to_ascii_lowercase();
    let rest = &word[name_len..];
    if rest.is_empty() {
        return Err(error(position, format!("expected a predicate, found '{word}'")));
    }
    if !FIELDS.contains(&field.as_str()) {
        return Err(error(position, format!("unknown field '{}'", &word[..name_len])));
    }
    let value_position = position + name_len;

    match field.as_str() {
        "tag" => {
            let body = rest
                .strip_prefix(':')
                .ok_or_else(|| error(value_position, "expected ':' after tag"))?;
            let split = body
                .find(['=', '<', '>'])
                .ok_or_else(|| error(value_position + 1, "tag predicate needs an operator"))?;
            let key = unquote(&body[..split], value_position + 1)?;
            if key.is_empty() {
                return Err(error(value_position + 1, "tag key is empty"));
            }
            let (op, value) = split_operator(&body[split..], value_position + 1 + split)?;
            let value = unquote(value, value_position + 1 + split)?;
            Ok(Predicate::Tag { key, op, value })
        }
        "mime_type" | "path" => {
            let body = rest
                .strip_prefix(':')
                .ok_or_else(|| error(value_position, format!("expected ':' after {field}")))?;
            let pattern = unquote(body, value_position + 1)?;
            let glob = compile_glob(&pattern, value_position + 1)?;
            Ok(if field == "path" {
                Predicate::Path(glob)
            } else {
                Predicate::MimeType(glob)
            })
        }
        "backend" => {
            let body = rest
                .strip_prefix(':')
                .ok_or_else(|| error(value_position, "expected ':' after backend"))?;
            let id = unquote(body, value_position + 1)?;
            if id.is_empty() {
                return Err(error(value_position + 1, "backend id is empty"));
            }
            Ok(Predicate::Backend(id))
        }
        "size" => {
            let (op, literal) = field_operator(rest, value_position)?;
            let bytes = parse_size(&unquote(literal, value_position)?)
                .ok_or_else(|| error(value_position, format!("invalid size '{literal}'")))?;
            Ok(Predicate::Size { op, bytes })
        }
        _ => {
            let (op, literal) = field_operator(rest, value_position)?;
            let at = parse_time(&unquote(literal, value_position)?)
                .ok_or_else(|| error(value_position, format!("invalid time '{literal}'")))?;
            Ok(Predicate::Modified { op, at })
        }
    }
}

/// `size>10MB`, or `size:>10MB` / `size:10MB` (equality).
fn field_operator(rest: &str, position: usize) -> Result<(CompareOp, &str), FilterError> {
    match rest.strip_prefix(':') {
        Some(body) if body.starts_with(['=', '<', '>']) => split_operator(body, position + 1),
        Some(body) => Ok((CompareOp::Eq, body)),
        None => split_operator(rest, position),
    }
}

fn split_operator(text: &str, position: usize) -> Result<(CompareOp, &str), FilterError> {
    let (op, len) = if text.starts_with(">=") {
        (CompareOp::Ge, 2)
    } else if text.starts_with("<=") {
        (CompareOp::Le, 2)
    } else if text.starts_with('=') {
        (CompareOp::Eq, 1)
    } else if text.starts_with('>') {
        (CompareOp::Gt, 1)
    } else if text.starts_with('<') {
        (CompareOp::Lt, 1)
    } else {
        return Err(error(position, "expected one of = > < >= <="));
    };
    let value = &text[len..];
    if value.is_empty() {
        return Err(error(position + len, "missing value after operator"));
    }
    Ok((op, value))
}

/// Strips surrounding double quotes and resolves `\"` and `\\` escapes.
fn unquote(text: &str, position: usize) -> Result<String, FilterError> {
    let Some(inner) = text.strip_prefix('"') else {
        if text.contains('"') {
            return Err(error(position, "quotes must surround the whole value"));
        }
        return Ok(text.to_string());
    };
    let inner = inner
        .strip_suffix('"')
        .ok_or_else(|| error(position, "unterminated quoted value"))?;
    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(escaped) = chars.next() {
                out.push(escaped);
            }
        } else {
            out.push(c);
        }
    }
    Ok(out)
}

fn compile_glob(pattern: &str, position: usize) -> Result<Glob, FilterError> {
    if pattern.is_empty() {
        return Err(error(position, "glob pattern is empty"));
    }
    GlobBuilder::new(pattern)
        .literal_separator(false)
        .build()
        .map_err(|err| error(position, format!("invalid glob: {}", err.kind())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::ast::TimeSpec;

    fn tag(key: &str, op: CompareOp, value: &str) -> Expr {
        Expr::Atom(Predicate::Tag {
            key: key.into(),
            op,
            value: value.into(),
        })
    }

    fn position_of(query: &str) -> usize {
        match parse(query) {
            Err(FilterError::Validation { position, .. }) => position,
            other => panic!("expected a validation error, got {other:?}"),
        }
    }

    #[test]
    fn and_binds_tighter_than_or() {
        let expr = parse("tag:a=1 OR tag:b=2 AND tag:c=3").unwrap();
        assert_eq!(
            expr,
            Expr::Or(
                Box::new(tag("a", CompareOp::Eq, "1")),
                Box::new(Expr::And(
                    Box::new(tag("b", CompareOp::Eq, "2")),
                    Box::new(tag("c", CompareOp::Eq, "3")),
                )),
            )
        );
    }

    #[test]
    fn not_binds_tightest_and_parens_group() {
        let expr = parse("not tag:a=1 and (tag:b=2 or tag:c=3)").unwrap();
        assert_eq!(
            expr,
            Expr::And(
                Box::new(Expr::Not(Box::new(tag("a", CompareOp::Eq, "1")))),
                Box::new(Expr::Or(
                    Box::new(tag("b", CompareOp::Eq, "2")),
                    Box::new(tag("c", CompareOp::Eq, "3")),
                )),
            )
        );
    }

    #[test]
    fn parses_every_atom_kind() {
        assert_eq!(parse("tag:rating>=4").unwrap(), tag("rating", CompareOp::Ge, "4"));
        assert_eq!(
            parse("tag:title=\"summer (2024) trip\"").unwrap(),
            tag("title", CompareOp::Eq, "summer (2024) trip")
        );
        assert_eq!(
            parse("size>10MB").unwrap(),
            Expr::Atom(Predicate::Size {
                op: CompareOp::Gt,
                bytes: 10_000_000
            })
        );
        assert_eq!(
            parse("size:2K").unwrap(),
            Expr::Atom(Predicate::Size {
                op: CompareOp::Eq,
                bytes: 2048
            })
        );
        assert_eq!(
            parse("modified_time>now-7d").unwrap(),
            Expr::Atom(Predicate::Modified {
                op: CompareOp::Gt,
                at: TimeSpec::Relative(-604_800)
            })
        );
        assert!(matches!(
            parse("mime_type:image/*").unwrap(),
            Expr::Atom(Predicate::MimeType(_))
        ));
        assert!(matches!(
            parse("path:photos/**/*.jpg").unwrap(),
            Expr::Atom(Predicate::Path(_))
        ));
        assert_eq!(
            parse("backend:selfhosted").unwrap(),
            Expr::Atom(Predicate::Backend("selfhosted".into()))
        );
    }

    #[test]
    fn reports_offending_positions() {
        assert_eq!(position_of("tag:a=1 AND colour:red"), 12);
        assert_eq!(position_of("tag:a=1 tag:b=2"), 8);
        assert_eq!(position_of("(tag:a=1"), 0);
        assert_eq!(position_of("tag:a=1)"), 7);
        assert_eq!(position_of("tag:a=1 AND"), 11);
        assert_eq!(position_of("OR tag:a=1"), 0);
        assert_eq!(position_of("size>lots"), 4);
        assert_eq!(position_of("tag:a=\"open"), 6);
        assert_eq!(position_of(""), 0);
    }

    #[test]
    fn rejects_malformed_atoms() {
        for query in ["tag:=1", "tag:a", "tag:a=", "path:", "backend:", "size", "bare"] {
            assert!(
                matches!(parse(query), Err(FilterError::Validation { .. })),
                "{query} accepted"
            );
        }
    }

    #[test]
    fn deep_nesting_is_a_validation_error() {
        let parens = format!("{}tag:a=1{}", "(".repeat(10_000), ")".repeat(10_000));
        assert!(matches!(
            parse(&parens),
            Err(FilterError::Validation { position, ref message })
                if position == MAX_DEPTH && message.contains("too deeply")
        ));

        let negations = format!("{}tag:a=1", "NOT ".repeat(200_000));
        assert!(matches!(parse(&negations), Err(FilterError::Validation { .. })));

        let chain = vec!["tag:a=1"; 50_000].join(" AND ");
        assert!(matches!(parse(&chain), Err(FilterError::Validation { .. })));

        let shallow = format!("{}tag:a=1{}", "(".repeat(100), ")".repeat(100));
        assert_eq!(parse(&shallow).unwrap(), tag("a", CompareOp::Eq, "1"));
        let negated = format!("{}tag:a=1", "NOT ".repeat(100));
        assert!(matches!(parse(&negated).unwrap(), Expr::Not(_)));
    }

    #[test]
    fn keywords_are_case_insensitive() {
        assert_eq!(
            parse("tag:a=1 Or tag:b=2").unwrap(),
            parse("tag:a=1 OR tag:b=2").unwrap()
        );
    }
}
