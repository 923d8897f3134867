//! Independent SELECT-only gate applied to every statement before execution.
//!
//! The validator does not trust its input: compiled plans, hand-written SQL
//! and edited statements all go through the same rules.

mod tokenizer;

pub use tokenizer::{tokenize, Token, TokenKind};

use serde::{Deserialize, Serialize};
use tracing::debug;

pub const DISALLOWED_KEYWORDS: [&str; 13] = [
    "insert", "update", "delete", "merge", "drop", "alter", "truncate", "create", "exec",
    "execute", "call", "grant", "revoke",
];

const COMMENT_MARKERS: [&str; 3] = ["--", "/*", "*/"];

const UPPERCASE_KEYWORDS: &[&str] = &[
    "all", "and", "as", "asc", "between", "by", "case", "cast", "count", "cross", "desc",
    "distinct", "else", "end", "except", "exists", "false", "fetch", "filter", "first", "from",
    "full", "group", "having", "ilike", "in", "inner", "intersect", "interval", "is", "join",
    "lateral", "left", "like", "limit", "max", "min", "next", "not", "null", "nulls", "offset",
    "on", "only", "or", "order", "outer", "over", "partition", "recursive", "right", "row",
    "rows", "select", "sum", "avg", "then", "top", "true", "union", "using", "when", "where",
    "window", "with",
];

const CLAUSE_KEYWORDS: &[&str] = &[
    "select", "from", "where", "group", "having", "window", "order", "limit", "offset", "fetch",
    "union", "intersect", "except",
];

const JOIN_MODIFIERS: &[&str] = &["inner", "left", "right", "full", "cross", "outer", "natural"];

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SafetyReport {
    pub ok: bool,
    pub reasons: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub normalized_sql: Option<String>,
    pub limit_injected: bool,
    pub max_rows: i64,
}

impl SafetyReport {
    fn reject(reason: String, max_rows: i64) -> Self {
        Self {
            ok: false,
            reasons: vec![reason],
            normalized_sql: None,
            limit_injected: false,
            max_rows,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Validator {
    max_rows: i64,
}

impl Validator {
    pub fn new(max_rows: i64) -> Self {
        Self {
            max_rows: max_rows.max(1),
        }
    }

    pub fn max_rows(&self) -> i64 {
        self.max_rows
    }

    pub fn validate(&self, sql: &str) -> SafetyReport {
        let report = validate(sql, self.max_rows);
        debug!(ok = report.ok, reasons = ?report.reasons, "validated statement");
        report
    }
}

/// Applies the rules in order and stops at the first failure.
pub fn validate(sql: &str, max_rows: i64) -> SafetyReport {
    let trimmed = sql.trim();
    if trimmed.is_empty() {
        return SafetyReport::reject("Empty SQL statement".to_string(), max_rows);
    }

    if let Some(marker) = find_comment_marker(trimmed) {
        return SafetyReport::reject(
            format!("Comments are not allowed (found '{marker}')"),
            max_rows,
        );
    }

    let mut tokens = tokenize(trimmed);

    if let Some(pos) = tokens.iter().position(|t| t.is_punct(";")) {
        if pos + 1 < tokens.len() {
            return SafetyReport::reject(
                "Multiple statements are not allowed".to_string(),
                max_rows,
            );
        }
        tokens.truncate(pos);
    }

    match tokens.first() {
        Some(first) if first.is_word("select") || first.is_word("with") => {}
        Some(first) => {
            let reason = match find_disallowed_keyword(&first.text) {
                Some(keyword) => format!("Disallowed keyword detected: {keyword}"),
                None => format!(
                    "Only SELECT or WITH statements are allowed (found '{}')",
                    first.text
                ),
            };
            return SafetyReport::reject(reason, max_rows);
        }
        None => {
            return SafetyReport::reject("Empty SQL statement".to_string(), max_rows);
        }
    }

    if let Some(keyword) = find_disallowed_keyword(trimmed) {
        return SafetyReport::reject(
            format!("Disallowed keyword detected: {keyword}"),
            max_rows,
        );
    }

    if selects_star(&tokens) {
        return SafetyReport::reject(
            "SELECT * is not allowed; list columns explicitly".to_string(),
            max_rows,
        );
    }

    strip_uncapped_limit(&mut tokens);
    let has_limit = has_row_cap(&tokens);
    let mut normalized = render(&tokens);
    if !has_limit {
        normalized.push_str(&format!("\nLIMIT {max_rows}"));
    }

    SafetyReport {
        ok: true,
        reasons: Vec::new(),
        normalized_sql: Some(normalized),
        limit_injected: !has_limit,
        max_rows,
    }
}

pub fn find_comment_marker(text: &str) -> Option<&'static str> {
    COMMENT_MARKERS
        .iter()
        .copied()
        .find(|marker| text.contains(marker))
}

/// Word-boundary scan over the raw text, including quoted sections.
pub fn find_disallowed_keyword(text: &str) -> Option<&'static str> {
    text.split(|c: char| !c.is_alphanumeric() && c != '_')
        .filter(|word| !word.is_empty())
        .find_map(|word| {
            let lower = word.to_lowercase();
            DISALLOWED_KEYWORDS
                .iter()
                .copied()
                .find(|keyword| *keyword == lower)
        })
}

fn selects_star(tokens: &[Token]) -> bool {
    tokens.iter().enumerate().any(|(idx, token)| {
        if !token.is_word("select") {
            return false;
        }
        let mut rest = tokens[idx + 1..].iter().peekable();
        if rest
            .peek()
            .is_some_and(|t| t.is_word("distinct") || t.is_word("all"))
        {
            rest.next();
        }
        if rest.peek().is_some_and(|t| t.is_word("top")) {
            rest.next();
            if rest.peek().is_some_and(|t| t.is_punct("(")) {
                for t in rest.by_ref() {
                    if t.is_punct(")") {
                        break;
                    }
                }
            } else {
                rest.next();
            }
        }
        rest.peek().is_some_and(|t| t.is_punct("*"))
    })
}

/// `SELECT TOP n`, `SELECT TOP (..)`, `LIMIT n` or `FETCH FIRST|NEXT` at
/// the outermost level. `LIMIT ALL` and words used as names are not caps.
fn has_row_cap(tokens: &[Token]) -> bool {
    tokens.iter().enumerate().any(|(idx, token)| {
        if token.depth != 0 {
            return false;
        }
        let next = tokens.get(idx + 1);
        if token.is_word("top") {
            idx > 0
                && tokens[idx - 1].is_word("select")
                && next.is_some_and(|t| t.kind == TokenKind::Number || t.is_punct("("))
        } else if token.is_word("limit") {
            !used_as_name(tokens, idx) && is_count(next)
        } else if token.is_word("fetch") {
            clause_shaped(tokens, idx)
        } else {
            false
        }
    })
}

/// Drops an outermost `LIMIT ALL` so the ceiling can take its place.
fn strip_uncapped_limit(tokens: &mut Vec<Token>) {
    let found = (0..tokens.len()).find(|&idx| {
        tokens[idx].depth == 0
            && tokens[idx].is_word("limit")
            && !used_as_name(tokens, idx)
            && tokens.get(idx + 1).is_some_and(|t| t.is_word("all"))
    });
    if let Some(idx) = found {
        tokens.drain(idx..idx + 2);
    }
}

fn is_count(token: Option<&Token>) -> bool {
    token.is_some_and(|t| matches!(t.kind, TokenKind::Number | TokenKind::Param))
}

/// Alias after `AS`, or one side of a qualified name.
fn used_as_name(tokens: &[Token], idx: usize) -> bool {
    let after = idx
        .checked_sub(1)
        .is_some_and(|prev| tokens[prev].is_word("as") || tokens[prev].is_punct("."));
    after || tokens.get(idx + 1).is_some_and(|next| next.is_punct("."))
}

/// Row-limiting keywords only open a clause when followed by their operand.
fn clause_shaped(tokens: &[Token], idx: usize) -> bool {
    if used_as_name(tokens, idx) {
        return false;
    }
    let token = &tokens[idx];
    let next = tokens.get(idx + 1);
    if token.is_word("limit") {
        is_count(next) || next.is_some_and(|t| t.is_word("all") || t.is_punct("("))
    } else if token.is_word("offset") {
        is_count(next) || next.is_some_and(|t| t.is_punct("("))
    } else if token.is_word("fetch") {
        next.is_some_and(|t| t.is_word("first") || t.is_word("next"))
    } else {
        true
    }
}

fn is_keyword(token: &Token, set: &[&str]) -> bool {
    token.kind == TokenKind::Word && set.iter().any(|k| token.text.eq_ignore_ascii_case(k))
}

fn starts_clause(tokens: &[Token], idx: usize) -> bool {
    let token = &tokens[idx];
    if token.depth != 0 || idx == 0 || used_as_name(tokens, idx) {
        return false;
    }
    if is_keyword(token, CLAUSE_KEYWORDS) {
        if !clause_shaped(tokens, idx) {
            return false;
        }
        let prev = &tokens[idx - 1];
        // UNION SELECT keeps SELECT on the set-operator line.
        return !(token.is_word("select") && is_keyword(prev, &["union", "all", "intersect", "except"]));
    }
    let next_is_call = tokens.get(idx + 1).is_some_and(|t| t.is_punct("("));
    if next_is_call {
        return false;
    }
    let prev_is_modifier = is_keyword(&tokens[idx - 1], JOIN_MODIFIERS);
    (is_keyword(token, JOIN_MODIFIERS) || token.is_word("join")) && !prev_is_modifier
}

fn render(tokens: &[Token]) -> String {
    let mut out = String::new();
    for (idx, token) in tokens.iter().enumerate() {
        let text = if is_keyword(token, UPPERCASE_KEYWORDS) {
            token.text.to_uppercase()
        } else {
            token.text.clone()
        };

        if idx > 0 {
            if starts_clause(tokens, idx) {
                out.push('\n');
            } else if needs_space(&tokens[idx - 1], token) {
                out.push(' ');
            }
        }
        out.push_str(&text);
    }
    out
}

fn needs_space(prev: &Token, next: &Token) -> bool {
    if prev.kind == TokenKind::Punct && matches!(prev.text.as_str(), "(" | "." | "::") {
        return false;
    }
    if next.kind == TokenKind::Punct && matches!(next.text.as_str(), "," | ")" | "." | "::") {
        return false;
    }
    if next.is_punct("(") && matches!(prev.kind, TokenKind::Word | TokenKind::QuotedIdent) {
        return is_keyword(prev, UPPERCASE_KEYWORDS)
            && !is_keyword(prev, &["count", "sum", "avg", "min", "max", "cast", "exists", "left", "right"]);
    }
    true
}
