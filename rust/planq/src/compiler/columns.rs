use crate::registry::SchemaRegistry;
use crate::safety::{find_comment_marker, find_disallowed_keyword};

const MAX_ALIAS_LEN: usize = 64;

/// Double-quotes a single identifier.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Quotes each dot-separated part of a table key (`schema.table`).
pub fn quote_table(table_key: &str) -> String {
    table_key
        .split('.')
        .map(quote_ident)
        .collect::<Vec<_>>()
        .join(".")
}

/// Identifiers are emitted verbatim inside quotes, so anything the validator
/// would reject in raw text is unusable.
pub fn is_emittable(name: &str) -> bool {
    !name.trim().is_empty()
        && !name.contains(['"', ';'])
        && !name.chars().any(char::is_control)
        && find_comment_marker(name).is_none()
        && find_disallowed_keyword(name).is_none()
}

/// Table key to alias mapping in join order; the primary table is `t0`.
#[derive(Debug, Clone, Default)]
pub struct AliasMap {
    entries: Vec<(String, String)>,
}

impl AliasMap {
    pub fn with_primary(table: &str) -> Self {
        Self {
            entries: vec![(table.to_string(), "t0".to_string())],
        }
    }

    pub fn alias(&self, table: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(key, _)| key == table)
            .map(|(_, alias)| alias.as_str())
    }

    pub fn contains(&self, table: &str) -> bool {
        self.alias(table).is_some()
    }

    /// Assigns the next `tN` alias, or returns the existing one.
    pub fn insert(&mut self, table: &str) -> String {
        if let Some(existing) = self.alias(table) {
            return existing.to_string();
        }
        let alias = format!("t{}", self.entries.len());
        self.entries.push((table.to_string(), alias.clone()));
        alias
    }

    pub fn tables(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(table, _)| table.as_str())
    }

    pub fn primary(&self) -> &str {
        self.entries
            .first()
            .map(|(table, _)| table.as_str())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnRef {
    pub table: String,
    /// Registry spelling of the column; also its output alias.
    pub column: String,
    /// Qualified expression, e.g. `t0."amount"`.
    pub expr: String,
}

/// Resolves `table.column` (table keys may themselves contain dots) or a bare
/// column name against the joined tables. Bare names match
/// case-insensitively, first joined table wins. A qualified reference whose
/// prefix is not a joined table key is not guessed at.
pub fn resolve_column(
    field: &str,
    aliases: &AliasMap,
    registry: &SchemaRegistry,
) -> Option<ColumnRef> {
    let field = field.trim();
    if field.is_empty() {
        return None;
    }

    let candidates: Vec<(&str, &str)> = match field.rsplit_once('.') {
        Some((table, column)) => {
            if !aliases.contains(table) {
                return None;
            }
            vec![(table, column)]
        }
        None => aliases.tables().map(|table| (table, field)).collect(),
    };

    candidates.into_iter().find_map(|(table, column)| {
        let alias = aliases.alias(table)?;
        let name = registry.find_column_ci(table, column)?;
        if !is_emittable(name) {
            return None;
        }
        Some(ColumnRef {
            table: table.to_string(),
            column: name.to_string(),
            expr: format!("{alias}.{}", quote_ident(name)),
        })
    })
}

/// Output alias for a metric: `[A-Za-z0-9 _-]` only, whitespace collapsed,
/// at most 64 characters, `metric` when nothing survives. Words that the
/// validator blocks get a trailing underscore.
pub fn safe_alias(name: &str) -> String {
    let kept: String = name
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, ' ' | '_' | '-'))
        .collect();

    let mut collapsed = String::with_capacity(kept.len());
    for ch in kept.split_whitespace().collect::<Vec<_>>().join(" ").chars() {
        if ch == '-' && collapsed.ends_with('-') {
            continue;
        }
        collapsed.push(ch);
    }

    // Truncation can expose a blocked word ("creates" -> "create"), so guard
    // after cutting and shrink the cut until the guarded form fits.
    let mut limit = MAX_ALIAS_LEN;
    let alias = loop {
        let cut: String = collapsed.chars().take(limit).collect();
        let guarded = guard_words(cut.trim());
        if guarded.len() <= MAX_ALIAS_LEN || limit == 0 {
            break guarded;
        }
        limit = limit.saturating_sub(guarded.len() - MAX_ALIAS_LEN);
    };

    if alias.is_empty() {
        "metric".to_string()
    } else {
        alias
    }
}

fn guard_words(alias: &str) -> String {
    alias
        .split(' ')
        .map(|word| {
            word.split('-')
                .map(|part| {
                    if find_disallowed_keyword(part).is_some() {
                        format!("{part}_")
                    } else {
                        part.to_string()
                    }
                })
                .collect::<Vec<_>>()
                .join("-")
        })
        .collect::<Vec<_>>()
        .join(" ")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Aggregate {
    Sum,
    Avg,
    Min,
    Max,
    Count,
    CountDistinct,
}

impl Aggregate {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "sum" => Some(Aggregate::Sum),
            "avg" | "mean" | "average" => Some(Aggregate::Avg),
            "min" => Some(Aggregate::Min),
            "max" => Some(Aggregate::Max),
            "count" => Some(Aggregate::Count),
            "count_distinct" | "countdistinct" | "distinct_count" => Some(Aggregate::CountDistinct),
            _ => None,
        }
    }

    pub fn needs_field(self) -> bool {
        !matches!(self, Aggregate::Count)
    }

    /// `COUNT` ignores its field and counts rows.
    pub fn render(self, expr: &str) -> String {
        match self {
            Aggregate::Sum => format!("SUM({expr})"),
            Aggregate::Avg => format!("AVG({expr})"),
            Aggregate::Min => format!("MIN({expr})"),
            Aggregate::Max => format!("MAX({expr})"),
            Aggregate::Count => "COUNT(1)".to_string(),
            Aggregate::CountDistinct => format!("COUNT(DISTINCT {expr})"),
        }
    }
}
