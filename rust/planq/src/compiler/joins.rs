use super::columns::{quote_ident, quote_table, AliasMap};
use crate::models::Join;
use crate::registry::SchemaRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JoinKind {
    Inner,
    Left,
    Right,
    Full,
}

impl JoinKind {
    fn parse(raw: &str) -> Option<Self> {
        let normalized = raw.trim().to_ascii_uppercase();
        let normalized = normalized
            .strip_suffix(" JOIN")
            .unwrap_or(&normalized)
            .trim();
        let normalized = normalized.strip_suffix(" OUTER").unwrap_or(normalized);
        match normalized {
            "INNER" => Some(JoinKind::Inner),
            "LEFT" => Some(JoinKind::Left),
            "RIGHT" => Some(JoinKind::Right),
            "FULL" => Some(JoinKind::Full),
            _ => None,
        }
    }

    /// The same join seen from the other side.
    fn mirrored(self) -> Self {
        match self {
            JoinKind::Left => JoinKind::Right,
            JoinKind::Right => JoinKind::Left,
            other => other,
        }
    }

    fn as_sql(self) -> &'static str {
        match self {
            JoinKind::Inner => "INNER JOIN",
            JoinKind::Left => "LEFT JOIN",
            JoinKind::Right => "RIGHT JOIN",
            JoinKind::Full => "FULL JOIN",
        }
    }
}

struct Candidate {
    left_table: String,
    right_table: String,
    left_key: String,
    right_key: String,
    kind: JoinKind,
}

impl Candidate {
    fn label(&self) -> String {
        format!(
            "{}.{} = {}.{}",
            self.left_table, self.left_key, self.right_table, self.right_key
        )
    }
}

/// Builds the FROM graph rooted at `primary`. Each emitted join attaches
/// exactly one new table to the tables already joined; joins are retried until
/// no more progress is possible.
pub(super) fn build_join_graph(
    primary: &str,
    resolved: &[String],
    joins: &[Join],
    registry: &SchemaRegistry,
    diagnostics: &mut Vec<String>,
) -> (AliasMap, Vec<String>) {
    let mut aliases = AliasMap::with_primary(primary);
    let mut clauses = Vec::new();
    let mut pending = Vec::new();

    for join in joins {
        let label = format!(
            "{}.{} = {}.{}",
            join.left_table, join.left_key, join.right_table, join.right_key
        );
        if !resolved.contains(&join.left_table) || !resolved.contains(&join.right_table) {
            diagnostics.push(format!("dropped join {label}: table not in the resolved set"));
            continue;
        }
        if join.left_table == join.right_table {
            diagnostics.push(format!("dropped join {label}: self joins are not supported"));
            continue;
        }
        let (Some(left_key), Some(right_key)) = (
            registry.find_column_ci(&join.left_table, &join.left_key),
            registry.find_column_ci(&join.right_table, &join.right_key),
        ) else {
            diagnostics.push(format!("dropped join {label}: join column not in registry"));
            continue;
        };
        if !super::columns::is_emittable(left_key) || !super::columns::is_emittable(right_key) {
            diagnostics.push(format!("dropped join {label}: join column name is not usable"));
            continue;
        }
        let kind = JoinKind::parse(&join.join_type).unwrap_or_else(|| {
            diagnostics.push(format!(
                "join {label}: unknown join type '{}', using LEFT",
                join.join_type
            ));
            JoinKind::Left
        });
        pending.push(Candidate {
            left_table: join.left_table.clone(),
            right_table: join.right_table.clone(),
            left_key: left_key.to_string(),
            right_key: right_key.to_string(),
            kind,
        });
    }

    loop {
        let before = pending.len();
        pending.retain(|candidate| {
            let left_in = aliases.contains(&candidate.left_table);
            let right_in = aliases.contains(&candidate.right_table);
            match (left_in, right_in) {
                (true, true) => {
                    diagnostics.push(format!(
                        "dropped join {}: both tables are already joined",
                        candidate.label()
                    ));
                    false
                }
                (true, false) => {
                    let left_alias = aliases.alias(&candidate.left_table).unwrap_or("t0").to_string();
                    let right_alias = aliases.insert(&candidate.right_table);
                    clauses.push(format!(
                        "{} {} AS {right_alias} ON {left_alias}.{} = {right_alias}.{}",
                        candidate.kind.as_sql(),
                        quote_table(&candidate.right_table),
                        quote_ident(&candidate.left_key),
                        quote_ident(&candidate.right_key),
                    ));
                    false
                }
                (false, true) => {
                    let right_alias = aliases.alias(&candidate.right_table).unwrap_or("t0").to_string();
                    let left_alias = aliases.insert(&candidate.left_table);
                    clauses.push(format!(
                        "{} {} AS {left_alias} ON {left_alias}.{} = {right_alias}.{}",
                        candidate.kind.mirrored().as_sql(),
                        quote_table(&candidate.left_table),
                        quote_ident(&candidate.left_key),
                        quote_ident(&candidate.right_key),
                    ));
                    false
                }
                (false, false) => true,
            }
        });
        if pending.is_empty() || pending.len() == before {
            break;
        }
    }

    for candidate in pending {
        diagnostics.push(format!(
            "dropped join {}: not connected to {primary}",
            candidate.label()
        ));
    }

    for table in resolved {
        if !aliases.contains(table) {
            diagnostics.push(format!("table {table} is not connected by any join; ignored"));
        }
    }

    (aliases, clauses)
}
