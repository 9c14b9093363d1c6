//! Neutral predicate IR for the query surface.
//!
//! Conditions are composed into a tree and rendered to SQL with `?N`
//! positional placeholders numbered from a caller-supplied offset. Rendering
//! is pure: it returns the SQL text, the ordered parameter list and the next
//! free offset, so several subconditions can be chained in one statement
//! with monotonically increasing parameter indices.

use chrono::{DateTime, Utc};
use rusqlite::types::ToSqlOutput;
use rusqlite::ToSql;
use tokenkeep_core::types::token::{QueryTokenDetailsParams, TokenId};

/// A positional query parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum Param {
    Text(String),
    Int(i64),
    Bool(bool),
    Bytes(Vec<u8>),
    Timestamp(DateTime<Utc>),
}

impl ToSql for Param {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        match self {
            Param::Text(s) => s.to_sql(),
            Param::Int(i) => i.to_sql(),
            Param::Bool(b) => b.to_sql(),
            Param::Bytes(b) => b.to_sql(),
            Param::Timestamp(t) => t.to_sql(),
        }
    }
}

/// Result of rendering a condition tree.
#[derive(Debug, Clone)]
pub struct Rendered {
    pub sql: String,
    pub params: Vec<Param>,
    pub next_offset: usize,
}

/// Predicate tree. `And([])` renders to nothing, which callers turn into
/// an absent WHERE clause.
#[derive(Debug, Clone)]
pub enum Cond {
    /// A literal fragment with no parameters, e.g. `owner = true`.
    Const(String),
    /// `column = ?N`
    Eq { column: String, value: Param },
    /// `column >= ?N`
    Ge { column: String, value: Param },
    /// `column <= ?N`
    Le { column: String, value: Param },
    /// `column IN (?N, ...)`
    In { column: String, values: Vec<Param> },
    /// `(tx_col, idx_col) ∈ ids`, expanded to an OR-chain of pair matches.
    HasTokens {
        tx_col: String,
        idx_col: String,
        ids: Vec<TokenId>,
    },
    /// Row-value comparison `(c1, c2, ...) > (?N, ...)`, used by keyset
    /// pagination.
    RowGt {
        columns: Vec<String>,
        values: Vec<Param>,
    },
    And(Vec<Cond>),
    Or(Vec<Cond>),
}

impl Cond {
    /// Render the tree with placeholders numbered from `offset`.
    pub fn render(&self, offset: usize) -> Rendered {
        match self {
            Cond::Const(sql) => Rendered {
                sql: sql.clone(),
                params: Vec::new(),
                next_offset: offset,
            },
            Cond::Eq { column, value } => Rendered {
                sql: format!("{column} = ?{offset}"),
                params: vec![value.clone()],
                next_offset: offset + 1,
            },
            Cond::Ge { column, value } => Rendered {
                sql: format!("{column} >= ?{offset}"),
                params: vec![value.clone()],
                next_offset: offset + 1,
            },
            Cond::Le { column, value } => Rendered {
                sql: format!("{column} <= ?{offset}"),
                params: vec![value.clone()],
                next_offset: offset + 1,
            },
            Cond::In { column, values } => {
                if values.is_empty() {
                    return Rendered {
                        sql: String::new(),
                        params: Vec::new(),
                        next_offset: offset,
                    };
                }
                let placeholders: Vec<String> = (0..values.len())
                    .map(|i| format!("?{}", offset + i))
                    .collect();
                Rendered {
                    sql: format!("{column} IN ({})", placeholders.join(", ")),
                    params: values.clone(),
                    next_offset: offset + values.len(),
                }
            }
            Cond::HasTokens {
                tx_col,
                idx_col,
                ids,
            } => {
                if ids.is_empty() {
                    return Rendered {
                        sql: String::new(),
                        params: Vec::new(),
                        next_offset: offset,
                    };
                }
                let mut parts = Vec::with_capacity(ids.len());
                let mut params = Vec::with_capacity(ids.len() * 2);
                let mut next = offset;
                for id in ids {
                    parts.push(format!("({tx_col} = ?{} AND {idx_col} = ?{})", next, next + 1));
                    params.push(Param::Text(id.tx_id.clone()));
                    params.push(Param::Int(id.index as i64));
                    next += 2;
                }
                Rendered {
                    sql: parts.join(" OR "),
                    params,
                    next_offset: next,
                }
            }
            Cond::RowGt { columns, values } => {
                let placeholders: Vec<String> = (0..values.len())
                    .map(|i| format!("?{}", offset + i))
                    .collect();
                Rendered {
                    sql: format!(
                        "({}) > ({})",
                        columns.join(", "),
                        placeholders.join(", ")
                    ),
                    params: values.clone(),
                    next_offset: offset + values.len(),
                }
            }
            Cond::And(children) => Self::render_junction(children, " AND ", offset),
            Cond::Or(children) => Self::render_junction(children, " OR ", offset),
        }
    }

    fn render_junction(children: &[Cond], sep: &str, offset: usize) -> Rendered {
        let mut parts = Vec::with_capacity(children.len());
        let mut params = Vec::new();
        let mut next = offset;
        for child in children {
            let rendered = child.render(next);
            if rendered.sql.is_empty() {
                continue;
            }
            parts.push(format!("({})", rendered.sql));
            params.extend(rendered.params);
            next = rendered.next_offset;
        }
        Rendered {
            sql: parts.join(sep),
            params,
            next_offset: next,
        }
    }
}

/// Render a condition into a full `WHERE ...` clause, or an empty string
/// when the condition filters nothing.
pub fn where_clause(cond: &Cond, offset: usize) -> Rendered {
    let rendered = cond.render(offset);
    Rendered {
        sql: if rendered.sql.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", rendered.sql)
        },
        params: rendered.params,
        next_offset: rendered.next_offset,
    }
}

/// Condition factory bound to a concrete (tokens, ownership) table pair.
#[derive(Debug, Clone)]
pub struct Conditions {
    tokens: String,
    ownership: String,
}

impl Conditions {
    pub fn new(tokens: impl Into<String>, ownership: impl Into<String>) -> Self {
        Self {
            tokens: tokens.into(),
            ownership: ownership.into(),
        }
    }

    pub fn has_tokens(&self, tx_col: &str, idx_col: &str, ids: &[TokenId]) -> Cond {
        Cond::HasTokens {
            tx_col: tx_col.to_string(),
            idx_col: idx_col.to_string(),
            ids: ids.to_vec(),
        }
    }

    /// The cumulative detail filter. With `joined` the predicate assumes the
    /// token ⨝ ownership join and qualifies columns with table names; a
    /// wallet filter then matches the token's own wallet id or any
    /// ownership row. Without it, only the token row is consulted.
    pub fn has_token_details(&self, params: &QueryTokenDetailsParams, joined: bool) -> Cond {
        let qual = |col: &str| {
            if joined {
                format!("{}.{col}", self.tokens)
            } else {
                col.to_string()
            }
        };

        let mut children = Vec::new();
        if !params.ids.is_empty() {
            children.push(self.has_tokens(&qual("tx_id"), &qual("idx"), &params.ids));
        }
        if !params.wallet_id.is_empty() {
            if joined {
                children.push(Cond::Or(vec![
                    Cond::Eq {
                        column: qual("owner_wallet_id"),
                        value: Param::Text(params.wallet_id.clone()),
                    },
                    Cond::Eq {
                        column: format!("{}.wallet_id", self.ownership),
                        value: Param::Text(params.wallet_id.clone()),
                    },
                ]));
            } else {
                children.push(Cond::Eq {
                    column: "owner_wallet_id".to_string(),
                    value: Param::Text(params.wallet_id.clone()),
                });
            }
        }
        if joined && !params.enrollment_id.is_empty() {
            children.push(Cond::Eq {
                column: format!("{}.wallet_id", self.ownership),
                value: Param::Text(params.enrollment_id.clone()),
            });
        }
        if !params.token_type.is_empty() {
            children.push(Cond::Eq {
                column: qual("token_type"),
                value: Param::Text(params.token_type.clone()),
            });
        }
        if !params.include_deleted {
            children.push(Cond::Const(format!("{} = false", qual("is_deleted"))));
        }
        Cond::And(children)
    }

    pub fn and(&self, children: Vec<Cond>) -> Cond {
        Cond::And(children)
    }
}
