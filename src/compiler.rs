use crate::errors::{Result, SandboxError};
use crate::plan::{AggregateFunc, Literal, Predicate, QueryPlan, SelectItem};
use serde::{Deserialize, Serialize};

/// A single SQL statement plus the plan it came from, if any
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CompiledQuery {
    pub sql: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_plan: Option<QueryPlan>,
}

impl CompiledQuery {
    /// Wrap caller-supplied SQL; it still has to pass the statement policy.
    pub fn raw(sql: &str) -> Self {
        Self {
            sql: sql.to_string(),
            source_plan: None,
        }
    }
}

/// Compile a plan into one `SELECT` statement.
///
/// Pure and deterministic: the same plan always yields byte-identical SQL.
/// Schema problems are the plan validator's job; this only rejects constructs
/// that have no SQL rendering.
pub fn compile(plan: &QueryPlan) -> Result<CompiledQuery> {
    if plan.select.is_empty() {
        return Err(SandboxError::Compile("empty selection".to_string()));
    }

    let mut sql = String::from("SELECT ");
    let items = plan
        .select
        .iter()
        .map(compile_select_item)
        .collect::<Result<Vec<_>>>()?;
    sql.push_str(&items.join(", "));

    sql.push_str(" FROM ");
    sql.push_str(&quote_ident(&plan.table));

    if let Some(filter) = &plan.filter {
        sql.push_str(" WHERE ");
        sql.push_str(&compile_predicate(filter)?);
    }

    if !plan.group_by.is_empty() {
        let keys: Vec<String> = plan.group_by.iter().map(|k| quote_ident(k)).collect();
        sql.push_str(" GROUP BY ");
        sql.push_str(&keys.join(", "));
    }

    if !plan.order_by.is_empty() {
        let keys: Vec<String> = plan
            .order_by
            .iter()
            .map(|o| {
                format!(
                    "{} {}",
                    quote_ident(&o.column),
                    if o.descending { "DESC" } else { "ASC" }
                )
            })
            .collect();
        sql.push_str(" ORDER BY ");
        sql.push_str(&keys.join(", "));
    }

    if let Some(limit) = plan.limit {
        sql.push_str(&format!(" LIMIT {}", limit));
    }

    Ok(CompiledQuery {
        sql,
        source_plan: Some(plan.clone()),
    })
}

/// Double-quote an identifier, doubling embedded quotes.
pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Single-quote a string literal, doubling embedded quotes.
pub fn quote_str(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

fn compile_select_item(item: &SelectItem) -> Result<String> {
    let (expr, alias) = match item {
        SelectItem::Column { column, alias } => (quote_ident(column), alias),
        SelectItem::Aggregate {
            func,
            column,
            alias,
        } => {
            let arg = match (func, column) {
                (_, Some(column)) => quote_ident(column),
                (AggregateFunc::Count, None) => "*".to_string(),
                (other, None) => {
                    return Err(SandboxError::Compile(format!(
                        "{}(*) is not supported",
                        other.sql_name()
                    )))
                }
            };
            (format!("{}({})", func.sql_name(), arg), alias)
        }
    };
    Ok(match alias {
        Some(alias) => format!("{} AS {}", expr, quote_ident(alias)),
        None => expr,
    })
}

fn compile_predicate(predicate: &Predicate) -> Result<String> {
    match predicate {
        Predicate::Compare { column, cmp, value } => Ok(format!(
            "{} {} {}",
            quote_ident(column),
            cmp.sql(),
            compile_literal(value)?
        )),
        Predicate::IsNull { column } => Ok(format!("{} IS NULL", quote_ident(column))),
        Predicate::IsNotNull { column } => Ok(format!("{} IS NOT NULL", quote_ident(column))),
        Predicate::And { all } => compile_junction(all, "AND"),
        Predicate::Or { any } => compile_junction(any, "OR"),
        Predicate::Not { inner } => Ok(format!("NOT ({})", compile_predicate(inner)?)),
    }
}

fn compile_junction(parts: &[Predicate], joiner: &str) -> Result<String> {
    if parts.is_empty() {
        return Err(SandboxError::Compile(format!("empty {} combinator", joiner)));
    }
    let compiled = parts
        .iter()
        .map(|p| compile_predicate(p).map(|s| format!("({})", s)))
        .collect::<Result<Vec<_>>>()?;
    Ok(compiled.join(&format!(" {} ", joiner)))
}

fn compile_literal(value: &Literal) -> Result<String> {
    match value {
        Literal::Null => Err(SandboxError::Compile(
            "comparison against NULL; use is_null / is_not_null".to_string(),
        )),
        Literal::Bool(b) => Ok(if *b { "TRUE" } else { "FALSE" }.to_string()),
        Literal::Int(i) => Ok(i.to_string()),
        Literal::Float(f) if f.is_finite() => Ok(format!("{:?}", f)),
        Literal::Float(f) => Err(SandboxError::Compile(format!(
            "non-finite float literal {}",
            f
        ))),
        Literal::Text(s) => Ok(quote_str(s)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::SqlPolicy;
    use crate::plan::CompareOp;

    fn priority_report() -> QueryPlan {
        QueryPlan::new("tickets")
            .column("priority")
            .aggregate(AggregateFunc::Count, None, "n")
            .aggregate(AggregateFunc::Avg, Some("resolution_hours"), "avg_hours")
            .filter(Predicate::Or {
                any: vec![
                    Predicate::compare("status", CompareOp::Eq, Literal::Text("open".into())),
                    Predicate::compare("resolution_hours", CompareOp::Ge, Literal::Float(2.5)),
                ],
            })
            .group_by("priority")
            .order_by("n", true)
            .limit(20)
    }

    #[test]
    fn test_compiles_full_plan() {
        let compiled = compile(&priority_report()).unwrap();
        assert_eq!(
            compiled.sql,
            "SELECT \"priority\", COUNT(*) AS \"n\", AVG(\"resolution_hours\") AS \"avg_hours\" \
             FROM \"tickets\" WHERE (\"status\" = 'open') OR (\"resolution_hours\" >= 2.5) \
             GROUP BY \"priority\" ORDER BY \"n\" DESC LIMIT 20"
        );
        assert_eq!(compiled.source_plan, Some(priority_report()));
    }

    #[test]
    fn test_compile_is_deterministic() {
        let plan = priority_report();
        let first = compile(&plan).unwrap().sql;
        for _ in 0..10 {
            assert_eq!(compile(&plan).unwrap().sql, first);
        }
    }

    #[test]
    fn test_hostile_names_stay_inside_quotes() {
        let plan = QueryPlan::new("tickets")
            .column("a\"; DROP TABLE tickets; --")
            .filter(Predicate::compare(
                "priority",
                CompareOp::Eq,
                Literal::Text("x'; DELETE FROM tickets; --".into()),
            ));
        let sql = compile(&plan).unwrap().sql;
        assert!(sql.starts_with("SELECT \"a\"\"; DROP"));
        assert!(sql.contains("'x''; DELETE FROM tickets; --'"));
    }

    #[test]
    fn test_compiled_sql_passes_statement_policy() {
        let policy = SqlPolicy::default();
        let plans = vec![
            priority_report(),
            QueryPlan::new("tickets").aggregate(AggregateFunc::Count, None, "ticket_count"),
            QueryPlan::new("tickets")
                .column("id")
                .filter(Predicate::Not {
                    inner: Box::new(Predicate::IsNull {
                        column: "owner".into(),
                    }),
                })
                .limit(5),
        ];
        for plan in plans {
            let sql = compile(&plan).unwrap().sql;
            policy.check(&sql).unwrap_or_else(|e| panic!("{sql}: {e}"));
        }
    }

    #[test]
    fn test_unsupported_forms() {
        let plan = QueryPlan::new("tickets").aggregate(AggregateFunc::Sum, None, "s");
        assert!(matches!(compile(&plan), Err(SandboxError::Compile(_))));

        let plan = QueryPlan::new("tickets")
            .column("id")
            .filter(Predicate::And { all: vec![] });
        assert!(matches!(compile(&plan), Err(SandboxError::Compile(_))));

        let plan = QueryPlan::new("tickets")
            .column("id")
            .filter(Predicate::compare("id", CompareOp::Eq, Literal::Null));
        assert!(matches!(compile(&plan), Err(SandboxError::Compile(_))));

        let plan = QueryPlan::new("tickets")
            .column("id")
            .filter(Predicate::compare("id", CompareOp::Lt, Literal::Float(f64::NAN)));
        assert!(matches!(compile(&plan), Err(SandboxError::Compile(_))));
    }
}
