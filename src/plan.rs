//! Declarative query plans and the schema checks they must pass before compilation.
//!
//! A [`QueryPlan`] describes one analytic query over one table of a [`Dataset`]:
//! an ordered selection of columns and aggregates, an optional predicate tree,
//! grouping, ordering and a row limit. Plans are built upstream (usually by the
//! agent) and are untrusted until [`validate_plan`] accepts them.

use crate::errors::{Result, SandboxError};
use crate::paths::sanitize_identifier;
use serde::{Deserialize, Serialize};

/// Column types as inferred by dataset schema discovery
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    Integer,
    Float,
    String,
    Boolean,
    Date,
    Timestamp,
}

impl ColumnType {
    pub fn is_numeric(&self) -> bool {
        matches!(self, ColumnType::Integer | ColumnType::Float)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ColumnSchema {
    pub name: String,
    pub dtype: ColumnType,
}

impl ColumnSchema {
    pub fn new(name: &str, dtype: ColumnType) -> Self {
        Self {
            name: name.to_string(),
            dtype,
        }
    }
}

/// One CSV file of a dataset and its inferred columns
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TableSchema {
    /// File name relative to the dataset directory (e.g. `tickets.csv`)
    pub file: String,
    pub columns: Vec<ColumnSchema>,
}

impl TableSchema {
    pub fn new(file: &str, columns: Vec<ColumnSchema>) -> Self {
        Self {
            file: file.to_string(),
            columns,
        }
    }

    /// The identifier the runner registers this file under.
    pub fn table_name(&self) -> String {
        sanitize_identifier(&self.file)
    }

    pub fn column(&self, name: &str) -> Option<&ColumnSchema> {
        self.columns.iter().find(|c| c.name == name)
    }
}

/// Read-only view of a registered dataset
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Dataset {
    pub id: String,
    pub tables: Vec<TableSchema>,
}

impl Dataset {
    pub fn new(id: &str, tables: Vec<TableSchema>) -> Self {
        Self {
            id: id.to_string(),
            tables,
        }
    }

    pub fn table(&self, name: &str) -> Option<&TableSchema> {
        self.tables.iter().find(|t| t.table_name() == name)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AggregateFunc {
    Count,
    Sum,
    Avg,
    Min,
    Max,
}

impl AggregateFunc {
    pub fn sql_name(&self) -> &'static str {
        match self {
            AggregateFunc::Count => "COUNT",
            AggregateFunc::Sum => "SUM",
            AggregateFunc::Avg => "AVG",
            AggregateFunc::Min => "MIN",
            AggregateFunc::Max => "MAX",
        }
    }

    /// Whether this aggregate may be applied to a column of the given type
    pub fn accepts(&self, dtype: ColumnType) -> bool {
        match self {
            AggregateFunc::Count => true,
            AggregateFunc::Sum | AggregateFunc::Avg => dtype.is_numeric(),
            AggregateFunc::Min | AggregateFunc::Max => dtype != ColumnType::Boolean,
        }
    }
}

/// One output expression
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SelectItem {
    Column {
        column: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        alias: Option<String>,
    },
    Aggregate {
        func: AggregateFunc,
        /// `None` means `*`, which only `count` supports
        #[serde(default, skip_serializing_if = "Option::is_none")]
        column: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        alias: Option<String>,
    },
}

impl SelectItem {
    pub fn alias(&self) -> Option<&str> {
        match self {
            SelectItem::Column { alias, .. } | SelectItem::Aggregate { alias, .. } => {
                alias.as_deref()
            }
        }
    }

    fn is_aggregate(&self) -> bool {
        matches!(self, SelectItem::Aggregate { .. })
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CompareOp {
    pub fn sql(&self) -> &'static str {
        match self {
            CompareOp::Eq => "=",
            CompareOp::Ne => "<>",
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
            CompareOp::Gt => ">",
            CompareOp::Ge => ">=",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum Literal {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

/// Filter predicate tree
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Predicate {
    Compare {
        column: String,
        cmp: CompareOp,
        value: Literal,
    },
    IsNull {
        column: String,
    },
    IsNotNull {
        column: String,
    },
    And {
        all: Vec<Predicate>,
    },
    Or {
        any: Vec<Predicate>,
    },
    Not {
        inner: Box<Predicate>,
    },
}

impl Predicate {
    pub fn compare(column: &str, cmp: CompareOp, value: Literal) -> Self {
        Predicate::Compare {
            column: column.to_string(),
            cmp,
            value,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OrderBy {
    /// A table column or an alias from the selection
    pub column: String,
    #[serde(default)]
    pub descending: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueryPlan {
    pub table: String,
    pub select: Vec<SelectItem>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<Predicate>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub group_by: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub order_by: Vec<OrderBy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,
}

impl QueryPlan {
    /// Start a plan over `table` with an empty selection
    pub fn new(table: &str) -> Self {
        Self {
            table: table.to_string(),
            select: Vec::new(),
            filter: None,
            group_by: Vec::new(),
            order_by: Vec::new(),
            limit: None,
        }
    }

    pub fn column(mut self, column: &str) -> Self {
        self.select.push(SelectItem::Column {
            column: column.to_string(),
            alias: None,
        });
        self
    }

    pub fn aggregate(mut self, func: AggregateFunc, column: Option<&str>, alias: &str) -> Self {
        self.select.push(SelectItem::Aggregate {
            func,
            column: column.map(str::to_string),
            alias: Some(alias.to_string()),
        });
        self
    }

    pub fn filter(mut self, predicate: Predicate) -> Self {
        self.filter = Some(predicate);
        self
    }

    pub fn group_by(mut self, column: &str) -> Self {
        self.group_by.push(column.to_string());
        self
    }

    pub fn order_by(mut self, column: &str, descending: bool) -> Self {
        self.order_by.push(OrderBy {
            column: column.to_string(),
            descending,
        });
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Check a plan against the dataset schema and the configured row-limit ceiling.
///
/// Every failure names the offending field path, e.g. `select[2].column`.
pub fn validate_plan(plan: &QueryPlan, dataset: &Dataset, max_limit: u64) -> Result<()> {
    let table = dataset.table(&plan.table).ok_or_else(|| {
        SandboxError::validation(
            "table",
            format!("table '{}' not found in dataset '{}'", plan.table, dataset.id),
        )
    })?;

    if plan.select.is_empty() {
        return Err(SandboxError::validation(
            "select",
            "at least one output expression is required",
        ));
    }

    let grouped = !plan.group_by.is_empty() || plan.select.iter().any(SelectItem::is_aggregate);

    for (i, item) in plan.select.iter().enumerate() {
        if let Some(alias) = item.alias() {
            if alias.trim().is_empty() {
                return Err(SandboxError::validation(
                    format!("select[{}].alias", i),
                    "alias must not be empty",
                ));
            }
        }
        match item {
            SelectItem::Column { column, .. } => {
                let field = format!("select[{}].column", i);
                require_column(table, column, &field)?;
                if grouped && !plan.group_by.contains(column) {
                    return Err(SandboxError::validation(
                        field,
                        format!("column '{}' must appear in group_by", column),
                    ));
                }
            }
            SelectItem::Aggregate { func, column, .. } => {
                if let Some(column) = column {
                    let field = format!("select[{}].column", i);
                    let schema = require_column(table, column, &field)?;
                    if !func.accepts(schema.dtype) {
                        return Err(SandboxError::validation(
                            field,
                            format!(
                                "{} is not applicable to {:?} column '{}'",
                                func.sql_name(),
                                schema.dtype,
                                column
                            ),
                        ));
                    }
                }
            }
        }
    }

    if let Some(filter) = &plan.filter {
        validate_predicate(filter, table, "filter")?;
    }

    for (i, key) in plan.group_by.iter().enumerate() {
        require_column(table, key, &format!("group_by[{}]", i))?;
    }

    for (i, order) in plan.order_by.iter().enumerate() {
        let is_alias = plan
            .select
            .iter()
            .any(|item| item.alias() == Some(order.column.as_str()));
        if !is_alias && table.column(&order.column).is_none() {
            return Err(SandboxError::validation(
                format!("order_by[{}].column", i),
                format!("'{}' is neither a column nor a selection alias", order.column),
            ));
        }
    }

    if let Some(limit) = plan.limit {
        if limit == 0 || limit > max_limit {
            return Err(SandboxError::validation(
                "limit",
                format!("limit {} outside 1..={}", limit, max_limit),
            ));
        }
    }

    Ok(())
}

fn require_column<'a>(table: &'a TableSchema, column: &str, field: &str) -> Result<&'a ColumnSchema> {
    table.column(column).ok_or_else(|| {
        SandboxError::validation(
            field,
            format!("column '{}' not found on table '{}'", column, table.table_name()),
        )
    })
}

fn validate_predicate(predicate: &Predicate, table: &TableSchema, field: &str) -> Result<()> {
    match predicate {
        Predicate::Compare { column, .. }
        | Predicate::IsNull { column }
        | Predicate::IsNotNull { column } => {
            require_column(table, column, &format!("{}.column", field))?;
        }
        Predicate::And { all } => {
            for (i, p) in all.iter().enumerate() {
                validate_predicate(p, table, &format!("{}.all[{}]", field, i))?;
            }
        }
        Predicate::Or { any } => {
            for (i, p) in any.iter().enumerate() {
                validate_predicate(p, table, &format!("{}.any[{}]", field, i))?;
            }
        }
        Predicate::Not { inner } => {
            validate_predicate(inner, table, &format!("{}.inner", field))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn support() -> Dataset {
        Dataset::new(
            "support",
            vec![TableSchema::new(
                "tickets.csv",
                vec![
                    ColumnSchema::new("id", ColumnType::Integer),
                    ColumnSchema::new("priority", ColumnType::String),
                    ColumnSchema::new("resolution_hours", ColumnType::Float),
                    ColumnSchema::new("escalated", ColumnType::Boolean),
                ],
            )],
        )
    }

    fn field_of(err: SandboxError) -> String {
        match err {
            SandboxError::Validation { field, .. } => field,
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn test_accepts_grouped_aggregate() {
        let plan = QueryPlan::new("tickets")
            .column("priority")
            .aggregate(AggregateFunc::Avg, Some("resolution_hours"), "avg_hours")
            .group_by("priority")
            .order_by("avg_hours", true)
            .limit(10);
        assert!(validate_plan(&plan, &support(), 1000).is_ok());
    }

    #[test]
    fn test_unknown_table_and_column() {
        let plan = QueryPlan::new("orders").column("id");
        assert_eq!(field_of(validate_plan(&plan, &support(), 100).unwrap_err()), "table");

        let plan = QueryPlan::new("tickets").column("id").column("owner");
        assert_eq!(
            field_of(validate_plan(&plan, &support(), 100).unwrap_err()),
            "select[1].column"
        );
    }

    #[test]
    fn test_aggregate_type_compatibility() {
        let plan = QueryPlan::new("tickets").aggregate(AggregateFunc::Sum, Some("priority"), "s");
        assert_eq!(
            field_of(validate_plan(&plan, &support(), 100).unwrap_err()),
            "select[0].column"
        );

        let plan = QueryPlan::new("tickets").aggregate(AggregateFunc::Max, Some("escalated"), "m");
        assert!(validate_plan(&plan, &support(), 100).is_err());

        let plan = QueryPlan::new("tickets").aggregate(AggregateFunc::Count, Some("escalated"), "c");
        assert!(validate_plan(&plan, &support(), 100).is_ok());
    }

    #[test]
    fn test_bare_column_requires_group_by() {
        let plan = QueryPlan::new("tickets")
            .column("priority")
            .aggregate(AggregateFunc::Count, None, "n");
        assert_eq!(
            field_of(validate_plan(&plan, &support(), 100).unwrap_err()),
            "select[0].column"
        );

        let plan = QueryPlan::new("tickets").column("id").group_by("priority");
        assert_eq!(
            field_of(validate_plan(&plan, &support(), 100).unwrap_err()),
            "select[0].column"
        );

        let plan = QueryPlan::new("tickets").column("priority").group_by("priority");
        assert!(validate_plan(&plan, &support(), 100).is_ok());
    }

    #[test]
    fn test_nested_filter_column_is_reported() {
        let plan = QueryPlan::new("tickets").column("id").filter(Predicate::And {
            all: vec![
                Predicate::compare("priority", CompareOp::Eq, Literal::Text("high".into())),
                Predicate::Not {
                    inner: Box::new(Predicate::IsNull {
                        column: "closed_at".into(),
                    }),
                },
            ],
        });
        assert_eq!(
            field_of(validate_plan(&plan, &support(), 100).unwrap_err()),
            "filter.all[1].inner.column"
        );
    }

    #[test]
    fn test_limit_bounds() {
        let plan = QueryPlan::new("tickets").column("id").limit(5000);
        assert_eq!(field_of(validate_plan(&plan, &support(), 1000).unwrap_err()), "limit");

        let plan = QueryPlan::new("tickets").column("id").limit(0);
        assert!(validate_plan(&plan, &support(), 1000).is_err());
    }

    #[test]
    fn test_order_by_unknown_target() {
        let plan = QueryPlan::new("tickets").column("id").order_by("n", false);
        assert_eq!(
            field_of(validate_plan(&plan, &support(), 100).unwrap_err()),
            "order_by[0].column"
        );
    }

    #[test]
    fn test_plan_deserializes_from_agent_json() {
        let plan: QueryPlan = serde_json::from_value(serde_json::json!({
            "table": "tickets",
            "select": [
                {"kind": "column", "column": "priority"},
                {"kind": "aggregate", "func": "count", "alias": "n"}
            ],
            "filter": {"op": "compare", "column": "id", "cmp": "gt", "value": 10},
            "group_by": ["priority"],
            "limit": 5
        }))
        .unwrap();
        assert_eq!(plan.select.len(), 2);
        assert_eq!(
            plan.filter,
            Some(Predicate::compare("id", CompareOp::Gt, Literal::Int(10)))
        );
        assert!(validate_plan(&plan, &support(), 100).is_ok());
    }
}
