// ABOUTME: Structured query filters, projections and pagination tokens
// ABOUTME: Backends either render filters to their native syntax or evaluate them directly

use chrono::{DateTime, Utc};

use super::entity::Entity;

/// System columns a filter can compare against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Column {
    PartitionKey,
    RowKey,
    Timestamp,
}

impl Column {
    pub fn name(&self) -> &'static str {
        match self {
            Column::PartitionKey => "PartitionKey",
            Column::RowKey => "RowKey",
            Column::Timestamp => "Timestamp",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
}

impl CompareOp {
    pub fn keyword(&self) -> &'static str {
        match self {
            CompareOp::Eq => "eq",
            CompareOp::Ne => "ne",
            CompareOp::Gt => "gt",
            CompareOp::Ge => "ge",
            CompareOp::Lt => "lt",
            CompareOp::Le => "le",
        }
    }

    fn holds(&self, ordering: std::cmp::Ordering) -> bool {
        use std::cmp::Ordering::*;
        match self {
            CompareOp::Eq => ordering == Equal,
            CompareOp::Ne => ordering != Equal,
            CompareOp::Gt => ordering == Greater,
            CompareOp::Ge => ordering != Less,
            CompareOp::Lt => ordering == Less,
            CompareOp::Le => ordering != Greater,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FilterValue {
    String(String),
    DateTime(DateTime<Utc>),
}

/// A boolean filter expression over system columns.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    Compare {
        column: Column,
        op: CompareOp,
        value: FilterValue,
    },
    And(Box<Filter>, Box<Filter>),
    Or(Box<Filter>, Box<Filter>),
}

impl Filter {
    pub fn compare(column: Column, op: CompareOp, value: FilterValue) -> Self {
        Filter::Compare { column, op, value }
    }

    /// `Timestamp gt <since>`: rows modified strictly after `since`.
    pub fn modified_after(since: DateTime<Utc>) -> Self {
        Filter::compare(Column::Timestamp, CompareOp::Gt, FilterValue::DateTime(since))
    }

    pub fn partition_key_eq(value: impl Into<String>) -> Self {
        Filter::compare(
            Column::PartitionKey,
            CompareOp::Eq,
            FilterValue::String(value.into()),
        )
    }

    pub fn row_key_eq(value: impl Into<String>) -> Self {
        Filter::compare(Column::RowKey, CompareOp::Eq, FilterValue::String(value.into()))
    }

    pub fn and(self, other: Filter) -> Self {
        Filter::And(Box::new(self), Box::new(other))
    }

    pub fn or(self, other: Filter) -> Self {
        Filter::Or(Box::new(self), Box::new(other))
    }

    /// Join filters with `or`. Returns `None` for an empty input.
    pub fn any_of(filters: impl IntoIterator<Item = Filter>) -> Option<Self> {
        filters.into_iter().reduce(Filter::or)
    }

    /// Number of comparisons in the expression. Backends cap this per query.
    pub fn comparison_count(&self) -> usize {
        match self {
            Filter::Compare { .. } => 1,
            Filter::And(left, right) | Filter::Or(left, right) => {
                left.comparison_count() + right.comparison_count()
            }
        }
    }

    /// Evaluate the filter against an entity.
    ///
    /// A timestamp comparison against an entity without a timestamp is false.
    pub fn matches(&self, entity: &Entity) -> bool {
        match self {
            Filter::Compare { column, op, value } => match (column, value) {
                (Column::PartitionKey, FilterValue::String(v)) => {
                    op.holds(entity.partition_key.as_str().cmp(v.as_str()))
                }
                (Column::RowKey, FilterValue::String(v)) => {
                    op.holds(entity.row_key.as_str().cmp(v.as_str()))
                }
                (Column::Timestamp, FilterValue::DateTime(v)) => entity
                    .timestamp
                    .map(|ts| op.holds(ts.cmp(v)))
                    .unwrap_or(false),
                _ => false,
            },
            Filter::And(left, right) => left.matches(entity) && right.matches(entity),
            Filter::Or(left, right) => left.matches(entity) || right.matches(entity),
        }
    }
}

/// A query against one table.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TableQuery {
    pub filter: Option<Filter>,
    /// Property names to return. Keys and timestamp are always returned.
    pub select: Option<Vec<String>>,
    /// Maximum rows per page; the backend may return fewer.
    pub page_size: Option<usize>,
}

impl TableQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn select<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.select = Some(columns.into_iter().map(Into::into).collect());
        self
    }

    pub fn page_size(mut self, size: usize) -> Self {
        self.page_size = Some(size);
        self
    }
}

/// Opaque position of the next page of a query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Continuation {
    pub next_partition_key: String,
    pub next_row_key: Option<String>,
}

/// One page of query results.
#[derive(Debug, Clone, Default)]
pub struct QueryPage {
    pub entities: Vec<Entity>,
    pub continuation: Option<Continuation>,
}
