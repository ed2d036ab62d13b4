//! Parsed statement tree for the SQL-92 subset named in spec §6. Narrowed
//! from the teacher's `ast.rs` (no joins, aggregates, ORDER BY/GROUP BY,
//! or subqueries — those are the distilled spec's excluded "query
//! optimization beyond single-index selection" and "multi-table joins"
//! Non-goals) down to exactly: `CREATE/DROP/SHOW/USE DATABASE`,
//! `SHOW/CREATE/DROP/DESCRIBE TABLE`, `INSERT INTO ... VALUES`,
//! `SELECT ... FROM ... WHERE ...` with constraint clauses on `CREATE TABLE`.
//!
//! Reuses `crate::value::Value` rather than a parser-local value enum: the
//! storage engine's `Value` already covers exactly the types this grammar
//! needs, so a second near-identical enum would just be a translation step.

use crate::value::Value;

#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    CreateDatabase(String),
    DropDatabase(String),
    ShowDatabases,
    UseDatabase(String),
    CreateTable(CreateTableStatement),
    DropTable(String),
    ShowTables,
    DescribeTable(String),
    Insert(InsertStatement),
    Select(SelectStatement),
}

#[derive(Debug, Clone, PartialEq)]
pub struct CreateTableStatement {
    pub name: String,
    pub columns: Vec<ColumnDefinition>,
    pub primary_key: Option<(String, Vec<String>)>,
    pub foreign_keys: Vec<ForeignKeyDefinition>,
    pub uniques: Vec<(String, Vec<String>)>,
    pub indexes: Vec<(String, Vec<String>)>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ColumnDefinition {
    pub name: String,
    pub data_type: DataType,
    pub notnull: bool,
    pub default: Option<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
    Int,
    Float,
    Varchar(usize),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ForeignKeyDefinition {
    pub name: String,
    pub local_columns: Vec<String>,
    pub ref_table: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InsertStatement {
    pub table: String,
    pub columns: Option<Vec<String>>,
    pub values: Vec<Vec<Value>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SelectStatement {
    pub columns: Vec<Column>,
    pub from: String,
    pub where_clause: Vec<Comparison>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Column {
    All,
    Named(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComparisonOperator {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

/// `column op value`, ANDed together across a WHERE clause's comparisons —
/// the flat predicate shape `storage::iterator::WhereConstraint` expects.
#[derive(Debug, Clone, PartialEq)]
pub struct Comparison {
    pub column: String,
    pub op: ComparisonOperator,
    pub value: Value,
}
