//! Glue between the parsed statement tree and the storage engine. Kept in
//! the teacher's `executor.rs` shape (one `execute_*` function per statement
//! kind, dispatched from a single `execute` entry point) but threaded
//! through an explicit `&mut GlobalManager`/`Session` pair instead of a
//! `static`/`OnceLock` global database, per `storage::database`'s module
//! doc on replacing the original's singleton pattern with owned state.

use crate::ast::*;
use crate::error::{Error, Result};
use crate::logger::ResultTable;
use crate::storage::database::GlobalManager;
use crate::storage::iterator::{plan_scan, CompareOp, WhereConstraint};
use crate::storage::table::{DataType as StorageDataType, FieldSpec};
use crate::value::Value;

/// Interactive state carried between statements: the current database
/// (spec §6 `USE DATABASE`), the CLI-preset focus table, and the output
/// mode.
pub struct Session {
    pub current_db: Option<String>,
    pub current_table: Option<String>,
    pub batch: bool,
}

impl Session {
    pub fn new(batch: bool, preset_db: Option<String>, preset_table: Option<String>) -> Self {
        Session { current_db: preset_db, current_table: preset_table, batch }
    }

    fn require_db(&self) -> Result<&str> {
        self.current_db.as_deref().ok_or(Error::NoCurrentDatabase)
    }
}

pub fn execute(global: &mut GlobalManager, session: &mut Session, statement: Statement) -> Result<String> {
    match statement {
        Statement::CreateDatabase(name) => execute_create_database(global, &name),
        Statement::DropDatabase(name) => execute_drop_database(global, session, &name),
        Statement::ShowDatabases => execute_show_databases(global, session),
        Statement::UseDatabase(name) => execute_use_database(global, session, name),
        Statement::CreateTable(stmt) => execute_create_table(global, session, stmt),
        Statement::DropTable(name) => execute_drop_table(global, session, &name),
        Statement::ShowTables => execute_show_tables(global, session),
        Statement::DescribeTable(name) => execute_describe_table(global, session, &name),
        Statement::Insert(stmt) => execute_insert(global, session, stmt),
        Statement::Select(stmt) => execute_select(global, session, stmt),
    }
}

fn execute_create_database(global: &mut GlobalManager, name: &str) -> Result<String> {
    global.create_db(name)?;
    Ok(format!("database '{name}' created"))
}

fn execute_drop_database(global: &mut GlobalManager, session: &mut Session, name: &str) -> Result<String> {
    global.drop_db(name)?;
    if session.current_db.as_deref() == Some(name) {
        session.current_db = None;
    }
    Ok(format!("database '{name}' dropped"))
}

fn execute_show_databases(global: &GlobalManager, session: &Session) -> Result<String> {
    let header = vec!["name".to_string()];
    let rows: Vec<Vec<String>> = global.db_names().into_iter().map(|n| vec![n.to_string()]).collect();
    Ok(ResultTable { header: &header, rows: &rows }.render(session.batch))
}

fn execute_use_database(global: &GlobalManager, session: &mut Session, name: String) -> Result<String> {
    global.db(&name)?;
    session.current_db = Some(name.clone());
    Ok(format!("using database '{name}'"))
}

fn column_definitions_to_specs(columns: Vec<ColumnDefinition>) -> Vec<FieldSpec> {
    columns
        .into_iter()
        .map(|c| FieldSpec {
            name: c.name,
            data_type: match c.data_type {
                DataType::Int => StorageDataType::Int,
                DataType::Float => StorageDataType::Float,
                DataType::Varchar(n) => StorageDataType::Varchar(n),
            },
            notnull: c.notnull,
            default: c.default,
        })
        .collect()
}

fn execute_create_table(global: &mut GlobalManager, session: &Session, stmt: CreateTableStatement) -> Result<String> {
    let db_name = session.require_db()?.to_string();
    let db = global.db_mut(&db_name)?;
    let name = stmt.name.clone();
    let specs = column_definitions_to_specs(stmt.columns);
    db.create_table(name.clone(), specs)?;

    if let Some((pk_name, cols)) = stmt.primary_key {
        db.table_mut(&name)?.add_pk(pk_name, &cols)?;
    }
    for (uq_name, cols) in stmt.uniques {
        db.table_mut(&name)?.add_unique(uq_name, &cols)?;
    }
    for (idx_name, cols) in stmt.indexes {
        db.table_mut(&name)?.add_index(idx_name, &cols)?;
    }
    for fk in stmt.foreign_keys {
        db.add_fk(&name, fk.name, &fk.local_columns, &fk.ref_table)?;
    }

    Ok(format!("table '{name}' created"))
}

fn execute_drop_table(global: &mut GlobalManager, session: &Session, name: &str) -> Result<String> {
    let db_name = session.require_db()?.to_string();
    global.db_mut(&db_name)?.drop_table(name)?;
    Ok(format!("table '{name}' dropped"))
}

fn execute_show_tables(global: &GlobalManager, session: &Session) -> Result<String> {
    let db_name = session.require_db()?.to_string();
    let db = global.db(&db_name)?;
    let header = vec!["name".to_string()];
    let rows: Vec<Vec<String>> = db.table_names().into_iter().map(|n| vec![n.to_string()]).collect();
    Ok(ResultTable { header: &header, rows: &rows }.render(session.batch))
}

fn describe_data_type(dt: StorageDataType) -> String {
    match dt {
        StorageDataType::Int => "INT".to_string(),
        StorageDataType::Float => "FLOAT".to_string(),
        StorageDataType::Varchar(n) => format!("VARCHAR({n})"),
    }
}

fn execute_describe_table(global: &GlobalManager, session: &Session, name: &str) -> Result<String> {
    let db_name = session.require_db()?.to_string();
    let table = global.db(&db_name)?.table(name)?;
    let header = vec!["field".to_string(), "type".to_string(), "notnull".to_string(), "default".to_string()];
    let rows: Vec<Vec<String>> = table
        .fields()
        .iter()
        .map(|f| {
            vec![
                f.name.clone(),
                describe_data_type(f.data_type),
                f.notnull.to_string(),
                f.default.as_ref().map(|v| v.to_string()).unwrap_or_default(),
            ]
        })
        .collect();
    Ok(ResultTable { header: &header, rows: &rows }.render(session.batch))
}

fn execute_insert(global: &mut GlobalManager, session: &Session, stmt: InsertStatement) -> Result<String> {
    let db_name = session.require_db()?.to_string();
    let db = global.db_mut(&db_name)?;
    let table = db.table(&stmt.table)?;
    let field_count = table.fields().len();

    let column_order: Vec<usize> = match &stmt.columns {
        Some(names) => names
            .iter()
            .map(|n| table.field_index(n).ok_or_else(|| Error::NoSuchField(n.clone())))
            .collect::<Result<_>>()?,
        None => (0..field_count).collect(),
    };

    let row_count = stmt.values.len();
    for tuple in stmt.values {
        if tuple.len() != column_order.len() {
            return Err(Error::TypeMismatch(format!(
                "expected {} values, got {}",
                column_order.len(),
                tuple.len()
            )));
        }
        let mut values: Vec<Option<Value>> = vec![None; field_count];
        for (&field_idx, value) in column_order.iter().zip(tuple) {
            values[field_idx] = Some(value);
        }
        global.db_mut(&db_name)?.insert_row(&stmt.table, &values)?;
    }
    Ok(format!("{row_count} row(s) inserted"))
}

fn comparison_op_to_compare_op(op: ComparisonOperator) -> CompareOp {
    match op {
        ComparisonOperator::Eq => CompareOp::Eq,
        ComparisonOperator::Ne => CompareOp::Ne,
        ComparisonOperator::Lt => CompareOp::Lt,
        ComparisonOperator::Le => CompareOp::Le,
        ComparisonOperator::Gt => CompareOp::Gt,
        ComparisonOperator::Ge => CompareOp::Ge,
    }
}

fn execute_select(global: &GlobalManager, session: &Session, stmt: SelectStatement) -> Result<String> {
    let db_name = session.require_db()?.to_string();
    let table = global.db(&db_name)?.table(&stmt.from)?;

    let projected: Vec<usize> = match &stmt.columns {
        cols if cols.iter().any(|c| matches!(c, Column::All)) => (0..table.fields().len()).collect(),
        cols => cols
            .iter()
            .map(|c| match c {
                Column::Named(n) => table.field_index(n).ok_or_else(|| Error::NoSuchField(n.clone())),
                Column::All => unreachable!(),
            })
            .collect::<Result<_>>()?,
    };

    let constraints: Vec<WhereConstraint> = stmt
        .where_clause
        .into_iter()
        .map(|c| {
            let field = table.field_index(&c.column).ok_or_else(|| Error::NoSuchField(c.column.clone()))?;
            Ok(WhereConstraint { field, op: comparison_op_to_compare_op(c.op), value: c.value })
        })
        .collect::<Result<_>>()?;

    let mut scan = plan_scan(table, constraints, &projected)?;
    let mut rows: Vec<Vec<Value>> = Vec::new();
    loop {
        let block = scan.fill_block();
        if block.is_empty() {
            break;
        }
        rows.extend(block);
    }

    let header: Vec<String> = projected.iter().map(|&i| table.fields()[i].name.clone()).collect();
    let string_rows: Vec<Vec<String>> =
        rows.iter().map(|row| row.iter().map(|v| v.to_string()).collect()).collect();
    Ok(ResultTable { header: &header, rows: &string_rows }.render(session.batch))
}
