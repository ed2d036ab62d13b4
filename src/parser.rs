//! Recursive-descent parser over `lexer::Token`, producing `ast::Statement`.
//! Keeps the teacher's `parser.rs` shape (`Parser { tokens, current }`,
//! `consume`/`advance`/`current_token`, one `parse_*` method per statement
//! kind) narrowed to spec §6's grammar: no joins, no aggregates, no
//! subqueries, no ORDER BY/GROUP BY/LIMIT.
//!
//! Constraint clause names (`PRIMARY KEY`/`FOREIGN KEY`/`UNIQUE`/`INDEX`) are
//! synthesized here rather than required in the grammar — spec §6 names the
//! clause kinds but not a naming syntax, and `storage::table`'s bookkeeping
//! only needs the name to be unique within the table.

use crate::ast::*;
use crate::lexer::Token;
use crate::value::Value;

pub struct Parser {
    tokens: Vec<Token>,
    current: usize,
}

impl Parser {
    fn new(tokens: Vec<Token>) -> Self {
        Parser { tokens, current: 0 }
    }

    fn current_token(&self) -> &Token {
        self.tokens.get(self.current).unwrap_or(&Token::Eof)
    }

    fn consume(&mut self, expected: Token) -> Result<(), String> {
        if *self.current_token() == expected {
            self.current += 1;
            Ok(())
        } else {
            Err(format!("expected {:?}, found {:?}", expected, self.current_token()))
        }
    }

    fn advance(&mut self) -> Token {
        let token = self.current_token().clone();
        self.current += 1;
        token
    }

    fn expect_identifier(&mut self) -> Result<String, String> {
        match self.advance() {
            Token::Identifier(name) => Ok(name),
            other => Err(format!("expected identifier, found {other:?}")),
        }
    }

    fn parse_statement(&mut self) -> Result<Statement, String> {
        match self.current_token() {
            Token::Select => self.parse_select(),
            Token::Insert => self.parse_insert(),
            Token::Create => self.parse_create(),
            Token::Drop => self.parse_drop(),
            Token::Show => self.parse_show(),
            Token::Use => self.parse_use(),
            Token::Describe => self.parse_describe(),
            other => Err(format!("unexpected token: {other:?}")),
        }
    }

    fn parse_use(&mut self) -> Result<Statement, String> {
        self.consume(Token::Use)?;
        self.consume(Token::Database)?;
        Ok(Statement::UseDatabase(self.expect_identifier()?))
    }

    fn parse_show(&mut self) -> Result<Statement, String> {
        self.consume(Token::Show)?;
        match self.advance() {
            Token::Databases => Ok(Statement::ShowDatabases),
            Token::Tables => Ok(Statement::ShowTables),
            other => Err(format!("expected DATABASES or TABLES, found {other:?}")),
        }
    }

    fn parse_describe(&mut self) -> Result<Statement, String> {
        self.consume(Token::Describe)?;
        self.consume(Token::Table)?;
        Ok(Statement::DescribeTable(self.expect_identifier()?))
    }

    fn parse_create(&mut self) -> Result<Statement, String> {
        self.consume(Token::Create)?;
        match self.current_token() {
            Token::Database => {
                self.advance();
                Ok(Statement::CreateDatabase(self.expect_identifier()?))
            }
            Token::Table => {
                self.advance();
                self.parse_create_table()
            }
            other => Err(format!("expected DATABASE or TABLE, found {other:?}")),
        }
    }

    fn parse_drop(&mut self) -> Result<Statement, String> {
        self.consume(Token::Drop)?;
        match self.current_token() {
            Token::Database => {
                self.advance();
                Ok(Statement::DropDatabase(self.expect_identifier()?))
            }
            Token::Table => {
                self.advance();
                Ok(Statement::DropTable(self.expect_identifier()?))
            }
            other => Err(format!("expected DATABASE or TABLE, found {other:?}")),
        }
    }

    fn parse_column_list(&mut self) -> Result<Vec<String>, String> {
        self.consume(Token::LeftParen)?;
        let mut cols = vec![self.expect_identifier()?];
        while *self.current_token() == Token::Comma {
            self.advance();
            cols.push(self.expect_identifier()?);
        }
        self.consume(Token::RightParen)?;
        Ok(cols)
    }

    fn parse_data_type(&mut self) -> Result<DataType, String> {
        match self.advance() {
            Token::Int => Ok(DataType::Int),
            Token::Float => Ok(DataType::Float),
            Token::Varchar => {
                self.consume(Token::LeftParen)?;
                let n = match self.advance() {
                    Token::Number(n) if n > 0 => n as usize,
                    other => return Err(format!("expected a positive VARCHAR length, found {other:?}")),
                };
                self.consume(Token::RightParen)?;
                Ok(DataType::Varchar(n))
            }
            other => Err(format!("expected a data type, found {other:?}")),
        }
    }

    fn parse_literal(&mut self) -> Result<Value, String> {
        match self.advance() {
            Token::Number(n) => Ok(Value::Int(n as i32)),
            Token::FloatLiteral(f) => Ok(Value::Float(f)),
            Token::StringLiteral(s) => Ok(Value::Str(s)),
            Token::Null => Ok(Value::Null),
            other => Err(format!("expected a literal value, found {other:?}")),
        }
    }

    fn parse_create_table(&mut self) -> Result<Statement, String> {
        let name = self.expect_identifier()?;
        self.consume(Token::LeftParen)?;

        let mut columns = Vec::new();
        let mut primary_key = None;
        let mut foreign_keys = Vec::new();
        let mut uniques = Vec::new();
        let mut indexes = Vec::new();
        let mut fk_n = 0usize;
        let mut uq_n = 0usize;
        let mut idx_n = 0usize;

        loop {
            match self.current_token() {
                Token::Primary => {
                    self.advance();
                    self.consume(Token::Key)?;
                    let cols = self.parse_column_list()?;
                    if primary_key.is_some() {
                        return Err("a table may declare at most one PRIMARY KEY".to_string());
                    }
                    primary_key = Some((format!("pk_{name}"), cols));
                }
                Token::Foreign => {
                    self.advance();
                    self.consume(Token::Key)?;
                    let cols = self.parse_column_list()?;
                    self.consume(Token::References)?;
                    let ref_table = self.expect_identifier()?;
                    foreign_keys.push(ForeignKeyDefinition {
                        name: format!("fk_{name}_{fk_n}"),
                        local_columns: cols,
                        ref_table,
                    });
                    fk_n += 1;
                }
                Token::Unique => {
                    self.advance();
                    let cols = self.parse_column_list()?;
                    uniques.push((format!("uq_{name}_{uq_n}"), cols));
                    uq_n += 1;
                }
                Token::Index => {
                    self.advance();
                    let cols = self.parse_column_list()?;
                    indexes.push((format!("idx_{name}_{idx_n}"), cols));
                    idx_n += 1;
                }
                _ => {
                    let col_name = self.expect_identifier()?;
                    let data_type = self.parse_data_type()?;
                    let mut notnull = false;
                    let mut default = None;
                    loop {
                        match self.current_token() {
                            Token::Not => {
                                self.advance();
                                self.consume(Token::Null)?;
                                notnull = true;
                            }
                            Token::Default => {
                                self.advance();
                                default = Some(self.parse_literal()?);
                            }
                            _ => break,
                        }
                    }
                    columns.push(ColumnDefinition { name: col_name, data_type, notnull, default });
                }
            }

            if *self.current_token() == Token::Comma {
                self.advance();
            } else {
                break;
            }
        }

        self.consume(Token::RightParen)?;
        self.consume(Token::Semicolon).ok();

        Ok(Statement::CreateTable(CreateTableStatement {
            name,
            columns,
            primary_key,
            foreign_keys,
            uniques,
            indexes,
        }))
    }

    fn parse_insert(&mut self) -> Result<Statement, String> {
        self.consume(Token::Insert)?;
        self.consume(Token::Into)?;
        let table = self.expect_identifier()?;

        let columns = if *self.current_token() == Token::LeftParen {
            Some(self.parse_column_list()?)
        } else {
            None
        };

        self.consume(Token::Values)?;
        let mut values = vec![self.parse_value_tuple()?];
        while *self.current_token() == Token::Comma {
            self.advance();
            values.push(self.parse_value_tuple()?);
        }
        self.consume(Token::Semicolon).ok();

        Ok(Statement::Insert(InsertStatement { table, columns, values }))
    }

    fn parse_value_tuple(&mut self) -> Result<Vec<Value>, String> {
        self.consume(Token::LeftParen)?;
        let mut values = vec![self.parse_literal()?];
        while *self.current_token() == Token::Comma {
            self.advance();
            values.push(self.parse_literal()?);
        }
        self.consume(Token::RightParen)?;
        Ok(values)
    }

    fn parse_select(&mut self) -> Result<Statement, String> {
        self.consume(Token::Select)?;
        let columns = self.parse_select_columns()?;
        self.consume(Token::From)?;
        let from = self.expect_identifier()?;

        let where_clause = if *self.current_token() == Token::Where {
            self.advance();
            self.parse_where_clause()?
        } else {
            Vec::new()
        };
        self.consume(Token::Semicolon).ok();

        Ok(Statement::Select(SelectStatement { columns, from, where_clause }))
    }

    fn parse_select_columns(&mut self) -> Result<Vec<Column>, String> {
        if *self.current_token() == Token::Star {
            self.advance();
            return Ok(vec![Column::All]);
        }
        let mut columns = vec![Column::Named(self.expect_identifier()?)];
        while *self.current_token() == Token::Comma {
            self.advance();
            columns.push(Column::Named(self.expect_identifier()?));
        }
        Ok(columns)
    }

    fn parse_where_clause(&mut self) -> Result<Vec<Comparison>, String> {
        let mut comparisons = vec![self.parse_comparison()?];
        while *self.current_token() == Token::And {
            self.advance();
            comparisons.push(self.parse_comparison()?);
        }
        Ok(comparisons)
    }

    fn parse_comparison(&mut self) -> Result<Comparison, String> {
        let column = self.expect_identifier()?;
        let op = match self.advance() {
            Token::Equal => ComparisonOperator::Eq,
            Token::NotEqual => ComparisonOperator::Ne,
            Token::LessThan => ComparisonOperator::Lt,
            Token::LessThanOrEqual => ComparisonOperator::Le,
            Token::GreaterThan => ComparisonOperator::Gt,
            Token::GreaterThanOrEqual => ComparisonOperator::Ge,
            other => return Err(format!("expected a comparison operator, found {other:?}")),
        };
        let value = self.parse_literal()?;
        Ok(Comparison { column, op, value })
    }
}

pub fn parse(tokens: Vec<Token>) -> Result<Statement, String> {
    let mut parser = Parser::new(tokens);
    let stmt = parser.parse_statement()?;
    if *parser.current_token() != Token::Eof {
        return Err(format!("unexpected trailing token: {:?}", parser.current_token()));
    }
    Ok(stmt)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::tokenize;

    fn parse_sql(sql: &str) -> Statement {
        parse(tokenize(sql).unwrap()).unwrap()
    }

    #[test]
    fn parses_create_table_with_primary_and_foreign_key() {
        let stmt = parse_sql(
            "CREATE TABLE students (id INT NOT NULL, dept_id INT, name VARCHAR(20), \
             PRIMARY KEY (id), FOREIGN KEY (dept_id) REFERENCES departments);",
        );
        let Statement::CreateTable(ct) = stmt else { panic!("expected CreateTable") };
        assert_eq!(ct.name, "students");
        assert_eq!(ct.columns.len(), 3);
        assert_eq!(ct.primary_key, Some(("pk_students".to_string(), vec!["id".to_string()])));
        assert_eq!(ct.foreign_keys.len(), 1);
        assert_eq!(ct.foreign_keys[0].ref_table, "departments");
    }

    #[test]
    fn parses_insert_with_explicit_columns() {
        let stmt = parse_sql("INSERT INTO students (id, name) VALUES (1, 'Ada'), (2, 'Lin');");
        let Statement::Insert(ins) = stmt else { panic!("expected Insert") };
        assert_eq!(ins.table, "students");
        assert_eq!(ins.columns, Some(vec!["id".to_string(), "name".to_string()]));
        assert_eq!(ins.values.len(), 2);
        assert_eq!(ins.values[0][1], Value::Str("Ada".into()));
    }

    #[test]
    fn parses_select_with_anded_where_clause() {
        let stmt = parse_sql("SELECT id, name FROM students WHERE age >= 18 AND dept_id = 3;");
        let Statement::Select(sel) = stmt else { panic!("expected Select") };
        assert_eq!(sel.from, "students");
        assert_eq!(sel.where_clause.len(), 2);
        assert_eq!(sel.where_clause[0].op, ComparisonOperator::Ge);
    }

    #[test]
    fn rejects_a_second_primary_key_clause() {
        let tokens = tokenize("CREATE TABLE t (a INT, PRIMARY KEY (a), PRIMARY KEY (a));").unwrap();
        assert!(parse(tokens).is_err());
    }
}
