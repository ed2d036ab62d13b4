//! Hand-written character-at-a-time tokenizer for the SQL-92 subset of
//! spec §6. Narrowed from the teacher's `lexer.rs` (same `Peekable<Chars>`
//! scanning shape, `match_keyword` table, number/string reading helpers) to
//! exactly the keywords this grammar's statements use.

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Select,
    From,
    Where,
    Insert,
    Into,
    Values,
    Create,
    Drop,
    Show,
    Use,
    Database,
    Databases,
    Table,
    Tables,
    Describe,
    Primary,
    Foreign,
    Key,
    References,
    Unique,
    Index,
    Not,
    Null,
    Default,
    And,
    Int,
    Float,
    Varchar,

    Identifier(String),
    Number(i64),
    FloatLiteral(f64),
    StringLiteral(String),

    LeftParen,
    RightParen,
    Comma,
    Semicolon,
    Star,

    Equal,
    NotEqual,
    LessThan,
    LessThanOrEqual,
    GreaterThan,
    GreaterThanOrEqual,

    Eof,
}

pub fn tokenize(input: &str) -> Result<Vec<Token>, String> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();

    while let Some(&ch) = chars.peek() {
        match ch {
            ' ' | '\t' | '\n' | '\r' => {
                chars.next();
            }
            '(' => {
                tokens.push(Token::LeftParen);
                chars.next();
            }
            ')' => {
                tokens.push(Token::RightParen);
                chars.next();
            }
            ',' => {
                tokens.push(Token::Comma);
                chars.next();
            }
            ';' => {
                tokens.push(Token::Semicolon);
                chars.next();
            }
            '*' => {
                tokens.push(Token::Star);
                chars.next();
            }
            '-' => {
                chars.next();
                if matches!(chars.peek(), Some(c) if c.is_ascii_digit()) {
                    let num = read_number(&mut chars);
                    push_number(&mut tokens, &num, true)?;
                } else {
                    return Err("unexpected character: -".to_string());
                }
            }
            '=' => {
                tokens.push(Token::Equal);
                chars.next();
            }
            '<' => {
                chars.next();
                if let Some(&'=') = chars.peek() {
                    tokens.push(Token::LessThanOrEqual);
                    chars.next();
                } else if let Some(&'>') = chars.peek() {
                    tokens.push(Token::NotEqual);
                    chars.next();
                } else {
                    tokens.push(Token::LessThan);
                }
            }
            '>' => {
                chars.next();
                if let Some(&'=') = chars.peek() {
                    tokens.push(Token::GreaterThanOrEqual);
                    chars.next();
                } else {
                    tokens.push(Token::GreaterThan);
                }
            }
            '!' => {
                chars.next();
                if let Some(&'=') = chars.peek() {
                    tokens.push(Token::NotEqual);
                    chars.next();
                } else {
                    return Err("unexpected character: !".to_string());
                }
            }
            '\'' => {
                chars.next();
                let s = read_string(&mut chars, '\'')?;
                tokens.push(Token::StringLiteral(s));
            }
            '"' => {
                chars.next();
                let s = read_string(&mut chars, '"')?;
                tokens.push(Token::StringLiteral(s));
            }
            _ if ch.is_ascii_digit() => {
                let num = read_number(&mut chars);
                push_number(&mut tokens, &num, false)?;
            }
            _ if ch.is_ascii_alphabetic() || ch == '_' => {
                let ident = read_identifier(&mut chars);
                tokens.push(match_keyword(&ident));
            }
            _ => return Err(format!("unexpected character: {ch}")),
        }
    }

    tokens.push(Token::Eof);
    Ok(tokens)
}

fn push_number(tokens: &mut Vec<Token>, raw: &str, negative: bool) -> Result<(), String> {
    if raw.contains('.') {
        let v: f64 = raw.parse().map_err(|_| format!("invalid float literal: {raw}"))?;
        tokens.push(Token::FloatLiteral(if negative { -v } else { v }));
    } else {
        let v: i64 = raw.parse().map_err(|_| format!("invalid integer literal: {raw}"))?;
        tokens.push(Token::Number(if negative { -v } else { v }));
    }
    Ok(())
}

fn read_identifier(chars: &mut std::iter::Peekable<std::str::Chars>) -> String {
    let mut ident = String::new();
    while let Some(&ch) = chars.peek() {
        if ch.is_ascii_alphanumeric() || ch == '_' {
            ident.push(ch);
            chars.next();
        } else {
            break;
        }
    }
    ident
}

fn read_number(chars: &mut std::iter::Peekable<std::str::Chars>) -> String {
    let mut num = String::new();
    let mut has_dot = false;
    while let Some(&ch) = chars.peek() {
        if ch.is_ascii_digit() {
            num.push(ch);
            chars.next();
        } else if ch == '.' && !has_dot {
            has_dot = true;
            num.push(ch);
            chars.next();
        } else {
            break;
        }
    }
    num
}

fn read_string(chars: &mut std::iter::Peekable<std::str::Chars>, delimiter: char) -> Result<String, String> {
    let mut s = String::new();
    let mut escaped = false;
    while let Some(&ch) = chars.peek() {
        chars.next();
        if escaped {
            s.push(ch);
            escaped = false;
        } else if ch == '\\' {
            escaped = true;
        } else if ch == delimiter {
            return Ok(s);
        } else {
            s.push(ch);
        }
    }
    Err("unterminated string literal".to_string())
}

fn match_keyword(ident: &str) -> Token {
    match ident.to_uppercase().as_str() {
        "SELECT" => Token::Select,
        "FROM" => Token::From,
        "WHERE" => Token::Where,
        "INSERT" => Token::Insert,
        "INTO" => Token::Into,
        "VALUES" => Token::Values,
        "CREATE" => Token::Create,
        "DROP" => Token::Drop,
        "SHOW" => Token::Show,
        "USE" => Token::Use,
        "DATABASE" => Token::Database,
        "DATABASES" => Token::Databases,
        "TABLE" => Token::Table,
        "TABLES" => Token::Tables,
        "DESCRIBE" => Token::Describe,
        "PRIMARY" => Token::Primary,
        "FOREIGN" => Token::Foreign,
        "KEY" => Token::Key,
        "REFERENCES" => Token::References,
        "UNIQUE" => Token::Unique,
        "INDEX" => Token::Index,
        "NOT" => Token::Not,
        "NULL" => Token::Null,
        "DEFAULT" => Token::Default,
        "AND" => Token::And,
        "INT" | "INTEGER" => Token::Int,
        "FLOAT" => Token::Float,
        "VARCHAR" => Token::Varchar,
        _ => Token::Identifier(ident.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokenizes_a_create_table_statement() {
        let tokens = tokenize("CREATE TABLE students (id INT NOT NULL, name VARCHAR(20));").unwrap();
        assert_eq!(tokens[0], Token::Create);
        assert_eq!(tokens[1], Token::Table);
        assert_eq!(tokens[2], Token::Identifier("students".into()));
        assert!(tokens.contains(&Token::Varchar));
        assert_eq!(*tokens.last().unwrap(), Token::Eof);
    }

    #[test]
    fn tokenizes_negative_and_float_numbers() {
        let tokens = tokenize("WHERE age >= -5 AND score = 3.5").unwrap();
        assert!(tokens.contains(&Token::Number(-5)));
        assert!(tokens.contains(&Token::FloatLiteral(3.5)));
    }

    #[test]
    fn rejects_unterminated_string_literal() {
        assert!(tokenize("SELECT * FROM t WHERE name = 'ada").is_err());
    }
}
