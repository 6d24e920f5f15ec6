//! Splits a raw SQL text blob into typed, ordered statements.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatementType {
    Select,
    Insert,
    Update,
    Delete,
    CreateDatabase,
    DropDatabase,
    CreateTable,
    CreateView,
    CreateTrigger,
    Explain,
    Unknown,
}

impl StatementType {
    pub fn as_command(&self) -> &'static str {
        match self {
            StatementType::Select => "SELECT",
            StatementType::Insert => "INSERT",
            StatementType::Update => "UPDATE",
            StatementType::Delete => "DELETE",
            StatementType::CreateDatabase => "CREATE_DATABASE",
            StatementType::DropDatabase => "DROP_DATABASE",
            StatementType::CreateTable => "CREATE_TABLE",
            StatementType::CreateView => "CREATE_VIEW",
            StatementType::CreateTrigger => "CREATE_TRIGGER",
            StatementType::Explain => "EXPLAIN",
            StatementType::Unknown => "UNKNOWN",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Statement {
    pub kind: StatementType,
    pub text: String,
}

/// Strip `--` line comments and `/* */` block comments from SQL text.
fn strip_comments(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();
    let mut in_single_quote = false;
    let mut in_double_quote = false;

    while let Some(c) = chars.next() {
        if in_single_quote {
            out.push(c);
            if c == '\'' {
                in_single_quote = false;
            }
            continue;
        }
        if in_double_quote {
            out.push(c);
            if c == '"' {
                in_double_quote = false;
            }
            continue;
        }
        match c {
            '\'' => {
                in_single_quote = true;
                out.push(c);
            }
            '"' => {
                in_double_quote = true;
                out.push(c);
            }
            '-' if chars.peek() == Some(&'-') => {
                chars.next();
                for c2 in chars.by_ref() {
                    if c2 == '\n' {
                        out.push('\n');
                        break;
                    }
                }
            }
            '/' if chars.peek() == Some(&'*') => {
                chars.next();
                let mut prev = '\0';
                for c2 in chars.by_ref() {
                    if prev == '*' && c2 == '/' {
                        break;
                    }
                    prev = c2;
                }
            }
            _ => out.push(c),
        }
    }
    out
}

/// Split a comment-stripped blob on top-level `;` (outside quotes).
fn split_statements(input: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut in_single_quote = false;
    let mut in_double_quote = false;

    for c in input.chars() {
        match c {
            '\'' if !in_double_quote => {
                in_single_quote = !in_single_quote;
                current.push(c);
            }
            '"' if !in_single_quote => {
                in_double_quote = !in_double_quote;
                current.push(c);
            }
            ';' if !in_single_quote && !in_double_quote => {
                parts.push(std::mem::take(&mut current));
            }
            _ => current.push(c),
        }
    }
    if !current.trim().is_empty() {
        parts.push(current);
    }
    parts
}

fn classify(text: &str) -> StatementType {
    let trimmed = text.trim_start();
    let mut words = trimmed.split_whitespace();
    let first = words.next().unwrap_or("").to_ascii_uppercase();
    let second = words.next().unwrap_or("").to_ascii_uppercase();

    match first.as_str() {
        "SELECT" | "WITH" => StatementType::Select,
        "INSERT" => StatementType::Insert,
        "UPDATE" => StatementType::Update,
        "DELETE" => StatementType::Delete,
        "EXPLAIN" => StatementType::Explain,
        "CREATE" => match second.as_str() {
            "DATABASE" | "SCHEMA" | "KEYSPACE" => StatementType::CreateDatabase,
            "TABLE" => StatementType::CreateTable,
            "VIEW" => StatementType::CreateView,
            "TRIGGER" => StatementType::CreateTrigger,
            _ => StatementType::Unknown,
        },
        "DROP" => match second.as_str() {
            "DATABASE" | "SCHEMA" | "KEYSPACE" => StatementType::DropDatabase,
            _ => StatementType::Unknown,
        },
        _ => StatementType::Unknown,
    }
}

/// Classify a raw SQL blob into an ordered list of typed statements.
pub fn identify_statements(input: &str) -> Vec<Statement> {
    let stripped = strip_comments(input);
    split_statements(&stripped)
        .into_iter()
        .filter(|s| !s.trim().is_empty())
        .map(|text| {
            let kind = classify(&text);
            Statement {
                kind,
                text: text.trim().to_string(),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_input_yields_empty_list() {
        assert!(identify_statements("").is_empty());
        assert!(identify_statements("   \n  ").is_empty());
    }

    #[test]
    fn classifies_basic_statements() {
        let stmts = identify_statements(
            "select * from users; INSERT INTO roles (name) values ('a'); drop table foo;",
        );
        assert_eq!(stmts.len(), 3);
        assert_eq!(stmts[0].kind, StatementType::Select);
        assert_eq!(stmts[1].kind, StatementType::Insert);
        assert_eq!(stmts[2].kind, StatementType::Unknown);
    }

    #[test]
    fn strips_line_and_block_comments_before_classifying() {
        let stmts = identify_statements(
            "-- a leading comment\n/* block */ select 1; create table t (id int);",
        );
        assert_eq!(stmts.len(), 2);
        assert_eq!(stmts[0].kind, StatementType::Select);
        assert_eq!(stmts[1].kind, StatementType::CreateTable);
    }

    #[test]
    fn unrecognized_keyword_is_unknown_not_fatal() {
        let stmts = identify_statements("vacuum full;");
        assert_eq!(stmts.len(), 1);
        assert_eq!(stmts[0].kind, StatementType::Unknown);
    }

    #[test]
    fn semicolons_inside_string_literals_do_not_split() {
        let stmts = identify_statements("insert into t (v) values ('a;b'); select 1;");
        assert_eq!(stmts.len(), 2);
    }

    #[test]
    fn multi_statement_insert_batch_yields_one_statement_per_insert() {
        let stmts = identify_statements(
            "insert into users (username,email,password) values ('u','u@h','x'); \
             insert into roles (name) values ('m');",
        );
        assert_eq!(stmts.len(), 2);
        assert_eq!(stmts[0].kind, StatementType::Insert);
        assert_eq!(stmts[1].kind, StatementType::Insert);
    }
}
