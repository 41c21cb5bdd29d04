//! Table-reference scan for the database façade.
//!
//! A tokenizer plus a handful of keyword rules, not a SQL parser. It
//! errs toward reporting more tables than a statement touches, and it
//! reports `unresolved` whenever a reference keyword is not followed by
//! something it can name, so callers can deny instead of guessing.

/// What a SQL statement needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementKind {
    Read,
    Write,
    Execute,
}

impl StatementKind {
    /// Classifies by leading keyword. A `WITH` statement is a write if
    /// any part of it modifies data, otherwise a read if its main
    /// statement is a `SELECT`.
    pub fn classify(sql: &str) -> Self {
        let tokens = tokenize(sql);
        let Some(Token::Word(first)) = tokens.first() else {
            return StatementKind::Execute;
        };
        let first = first.to_ascii_uppercase();
        if first != "WITH" {
            return match first.as_str() {
                "SELECT" | "EXPLAIN" | "SHOW" => StatementKind::Read,
                "INSERT" | "UPDATE" | "DELETE" | "REPLACE" | "MERGE" | "UPSERT" => {
                    StatementKind::Write
                }
                // DDL, procedures and anything unrecognized.
                _ => StatementKind::Execute,
            };
        }

        let mut depth = 0usize;
        let mut main = StatementKind::Execute;
        for (i, token) in tokens.iter().enumerate() {
            match token {
                Token::Open => depth += 1,
                Token::Close => depth = depth.saturating_sub(1),
                Token::Word(word) => {
                    let upper = word.to_ascii_uppercase();
                    let modifies = match upper.as_str() {
                        "INSERT" | "DELETE" | "MERGE" => true,
                        "UPDATE" => !row_lock(&tokens, i),
                        _ => false,
                    };
                    if modifies {
                        return StatementKind::Write;
                    }
                    if depth == 0 && upper == "SELECT" {
                        main = StatementKind::Read;
                    }
                }
                _ => {}
            }
        }
        main
    }
}

/// `SELECT … FOR UPDATE` and `ON CONFLICT DO UPDATE` name no table.
fn row_lock(tokens: &[Token], update: usize) -> bool {
    let prev = update.checked_sub(1).and_then(|p| tokens.get(p));
    word_is(prev, "FOR") || word_is(prev, "DO")
}

/// Keywords followed by a table reference.
const REFERENCE_KEYWORDS: &[&str] = &["FROM", "JOIN", "INTO", "UPDATE", "TABLE"];

/// Keywords that end a `FROM a, b` list and can never be a table name.
const CLAUSE_KEYWORDS: &[&str] = &[
    "WHERE", "JOIN", "INNER", "LEFT", "RIGHT", "FULL", "CROSS", "OUTER", "NATURAL", "ON",
    "USING", "GROUP", "ORDER", "HAVING", "LIMIT", "OFFSET", "UNION", "EXCEPT", "INTERSECT",
    "WINDOW", "RETURNING", "FETCH", "FOR", "SET", "VALUES", "SELECT", "FROM", "INTO", "WITH",
    "LATERAL", "AS", "DEFAULT",
];

fn is_clause(word: &str) -> bool {
    CLAUSE_KEYWORDS.iter().any(|k| k.eq_ignore_ascii_case(word))
}

/// `AS` introduces an alias inside a list; every other clause keyword
/// ends it.
fn ends_list(word: &str) -> bool {
    is_clause(word) && !word.eq_ignore_ascii_case("AS")
}

/// Result of a table scan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableScan {
    /// Every referenced table, in order of first appearance. CTE names are
    /// left out.
    pub tables: Vec<String>,
    /// Tables the statement writes to: `INTO`/`UPDATE` targets and the
    /// table after `DELETE FROM`, at any nesting depth.
    pub targets: Vec<String>,
    /// A reference keyword was followed by something that is not a name.
    pub unresolved: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Word(String),
    Quoted(String),
    Comma,
    Dot,
    Open,
    Close,
    Other,
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '$'
}

fn tokenize(sql: &str) -> Vec<Token> {
    let chars: Vec<char> = sql.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    let quoted = |i: usize, close: char| -> (String, usize) {
        let mut j = i + 1;
        let mut name = String::new();
        while j < chars.len() {
            if chars[j] == close {
                // Doubled closing quote is an escaped quote.
                if chars.get(j + 1) == Some(&close) && close != ']' {
                    name.push(close);
                    j += 2;
                    continue;
                }
                return (name, j + 1);
            }
            name.push(chars[j]);
            j += 1;
        }
        (name, j)
    };

    while i < chars.len() {
        let c = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '-' if chars.get(i + 1) == Some(&'-') => {
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                }
            }
            '/' if chars.get(i + 1) == Some(&'*') => {
                i += 2;
                while i < chars.len() && !(chars[i] == '*' && chars.get(i + 1) == Some(&'/')) {
                    i += 1;
                }
                i += 2;
            }
            '\'' => {
                let (_, next) = quoted(i, '\'');
                tokens.push(Token::Other);
                i = next;
            }
            '"' | '`' | '[' => {
                let close = match c {
                    '[' => ']',
                    other => other,
                };
                let (name, next) = quoted(i, close);
                tokens.push(Token::Quoted(name));
                i = next;
            }
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            '.' => {
                tokens.push(Token::Dot);
                i += 1;
            }
            '(' => {
                tokens.push(Token::Open);
                i += 1;
            }
            ')' => {
                tokens.push(Token::Close);
                i += 1;
            }
            c if is_word_char(c) => {
                let start = i;
                while i < chars.len() && is_word_char(chars[i]) {
                    i += 1;
                }
                tokens.push(Token::Word(chars[start..i].iter().collect()));
            }
            _ => {
                tokens.push(Token::Other);
                i += 1;
            }
        }
    }
    tokens
}

/// Reads a possibly qualified name (`a`, `"a"`, `a.b`) at `i`.
fn name_at(tokens: &[Token], mut i: usize) -> Option<(String, usize)> {
    let part = |token: Option<&Token>| match token {
        Some(Token::Word(w)) if !is_clause(w) => Some(w.clone()),
        Some(Token::Quoted(q)) if !q.is_empty() => Some(q.clone()),
        _ => None,
    };
    let mut name = part(tokens.get(i))?;
    i += 1;
    while tokens.get(i) == Some(&Token::Dot) {
        let Some(next) = part(tokens.get(i + 1)) else {
            break;
        };
        name.push('.');
        name.push_str(&next);
        i += 2;
    }
    Some((name, i))
}

fn word_is(token: Option<&Token>, keyword: &str) -> bool {
    matches!(token, Some(Token::Word(w)) if w.eq_ignore_ascii_case(keyword))
}

/// Scans `sql` for table references.
pub fn scan_tables(sql: &str) -> TableScan {
    let tokens = tokenize(sql);
    let ctes = cte_names(&tokens);
    let mut scan = TableScan::default();
    let mut depth = 0usize;
    // Depths with an open `FROM a, b` list.
    let mut from_lists: Vec<usize> = Vec::new();

    let push = |scan: &mut TableScan, name: String, target: bool| {
        if ctes.iter().any(|c| c.eq_ignore_ascii_case(&name)) {
            return;
        }
        if target && !scan.targets.iter().any(|t| t.eq_ignore_ascii_case(&name)) {
            scan.targets.push(name.clone());
        }
        if !scan.tables.iter().any(|t| t.eq_ignore_ascii_case(&name)) {
            scan.tables.push(name);
        }
    };

    let mut i = 0;
    while i < tokens.len() {
        match &tokens[i] {
            Token::Open => depth += 1,
            Token::Close => {
                depth = depth.saturating_sub(1);
                from_lists.retain(|d| *d <= depth);
            }
            Token::Comma if from_lists.last() == Some(&depth) => match tokens.get(i + 1) {
                Some(Token::Open) => {}
                _ => match name_at(&tokens, i + 1) {
                    Some((name, next)) => {
                        push(&mut scan, name, false);
                        i = next;
                        continue;
                    }
                    None => scan.unresolved = true,
                },
            },
            Token::Word(word) => {
                if from_lists.last() == Some(&depth) && ends_list(word) {
                    from_lists.pop();
                }
                let upper = word.to_ascii_uppercase();
                if !REFERENCE_KEYWORDS.contains(&upper.as_str()) {
                    i += 1;
                    continue;
                }
                if upper == "UPDATE" && row_lock(&tokens, i) {
                    i += 1;
                    continue;
                }
                let prev = i.checked_sub(1).and_then(|p| tokens.get(p));
                let target = upper == "INTO"
                    || upper == "UPDATE"
                    || (upper == "FROM" && word_is(prev, "DELETE"));
                if upper == "FROM" {
                    from_lists.push(depth);
                }
                match tokens.get(i + 1) {
                    Some(Token::Open) => {}
                    _ => match name_at(&tokens, i + 1) {
                        Some((name, next)) => {
                            push(&mut scan, name, target);
                            i = next;
                            continue;
                        }
                        None => scan.unresolved = true,
                    },
                }
            }
            _ => {}
        }
        i += 1;
    }
    scan
}

/// Names defined by a leading `WITH [RECURSIVE] name [(cols)] AS (…), …`.
fn cte_names(tokens: &[Token]) -> Vec<String> {
    let mut names = Vec::new();
    if !word_is(tokens.first(), "WITH") {
        return names;
    }
    let mut i = 1;
    if word_is(tokens.get(i), "RECURSIVE") {
        i += 1;
    }
    loop {
        let Some((name, mut next)) = name_at(tokens, i) else {
            break;
        };
        if tokens.get(next) == Some(&Token::Open) {
            next = skip_group(tokens, next);
        }
        if !word_is(tokens.get(next), "AS") {
            break;
        }
        next += 1;
        // `AS [NOT] MATERIALIZED (`
        while word_is(tokens.get(next), "NOT") || word_is(tokens.get(next), "MATERIALIZED") {
            next += 1;
        }
        if tokens.get(next) != Some(&Token::Open) {
            break;
        }
        names.push(name);
        next = skip_group(tokens, next);
        if tokens.get(next) != Some(&Token::Comma) {
            break;
        }
        i = next + 1;
    }
    names
}

/// Index just past the group opened at `open`.
fn skip_group(tokens: &[Token], open: usize) -> usize {
    let mut depth = 0usize;
    for (offset, token) in tokens[open..].iter().enumerate() {
        match token {
            Token::Open => depth += 1,
            Token::Close => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return open + offset + 1;
                }
            }
            _ => {}
        }
    }
    tokens.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tables(sql: &str) -> Vec<String> {
        scan_tables(sql).tables
    }

    #[test]
    fn test_classify() {
        assert_eq!(StatementKind::classify("  select 1"), StatementKind::Read);
        assert_eq!(StatementKind::classify("DELETE FROM t"), StatementKind::Write);
        assert_eq!(StatementKind::classify("DROP TABLE t"), StatementKind::Execute);
        assert_eq!(StatementKind::classify(""), StatementKind::Execute);
    }

    #[test]
    fn test_classify_with_uses_main_statement() {
        assert_eq!(
            StatementKind::classify("WITH x AS (SELECT 1) DELETE FROM users"),
            StatementKind::Write
        );
        assert_eq!(
            StatementKind::classify("with recursive t(n) as (select 1) update users set n = 1"),
            StatementKind::Write
        );
        assert_eq!(
            StatementKind::classify("WITH a AS (DELETE FROM x RETURNING *) SELECT * FROM a"),
            StatementKind::Write
        );
        assert_eq!(
            StatementKind::classify("WITH a AS (SELECT * FROM t FOR UPDATE) SELECT * FROM a"),
            StatementKind::Read
        );
        assert_eq!(StatementKind::classify("WITH a AS (SELECT 1)"), StatementKind::Execute);
    }

    #[test]
    fn test_plain_references() {
        assert_eq!(
            tables("SELECT * FROM users u JOIN orders o ON o.user_id = u.id"),
            vec!["users", "orders"]
        );
        assert_eq!(tables("insert into audit.log (a) values (1)"), vec!["audit.log"]);
        assert_eq!(tables("UPDATE users SET name = 'x FROM secrets'"), vec!["users"]);
        assert!(tables("SELECT 1").is_empty());
    }

    #[test]
    fn test_comma_lists() {
        assert_eq!(tables("SELECT * FROM users, secrets"), vec!["users", "secrets"]);
        assert_eq!(
            tables("SELECT * FROM users AS u, orders o, secrets WHERE u.id IN (1, 2)"),
            vec!["users", "orders", "secrets"]
        );
        assert_eq!(
            tables("SELECT * FROM (SELECT * FROM a) x, b"),
            vec!["a", "b"]
        );
    }

    #[test]
    fn test_quoted_identifiers() {
        assert_eq!(tables("SELECT * FROM \"secrets\""), vec!["secrets"]);
        assert_eq!(tables("SELECT * FROM `secrets`"), vec!["secrets"]);
        assert_eq!(tables("SELECT * FROM [dbo].[secrets]"), vec!["dbo.secrets"]);
        assert_eq!(tables("SELECT * FROM users, \"secrets\""), vec!["users", "secrets"]);
    }

    #[test]
    fn test_targets_and_ctes() {
        let scan = scan_tables("WITH x AS (SELECT * FROM users) DELETE FROM orders");
        assert_eq!(scan.tables, vec!["users", "orders"]);
        assert_eq!(scan.targets, vec!["orders"]);

        let scan = scan_tables("INSERT INTO logs SELECT * FROM users");
        assert_eq!(scan.targets, vec!["logs"]);

        let scan = scan_tables("WITH gone AS (DELETE FROM users RETURNING id) SELECT * FROM gone");
        assert_eq!(scan.tables, vec!["users"]);
        assert_eq!(scan.targets, vec!["users"]);

        let scan = scan_tables("SELECT * FROM users FOR UPDATE");
        assert!(scan.targets.is_empty());
        assert!(!scan.unresolved);
    }

    #[test]
    fn test_unresolved_reference() {
        assert!(scan_tables("SELECT * FROM").unresolved);
        assert!(scan_tables("SELECT * FROM WHERE").unresolved);
        assert!(scan_tables("SELECT * FROM users, ").unresolved);
        assert!(!scan_tables("SELECT * FROM users").unresolved);
    }
}
