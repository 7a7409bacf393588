//! Table-level access checks for restricted callers.
//!
//! The default mode is advisory: restrictions are only communicated to
//! the model through its instructions. [`AccessMode::Enforced`] additionally
//! lexes each query and refuses tables outside the allow-list.

use std::fmt;
use std::str::FromStr;

use crate::sql::prompt::{Role, TableAllowList};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum AccessMode {
    #[default]
    Advisory,
    Enforced,
}

impl FromStr for AccessMode {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "advisory" => Ok(AccessMode::Advisory),
            "enforced" => Ok(AccessMode::Enforced),
            other => Err(format!(
                "unknown access mode '{other}', expected advisory or enforced"
            )),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AccessDenied {
    pub tables: Vec<String>,
}

impl fmt::Display for AccessDenied {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "access denied: restricted callers may not query {}",
            self.tables.join(", ")
        )
    }
}

impl std::error::Error for AccessDenied {}

#[derive(Clone, Debug, Default)]
pub struct AccessGate {
    mode: AccessMode,
    allow_list: TableAllowList,
}

impl AccessGate {
    pub fn new(mode: AccessMode, allow_list: TableAllowList) -> Self {
        Self { mode, allow_list }
    }

    pub fn advisory(allow_list: TableAllowList) -> Self {
        Self::new(AccessMode::Advisory, allow_list)
    }

    pub fn enforced(allow_list: TableAllowList) -> Self {
        Self::new(AccessMode::Enforced, allow_list)
    }

    pub fn mode(&self) -> AccessMode {
        self.mode
    }

    pub fn is_permitted(&self, role: Role, query: &str) -> bool {
        self.check(role, query).is_ok()
    }

    pub fn check(&self, role: Role, query: &str) -> Result<(), AccessDenied> {
        if self.mode == AccessMode::Advisory
            || role == Role::Privileged
            || self.allow_list.is_empty()
        {
            return Ok(());
        }

        let mut denied = Vec::new();
        for table in referenced_tables(query) {
            if !self.allow_list.contains(&table)
                && !denied
                    .iter()
                    .any(|seen: &String| seen.eq_ignore_ascii_case(&table))
            {
                denied.push(table);
            }
        }

        if denied.is_empty() {
            Ok(())
        } else {
            tracing::warn!(tables = ?denied, "query references tables outside the allow-list");
            Err(AccessDenied { tables: denied })
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum Token {
    Word(String),
    Quoted(String),
    Punct(char),
    Literal,
}

impl Token {
    fn is_keyword(&self, keyword: &str) -> bool {
        matches!(self, Token::Word(word) if word.eq_ignore_ascii_case(keyword))
    }

    fn is_any_keyword(&self, keywords: &[&str]) -> bool {
        keywords.iter().any(|keyword| self.is_keyword(keyword))
    }

    fn identifier(&self) -> Option<&str> {
        match self {
            Token::Word(word) if !is_reserved(word) => Some(word),
            Token::Quoted(name) => Some(name),
            _ => None,
        }
    }
}

/// A token together with the byte range it was read from.
#[derive(Clone, Debug)]
struct Lexeme {
    token: Token,
    start: usize,
    end: usize,
}

const RESERVED: &[&str] = &[
    "SELECT", "FROM", "WHERE", "JOIN", "INNER", "LEFT", "RIGHT", "FULL", "OUTER", "CROSS",
    "NATURAL", "ON", "USING", "GROUP", "ORDER", "BY", "HAVING", "LIMIT", "OFFSET", "UNION",
    "INTERSECT", "EXCEPT", "ALL", "AS", "WITH", "RECURSIVE", "LATERAL", "ONLY", "WINDOW",
    "FETCH", "FOR", "RETURNING", "SET", "VALUES", "INTO", "UPDATE", "DELETE", "INSERT", "TABLE",
    "AND", "OR", "NOT", "IS", "NULL", "CASE", "WHEN", "THEN", "ELSE", "END", "DISTINCT",
];

/// Keywords that close the from-list of the enclosing query level.
const CLAUSE_KEYWORDS: &[&str] = &[
    "WHERE", "GROUP", "HAVING", "ORDER", "LIMIT", "OFFSET", "FETCH", "FOR", "WINDOW", "UNION",
    "INTERSECT", "EXCEPT", "RETURNING", "SET", "VALUES",
];

fn is_reserved(word: &str) -> bool {
    RESERVED
        .iter()
        .any(|reserved| reserved.eq_ignore_ascii_case(word))
}

fn is_word_start(byte: u8) -> bool {
    byte.is_ascii_alphabetic() || byte == b'_' || byte >= 0x80
}

fn is_word_byte(byte: u8) -> bool {
    byte.is_ascii_alphanumeric() || byte == b'_' || byte == b'$' || byte >= 0x80
}

/// Lexes SQL the way Postgres delimits it: comments (nested block comments
/// included) are dropped, and `'...'`, `E'...'` and `$tag$...$tag$` bodies
/// collapse into a single [`Token::Literal`]. Unterminated quotes run to the
/// end of the input.
fn lex(sql: &str) -> Vec<Lexeme> {
    let bytes = sql.as_bytes();
    let mut lexemes = Vec::new();
    let mut idx = 0;

    while idx < bytes.len() {
        let start = idx;
        let token = match bytes[idx] {
            byte if byte.is_ascii_whitespace() => {
                idx += 1;
                continue;
            }
            b'-' if bytes.get(idx + 1) == Some(&b'-') => {
                idx = bytes[idx..]
                    .iter()
                    .position(|&byte| byte == b'\n')
                    .map_or(bytes.len(), |offset| idx + offset + 1);
                continue;
            }
            b'/' if bytes.get(idx + 1) == Some(&b'*') => {
                idx = skip_block_comment(bytes, idx);
                continue;
            }
            b'\'' => {
                idx = skip_string(bytes, idx + 1, false);
                Token::Literal
            }
            b'e' | b'E' if bytes.get(idx + 1) == Some(&b'\'') => {
                idx = skip_string(bytes, idx + 2, true);
                Token::Literal
            }
            b'"' => {
                let (name, next) = read_quoted_identifier(sql, idx + 1);
                idx = next;
                Token::Quoted(name)
            }
            b'$' => match dollar_tag_end(bytes, idx) {
                Some(tag_end) => {
                    idx = skip_dollar_body(bytes, tag_end, &bytes[idx..tag_end]);
                    Token::Literal
                }
                None => {
                    // Positional parameter such as `$1`.
                    idx += 1;
                    while idx < bytes.len() && bytes[idx].is_ascii_digit() {
                        idx += 1;
                    }
                    Token::Punct('$')
                }
            },
            byte if byte.is_ascii_digit() => {
                while idx < bytes.len() && (is_word_byte(bytes[idx]) || bytes[idx] == b'.') {
                    idx += 1;
                }
                Token::Literal
            }
            byte if is_word_start(byte) => {
                while idx < bytes.len() && is_word_byte(bytes[idx]) {
                    idx += 1;
                }
                Token::Word(sql[start..idx].to_string())
            }
            _ => {
                let ch = sql[idx..].chars().next().unwrap_or_default();
                idx += ch.len_utf8().max(1);
                Token::Punct(ch)
            }
        };
        lexemes.push(Lexeme {
            token,
            start,
            end: idx,
        });
    }

    lexemes
}

fn skip_block_comment(bytes: &[u8], start: usize) -> usize {
    let mut depth = 0usize;
    let mut idx = start;
    while idx < bytes.len() {
        match (bytes[idx], bytes.get(idx + 1)) {
            (b'/', Some(b'*')) => {
                depth += 1;
                idx += 2;
            }
            (b'*', Some(b'/')) => {
                depth -= 1;
                idx += 2;
                if depth == 0 {
                    return idx;
                }
            }
            _ => idx += 1,
        }
    }
    bytes.len()
}

/// Returns the index after the closing quote of a string body starting at `idx`.
fn skip_string(bytes: &[u8], mut idx: usize, backslash_escapes: bool) -> usize {
    while idx < bytes.len() {
        match bytes[idx] {
            b'\\' if backslash_escapes => idx += 2,
            b'\'' if bytes.get(idx + 1) == Some(&b'\'') => idx += 2,
            b'\'' => return idx + 1,
            _ => idx += 1,
        }
    }
    bytes.len()
}

fn read_quoted_identifier(sql: &str, mut idx: usize) -> (String, usize) {
    let bytes = sql.as_bytes();
    let mut name = String::new();
    let mut segment = idx;
    while idx < bytes.len() {
        if bytes[idx] == b'"' {
            name.push_str(&sql[segment..idx]);
            if bytes.get(idx + 1) == Some(&b'"') {
                name.push('"');
                idx += 2;
                segment = idx;
                continue;
            }
            return (name, idx + 1);
        }
        idx += 1;
    }
    name.push_str(&sql[segment..]);
    (name, bytes.len())
}

/// `$$` or `$tag$` opening at `idx`; returns the index just past the tag.
fn dollar_tag_end(bytes: &[u8], idx: usize) -> Option<usize> {
    let mut next = idx + 1;
    if bytes.get(next).is_some_and(u8::is_ascii_digit) {
        return None;
    }
    while next < bytes.len() && bytes[next] != b'$' {
        if !(bytes[next].is_ascii_alphanumeric() || bytes[next] == b'_' || bytes[next] >= 0x80) {
            return None;
        }
        next += 1;
    }
    (next < bytes.len()).then_some(next + 1)
}

fn skip_dollar_body(bytes: &[u8], from: usize, tag: &[u8]) -> usize {
    bytes[from..]
        .windows(tag.len())
        .position(|window| window == tag)
        .map_or(bytes.len(), |offset| from + offset + tag.len())
}

/// Splits a script into statements on top-level semicolons, skipping empty ones.
pub fn split_statements(sql: &str) -> Vec<String> {
    let mut statements = Vec::new();
    let mut statement_start = 0;
    let mut has_tokens = false;

    for lexeme in lex(sql) {
        if lexeme.token == Token::Punct(';') {
            if has_tokens {
                statements.push(sql[statement_start..lexeme.start].trim().to_string());
            }
            statement_start = lexeme.end;
            has_tokens = false;
        } else {
            has_tokens = true;
        }
    }

    if has_tokens {
        statements.push(sql[statement_start..].trim().to_string());
    }
    statements
}

/// Per parenthesis level: whether commas separate from-items, and whether
/// the parentheses are a function call (`EXTRACT(YEAR FROM x)`).
#[derive(Clone, Copy, Debug, Default)]
struct Level {
    from_list: bool,
    call: bool,
}

/// Table names a query reads or writes, without schema prefixes or CTE names.
pub fn referenced_tables(sql: &str) -> Vec<String> {
    let tokens = lex(sql)
        .into_iter()
        .map(|lexeme| lexeme.token)
        .collect::<Vec<_>>();
    let ctes = cte_names(&tokens);
    let mut tables: Vec<String> = Vec::new();
    let mut levels = vec![Level::default()];
    let mut expect_table = false;

    let mut idx = 0;
    while idx < tokens.len() {
        let token = &tokens[idx];
        let level = levels.len() - 1;

        match token {
            Token::Punct('(') => {
                let call = !expect_table
                    && idx > 0
                    && tokens[idx - 1].identifier().is_some();
                levels.push(Level {
                    from_list: expect_table,
                    call,
                });
            }
            Token::Punct(')') => {
                if levels.len() > 1 {
                    levels.pop();
                }
                expect_table = false;
            }
            Token::Punct(',') => expect_table = levels[level].from_list,
            _ if token.is_keyword("SELECT") => {
                levels[level] = Level::default();
                expect_table = false;
            }
            _ if token.is_keyword("FROM") => {
                if !levels[level].call {
                    levels[level].from_list = true;
                    expect_table = true;
                }
            }
            _ if token.is_keyword("JOIN") => {
                levels[level].from_list = true;
                expect_table = true;
            }
            _ if token.is_keyword("USING") => {
                // DELETE ... USING t, not JOIN ... USING (col)
                if tokens.get(idx + 1) != Some(&Token::Punct('(')) {
                    levels[level].from_list = true;
                    expect_table = true;
                }
            }
            _ if token.is_any_keyword(&["INTO", "UPDATE", "TABLE"]) => expect_table = true,
            _ if token.is_any_keyword(CLAUSE_KEYWORDS) => {
                levels[level].from_list = false;
                expect_table = false;
            }
            _ if token.is_any_keyword(&["ONLY", "LATERAL"]) => {}
            _ if expect_table => {
                if let Some((name, next)) = qualified_name(&tokens, idx) {
                    if !ctes.iter().any(|cte| cte.eq_ignore_ascii_case(&name))
                        && !tables.iter().any(|seen| seen.eq_ignore_ascii_case(&name))
                    {
                        tables.push(name);
                    }
                    expect_table = false;
                    idx = skip_alias(&tokens, next);
                    continue;
                }
                expect_table = false;
            }
            _ => {}
        }
        idx += 1;
    }

    tables
}

/// Reads `name` or `schema.name` starting at `idx`; returns the last segment.
fn qualified_name(tokens: &[Token], idx: usize) -> Option<(String, usize)> {
    let mut name = tokens.get(idx)?.identifier()?.to_string();
    let mut next = idx + 1;
    while next + 1 < tokens.len() && tokens[next] == Token::Punct('.') {
        let Some(segment) = tokens[next + 1].identifier() else {
            break;
        };
        name = segment.to_string();
        next += 2;
    }
    Some((name, next))
}

fn skip_alias(tokens: &[Token], mut idx: usize) -> usize {
    if tokens.get(idx).is_some_and(|token| token.is_keyword("AS")) {
        idx += 1;
    }
    if tokens.get(idx).is_some_and(|token| token.identifier().is_some()) {
        idx += 1;
    }
    idx
}

/// Index just past the parenthesis that closes the one at `open`.
fn skip_parens(tokens: &[Token], open: usize) -> usize {
    let mut depth = 0usize;
    for (idx, token) in tokens.iter().enumerate().skip(open) {
        match token {
            Token::Punct('(') => depth += 1,
            Token::Punct(')') => {
                depth -= 1;
                if depth == 0 {
                    return idx + 1;
                }
            }
            _ => {}
        }
    }
    tokens.len()
}

/// Names bound by `WITH [RECURSIVE] name [(cols)] AS [[NOT] MATERIALIZED] (...)`.
fn cte_names(tokens: &[Token]) -> Vec<String> {
    let mut names = Vec::new();
    let mut idx = 0;

    while idx < tokens.len() {
        if !tokens[idx].is_keyword("WITH") {
            idx += 1;
            continue;
        }
        idx += 1;
        if tokens.get(idx).is_some_and(|token| token.is_keyword("RECURSIVE")) {
            idx += 1;
        }

        while let Some(name) = tokens.get(idx).and_then(Token::identifier) {
            let mut next = idx + 1;
            if tokens.get(next) == Some(&Token::Punct('(')) {
                next = skip_parens(tokens, next);
            }
            if !tokens.get(next).is_some_and(|token| token.is_keyword("AS")) {
                break;
            }
            next += 1;
            if tokens.get(next).is_some_and(|token| token.is_keyword("NOT")) {
                next += 1;
            }
            if tokens
                .get(next)
                .is_some_and(|token| token.is_keyword("MATERIALIZED"))
            {
                next += 1;
            }
            if tokens.get(next) != Some(&Token::Punct('(')) {
                break;
            }

            names.push(name.to_string());
            idx = skip_parens(tokens, next);
            if tokens.get(idx) != Some(&Token::Punct(',')) {
                break;
            }
            idx += 1;
        }
    }

    names
}
