//! State store adapter contract and the built-in deterministic store.
//!
//! The replication engine treats all queries as opaque strings and never
//! parses them; parsing is entirely the store's business. The engine needs
//! exactly three capabilities: `execute` a write statement, `read` rows out,
//! and `check` a boolean predicate. Determinism is the store's
//! responsibility: the same sequence of `execute` calls against an empty
//! store must yield identical `read` results on every replica. Check and
//! merge queries must likewise be deterministic pure functions of the
//! current store state; this contract is documented, not enforced.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::utils::BayouError;

use serde::{Deserialize, Serialize};

/// The trivial always-true predicate in the built-in statement language.
pub const TRUE_QUERY: &str = "SELECT 1";

/// The trivial always-false predicate, used as the merge procedure of
/// writes that cannot be merged.
pub const FALSE_QUERY: &str = "SELECT 0";

/// Tagged value of one result column.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub enum ColValue {
    Int(i64),
    Text(String),
    Timestamp(i64),
    Bool(bool),
    Null,
}

impl ColValue {
    /// Boolean interpretation: non-zero integers and `true` are truthy.
    pub fn truthy(&self) -> bool {
        match self {
            ColValue::Int(v) => *v != 0,
            ColValue::Bool(b) => *b,
            _ => false,
        }
    }
}

/// One reply row: column name -> tagged value.
pub type Row = HashMap<String, ColValue>;

/// Thin contract around a relational engine. Two instances live per
/// replica: one materializing the committed prefix, one the full view.
pub trait StateStore: Send {
    /// Applies a write statement (or a `;`-chain of them). Durable on
    /// return if the store is backed by a file.
    fn execute(&mut self, stmt: &str) -> Result<(), BayouError>;

    /// Evaluates a non-mutating query, returning its result rows.
    fn read(&self, query: &str) -> Result<Vec<Row>, BayouError>;

    /// Executes the given text and interprets the first column of the first
    /// result row as a boolean; an empty result is `false`. Merge
    /// procedures, which may both mutate and report a verdict, ride through
    /// this path as `;`-chains whose last statement is the verdict query.
    fn check(&mut self, query: &str) -> Result<bool, BayouError>;

    /// Drops all contents, returning to the empty state.
    fn clear(&mut self);

    /// Saves the current contents to the backing file, if any.
    fn persist(&mut self) -> Result<(), BayouError>;
}

/// Rows are kept internally with explicit column order so that "first
/// column" is well-defined and iteration stays deterministic.
type MemRow = Vec<(String, ColValue)>;

/// Built-in deterministic table store, persisted as an rmp-serde snapshot.
///
/// Understands a small relational statement language:
///
/// ```text
/// INSERT [INTO] <table> <col>=<val>, ...
/// DELETE [FROM] <table> [WHERE <col>=<val> [AND ...]]
/// SELECT * FROM <table> [WHERE <col>=<val> [AND ...]]
/// SELECT <literal>
/// [NOT] EXISTS <table> [WHERE <col>=<val> [AND ...]]
/// ```
///
/// Values are integers, double-quoted text, `true`/`false`, `null`, or
/// `@<secs>` timestamps. Statements may be chained with `;`. Rows are
/// returned in insertion order.
pub struct MemStore {
    /// Backing snapshot file; `None` for a purely in-memory store.
    path: Option<PathBuf>,

    /// Table name -> rows in insertion order.
    tables: HashMap<String, Vec<MemRow>>,
}

impl MemStore {
    /// Opens a store backed by the given snapshot file, loading previous
    /// contents if the file exists and is non-empty.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, BayouError> {
        let path = path.as_ref().to_path_buf();
        let tables = match fs::read(&path) {
            Ok(bytes) if !bytes.is_empty() => {
                rmp_serde::decode::from_slice(&bytes)?
            }
            Ok(_) => HashMap::new(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                HashMap::new()
            }
            Err(e) => return Err(e.into()),
        };
        Ok(MemStore {
            path: Some(path),
            tables,
        })
    }

    /// Creates a purely in-memory store (used by tests).
    pub fn in_mem() -> Self {
        MemStore {
            path: None,
            tables: HashMap::new(),
        }
    }

    /// Evaluates one parsed statement, applying mutations in place. Query
    /// statements return their result rows; mutations return no rows.
    fn eval(&mut self, stmt: &Stmt) -> Result<Vec<MemRow>, BayouError> {
        match stmt {
            Stmt::Insert { table, cols } => {
                self.tables
                    .entry(table.clone())
                    .or_default()
                    .push(cols.clone());
                Ok(vec![])
            }
            Stmt::Delete { table, preds } => {
                if let Some(rows) = self.tables.get_mut(table) {
                    rows.retain(|row| !row_matches(row, preds));
                }
                Ok(vec![])
            }
            _ => self.eval_query(stmt),
        }
    }

    /// Evaluates one parsed non-mutating statement.
    fn eval_query(&self, stmt: &Stmt) -> Result<Vec<MemRow>, BayouError> {
        match stmt {
            Stmt::Select { table, preds } => Ok(self
                .tables
                .get(table)
                .map(|rows| {
                    rows.iter()
                        .filter(|row| row_matches(row, preds))
                        .cloned()
                        .collect()
                })
                .unwrap_or_default()),
            Stmt::SelectLit { name, value } => {
                Ok(vec![vec![(name.clone(), value.clone())]])
            }
            Stmt::Exists {
                table,
                preds,
                negate,
            } => {
                let found = self
                    .tables
                    .get(table)
                    .map(|rows| rows.iter().any(|row| row_matches(row, preds)))
                    .unwrap_or(false);
                let hit = found != *negate;
                Ok(vec![vec![(
                    "exists".into(),
                    ColValue::Int(i64::from(hit)),
                )]])
            }
            Stmt::Insert { .. } | Stmt::Delete { .. } => Err(BayouError::msg(
                "mutating statement where a query is expected",
            )),
        }
    }
}

impl StateStore for MemStore {
    fn execute(&mut self, stmt: &str) -> Result<(), BayouError> {
        for stmt in parse_chain(stmt)? {
            self.eval(&stmt)?;
        }
        Ok(())
    }

    fn read(&self, query: &str) -> Result<Vec<Row>, BayouError> {
        let stmts = parse_chain(query)?;
        let mut rows = vec![];
        for stmt in stmts {
            rows = self.eval_query(&stmt)?;
        }
        Ok(rows.into_iter().map(|r| r.into_iter().collect()).collect())
    }

    fn check(&mut self, query: &str) -> Result<bool, BayouError> {
        let stmts = parse_chain(query)?;
        if stmts.is_empty() {
            return Err(BayouError::msg("empty check query"));
        }
        let mut rows = vec![];
        for stmt in &stmts {
            rows = self.eval(stmt)?;
        }
        Ok(rows
            .first()
            .and_then(|row| row.first())
            .map(|(_, v)| v.truthy())
            .unwrap_or(false))
    }

    fn clear(&mut self) {
        self.tables.clear();
    }

    fn persist(&mut self) -> Result<(), BayouError> {
        if let Some(path) = &self.path {
            let bytes = rmp_serde::encode::to_vec(&self.tables)?;
            fs::write(path, bytes)?;
        }
        Ok(())
    }
}

/// True iff the row satisfies every `col = val` conjunct.
fn row_matches(row: &MemRow, preds: &MemRow) -> bool {
    preds.iter().all(|(col, val)| {
        row.iter().any(|(c, v)| c == col && v == val)
    })
}

/// One parsed statement of the built-in language.
#[derive(Debug, PartialEq)]
enum Stmt {
    Insert { table: String, cols: MemRow },
    Delete { table: String, preds: MemRow },
    Select { table: String, preds: MemRow },
    SelectLit { name: String, value: ColValue },
    Exists { table: String, preds: MemRow, negate: bool },
}

#[derive(Debug, PartialEq, Clone)]
enum Token {
    Ident(String),
    Int(i64),
    Str(String),
    Timestamp(i64),
    Comma,
    Equals,
    Semi,
    Star,
}

/// Splits query text into tokens, respecting double-quoted strings.
fn tokenize(text: &str) -> Result<Vec<Token>, BayouError> {
    let mut tokens = vec![];
    let mut chars = text.chars().peekable();
    while let Some(&ch) = chars.peek() {
        match ch {
            c if c.is_whitespace() => {
                chars.next();
            }
            ',' => {
                chars.next();
                tokens.push(Token::Comma);
            }
            '=' => {
                chars.next();
                tokens.push(Token::Equals);
            }
            ';' => {
                chars.next();
                tokens.push(Token::Semi);
            }
            '*' => {
                chars.next();
                tokens.push(Token::Star);
            }
            '"' => {
                chars.next();
                let mut s = String::new();
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some(c) => s.push(c),
                        None => {
                            return Err(BayouError::msg(
                                "unterminated string literal",
                            ))
                        }
                    }
                }
                tokens.push(Token::Str(s));
            }
            '@' => {
                chars.next();
                let num = take_int(&mut chars)?;
                tokens.push(Token::Timestamp(num));
            }
            c if c.is_ascii_digit() || c == '-' => {
                let num = take_int(&mut chars)?;
                tokens.push(Token::Int(num));
            }
            c if c.is_alphanumeric() || c == '_' => {
                let mut s = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_alphanumeric() || c == '_' {
                        s.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Ident(s));
            }
            c => {
                return Err(BayouError(format!(
                    "unexpected character '{}' in query",
                    c
                )))
            }
        }
    }
    Ok(tokens)
}

fn take_int(
    chars: &mut std::iter::Peekable<std::str::Chars>,
) -> Result<i64, BayouError> {
    let mut s = String::new();
    if chars.peek() == Some(&'-') {
        s.push('-');
        chars.next();
    }
    while let Some(&c) = chars.peek() {
        if c.is_ascii_digit() {
            s.push(c);
            chars.next();
        } else {
            break;
        }
    }
    s.parse()
        .map_err(|_| BayouError(format!("invalid integer literal '{}'", s)))
}

/// Parses a `;`-separated chain of statements.
fn parse_chain(text: &str) -> Result<Vec<Stmt>, BayouError> {
    let tokens = tokenize(text)?;
    let mut stmts = vec![];
    for chunk in tokens.split(|t| *t == Token::Semi) {
        if chunk.is_empty() {
            continue;
        }
        stmts.push(parse_stmt(chunk)?);
    }
    if stmts.is_empty() {
        return Err(BayouError::msg("empty statement"));
    }
    Ok(stmts)
}

/// Parses a single statement out of its token slice.
fn parse_stmt(tokens: &[Token]) -> Result<Stmt, BayouError> {
    let mut p = Parser { tokens, pos: 0 };
    let stmt = match p.keyword()?.as_str() {
        "insert" => {
            p.skip_keyword("into");
            let table = p.ident()?;
            let cols = p.assign_list(Some(Token::Comma))?;
            Stmt::Insert { table, cols }
        }
        "delete" => {
            p.skip_keyword("from");
            let table = p.ident()?;
            let preds = p.where_clause()?;
            Stmt::Delete { table, preds }
        }
        "select" => {
            if p.peek() == Some(&Token::Star) {
                p.next();
                p.expect_keyword("from")?;
                let table = p.ident()?;
                let preds = p.where_clause()?;
                Stmt::Select { table, preds }
            } else {
                let (name, value) = p.literal()?;
                Stmt::SelectLit { name, value }
            }
        }
        "not" => {
            p.expect_keyword("exists")?;
            let table = p.ident()?;
            let preds = p.where_clause()?;
            Stmt::Exists {
                table,
                preds,
                negate: true,
            }
        }
        "exists" => {
            let table = p.ident()?;
            let preds = p.where_clause()?;
            Stmt::Exists {
                table,
                preds,
                negate: false,
            }
        }
        kw => {
            return Err(BayouError(format!("unrecognized statement '{}'", kw)))
        }
    };
    if p.pos != p.tokens.len() {
        return Err(BayouError::msg("trailing tokens after statement"));
    }
    Ok(stmt)
}

/// Minimal cursor over a token slice.
struct Parser<'a> {
    tokens: &'a [Token],
    pos: usize,
}

impl Parser<'_> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<&Token> {
        let t = self.tokens.get(self.pos);
        self.pos += 1;
        t
    }

    /// Consumes the next token, which must be an identifier, and returns it
    /// lowercased (keywords are case-insensitive).
    fn keyword(&mut self) -> Result<String, BayouError> {
        match self.next() {
            Some(Token::Ident(s)) => Ok(s.to_lowercase()),
            other => {
                Err(BayouError(format!("expected keyword, got {:?}", other)))
            }
        }
    }

    /// Consumes the next identifier if it equals the given keyword.
    fn skip_keyword(&mut self, kw: &str) {
        if let Some(Token::Ident(s)) = self.peek() {
            if s.eq_ignore_ascii_case(kw) {
                self.pos += 1;
            }
        }
    }

    fn expect_keyword(&mut self, kw: &str) -> Result<(), BayouError> {
        match self.next() {
            Some(Token::Ident(s)) if s.eq_ignore_ascii_case(kw) => Ok(()),
            other => Err(BayouError(format!(
                "expected keyword '{}', got {:?}",
                kw, other
            ))),
        }
    }

    /// Consumes a table / column identifier (case preserved).
    fn ident(&mut self) -> Result<String, BayouError> {
        match self.next() {
            Some(Token::Ident(s)) => Ok(s.clone()),
            other => Err(BayouError(format!(
                "expected identifier, got {:?}",
                other
            ))),
        }
    }

    /// Consumes a value literal, returning its display name and value.
    fn literal(&mut self) -> Result<(String, ColValue), BayouError> {
        match self.next() {
            Some(Token::Int(v)) => Ok((v.to_string(), ColValue::Int(*v))),
            Some(Token::Str(s)) => Ok((s.clone(), ColValue::Text(s.clone()))),
            Some(Token::Timestamp(v)) => {
                Ok((format!("@{}", v), ColValue::Timestamp(*v)))
            }
            Some(Token::Ident(s)) if s.eq_ignore_ascii_case("true") => {
                Ok((s.clone(), ColValue::Bool(true)))
            }
            Some(Token::Ident(s)) if s.eq_ignore_ascii_case("false") => {
                Ok((s.clone(), ColValue::Bool(false)))
            }
            Some(Token::Ident(s)) if s.eq_ignore_ascii_case("null") => {
                Ok((s.clone(), ColValue::Null))
            }
            other => {
                Err(BayouError(format!("expected literal, got {:?}", other)))
            }
        }
    }

    /// Parses `col = val (<sep> col = val)*`; `sep` of `None` means the AND
    /// keyword.
    fn assign_list(
        &mut self,
        sep: Option<Token>,
    ) -> Result<MemRow, BayouError> {
        let mut list = vec![];
        loop {
            let col = self.ident()?;
            match self.next() {
                Some(Token::Equals) => {}
                other => {
                    return Err(BayouError(format!(
                        "expected '=', got {:?}",
                        other
                    )))
                }
            }
            let (_, value) = self.literal()?;
            list.push((col, value));

            let more = match &sep {
                Some(sep_token) => {
                    if self.peek() == Some(sep_token) {
                        self.pos += 1;
                        true
                    } else {
                        false
                    }
                }
                None => {
                    if let Some(Token::Ident(s)) = self.peek() {
                        if s.eq_ignore_ascii_case("and") {
                            self.pos += 1;
                            true
                        } else {
                            false
                        }
                    } else {
                        false
                    }
                }
            };
            if !more {
                return Ok(list);
            }
        }
    }

    /// Parses an optional `WHERE col = val (AND col = val)*` clause.
    fn where_clause(&mut self) -> Result<MemRow, BayouError> {
        if let Some(Token::Ident(s)) = self.peek() {
            if s.eq_ignore_ascii_case("where") {
                self.pos += 1;
                return self.assign_list(None);
            }
        }
        Ok(vec![])
    }
}

#[cfg(test)]
mod statestore_tests {
    use super::*;

    #[test]
    fn store_basic() -> Result<(), BayouError> {
        let mut db = MemStore::in_mem();
        db.execute(
            "INSERT INTO rooms name=\"Fine\", day=0, hour=0, end=@3600",
        )?;

        let rows = db.read("SELECT * FROM rooms")?;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["name"], ColValue::Text("Fine".into()));
        assert_eq!(rows[0]["day"], ColValue::Int(0));
        assert_eq!(rows[0]["end"], ColValue::Timestamp(3600));

        // dependency check query
        assert!(db.check("EXISTS rooms WHERE name=\"Fine\" AND day=0")?);
        assert!(!db.check("EXISTS rooms WHERE name=\"Fine\" AND day=1")?);
        assert!(db.check("NOT EXISTS rooms WHERE name=\"Frist\"")?);

        // trivial merge sentinels
        assert!(db.check(TRUE_QUERY)?);
        assert!(!db.check(FALSE_QUERY)?);
        Ok(())
    }

    #[test]
    fn store_literal_rows() -> Result<(), BayouError> {
        let db = MemStore::in_mem();
        let rows = db.read("SELECT 1")?;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["1"], ColValue::Int(1));
        Ok(())
    }

    #[test]
    fn store_delete() -> Result<(), BayouError> {
        let mut db = MemStore::in_mem();
        db.execute("INSERT rooms name=\"A\", day=1")?;
        db.execute("INSERT rooms name=\"B\", day=1")?;
        db.execute("INSERT rooms name=\"A\", day=2")?;
        db.execute("DELETE FROM rooms WHERE name=\"A\" AND day=1")?;
        let rows = db.read("SELECT * FROM rooms")?;
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["name"], ColValue::Text("B".into()));
        assert_eq!(rows[1]["name"], ColValue::Text("A".into()));
        Ok(())
    }

    #[test]
    fn store_compound_check() -> Result<(), BayouError> {
        // a merge procedure that both mutates and reports resolution
        let mut db = MemStore::in_mem();
        assert!(db.check("INSERT rooms name=\"A\"; SELECT 1")?);
        assert!(db.check("EXISTS rooms WHERE name=\"A\"")?);
        // empty result rows mean false
        assert!(!db.check("SELECT * FROM nothing")?);
        Ok(())
    }

    #[test]
    fn store_read_rejects_mutation() {
        let db = MemStore::in_mem();
        assert!(db.read("INSERT rooms name=\"A\"").is_err());
        assert!(db.read("bogus stuff").is_err());
    }

    #[test]
    fn store_insertion_order_deterministic() -> Result<(), BayouError> {
        let mut a = MemStore::in_mem();
        let mut b = MemStore::in_mem();
        for db in [&mut a, &mut b] {
            db.execute("INSERT t k=3")?;
            db.execute("INSERT t k=1")?;
            db.execute("INSERT t k=2")?;
            db.execute("DELETE t WHERE k=1")?;
        }
        assert_eq!(a.read("SELECT * FROM t")?, b.read("SELECT * FROM t")?);
        Ok(())
    }

    #[test]
    fn store_persist_reload() -> Result<(), BayouError> {
        let path = "/tmp/test-memstore-0.db";
        let _ = fs::remove_file(path);
        let mut db = MemStore::open(path)?;
        db.execute("INSERT rooms name=\"Frist\", day=1, hour=1")?;
        db.persist()?;
        drop(db);

        let db = MemStore::open(path)?;
        let rows = db.read("SELECT * FROM rooms WHERE name=\"Frist\"")?;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["day"], ColValue::Int(1));
        Ok(())
    }
}
