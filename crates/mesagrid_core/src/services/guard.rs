//! Static classification of SQL text before execution.
//!
//! A lexical scan, not a parser: comments, string literals, quoted
//! identifiers and dollar-quoted bodies are skipped, parentheses are tracked so
//! only top-level keywords count. When in doubt the scan leans towards
//! reporting a statement as destructive.

use crate::models::{Classification, DestructiveKind, EngineType, StatementKind};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    /// Unquoted word, uppercased
    Word(String),
    Open,
    Close,
    Semi,
    /// Literal, quoted identifier, operator or parameter
    Other,
}

#[derive(Debug, Clone)]
struct Spanned {
    token: Token,
    start: usize,
    depth: usize,
}

struct Lexer<'a> {
    src: &'a str,
    bytes: &'a [u8],
    pos: usize,
    engine: EngineType,
}

impl<'a> Lexer<'a> {
    fn new(src: &'a str, engine: EngineType) -> Self {
        Self { src, bytes: src.as_bytes(), pos: 0, engine }
    }

    fn peek(&self, offset: usize) -> Option<u8> {
        self.bytes.get(self.pos + offset).copied()
    }

    fn tokens(mut self) -> Vec<Spanned> {
        let mut out = Vec::new();
        let mut depth = 0usize;
        let mut executable = false;

        while let Some(b) = self.peek(0) {
            let start = self.pos;
            let token = match b {
                b if b.is_ascii_whitespace() => {
                    self.pos += 1;
                    continue;
                }
                b'-' if self.starts_line_comment() => {
                    self.skip_line();
                    continue;
                }
                b'#' if self.engine == EngineType::Mysql => {
                    self.skip_line();
                    continue;
                }
                b'/' if self.engine == EngineType::Mysql
                    && self.peek(1) == Some(b'*')
                    && self.peek(2) == Some(b'!') =>
                {
                    self.enter_executable_comment();
                    executable = true;
                    continue;
                }
                b'*' if executable && self.peek(1) == Some(b'/') => {
                    self.pos += 2;
                    executable = false;
                    continue;
                }
                b'/' if self.peek(1) == Some(b'*') => {
                    self.skip_block_comment();
                    continue;
                }
                b'\'' => {
                    self.skip_quoted(b'\'', self.engine == EngineType::Mysql);
                    Token::Other
                }
                b'"' => {
                    self.skip_quoted(b'"', self.engine == EngineType::Mysql);
                    Token::Other
                }
                b'`' if self.engine == EngineType::Mysql => {
                    self.skip_quoted(b'`', false);
                    Token::Other
                }
                b'$' if self.engine == EngineType::Postgres => {
                    self.skip_dollar();
                    Token::Other
                }
                b'(' => {
                    self.pos += 1;
                    depth += 1;
                    out.push(Spanned { token: Token::Open, start, depth });
                    continue;
                }
                b')' => {
                    self.pos += 1;
                    out.push(Spanned { token: Token::Close, start, depth });
                    depth = depth.saturating_sub(1);
                    continue;
                }
                b';' => {
                    self.pos += 1;
                    Token::Semi
                }
                b if is_word_byte(b) => {
                    while self.peek(0).is_some_and(is_word_byte) {
                        self.pos += 1;
                    }
                    let word = &self.src[start..self.pos];
                    if word.eq_ignore_ascii_case("E") && self.peek(0) == Some(b'\'') {
                        self.skip_quoted(b'\'', true);
                        Token::Other
                    } else {
                        Token::Word(word.to_ascii_uppercase())
                    }
                }
                _ => {
                    self.pos += 1;
                    Token::Other
                }
            };
            out.push(Spanned { token, start, depth });
        }
        out
    }

    fn skip_line(&mut self) {
        while let Some(b) = self.peek(0) {
            self.pos += 1;
            if b == b'\n' {
                break;
            }
        }
    }

    /// Postgres block comments nest; MySQL ones end at the first `*/`.
    fn skip_block_comment(&mut self) {
        self.pos += 2;
        let nests = self.engine == EngineType::Postgres;
        let mut nesting = 1;
        while nesting > 0 {
            match (self.peek(0), self.peek(1)) {
                (None, _) => return,
                (Some(b'*'), Some(b'/')) => {
                    nesting -= 1;
                    self.pos += 2;
                }
                (Some(b'/'), Some(b'*')) if nests => {
                    nesting += 1;
                    self.pos += 2;
                }
                _ => self.pos += 1,
            }
        }
    }

    /// MySQL runs the body of `/*! ... */` and `/*!50700 ... */`, so only the
    /// markers are skipped.
    fn enter_executable_comment(&mut self) {
        self.pos += 3;
        while self.peek(0).is_some_and(|b| b.is_ascii_digit()) {
            self.pos += 1;
        }
    }

    /// MySQL needs whitespace or a control character after `--`.
    fn starts_line_comment(&self) -> bool {
        if self.peek(1) != Some(b'-') {
            return false;
        }
        match self.engine {
            EngineType::Postgres => true,
            EngineType::Mysql => self.peek(2).map_or(true, |b| b.is_ascii_whitespace() || b.is_ascii_control()),
        }
    }

    /// Skip a quoted run; a doubled quote is an escaped quote.
    fn skip_quoted(&mut self, quote: u8, backslash_escapes: bool) {
        self.pos += 1;
        while let Some(b) = self.peek(0) {
            self.pos += 1;
            if backslash_escapes && b == b'\\' {
                self.pos += 1;
            } else if b == quote {
                if self.peek(0) == Some(quote) {
                    self.pos += 1;
                } else {
                    return;
                }
            }
        }
    }

    /// `$tag$ ... $tag$` bodies; a bare `$1` parameter is a single token.
    fn skip_dollar(&mut self) {
        let tag_start = self.pos;
        let mut end = self.pos + 1;
        while self.bytes.get(end).is_some_and(|b| b.is_ascii_alphanumeric() || *b == b'_') {
            end += 1;
        }
        let is_tag = self.bytes.get(end) == Some(&b'$')
            && !self.bytes.get(tag_start + 1).is_some_and(u8::is_ascii_digit);
        if !is_tag {
            self.pos = end;
            return;
        }

        let tag = &self.src[tag_start..=end];
        self.pos = end + 1;
        match self.src[self.pos..].find(tag) {
            Some(offset) => self.pos += offset + tag.len(),
            None => self.pos = self.bytes.len(),
        }
    }
}

fn is_word_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_' || b >= 0x80
}

/// One statement's tokens with depth relative to the statement.
struct Statement<'a> {
    text: &'a str,
    tokens: Vec<Spanned>,
}

/// Verbs that may follow a `WITH` prefix.
const MAIN_VERBS: &[&str] = &["SELECT", "INSERT", "UPDATE", "DELETE", "MERGE"];

/// Statements `EXPLAIN` accepts; under `ANALYZE` they really run.
const EXPLAINABLE: &[&str] = &[
    "SELECT", "INSERT", "UPDATE", "DELETE", "MERGE", "WITH", "VALUES", "TABLE", "EXECUTE", "CREATE",
    "DECLARE", "REPLACE",
];

/// Tokens read as one statement whose own keywords sit at `depth`.
///
/// A whole statement is the segment at depth 0. A parenthesized body, such as
/// a CTE, is the segment at the depth of its parenthesis.
#[derive(Clone, Copy)]
struct Segment<'s> {
    tokens: &'s [Spanned],
    depth: usize,
}

impl<'s> Segment<'s> {
    /// This segment's own words in order, with their token index.
    fn words(self) -> impl Iterator<Item = (usize, &'s str)> {
        let depth = self.depth;
        self.tokens.iter().enumerate().filter_map(move |(i, t)| match &t.token {
            Token::Word(w) if t.depth == depth => Some((i, w.as_str())),
            _ => None,
        })
    }

    /// Keyword that decides the kind, resolving `WITH` prefixes.
    fn verb(self) -> Option<(usize, &'s str)> {
        let mut words = self.words();
        let (idx, first) = words.next()?;
        if first != "WITH" {
            return Some((idx, first));
        }
        words.find(|(_, w)| MAIN_VERBS.contains(w))
    }

    fn has_after(self, from: usize, keywords: &[&str]) -> bool {
        self.words().any(|(i, w)| i > from && keywords.contains(&w))
    }

    /// Every parenthesized body inside the segment, nested ones included.
    fn groups(self) -> impl Iterator<Item = Segment<'s>> {
        let tokens = self.tokens;
        tokens.iter().enumerate().filter(|(_, t)| t.token == Token::Open).map(move |(i, open)| {
            let body = &tokens[i + 1..];
            let end = body
                .iter()
                .position(|t| t.token == Token::Close && t.depth == open.depth)
                .unwrap_or(body.len());
            Segment { tokens: &body[..end], depth: open.depth }
        })
    }

    fn destructive(self) -> Option<DestructiveKind> {
        let (idx, verb) = self.verb()?;
        match verb {
            "DROP" => Some(DestructiveKind::Drop),
            "TRUNCATE" => Some(DestructiveKind::Truncate),
            "DELETE" if !self.has_after(idx, &["WHERE"]) => Some(DestructiveKind::DeleteWithoutWhere),
            "UPDATE" if !self.has_after(idx, &["WHERE"]) => Some(DestructiveKind::UpdateWithoutWhere),
            "ALTER" if self.has_after(idx, &["DROP", "MODIFY", "CHANGE", "TYPE"]) => {
                Some(DestructiveKind::AlterDestructive)
            }
            "EXPLAIN" | "DESCRIBE" | "DESC" => self.analyzed(idx)?.destructive(),
            _ => None,
        }
    }

    /// The statement an `EXPLAIN ANALYZE` executes, if this is one.
    fn analyzed(self, explain: usize) -> Option<Segment<'s>> {
        let (inner, _) = self.words().find(|(i, w)| *i > explain && EXPLAINABLE.contains(w))?;
        let analyze = self.tokens[explain + 1..inner]
            .iter()
            .any(|t| matches!(&t.token, Token::Word(w) if w == "ANALYZE" || w == "ANALYSE"));
        analyze.then(|| Segment { tokens: &self.tokens[inner..], depth: self.depth })
    }

    /// Data-modifying kind of a body such as `(DELETE ... RETURNING *)`.
    fn modifying_kind(self) -> Option<StatementKind> {
        match self.verb()?.1 {
            "INSERT" => Some(StatementKind::Insert),
            "UPDATE" => Some(StatementKind::Update),
            "DELETE" => Some(StatementKind::Delete),
            "MERGE" => Some(StatementKind::Other),
            _ => None,
        }
    }
}

impl Statement<'_> {
    fn segment(&self) -> Segment<'_> {
        Segment { tokens: &self.tokens, depth: 0 }
    }

    /// The statement itself decides first, then any body nested in it.
    fn classify(&self) -> Classification {
        let whole = self.segment();
        whole
            .destructive()
            .or_else(|| whole.groups().find_map(Segment::destructive))
            .map_or(Classification::Safe, Classification::Destructive)
    }

    fn kind(&self) -> StatementKind {
        let whole = self.segment();
        let kind = if self.starts_with_paren() {
            StatementKind::Select
        } else {
            match whole.verb().map(|(_, w)| w) {
                Some("SELECT" | "VALUES" | "TABLE") => StatementKind::Select,
                Some("INSERT" | "REPLACE") => StatementKind::Insert,
                Some("UPDATE") => StatementKind::Update,
                Some("DELETE") => StatementKind::Delete,
                Some("CREATE" | "ALTER" | "DROP" | "TRUNCATE" | "RENAME" | "COMMENT") => {
                    StatementKind::Ddl
                }
                _ => StatementKind::Other,
            }
        };
        if kind != StatementKind::Select {
            return kind;
        }
        // A select reading from a data-modifying CTE writes rows.
        whole.groups().find_map(Segment::modifying_kind).unwrap_or(kind)
    }

    fn starts_with_paren(&self) -> bool {
        self.tokens.first().is_some_and(|t| t.token == Token::Open)
    }
}

fn statements(sql: &str, engine: EngineType) -> Vec<Statement<'_>> {
    let tokens = Lexer::new(sql, engine).tokens();
    let mut out = Vec::new();
    let mut current = Vec::new();
    let mut start = 0;

    for spanned in tokens {
        if spanned.token == Token::Semi && spanned.depth == 0 {
            if !current.is_empty() {
                out.push(Statement { text: &sql[start..spanned.start], tokens: std::mem::take(&mut current) });
            }
            start = spanned.start + 1;
        } else {
            current.push(spanned);
        }
    }
    if !current.is_empty() {
        out.push(Statement { text: &sql[start..], tokens: current });
    }
    out
}

/// Classify SQL text. With several statements the first destructive one wins.
pub fn classify(sql: &str, engine: EngineType) -> Classification {
    statements(sql, engine)
        .iter()
        .map(Statement::classify)
        .find(Classification::is_destructive)
        .unwrap_or(Classification::Safe)
}

/// Kind of a single statement, judged by its leading keyword.
pub fn statement_kind(sql: &str, engine: EngineType) -> StatementKind {
    statements(sql, engine).first().map_or(StatementKind::Other, Statement::kind)
}

/// Split on top-level semicolons, dropping empty and comment-only pieces.
pub fn split_statements(sql: &str, engine: EngineType) -> Vec<&str> {
    statements(sql, engine).into_iter().map(|s| s.text.trim()).collect()
}
