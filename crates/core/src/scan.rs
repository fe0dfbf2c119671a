//! Scanner: source text to nested block values
//!
//! The scanner is deliberately dumb: it knows spellings, not meanings. It
//! interns words, builds series for strings and blocks, and tags every cell
//! with its kind; binding and evaluation happen elsewhere. Line breaks set
//! the line-start flag on the following cell so molding can restore the
//! original shape.
//!
//! Errors carry line and column (both 1-based for display) and unwind any
//! series the partial scan allocated.

use crate::engine::Engine;
use crate::pool::MemError;
use crate::series::{SeriesClass, SeriesError, SeriesId};
use crate::value::{Cell, CellFlags, SeriesRef, Value, Word};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanError {
    pub line: usize,
    pub column: usize,
    pub message: String,
}

impl std::fmt::Display for ScanError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} at line {}, column {}", self.message, self.line, self.column)
    }
}

/// Scan a whole source string into a fresh (manual) block series.
pub fn scan_source(engine: &mut Engine, source: &str) -> Result<SeriesId, ScanError> {
    let mark = engine.arena.manuals_mark();
    let mut scanner = Scanner::new(source);
    match scanner.scan_block(engine, None) {
        Ok(block) => Ok(block),
        Err(e) => {
            // Partial scans leave manual series behind; reclaim them here.
            engine.arena.manuals_unwind(mark);
            Err(e)
        }
    }
}

/// The scan error message as a string cell, for error-frame arguments.
pub fn scan_error_text(engine: &mut Engine, err: &ScanError) -> Result<Cell, MemError> {
    let id = engine.arena.make(SeriesClass::Bytes, err.message.len())?;
    for ch in err.message.chars() {
        push(engine, id, ch)?;
    }
    engine.arena.manage(id);
    Ok(Cell::new(Value::Str(SeriesRef::head(id))))
}

fn push(engine: &mut Engine, id: SeriesId, ch: char) -> Result<(), MemError> {
    engine.arena.push_char(id, ch).map_err(|e| match e {
        SeriesError::Mem(m) => m,
        other => panic!("scanner series rejected a write: {other:?}"),
    })
}

/// Nesting guard for blocks, parens, and paths.
const MAX_NEST: u32 = 128;

struct Scanner {
    chars: Vec<char>,
    pos: usize,
    line: usize,
    column: usize,
    /// Pending line-start marker for the next value scanned.
    fresh_line: bool,
    nest: u32,
}

impl Scanner {
    fn new(source: &str) -> Scanner {
        Scanner {
            chars: source.chars().collect(),
            pos: 0,
            line: 1,
            column: 1,
            fresh_line: false,
            nest: 0,
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn peek_at(&self, ahead: usize) -> Option<char> {
        self.chars.get(self.pos + ahead).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += 1;
        if c == '\n' {
            self.line += 1;
            self.column = 1;
            self.fresh_line = true;
        } else {
            self.column += 1;
        }
        Some(c)
    }

    fn error(&self, message: impl Into<String>) -> ScanError {
        ScanError { line: self.line, column: self.column, message: message.into() }
    }

    fn skip_blanks(&mut self) {
        loop {
            match self.peek() {
                Some(c) if c.is_whitespace() => {
                    self.bump();
                }
                Some(';') => {
                    while let Some(c) = self.peek() {
                        if c == '\n' {
                            break;
                        }
                        self.bump();
                    }
                }
                _ => break,
            }
        }
    }

    /// Characters that end any token.
    fn is_delimiter(c: char) -> bool {
        c.is_whitespace() || matches!(c, '[' | ']' | '(' | ')' | '{' | '}' | '"' | ';')
    }

    fn is_word_char(c: char) -> bool {
        !Scanner::is_delimiter(c) && !matches!(c, '/' | ':' | '<')
    }

    /// Scan values until `term` (or end of input when none).
    fn scan_block(&mut self, engine: &mut Engine, term: Option<char>) -> Result<SeriesId, ScanError> {
        self.nest += 1;
        if self.nest > MAX_NEST {
            return Err(self.error("nesting too deep"));
        }
        let block = engine
            .arena
            .make(SeriesClass::Cells, 8)
            .map_err(|_| self.error("out of memory"))?;
        loop {
            self.skip_blanks();
            match self.peek() {
                None => {
                    if let Some(t) = term {
                        return Err(self.error(format!("missing closing {t}")));
                    }
                    break;
                }
                Some(c) if Some(c) == term => {
                    self.bump();
                    break;
                }
                Some(']') | Some(')') => {
                    return Err(self.error("unexpected closing bracket"));
                }
                Some(_) => {
                    let line_start = std::mem::take(&mut self.fresh_line);
                    let mut cell = self.scan_value(engine)?;
                    if line_start {
                        cell.flags |= CellFlags::LINE;
                    }
                    engine
                        .arena
                        .push_cell(block, cell)
                        .map_err(|_| self.error("out of memory"))?;
                }
            }
        }
        self.nest -= 1;
        Ok(block)
    }

    fn scan_value(&mut self, engine: &mut Engine) -> Result<Cell, ScanError> {
        let c = self.peek().expect("caller checked for input");
        match c {
            '[' => {
                self.bump();
                let inner = self.scan_block(engine, Some(']'))?;
                Ok(Cell::new(Value::Block(SeriesRef::head(inner))))
            }
            '(' => {
                self.bump();
                let inner = self.scan_block(engine, Some(')'))?;
                Ok(Cell::new(Value::Paren(SeriesRef::head(inner))))
            }
            '"' => self.scan_quoted_string(engine),
            '{' => self.scan_braced_string(engine),
            '#' => self.scan_hash(engine),
            '%' => self.scan_file(engine),
            '$' => self.scan_money(),
            '\'' => {
                self.bump();
                let inner = self.scan_wordish(engine)?;
                Ok(match inner.value {
                    Value::Word(w) => Cell::new(Value::LitWord(w)),
                    Value::Path(r) => Cell::new(Value::LitPath(r)),
                    _ => return Err(self.error("invalid lit-word")),
                })
            }
            ':' => {
                self.bump();
                let inner = self.scan_wordish(engine)?;
                Ok(match inner.value {
                    Value::Word(w) => Cell::new(Value::GetWord(w)),
                    Value::Path(r) => Cell::new(Value::GetPath(r)),
                    _ => return Err(self.error("invalid get-word")),
                })
            }
            '/' => self.scan_slash(engine),
            '<' => self.scan_angle(engine),
            c if c.is_ascii_digit() => self.scan_number(),
            '+' | '-' | '.' if self.peek_at(1).is_some_and(|d| d.is_ascii_digit()) => {
                self.scan_number()
            }
            _ => self.scan_wordish(engine),
        }
    }

    /// A word, set-word, url, email, or a path headed by a word.
    fn scan_wordish(&mut self, engine: &mut Engine) -> Result<Cell, ScanError> {
        let mut token = self.take_word_token()?;

        // `scheme://rest` is a url; the token restarts with the separator.
        if self.peek() == Some(':') && self.peek_at(1) == Some('/') && self.peek_at(2) == Some('/')
        {
            while let Some(c) = self.peek() {
                if Scanner::is_delimiter(c) {
                    break;
                }
                token.push(c);
                self.bump();
            }
            return self.string_kind(engine, &token, |r| Value::Url(r));
        }
        // Emails are recognized by shape.
        if token.contains('@') && !token.starts_with('@') {
            return self.string_kind(engine, &token, |r| Value::Email(r));
        }

        let sym = engine.symbols.intern(&token);
        let head = Word::unbound(sym);
        match self.peek() {
            Some(':') => {
                self.bump();
                Ok(Cell::new(Value::SetWord(head)))
            }
            Some('/') => self.scan_path(engine, Cell::new(Value::Word(head))),
            _ => Ok(Cell::new(Value::Word(head))),
        }
    }

    fn take_word_token(&mut self) -> Result<String, ScanError> {
        let mut token = String::new();
        while let Some(c) = self.peek() {
            if !Scanner::is_word_char(c) {
                break;
            }
            token.push(c);
            self.bump();
        }
        if token.is_empty() {
            return Err(self.error("expected a word"));
        }
        Ok(token)
    }

    fn string_kind(
        &mut self,
        engine: &mut Engine,
        text: &str,
        wrap: fn(SeriesRef) -> Value,
    ) -> Result<Cell, ScanError> {
        let id = engine
            .arena
            .make(SeriesClass::Bytes, text.len())
            .map_err(|_| self.error("out of memory"))?;
        for ch in text.chars() {
            push(engine, id, ch).map_err(|_| self.error("out of memory"))?;
        }
        Ok(Cell::new(wrap(SeriesRef::head(id))))
    }

    /// Continue a path whose head value was just scanned.
    fn scan_path(&mut self, engine: &mut Engine, head: Cell) -> Result<Cell, ScanError> {
        self.nest += 1;
        if self.nest > MAX_NEST {
            return Err(self.error("path too deep"));
        }
        let series = engine
            .arena
            .make(SeriesClass::Cells, 4)
            .map_err(|_| self.error("out of memory"))?;
        engine
            .arena
            .push_cell(series, head)
            .map_err(|_| self.error("out of memory"))?;
        while self.peek() == Some('/') {
            self.bump();
            let seg = match self.peek() {
                Some(c) if c.is_ascii_digit() => self.scan_number()?,
                Some('(') => {
                    self.bump();
                    let inner = self.scan_block(engine, Some(')'))?;
                    Cell::new(Value::Paren(SeriesRef::head(inner)))
                }
                Some(':') => {
                    self.bump();
                    let token = self.take_word_token()?;
                    let sym = engine.symbols.intern(&token);
                    Cell::new(Value::GetWord(Word::unbound(sym)))
                }
                Some(c) if Scanner::is_word_char(c) => {
                    let token = self.take_word_token()?;
                    let sym = engine.symbols.intern(&token);
                    Cell::new(Value::Word(Word::unbound(sym)))
                }
                _ => return Err(self.error("invalid path segment")),
            };
            engine
                .arena
                .push_cell(series, seg)
                .map_err(|_| self.error("out of memory"))?;
        }
        self.nest -= 1;
        if self.peek() == Some(':') {
            self.bump();
            return Ok(Cell::new(Value::SetPath(SeriesRef::head(series))));
        }
        Ok(Cell::new(Value::Path(SeriesRef::head(series))))
    }

    fn scan_quoted_string(&mut self, engine: &mut Engine) -> Result<Cell, ScanError> {
        self.bump(); // opening quote
        let id = engine
            .arena
            .make(SeriesClass::Bytes, 8)
            .map_err(|_| self.error("out of memory"))?;
        loop {
            match self.bump() {
                None => return Err(self.error("unclosed string")),
                Some('"') => break,
                Some('\n') => return Err(self.error("unclosed string")),
                Some('^') => {
                    let ch = self.unescape()?;
                    push(engine, id, ch).map_err(|_| self.error("out of memory"))?;
                }
                Some(c) => push(engine, id, c).map_err(|_| self.error("out of memory"))?,
            }
        }
        Ok(Cell::new(Value::Str(SeriesRef::head(id))))
    }

    /// Braced strings nest and may span lines.
    fn scan_braced_string(&mut self, engine: &mut Engine) -> Result<Cell, ScanError> {
        self.bump(); // opening brace
        let id = engine
            .arena
            .make(SeriesClass::Bytes, 16)
            .map_err(|_| self.error("out of memory"))?;
        let mut depth = 1;
        loop {
            match self.bump() {
                None => return Err(self.error("unclosed braced string")),
                Some('{') => {
                    depth += 1;
                    push(engine, id, '{').map_err(|_| self.error("out of memory"))?;
                }
                Some('}') => {
                    depth -= 1;
                    if depth == 0 {
                        break;
                    }
                    push(engine, id, '}').map_err(|_| self.error("out of memory"))?;
                }
                Some('^') => {
                    let ch = self.unescape()?;
                    push(engine, id, ch).map_err(|_| self.error("out of memory"))?;
                }
                Some(c) => push(engine, id, c).map_err(|_| self.error("out of memory"))?,
            }
        }
        Ok(Cell::new(Value::Str(SeriesRef::head(id))))
    }

    fn unescape(&mut self) -> Result<char, ScanError> {
        match self.bump() {
            None => Err(self.error("dangling escape")),
            Some('/') => Ok('\n'),
            Some('-') => Ok('\t'),
            Some('^') => Ok('^'),
            Some('"') => Ok('"'),
            Some('{') => Ok('{'),
            Some('}') => Ok('}'),
            Some('(') => {
                // ^(hex) codepoint escape.
                let mut hex = String::new();
                loop {
                    match self.bump() {
                        Some(')') => break,
                        Some(c) if c.is_ascii_hexdigit() => hex.push(c),
                        _ => return Err(self.error("bad codepoint escape")),
                    }
                }
                u32::from_str_radix(&hex, 16)
                    .ok()
                    .and_then(char::from_u32)
                    .ok_or_else(|| self.error("bad codepoint escape"))
            }
            Some(c) => Ok(c),
        }
    }

    /// `#"c"` chars, `#{hex}` binaries, `#word` issues.
    fn scan_hash(&mut self, engine: &mut Engine) -> Result<Cell, ScanError> {
        self.bump(); // '#'
        match self.peek() {
            Some('"') => {
                self.bump();
                let ch = match self.bump() {
                    None => return Err(self.error("unclosed char")),
                    Some('^') => self.unescape()?,
                    Some(c) => c,
                };
                if self.bump() != Some('"') {
                    return Err(self.error("unclosed char"));
                }
                Ok(Cell::new(Value::Char(ch)))
            }
            Some('{') => {
                self.bump();
                let id = engine
                    .arena
                    .make(SeriesClass::Bytes, 8)
                    .map_err(|_| self.error("out of memory"))?;
                let mut nibble: Option<u8> = None;
                loop {
                    match self.bump() {
                        None => return Err(self.error("unclosed binary")),
                        Some('}') => break,
                        Some(c) if c.is_whitespace() => {}
                        Some(c) => {
                            let d = c
                                .to_digit(16)
                                .ok_or_else(|| self.error("invalid hex digit"))? as u8;
                            nibble = match nibble {
                                None => Some(d),
                                Some(hi) => {
                                    engine
                                        .arena
                                        .push_byte(id, (hi << 4) | d)
                                        .map_err(|_| self.error("out of memory"))?;
                                    None
                                }
                            };
                        }
                    }
                }
                if nibble.is_some() {
                    return Err(self.error("odd number of hex digits"));
                }
                Ok(Cell::new(Value::Binary(SeriesRef::head(id))))
            }
            _ => {
                let token = self.take_word_token()?;
                let sym = engine.symbols.intern(&token);
                Ok(Cell::new(Value::Issue(Word::unbound(sym))))
            }
        }
    }

    fn scan_file(&mut self, engine: &mut Engine) -> Result<Cell, ScanError> {
        self.bump(); // '%'
        let mut token = String::new();
        while let Some(c) = self.peek() {
            if Scanner::is_delimiter(c) {
                break;
            }
            token.push(c);
            self.bump();
        }
        self.string_kind(engine, &token, |r| Value::File(r))
    }

    fn scan_money(&mut self) -> Result<Cell, ScanError> {
        self.bump(); // '$'
        let token = self.take_number_token();
        let amount: f64 = token.parse().map_err(|_| self.error("invalid money"))?;
        Ok(Cell::new(Value::Money((amount * 1000.0).round() as i64)))
    }

    /// `<` starts a tag when something tag-like follows, a comparison word
    /// otherwise.
    fn scan_angle(&mut self, engine: &mut Engine) -> Result<Cell, ScanError> {
        if matches!(self.peek_at(1), Some(c) if c.is_alphanumeric() || c == '/' || c == '!') {
            self.bump(); // '<'
            let id = engine
                .arena
                .make(SeriesClass::Bytes, 8)
                .map_err(|_| self.error("out of memory"))?;
            loop {
                match self.bump() {
                    None => return Err(self.error("unclosed tag")),
                    Some('>') => break,
                    Some(c) => push(engine, id, c).map_err(|_| self.error("out of memory"))?,
                }
            }
            return Ok(Cell::new(Value::Tag(SeriesRef::head(id))));
        }
        let mut token = String::new();
        while matches!(self.peek(), Some('<') | Some('>') | Some('=')) {
            token.push(self.bump().expect("peeked"));
        }
        let sym = engine.symbols.intern(&token);
        if self.peek() == Some(':') {
            self.bump();
            return Ok(Cell::new(Value::SetWord(Word::unbound(sym))));
        }
        Ok(Cell::new(Value::Word(Word::unbound(sym))))
    }

    /// `/` alone (or `//`) is the division word; `/name` is a refinement.
    fn scan_slash(&mut self, engine: &mut Engine) -> Result<Cell, ScanError> {
        self.bump(); // '/'
        let mut name = String::from("/");
        if self.peek() == Some('/') {
            self.bump();
            name.push('/');
        }
        if matches!(self.peek(), Some(c) if Scanner::is_word_char(c)) && name == "/" {
            let token = self.take_word_token()?;
            let sym = engine.symbols.intern(&token);
            return Ok(Cell::new(Value::Refinement(Word::unbound(sym))));
        }
        let sym = engine.symbols.intern(&name);
        if self.peek() == Some(':') {
            self.bump();
            return Ok(Cell::new(Value::SetWord(Word::unbound(sym))));
        }
        Ok(Cell::new(Value::Word(Word::unbound(sym))))
    }

    fn take_number_token(&mut self) -> String {
        let mut token = String::new();
        if matches!(self.peek(), Some('+') | Some('-')) {
            token.push(self.bump().expect("peeked"));
        }
        while let Some(c) = self.peek() {
            match c {
                '0'..='9' | '.' | 'e' | 'E' | '%' | '\'' => {
                    token.push(c);
                    self.bump();
                }
                // Time and pair separators only bind when a component
                // follows; a trailing `:` belongs to a set-path instead.
                ':' | 'x' | 'X'
                    if self
                        .peek_at(1)
                        .is_some_and(|d| d.is_ascii_digit() || d == '-') =>
                {
                    token.push(c);
                    self.bump();
                }
                '+' | '-' if token.ends_with('e') || token.ends_with('E') => {
                    token.push(c);
                    self.bump();
                }
                _ => break,
            }
        }
        token
    }

    fn scan_number(&mut self) -> Result<Cell, ScanError> {
        let token = self.take_number_token().replace('\'', "");
        if token.contains(':') {
            return self.parse_time(&token);
        }
        if token.to_ascii_lowercase().contains('x') {
            return self.parse_pair(&token);
        }
        if let Some(stripped) = token.strip_suffix('%') {
            let v: f64 = stripped.parse().map_err(|_| self.error("invalid percent"))?;
            return Ok(Cell::new(Value::Percent(v / 100.0)));
        }
        if token.matches('.').count() >= 2 {
            return self.parse_tuple(&token);
        }
        if token.contains('.') || token.to_ascii_lowercase().contains('e') {
            let v: f64 = token.parse().map_err(|_| self.error("invalid decimal"))?;
            return Ok(Cell::new(Value::Decimal(v)));
        }
        let v: i64 = token.parse().map_err(|_| self.error("invalid integer"))?;
        Ok(Cell::new(Value::Integer(v)))
    }

    fn parse_time(&self, token: &str) -> Result<Cell, ScanError> {
        let parts: Vec<&str> = token.split(':').collect();
        if parts.len() < 2 || parts.len() > 3 {
            return Err(self.error("invalid time"));
        }
        let hours: i64 = parts[0].parse().map_err(|_| self.error("invalid time"))?;
        let minutes: i64 = parts[1].parse().map_err(|_| self.error("invalid time"))?;
        let seconds: f64 = if parts.len() == 3 {
            parts[2].parse().map_err(|_| self.error("invalid time"))?
        } else {
            0.0
        };
        let sign = if hours < 0 { -1 } else { 1 };
        let nanos = hours.abs() * 3_600_000_000_000
            + minutes * 60_000_000_000
            + (seconds * 1e9) as i64;
        Ok(Cell::new(Value::Time(sign * nanos)))
    }

    fn parse_pair(&self, token: &str) -> Result<Cell, ScanError> {
        let lower = token.to_ascii_lowercase();
        let (x, y) = lower.split_once('x').ok_or_else(|| self.error("invalid pair"))?;
        let x: i32 = x.parse().map_err(|_| self.error("invalid pair"))?;
        let y: i32 = y.parse().map_err(|_| self.error("invalid pair"))?;
        Ok(Cell::new(Value::Pair(x, y)))
    }

    fn parse_tuple(&self, token: &str) -> Result<Cell, ScanError> {
        let mut parts = Vec::new();
        for p in token.split('.') {
            let n: u8 = p.parse().map_err(|_| self.error("invalid tuple"))?;
            parts.push(n);
        }
        if parts.len() > 7 {
            return Err(self.error("tuple too long"));
        }
        Ok(Cell::new(Value::Tuple(crate::value::Tuple::new(&parts))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{Config, Engine};
    use crate::value::Kind;

    fn scan(src: &str) -> (Engine, SeriesId) {
        let mut e = Engine::new(Config::default());
        let block = scan_source(&mut e, src).expect("scan failed");
        (e, block)
    }

    fn kinds(e: &Engine, block: SeriesId) -> Vec<Kind> {
        e.arena.cells(block).iter().map(|c| c.value.kind()).collect()
    }

    #[test]
    fn test_scan_words_and_decorations() {
        let (e, b) = scan("word word: :word 'word /ref #issue");
        assert_eq!(
            kinds(&e, b),
            vec![
                Kind::Word,
                Kind::SetWord,
                Kind::GetWord,
                Kind::LitWord,
                Kind::Refinement,
                Kind::Issue
            ]
        );
    }

    #[test]
    fn test_scan_numbers() {
        let (e, b) = scan("42 -7 3.14 50% 1x2 1.2.3 10:30 $1.50");
        let cells = e.arena.cells(b);
        assert_eq!(cells[0].value, Value::Integer(42));
        assert_eq!(cells[1].value, Value::Integer(-7));
        assert_eq!(cells[2].value, Value::Decimal(3.14));
        assert_eq!(cells[3].value, Value::Percent(0.5));
        assert_eq!(cells[4].value, Value::Pair(1, 2));
        assert_eq!(cells[5].value.kind(), Kind::Tuple);
        assert_eq!(cells[6].value, Value::Time(37_800_000_000_000));
        assert_eq!(cells[7].value, Value::Money(1500));
    }

    #[test]
    fn test_scan_strings() {
        let (e, b) = scan(r#""hello" {multi {nested} line} #"x" #{DEADBEEF}"#);
        let cells = e.arena.cells(b).to_vec();
        match cells[0].value {
            Value::Str(r) => assert_eq!(e.arena.text(r.series), "hello"),
            other => panic!("expected string, got {other:?}"),
        }
        match cells[1].value {
            Value::Str(r) => assert_eq!(e.arena.text(r.series), "multi {nested} line"),
            other => panic!("expected string, got {other:?}"),
        }
        assert_eq!(cells[2].value, Value::Char('x'));
        match cells[3].value {
            Value::Binary(r) => assert_eq!(e.arena.bytes(r.series), &[0xDE, 0xAD, 0xBE, 0xEF]),
            other => panic!("expected binary, got {other:?}"),
        }
    }

    #[test]
    fn test_scan_string_escapes() {
        let (e, b) = scan(r#""a^/b^-c^^""#);
        match e.arena.cell_at(b, 0).value {
            Value::Str(r) => assert_eq!(e.arena.text(r.series), "a\nb\tc^"),
            other => panic!("expected string, got {other:?}"),
        }
    }

    #[test]
    fn test_scan_nested_blocks_and_parens() {
        let (e, b) = scan("outer [1 [2]] (3)");
        assert_eq!(kinds(&e, b), vec![Kind::Word, Kind::Block, Kind::Paren]);
        match e.arena.cell_at(b, 1).value {
            Value::Block(r) => {
                assert_eq!(kinds(&e, r.series), vec![Kind::Integer, Kind::Block]);
            }
            other => panic!("expected block, got {other:?}"),
        }
    }

    #[test]
    fn test_scan_paths() {
        let (e, b) = scan("a/b a/2: :a/b 'a/b a/(c)");
        assert_eq!(
            kinds(&e, b),
            vec![Kind::Path, Kind::SetPath, Kind::GetPath, Kind::LitPath, Kind::Path]
        );
    }

    #[test]
    fn test_scan_comparison_words_not_tags() {
        let (e, b) = scan("< <= <> > >= <tag> <a href>");
        let names: Vec<String> = e
            .arena
            .cells(b)
            .iter()
            .take(5)
            .map(|c| e.symbols.name(c.value.word_sym().unwrap()).to_string())
            .collect();
        assert_eq!(names, vec!["<", "<=", "<>", ">", ">="]);
        assert_eq!(e.arena.cell_at(b, 5).value.kind(), Kind::Tag);
        assert_eq!(e.arena.cell_at(b, 6).value.kind(), Kind::Tag);
    }

    #[test]
    fn test_scan_slash_words() {
        let (e, b) = scan("/ // /only /: 4");
        assert_eq!(
            kinds(&e, b),
            vec![Kind::Word, Kind::Word, Kind::Refinement, Kind::SetWord, Kind::Integer]
        );
        assert_eq!(e.symbols.name(e.arena.cell_at(b, 0).value.word_sym().unwrap()), "/");
        assert_eq!(e.symbols.name(e.arena.cell_at(b, 1).value.word_sym().unwrap()), "//");
    }

    #[test]
    fn test_scan_files_emails_urls() {
        let (e, b) = scan("%some/file.txt user@host.org http://host/path");
        assert_eq!(kinds(&e, b), vec![Kind::File, Kind::Email, Kind::Url]);
    }

    #[test]
    fn test_comments_and_line_flags() {
        let (e, b) = scan("one ; trailing comment\ntwo three");
        let cells = e.arena.cells(b);
        assert_eq!(cells.len(), 3);
        assert!(!cells[0].flags.contains(CellFlags::LINE));
        assert!(cells[1].flags.contains(CellFlags::LINE));
        assert!(!cells[2].flags.contains(CellFlags::LINE));
    }

    #[test]
    fn test_unbalanced_block_reports_position() {
        let mut e = Engine::new(Config::default());
        let err = scan_source(&mut e, "[1 2").unwrap_err();
        assert!(err.message.contains("missing closing"));
        assert_eq!(err.line, 1);
    }

    #[test]
    fn test_failed_scan_reclaims_series() {
        let mut e = Engine::new(Config::default());
        let live = e.arena.live_count();
        let _ = scan_source(&mut e, "[deep [nested [blocks \"and strings\"").unwrap_err();
        assert_eq!(e.arena.live_count(), live, "partial scan leaked series");
    }
}
