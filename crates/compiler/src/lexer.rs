//! Lexer (spec §4.5): a single pass over a UTF-8 byte buffer producing a
//! lexeme stream with source locations.

use crate::diagnostics::{LexError, Location, Position};
use crate::token::{keyword, Token, TokenKind};

/// Lead bytes of common Latin-1/Windows-1252 "smart" punctuation that
/// shows up in source pasted from word processors. Mapping these to an
/// ASCII suggestion is strictly cosmetic — the byte is still rejected as
/// invalid UTF-8, only the diagnostic gets friendlier.
fn confusable_suggestion(byte: u8) -> Option<char> {
    match byte {
        0x91 | 0x92 => Some('\''),
        0x93 | 0x94 => Some('"'),
        0x96 | 0x97 => Some('-'),
        0x85 => Some('.'),
        _ => None,
    }
}

/// A saved lexer position, for `peek`'s snapshot/restore contract.
#[derive(Debug, Clone, Copy)]
pub struct Checkpoint {
    pos: usize,
    line: u32,
    col: u32,
}

pub struct Lexer<'a> {
    bytes: &'a [u8],
    pos: usize,
    line: u32,
    col: u32,
    previous_location: Location,
    /// When true (the default), `next`/`peek` silently skip `#`-comments;
    /// they are still appended here for the compiler's hot-comment pass
    /// (spec §4.6).
    pub skip_comments: bool,
    comments: Vec<(Location, String)>,
    hot_comments: Vec<(Location, String)>,
}

impl<'a> Lexer<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Lexer {
            bytes,
            pos: 0,
            line: 1,
            col: 1,
            previous_location: Location::default(),
            skip_comments: true,
            comments: Vec::new(),
            hot_comments: Vec::new(),
        }
    }

    pub fn comments(&self) -> &[(Location, String)] {
        &self.comments
    }

    pub fn hot_comments(&self) -> &[(Location, String)] {
        &self.hot_comments
    }

    pub fn previous_location(&self) -> Location {
        self.previous_location
    }

    pub fn checkpoint(&self) -> Checkpoint {
        Checkpoint { pos: self.pos, line: self.line, col: self.col }
    }

    pub fn restore(&mut self, cp: Checkpoint) {
        self.pos = cp.pos;
        self.line = cp.line;
        self.col = cp.col;
    }

    /// Look at the next token without consuming it.
    pub fn peek(&mut self) -> Token {
        let cp = self.checkpoint();
        let tok = self.next();
        self.restore(cp);
        tok
    }

    fn position(&self) -> Position {
        Position { line: self.line, column: self.col }
    }

    /// Decode one UTF-8 scalar at `pos`, reporting the offending lead
    /// byte on failure rather than panicking (Rust's own UTF-8 decoder
    /// aborts the whole buffer; the lexer needs to keep going per-token).
    fn decode_char_at(&self, pos: usize) -> Result<Option<(char, usize)>, u8> {
        let Some(&first) = self.bytes.get(pos) else {
            return Ok(None);
        };
        let width = if first < 0x80 {
            1
        } else if first & 0xE0 == 0xC0 {
            2
        } else if first & 0xF0 == 0xE0 {
            3
        } else if first & 0xF8 == 0xF0 {
            4
        } else {
            return Err(first);
        };
        let slice = self.bytes.get(pos..pos + width).ok_or(first)?;
        match std::str::from_utf8(slice) {
            Ok(s) => Ok(s.chars().next().map(|c| (c, width))),
            Err(_) => Err(first),
        }
    }

    fn bump(&mut self) -> Option<char> {
        match self.decode_char_at(self.pos) {
            Ok(Some((c, width))) => {
                self.pos += width;
                if c == '\n' {
                    self.line += 1;
                    self.col = 1;
                } else {
                    self.col += 1;
                }
                Some(c)
            }
            _ => None,
        }
    }

    fn peek_char(&self) -> Option<char> {
        self.decode_char_at(self.pos).ok().flatten().map(|(c, _)| c)
    }

    fn peek_char_at(&self, offset: usize) -> Option<char> {
        let mut pos = self.pos;
        for _ in 0..offset {
            let (_, w) = self.decode_char_at(pos).ok().flatten()?;
            pos += w;
        }
        self.decode_char_at(pos).ok().flatten().map(|(c, _)| c)
    }

    fn starts_with(&self, s: &str) -> bool {
        self.bytes[self.pos..].starts_with(s.as_bytes())
    }

    fn make(&mut self, start: Position, kind: TokenKind) -> Token {
        let location = Location::span(start, self.position());
        self.previous_location = location;
        Token { kind, location }
    }

    /// Advance past whitespace and `#`-comments, recording each comment.
    fn skip_trivia(&mut self) {
        loop {
            match self.peek_char() {
                Some(c) if c.is_whitespace() => {
                    self.bump();
                }
                Some('#') => {
                    let start = self.position();
                    self.bump();
                    let is_hot = self.peek_char() == Some('!');
                    // Block-comment form: `#<N< ... >N>` reuses the
                    // multi-line string grammar after the `#`.
                    if self.peek_char() == Some('<') {
                        let _ = self.lex_multiline_body();
                        let loc = Location::span(start, self.position());
                        self.comments.push((loc, String::new()));
                        continue;
                    }
                    let mut text = String::new();
                    while let Some(c) = self.peek_char() {
                        if c == '\n' {
                            break;
                        }
                        text.push(c);
                        self.bump();
                    }
                    let loc = Location::span(start, self.position());
                    if is_hot {
                        self.hot_comments.push((loc, text));
                    } else {
                        self.comments.push((loc, text));
                    }
                }
                _ => break,
            }
        }
    }

    /// Parse a `<N<` / `>N>` level marker after the opening/closing
    /// delimiter character has been consumed; returns the parsed level,
    /// or an error if the digits don't form a valid non-negative integer.
    fn lex_level(&mut self) -> Result<u32, LexError> {
        let mut digits = String::new();
        while let Some(c) = self.peek_char() {
            if c.is_ascii_digit() {
                digits.push(c);
                self.bump();
            } else {
                break;
            }
        }
        if digits.is_empty() {
            return Ok(0);
        }
        digits.parse().map_err(|_| LexError::MalformedLevel)
    }

    /// Lex a `<N< ... >N>` multi-line string/comment body, assuming the
    /// opening `<` has not yet been consumed. Returns the raw content.
    fn lex_multiline_body(&mut self) -> Result<String, LexError> {
        if self.peek_char() != Some('<') {
            return Err(LexError::MalformedLevel);
        }
        self.bump(); // '<'
        let open_level = self.lex_level()?;
        if self.peek_char() != Some('<') {
            return Err(LexError::MalformedLevel);
        }
        self.bump(); // second '<'

        let mut content = String::new();
        loop {
            if self.peek_char().is_none() {
                return Err(LexError::UnterminatedString);
            }
            if self.peek_char() == Some('>') {
                let cp = self.checkpoint();
                self.bump();
                let close_level = self.lex_level();
                if self.peek_char() == Some('>') {
                    match close_level {
                        Ok(level) if level == open_level => {
                            self.bump();
                            return Ok(content);
                        }
                        Ok(level) => {
                            self.bump();
                            return Err(LexError::LevelMismatch { opened: open_level, closed: level });
                        }
                        Err(e) => return Err(e),
                    }
                }
                self.restore(cp);
            }
            content.push(self.bump().unwrap());
        }
    }

    fn lex_quoted_string(&mut self, quote: char) -> Result<String, LexError> {
        // Opening 3 quote chars already confirmed by caller; consume them.
        for _ in 0..3 {
            self.bump();
        }
        let mut out = String::new();
        loop {
            match self.peek_char() {
                None => return Err(LexError::UnterminatedString),
                Some('\n') => return Err(LexError::UnterminatedString),
                Some('\\') => {
                    self.bump();
                    self.lex_escape(&mut out)?;
                }
                Some(c) if c == quote && self.starts_with(&quote.to_string().repeat(3)) => {
                    self.bump();
                    self.bump();
                    self.bump();
                    return Ok(out);
                }
                Some(c) => {
                    out.push(c);
                    self.bump();
                }
            }
        }
    }

    fn lex_escape(&mut self, out: &mut String) -> Result<(), LexError> {
        let Some(c) = self.peek_char() else {
            return Err(LexError::UnterminatedString);
        };
        match c {
            'n' => {
                out.push('\n');
                self.bump();
            }
            'r' => {
                out.push('\r');
                self.bump();
            }
            't' => {
                out.push('\t');
                self.bump();
            }
            '\\' => {
                out.push('\\');
                self.bump();
            }
            '\'' => {
                out.push('\'');
                self.bump();
            }
            '"' => {
                out.push('"');
                self.bump();
            }
            '0' => {
                out.push('\0');
                self.bump();
            }
            'a' => {
                out.push('\u{7}');
                self.bump();
            }
            'b' => {
                out.push('\u{8}');
                self.bump();
            }
            'e' => {
                out.push('\u{1b}');
                self.bump();
            }
            'f' => {
                out.push('\u{c}');
                self.bump();
            }
            'v' => {
                out.push('\u{b}');
                self.bump();
            }
            'z' => {
                self.bump();
                while matches!(self.peek_char(), Some(c) if c.is_whitespace()) {
                    self.bump();
                }
            }
            'x' => {
                self.bump();
                let hi = self.bump().ok_or(LexError::MalformedEscape('x'))?;
                let lo = self.bump().ok_or(LexError::MalformedEscape('x'))?;
                let byte = u8::from_str_radix(&format!("{hi}{lo}"), 16)
                    .map_err(|_| LexError::MalformedEscape('x'))?;
                out.push(byte as char);
            }
            'u' => {
                self.bump();
                out.push(self.lex_unicode_escape(4)?);
            }
            'U' => {
                self.bump();
                out.push(self.lex_unicode_escape(8)?);
            }
            other => return Err(LexError::MalformedEscape(other)),
        }
        Ok(())
    }

    fn lex_unicode_escape(&mut self, digits: usize) -> Result<char, LexError> {
        let mut hex = String::new();
        for _ in 0..digits {
            hex.push(self.bump().ok_or(LexError::MalformedEscape('u'))?);
        }
        let cp = u32::from_str_radix(&hex, 16).map_err(|_| LexError::MalformedEscape('u'))?;
        char::from_u32(cp).ok_or(LexError::MalformedEscape('u'))
    }

    fn lex_number(&mut self) -> f64 {
        let mut text = String::new();
        while matches!(self.peek_char(), Some(c) if c.is_ascii_digit() || c == '_') {
            if let Some(c) = self.peek_char() {
                if c != '_' {
                    text.push(c);
                }
            }
            self.bump();
        }
        if self.peek_char() == Some('.') && matches!(self.peek_char_at(1), Some(c) if c.is_ascii_digit()) {
            text.push('.');
            self.bump();
            while matches!(self.peek_char(), Some(c) if c.is_ascii_digit() || c == '_') {
                if let Some(c) = self.peek_char() {
                    if c != '_' {
                        text.push(c);
                    }
                }
                self.bump();
            }
        }
        if matches!(self.peek_char(), Some('e') | Some('E')) {
            let mut exp = String::from("e");
            let cp = self.checkpoint();
            self.bump();
            if matches!(self.peek_char(), Some('+') | Some('-')) {
                exp.push(self.peek_char().unwrap());
                self.bump();
            }
            if matches!(self.peek_char(), Some(c) if c.is_ascii_digit()) {
                while matches!(self.peek_char(), Some(c) if c.is_ascii_digit()) {
                    exp.push(self.peek_char().unwrap());
                    self.bump();
                }
                text.push_str(&exp);
            } else {
                self.restore(cp);
            }
        }
        text.parse().unwrap_or(f64::NAN)
    }

    pub fn next(&mut self) -> Token {
        loop {
            self.skip_trivia();
            let start = self.position();

            if self.pos >= self.bytes.len() {
                return self.make(start, TokenKind::Eof);
            }

            let Some(c) = self.peek_char() else {
                // `pos` is not at the end but didn't decode: an invalid
                // UTF-8 lead byte (spec §4.5's `broken_unicode` lexeme).
                let byte = self.bytes[self.pos];
                self.pos += 1;
                self.col += 1;
                return self.make(
                    start,
                    TokenKind::Broken(LexError::InvalidUtf8 { byte, suggestion: confusable_suggestion(byte) }),
                );
            };

            // Multi-line string: `<N< ... >N>`.
            if c == '<' {
                let cp = self.checkpoint();
                match self.lex_multiline_body() {
                    Ok(content) => return self.make(start, TokenKind::Str(content)),
                    Err(LexError::MalformedLevel) => {
                        // Not actually a multi-line string opener; treat
                        // as the `<`/`<=` operator instead.
                        self.restore(cp);
                    }
                    Err(e) => return self.make(start, TokenKind::Broken(e)),
                }
            }

            if c == '\'' || c == '"' {
                if self.starts_with(&c.to_string().repeat(3)) {
                    return match self.lex_quoted_string(c) {
                        Ok(s) => self.make(start, TokenKind::Str(s)),
                        Err(e) => self.make(start, TokenKind::Broken(e)),
                    };
                }
                return self.make(start, TokenKind::Broken(LexError::UnterminatedString));
            }

            if c.is_ascii_digit() {
                let n = self.lex_number();
                return self.make(start, TokenKind::Number(n));
            }

            if c.is_alphabetic() || c == '_' {
                let mut ident = String::new();
                while matches!(self.peek_char(), Some(c) if c.is_alphanumeric() || c == '_') {
                    ident.push(self.peek_char().unwrap());
                    self.bump();
                }
                let kind = keyword(&ident).unwrap_or(TokenKind::Identifier(ident));
                return self.make(start, kind);
            }

            return self.lex_operator(start, c);
        }
    }

    fn two_char(&mut self, second: char, one: TokenKind, two: TokenKind) -> TokenKind {
        if self.peek_char_at(1) == Some(second) {
            self.bump();
            self.bump();
            two
        } else {
            self.bump();
            one
        }
    }

    fn lex_operator(&mut self, start: Position, c: char) -> Token {
        use TokenKind::*;
        let kind = match c {
            '=' => self.two_char('=', Assign, Eq),
            '!' => {
                if self.peek_char_at(1) == Some('=') {
                    self.bump();
                    self.bump();
                    Ne
                } else {
                    self.bump();
                    return self.make(start, Broken(LexError::UnexpectedChar('!')));
                }
            }
            '<' => self.two_char('=', Lt, Le),
            '>' => self.two_char('=', Gt, Ge),
            '+' => self.two_char('=', Plus, PlusAssign),
            '-' => {
                if self.peek_char_at(1) == Some('>') {
                    self.bump();
                    self.bump();
                    Arrow
                } else {
                    self.two_char('=', Minus, MinusAssign)
                }
            }
            '*' => {
                if self.peek_char_at(1) == Some('*') {
                    self.bump();
                    self.bump();
                    if self.peek_char() == Some('=') {
                        self.bump();
                        CaretAssign
                    } else {
                        Caret
                    }
                } else {
                    self.two_char('=', Star, StarAssign)
                }
            }
            '/' => self.two_char('=', Slash, SlashAssign),
            '%' => self.two_char('=', Percent, PercentAssign),
            ':' => self.two_char(':', Colon, DoubleColon),
            '.' => {
                self.bump();
                Dot
            }
            '(' => {
                self.bump();
                LParen
            }
            ')' => {
                self.bump();
                RParen
            }
            '[' => {
                self.bump();
                LBracket
            }
            ']' => {
                self.bump();
                RBracket
            }
            '{' => {
                self.bump();
                LBrace
            }
            '}' => {
                self.bump();
                RBrace
            }
            ',' => {
                self.bump();
                Comma
            }
            ';' => {
                self.bump();
                Semicolon
            }
            other => {
                self.bump();
                Broken(LexError::UnexpectedChar(other))
            }
        };
        self.make(start, kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(src: &str) -> Vec<TokenKind> {
        let mut lexer = Lexer::new(src.as_bytes());
        let mut out = Vec::new();
        loop {
            let tok = lexer.next();
            let done = tok.kind == TokenKind::Eof;
            out.push(tok.kind);
            if done {
                break;
            }
        }
        out
    }

    #[test]
    fn lexes_keywords_and_identifiers() {
        assert_eq!(
            kinds("if x then end"),
            vec![
                TokenKind::If,
                TokenKind::Identifier("x".into()),
                TokenKind::Then,
                TokenKind::End,
                TokenKind::Eof
            ]
        );
    }

    #[test]
    fn lexes_numbers_with_underscores_and_exponents() {
        assert_eq!(kinds("1_000 3.5 1e3 2.5e-2"), vec![
            TokenKind::Number(1000.0),
            TokenKind::Number(3.5),
            TokenKind::Number(1000.0),
            TokenKind::Number(0.025),
            TokenKind::Eof,
        ]);
    }

    #[test]
    fn lexes_quoted_string_with_escapes() {
        assert_eq!(
            kinds(r#"'''a\nb'''"#),
            vec![TokenKind::Str("a\nb".into()), TokenKind::Eof]
        );
    }

    #[test]
    fn lex_multiline_string_levels_scenario() {
        // Spec §8 scenario 1.
        let mut lexer = Lexer::new("<1< a>2>b >1>".as_bytes());
        let tok = lexer.next();
        assert_eq!(tok.kind, TokenKind::Str(" a>2>b ".into()));
        assert_eq!(tok.location.start.line, 1);
    }

    #[test]
    fn mismatched_multiline_level_is_broken() {
        let mut lexer = Lexer::new("<1< oops >2>".as_bytes());
        let tok = lexer.next();
        assert!(matches!(tok.kind, TokenKind::Broken(LexError::LevelMismatch { opened: 1, closed: 2 })));
    }

    #[test]
    fn comments_are_skipped_but_recorded() {
        let mut lexer = Lexer::new("# hello\nx".as_bytes());
        let tok = lexer.next();
        assert_eq!(tok.kind, TokenKind::Identifier("x".into()));
        assert_eq!(lexer.comments().len(), 1);
    }

    #[test]
    fn hot_comment_is_recorded_separately() {
        let mut lexer = Lexer::new("#!strict\nx".as_bytes());
        let _ = lexer.next();
        assert_eq!(lexer.hot_comments().len(), 1);
        assert_eq!(lexer.comments().len(), 0);
    }

    #[test]
    fn peek_does_not_consume() {
        let mut lexer = Lexer::new("a b".as_bytes());
        let peeked = lexer.peek();
        let next = lexer.next();
        assert_eq!(peeked, next);
    }

    #[test]
    fn invalid_utf8_reports_confusable_suggestion() {
        let bytes: &[u8] = &[b'x', 0x93, b'y']; // 0x93 is a Windows-1252 smart quote
        let mut lexer = Lexer::new(bytes);
        let _ = lexer.next(); // 'x'
        let tok = lexer.next();
        match tok.kind {
            TokenKind::Broken(LexError::InvalidUtf8 { byte, suggestion }) => {
                assert_eq!(byte, 0x93);
                assert_eq!(suggestion, Some('"'));
            }
            other => panic!("expected broken token, got {other:?}"),
        }
    }

    #[test]
    fn unterminated_quoted_string_is_broken() {
        let mut lexer = Lexer::new("'''abc".as_bytes());
        let tok = lexer.next();
        assert_eq!(tok.kind, TokenKind::Broken(LexError::UnterminatedString));
    }
}
