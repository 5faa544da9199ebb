//! Greedy longest-match tokenizer for the target dialect.
//!
//! The lexer is infallible: an unmatched byte becomes an `Unknown` token and
//! scanning continues, so downstream errors can still point at real byte
//! offsets. Whitespace and comments (line and long-bracket form) are
//! skipped.

pub mod token;

pub use token::{Token, TokenKind, is_keyword};

pub struct Lexer<'a> {
    input: &'a [u8],
    pos: usize,
}

/// Multi-byte operators first so maximal munch falls out of scan order.
const OPERATORS: &[&[u8]] = &[
    b"...", b"..", b"==", b"~=", b"<=", b">=", b"<<", b">>", b"//", b"+", b"-", b"*", b"/", b"%",
    b"^", b"#", b"&", b"~", b"|", b"<", b">", b"=",
];

const PUNCTUATION: &[u8] = b"(){}[];:,.";

impl<'a> Lexer<'a> {
    pub fn new(input: &'a [u8]) -> Self {
        Self { input, pos: 0 }
    }

    pub fn next_token(&mut self) -> Token<'a> {
        self.skip_trivia();

        let start = self.pos;
        let Some(byte) = self.peek() else {
            return Token::new(TokenKind::Eof, &self.input[start..start], start);
        };

        if byte == b'"' || byte == b'\'' {
            return self.read_quoted_string(start);
        }
        if byte == b'[' {
            if let Some(level) = self.long_bracket_level(self.pos) {
                return self.read_long_string(start, level);
            }
        }
        if byte.is_ascii_digit()
            || (byte == b'.' && self.peek_at(1).is_some_and(|b| b.is_ascii_digit()))
        {
            return self.read_number(start);
        }
        if byte.is_ascii_alphabetic() || byte == b'_' {
            return self.read_word(start);
        }
        for op in OPERATORS {
            if self.input[self.pos..].starts_with(op) {
                self.pos += op.len();
                return Token::new(TokenKind::Operator, &self.input[start..self.pos], start);
            }
        }
        if PUNCTUATION.contains(&byte) {
            self.pos += 1;
            return Token::new(TokenKind::Punctuation, &self.input[start..self.pos], start);
        }

        self.pos += 1;
        Token::new(TokenKind::Unknown, &self.input[start..self.pos], start)
    }

    fn skip_trivia(&mut self) {
        loop {
            while self.peek().is_some_and(|b| b.is_ascii_whitespace()) {
                self.pos += 1;
            }
            if self.input[self.pos..].starts_with(b"--") {
                self.pos += 2;
                if let Some(level) = self.long_bracket_level(self.pos) {
                    self.skip_long_bracket_body(level);
                } else {
                    while self.peek().is_some_and(|b| b != b'\n') {
                        self.pos += 1;
                    }
                }
                continue;
            }
            break;
        }
    }

    /// Detects `[`, `[=`, `[==`, ... `[` at `at` and returns the level
    /// without consuming anything.
    fn long_bracket_level(&self, at: usize) -> Option<usize> {
        if self.input.get(at) != Some(&b'[') {
            return None;
        }
        let mut level = 0;
        while self.input.get(at + 1 + level) == Some(&b'=') {
            level += 1;
        }
        if self.input.get(at + 1 + level) == Some(&b'[') {
            Some(level)
        } else {
            None
        }
    }

    fn skip_long_bracket_body(&mut self, level: usize) {
        self.pos += level + 2;
        let close = closing_bracket(level);
        while self.pos < self.input.len() {
            if self.input[self.pos..].starts_with(&close) {
                self.pos += close.len();
                return;
            }
            self.pos += 1;
        }
    }

    fn read_quoted_string(&mut self, start: usize) -> Token<'a> {
        let quote = self.input[self.pos];
        self.pos += 1;
        while let Some(byte) = self.peek() {
            if byte == quote {
                self.pos += 1;
                return Token::new(TokenKind::String, &self.input[start..self.pos], start);
            }
            if byte == b'\n' {
                break;
            }
            if byte == b'\\' && self.pos + 1 < self.input.len() {
                self.pos += 2;
            } else {
                self.pos += 1;
            }
        }
        // Unterminated: surface everything scanned so far as Unknown and let
        // the parser reject it with the right offset.
        Token::new(TokenKind::Unknown, &self.input[start..self.pos], start)
    }

    fn read_long_string(&mut self, start: usize, level: usize) -> Token<'a> {
        self.skip_long_bracket_body(level);
        let lexeme = &self.input[start..self.pos];
        let close = closing_bracket(level);
        if lexeme.len() >= (level + 2) * 2 && lexeme.ends_with(&close) {
            Token::new(TokenKind::String, lexeme, start)
        } else {
            Token::new(TokenKind::Unknown, lexeme, start)
        }
    }

    fn read_number(&mut self, start: usize) -> Token<'a> {
        if self.input[self.pos..].starts_with(b"0x") || self.input[self.pos..].starts_with(b"0X") {
            self.pos += 2;
            while self.peek().is_some_and(|b| b.is_ascii_hexdigit()) {
                self.pos += 1;
            }
            return Token::new(TokenKind::Number, &self.input[start..self.pos], start);
        }
        while self.peek().is_some_and(|b| b.is_ascii_digit()) {
            self.pos += 1;
        }
        if self.peek() == Some(b'.') && self.peek_at(1) != Some(b'.') {
            self.pos += 1;
            while self.peek().is_some_and(|b| b.is_ascii_digit()) {
                self.pos += 1;
            }
        }
        if matches!(self.peek(), Some(b'e') | Some(b'E')) {
            let mut ahead = self.pos + 1;
            if matches!(self.input.get(ahead), Some(b'+') | Some(b'-')) {
                ahead += 1;
            }
            if self.input.get(ahead).is_some_and(|b| b.is_ascii_digit()) {
                self.pos = ahead;
                while self.peek().is_some_and(|b| b.is_ascii_digit()) {
                    self.pos += 1;
                }
            }
        }
        Token::new(TokenKind::Number, &self.input[start..self.pos], start)
    }

    fn read_word(&mut self, start: usize) -> Token<'a> {
        while self
            .peek()
            .is_some_and(|b| b.is_ascii_alphanumeric() || b == b'_')
        {
            self.pos += 1;
        }
        let lexeme = &self.input[start..self.pos];
        let kind = if is_keyword(lexeme) {
            TokenKind::Keyword
        } else {
            TokenKind::Identifier
        };
        Token::new(kind, lexeme, start)
    }

    fn peek(&self) -> Option<u8> {
        self.input.get(self.pos).copied()
    }

    fn peek_at(&self, ahead: usize) -> Option<u8> {
        self.input.get(self.pos + ahead).copied()
    }
}

impl<'a> Iterator for Lexer<'a> {
    type Item = Token<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        let token = self.next_token();
        if token.kind == TokenKind::Eof {
            None
        } else {
            Some(token)
        }
    }
}

fn closing_bracket(level: usize) -> Vec<u8> {
    let mut close = vec![b']'];
    close.extend(std::iter::repeat_n(b'=', level));
    close.push(b']');
    close
}

/// Tokenizes the whole input, appending the trailing EOF token.
pub fn tokenize(input: &[u8]) -> Vec<Token<'_>> {
    let mut lexer = Lexer::new(input);
    let mut tokens = Vec::new();
    loop {
        let token = lexer.next_token();
        let done = token.kind == TokenKind::Eof;
        tokens.push(token);
        if done {
            return tokens;
        }
    }
}

/// Decodes a string token's lexeme (quotes or long brackets included) into
/// the byte content. Returns the byte offset of the offending escape within
/// the lexeme on failure.
pub fn decode_string(lexeme: &[u8]) -> Result<Vec<u8>, usize> {
    if lexeme.first() == Some(&b'[') {
        return Ok(decode_long_string(lexeme));
    }
    let inner = &lexeme[1..lexeme.len() - 1];
    let mut out = Vec::with_capacity(inner.len());
    let mut i = 0;
    while i < inner.len() {
        let byte = inner[i];
        if byte != b'\\' {
            out.push(byte);
            i += 1;
            continue;
        }
        let Some(&escape) = inner.get(i + 1) else {
            return Err(i + 1);
        };
        i += 2;
        match escape {
            b'n' => out.push(b'\n'),
            b't' => out.push(b'\t'),
            b'r' => out.push(b'\r'),
            b'a' => out.push(0x07),
            b'b' => out.push(0x08),
            b'f' => out.push(0x0C),
            b'v' => out.push(0x0B),
            b'\\' => out.push(b'\\'),
            b'"' => out.push(b'"'),
            b'\'' => out.push(b'\''),
            b'\n' => out.push(b'\n'),
            b'x' => {
                let hi = inner.get(i).copied().and_then(hex_value);
                let lo = inner.get(i + 1).copied().and_then(hex_value);
                match (hi, lo) {
                    (Some(hi), Some(lo)) => {
                        out.push(hi * 16 + lo);
                        i += 2;
                    }
                    _ => return Err(i),
                }
            }
            b'0'..=b'9' => {
                let mut value: u32 = u32::from(escape - b'0');
                let mut digits = 1;
                while digits < 3 && inner.get(i).is_some_and(|b| b.is_ascii_digit()) {
                    value = value * 10 + u32::from(inner[i] - b'0');
                    i += 1;
                    digits += 1;
                }
                if value > 255 {
                    return Err(i - 1);
                }
                out.push(value as u8);
            }
            _ => return Err(i - 1),
        }
    }
    Ok(out)
}

fn decode_long_string(lexeme: &[u8]) -> Vec<u8> {
    let mut level = 0;
    while lexeme.get(1 + level) == Some(&b'=') {
        level += 1;
    }
    let bracket = level + 2;
    let mut inner = &lexeme[bracket..lexeme.len() - bracket];
    // A newline straight after the opening bracket is not part of the
    // content.
    if inner.starts_with(b"\r\n") {
        inner = &inner[2..];
    } else if inner.first() == Some(&b'\n') {
        inner = &inner[1..];
    }
    inner.to_vec()
}

fn hex_value(byte: u8) -> Option<u8> {
    match byte {
        b'0'..=b'9' => Some(byte - b'0'),
        b'a'..=b'f' => Some(byte - b'a' + 10),
        b'A'..=b'F' => Some(byte - b'A' + 10),
        _ => None,
    }
}
